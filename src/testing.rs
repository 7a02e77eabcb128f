// ============================================
// testing.rs - Fakes and fixtures for unit tests
// ============================================
//
// Every fake appends a short description of each call to a shared CallLog
// so tests can assert on ordering across collaborators.
// ============================================

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Result};

use crate::config::{ActiveUser, SystemInfo, ToolkitConfig};
use crate::defer::{DeferHistoryStore, RegValue};
use crate::platform::{Collaborators, DriveSubst, MsiTables, SystemProbe, WimMounter};
use crate::types::{Architecture, OsVersion, ProcessDefinition};

pub(crate) const TOOLKIT_TOML: &str = r#"
[Toolkit]
RegPath = 'HKLM\SOFTWARE'
CompressLogs = false
LogPath = 'C:\Windows\Logs\Software'
LogToSubfolder = false
LogToHierarchy = false
LogMaxHierarchy = 3
LogAppend = true
LogMaxSize = 10
LogMaxHistory = 10
LogStyle = "CMTrace"
LogWriteToHost = false
LogHostOutputToStdStreams = false
LogDebugMessage = false
OobeDetection = true

[UI]
DefaultExitCode = 1618
DeferExitCode = 1602
"#;

pub(crate) fn toolkit_config() -> ToolkitConfig {
    ToolkitConfig::from_toml_str(TOOLKIT_TOML).unwrap()
}

pub(crate) fn system_info() -> SystemInfo {
    SystemInfo {
        toolkit_name: "PSAppDeployToolkit".into(),
        toolkit_version: "4.1.0".into(),
        computer_name: "WKS01.contoso.com".into(),
        user_name: "jane".into(),
        process_account: "NT AUTHORITY\\SYSTEM".into(),
        os_name: "Microsoft Windows 11 Enterprise".into(),
        os_version: OsVersion::new(10, 0, 22631, 0),
        os_architecture: Architecture::X64,
        process_architecture: Architecture::X64,
        os_product_type: "Workstation".into(),
        hardware_type: "Virtual".into(),
        is_admin: true,
        is_process_user_interactive: false,
        session_zero: true,
        users_logged_on: vec!["CONTOSO\\jane".into()],
        logged_on_user_sessions_text: "jane  console  2  Active".into(),
        current_logged_on_user_session: None,
        console_user: Some("CONTOSO\\jane".into()),
        run_as_active_user: Some(ActiveUser {
            account: "CONTOSO\\jane".into(),
            sid: "S-1-5-21-1000".into(),
            session_id: 2,
        }),
        culture: "en-US".into(),
        current_language: "EN".into(),
        ui_language: "en-US".into(),
        host_name: "ConsoleHost".into(),
        host_version: "5.1.22621.2506".into(),
        running_task_sequence: false,
        temp_dir: std::env::temp_dir(),
    }
}

/// Ordered record of collaborator calls.
pub(crate) type CallLog = Rc<RefCell<Vec<String>>>;

pub(crate) fn call_log() -> CallLog {
    Rc::new(RefCell::new(Vec::new()))
}

fn record(calls: &CallLog, entry: String) {
    calls.borrow_mut().push(entry);
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

// ============================================
// WIM / SUBST
// ============================================

/// Mounting creates the destination folder; files listed in `contents`
/// are written into it.
#[derive(Default)]
pub(crate) struct FakeWim {
    pub calls: CallLog,
    pub contents: Vec<String>,
    pub fail_dismount: bool,
}

impl WimMounter for FakeWim {
    fn mount(&self, image: &Path, dest: &Path, index: u32) -> Result<()> {
        record(&self.calls, format!("mount {} {}", file_name(image), index));
        fs::create_dir_all(dest)?;
        for name in &self.contents {
            fs::write(dest.join(name), b"payload")?;
        }
        Ok(())
    }

    fn dismount(&self, image: &Path) -> Result<()> {
        record(&self.calls, format!("dismount {}", file_name(image)));
        if self.fail_dismount {
            bail!("DISM failed for {}", image.display());
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeSubst {
    pub calls: CallLog,
    pub used: Vec<char>,
}

impl DriveSubst for FakeSubst {
    fn create(&self, letter: char, path: &Path) -> Result<()> {
        record(&self.calls, format!("subst {}: {}", letter, file_name(path)));
        Ok(())
    }

    fn delete(&self, letter: char) -> Result<()> {
        record(&self.calls, format!("unsubst {}:", letter));
        Ok(())
    }

    fn used_letters(&self) -> Result<Vec<char>> {
        Ok(self.used.clone())
    }
}

// ============================================
// MSI
// ============================================

/// Serves the same tables for every MSI.
#[derive(Default)]
pub(crate) struct FakeMsi {
    pub calls: CallLog,
    pub tables: BTreeMap<String, BTreeMap<String, String>>,
}

impl FakeMsi {
    pub fn with_table(mut self, table: &str, rows: &[(&str, &str)]) -> Self {
        self.tables.insert(
            table.to_string(),
            rows.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        );
        self
    }
}

impl MsiTables for FakeMsi {
    fn query(&self, msi: &Path, mst: Option<&Path>, table: &str) -> Result<BTreeMap<String, String>> {
        let mst = mst.map(file_name).unwrap_or_else(|| "-".into());
        record(&self.calls, format!("msi {} {} {}", file_name(msi), mst, table));
        Ok(self.tables.get(table).cloned().unwrap_or_default())
    }
}

// ============================================
// SYSTEM PROBE
// ============================================

pub(crate) struct FakeProbe {
    pub calls: CallLog,
    pub oobe_complete: bool,
    pub wwahost_sessions: Vec<u32>,
    pub first_sync: Option<bool>,
    pub running: Vec<String>,
    pub terminal_server: bool,
    pub fail_queries: bool,
}

impl Default for FakeProbe {
    fn default() -> Self {
        FakeProbe {
            calls: call_log(),
            oobe_complete: true,
            wwahost_sessions: Vec::new(),
            first_sync: None,
            running: Vec::new(),
            terminal_server: false,
            fail_queries: false,
        }
    }
}

impl FakeProbe {
    fn check(&self, what: &str) -> Result<()> {
        if self.fail_queries {
            bail!("{} query failed", what);
        }
        Ok(())
    }
}

impl SystemProbe for FakeProbe {
    fn is_oobe_complete(&self) -> Result<bool> {
        self.check("OOBE")?;
        Ok(self.oobe_complete)
    }

    fn process_session_ids(&self, _name: &str) -> Result<Vec<u32>> {
        self.check("process")?;
        Ok(self.wwahost_sessions.clone())
    }

    fn first_sync_done(&self, _sid: &str) -> Result<Option<bool>> {
        self.check("FirstSync")?;
        Ok(self.first_sync)
    }

    fn running_processes(&self, processes: &[ProcessDefinition]) -> Result<Vec<String>> {
        self.check("process")?;
        Ok(self
            .running
            .iter()
            .filter(|r| processes.is_empty() || processes.iter().any(|p| p.name.eq_ignore_ascii_case(r)))
            .cloned()
            .collect())
    }

    fn is_terminal_server(&self) -> Result<bool> {
        self.check("terminal server")?;
        Ok(self.terminal_server)
    }

    fn set_terminal_server_install_mode(&self, install: bool) -> Result<()> {
        record(&self.calls, format!("terminal server install mode {}", install));
        Ok(())
    }
}

// ============================================
// DEFER STORE
// ============================================

/// In-memory registry. Clones share the same data so a test can keep a
/// handle after moving the store into a session.
#[derive(Clone, Default)]
pub(crate) struct MemoryDeferStore {
    pub keys: Rc<RefCell<BTreeMap<String, BTreeMap<String, RegValue>>>>,
}

impl DeferHistoryStore for MemoryDeferStore {
    fn key_exists(&self, key: &str) -> Result<bool> {
        Ok(self.keys.borrow().contains_key(key))
    }

    fn create_key(&self, key: &str) -> Result<()> {
        self.keys.borrow_mut().entry(key.to_string()).or_default();
        Ok(())
    }

    fn get_values(&self, key: &str) -> Result<BTreeMap<String, RegValue>> {
        Ok(self.keys.borrow().get(key).cloned().unwrap_or_default())
    }

    fn set_value(&self, key: &str, name: &str, value: RegValue) -> Result<()> {
        match self.keys.borrow_mut().get_mut(key) {
            Some(values) => {
                values.insert(name.to_string(), value);
                Ok(())
            }
            None => bail!("key {} does not exist", key),
        }
    }

    fn remove_key(&self, key: &str) -> Result<()> {
        self.keys.borrow_mut().remove(key);
        Ok(())
    }
}

// ============================================
// SESSION FIXTURES
// ============================================

/// Collaborators with default fakes that all share one call log.
pub(crate) fn collaborators(calls: &CallLog, store: &MemoryDeferStore) -> Collaborators {
    Collaborators {
        wim: Box::new(FakeWim {
            calls: calls.clone(),
            ..FakeWim::default()
        }),
        subst: Box::new(FakeSubst {
            calls: calls.clone(),
            used: vec!['C'],
        }),
        msi: Box::new(FakeMsi {
            calls: calls.clone(),
            ..FakeMsi::default()
        }),
        probe: Box::new(FakeProbe {
            calls: calls.clone(),
            ..FakeProbe::default()
        }),
        defer_store: Box::new(store.clone()),
    }
}

/// A toolkit config whose log and temp folders live under `root`.
pub(crate) fn config_in(root: &Path) -> ToolkitConfig {
    let mut config = toolkit_config();
    config.toolkit.log_path = root.join("Logs");
    config
}

/// A system snapshot whose temp folder lives under `root`.
pub(crate) fn system_in(root: &Path) -> SystemInfo {
    let mut system = system_info();
    system.temp_dir = root.join("Temp");
    system
}

pub(crate) fn files_dir(root: &Path, names: &[&str]) -> PathBuf {
    let dir = root.join("Files");
    fs::create_dir_all(&dir).unwrap();
    for name in names {
        fs::write(dir.join(name), b"payload").unwrap();
    }
    dir
}
