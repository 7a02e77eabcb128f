// ============================================
// config.rs - Toolkit configuration and environment snapshot
// ============================================
//
// Three inputs feed a deployment session:
// 1. ToolkitConfig   - config.toml, [Toolkit] and [UI] tables
// 2. SystemInfo      - read-only snapshot of the machine (JSON, or detected)
// 3. SessionParameters - what the caller asked for (JSON)
//
// ToolkitConfig and SystemInfo are bundled into an EnvironmentContext that
// is created once per process and passed to each session by reference.
// All keys are required and checked when the files are loaded, so a bad
// config fails before a session ever starts.
// ============================================

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogStyle;
use crate::types::{Architecture, DeployMode, DeploymentType, OsVersion, ProcessDefinition};

// ============================================
// TOOLKIT CONFIG
// ============================================

/// Toolkit configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolkitConfig {
    #[serde(rename = "Toolkit")]
    pub toolkit: ToolkitSection,

    #[serde(rename = "UI")]
    pub ui: UiSection,
}

/// The `[Toolkit]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ToolkitSection {
    /// Registry root for toolkit data (deferral history lives below it)
    pub reg_path: String,
    /// Zip the session's log folder when the session closes
    pub compress_logs: bool,
    /// Folder for log files (and compressed log archives)
    pub log_path: PathBuf,
    /// Put each installation's logs in a subfolder named after it
    pub log_to_subfolder: bool,
    /// Put logs under Vendor/Name/Version
    pub log_to_hierarchy: bool,
    /// How many sibling hierarchy folders to keep
    pub log_max_hierarchy: u32,
    /// Append to an existing log file instead of rotating it
    pub log_append: bool,
    /// Rotate the log file when it grows past this many MiB (0 = never)
    pub log_max_size: u32,
    /// How many rotated logs / archives to keep
    pub log_max_history: u32,
    pub log_style: LogStyle,
    /// Echo log lines to the host
    pub log_write_to_host: bool,
    /// Write host output straight to stdout/stderr instead of the host stream
    pub log_host_output_to_std_streams: bool,
    /// Record debug-flagged messages
    pub log_debug_message: bool,
    /// Switch to silent mode while the device is still in OOBE / ESP
    pub oobe_detection: bool,
}

/// The `[UI]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UiSection {
    /// Exit code used when the deployment ends without a user decision (e.g. timeout)
    pub default_exit_code: i32,
    /// Exit code used when the user defers the deployment
    pub defer_exit_code: i32,
    #[serde(default)]
    pub language_override: Option<String>,
}

impl ToolkitConfig {
    /// Parse and validate a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ToolkitConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate `config.toml` from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check the values serde can't check on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.toolkit.reg_path.trim().is_empty() {
            return Err(invalid("RegPath", "must not be empty"));
        }
        if self.toolkit.log_path.as_os_str().is_empty() {
            return Err(invalid("LogPath", "must not be empty"));
        }
        if self.toolkit.log_max_history == 0 {
            return Err(invalid("LogMaxHistory", "must be at least 1"));
        }
        if self.toolkit.log_max_hierarchy == 0 {
            return Err(invalid("LogMaxHierarchy", "must be at least 1"));
        }
        if self.ui.default_exit_code == 0 {
            return Err(invalid("DefaultExitCode", "must not be 0 (0 means success)"));
        }
        if self.ui.defer_exit_code == 0 {
            return Err(invalid("DeferExitCode", "must not be 0 (0 means success)"));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        message: message.to_string(),
    }
}

// ============================================
// SYSTEM INFO
// ============================================

/// The user that will receive UI when running as SYSTEM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveUser {
    /// DOMAIN\user
    pub account: String,
    pub sid: String,
    pub session_id: u32,
}

/// Read-only snapshot of the machine the deployment runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub toolkit_name: String,
    pub toolkit_version: String,
    pub computer_name: String,
    /// Bare user name, used in log file names for non-admin runs
    pub user_name: String,
    /// DOMAIN\user of the current process
    pub process_account: String,
    pub os_name: String,
    pub os_version: OsVersion,
    pub os_architecture: Architecture,
    pub process_architecture: Architecture,
    pub os_product_type: String,
    pub hardware_type: String,
    pub is_admin: bool,
    pub is_process_user_interactive: bool,
    /// Running in session 0 (services, no desktop)
    pub session_zero: bool,
    #[serde(default)]
    pub users_logged_on: Vec<String>,
    #[serde(default)]
    pub logged_on_user_sessions_text: String,
    /// The logged on user session the current process belongs to, if any
    #[serde(default)]
    pub current_logged_on_user_session: Option<String>,
    #[serde(default)]
    pub console_user: Option<String>,
    #[serde(default)]
    pub run_as_active_user: Option<ActiveUser>,
    pub culture: String,
    pub current_language: String,
    pub ui_language: String,
    pub host_name: String,
    pub host_version: String,
    pub running_task_sequence: bool,
    pub temp_dir: PathBuf,
}

impl SystemInfo {
    /// Parse a snapshot from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }
}

// ============================================
// ENVIRONMENT CONTEXT
// ============================================

/// Process-wide inputs shared by every session, plus the last exit code
/// reported by a closed session.
#[derive(Debug)]
pub struct EnvironmentContext {
    pub system: SystemInfo,
    pub config: ToolkitConfig,
    last_exit_code: Cell<i32>,
}

impl EnvironmentContext {
    pub fn new(system: SystemInfo, config: ToolkitConfig) -> Self {
        EnvironmentContext {
            system,
            config,
            last_exit_code: Cell::new(0),
        }
    }

    pub fn last_exit_code(&self) -> i32 {
        self.last_exit_code.get()
    }

    pub fn set_last_exit_code(&self, code: i32) {
        self.last_exit_code.set(code);
    }
}

// ============================================
// SESSION PARAMETERS
// ============================================

/// Everything a caller can pass when opening a session.
/// Blank strings are treated the same as missing values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SessionParameters {
    pub deployment_type: DeploymentType,
    pub deploy_mode: DeployMode,
    pub suppress_reboot_pass_thru: bool,
    pub terminal_server_mode: bool,
    pub disable_logging: bool,
    pub no_exit_on_close: bool,

    pub app_vendor: Option<String>,
    pub app_name: Option<String>,
    pub app_version: Option<String>,
    pub app_arch: Option<String>,
    pub app_lang: Option<String>,
    pub app_revision: Option<String>,
    pub app_script_version: Option<String>,
    pub app_script_date: Option<NaiveDate>,
    pub app_script_author: Option<String>,
    pub app_success_exit_codes: Vec<i32>,
    pub app_reboot_exit_codes: Vec<i32>,
    pub app_processes_to_close: Vec<ProcessDefinition>,
    pub require_admin: bool,

    pub install_name: Option<String>,
    pub install_title: Option<String>,

    pub deploy_app_script_friendly_name: Option<String>,
    pub deploy_app_script_version: Option<String>,
    pub deploy_app_script_parameters: BTreeMap<String, String>,

    pub script_directory: Vec<PathBuf>,
    pub dir_files: Option<PathBuf>,
    pub dir_support_files: Option<PathBuf>,
    pub default_msi_file: Option<PathBuf>,
    pub default_mst_file: Option<PathBuf>,
    pub default_msp_files: Vec<PathBuf>,

    pub disable_default_msi_process_list: bool,
    pub force_msi_detection: bool,
    pub force_wim_detection: bool,
    pub no_session_detection: bool,
    pub no_oobe_detection: bool,
    /// `Some(true)` disables process detection, `Some(false)` forces it
    /// even when no processes were named
    pub no_process_detection: Option<bool>,
    pub allow_wow_process: bool,

    pub log_name: Option<String>,
}

impl Default for SessionParameters {
    fn default() -> Self {
        SessionParameters {
            deployment_type: DeploymentType::Install,
            deploy_mode: DeployMode::Auto,
            suppress_reboot_pass_thru: false,
            terminal_server_mode: false,
            disable_logging: false,
            no_exit_on_close: false,
            app_vendor: None,
            app_name: None,
            app_version: None,
            app_arch: None,
            app_lang: None,
            app_revision: None,
            app_script_version: None,
            app_script_date: None,
            app_script_author: None,
            app_success_exit_codes: vec![0],
            app_reboot_exit_codes: vec![1641, 3010],
            app_processes_to_close: Vec::new(),
            require_admin: false,
            install_name: None,
            install_title: None,
            deploy_app_script_friendly_name: None,
            deploy_app_script_version: None,
            deploy_app_script_parameters: BTreeMap::new(),
            script_directory: Vec::new(),
            dir_files: None,
            dir_support_files: None,
            default_msi_file: None,
            default_mst_file: None,
            default_msp_files: Vec::new(),
            disable_default_msi_process_list: false,
            force_msi_detection: false,
            force_wim_detection: false,
            no_session_detection: false,
            no_oobe_detection: false,
            no_process_detection: None,
            allow_wow_process: false,
            log_name: None,
        }
    }
}

impl SessionParameters {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }
}

/// Returns the trimmed value when it has any non-whitespace content.
pub(crate) fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
