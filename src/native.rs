// ============================================
// native.rs - Windows implementations of the collaborator traits
// ============================================
//
// - DismWimMounter      dism /Mount-Wim, /Unmount-Wim
// - DosDeviceSubst      DefineDosDeviceW / GetLogicalDrives
// - WindowsInstallerMsi WindowsInstaller.Installer COM via PowerShell
// - NativeProbe         OOBEComplete, Get-Process, Enrollments\FirstSync, change user
// - RegistryDeferStore  reg.exe
//
// Everything shells out except subst, which goes straight to kernel32.
// ============================================

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::config::SystemInfo;
use crate::defer::{DeferHistoryStore, RegValue};
use crate::platform::{Collaborators, DriveSubst, MsiTables, SystemProbe, WimMounter};
use crate::types::ProcessDefinition;

/// Keep console windows from flashing up for every helper process.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// The real collaborators for the current machine.
pub fn native_collaborators() -> Collaborators {
    Collaborators {
        wim: Box::new(DismWimMounter::default()),
        subst: Box::new(DosDeviceSubst),
        msi: Box::new(WindowsInstallerMsi),
        probe: Box::new(NativeProbe),
        defer_store: Box::new(RegistryDeferStore),
    }
}

fn command(program: &str) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Run a command and return its stdout, failing on a non-zero exit.
fn run(cmd: &mut Command, what: &str) -> Result<String> {
    let output = cmd.output().with_context(|| format!("Failed to run {}", what))?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} failed ({}):\n{}\n{}", what, output.status, stdout.trim(), stderr.trim());
    }
    Ok(stdout)
}

fn powershell(script: &str, what: &str) -> Result<String> {
    run(
        command("powershell").args([
            "-ExecutionPolicy",
            "Bypass",
            "-NoProfile",
            "-NonInteractive",
            "-Command",
            script,
        ]),
        what,
    )
}

/// Quote a value as a PowerShell single-quoted string literal.
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// ============================================
// WIM
// ============================================

/// Mounts WIM images read-only with DISM. Mount points are remembered so
/// dismount can find them again; anything mounted by another process is
/// looked up with `dism /Get-MountedWimInfo`.
#[derive(Default)]
pub struct DismWimMounter {
    mounts: RefCell<BTreeMap<PathBuf, PathBuf>>,
}

impl WimMounter for DismWimMounter {
    fn mount(&self, image: &Path, dest: &Path, index: u32) -> Result<()> {
        fs::create_dir_all(dest).with_context(|| format!("Failed to create mount directory {}", dest.display()))?;
        tracing::info!("Mounting WIM: {} to {}", image.display(), dest.display());
        run(
            command("dism")
                .arg("/Mount-Wim")
                .arg(format!("/WimFile:{}", image.display()))
                .arg(format!("/Index:{}", index))
                .arg(format!("/MountDir:{}", dest.display()))
                .arg("/ReadOnly"),
            "DISM mount",
        )?;
        self.mounts.borrow_mut().insert(image.to_path_buf(), dest.to_path_buf());
        Ok(())
    }

    fn dismount(&self, image: &Path) -> Result<()> {
        let remembered = self.mounts.borrow_mut().remove(image);
        let mount_dir = match remembered {
            Some(dir) => dir,
            None => {
                let info = run(command("dism").arg("/Get-MountedWimInfo"), "DISM mount query")?;
                match parse_mounted_wim_info(&info, image) {
                    Some(dir) => dir,
                    None => bail!("{} is not mounted", image.display()),
                }
            }
        };

        tracing::info!("Dismounting WIM: {}", mount_dir.display());
        run(
            command("dism")
                .arg("/Unmount-Wim")
                .arg(format!("/MountDir:{}", mount_dir.display()))
                .arg("/Discard"),
            "DISM unmount",
        )?;
        if let Err(e) = fs::remove_dir(&mount_dir) {
            tracing::debug!("Leaving mount directory {}: {}", mount_dir.display(), e);
        }
        Ok(())
    }
}

/// Find the mount directory for `image` in `dism /Get-MountedWimInfo` output.
fn parse_mounted_wim_info(output: &str, image: &Path) -> Option<PathBuf> {
    let wanted = image.display().to_string().to_lowercase();
    let mut mount_dir: Option<String> = None;
    for line in output.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match label.trim() {
            "Mount Dir" => mount_dir = Some(value.to_string()),
            "Image File" if value.to_lowercase() == wanted => return mount_dir.map(PathBuf::from),
            _ => {}
        }
    }
    None
}

// ============================================
// SUBST
// ============================================

/// Drive substitution through DOS device definitions.
pub struct DosDeviceSubst;

#[cfg(windows)]
fn wide(value: &std::ffi::OsStr) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;
    value.encode_wide().chain(std::iter::once(0)).collect()
}

#[cfg(windows)]
impl DriveSubst for DosDeviceSubst {
    fn create(&self, letter: char, path: &Path) -> Result<()> {
        use winapi::um::fileapi::DefineDosDeviceW;

        let device = wide(format!("{}:", letter).as_ref());
        let target = wide(path.as_os_str());
        let ok = unsafe { DefineDosDeviceW(0, device.as_ptr(), target.as_ptr()) };
        if ok == 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("Failed to map {}: to {}", letter, path.display()));
        }
        Ok(())
    }

    fn delete(&self, letter: char) -> Result<()> {
        use winapi::um::fileapi::DefineDosDeviceW;
        use winapi::um::winbase::DDD_REMOVE_DEFINITION;

        let device = wide(format!("{}:", letter).as_ref());
        let ok = unsafe { DefineDosDeviceW(DDD_REMOVE_DEFINITION, device.as_ptr(), std::ptr::null()) };
        if ok == 0 {
            return Err(std::io::Error::last_os_error()).with_context(|| format!("Failed to remove {}:", letter));
        }
        Ok(())
    }

    fn used_letters(&self) -> Result<Vec<char>> {
        let mask = unsafe { winapi::um::fileapi::GetLogicalDrives() };
        if mask == 0 {
            return Err(std::io::Error::last_os_error()).context("Failed to list logical drives");
        }
        Ok(letters_from_mask(mask))
    }
}

#[cfg(not(windows))]
impl DriveSubst for DosDeviceSubst {
    fn create(&self, letter: char, _path: &Path) -> Result<()> {
        bail!("Drive substitution ({}:) is only supported on Windows", letter)
    }

    fn delete(&self, letter: char) -> Result<()> {
        bail!("Drive substitution ({}:) is only supported on Windows", letter)
    }

    fn used_letters(&self) -> Result<Vec<char>> {
        bail!("Drive letters are only available on Windows")
    }
}

/// Bit 0 is A:, bit 25 is Z:.
#[cfg_attr(not(windows), allow(dead_code))]
fn letters_from_mask(mask: u32) -> Vec<char> {
    (0..26u8)
        .filter(|bit| mask & (1 << bit) != 0)
        .map(|bit| (b'A' + bit) as char)
        .collect()
}

// ============================================
// MSI
// ============================================

/// Reads MSI tables through the WindowsInstaller COM object.
pub struct WindowsInstallerMsi;

const MSI_QUERY_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$installer = New-Object -ComObject WindowsInstaller.Installer
$invoke = { param($target, $name, $kind, $arguments) $target.GetType().InvokeMember($name, $kind, $null, $target, $arguments) }
$db = & $invoke $installer 'OpenDatabase' 'InvokeMethod' @(__MSI__, 0)
if (__MST__) { [void](& $invoke $db 'ApplyTransform' 'InvokeMethod' @(__MST__, 63)) }
$view = & $invoke $db 'OpenView' 'InvokeMethod' @(__QUERY__)
[void](& $invoke $view 'Execute' 'InvokeMethod' $null)
$rows = [ordered]@{}
while ($record = & $invoke $view 'Fetch' 'InvokeMethod' $null) {
    $rows[(& $invoke $record 'StringData' 'GetProperty' @(1))] = (& $invoke $record 'StringData' 'GetProperty' @(2))
}
[void](& $invoke $view 'Close' 'InvokeMethod' $null)
$rows | ConvertTo-Json -Compress
"#;

impl MsiTables for WindowsInstallerMsi {
    fn query(&self, msi: &Path, mst: Option<&Path>, table: &str) -> Result<BTreeMap<String, String>> {
        let query = match table {
            "Property" => "SELECT `Property`, `Value` FROM `Property`",
            "File" => "SELECT `File`, `FileName` FROM `File`",
            other => bail!("Unsupported MSI table [{}]", other),
        };
        let mst = mst.map(|p| p.display().to_string()).unwrap_or_default();
        let script = MSI_QUERY_SCRIPT
            .replace("__MSI__", &ps_quote(&msi.display().to_string()))
            .replace("__MST__", &ps_quote(&mst))
            .replace("__QUERY__", &ps_quote(query));
        let output = powershell(&script, "MSI table query")?;
        parse_table_json(&output).with_context(|| format!("Failed to read the {} table of {}", table, msi.display()))
    }
}

fn parse_table_json(output: &str) -> Result<BTreeMap<String, String>> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_str(output)?)
}

// ============================================
// SYSTEM PROBE
// ============================================

/// Live queries against the running system.
pub struct NativeProbe;

const OOBE_SCRIPT: &str = r#"
Add-Type -Namespace Native -Name Kernel32 -MemberDefinition '[DllImport("kernel32.dll", SetLastError = true)] public static extern bool OOBEComplete(out int isOOBEComplete);'
$complete = 0
if (-not [Native.Kernel32]::OOBEComplete([ref]$complete)) { throw "OOBEComplete failed" }
Write-Output "OOBE_COMPLETE:$complete"
"#;

const FIRST_SYNC_SCRIPT: &str = r#"
$entry = Get-ItemProperty -Path "Registry::HKEY_LOCAL_MACHINE\SOFTWARE\Microsoft\Enrollments\*\FirstSync\__SID__" -ErrorAction SilentlyContinue | Select-Object -First 1
if ($null -ne $entry) {
    $done = $entry.IsSyncDone
    if ($null -eq $done) { $done = 0 }
    Write-Output "FIRST_SYNC:$done"
}
"#;

impl SystemProbe for NativeProbe {
    fn is_oobe_complete(&self) -> Result<bool> {
        let output = powershell(OOBE_SCRIPT, "OOBE query")?;
        match labeled_value(&output, "OOBE_COMPLETE:") {
            Some(value) => Ok(value != "0"),
            None => bail!("Unexpected OOBE query output: {}", output.trim()),
        }
    }

    fn process_session_ids(&self, name: &str) -> Result<Vec<u32>> {
        let script = format!(
            "Get-Process -Name {} -ErrorAction SilentlyContinue | ForEach-Object {{ $_.SessionId }}",
            ps_quote(name)
        );
        let output = powershell(&script, "process query")?;
        Ok(output.lines().filter_map(|line| line.trim().parse().ok()).collect())
    }

    fn first_sync_done(&self, sid: &str) -> Result<Option<bool>> {
        let script = FIRST_SYNC_SCRIPT.replace("__SID__", &sid.replace('\'', ""));
        let output = powershell(&script, "FirstSync query")?;
        Ok(parse_first_sync(&output))
    }

    fn running_processes(&self, processes: &[ProcessDefinition]) -> Result<Vec<String>> {
        let output = powershell(
            "Get-Process | ForEach-Object { $_.ProcessName }",
            "process query",
        )?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|name| processes.iter().any(|p| p.name.eq_ignore_ascii_case(name)))
            .map(str::to_string)
            .collect())
    }

    fn is_terminal_server(&self) -> Result<bool> {
        let output = powershell(
            "Write-Output \"PRODUCT_TYPE:$((Get-CimInstance Win32_OperatingSystem).ProductType)\"\n\
             Write-Output \"RDSH:$((Get-WindowsFeature -Name RDS-RD-Server -ErrorAction SilentlyContinue).Installed)\"",
            "terminal server query",
        )?;
        let server = labeled_value(&output, "PRODUCT_TYPE:").is_some_and(|t| t != "1");
        let rdsh = labeled_value(&output, "RDSH:").is_some_and(|v| v.eq_ignore_ascii_case("true"));
        Ok(server && rdsh)
    }

    fn set_terminal_server_install_mode(&self, install: bool) -> Result<()> {
        let mode = if install { "/install" } else { "/execute" };
        run(command("change.exe").args(["user", mode]), "change user")?;
        Ok(())
    }
}

/// `None` when no FirstSync key exists for the user. A key with a missing
/// or zero `IsSyncDone` means the first sync is still running.
fn parse_first_sync(output: &str) -> Option<bool> {
    labeled_value(output, "FIRST_SYNC:").map(|value| !(value.is_empty() || value == "0"))
}

/// Value of the first `LABEL:value` line, trimmed.
fn labeled_value<'a>(output: &'a str, label: &str) -> Option<&'a str> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(label))
        .map(str::trim)
}

// ============================================
// REGISTRY
// ============================================

/// Deferral history kept in the registry, through reg.exe.
pub struct RegistryDeferStore;

impl DeferHistoryStore for RegistryDeferStore {
    fn key_exists(&self, key: &str) -> Result<bool> {
        let output = command("reg")
            .args(["query", key])
            .output()
            .context("Failed to run reg query")?;
        Ok(output.status.success())
    }

    fn create_key(&self, key: &str) -> Result<()> {
        run(command("reg").args(["add", key, "/f"]), "reg add")?;
        Ok(())
    }

    fn get_values(&self, key: &str) -> Result<BTreeMap<String, RegValue>> {
        let output = run(command("reg").args(["query", key]), "reg query")?;
        Ok(parse_reg_query(&output))
    }

    fn set_value(&self, key: &str, name: &str, value: RegValue) -> Result<()> {
        let (kind, data) = match &value {
            RegValue::DWord(v) => ("REG_DWORD", v.to_string()),
            RegValue::String(s) => ("REG_SZ", s.clone()),
        };
        run(
            command("reg").args(["add", key, "/v", name, "/t", kind, "/d", &data, "/f"]),
            "reg add",
        )?;
        Ok(())
    }

    fn remove_key(&self, key: &str) -> Result<()> {
        run(command("reg").args(["delete", key, "/f"]), "reg delete")?;
        Ok(())
    }
}

/// Parse the value lines of `reg query <key>` (subkeys are ignored).
///
/// ```text
/// HKEY_LOCAL_MACHINE\SOFTWARE\...\Widget
///     DeferTimesRemaining    REG_DWORD    0x3
///     DeferDeadline    REG_SZ    2030-06-01T12:00:00.0000000Z
/// ```
fn parse_reg_query(output: &str) -> BTreeMap<String, RegValue> {
    let mut values = BTreeMap::new();
    for line in output.lines() {
        if !line.starts_with("    ") {
            continue;
        }
        let mut parts = line.trim_start().splitn(3, "    ");
        let (Some(name), Some(kind)) = (parts.next(), parts.next()) else {
            continue;
        };
        let data = parts.next().unwrap_or_default().trim();
        let value = match kind.trim() {
            "REG_DWORD" => {
                let parsed = data
                    .strip_prefix("0x")
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok());
                match parsed {
                    Some(v) => RegValue::DWord(v),
                    None => continue,
                }
            }
            "REG_SZ" | "REG_EXPAND_SZ" => RegValue::String(data.to_string()),
            _ => continue,
        };
        values.insert(name.trim().to_string(), value);
    }
    values
}

// ============================================
// SYSTEM INFO
// ============================================

const SYSTEM_INFO_SCRIPT: &str = r#"
$ErrorActionPreference = 'Stop'
$os = Get-CimInstance Win32_OperatingSystem
$cs = Get-CimInstance Win32_ComputerSystem
$identity = [Security.Principal.WindowsIdentity]::GetCurrent()
$principal = [Security.Principal.WindowsPrincipal]$identity
$arch = { param($a) switch ($a) { 'AMD64' { 'X64' } 'ARM64' { 'Arm64' } 'ARM' { 'Arm' } default { 'X86' } } }
$osArch = if ($env:PROCESSOR_ARCHITEW6432) { $env:PROCESSOR_ARCHITEW6432 } else { $env:PROCESSOR_ARCHITECTURE }
$users = @(Get-CimInstance Win32_LoggedOnUser -ErrorAction SilentlyContinue | ForEach-Object { "$($_.Antecedent.Domain)\$($_.Antecedent.Name)" } | Sort-Object -Unique)
$console = $cs.UserName
$active = $null
if ($console) {
    $sid = (New-Object Security.Principal.NTAccount($console)).Translate([Security.Principal.SecurityIdentifier]).Value
    $session = (Get-Process -Name explorer -IncludeUserName -ErrorAction SilentlyContinue | Where-Object { $_.UserName -eq $console } | Select-Object -First 1).SessionId
    if ($null -ne $session) { $active = [ordered]@{ account = $console; sid = $sid; session_id = [int]$session } }
}
$hardware = if ($cs.Model -match 'Virtual|VMware|KVM') { 'Virtual' } else { 'Physical' }
[ordered]@{
    toolkit_name = __TOOLKIT_NAME__
    toolkit_version = __TOOLKIT_VERSION__
    computer_name = "$($cs.DNSHostName).$($cs.Domain)"
    user_name = $env:USERNAME
    process_account = $identity.Name
    os_name = $os.Caption
    os_version = [Environment]::OSVersion.Version.ToString()
    os_architecture = & $arch $osArch
    process_architecture = & $arch $env:PROCESSOR_ARCHITECTURE
    os_product_type = switch ($os.ProductType) { 1 { 'Workstation' } 2 { 'Domain Controller' } default { 'Server' } }
    hardware_type = $hardware
    is_admin = $principal.IsInRole([Security.Principal.WindowsBuiltInRole]::Administrator)
    is_process_user_interactive = [Environment]::UserInteractive
    session_zero = (Get-Process -Id $PID).SessionId -eq 0
    users_logged_on = $users
    logged_on_user_sessions_text = (quser 2>$null | Out-String).Trim()
    current_logged_on_user_session = if ($users -contains $identity.Name) { $identity.Name } else { $null }
    console_user = $console
    run_as_active_user = $active
    culture = (Get-Culture).Name
    current_language = (Get-Culture).TwoLetterISOLanguageName.ToUpper()
    ui_language = (Get-UICulture).Name
    host_name = $Host.Name
    host_version = $Host.Version.ToString()
    running_task_sequence = $null -ne (Get-Process -Name TSManager -ErrorAction SilentlyContinue)
    temp_dir = [IO.Path]::GetTempPath()
} | ConvertTo-Json -Compress -Depth 4
"#;

impl SystemInfo {
    /// Take a snapshot of the current machine.
    pub fn detect(toolkit_name: &str, toolkit_version: &str) -> Result<Self> {
        let script = SYSTEM_INFO_SCRIPT
            .replace("__TOOLKIT_NAME__", &ps_quote(toolkit_name))
            .replace("__TOOLKIT_VERSION__", &ps_quote(toolkit_version));
        let output = powershell(&script, "system detection")?;
        let mut info = SystemInfo::from_json_str(output.trim()).context("Failed to parse system detection output")?;
        if let Some(session_id) = current_session_id() {
            info.session_zero = session_id == 0;
        }
        Ok(info)
    }
}

/// Terminal services session of this process.
#[cfg(windows)]
fn current_session_id() -> Option<u32> {
    use winapi::um::processthreadsapi::{GetCurrentProcessId, ProcessIdToSessionId};

    let mut session_id = 0u32;
    let ok = unsafe { ProcessIdToSessionId(GetCurrentProcessId(), &mut session_id) };
    (ok != 0).then_some(session_id)
}

#[cfg(not(windows))]
fn current_session_id() -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mounted_wim_info() {
        let output = "Deployment Image Servicing and Management tool\n\
                      Mounted images:\n\
                      \n\
                      Mount Dir : C:\\Pkg\\Files\\abc\n\
                      Image File : C:\\Pkg\\Files\\Other.wim\n\
                      Image Index : 1\n\
                      \n\
                      Mount Dir : C:\\Pkg\\Files\\def\n\
                      Image File : C:\\Pkg\\Files\\App.wim\n\
                      Image Index : 1\n";
        assert_eq!(
            parse_mounted_wim_info(output, Path::new("C:\\Pkg\\Files\\app.WIM")),
            Some(PathBuf::from("C:\\Pkg\\Files\\def"))
        );
        assert_eq!(parse_mounted_wim_info(output, Path::new("C:\\Missing.wim")), None);
    }

    #[test]
    fn test_parse_first_sync() {
        assert_eq!(parse_first_sync(""), None);
        assert_eq!(parse_first_sync("\r\n"), None);
        assert_eq!(parse_first_sync("FIRST_SYNC:0\r\n"), Some(false));
        assert_eq!(parse_first_sync("FIRST_SYNC:"), Some(false));
        assert_eq!(parse_first_sync("FIRST_SYNC:1\r\n"), Some(true));
    }

    #[test]
    fn test_parse_reg_query() {
        let output = "\r\nHKEY_LOCAL_MACHINE\\SOFTWARE\\PSAppDeployToolkit\\DeferHistory\\Widget\r\n    \
                      DeferTimesRemaining    REG_DWORD    0x3\r\n    \
                      DeferDeadline    REG_SZ    2030-06-01T12:00:00.0000000Z\r\n    \
                      Blank    REG_SZ    \r\n    \
                      Binary    REG_BINARY    00FF\r\n\r\n\
                      HKEY_LOCAL_MACHINE\\SOFTWARE\\PSAppDeployToolkit\\DeferHistory\\Widget\\Sub\r\n";
        let values = parse_reg_query(output);
        assert_eq!(values.get("DeferTimesRemaining"), Some(&RegValue::DWord(3)));
        assert_eq!(
            values.get("DeferDeadline"),
            Some(&RegValue::String("2030-06-01T12:00:00.0000000Z".into()))
        );
        assert_eq!(values.get("Blank"), Some(&RegValue::String(String::new())));
        assert!(!values.contains_key("Binary"));
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn test_parse_table_json() {
        let table = parse_table_json("{\"ProductName\":\"Widget\",\"ProductVersion\":\"2.0\"}\r\n").unwrap();
        assert_eq!(table.get("ProductName").map(String::as_str), Some("Widget"));
        assert!(parse_table_json("  ").unwrap().is_empty());
        assert!(parse_table_json("not json").is_err());
    }

    #[test]
    fn test_letters_from_mask() {
        assert_eq!(letters_from_mask(0b101), vec!['A', 'C']);
        assert_eq!(letters_from_mask(1 << 25), vec!['Z']);
    }

    #[test]
    fn test_labeled_value_and_quote() {
        assert_eq!(labeled_value("x\r\nFIRST_SYNC: 1 \r\n", "FIRST_SYNC:"), Some("1"));
        assert_eq!(labeled_value("nothing", "FIRST_SYNC:"), None);
        assert_eq!(ps_quote("O'Brien"), "'O''Brien'");
    }
}
