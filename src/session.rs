// ============================================
// session.rs - DeploymentSession
// ============================================
//
// One session per deployment run. Opening a session runs these phases in
// order; any error closes the session before it is returned:
//
//   1. Script directories   -> DirFiles / DirSupportFiles
//   2. Zero-config WIM      -> mount + subst drive
//   3. Zero-config MSI      -> MSI/MST/MSPs, identity, executables
//   4. App defaults         -> toolkit identity when no app was named
//   5. Install name/title
//   6. Logging              -> folders, rotation, flush of buffered entries
//   7. Script/system/user info
//   8. Admin + WOW64 checks
//   9. Language / task sequence info
//  10. Deploy mode          -> mode.rs, then the interactive-target check
//  11. Terminal server install mode
//
// close() undoes all of it and turns the exit code into a DeploymentStatus.
// ============================================

use std::fs;
use std::panic::Location;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Local};
use uuid::Uuid;

use crate::config::{non_blank, EnvironmentContext, SessionParameters};
use crate::defer::{DeferHistory, DeferHistoryUpdate};
use crate::error::SessionError;
use crate::log_files::{self, RotationReason};
use crate::logging::{self, HostLogStreamType, LogEntry, LogRequest, LogSeverity, LogSink, LogStyle, LOG_DIVIDER};
use crate::mode::{self, ModeInputs};
use crate::naming;
use crate::platform::Collaborators;
use crate::types::{DeployMode, DeploymentStatus, DeploymentType, ProcessDefinition};
use crate::zero_config::{self, MsiIdentity};

/// Script section used until the caller sets an install phase.
pub const DEFAULT_INSTALL_PHASE: &str = "Initialization";

/// Source name for messages the session writes itself.
const SESSION_LOG_SOURCE: &str = "DeploymentSession";

/// Placeholder values deployment script templates ship with.
const TEMPLATE_SCRIPT_DATE: &str = "2000-12-31";
const TEMPLATE_SCRIPT_AUTHOR: &str = "<author name>";

#[derive(Debug, Default, Clone, Copy)]
struct SessionFlags {
    /// Set once by close()
    disposed: bool,
    suppress_reboot_pass_thru: bool,
    terminal_server_mode: bool,
    disable_logging: bool,
    no_exit_on_close: bool,
    /// Identity came from a zero-config MSI
    use_default_msi: bool,
    non_interactive: bool,
    silent: bool,
    require_admin: bool,
    logging_initialized: bool,
}

/// Overrides for a single log call. Anything left `None` uses the
/// session's settings.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub severity: Option<LogSeverity>,
    pub source: Option<String>,
    pub script_section: Option<String>,
    pub debug_message: bool,
    pub log_file_directory: Option<PathBuf>,
    pub log_file_name: Option<String>,
    pub log_style: Option<LogStyle>,
    pub host: Option<HostLogStreamType>,
}

impl LogOptions {
    pub fn severity(severity: LogSeverity) -> Self {
        LogOptions {
            severity: Some(severity),
            ..LogOptions::default()
        }
    }
}

/// The state of one deployment run.
pub struct DeploymentSession<'env> {
    env: &'env EnvironmentContext,
    collaborators: Collaborators,
    sink: LogSink,
    started: DateTime<Local>,
    params: SessionParameters,
    flags: SessionFlags,

    deployment_type: DeploymentType,
    deploy_mode: DeployMode,
    app_vendor: Option<String>,
    app_name: Option<String>,
    app_version: Option<String>,
    app_arch: Option<String>,
    app_lang: Option<String>,
    app_revision: Option<String>,
    app_processes_to_close: Vec<ProcessDefinition>,
    install_name: String,
    install_title: String,

    dir_files: Option<PathBuf>,
    dir_support_files: Option<PathBuf>,
    default_msi_file: Option<PathBuf>,
    default_mst_file: Option<PathBuf>,
    default_msp_files: Vec<PathBuf>,

    log_path: Option<PathBuf>,
    log_name: Option<String>,
    defer_key: Option<String>,
    install_phase: String,
    exit_code: i32,
    log_buffer: Vec<LogEntry>,
    mounted_wim_files: Vec<PathBuf>,
    subst_drive: Option<char>,
    terminal_server_enabled: bool,
    written_divider: bool,
}

impl<'env> DeploymentSession<'env> {
    // ============================================
    // CONSTRUCTION
    // ============================================

    /// Open a new session. On failure the session is logged, cleaned up and
    /// closed before the error is returned, and the environment's last exit
    /// code reflects the failure.
    pub fn open(
        env: &'env EnvironmentContext,
        params: SessionParameters,
        collaborators: Collaborators,
    ) -> Result<Self, SessionError> {
        let mut session = Self::new(env, params, collaborators);
        match session.initialize() {
            Ok(()) => Ok(session),
            Err(error) => {
                session.abort_construction(&error);
                Err(error)
            }
        }
    }

    fn new(env: &'env EnvironmentContext, params: SessionParameters, collaborators: Collaborators) -> Self {
        let flags = SessionFlags {
            suppress_reboot_pass_thru: params.suppress_reboot_pass_thru,
            terminal_server_mode: params.terminal_server_mode,
            disable_logging: params.disable_logging,
            no_exit_on_close: params.no_exit_on_close,
            require_admin: params.require_admin,
            ..SessionFlags::default()
        };
        let sink = LogSink::new(
            env.config.toolkit.log_debug_message,
            env.system.process_account.clone(),
        );

        DeploymentSession {
            env,
            collaborators,
            sink,
            started: Local::now(),
            flags,
            deployment_type: params.deployment_type,
            deploy_mode: params.deploy_mode,
            app_vendor: non_blank(&params.app_vendor),
            app_name: non_blank(&params.app_name),
            app_version: non_blank(&params.app_version),
            app_arch: non_blank(&params.app_arch),
            app_lang: non_blank(&params.app_lang),
            app_revision: non_blank(&params.app_revision),
            app_processes_to_close: params.app_processes_to_close.clone(),
            install_name: String::new(),
            install_title: String::new(),
            dir_files: params.dir_files.clone(),
            dir_support_files: params.dir_support_files.clone(),
            default_msi_file: params.default_msi_file.clone(),
            default_mst_file: params.default_mst_file.clone(),
            default_msp_files: params.default_msp_files.clone(),
            log_path: None,
            log_name: None,
            defer_key: None,
            install_phase: DEFAULT_INSTALL_PHASE.to_string(),
            exit_code: env.config.ui.default_exit_code,
            log_buffer: Vec::new(),
            mounted_wim_files: Vec::new(),
            subst_drive: None,
            terminal_server_enabled: false,
            written_divider: false,
            params,
        }
    }

    fn initialize(&mut self) -> Result<(), SessionError> {
        self.resolve_script_directories();
        self.detect_default_wim()?;
        self.detect_default_msi()?;
        self.set_app_properties()?;
        self.set_install_properties()?;
        self.init_logging()?;
        self.log_script_info()?;
        self.log_system_info()?;
        self.log_user_info()?;
        self.test_session_viability()?;
        self.log_language_info()?;
        self.set_deploy_mode()?;
        self.test_interactive_target()?;
        self.enable_terminal_server_mode()?;
        Ok(())
    }

    fn abort_construction(&mut self, error: &SessionError) {
        tracing::error!("Deployment session failed to open: {}", error);
        let message = error.construction_message();
        if let Err(e) = self.log(message, LogSeverity::Error) {
            tracing::warn!("Failed to log construction failure: {}", e);
        }
        if let Err(e) = self.remove_subst_drive() {
            tracing::warn!("Failed to remove substitution drive: {}", e);
        }
        if let Err(e) = self.dismount_wim_files() {
            tracing::warn!("Failed to dismount WIM files: {}", e);
        }
        self.exit_code = error.exit_code(&self.env.config);
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close session after construction failure: {}", e);
        }
    }

    fn resolve_script_directories(&mut self) {
        for directory in &self.params.script_directory {
            let files = directory.join("Files");
            if self.dir_files.is_none() && files.is_dir() {
                self.dir_files = Some(files);
            }
            let support = directory.join("SupportFiles");
            if self.dir_support_files.is_none() && support.is_dir() {
                self.dir_support_files = Some(support);
            }
        }
    }

    fn detect_default_wim(&mut self) -> Result<(), SessionError> {
        if self.app_name.is_some() && !self.params.force_wim_detection {
            return Ok(());
        }
        if !self.mounted_wim_files.is_empty() {
            return Ok(());
        }
        let Some(dir_files) = self.dir_files.clone() else {
            return Ok(());
        };
        let Some(wim) = zero_config::find_wim(&dir_files)? else {
            return Ok(());
        };

        self.write_initial_divider()?;
        self.log(format!("Discovered Zero-Config WIM file [{}].", wim.display()), LogSeverity::Info)?;
        let mount_path = dir_files.join(Uuid::new_v4().simple().to_string());
        self.collaborators
            .wim
            .mount(&wim, &mount_path, 1)
            .with_context(|| format!("Failed to mount {}", wim.display()))?;
        self.mounted_wim_files.push(wim);
        self.dir_files = Some(mount_path.clone());
        self.log(
            format!("Successfully mounted WIM file to [{}].", mount_path.display()),
            LogSeverity::Info,
        )?;

        // Subst the mount point to keep paths short.
        let used = self.collaborators.subst.used_letters()?;
        if let Some(letter) = zero_config::free_drive_letter(&used) {
            self.log(
                format!("Creating substitution drive [{}:] for [{}].", letter, mount_path.display()),
                LogSeverity::Info,
            )?;
            self.collaborators.subst.create(letter, &mount_path)?;
            self.subst_drive = Some(letter);
            self.dir_files = Some(PathBuf::from(format!("{}:\\", letter)));
        }
        let dir_files = self.dir_files_display();
        self.log(format!("Using [{}] as the base DirFiles directory.", dir_files), LogSeverity::Info)?;
        Ok(())
    }

    fn detect_default_msi(&mut self) -> Result<(), SessionError> {
        if self.app_name.is_some() && !self.params.force_msi_detection {
            return Ok(());
        }
        let dir_files = self.dir_files.clone();
        let os_arch = self.env.system.os_architecture.to_string();

        self.default_msi_file = match self.default_msi_file.take() {
            Some(msi) => Some(zero_config::root_path(dir_files.as_deref(), &msi)),
            None => match &dir_files {
                Some(dir) => zero_config::select_msi(dir, &os_arch)?,
                None => None,
            },
        };
        let Some(msi) = self.default_msi_file.clone() else {
            return Ok(());
        };

        self.write_initial_divider()?;
        self.log(
            format!("Discovered Zero-Config MSI installation file [{}].", msi.display()),
            LogSeverity::Info,
        )?;

        self.default_mst_file = match self.default_mst_file.take() {
            Some(mst) => Some(zero_config::root_path(dir_files.as_deref(), &mst)),
            None => zero_config::default_mst(&msi),
        };
        if let Some(mst) = self.default_mst_file.clone() {
            self.log(
                format!("Discovered Zero-Config MST installation file [{}].", mst.display()),
                LogSeverity::Info,
            )?;
        }

        self.default_msp_files = if self.default_msp_files.is_empty() {
            match &dir_files {
                Some(dir) => zero_config::find_msps(dir)?,
                None => Vec::new(),
            }
        } else {
            self.default_msp_files
                .iter()
                .map(|msp| zero_config::root_path(dir_files.as_deref(), msp))
                .collect()
        };
        if !self.default_msp_files.is_empty() {
            let msps = join_paths(&self.default_msp_files);
            self.log(
                format!("Discovered Zero-Config MSP installation file(s) [{}].", msps),
                LogSeverity::Info,
            )?;
        }

        let mst = self.default_mst_file.clone();
        if !self.params.disable_default_msi_process_list {
            let file_table = self
                .collaborators
                .msi
                .query(&msi, mst.as_deref(), "File")
                .with_context(|| format!("Failed to read the File table of {}", msi.display()))?;
            let executables = zero_config::msi_executables(&file_table);
            if !executables.is_empty() {
                self.app_processes_to_close =
                    zero_config::merge_processes(&self.app_processes_to_close, &executables);
                let names: Vec<&str> = executables.iter().map(|p| p.name.as_str()).collect();
                self.log(format!("MSI Executable List [{}].", names.join(", ")), LogSeverity::Info)?;
            }
        }

        let properties = self
            .collaborators
            .msi
            .query(&msi, mst.as_deref(), "Property")
            .with_context(|| format!("Failed to read the Property table of {}", msi.display()))?;
        let identity = MsiIdentity::from_property_table(&properties);
        if self.app_vendor.is_none() {
            self.app_vendor = identity.manufacturer.clone();
        }
        if self.app_name.is_none() {
            self.app_name = identity.product_name.clone();
        }
        if self.app_version.is_none() {
            self.app_version = identity.product_version.clone();
        }
        self.log(
            format!("App Vendor [{}].", identity.manufacturer.unwrap_or_default()),
            LogSeverity::Info,
        )?;
        self.log(
            format!("App Name [{}].", identity.product_name.unwrap_or_default()),
            LogSeverity::Info,
        )?;
        self.log(
            format!("App Version [{}].", identity.product_version.unwrap_or_default()),
            LogSeverity::Info,
        )?;
        self.flags.use_default_msi = true;
        Ok(())
    }

    fn set_app_properties(&mut self) -> Result<(), SessionError> {
        let env = self.env;
        let system = &env.system;
        if self.app_name.is_none() {
            self.app_name = non_blank(&Some(system.toolkit_name.clone()));
            self.app_vendor = None;
            if self.app_version.is_none() {
                self.app_version = non_blank(&Some(system.toolkit_version.clone()));
            }
            if self.app_lang.is_none() {
                self.app_lang = non_blank(&Some(system.current_language.clone()));
            }
            if self.app_revision.is_none() {
                self.app_revision = Some("01".to_string());
            }
        }
        if self.app_name.is_none() {
            return Err(SessionError::MissingAppName);
        }
        Ok(())
    }

    fn set_install_properties(&mut self) -> Result<(), SessionError> {
        let include_vendor = !self.flags.use_default_msi;
        let name = self.app_name.clone().unwrap_or_default();

        let title = non_blank(&self.params.install_title).unwrap_or_else(|| {
            naming::build_install_title(
                self.app_vendor.as_deref(),
                &name,
                self.app_version.as_deref(),
                include_vendor,
            )
        });
        self.install_title = naming::collapse_whitespace(&title);

        let raw_name = non_blank(&self.params.install_name).unwrap_or_else(|| {
            naming::build_install_name(
                self.app_vendor.as_deref(),
                &[
                    Some(name.as_str()),
                    self.app_version.as_deref(),
                    self.app_arch.as_deref(),
                    self.app_lang.as_deref(),
                    self.app_revision.as_deref(),
                ],
                include_vendor,
            )
        });
        self.install_name = naming::sanitize_install_name(&raw_name);
        if self.install_name.is_empty() {
            return Err(SessionError::MissingAppName);
        }

        self.defer_key = Some(format!(
            "{}\\{}\\DeferHistory\\{}",
            self.env.config.toolkit.reg_path, self.env.system.toolkit_name, self.install_name
        ));
        Ok(())
    }

    fn init_logging(&mut self) -> Result<(), SessionError> {
        let env = self.env;
        let toolkit = &env.config.toolkit;

        let mut log_path = if toolkit.compress_logs {
            let folder = env
                .system
                .temp_dir
                .join(format!("{}_{}", self.install_name, self.deployment_type));
            log_files::recreate_folder(&folder)?;
            folder
        } else {
            create_dir(&toolkit.log_path)?;
            toolkit.log_path.clone()
        };

        if toolkit.log_to_hierarchy {
            let folder = log_files::hierarchy_folder(
                &log_path,
                &[
                    self.app_vendor.as_deref(),
                    self.app_name.as_deref(),
                    self.app_version.as_deref(),
                ],
            );
            create_dir(&folder)?;
            log_files::prune_sibling_folders(&folder, toolkit.log_max_hierarchy)?;
            log_path = folder;
        } else if toolkit.log_to_subfolder {
            log_path = log_path.join(&self.install_name);
            create_dir(&log_path)?;
        }

        let log_name = match non_blank(&self.params.log_name) {
            Some(name) => naming::strip_invalid_file_name_chars(&name),
            None => self.new_log_file_name(&env.system.toolkit_name),
        };
        let log_file = log_path.join(&log_name);
        match log_files::rotation_reason(&log_file, toolkit.log_append, toolkit.log_max_size) {
            Ok(Some(reason)) => self.rotate_existing_log(&log_path, &log_name, reason)?,
            Ok(None) => {}
            Err(e) => self.log(
                format!("Failed to rotate the log file [{}]: {:#}", log_file.display(), e),
                LogSeverity::Error,
            )?,
        }

        self.log_path = Some(log_path.clone());
        self.log_name = Some(log_name.clone());
        self.flags.logging_initialized = true;

        // Entries written before the log file existed.
        if !self.flags.disable_logging && !self.log_buffer.is_empty() {
            let lines: Vec<&str> = self
                .log_buffer
                .iter()
                .map(|entry| entry.line_for(toolkit.log_style))
                .collect();
            logging::append_lines(&log_file, &lines)?;
        }

        self.write_initial_divider()?;
        let started = format!(
            "[{}] {} started.",
            self.install_name,
            self.deployment_type.to_string().to_lowercase()
        );
        self.log(started, LogSeverity::Info)?;
        Ok(())
    }

    fn rotate_existing_log(&mut self, directory: &Path, log_name: &str, reason: RotationReason) -> Result<(), SessionError> {
        let env = self.env;
        let toolkit = &env.config.toolkit;
        let timestamp = log_files::file_timestamp(&Local::now());
        let archive_name = log_files::archive_log_name(log_name, &timestamp);

        if reason == RotationReason::SizeExceeded {
            self.log(
                format!(
                    "Maximum log file size [{} MB] reached. Rename log file to [{}].",
                    toolkit.log_max_size, archive_name
                ),
                LogSeverity::Warning,
            )?;
        }
        match log_files::rotate_log_file(directory, log_name, &timestamp, toolkit.log_max_history) {
            Ok(_) if reason == RotationReason::SizeExceeded => self.log(
                format!(
                    "Previous log file was renamed to [{}] because maximum log file size of [{} MB] was reached.",
                    archive_name, toolkit.log_max_size
                ),
                LogSeverity::Warning,
            ),
            Ok(_) => Ok(()),
            Err(e) => self.log(
                format!(
                    "Failed to rotate the log file [{}]: {:#}",
                    directory.join(log_name).display(),
                    e
                ),
                LogSeverity::Error,
            ),
        }
    }

    fn log_script_info(&mut self) -> Result<(), SessionError> {
        let env = self.env;
        let install_name = self.install_name.clone();
        if let Some(version) = non_blank(&self.params.app_script_version) {
            self.log(format!("[{}] script version is [{}].", install_name, version), LogSeverity::Info)?;
        }
        if let Some(date) = self.params.app_script_date {
            let date = date.format("%Y-%m-%d").to_string();
            if date != TEMPLATE_SCRIPT_DATE {
                self.log(format!("[{}] script date is [{}].", install_name, date), LogSeverity::Info)?;
            }
        }
        if let Some(author) = non_blank(&self.params.app_script_author) {
            if author != TEMPLATE_SCRIPT_AUTHOR {
                self.log(format!("[{}] script author is [{}].", install_name, author), LogSeverity::Info)?;
            }
        }
        if let Some(friendly) = non_blank(&self.params.deploy_app_script_friendly_name) {
            if let Some(version) = non_blank(&self.params.deploy_app_script_version) {
                self.log(format!("[{}] script version is [{}].", friendly, version), LogSeverity::Info)?;
            }
            if !self.params.deploy_app_script_parameters.is_empty() {
                let args: Vec<String> = self
                    .params
                    .deploy_app_script_parameters
                    .iter()
                    .map(|(key, value)| format!("-{}:'{}'", key, value))
                    .collect();
                self.log(
                    format!("The following parameters were passed to [{}]: [{}].", friendly, args.join(" ")),
                    LogSeverity::Info,
                )?;
            }
        }
        let system = &env.system;
        self.log(
            format!("[{}] module version is [{}].", system.toolkit_name, system.toolkit_version),
            LogSeverity::Info,
        )?;
        Ok(())
    }

    fn log_system_info(&mut self) -> Result<(), SessionError> {
        let env = self.env;
        let system = &env.system;
        let messages = [
            format!("Computer Name is [{}].", system.computer_name),
            format!("Current User is [{}].", system.process_account),
            format!(
                "OS Version is [{} {} {}].",
                system.os_name, system.os_architecture, system.os_version
            ),
            format!("OS Type is [{}].", system.os_product_type),
            format!("Hardware Platform is [{}].", system.hardware_type),
            format!(
                "Current Culture is [{}], language is [{}] and UI language is [{}].",
                system.culture, system.current_language, system.ui_language
            ),
            format!("Host is [{}] with version [{}].", system.host_name, system.host_version),
        ];
        for message in messages {
            self.log(message, LogSeverity::Info)?;
        }
        Ok(())
    }

    fn log_user_info(&mut self) -> Result<(), SessionError> {
        let env = self.env;
        let system = &env.system;
        if system.users_logged_on.is_empty() {
            return self.log("No users are logged on to the system.", LogSeverity::Info);
        }

        self.log(
            format!(
                "The following users are logged on to the system: [{}].",
                system.users_logged_on.join(", ")
            ),
            LogSeverity::Info,
        )?;
        let sessions = LogOptions {
            source: Some(SESSION_LOG_SOURCE.to_string()),
            host: Some(HostLogStreamType::None),
            ..LogOptions::default()
        };
        let text = format!(
            "Session information for all logged on users:\n\n{}",
            system.logged_on_user_sessions_text
        );
        self.write_entries(&[text], &sessions, Location::caller())?;

        match &system.current_logged_on_user_session {
            Some(user) => self.log(
                format!(
                    "Current process is running with user account [{}] under logged on user session for [{}].",
                    system.process_account, user
                ),
                LogSeverity::Info,
            )?,
            None => self.log(
                format!("Current process is running under a system account [{}].", system.process_account),
                LogSeverity::Info,
            )?,
        }
        match &system.console_user {
            Some(user) => self.log(
                format!(
                    "The following user is the console user [{}] (user with control of physical monitor, keyboard, and mouse).",
                    user
                ),
                LogSeverity::Info,
            )?,
            None => self.log(
                "There is no console user logged on (user with control of physical monitor, keyboard, and mouse).",
                LogSeverity::Info,
            )?,
        }
        if let Some(user) = &system.run_as_active_user {
            self.log(
                format!("The active logged on user who will receive UI elements is [{}].", user.account),
                LogSeverity::Info,
            )?;
        }
        Ok(())
    }

    fn test_session_viability(&mut self) -> Result<(), SessionError> {
        let env = self.env;
        let system = &env.system;
        if self.flags.require_admin && !system.is_admin {
            return Err(SessionError::AdminRequired);
        }
        if system.process_architecture != system.os_architecture && !self.params.allow_wow_process {
            return Err(SessionError::WowProcess {
                process: system.process_architecture.to_string(),
                os: system.os_architecture.to_string(),
            });
        }
        Ok(())
    }

    fn log_language_info(&mut self) -> Result<(), SessionError> {
        let env = self.env;
        self.log(
            format!(
                "The current execution context has a primary UI language of [{}].",
                env.system.ui_language
            ),
            LogSeverity::Info,
        )?;
        if let Some(language) = non_blank(&env.config.ui.language_override) {
            self.log(
                format!(
                    "The config file was configured to override the detected primary UI language with the following UI language: [{}].",
                    language
                ),
                LogSeverity::Info,
            )?;
        }
        if env.system.running_task_sequence {
            self.log("Script is currently running from a ConfigMgr Task Sequence.", LogSeverity::Info)
        } else {
            self.log("Script is not currently running from a ConfigMgr Task Sequence.", LogSeverity::Info)
        }
    }

    fn set_deploy_mode(&mut self) -> Result<(), SessionError> {
        let env = self.env;
        let processes = self.app_processes_to_close.clone();
        let inputs = ModeInputs {
            requested: self.deploy_mode,
            os_version: env.system.os_version,
            oobe_detection: env.config.toolkit.oobe_detection && !self.params.no_oobe_detection,
            session_detection: !self.params.no_session_detection,
            session_zero: env.system.session_zero,
            run_as_active_user: env.system.run_as_active_user.as_ref(),
            is_process_user_interactive: env.system.is_process_user_interactive,
            processes_to_close: &processes,
            no_process_detection: self.params.no_process_detection,
        };
        let resolution = mode::resolve_deploy_mode(&inputs, self.collaborators.probe.as_ref());
        for (severity, message) in resolution.messages {
            self.log(message, severity)?;
        }

        self.deploy_mode = resolution.mode;
        self.log(format!("Installation is running in [{}] mode.", self.deploy_mode), LogSeverity::Info)?;
        match self.deploy_mode {
            DeployMode::Silent => {
                self.flags.non_interactive = true;
                self.flags.silent = true;
            }
            DeployMode::NonInteractive => self.flags.non_interactive = true,
            _ => {}
        }
        self.log(format!("Deployment type is [{}].", self.deployment_type), LogSeverity::Info)
    }

    fn test_interactive_target(&mut self) -> Result<(), SessionError> {
        let env = self.env;
        let system = &env.system;
        if self.deploy_mode != DeployMode::Silent
            && system.run_as_active_user.is_none()
            && !system.is_process_user_interactive
        {
            return Err(SessionError::NoInteractiveTarget);
        }
        Ok(())
    }

    fn enable_terminal_server_mode(&mut self) -> Result<(), SessionError> {
        if !self.flags.terminal_server_mode {
            return Ok(());
        }
        let terminal_server = match self.collaborators.probe.is_terminal_server() {
            Ok(terminal_server) => terminal_server,
            Err(e) => {
                self.log(
                    format!("Unable to determine whether the system is a terminal server: {:#}", e),
                    LogSeverity::Warning,
                )?;
                false
            }
        };
        if !terminal_server {
            return self.log(
                "Terminal server mode was requested but the system is not a terminal server.",
                LogSeverity::Warning,
            );
        }
        self.collaborators.probe.set_terminal_server_install_mode(true)?;
        self.terminal_server_enabled = true;
        Ok(())
    }

    // ============================================
    // CLOSE
    // ============================================

    /// Close the session: revert terminal server mode, log the outcome,
    /// release the subst drive and WIM mounts, and archive the logs.
    ///
    /// Returns the exit code the process should end with, or `None` when the
    /// session was opened with `NoExitOnClose`. Every cleanup step runs even
    /// if an earlier one fails; the first failure is returned afterwards.
    pub fn close(&mut self) -> Result<Option<i32>, SessionError> {
        if self.flags.disposed {
            return Err(SessionError::AlreadyClosed);
        }
        let mut first_error: Option<SessionError> = None;
        let mut keep = |result: Result<(), SessionError>| {
            if let Err(e) = result {
                tracing::warn!("Session close step failed: {}", e);
                first_error.get_or_insert(e);
            }
        };

        if self.terminal_server_enabled {
            self.terminal_server_enabled = false;
            keep(
                self.collaborators
                    .probe
                    .set_terminal_server_install_mode(false)
                    .map_err(SessionError::from),
            );
        }

        let status = self.get_deployment_status();
        let seconds = (Local::now() - self.started).num_milliseconds() as f64 / 1000.0;
        let subject = if self.install_name.is_empty() {
            format!("{} deployment", self.env.system.toolkit_name)
        } else {
            format!(
                "[{}] {}",
                self.install_name,
                self.deployment_type.to_string().to_lowercase()
            )
        };
        let exit_code = self.exit_code;
        let outcome = |verb: &str| {
            format!(
                "{} {} in [{}] seconds with exit code [{}].",
                subject, verb, seconds, exit_code
            )
        };
        match status {
            DeploymentStatus::FastRetry => {
                let message = outcome("was deferred");
                keep(self.log(message, LogSeverity::Warning));
            }
            DeploymentStatus::Error => {
                let message = outcome("failed");
                keep(self.log(message, LogSeverity::Error));
            }
            DeploymentStatus::Complete | DeploymentStatus::RestartRequired => {
                let message = outcome("completed");
                keep(self.log(message, LogSeverity::Success));
                if status == DeploymentStatus::RestartRequired && !self.flags.suppress_reboot_pass_thru {
                    keep(self.log("A restart has been flagged as required.", LogSeverity::Warning));
                } else {
                    self.exit_code = 0;
                }
                keep(self.remove_defer_history());
            }
        }

        if self.exit_code != 0 {
            self.env.set_last_exit_code(self.exit_code);
        }

        keep(self.remove_subst_drive());
        keep(self.dismount_wim_files());
        keep(self.log(LOG_DIVIDER, LogSeverity::Info));
        self.flags.disposed = true;

        if self.env.config.toolkit.compress_logs {
            if let Err(e) = self.archive_logs() {
                let message = format!("Failed to manage archive file: {:#}", e);
                keep(self.log(message, LogSeverity::Error));
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        Ok(if self.flags.no_exit_on_close {
            None
        } else {
            Some(self.env.last_exit_code())
        })
    }

    fn archive_logs(&self) -> anyhow::Result<()> {
        let Some(log_path) = self.log_path.clone() else {
            return Ok(());
        };
        if !log_path.is_dir() {
            return Ok(());
        }
        let toolkit = &self.env.config.toolkit;
        let prefix = log_files::archive_prefix(&self.install_name, &self.deployment_type.to_string());
        let timestamp = log_files::file_timestamp(&self.started);
        let archive = log_files::archive_log_folder(
            &log_path,
            &toolkit.log_path,
            &prefix,
            &timestamp,
            toolkit.log_max_history,
        )?;
        tracing::info!("Compressed session logs to {}", archive.display());
        Ok(())
    }

    fn remove_subst_drive(&mut self) -> Result<(), SessionError> {
        let Some(letter) = self.subst_drive.take() else {
            return Ok(());
        };
        self.log(format!("Removing substitution drive [{}:].", letter), LogSeverity::Info)?;
        self.collaborators
            .subst
            .delete(letter)
            .with_context(|| format!("Failed to remove substitution drive {}:", letter))?;
        Ok(())
    }

    /// Dismount tracked WIM files, most recent first. Keeps going after a
    /// failure so no mount is left behind.
    fn dismount_wim_files(&mut self) -> Result<(), SessionError> {
        let mut first_error: Option<SessionError> = None;
        while let Some(wim) = self.mounted_wim_files.pop() {
            if let Err(e) = self.log(format!("Dismounting WIM file [{}].", wim.display()), LogSeverity::Info) {
                first_error.get_or_insert(e);
            }
            if let Err(e) = self.collaborators.wim.dismount(&wim) {
                let e = e.context(format!("Failed to dismount {}", wim.display()));
                first_error.get_or_insert(SessionError::from(e));
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ============================================
    // STATUS
    // ============================================

    /// Map the current exit code onto a deployment status. The default and
    /// defer exit codes win over the reboot and success lists.
    pub fn get_deployment_status(&self) -> DeploymentStatus {
        let ui = &self.env.config.ui;
        if self.exit_code == ui.default_exit_code || self.exit_code == ui.defer_exit_code {
            DeploymentStatus::FastRetry
        } else if self.params.app_reboot_exit_codes.contains(&self.exit_code) {
            DeploymentStatus::RestartRequired
        } else if self.params.app_success_exit_codes.contains(&self.exit_code) {
            DeploymentStatus::Complete
        } else {
            DeploymentStatus::Error
        }
    }

    pub fn is_closed(&self) -> bool {
        self.flags.disposed
    }

    pub fn can_exit_on_close(&self) -> bool {
        !self.flags.no_exit_on_close
    }

    pub fn is_non_interactive(&self) -> bool {
        self.flags.non_interactive
    }

    pub fn is_silent(&self) -> bool {
        self.flags.silent
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn set_exit_code(&mut self, exit_code: i32) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.exit_code = exit_code;
        Ok(())
    }

    /// Track a WIM mounted outside the session so close() dismounts it.
    pub fn add_mounted_wim_file(&mut self, wim: impl Into<PathBuf>) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.mounted_wim_files.push(wim.into());
        Ok(())
    }

    pub fn install_phase(&self) -> &str {
        &self.install_phase
    }

    pub fn set_install_phase(&mut self, phase: impl Into<String>) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.install_phase = phase.into();
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.flags.disposed {
            return Err(SessionError::AlreadyClosed);
        }
        Ok(())
    }

    // ============================================
    // ACCESSORS
    // ============================================

    pub fn deployment_type(&self) -> DeploymentType {
        self.deployment_type
    }

    pub fn deploy_mode(&self) -> DeployMode {
        self.deploy_mode
    }

    pub fn app_vendor(&self) -> Option<&str> {
        self.app_vendor.as_deref()
    }

    pub fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }

    pub fn app_version(&self) -> Option<&str> {
        self.app_version.as_deref()
    }

    pub fn app_arch(&self) -> Option<&str> {
        self.app_arch.as_deref()
    }

    pub fn app_lang(&self) -> Option<&str> {
        self.app_lang.as_deref()
    }

    pub fn app_revision(&self) -> Option<&str> {
        self.app_revision.as_deref()
    }

    pub fn app_processes_to_close(&self) -> &[ProcessDefinition] {
        &self.app_processes_to_close
    }

    pub fn install_name(&self) -> &str {
        &self.install_name
    }

    pub fn install_title(&self) -> &str {
        &self.install_title
    }

    pub fn dir_files(&self) -> Option<&Path> {
        self.dir_files.as_deref()
    }

    pub fn dir_support_files(&self) -> Option<&Path> {
        self.dir_support_files.as_deref()
    }

    pub fn default_msi_file(&self) -> Option<&Path> {
        self.default_msi_file.as_deref()
    }

    pub fn default_mst_file(&self) -> Option<&Path> {
        self.default_mst_file.as_deref()
    }

    pub fn default_msp_files(&self) -> &[PathBuf] {
        &self.default_msp_files
    }

    pub fn use_default_msi(&self) -> bool {
        self.flags.use_default_msi
    }

    pub fn mounted_wim_files(&self) -> &[PathBuf] {
        &self.mounted_wim_files
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn log_name(&self) -> Option<&str> {
        self.log_name.as_deref()
    }

    /// Every entry logged by this session, oldest first.
    pub fn log_buffer(&self) -> &[LogEntry] {
        &self.log_buffer
    }

    /// `{InstallName}_{discriminator}_{DeploymentType}[_{user}].log`.
    /// The user name is only added when not running as admin.
    pub fn new_log_file_name(&self, discriminator: &str) -> String {
        let system = &self.env.system;
        let user = if system.is_admin {
            String::new()
        } else {
            format!("_{}", system.user_name)
        };
        naming::strip_invalid_file_name_chars(&format!(
            "{}_{}_{}{}.log",
            self.install_name, discriminator, self.deployment_type, user
        ))
    }

    // ============================================
    // LOGGING
    // ============================================

    /// Log one or more messages with explicit options.
    #[track_caller]
    pub fn write_log_entry<S: AsRef<str>>(
        &mut self,
        messages: &[S],
        options: &LogOptions,
    ) -> Result<Vec<LogEntry>, SessionError> {
        self.write_entries(messages, options, Location::caller())
    }

    /// Log a single message at the given severity.
    #[track_caller]
    pub fn log(&mut self, message: impl AsRef<str>, severity: LogSeverity) -> Result<(), SessionError> {
        let options = LogOptions {
            severity: Some(severity),
            source: Some(SESSION_LOG_SOURCE.to_string()),
            ..LogOptions::default()
        };
        self.write_entries(&[message], &options, Location::caller())?;
        Ok(())
    }

    fn write_entries<S: AsRef<str>>(
        &mut self,
        messages: &[S],
        options: &LogOptions,
        caller: &'static Location<'static>,
    ) -> Result<Vec<LogEntry>, SessionError> {
        let messages: Vec<String> = messages.iter().map(|m| m.as_ref().to_string()).collect();
        let host = options.host.unwrap_or_else(|| self.host_stream_type());
        let style = options.log_style.unwrap_or(self.env.config.toolkit.log_style);
        let section = options
            .script_section
            .clone()
            .unwrap_or_else(|| self.install_phase.clone());

        let logging_enabled = !self.flags.disable_logging;
        let directory = options
            .log_file_directory
            .clone()
            .or_else(|| self.log_path.clone().filter(|_| logging_enabled));
        let file_name = options
            .log_file_name
            .clone()
            .or_else(|| self.log_name.clone().filter(|_| logging_enabled));
        let log_file = match (&directory, &file_name) {
            (Some(dir), Some(name)) => Some((dir.as_path(), name.as_str())),
            _ => None,
        };

        let request = LogRequest {
            messages: &messages,
            severity: options.severity.unwrap_or(LogSeverity::Info),
            source: options.source.as_deref(),
            script_section: Some(section.as_str()),
            debug_message: options.debug_message,
            log_file,
            log_style: style,
            host,
            caller,
        };

        // Until the log file exists, entries are only kept in memory and
        // flushed when logging is initialized.
        let entries = if !self.flags.logging_initialized && log_file.is_none() && host == HostLogStreamType::None {
            self.sink.render(&request)?
        } else {
            self.sink.write(&request)?
        };
        self.log_buffer.extend(entries.iter().cloned());
        Ok(entries)
    }

    /// Host output target from the toolkit config.
    pub fn host_stream_type(&self) -> HostLogStreamType {
        let toolkit = &self.env.config.toolkit;
        match (toolkit.log_write_to_host, toolkit.log_host_output_to_std_streams) {
            (false, _) => HostLogStreamType::None,
            (true, true) => HostLogStreamType::Console,
            (true, false) => HostLogStreamType::Host,
        }
    }

    fn write_initial_divider(&mut self) -> Result<(), SessionError> {
        if self.written_divider {
            return Ok(());
        }
        self.written_divider = true;
        self.log(LOG_DIVIDER, LogSeverity::Info)
    }

    fn dir_files_display(&self) -> String {
        self.dir_files
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    // ============================================
    // DEFERRAL HISTORY
    // ============================================

    /// Read the deferral history for this installation.
    pub fn get_defer_history(&mut self) -> Result<Option<DeferHistory>, SessionError> {
        let Some(key) = self.defer_key.clone() else {
            return Ok(None);
        };
        if !self.collaborators.defer_store.key_exists(&key)? {
            return Ok(None);
        }
        self.log("Getting deferral history...", LogSeverity::Info)?;
        let values = self.collaborators.defer_store.get_values(&key)?;
        Ok(DeferHistory::from_values(&values)?)
    }

    /// Write the given deferral values, creating the key when needed.
    pub fn set_defer_history(&mut self, update: &DeferHistoryUpdate) -> Result<(), SessionError> {
        self.ensure_open()?;
        let Some(key) = self.defer_key.clone() else {
            return Err(SessionError::NotInitialized);
        };
        for (name, value) in update.to_values() {
            self.log(format!("Setting deferral history: [{} = {}].", name, value), LogSeverity::Info)?;
            if !self.collaborators.defer_store.key_exists(&key)? {
                self.collaborators.defer_store.create_key(&key)?;
            }
            self.collaborators.defer_store.set_value(&key, name, value)?;
        }
        Ok(())
    }

    /// Remove the deferral history for this installation.
    pub fn reset_defer_history(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.remove_defer_history()
    }

    fn remove_defer_history(&mut self) -> Result<(), SessionError> {
        let Some(key) = self.defer_key.clone() else {
            return Ok(());
        };
        if self.collaborators.defer_store.key_exists(&key)? {
            self.log("Removing deferral history...", LogSeverity::Info)?;
            self.collaborators.defer_store.remove_key(&key)?;
        }
        Ok(())
    }
}

/// Release the subst drive and WIM mounts of a session that was never closed.
impl Drop for DeploymentSession<'_> {
    fn drop(&mut self) {
        if self.flags.disposed {
            return;
        }
        if self.subst_drive.is_some() || !self.mounted_wim_files.is_empty() {
            tracing::warn!("Deployment session dropped without close(); releasing mounts");
        }
        if let Err(e) = self.remove_subst_drive() {
            tracing::warn!("Failed to remove substitution drive: {}", e);
        }
        if let Err(e) = self.dismount_wim_files() {
            tracing::warn!("Failed to dismount WIM files: {}", e);
        }
    }
}

fn create_dir(path: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(path).with_context(|| format!("Failed to create {}", path.display()))
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
