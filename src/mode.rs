// ============================================
// mode.rs - Deployment mode resolution
// ============================================
//
// Decides whether a deployment runs Interactive, NonInteractive or Silent.
// Checks run in this order, each one only allowed to force Silent while the
// mode is still Auto:
// 1. OOBE in progress        (or, failing that, Autopilot ESP user phase)
// 2. Session 0 without a user to show UI to
// 3. Nothing to close        (none of the named processes are running)
// 4. Still Auto              -> Interactive
//
// The resolver doesn't log directly; it returns the messages so the session
// can write them through its own log sink.
// ============================================

use crate::config::ActiveUser;
use crate::logging::LogSeverity;
use crate::platform::SystemProbe;
use crate::types::{DeployMode, OsVersion, ProcessDefinition};

/// First Windows build with a reliable OOBE-complete flag (1709).
pub const OOBE_MIN_OS_VERSION: OsVersion = OsVersion::new(10, 0, 16299, 0);

/// Process hosting the Autopilot ESP user account setup page.
pub const ESP_HOST_PROCESS: &str = "WWAHost";

/// Everything the resolver looks at besides live probes.
#[derive(Debug, Clone)]
pub struct ModeInputs<'a> {
    /// Mode requested by the caller (`Auto` lets the checks decide)
    pub requested: DeployMode,
    pub os_version: OsVersion,
    /// OOBE/ESP detection allowed to change the mode
    pub oobe_detection: bool,
    /// Session 0 detection allowed to change the mode
    pub session_detection: bool,
    pub session_zero: bool,
    pub run_as_active_user: Option<&'a ActiveUser>,
    pub is_process_user_interactive: bool,
    pub processes_to_close: &'a [ProcessDefinition],
    /// `Some(true)` disables process detection, `Some(false)` forces it
    pub no_process_detection: Option<bool>,
}

/// Outcome of a resolution pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeResolution {
    /// Never `Auto`
    pub mode: DeployMode,
    /// Whether an automatic check changed the mode
    pub changed: bool,
    pub messages: Vec<(LogSeverity, String)>,
}

struct Resolver<'a> {
    mode: DeployMode,
    changed: bool,
    messages: Vec<(LogSeverity, String)>,
    probe: &'a dyn SystemProbe,
}

impl Resolver<'_> {
    fn info(&mut self, message: impl Into<String>) {
        self.messages.push((LogSeverity::Info, message.into()));
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.messages.push((LogSeverity::Warning, message.into()));
    }

    /// The shared decision ladder: already changed, explicitly set,
    /// detection disabled, or force Silent.
    fn force_silent(&mut self, detected: &str, enabled: bool) {
        if self.changed {
            let msg = format!("{} but deployment has already been changed to [{}].", detected, self.mode);
            self.info(msg);
        } else if self.mode != DeployMode::Auto {
            let msg = format!("{} but deployment mode was explicitly set to [{}].", detected, self.mode);
            self.info(msg);
        } else if enabled {
            self.mode = DeployMode::Silent;
            self.changed = true;
            let msg = format!("{}, changing deployment mode to [{}].", detected, self.mode);
            self.info(msg);
        } else {
            let msg = format!("{} but toolkit is configured to not adjust deployment mode.", detected);
            self.info(msg);
        }
    }

    fn check_oobe(&mut self, inputs: &ModeInputs<'_>) {
        let oobe_in_progress = if inputs.os_version >= OOBE_MIN_OS_VERSION {
            match self.probe.is_oobe_complete() {
                Ok(complete) => !complete,
                Err(e) => {
                    self.warn(format!("Unable to determine whether the device has completed the OOBE: {:#}", e));
                    false
                }
            }
        } else {
            false
        };

        if oobe_in_progress {
            self.force_silent("Detected OOBE in progress", inputs.oobe_detection);
        } else {
            self.check_esp(inputs);
        }
    }

    fn check_esp(&mut self, inputs: &ModeInputs<'_>) {
        let sessions = match self.probe.process_session_ids(ESP_HOST_PROCESS) {
            Ok(sessions) => sessions,
            Err(e) => {
                self.warn(format!("Unable to query running [{}] processes: {:#}", ESP_HOST_PROCESS, e));
                return;
            }
        };
        if sessions.is_empty() {
            self.info("Device has completed the OOBE and toolkit is not running with an active ESP in progress.");
            return;
        }

        self.info(format!(
            "The {} process is running, checking ESP User Account setup phase.",
            ESP_HOST_PROCESS
        ));
        let Some(user) = inputs.run_as_active_user else {
            self.info("The device currently has no users logged on.");
            return;
        };
        if !sessions.contains(&user.session_id) {
            self.info(format!(
                "There are no {} processes running for the currently logged on user.",
                ESP_HOST_PROCESS
            ));
            return;
        }

        match self.probe.first_sync_done(&user.sid) {
            Ok(Some(false)) => self.force_silent(
                "The ESP User Account Setup phase is still in progress",
                inputs.oobe_detection,
            ),
            Ok(Some(true)) => self.info("The ESP User Account Setup phase is already complete."),
            Ok(None) => self.info(format!("Could not find any FirstSync information for SID [{}].", user.sid)),
            Err(e) => self.warn(format!(
                "Unable to read FirstSync information for SID [{}]: {:#}",
                user.sid, e
            )),
        }
    }

    fn check_session_zero(&mut self, inputs: &ModeInputs<'_>) {
        if !inputs.session_zero {
            self.info("Session 0 not detected, toolkit running as non-SYSTEM user account.");
            return;
        }
        if self.changed || self.mode != DeployMode::Auto || !inputs.session_detection {
            self.force_silent("Session 0 detected", inputs.session_detection);
            return;
        }
        if inputs.run_as_active_user.is_some() {
            self.info("Session 0 detected, user(s) logged on to interact if required.");
        } else if inputs.is_process_user_interactive {
            self.info("Session 0 detected, no users logged on but process running in user interactive mode.");
        } else {
            self.force_silent(
                "Session 0 detected, no users logged on and process not running in user interactive mode",
                true,
            );
        }
    }

    fn check_processes(&mut self, inputs: &ModeInputs<'_>) {
        let forced = inputs.no_process_detection == Some(false);
        let enabled = inputs.no_process_detection != Some(true);
        if inputs.processes_to_close.is_empty() && !forced {
            self.info("No processes were specified as requiring closure.");
            return;
        }

        let names = format!(
            "['{}']",
            inputs
                .processes_to_close
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>()
                .join("', '")
        );
        let detected = if inputs.processes_to_close.is_empty() {
            "No processes were specified as requiring closure and process detection was explicitly forced".to_string()
        } else {
            format!("The processes {} were specified as requiring closure", names)
        };

        if self.changed || self.mode != DeployMode::Auto || !enabled {
            self.force_silent(&detected, enabled);
            return;
        }

        match self.probe.running_processes(inputs.processes_to_close) {
            Ok(running) if running.is_empty() => {
                let detected = if inputs.processes_to_close.is_empty() {
                    detected
                } else {
                    format!("{} but none were running", detected)
                };
                self.force_silent(&detected, true);
            }
            Ok(running) => {
                let mut unique: Vec<String> = Vec::new();
                for name in running {
                    if !unique.iter().any(|u| u.eq_ignore_ascii_case(&name)) {
                        unique.push(name);
                    }
                }
                self.info(format!(
                    "The processes ['{}'] were found to be running and will require closure.",
                    unique.join("', '")
                ));
            }
            Err(e) => self.warn(format!("Unable to determine which processes are running: {:#}", e)),
        }
    }
}

/// Run the full resolution pass.
pub fn resolve_deploy_mode(inputs: &ModeInputs<'_>, probe: &dyn SystemProbe) -> ModeResolution {
    let mut resolver = Resolver {
        mode: inputs.requested,
        changed: false,
        messages: Vec::new(),
        probe,
    };

    resolver.check_oobe(inputs);
    resolver.check_session_zero(inputs);
    resolver.check_processes(inputs);

    if resolver.mode == DeployMode::Auto {
        resolver.mode = DeployMode::Interactive;
    }

    ModeResolution {
        mode: resolver.mode,
        changed: resolver.changed,
        messages: resolver.messages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeProbe;

    fn user() -> ActiveUser {
        ActiveUser {
            account: "CONTOSO\\jane".into(),
            sid: "S-1-5-21-1".into(),
            session_id: 2,
        }
    }

    fn inputs<'a>(user: Option<&'a ActiveUser>, processes: &'a [ProcessDefinition]) -> ModeInputs<'a> {
        ModeInputs {
            requested: DeployMode::Auto,
            os_version: OsVersion::new(10, 0, 22631, 0),
            oobe_detection: true,
            session_detection: true,
            session_zero: false,
            run_as_active_user: user,
            is_process_user_interactive: true,
            processes_to_close: processes,
            no_process_detection: None,
        }
    }

    fn claims_change(resolution: &ModeResolution) -> bool {
        resolution
            .messages
            .iter()
            .any(|(_, m)| m.contains("changing deployment mode to"))
    }

    #[test]
    fn test_fallback_is_interactive() {
        let probe = FakeProbe::default();
        let u = user();
        let r = resolve_deploy_mode(&inputs(Some(&u), &[]), &probe);
        assert_eq!(r.mode, DeployMode::Interactive);
        assert!(!r.changed);
    }

    #[test]
    fn test_oobe_forces_silent() {
        let probe = FakeProbe {
            oobe_complete: false,
            ..FakeProbe::default()
        };
        let u = user();
        let r = resolve_deploy_mode(&inputs(Some(&u), &[]), &probe);
        assert_eq!(r.mode, DeployMode::Silent);
        assert!(r.changed);
        assert!(r.messages[0].1.starts_with("Detected OOBE in progress, changing deployment mode to [Silent]"));
    }

    #[test]
    fn test_oobe_ignored_on_old_os_and_when_disabled() {
        let probe = FakeProbe {
            oobe_complete: false,
            ..FakeProbe::default()
        };
        let u = user();
        let mut i = inputs(Some(&u), &[]);
        i.os_version = OsVersion::new(10, 0, 15063, 0);
        assert_eq!(resolve_deploy_mode(&i, &probe).mode, DeployMode::Interactive);

        let mut i = inputs(Some(&u), &[]);
        i.oobe_detection = false;
        let r = resolve_deploy_mode(&i, &probe);
        assert_eq!(r.mode, DeployMode::Interactive);
        assert!(r.messages[0].1.contains("configured to not adjust"));
    }

    #[test]
    fn test_esp_user_phase_forces_silent() {
        let probe = FakeProbe {
            wwahost_sessions: vec![2],
            first_sync: Some(false),
            ..FakeProbe::default()
        };
        let u = user();
        let r = resolve_deploy_mode(&inputs(Some(&u), &[]), &probe);
        assert_eq!(r.mode, DeployMode::Silent);

        // WWAHost in another session doesn't count.
        let probe = FakeProbe {
            wwahost_sessions: vec![5],
            first_sync: Some(false),
            ..FakeProbe::default()
        };
        assert_eq!(resolve_deploy_mode(&inputs(Some(&u), &[]), &probe).mode, DeployMode::Interactive);

        // Sync already done.
        let probe = FakeProbe {
            wwahost_sessions: vec![2],
            first_sync: Some(true),
            ..FakeProbe::default()
        };
        assert_eq!(resolve_deploy_mode(&inputs(Some(&u), &[]), &probe).mode, DeployMode::Interactive);
    }

    #[test]
    fn test_session_zero() {
        let probe = FakeProbe::default();
        let mut i = inputs(None, &[]);
        i.session_zero = true;
        i.is_process_user_interactive = false;
        assert_eq!(resolve_deploy_mode(&i, &probe).mode, DeployMode::Silent);

        i.is_process_user_interactive = true;
        assert_eq!(resolve_deploy_mode(&i, &probe).mode, DeployMode::Interactive);

        let u = user();
        let mut i = inputs(Some(&u), &[]);
        i.session_zero = true;
        i.is_process_user_interactive = false;
        assert_eq!(resolve_deploy_mode(&i, &probe).mode, DeployMode::Interactive);

        let mut i = inputs(None, &[]);
        i.session_zero = true;
        i.is_process_user_interactive = false;
        i.session_detection = false;
        assert_eq!(resolve_deploy_mode(&i, &probe).mode, DeployMode::Interactive);
    }

    #[test]
    fn test_processes_not_running_forces_silent() {
        let probe = FakeProbe::default();
        let u = user();
        let procs = vec![ProcessDefinition::new("winword")];
        let r = resolve_deploy_mode(&inputs(Some(&u), &procs), &probe);
        assert_eq!(r.mode, DeployMode::Silent);
        assert!(r
            .messages
            .iter()
            .any(|(_, m)| m.contains("['winword'] were specified as requiring closure but none were running")));

        let probe = FakeProbe {
            running: vec!["WINWORD".into(), "winword".into()],
            ..FakeProbe::default()
        };
        let r = resolve_deploy_mode(&inputs(Some(&u), &procs), &probe);
        assert_eq!(r.mode, DeployMode::Interactive);
        assert!(r.messages.iter().any(|(_, m)| m == "The processes ['WINWORD'] were found to be running and will require closure."));
    }

    #[test]
    fn test_process_detection_flags() {
        let probe = FakeProbe::default();
        let u = user();
        let procs = vec![ProcessDefinition::new("excel")];

        let mut i = inputs(Some(&u), &procs);
        i.no_process_detection = Some(true);
        assert_eq!(resolve_deploy_mode(&i, &probe).mode, DeployMode::Interactive);

        let mut i = inputs(Some(&u), &[]);
        i.no_process_detection = Some(false);
        assert_eq!(resolve_deploy_mode(&i, &probe).mode, DeployMode::Silent);
    }

    #[test]
    fn test_query_failures_are_soft() {
        let probe = FakeProbe {
            fail_queries: true,
            ..FakeProbe::default()
        };
        let u = user();
        let procs = vec![ProcessDefinition::new("excel")];
        let r = resolve_deploy_mode(&inputs(Some(&u), &procs), &probe);
        assert_eq!(r.mode, DeployMode::Interactive);
        assert!(r.messages.iter().filter(|(s, _)| *s == LogSeverity::Warning).count() >= 2);
    }

    #[test]
    fn test_explicit_mode_is_never_changed() {
        let probe = FakeProbe {
            oobe_complete: false,
            ..FakeProbe::default()
        };
        let procs = vec![ProcessDefinition::new("excel")];
        for requested in [DeployMode::Silent, DeployMode::Interactive, DeployMode::NonInteractive] {
            let mut i = inputs(None, &procs);
            i.requested = requested;
            i.session_zero = true;
            i.is_process_user_interactive = false;
            let r = resolve_deploy_mode(&i, &probe);
            assert_eq!(r.mode, requested);
            assert!(!r.changed);
            assert!(!claims_change(&r));
            assert!(r.messages.iter().any(|(_, m)| m.contains("explicitly set to")));
        }
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let probe = FakeProbe {
            wwahost_sessions: vec![2],
            first_sync: Some(false),
            ..FakeProbe::default()
        };
        let u = user();
        let procs = vec![ProcessDefinition::new("excel")];
        let i = inputs(Some(&u), &procs);
        let first = resolve_deploy_mode(&i, &probe);
        let second = resolve_deploy_mode(&i, &probe);
        assert_eq!(first, second);
        assert_eq!(first.mode, DeployMode::Silent);
        // Later checks only report that the mode was already changed.
        assert!(first.messages.iter().any(|(_, m)| m.contains("already been changed to [Silent]")));
    }
}
