// ============================================
// deploysession - lib.rs
// ============================================
// Deployment session engine. A session is opened for one install,
// uninstall or repair of an application and closed when it's done:
//
// 1. EnvironmentContext   config.toml + a system snapshot (config.rs)
// 2. DeploymentSession    open -> work -> close (session.rs)
// 3. DeploymentStatus     derived from the exit code on close
//
// The session talks to the machine only through the traits in
// platform.rs; native.rs has the Windows implementations.
// ============================================

pub mod config;
pub mod defer;
pub mod error;
pub mod log_files;
pub mod logging;
pub mod mode;
pub mod naming;
pub mod native;
pub mod platform;
pub mod session;
pub mod types;
pub mod zero_config;

#[cfg(test)]
mod testing;

pub use config::{ActiveUser, EnvironmentContext, SessionParameters, SystemInfo, ToolkitConfig};
pub use defer::{DeferHistory, DeferHistoryStore, DeferHistoryUpdate, RegValue};
pub use error::{ConfigError, LogError, SessionError};
pub use logging::{HostLogStreamType, LogEntry, LogSeverity, LogStyle};
pub use native::native_collaborators;
pub use platform::Collaborators;
pub use session::{DeploymentSession, LogOptions};
pub use types::{Architecture, DeployMode, DeploymentStatus, DeploymentType, OsVersion, ProcessDefinition};
