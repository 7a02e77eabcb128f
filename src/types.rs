// ============================================
// types.rs - Shared session vocabulary
// ============================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ============================================
// ENUMS
// ============================================

/// What the deployment does to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeploymentType {
    #[default]
    Install,
    Uninstall,
    Repair,
}

impl fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentType::Install => write!(f, "Install"),
            DeploymentType::Uninstall => write!(f, "Uninstall"),
            DeploymentType::Repair => write!(f, "Repair"),
        }
    }
}

/// How much the deployment is allowed to interact with the user.
/// `Auto` only exists until mode resolution has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeployMode {
    #[default]
    Auto,
    Interactive,
    NonInteractive,
    Silent,
}

impl fmt::Display for DeployMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployMode::Auto => write!(f, "Auto"),
            DeployMode::Interactive => write!(f, "Interactive"),
            DeployMode::NonInteractive => write!(f, "NonInteractive"),
            DeployMode::Silent => write!(f, "Silent"),
        }
    }
}

/// Terminal outcome of a deployment, derived from the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeploymentStatus {
    Complete,
    RestartRequired,
    FastRetry,
    Error,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentStatus::Complete => write!(f, "Complete"),
            DeploymentStatus::RestartRequired => write!(f, "RestartRequired"),
            DeploymentStatus::FastRetry => write!(f, "FastRetry"),
            DeploymentStatus::Error => write!(f, "Error"),
        }
    }
}

/// CPU architecture of the OS or of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    X86,
    X64,
    Arm,
    Arm64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86 => write!(f, "X86"),
            Architecture::X64 => write!(f, "X64"),
            Architecture::Arm => write!(f, "Arm"),
            Architecture::Arm64 => write!(f, "Arm64"),
        }
    }
}

// ============================================
// PROCESS DEFINITIONS
// ============================================

/// A process the deployment may need to close before it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Process name without the `.exe` extension
    pub name: String,

    /// Friendly name shown to users (falls back to `name`)
    #[serde(default)]
    pub description: Option<String>,
}

impl ProcessDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        ProcessDefinition {
            name: name.into(),
            description: None,
        }
    }
}

// ============================================
// OS VERSION
// ============================================

/// Four-part Windows version (`10.0.19045.0`).
/// Ordering compares major, minor, build, then revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

impl OsVersion {
    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        OsVersion { major, minor, build, revision }
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.build, self.revision)
    }
}

impl FromStr for OsVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = [0u32; 4];
        let pieces: Vec<&str> = s.trim().split('.').collect();
        if pieces.is_empty() || pieces.len() > 4 || pieces[0].is_empty() {
            return Err(format!("invalid OS version '{}'", s));
        }
        for (slot, piece) in parts.iter_mut().zip(pieces.iter()) {
            *slot = piece
                .parse()
                .map_err(|_| format!("invalid OS version component '{}' in '{}'", piece, s))?;
        }
        Ok(OsVersion::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

impl Serialize for OsVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for OsVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_version_parse_and_order() {
        let v: OsVersion = "10.0.19045".parse().unwrap();
        assert_eq!(v, OsVersion::new(10, 0, 19045, 0));
        assert!(v >= OsVersion::new(10, 0, 16299, 0));
        assert!("10.0.15063.0".parse::<OsVersion>().unwrap() < OsVersion::new(10, 0, 16299, 0));
        assert!("".parse::<OsVersion>().is_err());
        assert!("10.x".parse::<OsVersion>().is_err());
        assert!("1.2.3.4.5".parse::<OsVersion>().is_err());
    }

    #[test]
    fn test_os_version_serde() {
        let v: OsVersion = serde_json::from_str("\"6.3.9600.1\"").unwrap();
        assert_eq!(v.to_string(), "6.3.9600.1");
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"6.3.9600.1\"");
    }
}
