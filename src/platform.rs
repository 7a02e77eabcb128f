// ============================================
// platform.rs - Collaborator seams
// ============================================
//
// The session never talks to DISM, subst, the registry or the MSI database
// directly. It goes through these traits so the native implementations
// (native.rs) can be swapped for fakes in tests.
// ============================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;

use crate::defer::DeferHistoryStore;
use crate::types::ProcessDefinition;

/// Mounts and dismounts WIM images.
pub trait WimMounter {
    /// Mount `image` (read-only) at `dest` using the given image index.
    fn mount(&self, image: &Path, dest: &Path, index: u32) -> Result<()>;

    /// Dismount whatever mount point `image` is mounted at, discarding changes.
    fn dismount(&self, image: &Path) -> Result<()>;
}

/// Maps drive letters onto folders (`subst`).
pub trait DriveSubst {
    fn create(&self, letter: char, path: &Path) -> Result<()>;
    fn delete(&self, letter: char) -> Result<()>;

    /// Drive letters currently in use, upper case.
    fn used_letters(&self) -> Result<Vec<char>>;
}

/// Reads tables out of an MSI database.
pub trait MsiTables {
    /// Project `table` into key/value pairs, with an optional transform applied.
    /// For `Property` the keys are property names; for `File` the keys are
    /// file keys and the values the `FileName` column.
    fn query(&self, msi: &Path, mst: Option<&Path>, table: &str) -> Result<BTreeMap<String, String>>;
}

/// Live system queries used during mode resolution.
/// Every call is allowed to fail; the resolver logs and carries on.
pub trait SystemProbe {
    /// Whether the Out-Of-Box Experience has finished.
    fn is_oobe_complete(&self) -> Result<bool>;

    /// Session ids of every running process with this name (no `.exe`).
    fn process_session_ids(&self, name: &str) -> Result<Vec<u32>>;

    /// Autopilot "first sync" state for a user.
    /// `None` means the device shows no Autopilot enrollment at all,
    /// `Some(false)` means enrolled but the user's first sync hasn't finished.
    fn first_sync_done(&self, sid: &str) -> Result<Option<bool>>;

    /// Names of the given processes that are currently running.
    fn running_processes(&self, processes: &[ProcessDefinition]) -> Result<Vec<String>>;

    fn is_terminal_server(&self) -> Result<bool>;

    /// Switch a terminal server between install (`true`) and execute mode.
    fn set_terminal_server_install_mode(&self, install: bool) -> Result<()>;
}

/// Every collaborator a session needs, boxed so callers can mix native
/// implementations and fakes.
pub struct Collaborators {
    pub wim: Box<dyn WimMounter>,
    pub subst: Box<dyn DriveSubst>,
    pub msi: Box<dyn MsiTables>,
    pub probe: Box<dyn SystemProbe>,
    pub defer_store: Box<dyn DeferHistoryStore>,
}
