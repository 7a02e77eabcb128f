// ============================================
// zero_config.rs - Zero-config artifact discovery
// ============================================
//
// When a deployment doesn't name its application, the Files folder is
// searched for installers and the application identity is read from them:
// - *.wim           mounted and used as the new Files folder
// - *.msi           the default installer (architecture-neutral preferred)
// - <msi stem>.mst  the default transform, when present
// - *.msp           default patches, in name order
//
// Only the top level of the folder is searched. Candidates are sorted by
// file name (case-insensitive) so the pick doesn't depend on the order the
// filesystem happens to enumerate in.
// ============================================

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::types::ProcessDefinition;

/// Drive letters tried for the WIM subst drive, in order.
const DRIVE_LETTERS: &[char] = &[
    'Z', 'Y', 'X', 'W', 'V', 'U', 'T', 'S', 'R', 'Q', 'P', 'O', 'N', 'M', 'L', 'K', 'J', 'I', 'H', 'G',
    'F', 'E', 'D', 'C', 'B', 'A',
];

/// List top-level files in `dir` with the given extension (no dot), sorted by name.
pub fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension))
                .unwrap_or(false)
        })
        .collect();
    files.sort_by_key(|path| sort_key(path));
    Ok(files)
}

fn sort_key(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// First WIM file in the Files folder.
pub fn find_wim(dir_files: &Path) -> Result<Option<PathBuf>> {
    Ok(files_with_extension(dir_files, "wim")?.into_iter().next())
}

/// First free drive letter, scanning Z down to A.
pub fn free_drive_letter(used: &[char]) -> Option<char> {
    DRIVE_LETTERS
        .iter()
        .copied()
        .find(|letter| !used.iter().any(|u| u.eq_ignore_ascii_case(letter)))
}

/// Pick the default MSI from the Files folder.
///
/// Files ending in `.{os_arch}.msi` are only used when nothing else exists,
/// so `App.msi` wins over `App.x64.msi` on an x64 OS.
pub fn select_msi(dir_files: &Path, os_arch: &str) -> Result<Option<PathBuf>> {
    let candidates = files_with_extension(dir_files, "msi")?;
    let arch_suffix = format!(".{}.msi", os_arch.to_lowercase());
    let neutral = candidates
        .iter()
        .find(|path| !sort_key(path).ends_with(&arch_suffix))
        .cloned();
    Ok(neutral.or_else(|| candidates.into_iter().next()))
}

/// `App.msi` -> `App.mst`, when that file exists.
pub fn default_mst(msi: &Path) -> Option<PathBuf> {
    let mst = msi.with_extension("mst");
    mst.is_file().then_some(mst)
}

/// Every MSP in the Files folder, in name order.
pub fn find_msps(dir_files: &Path) -> Result<Vec<PathBuf>> {
    files_with_extension(dir_files, "msp")
}

/// Root a relative path against the Files folder.
pub fn root_path(dir_files: Option<&Path>, path: &Path) -> PathBuf {
    match dir_files {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

/// Executables listed in an MSI's File table.
///
/// `FileName` values look like `SHORT~1.EXE|LongName.exe`; the long name is
/// used, without extension and without the leading underscore some
/// authoring tools add. Duplicates are dropped case-insensitively.
pub fn msi_executables(file_table: &BTreeMap<String, String>) -> Vec<ProcessDefinition> {
    let mut found: Vec<ProcessDefinition> = Vec::new();
    for value in file_table.values() {
        if !value.to_lowercase().ends_with(".exe") {
            continue;
        }
        let Some(long_name) = value.split('|').filter(|part| !part.is_empty()).last() else {
            continue;
        };
        let stem = Path::new(long_name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = stem.strip_prefix('_').unwrap_or(&stem).to_string();
        if name.is_empty() || found.iter().any(|p| p.name.eq_ignore_ascii_case(&name)) {
            continue;
        }
        found.push(ProcessDefinition::new(name));
    }
    found
}

/// Merge discovered processes into the caller's list.
/// The caller's entry wins when both name the same process.
pub fn merge_processes(caller: &[ProcessDefinition], discovered: &[ProcessDefinition]) -> Vec<ProcessDefinition> {
    let mut merged: Vec<ProcessDefinition> = Vec::new();
    for process in caller.iter().chain(discovered) {
        if !merged.iter().any(|p| p.name.eq_ignore_ascii_case(&process.name)) {
            merged.push(process.clone());
        }
    }
    merged
}

/// Product identity read from an MSI's Property table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsiIdentity {
    pub manufacturer: Option<String>,
    pub product_name: Option<String>,
    pub product_version: Option<String>,
}

impl MsiIdentity {
    pub fn from_property_table(properties: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| {
            properties
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        MsiIdentity {
            manufacturer: get("Manufacturer"),
            product_name: get("ProductName"),
            product_version: get("ProductVersion"),
        }
    }
}
