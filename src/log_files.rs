// ============================================
// log_files.rs - Log folder housekeeping
// ============================================
//
// - Rotation:    an existing log is renamed to {stem}_{timestamp}{ext}
//                when appending is off or the file is over the size cap
// - History:     only the newest N rotated logs / zip archives are kept
// - Hierarchy:   Vendor/Name/Version folders, oldest siblings pruned
// - Compression: the whole session log folder zipped into LogPath
// ============================================

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const BYTES_PER_MIB: f64 = 1_048_576.0;

/// Why an existing log file has to be rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    /// Appending is disabled
    NoAppend,
    /// The file is bigger than the configured maximum
    SizeExceeded,
}

/// Decide whether `log_file` needs rotating before a new session writes to it.
/// `max_size_mib == 0` disables the size check.
pub fn rotation_reason(log_file: &Path, append: bool, max_size_mib: u32) -> Result<Option<RotationReason>> {
    let metadata = match fs::metadata(log_file) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to inspect {}", log_file.display())),
    };
    let size_exceeded = max_size_mib > 0 && (metadata.len() as f64 / BYTES_PER_MIB) > f64::from(max_size_mib);
    if size_exceeded {
        Ok(Some(RotationReason::SizeExceeded))
    } else if !append {
        Ok(Some(RotationReason::NoAppend))
    } else {
        Ok(None)
    }
}

/// Timestamp used in rotated log and archive names: `2024-03-07T091501`.
/// Local time, no fractional seconds, no colons.
pub fn file_timestamp<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format("%Y-%m-%dT%H%M%S").to_string()
}

/// `App_Install.log` -> `App_Install_2024-03-07T091501.log`
pub fn archive_log_name(log_name: &str, timestamp: &str) -> String {
    let path = Path::new(log_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| log_name.to_string());
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    format!("{}_{}{}", stem, timestamp, extension)
}

/// Rename the current log to its archive name, then prune old logs with
/// the same stem. Returns the archive path.
pub fn rotate_log_file(directory: &Path, log_name: &str, timestamp: &str, max_history: u32) -> Result<PathBuf> {
    let current = directory.join(log_name);
    let archive = directory.join(archive_log_name(log_name, timestamp));
    fs::rename(&current, &archive)
        .with_context(|| format!("Failed to rename {} to {}", current.display(), archive.display()))?;

    let stem = Path::new(log_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| log_name.to_string());
    prune_files(directory, &stem, "log", max_history)?;
    Ok(archive)
}

/// Delete the oldest (by last write time) files in `directory` whose name
/// starts with `prefix` and ends with `.{extension}`, keeping `keep` files.
/// Returns the deleted paths.
pub fn prune_files(directory: &Path, prefix: &str, extension: &str, keep: u32) -> Result<Vec<PathBuf>> {
    let prefix = prefix.to_lowercase();
    let suffix = format!(".{}", extension.to_lowercase());
    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(directory).with_context(|| format!("Failed to read {}", directory.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if !name.starts_with(&prefix) || !name.ends_with(&suffix) {
            continue;
        }
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            files.push((metadata.modified()?, entry.path()));
        }
    }
    files.sort();

    let excess = files.len().saturating_sub(keep as usize);
    let mut deleted = Vec::new();
    for (_, path) in files.into_iter().take(excess) {
        fs::remove_file(&path).with_context(|| format!("Failed to delete {}", path.display()))?;
        deleted.push(path);
    }
    Ok(deleted)
}

/// `Vendor/Name/Version` below `base`, skipping blank parts.
pub fn hierarchy_folder(base: &Path, parts: &[Option<&str>]) -> PathBuf {
    parts
        .iter()
        .flatten()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .fold(base.to_path_buf(), |path, part| path.join(part))
}

/// Delete the oldest sibling folders of `current` (by creation time) so at
/// most `keep` siblings remain. `current` itself is never touched.
pub fn prune_sibling_folders(current: &Path, keep: u32) -> Result<Vec<PathBuf>> {
    let Some(parent) = current.parent() else {
        return Ok(Vec::new());
    };
    let mut folders: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(parent).with_context(|| format!("Failed to read {}", parent.display()))? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if !metadata.is_dir() || paths_equal(&path, current) {
            continue;
        }
        // Not every filesystem records a creation time.
        let created = metadata.created().or_else(|_| metadata.modified())?;
        folders.push((created, path));
    }
    folders.sort();

    let excess = folders.len().saturating_sub(keep as usize);
    let mut deleted = Vec::new();
    for (_, path) in folders.into_iter().take(excess) {
        fs::remove_dir_all(&path).with_context(|| format!("Failed to delete {}", path.display()))?;
        deleted.push(path);
    }
    Ok(deleted)
}

fn paths_equal(a: &Path, b: &Path) -> bool {
    a.to_string_lossy().eq_ignore_ascii_case(&b.to_string_lossy())
}

/// Remove `folder` if it exists, then create it empty.
pub fn recreate_folder(folder: &Path) -> Result<()> {
    if folder.exists() {
        fs::remove_dir_all(folder).with_context(|| format!("Failed to clear {}", folder.display()))?;
    }
    fs::create_dir_all(folder).with_context(|| format!("Failed to create {}", folder.display()))?;
    Ok(())
}

/// `{InstallName}_{DeploymentType}_` prefix shared by compressed log archives.
pub fn archive_prefix(install_name: &str, deployment_type: &str) -> String {
    format!("{}_{}_", install_name, deployment_type)
}

/// Zip the contents of `source` (not the folder itself) into `destination`.
pub fn compress_folder(source: &Path, destination: &Path) -> Result<()> {
    let file = File::create(destination).with_context(|| format!("Failed to create {}", destination.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in walkdir::WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("{} is outside {}", entry.path().display(), source.display()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut input = File::open(entry.path())?;
            io::copy(&mut input, &mut zip)?;
        }
    }
    zip.finish()?;
    Ok(())
}

/// Prune old archives, zip `log_folder` into `archive_dir`, then delete
/// `log_folder`. Returns the archive path.
pub fn archive_log_folder(
    log_folder: &Path,
    archive_dir: &Path,
    prefix: &str,
    timestamp: &str,
    max_history: u32,
) -> Result<PathBuf> {
    fs::create_dir_all(archive_dir).with_context(|| format!("Failed to create {}", archive_dir.display()))?;
    prune_files(archive_dir, prefix, "zip", max_history)?;

    let archive = archive_dir.join(format!("{}{}.zip", prefix, timestamp));
    compress_folder(log_folder, &archive)?;
    fs::remove_dir_all(log_folder).with_context(|| format!("Failed to delete {}", log_folder.display()))?;
    Ok(archive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Duration;

    fn write_file(path: &Path, len: usize) {
        fs::write(path, vec![b'a'; len]).unwrap();
    }

    fn set_mtime(path: &Path, secs_ago: u64) {
        let time = SystemTime::now() - Duration::from_secs(secs_ago);
        File::options().write(true).open(path).unwrap().set_modified(time).unwrap();
    }

    #[test]
    fn test_rotation_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("App.log");
        assert_eq!(rotation_reason(&log, true, 5).unwrap(), None);

        write_file(&log, 6 * 1024 * 1024);
        assert_eq!(rotation_reason(&log, true, 5).unwrap(), Some(RotationReason::SizeExceeded));

        write_file(&log, 4 * 1024 * 1024);
        assert_eq!(rotation_reason(&log, true, 5).unwrap(), None);
        assert_eq!(rotation_reason(&log, false, 5).unwrap(), Some(RotationReason::NoAppend));
        assert_eq!(rotation_reason(&log, true, 0).unwrap(), None);
    }

    #[test]
    fn test_archive_log_name() {
        assert_eq!(
            archive_log_name("App_Install.log", "2024-03-07T091501"),
            "App_Install_2024-03-07T091501.log"
        );
        assert_eq!(archive_log_name("noext", "T1"), "noext_T1");
    }

    #[test]
    fn test_file_timestamp() {
        let now = chrono::FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 7, 9, 15, 1)
            .unwrap();
        assert_eq!(file_timestamp(&now), "2024-03-07T091501");
    }

    #[test]
    fn test_rotate_and_prune_history() {
        let dir = tempfile::tempdir().unwrap();
        for (i, name) in ["App_1.log", "App_2.log", "App_3.log"].iter().enumerate() {
            let path = dir.path().join(name);
            write_file(&path, 1);
            set_mtime(&path, 100 - i as u64 * 10);
        }
        write_file(&dir.path().join("App.log"), 1);
        write_file(&dir.path().join("Other.log"), 1);
        set_mtime(&dir.path().join("Other.log"), 1000);

        let archive = rotate_log_file(dir.path(), "App.log", "2024-01-01T000000", 2).unwrap();
        assert!(archive.exists());
        assert!(!dir.path().join("App.log").exists());
        assert!(!dir.path().join("App_1.log").exists());
        assert!(!dir.path().join("App_2.log").exists());
        assert!(dir.path().join("App_3.log").exists());
        assert!(dir.path().join("Other.log").exists());
    }

    #[test]
    fn test_hierarchy_folder() {
        let base = Path::new("logs");
        assert_eq!(
            hierarchy_folder(base, &[Some("Contoso"), Some("Widget"), Some("1.0")]),
            base.join("Contoso").join("Widget").join("1.0")
        );
        assert_eq!(
            hierarchy_folder(base, &[None, Some("Widget"), Some(" ")]),
            base.join("Widget")
        );
    }

    #[test]
    fn test_prune_sibling_folders_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join("3.0");
        for name in ["1.0", "2.0", "2.5", "3.0"] {
            fs::create_dir(dir.path().join(name)).unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        let deleted = prune_sibling_folders(&current, 1).unwrap();
        assert_eq!(deleted.len(), 2);
        assert!(current.exists());
        assert!(dir.path().join("2.5").exists());
    }

    #[test]
    fn test_archive_log_folder() {
        let root = tempfile::tempdir().unwrap();
        let logs = root.path().join("App_Install");
        fs::create_dir_all(logs.join("sub")).unwrap();
        fs::write(logs.join("App.log"), "hello").unwrap();
        fs::write(logs.join("sub").join("msi.log"), "msi").unwrap();

        let archives = root.path().join("archives");
        fs::create_dir_all(&archives).unwrap();
        for (i, name) in ["App_Install_1.zip", "App_Install_2.zip"].iter().enumerate() {
            let path = archives.join(name);
            write_file(&path, 1);
            set_mtime(&path, 100 - i as u64 * 10);
        }

        let prefix = archive_prefix("App", "Install");
        let archive = archive_log_folder(&logs, &archives, &prefix, "2024-01-01T000000", 1).unwrap();
        assert_eq!(archive, archives.join("App_Install_2024-01-01T000000.zip"));
        assert!(!logs.exists());
        assert!(!archives.join("App_Install_1.zip").exists());
        assert!(archives.join("App_Install_2.zip").exists());

        let mut zip = zip::ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let mut text = String::new();
        zip.by_name("sub/msi.log").unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "msi");
        assert!(zip.by_name("App.log").is_ok());
    }

    #[test]
    fn test_recreate_folder() {
        let root = tempfile::tempdir().unwrap();
        let folder = root.path().join("tmp");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("stale.log"), "x").unwrap();
        recreate_folder(&folder).unwrap();
        assert!(folder.exists());
        assert_eq!(fs::read_dir(&folder).unwrap().count(), 0);
    }
}
