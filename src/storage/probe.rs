//! Filesystem capacity probe
//!
//! Reports per-storage-path available bytes capped by the configured percent
//! threshold, and picks the most-free path for incoming downloads. The probe
//! also exposes the filesystem id so startup can refuse two configured paths
//! on the same mount.

use super::StorageError;
use crate::config::StoragePathConfig;
use std::path::Path;

/// Raw capacity numbers for the volume holding a path
#[derive(Debug, Clone, Copy)]
pub struct VolumeStats {
    /// Bytes available to unprivileged writers
    pub available: u64,
    /// Total volume size in bytes
    pub total: u64,
    /// Filesystem id, stable per mount
    pub fsid: u64,
}

#[cfg(unix)]
pub fn volume_stats(path: &Path) -> Result<VolumeStats, StorageError> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| StorageError::Probe(format!("path not representable: {}", path.display())))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(StorageError::Probe(format!(
            "statvfs failed for {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }

    Ok(VolumeStats {
        available: stat.f_bavail as u64 * stat.f_frsize as u64,
        total: stat.f_blocks as u64 * stat.f_frsize as u64,
        fsid: stat.f_fsid as u64,
    })
}

#[cfg(not(unix))]
pub fn volume_stats(_path: &Path) -> Result<VolumeStats, StorageError> {
    Err(StorageError::Probe(
        "filesystem probe is only supported on unix".into(),
    ))
}

/// Cap raw availability by the percent threshold of total capacity
pub fn apply_threshold(available: u64, total: u64, threshold: u8) -> u64 {
    let capped = (total as u128 * threshold.min(100) as u128 / 100) as u64;
    available.min(capped)
}

/// Available bytes for decisions on a configured path
pub fn available_bytes(entry: &StoragePathConfig) -> Result<u64, StorageError> {
    let stats = volume_stats(&entry.path)?;
    Ok(apply_threshold(stats.available, stats.total, entry.threshold))
}

/// Pick the configured path with the most capped free space
pub fn most_free_path<'a>(
    paths: &'a [StoragePathConfig],
) -> Result<Option<(&'a StoragePathConfig, u64)>, StorageError> {
    let mut best: Option<(&StoragePathConfig, u64)> = None;
    for entry in paths {
        let free = available_bytes(entry)?;
        if best.map_or(true, |(_, b)| free > b) {
            best = Some((entry, free));
        }
    }
    Ok(best)
}

/// Refuse startup when two configured paths share a filesystem mount
pub fn ensure_distinct_mounts(paths: &[StoragePathConfig]) -> Result<(), StorageError> {
    let mut seen: Vec<(u64, &Path)> = Vec::with_capacity(paths.len());
    for entry in paths {
        let stats = volume_stats(&entry.path)?;
        if let Some((_, other)) = seen.iter().find(|(fsid, _)| *fsid == stats.fsid) {
            return Err(StorageError::MountCollision {
                first: other.display().to_string(),
                second: entry.path.display().to_string(),
            });
        }
        seen.push((stats.fsid, &entry.path));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_apply_threshold_caps_by_percent() {
        // Plenty available, threshold limits usage
        assert_eq!(apply_threshold(900, 1000, 50), 500);
        // Volume nearly full, availability limits usage
        assert_eq!(apply_threshold(100, 1000, 50), 100);
        assert_eq!(apply_threshold(100, 1000, 0), 0);
        assert_eq!(apply_threshold(100, 1000, 100), 100);
        // Out-of-range thresholds clamp to 100
        assert_eq!(apply_threshold(100, 1000, 200), 100);
    }

    #[cfg(unix)]
    #[test]
    fn test_volume_stats_reports_capacity() {
        let dir = TempDir::new().unwrap();
        let stats = volume_stats(dir.path()).unwrap();
        assert!(stats.total > 0);
        assert!(stats.available <= stats.total);
    }

    #[cfg(unix)]
    #[test]
    fn test_same_mount_collides() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();

        let paths = vec![
            StoragePathConfig { path: a, threshold: 80 },
            StoragePathConfig { path: b, threshold: 80 },
        ];

        assert!(matches!(
            ensure_distinct_mounts(&paths),
            Err(StorageError::MountCollision { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_most_free_single_path() {
        let dir = TempDir::new().unwrap();
        let paths = vec![StoragePathConfig {
            path: dir.path().to_path_buf(),
            threshold: 100,
        }];

        let (entry, free) = most_free_path(&paths).unwrap().unwrap();
        assert_eq!(entry.path, dir.path());
        assert!(free > 0);
    }
}
