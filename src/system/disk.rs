use std::io;
use std::path::{Path, PathBuf};

/// Bytes available to unprivileged writers on the filesystem holding `path`.
///
/// A path that does not exist yet is resolved to its nearest existing
/// ancestor, so a missing data directory still reports the volume it would
/// live on.
pub fn available_space(path: &Path) -> io::Result<u64> {
    let existing = nearest_existing(path).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no existing ancestor of {}", path.display()),
        )
    })?;
    fs2::available_space(existing)
}

/// Closest ancestor of `path` (itself included) that exists.
pub fn nearest_existing(path: &Path) -> Option<PathBuf> {
    if let Some(found) = path
        .ancestors()
        .filter(|p| !p.as_os_str().is_empty())
        .find(|p| p.exists())
    {
        return Some(found.to_path_buf());
    }
    // Relative paths bottom out at the working directory.
    path.is_relative().then(|| PathBuf::from("."))
}

/// Should a run refuse to count on this volume? True below `floor_bytes`,
/// and when free space cannot be determined at all.
pub fn is_disk_critical(path: &Path, floor_bytes: u64) -> bool {
    match available_space(path) {
        Ok(avail) => avail < floor_bytes,
        Err(_) => true,
    }
}
