use memmap2::Mmap;
use std::fs::Metadata;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Path of `full` relative to `root`, with forward slashes.
pub fn relative_slash_path(root: &Path, full: &Path) -> Result<String> {
    let relative = full.strip_prefix(root).map_err(|_| {
        Error::InvalidOptions(format!(
            "{} is not below {}",
            full.display(),
            root.display()
        ))
    })?;
    let relative = relative.to_str().ok_or_else(|| {
        Error::InvalidOptions(format!("non-UTF8 path: {}", relative.display()))
    })?;
    Ok(relative.replace('\\', "/"))
}

/// Turn a container path (forward slashes) into a native path under `root`.
pub fn native_path(root: &Path, slash_path: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in slash_path.split('/').filter(|p| !p.is_empty()) {
        out.push(part);
    }
    out
}

/// Permission bits, or a sensible default on platforms without them.
#[cfg(unix)]
pub fn unix_mode(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
pub fn unix_mode(meta: &Metadata) -> u32 {
    if meta.is_dir() {
        crate::container::DEFAULT_DIR_MODE
    } else {
        crate::container::DEFAULT_FILE_MODE
    }
}

/// Restore the executable bits recorded in a container. Other bits are
/// left to the umask.
#[cfg(unix)]
pub fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode & 0o111 == 0 {
        return Ok(());
    }
    let current = std::fs::metadata(path)?.permissions().mode();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(current | (mode & 0o111)))
}

#[cfg(not(unix))]
pub fn apply_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
pub fn create_symlink(dest: &str, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(dest, link)
}

#[cfg(not(unix))]
pub fn create_symlink(_dest: &str, link: &Path) -> io::Result<()> {
    tracing::warn!("symlinks are not supported here, skipping {}", link.display());
    Ok(())
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Option<Mmap>> {
    let file = std::fs::File::open(path)?;
    if file.metadata()?.len() == 0 {
        // zero-length mappings are an error on some platforms
        return Ok(None);
    }
    // SAFETY: read-only mapping of a file nothing else writes to during the operation.
    let map = unsafe { Mmap::map(&file)? };
    Ok(Some(map))
}

/// Sort slash paths so children come before parents (for deletion).
pub fn sort_deepest_first(paths: &mut [String]) {
    paths.sort_by(|a, b| {
        let depth_a = a.matches('/').count();
        let depth_b = b.matches('/').count();
        depth_b.cmp(&depth_a).then_with(|| b.cmp(a))
    });
}

/// Write adapter that reports the number of bytes passed through it.
pub struct CountingWriter<W, F> {
    inner: W,
    on_write: F,
}

impl<W: Write, F: FnMut(u64)> CountingWriter<W, F> {
    pub fn new(inner: W, on_write: F) -> Self {
        Self { inner, on_write }
    }
}

impl<W: Write, F: FnMut(u64)> Write for CountingWriter<W, F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        (self.on_write)(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
