//! Structural description of a directory tree.
//!
//! A [`Container`] lists files, directories and symlinks with their relative
//! paths, but no content. File order is stable (sorted by path) because every
//! other component addresses files by their index in this list.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::util;

pub const DEFAULT_FILE_MODE: u32 = 0o644;
pub const DEFAULT_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub mode: u32,
    pub size: u64,
    /// Position of this file's first byte if all files were laid end to end.
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub path: String,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkEntry {
    pub path: String,
    pub mode: u32,
    pub dest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub files: Vec<FileEntry>,
    pub dirs: Vec<DirEntry>,
    pub symlinks: Vec<SymlinkEntry>,
    /// Sum of all file sizes.
    pub size: u64,
}

impl Container {
    /// Build a container from unordered entries. Sorts everything by path
    /// and recomputes file offsets and the total size.
    pub fn new(
        mut files: Vec<FileEntry>,
        mut dirs: Vec<DirEntry>,
        mut symlinks: Vec<SymlinkEntry>,
    ) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        dirs.sort_by(|a, b| a.path.cmp(&b.path));
        symlinks.sort_by(|a, b| a.path.cmp(&b.path));

        let mut offset = 0u64;
        for f in files.iter_mut() {
            f.offset = offset;
            offset += f.size;
        }

        Self {
            files,
            dirs,
            symlinks,
            size: offset,
        }
    }

    /// Scan `root` and describe everything below it.
    ///
    /// Symlinks are recorded, never followed. Paths use forward slashes.
    pub fn walk(root: &Path) -> Result<Self> {
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        let mut symlinks = Vec::new();

        for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
            let entry = entry?;
            let relative = util::relative_slash_path(root, entry.path())?;
            let file_type = entry.file_type();
            let meta = entry.metadata()?;
            let mode = util::unix_mode(&meta);

            if file_type.is_symlink() {
                let dest = std::fs::read_link(entry.path())?;
                let dest = dest.to_string_lossy().replace('\\', "/");
                symlinks.push(SymlinkEntry {
                    path: relative,
                    mode,
                    dest,
                });
            } else if file_type.is_dir() {
                dirs.push(DirEntry {
                    path: relative,
                    mode,
                });
            } else {
                files.push(FileEntry {
                    path: relative,
                    mode,
                    size: meta.len(),
                    offset: 0,
                });
            }
        }

        Ok(Self::new(files, dirs, symlinks))
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty() && self.symlinks.is_empty()
    }

    /// Map from file path to file index.
    pub fn file_indices_by_path(&self) -> HashMap<&str, usize> {
        self.files
            .iter()
            .enumerate()
            .map(|(i, f)| (f.path.as_str(), i))
            .collect()
    }

    pub fn stats(&self) -> String {
        format!(
            "{} files, {} dirs, {} symlinks, {} bytes",
            self.files.len(),
            self.dirs.len(),
            self.symlinks.len(),
            self.size
        )
    }

    /// Fail unless `other` describes the same tree (paths, sizes, link
    /// targets). Modes and offsets are not compared.
    pub fn ensure_equal(&self, other: &Container) -> Result<()> {
        let mut problems = Vec::new();

        let ours: HashMap<&str, u64> =
            self.files.iter().map(|f| (f.path.as_str(), f.size)).collect();
        let theirs: HashMap<&str, u64> =
            other.files.iter().map(|f| (f.path.as_str(), f.size)).collect();
        for (path, size) in &ours {
            match theirs.get(path) {
                None => problems.push(format!("file {} is missing", path)),
                Some(got) if got != size => {
                    problems.push(format!("file {} should be {} bytes, is {}", path, size, got))
                }
                Some(_) => {}
            }
        }
        for path in theirs.keys().filter(|p| !ours.contains_key(*p)) {
            problems.push(format!("file {} should not exist", path));
        }

        let our_dirs: Vec<&str> = self.dirs.iter().map(|d| d.path.as_str()).collect();
        let their_dirs: Vec<&str> = other.dirs.iter().map(|d| d.path.as_str()).collect();
        for d in our_dirs.iter().filter(|d| !their_dirs.contains(d)) {
            problems.push(format!("dir {} is missing", d));
        }
        for d in their_dirs.iter().filter(|d| !our_dirs.contains(d)) {
            problems.push(format!("dir {} should not exist", d));
        }

        let our_links: HashMap<&str, &str> = self
            .symlinks
            .iter()
            .map(|s| (s.path.as_str(), s.dest.as_str()))
            .collect();
        let their_links: HashMap<&str, &str> = other
            .symlinks
            .iter()
            .map(|s| (s.path.as_str(), s.dest.as_str()))
            .collect();
        if our_links != their_links {
            problems.push("symlinks differ".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            problems.sort();
            Err(Error::Integrity(problems.join("; ")))
        }
    }
}
