//! Commit of an in-place apply: merge the stage directory over the live tree.
//!
//! Nothing under the output directory changes until [`Overlay::commit`]
//! runs. The steps are ordered so every old file a transposition needs is
//! moved out of the way before anything lands on its path.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

use crate::container::Container;
use crate::error::Result;
use crate::util;

/// An old file reused unchanged under a new path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transposition {
    pub target_index: usize,
    pub source_index: usize,
}

/// What the apply loop left for the commit.
#[derive(Debug, Default)]
pub struct CommitPlan {
    /// Source files rebuilt into the stage.
    pub staged: Vec<usize>,
    pub transpositions: Vec<Transposition>,
    /// Source files already correct on disk.
    pub untouched: Vec<usize>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitStats {
    pub deleted_files: usize,
    pub deleted_dirs: usize,
}

pub struct Overlay<'a> {
    /// Layout of the tree currently on disk.
    pub target: &'a Container,
    /// Layout it must end up with.
    pub source: &'a Container,
    pub output: &'a Path,
    pub stage: &'a Path,
}

impl Overlay<'_> {
    pub fn commit(&self, plan: &CommitPlan) -> Result<CommitStats> {
        self.stage_transpositions(&plan.transpositions, &plan.untouched)?;

        let stats = CommitStats {
            deleted_files: self.delete_ghosts()?,
            deleted_dirs: self.delete_old_dirs()?,
        };
        create_dirs_and_symlinks(self.source, self.output)?;

        let moved = plan.transpositions.iter().map(|t| t.source_index);
        for source_index in plan.staged.iter().copied().chain(moved) {
            let path = &self.source.files[source_index].path;
            place(
                &util::native_path(self.stage, path),
                &util::native_path(self.output, path),
            )?;
        }

        match fs::remove_dir_all(self.stage) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        debug!(
            staged = plan.staged.len(),
            moved = plan.transpositions.len(),
            deleted_files = stats.deleted_files,
            deleted_dirs = stats.deleted_dirs,
            "committed stage"
        );
        Ok(stats)
    }

    /// Bring every transposed old file into the stage under its new path.
    ///
    /// An old file feeding several new paths is copied for all but the
    /// last, which takes the original by rename unless the old path itself
    /// stays in place.
    fn stage_transpositions(
        &self,
        transpositions: &[Transposition],
        untouched: &[usize],
    ) -> Result<()> {
        let kept: HashSet<&str> = untouched
            .iter()
            .map(|&i| self.source.files[i].path.as_str())
            .collect();

        let mut by_target: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for t in transpositions {
            by_target.entry(t.target_index).or_default().push(t.source_index);
        }

        for (target_index, sources) in by_target {
            let old_path = &self.target.files[target_index].path;
            let old = util::native_path(self.output, old_path);
            let last = sources.len() - 1;

            for (n, source_index) in sources.into_iter().enumerate() {
                let staged = util::native_path(self.stage, &self.source.files[source_index].path);
                if let Some(parent) = staged.parent() {
                    fs::create_dir_all(parent)?;
                }
                if n == last && !kept.contains(old_path.as_str()) {
                    place(&old, &staged)?;
                } else {
                    fs::copy(&old, &staged)?;
                }
            }
        }
        Ok(())
    }

    /// Remove old files and symlinks that have no place in the new tree,
    /// longest path first. Returns how many were actually on disk.
    fn delete_ghosts(&self) -> Result<usize> {
        let new_files: HashSet<&str> = self.source.files.iter().map(|f| f.path.as_str()).collect();
        let new_links: HashSet<&str> =
            self.source.symlinks.iter().map(|l| l.path.as_str()).collect();

        let mut ghosts: Vec<&str> = self
            .target
            .files
            .iter()
            .map(|f| f.path.as_str())
            .filter(|p| !new_files.contains(p))
            .chain(
                self.target
                    .symlinks
                    .iter()
                    .map(|l| l.path.as_str())
                    .filter(|p| !new_links.contains(p)),
            )
            .collect();
        ghosts.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let mut deleted = 0;
        for ghost in ghosts {
            match fs::remove_file(util::native_path(self.output, ghost)) {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }

    /// Remove old directories missing from the new tree, deepest first,
    /// but only those that ended up empty.
    fn delete_old_dirs(&self) -> Result<usize> {
        let new_dirs: HashSet<&str> = self.source.dirs.iter().map(|d| d.path.as_str()).collect();
        let mut old_dirs: Vec<String> = self
            .target
            .dirs
            .iter()
            .filter(|d| !new_dirs.contains(d.path.as_str()))
            .map(|d| d.path.clone())
            .collect();
        util::sort_deepest_first(&mut old_dirs);

        let mut deleted = 0;
        for dir in old_dirs {
            let path = util::native_path(self.output, &dir);
            let empty = match fs::read_dir(&path) {
                Ok(mut entries) => entries.next().is_none(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(e) => return Err(e.into()),
            };
            if empty {
                fs::remove_dir(&path)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Create every directory and symlink of `container` under `root`.
/// Symlinks that already point at the right place are left alone.
pub fn create_dirs_and_symlinks(container: &Container, root: &Path) -> Result<()> {
    for dir in &container.dirs {
        let path = util::native_path(root, &dir.path);
        fs::create_dir_all(&path)?;
        util::apply_mode(&path, dir.mode)?;
    }

    for link in &container.symlinks {
        let path = util::native_path(root, &link.path);
        match fs::read_link(&path) {
            Ok(dest) if dest.to_string_lossy().replace('\\', "/") == link.dest => continue,
            Ok(_) => fs::remove_file(&path)?,
            Err(_) if path.is_file() => fs::remove_file(&path)?,
            Err(_) => {}
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        util::create_symlink(&link.dest, &path)?;
    }
    Ok(())
}

/// Move `from` to `to`, replacing a file or symlink already there. Falls
/// back to copy and delete when a rename isn't possible.
fn place(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::symlink_metadata(to) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(to)?,
        _ => {}
    }
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}
