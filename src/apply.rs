//! Apply engine: rebuild the new tree from a patch and the old tree.
//!
//! Fresh applies write straight into the output directory. In-place
//! applies rebuild changed files into a stage directory and only touch the
//! live tree once every file has been rebuilt (see [`crate::overlay`]).

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::binary_patch::OpApplier;
use crate::bsdiff;
use crate::checkpoint::{AfterSave, CheckpointStore};
use crate::compression::CompressionRegistry;
use crate::consumer::{CancellationToken, Consumer};
use crate::container::{Container, FileEntry};
use crate::error::{Error, Result};
use crate::healer::LockMap;
use crate::overlay::{self, CommitPlan, Overlay, Transposition};
use crate::patch_format::{PatchReader, SyncHeaderKind, SyncOp};
use crate::pool::{FsPool, Pool, WritablePool};
use crate::signature::{self, num_blocks, FileDigest, SignatureInfo};
use crate::util::{self, CountingWriter};
use crate::validator::ValidatingPool;
use crate::wounds::{with_wounds_consumer, WoundsConsumer, WoundsGuardian};

/// Last word before anything is touched: gets the old and new containers
/// and may refuse with a reason.
pub type VetApply =
    Box<dyn Fn(&Container, &Container) -> std::result::Result<(), String> + Send + Sync>;

#[derive(Default)]
pub struct ApplyOptions {
    /// Patch the target directory itself instead of writing a fresh copy.
    pub in_place: bool,
    /// Where in-place rebuilds go. Defaults to `<output>-stage` next to the
    /// output directory.
    pub stage_path: Option<PathBuf>,
    pub vet_apply: Option<VetApply>,
    pub checkpoint: Option<Arc<dyn CheckpointStore>>,
    /// Released file by file as outputs become final.
    pub lock_map: Option<Arc<LockMap>>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub touched_files: usize,
    pub noop_files: usize,
    pub moved_files: usize,
    pub deleted_files: usize,
    pub deleted_dirs: usize,
}

#[derive(Serialize, Deserialize)]
struct ApplyCheckpoint {
    /// Hash of both containers, so a checkpoint never resumes another patch.
    patch_id: [u8; 32],
    next_file: usize,
}

/// What became of one source file.
enum Outcome {
    Rebuilt,
    Untouched,
    Moved(usize),
}

pub struct ApplyContext<'a> {
    /// The old tree.
    pub target_path: &'a Path,
    /// Where the new tree goes. Must equal `target_path` for in-place.
    pub output_path: &'a Path,
    /// Signature of the new tree. When set, every written byte is checked.
    pub signature: Option<&'a SignatureInfo>,
    /// Receives wounds found while writing. Without one, the first wound
    /// fails the apply.
    pub wounds_consumer: Option<Box<dyn WoundsConsumer + 'a>>,
    pub options: ApplyOptions,
    pub registry: &'a CompressionRegistry,
    pub consumer: &'a dyn Consumer,
}

impl<'a> ApplyContext<'a> {
    pub fn apply_patch(&mut self, reader: impl Read) -> Result<ApplyStats> {
        let in_place = self.options.in_place;
        if in_place != (self.target_path == self.output_path) {
            return Err(Error::InvalidOptions(if in_place {
                "in-place apply writes to the target directory, output must be the same".into()
            } else {
                "output is the target directory, use in-place apply".into()
            }));
        }
        if in_place && self.signature.is_some() && self.options.lock_map.is_some() {
            return Err(Error::InvalidOptions(
                "an in-place apply releases its lock map only after the commit, \
                 it can't also validate writes for a consumer waiting on it"
                    .into(),
            ));
        }

        let mut patch = PatchReader::open(reader, self.registry)?;
        let target = patch.target.clone();
        let source = patch.source.clone();
        debug!(old = %target.stats(), new = %source.stats(), in_place, "applying patch");

        if let Some(signature) = self.signature {
            signature.container.ensure_equal(&source).map_err(|e| {
                Error::InvalidOptions(format!(
                    "signature does not describe the patched tree: {}",
                    e
                ))
            })?;
        }
        if let Some(vet) = &self.options.vet_apply {
            vet(&target, &source).map_err(Error::Vetoed)?;
        }

        let missing = self.check_target(&target)?;
        let patch_id = patch_id(&target, &source)?;
        let resume_from = self.resume_point(&patch_id)?;

        let stage = if in_place { Some(self.stage_path()?) } else { None };
        let out_root = stage.as_deref().unwrap_or(self.output_path);
        if let (Some(stage), 0) = (&stage, resume_from) {
            match fs::remove_dir_all(stage) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        fs::create_dir_all(out_root)?;
        if !in_place {
            overlay::create_dirs_and_symlinks(&source, self.output_path)?;
        }

        let target_pool = FsPool::new(&target, self.target_path);
        let out_pool = FsPool::new(&source, out_root);
        let target_digests = patch.target_digests.clone();
        let mut wounds = self.wounds_consumer.take();
        let run = FileRun {
            ctx: self,
            target: &target,
            source: &source,
            target_pool: &target_pool,
            missing: &missing,
            target_digests: &target_digests,
            verified: RefCell::new(HashSet::new()),
            patch_id,
            resume_from,
        };

        let result = match self.signature {
            Some(signature) => {
                let mut guardian = WoundsGuardian::default();
                let wounds_consumer: &mut dyn WoundsConsumer = match wounds.as_deref_mut() {
                    Some(w) => w,
                    None => &mut guardian,
                };
                with_wounds_consumer(&signature.container, wounds_consumer, |tx| {
                    let validating = ValidatingPool::new(&out_pool, signature, tx)?;
                    run.apply_files(&mut patch, &validating)
                })
            }
            None => run.apply_files(&mut patch, &out_pool),
        };
        self.wounds_consumer = wounds;
        let (plan, mut stats) = result?;

        if let Some(stage) = &stage {
            let committed = Overlay {
                target: &target,
                source: &source,
                output: self.output_path,
                stage,
            }
            .commit(&plan)?;
            stats.deleted_files = committed.deleted_files;
            stats.deleted_dirs = committed.deleted_dirs;
        }

        if let Some(lock_map) = &self.options.lock_map {
            lock_map.release_all();
        }
        self.consumer.progress(1.0);
        info!(
            touched = stats.touched_files,
            noop = stats.noop_files,
            moved = stats.moved_files,
            deleted_files = stats.deleted_files,
            deleted_dirs = stats.deleted_dirs,
            "applied patch"
        );
        Ok(stats)
    }

    /// Every old file present on disk must have the size the patch was
    /// made against. Returns the indices of old files that are missing.
    fn check_target(&self, target: &Container) -> Result<HashSet<usize>> {
        let mut missing = HashSet::new();
        for (index, file) in target.files.iter().enumerate() {
            match fs::metadata(util::native_path(self.target_path, &file.path)) {
                Ok(meta) if meta.len() == file.size => {}
                Ok(meta) => {
                    return Err(Error::Integrity(format!(
                        "{} is {} bytes on disk, the patch expects {}",
                        file.path,
                        meta.len(),
                        file.size
                    )))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    missing.insert(index);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(missing)
    }

    fn resume_point(&self, patch_id: &[u8; 32]) -> Result<usize> {
        let Some(store) = &self.options.checkpoint else {
            return Ok(0);
        };
        let Some(blob) = store.load()? else {
            return Ok(0);
        };
        match bincode::deserialize::<ApplyCheckpoint>(&blob) {
            Ok(checkpoint) if &checkpoint.patch_id == patch_id => {
                info!(next_file = checkpoint.next_file, "resuming apply from checkpoint");
                Ok(checkpoint.next_file)
            }
            _ => {
                warn!("ignoring a checkpoint that belongs to another patch");
                Ok(0)
            }
        }
    }

    fn stage_path(&self) -> Result<PathBuf> {
        if let Some(stage) = &self.options.stage_path {
            return Ok(stage.clone());
        }
        let name = self.output_path.file_name().ok_or_else(|| {
            Error::InvalidOptions(format!(
                "can't derive a stage directory from {}",
                self.output_path.display()
            ))
        })?;
        let mut stage = name.to_os_string();
        stage.push("-stage");
        Ok(self.output_path.with_file_name(stage))
    }
}

fn patch_id(target: &Container, source: &Container) -> Result<[u8; 32]> {
    let bytes = bincode::serialize(&(target, source))?;
    Ok(*blake3::hash(&bytes).as_bytes())
}

/// The op-replaying part of an apply, over whichever writable pool the
/// caller set up.
struct FileRun<'r, 'a> {
    ctx: &'r ApplyContext<'a>,
    target: &'r Container,
    source: &'r Container,
    target_pool: &'r FsPool,
    missing: &'r HashSet<usize>,
    /// Empty when the patch carries none.
    target_digests: &'r [FileDigest],
    /// Old files already checked against their digest.
    verified: RefCell<HashSet<usize>>,
    patch_id: [u8; 32],
    resume_from: usize,
}

impl FileRun<'_, '_> {
    fn apply_files(
        &self,
        patch: &mut PatchReader<'_>,
        out_pool: &dyn WritablePool,
    ) -> Result<(CommitPlan, ApplyStats)> {
        let options = &self.ctx.options;
        let consumer = self.ctx.consumer;
        let total = self.source.size.max(1) as f64;

        let mut applier = OpApplier::new(self.target_pool);
        let mut plan = CommitPlan::default();
        let mut stats = ApplyStats::default();
        let mut done = 0u64;
        let mut since_save = 0u64;

        for (index, file) in self.source.files.iter().enumerate() {
            if options.cancel.is_cancelled() {
                if let Some(store) = &options.checkpoint {
                    store.save(&self.checkpoint_blob(index)?)?;
                }
                return Err(Error::Cancelled);
            }
            consumer.progress_label(&file.path);

            let write = index >= self.resume_from;
            let base = done;
            let mut on_write = |n: u64| consumer.progress((base + n) as f64 / total);
            let out = write.then_some(out_pool);
            match self.apply_file(patch, index, file, out, &mut applier, &mut on_write)? {
                Outcome::Rebuilt => {
                    stats.touched_files += 1;
                    if options.in_place {
                        plan.staged.push(index);
                    } else if let Some(lock_map) = &options.lock_map {
                        lock_map.release(index);
                    }
                }
                Outcome::Untouched => {
                    stats.noop_files += 1;
                    plan.untouched.push(index);
                    if let Some(lock_map) = &options.lock_map {
                        lock_map.release(index);
                    }
                }
                Outcome::Moved(target_index) => {
                    stats.moved_files += 1;
                    plan.transpositions.push(Transposition {
                        target_index,
                        source_index: index,
                    });
                }
            }

            done += file.size;
            since_save += file.size;
            consumer.progress(done as f64 / total);

            if let Some(store) = &options.checkpoint {
                if store.should_save(since_save) {
                    since_save = 0;
                    if store.save(&self.checkpoint_blob(index + 1)?)? == AfterSave::Stop {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }

        Ok((plan, stats))
    }

    /// Replay one file's section. `out` is `None` when the file was already
    /// written by a run this one resumes; its ops are read and dropped.
    fn apply_file(
        &self,
        patch: &mut PatchReader<'_>,
        index: usize,
        file: &FileEntry,
        out: Option<&dyn WritablePool>,
        applier: &mut OpApplier<'_>,
        on_write: &mut dyn FnMut(u64),
    ) -> Result<Outcome> {
        match patch.read_sync_header(index)? {
            SyncHeaderKind::Rsync => {
                let mut pending = VecDeque::from([self.read_op(patch)?]);

                if self.ctx.options.in_place {
                    if let Some(target_index) = self.whole_file_copy(&pending[0], file) {
                        let next = self.read_op(patch)?;
                        if next == SyncOp::HeyYouDidIt {
                            return self.reuse(target_index, file);
                        }
                        pending.push_back(next);
                    }
                }

                let mut next_op = || match pending.pop_front() {
                    Some(op) => Ok(op),
                    None => self.read_op(patch),
                };

                let Some(out) = out else {
                    while next_op()? != SyncOp::HeyYouDidIt {}
                    return Ok(Outcome::Rebuilt);
                };

                let mut writer = out.writer(index)?;
                let mut counting = CountingWriter::new(&mut writer, progress_within(on_write));
                let mut written = 0u64;
                loop {
                    let op = next_op()?;
                    if op == SyncOp::HeyYouDidIt {
                        break;
                    }
                    written += applier.apply(&op, &mut counting)?;
                }
                counting.flush()?;
                drop(counting);
                check_rebuilt_len(file, written)?;
                writer.finish()?;
                Ok(Outcome::Rebuilt)
            }
            SyncHeaderKind::Bsdiff => {
                let target_index = patch.read_bsdiff_header()?;
                self.verify_old(target_index)?;

                let Some(out) = out else {
                    while !patch.read_control()?.eof {}
                    patch.expect_sentinel()?;
                    return Ok(Outcome::Rebuilt);
                };

                let old = self.target_pool.load(target_index)?;
                let mut writer = out.writer(index)?;
                let mut counting = CountingWriter::new(&mut writer, progress_within(on_write));
                let written = bsdiff::apply(&old, &mut || patch.read_control(), &mut counting)?;
                counting.flush()?;
                drop(counting);
                patch.expect_sentinel()?;
                check_rebuilt_len(file, written)?;
                writer.finish()?;
                Ok(Outcome::Rebuilt)
            }
        }
    }

    fn read_op(&self, patch: &mut PatchReader<'_>) -> Result<SyncOp> {
        let op = patch.read_op()?;
        if let SyncOp::BlockRange { file_index, .. } = op {
            self.verify_old(file_index)?;
        }
        Ok(op)
    }

    /// Before an old file is first read, make sure it still is the file the
    /// patch was made against.
    fn verify_old(&self, target_index: usize) -> Result<()> {
        let Some(expected) = self.target_digests.get(target_index) else {
            return Ok(());
        };
        if self.missing.contains(&target_index) {
            return Ok(());
        }
        if !self.verified.borrow_mut().insert(target_index) {
            return Ok(());
        }

        let mut reader = self.target_pool.reader(target_index)?;
        let hashes = signature::hash_file(target_index, &mut reader, &mut |_| {})?;
        if signature::file_digest(&hashes) != *expected {
            return Err(Error::Integrity(format!(
                "{} is not the file this patch was made against",
                self.target.files[target_index].path
            )));
        }
        Ok(())
    }

    /// Target file a lone op copies in full, if the result is that file
    /// byte for byte.
    fn whole_file_copy(&self, op: &SyncOp, file: &FileEntry) -> Option<usize> {
        let SyncOp::BlockRange {
            file_index,
            block_index: 0,
            block_span,
        } = *op
        else {
            return None;
        };
        let old = self.target.files.get(file_index)?;
        let whole = file.size > 0 && old.size == file.size && block_span == num_blocks(old.size);
        whole.then_some(file_index)
    }

    fn reuse(&self, target_index: usize, file: &FileEntry) -> Result<Outcome> {
        let old = &self.target.files[target_index];
        if self.missing.contains(&target_index) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is missing from {}", old.path, self.ctx.target_path.display()),
            )
            .into());
        }
        Ok(if old.path == file.path {
            Outcome::Untouched
        } else {
            Outcome::Moved(target_index)
        })
    }

    fn checkpoint_blob(&self, next_file: usize) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&ApplyCheckpoint {
            patch_id: self.patch_id,
            next_file,
        })?)
    }
}

/// Turn per-write byte counts into a running total for `on_write`.
fn progress_within(on_write: &mut dyn FnMut(u64)) -> impl FnMut(u64) + '_ {
    let mut written = 0u64;
    move |n| {
        written += n;
        on_write(written);
    }
}

fn check_rebuilt_len(file: &FileEntry, written: u64) -> Result<()> {
    if written != file.size {
        return Err(Error::malformed(format!(
            "{} rebuilt to {} bytes, the patch says {}",
            file.path, written, file.size
        )));
    }
    Ok(())
}
