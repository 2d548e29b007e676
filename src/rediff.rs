//! Rediff: re-encode the files of an rsync patch as bsdiff deltas against
//! their closest relative in the old tree.
//!
//! Two passes over the same patch. [`RediffContext::analyze_patch`] reads the
//! ops and picks, per source file, the target file it reuses the most bytes
//! from. [`RediffContext::optimize_patch`] then writes a new patch where
//! those files carry bsdiff bodies and everything else is copied through.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use tracing::{debug, info};

use crate::bsdiff;
use crate::compression::{CompressionRegistry, CompressionSettings};
use crate::consumer::{CancellationToken, Consumer};
use crate::container::{Container, FileEntry};
use crate::error::{Error, Result};
use crate::patch_format::{PatchReader, PatchWriter, SyncHeaderKind, SyncOp};
use crate::pool::Pool;
use crate::signature::BLOCK_SIZE;

/// Files larger than this (on either side) keep their rsync ops.
pub const DEFAULT_REDIFF_SIZE_LIMIT: u64 = 256 * 1024 * 1024;

/// The target file a source file will be bsdiffed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffMapping {
    pub target_index: usize,
    pub bytes_in_common: u64,
}

/// Source file index to its mapping. Files without an entry stay rsync.
pub type DiffMappings = BTreeMap<usize, DiffMapping>;

/// Human-readable list of mappings, one `new <- old` line per file.
pub fn describe_mappings(
    mappings: &DiffMappings,
    target: &Container,
    source: &Container,
) -> String {
    let mut out = String::new();
    for (source_index, mapping) in mappings {
        let (Some(s), Some(t)) = (
            source.files.get(*source_index),
            target.files.get(mapping.target_index),
        ) else {
            continue;
        };
        out.push_str(&format!(
            "{} <- {} ({} bytes in common)\n",
            s.path, t.path, mapping.bytes_in_common
        ));
    }
    out
}

#[derive(Debug, Clone)]
pub struct RediffOptions {
    pub size_limit: u64,
    /// Compression of the rewritten patch. `None` keeps the input's.
    pub compression: Option<CompressionSettings>,
    /// Also map files the rsync ops already copy as one block range.
    pub force_map_all: bool,
    pub cancel: CancellationToken,
}

impl Default for RediffOptions {
    fn default() -> Self {
        Self {
            size_limit: DEFAULT_REDIFF_SIZE_LIMIT,
            compression: None,
            force_map_all: false,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RediffStats {
    pub bsdiff_files: usize,
    pub rsync_files: usize,
    /// Source bytes now described by bsdiff bodies.
    pub bsdiff_bytes: u64,
}

pub struct RediffContext<'a> {
    /// Old build, the one bsdiff bodies are relative to.
    pub target_pool: &'a dyn Pool,
    /// New build, read again to compute the deltas.
    pub source_pool: &'a dyn Pool,
    pub options: RediffOptions,
    pub registry: &'a CompressionRegistry,
    pub consumer: &'a dyn Consumer,
}

impl RediffContext<'_> {
    /// First pass: choose a bsdiff partner for every source file worth it.
    pub fn analyze_patch(&self, reader: impl Read) -> Result<DiffMappings> {
        let mut patch = PatchReader::open(reader, self.registry)?;
        let target = patch.target.clone();
        let source = patch.source.clone();
        let target_indices = target.file_indices_by_path();
        let total = source.size.max(1) as f64;

        let mut mappings = DiffMappings::new();
        let mut done = 0u64;

        for (source_index, file) in source.files.iter().enumerate() {
            self.options.cancel.check()?;
            self.consumer.progress_label(&file.path);
            self.consumer.progress(done as f64 / total);
            done += file.size;

            if patch.read_sync_header(source_index)? == SyncHeaderKind::Bsdiff {
                skip_bsdiff_body(&mut patch)?;
                continue;
            }

            let mut reused: BTreeMap<usize, u64> = BTreeMap::new();
            let (mut ranges, mut literals) = (0usize, 0usize);
            loop {
                match patch.read_op()? {
                    SyncOp::BlockRange {
                        file_index,
                        block_index,
                        block_span,
                    } => {
                        ranges += 1;
                        *reused.entry(file_index).or_default() +=
                            range_len(&target.files[file_index], block_index, block_span);
                    }
                    SyncOp::Data(_) => literals += 1,
                    SyncOp::HeyYouDidIt => break,
                }
            }

            // a single block range is a rename or an untouched file
            if ranges == 1 && literals == 0 && !self.options.force_map_all {
                continue;
            }

            let limit = self.options.size_limit;
            if let Some(mapping) = pick_mapping(file, &reused, &target, &target_indices, limit) {
                mappings.insert(source_index, mapping);
            }
        }

        debug!(mapped = mappings.len(), "analyzed patch");
        Ok(mappings)
    }

    /// Second pass: rewrite the patch with bsdiff bodies for `mappings`.
    pub fn optimize_patch(
        &self,
        reader: impl Read,
        writer: impl Write,
        mappings: &DiffMappings,
    ) -> Result<RediffStats> {
        let mut patch = PatchReader::open(reader, self.registry)?;
        let target = patch.target.clone();
        let source = patch.source.clone();
        let compression = self.options.compression.unwrap_or(patch.compression);
        let digests = patch.target_digests.clone();
        let mut out =
            PatchWriter::new(writer, &target, &source, &digests, &compression, self.registry)?;

        let mut total = 0u64;
        for (source_index, mapping) in mappings {
            let (Some(file), true) = (
                source.files.get(*source_index),
                mapping.target_index < target.files.len(),
            ) else {
                return Err(Error::InvalidOptions(format!(
                    "diff mapping {} <- {} does not fit this patch",
                    source_index, mapping.target_index
                )));
            };
            total += file.size;
        }
        let total = total.max(1) as f64;

        let mut stats = RediffStats::default();
        for (source_index, file) in source.files.iter().enumerate() {
            self.options.cancel.check()?;
            let kind = patch.read_sync_header(source_index)?;

            match (kind, mappings.get(&source_index)) {
                (SyncHeaderKind::Rsync, Some(mapping)) => {
                    while patch.read_op()? != SyncOp::HeyYouDidIt {}

                    self.consumer.progress_label(&file.path);
                    let old = self.target_pool.load(mapping.target_index)?;
                    let new = self.source_pool.load(source_index)?;
                    check_len(&target.files[mapping.target_index], old.len())?;
                    check_len(file, new.len())?;

                    out.write_sync_header(SyncHeaderKind::Bsdiff, source_index)?;
                    out.write_bsdiff_header(mapping.target_index)?;
                    bsdiff::diff(&old, &new, &mut |control| out.write_control(&control))?;
                    out.write_op(&SyncOp::HeyYouDidIt)?;

                    stats.bsdiff_files += 1;
                    stats.bsdiff_bytes += file.size;
                    self.consumer.progress(stats.bsdiff_bytes as f64 / total);
                }
                (SyncHeaderKind::Rsync, None) => {
                    out.write_sync_header(SyncHeaderKind::Rsync, source_index)?;
                    loop {
                        let op = patch.read_op()?;
                        out.write_op(&op)?;
                        if op == SyncOp::HeyYouDidIt {
                            break;
                        }
                    }
                    stats.rsync_files += 1;
                }
                (SyncHeaderKind::Bsdiff, _) => {
                    let target_index = patch.read_bsdiff_header()?;
                    out.write_sync_header(SyncHeaderKind::Bsdiff, source_index)?;
                    out.write_bsdiff_header(target_index)?;
                    loop {
                        let control = patch.read_control()?;
                        out.write_control(&control)?;
                        if control.eof {
                            break;
                        }
                    }
                    patch.expect_sentinel()?;
                    out.write_op(&SyncOp::HeyYouDidIt)?;
                    stats.bsdiff_files += 1;
                }
            }
        }

        out.close()?;
        self.consumer.progress(1.0);
        info!(
            bsdiff_files = stats.bsdiff_files,
            rsync_files = stats.rsync_files,
            "rediffed patch"
        );
        Ok(stats)
    }
}

/// Bytes a block range copies out of `file`.
pub(crate) fn range_len(file: &FileEntry, block_index: u64, block_span: u64) -> u64 {
    let start = block_index.saturating_mul(BLOCK_SIZE).min(file.size);
    block_span.saturating_mul(BLOCK_SIZE).min(file.size - start)
}

/// Consume a bsdiff body up to and including its sentinel.
pub(crate) fn skip_bsdiff_body(patch: &mut PatchReader<'_>) -> Result<()> {
    patch.read_bsdiff_header()?;
    while !patch.read_control()?.eof {}
    patch.expect_sentinel()
}

fn pick_mapping(
    file: &FileEntry,
    reused: &BTreeMap<usize, u64>,
    target: &Container,
    target_indices: &HashMap<&str, usize>,
    size_limit: u64,
) -> Option<DiffMapping> {
    if file.size == 0 || file.size > size_limit {
        return None;
    }

    let mut best: Option<DiffMapping> = None;
    for (&target_index, &bytes) in reused {
        let same_path = target.files[target_index].path == file.path;
        let better = match best {
            None => true,
            Some(b) => bytes > b.bytes_in_common || (bytes == b.bytes_in_common && same_path),
        };
        if better {
            best = Some(DiffMapping {
                target_index,
                bytes_in_common: bytes,
            });
        }
    }

    // nothing reused, but a same-named file may still diff well
    if best.is_none() {
        best = target_indices
            .get(file.path.as_str())
            .filter(|&&i| target.files[i].size > 0)
            .map(|&target_index| DiffMapping {
                target_index,
                bytes_in_common: 0,
            });
    }

    best.filter(|m| target.files[m.target_index].size <= size_limit)
}

fn check_len(file: &FileEntry, actual: usize) -> Result<()> {
    if actual as u64 != file.size {
        return Err(Error::Integrity(format!(
            "{} is {} bytes, the patch expects {}",
            file.path, actual, file.size
        )));
    }
    Ok(())
}
