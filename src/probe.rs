//! Read a patch end to end without applying it and describe what's inside.

use std::io::Read;

use crate::compression::{CompressionRegistry, CompressionSettings};
use crate::container::Container;
use crate::error::Result;
use crate::patch_format::{PatchReader, SyncHeaderKind, SyncOp};
use crate::rediff::range_len;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub path: String,
    pub kind: SyncHeaderKind,
    /// Rsync: bytes copied from old blocks. Bsdiff: bytes added onto old bytes.
    pub reused_bytes: u64,
    /// Bytes carried literally.
    pub fresh_bytes: u64,
    /// Old file a bsdiff body is relative to.
    pub bsdiff_target: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct PatchSummary {
    pub compression: CompressionSettings,
    pub target: Container,
    pub source: Container,
    pub files: Vec<FileSummary>,
}

impl PatchSummary {
    pub fn reused_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.reused_bytes).sum()
    }

    pub fn fresh_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.fresh_bytes).sum()
    }

    pub fn bsdiff_files(&self) -> usize {
        self.files.iter().filter(|f| f.kind == SyncHeaderKind::Bsdiff).count()
    }
}

/// Decode every message of a patch, failing exactly where an apply would
/// on malformed input.
pub fn probe_patch(reader: impl Read, registry: &CompressionRegistry) -> Result<PatchSummary> {
    let mut patch = PatchReader::open(reader, registry)?;
    let target = patch.target.clone();
    let source = patch.source.clone();
    let mut files = Vec::with_capacity(source.files.len());

    for (index, file) in source.files.iter().enumerate() {
        let kind = patch.read_sync_header(index)?;
        let mut summary = FileSummary {
            path: file.path.clone(),
            kind,
            reused_bytes: 0,
            fresh_bytes: 0,
            bsdiff_target: None,
        };

        match kind {
            SyncHeaderKind::Rsync => loop {
                match patch.read_op()? {
                    SyncOp::BlockRange {
                        file_index,
                        block_index,
                        block_span,
                    } => {
                        let file = &target.files[file_index];
                        summary.reused_bytes += range_len(file, block_index, block_span);
                    }
                    SyncOp::Data(data) => summary.fresh_bytes += data.len() as u64,
                    SyncOp::HeyYouDidIt => break,
                }
            },
            SyncHeaderKind::Bsdiff => {
                summary.bsdiff_target = Some(patch.read_bsdiff_header()?);
                loop {
                    let control = patch.read_control()?;
                    summary.reused_bytes += control.add.len() as u64;
                    summary.fresh_bytes += control.copy.len() as u64;
                    if control.eof {
                        break;
                    }
                }
                patch.expect_sentinel()?;
            }
        }
        files.push(summary);
    }

    Ok(PatchSummary {
        compression: patch.compression,
        target,
        source,
        files,
    })
}
