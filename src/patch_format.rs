//! Messages and magic numbers of the patch, signature and wounds files.
//!
//! Every file starts with a little-endian i32 magic, then an uncompressed
//! header message, then a (possibly compressed) stream of messages. See
//! [`crate::wire`] for the framing.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::compression::{CompressionRegistry, CompressionSettings, WireCompression};
use crate::container::Container;
use crate::error::{Error, Result};
use crate::signature::{num_blocks, FileDigest};
use crate::wire::{WireReader, WireWriter};

pub const PATCH_MAGIC: i32 = 0x0FEF_5F00;
pub const SIGNATURE_MAGIC: i32 = PATCH_MAGIC + 1;
pub const WOUNDS_MAGIC: i32 = PATCH_MAGIC + 3;

/// Largest literal carried by a single DATA op.
pub const MAX_DATA_OP: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchHeader {
    pub compression: WireCompression,
}

/// Follows the containers: what every target file hashed to when the
/// patch was made. Empty when the writer had no signature to take it from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDigests {
    pub digests: Vec<FileDigest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureHeader {
    pub compression: WireCompression,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WoundsHeader {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncHeaderKind {
    /// Followed by block-range/data ops.
    Rsync,
    /// Followed by a [`BsdiffHeader`] and bsdiff control messages.
    Bsdiff,
}

/// Opens the op sequence of one source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHeader {
    pub kind: SyncHeaderKind,
    pub file_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOp {
    /// Copy `block_span` whole blocks of target file `file_index`, starting
    /// at `block_index`.
    BlockRange {
        file_index: usize,
        block_index: u64,
        block_span: u64,
    },
    /// Literal bytes.
    Data(Vec<u8>),
    /// Ends a file's op sequence.
    HeyYouDidIt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BsdiffHeader {
    /// Target file the bsdiff body is relative to.
    pub target_index: usize,
}

/// One bsdiff step: add `add` bytewise to the old bytes under the cursor,
/// append `copy` verbatim, then move the old cursor by `seek`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BsdiffControl {
    pub add: Vec<u8>,
    pub copy: Vec<u8>,
    pub seek: i64,
    pub eof: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHashMessage {
    pub weak_hash: u32,
    pub strong_hash: [u8; 32],
}

/// Writes a patch: header, both containers and the target digests, then
/// per-file sections.
pub struct PatchWriter<'a> {
    wire: WireWriter<'a>,
}

impl<'a> PatchWriter<'a> {
    pub fn new(
        writer: impl Write + 'a,
        target: &Container,
        source: &Container,
        target_digests: &[FileDigest],
        settings: &CompressionSettings,
        registry: &CompressionRegistry,
    ) -> Result<Self> {
        registry.check(settings)?;
        if !target_digests.is_empty() && target_digests.len() != target.files.len() {
            return Err(Error::InvalidOptions(format!(
                "{} target digests for {} target files",
                target_digests.len(),
                target.files.len()
            )));
        }
        let mut wire = WireWriter::new(writer);
        wire.write_magic(PATCH_MAGIC)?;
        wire.write_message(&PatchHeader {
            compression: (*settings).into(),
        })?;
        let mut wire = wire.compress(settings, registry)?;
        wire.write_message(target)?;
        wire.write_message(source)?;
        wire.write_message(&TargetDigests {
            digests: target_digests.to_vec(),
        })?;
        Ok(Self { wire })
    }

    pub fn write_sync_header(&mut self, kind: SyncHeaderKind, file_index: usize) -> Result<()> {
        self.wire.write_message(&SyncHeader { kind, file_index })
    }

    pub fn write_op(&mut self, op: &SyncOp) -> Result<()> {
        self.wire.write_message(op)
    }

    pub fn write_bsdiff_header(&mut self, target_index: usize) -> Result<()> {
        self.wire.write_message(&BsdiffHeader { target_index })
    }

    pub fn write_control(&mut self, control: &BsdiffControl) -> Result<()> {
        self.wire.write_message(control)
    }

    pub fn close(self) -> Result<()> {
        self.wire.close()
    }
}

/// Reads a patch back, checking structure as it goes.
pub struct PatchReader<'a> {
    wire: WireReader<'a>,
    pub compression: CompressionSettings,
    pub target: Container,
    pub source: Container,
    /// Empty, or one digest per target file.
    pub target_digests: Vec<FileDigest>,
}

impl<'a> PatchReader<'a> {
    pub fn open(reader: impl Read + 'a, registry: &CompressionRegistry) -> Result<Self> {
        let mut wire = WireReader::new(reader);
        wire.expect_magic(PATCH_MAGIC)?;
        let header: PatchHeader = wire.read_message()?;
        let compression = CompressionSettings::try_from(header.compression)?;
        let mut wire = wire.decompress(&compression, registry)?;
        let target: Container = wire.read_message()?;
        let source = wire.read_message()?;
        let TargetDigests { digests } = wire.read_message()?;
        if !digests.is_empty() && digests.len() != target.files.len() {
            return Err(Error::malformed(format!(
                "patch carries {} target digests for {} target files",
                digests.len(),
                target.files.len()
            )));
        }
        Ok(Self {
            wire,
            compression,
            target,
            source,
            target_digests: digests,
        })
    }

    /// Read the header opening source file `expected_index`.
    pub fn read_sync_header(&mut self, expected_index: usize) -> Result<SyncHeaderKind> {
        let header: SyncHeader = self.wire.read_message()?;
        if header.file_index != expected_index {
            return Err(Error::malformed(format!(
                "expected sync header for file {}, got {}",
                expected_index, header.file_index
            )));
        }
        Ok(header.kind)
    }

    pub fn read_op(&mut self) -> Result<SyncOp> {
        let op: SyncOp = self.wire.read_message()?;
        if let SyncOp::BlockRange {
            file_index,
            block_index,
            block_span,
        } = op
        {
            let Some(file) = self.target.files.get(file_index) else {
                return Err(Error::malformed(format!(
                    "block range refers to target file {} of {}",
                    file_index,
                    self.target.files.len()
                )));
            };
            let blocks = num_blocks(file.size);
            if block_index.checked_add(block_span).is_none_or(|end| end > blocks) {
                return Err(Error::malformed(format!(
                    "block range {}+{} is outside {} ({} blocks)",
                    block_index, block_span, file.path, blocks
                )));
            }
        }
        Ok(op)
    }

    pub fn read_bsdiff_header(&mut self) -> Result<usize> {
        let header: BsdiffHeader = self.wire.read_message()?;
        if header.target_index >= self.target.files.len() {
            return Err(Error::malformed(format!(
                "bsdiff header refers to target file {} of {}",
                header.target_index,
                self.target.files.len()
            )));
        }
        Ok(header.target_index)
    }

    pub fn read_control(&mut self) -> Result<BsdiffControl> {
        self.wire.read_message()
    }

    /// Consume the sentinel closing a file section.
    pub fn expect_sentinel(&mut self) -> Result<()> {
        match self.wire.read_message::<SyncOp>()? {
            SyncOp::HeyYouDidIt => Ok(()),
            other => Err(Error::malformed(format!(
                "expected end of file ops, got {}",
                op_name(&other)
            ))),
        }
    }
}

pub fn op_name(op: &SyncOp) -> &'static str {
    match op {
        SyncOp::BlockRange { .. } => "block range",
        SyncOp::Data(_) => "data",
        SyncOp::HeyYouDidIt => "sentinel",
    }
}
