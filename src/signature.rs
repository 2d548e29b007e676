//! Per-block content hashes for every file in a container.

use rayon::prelude::*;
use std::io::{Read, Write};

use crate::compression::{CompressionRegistry, CompressionSettings};
use crate::consumer::Consumer;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::patch_format::{BlockHashMessage, SignatureHeader, SIGNATURE_MAGIC};
use crate::pool::Pool;
use crate::rolling_hash;
use crate::wire::{WireReader, WireWriter};

pub const BLOCK_SIZE: u64 = 64 * 1024;

/// Blocks hashed together in one rayon batch.
const HASH_BATCH_BLOCKS: usize = 16;

pub type StrongHash = [u8; 32];

/// Fingerprint of a whole file: blake3 over the strong hashes of its blocks.
pub type FileDigest = [u8; 32];

/// Number of blocks a file of `size` bytes spans. Zero for empty files.
pub fn num_blocks(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE)
}

/// Number of hashes a file contributes to a signature: empty files still
/// get one zero-length block.
pub fn num_hashes(size: u64) -> u64 {
    num_blocks(size).max(1)
}

/// Length of block `block_index` in a file of `file_size` bytes.
pub fn block_len(file_size: u64, block_index: u64) -> u64 {
    file_size
        .saturating_sub(block_index.saturating_mul(BLOCK_SIZE))
        .min(BLOCK_SIZE)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHash {
    pub file_index: usize,
    pub block_index: u64,
    pub weak_hash: u32,
    pub strong_hash: StrongHash,
    /// Length of the block when it is shorter than `BLOCK_SIZE`, else 0.
    pub short_size: u32,
}

pub fn hash_block(data: &[u8]) -> (u32, StrongHash) {
    (rolling_hash::weak_hash(data), *blake3::hash(data).as_bytes())
}

fn short_size_of(len: usize) -> u32 {
    if len as u64 >= BLOCK_SIZE {
        0
    } else {
        len as u32
    }
}

/// Container plus the hash of every block of every file, in file-then-block
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureInfo {
    pub container: Container,
    pub hashes: Vec<BlockHash>,
}

impl SignatureInfo {
    /// Split the hash list into one slice per file.
    pub fn hash_groups(&self) -> Result<Vec<&[BlockHash]>> {
        let mut groups = Vec::with_capacity(self.container.files.len());
        let mut start = 0usize;
        for file in &self.container.files {
            let count = num_hashes(file.size) as usize;
            let end = start + count;
            if end > self.hashes.len() {
                return Err(Error::malformed(format!(
                    "signature has {} hashes, container needs more",
                    self.hashes.len()
                )));
            }
            groups.push(&self.hashes[start..end]);
            start = end;
        }
        if start != self.hashes.len() {
            return Err(Error::malformed(format!(
                "signature has {} hashes, container needs {}",
                self.hashes.len(),
                start
            )));
        }
        Ok(groups)
    }

    /// One [`file_digest`] per file, in container order.
    pub fn file_digests(&self) -> Result<Vec<FileDigest>> {
        Ok(self.hash_groups()?.into_iter().map(file_digest).collect())
    }
}

pub fn file_digest(hashes: &[BlockHash]) -> FileDigest {
    let mut hasher = blake3::Hasher::new();
    for hash in hashes {
        hasher.update(&hash.strong_hash);
    }
    *hasher.finalize().as_bytes()
}

/// Hash every block read from `reader` until EOF.
///
/// `on_bytes` is told how many bytes each batch consumed.
pub fn hash_file(
    file_index: usize,
    reader: &mut dyn Read,
    on_bytes: &mut dyn FnMut(u64),
) -> Result<Vec<BlockHash>> {
    let mut hashes = Vec::new();
    let mut buf = vec![0u8; HASH_BATCH_BLOCKS * BLOCK_SIZE as usize];
    let mut block_index = 0u64;

    loop {
        let filled = fill(reader, &mut buf)?;
        if filled == 0 {
            break;
        }

        let batch: Vec<(u32, StrongHash, u32)> = buf[..filled]
            .par_chunks(BLOCK_SIZE as usize)
            .map(|chunk| {
                let (weak, strong) = hash_block(chunk);
                (weak, strong, short_size_of(chunk.len()))
            })
            .collect();

        for (weak_hash, strong_hash, short_size) in batch {
            hashes.push(BlockHash {
                file_index,
                block_index,
                weak_hash,
                strong_hash,
                short_size,
            });
            block_index += 1;
        }
        on_bytes(filled as u64);

        if filled < buf.len() {
            break;
        }
    }

    if hashes.is_empty() {
        let (weak_hash, strong_hash) = hash_block(&[]);
        hashes.push(BlockHash {
            file_index,
            block_index: 0,
            weak_hash,
            strong_hash,
            short_size: 0,
        });
    }

    Ok(hashes)
}

/// Read until `buf` is full or the reader is exhausted.
pub(crate) fn fill(reader: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Hash every file of `container`, reading each one exactly once from `pool`.
pub fn compute_signature(
    container: &Container,
    pool: &dyn Pool,
    consumer: &dyn Consumer,
) -> Result<Vec<BlockHash>> {
    let total = container.size.max(1) as f64;
    let mut done = 0u64;
    let mut hashes = Vec::new();

    for (file_index, file) in container.files.iter().enumerate() {
        consumer.progress_label(&file.path);
        let mut reader = pool.reader(file_index)?;
        let mut on_bytes = |n: u64| {
            done += n;
            consumer.progress(done as f64 / total);
        };
        hashes.extend(hash_file(file_index, &mut reader, &mut on_bytes)?);
    }

    Ok(hashes)
}

/// Fail with an integrity error at the first block where `actual` differs
/// from `reference`.
pub fn compare_hashes(reference: &SignatureInfo, actual: &[BlockHash]) -> Result<()> {
    if reference.hashes.len() != actual.len() {
        return Err(Error::Integrity(format!(
            "expected {} block hashes, got {}",
            reference.hashes.len(),
            actual.len()
        )));
    }

    for (expected, got) in reference.hashes.iter().zip(actual) {
        if expected.weak_hash != got.weak_hash || expected.strong_hash != got.strong_hash {
            let path = reference
                .container
                .files
                .get(expected.file_index)
                .map_or("?", |f| f.path.as_str());
            return Err(Error::Integrity(format!(
                "{} differs at block {}",
                path, expected.block_index
            )));
        }
    }

    Ok(())
}

/// Streams a signature file: header and container up front, then hashes as
/// they become available.
pub struct SignatureWriter<'a> {
    wire: WireWriter<'a>,
}

impl<'a> SignatureWriter<'a> {
    pub fn new(
        writer: impl Write + 'a,
        container: &Container,
        settings: &CompressionSettings,
        registry: &CompressionRegistry,
    ) -> Result<Self> {
        registry.check(settings)?;
        let mut wire = WireWriter::new(writer);
        wire.write_magic(SIGNATURE_MAGIC)?;
        wire.write_message(&SignatureHeader {
            compression: (*settings).into(),
        })?;
        let mut wire = wire.compress(settings, registry)?;
        wire.write_message(container)?;
        Ok(Self { wire })
    }

    pub fn write_hashes(&mut self, hashes: &[BlockHash]) -> Result<()> {
        for h in hashes {
            self.wire.write_message(&BlockHashMessage {
                weak_hash: h.weak_hash,
                strong_hash: h.strong_hash,
            })?;
        }
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.wire.close()
    }
}

pub fn write_signature(
    writer: impl Write,
    signature: &SignatureInfo,
    settings: &CompressionSettings,
    registry: &CompressionRegistry,
) -> Result<()> {
    let mut w = SignatureWriter::new(writer, &signature.container, settings, registry)?;
    w.write_hashes(&signature.hashes)?;
    w.close()
}

pub fn read_signature(reader: impl Read, registry: &CompressionRegistry) -> Result<SignatureInfo> {
    let mut wire = WireReader::new(reader);
    wire.expect_magic(SIGNATURE_MAGIC)?;
    let header: SignatureHeader = wire.read_message()?;
    let settings = CompressionSettings::try_from(header.compression)?;
    let mut wire = wire.decompress(&settings, registry)?;
    let container: Container = wire.read_message()?;

    let mut hashes = Vec::new();
    for (file_index, file) in container.files.iter().enumerate() {
        for block_index in 0..num_hashes(file.size) {
            let msg: BlockHashMessage = wire.read_message()?;
            hashes.push(BlockHash {
                file_index,
                block_index,
                weak_hash: msg.weak_hash,
                strong_hash: msg.strong_hash,
                short_size: short_size_of(block_len(file.size, block_index) as usize),
            });
        }
    }

    Ok(SignatureInfo { container, hashes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::TracingConsumer;
    use crate::pool::FsPool;
    use std::fs;

    #[test]
    fn test_block_math() {
        assert_eq!(num_blocks(0), 0);
        assert_eq!(num_hashes(0), 1);
        assert_eq!(num_blocks(BLOCK_SIZE), 1);
        assert_eq!(num_blocks(BLOCK_SIZE + 1), 2);
        assert_eq!(block_len(BLOCK_SIZE * 2 + 14, 2), 14);
        assert_eq!(block_len(BLOCK_SIZE * 2 + 14, 1), BLOCK_SIZE);
    }

    #[test]
    fn test_hash_file_short_tail() {
        let data = vec![7u8; BLOCK_SIZE as usize * 2 + 10];
        let mut seen = 0;
        let hashes = hash_file(3, &mut &data[..], &mut |n| seen += n).unwrap();
        assert_eq!(seen, data.len() as u64);
        assert_eq!(hashes.len(), 3);
        assert_eq!(hashes[0].short_size, 0);
        assert_eq!(hashes[2].short_size, 10);
        assert_eq!(hashes[2].block_index, 2);
        assert!(hashes.iter().all(|h| h.file_index == 3));
        assert_eq!(hashes[0], BlockHash { block_index: 0, ..hashes[1].clone() });
    }

    #[test]
    fn test_empty_file_gets_one_block() {
        let hashes = hash_file(0, &mut &b""[..], &mut |_| {}).unwrap();
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes[0].short_size, 0);
    }

    #[test]
    fn test_signature_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), vec![1u8; BLOCK_SIZE as usize + 3]).unwrap();
        fs::write(dir.path().join("b"), b"").unwrap();
        let container = Container::walk(dir.path()).unwrap();
        let pool = FsPool::new(&container, dir.path());
        let hashes = compute_signature(&container, &pool, &TracingConsumer).unwrap();
        let signature = SignatureInfo { container, hashes };
        let groups = signature.hash_groups().unwrap();
        assert_eq!(groups.iter().map(|g| g.len()).collect::<Vec<_>>(), vec![2, 1]);

        let registry = CompressionRegistry::with_defaults();
        let mut buf = Vec::new();
        write_signature(&mut buf, &signature, &CompressionSettings::default(), &registry).unwrap();
        let back = read_signature(&buf[..], &registry).unwrap();
        assert_eq!(back, signature);
        assert!(compare_hashes(&signature, &back.hashes).is_ok());
    }

    #[test]
    fn test_compare_hashes_names_the_block() {
        let data = vec![0u8; BLOCK_SIZE as usize * 2];
        let hashes = hash_file(0, &mut &data[..], &mut |_| {}).unwrap();
        let container = Container::new(
            vec![crate::container::FileEntry {
                path: "f".into(),
                mode: 0o644,
                size: data.len() as u64,
                offset: 0,
            }],
            vec![],
            vec![],
        );
        let reference = SignatureInfo { container, hashes: hashes.clone() };
        let mut damaged = hashes;
        damaged[1].strong_hash[0] ^= 1;
        let err = compare_hashes(&reference, &damaged).unwrap_err();
        assert_eq!(err.to_string(), "integrity error: f differs at block 1");
    }
}
