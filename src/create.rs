//! Diff engine: turn a target signature plus a source tree into a patch and
//! the source tree's own signature, reading every source file once.

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;
use tracing::debug;

use crate::binary_diff::{self, BlockLibrary};
use crate::compression::{CompressionRegistry, CompressionSettings};
use crate::consumer::{CancellationToken, Consumer};
use crate::container::Container;
use crate::error::Result;
use crate::patch_format::{PatchWriter, SyncHeaderKind, SyncOp};
use crate::pool::Pool;
use crate::signature::{self, SignatureInfo, SignatureWriter, BLOCK_SIZE};

/// Bytes read from the source pool per pipeline chunk.
const FEED_CHUNK_SIZE: usize = 256 * 1024;
/// Chunks buffered between the reader and each of matcher and signer.
const PIPELINE_DEPTH: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffStats {
    /// Source bytes expressed as block ranges of the target.
    pub reused_bytes: u64,
    /// Source bytes carried literally.
    pub fresh_bytes: u64,
    pub source_size: u64,
    pub target_size: u64,
}

impl DiffStats {
    /// Share of the source rebuilt from target blocks, in `0.0..=1.0`.
    pub fn reuse_ratio(&self) -> f64 {
        if self.source_size == 0 {
            return 1.0;
        }
        self.reused_bytes as f64 / self.source_size as f64
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Used for both the patch and the signature.
    pub compression: CompressionSettings,
    /// Checked between files.
    pub cancel: CancellationToken,
}

/// Everything a diff needs to know. Built by the caller, consumed by
/// [`DiffContext::write_patch`].
pub struct DiffContext<'a> {
    /// Signature of the old build, the one the patch applies to.
    pub target_signature: &'a SignatureInfo,
    /// Layout of the new build.
    pub source_container: &'a Container,
    pub source_pool: &'a dyn Pool,
    pub options: DiffOptions,
    pub registry: &'a CompressionRegistry,
    pub consumer: &'a dyn Consumer,
}

impl DiffContext<'_> {
    /// Write the patch to `patch_out` and the source signature to
    /// `signature_out`.
    ///
    /// Files are processed one after another. Within a file, one reader
    /// feeds both the rsync matcher and the signer over bounded channels.
    pub fn write_patch(
        &self,
        patch_out: impl Write,
        signature_out: impl Write,
    ) -> Result<DiffStats> {
        let target = &self.target_signature.container;
        let source = self.source_container;

        let compression = &self.options.compression;
        let digests = self.target_signature.file_digests()?;
        let mut patch =
            PatchWriter::new(patch_out, target, source, &digests, compression, self.registry)?;
        let mut signature =
            SignatureWriter::new(signature_out, source, compression, self.registry)?;

        let library = BlockLibrary::new(self.target_signature);
        let target_indices = target.file_indices_by_path();
        let mut stats = DiffStats {
            source_size: source.size,
            target_size: target.size,
            ..Default::default()
        };

        debug!(old = %target.stats(), new = %source.stats(), "diffing");

        for (file_index, file) in source.files.iter().enumerate() {
            self.options.cancel.check()?;
            self.consumer.progress_label(&file.path);
            let preferred = target_indices.get(file.path.as_str()).copied();

            patch.write_sync_header(SyncHeaderKind::Rsync, file_index)?;
            let hashes = self.diff_file(file_index, &library, preferred, &mut patch, &mut stats)?;
            patch.write_op(&SyncOp::HeyYouDidIt)?;
            signature.write_hashes(&hashes)?;
        }

        patch.close()?;
        signature.close()?;
        self.consumer.progress(1.0);
        Ok(stats)
    }

    fn diff_file(
        &self,
        file_index: usize,
        library: &BlockLibrary,
        preferred: Option<usize>,
        patch: &mut PatchWriter<'_>,
        stats: &mut DiffStats,
    ) -> Result<Vec<signature::BlockHash>> {
        let reader = self.source_pool.reader(file_index)?;
        let file_offset = self.source_container.files[file_index].offset;
        let total = self.source_container.size.max(1) as f64;
        let target_files = &self.target_signature.container.files;
        let consumer = self.consumer;

        let (match_tx, match_rx) = mpsc::sync_channel(PIPELINE_DEPTH);
        let (sign_tx, sign_rx) = mpsc::sync_channel(PIPELINE_DEPTH);

        thread::scope(|s| {
            let feeder = s.spawn(move || {
                feed(reader, match_tx, sign_tx, &mut |read| {
                    consumer.progress((file_offset + read) as f64 / total);
                })
            });
            let signer = s.spawn(move || {
                let mut input = ChannelReader::new(sign_rx);
                signature::hash_file(file_index, &mut input, &mut |_| {})
            });

            let mut input = ChannelReader::new(match_rx);
            let matched = binary_diff::compute_ops(&mut input, library, preferred, &mut |op| {
                match &op {
                    SyncOp::BlockRange {
                        file_index,
                        block_index,
                        block_span,
                    } => {
                        let size = target_files.get(*file_index).map_or(0, |f| f.size);
                        let start = (block_index * BLOCK_SIZE).min(size);
                        stats.reused_bytes += (block_span * BLOCK_SIZE).min(size - start);
                    }
                    SyncOp::Data(data) => stats.fresh_bytes += data.len() as u64,
                    SyncOp::HeyYouDidIt => {}
                }
                patch.write_op(&op)
            });
            // hang up so the feeder can't block on a matcher that stopped early
            drop(input);

            let fed = join(feeder);
            let hashes = join(signer);
            matched?;
            fed?;
            hashes
        })
    }
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, T>) -> T {
    match handle.join() {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Read `reader` to the end, sending every chunk to both consumers.
///
/// A consumer that hung up has failed on its own; the feeder stops quietly
/// and lets that consumer report why.
fn feed(
    mut reader: impl Read,
    to_matcher: SyncSender<Arc<[u8]>>,
    to_signer: SyncSender<Arc<[u8]>>,
    on_progress: &mut dyn FnMut(u64),
) -> Result<()> {
    let mut buf = vec![0u8; FEED_CHUNK_SIZE];
    let mut read = 0u64;
    loop {
        let n = signature::fill(&mut reader, &mut buf)?;
        if n == 0 {
            return Ok(());
        }
        let chunk: Arc<[u8]> = Arc::from(&buf[..n]);
        if to_matcher.send(Arc::clone(&chunk)).is_err() || to_signer.send(chunk).is_err() {
            return Ok(());
        }
        read += n as u64;
        on_progress(read);
        if n < buf.len() {
            return Ok(());
        }
    }
}

/// `Read` over a stream of shared chunks. Ends when the sender hangs up.
struct ChannelReader {
    rx: Receiver<Arc<[u8]>>,
    current: Option<Arc<[u8]>>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: Receiver<Arc<[u8]>>) -> Self {
        Self {
            rx,
            current: None,
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(chunk) = &self.current {
                if self.pos < chunk.len() {
                    let n = buf.len().min(chunk.len() - self.pos);
                    buf[..n].copy_from_slice(&chunk[self.pos..self.pos + n]);
                    self.pos += n;
                    return Ok(n);
                }
            }
            match self.rx.recv() {
                Ok(chunk) => {
                    self.current = Some(chunk);
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
    }
}
