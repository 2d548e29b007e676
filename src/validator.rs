//! Check a tree (or a stream of writes) against a signature.
//!
//! Damage is reported as [`Wound`]s on a channel; what happens to them is
//! up to the [`WoundsConsumer`] on the other end.

use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use tracing::debug;

use crate::consumer::{CancellationToken, Consumer};
use crate::container::Container;
use crate::error::{Error, Result};
use crate::pool::{FileBytes, Pool, PoolWriter, ReadSeek, WritablePool};
use crate::signature::{self, BlockHash, SignatureInfo, BLOCK_SIZE};
use crate::util;
use crate::wounds::{
    self, Wound, WoundAggregator, WoundsConsumer, WoundsGuardian, WoundsPrinter, WoundsWriter,
    MAX_WOUND_SIZE,
};

/// Worker count used when none is configured.
pub fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get()) + 1
}

#[derive(Debug, Clone)]
pub struct ValidatorOptions {
    pub workers: usize,
    /// Stop at the first wound.
    pub fail_fast: bool,
    /// Record wounds to this file instead of logging them.
    pub wounds_path: Option<PathBuf>,
    pub cancel: CancellationToken,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            fail_fast: false,
            wounds_path: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl ValidatorOptions {
    /// The wounds consumer these options ask for.
    pub fn make_consumer<'c>(
        &self,
        consumer: &'c dyn Consumer,
    ) -> Result<Box<dyn WoundsConsumer + 'c>> {
        match (self.fail_fast, &self.wounds_path) {
            (true, Some(_)) => Err(Error::InvalidOptions(
                "fail-fast and a wounds file are mutually exclusive".into(),
            )),
            (true, None) => Ok(Box::new(WoundsGuardian::default())),
            (false, Some(path)) => Ok(Box::new(WoundsWriter::new(path.clone()))),
            (false, None) => Ok(Box::new(WoundsPrinter::new(consumer))),
        }
    }
}

/// Incremental checker for one file: bytes go in, wounds come out.
struct BlockChecker {
    file_index: usize,
    size: u64,
    hashes: Vec<BlockHash>,
    buffer: Vec<u8>,
    block_index: u64,
    written: u64,
    /// Bytes arrived past `size` and were dropped.
    overflow: bool,
    /// End of the last wound pushed.
    wounded_to: u64,
    aggregator: WoundAggregator,
    wounds: SyncSender<Wound>,
}

impl BlockChecker {
    fn new(
        file_index: usize,
        size: u64,
        hashes: Vec<BlockHash>,
        wounds: SyncSender<Wound>,
    ) -> Self {
        Self {
            file_index,
            size,
            hashes,
            buffer: Vec::with_capacity(BLOCK_SIZE as usize),
            block_index: 0,
            written: 0,
            overflow: false,
            wounded_to: 0,
            aggregator: WoundAggregator::new(MAX_WOUND_SIZE),
            wounds,
        }
    }

    fn wound(&mut self, start: u64, end: u64) -> Result<()> {
        self.wounded_to = end;
        let tx = &self.wounds;
        self.aggregator
            .push(Wound::file(self.file_index, start, end), &mut |w| wounds::send_wound(tx, w))
    }

    fn check_block(&mut self) -> Result<()> {
        let start = self.block_index * BLOCK_SIZE;
        let end = start + self.buffer.len() as u64;
        let matches = self.hashes.get(self.block_index as usize).is_some_and(|expected| {
            let (weak, strong) = signature::hash_block(&self.buffer);
            expected.weak_hash == weak && expected.strong_hash == strong
        });
        if !matches {
            self.wound(start, end)?;
        }
        self.block_index += 1;
        self.buffer.clear();
        Ok(())
    }

    fn feed(&mut self, mut data: &[u8]) -> Result<()> {
        let room = self.size - self.written;
        if data.len() as u64 > room {
            self.overflow = true;
            data = &data[..room as usize];
        }
        self.written += data.len() as u64;
        while !data.is_empty() {
            let room = BLOCK_SIZE as usize - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == BLOCK_SIZE as usize {
                self.check_block()?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.check_block()?;
        }
        if self.written < self.size {
            self.wound(self.written, self.size)?;
        }
        // extra bytes wound the last block, or the whole of an empty file
        if self.overflow && (self.size == 0 || self.wounded_to < self.size) {
            let last_block = signature::num_blocks(self.size).saturating_sub(1) * BLOCK_SIZE;
            self.wound(last_block.min(self.size), self.size)?;
        }
        let tx = &self.wounds;
        self.aggregator.flush(&mut |w| wounds::send_wound(tx, w))?;
        wounds::send_wound(&self.wounds, Wound::closed_file(self.file_index))
    }
}

/// Writable pool that hashes everything written through it and reports
/// blocks that don't match the signature.
///
/// Writes still reach the inner pool, so a wounded file is on disk and can
/// be healed later.
pub struct ValidatingPool<'a> {
    inner: &'a dyn WritablePool,
    sizes: Vec<u64>,
    hash_groups: Vec<Vec<BlockHash>>,
    wounds: SyncSender<Wound>,
}

impl<'a> ValidatingPool<'a> {
    pub fn new(
        inner: &'a dyn WritablePool,
        signature: &SignatureInfo,
        wounds: SyncSender<Wound>,
    ) -> Result<Self> {
        let hash_groups = signature.hash_groups()?.into_iter().map(<[BlockHash]>::to_vec).collect();
        Ok(Self {
            inner,
            sizes: signature.container.files.iter().map(|f| f.size).collect(),
            hash_groups,
            wounds,
        })
    }
}

impl Pool for ValidatingPool<'_> {
    fn size(&self, file_index: usize) -> u64 {
        self.inner.size(file_index)
    }

    fn reader(&self, file_index: usize) -> Result<Box<dyn ReadSeek>> {
        self.inner.reader(file_index)
    }

    fn load(&self, file_index: usize) -> Result<FileBytes> {
        self.inner.load(file_index)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

impl WritablePool for ValidatingPool<'_> {
    fn writer(&self, file_index: usize) -> Result<Box<dyn PoolWriter>> {
        let (Some(size), Some(hashes)) =
            (self.sizes.get(file_index), self.hash_groups.get(file_index))
        else {
            return Err(Error::InvalidOptions(format!(
                "file {} is not covered by the signature",
                file_index
            )));
        };
        Ok(Box::new(ValidatingWriter {
            inner: self.inner.writer(file_index)?,
            checker: BlockChecker::new(file_index, *size, hashes.clone(), self.wounds.clone()),
        }))
    }
}

struct ValidatingWriter {
    inner: Box<dyn PoolWriter>,
    checker: BlockChecker,
}

impl Write for ValidatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.checker.feed(&buf[..n]).map_err(io::Error::other)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl PoolWriter for ValidatingWriter {
    fn finish(self: Box<Self>) -> Result<()> {
        let ValidatingWriter { inner, mut checker } = *self;
        checker.finish()?;
        inner.finish()
    }
}

/// Validate the tree at `target` against `signature`, streaming wounds to
/// `wounds_consumer`.
///
/// Directories are checked first, then symlinks, then file contents with
/// `options.workers` threads. A file that is missing is wounded in full.
pub fn validate(
    target: &Path,
    signature: &SignatureInfo,
    wounds_consumer: &mut dyn WoundsConsumer,
    options: &ValidatorOptions,
    consumer: &dyn Consumer,
) -> Result<()> {
    let container = &signature.container;
    let hash_groups = signature.hash_groups()?;
    debug!(root = %target.display(), stats = %container.stats(), "validating");

    let workers = rayon::ThreadPoolBuilder::new()
        .num_threads(options.workers.max(1))
        .build()
        .map_err(|e| Error::InvalidOptions(format!("cannot start validator workers: {}", e)))?;

    wounds::with_wounds_consumer(container, wounds_consumer, |tx| {
        for (index, dir) in container.dirs.iter().enumerate() {
            options.cancel.check()?;
            let path = util::native_path(target, &dir.path);
            if !fs::symlink_metadata(&path).is_ok_and(|m| m.is_dir()) {
                wounds::send_wound(&tx, Wound::dir(index))?;
            }
        }

        for (index, link) in container.symlinks.iter().enumerate() {
            options.cancel.check()?;
            let path = util::native_path(target, &link.path);
            let points_right = fs::read_link(&path).is_ok_and(|dest| dest == Path::new(&link.dest));
            if !points_right {
                wounds::send_wound(&tx, Wound::symlink(index))?;
            }
        }

        let total = container.size.max(1) as f64;
        let done = AtomicU64::new(0);
        workers.install(|| {
            container.files.par_iter().enumerate().try_for_each(|(index, file)| {
                options.cancel.check()?;
                consumer.progress_label(&file.path);

                let hashes = hash_groups[index].to_vec();
                let mut checker = BlockChecker::new(index, file.size, hashes, tx.clone());
                match File::open(util::native_path(target, &file.path)) {
                    Ok(mut f) => {
                        let mut buf = vec![0u8; BLOCK_SIZE as usize];
                        loop {
                            let n = signature::fill(&mut f, &mut buf)?;
                            if n == 0 {
                                break;
                            }
                            checker.feed(&buf[..n])?;
                        }
                    }
                    // an empty file has no bytes to come up short on
                    Err(e) if e.kind() == io::ErrorKind::NotFound && file.size == 0 => {
                        wounds::send_wound(&tx, Wound::file(index, 0, 0))?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                checker.finish()?;

                let done = done.fetch_add(file.size, Ordering::Relaxed) + file.size;
                consumer.progress(done as f64 / total);
                Ok(())
            })
        })
    })
}

/// Validate with a guardian: the first wound becomes an error.
pub fn assert_valid(
    target: &Path,
    signature: &SignatureInfo,
    options: &ValidatorOptions,
) -> Result<()> {
    let mut guardian = WoundsGuardian::default();
    validate(target, signature, &mut guardian, options, &crate::consumer::TracingConsumer)
}

/// Fail if the tree at `target` has entries the signature doesn't list,
/// or lacks entries it does.
pub fn assert_no_ghosts(target: &Path, signature: &SignatureInfo) -> Result<()> {
    let actual = Container::walk(target)?;
    signature.container.ensure_equal(&actual)
}
