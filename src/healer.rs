//! Repair a tree by refetching wounded files from a canonical copy.
//!
//! The healer is a [`WoundsConsumer`]: plug it behind a validator (or a
//! validating apply) and every wounded file is rewritten in full from the
//! archive pool, by a fixed number of workers.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::consumer::{CancellationToken, Consumer};
use crate::container::Container;
use crate::error::Result;
use crate::pool::{FsPool, Pool, WritablePool};
use crate::util;
use crate::validator::default_workers;
use crate::wounds::{Wound, WoundKind, WoundsConsumer};

const HEAL_CHUNK_SIZE: usize = 256 * 1024;
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Per-file gates: a healer won't touch file `i` until `release(i)` has
/// been called, so it never races a writer still producing that file.
pub struct LockMap {
    slots: Vec<(Mutex<bool>, Condvar)>,
}

impl LockMap {
    pub fn new(num_files: usize) -> Self {
        Self {
            slots: (0..num_files).map(|_| (Mutex::new(false), Condvar::new())).collect(),
        }
    }

    pub fn release(&self, file_index: usize) {
        if let Some((released, cond)) = self.slots.get(file_index) {
            *released.lock() = true;
            cond.notify_all();
        }
    }

    pub fn release_all(&self) {
        for index in 0..self.slots.len() {
            self.release(index);
        }
    }

    pub fn is_released(&self, file_index: usize) -> bool {
        self.slots.get(file_index).is_none_or(|(released, _)| *released.lock())
    }

    /// Block until `file_index` is released or `cancel` fires.
    pub fn wait(&self, file_index: usize, cancel: &CancellationToken) -> Result<()> {
        let Some((released, cond)) = self.slots.get(file_index) else {
            return Ok(());
        };
        let mut guard = released.lock();
        while !*guard {
            cancel.check()?;
            cond.wait_for(&mut guard, LOCK_POLL_INTERVAL);
        }
        Ok(())
    }
}

/// Opens the canonical copy for a container.
pub type ArchiveOpener = Box<dyn Fn(&Container) -> Result<Arc<dyn Pool>> + Send + Sync>;

enum ArchiveSlot {
    Unopened,
    Open(Arc<dyn Pool>),
    Failed(String),
}

#[derive(Clone)]
pub struct HealerOptions {
    pub workers: usize,
    pub lock_map: Option<Arc<LockMap>>,
    pub cancel: CancellationToken,
}

impl Default for HealerOptions {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            lock_map: None,
            cancel: CancellationToken::new(),
        }
    }
}

pub struct Healer<'c> {
    target: PathBuf,
    opener: ArchiveOpener,
    archive: Mutex<ArchiveSlot>,
    options: HealerOptions,
    consumer: &'c dyn Consumer,

    total_corrupted: u64,
    has_wounds: bool,
    total_healed: AtomicU64,
    total_healthy: AtomicU64,
    container_size: u64,
}

impl<'c> Healer<'c> {
    pub fn new(
        target: impl Into<PathBuf>,
        opener: ArchiveOpener,
        options: HealerOptions,
        consumer: &'c dyn Consumer,
    ) -> Self {
        Self {
            target: target.into(),
            opener,
            archive: Mutex::new(ArchiveSlot::Unopened),
            options,
            consumer,
            total_corrupted: 0,
            has_wounds: false,
            total_healed: AtomicU64::new(0),
            total_healthy: AtomicU64::new(0),
            container_size: 0,
        }
    }

    /// Heal from a pristine copy of the tree laid out in a directory.
    pub fn from_directory(
        target: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
        options: HealerOptions,
        consumer: &'c dyn Consumer,
    ) -> Self {
        let archive_dir: PathBuf = archive_dir.into();
        let opener: ArchiveOpener = Box::new(move |container: &Container| {
            if !archive_dir.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("archive {} is not a directory", archive_dir.display()),
                )
                .into());
            }
            Ok(Arc::new(FsPool::new(container, archive_dir.clone())) as Arc<dyn Pool>)
        });
        Self::new(target, opener, options, consumer)
    }

    /// Bytes written to repair files. Whole files are refetched, so this
    /// can exceed `total_corrupted`.
    pub fn total_healed(&self) -> u64 {
        self.total_healed.load(Ordering::Relaxed)
    }

    /// The archive is opened by the first worker that needs it and shared
    /// by all of them afterwards.
    fn archive(&self, container: &Container) -> Result<Arc<dyn Pool>> {
        let mut slot = self.archive.lock();
        match &*slot {
            ArchiveSlot::Open(pool) => return Ok(Arc::clone(pool)),
            ArchiveSlot::Failed(msg) => {
                return Err(io::Error::other(format!("archive unavailable: {}", msg)).into());
            }
            ArchiveSlot::Unopened => {}
        }

        debug!("opening archive for healing");
        match (self.opener)(container) {
            Ok(pool) => {
                *slot = ArchiveSlot::Open(Arc::clone(&pool));
                Ok(pool)
            }
            Err(e) => {
                *slot = ArchiveSlot::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn report_progress(&self) {
        let done = self.total_healthy.load(Ordering::Relaxed)
            + self.total_healed.load(Ordering::Relaxed);
        self.consumer.progress(done as f64 / self.container_size.max(1) as f64);
    }

    fn heal_one(
        &self,
        container: &Container,
        target_pool: &FsPool,
        file_index: usize,
    ) -> Result<()> {
        if let Some(lock_map) = &self.options.lock_map {
            lock_map.wait(file_index, &self.options.cancel)?;
        }

        let file = &container.files[file_index];
        self.consumer.debug(&format!("healing {} ({} bytes)", file.path, file.size));

        let archive = self.archive(container)?;
        let mut reader = archive.reader(file_index)?;
        let mut writer = target_pool.writer(file_index)?;

        let mut buf = vec![0u8; HEAL_CHUNK_SIZE];
        loop {
            self.options.cancel.check()?;
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            writer.write_all(&buf[..n])?;
            self.total_healed.fetch_add(n as u64, Ordering::Relaxed);
            self.report_progress();
        }
        writer.finish()
    }

    fn heal_dir(&self, container: &Container, index: usize) -> Result<()> {
        let dir = &container.dirs[index];
        let path = util::native_path(&self.target, &dir.path);
        if fs::symlink_metadata(&path).is_ok_and(|m| !m.is_dir()) {
            fs::remove_file(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(())
    }

    fn heal_symlink(&self, container: &Container, index: usize) -> Result<()> {
        let link = &container.symlinks[index];
        let path = util::native_path(&self.target, &link.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        remove_any(&path)?;
        util::create_symlink(&link.dest, &path)?;
        Ok(())
    }

    /// Act on each wound: dirs and symlinks are fixed inline, files are
    /// queued (once) for the workers.
    fn dispatch(
        &self,
        container: &Container,
        wounds: Receiver<Wound>,
        queue: &SyncSender<usize>,
        stop: &AtomicBool,
        corrupted: &mut u64,
        has_wounds: &mut bool,
    ) -> Result<()> {
        let mut queued = HashSet::new();
        for wound in wounds {
            self.options.cancel.check()?;
            if stop.load(Ordering::Relaxed) {
                break;
            }
            if !wound.healthy() {
                *corrupted += wound.size();
                *has_wounds = true;
            }

            match wound.kind {
                WoundKind::Dir => self.heal_dir(container, wound.index)?,
                WoundKind::Symlink => self.heal_symlink(container, wound.index)?,
                WoundKind::File => {
                    if queued.insert(wound.index) {
                        self.consumer.progress_label(&container.files[wound.index].path);
                        if queue.send(wound.index).is_err() {
                            break;
                        }
                    }
                }
                WoundKind::ClosedFile => {
                    if !queued.contains(&wound.index) {
                        let size = container.files.get(wound.index).map_or(0, |f| f.size);
                        self.total_healthy.fetch_add(size, Ordering::Relaxed);
                        self.report_progress();
                    }
                }
            }
        }
        Ok(())
    }

    fn worker(
        &self,
        container: &Container,
        target_pool: &FsPool,
        queue: &Mutex<Receiver<usize>>,
        stop: &AtomicBool,
    ) -> Result<()> {
        loop {
            if stop.load(Ordering::Relaxed) {
                return Ok(());
            }
            let next = queue.lock().recv();
            let Ok(file_index) = next else {
                return Ok(());
            };
            if let Err(e) = self.heal_one(container, target_pool, file_index) {
                stop.store(true, Ordering::Relaxed);
                return Err(e);
            }
        }
    }
}

fn remove_any(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

impl WoundsConsumer for Healer<'_> {
    fn consume(&mut self, container: &Container, wounds: Receiver<Wound>) -> Result<()> {
        self.container_size = container.size;
        let workers = self.options.workers.max(1);
        debug!(workers, root = %self.target.display(), "healer starting");

        let target_pool = FsPool::new(container, &self.target);
        let (tx, rx) = mpsc::sync_channel::<usize>(container.files.len().max(1));
        let queue = Mutex::new(rx);
        let stop = AtomicBool::new(false);

        let mut corrupted = 0u64;
        let mut has_wounds = false;

        let this = &*self;
        let result = thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|_| s.spawn(|| this.worker(container, &target_pool, &queue, &stop)))
                .collect();

            let produced =
                this.dispatch(container, wounds, &tx, &stop, &mut corrupted, &mut has_wounds);
            if produced.is_err() {
                stop.store(true, Ordering::Relaxed);
            }
            drop(tx);

            let mut first_error = produced.err();
            for handle in handles {
                let joined = match handle.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                };
                if let Err(e) = joined {
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        });

        self.total_corrupted += corrupted;
        self.has_wounds |= has_wounds;
        result
    }

    fn has_wounds(&self) -> bool {
        self.has_wounds
    }

    fn total_corrupted(&self) -> u64 {
        self.total_corrupted
    }
}
