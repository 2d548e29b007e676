//! Resumable progress for long-running operations.
//!
//! The engines serialize their own position into an opaque blob; a
//! [`CheckpointStore`] decides when to persist it and where it lives.

use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::consumer::CancellationToken;
use crate::error::Result;

pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSave {
    Continue,
    /// The operation should stop now and report cancellation.
    Stop,
}

pub trait CheckpointStore: Send + Sync {
    /// Last saved blob, if any.
    fn load(&self) -> Result<Option<Vec<u8>>>;

    /// Whether now is a good time to save. Called at file boundaries with
    /// the number of bytes processed since the previous save.
    fn should_save(&self, bytes_since_last: u64) -> bool;

    fn save(&self, blob: &[u8]) -> Result<AfterSave>;
}

/// Checkpoint kept in a single file, replaced atomically on every save.
pub struct FileCheckpointStore {
    path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
    last_save: Mutex<Instant>,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            path: path.into(),
            interval: DEFAULT_CHECKPOINT_INTERVAL,
            cancel,
            last_save: Mutex::new(Instant::now()),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the checkpoint once the operation has completed.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn should_save(&self, _bytes_since_last: u64) -> bool {
        self.cancel.is_cancelled() || self.last_save.lock().elapsed() >= self.interval
    }

    fn save(&self, blob: &[u8]) -> Result<AfterSave> {
        // held for the whole write so saves never overlap
        let mut last_save = self.last_save.lock();

        let tmp = self.tmp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(blob)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        *last_save = Instant::now();
        debug!(path = %self.path.display(), bytes = blob.len(), "saved checkpoint");

        Ok(if self.cancel.is_cancelled() {
            AfterSave::Stop
        } else {
            AfterSave::Continue
        })
    }
}
