//! Damage reports produced by validation, and the consumers that act on them.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;

use crate::consumer::Consumer;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::patch_format::{WoundsHeader, WOUNDS_MAGIC};
use crate::wire::{WireReader, WireWriter};

/// Contiguous file wounds are merged up to this size.
pub const MAX_WOUND_SIZE: u64 = 4 * 1024 * 1024;

const WOUND_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WoundKind {
    /// Directory missing or not a directory.
    Dir,
    /// Symlink missing or pointing elsewhere.
    Symlink,
    /// Byte range `[start, end)` of a file is wrong.
    File,
    /// Not damage: file `index` has been fully checked. Used for progress.
    ClosedFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wound {
    pub kind: WoundKind,
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl Wound {
    pub fn file(index: usize, start: u64, end: u64) -> Self {
        Self {
            kind: WoundKind::File,
            index,
            start,
            end,
        }
    }

    pub fn closed_file(index: usize) -> Self {
        Self {
            kind: WoundKind::ClosedFile,
            index,
            start: 0,
            end: 0,
        }
    }

    pub fn dir(index: usize) -> Self {
        Self {
            kind: WoundKind::Dir,
            index,
            start: 0,
            end: 0,
        }
    }

    pub fn symlink(index: usize) -> Self {
        Self {
            kind: WoundKind::Symlink,
            index,
            start: 0,
            end: 0,
        }
    }

    /// Progress markers are wounds in name only.
    pub fn healthy(&self) -> bool {
        self.kind == WoundKind::ClosedFile
    }

    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn pretty(&self, container: &Container) -> String {
        match self.kind {
            WoundKind::Dir => match container.dirs.get(self.index) {
                Some(dir) => format!("directory wound ({} should exist)", dir.path),
                None => format!("directory wound (#{})", self.index),
            },
            WoundKind::Symlink => match container.symlinks.get(self.index) {
                Some(link) => {
                    format!("symlink wound ({} should point to {})", link.path, link.dest)
                }
                None => format!("symlink wound (#{})", self.index),
            },
            WoundKind::File => {
                let path = container.files.get(self.index).map_or("?", |f| f.path.as_str());
                format!("{} byte wound at offset {} into {}", self.size(), self.start, path)
            }
            WoundKind::ClosedFile => {
                let path = container.files.get(self.index).map_or("?", |f| f.path.as_str());
                format!("{} checked", path)
            }
        }
    }
}

/// Merges runs of adjacent file wounds into wider ones.
///
/// Every input wound is relayed: non-file wounds pass through untouched,
/// and a pending file wound is flushed once it reaches `max_size` or a
/// non-adjacent wound arrives.
pub struct WoundAggregator {
    pending: Option<Wound>,
    max_size: u64,
}

impl WoundAggregator {
    pub fn new(max_size: u64) -> Self {
        Self {
            pending: None,
            max_size,
        }
    }

    pub fn push(&mut self, wound: Wound, emit: &mut dyn FnMut(Wound) -> Result<()>) -> Result<()> {
        if wound.kind != WoundKind::File {
            self.flush(emit)?;
            return emit(wound);
        }

        match self.pending.as_mut() {
            Some(last) if last.index == wound.index && last.end == wound.start => {
                last.end = wound.end;
                if last.size() >= self.max_size {
                    self.flush(emit)?;
                }
                Ok(())
            }
            Some(_) => {
                self.flush(emit)?;
                self.pending = Some(wound);
                Ok(())
            }
            None => {
                self.pending = Some(wound);
                Ok(())
            }
        }
    }

    pub fn flush(&mut self, emit: &mut dyn FnMut(Wound) -> Result<()>) -> Result<()> {
        match self.pending.take() {
            Some(wound) => emit(wound),
            None => Ok(()),
        }
    }
}

/// Receives the wound stream of a validation run.
///
/// `consume` returns when the sending side hangs up or on error. Returning
/// early drops the receiver, which makes the producer's next send fail.
pub trait WoundsConsumer: Send {
    fn consume(&mut self, container: &Container, wounds: Receiver<Wound>) -> Result<()>;

    /// Whether any real (non-healthy) wound was seen.
    fn has_wounds(&self) -> bool;

    /// Sum of the sizes of all wounds seen. Dir and symlink wounds count as 0.
    fn total_corrupted(&self) -> u64;
}

/// Fails on the first wound.
#[derive(Debug, Default)]
pub struct WoundsGuardian {
    total_corrupted: u64,
    has_wounds: bool,
}

impl WoundsConsumer for WoundsGuardian {
    fn consume(&mut self, container: &Container, wounds: Receiver<Wound>) -> Result<()> {
        for wound in wounds {
            if wound.healthy() {
                continue;
            }
            self.has_wounds = true;
            self.total_corrupted += wound.size();
            return Err(Error::Integrity(wound.pretty(container)));
        }
        Ok(())
    }

    fn has_wounds(&self) -> bool {
        self.has_wounds
    }

    fn total_corrupted(&self) -> u64 {
        self.total_corrupted
    }
}

/// Logs every wound through a [`Consumer`].
pub struct WoundsPrinter<'c> {
    consumer: &'c dyn Consumer,
    total_corrupted: u64,
    has_wounds: bool,
}

impl<'c> WoundsPrinter<'c> {
    pub fn new(consumer: &'c dyn Consumer) -> Self {
        Self {
            consumer,
            total_corrupted: 0,
            has_wounds: false,
        }
    }
}

impl WoundsConsumer for WoundsPrinter<'_> {
    fn consume(&mut self, container: &Container, wounds: Receiver<Wound>) -> Result<()> {
        for wound in wounds.iter().filter(|w| !w.healthy()) {
            self.has_wounds = true;
            self.total_corrupted += wound.size();
            self.consumer.info(&wound.pretty(container));
        }
        Ok(())
    }

    fn has_wounds(&self) -> bool {
        self.has_wounds
    }

    fn total_corrupted(&self) -> u64 {
        self.total_corrupted
    }
}

/// Records wounds to a file. The file is only created when the first wound
/// arrives, so a clean run leaves nothing behind.
pub struct WoundsWriter {
    path: PathBuf,
    total_corrupted: u64,
    has_wounds: bool,
}

impl WoundsWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            total_corrupted: 0,
            has_wounds: false,
        }
    }
}

impl WoundsConsumer for WoundsWriter {
    fn consume(&mut self, container: &Container, wounds: Receiver<Wound>) -> Result<()> {
        let mut wire: Option<WireWriter<'static>> = None;

        for wound in wounds.iter().filter(|w| !w.healthy()) {
            self.has_wounds = true;
            self.total_corrupted += wound.size();

            if wire.is_none() {
                let file = BufWriter::new(File::create(&self.path)?);
                let mut w = WireWriter::new(file);
                w.write_magic(WOUNDS_MAGIC)?;
                w.write_message(&WoundsHeader::default())?;
                w.write_message(container)?;
                wire = Some(w);
            }
            if let Some(w) = wire.as_mut() {
                w.write_message(&wound)?;
            }
        }

        match wire {
            Some(w) => w.close(),
            None => Ok(()),
        }
    }

    fn has_wounds(&self) -> bool {
        self.has_wounds
    }

    fn total_corrupted(&self) -> u64 {
        self.total_corrupted
    }
}

/// Run `produce` with the sending end of a wound stream while
/// `wounds_consumer` drains it on a scoped thread.
///
/// The consumer's error wins over the producer's: when a guardian bails
/// out, the producer only sees a hung-up channel.
pub fn with_wounds_consumer<T>(
    container: &Container,
    wounds_consumer: &mut dyn WoundsConsumer,
    produce: impl FnOnce(SyncSender<Wound>) -> Result<T>,
) -> Result<T> {
    let (tx, rx) = mpsc::sync_channel(WOUND_QUEUE_DEPTH);
    thread::scope(|s| {
        let handle = s.spawn(move || wounds_consumer.consume(container, rx));
        let produced = produce(tx);
        let consumed = match handle.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        consumed?;
        produced
    })
}

/// Send a wound, failing if the consumer has gone away.
pub(crate) fn send_wound(tx: &SyncSender<Wound>, wound: Wound) -> Result<()> {
    tx.send(wound).map_err(|_| {
        let msg = "wounds consumer stopped listening";
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, msg).into()
    })
}

/// Read a wounds file back: the container it refers to and every wound.
pub fn read_wounds_file(reader: impl Read) -> Result<(Container, Vec<Wound>)> {
    let mut wire = WireReader::new(reader);
    wire.expect_magic(WOUNDS_MAGIC)?;
    let _header: WoundsHeader = wire.read_message()?;
    let container: Container = wire.read_message()?;
    let mut wounds = Vec::new();
    while let Some(wound) = wire.try_read_message::<Wound>()? {
        wounds.push(wound);
    }
    Ok((container, wounds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::TracingConsumer;
    use crate::container::{DirEntry, FileEntry, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
    use proptest::prelude::*;
    use std::sync::mpsc;

    fn container() -> Container {
        Container::new(
            vec![FileEntry {
                path: "data/big.pak".into(),
                mode: DEFAULT_FILE_MODE,
                size: 1 << 20,
                offset: 0,
            }],
            vec![DirEntry {
                path: "data".into(),
                mode: DEFAULT_DIR_MODE,
            }],
            vec![],
        )
    }

    fn feed(wounds: Vec<Wound>) -> Receiver<Wound> {
        let (tx, rx) = mpsc::channel();
        for w in wounds {
            tx.send(w).unwrap();
        }
        rx
    }

    fn aggregate(wounds: Vec<Wound>, max: u64) -> Vec<Wound> {
        let mut agg = WoundAggregator::new(max);
        let mut out = Vec::new();
        for w in wounds {
            agg.push(w, &mut |w| {
                out.push(w);
                Ok(())
            })
            .unwrap();
        }
        agg.flush(&mut |w| {
            out.push(w);
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn test_aggregator_merges_adjacent() {
        let out = aggregate(
            vec![Wound::file(0, 0, 10), Wound::file(0, 10, 20), Wound::file(0, 30, 40)],
            1000,
        );
        assert_eq!(out, vec![Wound::file(0, 0, 20), Wound::file(0, 30, 40)]);
    }

    #[test]
    fn test_aggregator_flushes_at_max_size() {
        let out = aggregate(
            vec![Wound::file(0, 0, 10), Wound::file(0, 10, 20), Wound::file(0, 20, 30)],
            20,
        );
        assert_eq!(out, vec![Wound::file(0, 0, 20), Wound::file(0, 20, 30)]);
    }

    #[test]
    fn test_aggregator_relays_other_kinds_in_order() {
        let out = aggregate(
            vec![Wound::file(0, 0, 10), Wound::closed_file(0), Wound::file(1, 0, 5)],
            1000,
        );
        assert_eq!(
            out,
            vec![Wound::file(0, 0, 10), Wound::closed_file(0), Wound::file(1, 0, 5)]
        );
    }

    #[test]
    fn test_guardian_ignores_healthy_and_fails_on_first() {
        let mut guardian = WoundsGuardian::default();
        guardian
            .consume(&container(), feed(vec![Wound::closed_file(0)]))
            .unwrap();
        assert!(!guardian.has_wounds());

        let err = guardian
            .consume(&container(), feed(vec![Wound::file(0, 100, 164), Wound::dir(0)]))
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        assert!(err.to_string().contains("data/big.pak"));
        assert_eq!(guardian.total_corrupted(), 64);
    }

    #[test]
    fn test_printer_counts_everything() {
        let consumer = TracingConsumer;
        let mut printer = WoundsPrinter::new(&consumer);
        printer
            .consume(
                &container(),
                feed(vec![Wound::dir(0), Wound::file(0, 0, 8), Wound::file(0, 16, 24)]),
            )
            .unwrap();
        assert!(printer.has_wounds());
        assert_eq!(printer.total_corrupted(), 16);
    }

    #[test]
    fn test_writer_creates_file_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wounds.pww");

        let mut writer = WoundsWriter::new(&path);
        writer.consume(&container(), feed(vec![Wound::closed_file(0)])).unwrap();
        assert!(!path.exists());

        let wounds = vec![Wound::dir(0), Wound::file(0, 0, 4096)];
        let mut writer = WoundsWriter::new(&path);
        writer.consume(&container(), feed(wounds.clone())).unwrap();
        assert!(writer.has_wounds());

        let (read_container, read_wounds) = read_wounds_file(File::open(&path).unwrap()).unwrap();
        assert_eq!(read_container, container());
        assert_eq!(read_wounds, wounds);
    }

    #[test]
    fn test_consumer_error_wins() {
        let mut guardian = WoundsGuardian::default();
        let err = with_wounds_consumer(&container(), &mut guardian, |tx| {
            send_wound(&tx, Wound::closed_file(0))?;
            send_wound(&tx, Wound::file(0, 0, 1))?;
            for _ in 0..1000 {
                send_wound(&tx, Wound::closed_file(0))?;
            }
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn test_producer_result_when_consumer_is_happy() {
        let mut guardian = WoundsGuardian::default();
        let n = with_wounds_consumer(&container(), &mut guardian, |tx| {
            send_wound(&tx, Wound::closed_file(0))?;
            Ok(7)
        })
        .unwrap();
        assert_eq!(n, 7);
    }

    #[test]
    fn test_pretty() {
        let c = container();
        assert_eq!(Wound::dir(0).pretty(&c), "directory wound (data should exist)");
        assert_eq!(
            Wound::file(0, 10, 20).pretty(&c),
            "10 byte wound at offset 10 into data/big.pak"
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_aggregation_keeps_coverage(
            steps in proptest::collection::vec((0usize..3, any::<bool>()), 0..64),
            max_blocks in 1u64..8,
        ) {
            const UNIT: u64 = 64;
            let mut cursors = [0u64; 3];
            let mut wounds = Vec::new();
            for (index, skip) in steps {
                if skip {
                    cursors[index] += UNIT;
                }
                wounds.push(Wound::file(index, cursors[index], cursors[index] + UNIT));
                cursors[index] += UNIT;
            }

            let blocks = |ws: &[Wound]| {
                let mut out: Vec<(usize, u64)> = ws
                    .iter()
                    .flat_map(|w| (w.start / UNIT..w.end / UNIT).map(move |b| (w.index, b)))
                    .collect();
                out.sort_unstable();
                out
            };

            let max_size = max_blocks * UNIT;
            let out = aggregate(wounds.clone(), max_size);
            prop_assert_eq!(blocks(&out), blocks(&wounds));
            prop_assert!(out.len() <= wounds.len());
            for w in &out {
                prop_assert!(w.size() <= max_size + UNIT);
            }
        }
    }
}
