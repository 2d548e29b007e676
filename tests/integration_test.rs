use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use treepatch::apply::{ApplyContext, ApplyOptions, ApplyStats};
use treepatch::checkpoint::{AfterSave, CheckpointStore};
use treepatch::compression::{CompressionAlgorithm, CompressionRegistry, CompressionSettings};
use treepatch::consumer::{CancellationToken, TracingConsumer};
use treepatch::container::Container;
use treepatch::create::{DiffContext, DiffOptions, DiffStats};
use treepatch::healer::{Healer, HealerOptions};
use treepatch::pool::FsPool;
use treepatch::probe::probe_patch;
use treepatch::rediff::{RediffContext, RediffOptions};
use treepatch::signature::{compute_signature, read_signature, SignatureInfo, BLOCK_SIZE};
use treepatch::validator::{assert_no_ghosts, assert_valid, validate, ValidatorOptions};
use treepatch::wounds::{read_wounds_file, Wound, WoundKind, WoundsConsumer, WoundsWriter};
use treepatch::Error;

const B: usize = BLOCK_SIZE as usize;

fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

fn create_dir_tree(root: &Path, files: &[(&str, &[u8])]) {
    fs::create_dir_all(root).unwrap();
    for (rel_path, content) in files {
        let full = root.join(rel_path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Node {
    File(Vec<u8>),
    Dir,
    Link(PathBuf),
}

fn collect_dir_tree(root: &Path) -> Vec<(String, Node)> {
    let mut entries = Vec::new();
    collect_recursive(root, root, &mut entries);
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn collect_recursive(root: &Path, current: &Path, entries: &mut Vec<(String, Node)>) {
    let mut dir_entries: Vec<_> = fs::read_dir(current).unwrap().collect::<Result<_, _>>().unwrap();
    dir_entries.sort_by_key(|e| e.file_name());

    for entry in dir_entries {
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap().to_str().unwrap().replace('\\', "/");
        let file_type = entry.file_type().unwrap();

        if file_type.is_symlink() {
            entries.push((rel, Node::Link(fs::read_link(&path).unwrap())));
        } else if file_type.is_dir() {
            entries.push((rel, Node::Dir));
            collect_recursive(root, &path, entries);
        } else {
            entries.push((rel, Node::File(fs::read(&path).unwrap())));
        }
    }
}

fn copy_tree(from: &Path, to: &Path) {
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry.unwrap();
        let dest = to.join(entry.path().strip_prefix(from).unwrap());
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).unwrap();
        } else {
            fs::copy(entry.path(), &dest).unwrap();
        }
    }
}

fn sign(dir: &Path) -> SignatureInfo {
    let container = Container::walk(dir).unwrap();
    let pool = FsPool::new(&container, dir);
    let hashes = compute_signature(&container, &pool, &TracingConsumer).unwrap();
    SignatureInfo { container, hashes }
}

struct Patch {
    bytes: Vec<u8>,
    signature: SignatureInfo,
    stats: DiffStats,
}

fn diff_with(old: &Path, new: &Path, compression: CompressionSettings) -> Patch {
    let registry = CompressionRegistry::with_defaults();
    let target_signature = sign(old);
    let source_container = Container::walk(new).unwrap();
    let source_pool = FsPool::new(&source_container, new);

    let mut bytes = Vec::new();
    let mut signature_bytes = Vec::new();
    let stats = DiffContext {
        target_signature: &target_signature,
        source_container: &source_container,
        source_pool: &source_pool,
        options: DiffOptions {
            compression,
            ..Default::default()
        },
        registry: &registry,
        consumer: &TracingConsumer,
    }
    .write_patch(&mut bytes, &mut signature_bytes)
    .unwrap();

    let signature = read_signature(&signature_bytes[..], &registry).unwrap();
    Patch {
        bytes,
        signature,
        stats,
    }
}

fn diff(old: &Path, new: &Path) -> Patch {
    diff_with(old, new, CompressionSettings::default())
}

fn apply_with(
    target: &Path,
    output: &Path,
    patch: &[u8],
    options: ApplyOptions,
) -> treepatch::Result<ApplyStats> {
    let registry = CompressionRegistry::with_defaults();
    let result = ApplyContext {
        target_path: target,
        output_path: output,
        signature: None,
        wounds_consumer: None,
        options,
        registry: &registry,
        consumer: &TracingConsumer,
    }
    .apply_patch(patch);
    result
}

fn apply_in_place(dir: &Path, patch: &[u8]) -> treepatch::Result<ApplyStats> {
    let options = ApplyOptions {
        in_place: true,
        ..Default::default()
    };
    apply_with(dir, dir, patch, options)
}

/// Keeps every real wound it sees.
#[derive(Default)]
struct CollectWounds {
    wounds: Vec<Wound>,
}

impl WoundsConsumer for CollectWounds {
    fn consume(
        &mut self,
        _container: &Container,
        wounds: Receiver<Wound>,
    ) -> treepatch::Result<()> {
        self.wounds.extend(wounds.into_iter().filter(|w| !w.healthy()));
        Ok(())
    }

    fn has_wounds(&self) -> bool {
        !self.wounds.is_empty()
    }

    fn total_corrupted(&self) -> u64 {
        self.wounds.iter().map(Wound::size).sum()
    }
}

/// T has `subdir/file-1` (11 blocks + 14 bytes), `file-1`, `dir2/file-2`.
/// S is the same except `subdir/file-1` grows to 17 blocks + 14 bytes and
/// its prefix changes.
fn change_one_trees(root: &Path) -> (PathBuf, PathBuf) {
    let old = root.join("old");
    let new = root.join("new");

    let big = noise(11 * B + 14, 1);
    let mut grown = noise(6 * B + 300, 2);
    grown.extend_from_slice(&big[300..]);
    assert_eq!(grown.len(), 17 * B + 14);

    let file_1 = noise(3 * B / 2, 3);
    let file_2 = noise(200, 4);

    create_dir_tree(
        &old,
        &[("subdir/file-1", &big), ("file-1", &file_1), ("dir2/file-2", &file_2)],
    );
    create_dir_tree(
        &new,
        &[("subdir/file-1", &grown), ("file-1", &file_1), ("dir2/file-2", &file_2)],
    );
    (old, new)
}

#[test]
fn test_change_one_in_place() {
    let temp = tempfile::tempdir().unwrap();
    let (old, new) = change_one_trees(temp.path());
    let patch = diff(&old, &new);

    let live = temp.path().join("live");
    copy_tree(&old, &live);
    let stats = apply_in_place(&live, &patch.bytes).unwrap();

    assert_eq!(stats.touched_files, 1);
    assert_eq!(stats.noop_files, 2);
    assert_eq!(stats.moved_files, 0);
    assert_eq!(stats.deleted_files, 0);
    assert_eq!(stats.deleted_dirs, 0);
    assert_eq!(collect_dir_tree(&live), collect_dir_tree(&new));
    assert!(!temp.path().join("live-stage").exists());
    assert_valid(&live, &patch.signature, &ValidatorOptions::default()).unwrap();
    assert_no_ghosts(&live, &patch.signature).unwrap();

    // Most of the big file's old blocks were reused.
    assert!(patch.stats.reused_bytes >= (11 * B) as u64);
}

#[test]
fn test_change_one_corrupted_copy_reports_the_block() {
    let temp = tempfile::tempdir().unwrap();
    let (_old, new) = change_one_trees(temp.path());
    let signature = sign(&new);

    let copy = temp.path().join("copy");
    copy_tree(&new, &copy);
    let path = copy.join("subdir/file-1");
    let mut bytes = fs::read(&path).unwrap();
    for b in &mut bytes[9 * B + 100..9 * B + 110] {
        *b = !*b;
    }
    fs::write(&path, bytes).unwrap();

    let mut collected = CollectWounds::default();
    let options = ValidatorOptions::default();
    validate(&copy, &signature, &mut collected, &options, &TracingConsumer).unwrap();

    let index = signature.container.file_indices_by_path()["subdir/file-1"];
    assert_eq!(collected.wounds, vec![Wound::file(index, 9 * BLOCK_SIZE, 10 * BLOCK_SIZE)]);
    assert_eq!(collected.total_corrupted(), BLOCK_SIZE);
}

#[test]
fn test_reapplying_fails_loudly() {
    let temp = tempfile::tempdir().unwrap();
    let (old, new) = change_one_trees(temp.path());
    let patch = diff(&old, &new);

    let live = temp.path().join("live");
    copy_tree(&old, &live);
    apply_in_place(&live, &patch.bytes).unwrap();

    let err = apply_in_place(&live, &patch.bytes).unwrap_err();
    assert!(matches!(err, Error::Integrity(_)), "{:?}", err);
    assert_eq!(collect_dir_tree(&live), collect_dir_tree(&new));
}

#[test]
fn test_reapplying_same_size_swap_fails_loudly() {
    let temp = tempfile::tempdir().unwrap();
    let old = temp.path().join("old");
    let new = temp.path().join("new");
    let x = noise(70_000, 40);
    let y = noise(70_000, 41);
    create_dir_tree(&old, &[("a", &x), ("b", &y)]);
    create_dir_tree(&new, &[("a", &y), ("b", &x)]);

    let patch = diff(&old, &new);
    let live = temp.path().join("live");
    copy_tree(&old, &live);
    apply_in_place(&live, &patch.bytes).unwrap();
    assert_eq!(collect_dir_tree(&live), collect_dir_tree(&new));

    // Every size still matches, only the contents give the second run away.
    let err = apply_in_place(&live, &patch.bytes).unwrap_err();
    assert!(matches!(err, Error::Integrity(_)), "{:?}", err);
    assert_eq!(collect_dir_tree(&live), collect_dir_tree(&new));
}

#[test]
fn test_fresh_apply_checks_old_contents() {
    let temp = tempfile::tempdir().unwrap();
    let (old, new) = change_one_trees(temp.path());
    let patch = diff(&old, &new);

    let tampered = temp.path().join("tampered");
    copy_tree(&old, &tampered);
    let victim = tampered.join("file-1");
    let mut bytes = fs::read(&victim).unwrap();
    bytes[0] ^= 0xFF;
    fs::write(&victim, &bytes).unwrap();

    let out = temp.path().join("out");
    let err = apply_with(&tampered, &out, &patch.bytes, ApplyOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Integrity(_)), "{:?}", err);
}

#[test]
fn test_fresh_round_trip() {
    let temp = tempfile::tempdir().unwrap();
    let old = temp.path().join("old");
    let new = temp.path().join("new");
    let out = temp.path().join("out");

    let shared = noise(5 * B + 77, 10);
    let mut edited = shared.clone();
    edited[2 * B..2 * B + 50].fill(0xAB);

    create_dir_tree(
        &old,
        &[("bin/app", &shared), ("readme.txt", b"version 1"), ("gone/away.dat", b"bye")],
    );
    create_dir_tree(
        &new,
        &[
            ("bin/app", &edited),
            ("readme.txt", b"version 2, longer"),
            ("empty.cfg", b""),
            ("lib/copy-of-app", &shared),
        ],
    );
    fs::create_dir_all(new.join("logs/empty")).unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink("bin/app", new.join("app-link")).unwrap();

    let patch = diff(&old, &new);
    fs::create_dir_all(&out).unwrap();
    let stats = apply_with(&old, &out, &patch.bytes, ApplyOptions::default()).unwrap();

    assert_eq!(collect_dir_tree(&out), collect_dir_tree(&new));
    assert_eq!(stats.touched_files, 4);
    assert_eq!(stats.deleted_files, 0);
    assert_valid(&out, &patch.signature, &ValidatorOptions::default()).unwrap();
    // The old tree is only read from.
    assert_eq!(fs::read(old.join("gone/away.dat")).unwrap(), b"bye");
}

#[test]
fn test_rename_is_a_move() {
    let temp = tempfile::tempdir().unwrap();
    let old = temp.path().join("old");
    let new = temp.path().join("new");
    let content = noise(3 * B + 5, 20);
    create_dir_tree(&old, &[("a/data.bin", &content), ("keep", b"same")]);
    create_dir_tree(&new, &[("b/data.bin", &content), ("keep", b"same")]);

    let patch = diff(&old, &new);
    let live = temp.path().join("live");
    copy_tree(&old, &live);

    #[cfg(unix)]
    let inode = {
        use std::os::unix::fs::MetadataExt;
        fs::metadata(live.join("a/data.bin")).unwrap().ino()
    };

    let stats = apply_in_place(&live, &patch.bytes).unwrap();
    assert_eq!(stats.moved_files, 1);
    assert_eq!(stats.touched_files, 0);
    assert_eq!(stats.noop_files, 1);
    assert_eq!(stats.deleted_dirs, 1);
    assert_eq!(collect_dir_tree(&live), collect_dir_tree(&new));

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        assert_eq!(fs::metadata(live.join("b/data.bin")).unwrap().ino(), inode);
    }
}

#[test]
fn test_swap_in_place() {
    let temp = tempfile::tempdir().unwrap();
    let old = temp.path().join("old");
    let new = temp.path().join("new");
    let x = noise(70_000, 30);
    let y = noise(5_000, 31);
    create_dir_tree(&old, &[("a", &x), ("b", &y)]);
    create_dir_tree(&new, &[("a", &y), ("b", &x)]);

    let patch = diff(&old, &new);
    let live = temp.path().join("live");
    copy_tree(&old, &live);
    let stats = apply_in_place(&live, &patch.bytes).unwrap();

    assert_eq!(stats.moved_files, 2);
    assert_eq!(collect_dir_tree(&live), collect_dir_tree(&new));
}

#[test]
fn test_deletions_only_remove_emptied_dirs() {
    let temp = tempfile::tempdir().unwrap();
    let old = temp.path().join("old");
    let new = temp.path().join("new");
    create_dir_tree(
        &old,
        &[
            ("keep.txt", b"k"),
            ("plugins/old/a.dll", b"aaaa"),
            ("plugins/old/b.dll", b"bbbb"),
            ("saves/slot1", b"s"),
        ],
    );
    create_dir_tree(&new, &[("keep.txt", b"k")]);

    let patch = diff(&old, &new);
    let live = temp.path().join("live");
    copy_tree(&old, &live);
    fs::write(live.join("saves/user-made"), b"mine").unwrap();

    let stats = apply_in_place(&live, &patch.bytes).unwrap();
    assert_eq!(stats.deleted_files, 3);
    // plugins/old and plugins; saves still holds a file the user made.
    assert_eq!(stats.deleted_dirs, 2);
    assert!(!live.join("plugins").exists());
    assert_eq!(fs::read(live.join("saves/user-made")).unwrap(), b"mine");
}

#[test]
fn test_apply_with_signature_validates_writes() {
    let temp = tempfile::tempdir().unwrap();
    let (old, new) = change_one_trees(temp.path());
    let patch = diff(&old, &new);
    let registry = CompressionRegistry::with_defaults();

    let out = temp.path().join("out");
    fs::create_dir_all(&out).unwrap();
    ApplyContext {
        target_path: &old,
        output_path: &out,
        signature: Some(&patch.signature),
        wounds_consumer: None,
        options: ApplyOptions::default(),
        registry: &registry,
        consumer: &TracingConsumer,
    }
    .apply_patch(&patch.bytes[..])
    .unwrap();
    assert_eq!(collect_dir_tree(&out), collect_dir_tree(&new));

    // A signature of some other tree is refused up front.
    let wrong = sign(&old);
    let err = ApplyContext {
        target_path: &old,
        output_path: &out,
        signature: Some(&wrong),
        wounds_consumer: None,
        options: ApplyOptions::default(),
        registry: &registry,
        consumer: &TracingConsumer,
    }
    .apply_patch(&patch.bytes[..])
    .unwrap_err();
    assert!(matches!(err, Error::InvalidOptions(_)));
}

#[test]
fn test_guardian_turns_wound_into_integrity_error() {
    let temp = tempfile::tempdir().unwrap();
    let (_old, new) = change_one_trees(temp.path());
    let signature = sign(&new);
    fs::write(new.join("dir2/file-2"), noise(200, 99)).unwrap();

    let err = assert_valid(&new, &signature, &ValidatorOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Integrity(_)), "{:?}", err);
}

#[test]
fn test_heal_from_wounds_file() {
    let temp = tempfile::tempdir().unwrap();
    let (_old, archive) = change_one_trees(temp.path());
    let signature = sign(&archive);

    let live = temp.path().join("live");
    copy_tree(&archive, &live);
    let mut bytes = fs::read(live.join("subdir/file-1")).unwrap();
    bytes[B + 1] ^= 0xFF;
    fs::write(live.join("subdir/file-1"), bytes).unwrap();
    fs::remove_file(live.join("file-1")).unwrap();

    let wounds_path = temp.path().join("live.wounds");
    let mut writer = WoundsWriter::new(&wounds_path);
    let options = ValidatorOptions::default();
    validate(&live, &signature, &mut writer, &options, &TracingConsumer).unwrap();
    assert!(writer.has_wounds());

    let (container, recorded) = read_wounds_file(fs::File::open(&wounds_path).unwrap()).unwrap();
    assert_eq!(container, signature.container);
    assert!(recorded.iter().any(|w| w.kind == WoundKind::File));

    let (tx, rx) = mpsc::sync_channel(recorded.len());
    for wound in recorded {
        tx.send(wound).unwrap();
    }
    drop(tx);
    let mut healer =
        Healer::from_directory(&live, &archive, HealerOptions::default(), &TracingConsumer);
    healer.consume(&container, rx).unwrap();

    let sizes = signature.container.file_indices_by_path();
    let expected = signature.container.files[sizes["subdir/file-1"]].size
        + signature.container.files[sizes["file-1"]].size;
    assert_eq!(healer.total_healed(), expected);
    assert_eq!(collect_dir_tree(&live), collect_dir_tree(&archive));
}

/// Stops the first run after its first save, then lets the next one through.
struct StopOnce {
    blob: Mutex<Option<Vec<u8>>>,
    armed: AtomicBool,
}

impl CheckpointStore for StopOnce {
    fn load(&self) -> treepatch::Result<Option<Vec<u8>>> {
        Ok(self.blob.lock().clone())
    }

    fn should_save(&self, _bytes_since_last: u64) -> bool {
        true
    }

    fn save(&self, blob: &[u8]) -> treepatch::Result<AfterSave> {
        *self.blob.lock() = Some(blob.to_vec());
        if self.armed.swap(false, Ordering::SeqCst) {
            Ok(AfterSave::Stop)
        } else {
            Ok(AfterSave::Continue)
        }
    }
}

#[test]
fn test_checkpointed_apply_resumes() {
    let temp = tempfile::tempdir().unwrap();
    let old = temp.path().join("old");
    let new = temp.path().join("new");
    create_dir_tree(
        &old,
        &[("1.bin", &noise(B + 1, 40)), ("2.bin", &noise(B + 2, 41)), ("3.bin", &noise(B + 3, 42))],
    );
    create_dir_tree(
        &new,
        &[
            ("1.bin", &noise(B + 10, 50)),
            ("2.bin", &noise(B + 20, 51)),
            ("3.bin", &noise(B + 30, 52)),
        ],
    );
    let patch = diff(&old, &new);

    let live = temp.path().join("live");
    copy_tree(&old, &live);
    let store = Arc::new(StopOnce {
        blob: Mutex::new(None),
        armed: AtomicBool::new(true),
    });
    let options = || ApplyOptions {
        in_place: true,
        checkpoint: Some(Arc::clone(&store) as Arc<dyn CheckpointStore>),
        ..Default::default()
    };

    let err = apply_with(&live, &live, &patch.bytes, options()).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(collect_dir_tree(&live), collect_dir_tree(&old));
    assert!(store.blob.lock().is_some());

    let stats = apply_with(&live, &live, &patch.bytes, options()).unwrap();
    assert_eq!(stats.touched_files, 3);
    assert_eq!(collect_dir_tree(&live), collect_dir_tree(&new));
}

#[test]
fn test_cancelled_apply_touches_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let (old, new) = change_one_trees(temp.path());
    let patch = diff(&old, &new);
    let live = temp.path().join("live");
    copy_tree(&old, &live);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let options = ApplyOptions {
        in_place: true,
        cancel,
        ..Default::default()
    };
    let err = apply_with(&live, &live, &patch.bytes, options).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(collect_dir_tree(&live), collect_dir_tree(&old));
}

fn malformed_case(patch: &[u8]) {
    let registry = CompressionRegistry::with_defaults();
    let err = probe_patch(patch, &registry).unwrap_err();
    assert!(matches!(err, Error::MalformedPatch(_)), "{:?}", err);
}

#[test]
fn test_malformed_patches() {
    let temp = tempfile::tempdir().unwrap();
    let old = temp.path().join("old");
    let new = temp.path().join("new");
    create_dir_tree(&old, &[("a", b"one"), ("b", b"two")]);
    create_dir_tree(&new, &[("a", b"uno"), ("b", b"dos")]);
    let patch = diff_with(&old, &new, CompressionSettings::none());

    let mut bad_magic = patch.bytes.clone();
    bad_magic[0] ^= 0xFF;
    malformed_case(&bad_magic);

    // Cut into the closing sentinel of the last file.
    let sentinel_at = patch.bytes.len() - 1;
    malformed_case(&patch.bytes[..sentinel_at]);

    // Apply refuses a truncated patch before committing anything.
    let live = temp.path().join("live");
    copy_tree(&old, &live);
    let err = apply_in_place(&live, &patch.bytes[..patch.bytes.len() / 2]).unwrap_err();
    assert!(matches!(err, Error::MalformedPatch(_)), "{:?}", err);
    assert_eq!(collect_dir_tree(&live), collect_dir_tree(&old));
}

#[test]
fn test_unsupported_compression_is_incompatible() {
    let temp = tempfile::tempdir().unwrap();
    let old = temp.path().join("old");
    let new = temp.path().join("new");
    create_dir_tree(&old, &[("a", b"one")]);
    create_dir_tree(&new, &[("a", b"two")]);
    let registry = CompressionRegistry::with_defaults();

    // No codec for brotli: nothing gets written.
    let target_signature = sign(&old);
    let source_container = Container::walk(&new).unwrap();
    let source_pool = FsPool::new(&source_container, &new);
    let mut out = Vec::new();
    let err = DiffContext {
        target_signature: &target_signature,
        source_container: &source_container,
        source_pool: &source_pool,
        options: DiffOptions {
            compression: CompressionSettings {
                algorithm: CompressionAlgorithm::Brotli,
                quality: 1,
            },
            ..Default::default()
        },
        registry: &registry,
        consumer: &TracingConsumer,
    }
    .write_patch(&mut out, std::io::sink())
    .unwrap_err();
    assert!(matches!(err, Error::IncompatiblePatch(_)), "{:?}", err);
    assert!(out.is_empty());

    // An algorithm number nobody knows.
    let mut patch = diff_with(&old, &new, CompressionSettings::none()).bytes;
    patch[8..12].copy_from_slice(&99u32.to_le_bytes());
    let err = probe_patch(&patch[..], &registry).unwrap_err();
    assert!(matches!(err, Error::IncompatiblePatch(_)), "{:?}", err);

    // A registry without gzip can't read a gzip patch.
    let gzip = diff_with(
        &old,
        &new,
        CompressionSettings {
            algorithm: CompressionAlgorithm::Gzip,
            quality: 6,
        },
    );
    let err = probe_patch(&gzip.bytes[..], &CompressionRegistry::new()).unwrap_err();
    assert!(matches!(err, Error::IncompatiblePatch(_)), "{:?}", err);
}

#[test]
fn test_rediff_shrinks_and_round_trips() {
    let temp = tempfile::tempdir().unwrap();
    let old = temp.path().join("old");
    let new = temp.path().join("new");

    // Shift by a few bytes and sprinkle small edits: rsync finds few
    // whole blocks, bsdiff sees a near duplicate.
    let base = noise(4 * B, 60);
    let mut shifted = b"HDR".to_vec();
    shifted.extend_from_slice(&base);
    for i in (0..shifted.len()).step_by(4096) {
        shifted[i] = shifted[i].wrapping_add(1);
    }
    create_dir_tree(&old, &[("game.pak", &base)]);
    create_dir_tree(&new, &[("game.pak", &shifted)]);

    let patch = diff(&old, &new);
    let registry = CompressionRegistry::with_defaults();
    let target_container = Container::walk(&old).unwrap();
    let source_container = Container::walk(&new).unwrap();
    let target_pool = FsPool::new(&target_container, &old);
    let source_pool = FsPool::new(&source_container, &new);
    let ctx = RediffContext {
        target_pool: &target_pool,
        source_pool: &source_pool,
        options: RediffOptions::default(),
        registry: &registry,
        consumer: &TracingConsumer,
    };
    let mappings = ctx.analyze_patch(&patch.bytes[..]).unwrap();
    assert_eq!(mappings.len(), 1);
    let mut rediffed = Vec::new();
    let stats = ctx.optimize_patch(&patch.bytes[..], &mut rediffed, &mappings).unwrap();

    assert_eq!(stats.bsdiff_files, 1);
    assert!(rediffed.len() < patch.bytes.len(), "{} >= {}", rediffed.len(), patch.bytes.len());
    assert_eq!(probe_patch(&rediffed[..], &registry).unwrap().bsdiff_files(), 1);

    let live = temp.path().join("live");
    copy_tree(&old, &live);
    apply_in_place(&live, &rediffed).unwrap();
    assert_eq!(collect_dir_tree(&live), collect_dir_tree(&new));
}

#[test]
fn test_cli_diff_apply_verify() {
    let exe = env!("CARGO_BIN_EXE_treepatch");
    let temp = tempfile::tempdir().unwrap();
    let (old, new) = change_one_trees(temp.path());
    let patch_file = temp.path().join("update.patch");
    let signature_file = temp.path().join("update.sig");
    let live = temp.path().join("live");
    copy_tree(&old, &live);

    let status = Command::new(exe)
        .args(["diff", "--old"])
        .arg(&old)
        .arg("--new")
        .arg(&new)
        .arg("--output")
        .arg(&patch_file)
        .arg("--signature")
        .arg(&signature_file)
        .arg("--rediff")
        .status()
        .unwrap();
    assert!(status.success());

    let status = Command::new(exe)
        .args(["apply", "--patch"])
        .arg(&patch_file)
        .arg("--target")
        .arg(&live)
        .arg("--signature")
        .arg(&signature_file)
        .status()
        .unwrap();
    assert!(status.success());
    assert_eq!(collect_dir_tree(&live), collect_dir_tree(&new));

    let status = Command::new(exe)
        .args(["verify", "--dir"])
        .arg(&live)
        .arg("--signature")
        .arg(&signature_file)
        .status()
        .unwrap();
    assert!(status.success());

    fs::write(live.join("file-1"), b"broken").unwrap();
    let status = Command::new(exe)
        .args(["verify", "--dir"])
        .arg(&live)
        .arg("--signature")
        .arg(&signature_file)
        .status()
        .unwrap();
    assert!(!status.success());
}
