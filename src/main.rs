use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use treepatch::apply::{ApplyContext, ApplyOptions, ApplyStats};
use treepatch::checkpoint::{CheckpointStore, FileCheckpointStore};
use treepatch::compression::{CompressionAlgorithm, CompressionRegistry, CompressionSettings};
use treepatch::consumer::{CancellationToken, TracingConsumer};
use treepatch::container::Container;
use treepatch::create::{DiffContext, DiffOptions, DiffStats};
use treepatch::healer::{Healer, HealerOptions};
use treepatch::pool::FsPool;
use treepatch::probe;
use treepatch::rediff::{self, RediffContext, RediffOptions, RediffStats, DEFAULT_REDIFF_SIZE_LIMIT};
use treepatch::signature::{self, SignatureInfo};
use treepatch::validator::{self, default_workers, ValidatorOptions};
use treepatch::wounds::{self, WoundsConsumer};

#[derive(Parser)]
#[command(name = "treepatch", about = "Block-level delta patches between directory trees")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Codec {
    None,
    Gzip,
    Zstd,
}

#[derive(Args)]
struct CompressionArgs {
    /// Compression for the files written
    #[arg(long, value_enum, default_value_t = Codec::Zstd)]
    compression: Codec,
    /// Codec quality level
    #[arg(long, default_value_t = 9)]
    quality: i32,
}

impl CompressionArgs {
    fn settings(&self) -> CompressionSettings {
        let algorithm = match self.compression {
            Codec::None => CompressionAlgorithm::None,
            Codec::Gzip => CompressionAlgorithm::Gzip,
            Codec::Zstd => CompressionAlgorithm::Zstd,
        };
        CompressionSettings {
            algorithm,
            quality: self.quality,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch from an old tree (or its signature) to a new tree
    Diff {
        /// Old directory, or a signature file of it
        #[arg(long)]
        old: PathBuf,
        /// New directory
        #[arg(long)]
        new: PathBuf,
        /// Output path for the patch file
        #[arg(long, short)]
        output: PathBuf,
        /// Output path for the new tree's signature [default: <output>.sig]
        #[arg(long)]
        signature: Option<PathBuf>,
        /// Re-encode changed files with bsdiff (needs the old directory)
        #[arg(long)]
        rediff: bool,
        #[command(flatten)]
        compression: CompressionArgs,
    },
    /// Apply a patch to a target directory
    Apply {
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Path to the directory the patch was made against
        #[arg(long)]
        target: PathBuf,
        /// Write the new tree here instead of patching the target in place
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Signature of the new tree, to check every byte as it is written
        #[arg(long)]
        signature: Option<PathBuf>,
        /// Stage directory for in-place applies [default: <target>-stage]
        #[arg(long)]
        stage: Option<PathBuf>,
        /// Save progress here so an interrupted apply can resume
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// Write the signature of a directory
    Sign {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
        #[command(flatten)]
        compression: CompressionArgs,
    },
    /// Check a directory against a signature
    Verify {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        signature: PathBuf,
        /// Record wounds to this file
        #[arg(long, conflicts_with_all = ["fail_fast", "heal_from"])]
        wounds: Option<PathBuf>,
        /// Stop at the first problem
        #[arg(long)]
        fail_fast: bool,
        /// Repair wounded files from a pristine copy of the tree
        #[arg(long, conflicts_with = "fail_fast")]
        heal_from: Option<PathBuf>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Repair the wounds recorded by `verify --wounds`
    Heal {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        wounds: PathBuf,
        /// Pristine copy of the tree
        #[arg(long)]
        archive: PathBuf,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Rewrite a patch with bsdiff bodies where they pay off
    Rediff {
        #[arg(long, short)]
        patch: PathBuf,
        #[arg(long)]
        old: PathBuf,
        #[arg(long)]
        new: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
        /// Files larger than this keep their rsync ops
        #[arg(long, default_value_t = DEFAULT_REDIFF_SIZE_LIMIT)]
        size_limit: u64,
        /// Also bsdiff files that are renamed or untouched
        #[arg(long)]
        force_map_all: bool,
    },
    /// Describe a patch without applying it
    Probe {
        #[arg(long, short)]
        patch: PathBuf,
        /// List every file
        #[arg(long)]
        files: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let registry = Arc::new(CompressionRegistry::with_defaults());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, stopping at the next file boundary");
                cancel.cancel();
            }
        });
    }

    let start = Instant::now();

    match cli.command {
        Commands::Diff {
            old,
            new,
            output,
            signature,
            rediff,
            compression,
        } => {
            println!("Creating patch...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let signature_out = signature.unwrap_or_else(|| with_suffix(&output, ".sig"));
            let options = DiffOptions {
                compression: compression.settings(),
                cancel,
            };
            let (stats, rediffed) =
                diff(old, new, output, signature_out, rediff, options, registry).await?;

            println!("\nPatch created successfully!");
            println!("  Old size: {} bytes", stats.target_size);
            println!("  New size: {} bytes", stats.source_size);
            println!(
                "  Reused: {} bytes ({:.1}%)",
                stats.reused_bytes,
                stats.reuse_ratio() * 100.0
            );
            println!("  Fresh data: {} bytes", stats.fresh_bytes);
            if let Some(rediffed) = rediffed {
                println!("  Rediffed files: {}", rediffed.bsdiff_files);
            }
        }
        Commands::Apply {
            patch,
            target,
            output,
            signature,
            stage,
            checkpoint,
        } => {
            println!("Applying patch...");
            println!("  Target: {}", target.display());
            println!("  Patch: {}", patch.display());

            let stats =
                apply(patch, target, output, signature, stage, checkpoint, cancel, registry)
                    .await?;

            println!("\nPatch applied successfully!");
            println!("  Files touched: {}", stats.touched_files);
            println!("  Files unchanged: {}", stats.noop_files);
            println!("  Files moved: {}", stats.moved_files);
            println!("  Files deleted: {}", stats.deleted_files);
            println!("  Directories deleted: {}", stats.deleted_dirs);
        }
        Commands::Sign { dir, output, compression } => {
            let settings = compression.settings();
            let container = tokio::task::spawn_blocking(move || -> Result<Container> {
                let signature = sign_dir(&dir)?;
                let out = BufWriter::new(create_file(&output)?);
                signature::write_signature(out, &signature, &settings, &registry)
                    .context("Failed to write signature")?;
                Ok(signature.container)
            })
            .await??;

            println!("Signed {}", container.stats());
        }
        Commands::Verify {
            dir,
            signature,
            wounds,
            fail_fast,
            heal_from,
            workers,
        } => {
            let workers = workers.unwrap_or_else(default_workers);
            tokio::task::spawn_blocking(move || {
                verify(dir, signature, wounds, fail_fast, heal_from, workers, cancel, &registry)
            })
            .await??;
        }
        Commands::Heal {
            dir,
            wounds,
            archive,
            workers,
        } => {
            let options = HealerOptions {
                workers: workers.unwrap_or_else(default_workers),
                lock_map: None,
                cancel,
            };
            let healed = tokio::task::spawn_blocking(move || -> Result<u64> {
                let file = open_file(&wounds)?;
                let (container, recorded) = wounds::read_wounds_file(BufReader::new(file))
                    .context("Failed to read wounds file")?;

                let (tx, rx) = mpsc::sync_channel(recorded.len().max(1));
                for wound in recorded {
                    tx.send(wound).context("Failed to queue wound")?;
                }
                drop(tx);

                let mut healer = Healer::from_directory(&dir, &archive, options, &TracingConsumer);
                healer.consume(&container, rx).context("Healing failed")?;
                Ok(healer.total_healed())
            })
            .await??;

            println!("Healed {} bytes", healed);
        }
        Commands::Rediff {
            patch,
            old,
            new,
            output,
            size_limit,
            force_map_all,
        } => {
            let options = RediffOptions {
                size_limit,
                compression: None,
                force_map_all,
                cancel,
            };
            let stats = tokio::task::spawn_blocking(move || {
                rediff_file(&patch, &old, &new, &output, options, &registry)
            })
            .await??;

            println!("Rediffed {} files, kept {} as is", stats.bsdiff_files, stats.rsync_files);
        }
        Commands::Probe { patch, files } => {
            let summary = tokio::task::spawn_blocking(move || -> Result<probe::PatchSummary> {
                let file = open_file(&patch)?;
                probe::probe_patch(BufReader::new(file), &registry).context("Failed to read patch")
            })
            .await??;

            println!("Compression: {}", summary.compression);
            println!("Old: {}", summary.target.stats());
            println!("New: {}", summary.source.stats());
            println!(
                "Files: {} rsync, {} bsdiff",
                summary.files.len() - summary.bsdiff_files(),
                summary.bsdiff_files()
            );
            println!("Reused: {} bytes", summary.reused_bytes());
            println!("Fresh data: {} bytes", summary.fresh_bytes());
            if files {
                for file in &summary.files {
                    println!(
                        "  {:?} {} (reused {}, fresh {})",
                        file.kind, file.path, file.reused_bytes, file.fresh_bytes
                    );
                }
            }
        }
    }

    println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn open_file(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("Failed to open {}", path.display()))
}

fn create_file(path: &Path) -> Result<File> {
    File::create(path).with_context(|| format!("Failed to create {}", path.display()))
}

fn scan_dir(dir: &Path) -> Result<Container> {
    Container::walk(dir).with_context(|| format!("Failed to scan {}", dir.display()))
}

fn sign_dir(dir: &Path) -> Result<SignatureInfo> {
    let container = scan_dir(dir)?;
    let pool = FsPool::new(&container, dir);
    let hashes = signature::compute_signature(&container, &pool, &TracingConsumer)
        .with_context(|| format!("Failed to hash {}", dir.display()))?;
    Ok(SignatureInfo { container, hashes })
}

fn read_signature_file(path: &Path, registry: &CompressionRegistry) -> Result<SignatureInfo> {
    let file = open_file(path)?;
    signature::read_signature(BufReader::new(file), registry)
        .with_context(|| format!("Failed to read signature {}", path.display()))
}

async fn diff(
    old: PathBuf,
    new: PathBuf,
    output: PathBuf,
    signature_out: PathBuf,
    rediff: bool,
    options: DiffOptions,
    registry: Arc<CompressionRegistry>,
) -> Result<(DiffStats, Option<RediffStats>)> {
    if rediff && !old.is_dir() {
        bail!("--rediff needs the old directory, not a signature");
    }

    // Sign (or load) the old tree while the new one is scanned
    let old_for_sign = old.clone();
    let new_for_walk = new.clone();
    let registry_for_sign = registry.clone();
    let (target_signature, source_container) = tokio::try_join!(
        tokio::task::spawn_blocking(move || -> Result<SignatureInfo> {
            if old_for_sign.is_dir() {
                sign_dir(&old_for_sign)
            } else {
                read_signature_file(&old_for_sign, &registry_for_sign)
            }
        }),
        tokio::task::spawn_blocking(move || scan_dir(&new_for_walk)),
    )?;
    let target_signature = target_signature?;
    let source_container = source_container?;

    tokio::task::spawn_blocking(move || -> Result<(DiffStats, Option<RediffStats>)> {
        let rsync_path = if rediff { with_suffix(&output, ".rsync") } else { output.clone() };
        let rediff_options = RediffOptions {
            cancel: options.cancel.clone(),
            ..Default::default()
        };

        let source_pool = FsPool::new(&source_container, &new);
        let patch_out = BufWriter::new(create_file(&rsync_path)?);
        let signature_file = BufWriter::new(create_file(&signature_out)?);
        let stats = DiffContext {
            target_signature: &target_signature,
            source_container: &source_container,
            source_pool: &source_pool,
            options,
            registry: &registry,
            consumer: &TracingConsumer,
        }
        .write_patch(patch_out, signature_file)
        .context("Failed to write patch")?;

        if !rediff {
            return Ok((stats, None));
        }
        let rediffed = rediff_file(&rsync_path, &old, &new, &output, rediff_options, &registry)?;
        fs::remove_file(&rsync_path)
            .with_context(|| format!("Failed to remove {}", rsync_path.display()))?;
        Ok((stats, Some(rediffed)))
    })
    .await?
}

fn rediff_file(
    patch: &Path,
    old: &Path,
    new: &Path,
    output: &Path,
    options: RediffOptions,
    registry: &CompressionRegistry,
) -> Result<RediffStats> {
    let open = || -> Result<BufReader<File>> { Ok(BufReader::new(open_file(patch)?)) };

    let target_container = scan_dir(old)?;
    let source_container = scan_dir(new)?;
    let target_pool = FsPool::new(&target_container, old);
    let source_pool = FsPool::new(&source_container, new);
    let ctx = RediffContext {
        target_pool: &target_pool,
        source_pool: &source_pool,
        options,
        registry,
        consumer: &TracingConsumer,
    };

    let mappings = ctx.analyze_patch(open()?).context("Failed to analyze patch")?;
    tracing::debug!(
        "diff mappings:\n{}",
        rediff::describe_mappings(&mappings, &target_container, &source_container)
    );

    let out = BufWriter::new(create_file(output)?);
    ctx.optimize_patch(open()?, out, &mappings).context("Failed to rewrite patch")
}

#[allow(clippy::too_many_arguments)]
async fn apply(
    patch: PathBuf,
    target: PathBuf,
    output: Option<PathBuf>,
    signature: Option<PathBuf>,
    stage: Option<PathBuf>,
    checkpoint: Option<PathBuf>,
    cancel: CancellationToken,
    registry: Arc<CompressionRegistry>,
) -> Result<ApplyStats> {
    let target = target
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize target: {}", target.display()))?;
    let in_place = output.is_none();
    let output = match output {
        Some(output) => {
            fs::create_dir_all(&output)
                .with_context(|| format!("Failed to create {}", output.display()))?;
            output.canonicalize()?
        }
        None => target.clone(),
    };

    tokio::task::spawn_blocking(move || -> Result<ApplyStats> {
        let signature = signature
            .map(|path| read_signature_file(&path, &registry))
            .transpose()?;
        let store = checkpoint.map(|path| Arc::new(FileCheckpointStore::new(path, cancel.clone())));

        let mut ctx = ApplyContext {
            target_path: &target,
            output_path: &output,
            signature: signature.as_ref(),
            wounds_consumer: None,
            options: ApplyOptions {
                in_place,
                stage_path: stage,
                checkpoint: store.clone().map(|s| s as Arc<dyn CheckpointStore>),
                cancel,
                ..Default::default()
            },
            registry: &registry,
            consumer: &TracingConsumer,
        };

        let file = open_file(&patch)?;
        let stats = match ctx.apply_patch(BufReader::new(file)) {
            Err(e) if e.is_cancelled() && store.is_some() => {
                bail!("Apply interrupted, run the same command again to resume")
            }
            result => result.context("Failed to apply patch")?,
        };
        if let Some(store) = &store {
            store.clear().context("Failed to remove checkpoint")?;
        }
        Ok(stats)
    })
    .await?
}

#[allow(clippy::too_many_arguments)]
fn verify(
    dir: PathBuf,
    signature: PathBuf,
    wounds_path: Option<PathBuf>,
    fail_fast: bool,
    heal_from: Option<PathBuf>,
    workers: usize,
    cancel: CancellationToken,
    registry: &CompressionRegistry,
) -> Result<()> {
    let signature = read_signature_file(&signature, registry)?;
    let options = ValidatorOptions {
        workers,
        fail_fast,
        wounds_path,
        cancel: cancel.clone(),
    };

    if let Some(archive) = heal_from {
        let healer_options = HealerOptions {
            workers,
            lock_map: None,
            cancel,
        };
        let mut healer = Healer::from_directory(&dir, archive, healer_options, &TracingConsumer);
        validator::validate(&dir, &signature, &mut healer, &options, &TracingConsumer)
            .context("Healing failed")?;
        println!(
            "{} bytes corrupted, {} bytes healed",
            healer.total_corrupted(),
            healer.total_healed()
        );
        return Ok(());
    }

    let mut wounds_consumer = options.make_consumer(&TracingConsumer)?;
    validator::validate(&dir, &signature, wounds_consumer.as_mut(), &options, &TracingConsumer)
        .context("Verification failed")?;
    if wounds_consumer.has_wounds() {
        bail!("{} bytes corrupted", wounds_consumer.total_corrupted());
    }
    println!("{} is intact", signature.container.stats());
    Ok(())
}
