//! voldrv CLI - inspect and repair volume metadata
//!
//! Works on local `snapshots.xml` files, on namespaces of the directory
//! backend and on the local metadata store.

use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voldrv_backend::{BackendInterface, BackendInterfacePtr, LocalBackend};
use voldrv_common::{Config, Namespace, SNAPSHOTS_FILENAME, SnapshotName, TLogId};
use voldrv_meta_store::{CheckScrubId, DryRun, MetaDataStoreBuilder, RedbMetaDataStore};
use voldrv_snapshot::{SnapshotPersistor, SnapshotStore};

#[derive(Parser, Debug)]
#[command(name = "voldrv-cli")]
#[command(about = "voldrv volume metadata tool")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/voldrv/voldrv.toml")]
    config: String,

    /// Backend root directory (overrides config)
    #[arg(long)]
    backend_root: Option<PathBuf>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Snapshot chain operations
    Snapshots {
        #[command(subcommand)]
        action: SnapshotsCommands,
    },
    /// Metadata store operations
    Metadata {
        #[command(subcommand)]
        action: MetadataCommands,
    },
}

#[derive(ClapArgs, Debug)]
struct FileArg {
    /// Snapshots file (defaults to the configured file name)
    #[arg(short, long)]
    file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum SnapshotsCommands {
    /// Show parent, scrub id, snapshots and current TLogs
    Show {
        #[command(flatten)]
        file: FileArg,
    },
    /// List TLogs
    Tlogs {
        #[command(flatten)]
        file: FileArg,
        /// Only TLogs not yet written to the backend
        #[arg(long, conflicts_with = "on_backend")]
        not_on_backend: bool,
        /// Only TLogs written to the backend
        #[arg(long)]
        on_backend: bool,
    },
    /// List snapshots that still need scrubbing
    ScrubWork {
        #[command(flatten)]
        file: FileArg,
        /// Exclusive start snapshot
        #[arg(long)]
        start: Option<String>,
        /// Inclusive end snapshot
        #[arg(long)]
        end: Option<String>,
    },
    /// Print the snapshots object stored in a backend namespace
    Dump {
        /// Namespace
        namespace: Namespace,
    },
    /// Drop everything the backend does not hold and save the result
    Trim {
        /// Namespace of the volume
        namespace: Namespace,
        #[command(flatten)]
        file: FileArg,
    },
}

#[derive(Subcommand, Debug)]
enum MetadataCommands {
    /// Bring the metadata store in sync with a namespace
    Rebuild {
        /// Namespace
        namespace: Namespace,
        /// Sync up to this cork instead of the newest durable one
        #[arg(long)]
        end_cork: Option<TLogId>,
        /// Only report what would be replayed
        #[arg(long)]
        dry_run: bool,
        /// Do not rebuild on a scrub id mismatch
        #[arg(long)]
        no_scrub_check: bool,
    },
}

fn load_config(path: &str) -> Config {
    if !Path::new(path).exists() {
        return Config::default();
    }
    match std::fs::read_to_string(path)
        .map_err(voldrv_common::Error::from)
        .and_then(|s| Config::from_toml(&s))
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Failed to load config file {path}: {e}");
            Config::default()
        }
    }
}

fn snapshots_file(config: &Config, file: FileArg) -> PathBuf {
    file.file
        .unwrap_or_else(|| PathBuf::from(&config.snapshots.file_name))
}

fn load_snapshots(config: &Config, path: &Path) -> Result<SnapshotPersistor> {
    let sp = match &config.snapshots.forensic_dir {
        Some(dir) => SnapshotPersistor::from_file_preserving(path, dir),
        None => SnapshotPersistor::from_file(path),
    };
    sp.with_context(|| format!("failed to load snapshots from {}", path.display()))
}

fn open_store(config: &Config, path: &Path, bi: BackendInterfacePtr) -> Result<SnapshotStore> {
    let store = match &config.snapshots.forensic_dir {
        Some(dir) => SnapshotStore::open_preserving(path, bi, dir),
        None => SnapshotStore::open(path, bi),
    };
    store.with_context(|| format!("failed to load snapshots from {}", path.display()))
}

fn backend(config: &Config, namespace: Namespace) -> Result<BackendInterfacePtr> {
    let bi = LocalBackend::new(&config.backend.root, namespace);
    if !bi.namespace_exists() {
        bail!(
            "namespace {} does not exist under {}",
            bi.namespace(),
            config.backend.root.display()
        );
    }
    Ok(bi.into_ptr())
}

fn print_tlogs(ids: &[TLogId]) {
    for id in ids {
        println!("{}", id.name());
    }
}

fn show(sp: &SnapshotPersistor) {
    println!("Snapshots");
    println!("=========");
    match sp.parent() {
        Some(p) => println!("Parent: {}/{}", p.namespace, p.snapshot),
        None => println!("Parent: -"),
    }
    println!("Scrub ID: {}", sp.scrub_id());
    println!();

    if sp.snapshots_empty() {
        println!("No snapshots found");
    } else {
        println!(
            "{:<6} {:<24} {:<38} {:<20} {:>6} {:<10} {:<8} {:>12}",
            "NUM", "NAME", "UUID", "DATE", "TLOGS", "IN BACKEND", "SCRUBBED", "SIZE"
        );
        println!("{}", "-".repeat(132));
        for s in sp.snapshots().iter() {
            println!(
                "{:<6} {:<24} {:<38} {:<20} {:>6} {:<10} {:<8} {:>12}",
                s.num(),
                s.name(),
                s.uuid(),
                s.date(),
                s.tlogs().len(),
                s.in_backend(),
                s.scrubbed(),
                s.backend_size()
            );
        }
    }
    println!();

    println!("Current TLogs");
    println!("{}", "-".repeat(60));
    for tlog in sp.current().iter() {
        println!(
            "{:<44} {:<6} {:>8}",
            tlog.name(),
            if tlog.written_to_backend() { "yes" } else { "no" },
            tlog.backend_size()
        );
    }
    println!();
    println!("Total backend size: {}", sp.get_total_backend_size());
}

fn run_snapshots(config: &Config, action: SnapshotsCommands) -> Result<()> {
    match action {
        SnapshotsCommands::Show { file } => {
            let sp = load_snapshots(config, &snapshots_file(config, file))?;
            show(&sp);
        }
        SnapshotsCommands::Tlogs {
            file,
            not_on_backend,
            on_backend,
        } => {
            let sp = load_snapshots(config, &snapshots_file(config, file))?;
            let ids = if on_backend {
                sp.get_tlogs_written_to_backend()
            } else if not_on_backend {
                sp.get_tlogs_not_written_to_backend()
            } else {
                sp.get_all_tlogs(true)
            };
            print_tlogs(&ids);
        }
        SnapshotsCommands::ScrubWork { file, start, end } => {
            let sp = load_snapshots(config, &snapshots_file(config, file))?;
            let start = start.map(SnapshotName::new);
            let end = end.map(SnapshotName::new);
            let work = sp.get_snapshot_scrubbing_work(start.as_ref(), end.as_ref())?;
            if work.is_empty() {
                println!("Nothing to scrub");
            }
            for name in work {
                println!("{name}");
            }
        }
        SnapshotsCommands::Dump { namespace } => {
            let bi = backend(config, namespace)?;
            let bytes = bi
                .get_object(SNAPSHOTS_FILENAME, true)
                .with_context(|| format!("failed to fetch {SNAPSHOTS_FILENAME} from {}", bi.namespace()))?;
            print!("{}", String::from_utf8_lossy(&bytes));
        }
        SnapshotsCommands::Trim { namespace, file } => {
            let path = snapshots_file(config, file);
            let store = open_store(config, &path, backend(config, namespace)?)?;
            let before = store.read(|sp| sp.get_all_tlogs(true).len());
            store.trim_to_backend()?;
            info!(
                "Trimmed {} from {} to {} TLogs",
                path.display(),
                before,
                store.read(|sp| sp.get_all_tlogs(true).len())
            );
            println!("Trimmed {}", path.display());
        }
    }
    Ok(())
}

fn run_metadata(config: &Config, action: MetadataCommands) -> Result<()> {
    match action {
        MetadataCommands::Rebuild {
            namespace,
            end_cork,
            dry_run,
            no_scrub_check,
        } => {
            let scratch_dir = config.metadata.scratch_dir.join(namespace.as_str());
            let bi = backend(config, namespace)?;
            let store = RedbMetaDataStore::open(&config.metadata.store_path).with_context(|| {
                format!(
                    "failed to open metadata store {}",
                    config.metadata.store_path.display()
                )
            })?;
            let builder = MetaDataStoreBuilder::new(&store, bi, scratch_dir)?;
            let check = if no_scrub_check {
                CheckScrubId::No
            } else {
                CheckScrubId::Yes
            };
            let dry_run = if dry_run { DryRun::Yes } else { DryRun::No };
            if dry_run == DryRun::Yes {
                warn!("Dry run: the metadata store is left untouched");
            }

            let res = builder.run(end_cork, check, dry_run)?;
            println!("TLogs replayed: {}", res.num_tlogs);
            for (clone_id, bi) in res.nsid_map.iter() {
                println!("  clone level {clone_id}: {}", bi.namespace());
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load config file if it exists, CLI takes precedence
    let mut config = load_config(&args.config);
    if let Some(root) = args.backend_root {
        config.backend.root = root;
    }
    let log_level = args.log_level.unwrap_or_else(|| config.logging.level.clone());

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Commands::Snapshots { action } => run_snapshots(&config, action),
        Commands::Metadata { action } => run_metadata(&config, action),
    }
}
