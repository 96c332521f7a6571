//! # cellar CLI
//!
//! Command-line interface for the cellar backup store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};

use cellar_export::LocalExporter;
use cellar_fs::OsFs;
use cellar_store::{Store, SystemClock};

mod backup;

/// Content-addressed, deduplicating, versioned file backup store.
#[derive(Parser)]
#[command(name = "cellar")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Store root directory
    #[arg(long = "store", default_value = ".", env = "CELLAR_STORE")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new store in an existing empty directory
    Init,

    /// Register a new bucket
    CreateBucket {
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// List the store's buckets
    ListBuckets,

    /// List the revisions of a bucket
    ListRevisions {
        #[arg(value_name = "BUCKET")]
        bucket: String,
    },

    /// Back up a directory tree into a bucket
    BackupTo {
        #[arg(value_name = "BUCKET")]
        bucket: String,

        #[arg(value_name = "DIR")]
        source: PathBuf,

        /// Skip paths containing this substring (repeatable)
        #[arg(long = "exclude", value_name = "PATTERN")]
        excludes: Vec<String>,
    },

    /// Materialize a revision into a directory
    Export {
        #[arg(value_name = "BUCKET")]
        bucket: String,

        #[arg(value_name = "DIR")]
        out_dir: PathBuf,

        /// Revision timestamp; latest when omitted
        #[arg(long)]
        version: Option<i64>,
    },

    /// Check that every object a revision references is present
    Verify {
        #[arg(value_name = "BUCKET")]
        bucket: String,

        /// Revision timestamp; latest when omitted
        #[arg(long)]
        version: Option<i64>,
    },

    /// Apply pending schema migrations
    RunMigrations,

    /// Search paths across all buckets and revisions
    Search {
        #[arg(value_name = "TERM")]
        term: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CELLAR_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let fs = Arc::new(OsFs::new());
    let clock = Arc::new(SystemClock);

    if let Commands::Init = cli.command {
        Store::init(fs, clock, &cli.store)
            .with_context(|| format!("initializing store at {}", cli.store.display()))?;
        println!("initialized store at {}", cli.store.display());
        return Ok(());
    }

    let store = Store::open(fs.clone(), clock, &cli.store)
        .with_context(|| format!("opening store at {}", cli.store.display()))?;

    match cli.command {
        Commands::Init => unreachable!("handled above"),

        Commands::CreateBucket { name } => {
            let bucket = store.create_bucket(&name)?;
            println!("created bucket {} (id {})", bucket.name, bucket.id);
        }

        Commands::ListBuckets => {
            for bucket in store.buckets()? {
                println!("{}\t{}", bucket.id, bucket.name);
            }
        }

        Commands::ListRevisions { bucket } => {
            let bucket = store.bucket_by_name(&bucket)?;
            for revision in store.revisions(&bucket)? {
                let when = DateTime::from_timestamp(revision.version, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "?".to_string());
                println!("{}\t{}", revision.version, when);
            }
        }

        Commands::BackupTo {
            bucket,
            source,
            excludes,
        } => {
            let revision = backup::run(&store, fs.as_ref(), &bucket, &source, &excludes)
                .with_context(|| format!("backing up {} to {bucket}", source.display()))?;
            println!("committed revision {} of {bucket}", revision.version);
        }

        Commands::Export {
            bucket,
            out_dir,
            version,
        } => {
            let exporter = LocalExporter::new(&store, fs.clone(), &out_dir);
            let revision = exporter
                .export(&bucket, version)
                .with_context(|| format!("exporting {bucket} to {}", out_dir.display()))?;
            println!(
                "exported revision {} of {bucket} to {}",
                revision.version,
                out_dir.display()
            );
        }

        Commands::Verify { bucket, version } => {
            let bucket = store.bucket_by_name(&bucket)?;
            let revision = match version {
                Some(version) => store.get_revision(&bucket, version)?,
                None => store.latest_revision(&bucket)?,
            };
            store.verify_revision(&revision)?;
            println!("revision {} of {} verified", revision.version, bucket.name);
        }

        Commands::RunMigrations => {
            // Store::open already applied them; say so explicitly.
            store.run_migrations()?;
            println!(
                "store is at schema version {}",
                store.status()?.schema_version
            );
        }

        Commands::Search { term } => {
            for result in store.search(&term)? {
                println!(
                    "{}\t{}\t{}",
                    result.bucket.name, result.revision, result.relative_path
                );
            }
        }
    }

    Ok(())
}
