//! Command-line entry point for s3packer.
//!
//! ```bash
//! # Pack two prefixes into a local archive
//! s3packer photos.zip s3://media/photos/2023/ s3://media/photos/2024/
//!
//! # Pack into the store, entries in listing order, with progress logging
//! s3packer -v --ordered s3://archives/photos.zip s3://media/photos/
//!
//! # Show what would be packed
//! s3packer --dry-run out.zip s3://media/photos/
//! ```
//!
//! Store settings come from the environment (`AWS_*`, `S3_ENDPOINT_BASE`,
//! `S3_ENDPOINT`). `RUST_LOG` overrides the `-v` log level.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

use s3packer::{Config, EntryOrder, Packer, S3Store, run_with_shutdown};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    name = "s3packer",
    about = "Pack S3 objects into a single zip archive",
    long_about = "Recursively collects every object below the given S3 locations and streams \
                  them into one zip archive, written to a local file or uploaded to S3.",
    version
)]
struct Cli {
    /// Archive destination: a local path, file://path or s3://bucket/key
    destination: String,

    /// Objects or prefixes to pack (s3://bucket/key-or-prefix)
    #[arg(required = true)]
    sources: Vec<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// List the objects that would be packed without fetching them
    #[arg(long)]
    dry_run: bool,

    /// Maximum concurrent object retrievals
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Multipart upload part size in bytes
    #[arg(long, value_name = "BYTES")]
    part_size: Option<usize>,

    /// Write entries in listing order instead of completion order
    #[arg(long)]
    ordered: bool,
}

impl Cli {
    fn config(&self) -> Config {
        let mut config = Config::from_env();
        if let Some(concurrency) = self.concurrency {
            config.pipeline.fetch_concurrency = concurrency;
        }
        if let Some(part_size) = self.part_size {
            config.pipeline.part_size = part_size;
        }
        if self.ordered {
            config.pipeline.entry_order = EntryOrder::Enumeration;
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    tracing::debug!(?cli, "parsed arguments");

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, stage = ?e.stage(), "pack failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> s3packer::Result<()> {
    let config = cli.config();
    config.validate()?;

    let store = Arc::new(S3Store::new(config.store.clone())?);
    let packer = Packer::new(store, config.pipeline)?;

    if cli.dry_run {
        let objects = packer.plan(&cli.sources).await?;
        let total: u64 = objects.iter().map(|o| o.size).sum();
        for object in &objects {
            println!("{:>12}  {object}", object.size);
        }
        println!(
            "{} objects, {total} bytes would be packed into {}",
            objects.len(),
            cli.destination
        );
        return Ok(());
    }

    let summary = run_with_shutdown(&packer, &cli.destination, &cli.sources).await?;
    println!("{summary}");
    Ok(())
}
