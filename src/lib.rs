//! # s3packer
//!
//! Streams objects from S3-compatible storage into a single zip archive,
//! written either to a local file or back to the store as a multipart upload.
//!
//! ## Design Philosophy
//!
//! s3packer is designed to be:
//! - **Streaming** - Content flows through bounded queues; no stage holds more
//!   than a few objects and the archive is never staged on disk
//! - **Fail-fast** - The first failure cancels the run and leaves no archive behind
//! - **Library-first** - The `s3packer` binary is a thin shell over [`Packer`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use s3packer::{Config, pack};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env();
//!
//!     let summary = pack(
//!         &config,
//!         "s3://archives/photos-2024.zip",
//!         &["s3://media/photos/2024/", "s3://media/albums/best.jpg"],
//!     )
//!     .await?;
//!
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Location parsing
pub mod location;
/// Traversal, fetch, archive and sink stages
pub mod pipeline;
/// Object store abstraction and implementations
pub mod store;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

// Re-export commonly used types
pub use config::{Config, EntryOrder, PipelineConfig, StoreConfig};
pub use error::{Error, Result, Stage, StoreError};
pub use location::{Destination, EntryNaming, Location, ObjectLocator, SourceLocation};
pub use pipeline::{PackSummary, Packer};
pub use store::{MemoryStore, ObjectBody, ObjectStore, S3Store};

/// Pack `sources` into a zip archive at `destination` using an S3 session built from `config`
pub async fn pack<S: AsRef<str>>(
    config: &Config,
    destination: &str,
    sources: &[S],
) -> Result<PackSummary> {
    config.validate()?;
    let store = Arc::new(S3Store::new(config.store.clone())?);
    Packer::new(store, config.pipeline.clone())?
        .pack(destination, sources)
        .await
}

/// Helper function to run a pack with graceful signal handling.
///
/// The run is cancelled when a termination signal arrives; the partial
/// destination is cleaned up and [`Error::Cancelled`] is returned.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use s3packer::{Config, Packer, S3Store, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::from_env();
///     let store = Arc::new(S3Store::new(config.store.clone())?);
///     let packer = Packer::new(store, config.pipeline)?;
///
///     // Ctrl+C aborts the upload instead of leaving it half-finished
///     run_with_shutdown(&packer, "s3://archives/logs.zip", &["s3://logs/2024/"]).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown<S: AsRef<str>>(
    packer: &Packer,
    destination: &str,
    sources: &[S],
) -> Result<PackSummary> {
    let cancel = CancellationToken::new();
    let run = packer.pack_with_cancel(destination, sources, cancel.clone());
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result,
        _ = wait_for_signal() => {
            cancel.cancel();
            // Let the stages clean up the destination before returning
            run.await
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal handlers may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal, cancelling pack");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C), cancelling pack");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C), cancelling pack");
            } else {
                ctrl_c_fallback().await;
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal, cancelling pack");
            } else {
                ctrl_c_fallback().await;
            }
        }
    }
}

#[cfg(unix)]
async fn ctrl_c_fallback() {
    tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
    if tokio::signal::ctrl_c().await.is_err() {
        // Never resolve: without a handler the run can only end on its own
        std::future::pending::<()>().await;
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal, cancelling pack");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
            std::future::pending::<()>().await;
        }
    }
}
