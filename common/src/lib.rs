//! Common utilities for zsync tools
//!
//! This crate holds the parts of snapshot replication that do not depend on where a
//! filesystem lives:
//!
//! - [`catalog`]: parsing `zfs get -Hp creation` output into a [`catalog::SnapshotCatalog`]
//! - [`plan`]: computing the ordered list of snapshots a destination is missing
//! - [`pipeline`]: running argv pipelines as connected local processes
//! - [`run`]: the tokio runtime and tracing bootstrap shared by the binaries

pub mod catalog;
pub mod config;
pub mod pipeline;
pub mod plan;

pub use config::{OutputConfig, RuntimeConfig};

/// Install the global tracing subscriber for the given output settings.
///
/// `RUST_LOG`, when set, takes precedence over the level computed from `output`.
pub fn init_tracing(output: &OutputConfig) {
    use std::io::IsTerminal;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.log_level().to_string()));
    if let Err(error) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init()
    {
        eprintln!("tracing subscriber already installed: {error}");
    }
}

/// Run `func` to completion on a fresh tokio runtime.
///
/// Returns `None` if the runtime could not be built or `func` failed; the error is logged.
pub fn run<Fut, Summary, Error>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    init_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            tracing::error!("failed to start tokio runtime: {:#}", error);
            return None;
        }
    };
    match tokio_runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", error);
            None
        }
    }
}
