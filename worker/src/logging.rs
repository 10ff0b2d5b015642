//! Tracing setup for the worker.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: worker diagnostics via `RUST_LOG`, output to stderr.
//!
//! - **Agent output**: rendered agent text goes to stdout, agent stderr to
//!   stderr, and raw events optionally to `<log_dir>/<session>.jsonl`
//!   (see `io/agent`). Unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG` env var. Defaults to `session_worker=info` since the
/// worker is long-running and its progress is the main thing to watch.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=session_worker=debug session-worker run --unattended
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("session_worker=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
