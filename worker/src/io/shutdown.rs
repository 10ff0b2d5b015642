//! Cooperative shutdown.
//!
//! SIGINT/SIGTERM only raise a flag. The scheduler checks it between
//! sessions and while sleeping; a running agent is never killed for it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result, anyhow};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

/// Shared shutdown flag, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    requested: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Watch SIGINT and SIGTERM on a dedicated thread and raise `token` when either arrives.
///
/// Returns once both handlers are registered.
pub fn install_signal_handlers(token: ShutdownToken) -> Result<()> {
    let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
    thread::Builder::new()
        .name("signal-watch".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = ready_tx.send(Err(anyhow!(err).context("build signal runtime")));
                    return;
                }
            };
            runtime.block_on(async move {
                let handlers = signal(SignalKind::interrupt())
                    .context("install SIGINT handler")
                    .and_then(|int| {
                        signal(SignalKind::terminate())
                            .context("install SIGTERM handler")
                            .map(|term| (int, term))
                    });
                let (mut interrupt, mut terminate) = match handlers {
                    Ok(pair) => pair,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                loop {
                    let name = tokio::select! {
                        _ = interrupt.recv() => "SIGINT",
                        _ = terminate.recv() => "SIGTERM",
                    };
                    if token.is_requested() {
                        warn!(
                            signal = name,
                            "shutdown already requested; waiting for current session"
                        );
                    } else {
                        info!(
                            signal = name,
                            "shutdown requested; finishing current session first"
                        );
                        token.request();
                    }
                }
            });
        })
        .context("spawn signal thread")?;
    ready_rx
        .recv()
        .context("signal thread exited before registering handlers")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        assert!(!clone.is_requested());
        token.request();
        assert!(clone.is_requested());
    }
}
