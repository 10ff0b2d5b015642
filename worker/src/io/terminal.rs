//! Terminal foreground handoff for supervised agents.
//!
//! Agents run in their own process group so the whole tree can be signalled
//! on timeout. A background group that touches the terminal is stopped with
//! SIGTTIN/SIGTTOU and hangs silently, so when the worker owns the terminal
//! foreground it lends it to the agent's group for the duration of the run.

use std::io::{self, IsTerminal};

use nix::sys::signal::{SigSet, SigmaskHow, Signal, pthread_sigmask};
use nix::unistd::{Pid, getpgrp, tcgetpgrp, tcsetpgrp};
use tracing::{debug, warn};

/// Gives the terminal foreground back to the worker when dropped.
#[derive(Debug)]
pub struct ForegroundGuard {
    previous: Pid,
}

impl ForegroundGuard {
    /// Hand the terminal foreground to `group`.
    ///
    /// Returns `None` (and changes nothing) when stdin is not a terminal or the
    /// worker is not the current foreground group.
    pub fn hand_to(group: Pid) -> Option<Self> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return None;
        }
        let foreground = match tcgetpgrp(&stdin) {
            Ok(pgrp) => pgrp,
            Err(errno) => {
                debug!(errno = %errno, "tcgetpgrp failed; not attaching terminal");
                return None;
            }
        };
        if foreground != getpgrp() {
            debug!("worker is not the terminal foreground group");
            return None;
        }
        match tcsetpgrp(&stdin, group) {
            Ok(()) => {
                debug!(pgid = group.as_raw(), "terminal foreground handed to agent");
                Some(Self {
                    previous: foreground,
                })
            }
            Err(errno) => {
                warn!(errno = %errno, "could not hand terminal to agent group");
                None
            }
        }
    }
}

impl Drop for ForegroundGuard {
    fn drop(&mut self) {
        // The worker is a background group at this point; without blocking
        // SIGTTOU the tcsetpgrp call below would stop the worker.
        let mut blocked = SigSet::empty();
        blocked.add(Signal::SIGTTOU);
        let mut old = SigSet::empty();
        if let Err(errno) =
            pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut old))
        {
            warn!(errno = %errno, "could not block SIGTTOU");
        }
        if let Err(errno) = tcsetpgrp(io::stdin(), self.previous) {
            warn!(errno = %errno, "could not reclaim terminal foreground");
        } else {
            debug!("terminal foreground reclaimed");
        }
        if let Err(errno) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old), None) {
            warn!(errno = %errno, "could not restore signal mask");
        }
    }
}
