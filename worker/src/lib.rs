//! Session worker: claims queued agent sessions from a git-backed store,
//! runs a coding agent on each, and makes sure every outcome is delivered
//! or reported.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (session lifecycle, prompt
//!   preparation, event parsing, delivery classification). No I/O.
//! - **[`io`]**: Side-effecting adapters (git, forge, child processes,
//!   terminal, session files, config, signals). Behind traits where tests
//!   need fakes.
//!
//! Orchestration modules ([`claim`], [`execute`], [`verify`], [`recovery`],
//! [`report`], [`publish`], [`scheduler`]) combine the two.

pub mod claim;
pub mod context;
pub mod core;
pub mod execute;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod publish;
pub mod recovery;
pub mod report;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
