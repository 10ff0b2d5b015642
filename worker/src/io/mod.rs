//! Side-effecting adapters: git, forge, processes, terminal, files, signals.

pub mod agent;
pub mod config;
pub mod forge;
pub mod git;
pub mod process;
pub mod session_store;
pub mod shutdown;
pub mod terminal;
