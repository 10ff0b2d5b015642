//! Session worker CLI.
//!
//! Polls `.orchestrator/sessions/` in a git repository for queued sessions,
//! claims one at a time through the remote, and runs a coding agent on it.

use std::env;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command as Process;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use session_worker::claim::{ClaimError, claim};
use session_worker::context::WorkerContext;
use session_worker::exit_codes;
use session_worker::io::agent::{Backend, CliAgent};
use session_worker::io::config::{CONFIG_PATH, ConfigOverrides, WorkerConfig, load_config};
use session_worker::io::forge::GhForge;
use session_worker::io::session_store::SessionFilter;
use session_worker::io::shutdown::{ShutdownToken, install_signal_handlers};
use session_worker::logging;
use session_worker::scheduler::{LoopStop, restart_args, run_loop};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "session-worker",
    version,
    about = "Claims queued agent sessions from a git-backed store and runs them"
)]
struct Cli {
    /// Repository holding the session store.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,
    /// Config file (default: <repo>/.orchestrator/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process queued sessions until stopped.
    Run(RunArgs),
    /// Claim one session and print it, without running the agent.
    Claim {
        id: String,
    },
    /// List sessions (queued and matching this worker's provider unless --all).
    List {
        #[arg(long)]
        all: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, value_enum)]
    backend: Option<Backend>,
    #[arg(long)]
    model: Option<String>,
    /// Seconds between polls when the queue is empty.
    #[arg(long, value_name = "SECS")]
    poll_interval: Option<u64>,
    /// Tell the agent to finish without asking questions and deliver a change request.
    #[arg(long)]
    unattended: bool,
    /// Stop after this many sessions (0 = unlimited).
    #[arg(long)]
    max_sessions: Option<u32>,
    /// Per-session timeout in seconds (0 disables).
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
    /// Set by the worker itself when it re-execs after a self-update.
    #[arg(long, hide = true)]
    restarted: bool,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            if err.downcast_ref::<ClaimError>().is_some() {
                exit_codes::CLAIM_CONFLICT
            } else {
                exit_codes::INVALID
            }
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.repo.join(CONFIG_PATH));
    let config = load_config(&config_path)?;
    match cli.command {
        Command::Run(args) => cmd_run(&cli.repo, config, &args),
        Command::Claim { id } => cmd_claim(&cli.repo, &config, &id),
        Command::List { all } => cmd_list(&cli.repo, &config, all),
    }
}

fn cmd_run(repo: &Path, config: WorkerConfig, args: &RunArgs) -> Result<i32> {
    let config = config.with_overrides(&ConfigOverrides {
        backend: args.backend,
        model: args.model.clone(),
        poll_interval_secs: args.poll_interval,
        unattended: args.unattended,
        max_sessions: args.max_sessions,
        session_timeout_secs: args.timeout,
    })?;
    if args.restarted {
        info!(max_sessions = config.max_sessions, "restarted after self-update");
    }

    let shutdown = ShutdownToken::new();
    install_signal_handlers(shutdown.clone())?;
    let agent = CliAgent::new(
        config.agent_settings(),
        config.supervise_options(),
        config.log_dir.clone(),
        shutdown.clone(),
    );
    let forge = GhForge::new(repo);
    let ctx = WorkerContext::new(repo, &config, &agent, &forge, shutdown);

    let outcome = run_loop(&ctx)?;
    match outcome.stop {
        LoopStop::Restart { remaining } => restart(repo, &config, remaining),
        LoopStop::Shutdown | LoopStop::MaxSessions => Ok(exit_codes::OK),
    }
}

fn cmd_claim(repo: &Path, config: &WorkerConfig, id: &str) -> Result<i32> {
    let shutdown = ShutdownToken::new();
    let agent = CliAgent::new(
        config.agent_settings(),
        config.supervise_options(),
        None,
        shutdown.clone(),
    );
    let forge = GhForge::new(repo);
    let ctx = WorkerContext::new(repo, config, &agent, &forge, shutdown);
    let claimed = claim(&ctx, id)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&claimed.session).context("serialize session")?
    );
    Ok(exit_codes::OK)
}

fn cmd_list(repo: &Path, config: &WorkerConfig, all: bool) -> Result<i32> {
    let store = session_worker::io::session_store::SessionStore::new(repo, &config.sessions_dir);
    let filter = SessionFilter {
        all,
        provider: config.provider.clone(),
    };
    for session in store.list_filtered(&filter)? {
        println!(
            "{}\t{}\t{}\t{}",
            session.id,
            session.status,
            session.provider.as_deref().unwrap_or("-"),
            session.started_at.as_deref().unwrap_or("-")
        );
    }
    Ok(exit_codes::OK)
}

/// Rebuild if configured, then replace this process with the fresh binary.
fn restart(repo: &Path, config: &WorkerConfig, remaining: Option<u32>) -> Result<i32> {
    if let Some((program, rest)) = config.self_update.rebuild_command.split_first() {
        info!(command = %config.self_update.rebuild_command.join(" "), "rebuilding worker");
        let status = Process::new(program)
            .args(rest)
            .current_dir(repo)
            .status()
            .with_context(|| format!("spawn rebuild command {program}"))?;
        if !status.success() {
            bail!("rebuild command failed with {status}");
        }
    }

    // argv[0] resolves to the rebuilt binary; /proc/self/exe may point at the deleted one.
    let program = match env::args_os().next() {
        Some(argv0) if !argv0.is_empty() => PathBuf::from(argv0),
        _ => env::current_exe().context("locate current executable")?,
    };
    let original: Vec<String> = env::args().skip(1).collect();
    let args = restart_args(&original, remaining);
    info!(program = %program.display(), ?remaining, "re-executing worker");
    let err = Process::new(&program).args(&args).exec();
    Err(anyhow!(err).context(format!("re-exec {}", program.display())))
}
