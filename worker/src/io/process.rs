//! Supervision of long-running child processes.
//!
//! The child leads its own process group so that termination reaches every
//! process it spawned. Output is read concurrently on scoped threads while
//! the parent waits in short slices, which lets one loop enforce both the
//! wall-clock timeout and the post-result grace period.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::tail::TailBuffer;
use crate::exit_codes::{AGENT_TIMEOUT, SIGNAL_BASE};
use crate::io::terminal::ForegroundGuard;

const WAIT_SLICE: Duration = Duration::from_millis(250);

/// Limits and plumbing for one supervised run.
#[derive(Debug, Clone)]
pub struct SuperviseOptions {
    /// Wall-clock limit; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Time between SIGTERM and SIGKILL once the limit is hit.
    pub kill_grace: Duration,
    /// Force-kill a child still alive this long after it reported its result.
    pub result_grace: Option<Duration>,
    /// Bytes of stdout and of stderr kept for diagnostics.
    pub tail_bytes: usize,
    /// Raw stdout lines are appended here when set.
    pub tee_path: Option<PathBuf>,
    /// Inherit stdin and lend the terminal foreground to the child.
    pub attach_terminal: bool,
}

/// How a supervised child ended.
#[derive(Debug, Clone)]
pub struct SupervisedOutput {
    /// Exit code, [`AGENT_TIMEOUT`] on timeout, `128 + n` when killed by signal `n`.
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub timed_out: bool,
    /// The child finished its work but had to be killed afterwards.
    pub killed_after_result: bool,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

impl SupervisedOutput {
    pub fn interrupted(&self) -> bool {
        !self.timed_out && self.signal == Some(Signal::SIGINT as i32)
    }
}

/// Run `cmd` under supervision.
///
/// `on_stdout` sees every stdout line (without the trailing newline) and
/// returns `true` once the line marks the end of the child's work. Stderr is
/// echoed to the worker's stderr.
#[instrument(
    skip_all,
    fields(
        timeout_secs = options.timeout.map(|t| t.as_secs()),
        tail_bytes = options.tail_bytes
    )
)]
pub fn run_supervised(
    mut cmd: Command,
    options: &SuperviseOptions,
    on_stdout: &mut (dyn FnMut(&str) -> bool + Send),
) -> Result<SupervisedOutput> {
    cmd.process_group(0)
        .stdin(if options.attach_terminal {
            Stdio::inherit()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let tee = open_tee(options.tee_path.as_deref())?;

    debug!("spawning supervised child");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    let pgid = Pid::from_raw(i32::try_from(child.id()).context("child pid out of range")?);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let result_seen = AtomicBool::new(false);
    let result_seen = &result_seen;

    thread::scope(|scope| -> Result<SupervisedOutput> {
        let stdout_handle = scope.spawn(move || {
            read_stdout(stdout, options.tail_bytes, tee, |line| {
                if on_stdout(line) {
                    result_seen.store(true, Ordering::SeqCst);
                }
            })
        });
        let stderr_handle = scope.spawn(move || echo_stderr(stderr, options.tail_bytes));

        let foreground = if options.attach_terminal {
            ForegroundGuard::hand_to(pgid)
        } else {
            None
        };
        let waited = wait_for_exit(&mut child, pgid, options, result_seen);
        drop(foreground);

        // Leftover members of the group would keep the pipes open.
        signal_group(pgid, Signal::SIGKILL);
        if waited.is_err() {
            let _ = child.wait();
        }
        let exit = waited?;

        let stdout_tail = join_tail(stdout_handle).context("join stdout")?;
        let stderr_tail = join_tail(stderr_handle).context("join stderr")?;
        if stdout_tail.dropped() > 0 || stderr_tail.dropped() > 0 {
            debug!(
                stdout_dropped = stdout_tail.dropped(),
                stderr_dropped = stderr_tail.dropped(),
                "output tails truncated"
            );
        }

        let signal = exit.status.signal();
        let exit_code = if exit.timed_out {
            AGENT_TIMEOUT
        } else if exit.killed_after_result {
            0
        } else {
            exit_code_of(exit.status)
        };
        debug!(exit_code, ?signal, timed_out = exit.timed_out, "supervised child finished");
        Ok(SupervisedOutput {
            exit_code,
            signal,
            timed_out: exit.timed_out,
            killed_after_result: exit.killed_after_result,
            stdout_tail: stdout_tail.to_string_lossy(),
            stderr_tail: stderr_tail.to_string_lossy(),
        })
    })
}

struct Exit {
    status: ExitStatus,
    timed_out: bool,
    killed_after_result: bool,
}

fn wait_for_exit(
    child: &mut Child,
    pgid: Pid,
    options: &SuperviseOptions,
    result_seen: &AtomicBool,
) -> Result<Exit> {
    let deadline = options.timeout.map(|limit| Instant::now() + limit);
    let mut result_seen_at: Option<Instant> = None;
    loop {
        if let Some(status) = child.wait_timeout(WAIT_SLICE).context("wait for child")? {
            return Ok(Exit {
                status,
                timed_out: false,
                killed_after_result: false,
            });
        }
        let now = Instant::now();
        if result_seen_at.is_none() && result_seen.load(Ordering::SeqCst) {
            result_seen_at = Some(now);
        }
        if let (Some(seen), Some(grace)) = (result_seen_at, options.result_grace)
            && now.duration_since(seen) >= grace
        {
            warn!(
                grace_secs = grace.as_secs(),
                "child still running after reporting its result, killing process group"
            );
            signal_group(pgid, Signal::SIGKILL);
            let status = child.wait().context("wait for child after kill")?;
            return Ok(Exit {
                status,
                timed_out: false,
                killed_after_result: true,
            });
        }
        if let Some(deadline) = deadline
            && now >= deadline
        {
            warn!(
                timeout_secs = options.timeout.map(|t| t.as_secs()),
                "child timed out, terminating process group"
            );
            let status = terminate_group(child, pgid, options.kill_grace)?;
            return Ok(Exit {
                status,
                timed_out: true,
                killed_after_result: false,
            });
        }
    }
}

/// SIGTERM the group, then SIGKILL it if the leader is still alive after `grace`.
fn terminate_group(child: &mut Child, pgid: Pid, grace: Duration) -> Result<ExitStatus> {
    signal_group(pgid, Signal::SIGTERM);
    if let Some(status) = child
        .wait_timeout(grace)
        .context("wait for child after SIGTERM")?
    {
        return Ok(status);
    }
    warn!(grace_secs = grace.as_secs(), "child ignored SIGTERM, killing");
    signal_group(pgid, Signal::SIGKILL);
    child.wait().context("wait for child after SIGKILL")
}

fn signal_group(pgid: Pid, signal: Signal) {
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => warn!(errno = %errno, ?signal, "failed to signal process group"),
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => SIGNAL_BASE + signal,
        (None, None) => -1,
    }
}

fn open_tee(path: Option<&Path>) -> Result<Option<BufWriter<File>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))?;
    Ok(Some(BufWriter::new(file)))
}

fn read_stdout<R: Read>(
    reader: R,
    tail_bytes: usize,
    mut tee: Option<BufWriter<File>>,
    mut on_line: impl FnMut(&str),
) -> Result<TailBuffer> {
    let mut reader = BufReader::new(reader);
    let mut tail = TailBuffer::new(tail_bytes);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).context("read stdout")?;
        if n == 0 {
            break;
        }
        tail.push(&line);
        if let Some(writer) = tee.as_mut()
            && let Err(e) = writer.write_all(&line).and_then(|()| writer.flush())
        {
            warn!(err = %e, "failed to write agent log, disabling");
            tee = None;
        }
        let text = String::from_utf8_lossy(&line);
        on_line(text.trim_end_matches(['\n', '\r']));
    }
    Ok(tail)
}

fn echo_stderr<R: Read>(mut reader: R, tail_bytes: usize) -> Result<TailBuffer> {
    let mut tail = TailBuffer::new(tail_bytes);
    let mut chunk = [0u8; 8192];
    let mut sink = io::stderr();
    loop {
        let n = reader.read(&mut chunk).context("read stderr")?;
        if n == 0 {
            break;
        }
        tail.push(&chunk[..n]);
        let _ = sink.write_all(&chunk[..n]);
    }
    Ok(tail)
}

fn join_tail(handle: thread::ScopedJoinHandle<'_, Result<TailBuffer>>) -> Result<TailBuffer> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(timeout: Option<Duration>) -> SuperviseOptions {
        SuperviseOptions {
            timeout,
            kill_grace: Duration::from_secs(1),
            result_grace: None,
            tail_bytes: 64,
            tee_path: None,
            attach_terminal: false,
        }
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_exit_code_and_tails() {
        let mut lines = Vec::new();
        let out = run_supervised(
            sh("echo one; echo two; echo oops >&2; exit 3"),
            &options(None),
            &mut |line: &str| {
                lines.push(line.to_string());
                false
            },
        )
        .expect("run");
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(out.stdout_tail, "one\ntwo\n");
        assert_eq!(out.stderr_tail, "oops\n");
    }

    #[test]
    fn tails_keep_the_last_bytes() {
        let out = run_supervised(
            sh("i=0; while [ $i -lt 100 ]; do echo line-$i; i=$((i+1)); done"),
            &options(None),
            &mut |_: &str| false,
        )
        .expect("run");
        assert!(out.stdout_tail.ends_with("line-99\n"));
        assert!(!out.stdout_tail.contains("line-1\n"));
    }

    #[test]
    fn timeout_kills_the_whole_group() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("grandchild-survived");
        let script = format!(
            "(sleep 3; touch {}) & sleep 30",
            marker.display()
        );
        let started = Instant::now();
        let out = run_supervised(
            sh(&script),
            &options(Some(Duration::from_millis(500))),
            &mut |_: &str| false,
        )
        .expect("run");
        assert!(out.timed_out);
        assert_eq!(out.exit_code, AGENT_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(10));
        thread::sleep(Duration::from_secs(4));
        assert!(!marker.exists(), "background child outlived the timeout");
    }

    #[test]
    fn result_grace_kills_lingering_child_as_success() {
        let mut opts = options(Some(Duration::from_secs(30)));
        opts.result_grace = Some(Duration::from_millis(300));
        let out = run_supervised(
            sh("echo '{\"type\":\"result\"}'; sleep 30"),
            &opts,
            &mut |line: &str| line.contains("\"result\""),
        )
        .expect("run");
        assert!(out.killed_after_result);
        assert!(!out.timed_out);
        assert_eq!(out.exit_code, 0);
    }

    #[test]
    fn signal_exit_maps_above_signal_base() {
        let out = run_supervised(sh("kill -TERM $$"), &options(None), &mut |_: &str| false)
            .expect("run");
        assert_eq!(out.signal, Some(Signal::SIGTERM as i32));
        assert_eq!(out.exit_code, SIGNAL_BASE + Signal::SIGTERM as i32);
        assert!(!out.interrupted());
    }

    #[test]
    fn tee_receives_raw_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut opts = options(None);
        opts.tee_path = Some(temp.path().join("logs").join("s1.jsonl"));
        run_supervised(sh("echo '{\"a\":1}'"), &opts, &mut |_: &str| false).expect("run");
        let logged = fs::read_to_string(temp.path().join("logs").join("s1.jsonl")).expect("read");
        assert_eq!(logged, "{\"a\":1}\n");
    }
}
