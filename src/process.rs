//! Subprocess execution with strict resource discipline. Unix-only.
//!
//! Children run in their own process group so signals reach descendants.
//! Stdout and stderr are read concurrently with per-stream byte caps; the
//! shutdown cascade is SIGTERM to the group, a grace period, then SIGKILL.

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::ProcessError;

/// Default combined stdout+stderr cap: 1 MiB.
pub const DEFAULT_MAX_OUTPUT: usize = 1024 * 1024;
/// Default SIGTERM -> SIGKILL gap.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);
/// Default minimum runway required before starting.
pub const DEFAULT_MIN_TIME: Duration = Duration::from_secs(30);

const READ_CHUNK: usize = 8 * 1024;

/// Options for one subprocess run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Combined output cap; each stream gets half.
    pub max_output: usize,
    /// SIGTERM -> SIGKILL gap on cancellation or timeout.
    pub grace_period: Duration,
    /// Refuse to start when less than this remains before the deadline.
    pub min_time: Duration,
    /// Hard wall-clock limit for this invocation.
    pub timeout: Option<Duration>,
    /// Absolute deadline shared with the rest of the session.
    pub deadline: Option<Instant>,
    pub work_dir: Option<std::path::PathBuf>,
    pub env: Vec<(String, String)>,
    /// Text piped to the child's stdin, which is then closed.
    pub stdin: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_output: DEFAULT_MAX_OUTPUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            min_time: DEFAULT_MIN_TIME,
            timeout: None,
            deadline: None,
            work_dir: None,
            env: Vec::new(),
            stdin: None,
        }
    }
}

/// What came back from a finished subprocess.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub truncated: bool,
    pub duration: Duration,
}

/// Runs subprocesses under the session's cancellation token.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
        opts: RunOptions,
    ) -> Result<RunOutcome, ProcessError> {
        if let Some(deadline) = opts.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining < opts.min_time {
                return Err(ProcessError::InsufficientTime {
                    remaining: remaining.as_secs(),
                    required: opts.min_time.as_secs(),
                });
            }
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &opts.work_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }
        // Own process group, so the TERM/KILL cascade reaches descendants.
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
            program: program.to_string(),
            source,
        })?;
        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
        debug!(program, pid = ?child.id(), "spawned subprocess");

        if let (Some(text), Some(mut stdin)) = (opts.stdin.as_deref(), child.stdin.take()) {
            let bytes = text.as_bytes().to_vec();
            tokio::spawn(async move {
                let _ = stdin.write_all(&bytes).await;
                let _ = stdin.shutdown().await;
            });
        }

        let per_stream = opts.max_output / 2;
        let stdout_task = read_capped(child.stdout.take(), per_stream);
        let stderr_task = read_capped(child.stderr.take(), per_stream);

        // Effective wait budget: explicit timeout, bounded by the deadline.
        let budget = effective_budget(opts.timeout, opts.deadline);

        enum Waited {
            Exited(std::io::Result<std::process::ExitStatus>),
            Cancelled,
            TimedOut,
        }
        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = cancel.cancelled() => Waited::Cancelled,
            _ = sleep_opt(budget) => Waited::TimedOut,
        };

        let status = match waited {
            Waited::Exited(status) => status?,
            Waited::Cancelled => {
                // External cancellation: cascade and report.
                let graceful = self.terminate(child, pgid, opts.grace_period, start).await;
                return Err(ProcessError::Killed { graceful });
            }
            Waited::TimedOut => {
                warn!(program, "subprocess exceeded its time budget");
                let graceful = self.terminate(child, pgid, opts.grace_period, start).await;
                return Err(ProcessError::TimedOut {
                    elapsed: start.elapsed(),
                    graceful,
                });
            }
        };

        let (stdout, out_truncated) = stdout_task.await.unwrap_or_default();
        let (stderr, err_truncated) = stderr_task.await.unwrap_or_default();
        let exit_code = status.code().unwrap_or(-1);
        if exit_code == 124 || exit_code == 137 {
            warn!(program, exit_code, "subprocess reported a timeout-style exit code");
        }

        Ok(RunOutcome {
            stdout,
            stderr,
            exit_code,
            truncated: out_truncated || err_truncated,
            duration: start.elapsed(),
        })
    }

    /// SIGTERM the group, wait out the grace period, then SIGKILL.
    /// Returns whether the child exited from the TERM alone.
    async fn terminate(
        &self,
        mut child: Child,
        pgid: Option<Pid>,
        grace: Duration,
        start: Instant,
    ) -> bool {
        if let Some(pgid) = pgid {
            let _ = killpg(pgid, Signal::SIGTERM);
        }
        let graceful = tokio::time::timeout(grace, child.wait()).await.is_ok();
        if !graceful {
            if let Some(pgid) = pgid {
                let _ = killpg(pgid, Signal::SIGKILL);
            }
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        debug!(elapsed = ?start.elapsed(), graceful, "subprocess terminated");
        graceful
    }
}

fn effective_budget(timeout: Option<Duration>, deadline: Option<Instant>) -> Option<Duration> {
    let from_deadline = deadline.map(|d| d.saturating_duration_since(Instant::now()));
    match (timeout, from_deadline) {
        (Some(t), Some(d)) => Some(t.min(d)),
        (Some(t), None) => Some(t),
        (None, Some(d)) => Some(d),
        (None, None) => None,
    }
}

async fn sleep_opt(budget: Option<Duration>) {
    match budget {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Drain a stream into a capped buffer. Bytes past the cap are read and
/// discarded so the child never blocks on a full pipe; `truncated` reports
/// whether anything was dropped. At most one extra read chunk can land in
/// the buffer beyond the cap.
fn read_capped<R>(
    stream: Option<R>,
    cap: usize,
) -> tokio::task::JoinHandle<(String, bool)>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return (String::new(), false);
        };
        let mut buf = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        let mut truncated = false;
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    if buf.len() < cap {
                        buf.extend_from_slice(&chunk[..n]);
                    } else {
                        truncated = true;
                    }
                }
                Err(_) => break,
            }
        }
        (String::from_utf8_lossy(&buf).into_owned(), truncated)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> RunOptions {
        RunOptions {
            min_time: Duration::ZERO,
            ..RunOptions::default()
        }
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let runner = ProcessRunner;
        let outcome = runner
            .run(
                &CancellationToken::new(),
                "sh",
                &["-c".into(), "echo out; echo err >&2; exit 3".into()],
                opts(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.truncated);
    }

    #[tokio::test]
    async fn pipes_stdin_to_child() {
        let runner = ProcessRunner;
        let outcome = runner
            .run(
                &CancellationToken::new(),
                "cat",
                &[],
                RunOptions {
                    stdin: Some("hello from stdin".into()),
                    ..opts()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "hello from stdin");
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn output_beyond_cap_is_truncated_but_bounded() {
        let runner = ProcessRunner;
        let max_output = 16 * 1024;
        let outcome = runner
            .run(
                &CancellationToken::new(),
                "sh",
                &["-c".into(), "yes x | head -c 200000".into()],
                RunOptions {
                    max_output,
                    ..opts()
                },
            )
            .await
            .unwrap();
        assert!(outcome.truncated);
        // Per-stream cap plus at most one read chunk.
        assert!(outcome.stdout.len() <= max_output / 2 + READ_CHUNK);
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let runner = ProcessRunner;
        let start = Instant::now();
        let err = runner
            .run(
                &CancellationToken::new(),
                "sleep",
                &["30".into()],
                RunOptions {
                    timeout: Some(Duration::from_millis(200)),
                    grace_period: Duration::from_millis(200),
                    ..opts()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_reports_killed() {
        let runner = ProcessRunner;
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let err = runner
            .run(
                &cancel,
                "sleep",
                &["30".into()],
                RunOptions {
                    grace_period: Duration::from_millis(200),
                    ..opts()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Killed { .. }));
    }

    #[tokio::test]
    async fn insufficient_runway_refuses_to_start() {
        let runner = ProcessRunner;
        let err = runner
            .run(
                &CancellationToken::new(),
                "true",
                &[],
                RunOptions {
                    deadline: Some(Instant::now() + Duration::from_secs(5)),
                    min_time: Duration::from_secs(30),
                    ..RunOptions::default()
                },
            )
            .await
            .unwrap_err();
        match err {
            ProcessError::InsufficientTime { required, .. } => assert_eq!(required, 30),
            other => panic!("expected InsufficientTime, got {other}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failed() {
        let runner = ProcessRunner;
        let err = runner
            .run(
                &CancellationToken::new(),
                "definitely-not-a-real-binary",
                &[],
                opts(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed { .. }));
    }
}
