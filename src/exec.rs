use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ErrorKind, ToolError};

/// What happened to one external program run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The program ran to completion. A nonzero exit code is still a completion.
    Completed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// The deadline passed and the process was killed.
    TimedOut { after: Duration },
    /// The program could not be started at all.
    LaunchFailed { reason: String },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed { exit_code: 0, .. })
    }

    /// Completed runs pass through; the other two become tool errors.
    pub fn completed(self, program: &str) -> Result<Completed, ToolError> {
        match self {
            ExecutionOutcome::Completed {
                exit_code,
                stdout,
                stderr,
            } => Ok(Completed {
                exit_code,
                stdout,
                stderr,
            }),
            ExecutionOutcome::TimedOut { after } => Err(ToolError::new(
                ErrorKind::TimedOut,
                format!("{program} timed out after {} seconds", after.as_secs()),
            )),
            ExecutionOutcome::LaunchFailed { reason } => Err(ToolError::new(
                ErrorKind::LaunchFailed,
                format!("failed to launch {program}: {reason}"),
            )),
        }
    }
}

/// Output of a run that reached exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs an argument vector under a wall-clock deadline.
/// Never interprets a shell string and never retries.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String], timeout: Duration) -> ExecutionOutcome;
}

/// Spawns real OS processes via `tokio::process`.
pub struct ProcessRunner {
    max_output_bytes: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            max_output_bytes: 1024 * 1024,
        }
    }

    /// Cap on captured bytes per stream. Anything beyond is dropped with a marker.
    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    fn decode(&self, captured: Captured) -> String {
        let mut text = String::from_utf8_lossy(&captured.kept).into_owned();
        if captured.total > self.max_output_bytes || text.len() > self.max_output_bytes {
            let mut cut = self.max_output_bytes.min(text.len());
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str(&format!("\n[truncated, {} bytes total]", captured.total));
        }
        text
    }
}

/// Bytes kept from one pipe, and how many the child wrote in all.
struct Captured {
    kept: Vec<u8>,
    total: usize,
}

/// Read `pipe` to EOF, keeping at most `cap` bytes and discarding the rest.
async fn drain<R: AsyncRead + Unpin>(pipe: Option<&mut R>, cap: usize) -> Captured {
    let mut kept = Vec::new();
    let mut discarded = 0u64;
    if let Some(pipe) = pipe {
        let read = async {
            (&mut *pipe).take(cap as u64).read_to_end(&mut kept).await?;
            // Keep reading so the child never blocks on a full pipe.
            tokio::io::copy(pipe, &mut tokio::io::sink()).await
        };
        match read.await {
            Ok(rest) => discarded = rest,
            Err(e) => warn!(error = %e, "failed to read child output"),
        }
    }
    Captured {
        total: kept.len() + discarded as usize,
        kept,
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, error = %e, "process group already gone");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String], timeout: Duration) -> ExecutionOutcome {
        let Some((program, args)) = argv.split_first() else {
            return ExecutionOutcome::LaunchFailed {
                reason: "empty argument vector".into(),
            };
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout takes grandchildren down too.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                debug!(%program, error = %e, "spawn failed");
                return ExecutionOutcome::LaunchFailed {
                    reason: e.to_string(),
                };
            }
        };

        let pid = child.id();
        let started = Instant::now();
        debug!(%program, ?pid, timeout_ms = timeout.as_millis() as u64, "process started");

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let collected = tokio::time::timeout(timeout, async {
            tokio::join!(
                child.wait(),
                drain(stdout.as_mut(), self.max_output_bytes),
                drain(stderr.as_mut(), self.max_output_bytes)
            )
        })
        .await;

        match collected {
            Ok((Ok(status), out, err)) => {
                let exit_code = exit_code(&status);
                debug!(
                    %program,
                    exit_code,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "process exited"
                );
                ExecutionOutcome::Completed {
                    exit_code,
                    stdout: self.decode(out),
                    stderr: self.decode(err),
                }
            }
            Ok((Err(e), _, _)) => {
                kill_group(pid);
                ExecutionOutcome::LaunchFailed {
                    reason: format!("failed waiting for process: {e}"),
                }
            }
            Err(_) => {
                warn!(%program, ?pid, "process timed out, killing");
                kill_group(pid);
                if let Err(e) = child.kill().await {
                    debug!(%program, error = %e, "kill after timeout failed");
                }
                ExecutionOutcome::TimedOut { after: timeout }
            }
        }
    }
}

/// External programs the tools shell out to, with a cheap probe for each.
pub const DEPENDENCIES: [(&str, &[&str]); 3] = [
    ("nmap", &["nmap", "--version"]),
    ("ssh", &["ssh", "-V"]),
    ("ping", &["ping", "-c", "1", "-W", "1", "127.0.0.1"]),
];

/// Result of probing one external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCheck {
    pub name: &'static str,
    pub available: bool,
    pub detail: String,
}

/// Probe every entry in [`DEPENDENCIES`] through `runner`.
pub async fn check_dependencies(
    runner: &dyn CommandRunner,
    timeout: Duration,
) -> Vec<DependencyCheck> {
    let mut checks = Vec::with_capacity(DEPENDENCIES.len());
    for (name, probe) in DEPENDENCIES {
        let argv: Vec<String> = probe.iter().map(|s| s.to_string()).collect();
        let (available, detail) = match runner.run(&argv, timeout).await {
            ExecutionOutcome::Completed {
                exit_code: 0,
                stdout,
                stderr,
            } => {
                // `ssh -V` reports on stderr.
                let text = if stdout.trim().is_empty() { stderr } else { stdout };
                (true, text.lines().next().unwrap_or("").trim().to_string())
            }
            ExecutionOutcome::Completed { exit_code, .. } => {
                (false, format!("exited with {exit_code}"))
            }
            ExecutionOutcome::TimedOut { after } => {
                (false, format!("timed out after {}s", after.as_secs()))
            }
            ExecutionOutcome::LaunchFailed { reason } => (false, reason),
        };
        debug!(dependency = name, available, "dependency probed");
        checks.push(DependencyCheck {
            name,
            available,
            detail,
        });
    }
    checks
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn echo_completes_with_output() {
        let outcome = ProcessRunner::new()
            .run(&argv(&["echo", "hi"]), Duration::from_secs(5))
            .await;
        assert_eq!(
            outcome,
            ExecutionOutcome::Completed {
                exit_code: 0,
                stdout: "hi\n".into(),
                stderr: String::new(),
            }
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_data() {
        let outcome = ProcessRunner::new()
            .run(&argv(&["sh", "-c", "echo oops >&2; exit 3"]), Duration::from_secs(5))
            .await;
        match outcome {
            ExecutionOutcome::Completed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "oops\n");
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_fails_to_launch() {
        let outcome = ProcessRunner::new()
            .run(
                &argv(&["definitely-not-a-real-binary-4821"]),
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(outcome, ExecutionOutcome::LaunchFailed { .. }));
    }

    #[tokio::test]
    async fn empty_argv_fails_to_launch() {
        let outcome = ProcessRunner::new().run(&[], Duration::from_secs(1)).await;
        assert!(matches!(outcome, ExecutionOutcome::LaunchFailed { .. }));
    }

    #[tokio::test]
    async fn slow_process_times_out_and_dies() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let script = format!("echo $$ > {}; exec sleep 10", pidfile.display());

        let started = Instant::now();
        let outcome = ProcessRunner::new()
            .run(&argv(&["sh", "-c", &script]), Duration::from_secs(1))
            .await;

        assert!(matches!(outcome, ExecutionOutcome::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));

        let pid: i32 = std::fs::read_to_string(&pidfile)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        // Signal 0 only probes for existence.
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
        assert!(!alive, "child {pid} still running after timeout");
    }

    #[tokio::test]
    async fn output_is_truncated_past_the_cap() {
        let outcome = ProcessRunner::new()
            .with_max_output(4)
            .run(&argv(&["echo", "abcdefgh"]), Duration::from_secs(5))
            .await;
        let done = outcome.completed("echo").unwrap();
        assert!(done.stdout.starts_with("abcd\n[truncated"));
    }

    #[tokio::test]
    async fn large_output_is_capped_while_reading() {
        let outcome = ProcessRunner::new()
            .with_max_output(100)
            .run(
                &argv(&["sh", "-c", "head -c 5000000 /dev/zero | tr '\\0' x"]),
                Duration::from_secs(20),
            )
            .await;
        let done = outcome.completed("sh").unwrap();
        assert_eq!(done.exit_code, 0);
        assert_eq!(
            done.stdout,
            format!("{}\n[truncated, 5000000 bytes total]", "x".repeat(100))
        );
    }

    #[tokio::test]
    async fn dependency_check_reports_each_program() {
        use crate::tools::builtin::testing::MockRunner;

        let runner = MockRunner::completing(0, "", "OpenSSH_9.6p1, OpenSSL 3.0.13\n");
        let checks = check_dependencies(runner.as_ref(), Duration::from_secs(5)).await;
        assert_eq!(checks.len(), 3);
        assert!(checks.iter().all(|c| c.available));
        assert_eq!(checks[1].detail, "OpenSSH_9.6p1, OpenSSL 3.0.13");
        assert_eq!(runner.call_count(), 3);
        assert_eq!(runner.last_timeout(), Some(Duration::from_secs(5)));

        let missing = MockRunner::answering(ExecutionOutcome::LaunchFailed {
            reason: "No such file or directory".into(),
        });
        let checks = check_dependencies(missing.as_ref(), Duration::from_secs(5)).await;
        assert!(checks.iter().all(|c| !c.available));
        assert_eq!(checks[0].name, "nmap");
    }

    #[test]
    fn timed_out_maps_to_tool_error() {
        let err = ExecutionOutcome::TimedOut {
            after: Duration::from_secs(1),
        }
        .completed("sleep")
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TimedOut);
    }
}
