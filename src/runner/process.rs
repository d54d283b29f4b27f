//! Direct process runner
//!
//! Spawns the command as the leader of a fresh process group with a cleared
//! environment, rlimits and (policy permitting) a private network namespace.
//! On deadline expiry the whole group is killed, so children forked by the
//! submission die with it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setpgid, Pid};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CommandSpec, RunLimits, RunOutcome, RunStatus, Runner};
use crate::config::{EngineConfig, NetworkPolicy};

const READ_CHUNK: usize = 8192;

/// Runner that executes a command directly on the host under rlimits
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    /// Per-stream capture cap in bytes
    max_output_bytes: usize,
    network: NetworkPolicy,
    /// How long to wait for pipes to drain once the group is dead
    kill_grace: Duration,
}

impl ProcessRunner {
    pub fn new(max_output_bytes: usize, network: NetworkPolicy, kill_grace: Duration) -> Self {
        Self {
            max_output_bytes,
            network,
            kill_grace,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_output_bytes, config.network, config.kill_grace)
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Limits applied in the child between fork and exec
#[derive(Debug, Clone, Copy)]
struct ChildLimits {
    cpu_secs: u64,
    address_space: Option<u64>,
    file_size: Option<u64>,
    network: NetworkPolicy,
}

impl ChildLimits {
    fn new(limits: &RunLimits, network: NetworkPolicy) -> Self {
        Self {
            // Wall clock is the primary deadline; the CPU limit only catches
            // a process that somehow outlives its supervisor.
            cpu_secs: limits.time.as_secs().saturating_add(1),
            address_space: limits.memory_mb.map(|mb| u64::from(mb) * 1024 * 1024),
            file_size: limits.file_size_bytes,
            network,
        }
    }

    /// Runs in the forked child: only async-signal-safe syscalls, no allocation
    fn apply(&self) -> io::Result<()> {
        setpgid(Pid::from_raw(0), Pid::from_raw(0))?;

        match self.network {
            NetworkPolicy::Inherit => {}
            policy => {
                let isolated = unshare(CloneFlags::CLONE_NEWNET)
                    .or_else(|_| unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET));
                if let Err(errno) = isolated {
                    if policy == NetworkPolicy::Deny {
                        return Err(io::Error::from(errno));
                    }
                }
            }
        }

        clamp_rlimit(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs.saturating_add(1))?;
        clamp_rlimit(Resource::RLIMIT_CORE, 0, 0)?;
        if let Some(bytes) = self.address_space {
            clamp_rlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(bytes) = self.file_size {
            clamp_rlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
        }
        Ok(())
    }
}

/// Lower a limit without ever trying to raise it above the inherited hard limit
fn clamp_rlimit(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let (_, current_hard) = getrlimit(resource)?;
    let hard = hard.min(current_hard);
    setrlimit(resource, soft.min(hard), hard)?;
    Ok(())
}

/// Kills the child's process group when dropped
struct ProcessGroup {
    pgid: Option<Pid>,
}

impl ProcessGroup {
    fn kill(&self) {
        if let Some(pgid) = self.pgid {
            // ESRCH just means everyone is already gone
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn push(&mut self, chunk: &[u8], cap: usize) {
        let room = cap.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

type Sink = Arc<Mutex<Captured>>;

/// Read a stream to EOF, keeping at most `cap` bytes and discarding the rest
fn spawn_capture<R>(reader: Option<R>, cap: usize) -> (Sink, Option<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let sink: Sink = Arc::default();
    let handle = reader.map(|mut reader| {
        let sink = sink.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(&buf[..n], cap),
                    Err(e) => {
                        debug!("Output stream closed with error: {}", e);
                        break;
                    }
                }
            }
        })
    });
    (sink, handle)
}

fn take_captured(sink: &Sink) -> (String, bool) {
    let mut captured = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let captured = std::mem::take(&mut *captured);
    (
        String::from_utf8_lossy(&captured.bytes).into_owned(),
        captured.truncated,
    )
}

fn classify(status: ExitStatus) -> RunStatus {
    match (status.code(), status.signal()) {
        (Some(code), _) => RunStatus::Exited(code),
        (None, Some(sig)) if sig == Signal::SIGXCPU as i32 => RunStatus::TimedOut,
        (None, Some(sig)) => RunStatus::Signaled(sig),
        (None, None) => RunStatus::Exited(-1),
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(
        &self,
        cmd: &CommandSpec,
        limits: &RunLimits,
        stdin: Option<&[u8]>,
    ) -> Result<RunOutcome> {
        debug!("Running {:?} with limits {:?}", cmd.to_vec(), limits);

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .env_clear()
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cmd.work_dir {
            command.current_dir(dir);
        }

        let child_limits = ChildLimits::new(limits, self.network);
        // SAFETY: the closure only issues raw syscalls through nix and does not
        // allocate, lock, or touch state shared with the parent.
        unsafe {
            command.pre_exec(move || child_limits.apply());
        }

        let start = Instant::now();
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", cmd.program))?;
        let group = ProcessGroup {
            pgid: child
                .id()
                .and_then(|id| i32::try_from(id).ok())
                .map(Pid::from_raw),
        };

        let writer = match (child.stdin.take(), stdin) {
            (Some(mut pipe), Some(input)) => {
                let input = input.to_vec();
                Some(tokio::spawn(async move {
                    if let Err(e) = pipe.write_all(&input).await {
                        // A program that never reads its input is not an error
                        if e.kind() != io::ErrorKind::BrokenPipe {
                            debug!("Failed to deliver stdin: {}", e);
                        }
                    }
                }))
            }
            _ => None,
        };

        let (stdout_sink, stdout_task) = spawn_capture(child.stdout.take(), self.max_output_bytes);
        let (stderr_sink, stderr_task) = spawn_capture(child.stderr.take(), self.max_output_bytes);

        let status = match tokio::time::timeout(limits.time, child.wait()).await {
            Ok(Ok(status)) => classify(status),
            Ok(Err(e)) => {
                group.kill();
                return Err(e).context("Failed to wait for process");
            }
            Err(_) => {
                debug!("Deadline of {:?} expired, killing process group", limits.time);
                group.kill();
                if let Err(e) = child.wait().await {
                    warn!("Failed to reap timed out process: {}", e);
                }
                RunStatus::TimedOut
            }
        };
        let elapsed = start.elapsed();

        // Background processes left behind by the submission go down with the group
        group.kill();

        for task in [writer, stdout_task, stderr_task].into_iter().flatten() {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.kill_grace, task).await.is_err() {
                // Some descendant escaped the group and still holds a pipe open
                warn!("Output pipe still open after {:?}, abandoning it", self.kill_grace);
                abort.abort();
            }
        }

        let (stdout, stdout_truncated) = take_captured(&stdout_sink);
        let (stderr, stderr_truncated) = take_captured(&stderr_sink);

        Ok(RunOutcome {
            status,
            stdout,
            stderr,
            elapsed,
            truncated: stdout_truncated || stderr_truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh")
            .with_args(["-c", script])
            .with_env([("PATH", "/usr/bin:/bin")])
    }

    fn runner() -> ProcessRunner {
        ProcessRunner::new(1024, NetworkPolicy::Inherit, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let outcome = runner()
            .run(&sh("echo out; echo err >&2; exit 3"), &RunLimits::default(), None)
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Exited(3));
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert!(!outcome.truncated);
    }

    #[tokio::test]
    async fn test_stdin_is_delivered() {
        let outcome = runner()
            .run(&sh("read line; echo got:$line"), &RunLimits::default(), Some(b"abc\n"))
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.stdout, "got:abc\n");
    }

    #[tokio::test]
    async fn test_unread_stdin_is_not_an_error() {
        let input = vec![b'x'; 1 << 20];
        let outcome = runner()
            .run(&sh("exit 0"), &RunLimits::default(), Some(&input))
            .await
            .unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_timeout_kills_group_and_keeps_partial_output() {
        let limits = RunLimits::new(Duration::from_millis(500), None);
        let start = Instant::now();
        let outcome = runner()
            .run(&sh("echo partial; sleep 30 & sleep 30"), &limits, None)
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::TimedOut);
        assert_eq!(outcome.stdout, "partial\n");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_cap() {
        let outcome = runner()
            .run(
                &sh("i=0; while [ $i -lt 500 ]; do echo 0123456789; i=$((i+1)); done"),
                &RunLimits::default(),
                None,
            )
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert!(outcome.truncated);
        assert_eq!(outcome.stdout.len(), 1024);
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        std::env::set_var("GRADER_TEST_SECRET", "leak");
        let outcome = runner()
            .run(&sh("echo [$GRADER_TEST_SECRET]"), &RunLimits::default(), None)
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "[]\n");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let cmd = CommandSpec::new("/nonexistent/interpreter");
        assert!(runner().run(&cmd, &RunLimits::default(), None).await.is_err());
    }

    #[test]
    fn test_capture_truncation() {
        let mut captured = Captured::default();
        captured.push(b"hello", 8);
        captured.push(b"world", 8);
        assert_eq!(captured.bytes, b"hellowor");
        assert!(captured.truncated);
    }
}
