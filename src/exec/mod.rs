//! Running the external tool as a local subprocess.
//!
//! Shared by the in-process path of the pipeline and by the sandbox runtime,
//! so both report output, exit codes, and timings the same way.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;

/// Exit code reported when the tool could not be spawned at all, as a shell
/// does for a missing command.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// One invocation of the external tool, as shipped to a sandbox host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecPayload {
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Overrides layered on top of the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub stdin: Option<String>,
}

/// Raw result of one invocation. Never interpreted beyond the exit code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(default)]
    pub timing: Option<Timing>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timing {
    pub spawn_ms: u64,
    pub exec_ms: u64,
}

/// Outcome of [`run_local`].
#[derive(Debug, Clone)]
pub struct LocalRun {
    pub output: ExecOutput,
    /// The run was killed through the cancellation token.
    pub cancelled: bool,
}

/// Spawn `program` with the payload's args, env and stdin, and wait for it.
///
/// A program that cannot be spawned yields [`SPAWN_FAILURE_EXIT_CODE`] with
/// the reason on stderr rather than an error. `on_spawn` receives the child's pid as soon as it exists. When `cancel`
/// fires, the child's whole process group is terminated and the (non-zero)
/// result is still collected.
pub async fn run_local<F>(
    program: &str,
    payload: &ExecPayload,
    cancel: CancellationToken,
    on_spawn: F,
) -> Result<LocalRun>
where
    F: FnOnce(u32),
{
    let mut cmd = Command::new(program);
    cmd.args(&payload.args)
        .current_dir(&payload.working_dir)
        .envs(&payload.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.stdin(if payload.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    #[cfg(unix)]
    cmd.process_group(0);

    let spawn_start = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(program, error = %e, "failed to spawn external tool");
            return Ok(LocalRun {
                output: spawn_failure(program, &e),
                cancelled: false,
            });
        }
    };
    let spawn_ms = spawn_start.elapsed().as_millis() as u64;
    let exec_start = Instant::now();

    if let Some(pid) = child.id() {
        on_spawn(pid);
    }
    let pid = child.id();

    if let (Some(input), Some(mut stdin)) = (payload.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                warn!(error = %e, "error writing to process stdin");
            }
            // Dropping stdin closes the pipe.
        });
    }

    let wait = child.wait_with_output();
    tokio::pin!(wait);

    let mut cancelled = false;
    let output = tokio::select! {
        output = &mut wait => output?,
        _ = cancel.cancelled() => {
            cancelled = true;
            if let Some(pid) = pid {
                debug!(pid, "cancelling subprocess");
                kill_process_tree(pid);
            }
            (&mut wait).await?
        }
    };

    Ok(LocalRun {
        output: ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: exit_code(&output.status),
            timing: Some(Timing {
                spawn_ms,
                exec_ms: exec_start.elapsed().as_millis() as u64,
            }),
        },
        cancelled,
    })
}

pub fn spawn_failure(program: &str, error: &std::io::Error) -> ExecOutput {
    ExecOutput {
        stdout: String::new(),
        stderr: format!("failed to spawn {program}: {error}"),
        exit_code: SPAWN_FAILURE_EXIT_CODE,
        timing: None,
    }
}

/// Exit code, mapping death-by-signal `n` to `128 + n` like a shell does.
pub fn exit_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// SIGTERM the process group led by `pid`, falling back to the process alone.
#[cfg(unix)]
pub fn kill_process_tree(pid: u32) {
    let pid = pid as libc::pid_t;
    let ret = unsafe { libc::kill(-pid, libc::SIGTERM) };
    if ret != 0 {
        let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
        if ret != 0 {
            debug!(
                pid,
                error = %std::io::Error::last_os_error(),
                "process already gone"
            );
        }
    }
}

#[cfg(not(unix))]
pub fn kill_process_tree(_pid: u32) {
    // Unsupported outside Unix.
}
