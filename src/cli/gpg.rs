//! `gpg.program` wrapper exec'd by the `gpg-wrapper.sh` launcher.
//!
//! Runs the real gpg without a terminal first. If that fails for want of a
//! pinentry and a prompt server is reachable, the passphrase is asked for over
//! the socket and gpg runs again in loopback pinentry mode.

use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::LazyLock;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cli::helper::client_from_env;
use crate::error::{GitwardenError, Result};
use crate::exec::exit_code;
use crate::pipeline::env::GPG_PROGRAM_ENV;
use crate::prompt::PromptQuery;

pub const PASSPHRASE_PROMPT: &str = "Please enter the passphrase for your default GPG signing key.";

// Failures a second attempt would only repeat.
static FINAL_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Bad passphrase|Operation cancelled").expect("final failure pattern compiles")
});

/// Output of one gpg run, replayed to git as-is.
#[derive(Debug)]
pub struct GpgRun {
    pub exit_code: i32,
    pub signalled: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl GpgRun {
    /// Worth retrying with a passphrase from the prompt server.
    pub fn needs_prompt(&self) -> bool {
        self.exit_code != 0
            && !self.signalled
            && !FINAL_FAILURE.is_match(&String::from_utf8_lossy(&self.stderr))
    }

    fn forward(self) -> Result<i32> {
        let mut out = std::io::stdout().lock();
        out.write_all(&self.stdout)?;
        out.flush()?;
        let mut err = std::io::stderr().lock();
        err.write_all(&self.stderr)?;
        err.flush()?;
        Ok(self.exit_code)
    }
}

/// Sign or verify on git's behalf. Returns gpg's exit code.
pub async fn run_gpg(args: Vec<String>) -> Result<i32> {
    let mut input = Vec::new();
    tokio::io::stdin().read_to_end(&mut input).await?;
    let program = gpg_program().await;

    let native = run_once(&program, &args, &input, None).await?;
    if !native.needs_prompt() {
        return native.forward();
    }

    let client = match client_from_env() {
        Ok(client) => client,
        Err(e) => {
            debug!(error = %e, "no prompt server for the gpg passphrase");
            return native.forward();
        }
    };
    let query = PromptQuery {
        prompt: PASSPHRASE_PROMPT.into(),
        include_username: false,
        pid: Some(std::process::id()),
    };
    let answer = match client.request(&query).await {
        Ok(answer) => answer,
        Err(e) => {
            debug!(error = %e, "gpg passphrase prompt not answered");
            return native.forward();
        }
    };

    run_once(&program, &args, &input, Some(&answer.password))
        .await?
        .forward()
}

/// The user's `gpg.program`, ignoring the override that points at us.
async fn gpg_program() -> String {
    let configured = Command::new("git")
        .args(["config", "--get", "gpg.program"])
        .env_remove("GIT_CONFIG_PARAMETERS")
        .env_remove("GIT_CONFIG_COUNT")
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;
    if let Ok(output) = configured {
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() && !value.is_empty() {
            return value;
        }
    }
    std::env::var(GPG_PROGRAM_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "gpg".into())
}

async fn run_once(
    program: &str,
    args: &[String],
    input: &[u8],
    passphrase: Option<&str>,
) -> Result<GpgRun> {
    let mut cmd = Command::new(program);
    cmd.args(["--batch", "--no-tty", "--yes"]);

    // Inherited by the child; the parent's copy closes when this drops.
    let passphrase_fd = passphrase.map(passphrase_pipe).transpose()?;
    if let Some(fd) = &passphrase_fd {
        cmd.args(["--pinentry-mode", "loopback", "--passphrase-fd"])
            .arg(fd.as_raw_fd().to_string());
    }
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        warn!(program, error = %e, "failed to spawn gpg");
        GitwardenError::Io(e)
    })?;
    drop(passphrase_fd);

    if let Some(mut stdin) = child.stdin.take() {
        let input = input.to_vec();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&input).await {
                debug!(error = %e, "gpg closed its input early");
            }
        });
    }

    let output = child.wait_with_output().await?;
    Ok(GpgRun {
        exit_code: exit_code(&output.status),
        signalled: output.status.code().is_none(),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// A pipe already holding `passphrase`, returning the read end. The read end
/// is left inheritable so gpg can be handed its number.
fn passphrase_pipe(passphrase: &str) -> Result<OwnedFd> {
    let mut fds = [0; 2];
    // SAFETY: `fds` has room for the two descriptors pipe() writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: pipe() succeeded, so both descriptors are open and owned here.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    let mut writer = std::fs::File::from(write);
    writer.write_all(passphrase.as_bytes())?;
    writer.write_all(b"\n")?;
    Ok(read)
}
