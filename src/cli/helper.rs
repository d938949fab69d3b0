//! Entry points exec'd by the launcher scripts the prompt server writes.
//! Both talk to the server named by `GITWARDEN_SOCKET_PATH`.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::GitwardenConfig;
use crate::error::{GitwardenError, Result};
use crate::pipeline::env::{
    ASKPASS_LAUNCHER_ENV, ORIGINAL_GIT_ASKPASS_ENV, ORIGINAL_SSH_ASKPASS_ENV, SOCKET_PATH_ENV,
};
use crate::prompt::credential::CredentialRequest;
use crate::prompt::{PromptClient, PromptQuery};

/// `GIT_ASKPASS` / `SSH_ASKPASS`: print the answer to the prompt on stdout.
///
/// Askpass programs the caller had configured are tried first, in git's
/// order of preference; the prompt server is asked only when none answers.
pub async fn run_askpass(prompt: Option<String>) -> Result<()> {
    let prompt = prompt.unwrap_or_else(|| "Password:".into());
    let config = GitwardenConfig::load()?;
    let timeout = Duration::from_secs(config.prompt_timeout_secs);

    for program in user_askpass_programs(|key| std::env::var(key).ok()) {
        if let Some(answer) = try_user_askpass(&program, &prompt, timeout).await {
            return write_stdout(&format!("{answer}\n"));
        }
    }

    let client = client_from_env()?;
    let query = PromptQuery {
        prompt,
        include_username: false,
        pid: Some(std::process::id()),
    };
    let answer = client.request(&query).await?;
    write_stdout(&format!("{}\n", answer.password))
}

/// The caller's original askpass programs, skipping unset ones and our own
/// launcher.
pub fn user_askpass_programs<F>(lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    let ours = lookup(ASKPASS_LAUNCHER_ENV).unwrap_or_default();
    let mut programs: Vec<String> = Vec::new();
    for key in [ORIGINAL_GIT_ASKPASS_ENV, ORIGINAL_SSH_ASKPASS_ENV] {
        if let Some(program) = lookup(key) {
            if !program.is_empty() && program != ours && !programs.contains(&program) {
                programs.push(program);
            }
        }
    }
    programs
}

/// Run one user askpass program. `None` when it fails, crashes or hangs.
async fn try_user_askpass(program: &str, prompt: &str, timeout: Duration) -> Option<String> {
    let run = Command::new(program)
        .arg(prompt)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(timeout, run).await {
        Ok(Ok(output)) if output.status.success() => {
            let answer = String::from_utf8_lossy(&output.stdout);
            Some(answer.trim_end_matches(['\r', '\n']).to_string())
        }
        Ok(Ok(output)) => {
            debug!(program, status = %output.status, "user askpass failed; falling back");
            None
        }
        Ok(Err(e)) => {
            debug!(program, error = %e, "user askpass could not run; falling back");
            None
        }
        Err(_) => {
            debug!(program, "user askpass timed out; falling back");
            None
        }
    }
}

/// git credential helper, appended after any helpers the user configured.
/// git only reaches it for `get` when those helpers had no answer, and it
/// already hands `store` and `erase` to them, so those are ignored here.
pub async fn run_credential(operation: &str) -> Result<()> {
    if operation != "get" {
        debug!(operation, "ignoring credential helper action");
        return Ok(());
    }

    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    let request = CredentialRequest::parse(&input);

    let client = client_from_env()?;
    let answer = client.request(&request.to_query(std::process::id())).await?;
    write_stdout(&request.format_answer(&answer))
}

pub(crate) fn client_from_env() -> Result<PromptClient> {
    let socket = std::env::var_os(SOCKET_PATH_ENV)
        .map(PathBuf::from)
        .ok_or_else(|| GitwardenError::Ipc {
            reason: format!("{} is not set", SOCKET_PATH_ENV),
        })?;
    let timeout_secs = GitwardenConfig::load()?.prompt_timeout_secs;
    Ok(PromptClient::new(socket, timeout_secs))
}

fn write_stdout(text: &str) -> Result<()> {
    let mut out = std::io::stdout().lock();
    out.write_all(text.as_bytes())?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn user_askpass_prefers_git_then_ssh_and_skips_ours() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ORIGINAL_GIT_ASKPASS_ENV, "/usr/lib/git-core/git-gui--askpass"),
            (ORIGINAL_SSH_ASKPASS_ENV, "/usr/bin/ssh-askpass"),
        ]);
        let programs = user_askpass_programs(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(
            programs,
            vec!["/usr/lib/git-core/git-gui--askpass", "/usr/bin/ssh-askpass"]
        );

        let nested: HashMap<&str, &str> = HashMap::from([
            (ORIGINAL_GIT_ASKPASS_ENV, ""),
            (ORIGINAL_SSH_ASKPASS_ENV, "/tmp/gw/askpass.sh"),
            (ASKPASS_LAUNCHER_ENV, "/tmp/gw/askpass.sh"),
        ]);
        assert!(user_askpass_programs(|k| nested.get(k).map(|v| v.to_string())).is_empty());
    }
}
