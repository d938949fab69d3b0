use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::config::GitwardenConfig;
use crate::error::{GitwardenError, Result};
use crate::pipeline::{CommandPipeline, CommandRequest};
use crate::pool::{PoolSettings, ProcessHostLauncher, WorkerPool};
use crate::prompt::{PromptAnswer, PromptFuture, PromptHandler, PromptQuery};

/// How long `run` waits for the first sandbox host before going in-process.
const HOST_READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub prompt: bool,
    pub write: bool,
    pub sign: bool,
    pub in_process: bool,
    pub git_path: Option<String>,
    pub args: Vec<String>,
}

/// Run one command and mirror its outcome: stdout on success, stderr and the
/// tool's exit code on failure. Returns the process exit code.
pub async fn run_command(opts: RunOptions) -> Result<i32> {
    let mut config = GitwardenConfig::load()?;
    if let Some(git_path) = opts.git_path {
        config.git_path = git_path;
    }
    if opts.in_process {
        config.in_process = true;
    }
    let cwd = match opts.cwd {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    let pool = if config.in_process {
        None
    } else {
        let launcher = ProcessHostLauncher::from_config(&config)?;
        let pool = WorkerPool::start(Arc::new(launcher), PoolSettings::from(&config)).await;
        if !pool.wait_ready(HOST_READY_TIMEOUT).await {
            warn!("sandbox host not ready; command will run in-process");
        }
        Some(pool)
    };

    let pipeline = CommandPipeline::new(config, terminal_prompt(), pool.clone())?;

    let mut request = CommandRequest::new(opts.args, cwd);
    if opts.prompt {
        request = request.with_credential_prompt();
    }
    if opts.write {
        request = request.write_operation();
    }

    let result = if opts.sign {
        pipeline.run_with_signing(request).await
    } else {
        pipeline.run(request).await
    };

    if let Some(pool) = &pool {
        pool.shutdown().await;
    }

    match result {
        Ok(stdout) => {
            let mut out = std::io::stdout().lock();
            out.write_all(stdout.as_bytes())?;
            out.flush()?;
            Ok(0)
        }
        Err(GitwardenError::Command(failure)) => {
            debug!(
                command = %failure.formatted_command,
                exit_code = failure.exit_code,
                "command failed"
            );
            let mut err = std::io::stderr().lock();
            err.write_all(failure.stderr.as_bytes())?;
            err.flush()?;
            Ok(failure.exit_code)
        }
        Err(e) => Err(e),
    }
}

/// Prompt handler that asks on this process's terminal.
pub fn terminal_prompt() -> PromptHandler {
    Arc::new(|query: PromptQuery| -> PromptFuture { Box::pin(ask_on_terminal(query)) })
}

async fn ask_on_terminal(query: PromptQuery) -> Result<PromptAnswer> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let username = if query.include_username {
        Some(read_answer(&mut stdin, "Username:").await?)
    } else {
        None
    };
    let password = read_answer(&mut stdin, &query.prompt).await?;
    if password.is_empty() {
        return Err(GitwardenError::PromptRejected {
            reason: "empty answer".into(),
        });
    }
    Ok(PromptAnswer { username, password })
}

async fn read_answer<R>(input: &mut R, label: &str) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    eprint!("{} ", label.trim_end());
    let mut line = String::new();
    if input.read_line(&mut line).await? == 0 {
        return Err(GitwardenError::PromptRejected {
            reason: "no input".into(),
        });
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
