//! Execution policy for single invocations of the external tool.
//!
//! Every invocation is queued on the sequencer of its working directory,
//! gets an environment that keeps the tool away from the terminal (plus the
//! credential-prompt wiring when asked for), runs either in-process or in the
//! worker pool, and settles into stdout or a [`CommandFailure`].

pub mod env;
pub mod signing;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GitwardenConfig;
use crate::error::{GitwardenError, Result};
use crate::exec::{kill_process_tree, run_local, ExecOutput, ExecPayload};
use crate::pool::WorkerPool;
use crate::prompt::launchers::write_gpg_wrapper;
use crate::prompt::{CredentialPromptServer, PromptHandler};
use crate::sequencer::SequencerMap;

/// Caller-facing description of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub stdin: Option<String>,
    /// Serve interactive credential prompts for this invocation.
    pub use_credential_prompt: bool,
    /// Informational. Reads and writes are serialized alike.
    pub is_write_operation: bool,
    /// Route `gpg.program` through the signing wrapper.
    pub sign: bool,
}

impl CommandRequest {
    pub fn new<I, S>(args: I, working_dir: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            working_dir: working_dir.into(),
            stdin: None,
            use_credential_prompt: false,
            is_write_operation: false,
            sign: false,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_credential_prompt(mut self) -> Self {
        self.use_credential_prompt = true;
        self
    }

    pub fn write_operation(mut self) -> Self {
        self.is_write_operation = true;
        self
    }

    pub fn signed(mut self) -> Self {
        self.sign = true;
        self
    }

    /// `git <args> in <dir>`, as shown to users.
    pub fn formatted_command(&self) -> String {
        format_command(&self.args, &self.working_dir)
    }
}

pub fn format_command(args: &[String], working_dir: &Path) -> String {
    format!("git {} in {}", args.join(" "), working_dir.display())
}

/// The external tool exited non-zero without being cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub formatted_command: String,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} exited with code {}\nstdout: {}\nstderr: {}",
            self.formatted_command, self.exit_code, self.stdout, self.stderr
        )
    }
}

impl std::error::Error for CommandFailure {}

/// Where an invocation is in its life cycle. Reported in debug logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Queued,
    Preparing,
    Dispatched,
    Cancelling,
    Settling,
    Resolved,
    Failed,
}

/// Turn raw output into stdout or a [`CommandFailure`]. A cancelled run is
/// never a failure, whatever its exit code.
pub fn classify(output: ExecOutput, cancelled: bool, formatted_command: String) -> Result<String> {
    if output.exit_code != 0 && !cancelled {
        return Err(CommandFailure {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            formatted_command,
        }
        .into());
    }
    Ok(output.stdout)
}

/// Runs the external tool on behalf of callers. Cheap to clone.
#[derive(Clone)]
pub struct CommandPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    config: GitwardenConfig,
    runtime: PathBuf,
    sequencers: SequencerMap,
    pool: Option<WorkerPool>,
    prompt: PromptHandler,
}

impl CommandPipeline {
    /// `pool` is optional; without one every command runs in-process.
    pub fn new(
        config: GitwardenConfig,
        prompt: PromptHandler,
        pool: Option<WorkerPool>,
    ) -> Result<Self> {
        let runtime = config.resolve_host_program()?;
        Ok(Self {
            inner: Arc::new(PipelineInner {
                config,
                runtime,
                sequencers: SequencerMap::new(),
                pool,
                prompt,
            }),
        })
    }

    pub fn config(&self) -> &GitwardenConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> Option<&WorkerPool> {
        self.inner.pool.as_ref()
    }

    /// Run one command after everything already queued for its working
    /// directory. Resolves with stdout.
    pub async fn run(&self, request: CommandRequest) -> Result<String> {
        debug!(
            command = %request.formatted_command(),
            write = request.is_write_operation,
            state = ?InvocationState::Queued,
            "queued"
        );
        let sequencer = self.inner.sequencers.for_dir(&request.working_dir);
        let inner = self.inner.clone();
        let settled = sequencer.push(async move { inner.execute(request).await });
        drop(sequencer);
        let result = settled.await;
        self.inner.sequencers.remove_idle();
        result
    }

    /// Run a command that may sign (commit, tag, merge). If the signing agent
    /// fails without a way to ask for a passphrase, retry once with the
    /// credential prompt enabled so the wrapper can ask through it.
    pub async fn run_with_signing(&self, mut request: CommandRequest) -> Result<String> {
        request.sign = true;
        match self.run(request.clone()).await {
            Err(GitwardenError::Command(failure))
                if !request.use_credential_prompt && signing::is_signing_failure(&failure) =>
            {
                info!(
                    command = %failure.formatted_command,
                    "signing failed; retrying with credential prompt"
                );
                request.use_credential_prompt = true;
                self.run(request).await
            }
            other => other,
        }
    }
}

impl PipelineInner {
    async fn execute(&self, request: CommandRequest) -> Result<String> {
        let formatted = request.formatted_command();
        let started = Instant::now();
        debug!(command = %formatted, state = ?InvocationState::Preparing, "preparing");

        let mut env = env::base_environment();
        let mut args = Vec::with_capacity(request.args.len() + 4);
        let mut server = None;
        let mut signing_dir = None;
        if request.use_credential_prompt {
            let prompt_server =
                CredentialPromptServer::start(self.prompt.clone(), &self.runtime).await?;
            env::apply_credential_environment(
                &mut env,
                prompt_server.helpers(),
                &request.working_dir,
                &self.config.display_placeholder,
                |key| std::env::var(key).ok(),
            );
            args.extend(env::credential_helper_args(prompt_server.helpers()));
            server = Some(prompt_server);
        }
        if request.sign {
            let wrapper = match &server {
                Some(prompt_server) => prompt_server.helpers().gpg_wrapper.clone(),
                None => {
                    let dir = tempfile::Builder::new()
                        .prefix("gitwarden-gpg-")
                        .tempdir()?;
                    let wrapper = write_gpg_wrapper(dir.path(), &self.runtime)?;
                    signing_dir = Some(dir);
                    wrapper
                }
            };
            args.extend(signing::signing_program_args(&wrapper));
            env.insert(
                env::GPG_PROGRAM_ENV.into(),
                self.config.signing_program.clone(),
            );
        }
        args.extend(request.args.iter().cloned());

        let payload = ExecPayload {
            args,
            working_dir: request.working_dir.clone(),
            env,
            stdin: request.stdin.clone(),
        };
        let cancel = server
            .as_ref()
            .map(CredentialPromptServer::cancel_token)
            .unwrap_or_default();

        let dispatched = self.dispatch(payload, cancel).await;

        if let Some(mut prompt_server) = server {
            if let Some(mut cancellations) = prompt_server.take_cancellations() {
                while let Ok(event) = cancellations.try_recv() {
                    debug!(
                        handler_pid = ?event.handler_pid,
                        command = %formatted,
                        "credential prompt cancelled"
                    );
                }
            }
            prompt_server.terminate().await;
        }
        drop(signing_dir);

        let (output, cancelled) = dispatched?;
        debug!(
            command = %formatted,
            exit_code = output.exit_code,
            cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            state = ?InvocationState::Settling,
            "settling"
        );

        let settled = classify(output, cancelled, formatted);
        let state = if settled.is_ok() {
            InvocationState::Resolved
        } else {
            InvocationState::Failed
        };
        debug!(state = ?state, "settled");
        settled
    }

    /// Run in the pool when it can take work, otherwise in-process.
    async fn dispatch(
        &self,
        payload: ExecPayload,
        cancel: CancellationToken,
    ) -> Result<(ExecOutput, bool)> {
        let pool = self
            .pool
            .as_ref()
            .filter(|pool| !self.config.in_process && pool.is_ready());

        if let Some(pool) = pool {
            match run_delegated(pool, payload.clone(), cancel.clone()).await {
                Err(GitwardenError::HostUnavailable { reason }) => {
                    warn!(%reason, "worker pool unavailable; running in-process");
                    if cancel.is_cancelled() {
                        return Ok((
                            ExecOutput {
                                exit_code: -1,
                                ..Default::default()
                            },
                            true,
                        ));
                    }
                }
                other => return other,
            }
        }

        debug!(state = ?InvocationState::Dispatched, "running in-process");
        let run = run_local(&self.config.git_path, &payload, cancel, |_| {}).await?;
        Ok((run.output, run.cancelled))
    }
}

async fn run_delegated(
    pool: &WorkerPool,
    payload: ExecPayload,
    cancel: CancellationToken,
) -> Result<(ExecOutput, bool)> {
    let pending = pool.request(payload);
    debug!(op = %pending.id(), state = ?InvocationState::Dispatched, "delegated to pool");
    let mut started = pending.started();
    let wait = pending.wait();
    tokio::pin!(wait);

    tokio::select! {
        output = &mut wait => Ok((output?, false)),
        _ = cancel.cancelled() => {
            debug!(state = ?InvocationState::Cancelling, "cancelling delegated run");
            // The host may not have reported the pid yet.
            let killer = tokio::spawn(async move {
                let pid = match started.wait_for(Option::is_some).await {
                    Ok(pid) => *pid,
                    Err(_) => None,
                };
                if let Some(pid) = pid {
                    kill_process_tree(pid);
                }
            });
            let output = (&mut wait).await;
            killer.abort();
            Ok((output?, true))
        }
    }
}
