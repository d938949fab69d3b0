//! [`ExecutionHost`] backed by a child process running `gitwarden host`.
//!
//! Requests go out as JSON lines on the child's stdin; [`HostMessage`]s come
//! back as JSON lines on its stdout. The child's stderr is inherited so its
//! logs land next to ours.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::GitwardenConfig;
use crate::error::{GitwardenError, Result};
use crate::pool::host::{
    ExecutionHost, HostEvent, HostEventKind, HostEventSender, HostLauncher, HostMessage,
    HostRequest, WorkerId,
};

/// Launches sandbox hosts as `<program> host --capacity N ...`.
#[derive(Debug, Clone)]
pub struct ProcessHostLauncher {
    program: PathBuf,
    git_path: String,
    slow_spawn_threshold_ms: u64,
}

impl ProcessHostLauncher {
    pub fn new(program: impl Into<PathBuf>, git_path: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            git_path: git_path.into(),
            slow_spawn_threshold_ms: 20,
        }
    }

    pub fn from_config(config: &GitwardenConfig) -> Result<Self> {
        Ok(Self::new(config.resolve_host_program()?, config.git_path.clone())
            .with_slow_spawn_threshold(config.slow_spawn_threshold_ms))
    }

    pub fn with_slow_spawn_threshold(mut self, threshold_ms: u64) -> Self {
        self.slow_spawn_threshold_ms = threshold_ms;
        self
    }
}

#[async_trait]
impl HostLauncher for ProcessHostLauncher {
    async fn launch(
        &self,
        worker: WorkerId,
        capacity: usize,
        events: HostEventSender,
    ) -> Result<Box<dyn ExecutionHost>> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("host")
            .arg("--capacity")
            .arg(capacity.to_string())
            .arg("--git-path")
            .arg(&self.git_path)
            .arg("--slow-spawn-threshold-ms")
            .arg(self.slow_spawn_threshold_ms.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| GitwardenError::HostUnavailable {
            reason: format!("failed to spawn {}: {}", self.program.display(), e),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| GitwardenError::HostProtocol {
            reason: "host stdin unavailable".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| GitwardenError::HostProtocol {
            reason: "host stdout unavailable".into(),
        })?;
        let pid = child.id();
        debug!(%worker, ?pid, capacity, "spawned execution host");

        Ok(Box::new(ProcessHost::spawn(worker, child, stdin, stdout, events)))
    }
}

pub struct ProcessHost {
    pid: Option<u32>,
    requests: Mutex<Option<mpsc::UnboundedSender<HostRequest>>>,
    ready: Arc<AtomicBool>,
    destroying: Arc<AtomicBool>,
    kill: CancellationToken,
}

impl ProcessHost {
    fn spawn(
        worker: WorkerId,
        child: Child,
        stdin: ChildStdin,
        stdout: ChildStdout,
        events: HostEventSender,
    ) -> Self {
        let pid = child.id();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        let ready = Arc::new(AtomicBool::new(false));
        let destroying = Arc::new(AtomicBool::new(false));
        let kill = CancellationToken::new();

        tokio::spawn(write_requests(worker, stdin, requests_rx, ready_rx));
        tokio::spawn(read_messages(
            worker,
            child,
            stdout,
            events,
            ReaderFlags {
                ready: ready.clone(),
                ready_tx,
                destroying: destroying.clone(),
                kill: kill.clone(),
            },
        ));

        Self {
            pid,
            requests: Mutex::new(Some(requests_tx)),
            ready,
            destroying,
            kill,
        }
    }
}

#[async_trait]
impl ExecutionHost for ProcessHost {
    fn send(&self, request: HostRequest) -> Result<()> {
        let guard = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        let Some(requests) = guard.as_ref() else {
            return Err(GitwardenError::HostUnavailable {
                reason: "execution host is being destroyed".into(),
            });
        };
        requests
            .send(request)
            .map_err(|_| GitwardenError::HostUnavailable {
                reason: "execution host writer has stopped".into(),
            })
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn destroy(&self, force: bool) {
        self.destroying.store(true, Ordering::Release);
        // Closing the request channel closes the host's stdin; it exits once
        // its in-flight work is done.
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if force {
            self.kill.cancel();
        }
    }
}

async fn write_requests(
    worker: WorkerId,
    mut stdin: ChildStdin,
    mut requests: mpsc::UnboundedReceiver<HostRequest>,
    mut ready: watch::Receiver<bool>,
) {
    // Hold work back until the host has announced itself.
    if ready.wait_for(|r| *r).await.is_err() {
        return;
    }
    while let Some(request) = requests.recv().await {
        let mut line = match serde_json::to_vec(&request) {
            Ok(line) => line,
            Err(e) => {
                warn!(%worker, error = %e, "failed to encode host request");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = stdin.write_all(&line).await {
            warn!(%worker, error = %e, "failed to write to execution host");
            return;
        }
    }
    let _ = stdin.shutdown().await;
}

struct ReaderFlags {
    ready: Arc<AtomicBool>,
    ready_tx: watch::Sender<bool>,
    destroying: Arc<AtomicBool>,
    kill: CancellationToken,
}

async fn read_messages(
    worker: WorkerId,
    mut child: Child,
    stdout: ChildStdout,
    events: HostEventSender,
    flags: ReaderFlags,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut killed = false;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<HostMessage>(trimmed) {
                        Ok(message) => {
                            if matches!(message, HostMessage::Ready { .. }) {
                                flags.ready.store(true, Ordering::Release);
                                flags.ready_tx.send_replace(true);
                            }
                            let _ = events.send(HostEvent {
                                worker,
                                kind: HostEventKind::Message(message),
                            });
                        }
                        Err(e) => {
                            let preview: String = trimmed.chars().take(200).collect();
                            warn!(%worker, error = %e, %preview, "unparseable host message");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(%worker, error = %e, "error reading execution host stdout");
                    break;
                }
            },
            _ = flags.kill.cancelled(), if !killed => {
                killed = true;
                if let Err(e) = child.start_kill() {
                    debug!(%worker, error = %e, "execution host already exited");
                }
            }
        }
    }

    flags.ready.store(false, Ordering::Release);
    let code = match child.wait().await {
        Ok(status) => Some(crate::exec::exit_code(&status)),
        Err(e) => {
            warn!(%worker, error = %e, "failed to reap execution host");
            None
        }
    };
    let intentional = flags.destroying.load(Ordering::Acquire);
    debug!(%worker, ?code, intentional, "execution host exited");
    let _ = events.send(HostEvent {
        worker,
        kind: HostEventKind::Exited { intentional, code },
    });
}
