use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{GitwardenError, Result};
use crate::prompt::launchers::{write_launchers, HelperPaths};
use crate::prompt::{PromptCancelled, PromptHandler, PromptQuery, MAX_MESSAGE_BYTES};

/// Single-use local socket that lets the external tool's helpers ask the
/// hosting application for credentials.
///
/// Serves exactly one query/answer exchange. A malformed query or a declined
/// prompt emits a [`PromptCancelled`] and trips [`cancel_token`].
///
/// [`cancel_token`]: CredentialPromptServer::cancel_token
pub struct CredentialPromptServer {
    // Removed (with the socket and launchers) on drop.
    _dir: TempDir,
    helpers: HelperPaths,
    cancel: CancellationToken,
    cancellations: Option<mpsc::UnboundedReceiver<PromptCancelled>>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl CredentialPromptServer {
    /// Bind a socket in a fresh temp dir, write the helper launchers, and
    /// start waiting for the helper to connect.
    pub async fn start(handler: PromptHandler, runtime: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("gitwarden-").tempdir()?;
        let socket_path = dir.path().join("prompt.sock");

        let listener = UnixListener::bind(&socket_path).map_err(|e| GitwardenError::Ipc {
            reason: format!(
                "failed to bind socket at {}: {}",
                socket_path.display(),
                e
            ),
        })?;
        let helpers = write_launchers(dir.path(), runtime, &socket_path)?;
        debug!(socket = %socket_path.display(), "prompt server listening");

        let cancel = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(serve_once(
            listener,
            handler,
            cancel.clone(),
            cancel_tx,
            shutdown.clone(),
        ));

        Ok(Self {
            _dir: dir,
            helpers,
            cancel,
            cancellations: Some(cancel_rx),
            shutdown,
            task,
        })
    }

    pub fn helpers(&self) -> &HelperPaths {
        &self.helpers
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.helpers.socket
    }

    /// Token tripped when the exchange ends in a cancellation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stream of cancellation events. Can be taken once.
    pub fn take_cancellations(&mut self) -> Option<mpsc::UnboundedReceiver<PromptCancelled>> {
        self.cancellations.take()
    }

    /// Stop listening, abandon any prompt still waiting on a human, and
    /// remove the socket directory.
    pub async fn terminate(self) {
        self.shutdown.cancel();
        self.task.abort();
        let _ = self.task.await;
        debug!(socket = %self.helpers.socket.display(), "prompt server terminated");
    }
}

async fn serve_once(
    listener: UnixListener,
    handler: PromptHandler,
    cancel: CancellationToken,
    cancellations: mpsc::UnboundedSender<PromptCancelled>,
    shutdown: CancellationToken,
) {
    let stream = tokio::select! {
        accepted = listener.accept() => match accepted {
            Ok((stream, _addr)) => stream,
            Err(e) => {
                warn!(error = %e, "prompt socket accept error");
                return;
            }
        },
        _ = shutdown.cancelled() => return,
    };
    // One exchange per server lifetime.
    drop(listener);

    match handle_connection(stream, &handler).await {
        Ok(()) => {}
        Err(Exchange::Cancelled(event)) => {
            debug!(handler_pid = ?event.handler_pid, "credential prompt cancelled");
            let _ = cancellations.send(event);
            cancel.cancel();
        }
        Err(Exchange::Io(e)) => warn!(error = %e, "prompt connection error"),
    }
}

enum Exchange {
    Cancelled(PromptCancelled),
    Io(GitwardenError),
}

async fn handle_connection(
    mut stream: UnixStream,
    handler: &PromptHandler,
) -> std::result::Result<(), Exchange> {
    // The query ends where the helper's input ends.
    let mut buf = Vec::new();
    (&mut stream)
        .take(MAX_MESSAGE_BYTES)
        .read_to_end(&mut buf)
        .await
        .map_err(|e| {
            Exchange::Io(GitwardenError::Ipc {
                reason: format!("read failed: {}", e),
            })
        })?;

    let query: PromptQuery = match serde_json::from_slice(&buf) {
        Ok(query) => query,
        Err(e) => {
            warn!(error = %e, "malformed prompt query");
            return Err(Exchange::Cancelled(PromptCancelled { handler_pid: None }));
        }
    };
    let handler_pid = query.pid;

    let answer = match handler(query).await {
        Ok(answer) => answer,
        Err(e) => {
            debug!(error = %e, "prompt handler declined");
            return Err(Exchange::Cancelled(PromptCancelled { handler_pid }));
        }
    };

    let answer_json = serde_json::to_vec(&answer).map_err(|e| Exchange::Io(e.into()))?;
    stream.write_all(&answer_json).await.map_err(|e| {
        Exchange::Io(GitwardenError::Ipc {
            reason: format!("write failed: {}", e),
        })
    })?;
    stream.shutdown().await.map_err(|e| {
        Exchange::Io(GitwardenError::Ipc {
            reason: format!("shutdown failed: {}", e),
        })
    })?;
    Ok(())
}
