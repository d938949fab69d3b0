use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};

use crate::error::{GitwardenError, Result};
use crate::exec::{ExecOutput, ExecPayload};
use crate::pool::host::HostRequest;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(0);

/// Process-wide operation identity. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl OperationId {
    fn next() -> Self {
        Self(NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Created or handed to a host, not yet started there.
    Pending,
    /// The host reported that the subprocess was spawned.
    InProgress,
    Complete,
}

/// One unit of delegated work, owned by exactly one worker until it completes.
#[derive(Debug)]
pub struct Operation {
    id: OperationId,
    payload: ExecPayload,
    state: OperationState,
    responder: Option<oneshot::Sender<ExecOutput>>,
    started: watch::Sender<Option<u32>>,
}

impl Operation {
    /// Create an operation and the caller-side handle for its result.
    pub fn new(payload: ExecPayload) -> (Self, PendingOperation) {
        let id = OperationId::next();
        let (tx, rx) = oneshot::channel();
        let (started_tx, started_rx) = watch::channel(None);
        let op = Self {
            id,
            payload,
            state: OperationState::Pending,
            responder: Some(tx),
            started: started_tx,
        };
        let pending = PendingOperation {
            id,
            result: rx,
            started: started_rx,
        };
        (op, pending)
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn payload(&self) -> &ExecPayload {
        &self.payload
    }

    /// Marshal `{payload, id}` through `transport`.
    ///
    /// Resets the state to pending, so a resubmitted operation starts over.
    pub fn execute<F>(&mut self, transport: F) -> Result<()>
    where
        F: FnOnce(HostRequest) -> Result<()>,
    {
        self.state = OperationState::Pending;
        transport(HostRequest {
            id: self.id,
            payload: self.payload.clone(),
        })
    }

    pub fn set_in_progress(&mut self, pid: u32) {
        self.state = OperationState::InProgress;
        self.started.send_replace(Some(pid));
    }

    /// Resolve the caller's deferred result.
    pub fn complete(&mut self, output: ExecOutput) {
        self.state = OperationState::Complete;
        if let Some(responder) = self.responder.take() {
            // Receiver gone means the caller gave up waiting.
            let _ = responder.send(output);
        }
    }
}

/// Caller-side handle: the deferred result of an [`Operation`].
#[derive(Debug)]
pub struct PendingOperation {
    id: OperationId,
    result: oneshot::Receiver<ExecOutput>,
    started: watch::Receiver<Option<u32>>,
}

impl PendingOperation {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Watch the pid of the subprocess running this operation. Updated again
    /// if the operation is resubmitted to a replacement host.
    pub fn started(&self) -> watch::Receiver<Option<u32>> {
        self.started.clone()
    }

    /// Wait for the result. Fails if the operation was dropped without one.
    pub async fn wait(self) -> Result<ExecOutput> {
        self.result.await.map_err(|_| GitwardenError::HostUnavailable {
            reason: format!("{} was dropped before completing", self.id),
        })
    }
}
