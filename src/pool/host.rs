//! The seam between the pool and the sandbox processes it supervises.
//!
//! The pool only ever talks to a host through [`ExecutionHost`]; messages
//! coming back are delivered as [`HostEvent`]s on the channel the
//! [`HostLauncher`] was given, tagged with the owning worker's id.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::exec::{ExecOutput, ExecPayload};
use crate::pool::operation::OperationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Work item sent to a sandbox host, one JSON line each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRequest {
    pub id: OperationId,
    pub payload: ExecPayload,
}

/// Messages a sandbox host sends back, one JSON line each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostMessage {
    /// The host finished initialising and accepts work.
    Ready { pid: u32 },
    /// The subprocess for operation `id` was spawned.
    ExecStarted { id: OperationId, pid: u32 },
    Result { id: OperationId, output: ExecOutput },
    /// Spawning has become slow; the host should be rotated out.
    #[serde(rename_all = "camelCase")]
    SlowWarning { average_ms: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostEventKind {
    Message(HostMessage),
    /// The host process is gone. `intentional` is set when it was destroyed
    /// through [`ExecutionHost::destroy`].
    Exited { intentional: bool, code: Option<i32> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostEvent {
    pub worker: WorkerId,
    pub kind: HostEventKind,
}

pub type HostEventSender = mpsc::UnboundedSender<HostEvent>;

/// One sandbox process.
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    /// Queue a request. Requests sent before the host is ready are delivered
    /// once it is.
    fn send(&self, request: HostRequest) -> Result<()>;

    fn is_ready(&self) -> bool;

    fn pid(&self) -> Option<u32>;

    /// Tear the host down. Without `force` the host finishes what it already
    /// received before exiting.
    async fn destroy(&self, force: bool);
}

/// Creates hosts for new workers.
#[async_trait]
pub trait HostLauncher: Send + Sync {
    async fn launch(
        &self,
        worker: WorkerId,
        capacity: usize,
        events: HostEventSender,
    ) -> Result<Box<dyn ExecutionHost>>;
}
