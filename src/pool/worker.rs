use std::collections::HashMap;

use tracing::{debug, warn};

use crate::pool::host::{ExecutionHost, HostEventKind, HostMessage, WorkerId};
use crate::pool::operation::{Operation, OperationId};

/// What a host event meant for the worker's lifecycle. Consumed by the pool's
/// control loop, which owns every state transition between workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// An operation finished and the worker keeps going.
    Completed(OperationId),
    /// The host died with operations possibly still in flight.
    Crashed,
    /// The host reported slow spawns; it needs a replacement.
    Sick,
    /// The worker is finished and can be dropped.
    Destroyed,
}

/// Owns one sandbox host and the operations currently handed to it.
pub struct Worker {
    id: WorkerId,
    host: Box<dyn ExecutionHost>,
    in_flight: HashMap<OperationId, Operation>,
    completed_count: usize,
    capacity_limit: usize,
    sick: bool,
    started: bool,
}

impl Worker {
    pub fn new(id: WorkerId, host: Box<dyn ExecutionHost>, capacity_limit: usize) -> Self {
        Self {
            id,
            host,
            in_flight: HashMap::new(),
            completed_count: 0,
            capacity_limit,
            sick: false,
            started: false,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn capacity_limit(&self) -> usize {
        self.capacity_limit
    }

    pub fn completed_count(&self) -> usize {
        self.completed_count
    }

    pub fn is_sick(&self) -> bool {
        self.sick
    }

    /// The host has reported ready at least once.
    pub fn has_started(&self) -> bool {
        self.started
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_drained(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn host(&self) -> &dyn ExecutionHost {
        self.host.as_ref()
    }

    /// Record `op` as in flight and forward it to the host.
    ///
    /// The operation stays recorded even if the send fails: a dead host is
    /// reported as a crash, which hands the operation to the replacement.
    pub fn execute_operation(&mut self, mut op: Operation) {
        let id = op.id();
        let host = &self.host;
        if let Err(e) = op.execute(|request| host.send(request)) {
            warn!(worker = %self.id, op = %id, error = %e, "failed to forward operation");
        }
        self.in_flight.insert(id, op);
    }

    /// Apply one host event.
    pub fn handle_event(&mut self, kind: HostEventKind) -> Option<WorkerOutcome> {
        match kind {
            HostEventKind::Message(message) => self.handle_message(message),
            HostEventKind::Exited { intentional: true, .. } => Some(WorkerOutcome::Destroyed),
            HostEventKind::Exited { intentional: false, code } => {
                warn!(
                    worker = %self.id,
                    ?code,
                    in_flight = self.in_flight.len(),
                    "execution host crashed"
                );
                Some(WorkerOutcome::Crashed)
            }
        }
    }

    fn handle_message(&mut self, message: HostMessage) -> Option<WorkerOutcome> {
        match message {
            HostMessage::Ready { pid } => {
                debug!(worker = %self.id, pid, "execution host ready");
                self.started = true;
                None
            }
            HostMessage::ExecStarted { id, pid } => {
                if let Some(op) = self.in_flight.get_mut(&id) {
                    op.set_in_progress(pid);
                }
                None
            }
            HostMessage::Result { id, output } => {
                let Some(mut op) = self.in_flight.remove(&id) else {
                    warn!(worker = %self.id, op = %id, "result for unknown operation");
                    return None;
                };
                op.complete(output);
                self.completed_count += 1;
                if self.sick && self.in_flight.is_empty() {
                    Some(WorkerOutcome::Destroyed)
                } else {
                    Some(WorkerOutcome::Completed(id))
                }
            }
            HostMessage::SlowWarning { average_ms } => {
                if self.sick {
                    return None;
                }
                debug!(worker = %self.id, average_ms, "execution host reports slow spawns");
                self.sick = true;
                Some(WorkerOutcome::Sick)
            }
        }
    }

    /// Hand over every operation still in flight, in submission order.
    pub fn take_remaining(&mut self) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self.in_flight.drain().map(|(_, op)| op).collect();
        ops.sort_by_key(|op| op.id());
        ops
    }

    pub async fn destroy(&self, force: bool) {
        self.host.destroy(force).await;
    }
}

/// Capacity for the replacement of a sick worker: double it (up to `max`)
/// when the worker kept up with its limit, otherwise start over at `baseline`.
pub fn next_capacity_limit(
    capacity_limit: usize,
    completed_count: usize,
    baseline: usize,
    max: usize,
) -> usize {
    if completed_count >= capacity_limit {
        capacity_limit.saturating_mul(2).min(max)
    } else {
        baseline
    }
}
