//! Pool of sandbox hosts that run the external tool outside this process.
//!
//! Exactly one worker is active at a time and receives new operations. All
//! worker transitions (crash replacement, sickness rotation, retirement) are
//! made by a single control loop that consumes [`WorkerOutcome`]s, so an
//! operation is never owned by two workers at once.

pub mod host;
pub mod operation;
pub mod process_host;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::GitwardenConfig;
use crate::error::{GitwardenError, Result};
use crate::exec::ExecPayload;

pub use host::{
    ExecutionHost, HostEvent, HostEventKind, HostEventSender, HostLauncher, HostMessage,
    HostRequest, WorkerId,
};
pub use operation::{Operation, OperationId, OperationState, PendingOperation};
pub use process_host::{ProcessHost, ProcessHostLauncher};
pub use worker::{next_capacity_limit, Worker, WorkerOutcome};

/// Capacity bounds for adaptive worker rotation, and the brake on hosts that
/// die before they ever become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub baseline_capacity: usize,
    pub max_capacity: usize,
    /// Consecutive failed host startups before launches are paused.
    pub max_startup_failures: u32,
    /// How long launches stay paused. Requests fail meanwhile, so the
    /// pipeline runs them in-process.
    pub relaunch_cooldown: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            baseline_capacity: 10,
            max_capacity: 100,
            max_startup_failures: 5,
            relaunch_cooldown: Duration::from_secs(30),
        }
    }
}

impl From<&GitwardenConfig> for PoolSettings {
    fn from(config: &GitwardenConfig) -> Self {
        Self {
            baseline_capacity: config.baseline_capacity,
            max_capacity: config.max_capacity,
            ..Self::default()
        }
    }
}

/// Snapshot of the pool, for monitoring and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub active_worker: Option<WorkerId>,
    pub active_capacity: Option<usize>,
    pub active_pid: Option<u32>,
    pub active_ready: bool,
    /// Active plus retired workers still draining.
    pub workers: usize,
    pub in_flight: usize,
    /// Worker launches attempted over the pool's lifetime.
    pub launched: u64,
    /// Launches are paused after repeated startup failures.
    pub launches_paused: bool,
}

enum PoolCommand {
    Request(Operation),
    Stats(oneshot::Sender<PoolStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the pool's control loop. Clones share the same pool; the pool
/// shuts down when the last handle is dropped.
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<PoolCommand>,
    ready: watch::Receiver<bool>,
}

impl WorkerPool {
    /// Launch the first worker at baseline capacity and start the control loop.
    pub async fn start(launcher: Arc<dyn HostLauncher>, settings: PoolSettings) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);

        let mut state = PoolState {
            launcher,
            settings,
            events: events_tx,
            workers: HashMap::new(),
            active: None,
            next_worker: 0,
            shut_down: false,
            startup_failures: 0,
            paused_until: None,
            ready: ready_tx,
        };
        state.create_new_worker(settings.baseline_capacity).await;
        state.refresh_ready();
        tokio::spawn(state.run(commands_rx, events_rx));

        Self {
            commands: commands_tx,
            ready: ready_rx,
        }
    }

    /// True once the active worker's host has signalled readiness.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until [`is_ready`](Self::is_ready) holds, for at most `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.clone();
        let reached = matches!(
            tokio::time::timeout(timeout, ready.wait_for(|r| *r)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Hand `payload` to the active worker. Returns immediately; the result
    /// arrives through the returned handle.
    pub fn request(&self, payload: ExecPayload) -> PendingOperation {
        let (op, pending) = Operation::new(payload);
        if self.commands.send(PoolCommand::Request(op)).is_err() {
            // The operation was dropped with the message; `pending` reports it.
            debug!(op = %pending.id(), "request after pool shutdown");
        }
        pending
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(PoolCommand::Stats(tx))
            .map_err(|_| pool_gone())?;
        rx.await.map_err(|_| pool_gone())
    }

    /// Force-destroy every host. Outstanding operations fail.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(PoolCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

fn pool_gone() -> GitwardenError {
    GitwardenError::HostUnavailable {
        reason: "worker pool has shut down".into(),
    }
}

struct PoolState {
    launcher: Arc<dyn HostLauncher>,
    settings: PoolSettings,
    events: HostEventSender,
    workers: HashMap<WorkerId, Worker>,
    active: Option<WorkerId>,
    next_worker: u64,
    shut_down: bool,
    startup_failures: u32,
    paused_until: Option<Instant>,
    ready: watch::Sender<bool>,
}

impl PoolState {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PoolCommand>,
        mut events: mpsc::UnboundedReceiver<HostEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PoolCommand::Request(op)) => self.dispatch(op).await,
                    Some(PoolCommand::Stats(reply)) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(PoolCommand::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.on_event(event).await,
            }
            self.refresh_ready();
        }
        debug!("worker pool control loop stopped");
    }

    async fn create_new_worker(&mut self, capacity_limit: usize) {
        if self.shut_down || self.launches_paused() {
            return;
        }
        let id = WorkerId(self.next_worker);
        self.next_worker += 1;

        match self
            .launcher
            .launch(id, capacity_limit, self.events.clone())
            .await
        {
            Ok(host) => {
                info!(worker = %id, capacity_limit, "activated new worker");
                self.workers
                    .insert(id, Worker::new(id, host, capacity_limit));
                self.active = Some(id);
            }
            Err(e) => {
                error!(worker = %id, error = %e, "failed to launch execution host");
                self.record_startup_failure();
            }
        }
    }

    /// True while launches are paused. The pause lifts itself once the
    /// cooldown has passed, with a fresh failure budget.
    fn launches_paused(&mut self) -> bool {
        match self.paused_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                info!("relaunch cooldown over; launching execution hosts again");
                self.paused_until = None;
                self.startup_failures = 0;
                false
            }
            None => false,
        }
    }

    fn record_startup_failure(&mut self) {
        self.startup_failures += 1;
        if self.startup_failures >= self.settings.max_startup_failures {
            error!(
                failures = self.startup_failures,
                cooldown_ms = self.settings.relaunch_cooldown.as_millis() as u64,
                "execution hosts keep failing at startup; pausing launches"
            );
            self.paused_until = Some(Instant::now() + self.settings.relaunch_cooldown);
        }
    }

    async fn dispatch(&mut self, op: Operation) {
        if self.active.is_none() {
            self.create_new_worker(self.settings.baseline_capacity).await;
        }
        match self.active.and_then(|id| self.workers.get_mut(&id)) {
            Some(worker) => worker.execute_operation(op),
            None => warn!(op = %op.id(), "no active worker; dropping operation"),
        }
    }

    async fn on_event(&mut self, event: HostEvent) {
        if matches!(event.kind, HostEventKind::Message(HostMessage::Ready { .. })) {
            self.startup_failures = 0;
        }
        let Some(worker) = self.workers.get_mut(&event.worker) else {
            debug!(worker = %event.worker, "event for retired worker");
            return;
        };
        match worker.handle_event(event.kind) {
            None | Some(WorkerOutcome::Completed(_)) => {}
            Some(WorkerOutcome::Crashed) => self.on_crashed(event.worker).await,
            Some(WorkerOutcome::Sick) => self.on_sick(event.worker).await,
            Some(WorkerOutcome::Destroyed) => self.on_destroyed(event.worker).await,
        }
    }

    async fn on_crashed(&mut self, id: WorkerId) {
        let Some(mut crashed) = self.workers.remove(&id) else {
            return;
        };
        if !crashed.has_started() && crashed.completed_count() == 0 {
            self.record_startup_failure();
        }
        if self.active == Some(id) {
            self.active = None;
            self.create_new_worker(crashed.capacity_limit()).await;
        }

        let orphans = crashed.take_remaining();
        if !orphans.is_empty() {
            info!(worker = %id, count = orphans.len(), "resubmitting orphaned operations");
        }
        for op in orphans {
            self.dispatch(op).await;
        }
        crashed.destroy(true).await;
    }

    async fn on_sick(&mut self, id: WorkerId) {
        if self.active == Some(id) {
            if let Some(sick) = self.workers.get(&id) {
                let capacity = next_capacity_limit(
                    sick.capacity_limit(),
                    sick.completed_count(),
                    self.settings.baseline_capacity,
                    self.settings.max_capacity,
                );
                info!(
                    worker = %id,
                    completed = sick.completed_count(),
                    previous_limit = sick.capacity_limit(),
                    next_limit = capacity,
                    "rotating out sick worker"
                );
                self.create_new_worker(capacity).await;
            }
        }

        if self.workers.get(&id).is_some_and(Worker::is_drained) {
            self.on_destroyed(id).await;
        }
    }

    async fn on_destroyed(&mut self, id: WorkerId) {
        let Some(mut worker) = self.workers.remove(&id) else {
            return;
        };
        if self.active == Some(id) {
            self.active = None;
        }
        debug!(worker = %id, completed = worker.completed_count(), "worker retired");

        let leftovers = worker.take_remaining();
        worker.destroy(false).await;
        for op in leftovers {
            self.dispatch(op).await;
        }
    }

    async fn shutdown(&mut self) {
        self.shut_down = true;
        self.active = None;
        self.ready.send_replace(false);
        for (_, worker) in self.workers.drain() {
            worker.destroy(true).await;
        }
        info!("worker pool shut down");
    }

    fn refresh_ready(&self) {
        let ready = self
            .active
            .and_then(|id| self.workers.get(&id))
            .is_some_and(|w| w.host().is_ready());
        self.ready.send_if_modified(|current| {
            let changed = *current != ready;
            *current = ready;
            changed
        });
    }

    fn stats(&self) -> PoolStats {
        let launches_paused = self
            .paused_until
            .is_some_and(|until| Instant::now() < until);
        let active = self.active.and_then(|id| self.workers.get(&id));
        PoolStats {
            active_worker: self.active,
            active_capacity: active.map(Worker::capacity_limit),
            active_pid: active.and_then(|w| w.host().pid()),
            active_ready: active.is_some_and(|w| w.host().is_ready()),
            workers: self.workers.len(),
            in_flight: self.workers.values().map(Worker::in_flight).sum(),
            launched: self.next_worker,
            launches_paused,
        }
    }
}
