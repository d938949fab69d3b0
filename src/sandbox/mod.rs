//! The side of the pool that runs inside a sandbox host process.
//!
//! Reads [`HostRequest`] lines, runs the external tool for each one
//! concurrently, and answers with [`HostMessage`] lines. Spawn latency is
//! tracked over a window of `capacity` samples; once the window is full and
//! its average crosses the threshold, a single `slow-warning` is sent so the
//! pool can rotate this host out.

pub mod tracker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::exec::{run_local, ExecOutput};
use crate::pool::host::{HostMessage, HostRequest};

pub use tracker::SpawnTracker;

pub use crate::exec::SPAWN_FAILURE_EXIT_CODE;

#[derive(Debug, Clone)]
pub struct HostSettings {
    pub capacity: usize,
    pub git_path: String,
    pub slow_spawn_threshold_ms: u64,
}

struct SpawnMonitor {
    tracker: Mutex<SpawnTracker>,
    threshold_ms: f64,
    warned: AtomicBool,
}

impl SpawnMonitor {
    /// Record a spawn. Returns the average the first time it is too slow.
    fn record(&self, spawn_ms: f64) -> Option<f64> {
        let average = {
            let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
            tracker.add(spawn_ms);
            tracker.average()
        }?;
        if average > self.threshold_ms && !self.warned.swap(true, Ordering::AcqRel) {
            return Some(average);
        }
        None
    }
}

/// Serve requests from `input` until it closes, then finish in-flight work.
pub async fn run_host<R, W>(settings: HostSettings, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (messages, messages_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_messages(output, messages_rx));

    let _ = messages.send(HostMessage::Ready {
        pid: std::process::id(),
    });

    let monitor = Arc::new(SpawnMonitor {
        tracker: Mutex::new(SpawnTracker::new(settings.capacity)),
        threshold_ms: settings.slow_spawn_threshold_ms as f64,
        warned: AtomicBool::new(false),
    });
    let git_path: Arc<str> = Arc::from(settings.git_path.as_str());

    let mut tasks = JoinSet::new();
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let request: HostRequest = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "ignoring malformed host request");
                continue;
            }
        };
        tasks.spawn(execute_request(
            request,
            git_path.clone(),
            messages.clone(),
            monitor.clone(),
        ));
    }

    debug!(in_flight = tasks.len(), "input closed; draining");
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "host task failed");
        }
    }

    drop(messages);
    writer.await.map_err(|e| std::io::Error::other(e.to_string()))??;
    Ok(())
}

async fn execute_request(
    request: HostRequest,
    git_path: Arc<str>,
    messages: mpsc::UnboundedSender<HostMessage>,
    monitor: Arc<SpawnMonitor>,
) {
    let id = request.id;
    let spawn_start = Instant::now();
    let on_spawn = |pid: u32| {
        let spawn_ms = spawn_start.elapsed().as_secs_f64() * 1000.0;
        let _ = messages.send(HostMessage::ExecStarted { id, pid });
        if let Some(average_ms) = monitor.record(spawn_ms) {
            let _ = messages.send(HostMessage::SlowWarning { average_ms });
        }
    };

    let output = match run_local(&git_path, &request.payload, CancellationToken::new(), on_spawn)
        .await
    {
        Ok(run) => run.output,
        Err(e) => {
            warn!(op = %id, error = %e, "failed to run external tool");
            ExecOutput {
                stdout: String::new(),
                stderr: e.to_string(),
                exit_code: SPAWN_FAILURE_EXIT_CODE,
                timing: None,
            }
        }
    };

    let _ = messages.send(HostMessage::Result { id, output });
}

async fn write_messages<W>(
    mut output: W,
    mut messages: mpsc::UnboundedReceiver<HostMessage>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = messages.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        output.write_all(&line).await?;
        output.flush().await?;
    }
    output.shutdown().await
}
