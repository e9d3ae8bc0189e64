use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::logging::LogFile;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct RuntimeStatus {
    pub running: bool,
    pub mode: String,
    pub state_root: Option<String>,
    pub initialized: Option<bool>,
    pub chain_id: Option<String>,
    pub gateway_peer: Option<String>,
    pub node_pid: Option<u32>,
    pub gateway_pid: Option<u32>,
    pub started_at_ms: Option<u64>,
    pub restart_count: u32,
    pub last_restart_ms: Option<u64>,
    pub last_error: Option<String>,
    pub shutting_down: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub killed: usize,
    pub logs_closed: usize,
}

#[derive(Debug, Clone)]
struct TrackedChild {
    name: String,
    pid: Option<u32>,
}

/// Shared lifecycle state for one application run: the shutdown flag and
/// token, the task group every background task joins, the registry of live
/// children and open log files, and the fatal-error channel.
#[derive(Debug)]
pub struct Lifecycle {
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
    children: Mutex<BTreeMap<u64, TrackedChild>>,
    next_child_id: AtomicU64,
    kills: AtomicUsize,
    logs: Mutex<Vec<Arc<LogFile>>>,
    status: Mutex<RuntimeStatus>,
    fatal_tx: mpsc::UnboundedSender<SupervisorError>,
    fatal_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SupervisorError>>,
    shutdown_done: OnceCell<ShutdownReport>,
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            shutting_down: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            children: Mutex::new(BTreeMap::new()),
            next_child_id: AtomicU64::new(1),
            kills: AtomicUsize::new(0),
            logs: Mutex::new(Vec::new()),
            status: Mutex::new(RuntimeStatus::default()),
            fatal_tx,
            fatal_rx: tokio::sync::Mutex::new(fatal_rx),
            shutdown_done: OnceCell::new(),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn register_child(&self, name: &str, pid: Option<u32>) -> u64 {
        let id = self.next_child_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut children) = self.children.lock() {
            children.insert(
                id,
                TrackedChild {
                    name: name.to_string(),
                    pid,
                },
            );
        }
        id
    }

    pub fn release_child(&self, id: u64) {
        if let Ok(mut children) = self.children.lock() {
            children.remove(&id);
        }
    }

    pub fn live_children(&self) -> Vec<(String, Option<u32>)> {
        self.children
            .lock()
            .map(|children| {
                children
                    .values()
                    .map(|child| (child.name.clone(), child.pid))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn record_kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
    }

    pub fn track_log(&self, file: Arc<LogFile>) {
        if let Ok(mut logs) = self.logs.lock() {
            logs.push(file);
        }
    }

    /// Closes a log whose process has finished and forgets it.
    pub fn release_log(&self, file: &Arc<LogFile>) {
        if let Ok(mut logs) = self.logs.lock() {
            logs.retain(|tracked| !Arc::ptr_eq(tracked, file));
        }
        if let Err(err) = file.close() {
            warn!(path = %file.path().display(), error = %err, "failed to close log file");
        }
    }

    pub fn open_logs(&self) -> usize {
        self.logs.lock().map(|logs| logs.len()).unwrap_or(0)
    }

    pub fn update_status<F>(&self, update: F)
    where
        F: FnOnce(&mut RuntimeStatus),
    {
        if let Ok(mut status) = self.status.lock() {
            update(&mut status);
        }
    }

    pub fn status(&self) -> RuntimeStatus {
        let mut snapshot = self
            .status
            .lock()
            .map(|status| status.clone())
            .unwrap_or_default();
        snapshot.shutting_down = self.is_shutting_down();
        snapshot
    }

    /// Records an asynchronous failure. Only the first one is kept as the
    /// status error; all are delivered to `next_fatal`.
    pub fn report_fatal(&self, err: SupervisorError) {
        if self.is_shutting_down() {
            debug!(error = %err, "ignoring failure reported during shutdown");
            return;
        }
        warn!(error = %err, "fatal supervisor error");
        self.update_status(|status| {
            if status.last_error.is_none() {
                status.last_error = Some(err.to_string());
            }
        });
        let _ = self.fatal_tx.send(err);
    }

    /// Resolves with the next fatal error, or `None` once shutdown begins.
    pub async fn next_fatal(&self) -> Option<SupervisorError> {
        let mut rx = self.fatal_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            err = rx.recv() => err,
        }
    }

    /// Kills every supervised child, waits for all background tasks, then
    /// closes every log file. The body runs once; concurrent and later
    /// callers get the same report.
    pub async fn shutdown(&self) -> ShutdownReport {
        *self
            .shutdown_done
            .get_or_init(|| async {
                self.shutting_down.store(true, Ordering::SeqCst);
                info!("shutting down supervised processes");

                self.cancel.cancel();
                self.tracker.close();
                self.tracker.wait().await;

                if let Ok(mut children) = self.children.lock() {
                    for child in children.values() {
                        warn!(name = %child.name, pid = ?child.pid, "child still registered after shutdown");
                    }
                    children.clear();
                }

                let logs = self
                    .logs
                    .lock()
                    .map(|mut logs| std::mem::take(&mut *logs))
                    .unwrap_or_default();
                let mut logs_closed = 0;
                for file in logs {
                    match file.close() {
                        Ok(true) => logs_closed += 1,
                        Ok(false) => {}
                        Err(err) => {
                            warn!(path = %file.path().display(), error = %err, "failed to close log file")
                        }
                    }
                }

                self.update_status(|status| {
                    status.running = false;
                    status.node_pid = None;
                    status.gateway_pid = None;
                });

                let report = ShutdownReport {
                    killed: self.kills.load(Ordering::SeqCst),
                    logs_closed,
                };
                info!(killed = report.killed, logs_closed = report.logs_closed, "shutdown complete");
                report
            })
            .await
    }
}
