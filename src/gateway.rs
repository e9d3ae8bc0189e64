use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SupervisorError};
use crate::lifecycle::now_ms;
use crate::process::{Launcher, ProcessExit, ProcessHandle, ProcessSpec};

/// What a readiness scan saw before it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Ready(String),
    Closed,
    Cancelled,
    TimedOut,
}

/// Reads output chunks, reassembles lines, and stops at the first line that
/// contains `marker`. A trailing partial line is checked too, since some
/// builds print the marker without a newline before blocking.
pub async fn scan_for_marker(
    chunks: &mut mpsc::UnboundedReceiver<String>,
    marker: &str,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> ScanOutcome {
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    let mut pending = String::new();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return ScanOutcome::Cancelled,
            _ = sleep_until(deadline) => return ScanOutcome::TimedOut,
            chunk = chunks.recv() => chunk,
        };
        let Some(chunk) = next else {
            return ScanOutcome::Closed;
        };
        pending.push_str(&chunk);
        while let Some(idx) = pending.find('\n') {
            let line: String = pending.drain(..=idx).collect();
            if line.contains(marker) {
                return ScanOutcome::Ready(line.trim_end().to_string());
            }
        }
        if pending.contains(marker) {
            return ScanOutcome::Ready(std::mem::take(&mut pending));
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone)]
pub struct GatewaySupervisor {
    launcher: Launcher,
    restart_delay: Duration,
}

impl GatewaySupervisor {
    pub fn new(launcher: Launcher) -> Self {
        let restart_delay = launcher.config().restart_delay;
        Self {
            launcher,
            restart_delay,
        }
    }

    pub fn with_restart_delay(mut self, restart_delay: Duration) -> Self {
        self.restart_delay = restart_delay;
        self
    }

    /// One-time `init`: generates the gateway config and trusts the peer's
    /// validator set. Every prompt on stdout is answered with `y`.
    pub async fn init(&self, chain_id: &str, home: &Path, peer: &str) -> Result<()> {
        let config = self.launcher.config();
        let lifecycle = self.launcher.lifecycle();
        let home_arg = home.to_string_lossy().to_string();
        let mut spec = ProcessSpec::new(
            &config.gateway_binary,
            [
                "init",
                "--home",
                home_arg.as_str(),
                "--chain-id",
                chain_id,
                "--node",
                peer,
            ],
        );
        spec.pipe_stdin = true;
        spec.observe_stdout = true;

        info!(chain_id, peer, home = %home.display(), "initializing gateway");
        let mut handle = self.launcher.spawn(spec)?;
        let mut stdin = handle.stdin.take();
        let mut stdout = handle.stdout.take();

        if let Some(stdout) = stdout.as_mut() {
            loop {
                let chunk = tokio::select! {
                    _ = lifecycle.token().cancelled() => return Ok(()),
                    chunk = stdout.recv() => chunk,
                };
                let Some(_) = chunk else { break };
                if lifecycle.is_shutting_down() {
                    return Ok(());
                }
                if let Some(pipe) = stdin.as_mut() {
                    if let Err(err) = pipe.write_all(b"y\n").await {
                        debug!(error = %err, "gateway init closed stdin");
                        stdin = None;
                    }
                }
            }
        }
        drop(stdin);

        match handle.wait().await {
            ProcessExit::Exited { code: Some(0) } => Ok(()),
            _ if lifecycle.is_shutting_down() => Ok(()),
            ProcessExit::Exited { code } => Err(SupervisorError::GatewayInit(code)),
            ProcessExit::Killed | ProcessExit::Failed(_) => Err(SupervisorError::GatewayInit(None)),
        }
    }

    /// Starts `serve` and waits for the readiness marker on stderr.
    /// Returns `None` when shutdown interrupts the wait.
    pub async fn start(&self, home: &Path) -> Result<Option<ProcessHandle>> {
        self.start_inner(home)
            .await
            .map_err(|err| SupervisorError::GatewayStart(Box::new(err)))
    }

    async fn start_inner(&self, home: &Path) -> Result<Option<ProcessHandle>> {
        let config = self.launcher.config();
        let lifecycle = self.launcher.lifecycle();
        let home_arg = home.to_string_lossy().to_string();
        let mut spec = ProcessSpec::new(&config.gateway_binary, ["serve", "--home", home_arg.as_str()])
            .log_to(home.join(format!("{}.log", config.gateway_binary)));
        spec.observe_stderr = true;

        let mut handle = self.launcher.spawn(spec)?;
        let Some(mut stderr) = handle.stderr.take() else {
            return Err(SupervisorError::ExitedBeforeReady {
                name: handle.name.clone(),
            });
        };

        let outcome = scan_for_marker(
            &mut stderr,
            &config.readiness_marker,
            lifecycle.token(),
            config.gateway_ready_timeout,
        )
        .await;
        match outcome {
            ScanOutcome::Ready(line) => {
                info!(pid = ?handle.pid, "gateway ready: {line}");
                lifecycle.update_status(|status| status.gateway_pid = handle.pid);
                Ok(Some(handle))
            }
            ScanOutcome::Cancelled => Ok(None),
            ScanOutcome::Closed if lifecycle.is_shutting_down() => Ok(None),
            ScanOutcome::Closed => Err(SupervisorError::ExitedBeforeReady {
                name: handle.name.clone(),
            }),
            ScanOutcome::TimedOut => {
                handle.kill();
                Err(SupervisorError::ReadinessTimeout {
                    name: handle.name.clone(),
                    timeout: config.gateway_ready_timeout.unwrap_or_default(),
                })
            }
        }
    }

    /// Restarts the gateway whenever it exits outside of shutdown. Runs as a
    /// tracked task so shutdown waits for it.
    pub fn supervise(&self, home: PathBuf, handle: ProcessHandle) {
        let supervisor = self.clone();
        self.launcher
            .lifecycle()
            .tracker()
            .spawn(async move { supervisor.restart_loop(home, handle).await });
    }

    async fn restart_loop(self, home: PathBuf, mut current: ProcessHandle) {
        let lifecycle = self.launcher.lifecycle().clone();
        let cancel = lifecycle.token().clone();
        loop {
            let exit = tokio::select! {
                _ = cancel.cancelled() => return,
                exit = current.wait() => exit,
            };
            if lifecycle.is_shutting_down() {
                return;
            }
            warn!(?exit, "gateway crashed, restarting");
            lifecycle.update_status(|status| status.gateway_pid = None);

            current = loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.restart_delay) => {}
                }
                match self.start(&home).await {
                    Ok(Some(handle)) => break handle,
                    Ok(None) => return,
                    Err(err) => warn!(error = %err, "gateway restart failed, retrying"),
                }
            };
            lifecycle.update_status(|status| {
                status.restart_count = status.restart_count.saturating_add(1);
                status.last_restart_ms = Some(now_ms());
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_only_after_the_serving_line() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tx.send("starting\n".to_string()).unwrap();
        tx.send("connecting\n".to_string()).unwrap();
        let early = tokio::time::timeout(
            Duration::from_millis(50),
            scan_for_marker(&mut rx, "Serving on", &cancel, None),
        )
        .await;
        assert!(early.is_err(), "scan resolved before the marker arrived");

        tx.send("Serving on 0.0.0.0:1317\n".to_string()).unwrap();
        let outcome = scan_for_marker(&mut rx, "Serving on", &cancel, None).await;
        assert_eq!(outcome, ScanOutcome::Ready("Serving on 0.0.0.0:1317".to_string()));
    }

    #[tokio::test]
    async fn marker_split_across_chunks_is_found() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tx.send("I[01-01] Serv".to_string()).unwrap();
        tx.send("ing on tcp://localhost:8998\nmore\n".to_string()).unwrap();

        let outcome = scan_for_marker(&mut rx, "Serving on", &cancel, None).await;
        assert_eq!(
            outcome,
            ScanOutcome::Ready("I[01-01] Serving on tcp://localhost:8998".to_string())
        );
    }

    #[tokio::test]
    async fn scan_reports_closed_cancelled_and_timeout() {
        let cancel = CancellationToken::new();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tx.send("panic: bad config\n".to_string()).unwrap();
        drop(tx);
        assert_eq!(
            scan_for_marker(&mut rx, "Serving on", &cancel, None).await,
            ScanOutcome::Closed
        );

        let (_tx, mut rx) = mpsc::unbounded_channel::<String>();
        assert_eq!(
            scan_for_marker(&mut rx, "Serving on", &cancel, Some(Duration::from_millis(20))).await,
            ScanOutcome::TimedOut
        );

        cancel.cancel();
        assert_eq!(
            scan_for_marker(&mut rx, "Serving on", &cancel, None).await,
            ScanOutcome::Cancelled
        );
    }
}
