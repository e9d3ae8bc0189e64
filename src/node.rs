use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::error::{Result, SupervisorError};
use crate::lifecycle::Lifecycle;
use crate::process::{Launcher, ProcessExit, ProcessHandle, ProcessSpec};

const NODE_EXIT_MESSAGE: &str = "Node exited unplanned";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub latest_block_height: u64,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connection refused")]
    ConnectionRefused,
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait StatusClient: Send + Sync {
    async fn status(&self) -> Result<NodeStatus, RpcError>;
}

/// Queries the node's `/status` endpoint over HTTP.
#[derive(Debug, Clone)]
pub struct HttpStatusClient {
    client: reqwest::Client,
    url: String,
}

impl HttpStatusClient {
    pub fn new(rpc_addr: &str) -> Self {
        let base = if rpc_addr.starts_with("http") {
            rpc_addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", rpc_addr.trim_end_matches('/'))
        };
        // The node RPC is local; system proxies must not intercept it.
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: format!("{base}/status"),
        }
    }
}

#[async_trait]
impl StatusClient for HttpStatusClient {
    async fn status(&self) -> Result<NodeStatus, RpcError> {
        let response = self
            .client
            .get(&self.url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(classify)?;
        let body: Value = response.json().await.map_err(classify)?;
        parse_status(&body)
    }
}

fn classify(err: reqwest::Error) -> RpcError {
    if is_connection_refused(&err) {
        RpcError::ConnectionRefused
    } else {
        RpcError::Other(err.to_string())
    }
}

fn is_connection_refused(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(inner) = current {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        current = inner.source();
    }
    false
}

/// Older nodes report the height at `result.latest_block_height`, newer ones
/// under `result.sync_info`, sometimes as a string.
pub fn parse_status(body: &Value) -> Result<NodeStatus, RpcError> {
    if let Some(err) = body.get("error").filter(|err| !err.is_null()) {
        return Err(RpcError::Other(format!("status call failed: {err}")));
    }
    let result = body.get("result").unwrap_or(body);
    let height = result
        .get("latest_block_height")
        .or_else(|| result.get("sync_info").and_then(|info| info.get("latest_block_height")))
        .ok_or_else(|| RpcError::Other("status response has no latest_block_height".into()))?;
    let latest_block_height = match height {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| RpcError::Other(format!("invalid latest_block_height: {height}")))?;
    Ok(NodeStatus {
        latest_block_height,
    })
}

pub struct NodeSupervisor<C> {
    launcher: Launcher,
    client: C,
    poll_interval: Duration,
}

impl<C: StatusClient> NodeSupervisor<C> {
    pub fn new(launcher: Launcher, client: C) -> Self {
        let poll_interval = launcher.config().poll_interval;
        Self {
            launcher,
            client,
            poll_interval,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Spawns the node against `state_root` and waits until it reports a
    /// block. Returns `None` when shutdown interrupts the wait; the node
    /// exiting before it is live is an error.
    pub async fn start(&self, state_root: &Path) -> Result<Option<ProcessHandle>> {
        let config = self.launcher.config();
        let root = state_root.to_string_lossy().to_string();
        let spec = ProcessSpec::new(&config.node_binary, ["node", "--home", root.as_str()])
            .env("BCHOME", root.clone())
            .env("TMROOT", root.clone())
            .log_to(state_root.join(format!("{}.log", config.node_binary)))
            .expect_clean(NODE_EXIT_MESSAGE);
        let mut handle = self.launcher.spawn(spec)?;

        if self.poll_until_live(handle.wait()).await? {
            info!(pid = ?handle.pid, "node is live");
            Ok(Some(handle))
        } else {
            Ok(None)
        }
    }

    /// Polls the status endpoint until the node has produced a block.
    /// `Ok(false)` means shutdown was requested while waiting.
    pub async fn wait_until_live(&self) -> Result<bool> {
        self.poll_until_live(std::future::pending()).await
    }

    async fn poll_until_live<F>(&self, exited: F) -> Result<bool>
    where
        F: Future<Output = ProcessExit>,
    {
        let lifecycle = self.launcher.lifecycle();
        let cancel = lifecycle.token();
        tokio::pin!(exited);
        loop {
            if lifecycle.is_shutting_down() {
                return Ok(false);
            }

            trace!("trying to get node RPC status");
            let status = tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                exit = &mut exited => return exit_before_live(lifecycle, exit),
                status = self.client.status() => status,
            };
            match status {
                Ok(status) if status.latest_block_height > 0 => return Ok(true),
                Ok(_) => debug!("waiting for blockchain to start syncing"),
                Err(RpcError::ConnectionRefused) => trace!("node RPC not listening yet"),
                Err(RpcError::Other(message)) => return Err(SupervisorError::NodeRpc(message)),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                exit = &mut exited => return exit_before_live(lifecycle, exit),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

fn exit_before_live(lifecycle: &Lifecycle, exit: ProcessExit) -> Result<bool> {
    if lifecycle.is_shutting_down() {
        return Ok(false);
    }
    let message = match &exit {
        ProcessExit::Failed(reason) => format!("{NODE_EXIT_MESSAGE}: {reason}"),
        _ => NODE_EXIT_MESSAGE.to_string(),
    };
    let code = match exit {
        ProcessExit::Exited { code } => code,
        _ => None,
    };
    Err(SupervisorError::UnexpectedExit { message, code })
}
