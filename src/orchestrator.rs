use std::sync::Arc;

use tracing::info;

use crate::config::LaunchConfig;
use crate::datadir::DataDir;
use crate::error::{Result, SupervisorError};
use crate::gateway::GatewaySupervisor;
use crate::lifecycle::{now_ms, Lifecycle, RuntimeStatus, ShutdownReport};
use crate::logging::{LogFile, MainLog};
use crate::network;
use crate::node::{HttpStatusClient, NodeSupervisor};
use crate::process::Launcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    Cancelled,
}

/// Owns one application run: configuration, lifecycle state, and the
/// supervisors built on top of them.
pub struct Orchestrator {
    config: Arc<LaunchConfig>,
    lifecycle: Arc<Lifecycle>,
    launcher: Launcher,
    main_log: MainLog,
}

impl Orchestrator {
    pub fn new(config: LaunchConfig, main_log: MainLog) -> Self {
        let config = Arc::new(config);
        let lifecycle = Lifecycle::new();
        let launcher = Launcher::new(config.clone(), lifecycle.clone());
        lifecycle.update_status(|status| {
            status.mode = config.mode.as_str().to_string();
            status.state_root = Some(config.state_root.to_string_lossy().to_string());
        });
        Self {
            config,
            lifecycle,
            launcher,
            main_log,
        }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn status(&self) -> RuntimeStatus {
        self.lifecycle.status()
    }

    /// Runs the startup sequence: repair the state root, bring the node up,
    /// initialize the gateway on fresh roots, then start and supervise it.
    pub async fn start(&self) -> Result<StartOutcome> {
        let outcome = self.start_inner().await;
        if let Err(err) = &outcome {
            self.lifecycle.update_status(|status| {
                status.last_error = Some(err.to_string());
            });
        }
        outcome
    }

    async fn start_inner(&self) -> Result<StartOutcome> {
        let config = &self.config;
        let root = config.state_root.clone();

        let data_dir = DataDir::new(
            root.clone(),
            config.network_template.clone(),
            config.app_version.clone(),
        );
        let initialized = data_dir.ensure()?;
        self.lifecycle
            .update_status(|status| status.initialized = Some(initialized));

        if config.redirects_main_log() {
            let path = config.main_log_path();
            info!(path = %path.display(), "redirecting log output to file");
            let file = LogFile::create(&path)
                .map_err(|err| SupervisorError::io("cannot open main.log", err))?;
            self.lifecycle.track_log(file.clone());
            self.main_log.redirect(file);
        }

        info!(mode = config.mode.as_str(), version = %config.app_version, "starting app");

        let chain_id = network::read_chain_id(&root)?;
        let peer = match &config.peer_override {
            Some(peer) => peer.clone(),
            None => network::pick_peer(&root, config.peer_rpc_port, &mut rand::thread_rng())?,
        };
        self.lifecycle.update_status(|status| {
            status.chain_id = Some(chain_id.clone());
            status.gateway_peer = Some(peer.clone());
        });

        let node = NodeSupervisor::new(
            self.launcher.clone(),
            HttpStatusClient::new(&config.node_rpc_addr),
        );
        let Some(node_handle) = node.start(&root).await? else {
            return Ok(StartOutcome::Cancelled);
        };
        self.lifecycle
            .update_status(|status| status.node_pid = node_handle.pid);

        let gateway = GatewaySupervisor::new(self.launcher.clone());
        let gateway_home = config.gateway_home();
        if initialized {
            info!(peer = %peer, "initializing gateway with remote node");
            gateway.init(&chain_id, &gateway_home, &peer).await?;
        }

        info!("starting gateway");
        let Some(gateway_handle) = gateway.start(&gateway_home).await? else {
            return Ok(StartOutcome::Cancelled);
        };
        gateway.supervise(gateway_home, gateway_handle);
        info!("gateway ready");

        self.lifecycle.update_status(|status| {
            status.running = true;
            status.started_at_ms = Some(now_ms());
        });
        Ok(StartOutcome::Started)
    }

    pub async fn next_fatal(&self) -> Option<SupervisorError> {
        self.lifecycle.next_fatal().await
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        self.lifecycle.shutdown().await
    }
}
