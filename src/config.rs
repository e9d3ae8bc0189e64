use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SupervisorError};

pub const NODE_BINARY: &str = "tendermint";
pub const GATEWAY_BINARY: &str = "baseserver";
pub const GATEWAY_DIR: &str = "baseserver";
pub const NODE_RPC_ADDR: &str = "localhost:46657";
pub const PEER_RPC_PORT: u16 = 46657;
pub const READINESS_MARKER: &str = "Serving on";
pub const DEFAULT_NETWORK: &str = "tak";

const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    Development,
    Test,
    Production,
}

impl RuntimeMode {
    fn from_flags(dev: bool, test: bool) -> Self {
        if dev {
            Self::Development
        } else if test {
            Self::Test
        } else {
            Self::Production
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Production => "production",
        }
    }

    /// Development and test runs use binaries from the developer's Go
    /// toolchain instead of the ones packaged with the app.
    pub fn uses_developer_binaries(self) -> bool {
        matches!(self, Self::Development | Self::Test)
    }
}

/// Everything the supervisors need to know about the environment, resolved
/// once at startup.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub mode: RuntimeMode,
    pub logging: bool,
    pub app_version: String,
    pub state_root: PathBuf,
    pub network_template: PathBuf,
    pub binary_dir: PathBuf,
    pub node_binary: String,
    pub gateway_binary: String,
    pub gateway_dir: String,
    pub node_rpc_addr: String,
    pub peer_rpc_port: u16,
    pub peer_override: Option<String>,
    pub poll_interval: Duration,
    pub restart_delay: Duration,
    pub gateway_ready_timeout: Option<Duration>,
    pub readiness_marker: String,
}

impl LaunchConfig {
    pub fn new(
        mode: RuntimeMode,
        state_root: PathBuf,
        network_template: PathBuf,
        binary_dir: PathBuf,
    ) -> Self {
        Self {
            mode,
            logging: true,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            state_root,
            network_template,
            binary_dir,
            node_binary: NODE_BINARY.to_string(),
            gateway_binary: GATEWAY_BINARY.to_string(),
            gateway_dir: GATEWAY_DIR.to_string(),
            node_rpc_addr: NODE_RPC_ADDR.to_string(),
            peer_rpc_port: PEER_RPC_PORT,
            peer_override: None,
            poll_interval: Duration::from_secs(1),
            restart_delay: Duration::from_secs(1),
            gateway_ready_timeout: Some(Duration::from_secs(DEFAULT_GATEWAY_TIMEOUT_SECS)),
            readiness_marker: READINESS_MARKER.to_string(),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let dev = lookup("NODE_ENV").map(|v| v.trim() == "development").unwrap_or(false);
        let test = parse_flag(lookup("COSMOS_TEST").as_deref(), false);
        let mode = RuntimeMode::from_flags(dev, test);
        let logging = parse_flag(lookup("LOGGING").as_deref(), dev);

        let home = dirs::home_dir()
            .ok_or_else(|| SupervisorError::Config("cannot determine home directory".into()))?;

        let state_root = match lookup("COSMOS_HOME").as_deref().and_then(normalize_path) {
            Some(path) => expand_tilde_path(&path, &home),
            None if mode == RuntimeMode::Development => home.join(".cosmos-ui-dev"),
            None => home.join(".cosmos-ui"),
        };

        let bundle_root = bundle_root(mode)?;
        let network_template = match lookup("COSMOS_NETWORK").as_deref().and_then(normalize_path) {
            Some(path) => expand_tilde_path(&path, &home),
            None => bundle_root.join("networks").join(DEFAULT_NETWORK),
        };

        let binary_dir = if mode.uses_developer_binaries() {
            let gopath = lookup("GOPATH")
                .as_deref()
                .and_then(normalize_path)
                .map(|path| expand_tilde_path(&path, &home))
                .unwrap_or_else(|| home.join("go"));
            gopath.join("bin")
        } else {
            bundle_root.join("bin")
        };

        let mut config = Self::new(mode, state_root, network_template, binary_dir);
        config.logging = logging;
        config.peer_override = lookup("COSMOS_NODE")
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty());

        if let Some(raw) = lookup("COSMOS_GATEWAY_TIMEOUT") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                SupervisorError::Config(format!("COSMOS_GATEWAY_TIMEOUT is not a number: {raw}"))
            })?;
            config.gateway_ready_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        Ok(config)
    }

    pub fn resolve_binary(&self, name: &str) -> PathBuf {
        self.binary_dir.join(name)
    }

    pub fn gateway_home(&self) -> PathBuf {
        self.state_root.join(&self.gateway_dir)
    }

    pub fn main_log_path(&self) -> PathBuf {
        self.state_root.join("main.log")
    }

    /// Development and test runs keep logging on the console.
    pub fn redirects_main_log(&self) -> bool {
        self.mode == RuntimeMode::Production
    }
}

/// Flags follow the loose JSON convention the launch scripts use: anything
/// other than a literal `false` turns the flag on.
fn parse_flag(raw: Option<&str>, default: bool) -> bool {
    match raw.map(str::trim) {
        None | Some("") => default,
        Some("false") => false,
        Some(_) => true,
    }
}

fn normalize_path(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

fn expand_tilde_path(path: &Path, home: &Path) -> PathBuf {
    if path == Path::new("~") {
        return home.to_path_buf();
    }
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

fn bundle_root(mode: RuntimeMode) -> Result<PathBuf> {
    if mode.uses_developer_binaries() {
        return Ok(PathBuf::from(env!("CARGO_MANIFEST_DIR")));
    }
    let exe = env::current_exe()
        .map_err(|err| SupervisorError::io("cannot locate the running executable", err))?;
    Ok(exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}
