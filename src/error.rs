use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("network template not usable at {path}: {reason}")]
    NetworkTemplate { path: PathBuf, reason: String },

    #[error("Can't open genesis.json: {0}")]
    GenesisUnreadable(#[source] io::Error),

    #[error("genesis.json is invalid: {0}")]
    GenesisInvalid(String),

    #[error("Can't open config.toml: {0}")]
    ConfigUnreadable(#[source] io::Error),

    #[error("config.toml is invalid: {0}")]
    ConfigInvalid(String),

    #[error("No seeds specified in config.toml")]
    NoSeeds,

    #[error("backup target {0} already exists")]
    BackupExists(PathBuf),

    #[error("failed to spawn {name} ({path}): {source}")]
    Spawn {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{message} ({})", exit_code_text(.code))]
    UnexpectedExit { message: String, code: Option<i32> },

    #[error("{name} process failed: {source}")]
    Process {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Node produced an unexpected error: {0}")]
    NodeRpc(String),

    #[error("Gateway init exited unplanned ({})", exit_code_text(.0))]
    GatewayInit(Option<i32>),

    #[error("Can't start gateway: {0}")]
    GatewayStart(#[source] Box<SupervisorError>),

    #[error("{name} exited before becoming ready")]
    ExitedBeforeReady { name: String },

    #[error("{name} did not report readiness within {timeout:?}")]
    ReadinessTimeout { name: String, timeout: Duration },

    #[error("shutdown in progress, refusing to spawn {0}")]
    ShuttingDown(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

fn exit_code_text(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".to_string(),
    }
}
