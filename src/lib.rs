pub mod config;
pub mod datadir;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod lifecycle;
pub mod logging;
pub mod network;
pub mod node;
pub mod orchestrator;
pub mod process;

pub use config::{LaunchConfig, RuntimeMode};
pub use error::{Result, SupervisorError};
pub use lifecycle::{Lifecycle, RuntimeStatus, ShutdownReport};
pub use orchestrator::{Orchestrator, StartOutcome};
