use std::process::ExitCode;

use anyhow::Context;
use cosmos_ui_desktop::logging::{self, MainLog};
use cosmos_ui_desktop::{LaunchConfig, Orchestrator, StartOutcome};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            eprintln!("Error in main process: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = LaunchConfig::from_env().context("resolving launch configuration")?;
    let main_log = MainLog::default();
    logging::init(&config, main_log.clone())?;

    let orchestrator = Orchestrator::new(config, main_log);
    let result = tokio::select! {
        started = orchestrator.start() => match started {
            Ok(StartOutcome::Started) => wait_for_exit(&orchestrator).await,
            Ok(StartOutcome::Cancelled) => Ok(()),
            Err(err) => Err(anyhow::Error::new(err).context("startup failed")),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted during startup");
            Ok(())
        }
    };

    orchestrator.shutdown().await;
    result
}

async fn wait_for_exit(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    info!("supervising node and gateway, press Ctrl-C to stop");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl-C")?;
            info!("stop requested");
            Ok(())
        }
        fatal = orchestrator.next_fatal() => match fatal {
            Some(err) => Err(anyhow::Error::new(err).context("supervised process failed")),
            None => Ok(()),
        },
    }
}
