#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

use std::sync::Arc;

use cosmos_ui_desktop::logging::{self, MainLog};
use cosmos_ui_desktop::{LaunchConfig, Orchestrator, RuntimeStatus, StartOutcome};
use tauri::{Manager, RunEvent, State, WindowEvent};
use tracing::{error, info};

struct DesktopRuntime {
    orchestrator: Arc<Orchestrator>,
}

#[tauri::command]
fn runtime_status(runtime: State<'_, DesktopRuntime>) -> RuntimeStatus {
    runtime.orchestrator.status()
}

fn request_shutdown(orchestrator: Arc<Orchestrator>) {
    tauri::async_runtime::spawn(async move {
        orchestrator.shutdown().await;
    });
}

fn main() {
    let config = match LaunchConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error in main process: {err}");
            std::process::exit(1);
        }
    };
    let main_log = MainLog::default();
    if let Err(err) = logging::init(&config, main_log.clone()) {
        eprintln!("{err:#}");
    }
    info!(mode = config.mode.as_str(), "dev mode: {}", config.mode.uses_developer_binaries());

    let orchestrator = Arc::new(Orchestrator::new(config, main_log));

    let app = tauri::Builder::default()
        .manage(DesktopRuntime {
            orchestrator: orchestrator.clone(),
        })
        .setup(|app| {
            let handle = app.handle().clone();
            let orchestrator = app.state::<DesktopRuntime>().orchestrator.clone();
            tauri::async_runtime::spawn(async move {
                match orchestrator.start().await {
                    Ok(StartOutcome::Started) => {}
                    Ok(StartOutcome::Cancelled) => return,
                    Err(err) => {
                        error!("Error in main process: {err}");
                        orchestrator.shutdown().await;
                        handle.exit(1);
                        return;
                    }
                }
                if let Some(err) = orchestrator.next_fatal().await {
                    error!("Error in main process: {err}");
                    orchestrator.shutdown().await;
                    handle.exit(1);
                }
            });
            Ok(())
        })
        .on_window_event(|window, event| {
            if let WindowEvent::Destroyed = event {
                info!(window = window.label(), "window closed");
                let orchestrator = window.state::<DesktopRuntime>().orchestrator.clone();
                request_shutdown(orchestrator);
            }
        })
        .invoke_handler(tauri::generate_handler![runtime_status])
        .build(tauri::generate_context!())
        .expect("failed to build Cosmos UI desktop shell");

    app.run(move |_app, event| {
        if let RunEvent::Exit = event {
            tauri::async_runtime::block_on(orchestrator.shutdown());
        }
    });
}
