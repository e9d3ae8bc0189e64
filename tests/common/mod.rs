#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cosmos_ui_desktop::{LaunchConfig, RuntimeMode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub const GENESIS: &str = r#"{"chain_id": "testnet-1", "validators": []}"#;

/// Writes an executable `/bin/sh` script standing in for a real binary.
pub fn write_script(bin_dir: &Path, name: &str, body: &str) -> PathBuf {
    fs::create_dir_all(bin_dir).unwrap();
    let path = bin_dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn write_template(dir: &Path) -> PathBuf {
    let template = dir.join("template");
    fs::create_dir_all(&template).unwrap();
    fs::write(template.join("genesis.json"), GENESIS).unwrap();
    fs::write(template.join("config.toml"), "[p2p]\nseeds = \"1.2.3.4:46656\"\n").unwrap();
    template
}

pub fn test_config(dir: &Path) -> LaunchConfig {
    let mut config = LaunchConfig::new(
        RuntimeMode::Test,
        dir.join("root"),
        write_template(dir),
        dir.join("bin"),
    );
    config.poll_interval = Duration::from_millis(20);
    config.restart_delay = Duration::from_millis(20);
    config.gateway_ready_timeout = Some(Duration::from_secs(10));
    config
}

pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|text| text.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Serves a fixed node `/status` response on an ephemeral port.
pub async fn spawn_status_server(height: u64) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = format!(r#"{{"jsonrpc":"2.0","id":"","result":{{"latest_block_height":{height}}}}}"#);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr.to_string()
}
