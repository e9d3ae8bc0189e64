#![cfg(unix)]

mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use common::{read_lines, test_config, wait_until, write_script};
use cosmos_ui_desktop::gateway::GatewaySupervisor;
use cosmos_ui_desktop::lifecycle::Lifecycle;
use cosmos_ui_desktop::node::{HttpStatusClient, NodeSupervisor};
use cosmos_ui_desktop::process::{Launcher, ProcessExit, ProcessSpec};
use cosmos_ui_desktop::SupervisorError;

fn launcher_for(config: cosmos_ui_desktop::LaunchConfig) -> (Launcher, Arc<Lifecycle>) {
    let lifecycle = Lifecycle::new();
    (Launcher::new(Arc::new(config), lifecycle.clone()), lifecycle)
}

#[tokio::test]
async fn concurrent_shutdown_kills_each_child_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_script(&config.binary_dir, "sleeper", "exec sleep 30");
    let logs = dir.path().join("logs");
    let (launcher, lifecycle) = launcher_for(config);

    let mut first = launcher
        .spawn(ProcessSpec::new("sleeper", ["a"]).log_to(logs.join("a.log")))
        .unwrap();
    let mut second = launcher
        .spawn(ProcessSpec::new("sleeper", ["b"]).log_to(logs.join("b.log")))
        .unwrap();
    assert_eq!(lifecycle.live_children().len(), 2);

    let (one, two) = tokio::join!(lifecycle.shutdown(), lifecycle.shutdown());
    assert_eq!(one, two);
    assert_eq!(one.killed, 2);
    assert_eq!(one.logs_closed, 2);
    assert_eq!(first.wait().await, ProcessExit::Killed);
    assert_eq!(second.wait().await, ProcessExit::Killed);
    assert!(lifecycle.live_children().is_empty());

    assert_eq!(lifecycle.shutdown().await, one);
    let err = launcher.spawn(ProcessSpec::new("sleeper", ["c"])).unwrap_err();
    assert!(matches!(err, SupervisorError::ShuttingDown(_)));
}

#[tokio::test]
async fn missing_binary_is_a_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let (launcher, lifecycle) = launcher_for(test_config(dir.path()));

    let err = launcher
        .spawn(ProcessSpec::new("does-not-exist", Vec::<String>::new()))
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Spawn { ref name, .. } if name == "does-not-exist"));
    lifecycle.shutdown().await;
}

#[tokio::test]
async fn node_exit_during_startup_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    let refused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    config.node_rpc_addr = refused.local_addr().unwrap().to_string();
    drop(refused);
    write_script(&config.binary_dir, "tendermint", "echo \"$BCHOME $TMROOT $*\"\nexit 4");
    let root = config.state_root.clone();
    fs::create_dir_all(&root).unwrap();
    let client = HttpStatusClient::new(&config.node_rpc_addr);
    let (launcher, lifecycle) = launcher_for(config);

    let node = NodeSupervisor::new(launcher, client);
    let err = tokio::time::timeout(Duration::from_secs(10), node.start(&root))
        .await
        .expect("node start did not fail")
        .unwrap_err();
    assert!(matches!(err, SupervisorError::UnexpectedExit { code: Some(4), .. }));
    assert_eq!(err.to_string(), "Node exited unplanned (exit code 4)");

    let fatal = tokio::time::timeout(Duration::from_secs(5), lifecycle.next_fatal())
        .await
        .expect("no fatal error reported")
        .expect("fatal channel closed");
    assert!(matches!(fatal, SupervisorError::UnexpectedExit { code: Some(4), .. }));

    let log = root.join("tendermint.log");
    let expected = format!("{0} {0} node --home {0}", root.display());
    assert!(
        wait_until(Duration::from_secs(5), || read_lines(&log).contains(&expected)).await,
        "node log: {:?}",
        read_lines(&log)
    );
    lifecycle.shutdown().await;
}

#[tokio::test]
async fn finished_process_log_is_closed_before_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_script(&config.binary_dir, "oneshot", "echo hello\necho oops >&2");
    let log = dir.path().join("logs").join("oneshot.log");
    let (launcher, lifecycle) = launcher_for(config);

    let mut handle = launcher
        .spawn(ProcessSpec::new("oneshot", Vec::<String>::new()).log_to(log.clone()))
        .unwrap();
    assert_eq!(handle.wait().await, ProcessExit::Exited { code: Some(0) });
    assert!(wait_until(Duration::from_secs(5), || lifecycle.open_logs() == 0).await);

    let mut lines = read_lines(&log);
    lines.sort();
    assert_eq!(lines, vec!["hello".to_string(), "oops".to_string()]);
    assert_eq!(lifecycle.shutdown().await.logs_closed, 0);
}

#[tokio::test]
async fn gateway_init_answers_the_trust_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_script(
        &config.binary_dir,
        "baseserver",
        r#"printf 'Trust this validator set? [y/n] '
read answer
[ "$answer" = "y" ] || exit 3
echo "$*" > "$(dirname "$0")/init-args""#,
    );
    let args_file = config.binary_dir.join("init-args");
    let home = config.gateway_home();
    let (launcher, lifecycle) = launcher_for(config);

    GatewaySupervisor::new(launcher)
        .init("testnet-1", &home, "1.2.3.4:46657")
        .await
        .unwrap();
    assert_eq!(
        read_lines(&args_file),
        vec![format!(
            "init --home {} --chain-id testnet-1 --node 1.2.3.4:46657",
            home.display()
        )]
    );
    lifecycle.shutdown().await;
}

#[tokio::test]
async fn gateway_init_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_script(&config.binary_dir, "baseserver", "echo 'ERROR: cannot reach node' >&2\nexit 2");
    let home = config.gateway_home();
    let (launcher, lifecycle) = launcher_for(config);

    let err = GatewaySupervisor::new(launcher)
        .init("testnet-1", &home, "1.2.3.4:46657")
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::GatewayInit(Some(2))));
    lifecycle.shutdown().await;
}

#[tokio::test]
async fn gateway_start_waits_for_serving_marker() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_script(
        &config.binary_dir,
        "baseserver",
        r#"echo "starting" >&2
echo "connecting" >&2
sleep 0.2
echo "Serving on 0.0.0.0:1317" >&2
exec sleep 30"#,
    );
    let home = config.gateway_home();
    let (launcher, lifecycle) = launcher_for(config);

    let handle = GatewaySupervisor::new(launcher)
        .start(&home)
        .await
        .unwrap()
        .expect("start cancelled");
    assert_eq!(handle.try_exit(), None);
    assert_eq!(lifecycle.status().gateway_pid, handle.pid);

    let report = lifecycle.shutdown().await;
    assert_eq!(report.killed, 1);
    let log = fs::read_to_string(home.join("baseserver.log")).unwrap();
    assert!(log.contains("Serving on 0.0.0.0:1317"));
}

#[tokio::test]
async fn gateway_exiting_before_ready_fails_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_script(&config.binary_dir, "baseserver", "echo 'panic: no config' >&2\nexit 1");
    let home = config.gateway_home();
    let (launcher, lifecycle) = launcher_for(config);

    let err = GatewaySupervisor::new(launcher).start(&home).await.unwrap_err();
    assert!(err.to_string().starts_with("Can't start gateway: "));
    assert!(matches!(
        err,
        SupervisorError::GatewayStart(ref inner)
            if matches!(**inner, SupervisorError::ExitedBeforeReady { .. })
    ));
    lifecycle.shutdown().await;
}

#[tokio::test]
async fn gateway_readiness_wait_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.gateway_ready_timeout = Some(Duration::from_millis(200));
    write_script(&config.binary_dir, "baseserver", "echo 'syncing' >&2\nexec sleep 30");
    let home = config.gateway_home();
    let (launcher, lifecycle) = launcher_for(config);

    let err = GatewaySupervisor::new(launcher).start(&home).await.unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::GatewayStart(ref inner)
            if matches!(**inner, SupervisorError::ReadinessTimeout { .. })
    ));
    assert!(wait_until(Duration::from_secs(5), || lifecycle.live_children().is_empty()).await);
    lifecycle.shutdown().await;
}

#[tokio::test]
async fn crashed_gateway_is_restarted_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    write_script(
        &config.binary_dir,
        "baseserver",
        r#"echo "$*" >> "$(dirname "$0")/starts"
echo "Serving on 0.0.0.0:1317" >&2
sleep 0.1
exit 1"#,
    );
    let starts = config.binary_dir.join("starts");
    let home = config.gateway_home();
    let (launcher, lifecycle) = launcher_for(config);

    let gateway = GatewaySupervisor::new(launcher).with_restart_delay(Duration::from_millis(20));
    let handle = gateway.start(&home).await.unwrap().expect("start cancelled");
    gateway.supervise(home.clone(), handle);

    assert!(
        wait_until(Duration::from_secs(15), || read_lines(&starts).len() >= 4).await,
        "gateway was not restarted: {:?}",
        read_lines(&starts)
    );
    assert!(lifecycle.status().restart_count >= 2);
    assert!(
        wait_until(Duration::from_secs(5), || lifecycle.open_logs() <= 1).await,
        "logs of crashed gateways stayed open: {}",
        lifecycle.open_logs()
    );

    let report = lifecycle.shutdown().await;
    assert!(report.logs_closed <= 1, "{report:?}");
    let after_shutdown = read_lines(&starts).len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let lines = read_lines(&starts);
    assert_eq!(lines.len(), after_shutdown);

    let expected = format!("serve --home {}", home.display());
    assert!(lines.iter().all(|line| *line == expected), "{lines:?}");
}
