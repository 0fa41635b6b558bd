//! End-to-end proxy lifecycle against real sockets and real child processes
//!
//! The proxy binary is stood in for by `sh -c` scripts printing the same
//! startup line as the real one.

#![cfg(unix)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use kubeauth_cli::app::{load_config, read_certificate};
use kubeauth_cli::cli::Cli;
use kubeauth_proxy::controller::PORT_TIMEOUT_RESTARTING;
use kubeauth_proxy::supervisor::PROXY_STARTED;
use kubeauth_proxy::{
    AuthProxy, AuthProxyConfig, ProxyCertificate, ProxyPhase, StaticCluster, StatusEvent,
    StatusLevel,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use clap::Parser;

const WAIT: Duration = Duration::from_secs(15);

async fn open_port() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn closed_port() -> u16 {
    let (listener, port) = open_port().await;
    drop(listener);
    port
}

async fn status_until(
    rx: &mut UnboundedReceiver<StatusEvent>,
    done: impl Fn(&StatusEvent) -> bool,
) -> Vec<StatusEvent> {
    let mut seen = Vec::new();
    let _ = timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                break;
            }
        }
    })
    .await;
    seen
}

fn sh_config(script: String) -> AuthProxyConfig {
    let mut config = AuthProxyConfig::default();
    config.proxy_bin_path = "sh".into();
    config.args = vec!["-c".to_string(), script];
    config.probe.interval_ms = 50;
    config.probe.timeout_ms = 600;
    config.stop_grace_ms = 1_000;
    config
}

#[tokio::test]
async fn test_dead_port_is_restarted_onto_live_port() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("spawned-once");
    let dead = closed_port().await;
    let (_live_listener, live) = open_port().await;

    // First spawn announces a port nobody listens on; the second a live one
    let script = format!(
        "if [ -f {marker} ]; then \
           echo 'Starting to serve on 127.0.0.1:{live}'; \
         else \
           touch {marker}; \
           echo 'Starting to serve on 127.0.0.1:{dead}'; \
         fi; \
         exec sleep 30",
        marker = marker.display(),
    );

    let (cluster, mut status) = StaticCluster::new("/tmp/kubeconfig", "e2e");
    let proxy = AuthProxy::new(
        Arc::new(cluster),
        ProxyCertificate::new("CERT", "KEY"),
        sh_config(script),
    );

    timeout(WAIT, proxy.run()).await.unwrap().unwrap();

    assert_eq!(proxy.port(), Ok(live));
    assert_eq!(proxy.phase(), ProxyPhase::Ready { port: live });

    let seen = status_until(&mut status, |e| e.message == PORT_TIMEOUT_RESTARTING).await;
    let restart = seen
        .iter()
        .find(|e| e.message == PORT_TIMEOUT_RESTARTING)
        .expect("restart was not reported");
    assert_eq!(restart.level, StatusLevel::Error);

    timeout(WAIT, proxy.shutdown()).await.unwrap();
    assert_eq!(proxy.phase(), ProxyPhase::Stopped(None));
}

#[tokio::test]
async fn test_config_file_drives_the_proxy() {
    let (_listener, port) = open_port().await;

    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        file,
        r#"
proxy_bin_path = "sh"
args = ["-c", 'echo "Starting to serve on 127.0.0.1:{port}"; exec sleep 30']
stop_grace_ms = 500

[probe]
interval_ms = 50
timeout_ms = 2000
"#
    )
    .unwrap();

    let config = AuthProxyConfig::load(Some(file.path())).unwrap();
    assert_eq!(config.probe.timeout_ms, 2_000);

    let (cluster, mut status) = StaticCluster::new("/tmp/kubeconfig", "e2e");
    let proxy = AuthProxy::new(Arc::new(cluster), ProxyCertificate::new("C", "K"), config);

    timeout(WAIT, proxy.run()).await.unwrap().unwrap();
    assert_eq!(proxy.port(), Ok(port));

    let seen = status_until(&mut status, |e| e.message == PROXY_STARTED).await;
    assert!(seen.iter().any(|e| e.message == PROXY_STARTED));

    proxy.shutdown().await;
}

#[tokio::test]
async fn test_cli_inputs_reach_the_proxy_process() {
    let dir = tempfile::tempdir().unwrap();
    let cert = dir.path().join("proxy.crt");
    let key = dir.path().join("proxy.key");
    std::fs::write(&cert, "CERT-PEM").unwrap();
    std::fs::write(&key, "KEY-PEM").unwrap();

    let (_listener, port) = open_port().await;
    let script = format!(
        "echo 'Starting to serve on 127.0.0.1:{port}'; \
         echo \"ctx=$KUBECONFIG_CONTEXT cert=$PROXY_CERT key=$PROXY_KEY\"; \
         exec sleep 30"
    );
    let config_path = dir.path().join("kubeauth.toml");
    std::fs::write(
        &config_path,
        "[probe]\ninterval_ms = 50\ntimeout_ms = 2000\n",
    )
    .unwrap();

    let cli = Cli::try_parse_from([
        "kubeauth-proxy",
        "--kubeconfig",
        "/tmp/kubeconfig",
        "--context",
        "staging",
        "--cert",
        cert.to_str().unwrap(),
        "--key",
        key.to_str().unwrap(),
        "--config",
        config_path.to_str().unwrap(),
        "--proxy-bin",
        "sh",
    ])
    .unwrap();

    let mut config = load_config(&cli).unwrap();
    assert_eq!(config.proxy_bin_path, std::path::PathBuf::from("sh"));
    config.args = vec!["-c".to_string(), script];
    let certificate = read_certificate(&cli.cert, &cli.key).unwrap();

    let (cluster, mut status) = StaticCluster::new(&cli.kubeconfig, &cli.context);
    let proxy = AuthProxy::new(Arc::new(cluster), certificate, config);

    timeout(WAIT, proxy.run()).await.unwrap().unwrap();

    let seen = status_until(&mut status, |e| e.message.starts_with("ctx=")).await;
    let line = seen
        .iter()
        .find(|e| e.message.starts_with("ctx="))
        .expect("environment line missing");
    assert_eq!(line.message, "ctx=staging cert=CERT-PEM key=KEY-PEM");

    proxy.shutdown().await;
}
