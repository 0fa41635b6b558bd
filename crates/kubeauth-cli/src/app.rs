// Wires the command line to an AuthProxy and runs it until interrupted

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use kubeauth_proxy::{AuthProxy, AuthProxyConfig, ProxyCertificate, ProxyPhase, StaticCluster};
use tracing::{debug, info};

use crate::cli::Cli;
use crate::output::OutputStyle;

/// Resolve the supervisor configuration; `--proxy-bin` wins over file and env
pub fn load_config(cli: &Cli) -> Result<AuthProxyConfig> {
    let mut config = AuthProxyConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;

    if let Some(bin) = &cli.proxy_bin {
        config.proxy_bin_path = bin.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Read the PEM pair handed to the proxy
pub fn read_certificate(cert: &Path, key: &Path) -> Result<ProxyCertificate> {
    let cert_pem = std::fs::read_to_string(cert)
        .with_context(|| format!("Failed to read certificate {}", cert.display()))?;
    let key_pem = std::fs::read_to_string(key)
        .with_context(|| format!("Failed to read private key {}", key.display()))?;
    Ok(ProxyCertificate::new(cert_pem, key_pem))
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let certificate = read_certificate(&cli.cert, &cli.key)?;
    let style = OutputStyle::default();

    let (cluster, mut status) = StaticCluster::new(&cli.kubeconfig, &cli.context);
    let proxy = AuthProxy::new(Arc::new(cluster), certificate, config);

    let printer = tokio::spawn(async move {
        while let Some(event) = status.recv().await {
            println!("{}", style.status(&event));
        }
    });

    let outcome = serve(&proxy, &style).await;

    proxy.shutdown().await;
    printer.abort();
    outcome
}

async fn serve(proxy: &AuthProxy, style: &OutputStyle) -> Result<()> {
    tokio::select! {
        started = proxy.run() => started.context("Authentication proxy failed to start")?,
        _ = tokio::signal::ctrl_c() => {
            debug!("Interrupted during startup");
            return Ok(());
        }
    }

    let port = proxy.port()?;
    info!(port, prefix = %proxy.api_prefix(), "Proxy ready");
    println!(
        "{}",
        style.success(&format!(
            "Proxy listening on 127.0.0.1:{}{}",
            port,
            proxy.api_prefix().path()
        ))
    );

    let mut phase = proxy.subscribe();
    tokio::select! {
        stopped = phase.wait_for(|p| matches!(p, ProxyPhase::Stopped(_))) => {
            let stopped = stopped.map(|p| p.clone());
            if let Ok(ProxyPhase::Stopped(Some(err))) = stopped {
                bail!("Authentication proxy stopped: {}", err);
            }
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            debug!("Interrupted, stopping proxy");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;
    use std::path::PathBuf;

    fn cli(extra: &[&str]) -> Cli {
        let mut args = vec![
            "kubeauth-proxy",
            "--kubeconfig",
            "/tmp/kubeconfig",
            "--context",
            "dev",
            "--cert",
            "proxy.crt",
            "--key",
            "proxy.key",
        ];
        args.extend_from_slice(extra);
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_proxy_bin_flag_overrides_config_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "proxy_bin_path = \"/opt/from-file\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let from_file = load_config(&cli(&["--config", &path])).unwrap();
        assert_eq!(from_file.proxy_bin_path, PathBuf::from("/opt/from-file"));

        let overridden =
            load_config(&cli(&["--config", &path, "--proxy-bin", "/opt/from-flag"])).unwrap();
        assert_eq!(overridden.proxy_bin_path, PathBuf::from("/opt/from-flag"));
    }

    #[test]
    fn test_read_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("proxy.crt");
        let key = dir.path().join("proxy.key");
        std::fs::write(&cert, "CERT").unwrap();
        std::fs::write(&key, "KEY").unwrap();

        let certificate = read_certificate(&cert, &key).unwrap();
        assert_eq!(certificate.cert, "CERT");
        assert_eq!(certificate.private_key, "KEY");
    }

    #[test]
    fn test_missing_key_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("proxy.crt");
        std::fs::write(&cert, "CERT").unwrap();

        let err = read_certificate(&cert, &dir.path().join("missing.key")).unwrap_err();
        assert!(format!("{:#}", err).contains("missing.key"));
    }
}
