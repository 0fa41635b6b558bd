// Command-line arguments

use std::path::PathBuf;

use clap::Parser;

/// Run the kubernetes authentication proxy for one cluster context
#[derive(Parser, Debug, Clone)]
#[command(name = "kubeauth-proxy")]
#[command(bin_name = "kubeauth-proxy")]
#[command(about = "Run and supervise a local kubernetes authentication proxy")]
#[command(version)]
pub struct Cli {
    /// Kubeconfig file holding the cluster credentials
    #[arg(long, env = "KUBECONFIG", value_name = "PATH")]
    pub kubeconfig: PathBuf,

    /// Context inside the kubeconfig
    #[arg(long, value_name = "NAME")]
    pub context: String,

    /// PEM certificate served by the proxy
    #[arg(long, value_name = "PEM")]
    pub cert: PathBuf,

    /// PEM private key for the certificate
    #[arg(long, value_name = "PEM")]
    pub key: PathBuf,

    /// TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Proxy binary (overrides the configuration file)
    #[arg(long, value_name = "PATH")]
    pub proxy_bin: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_required_args() {
        let cli = Cli::try_parse_from([
            "kubeauth-proxy",
            "--kubeconfig",
            "/home/me/.kube/config",
            "--context",
            "minikube",
            "--cert",
            "proxy.crt",
            "--key",
            "proxy.key",
            "-v",
        ])
        .unwrap();

        assert_eq!(cli.kubeconfig, PathBuf::from("/home/me/.kube/config"));
        assert_eq!(cli.context, "minikube");
        assert!(cli.verbose);
        assert!(cli.config.is_none());
        assert!(cli.proxy_bin.is_none());
    }

    #[test]
    fn test_context_is_required() {
        let result = Cli::try_parse_from([
            "kubeauth-proxy",
            "--kubeconfig",
            "/tmp/config",
            "--cert",
            "a",
            "--key",
            "b",
        ]);
        assert!(result.is_err());
    }
}
