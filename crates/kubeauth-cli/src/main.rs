// kubeauth-proxy entry point

use clap::Parser;
use kubeauth_cli::{app, cli::Cli, logging, output};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    if let Err(e) = app::run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
