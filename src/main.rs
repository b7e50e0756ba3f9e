//! Daemon entry point
//!
//! Exit codes: 0 clean shutdown, 1 config error, 2 parent node unreachable
//! at startup, 3 port bind failure.

use clap::Parser;
use tracing::error;

use peerpool_node::config::{Cli, NodeConfig};
use peerpool_node::node;
use peerpool_node::utils::init_logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(None);

    let config = match NodeConfig::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    match node::run(config).await {
        Ok(()) => {}
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}
