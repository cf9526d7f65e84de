//! Peerwire node binary.

use tracing_subscriber::EnvFilter;

use peerwire_node::cli::Cli;
use peerwire_node::config::NodeConfig;
use peerwire_node::node::Node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    // Set up logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Peerwire Node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::from_cli(&cli);
    Node::new(config).run().await?;

    Ok(())
}
