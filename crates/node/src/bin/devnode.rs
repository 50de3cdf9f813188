//! A development node: the full sequencer stack over the in-memory chain
//! and the mock proof backend. Useful for poking the pipeline locally;
//! production deployments wire real `ChainRpc` endpoints and a real proof
//! backend instead.

use std::sync::Arc;

use scrutiny_chain::{ChainAdapter, MockChain, MockRpc, RpcPool};
use scrutiny_interface::config::{from_toml_path, SequencerConfig};
use scrutiny_node::fixtures::MapFetcher;
use scrutiny_node::Node;
use scrutiny_prover::MockProofBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config: SequencerConfig = match std::env::args().nth(1) {
        Some(path) => from_toml_path(path)?,
        None => {
            let dir = std::env::temp_dir().join("scrutiny-devnode");
            tracing::info!(path = %dir.display(), "no config given, using defaults");
            SequencerConfig::for_testing(dir)
        }
    };

    let chain = MockChain::new();
    let endpoints: Vec<MockRpc> = (0..2).map(|_| MockRpc::new(chain.clone())).collect();
    let pool = Arc::new(RpcPool::new(
        endpoints,
        config.chain.retry_count,
        config.chain.endpoint_cooldown(),
    ));
    let adapter = Arc::new(ChainAdapter::new(
        pool,
        config.chain.gas_multiplier_percent,
        config.chain.retry_sleep(),
        config.chain.confirmations,
    ));

    let node = Node::build(
        config,
        adapter,
        Arc::new(MapFetcher::default()),
        Arc::new(MockProofBackend::new()),
    )?;
    let (running, parts) = node.start();
    tracing::info!(storage = %parts.config.storage.path.display(), "devnode running, ctrl-c stops");

    tokio::signal::ctrl_c().await?;
    running.shutdown().await;
    Ok(())
}
