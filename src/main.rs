use std::sync::Arc;

use tracing::info;

use cipher_agent::agent::AgentNode;
use cipher_agent::chain::SolanaChain;
use cipher_agent::config;
use cipher_agent::prover::CircomProver;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cipher_agent=debug".into()),
        )
        .init();

    let cfg = config::load_config()?;
    info!(
        "starting cipher-agent (http={}, dht={}, beacon={}, rpc={})",
        cfg.http_port, cfg.dht_port, cfg.beacon_port, cfg.rpc_url
    );

    let prover = Arc::new(CircomProver::from_env());
    let rpc_url = cfg.rpc_url.clone();
    let program_id = cfg.program_id;
    // The chain adapter signs with the agent wallet; materialize it first so
    // a missing/corrupt wallet fails startup instead of the first deposit.
    let wallet = match &cfg.wallet_path {
        Some(path) => cipher_agent::wallet::load_override(path)?,
        None => cipher_agent::wallet::load_or_create(&cfg.data_dir)?,
    };
    let chain = Arc::new(SolanaChain::new(&rpc_url, program_id, Arc::new(wallet)));

    let node = AgentNode::new(cfg, chain, prover)?;
    let http_port = node.start().await?;
    info!(http_port, pubkey = %node.wallet_pubkey(), "agent up");

    let mixer = Arc::clone(&node);
    let mix_task = tokio::spawn(async move { mixer.run_auto_mix().await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    node.request_stop();
    node.peers.save().ok();
    mix_task.abort();
    Ok(())
}
