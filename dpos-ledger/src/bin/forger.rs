//! Single-node forger binary
//!
//! Opens the chain, writes a genesis block if the store is empty, then forges
//! one block per slot until interrupted.

use anyhow::Context;
use dpos_ledger::{Chain, Config, KeyPair};
use tokio::time::{interval, Duration, MissedTickBehavior};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting DPoS forger");

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => Config::from_env().context("failed to load config from environment")?,
    };

    let secret = std::env::var("DPOS_FORGER_SECRET")
        .context("DPOS_FORGER_SECRET must hold the forger passphrase")?;
    let keypair = KeyPair::from_passphrase(&secret);

    let chain = Chain::open(config).await?;
    tracing::info!(address = %keypair.address(), "Chain opened");

    if chain.last_block()?.is_none() {
        let genesis = chain.create_genesis(&keypair, Vec::new(), 0)?;
        chain.apply_genesis(genesis).await?;
        tracing::info!("Genesis block written");
    }

    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_slot = chain.clock().slot_number(None);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let slot = chain.clock().slot_number(None);
                if slot == last_slot {
                    continue;
                }
                last_slot = slot;

                let timestamp = u32::try_from(chain.clock().slot_time(slot))
                    .context("slot time out of range")?;
                if let Err(e) = chain.forge(&keypair, Vec::new(), timestamp).await {
                    tracing::warn!(slot, error = %e, "Failed to forge block");
                }
            }
        }
    }

    tracing::info!(
        forged = chain.metrics().blocks_forged.get(),
        "Shutting down forger"
    );
    chain.shutdown().await?;
    Ok(())
}
