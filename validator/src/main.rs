// main.rs
mod cli;
mod pipeline;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tessera_common::config::NodeConfig;
use tessera_common::types::Transaction;
use tessera_engine::ports::BlockSigner;
use tessera_engine::storage::ChainStore;
use tessera_engine::{
    honor_nodes_from_config, Chain, Ed25519Signer, Ed25519Verifier, LedgerExecutor, MemoryStore,
    NodeContext, SystemClock, SystemParameters,
};
use tracing::{info, warn};

use crate::cli::NodeCliArgs;
use crate::pipeline::{BlockPipeline, NodeChain};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = NodeCliArgs::parse();

    // Initialize logging with configured level
    tracing_subscriber::fmt()
        .with_max_level(args.get_log_level())
        .with_target(true)
        .init();

    info!("Starting Tessera validator");

    let config = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => NodeConfig::load_default().context("failed to load configuration")?,
    };
    config.validate().context("invalid configuration")?;

    let mut chain = build_chain(&config)?;

    match &args.genesis {
        Some(path) => {
            let raw = fs::read(path)
                .with_context(|| format!("failed to read genesis block {}", path.display()))?;
            chain
                .insert_block_without_forks(&raw, true)
                .context("failed to apply genesis block")?;
        }
        None => {
            chain.init_genesis().context("failed to create genesis block")?;
        }
    }

    if let Some(path) = &args.export_genesis {
        let genesis = chain
            .store()
            .block_by_height(1)?
            .context("genesis block missing after start-up")?;
        fs::write(path, &genesis.data)
            .with_context(|| format!("failed to write genesis block {}", path.display()))?;
        info!(path = %path.display(), "genesis block exported");
    }

    if let Some(dir) = &args.import {
        import_blocks(&mut chain, dir)?;
    }

    if let Some(path) = &args.transactions {
        let raw = fs::read(path)
            .with_context(|| format!("failed to read transactions {}", path.display()))?;
        let txs: Vec<Transaction> =
            serde_json::from_slice(&raw).context("failed to parse transactions")?;
        info!(count = txs.len(), "queueing transactions");
        for tx in txs {
            chain.enqueue_transaction(tx)?;
        }
    }

    if let Some(height) = args.rollback_to {
        chain
            .rollback_to_height(height)
            .with_context(|| format!("failed to roll back to height {}", height))?;
        let head = chain.head()?.map(|head| head.height);
        info!(?head, "rollback complete");
        return Ok(());
    }

    let pipeline = BlockPipeline::start(chain, &config.pipeline, args.export_dir.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    pipeline.shutdown().await;

    Ok(())
}

fn build_chain(config: &NodeConfig) -> Result<NodeChain> {
    let honor_nodes =
        honor_nodes_from_config(&config.honor_nodes).context("invalid honor node keys")?;
    let ctx = NodeContext::new(
        SystemParameters::from(config),
        honor_nodes,
        Arc::new(SystemClock),
    );

    let signer = Ed25519Signer::from_seed(config.node.key_seed);
    info!(
        key = %hex::encode(signer.public_key()),
        position = config.node.position,
        mode = ?config.consensus.mode,
        "loaded signer"
    );

    Ok(Chain::new(
        Arc::new(ctx),
        MemoryStore::with_first_tables(),
        LedgerExecutor,
        Box::new(signer),
        Box::new(Ed25519Verifier),
    ))
}

/// Applies every `*.block` file of `dir` in name order; blocks that fail are
/// logged and skipped.
fn import_blocks(chain: &mut NodeChain, dir: &Path) -> Result<()> {
    let mut paths = fs::read_dir(dir)
        .with_context(|| format!("failed to read block directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().map_or(false, |ext| ext == "block"))
        .collect::<Vec<_>>();
    paths.sort();

    let mut applied = 0usize;
    for path in paths {
        let raw = fs::read(&path)
            .with_context(|| format!("failed to read block {}", path.display()))?;
        match chain.insert_block_without_forks(&raw, false) {
            Ok(_) => applied += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "skipping block"),
        }
    }
    info!(applied, dir = %dir.display(), "blocks imported");
    Ok(())
}
