//! The node's block pipeline.
//!
//! Received blocks go through a channel to a single parser task, and a
//! generator task wakes up on every tick to produce a block in this node's
//! slot. Both lock the same chain, so only one block is played at a time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tessera_common::config::PipelineConfig;
use tessera_engine::storage::BlockRecord;
use tessera_engine::{Chain, LedgerExecutor, MemoryStore};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type NodeChain = Chain<MemoryStore, LedgerExecutor>;
pub type SharedChain = Arc<Mutex<NodeChain>>;

pub struct BlockPipeline {
    chain: SharedChain,
    blocks_tx: mpsc::Sender<Vec<u8>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BlockPipeline {
    /// Spawns the parser and generator tasks.
    pub fn start(chain: NodeChain, config: &PipelineConfig, export_dir: Option<PathBuf>) -> Self {
        let chain = Arc::new(Mutex::new(chain));
        let (blocks_tx, blocks_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tick = Duration::from_millis(config.generator_tick_ms.max(1));

        let handles = vec![
            tokio::spawn(parse_blocks(chain.clone(), blocks_rx, shutdown_rx.clone())),
            tokio::spawn(generate_blocks(chain.clone(), tick, export_dir, shutdown_rx)),
        ];
        info!(tick_ms = tick.as_millis() as u64, "block pipeline started");

        Self {
            chain,
            blocks_tx,
            shutdown_tx,
            handles,
        }
    }

    /// Channel feeding raw blocks to the parser
    pub fn block_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.blocks_tx.clone()
    }

    pub fn chain(&self) -> SharedChain {
        self.chain.clone()
    }

    /// Stops both tasks and waits for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "pipeline task panicked");
            }
        }
        info!("block pipeline stopped");
    }
}

async fn parse_blocks(
    chain: SharedChain,
    mut blocks_rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = blocks_rx.recv() => {
                let Some(raw) = received else { break };
                let mut chain = chain.lock().await;
                // rejections are logged by the chain
                if let Ok(record) = chain.insert_block_without_forks(&raw, false) {
                    debug!(height = record.height, "received block applied");
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    debug!("block parser stopped");
}

async fn generate_blocks(
    chain: SharedChain,
    tick: Duration,
    export_dir: Option<PathBuf>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let generated = chain.lock().await.generate_block();
                match generated {
                    Ok(Some(record)) => export(&export_dir, &record).await,
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "block generation attempt failed"),
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    debug!("block generator stopped");
}

async fn export(export_dir: &Option<PathBuf>, record: &BlockRecord) {
    let Some(dir) = export_dir else { return };
    let path = dir.join(format!("{:010}.block", record.height));
    if let Err(e) = tokio::fs::write(&path, &record.data).await {
        error!(path = %path.display(), error = %e, "failed to export block");
    }
}
