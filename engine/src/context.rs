use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tessera_common::config::{ConsensusMode, LimitsConfig, NodeConfig};
use tessera_common::hashing::Hash32;
use tracing::{info, warn};

use crate::ports::HonorNodeRegistry;

/// Source of the current unix time in seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Clock driven by hand, for tests and simulations
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// A registered producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HonorNode {
    pub key_id: i64,
    pub public_key: Vec<u8>,
    pub address: String,
    /// The remote is known to be unusable
    pub stopped: bool,
}

/// Per-process cache of system parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemParameters {
    pub mode: ConsensusMode,
    pub generation_time_secs: u64,
    pub blocks_gap_secs: u64,
    pub first_block_time: i64,
    pub limits: LimitsConfig,
    pub node_position: i64,
    pub key_id: i64,
    pub ecosystem: i64,
}

impl SystemParameters {
    pub fn slot_duration_secs(&self) -> u64 {
        self.generation_time_secs + self.blocks_gap_secs
    }
}

impl From<&NodeConfig> for SystemParameters {
    fn from(config: &NodeConfig) -> Self {
        Self {
            mode: config.consensus.mode,
            generation_time_secs: config.consensus.generation_time_secs,
            blocks_gap_secs: config.consensus.blocks_gap_secs,
            first_block_time: config.consensus.first_block_time,
            limits: config.limits.clone(),
            node_position: config.node.position,
            key_id: config.node.key_id,
            ecosystem: config.node.ecosystem,
        }
    }
}

impl Default for SystemParameters {
    fn default() -> Self {
        Self::from(&NodeConfig::development())
    }
}

/// Why block production is paused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// A transaction signalled a network halt
    NetworkStopping,
    /// An operator or monitor asked for it
    Requested,
}

struct Shared {
    params: SystemParameters,
    honor_nodes: Vec<HonorNode>,
}

/// Node-wide state shared by the scheduler, validator and playback.
///
/// Parameters and the honor-node list are read-mostly and replaced together
/// by [`NodeContext::refresh`].
pub struct NodeContext {
    shared: RwLock<Shared>,
    /// key id -> banned until (unix seconds)
    bans: Mutex<HashMap<i64, i64>>,
    checked: Mutex<HashSet<Hash32>>,
    pause: Mutex<Option<PauseReason>>,
    clock: Arc<dyn Clock>,
}

impl NodeContext {
    pub fn new(params: SystemParameters, honor_nodes: Vec<HonorNode>, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: RwLock::new(Shared {
                params,
                honor_nodes,
            }),
            bans: Mutex::new(HashMap::new()),
            checked: Mutex::new(HashSet::new()),
            pause: Mutex::new(None),
            clock,
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn params(&self) -> SystemParameters {
        self.shared.read().params.clone()
    }

    /// Replaces parameters and the honor-node list in one step
    pub fn refresh(&self, params: SystemParameters, honor_nodes: Vec<HonorNode>) {
        let mut shared = self.shared.write();
        shared.params = params;
        shared.honor_nodes = honor_nodes;
        info!(nodes = shared.honor_nodes.len(), "refreshed system parameters");
    }

    /// Number of producers taking part in the rotation; at least one.
    pub fn active_node_count(&self) -> u64 {
        self.shared.read().honor_nodes.len().max(1) as u64
    }

    pub fn ban(&self, key_id: i64) {
        let until = self.now() + self.shared.read().params.limits.ban_duration_secs;
        self.bans.lock().insert(key_id, until);
        warn!(key_id, until, "banned key");
    }

    pub fn is_banned(&self, key_id: i64) -> bool {
        let now = self.now();
        let mut bans = self.bans.lock();
        match bans.get(&key_id) {
            Some(until) if *until > now => true,
            Some(_) => {
                bans.remove(&key_id);
                false
            }
            None => false,
        }
    }

    pub fn mark_checked(&self, hash: Hash32) {
        self.checked.lock().insert(hash);
    }

    pub fn is_checked(&self, hash: &Hash32) -> bool {
        self.checked.lock().contains(hash)
    }

    pub fn invalidate_checked<'a>(&self, hashes: impl IntoIterator<Item = &'a Hash32>) {
        let mut checked = self.checked.lock();
        for hash in hashes {
            checked.remove(hash);
        }
    }

    pub fn pause(&self, reason: PauseReason) {
        *self.pause.lock() = Some(reason);
        warn!(?reason, "node paused");
    }

    pub fn resume(&self) {
        if self.pause.lock().take().is_some() {
            info!("node resumed");
        }
    }

    pub fn paused(&self) -> Option<PauseReason> {
        *self.pause.lock()
    }
}

impl HonorNodeRegistry for NodeContext {
    fn honor_nodes(&self) -> Vec<HonorNode> {
        self.shared.read().honor_nodes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(key_id: i64, stopped: bool) -> HonorNode {
        HonorNode {
            key_id,
            public_key: vec![key_id as u8; 32],
            address: format!("127.0.0.1:{}", 7000 + key_id),
            stopped,
        }
    }

    fn context(clock: Arc<ManualClock>) -> NodeContext {
        NodeContext::new(
            SystemParameters::default(),
            vec![node(1, false), node(2, true), node(3, false)],
            clock,
        )
    }

    #[test]
    fn test_ban_expires() {
        let clock = Arc::new(ManualClock::new(1_000));
        let ctx = context(clock.clone());

        ctx.ban(9);
        assert!(ctx.is_banned(9));
        assert!(!ctx.is_banned(10));

        clock.advance(SystemParameters::default().limits.ban_duration_secs);
        assert!(!ctx.is_banned(9));
    }

    #[test]
    fn test_pause_and_resume() {
        let ctx = context(Arc::new(ManualClock::new(0)));
        assert_eq!(ctx.paused(), None);
        ctx.pause(PauseReason::NetworkStopping);
        assert_eq!(ctx.paused(), Some(PauseReason::NetworkStopping));
        ctx.resume();
        assert_eq!(ctx.paused(), None);
    }

    #[test]
    fn test_registry_and_refresh() {
        let ctx = context(Arc::new(ManualClock::new(0)));
        assert_eq!(ctx.active_node_count(), 3);
        assert_eq!(ctx.node_at(2).map(|n| n.key_id), Some(3));
        assert_eq!(ctx.node_at(-1), None);

        ctx.refresh(SystemParameters::default(), Vec::new());
        assert_eq!(ctx.active_node_count(), 1);
    }

    #[test]
    fn test_checked_cache_invalidation() {
        let ctx = context(Arc::new(ManualClock::new(0)));
        ctx.mark_checked([1; 32]);
        ctx.mark_checked([2; 32]);
        ctx.invalidate_checked(&[[1; 32]]);
        assert!(!ctx.is_checked(&[1; 32]));
        assert!(ctx.is_checked(&[2; 32]));
    }
}
