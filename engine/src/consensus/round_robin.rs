use thiserror::Error;
use tracing::debug;

use crate::context::{NodeContext, SystemParameters};
use crate::storage::{BlockCounter, StoreError};

/// Scheduling failures
#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("time {time} is before the first block at {anchor}")]
    BeforeAnchor { time: i64, anchor: i64 },

    /// A block already exists in the slot
    #[error("block already produced by node {node_position} in slot [{start}, {end}]")]
    DuplicateBlock {
        node_position: i64,
        start: i64,
        end: i64,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// One producer slot. Derived from the clock, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGenerationState {
    pub start: i64,
    pub duration: i64,
    pub node_position: i64,
}

/// Time-sliced round robin over the honor nodes, anchored at the first
/// block. Pure arithmetic apart from the duplicate-block lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTimeCalculator {
    anchor: i64,
    slot_duration: i64,
    nodes_count: i64,
}

impl BlockTimeCalculator {
    pub fn new(anchor: i64, generation_time_secs: u64, blocks_gap_secs: u64, nodes_count: u64) -> Self {
        Self {
            anchor,
            slot_duration: (generation_time_secs + blocks_gap_secs).max(1) as i64,
            // no registered nodes means the genesis producer alone
            nodes_count: nodes_count.max(1) as i64,
        }
    }

    pub fn from_params(params: &SystemParameters, nodes_count: u64) -> Self {
        Self::new(
            params.first_block_time,
            params.generation_time_secs,
            params.blocks_gap_secs,
            nodes_count,
        )
    }

    /// Built from the context's current parameters and honor-node list
    pub fn from_context(ctx: &NodeContext) -> Self {
        Self::from_params(&ctx.params(), ctx.active_node_count())
    }

    pub fn slot_duration(&self) -> i64 {
        self.slot_duration
    }

    pub fn nodes_count(&self) -> i64 {
        self.nodes_count
    }

    pub fn slot_index(&self, time: i64) -> Result<i64, ConsensusError> {
        if time < self.anchor {
            return Err(ConsensusError::BeforeAnchor {
                time,
                anchor: self.anchor,
            });
        }
        Ok((time - self.anchor) / self.slot_duration)
    }

    pub fn assigned_node(&self, time: i64) -> Result<i64, ConsensusError> {
        Ok(self.slot_index(time)? % self.nodes_count)
    }

    pub fn slot(&self, time: i64) -> Result<BlockGenerationState, ConsensusError> {
        let index = self.slot_index(time)?;
        Ok(BlockGenerationState {
            start: self.anchor + index * self.slot_duration,
            duration: self.slot_duration,
            node_position: index % self.nodes_count,
        })
    }

    /// The slot containing `time` with a one-second guard band at both ends
    pub fn slot_range(&self, time: i64) -> Result<(i64, i64), ConsensusError> {
        let slot = self.slot(time)?;
        Ok((slot.start + 1, slot.start + slot.duration - 1))
    }

    /// Whether `node_position` may produce a block at `now`.
    ///
    /// Errors with [`ConsensusError::DuplicateBlock`] when the node already
    /// has a block in this slot.
    pub fn time_to_generate(
        &self,
        now: i64,
        node_position: i64,
        counter: &dyn BlockCounter,
    ) -> Result<bool, ConsensusError> {
        self.check_slot(now, node_position, counter)
    }

    /// Same check as [`Self::time_to_generate`] for a historical block time
    pub fn validate_block(
        &self,
        node_position: i64,
        at: i64,
        counter: &dyn BlockCounter,
    ) -> Result<bool, ConsensusError> {
        self.check_slot(at, node_position, counter)
    }

    fn check_slot(
        &self,
        time: i64,
        node_position: i64,
        counter: &dyn BlockCounter,
    ) -> Result<bool, ConsensusError> {
        if self.assigned_node(time)? != node_position {
            return Ok(false);
        }

        let (start, end) = self.slot_range(time)?;
        if time < start || time > end {
            debug!(time, start, end, "inside slot guard band");
            return Ok(false);
        }

        if counter.count_blocks_in_window(start, end, node_position)? > 0 {
            return Err(ConsensusError::DuplicateBlock {
                node_position,
                start,
                end,
            });
        }
        Ok(true)
    }
}
