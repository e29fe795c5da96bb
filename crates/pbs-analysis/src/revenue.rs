//! Revenue-split foundations for block-level analysis.
//!
//! Computes who earned what per block: the proposer collects the winning
//! bid, the builder keeps the difference, and a self-dealt block pays its
//! proposer-builder in full. Aggregates over a run feed the reports.

use serde::Serialize;

use pbs_data::store::StoredBlock;
use pbs_data::types::Block;

/// Block-level reward record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BlockReward {
    /// 1-based position in its chain.
    pub block_number: u64,
    pub proposer_id: u32,
    pub builder_id: u32,
    pub bid: f64,
    pub block_value: f64,
    /// What the builder keeps.
    pub reward: f64,
}

/// The builder's take from a block: value minus bid, or the full value when
/// builder and proposer are the same actor.
pub fn reward_of(block_value: f64, bid: f64, builder_id: u32, proposer_id: u32) -> f64 {
    if builder_id == proposer_id {
        block_value
    } else {
        block_value - bid
    }
}

/// Reward record for one finalised block.
pub fn block_reward(block_number: u64, block: &Block) -> BlockReward {
    BlockReward {
        block_number,
        proposer_id: block.proposer_id,
        builder_id: block.builder_id,
        bid: block.bid,
        block_value: block.block_value,
        reward: reward_of(block.block_value, block.bid, block.builder_id, block.proposer_id),
    }
}

impl From<&StoredBlock> for BlockReward {
    fn from(row: &StoredBlock) -> Self {
        Self {
            block_number: row.block_number,
            proposer_id: row.proposer_id,
            builder_id: row.builder_id,
            bid: row.bid,
            block_value: row.block_value,
            reward: row.reward,
        }
    }
}

/// Aggregated statistics over a block range.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RangeStats {
    /// Number of block records aggregated.
    pub block_count: usize,
    /// Sum of winning bids; the proposers' gas-market revenue.
    pub total_bid: f64,
    /// Sum of block values.
    pub total_block_value: f64,
    /// Sum of builder rewards.
    pub total_builder_reward: f64,
    /// Sum of what proposers collected (the bid, or the full value on a
    /// self-dealt block).
    pub total_proposer_revenue: f64,
    /// Blocks where builder and proposer were the same actor.
    pub self_dealt_blocks: usize,
    pub mean_bid: f64,
    pub mean_block_value: f64,
}

/// Aggregates summary statistics across block-level reward records.
pub fn compute_range_stats(records: &[BlockReward]) -> RangeStats {
    let block_count = records.len();
    let total_bid = records.iter().map(|record| record.bid).sum::<f64>();
    let total_block_value = records
        .iter()
        .map(|record| record.block_value)
        .sum::<f64>();
    let total_builder_reward = records.iter().map(|record| record.reward).sum::<f64>();
    let total_proposer_revenue = records
        .iter()
        .map(|record| {
            if record.builder_id == record.proposer_id {
                record.block_value
            } else {
                record.bid
            }
        })
        .sum::<f64>();
    let self_dealt_blocks = records
        .iter()
        .filter(|record| record.builder_id == record.proposer_id)
        .count();

    let (mean_bid, mean_block_value) = if block_count == 0 {
        (0.0, 0.0)
    } else {
        (
            total_bid / block_count as f64,
            total_block_value / block_count as f64,
        )
    };

    RangeStats {
        block_count,
        total_bid,
        total_block_value,
        total_builder_reward,
        total_proposer_revenue,
        self_dealt_blocks,
        mean_bid,
        mean_block_value,
    }
}

/// Counts executed sandwiches in a block: positions where a positive-id
/// front filler and its negated twin sit directly around a victim.
pub fn sandwich_triples(block: &Block) -> usize {
    let txs = &block.transactions;
    if txs.len() < 3 {
        return 0;
    }
    (1..txs.len() - 1)
        .filter(|&at| txs[at - 1].id > 0 && txs[at + 1].id == -txs[at - 1].id)
        .count()
}

/// How many of the given blocks carry at least one executed sandwich.
pub fn count_sandwich_blocks(blocks: &[Block]) -> usize {
    blocks
        .iter()
        .filter(|block| sandwich_triples(block) > 0)
        .count()
}
