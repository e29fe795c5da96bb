//! Block assembly strategies and the sealed-bid optimiser.
//!
//! A builder assembles a candidate block from its local mempool, then prices
//! it: expected utility of a candidate bid is estimated by Monte-Carlo
//! sampling opponents from the observed history of winning bids, and the
//! optimal bid search runs an ascent scan over the bid domain followed by a
//! lookahead-guided descent walk.

use std::collections::HashSet;
use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use pbs_data::entropy::SampleStream;
use pbs_data::types::{Block, SharedTx, Transaction};

/// Observed winning bids kept per builder.
pub const BID_HISTORY_CAP: usize = 100;

/// Accepted by the lookahead interface; not yet applied to future utility.
pub const DISCOUNT_FACTOR: f64 = 0.9;

/// Granularity of the bid-domain search.
pub const BID_STEP: f64 = 0.5;

/// How a builder fills its block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssemblyStrategy {
    /// Top-of-mempool by gas fee.
    GasGreedy,
    /// Interleaves self-authored sandwiches around high-MEV transactions.
    SandwichInterleave,
}

/// Per-builder auction state.
#[derive(Debug)]
pub struct BuilderState {
    pub strategy: AssemblyStrategy,
    /// Lookahead horizon of the bid optimiser.
    pub depth: u32,
    /// Monte-Carlo trials per utility estimate.
    pub num_simulations: u32,
    /// Lower edge of the bid search as a fraction of block value.
    pub min_bid_frac: f64,
    /// FIFO of recent winning bids; the empirical opponent distribution.
    pub bids: VecDeque<f64>,
    /// Block assembled this round, if any.
    pub curr_block: Option<Block>,
    pub curr_bid: f64,
    pub block_value: f64,
    /// Mempool snapshot taken when the current block was assembled.
    pub last_mempool: Vec<SharedTx>,
    /// Counter feeding sandwich filler ids.
    filler_counter: u32,
    rng: StdRng,
}

impl BuilderState {
    pub fn new(
        strategy: AssemblyStrategy,
        depth: u32,
        num_simulations: u32,
        min_bid_frac: f64,
        rng: StdRng,
    ) -> Self {
        Self {
            strategy,
            depth,
            num_simulations,
            min_bid_frac,
            bids: VecDeque::new(),
            curr_block: None,
            curr_bid: 0.0,
            block_value: 0.0,
            last_mempool: Vec::new(),
            filler_counter: 0,
            rng,
        }
    }

    /// Records an observed winning bid, evicting the oldest past capacity.
    pub fn update_bids(&mut self, bid: f64) {
        self.bids.push_back(bid);
        if self.bids.len() > BID_HISTORY_CAP {
            self.bids.pop_front();
        }
    }

    /// Assembles the current block from `mempool` and prices it.
    ///
    /// Stores the block (with the computed bid stamped on it) and a snapshot
    /// of the mempool it was built from.
    pub fn build_block(
        &mut self,
        builder_id: u32,
        mempool: &HashSet<SharedTx>,
        max_block_size: usize,
        stream: &SampleStream,
    ) {
        let mut block = match self.strategy {
            AssemblyStrategy::GasGreedy => assemble_gas_greedy(builder_id, mempool, max_block_size),
            AssemblyStrategy::SandwichInterleave => assemble_sandwich(
                builder_id,
                mempool,
                max_block_size,
                &mut self.filler_counter,
            ),
        };

        self.block_value = block.block_value;
        self.calculated_bid(stream);
        block.bid = self.curr_bid;
        self.curr_block = Some(block);
        self.last_mempool = mempool.iter().cloned().collect();
    }

    /// Prices the current block value against the bid history.
    ///
    /// Cold start (no history yet) draws uniformly from the allowed bid
    /// range; otherwise the two-phase optimal-bid search decides.
    pub fn calculated_bid(&mut self, stream: &SampleStream) {
        if self.block_value <= 0.0 {
            self.curr_bid = 0.0;
            return;
        }
        if self.bids.is_empty() {
            let lo = self.block_value * self.min_bid_frac;
            self.curr_bid = self.rng.gen_range(lo..=self.block_value);
        } else {
            self.curr_bid = self
                .find_optimal_bid(self.depth, DISCOUNT_FACTOR, BID_STEP, stream)
                .0;
        }
    }

    /// Mean utility of bidding `your_bid` over `num_simulations` trials.
    ///
    /// Each trial samples an opponent bid from `test_bids` through the shared
    /// sample stream (indices past the population are skipped) and pays
    /// `block_value - your_bid` on a win, nothing otherwise.
    pub fn expected_utility(
        &self,
        your_bid: f64,
        test_bids: &[f64],
        stream: &SampleStream,
    ) -> f64 {
        if test_bids.is_empty() || self.num_simulations == 0 {
            return 0.0;
        }

        let mut total = 0.0;
        for _ in 0..self.num_simulations {
            let Some(at) = stream.next_index(test_bids.len()) else {
                break;
            };
            let opponent = test_bids[at];
            if your_bid > opponent {
                total += self.block_value - your_bid;
            }
        }
        total / f64::from(self.num_simulations)
    }

    /// Utility of `your_bid` looking `depth` rounds ahead.
    ///
    /// Depth 0 is the single-shot estimate; deeper horizons add the optimum
    /// utility of the shallower search.
    pub fn expected_future_utility(
        &self,
        your_bid: f64,
        depth: u32,
        discount: f64,
        step: f64,
        test_bids: &[f64],
        stream: &SampleStream,
    ) -> f64 {
        if depth == 0 {
            return self.expected_utility(your_bid, test_bids, stream);
        }
        // TODO: multiply the recursive term by `discount` once the decay
        // semantics are settled; it is threaded but unapplied today.
        let (_, future_optimum) = self.find_optimal_bid(depth - 1, discount, step, stream);
        future_optimum + self.expected_utility(your_bid, test_bids, stream)
    }

    /// Two-phase search for the optimal bid over `[0, block_value]`.
    ///
    /// Ascent scans upward from `block_value * min_bid_frac` keeping the best
    /// single-shot utility; with lookahead, a descent walk from the ascent
    /// optimum keeps stepping down while the future-aware utility improves
    /// and stops at the first non-improvement. Returns `(bid, utility)`.
    pub fn find_optimal_bid(
        &self,
        depth: u32,
        discount: f64,
        step: f64,
        stream: &SampleStream,
    ) -> (f64, f64) {
        if self.block_value <= 0.0 || step <= 0.0 {
            return (0.0, 0.0);
        }

        let mut optimal_bid = 0.0;
        let mut max_utility = 0.0;

        // The candidate bid joins the opponent population for its own trial.
        let mut test_bids: Vec<f64> = self.bids.iter().copied().collect();
        test_bids.push(0.0);

        let mut bid = self.block_value * self.min_bid_frac;
        while bid <= self.block_value {
            if let Some(last) = test_bids.last_mut() {
                *last = bid;
            }
            let utility = self.expected_utility(bid, &test_bids, stream);
            if utility > max_utility {
                max_utility = utility;
                optimal_bid = bid;
            }
            bid += step;
        }

        if depth > 0 {
            let mut bid = optimal_bid;
            while bid >= 0.0 {
                if let Some(last) = test_bids.last_mut() {
                    *last = bid;
                }
                let utility =
                    self.expected_future_utility(bid, depth, discount, step, &test_bids, stream);
                if utility > max_utility {
                    max_utility = utility;
                    optimal_bid = bid;
                } else {
                    break;
                }
                bid -= step;
            }
        }

        (optimal_bid, max_utility)
    }
}

/// Gas-greedy assembly: highest-fee transactions first, value is the gas sum.
fn assemble_gas_greedy(
    builder_id: u32,
    mempool: &HashSet<SharedTx>,
    max_block_size: usize,
) -> Block {
    let mut sorted: Vec<SharedTx> = mempool.iter().cloned().collect();
    sorted.sort_by(|a, b| {
        b.gas
            .partial_cmp(&a.gas)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });

    let mut block = Block::new(builder_id);
    for tx in sorted.into_iter().take(max_block_size) {
        block.block_value += tx.gas;
        block.transactions.push(tx);
    }
    block
}

/// Mints a front/back filler pair; the two share a magnitude in the
/// builder's adversary id range, positive front and negative back.
fn filler_pair(builder_id: u32, counter: &mut u32) -> (SharedTx, SharedTx) {
    let magnitude = i64::from(builder_id) * 1000 + i64::from(*counter);
    *counter += 1;
    (
        SharedTx::new(Transaction::filler(magnitude)),
        SharedTx::new(Transaction::filler(-magnitude)),
    )
}

/// Sandwich-maximising assembly over two cursors.
///
/// A gas-descending cursor competes with an mev-descending cursor: at each
/// step the three best remaining gas fees are weighed against sandwiching the
/// best remaining MEV carrier. A placed sandwich contributes the victim's gas
/// and mev to block value and brackets the victim with self-authored fillers
/// (front directly before, back directly after). Fillers exist in the block
/// only; they never touch a mempool.
fn assemble_sandwich(
    builder_id: u32,
    mempool: &HashSet<SharedTx>,
    max_block_size: usize,
    filler_counter: &mut u32,
) -> Block {
    let mut gas_sorted: Vec<SharedTx> = mempool.iter().cloned().collect();
    gas_sorted.sort_by(|a, b| {
        b.gas
            .partial_cmp(&a.gas)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    let mut mev_sorted: Vec<SharedTx> = mempool.iter().cloned().collect();
    mev_sorted.sort_by(|a, b| {
        b.mev
            .partial_cmp(&a.mev)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });

    let mut block = Block::new(builder_id);
    let mut g = 0;
    let mut m = 0;

    while block.transactions.len() < max_block_size {
        let gas_done = g >= gas_sorted.len();
        let mev_done = m >= mev_sorted.len();
        if gas_done && mev_done {
            break;
        }

        if gas_done {
            // Only the mev cursor remains: sandwich what fits.
            let victim = &mev_sorted[m];
            let placed_at = block.transactions.iter().position(|t| t.same(victim));
            match placed_at {
                None if block.transactions.len() + 3 <= max_block_size => {
                    let (front, back) = filler_pair(builder_id, filler_counter);
                    block.block_value += victim.gas + victim.mev;
                    block.transactions.push(front);
                    block.transactions.push(victim.clone());
                    block.transactions.push(back);
                }
                Some(at) if block.transactions.len() + 2 <= max_block_size => {
                    let (front, back) = filler_pair(builder_id, filler_counter);
                    block.block_value += victim.mev;
                    block.transactions.insert(at + 1, back);
                    block.transactions.insert(at, front);
                }
                _ => break,
            }
            m += 1;
            continue;
        }

        if mev_done {
            // Only the gas cursor remains.
            let candidate = &gas_sorted[g];
            if !block.transactions.iter().any(|t| t.same(candidate)) {
                block.block_value += candidate.gas;
                block.transactions.push(candidate.clone());
            }
            g += 1;
            continue;
        }

        // Both cursors live: weigh three gas picks against one sandwich.
        let comp_gas: f64 = gas_sorted[g..(g + 3).min(gas_sorted.len())]
            .iter()
            .map(|tx| tx.gas)
            .sum();
        let victim = &mev_sorted[m];

        if comp_gas < victim.mev + victim.gas {
            let placed_at = block.transactions.iter().position(|t| t.same(victim));
            match placed_at {
                None if block.transactions.len() + 3 <= max_block_size => {
                    let (front, back) = filler_pair(builder_id, filler_counter);
                    block.block_value += victim.gas + victim.mev;
                    block.transactions.push(front);
                    block.transactions.push(victim.clone());
                    block.transactions.push(back);
                    m += 1;
                }
                Some(at) if block.transactions.len() + 2 <= max_block_size => {
                    let (front, back) = filler_pair(builder_id, filler_counter);
                    block.block_value += victim.mev;
                    block.transactions.insert(at + 1, back);
                    block.transactions.insert(at, front);
                    m += 1;
                }
                _ => {
                    let candidate = &gas_sorted[g];
                    if !block.transactions.iter().any(|t| t.same(candidate)) {
                        block.block_value += candidate.gas;
                        block.transactions.push(candidate.clone());
                    }
                    g += 1;
                }
            }
        } else {
            let candidate = &gas_sorted[g];
            if !block.transactions.iter().any(|t| t.same(candidate)) {
                block.block_value += candidate.gas;
                block.transactions.push(candidate.clone());
            }
            g += 1;
        }
    }

    block
}
