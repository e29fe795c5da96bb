//! Per-slot chain driver.
//!
//! Each slot injects fresh transactions, runs the auction for the PBS chain,
//! commits an independent random builder's block to the POS control chain,
//! then settles: losing builders learn the winning bid, included transactions
//! leave every mempool, and the finalised block decides which outstanding
//! sandwich attacks retire.

use eyre::{eyre, Result};
use rayon::prelude::*;
use tracing::{info, warn};

use pbs_data::entropy::{SampleStream, SimRng};
use pbs_data::types::{Block, SharedTx, Transaction};

use crate::auction::run_auction;
use crate::config::SimConfig;
use crate::network::Network;

/// First user transaction id; keeps user ids clear of the
/// `attacker_id * 1000` adversary id space.
pub const USER_ID_BASE: i64 = 1_000_000;

/// Which chains a run produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Pbs,
    Pos,
    Both,
}

impl Mode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "pbs" => Ok(Self::Pbs),
            "pos" => Ok(Self::Pos),
            "both" => Ok(Self::Both),
            other => Err(eyre!("unknown mode '{other}'; use 'pbs', 'pos', or 'both'")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pbs => "pbs",
            Self::Pos => "pos",
            Self::Both => "both",
        }
    }

    fn wants_pbs(&self) -> bool {
        matches!(self, Self::Pbs | Self::Both)
    }

    fn wants_pos(&self) -> bool {
        matches!(self, Self::Pos | Self::Both)
    }
}

/// Monotonic user-transaction source with the documented fee distribution:
/// gas uniform in [0, 100], mev zero for `1 - mev_fraction` of transactions
/// and uniform in [0, 100] otherwise.
pub struct TxGenerator {
    next_id: i64,
    mev_fraction: f64,
}

impl TxGenerator {
    pub fn new(mev_fraction: f64) -> Self {
        Self {
            next_id: USER_ID_BASE,
            mev_fraction,
        }
    }

    pub fn generate(&mut self, rng: &mut SimRng) -> Transaction {
        let id = self.next_id;
        self.next_id += 1;
        let gas = rng.gen_f64(0.0, 100.0);
        let mev = if rng.gen_f64(0.0, 1.0) < self.mev_fraction {
            rng.gen_f64(0.0, 100.0)
        } else {
            0.0
        };
        Transaction::new(id, gas, mev)
    }
}

/// The two block histories a run accumulates.
#[derive(Debug, Default)]
pub struct Chain {
    pub pbs_blocks: Vec<Block>,
    pub pos_blocks: Vec<Block>,
}

/// What one slot produced, for progress reporting.
#[derive(Debug)]
pub struct SlotOutcome {
    pub pbs: Option<Block>,
    pub pos: Option<Block>,
}

/// A fully wired simulation ready to advance slot by slot.
pub struct Simulation {
    pub network: Network,
    pub chain: Chain,
    cfg: SimConfig,
    rng: SimRng,
    stream: SampleStream,
    tx_gen: TxGenerator,
    slot: u64,
}

impl Simulation {
    pub fn new(cfg: SimConfig, stream: SampleStream) -> Result<Self> {
        let mut rng = SimRng::seed_from(cfg.seed);
        let mut network = cfg.build_network(&mut rng);
        network.assign_neighbours(&mut rng);
        let tx_gen = TxGenerator::new(cfg.mev_fraction);

        info!(
            nodes = network.len(),
            builders = network.builder_indices().len(),
            proposers = network.proposer_indices().len(),
            attackers = network.attacker_indices().len(),
            seed = cfg.seed,
            "simulation wired"
        );

        Ok(Self {
            network,
            chain: Chain::default(),
            cfg,
            rng,
            stream,
            tx_gen,
            slot: 0,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.cfg
    }

    pub fn slots_run(&self) -> u64 {
        self.slot
    }

    /// Advances the simulation by one slot.
    pub fn step(&mut self) -> Result<SlotOutcome> {
        self.slot += 1;

        for _ in 0..self.cfg.txs_per_slot {
            let tx = SharedTx::new(self.tx_gen.generate(&mut self.rng));
            self.network.add_transaction_to_nodes(tx, &mut self.rng);
        }

        match self.cfg.mode {
            Mode::Pos => {
                let pos = self.step_pos_only();
                Ok(SlotOutcome { pbs: None, pos })
            }
            _ => self.step_pbs(),
        }
    }

    /// Runs the whole configured chain.
    pub fn run(&mut self) -> Result<()> {
        for _ in 0..self.cfg.chain_length {
            self.step()?;
        }
        Ok(())
    }

    /// PBS slot (optionally with the paired POS control block).
    fn step_pbs(&mut self) -> Result<SlotOutcome> {
        let proposer_idxs = self.network.proposer_indices();
        let builder_idxs = self.network.builder_indices();
        if proposer_idxs.is_empty() || builder_idxs.is_empty() {
            warn!(
                slot = self.slot,
                proposers = proposer_idxs.len(),
                builders = builder_idxs.len(),
                "slot skipped: auction needs at least one proposer and one builder"
            );
            return Ok(SlotOutcome {
                pbs: None,
                pos: None,
            });
        }

        let proposer_idx = proposer_idxs[self.rng.gen_index(proposer_idxs.len())];
        let proposed = run_auction(
            &mut self.network,
            proposer_idx,
            self.cfg.max_block_size,
            &self.stream,
            &mut self.rng,
        )?;

        let Some(block) = proposed else {
            // Invariant violation inside the auction; the slot is dropped and
            // with no block to decide them, all outstanding attacks are
            // wiped so the next slot starts clean.
            self.network.clear_attacks();
            return Ok(SlotOutcome {
                pbs: None,
                pos: None,
            });
        };

        // The POS control reuses the blocks assembled this round: one builder
        // drawn uniformly commits its block, stamped with a random proposer.
        let pos = if self.cfg.mode.wants_pos() {
            self.commit_pos_block(&builder_idxs, &proposer_idxs)
        } else {
            None
        };

        // Losers learn the winning bid.
        for &idx in &builder_idxs {
            let node = self.network.node_mut(idx);
            let id = node.core.id;
            if let Some(builder) = node.builder.as_mut() {
                if id != block.builder_id {
                    builder.update_bids(block.bid);
                }
            }
        }

        // Finalisation: included transactions leave every mempool, and the
        // block decides attacks: executed or failed brackets retire, while
        // undecided ones stay live for a later slot.
        for tx in &block.transactions {
            self.network.clear_mempools(tx);
        }
        self.network.remove_failed_attacks(&block);

        let pbs = if self.cfg.mode.wants_pbs() {
            self.chain.pbs_blocks.push(block.clone());
            Some(block)
        } else {
            None
        };
        Ok(SlotOutcome { pbs, pos })
    }

    /// Pure POS slot: no auction, every builder assembles after gossip and a
    /// random one commits.
    fn step_pos_only(&mut self) -> Option<Block> {
        let builder_idxs = self.network.builder_indices();
        if builder_idxs.is_empty() {
            warn!(slot = self.slot, "slot skipped: no builders");
            return None;
        }

        self.network.propagate_transactions();
        let max_block_size = self.cfg.max_block_size;
        let stream = &self.stream;
        self.network.nodes_mut().par_iter_mut().for_each(|node| {
            if let Some(builder) = node.builder.as_mut() {
                builder.build_block(node.core.id, &node.core.mempool, max_block_size, stream);
            }
        });

        let proposer_idxs = self.network.proposer_indices();
        let block = self.commit_pos_block(&builder_idxs, &proposer_idxs)?;

        for tx in &block.transactions {
            self.network.clear_mempools(tx);
        }
        self.network.clear_attacks();

        Some(block)
    }

    /// Clones a uniformly-random builder's current block onto the POS chain,
    /// overlaying a uniformly-random proposer id (the builder's own id when
    /// the network has no proposers).
    fn commit_pos_block(
        &mut self,
        builder_idxs: &[usize],
        proposer_idxs: &[usize],
    ) -> Option<Block> {
        let chosen = builder_idxs[self.rng.gen_index(builder_idxs.len())];
        let node = self.network.node(chosen);
        let Some(curr_block) = node
            .builder
            .as_ref()
            .and_then(|builder| builder.curr_block.as_ref())
        else {
            warn!(builder = node.core.id, "POS builder has no current block");
            return None;
        };

        let mut block = curr_block.clone();
        block.proposer_id = if proposer_idxs.is_empty() {
            node.core.id
        } else {
            let at = proposer_idxs[self.rng.gen_index(proposer_idxs.len())];
            self.network.node(at).core.id
        };

        self.chain.pos_blocks.push(block.clone());
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeRecipe, SimConfig};

    fn small_config(mode: Mode) -> SimConfig {
        SimConfig {
            chain_length: 5,
            txs_per_slot: 50,
            mev_fraction: 0.5,
            max_block_size: 10,
            seed: 42,
            connections: 3,
            characteristic: 1.0,
            depth: 0,
            num_simulations: 20,
            min_bid_frac: 0.0,
            mev_threshold: 3.0,
            mode,
            recipe: NodeRecipe {
                builders: 3,
                attacker_builders: 0,
                attackers: 0,
                proposers: 1,
                proposer_builders: 0,
                proposer_attacker_builders: 0,
                plain_nodes: 2,
            },
        }
    }

    fn stream() -> SampleStream {
        SampleStream::synthetic(31, 4096, 100.0)
    }

    #[test]
    fn tx_generator_ids_are_monotonic_from_base() {
        let mut rng = SimRng::seed_from(1);
        let mut gen = TxGenerator::new(0.5);
        let a = gen.generate(&mut rng);
        let b = gen.generate(&mut rng);
        assert_eq!(a.id, USER_ID_BASE);
        assert_eq!(b.id, USER_ID_BASE + 1);
        assert!((0.0..100.0).contains(&a.gas));
    }

    #[test]
    fn tx_generator_respects_mev_fraction_extremes() {
        let mut rng = SimRng::seed_from(2);
        let mut none = TxGenerator::new(0.0);
        let mut all = TxGenerator::new(1.0);

        for _ in 0..100 {
            assert_eq!(none.generate(&mut rng).mev, 0.0);
            assert!(all.generate(&mut rng).mev > 0.0);
        }
    }

    #[test]
    fn mode_parses_known_values() {
        assert_eq!(Mode::parse("pbs").unwrap(), Mode::Pbs);
        assert_eq!(Mode::parse("POS").unwrap(), Mode::Pos);
        assert_eq!(Mode::parse("Both").unwrap(), Mode::Both);
        assert!(Mode::parse("fork-choice").is_err());
    }

    #[test]
    fn both_mode_grows_both_chains_in_lockstep() {
        let mut sim = Simulation::new(small_config(Mode::Both), stream()).expect("sim");
        sim.run().expect("chain runs");

        assert_eq!(sim.chain.pbs_blocks.len(), 5);
        assert_eq!(sim.chain.pos_blocks.len(), 5);
    }

    #[test]
    fn included_transactions_leave_every_mempool() {
        let mut sim = Simulation::new(small_config(Mode::Both), stream()).expect("sim");
        let outcome = sim.step().expect("slot advances");

        let block = outcome.pbs.expect("pbs block");
        for tx in &block.transactions {
            for node in sim.network.nodes() {
                assert!(
                    !node.core.mempool.contains(tx),
                    "included transaction {} still in a mempool",
                    tx.id
                );
            }
        }
    }

    #[test]
    fn losing_builders_learn_the_winning_bid() {
        let mut sim = Simulation::new(small_config(Mode::Both), stream()).expect("sim");
        let outcome = sim.step().expect("slot advances");
        let block = outcome.pbs.expect("pbs block");

        for idx in sim.network.builder_indices() {
            let node = sim.network.node(idx);
            let builder = node.builder.as_ref().expect("builder");
            if node.core.id == block.builder_id {
                assert!(builder.bids.is_empty(), "the winner does not record its own bid");
            } else {
                assert_eq!(builder.bids.back().copied(), Some(block.bid));
            }
        }
    }

    #[test]
    fn pos_mode_runs_without_proposers() {
        let mut cfg = small_config(Mode::Pos);
        cfg.recipe.proposers = 0;
        let mut sim = Simulation::new(cfg, stream()).expect("sim");
        sim.run().expect("chain runs");

        assert_eq!(sim.chain.pos_blocks.len(), 5);
        assert!(sim.chain.pbs_blocks.is_empty());
        // Without proposers the committing builder proposes to itself.
        for block in &sim.chain.pos_blocks {
            assert_eq!(block.proposer_id, block.builder_id);
        }
    }

    #[test]
    fn slot_without_builders_is_skipped() {
        let mut cfg = small_config(Mode::Both);
        cfg.recipe.builders = 0;
        cfg.recipe.proposers = 0;
        cfg.recipe.plain_nodes = 3;
        let mut sim = Simulation::new(cfg, stream()).expect("sim");
        sim.run().expect("chain runs");

        assert!(sim.chain.pbs_blocks.is_empty());
        assert!(sim.chain.pos_blocks.is_empty());
    }

    #[test]
    fn pbs_mode_does_not_touch_pos_chain() {
        let mut sim = Simulation::new(small_config(Mode::Pbs), stream()).expect("sim");
        sim.run().expect("chain runs");

        assert_eq!(sim.chain.pbs_blocks.len(), 5);
        assert!(sim.chain.pos_blocks.is_empty());
    }
}
