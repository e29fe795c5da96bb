//! Sandwich-attack adversary.
//!
//! An attacker watches the mempools of its builder neighbours for
//! transactions whose MEV dwarfs their gas fee, then brackets each find with
//! a front-run priced just above the victim and a back-run priced just below,
//! planted in that neighbour's mempool only. The three per-attack sequences
//! stay co-indexed. An attack stays pending across slots until a finalised
//! block decides it: execution or failure both retire the attack and scrub
//! its leftovers, while undecided brackets stay live for a later block.

use tracing::{debug, error};

use pbs_data::types::{Block, SharedTx, Transaction};

use crate::network::Network;

/// Default MEV-to-gas ratio a transaction must clear to look worth attacking.
pub const DEFAULT_MEV_THRESHOLD: f64 = 3.0;

/// Per-attacker adversary state. Position `i` of the three sequences
/// describes one sandwich attempt.
#[derive(Debug)]
pub struct AttackerState {
    pub targets: Vec<SharedTx>,
    pub fronts: Vec<SharedTx>,
    pub backs: Vec<SharedTx>,
    pub attack_counter: u32,
    /// A victim qualifies when `mev > mev_threshold * gas`.
    pub mev_threshold: f64,
}

impl AttackerState {
    pub fn new(mev_threshold: f64) -> Self {
        Self {
            targets: Vec::new(),
            fronts: Vec::new(),
            backs: Vec::new(),
            attack_counter: 0,
            mev_threshold,
        }
    }

    fn is_targeted(&self, tx: &SharedTx) -> bool {
        self.targets.iter().any(|t| t.same(tx))
    }

    fn sequences_synced(&self) -> bool {
        self.targets.len() == self.fronts.len() && self.targets.len() == self.backs.len()
    }
}

impl Network {
    /// Every attacker scans its builder neighbours and plants sandwich pairs.
    pub fn run_attacks(&mut self) {
        for idx in self.attacker_indices() {
            self.attack_from(idx);
        }
    }

    /// One attacker's scan. Candidates are walked in id order so the attack
    /// counter assignment does not depend on mempool iteration order.
    fn attack_from(&mut self, attacker_idx: usize) {
        let Some(mut state) = self.node_mut(attacker_idx).attacker.take() else {
            return;
        };
        let attacker_id = self.node(attacker_idx).core.id;

        for neighbour_idx in self.neighbours(attacker_idx) {
            if self.node(neighbour_idx).builder.is_none() {
                continue;
            }

            let mut victims: Vec<SharedTx> = self
                .node(neighbour_idx)
                .core
                .mempool
                .iter()
                .filter(|tx| tx.mev > state.mev_threshold * tx.gas)
                .filter(|tx| !state.is_targeted(tx))
                .cloned()
                .collect();
            victims.sort_by_key(|tx| tx.id);

            for victim in victims {
                let magnitude = i64::from(attacker_id) * 1000 + i64::from(state.attack_counter);
                state.attack_counter += 1;

                let front = SharedTx::new(Transaction::new(magnitude, victim.gas + 0.01, 0.0));
                let back = SharedTx::new(Transaction::new(
                    -magnitude,
                    (victim.gas - 0.01).max(0.0),
                    0.0,
                ));

                let mempool = &mut self.node_mut(neighbour_idx).core.mempool;
                mempool.insert(front.clone());
                mempool.insert(back.clone());

                debug!(
                    attacker = attacker_id,
                    victim = victim.id,
                    front = front.id,
                    "planted sandwich pair"
                );

                state.targets.push(victim);
                state.fronts.push(front);
                state.backs.push(back);
            }
        }

        self.node_mut(attacker_idx).attacker = Some(state);
    }

    /// Full purge: every authored front/back leaves all mempools and the
    /// attack sequences reset. Used when a slot aborts without a finalised
    /// block to decide the outstanding attacks, and by the pure-POS runner.
    pub fn clear_attacks(&mut self) {
        for idx in self.attacker_indices() {
            let Some(mut state) = self.node_mut(idx).attacker.take() else {
                continue;
            };

            if !state.targets.is_empty() {
                let pairs: Vec<(SharedTx, SharedTx)> = state
                    .fronts
                    .iter()
                    .cloned()
                    .zip(state.backs.iter().cloned())
                    .collect();
                for (front, back) in pairs {
                    self.clear_mempools(&front);
                    self.clear_mempools(&back);
                }
                state.targets.clear();
                state.fronts.clear();
                state.backs.clear();
            }

            self.node_mut(idx).attacker = Some(state);
        }
    }

    /// Retires every attack the finalised `block` decided and scrubs its
    /// leftovers from all mempools.
    ///
    /// A victim included in the block means the bracket failed (the pair was
    /// not adjacent around it), so the corresponding front and back are
    /// chaff to clear. Likewise a front or back published without its pair
    /// leaves the unpublished half to clear. Either way the attack is
    /// finished and drops out of the co-indexed sequences; attacks the block
    /// did not touch stay pending for a later slot.
    pub fn remove_failed_attacks(&mut self, block: &Block) {
        for idx in self.attacker_indices() {
            let Some(mut state) = self.node_mut(idx).attacker.take() else {
                continue;
            };

            if !state.sequences_synced() {
                error!(
                    attacker = self.node(idx).core.id,
                    targets = state.targets.len(),
                    fronts = state.fronts.len(),
                    backs = state.backs.len(),
                    "attack sequences desynced; dropping all outstanding attacks"
                );
                self.node_mut(idx).attacker = Some(AttackerState::new(state.mev_threshold));
                continue;
            }

            let mut retired = Vec::new();
            let mut i = 0;
            while i < state.targets.len() {
                let victim_published = block
                    .transactions
                    .iter()
                    .any(|tx| tx.same(&state.targets[i]));
                let front_published = block.transactions.iter().any(|tx| tx.same(&state.fronts[i]));
                let back_published = block.transactions.iter().any(|tx| tx.same(&state.backs[i]));

                if victim_published || front_published || back_published {
                    state.targets.remove(i);
                    let front = state.fronts.remove(i);
                    let back = state.backs.remove(i);
                    retired.push((front, back));
                } else {
                    i += 1;
                }
            }

            for (front, back) in &retired {
                self.clear_mempools(front);
                self.clear_mempools(back);
            }

            self.node_mut(idx).attacker = Some(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{AssemblyStrategy, BuilderState};
    use pbs_data::entropy::SimRng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn builder_state() -> BuilderState {
        BuilderState::new(
            AssemblyStrategy::GasGreedy,
            0,
            10,
            0.0,
            StdRng::seed_from_u64(1),
        )
    }

    /// Attacker 7 wired to builder 1 and plain node 2.
    fn wired_network() -> Network {
        let mut network = Network::new(5);
        let b = network.add_builder(1, 2, 1.0, builder_state());
        let a = network.add_attacker(7, 2, 1.0, AttackerState::new(DEFAULT_MEV_THRESHOLD));
        let p = network.add_node(2, 2, 1.0);
        let mut rng = SimRng::seed_from(6);
        network.assign_neighbours(&mut rng);
        assert!(network.neighbours(a).contains(&b));
        assert!(network.neighbours(a).contains(&p));
        network
    }

    fn plant(network: &mut Network, node: usize, tx: Transaction) -> SharedTx {
        let tx = SharedTx::new(tx);
        network.node_mut(node).core.mempool.insert(tx.clone());
        tx
    }

    #[test]
    fn attack_brackets_qualifying_transactions() {
        let mut network = wired_network();
        let victim = plant(&mut network, 0, Transaction::new(100, 10.0, 50.0));
        // Below threshold: mev 20 <= 3 * gas 10.
        plant(&mut network, 0, Transaction::new(101, 10.0, 20.0));

        network.run_attacks();

        let state = network.node(1).attacker.as_ref().expect("attacker state");
        assert_eq!(state.targets.len(), 1);
        assert!(state.targets[0].same(&victim));
        assert_eq!(state.fronts[0].id, 7000);
        assert_eq!(state.backs[0].id, -7000);
        assert!((state.fronts[0].gas - 10.01).abs() < 1e-9);
        assert!((state.backs[0].gas - 9.99).abs() < 1e-9);

        // Pair landed in the builder's mempool only.
        let builder_pool = &network.node(0).core.mempool;
        assert!(builder_pool.contains(&state.fronts[0]));
        assert!(builder_pool.contains(&state.backs[0]));
        assert!(network.node(2).core.mempool.is_empty());
    }

    #[test]
    fn attack_skips_non_builder_neighbours() {
        let mut network = wired_network();
        plant(&mut network, 2, Transaction::new(200, 1.0, 90.0));

        network.run_attacks();

        let state = network.node(1).attacker.as_ref().expect("attacker state");
        assert!(state.targets.is_empty(), "plain nodes are not scanned");
        assert_eq!(network.node(2).core.mempool.len(), 1);
    }

    #[test]
    fn attack_does_not_double_target() {
        let mut network = wired_network();
        plant(&mut network, 0, Transaction::new(300, 1.0, 50.0));

        network.run_attacks();
        network.run_attacks();

        let state = network.node(1).attacker.as_ref().expect("attacker state");
        assert_eq!(state.targets.len(), 1, "a victim is attacked once");
        assert_eq!(state.attack_counter, 1);
    }

    #[test]
    fn sequences_stay_co_indexed() {
        let mut network = wired_network();
        for i in 0..4 {
            plant(
                &mut network,
                0,
                Transaction::new(400 + i, 1.0, 40.0 + f64::from(i as u32)),
            );
        }

        network.run_attacks();

        let state = network.node(1).attacker.as_ref().expect("attacker state");
        assert_eq!(state.targets.len(), 4);
        assert_eq!(state.fronts.len(), 4);
        assert_eq!(state.backs.len(), 4);
        for i in 0..4 {
            assert_eq!(state.fronts[i].id, -state.backs[i].id);
        }
    }

    #[test]
    fn clear_attacks_scrubs_pairs_everywhere() {
        let mut network = wired_network();
        plant(&mut network, 0, Transaction::new(500, 2.0, 80.0));
        network.run_attacks();

        let (front, back) = {
            let state = network.node(1).attacker.as_ref().expect("attacker state");
            (state.fronts[0].clone(), state.backs[0].clone())
        };
        // Simulate gossip having spread the pair.
        network.node_mut(2).core.mempool.insert(front.clone());
        network.node_mut(2).core.mempool.insert(back.clone());

        network.clear_attacks();

        for idx in 0..network.len() {
            let pool = &network.node(idx).core.mempool;
            assert!(!pool.contains(&front));
            assert!(!pool.contains(&back));
        }
        let state = network.node(1).attacker.as_ref().expect("attacker state");
        assert!(state.targets.is_empty());
        assert!(state.fronts.is_empty());
        assert!(state.backs.is_empty());
    }

    #[test]
    fn failed_attack_is_scrubbed_when_victim_publishes_alone() {
        let mut network = wired_network();
        let victim = plant(&mut network, 0, Transaction::new(600, 2.0, 70.0));
        network.run_attacks();

        let front = network.node(1).attacker.as_ref().unwrap().fronts[0].clone();
        let back = network.node(1).attacker.as_ref().unwrap().backs[0].clone();

        // The proposed block carries the victim without its bracket.
        let mut block = Block::new(1);
        block.transactions.push(victim);

        network.remove_failed_attacks(&block);

        let pool = &network.node(0).core.mempool;
        assert!(!pool.contains(&front), "front scrubbed after failed bracket");
        assert!(!pool.contains(&back), "back scrubbed after failed bracket");

        let state = network.node(1).attacker.as_ref().expect("attacker state");
        assert!(state.targets.is_empty(), "decided attacks are retired");
        assert!(state.fronts.is_empty());
        assert!(state.backs.is_empty());
    }

    #[test]
    fn half_published_pair_is_scrubbed() {
        let mut network = wired_network();
        plant(&mut network, 0, Transaction::new(700, 2.0, 60.0));
        network.run_attacks();

        let front = network.node(1).attacker.as_ref().unwrap().fronts[0].clone();
        let back = network.node(1).attacker.as_ref().unwrap().backs[0].clone();

        // Only the front made it into the block.
        let mut block = Block::new(1);
        block.transactions.push(front.clone());

        network.remove_failed_attacks(&block);

        assert!(!network.node(0).core.mempool.contains(&back));
        let state = network.node(1).attacker.as_ref().expect("attacker state");
        assert!(state.targets.is_empty(), "a half-published pair is decided");
    }

    #[test]
    fn executed_sandwich_is_retired() {
        let mut network = wired_network();
        let victim = plant(&mut network, 0, Transaction::new(750, 2.0, 65.0));
        let pending = plant(&mut network, 0, Transaction::new(751, 1.0, 95.0));
        network.run_attacks();

        // Victim 750 executes with its full bracket; 751 stays undecided.
        let state = network.node(1).attacker.as_ref().expect("attacker state");
        let at = state
            .targets
            .iter()
            .position(|t| t.same(&victim))
            .expect("victim targeted");
        let mut block = Block::new(1);
        block.transactions.push(state.fronts[at].clone());
        block.transactions.push(victim);
        block.transactions.push(state.backs[at].clone());

        network.remove_failed_attacks(&block);

        let state = network.node(1).attacker.as_ref().expect("attacker state");
        assert_eq!(state.targets.len(), 1, "only the executed attack retires");
        assert!(state.targets[0].same(&pending));
        assert_eq!(state.fronts.len(), 1);
        assert_eq!(state.backs.len(), 1);
    }

    #[test]
    fn untouched_attacks_survive_failed_attack_pass() {
        let mut network = wired_network();
        plant(&mut network, 0, Transaction::new(800, 2.0, 90.0));
        network.run_attacks();

        let front = network.node(1).attacker.as_ref().unwrap().fronts[0].clone();

        // Block contains neither victim nor pair.
        let block = Block::new(1);
        network.remove_failed_attacks(&block);

        assert!(
            network.node(0).core.mempool.contains(&front),
            "pending attack is left in place for the next slot"
        );
        let state = network.node(1).attacker.as_ref().expect("attacker state");
        assert_eq!(state.targets.len(), 1, "undecided attacks stay pending");
    }
}
