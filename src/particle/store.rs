//! The particle manager.
//!
//! Owns the base table and the two auxiliary slot tables exclusively. The
//! decomposition core borrows them under an implicit barrier; nothing else
//! may touch particles while a decomposition runs.
//!
//! Layout invariants maintained here and by the collector:
//! the gas slot table is dense and its length equals the length of the gas
//! prefix of the base table (`p[i]` is gas iff `i < n_gas()`); black-hole
//! slots are referenced through `pi` and may contain transient holes between
//! an exchange and the next collection.

use rayon::prelude::*;

use crate::constants::{NTYPES, TIMEBINS, TYPE_BH, TYPE_GAS};
use crate::peano;
use crate::DomainError;

use super::{BhSlot, GasSlot, Particle};

pub struct ParticleStore {
    pub(crate) p: Vec<Particle>,
    pub(crate) gas: Vec<GasSlot>,
    pub(crate) bh: Vec<BhSlot>,
    pub max_part: usize,
    pub max_part_bh: usize,
    pub timebin_count: [i64; TIMEBINS],
    pub timebin_count_gas: [i64; TIMEBINS],
}

impl ParticleStore {
    pub fn new(max_part: usize, max_part_bh: usize) -> ParticleStore {
        ParticleStore {
            p: Vec::with_capacity(max_part.min(1 << 20)),
            gas: Vec::new(),
            bh: Vec::new(),
            max_part,
            max_part_bh,
            timebin_count: [0; TIMEBINS],
            timebin_count_gas: [0; TIMEBINS],
        }
    }

    pub fn num_part(&self) -> usize {
        self.p.len()
    }

    pub fn n_gas(&self) -> usize {
        self.gas.len()
    }

    pub fn n_bh(&self) -> usize {
        self.bh.len()
    }

    pub fn particles(&self) -> &[Particle] {
        &self.p
    }

    pub fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.p
    }

    pub fn gas_slots(&self) -> &[GasSlot] {
        &self.gas
    }

    pub fn bh_slots(&self) -> &[BhSlot] {
        &self.bh
    }

    /// Appends a non-gas particle.
    pub fn push(&mut self, mut p: Particle) -> Result<usize, DomainError> {
        assert_ne!(p.ptype, TYPE_GAS, "gas entries go through push_gas");
        if self.p.len() >= self.max_part {
            return Err(DomainError::StoreFull {
                what: "particles",
                n: self.p.len() + 1,
                max: self.max_part,
            });
        }
        if p.ptype == TYPE_BH {
            if self.bh.len() >= self.max_part_bh {
                return Err(DomainError::StoreFull {
                    what: "black-hole slots",
                    n: self.bh.len() + 1,
                    max: self.max_part_bh,
                });
            }
            self.bh.push(BhSlot {
                id: p.id,
                bh_mass: p.mass,
                mdot: 0.0,
                reverse_link: -1,
            });
            p.pi = (self.bh.len() - 1) as i32;
        }
        self.p.push(p);
        self.timebin_count[p.timebin as usize] += 1;
        Ok(self.p.len() - 1)
    }

    /// Inserts a gas particle into the gas prefix, with its slot.
    pub fn push_gas(&mut self, mut p: Particle, slot: GasSlot) -> Result<usize, DomainError> {
        assert_eq!(p.ptype, TYPE_GAS);
        if self.p.len() >= self.max_part || self.gas.len() >= self.max_part {
            return Err(DomainError::StoreFull {
                what: "gas slots",
                n: self.gas.len() + 1,
                max: self.max_part,
            });
        }
        let at = self.gas.len();
        p.pi = at as i32;
        self.p.insert(at, p);
        self.gas.push(GasSlot { id: p.id, ..slot });
        self.timebin_count[p.timebin as usize] += 1;
        self.timebin_count_gas[p.timebin as usize] += 1;
        Ok(at)
    }

    /// Forks a zero-mass child at the parent's location.
    ///
    /// The parent's generation is incremented and stamped into the high
    /// 8 bits of the child identifier, so identifiers stay unique for up to
    /// 256 forks per original particle. The child's `pi` still points at the
    /// parent's slot; the caller adjusts mass, type and slot ownership.
    pub fn fork(&mut self, parent: usize) -> Result<usize, DomainError> {
        if self.p.len() >= self.max_part {
            return Err(DomainError::StoreFull {
                what: "particles",
                n: self.p.len() + 1,
                max: self.max_part,
            });
        }
        self.p[parent].generation = self.p[parent].generation.wrapping_add(1);
        let g = self.p[parent].generation as u64;

        let mut child = self.p[parent];
        child.id = (self.p[parent].id & 0x00ff_ffff_ffff_ffff) | (g << 56);
        child.mass = 0.0;
        // the child is appended to the tail regardless of the parent's type;
        // it is not a gas-prefix member until it gets a slot of its own
        self.p.push(child);
        self.timebin_count[child.timebin as usize] += 1;
        Ok(self.p.len() - 1)
    }

    /// Local per-type population.
    pub fn count_by_type(&self) -> [i64; NTYPES] {
        self.p
            .par_iter()
            .fold(
                || [0i64; NTYPES],
                |mut acc, p| {
                    acc[p.ptype as usize] += 1;
                    acc
                },
            )
            .reduce(
                || [0i64; NTYPES],
                |mut a, b| {
                    for (x, y) in a.iter_mut().zip(&b) {
                        *x += y;
                    }
                    a
                },
            )
    }

    /// Maps every position back into the canonical periodic box.
    pub fn wrap_positions(&mut self, box_size: f64) {
        self.p.par_iter_mut().for_each(|p| {
            for x in p.pos.iter_mut() {
                *x = x.rem_euclid(box_size);
            }
        });
    }

    /// Recomputes and caches the Peano-Hilbert key of every particle.
    pub fn cache_keys(&mut self, box_size: f64) {
        self.p.par_iter_mut().for_each(|p| {
            p.key = peano::position_key(&p.pos, box_size);
        });
    }

    /// Sorts the gas prefix and the tail by cached key.
    ///
    /// Gas slots are permuted alongside their base entries, keeping slot `i`
    /// attached to base entry `i`. Black-hole `pi` links point into the slot
    /// table, not the base table, so they are unaffected by the reorder.
    pub fn peano_order(&mut self) {
        let ngas = self.gas.len();
        if ngas > 0 {
            let mut order: Vec<u32> = (0..ngas as u32).collect();
            order.par_sort_unstable_by_key(|&i| self.p[i as usize].key);
            let prefix: Vec<Particle> = order.iter().map(|&i| self.p[i as usize]).collect();
            let slots: Vec<GasSlot> = order.iter().map(|&i| self.gas[i as usize]).collect();
            self.p[..ngas].copy_from_slice(&prefix);
            self.gas = slots;
            for (i, p) in self.p[..ngas].iter_mut().enumerate() {
                p.pi = i as i32;
            }
        }
        self.p[ngas..].par_sort_unstable_by_key(|p| p.key);
    }

    /// Recounts the per-timebin totals from scratch.
    pub fn rebuild_timebin_counts(&mut self) {
        self.timebin_count = [0; TIMEBINS];
        self.timebin_count_gas = [0; TIMEBINS];
        for p in &self.p {
            self.timebin_count[p.timebin as usize] += 1;
            if p.ptype == TYPE_GAS {
                self.timebin_count_gas[p.timebin as usize] += 1;
            }
        }
    }

    /// Verifies the base/slot cross-references.
    pub fn assert_slot_consistency(&self) -> Result<(), DomainError> {
        let ngas = self.gas.len();
        for (i, p) in self.p.iter().enumerate() {
            match p.ptype {
                TYPE_GAS => {
                    if i >= ngas {
                        return Err(DomainError::Corruption("gas entry outside the gas prefix"));
                    }
                    if self.gas[i].id != p.id {
                        return Err(DomainError::Corruption("gas slot identifier mismatch"));
                    }
                }
                TYPE_BH => {
                    let pi = p.pi as usize;
                    if p.pi < 0 || pi >= self.bh.len() {
                        return Err(DomainError::Corruption("black-hole slot index out of range"));
                    }
                    if self.bh[pi].id != p.id {
                        return Err(DomainError::Corruption("black-hole slot identifier mismatch"));
                    }
                }
                _ => {
                    if i < ngas {
                        return Err(DomainError::Corruption("non-gas entry inside the gas prefix"));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    fn gas(id: u64) -> (Particle, GasSlot) {
        let mut p = Particle::zeroed();
        p.id = id;
        p.mass = 1.0;
        p.ptype = TYPE_GAS;
        (p, GasSlot::zeroed())
    }

    fn dm(id: u64) -> Particle {
        let mut p = Particle::zeroed();
        p.id = id;
        p.mass = 1.0;
        p.ptype = crate::constants::TYPE_DM;
        p
    }

    #[test]
    fn gas_prefix_stays_dense_under_mixed_pushes() {
        let mut store = ParticleStore::new(100, 10);
        store.push(dm(10)).unwrap();
        let (p, s) = gas(1);
        store.push_gas(p, s).unwrap();
        let (p, s) = gas(2);
        store.push_gas(p, s).unwrap();
        assert_eq!(store.n_gas(), 2);
        assert!(store.particles()[..2].iter().all(|p| p.ptype == TYPE_GAS));
        store.assert_slot_consistency().unwrap();
    }

    #[test]
    fn fork_stamps_generation_into_high_bits() {
        let mut store = ParticleStore::new(100, 10);
        let (p, s) = gas(42);
        let parent = store.push_gas(p, s).unwrap();
        let child = store.fork(parent).unwrap();
        let cp = store.particles()[child];
        assert_eq!(cp.id, (42u64 & 0x00ff_ffff_ffff_ffff) | (1 << 56));
        assert_eq!(cp.mass, 0.0);
        assert_eq!(store.particles()[parent].generation, 1);
        // a second fork bumps the generation again
        let child2 = store.fork(parent).unwrap();
        assert_eq!(store.particles()[child2].id, (42u64 & 0x00ff_ffff_ffff_ffff) | (2 << 56));
    }

    #[test]
    fn fork_refuses_when_full() {
        let mut store = ParticleStore::new(2, 10);
        let (p, s) = gas(1);
        store.push_gas(p, s).unwrap();
        store.push(dm(2)).unwrap();
        assert!(matches!(
            store.fork(0),
            Err(DomainError::StoreFull { .. })
        ));
    }

    #[test]
    fn peano_order_sorts_prefix_and_tail_separately() {
        let mut store = ParticleStore::new(100, 10);
        for id in 0..4u64 {
            let (mut p, s) = gas(id);
            p.pos = [0.9 - 0.2 * id as f64, 0.5, 0.5];
            store.push_gas(p, s).unwrap();
        }
        for id in 4..8u64 {
            let mut p = dm(id);
            p.pos = [0.9 - 0.1 * (id - 4) as f64, 0.1, 0.8];
            store.push(p).unwrap();
        }
        store.cache_keys(1.0);
        store.peano_order();
        let keys: Vec<u64> = store.particles()[..4].iter().map(|p| p.key).collect();
        assert!(keys.windows(2).all(|w| w[0] <= w[1]));
        let keys: Vec<u64> = store.particles()[4..].iter().map(|p| p.key).collect();
        assert!(keys.windows(2).all(|w| w[0] <= w[1]));
        store.assert_slot_consistency().unwrap();
    }

    #[test]
    fn count_by_type_matches_contents() {
        let mut store = ParticleStore::new(100, 10);
        let (p, s) = gas(1);
        store.push_gas(p, s).unwrap();
        store.push(dm(2)).unwrap();
        store.push(dm(3)).unwrap();
        let counts = store.count_by_type();
        assert_eq!(counts[TYPE_GAS as usize], 1);
        assert_eq!(counts[crate::constants::TYPE_DM as usize], 2);
        assert_eq!(counts.iter().sum::<i64>(), 3);
    }
}
