//! Garbage collection over the particle tables.
//!
//! Three passes, in order: reclaim gas slots whose base entry changed type,
//! eliminate mass-zero entries, compact the black-hole slot table. Each pass
//! reports whether it reordered the base table, which invalidates any cached
//! force tree; the flags are or-reduced so every rank agrees.

use crate::comm::Communicator;
use crate::constants::{TYPE_BH, TYPE_GAS};
use crate::DomainError;

use super::ParticleStore;

/// Runs all three passes and returns the collective tree-invalid flag.
pub fn collect<C: Communicator>(
    comm: &C,
    store: &mut ParticleStore,
) -> Result<bool, DomainError> {
    let mut invalid = reclaim_gas_slots(store);
    verify(store)?;
    invalid |= eliminate_mass_zero(store);
    verify(store)?;
    compact_bh_slots(store)?;
    verify(store)?;
    Ok(comm.all_reduce_or(invalid))
}

/// Scans the gas prefix; entries whose type is no longer gas are swapped to
/// the prefix end (together with their slot) and the prefix shrinks.
pub fn reclaim_gas_slots(store: &mut ParticleStore) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i < store.gas.len() {
        if store.p[i].ptype != TYPE_GAS {
            let last = store.gas.len() - 1;
            store.p.swap(i, last);
            store.gas.swap(i, last);
            store.gas.truncate(last);
            changed = true;
            // the swapped-in entry at i still needs a look
        } else {
            store.p[i].pi = i as i32;
            i += 1;
        }
    }
    changed
}

/// Removes every entry with zero mass by end-swap, keeping the gas prefix
/// dense. Timebin counters are decremented as entries disappear.
pub fn eliminate_mass_zero(store: &mut ParticleStore) -> bool {
    let mut changed = false;
    let mut n = 0;
    while n < store.p.len() {
        if store.p[n].mass != 0.0 {
            n += 1;
            continue;
        }
        let bin = store.p[n].timebin as usize;
        store.timebin_count[bin] -= 1;

        // a freshly forked child may carry the gas type without owning a
        // slot yet; only prefix members have one
        if store.p[n].ptype == TYPE_GAS && n < store.gas.len() {
            store.timebin_count_gas[bin] -= 1;
            let glast = store.gas.len() - 1;
            let plast = store.p.len() - 1;
            let prefix_end = store.p[glast];
            let tail_end = store.p[plast];
            let slot_end = store.gas[glast];
            store.p[n] = prefix_end;
            store.gas[n] = slot_end;
            store.p[glast] = tail_end;
            store.p.truncate(plast);
            store.gas.truncate(glast);
            if n < store.gas.len() {
                store.p[n].pi = n as i32;
            }
        } else {
            let plast = store.p.len() - 1;
            let tail_end = store.p[plast];
            store.p[n] = tail_end;
            store.p.truncate(plast);
        }
        changed = true;
        // the swapped-in entry at n still needs a look
    }
    changed
}

/// Rebuilds the black-hole slot table without holes.
///
/// Every slot gets `reverse_link = -1`; live base entries write their index
/// into their slot; slots sort so linked ones come first in base order; the
/// table shrinks to the linked region and `pi` links are rewritten.
/// Reordering slots never touches the base table, so this pass cannot
/// invalidate the force tree.
pub fn compact_bh_slots(store: &mut ParticleStore) -> Result<(), DomainError> {
    if store.bh.is_empty() {
        return Ok(());
    }

    for slot in store.bh.iter_mut() {
        slot.reverse_link = -1;
    }

    for (i, p) in store.p.iter().enumerate() {
        if p.ptype != TYPE_BH {
            continue;
        }
        let pi = p.pi as usize;
        if p.pi < 0 || pi >= store.bh.len() {
            return Err(DomainError::Corruption("black-hole slot index out of range"));
        }
        if store.bh[pi].id != p.id {
            return Err(DomainError::Corruption("black-hole slot identifier mismatch"));
        }
        store.bh[pi].reverse_link = i as i64;
    }

    // unlinked slots last, linked ones ordered by base position
    store
        .bh
        .sort_by_key(|s| (s.reverse_link < 0, s.reverse_link));
    while store.bh.last().map_or(false, |s| s.reverse_link < 0) {
        store.bh.pop();
    }

    for (j, slot) in store.bh.iter().enumerate() {
        store.p[slot.reverse_link as usize].pi = j as i32;
    }
    for slot in store.bh.iter_mut() {
        slot.reverse_link = -1;
    }

    let live = store.p.iter().filter(|p| p.ptype == TYPE_BH).count();
    if live != store.bh.len() {
        return Err(DomainError::Corruption("black-hole slot count mismatch"));
    }
    Ok(())
}

fn verify(store: &ParticleStore) -> Result<(), DomainError> {
    store.assert_slot_consistency()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;
    use crate::constants::{TYPE_DM, TYPE_STAR};
    use crate::particle::{GasSlot, Particle};
    use bytemuck::Zeroable;

    fn particle(id: u64, ptype: u8, mass: f64) -> Particle {
        let mut p = Particle::zeroed();
        p.id = id;
        p.ptype = ptype;
        p.mass = mass;
        p
    }

    fn store_with(gas: &[u64], dm: &[u64], bh: &[u64]) -> ParticleStore {
        let mut store = ParticleStore::new(1000, 100);
        for &id in gas {
            store
                .push_gas(particle(id, TYPE_GAS, 1.0), GasSlot::zeroed())
                .unwrap();
        }
        for &id in dm {
            store.push(particle(id, TYPE_DM, 1.0)).unwrap();
        }
        for &id in bh {
            store.push(particle(id, TYPE_BH, 1.0)).unwrap();
        }
        store
    }

    #[test]
    fn converted_gas_leaves_the_prefix() {
        let mut store = store_with(&[1, 2, 3], &[10], &[]);
        // particle 2 became a star
        store.p[1].ptype = TYPE_STAR;
        let changed = reclaim_gas_slots(&mut store);
        assert!(changed);
        assert_eq!(store.n_gas(), 2);
        assert!(store.particles()[..2].iter().all(|p| p.ptype == TYPE_GAS));
        assert!(store.particles()[2..].iter().all(|p| p.ptype != TYPE_GAS));
        store.assert_slot_consistency().unwrap();
    }

    #[test]
    fn mass_zero_entries_disappear() {
        let mut store = store_with(&[1, 2, 3], &[10, 11], &[]);
        store.p[0].mass = 0.0; // gas
        store.p[4].mass = 0.0; // dm
        let changed = eliminate_mass_zero(&mut store);
        assert!(changed);
        assert_eq!(store.num_part(), 3);
        assert_eq!(store.n_gas(), 2);
        assert_eq!(store.timebin_count.iter().sum::<i64>(), 3);
        assert!(store.particles().iter().all(|p| p.mass != 0.0));
        store.assert_slot_consistency().unwrap();
    }

    #[test]
    fn bh_compaction_drops_orphans_and_fixes_links() {
        let mut store = store_with(&[1], &[10], &[20, 21, 22]);
        // delete the middle black hole: mass-zero elimination first
        let victim = store
            .particles()
            .iter()
            .position(|p| p.id == 21)
            .unwrap();
        store.p[victim].mass = 0.0;
        eliminate_mass_zero(&mut store);
        assert_eq!(store.n_bh(), 3); // hole left behind
        compact_bh_slots(&mut store).unwrap();
        assert_eq!(store.n_bh(), 2);
        store.assert_slot_consistency().unwrap();
        for p in store.particles() {
            if p.ptype == TYPE_BH {
                assert_eq!(store.bh_slots()[p.pi as usize].id, p.id);
            }
        }
    }

    #[test]
    fn collect_reports_reorder_collectively() {
        LocalCluster::run(2, |comm| {
            let mut store = if comm.rank() == 0 {
                let mut s = store_with(&[1, 2], &[10], &[]);
                s.p[0].mass = 0.0;
                s
            } else {
                store_with(&[3, 4], &[11], &[])
            };
            // rank 1 has nothing to collect, but the flag is collective
            let invalid = collect(&comm, &mut store).unwrap();
            assert!(invalid);
        });
    }
}
