//! The exchange engine.
//!
//! Moves every particle to the rank that owns its leaf. Each round stages as
//! many flagged particles as the transfer budget allows, reconciles the
//! inbound volumes against the receivers' table bounds (shedding exports
//! round-robin when a receiver would overflow), then runs the paired sparse
//! all-to-all transfers: base entries travel in two phases (gas first, into
//! the gas prefix, then the rest into the tail), gas slots and black-hole
//! slots in one phase each. Rounds repeat until no rank was limited by its
//! budget.
//!
//! The sender's `togo` counts are the source of truth: after every shedding
//! sweep the quotas are re-applied to the flagged particles and `toget` is
//! re-derived with a fresh all-to-all.

use std::mem;

use bytemuck::Zeroable;
use rayon::prelude::*;

use crate::comm::{self, Communicator};
use crate::constants::{MAX_OVERFLOW_ITER, TYPE_BH, TYPE_GAS};
use crate::particle::{BhSlot, GasSlot, Particle, ParticleStore};
use crate::DomainError;

/// Totals of one full exchange; identical on every rank.
#[derive(Clone, Copy, Default, Debug)]
pub struct ExchangeStats {
    pub rounds: u32,
    pub moved: i64,
}

/// Per-destination bookkeeping the transport needs per round, mirrored in
/// the transfer budget.
const MSG_HEADROOM: usize = 24 * mem::size_of::<i32>() + 16 * mem::size_of::<usize>();

struct RoundPlan {
    togo: Vec<i64>,
    togo_sph: Vec<i64>,
    togo_bh: Vec<i64>,
    toget: Vec<i64>,
    toget_sph: Vec<i64>,
    toget_bh: Vec<i64>,
    /// Some rank ran out of budget; another round follows.
    limited: bool,
}

pub fn exchange<C, F>(
    comm: &C,
    store: &mut ParticleStore,
    layout: &F,
    free_bytes: usize,
) -> Result<ExchangeStats, DomainError>
where
    C: Communicator,
    F: Fn(&Particle) -> i32 + Sync,
{
    let me = comm.rank();

    store.p.par_iter_mut().for_each(|p| {
        p.set_on_another_domain(layout(p) != me);
        p.set_will_export(false);
    });

    let mut stats = ExchangeStats::default();
    loop {
        let headroom = comm.size() as usize * MSG_HEADROOM;
        let limit = free_bytes as isize - headroom as isize;
        if limit <= 0 {
            return Err(DomainError::ExchangeOverflow(format!(
                "transfer budget of {} bytes is below the bookkeeping headroom",
                free_bytes
            )));
        }

        let plan = count_to_go(comm, store, layout, limit)?;

        let sumtogo = comm.all_reduce_sum_i64(plan.togo.iter().sum());
        if comm.rank() == 0 {
            println!(
                "exchange iter {}: moving {:013} particles",
                stats.rounds, sumtogo
            );
        }

        exchange_once(comm, store, layout, &plan)?;
        stats.rounds += 1;
        stats.moved += sumtogo;

        if !plan.limited {
            break;
        }
    }
    comm.barrier();
    Ok(stats)
}

/// Counts how many flagged particles fit into this round's budget, marking
/// the accepted ones with `WillExport`, and derives the inbound counts.
fn count_to_go<C, F>(
    comm: &C,
    store: &mut ParticleStore,
    layout: &F,
    mut nlimit: isize,
) -> Result<RoundPlan, DomainError>
where
    C: Communicator,
    F: Fn(&Particle) -> i32 + Sync,
{
    let ntask = comm.size() as usize;
    let me = comm.rank();

    let mut togo = vec![0i64; ntask];
    let mut togo_sph = vec![0i64; ntask];
    let mut togo_bh = vec![0i64; ntask];

    let package =
        (mem::size_of::<Particle>() + mem::size_of::<GasSlot>() + mem::size_of::<BhSlot>()) as isize;
    if package >= nlimit {
        return Err(DomainError::ExchangeOverflow(
            "transfer budget cannot hold a single particle".into(),
        ));
    }

    for n in 0..store.p.len() {
        if package >= nlimit {
            break;
        }
        if !store.p[n].on_another_domain() {
            continue;
        }
        let target = layout(&store.p[n]);
        if target == me {
            continue;
        }
        togo[target as usize] += 1;
        nlimit -= mem::size_of::<Particle>() as isize;
        match store.p[n].ptype {
            TYPE_GAS => {
                togo_sph[target as usize] += 1;
                nlimit -= mem::size_of::<GasSlot>() as isize;
            }
            TYPE_BH => {
                togo_bh[target as usize] += 1;
                nlimit -= mem::size_of::<BhSlot>() as isize;
            }
            _ => {}
        }
        store.p[n].set_will_export(true);
    }

    let toget = comm::all_to_all_counts(comm, &togo);
    let toget_sph = comm::all_to_all_counts(comm, &togo_sph);
    let toget_bh = comm::all_to_all_counts(comm, &togo_bh);

    let limited = comm.all_reduce_or(package >= nlimit);

    let mut plan = RoundPlan {
        togo,
        togo_sph,
        togo_bh,
        toget,
        toget_sph,
        toget_bh,
        limited,
    };

    if limited {
        // a partial exchange is not guaranteed to observe the particle
        // limits on every receiver; reconcile explicitly
        shed(comm, store, layout, &mut plan)?;
    }
    Ok(plan)
}

/// Black holes currently alive in the base table. The slot table itself may
/// be larger: exported slots linger as holes until the next collection, so
/// `store.bh.len()` overstates the population mid-exchange.
fn live_bh(store: &ParticleStore) -> usize {
    store.p.iter().filter(|p| p.ptype == TYPE_BH).count()
}

/// Every rank's outgoing counts, row-major by source rank; identical
/// everywhere.
fn gather_matrix<C: Communicator>(comm: &C, row: &[i64]) -> Vec<i64> {
    let payload: Vec<u8> = bytemuck::cast_slice(row).to_vec();
    let send = vec![payload; comm.size() as usize];
    let recv = comm.all_to_all_bytes(&send);
    let mut matrix = Vec::with_capacity(row.len() * recv.len());
    for bytes in &recv {
        let counts: Vec<i64> = bytemuck::pod_collect_to_vec(bytes);
        matrix.extend_from_slice(&counts);
    }
    matrix
}

fn column_sum(m: &[i64], ntask: usize, col: usize) -> i64 {
    (0..ntask).map(|s| m[s * ntask + col]).sum()
}

fn row_sum(m: &[i64], ntask: usize, row: usize) -> i64 {
    m[row * ntask..(row + 1) * ntask].iter().sum()
}

/// Receive-side safety loop.
///
/// With the full outgoing-count matrices known everywhere, each rank runs
/// the same deterministic sweep: for every receiver whose projected gas,
/// black-hole or total population breaks its bound, senders drop one staged
/// particle at a time in round-robin until the volume fits. Quotas are then
/// re-applied to the flagged particles and the inbound counts re-derived.
fn shed<C, F>(
    comm: &C,
    store: &mut ParticleStore,
    layout: &F,
    plan: &mut RoundPlan,
) -> Result<(), DomainError>
where
    C: Communicator,
    F: Fn(&Particle) -> i32 + Sync,
{
    let ntask = comm.size() as usize;
    let me = comm.rank() as usize;

    let list_numpart = comm.all_gather_i64(store.p.len() as i64);
    let list_nsph = comm.all_gather_i64(store.gas.len() as i64);
    let list_nbh = comm.all_gather_i64(live_bh(store) as i64);
    let max_part = store.max_part as i64;
    let max_part_bh = store.max_part_bh as i64;

    let mut sweeps: u32 = 0;
    loop {
        let mut m_go = gather_matrix(comm, &plan.togo);
        let mut m_sph = gather_matrix(comm, &plan.togo_sph);
        let mut m_bh = gather_matrix(comm, &plan.togo_bh);

        let mut changed = false;
        for ta in 0..ntask {
            let projected_sph =
                list_nsph[ta] + column_sum(&m_sph, ntask, ta) - row_sum(&m_sph, ntask, ta);
            changed |= shed_column(&mut m_sph, Some(&mut m_go), ntask, ta, projected_sph - max_part, sweeps);

            let projected_bh =
                list_nbh[ta] + column_sum(&m_bh, ntask, ta) - row_sum(&m_bh, ntask, ta);
            changed |= shed_column(&mut m_bh, Some(&mut m_go), ntask, ta, projected_bh - max_part_bh, sweeps);

            let projected =
                list_numpart[ta] + column_sum(&m_go, ntask, ta) - row_sum(&m_go, ntask, ta);
            changed |= shed_column(&mut m_go, None, ntask, ta, projected - max_part, sweeps);
        }

        if !changed {
            return Ok(());
        }
        sweeps += 1;
        if sweeps > MAX_OVERFLOW_ITER {
            return Err(DomainError::ExchangeOverflow(
                "receive-side shedding did not converge".into(),
            ));
        }

        // adopt the reduced quotas and re-select which particles export
        let quota: Vec<i64> = m_go[me * ntask..(me + 1) * ntask].to_vec();
        let quota_sph: Vec<i64> = m_sph[me * ntask..(me + 1) * ntask].to_vec();
        let quota_bh: Vec<i64> = m_bh[me * ntask..(me + 1) * ntask].to_vec();
        reselect(store, layout, me as i32, &quota, &quota_sph, &quota_bh, plan);

        plan.toget = comm::all_to_all_counts(comm, &plan.togo);
        plan.toget_sph = comm::all_to_all_counts(comm, &plan.togo_sph);
        plan.toget_bh = comm::all_to_all_counts(comm, &plan.togo_bh);
    }
}

/// Drops up to `ntoomany` staged particles bound for receiver `ta`, cycling
/// sender ranks starting at `sweeps % ntask`. Returns whether anything was
/// (or should have been) shed.
fn shed_column(
    m: &mut [i64],
    mut parent: Option<&mut Vec<i64>>,
    ntask: usize,
    ta: usize,
    mut ntoomany: i64,
    sweeps: u32,
) -> bool {
    if ntoomany <= 0 {
        return false;
    }
    let mut i = sweeps as usize % ntask;
    let mut idle = 0;
    while ntoomany > 0 && idle < ntask {
        if m[i * ntask + ta] > 0 {
            m[i * ntask + ta] -= 1;
            if let Some(pm) = parent.as_deref_mut() {
                pm[i * ntask + ta] -= 1;
            }
            ntoomany -= 1;
            idle = 0;
        } else {
            idle += 1;
        }
        i = (i + 1) % ntask;
    }
    true
}

/// Rewrites `WillExport` so at most the per-type quotas are staged, and
/// replaces the plan's outgoing counts with what was actually selected.
fn reselect<F>(
    store: &mut ParticleStore,
    layout: &F,
    me: i32,
    quota: &[i64],
    quota_sph: &[i64],
    quota_bh: &[i64],
    plan: &mut RoundPlan,
) where
    F: Fn(&Particle) -> i32 + Sync,
{
    let ntask = quota.len();
    let mut local = vec![0i64; ntask];
    let mut local_sph = vec![0i64; ntask];
    let mut local_bh = vec![0i64; ntask];

    for n in 0..store.p.len() {
        if !store.p[n].on_another_domain() {
            continue;
        }
        store.p[n].set_will_export(false);
        let target = layout(&store.p[n]);
        if target == me {
            continue;
        }
        let t = target as usize;
        match store.p[n].ptype {
            TYPE_GAS => {
                if local_sph[t] < quota_sph[t] && local[t] < quota[t] {
                    local[t] += 1;
                    local_sph[t] += 1;
                    store.p[n].set_will_export(true);
                }
            }
            TYPE_BH => {
                if local_bh[t] < quota_bh[t] && local[t] < quota[t] {
                    local[t] += 1;
                    local_bh[t] += 1;
                    store.p[n].set_will_export(true);
                }
            }
            _ => {
                if local[t] < quota[t] {
                    local[t] += 1;
                    store.p[n].set_will_export(true);
                }
            }
        }
    }

    plan.togo = local;
    plan.togo_sph = local_sph;
    plan.togo_bh = local_bh;
}

/// One staged transfer: pack, compact, ship, repair.
fn exchange_once<C, F>(
    comm: &C,
    store: &mut ParticleStore,
    layout: &F,
    plan: &RoundPlan,
) -> Result<(), DomainError>
where
    C: Communicator,
    F: Fn(&Particle) -> i32 + Sync,
{
    let ntask = comm.size() as usize;

    let mut part_gas_buf: Vec<Vec<Particle>> = (0..ntask)
        .map(|t| Vec::with_capacity(plan.togo_sph[t] as usize))
        .collect();
    let mut gas_buf: Vec<Vec<GasSlot>> = (0..ntask)
        .map(|t| Vec::with_capacity(plan.togo_sph[t] as usize))
        .collect();
    let mut part_rest_buf: Vec<Vec<Particle>> = (0..ntask)
        .map(|t| Vec::with_capacity((plan.togo[t] - plan.togo_sph[t]) as usize))
        .collect();
    let mut bh_buf: Vec<Vec<BhSlot>> = (0..ntask)
        .map(|t| Vec::with_capacity(plan.togo_bh[t] as usize))
        .collect();

    // pack and compact in one walk; exported entries are replaced by the
    // current last entry (with the extra prefix-end swap for gas, so the gas
    // prefix stays dense)
    let mut n = 0;
    while n < store.p.len() {
        let entry = store.p[n];
        if !(entry.on_another_domain() && entry.will_export()) {
            n += 1;
            continue;
        }
        let mut out = entry;
        out.set_on_another_domain(false);
        out.set_will_export(false);
        let target = layout(&out) as usize;

        match out.ptype {
            TYPE_GAS => {
                gas_buf[target].push(store.gas[n]);
                part_gas_buf[target].push(out);

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
            }
            TYPE_BH => {
                bh_buf[target].push(store.bh[out.pi as usize]);
                // the slot is left behind as a transient hole; point the
                // travelling entry at its offset in the outgoing buffer
                out.pi = (bh_buf[target].len() - 1) as i32;
                part_rest_buf[target].push(out);

                let plast = store.p.len() - 1;
                let tail_end = store.p[plast];
                store.p[n] = tail_end;
                store.p.truncate(plast);
            }
            _ => {
                part_rest_buf[target].push(out);
                let plast = store.p.len() - 1;
                let tail_end = store.p[plast];
                store.p[n] = tail_end;
                store.p.truncate(plast);
            }
        }
        // the swapped-in entry at n still needs a look
    }

    for t in 0..ntask {
        if gas_buf[t].len() as i64 != plan.togo_sph[t]
            || bh_buf[t].len() as i64 != plan.togo_bh[t]
            || (part_gas_buf[t].len() + part_rest_buf[t].len()) as i64 != plan.togo[t]
        {
            return Err(DomainError::Corruption(
                "packed buffers disagree with the staged counts",
            ));
        }
    }

    let count_get: usize = plan.toget.iter().sum::<i64>() as usize;
    let count_get_sph: usize = plan.toget_sph.iter().sum::<i64>() as usize;
    let count_get_bh: usize = plan.toget_bh.iter().sum::<i64>() as usize;

    // make room for incoming gas at the end of the prefix
    let old_np = store.p.len();
    let ngas = store.gas.len();
    store.p.resize(old_np + count_get, Particle::zeroed());
    store.p.copy_within(ngas..old_np, ngas + count_get_sph);

    // paired transfers: base gas first, then gas slots, base rest, bh slots
    let recv_gas_parts = comm::all_to_all_slices(comm, &part_gas_buf);
    let recv_gas_slots = comm::all_to_all_slices(comm, &gas_buf);
    let recv_rest = comm::all_to_all_slices(comm, &part_rest_buf);
    let recv_bh = comm::all_to_all_slices(comm, &bh_buf);

    let mut cursor = ngas;
    for src in 0..ntask {
        if recv_gas_parts[src].len() as i64 != plan.toget_sph[src] {
            return Err(DomainError::Corruption("gas transfer count mismatch"));
        }
        for mut p in recv_gas_parts[src].iter().copied() {
            p.pi = cursor as i32;
            store.p[cursor] = p;
            cursor += 1;
        }
        store.gas.extend_from_slice(&recv_gas_slots[src]);
    }
    if cursor != ngas + count_get_sph || store.gas.len() != ngas + count_get_sph {
        return Err(DomainError::Corruption("gas transfer count mismatch"));
    }

    let mut cursor = old_np + count_get_sph;
    let bh_before = store.bh.len();
    let mut bh_offset = store.bh.len();
    for src in 0..ntask {
        if recv_rest[src].len() as i64 != plan.toget[src] - plan.toget_sph[src]
            || recv_bh[src].len() as i64 != plan.toget_bh[src]
        {
            return Err(DomainError::Corruption("transfer count mismatch"));
        }
        let mut j = bh_offset;
        for mut p in recv_rest[src].iter().copied() {
            if p.ptype == TYPE_BH {
                // reattach to the slot's position in our table
                p.pi = j as i32;
                j += 1;
            }
            store.p[cursor] = p;
            cursor += 1;
        }
        if j != bh_offset + recv_bh[src].len() {
            return Err(DomainError::Corruption(
                "black-hole entries disagree with transferred slots",
            ));
        }
        store.bh.extend_from_slice(&recv_bh[src]);
        bh_offset = store.bh.len();
    }
    if cursor != old_np + count_get || store.bh.len() != bh_before + count_get_bh {
        return Err(DomainError::Corruption("transfer count mismatch"));
    }

    // bounds after receipt; the black-hole bound applies to the live
    // population, not the slot table with its transient holes, and the
    // decision is collective
    let n_bh = live_bh(store);
    let overflow = store.p.len() > store.max_part
        || store.gas.len() > store.max_part
        || n_bh > store.max_part_bh;
    if comm.all_reduce_or(overflow) {
        return Err(DomainError::ExchangeOverflow(format!(
            "tables overflowed after transfer: {} particles (limit {}), {} gas, {} bh (limit {})",
            store.p.len(),
            store.max_part,
            store.gas.len(),
            n_bh,
            store.max_part_bh
        )));
    }
    Ok(())
}
