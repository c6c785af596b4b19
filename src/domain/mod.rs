//! Decomposition driver.
//!
//! [`Domain`] is the context value threaded through the core: configuration,
//! the compact top-tree residual and leaf ownership from the last
//! decomposition, per-type totals, and the force-tree invalidation signal.
//! It is allocated once before the first decomposition and lives for the
//! run.
//!
//! One decomposition: wrap positions into the periodic box, garbage-collect,
//! cache keys, build the top tree (growing the node budget by 30% and
//! restarting on overflow), summarize work and count per leaf, split the
//! leaf sequence work-balanced (falling back to a count-balanced split when
//! the memory ceiling is hit), exchange particles until nothing is left
//! over, then re-establish Peano-Hilbert order and refresh the totals.

use rayon::prelude::*;

use crate::comm::{self, Communicator};
use crate::constants::{BUDGET_GROWTH, MAX_BUDGET_RETRIES, NTYPES, TIMEBASE};
use crate::particle::{gc, Particle, ParticleStore};
use crate::DomainError;

pub mod exchange;
pub mod split;
pub mod toptree;

pub use exchange::ExchangeStats;
pub use split::{BalanceReport, Segments};
pub use toptree::{TopNode, TopTree};

/// Expected share of force-evaluation effort contributed by a particle.
pub fn cost_factor(p: &Particle) -> f64 {
    if p.timebin > 0 {
        (1.0 + p.grav_cost as f64) / (1u64 << p.timebin) as f64
    } else {
        (1.0 + p.grav_cost as f64) / TIMEBASE as f64
    }
}

#[derive(Clone)]
pub struct DomainParams {
    pub box_size: f64,
    /// Segments per rank; >= 1.
    pub over_decomp: usize,
    /// Initial top-node budget is `factor * max_part + 1`.
    pub topnode_alloc_factor: f64,
    /// Memory the exchange may stage per round.
    pub free_bytes: usize,
    /// Route the sparse all-to-all through synchronous sends.
    pub no_isend_irecv: bool,
}

impl Default for DomainParams {
    fn default() -> DomainParams {
        DomainParams {
            box_size: 1.0,
            over_decomp: 1,
            topnode_alloc_factor: 1.0,
            free_bytes: 256 << 20,
            no_isend_irecv: false,
        }
    }
}

pub struct Domain {
    pub params: DomainParams,
    /// Grows by 30% on every budget-overflow restart.
    topnode_alloc_factor: f64,
    /// Residual of the last decomposition, kept until the next one.
    pub tree: TopTree,
    pub task_of_leaf: Vec<i32>,
    pub segments: Segments,
    pub nlocal: [i64; NTYPES],
    pub ntotal: [i64; NTYPES],
    pub tot_num_part: i64,
    /// Raised whenever the particle ordering changed; the force-tree owner
    /// must observe it before reusing any cached tree.
    pub tree_invalid: bool,
    pub stats: ExchangeStats,
    pub balance: BalanceReport,
    pub used_load_fallback: bool,
}

impl Domain {
    pub fn new(params: DomainParams) -> Domain {
        assert!(params.over_decomp >= 1);
        Domain {
            topnode_alloc_factor: params.topnode_alloc_factor,
            params,
            tree: TopTree {
                nodes: Vec::new(),
                max_topnodes: 0,
                n_topleaves: 0,
            },
            task_of_leaf: Vec::new(),
            segments: Segments::default(),
            nlocal: [0; NTYPES],
            ntotal: [0; NTYPES],
            tot_num_part: 0,
            tree_invalid: false,
            stats: ExchangeStats::default(),
            balance: BalanceReport::default(),
            used_load_fallback: false,
        }
    }

    /// Owning rank of the particle under the current leaf assignment.
    pub fn layout_of(&self, p: &Particle) -> i32 {
        self.task_of_leaf[self.tree.leaf_of(p.key)]
    }

    /// The budget factor in effect, including any overflow growth.
    pub fn current_topnode_alloc_factor(&self) -> f64 {
        self.topnode_alloc_factor
    }

    /// Runs one full decomposition.
    pub fn decompose<C: Communicator>(
        &mut self,
        comm: &C,
        store: &mut ParticleStore,
    ) -> Result<(), DomainError> {
        store.wrap_positions(self.params.box_size);
        self.tree_invalid = true;

        gc::collect(comm, store)?;
        self.refresh_totals(comm, store);

        store.cache_keys(self.params.box_size);

        let mut retries = 0;
        loop {
            match self.try_decompose(comm, store) {
                Ok(()) => break,
                Err(DomainError::TopNodeBudget) => {
                    retries += 1;
                    if retries >= MAX_BUDGET_RETRIES {
                        return Err(DomainError::TopNodeBudget);
                    }
                    self.topnode_alloc_factor *= BUDGET_GROWTH;
                    if comm.rank() == 0 {
                        println!(
                            "out of top-tree nodes; increasing alloc factor to {:.6}",
                            self.topnode_alloc_factor
                        );
                    }
                }
                Err(e) => return Err(e),
            }
        }

        store.peano_order();
        store.rebuild_timebin_counts();
        self.refresh_totals(comm, store);
        store.assert_slot_consistency()?;
        Ok(())
    }

    fn try_decompose<C: Communicator>(
        &mut self,
        comm: &C,
        store: &mut ParticleStore,
    ) -> Result<(), DomainError> {
        let ntask = comm.size() as usize;
        let ncpu = self.params.over_decomp * ntask;
        let max_topnodes = (self.topnode_alloc_factor * store.max_part as f64) as usize + 1;

        let tree = toptree::build(comm, store, max_topnodes, self.tot_num_part, ncpu)?;

        let (work, count) = sum_cost(comm, store, &tree);
        if comm.rank() == 0 {
            println!(
                "top tree: {} nodes, {} leaves (space for {})",
                tree.nodes.len(),
                tree.n_topleaves,
                max_topnodes
            );
        }
        if tree.n_topleaves < ncpu {
            return Err(DomainError::Corruption(
                "fewer top-tree leaves than requested segments",
            ));
        }

        let mut task_of_leaf = vec![0i32; tree.n_topleaves];
        let mut segs = split::find_split_work_balanced(ncpu, &work);
        split::assign_balanced(&mut segs, ntask, Some(&work), None, &mut task_of_leaf);
        let (mut balance, violator) = split::check_memory_bound(
            &segs,
            ntask,
            &work,
            &count,
            store.max_part,
            false,
            comm.rank() == 0,
        );

        let mut used_fallback = false;
        if violator.is_some() {
            if comm.rank() == 0 {
                println!("memory-imbalance ceiling reached; retrying with a count-balanced split");
            }
            segs = split::find_split_load_balanced(ncpu, &count);
            split::assign_balanced(&mut segs, ntask, None, Some(&count), &mut task_of_leaf);
            let (report, violator) = split::check_memory_bound(
                &segs,
                ntask,
                &work,
                &count,
                store.max_part,
                true,
                comm.rank() == 0,
            );
            if let Some(task) = violator {
                return Err(DomainError::MemoryCeiling {
                    task,
                    needed: report.max_load,
                    limit: store.max_part,
                });
            }
            balance = report;
            used_fallback = true;
        }

        let stats = {
            let layout = |p: &Particle| task_of_leaf[tree.leaf_of(p.key)];
            exchange::exchange(comm, store, &layout, self.params.free_bytes)?
        };

        self.tree = tree;
        self.task_of_leaf = task_of_leaf;
        self.segments = segs;
        self.stats = stats;
        self.balance = balance;
        self.used_load_fallback = used_fallback;
        Ok(())
    }

    /// Recounts the local per-type populations and reduces them into the
    /// global totals.
    pub fn refresh_totals<C: Communicator>(&mut self, comm: &C, store: &ParticleStore) {
        self.nlocal = store.count_by_type();
        let totals = comm.all_reduce_sum_i64_slice(&self.nlocal);
        self.ntotal.copy_from_slice(&totals);
        self.tot_num_part = self.ntotal.iter().sum();
    }
}

/// Global work and particle count per top-tree leaf.
///
/// Thread-partial arrays are accumulated per chunk, merged locally, then
/// summed across ranks.
pub fn sum_cost<C: Communicator>(
    comm: &C,
    store: &ParticleStore,
    tree: &TopTree,
) -> (Vec<f64>, Vec<i64>) {
    let nleaves = tree.n_topleaves;
    let num = store.num_part();
    let nthreads = rayon::current_num_threads();
    // chunk length cannot be zero
    let chunk_len = if num > nthreads { num / nthreads } else { 1 };

    let partials: Vec<(Vec<f64>, Vec<i64>)> = store
        .particles()
        .par_chunks(chunk_len)
        .map(|chunk| {
            let mut work = vec![0f64; nleaves];
            let mut count = vec![0i64; nleaves];
            for p in chunk {
                let leaf = tree.leaf_of(p.key);
                work[leaf] += cost_factor(p);
                count[leaf] += 1;
            }
            (work, count)
        })
        .collect();

    let mut work = vec![0f64; nleaves];
    let mut count = vec![0i64; nleaves];
    for (w, c) in &partials {
        for i in 0..nleaves {
            work[i] += w[i];
            count[i] += c[i];
        }
    }

    (
        comm.all_reduce_sum_f64_slice(&work),
        comm.all_reduce_sum_i64_slice(&count),
    )
}

/// Fails if any particle identifier occurs twice anywhere in the system.
pub fn test_id_uniqueness<C: Communicator>(
    comm: &C,
    store: &ParticleStore,
) -> Result<(), DomainError> {
    let ntask = comm.size() as usize;
    let ids: Vec<u64> = store.particles().iter().map(|p| p.id).collect();
    let mut send: Vec<Vec<u64>> = vec![Vec::new(); ntask];
    send[0] = ids;
    let gathered = comm::all_to_all_slices(comm, &send);

    let mut duplicate = false;
    if comm.rank() == 0 {
        let mut all: Vec<u64> = gathered.into_iter().flatten().collect();
        all.sort_unstable();
        duplicate = all.windows(2).any(|w| w[0] == w[1]);
    }
    if comm.all_reduce_or(duplicate) {
        return Err(DomainError::Corruption("duplicate particle identifier"));
    }
    Ok(())
}
