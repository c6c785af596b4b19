//! The global top tree.
//!
//! A shallow octree over Peano-Hilbert key space whose leaves partition the
//! curve into cells coarser than particles but fine enough for balanced
//! assignment. Each rank refines locally over its own particles, the local
//! trees are merged pairwise in log2(NTask) rounds onto rank 0, the result
//! is broadcast, and leaves still concentrating too much count or cost are
//! subdivided once more. All of it is bounded by the top-node budget; an
//! overflow anywhere restarts the whole decomposition with a larger budget.

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

use crate::comm::{self, tags, Communicator};
use crate::constants::{PEANOCELLS, TOPNODEFACTOR};
use crate::particle::ParticleStore;
use crate::DomainError;

use super::cost_factor;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct TopNode {
    /// Number of mesh cells covered; a power of 8.
    pub size: u64,
    pub start_key: u64,
    pub count: i64,
    pub cost: f64,
    /// Index of the first of 8 daughters, -1 for a leaf.
    pub daughter: i32,
    pub parent: i32,
    /// Position among leaves enumerated in Peano-Hilbert order.
    pub leaf: i32,
    /// First particle of the node in the sorted key sequence; only used
    /// during local refinement.
    pub pindex: i32,
}

pub struct TopTree {
    pub nodes: Vec<TopNode>,
    pub max_topnodes: usize,
    pub n_topleaves: usize,
}

#[derive(Copy, Clone)]
struct KeyIndex {
    key: u64,
    index: u32,
}

impl TopTree {
    /// Leaf ordinal containing `key`.
    pub fn leaf_of(&self, key: u64) -> usize {
        let mut no = 0usize;
        loop {
            let n = &self.nodes[no];
            if n.daughter < 0 {
                return n.leaf as usize;
            }
            no = n.daughter as usize + ((key - n.start_key) / (n.size >> 3)) as usize;
        }
    }

    /// Enumerates leaves in Peano-Hilbert order, assigning ordinals.
    fn walk(&mut self) {
        self.n_topleaves = 0;
        self.walk_from(0);
    }

    fn walk_from(&mut self, no: usize) {
        if self.nodes[no].daughter < 0 {
            self.nodes[no].leaf = self.n_topleaves as i32;
            self.n_topleaves += 1;
        } else {
            let d = self.nodes[no].daughter as usize;
            for j in 0..8 {
                self.walk_from(d + j);
            }
        }
    }
}

/// Builds the global top tree.
///
/// Budget overflow returns [`DomainError::TopNodeBudget`] uniformly on every
/// rank; the caller grows the budget and restarts.
pub fn build<C: Communicator>(
    comm: &C,
    store: &ParticleStore,
    max_topnodes: usize,
    tot_num_part: i64,
    ncpu: usize,
) -> Result<TopTree, DomainError> {
    // sorted (key, index) pairs over the local population
    let mut mp: Vec<KeyIndex> = store
        .particles()
        .iter()
        .enumerate()
        .map(|(i, p)| KeyIndex {
            key: p.key,
            index: i as u32,
        })
        .collect();
    mp.par_sort_unstable_by_key(|e| e.key);

    let local_cost: f64 = store.particles().par_iter().map(cost_factor).sum();
    let total_cost = comm.all_reduce_sum_f64(local_cost);

    let mut tree = TopTree {
        nodes: vec![TopNode {
            size: PEANOCELLS,
            start_key: 0,
            count: store.num_part() as i64,
            cost: local_cost,
            daughter: -1,
            parent: -1,
            leaf: -1,
            pindex: 0,
        }],
        max_topnodes,
        n_topleaves: 0,
    };

    let errflag = local_refine(&mut tree, 0, &mp, store).is_err();
    if comm.all_reduce_sum_i64(errflag as i64) > 0 {
        return Err(DomainError::TopNodeBudget);
    }
    drop(mp);

    combine(comm, &mut tree)?;

    // append more nodes where the estimated count or cost per leaf still
    // exceeds its quota
    let count_limit = tot_num_part / (TOPNODEFACTOR * ncpu as f64) as i64;
    let cost_limit = total_cost / (TOPNODEFACTOR * ncpu as f64);
    adapt(comm, &mut tree, count_limit, cost_limit)?;

    tree.walk();
    Ok(tree)
}

/// Refines node `i` while it concentrates more than 80% of its parent's
/// local particles or cost and still spans at least 8 mesh cells. The root
/// always refines. Daughters split the key interval eight ways and take the
/// particles falling into their subinterval.
fn local_refine(
    tree: &mut TopTree,
    i: usize,
    mp: &[KeyIndex],
    store: &ParticleStore,
) -> Result<(), DomainError> {
    if tree.nodes[i].size < 8 || tree.nodes[i].count == 0 {
        return Ok(());
    }
    let parent = tree.nodes[i].parent;
    if parent >= 0 {
        let p = &tree.nodes[parent as usize];
        if tree.nodes[i].count as f64 <= 0.8 * p.count as f64 && tree.nodes[i].cost <= 0.8 * p.cost
        {
            return Ok(());
        }
    }
    if tree.nodes.len() + 8 > tree.max_topnodes {
        return Err(DomainError::TopNodeBudget);
    }

    let daughter = tree.nodes.len();
    let node = tree.nodes[i];
    tree.nodes[i].daughter = daughter as i32;
    let sub_size = node.size >> 3;
    for j in 0..8u64 {
        tree.nodes.push(TopNode {
            size: sub_size,
            start_key: node.start_key + j * sub_size,
            count: 0,
            cost: 0.0,
            daughter: -1,
            parent: i as i32,
            leaf: -1,
            pindex: node.pindex,
        });
    }

    // distribute the node's particles over the daughters by key
    let first = node.pindex as usize;
    let mut j = 0usize;
    for p in 0..node.count as usize {
        let entry = mp[first + p];
        while j < 7 && entry.key >= tree.nodes[daughter + j + 1].start_key {
            j += 1;
            tree.nodes[daughter + j].pindex = (first + p) as i32;
        }
        tree.nodes[daughter + j].count += 1;
        tree.nodes[daughter + j].cost += cost_factor(&store.particles()[entry.index as usize]);
    }

    for j in 0..8 {
        local_refine(tree, daughter + j, mp, store)?;
    }
    Ok(())
}

/// Merges the local trees pairwise onto rank 0 and broadcasts the result.
///
/// In the round with separation `sep`, ranks divisible by `sep` are group
/// leaders; leaders of even group receive from `self + sep`, leaders of odd
/// group send to `self - sep` and drop out of later rounds.
fn combine<C: Communicator>(comm: &C, tree: &mut TopTree) -> Result<(), DomainError> {
    let ntask = comm.size();
    let me = comm.rank();
    let mut errflag = false;

    let mut sep = 1;
    while sep < ntask {
        if me % sep == 0 {
            let color = me / sep;
            if color % 2 == 0 {
                let src = me + sep;
                if src < ntask {
                    let n_import: Vec<i64> = comm::recv_vec(comm, src, tags::MERGE_COUNT);
                    let imported: Vec<TopNode> = comm::recv_vec(comm, src, tags::MERGE_PAYLOAD);
                    if n_import[0] != imported.len() as i64 {
                        return Err(DomainError::Corruption("top-tree merge length mismatch"));
                    }
                    if !errflag && !imported.is_empty() {
                        match insert_node(tree, &imported, 0, 0) {
                            Ok(()) => {}
                            Err(DomainError::TopNodeBudget) => errflag = true,
                            Err(e) => return Err(e),
                        }
                    }
                }
            } else {
                let dst = me - sep;
                comm::send_slice(comm, dst, tags::MERGE_COUNT, &[tree.nodes.len() as i64]);
                comm::send_slice(comm, dst, tags::MERGE_PAYLOAD, &tree.nodes);
            }
        }
        if comm.all_reduce_or(errflag) {
            return Err(DomainError::TopNodeBudget);
        }
        sep *= 2;
    }

    let mut nodes = if me == 0 {
        std::mem::take(&mut tree.nodes)
    } else {
        Vec::new()
    };
    comm::broadcast_vec(comm, 0, &mut nodes);
    tree.nodes = nodes;
    Ok(())
}

/// Inserts node `no_b` of the incoming tree into the local tree at `no_a`.
///
/// A strictly smaller incoming node descends, opening the local side if
/// needed; equal sizes add counts and costs and recurse; a larger incoming
/// node means the trees disagree about the key partition.
fn insert_node(
    tree: &mut TopTree,
    b: &[TopNode],
    no_a: usize,
    no_b: usize,
) -> Result<(), DomainError> {
    let a_size = tree.nodes[no_a].size;
    let b_size = b[no_b].size;

    if b_size < a_size {
        if tree.nodes[no_a].daughter < 0 {
            if tree.nodes.len() + 8 > tree.max_topnodes {
                return Err(DomainError::TopNodeBudget);
            }
            // whatever was added at the equal-size level above, minus what
            // the incoming subtree will account for itself, spread uniformly
            // with the first daughter absorbing the remainder
            let parent_b = b[no_b].parent as usize;
            let count = tree.nodes[no_a].count - b[parent_b].count;
            let cost = tree.nodes[no_a].cost - b[parent_b].cost;
            let count_each = count / 8;
            let count_first = count - 7 * count_each;
            let cost_each = cost / 8.0;
            let cost_first = cost - 7.0 * cost_each;

            let daughter = tree.nodes.len();
            let node = tree.nodes[no_a];
            tree.nodes[no_a].daughter = daughter as i32;
            let sub_size = a_size >> 3;
            for j in 0..8u64 {
                tree.nodes.push(TopNode {
                    size: sub_size,
                    start_key: node.start_key + j * sub_size,
                    count: if j == 0 { count_first } else { count_each },
                    cost: if j == 0 { cost_first } else { cost_each },
                    daughter: -1,
                    parent: no_a as i32,
                    leaf: -1,
                    pindex: 0,
                });
            }
        }
        let daughter = tree.nodes[no_a].daughter as usize;
        let sub = daughter + ((b[no_b].start_key - tree.nodes[no_a].start_key) / (a_size >> 3)) as usize;
        insert_node(tree, b, sub, no_b)
    } else if b_size == a_size {
        tree.nodes[no_a].count += b[no_b].count;
        tree.nodes[no_a].cost += b[no_b].cost;
        if b[no_b].daughter >= 0 {
            for j in 0..8 {
                insert_node(tree, b, no_a, b[no_b].daughter as usize + j)?;
            }
            Ok(())
        } else {
            if tree.nodes[no_a].daughter >= 0 {
                spread_cost(tree, no_a, b[no_b].count, b[no_b].cost);
            }
            Ok(())
        }
    } else {
        Err(DomainError::Corruption(
            "incoming top-tree node larger than local counterpart",
        ))
    }
}

/// Distributes a leaf contribution over an already-open local subtree,
/// 1/8 per daughter with the first absorbing the count remainder.
fn spread_cost(tree: &mut TopTree, no: usize, count: i64, cost: f64) {
    let count_each = count / 8;
    let count_first = count - 7 * count_each;
    let cost_each = cost / 8.0;
    let daughter = tree.nodes[no].daughter as usize;
    for j in 0..8 {
        let sub = daughter + j;
        let c = if j == 0 { count_first } else { count_each };
        tree.nodes[sub].count += c;
        tree.nodes[sub].cost += cost_each;
        if tree.nodes[sub].daughter >= 0 {
            spread_cost(tree, sub, c, cost_each);
        }
    }
}

/// Subdivides any leaf whose aggregated count or cost exceeds its quota,
/// estimating daughters at one eighth of the parent. Newly appended
/// daughters are revisited in the same sweep.
fn adapt<C: Communicator>(
    comm: &C,
    tree: &mut TopTree,
    count_limit: i64,
    cost_limit: f64,
) -> Result<(), DomainError> {
    let mut errflag = false;
    let mut i = 0;
    while i < tree.nodes.len() {
        let node = tree.nodes[i];
        if node.daughter < 0
            && (node.count > count_limit || node.cost > cost_limit)
            && node.size >= 8
        {
            if tree.nodes.len() + 8 > tree.max_topnodes {
                errflag = true;
                break;
            }
            let daughter = tree.nodes.len();
            tree.nodes[i].daughter = daughter as i32;
            let sub_size = node.size >> 3;
            for j in 0..8u64 {
                tree.nodes.push(TopNode {
                    size: sub_size,
                    start_key: node.start_key + j * sub_size,
                    count: node.count / 8,
                    cost: node.cost / 8.0,
                    daughter: -1,
                    parent: i as i32,
                    leaf: -1,
                    pindex: 0,
                });
            }
        }
        i += 1;
    }
    if comm.all_reduce_sum_i64(errflag as i64) > 0 {
        return Err(DomainError::TopNodeBudget);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;
    use crate::constants::TYPE_DM;
    use crate::particle::Particle;
    use bytemuck::Zeroable;

    fn uniform_store(n: usize, seed: u64) -> ParticleStore {
        let mut store = ParticleStore::new(10 * n + 10, 10);
        let mut state = seed;
        let mut next = || {
            // xorshift; plenty for scattering test particles
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 11) as f64 / (1u64 << 53) as f64
        };
        for id in 0..n as u64 {
            let mut p = Particle::zeroed();
            p.id = id + 1;
            p.mass = 1.0;
            p.ptype = TYPE_DM;
            p.pos = [next(), next(), next()];
            store.push(p).unwrap();
        }
        store.cache_keys(1.0);
        store
    }

    fn leaves_of(tree: &TopTree) -> Vec<TopNode> {
        let mut leaves: Vec<TopNode> = tree
            .nodes
            .iter()
            .copied()
            .filter(|n| n.daughter < 0)
            .collect();
        leaves.sort_by_key(|n| n.start_key);
        leaves
    }

    #[test]
    fn leaves_partition_the_key_space() {
        LocalCluster::run(1, |comm| {
            let store = uniform_store(500, 7);
            let tree = build(&comm, &store, 10_000, 500, 4).unwrap();
            let leaves = leaves_of(&tree);
            assert_eq!(leaves.len(), tree.n_topleaves);
            let mut expect = 0u64;
            for leaf in &leaves {
                assert_eq!(leaf.start_key, expect);
                expect += leaf.size;
            }
            assert_eq!(expect, PEANOCELLS);
            // real per-leaf tallies account for every particle
            let (_, count) = crate::domain::sum_cost(&comm, &store, &tree);
            assert_eq!(count.iter().sum::<i64>(), 500);
        });
    }

    #[test]
    fn leaf_ordinals_follow_key_order() {
        LocalCluster::run(1, |comm| {
            let store = uniform_store(200, 11);
            let tree = build(&comm, &store, 10_000, 200, 2).unwrap();
            let leaves = leaves_of(&tree);
            for (i, leaf) in leaves.iter().enumerate() {
                assert_eq!(leaf.leaf as usize, i);
                assert_eq!(tree.leaf_of(leaf.start_key), i);
                assert_eq!(tree.leaf_of(leaf.start_key + leaf.size - 1), i);
            }
        });
    }

    #[test]
    fn tiny_budget_overflows() {
        LocalCluster::run(1, |comm| {
            let store = uniform_store(500, 3);
            match build(&comm, &store, 8, 500, 4) {
                Err(DomainError::TopNodeBudget) => {}
                other => panic!("expected budget overflow, got {:?}", other.map(|t| t.nodes.len())),
            }
        });
    }

    #[test]
    fn merged_tree_counts_every_particle() {
        LocalCluster::run(4, |comm| {
            // each rank holds a different octant slab
            let mut store = ParticleStore::new(1000, 10);
            for id in 0..100u64 {
                let mut p = Particle::zeroed();
                p.id = 1 + comm.rank() as u64 * 100 + id;
                p.mass = 1.0;
                p.ptype = TYPE_DM;
                p.pos = [
                    0.25 * comm.rank() as f64 + 0.125,
                    (id % 10) as f64 * 0.09 + 0.05,
                    (id / 10) as f64 * 0.09 + 0.05,
                ];
                store.push(p).unwrap();
            }
            store.cache_keys(1.0);
            let tree = build(&comm, &store, 100_000, 400, 4).unwrap();
            assert_eq!(tree.nodes[0].count, 400);
            let (_, count) = crate::domain::sum_cost(&comm, &store, &tree);
            assert_eq!(count.iter().sum::<i64>(), 400);
            assert!(tree.n_topleaves >= 4);
        });
    }
}
