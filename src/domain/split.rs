//! Slicing the leaf sequence into segments and assigning them to ranks.
//!
//! The leaf sequence is cut into `OverDecomp * NTask` contiguous segments,
//! balanced by work (or by particle count on the memory fallback), then
//! segments are paired down to ranks: repeatedly sort buckets by load and
//! merge the lightest with the heaviest until one bucket per rank remains.

/// Contiguous leaf ranges, one per segment; `end` is inclusive.
#[derive(Clone, Default)]
pub struct Segments {
    pub start: Vec<i32>,
    pub end: Vec<i32>,
    /// Owning rank per segment; filled by the assigner.
    pub task: Vec<i32>,
}

/// Work and load imbalance of an assignment.
#[derive(Clone, Copy, Default)]
pub struct BalanceReport {
    pub max_work: f64,
    pub avg_work: f64,
    pub max_load: i64,
    pub avg_load: f64,
}

/// Walks the leaves accumulating work, closing a segment whenever its
/// cumulative work plus everything already committed would pass the next
/// multiple of the global average. Later segments are always left at least
/// one leaf each; the final segment absorbs the residue.
pub fn find_split_work_balanced(ncpu: usize, work: &[f64]) -> Segments {
    let ndomain = work.len();
    let total: f64 = work.iter().sum();
    let avg = total / ncpu as f64;

    let mut segs = Segments {
        start: vec![0; ncpu],
        end: vec![0; ncpu],
        task: vec![0; ncpu],
    };

    let mut work_before = 0.0;
    let mut avg_before = 0.0;
    let mut start = 0usize;

    for i in 0..ncpu {
        let mut end = start;
        let mut acc = work[end];
        while (acc + work_before < avg + avg_before) || (i == ncpu - 1 && end < ndomain - 1) {
            if ndomain - end > ncpu - i {
                end += 1;
            } else {
                break;
            }
            acc += work[end];
        }
        segs.start[i] = start as i32;
        segs.end[i] = end as i32;
        work_before += acc;
        avg_before += avg;
        start = end + 1;
    }
    segs
}

/// Same walk balanced by particle counts; used only when the work split
/// violates the memory bound.
pub fn find_split_load_balanced(ncpu: usize, count: &[i64]) -> Segments {
    let ndomain = count.len();
    let total: i64 = count.iter().sum();
    let avg = total as f64 / ncpu as f64;

    let mut segs = Segments {
        start: vec![0; ncpu],
        end: vec![0; ncpu],
        task: vec![0; ncpu],
    };

    let mut load_before = 0.0;
    let mut avg_before = 0.0;
    let mut start = 0usize;

    for i in 0..ncpu {
        let mut end = start;
        let mut acc = count[end] as f64;
        while (acc + load_before < avg + avg_before) || (i == ncpu - 1 && end < ndomain - 1) {
            if ndomain - end > ncpu - i {
                end += 1;
            } else {
                break;
            }
            acc += count[end] as f64;
        }
        segs.start[i] = start as i32;
        segs.end[i] = end as i32;
        load_before += acc;
        avg_before += avg;
        start = end + 1;
    }
    segs
}

/// Pairs segments down to ranks.
///
/// Starting from one bucket per segment, buckets are sorted by load and the
/// lightest merges with the heaviest until `ntask` buckets remain; each rank
/// then owns `OverDecomp` segments of complementary weight. Segments are
/// re-sorted by owning rank and the leaf→task table is rewritten.
pub fn assign_balanced(
    segs: &mut Segments,
    ntask: usize,
    work: Option<&[f64]>,
    count: Option<&[i64]>,
    task_of_leaf: &mut [i32],
) {
    let ncpu = segs.start.len();
    let seg_load = |n: usize| -> f64 {
        let mut load = 0.0;
        for i in segs.start[n]..=segs.end[n] {
            if let Some(w) = work {
                load += w[i as usize];
            } else if let Some(c) = count {
                load += c[i as usize] as f64;
            }
        }
        load
    };
    let loads: Vec<f64> = (0..ncpu).map(seg_load).collect();

    let mut seg_task: Vec<usize> = (0..ncpu).collect();
    let mut ndomains = ncpu;
    while ndomains > ntask {
        let mut bucket = vec![0.0f64; ndomains];
        for n in 0..ncpu {
            bucket[seg_task[n]] += loads[n];
        }
        let mut order: Vec<usize> = (0..ndomains).collect();
        order.sort_by(|&a, &b| {
            bucket[a]
                .partial_cmp(&bucket[b])
                .unwrap()
                .then(a.cmp(&b))
        });
        let mut target = vec![0usize; ndomains];
        for i in 0..ndomains / 2 {
            target[order[i]] = i;
            target[order[ndomains - 1 - i]] = i;
        }
        for t in seg_task.iter_mut() {
            *t = target[*t];
        }
        ndomains /= 2;
    }

    let mut ordering: Vec<usize> = (0..ncpu).collect();
    ordering.sort_by_key(|&n| (seg_task[n], segs.start[n]));

    let (old_start, old_end) = (segs.start.clone(), segs.end.clone());
    for (slot, &n) in ordering.iter().enumerate() {
        segs.start[slot] = old_start[n];
        segs.end[slot] = old_end[n];
        segs.task[slot] = seg_task[n] as i32;
        for i in old_start[n]..=old_end[n] {
            task_of_leaf[i as usize] = seg_task[n] as i32;
        }
    }
}

/// Computes the per-rank work and load of an assignment and whether any
/// rank's particle load breaks `max_part`.
pub fn check_memory_bound(
    segs: &Segments,
    ntask: usize,
    work: &[f64],
    count: &[i64],
    max_part: usize,
    print_details: bool,
    verbose: bool,
) -> (BalanceReport, Option<usize>) {
    let mut list_load = vec![0i64; ntask];
    let mut list_work = vec![0f64; ntask];

    for n in 0..segs.start.len() {
        let ta = segs.task[n] as usize;
        for i in segs.start[n]..=segs.end[n] {
            list_load[ta] += count[i as usize];
            list_work[ta] += work[i as usize];
        }
    }

    let sum_work: f64 = list_work.iter().sum();
    let sum_load: i64 = list_load.iter().sum();
    let max_work = list_work.iter().cloned().fold(0.0, f64::max);
    let max_load = list_load.iter().cloned().max().unwrap_or(0);

    let report = BalanceReport {
        max_work,
        avg_work: sum_work / ntask as f64,
        max_load,
        avg_load: sum_load as f64 / ntask as f64,
    };

    if verbose {
        println!(
            "largest deviations from average: work = {:.4}, particle load = {:.4}",
            max_work / report.avg_work.max(f64::MIN_POSITIVE),
            max_load as f64 / report.avg_load.max(f64::MIN_POSITIVE)
        );
        if print_details {
            println!("balance breakdown:");
            for ta in 0..ntask {
                println!(
                    "  task [{:3}]  work = {:8.4}  particle load = {:8.4}",
                    ta,
                    list_work[ta] / report.avg_work.max(f64::MIN_POSITIVE),
                    list_load[ta] as f64 / report.avg_load.max(f64::MIN_POSITIVE)
                );
            }
        }
    }

    let violator = list_load
        .iter()
        .position(|&load| load > max_part as i64);
    (report, violator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_split_covers_every_leaf_once() {
        let work: Vec<f64> = (0..37).map(|i| 1.0 + (i % 5) as f64).collect();
        let segs = find_split_work_balanced(8, &work);
        assert_eq!(segs.start[0], 0);
        assert_eq!(segs.end[7], 36);
        for i in 1..8 {
            assert_eq!(segs.start[i], segs.end[i - 1] + 1);
        }
    }

    #[test]
    fn work_split_respects_remaining_segments() {
        // one huge leaf up front must not starve the remaining segments
        let mut work = vec![1.0; 10];
        work[0] = 1000.0;
        let segs = find_split_work_balanced(4, &work);
        for i in 0..4 {
            assert!(segs.start[i] <= segs.end[i]);
        }
        assert_eq!(segs.end[3], 9);
    }

    #[test]
    fn load_split_tracks_counts() {
        let count = vec![10i64; 16];
        let segs = find_split_load_balanced(4, &count);
        for i in 0..4 {
            assert_eq!(segs.end[i] - segs.start[i] + 1, 4);
        }
    }

    #[test]
    fn pair_down_balances_uneven_segments() {
        let work = vec![8.0, 1.0, 7.0, 2.0, 6.0, 3.0, 5.0, 4.0];
        let mut segs = Segments {
            start: (0..8).collect(),
            end: (0..8).collect(),
            task: vec![0; 8],
        };
        let mut task_of_leaf = vec![0i32; 8];
        assign_balanced(&mut segs, 4, Some(&work), None, &mut task_of_leaf);

        let mut per_task = vec![0.0f64; 4];
        for leaf in 0..8 {
            per_task[task_of_leaf[leaf] as usize] += work[leaf];
        }
        // every pairing of {8,1},{7,2},{6,3},{5,4} sums to 9
        for load in per_task {
            assert!((load - 9.0).abs() < 1e-12);
        }
    }

    #[test]
    fn memory_bound_flags_overloaded_rank() {
        let work = vec![1.0; 4];
        let count = vec![100i64, 1, 1, 1];
        let mut segs = Segments {
            start: (0..4).collect(),
            end: (0..4).collect(),
            task: vec![0; 4],
        };
        let mut task_of_leaf = vec![0i32; 4];
        assign_balanced(&mut segs, 4, Some(&work), None, &mut task_of_leaf);
        let (_, violator) = check_memory_bound(&segs, 4, &work, &count, 50, false, false);
        assert!(violator.is_some());
        let (_, violator) = check_memory_bound(&segs, 4, &work, &count, 200, false, false);
        assert!(violator.is_none());
    }
}
