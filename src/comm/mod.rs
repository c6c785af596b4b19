//! Rank-to-rank transport.
//!
//! The decomposition core is written against the [`Communicator`] trait so
//! the same code runs on a real MPI world ([`mpi::MpiComm`], behind the
//! `mpi` feature) or on an in-process cluster of threads
//! ([`LocalCluster`]), which is what the test suite uses to run multi-rank
//! scenarios under `cargo test`.
//!
//! Payloads cross the transport as raw bytes; fixed-size `#[repr(C)]`
//! structs are viewed through [`bytemuck`]. Reductions in the threads
//! backend fold contributions in rank order, so results are bitwise
//! reproducible.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use bytemuck::Pod;

#[cfg(feature = "mpi")]
pub mod mpi;

/// Message tags, one per wire phase.
pub mod tags {
    pub const MERGE_COUNT: u16 = 18;
    pub const MERGE_PAYLOAD: u16 = 19;
    /// Internal to the collectives of the threads backend.
    pub const COLLECTIVE: u16 = 64;
}

pub trait Communicator: Sync {
    fn rank(&self) -> i32;
    fn size(&self) -> i32;
    fn barrier(&self);

    fn send_bytes(&self, to: i32, tag: u16, data: &[u8]);
    fn recv_bytes(&self, from: i32, tag: u16) -> Vec<u8>;

    /// `send[t]` goes to rank `t`; returns the payload received from every
    /// rank, indexed by source. Zero-length payloads cost nothing.
    fn all_to_all_bytes(&self, send: &[Vec<u8>]) -> Vec<Vec<u8>>;

    fn broadcast_bytes(&self, root: i32, data: &mut Vec<u8>);
    fn all_gather_i64(&self, value: i64) -> Vec<i64>;

    fn all_reduce_sum_i64(&self, value: i64) -> i64;
    fn all_reduce_sum_f64(&self, value: f64) -> f64;
    fn all_reduce_sum_i64_slice(&self, values: &[i64]) -> Vec<i64>;
    fn all_reduce_sum_f64_slice(&self, values: &[f64]) -> Vec<f64>;
    fn all_reduce_or(&self, value: bool) -> bool;

    /// Collective termination: print diagnostic context and take the whole
    /// group down.
    fn abort(&self, why: &str) -> !;
}

/// Sends a slice of wire structs as bytes.
pub fn send_slice<T: Pod, C: Communicator + ?Sized>(comm: &C, to: i32, tag: u16, data: &[T]) {
    comm.send_bytes(to, tag, bytemuck::cast_slice(data));
}

/// Receives a vector of wire structs.
pub fn recv_vec<T: Pod, C: Communicator + ?Sized>(comm: &C, from: i32, tag: u16) -> Vec<T> {
    let bytes = comm.recv_bytes(from, tag);
    bytemuck::pod_collect_to_vec(&bytes)
}

/// Typed sparse all-to-all; `send[t]` is delivered to rank `t`.
pub fn all_to_all_slices<T: Pod, C: Communicator + ?Sized>(
    comm: &C,
    send: &[Vec<T>],
) -> Vec<Vec<T>> {
    let raw: Vec<Vec<u8>> = send
        .iter()
        .map(|v| bytemuck::cast_slice(&v[..]).to_vec())
        .collect();
    comm.all_to_all_bytes(&raw)
        .iter()
        .map(|bytes| bytemuck::pod_collect_to_vec(bytes))
        .collect()
}

/// All-to-all of one count per destination rank.
pub fn all_to_all_counts<C: Communicator + ?Sized>(comm: &C, send: &[i64]) -> Vec<i64> {
    let raw: Vec<Vec<u8>> = send.iter().map(|v| v.to_le_bytes().to_vec()).collect();
    comm.all_to_all_bytes(&raw)
        .iter()
        .map(|bytes| i64::from_le_bytes(bytes[..8].try_into().unwrap()))
        .collect()
}

/// Broadcast of a vector of wire structs from `root`.
pub fn broadcast_vec<T: Pod, C: Communicator + ?Sized>(comm: &C, root: i32, data: &mut Vec<T>) {
    let mut bytes: Vec<u8> = bytemuck::cast_slice(&data[..]).to_vec();
    comm.broadcast_bytes(root, &mut bytes);
    *data = bytemuck::pod_collect_to_vec(&bytes);
}

// ---------------------------------------------------------------------------
// In-process threads backend
// ---------------------------------------------------------------------------

struct Fence {
    state: Mutex<(u32, u64)>, // (waiting, generation)
    cv: Condvar,
}

struct Shared {
    size: i32,
    queues: Mutex<HashMap<(i32, i32, u16), VecDeque<Vec<u8>>>>,
    ready: Condvar,
    fence: Fence,
    aborted: AtomicBool,
}

/// One rank of an in-process cluster. Cheap to clone; all clones share the
/// same mailboxes.
#[derive(Clone)]
pub struct LocalComm {
    rank: i32,
    shared: Arc<Shared>,
}

/// Spawns `size` rank threads and runs `f` on each of them, returning the
/// per-rank results in rank order.
pub struct LocalCluster;

impl LocalCluster {
    pub fn run<F, R>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(LocalComm) -> R + Sync,
        R: Send,
    {
        assert!(size > 0);
        let shared = Arc::new(Shared {
            size: size as i32,
            queues: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
            fence: Fence {
                state: Mutex::new((0, 0)),
                cv: Condvar::new(),
            },
            aborted: AtomicBool::new(false),
        });
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..size)
                .map(|r| {
                    let comm = LocalComm {
                        rank: r as i32,
                        shared: shared.clone(),
                    };
                    let f = &f;
                    scope.spawn(move || f(comm))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("rank thread panicked"))
                .collect()
        })
    }
}

impl LocalComm {
    fn check_abort(&self) {
        if self.shared.aborted.load(Ordering::SeqCst) {
            panic!("cluster aborted (observed on rank {})", self.rank);
        }
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.shared.size
    }

    fn barrier(&self) {
        let fence = &self.shared.fence;
        let mut state = fence.state.lock().unwrap();
        let gen = state.1;
        state.0 += 1;
        if state.0 == self.shared.size as u32 {
            state.0 = 0;
            state.1 += 1;
            fence.cv.notify_all();
        } else {
            while state.1 == gen {
                self.check_abort();
                state = fence.cv.wait(state).unwrap();
            }
        }
    }

    fn send_bytes(&self, to: i32, tag: u16, data: &[u8]) {
        let mut queues = self.shared.queues.lock().unwrap();
        queues
            .entry((self.rank, to, tag))
            .or_default()
            .push_back(data.to_vec());
        self.shared.ready.notify_all();
    }

    fn recv_bytes(&self, from: i32, tag: u16) -> Vec<u8> {
        let mut queues = self.shared.queues.lock().unwrap();
        loop {
            self.check_abort();
            if let Some(msg) = queues
                .get_mut(&(from, self.rank, tag))
                .and_then(VecDeque::pop_front)
            {
                return msg;
            }
            queues = self.shared.ready.wait(queues).unwrap();
        }
    }

    fn all_to_all_bytes(&self, send: &[Vec<u8>]) -> Vec<Vec<u8>> {
        assert_eq!(send.len(), self.shared.size as usize);
        for (t, payload) in send.iter().enumerate() {
            self.send_bytes(t as i32, tags::COLLECTIVE, payload);
        }
        (0..self.shared.size)
            .map(|src| self.recv_bytes(src, tags::COLLECTIVE))
            .collect()
    }

    fn broadcast_bytes(&self, root: i32, data: &mut Vec<u8>) {
        if self.rank == root {
            for t in 0..self.shared.size {
                if t != root {
                    self.send_bytes(t, tags::COLLECTIVE, data);
                }
            }
        } else {
            *data = self.recv_bytes(root, tags::COLLECTIVE);
        }
    }

    fn all_gather_i64(&self, value: i64) -> Vec<i64> {
        let send = vec![value; self.shared.size as usize];
        all_to_all_counts(self, &send)
    }

    fn all_reduce_sum_i64(&self, value: i64) -> i64 {
        self.all_gather_i64(value).iter().sum()
    }

    fn all_reduce_sum_f64(&self, value: f64) -> f64 {
        self.all_reduce_sum_f64_slice(&[value])[0]
    }

    fn all_reduce_sum_i64_slice(&self, values: &[i64]) -> Vec<i64> {
        let payload: Vec<u8> = bytemuck::cast_slice(values).to_vec();
        let send = vec![payload; self.shared.size as usize];
        let recv = self.all_to_all_bytes(&send);
        let mut out = vec![0i64; values.len()];
        for bytes in &recv {
            let contrib: Vec<i64> = bytemuck::pod_collect_to_vec(bytes);
            for (o, c) in out.iter_mut().zip(&contrib) {
                *o += c;
            }
        }
        out
    }

    fn all_reduce_sum_f64_slice(&self, values: &[f64]) -> Vec<f64> {
        let payload: Vec<u8> = bytemuck::cast_slice(values).to_vec();
        let send = vec![payload; self.shared.size as usize];
        let recv = self.all_to_all_bytes(&send);
        let mut out = vec![0f64; values.len()];
        for bytes in &recv {
            let contrib: Vec<f64> = bytemuck::pod_collect_to_vec(bytes);
            for (o, c) in out.iter_mut().zip(&contrib) {
                *o += c;
            }
        }
        out
    }

    fn all_reduce_or(&self, value: bool) -> bool {
        self.all_reduce_sum_i64(value as i64) > 0
    }

    fn abort(&self, why: &str) -> ! {
        eprintln!("rank {}: {}", self.rank, why);
        self.shared.aborted.store(true, Ordering::SeqCst);
        // wake everything stuck in a receive or a barrier
        {
            let _queues = self.shared.queues.lock().unwrap();
            self.shared.ready.notify_all();
        }
        {
            let _state = self.shared.fence.state.lock().unwrap();
            self.shared.fence.cv.notify_all();
        }
        panic!("cluster aborted on rank {}: {}", self.rank, why);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_to_point_roundtrip() {
        LocalCluster::run(2, |comm| {
            if comm.rank() == 0 {
                send_slice(&comm, 1, tags::MERGE_PAYLOAD, &[1u64, 2, 3]);
            } else {
                let got: Vec<u64> = recv_vec(&comm, 0, tags::MERGE_PAYLOAD);
                assert_eq!(got, vec![1, 2, 3]);
            }
        });
    }

    #[test]
    fn all_to_all_counts_transposes() {
        LocalCluster::run(4, |comm| {
            let me = comm.rank() as i64;
            // rank r sends r*10 + t to rank t
            let send: Vec<i64> = (0..4).map(|t| me * 10 + t).collect();
            let recv = all_to_all_counts(&comm, &send);
            let expect: Vec<i64> = (0..4).map(|s| s * 10 + me).collect();
            assert_eq!(recv, expect);
        });
    }

    #[test]
    fn reductions_agree_on_all_ranks() {
        let sums = LocalCluster::run(4, |comm| {
            comm.all_reduce_sum_i64(comm.rank() as i64 + 1)
        });
        assert_eq!(sums, vec![10, 10, 10, 10]);
    }

    #[test]
    fn broadcast_reaches_everyone() {
        LocalCluster::run(3, |comm| {
            let mut data = if comm.rank() == 0 {
                vec![7u64, 8, 9]
            } else {
                Vec::new()
            };
            broadcast_vec(&comm, 0, &mut data);
            assert_eq!(data, vec![7, 8, 9]);
        });
    }
}
