//! rsmpi backend.
//!
//! Payloads travel as raw bytes over contiguous buffers, the same shape the
//! transport sees from `MPI_Type_contiguous(size, MPI_BYTE)` datatypes. The
//! sparse all-to-all skips empty payloads entirely; with `sync_sends` it
//! falls back to paired synchronous sends for transports with broken
//! immediate-mode progress.

use mpi::collective::SystemOperation;
use mpi::point_to_point::Destination;
use mpi::point_to_point::Source;
use mpi::topology::SystemCommunicator;
use mpi::traits::*;
use mpi::Tag;

use super::Communicator;

const TAG_A2A: u16 = 65;

pub struct MpiComm {
    world: SystemCommunicator,
    sync_sends: bool,
}

impl MpiComm {
    pub fn new(world: SystemCommunicator, sync_sends: bool) -> MpiComm {
        MpiComm { world, sync_sends }
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> i32 {
        self.world.rank()
    }

    fn size(&self) -> i32 {
        self.world.size()
    }

    fn barrier(&self) {
        self.world.barrier();
    }

    fn send_bytes(&self, to: i32, tag: u16, data: &[u8]) {
        self.world
            .process_at_rank(to)
            .send_with_tag(data, tag as Tag);
    }

    fn recv_bytes(&self, from: i32, tag: u16) -> Vec<u8> {
        let (data, _status) = self
            .world
            .process_at_rank(from)
            .receive_vec_with_tag::<u8>(tag as Tag);
        data
    }

    fn all_to_all_bytes(&self, send: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let size = self.size();
        let me = self.rank();
        assert_eq!(send.len(), size as usize);

        // lengths first, so receivers know what is coming
        let lens: Vec<i64> = send.iter().map(|v| v.len() as i64).collect();
        let mut incoming = vec![0i64; size as usize];
        self.world.all_to_all_into(&lens[..], &mut incoming[..]);

        let mut recv: Vec<Vec<u8>> = (0..size as usize).map(|_| Vec::new()).collect();
        recv[me as usize] = send[me as usize].clone();

        if self.sync_sends {
            // ordered pairwise sweep; every rank walks the pairs in the
            // same lexicographic order and the lower rank talks first, so
            // the blocking sends cannot cycle on any rank count
            for i in 0..size {
                for j in (i + 1)..size {
                    if me == i {
                        if !send[j as usize].is_empty() {
                            self.world.process_at_rank(j).synchronous_send_with_tag(
                                &send[j as usize][..],
                                TAG_A2A as Tag,
                            );
                        }
                        if incoming[j as usize] > 0 {
                            recv[j as usize] = self.recv_bytes(j, TAG_A2A);
                        }
                    } else if me == j {
                        if incoming[i as usize] > 0 {
                            recv[i as usize] = self.recv_bytes(i, TAG_A2A);
                        }
                        if !send[i as usize].is_empty() {
                            self.world.process_at_rank(i).synchronous_send_with_tag(
                                &send[i as usize][..],
                                TAG_A2A as Tag,
                            );
                        }
                    }
                }
            }
        } else {
            // shifted ring: in step s every rank sends to me + s and
            // receives from me - s, covering every pair for any rank count
            for step in 1..size {
                let dst = (me + step) % size;
                let src = (me + size - step) % size;
                mpi::request::scope(|scope| {
                    let sreq = if !send[dst as usize].is_empty() {
                        Some(self.world.process_at_rank(dst).immediate_send_with_tag(
                            scope,
                            &send[dst as usize][..],
                            TAG_A2A as Tag,
                        ))
                    } else {
                        None
                    };
                    if incoming[src as usize] > 0 {
                        recv[src as usize] = self.recv_bytes(src, TAG_A2A);
                    }
                    if let Some(req) = sreq {
                        req.wait();
                    }
                });
            }
        }
        recv
    }

    fn broadcast_bytes(&self, root: i32, data: &mut Vec<u8>) {
        let root_proc = self.world.process_at_rank(root);
        let mut len = data.len() as u64;
        root_proc.broadcast_into(&mut len);
        data.resize(len as usize, 0);
        if len > 0 {
            root_proc.broadcast_into(&mut data[..]);
        }
    }

    fn all_gather_i64(&self, value: i64) -> Vec<i64> {
        let mut out = vec![0i64; self.size() as usize];
        self.world.all_gather_into(&value, &mut out[..]);
        out
    }

    fn all_reduce_sum_i64(&self, value: i64) -> i64 {
        let mut out = 0i64;
        self.world
            .all_reduce_into(&value, &mut out, SystemOperation::sum());
        out
    }

    fn all_reduce_sum_f64(&self, value: f64) -> f64 {
        let mut out = 0f64;
        self.world
            .all_reduce_into(&value, &mut out, SystemOperation::sum());
        out
    }

    fn all_reduce_sum_i64_slice(&self, values: &[i64]) -> Vec<i64> {
        let mut out = vec![0i64; values.len()];
        self.world
            .all_reduce_into(values, &mut out[..], SystemOperation::sum());
        out
    }

    fn all_reduce_sum_f64_slice(&self, values: &[f64]) -> Vec<f64> {
        let mut out = vec![0f64; values.len()];
        self.world
            .all_reduce_into(values, &mut out[..], SystemOperation::sum());
        out
    }

    fn all_reduce_or(&self, value: bool) -> bool {
        let mut out = 0i32;
        self.world
            .all_reduce_into(&(value as i32), &mut out, SystemOperation::logical_or());
        out != 0
    }

    fn abort(&self, why: &str) -> ! {
        eprintln!("rank {}: {}", self.rank(), why);
        self.world.abort(1)
    }
}
