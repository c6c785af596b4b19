//! Domain decomposition and particle exchange for distributed cosmological
//! N-body simulation.
//!
//! Simulation space is partitioned along a Peano-Hilbert curve: a shallow
//! global octree over key space is built in parallel, its leaves are sliced
//! into work-balanced segments assigned to ranks, and particles migrate to
//! their assigned rank through budgeted all-to-all rounds. The auxiliary
//! gas and black-hole tables follow their base entries through migration
//! without losing index-based cross-references.
//!
//! The transport is pluggable: real MPI behind the `mpi` feature, or an
//! in-process thread cluster for tests and single-node runs.

use std::error::Error;
use std::fmt;

pub mod comm;
pub mod constants;
pub mod domain;
pub mod particle;
pub mod peano;
pub mod setup;

pub use domain::{Domain, DomainParams};
pub use particle::ParticleStore;

pub enum DomainError {
    /// Top-node allocator exhausted; the decomposition restarts with a
    /// larger budget.
    TopNodeBudget,
    /// No split of the leaf sequence keeps every rank under `MaxPart`.
    MemoryCeiling { task: usize, needed: i64, limit: usize },
    /// Inbound particles cannot be made to fit within the shedding limit,
    /// or the transfer budget cannot hold a single particle.
    ExchangeOverflow(String),
    /// The distributed state is inconsistent; not recoverable.
    Corruption(&'static str),
    /// A particle table would exceed its allocation.
    StoreFull {
        what: &'static str,
        n: usize,
        max: usize,
    },
}

impl fmt::Debug for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use DomainError::*;
        match self {
            TopNodeBudget => write!(f, "out of top-tree nodes"),
            MemoryCeiling { task, needed, limit } => write!(
                f,
                "no decomposition stays within memory bounds: task {} would hold {} particles (limit {})",
                task, needed, limit
            ),
            ExchangeOverflow(s) => write!(f, "particle exchange failed: {}", s),
            Corruption(s) => write!(f, "corrupted decomposition state: {}", s),
            StoreFull { what, n, max } => {
                write!(f, "table overflow: {} would hold {} entries (limit {})", what, n, max)
            }
        }
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for DomainError {}
