use std::error::Error;
use std::path::PathBuf;

use bytemuck::Zeroable;
use indicatif::FormattedDuration;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use domdec::comm::Communicator;
use domdec::constants::{TYPE_BH, TYPE_DM, TYPE_GAS};
use domdec::domain::{self, Domain, DomainParams};
use domdec::particle::{GasSlot, Particle, ParticleStore};
use domdec::setup::{Configuration, InputError};
use domdec::DomainError;

#[derive(Clone)]
enum Profile {
    Uniform,
    Cluster,
}

#[derive(Clone)]
struct RunConfig {
    params: DomainParams,
    part_alloc_factor: f64,
    npart_gas: u64,
    npart_dm: u64,
    npart_bh: u64,
    seed: u64,
    profile: Profile,
    cluster_radius: f64,
    n_decomp: usize,
}

fn read_run_config(input: &Configuration) -> Result<RunConfig, InputError> {
    let params = DomainParams {
        box_size: input.real("domain", "box_size")?,
        over_decomp: input.integer("domain", "over_decomposition").unwrap_or(1).max(1) as usize,
        topnode_alloc_factor: input.real("domain", "topnode_alloc_factor").unwrap_or(1.0),
        free_bytes: input.real("domain", "free_bytes").unwrap_or((256 << 20) as f64) as usize,
        no_isend_irecv: input.bool("domain", "no_isend_irecv").unwrap_or(false),
    };
    let profile = match input.string("ic", "profile").as_deref() {
        Ok("cluster") => Profile::Cluster,
        _ => Profile::Uniform,
    };
    Ok(RunConfig {
        params,
        part_alloc_factor: input.real("domain", "part_alloc_factor").unwrap_or(1.5),
        npart_gas: input.integer("ic", "npart_gas").unwrap_or(0) as u64,
        npart_dm: input.integer("ic", "npart_dm").unwrap_or(0) as u64,
        npart_bh: input.integer("ic", "npart_bh").unwrap_or(0) as u64,
        seed: input.integer("ic", "seed").unwrap_or(42) as u64,
        profile,
        cluster_radius: input.real("ic", "cluster_radius").unwrap_or(0.1),
        n_decomp: input.integer("control", "n_decompositions").unwrap_or(1).max(1) as usize,
    })
}

/// The initial conditions are a function of the global particle index
/// alone, so every rank count produces the same population.
fn generate_ics<C: Communicator>(comm: &C, cfg: &RunConfig) -> Result<ParticleStore, DomainError> {
    let ntask = comm.size() as u64;
    let me = comm.rank() as u64;
    let total = cfg.npart_gas + cfg.npart_dm + cfg.npart_bh;
    let lo = me * total / ntask;
    let hi = (me + 1) * total / ntask;

    let max_part = ((cfg.part_alloc_factor * total as f64 / ntask as f64).ceil() as usize).max(8);
    let max_part_bh =
        (cfg.part_alloc_factor * cfg.npart_bh as f64 / ntask as f64).ceil() as usize + 2;
    let mut store = ParticleStore::new(max_part, max_part_bh);

    let box_size = cfg.params.box_size;
    for gid in lo..hi {
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed ^ gid.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        let pos = match cfg.profile {
            Profile::Uniform => [
                rng.gen::<f64>() * box_size,
                rng.gen::<f64>() * box_size,
                rng.gen::<f64>() * box_size,
            ],
            Profile::Cluster => loop {
                let v = [
                    2.0 * rng.gen::<f64>() - 1.0,
                    2.0 * rng.gen::<f64>() - 1.0,
                    2.0 * rng.gen::<f64>() - 1.0,
                ];
                if v[0] * v[0] + v[1] * v[1] + v[2] * v[2] <= 1.0 {
                    break [
                        0.5 * box_size + cfg.cluster_radius * v[0],
                        0.5 * box_size + cfg.cluster_radius * v[1],
                        0.5 * box_size + cfg.cluster_radius * v[2],
                    ];
                }
            },
        };

        let mut p = Particle::zeroed();
        p.id = gid + 1;
        p.mass = 1.0;
        p.pos = pos;
        if gid < cfg.npart_gas {
            p.ptype = TYPE_GAS;
            store.push_gas(
                p,
                GasSlot {
                    id: p.id,
                    entropy: 1.0,
                    density: 0.0,
                    hsml: 0.0,
                },
            )?;
        } else if gid < cfg.npart_gas + cfg.npart_dm {
            p.ptype = TYPE_DM;
            store.push(p)?;
        } else {
            p.ptype = TYPE_BH;
            store.push(p)?;
        }
    }
    Ok(store)
}

fn run<C: Communicator>(comm: &C, cfg: &RunConfig) -> Result<(), DomainError> {
    let mut store = generate_ics(comm, cfg)?;
    let mut domain = Domain::new(cfg.params.clone());

    if comm.rank() == 0 {
        println!(
            "running on {} ranks with {} threads per rank...",
            comm.size(),
            rayon::current_num_threads()
        );
    }

    let runtime = std::time::Instant::now();
    for i in 0..cfg.n_decomp {
        domain.decompose(comm, &mut store)?;
        if comm.rank() == 0 {
            println!(
                "decomposition {: >3}: {} exchange rounds, {} particles moved, \
                 work imbalance = {:.3}, load imbalance = {:.3}{}, RT = {}",
                i,
                domain.stats.rounds,
                domain.stats.moved,
                domain.balance.max_work / domain.balance.avg_work.max(f64::MIN_POSITIVE),
                domain.balance.max_load as f64 / domain.balance.avg_load.max(f64::MIN_POSITIVE),
                if domain.used_load_fallback {
                    " (count-balanced fallback)"
                } else {
                    ""
                },
                FormattedDuration(runtime.elapsed())
            );
        }
    }

    domain::test_id_uniqueness(comm, &store)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    let path = args
        .get(1)
        .ok_or(InputError::InvalidInputFile("no file supplied"))?;
    let path = PathBuf::from(path);

    let mut input = Configuration::from_file(&path)?;
    input.with_context("constants");
    let cfg = read_run_config(&input)?;

    #[cfg(feature = "mpi")]
    {
        let universe = mpi::initialize().unwrap();
        let world = universe.world();
        let comm = domdec::comm::mpi::MpiComm::new(world, cfg.params.no_isend_irecv);
        if let Err(e) = run(&comm, &cfg) {
            comm.abort(&format!("{}", e));
        }
    }

    #[cfg(not(feature = "mpi"))]
    {
        let ranks = input.integer("control", "ranks").unwrap_or(1).max(1) as usize;
        let cfg = &cfg;
        domdec::comm::LocalCluster::run(ranks, move |comm| {
            if let Err(e) = run(&comm, cfg) {
                comm.abort(&format!("{}", e));
            }
        });
    }

    Ok(())
}
