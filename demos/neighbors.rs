//! Branch- and ghost-exchange stress test: the distributed neighbor
//! count within the kernel support must equal the count computed from
//! the gathered global particle set.

use mpi::traits::Communicator;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicU64, Ordering};

use sphtree::constants::DIMENSION;
use sphtree::geometry;
use sphtree::tools::{gather_to_root, global_sum};
use sphtree::{Body, ParticleSystem, SimParams};

pub fn main() {
    env_logger::init();
    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank();

    let n_per_rank: u64 = 2000;
    let h = 0.02;
    let mut rng = ChaCha8Rng::seed_from_u64(100 + rank as u64);

    let bodies: Vec<Body> = (0..n_per_rank)
        .map(|i| {
            let mut p = [0.0; DIMENSION];
            for c in p.iter_mut() {
                *c = rng.gen_range(0.0..1.0);
            }
            Body::new((rank as u64) << 32 | i, p, 1.0, h)
        })
        .collect();

    let params = SimParams::default();
    let support = params.kernel_support;
    let mut system = ParticleSystem::new(bodies, params, &world).unwrap();
    system.update_iteration(&world);

    // Distributed count: sum of neighbor-list lengths over all local
    // particles, self included.
    let counted = AtomicU64::new(0);
    system.apply_in_smoothinglength(|_, neighbors| {
        counted.fetch_add(neighbors.len() as u64, Ordering::Relaxed);
    });
    let distributed = global_sum(counted.load(Ordering::Relaxed) as f64, &world) as u64;

    // Reference count over the gathered global set on root.
    let all = gather_to_root(system.bodies(), &world);
    if let Some(all) = all {
        let mut reference = 0_u64;
        for a in &all {
            for b in &all {
                let radius = support * a.smoothing_length.max(b.smoothing_length);
                if geometry::within(b.coordinates, a.coordinates, radius) {
                    reference += 1;
                }
            }
        }
        assert_eq!(
            distributed, reference,
            "distributed neighbor count {} != reference {}",
            distributed, reference
        );
        println!(
            "neighbor demo passed: {} pairs over {} bodies",
            reference,
            all.len()
        );
    }
}
