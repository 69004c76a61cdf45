//! Compare the distributed multipole gravity against the O(N²) direct
//! sum gathered on root.

use mpi::traits::Communicator;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use sphtree::constants::DIMENSION;
use sphtree::fmm::direct_gravity;
use sphtree::geometry;
use sphtree::tools::gather_to_root;
use sphtree::{Body, ParticleSystem, SimParams};

pub fn main() {
    env_logger::init();
    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank();

    let n_per_rank: u64 = 1000;
    let mut rng = ChaCha8Rng::seed_from_u64(7 + rank as u64);

    let bodies: Vec<Body> = (0..n_per_rank)
        .map(|i| {
            let mut p = [0.0; DIMENSION];
            for c in p.iter_mut() {
                *c = rng.gen_range(0.0..1.0);
            }
            Body::new((rank as u64) << 32 | i, p, rng.gen_range(0.5..1.5), 0.02)
        })
        .collect();

    // Single-particle leaves keep the near field exact; the error is
    // carried by the MAC-accepted far cells alone.
    let params = SimParams::from_toml_str(
        "max_leaf_size = 1\ncoarsen_threshold = 0\nmac_angle = 0.2\n",
    )
    .unwrap();
    let mut system = ParticleSystem::new(bodies, params, &world).unwrap();

    system.update_iteration(&world);
    system.gravitation_fmm(&world);

    if let Some(mut all) = gather_to_root(system.bodies(), &world) {
        let mut reference = all.clone();
        direct_gravity(&mut reference);

        all.sort_by_key(|b| b.id);
        reference.sort_by_key(|b| b.id);

        let mut max_rel = 0.0_f64;
        let mut mean_rel = 0.0_f64;
        for (fmm, direct) in all.iter().zip(reference.iter()) {
            let rel = geometry::distance(fmm.gravity, direct.gravity)
                / geometry::norm(direct.gravity).max(1e-12);
            max_rel = max_rel.max(rel);
            mean_rel += rel;
        }
        mean_rel /= all.len() as f64;

        println!(
            "fmm accuracy over {} bodies: max {:.3e}, mean {:.3e}",
            all.len(),
            max_rel,
            mean_rel
        );
        assert!(max_rel < 1e-2, "max relative error {}", max_rel);
        assert!(mean_rel < 2e-3, "mean relative error {}", mean_rel);
        println!("fmm demo passed");
    }
}
