//! Test the distributed particle sort, including the degenerate case
//! of every particle sharing one position.

use itertools::Itertools;
use mpi::traits::Communicator;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use sphtree::constants::DIMENSION;
use sphtree::exchange::compute_range;
use sphtree::sort::distributed_sort;
use sphtree::tools::gather_to_root;
use sphtree::Body;

fn check_globally_sorted<C: mpi::traits::CommunicatorCollectives>(bodies: &[Body], comm: &C) {
    if let Some(all) = gather_to_root(bodies, comm) {
        for (a, b) in all.iter().tuple_windows() {
            assert!(a.sort_key() < b.sort_key());
        }
        println!("globally sorted: {} bodies", all.len());
    }
}

pub fn main() {
    env_logger::init();
    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank();

    let n_per_rank: u64 = 5000;
    let mut rng = ChaCha8Rng::seed_from_u64(rank as u64);

    // Random points in the unit cube.
    let mut bodies: Vec<Body> = (0..n_per_rank)
        .map(|i| {
            let mut p = [0.0; DIMENSION];
            for c in p.iter_mut() {
                *c = rng.gen_range(0.0..1.0);
            }
            Body::new((rank as u64) << 32 | i, p, 1.0, 0.05)
        })
        .collect();

    let range = compute_range(&bodies, 0.1, &world);
    for b in bodies.iter_mut() {
        b.set_key(&range);
    }
    distributed_sort(&mut bodies, 256 * 1024, &world);
    check_globally_sorted(&bodies, &world);

    // Degenerate case: every particle at the same position. The id
    // tie-break must still terminate with balanced counts.
    let mut degenerate: Vec<Body> = (0..n_per_rank)
        .map(|i| {
            let mut b = Body::new((rank as u64) << 32 | i, [0.5; DIMENSION], 1.0, 0.05);
            b.set_key(&range);
            b
        })
        .collect();
    distributed_sort(&mut degenerate, 256 * 1024, &world);
    assert!(!degenerate.is_empty());
    check_globally_sorted(&degenerate, &world);

    if rank == 0 {
        println!("sort demo passed");
    }
}
