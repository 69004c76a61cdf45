//! Distributed sample sort of the particle set.
//!
//! After the sort every rank owns a key-contiguous, target-balanced
//! segment of the global particle set, ordered by `(key, id)`. Equal
//! keys are legal (coincident positions); equal `(key, id)` pairs are
//! a programmer error.

use itertools::Itertools;
use log::{debug, info};
use mpi::traits::{Communicator, CommunicatorCollectives, Equivalence, Root};

use crate::body::Body;
use crate::morton::MortonKey;
use crate::tools::{gather_to_all, gather_to_root, redistribute};

/// A splitter: the `(key, id)` pair the buckets are cut at. Carrying
/// the id keeps the cut deterministic when every key collides (all
/// particles in one voxel).
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Equivalence)]
struct SplitPoint {
    key: MortonKey,
    id: u64,
}

impl SplitPoint {
    fn of(body: &Body) -> Self {
        Self {
            key: body.key,
            id: body.id,
        }
    }
}

/// Sort the distributed particle set by `(key, id)`.
///
/// Keys must have been recomputed for the current range. `sample_bytes`
/// bounds the per-rank sample volume shipped to root for splitter
/// selection.
pub fn distributed_sort<C: CommunicatorCollectives>(
    bodies: &mut Vec<Body>,
    sample_bytes: usize,
    comm: &C,
) {
    let size = comm.size() as usize;
    let rank = comm.rank();

    // Local sort first; sampling and bucketing below rely on it.
    bodies.sort_unstable_by_key(Body::sort_key);

    if size == 1 {
        assert_no_duplicates(bodies, rank);
        return;
    }

    // Regularly spaced samples, capped by the configured sample volume.
    let nsample = (sample_bytes / std::mem::size_of::<SplitPoint>())
        .min(bodies.len())
        .max(usize::from(!bodies.is_empty()));
    let samples: Vec<SplitPoint> = if nsample == 0 {
        Vec::new()
    } else {
        let stride = bodies.len() / nsample;
        (0..nsample)
            .map(|i| SplitPoint::of(&bodies[i * stride]))
            .collect()
    };

    // Root sorts the sample union and cuts it at evenly spaced ranks.
    let gathered = gather_to_root(&samples, comm);
    let mut splitters = vec![SplitPoint::default(); size - 1];
    if let Some(mut all_samples) = gathered {
        assert!(
            !all_samples.is_empty(),
            "splitter selection with an empty global sample set"
        );
        all_samples.sort_unstable();
        let chunk = (all_samples.len() / size).max(1);
        for (i, splitter) in splitters.iter_mut().enumerate() {
            *splitter = all_samples[((i + 1) * chunk).min(all_samples.len() - 1)];
        }
    }
    comm.process_at_rank(0).broadcast_into(&mut splitters[..]);

    // Bucketize the already-sorted local set: one linear walk with an
    // advancing splitter cursor.
    let mut counts = vec![0_i32; size];
    let mut bucket = 0;
    for body in bodies.iter() {
        let point = SplitPoint::of(body);
        while bucket < size - 1 && point >= splitters[bucket] {
            bucket += 1;
        }
        counts[bucket] += 1;
    }
    debug!("rank {}: sort buckets {:?}", rank, counts);

    // Exchange the buckets and own the result.
    *bodies = redistribute(bodies, &counts, comm);
    bodies.sort_unstable_by_key(Body::sort_key);

    assert_no_duplicates(bodies, rank);

    let repartition = gather_to_all(&[bodies.len() as u64], comm);
    if rank == 0 {
        info!("sort repartition: {:?}", repartition);
    }
}

fn assert_no_duplicates(bodies: &[Body], rank: i32) {
    for (a, b) in bodies.iter().tuple_windows() {
        assert!(
            a.sort_key() < b.sort_key(),
            "rank {}: duplicate (key, id) pair for particle {}",
            rank,
            b.id
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::DIMENSION;
    use crate::geometry::DomainRange;

    fn keyed_bodies(positions: &[f64]) -> Vec<Body> {
        let range = DomainRange::new([0.0; DIMENSION], [1.0; DIMENSION]);
        positions
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let mut b = Body::new(i as u64, [x; DIMENSION], 1.0, 0.1);
                b.set_key(&range);
                b
            })
            .collect()
    }

    #[test]
    fn test_sort_key_orders_by_key_then_id() {
        let bodies = keyed_bodies(&[0.9, 0.1, 0.5]);
        let mut sorted = bodies.clone();
        sorted.sort_unstable_by_key(Body::sort_key);
        let ids: Vec<u64> = sorted.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![1, 2, 0]);
    }

    #[test]
    fn test_id_tie_break_for_coincident_positions() {
        // Same voxel, same key: ids alone decide the order and keep the
        // sequence strictly increasing.
        let bodies = keyed_bodies(&[0.5, 0.5, 0.5, 0.5]);
        let mut sorted = bodies;
        sorted.sort_unstable_by_key(Body::sort_key);
        for pair in sorted.windows(2) {
            assert!(pair[0].sort_key() < pair[1].sort_key());
        }
    }

    #[test]
    fn test_local_sort_idempotent() {
        let mut bodies = keyed_bodies(&[0.3, 0.8, 0.1, 0.6, 0.2]);
        bodies.sort_unstable_by_key(Body::sort_key);
        let once: Vec<u64> = bodies.iter().map(|b| b.id).collect();
        bodies.sort_unstable_by_key(Body::sort_key);
        let twice: Vec<u64> = bodies.iter().map(|b| b.id).collect();
        assert_eq!(once, twice);
    }

    #[test]
    #[should_panic]
    fn test_duplicate_key_id_asserts() {
        let mut bodies = keyed_bodies(&[0.5, 0.5]);
        bodies[1].id = bodies[0].id;
        bodies.sort_unstable_by_key(Body::sort_key);
        assert_no_duplicates(&bodies, 0);
    }
}
