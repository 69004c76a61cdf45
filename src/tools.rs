//! Helpers around the MPI collectives.
//!
//! Every payload that crosses a rank boundary here is one of the
//! engine's POD records (bodies, summaries, splitters, sink cells), all
//! of which are cheap to default-construct. The varcount receives
//! therefore work on default-filled buffers that the collective
//! overwrites, instead of juggling uninitialized memory.

use mpi::{
    collective::SystemOperation,
    datatype::{Partition, PartitionMut},
    traits::{Communicator, CommunicatorCollectives, Equivalence, Root},
};

/// Exclusive prefix sum of per-rank counts: the displacement vector the
/// varcount collectives expect. For counts `[3, 4, 5]` the result is
/// `[0, 3, 7]`.
pub fn displacements(counts: &[i32]) -> Vec<i32> {
    let mut offsets = Vec::with_capacity(counts.len());
    let mut running = 0;
    for &count in counts {
        offsets.push(running);
        running += count;
    }
    offsets
}

/// Announce to every rank how many elements each rank contributes.
fn share_counts<C: CommunicatorCollectives>(local: usize, comm: &C) -> Vec<i32> {
    let mut counts = vec![0_i32; comm.size() as usize];
    comm.all_gather_into(&(local as i32), &mut counts);
    counts
}

/// Concatenate the per-rank slices of a distributed array onto every
/// rank, in rank order.
pub fn gather_to_all<T, C>(local: &[T], comm: &C) -> Vec<T>
where
    T: Equivalence + Default + Clone,
    C: CommunicatorCollectives,
{
    let counts = share_counts(local.len(), comm);
    let offsets = displacements(&counts);
    let total = counts.iter().sum::<i32>() as usize;

    let mut gathered = vec![T::default(); total];
    let mut target = PartitionMut::new(&mut gathered[..], counts, &offsets[..]);
    comm.all_gather_varcount_into(local, &mut target);
    drop(target);

    gathered
}

/// Concatenate a distributed array on rank 0; every other rank gets
/// `None`.
pub fn gather_to_root<T, C>(local: &[T], comm: &C) -> Option<Vec<T>>
where
    T: Equivalence + Default + Clone,
    C: CommunicatorCollectives,
{
    let root = comm.process_at_rank(0);
    let contribution = local.len() as i32;

    if comm.rank() != 0 {
        root.gather_into(&contribution);
        root.gather_varcount_into(local);
        return None;
    }

    let mut counts = vec![0_i32; comm.size() as usize];
    root.gather_into_root(&contribution, &mut counts);
    let offsets = displacements(&counts);
    let total = counts.iter().sum::<i32>() as usize;

    let mut gathered = vec![T::default(); total];
    let mut target = PartitionMut::new(&mut gathered[..], counts, &offsets[..]);
    root.gather_varcount_into_root(local, &mut target);
    drop(target);

    Some(gathered)
}

/// Redistribute an array via an `Alltoallv`, sending `counts[j]`
/// consecutive elements to rank `j`. The sort sends bodies through
/// this, the branch exchange sends summaries.
pub fn redistribute<T, C>(outgoing: &[T], counts: &[i32], comm: &C) -> Vec<T>
where
    T: Equivalence + Default + Clone,
    C: CommunicatorCollectives,
{
    debug_assert_eq!(counts.len(), comm.size() as usize);
    debug_assert_eq!(counts.iter().sum::<i32>() as usize, outgoing.len());

    // Every rank learns what it will receive from each peer.
    let mut incoming = vec![0_i32; comm.size() as usize];
    comm.all_to_all_into(counts, &mut incoming);

    let outgoing_offsets = displacements(counts);
    let incoming_offsets = displacements(&incoming);
    let total = incoming.iter().sum::<i32>() as usize;

    let mut received = vec![T::default(); total];
    let source = Partition::new(outgoing, counts.to_vec(), &outgoing_offsets[..]);
    let mut target = PartitionMut::new(&mut received[..], incoming, &incoming_offsets[..]);
    comm.all_to_all_varcount_into(&source, &mut target);
    drop(target);

    received
}

/// Global number of elements of a distributed array.
pub fn global_count<T, C: CommunicatorCollectives>(arr: &[T], comm: &C) -> u64 {
    let local = arr.len() as u64;
    let mut global = 0_u64;
    comm.all_reduce_into(&local, &mut global, SystemOperation::sum());
    global
}

/// Global sum of a scalar.
pub fn global_sum<C: CommunicatorCollectives>(value: f64, comm: &C) -> f64 {
    let mut global = 0.0;
    comm.all_reduce_into(&value, &mut global, SystemOperation::sum());
    global
}

/// Global maximum of a scalar.
pub fn global_max<C: CommunicatorCollectives>(value: f64, comm: &C) -> f64 {
    let mut global = 0.0;
    comm.all_reduce_into(&value, &mut global, SystemOperation::max());
    global
}

/// Global minimum of a scalar.
pub fn global_min<C: CommunicatorCollectives>(value: f64, comm: &C) -> f64 {
    let mut global = 0.0;
    comm.all_reduce_into(&value, &mut global, SystemOperation::min());
    global
}

#[cfg(test)]
mod test {
    use super::displacements;

    #[test]
    fn test_displacements() {
        assert_eq!(displacements(&[3, 4, 5]), vec![0, 3, 7]);
        assert_eq!(displacements(&[0, 0, 2]), vec![0, 0, 0]);
        assert!(displacements(&[]).is_empty());
    }
}
