//! Branch and ghost exchange.
//!
//! Three collective protocols keep every rank's tree usable as if it
//! owned the whole domain:
//!
//! 1. every rank publishes the part of its particle set that falls in a
//!    peer's padded bounding box as `{key, id, position, mass, owner}`
//!    summaries, inserted on the receiving side as NONLOCAL entities;
//! 2. every rank enumerates, from the augmented tree, which of its
//!    particles peers need as ghosts and which remote particles it
//!    needs itself, and exchanges the full particle payloads once;
//! 3. a cheap refresh replays the payload exchange each physics
//!    sub-step, reusing the enumeration order so no topology has to be
//!    rediscovered.

use std::collections::BTreeSet;

use log::{debug, info};
use mpi::traits::{Communicator, CommunicatorCollectives};

use crate::body::{Body, BodySummary, Locality};
use crate::constants::DIMENSION;
use crate::geometry::DomainRange;
use crate::morton::MortonKey;
use crate::tools::{displacements, redistribute};
use mpi::datatype::{Partition, PartitionMut};

/// Global bounding range of the particle set, padded outward by `pad`
/// (the callers pass `2 h_max`). This is the key range of every tree.
pub fn compute_range<C: CommunicatorCollectives>(
    bodies: &[Body],
    pad: f64,
    comm: &C,
) -> DomainRange {
    let mut local_min = [f64::MAX; DIMENSION];
    let mut local_max = [f64::MIN; DIMENSION];
    for body in bodies {
        for d in 0..DIMENSION {
            local_min[d] = local_min[d].min(body.coordinates[d]);
            local_max[d] = local_max[d].max(body.coordinates[d]);
        }
    }

    let mut global_min = [0.0; DIMENSION];
    let mut global_max = [0.0; DIMENSION];
    comm.all_reduce_into(
        &local_min[..],
        &mut global_min[..],
        mpi::collective::SystemOperation::min(),
    );
    comm.all_reduce_into(
        &local_max[..],
        &mut global_max[..],
        mpi::collective::SystemOperation::max(),
    );

    DomainRange::new(global_min, global_max).padded(pad)
}

/// Every rank's own particle bounding box, padded by `pad`, gathered to
/// all ranks. Entry `j` tells this rank which region rank `j` will ask
/// about.
pub fn exchange_rank_boxes<C: CommunicatorCollectives>(
    bodies: &[Body],
    pad: f64,
    comm: &C,
) -> Vec<DomainRange> {
    let local = DomainRange::from_points(bodies.iter().map(|b| &b.coordinates)).padded(pad);
    let mut boxes = vec![DomainRange::default(); comm.size() as usize];
    comm.all_gather_into(&local, &mut boxes);
    boxes
}

/// Publish local particles intersecting each peer's box and insert the
/// received summaries as NONLOCAL entities.
///
/// The caller must re-run the post-order COM traversal afterwards so
/// the new entities show up in the aggregates.
pub fn exchange_branches<C: CommunicatorCollectives>(
    tree: &mut crate::tree::Tree,
    rank_boxes: &[DomainRange],
    comm: &C,
) {
    let rank = comm.rank();
    let size = comm.size() as usize;

    let mut sendbuffer = Vec::<BodySummary>::new();
    let mut sendcount = vec![0_i32; size];

    for (j, peer_box) in rank_boxes.iter().enumerate() {
        if j == rank as usize {
            continue;
        }
        let hits = tree.find_in_box(peer_box.min(), peer_box.max());
        for e in hits {
            let entity = tree.entity(e);
            if !entity.is_local() {
                continue;
            }
            sendcount[j] += 1;
            sendbuffer.push(BodySummary {
                key: entity.key(),
                id: entity.global_id(),
                coordinates: entity.coordinates(),
                mass: entity.mass(),
                owner: rank,
            });
        }
    }

    let recvbuffer = redistribute(&sendbuffer, &sendcount, comm);
    debug!(
        "rank {}: branch exchange sent {} received {}",
        rank,
        sendbuffer.len(),
        recvbuffer.len()
    );

    for summary in &recvbuffer {
        assert!(summary.owner != rank, "rank {}: summary from self", rank);
        let e = tree.make_entity(
            summary.coordinates,
            summary.mass,
            summary.id,
            summary.owner,
            Locality::NonLocal,
            crate::tree::BodySlot::None,
        );
        tree.insert(e);
    }

    if rank == 0 {
        info!("branch exchange done");
    }
}

/// Per-peer ghost topology and the buffers replayed by the refresh.
///
/// `compute` fixes, for one step, which local bodies go to which peer
/// and which tree entities the incoming payload binds to; both sides
/// enumerate in `(key, id)` order, so the linkage needs no further
/// negotiation. `refresh` only moves payload.
#[derive(Default)]
pub struct GhostExchange {
    /// Local body indices to send, concatenated peer by peer.
    send_slots: Vec<usize>,
    send_counts: Vec<i32>,
    recv_counts: Vec<i32>,
    send_buffer: Vec<Body>,
    recv_buffer: Vec<Body>,
}

impl GhostExchange {
    /// Enumerate ghosts on the augmented tree and run the first
    /// payload exchange.
    ///
    /// `radius` is the interaction reach, `support × h_max`. For every
    /// local particle, any non-local neighbor within the radius means
    /// the particle must travel to the neighbor's owner and the
    /// neighbor must arrive from there. Both directions are
    /// deduplicated per peer.
    pub fn compute<C: CommunicatorCollectives>(
        &mut self,
        tree: &mut crate::tree::Tree,
        locals: &[Body],
        radius: f64,
        comm: &C,
    ) {
        let rank = comm.rank();
        let size = comm.size() as usize;

        // (key, id, index) sets: the BTreeSet order is the wire order.
        let mut send_sets: Vec<BTreeSet<(MortonKey, u64, usize)>> = vec![BTreeSet::new(); size];
        let mut recv_sets: Vec<BTreeSet<(MortonKey, u64, usize)>> = vec![BTreeSet::new(); size];

        for e in 0..tree.entities().len() {
            let entity = tree.entity(e);
            if !entity.is_local() {
                continue;
            }
            debug_assert_eq!(entity.owner(), rank);
            let crate::tree::BodySlot::Local(local_index) = entity.slot() else {
                panic!("rank {}: local entity without body index", rank);
            };
            let neighbors = tree.find_in_radius(entity.coordinates(), radius);
            for n in neighbors {
                let other = tree.entity(n);
                if other.is_local() {
                    continue;
                }
                let owner = other.owner() as usize;
                // The global h_max padding makes this symmetric: the
                // owner enumerates the mirrored pair.
                send_sets[owner].insert((entity.key(), entity.global_id(), local_index));
                recv_sets[owner].insert((other.key(), other.global_id(), n));
            }
        }

        self.send_counts = send_sets.iter().map(|s| s.len() as i32).collect();
        let expected_recv: Vec<i32> = recv_sets.iter().map(|s| s.len() as i32).collect();

        // Peers report what they will send; that must be exactly what
        // the local enumeration expects, or the protocol is broken.
        self.recv_counts = vec![0_i32; size];
        comm.all_to_all_into(&self.send_counts, &mut self.recv_counts);
        assert_eq!(
            self.recv_counts, expected_recv,
            "rank {}: ghost counts disagree with peer enumeration",
            rank
        );

        self.send_slots = send_sets
            .iter()
            .flat_map(|set| set.iter().map(|&(_, _, index)| index))
            .collect();

        let total_send: i32 = self.send_counts.iter().sum();
        let total_recv: i32 = self.recv_counts.iter().sum();
        self.send_buffer = vec![Body::default(); total_send as usize];
        self.recv_buffer = vec![Body::default(); total_recv as usize];

        // Bind the incoming slots to the tree: peer by peer, in the
        // shared (key, id) order. Mark the bound entities and the
        // exported locals.
        let mut slot = 0;
        for set in &recv_sets {
            for &(_, _, entity_index) in set {
                let entity = tree.entity_mut(entity_index);
                entity.set_locality(Locality::Ghost);
                entity.set_slot(crate::tree::BodySlot::Ghost(slot));
                slot += 1;
            }
        }
        let shared: BTreeSet<usize> = send_sets
            .iter()
            .flat_map(|set| set.iter().map(|&(_, _, index)| index))
            .collect();
        for e in 0..tree.entities().len() {
            let entity = tree.entity(e);
            if let crate::tree::BodySlot::Local(i) = entity.slot() {
                if entity.locality() == Locality::Local && shared.contains(&i) {
                    tree.entity_mut(e).set_locality(Locality::Shared);
                }
            }
        }

        if rank == 0 {
            info!(
                "ghost exchange: {} out, {} in on rank 0",
                total_send, total_recv
            );
        }

        self.refresh(locals, comm);
    }

    /// Replay the payload exchange: repack the send buffer in the
    /// enumeration order and overwrite the ghost bodies in place.
    pub fn refresh<C: CommunicatorCollectives>(&mut self, locals: &[Body], comm: &C) {
        for (buffer, &index) in self.send_buffer.iter_mut().zip(self.send_slots.iter()) {
            *buffer = locals[index];
        }

        let send_displs = displacements(&self.send_counts);
        let recv_displs = displacements(&self.recv_counts);
        let partition = Partition::new(&self.send_buffer[..], self.send_counts.clone(), &send_displs[..]);
        let mut recv_partition = PartitionMut::new(
            &mut self.recv_buffer[..],
            self.recv_counts.clone(),
            &recv_displs[..],
        );
        comm.all_to_all_varcount_into(&partition, &mut recv_partition);
    }

    /// The ghost bodies received last refresh, in linkage order.
    pub fn ghosts(&self) -> &[Body] {
        &self.recv_buffer
    }

    /// Number of ghosts this rank imports.
    pub fn num_ghosts(&self) -> usize {
        self.recv_buffer.len()
    }
}
