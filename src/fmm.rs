//! Fast-multipole gravity evaluation.
//!
//! Barnes–Hut with a per-cell Taylor expansion: every rank publishes
//! its low-mass cells as sinks, every rank accumulates monopole
//! contributions (force, Jacobian, Hessian) for all global sinks from
//! its own tree, the accumulators are reduced onto the owning ranks,
//! and each owner pushes the expansion down to the local particles
//! below the sink plus the direct near-field sum inside the sink's
//! subtree.

use log::debug;
use mpi::datatype::{Partition, PartitionMut};
use mpi::traits::{Communicator, CommunicatorCollectives, Equivalence};
use rayon::prelude::*;

use crate::body::Body;
use crate::constants::{DIMENSION, NCHILDREN};
use crate::geometry::{add_scaled, distance, norm, sub, within_box, Coord, ZERO};
use crate::morton::MortonKey;
use crate::tools::{displacements, gather_to_all};
use crate::tree::{BodySlot, Tree};

/// A sink: one cell at which the multipole expansion is evaluated.
#[derive(Clone, Copy, Default, Equivalence)]
pub struct SinkCell {
    /// Branch key on the publishing rank.
    pub key: MortonKey,
    /// Center of mass of the cell.
    pub coordinates: Coord,
    /// Minimum corner of the cell bounding box.
    pub bmin: Coord,
    /// Maximum corner of the cell bounding box.
    pub bmax: Coord,
}

/// Accumulated monopole field at a sink center: force together with
/// its first and second derivatives with respect to the sink position.
#[derive(Clone, Copy, Default, Equivalence)]
pub struct SinkAccumulator {
    /// Force per unit mass at the sink center.
    pub fc: Coord,
    /// Jacobian of the force, row-major.
    pub jacobian: [f64; DIMENSION * DIMENSION],
    /// Hessian of the force, `[i][j][k]` flattened row-major.
    pub hessian: [f64; DIMENSION * DIMENSION * DIMENSION],
}

impl SinkAccumulator {
    fn add_assign(&mut self, other: &SinkAccumulator) {
        for d in 0..DIMENSION {
            self.fc[d] += other.fc[d];
        }
        for (a, b) in self.jacobian.iter_mut().zip(other.jacobian.iter()) {
            *a += b;
        }
        for (a, b) in self.hessian.iter_mut().zip(other.hessian.iter()) {
            *a += b;
        }
    }
}

#[inline]
fn kron(i: usize, j: usize) -> f64 {
    if i == j {
        1.0
    } else {
        0.0
    }
}

/// Multipole acceptance criterion: bounding-box diagonal over distance
/// to the sink must stay below the opening angle.
pub fn mac(sink: &SinkCell, source_bmin: Coord, source_bmax: Coord, source_pos: Coord, theta: f64) -> bool {
    let diag = distance(source_bmax, source_bmin);
    let dist = distance(sink.coordinates, source_pos);
    dist > 0.0 && diag / dist < theta
}

/// Monopole contribution of a point source to a sink accumulator.
///
/// With `Δ = p_sink − p_source` and `r = |Δ|`:
///
/// ```text
/// F      = −m Δ / r³
/// J_ij   = −m/r³ (δ_ij − 3 Δ_i Δ_j / r²)
/// H_ijk  = 3m/r⁵ (δ_ij Δ_k + δ_ik Δ_j + δ_jk Δ_i) − 15m Δ_i Δ_j Δ_k / r⁷
/// ```
///
/// The Hessian follows from differentiating `J` once more; the Taylor
/// push-down `g = F + JΔ' + ½Δ'ᵀHΔ'` is consistent with it.
pub fn accumulate_monopole(
    sink_pos: Coord,
    source_pos: Coord,
    mass: f64,
    acc: &mut SinkAccumulator,
) {
    let delta = sub(sink_pos, source_pos);
    let r = norm(delta);
    assert!(r > 0.0, "monopole contribution with zero separation");
    let r2 = r * r;
    let r3 = r2 * r;
    let r5 = r3 * r2;
    let r7 = r5 * r2;

    acc.fc = add_scaled(acc.fc, -mass / r3, delta);

    let jc = -mass / r3;
    for i in 0..DIMENSION {
        for j in 0..DIMENSION {
            acc.jacobian[i * DIMENSION + j] += jc * (kron(i, j) - 3.0 * delta[i] * delta[j] / r2);
        }
    }

    for i in 0..DIMENSION {
        for j in 0..DIMENSION {
            for k in 0..DIMENSION {
                let idx = (i * DIMENSION + j) * DIMENSION + k;
                acc.hessian[idx] += 3.0 * mass / r5
                    * (kron(i, j) * delta[k] + kron(i, k) * delta[j] + kron(j, k) * delta[i])
                    - 15.0 * mass * delta[i] * delta[j] * delta[k] / r7;
            }
        }
    }
}

/// Harvest the local sinks: every branch that is a leaf or whose
/// aggregated mass is at most `max_mass`. Empty branches are skipped.
pub fn collect_sink_cells(tree: &Tree, max_mass: f64) -> Vec<SinkCell> {
    let mut cells = Vec::new();
    let mut stack = vec![MortonKey::root()];
    while let Some(bid) = stack.pop() {
        let branch = tree.expect_branch(bid);
        if branch.mass() == 0.0 {
            continue;
        }
        if branch.is_leaf() || branch.mass() <= max_mass {
            cells.push(SinkCell {
                key: bid,
                coordinates: branch.coordinates(),
                bmin: branch.bmin(),
                bmax: branch.bmax(),
            });
        } else {
            for i in 0..NCHILDREN {
                stack.push(bid.push(i));
            }
        }
    }
    cells
}

/// Gather all sinks across all ranks. Returns the rank-major global
/// cell vector, identical on every rank, and the per-rank counts.
pub fn exchange_cells<C: CommunicatorCollectives>(
    tree: &Tree,
    max_mass: f64,
    comm: &C,
) -> (Vec<SinkCell>, Vec<i32>) {
    let local = collect_sink_cells(tree, max_mass);

    let mut counts = vec![0_i32; comm.size() as usize];
    comm.all_gather_into(&(local.len() as i32), &mut counts);

    let global = gather_to_all(&local, comm);
    debug!(
        "rank {}: {} local sinks, {} global",
        comm.rank(),
        local.len(),
        global.len()
    );
    (global, counts)
}

/// This rank's contribution to every global sink.
pub fn compute_contributions(tree: &Tree, cells: &[SinkCell], theta: f64) -> Vec<SinkAccumulator> {
    cells
        .par_iter()
        .map(|cell| {
            let mut acc = SinkAccumulator::default();
            cell_to_cell(tree, cell, MortonKey::root(), theta, &mut acc);
            acc
        })
        .collect()
}

/// True if the region `[inner_min, inner_max]` lies inside
/// `[outer_min, outer_max]` componentwise.
fn box_inside(inner_min: Coord, inner_max: Coord, outer_min: Coord, outer_max: Coord) -> bool {
    for d in 0..DIMENSION {
        if inner_min[d] < outer_min[d] || inner_max[d] > outer_max[d] {
            return false;
        }
    }
    true
}

fn cell_to_cell(tree: &Tree, sink: &SinkCell, bid: MortonKey, theta: f64, acc: &mut SinkAccumulator) {
    let source = tree.expect_branch(bid);
    if source.mass() == 0.0 {
        return;
    }
    // The sink's own region, or a region it already contains: both are
    // covered by the near-field sum of the push-down.
    if source.bmin() == sink.bmin && source.bmax() == sink.bmax {
        return;
    }
    if box_inside(source.bmin(), source.bmax(), sink.bmin, sink.bmax) {
        return;
    }

    if mac(sink, source.bmin(), source.bmax(), source.coordinates(), theta) {
        accumulate_monopole(sink.coordinates, source.coordinates(), source.mass(), acc);
    } else if source.is_leaf() {
        for &e in source.entities() {
            let entity = tree.entity(e);
            if !entity.is_local() {
                continue;
            }
            if within_box(entity.coordinates(), sink.bmin, sink.bmax) {
                continue;
            }
            accumulate_monopole(sink.coordinates, entity.coordinates(), entity.mass(), acc);
        }
    } else {
        for i in 0..NCHILDREN {
            let cid = bid.push(i);
            if tree.branch(cid).is_some() {
                cell_to_cell(tree, sink, cid, theta, acc);
            }
        }
    }
}

/// Reduce the per-rank contributions onto the owning ranks and push
/// each reduced expansion down to the local particles.
///
/// The `Alltoallv` sends each rank the slice of `contributions`
/// covering its own sinks; each rank therefore receives `size`
/// contiguous copies of its slice and sums them elementwise.
pub fn gather_cells<C: CommunicatorCollectives>(
    tree: &Tree,
    locals: &mut [Body],
    global_cells: &[SinkCell],
    counts: &[i32],
    contributions: &[SinkAccumulator],
    comm: &C,
) {
    let rank = comm.rank() as usize;
    let size = comm.size() as usize;

    let total: usize = counts.iter().sum::<i32>() as usize;
    assert_eq!(global_cells.len(), total, "sink cell count mismatch");
    assert_eq!(contributions.len(), total, "sink accumulator count mismatch");

    let offsets = displacements(counts);
    let ncells_own = counts[rank] as usize;
    let my_offset = offsets[rank] as usize;

    let recv_counts = vec![ncells_own as i32; size];
    let recv_displs = displacements(&recv_counts);
    let mut recvbuffer = vec![SinkAccumulator::default(); ncells_own * size];

    let partition = Partition::new(contributions, counts.to_vec(), &offsets[..]);
    let mut recv_partition =
        PartitionMut::new(&mut recvbuffer[..], recv_counts, &recv_displs[..]);
    comm.all_to_all_varcount_into(&partition, &mut recv_partition);

    let mut reduced: Vec<SinkAccumulator> = recvbuffer[..ncells_own].to_vec();
    for r in 1..size {
        for (j, acc) in reduced.iter_mut().enumerate() {
            acc.add_assign(&recvbuffer[r * ncells_own + j]);
        }
    }

    for (j, acc) in reduced.iter().enumerate() {
        let cell = &global_cells[my_offset + j];
        push_down(tree, locals, cell, acc);
    }
}

/// Taylor push-down of one sink onto the local particles below it,
/// followed by the direct near-field sum inside the sink subtree.
pub fn push_down(tree: &Tree, locals: &mut [Body], cell: &SinkCell, acc: &SinkAccumulator) {
    let mut subparts = Vec::new();
    cell_to_particles(tree, cell, acc, cell.key, locals, &mut subparts);
    assert!(
        !subparts.is_empty(),
        "sink {} has no local particles below it",
        cell.key
    );

    // Near field: the sink's own region was excluded from the
    // expansion, so its particles interact pairwise.
    for a in 0..subparts.len() {
        let i = subparts[a];
        let pos = locals[i].coordinates;
        let mut gravity = locals[i].gravity;
        for &j in &subparts {
            let d = distance(pos, locals[j].coordinates);
            if d > 0.0 {
                gravity = add_scaled(
                    gravity,
                    -locals[j].mass / (d * d * d),
                    sub(pos, locals[j].coordinates),
                );
            }
        }
        locals[i].gravity = gravity;
    }
}

fn cell_to_particles(
    tree: &Tree,
    cell: &SinkCell,
    acc: &SinkAccumulator,
    bid: MortonKey,
    locals: &mut [Body],
    subparts: &mut Vec<usize>,
) {
    let branch = tree.expect_branch(bid);
    if branch.mass() <= 0.0 {
        return;
    }
    if branch.is_leaf() {
        for &e in branch.entities() {
            let entity = tree.entity(e);
            if !entity.is_local() {
                continue;
            }
            let BodySlot::Local(i) = entity.slot() else {
                continue;
            };
            let delta = sub(entity.coordinates(), cell.coordinates);

            // g = F + J·Δ + ½·Δᵀ·H·Δ
            let mut g = acc.fc;
            for a in 0..DIMENSION {
                for b in 0..DIMENSION {
                    g[a] += acc.jacobian[a * DIMENSION + b] * delta[b];
                }
            }
            for a in 0..DIMENSION {
                for b in 0..DIMENSION {
                    for c in 0..DIMENSION {
                        g[a] += 0.5
                            * acc.hessian[(a * DIMENSION + b) * DIMENSION + c]
                            * delta[b]
                            * delta[c];
                    }
                }
            }
            locals[i].gravity = g;
            subparts.push(i);
        }
    } else {
        for i in 0..NCHILDREN {
            let cid = bid.push(i);
            if tree.branch(cid).is_some() {
                cell_to_particles(tree, cell, acc, cid, locals, subparts);
            }
        }
    }
}

/// O(N²) direct sum over the given bodies, the reference the multipole
/// pass is validated against.
pub fn direct_gravity(bodies: &mut [Body]) {
    let snapshot: Vec<(Coord, f64)> = bodies.iter().map(|b| (b.coordinates, b.mass)).collect();
    bodies.par_iter_mut().for_each(|body| {
        let mut gravity = ZERO;
        for &(pos, mass) in &snapshot {
            let d = distance(body.coordinates, pos);
            if d > 0.0 {
                gravity = add_scaled(gravity, -mass / (d * d * d), sub(body.coordinates, pos));
            }
        }
        body.gravity = gravity;
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::body::Locality;
    use crate::geometry::DomainRange;
    use crate::tree::{entity_filter_all, TreePolicy};
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    fn random_bodies(n: usize, seed: u64) -> Vec<Body> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let mut p = ZERO;
                for c in p.iter_mut() {
                    *c = rng.gen_range(0.1..0.9);
                }
                let mut b = Body::new(i as u64, p, rng.gen_range(0.5..1.5), 0.05);
                b.set_key(&DomainRange::new([0.0; DIMENSION], [1.0; DIMENSION]));
                b
            })
            .collect()
    }

    fn build_tree(bodies: &[Body], max_leaf_size: usize) -> Tree {
        let mut tree = Tree::new(
            DomainRange::new([0.0; DIMENSION], [1.0; DIMENSION]),
            TreePolicy {
                max_leaf_size,
                coarsen_threshold: 1,
            },
        );
        for (i, b) in bodies.iter().enumerate() {
            let e = tree.make_entity(
                b.coordinates,
                b.mass,
                b.id,
                0,
                Locality::Local,
                BodySlot::Local(i),
            );
            tree.insert(e);
        }
        tree.update_branches(0.0, entity_filter_all);
        tree
    }

    fn serial_fmm(bodies: &mut [Body], max_leaf_size: usize, theta: f64) {
        let tree = build_tree(bodies, max_leaf_size);
        let cells = collect_sink_cells(&tree, 0.0);
        let contributions = compute_contributions(&tree, &cells, theta);
        for (cell, acc) in cells.iter().zip(contributions.iter()) {
            push_down(&tree, bodies, cell, acc);
        }
    }

    #[test]
    fn test_monopole_matches_finite_difference_jacobian() {
        let source = [0.1; DIMENSION];
        let sink = [0.7; DIMENSION];
        let mass = 2.0;

        let mut acc = SinkAccumulator::default();
        accumulate_monopole(sink, source, mass, &mut acc);

        let eps = 1e-6;
        for j in 0..DIMENSION {
            let mut plus = sink;
            plus[j] += eps;
            let mut minus = sink;
            minus[j] -= eps;
            let mut acc_p = SinkAccumulator::default();
            let mut acc_m = SinkAccumulator::default();
            accumulate_monopole(plus, source, mass, &mut acc_p);
            accumulate_monopole(minus, source, mass, &mut acc_m);
            for i in 0..DIMENSION {
                let fd = (acc_p.fc[i] - acc_m.fc[i]) / (2.0 * eps);
                assert!(
                    (acc.jacobian[i * DIMENSION + j] - fd).abs() < 1e-4,
                    "jacobian[{i}][{j}] = {} vs finite difference {}",
                    acc.jacobian[i * DIMENSION + j],
                    fd
                );
            }
        }
    }

    #[test]
    fn test_monopole_matches_finite_difference_hessian() {
        let source = [0.15; DIMENSION];
        let sink = [0.8; DIMENSION];
        let mass = 1.3;

        let mut acc = SinkAccumulator::default();
        accumulate_monopole(sink, source, mass, &mut acc);

        let eps = 1e-5;
        for k in 0..DIMENSION {
            let mut plus = sink;
            plus[k] += eps;
            let mut minus = sink;
            minus[k] -= eps;
            let mut acc_p = SinkAccumulator::default();
            let mut acc_m = SinkAccumulator::default();
            accumulate_monopole(plus, source, mass, &mut acc_p);
            accumulate_monopole(minus, source, mass, &mut acc_m);
            for i in 0..DIMENSION {
                for j in 0..DIMENSION {
                    let fd = (acc_p.jacobian[i * DIMENSION + j]
                        - acc_m.jacobian[i * DIMENSION + j])
                        / (2.0 * eps);
                    let idx = (i * DIMENSION + j) * DIMENSION + k;
                    assert!(
                        (acc.hessian[idx] - fd).abs() < 1e-3,
                        "hessian[{i}][{j}][{k}] = {} vs finite difference {}",
                        acc.hessian[idx],
                        fd
                    );
                }
            }
        }
    }

    #[test]
    fn test_single_particle_leaves_reproduce_direct_sum() {
        // One particle per leaf and a closed MAC: the expansion
        // degenerates to the exact pairwise sum.
        let mut bodies = random_bodies(60, 7);
        let mut reference = bodies.clone();
        direct_gravity(&mut reference);
        serial_fmm(&mut bodies, 1, 0.0);

        for (b, r) in bodies.iter().zip(reference.iter()) {
            let err = distance(b.gravity, r.gravity);
            let scale = norm(r.gravity).max(1e-12);
            assert!(
                err / scale < 1e-10,
                "particle {}: fmm {:?} direct {:?}",
                b.id,
                b.gravity,
                r.gravity
            );
        }
    }

    #[test]
    fn test_opened_mac_stays_accurate() {
        // Single-particle leaves: near sources resolve to exact point
        // masses and only MAC-accepted far cells carry the error.
        let mut bodies = random_bodies(200, 8);
        let mut reference = bodies.clone();
        direct_gravity(&mut reference);
        serial_fmm(&mut bodies, 1, 0.2);

        let mut max_rel = 0.0_f64;
        let mut mean_rel = 0.0_f64;
        for (b, r) in bodies.iter().zip(reference.iter()) {
            let rel = distance(b.gravity, r.gravity) / norm(r.gravity).max(1e-12);
            max_rel = max_rel.max(rel);
            mean_rel += rel;
        }
        mean_rel /= bodies.len() as f64;
        assert!(max_rel < 1e-2, "max relative error {}", max_rel);
        assert!(mean_rel < 2e-3, "mean relative error {}", mean_rel);
    }

    #[test]
    fn test_mass_is_conserved_by_sink_harvest() {
        let bodies = random_bodies(150, 9);
        let tree = build_tree(&bodies, 8);
        let cells = collect_sink_cells(&tree, 1e-3);
        // Sinks partition the tree mass: no particle is below two sinks.
        let total: f64 = bodies.iter().map(|b| b.mass).sum();
        let covered: f64 = cells
            .iter()
            .map(|c| tree.expect_branch(c.key).mass())
            .sum();
        assert!((total - covered).abs() < 1e-12 * total);
    }
}
