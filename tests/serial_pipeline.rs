//! Serial end-to-end checks: lattice initial data through the tree
//! build, the neighbor evaluator and the default SPH callables.

use sphtree::body::Locality;
use sphtree::constants::DIMENSION;
use sphtree::geometry::{self, DomainRange};
use sphtree::sph;
use sphtree::tree::{entity_filter_all, BodySlot, Tree, TreePolicy};
use sphtree::{Body, MortonKey};

fn lattice(nx: usize) -> Vec<Body> {
    let spacing = 1.0 / nx as f64;
    let mass = 1.0 / (nx as f64).powi(DIMENSION as i32);
    let total = nx.pow(DIMENSION as u32);
    (0..total)
        .map(|flat| {
            let mut p = [0.0; DIMENSION];
            let mut rest = flat;
            for c in p.iter_mut() {
                *c = (rest % nx) as f64 * spacing + 0.5 * spacing;
                rest /= nx;
            }
            let mut body = Body::new(flat as u64, p, mass, 1.5 * spacing);
            body.internal_energy = 1.0;
            body
        })
        .collect()
}

fn build_tree(bodies: &[Body], halo: f64) -> Tree {
    let range = DomainRange::new([0.0; DIMENSION], [1.0; DIMENSION]).padded(halo);
    let mut tree = Tree::new(range, TreePolicy::default());
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
    tree.update_branches(halo, entity_filter_all);
    tree
}

#[test]
fn density_is_uniform_inside_a_lattice() {
    let nx = 12;
    let mut bodies = lattice(nx);
    let h_max = bodies[0].smoothing_length;
    let tree = build_tree(&bodies, 2.0 * h_max);

    tree.apply_sub_cells(&mut bodies, &[], 2.0, 32, sph::compute_density);

    // Interior particles see a full kernel support; their density must
    // match the lattice density closely and each other almost exactly.
    let margin = 2.0 * h_max + 1e-9;
    let interior: Vec<&Body> = bodies
        .iter()
        .filter(|b| {
            b.coordinates
                .iter()
                .all(|&c| c > margin && c < 1.0 - margin)
        })
        .collect();
    assert!(!interior.is_empty());

    let first = interior[0].density;
    for b in &interior {
        assert!((b.density - first).abs() < 1e-10 * first);
        assert!((b.density - 1.0).abs() < 0.05, "density {}", b.density);
    }
}

#[test]
fn uniform_pressure_exerts_no_net_force() {
    let nx = 10;
    let mut bodies = lattice(nx);
    let h_max = bodies[0].smoothing_length;
    let tree = build_tree(&bodies, 2.0 * h_max);

    tree.apply_sub_cells(&mut bodies, &[], 2.0, 32, sph::compute_density);
    for b in bodies.iter_mut() {
        sph::compute_pressure(b, 5.0 / 3.0);
        sph::compute_soundspeed(b, 5.0 / 3.0);
    }
    tree.apply_sub_cells(&mut bodies, &[], 2.0, 32, |b, neighbors| {
        sph::compute_hydro_acceleration(b, neighbors, 1.0, 2.0, 0.01);
    });

    // Pairwise antisymmetry: the momentum flux sums to zero up to
    // floating-point roundoff.
    let mut net = [0.0; DIMENSION];
    let mut scale = 0.0_f64;
    for b in &bodies {
        for d in 0..DIMENSION {
            net[d] += b.mass * b.acceleration[d];
        }
        scale = scale.max(b.mass * geometry::norm(b.acceleration));
    }
    for d in 0..DIMENSION {
        assert!(
            net[d].abs() <= 1e-9 * scale.max(1e-30),
            "net force component {} = {}",
            d,
            net[d]
        );
    }
}

#[test]
fn insert_then_remove_restores_the_tree() {
    // Leaf capacity chosen so the probe fits without a refine: the law
    // compares multisets of (branch, id) pairs on both sides.
    let bodies = lattice(8);
    let range = DomainRange::new([0.0; DIMENSION], [1.0; DIMENSION]);
    let mut tree = Tree::new(
        range,
        TreePolicy {
            max_leaf_size: 200,
            coarsen_threshold: 100,
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

    let snapshot = |tree: &Tree| {
        let mut rows: Vec<(MortonKey, u64)> = tree
            .entities()
            .iter()
            .filter(|e| e.branch().is_valid())
            .map(|e| (e.branch(), e.global_id()))
            .collect();
        rows.sort_unstable();
        (rows, tree.num_branches())
    };
    let before = snapshot(&tree);

    // A probe particle in a leaf with spare capacity.
    let probe = tree.make_entity(
        [0.51; DIMENSION],
        1.0,
        u64::MAX,
        0,
        Locality::Local,
        BodySlot::None,
    );
    tree.insert(probe);
    assert_ne!(snapshot(&tree).0.len(), before.0.len());

    tree.remove(probe);
    assert_eq!(snapshot(&tree), before);
}

#[test]
fn evaluator_passes_are_deterministic() {
    let nx = 9;
    let mut first = lattice(nx);
    let h_max = first[0].smoothing_length;
    let tree = build_tree(&first, 2.0 * h_max);
    let mut second = first.clone();

    tree.apply_sub_cells(&mut first, &[], 2.0, 16, sph::compute_density);
    tree.apply_sub_cells(&mut second, &[], 2.0, 16, sph::compute_density);

    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.density.to_bits(), b.density.to_bits());
    }
}
