//! SPH smoothing kernel and the default physics callables.
//!
//! The engine itself only contracts `ef(particle, neighbors)`; the
//! functions here are the standard callables the demos and tests plug
//! in: cubic-spline density summation, ideal-gas equation of state and
//! the artificial-viscosity hydro acceleration.

use crate::body::Body;
use crate::constants::DIMENSION;
use crate::geometry::{self, add_scaled, dot, scale, sub, Coord, ZERO};

/// Normalization constant of the cubic-spline kernel for the build's
/// dimension: `2/3` (1D), `10/(7π)` (2D), `1/π` (3D), divided by `h^D`
/// at evaluation time.
fn kernel_sigma(h: f64) -> f64 {
    let norm = match DIMENSION {
        1 => 2.0 / 3.0,
        2 => 10.0 / (7.0 * std::f64::consts::PI),
        _ => 1.0 / std::f64::consts::PI,
    };
    norm / h.powi(DIMENSION as i32)
}

/// Cubic-spline kernel with support radius `2h`.
///
/// ```text
/// W(r, h) = σ · (1 − 3/2 q² + 3/4 q³)   for q = r/h ≤ 1
/// W(r, h) = σ/4 · (2 − q)³              for 1 < q ≤ 2
/// W(r, h) = 0                           for q > 2
/// ```
pub fn kernel(r: f64, h: f64) -> f64 {
    let q = r / h;
    let sigma = kernel_sigma(h);
    if q <= 1.0 {
        sigma * (1.0 - 1.5 * q * q + 0.75 * q * q * q)
    } else if q <= 2.0 {
        let t = 2.0 - q;
        sigma * 0.25 * t * t * t
    } else {
        0.0
    }
}

/// Gradient of the cubic-spline kernel with respect to the first
/// argument, given the displacement `vec = r_a − r_b`.
pub fn grad_kernel(vec: Coord, h: f64) -> Coord {
    let r = geometry::norm(vec);
    if r < 1e-14 {
        return ZERO;
    }
    let q = r / h;
    let sigma = kernel_sigma(h);
    let dwdr = if q <= 1.0 {
        sigma * (-3.0 * q + 2.25 * q * q) / h
    } else if q <= 2.0 {
        let t = 2.0 - q;
        sigma * (-0.75 * t * t) / h
    } else {
        return ZERO;
    };
    scale(vec, dwdr / r)
}

/// Density summation over the neighbor list.
pub fn compute_density(body: &mut Body, neighbors: &[&Body]) {
    let mut density = 0.0;
    for nb in neighbors {
        let dist = geometry::distance(body.coordinates, nb.coordinates);
        let h = 0.5 * (body.smoothing_length + nb.smoothing_length);
        density += nb.mass * kernel(dist, h);
    }
    assert!(
        density > 0.0,
        "non-positive density for particle {}",
        body.id
    );
    body.density = density;
}

/// Ideal-gas pressure from internal energy.
pub fn compute_pressure(body: &mut Body, gamma: f64) {
    body.pressure = (gamma - 1.0) * body.density * body.internal_energy;
}

/// Adiabatic sound speed.
pub fn compute_soundspeed(body: &mut Body, gamma: f64) {
    body.soundspeed = (gamma * body.pressure / body.density).sqrt();
}

/// Viscosity signal `mu_ab` (Rosswog'09, eq. 60). Zero for receding
/// pairs.
pub fn mu(a: &Body, b: &Body, visc_epsilon: f64) -> f64 {
    let h_ab = 0.5 * (a.smoothing_length + b.smoothing_length);
    let dv = sub(a.velocity_half, b.velocity_half);
    let dx = sub(a.coordinates, b.coordinates);
    let vdotr = dot(dv, dx);
    if vdotr >= 0.0 {
        return 0.0;
    }
    let dist2 = dot(dx, dx);
    h_ab * vdotr / (dist2 + visc_epsilon * h_ab * h_ab)
}

/// Artificial viscosity term `Π_ab` (Rosswog'09, eq. 59). Caches the
/// largest signal in `a.mumax` for the adaptive timestep.
pub fn viscosity(a: &mut Body, b: &Body, alpha: f64, beta: f64, visc_epsilon: f64) -> f64 {
    let rho_ab = 0.5 * (a.density + b.density);
    let c_ab = 0.5 * (a.soundspeed + b.soundspeed);
    let mu_ab = mu(a, b, visc_epsilon);
    if -mu_ab > a.mumax {
        a.mumax = -mu_ab;
    }
    (-alpha * c_ab * mu_ab + beta * mu_ab * mu_ab) / rho_ab
}

/// Momentum-equation acceleration with artificial viscosity.
pub fn compute_hydro_acceleration(
    body: &mut Body,
    neighbors: &[&Body],
    alpha: f64,
    beta: f64,
    visc_epsilon: f64,
) {
    body.mumax = 0.0;
    let mut acceleration = ZERO;
    for nb in neighbors {
        if nb.coordinates == body.coordinates {
            continue;
        }
        let pi_ab = viscosity(body, nb, alpha, beta, visc_epsilon);
        let pressure_term = body.pressure / (body.density * body.density)
            + nb.pressure / (nb.density * nb.density);
        let grad = grad_kernel(
            sub(body.coordinates, nb.coordinates),
            0.5 * (body.smoothing_length + nb.smoothing_length),
        );
        acceleration = add_scaled(acceleration, -nb.mass * (pressure_term + pi_ab), grad);
    }
    body.acceleration = acceleration;
}

/// Internal-energy rate `du/dt` of the source particle.
pub fn compute_dudt(
    body: &mut Body,
    neighbors: &[&Body],
    alpha: f64,
    beta: f64,
    visc_epsilon: f64,
) -> f64 {
    let mut dudt = 0.0;
    for nb in neighbors {
        if nb.coordinates == body.coordinates {
            continue;
        }
        let pi_ab = viscosity(body, nb, alpha, beta, visc_epsilon);
        let grad = grad_kernel(
            sub(body.coordinates, nb.coordinates),
            0.5 * (body.smoothing_length + nb.smoothing_length),
        );
        let dv = sub(body.velocity, nb.velocity);
        dudt += nb.mass
            * (body.pressure / (body.density * body.density) + 0.5 * pi_ab)
            * dot(dv, grad);
    }
    dudt
}

/// Per-particle CFL timestep estimate.
pub fn timestep_estimate(body: &Body, cfl_factor: f64, alpha: f64, beta: f64) -> f64 {
    let signal = body.soundspeed + 1.2 * (alpha * body.soundspeed + beta * body.mumax);
    cfl_factor * body.smoothing_length / signal.max(1e-14)
}

#[cfg(test)]
mod test {
    use super::*;

    /// Midpoint integration of the kernel over its support. The grid is
    /// coarse but the cubic spline is smooth, so one part in a thousand
    /// is ample.
    #[test]
    fn test_kernel_normalization() {
        let h = 0.3;
        let cells_per_dim = 60;
        let step = 4.0 * h / cells_per_dim as f64;
        let mut integral = 0.0;
        let mut index = [0_usize; DIMENSION];
        loop {
            let mut p = ZERO;
            for d in 0..DIMENSION {
                p[d] = -2.0 * h + (index[d] as f64 + 0.5) * step;
            }
            integral += kernel(geometry::norm(p), h) * step.powi(DIMENSION as i32);

            let mut d = 0;
            loop {
                index[d] += 1;
                if index[d] < cells_per_dim {
                    break;
                }
                index[d] = 0;
                d += 1;
                if d == DIMENSION {
                    assert!((integral - 1.0).abs() < 1e-3, "integral = {}", integral);
                    return;
                }
            }
        }
    }

    #[test]
    fn test_kernel_compact_support() {
        let h = 0.5;
        assert!(kernel(2.0 * h + 1e-9, h) == 0.0);
        assert!(kernel(1.9 * h, h) > 0.0);
        assert_eq!(grad_kernel([3.0 * h; DIMENSION], h), ZERO);
    }

    #[test]
    fn test_gradient_is_antisymmetric() {
        let h = 0.4;
        let v = {
            let mut v = ZERO;
            v[0] = 0.3;
            v
        };
        let g1 = grad_kernel(v, h);
        let g2 = grad_kernel(scale(v, -1.0), h);
        for d in 0..DIMENSION {
            assert!((g1[d] + g2[d]).abs() < 1e-14);
        }
    }

    #[test]
    fn test_density_of_isolated_pair() {
        let mut a = Body::new(0, ZERO, 1.0, 0.5);
        let mut b_pos = ZERO;
        b_pos[0] = 0.5;
        let b = Body::new(1, b_pos, 1.0, 0.5);

        let a_ref = a;
        compute_density(&mut a, &[&a_ref, &b]);
        let expected = kernel(0.0, 0.5) + kernel(0.5, 0.5);
        assert!((a.density - expected).abs() < 1e-14);
    }

    #[test]
    fn test_pressure_forces_are_opposite() {
        // Two equal particles: Newton's third law on the pressure term.
        let mut a = Body::new(0, ZERO, 1.0, 0.5);
        let mut b_pos = ZERO;
        b_pos[0] = 0.3;
        let mut b = Body::new(1, b_pos, 1.0, 0.5);
        for body in [&mut a, &mut b] {
            body.density = 1.0;
            body.pressure = 2.0;
            body.soundspeed = 1.0;
        }

        let (a_ref, b_ref) = (a, b);
        compute_hydro_acceleration(&mut a, &[&b_ref], 1.0, 2.0, 0.01);
        compute_hydro_acceleration(&mut b, &[&a_ref], 1.0, 2.0, 0.01);
        for d in 0..DIMENSION {
            assert!((a.acceleration[d] + b.acceleration[d]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_mu_zero_for_receding_pair() {
        let mut a = Body::new(0, ZERO, 1.0, 0.5);
        let mut b_pos = ZERO;
        b_pos[0] = 0.3;
        let mut b = Body::new(1, b_pos, 1.0, 0.5);
        a.velocity_half[0] = -1.0;
        b.velocity_half[0] = 1.0;
        assert_eq!(mu(&a, &b, 0.01), 0.0);

        // Approaching pair: negative signal.
        a.velocity_half[0] = 1.0;
        b.velocity_half[0] = -1.0;
        assert!(mu(&a, &b, 0.01) < 0.0);
    }
}
