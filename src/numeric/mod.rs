//! Fixed-coefficient numeric approximations.
//!
//! Everything here is part of the engine's reproducibility contract: a past
//! session replays bit-identically only while these tables stay unchanged.
//! Any coefficient edit is a breaking change and requires bumping
//! [`NUMERIC_VERSION`].
//!
//! - Standard normal CDF via the Abramowitz & Stegun 7.1.26 erf
//!   approximation (max absolute error ~1.5e-7, strictly monotone).
//! - Gauss-Hermite quadrature nodes/weights computed once by Newton
//!   iteration on the orthonormal Hermite recurrence, with a fixed iteration
//!   cap and tolerance, summed in ascending-node order.

use serde::{Deserialize, Serialize};

/// Version of the coefficient tables below.
pub const NUMERIC_VERSION: u32 = 1;

/// Logistic scaling constant aligning the slope-1 logistic metric with the
/// normal ogive. Applied inside every GPCM exponent.
pub const SCALING_D: f64 = 1.7;

// Abramowitz & Stegun 7.1.26 coefficients
const ERF_P: f64 = 0.327_591_1;
const ERF_A1: f64 = 0.254_829_592;
const ERF_A2: f64 = -0.284_496_736;
const ERF_A3: f64 = 1.421_413_741;
const ERF_A4: f64 = -1.453_152_027;
const ERF_A5: f64 = 1.061_405_429;

const SQRT_2: f64 = std::f64::consts::SQRT_2;
const SQRT_PI: f64 = 1.772_453_850_905_516;
/// pi^(-1/4), leading coefficient of the orthonormal Hermite recurrence
const PI_M4: f64 = 0.751_125_544_464_943;

const MAX_NEWTON_ITERATIONS: usize = 64;
const NEWTON_TOLERANCE: f64 = 1e-14;

/// Error function approximation (A&S 7.1.26), extended to negative input by
/// antisymmetry.
pub fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + ERF_P * x);
    let poly = t * (ERF_A1 + t * (ERF_A2 + t * (ERF_A3 + t * (ERF_A4 + t * ERF_A5))));
    sign * (1.0 - poly * (-x * x).exp())
}

/// Standard normal CDF.
pub fn normal_cdf(z: f64) -> f64 {
    if !z.is_finite() {
        return if z > 0.0 { 1.0 } else { 0.0 };
    }
    (0.5 * (1.0 + erf(z / SQRT_2))).clamp(0.0, 1.0)
}

/// Gauss-Hermite quadrature rule (physicists' convention):
/// integral of e^(-x^2) f(x) dx ~= sum w_i f(x_i).
///
/// Nodes are stored in ascending order; all consumers iterate in that order
/// so the summation sequence is identical on every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaussHermite {
    nodes: Vec<f64>,
    weights: Vec<f64>,
}

impl GaussHermite {
    /// Compute an n-point rule. Deterministic: fixed initial guesses, fixed
    /// iteration cap, fixed tolerance.
    pub fn new(n: usize) -> Self {
        assert!(n >= 2, "quadrature needs at least 2 points");

        let mut nodes = vec![0.0; n];
        let mut weights = vec![0.0; n];
        let nf = n as f64;
        let half = (n + 1) / 2;

        let mut z = 0.0;
        for i in 0..half {
            // Initial root guesses (largest root first)
            z = match i {
                0 => (2.0 * nf + 1.0).sqrt() - 1.85575 * (2.0 * nf + 1.0).powf(-0.16667),
                1 => z - 1.14 * nf.powf(0.426) / z,
                2 => 1.86 * z - 0.86 * nodes[0],
                3 => 1.91 * z - 0.91 * nodes[1],
                _ => 2.0 * z - nodes[i - 2],
            };

            let mut pp = 0.0;
            for _ in 0..MAX_NEWTON_ITERATIONS {
                // Evaluate the orthonormal Hermite polynomial at z
                let mut p1 = PI_M4;
                let mut p2 = 0.0;
                for j in 0..n {
                    let p3 = p2;
                    p2 = p1;
                    let jf = j as f64;
                    p1 = z * (2.0 / (jf + 1.0)).sqrt() * p2 - (jf / (jf + 1.0)).sqrt() * p3;
                }
                pp = (2.0 * nf).sqrt() * p2;
                let z1 = z;
                z = z1 - p1 / pp;
                if (z - z1).abs() <= NEWTON_TOLERANCE {
                    break;
                }
            }

            nodes[i] = z;
            nodes[n - 1 - i] = -z;
            let w = 2.0 / (pp * pp);
            weights[i] = w;
            weights[n - 1 - i] = w;
        }

        // Stored descending by construction; flip to ascending once.
        nodes.reverse();
        weights.reverse();

        Self { nodes, weights }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Evaluation points for an expectation under a N(mu, sigma) prior:
    /// theta_i = mu + sqrt(2) * sigma * x_i, weight_i = w_i / sqrt(pi).
    /// Returned in ascending theta order.
    pub fn prior_points(&self, mu: f64, sigma: f64) -> Vec<(f64, f64)> {
        self.nodes
            .iter()
            .zip(self.weights.iter())
            .map(|(&x, &w)| (mu + SQRT_2 * sigma * x, w / SQRT_PI))
            .collect()
    }
}
