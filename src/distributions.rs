/*!
Link functions, prior densities and the proposal distribution used by the sampler.

Every continuous quantity in the occupancy model is sampled on the unconstrained log-odds scale.
The helpers here keep that scale numerically safe: probabilities are clamped a hair inside
(0, 1) before taking log-odds, and log-probabilities are computed from log-odds directly
without ever forming `ln(0)`.

# Examples

```rust
use predprey_mcmc::distributions::{inv_logit, logit, Proposal, RandomWalk};
use rand::rngs::SmallRng;
use rand::SeedableRng;

assert!((inv_logit(logit(0.25)) - 0.25).abs() < 1e-12);
assert!(logit(0.0).is_finite());

let walk = RandomWalk::new(0.5);
let mut rng = SmallRng::seed_from_u64(42);
let candidate = walk.sample(1.0, &mut rng);
assert!(candidate.is_finite());
```
*/

use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;

/// Distance kept from 0 and 1 when mapping probabilities to log-odds.
pub const PROB_EPS: f64 = 1e-12;

/// `ln(1 + e^x)` without overflow.
pub fn softplus(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// Log-odds of `p`, with `p` clamped to `[PROB_EPS, 1 - PROB_EPS]`.
pub fn logit(p: f64) -> f64 {
    let p = p.clamp(PROB_EPS, 1.0 - PROB_EPS);
    (p / (1.0 - p)).ln()
}

/// Inverse of [`logit`]; the result stays within `[PROB_EPS, 1 - PROB_EPS]`.
pub fn inv_logit(x: f64) -> f64 {
    let p = if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    };
    p.clamp(PROB_EPS, 1.0 - PROB_EPS)
}

/// `ln(inv_logit(x))`.
pub fn log_inv_logit(x: f64) -> f64 {
    -softplus(-x)
}

/// `ln(1 - inv_logit(x))`.
pub fn log1m_inv_logit(x: f64) -> f64 {
    -softplus(x)
}

/// Log-density of the standard logistic distribution, Logistic(0, 1).
///
/// This is also the density of `logit(p)` when `p ~ Uniform(0, 1)`, so it serves as the prior
/// on the sampling scale for both effect and baseline parameters.
pub fn logistic_log_pdf(x: f64) -> f64 {
    let a = x.abs();
    -a - 2.0 * (-a).exp().ln_1p()
}

/// Binomial log-likelihood of `y` successes in `n` trials with success log-odds `eta`,
/// without the binomial coefficient.
pub fn binomial_logit_kernel(y: u32, n: u32, eta: f64) -> f64 {
    let mut lp = 0.0;
    if y > 0 {
        lp += y as f64 * log_inv_logit(eta);
    }
    if n > y {
        lp += (n - y) as f64 * log1m_inv_logit(eta);
    }
    lp
}

/// Bernoulli log-probability of `z` with success log-odds `eta`.
pub fn bernoulli_logit_log_pmf(z: u8, eta: f64) -> f64 {
    if z == 1 {
        log_inv_logit(eta)
    } else {
        log1m_inv_logit(eta)
    }
}

/// A trait for generating proposals for a single real-valued coordinate in
/// Metropolis–Hastings updates.
pub trait Proposal {
    /// Samples a new point from q(x' | x).
    fn sample<R: Rng + ?Sized>(&self, current: f64, rng: &mut R) -> f64;

    /// Evaluates log q(to | from).
    fn log_prob(&self, from: f64, to: f64) -> f64;
}

/**
A Gaussian random-walk proposal whose scale adapts toward a target acceptance rate.

The scale is stored on the log scale. Acceptances are counted per batch; [`RandomWalk::adapt`]
closes the current batch and nudges the log-scale up when the batch accepted more often than
the target and down otherwise, by `min(0.1, 1/sqrt(batches))`. Once [`RandomWalk::freeze`] has
been called, `adapt` is a no-op.

# Examples

```rust
use predprey_mcmc::distributions::RandomWalk;

let mut walk = RandomWalk::new(1.0);
for _ in 0..50 {
    walk.record(true);
}
walk.adapt(0.44);
assert!(walk.scale() > 1.0);

walk.freeze();
let frozen = walk.scale();
walk.record(false);
walk.adapt(0.44);
assert_eq!(walk.scale(), frozen);
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct RandomWalk {
    log_scale: f64,
    batch_accepted: u32,
    batch_proposed: u32,
    batches: u32,
    accepted: u64,
    proposed: u64,
    frozen: bool,
}

impl RandomWalk {
    /// Creates a random walk with standard deviation `scale`.
    pub fn new(scale: f64) -> Self {
        Self {
            log_scale: scale.ln(),
            batch_accepted: 0,
            batch_proposed: 0,
            batches: 0,
            accepted: 0,
            proposed: 0,
            frozen: false,
        }
    }

    pub fn scale(&self) -> f64 {
        self.log_scale.exp()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Records the outcome of one proposal.
    pub fn record(&mut self, accepted: bool) {
        self.batch_proposed += 1;
        self.proposed += 1;
        if accepted {
            self.batch_accepted += 1;
            self.accepted += 1;
        }
    }

    /// Closes the current batch and moves the scale toward `target` acceptance.
    pub fn adapt(&mut self, target: f64) {
        if self.frozen || self.batch_proposed == 0 {
            return;
        }
        self.batches += 1;
        let delta = (1.0 / (self.batches as f64).sqrt()).min(0.1);
        let rate = self.batch_accepted as f64 / self.batch_proposed as f64;
        if rate > target {
            self.log_scale += delta;
        } else {
            self.log_scale -= delta;
        }
        self.batch_accepted = 0;
        self.batch_proposed = 0;
    }

    /// Stops adaptation for good and restarts the acceptance counts, so that
    /// [`RandomWalk::acceptance_rate`] only covers the frozen scale.
    pub fn freeze(&mut self) {
        self.frozen = true;
        self.accepted = 0;
        self.proposed = 0;
    }

    /// Fraction of accepted proposals since the freeze, or since creation while still adapting.
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }
}

impl Proposal for RandomWalk {
    fn sample<R: Rng + ?Sized>(&self, current: f64, rng: &mut R) -> f64 {
        match Normal::new(current, self.scale()) {
            Ok(normal) => normal.sample(rng),
            Err(_) => current,
        }
    }

    fn log_prob(&self, from: f64, to: f64) -> f64 {
        let sd = self.scale();
        let diff = to - from;
        -(diff * diff) / (2.0 * sd * sd) - sd.ln() - 0.5 * (2.0 * PI).ln()
    }
}

#[cfg(test)]
mod distributions_tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_link_round_trip() {
        for &p in &[1e-9, 1e-4, 0.01, 0.2, 0.5, 0.73, 0.99, 1.0 - 1e-6] {
            assert_abs_diff_eq!(inv_logit(logit(p)), p, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_link_is_finite_at_boundaries() {
        assert!(logit(0.0).is_finite());
        assert!(logit(1.0).is_finite());
        assert!(logit(-3.0).is_finite());
        let lo = inv_logit(-1e4);
        let hi = inv_logit(1e4);
        assert!(lo > 0.0 && lo < 1.0, "got {lo}");
        assert!(hi > 0.0 && hi < 1.0, "got {hi}");
    }

    #[test]
    fn test_log_link_stability() {
        assert_abs_diff_eq!(log_inv_logit(0.0), 0.5_f64.ln(), epsilon = 1e-14);
        assert_abs_diff_eq!(log1m_inv_logit(0.0), 0.5_f64.ln(), epsilon = 1e-14);
        assert_abs_diff_eq!(log_inv_logit(-800.0), -800.0, epsilon = 1e-9);
        assert_abs_diff_eq!(log1m_inv_logit(800.0), -800.0, epsilon = 1e-9);
        assert!(log_inv_logit(800.0) <= 0.0);
    }

    #[test]
    fn test_logistic_log_pdf() {
        // Standard logistic density at 0 is 1/4.
        assert_abs_diff_eq!(logistic_log_pdf(0.0), 0.25_f64.ln(), epsilon = 1e-14);
        assert_abs_diff_eq!(logistic_log_pdf(1.3), logistic_log_pdf(-1.3), epsilon = 1e-14);
        let x: f64 = 2.0;
        let direct = (-x).exp() / (1.0 + (-x).exp()).powi(2);
        assert_abs_diff_eq!(logistic_log_pdf(x), direct.ln(), epsilon = 1e-12);
        assert!(logistic_log_pdf(1e5).is_finite());
    }

    #[test]
    fn test_binomial_kernel_matches_direct() {
        let eta = 0.4;
        let p = inv_logit(eta);
        let direct = 3.0 * p.ln() + 2.0 * (1.0 - p).ln();
        assert_abs_diff_eq!(binomial_logit_kernel(3, 5, eta), direct, epsilon = 1e-12);
        assert_eq!(binomial_logit_kernel(0, 0, eta), 0.0);
    }

    #[test]
    fn test_random_walk_log_prob_is_symmetric() {
        let walk = RandomWalk::new(0.7);
        assert_abs_diff_eq!(walk.log_prob(0.1, 1.4), walk.log_prob(1.4, 0.1), epsilon = 1e-14);
        let expected = -0.5 * (2.0 * PI).ln() - 0.7_f64.ln();
        assert_abs_diff_eq!(walk.log_prob(2.0, 2.0), expected, epsilon = 1e-14);
    }

    #[test]
    fn test_random_walk_adapts_down_when_rejecting() {
        let mut walk = RandomWalk::new(1.0);
        for _ in 0..20 {
            walk.record(false);
        }
        walk.adapt(0.44);
        assert!(walk.scale() < 1.0);
        assert_eq!(walk.acceptance_rate(), 0.0);
    }

    #[test]
    fn test_acceptance_rate_restarts_at_freeze() {
        let mut walk = RandomWalk::new(1.0);
        for _ in 0..30 {
            walk.record(true);
        }
        assert_eq!(walk.acceptance_rate(), 1.0);
        walk.freeze();
        assert_eq!(walk.acceptance_rate(), 0.0);
        walk.record(true);
        for _ in 0..3 {
            walk.record(false);
        }
        assert_abs_diff_eq!(walk.acceptance_rate(), 0.25, epsilon = 1e-15);
    }

    #[test]
    fn test_random_walk_sample_spread() {
        let walk = RandomWalk::new(2.0);
        let mut rng = SmallRng::seed_from_u64(7);
        let draws: Vec<f64> = (0..20_000).map(|_| walk.sample(3.0, &mut rng)).collect();
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        let var = draws.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / draws.len() as f64;
        assert_abs_diff_eq!(mean, 3.0, epsilon = 0.1);
        assert_abs_diff_eq!(var, 4.0, epsilon = 0.2);
    }
}
