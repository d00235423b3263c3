/*!
Convergence diagnostics over the retained draws of several chains.

For every scalar column of a [`Posterior`] this computes the potential-scale-reduction statistic
(Rhat) from between- and within-chain variances, and the effective sample size from the
chains' autocorrelations (FFT-based, with Geyer's initial monotone sequence truncation).

Columns that are structurally absent hold NaN in every draw of every chain. They are dropped
before any variance is computed and listed in [`Diagnostics::excluded`].

# Examples

```rust
use predprey_mcmc::diagnostics::rhat;
use ndarray::arr2;

// Three chains stuck at different values never mix.
let stuck = arr2(&[[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]]);
assert!(rhat(stuck.view()).is_infinite());
```
*/

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{OccuError, Result};
use crate::summary::Posterior;

/// Rhat and effective sample size of one parameter instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamDiagnostic {
    pub name: String,
    pub rhat: f64,
    pub ess: f64,
    pub converged: bool,
}

/// Diagnostics of every applicable parameter instance of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    pub params: Vec<ParamDiagnostic>,
    pub threshold: f64,
    /// Names of the columns left out because they hold no values.
    pub excluded: Vec<String>,
}

impl Diagnostics {
    pub fn get(&self, name: &str) -> Option<&ParamDiagnostic> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Instances whose Rhat exceeds the threshold.
    pub fn non_converged(&self) -> Vec<&ParamDiagnostic> {
        self.params.iter().filter(|p| !p.converged).collect()
    }

    /// Largest finite-or-infinite Rhat, ignoring NaN.
    pub fn max_rhat(&self) -> f64 {
        let all: Array1<f64> = self.params.iter().map(|p| p.rhat).collect();
        if all.is_empty() {
            return f64::NAN;
        }
        *all.max_skipnan()
    }

    pub fn min_ess(&self) -> f64 {
        self.params
            .iter()
            .map(|p| p.ess)
            .filter(|e| !e.is_nan())
            .fold(f64::INFINITY, f64::min)
    }
}

/// Computes Rhat and ESS for every applicable column of `posterior`.
///
/// Non-convergence is logged and flagged per instance; it is never an error. Fewer than two
/// chains or two draws per chain leave Rhat undefined and are rejected.
pub fn diagnose(posterior: &Posterior, threshold: f64) -> Result<Diagnostics> {
    let draws = posterior.draws();
    let (n_chains, n_draws, n_cols) = draws.dim();
    if n_chains < 2 || n_draws < 2 {
        return Err(OccuError::Diagnostics(format!(
            "need at least 2 chains with 2 draws each, got {n_chains} × {n_draws}"
        )));
    }
    let layout = posterior.layout();

    let results: Vec<(usize, Option<(f64, f64)>)> = (0..n_cols)
        .into_par_iter()
        .map(|col| {
            let x = draws.index_axis(Axis(2), col);
            if x.iter().all(|v| v.is_nan()) {
                (col, None)
            } else {
                (col, Some((rhat(x), ess(x))))
            }
        })
        .collect();

    let mut params = Vec::new();
    let mut excluded = Vec::new();
    for (col, res) in results {
        let name = layout.column(col).name.clone();
        match res {
            None => excluded.push(name),
            Some((rhat, ess)) => {
                let converged = rhat <= threshold;
                if !converged {
                    warn!(parameter = %name, rhat, threshold, "parameter has not converged");
                }
                params.push(ParamDiagnostic {
                    name,
                    rhat,
                    ess,
                    converged,
                });
            }
        }
    }
    let diagnostics = Diagnostics {
        params,
        threshold,
        excluded,
    };
    info!(
        parameters = diagnostics.params.len(),
        excluded = diagnostics.excluded.len(),
        max_rhat = diagnostics.max_rhat(),
        "diagnostics computed"
    );
    Ok(diagnostics)
}

/**
Potential-scale-reduction statistic of one scalar, from draws shaped `[chain, draw]`.

With `n` draws per chain, `W` the mean within-chain variance and `B/n` the variance of the chain
means, `Rhat = sqrt(((n - 1)/n W + B/n) / W)`. Constant draws give 1; chains that are each
constant at different values give infinity.
*/
pub fn rhat(x: ArrayView2<f64>) -> f64 {
    let (m, n) = x.dim();
    if m < 2 || n < 2 {
        return f64::NAN;
    }
    let nf = n as f64;
    let means: Array1<f64> = x.map_axis(Axis(1), |c| c.sum() / nf);
    let within = x
        .outer_iter()
        .zip(means.iter())
        .map(|(c, &mu)| c.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / (nf - 1.0))
        .sum::<f64>()
        / m as f64;
    let grand = means.sum() / m as f64;
    let between = means.iter().map(|mu| (mu - grand).powi(2)).sum::<f64>() * nf / (m as f64 - 1.0);

    if within == 0.0 {
        return if between == 0.0 { 1.0 } else { f64::INFINITY };
    }
    let var = within * (nf - 1.0) / nf + between / nf;
    (var / within).sqrt()
}

/// Biased autocovariance of `x` at every lag, computed by FFT.
fn autocovariance(x: ArrayView1<f64>) -> Vec<f64> {
    let n = x.len();
    let mean = x.sum() / n as f64;
    let len = (2 * n).next_power_of_two();
    let mut buf: Vec<Complex<f64>> = x
        .iter()
        .map(|&v| Complex::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(len)
        .collect();

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(len).process(&mut buf);
    buf.iter_mut().for_each(|c| *c = Complex::new(c.norm_sqr(), 0.0));
    planner.plan_fft_inverse(len).process(&mut buf);

    let scale = (len * n) as f64;
    buf.iter().take(n).map(|c| c.re / scale).collect()
}

/**
Effective sample size of one scalar, from draws shaped `[chain, draw]`.

Combines the chains' autocorrelations with the multi-chain variance estimate, truncates the
autocorrelation sum with Geyer's initial positive sequence and forces it to be monotone. Fewer
than 4 draws per chain, or draws without any variance, give NaN.
*/
pub fn ess(x: ArrayView2<f64>) -> f64 {
    let (m, n) = x.dim();
    if m == 0 || n < 4 {
        return f64::NAN;
    }
    let nf = n as f64;
    let acov: Vec<Vec<f64>> = x.outer_iter().map(autocovariance).collect();
    let means: Vec<f64> = x.outer_iter().map(|c| c.sum() / nf).collect();

    let mean_var = acov.iter().map(|a| a[0] * nf / (nf - 1.0)).sum::<f64>() / m as f64;
    let mut var_plus = mean_var * (nf - 1.0) / nf;
    if m > 1 {
        let grand = means.iter().sum::<f64>() / m as f64;
        var_plus += means.iter().map(|mu| (mu - grand).powi(2)).sum::<f64>() / (m as f64 - 1.0);
    }
    if !(var_plus > 0.0) || !var_plus.is_finite() {
        return f64::NAN;
    }

    let mean_acov = |t: usize| acov.iter().map(|a| a[t]).sum::<f64>() / m as f64;
    let rho_at = |t: usize| 1.0 - (mean_var - mean_acov(t)) / var_plus;

    let mut rho = vec![0.0; n];
    rho[0] = 1.0;
    let mut rho_even = 1.0;
    let mut rho_odd = rho_at(1);
    rho[1] = rho_odd;

    let mut t = 1;
    while t < n - 4 && rho_even + rho_odd > 0.0 {
        rho_even = rho_at(t + 1);
        rho_odd = rho_at(t + 2);
        if rho_even + rho_odd >= 0.0 {
            rho[t + 1] = rho_even;
            rho[t + 2] = rho_odd;
        }
        t += 2;
    }
    let max_t = t;
    if rho_even > 0.0 {
        rho[max_t + 1] = rho_even;
    }

    // Initial monotone sequence.
    let mut t = 1;
    while t + 3 <= max_t {
        if rho[t + 1] + rho[t + 2] > rho[t - 1] + rho[t] {
            rho[t + 1] = (rho[t - 1] + rho[t]) / 2.0;
            rho[t + 2] = rho[t + 1];
        }
        t += 2;
    }

    let total = (m * n) as f64;
    let tau = -1.0 + 2.0 * rho[..max_t].iter().sum::<f64>() + rho[max_t + 1];
    let tau = tau.max(1.0 / total.log10());
    total / tau
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PeriodLayout;
    use crate::layout::ParamLayout;
    use crate::model::OccupancyInteraction;
    use crate::summary::Acceptance;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use std::f64;
    use std::sync::Arc;

    /// Rhat of every column of two steps of `[chain, param]` data.
    fn rhat_columns(step0: Array2<f64>, step1: Array2<f64>) -> Array1<f64> {
        let stacked = ndarray::stack(Axis(1), &[step0.view(), step1.view()]).unwrap();
        (0..stacked.dim().2)
            .map(|p| rhat(stacked.index_axis(Axis(2), p)))
            .collect()
    }

    #[test]
    fn test_rhat_f64_1() {
        let data_step_0 = arr2(&[
            [0.0, 1.0, 0.0, 1.0], // chain 0
            [1.0, 2.0, 0.0, 2.0], // chain 1
            [0.0, 0.0, 0.0, 2.0], // chain 2
        ]);
        let data_step_1 = arr2(&[
            [1.0, 2.0, 2.0, 0.0], // chain 0
            [1.0, 1.0, 1.0, 1.0], // chain 1
            [0.0, 1.0, 0.0, 0.0], // chain 2
        ]);
        let expected = array![f64::consts::SQRT_2, 1.08012345, 0.89442719, 0.8660254];
        let got = rhat_columns(data_step_0, data_step_1);
        for (g, e) in got.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(g, e, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_rhat_f64_data() {
        let data_step_0 = arr2(&[
            [1.0, 0.0, 0.0, 1.0],
            [1.0, 0.0, 0.0, 1.0],
            [0.0, 1.0, 0.0, 2.0],
        ]);
        let data_step_1 = arr2(&[
            [1.0, 2.0, 0.0, 2.0],
            [1.0, 2.0, 0.0, 0.0],
            [2.0, 0.0, 1.0, 2.0],
        ]);
        let expected = array![f64::consts::FRAC_1_SQRT_2, 0.74535599, 1.0, 1.5];
        let got = rhat_columns(data_step_0, data_step_1);
        for (g, e) in got.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(g, e, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_rhat_degenerate() {
        assert_eq!(rhat(Array2::from_elem((3, 5), 2.0).view()), 1.0);
        assert!(rhat(arr2(&[[1.0, 2.0]]).view()).is_nan());
    }

    fn ar1(phi: f64, chains: usize, n: usize, seed: u64) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut out = Array2::zeros((chains, n));
        for mut row in out.rows_mut() {
            let mut x = normal.sample(&mut rng) / (1.0 - phi * phi).sqrt();
            for v in row.iter_mut() {
                x = phi * x + normal.sample(&mut rng);
                *v = x;
            }
        }
        out
    }

    #[test]
    fn test_ess_iid_close_to_draw_count() {
        let x = ar1(0.0, 4, 1000, 3);
        let e = ess(x.view());
        assert!(e > 3000.0 && e < 5500.0, "ess = {e}");
        assert!(rhat(x.view()) < 1.01);
    }

    #[test]
    fn test_ess_autocorrelated() {
        let x = ar1(0.9, 4, 2000, 5);
        // Theoretical value: 8000 × (1 - 0.9) / (1 + 0.9) ≈ 421.
        let e = ess(x.view());
        assert!(e > 250.0 && e < 700.0, "ess = {e}");
    }

    #[test]
    fn test_ess_edge_cases() {
        assert!(ess(Array2::zeros((3, 3)).view()).is_nan());
        assert!(ess(Array2::from_elem((3, 50), 1.0).view()).is_nan());
    }

    #[test]
    fn test_autocovariance_lag_zero_is_variance() {
        let x = array![1.0, 3.0, 2.0, 6.0];
        let acov = autocovariance(x.view());
        // Biased variance: mean 3, squares 4 + 0 + 1 + 9 over 4.
        assert_abs_diff_eq!(acov[0], 3.5, epsilon = 1e-12);
        // Lag 1: (-2)(0) + (0)(-1) + (-1)(3) over 4.
        assert_abs_diff_eq!(acov[1], -0.75, epsilon = 1e-12);
    }

    /// Two chains over PAs with [2, 1, 3] periods, drawn from one stationary distribution.
    fn posterior(chains: usize, draws: usize) -> Posterior {
        let periods = PeriodLayout::new(vec![2, 1, 3]).unwrap();
        let layout = Arc::new(ParamLayout::new(
            &periods,
            OccupancyInteraction::PredatorOnPrey,
            4,
            false,
        ));
        let mut rng = SmallRng::seed_from_u64(17);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut values = Array3::zeros((chains, draws, layout.len()));
        for (i, col) in layout.columns().iter().enumerate() {
            for v in values.index_axis_mut(Axis(2), i).iter_mut() {
                *v = if col.applicable {
                    normal.sample(&mut rng)
                } else {
                    f64::NAN
                };
            }
        }
        let acceptance = Acceptance {
            names: vec![],
            rates: Array2::zeros((chains, 0)),
        };
        Posterior::new(layout, values, acceptance).unwrap()
    }

    #[test]
    fn test_structurally_absent_periods_are_excluded() {
        let diagnostics = diagnose(&posterior(3, 200), 1.1).unwrap();
        for name in diagnostics.params.iter().map(|p| p.name.as_str()) {
            assert!(!name.contains(",2,2]"), "{name}");
            assert!(!name.contains(",2,3]"), "{name}");
        }
        for name in ["p0[Prey,2,2]", "psi0[Predator,2,3]", "p0[Predator,1,3]", "beta.psi[Predator]"] {
            assert!(diagnostics.excluded.iter().any(|e| e == name), "{name}");
        }
        assert!(diagnostics.get("p0[Prey,3,3]").is_some());
        // 6 valid cells × 2 species × 2 baselines + 8 applicable effects.
        assert_eq!(diagnostics.params.len(), 24 + 8);
        assert!(diagnostics.params.iter().all(|p| p.rhat.is_finite() && p.ess.is_finite()));
        assert!(diagnostics.max_rhat() < 1.1);
        assert!(diagnostics.non_converged().is_empty());
        assert!(diagnostics.min_ess() > 100.0);
    }

    #[test]
    fn test_diagnose_needs_two_chains() {
        assert!(matches!(
            diagnose(&posterior(1, 50), 1.1),
            Err(OccuError::Diagnostics(_))
        ));
    }

    #[test]
    fn test_non_converged_is_flagged_not_fatal() {
        let mut p = posterior(3, 100);
        // Shift one chain of one column far away.
        let col = p.layout().position("beta.night[Prey]").unwrap();
        let mut draws = p.draws().clone();
        draws.slice_mut(s![0, .., col]).mapv_inplace(|v| v + 10.0);
        p = Posterior::new(Arc::new(p.layout().clone()), draws, p.acceptance().clone()).unwrap();
        let diagnostics = diagnose(&p, 1.1).unwrap();
        let flagged = diagnostics.non_converged();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].name, "beta.night[Prey]");
    }
}
