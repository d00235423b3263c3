/*!
Posterior draws and the tables derived from them.

A [`Posterior`] holds the retained draws of every chain as one `[chain, draw, column]` array,
with the [`ParamLayout`] that gives the columns their meaning. From it you can

- pull out one parameter instance or one whole group in structured form
  ([`Posterior::column_draws`], [`Posterior::group_array`]),
- summarize every applicable parameter instance ([`Posterior::parameter_table`]),
- evaluate occupancy and detection probabilities per (PA, period) under covariate settings of
  your choosing, using every retained draw ([`Posterior::occupancy_table`],
  [`Posterior::detection_table`]).

Intervals are equal-tailed 95% credible intervals.
*/

use std::sync::Arc;

use ndarray::{s, Array1, Array2, Array3, ArrayD, Axis, IxDyn};
use ndarray_stats::{interpolate::Linear, Quantile1dExt};
use noisy_float::types::{n64, N64};
use serde::Serialize;

use crate::data::{Diel, Species, SurveyDesign};
use crate::diagnostics::Diagnostics;
use crate::distributions::inv_logit;
use crate::error::{OccuError, Result};
use crate::layout::{ParamGroup, ParamLayout};
use crate::model::Params;

/// Lower and upper probabilities of the reported credible interval.
pub const INTERVAL: (f64, f64) = (0.025, 0.975);

/// Per-chain acceptance rates of every free coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct Acceptance {
    pub names: Vec<String>,
    /// Shaped `[chain, coordinate]`.
    pub rates: Array2<f64>,
}

impl Acceptance {
    /// Acceptance rate of each coordinate averaged over chains.
    pub fn mean_by_scalar(&self) -> Vec<(String, f64)> {
        let means = self
            .rates
            .mean_axis(Axis(0))
            .unwrap_or_else(|| ndarray::Array1::from_elem(self.names.len(), f64::NAN));
        self.names
            .iter()
            .cloned()
            .zip(means.iter().copied())
            .collect()
    }
}

/// Retained draws of a finished run.
#[derive(Debug, Clone)]
pub struct Posterior {
    layout: Arc<ParamLayout>,
    draws: Array3<f64>,
    acceptance: Acceptance,
}

/// Summary of one parameter instance over all chains.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSummary {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub q2_5: f64,
    pub median: f64,
    pub q97_5: f64,
    pub rhat: Option<f64>,
    pub ess: Option<f64>,
}

/// Covariate setting for occupancy: which species, and whether the other one is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupancyScenario {
    pub species: Species,
    pub other_present: bool,
}

/// Covariate setting for detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionScenario {
    pub species: Species,
    pub diel: Diel,
    pub predator_present: bool,
}

/// Posterior mean and interval of a derived probability in one (PA, period) cell.
/// PA and period are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellSummary {
    pub species: Species,
    pub pa: usize,
    pub period: usize,
    pub year: Option<i32>,
    pub diel: Option<Diel>,
    /// The other species for occupancy rows, the predator for detection rows.
    pub other_present: bool,
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

impl Posterior {
    pub fn new(
        layout: Arc<ParamLayout>,
        draws: Array3<f64>,
        acceptance: Acceptance,
    ) -> Result<Self> {
        if draws.dim().2 != layout.len() {
            return Err(OccuError::Shape(format!(
                "draws have {} columns, layout has {}",
                draws.dim().2,
                layout.len()
            )));
        }
        Ok(Self {
            layout,
            draws,
            acceptance,
        })
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    /// All retained draws, shaped `[chain, draw, column]`.
    pub fn draws(&self) -> &Array3<f64> {
        &self.draws
    }

    pub fn acceptance(&self) -> &Acceptance {
        &self.acceptance
    }

    pub fn n_chains(&self) -> usize {
        self.draws.dim().0
    }

    pub fn n_draws(&self) -> usize {
        self.draws.dim().1
    }

    /// Draws of one parameter instance, shaped `[chain, draw]`.
    pub fn column_draws(&self, name: &str) -> Result<Array2<f64>> {
        let col = self.layout.position(name)?;
        Ok(self.draws.index_axis(Axis(2), col).to_owned())
    }

    /// Draws of a whole group, shaped `[chain, draw, structural dims...]`.
    pub fn group_array(&self, group: ParamGroup) -> Result<ArrayD<f64>> {
        let span = self.layout.span(group)?;
        let block = self
            .draws
            .slice(s![.., .., span.offset..span.offset + span.len()])
            .to_owned();
        let mut shape = vec![self.n_chains(), self.n_draws()];
        shape.extend_from_slice(&span.shape);
        Ok(block.into_shape_with_order(IxDyn(&shape))?)
    }

    /// Model parameters of one retained draw, rebuilt by [`ParamLayout::params_from_row`]
    /// (baseline log-odds saturate near ±27.6).
    pub fn params(&self, chain: usize, draw: usize) -> Result<Params> {
        if chain >= self.n_chains() || draw >= self.n_draws() {
            return Err(OccuError::Shape(format!(
                "no draw {draw} in chain {chain} ({} chains × {} draws)",
                self.n_chains(),
                self.n_draws()
            )));
        }
        let row = self.draws.slice(s![chain, draw, ..]).to_vec();
        self.layout.params_from_row(&row)
    }

    /// Parameters of every retained draw, chain by chain.
    pub fn pooled_params(&self) -> Result<Vec<Params>> {
        let mut out = Vec::with_capacity(self.n_chains() * self.n_draws());
        for chain in 0..self.n_chains() {
            for draw in 0..self.n_draws() {
                out.push(self.params(chain, draw)?);
            }
        }
        Ok(out)
    }

    /// Mean, sd and quantiles of every applicable column, joined with convergence
    /// diagnostics when given.
    pub fn parameter_table(&self, diagnostics: Option<&Diagnostics>) -> Vec<ParamSummary> {
        self.layout
            .columns()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.applicable)
            .map(|(i, c)| {
                let values: Array1<f64> = self.draws.index_axis(Axis(2), i).iter().copied().collect();
                let (mean, sd) = mean_sd(&values);
                let [q2_5, median, q97_5] = quantiles(&values, [INTERVAL.0, 0.5, INTERVAL.1]);
                let diag = diagnostics.and_then(|d| d.get(&c.name));
                ParamSummary {
                    name: c.name.clone(),
                    mean,
                    sd,
                    q2_5,
                    median,
                    q97_5,
                    rhat: diag.map(|d| d.rhat),
                    ess: diag.map(|d| d.ess),
                }
            })
            .collect()
    }

    /// Occupancy probability per valid (PA, period) under each scenario.
    pub fn occupancy_table(
        &self,
        design: &SurveyDesign,
        scenarios: &[OccupancyScenario],
    ) -> Result<Vec<CellSummary>> {
        let interaction = self.layout.interaction();
        self.cell_table(design, scenarios, |params, sc, cell| {
            let eta = params.occupancy_logit(interaction, sc.species, cell, sc.other_present);
            (sc.species, None, sc.other_present, inv_logit(eta))
        })
    }

    /// Detection probability per valid (PA, period) under each scenario.
    pub fn detection_table(
        &self,
        design: &SurveyDesign,
        scenarios: &[DetectionScenario],
    ) -> Result<Vec<CellSummary>> {
        self.cell_table(design, scenarios, |params, sc, cell| {
            let eta = params.detection_logit(sc.species, cell, sc.diel, sc.predator_present);
            (
                sc.species,
                Some(sc.diel),
                sc.predator_present,
                inv_logit(eta),
            )
        })
    }

    fn cell_table<S, F>(
        &self,
        design: &SurveyDesign,
        scenarios: &[S],
        f: F,
    ) -> Result<Vec<CellSummary>>
    where
        F: Fn(&Params, &S, usize) -> (Species, Option<Diel>, bool, f64),
    {
        let periods = self.layout.periods();
        if design.layout() != periods {
            return Err(OccuError::Shape(
                "design has a different PA/period structure than the posterior".into(),
            ));
        }
        let draws = self.pooled_params()?;
        let mut rows = Vec::new();
        for sc in scenarios {
            for (cell_id, cell) in periods.cells().iter().enumerate() {
                let mut values = Vec::with_capacity(draws.len());
                let mut key = None;
                for params in &draws {
                    let (species, diel, present, value) = f(params, sc, cell_id);
                    key = Some((species, diel, present));
                    values.push(value);
                }
                let Some((species, diel, other_present)) = key else {
                    continue;
                };
                let values = Array1::from(values);
                let (mean, _) = mean_sd(&values);
                let [lower, upper] = quantiles(&values, [INTERVAL.0, INTERVAL.1]);
                rows.push(CellSummary {
                    species,
                    pa: cell.pa + 1,
                    period: cell.period + 1,
                    year: design.year(cell.pa, cell.period),
                    diel,
                    other_present,
                    mean,
                    lower,
                    upper,
                });
            }
        }
        Ok(rows)
    }
}

/// Every combination of species and presence of the other species.
pub fn occupancy_scenarios() -> Vec<OccupancyScenario> {
    Species::ALL
        .iter()
        .flat_map(|&species| {
            [false, true].map(|other_present| OccupancyScenario {
                species,
                other_present,
            })
        })
        .collect()
}

/// Every combination of species, diel category and predator presence.
pub fn detection_scenarios() -> Vec<DetectionScenario> {
    let mut out = Vec::new();
    for species in Species::ALL {
        for diel in Diel::ALL {
            for predator_present in [false, true] {
                out.push(DetectionScenario {
                    species,
                    diel,
                    predator_present,
                });
            }
        }
    }
    out
}

/// Mean and sample standard deviation, NaN where undefined.
fn mean_sd(values: &Array1<f64>) -> (f64, f64) {
    let mean = values.mean().unwrap_or(f64::NAN);
    let sd = if values.len() > 1 {
        values.std(1.0)
    } else {
        f64::NAN
    };
    (mean, sd)
}

/// Quantiles at `probs` with linear interpolation between order statistics (type 7).
///
/// Every quantile is NaN when `values` is empty or holds a NaN.
pub fn quantiles<const N: usize>(values: &Array1<f64>, probs: [f64; N]) -> [f64; N] {
    let checked: Option<Array1<N64>> = values.iter().map(|&v| N64::try_new(v)).collect();
    match checked {
        Some(mut data) if !data.is_empty() => probs.map(|p| {
            data.quantile_mut(n64(p.clamp(0.0, 1.0)), &Linear)
                .map_or(f64::NAN, N64::raw)
        }),
        _ => [f64::NAN; N],
    }
}
