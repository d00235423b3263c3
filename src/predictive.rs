//! Posterior-predictive simulation.
//!
//! Each selected posterior draw is treated as the truth, and the generative model is run again
//! on the observed survey design with fresh latent states and detections. Every simulated
//! dataset is reduced to the same [`DetectionSummary`] as the observed data, so the `K`
//! simulated tables can be set against the observed one.

use ndarray::{Array2, Axis};
use rand::prelude::*;
use rand::seq::index;
use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::data::{Diel, Species, SurveyData, SurveyDesign};
use crate::error::{OccuError, Result};
use crate::model::simulate;
use crate::summary::Posterior;

/// Detection totals of one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionSummary {
    /// Total detections, shaped `[species, diel]`.
    pub detections: Array2<u64>,
    /// Number of sites where each species was detected at least once.
    pub sites_detected: [usize; 2],
}

/// One row of a [`DetectionSummary`] in long form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionRow {
    /// 0 for the observed data, `k + 1` for the `k`-th simulated dataset.
    pub replicate: usize,
    pub species: Species,
    pub diel: Diel,
    pub detections: u64,
}

impl DetectionSummary {
    /// Sums counts `y[site, species, stratum]` per species and diel category of the strata.
    pub fn from_counts(design: &SurveyDesign, y: &ndarray::Array3<u32>) -> Result<Self> {
        if y.dim() != design.n_occasions().dim() {
            return Err(OccuError::Shape(format!(
                "counts have shape {:?}, design expects {:?}",
                y.shape(),
                design.n_occasions().shape()
            )));
        }
        let mut detections = Array2::<u64>::zeros((Species::ALL.len(), Diel::ALL.len()));
        let mut sites_detected = [0; 2];
        for site_counts in y.axis_iter(Axis(0)) {
            for (s, counts) in site_counts.axis_iter(Axis(0)).enumerate() {
                for (j, &c) in counts.iter().enumerate() {
                    detections[[s, design.stratum(j).index()]] += c as u64;
                }
                if counts.iter().any(|&c| c > 0) {
                    sites_detected[s] += 1;
                }
            }
        }
        Ok(Self {
            detections,
            sites_detected,
        })
    }

    pub fn observed(data: &SurveyData) -> Result<Self> {
        Self::from_counts(data.design(), data.y())
    }

    pub fn total(&self, species: Species, diel: Diel) -> u64 {
        self.detections[[species.index(), diel.index()]]
    }

    /// Long-form rows tagged with `replicate`.
    pub fn rows(&self, replicate: usize) -> Vec<DetectionRow> {
        let mut out = Vec::with_capacity(self.detections.len());
        for species in Species::ALL {
            for diel in Diel::ALL {
                out.push(DetectionRow {
                    replicate,
                    species,
                    diel,
                    detections: self.total(species, diel),
                });
            }
        }
        out
    }
}

/// Observed summary next to `K` simulated ones.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictiveCheck {
    pub observed: DetectionSummary,
    pub simulated: Vec<DetectionSummary>,
    /// `(chain, draw)` of the posterior draw behind each simulated summary.
    pub draws: Vec<(usize, usize)>,
}

impl PredictiveCheck {
    /// Fraction of simulated totals at or above the observed total, shaped `[species, diel]`.
    pub fn exceedance(&self) -> Array2<f64> {
        let k = self.simulated.len() as f64;
        Array2::from_shape_fn(self.observed.detections.dim(), |idx| {
            if self.simulated.is_empty() {
                return f64::NAN;
            }
            let obs = self.observed.detections[idx];
            self.simulated
                .iter()
                .filter(|s| s.detections[idx] >= obs)
                .count() as f64
                / k
        })
    }

    /// The observed rows (replicate 0) followed by every simulated table.
    pub fn rows(&self) -> Vec<DetectionRow> {
        let mut out = self.observed.rows(0);
        for (k, sim) in self.simulated.iter().enumerate() {
            out.extend(sim.rows(k + 1));
        }
        out
    }
}

/**
Runs the predictive check on `k` posterior draws picked without replacement.

Draw selection uses `seed`; simulation `i` uses `seed + i`, so the result does not depend on
how rayon schedules the work.
*/
pub fn posterior_predictive(
    posterior: &Posterior,
    data: &SurveyData,
    k: usize,
    seed: u64,
) -> Result<PredictiveCheck> {
    let design = data.design();
    if design.layout() != posterior.layout().periods() {
        return Err(OccuError::Shape(
            "survey design does not match the posterior's PA/period structure".into(),
        ));
    }
    let total = posterior.n_chains() * posterior.n_draws();
    if k == 0 || k > total {
        return Err(OccuError::Config(format!(
            "predictive draws must be between 1 and {total}, got {k}"
        )));
    }
    let mut rng = SmallRng::seed_from_u64(seed);
    let picks: Vec<(usize, usize)> = index::sample(&mut rng, total, k)
        .into_iter()
        .map(|flat| (flat / posterior.n_draws(), flat % posterior.n_draws()))
        .collect();

    let interaction = posterior.layout().interaction();
    let simulated = picks
        .par_iter()
        .enumerate()
        .map(|(i, &(chain, draw))| {
            let params = posterior.params(chain, draw)?;
            let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(i as u64));
            let sim = simulate(design, interaction, &params, &mut rng)?;
            debug!(replicate = i, chain, draw, "simulated predictive dataset");
            DetectionSummary::from_counts(design, &sim.y)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PredictiveCheck {
        observed: DetectionSummary::observed(data)?,
        simulated,
        draws: picks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ParamLayout;
    use crate::model::{OccupancyInteraction, Params, Sample};
    use crate::summary::Acceptance;
    use ndarray::{s, Array3};
    use std::sync::Arc;

    fn data() -> SurveyData {
        let design =
            SurveyDesign::balanced(10, vec![1, 1], &[Diel::Day, Diel::Night, Diel::Twilight], 5)
                .unwrap();
        let mut y = Array3::zeros((10, 2, 3));
        y[[0, 0, 1]] = 2;
        y[[3, 0, 1]] = 1;
        y[[1, 1, 2]] = 4;
        SurveyData::new(design, y).unwrap()
    }

    /// A posterior whose every draw has the given baseline probabilities everywhere.
    fn posterior(p0: f64, psi0: f64) -> Posterior {
        let data = data();
        let layout = Arc::new(ParamLayout::new(
            data.design().layout(),
            OccupancyInteraction::PredatorOnPrey,
            10,
            false,
        ));
        let params = Params::from_probabilities(
            &Array2::from_elem((2, 2), p0),
            &Array2::from_elem((2, 2), psi0),
        )
        .unwrap();
        let sample = Sample {
            params,
            z: Array2::zeros((10, 2)),
        };
        let mut row = vec![0.0; layout.len()];
        layout.write_row(&sample, &mut row);
        let mut draws = Array3::zeros((3, 20, layout.len()));
        for c in 0..3 {
            for d in 0..20 {
                draws
                    .slice_mut(s![c, d, ..])
                    .iter_mut()
                    .zip(&row)
                    .for_each(|(o, &v)| *o = v);
            }
        }
        let acceptance = Acceptance {
            names: vec![],
            rates: Array2::zeros((3, 0)),
        };
        Posterior::new(layout, draws, acceptance).unwrap()
    }

    #[test]
    fn test_observed_summary() {
        let obs = DetectionSummary::observed(&data()).unwrap();
        assert_eq!(obs.total(Species::Predator, Diel::Night), 3);
        assert_eq!(obs.total(Species::Prey, Diel::Twilight), 4);
        assert_eq!(obs.total(Species::Prey, Diel::Day), 0);
        assert_eq!(obs.sites_detected, [2, 1]);
        assert_eq!(obs.rows(0).len(), 6);
    }

    #[test]
    fn test_predictive_schema_matches_observed() {
        let data = data();
        let check = posterior_predictive(&posterior(0.3, 0.6), &data, 10, 5).unwrap();
        assert_eq!(check.simulated.len(), 10);
        assert_eq!(check.draws.len(), 10);
        for sim in &check.simulated {
            assert_eq!(sim.detections.dim(), check.observed.detections.dim());
        }
        assert_eq!(check.rows().len(), 6 * 11);
        let mut picks = check.draws.clone();
        picks.sort_unstable();
        picks.dedup();
        assert_eq!(picks.len(), 10);
    }

    #[test]
    fn test_predictive_is_reproducible() {
        let data = data();
        let post = posterior(0.4, 0.5);
        let a = posterior_predictive(&post, &data, 8, 99).unwrap();
        let b = posterior_predictive(&post, &data, 8, 99).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unoccupied_world_produces_no_detections() {
        let data = data();
        let check = posterior_predictive(&posterior(0.9, 0.0), &data, 5, 1).unwrap();
        for sim in &check.simulated {
            assert!(sim.detections.iter().all(|&d| d == 0));
            assert_eq!(sim.sites_detected, [0, 0]);
        }
        // Observed prey twilight total is 4, never reached.
        let exceed = check.exceedance();
        assert_eq!(exceed[[Species::Prey.index(), Diel::Twilight.index()]], 0.0);
        assert_eq!(exceed[[Species::Prey.index(), Diel::Day.index()]], 1.0);
    }

    #[test]
    fn test_rejects_bad_draw_count() {
        let data = data();
        let post = posterior(0.3, 0.6);
        assert!(posterior_predictive(&post, &data, 0, 1).is_err());
        assert!(posterior_predictive(&post, &data, 61, 1).is_err());
        assert!(posterior_predictive(&post, &data, 60, 1).is_ok());
    }
}
