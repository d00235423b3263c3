/*!
# Occupancy Sampler Engine

One Markov chain over the joint posterior of the occupancy model. Each call to
[`MarkovChain::step`] performs one full sweep:

1. **Latent states.** Every `z[i,sp]` is drawn exactly from its full conditional. Only the
   terms at site `i` involve `z[i,sp]`, so the conditional odds of presence are the ratio of
   the site's joint density with `z[i,sp] = 1` and with `z[i,sp] = 0`. A species detected at a
   site is present there with probability one.
2. **Continuous coordinates.** Every free scalar (`p0` and `psi0` on the logit scale, the
   active `beta.*` effects) gets one random-walk Metropolis–Hastings update, accepted by the
   ratio of joint densities. Only the sites the coordinate touches are re-evaluated.
3. **Adaptation.** During burn-in, every `adapt_interval` iterations each proposal scale is
   nudged toward the target acceptance rate. At the end of burn-in the scales are frozen.

## Example Usage

```rust
use predprey_mcmc::core::MarkovChain;
use predprey_mcmc::data::{Diel, SurveyData, SurveyDesign};
use predprey_mcmc::layout::ParamLayout;
use predprey_mcmc::model::{OccupancyInteraction, OccupancyModel};
use predprey_mcmc::sampler::{ChainSettings, OccupancyChain};
use ndarray::Array3;
use std::sync::Arc;

let design = SurveyDesign::balanced(6, vec![1], &[Diel::Day, Diel::Night], 3).unwrap();
let data = SurveyData::new(design, Array3::zeros((6, 2, 2))).unwrap();
let model = OccupancyModel::new(data, OccupancyInteraction::PredatorOnPrey);
let layout = Arc::new(ParamLayout::new(
    model.design().layout(),
    model.interaction,
    model.design().n_sites(),
    false,
));

let mut chain = OccupancyChain::new(model, layout, ChainSettings::default(), 0, 42).unwrap();
let row = chain.step().unwrap();
assert!(row.iter().any(|v| v.is_finite()));
```
*/

use std::sync::Arc;

use ndarray::Array2;
use rand::prelude::*;
use rand_distr::Normal;
use tracing::debug;

use crate::core::MarkovChain;
use crate::data::Species;
use crate::distributions::{logistic_log_pdf, Proposal, RandomWalk};
use crate::error::{OccuError, Result};
use crate::layout::ParamLayout;
use crate::model::{site_states, OccupancyModel, Params, Sample, Scalar};

/// Per-chain tuning knobs, derived from the run configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainSettings {
    /// Number of burn-in iterations during which proposals adapt.
    pub adapt_until: usize,
    pub adapt_interval: usize,
    pub target_acceptance: f64,
    /// Standard deviation of the logit-scale perturbation of initial values.
    pub init_jitter: f64,
    /// Initial random-walk standard deviation.
    pub initial_scale: f64,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            adapt_until: 1000,
            adapt_interval: 50,
            target_acceptance: 0.44,
            init_jitter: 0.5,
            initial_scale: 0.5,
        }
    }
}

/// A single chain of the occupancy sampler.
#[derive(Debug, Clone)]
pub struct OccupancyChain {
    model: OccupancyModel,
    layout: Arc<ParamLayout>,
    state: Sample,
    targets: Vec<Scalar>,
    proposals: Vec<RandomWalk>,
    settings: ChainSettings,
    iteration: usize,
    /// Position of this chain within its run.
    pub id: usize,
    /// The chain-specific random seed.
    pub seed: u64,
    rng: SmallRng,
    row: Vec<f64>,
}

impl OccupancyChain {
    /**
    Creates a chain with dispersed starting values.

    Every free coordinate starts at a Normal(0, `init_jitter`) draw on its sampling scale. Each
    latent state starts at 1 where the species was detected and at a fair coin flip elsewhere.
    */
    pub fn new(
        model: OccupancyModel,
        layout: Arc<ParamLayout>,
        settings: ChainSettings,
        id: usize,
        seed: u64,
    ) -> Result<Self> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let targets = model.free_scalars();
        let jitter = Normal::new(0.0, settings.init_jitter)
            .map_err(|e| OccuError::Config(format!("init_jitter: {e}")))?;

        let mut params = Params::new(model.n_cells());
        for &scalar in &targets {
            params.set(scalar, jitter.sample(&mut rng));
        }
        let data = &model.data;
        let n_sites = model.design().n_sites();
        let z = Array2::from_shape_fn((n_sites, Species::ALL.len()), |(site, s)| {
            if data.detected(site, Species::ALL[s]) {
                1
            } else {
                rng.gen_bool(0.5) as u8
            }
        });

        let proposals = vec![RandomWalk::new(settings.initial_scale); targets.len()];
        let mut chain = Self {
            model,
            row: vec![0.0; layout.len()],
            layout,
            state: Sample { params, z },
            targets,
            proposals,
            settings,
            iteration: 0,
            id,
            seed,
            rng,
        };
        chain.record();
        Ok(chain)
    }

    /// Replaces the current state, e.g. to start from known values.
    ///
    /// Latent states must be 0 or 1, and 1 wherever the species was detected.
    pub fn with_state(mut self, state: Sample) -> Result<Self> {
        if state.params.n_cells() != self.model.n_cells()
            || state.z.dim() != self.state.z.dim()
        {
            return Err(OccuError::Shape(
                "state does not match the model's cells and sites".into(),
            ));
        }
        for ((site, s), &z) in state.z.indexed_iter() {
            let species = Species::ALL[s];
            if z > 1 {
                return Err(OccuError::Data(format!(
                    "z[{},{species}] is {z}, expected 0 or 1",
                    site + 1
                )));
            }
            if z == 0 && self.model.data.detected(site, species) {
                return Err(OccuError::Data(format!(
                    "z[{},{species}] is 0 but the species was detected there",
                    site + 1
                )));
            }
        }
        self.state = state;
        self.record();
        Ok(self)
    }

    pub fn sample(&self) -> &Sample {
        &self.state
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn targets(&self) -> &[Scalar] {
        &self.targets
    }

    pub fn proposals(&self) -> &[RandomWalk] {
        &self.proposals
    }

    /// Overall acceptance rate of each free coordinate, in [`OccupancyChain::targets`] order.
    pub fn acceptance(&self) -> Vec<f64> {
        self.proposals.iter().map(|p| p.acceptance_rate()).collect()
    }

    /// Unnormalized log-posterior of the current state.
    pub fn log_density(&self) -> f64 {
        self.model.log_density(&self.state)
    }

    fn record(&mut self) {
        self.layout.write_row(&self.state, &mut self.row);
    }

    fn update_latent(&mut self) -> Result<()> {
        for site in 0..self.model.design().n_sites() {
            for species in Species::ALL {
                let mut z = site_states(&self.state.z, site);
                z[species.index()] = 1;
                let present = self.model.site_log_joint(&self.state.params, site, z);
                z[species.index()] = 0;
                let absent = self.model.site_log_joint(&self.state.params, site, z);

                let prob = latent_probability(present, absent);
                if !prob.is_finite() {
                    return Err(OccuError::NonFinite {
                        chain: self.id,
                        iteration: self.iteration,
                        parameter: format!("z[{},{species}]", site + 1),
                    });
                }
                self.state.z[[site, species.index()]] = self.rng.gen_bool(prob) as u8;
            }
        }
        Ok(())
    }

    fn update_scalars(&mut self) {
        let design = self.model.design();
        for (scalar, proposal) in self.targets.iter().zip(self.proposals.iter_mut()) {
            let sites = match scalar.cell() {
                Some(cell) => design.sites_in_cell(cell),
                None => design.all_sites(),
            };
            let params = &mut self.state.params;
            let current = params.get(*scalar);
            let current_lp = local_log_density(&self.model, params, &self.state.z, sites)
                + logistic_log_pdf(current);

            let candidate = proposal.sample(current, &mut self.rng);
            params.set(*scalar, candidate);
            let candidate_lp = local_log_density(&self.model, params, &self.state.z, sites)
                + logistic_log_pdf(candidate);

            let log_q_forward = proposal.log_prob(current, candidate);
            let log_q_backward = proposal.log_prob(candidate, current);
            let log_accept_ratio = (candidate_lp + log_q_backward) - (current_lp + log_q_forward);

            let u: f64 = self.rng.gen();
            let accepted = log_accept_ratio > u.ln();
            if !accepted {
                params.set(*scalar, current);
            }
            proposal.record(accepted);
        }
    }

    fn adapt(&mut self) {
        let i = self.iteration;
        if i > self.settings.adapt_until {
            return;
        }
        if i % self.settings.adapt_interval == 0 {
            for p in &mut self.proposals {
                p.adapt(self.settings.target_acceptance);
            }
            debug!(chain = self.id, iteration = i, "adapted proposal scales");
        }
        if i == self.settings.adapt_until {
            self.proposals.iter_mut().for_each(RandomWalk::freeze);
            debug!(chain = self.id, iteration = i, "proposal scales frozen");
        }
    }

    fn check_finite(&self) -> Result<()> {
        match self
            .targets
            .iter()
            .find(|&&s| !self.state.params.get(s).is_finite())
        {
            Some(&s) => Err(OccuError::NonFinite {
                chain: self.id,
                iteration: self.iteration,
                parameter: self.model.scalar_name(s),
            }),
            None => Ok(()),
        }
    }
}

impl MarkovChain<f64> for OccupancyChain {
    fn step(&mut self) -> Result<&[f64]> {
        self.update_latent()?;
        self.update_scalars();
        self.iteration += 1;
        self.adapt();
        self.check_finite()?;
        self.record();
        Ok(&self.row)
    }

    fn current_state(&self) -> &[f64] {
        &self.row
    }
}

/// Full-conditional probability of presence from the log joint densities with the state set to
/// present and to absent.
pub fn latent_probability(present: f64, absent: f64) -> f64 {
    match (present == f64::NEG_INFINITY, absent == f64::NEG_INFINITY) {
        (true, true) => f64::NAN,
        (false, true) => 1.0,
        (true, false) => 0.0,
        (false, false) => 1.0 / (1.0 + (absent - present).exp()),
    }
}

fn local_log_density(
    model: &OccupancyModel,
    params: &Params,
    z: &Array2<u8>,
    sites: &[usize],
) -> f64 {
    sites
        .iter()
        .map(|&site| model.site_log_joint(params, site, site_states(z, site)))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Diel, SurveyData, SurveyDesign};
    use crate::distributions::inv_logit;
    use crate::model::{Effect, OccupancyInteraction};
    use approx::assert_abs_diff_eq;
    use ndarray::{arr2, Array3};

    fn model(y: Array3<u32>) -> OccupancyModel {
        let design =
            SurveyDesign::balanced(8, vec![2], &[Diel::Day, Diel::Night, Diel::Twilight], 4)
                .unwrap();
        OccupancyModel::new(
            SurveyData::new(design, y).unwrap(),
            OccupancyInteraction::PredatorOnPrey,
        )
    }

    fn chain(model: OccupancyModel, settings: ChainSettings, seed: u64) -> OccupancyChain {
        let layout = Arc::new(ParamLayout::new(
            model.design().layout(),
            model.interaction,
            model.design().n_sites(),
            true,
        ));
        OccupancyChain::new(model, layout, settings, 0, seed).unwrap()
    }

    #[test]
    fn test_latent_probability_cases() {
        assert_eq!(latent_probability(-3.0, f64::NEG_INFINITY), 1.0);
        assert_eq!(latent_probability(f64::NEG_INFINITY, -3.0), 0.0);
        assert!(latent_probability(f64::NEG_INFINITY, f64::NEG_INFINITY).is_nan());
        assert_abs_diff_eq!(latent_probability(-1.0, -1.0), 0.5, epsilon = 1e-15);
        assert_abs_diff_eq!(latent_probability(-1e4, 0.0), 0.0, epsilon = 1e-300);
    }

    #[test]
    fn test_latent_conditional_matches_closed_form() {
        // Undetected prey with no predator: P(z=1 | y=0) = psi q / (psi q + 1 - psi),
        // where q is the probability of zero detections over all occasions.
        let model = model(Array3::zeros((8, 2, 3)));
        let params = Params::from_probabilities(
            &arr2(&[[0.3, 0.3], [0.4, 0.4]]),
            &arr2(&[[0.5, 0.5], [0.6, 0.6]]),
        )
        .unwrap();
        let present = model.site_log_joint(&params, 0, [0, 1]);
        let absent = model.site_log_joint(&params, 0, [0, 0]);
        let psi = 0.6;
        let q = (1.0_f64 - 0.4).powi(12);
        let expected = psi * q / (psi * q + 1.0 - psi);
        assert_abs_diff_eq!(latent_probability(present, absent), expected, epsilon = 1e-10);
    }

    #[test]
    fn test_detected_species_stays_present() {
        let mut y = Array3::zeros((8, 2, 3));
        y[[3, 0, 1]] = 2;
        y[[5, 1, 0]] = 1;
        let mut chain = chain(model(y), ChainSettings::default(), 3);
        for _ in 0..50 {
            chain.step().unwrap();
            assert_eq!(chain.sample().z[[3, 0]], 1);
            assert_eq!(chain.sample().z[[5, 1]], 1);
        }
    }

    #[test]
    fn test_same_seed_same_trajectory() {
        let y = Array3::from_elem((8, 2, 3), 1);
        let mut a = chain(model(y.clone()), ChainSettings::default(), 9);
        let mut b = chain(model(y), ChainSettings::default(), 9);
        for _ in 0..20 {
            let ra = a.step().unwrap().to_vec();
            let rb = b.step().unwrap().to_vec();
            assert_eq!(
                ra.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
                rb.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn test_adaptation_stops_after_burn_in() {
        let settings = ChainSettings {
            adapt_until: 20,
            adapt_interval: 5,
            ..ChainSettings::default()
        };
        let mut chain = chain(model(Array3::from_elem((8, 2, 3), 1)), settings, 1);
        for _ in 0..20 {
            chain.step().unwrap();
        }
        let scales: Vec<f64> = chain.proposals().iter().map(|p| p.scale()).collect();
        assert!(chain.proposals().iter().all(|p| p.is_frozen()));
        for _ in 0..30 {
            chain.step().unwrap();
        }
        let after: Vec<f64> = chain.proposals().iter().map(|p| p.scale()).collect();
        assert_eq!(scales, after);
        assert!(chain.acceptance().iter().all(|&a| (0.0..=1.0).contains(&a)));
    }

    #[test]
    fn test_inactive_effects_never_move() {
        let mut chain = chain(model(Array3::from_elem((8, 2, 3), 2)), ChainSettings::default(), 5);
        for _ in 0..30 {
            chain.step().unwrap();
        }
        let params = &chain.sample().params;
        assert_eq!(params.beta(Effect::Psi, Species::Predator), 0.0);
        assert_eq!(params.beta(Effect::PsiPsi, Species::Prey), 0.0);
        assert_ne!(params.beta(Effect::Night, Species::Prey), 0.0);
    }

    #[test]
    fn test_with_state_and_recorded_row() {
        let model = model(Array3::zeros((8, 2, 3)));
        let mut params = Params::new(2);
        params.logit_p0[[1, 0]] = 0.7;
        let state = Sample {
            params,
            z: Array2::ones((8, 2)),
        };
        let chain = chain(model, ChainSettings::default(), 2).with_state(state).unwrap();
        assert_abs_diff_eq!(chain.current_state()[2], inv_logit(0.7), epsilon = 1e-12);
        assert!(chain.log_density().is_finite());

        let bad = Sample {
            params: Params::new(3),
            z: Array2::ones((8, 2)),
        };
        let model = chain.model.clone();
        assert!(super::OccupancyChain::new(
            model,
            chain.layout.clone(),
            ChainSettings::default(),
            0,
            1
        )
        .unwrap()
        .with_state(bad)
        .is_err());
    }

    #[test]
    fn test_with_state_rejects_invalid_latent_states() {
        let mut y = Array3::zeros((8, 2, 3));
        y[[0, 1, 2]] = 1;

        let mut z = Array2::ones((8, 2));
        z[[1, 0]] = 2;
        let state = Sample {
            params: Params::new(2),
            z,
        };
        let err = chain(model(y.clone()), ChainSettings::default(), 4)
            .with_state(state)
            .unwrap_err();
        assert!(matches!(err, OccuError::Data(ref m) if m.contains("z[2,Predator]")), "{err}");

        let mut z = Array2::ones((8, 2));
        z[[0, 1]] = 0;
        let state = Sample {
            params: Params::new(2),
            z,
        };
        let err = chain(model(y.clone()), ChainSettings::default(), 4)
            .with_state(state)
            .unwrap_err();
        assert!(matches!(err, OccuError::Data(ref m) if m.contains("z[1,Prey]")), "{err}");

        // Absent where nothing was detected is fine, and the chain can step.
        let mut z = Array2::ones((8, 2));
        z[[0, 0]] = 0;
        let state = Sample {
            params: Params::new(2),
            z,
        };
        let mut chain = chain(model(y), ChainSettings::default(), 4)
            .with_state(state)
            .unwrap();
        assert!(chain.step().is_ok());
    }

    #[test]
    fn test_rejects_bad_jitter() {
        let model = model(Array3::zeros((8, 2, 3)));
        let layout = Arc::new(ParamLayout::new(
            model.design().layout(),
            model.interaction,
            8,
            false,
        ));
        let settings = ChainSettings {
            init_jitter: -1.0,
            ..ChainSettings::default()
        };
        assert!(OccupancyChain::new(model, layout, settings, 0, 1).is_err());
    }
}
