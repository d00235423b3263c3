/*!
The predator–prey occupancy model.

For a site `i` in protected area `a` and period `t` (cell `c`), and stratum `j`:

- `logit psi[i,sp] = logit psi0[sp,c] + beta.psi.psi[sp] * z[i,other]` (the interaction term
  only for the species selected by [`OccupancyInteraction`]),
- `z[i,sp] ~ Bernoulli(psi[i,sp])`,
- `logit p[i,sp,j] = logit p0[sp,c] + beta.night[sp] * night[j] + beta.twilight[sp] * twilight[j]`,
  plus, for the prey only, `z[i,Pred] * (beta.psi + beta.psi.night * night[j] +
  beta.psi.twilight * twilight[j])`,
- `y[i,sp,j] ~ Binomial(n_occasions[i,sp,j], z[i,sp] * p[i,sp,j])`.

Effects have Logistic(0, 1) priors; baselines have Uniform(0, 1) priors. [`OccupancyModel`]
evaluates the joint log-density as a pure function of a [`Sample`] and the data, and
[`simulate`] runs the same process forward.
*/

use std::sync::Arc;

use ndarray::{Array2, Array3};
use rand::Rng;
use rand_distr::{Binomial, Distribution};
use serde::{Deserialize, Serialize};

use crate::data::{Diel, Species, SurveyData, SurveyDesign};
use crate::distributions::{
    bernoulli_logit_log_pmf, binomial_logit_kernel, inv_logit, logistic_log_pdf, logit,
};
use crate::error::{OccuError, Result};

/// Regression effects, each indexed by species.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Effect {
    /// Night effect on detection.
    Night,
    /// Twilight effect on detection.
    Twilight,
    /// Predator presence effect on prey detection.
    Psi,
    /// Predator presence × night effect on prey detection.
    PsiNight,
    /// Predator presence × twilight effect on prey detection.
    PsiTwilight,
    /// Effect of the other species' presence on occupancy.
    PsiPsi,
}

impl Effect {
    pub const ALL: [Effect; 6] = [
        Effect::Night,
        Effect::Twilight,
        Effect::Psi,
        Effect::PsiNight,
        Effect::PsiTwilight,
        Effect::PsiPsi,
    ];

    pub fn index(self) -> usize {
        match self {
            Effect::Night => 0,
            Effect::Twilight => 1,
            Effect::Psi => 2,
            Effect::PsiNight => 3,
            Effect::PsiTwilight => 4,
            Effect::PsiPsi => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Effect::Night => "beta.night",
            Effect::Twilight => "beta.twilight",
            Effect::Psi => "beta.psi",
            Effect::PsiNight => "beta.psi.night",
            Effect::PsiTwilight => "beta.psi.twilight",
            Effect::PsiPsi => "beta.psi.psi",
        }
    }
}

/// Which species' occupancy depends on the other's latent presence.
///
/// Only one direction can be active at a time so that the latent layer stays acyclic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccupancyInteraction {
    /// Predator occupancy depends on prey presence.
    #[default]
    PredatorOnPrey,
    /// Prey occupancy depends on predator presence.
    PreyOnPredator,
    /// Neither occupancy depends on the other species.
    Independent,
}

impl OccupancyInteraction {
    /// The species whose occupancy carries the `beta.psi.psi` term.
    pub fn dependent(self) -> Option<Species> {
        match self {
            OccupancyInteraction::PredatorOnPrey => Some(Species::Predator),
            OccupancyInteraction::PreyOnPredator => Some(Species::Prey),
            OccupancyInteraction::Independent => None,
        }
    }

    /// Whether `effect` enters the model for `species`.
    pub fn is_active(self, effect: Effect, species: Species) -> bool {
        match effect {
            Effect::Night | Effect::Twilight => true,
            Effect::Psi | Effect::PsiNight | Effect::PsiTwilight => species == Species::Prey,
            Effect::PsiPsi => self.dependent() == Some(species),
        }
    }

    /// Order in which latent states must be drawn when simulating.
    pub fn simulation_order(self) -> [Species; 2] {
        match self {
            OccupancyInteraction::PreyOnPredator => [Species::Predator, Species::Prey],
            _ => [Species::Prey, Species::Predator],
        }
    }
}

/// Model parameters on the sampling scale.
///
/// Baselines are stored as log-odds, shaped `[species, cell]`; effects are shaped
/// `[effect, species]`. Effects that are not active for a species are ignored by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    pub logit_p0: Array2<f64>,
    pub logit_psi0: Array2<f64>,
    pub beta: Array2<f64>,
}

impl Params {
    /// All baselines at 0.5 and all effects at 0.
    pub fn new(n_cells: usize) -> Self {
        Self {
            logit_p0: Array2::zeros((Species::ALL.len(), n_cells)),
            logit_psi0: Array2::zeros((Species::ALL.len(), n_cells)),
            beta: Array2::zeros((Effect::ALL.len(), Species::ALL.len())),
        }
    }

    /// Builds parameters from baseline probabilities shaped `[species, cell]`.
    pub fn from_probabilities(p0: &Array2<f64>, psi0: &Array2<f64>) -> Result<Self> {
        if p0.dim() != psi0.dim() || p0.nrows() != Species::ALL.len() {
            return Err(OccuError::Shape(format!(
                "p0 {:?} and psi0 {:?} must both be [2, n_cells]",
                p0.shape(),
                psi0.shape()
            )));
        }
        Ok(Self {
            logit_p0: p0.mapv(logit),
            logit_psi0: psi0.mapv(logit),
            beta: Array2::zeros((Effect::ALL.len(), Species::ALL.len())),
        })
    }

    pub fn with_beta(mut self, effect: Effect, species: Species, value: f64) -> Self {
        self.set_beta(effect, species, value);
        self
    }

    pub fn n_cells(&self) -> usize {
        self.logit_p0.ncols()
    }

    pub fn beta(&self, effect: Effect, species: Species) -> f64 {
        self.beta[[effect.index(), species.index()]]
    }

    pub fn set_beta(&mut self, effect: Effect, species: Species, value: f64) {
        self.beta[[effect.index(), species.index()]] = value;
    }

    pub fn p0(&self, species: Species, cell: usize) -> f64 {
        inv_logit(self.logit_p0[[species.index(), cell]])
    }

    pub fn psi0(&self, species: Species, cell: usize) -> f64 {
        inv_logit(self.logit_psi0[[species.index(), cell]])
    }

    pub fn get(&self, scalar: Scalar) -> f64 {
        match scalar {
            Scalar::P0 { species, cell } => self.logit_p0[[species.index(), cell]],
            Scalar::Psi0 { species, cell } => self.logit_psi0[[species.index(), cell]],
            Scalar::Beta { effect, species } => self.beta(effect, species),
        }
    }

    pub fn set(&mut self, scalar: Scalar, value: f64) {
        match scalar {
            Scalar::P0 { species, cell } => self.logit_p0[[species.index(), cell]] = value,
            Scalar::Psi0 { species, cell } => self.logit_psi0[[species.index(), cell]] = value,
            Scalar::Beta { effect, species } => self.set_beta(effect, species, value),
        }
    }

    /// Occupancy log-odds of `species` in `cell` given whether the other species is present.
    pub fn occupancy_logit(
        &self,
        interaction: OccupancyInteraction,
        species: Species,
        cell: usize,
        other_present: bool,
    ) -> f64 {
        let mut eta = self.logit_psi0[[species.index(), cell]];
        if other_present && interaction.dependent() == Some(species) {
            eta += self.beta(Effect::PsiPsi, species);
        }
        eta
    }

    /// Per-stratum detection log-odds of `species` in `cell`.
    pub fn detection_logit(
        &self,
        species: Species,
        cell: usize,
        diel: Diel,
        predator_present: bool,
    ) -> f64 {
        let (night, twilight) = diel.indicators();
        let mut eta = self.logit_p0[[species.index(), cell]]
            + self.beta(Effect::Night, species) * night
            + self.beta(Effect::Twilight, species) * twilight;
        if species == Species::Prey && predator_present {
            eta += self.beta(Effect::Psi, species)
                + self.beta(Effect::PsiNight, species) * night
                + self.beta(Effect::PsiTwilight, species) * twilight;
        }
        eta
    }
}

/// One real-valued coordinate of [`Params`] that the sampler updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scalar {
    P0 { species: Species, cell: usize },
    Psi0 { species: Species, cell: usize },
    Beta { effect: Effect, species: Species },
}

impl Scalar {
    /// The cell this coordinate is local to, if any.
    pub fn cell(&self) -> Option<usize> {
        match *self {
            Scalar::P0 { cell, .. } | Scalar::Psi0 { cell, .. } => Some(cell),
            Scalar::Beta { .. } => None,
        }
    }
}

/// A point-in-time assignment of every parameter and every latent state.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub params: Params,
    /// Latent presence, shaped `[site, species]`.
    pub z: Array2<u8>,
}

/// Latent states and detections produced by running the model forward.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedSurvey {
    pub z: Array2<u8>,
    pub y: Array3<u32>,
}

/// Runs the generative process on `design` with the given parameter values.
pub fn simulate<R: Rng + ?Sized>(
    design: &SurveyDesign,
    interaction: OccupancyInteraction,
    params: &Params,
    rng: &mut R,
) -> Result<SimulatedSurvey> {
    if params.n_cells() != design.layout().n_cells() {
        return Err(OccuError::Shape(format!(
            "parameters cover {} cells, design has {}",
            params.n_cells(),
            design.layout().n_cells()
        )));
    }
    let n_sites = design.n_sites();
    let mut z = Array2::<u8>::zeros((n_sites, Species::ALL.len()));
    let mut y = Array3::<u32>::zeros(design.n_occasions().dim());

    for site in 0..n_sites {
        let cell = design.site_cell(site);
        for species in interaction.simulation_order() {
            let other_present = z[[site, species.other().index()]] == 1;
            let psi = inv_logit(params.occupancy_logit(interaction, species, cell, other_present));
            z[[site, species.index()]] = rng.gen_bool(psi) as u8;
        }
        let predator_present = z[[site, Species::Predator.index()]] == 1;
        for species in Species::ALL {
            if z[[site, species.index()]] == 0 {
                continue;
            }
            for (j, &diel) in design.strata().iter().enumerate() {
                let n = design.n_occasions()[[site, species.index(), j]];
                let p = inv_logit(params.detection_logit(species, cell, diel, predator_present));
                let binomial = Binomial::new(n as u64, p)
                    .map_err(|e| OccuError::Sampling(format!("binomial({n}, {p}): {e}")))?;
                y[[site, species.index(), j]] = binomial.sample(rng) as u32;
            }
        }
    }
    Ok(SimulatedSurvey { z, y })
}

/// The model bound to its observed data.
#[derive(Debug, Clone)]
pub struct OccupancyModel {
    pub data: Arc<SurveyData>,
    pub interaction: OccupancyInteraction,
}

impl OccupancyModel {
    pub fn new(data: SurveyData, interaction: OccupancyInteraction) -> Self {
        Self {
            data: Arc::new(data),
            interaction,
        }
    }

    pub fn design(&self) -> &SurveyDesign {
        self.data.design()
    }

    pub fn n_cells(&self) -> usize {
        self.design().layout().n_cells()
    }

    /// Every coordinate with a prior, in sweep order: baselines cell by cell, then effects.
    pub fn free_scalars(&self) -> Vec<Scalar> {
        let mut scalars = Vec::new();
        for species in Species::ALL {
            for cell in 0..self.n_cells() {
                scalars.push(Scalar::Psi0 { species, cell });
                scalars.push(Scalar::P0 { species, cell });
            }
        }
        for effect in Effect::ALL {
            for species in Species::ALL {
                if self.interaction.is_active(effect, species) {
                    scalars.push(Scalar::Beta { effect, species });
                }
            }
        }
        scalars
    }

    /// Human-readable name of a coordinate, on the probability scale for baselines.
    pub fn scalar_name(&self, scalar: Scalar) -> String {
        let layout = self.design().layout();
        match scalar {
            Scalar::P0 { species, cell } | Scalar::Psi0 { species, cell } => {
                let c = layout.cell(cell);
                let group = if matches!(scalar, Scalar::P0 { .. }) {
                    "p0"
                } else {
                    "psi0"
                };
                format!("{group}[{species},{},{}]", c.pa + 1, c.period + 1)
            }
            Scalar::Beta { effect, species } => format!("{}[{species}]", effect.name()),
        }
    }

    /// Occupancy log-odds at `site`, given the other species' latent state.
    pub fn logit_psi(&self, params: &Params, site: usize, species: Species, z_other: u8) -> f64 {
        let cell = self.design().site_cell(site);
        params.occupancy_logit(self.interaction, species, cell, z_other == 1)
    }

    /// Detection log-odds at `site` and stratum `j`, given the predator's latent state.
    pub fn logit_p(
        &self,
        params: &Params,
        site: usize,
        species: Species,
        j: usize,
        z_pred: u8,
    ) -> f64 {
        let design = self.design();
        params.detection_logit(species, design.site_cell(site), design.stratum(j), z_pred == 1)
    }

    /// Log-likelihood of one species' detections at a site, given both latent states.
    ///
    /// An absent species contributes 0 if it was never detected and `-inf` otherwise.
    pub fn detection_log_lik(
        &self,
        params: &Params,
        site: usize,
        species: Species,
        z: [u8; 2],
    ) -> f64 {
        if z[species.index()] == 0 {
            return if self.data.detected(site, species) {
                f64::NEG_INFINITY
            } else {
                0.0
            };
        }
        let z_pred = z[Species::Predator.index()];
        let counts = self.data.counts(site, species);
        let trials = self.design().occasions(site, species);
        counts
            .iter()
            .zip(trials.iter())
            .enumerate()
            .map(|(j, (&y, &n))| {
                binomial_logit_kernel(y, n, self.logit_p(params, site, species, j, z_pred))
            })
            .sum()
    }

    /// Log-probability of one species' latent state at a site.
    pub fn occupancy_log_prob(
        &self,
        params: &Params,
        site: usize,
        species: Species,
        z: [u8; 2],
    ) -> f64 {
        let eta = self.logit_psi(params, site, species, z[species.other().index()]);
        bernoulli_logit_log_pmf(z[species.index()], eta)
    }

    /// Joint log-density of everything at one site: both latent states and both species'
    /// detections.
    pub fn site_log_joint(&self, params: &Params, site: usize, z: [u8; 2]) -> f64 {
        Species::ALL
            .iter()
            .map(|&sp| {
                self.occupancy_log_prob(params, site, sp, z)
                    + self.detection_log_lik(params, site, sp, z)
            })
            .sum()
    }

    /// Sum of the prior log-densities of all free coordinates.
    pub fn log_prior(&self, params: &Params) -> f64 {
        self.free_scalars()
            .into_iter()
            .map(|s| logistic_log_pdf(params.get(s)))
            .sum()
    }

    /// Unnormalized joint log-posterior of a full sample.
    pub fn log_density(&self, sample: &Sample) -> f64 {
        let lik: f64 = (0..self.design().n_sites())
            .map(|site| self.site_log_joint(&sample.params, site, site_states(&sample.z, site)))
            .sum();
        self.log_prior(&sample.params) + lik
    }

    /// Runs the generative process on this model's design.
    pub fn simulate<R: Rng + ?Sized>(&self, params: &Params, rng: &mut R) -> Result<SimulatedSurvey> {
        simulate(self.design(), self.interaction, params, rng)
    }
}

/// Both latent states at a site as a `[predator, prey]` pair.
pub fn site_states(z: &Array2<u8>, site: usize) -> [u8; 2] {
    [
        z[[site, Species::Predator.index()]],
        z[[site, Species::Prey.index()]],
    ]
}
