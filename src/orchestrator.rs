/*!
# Chain Orchestrator

Runs several independent [`OccupancyChain`]s in parallel, discards burn-in, thins, and hands
back a [`Posterior`]. Configuration errors are reported before any chain starts; a non-finite
value in any chain aborts the whole run.

```rust
use predprey_mcmc::data::{Diel, SurveyData, SurveyDesign};
use predprey_mcmc::orchestrator::{OccupancySampler, RunConfig};
use ndarray::Array3;

let design = SurveyDesign::balanced(6, vec![1], &[Diel::Day, Diel::Night], 3).unwrap();
let data = SurveyData::new(design, Array3::zeros((6, 2, 2))).unwrap();

let config = RunConfig {
    n_iter: 40,
    n_burnin: 20,
    thin: 2,
    n_chains: 2,
    seed: Some(42),
    ..RunConfig::default()
};
let sampler = OccupancySampler::new(data, config).unwrap();
let posterior = sampler.run().unwrap();
assert_eq!(posterior.draws().dim().1, 10);
```
*/

use std::sync::Arc;

use ndarray::Array2;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::{ChainRunner, HasChains, Retention};
use crate::data::SurveyData;
use crate::error::{OccuError, Result};
use crate::layout::ParamLayout;
use crate::model::{OccupancyInteraction, OccupancyModel};
use crate::sampler::{ChainSettings, OccupancyChain};
use crate::summary::{Acceptance, Posterior};

/// Acceptance rates outside this band are logged after a run.
const ACCEPTANCE_BAND: (f64, f64) = (0.05, 0.9);

/// Everything that controls a sampling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub n_iter: usize,
    pub n_burnin: usize,
    pub thin: usize,
    pub n_chains: usize,
    /// Global seed; chain `i` uses `seed + i`. Drawn from entropy when absent.
    pub seed: Option<u64>,
    pub init_jitter: f64,
    pub adapt_interval: usize,
    pub target_acceptance: f64,
    pub rhat_threshold: f64,
    /// Also record the latent states `z` in every draw.
    pub monitor_latent: bool,
    pub interaction: OccupancyInteraction,
    pub progress: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            n_iter: 3000,
            n_burnin: 1000,
            thin: 2,
            n_chains: 3,
            seed: None,
            init_jitter: 0.5,
            adapt_interval: 50,
            target_acceptance: 0.44,
            rhat_threshold: 1.1,
            monitor_latent: false,
            interaction: OccupancyInteraction::default(),
            progress: false,
        }
    }
}

impl RunConfig {
    /// Rejects configurations that cannot produce a usable run.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(OccuError::Config(msg));
        if self.n_iter == 0 {
            return fail("n_iter must be positive".into());
        }
        if self.n_burnin >= self.n_iter {
            return fail(format!(
                "n_burnin ({}) must be smaller than n_iter ({})",
                self.n_burnin, self.n_iter
            ));
        }
        if self.thin == 0 {
            return fail("thin must be positive".into());
        }
        if self.n_chains == 0 {
            return fail("n_chains must be positive".into());
        }
        if self.adapt_interval == 0 {
            return fail("adapt_interval must be positive".into());
        }
        if !(self.target_acceptance > 0.0 && self.target_acceptance < 1.0) {
            return fail(format!(
                "target_acceptance must lie in (0, 1), got {}",
                self.target_acceptance
            ));
        }
        if !(self.init_jitter.is_finite() && self.init_jitter > 0.0) {
            return fail(format!("init_jitter must be positive, got {}", self.init_jitter));
        }
        if !(self.rhat_threshold > 1.0) {
            return fail(format!(
                "rhat_threshold must exceed 1, got {}",
                self.rhat_threshold
            ));
        }
        Ok(())
    }

    pub fn retention(&self) -> Result<Retention> {
        Retention::new(self.n_iter, self.n_burnin, self.thin)
    }

    /// Number of draws each chain keeps.
    pub fn n_retained(&self) -> Result<usize> {
        Ok(self.retention()?.n_kept())
    }

    fn chain_settings(&self) -> ChainSettings {
        ChainSettings {
            adapt_until: self.n_burnin,
            adapt_interval: self.adapt_interval,
            target_acceptance: self.target_acceptance,
            init_jitter: self.init_jitter,
            ..ChainSettings::default()
        }
    }
}

/// Multi-chain sampler for one dataset.
#[derive(Debug, Clone)]
pub struct OccupancySampler {
    pub model: OccupancyModel,
    pub config: RunConfig,
    pub layout: Arc<ParamLayout>,
    /// The vector of independent Markov chains.
    pub chains: Vec<OccupancyChain>,
    /// The global random seed.
    pub seed: u64,
}

impl OccupancySampler {
    /// Validates the configuration and creates `n_chains` chains with dispersed starts.
    pub fn new(data: SurveyData, config: RunConfig) -> Result<Self> {
        config.validate()?;
        let model = OccupancyModel::new(data, config.interaction);
        let design = model.design();
        let layout = Arc::new(ParamLayout::new(
            design.layout(),
            config.interaction,
            design.n_sites(),
            config.monitor_latent,
        ));
        let seed = config.seed.unwrap_or_else(|| thread_rng().gen::<u64>());
        let settings = config.chain_settings();
        let chains = (0..config.n_chains)
            .map(|i| {
                OccupancyChain::new(
                    model.clone(),
                    layout.clone(),
                    settings,
                    i,
                    seed.wrapping_add(i as u64),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            model,
            config,
            layout,
            chains,
            seed,
        })
    }

    /**
    Sets a new global seed and rebuilds every chain from it.

    Chain `i` receives `seed + i`, so its starting values and its whole trajectory are
    reproducible.
    */
    pub fn set_seed(mut self, seed: u64) -> Result<Self> {
        let settings = self.config.chain_settings();
        for chain in self.chains.iter_mut() {
            let i = chain.id;
            *chain = OccupancyChain::new(
                self.model.clone(),
                self.layout.clone(),
                settings,
                i,
                seed.wrapping_add(i as u64),
            )?;
        }
        self.seed = seed;
        self.config.seed = Some(seed);
        Ok(self)
    }

    /// Runs every chain to completion and collects the retained draws.
    pub fn run(mut self) -> Result<Posterior> {
        let retention = self.config.retention()?;
        info!(
            chains = self.config.n_chains,
            iterations = self.config.n_iter,
            burnin = self.config.n_burnin,
            thin = self.config.thin,
            seed = self.seed,
            "starting sampler"
        );
        let draws = if self.config.progress {
            self.run_chains_with_progress(retention)?
        } else {
            self.run_chains(retention)?
        };
        info!(
            draws_per_chain = retention.n_kept(),
            columns = self.layout.len(),
            "sampling finished"
        );

        let acceptance = self.acceptance();
        for (name, rate) in acceptance.mean_by_scalar() {
            if rate < ACCEPTANCE_BAND.0 || rate > ACCEPTANCE_BAND.1 {
                warn!(parameter = %name, rate, "extreme acceptance rate");
            }
        }
        Posterior::new(self.layout, draws, acceptance)
    }

    fn acceptance(&self) -> Acceptance {
        let names: Vec<String> = self
            .model
            .free_scalars()
            .into_iter()
            .map(|s| self.model.scalar_name(s))
            .collect();
        let mut rates = Array2::zeros((self.chains.len(), names.len()));
        for (mut row, chain) in rates.rows_mut().into_iter().zip(&self.chains) {
            row.iter_mut()
                .zip(chain.acceptance())
                .for_each(|(r, a)| *r = a);
        }
        Acceptance { names, rates }
    }
}

impl HasChains<f64> for OccupancySampler {
    type Chain = OccupancyChain;

    fn chains_mut(&mut self) -> &mut Vec<Self::Chain> {
        &mut self.chains
    }
}
