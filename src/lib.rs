/*!
# predprey-mcmc

Bayesian predator–prey occupancy models for repeated camera-trap surveys.

Two species share a set of sites. Each species is present at a site or not (a latent state),
and each survey stratum detects a present species with a probability that depends on time of
day and, for the prey, on whether the predator is there. This crate fits that model with
several parallel MCMC chains, checks convergence, summarizes the posterior, and runs a
posterior-predictive check.

- [`data`]: survey design, detection counts and the valid (protected area, period) cells.
- [`model`]: the generative model, its log-density and a forward simulator.
- [`sampler`]: one Markov chain (exact Gibbs for the latent states, adaptive random-walk
  Metropolis for everything else).
- [`orchestrator`]: run configuration and the multi-chain runner.
- [`diagnostics`]: Rhat and effective sample size.
- [`summary`]: posterior draws, parameter tables and counterfactual probability tables.
- [`predictive`]: posterior-predictive detection totals.
*/

pub mod core;
pub mod data;
pub mod diagnostics;
pub mod distributions;
pub mod error;
pub mod io;
pub mod layout;
pub mod model;
pub mod orchestrator;
pub mod predictive;
pub mod sampler;
pub mod summary;

pub use error::{OccuError, Result};
