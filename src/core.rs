use indicatif::ProgressBar;
use indicatif::{MultiProgress, ProgressStyle};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::{OccuError, Result};

pub trait MarkovChain<S> {
    /// Does one iteration of the chain, returning the recorded row of the new state.
    fn step(&mut self) -> Result<&[S]>;

    /// Recorded row of the current state, without stepping.
    fn current_state(&self) -> &[S];
}

/// Which iterations of a run are kept: everything after `discard`, then every `thin`-th.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub n_steps: usize,
    pub discard: usize,
    pub thin: usize,
}

impl Retention {
    pub fn new(n_steps: usize, discard: usize, thin: usize) -> Result<Self> {
        if discard >= n_steps {
            return Err(OccuError::Config(format!(
                "burn-in ({discard}) must be smaller than the number of iterations ({n_steps})"
            )));
        }
        if thin == 0 {
            return Err(OccuError::Config("thinning must be positive".into()));
        }
        Ok(Self {
            n_steps,
            discard,
            thin,
        })
    }

    /// Number of rows a chain returns.
    pub fn n_kept(&self) -> usize {
        (self.n_steps - self.discard).div_ceil(self.thin)
    }

    /// Whether 0-based iteration `i` is kept.
    pub fn keeps(&self, i: usize) -> bool {
        i >= self.discard && (i - self.discard) % self.thin == 0
    }
}

pub fn run_chain<M>(chain: &mut M, retention: Retention) -> Result<Array2<f64>>
where
    M: MarkovChain<f64>,
{
    run_chain_inner(chain, retention, None)
}

pub fn run_chain_with_progress<M>(
    chain: &mut M,
    retention: Retention,
    pb: &ProgressBar,
) -> Result<Array2<f64>>
where
    M: MarkovChain<f64>,
{
    pb.set_length(retention.n_steps as u64);
    run_chain_inner(chain, retention, Some(pb))
}

fn run_chain_inner<M>(
    chain: &mut M,
    retention: Retention,
    pb: Option<&ProgressBar>,
) -> Result<Array2<f64>>
where
    M: MarkovChain<f64>,
{
    let dim = chain.current_state().len();
    let mut out = Array2::<f64>::zeros((retention.n_kept(), dim));
    let mut row = 0;

    for i in 0..retention.n_steps {
        let state = chain.step()?;
        if retention.keeps(i) {
            out.row_mut(row)
                .iter_mut()
                .zip(state)
                .for_each(|(o, &s)| *o = s);
            row += 1;
        }
        if let Some(pb) = pb {
            pb.inc(1);
        }
    }

    Ok(out)
}

/// A trait for "anything that owns multiple MarkovChains".
pub trait HasChains<S> {
    type Chain: MarkovChain<S> + std::marker::Send;

    /// Returns a mutable reference to the vector of chains.
    fn chains_mut(&mut self) -> &mut Vec<Self::Chain>;
}

pub trait ChainRunner: HasChains<f64> {
    /// Runs the chains in parallel and stacks the retained rows as `[chain, draw, column]`.
    fn run_chains(&mut self, retention: Retention) -> Result<Array3<f64>> {
        let results: Vec<Array2<f64>> = self
            .chains_mut()
            .par_iter_mut()
            .map(|chain| run_chain(chain, retention))
            .collect::<Result<_>>()?;
        stack_chains(results)
    }

    fn run_chains_with_progress(&mut self, retention: Retention) -> Result<Array3<f64>> {
        let multi = MultiProgress::new();
        let pb_style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        let results: Vec<Array2<f64>> = self
            .chains_mut()
            .par_iter_mut()
            .enumerate()
            .map(|(i, chain)| {
                let pb = multi.add(ProgressBar::new(retention.n_steps as u64));
                pb.set_prefix(format!("Chain {i}"));
                pb.set_style(pb_style.clone());

                let samples = run_chain_with_progress(chain, retention, &pb);
                match &samples {
                    Ok(_) => pb.finish_with_message("Done!"),
                    Err(_) => pb.abandon_with_message("Failed"),
                }
                samples
            })
            .collect::<Result<_>>()?;
        stack_chains(results)
    }
}

impl<T: HasChains<f64>> ChainRunner for T {}

fn stack_chains(results: Vec<Array2<f64>>) -> Result<Array3<f64>> {
    let views: Vec<ArrayView2<f64>> = results.iter().map(|m| m.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits the iteration counter in every column; fails once it reaches `fail_at`.
    struct Counter {
        state: Vec<f64>,
        fail_at: Option<usize>,
        i: usize,
    }

    impl MarkovChain<f64> for Counter {
        fn step(&mut self) -> Result<&[f64]> {
            if Some(self.i) == self.fail_at {
                return Err(OccuError::NonFinite {
                    chain: 0,
                    iteration: self.i,
                    parameter: "x".into(),
                });
            }
            self.state.iter_mut().for_each(|s| *s = self.i as f64);
            self.i += 1;
            Ok(&self.state)
        }

        fn current_state(&self) -> &[f64] {
            &self.state
        }
    }

    struct Pool(Vec<Counter>);

    impl HasChains<f64> for Pool {
        type Chain = Counter;

        fn chains_mut(&mut self) -> &mut Vec<Counter> {
            &mut self.0
        }
    }

    fn counter(fail_at: Option<usize>) -> Counter {
        Counter {
            state: vec![0.0; 2],
            fail_at,
            i: 0,
        }
    }

    #[test]
    fn test_retention_counts() {
        let r = Retention::new(3000, 1000, 2).unwrap();
        assert_eq!(r.n_kept(), 1000);
        assert!(r.keeps(1000));
        assert!(!r.keeps(1001));
        assert!(!r.keeps(999));
        assert_eq!(Retention::new(10, 3, 4).unwrap().n_kept(), 2);
    }

    #[test]
    fn test_retention_rejects_bad_config() {
        assert!(matches!(Retention::new(10, 10, 1), Err(OccuError::Config(_))));
        assert!(matches!(Retention::new(10, 12, 1), Err(OccuError::Config(_))));
        assert!(matches!(Retention::new(10, 2, 0), Err(OccuError::Config(_))));
    }

    #[test]
    fn test_run_chain_discards_and_thins() {
        let mut chain = counter(None);
        let out = run_chain(&mut chain, Retention::new(10, 4, 3).unwrap()).unwrap();
        assert_eq!(out.dim(), (2, 2));
        assert_eq!(out[[0, 0]], 4.0);
        assert_eq!(out[[1, 1]], 7.0);
    }

    #[test]
    fn test_runner_stacks_chains() {
        let mut pool = Pool(vec![counter(None), counter(None), counter(None)]);
        let draws = pool.run_chains(Retention::new(30, 10, 2).unwrap()).unwrap();
        assert_eq!(draws.dim(), (3, 10, 2));
        assert_eq!(draws[[2, 9, 0]], 28.0);
    }

    #[test]
    fn test_runner_fails_fast() {
        let mut pool = Pool(vec![counter(None), counter(Some(5))]);
        let res = pool.run_chains(Retention::new(30, 10, 2).unwrap());
        assert!(matches!(res, Err(OccuError::NonFinite { iteration: 5, .. })));
    }
}
