//! predprey-mcmc CLI
//!
//! Simulates a camera-trap survey from known parameter values, fits the occupancy model to it,
//! and reports convergence diagnostics, posterior tables and a posterior-predictive check.

use std::error::Error;
use std::fs;
use std::path::PathBuf;

use clap::Parser;
use ndarray::Array2;
use predprey_mcmc::data::{Diel, Species, SurveyData, SurveyDesign};
use predprey_mcmc::diagnostics::diagnose;
use predprey_mcmc::model::{simulate, Effect, Params};
use predprey_mcmc::orchestrator::{OccupancySampler, RunConfig};
use predprey_mcmc::predictive::posterior_predictive;
use predprey_mcmc::summary::{detection_scenarios, occupancy_scenarios};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "predprey-mcmc")]
#[command(about = "Predator-prey occupancy model fitted by MCMC on a simulated survey")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Run configuration (JSON). Missing fields take their defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of surveyed sites
    #[arg(long, default_value = "200")]
    sites: usize,

    /// Valid periods per protected area, comma separated
    #[arg(long, value_delimiter = ',', default_value = "2,1,3")]
    periods: Vec<usize>,

    /// Occasions per site, species and stratum
    #[arg(long, default_value = "5")]
    occasions: u32,

    /// Posterior draws used for the predictive check
    #[arg(long, default_value = "100")]
    ppc_draws: usize,

    /// Overrides the seed of the run configuration
    #[arg(long)]
    seed: Option<u64>,

    /// Overrides the number of iterations of the run configuration
    #[arg(long)]
    iterations: Option<usize>,

    /// Directory for CSV output (requires the `csv` feature)
    #[arg(short, long)]
    out: Option<PathBuf>,
}

/// Values the survey is simulated from.
fn truth(n_cells: usize, config: &RunConfig) -> Result<Params, Box<dyn Error>> {
    let mut p0 = Array2::zeros((2, n_cells));
    let mut psi0 = Array2::zeros((2, n_cells));
    p0.row_mut(Species::Predator.index()).fill(0.25);
    p0.row_mut(Species::Prey.index()).fill(0.3);
    psi0.row_mut(Species::Predator.index()).fill(0.4);
    psi0.row_mut(Species::Prey.index()).fill(0.6);

    let mut params = Params::from_probabilities(&p0, &psi0)?
        .with_beta(Effect::Night, Species::Predator, 0.8)
        .with_beta(Effect::Night, Species::Prey, -0.5)
        .with_beta(Effect::Twilight, Species::Predator, 0.3)
        .with_beta(Effect::Twilight, Species::Prey, 0.2)
        .with_beta(Effect::Psi, Species::Prey, -0.7)
        .with_beta(Effect::PsiNight, Species::Prey, 0.4);
    if let Some(species) = config.interaction.dependent() {
        params.set_beta(Effect::PsiPsi, species, 1.2);
    }
    Ok(params)
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config: RunConfig = match &cli.config {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
        None => RunConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config.seed = Some(seed);
    }
    if let Some(n_iter) = cli.iterations {
        config.n_iter = n_iter;
    }
    config.validate()?;
    let seed = *config.seed.get_or_insert_with(rand::random);

    let design = SurveyDesign::balanced(
        cli.sites,
        cli.periods.clone(),
        &[Diel::Day, Diel::Night, Diel::Twilight],
        cli.occasions,
    )?;
    let years: Vec<((usize, usize), i32)> = design
        .layout()
        .cells()
        .iter()
        .map(|c| ((c.pa, c.period), 2018 + c.period as i32))
        .collect();
    let design = design.with_years(years)?;

    let truth = truth(design.layout().n_cells(), &config)?;
    let mut rng = SmallRng::seed_from_u64(seed);
    let survey = simulate(&design, config.interaction, &truth, &mut rng)?;
    let data = SurveyData::new(design.clone(), survey.y)?;
    info!(
        sites = design.n_sites(),
        cells = design.layout().n_cells(),
        "simulated survey"
    );

    let posterior = OccupancySampler::new(data.clone(), config.clone())?.run()?;
    let diagnostics = diagnose(&posterior, config.rhat_threshold)?;

    println!(
        "Max Rhat: {:.3} ({} instances above {}), min ESS: {:.0}",
        diagnostics.max_rhat(),
        diagnostics.non_converged().len(),
        diagnostics.threshold,
        diagnostics.min_ess()
    );

    let table = posterior.parameter_table(Some(&diagnostics));
    println!(
        "\n{:<28} {:>8} {:>8} {:>8} {:>8} {:>7}",
        "parameter", "mean", "2.5%", "97.5%", "ess", "rhat"
    );
    for row in &table {
        println!(
            "{:<28} {:>8.3} {:>8.3} {:>8.3} {:>8.0} {:>7.3}",
            row.name,
            row.mean,
            row.q2_5,
            row.q97_5,
            row.ess.unwrap_or(f64::NAN),
            row.rhat.unwrap_or(f64::NAN)
        );
    }

    let occupancy = posterior.occupancy_table(&design, &occupancy_scenarios())?;
    println!("\nOccupancy");
    for row in &occupancy {
        println!(
            "{:<9} PA {} period {} ({}) other present: {:<5} {:.3} [{:.3}, {:.3}]",
            row.species,
            row.pa,
            row.period,
            row.year.map_or("-".to_string(), |y| y.to_string()),
            row.other_present,
            row.mean,
            row.lower,
            row.upper
        );
    }
    let detection = posterior.detection_table(&design, &detection_scenarios())?;
    println!("\nDetection");
    for row in &detection {
        println!(
            "{:<9} PA {} period {} {:<9} predator present: {:<5} {:.3} [{:.3}, {:.3}]",
            row.species,
            row.pa,
            row.period,
            row.diel.map_or("-".to_string(), |d| d.to_string()),
            row.other_present,
            row.mean,
            row.lower,
            row.upper
        );
    }

    let k = cli.ppc_draws.min(posterior.n_chains() * posterior.n_draws());
    let check = posterior_predictive(&posterior, &data, k, seed)?;
    let exceedance = check.exceedance();
    println!("\nPosterior-predictive check ({k} draws)");
    for species in Species::ALL {
        for diel in Diel::ALL {
            println!(
                "{:<9} {:<9} observed {:>5}  P(sim >= obs) = {:.2}",
                species,
                diel,
                check.observed.total(species, diel),
                exceedance[[species.index(), diel.index()]]
            );
        }
    }

    match &cli.out {
        #[cfg(feature = "csv")]
        Some(dir) => {
            use predprey_mcmc::io::csv::{save_draws_csv, save_table_csv};
            fs::create_dir_all(dir)?;
            save_draws_csv(&posterior, dir.join("draws.csv"))?;
            save_table_csv(&table, dir.join("parameters.csv"))?;
            save_table_csv(&diagnostics.params, dir.join("diagnostics.csv"))?;
            save_table_csv(&occupancy, dir.join("occupancy.csv"))?;
            save_table_csv(&detection, dir.join("detection.csv"))?;
            save_table_csv(&check.rows(), dir.join("predictive.csv"))?;
            info!(dir = %dir.display(), "wrote CSV output");
        }
        #[cfg(not(feature = "csv"))]
        Some(_) => {
            tracing::warn!("--out needs the `csv` feature; nothing written");
        }
        None => {}
    }

    Ok(())
}
