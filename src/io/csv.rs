/*!
# Saving Posterior Output to CSV

Writes retained draws and summary tables to CSV files. Enable via the `csv` feature.
*/

use std::fs::File;
use std::path::Path;

use csv::Writer;
use ndarray::Axis;
use serde::Serialize;

use crate::error::Result;
use crate::summary::Posterior;

/**
Saves the retained draws of a posterior as a CSV file.

The file has a header row with `"chain"`, `"sample"` and the name of every applicable
parameter instance (e.g. `p0[Prey,2,1]`). Each subsequent row holds one retained draw of one
chain. Structurally absent instances are left out.

# Examples

```rust
use predprey_mcmc::data::{Diel, SurveyData, SurveyDesign};
use predprey_mcmc::io::csv::save_draws_csv;
use predprey_mcmc::orchestrator::{OccupancySampler, RunConfig};
use ndarray::Array3;

let design = SurveyDesign::balanced(4, vec![1], &[Diel::Day], 2).unwrap();
let data = SurveyData::new(design, Array3::zeros((4, 2, 1))).unwrap();
let config = RunConfig {
    n_iter: 10,
    n_burnin: 5,
    thin: 1,
    n_chains: 2,
    seed: Some(1),
    ..RunConfig::default()
};
let posterior = OccupancySampler::new(data, config)?.run()?;

save_draws_csv(&posterior, "/tmp/draws.csv")?;
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/
pub fn save_draws_csv<P: AsRef<Path>>(posterior: &Posterior, path: P) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);
    let layout = posterior.layout();
    let keep: Vec<usize> = layout
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, c)| c.applicable)
        .map(|(i, _)| i)
        .collect();

    let mut header: Vec<String> = vec!["chain".to_string(), "sample".to_string()];
    header.extend(keep.iter().map(|&i| layout.column(i).name.clone()));
    wtr.write_record(&header)?;

    for (chain_idx, chain) in posterior.draws().axis_iter(Axis(0)).enumerate() {
        for (sample_idx, sample) in chain.axis_iter(Axis(0)).enumerate() {
            let mut row = vec![chain_idx.to_string(), sample_idx.to_string()];
            row.extend(keep.iter().map(|&i| sample[i].to_string()));
            wtr.write_record(&row)?;
        }
    }

    wtr.flush()?;
    Ok(())
}

/// Saves any table of serializable rows, one record per row, with a header from the field
/// names.
pub fn save_table_csv<T: Serialize, P: AsRef<Path>>(rows: &[T], path: P) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Diel, PeriodLayout, Species};
    use crate::diagnostics::ParamDiagnostic;
    use crate::layout::ParamLayout;
    use crate::model::OccupancyInteraction;
    use crate::predictive::DetectionRow;
    use crate::summary::Acceptance;
    use csv::Reader;
    use ndarray::{Array2, Array3};
    use std::fs;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn posterior() -> Posterior {
        let periods = PeriodLayout::new(vec![2, 1]).unwrap();
        let layout = Arc::new(ParamLayout::new(
            &periods,
            OccupancyInteraction::Independent,
            3,
            false,
        ));
        let n = layout.len();
        let draws = Array3::from_shape_fn((2, 3, n), |(c, d, i)| {
            if layout.column(i).applicable {
                (c * 100 + d * 10) as f64 + 0.5
            } else {
                f64::NAN
            }
        });
        let acceptance = Acceptance {
            names: vec![],
            rates: Array2::zeros((2, 0)),
        };
        Posterior::new(layout, draws, acceptance).unwrap()
    }

    /// Draws are written chain by chain with only applicable columns.
    #[test]
    fn test_save_draws_csv() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let posterior = posterior();
        let file = NamedTempFile::new()?;
        save_draws_csv(&posterior, file.path())?;

        let contents = fs::read_to_string(file.path())?;
        let mut rdr = Reader::from_reader(contents.as_bytes());
        let headers = rdr.headers()?.clone();
        assert_eq!(&headers[0], "chain");
        assert_eq!(&headers[1], "sample");
        assert_eq!(&headers[2], "p0[Predator,1,1]");
        assert!(headers.iter().all(|h| h != "p0[Predator,2,2]"));
        assert!(headers.iter().all(|h| !h.starts_with("beta.psi.psi")));
        assert_eq!(headers.len(), 2 + posterior.layout().applicable_names().len());

        let records: Vec<_> = rdr.records().collect::<std::result::Result<_, _>>()?;
        assert_eq!(records.len(), 6);
        assert_eq!(&records[4][0], "1");
        assert_eq!(&records[4][1], "1");
        assert_eq!(&records[4][2], "110.5");
        assert!(!contents.contains("NaN"));
        Ok(())
    }

    #[test]
    fn test_save_table_csv() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let rows = vec![
            ParamDiagnostic {
                name: "beta.night[Prey]".into(),
                rhat: 1.01,
                ess: 850.0,
                converged: true,
            },
            ParamDiagnostic {
                name: "p0[Prey,1,1]".into(),
                rhat: 1.3,
                ess: 40.0,
                converged: false,
            },
        ];
        let file = NamedTempFile::new()?;
        save_table_csv(&rows, file.path())?;
        let contents = fs::read_to_string(file.path())?;
        let expected = r#"name,rhat,ess,converged
beta.night[Prey],1.01,850.0,true
"p0[Prey,1,1]",1.3,40.0,false"#;
        assert_eq!(contents.trim(), expected);

        let rows = vec![DetectionRow {
            replicate: 0,
            species: Species::Predator,
            diel: Diel::Night,
            detections: 7,
        }];
        save_table_csv(&rows, file.path())?;
        let contents = fs::read_to_string(file.path())?;
        assert_eq!(contents.trim(), "replicate,species,diel,detections\n0,Predator,Night,7");
        Ok(())
    }
}
