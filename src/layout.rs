//! Flat column layout of a sampled state.
//!
//! A chain records every iteration as one row of `f64`s. [`ParamLayout`] fixes, once per run,
//! which typed parameter group and structural index each column holds. Baseline groups are laid
//! out densely over species × PA × max-period so that they reshape into regular arrays; the
//! combinations a PA never had are kept as columns but marked not applicable and hold NaN.

use crate::data::{PeriodLayout, Species};
use crate::distributions::{logit, PROB_EPS};
use crate::error::{OccuError, Result};
use crate::model::{Effect, OccupancyInteraction, Params, Sample};

/// A monitored group of parameters or latent states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamGroup {
    P0,
    Psi0,
    Beta(Effect),
    Z,
}

impl ParamGroup {
    pub fn name(self) -> &'static str {
        match self {
            ParamGroup::P0 => "p0",
            ParamGroup::Psi0 => "psi0",
            ParamGroup::Beta(effect) => effect.name(),
            ParamGroup::Z => "z",
        }
    }
}

/// Structural index of one column within its group. All indices are 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamIndex {
    Cell {
        species: Species,
        pa: usize,
        period: usize,
    },
    Effect {
        species: Species,
    },
    Latent {
        site: usize,
        species: Species,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub group: ParamGroup,
    pub index: ParamIndex,
    /// False for structurally absent instances, which are NaN in every draw.
    pub applicable: bool,
    /// Dense cell id for applicable baseline columns.
    cell: Option<usize>,
}

/// Contiguous range of columns that belong to one group, with its array shape.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpan {
    pub group: ParamGroup,
    pub offset: usize,
    pub shape: Vec<usize>,
}

impl GroupSpan {
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamLayout {
    columns: Vec<Column>,
    spans: Vec<GroupSpan>,
    periods: PeriodLayout,
    interaction: OccupancyInteraction,
    n_sites: usize,
}

impl ParamLayout {
    /// Builds the layout for a design. Latent states are only included when `monitor_latent`.
    pub fn new(
        periods: &PeriodLayout,
        interaction: OccupancyInteraction,
        n_sites: usize,
        monitor_latent: bool,
    ) -> Self {
        let mut columns = Vec::new();
        let mut spans = Vec::new();
        let n_pas = periods.n_pas();
        let max_periods = periods.max_periods();

        for group in [ParamGroup::P0, ParamGroup::Psi0] {
            spans.push(GroupSpan {
                group,
                offset: columns.len(),
                shape: vec![Species::ALL.len(), n_pas, max_periods],
            });
            for species in Species::ALL {
                for pa in 0..n_pas {
                    for period in 0..max_periods {
                        let cell = periods.cell_id(pa, period);
                        columns.push(Column {
                            name: format!("{}[{species},{},{}]", group.name(), pa + 1, period + 1),
                            group,
                            index: ParamIndex::Cell {
                                species,
                                pa,
                                period,
                            },
                            applicable: cell.is_some(),
                            cell,
                        });
                    }
                }
            }
        }

        for effect in Effect::ALL {
            let group = ParamGroup::Beta(effect);
            spans.push(GroupSpan {
                group,
                offset: columns.len(),
                shape: vec![Species::ALL.len()],
            });
            for species in Species::ALL {
                columns.push(Column {
                    name: format!("{}[{species}]", effect.name()),
                    group,
                    index: ParamIndex::Effect { species },
                    applicable: interaction.is_active(effect, species),
                    cell: None,
                });
            }
        }

        if monitor_latent {
            spans.push(GroupSpan {
                group: ParamGroup::Z,
                offset: columns.len(),
                shape: vec![n_sites, Species::ALL.len()],
            });
            for site in 0..n_sites {
                for species in Species::ALL {
                    columns.push(Column {
                        name: format!("z[{},{species}]", site + 1),
                        group: ParamGroup::Z,
                        index: ParamIndex::Latent { site, species },
                        applicable: true,
                        cell: None,
                    });
                }
            }
        }

        Self {
            columns,
            spans,
            periods: periods.clone(),
            interaction,
            n_sites,
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, i: usize) -> &Column {
        &self.columns[i]
    }

    pub fn spans(&self) -> &[GroupSpan] {
        &self.spans
    }

    pub fn span(&self, group: ParamGroup) -> Result<&GroupSpan> {
        self.spans
            .iter()
            .find(|s| s.group == group)
            .ok_or_else(|| OccuError::UnknownParameter(group.name().to_string()))
    }

    pub fn periods(&self) -> &PeriodLayout {
        &self.periods
    }

    pub fn interaction(&self) -> OccupancyInteraction {
        self.interaction
    }

    pub fn n_sites(&self) -> usize {
        self.n_sites
    }

    pub fn monitors_latent(&self) -> bool {
        self.spans.iter().any(|s| s.group == ParamGroup::Z)
    }

    /// Column position of a parameter instance by its display name, e.g. `p0[Prey,2,1]`.
    pub fn position(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| OccuError::UnknownParameter(name.to_string()))
    }

    /// Names of all applicable columns, in column order.
    pub fn applicable_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.applicable)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Writes a sample as one row: probabilities for baselines, raw effects, 0/1 latent
    /// states, NaN for every non-applicable column.
    pub fn write_row(&self, sample: &Sample, out: &mut [f64]) {
        for (slot, col) in out.iter_mut().zip(&self.columns) {
            *slot = if !col.applicable {
                f64::NAN
            } else {
                match (col.group, col.index) {
                    (ParamGroup::P0, ParamIndex::Cell { species, .. }) => col
                        .cell
                        .map_or(f64::NAN, |c| sample.params.p0(species, c)),
                    (ParamGroup::Psi0, ParamIndex::Cell { species, .. }) => col
                        .cell
                        .map_or(f64::NAN, |c| sample.params.psi0(species, c)),
                    (ParamGroup::Beta(effect), ParamIndex::Effect { species }) => {
                        sample.params.beta(effect, species)
                    }
                    (ParamGroup::Z, ParamIndex::Latent { site, species }) => {
                        sample.z[[site, species.index()]] as f64
                    }
                    _ => f64::NAN,
                }
            };
        }
    }

    /// Rebuilds model parameters from one recorded row. Inapplicable effects come back as 0.
    ///
    /// Baselines are recorded as probabilities clamped to `[PROB_EPS, 1 - PROB_EPS]`, so their
    /// log-odds come back exact only within about ±27.6; sampled values further out are
    /// returned at that bound with their sign kept.
    pub fn params_from_row(&self, row: &[f64]) -> Result<Params> {
        if row.len() != self.columns.len() {
            return Err(OccuError::Shape(format!(
                "row has {} values, layout has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        let mut params = Params::new(self.periods.n_cells());
        for (&value, col) in row.iter().zip(&self.columns) {
            if !col.applicable {
                continue;
            }
            match (col.group, col.index, col.cell) {
                (ParamGroup::P0, ParamIndex::Cell { species, .. }, Some(c)) => {
                    params.logit_p0[[species.index(), c]] = logit(value);
                }
                (ParamGroup::Psi0, ParamIndex::Cell { species, .. }, Some(c)) => {
                    params.logit_psi0[[species.index(), c]] = logit(value);
                }
                (ParamGroup::Beta(effect), ParamIndex::Effect { species }, _) => {
                    params.set_beta(effect, species, value);
                }
                _ => {}
            }
        }
        Ok(params)
    }
}
