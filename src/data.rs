/*!
Survey design and observed detection data.

A camera-trap survey is a set of sites, each belonging to one protected area (PA) and one
sampling period. Every site carries, per species and per stratum, the number of independent
detection opportunities (`n_occasions`) and, once observed, the number of detections (`y`).

Not every PA was surveyed for the same number of periods. [`PeriodLayout`] resolves the valid
(PA, period) combinations once, up front, and assigns each one a dense *cell* id. Everything
downstream indexes by cell and never has to ask whether a combination exists.

# Examples

```rust
use predprey_mcmc::data::{Diel, PeriodLayout, SurveyDesign};

let layout = PeriodLayout::new(vec![2, 1, 3]).unwrap();
assert_eq!(layout.n_cells(), 6);
assert!(layout.cell_id(1, 1).is_none());

let design = SurveyDesign::balanced(12, vec![1, 1], &[Diel::Day, Diel::Night], 5).unwrap();
assert_eq!(design.n_sites(), 12);
```
*/

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use ndarray::{Array2, Array3, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{OccuError, Result};

/// The two interacting species. Array axes over species always use [`Species::index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Species {
    Predator,
    Prey,
}

impl Species {
    pub const ALL: [Species; 2] = [Species::Predator, Species::Prey];

    pub fn index(self) -> usize {
        match self {
            Species::Predator => 0,
            Species::Prey => 1,
        }
    }

    pub fn other(self) -> Species {
        match self {
            Species::Predator => Species::Prey,
            Species::Prey => Species::Predator,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Species::Predator => "Predator",
            Species::Prey => "Prey",
        }
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Time-of-day class of a stratum. Day is the baseline of the detection model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Diel {
    Day,
    Night,
    Twilight,
}

impl Diel {
    pub const ALL: [Diel; 3] = [Diel::Day, Diel::Night, Diel::Twilight];

    pub fn index(self) -> usize {
        match self {
            Diel::Day => 0,
            Diel::Night => 1,
            Diel::Twilight => 2,
        }
    }

    /// Builds the category from the `night`/`twilight` indicator pair.
    pub fn from_indicators(night: u8, twilight: u8) -> Result<Diel> {
        match (night, twilight) {
            (0, 0) => Ok(Diel::Day),
            (1, 0) => Ok(Diel::Night),
            (0, 1) => Ok(Diel::Twilight),
            (1, 1) => Err(OccuError::Data(
                "night and twilight indicators are mutually exclusive".into(),
            )),
            _ => Err(OccuError::Data(format!(
                "diel indicators must be 0 or 1, got ({night}, {twilight})"
            ))),
        }
    }

    /// `(night, twilight)` covariate values.
    pub fn indicators(self) -> (f64, f64) {
        match self {
            Diel::Day => (0.0, 0.0),
            Diel::Night => (1.0, 0.0),
            Diel::Twilight => (0.0, 1.0),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Diel::Day => "day",
            Diel::Night => "night",
            Diel::Twilight => "twilight",
        }
    }
}

impl fmt::Display for Diel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// One valid (PA, period) combination. Both indices are 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub pa: usize,
    pub period: usize,
}

/// Adjacency from protected area to its ordered set of valid periods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodLayout {
    n_periods: Vec<usize>,
    offsets: Vec<usize>,
    cells: Vec<Cell>,
}

impl PeriodLayout {
    /// Builds the layout from the per-PA period cardinalities.
    pub fn new(n_periods: Vec<usize>) -> Result<Self> {
        if n_periods.is_empty() {
            return Err(OccuError::Data("at least one protected area is required".into()));
        }
        let mut offsets = Vec::with_capacity(n_periods.len());
        let mut cells = Vec::new();
        for (pa, &n) in n_periods.iter().enumerate() {
            offsets.push(cells.len());
            cells.extend((0..n).map(|period| Cell { pa, period }));
        }
        if cells.is_empty() {
            return Err(OccuError::Data("no protected area has a valid period".into()));
        }
        Ok(Self {
            n_periods,
            offsets,
            cells,
        })
    }

    pub fn n_pas(&self) -> usize {
        self.n_periods.len()
    }

    /// Largest period count over all PAs; the period extent of dense arrays.
    pub fn max_periods(&self) -> usize {
        self.n_periods.iter().copied().max().unwrap_or(0)
    }

    pub fn n_periods(&self, pa: usize) -> usize {
        self.n_periods.get(pa).copied().unwrap_or(0)
    }

    pub fn periods(&self, pa: usize) -> Range<usize> {
        0..self.n_periods(pa)
    }

    pub fn n_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, id: usize) -> Cell {
        self.cells[id]
    }

    pub fn is_valid(&self, pa: usize, period: usize) -> bool {
        period < self.n_periods(pa)
    }

    pub fn cell_id(&self, pa: usize, period: usize) -> Option<usize> {
        self.is_valid(pa, period).then(|| self.offsets[pa] + period)
    }
}

/// Everything about a survey except what was detected: sites, strata, effort and the
/// PA/period structure. The predictive simulator reuses it unchanged.
#[derive(Debug, Clone)]
pub struct SurveyDesign {
    n_occasions: Array3<u32>,
    strata: Vec<Diel>,
    site_pa: Vec<usize>,
    site_period: Vec<usize>,
    layout: PeriodLayout,
    site_cell: Vec<usize>,
    sites_by_cell: Vec<Vec<usize>>,
    all_sites: Vec<usize>,
    years: BTreeMap<(usize, usize), i32>,
}

impl SurveyDesign {
    /**
    Validates and indexes a survey design.

    # Arguments

    * `n_occasions` - Trial counts shaped `[site, species, stratum]`.
    * `night`, `twilight` - Per-stratum 0/1 indicators, mutually exclusive.
    * `site_pa`, `site_period` - 0-based PA and period of every site.
    * `n_periods` - Number of valid periods per PA.
    */
    pub fn new(
        n_occasions: Array3<u32>,
        night: &[u8],
        twilight: &[u8],
        site_pa: Vec<usize>,
        site_period: Vec<usize>,
        n_periods: Vec<usize>,
    ) -> Result<Self> {
        let (n_sites, n_species, n_strata) = n_occasions.dim();
        if n_species != Species::ALL.len() {
            return Err(OccuError::Shape(format!(
                "n_occasions has {n_species} species, expected {}",
                Species::ALL.len()
            )));
        }
        if n_sites == 0 || n_strata == 0 {
            return Err(OccuError::Shape(
                "n_occasions needs at least one site and one stratum".into(),
            ));
        }
        if night.len() != n_strata || twilight.len() != n_strata {
            return Err(OccuError::Shape(format!(
                "expected {n_strata} diel indicators, got night={} twilight={}",
                night.len(),
                twilight.len()
            )));
        }
        if site_pa.len() != n_sites || site_period.len() != n_sites {
            return Err(OccuError::Shape(format!(
                "expected PA and period for {n_sites} sites, got {} and {}",
                site_pa.len(),
                site_period.len()
            )));
        }
        let strata = night
            .iter()
            .zip(twilight)
            .map(|(&n, &t)| Diel::from_indicators(n, t))
            .collect::<Result<Vec<_>>>()?;

        let layout = PeriodLayout::new(n_periods)?;
        let mut site_cell = Vec::with_capacity(n_sites);
        let mut sites_by_cell = vec![Vec::new(); layout.n_cells()];
        for (site, (&pa, &period)) in site_pa.iter().zip(&site_period).enumerate() {
            let cell = layout.cell_id(pa, period).ok_or_else(|| {
                OccuError::Data(format!(
                    "site {site} has PA {pa} / period {period} outside the valid periods"
                ))
            })?;
            site_cell.push(cell);
            sites_by_cell[cell].push(site);
        }

        Ok(Self {
            n_occasions,
            strata,
            site_pa,
            site_period,
            layout,
            site_cell,
            sites_by_cell,
            all_sites: (0..n_sites).collect(),
            years: BTreeMap::new(),
        })
    }

    /// A design with sites spread round-robin over all valid cells and the same number of
    /// occasions everywhere. Handy for simulation studies.
    pub fn balanced(
        n_sites: usize,
        n_periods: Vec<usize>,
        strata: &[Diel],
        occasions: u32,
    ) -> Result<Self> {
        let layout = PeriodLayout::new(n_periods.clone())?;
        let (site_pa, site_period): (Vec<usize>, Vec<usize>) = (0..n_sites)
            .map(|site| {
                let cell = layout.cell(site % layout.n_cells());
                (cell.pa, cell.period)
            })
            .unzip();
        let (night, twilight): (Vec<u8>, Vec<u8>) = strata
            .iter()
            .map(|d| {
                let (n, t) = d.indicators();
                (n as u8, t as u8)
            })
            .unzip();
        let n_occasions = Array3::from_elem((n_sites, Species::ALL.len(), strata.len()), occasions);
        Self::new(n_occasions, &night, &twilight, site_pa, site_period, n_periods)
    }

    /// Attaches a calendar year to (PA, period) cells, for presentation only.
    pub fn with_years(
        mut self,
        years: impl IntoIterator<Item = ((usize, usize), i32)>,
    ) -> Result<Self> {
        for ((pa, period), year) in years {
            if !self.layout.is_valid(pa, period) {
                return Err(OccuError::Data(format!(
                    "year given for invalid PA {pa} / period {period}"
                )));
            }
            self.years.insert((pa, period), year);
        }
        Ok(self)
    }

    pub fn n_sites(&self) -> usize {
        self.site_cell.len()
    }

    pub fn n_strata(&self) -> usize {
        self.strata.len()
    }

    pub fn layout(&self) -> &PeriodLayout {
        &self.layout
    }

    pub fn n_occasions(&self) -> &Array3<u32> {
        &self.n_occasions
    }

    pub fn occasions(&self, site: usize, species: Species) -> ArrayView1<'_, u32> {
        self.n_occasions
            .index_axis(ndarray::Axis(0), site)
            .index_axis_move(ndarray::Axis(0), species.index())
    }

    pub fn strata(&self) -> &[Diel] {
        &self.strata
    }

    pub fn stratum(&self, j: usize) -> Diel {
        self.strata[j]
    }

    pub fn site_pa(&self, site: usize) -> usize {
        self.site_pa[site]
    }

    pub fn site_period(&self, site: usize) -> usize {
        self.site_period[site]
    }

    pub fn site_cell(&self, site: usize) -> usize {
        self.site_cell[site]
    }

    pub fn sites_in_cell(&self, cell: usize) -> &[usize] {
        &self.sites_by_cell[cell]
    }

    pub fn all_sites(&self) -> &[usize] {
        &self.all_sites
    }

    pub fn year(&self, pa: usize, period: usize) -> Option<i32> {
        self.years.get(&(pa, period)).copied()
    }
}

/// Observed detections on top of a [`SurveyDesign`].
#[derive(Debug, Clone)]
pub struct SurveyData {
    design: SurveyDesign,
    y: Array3<u32>,
    detected: Array2<bool>,
}

impl SurveyData {
    /// Pairs a design with detection counts `y[site, species, stratum]`, checking that the
    /// shapes agree and that no count exceeds its number of occasions.
    pub fn new(design: SurveyDesign, y: Array3<u32>) -> Result<Self> {
        if y.dim() != design.n_occasions.dim() {
            return Err(OccuError::Shape(format!(
                "y has shape {:?} but n_occasions has shape {:?}",
                y.shape(),
                design.n_occasions.shape()
            )));
        }
        if let Some(((site, sp, j), _)) = y
            .indexed_iter()
            .find(|&(idx, &v)| v > design.n_occasions[idx])
        {
            return Err(OccuError::Data(format!(
                "y[{site},{sp},{j}] = {} exceeds n_occasions = {}",
                y[[site, sp, j]],
                design.n_occasions[[site, sp, j]]
            )));
        }
        let detected = Array2::from_shape_fn((design.n_sites(), Species::ALL.len()), |(i, s)| {
            y.index_axis(ndarray::Axis(0), i)
                .index_axis(ndarray::Axis(0), s)
                .iter()
                .any(|&v| v > 0)
        });
        Ok(Self {
            design,
            y,
            detected,
        })
    }

    pub fn design(&self) -> &SurveyDesign {
        &self.design
    }

    pub fn y(&self) -> &Array3<u32> {
        &self.y
    }

    pub fn counts(&self, site: usize, species: Species) -> ArrayView1<'_, u32> {
        self.y
            .index_axis(ndarray::Axis(0), site)
            .index_axis_move(ndarray::Axis(0), species.index())
    }

    /// Whether the species was detected at least once at the site.
    pub fn detected(&self, site: usize, species: Species) -> bool {
        self.detected[[site, species.index()]]
    }
}
