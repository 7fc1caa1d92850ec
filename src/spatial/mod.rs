//! Spatial disaggregation of monthly forecasts.
//!
//! A [`SpatialModel`] partitions the territory into cells (a regular grid or
//! GeoJSON sectors), records how many historical incidents of each category
//! fell in every cell, and splits a [`ForecastResult`] across the cells in
//! proportion to those counts. Per category the cell allocations always sum
//! to the predicted total.

pub mod allocation;
pub mod criticality;
pub mod grid;
pub mod sector;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use geo::MultiPolygon;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dataset::{CategoryKind, IncidentRecord};
use crate::error::SpatialError;
use crate::ml::ForecastResult;
use crate::ml::persistence::{PersistenceError, read_bincode, write_bincode};
use crate::ml::series::YearMonth;

use allocation::allocate_proportional;
use criticality::{CriticalityLevel, CriticalityThresholds};
use grid::{Bounds, CentroidIndex, LatLon, build_grid};
use sector::{Sector, SectorIndex, load_sectors};

/// Spatial training settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    pub grid_rows: usize,
    pub grid_cols: usize,
    /// Fraction of each axis span added around the data's bounding box
    pub bounds_margin: f64,
    /// GeoJSON sectors; when set, sectors replace the grid
    pub sectors_path: Option<PathBuf>,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            grid_rows: 5,
            grid_cols: 5,
            bounds_margin: 0.05,
            sectors_path: None,
        }
    }
}

/// How the cells of a model were built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    Grid { rows: usize, cols: usize },
    Sectors { count: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellGeometry {
    Rectangle(Bounds),
    Polygon(MultiPolygon<f64>),
}

/// Historical incident counts, by kind then category id.
pub type CategoryCounts = BTreeMap<CategoryKind, BTreeMap<u32, u64>>;

/// One partition cell and its historical distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialCell {
    pub id: usize,
    /// Grid position (`R{row}C{col}`) or sector code
    pub code: String,
    pub name: String,
    pub centroid: LatLon,
    pub bounds: Bounds,
    pub geometry: CellGeometry,
    pub history: CategoryCounts,
}

impl SpatialCell {
    pub fn historical_count(&self, kind: CategoryKind, category_id: u32) -> u64 {
        self.history
            .get(&kind)
            .and_then(|m| m.get(&category_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn kind_total(&self, kind: CategoryKind) -> u64 {
        self.history
            .get(&kind)
            .map(|m| m.values().sum())
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        CategoryKind::ALL.iter().map(|k| self.kind_total(*k)).sum()
    }

    /// Most frequent category of `kind`, lowest id on ties.
    pub fn dominant_category(&self, kind: CategoryKind) -> Option<(u32, u64)> {
        self.history
            .get(&kind)?
            .iter()
            .filter(|(_, count)| **count > 0)
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(id, count)| (*id, *count))
    }

    fn record(&mut self, kind: CategoryKind, category_id: u32) {
        *self
            .history
            .entry(kind)
            .or_default()
            .entry(category_id)
            .or_insert(0) += 1;
    }
}

/// Predicted counts assigned to one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellAllocation {
    pub cell_id: usize,
    pub code: String,
    pub name: String,
    pub centroid: LatLon,
    pub allocations: BTreeMap<CategoryKind, BTreeMap<u32, u32>>,
    pub kind_totals: BTreeMap<CategoryKind, u64>,
    pub total: u64,
    pub criticality: CriticalityLevel,
    pub color: String,
    pub priority: u8,
}

impl CellAllocation {
    pub fn allocated(&self, kind: CategoryKind, category_id: u32) -> u32 {
        self.allocations
            .get(&kind)
            .and_then(|m| m.get(&category_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn kind_total(&self, kind: CategoryKind) -> u64 {
        self.kind_totals.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationSummary {
    pub period: YearMonth,
    pub total_predicted: u64,
    pub cell_count: usize,
    /// Highest total, lowest id on ties
    pub most_critical_cell: Option<usize>,
    pub most_critical_total: u64,
    pub tier_counts: BTreeMap<CriticalityLevel, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatmapLayer {
    Total,
    Complaints,
    Emergencies,
}

impl FromStr for HeatmapLayer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "total" => Ok(Self::Total),
            "complaints" | "denuncias" => Ok(Self::Complaints),
            "emergencies" | "emergencias" => Ok(Self::Emergencies),
            other => Err(format!("unknown heatmap layer '{other}'")),
        }
    }
}

impl fmt::Display for HeatmapLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Total => f.write_str("total"),
            Self::Complaints => f.write_str("complaints"),
            Self::Emergencies => f.write_str("emergencies"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatmapPoint {
    pub cell_id: usize,
    pub lat: f64,
    pub lon: f64,
    pub intensity: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryShare {
    pub kind: CategoryKind,
    pub category_id: u32,
    pub count: u64,
    /// Percentage of the category's incidents that fell in this cell
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellDetail {
    pub cell: SpatialCell,
    pub shares: Vec<CategoryShare>,
    pub kind_totals: BTreeMap<CategoryKind, u64>,
    pub dominant: BTreeMap<CategoryKind, u32>,
    pub criticality: CriticalityLevel,
}

/// Trained partition with per-cell historical counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialModel {
    partition: PartitionKind,
    cells: Vec<SpatialCell>,
    category_totals: CategoryCounts,
    attributed: usize,
    unattributed: usize,
    trained_at: DateTime<Utc>,
}

fn located(records: &[IncidentRecord]) -> Vec<(&IncidentRecord, LatLon)> {
    records
        .iter()
        .filter_map(|r| r.coordinates().map(|(lat, lon)| (r, LatLon { lat, lon })))
        .collect()
}

impl SpatialModel {
    /// Grid over the data's expanded bounding box; incidents go to the
    /// nearest cell centroid.
    pub fn train_grid(
        records: &[IncidentRecord],
        rows: usize,
        cols: usize,
        margin: f64,
        trained_at: DateTime<Utc>,
    ) -> Result<Self, SpatialError> {
        let points = located(records);
        let coords: Vec<LatLon> = points.iter().map(|(_, p)| *p).collect();
        let bounds = Bounds::from_points(&coords)
            .ok_or(SpatialError::NoCoordinates)?
            .expand(margin);

        let grid = build_grid(&bounds, rows, cols)?;
        let index = CentroidIndex::new(&grid);

        let mut cells: Vec<SpatialCell> = grid
            .iter()
            .map(|g| SpatialCell {
                id: g.id,
                code: format!("R{}C{}", g.row, g.col),
                name: format!("Cell {}", g.id + 1),
                centroid: g.centroid,
                bounds: g.bounds,
                geometry: CellGeometry::Rectangle(g.bounds),
                history: BTreeMap::new(),
            })
            .collect();

        let mut unattributed = 0;
        for (record, point) in &points {
            match index.nearest(*point) {
                Some(id) => cells[id].record(record.category.kind, record.category.id),
                None => unattributed += 1,
            }
        }

        Ok(Self::finish(
            PartitionKind::Grid { rows, cols },
            cells,
            points.len() - unattributed,
            unattributed,
            trained_at,
        ))
    }

    /// One cell per sector; incidents go to the first sector containing them.
    pub fn train_sectors(
        records: &[IncidentRecord],
        sectors: Vec<Sector>,
        trained_at: DateTime<Utc>,
    ) -> Result<Self, SpatialError> {
        if sectors.is_empty() {
            return Err(SpatialError::Sectors("no sectors defined".to_string()));
        }
        let points = located(records);
        if points.is_empty() {
            return Err(SpatialError::NoCoordinates);
        }

        let index = SectorIndex::new(&sectors);
        let assignments: Vec<_> = points
            .iter()
            .map(|(record, point)| (record.category, index.locate(*point)))
            .collect();

        let mut cells = Vec::with_capacity(sectors.len());
        for (id, sector) in sectors.iter().enumerate() {
            let bounds = sector
                .bounds()
                .ok_or_else(|| SpatialError::Sectors(format!("sector {} is empty", sector.code)))?;
            cells.push(SpatialCell {
                id,
                code: sector.code.clone(),
                name: sector.name.clone(),
                centroid: sector.centroid().unwrap_or_else(|| bounds.center()),
                bounds,
                geometry: CellGeometry::Polygon(sector.polygon.clone()),
                history: BTreeMap::new(),
            });
        }

        let mut unattributed = 0;
        for (category, cell) in assignments {
            match cell {
                Some(id) => cells[id].record(category.kind, category.id),
                None => unattributed += 1,
            }
        }
        if unattributed > 0 {
            warn!(unattributed, "Incidents outside every sector were not attributed");
        }

        Ok(Self::finish(
            PartitionKind::Sectors { count: cells.len() },
            cells,
            points.len() - unattributed,
            unattributed,
            trained_at,
        ))
    }

    fn finish(
        partition: PartitionKind,
        cells: Vec<SpatialCell>,
        attributed: usize,
        unattributed: usize,
        trained_at: DateTime<Utc>,
    ) -> Self {
        let mut category_totals = CategoryCounts::new();
        for cell in &cells {
            for (kind, counts) in &cell.history {
                let totals = category_totals.entry(*kind).or_default();
                for (id, count) in counts {
                    *totals.entry(*id).or_insert(0) += count;
                }
            }
        }

        info!(
            ?partition,
            cells = cells.len(),
            attributed,
            unattributed,
            "Spatial model trained"
        );

        Self {
            partition,
            cells,
            category_totals,
            attributed,
            unattributed,
            trained_at,
        }
    }

    pub fn partition(&self) -> PartitionKind {
        self.partition
    }

    /// Cells ordered by id.
    pub fn cells(&self) -> &[SpatialCell] {
        &self.cells
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    pub fn attributed(&self) -> usize {
        self.attributed
    }

    pub fn unattributed(&self) -> usize {
        self.unattributed
    }

    pub fn category_total(&self, kind: CategoryKind, category_id: u32) -> u64 {
        self.category_totals
            .get(&kind)
            .and_then(|m| m.get(&category_id))
            .copied()
            .unwrap_or(0)
    }

    /// Split every category of `forecast` across the cells.
    ///
    /// Categories with no history anywhere are spread uniformly.
    pub fn allocate(
        &self,
        forecast: &ForecastResult,
        thresholds: &CriticalityThresholds,
    ) -> Vec<CellAllocation> {
        let mut per_cell: Vec<BTreeMap<CategoryKind, BTreeMap<u32, u32>>> =
            vec![BTreeMap::new(); self.cells.len()];

        for (kind, predictions) in &forecast.predictions {
            for (&category_id, &predicted) in predictions {
                let weights: Vec<u64> = self
                    .cells
                    .iter()
                    .map(|c| c.historical_count(*kind, category_id))
                    .collect();
                let split = allocate_proportional(predicted, &weights);

                for (cell, units) in per_cell.iter_mut().zip(split) {
                    cell.entry(*kind).or_default().insert(category_id, units);
                }
            }
        }

        self.cells
            .iter()
            .zip(per_cell)
            .map(|(cell, allocations)| {
                let kind_totals: BTreeMap<CategoryKind, u64> = allocations
                    .iter()
                    .map(|(kind, m)| (*kind, m.values().map(|&v| v as u64).sum()))
                    .collect();
                let total = kind_totals.values().sum();
                let criticality = thresholds.classify(total);

                CellAllocation {
                    cell_id: cell.id,
                    code: cell.code.clone(),
                    name: cell.name.clone(),
                    centroid: cell.centroid,
                    allocations,
                    kind_totals,
                    total,
                    criticality,
                    color: criticality.color().to_string(),
                    priority: criticality.priority(),
                }
            })
            .collect()
    }

    /// Historical distribution of one cell, `None` for unknown ids.
    pub fn cell_detail(
        &self,
        cell_id: usize,
        thresholds: &CriticalityThresholds,
    ) -> Option<CellDetail> {
        let cell = self.cells.get(cell_id)?;

        let mut shares = Vec::new();
        for (kind, counts) in &cell.history {
            for (&category_id, &count) in counts {
                let total = self.category_total(*kind, category_id);
                let share = if total > 0 {
                    count as f64 / total as f64 * 100.0
                } else {
                    0.0
                };
                shares.push(CategoryShare {
                    kind: *kind,
                    category_id,
                    count,
                    share,
                });
            }
        }

        let kind_totals = CategoryKind::ALL
            .iter()
            .map(|k| (*k, cell.kind_total(*k)))
            .collect();
        let dominant = CategoryKind::ALL
            .iter()
            .filter_map(|k| cell.dominant_category(*k).map(|(id, _)| (*k, id)))
            .collect();

        Some(CellDetail {
            cell: cell.clone(),
            shares,
            kind_totals,
            dominant,
            criticality: thresholds.classify(cell.total()),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), SpatialError> {
        write_bincode(path, self)?;
        info!(path = %path.display(), cells = self.cells.len(), "Spatial model saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SpatialError> {
        match read_bincode(path) {
            Ok(model) => Ok(model),
            Err(PersistenceError::FileNotFound(_)) => Err(SpatialError::NotTrained),
            Err(e) => Err(e.into()),
        }
    }
}

/// Totals and tier counts of an allocation.
pub fn summarize(period: YearMonth, allocations: &[CellAllocation]) -> AllocationSummary {
    let mut tier_counts: BTreeMap<CriticalityLevel, usize> =
        CriticalityLevel::ALL.iter().map(|l| (*l, 0)).collect();
    for allocation in allocations {
        *tier_counts.entry(allocation.criticality).or_insert(0) += 1;
    }

    let most_critical = allocations
        .iter()
        .max_by(|a, b| a.total.cmp(&b.total).then(b.cell_id.cmp(&a.cell_id)));

    AllocationSummary {
        period,
        total_predicted: allocations.iter().map(|a| a.total).sum(),
        cell_count: allocations.len(),
        most_critical_cell: most_critical.map(|a| a.cell_id),
        most_critical_total: most_critical.map(|a| a.total).unwrap_or(0),
        tier_counts,
    }
}

/// Centroid points weighted by the chosen layer. Cells with zero intensity
/// are left out.
pub fn heatmap(allocations: &[CellAllocation], layer: HeatmapLayer) -> Vec<HeatmapPoint> {
    allocations
        .iter()
        .filter_map(|a| {
            let intensity = match layer {
                HeatmapLayer::Total => a.total,
                HeatmapLayer::Complaints => a.kind_total(CategoryKind::Complaints),
                HeatmapLayer::Emergencies => a.kind_total(CategoryKind::Emergencies),
            };
            (intensity > 0).then_some(HeatmapPoint {
                cell_id: a.cell_id,
                lat: a.centroid.lat,
                lon: a.centroid.lon,
                intensity,
            })
        })
        .collect()
}

/// Train with sectors when configured, otherwise with the grid.
pub fn train_spatial(
    records: &[IncidentRecord],
    config: &SpatialConfig,
    trained_at: DateTime<Utc>,
) -> Result<SpatialModel, SpatialError> {
    match &config.sectors_path {
        Some(path) => SpatialModel::train_sectors(records, load_sectors(path)?, trained_at),
        None => SpatialModel::train_grid(
            records,
            config.grid_rows,
            config.grid_cols,
            config.bounds_margin,
            trained_at,
        ),
    }
}
