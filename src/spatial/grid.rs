//! Regular grid partition with nearest-centroid membership

use rstar::RTree;
use rstar::primitives::GeomWithData;
use serde::{Deserialize, Serialize};

use crate::error::SpatialError;

/// Span used for an axis whose points all share one coordinate.
const MIN_SPAN_DEGREES: f64 = 1e-3;

/// A geographic coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

/// Axis-aligned latitude/longitude box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Bounds {
    /// Bounding box of `points`, or `None` when empty.
    pub fn from_points(points: &[LatLon]) -> Option<Self> {
        let first = points.first()?;
        let init = Self {
            min_lat: first.lat,
            max_lat: first.lat,
            min_lon: first.lon,
            max_lon: first.lon,
        };
        Some(points.iter().fold(init, |b, p| Self {
            min_lat: b.min_lat.min(p.lat),
            max_lat: b.max_lat.max(p.lat),
            min_lon: b.min_lon.min(p.lon),
            max_lon: b.max_lon.max(p.lon),
        }))
    }

    /// Grow each axis by `margin` times its span on both sides.
    pub fn expand(&self, margin: f64) -> Self {
        let lat_span = (self.max_lat - self.min_lat).max(MIN_SPAN_DEGREES);
        let lon_span = (self.max_lon - self.min_lon).max(MIN_SPAN_DEGREES);
        let lat_pad = lat_span * margin.max(0.0) + (lat_span - (self.max_lat - self.min_lat)) / 2.0;
        let lon_pad = lon_span * margin.max(0.0) + (lon_span - (self.max_lon - self.min_lon)) / 2.0;

        Self {
            min_lat: self.min_lat - lat_pad,
            max_lat: self.max_lat + lat_pad,
            min_lon: self.min_lon - lon_pad,
            max_lon: self.max_lon + lon_pad,
        }
    }

    pub fn center(&self) -> LatLon {
        LatLon {
            lat: (self.min_lat + self.max_lat) / 2.0,
            lon: (self.min_lon + self.max_lon) / 2.0,
        }
    }

    pub fn contains(&self, point: LatLon) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.lat)
            && (self.min_lon..=self.max_lon).contains(&point.lon)
    }
}

/// One cell of a regular grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridCell {
    /// Row-major id: `row * cols + col`
    pub id: usize,
    pub row: usize,
    pub col: usize,
    pub bounds: Bounds,
    pub centroid: LatLon,
}

/// Split `bounds` into `rows x cols` cells. Row 0 is the southernmost.
pub fn build_grid(
    bounds: &Bounds,
    rows: usize,
    cols: usize,
) -> Result<Vec<GridCell>, SpatialError> {
    if rows == 0 || cols == 0 {
        return Err(SpatialError::InvalidGrid { rows, cols });
    }

    let lat_step = (bounds.max_lat - bounds.min_lat) / rows as f64;
    let lon_step = (bounds.max_lon - bounds.min_lon) / cols as f64;

    let mut cells = Vec::with_capacity(rows * cols);
    for row in 0..rows {
        for col in 0..cols {
            let cell_bounds = Bounds {
                min_lat: bounds.min_lat + row as f64 * lat_step,
                max_lat: bounds.min_lat + (row + 1) as f64 * lat_step,
                min_lon: bounds.min_lon + col as f64 * lon_step,
                max_lon: bounds.min_lon + (col + 1) as f64 * lon_step,
            };
            cells.push(GridCell {
                id: row * cols + col,
                row,
                col,
                bounds: cell_bounds,
                centroid: cell_bounds.center(),
            });
        }
    }
    Ok(cells)
}

/// Nearest-centroid lookup over grid cells.
pub struct CentroidIndex {
    tree: RTree<GeomWithData<[f64; 2], usize>>,
}

impl CentroidIndex {
    pub fn new(cells: &[GridCell]) -> Self {
        let entries = cells
            .iter()
            .map(|c| GeomWithData::new([c.centroid.lat, c.centroid.lon], c.id))
            .collect();
        Self {
            tree: RTree::bulk_load(entries),
        }
    }

    /// Id of the cell whose centroid is closest to `point`.
    pub fn nearest(&self, point: LatLon) -> Option<usize> {
        self.tree
            .nearest_neighbor(&[point.lat, point.lon])
            .map(|entry| entry.data)
    }
}
