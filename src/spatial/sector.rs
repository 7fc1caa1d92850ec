//! Polygon sectors loaded from GeoJSON, with point-in-polygon lookup

use std::fs;
use std::path::Path;

use geo::{BoundingRect, Centroid, Contains, MultiPolygon};
use geojson::{Feature, GeoJson};
use rstar::{AABB, RTree, RTreeObject};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SpatialError;

use super::grid::{Bounds, LatLon};

const CODE_KEYS: [&str; 2] = ["code", "codigo_sector"];
const NAME_KEYS: [&str; 2] = ["name", "nombre"];

/// A named polygon partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sector {
    pub code: String,
    pub name: String,
    pub polygon: MultiPolygon<f64>,
}

impl Sector {
    pub fn bounds(&self) -> Option<Bounds> {
        self.polygon.bounding_rect().map(|rect| Bounds {
            min_lat: rect.min().y,
            max_lat: rect.max().y,
            min_lon: rect.min().x,
            max_lon: rect.max().x,
        })
    }

    pub fn centroid(&self) -> Option<LatLon> {
        self.polygon.centroid().map(|p| LatLon {
            lat: p.y(),
            lon: p.x(),
        })
    }

    pub fn contains(&self, point: LatLon) -> bool {
        self.polygon.contains(&geo::Point::new(point.lon, point.lat))
    }
}

fn property_text(feature: &Feature, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match feature.property(key)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn to_multipolygon(feature: &Feature) -> Option<MultiPolygon<f64>> {
    let geometry = feature.geometry.clone()?;
    let geo_geom: geo::Geometry<f64> = geometry.try_into().ok()?;
    match geo_geom {
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        geo::Geometry::Polygon(p) => Some(MultiPolygon(vec![p])),
        _ => None,
    }
}

/// Parse a GeoJSON `FeatureCollection` of sector polygons.
///
/// Features without polygon geometry or a code are skipped with a warning.
/// A missing name falls back to the code.
pub fn parse_sectors(geojson_str: &str) -> Result<Vec<Sector>, SpatialError> {
    let geojson: GeoJson = geojson_str
        .parse()
        .map_err(|e: geojson::Error| SpatialError::Sectors(e.to_string()))?;

    let GeoJson::FeatureCollection(collection) = geojson else {
        return Err(SpatialError::Sectors(
            "expected a FeatureCollection".to_string(),
        ));
    };

    let mut sectors = Vec::with_capacity(collection.features.len());
    for (index, feature) in collection.features.iter().enumerate() {
        let Some(code) = property_text(feature, &CODE_KEYS) else {
            warn!(index, "Sector feature has no code property, skipping");
            continue;
        };
        let Some(polygon) = to_multipolygon(feature) else {
            warn!(%code, "Sector feature has no polygon geometry, skipping");
            continue;
        };
        let name = property_text(feature, &NAME_KEYS).unwrap_or_else(|| code.clone());

        sectors.push(Sector {
            code,
            name,
            polygon,
        });
    }

    if sectors.is_empty() {
        return Err(SpatialError::Sectors(
            "no usable polygon features".to_string(),
        ));
    }

    debug!(count = sectors.len(), "Parsed sector polygons");
    Ok(sectors)
}

pub fn load_sectors(path: &Path) -> Result<Vec<Sector>, SpatialError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| SpatialError::Sectors(format!("{}: {e}", path.display())))?;
    parse_sectors(&raw)
}

struct SectorEntry {
    index: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for SectorEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Envelope-prefiltered point-in-polygon lookup over sectors.
pub struct SectorIndex<'a> {
    sectors: &'a [Sector],
    tree: RTree<SectorEntry>,
}

impl<'a> SectorIndex<'a> {
    pub fn new(sectors: &'a [Sector]) -> Self {
        let entries = sectors
            .iter()
            .enumerate()
            .filter_map(|(index, sector)| {
                let rect = sector.polygon.bounding_rect()?;
                Some(SectorEntry {
                    index,
                    envelope: AABB::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                })
            })
            .collect();

        Self {
            sectors,
            tree: RTree::bulk_load(entries),
        }
    }

    /// Position of the first sector (in definition order) containing `point`.
    pub fn locate(&self, point: LatLon) -> Option<usize> {
        let query = AABB::from_point([point.lon, point.lat]);
        self.tree
            .locate_in_envelope_intersecting(&query)
            .filter(|entry| self.sectors[entry.index].contains(point))
            .map(|entry| entry.index)
            .min()
    }
}
