//! Incident records and the CSV feed they are read from.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// The two independently modeled families of incident categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryKind {
    /// Citizen complaints (denuncias)
    Complaints,
    /// Emergency calls
    Emergencies,
}

impl CategoryKind {
    /// Both kinds in their canonical order.
    pub const ALL: [CategoryKind; 2] = [CategoryKind::Complaints, CategoryKind::Emergencies];

    /// Short identifier used in artifact file names.
    pub fn slug(&self) -> &'static str {
        match self {
            CategoryKind::Complaints => "complaints",
            CategoryKind::Emergencies => "emergencies",
        }
    }
}

impl fmt::Display for CategoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// A category within one kind, e.g. complaint type 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IncidentCategory {
    pub kind: CategoryKind,
    pub id: u32,
}

/// A single ingested incident. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub occurred_at: NaiveDateTime,
    pub category: IncidentCategory,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub description: Option<String>,
}

impl IncidentRecord {
    pub fn new(occurred_at: NaiveDateTime, kind: CategoryKind, id: u32) -> Self {
        Self {
            occurred_at,
            category: IncidentCategory { kind, id },
            lat: None,
            lon: None,
            description: None,
        }
    }

    pub fn with_coordinates(mut self, lat: f64, lon: f64) -> Self {
        self.lat = Some(lat);
        self.lon = Some(lon);
        self
    }

    pub fn year(&self) -> i32 {
        self.occurred_at.year()
    }

    pub fn month(&self) -> u32 {
        self.occurred_at.month()
    }

    /// Coordinates as `(lat, lon)` when both are present and finite.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        }
    }
}

/// Raw CSV row. Accepts both the English headers and the legacy export headers.
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(alias = "fecha")]
    timestamp: String,
    #[serde(alias = "id_denuncia", default)]
    complaint_type: Option<String>,
    #[serde(alias = "id_numero_emergencia", default)]
    emergency_type: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(alias = "lng", default)]
    lon: Option<f64>,
    #[serde(alias = "descripcion", default)]
    description: Option<String>,
}

/// Counters describing rows that could not be turned into records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub rows: usize,
    pub accepted: usize,
    pub bad_timestamp: usize,
    pub missing_category: usize,
    pub ambiguous_category: usize,
}

/// Parse timestamps in the formats found in incident exports.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    const DATETIME_FORMATS: [&str; 3] =
        ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Category ids arrive as integers, floats ("3.0") or blanks.
fn parse_category_id(raw: Option<&str>) -> Option<u32> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(id) = raw.parse::<u32>() {
        return Some(id);
    }
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0 && v.fract() == 0.0 && *v <= u32::MAX as f64)
        .map(|v| v as u32)
}

/// Read incident records from any CSV source.
pub fn read_records<R: std::io::Read>(reader: R) -> Result<(Vec<IncidentRecord>, LoadStats)> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut stats = LoadStats::default();
    let mut records = Vec::new();

    for (line, row) in csv_reader.deserialize::<CsvRow>().enumerate() {
        let row = row.with_context(|| format!("Malformed incident row {}", line + 2))?;
        stats.rows += 1;

        let Some(occurred_at) = parse_timestamp(&row.timestamp) else {
            stats.bad_timestamp += 1;
            continue;
        };

        let complaint = parse_category_id(row.complaint_type.as_deref());
        let emergency = parse_category_id(row.emergency_type.as_deref());

        let category = match (complaint, emergency) {
            (Some(id), None) => IncidentCategory {
                kind: CategoryKind::Complaints,
                id,
            },
            (None, Some(id)) => IncidentCategory {
                kind: CategoryKind::Emergencies,
                id,
            },
            (None, None) => {
                stats.missing_category += 1;
                continue;
            }
            (Some(_), Some(_)) => {
                stats.ambiguous_category += 1;
                continue;
            }
        };

        records.push(IncidentRecord {
            occurred_at,
            category,
            lat: row.lat,
            lon: row.lon,
            description: row.description.filter(|d| !d.is_empty()),
        });
        stats.accepted += 1;
    }

    Ok((records, stats))
}

/// Load incident records from a CSV file on disk.
pub fn load_csv(path: &Path) -> Result<Vec<IncidentRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open incident dataset {}", path.display()))?;
    let (records, stats) = read_records(file)?;

    tracing::info!(
        "Loaded {} incidents from {} ({} rows)",
        stats.accepted,
        path.display(),
        stats.rows
    );
    if stats.bad_timestamp + stats.missing_category + stats.ambiguous_category > 0 {
        tracing::warn!(
            bad_timestamp = stats.bad_timestamp,
            missing_category = stats.missing_category,
            ambiguous_category = stats.ambiguous_category,
            "Skipped unusable incident rows"
        );
    }

    Ok(records)
}
