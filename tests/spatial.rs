//! Integration tests for spatial training and allocation.

use std::collections::BTreeMap;

use chrono::{NaiveDate, TimeZone, Utc};
use incident_forecast::{
    CategoryKind, CriticalityLevel, CriticalityThresholds, ForecastResult, HeatmapLayer,
    IncidentRecord, SpatialConfig, SpatialError, SpatialModel, heatmap,
    spatial::{CellGeometry, PartitionKind},
    summarize, train_spatial,
};
use proptest::prelude::*;

fn incident(kind: CategoryKind, id: u32, lat: f64, lon: f64) -> IncidentRecord {
    let at = NaiveDate::from_ymd_opt(2023, 3, 14)
        .unwrap()
        .and_hms_opt(9, 0, 0)
        .unwrap();
    IncidentRecord::new(at, kind, id).with_coordinates(lat, lon)
}

fn forecast(complaints: &[(u32, u32)], emergencies: &[(u32, u32)]) -> ForecastResult {
    ForecastResult {
        year: 2024,
        month: 5,
        predictions: BTreeMap::from([
            (CategoryKind::Complaints, complaints.iter().copied().collect()),
            (CategoryKind::Emergencies, emergencies.iter().copied().collect()),
        ]),
    }
}

fn assert_reconciles(model: &SpatialModel, forecast: &ForecastResult) {
    let cells = model.allocate(forecast, &CriticalityThresholds::default());
    assert_eq!(cells.len(), model.cells().len());

    for (kind, predictions) in &forecast.predictions {
        for (&id, &total) in predictions {
            let allocated: u64 = cells.iter().map(|c| c.allocated(*kind, id) as u64).sum();
            assert_eq!(allocated, total as u64, "{kind} category {id}");
        }
    }
    assert_eq!(cells.iter().map(|c| c.total).sum::<u64>(), forecast.total());
}

// ==================== Grid Tests ====================

/// Incidents along a diagonal of a Chiclayo-sized bounding box.
fn diagonal_history() -> Vec<IncidentRecord> {
    let mut records = Vec::new();
    for step in 0..40 {
        let t = step as f64 / 39.0;
        let lat = -6.80 + 0.10 * t;
        let lon = -79.90 + 0.10 * t;
        let kind = if step % 5 == 0 {
            CategoryKind::Emergencies
        } else {
            CategoryKind::Complaints
        };
        records.push(incident(kind, (step % 3) as u32 + 1, lat, lon));
    }
    records
}

#[test]
fn test_default_grid_has_twenty_five_cells() {
    let model = train_spatial(
        &diagonal_history(),
        &SpatialConfig::default(),
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    )
    .unwrap();

    assert_eq!(model.partition(), PartitionKind::Grid { rows: 5, cols: 5 });
    assert_eq!(model.cells().len(), 25);
    assert_eq!(model.attributed(), 40);
    assert!(
        model
            .cells()
            .iter()
            .enumerate()
            .all(|(i, c)| c.id == i && matches!(c.geometry, CellGeometry::Rectangle(_)))
    );
    // The diagonal only touches cells on the main diagonal
    for cell in model.cells() {
        let (row, col) = (cell.id / 5, cell.id % 5);
        if row != col {
            assert_eq!(cell.total(), 0, "cell {}", cell.id);
        }
    }
}

#[test]
fn test_grid_allocation_reconciles() {
    let model = train_spatial(
        &diagonal_history(),
        &SpatialConfig::default(),
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    )
    .unwrap();

    assert_reconciles(&model, &forecast(&[(1, 101), (2, 7), (3, 0), (44, 13)], &[(1, 9), (2, 1)]));
}

#[test]
fn test_allocation_summary_and_layers() {
    let model = train_spatial(
        &diagonal_history(),
        &SpatialConfig::default(),
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    )
    .unwrap();
    let forecast = forecast(&[(1, 250)], &[(1, 30)]);
    let cells = model.allocate(&forecast, &CriticalityThresholds::default());
    let summary = summarize(forecast.period(), &cells);

    assert_eq!(summary.total_predicted, 280);
    assert_eq!(summary.cell_count, 25);
    assert_eq!(summary.tier_counts.values().sum::<usize>(), 25);

    let top = summary.most_critical_cell.unwrap();
    assert!(cells.iter().all(|c| c.total <= summary.most_critical_total));
    assert_eq!(cells[top].total, summary.most_critical_total);

    let complaints: u64 = heatmap(&cells, HeatmapLayer::Complaints)
        .iter()
        .map(|p| p.intensity)
        .sum();
    let emergencies: u64 = heatmap(&cells, HeatmapLayer::Emergencies)
        .iter()
        .map(|p| p.intensity)
        .sum();
    assert_eq!(complaints, 250);
    assert_eq!(emergencies, 30);
}

#[test]
fn test_spatial_training_requires_coordinates() {
    let at = NaiveDate::from_ymd_opt(2023, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let records = vec![IncidentRecord::new(at, CategoryKind::Complaints, 1)];

    let result = train_spatial(&records, &SpatialConfig::default(), Utc::now());
    assert!(matches!(result, Err(SpatialError::NoCoordinates)));
}

// ==================== Sector Tests ====================

const SECTORS: &str = r#"{
    "type": "FeatureCollection",
    "features": [
        {
            "type": "Feature",
            "properties": {"codigo_sector": "N", "nombre": "Norte"},
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[-79.9, -6.75], [-79.8, -6.75], [-79.8, -6.7], [-79.9, -6.7], [-79.9, -6.75]]]
            }
        },
        {
            "type": "Feature",
            "properties": {"code": "S", "name": "Sur"},
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[-79.9, -6.8], [-79.8, -6.8], [-79.8, -6.75], [-79.9, -6.75], [-79.9, -6.8]]]
            }
        }
    ]
}"#;

#[test]
fn test_sector_training_uses_polygon_membership() {
    let dir = tempfile::tempdir().unwrap();
    let sectors_path = dir.path().join("sectors.geojson");
    std::fs::write(&sectors_path, SECTORS).unwrap();

    let records = vec![
        incident(CategoryKind::Complaints, 1, -6.72, -79.85),
        incident(CategoryKind::Complaints, 1, -6.73, -79.85),
        incident(CategoryKind::Complaints, 1, -6.78, -79.85),
        incident(CategoryKind::Emergencies, 4, -6.79, -79.82),
        // Outside both sectors
        incident(CategoryKind::Complaints, 1, -6.50, -79.50),
    ];
    let config = SpatialConfig {
        sectors_path: Some(sectors_path),
        ..SpatialConfig::default()
    };

    let model = train_spatial(&records, &config, Utc::now()).unwrap();

    assert_eq!(model.partition(), PartitionKind::Sectors { count: 2 });
    assert_eq!(model.attributed(), 4);
    assert_eq!(model.unattributed(), 1);
    assert_eq!(model.cells()[0].name, "Norte");
    assert_eq!(model.cells()[0].historical_count(CategoryKind::Complaints, 1), 2);
    assert_eq!(model.cells()[1].historical_count(CategoryKind::Complaints, 1), 1);

    let cells = model.allocate(&forecast(&[(1, 10)], &[(4, 3)]), &CriticalityThresholds::default());
    assert_eq!(cells[0].allocated(CategoryKind::Complaints, 1), 7);
    assert_eq!(cells[1].allocated(CategoryKind::Complaints, 1), 3);
    assert_eq!(cells[1].allocated(CategoryKind::Emergencies, 4), 3);
    assert_eq!(cells[0].criticality, CriticalityLevel::Low);

    let detail = model.cell_detail(0, &CriticalityThresholds::default()).unwrap();
    assert!((detail.shares[0].share - 200.0 / 3.0).abs() < 1e-9);
}

#[test]
fn test_missing_sector_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = SpatialConfig {
        sectors_path: Some(dir.path().join("absent.geojson")),
        ..SpatialConfig::default()
    };
    let records = vec![incident(CategoryKind::Complaints, 1, -6.7, -79.8)];

    assert!(matches!(
        train_spatial(&records, &config, Utc::now()),
        Err(SpatialError::Sectors(_))
    ));
}

// ==================== Property Tests ====================

proptest! {
    #[test]
    fn prop_allocation_reconciles_for_any_history(
        points in prop::collection::vec((0.0f64..1.0, 0.0f64..1.0, 1u32..5, any::<bool>()), 1..80),
        rows in 1usize..6,
        cols in 1usize..6,
        totals in prop::collection::vec(0u32..5_000, 1..8),
    ) {
        let records: Vec<IncidentRecord> = points
            .iter()
            .map(|&(lat, lon, id, emergency)| {
                let kind = if emergency {
                    CategoryKind::Emergencies
                } else {
                    CategoryKind::Complaints
                };
                incident(kind, id, lat, lon)
            })
            .collect();
        let model = SpatialModel::train_grid(&records, rows, cols, 0.05, Utc::now()).unwrap();

        let complaints: Vec<(u32, u32)> = totals
            .iter()
            .enumerate()
            .map(|(i, &t)| (i as u32 + 1, t))
            .collect();
        let emergencies: Vec<(u32, u32)> = totals
            .iter()
            .rev()
            .enumerate()
            .map(|(i, &t)| (i as u32 + 1, t))
            .collect();
        let forecast = forecast(&complaints, &emergencies);
        let cells = model.allocate(&forecast, &CriticalityThresholds::default());

        for (kind, predictions) in &forecast.predictions {
            for (&id, &total) in predictions {
                let allocated: u64 = cells.iter().map(|c| c.allocated(*kind, id) as u64).sum();
                prop_assert_eq!(allocated, total as u64);
            }
        }
        prop_assert_eq!(cells.iter().map(|c| c.total).sum::<u64>(), forecast.total());
    }
}
