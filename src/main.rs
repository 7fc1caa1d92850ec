use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use incident_forecast::{
    AppConfig, HeatmapLayer, IncidentForecaster, SpatialModel, SystemClock, heatmap, load_csv,
    summarize, train_spatial,
};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_DIRECTIVES: &str = "info,incident_forecast=debug";

/// `RUST_LOG` directives when set and valid, otherwise the defaults.
fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_DIRECTIVES))
}

#[derive(Parser, Debug)]
#[command(name = "incident-forecast")]
#[command(about = "Monthly incident forecasting and spatial allocation")]
struct Args {
    /// Extra configuration file layered over the defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train one model per category and reset the prediction cache
    Train {
        /// Incident CSV (defaults to dataset.csv_path)
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Forecast one month, or a range of consecutive months
    Predict {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        month: u32,
        /// Number of consecutive months to forecast
        #[arg(long, default_value_t = 1)]
        months: usize,
    },
    /// Held-out MAE/RMSE per category
    Metrics,
    /// Model quality report
    Report,
    /// Drop every cached prediction
    ClearCache,
    /// Build the spatial model from incident coordinates
    SpatialTrain {
        #[arg(long)]
        csv: Option<PathBuf>,
        /// GeoJSON sectors to use instead of the grid
        #[arg(long)]
        sectors: Option<PathBuf>,
    },
    /// Forecast a month and split it across the spatial cells
    Allocate {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        month: u32,
        /// Heatmap layer: total, complaints or emergencies
        #[arg(long, default_value = "total")]
        layer: HeatmapLayer,
    },
    /// Historical distribution of one spatial cell
    Cell {
        #[arg(long)]
        id: usize,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .init();

    let config =
        AppConfig::load_with(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Command::Train { csv } => run_train(&config, csv.as_deref()),
        Command::Predict { year, month, months } => {
            let mut forecaster = open_forecaster(&config);
            if months == 1 {
                print_json(&forecaster.predict_month(year, month)?)
            } else {
                print_json(&forecaster.predict_range(year, month, months)?)
            }
        }
        Command::Metrics => print_json(&open_forecaster(&config).metrics()?),
        Command::Report => print_json(&open_forecaster(&config).model_report()?),
        Command::ClearCache => {
            open_forecaster(&config).clear_cache()?;
            tracing::info!("Prediction cache cleared");
            Ok(())
        }
        Command::SpatialTrain { csv, sectors } => {
            run_spatial_train(&config, csv.as_deref(), sectors)
        }
        Command::Allocate { year, month, layer } => run_allocate(&config, year, month, layer),
        Command::Cell { id } => {
            let model = SpatialModel::load(&config.storage.spatial_path)?;
            let detail = model
                .cell_detail(id, &config.criticality)
                .with_context(|| format!("No spatial cell with id {}", id))?;
            print_json(&detail)
        }
    }
}

fn open_forecaster(config: &AppConfig) -> IncidentForecaster {
    IncidentForecaster::open(
        &config.storage.model_dir,
        &config.storage.cache_path,
        config.training.clone(),
        Arc::new(SystemClock),
    )
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{}", rendered);
    Ok(())
}

fn run_train(config: &AppConfig, csv: Option<&Path>) -> Result<()> {
    let path = csv.unwrap_or(config.dataset.csv_path.as_path());
    let records = load_csv(path)?;
    tracing::info!("Training on {} incidents from {}", records.len(), path.display());

    let mut forecaster = open_forecaster(config);
    let summary = forecaster.retrain(&records)?;
    print_json(&summary)
}

fn run_spatial_train(
    config: &AppConfig,
    csv: Option<&Path>,
    sectors: Option<PathBuf>,
) -> Result<()> {
    let path = csv.unwrap_or(config.dataset.csv_path.as_path());
    let records = load_csv(path)?;

    let mut spatial = config.spatial.clone();
    if sectors.is_some() {
        spatial.sectors_path = sectors;
    }

    let model = train_spatial(&records, &spatial, chrono::Utc::now())?;
    model.save(&config.storage.spatial_path)?;

    print_json(&json!({
        "partition": model.partition(),
        "cells": model.cells().len(),
        "attributed": model.attributed(),
        "unattributed": model.unattributed(),
        "trained_at": model.trained_at(),
    }))
}

fn run_allocate(config: &AppConfig, year: i32, month: u32, layer: HeatmapLayer) -> Result<()> {
    let model = SpatialModel::load(&config.storage.spatial_path)?;
    let mut forecaster = open_forecaster(config);
    let forecast = forecaster.predict_month(year, month)?;

    let mut cells = model.allocate(&forecast, &config.criticality);
    let summary = summarize(forecast.period(), &cells);
    let points = heatmap(&cells, layer);
    cells.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.total.cmp(&a.total)));

    print_json(&json!({
        "forecast": forecast,
        "summary": summary,
        "cells": cells,
        "heatmap": { "layer": layer, "points": points },
    }))
}
