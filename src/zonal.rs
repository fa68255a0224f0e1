//! Zonal aggregation with tile-scale fallback.
//!
//! A reduction is first attempted with the platform's default tile scale.
//! Whenever the platform answers that the output is too large, the attempt
//! is repeated with a doubled tile scale (2, then 4). Any other failure
//! stops the ladder immediately.

use crate::models::{
    AggregationRequest, PolygonCollection, PopulationDataset, RasterHandle, Statistic,
};
use crate::output;
use crate::platform::{ComputePlatform, PlatformError};
use crate::polygons;
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// Tile-scale budget of each attempt, in order. `None` is the platform default.
pub const TILE_SCALE_LADDER: [Option<u32>; 3] = [None, Some(2), Some(4)];

/// Operator message when the largest tile scale still fails.
pub const GIVE_UP_MESSAGE: &str = "The shapefile is too big for the scale. You could try splitting up the shapefile or increasing the scale parameter.";

/// Parameters of a zonal statistics run.
#[derive(Debug, Clone)]
pub struct ZonalOptions {
    pub output_path: PathBuf,
    pub constrained: bool,
    /// Ground resolution in meters per pixel.
    pub scale: u32,
    pub statistic: Statistic,
    pub id_field: Option<String>,
    /// Show a spinner while a computation is in flight.
    pub show_progress: bool,
}

impl Default for ZonalOptions {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("output.csv"),
            constrained: false,
            scale: 100,
            statistic: Statistic::Sum,
            id_field: None,
            show_progress: false,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZonalOutcome {
    /// The table was computed and written.
    Success {
        attempts: usize,
        tile_scale: Option<u32>,
        rows: usize,
    },
    /// Still too large at the highest tile scale. Nothing was written.
    ResourceExhausted { attempts: usize },
    /// Any other failure. Nothing was written.
    Failed {
        attempts: usize,
        kind: String,
        message: String,
    },
}

impl ZonalOutcome {
    #[allow(dead_code)] // Convenience for callers matching on success only
    pub fn is_success(&self) -> bool {
        matches!(self, ZonalOutcome::Success { .. })
    }

    /// Number of remote calls made.
    pub fn attempts(&self) -> usize {
        match self {
            ZonalOutcome::Success { attempts, .. }
            | ZonalOutcome::ResourceExhausted { attempts }
            | ZonalOutcome::Failed { attempts, .. } => *attempts,
        }
    }

    /// Process exit code when failures are meant to be visible.
    pub fn exit_code(&self) -> i32 {
        match self {
            ZonalOutcome::Success { .. } => 0,
            ZonalOutcome::Failed { .. } => 1,
            ZonalOutcome::ResourceExhausted { .. } => 2,
        }
    }
}

/// Operator-facing report of an opaque failure.
pub fn failure_message(kind: &str, message: &str) -> String {
    format!(
        "An exception of type {} occurred. Arguments:\n{:?}",
        kind, message
    )
}

/// Lazy global mosaic of the selected WorldPop dataset.
pub fn load_population_source(use_constrained: bool) -> RasterHandle {
    RasterHandle::mosaic(PopulationDataset::from_constrained(use_constrained))
}

/// Run one reduction and write its result table to `output_path`.
///
/// Nothing is written when the platform fails. A failure to write the
/// output is reported as an opaque `WriteError`.
pub async fn compute_zonal_sum<P: ComputePlatform>(
    platform: &P,
    raster: &RasterHandle,
    polygons: &PolygonCollection,
    output_path: &Path,
    scale: u32,
    tile_scale: Option<u32>,
    statistic: Statistic,
) -> Result<usize, PlatformError> {
    let request = AggregationRequest {
        raster,
        polygons,
        statistic,
        scale,
        tile_scale,
    };

    let table = platform.reduce_regions(&request).await?;

    output::write_table(&table, output_path)
        .map_err(|e| PlatformError::opaque("WriteError", format!("{:#}", e)))?;

    info!(
        "Wrote {} rows to {}",
        table.rows.len(),
        output_path.display()
    );
    Ok(table.rows.len())
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) =
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")
    {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Walk the tile-scale ladder for already loaded inputs.
pub async fn run_ladder<P: ComputePlatform>(
    platform: &P,
    raster: &RasterHandle,
    polygons: &PolygonCollection,
    options: &ZonalOptions,
) -> ZonalOutcome {
    run_ladder_with_output(platform, raster, polygons, options, &mut std::io::stdout()).await
}

/// Walk the tile-scale ladder, writing operator messages to `out`.
pub async fn run_ladder_with_output<P: ComputePlatform, W: Write>(
    platform: &P,
    raster: &RasterHandle,
    polygons: &PolygonCollection,
    options: &ZonalOptions,
    out: &mut W,
) -> ZonalOutcome {
    let mut attempts = 0;

    for (step, tile_scale) in TILE_SCALE_LADDER.iter().copied().enumerate() {
        attempts += 1;
        info!(
            "Attempt {}/{}: {} over {} polygons at {}m (tileScale={})",
            attempts,
            TILE_SCALE_LADDER.len(),
            options.statistic,
            polygons.len(),
            options.scale,
            tile_scale.unwrap_or(1)
        );

        let progress = options.show_progress.then(|| {
            spinner(format!(
                "Computing zonal statistics (tileScale={})",
                tile_scale.unwrap_or(1)
            ))
        });

        let result = compute_zonal_sum(
            platform,
            raster,
            polygons,
            &options.output_path,
            options.scale,
            tile_scale,
            options.statistic,
        )
        .await;

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }

        match result {
            Ok(rows) => {
                return ZonalOutcome::Success {
                    attempts,
                    tile_scale,
                    rows,
                };
            }
            Err(err) if err.is_resource_exceeded() => {
                match TILE_SCALE_LADDER.get(step + 1).copied().flatten() {
                    Some(next) => {
                        warn!("Computation too large: {}", err.message());
                        let _ = writeln!(out, "Computation is too large, trying tileScale={}", next);
                    }
                    None => {
                        error!("Computation still too large at the highest tile scale");
                        let _ = writeln!(out, "{}", GIVE_UP_MESSAGE);
                        return ZonalOutcome::ResourceExhausted { attempts };
                    }
                }
            }
            Err(err) => {
                error!("Zonal statistics failed: {}", err);
                let _ = writeln!(out, "{}", failure_message(err.kind(), err.message()));
                return ZonalOutcome::Failed {
                    attempts,
                    kind: err.kind().to_string(),
                    message: err.message().to_string(),
                };
            }
        }
    }

    ZonalOutcome::ResourceExhausted { attempts }
}

/// Load the polygons and compute their zonal statistics.
///
/// Errors are only returned for local problems before the first remote
/// call (unreadable polygon file). Remote failures end up in the outcome.
pub async fn run<P: ComputePlatform>(
    platform: &P,
    shapefile: &Path,
    options: &ZonalOptions,
) -> Result<ZonalOutcome> {
    let polygons = polygons::load_polygons(shapefile, options.id_field.as_deref())?;
    let raster = load_population_source(options.constrained);

    info!(
        "Using {} ({})",
        raster.collection_id(),
        PopulationDataset::from_constrained(options.constrained)
    );

    Ok(run_ladder(platform, &raster, &polygons, options).await)
}
