//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::models::Statistic;
use crate::output::OutputFormat;
use clap::Parser;
use std::path::PathBuf;

/// worldpop-stats - zonal population statistics from WorldPop
///
/// Sums WorldPop population estimates inside each polygon of a
/// Shapefile or GeoJSON file using Google Earth Engine, and writes the
/// per-polygon totals to CSV, GeoJSON, KML, KMZ or Shapefile.
///
/// Examples:
///   worldpop-stats --shapefile districts.shp
///   worldpop-stats --shapefile districts.shp --output districts.geojson --constrained
///   worldpop-stats --shapefile districts.geojson --scale 250 --id-field ADM2_PCODE
///   worldpop-stats --shapefile districts.shp --dry-run
///   worldpop-stats --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Polygon boundaries to aggregate over (.shp, .geojson or .json)
    #[arg(
        short,
        long,
        value_name = "FILE",
        required_unless_present = "init_config"
    )]
    pub shapefile: Option<PathBuf>,

    /// Output file; the format follows the extension
    ///
    /// Supported: .csv, .geojson, .json, .kml, .kmz, .shp.
    /// Default: from config or output.csv.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Use the top-down constrained WorldPop dataset
    ///
    /// See https://www.worldpop.org/methods/top_down_constrained_vs_unconstrained/
    #[arg(long)]
    pub constrained: bool,

    /// Ground resolution in meters per pixel
    ///
    /// WorldPop is published at 100m, so values of 100 or above give
    /// sensible results. Default: from config or 100.
    #[arg(long, value_name = "METERS")]
    pub scale: Option<u32>,

    /// Statistic computed inside each polygon
    #[arg(long, value_name = "STAT")]
    pub statistic: Option<Statistic>,

    /// Polygon attribute holding the identifier written to the output
    ///
    /// If not specified, polygons are numbered in file order.
    #[arg(long, value_name = "NAME")]
    pub id_field: Option<String>,

    /// Cloud project used for Earth Engine requests
    #[arg(long, value_name = "PROJECT", env = "EARTHENGINE_PROJECT")]
    pub project: Option<String>,

    /// OAuth2 access token for Earth Engine
    ///
    /// For example the output of `gcloud auth print-access-token`.
    #[arg(long, value_name = "TOKEN", env = "EARTHENGINE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Earth Engine REST API endpoint URL
    #[arg(long, value_name = "URL", env = "EARTHENGINE_API_URL")]
    pub api_url: Option<String>,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .worldpop-stats.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Load the polygons and describe the request without calling Earth Engine
    #[arg(long)]
    pub dry_run: bool,

    /// Exit non-zero when the aggregation does not produce an output file
    ///
    /// Exit code 2 when the computation stays too large at the highest
    /// tile scale, 1 for any other failure.
    #[arg(long)]
    pub fail_on_error: bool,

    /// Generate a default .worldpop-stats.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if let Some(ref shapefile) = self.shapefile {
            if !shapefile.exists() {
                return Err(format!(
                    "Polygon file does not exist: {}",
                    shapefile.display()
                ));
            }
            if !shapefile.is_file() {
                return Err(format!("Polygon path is not a file: {}", shapefile.display()));
            }
        }

        if let Some(ref output) = self.output {
            OutputFormat::from_path(output).map_err(|e| e.to_string())?;
        }

        if let Some(scale) = self.scale {
            if scale == 0 {
                return Err("Scale must be at least 1 meter".to_string());
            }
        }

        if let Some(ref api_url) = self.api_url {
            if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
                return Err("API URL must start with 'http://' or 'https://'".to_string());
            }
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err("Timeout must be at least 1 second".to_string());
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    ///
    /// `config_verbose` is the `[general] verbose` setting; `--quiet` wins over it.
    pub fn log_level(&self, config_verbose: bool) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose || config_verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
