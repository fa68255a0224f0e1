//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.worldpop-stats.toml` files.

use crate::models::Statistic;
use crate::output::OutputFormat;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the configuration file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = ".worldpop-stats.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Compute platform settings.
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Aggregation settings.
    #[serde(default)]
    pub aggregation: AggregationConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
        }
    }
}

fn default_output() -> String {
    "output.csv".to_string()
}

/// Earth Engine connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Earth Engine REST API root.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Cloud project the computations are billed to.
    #[serde(default)]
    pub project: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            project: None,
            timeout_seconds: default_timeout(),
        }
    }
}

fn default_api_url() -> String {
    "https://earthengine.googleapis.com".to_string()
}

fn default_timeout() -> u64 {
    600 // large reductions at tileScale=4 can take minutes
}

/// Zonal aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Use the top-down constrained WorldPop dataset.
    #[serde(default)]
    pub constrained: bool,

    /// Ground resolution in meters per pixel.
    #[serde(default = "default_scale")]
    pub scale: u32,

    /// Reducer applied inside each polygon.
    #[serde(default)]
    pub statistic: Statistic,

    /// Polygon attribute used as identifier.
    #[serde(default)]
    pub id_field: Option<String>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            constrained: false,
            scale: default_scale(),
            statistic: Statistic::Sum,
            id_field: None,
        }
    }
}

fn default_scale() -> u32 {
    100 // native WorldPop resolution
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE_NAME);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings. Options
    /// without a CLI default only override when given.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }

        if let Some(ref api_url) = args.api_url {
            self.platform.api_url = api_url.clone();
        }
        if let Some(ref project) = args.project {
            self.platform.project = Some(project.clone());
        }
        if let Some(timeout) = args.timeout {
            self.platform.timeout_seconds = timeout;
        }

        // Flags only ever switch the constrained dataset on
        if args.constrained {
            self.aggregation.constrained = true;
        }
        if let Some(scale) = args.scale {
            self.aggregation.scale = scale;
        }
        if let Some(statistic) = args.statistic {
            self.aggregation.statistic = statistic;
        }
        if let Some(ref id_field) = args.id_field {
            self.aggregation.id_field = Some(id_field.clone());
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Check the merged settings before any work starts.
    pub fn validate(&self) -> Result<()> {
        OutputFormat::from_path(Path::new(&self.general.output))?;

        if self.aggregation.scale == 0 {
            bail!("Scale must be at least 1 meter (got [aggregation] scale = 0)");
        }
        if self.platform.timeout_seconds == 0 {
            bail!("Timeout must be at least 1 second (got [platform] timeout_seconds = 0)");
        }

        let api_url = &self.platform.api_url;
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            bail!("API URL must start with 'http://' or 'https://': {}", api_url);
        }

        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Args;
    use clap::Parser;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.output, "output.csv");
        assert_eq!(config.aggregation.scale, 100);
        assert!(!config.aggregation.constrained);
        assert_eq!(config.aggregation.statistic, Statistic::Sum);
        assert_eq!(config.platform.api_url, "https://earthengine.googleapis.com");
    }

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[general]
output = "districts.geojson"
verbose = true

[platform]
project = "mapaction-worldpop"
timeout_seconds = 120

[aggregation]
constrained = true
scale = 250
id_field = "ADM2_PCODE"
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.general.output, "districts.geojson");
        assert!(config.general.verbose);
        assert_eq!(config.platform.project.as_deref(), Some("mapaction-worldpop"));
        assert_eq!(config.platform.timeout_seconds, 120);
        assert!(config.aggregation.constrained);
        assert_eq!(config.aggregation.scale, 250);
        assert_eq!(config.aggregation.id_field.as_deref(), Some("ADM2_PCODE"));
        assert_eq!(config.aggregation.statistic, Statistic::Sum);
    }

    #[test]
    fn test_merge_with_args() {
        let mut config: Config = toml::from_str(
            r#"
[aggregation]
scale = 250
id_field = "ADM2_PCODE"
"#,
        )
        .unwrap();

        let args = Args::parse_from([
            "worldpop-stats",
            "--shapefile",
            "districts.shp",
            "--output",
            "out.kml",
            "--constrained",
            "--project",
            "cli-project",
        ]);
        config.merge_with_args(&args);

        assert_eq!(config.general.output, "out.kml");
        assert!(config.aggregation.constrained);
        // Not given on the command line, file value wins
        assert_eq!(config.aggregation.scale, 250);
        assert_eq!(config.aggregation.id_field.as_deref(), Some("ADM2_PCODE"));
        assert_eq!(config.platform.project.as_deref(), Some("cli-project"));
    }

    #[test]
    fn test_merge_verbose_flag() {
        let mut config = Config::default();
        assert!(!config.general.verbose);

        let args = Args::parse_from(["worldpop-stats", "--shapefile", "districts.shp", "--verbose"]);
        config.merge_with_args(&args);
        assert!(config.general.verbose);
    }

    #[test]
    fn test_validate_defaults() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_scale_from_file() {
        let mut config: Config = toml::from_str("[aggregation]\nscale = 0\n").unwrap();
        let args = Args::parse_from(["worldpop-stats", "--shapefile", "districts.shp"]);
        config.merge_with_args(&args);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Scale"));

        // A CLI value replaces the bad file value
        let args = Args::parse_from(["worldpop-stats", "--shapefile", "districts.shp", "--scale", "250"]);
        config.merge_with_args(&args);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_timeout_from_file() {
        let config: Config = toml::from_str("[platform]\ntimeout_seconds = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Timeout"));
    }

    #[test]
    fn test_validate_rejects_bad_file_output_and_url() {
        let config: Config = toml::from_str("[general]\noutput = \"result.xlsx\"\n").unwrap();
        assert!(config.validate().is_err());

        let config: Config =
            toml::from_str("[platform]\napi_url = \"earthengine.googleapis.com\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(!toml_str.is_empty());
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[platform]"));
        assert!(toml_str.contains("[aggregation]"));
        assert!(toml_str.contains("statistic = \"sum\""));
    }
}
