//! worldpop-stats - zonal population statistics from WorldPop
//!
//! A CLI tool that sums WorldPop population estimates inside a set of
//! polygon boundaries using Google Earth Engine, retrying with larger
//! tile scales when the computation is too large.
//!
//! Exit codes:
//!   0 - Completed (always, unless --fail-on-error is set)
//!   1 - Runtime error (arguments, config, polygon file, credentials), or
//!       an aggregation failure with --fail-on-error
//!   2 - Computation too large at every tile scale, with --fail-on-error

mod cli;
mod config;
mod models;
mod output;
mod platform;
mod polygons;
mod zonal;

use anyhow::{anyhow, Context, Result};
use cli::Args;
use config::{Config, CONFIG_FILE_NAME};
use platform::{EarthEngineClient, EarthEngineConfig};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use zonal::{ZonalOptions, ZonalOutcome};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Load configuration first, it can switch on verbose logging
    let (mut config, source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    // Initialize logging
    init_logging(&args, &config);

    info!("worldpop-stats v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);
    source.log();

    let start_time = Instant::now();
    let result = run_zonal_stats(&args, &config).await;
    println!("time elapsed: {:.2}s", start_time.elapsed().as_secs_f64());

    match result {
        Ok(outcome) => {
            if args.fail_on_error {
                std::process::exit(outcome.exit_code());
            }
            Ok(())
        }
        Err(e) => {
            error!("Zonal statistics failed: {:#}", e);
            eprintln!("\nError: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .worldpop-stats.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE_NAME);

    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit it manually.",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Edit it to set the Earth Engine project, dataset and scale.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args, config: &Config) {
    let level = args.log_level(config.general.verbose);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Run the zonal statistics workflow.
async fn run_zonal_stats(args: &Args, config: &Config) -> Result<ZonalOutcome> {
    config.validate().context("Invalid configuration")?;

    let shapefile = args
        .shapefile
        .as_deref()
        .ok_or_else(|| anyhow!("--shapefile is required"))?;

    let options = ZonalOptions {
        output_path: PathBuf::from(&config.general.output),
        constrained: config.aggregation.constrained,
        scale: config.aggregation.scale,
        statistic: config.aggregation.statistic,
        id_field: config.aggregation.id_field.clone(),
        show_progress: !args.quiet,
    };

    if options.scale < 100 {
        warn!(
            "WorldPop is published at 100m; a scale of {}m will not add detail",
            options.scale
        );
    }

    if args.dry_run {
        return handle_dry_run(shapefile, &options);
    }

    let platform_config = EarthEngineConfig {
        api_url: config.platform.api_url.clone(),
        project: config.platform.project.clone().ok_or_else(|| {
            anyhow!("No Earth Engine project set (use --project, EARTHENGINE_PROJECT or [platform] project)")
        })?,
        token: args
            .token
            .clone()
            .ok_or_else(|| anyhow!("No Earth Engine access token set (use --token or EARTHENGINE_TOKEN)"))?,
        timeout_seconds: config.platform.timeout_seconds,
    };

    println!("Computing zonal statistics:");
    println!("   Polygons: {}", shapefile.display());
    println!(
        "   Dataset: {}",
        zonal::load_population_source(options.constrained).collection_id()
    );
    println!("   Statistic: {}", options.statistic);
    println!("   Scale: {}m", options.scale);
    println!("   Output: {}", options.output_path.display());

    let client = EarthEngineClient::new(platform_config)?;
    let outcome = zonal::run(&client, shapefile, &options).await?;

    match &outcome {
        ZonalOutcome::Success {
            attempts,
            tile_scale,
            rows,
        } => {
            println!(
                "\nZonal statistics for {} polygons saved to: {} (tileScale={}, {} attempt(s))",
                rows,
                options.output_path.display(),
                tile_scale.unwrap_or(1),
                attempts
            );
        }
        ZonalOutcome::ResourceExhausted { .. } => {
            warn!(
                "Gave up after {} attempts, no output written",
                outcome.attempts()
            );
        }
        ZonalOutcome::Failed { kind, message, .. } => {
            warn!(
                "{} after {} attempt(s), no output written: {}",
                kind,
                outcome.attempts(),
                message
            );
        }
    }

    Ok(outcome)
}

/// Handle --dry-run: load polygons, describe the request, exit.
fn handle_dry_run(shapefile: &Path, options: &ZonalOptions) -> Result<ZonalOutcome> {
    println!("\nDry run: loading polygons (no Earth Engine calls)...\n");

    let polygons = polygons::load_polygons(shapefile, options.id_field.as_deref())?;
    let raster = zonal::load_population_source(options.constrained);
    let format = output::OutputFormat::from_path(&options.output_path)?;

    println!("   Dataset: {}", raster.collection_id());
    println!("   Statistic: {} at {}m", options.statistic, options.scale);
    println!(
        "   Polygons: {} (id field: {})",
        polygons.len(),
        polygons.id_field
    );
    println!(
        "   Tile scales: {}",
        zonal::TILE_SCALE_LADDER
            .iter()
            .map(|t| t.unwrap_or(1).to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    println!(
        "   Output: {} ({:?})",
        options.output_path.display(),
        format
    );

    println!("\nDry run complete. No Earth Engine calls were made.");
    Ok(ZonalOutcome::Success {
        attempts: 0,
        tile_scale: None,
        rows: 0,
    })
}

/// Where the configuration came from, logged once logging is up.
enum ConfigSource {
    File(PathBuf),
    Defaults,
    Unreadable(anyhow::Error),
}

impl ConfigSource {
    fn log(&self) {
        match self {
            ConfigSource::File(path) => info!("Loaded config from {}", path.display()),
            ConfigSource::Defaults => debug!("No config file found, using defaults"),
            ConfigSource::Unreadable(e) => warn!("Failed to load config: {:#}", e),
        }
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<(Config, ConfigSource)> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        let config = Config::load(config_path)?;
        return Ok((config, ConfigSource::File(config_path.clone())));
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => Ok((config, ConfigSource::File(PathBuf::from(CONFIG_FILE_NAME)))),
        Ok(None) => Ok((Config::default(), ConfigSource::Defaults)),
        Err(e) => Ok((Config::default(), ConfigSource::Unreadable(e))),
    }
}
