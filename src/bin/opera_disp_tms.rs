use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use opera_disp_tms::core::spanning_set::SelectionStrategy;
use opera_disp_tms::core::tile_map::create_tile_map;
use opera_disp_tms::io::catalog::StaticGranules;
use opera_disp_tms::io::credentials::{CredentialProvider, StaticCredentialProvider, TemporaryCredentialProvider};
use opera_disp_tms::{
    BoundingBox, CmrClient, FrameIndex, GranuleSource, MeasurementType, NetcdfGranuleLoader, OrbitPass, Pipeline,
    PipelineConfig,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "opera-disp-tms", about = "Displacement and velocity tiles from OPERA DISP granules")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON pipeline configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory products are written to
    #[arg(long, global = true, default_value = ".")]
    out_dir: PathBuf,

    /// Read granules from a JSON cache instead of searching CMR
    #[arg(long, global = true)]
    granule_cache: Option<PathBuf>,

    /// Use every granule in the window instead of the minimal spanning set
    #[arg(long, global = true)]
    all_granules: bool,

    /// Zero-fill NaNs in rasters at least this complete relative to the best one
    #[arg(long, global = true)]
    gap_fill_threshold: Option<f64>,

    /// Clamp measurements to their display scale band
    #[arg(long, global = true)]
    clip_to_scale: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a 1x1 degree frame metadata tile
    MetadataTile(MetadataTileArgs),
    /// Create a measurement GeoTIFF for a single frame
    FrameGeotiff(FrameGeotiffArgs),
    /// Create a measurement tile for one 1x1 degree tile
    Tile(TileArgs),
    /// Create measurement tiles over a bounding box and package them as a tile map
    Tiles(TilesArgs),
    /// Print export lines for temporary S3 credentials
    Credentials,
}

fn parse_day(value: &str) -> Result<DateTime<Utc>, String> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .map_err(|e| format!("expected YYYYMMDD: {}", e))
        .and_then(|d| d.and_hms_opt(0, 0, 0).ok_or_else(|| "invalid time".to_string()))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[derive(Args)]
#[command(allow_negative_numbers = true)]
struct MetadataTileArgs {
    /// Upper left longitude
    min_lon: i32,
    /// Upper left latitude
    max_lat: i32,
    /// ascending or descending
    direction: OrbitPass,
}

#[derive(Args)]
struct FrameGeotiffArgs {
    /// Frame id of the OPERA DISP granule stack
    #[arg(value_parser = clap::value_parser!(u32).range(1..=46986))]
    frame_id: u32,
    /// displacement, secant_velocity or velocity
    measurement: MeasurementType,
    /// Start of the secondary date window (YYYYMMDD)
    #[arg(value_parser = parse_day)]
    begin: DateTime<Utc>,
    /// End of the secondary date window (YYYYMMDD)
    #[arg(value_parser = parse_day)]
    end: DateTime<Utc>,
}

#[derive(Args)]
#[command(allow_negative_numbers = true)]
struct TileArgs {
    measurement: MeasurementType,
    min_lon: i32,
    max_lat: i32,
    direction: OrbitPass,
    #[arg(value_parser = parse_day)]
    begin: DateTime<Utc>,
    #[arg(value_parser = parse_day)]
    end: DateTime<Utc>,
}

#[derive(Args)]
#[command(allow_negative_numbers = true)]
struct TilesArgs {
    measurement: MeasurementType,
    min_lon: i32,
    min_lat: i32,
    max_lon: i32,
    max_lat: i32,
    direction: OrbitPass,
    #[arg(value_parser = parse_day)]
    begin: DateTime<Utc>,
    #[arg(value_parser = parse_day)]
    end: DateTime<Utc>,
    /// Tile map output folder (defaults to the measurement name)
    #[arg(long)]
    tile_map: Option<PathBuf>,
}

fn credential_provider(config: &PipelineConfig) -> Result<Arc<dyn CredentialProvider>> {
    if let Some(provider) = StaticCredentialProvider::from_env() {
        log::debug!("Using S3 credentials from the environment");
        return Ok(Arc::new(provider));
    }
    Ok(Arc::new(TemporaryCredentialProvider::new(
        config.credentials_endpoint.clone(),
        config.credentials_ttl_secs,
    )?))
}

fn granule_source(cli: &Cli, config: &PipelineConfig) -> Result<Box<dyn GranuleSource>> {
    match &cli.granule_cache {
        Some(path) => Ok(Box::new(
            StaticGranules::from_cache_file(path).with_context(|| format!("reading {}", path.display()))?,
        )),
        None => Ok(Box::new(CmrClient::new(config)?)),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    if cli.gap_fill_threshold.is_some() {
        config.gap_fill_threshold = cli.gap_fill_threshold;
    }
    config.clip_to_scale |= cli.clip_to_scale;
    config.validate()?;

    if let Commands::Credentials = cli.command {
        let credentials = credential_provider(&config)?.credentials()?;
        println!("Run these commands in your terminal to set up your temporary AWS Credentials:\n");
        for line in credentials.export_lines() {
            println!("{}", line);
        }
        return Ok(());
    }

    std::fs::create_dir_all(&cli.out_dir)?;
    let source = granule_source(&cli, &config)?;
    let loader = NetcdfGranuleLoader::new(credential_provider(&config)?);
    let strategy = if cli.all_granules { SelectionStrategy::All } else { SelectionStrategy::Spanning };
    let pipeline = Pipeline::new(&config, source.as_ref(), &loader).with_strategy(strategy);

    match &cli.command {
        Commands::MetadataTile(args) => {
            let bbox = BoundingBox::from_upper_left(args.min_lon, args.max_lat)?;
            let frame_index = FrameIndex::open(&config)?;
            match pipeline.create_metadata_tile_for_bbox(&bbox, args.direction, &frame_index, &cli.out_dir)? {
                Some(path) => println!("{}", path.display()),
                None => log::warn!("No metadata tile created for {:?}", bbox),
            }
        }
        Commands::FrameGeotiff(args) => {
            let path =
                pipeline.create_measurement_geotiff(args.frame_id, args.measurement, args.begin, args.end, &cli.out_dir)?;
            println!("{}", path.display());
        }
        Commands::Tile(args) => {
            let frame_index = FrameIndex::open(&config)?;
            let product = pipeline.generate_tile(
                args.measurement,
                args.min_lon,
                args.max_lat,
                args.direction,
                args.begin,
                args.end,
                &frame_index,
                &cli.out_dir,
            )?;
            match product {
                Some(path) => println!("{}", path.display()),
                None => log::warn!("No tile created"),
            }
        }
        Commands::Tiles(args) => {
            let bbox = BoundingBox::new(args.min_lon, args.min_lat, args.max_lon, args.max_lat)?;
            let frame_index = FrameIndex::open(&config)?;
            let products = pipeline.generate_tiles(
                args.measurement,
                &bbox,
                args.direction,
                args.begin,
                args.end,
                &frame_index,
                &cli.out_dir,
            )?;
            if products.is_empty() {
                log::warn!("No tiles created for {:?}", bbox);
                return Ok(());
            }

            let folder = args
                .tile_map
                .clone()
                .unwrap_or_else(|| cli.out_dir.join(args.measurement.as_str()));
            let scale = config.scale_for(args.measurement);
            create_tile_map(&folder, &products, &scale, args.measurement.units())?;
            println!("{}", folder.display());
        }
        Commands::Credentials => {}
    }

    Ok(())
}
