mod bounds;
mod config;
mod fetch;
mod gpx;
mod render;
mod tiles;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::Path;

use crate::bounds::BoundingBox;
use crate::config::Config;
use crate::gpx::Track;

#[derive(Parser)]
#[command(
    name = "gpxlapse",
    about = "Turns a folder of GPX recordings into timelapse map frames"
)]
struct Cli {
    /// JSON config file (gpxlapse.json in the working directory is picked up
    /// automatically)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Viewport width in pixels
    #[arg(long, global = true)]
    width: Option<u32>,

    /// Viewport height in pixels
    #[arg(long, global = true)]
    height: Option<u32>,

    /// Signed adjustment to the autodetected zoom level
    #[arg(long, global = true)]
    extra_zoom: Option<i32>,

    /// Extra tiles cached on every side of the detected range
    #[arg(long, global = true)]
    padding: Option<u32>,

    /// Parallel workers for GPX parsing
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect map bounds and zoom, then sync the tile cache
    Fetch {
        /// Directory containing GPX files
        #[arg(short, long)]
        input_dir: Option<String>,

        /// Tile provider
        #[arg(short = 'p', long, default_value = "openstreetmap")]
        tile_provider: TileProvider,

        /// API key for providers that require one
        #[arg(long, default_value = "")]
        api_key: String,
    },

    /// Sync the tile cache and render the timelapse frames
    Render {
        /// Directory containing GPX files
        #[arg(short, long)]
        input_dir: Option<String>,

        /// Directory for the rendered frames
        #[arg(short, long)]
        output_dir: Option<String>,

        /// Tile provider
        #[arg(short = 'p', long, default_value = "openstreetmap")]
        tile_provider: TileProvider,

        /// API key for providers that require one
        #[arg(long, default_value = "")]
        api_key: String,

        /// Skip the date/year legend
        #[arg(long)]
        no_timestamps: bool,

        /// Keep existing files in the output directory
        #[arg(long)]
        keep_output: bool,
    },

    /// Print detected bounds, zoom and tile range without fetching anything
    Bounds {
        /// Directory containing GPX files
        #[arg(short, long)]
        input_dir: Option<String>,
    },
}

#[derive(Clone, ValueEnum)]
enum TileProvider {
    Openstreetmap,
    Alidade,
}

fn resolve_provider(tp: &TileProvider) -> fetch::Provider {
    match tp {
        TileProvider::Openstreetmap => fetch::Provider::OpenStreetMap,
        TileProvider::Alidade => fetch::Provider::AlidadeSmooth,
    }
}

/// Load tracks, reduce them to a bounding box and pick the zoom level. The
/// selected zoom may overshoot the configured adjustment into negative
/// territory, which is a configuration error.
fn detect(cfg: &Config) -> Result<(Vec<Track>, BoundingBox, u32)> {
    let tracks = gpx::load_tracks(&cfg.input_dir, cfg.workers)?;
    let bbox = bounds::compute_bounds(&tracks, cfg)?;
    let zoom = tiles::select_zoom(
        &bbox,
        cfg.map_width,
        cfg.map_height,
        cfg.additional_zoom_levels,
    )?;
    let zoom = u32::try_from(zoom)
        .map_err(|_| anyhow!("zoom level {zoom} out of range, check additional_zoom_levels"))?;

    eprintln!(
        "Bounds: latitude {:.5} to {:.5}, longitude {:.5} to {:.5}",
        bbox.min_lat, bbox.max_lat, bbox.min_lon, bbox.max_lon,
    );
    eprintln!("Zoom level {zoom}");
    Ok((tracks, bbox, zoom))
}

async fn sync_cache(
    cfg: &Config,
    bbox: &BoundingBox,
    zoom: u32,
    provider: fetch::Provider,
    api_key: &str,
) -> Result<()> {
    let range = tiles::tile_range(bbox, zoom, cfg.padding);
    let client = fetch::build_client()?;
    let report = fetch::sync_tiles(&client, &range, provider, api_key, &cfg.cache_dir).await;
    eprintln!(
        "Tile cache synced: {} fetched, {} already cached, {} failed",
        report.fetched, report.skipped, report.failed,
    );
    Ok(())
}

/// Remove plain files from the output directory, leaving subdirectories
/// intact.
fn clear_output_dir(dir: &str) -> Result<()> {
    let path = Path::new(dir);
    if !path.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(path).with_context(|| format!("Failed to read {dir}"))? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Err(e) = fs::remove_file(entry.path()) {
                eprintln!("Warning: failed to delete {}: {e}", entry.path().display());
            }
        }
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(cli.config.as_deref())?;
    if let Some(width) = cli.width {
        cfg.map_width = width;
    }
    if let Some(height) = cli.height {
        cfg.map_height = height;
    }
    if let Some(extra) = cli.extra_zoom {
        cfg.additional_zoom_levels = extra;
    }
    if let Some(padding) = cli.padding {
        cfg.padding = padding;
    }
    if let Some(workers) = cli.workers {
        cfg.workers = workers.max(1);
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = load_config(&cli)?;

    match cli.command {
        Commands::Fetch {
            input_dir,
            tile_provider,
            api_key,
        } => {
            if let Some(dir) = input_dir {
                cfg.input_dir = dir;
            }
            let (_tracks, bbox, zoom) = detect(&cfg)?;
            sync_cache(&cfg, &bbox, zoom, resolve_provider(&tile_provider), &api_key).await?;
        }

        Commands::Render {
            input_dir,
            output_dir,
            tile_provider,
            api_key,
            no_timestamps,
            keep_output,
        } => {
            if let Some(dir) = input_dir {
                cfg.input_dir = dir;
            }
            if let Some(dir) = output_dir {
                cfg.output_dir = dir;
            }
            if no_timestamps {
                cfg.timestamps = false;
            }
            let provider = resolve_provider(&tile_provider);

            let (tracks, bbox, zoom) = detect(&cfg)?;
            sync_cache(&cfg, &bbox, zoom, provider, &api_key).await?;

            if cfg.clear_output_folder && !keep_output {
                clear_output_dir(&cfg.output_dir)?;
            }
            render::render_frames(&tracks, &bbox, zoom, provider, &cfg)?;
            eprintln!(
                "Done. Feed {}/images.txt to ffmpeg's concat demuxer to build the video.",
                cfg.output_dir,
            );
        }

        Commands::Bounds { input_dir } => {
            if let Some(dir) = input_dir {
                cfg.input_dir = dir;
            }
            let (tracks, bbox, zoom) = detect(&cfg)?;
            let range = tiles::tile_range(&bbox, zoom, cfg.padding);
            eprintln!("Tracks: {}", tracks.len());
            eprintln!("Centroid: {:.5}, {:.5}", bbox.center_lat, bbox.center_lon);
            eprintln!(
                "Tiles x {} to {}, y {} to {} ({} tiles at zoom {})",
                range.min_x,
                range.max_x,
                range.min_y,
                range.max_y,
                range.count(),
                range.zoom,
            );
        }
    }

    Ok(())
}
