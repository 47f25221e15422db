use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const TILE_SIZE: u32 = 256;
pub const MAX_ZOOM: u32 = 20;

pub const DEFAULT_MAP_WIDTH: u32 = 1920;
pub const DEFAULT_MAP_HEIGHT: u32 = 1080;
pub const DEFAULT_PADDING: u32 = 5;
pub const DEFAULT_EXTRA_ZOOM: i32 = 1;

pub const TILE_CACHE_DIR: &str = "data/tiles";

/// Fetches running concurrently against the tile service.
pub const TILE_FETCH_CONCURRENCY: usize = 8;
pub const TILE_FETCH_TIMEOUT_SECS: u64 = 5;

/// Settings shared by the subcommands. Compiled defaults, optionally overridden
/// by a JSON config file, then by CLI flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub map_width: u32,
    pub map_height: u32,

    pub input_dir: String,
    pub output_dir: String,
    pub cache_dir: String,

    /// Stamp date/year legends onto the output frames.
    pub timestamps: bool,

    /// Colors per recording year, chronological. Years without an entry render
    /// black and are left off the legend.
    pub year_colors: BTreeMap<i32, String>,

    /// Extra tiles cached on every side of the detected tile range.
    #[serde(rename = "extra_map_tiles")]
    pub padding: u32,

    /// Signed adjustment to the autodetected zoom level.
    pub additional_zoom_levels: i32,

    pub adjust_boundaries: bool,
    pub min_lat_adjustment: f64,
    pub max_lat_adjustment: f64,
    pub min_lon_adjustment: f64,
    pub max_lon_adjustment: f64,

    /// Delete leftover frames from the output directory before rendering.
    pub clear_output_folder: bool,

    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            map_width: DEFAULT_MAP_WIDTH,
            map_height: DEFAULT_MAP_HEIGHT,
            input_dir: "input".into(),
            output_dir: "output".into(),
            cache_dir: TILE_CACHE_DIR.into(),
            timestamps: true,
            year_colors: default_year_colors(),
            padding: DEFAULT_PADDING,
            additional_zoom_levels: DEFAULT_EXTRA_ZOOM,
            adjust_boundaries: false,
            min_lat_adjustment: 0.0,
            max_lat_adjustment: 0.0,
            min_lon_adjustment: 0.0,
            max_lon_adjustment: 0.0,
            clear_output_folder: true,
            workers: default_workers(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file {p}"))?;
                serde_json::from_str(&data)
                    .with_context(|| format!("Failed to parse config file {p}"))
            }
            None => {
                // A gpxlapse.json in the working directory is picked up automatically.
                let default_path = "gpxlapse.json";
                if Path::new(default_path).exists() {
                    let data = fs::read_to_string(default_path)?;
                    serde_json::from_str(&data)
                        .with_context(|| format!("Failed to parse config file {default_path}"))
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn year_color(&self, year: i32) -> &str {
        self.year_colors
            .get(&year)
            .map(String::as_str)
            .unwrap_or("#000000")
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1)
}

fn default_year_colors() -> BTreeMap<i32, String> {
    [
        (2018, "#000000"),
        (2019, "#0000FF"),
        (2020, "#6600BB"),
        (2021, "#FF0000"),
        (2022, "#00AA00"),
        (2023, "#888800"),
        (2024, "#FF88FF"),
    ]
    .into_iter()
    .map(|(y, c)| (y, c.to_string()))
    .collect()
}
