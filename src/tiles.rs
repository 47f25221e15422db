use anyhow::{Result, bail};
use std::f64::consts::PI;

use crate::bounds::BoundingBox;
use crate::config::{MAX_ZOOM, TILE_SIZE};

/// Inclusive rectangle of slippy-map tile indices at one zoom level, already
/// expanded by the configured padding. Padded indices may fall outside the
/// valid grid; the fetch layer passes them through and counts the refusals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub zoom: u32,
    pub min_x: i64,
    pub max_x: i64,
    pub min_y: i64,
    pub max_y: i64,
}

impl TileRange {
    pub fn count(&self) -> u64 {
        let w = (self.max_x - self.min_x + 1) as u64;
        let h = (self.max_y - self.min_y + 1) as u64;
        w * h
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        let (min_y, max_y) = (self.min_y, self.max_y);
        (self.min_x..=self.max_x).flat_map(move |x| (min_y..=max_y).map(move |y| (x, y)))
    }
}

/// Horizontal tile fraction of a longitude at the given zoom.
pub fn lon_to_tile(zoom: u32, lon: f64) -> f64 {
    (lon + 180.0) / 360.0 * 2_f64.powi(zoom as i32)
}

/// Vertical tile fraction of a latitude at the given zoom (0 at the north edge
/// of the projection, growing southward).
pub fn lat_to_tile(zoom: u32, lat: f64) -> f64 {
    let lat_rad = lat.to_radians();
    (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * 2_f64.powi(zoom as i32)
}

/// Find the largest zoom in [0, MAX_ZOOM] at which the bounding box's pixel
/// span fits the viewport on both axes, then apply the signed operator
/// adjustment. The adjusted result is not clamped; if nothing fits at all the
/// result is a plain 0.
pub fn select_zoom(bbox: &BoundingBox, width_px: u32, height_px: u32, extra: i32) -> Result<i32> {
    if width_px == 0 || height_px == 0 {
        bail!("viewport dimensions must be positive, got {width_px}x{height_px}");
    }

    for zoom in (0..=MAX_ZOOM).rev() {
        let lat_px =
            (lat_to_tile(zoom, bbox.min_lat) - lat_to_tile(zoom, bbox.max_lat)).abs() * TILE_SIZE as f64;
        let lon_px =
            (lon_to_tile(zoom, bbox.min_lon) - lon_to_tile(zoom, bbox.max_lon)).abs() * TILE_SIZE as f64;

        if lat_px <= height_px as f64 && lon_px <= width_px as f64 {
            return Ok(zoom as i32 + extra);
        }
    }
    Ok(0)
}

fn coordinates_to_tile(zoom: u32, lat: f64, lon: f64) -> (i64, i64) {
    let x = lon_to_tile(zoom, lon).floor() as i64;
    let y = lat_to_tile(zoom, lat).floor() as i64;
    (x, y)
}

/// Project the box corners to tile indices and pad every side. Latitude grows
/// northward while tile y grows southward, so the max latitude gives min_y.
pub fn tile_range(bbox: &BoundingBox, zoom: u32, padding: u32) -> TileRange {
    let (min_x, min_y) = coordinates_to_tile(zoom, bbox.max_lat, bbox.min_lon);
    let (max_x, max_y) = coordinates_to_tile(zoom, bbox.min_lat, bbox.max_lon);
    let p = padding as i64;

    TileRange {
        zoom,
        min_x: min_x - p,
        max_x: max_x + p,
        min_y: min_y - p,
        max_y: max_y + p,
    }
}
