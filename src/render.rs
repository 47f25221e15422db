use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDateTime};
use image::{Rgba, RgbaImage, imageops};
use std::fs;
use std::path::{Path, PathBuf};

use crate::bounds::BoundingBox;
use crate::config::{Config, TILE_SIZE};
use crate::fetch::{Provider, tile_path};
use crate::gpx::Track;
use crate::tiles::{lat_to_tile, lon_to_tile};

const TRACK_STROKE_WIDTH: f64 = 3.5;
const LEGEND_FONT_SIZE: u32 = 35;
const LEGEND_LINE_STEP: i64 = 40;

/// Background for map regions whose tile is missing from the cache.
const BLANK_TILE_COLOR: Rgba<u8> = Rgba([221, 221, 221, 255]);

/// Fixed-size pixel window centered on the track centroid at the selected
/// zoom. All frames share one viewport.
pub struct Viewport {
    pub zoom: u32,
    pub width: u32,
    pub height: u32,
    origin_x: f64,
    origin_y: f64,
}

impl Viewport {
    pub fn new(bbox: &BoundingBox, zoom: u32, width: u32, height: u32) -> Self {
        let center_x = lon_to_tile(zoom, bbox.center_lon) * TILE_SIZE as f64;
        let center_y = lat_to_tile(zoom, bbox.center_lat) * TILE_SIZE as f64;
        Self {
            zoom,
            width,
            height,
            origin_x: center_x - width as f64 / 2.0,
            origin_y: center_y - height as f64 / 2.0,
        }
    }

    /// Convert WGS84 (lon, lat) to pixel coordinates in the frame.
    pub fn project(&self, lon: f64, lat: f64) -> (f64, f64) {
        let x = lon_to_tile(self.zoom, lon) * TILE_SIZE as f64 - self.origin_x;
        let y = lat_to_tile(self.zoom, lat) * TILE_SIZE as f64 - self.origin_y;
        (x, y)
    }
}

/// Render one frame per track in chronological order: frame N shows tracks
/// 0..=N over the stitched base map, stamped with the date legend. Returns
/// the frame paths in order, including the year-only copy of the final frame.
pub fn render_frames(
    tracks: &[Track],
    bbox: &BoundingBox,
    zoom: u32,
    provider: Provider,
    config: &Config,
) -> Result<Vec<PathBuf>> {
    let viewport = Viewport::new(bbox, zoom, config.map_width, config.map_height);
    let cache_root = Path::new(&config.cache_dir).join(provider.cache_subdir());
    let mut map = stitch_base_map(&viewport, &cache_root);

    let out_dir = Path::new(&config.output_dir);
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output directory {}", config.output_dir))?;

    eprintln!("Rendering {} frames at zoom {zoom}", tracks.len());
    let mut frame_paths = Vec::new();

    for (i, track) in tracks.iter().enumerate() {
        let color = config.year_color(track.date.year()).to_string();
        let overlay = rasterize_svg(&track_overlay_svg(&viewport, track, &color))?;
        composite_into(&mut map, &overlay);

        let mut frame = map.clone();
        if config.timestamps {
            let legend = rasterize_svg(&legend_svg(&viewport, track.date, config, false))?;
            composite_into(&mut frame, &legend);
        }

        let path = out_dir.join(format!("{i:08}.png"));
        frame
            .save(&path)
            .with_context(|| format!("Failed to save frame {}", path.display()))?;
        frame_paths.push(path);
        eprint!("\r{} / {} frames   ", i + 1, tracks.len());
    }
    eprintln!();

    // Extra copy of the final state stamped with the year only, for holding
    // the last video frame.
    if let Some(last) = tracks.last() {
        let mut frame = map;
        if config.timestamps {
            let legend = rasterize_svg(&legend_svg(&viewport, last.date, config, true))?;
            composite_into(&mut frame, &legend);
        }
        let path = out_dir.join(format!("{:08}_last.png", tracks.len() - 1));
        frame
            .save(&path)
            .with_context(|| format!("Failed to save frame {}", path.display()))?;
        frame_paths.push(path);
    }

    write_concat_list(out_dir, &frame_paths)?;
    Ok(frame_paths)
}

/// ffmpeg concat demuxer input listing every frame in display order.
fn write_concat_list(out_dir: &Path, frame_paths: &[PathBuf]) -> Result<()> {
    let mut list = String::new();
    for path in frame_paths {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        list.push_str(&format!("file '{name}'\n"));
    }
    let list_path = out_dir.join("images.txt");
    fs::write(&list_path, list)
        .with_context(|| format!("Failed to write {}", list_path.display()))?;
    eprintln!("Wrote {} frames and {}", frame_paths.len(), list_path.display());
    Ok(())
}

/// Assemble the base map from cached tiles. Tiles missing from the cache (or
/// unreadable) leave their region blank.
fn stitch_base_map(viewport: &Viewport, cache_root: &Path) -> RgbaImage {
    let mut base =
        RgbaImage::from_pixel(viewport.width, viewport.height, BLANK_TILE_COLOR);

    let tile = TILE_SIZE as f64;
    let tx_min = (viewport.origin_x / tile).floor() as i64;
    let tx_max = ((viewport.origin_x + viewport.width as f64) / tile).floor() as i64;
    let ty_min = (viewport.origin_y / tile).floor() as i64;
    let ty_max = ((viewport.origin_y + viewport.height as f64) / tile).floor() as i64;

    let mut missing = 0u32;
    for tx in tx_min..=tx_max {
        for ty in ty_min..=ty_max {
            let path = tile_path(cache_root, viewport.zoom, tx, ty);
            if !path.exists() {
                missing += 1;
                continue;
            }
            match image::open(&path) {
                Ok(img) => {
                    let px = (tx as f64 * tile - viewport.origin_x).round() as i64;
                    let py = (ty as f64 * tile - viewport.origin_y).round() as i64;
                    imageops::overlay(&mut base, &img.to_rgba8(), px, py);
                }
                Err(e) => {
                    eprintln!("Warning: unreadable cached tile {}: {e}", path.display());
                    missing += 1;
                }
            }
        }
    }
    if missing > 0 {
        eprintln!("Warning: {missing} tiles missing from cache, regions left blank");
    }
    base
}

fn track_overlay_svg(viewport: &Viewport, track: &Track, color: &str) -> String {
    let (w, h) = (viewport.width, viewport.height);
    let mut svg = format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"##,
    );
    for segment in &track.segments {
        if let Some(d) = linestring_to_path(&segment.0, viewport) {
            svg.push_str(&format!(
                r##"<path d="{d}" fill="none" stroke="{color}" stroke-width="{TRACK_STROKE_WIDTH}" stroke-opacity="1" stroke-linecap="round" stroke-linejoin="round"/>"##,
            ));
        }
    }
    svg.push_str("</svg>");
    svg
}

/// Year history plus the current frame's stamp, stacked top-left. Earlier
/// years are listed from the first configured year up to (not including) the
/// frame's year, each in its own color.
fn legend_svg(viewport: &Viewport, date: NaiveDateTime, config: &Config, year_only: bool) -> String {
    let (w, h) = (viewport.width, viewport.height);
    let year = date.year();
    let mut svg = format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"##,
    );

    let mut y = 10i64;
    if let Some(&first_year) = config.year_colors.keys().next() {
        for past in first_year..year {
            svg.push_str(&legend_text(10, y, &past.to_string(), config.year_color(past)));
            y += LEGEND_LINE_STEP;
        }
    }

    let stamp = if year_only {
        year.to_string()
    } else {
        date.format("%Y-%m-%d").to_string()
    };
    svg.push_str(&legend_text(10, y, &stamp, config.year_color(year)));

    svg.push_str("</svg>");
    svg
}

fn legend_text(x: i64, y: i64, text: &str, color: &str) -> String {
    // The y coordinate is the top of the line; SVG text anchors at the
    // baseline.
    let baseline = y + LEGEND_FONT_SIZE as i64 - 2;
    format!(
        r##"<text x="{x}" y="{baseline}" font-family="sans-serif" font-size="{LEGEND_FONT_SIZE}" font-weight="bold" fill="{color}" stroke="black" stroke-width="1">{text}</text>"##,
    )
}

fn linestring_to_path(coords: &[geo_types::Coord<f64>], viewport: &Viewport) -> Option<String> {
    let points: Vec<(f64, f64)> = coords.iter().map(|c| viewport.project(c.x, c.y)).collect();
    if points.len() < 2 {
        return None;
    }
    let mut d = format!("M{:.1},{:.1}", points[0].0, points[0].1);
    for p in &points[1..] {
        d.push_str(&format!(" L{:.1},{:.1}", p.0, p.1));
    }
    Some(d)
}

fn rasterize_svg(svg_content: &str) -> Result<resvg::tiny_skia::Pixmap> {
    let opts = resvg::usvg::Options::default();
    let tree =
        resvg::usvg::Tree::from_str(svg_content, &opts).context("Failed to parse SVG overlay")?;

    let size = tree.size();
    let mut pixmap = resvg::tiny_skia::Pixmap::new(size.width() as u32, size.height() as u32)
        .context("Failed to create pixmap")?;

    resvg::render(
        &tree,
        resvg::tiny_skia::Transform::default(),
        &mut pixmap.as_mut(),
    );
    Ok(pixmap)
}

/// Alpha-blend the rasterized overlay into the accumulating map. Pixmap data
/// is premultiplied RGBA, so source channels add directly.
fn composite_into(map: &mut RgbaImage, overlay: &resvg::tiny_skia::Pixmap) {
    let overlay_data = overlay.data();
    let w = map.width().min(overlay.width());
    let h = map.height().min(overlay.height());

    for y in 0..h {
        for x in 0..w {
            let idx = (y * overlay.width() + x) as usize * 4;
            let sa = overlay_data[idx + 3] as u32;
            if sa == 0 {
                continue;
            }

            let sr = overlay_data[idx] as u32;
            let sg = overlay_data[idx + 1] as u32;
            let sb = overlay_data[idx + 2] as u32;

            let dst = map.get_pixel(x, y);
            let inv_sa = 255 - sa;

            map.put_pixel(
                x,
                y,
                Rgba([
                    (sr + dst[0] as u32 * inv_sa / 255).min(255) as u8,
                    (sg + dst[1] as u32 * inv_sa / 255).min(255) as u8,
                    (sb + dst[2] as u32 * inv_sa / 255).min(255) as u8,
                    (sa + dst[3] as u32 * inv_sa / 255).min(255) as u8,
                ]),
            );
        }
    }
}
