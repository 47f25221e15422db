use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime};
use geo_types::LineString;
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

/// One GPX recording: its track segments and the moment it was recorded.
#[derive(Debug)]
pub struct Track {
    pub name: String,
    pub date: NaiveDateTime,
    pub segments: Vec<LineString<f64>>,
}

impl Track {
    pub fn point_count(&self) -> usize {
        self.segments.iter().map(|s| s.0.len()).sum()
    }
}

/// Load every .gpx file under `dir`, parsing up to `workers` files in
/// parallel. Files that fail to parse, contain no points or carry no <time>
/// stamp are skipped with a warning. The result is sorted chronologically.
pub fn load_tracks(dir: &str, workers: usize) -> Result<Vec<Track>> {
    let dir_path = Path::new(dir);
    if !dir_path.exists() {
        anyhow::bail!("Input directory '{dir}' does not exist. Put your .gpx files there.");
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read directory {dir}"))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "gpx"))
        .collect();
    paths.sort();

    if paths.is_empty() {
        anyhow::bail!("No .gpx files found in '{dir}'");
    }
    eprintln!("{} gpx files found in {dir}", paths.len());

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("Failed to build worker pool")?;

    let results: Vec<(PathBuf, Result<Track>)> = pool.install(|| {
        paths
            .par_iter()
            .map(|path| (path.clone(), parse_track(path)))
            .collect()
    });

    let mut tracks = Vec::new();
    for (path, result) in results {
        match result {
            Ok(track) => {
                eprintln!(
                    "Loaded {} — {} ({} segments, {} points)",
                    track.name,
                    track.date.date(),
                    track.segments.len(),
                    track.point_count(),
                );
                tracks.push(track);
            }
            Err(e) => {
                eprintln!("Warning: skipping {}: {e}", path.display());
            }
        }
    }

    tracks.sort_by_key(|t| t.date);
    eprintln!("Loaded {} tracks from {dir}", tracks.len());
    Ok(tracks)
}

fn parse_track(path: &Path) -> Result<Track> {
    let data =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let gpx_data =
        gpx::read(data.as_bytes()).with_context(|| format!("Failed to parse {}", path.display()))?;

    let name = gpx_data
        .metadata
        .as_ref()
        .and_then(|m| m.name.clone())
        .or_else(|| path.file_stem().map(|s| s.to_string_lossy().to_string()))
        .unwrap_or_default();

    let date = first_time_stamp(&data)
        .with_context(|| format!("No parseable <time> stamp in {}", path.display()))?;

    let mut segments = Vec::new();
    for track in &gpx_data.tracks {
        for segment in &track.segments {
            let coords: Vec<(f64, f64)> = segment
                .points
                .iter()
                .map(|p| (p.point().x(), p.point().y()))
                .collect();
            if !coords.is_empty() {
                segments.push(LineString::from(coords));
            }
        }
    }

    if segments.is_empty() {
        anyhow::bail!("no track points");
    }

    Ok(Track {
        name,
        date,
        segments,
    })
}

/// First <time> element in the raw document, which is the recording start in
/// every GPX exporter encountered so far.
fn first_time_stamp(data: &str) -> Option<NaiveDateTime> {
    let start = data.find("<time>")? + "<time>".len();
    let end = data[start..].find("</time>")? + start;
    let raw = data[start..end].trim();

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%SZ")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.naive_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1">
  <metadata><time>2023-06-01T08:00:00Z</time></metadata>
  <trk><name>Morning ride</name>
    <trkseg>
      <trkpt lat="60.17" lon="24.94"><time>2023-06-01T08:00:00Z</time></trkpt>
      <trkpt lat="60.18" lon="24.95"><time>2023-06-01T08:01:00Z</time></trkpt>
    </trkseg>
  </trk>
</gpx>"#;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gpxlapse-test-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn parses_points_and_date() {
        let dir = temp_dir("parse");
        fs::write(dir.join("a.gpx"), SAMPLE).unwrap();

        let tracks = load_tracks(dir.to_str().unwrap(), 2).unwrap();
        assert_eq!(tracks.len(), 1);
        let track = &tracks[0];
        assert_eq!(track.name, "Morning ride");
        assert_eq!(
            track.date,
            NaiveDate::from_ymd_opt(2023, 6, 1).unwrap().and_hms_opt(8, 0, 0).unwrap()
        );
        assert_eq!(track.point_count(), 2);
        assert_eq!(track.segments[0].0[0].x, 24.94);
        assert_eq!(track.segments[0].0[0].y, 60.17);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn bad_file_is_skipped_not_fatal() {
        let dir = temp_dir("skip");
        fs::write(dir.join("a.gpx"), SAMPLE).unwrap();
        fs::write(dir.join("broken.gpx"), "<gpx").unwrap();

        let tracks = load_tracks(dir.to_str().unwrap(), 2).unwrap();
        assert_eq!(tracks.len(), 1);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn tracks_sorted_chronologically() {
        let dir = temp_dir("sort");
        let later = SAMPLE.replace("2023-06-01", "2024-01-15");
        // Lexicographic file order is the reverse of time order here.
        fs::write(dir.join("a.gpx"), &later).unwrap();
        fs::write(dir.join("b.gpx"), SAMPLE).unwrap();

        let tracks = load_tracks(dir.to_str().unwrap(), 1).unwrap();
        assert_eq!(tracks.len(), 2);
        assert!(tracks[0].date < tracks[1].date);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_directory_errors() {
        assert!(load_tracks("/nonexistent/gpxlapse", 1).is_err());
    }

    #[test]
    fn rfc3339_offsets_accepted() {
        let stamped = "<time>2023-06-01T08:00:00+03:00</time>";
        let dt = first_time_stamp(stamped).unwrap();
        assert_eq!(
            dt,
            NaiveDate::from_ymd_opt(2023, 6, 1).unwrap().and_hms_opt(5, 0, 0).unwrap()
        );
    }
}
