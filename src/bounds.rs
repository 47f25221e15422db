use anyhow::{Result, bail};

use crate::config::Config;
use crate::gpx::Track;

/// Geographic extent of all loaded tracks. min <= max holds on both axes;
/// tracks crossing the antimeridian are not supported.
#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
    pub center_lat: f64,
    pub center_lon: f64,
}

/// Per-track partial reduction, merged after the parallel parse completes.
#[derive(Debug, Clone, Copy)]
struct Accumulator {
    min_lat: f64,
    max_lat: f64,
    min_lon: f64,
    max_lon: f64,
    lat_sum: f64,
    lon_sum: f64,
    count: u64,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            min_lat: f64::INFINITY,
            max_lat: f64::NEG_INFINITY,
            min_lon: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
            lat_sum: 0.0,
            lon_sum: 0.0,
            count: 0,
        }
    }

    fn add(&mut self, lon: f64, lat: f64) {
        self.min_lat = self.min_lat.min(lat);
        self.max_lat = self.max_lat.max(lat);
        self.min_lon = self.min_lon.min(lon);
        self.max_lon = self.max_lon.max(lon);
        self.lat_sum += lat;
        self.lon_sum += lon;
        self.count += 1;
    }

    fn merge(mut self, other: &Accumulator) -> Self {
        self.min_lat = self.min_lat.min(other.min_lat);
        self.max_lat = self.max_lat.max(other.max_lat);
        self.min_lon = self.min_lon.min(other.min_lon);
        self.max_lon = self.max_lon.max(other.max_lon);
        self.lat_sum += other.lat_sum;
        self.lon_sum += other.lon_sum;
        self.count += other.count;
        self
    }
}

/// Reduce all track points to a bounding box and centroid. The optional manual
/// boundary adjustments from the configuration move the min/max bounds only;
/// the centroid always reflects the raw data.
pub fn compute_bounds(tracks: &[Track], config: &Config) -> Result<BoundingBox> {
    let merged = tracks
        .iter()
        .map(|track| {
            let mut acc = Accumulator::new();
            for segment in &track.segments {
                for coord in &segment.0 {
                    acc.add(coord.x, coord.y);
                }
            }
            acc
        })
        .fold(Accumulator::new(), |acc, part| acc.merge(&part));

    if merged.count == 0 {
        bail!("no coordinates found - no gpx files?");
    }

    let mut bbox = BoundingBox {
        min_lat: merged.min_lat,
        max_lat: merged.max_lat,
        min_lon: merged.min_lon,
        max_lon: merged.max_lon,
        center_lat: merged.lat_sum / merged.count as f64,
        center_lon: merged.lon_sum / merged.count as f64,
    };

    if config.adjust_boundaries {
        bbox.min_lat += config.min_lat_adjustment;
        bbox.max_lat += config.max_lat_adjustment;
        bbox.min_lon += config.min_lon_adjustment;
        bbox.max_lon += config.max_lon_adjustment;
    }

    Ok(bbox)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use geo_types::LineString;

    fn track(points: &[(f64, f64)]) -> Track {
        Track {
            name: "t".into(),
            date: NaiveDate::from_ymd_opt(2023, 6, 1).unwrap().and_hms_opt(8, 0, 0).unwrap(),
            segments: vec![LineString::from(points.to_vec())],
        }
    }

    #[test]
    fn extremes_and_centroid_match_hand_computation() {
        // (lon, lat) pairs
        let tracks = vec![
            track(&[(24.0, 60.0), (25.0, 61.0)]),
            track(&[(24.5, 59.5), (26.0, 60.5)]),
        ];
        let bbox = compute_bounds(&tracks, &Config::default()).unwrap();

        assert_eq!(bbox.min_lat, 59.5);
        assert_eq!(bbox.max_lat, 61.0);
        assert_eq!(bbox.min_lon, 24.0);
        assert_eq!(bbox.max_lon, 26.0);
        assert!((bbox.center_lat - 60.25).abs() < 1e-12);
        assert!((bbox.center_lon - 24.875).abs() < 1e-12);
    }

    #[test]
    fn empty_input_is_fatal() {
        let err = compute_bounds(&[], &Config::default()).unwrap_err();
        assert!(err.to_string().contains("no coordinates found"));

        let empty = vec![track(&[])];
        assert!(compute_bounds(&empty, &Config::default()).is_err());
    }

    #[test]
    fn adjustments_move_bounds_but_not_centroid() {
        let tracks = vec![track(&[(24.0, 60.0), (25.0, 61.0)])];
        let mut cfg = Config::default();
        cfg.adjust_boundaries = true;
        cfg.min_lat_adjustment = -0.1;
        cfg.max_lat_adjustment = 0.2;
        cfg.min_lon_adjustment = 0.05;
        cfg.max_lon_adjustment = -0.05;

        let bbox = compute_bounds(&tracks, &cfg).unwrap();
        assert!((bbox.min_lat - 59.9).abs() < 1e-12);
        assert!((bbox.max_lat - 61.2).abs() < 1e-12);
        assert!((bbox.min_lon - 24.05).abs() < 1e-12);
        assert!((bbox.max_lon - 24.95).abs() < 1e-12);
        assert!((bbox.center_lat - 60.5).abs() < 1e-12);
        assert!((bbox.center_lon - 24.5).abs() < 1e-12);
    }

    #[test]
    fn disabled_adjustments_are_ignored() {
        let tracks = vec![track(&[(24.0, 60.0), (25.0, 61.0)])];
        let mut cfg = Config::default();
        cfg.min_lat_adjustment = -5.0;
        let bbox = compute_bounds(&tracks, &cfg).unwrap();
        assert_eq!(bbox.min_lat, 60.0);
    }
}
