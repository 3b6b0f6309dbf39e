//! Web-mercator projection for world centroids.
//!
//! Not a general geodesy library (explicitly out of scope) — just the one
//! conversion the mission's `World` centroid needs: geographic lat/long into
//! the single projected coordinate system everything else is stored in.

use crate::domain::Position2D;

/// Earth radius used by the standard web-mercator (EPSG:3857) definition.
const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Projects geographic coordinates (degrees) into web-mercator meters.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebMercator;

impl WebMercator {
    /// Convert (latitude, longitude) in degrees to a projected `Position2D`.
    ///
    /// Latitude is clamped to ±85.05112878° (the mercator asymptote) rather
    /// than producing infinity for out-of-range input.
    pub fn project(lat: f64, lon: f64) -> Position2D {
        const LAT_LIMIT: f64 = 85.051_128_78;
        let lat = lat.clamp(-LAT_LIMIT, LAT_LIMIT);
        let x = EARTH_RADIUS_M * lon.to_radians();
        let y = EARTH_RADIUS_M * ((std::f64::consts::FRAC_PI_4) + lat.to_radians() / 2.0).tan().ln();
        Position2D { x, y }
    }

    /// Inverse of [`project`](Self::project), recovering (latitude, longitude) in degrees.
    pub fn unproject(p: Position2D) -> (f64, f64) {
        let lon = (p.x / EARTH_RADIUS_M).to_degrees();
        let lat = (2.0 * (p.y / EARTH_RADIUS_M).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
        (lat, lon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_maps_to_zero() {
        let p = WebMercator::project(0.0, 0.0);
        assert!(p.x.abs() < 1e-6);
        assert!(p.y.abs() < 1e-6);
    }

    #[test]
    fn roundtrip_within_tolerance() {
        let (lat, lon) = (-40.0, 30.0);
        let p = WebMercator::project(lat, lon);
        let (lat2, lon2) = WebMercator::unproject(p);
        assert!((lat - lat2).abs() < 1e-6, "lat roundtrip: {lat} vs {lat2}");
        assert!((lon - lon2).abs() < 1e-6, "lon roundtrip: {lon} vs {lon2}");
    }

    #[test]
    fn latitude_is_clamped() {
        let p = WebMercator::project(89.9, 0.0);
        let (lat, _) = WebMercator::unproject(p);
        assert!(lat < 85.1 && lat > 85.0);
    }
}
