/// GPS coordinates and radius checks
use serde::{Deserialize, Serialize};

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Build a point from raw values, rejecting out-of-range or non-finite input
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        valid.then_some(Self { latitude, longitude })
    }

    /// Parse a pair of header values; both or neither must be present
    pub fn parse_pair(latitude: Option<&str>, longitude: Option<&str>) -> Result<Option<Self>, ()> {
        match (latitude, longitude) {
            (None, None) => Ok(None),
            (Some(lat), Some(lon)) => {
                let lat: f64 = lat.trim().parse().map_err(|_| ())?;
                let lon: f64 = lon.trim().parse().map_err(|_| ())?;
                Self::new(lat, lon).map(Some).ok_or(())
            }
            _ => Err(()),
        }
    }

    /// Great-circle distance in meters (haversine)
    pub fn distance_to(&self, other: &GpsPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_METERS * a.sqrt().asin()
    }

    pub fn within(&self, center: &GpsPoint, radius_meters: f64) -> bool {
        self.distance_to(center) <= radius_meters
    }
}
