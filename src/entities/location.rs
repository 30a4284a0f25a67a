use geo_types::{Geometry, Point};
use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lng)
    }

    /// Great-circle distance (haversine).
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();

        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);

        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

impl From<Coordinates> for Geometry<f64> {
    fn from(coordinates: Coordinates) -> Self {
        Point::new(coordinates.lng, coordinates.lat).into()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub coordinates: Coordinates,
    pub address: String,
}

impl Location {
    pub fn new(coordinates: Coordinates, address: String) -> Self {
        Self {
            coordinates,
            address,
        }
    }
}

#[test]
fn distance_between_identical_points_is_zero() {
    let point = Coordinates::new(24.86, 67.0);
    assert_eq!(point.distance_km(&point), 0.0);
}

#[test]
fn one_degree_of_latitude_is_about_111_km() {
    let a = Coordinates::new(0.0, 0.0);
    let b = Coordinates::new(1.0, 0.0);
    let distance = a.distance_km(&b);
    assert!((distance - 111.19).abs() < 0.1, "got {}", distance);
}

#[test]
fn rejects_out_of_range_coordinates() {
    assert!(Coordinates::new(45.0, 90.0).is_valid());
    assert!(!Coordinates::new(91.0, 0.0).is_valid());
    assert!(!Coordinates::new(0.0, 181.0).is_valid());
}
