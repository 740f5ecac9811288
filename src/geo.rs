//! Great-circle distances on a spherical Earth.
//!
//! Uses the haversine formula; all results are in kilometres.

use serde::Serialize;

use crate::config::LatLon;

pub const EARTH_RADIUS_KM: f64 = 6373.0;

/// Point the bin-size utility measures at when the caller gives none.
pub const DEFAULT_BIN_ORIGIN: LatLon = LatLon {
    lat: 52.0,
    lon: 21.0,
};

/// Haversine distance in kilometres between two points given in degrees.
pub fn distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_r = lat1.to_radians();
    let lat2_r = lat2.to_radians();
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Element-wise distances between two equal-length coordinate arrays.
pub fn distance_pairwise(lat1: &[f64], lon1: &[f64], lat2: &[f64], lon2: &[f64]) -> Vec<f64> {
    debug_assert!(
        lat1.len() == lon1.len() && lat1.len() == lat2.len() && lat1.len() == lon2.len(),
        "coordinate arrays must have equal length"
    );

    lat1.iter()
        .zip(lon1)
        .zip(lat2.iter().zip(lon2))
        .map(|((&a, &b), (&c, &d))| distance(a, b, c, d))
        .collect()
}

/// Distances from one fixed point to every point of a coordinate array.
pub fn distance_from(lat: f64, lon: f64, lats: &[f64], lons: &[f64]) -> Vec<f64> {
    debug_assert_eq!(lats.len(), lons.len(), "coordinate arrays must have equal length");

    lats.iter()
        .zip(lons)
        .map(|(&lat2, &lon2)| distance(lat, lon, lat2, lon2))
        .collect()
}

/// Rejects non-finite or out-of-range coordinates in degrees.
pub fn check_coordinates(lat: f64, lon: f64) -> std::result::Result<(), String> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(format!("latitude {lat} out of range"));
    }
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(format!("longitude {lon} out of range"));
    }
    Ok(())
}

/// Approximate physical footprint of one rounding bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BinSize {
    pub round_to: u32,
    pub height_km: f64,
    pub width_km: f64,
}

/// Height and width in kilometres of the rectangle spanned by `10^-round_to`
/// degrees of latitude and longitude at `origin`.
pub fn bin_size(round_to: u32, origin: LatLon) -> BinSize {
    let step = 10f64.powi(-(round_to as i32));

    BinSize {
        round_to,
        height_km: distance(origin.lat, origin.lon, origin.lat + step, origin.lon),
        width_km: distance(origin.lat, origin.lon, origin.lat, origin.lon + step),
    }
}
