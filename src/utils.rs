// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Great-circle distance in meters between two WGS84 coordinates
/// (Haversine formula).
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Last four decimal digits of a device id, the form used in user-facing
/// contexts when `use_short_devid` is set.
pub fn short_device_id(device_id: u32) -> String {
    format!("{:04}", device_id % 10_000)
}

/// Render a device id according to the short-id preference.
pub fn render_device_id(device_id: u32, short: bool) -> String {
    if short {
        short_device_id(device_id)
    } else {
        device_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_distance() {
        // Two points ~28 m apart in central Stockholm.
        let d = haversine_m(59.326100, 18.074100, 59.326300, 18.074300);
        assert!((d - 25.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn haversine_zero() {
        assert_eq!(haversine_m(59.0, 18.0, 59.0, 18.0), 0.0);
    }

    #[test]
    fn short_id_pads() {
        assert_eq!(short_device_id(3_000_000_001), "0001");
        assert_eq!(short_device_id(3_000_012_345), "2345");
    }
}
