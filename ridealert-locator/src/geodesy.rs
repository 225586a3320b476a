//! Coordinate conversion and derived features
//!
//! [`CoordinateTransform`] is the seam to whatever geodesy library a
//! deployment prefers; [`Wgs84`] is the built-in closed-form implementation
//! (EPSG:4326 ↔ EPSG:4978).

/// Earth-centred, earth-fixed position in meters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ecef {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Geodetic position: degrees, and meters above the ellipsoid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geodetic {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

pub trait CoordinateTransform: Send + Sync {
    fn to_ecef(&self, position: Geodetic) -> Ecef;
    fn to_geodetic(&self, position: Ecef) -> Geodetic;
}

/// WGS-84 ellipsoid
#[derive(Debug, Clone, Copy, Default)]
pub struct Wgs84;

impl Wgs84 {
    const A: f64 = 6_378_137.0;
    const F: f64 = 1.0 / 298.257_223_563;

    fn e2() -> f64 {
        Self::F * (2.0 - Self::F)
    }

    fn prime_vertical_radius(sin_lat: f64) -> f64 {
        Self::A / (1.0 - Self::e2() * sin_lat * sin_lat).sqrt()
    }
}

impl CoordinateTransform for Wgs84 {
    fn to_ecef(&self, p: Geodetic) -> Ecef {
        let (sin_lat, cos_lat) = p.latitude.to_radians().sin_cos();
        let (sin_lon, cos_lon) = p.longitude.to_radians().sin_cos();
        let n = Self::prime_vertical_radius(sin_lat);

        Ecef {
            x: (n + p.altitude) * cos_lat * cos_lon,
            y: (n + p.altitude) * cos_lat * sin_lon,
            z: (n * (1.0 - Self::e2()) + p.altitude) * sin_lat,
        }
    }

    fn to_geodetic(&self, p: Ecef) -> Geodetic {
        let e2 = Self::e2();
        let b = Self::A * (1.0 - Self::F);
        let ep2 = (Self::A * Self::A - b * b) / (b * b);
        let r = p.x.hypot(p.y);
        let longitude = p.y.atan2(p.x);

        // Bowring's formula with one refinement step; sub-millimeter for
        // terrestrial positions
        let theta = (p.z * Self::A).atan2(r * b);
        let (sin_t, cos_t) = theta.sin_cos();
        let mut latitude = (p.z + ep2 * b * sin_t.powi(3)).atan2(r - e2 * Self::A * cos_t.powi(3));

        let mut altitude = 0.0;
        for _ in 0..2 {
            let (sin_lat, cos_lat) = latitude.sin_cos();
            let n = Self::prime_vertical_radius(sin_lat);
            altitude = if cos_lat.abs() > 1e-10 {
                r / cos_lat - n
            } else {
                p.z.abs() - b
            };
            latitude = p.z.atan2(r * (1.0 - e2 * n / (n + altitude)));
        }

        Geodetic {
            latitude: latitude.to_degrees(),
            longitude: longitude.to_degrees(),
            altitude,
        }
    }
}

/// Carrier-to-noise density weighted by satellite elevation
pub fn signal_quality(cn0_db_hz: f64, elevation_degrees: f64) -> f64 {
    cn0_db_hz * elevation_degrees.to_radians().sin()
}

/// Distance of an ECEF position from the Earth's centre
pub fn ecef_distance(p: Ecef) -> f64 {
    (p.x * p.x + p.y * p.y + p.z * p.z).sqrt()
}
