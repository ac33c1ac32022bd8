//! Geometry primitives shared by the base graph and the sharding engine.
//!
//! Locations are stored as fixed-point latitude/longitude (1e-7 degree units)
//! so that equality and hashing are exact, which boundary stitching relies on.
//! Rectangles are plain `geo::Rect<f64>` values with `x = longitude` and
//! `y = latitude`.

use geo::{coord, Distance, Haversine, Point, Rect};
use rstar::AABB;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-point scale: one unit is 1e-7 degree (about 1 cm at the equator).
pub const COORDINATE_SCALE: f64 = 10_000_000.0;

/// Mean Earth radius used by `geo::Haversine`, in meters.
const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Meters per degree of latitude on the haversine sphere.
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;

/// Padding added to distance-derived rectangles so that points exactly at
/// the requested distance are not lost to fixed-point rounding.
const ENVELOPE_PADDING_DEGREES: f64 = 2.0 / COORDINATE_SCALE;

/// A geographic location with exact equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    latitude_e7: i32,
    longitude_e7: i32,
}

impl Location {
    /// Create a location from degrees, rounding to the fixed-point grid.
    pub fn from_degrees(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude_e7: (latitude * COORDINATE_SCALE).round() as i32,
            longitude_e7: (longitude * COORDINATE_SCALE).round() as i32,
        }
    }

    /// Create a location from raw fixed-point values.
    pub const fn from_e7(latitude_e7: i32, longitude_e7: i32) -> Self {
        Self {
            latitude_e7,
            longitude_e7,
        }
    }

    pub fn latitude(&self) -> f64 {
        self.latitude_e7 as f64 / COORDINATE_SCALE
    }

    pub fn longitude(&self) -> f64 {
        self.longitude_e7 as f64 / COORDINATE_SCALE
    }

    pub fn latitude_e7(&self) -> i32 {
        self.latitude_e7
    }

    pub fn longitude_e7(&self) -> i32 {
        self.longitude_e7
    }

    /// The location as a `geo` point (`x` = longitude, `y` = latitude).
    pub fn as_point(&self) -> Point<f64> {
        Point::new(self.longitude(), self.latitude())
    }

    /// Coordinates in `[longitude, latitude]` order for spatial indexes.
    pub fn as_array(&self) -> [f64; 2] {
        [self.longitude(), self.latitude()]
    }

    /// Great-circle distance in meters.
    pub fn distance_to(&self, other: &Location) -> f64 {
        Haversine.distance(self.as_point(), other.as_point())
    }

    /// Smallest rectangle containing every location within `meters`.
    pub fn within(&self, meters: f64) -> Rect<f64> {
        let (dlat, dlon) = degrees_for_meters(meters, self.latitude());
        Rect::new(
            coord! { x: self.longitude() - dlon, y: self.latitude() - dlat },
            coord! { x: self.longitude() + dlon, y: self.latitude() + dlat },
        )
    }
}

impl From<Point<f64>> for Location {
    fn from(point: Point<f64>) -> Self {
        Location::from_degrees(point.y(), point.x())
    }
}

impl From<Location> for Point<f64> {
    fn from(location: Location) -> Self {
        location.as_point()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.7}, {:.7})", self.latitude(), self.longitude())
    }
}

/// Convert a distance into (latitude, longitude) degree offsets at `latitude`.
fn degrees_for_meters(meters: f64, latitude: f64) -> (f64, f64) {
    let meters = meters.max(0.0);
    let dlat = meters / METERS_PER_DEGREE + ENVELOPE_PADDING_DEGREES;
    let cos_lat = latitude.to_radians().cos().abs().max(1e-6);
    let dlon = meters / (METERS_PER_DEGREE * cos_lat) + ENVELOPE_PADDING_DEGREES;
    (dlat, dlon.min(360.0))
}

/// Serializable bounds record (`geo::Rect` has no stable wire form of its own).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundsRecord {
    pub min_latitude: f64,
    pub min_longitude: f64,
    pub max_latitude: f64,
    pub max_longitude: f64,
}

impl From<Rect<f64>> for BoundsRecord {
    fn from(rect: Rect<f64>) -> Self {
        Self {
            min_latitude: rect.min().y,
            min_longitude: rect.min().x,
            max_latitude: rect.max().y,
            max_longitude: rect.max().x,
        }
    }
}

impl From<BoundsRecord> for Rect<f64> {
    fn from(record: BoundsRecord) -> Self {
        Rect::new(
            coord! { x: record.min_longitude, y: record.min_latitude },
            coord! { x: record.max_longitude, y: record.max_latitude },
        )
    }
}

/// Rectangle helpers used throughout the crate.
pub trait RectExt {
    /// Closed containment test for a location.
    fn contains_location(&self, location: &Location) -> bool;

    /// Rectangle grown by `meters` on every side.
    fn expanded_by_meters(&self, meters: f64) -> Rect<f64>;

    /// Envelope for `rstar` queries.
    fn envelope(&self) -> AABB<[f64; 2]>;

    /// Area of the overlap with `other` in square degrees (0 when disjoint
    /// or touching only along an edge).
    fn overlap_area(&self, other: &Rect<f64>) -> f64;
}

impl RectExt for Rect<f64> {
    fn contains_location(&self, location: &Location) -> bool {
        let (x, y) = (location.longitude(), location.latitude());
        x >= self.min().x && x <= self.max().x && y >= self.min().y && y <= self.max().y
    }

    fn expanded_by_meters(&self, meters: f64) -> Rect<f64> {
        let widest = self.min().y.abs().max(self.max().y.abs());
        let (dlat, dlon) = degrees_for_meters(meters, widest);
        Rect::new(
            coord! { x: self.min().x - dlon, y: self.min().y - dlat },
            coord! { x: self.max().x + dlon, y: self.max().y + dlat },
        )
    }

    fn envelope(&self) -> AABB<[f64; 2]> {
        AABB::from_corners([self.min().x, self.min().y], [self.max().x, self.max().y])
    }

    fn overlap_area(&self, other: &Rect<f64>) -> f64 {
        let width = self.max().x.min(other.max().x) - self.min().x.max(other.min().x);
        let height = self.max().y.min(other.max().y) - self.min().y.max(other.min().y);
        if width <= 0.0 || height <= 0.0 {
            0.0
        } else {
            width * height
        }
    }
}

/// Bounding rectangle of a set of locations, `None` when empty.
pub fn bounding_rect<'a>(locations: impl IntoIterator<Item = &'a Location>) -> Option<Rect<f64>> {
    let mut iter = locations.into_iter();
    let first = iter.next()?;
    let (mut min_x, mut min_y) = (first.longitude(), first.latitude());
    let (mut max_x, mut max_y) = (min_x, min_y);
    for location in iter {
        min_x = min_x.min(location.longitude());
        min_y = min_y.min(location.latitude());
        max_x = max_x.max(location.longitude());
        max_y = max_y.max(location.latitude());
    }
    Some(Rect::new(
        coord! { x: min_x, y: min_y },
        coord! { x: max_x, y: max_y },
    ))
}

/// Rectangle from corner locations.
pub fn rect_from_locations(a: Location, b: Location) -> Rect<f64> {
    Rect::new(
        coord! { x: a.longitude(), y: a.latitude() },
        coord! { x: b.longitude(), y: b.latitude() },
    )
}
