//! Geometry primitives: locations, rectangles, poly-lines and polygons.
//!
//! Coordinates are fixed-point degrees scaled by 10^7 ("dm7"), which keeps
//! locations `Copy`, `Eq` and `Ord` and makes equality checks exact.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-point scale between degrees and stored units.
pub const DM7_PER_DEGREE: f64 = 10_000_000.0;

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

const MAX_LATITUDE_DM7: i64 = 900_000_000;
const MAX_LONGITUDE_DM7: i64 = 1_800_000_000;

/// A latitude/longitude pair in dm7 units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    latitude: i32,
    longitude: i32,
}

impl Location {
    /// Create a location from raw dm7 values.
    pub fn from_dm7(latitude: i32, longitude: i32) -> Self {
        Self { latitude, longitude }
    }

    /// Create a location from decimal degrees, rounding to the nearest dm7.
    pub fn from_degrees(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude: (latitude * DM7_PER_DEGREE).round() as i32,
            longitude: (longitude * DM7_PER_DEGREE).round() as i32,
        }
    }

    /// Parse `"lat,lon"` in decimal degrees.
    pub fn parse(s: &str) -> Option<Self> {
        let (lat, lon) = s.split_once(',')?;
        let latitude = parse_dm7(lat.trim(), MAX_LATITUDE_DM7)?;
        let longitude = parse_dm7(lon.trim(), MAX_LONGITUDE_DM7)?;
        Some(Self { latitude, longitude })
    }

    /// Latitude in dm7.
    pub fn latitude_dm7(&self) -> i32 {
        self.latitude
    }

    /// Longitude in dm7.
    pub fn longitude_dm7(&self) -> i32 {
        self.longitude
    }

    /// Latitude in degrees.
    pub fn latitude(&self) -> f64 {
        self.latitude as f64 / DM7_PER_DEGREE
    }

    /// Longitude in degrees.
    pub fn longitude(&self) -> f64 {
        self.longitude as f64 / DM7_PER_DEGREE
    }

    /// Great-circle (haversine) distance in meters.
    pub fn distance_to(&self, other: &Location) -> f64 {
        let lat1 = self.latitude().to_radians();
        let lat2 = other.latitude().to_radians();
        let dlat = lat2 - lat1;
        let dlon = (other.longitude() - self.longitude()).to_radians();
        let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
    }

    /// Degenerate rectangle around this location.
    pub fn bounds(&self) -> Rectangle {
        Rectangle {
            lower_left: *self,
            upper_right: *self,
        }
    }
}

fn parse_dm7(s: &str, limit: i64) -> Option<i32> {
    let degrees: f64 = s.parse().ok()?;
    if !degrees.is_finite() {
        return None;
    }
    let value = (degrees * DM7_PER_DEGREE).round() as i64;
    if value.abs() > limit {
        return None;
    }
    Some(value as i32)
}

fn write_dm7(f: &mut fmt::Formatter<'_>, value: i32) -> fmt::Result {
    let magnitude = (value as i64).abs();
    let sign = if value < 0 { "-" } else { "" };
    write!(f, "{}{}.{:07}", sign, magnitude / 10_000_000, magnitude % 10_000_000)
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_dm7(f, self.latitude)?;
        f.write_str(",")?;
        write_dm7(f, self.longitude)
    }
}

/// Axis-aligned bounding box; edges are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rectangle {
    lower_left: Location,
    upper_right: Location,
}

impl Rectangle {
    /// Create a rectangle from any two opposite corners.
    pub fn new(a: Location, b: Location) -> Self {
        Self {
            lower_left: Location::from_dm7(a.latitude.min(b.latitude), a.longitude.min(b.longitude)),
            upper_right: Location::from_dm7(a.latitude.max(b.latitude), a.longitude.max(b.longitude)),
        }
    }

    /// The whole coordinate space.
    pub fn world() -> Self {
        Self {
            lower_left: Location::from_dm7(-(MAX_LATITUDE_DM7 as i32), -(MAX_LONGITUDE_DM7 as i32)),
            upper_right: Location::from_dm7(MAX_LATITUDE_DM7 as i32, MAX_LONGITUDE_DM7 as i32),
        }
    }

    /// Smallest rectangle covering all locations, `None` when empty.
    pub fn from_locations<'a>(locations: impl IntoIterator<Item = &'a Location>) -> Option<Self> {
        let mut iter = locations.into_iter();
        let first = *iter.next()?;
        Some(iter.fold(first.bounds(), |acc, loc| acc.combine(&loc.bounds())))
    }

    /// Lower-left corner.
    pub fn lower_left(&self) -> Location {
        self.lower_left
    }

    /// Upper-right corner.
    pub fn upper_right(&self) -> Location {
        self.upper_right
    }

    /// Smallest rectangle covering both.
    pub fn combine(&self, other: &Rectangle) -> Rectangle {
        Rectangle {
            lower_left: Location::from_dm7(
                self.lower_left.latitude.min(other.lower_left.latitude),
                self.lower_left.longitude.min(other.lower_left.longitude),
            ),
            upper_right: Location::from_dm7(
                self.upper_right.latitude.max(other.upper_right.latitude),
                self.upper_right.longitude.max(other.upper_right.longitude),
            ),
        }
    }

    /// Whether the two rectangles share at least one point.
    pub fn intersects(&self, other: &Rectangle) -> bool {
        self.lower_left.latitude <= other.upper_right.latitude
            && self.upper_right.latitude >= other.lower_left.latitude
            && self.lower_left.longitude <= other.upper_right.longitude
            && self.upper_right.longitude >= other.lower_left.longitude
    }

    /// Whether the location lies inside or on the border.
    pub fn contains(&self, location: &Location) -> bool {
        location.latitude >= self.lower_left.latitude
            && location.latitude <= self.upper_right.latitude
            && location.longitude >= self.lower_left.longitude
            && location.longitude <= self.upper_right.longitude
    }

    /// Whether `other` lies entirely inside this rectangle.
    pub fn contains_rectangle(&self, other: &Rectangle) -> bool {
        self.contains(&other.lower_left) && self.contains(&other.upper_right)
    }

    /// Grow the rectangle by `margin` dm7 units on every side.
    pub fn expand_dm7(&self, margin: i32) -> Rectangle {
        Rectangle {
            lower_left: Location::from_dm7(
                self.lower_left.latitude.saturating_sub(margin),
                self.lower_left.longitude.saturating_sub(margin),
            ),
            upper_right: Location::from_dm7(
                self.upper_right.latitude.saturating_add(margin),
                self.upper_right.longitude.saturating_add(margin),
            ),
        }
    }

    /// Corners, counter-clockwise from lower-left.
    pub fn corners(&self) -> [Location; 4] {
        [
            self.lower_left,
            Location::from_dm7(self.lower_left.latitude, self.upper_right.longitude),
            self.upper_right,
            Location::from_dm7(self.upper_right.latitude, self.lower_left.longitude),
        ]
    }

    /// The rectangle as a four-corner polygon.
    pub fn to_polygon(&self) -> Polygon {
        Polygon::new(self.corners().to_vec())
    }
}

/// Ordered, open sequence of locations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolyLine(Vec<Location>);

impl PolyLine {
    /// Create a poly-line.
    pub fn new(locations: Vec<Location>) -> Self {
        Self(locations)
    }

    /// Shape points.
    pub fn locations(&self) -> &[Location] {
        &self.0
    }

    /// First shape point.
    pub fn first(&self) -> Option<Location> {
        self.0.first().copied()
    }

    /// Last shape point.
    pub fn last(&self) -> Option<Location> {
        self.0.last().copied()
    }

    /// Number of shape points.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the poly-line has no points.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bounding rectangle.
    pub fn bounds(&self) -> Option<Rectangle> {
        Rectangle::from_locations(&self.0)
    }

    /// Same points in the opposite direction.
    pub fn reversed(&self) -> PolyLine {
        PolyLine(self.0.iter().rev().copied().collect())
    }

    /// Sum of segment lengths in meters.
    pub fn length_meters(&self) -> f64 {
        self.0.windows(2).map(|w| w[0].distance_to(&w[1])).sum()
    }
}

impl From<Vec<Location>> for PolyLine {
    fn from(locations: Vec<Location>) -> Self {
        Self(locations)
    }
}

/// Closed ring of locations; the closing segment is implicit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Polygon(Vec<Location>);

impl Polygon {
    /// Create a polygon from its ring (without repeating the first point).
    pub fn new(locations: Vec<Location>) -> Self {
        Self(locations)
    }

    /// Ring points.
    pub fn locations(&self) -> &[Location] {
        &self.0
    }

    /// Number of ring points.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bounding rectangle.
    pub fn bounds(&self) -> Option<Rectangle> {
        Rectangle::from_locations(&self.0)
    }

    fn segments(&self) -> impl Iterator<Item = (Location, Location)> + '_ {
        let n = self.0.len();
        (0..n).map(move |i| (self.0[i], self.0[(i + 1) % n]))
    }

    /// Even-odd containment; ring vertices count as inside.
    pub fn contains(&self, location: &Location) -> bool {
        if self.0.len() < 3 {
            return self.0.contains(location);
        }
        if self.0.contains(location) {
            return true;
        }
        let (py, px) = (location.latitude as f64, location.longitude as f64);
        let mut inside = false;
        for (a, b) in self.segments() {
            let (ay, ax) = (a.latitude as f64, a.longitude as f64);
            let (by, bx) = (b.latitude as f64, b.longitude as f64);
            if (ay > py) != (by > py) {
                let x = ax + (py - ay) * (bx - ax) / (by - ay);
                if px < x {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Whether the polygon and the rectangle overlap.
    pub fn intersects_rectangle(&self, rectangle: &Rectangle) -> bool {
        match self.bounds() {
            Some(bounds) if bounds.intersects(rectangle) => {}
            _ => return false,
        }
        if self.0.iter().any(|loc| rectangle.contains(loc)) {
            return true;
        }
        let corners = rectangle.corners();
        if corners.iter().any(|corner| self.contains(corner)) {
            return true;
        }
        self.segments().any(|(a, b)| {
            (0..4).any(|i| segments_intersect(a, b, corners[i], corners[(i + 1) % 4]))
        })
    }
}

impl From<Vec<Location>> for Polygon {
    fn from(locations: Vec<Location>) -> Self {
        Self(locations)
    }
}

fn orientation(a: Location, b: Location, c: Location) -> i128 {
    let abx = b.longitude as i128 - a.longitude as i128;
    let aby = b.latitude as i128 - a.latitude as i128;
    let acx = c.longitude as i128 - a.longitude as i128;
    let acy = c.latitude as i128 - a.latitude as i128;
    abx * acy - aby * acx
}

fn on_segment(a: Location, b: Location, p: Location) -> bool {
    Rectangle::new(a, b).contains(&p)
}

/// Whether segments `p1-p2` and `q1-q2` share a point.
pub fn segments_intersect(p1: Location, p2: Location, q1: Location, q2: Location) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);
    if ((d1 > 0 && d2 < 0) || (d1 < 0 && d2 > 0)) && ((d3 > 0 && d4 < 0) || (d3 < 0 && d4 > 0)) {
        return true;
    }
    (d1 == 0 && on_segment(q1, q2, p1))
        || (d2 == 0 && on_segment(q1, q2, p2))
        || (d3 == 0 && on_segment(p1, p2, q1))
        || (d4 == 0 && on_segment(p1, p2, q2))
}
