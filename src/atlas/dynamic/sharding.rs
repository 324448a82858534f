//! Sharding schemes: how the world is cut into independently loadable pieces.

use std::f64::consts::PI;
use std::fmt;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::types::{Location, Rectangle};

/// Web-mercator latitude limit, in degrees.
const MAX_MERCATOR_LATITUDE: f64 = 85.051_128_779_806_59;

/// Highest supported tile zoom.
pub const MAX_ZOOM: u8 = 30;

/// A named, bounded piece of the world.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Shard {
    name: String,
    bounds: Rectangle,
}

impl Shard {
    /// Create a shard.
    pub fn new(name: impl Into<String>, bounds: Rectangle) -> Self {
        Self {
            name: name.into(),
            bounds,
        }
    }

    /// Unique name of the shard within its scheme.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Area covered by the shard.
    pub fn bounds(&self) -> Rectangle {
        self.bounds
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Cuts the world into shards.
pub trait Sharding: Send + Sync {
    /// Shards overlapping `bounds`, sorted by name.
    fn shards_covering(&self, bounds: &Rectangle) -> Vec<Shard>;

    /// Shards adjacent to `shard`.
    fn neighbors(&self, shard: &Shard) -> Vec<Shard>;

    /// Resolve a shard by name.
    fn shard(&self, name: &str) -> Option<Shard>;
}

/// One z/x/y web-mercator tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlippyTile {
    /// Zoom level.
    pub zoom: u8,
    /// Column, west to east.
    pub x: u32,
    /// Row, north to south.
    pub y: u32,
}

fn tile_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d{1,2})-(\d{1,10})-(\d{1,10})$").unwrap())
}

impl SlippyTile {
    /// Tile at `zoom` when the coordinates are in range.
    pub fn new(zoom: u8, x: u32, y: u32) -> Option<Self> {
        if zoom > MAX_ZOOM {
            return None;
        }
        let n = 1u64 << zoom;
        ((x as u64) < n && (y as u64) < n).then_some(Self { zoom, x, y })
    }

    /// Tile containing `location`.
    pub fn containing(location: &Location, zoom: u8) -> Self {
        let zoom = zoom.min(MAX_ZOOM);
        let n = (1u64 << zoom) as f64;
        let latitude = location.latitude().clamp(-MAX_MERCATOR_LATITUDE, MAX_MERCATOR_LATITUDE).to_radians();
        let x = ((location.longitude() + 180.0) / 360.0 * n).floor();
        let y = ((1.0 - (latitude.tan() + 1.0 / latitude.cos()).ln() / PI) / 2.0 * n).floor();
        let max = n - 1.0;
        Self {
            zoom,
            x: x.clamp(0.0, max) as u32,
            y: y.clamp(0.0, max) as u32,
        }
    }

    /// Parse a `"z-x-y"` name.
    pub fn parse(name: &str) -> Option<Self> {
        let captures = tile_name_pattern().captures(name)?;
        let zoom = captures.get(1)?.as_str().parse().ok()?;
        let x = captures.get(2)?.as_str().parse().ok()?;
        let y = captures.get(3)?.as_str().parse().ok()?;
        Self::new(zoom, x, y)
    }

    /// Name in `"z-x-y"` form.
    pub fn name(&self) -> String {
        format!("{}-{}-{}", self.zoom, self.x, self.y)
    }

    /// Area covered by the tile.
    pub fn bounds(&self) -> Rectangle {
        let n = (1u64 << self.zoom) as f64;
        let longitude = |x: f64| x / n * 360.0 - 180.0;
        let latitude = |y: f64| (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
        Rectangle::new(
            Location::from_degrees(latitude(self.y as f64 + 1.0), longitude(self.x as f64)),
            Location::from_degrees(latitude(self.y as f64), longitude(self.x as f64 + 1.0)),
        )
    }

    /// The tile as a shard.
    pub fn to_shard(&self) -> Shard {
        Shard::new(self.name(), self.bounds())
    }

    /// The up to eight tiles around this one. Columns wrap at the antimeridian.
    pub fn neighbors(&self) -> Vec<SlippyTile> {
        let n = 1i64 << self.zoom;
        let mut tiles = Vec::with_capacity(8);
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let y = self.y as i64 + dy;
                if y < 0 || y >= n {
                    continue;
                }
                let x = (self.x as i64 + dx).rem_euclid(n);
                let tile = Self {
                    zoom: self.zoom,
                    x: x as u32,
                    y: y as u32,
                };
                if tile != *self && !tiles.contains(&tile) {
                    tiles.push(tile);
                }
            }
        }
        tiles.sort();
        tiles
    }
}

/// Fixed-zoom slippy tile sharding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlippyTileSharding {
    zoom: u8,
}

impl SlippyTileSharding {
    /// Sharding at `zoom` (capped at [`MAX_ZOOM`]).
    pub fn new(zoom: u8) -> Self {
        Self {
            zoom: zoom.min(MAX_ZOOM),
        }
    }

    /// Zoom level of every shard.
    pub fn zoom(&self) -> u8 {
        self.zoom
    }
}

impl Sharding for SlippyTileSharding {
    fn shards_covering(&self, bounds: &Rectangle) -> Vec<Shard> {
        let north_west = SlippyTile::containing(
            &Location::from_dm7(bounds.upper_right().latitude_dm7(), bounds.lower_left().longitude_dm7()),
            self.zoom,
        );
        let south_east = SlippyTile::containing(
            &Location::from_dm7(bounds.lower_left().latitude_dm7(), bounds.upper_right().longitude_dm7()),
            self.zoom,
        );
        let mut shards = Vec::new();
        for x in north_west.x..=south_east.x {
            for y in north_west.y..=south_east.y {
                let tile = SlippyTile { zoom: self.zoom, x, y };
                let shard = tile.to_shard();
                // Tile edges are rounded to dm7, so keep only true overlaps.
                if shard.bounds().intersects(bounds) {
                    shards.push(shard);
                }
            }
        }
        shards.sort();
        shards
    }

    fn neighbors(&self, shard: &Shard) -> Vec<Shard> {
        SlippyTile::parse(shard.name())
            .filter(|tile| tile.zoom == self.zoom)
            .map(|tile| tile.neighbors().iter().map(SlippyTile::to_shard).collect())
            .unwrap_or_default()
    }

    fn shard(&self, name: &str) -> Option<Shard> {
        SlippyTile::parse(name)
            .filter(|tile| tile.zoom == self.zoom)
            .map(|tile| tile.to_shard())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_containing_tile() {
        // Augsburg area at zoom 9.
        let tile = SlippyTile::containing(&Location::from_degrees(48.3406719, 10.5563445), 9);
        assert_eq!(tile.name(), "9-271-177");
        assert!(tile.bounds().contains(&Location::from_degrees(48.3406719, 10.5563445)));
    }

    #[test]
    fn test_parse_name() {
        assert_eq!(SlippyTile::parse("9-271-177"), SlippyTile::new(9, 271, 177));
        assert!(SlippyTile::parse("9-512-0").is_none());
        assert!(SlippyTile::parse("nine-1-1").is_none());
        assert!(SlippyTile::parse("9-1-1-1").is_none());
    }

    #[test]
    fn test_covering_spans_tiles() {
        let sharding = SlippyTileSharding::new(1);
        let everything = sharding.shards_covering(&Rectangle::world());
        let names: Vec<_> = everything.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["1-0-0", "1-0-1", "1-1-0", "1-1-1"]);

        let point = Location::from_degrees(10.0, 10.0);
        let one = sharding.shards_covering(&point.bounds());
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].name(), "1-1-0");
    }

    #[test]
    fn test_neighbors_wrap() {
        let tile = SlippyTile::new(2, 0, 0).unwrap();
        let names: Vec<_> = tile.neighbors().iter().map(SlippyTile::name).collect();
        assert_eq!(names, vec!["2-0-1", "2-1-0", "2-1-1", "2-3-0", "2-3-1"]);
    }
}
