//! Uniform grid spatial index keyed by entity bounds.

use std::collections::HashMap;

use crate::types::{Location, Rectangle};

/// Entries spanning more cells than this go to the overflow list.
const MAX_CELLS_PER_ENTRY: i64 = 64;

/// Grid index over row bounds.
///
/// Rows without bounds are never returned. Queries return ascending row
/// indices whose bounds intersect the query rectangle.
#[derive(Debug, Clone, Default)]
pub struct GridIndex {
    cell_size: i64,
    bounds: Vec<Option<Rectangle>>,
    cells: HashMap<(i64, i64), Vec<u32>>,
    overflow: Vec<u32>,
}

impl GridIndex {
    /// Build an index; `cell_size` is in dm7 units.
    pub fn build(bounds: Vec<Option<Rectangle>>, cell_size: i64) -> Self {
        let cell_size = cell_size.max(1);
        let mut cells: HashMap<(i64, i64), Vec<u32>> = HashMap::new();
        let mut overflow = Vec::new();
        for (row, rectangle) in bounds.iter().enumerate() {
            let Some(rectangle) = rectangle else { continue };
            let (lat_range, lon_range) = cell_span(rectangle, cell_size);
            let span = (lat_range.1 - lat_range.0 + 1) * (lon_range.1 - lon_range.0 + 1);
            if span > MAX_CELLS_PER_ENTRY {
                overflow.push(row as u32);
                continue;
            }
            for lat in lat_range.0..=lat_range.1 {
                for lon in lon_range.0..=lon_range.1 {
                    cells.entry((lat, lon)).or_default().push(row as u32);
                }
            }
        }
        Self {
            cell_size,
            bounds,
            cells,
            overflow,
        }
    }

    /// Rows whose bounds intersect `query`, ascending.
    pub fn query(&self, query: &Rectangle) -> Vec<u32> {
        let (lat_range, lon_range) = cell_span(query, self.cell_size);
        let span = (lat_range.1 - lat_range.0 + 1).saturating_mul(lon_range.1 - lon_range.0 + 1);
        let mut rows: Vec<u32> = if span as usize > self.cells.len() {
            // Visiting every populated cell is cheaper than walking the query span.
            (0..self.bounds.len() as u32).collect()
        } else {
            let mut rows = self.overflow.clone();
            for lat in lat_range.0..=lat_range.1 {
                for lon in lon_range.0..=lon_range.1 {
                    if let Some(cell) = self.cells.get(&(lat, lon)) {
                        rows.extend_from_slice(cell);
                    }
                }
            }
            rows.sort_unstable();
            rows.dedup();
            rows
        };
        rows.retain(|&row| {
            self.bounds[row as usize]
                .map(|b| b.intersects(query))
                .unwrap_or(false)
        });
        rows
    }

    /// Number of indexed rows.
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    /// Whether the index has no rows.
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }
}

fn cell_of(location: Location, cell_size: i64) -> (i64, i64) {
    (
        (location.latitude_dm7() as i64).div_euclid(cell_size),
        (location.longitude_dm7() as i64).div_euclid(cell_size),
    )
}

fn cell_span(rectangle: &Rectangle, cell_size: i64) -> ((i64, i64), (i64, i64)) {
    let low = cell_of(rectangle.lower_left(), cell_size);
    let high = cell_of(rectangle.upper_right(), cell_size);
    ((low.0, high.0), (low.1, high.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(lat: i32, lon: i32, size: i32) -> Option<Rectangle> {
        Some(Rectangle::new(
            Location::from_dm7(lat, lon),
            Location::from_dm7(lat + size, lon + size),
        ))
    }

    #[test]
    fn test_query_matches_linear_scan() {
        let bounds: Vec<_> = (0..50)
            .map(|i| if i % 7 == 0 { None } else { square(i * 1_000, -i * 1_500, 2_000) })
            .collect();
        let index = GridIndex::build(bounds.clone(), 5_000);
        let query = Rectangle::new(Location::from_dm7(10_000, -40_000), Location::from_dm7(25_000, -10_000));

        let expected: Vec<u32> = bounds
            .iter()
            .enumerate()
            .filter(|(_, b)| b.map(|b| b.intersects(&query)).unwrap_or(false))
            .map(|(i, _)| i as u32)
            .collect();
        assert_eq!(index.query(&query), expected);
        assert!(!expected.is_empty());
    }

    #[test]
    fn test_oversized_entries_are_found() {
        let index = GridIndex::build(vec![square(0, 0, 1_000_000), square(10, 10, 1)], 100);
        let query = Rectangle::new(Location::from_dm7(500_000, 500_000), Location::from_dm7(500_001, 500_001));
        assert_eq!(index.query(&query), vec![0]);
    }

    #[test]
    fn test_world_query_returns_everything_located() {
        let index = GridIndex::build(vec![square(0, 0, 1), None, square(-900, 900, 1)], 100);
        assert_eq!(index.query(&Rectangle::world()), vec![0, 2]);
    }
}
