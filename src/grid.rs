//! Occupancy grid: pixel coordinates to zones, and per-zone aggregation.
//!
//! The source frame is divided into `grid.width x grid.height` equal cells.
//! A detection belongs to the cell its (x, y) point falls in; points outside
//! the frame are clamped onto the border cells rather than rejected, since
//! sensors transiently report out-of-frame coordinates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::detection::Detection;

pub const DEFAULT_GRID_WIDTH: u32 = 6;
pub const DEFAULT_GRID_HEIGHT: u32 = 4;
pub const DEFAULT_FRAME_WIDTH: u32 = 640;
pub const DEFAULT_FRAME_HEIGHT: u32 = 480;

/// Logical grid dimensions, in zones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridShape {
    pub width: u32,
    pub height: u32,
}

impl GridShape {
    pub fn cell_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl Default for GridShape {
    fn default() -> Self {
        Self {
            width: DEFAULT_GRID_WIDTH,
            height: DEFAULT_GRID_HEIGHT,
        }
    }
}

/// Source video resolution the sensor reports coordinates in, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameResolution {
    pub width: u32,
    pub height: u32,
}

impl Default for FrameResolution {
    fn default() -> Self {
        Self {
            width: DEFAULT_FRAME_WIDTH,
            height: DEFAULT_FRAME_HEIGHT,
        }
    }
}

/// A cell of the occupancy grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Zone {
    pub col: u32,
    pub row: u32,
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.col, self.row)
    }
}

/// Map a pixel coordinate to its zone.
///
/// `floor(x / frame.width * grid.width)` clamped into `[0, grid.width - 1]`,
/// and the same for y. All dimensions must be non-zero.
pub fn map_to_zone(x: f64, y: f64, frame: FrameResolution, grid: GridShape) -> Zone {
    Zone {
        col: scale_axis(x, frame.width, grid.width),
        row: scale_axis(y, frame.height, grid.height),
    }
}

fn scale_axis(value: f64, frame_dim: u32, grid_dim: u32) -> u32 {
    let cell = (value / f64::from(frame_dim) * f64::from(grid_dim)).floor();
    let max = f64::from(grid_dim.saturating_sub(1));
    // NaN casts to 0.
    cell.clamp(0.0, max) as u32
}

/// Grid shape plus the configured frame resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GridMapper {
    pub grid: GridShape,
    pub frame: FrameResolution,
}

impl GridMapper {
    pub fn new(grid: GridShape, frame: FrameResolution) -> Self {
        Self { grid, frame }
    }

    pub fn zone_for(&self, detection: &Detection) -> Zone {
        map_to_zone(detection.x, detection.y, self.frame, self.grid)
    }
}

/// Zone to occupants, built from exactly one batch.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AggregationState {
    grid: GridShape,
    zones: BTreeMap<Zone, Vec<Detection>>,
}

impl AggregationState {
    /// Empty state for a grid.
    pub fn empty(grid: GridShape) -> Self {
        Self {
            grid,
            zones: BTreeMap::new(),
        }
    }

    /// Bucket every detection into its zone, keeping batch order per zone.
    pub fn rebuild(detections: &[Detection], mapper: &GridMapper) -> Self {
        let mut zones: BTreeMap<Zone, Vec<Detection>> = BTreeMap::new();
        for detection in detections {
            zones
                .entry(mapper.zone_for(detection))
                .or_default()
                .push(detection.clone());
        }
        Self {
            grid: mapper.grid,
            zones,
        }
    }

    pub fn grid(&self) -> GridShape {
        self.grid
    }

    /// Occupants of a zone; empty when nobody is there.
    pub fn occupants(&self, zone: Zone) -> &[Detection] {
        self.zones.get(&zone).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Non-empty zones in (col, row) order.
    pub fn iter(&self) -> impl Iterator<Item = (&Zone, &Vec<Detection>)> {
        self.zones.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn total_detections(&self) -> usize {
        self.zones.values().map(Vec::len).sum()
    }

    pub fn active_zones(&self) -> usize {
        self.zones.len()
    }

    /// Mean occupants per cell over the whole grid.
    pub fn density(&self) -> f64 {
        let cells = self.grid.cell_count();
        if cells == 0 {
            return 0.0;
        }
        self.total_detections() as f64 / cells as f64
    }

    /// Occupant counts indexed `[row][col]`.
    pub fn occupancy_matrix(&self) -> Vec<Vec<usize>> {
        let mut matrix = vec![vec![0usize; self.grid.width as usize]; self.grid.height as usize];
        for (zone, occupants) in &self.zones {
            if let Some(cell) = matrix
                .get_mut(zone.row as usize)
                .and_then(|row| row.get_mut(zone.col as usize))
            {
                *cell = occupants.len();
            }
        }
        matrix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> GridMapper {
        GridMapper::default()
    }

    #[test]
    fn maps_sample_point() {
        let zone = map_to_zone(500.0, 150.0, FrameResolution::default(), GridShape::default());
        assert_eq!(zone, Zone { col: 4, row: 1 });
    }

    #[test]
    fn frame_edge_maps_to_last_zone() {
        let zone = map_to_zone(640.0, 480.0, FrameResolution::default(), GridShape::default());
        assert_eq!(zone, Zone { col: 5, row: 3 });
    }

    #[test]
    fn cell_boundary_floors() {
        // 480 / 4 = 120 is an exact row boundary.
        let zone = map_to_zone(0.0, 120.0, FrameResolution::default(), GridShape::default());
        assert_eq!(zone, Zone { col: 0, row: 1 });
        let zone = map_to_zone(0.0, 119.999, FrameResolution::default(), GridShape::default());
        assert_eq!(zone.row, 0);
    }

    #[test]
    fn out_of_frame_is_clamped() {
        let frame = FrameResolution::default();
        let grid = GridShape::default();
        assert_eq!(map_to_zone(-50.0, -1.0, frame, grid), Zone { col: 0, row: 0 });
        assert_eq!(map_to_zone(9000.0, 9000.0, frame, grid), Zone { col: 5, row: 3 });
    }

    #[test]
    fn every_in_frame_point_lands_in_grid() {
        let frame = FrameResolution {
            width: 1920,
            height: 1080,
        };
        let grid = GridShape {
            width: 7,
            height: 5,
        };
        for x in (0..=1920).step_by(37) {
            for y in (0..=1080).step_by(29) {
                let zone = map_to_zone(f64::from(x), f64::from(y), frame, grid);
                assert!(zone.col < grid.width, "col out of range for x={x}");
                assert!(zone.row < grid.height, "row out of range for y={y}");
            }
        }
    }

    #[test]
    fn rebuild_buckets_in_batch_order() {
        let detections = vec![
            Detection::new("a", 10.0, 10.0, 0.9),
            Detection::new("b", 600.0, 470.0, 0.8),
            Detection::new("c", 20.0, 30.0, 0.7),
        ];
        let state = AggregationState::rebuild(&detections, &mapper());

        let first = state.occupants(Zone { col: 0, row: 0 });
        assert_eq!(
            first.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
        assert_eq!(state.occupants(Zone { col: 5, row: 3 })[0].id, "b");
        assert!(state.occupants(Zone { col: 2, row: 2 }).is_empty());
    }

    #[test]
    fn rebuild_is_deterministic() {
        let batch = crate::detection::demo_batch();
        let first = AggregationState::rebuild(&batch.detections, &mapper());
        let second = AggregationState::rebuild(&batch.detections, &mapper());
        assert_eq!(first, second);
    }

    #[test]
    fn every_detection_in_exactly_one_zone() {
        let batch = crate::detection::demo_batch();
        let state = AggregationState::rebuild(&batch.detections, &mapper());
        assert_eq!(state.total_detections(), batch.detections.len());
        for detection in &batch.detections {
            let holders = state
                .iter()
                .filter(|(_, occupants)| occupants.iter().any(|d| d.id == detection.id))
                .count();
            assert_eq!(holders, 1, "{} held by {} zones", detection.id, holders);
        }
    }

    #[test]
    fn rebuild_drops_previous_zones() {
        let old = AggregationState::rebuild(&[Detection::new("old", 10.0, 10.0, 0.5)], &mapper());
        assert_eq!(old.active_zones(), 1);
        let new = AggregationState::rebuild(&[Detection::new("new", 630.0, 10.0, 0.5)], &mapper());
        assert!(new.occupants(Zone { col: 0, row: 0 }).is_empty());
        assert_eq!(new.active_zones(), 1);
    }

    #[test]
    fn summary_statistics() {
        let batch = crate::detection::demo_batch();
        let state = AggregationState::rebuild(&batch.detections, &mapper());
        assert_eq!(state.active_zones(), 5);
        assert!((state.density() - 5.0 / 24.0).abs() < 1e-9);

        let matrix = state.occupancy_matrix();
        assert_eq!(matrix.len(), 4);
        assert_eq!(matrix[0].len(), 6);
        assert_eq!(matrix[1][4], 1);
        assert_eq!(matrix.iter().flatten().sum::<usize>(), 5);
    }

    #[test]
    fn cell_count_does_not_overflow() {
        let grid = GridShape {
            width: 70_000,
            height: 70_000,
        };
        assert_eq!(grid.cell_count(), 4_900_000_000);

        let mapper = GridMapper::new(grid, FrameResolution::default());
        let state = AggregationState::rebuild(&[Detection::new("P001", 10.0, 10.0, 0.9)], &mapper);
        assert!(state.density() > 0.0);
    }

    #[test]
    fn zone_display() {
        assert_eq!(Zone { col: 4, row: 1 }.to_string(), "4,1");
    }
}
