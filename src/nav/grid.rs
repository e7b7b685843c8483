use crate::fixed_math::{FixedNum, FixedVec2, FixedVec3};

use super::cell::{Cell, CellType};
use super::types::{cell_size, CellCoord, LayerId, MAX_WALKABLE_RISE};

/// Terrain sampling contract consumed by the navigation core. Implemented by
/// the host's terrain logic; the core calls it during classification and
/// layer selection.
pub trait TerrainQuery {
    /// World height of the ground at a sample point.
    fn ground_height(&self, x: FixedNum, y: FixedNum) -> FixedNum;

    /// Height of the water plane covering the sample point, if any.
    fn water_height(&self, x: FixedNum, y: FixedNum) -> Option<FixedNum>;

    /// Walking-surface height of a named overlay layer at a sample point.
    /// Hosts whose overlay surfaces move (a sagging bridge deck) override
    /// this; None defers to the height cached when the layer was built.
    fn layer_height(&self, _x: FixedNum, _y: FixedNum, _layer: LayerId) -> Option<FixedNum> {
        None
    }
}

/// Result of a world-to-cell conversion. `overflow` reports that the input
/// was outside the map and got clipped to the extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellLookup {
    pub coord: CellCoord,
    pub overflow: bool,
}

/// The base pathfinding grid: a rectangular array of cells at fixed world
/// pitch, origin at world (0, 0). Classified once at map load and
/// incrementally patched thereafter.
pub struct CellGrid {
    width: i32,
    height: i32,
    cells: Vec<Cell>,
    /// Sampled ground height per cell center, cached for path node heights.
    heights: Vec<FixedNum>,
}

impl CellGrid {
    pub fn new(width: i32, height: i32) -> Self {
        assert!(width > 0 && height > 0, "grid extent must be positive");
        let count = (width as usize) * (height as usize);
        let mut cells = vec![Cell::default(); count];
        for cell in &mut cells {
            cell.layer = LayerId::GROUND;
        }
        Self {
            width,
            height,
            cells,
            heights: vec![FixedNum::ZERO; count],
        }
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn in_bounds(&self, coord: CellCoord) -> bool {
        coord.x >= 0 && coord.x < self.width && coord.y >= 0 && coord.y < self.height
    }

    #[inline]
    fn index(&self, coord: CellCoord) -> usize {
        debug_assert!(self.in_bounds(coord));
        (coord.y as usize) * (self.width as usize) + coord.x as usize
    }

    pub fn get(&self, coord: CellCoord) -> Option<&Cell> {
        if self.in_bounds(coord) {
            Some(&self.cells[self.index(coord)])
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, coord: CellCoord) -> Option<&mut Cell> {
        if self.in_bounds(coord) {
            let idx = self.index(coord);
            Some(&mut self.cells[idx])
        } else {
            None
        }
    }

    /// Convert a world position to its cell coordinate, clipping to the map
    /// extent and reporting overflow.
    pub fn world_to_cell(&self, pos: FixedVec2) -> CellLookup {
        let pitch = cell_size();
        let mut x: i32 = (pos.x / pitch).floor().to_num();
        let mut y: i32 = (pos.y / pitch).floor().to_num();
        let mut overflow = false;
        if x < 0 {
            overflow = true;
            x = 0;
        }
        if y < 0 {
            overflow = true;
            y = 0;
        }
        if x >= self.width {
            overflow = true;
            x = self.width - 1;
        }
        if y >= self.height {
            overflow = true;
            y = self.height - 1;
        }
        CellLookup { coord: CellCoord::new(x, y), overflow }
    }

    /// World position of a cell's center.
    pub fn cell_center(&self, coord: CellCoord) -> FixedVec2 {
        let pitch = cell_size();
        let half = pitch / FixedNum::from_num(2);
        FixedVec2::new(
            FixedNum::from_num(coord.x) * pitch + half,
            FixedNum::from_num(coord.y) * pitch + half,
        )
    }

    /// Cell center with the cached ground height as z.
    pub fn cell_center_3d(&self, coord: CellCoord) -> FixedVec3 {
        let xy = self.cell_center(coord);
        let z = self
            .get(coord)
            .map(|_| self.heights[self.index(coord)])
            .unwrap_or(FixedNum::ZERO);
        FixedVec3::from_xy(xy, z)
    }

    pub(crate) fn set_ground_height(&mut self, coord: CellCoord, height: FixedNum) {
        if self.in_bounds(coord) {
            let idx = self.index(coord);
            self.heights[idx] = height;
        }
    }

    pub fn ground_height_at(&self, coord: CellCoord) -> FixedNum {
        if self.in_bounds(coord) {
            self.heights[self.index(coord)]
        } else {
            FixedNum::ZERO
        }
    }

    /// Classify every cell from terrain samples. Obstacle stamps are applied
    /// separately and survive only when the caller re-stamps them.
    pub fn classify_all(&mut self, terrain: &dyn TerrainQuery) {
        for y in 0..self.height {
            for x in 0..self.width {
                self.classify_cell(CellCoord::new(x, y), terrain);
            }
        }
        self.refresh_pinched_region(
            CellCoord::new(0, 0),
            CellCoord::new(self.width - 1, self.height - 1),
        );
    }

    /// Classify one cell: water plane above ground makes water, steep rise
    /// makes cliff, otherwise clear. Does not touch obstacle stamps.
    pub fn classify_cell(&mut self, coord: CellCoord, terrain: &dyn TerrainQuery) {
        if !self.in_bounds(coord) {
            return;
        }
        let pitch = cell_size();
        let x0 = FixedNum::from_num(coord.x) * pitch;
        let y0 = FixedNum::from_num(coord.y) * pitch;
        let x1 = x0 + pitch;
        let y1 = y0 + pitch;

        let corners = [
            terrain.ground_height(x0, y0),
            terrain.ground_height(x1, y0),
            terrain.ground_height(x0, y1),
            terrain.ground_height(x1, y1),
        ];
        let mut lo = corners[0];
        let mut hi = corners[0];
        for &h in &corners[1..] {
            lo = lo.min(h);
            hi = hi.max(h);
        }

        let center = self.cell_center(coord);
        let ground = terrain.ground_height(center.x, center.y);

        let cell_type = if terrain
            .water_height(center.x, center.y)
            .map(|w| w > ground)
            .unwrap_or(false)
        {
            CellType::Water
        } else if hi - lo > FixedNum::from_num(MAX_WALKABLE_RISE) {
            CellType::Cliff
        } else {
            CellType::Clear
        };

        let idx = self.index(coord);
        let cell = &mut self.cells[idx];
        cell.natural_type = cell_type;
        // Structures own their cells until explicitly removed.
        if !matches!(cell.cell_type, CellType::Obstacle) {
            cell.cell_type = cell_type;
        }
        self.heights[idx] = ground;
    }

    /// Reclassify a rectangular region (inclusive corners), used after water
    /// level changes and terrain flattening.
    pub fn reclassify_region(
        &mut self,
        min: CellCoord,
        max: CellCoord,
        terrain: &dyn TerrainQuery,
    ) {
        for y in min.y.max(0)..=max.y.min(self.height - 1) {
            for x in min.x.max(0)..=max.x.min(self.width - 1) {
                self.classify_cell(CellCoord::new(x, y), terrain);
            }
        }
        self.refresh_pinched_region(min.offset(-1, -1), max.offset(1, 1));
    }

    /// Recompute the pinched bit over a region plus its rim. A cell is
    /// pinched when all four cardinal neighbors are obstacle or impassable;
    /// the map edge counts as blocking.
    pub fn refresh_pinched_region(&mut self, min: CellCoord, max: CellCoord) {
        let min_x = min.x.max(0);
        let min_y = min.y.max(0);
        let max_x = max.x.min(self.width - 1);
        let max_y = max.y.min(self.height - 1);
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                let coord = CellCoord::new(x, y);
                let pinched = [(0, 1), (0, -1), (1, 0), (-1, 0)].iter().all(|&(dx, dy)| {
                    match self.get(coord.offset(dx, dy)) {
                        Some(n) => matches!(n.cell_type, CellType::Obstacle | CellType::Impassable),
                        None => true,
                    }
                });
                let idx = self.index(coord);
                self.cells[idx].pinched = pinched;
            }
        }
    }

    /// Iterate all cells with their coordinates.
    pub fn iter(&self) -> impl Iterator<Item = (CellCoord, &Cell)> {
        let width = self.width;
        self.cells.iter().enumerate().map(move |(i, cell)| {
            let x = (i as i32) % width;
            let y = (i as i32) / width;
            (CellCoord::new(x, y), cell)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat featureless terrain for classification tests.
    pub struct FlatTerrain;

    impl TerrainQuery for FlatTerrain {
        fn ground_height(&self, _x: FixedNum, _y: FixedNum) -> FixedNum {
            FixedNum::ZERO
        }
        fn water_height(&self, _x: FixedNum, _y: FixedNum) -> Option<FixedNum> {
            None
        }
    }

    /// Terrain with a vertical river of water between two x bounds.
    struct RiverTerrain {
        west_bank: f32,
        east_bank: f32,
    }

    impl TerrainQuery for RiverTerrain {
        fn ground_height(&self, x: FixedNum, _y: FixedNum) -> FixedNum {
            let xf: f32 = x.to_num();
            if xf >= self.west_bank && xf < self.east_bank {
                FixedNum::from_num(-5.0)
            } else {
                FixedNum::ZERO
            }
        }
        fn water_height(&self, x: FixedNum, _y: FixedNum) -> Option<FixedNum> {
            let xf: f32 = x.to_num();
            if xf >= self.west_bank && xf < self.east_bank {
                Some(FixedNum::from_num(-1.0))
            } else {
                None
            }
        }
    }

    #[test]
    fn test_world_to_cell_roundtrip_on_cell_indices() {
        let grid = CellGrid::new(64, 64);
        for &(x, y) in &[(0, 0), (5, 9), (63, 63), (31, 2)] {
            let coord = CellCoord::new(x, y);
            let center = grid.cell_center(coord);
            let lookup = grid.world_to_cell(center);
            assert!(!lookup.overflow);
            assert_eq!(lookup.coord, coord, "worldToCell∘cellCenter must be identity");
        }
    }

    #[test]
    fn test_world_to_cell_clips_and_reports_overflow() {
        let grid = CellGrid::new(8, 8);
        let lookup = grid.world_to_cell(FixedVec2::from_f32(-25.0, 900.0));
        assert!(lookup.overflow, "out-of-map positions must report overflow");
        assert_eq!(lookup.coord, CellCoord::new(0, 7), "and clip to the extent");
    }

    #[test]
    fn test_cell_center_within_half_pitch() {
        let grid = CellGrid::new(16, 16);
        let p = FixedVec2::from_f32(42.0, 117.0);
        let lookup = grid.world_to_cell(p);
        let center = grid.cell_center(lookup.coord);
        let half = cell_size() / FixedNum::from_num(2);
        assert!((center.x - p.x).abs() <= half);
        assert!((center.y - p.y).abs() <= half);
    }

    #[test]
    fn test_river_classifies_as_water() {
        let mut grid = CellGrid::new(16, 16);
        grid.classify_all(&RiverTerrain { west_bank: 60.0, east_bank: 100.0 });

        assert_eq!(grid.get(CellCoord::new(2, 4)).unwrap().cell_type, CellType::Clear);
        assert_eq!(
            grid.get(CellCoord::new(7, 4)).unwrap().cell_type,
            CellType::Water,
            "cells under the water plane classify as water"
        );
    }

    #[test]
    fn test_steep_rise_classifies_as_cliff() {
        struct Step;
        impl TerrainQuery for Step {
            fn ground_height(&self, x: FixedNum, _y: FixedNum) -> FixedNum {
                if x >= FixedNum::from_num(40.0) {
                    FixedNum::from_num(30.0)
                } else {
                    FixedNum::ZERO
                }
            }
            fn water_height(&self, _x: FixedNum, _y: FixedNum) -> Option<FixedNum> {
                None
            }
        }
        let mut grid = CellGrid::new(8, 8);
        grid.classify_all(&Step);
        // The cell spanning the step (x cells 3..4 cover world 30..50) sees
        // both heights at its corners.
        assert_eq!(grid.get(CellCoord::new(3, 3)).unwrap().cell_type, CellType::Cliff);
        assert_eq!(grid.get(CellCoord::new(1, 3)).unwrap().cell_type, CellType::Clear);
    }

    #[test]
    fn test_pinched_requires_all_four_neighbors_blocked() {
        let mut grid = CellGrid::new(5, 5);
        grid.classify_all(&FlatTerrain);
        for &(x, y) in &[(2, 3), (2, 1), (1, 2), (3, 2)] {
            grid.get_mut(CellCoord::new(x, y)).unwrap().cell_type = CellType::Obstacle;
        }
        grid.refresh_pinched_region(CellCoord::new(0, 0), CellCoord::new(4, 4));
        assert!(grid.get(CellCoord::new(2, 2)).unwrap().pinched);
        assert!(!grid.get(CellCoord::new(0, 0)).unwrap().pinched);
    }
}
