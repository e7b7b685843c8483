use bevy::prelude::*;

use crate::fixed_math::{FixedVec2, FixedVec3};

use super::cell::{Cell, CellInfoPool, CellRef, CellType, InfoId};
use super::grid::{CellGrid, CellLookup};
use super::layers::LayerStore;
use super::types::{CellCoord, LayerId, LocomotorSet, SurfaceMask, Team};

/// Everything a passability query needs to know about the moving unit.
/// Borrowed for the duration of one call.
pub struct MoveContext<'a> {
    pub locomotors: LocomotorSet,
    /// The moving unit itself; its own stamps never block it.
    pub mover: Option<Entity>,
    pub team: Option<Team>,
    /// A single designated obstacle treated as absent for this query.
    pub ignore_obstacle: Option<Entity>,
    /// Team lookup for occupants, owned by the occupancy tracker.
    pub team_of: &'a dyn Fn(Entity) -> Option<Team>,
}

impl<'a> MoveContext<'a> {
    /// Context for terrain-only queries where no unit is involved.
    pub fn terrain_only(locomotors: LocomotorSet, team_of: &'a dyn Fn(Entity) -> Option<Team>) -> Self {
        Self {
            locomotors,
            mover: None,
            team: None,
            ignore_obstacle: None,
            team_of,
        }
    }
}

/// The composed cell store: base grid, overlay layers, and the shared
/// search-info pool. Exclusively owned by the pathfinder for the map's
/// lifetime.
pub struct PathfindMap {
    pub(crate) grid: CellGrid,
    pub(crate) layers: LayerStore,
    pub(crate) pool: CellInfoPool,
}

impl PathfindMap {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            grid: CellGrid::new(width, height),
            layers: LayerStore::new(),
            pool: CellInfoPool::new(),
        }
    }

    pub fn grid(&self) -> &CellGrid {
        &self.grid
    }

    pub fn layers(&self) -> &LayerStore {
        &self.layers
    }

    pub fn pool(&self) -> &CellInfoPool {
        &self.pool
    }

    pub fn world_to_cell(&self, pos: FixedVec2) -> CellLookup {
        self.grid.world_to_cell(pos)
    }

    /// The cell at (layer, coord). Overlay lookups fall back to the ground
    /// cell when the overlay does not cover the coordinate, mirroring how
    /// units walk off a bridge end.
    pub fn cell(&self, layer: LayerId, coord: CellCoord) -> Option<&Cell> {
        if layer.is_overlay() {
            if let Some(l) = self.layers.get(layer) {
                if let Some(cell) = l.get(coord) {
                    return Some(cell);
                }
            }
        }
        self.grid.get(coord)
    }

    pub fn cell_mut(&mut self, layer: LayerId, coord: CellCoord) -> Option<&mut Cell> {
        if layer.is_overlay() {
            // Split the overlay probe from the ground fallback to keep the
            // borrow checker satisfied.
            let on_layer = self
                .layers
                .get(layer)
                .map(|l| l.get(coord).is_some())
                .unwrap_or(false);
            if on_layer {
                return self.layers.get_mut(layer).and_then(|l| l.get_mut(coord));
            }
        }
        self.grid.get_mut(coord)
    }

    /// Cell center in 3-D: overlay cells sit at the layer surface, ground
    /// cells at the cached terrain height.
    pub fn cell_center_3d(&self, layer: LayerId, coord: CellCoord) -> FixedVec3 {
        let xy = self.grid.cell_center(coord);
        let z = if layer.is_overlay() {
            match self.layers.get(layer) {
                Some(l) if l.get(coord).is_some() => l.surface_z(),
                _ => self.grid.ground_height_at(coord),
            }
        } else {
            self.grid.ground_height_at(coord)
        };
        FixedVec3::from_xy(xy, z)
    }

    // ------------------------------------------------------------------
    // Search-info plumbing
    // ------------------------------------------------------------------

    /// The info of a cell, allocating from the pool on first need. Returns
    /// None only on pool exhaustion.
    pub fn ensure_info(&mut self, layer: LayerId, coord: CellCoord) -> Option<InfoId> {
        let (actual_layer, existing) = {
            let cell = self.cell(layer, coord)?;
            (cell.layer, cell.info)
        };
        if !existing.is_none() {
            return Some(existing);
        }
        let id = self.pool.allocate(CellRef::new(actual_layer, coord))?;
        self.cell_mut(actual_layer, coord)
            .expect("cell just probed")
            .info = id;
        Some(id)
    }

    /// Return a cell's info to the pool if nothing references it anymore.
    pub fn release_info_if_unused(&mut self, layer: LayerId, coord: CellCoord) {
        let Some(cell) = self.cell(layer, coord) else { return };
        let id = cell.info;
        if id.is_none() {
            return;
        }
        let actual_layer = cell.layer;
        if self.pool.get(id).is_releasable() {
            self.pool.release(id);
            if let Some(cell) = self.cell_mut(actual_layer, coord) {
                cell.info = InfoId::NONE;
            }
        }
    }

    // ------------------------------------------------------------------
    // Passability
    // ------------------------------------------------------------------

    /// True when the terrain category itself admits the locomotor,
    /// independent of occupancy.
    pub fn surface_admits(&self, ctx: &MoveContext, cell: &Cell) -> bool {
        let surfaces = ctx.locomotors.surfaces;
        if surfaces.contains(SurfaceMask::AIR) {
            return true;
        }
        match cell.cell_type {
            CellType::Clear => surfaces.contains(SurfaceMask::GROUND),
            CellType::Water => surfaces.contains(SurfaceMask::WATER),
            CellType::Cliff => surfaces.contains(SurfaceMask::CLIFF),
            CellType::Rubble => {
                ctx.locomotors.crusher || surfaces.contains(SurfaceMask::RUBBLE)
            }
            CellType::Obstacle => {
                if cell.has_info() {
                    let info = self.pool.get(cell.info);
                    if let Some(id) = info.obstacle {
                        if Some(id) == ctx.ignore_obstacle || Some(id) == ctx.mover {
                            return surfaces.contains(SurfaceMask::GROUND);
                        }
                        if info.obstacle_is_fence && ctx.locomotors.crusher {
                            return true;
                        }
                    }
                }
                false
            }
            CellType::Impassable => {
                cell.layer == LayerId::WALL && surfaces.contains(SurfaceMask::WALL)
            }
        }
    }

    /// Passability of a single step. A to-cell is valid iff its terrain
    /// category is in the surface mask (fences admitted under crusher), it
    /// is not fixed-occupied by a non-ally, and either no from-cell is given
    /// or the step does not cross a layer boundary except at a declared
    /// connect cell.
    pub fn valid_movement_position(
        &self,
        ctx: &MoveContext,
        to_layer: LayerId,
        to_coord: CellCoord,
        from: Option<CellRef>,
    ) -> bool {
        let Some(to_cell) = self.cell(to_layer, to_coord) else {
            return false;
        };
        if ctx.locomotors.surfaces.contains(SurfaceMask::AIR) {
            return true;
        }
        if !self.surface_admits(ctx, to_cell) {
            return false;
        }

        // Fixed occupants block everyone but their allies (and themselves).
        if to_cell.occupancy.is_fixed() {
            let occupant = if to_cell.has_info() {
                self.pool.get(to_cell.info).pos_unit
            } else {
                None
            };
            match occupant {
                Some(id) if Some(id) == ctx.mover => {}
                Some(id) => {
                    let allied = match (ctx.team, (ctx.team_of)(id)) {
                        (Some(a), Some(b)) => a == b,
                        _ => false,
                    };
                    if !allied {
                        return false;
                    }
                }
                // Occupied tag with no registered owner (fresh snapshot
                // load): treat as hostile.
                None => return false,
            }
        }

        if let Some(from) = from {
            let Some(from_cell) = self.cell(from.layer, from.coord) else {
                return false;
            };
            let from_layer = from_cell.layer;
            let to_actual = to_cell.layer;
            if from_layer != to_actual {
                // Layer changes only at declared connect cells.
                let linked = from_cell.connect_layer == to_actual
                    || to_cell.connect_layer == from_layer;
                if !linked {
                    return false;
                }
            }
        }

        true
    }

    /// Footprint clearance: every cell of the diameter×diameter square
    /// around (coord) must admit the unit. The square (not a disc) is
    /// deliberate; large vehicles squeeze through gaps exactly as wide as
    /// their bounding square.
    pub fn clear_cell_for_diameter(
        &self,
        ctx: &MoveContext,
        layer: LayerId,
        coord: CellCoord,
        diameter: i32,
    ) -> bool {
        if diameter <= 1 {
            return self.valid_movement_position(ctx, layer, coord, None);
        }
        let lo = -(diameter - 1) / 2;
        let hi = diameter / 2;
        for dy in lo..=hi {
            for dx in lo..=hi {
                if !self.valid_movement_position(ctx, layer, coord.offset(dx, dy), None) {
                    return false;
                }
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Line iteration
    // ------------------------------------------------------------------

    /// Visit every cell along the grid line from `start` to `end` on
    /// `layer`, in order. The visitor receives the previous and current
    /// cell and returns false to stop early; the function returns true iff
    /// the whole line was visited.
    ///
    /// The visitor is generic so the hot loop inlines it.
    pub fn iterate_cells_along_line<F>(
        &self,
        start: CellCoord,
        end: CellCoord,
        layer: LayerId,
        mut visit: F,
    ) -> bool
    where
        F: FnMut(&Self, Option<CellRef>, CellRef) -> bool,
    {
        let mut x0 = start.x;
        let mut y0 = start.y;
        let x1 = end.x;
        let y1 = end.y;

        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;

        let mut prev: Option<CellRef> = None;
        loop {
            let here = CellRef::new(layer, CellCoord::new(x0, y0));
            if !visit(self, prev, here) {
                return false;
            }
            prev = Some(here);
            if x0 == x1 && y0 == y1 {
                return true;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    /// Straight-line passability between two world positions for the given
    /// context. With `blocked`, cells held by any other unit count as
    /// blockers; otherwise only fixed occupants and terrain do. Pinched
    /// cells are rejected unless `allow_pinched`.
    pub fn is_line_passable(
        &self,
        ctx: &MoveContext,
        layer: LayerId,
        start_world: FixedVec2,
        end_world: FixedVec2,
        blocked: bool,
        allow_pinched: bool,
    ) -> bool {
        let start = self.world_to_cell(start_world);
        let end = self.world_to_cell(end_world);
        if start.overflow || end.overflow {
            return false;
        }
        self.iterate_cells_along_line(start.coord, end.coord, layer, |map, from, to| {
            if !map.valid_movement_position(ctx, to.layer, to.coord, from) {
                return false;
            }
            let Some(cell) = map.cell(to.layer, to.coord) else { return false };
            if !allow_pinched && cell.pinched {
                return false;
            }
            if blocked && cell.occupancy.has_unit() {
                let occupant = if cell.has_info() {
                    map.pool.get(cell.info).pos_unit
                } else {
                    None
                };
                if occupant != ctx.mover {
                    return false;
                }
            }
            true
        })
    }

    /// True if the straight line between the two positions crosses an
    /// obstacle cell, and thus blocks vision. Transparent structures and the
    /// listed ids never block.
    pub fn is_view_blocked_by_obstacle(
        &self,
        from_world: FixedVec2,
        to_world: FixedVec2,
        ignore: &[Entity],
    ) -> bool {
        let start = self.world_to_cell(from_world);
        let end = self.world_to_cell(to_world);
        let completed =
            self.iterate_cells_along_line(start.coord, end.coord, LayerId::GROUND, |map, _, to| {
                let Some(cell) = map.cell(to.layer, to.coord) else { return true };
                if cell.cell_type != CellType::Obstacle || !cell.has_info() {
                    return true;
                }
                let info = map.pool.get(cell.info);
                if info.obstacle_is_transparent {
                    return true;
                }
                match info.obstacle {
                    Some(id) if ignore.contains(&id) => true,
                    Some(_) => false,
                    None => true,
                }
            });
        !completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_teams() -> impl Fn(Entity) -> Option<Team> {
        |_| None
    }

    fn ground_ctx<'a>(team_of: &'a dyn Fn(Entity) -> Option<Team>) -> MoveContext<'a> {
        MoveContext::terrain_only(LocomotorSet::ground(), team_of)
    }

    #[test]
    fn test_ground_unit_rejects_water_accepts_clear() {
        let mut map = PathfindMap::new(8, 8);
        map.grid.get_mut(CellCoord::new(3, 3)).unwrap().cell_type = CellType::Water;
        let team_of = no_teams();
        let ctx = ground_ctx(&team_of);
        assert!(map.valid_movement_position(&ctx, LayerId::GROUND, CellCoord::new(2, 2), None));
        assert!(!map.valid_movement_position(&ctx, LayerId::GROUND, CellCoord::new(3, 3), None));
    }

    #[test]
    fn test_diameter_clearance_uses_square() {
        let mut map = PathfindMap::new(8, 8);
        // Obstacle diagonal neighbor: inside the 2-cell square, outside any
        // disc of radius 1.
        map.grid.get_mut(CellCoord::new(4, 4)).unwrap().cell_type = CellType::Obstacle;
        let team_of = no_teams();
        let ctx = ground_ctx(&team_of);
        assert!(map.clear_cell_for_diameter(&ctx, LayerId::GROUND, CellCoord::new(3, 3), 1));
        assert!(
            !map.clear_cell_for_diameter(&ctx, LayerId::GROUND, CellCoord::new(3, 3), 2),
            "the clearance square must include the diagonal cell"
        );
    }

    #[test]
    fn test_line_passable_stops_at_obstacle() {
        let mut map = PathfindMap::new(16, 16);
        for y in 0..16 {
            map.grid.get_mut(CellCoord::new(8, y)).unwrap().cell_type = CellType::Obstacle;
        }
        let team_of = no_teams();
        let ctx = ground_ctx(&team_of);
        let a = FixedVec2::from_f32(25.0, 25.0);
        let b = FixedVec2::from_f32(135.0, 25.0);
        assert!(!map.is_line_passable(&ctx, LayerId::GROUND, a, b, false, true));
        let c = FixedVec2::from_f32(55.0, 95.0);
        assert!(map.is_line_passable(&ctx, LayerId::GROUND, a, c, false, true));
    }

    #[test]
    fn test_line_iteration_visits_endpoints() {
        let map = PathfindMap::new(8, 8);
        let mut visited = Vec::new();
        let done = map.iterate_cells_along_line(
            CellCoord::new(1, 1),
            CellCoord::new(5, 3),
            LayerId::GROUND,
            |_, _, to| {
                visited.push(to.coord);
                true
            },
        );
        assert!(done);
        assert_eq!(*visited.first().unwrap(), CellCoord::new(1, 1));
        assert_eq!(*visited.last().unwrap(), CellCoord::new(5, 3));
        for pair in visited.windows(2) {
            assert!(
                pair[0].chebyshev_distance(pair[1]) == 1,
                "line cells must be adjacent"
            );
        }
    }
}
