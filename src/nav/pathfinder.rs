use bevy::prelude::*;
use rustc_hash::FxHashSet;

use crate::fixed_math::{FixedNum, FixedVec2, FixedVec3};

use super::adjust;
use super::astar::{
    mark_hierarchical_bound, EndCondition, SearchOptions, SearchResult, Searcher,
};
use super::cell::{CellRef, CellType, InfoId};
use super::grid::TerrainQuery;
use super::map::{MoveContext, PathfindMap};
use super::occupancy::OccupancyTracker;
use super::path::Path;
use super::persist::{BridgeState, CellState, NavSnapshot, SNAPSHOT_VERSION};
use super::queue::PathfindQueue;
use super::types::{
    cell_size, BridgeSpan, CellCoord, Footprint, LayerId, LocomotorSet, Mobility, NavObject,
    QueueReport, SurfaceMask, WeaponRanges, HIERARCHICAL_DISTANCE_CELLS, MAX_WALL_PIECES,
    SEARCH_CELL_CAP, TICK_CELL_BUDGET,
};
use super::zones::ZoneManager;

/// Everything the queue needs to service one unit's pending request.
pub struct PathRequestJob {
    pub object: NavObject,
    pub locomotors: LocomotorSet,
    pub goal: FixedVec3,
}

/// The pathfinding engine: owns the cell store, zone manager, occupancy
/// tracker, request queue, and searcher. One per map; reset on new-map.
///
/// All queries run to completion on the calling thread; the request queue is
/// the only time-slicing mechanism. No pathfinder mutator may run while a
/// search is in progress — that is an invariant violation and aborts the
/// tick.
#[derive(Resource)]
pub struct Pathfinder {
    map: PathfindMap,
    zones: ZoneManager,
    occupancy: OccupancyTracker,
    queue: PathfindQueue,
    searcher: Searcher,
    ignore_obstacle: Option<Entity>,
    wall_pieces: Vec<(Entity, FixedVec3, Footprint)>,
    wall_height: FixedNum,
    bridge_spans: Vec<(LayerId, BridgeSpan)>,
    search_in_progress: bool,
    tick: u64,
    tick_cell_budget: u32,
    cells_allocated_this_tick: u32,
}

impl Default for Pathfinder {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl Pathfinder {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            map: PathfindMap::new(width, height),
            zones: ZoneManager::new(),
            occupancy: OccupancyTracker::new(),
            queue: PathfindQueue::new(),
            searcher: Searcher::new(),
            ignore_obstacle: None,
            wall_pieces: Vec::new(),
            wall_height: FixedNum::ZERO,
            bridge_spans: Vec::new(),
            search_in_progress: false,
            tick: 0,
            tick_cell_budget: TICK_CELL_BUDGET,
            cells_allocated_this_tick: 0,
        }
    }

    /// Reset for a new map: fresh grid at the given extent, classified from
    /// terrain, everything else emptied.
    pub fn new_map(&mut self, width: i32, height: i32, terrain: &dyn TerrainQuery) {
        assert!(!self.search_in_progress, "new_map during an active search");
        self.map = PathfindMap::new(width, height);
        self.map.grid.classify_all(terrain);
        self.zones.reset();
        self.occupancy.reset();
        self.queue.clear();
        self.ignore_obstacle = None;
        self.wall_pieces.clear();
        self.bridge_spans.clear();
    }

    /// Coarse barrier for map-boundary changes: stops queued activity,
    /// reclassifies the grid at the new extent, re-stamps walls, and forces
    /// the zone manager dirty. Occupancy registrations are dropped; units
    /// re-register on their next update.
    pub fn set_active_boundary(&mut self, width: i32, height: i32, terrain: &dyn TerrainQuery) {
        assert!(!self.search_in_progress, "boundary change during an active search");
        let wall_pieces = std::mem::take(&mut self.wall_pieces);
        let wall_height = self.wall_height;
        self.new_map(width, height, terrain);
        self.wall_pieces = wall_pieces;
        self.wall_height = wall_height;
        if !self.wall_pieces.is_empty() {
            self.map
                .layers
                .rebuild_wall(&self.wall_pieces, self.wall_height, &mut self.map.grid);
        }
        self.zones.mark_dirty();
    }

    /// Force pathfind map recomputation from terrain.
    pub fn force_map_recalculation(&mut self, terrain: &dyn TerrainQuery) {
        self.map.grid.classify_all(terrain);
        self.zones.mark_dirty();
    }

    /// The water plane changed over a region; reclassify the cells it may
    /// have toggled.
    pub fn set_water_height(&mut self, min: FixedVec2, max: FixedVec2, terrain: &dyn TerrainQuery) {
        let lo = self.map.world_to_cell(min).coord;
        let hi = self.map.world_to_cell(max).coord;
        self.map.grid.reclassify_region(lo, hi, terrain);
        self.zones.mark_dirty();
    }

    /// Construction flattened terrain under a structure site.
    pub fn flatten_terrain(&mut self, min: FixedVec2, max: FixedVec2, terrain: &dyn TerrainQuery) {
        let lo = self.map.world_to_cell(min).coord;
        let hi = self.map.world_to_cell(max).coord;
        self.map.grid.reclassify_region(lo, hi, terrain);
        self.zones.mark_dirty();
    }

    pub fn map(&self) -> &PathfindMap {
        &self.map
    }

    pub fn zones(&self) -> &ZoneManager {
        &self.zones
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Test/tuning hook: override the per-tick allocation budget.
    pub fn set_tick_cell_budget(&mut self, budget: u32) {
        self.tick_cell_budget = budget;
    }

    /// Test hook: hold the in-progress guard so the reentrancy assertion
    /// can be exercised from outside.
    #[cfg(test)]
    pub(crate) fn debug_force_search_guard(&mut self) {
        self.search_in_progress = true;
    }

    /// Test hook: drain the search-info pool so exhaustion inside a live
    /// search can be exercised from outside.
    #[cfg(test)]
    pub(crate) fn debug_exhaust_info_pool(&mut self) {
        let filler = CellRef::new(LayerId::INVALID, CellCoord::new(-1, -1));
        while self.map.pool.allocate(filler).is_some() {}
    }

    /// If set, the search treats this single obstacle as absent (routing to
    /// one's own under-construction building, or to the attack target).
    pub fn set_ignore_obstacle_id(&mut self, id: Option<Entity>) {
        self.ignore_obstacle = id;
    }

    // ------------------------------------------------------------------
    // Object classification
    // ------------------------------------------------------------------

    /// Stamp the object's footprint onto the map as obstacle cells.
    pub fn add_object_to_pathfind_map(&mut self, obj: &NavObject) {
        self.classify_object_footprint(obj, true, false);
    }

    /// Unstamp the object's footprint. Dead objects leave rubble; live ones
    /// restore the classified terrain.
    pub fn remove_object_from_pathfind_map(&mut self, obj: &NavObject) {
        self.classify_object_footprint(obj, false, false);
    }

    /// Reversible self-stamp for "do not path through me" during queries.
    /// The object must not move between the pair of calls.
    pub fn create_a_wall_from_my_footprint(&mut self, obj: &NavObject) {
        self.classify_object_footprint(obj, true, true);
    }

    pub fn remove_wall_from_my_footprint(&mut self, obj: &NavObject) {
        self.classify_object_footprint(obj, false, true);
    }

    fn classify_object_footprint(&mut self, obj: &NavObject, insert: bool, temporary: bool) {
        assert!(!self.search_in_progress, "map mutation during an active search");
        let reach = obj.footprint.bounding_radius();
        let lo = self
            .map
            .world_to_cell(FixedVec2::new(obj.pos.x - reach, obj.pos.y - reach))
            .coord;
        let hi = self
            .map
            .world_to_cell(FixedVec2::new(obj.pos.x + reach, obj.pos.y + reach))
            .coord;

        for y in lo.y..=hi.y {
            for x in lo.x..=hi.x {
                let coord = CellCoord::new(x, y);
                let center = self.map.grid.cell_center(coord);
                if !obj.footprint.contains(obj.pos, center.x, center.y) {
                    continue;
                }
                if insert {
                    let Some(info_id) = self.map.ensure_info(LayerId::GROUND, coord) else {
                        warn!("[PATHFIND] pool exhausted stamping obstacle footprint");
                        return;
                    };
                    {
                        let info = self.map.pool.get_mut(info_id);
                        info.obstacle = Some(obj.id);
                        info.obstacle_is_fence = obj.is_fence;
                        info.obstacle_is_transparent = obj.is_transparent;
                    }
                    if let Some(cell) = self.map.grid.get_mut(coord) {
                        cell.cell_type = CellType::Obstacle;
                    }
                } else {
                    let owned = self
                        .map
                        .cell(LayerId::GROUND, coord)
                        .filter(|c| c.has_info())
                        .map(|c| self.map.pool.get(c.info).obstacle == Some(obj.id))
                        .unwrap_or(false);
                    if !owned {
                        continue;
                    }
                    let restored = if !temporary && !obj.alive {
                        CellType::Rubble
                    } else {
                        self.map.grid.get(coord).map(|c| c.natural_type).unwrap_or(CellType::Clear)
                    };
                    if let Some(cell) = self.map.grid.get_mut(coord) {
                        cell.cell_type = restored;
                        let info_id = cell.info;
                        let info = self.map.pool.get_mut(info_id);
                        info.obstacle = None;
                        info.obstacle_is_fence = false;
                        info.obstacle_is_transparent = false;
                    }
                    self.map.release_info_if_unused(LayerId::GROUND, coord);
                }
            }
        }

        self.map.grid.refresh_pinched_region(lo.offset(-1, -1), hi.offset(1, 1));
        if !temporary {
            self.zones.mark_dirty();
        }
    }

    // ------------------------------------------------------------------
    // Bridges and walls
    // ------------------------------------------------------------------

    /// Add a bridge layer from map data; returns its layer id.
    pub fn add_bridge(&mut self, span: &BridgeSpan) -> Option<LayerId> {
        let layer = self.map.layers.add_bridge(span, &mut self.map.grid)?;
        self.bridge_spans.push((layer, span.clone()));
        self.zones.mark_dirty();
        Some(layer)
    }

    /// A bridge became usable or rubble. Returns the units whose position
    /// sits on a newly dead layer so the caller can apply falling damage —
    /// the pathfinder inflicts none itself.
    pub fn change_bridge_state(&mut self, layer: LayerId, usable: bool) -> Vec<Entity> {
        let Some(l) = self.map.layers.get_mut(layer) else {
            return Vec::new();
        };
        if !l.set_destroyed(!usable) {
            return Vec::new();
        }
        self.zones.mark_dirty();
        if usable {
            Vec::new()
        } else {
            self.occupancy.units_on_layer(layer)
        }
    }

    /// Which destroyed bridge would, if repaired, connect `from` to `to`?
    pub fn find_broken_bridge(
        &mut self,
        locomotors: &LocomotorSet,
        from: FixedVec3,
        to: FixedVec3,
    ) -> Option<Entity> {
        self.ensure_zones();
        let from_zone = self.effective_zone_at(locomotors, from.xy())?;
        let to_zone = self.effective_zone_at(locomotors, to.xy())?;
        for layer in self.map.layers.bridges() {
            if !layer.is_destroyed() {
                continue;
            }
            let a = self.effective_zone_at_cell(locomotors, layer.start_cell());
            let b = self.effective_zone_at_cell(locomotors, layer.end_cell());
            let (Some(a), Some(b)) = (a, b) else { continue };
            if (a == from_zone && b == to_zone) || (a == to_zone && b == from_zone) {
                return layer.bridge_id();
            }
        }
        None
    }

    pub fn add_wall_piece(&mut self, obj: &NavObject, piece_height: FixedNum) -> bool {
        if self.wall_pieces.len() >= MAX_WALL_PIECES {
            warn!("[PATHFIND] wall piece limit ({}) reached", MAX_WALL_PIECES);
            return false;
        }
        self.wall_pieces.push((obj.id, obj.pos, obj.footprint));
        self.wall_height = self.wall_height.max(piece_height);
        self.map
            .layers
            .rebuild_wall(&self.wall_pieces, self.wall_height, &mut self.map.grid);
        self.zones.mark_dirty();
        true
    }

    pub fn remove_wall_piece(&mut self, id: Entity) {
        let before = self.wall_pieces.len();
        self.wall_pieces.retain(|(piece, _, _)| *piece != id);
        if self.wall_pieces.len() != before {
            self.map
                .layers
                .rebuild_wall(&self.wall_pieces, self.wall_height, &mut self.map.grid);
            self.zones.mark_dirty();
        }
    }

    pub fn wall_height(&self) -> FixedNum {
        self.wall_height
    }

    pub fn is_point_on_wall(&self, pos: FixedVec3) -> bool {
        self.wall_pieces
            .iter()
            .any(|(_, center, footprint)| footprint.contains(*center, pos.x, pos.y))
    }

    /// The layer whose walking surface is closest in z to the position. The
    /// terrain query supplies live overlay heights for hosts whose surfaces
    /// move; the cached build-time height backs any layer it declines.
    pub fn layer_for_destination(&self, pos: FixedVec3, terrain: &dyn TerrainQuery) -> LayerId {
        self.map
            .layers
            .layer_for_destination(pos, self.ground_z_at(pos), Some(terrain))
    }

    /// The highest layer whose surface is at or below the position.
    pub fn highest_layer_for_destination(&self, pos: FixedVec3, terrain: &dyn TerrainQuery) -> LayerId {
        self.map.layers.highest_layer_for_destination(pos, Some(terrain))
    }

    /// Cached-height layer selection, used inside path queries: the spec's
    /// find calls carry no terrain handle, so they see the heights sampled
    /// at build/classify time.
    fn layer_for_destination_cached(&self, pos: FixedVec3) -> LayerId {
        self.map
            .layers
            .layer_for_destination(pos, self.ground_z_at(pos), None)
    }

    fn ground_z_at(&self, pos: FixedVec3) -> FixedNum {
        let lookup = self.map.world_to_cell(pos.xy());
        self.map.grid.ground_height_at(lookup.coord)
    }

    // ------------------------------------------------------------------
    // Occupancy mutators
    // ------------------------------------------------------------------

    pub fn update_pos(&mut self, obj: &NavObject, mobility: Mobility) {
        assert!(!self.search_in_progress, "occupancy mutation during an active search");
        self.occupancy.update_pos(&mut self.map, obj, mobility);
    }

    pub fn remove_pos(&mut self, id: Entity) {
        assert!(!self.search_in_progress, "occupancy mutation during an active search");
        self.occupancy.remove_pos(&mut self.map, id);
    }

    pub fn update_goal(&mut self, obj: &NavObject, goal: FixedVec3, layer: LayerId) {
        assert!(!self.search_in_progress, "occupancy mutation during an active search");
        self.occupancy.update_goal(&mut self.map, obj, goal, layer);
    }

    pub fn remove_goal(&mut self, id: Entity) {
        assert!(!self.search_in_progress, "occupancy mutation during an active search");
        self.occupancy.remove_goal(&mut self.map, id);
    }

    pub fn update_aircraft_goal(&mut self, obj: &NavObject, goal: FixedVec3) {
        self.occupancy.update_aircraft_goal(&mut self.map, obj, goal);
    }

    pub fn remove_aircraft_goal(&mut self, id: Entity) {
        self.occupancy.remove_aircraft_goal(&mut self.map, id);
    }

    /// Drop every record of a unit (death, removal from map).
    pub fn remove_unit(&mut self, id: Entity) {
        self.occupancy.remove_unit(&mut self.map, id);
    }

    /// Snap a world position to its cell center.
    pub fn snap_position(&self, pos: FixedVec3) -> FixedVec3 {
        let lookup = self.map.world_to_cell(pos.xy());
        self.map.cell_center_3d(LayerId::GROUND, lookup.coord)
    }

    /// Center of the unit's registered goal cell.
    pub fn goal_position(&self, id: Entity) -> Option<FixedVec3> {
        let (layer, coord) = self.occupancy.goal_cell_of(id)?;
        Some(self.map.cell_center_3d(layer, coord))
    }

    // ------------------------------------------------------------------
    // Zone queries
    // ------------------------------------------------------------------

    fn ensure_zones(&mut self) {
        if !self.zones.needs_calculation() {
            return;
        }
        // Collect fence cells up front; the recompute needs the grid
        // mutably while consulting fence-ness.
        let mut fences: FxHashSet<CellCoord> = FxHashSet::default();
        for (coord, cell) in self.map.grid.iter() {
            if cell.cell_type == CellType::Obstacle
                && cell.has_info()
                && self.map.pool.get(cell.info).obstacle_is_fence
            {
                fences.insert(coord);
            }
        }
        let is_fence = move |c: CellCoord| fences.contains(&c);
        self.zones
            .calculate_zones(&mut self.map.grid, &mut self.map.layers, &is_fence);
    }

    fn effective_zone_at(&self, locomotors: &LocomotorSet, pos: FixedVec2) -> Option<u16> {
        let lookup = self.map.world_to_cell(pos);
        if lookup.overflow {
            return None;
        }
        self.effective_zone_at_cell(locomotors, lookup.coord)
    }

    fn effective_zone_at_cell(&self, locomotors: &LocomotorSet, coord: CellCoord) -> Option<u16> {
        self.map
            .cell(LayerId::GROUND, coord)
            .map(|c| self.zones.effective_zone(locomotors, c.zone))
    }

    /// Constant-time reachability: true iff the effective zones of the two
    /// positions coincide under the capability. Primary admission control
    /// for expensive searches.
    pub fn quick_does_path_exist(
        &mut self,
        locomotors: &LocomotorSet,
        from: FixedVec3,
        to: FixedVec3,
    ) -> bool {
        self.ensure_zones();
        match (
            self.effective_zone_at(locomotors, from.xy()),
            self.effective_zone_at(locomotors, to.xy()),
        ) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Zone check plus an actual (budgeted) search, catching unit blockage
    /// the zone tier cannot see.
    pub fn slow_does_path_exist(
        &mut self,
        obj: &NavObject,
        from: FixedVec3,
        to: FixedVec3,
        ignore_object: Option<Entity>,
    ) -> bool {
        if !self.quick_does_path_exist(&obj.locomotors, from, to) {
            return false;
        }
        let saved = self.ignore_obstacle;
        self.ignore_obstacle = ignore_object.or(saved);
        let locomotors = obj.locomotors;
        let found = self.find_path(obj, &locomotors, from, to).is_some();
        self.ignore_obstacle = saved;
        found
    }

    // ------------------------------------------------------------------
    // Path queries
    // ------------------------------------------------------------------

    /// Find a short, valid path between the given locations.
    pub fn find_path(
        &mut self,
        obj: &NavObject,
        locomotors: &LocomotorSet,
        from: FixedVec3,
        to: FixedVec3,
    ) -> Option<Path> {
        self.begin_search();
        let result = self.internal_find_path(obj, locomotors, from, to, false, 10, false, &mut None);
        self.end_search();
        result
    }

    /// Find a path to the goal, degrading to the closest reachable cell on
    /// failure — in which case `to` is rewritten to the cell actually
    /// reached. Succeeds even when the destination is unreachable.
    #[allow(clippy::too_many_arguments)]
    pub fn find_closest_path(
        &mut self,
        obj: &NavObject,
        locomotors: &LocomotorSet,
        from: FixedVec3,
        to: &mut FixedVec3,
        blocked: bool,
        path_cost_multiplier: f32,
        move_allies: bool,
    ) -> Option<Path> {
        self.begin_search();
        let multiplier_tenths = ((path_cost_multiplier * 10.0).round() as u32).max(1);
        let goal = *to;
        let mut rewrite = Some(to);
        let result = self.internal_find_path(
            obj,
            locomotors,
            from,
            goal,
            move_allies,
            multiplier_tenths,
            blocked,
            &mut rewrite,
        );
        self.end_search();
        result
    }

    /// Find a path to a cell from which `obj` can engage the victim with
    /// the given weapon: inside range, with line of sight. The victim
    /// position parameter may be stale; range is validated against it each
    /// expansion.
    pub fn find_attack_path(
        &mut self,
        obj: &NavObject,
        locomotors: &LocomotorSet,
        from: FixedVec3,
        victim: Entity,
        victim_pos: FixedVec3,
        weapon: WeaponRanges,
    ) -> Option<Path> {
        self.begin_search();
        self.ensure_zones();
        let end = EndCondition::Attack {
            victim,
            victim_pos: victim_pos.xy(),
            ranges: weapon,
        };
        let result = self.run_variant(obj, locomotors, from, end, false);
        self.end_search();
        result
    }

    /// Find a path to a spot outside both repulsor circles, at least the
    /// repulsor radius away along the path.
    pub fn find_safe_path(
        &mut self,
        obj: &NavObject,
        locomotors: &LocomotorSet,
        from: FixedVec3,
        repulsor1: FixedVec3,
        repulsor2: FixedVec3,
        repulsor_radius: FixedNum,
    ) -> Option<Path> {
        self.begin_search();
        self.ensure_zones();
        let min_cost = (repulsor_radius / cell_size()).to_num::<u32>().saturating_mul(10);
        let end = EndCondition::Safe {
            repulsor1: repulsor1.xy(),
            repulsor2: repulsor2.xy(),
            radius: repulsor_radius,
            min_cost,
        };
        let result = self.run_variant(obj, locomotors, from, end, false);
        self.end_search();
        result
    }

    /// Rejoin an existing path from the unit's current position: search to
    /// any cell of the path at or beyond the unit's progress, then splice
    /// the fresh prefix onto the old suffix.
    pub fn patch_path(
        &mut self,
        obj: &NavObject,
        locomotors: &LocomotorSet,
        original: &Path,
        blocked: bool,
    ) -> Option<Path> {
        self.begin_search();
        self.ensure_zones();

        let mut progress_probe = original.clone();
        let progress = progress_probe.compute_point_on_path(obj.pos).dist_along_path;
        let distances = original.node_distances();
        let cells = original.node_cells(&self.map);

        let mut targets: FxHashSet<(LayerId, CellCoord)> = FxHashSet::default();
        let mut target_index: Vec<(usize, (LayerId, CellCoord))> = Vec::new();
        for (i, cell) in cells.iter().enumerate() {
            if distances[i] >= progress {
                targets.insert(*cell);
                target_index.push((i, *cell));
            }
        }
        if targets.is_empty() {
            self.end_search();
            return None;
        }
        let anchor = target_index[0].1 .1;

        let end = EndCondition::OnPath { targets, anchor };
        let outcome = self.run_raw(obj, locomotors, obj.pos, end, blocked);
        let result = match outcome {
            Some((mut prefix, goal_cell)) => {
                // Splice: fresh prefix up to the matched node, old suffix
                // beyond it.
                let joint = target_index
                    .iter()
                    .find(|(_, cell)| *cell == goal_cell)
                    .map(|(i, _)| *i);
                if let Some(joint) = joint {
                    let pin_at = prefix.len().saturating_sub(1);
                    prefix.pin_node(pin_at);
                    prefix.append_suffix_of(original, joint + 1);
                }
                prefix.set_blocked_by_ally(original.blocked_by_ally());
                Some(prefix)
            }
            None => None,
        };
        self.end_search();
        result
    }

    /// Straight flight path for an aircraft: aircraft ignore ground
    /// passability entirely, so the path is the clipped segment itself.
    pub fn aircraft_path(&self, obj: &NavObject, to: FixedVec3) -> Option<Path> {
        let from_lookup = self.map.world_to_cell(obj.pos.xy());
        let to_lookup = self.map.world_to_cell(to.xy());
        if from_lookup.overflow {
            return None;
        }
        let mut path = Path::new();
        path.append_node(obj.pos, obj.layer);
        let dest = if to_lookup.overflow {
            // Clip the destination to the map rim, keeping the altitude.
            let clipped = self.map.cell_center_3d(LayerId::GROUND, to_lookup.coord);
            FixedVec3::new(clipped.x, clipped.y, to.z)
        } else {
            to
        };
        path.append_node(dest, obj.layer);
        Some(path)
    }

    /// Find a ground path of the given width (in cells), for convoy-style
    /// movement where the whole column must fit. No unit is involved; only
    /// terrain, obstacles and the crusher flag matter.
    pub fn find_ground_path(
        &mut self,
        from: FixedVec3,
        to: FixedVec3,
        path_diameter: i32,
        crusher: bool,
    ) -> Option<Path> {
        self.begin_search();
        self.ensure_zones();

        let locomotors = if crusher { LocomotorSet::crusher() } else { LocomotorSet::ground() };
        let from_lookup = self.map.world_to_cell(from.xy());
        let to_lookup = self.map.world_to_cell(to.xy());
        if from_lookup.overflow || to_lookup.overflow {
            self.end_search();
            return None;
        }
        let reachable = {
            let a = self.effective_zone_at_cell(&locomotors, from_lookup.coord);
            let b = self.effective_zone_at_cell(&locomotors, to_lookup.coord);
            matches!((a, b), (Some(a), Some(b)) if a == b)
        };
        if !reachable {
            self.end_search();
            return None;
        }

        let built = {
            let Pathfinder { map, zones, occupancy, searcher, .. } = self;
            let occupancy = &*occupancy;
            let team_of = move |id: Entity| occupancy.team_of(id);
            let ctx = MoveContext {
                locomotors,
                mover: None,
                team: None,
                ignore_obstacle: None,
                team_of: &team_of,
            };
            let start_ref = actual_cell_ref(map, LayerId::GROUND, from_lookup.coord);
            let goal_ref = actual_cell_ref(map, LayerId::GROUND, to_lookup.coord);
            searcher.is_tunneling = false;
            let opts = SearchOptions {
                diameter: path_diameter.max(1),
                move_allies: false,
                bounded: false,
                cell_cap: SEARCH_CELL_CAP,
                cost_multiplier_tenths: 10,
            };
            let end = EndCondition::ExactGoal { goal: goal_ref };
            let result = searcher.run_search(map, zones, &ctx, &opts, start_ref, &end);
            finish_search(
                map,
                searcher,
                &ctx,
                &result,
                from,
                path_diameter.max(1),
                false,
                &mut None,
                false,
            )
        };
        self.end_search();
        built
    }

    /// Vision probe: true if the straight line between the two positions
    /// crosses an opaque structure, ignoring the listed ids. Transparent
    /// structures never block.
    pub fn is_view_blocked_by_obstacle(
        &self,
        from: FixedVec3,
        to: FixedVec3,
        ignore: &[Entity],
    ) -> bool {
        self.map.is_view_blocked_by_obstacle(from.xy(), to.xy(), ignore)
    }

    /// Attack line-of-sight probe: true if an opaque structure other than
    /// attacker and victim sits on the shot line.
    pub fn is_attack_view_blocked(
        &self,
        attacker: Entity,
        attacker_pos: FixedVec3,
        victim: Entity,
        victim_pos: FixedVec3,
    ) -> bool {
        self.map
            .is_view_blocked_by_obstacle(attacker_pos.xy(), victim_pos.xy(), &[attacker, victim])
    }

    /// Allied movers parked in or claiming the cells around a destination;
    /// the caller asks them to step aside before the unit arrives. The scan
    /// square covers the unit's own footprint plus one cell of margin.
    pub fn allies_near_destination(&self, obj: &NavObject, destination: FixedVec3) -> Vec<Entity> {
        let lookup = self.map.world_to_cell(destination.xy());
        let reach = obj.cell_diameter() / 2 + 1;
        let mut out = Vec::new();
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let coord = lookup.coord.offset(dx, dy);
                let Some(cell) = self.map.cell(LayerId::GROUND, coord) else { continue };
                if !cell.occupancy.has_unit() || !cell.has_info() {
                    continue;
                }
                let Some(id) = self.map.pool.get(cell.info).pos_unit else { continue };
                if id == obj.id || out.contains(&id) {
                    continue;
                }
                if self.occupancy.team_of(id) == Some(obj.team) {
                    out.push(id);
                }
            }
        }
        out
    }

    /// Units currently standing anywhere along the path — the cells under
    /// every segment, not just the waypoints, since optimization collapses
    /// straight runs. The caller asks allied ones to step aside.
    pub fn units_blocking_path(&self, obj: &NavObject, path: &Path) -> Vec<Entity> {
        let mut out: Vec<Entity> = Vec::new();
        let nodes = path.nodes();
        if nodes.is_empty() {
            return out;
        }

        let mut scan_segment = |a: FixedVec3, b: FixedVec3, layer: LayerId, out: &mut Vec<Entity>| {
            let start = self.map.world_to_cell(a.xy());
            let end = self.map.world_to_cell(b.xy());
            self.map
                .iterate_cells_along_line(start.coord, end.coord, layer, |map, _, to| {
                    if let Some(cell) = map.cell(to.layer, to.coord) {
                        if cell.occupancy.has_unit() && cell.has_info() {
                            if let Some(id) = map.pool().get(cell.info).pos_unit {
                                if id != obj.id && !out.contains(&id) {
                                    out.push(id);
                                }
                            }
                        }
                    }
                    true
                });
        };

        if nodes.len() == 1 {
            scan_segment(nodes[0].pos, nodes[0].pos, nodes[0].layer, &mut out);
            return out;
        }
        for pair in nodes.windows(2) {
            scan_segment(pair[0].pos, pair[1].pos, pair[0].layer, &mut out);
        }
        out
    }

    /// Straight-line passability for unit behaviors.
    #[allow(clippy::too_many_arguments)]
    pub fn is_line_passable(
        &mut self,
        obj: &NavObject,
        surfaces: SurfaceMask,
        layer: LayerId,
        start: FixedVec3,
        end: FixedVec3,
        blocked: bool,
        allow_pinched: bool,
    ) -> bool {
        let Pathfinder { map, occupancy, ignore_obstacle, .. } = self;
        let occupancy = &*occupancy;
        let team_of = move |id: Entity| occupancy.team_of(id);
        let ctx = MoveContext {
            locomotors: LocomotorSet::new(surfaces, obj.locomotors.crusher),
            mover: Some(obj.id),
            team: Some(obj.team),
            ignore_obstacle: *ignore_obstacle,
            team_of: &team_of,
        };
        map.is_line_passable(&ctx, layer, start.xy(), end.xy(), blocked, allow_pinched)
    }

    // ------------------------------------------------------------------
    // Destination adjustment
    // ------------------------------------------------------------------

    /// Spiral out from `dest` to a passable, zone-reachable, unclaimed cell
    /// and write its center back. Returns false when the scan radius is
    /// exhausted.
    pub fn adjust_destination(
        &mut self,
        obj: &NavObject,
        locomotors: &LocomotorSet,
        dest: &mut FixedVec3,
        group_dest: Option<FixedVec3>,
    ) -> bool {
        self.ensure_zones();
        let unit_cell = self.map.world_to_cell(obj.pos.xy()).coord;
        let diameter = obj.cell_diameter();
        let Pathfinder { map, zones, occupancy, ignore_obstacle, .. } = self;
        let occupancy = &*occupancy;
        let team_of = move |id: Entity| occupancy.team_of(id);
        let ctx = MoveContext {
            locomotors: *locomotors,
            mover: Some(obj.id),
            team: Some(obj.team),
            ignore_obstacle: *ignore_obstacle,
            team_of: &team_of,
        };
        adjust::adjust_destination(map, zones, &ctx, diameter, unit_cell, dest, group_dest)
    }

    /// Aircraft landing variant.
    pub fn adjust_to_landing_destination(&mut self, obj: &NavObject, dest: &mut FixedVec3) -> bool {
        self.ensure_zones();
        let Pathfinder { map, occupancy, .. } = self;
        let occupancy = &*occupancy;
        let team_of = move |id: Entity| occupancy.team_of(id);
        let ctx = MoveContext {
            locomotors: obj.locomotors,
            mover: Some(obj.id),
            team: Some(obj.team),
            ignore_obstacle: None,
            team_of: &team_of,
        };
        adjust::adjust_to_landing_destination(map, &ctx, dest)
    }

    /// Attack-stance variant: a cell inside the weapon envelope with line
    /// of sight to the target.
    pub fn adjust_target_destination(
        &mut self,
        obj: &NavObject,
        victim: Entity,
        victim_pos: FixedVec3,
        weapon: WeaponRanges,
        dest: &mut FixedVec3,
    ) -> bool {
        self.ensure_zones();
        let diameter = obj.cell_diameter();
        let Pathfinder { map, occupancy, ignore_obstacle, .. } = self;
        let occupancy = &*occupancy;
        let team_of = move |id: Entity| occupancy.team_of(id);
        let ctx = MoveContext {
            locomotors: obj.locomotors,
            mover: Some(obj.id),
            team: Some(obj.team),
            ignore_obstacle: *ignore_obstacle,
            team_of: &team_of,
        };
        adjust::adjust_target_destination(map, &ctx, diameter, victim, victim_pos.xy(), weapon, dest)
    }

    /// Last-resort variant tolerating claimed cells.
    pub fn adjust_to_possible_destination(
        &mut self,
        obj: &NavObject,
        locomotors: &LocomotorSet,
        dest: &mut FixedVec3,
    ) -> bool {
        self.ensure_zones();
        let unit_cell = self.map.world_to_cell(obj.pos.xy()).coord;
        let diameter = obj.cell_diameter();
        let Pathfinder { map, zones, occupancy, ignore_obstacle, .. } = self;
        let occupancy = &*occupancy;
        let team_of = move |id: Entity| occupancy.team_of(id);
        let ctx = MoveContext {
            locomotors: *locomotors,
            mover: Some(obj.id),
            team: Some(obj.team),
            ignore_obstacle: *ignore_obstacle,
            team_of: &team_of,
        };
        adjust::adjust_to_possible_destination(map, zones, &ctx, diameter, unit_cell, dest)
    }

    // ------------------------------------------------------------------
    // Request queue
    // ------------------------------------------------------------------

    /// Enqueue a unit for pathing on its next eligible tick.
    pub fn queue_for_path(&mut self, id: Entity) -> bool {
        self.queue.enqueue(id)
    }

    pub fn queued_requests(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn queue_snapshot(&self) -> Vec<Entity> {
        self.queue.iter().copied().collect()
    }

    pub(crate) fn restore_queue(&mut self, entries: Vec<Entity>) {
        self.queue.clear();
        for id in entries {
            self.queue.enqueue(id);
        }
    }

    /// Drain the request queue until it is empty or the tick's cumulative
    /// cell-allocation budget is spent. Units the lookup cannot produce are
    /// discarded (death and changed orders cancel by absence). Remaining
    /// units keep their place for next tick.
    pub fn process_pathfind_queue<F, G>(&mut self, mut lookup: F, mut deliver: G) -> QueueReport
    where
        F: FnMut(Entity) -> Option<PathRequestJob>,
        G: FnMut(Entity, Path),
    {
        self.tick += 1;
        self.cells_allocated_this_tick = 0;
        let mut report = QueueReport::default();

        while let Some(id) = self.queue.pop() {
            if self.cells_allocated_this_tick >= self.tick_cell_budget {
                self.queue.push_front(id);
                break;
            }
            let Some(job) = lookup(id) else {
                report.discarded.push(id);
                continue;
            };
            let mut to = job.goal;
            let from = job.object.pos;
            match self.find_closest_path(&job.object, &job.locomotors, from, &mut to, false, 1.0, true)
            {
                Some(path) => {
                    deliver(id, path);
                    report.serviced.push(id);
                }
                None => {
                    report.discarded.push(id);
                }
            }
        }
        report.remaining = self.queue.len();
        report
    }

    pub fn ignore_obstacle_id(&self) -> Option<Entity> {
        self.ignore_obstacle
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn begin_search(&mut self) {
        assert!(
            !self.search_in_progress,
            "pathfinder query re-entered while a search is in progress"
        );
        self.search_in_progress = true;
    }

    fn end_search(&mut self) {
        self.search_in_progress = false;
    }

    /// Shared trunk of findPath/findClosestPath. When `rewrite_to` is Some,
    /// the search degrades to the closest reachable cell instead of failing
    /// and rewrites the destination through it.
    #[allow(clippy::too_many_arguments)]
    fn internal_find_path(
        &mut self,
        obj: &NavObject,
        locomotors: &LocomotorSet,
        from: FixedVec3,
        to: FixedVec3,
        move_allies: bool,
        cost_multiplier_tenths: u32,
        blocked: bool,
        rewrite_to: &mut Option<&mut FixedVec3>,
    ) -> Option<Path> {
        self.ensure_zones();

        let from_lookup = self.map.world_to_cell(from.xy());
        let to_lookup = self.map.world_to_cell(to.xy());
        if from_lookup.overflow {
            warn!("[PATHFIND] path request start out of bounds");
            return None;
        }
        let closest_ok = rewrite_to.is_some();
        if to_lookup.overflow && !closest_ok {
            return None;
        }

        let from_layer = resolve_layer(&self.map, obj.layer, from_lookup.coord);
        let to_layer = {
            let l = self.layer_for_destination_cached(to);
            resolve_layer(&self.map, l, to_lookup.coord)
        };

        // Admission control. Without the degraded variant a zone mismatch is
        // an immediate no-path.
        let reachable = {
            let a = self.effective_zone_at_cell(locomotors, from_lookup.coord);
            let b = self.effective_zone_at_cell(locomotors, to_lookup.coord);
            matches!((a, b), (Some(a), Some(b)) if a == b)
        };
        if !reachable && !closest_ok {
            return None;
        }

        // Hierarchical acceleration for long searches with a live coarse
        // path; a reduced budget otherwise.
        let far = from_lookup.coord.chebyshev_distance(to_lookup.coord) > HIERARCHICAL_DISTANCE_CELLS;
        let mut cell_cap = SEARCH_CELL_CAP;
        let mut bounded = false;
        {
            let Pathfinder { map, zones, occupancy, searcher, ignore_obstacle, .. } = self;
            let occupancy = &*occupancy;
            let team_of = move |id: Entity| occupancy.team_of(id);
            let ctx = MoveContext {
                locomotors: *locomotors,
                mover: Some(obj.id),
                team: Some(obj.team),
                ignore_obstacle: *ignore_obstacle,
                team_of: &team_of,
            };
            if reachable && far {
                bounded = mark_hierarchical_bound(map, zones, &ctx, from_lookup.coord, to_lookup.coord);
            }
            if !reachable {
                // The goal zone is unreachable; spend a fraction of the
                // budget walking toward it and take the best cell.
                cell_cap = SEARCH_CELL_CAP / 4;
            }

            let start_ref = actual_cell_ref(map, from_layer, from_lookup.coord);
            let goal_ref = actual_cell_ref(map, to_layer, to_lookup.coord);
            searcher.is_tunneling = map
                .cell(start_ref.layer, start_ref.coord)
                .map(|c| !map.surface_admits(&ctx, c))
                .unwrap_or(false);

            let opts = SearchOptions {
                diameter: obj.cell_diameter(),
                move_allies,
                bounded,
                cell_cap,
                cost_multiplier_tenths,
            };
            let end = EndCondition::ExactGoal { goal: goal_ref };
            let result = searcher.run_search(map, zones, &ctx, &opts, start_ref, &end);

            let built = finish_search(
                map, searcher, &ctx, &result, from, obj.cell_diameter(), blocked, rewrite_to,
                closest_ok,
            );
            self.cells_allocated_this_tick = self
                .cells_allocated_this_tick
                .saturating_add(result.cells_allocated);
            built
        }
    }

    /// Attack/safe variant trunk: run an end-condition search from the
    /// object's position and build the result.
    fn run_variant(
        &mut self,
        obj: &NavObject,
        locomotors: &LocomotorSet,
        from: FixedVec3,
        end: EndCondition,
        blocked: bool,
    ) -> Option<Path> {
        self.run_raw(obj, locomotors, from, end, blocked).map(|(p, _)| p)
    }

    /// Shared raw runner returning the built path plus the cell that
    /// satisfied the end condition.
    fn run_raw(
        &mut self,
        obj: &NavObject,
        locomotors: &LocomotorSet,
        from: FixedVec3,
        end: EndCondition,
        blocked: bool,
    ) -> Option<(Path, (LayerId, CellCoord))> {
        let from_lookup = self.map.world_to_cell(from.xy());
        if from_lookup.overflow {
            return None;
        }
        let from_layer = resolve_layer(&self.map, obj.layer, from_lookup.coord);

        let Pathfinder { map, zones, occupancy, searcher, ignore_obstacle, .. } = self;
        let occupancy = &*occupancy;
        let team_of = move |id: Entity| occupancy.team_of(id);
        let ctx = MoveContext {
            locomotors: *locomotors,
            mover: Some(obj.id),
            team: Some(obj.team),
            ignore_obstacle: *ignore_obstacle,
            team_of: &team_of,
        };

        let start_ref = actual_cell_ref(map, from_layer, from_lookup.coord);
        searcher.is_tunneling = map
            .cell(start_ref.layer, start_ref.coord)
            .map(|c| !map.surface_admits(&ctx, c))
            .unwrap_or(false);

        let opts = SearchOptions {
            diameter: obj.cell_diameter(),
            move_allies: false,
            bounded: false,
            cell_cap: SEARCH_CELL_CAP,
            cost_multiplier_tenths: 10,
        };
        let result = searcher.run_search(map, zones, &ctx, &opts, start_ref, &end);

        let outcome = match result.goal {
            Some(goal) => {
                let goal_cell = {
                    let cell = map.pool.get(goal).cell;
                    (cell.layer, cell.coord)
                };
                let mut path = searcher.build_path(map, from, goal);
                path.set_blocked_by_ally(result.blocked_by_ally);
                searcher.cleanup(map);
                path.optimize(map, &ctx, obj.cell_diameter(), blocked);
                Some((path, goal_cell))
            }
            None => {
                searcher.cleanup(map);
                None
            }
        };
        self.cells_allocated_this_tick = self
            .cells_allocated_this_tick
            .saturating_add(result.cells_allocated);
        outcome
    }
}

impl Pathfinder {
    // ------------------------------------------------------------------
    // Snapshot xfer
    // ------------------------------------------------------------------

    /// Capture the persisted subset of the core's state.
    pub fn snapshot(&self) -> NavSnapshot {
        let grid = self.map.grid();
        let mut cells = Vec::with_capacity(grid.cell_count());
        let mut heights = Vec::with_capacity(grid.cell_count());
        for (coord, cell) in grid.iter() {
            cells.push(CellState {
                cell_type: cell.cell_type,
                natural_type: cell.natural_type,
                occupancy: cell.occupancy,
                aircraft_goal: cell.aircraft_goal,
                pinched: cell.pinched,
                connect_layer: cell.connect_layer,
                zone: cell.zone,
            });
            heights.push(grid.ground_height_at(coord));
        }
        let bridges = self
            .bridge_spans
            .iter()
            .map(|(layer, span)| BridgeState {
                layer: *layer,
                span: span.clone(),
                destroyed: self
                    .map
                    .layers()
                    .get(*layer)
                    .map(|l| l.is_destroyed())
                    .unwrap_or(false),
            })
            .collect();
        NavSnapshot {
            version: SNAPSHOT_VERSION,
            width: grid.width(),
            height: grid.height(),
            cells,
            heights,
            bridges,
            wall_pieces: self.wall_pieces.clone(),
            wall_height: self.wall_height,
            queue: self.queue_snapshot(),
            ignore_obstacle: self.ignore_obstacle,
        }
    }

    /// Rebuild a pathfinder from a snapshot. The search-info pool starts
    /// empty and the zone dirty flag is set; units re-register their
    /// occupancy through their own post-load updates.
    pub fn from_snapshot(snapshot: &NavSnapshot) -> Pathfinder {
        let mut pf = Pathfinder::new(snapshot.width, snapshot.height);

        for bridge in &snapshot.bridges {
            match pf.add_bridge(&bridge.span) {
                Some(layer) => {
                    if layer != bridge.layer {
                        warn!(
                            "[PATHFIND] bridge layer renumbered on load ({:?} -> {:?})",
                            bridge.layer, layer
                        );
                    }
                    if bridge.destroyed {
                        pf.change_bridge_state(layer, false);
                    }
                }
                None => warn!("[PATHFIND] dropped a bridge on load: no free layer slot"),
            }
        }

        pf.wall_height = snapshot.wall_height;
        pf.wall_pieces = snapshot.wall_pieces.clone();
        if !pf.wall_pieces.is_empty() {
            pf.map
                .layers
                .rebuild_wall(&pf.wall_pieces, pf.wall_height, &mut pf.map.grid);
        }

        // Per-cell state wins over anything the overlay rebuild stamped.
        for y in 0..snapshot.height {
            for x in 0..snapshot.width {
                let idx = (y * snapshot.width + x) as usize;
                let coord = CellCoord::new(x, y);
                let state = &snapshot.cells[idx];
                if let Some(cell) = pf.map.grid.get_mut(coord) {
                    cell.cell_type = state.cell_type;
                    cell.natural_type = state.natural_type;
                    cell.occupancy = state.occupancy;
                    cell.aircraft_goal = state.aircraft_goal;
                    cell.pinched = state.pinched;
                    cell.connect_layer = state.connect_layer;
                    cell.zone = state.zone;
                }
                pf.map.grid.set_ground_height(coord, snapshot.heights[idx]);
            }
        }

        pf.restore_queue(snapshot.queue.clone());
        pf.ignore_obstacle = snapshot.ignore_obstacle;
        pf.zones.mark_dirty();
        pf
    }
}

/// The cell's actual layer after overlay fallback.
fn actual_cell_ref(map: &PathfindMap, layer: LayerId, coord: CellCoord) -> CellRef {
    let actual = map.cell(layer, coord).map(|c| c.layer).unwrap_or(LayerId::GROUND);
    CellRef::new(actual, coord)
}

fn resolve_layer(map: &PathfindMap, layer: LayerId, coord: CellCoord) -> LayerId {
    if layer == LayerId::INVALID {
        return LayerId::GROUND;
    }
    // A stale overlay layer (destroyed bridge slot reused, unit walked off
    // the deck) falls back to ground.
    map.cell(layer, coord).map(|c| c.layer).unwrap_or(LayerId::GROUND)
}

/// Build, optimize and deliver the search outcome; shared by the exact and
/// closest variants.
#[allow(clippy::too_many_arguments)]
fn finish_search(
    map: &mut PathfindMap,
    searcher: &mut Searcher,
    ctx: &MoveContext,
    result: &SearchResult,
    from: FixedVec3,
    diameter: i32,
    blocked: bool,
    rewrite_to: &mut Option<&mut FixedVec3>,
    closest_ok: bool,
) -> Option<Path> {
    let target: Option<InfoId> = match result.goal {
        Some(goal) => Some(goal),
        None if closest_ok => result.best,
        None => None,
    };
    let Some(target) = target else {
        searcher.cleanup(map);
        return None;
    };

    // Degraded outcome rewrites the caller's goal to the cell reached.
    if result.goal.is_none() {
        if let Some(rewrite) = rewrite_to {
            let cell = map.pool.get(target).cell;
            **rewrite = map.cell_center_3d(cell.layer, cell.coord);
        }
    }

    let mut path = searcher.build_path(map, from, target);
    path.set_blocked_by_ally(result.blocked_by_ally);
    searcher.cleanup(map);
    path.optimize(map, ctx, diameter, blocked);
    Some(path)
}
