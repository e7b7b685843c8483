use std::cmp::Reverse;
use std::collections::BinaryHeap;

use bevy::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::fixed_math::{FixedNum, FixedVec2, FixedVec3};

use super::cell::{CellRef, CellType, InfoId};
use super::map::{MoveContext, PathfindMap};
use super::path::Path;
use super::types::{
    cell_size, BlockCoord, CellCoord, Direction, LayerId, WeaponRanges, COST_ALLY_SURCHARGE,
    COST_HOSTILE_GOAL_SURCHARGE, COST_ORTHOGONAL, COST_PINCHED_SURCHARGE, SEARCH_CELL_CAP,
};
use super::zones::ZoneManager;

/// Per-surface step-cost factor in tenths: clear ground is the baseline,
/// water is slightly preferred by amphibians, rubble is strongly avoided.
fn surface_cost_factor(cell_type: CellType) -> u32 {
    match cell_type {
        CellType::Clear => 10,
        CellType::Water => 9,
        CellType::Cliff => 15,
        CellType::Rubble => 30,
        CellType::Obstacle => 20,
        CellType::Impassable => 12,
    }
}

/// What ends a search successfully.
pub enum EndCondition {
    /// Current cell equals the goal cell.
    ExactGoal { goal: CellRef },
    /// Current cell is inside weapon range of the victim with a clear shot.
    /// Range is measured to the live victim position each expansion, since
    /// the caller's snapshot may be stale.
    Attack {
        victim: Entity,
        victim_pos: FixedVec2,
        ranges: WeaponRanges,
    },
    /// Current cell is outside both repulsor circles and far enough from
    /// the start.
    Safe {
        repulsor1: FixedVec2,
        repulsor2: FixedVec2,
        radius: FixedNum,
        min_cost: u32,
    },
    /// Current cell lies on the previous path at or beyond the unit's
    /// progress. `anchor` is the nearest rejoin cell, used only to aim the
    /// heuristic.
    OnPath {
        targets: FxHashSet<(LayerId, CellCoord)>,
        anchor: CellCoord,
    },
}

impl EndCondition {
    /// Heuristic target, if the condition has a usable one.
    fn heuristic_target(&self) -> Option<CellCoord> {
        match self {
            EndCondition::ExactGoal { goal } => Some(goal.coord),
            EndCondition::Attack { victim_pos, .. } => {
                let pitch = cell_size();
                Some(CellCoord::new(
                    (victim_pos.x / pitch).floor().to_num(),
                    (victim_pos.y / pitch).floor().to_num(),
                ))
            }
            EndCondition::OnPath { anchor, .. } => Some(*anchor),
            _ => None,
        }
    }

    fn satisfied(
        &self,
        map: &PathfindMap,
        ctx: &MoveContext,
        cell_ref: CellRef,
        cost_so_far: u32,
    ) -> bool {
        match self {
            EndCondition::ExactGoal { goal } => {
                cell_ref.coord == goal.coord && cell_ref.layer == goal.layer
            }
            EndCondition::Attack { victim, victim_pos, ranges } => {
                let center = map.grid().cell_center(cell_ref.coord);
                let dist = center.distance(*victim_pos);
                if dist < ranges.min_range || dist > ranges.max_range {
                    return false;
                }
                let mut ignore = vec![*victim];
                if let Some(mover) = ctx.mover {
                    ignore.push(mover);
                }
                !map.is_view_blocked_by_obstacle(center, *victim_pos, &ignore)
            }
            EndCondition::Safe { repulsor1, repulsor2, radius, min_cost } => {
                if cost_so_far < *min_cost {
                    return false;
                }
                let center = map.grid().cell_center(cell_ref.coord);
                center.distance(*repulsor1) > *radius && center.distance(*repulsor2) > *radius
            }
            EndCondition::OnPath { targets, .. } => {
                targets.contains(&(cell_ref.layer, cell_ref.coord))
            }
        }
    }
}

/// Knobs for one search.
pub struct SearchOptions {
    /// Unit footprint in cells (square clearance).
    pub diameter: i32,
    /// Permit pass-through of allied moving units at a surcharge; the
    /// resulting path is marked blocked-by-ally.
    pub move_allies: bool,
    /// Restrict expansion to blocks marked passable by the coarse pass.
    pub bounded: bool,
    /// Info-allocation cap for this search.
    pub cell_cap: u32,
    /// Heuristic inflation in tenths; 10 is exact octile.
    pub cost_multiplier_tenths: u32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            diameter: 1,
            move_allies: false,
            bounded: false,
            cell_cap: SEARCH_CELL_CAP,
            cost_multiplier_tenths: 10,
        }
    }
}

/// Outcome of the expansion loop, before path construction.
pub struct SearchResult {
    /// The info that satisfied the end condition.
    pub goal: Option<InfoId>,
    /// Lowest-f info ever expanded; the closest-reachable fallback.
    pub best: Option<InfoId>,
    pub blocked_by_ally: bool,
    pub cells_allocated: u32,
}

/// The A* searcher. Owns the open and closed list heads; pre-allocated once
/// and reset between searches rather than rebuilt.
pub struct Searcher {
    open: InfoId,
    closed: InfoId,
    /// Set when the search starts inside an obstacle; steps stay legal
    /// until the first cell the unit could actually stand on.
    pub is_tunneling: bool,
    cells_allocated: u32,
}

impl Searcher {
    pub fn new() -> Self {
        Self {
            open: InfoId::NONE,
            closed: InfoId::NONE,
            is_tunneling: false,
            cells_allocated: 0,
        }
    }

    /// Expand from `start` until the end condition is met, the open list
    /// drains, or the cell budget is spent.
    pub fn run_search(
        &mut self,
        map: &mut PathfindMap,
        zones: &ZoneManager,
        ctx: &MoveContext,
        opts: &SearchOptions,
        start: CellRef,
        end: &EndCondition,
    ) -> SearchResult {
        debug_assert!(
            self.open.is_none() && self.closed.is_none(),
            "searcher re-entered without cleanup"
        );
        self.cells_allocated = 0;
        let mut result = SearchResult {
            goal: None,
            best: None,
            blocked_by_ally: false,
            cells_allocated: 0,
        };

        let goal_hint = end.heuristic_target();

        let Some(start_id) = self.allocate_counted(map, start.layer, start.coord, opts) else {
            return result;
        };
        {
            let h = self.heuristic(goal_hint, start.coord, opts);
            let info = map.pool.get_mut(start_id);
            info.parent = InfoId::NONE;
            info.cost_so_far = 0;
            info.total_cost = h;
        }
        self.open = map.pool.open_insert_sorted(self.open, start_id);

        let mut best_f = u32::MAX;
        let mut best_h = u32::MAX;
        let mut expansions: u32 = 0;
        let expansion_guard = opts.cell_cap.saturating_mul(10).max(1000);

        loop {
            let (new_open, current) = map.pool.open_pop_cheapest(self.open);
            self.open = new_open;
            if current.is_none() {
                break;
            }
            expansions += 1;
            if expansions > expansion_guard {
                error!(
                    "[PATHFIND] search exceeded {} expansions without draining - aborting",
                    expansion_guard
                );
                self.closed = map.pool.closed_push(self.closed, current);
                break;
            }

            let (cur_ref, cur_g, cur_f) = {
                let info = map.pool.get(current);
                (info.cell, info.cost_so_far, info.total_cost)
            };

            if end.satisfied(map, ctx, cur_ref, cur_g) {
                self.closed = map.pool.closed_push(self.closed, current);
                result.goal = Some(current);
                result.cells_allocated = self.cells_allocated;
                return result;
            }

            self.closed = map.pool.closed_push(self.closed, current);
            // Lowest f wins; f ties break toward the goal (smaller h), since
            // every cell on an optimal line shares the same f.
            let cur_h = cur_f.saturating_sub(cur_g);
            if cur_f < best_f || (cur_f == best_f && cur_h < best_h) {
                best_f = cur_f;
                best_h = cur_h;
                result.best = Some(current);
            }

            // Tunneling lasts only while still standing in the obstacle.
            let cur_valid = map
                .cell(cur_ref.layer, cur_ref.coord)
                .map(|c| map.surface_admits(ctx, c))
                .unwrap_or(false);
            if cur_valid {
                self.is_tunneling = false;
            }

            if self.cells_allocated >= opts.cell_cap {
                warn!(
                    "[PATHFIND] search hit its cell budget ({}) - treating as no path",
                    opts.cell_cap
                );
                break;
            }

            // Eight grid neighbors, plus the cross-layer twin when this is
            // a connect cell.
            for dir in Direction::ALL {
                let n_coord = cur_ref.coord.step(dir);
                if let Some((a, b)) = dir.components() {
                    // No cutting corners: a diagonal is legal only when both
                    // cardinal components are enterable.
                    if !self.is_tunneling {
                        let pass_a = map.valid_movement_position(
                            ctx,
                            cur_ref.layer,
                            cur_ref.coord.step(a),
                            Some(cur_ref),
                        );
                        let pass_b = map.valid_movement_position(
                            ctx,
                            cur_ref.layer,
                            cur_ref.coord.step(b),
                            Some(cur_ref),
                        );
                        if !(pass_a && pass_b) {
                            continue;
                        }
                    }
                }
                self.try_step(
                    map,
                    zones,
                    ctx,
                    opts,
                    goal_hint,
                    current,
                    cur_ref,
                    cur_g,
                    CellRef::new(cur_ref.layer, n_coord),
                    dir.step_cost(),
                    &mut result,
                );
            }

            let connect = map
                .cell(cur_ref.layer, cur_ref.coord)
                .map(|c| c.connect_layer)
                .unwrap_or(LayerId::INVALID);
            if connect != LayerId::INVALID {
                self.try_step(
                    map,
                    zones,
                    ctx,
                    opts,
                    goal_hint,
                    current,
                    cur_ref,
                    cur_g,
                    CellRef::new(connect, cur_ref.coord),
                    COST_ORTHOGONAL,
                    &mut result,
                );
            }
        }

        result.cells_allocated = self.cells_allocated;
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn try_step(
        &mut self,
        map: &mut PathfindMap,
        zones: &ZoneManager,
        ctx: &MoveContext,
        opts: &SearchOptions,
        goal_hint: Option<CellCoord>,
        parent_id: InfoId,
        parent_ref: CellRef,
        parent_g: u32,
        to: CellRef,
        base_cost: u32,
        result: &mut SearchResult,
    ) {
        if opts.bounded && !zones.is_passable(to.coord.block()) {
            return;
        }
        let Some(to_cell) = map.cell(to.layer, to.coord) else {
            return;
        };
        let to_actual = CellRef::new(to_cell.layer, to.coord);
        if to_actual == parent_ref {
            return;
        }

        let mut ally_blocked = false;
        let mut valid =
            map.valid_movement_position(ctx, to.layer, to.coord, Some(parent_ref));
        if valid && opts.diameter > 1 {
            valid = map.clear_cell_for_diameter(ctx, to.layer, to.coord, opts.diameter);
        }

        let to_cell = map.cell(to.layer, to.coord).expect("probed above");
        let (occupancy, cell_type, pinched, has_info, info_id) = (
            to_cell.occupancy,
            to_cell.cell_type,
            to_cell.pinched,
            to_cell.has_info(),
            to_cell.info,
        );

        // Allied moving units: pass-through at a surcharge when permitted,
        // otherwise a wall.
        if valid && occupancy.has_unit() && !occupancy.is_fixed() {
            let occupant = if has_info { map.pool.get(info_id).pos_unit } else { None };
            if let Some(id) = occupant {
                if Some(id) != ctx.mover {
                    let allied = match (ctx.team, (ctx.team_of)(id)) {
                        (Some(a), Some(b)) => a == b,
                        _ => false,
                    };
                    if allied {
                        if opts.move_allies {
                            ally_blocked = true;
                        } else {
                            valid = false;
                        }
                    }
                }
            }
        }

        if !valid {
            if self.is_tunneling {
                // Escaping an obstacle: any step is legal until the unit
                // reaches ground it could stand on.
            } else {
                return;
            }
        }

        let mut step = base_cost * surface_cost_factor(cell_type) / 10;
        if ally_blocked {
            step += COST_ALLY_SURCHARGE;
        }
        if occupancy.has_goal() {
            let goal_owner = if has_info { map.pool.get(info_id).goal_unit } else { None };
            if goal_owner.is_some() && goal_owner != ctx.mover {
                step += COST_HOSTILE_GOAL_SURCHARGE;
            }
        }
        if pinched {
            step += COST_PINCHED_SURCHARGE;
        }
        let g_new = parent_g + step;

        let existing = map
            .cell(to_actual.layer, to_actual.coord)
            .map(|c| c.info)
            .unwrap_or(InfoId::NONE);
        if !existing.is_none() {
            let (on_open, on_closed, g_old) = {
                let info = map.pool.get(existing);
                (info.open, info.closed, info.cost_so_far)
            };
            if on_open {
                if g_new < g_old {
                    // Better route to an open cell: unlink and re-insert,
                    // never duplicate.
                    self.open = map.pool.open_remove(self.open, existing);
                    self.relax(map, existing, parent_id, g_new, goal_hint, to_actual, opts, ally_blocked);
                    self.open = map.pool.open_insert_sorted(self.open, existing);
                }
                return;
            }
            if on_closed {
                if g_new < g_old {
                    self.closed = map.pool.closed_remove(self.closed, existing);
                    self.relax(map, existing, parent_id, g_new, goal_hint, to_actual, opts, ally_blocked);
                    self.open = map.pool.open_insert_sorted(self.open, existing);
                }
                return;
            }
            // Info held for occupancy only; adopt it for this search.
            self.relax(map, existing, parent_id, g_new, goal_hint, to_actual, opts, ally_blocked);
            self.open = map.pool.open_insert_sorted(self.open, existing);
            if ally_blocked {
                result.blocked_by_ally = true;
            }
            return;
        }

        let Some(id) = self.allocate_counted(map, to_actual.layer, to_actual.coord, opts) else {
            return;
        };
        self.relax(map, id, parent_id, g_new, goal_hint, to_actual, opts, ally_blocked);
        self.open = map.pool.open_insert_sorted(self.open, id);
        if ally_blocked {
            result.blocked_by_ally = true;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn relax(
        &mut self,
        map: &mut PathfindMap,
        id: InfoId,
        parent: InfoId,
        g_new: u32,
        goal_hint: Option<CellCoord>,
        cell_ref: CellRef,
        opts: &SearchOptions,
        ally_blocked: bool,
    ) {
        let h = self.heuristic(goal_hint, cell_ref.coord, opts);
        let info = map.pool.get_mut(id);
        info.parent = parent;
        info.cost_so_far = g_new;
        info.total_cost = g_new + h;
        if ally_blocked {
            info.blocked_by_ally = true;
        }
    }

    fn heuristic(&self, goal: Option<CellCoord>, from: CellCoord, opts: &SearchOptions) -> u32 {
        match goal {
            Some(g) => from.octile_cost(g) * opts.cost_multiplier_tenths / 10,
            None => 0,
        }
    }

    fn allocate_counted(
        &mut self,
        map: &mut PathfindMap,
        layer: LayerId,
        coord: CellCoord,
        opts: &SearchOptions,
    ) -> Option<InfoId> {
        if self.cells_allocated >= opts.cell_cap {
            return None;
        }
        let had_info = map.cell(layer, coord).map(|c| c.has_info()).unwrap_or(false);
        let id = map.ensure_info(layer, coord)?;
        if !had_info {
            self.cells_allocated += 1;
        }
        Some(id)
    }

    /// Reconstruct the path ending at `goal_info`. The first node is the
    /// unit's exact position; the rest are cell centers. Layer-transition
    /// nodes are pinned against optimization.
    pub fn build_path(
        &self,
        map: &PathfindMap,
        from_world: FixedVec3,
        goal_info: InfoId,
    ) -> Path {
        let mut chain: Vec<CellRef> = Vec::new();
        let mut cur = goal_info;
        while !cur.is_none() {
            let info = map.pool.get(cur);
            chain.push(info.cell);
            cur = info.parent;
        }
        chain.reverse();

        let mut path = Path::new();
        for (i, cell_ref) in chain.iter().enumerate() {
            let pos = if i == 0 {
                from_world
            } else {
                map.cell_center_3d(cell_ref.layer, cell_ref.coord)
            };
            path.append_node(pos, cell_ref.layer);
        }
        // Pin transitions so optimization cannot cut a bridge or wall entry.
        let nodes_len = path.len();
        let layers: Vec<LayerId> = path.nodes().iter().map(|n| n.layer).collect();
        for i in 0..nodes_len {
            let prev_differs = i > 0 && layers[i - 1] != layers[i];
            let next_differs = i + 1 < nodes_len && layers[i + 1] != layers[i];
            if prev_differs || next_differs {
                path.pin_node(i);
            }
        }
        path
    }

    /// Release every list entry back toward the pool and reset the heads.
    /// Infos still carrying occupant ids survive with cleared search state.
    pub fn cleanup(&mut self, map: &mut PathfindMap) {
        for head in [self.open, self.closed] {
            let mut id = head;
            while !id.is_none() {
                let next = map.pool.get(id).next_open;
                let cell_ref = map.pool.get(id).cell;
                map.pool.get_mut(id).clear_search_state();
                map.release_info_if_unused(cell_ref.layer, cell_ref.coord);
                id = next;
            }
        }
        self.open = InfoId::NONE;
        self.closed = InfoId::NONE;
        self.is_tunneling = false;
    }

    pub fn cells_allocated(&self) -> u32 {
        self.cells_allocated
    }
}

impl Default for Searcher {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------
// Hierarchical coarse pass
// ----------------------------------------------------------------------

/// Coarse node: a zone block plus the block-effective zone entered there.
type CoarseNode = (BlockCoord, u16);

/// Run block-level A* from `start` to `goal` and mark the blocks of the
/// coarse path (plus a one-block skirt) passable in the zone manager.
/// Returns false when no coarse path exists.
pub fn mark_hierarchical_bound(
    map: &PathfindMap,
    zones: &mut ZoneManager,
    ctx: &MoveContext,
    start: CellCoord,
    goal: CellCoord,
) -> bool {
    let start_zone = match map.cell(LayerId::GROUND, start) {
        Some(c) => c.zone,
        None => return false,
    };
    let goal_zone = match map.cell(LayerId::GROUND, goal) {
        Some(c) => c.zone,
        None => return false,
    };
    let start_node: CoarseNode = (
        start.block(),
        zones.block_effective_zone(&ctx.locomotors, start.block(), start_zone),
    );
    let goal_node: CoarseNode = (
        goal.block(),
        zones.block_effective_zone(&ctx.locomotors, goal.block(), goal_zone),
    );

    let mut heap: BinaryHeap<Reverse<(u32, CoarseNode)>> = BinaryHeap::new();
    let mut g_score: FxHashMap<CoarseNode, u32> = FxHashMap::default();
    let mut came_from: FxHashMap<CoarseNode, CoarseNode> = FxHashMap::default();

    let h = |n: &CoarseNode| -> u32 {
        let dx = (n.0.x - goal_node.0.x).unsigned_abs();
        let dy = (n.0.y - goal_node.0.y).unsigned_abs();
        dx.max(dy) * COST_ORTHOGONAL
    };

    g_score.insert(start_node, 0);
    heap.push(Reverse((h(&start_node), start_node)));

    let mut found = false;
    while let Some(Reverse((_, node))) = heap.pop() {
        if node.0 == goal_node.0 && node.1 == goal_node.1 {
            found = true;
            break;
        }
        let g_here = g_score[&node];

        let mut push_neighbor = |neigh: CoarseNode,
                                 cost: u32,
                                 g_score: &mut FxHashMap<CoarseNode, u32>,
                                 came_from: &mut FxHashMap<CoarseNode, CoarseNode>,
                                 heap: &mut BinaryHeap<Reverse<(u32, CoarseNode)>>| {
            let tentative = g_here + cost;
            if tentative < *g_score.get(&neigh).unwrap_or(&u32::MAX) {
                g_score.insert(neigh, tentative);
                came_from.insert(neigh, node);
                heap.push(Reverse((tentative + h(&neigh), neigh)));
            }
        };

        // Grid-adjacent blocks, linked where a boundary cell pair connects
        // the two effective zones.
        for (dx, dy) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
            let nb = BlockCoord { x: node.0.x + dx, y: node.0.y + dy };
            if !zones.block_in_bounds(nb) {
                continue;
            }
            for (a, b) in boundary_pairs(node.0, nb) {
                let (Some(cell_a), Some(cell_b)) =
                    (map.cell(LayerId::GROUND, a), map.cell(LayerId::GROUND, b))
                else {
                    continue;
                };
                if !map.surface_admits(ctx, cell_a) || !map.surface_admits(ctx, cell_b) {
                    continue;
                }
                if zones.block_effective_zone(&ctx.locomotors, node.0, cell_a.zone) != node.1 {
                    continue;
                }
                // No early break: a split neighbor block can expose a
                // different effective zone further along the edge.
                let nz = zones.block_effective_zone(&ctx.locomotors, nb, cell_b.zone);
                push_neighbor((nb, nz), COST_ORTHOGONAL, &mut g_score, &mut came_from, &mut heap);
            }
        }

        // Healthy bridges link their two bank blocks end to end.
        for layer in map.layers().bridges() {
            if layer.is_destroyed() {
                continue;
            }
            for (near, far) in [
                (layer.start_cell(), layer.end_cell()),
                (layer.end_cell(), layer.start_cell()),
            ] {
                if near.block() != node.0 {
                    continue;
                }
                let Some(near_cell) = map.cell(LayerId::GROUND, near) else { continue };
                if zones.block_effective_zone(&ctx.locomotors, node.0, near_cell.zone) != node.1 {
                    continue;
                }
                let Some(far_cell) = map.cell(LayerId::GROUND, far) else { continue };
                if !map.surface_admits(ctx, far_cell) {
                    continue;
                }
                let fz = zones.block_effective_zone(&ctx.locomotors, far.block(), far_cell.zone);
                let span = near.block().x.abs_diff(far.block().x).max(near.block().y.abs_diff(far.block().y));
                push_neighbor(
                    (far.block(), fz),
                    span * COST_ORTHOGONAL,
                    &mut g_score,
                    &mut came_from,
                    &mut heap,
                );
            }
        }
    }

    if !found {
        return false;
    }

    // Mark the coarse path plus a one-block skirt.
    zones.clear_passable_flags();
    let mut node = goal_node;
    loop {
        for dy in -1..=1 {
            for dx in -1..=1 {
                zones.set_passable(BlockCoord { x: node.0.x + dx, y: node.0.y + dy });
            }
        }
        match came_from.get(&node) {
            Some(prev) => node = *prev,
            None => break,
        }
    }

    // Bridge decks can span blocks the coarse path never visits; keep every
    // reachable deck expandable.
    for layer in map.layers().bridges() {
        if layer.is_destroyed() {
            continue;
        }
        let start_marked = zones.is_passable(layer.start_cell().block());
        let end_marked = zones.is_passable(layer.end_cell().block());
        if start_marked || end_marked {
            for coord in layer.member_coords() {
                zones.set_passable(coord.block());
            }
        }
    }

    true
}

/// Adjacent cell pairs across the shared edge of two neighboring blocks.
fn boundary_pairs(a: BlockCoord, b: BlockCoord) -> Vec<(CellCoord, CellCoord)> {
    use super::types::ZONE_BLOCK_SIZE as B;
    let mut out = Vec::with_capacity(B as usize);
    if b.x == a.x + 1 {
        let ax = a.x * B + B - 1;
        for y in (a.y * B)..(a.y * B + B) {
            out.push((CellCoord::new(ax, y), CellCoord::new(ax + 1, y)));
        }
    } else if b.x == a.x - 1 {
        let ax = a.x * B;
        for y in (a.y * B)..(a.y * B + B) {
            out.push((CellCoord::new(ax, y), CellCoord::new(ax - 1, y)));
        }
    } else if b.y == a.y + 1 {
        let ay = a.y * B + B - 1;
        for x in (a.x * B)..(a.x * B + B) {
            out.push((CellCoord::new(x, ay), CellCoord::new(x, ay + 1)));
        }
    } else if b.y == a.y - 1 {
        let ay = a.y * B;
        for x in (a.x * B)..(a.x * B + B) {
            out.push((CellCoord::new(x, ay), CellCoord::new(x, ay - 1)));
        }
    }
    out
}
