use crate::fixed_math::{FixedNum, FixedVec2, FixedVec3};

use super::map::{MoveContext, PathfindMap};
use super::types::{CellCoord, LayerId, MAX_CPOP};

/// One waypoint of a path.
#[derive(Clone, Debug)]
pub struct PathNode {
    pub pos: FixedVec3,
    pub layer: LayerId,
    /// False pins the node through optimization (layer transitions, goal).
    pub can_optimize: bool,
    /// Index of the next retained node after optimization.
    pub next_optimized: Option<usize>,
    /// Cached normalized 2-D direction to the next retained node.
    pub opti_dir: FixedVec2,
    /// Cached 2-D distance to the next retained node.
    pub opti_dist: FixedNum,
}

impl PathNode {
    fn new(pos: FixedVec3, layer: LayerId) -> Self {
        Self {
            pos,
            layer,
            can_optimize: true,
            next_optimized: None,
            opti_dir: FixedVec2::ZERO,
            opti_dist: FixedNum::ZERO,
        }
    }
}

/// Closest-point-on-path answer: the projection of a query position onto the
/// path, with its along-path distance from the start.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClosestPointOnPath {
    pub dist_along_path: FixedNum,
    pub pos_on_path: FixedVec3,
    pub layer: LayerId,
}

#[derive(Clone, Debug)]
struct CpopCache {
    query: FixedVec3,
    out: ClosestPointOnPath,
    /// The cached answer is returned at most MAX_CPOP times, then
    /// recomputed. It is occasionally possible to get stuck otherwise.
    countdown: u8,
}

/// A path returned by the pathfinder: a node sequence with post-pass
/// optimization and a cached closest-point query. Owned by the unit that
/// requested it.
#[derive(Clone, Debug, Default)]
pub struct Path {
    nodes: Vec<PathNode>,
    blocked_by_ally: bool,
    optimized: bool,
    cpop: Option<CpopCache>,
}

impl Path {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[PathNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn first_node(&self) -> Option<&PathNode> {
        self.nodes.first()
    }

    pub fn last_node(&self) -> Option<&PathNode> {
        self.nodes.last()
    }

    pub fn is_optimized(&self) -> bool {
        self.optimized
    }

    pub fn blocked_by_ally(&self) -> bool {
        self.blocked_by_ally
    }

    pub fn set_blocked_by_ally(&mut self, blocked: bool) {
        self.blocked_by_ally = blocked;
    }

    pub fn append_node(&mut self, pos: FixedVec3, layer: LayerId) {
        self.nodes.push(PathNode::new(pos, layer));
        self.invalidate_caches();
    }

    pub fn prepend_node(&mut self, pos: FixedVec3, layer: LayerId) {
        self.nodes.insert(0, PathNode::new(pos, layer));
        self.invalidate_caches();
    }

    /// Exclude a node from optimization (layer transitions, spliced joints).
    pub fn pin_node(&mut self, index: usize) {
        if let Some(node) = self.nodes.get_mut(index) {
            node.can_optimize = false;
        }
    }

    /// Move the final node, keeping the rest of the path intact (used when a
    /// degraded search rewrites the caller's goal).
    pub fn update_last_node(&mut self, pos: FixedVec3) {
        if let Some(last) = self.nodes.last_mut() {
            last.pos = pos;
        }
        self.invalidate_caches();
    }

    fn invalidate_caches(&mut self) {
        self.optimized = false;
        self.cpop = None;
    }

    /// Total 2-D length along the node sequence.
    pub fn length_2d(&self) -> FixedNum {
        let mut total = FixedNum::ZERO;
        for pair in self.nodes.windows(2) {
            total += pair[0].pos.distance_2d(pair[1].pos);
        }
        total
    }

    // ------------------------------------------------------------------
    // Optimization
    // ------------------------------------------------------------------

    /// Straight-line simplification: walk forward and drop each optimizable
    /// node whose predecessor-to-successor segment is passable for the
    /// unit's diameter. Layer transitions are never dropped. Idempotent.
    pub fn optimize(
        &mut self,
        map: &PathfindMap,
        ctx: &MoveContext,
        diameter: i32,
        blocked: bool,
    ) {
        if self.nodes.len() > 2 {
            let mut retained: Vec<PathNode> = Vec::with_capacity(self.nodes.len());
            retained.push(self.nodes[0].clone());
            for k in 1..self.nodes.len() - 1 {
                let node = &self.nodes[k];
                let prev = retained.last().unwrap();
                let next = &self.nodes[k + 1];
                let same_layer = prev.layer == node.layer && node.layer == next.layer;
                let removable = node.can_optimize
                    && same_layer
                    && segment_passable(map, ctx, prev.pos, next.pos, node.layer, diameter, blocked);
                if !removable {
                    retained.push(node.clone());
                }
            }
            retained.push(self.nodes[self.nodes.len() - 1].clone());
            self.nodes = retained;
        }

        // Refresh the direction/distance caches between retained nodes.
        for i in 0..self.nodes.len() {
            if i + 1 < self.nodes.len() {
                let delta = self.nodes[i + 1].pos.xy() - self.nodes[i].pos.xy();
                let dist = delta.length();
                self.nodes[i].next_optimized = Some(i + 1);
                self.nodes[i].opti_dist = dist;
                self.nodes[i].opti_dir = if dist == FixedNum::ZERO {
                    FixedVec2::ZERO
                } else {
                    delta / dist
                };
            } else {
                self.nodes[i].next_optimized = None;
                self.nodes[i].opti_dir = FixedVec2::ZERO;
                self.nodes[i].opti_dist = FixedNum::ZERO;
            }
        }
        self.optimized = true;
        self.cpop = None;
    }

    // ------------------------------------------------------------------
    // Closest point on path
    // ------------------------------------------------------------------

    /// Nearest position on the path to `pos`, with bounded caching: the
    /// same answer is reused for up to MAX_CPOP repeat queries against the
    /// same query position.
    pub fn compute_point_on_path(&mut self, pos: FixedVec3) -> ClosestPointOnPath {
        if let Some(cache) = &mut self.cpop {
            if cache.query == pos && cache.countdown > 0 {
                cache.countdown -= 1;
                return cache.out;
            }
        }
        let out = self.closest_point_uncached(pos);
        self.cpop = Some(CpopCache {
            query: pos,
            out,
            countdown: MAX_CPOP,
        });
        out
    }

    /// Peek the cached answer without recomputing.
    pub fn peek_cached_point_on_path(&self) -> Option<ClosestPointOnPath> {
        self.cpop.as_ref().map(|c| c.out)
    }

    fn closest_point_uncached(&self, pos: FixedVec3) -> ClosestPointOnPath {
        if self.nodes.is_empty() {
            return ClosestPointOnPath::default();
        }
        if self.nodes.len() == 1 {
            return ClosestPointOnPath {
                dist_along_path: FixedNum::ZERO,
                pos_on_path: self.nodes[0].pos,
                layer: self.nodes[0].layer,
            };
        }

        let p = pos.xy();
        let mut best_dist_sq = FixedNum::MAX;
        let mut best = ClosestPointOnPath::default();
        let mut dist_along = FixedNum::ZERO;

        for pair in self.nodes.windows(2) {
            let a = pair[0].pos.xy();
            let b = pair[1].pos.xy();
            let ab = b - a;
            let seg_len_sq = ab.length_squared();
            let t = if seg_len_sq == FixedNum::ZERO {
                FixedNum::ZERO
            } else {
                let raw = (p - a).dot(ab) / seg_len_sq;
                raw.clamp(FixedNum::ZERO, FixedNum::from_num(1))
            };
            let proj = a + ab * t;
            let d_sq = (p - proj).length_squared();
            if d_sq < best_dist_sq {
                let seg_len = if seg_len_sq == FixedNum::ZERO {
                    FixedNum::ZERO
                } else {
                    seg_len_sq.sqrt()
                };
                let z = pair[0].pos.z + (pair[1].pos.z - pair[0].pos.z) * t;
                best_dist_sq = d_sq;
                best = ClosestPointOnPath {
                    dist_along_path: dist_along + seg_len * t,
                    pos_on_path: FixedVec3::from_xy(proj, z),
                    layer: pair[0].layer,
                };
            }
            dist_along += pair[0].pos.distance_2d(pair[1].pos);
        }
        best
    }

    /// For a flight path: remaining distance to the goal from `pos` (zero
    /// once past it) and the goal position itself.
    pub fn compute_flight_dist_to_goal(&mut self, pos: FixedVec3) -> (FixedNum, FixedVec3) {
        let Some(last) = self.nodes.last() else {
            return (FixedNum::ZERO, FixedVec3::ZERO);
        };
        let goal = last.pos;
        let total = self.length_2d();
        let along = self.compute_point_on_path(pos).dist_along_path;
        let remaining = total - along;
        if remaining <= FixedNum::ZERO {
            (FixedNum::ZERO, goal)
        } else {
            (remaining, goal)
        }
    }

    /// Cumulative 2-D distance from the path start to each node. Used for
    /// patch splicing.
    pub fn node_distances(&self) -> Vec<FixedNum> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut acc = FixedNum::ZERO;
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                acc += self.nodes[i - 1].pos.distance_2d(node.pos);
            }
            out.push(acc);
        }
        out
    }

    /// Append a clone of `other`'s nodes starting at `from_index`.
    pub fn append_suffix_of(&mut self, other: &Path, from_index: usize) {
        for node in &other.nodes[from_index.min(other.nodes.len())..] {
            self.nodes.push(node.clone());
        }
        self.invalidate_caches();
    }

    /// Grid cell under each node, for splice-target marking.
    pub fn node_cells(&self, map: &PathfindMap) -> Vec<(LayerId, CellCoord)> {
        self.nodes
            .iter()
            .map(|n| (n.layer, map.world_to_cell(n.pos.xy()).coord))
            .collect()
    }
}

fn segment_passable(
    map: &PathfindMap,
    ctx: &MoveContext,
    from: FixedVec3,
    to: FixedVec3,
    layer: LayerId,
    diameter: i32,
    blocked: bool,
) -> bool {
    let start = map.world_to_cell(from.xy());
    let end = map.world_to_cell(to.xy());
    if start.overflow || end.overflow {
        return false;
    }
    map.iterate_cells_along_line(start.coord, end.coord, layer, |map, _, to| {
        if !map.clear_cell_for_diameter(ctx, to.layer, to.coord, diameter) {
            return false;
        }
        if blocked {
            if let Some(cell) = map.cell(to.layer, to.coord) {
                if cell.occupancy.has_unit() {
                    let occupant = if cell.has_info() {
                        map.pool().get(cell.info).pos_unit
                    } else {
                        None
                    };
                    if occupant != ctx.mover {
                        return false;
                    }
                }
            }
        }
        true
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nav::cell::CellType;
    use crate::nav::map::PathfindMap;
    use crate::nav::types::{LocomotorSet, Team};
    use bevy::prelude::Entity;

    fn team_of_none(_: Entity) -> Option<Team> {
        None
    }

    fn straight_path(points: &[(f32, f32)]) -> Path {
        let mut path = Path::new();
        for &(x, y) in points {
            path.append_node(FixedVec3::from_f32(x, y, 0.0), LayerId::GROUND);
        }
        path
    }

    #[test]
    fn test_optimize_collapses_collinear_nodes() {
        let map = PathfindMap::new(16, 16);
        let ctx = MoveContext::terrain_only(LocomotorSet::ground(), &team_of_none);
        let mut path = straight_path(&[(15.0, 15.0), (25.0, 25.0), (35.0, 35.0), (45.0, 45.0)]);

        path.optimize(&map, &ctx, 1, false);
        assert_eq!(path.len(), 2, "open terrain leaves only the endpoints");
        assert!(path.is_optimized());
    }

    #[test]
    fn test_optimize_is_idempotent() {
        let map = PathfindMap::new(16, 16);
        let ctx = MoveContext::terrain_only(LocomotorSet::ground(), &team_of_none);
        let mut path = straight_path(&[(15.0, 15.0), (25.0, 25.0), (35.0, 15.0), (45.0, 15.0)]);

        path.optimize(&map, &ctx, 1, false);
        let once: Vec<_> = path.nodes().iter().map(|n| n.pos).collect();
        path.optimize(&map, &ctx, 1, false);
        let twice: Vec<_> = path.nodes().iter().map(|n| n.pos).collect();
        assert_eq!(once, twice, "optimizing an optimized path must not change it");
    }

    #[test]
    fn test_optimize_keeps_detour_around_obstacle() {
        let mut map = PathfindMap::new(16, 16);
        for y in 0..5 {
            map.grid.get_mut(CellCoord::new(4, y)).unwrap().cell_type = CellType::Obstacle;
        }
        let ctx = MoveContext::terrain_only(LocomotorSet::ground(), &team_of_none);
        // Dog-leg over the top of the obstacle column.
        let mut path = straight_path(&[(15.0, 15.0), (45.0, 55.0), (75.0, 15.0)]);
        path.optimize(&map, &ctx, 1, false);
        assert_eq!(
            path.len(),
            3,
            "the waypoint clearing the obstacle must survive optimization"
        );
    }

    #[test]
    fn test_closest_point_lies_on_path() {
        let mut path = straight_path(&[(10.0, 10.0), (110.0, 10.0)]);
        let out = path.compute_point_on_path(FixedVec3::from_f32(60.0, 40.0, 0.0));
        assert_eq!(out.pos_on_path.x, FixedNum::from_num(60.0));
        assert_eq!(out.pos_on_path.y, FixedNum::from_num(10.0));
        assert_eq!(out.dist_along_path, FixedNum::from_num(50.0));
    }

    #[test]
    fn test_closest_point_clamps_to_segment_ends() {
        let mut path = straight_path(&[(10.0, 10.0), (60.0, 10.0)]);
        let out = path.compute_point_on_path(FixedVec3::from_f32(500.0, 80.0, 0.0));
        assert_eq!(out.pos_on_path.x, FixedNum::from_num(60.0), "clamps to the last node");
    }

    #[test]
    fn test_cpop_cache_expires_after_max_reuse() {
        let mut path = straight_path(&[(10.0, 10.0), (110.0, 10.0)]);
        let query = FixedVec3::from_f32(30.0, 20.0, 0.0);
        let first = path.compute_point_on_path(query);
        // Drain the cache: MAX_CPOP reuses then a recompute, all identical
        // for an unchanged path.
        for _ in 0..(MAX_CPOP as usize + 3) {
            let again = path.compute_point_on_path(query);
            assert_eq!(again.pos_on_path, first.pos_on_path);
        }
        // A different query bypasses the cache immediately.
        let moved = path.compute_point_on_path(FixedVec3::from_f32(90.0, 20.0, 0.0));
        assert_eq!(moved.pos_on_path.x, FixedNum::from_num(90.0));
    }
}
