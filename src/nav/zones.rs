use fixedbitset::FixedBitSet;

use super::cell::CellType;
use super::grid::CellGrid;
use super::layers::LayerStore;
use super::types::{BlockCoord, CellCoord, LocomotorSet, SurfaceMask, MAX_ZONES, ZONE_BLOCK_SIZE};

/// Minimal union-find over zone ids with path halving.
struct UnionFind {
    parent: Vec<u16>,
}

impl UnionFind {
    fn new(count: usize) -> Self {
        Self { parent: (0..count as u16).collect() }
    }

    fn find(&mut self, mut x: u16) -> u16 {
        while self.parent[x as usize] != x {
            let grand = self.parent[self.parent[x as usize] as usize];
            self.parent[x as usize] = grand;
            x = grand;
        }
        x
    }

    fn union(&mut self, a: u16, b: u16) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Smaller id wins so tables are stable across recomputes.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi as usize] = lo;
        }
    }

    fn into_table(mut self) -> Vec<u16> {
        let len = self.parent.len();
        (0..len as u16).map(|i| self.find(i)).collect()
    }
}

/// Per-block zone bookkeeping for the hierarchical tier.
///
/// Holds the block's first fine-zone index and count, and — only when the
/// block contains more than one fine zone — equivalency arrays mapping each
/// local zone to its effective zone under each meta-capability, confined to
/// the block.
pub struct ZoneBlock {
    first_zone: u16,
    num_zones: u16,
    ground_cliff: Option<Box<[u16]>>,
    ground_water: Option<Box<[u16]>>,
    ground_rubble: Option<Box<[u16]>>,
    crusher: Option<Box<[u16]>>,
    interacts_with_bridge: bool,
}

impl ZoneBlock {
    fn single(first_zone: u16, num_zones: u16) -> Self {
        Self {
            first_zone,
            num_zones,
            ground_cliff: None,
            ground_water: None,
            ground_rubble: None,
            crusher: None,
            interacts_with_bridge: false,
        }
    }

    pub fn interacts_with_bridge(&self) -> bool {
        self.interacts_with_bridge
    }

    /// Effective zone of `zone` within this block under the capability.
    /// Zones not belonging to the block (bridge and wall layer zones) pass
    /// through unchanged.
    pub fn effective_zone(&self, locomotors: &LocomotorSet, zone: u16) -> u16 {
        if zone < self.first_zone || zone >= self.first_zone + self.num_zones {
            return zone;
        }
        if self.num_zones <= 1 {
            return zone;
        }
        let local = (zone - self.first_zone) as usize;
        let table = if locomotors.surfaces.contains(SurfaceMask::GROUND | SurfaceMask::WATER) {
            &self.ground_water
        } else if locomotors.crusher {
            &self.crusher
        } else if locomotors.surfaces.contains(SurfaceMask::GROUND | SurfaceMask::CLIFF) {
            &self.ground_cliff
        } else if locomotors.surfaces.contains(SurfaceMask::GROUND | SurfaceMask::RUBBLE) {
            &self.ground_rubble
        } else {
            // Pure terrain: fine zones are already terrain-equivalent within
            // the block.
            &None
        };
        match table {
            Some(t) => t[local],
            None => zone,
        }
    }
}

/// The zone manager answers "could any path exist from A to B under
/// capability C?" in constant time.
///
/// Fine zones are per-block connected regions of equi-type cells; global
/// equivalency tables merge them per meta-capability so `effective_zone`
/// equality is exactly coarse reachability. Recomputed lazily when the dirty
/// flag is set; multiple consecutive mutations coalesce into one recompute.
pub struct ZoneManager {
    dirty: bool,
    max_zone: u16,
    ground_cliff: Vec<u16>,
    ground_water: Vec<u16>,
    ground_rubble: Vec<u16>,
    crusher: Vec<u16>,
    terrain: Vec<u16>,
    blocks: Vec<ZoneBlock>,
    blocks_x: i32,
    blocks_y: i32,
    /// Hierarchical bound: blocks the current fine search may expand into.
    passable: FixedBitSet,
}

impl ZoneManager {
    pub fn new() -> Self {
        Self {
            dirty: true,
            max_zone: 0,
            ground_cliff: Vec::new(),
            ground_water: Vec::new(),
            ground_rubble: Vec::new(),
            crusher: Vec::new(),
            terrain: Vec::new(),
            blocks: Vec::new(),
            blocks_x: 0,
            blocks_y: 0,
            passable: FixedBitSet::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn needs_calculation(&self) -> bool {
        self.dirty
    }

    /// Called by any mutation that changes terrain categories or layer
    /// usability. Coalesces: the first query after a burst of mutations pays
    /// the recompute once.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn max_zone(&self) -> u16 {
        self.max_zone
    }

    pub fn blocks_x(&self) -> i32 {
        self.blocks_x
    }

    pub fn blocks_y(&self) -> i32 {
        self.blocks_y
    }

    pub fn block_in_bounds(&self, block: BlockCoord) -> bool {
        block.x >= 0 && block.x < self.blocks_x && block.y >= 0 && block.y < self.blocks_y
    }

    fn block_index(&self, block: BlockCoord) -> usize {
        debug_assert!(self.block_in_bounds(block));
        (block.y as usize) * (self.blocks_x as usize) + block.x as usize
    }

    pub fn block(&self, block: BlockCoord) -> Option<&ZoneBlock> {
        if self.block_in_bounds(block) {
            Some(&self.blocks[self.block_index(block)])
        } else {
            None
        }
    }

    /// Global effective zone of `zone` under the capability. Equality of
    /// effective zones is the admission control for expensive searches.
    pub fn effective_zone(&self, locomotors: &LocomotorSet, zone: u16) -> u16 {
        debug_assert!(!self.dirty, "effective_zone queried with stale zones");
        if zone == 0 {
            return 0;
        }
        if locomotors.surfaces.contains(SurfaceMask::AIR) {
            // Aircraft ignore ground connectivity entirely.
            return 1;
        }
        let z = zone as usize;
        if z >= self.terrain.len() {
            return zone;
        }
        if locomotors.surfaces.contains(SurfaceMask::GROUND | SurfaceMask::WATER) {
            self.ground_water[z]
        } else if locomotors.crusher {
            self.crusher[z]
        } else if locomotors.surfaces.contains(SurfaceMask::GROUND | SurfaceMask::CLIFF) {
            self.ground_cliff[z]
        } else if locomotors.surfaces.contains(SurfaceMask::GROUND | SurfaceMask::RUBBLE) {
            self.ground_rubble[z]
        } else {
            self.terrain[z]
        }
    }

    /// Block-confined effective zone, used by the hierarchical coarse pass.
    pub fn block_effective_zone(
        &self,
        locomotors: &LocomotorSet,
        block: BlockCoord,
        zone: u16,
    ) -> u16 {
        match self.block(block) {
            Some(b) => b.effective_zone(locomotors, zone),
            None => zone,
        }
    }

    // ------------------------------------------------------------------
    // Hierarchical passable-block mask
    // ------------------------------------------------------------------

    pub fn clear_passable_flags(&mut self) {
        self.passable.clear();
    }

    pub fn set_all_passable(&mut self) {
        self.passable.set_range(.., true);
    }

    pub fn set_passable(&mut self, block: BlockCoord) {
        if self.block_in_bounds(block) {
            let idx = self.block_index(block);
            self.passable.set(idx, true);
        }
    }

    pub fn is_passable(&self, block: BlockCoord) -> bool {
        if !self.block_in_bounds(block) {
            return false;
        }
        self.passable[self.block_index(block)]
    }

    // ------------------------------------------------------------------
    // Recompute
    // ------------------------------------------------------------------

    /// Full zone recompute: per-block flood fill of fine zones, bridge and
    /// wall layer zones, then the global and per-block equivalency tables.
    ///
    /// `is_fence` reports whether an obstacle cell is a fence (crushers
    /// treat fences as drivable).
    pub fn calculate_zones(
        &mut self,
        grid: &mut CellGrid,
        layers: &mut LayerStore,
        is_fence: &dyn Fn(CellCoord) -> bool,
    ) {
        let width = grid.width();
        let height = grid.height();
        self.blocks_x = (width + ZONE_BLOCK_SIZE - 1) / ZONE_BLOCK_SIZE;
        self.blocks_y = (height + ZONE_BLOCK_SIZE - 1) / ZONE_BLOCK_SIZE;
        self.blocks.clear();

        // Pass 1: fine zones, flood filled per block over equi-type cells.
        let mut next_zone: u16 = 1;
        let mut visited = FixedBitSet::with_capacity(grid.cell_count());
        let mut stack: Vec<CellCoord> = Vec::new();
        for by in 0..self.blocks_y {
            for bx in 0..self.blocks_x {
                let first = next_zone;
                let x0 = bx * ZONE_BLOCK_SIZE;
                let y0 = by * ZONE_BLOCK_SIZE;
                let x1 = (x0 + ZONE_BLOCK_SIZE).min(width);
                let y1 = (y0 + ZONE_BLOCK_SIZE).min(height);
                for y in y0..y1 {
                    for x in x0..x1 {
                        let seed = CellCoord::new(x, y);
                        let seed_idx = (y as usize) * (width as usize) + x as usize;
                        if visited[seed_idx] {
                            continue;
                        }
                        let seed_type = grid.get(seed).map(|c| c.cell_type).unwrap();
                        assert!(next_zone < MAX_ZONES, "zone index budget exceeded");
                        visited.set(seed_idx, true);
                        stack.push(seed);
                        while let Some(c) = stack.pop() {
                            grid.get_mut(c).unwrap().zone = next_zone;
                            for (dx, dy) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
                                let n = c.offset(dx, dy);
                                if n.x < x0 || n.x >= x1 || n.y < y0 || n.y >= y1 {
                                    continue;
                                }
                                let n_idx = (n.y as usize) * (width as usize) + n.x as usize;
                                if visited[n_idx] {
                                    continue;
                                }
                                if grid.get(n).map(|c| c.cell_type) == Some(seed_type) {
                                    visited.set(n_idx, true);
                                    stack.push(n);
                                }
                            }
                        }
                        next_zone += 1;
                    }
                }
                self.blocks.push(ZoneBlock::single(first, next_zone - first));
            }
        }

        // Pass 2: layer zones. Every cell of a healthy overlay shares one
        // zone; destroyed bridges contribute no zone at all.
        for layer in layers.iter_mut() {
            if layer.is_destroyed() {
                layer.set_zone(0);
            } else {
                assert!(next_zone < MAX_ZONES, "zone index budget exceeded");
                layer.set_zone(next_zone);
                next_zone += 1;
            }
            layer.apply_zone();
        }

        self.max_zone = next_zone - 1;

        // Pass 3: global equivalency tables.
        let zone_count = next_zone as usize;
        let mut uf_terrain = UnionFind::new(zone_count);
        let mut uf_ground_cliff = UnionFind::new(zone_count);
        let mut uf_ground_water = UnionFind::new(zone_count);
        let mut uf_ground_rubble = UnionFind::new(zone_count);
        let mut uf_crusher = UnionFind::new(zone_count);

        let crusher_pass = |t: CellType, c: CellCoord| -> bool {
            match t {
                CellType::Clear | CellType::Rubble => true,
                CellType::Obstacle => is_fence(c),
                _ => false,
            }
        };
        let pair_in = |a: CellType, b: CellType, x: CellType, y: CellType| -> bool {
            (a == x || a == y) && (b == x || b == y)
        };

        for y in 0..height {
            for x in 0..width {
                let c = CellCoord::new(x, y);
                let (tc, zc) = {
                    let cell = grid.get(c).unwrap();
                    (cell.cell_type, cell.zone)
                };
                for (dx, dy) in [(1, 0), (0, 1)] {
                    let n = c.offset(dx, dy);
                    let Some(cell_n) = grid.get(n) else { continue };
                    let (tn, zn) = (cell_n.cell_type, cell_n.zone);
                    if zc == zn {
                        continue;
                    }
                    if tc == tn {
                        uf_terrain.union(zc, zn);
                        uf_ground_cliff.union(zc, zn);
                        uf_ground_water.union(zc, zn);
                        uf_ground_rubble.union(zc, zn);
                        uf_crusher.union(zc, zn);
                        continue;
                    }
                    if pair_in(tc, tn, CellType::Clear, CellType::Cliff) {
                        uf_ground_cliff.union(zc, zn);
                    }
                    if pair_in(tc, tn, CellType::Clear, CellType::Water) {
                        uf_ground_water.union(zc, zn);
                    }
                    if pair_in(tc, tn, CellType::Clear, CellType::Rubble) {
                        uf_ground_rubble.union(zc, zn);
                    }
                    if crusher_pass(tc, c) && crusher_pass(tn, n) {
                        uf_crusher.union(zc, zn);
                    }
                }
            }
        }

        // Pass 4: overlay links. A healthy bridge joins the banks through
        // its connect cells; wall tops join the ground beneath their entry
        // cells. Links are applied to every table — the zone check must
        // over-approximate reachability, never under-approximate it.
        for layer in layers.iter() {
            if layer.is_destroyed() || layer.zone() == 0 {
                continue;
            }
            let link_cells: Vec<CellCoord> = if layer.id().is_bridge() {
                vec![layer.start_cell(), layer.end_cell()]
            } else {
                layer.member_coords()
            };
            for conn in link_cells {
                let Some(ground) = grid.get(conn) else { continue };
                let gz = ground.zone;
                if gz == 0 {
                    continue;
                }
                uf_terrain.union(layer.zone(), gz);
                uf_ground_cliff.union(layer.zone(), gz);
                uf_ground_water.union(layer.zone(), gz);
                uf_ground_rubble.union(layer.zone(), gz);
                uf_crusher.union(layer.zone(), gz);
            }
        }

        self.terrain = uf_terrain.into_table();
        self.ground_cliff = uf_ground_cliff.into_table();
        self.ground_water = uf_ground_water.into_table();
        self.ground_rubble = uf_ground_rubble.into_table();
        self.crusher = uf_crusher.into_table();

        // Pass 5: per-block equivalency arrays, confined to each block.
        for by in 0..self.blocks_y {
            for bx in 0..self.blocks_x {
                let block_idx = (by as usize) * (self.blocks_x as usize) + bx as usize;
                let (first, count) = {
                    let b = &self.blocks[block_idx];
                    (b.first_zone, b.num_zones)
                };
                if count <= 1 {
                    continue;
                }
                let x0 = bx * ZONE_BLOCK_SIZE;
                let y0 = by * ZONE_BLOCK_SIZE;
                let x1 = (x0 + ZONE_BLOCK_SIZE).min(width);
                let y1 = (y0 + ZONE_BLOCK_SIZE).min(height);

                let mut bf_ground_cliff = UnionFind::new(count as usize);
                let mut bf_ground_water = UnionFind::new(count as usize);
                let mut bf_ground_rubble = UnionFind::new(count as usize);
                let mut bf_crusher = UnionFind::new(count as usize);

                for y in y0..y1 {
                    for x in x0..x1 {
                        let c = CellCoord::new(x, y);
                        let (tc, zc) = {
                            let cell = grid.get(c).unwrap();
                            (cell.cell_type, cell.zone)
                        };
                        for (dx, dy) in [(1, 0), (0, 1)] {
                            let n = c.offset(dx, dy);
                            if n.x >= x1 || n.y >= y1 {
                                continue;
                            }
                            let cell_n = grid.get(n).unwrap();
                            let (tn, zn) = (cell_n.cell_type, cell_n.zone);
                            if zc == zn || tc == tn {
                                // Same fine zone, or separate same-type
                                // zones cannot exist adjacently in-block.
                                continue;
                            }
                            let lc = zc - first;
                            let ln = zn - first;
                            if pair_in(tc, tn, CellType::Clear, CellType::Cliff) {
                                bf_ground_cliff.union(lc, ln);
                            }
                            if pair_in(tc, tn, CellType::Clear, CellType::Water) {
                                bf_ground_water.union(lc, ln);
                            }
                            if pair_in(tc, tn, CellType::Clear, CellType::Rubble) {
                                bf_ground_rubble.union(lc, ln);
                            }
                            if crusher_pass(tc, c) && crusher_pass(tn, n) {
                                bf_crusher.union(lc, ln);
                            }
                        }
                    }
                }

                let globalize = |uf: UnionFind| -> Box<[u16]> {
                    uf.into_table().into_iter().map(|local| first + local).collect()
                };
                let b = &mut self.blocks[block_idx];
                b.ground_cliff = Some(globalize(bf_ground_cliff));
                b.ground_water = Some(globalize(bf_ground_water));
                b.ground_rubble = Some(globalize(bf_ground_rubble));
                b.crusher = Some(globalize(bf_crusher));
            }
        }

        // Bridge interaction marks, for hierarchical skirting.
        for layer in layers.iter() {
            if !layer.id().is_bridge() || layer.is_destroyed() {
                continue;
            }
            for coord in layer.member_coords() {
                let block = coord.block();
                if self.block_in_bounds(block) {
                    let idx = self.block_index(block);
                    self.blocks[idx].interacts_with_bridge = true;
                }
            }
        }

        self.passable = FixedBitSet::with_capacity(self.blocks.len());
        self.dirty = false;
    }
}

impl Default for ZoneManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nav::cell::CellType;

    fn no_fences(_: CellCoord) -> bool {
        false
    }

    /// 16×16 clear grid with a full-height water column at x in 6..10.
    fn river_grid() -> CellGrid {
        let mut grid = CellGrid::new(16, 16);
        for y in 0..16 {
            for x in 6..10 {
                grid.get_mut(CellCoord::new(x, y)).unwrap().cell_type = CellType::Water;
            }
        }
        grid
    }

    #[test]
    fn test_ground_zones_split_by_river_amphibious_joined() {
        let mut grid = river_grid();
        let mut layers = LayerStore::new();
        let mut zm = ZoneManager::new();
        zm.calculate_zones(&mut grid, &mut layers, &no_fences);

        let west = grid.get(CellCoord::new(2, 8)).unwrap().zone;
        let east = grid.get(CellCoord::new(13, 8)).unwrap().zone;

        let ground = LocomotorSet::ground();
        assert_ne!(
            zm.effective_zone(&ground, west),
            zm.effective_zone(&ground, east),
            "a river must separate ground zones"
        );

        let amphib = LocomotorSet::amphibious();
        assert_eq!(
            zm.effective_zone(&amphib, west),
            zm.effective_zone(&amphib, east),
            "amphibious units cross the river"
        );
    }

    #[test]
    fn test_zone_queries_stable_without_mutation() {
        let mut grid = river_grid();
        let mut layers = LayerStore::new();
        let mut zm = ZoneManager::new();
        zm.calculate_zones(&mut grid, &mut layers, &no_fences);

        let a = grid.get(CellCoord::new(1, 1)).unwrap().zone;
        let b = grid.get(CellCoord::new(14, 14)).unwrap().zone;
        let ground = LocomotorSet::ground();
        let first = zm.effective_zone(&ground, a) == zm.effective_zone(&ground, b);
        for _ in 0..4 {
            let again = zm.effective_zone(&ground, a) == zm.effective_zone(&ground, b);
            assert_eq!(first, again, "repeated queries with no mutator must agree");
        }
    }

    #[test]
    fn test_crusher_passes_fences() {
        let mut grid = CellGrid::new(8, 8);
        // A fence wall across the map at x == 4.
        for y in 0..8 {
            grid.get_mut(CellCoord::new(4, y)).unwrap().cell_type = CellType::Obstacle;
        }
        let mut layers = LayerStore::new();
        let mut zm = ZoneManager::new();
        let fences = |c: CellCoord| c.x == 4;
        zm.calculate_zones(&mut grid, &mut layers, &fences);

        let west = grid.get(CellCoord::new(1, 3)).unwrap().zone;
        let east = grid.get(CellCoord::new(6, 3)).unwrap().zone;

        let ground = LocomotorSet::ground();
        assert_ne!(zm.effective_zone(&ground, west), zm.effective_zone(&ground, east));

        let crusher = LocomotorSet::crusher();
        assert_eq!(
            zm.effective_zone(&crusher, west),
            zm.effective_zone(&crusher, east),
            "crushers drive through fence lines"
        );
    }

    #[test]
    fn test_block_effective_zone_confined_to_block() {
        // One block (8×8) split by a wall of obstacle down x == 3, open at
        // nothing — two clear regions inside the same block.
        let mut grid = CellGrid::new(8, 8);
        for y in 0..8 {
            grid.get_mut(CellCoord::new(3, y)).unwrap().cell_type = CellType::Obstacle;
        }
        let mut layers = LayerStore::new();
        let mut zm = ZoneManager::new();
        zm.calculate_zones(&mut grid, &mut layers, &no_fences);

        let west = grid.get(CellCoord::new(0, 0)).unwrap().zone;
        let east = grid.get(CellCoord::new(6, 0)).unwrap().zone;
        assert_ne!(west, east, "split block must yield distinct fine zones");

        let ground = LocomotorSet::ground();
        let block = BlockCoord { x: 0, y: 0 };
        assert_ne!(
            zm.block_effective_zone(&ground, block, west),
            zm.block_effective_zone(&ground, block, east),
            "no in-block route between the halves"
        );
    }

    #[test]
    fn test_aircraft_see_one_zone() {
        let mut grid = river_grid();
        let mut layers = LayerStore::new();
        let mut zm = ZoneManager::new();
        zm.calculate_zones(&mut grid, &mut layers, &no_fences);

        let west = grid.get(CellCoord::new(0, 0)).unwrap().zone;
        let east = grid.get(CellCoord::new(15, 15)).unwrap().zone;
        let air = LocomotorSet::aircraft();
        assert_eq!(zm.effective_zone(&air, west), zm.effective_zone(&air, east));
    }
}
