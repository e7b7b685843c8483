use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use super::types::{CellCoord, LayerId, MAX_CELL_INFOS};

/// Terrain category of one cell.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellType {
    /// Clear, unobstructed ground.
    #[default]
    Clear = 0,
    /// Water area.
    Water = 1,
    /// Steep altitude change.
    Cliff = 2,
    /// Remains of a destroyed structure; crushers and rubble-capable
    /// locomotors only.
    Rubble = 3,
    /// Covered by a structure's footprint.
    Obstacle = 4,
    /// Wall tops and other cells reachable only through explicit entry
    /// transitions (aircraft excepted).
    Impassable = 5,
}

/// Transient unit occupancy of one cell.
///
/// This is deliberately a tagged variant rather than a flag bank: "fixed and
/// moving at once" is unrepresentable. The occupant ids live in the pooled
/// [`CellSearchInfo`] record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Occupancy {
    #[default]
    None,
    /// A unit is heading to this cell.
    Goal,
    /// A unit is moving through this cell.
    Moving,
    /// A unit is parked in this cell.
    Fixed,
    /// A unit is moving through this cell and another unit has it as goal.
    MovingAndGoal,
}

impl Occupancy {
    pub fn has_goal(self) -> bool {
        matches!(self, Occupancy::Goal | Occupancy::MovingAndGoal)
    }

    pub fn has_unit(self) -> bool {
        matches!(self, Occupancy::Moving | Occupancy::Fixed | Occupancy::MovingAndGoal)
    }

    pub fn is_fixed(self) -> bool {
        self == Occupancy::Fixed
    }

    pub fn with_goal(self) -> Self {
        match self {
            Occupancy::None | Occupancy::Goal => Occupancy::Goal,
            Occupancy::Moving | Occupancy::MovingAndGoal => Occupancy::MovingAndGoal,
            Occupancy::Fixed => Occupancy::Fixed,
        }
    }

    pub fn without_goal(self) -> Self {
        match self {
            Occupancy::Goal => Occupancy::None,
            Occupancy::MovingAndGoal => Occupancy::Moving,
            other => other,
        }
    }

    pub fn with_moving_unit(self) -> Self {
        match self {
            Occupancy::None | Occupancy::Moving | Occupancy::Fixed => Occupancy::Moving,
            Occupancy::Goal | Occupancy::MovingAndGoal => Occupancy::MovingAndGoal,
        }
    }

    pub fn with_fixed_unit(self) -> Self {
        Occupancy::Fixed
    }

    pub fn without_unit(self) -> Self {
        match self {
            Occupancy::Moving | Occupancy::Fixed => Occupancy::None,
            Occupancy::MovingAndGoal => Occupancy::Goal,
            other => other,
        }
    }
}

/// Handle into the cell search-info pool. `NONE` is the sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InfoId(u16);

impl InfoId {
    pub const NONE: InfoId = InfoId(u16::MAX);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl Default for InfoId {
    fn default() -> Self {
        Self::NONE
    }
}

/// Identifies the cell an info record currently belongs to. Cells are often
/// reached through their info during list walks, so the reference carries
/// both layer and coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CellRef {
    pub layer: LayerId,
    pub coord: CellCoord,
}

impl CellRef {
    pub fn new(layer: LayerId, coord: CellCoord) -> Self {
        Self { layer, coord }
    }
}

/// One cell in the pathfinding grid (base or overlay). Categorizes the world
/// into idealized cellular states and doubles as the A* node.
#[derive(Clone, Copy, Debug, Default)]
pub struct Cell {
    pub cell_type: CellType,
    /// The terrain classification before any obstacle stamp, restored when
    /// a live structure is removed.
    pub natural_type: CellType,
    pub occupancy: Occupancy,
    /// Aircraft goal claims are tracked apart from ground occupancy because
    /// aircraft ignore ground passability.
    pub aircraft_goal: bool,
    /// Surrounded by obstacles on all four cardinal sides.
    pub pinched: bool,
    /// Which overlay owns this cell.
    pub layer: LayerId,
    /// If not INVALID, this cell is a transition point onto that layer.
    pub connect_layer: LayerId,
    /// Connectivity equivalence class; 0 until zones are computed.
    pub zone: u16,
    /// Search bookkeeping, allocated only while needed.
    pub info: InfoId,
}

impl Cell {
    pub fn has_info(&self) -> bool {
        !self.info.is_none()
    }

    pub fn is_obstacle(&self) -> bool {
        self.cell_type == CellType::Obstacle
    }
}

/// Pool-allocated A* bookkeeping plus the occupant ids of the owning cell.
///
/// A record is held while the cell is on a search list *or* carries any
/// occupant/obstacle id, and returns to the freelist when neither.
#[derive(Clone, Debug)]
pub struct CellSearchInfo {
    /// Intrusive links: open list when `open`, closed list (next only) when
    /// `closed`, freelist when `free`.
    pub next_open: InfoId,
    pub prev_open: InfoId,
    /// Predecessor in the current search, for path reconstruction.
    pub parent: InfoId,
    /// The owning cell.
    pub cell: CellRef,

    pub cost_so_far: u32,
    pub total_cost: u32,

    pub goal_unit: Option<Entity>,
    pub pos_unit: Option<Entity>,
    pub goal_aircraft: Option<Entity>,
    pub obstacle: Option<Entity>,

    pub open: bool,
    pub closed: bool,
    pub blocked_by_ally: bool,
    pub obstacle_is_fence: bool,
    pub obstacle_is_transparent: bool,
    free: bool,
}

impl CellSearchInfo {
    fn blank() -> Self {
        Self {
            next_open: InfoId::NONE,
            prev_open: InfoId::NONE,
            parent: InfoId::NONE,
            cell: CellRef::default(),
            cost_so_far: 0,
            total_cost: 0,
            goal_unit: None,
            pos_unit: None,
            goal_aircraft: None,
            obstacle: None,
            open: false,
            closed: false,
            blocked_by_ally: false,
            obstacle_is_fence: false,
            obstacle_is_transparent: false,
            free: true,
        }
    }

    /// True once nothing keeps this record alive.
    pub fn is_releasable(&self) -> bool {
        !self.open
            && !self.closed
            && self.goal_unit.is_none()
            && self.pos_unit.is_none()
            && self.goal_aircraft.is_none()
            && self.obstacle.is_none()
    }

    /// Clear search bookkeeping but keep occupant ids.
    pub fn clear_search_state(&mut self) {
        self.next_open = InfoId::NONE;
        self.prev_open = InfoId::NONE;
        self.parent = InfoId::NONE;
        self.cost_so_far = 0;
        self.total_cost = 0;
        self.open = false;
        self.closed = false;
        self.blocked_by_ally = false;
    }
}

/// Fixed-capacity arena of search-info records with an intrusive freelist.
///
/// The pool is allocated once at map load and shared by every search in a
/// tick; it never grows. Allocation failure is surfaced to the caller, which
/// treats it as search failure.
pub struct CellInfoPool {
    infos: Vec<CellSearchInfo>,
    first_free: InfoId,
    allocated: usize,
    high_water: usize,
}

impl CellInfoPool {
    pub fn new() -> Self {
        let mut pool = Self {
            infos: Vec::new(),
            first_free: InfoId::NONE,
            allocated: 0,
            high_water: 0,
        };
        pool.rebuild();
        pool
    }

    /// Drop every record and rebuild the freelist. Used on new-map and on
    /// snapshot load (searches never span either).
    pub fn rebuild(&mut self) {
        self.infos.clear();
        self.infos.resize_with(MAX_CELL_INFOS, CellSearchInfo::blank);
        // Chain the freelist through next_open, front to back.
        for i in 0..MAX_CELL_INFOS - 1 {
            self.infos[i].next_open = InfoId(i as u16 + 1);
        }
        self.infos[MAX_CELL_INFOS - 1].next_open = InfoId::NONE;
        self.first_free = InfoId(0);
        self.allocated = 0;
        self.high_water = 0;
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Take a record off the freelist for `cell`. Returns None when the pool
    /// is exhausted; the caller fails the current search.
    pub fn allocate(&mut self, cell: CellRef) -> Option<InfoId> {
        let id = self.first_free;
        if id.is_none() {
            warn!("[PATHFIND] search-info pool exhausted ({} records)", MAX_CELL_INFOS);
            return None;
        }
        let info = &mut self.infos[id.index()];
        debug_assert!(info.free, "freelist entry not marked free");
        self.first_free = info.next_open;
        *info = CellSearchInfo::blank();
        info.free = false;
        info.cell = cell;
        self.allocated += 1;
        self.high_water = self.high_water.max(self.allocated);
        Some(id)
    }

    /// Return a record to the freelist. The caller must already have
    /// unlinked it from any search list and cleared the owning cell's
    /// handle.
    pub fn release(&mut self, id: InfoId) {
        let first_free = self.first_free;
        let info = &mut self.infos[id.index()];
        debug_assert!(!info.free, "double release of search info");
        debug_assert!(
            info.is_releasable(),
            "released search info still referenced (open={} closed={})",
            info.open,
            info.closed
        );
        *info = CellSearchInfo::blank();
        info.next_open = first_free;
        self.first_free = id;
        self.allocated -= 1;
    }

    pub fn get(&self, id: InfoId) -> &CellSearchInfo {
        &self.infos[id.index()]
    }

    pub fn get_mut(&mut self, id: InfoId) -> &mut CellSearchInfo {
        &mut self.infos[id.index()]
    }

    // ------------------------------------------------------------------
    // Intrusive open list: doubly linked, ascending (total_cost,
    // cost_so_far). The head is searcher state, threaded through here.
    // ------------------------------------------------------------------

    /// Insert `id` into the sorted open list at `head`; returns the new
    /// head. The record must not be on either list.
    pub fn open_insert_sorted(&mut self, head: InfoId, id: InfoId) -> InfoId {
        {
            let info = self.get(id);
            debug_assert!(!info.open && !info.closed, "inserting listed info");
        }
        let (total, so_far) = {
            let info = self.get(id);
            (info.total_cost, info.cost_so_far)
        };

        // Find the first entry that should come after `id`.
        let mut prev = InfoId::NONE;
        let mut cur = head;
        while !cur.is_none() {
            let c = self.get(cur);
            if c.total_cost > total || (c.total_cost == total && c.cost_so_far > so_far) {
                break;
            }
            prev = cur;
            cur = c.next_open;
        }

        {
            let info = self.get_mut(id);
            info.open = true;
            info.prev_open = prev;
            info.next_open = cur;
        }
        if !cur.is_none() {
            self.get_mut(cur).prev_open = id;
        }
        if prev.is_none() {
            id
        } else {
            self.get_mut(prev).next_open = id;
            head
        }
    }

    /// Unlink `id` from the open list at `head`; returns the new head.
    pub fn open_remove(&mut self, head: InfoId, id: InfoId) -> InfoId {
        let (prev, next) = {
            let info = self.get_mut(id);
            debug_assert!(info.open, "removing non-open info from open list");
            info.open = false;
            let links = (info.prev_open, info.next_open);
            info.prev_open = InfoId::NONE;
            info.next_open = InfoId::NONE;
            links
        };
        if !prev.is_none() {
            self.get_mut(prev).next_open = next;
        }
        if !next.is_none() {
            self.get_mut(next).prev_open = prev;
        }
        if head == id {
            next
        } else {
            head
        }
    }

    /// Pop the cheapest entry; returns (new head, popped id).
    pub fn open_pop_cheapest(&mut self, head: InfoId) -> (InfoId, InfoId) {
        if head.is_none() {
            return (InfoId::NONE, InfoId::NONE);
        }
        let new_head = self.open_remove(head, head);
        (new_head, head)
    }

    // ------------------------------------------------------------------
    // Closed list: unordered, singly threaded through next_open; exists
    // only so the search can bulk-release at the end.
    // ------------------------------------------------------------------

    /// Push `id` onto the closed list at `head`; returns the new head.
    pub fn closed_push(&mut self, head: InfoId, id: InfoId) -> InfoId {
        {
            let info = self.get_mut(id);
            debug_assert!(!info.open && !info.closed, "closing a listed info");
            info.closed = true;
            info.next_open = head;
            info.prev_open = InfoId::NONE;
        }
        if !head.is_none() {
            self.get_mut(head).prev_open = id;
        }
        id
    }

    /// Unlink `id` from the closed list at `head`; returns the new head.
    pub fn closed_remove(&mut self, head: InfoId, id: InfoId) -> InfoId {
        let (prev, next) = {
            let info = self.get_mut(id);
            debug_assert!(info.closed, "removing non-closed info from closed list");
            info.closed = false;
            let links = (info.prev_open, info.next_open);
            info.prev_open = InfoId::NONE;
            info.next_open = InfoId::NONE;
            links
        };
        if !prev.is_none() {
            self.get_mut(prev).next_open = next;
        }
        if !next.is_none() {
            self.get_mut(next).prev_open = prev;
        }
        if head == id {
            next
        } else {
            head
        }
    }
}

impl Default for CellInfoPool {
    fn default() -> Self {
        Self::new()
    }
}
