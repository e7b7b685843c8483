use bevy::prelude::*;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::fixed_math::{FixedNum, FixedVec3};

/// Width of one pathfind cell in world units.
///
/// The grid pitch is on the order of a small vehicle's diameter; every
/// world-to-cell conversion in the crate divides by this value.
pub const CELL_SIZE: f32 = 10.0;

/// Zone blocks are squares of this many cells on a side.
///
/// Blocks are the atom of the hierarchical tier: the coarse search runs over
/// blocks, and per-block equivalency tables answer "same zone within this
/// block" without touching individual cells.
pub const ZONE_BLOCK_SIZE: i32 = 8;

/// Zone indices are 14-bit; a recompute that would exceed this asserts.
pub const MAX_ZONES: u16 = 1 << 14;

/// Capacity of the pathfind request queue (ring buffer of unit ids).
pub const PATHFIND_QUEUE_LEN: usize = 512;

/// Fixed capacity of the cell search-info pool.
///
/// Sized for the configured maximum concurrent open+closed list plus every
/// cell that carries occupancy or obstacle ids. Exhaustion mid-search fails
/// that search; it never reallocates.
pub const MAX_CELL_INFOS: usize = 32_768;

/// Cumulative search-info allocations permitted per tick across all queued
/// searches. The queue stops draining for the tick once this is spent.
pub const TICK_CELL_BUDGET: u32 = 5_000;

/// Hard cap on infos allocated by a single search. Exceeding it is treated
/// as "no path"; the closest-reachable fallback applies.
pub const SEARCH_CELL_CAP: u32 = 2_500;

/// At most this many wall pieces may be registered at once.
pub const MAX_WALL_PIECES: usize = 128;

/// How close a position must be in z to interact with an overlay layer.
/// Map-scope, not per-unit.
pub const LAYER_Z_CLOSE_ENOUGH: f32 = 10.0;

/// A cached closest-point-on-path answer is returned at most this many
/// times for an unchanged query position before being recomputed. It is
/// occasionally possible to get stuck otherwise.
pub const MAX_CPOP: u8 = 20;

/// Height rise across one cell beyond which the cell classifies as cliff.
pub const MAX_WALKABLE_RISE: f32 = 9.8;

/// A* step cost for an axis-aligned move, in tenth-of-cell units.
pub const COST_ORTHOGONAL: u32 = 10;
/// A* step cost for a diagonal move (≈ 10·√2).
pub const COST_DIAGONAL: u32 = 14;
/// Surcharge for stepping into a cell held by an allied moving unit when
/// the caller permits ally clearing.
pub const COST_ALLY_SURCHARGE: u32 = 30;
/// Surcharge for stepping into a cell that is another unit's goal.
pub const COST_HOSTILE_GOAL_SURCHARGE: u32 = 20;
/// Surcharge for entering a pinched cell (obstacles on all four sides).
pub const COST_PINCHED_SURCHARGE: u32 = 10;

/// Fine searches whose endpoints are further apart than this many cells run
/// the block-level coarse pass first and bound themselves to its result.
pub const HIERARCHICAL_DISTANCE_CELLS: i32 = 2 * ZONE_BLOCK_SIZE;

pub fn cell_size() -> FixedNum {
    FixedNum::from_num(CELL_SIZE)
}

/// Integer cell coordinate on the pathfind grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
}

impl CellCoord {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self { x: self.x + dx, y: self.y + dy }
    }

    pub fn step(self, dir: Direction) -> Self {
        let (dx, dy) = dir.delta();
        self.offset(dx, dy)
    }

    /// The zone block containing this cell. Valid for clipped (non-negative)
    /// coordinates only.
    pub fn block(self) -> BlockCoord {
        BlockCoord {
            x: self.x / ZONE_BLOCK_SIZE,
            y: self.y / ZONE_BLOCK_SIZE,
        }
    }

    /// Octile-distance cost to `other` in the same units as the per-step
    /// costs, so a perfectly straight path estimates exactly the sum of its
    /// step costs.
    pub fn octile_cost(self, other: CellCoord) -> u32 {
        let dx = (self.x - other.x).unsigned_abs();
        let dy = (self.y - other.y).unsigned_abs();
        let (lo, hi) = if dx < dy { (dx, dy) } else { (dy, dx) };
        COST_DIAGONAL * lo + COST_ORTHOGONAL * (hi - lo)
    }

    pub fn chebyshev_distance(self, other: CellCoord) -> i32 {
        (self.x - other.x).abs().max((self.y - other.y).abs())
    }
}

/// Coordinate of a zone block (cell coordinate divided by the block size).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockCoord {
    pub x: i32,
    pub y: i32,
}

/// Directions for neighbor generation (cardinal + diagonal).
///
/// The repr(u8) ensures zero-cost conversion to array indices.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    North = 0,
    South = 1,
    East = 2,
    West = 3,
    NorthEast = 4,
    NorthWest = 5,
    SouthEast = 6,
    SouthWest = 7,
}

impl Direction {
    /// All eight directions (cardinal + diagonal).
    pub const ALL: [Direction; 8] = [
        Direction::North,
        Direction::South,
        Direction::East,
        Direction::West,
        Direction::NorthEast,
        Direction::NorthWest,
        Direction::SouthEast,
        Direction::SouthWest,
    ];

    /// The four cardinal directions.
    pub const CARDINAL: [Direction; 4] = [
        Direction::North,
        Direction::South,
        Direction::East,
        Direction::West,
    ];

    #[inline]
    pub fn as_index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::North => (0, 1),
            Direction::South => (0, -1),
            Direction::East => (1, 0),
            Direction::West => (-1, 0),
            Direction::NorthEast => (1, 1),
            Direction::NorthWest => (-1, 1),
            Direction::SouthEast => (1, -1),
            Direction::SouthWest => (-1, -1),
        }
    }

    #[inline]
    pub fn is_diagonal(self) -> bool {
        (self as u8) >= 4
    }

    /// The per-step base cost of moving in this direction.
    #[inline]
    pub fn step_cost(self) -> u32 {
        if self.is_diagonal() {
            COST_DIAGONAL
        } else {
            COST_ORTHOGONAL
        }
    }

    /// The two cardinal components of a diagonal move, used by the
    /// anti-corner-cutting rule.
    pub fn components(self) -> Option<(Direction, Direction)> {
        match self {
            Direction::NorthEast => Some((Direction::North, Direction::East)),
            Direction::NorthWest => Some((Direction::North, Direction::West)),
            Direction::SouthEast => Some((Direction::South, Direction::East)),
            Direction::SouthWest => Some((Direction::South, Direction::West)),
            _ => None,
        }
    }
}

bitflags! {
    /// Surface categories a locomotor may traverse.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SurfaceMask: u8 {
        const GROUND = 0x01;
        const WATER  = 0x02;
        const CLIFF  = 0x04;
        const AIR    = 0x08;
        const RUBBLE = 0x10;
        /// Wall-access locomotion: may step from a wall-entry cell onto the
        /// wall top.
        const WALL   = 0x20;
    }
}

/// Per-unit locomotion capability descriptor: acceptable surfaces plus the
/// crusher flag. Consumed by every passability query; never owned by the
/// navigation core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LocomotorSet {
    pub surfaces: SurfaceMask,
    /// Crushers drive through fences, and over rubble regardless of mask.
    pub crusher: bool,
}

impl LocomotorSet {
    pub fn new(surfaces: SurfaceMask, crusher: bool) -> Self {
        Self { surfaces, crusher }
    }

    pub fn ground() -> Self {
        Self::new(SurfaceMask::GROUND, false)
    }

    pub fn crusher() -> Self {
        Self::new(SurfaceMask::GROUND, true)
    }

    pub fn amphibious() -> Self {
        Self::new(SurfaceMask::GROUND | SurfaceMask::WATER, false)
    }

    pub fn aircraft() -> Self {
        Self::new(SurfaceMask::AIR, false)
    }

    pub fn wall_climber() -> Self {
        Self::new(SurfaceMask::GROUND | SurfaceMask::WALL, false)
    }

    pub fn is_airborne(&self) -> bool {
        self.surfaces.contains(SurfaceMask::AIR)
    }
}

/// Team identifier. Two units are allied iff their teams are equal; the
/// host game maps its alliance matrix onto shared team values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Team(pub u16);

/// Identifier of a cell layer: ground, the wall layer, or one bridge layer.
///
/// Fits in 4 bits; a map supports at most [`LayerId::LAST_BRIDGE`] bridges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub u8);

impl LayerId {
    pub const INVALID: LayerId = LayerId(0);
    pub const GROUND: LayerId = LayerId(1);
    /// The wall-top overlay.
    pub const WALL: LayerId = LayerId(2);
    pub const FIRST_BRIDGE: LayerId = LayerId(3);
    pub const LAST_BRIDGE: LayerId = LayerId(15);

    pub fn is_bridge(self) -> bool {
        self >= Self::FIRST_BRIDGE && self <= Self::LAST_BRIDGE
    }

    pub fn is_overlay(self) -> bool {
        self != Self::INVALID && self != Self::GROUND
    }
}

/// Weapon envelope the attack-path search positions inside of.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WeaponRanges {
    pub min_range: FixedNum,
    pub max_range: FixedNum,
}

impl WeaponRanges {
    pub fn new(min_range: FixedNum, max_range: FixedNum) -> Self {
        Self { min_range, max_range }
    }
}

/// Ground footprint of a map object.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Footprint {
    /// Axis pair of half-extents, rotated by `angle` radians about the
    /// object position.
    Rect {
        major_radius: FixedNum,
        minor_radius: FixedNum,
        angle: FixedNum,
    },
    Cylinder { radius: FixedNum },
}

impl Footprint {
    /// Radius of the bounding circle, used to clip the stamping scan.
    pub fn bounding_radius(&self) -> FixedNum {
        match *self {
            Footprint::Rect { major_radius, minor_radius, .. } => {
                // Conservative: box diagonal.
                (major_radius * major_radius + minor_radius * minor_radius).sqrt()
            }
            Footprint::Cylinder { radius } => radius,
        }
    }

    /// True if the world point lies inside the footprint centered at
    /// `center`.
    pub fn contains(&self, center: FixedVec3, point_x: FixedNum, point_y: FixedNum) -> bool {
        let dx = point_x - center.x;
        let dy = point_y - center.y;
        match *self {
            Footprint::Rect { major_radius, minor_radius, angle } => {
                // Rotate the point into the footprint frame.
                let cos = fixed_cos(angle);
                let sin = fixed_sin(angle);
                let local_x = dx * cos + dy * sin;
                let local_y = -dx * sin + dy * cos;
                local_x.abs() <= major_radius && local_y.abs() <= minor_radius
            }
            Footprint::Cylinder { radius } => dx * dx + dy * dy <= radius * radius,
        }
    }
}

/// Fixed-point cosine via a short Taylor series, adequate for footprint
/// stamping (structures rotate in coarse increments).
fn fixed_cos(angle: FixedNum) -> FixedNum {
    let a = wrap_angle(angle);
    let a2 = a * a;
    let one = FixedNum::from_num(1);
    one - a2 / FixedNum::from_num(2) + (a2 * a2) / FixedNum::from_num(24)
}

fn fixed_sin(angle: FixedNum) -> FixedNum {
    let a = wrap_angle(angle);
    let a2 = a * a;
    a - (a * a2) / FixedNum::from_num(6) + (a * a2 * a2) / FixedNum::from_num(120)
}

fn wrap_angle(angle: FixedNum) -> FixedNum {
    let pi = FixedNum::from_num(std::f32::consts::PI);
    let two_pi = pi * FixedNum::from_num(2);
    let mut a = angle;
    while a > pi {
        a -= two_pi;
    }
    while a < -pi {
        a += two_pi;
    }
    a
}

/// Whether a unit is in motion or parked; stationary units stamp their full
/// footprint square, moving units their center cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mobility {
    Moving,
    Stationary,
}

/// Snapshot of an externally-owned map object, borrowed for the duration of
/// one call. The navigation core retains only the `id`.
#[derive(Clone, Debug)]
pub struct NavObject {
    pub id: Entity,
    pub pos: FixedVec3,
    pub layer: LayerId,
    pub footprint: Footprint,
    pub team: Team,
    pub locomotors: LocomotorSet,
    pub alive: bool,
    /// Fences block ground units but crushers drive through them.
    pub is_fence: bool,
    /// Transparent structures never block attack line-of-sight.
    pub is_transparent: bool,
}

impl NavObject {
    /// Footprint expressed in whole cells; at least 1.
    pub fn cell_diameter(&self) -> i32 {
        let d = self.footprint.bounding_radius() * FixedNum::from_num(2);
        let cells: i32 = (d / cell_size()).ceil().to_num();
        cells.max(1)
    }
}

/// Rectangular span of a bridge, as read from map data: the two short-edge
/// midpoints in world space plus the half-width of the deck.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeSpan {
    pub id: Entity,
    pub start: FixedVec3,
    pub end: FixedVec3,
    pub half_width: FixedNum,
}

/// Result of draining one pathfind request: which units got paths, which
/// were discarded, and which remain queued for next tick.
#[derive(Debug, Default)]
pub struct QueueReport {
    pub serviced: SmallVec<[Entity; 8]>,
    pub discarded: SmallVec<[Entity; 8]>,
    pub remaining: usize,
}
