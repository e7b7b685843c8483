mod adjust;
mod astar;
mod cell;
mod components;
mod grid;
mod layers;
mod map;
mod occupancy;
mod path;
mod pathfinder;
mod persist;
mod queue;
mod systems;
mod types;
mod zones;

#[cfg(test)]
mod tests;

// Re-export public API
pub use adjust::ADJUST_SCAN_RADIUS;
pub use cell::{Cell, CellRef, CellSearchInfo, CellType, InfoId, Occupancy};
pub use components::{ComputedPath, NavGoal, NavUnit, PathRequest};
pub use grid::{CellGrid, CellLookup, TerrainQuery};
pub use layers::{LayerStore, PathfindLayer};
pub use map::{MoveContext, PathfindMap};
pub use path::{ClosestPointOnPath, Path, PathNode};
pub use pathfinder::{PathRequestJob, Pathfinder};
pub use persist::{
    load_snapshot, save_snapshot, snapshot_from_bytes, snapshot_to_bytes, NavSnapshot,
    SNAPSHOT_VERSION,
};
pub use types::{
    cell_size, BlockCoord, BridgeSpan, CellCoord, Direction, Footprint, LayerId, LocomotorSet,
    Mobility, NavObject, QueueReport, SurfaceMask, Team, WeaponRanges, CELL_SIZE, MAX_CELL_INFOS,
    MAX_CPOP, MAX_WALL_PIECES, PATHFIND_QUEUE_LEN, SEARCH_CELL_CAP, TICK_CELL_BUDGET,
    ZONE_BLOCK_SIZE,
};
pub use zones::{ZoneBlock, ZoneManager};

use bevy::prelude::*;

/// Wires the navigation core into a Bevy app: the [`Pathfinder`] resource,
/// the [`PathRequest`] message, and the per-tick queue processing on
/// `FixedUpdate`. Hosts that drive the core by hand need none of this —
/// every subsystem works as a plain struct.
pub struct NavigationPlugin;

impl Plugin for NavigationPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<Pathfinder>();
        app.add_message::<PathRequest>();
        app.add_systems(
            FixedUpdate,
            (systems::enqueue_path_requests, systems::process_pathfind_queue).chain(),
        );
    }
}
