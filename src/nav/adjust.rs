use bevy::prelude::*;

use crate::fixed_math::{FixedNum, FixedVec2, FixedVec3};

use super::cell::CellType;
use super::map::{MoveContext, PathfindMap};
use super::types::{CellCoord, LayerId, SurfaceMask, WeaponRanges};
use super::zones::ZoneManager;

/// How far out the destination spiral scans before giving up.
pub const ADJUST_SCAN_RADIUS: i32 = 12;

/// Cells of the ring at Chebyshev radius `r` around `center` (the center
/// itself for r == 0), in a stable clockwise order.
fn ring(center: CellCoord, r: i32) -> Vec<CellCoord> {
    if r == 0 {
        return vec![center];
    }
    let mut out = Vec::with_capacity((8 * r) as usize);
    for x in -r..=r {
        out.push(center.offset(x, r));
    }
    for y in (-r..r).rev() {
        out.push(center.offset(r, y));
    }
    for x in (-r..r).rev() {
        out.push(center.offset(x, -r));
    }
    for y in (-r + 1)..r {
        out.push(center.offset(-r, y));
    }
    out
}

fn claimed_as_other_goal(map: &PathfindMap, layer: LayerId, coord: CellCoord, unit: Option<Entity>) -> bool {
    let Some(cell) = map.cell(layer, coord) else { return false };
    if !cell.occupancy.has_goal() {
        return false;
    }
    if !cell.has_info() {
        return true;
    }
    let owner = map.pool().get(cell.info).goal_unit;
    owner.is_some() && owner != unit
}

/// Find, by outward spiral from `dest`, a cell that is (a) passable to the
/// unit's diameter, (b) zone-reachable from the unit's current cell, and
/// (c) not claimed as the goal of a different unit, then write that cell's
/// center back into `dest`. When several candidates share a ring the one
/// nearest the group destination (or the original dest) wins.
///
/// Returns false when no admissible cell exists within the scan radius; the
/// caller decides whether to retry with a larger tolerance.
#[allow(clippy::too_many_arguments)]
pub fn adjust_destination(
    map: &PathfindMap,
    zones: &ZoneManager,
    ctx: &MoveContext,
    diameter: i32,
    unit_cell: CellCoord,
    dest: &mut FixedVec3,
    group_dest: Option<FixedVec3>,
) -> bool {
    let unit_zone = match map.cell(LayerId::GROUND, unit_cell) {
        Some(c) => zones.effective_zone(&ctx.locomotors, c.zone),
        None => return false,
    };
    let lookup = map.world_to_cell(dest.xy());
    let target = group_dest.unwrap_or(*dest).xy();

    for r in 0..=ADJUST_SCAN_RADIUS {
        let mut best: Option<(FixedNum, CellCoord)> = None;
        for coord in ring(lookup.coord, r) {
            if !map.clear_cell_for_diameter(ctx, LayerId::GROUND, coord, diameter) {
                continue;
            }
            let Some(cell) = map.cell(LayerId::GROUND, coord) else { continue };
            if zones.effective_zone(&ctx.locomotors, cell.zone) != unit_zone {
                continue;
            }
            if claimed_as_other_goal(map, LayerId::GROUND, coord, ctx.mover) {
                continue;
            }
            let d = map.grid().cell_center(coord).distance_squared(target);
            if best.map(|(bd, _)| d < bd).unwrap_or(true) {
                best = Some((d, coord));
            }
        }
        if let Some((_, coord)) = best {
            *dest = map.cell_center_3d(LayerId::GROUND, coord);
            return true;
        }
    }
    false
}

/// Aircraft variant: the landing cell must not already carry an aircraft
/// goal, and must not be water unless the aircraft is amphibious. Ground
/// occupancy is ignored — aircraft land over it.
pub fn adjust_to_landing_destination(
    map: &PathfindMap,
    ctx: &MoveContext,
    dest: &mut FixedVec3,
) -> bool {
    let lookup = map.world_to_cell(dest.xy());
    let water_ok = ctx.locomotors.surfaces.contains(SurfaceMask::WATER);

    for r in 0..=ADJUST_SCAN_RADIUS {
        for coord in ring(lookup.coord, r) {
            let Some(cell) = map.cell(LayerId::GROUND, coord) else { continue };
            if cell.aircraft_goal {
                continue;
            }
            if cell.cell_type == CellType::Water && !water_ok {
                continue;
            }
            if matches!(cell.cell_type, CellType::Obstacle | CellType::Impassable) {
                continue;
            }
            *dest = map.cell_center_3d(LayerId::GROUND, coord);
            return true;
        }
    }
    false
}

/// Attack variant: a passable, unclaimed cell within the weapon envelope of
/// the target with a clear line of sight.
#[allow(clippy::too_many_arguments)]
pub fn adjust_target_destination(
    map: &PathfindMap,
    ctx: &MoveContext,
    diameter: i32,
    victim: Entity,
    victim_pos: FixedVec2,
    weapon: WeaponRanges,
    dest: &mut FixedVec3,
) -> bool {
    let lookup = map.world_to_cell(dest.xy());
    let mut ignore = vec![victim];
    if let Some(mover) = ctx.mover {
        ignore.push(mover);
    }

    for r in 0..=ADJUST_SCAN_RADIUS {
        for coord in ring(lookup.coord, r) {
            if !map.clear_cell_for_diameter(ctx, LayerId::GROUND, coord, diameter) {
                continue;
            }
            if claimed_as_other_goal(map, LayerId::GROUND, coord, ctx.mover) {
                continue;
            }
            let center = map.grid().cell_center(coord);
            let dist = center.distance(victim_pos);
            if dist < weapon.min_range || dist > weapon.max_range {
                continue;
            }
            if map.is_view_blocked_by_obstacle(center, victim_pos, &ignore) {
                continue;
            }
            *dest = map.cell_center_3d(LayerId::GROUND, coord);
            return true;
        }
    }
    false
}

/// Last-resort variant: tolerate cells claimed by other units, requiring
/// only passability and zone reachability. Used when every better cell is
/// taken.
pub fn adjust_to_possible_destination(
    map: &PathfindMap,
    zones: &ZoneManager,
    ctx: &MoveContext,
    diameter: i32,
    unit_cell: CellCoord,
    dest: &mut FixedVec3,
) -> bool {
    let unit_zone = match map.cell(LayerId::GROUND, unit_cell) {
        Some(c) => zones.effective_zone(&ctx.locomotors, c.zone),
        None => return false,
    };
    let lookup = map.world_to_cell(dest.xy());

    for r in 0..=ADJUST_SCAN_RADIUS {
        for coord in ring(lookup.coord, r) {
            if !map.clear_cell_for_diameter(ctx, LayerId::GROUND, coord, diameter) {
                continue;
            }
            let Some(cell) = map.cell(LayerId::GROUND, coord) else { continue };
            if zones.effective_zone(&ctx.locomotors, cell.zone) != unit_zone {
                continue;
            }
            *dest = map.cell_center_3d(LayerId::GROUND, coord);
            return true;
        }
    }
    false
}
