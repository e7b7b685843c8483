use bevy::prelude::*;
use rustc_hash::FxHashMap;

use crate::fixed_math::FixedVec3;

use super::cell::CellRef;
use super::map::PathfindMap;
use super::types::{CellCoord, LayerId, Mobility, NavObject, Team};

#[derive(Clone, Copy, Debug)]
struct PosStamp {
    cell: CellRef,
    diameter: i32,
    mobility: Mobility,
}

#[derive(Clone, Copy, Debug, Default)]
struct UnitCells {
    pos: Option<PosStamp>,
    goal: Option<CellRef>,
    aircraft_goal: Option<CellCoord>,
}

/// Tracks, per unit, which cell carries its presence and which its goal, so
/// searches can avoid live units. Unit motion code must call `update_pos` at
/// every grid-cell crossing and `update_goal` when orders change.
///
/// Invariant: each registered unit has exactly one position stamp and at
/// most one goal stamp on the map at any time.
#[derive(Default)]
pub struct OccupancyTracker {
    units: FxHashMap<Entity, UnitCells>,
    teams: FxHashMap<Entity, Team>,
}

impl OccupancyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all registrations. The caller is responsible for resetting the
    /// cells themselves (new-map and boundary resets rebuild them wholesale).
    pub fn reset(&mut self) {
        self.units.clear();
        self.teams.clear();
    }

    pub fn team_of(&self, id: Entity) -> Option<Team> {
        self.teams.get(&id).copied()
    }

    pub fn registered_units(&self) -> usize {
        self.units.len()
    }

    pub fn pos_cell_of(&self, id: Entity) -> Option<(LayerId, CellCoord)> {
        self.units
            .get(&id)
            .and_then(|u| u.pos)
            .map(|s| (s.cell.layer, s.cell.coord))
    }

    pub fn goal_cell_of(&self, id: Entity) -> Option<(LayerId, CellCoord)> {
        self.units.get(&id).and_then(|u| u.goal).map(|c| (c.layer, c.coord))
    }

    /// Record the unit's current position. Moving units stamp their center
    /// cell; stationary units stamp their footprint square as fixed.
    pub fn update_pos(&mut self, map: &mut PathfindMap, obj: &NavObject, mobility: Mobility) {
        self.remove_pos(map, obj.id);
        self.teams.insert(obj.id, obj.team);

        let lookup = map.world_to_cell(obj.pos.xy());
        let layer = if obj.layer == LayerId::INVALID { LayerId::GROUND } else { obj.layer };
        let cell_ref = CellRef::new(layer, lookup.coord);
        let diameter = match mobility {
            Mobility::Moving => 1,
            Mobility::Stationary => obj.cell_diameter(),
        };

        for coord in stamp_square(lookup.coord, diameter) {
            let Some(info_id) = map.ensure_info(layer, coord) else {
                warn!("[PATHFIND] pool exhausted stamping unit position");
                break;
            };
            map.pool.get_mut(info_id).pos_unit = Some(obj.id);
            if let Some(cell) = map.cell_mut(layer, coord) {
                cell.occupancy = match mobility {
                    Mobility::Moving => cell.occupancy.with_moving_unit(),
                    Mobility::Stationary => cell.occupancy.with_fixed_unit(),
                };
            }
        }

        let entry = self.units.entry(obj.id).or_default();
        entry.pos = Some(PosStamp { cell: cell_ref, diameter, mobility });
    }

    /// Remove the unit's position stamp.
    pub fn remove_pos(&mut self, map: &mut PathfindMap, id: Entity) {
        let Some(entry) = self.units.get_mut(&id) else { return };
        let Some(stamp) = entry.pos.take() else { return };
        for coord in stamp_square(stamp.cell.coord, stamp.diameter) {
            let owned = map
                .cell(stamp.cell.layer, coord)
                .filter(|c| c.has_info())
                .map(|c| map.pool.get(c.info).pos_unit == Some(id))
                .unwrap_or(false);
            if !owned {
                continue;
            }
            if let Some(cell) = map.cell_mut(stamp.cell.layer, coord) {
                cell.occupancy = cell.occupancy.without_unit();
                let info_id = cell.info;
                map.pool.get_mut(info_id).pos_unit = None;
            }
            map.release_info_if_unused(stamp.cell.layer, coord);
        }
        self.forget_if_empty(id);
    }

    /// Record the unit's goal cell.
    pub fn update_goal(
        &mut self,
        map: &mut PathfindMap,
        obj: &NavObject,
        goal: FixedVec3,
        layer: LayerId,
    ) {
        self.remove_goal(map, obj.id);
        self.teams.insert(obj.id, obj.team);

        let lookup = map.world_to_cell(goal.xy());
        let layer = if layer == LayerId::INVALID { LayerId::GROUND } else { layer };
        let Some(info_id) = map.ensure_info(layer, lookup.coord) else {
            warn!("[PATHFIND] pool exhausted stamping unit goal");
            return;
        };
        map.pool.get_mut(info_id).goal_unit = Some(obj.id);
        if let Some(cell) = map.cell_mut(layer, lookup.coord) {
            cell.occupancy = cell.occupancy.with_goal();
        }
        self.units.entry(obj.id).or_default().goal = Some(CellRef::new(layer, lookup.coord));
    }

    /// Remove the unit's goal stamp.
    pub fn remove_goal(&mut self, map: &mut PathfindMap, id: Entity) {
        let Some(entry) = self.units.get_mut(&id) else { return };
        let Some(goal) = entry.goal.take() else { return };
        let owned = map
            .cell(goal.layer, goal.coord)
            .filter(|c| c.has_info())
            .map(|c| map.pool.get(c.info).goal_unit == Some(id))
            .unwrap_or(false);
        if owned {
            if let Some(cell) = map.cell_mut(goal.layer, goal.coord) {
                cell.occupancy = cell.occupancy.without_goal();
                let info_id = cell.info;
                map.pool.get_mut(info_id).goal_unit = None;
            }
            map.release_info_if_unused(goal.layer, goal.coord);
        }
        self.forget_if_empty(id);
    }

    /// Claim a landing cell for an aircraft. Tracked apart from ground
    /// occupancy; aircraft ignore ground passability.
    pub fn update_aircraft_goal(&mut self, map: &mut PathfindMap, obj: &NavObject, goal: FixedVec3) {
        self.remove_aircraft_goal(map, obj.id);
        self.teams.insert(obj.id, obj.team);

        let lookup = map.world_to_cell(goal.xy());
        let Some(info_id) = map.ensure_info(LayerId::GROUND, lookup.coord) else {
            warn!("[PATHFIND] pool exhausted stamping aircraft goal");
            return;
        };
        map.pool.get_mut(info_id).goal_aircraft = Some(obj.id);
        if let Some(cell) = map.cell_mut(LayerId::GROUND, lookup.coord) {
            cell.aircraft_goal = true;
        }
        self.units.entry(obj.id).or_default().aircraft_goal = Some(lookup.coord);
    }

    pub fn remove_aircraft_goal(&mut self, map: &mut PathfindMap, id: Entity) {
        let Some(entry) = self.units.get_mut(&id) else { return };
        let Some(coord) = entry.aircraft_goal.take() else { return };
        let owned = map
            .cell(LayerId::GROUND, coord)
            .filter(|c| c.has_info())
            .map(|c| map.pool.get(c.info).goal_aircraft == Some(id))
            .unwrap_or(false);
        if owned {
            if let Some(cell) = map.cell_mut(LayerId::GROUND, coord) {
                cell.aircraft_goal = false;
                let info_id = cell.info;
                map.pool.get_mut(info_id).goal_aircraft = None;
            }
            map.release_info_if_unused(LayerId::GROUND, coord);
        }
        self.forget_if_empty(id);
    }

    /// Drop a unit entirely: position, goal, aircraft goal, team.
    pub fn remove_unit(&mut self, map: &mut PathfindMap, id: Entity) {
        self.remove_pos(map, id);
        self.remove_goal(map, id);
        self.remove_aircraft_goal(map, id);
        self.teams.remove(&id);
        self.units.remove(&id);
    }

    /// Units whose position stamp sits on the given layer. Used to notify
    /// riders when a bridge collapses.
    pub fn units_on_layer(&self, layer: LayerId) -> Vec<Entity> {
        self.units
            .iter()
            .filter_map(|(id, cells)| {
                cells.pos.filter(|s| s.cell.layer == layer).map(|_| *id)
            })
            .collect()
    }

    fn forget_if_empty(&mut self, id: Entity) {
        if let Some(entry) = self.units.get(&id) {
            if entry.pos.is_none() && entry.goal.is_none() && entry.aircraft_goal.is_none() {
                self.units.remove(&id);
            }
        }
    }
}

/// Cells of the diameter×diameter stamp square around a center cell.
fn stamp_square(center: CellCoord, diameter: i32) -> Vec<CellCoord> {
    if diameter <= 1 {
        return vec![center];
    }
    let lo = -(diameter - 1) / 2;
    let hi = diameter / 2;
    let mut out = Vec::with_capacity((diameter * diameter) as usize);
    for dy in lo..=hi {
        for dx in lo..=hi {
            out.push(center.offset(dx, dy));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nav::cell::Occupancy;
    use crate::nav::types::{Footprint, LocomotorSet};
    use crate::fixed_math::FixedNum;

    fn unit(bits: u64, x: f32, y: f32) -> NavObject {
        NavObject {
            id: Entity::from_bits(bits),
            pos: FixedVec3::from_f32(x, y, 0.0),
            layer: LayerId::GROUND,
            footprint: Footprint::Cylinder { radius: FixedNum::from_num(4.0) },
            team: Team(1),
            locomotors: LocomotorSet::ground(),
            alive: true,
            is_fence: false,
            is_transparent: false,
        }
    }

    #[test]
    fn test_update_pos_moves_the_single_stamp() {
        let mut map = PathfindMap::new(16, 16);
        let mut occ = OccupancyTracker::new();
        let mut obj = unit(1, 25.0, 25.0);

        occ.update_pos(&mut map, &obj, Mobility::Moving);
        let first = map.cell(LayerId::GROUND, CellCoord::new(2, 2)).unwrap();
        assert_eq!(first.occupancy, Occupancy::Moving);

        obj.pos = FixedVec3::from_f32(35.0, 25.0, 0.0);
        occ.update_pos(&mut map, &obj, Mobility::Moving);

        let old = map.cell(LayerId::GROUND, CellCoord::new(2, 2)).unwrap();
        assert_eq!(old.occupancy, Occupancy::None, "old cell must be vacated");
        assert!(!old.has_info(), "vacated cell returns its info to the pool");
        let new = map.cell(LayerId::GROUND, CellCoord::new(3, 2)).unwrap();
        assert_eq!(new.occupancy, Occupancy::Moving);
        assert_eq!(occ.pos_cell_of(obj.id), Some((LayerId::GROUND, CellCoord::new(3, 2))));
    }

    #[test]
    fn test_stationary_unit_stamps_footprint_square_as_fixed() {
        let mut map = PathfindMap::new(16, 16);
        let mut occ = OccupancyTracker::new();
        let obj = unit(2, 45.0, 45.0);

        occ.update_pos(&mut map, &obj, Mobility::Stationary);
        // Diameter 8/10 = 1 cell... radius 4 => diameter 0.8 cells, rounds
        // up to 1: only the center cell.
        assert_eq!(
            map.cell(LayerId::GROUND, CellCoord::new(4, 4)).unwrap().occupancy,
            Occupancy::Fixed
        );

        occ.remove_pos(&mut map, obj.id);
        assert_eq!(
            map.cell(LayerId::GROUND, CellCoord::new(4, 4)).unwrap().occupancy,
            Occupancy::None
        );
    }

    #[test]
    fn test_goal_and_position_coexist_in_one_cell() {
        let mut map = PathfindMap::new(16, 16);
        let mut occ = OccupancyTracker::new();
        let walker = unit(3, 55.0, 55.0);
        let chaser = unit(4, 15.0, 15.0);

        occ.update_pos(&mut map, &walker, Mobility::Moving);
        occ.update_goal(&mut map, &chaser, FixedVec3::from_f32(55.0, 55.0, 0.0), LayerId::GROUND);

        let cell = map.cell(LayerId::GROUND, CellCoord::new(5, 5)).unwrap();
        assert_eq!(cell.occupancy, Occupancy::MovingAndGoal);
        let info = map.pool().get(cell.info);
        assert_eq!(info.pos_unit, Some(walker.id));
        assert_eq!(info.goal_unit, Some(chaser.id));

        occ.remove_goal(&mut map, chaser.id);
        let cell = map.cell(LayerId::GROUND, CellCoord::new(5, 5)).unwrap();
        assert_eq!(cell.occupancy, Occupancy::Moving, "position survives goal removal");
    }

    #[test]
    fn test_aircraft_goal_is_independent_of_ground_occupancy() {
        let mut map = PathfindMap::new(16, 16);
        let mut occ = OccupancyTracker::new();
        let heli = unit(5, 10.0, 10.0);

        occ.update_aircraft_goal(&mut map, &heli, FixedVec3::from_f32(85.0, 85.0, 0.0));
        let cell = map.cell(LayerId::GROUND, CellCoord::new(8, 8)).unwrap();
        assert!(cell.aircraft_goal);
        assert_eq!(cell.occupancy, Occupancy::None);

        occ.remove_aircraft_goal(&mut map, heli.id);
        let cell = map.cell(LayerId::GROUND, CellCoord::new(8, 8)).unwrap();
        assert!(!cell.aircraft_goal);
    }
}
