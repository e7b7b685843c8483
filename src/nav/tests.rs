//! Tests for search correctness: straight paths, obstacle diversion, zone
//! admission control, tunneling escape, and ally blocking.

use bevy::prelude::Entity;

use crate::fixed_math::{FixedNum, FixedVec3};

use super::*;

/// Flat featureless terrain.
pub struct FlatTerrain;

impl TerrainQuery for FlatTerrain {
    fn ground_height(&self, _x: FixedNum, _y: FixedNum) -> FixedNum {
        FixedNum::ZERO
    }
    fn water_height(&self, _x: FixedNum, _y: FixedNum) -> Option<FixedNum> {
        None
    }
}

pub fn flat_pathfinder(size: i32) -> Pathfinder {
    let mut pf = Pathfinder::new(size, size);
    pf.new_map(size, size, &FlatTerrain);
    pf
}

pub fn ground_unit(bits: u64, x: f32, y: f32) -> NavObject {
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

/// A square structure footprint centered on `pos`, `half` world units of
/// half-extent.
pub fn structure(bits: u64, x: f32, y: f32, half: f32) -> NavObject {
    NavObject {
        id: Entity::from_bits(bits),
        pos: FixedVec3::from_f32(x, y, 0.0),
        layer: LayerId::GROUND,
        footprint: Footprint::Rect {
            major_radius: FixedNum::from_num(half),
            minor_radius: FixedNum::from_num(half),
            angle: FixedNum::ZERO,
        },
        team: Team(2),
        locomotors: LocomotorSet::ground(),
        alive: true,
        is_fence: false,
        is_transparent: false,
    }
}

/// A one-cell-wide wall column at world x, spanning the whole map height.
fn vertical_wall(bits: u64, x: f32, map_world: f32) -> NavObject {
    NavObject {
        footprint: Footprint::Rect {
            major_radius: FixedNum::from_num(4.0),
            minor_radius: FixedNum::from_num(map_world),
            angle: FixedNum::ZERO,
        },
        ..structure(bits, x, map_world / 2.0, 0.0)
    }
}

/// A one-cell-tall wall row at world y, spanning the whole map width.
fn horizontal_wall(bits: u64, y: f32, map_world: f32) -> NavObject {
    NavObject {
        footprint: Footprint::Rect {
            major_radius: FixedNum::from_num(map_world),
            minor_radius: FixedNum::from_num(4.0),
            angle: FixedNum::ZERO,
        },
        ..structure(bits, map_world / 2.0, y, 0.0)
    }
}

fn cell_center_world(x: i32, y: i32) -> FixedVec3 {
    FixedVec3::from_f32(x as f32 * CELL_SIZE + 5.0, y as f32 * CELL_SIZE + 5.0, 0.0)
}

#[test]
fn test_straight_diagonal_path_has_diagonal_length() {
    let mut pf = flat_pathfinder(64);
    let unit = ground_unit(1, 55.0, 55.0);
    let locomotors = unit.locomotors;

    let from = cell_center_world(5, 5);
    let to = cell_center_world(50, 50);
    let path = pf.find_path(&unit, &locomotors, from, to).expect("open ground must path");

    let len: f32 = path.length_2d().to_num();
    let expected = 45.0 * CELL_SIZE * std::f32::consts::SQRT_2;
    assert!(
        (len - expected).abs() <= CELL_SIZE,
        "diagonal run should cost 45·√2 cells, got {} vs {}",
        len,
        expected
    );

    // The optimized path must hug the diagonal: every node within about one
    // cell of the x == y line.
    for node in path.nodes() {
        let x: f32 = node.pos.x.to_num();
        let y: f32 = node.pos.y.to_num();
        assert!(
            (x - y).abs() <= 1.5 * CELL_SIZE,
            "node ({}, {}) strays outside the straight-line skirt",
            x,
            y
        );
    }
}

#[test]
fn test_path_diverts_around_square_obstacle() {
    let mut pf = flat_pathfinder(64);
    // 10×10-cell structure centered at cell (30, 30).
    let building = structure(99, 305.0, 305.0, 50.0);
    pf.add_object_to_pathfind_map(&building);

    let unit = ground_unit(1, 55.0, 55.0);
    let locomotors = unit.locomotors;
    let from = cell_center_world(5, 5);
    let to = cell_center_world(50, 50);

    assert!(
        pf.quick_does_path_exist(&locomotors, from, to),
        "the obstacle does not disconnect the map"
    );
    let path = pf.find_path(&unit, &locomotors, from, to).expect("path around the obstacle");

    let diverted = path.nodes().iter().any(|n| {
        let x: f32 = n.pos.x.to_num();
        let y: f32 = n.pos.y.to_num();
        (x - y).abs() > CELL_SIZE
    });
    assert!(diverted, "path must leave the blocked diagonal");

    // No node may sit inside the footprint.
    for node in path.nodes() {
        assert!(
            !building.footprint.contains(building.pos, node.pos.x, node.pos.y),
            "path node inside the obstacle footprint"
        );
    }
}

#[test]
fn test_add_then_remove_object_restores_terrain_and_reachability() {
    let mut pf = flat_pathfinder(32);
    let locomotors = LocomotorSet::ground();
    let a = cell_center_world(1, 15);
    let b = cell_center_world(30, 15);

    assert!(pf.quick_does_path_exist(&locomotors, a, b));

    let wall = vertical_wall(50, 155.0, 320.0);
    pf.add_object_to_pathfind_map(&wall);
    assert!(!pf.quick_does_path_exist(&locomotors, a, b));

    pf.remove_object_from_pathfind_map(&wall);
    assert!(
        pf.quick_does_path_exist(&locomotors, a, b),
        "removal must restore terrain categories and zone reachability"
    );
    let cell = pf.map().cell(LayerId::GROUND, CellCoord::new(15, 15)).unwrap();
    assert_eq!(cell.cell_type, CellType::Clear);
}

#[test]
fn test_dead_structure_leaves_rubble_for_crushers_only() {
    let mut pf = flat_pathfinder(32);
    let mut wall = vertical_wall(51, 155.0, 320.0);
    pf.add_object_to_pathfind_map(&wall);
    wall.alive = false;
    pf.remove_object_from_pathfind_map(&wall);

    let cell = pf.map().cell(LayerId::GROUND, CellCoord::new(15, 15)).unwrap();
    assert_eq!(cell.cell_type, CellType::Rubble, "dead structures leave rubble");

    let ground = LocomotorSet::ground();
    let crusher = LocomotorSet::crusher();
    let a = cell_center_world(1, 15);
    let b = cell_center_world(30, 15);
    assert!(!pf.quick_does_path_exist(&ground, a, b), "rubble stops plain ground units");
    assert!(pf.quick_does_path_exist(&crusher, a, b), "crushers drive over rubble");
}

#[test]
fn test_quick_no_path_means_find_path_null() {
    let mut pf = flat_pathfinder(32);
    let wall = vertical_wall(52, 155.0, 320.0);
    pf.add_object_to_pathfind_map(&wall);

    let unit = ground_unit(1, 15.0, 155.0);
    let locomotors = unit.locomotors;
    let from = cell_center_world(1, 15);
    let to = cell_center_world(30, 15);

    assert!(!pf.quick_does_path_exist(&locomotors, from, to));
    assert!(
        pf.find_path(&unit, &locomotors, from, to).is_none(),
        "quick_does_path_exist == false must imply a null path"
    );
}

#[test]
fn test_find_closest_path_degrades_and_rewrites_goal() {
    let mut pf = flat_pathfinder(32);
    let wall = vertical_wall(53, 155.0, 320.0);
    pf.add_object_to_pathfind_map(&wall);

    let unit = ground_unit(1, 15.0, 155.0);
    let locomotors = unit.locomotors;
    let from = cell_center_world(1, 15);
    let goal = cell_center_world(30, 15);
    let mut to = goal;

    let path = pf
        .find_closest_path(&unit, &locomotors, from, &mut to, false, 1.0, false)
        .expect("closest variant must degrade, not fail");
    assert!(to != goal, "the unreachable goal must be rewritten");
    let end = path.last_node().unwrap().pos;
    let end_x: f32 = end.x.to_num();
    assert!(
        end_x < 151.0,
        "the degraded path must end on the near side of the wall, got x={}",
        end_x
    );
}

#[test]
fn test_from_equals_to_returns_single_node_path() {
    let mut pf = flat_pathfinder(16);
    let unit = ground_unit(1, 85.0, 85.0);
    let locomotors = unit.locomotors;
    let spot = cell_center_world(8, 8);
    let path = pf.find_path(&unit, &locomotors, spot, spot).expect("trivial path");
    assert_eq!(path.len(), 1, "from == to yields a one-node path");
}

#[test]
fn test_out_of_bounds_goal_fails_cleanly() {
    let mut pf = flat_pathfinder(16);
    let unit = ground_unit(1, 85.0, 85.0);
    let locomotors = unit.locomotors;
    let path = pf.find_path(
        &unit,
        &locomotors,
        cell_center_world(8, 8),
        FixedVec3::from_f32(5000.0, 5000.0, 0.0),
    );
    assert!(path.is_none(), "out-of-map goals fail rather than wrap");
}

#[test]
fn test_ignore_obstacle_makes_it_invisible() {
    let mut pf = flat_pathfinder(32);
    let wall = vertical_wall(54, 155.0, 320.0);
    pf.add_object_to_pathfind_map(&wall);

    let unit = ground_unit(1, 15.0, 155.0);
    let locomotors = unit.locomotors;
    let from = cell_center_world(1, 15);
    let to = cell_center_world(30, 15);

    assert!(pf.find_path(&unit, &locomotors, from, to).is_none());

    pf.set_ignore_obstacle_id(Some(wall.id));
    // Zones still see the wall; use the degraded variant, which searches.
    let mut adjusted = to;
    let path = pf.find_closest_path(&unit, &locomotors, from, &mut adjusted, false, 1.0, false);
    assert!(path.is_some());
    assert!(
        adjusted.x > FixedNum::from_num(151.0),
        "with the obstacle ignored the search walks through it"
    );
    pf.set_ignore_obstacle_id(None);
}

#[test]
fn test_tunneling_start_inside_obstacle_escapes() {
    let mut pf = flat_pathfinder(32);
    // A structure exactly one cell wide at (10, 10).
    let post = structure(55, 105.0, 105.0, 4.0);
    pf.add_object_to_pathfind_map(&post);

    let mut unit = ground_unit(1, 105.0, 105.0);
    unit.pos = cell_center_world(10, 10);
    let locomotors = unit.locomotors;
    let from = cell_center_world(10, 10);
    let to = cell_center_world(20, 10);

    let mut goal = to;
    let path = pf
        .find_closest_path(&unit, &locomotors, from, &mut goal, false, 1.0, false)
        .expect("a unit caught in an obstacle must escape outward");
    assert!(path.len() >= 2);
    let second = path.nodes()[1].pos;
    let cell = pf
        .map()
        .cell(LayerId::GROUND, pf.map().world_to_cell(second.xy()).coord)
        .unwrap();
    assert_eq!(
        cell.cell_type,
        CellType::Clear,
        "the second node must already be out in the clear"
    );
}

#[test]
fn test_allied_mover_blocks_unless_clearing_allowed() {
    let mut pf = flat_pathfinder(32);
    // Corridor along y == 5: full-width walls above and below.
    pf.add_object_to_pathfind_map(&horizontal_wall(60, 65.0, 320.0));
    pf.add_object_to_pathfind_map(&horizontal_wall(61, 45.0, 320.0));

    let ally = ground_unit(2, 155.0, 55.0);
    pf.update_pos(&ally, Mobility::Moving);

    let unit = ground_unit(1, 55.0, 55.0);
    let locomotors = unit.locomotors;
    let from = cell_center_world(5, 5);
    let to = cell_center_world(25, 5);

    assert!(
        pf.find_path(&unit, &locomotors, from, to).is_none(),
        "without clearing permission the allied mover is a wall"
    );

    let mut goal = to;
    let path = pf
        .find_closest_path(&unit, &locomotors, from, &mut goal, false, 1.0, true)
        .expect("with clearing permission the path goes through");
    assert!(
        path.blocked_by_ally(),
        "the returned path must report that an ally needs to move"
    );
    let blockers = pf.units_blocking_path(&unit, &path);
    assert!(blockers.contains(&ally.id));
}

#[test]
fn test_long_path_uses_hierarchical_bound_and_succeeds() {
    let mut pf = flat_pathfinder(96);
    // A long wall with a gap near the top forces a real detour.
    let wall = NavObject {
        footprint: Footprint::Rect {
            major_radius: FixedNum::from_num(4.0),
            minor_radius: FixedNum::from_num(350.0),
            angle: FixedNum::ZERO,
        },
        ..structure(70, 485.0, 355.0, 0.0)
    };
    pf.add_object_to_pathfind_map(&wall);

    let unit = ground_unit(1, 55.0, 55.0);
    let locomotors = unit.locomotors;
    let from = cell_center_world(5, 5);
    let to = cell_center_world(90, 5);

    let path = pf.find_path(&unit, &locomotors, from, to).expect("detour exists");
    let clears_gap = path.nodes().iter().any(|n| n.pos.y > FixedNum::from_num(700.0));
    assert!(clears_gap, "path must route around the wall end");
}

#[test]
fn test_adjust_destination_avoids_claimed_cells() {
    let mut pf = flat_pathfinder(32);
    let sitter = ground_unit(7, 155.0, 155.0);
    pf.update_goal(&sitter, cell_center_world(15, 15), LayerId::GROUND);

    let unit = ground_unit(1, 55.0, 155.0);
    let locomotors = unit.locomotors;
    let mut dest = cell_center_world(15, 15);
    assert!(pf.adjust_destination(&unit, &locomotors, &mut dest, None));
    let landed = pf.map().world_to_cell(dest.xy()).coord;
    assert_ne!(
        landed,
        CellCoord::new(15, 15),
        "the claimed goal cell must be passed over"
    );
    assert!(
        landed.chebyshev_distance(CellCoord::new(15, 15)) <= 2,
        "the replacement stays nearby"
    );
}

#[test]
fn test_safe_path_leaves_repulsor_circles() {
    let mut pf = flat_pathfinder(48);
    let unit = ground_unit(1, 235.0, 235.0);
    let locomotors = unit.locomotors;
    let danger = cell_center_world(23, 23);

    let path = pf
        .find_safe_path(
            &unit,
            &locomotors,
            cell_center_world(23, 23),
            danger,
            danger,
            FixedNum::from_num(60.0),
        )
        .expect("open ground always has a safe spot");
    let end = path.last_node().unwrap().pos;
    assert!(
        end.distance_2d(danger) > FixedNum::from_num(60.0),
        "the safe path must end outside the repulsor radius"
    );
}

#[test]
fn test_patch_path_rejoins_original() {
    let mut pf = flat_pathfinder(48);
    let unit = ground_unit(1, 55.0, 55.0);
    let locomotors = unit.locomotors;

    let from = cell_center_world(5, 5);
    let to = cell_center_world(40, 5);
    let original = pf.find_path(&unit, &locomotors, from, to).expect("baseline path");

    // The unit got shoved off the path.
    let mut shoved = unit.clone();
    shoved.pos = cell_center_world(12, 12);

    let patched = pf
        .patch_path(&shoved, &locomotors, &original, false)
        .expect("patch must reconnect to the surviving path");
    let end = patched.last_node().unwrap().pos;
    assert_eq!(end, original.last_node().unwrap().pos, "patched path keeps the goal");
    let start = patched.first_node().unwrap().pos;
    assert_eq!(start, shoved.pos, "patched path starts at the unit");
}

#[test]
fn test_attack_path_stops_inside_weapon_range() {
    let mut pf = flat_pathfinder(48);
    let unit = ground_unit(1, 55.0, 55.0);
    let locomotors = unit.locomotors;
    let victim = ground_unit(9, 355.0, 355.0);

    let weapon = WeaponRanges::new(FixedNum::ZERO, FixedNum::from_num(80.0));
    let path = pf
        .find_attack_path(&unit, &locomotors, cell_center_world(5, 5), victim.id, victim.pos, weapon)
        .expect("attack stance exists in the open");
    let end = path.last_node().unwrap().pos;
    let dist = end.distance_2d(victim.pos);
    assert!(
        dist <= FixedNum::from_num(80.0),
        "attack path must end inside max range, ended {} away",
        dist
    );
}

#[test]
fn test_snapshot_roundtrip_preserves_cells_and_queue() {
    let mut pf = flat_pathfinder(24);
    let wall = vertical_wall(80, 115.0, 240.0);
    pf.add_object_to_pathfind_map(&wall);
    pf.queue_for_path(Entity::from_bits(41));
    pf.queue_for_path(Entity::from_bits(42));
    // Classified zones should survive the trip (dirty flag notwithstanding).
    let _ = pf.quick_does_path_exist(
        &LocomotorSet::ground(),
        cell_center_world(1, 1),
        cell_center_world(2, 2),
    );

    let bytes = snapshot_to_bytes(&pf).expect("serialize");
    let mut restored = snapshot_from_bytes(&bytes).expect("deserialize");

    assert_eq!(restored.queued_requests(), 2, "pending queue survives");
    let cell = restored.map().cell(LayerId::GROUND, CellCoord::new(11, 12)).unwrap();
    assert_eq!(cell.cell_type, CellType::Obstacle, "obstacle stamps survive");
    assert!(
        !restored.map().cell(LayerId::GROUND, CellCoord::new(11, 12)).unwrap().has_info(),
        "the search-info pool is empty after load"
    );

    // Zone queries still work (forced recompute on first use).
    let ground = LocomotorSet::ground();
    assert!(!restored.quick_does_path_exist(
        &ground,
        cell_center_world(1, 12),
        cell_center_world(22, 12)
    ));
}

#[test]
fn test_zone_recompute_coalesces_across_mutations() {
    let mut pf = flat_pathfinder(32);
    // Prime the zones.
    let _ = pf.quick_does_path_exist(
        &LocomotorSet::ground(),
        cell_center_world(1, 1),
        cell_center_world(2, 2),
    );
    assert!(!pf.zones().needs_calculation());

    // A burst of construction: each mutation only marks dirty.
    for i in 0..4 {
        pf.add_object_to_pathfind_map(&structure(200 + i, 55.0 + 30.0 * i as f32, 155.0, 12.0));
        assert!(
            pf.zones().needs_calculation(),
            "mutation {} must leave the dirty flag set, not recompute",
            i
        );
    }

    // First query after the burst pays the recompute once.
    let _ = pf.quick_does_path_exist(
        &LocomotorSet::ground(),
        cell_center_world(1, 1),
        cell_center_world(30, 30),
    );
    assert!(!pf.zones().needs_calculation());
}

#[test]
fn test_self_wall_stamp_is_reversible() {
    let mut pf = flat_pathfinder(32);
    let me = structure(210, 155.0, 155.0, 25.0);

    pf.create_a_wall_from_my_footprint(&me);
    let stamped = pf.map().cell(LayerId::GROUND, CellCoord::new(15, 15)).unwrap();
    assert_eq!(stamped.cell_type, CellType::Obstacle);

    pf.remove_wall_from_my_footprint(&me);
    let restored = pf.map().cell(LayerId::GROUND, CellCoord::new(15, 15)).unwrap();
    assert_eq!(
        restored.cell_type,
        CellType::Clear,
        "the temporary self-stamp must restore the classified terrain"
    );
    assert!(!restored.has_info(), "and release the info record");
}

#[test]
fn test_hostile_goal_surcharge_steers_between_equal_slits() {
    let mut pf = flat_pathfinder(32);
    // A wall at x == 15 with two one-cell slits, at y == 5 and y == 9,
    // symmetric around the start/goal row y == 7.
    let slab = |bits: u64, y_center: f32, y_half: f32| NavObject {
        footprint: Footprint::Rect {
            major_radius: FixedNum::from_num(4.0),
            minor_radius: FixedNum::from_num(y_half),
            angle: FixedNum::ZERO,
        },
        ..structure(bits, 155.0, y_center, 0.0)
    };
    pf.add_object_to_pathfind_map(&slab(220, 20.0, 25.0));
    pf.add_object_to_pathfind_map(&slab(221, 70.0, 15.0));
    pf.add_object_to_pathfind_map(&slab(222, 210.0, 110.0));

    // A rival claims the south slit as its goal.
    let rival = ground_unit(30, 255.0, 55.0);
    pf.update_goal(&rival, cell_center_world(15, 5), LayerId::GROUND);

    let unit = ground_unit(1, 55.0, 75.0);
    let locomotors = unit.locomotors;
    let path = pf
        .find_path(&unit, &locomotors, cell_center_world(5, 7), cell_center_world(25, 7))
        .expect("both slits are open");

    // The route must rise to the clean north slit (y == 9) and never dip to
    // the claimed south one (y == 5); optimization may trim the exact slit
    // node but cannot move the crossing.
    let cells: Vec<CellCoord> = path
        .nodes()
        .iter()
        .map(|n| pf.map().world_to_cell(n.pos.xy()).coord)
        .collect();
    assert!(
        cells.iter().any(|c| c.y >= 9),
        "the clean north slit should win the tie, path went {:?}",
        cells
    );
    assert!(
        cells.iter().all(|c| c.y > 5),
        "the claimed south slit carries a surcharge, path went {:?}",
        cells
    );
}

#[test]
fn test_set_active_boundary_resets_and_reclassifies() {
    let mut pf = flat_pathfinder(16);
    let squatter = ground_unit(40, 75.0, 75.0);
    pf.update_pos(&squatter, Mobility::Moving);
    pf.queue_for_path(squatter.id);

    pf.set_active_boundary(24, 24, &FlatTerrain);

    assert_eq!(pf.map().grid().width(), 24);
    assert_eq!(pf.queued_requests(), 0, "in-flight requests are dropped");
    let cell = pf.map().cell(LayerId::GROUND, CellCoord::new(7, 7)).unwrap();
    assert_eq!(
        cell.occupancy,
        Occupancy::None,
        "occupancy registrations do not survive the barrier"
    );
    assert!(pf.zones().needs_calculation());
}

#[test]
fn test_snap_and_goal_position_land_on_cell_centers() {
    let mut pf = flat_pathfinder(16);
    let snapped = pf.snap_position(FixedVec3::from_f32(47.0, 82.0, 0.0));
    assert_eq!(snapped.x, FixedNum::from_num(45.0));
    assert_eq!(snapped.y, FixedNum::from_num(85.0));

    let walker = ground_unit(21, 15.0, 15.0);
    pf.update_goal(&walker, FixedVec3::from_f32(92.0, 31.0, 0.0), LayerId::GROUND);
    let goal = pf.goal_position(walker.id).expect("registered goal");
    assert_eq!(goal.x, FixedNum::from_num(95.0));
    assert_eq!(goal.y, FixedNum::from_num(35.0));
    assert_eq!(pf.goal_position(Entity::from_bits(999)), None);
}

#[test]
fn test_flight_dist_to_goal_counts_down() {
    let pf = flat_pathfinder(32);
    let mut heli = ground_unit(1, 55.0, 55.0);
    heli.locomotors = LocomotorSet::aircraft();
    let to = FixedVec3::from_f32(255.0, 55.0, 30.0);
    let mut path = pf.aircraft_path(&heli, to).unwrap();

    let (at_start, goal) = path.compute_flight_dist_to_goal(FixedVec3::from_f32(55.0, 55.0, 30.0));
    assert_eq!(goal, to);
    assert_eq!(at_start, FixedNum::from_num(200.0));

    let (midway, _) = path.compute_flight_dist_to_goal(FixedVec3::from_f32(155.0, 55.0, 30.0));
    assert_eq!(midway, FixedNum::from_num(100.0));

    let (past, _) = path.compute_flight_dist_to_goal(FixedVec3::from_f32(400.0, 55.0, 30.0));
    assert_eq!(past, FixedNum::ZERO, "past the goal the remaining distance is zero");
}

#[test]
fn test_snapshot_save_load_save_is_byte_identical() {
    let mut pf = flat_pathfinder(24);
    pf.add_object_to_pathfind_map(&vertical_wall(85, 115.0, 240.0));
    let span = BridgeSpan {
        id: Entity::from_bits(2000),
        start: FixedVec3::from_f32(45.0, 125.0, 8.0),
        end: FixedVec3::from_f32(95.0, 125.0, 8.0),
        half_width: FixedNum::from_num(10.0),
    };
    let layer = pf.add_bridge(&span).expect("bridge slot");
    pf.change_bridge_state(layer, false);
    pf.queue_for_path(Entity::from_bits(61));
    pf.set_ignore_obstacle_id(Some(Entity::from_bits(85)));

    let first = snapshot_to_bytes(&pf).expect("first save");
    let restored = snapshot_from_bytes(&first).expect("load");
    let second = snapshot_to_bytes(&restored).expect("second save");
    assert_eq!(
        first, second,
        "save, load, save must produce identical bytes for the persisted subset"
    );
}

#[test]
fn test_pool_exhaustion_inside_a_search_yields_null_path() {
    let mut pf = flat_pathfinder(16);
    pf.debug_exhaust_info_pool();

    let unit = ground_unit(1, 55.0, 55.0);
    let locomotors = unit.locomotors;
    let exact = pf.find_path(&unit, &locomotors, cell_center_world(5, 5), cell_center_world(10, 10));
    assert!(exact.is_none(), "an exhausted pool must fail the search, not panic");

    let mut to = cell_center_world(10, 10);
    let closest = pf.find_closest_path(
        &unit,
        &locomotors,
        cell_center_world(5, 5),
        &mut to,
        false,
        1.0,
        false,
    );
    assert!(
        closest.is_none(),
        "with no expandable cell the degraded variant has nothing to return either"
    );
}

#[test]
fn test_snapshot_shape_is_stable() {
    let mut pf = flat_pathfinder(8);
    pf.queue_for_path(Entity::from_bits(3));
    let value = serde_json::to_value(pf.snapshot()).expect("snapshot serializes");
    assert_eq!(value["version"], SNAPSHOT_VERSION);
    assert_eq!(value["width"], 8);
    assert_eq!(value["height"], 8);
    assert_eq!(value["cells"].as_array().unwrap().len(), 64);
    assert_eq!(value["queue"].as_array().unwrap().len(), 1);
}

#[test]
fn test_aircraft_path_is_direct() {
    let pf = flat_pathfinder(32);
    let mut heli = ground_unit(1, 55.0, 55.0);
    heli.locomotors = LocomotorSet::aircraft();
    let to = FixedVec3::from_f32(255.0, 305.0, 40.0);
    let path = pf.aircraft_path(&heli, to).expect("flight path");
    assert_eq!(path.len(), 2, "aircraft fly point to point");
    assert_eq!(path.last_node().unwrap().pos, to);
}

#[test]
fn test_ground_path_width_respects_gaps() {
    let mut pf = flat_pathfinder(32);
    // Two slabs over x cells 11..20, leaving a one-cell slit at y == 11.
    let slab = |bits: u64, y_center: f32, y_half: f32| NavObject {
        footprint: Footprint::Rect {
            major_radius: FixedNum::from_num(45.0),
            minor_radius: FixedNum::from_num(y_half),
            angle: FixedNum::ZERO,
        },
        ..structure(bits, 155.0, y_center, 0.0)
    };
    pf.add_object_to_pathfind_map(&slab(90, 50.0, 55.0));
    pf.add_object_to_pathfind_map(&slab(91, 220.0, 100.0));

    let from = cell_center_world(3, 11);
    let to = cell_center_world(28, 11);

    assert!(
        pf.find_ground_path(from, to, 1, false).is_some(),
        "a single-cell column fits through the slit"
    );
    assert!(
        pf.find_ground_path(from, to, 6, false).is_none(),
        "a six-wide column cannot squeeze through a one-cell slit"
    );
}

#[test]
fn test_allies_near_destination_reports_parked_friends() {
    let mut pf = flat_pathfinder(24);
    let friend = ground_unit(5, 150.0, 150.0);
    pf.update_pos(&friend, Mobility::Stationary);

    let mover = ground_unit(1, 55.0, 55.0);
    let spotted = pf.allies_near_destination(&mover, cell_center_world(15, 15));
    assert_eq!(spotted, vec![friend.id]);

    let elsewhere = pf.allies_near_destination(&mover, cell_center_world(2, 2));
    assert!(elsewhere.is_empty());
}

#[test]
#[should_panic(expected = "re-entered")]
fn test_reentrant_query_asserts() {
    let mut pf = flat_pathfinder(8);
    let unit = ground_unit(1, 15.0, 15.0);
    let locomotors = unit.locomotors;
    pf.debug_force_search_guard();
    let _ = pf.find_path(&unit, &locomotors, cell_center_world(1, 1), cell_center_world(2, 2));
}
