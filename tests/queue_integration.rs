//! Congestion scenario: a crowd of units all requesting paths in one tick,
//! amortized across ticks by the cell-allocation budget.

use std::collections::HashMap;

use bevy::prelude::Entity;
use kestrel::fixed_math::{FixedNum, FixedVec3};
use kestrel::nav::{
    Footprint, LayerId, LocomotorSet, NavObject, PathRequestJob, Pathfinder, Team, TerrainQuery,
    CELL_SIZE,
};

struct FlatTerrain;

impl TerrainQuery for FlatTerrain {
    fn ground_height(&self, _x: FixedNum, _y: FixedNum) -> FixedNum {
        FixedNum::ZERO
    }
    fn water_height(&self, _x: FixedNum, _y: FixedNum) -> Option<FixedNum> {
        None
    }
}

fn cell_center(x: i32, y: i32) -> FixedVec3 {
    FixedVec3::from_f32(x as f32 * CELL_SIZE + 5.0, y as f32 * CELL_SIZE + 5.0, 0.0)
}

fn crowd_unit(bits: u64) -> NavObject {
    NavObject {
        id: Entity::from_bits(bits),
        pos: cell_center(10, 10),
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
fn test_crowd_requests_amortize_across_ticks() {
    let mut pf = Pathfinder::new(32, 32);
    pf.new_map(32, 32, &FlatTerrain);
    // A tight budget so the tick visibly splits the work.
    pf.set_tick_cell_budget(8);

    let mut units: HashMap<Entity, NavObject> = HashMap::new();
    for bits in 1..=20u64 {
        let unit = crowd_unit(bits);
        assert!(pf.queue_for_path(unit.id), "queue accepts the whole crowd");
        units.insert(unit.id, unit);
    }

    let goal = cell_center(11, 11);
    let mut paths: Vec<Entity> = Vec::new();

    let mut ticks = 0;
    loop {
        ticks += 1;
        let report = pf.process_pathfind_queue(
            |id| {
                units.get(&id).map(|object| PathRequestJob {
                    object: object.clone(),
                    locomotors: object.locomotors,
                    goal,
                })
            },
            |id, path| {
                assert!(!path.is_empty());
                paths.push(id);
            },
        );
        assert!(
            report.discarded.is_empty(),
            "every unit in the crowd is live and resolvable"
        );
        if ticks == 1 {
            assert!(
                report.remaining > 0,
                "the first tick must stop at the budget, not service all 20"
            );
        }
        if report.remaining == 0 {
            break;
        }
        assert!(ticks < 20, "the queue must drain in a bounded number of ticks");
    }

    assert!(ticks >= 2, "the budget forces at least a second tick");
    assert_eq!(paths.len(), 20, "eventually every unit is serviced");

    // FIFO: serviced order matches request order.
    let expected: Vec<Entity> = (1..=20u64).map(Entity::from_bits).collect();
    assert_eq!(paths, expected, "the queue must be strictly first-in first-out");
}

#[test]
fn test_dead_units_are_discarded_at_dequeue() {
    let mut pf = Pathfinder::new(16, 16);
    pf.new_map(16, 16, &FlatTerrain);

    let live = crowd_unit(1);
    let dead = Entity::from_bits(2);
    pf.queue_for_path(dead);
    pf.queue_for_path(live.id);

    let goal = cell_center(12, 12);
    let mut serviced = Vec::new();
    let report = pf.process_pathfind_queue(
        |id| {
            (id == live.id).then(|| PathRequestJob {
                object: live.clone(),
                locomotors: live.locomotors,
                goal,
            })
        },
        |id, _| serviced.push(id),
    );

    assert_eq!(report.discarded.as_slice(), &[dead], "unknown ids are dropped");
    assert_eq!(serviced, vec![live.id]);
    assert_eq!(report.remaining, 0);
}

#[test]
fn test_queue_overflow_is_reported() {
    let mut pf = Pathfinder::new(8, 8);
    pf.new_map(8, 8, &FlatTerrain);
    for bits in 0..kestrel::nav::PATHFIND_QUEUE_LEN as u64 {
        assert!(pf.queue_for_path(Entity::from_bits(bits + 1)));
    }
    assert!(
        !pf.queue_for_path(Entity::from_bits(99_999)),
        "a full queue refuses new requests instead of evicting old ones"
    );
}
