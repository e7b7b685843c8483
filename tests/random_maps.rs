//! Randomized-map properties: the zone check is an exact over-approximation
//! of the searcher, returned paths are segment-passable, and obstacle
//! add/remove round-trips leave reachability untouched.

use bevy::prelude::Entity;
use kestrel::fixed_math::{FixedNum, FixedVec3};
use kestrel::nav::{
    Footprint, LayerId, LocomotorSet, NavObject, Pathfinder, SurfaceMask, Team, TerrainQuery,
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

const MAP: i32 = 32;

fn cell_center(x: i32, y: i32) -> FixedVec3 {
    FixedVec3::from_f32(x as f32 * CELL_SIZE + 5.0, y as f32 * CELL_SIZE + 5.0, 0.0)
}

fn unit(bits: u64, pos: FixedVec3) -> NavObject {
    NavObject {
        id: Entity::from_bits(bits),
        pos,
        layer: LayerId::GROUND,
        footprint: Footprint::Cylinder { radius: FixedNum::from_num(4.0) },
        team: Team(1),
        locomotors: LocomotorSet::ground(),
        alive: true,
        is_fence: false,
        is_transparent: false,
    }
}

/// Drop `count` random square structures on a fresh map; returns them so
/// the caller can remove them again.
fn random_structures(pf: &mut Pathfinder, rng: &mut fastrand::Rng, count: usize) -> Vec<NavObject> {
    let mut placed = Vec::new();
    for i in 0..count {
        let x = rng.i32(3..MAP - 3) as f32 * CELL_SIZE + 5.0;
        let y = rng.i32(3..MAP - 3) as f32 * CELL_SIZE + 5.0;
        let half = rng.i32(1..=3) as f32 * CELL_SIZE / 2.0;
        let obj = NavObject {
            id: Entity::from_bits(10_000 + i as u64),
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
        };
        pf.add_object_to_pathfind_map(&obj);
        placed.push(obj);
    }
    placed
}

/// Pick a random cell that is not inside any placed structure.
fn random_clear_cell(rng: &mut fastrand::Rng, placed: &[NavObject]) -> FixedVec3 {
    loop {
        let p = cell_center(rng.i32(0..MAP), rng.i32(0..MAP));
        if !placed.iter().any(|o| o.footprint.contains(o.pos, p.x, p.y)) {
            return p;
        }
    }
}

#[test]
fn test_zone_check_never_contradicts_the_searcher() {
    let mut rng = fastrand::Rng::with_seed(0x5eed_0001);
    for round in 0..12 {
        let mut pf = Pathfinder::new(MAP, MAP);
        pf.new_map(MAP, MAP, &FlatTerrain);
        let placed = random_structures(&mut pf, &mut rng, 6);

        for _ in 0..8 {
            let from = random_clear_cell(&mut rng, &placed);
            let to = random_clear_cell(&mut rng, &placed);
            let mover = unit(1, from);
            let locomotors = mover.locomotors;

            let quick = pf.quick_does_path_exist(&locomotors, from, to);
            let path = pf.find_path(&mover, &locomotors, from, to);
            if !quick {
                assert!(
                    path.is_none(),
                    "round {}: quick said unreachable but a path was found {:?} -> {:?}",
                    round,
                    from,
                    to
                );
            }
        }
    }
}

#[test]
fn test_returned_paths_are_segment_passable() {
    let mut rng = fastrand::Rng::with_seed(0x5eed_0002);
    for _ in 0..10 {
        let mut pf = Pathfinder::new(MAP, MAP);
        pf.new_map(MAP, MAP, &FlatTerrain);
        let placed = random_structures(&mut pf, &mut rng, 5);

        let from = random_clear_cell(&mut rng, &placed);
        let to = random_clear_cell(&mut rng, &placed);
        let mover = unit(1, from);
        let locomotors = mover.locomotors;

        if let Some(path) = pf.find_path(&mover, &locomotors, from, to) {
            let nodes: Vec<_> = path.nodes().to_vec();
            for pair in nodes.windows(2) {
                if pair[0].layer != pair[1].layer {
                    continue;
                }
                assert!(
                    pf.is_line_passable(
                        &mover,
                        SurfaceMask::GROUND,
                        pair[0].layer,
                        pair[0].pos,
                        pair[1].pos,
                        false,
                        true,
                    ),
                    "impassable segment {:?} -> {:?}",
                    pair[0].pos,
                    pair[1].pos
                );
            }
        }
    }
}

#[test]
fn test_obstacle_roundtrip_preserves_reachability_table() {
    let mut rng = fastrand::Rng::with_seed(0x5eed_0003);
    let mut pf = Pathfinder::new(MAP, MAP);
    pf.new_map(MAP, MAP, &FlatTerrain);
    let ground = LocomotorSet::ground();

    // Sample a reachability table on the empty map.
    let probes: Vec<(FixedVec3, FixedVec3)> = (0..10)
        .map(|_| {
            (
                cell_center(rng.i32(0..MAP), rng.i32(0..MAP)),
                cell_center(rng.i32(0..MAP), rng.i32(0..MAP)),
            )
        })
        .collect();
    let before: Vec<bool> = probes
        .iter()
        .map(|(a, b)| pf.quick_does_path_exist(&ground, *a, *b))
        .collect();

    let placed = random_structures(&mut pf, &mut rng, 7);
    for obj in &placed {
        pf.remove_object_from_pathfind_map(obj);
    }

    let after: Vec<bool> = probes
        .iter()
        .map(|(a, b)| pf.quick_does_path_exist(&ground, *a, *b))
        .collect();
    assert_eq!(
        before, after,
        "add followed by remove must restore the zone answers"
    );
}

#[test]
fn test_closest_point_on_path_lies_on_the_path() {
    let mut rng = fastrand::Rng::with_seed(0x5eed_0004);
    let mut pf = Pathfinder::new(MAP, MAP);
    pf.new_map(MAP, MAP, &FlatTerrain);
    let placed = random_structures(&mut pf, &mut rng, 4);

    let from = random_clear_cell(&mut rng, &placed);
    let to = random_clear_cell(&mut rng, &placed);
    let mover = unit(1, from);
    let locomotors = mover.locomotors;
    let Some(mut path) = pf.find_path(&mover, &locomotors, from, to) else {
        return;
    };

    for _ in 0..8 {
        let query = cell_center(rng.i32(0..MAP), rng.i32(0..MAP));
        let out = path.compute_point_on_path(query);

        // The answer must sit on some segment: its own closest-point query
        // projects to itself.
        let nodes: Vec<_> = path.nodes().to_vec();
        let p = out.pos_on_path;
        let mut min_d2 = FixedNum::MAX;
        for pair in nodes.windows(2) {
            let a = pair[0].pos.xy();
            let b = pair[1].pos.xy();
            let ab = b - a;
            let len2 = ab.length_squared();
            let t = if len2 == FixedNum::ZERO {
                FixedNum::ZERO
            } else {
                ((p.xy() - a).dot(ab) / len2).clamp(FixedNum::ZERO, FixedNum::from_num(1))
            };
            let proj = a + ab * t;
            min_d2 = min_d2.min((p.xy() - proj).length_squared());
        }
        if nodes.len() == 1 {
            min_d2 = (p.xy() - nodes[0].pos.xy()).length_squared();
        }
        assert!(
            min_d2 <= FixedNum::from_num(0.01),
            "closest point {:?} is {} off the path",
            p,
            min_d2
        );
    }
}
