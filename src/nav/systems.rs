use bevy::prelude::*;

use crate::profile_log;

use super::components::{ComputedPath, NavGoal, NavUnit, PathRequest};
use super::pathfinder::{PathRequestJob, Pathfinder};

/// Accept PathRequest messages into the bounded queue. Requests that do not
/// fit stay unserved; the sender may re-issue next tick.
pub(super) fn enqueue_path_requests(
    mut requests: MessageReader<PathRequest>,
    mut pathfinder: ResMut<Pathfinder>,
    mut commands: Commands,
) {
    for request in requests.read() {
        if pathfinder.queue_for_path(request.entity) {
            commands.entity(request.entity).insert(NavGoal { pos: request.goal });
        }
    }
}

/// Drain the pathfind queue for this tick. Each serviced unit gets a
/// ComputedPath component; units that vanished since queueing are skipped.
pub(super) fn process_pathfind_queue(
    mut pathfinder: ResMut<Pathfinder>,
    units: Query<(&NavUnit, &NavGoal)>,
    mut commands: Commands,
) {
    if pathfinder.queued_requests() == 0 {
        return;
    }
    let report = pathfinder.process_pathfind_queue(
        |id| {
            units.get(id).ok().map(|(unit, goal)| PathRequestJob {
                object: unit.to_nav_object(id),
                locomotors: unit.locomotors,
                goal: goal.pos,
            })
        },
        |id, path| {
            commands.entity(id).insert(ComputedPath(path));
        },
    );
    if report.remaining > 64 {
        warn!(
            "[PATHFIND] {} requests still queued after this tick's budget",
            report.remaining
        );
    }
    profile_log!(
        pathfinder.tick(),
        "[PATHFIND] tick {}: serviced {}, discarded {}, remaining {}",
        pathfinder.tick(),
        report.serviced.len(),
        report.discarded.len(),
        report.remaining
    );
}
