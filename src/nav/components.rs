use bevy::prelude::*;

use crate::fixed_math::{FixedNum, FixedVec3};

use super::path::Path;
use super::types::{Footprint, LayerId, LocomotorSet, NavObject, Team};

/// Navigation state a host attaches to each mobile unit entity. The host
/// keeps `pos` and `layer` current; the queue-processing system reads them
/// when the unit's request comes up.
#[derive(Component, Clone, Debug)]
pub struct NavUnit {
    pub pos: FixedVec3,
    pub layer: LayerId,
    pub team: Team,
    pub locomotors: LocomotorSet,
    pub radius: FixedNum,
}

impl NavUnit {
    pub fn to_nav_object(&self, id: Entity) -> NavObject {
        NavObject {
            id,
            pos: self.pos,
            layer: self.layer,
            footprint: Footprint::Cylinder { radius: self.radius },
            team: self.team,
            locomotors: self.locomotors,
            alive: true,
            is_fence: false,
            is_transparent: false,
        }
    }
}

/// Where the unit wants to go; inserted when its path request is accepted.
#[derive(Component, Clone, Debug)]
pub struct NavGoal {
    pub pos: FixedVec3,
}

/// Ask the navigation core to path this unit. Requests are queued and
/// serviced across ticks under the cell-allocation budget.
#[derive(Event, Message, Debug, Clone)]
pub struct PathRequest {
    pub entity: Entity,
    pub goal: FixedVec3,
}

/// The path produced for a queued request, attached to the unit. Ownership
/// is the unit's; the pathfinder keeps nothing.
#[derive(Component, Clone, Debug)]
pub struct ComputedPath(pub Path);
