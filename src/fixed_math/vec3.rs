use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use super::{FixedNum, FixedVec2};

/// World-space position. `z` is height; navigation happens in the x/y plane
/// with z used only for layer selection and bridge surfaces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixedVec3 {
    pub x: FixedNum,
    pub y: FixedNum,
    pub z: FixedNum,
}

impl FixedVec3 {
    pub const ZERO: Self = Self {
        x: FixedNum::ZERO,
        y: FixedNum::ZERO,
        z: FixedNum::ZERO,
    };

    pub fn new(x: FixedNum, y: FixedNum, z: FixedNum) -> Self {
        Self { x, y, z }
    }

    pub fn from_f32(x: f32, y: f32, z: f32) -> Self {
        Self::new(
            FixedNum::from_num(x),
            FixedNum::from_num(y),
            FixedNum::from_num(z),
        )
    }

    /// Lift a planar position to the given height.
    pub fn from_xy(xy: FixedVec2, z: FixedNum) -> Self {
        Self::new(xy.x, xy.y, z)
    }

    /// The planar part, dropping height.
    pub fn xy(self) -> FixedVec2 {
        FixedVec2::new(self.x, self.y)
    }

    /// Interop with the render side; never feeds back into simulation
    /// decisions.
    pub fn to_vec3(self) -> Vec3 {
        Vec3::new(self.x.to_num(), self.y.to_num(), self.z.to_num())
    }

    /// Planar distance, ignoring height.
    pub fn distance_2d(self, other: Self) -> FixedNum {
        self.xy().distance(other.xy())
    }

    pub fn distance_squared_2d(self, other: Self) -> FixedNum {
        self.xy().distance_squared(other.xy())
    }
}

impl_vec_ops!(FixedVec3 { x, y, z });
