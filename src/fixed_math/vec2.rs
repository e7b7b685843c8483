use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use super::FixedNum;

/// Planar world-space vector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixedVec2 {
    pub x: FixedNum,
    pub y: FixedNum,
}

impl FixedVec2 {
    pub const ZERO: Self = Self {
        x: FixedNum::ZERO,
        y: FixedNum::ZERO,
    };

    pub fn new(x: FixedNum, y: FixedNum) -> Self {
        Self { x, y }
    }

    pub fn from_f32(x: f32, y: f32) -> Self {
        Self::new(FixedNum::from_num(x), FixedNum::from_num(y))
    }

    /// Interop with the render side; never feeds back into simulation
    /// decisions.
    pub fn to_vec2(self) -> Vec2 {
        Vec2::new(self.x.to_num(), self.y.to_num())
    }

    pub fn dot(self, other: Self) -> FixedNum {
        self.x * other.x + self.y * other.y
    }

    /// z component of the 3-D cross product: the signed parallelogram area,
    /// used for side-of-line and across-axis tests.
    pub fn cross(self, other: Self) -> FixedNum {
        self.x * other.y - self.y * other.x
    }

    pub fn length_squared(self) -> FixedNum {
        self.dot(self)
    }

    pub fn length(self) -> FixedNum {
        match self.length_squared() {
            sq if sq == FixedNum::ZERO => FixedNum::ZERO,
            sq => sq.sqrt(),
        }
    }

    pub fn distance(self, other: Self) -> FixedNum {
        (other - self).length()
    }

    pub fn distance_squared(self, other: Self) -> FixedNum {
        (other - self).length_squared()
    }

    /// Unit vector in the same direction; the zero vector maps to itself.
    pub fn normalize_or_zero(self) -> Self {
        let len = self.length();
        if len == FixedNum::ZERO {
            Self::ZERO
        } else {
            self / len
        }
    }
}

impl_vec_ops!(FixedVec2 { x, y });

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_sign_tells_side_of_line() {
        let east = FixedVec2::from_f32(1.0, 0.0);
        let north = FixedVec2::from_f32(0.0, 1.0);
        assert!(east.cross(north) > FixedNum::ZERO);
        assert!(north.cross(east) < FixedNum::ZERO);
        assert_eq!(east.cross(east), FixedNum::ZERO);
    }

    #[test]
    fn test_normalize_or_zero_handles_zero() {
        assert_eq!(FixedVec2::ZERO.normalize_or_zero(), FixedVec2::ZERO);
        let v = FixedVec2::from_f32(3.0, 4.0).normalize_or_zero();
        let len: f32 = v.length().to_num();
        assert!((len - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_scalar_ops_are_componentwise() {
        let v = FixedVec2::from_f32(6.0, -2.0);
        let s = FixedNum::from_num(2.0);
        assert_eq!(v * s, FixedVec2::from_f32(12.0, -4.0));
        assert_eq!(v / s, FixedVec2::from_f32(3.0, -1.0));
        assert_eq!(-v, FixedVec2::from_f32(-6.0, 2.0));
    }
}
