//! Deterministic fixed-point mathematics.
//!
//! All world-space coordinates, heights, ranges and distances that affect
//! simulation outcomes use fixed-point arithmetic so that navigation
//! decisions are identical across platforms and architectures.

use fixed::types::I48F16;

pub use vec2::FixedVec2;
pub use vec3::FixedVec3;

/// Fixed-point number type used throughout the navigation core.
///
/// Uses I48F16 format: 48 bits for the integer part, 16 bits for the
/// fractional part. This provides a range of approximately ±140 trillion
/// with a precision of ~0.000015.
pub type FixedNum = I48F16;

/// Componentwise operator impls shared by the vector types. Scalar
/// multiplication and division are right-hand only (`v * s`, `v / s`).
macro_rules! impl_vec_ops {
    ($vec:ident { $($field:ident),+ }) => {
        impl core::ops::Add for $vec {
            type Output = Self;
            fn add(self, rhs: Self) -> Self {
                Self { $($field: self.$field + rhs.$field),+ }
            }
        }

        impl core::ops::Sub for $vec {
            type Output = Self;
            fn sub(self, rhs: Self) -> Self {
                Self { $($field: self.$field - rhs.$field),+ }
            }
        }

        impl core::ops::Neg for $vec {
            type Output = Self;
            fn neg(self) -> Self {
                Self { $($field: -self.$field),+ }
            }
        }

        impl core::ops::Mul<crate::fixed_math::FixedNum> for $vec {
            type Output = Self;
            fn mul(self, rhs: crate::fixed_math::FixedNum) -> Self {
                Self { $($field: self.$field * rhs),+ }
            }
        }

        impl core::ops::Div<crate::fixed_math::FixedNum> for $vec {
            type Output = Self;
            fn div(self, rhs: crate::fixed_math::FixedNum) -> Self {
                Self { $($field: self.$field / rhs),+ }
            }
        }
    };
}

mod vec2;
mod vec3;
