//! Ground-navigation core for a real-time strategy simulation.
//!
//! The crate answers, for a heterogeneous population of mobile units on a
//! tiled 2.5-D map with bridge and wall overlays, the per-tick questions of
//! unit movement: can this unit reach that location, what is a short valid
//! path there, where can it stand to attack a target, and which nearby cell
//! is free when the goal is congested.
//!
//! The core is plain structs — [`nav::Pathfinder`] owns the cell grid, the
//! overlay layers, the zone manager, and the request queue, and is fully
//! usable without an `App`. [`nav::NavigationPlugin`] wires it into Bevy's
//! `FixedUpdate` for hosts that want the per-tick queue drained for them.

pub mod fixed_math;
pub mod nav;

/// Conditionally log queue statistics when the perf_stats feature is enabled.
///
/// This macro logs a message every 100 ticks. When the perf_stats feature is
/// disabled it compiles to nothing - zero runtime cost. Even the arguments
/// are not evaluated.
#[macro_export]
#[cfg(feature = "perf_stats")]
macro_rules! profile_log {
    ($tick:expr, $($arg:tt)*) => {
        if $tick % 100 == 0 {
            bevy::prelude::info!($($arg)*);
        }
    };
}

#[macro_export]
#[cfg(not(feature = "perf_stats"))]
macro_rules! profile_log {
    ($tick:expr, $($arg:tt)*) => {};
}
