//! Snapshot persistence for the navigation core.
//!
//! The persisted subset is exactly what cannot be rebuilt: grid extent and
//! per-cell classification/occupancy tags/zone, active layers with their
//! destroyed flags, the wall-piece list, the pending request queue, and the
//! ignore-obstacle id. The search-info pool is never persisted — searches do
//! not span save boundaries — and the zone dirty flag is set on load so the
//! first query pays one recompute.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read};

use bevy::prelude::*;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::fixed_math::{FixedNum, FixedVec3};

use super::cell::{CellType, Occupancy};
use super::pathfinder::Pathfinder;
use super::types::{BridgeSpan, Footprint, LayerId};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Per-cell persisted state. Occupant *ids* are deliberately absent: the
/// pool is empty after load and units re-register through their own update
/// path, exactly as objects re-classify themselves on game load.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CellState {
    pub cell_type: CellType,
    pub natural_type: CellType,
    pub occupancy: Occupancy,
    pub aircraft_goal: bool,
    pub pinched: bool,
    pub connect_layer: LayerId,
    pub zone: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BridgeState {
    pub layer: LayerId,
    pub span: BridgeSpan,
    pub destroyed: bool,
}

#[derive(Serialize, Deserialize)]
pub struct NavSnapshot {
    pub version: u32,
    pub width: i32,
    pub height: i32,
    /// Row-major, `width * height` entries.
    pub cells: Vec<CellState>,
    pub heights: Vec<FixedNum>,
    pub bridges: Vec<BridgeState>,
    pub wall_pieces: Vec<(Entity, FixedVec3, Footprint)>,
    pub wall_height: FixedNum,
    pub queue: Vec<Entity>,
    pub ignore_obstacle: Option<Entity>,
}

pub fn save_snapshot(path: &str, pathfinder: &Pathfinder) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    let mut encoder = ZlibEncoder::new(writer, Compression::default());
    bincode::serialize_into(&mut encoder, &pathfinder.snapshot())?;
    encoder.finish()?;
    Ok(())
}

pub fn load_snapshot(path: &str) -> Result<Pathfinder, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut decoder = ZlibDecoder::new(reader);
    let snapshot: NavSnapshot = bincode::deserialize_from(&mut decoder)?;
    Ok(Pathfinder::from_snapshot(&snapshot))
}

/// In-memory variants, used by tests and by hosts with their own archive
/// container.
pub fn snapshot_to_bytes(pathfinder: &Pathfinder) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    bincode::serialize_into(&mut encoder, &pathfinder.snapshot())?;
    Ok(encoder.finish()?)
}

pub fn snapshot_from_bytes(bytes: &[u8]) -> Result<Pathfinder, Box<dyn std::error::Error>> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    let snapshot: NavSnapshot = bincode::deserialize(&raw)?;
    Ok(Pathfinder::from_snapshot(&snapshot))
}
