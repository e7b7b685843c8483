use bevy::prelude::*;

use crate::fixed_math::{FixedNum, FixedVec2, FixedVec3};

use super::cell::{Cell, CellType};
use super::grid::{CellGrid, TerrainQuery};
use super::types::{
    cell_size, BridgeSpan, CellCoord, Footprint, LayerId, LAYER_Z_CLOSE_ENOUGH,
};

/// A rectangular sub-grid overlaid on the base map: one bridge deck or the
/// wall-top layer. Layers own their cell storage; they never share cells
/// with the base grid.
pub struct PathfindLayer {
    layer: LayerId,
    /// Index window into base-grid coordinates.
    x_origin: i32,
    y_origin: i32,
    width: i32,
    height: i32,
    /// Owned cell block for the window; non-member cells carry
    /// `LayerId::INVALID` and are not returned by lookups.
    cells: Vec<Cell>,
    /// Connect cells at the short-edge midpoints (bridge only), in global
    /// cell coordinates.
    start_cell: CellCoord,
    end_cell: CellCoord,
    bridge_id: Option<Entity>,
    destroyed: bool,
    zone: u16,
    /// Height of the walking surface.
    surface_z: FixedNum,
}

impl PathfindLayer {
    pub fn id(&self) -> LayerId {
        self.layer
    }

    pub fn bridge_id(&self) -> Option<Entity> {
        self.bridge_id
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn surface_z(&self) -> FixedNum {
        self.surface_z
    }

    pub fn zone(&self) -> u16 {
        self.zone
    }

    pub fn set_zone(&mut self, zone: u16) {
        self.zone = zone;
    }

    /// Propagate the layer zone to every member cell.
    pub fn apply_zone(&mut self) {
        let zone = self.zone;
        for cell in self.cells.iter_mut().filter(|c| c.layer != LayerId::INVALID) {
            cell.zone = zone;
        }
    }

    pub fn start_cell(&self) -> CellCoord {
        self.start_cell
    }

    pub fn end_cell(&self) -> CellCoord {
        self.end_cell
    }

    #[inline]
    fn window_index(&self, coord: CellCoord) -> Option<usize> {
        let lx = coord.x - self.x_origin;
        let ly = coord.y - self.y_origin;
        if lx < 0 || ly < 0 || lx >= self.width || ly >= self.height {
            return None;
        }
        Some((ly as usize) * (self.width as usize) + lx as usize)
    }

    pub fn get(&self, coord: CellCoord) -> Option<&Cell> {
        self.window_index(coord)
            .map(|i| &self.cells[i])
            .filter(|c| c.layer != LayerId::INVALID)
    }

    pub fn get_mut(&mut self, coord: CellCoord) -> Option<&mut Cell> {
        match self.window_index(coord) {
            Some(i) if self.cells[i].layer != LayerId::INVALID => Some(&mut self.cells[i]),
            _ => None,
        }
    }

    /// Global coordinates of every member cell.
    pub fn member_coords(&self) -> Vec<CellCoord> {
        let mut out = Vec::new();
        for ly in 0..self.height {
            for lx in 0..self.width {
                let idx = (ly as usize) * (self.width as usize) + lx as usize;
                if self.cells[idx].layer != LayerId::INVALID {
                    out.push(CellCoord::new(self.x_origin + lx, self.y_origin + ly));
                }
            }
        }
        out
    }

    /// Toggle the destroyed state. Rubbled decks turn impassable for ground
    /// units; repair restores them. Returns true if the state changed.
    pub fn set_destroyed(&mut self, destroyed: bool) -> bool {
        if self.destroyed == destroyed {
            return false;
        }
        self.destroyed = destroyed;
        let new_type = if destroyed { CellType::Impassable } else { CellType::Clear };
        for cell in self.cells.iter_mut().filter(|c| c.layer != LayerId::INVALID) {
            cell.cell_type = new_type;
        }
        true
    }

    /// Build a bridge layer from map data. The deck is the rotated rectangle
    /// between the span's two short-edge midpoints; those midpoints become
    /// the connect cells, cross-linked to the ground cells beneath.
    fn init_bridge(layer: LayerId, span: &BridgeSpan, grid: &mut CellGrid) -> Self {
        let pitch = cell_size();
        let start2 = span.start.xy();
        let end2 = span.end.xy();
        let along = end2 - start2;
        let length = along.length();
        let dir = if length == FixedNum::ZERO {
            FixedVec2::new(FixedNum::from_num(1), FixedNum::ZERO)
        } else {
            along / length
        };
        let mid = (start2 + end2) / FixedNum::from_num(2);
        let half_len = length / FixedNum::from_num(2) + pitch / FixedNum::from_num(2);
        let half_width = span.half_width.max(pitch / FixedNum::from_num(2));

        // Window: bounding box of the deck, clipped to the grid.
        let reach = half_len.max(half_width) + pitch;
        let lo = grid.world_to_cell(FixedVec2::new(mid.x - reach, mid.y - reach)).coord;
        let hi = grid.world_to_cell(FixedVec2::new(mid.x + reach, mid.y + reach)).coord;
        let x_origin = lo.x;
        let y_origin = lo.y;
        let width = hi.x - lo.x + 1;
        let height = hi.y - lo.y + 1;

        let mut cells = vec![Cell::default(); (width as usize) * (height as usize)];
        for ly in 0..height {
            for lx in 0..width {
                let coord = CellCoord::new(x_origin + lx, y_origin + ly);
                let center = grid.cell_center(coord);
                let rel = center - mid;
                let along_d = rel.dot(dir).abs();
                let across_d = rel.cross(dir).abs();
                let idx = (ly as usize) * (width as usize) + lx as usize;
                if along_d <= half_len && across_d <= half_width {
                    let cell = &mut cells[idx];
                    cell.layer = layer;
                    cell.cell_type = CellType::Clear;
                } else {
                    cells[idx].layer = LayerId::INVALID;
                }
            }
        }

        let start_cell = grid.world_to_cell(start2).coord;
        let end_cell = grid.world_to_cell(end2).coord;
        let surface_z = (span.start.z + span.end.z) / FixedNum::from_num(2);

        let mut this = Self {
            layer,
            x_origin,
            y_origin,
            width,
            height,
            cells,
            start_cell,
            end_cell,
            bridge_id: Some(span.id),
            destroyed: false,
            zone: 0,
            surface_z,
        };

        // Make sure the connect cells are members even if rounding put a
        // midpoint fractionally outside the deck rectangle.
        for coord in [start_cell, end_cell] {
            if let Some(i) = this.window_index(coord) {
                this.cells[i].layer = layer;
                this.cells[i].cell_type = CellType::Clear;
            }
        }

        // Cross-link: deck end cells step down to ground, ground cells step
        // up onto the deck.
        for coord in [start_cell, end_cell] {
            if let Some(cell) = this.get_mut(coord) {
                cell.connect_layer = LayerId::GROUND;
            }
            if let Some(ground) = grid.get_mut(coord) {
                ground.connect_layer = layer;
            }
        }

        this
    }

    /// Build the wall layer over the given wall-piece footprints. Wall tops
    /// are `Impassable` (wall-access locomotion only); every piece cell is
    /// an entry, cross-linked with the ground beneath.
    fn init_wall(
        pieces: &[(Entity, FixedVec3, Footprint)],
        wall_height: FixedNum,
        grid: &mut CellGrid,
    ) -> Option<Self> {
        let mut member: Vec<CellCoord> = Vec::new();
        for (_, pos, footprint) in pieces {
            let reach = footprint.bounding_radius();
            let lo = grid
                .world_to_cell(FixedVec2::new(pos.x - reach, pos.y - reach))
                .coord;
            let hi = grid
                .world_to_cell(FixedVec2::new(pos.x + reach, pos.y + reach))
                .coord;
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    let coord = CellCoord::new(x, y);
                    let center = grid.cell_center(coord);
                    if footprint.contains(*pos, center.x, center.y) {
                        member.push(coord);
                    }
                }
            }
        }
        if member.is_empty() {
            return None;
        }

        let x_origin = member.iter().map(|c| c.x).min().unwrap();
        let y_origin = member.iter().map(|c| c.y).min().unwrap();
        let width = member.iter().map(|c| c.x).max().unwrap() - x_origin + 1;
        let height = member.iter().map(|c| c.y).max().unwrap() - y_origin + 1;

        let mut cells = vec![Cell::default(); (width as usize) * (height as usize)];
        let mut this = Self {
            layer: LayerId::WALL,
            x_origin,
            y_origin,
            width,
            height,
            cells: Vec::new(),
            start_cell: member[0],
            end_cell: member[member.len() - 1],
            bridge_id: None,
            destroyed: false,
            zone: 0,
            surface_z: wall_height,
        };
        for coord in &member {
            let lx = coord.x - x_origin;
            let ly = coord.y - y_origin;
            let idx = (ly as usize) * (width as usize) + lx as usize;
            let cell = &mut cells[idx];
            cell.layer = LayerId::WALL;
            cell.cell_type = CellType::Impassable;
            cell.connect_layer = LayerId::GROUND;
            if let Some(ground) = grid.get_mut(*coord) {
                ground.connect_layer = LayerId::WALL;
            }
        }
        this.cells = cells;
        Some(this)
    }
}

/// Ordered collection of overlay layers: slot per `LayerId`, bridges in
/// `FIRST_BRIDGE..=LAST_BRIDGE`, the wall layer at `WALL`.
#[derive(Default)]
pub struct LayerStore {
    slots: Vec<Option<PathfindLayer>>,
}

impl LayerStore {
    pub fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with((LayerId::LAST_BRIDGE.0 + 1) as usize, || None);
        Self { slots }
    }

    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    pub fn get(&self, layer: LayerId) -> Option<&PathfindLayer> {
        self.slots.get(layer.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, layer: LayerId) -> Option<&mut PathfindLayer> {
        self.slots.get_mut(layer.0 as usize).and_then(|s| s.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathfindLayer> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PathfindLayer> {
        self.slots.iter_mut().filter_map(|s| s.as_mut())
    }

    pub fn bridges(&self) -> impl Iterator<Item = &PathfindLayer> {
        self.iter().filter(|l| l.id().is_bridge())
    }

    /// Instantiate a bridge layer; returns its id, or None when every bridge
    /// slot is taken.
    pub fn add_bridge(&mut self, span: &BridgeSpan, grid: &mut CellGrid) -> Option<LayerId> {
        let slot = (LayerId::FIRST_BRIDGE.0..=LayerId::LAST_BRIDGE.0)
            .find(|&i| self.slots[i as usize].is_none())?;
        let layer = LayerId(slot);
        self.slots[slot as usize] = Some(PathfindLayer::init_bridge(layer, span, grid));
        Some(layer)
    }

    /// (Re)build the wall layer from the current piece list.
    pub fn rebuild_wall(
        &mut self,
        pieces: &[(Entity, FixedVec3, Footprint)],
        wall_height: FixedNum,
        grid: &mut CellGrid,
    ) {
        // Old entry links go stale when pieces are removed.
        if let Some(old) = &self.slots[LayerId::WALL.0 as usize] {
            for coord in old.member_coords() {
                if let Some(ground) = grid.get_mut(coord) {
                    if ground.connect_layer == LayerId::WALL {
                        ground.connect_layer = LayerId::INVALID;
                    }
                }
            }
        }
        self.slots[LayerId::WALL.0 as usize] =
            PathfindLayer::init_wall(pieces, wall_height, grid);
    }

    /// The layer whose walking surface is closest in z to the position,
    /// within the map's z tolerance; ties inside the tolerance resolve to
    /// ground. A terrain query, when given, supplies live surface heights
    /// (hosts with moving overlays); otherwise the cached build-time height
    /// is used.
    pub fn layer_for_destination(
        &self,
        pos: FixedVec3,
        ground_z: FixedNum,
        terrain: Option<&dyn TerrainQuery>,
    ) -> LayerId {
        let tolerance = FixedNum::from_num(LAYER_Z_CLOSE_ENOUGH);
        let mut best = LayerId::GROUND;
        let mut best_dz = (pos.z - ground_z).abs();
        for layer in self.iter() {
            if layer.is_destroyed() {
                continue;
            }
            let here = layer.get(CellCoord::new(
                (pos.x / cell_size()).floor().to_num(),
                (pos.y / cell_size()).floor().to_num(),
            ));
            if here.is_none() {
                continue;
            }
            let surface = terrain
                .and_then(|t| t.layer_height(pos.x, pos.y, layer.id()))
                .unwrap_or_else(|| layer.surface_z());
            let dz = (pos.z - surface).abs();
            if dz < best_dz && dz <= tolerance {
                best = layer.id();
                best_dz = dz;
            }
        }
        best
    }

    /// The highest layer whose surface is at or below the position (within
    /// tolerance above it). Falls back to ground.
    pub fn highest_layer_for_destination(
        &self,
        pos: FixedVec3,
        terrain: Option<&dyn TerrainQuery>,
    ) -> LayerId {
        let tolerance = FixedNum::from_num(LAYER_Z_CLOSE_ENOUGH);
        let mut best = LayerId::GROUND;
        let mut best_z = FixedNum::MIN;
        for layer in self.iter() {
            if layer.is_destroyed() {
                continue;
            }
            let here = layer.get(CellCoord::new(
                (pos.x / cell_size()).floor().to_num(),
                (pos.y / cell_size()).floor().to_num(),
            ));
            if here.is_none() {
                continue;
            }
            let surface = terrain
                .and_then(|t| t.layer_height(pos.x, pos.y, layer.id()))
                .unwrap_or_else(|| layer.surface_z());
            if surface <= pos.z + tolerance && surface > best_z {
                best = layer.id();
                best_z = surface;
            }
        }
        best
    }
}
