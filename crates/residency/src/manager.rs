use ahash::AHashMap;
use model::{ShapeKey, TextureShapeError, TileCoord, TiledTextureDesc, TilingLayout};

use crate::allocator::TileAllocator;
use crate::bits::BitArray;
use crate::feedback::decode_sampler_feedback;
use crate::lru::LruQueue;
use crate::minmip::write_min_mip_data;
use crate::texture::{TextureState, TileState};
use crate::{
    HeapId, SamplerFeedbackDesc, Statistics, TextureId, TextureViewDesc, TextureViewKind,
    TileAllocation, TiledTextureManagerConfig, TiledTextureManagerDesc,
};

/// Single-threaded residency manager. One instance is owned by one caller
/// thread; every operation is synchronous and the caller sequences the
/// per-frame phases (update feedback, allocate, drain map work, map, write
/// residency, drain unmap work, trim, defragment).
#[derive(Debug)]
pub struct TiledTextureManager {
    desc: TiledTextureManagerDesc,
    config: TiledTextureManagerConfig,
    allocator: TileAllocator,
    textures: Vec<Option<TextureState>>,
    texture_freelist: Vec<u32>,
    layouts: Vec<TilingLayout>,
    layout_indices: AHashMap<ShapeKey, u32>,
    requested_queue: LruQueue<(TextureId, u32)>,
    standby_queue: LruQueue<(TextureId, u32)>,
    total_tiles_num: u32,
}

impl TiledTextureManager {
    pub fn new(desc: TiledTextureManagerDesc) -> Self {
        assert!(
            desc.heap_tiles_capacity > 0,
            "heap capacity must be at least one tile"
        );
        Self {
            desc,
            config: TiledTextureManagerConfig::default(),
            allocator: TileAllocator::new(desc.heap_tiles_capacity),
            textures: Vec::new(),
            texture_freelist: Vec::new(),
            layouts: Vec::new(),
            layout_indices: AHashMap::new(),
            requested_queue: LruQueue::new(),
            standby_queue: LruQueue::new(),
            total_tiles_num: 0,
        }
    }

    pub fn set_config(&mut self, config: TiledTextureManagerConfig) {
        self.config = config;
    }

    /// Registers a texture shape and requests its packed tiles. Textures
    /// with an identical shape share one set of derived tiling tables.
    pub fn add_tiled_texture(
        &mut self,
        desc: &TiledTextureDesc,
    ) -> Result<TextureId, TextureShapeError> {
        let layout_index = self.intern_layout(desc)?;
        let layout = &self.layouts[layout_index as usize];
        let tiles_num = layout.total_tiles_num();
        let regular_tiles_num = layout.regular_tiles_num;
        let packed_tiles_num = layout.packed_tiles_num;

        let texture_id = match self.texture_freelist.pop() {
            Some(recycled) => TextureId(recycled),
            None => {
                self.textures.push(None);
                TextureId((self.textures.len() - 1) as u32)
            }
        };
        self.textures[texture_id.0 as usize] =
            Some(TextureState::new(layout_index, tiles_num, packed_tiles_num));
        self.total_tiles_num += tiles_num;

        // packed tiles back every coarse mip and are requested up front
        for packed_index in 0..packed_tiles_num {
            self.transition_tile(
                texture_id,
                regular_tiles_num + packed_index,
                TileState::Requested,
            );
        }

        log::debug!(
            "added tiled texture {}: {} regular + {} packed tiles",
            texture_id.0,
            regular_tiles_num,
            packed_tiles_num
        );
        Ok(texture_id)
    }

    /// Frees every slot the texture holds and purges its queue entries. The
    /// id is recycled for a later `add_tiled_texture`.
    pub fn remove_tiled_texture(&mut self, texture_id: TextureId) {
        let Some(slot) = self.textures.get_mut(texture_id.0 as usize) else {
            panic!("unknown texture id");
        };
        let Some(texture) = slot.take() else {
            panic!("unknown texture id");
        };

        for allocation in texture.tile_allocations.iter().flatten() {
            self.allocator.free(*allocation);
        }
        let tiles_num = self.layouts[texture.layout_index as usize].total_tiles_num();
        for tile_index in 0..tiles_num {
            self.requested_queue.erase(&(texture_id, tile_index));
            self.standby_queue.erase(&(texture_id, tile_index));
        }
        self.total_tiles_num -= tiles_num;
        self.texture_freelist.push(texture_id.0);

        log::debug!("removed tiled texture {}", texture_id.0);
    }

    /// Per-frame feedback consumption for one texture: decodes the MinMip
    /// image into the requested set, revives or requests the tiles it names
    /// and ages mapped tiles that fell out of it towards standby.
    pub fn update_with_sampler_feedback(
        &mut self,
        texture_id: TextureId,
        feedback: &SamplerFeedbackDesc<'_>,
        time: f32,
        timeout: f32,
    ) {
        let layout_index = {
            let texture = self.texture_state_mut(texture_id);
            texture.tiles_to_map.clear();
            texture.tiles_to_unmap.clear();
            texture.layout_index
        };

        let decoded = decode_sampler_feedback(&self.layouts[layout_index as usize], feedback);
        self.apply_requested_bits(
            texture_id,
            decoded.bits,
            decoded.first_tile_index,
            time,
            timeout,
        );
    }

    /// Mirrors the primary texture's most recent requested set onto a
    /// follower that has no feedback of its own (e.g. a normal map following
    /// the albedo it is sampled with). Every requested primary tile is
    /// projected through texel space onto the follower tiles it overlaps at
    /// the same mip level; follower mips finer than the primary's finest are
    /// never requested this way.
    pub fn match_primary_texture(
        &mut self,
        primary_id: TextureId,
        follower_id: TextureId,
        time: f32,
        timeout: f32,
    ) {
        let primary = self.texture_state(primary_id);
        let primary_layout = &self.layouts[primary.layout_index as usize];
        let follower_layout_index = self.texture_state(follower_id).layout_index;
        let follower_layout = &self.layouts[follower_layout_index as usize];

        let mut bits = BitArray::new(follower_layout.total_tiles_num());
        for packed_index in 0..follower_layout.packed_tiles_num {
            bits.set(follower_layout.regular_tiles_num + packed_index);
        }

        let mut first_tile_index = None;
        for primary_tile in primary.requested_bits.ones() {
            let coord = primary_layout.tile_coords[primary_tile as usize];
            if coord.mip_level >= follower_layout.regular_mip_levels_num {
                continue;
            }
            let tiling = &follower_layout.mip_level_tilings[coord.mip_level as usize];

            // texel rectangle of the primary tile, rescaled to follower tiles
            let left = coord.x * primary_layout.tile_width;
            let top = coord.y * primary_layout.tile_height;
            let right = left + primary_layout.tile_width;
            let bottom = top + primary_layout.tile_height;
            let x_first = left / follower_layout.tile_width;
            let y_first = top / follower_layout.tile_height;
            let x_last = ((right - 1) / follower_layout.tile_width).min(tiling.tiles_x - 1);
            let y_last = ((bottom - 1) / follower_layout.tile_height).min(tiling.tiles_y - 1);

            for y in y_first..=y_last {
                for x in x_first..=x_last {
                    let follower_tile = tiling.first_tile_index + y * tiling.tiles_x + x;
                    bits.set(follower_tile);
                    first_tile_index = Some(match first_tile_index {
                        Some(first) => follower_tile.min(first),
                        None => follower_tile,
                    });
                }
            }
        }

        self.apply_requested_bits(follower_id, bits, first_tile_index, time, timeout);
    }

    /// Heaps needed to hold every currently requested tile plus the standby
    /// target. The caller adds or removes heaps to converge on this count.
    pub fn num_desired_heaps(&self) -> u32 {
        let mut tiles_num = 0u32;
        for texture in self.textures.iter().flatten() {
            tiles_num += texture.requested_tiles_num;
        }
        tiles_num += self.config.num_extra_standby_tiles;
        tiles_num.div_ceil(self.desc.heap_tiles_capacity)
    }

    pub fn add_heap(&mut self, heap_id: HeapId) {
        self.allocator.add_heap(heap_id);
        log::debug!(
            "added heap {} ({} tile slots)",
            heap_id.0,
            self.desc.heap_tiles_capacity
        );
    }

    /// Removes a heap. Only heaps with no used slots may be removed; use
    /// `empty_heaps` and the defragmenter to drain one first.
    pub fn remove_heap(&mut self, heap_id: HeapId) {
        self.allocator.remove_heap(heap_id);
        log::debug!("removed heap {}", heap_id.0);
    }

    /// Drains the request queue front to back, assigning heap slots. Stops
    /// at the first tile that cannot be placed (no free slot and nothing in
    /// standby to evict); the queue keeps that tile and everything behind
    /// it, which is the caller's signal to add heaps.
    pub fn allocate_requested_tiles(&mut self) {
        while let Some((texture_id, tile_index)) = self.requested_queue.front() {
            if !self.transition_tile(texture_id, tile_index, TileState::Allocated) {
                break;
            }
            self.requested_queue.pop_front();
        }
    }

    /// Evicts standby tiles oldest-first until the standby queue fits the
    /// configured target.
    pub fn trim_standby_tiles(&mut self) {
        while self.standby_queue.len() > self.config.num_extra_standby_tiles as usize {
            let Some((texture_id, tile_index)) = self.standby_queue.front() else {
                break;
            };
            self.transition_tile(texture_id, tile_index, TileState::Free);
        }
    }

    /// Tiles that gained a slot since the last drain. The caller maps them
    /// on the GPU and reports back through `update_tiles_mapping`.
    pub fn tiles_to_map(&mut self, texture_id: TextureId) -> Vec<u32> {
        std::mem::take(&mut self.texture_state_mut(texture_id).tiles_to_map)
    }

    /// Acknowledges that the caller mapped these tiles.
    pub fn update_tiles_mapping(&mut self, texture_id: TextureId, tile_indices: &[u32]) {
        for &tile_index in tile_indices {
            self.transition_tile(texture_id, tile_index, TileState::Mapped);
        }
    }

    /// Tiles that lost their slot since the last drain; the caller unmaps
    /// them on the GPU.
    pub fn tiles_to_unmap(&mut self, texture_id: TextureId) -> Vec<u32> {
        std::mem::take(&mut self.texture_state_mut(texture_id).tiles_to_unmap)
    }

    /// Writes the per-tile residency image for one texture. `data` must be
    /// sized per `texture_view_desc(.., MinMip)`.
    pub fn write_min_mip_data(&self, texture_id: TextureId, data: &mut [u8]) {
        let texture = self.texture_state(texture_id);
        let layout = &self.layouts[texture.layout_index as usize];
        write_min_mip_data(layout, texture, data);
    }

    /// Moves up to `num_tiles` movable tiles out of late heaps into free
    /// slots of earlier heaps, so that trailing heaps drain empty and can be
    /// removed. Each moved tile re-enters the request queue; the next
    /// `allocate_requested_tiles` places it, and the caller remaps it from
    /// the usual work lists.
    pub fn defragment_tiles(&mut self, num_tiles: u32) {
        for _ in 0..num_tiles {
            let candidate = self
                .allocator
                .fragmented_tile(|texture_id, tile_index| {
                    self.is_movable_tile(texture_id, tile_index)
                });
            let Some((texture_id, tile_index)) = candidate else {
                return;
            };
            self.transition_tile(texture_id, tile_index, TileState::Free);
            self.transition_tile(texture_id, tile_index, TileState::Requested);
        }
    }

    pub fn empty_heaps(&self) -> Vec<HeapId> {
        self.allocator.empty_heaps()
    }

    /// Whether the defragmenter may move this tile right now: only regular
    /// tiles that are resident and not mid-transfer (Mapped or Standby).
    pub fn is_movable_tile(&self, texture_id: TextureId, tile_index: u32) -> bool {
        let texture = self.texture_state(texture_id);
        let layout = &self.layouts[texture.layout_index as usize];
        layout.is_regular_tile(tile_index)
            && matches!(
                texture.tile_state(tile_index),
                TileState::Mapped | TileState::Standby
            )
    }

    /// Dimensions for the caller-side GPU resources tied to this texture.
    pub fn texture_view_desc(&self, texture_id: TextureId, kind: TextureViewKind) -> TextureViewDesc {
        let texture = self.texture_state(texture_id);
        let layout = &self.layouts[texture.layout_index as usize];
        match kind {
            TextureViewKind::Feedback => TextureViewDesc {
                width: layout.tile_width / layout.feedback_granularity_x,
                height: layout.tile_height / layout.feedback_granularity_y,
                mip_levels_num: layout.regular_mip_levels_num + layout.packed_mip_levels_num,
            },
            TextureViewKind::MinMip => {
                let (width, height) = layout.min_mip_dims();
                TextureViewDesc {
                    width,
                    height,
                    mip_levels_num: 1,
                }
            }
        }
    }

    pub fn tile_coordinates(&self, texture_id: TextureId) -> &[TileCoord] {
        let texture = self.texture_state(texture_id);
        &self.layouts[texture.layout_index as usize].tile_coords
    }

    pub fn tile_allocations(&self, texture_id: TextureId) -> &[Option<TileAllocation>] {
        &self.texture_state(texture_id).tile_allocations
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            total_tiles_num: self.total_tiles_num,
            allocated_tiles_num: self.allocator.allocated_tiles_num(),
            standby_tiles_num: self.standby_queue.len() as u32,
            heap_free_tiles_num: self.allocator.free_tiles_num(),
        }
    }

    /// Shared tail of the feedback update and the primary/follower match:
    /// saves the requested set, then walks the regular tiles once, stamping
    /// request times, reviving standby tiles, queueing free ones and aging
    /// mapped tiles that missed the timeout window.
    fn apply_requested_bits(
        &mut self,
        texture_id: TextureId,
        bits: BitArray,
        first_tile_index: Option<u32>,
        time: f32,
        timeout: f32,
    ) {
        let (regular_tiles_num, packed_tiles_num, regular_mip_levels_num) = {
            let texture = self.texture_state(texture_id);
            let layout = &self.layouts[texture.layout_index as usize];
            (
                layout.regular_tiles_num,
                layout.packed_tiles_num,
                layout.regular_mip_levels_num,
            )
        };

        let texture = self.texture_state_mut(texture_id);
        texture.requested_bits = bits;
        texture.requested_tiles_num = packed_tiles_num;
        if regular_mip_levels_num == 0 {
            return;
        }

        // nothing requested and nothing resident: the scan would be a no-op
        if first_tile_index.is_none() && texture.allocated_unpacked_tiles_num == 0 {
            return;
        }

        for tile_index in 0..regular_tiles_num {
            let texture = self.texture_state(texture_id);
            let state = texture.tile_state(tile_index);
            if texture.requested_bits.get(tile_index) {
                let texture = self.texture_state_mut(texture_id);
                texture.last_requested_time[tile_index as usize] = time;
                texture.requested_tiles_num += 1;
                match state {
                    TileState::Standby => {
                        self.transition_tile(texture_id, tile_index, TileState::Mapped);
                    }
                    TileState::Free => {
                        self.transition_tile(texture_id, tile_index, TileState::Requested);
                    }
                    _ => {}
                }
            } else if state == TileState::Mapped
                && time - texture.last_requested_time[tile_index as usize] >= timeout
            {
                self.transition_tile(texture_id, tile_index, TileState::Standby);
            }
        }
    }

    /// Moves one tile to a new lifecycle state, running the entry actions.
    /// Only the Allocated entry can fail (no slot anywhere and nothing to
    /// evict); the tile then stays in its current state and the method
    /// returns false.
    fn transition_tile(
        &mut self,
        texture_id: TextureId,
        tile_index: u32,
        new_state: TileState,
    ) -> bool {
        let current_state = self.texture_state(texture_id).tile_state(tile_index);
        debug_assert!(
            transition_allowed(current_state, new_state),
            "forbidden tile state transition"
        );

        let key = (texture_id, tile_index);
        if current_state == TileState::Standby {
            let erased = self.standby_queue.erase(&key);
            debug_assert!(erased, "standby tile missing from the standby queue");
        }

        match new_state {
            TileState::Free => {
                let is_regular = self.is_regular_tile(texture_id, tile_index);
                let texture = self.texture_state_mut(texture_id);
                let Some(allocation) = texture.tile_allocations[tile_index as usize].take() else {
                    panic!("freeing a tile that holds no slot");
                };
                texture.tiles_to_unmap.push(tile_index);
                if is_regular {
                    texture.allocated_unpacked_tiles_num -= 1;
                }
                self.allocator.free(allocation);
            }
            TileState::Requested => {
                let enqueued = self.requested_queue.push_back(key);
                debug_assert!(enqueued, "tile is already in the request queue");
            }
            TileState::Allocated => {
                if self.allocator.free_tiles_num() == 0 {
                    if let Some((standby_texture, standby_tile)) = self.standby_queue.front() {
                        self.transition_tile(standby_texture, standby_tile, TileState::Free);
                    }
                }
                let Some(allocation) = self.allocator.allocate(texture_id, tile_index) else {
                    return false;
                };
                let is_regular = self.is_regular_tile(texture_id, tile_index);
                let texture = self.texture_state_mut(texture_id);
                texture.tile_allocations[tile_index as usize] = Some(allocation);
                texture.tiles_to_map.push(tile_index);
                if is_regular {
                    texture.allocated_unpacked_tiles_num += 1;
                }
            }
            TileState::Mapped => {}
            TileState::Standby => {
                let enqueued = self.standby_queue.push_back(key);
                debug_assert!(enqueued, "tile is already in the standby queue");
            }
        }

        self.texture_state_mut(texture_id).tile_states[tile_index as usize] = new_state;
        true
    }

    fn intern_layout(&mut self, desc: &TiledTextureDesc) -> Result<u32, TextureShapeError> {
        let key = ShapeKey::of(desc);
        if let Some(&layout_index) = self.layout_indices.get(&key) {
            return Ok(layout_index);
        }
        let layout = TilingLayout::new(desc)?;
        let layout_index = self.layouts.len() as u32;
        self.layouts.push(layout);
        self.layout_indices.insert(key, layout_index);
        Ok(layout_index)
    }

    fn is_regular_tile(&self, texture_id: TextureId, tile_index: u32) -> bool {
        let texture = self.texture_state(texture_id);
        self.layouts[texture.layout_index as usize].is_regular_tile(tile_index)
    }

    fn texture_state(&self, texture_id: TextureId) -> &TextureState {
        let Some(texture) = self
            .textures
            .get(texture_id.0 as usize)
            .and_then(|slot| slot.as_ref())
        else {
            panic!("unknown texture id");
        };
        texture
    }

    fn texture_state_mut(&mut self, texture_id: TextureId) -> &mut TextureState {
        let Some(texture) = self
            .textures
            .get_mut(texture_id.0 as usize)
            .and_then(|slot| slot.as_mut())
        else {
            panic!("unknown texture id");
        };
        texture
    }

    #[cfg(test)]
    pub(crate) fn requested_queue(&self) -> &LruQueue<(TextureId, u32)> {
        &self.requested_queue
    }

    #[cfg(test)]
    pub(crate) fn standby_queue(&self) -> &LruQueue<(TextureId, u32)> {
        &self.standby_queue
    }

    #[cfg(test)]
    pub(crate) fn tile_state_of(&self, texture_id: TextureId, tile_index: u32) -> TileState {
        self.texture_state(texture_id).tile_state(tile_index)
    }

    #[cfg(test)]
    pub(crate) fn layout_of(&self, texture_id: TextureId) -> &TilingLayout {
        &self.layouts[self.texture_state(texture_id).layout_index as usize]
    }

    #[cfg(test)]
    pub(crate) fn allocated_unpacked_of(&self, texture_id: TextureId) -> u32 {
        self.texture_state(texture_id).allocated_unpacked_tiles_num
    }

    #[cfg(test)]
    pub(crate) fn live_texture_ids(&self) -> Vec<TextureId> {
        self.textures
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| TextureId(index as u32))
            .collect()
    }
}

fn transition_allowed(from: TileState, to: TileState) -> bool {
    use TileState::*;
    matches!(
        (from, to),
        (Free, Requested)
            | (Requested, Allocated)
            | (Requested, Standby)
            | (Allocated, Mapped)
            | (Allocated, Standby)
            | (Mapped, Free)
            | (Mapped, Standby)
            | (Standby, Free)
            | (Standby, Mapped)
    )
}
