use crate::bits::BitArray;
use crate::TileAllocation;

/// Lifecycle of one tile. The enum is the canonical representation; queue
/// membership and allocation validity follow from it:
/// Requested tiles sit in the request FIFO, Standby tiles in the standby
/// LRU, and exactly the Allocated/Mapped/Standby tiles hold a heap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TileState {
    Free,
    Requested,
    Allocated,
    Mapped,
    Standby,
}

/// Mutable state of one live texture. The tiling tables live in the shared
/// layout pool; this struct only holds what differs per texture.
#[derive(Debug)]
pub(crate) struct TextureState {
    pub(crate) layout_index: u32,
    pub(crate) tile_states: Vec<TileState>,
    pub(crate) last_requested_time: Vec<f32>,
    pub(crate) tile_allocations: Vec<Option<TileAllocation>>,
    pub(crate) tiles_to_map: Vec<u32>,
    pub(crate) tiles_to_unmap: Vec<u32>,
    /// Requested set of the most recent update, kept so follower textures
    /// can project it.
    pub(crate) requested_bits: BitArray,
    pub(crate) allocated_unpacked_tiles_num: u32,
    pub(crate) requested_tiles_num: u32,
}

impl TextureState {
    pub(crate) fn new(layout_index: u32, tiles_num: u32, packed_tiles_num: u32) -> Self {
        Self {
            layout_index,
            tile_states: vec![TileState::Free; tiles_num as usize],
            last_requested_time: vec![0.0; tiles_num as usize],
            tile_allocations: vec![None; tiles_num as usize],
            tiles_to_map: Vec::new(),
            tiles_to_unmap: Vec::new(),
            requested_bits: BitArray::new(tiles_num),
            allocated_unpacked_tiles_num: 0,
            requested_tiles_num: packed_tiles_num,
        }
    }

    pub(crate) fn tile_state(&self, tile_index: u32) -> TileState {
        self.tile_states[tile_index as usize]
    }
}
