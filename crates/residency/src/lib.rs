//! Residency engine for sparse tiled textures streamed from GPU sampler
//! feedback. The manager tracks which 64 KiB tiles of which textures are
//! resident, assigns them slots in caller-provided heaps and exposes the
//! resulting map/unmap work; all GPU calls and memory allocation stay with
//! the caller.

pub use model::{
    MipLevelTiling, TextureShapeError, TileCoord, TiledLevelDesc, TiledTextureDesc,
};

pub use bits::{BitArray, Ones, OnesRev};
pub use lru::LruQueue;
pub use manager::TiledTextureManager;

/// Size of one physical tile in bytes, fixed by the sparse tiling hardware.
pub const TILE_SIZE_BYTES: u64 = 65536;

/// Identifier handed out by [`TiledTextureManager::add_tiled_texture`]. Ids
/// are dense and recycled after removal; holding on to a removed texture's
/// id is a caller error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub(crate) u32);

/// Caller-chosen identifier of one physical heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(pub u32);

/// Slot held by a resident tile. Tiles in the Allocated, Mapped and Standby
/// states hold exactly one; free and requested tiles hold none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileAllocation {
    pub heap_id: HeapId,
    pub heap_slot: u32,
}

/// One frame of decoded sampler feedback for one texture.
#[derive(Debug, Clone, Copy)]
pub struct SamplerFeedbackDesc<'a> {
    /// MinMip bytes, `feedback_tiles_x * feedback_tiles_y` tightly packed;
    /// `0xFF` marks a region that was not sampled. `None` skips decoding for
    /// the frame while still aging out mapped tiles.
    pub min_mip_data: Option<&'a [u8]>,
    /// When non-zero, only the coarsest `streamed_mip_levels_num` regular
    /// levels are streamed.
    pub streamed_mip_levels_num: u32,
    /// Added to every decoded mip value; the sum clamps at the finest level.
    pub mip_level_bias: i32,
}

/// Settings fixed for the lifetime of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiledTextureManagerDesc {
    /// Tiles per heap; controls allocation granularity.
    pub heap_tiles_capacity: u32,
}

impl Default for TiledTextureManagerDesc {
    fn default() -> Self {
        Self {
            heap_tiles_capacity: 256,
        }
    }
}

impl TiledTextureManagerDesc {
    /// Byte size the caller must allocate for each heap.
    pub fn heap_size_bytes(&self) -> u64 {
        self.heap_tiles_capacity as u64 * TILE_SIZE_BYTES
    }
}

/// Settings adjustable between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiledTextureManagerConfig {
    /// Target number of no-longer-requested tiles to keep resident before
    /// trimming evicts them.
    pub num_extra_standby_tiles: u32,
}

impl Default for TiledTextureManagerConfig {
    fn default() -> Self {
        Self {
            num_extra_standby_tiles: 1000,
        }
    }
}

/// Caller-side GPU resources the manager can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureViewKind {
    /// The sampler feedback image written by the GPU.
    Feedback,
    /// The per-tile residency image consumed by shaders.
    MinMip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureViewDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels_num: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Statistics {
    /// Tiles tracked across all live textures.
    pub total_tiles_num: u32,
    /// Tiles currently holding a heap slot.
    pub allocated_tiles_num: u32,
    /// Tiles in the standby queue.
    pub standby_tiles_num: u32,
    /// Unused slots across all heaps.
    pub heap_free_tiles_num: u32,
}

mod allocator;
mod bits;
mod feedback;
mod lru;
mod manager;
mod minmip;
mod texture;
