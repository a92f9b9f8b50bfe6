use std::fmt;

/// Coordinate of one tile inside a texture's mip pyramid. `x`/`y` are tile
/// indices, not texels. Tiles backing the packed mip tail use `y = 0`,
/// `x = packed index` and `mip_level` one past the last regular level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
    pub mip_level: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiledLevelDesc {
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
}

/// Caller-provided shape of a tiled texture. The regular levels are the
/// high-resolution mips above the packed tail; `tiled_level_descs` holds one
/// entry per regular level, finest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TiledTextureDesc {
    pub texture_width: u32,
    pub texture_height: u32,
    pub tiled_level_descs: Vec<TiledLevelDesc>,
    pub packed_mip_levels_num: u32,
    pub packed_tiles_num: u32,
    pub tile_width: u32,
    pub tile_height: u32,
}

impl TiledTextureDesc {
    pub fn regular_mip_levels_num(&self) -> u32 {
        self.tiled_level_descs.len() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureShapeError {
    TileDimensionNotPowerOfTwo,
    TextureDimensionZero,
    LevelDimensionZero,
    PackedShapeMismatch,
    NoTiles,
    ShapeTooLarge,
}

impl fmt::Display for TextureShapeError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextureShapeError::TileDimensionNotPowerOfTwo => {
                write!(formatter, "tile width/height must be a power of two")
            }
            TextureShapeError::TextureDimensionZero => {
                write!(formatter, "texture width/height must be at least 1 texel")
            }
            TextureShapeError::LevelDimensionZero => {
                write!(formatter, "regular mip level must span at least 1x1 tiles")
            }
            TextureShapeError::PackedShapeMismatch => {
                write!(
                    formatter,
                    "packed mip levels and packed tiles must both be zero or both be non-zero"
                )
            }
            TextureShapeError::NoTiles => {
                write!(formatter, "texture shape describes no tiles at all")
            }
            TextureShapeError::ShapeTooLarge => {
                write!(formatter, "texture shape exceeds supported tile index range")
            }
        }
    }
}

impl std::error::Error for TextureShapeError {}

/// Tiling of one regular mip level within the flat tile index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipLevelTiling {
    pub first_tile_index: u32,
    pub tiles_x: u32,
    pub tiles_y: u32,
}

/// Key under which textures with an identical tiling shape share one
/// [`TilingLayout`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeKey {
    tile_width: u32,
    tile_height: u32,
    texture_width: u32,
    texture_height: u32,
    packed_mip_levels_num: u32,
    packed_tiles_num: u32,
    level_dims: Vec<(u32, u32)>,
}

impl ShapeKey {
    pub fn of(desc: &TiledTextureDesc) -> Self {
        Self {
            tile_width: desc.tile_width,
            tile_height: desc.tile_height,
            texture_width: desc.texture_width,
            texture_height: desc.texture_height,
            packed_mip_levels_num: desc.packed_mip_levels_num,
            packed_tiles_num: desc.packed_tiles_num,
            level_dims: desc
                .tiled_level_descs
                .iter()
                .map(|level| (level.width_in_tiles, level.height_in_tiles))
                .collect(),
        }
    }
}

/// Derived tiling tables for one texture shape. All textures with the same
/// shape share one layout instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilingLayout {
    pub regular_tiles_num: u32,
    pub packed_tiles_num: u32,
    pub regular_mip_levels_num: u32,
    pub packed_mip_levels_num: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub feedback_granularity_x: u32,
    pub feedback_granularity_y: u32,
    pub feedback_tiles_x: u32,
    pub feedback_tiles_y: u32,
    pub mip_level_tilings: Vec<MipLevelTiling>,
    pub tile_coords: Vec<TileCoord>,
    /// For every regular tile, the index of its parent tile one mip level
    /// coarser, or `regular_tiles_num` when the parent lives in the packed
    /// tail.
    pub parent_tiles: Vec<u32>,
}

impl TilingLayout {
    pub fn new(desc: &TiledTextureDesc) -> Result<Self, TextureShapeError> {
        if !desc.tile_width.is_power_of_two() || !desc.tile_height.is_power_of_two() {
            return Err(TextureShapeError::TileDimensionNotPowerOfTwo);
        }
        if desc.texture_width == 0 || desc.texture_height == 0 {
            return Err(TextureShapeError::TextureDimensionZero);
        }
        if (desc.packed_mip_levels_num == 0) != (desc.packed_tiles_num == 0) {
            return Err(TextureShapeError::PackedShapeMismatch);
        }

        let mut mip_level_tilings = Vec::with_capacity(desc.tiled_level_descs.len());
        let mut regular_tiles_num = 0u32;
        for level in &desc.tiled_level_descs {
            if level.width_in_tiles == 0 || level.height_in_tiles == 0 {
                return Err(TextureShapeError::LevelDimensionZero);
            }
            mip_level_tilings.push(MipLevelTiling {
                first_tile_index: regular_tiles_num,
                tiles_x: level.width_in_tiles,
                tiles_y: level.height_in_tiles,
            });
            let level_tiles = level
                .width_in_tiles
                .checked_mul(level.height_in_tiles)
                .ok_or(TextureShapeError::ShapeTooLarge)?;
            regular_tiles_num = regular_tiles_num
                .checked_add(level_tiles)
                .ok_or(TextureShapeError::ShapeTooLarge)?;
        }
        let tiles_num = regular_tiles_num
            .checked_add(desc.packed_tiles_num)
            .ok_or(TextureShapeError::ShapeTooLarge)?;
        if tiles_num == 0 {
            return Err(TextureShapeError::NoTiles);
        }

        let regular_mip_levels_num = desc.regular_mip_levels_num();
        let (feedback_granularity_x, feedback_tiles_x) =
            feedback_axis(desc.texture_width, desc.tile_width);
        let (feedback_granularity_y, feedback_tiles_y) =
            feedback_axis(desc.texture_height, desc.tile_height);

        let mut tile_coords = Vec::with_capacity(tiles_num as usize);
        let mut parent_tiles = Vec::with_capacity(regular_tiles_num as usize);
        for (mip_level, tiling) in mip_level_tilings.iter().enumerate() {
            let next_mip_level = mip_level + 1;
            for tile_y in 0..tiling.tiles_y {
                for tile_x in 0..tiling.tiles_x {
                    tile_coords.push(TileCoord {
                        x: tile_x,
                        y: tile_y,
                        mip_level: mip_level as u32,
                    });
                    let parent = match mip_level_tilings.get(next_mip_level) {
                        Some(parent_tiling) => {
                            parent_tiling.first_tile_index
                                + (tile_y >> 1) * parent_tiling.tiles_x
                                + (tile_x >> 1)
                        }
                        None => regular_tiles_num,
                    };
                    parent_tiles.push(parent);
                }
            }
        }
        for packed_index in 0..desc.packed_tiles_num {
            tile_coords.push(TileCoord {
                x: packed_index,
                y: 0,
                mip_level: regular_mip_levels_num,
            });
        }

        Ok(Self {
            regular_tiles_num,
            packed_tiles_num: desc.packed_tiles_num,
            regular_mip_levels_num,
            packed_mip_levels_num: desc.packed_mip_levels_num,
            tile_width: desc.tile_width,
            tile_height: desc.tile_height,
            feedback_granularity_x,
            feedback_granularity_y,
            feedback_tiles_x,
            feedback_tiles_y,
            mip_level_tilings,
            tile_coords,
            parent_tiles,
        })
    }

    pub fn total_tiles_num(&self) -> u32 {
        self.regular_tiles_num + self.packed_tiles_num
    }

    pub fn is_regular_tile(&self, tile_index: u32) -> bool {
        tile_index < self.regular_tiles_num
    }

    /// Flat tile index for a coordinate. Coordinates in the packed tail map
    /// to `regular_tiles_num`, the first packed tile.
    pub fn tile_index(&self, coord: TileCoord) -> u32 {
        if coord.mip_level >= self.regular_mip_levels_num {
            return self.regular_tiles_num;
        }
        let tiling = &self.mip_level_tilings[coord.mip_level as usize];
        tiling.first_tile_index + coord.y * tiling.tiles_x + coord.x
    }

    /// Dimensions of the per-tile residency image: one byte per tile of the
    /// finest regular level, or a single byte when every mip is packed.
    pub fn min_mip_dims(&self) -> (u32, u32) {
        match self.mip_level_tilings.first() {
            Some(tiling) if self.regular_tiles_num > 0 => (tiling.tiles_x, tiling.tiles_y),
            _ => (1, 1),
        }
    }
}

/// Feedback tile edge for one axis: start from the tile edge and walk down
/// through powers of two until the feedback tile fits into half the texture
/// edge. Returns the granularity (`tile_dim / feedback_tile`) and the
/// feedback image extent along the axis.
fn feedback_axis(texture_dim: u32, tile_dim: u32) -> (u32, u32) {
    let half_dim = texture_dim / 2;
    let mut feedback_tile = tile_dim;
    while feedback_tile > half_dim && feedback_tile > 1 {
        feedback_tile = prev_power_of_two(feedback_tile - 1);
    }
    let granularity = tile_dim / feedback_tile;
    let feedback_tiles = texture_dim.div_ceil(feedback_tile);
    (granularity, feedback_tiles)
}

pub fn prev_power_of_two(value: u32) -> u32 {
    if value == 0 {
        return 0;
    }
    1 << (31 - value.leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_desc(texture_dim: u32, tile_dim: u32, levels: &[(u32, u32)]) -> TiledTextureDesc {
        TiledTextureDesc {
            texture_width: texture_dim,
            texture_height: texture_dim,
            tiled_level_descs: levels
                .iter()
                .map(|&(width_in_tiles, height_in_tiles)| TiledLevelDesc {
                    width_in_tiles,
                    height_in_tiles,
                })
                .collect(),
            packed_mip_levels_num: 0,
            packed_tiles_num: 0,
            tile_width: tile_dim,
            tile_height: tile_dim,
        }
    }

    #[test]
    fn prev_power_of_two_rounds_down() {
        assert_eq!(prev_power_of_two(0), 0);
        assert_eq!(prev_power_of_two(1), 1);
        assert_eq!(prev_power_of_two(2), 2);
        assert_eq!(prev_power_of_two(3), 2);
        assert_eq!(prev_power_of_two(255), 128);
        assert_eq!(prev_power_of_two(256), 256);
    }

    #[test]
    fn layout_indexes_levels_finest_first() {
        let desc = square_desc(1024, 256, &[(4, 4), (2, 2), (1, 1)]);
        let layout = TilingLayout::new(&desc).expect("layout");

        assert_eq!(layout.regular_tiles_num, 21);
        assert_eq!(layout.mip_level_tilings[0].first_tile_index, 0);
        assert_eq!(layout.mip_level_tilings[1].first_tile_index, 16);
        assert_eq!(layout.mip_level_tilings[2].first_tile_index, 20);
        assert_eq!(
            layout.tile_index(TileCoord {
                x: 1,
                y: 1,
                mip_level: 1
            }),
            19
        );
        assert_eq!(
            layout.tile_coords[19],
            TileCoord {
                x: 1,
                y: 1,
                mip_level: 1
            }
        );
    }

    #[test]
    fn parent_table_halves_coordinates() {
        let desc = square_desc(1024, 256, &[(4, 4), (2, 2), (1, 1)]);
        let layout = TilingLayout::new(&desc).expect("layout");

        // tile (3, 2) on mip 0 -> (1, 1) on mip 1 -> (0, 0) on mip 2
        let tile = layout.tile_index(TileCoord {
            x: 3,
            y: 2,
            mip_level: 0,
        });
        let parent = layout.parent_tiles[tile as usize];
        assert_eq!(
            layout.tile_coords[parent as usize],
            TileCoord {
                x: 1,
                y: 1,
                mip_level: 1
            }
        );
        let grandparent = layout.parent_tiles[parent as usize];
        assert_eq!(
            layout.tile_coords[grandparent as usize],
            TileCoord {
                x: 0,
                y: 0,
                mip_level: 2
            }
        );
        // the coarsest regular level parents into the packed sentinel
        assert_eq!(
            layout.parent_tiles[grandparent as usize],
            layout.regular_tiles_num
        );
    }

    #[test]
    fn packed_tiles_follow_regular_tiles() {
        let mut desc = square_desc(1024, 256, &[(4, 4), (2, 2), (1, 1)]);
        desc.packed_mip_levels_num = 3;
        desc.packed_tiles_num = 2;
        let layout = TilingLayout::new(&desc).expect("layout");

        assert_eq!(layout.total_tiles_num(), 23);
        assert_eq!(
            layout.tile_coords[21],
            TileCoord {
                x: 0,
                y: 0,
                mip_level: 3
            }
        );
        assert_eq!(
            layout.tile_coords[22],
            TileCoord {
                x: 1,
                y: 0,
                mip_level: 3
            }
        );
        assert_eq!(
            layout.tile_index(TileCoord {
                x: 0,
                y: 0,
                mip_level: 5
            }),
            21
        );
    }

    #[test]
    fn feedback_geometry_shrinks_for_small_textures() {
        // texture much larger than a tile: one feedback texel per tile
        let large = TilingLayout::new(&square_desc(4096, 256, &[(16, 16)])).expect("layout");
        assert_eq!(large.feedback_granularity_x, 1);
        assert_eq!(large.feedback_tiles_x, 16);

        // texture equal to one tile: feedback tiles drop to half the texture
        let small = TilingLayout::new(&square_desc(256, 256, &[(1, 1)])).expect("layout");
        assert_eq!(small.feedback_granularity_x, 2);
        assert_eq!(small.feedback_tiles_x, 2);
        assert_eq!(small.feedback_tiles_y, 2);
    }

    #[test]
    fn degenerate_one_texel_texture_keeps_geometry_finite() {
        let layout = TilingLayout::new(&square_desc(1, 1, &[(1, 1)])).expect("layout");
        assert_eq!(layout.feedback_granularity_x, 1);
        assert_eq!(layout.feedback_tiles_x, 1);
    }

    #[test]
    fn rejects_malformed_shapes() {
        let mut desc = square_desc(1024, 256, &[(4, 4)]);
        desc.tile_width = 100;
        assert_eq!(
            TilingLayout::new(&desc),
            Err(TextureShapeError::TileDimensionNotPowerOfTwo)
        );

        let mut desc = square_desc(1024, 256, &[(4, 4)]);
        desc.packed_tiles_num = 1;
        assert_eq!(
            TilingLayout::new(&desc),
            Err(TextureShapeError::PackedShapeMismatch)
        );

        let desc = square_desc(1024, 256, &[]);
        assert_eq!(TilingLayout::new(&desc), Err(TextureShapeError::NoTiles));

        let desc = square_desc(1024, 256, &[(4, 0)]);
        assert_eq!(
            TilingLayout::new(&desc),
            Err(TextureShapeError::LevelDimensionZero)
        );
    }

    #[test]
    fn shape_key_matches_identical_shapes_only() {
        let desc_a = square_desc(1024, 256, &[(4, 4), (2, 2)]);
        let desc_b = square_desc(1024, 256, &[(4, 4), (2, 2)]);
        let desc_c = square_desc(1000, 256, &[(4, 4), (2, 2)]);

        assert_eq!(ShapeKey::of(&desc_a), ShapeKey::of(&desc_b));
        // same tile grid but different texel extent implies different
        // feedback geometry, so the layouts must not be shared
        assert_ne!(ShapeKey::of(&desc_a), ShapeKey::of(&desc_c));
    }
}
