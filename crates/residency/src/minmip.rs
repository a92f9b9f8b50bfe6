use model::TilingLayout;

use crate::texture::{TextureState, TileState};

/// Writes the per-tile residency image consumed by shaders: for every cell
/// of the finest regular level, the finest mip whose resident chain is
/// unbroken down to that level.
///
/// Tiles are visited coarsest level first. A resident tile only steps its
/// footprint from `m + 1` down to `m`, so a finer tile is advertised only
/// when its parent already advertises `m + 1`; a hole in the middle of the
/// chain stops the walk and the cell keeps the coarser value.
pub(crate) fn write_min_mip_data(layout: &TilingLayout, texture: &TextureState, data: &mut [u8]) {
    let (min_mip_width, min_mip_height) = layout.min_mip_dims();
    let expected_len = (min_mip_width * min_mip_height) as usize;
    assert_eq!(data.len(), expected_len, "min mip buffer length mismatch");

    // everything coarser than the regular levels is always resident
    data.fill(layout.regular_mip_levels_num as u8);

    for tile_index in (0..layout.regular_tiles_num).rev() {
        match texture.tile_state(tile_index) {
            TileState::Mapped | TileState::Standby => {}
            _ => continue,
        }

        let coord = layout.tile_coords[tile_index as usize];
        let mip_level = coord.mip_level;
        let side = 1u32 << mip_level;
        let x_start = coord.x << mip_level;
        let y_start = coord.y << mip_level;
        for y in y_start..(y_start + side).min(min_mip_height) {
            for x in x_start..(x_start + side).min(min_mip_width) {
                let cell = (y * min_mip_width + x) as usize;
                if data[cell] == (mip_level + 1) as u8 {
                    data[cell] = mip_level as u8;
                }
            }
        }
    }
}
