use model::{TileCoord, TilingLayout};

use crate::bits::BitArray;
use crate::SamplerFeedbackDesc;

/// Requested tile set decoded from one feedback image.
#[derive(Debug)]
pub(crate) struct DecodedRequests {
    pub(crate) bits: BitArray,
    /// Lowest regular tile index that was requested, if any.
    pub(crate) first_tile_index: Option<u32>,
}

/// Decodes a MinMip feedback image into the requested tile set. Every packed
/// tile is always requested. A missing image decodes to packed tiles only,
/// which still lets the caller run timeout processing for the frame.
pub(crate) fn decode_sampler_feedback(
    layout: &TilingLayout,
    feedback: &SamplerFeedbackDesc<'_>,
) -> DecodedRequests {
    let mut bits = BitArray::new(layout.total_tiles_num());
    for packed_index in 0..layout.packed_tiles_num {
        bits.set(layout.regular_tiles_num + packed_index);
    }

    let mut first_tile_index = None;
    if let Some(data) = feedback.min_mip_data {
        let feedback_tiles_num = (layout.feedback_tiles_x * layout.feedback_tiles_y) as usize;
        assert_eq!(
            data.len(),
            feedback_tiles_num,
            "feedback image size does not match the texture's feedback geometry"
        );

        // Whole 8-byte groups of 0xFF (nothing sampled) are skipped in one
        // comparison when the image size allows it.
        let batched = feedback_tiles_num % 8 == 0;
        let mut index = 0usize;
        while index < feedback_tiles_num {
            if batched && index % 8 == 0 {
                let group =
                    u64::from_ne_bytes(data[index..index + 8].try_into().expect("batch window"));
                if group == u64::MAX {
                    index += 8;
                    continue;
                }
            }

            let byte = data[index];
            if byte != 0xFF {
                let mip_level = requested_mip_level(layout, feedback, byte);
                if mip_level < layout.regular_mip_levels_num {
                    let index = index as u32;
                    let coord = TileCoord {
                        x: ((index % layout.feedback_tiles_x) / layout.feedback_granularity_x)
                            >> mip_level,
                        y: ((index / layout.feedback_tiles_x) / layout.feedback_granularity_y)
                            >> mip_level,
                        mip_level,
                    };
                    let tile_index = layout.tile_index(coord);
                    first_tile_index = Some(match first_tile_index {
                        Some(first) => tile_index.min(first),
                        None => tile_index,
                    });
                    bits.set(tile_index);
                }
            }

            index += 1;
        }

        if let Some(first) = first_tile_index {
            propagate_to_parents(layout, &mut bits, first);
        }
    }

    DecodedRequests {
        bits,
        first_tile_index,
    }
}

/// Mip level requested by one feedback byte, after bias and the optional
/// streamed-level clamp. Values at or beyond the regular level count land in
/// the packed tail.
fn requested_mip_level(
    layout: &TilingLayout,
    feedback: &SamplerFeedbackDesc<'_>,
    byte: u8,
) -> u32 {
    let mut mip_level = (byte as i32 + feedback.mip_level_bias).max(0) as u32;
    if feedback.streamed_mip_levels_num > 0
        && feedback.streamed_mip_levels_num < layout.regular_mip_levels_num
    {
        // stream only the coarsest N regular levels
        mip_level = mip_level.max(layout.regular_mip_levels_num - feedback.streamed_mip_levels_num);
    }
    mip_level
}

/// Requesting a tile implies requesting its whole coarser ancestor chain.
/// One ascending pass suffices: a parent always has a higher tile index than
/// its children, so a bit set here is revisited later in the same scan.
pub(crate) fn propagate_to_parents(layout: &TilingLayout, bits: &mut BitArray, first: u32) {
    let last = match layout.mip_level_tilings.last() {
        Some(coarsest) if layout.regular_mip_levels_num > 1 => coarsest.first_tile_index,
        _ => 0,
    };
    for tile_index in first..last {
        if bits.get(tile_index) {
            bits.set(layout.parent_tiles[tile_index as usize]);
        }
    }
}
