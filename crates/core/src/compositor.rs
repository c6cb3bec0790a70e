//! Runs an upsampler tile by tile and blends the results into one image.

use ndarray::{s, Array2, Array3, Axis};
use tracing::debug;

use crate::blend::{build_blend_mask, TileEdges};
use crate::error::{Result, UpscaleError};
use crate::tiling::TileGridLayout;
use crate::types::{Image, CHANNELS};

/// Weight floor applied before normalisation.
const MIN_WEIGHT: f32 = 1e-8;

/// Runs a fixed-scale upsampler over overlapping tiles and blends the results
/// back into one seamless output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCompositor {
    scale: u32,
    tile_size: u32,
    overlap: u32,
}

impl TileCompositor {
    pub fn new(scale: u32, tile_size: u32, overlap: u32) -> Result<Self> {
        if scale == 0 {
            return Err(UpscaleError::invalid("upsampler scale must be at least 1"));
        }
        Ok(Self {
            scale,
            tile_size,
            overlap,
        })
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn overlap(&self) -> u32 {
        self.overlap
    }

    /// Upscale `image` tile by tile.
    ///
    /// `upsample` must return exactly `scale` times the tile it is given.
    /// `on_progress(tiles_done, tiles_total)` fires after every tile.
    pub fn process<U, P>(&self, image: &Image, mut upsample: U, mut on_progress: P) -> Result<Image>
    where
        U: FnMut(&Image) -> Result<Image>,
        P: FnMut(usize, usize),
    {
        let layout =
            TileGridLayout::compute(image.width(), image.height(), self.tile_size, self.overlap)?;
        let scale = self.scale as usize;
        let out_h = image.height() as usize * scale;
        let out_w = image.width() as usize * scale;
        let scaled_overlap = self.overlap as usize * scale;

        let mut color = Array3::<f32>::zeros((CHANNELS, out_h, out_w));
        let mut weight = Array2::<f32>::zeros((out_h, out_w));
        let total = layout.len();

        for (index, tile) in layout.iter().enumerate() {
            let input = image.crop(tile.x, tile.y, tile.width, tile.height);
            let output = upsample(&input)?;

            let th = tile.height as usize * scale;
            let tw = tile.width as usize * scale;
            if output.height() as usize != th || output.width() as usize != tw {
                return Err(UpscaleError::DimensionMismatch(format!(
                    "tile ({}, {}) returned {}x{}, expected {tw}x{th} at scale {}",
                    tile.row,
                    tile.col,
                    output.width(),
                    output.height(),
                    self.scale
                )));
            }

            let edges = TileEdges {
                top: layout.is_top(tile),
                left: layout.is_left(tile),
                bottom: layout.is_bottom(tile),
                right: layout.is_right(tile),
            };
            let mask = build_blend_mask(th, tw, scaled_overlap, edges);

            let oy = tile.y as usize * scale;
            let ox = tile.x as usize * scale;
            let weighted = output.data() * &mask.view().insert_axis(Axis(0));
            let mut color_region = color.slice_mut(s![.., oy..oy + th, ox..ox + tw]);
            color_region += &weighted;
            let mut weight_region = weight.slice_mut(s![oy..oy + th, ox..ox + tw]);
            weight_region += &mask;

            debug!(
                row = tile.row,
                col = tile.col,
                done = index + 1,
                total,
                "Tile composited"
            );
            on_progress(index + 1, total);
        }

        weight.mapv_inplace(|w| w.max(MIN_WEIGHT));
        color /= &weight.insert_axis(Axis(0));

        Image::new(color, image.precision())
    }
}
