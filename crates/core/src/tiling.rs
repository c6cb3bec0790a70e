//! Tile grid computation for overlapping tiled inference.
//!
//! Tiles advance by `tile_size - overlap`; the last row and column are pinned
//! to the bottom/right image edges instead of overflowing, so every tile lies
//! fully inside the image and every pixel is covered at least once.

use tracing::debug;

use crate::error::{Result, UpscaleError};

/// A tile rectangle in source-image pixel coordinates plus its grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePosition {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub row: u32,
    pub col: u32,
}

/// Row-major tiles covering an image, with the grid extents they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGridLayout {
    tiles: Vec<TilePosition>,
    rows: u32,
    cols: u32,
    image_width: u32,
    image_height: u32,
}

impl TileGridLayout {
    pub fn compute(
        image_width: u32,
        image_height: u32,
        tile_size: u32,
        overlap: u32,
    ) -> Result<Self> {
        if image_width == 0 || image_height == 0 {
            return Err(UpscaleError::invalid(format!(
                "image dimensions must be non-zero, got {image_width}x{image_height}"
            )));
        }
        if tile_size == 0 {
            return Err(UpscaleError::invalid("tile_size must be greater than 0"));
        }
        if tile_size <= overlap {
            return Err(UpscaleError::invalid(format!(
                "tile_size ({tile_size}) must be greater than overlap ({overlap})"
            )));
        }

        let step = tile_size - overlap;
        let rows = axis_count(image_height, overlap, step);
        let cols = axis_count(image_width, overlap, step);

        let max_x = image_width.saturating_sub(tile_size);
        let max_y = image_height.saturating_sub(tile_size);

        let mut tiles = Vec::with_capacity((rows * cols) as usize);
        for row in 0..rows {
            let y = (row * step).min(max_y);
            let height = tile_size.min(image_height - y);
            for col in 0..cols {
                let x = (col * step).min(max_x);
                let width = tile_size.min(image_width - x);
                tiles.push(TilePosition {
                    x,
                    y,
                    width,
                    height,
                    row,
                    col,
                });
            }
        }

        debug!(
            image_width,
            image_height,
            tile_size,
            overlap,
            rows,
            cols,
            "Computed tile grid"
        );

        Ok(Self {
            tiles,
            rows,
            cols,
            image_width,
            image_height,
        })
    }

    pub fn tiles(&self) -> &[TilePosition] {
        &self.tiles
    }

    pub fn iter(&self) -> impl Iterator<Item = &TilePosition> {
        self.tiles.iter()
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn image_width(&self) -> u32 {
        self.image_width
    }

    pub fn image_height(&self) -> u32 {
        self.image_height
    }

    pub fn is_top(&self, tile: &TilePosition) -> bool {
        tile.row == 0
    }

    pub fn is_left(&self, tile: &TilePosition) -> bool {
        tile.col == 0
    }

    pub fn is_bottom(&self, tile: &TilePosition) -> bool {
        tile.row + 1 == self.rows
    }

    pub fn is_right(&self, tile: &TilePosition) -> bool {
        tile.col + 1 == self.cols
    }
}

impl<'a> IntoIterator for &'a TileGridLayout {
    type Item = &'a TilePosition;
    type IntoIter = std::slice::Iter<'a, TilePosition>;

    fn into_iter(self) -> Self::IntoIter {
        self.tiles.iter()
    }
}

/// `max(1, ceil((extent - overlap) / step))`, with `extent <= overlap` yielding 1.
fn axis_count(extent: u32, overlap: u32, step: u32) -> u32 {
    let span = extent.saturating_sub(overlap);
    span.div_ceil(step).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_full_coverage(width: u32, height: u32, tile_size: u32, overlap: u32) {
        let layout = TileGridLayout::compute(width, height, tile_size, overlap).unwrap();
        let mut covered = vec![false; (width * height) as usize];
        for tile in &layout {
            assert!(tile.x + tile.width <= width, "{tile:?} overflows width {width}");
            assert!(tile.y + tile.height <= height, "{tile:?} overflows height {height}");
            for y in tile.y..tile.y + tile.height {
                for x in tile.x..tile.x + tile.width {
                    covered[(y * width + x) as usize] = true;
                }
            }
        }
        if let Some(index) = covered.iter().position(|c| !c) {
            let index = index as u32;
            panic!(
                "pixel ({}, {}) not covered for {width}x{height} tile={tile_size} overlap={overlap}",
                index % width,
                index / width
            );
        }
    }

    #[test]
    fn single_tile_for_small_image() {
        let layout = TileGridLayout::compute(64, 64, 512, 32).unwrap();
        assert_eq!(layout.len(), 1);
        let tile = layout.tiles()[0];
        assert_eq!((tile.x, tile.y, tile.width, tile.height), (0, 0, 64, 64));
        assert_eq!((layout.rows(), layout.cols()), (1, 1));
    }

    #[test]
    fn multiple_tiles_for_large_image() {
        let layout = TileGridLayout::compute(1024, 1024, 512, 32).unwrap();
        // step 480: ceil(992 / 480) = 3 per axis
        assert_eq!((layout.rows(), layout.cols()), (3, 3));
        assert_eq!(layout.len(), 9);
    }

    #[test]
    fn last_tiles_are_pinned_to_edges() {
        let layout = TileGridLayout::compute(1000, 800, 256, 32).unwrap();
        for tile in &layout {
            if layout.is_right(tile) {
                assert_eq!(tile.x + tile.width, 1000);
                assert_eq!(tile.width, 256);
            }
            if layout.is_bottom(tile) {
                assert_eq!(tile.y + tile.height, 800);
            }
        }
    }

    #[test]
    fn tiles_cover_image() {
        assert_full_coverage(1000, 800, 256, 32);
        assert_full_coverage(500, 300, 128, 16);
        assert_full_coverage(100, 100, 50, 10);
    }

    #[test]
    fn coverage_holds_across_many_configurations() {
        for &(w, h) in &[(1, 1), (7, 3), (65, 64), (129, 31), (300, 301)] {
            for &(tile, overlap) in &[(64, 0), (64, 16), (64, 63), (32, 8), (17, 5)] {
                assert_full_coverage(w, h, tile, overlap);
            }
        }
    }

    #[test]
    fn indices_are_dense_and_row_major() {
        let layout = TileGridLayout::compute(300, 200, 64, 16).unwrap();
        let mut expected = Vec::new();
        for row in 0..layout.rows() {
            for col in 0..layout.cols() {
                expected.push((row, col));
            }
        }
        let actual: Vec<_> = layout.iter().map(|t| (t.row, t.col)).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn boundary_flags_follow_grid_extents() {
        let layout = TileGridLayout::compute(200, 200, 64, 16).unwrap();
        let first = layout.tiles()[0];
        let last = *layout.tiles().last().unwrap();
        assert!(layout.is_top(&first) && layout.is_left(&first));
        assert!(!layout.is_bottom(&first) && !layout.is_right(&first));
        assert!(layout.is_bottom(&last) && layout.is_right(&last));
    }

    #[test]
    fn overlap_not_smaller_than_tile_is_rejected() {
        let err = TileGridLayout::compute(100, 100, 32, 32).unwrap_err();
        assert!(matches!(err, UpscaleError::InvalidConfiguration(_)));
        assert!(TileGridLayout::compute(100, 100, 16, 32).is_err());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        assert!(TileGridLayout::compute(0, 10, 64, 8).is_err());
        assert!(TileGridLayout::compute(10, 0, 64, 8).is_err());
        assert!(TileGridLayout::compute(10, 10, 0, 0).is_err());
    }

    #[test]
    fn deterministic() {
        let a = TileGridLayout::compute(777, 555, 128, 24).unwrap();
        let b = TileGridLayout::compute(777, 555, 128, 24).unwrap();
        assert_eq!(a, b);
    }
}
