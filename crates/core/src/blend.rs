//! Feather masks for blending overlapping tile outputs.

use ndarray::{s, Array1, Array2, Axis};

/// Which sides of a tile lie on the image boundary. Boundary sides are never faded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileEdges {
    pub top: bool,
    pub left: bool,
    pub bottom: bool,
    pub right: bool,
}

/// Build the blend weight mask for one upscaled tile (`height x width`).
///
/// Interior pixels weigh 1.0. Sides facing a neighbouring tile ramp linearly
/// over `overlap` pixels, where position `i` counted from the outer edge weighs
/// `(i + 1) / (overlap + 1)`; two facing ramps therefore sum to 1.0 and every
/// weight stays strictly positive. Corners receive the product of both ramps.
/// Strips on image-boundary sides are reset to 1.0 after all ramps are applied.
pub fn build_blend_mask(height: usize, width: usize, overlap: usize, edges: TileEdges) -> Array2<f32> {
    let mut mask = Array2::<f32>::ones((height, width));
    if overlap == 0 {
        return mask;
    }

    let ramp = ramp(overlap);
    let reversed = ramp.slice(s![..;-1]).to_owned();

    if height > overlap {
        for (i, mut row) in mask.axis_iter_mut(Axis(0)).take(overlap).enumerate() {
            row *= ramp[i];
        }
        for (i, mut row) in mask
            .slice_mut(s![height - overlap.., ..])
            .axis_iter_mut(Axis(0))
            .enumerate()
        {
            row *= reversed[i];
        }
    }

    if width > overlap {
        for (i, mut col) in mask.axis_iter_mut(Axis(1)).take(overlap).enumerate() {
            col *= ramp[i];
        }
        for (i, mut col) in mask
            .slice_mut(s![.., width - overlap..])
            .axis_iter_mut(Axis(1))
            .enumerate()
        {
            col *= reversed[i];
        }
    }

    let strip_h = overlap.min(height);
    let strip_w = overlap.min(width);
    if edges.top {
        mask.slice_mut(s![..strip_h, ..]).fill(1.0);
    }
    if edges.bottom {
        mask.slice_mut(s![height - strip_h.., ..]).fill(1.0);
    }
    if edges.left {
        mask.slice_mut(s![.., ..strip_w]).fill(1.0);
    }
    if edges.right {
        mask.slice_mut(s![.., width - strip_w..]).fill(1.0);
    }

    mask
}

fn ramp(n: usize) -> Array1<f32> {
    let denom = (n + 1) as f32;
    Array1::from_shape_fn(n, |i| (i + 1) as f32 / denom)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERIOR: TileEdges = TileEdges {
        top: false,
        left: false,
        bottom: false,
        right: false,
    };

    #[test]
    fn zero_overlap_is_all_ones() {
        let mask = build_blend_mask(8, 6, 0, INTERIOR);
        assert!(mask.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn interior_tile_fades_every_side() {
        let mask = build_blend_mask(16, 16, 4, INTERIOR);
        assert_eq!(mask[[8, 8]], 1.0);
        assert!((mask[[8, 0]] - 0.2).abs() < 1e-6);
        assert!((mask[[0, 8]] - 0.2).abs() < 1e-6);
        assert!((mask[[8, 15]] - 0.2).abs() < 1e-6);
        assert!((mask[[15, 8]] - 0.2).abs() < 1e-6);
        assert!((mask[[0, 0]] - 0.04).abs() < 1e-6);
    }

    #[test]
    fn values_are_strictly_positive_and_bounded() {
        let mask = build_blend_mask(20, 12, 5, INTERIOR);
        assert!(mask.iter().all(|&v| v > 0.0 && v <= 1.0));
    }

    #[test]
    fn boundary_edges_are_not_faded() {
        let edges = TileEdges {
            top: true,
            left: true,
            bottom: false,
            right: false,
        };
        let mask = build_blend_mask(16, 16, 4, edges);
        assert!(mask.row(0).iter().all(|&v| v == 1.0));
        assert!(mask.column(0).iter().all(|&v| v == 1.0));
        assert!(mask[[15, 8]] < 1.0);
        assert!(mask[[8, 15]] < 1.0);
    }

    #[test]
    fn all_boundary_tile_is_uniform() {
        let edges = TileEdges {
            top: true,
            left: true,
            bottom: true,
            right: true,
        };
        let mask = build_blend_mask(10, 10, 3, edges);
        assert!(mask.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn facing_ramps_sum_to_one() {
        let n = 6;
        let left = build_blend_mask(4, 20, n, TileEdges { left: true, ..INTERIOR });
        let right = build_blend_mask(4, 20, n, TileEdges { right: true, ..INTERIOR });
        for j in 0..n {
            let a = left[[2, 20 - n + j]];
            let b = right[[2, j]];
            assert!((a + b - 1.0).abs() < 1e-6, "position {j}: {a} + {b}");
        }
    }

    #[test]
    fn overlap_not_smaller_than_dimension_skips_ramp() {
        let mask = build_blend_mask(4, 4, 4, INTERIOR);
        assert!(mask.iter().all(|&v| v == 1.0));
    }
}
