//! Tile-shape chooser.
//!
//! Best-effort heuristic: pick a tile shape whose element count stays
//! near a budget while keeping the per-axis proportions of the cube,
//! optionally skewed by per-axis weights. The only strict bound is
//! per-axis containment: `1 <= tile[i] <= cell[i]`.

use crate::data::Shape;

/// Choose a tile shape for `cell_shape` with all axes weighted
/// equally.
pub fn make_tile_shape(cell_shape: &Shape, tolerance: f64, max_tile_elements: u64) -> Shape {
    let ndim = cell_shape.ndim();
    make_tile_shape_weighted(
        cell_shape,
        &vec![1.0; ndim],
        &vec![tolerance; ndim],
        max_tile_elements,
    )
}

/// Weighted variant: a larger weight biases the tile to stay longer
/// along that axis (better coherency for scans along it); the per-axis
/// tolerance widens the search window for a tile extent that divides
/// the cube with little padding waste.
pub fn make_tile_shape_weighted(
    cell_shape: &Shape,
    weights: &[f64],
    tolerances: &[f64],
    max_tile_elements: u64,
) -> Shape {
    let ndim = cell_shape.ndim();
    if ndim == 0 {
        return Shape::scalar();
    }
    let max_tile_elements = max_tile_elements.max(1);
    // A cube already inside the budget is its own tile.
    if cell_shape.product() <= max_tile_elements {
        return cell_shape.clone();
    }

    let dims: Vec<f64> = cell_shape.dims().iter().map(|&d| d as f64).collect();
    // Normalize weights to geometric mean 1 so they only skew the
    // proportions, not the overall volume.
    let weights: Vec<f64> = {
        let w: Vec<f64> = (0..ndim)
            .map(|i| weights.get(i).copied().unwrap_or(1.0).max(1e-6))
            .collect();
        let gm = w.iter().map(|x| x.ln()).sum::<f64>() / ndim as f64;
        let gm = gm.exp();
        w.iter().map(|x| x / gm).collect()
    };

    let mut tile: Vec<u64> = vec![1; ndim];
    // Iterative proportional scaling with per-axis clamping; a few
    // rounds settle even when clamps redistribute the budget.
    let mut scale = (max_tile_elements as f64 / cell_shape.product() as f64)
        .powf(1.0 / ndim as f64);
    for _ in 0..8 {
        for i in 0..ndim {
            let want = (dims[i] * scale * weights[i]).round().max(1.0);
            tile[i] = (want as u64).clamp(1, cell_shape.dims()[i]);
        }
        let prod: u64 = tile.iter().product();
        if prod <= max_tile_elements {
            break;
        }
        scale *= (max_tile_elements as f64 / prod as f64).powf(1.0 / ndim as f64);
    }
    // Final guard: shrink the largest axis until the budget holds.
    while tile.iter().product::<u64>() > max_tile_elements {
        let (axis, _) = tile
            .iter()
            .enumerate()
            .max_by_key(|&(_, &t)| t)
            .expect("non-empty tile");
        if tile[axis] == 1 {
            break;
        }
        tile[axis] = (tile[axis] + 1) / 2;
    }

    // Within the tolerance window, prefer an extent that divides the
    // axis with the least padding waste.
    for i in 0..ndim {
        let tol = tolerances.get(i).copied().unwrap_or(0.0).max(0.0);
        if tol == 0.0 || tile[i] >= cell_shape.dims()[i] {
            continue;
        }
        let lo = ((tile[i] as f64 * (1.0 - tol)).floor() as u64).max(1);
        let hi = ((tile[i] as f64 * (1.0 + tol)).ceil() as u64).min(cell_shape.dims()[i]);
        let waste = |t: u64| -> u64 { t * cell_shape.dims()[i].div_ceil(t) - cell_shape.dims()[i] };
        let mut best = (waste(tile[i]), 0, tile[i]);
        for cand in lo..=hi {
            let key = (waste(cand), cand.abs_diff(tile[i]), cand);
            if key < best {
                best = key;
            }
        }
        tile[i] = best.2;
    }

    Shape::new(tile)
}
