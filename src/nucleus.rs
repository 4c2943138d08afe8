//! Nucleus segmentation: local-median background subtraction, thresholding,
//! speckle cleanup, distance-transform peak seeding, seeded watershed,
//! optional uniform dilation, then size and edge-contact filtering.
//!
//! Both filters run after dilation, on the geometry extraction will see.
//! An image with no surviving foreground yields an empty mask, not an error.

use ndarray::Array2;

use crate::config::NucleusConfig;
use crate::error::{Error, Result};
use crate::morph;
use crate::raster::{LabelMask, Raster};
use crate::watershed;

pub fn segment_nuclei(channel: &Raster, cfg: &NucleusConfig) -> Result<LabelMask> {
    cfg.validate()?;
    let (h, w) = channel.dim();
    if h == 0 || w == 0 {
        return Err(Error::Segmentation(format!(
            "degenerate raster shape {}x{}",
            h, w
        )));
    }

    let background = local_median_background(channel, cfg.median_block, cfg.median_step);
    let mut foreground = Array2::from_elem((h, w), false);
    for y in 0..h {
        for x in 0..w {
            foreground[[y, x]] = channel[[y, x]] > background[[y, x]] + cfg.threshold;
        }
    }

    let foreground = morph::binary_close(&morph::binary_open(&foreground, cfg.speckle_kernel), cfg.speckle_kernel);

    let dist = watershed::distance_transform(&foreground);
    let seeds = watershed::find_peaks(&dist, cfg.peak_footprint, cfg.min_distance);
    if seeds.is_empty() {
        return Ok(Array2::zeros((h, w)));
    }

    let surface = dist.mapv(|v| -v);
    let labels = watershed::watershed(&surface, &seeds, &foreground);
    let mut labels = morph::dilate_labels(&labels, cfg.dilation);

    morph::filter_labels(
        &mut labels,
        cfg.min_size,
        cfg.max_size,
        Some(cfg.contact_filter),
    );
    morph::relabel_contiguous(&mut labels);
    Ok(labels)
}

/// Block-wise median background: sample a `block`-sized window every `step`
/// pixels, then bilinearly upsample the grid to full resolution.
fn local_median_background(channel: &Raster, block: usize, step: usize) -> Raster {
    let (h, w) = channel.dim();
    let gy = h.div_ceil(step);
    let gx = w.div_ceil(step);
    let r = (block / 2) as isize;
    let mut grid: Array2<f32> = Array2::zeros((gy, gx));
    let mut window: Vec<f32> = Vec::with_capacity(block * block);
    for iy in 0..gy {
        for ix in 0..gx {
            let cy = (iy * step).min(h - 1) as isize;
            let cx = (ix * step).min(w - 1) as isize;
            window.clear();
            let y0 = (cy - r).max(0) as usize;
            let y1 = ((cy + r) as usize).min(h - 1);
            let x0 = (cx - r).max(0) as usize;
            let x1 = ((cx + r) as usize).min(w - 1);
            for y in y0..=y1 {
                for x in x0..=x1 {
                    window.push(channel[[y, x]]);
                }
            }
            let mid = window.len() / 2;
            let (_, nth, _) = window.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
            grid[[iy, ix]] = *nth;
        }
    }

    Array2::from_shape_fn((h, w), |(y, x)| {
        let fy = y as f32 / step as f32;
        let fx = x as f32 / step as f32;
        let iy0 = (fy as usize).min(gy - 1);
        let ix0 = (fx as usize).min(gx - 1);
        let iy1 = (iy0 + 1).min(gy - 1);
        let ix1 = (ix0 + 1).min(gx - 1);
        let ty = fy - iy0 as f32;
        let tx = fx - ix0 as f32;
        let top = grid[[iy0, ix0]] * (1.0 - tx) + grid[[iy0, ix1]] * tx;
        let bottom = grid[[iy1, ix0]] * (1.0 - tx) + grid[[iy1, ix1]] * tx;
        top * (1.0 - ty) + bottom * ty
    })
}
