//! Per-channel intensity normalization: clip to the configured quantile
//! range, rescale to [0,1], then median-smooth. Deterministic and
//! stateless across channels.

use ndarray::Array2;

use crate::config::PreprocessConfig;
use crate::error::Result;
use crate::raster::{quantile_in_place, Raster};

pub fn normalize_channel(channel: &Raster, cfg: &PreprocessConfig) -> Result<Raster> {
    cfg.validate()?;
    let mut scratch: Vec<f32> = channel.iter().copied().collect();
    let lo = quantile_in_place(&mut scratch, cfg.lower_quantile_normalization);
    let hi = quantile_in_place(&mut scratch, cfg.upper_quantile_normalization);
    let range = hi - lo;
    let clipped = if range > 0.0 {
        channel.mapv(|v| ((v - lo) / range).clamp(0.0, 1.0))
    } else {
        Array2::zeros(channel.dim())
    };
    Ok(median_filter(&clipped, cfg.median_filter_size))
}

pub fn normalize_channels(channels: &[Raster], cfg: &PreprocessConfig) -> Result<Vec<Raster>> {
    channels.iter().map(|ch| normalize_channel(ch, cfg)).collect()
}

/// Median filter with radius `r` (window 2r+1), edge-clamped. r = 0 is a no-op.
fn median_filter(raster: &Raster, r: usize) -> Raster {
    if r == 0 {
        return raster.clone();
    }
    let (h, w) = raster.dim();
    let r = r as isize;
    let mut out = Array2::zeros((h, w));
    let mut window: Vec<f32> = Vec::with_capacity(((2 * r + 1) * (2 * r + 1)) as usize);
    for y in 0..h {
        for x in 0..w {
            window.clear();
            for dy in -r..=r {
                for dx in -r..=r {
                    let ny = (y as isize + dy).clamp(0, h as isize - 1) as usize;
                    let nx = (x as isize + dx).clamp(0, w as isize - 1) as usize;
                    window.push(raster[[ny, nx]]);
                }
            }
            let mid = window.len() / 2;
            let (_, nth, _) = window.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
            out[[y, x]] = *nth;
        }
    }
    out
}
