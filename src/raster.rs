//! Raster types shared across the pipeline: one `Raster` per acquisition
//! channel, one `LabelMask` per segmentation output. Label 0 is background.

use ndarray::Array2;

use crate::error::{Error, Result};

/// 2D channel image, row-major (y, x).
pub type Raster = Array2<f32>;

/// 2D label mask; 0 = background, positive ints are cell labels.
pub type LabelMask = Array2<u32>;

/// Reject empty rasters and cross-channel shape mismatches up front.
pub fn validate_channels(channels: &[Raster]) -> Result<(usize, usize)> {
    let first = channels
        .first()
        .ok_or_else(|| Error::Segmentation("no input channels".into()))?;
    let (h, w) = first.dim();
    if h == 0 || w == 0 {
        return Err(Error::Segmentation(format!(
            "degenerate raster shape {}x{}",
            h, w
        )));
    }
    for (i, ch) in channels.iter().enumerate() {
        if ch.dim() != (h, w) {
            return Err(Error::Segmentation(format!(
                "channel {} shape {:?} does not match channel 0 shape {:?}",
                i,
                ch.dim(),
                (h, w)
            )));
        }
    }
    Ok((h, w))
}

/// Value at quantile `q` in [0,1]. O(n) selection, mutates the scratch slice.
pub fn quantile_in_place(values: &mut [f32], q: f64) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let idx = ((values.len() - 1) as f64 * q).round() as usize;
    let (_, nth, _) = values.select_nth_unstable_by(idx, |a, b| a.total_cmp(b));
    *nth
}

/// Min-max rescale to [0,1]; a flat raster maps to all zeros.
pub fn min_max_normalize(raster: &Raster) -> Raster {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in raster.iter() {
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }
    let range = max - min;
    if range > 0.0 {
        raster.mapv(|v| (v - min) / range)
    } else {
        Array2::zeros(raster.dim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn quantile_selects_expected_values() {
        let mut v: Vec<f32> = (0..101).map(|i| i as f32).collect();
        assert_eq!(quantile_in_place(&mut v, 0.0), 0.0);
        assert_eq!(quantile_in_place(&mut v, 0.5), 50.0);
        assert_eq!(quantile_in_place(&mut v, 1.0), 100.0);
    }

    #[test]
    fn min_max_handles_flat_input() {
        let r: Raster = Array2::from_elem((4, 4), 7.0);
        assert!(min_max_normalize(&r).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn mismatched_channels_are_rejected() {
        let a: Raster = Array2::zeros((10, 10));
        let b: Raster = Array2::zeros((10, 11));
        assert!(matches!(
            validate_channels(&[a, b]),
            Err(crate::error::Error::Segmentation(_))
        ));
    }

    #[test]
    fn min_max_rescales_to_unit_range() {
        let r: Raster = array![[2.0, 4.0], [6.0, 10.0]];
        let n = min_max_normalize(&r);
        assert_eq!(n[[0, 0]], 0.0);
        assert_eq!(n[[1, 1]], 1.0);
    }
}
