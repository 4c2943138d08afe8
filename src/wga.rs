//! Cytosol segmentation from a membrane stain, anchored on nucleus seeds.
//!
//! A Dijkstra front expands from every nucleus over an inverse-intensity
//! cost map restricted to the thresholded foreground; each pixel joins the
//! basin of the nucleus whose front arrives first, so every cytosol label
//! inherits the id of its generating nucleus and no matching step is needed.

use std::collections::HashMap;

use ndarray::Array2;

use crate::config::WgaConfig;
use crate::error::{Error, Result};
use crate::morph;
use crate::raster::{LabelMask, Raster};
use crate::segment::SegmentationMasks;
use crate::watershed;

// Floor on the step cost so fronts keep accumulating arrival time across
// saturated-bright regions.
const COST_EPSILON: f32 = 0.05;

pub fn segment_cytosol(
    channel: &Raster,
    nuclei: &LabelMask,
    cfg: &WgaConfig,
) -> Result<SegmentationMasks> {
    cfg.validate()?;
    if channel.dim() != nuclei.dim() {
        return Err(Error::Segmentation(format!(
            "cytosol channel shape {:?} does not match nucleus mask shape {:?}",
            channel.dim(),
            nuclei.dim()
        )));
    }
    let (h, w) = channel.dim();

    let range = cfg.max_clip - cfg.min_clip;
    let clipped = channel.mapv(|v| (v.clamp(cfg.min_clip, cfg.max_clip) - cfg.min_clip) / range);

    // Nucleus pixels are always traversable; the stain can be dim there.
    let mut foreground = Array2::from_elem((h, w), false);
    for y in 0..h {
        for x in 0..w {
            foreground[[y, x]] = clipped[[y, x]] > cfg.threshold || nuclei[[y, x]] != 0;
        }
    }

    let cost = clipped.mapv(|v| 1.0 - v + COST_EPSILON);
    let (labels, _arrival) = watershed::propagate_labels(&cost, nuclei, &foreground);

    let labels = morph::erode_labels(&labels, cfg.erosion);
    let mut cytosol = morph::dilate_labels(&labels, cfg.dilation);

    // A nucleus whose cytosol partner fails the size filter is dropped from
    // both masks; the two label sets must stay 1:1.
    morph::filter_labels(&mut cytosol, cfg.min_size, cfg.max_size, None);
    let surviving = morph::label_areas(&cytosol);
    let mut nucleus_out = nuclei.clone();
    for l in nucleus_out.iter_mut() {
        if *l != 0 && !surviving.contains_key(l) {
            *l = 0;
        }
    }
    // Cytosol labels whose nucleus vanished entirely cannot stay either.
    let nucleus_ids = morph::label_areas(&nucleus_out);
    for l in cytosol.iter_mut() {
        if *l != 0 && !nucleus_ids.contains_key(l) {
            *l = 0;
        }
    }

    let mapping = morph::relabel_contiguous(&mut cytosol);
    apply_mapping(&mut nucleus_out, &mapping);

    Ok(SegmentationMasks {
        nucleus: nucleus_out,
        cytosol,
    })
}

fn apply_mapping(labels: &mut LabelMask, mapping: &HashMap<u32, u32>) {
    for l in labels.iter_mut() {
        if *l != 0 {
            *l = mapping.get(l).copied().unwrap_or(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morph::label_areas;

    fn disk(mask: &mut LabelMask, cy: usize, cx: usize, radius: f64, label: u32) {
        let (h, w) = mask.dim();
        for y in 0..h {
            for x in 0..w {
                let dy = y as f64 - cy as f64;
                let dx = x as f64 - cx as f64;
                if (dy * dy + dx * dx).sqrt() <= radius {
                    mask[[y, x]] = label;
                }
            }
        }
    }

    fn test_config() -> WgaConfig {
        WgaConfig {
            threshold: 0.2,
            erosion: 0,
            dilation: 0,
            min_clip: 0.0,
            max_clip: 1.0,
            min_size: 10,
            max_size: 100_000,
        }
    }

    #[test]
    fn label_sets_are_identical() {
        let mut nuclei: LabelMask = Array2::zeros((80, 80));
        disk(&mut nuclei, 40, 25, 5.0, 1);
        disk(&mut nuclei, 40, 55, 5.0, 2);
        let mut channel: Raster = Array2::zeros((80, 80));
        for y in 25..56 {
            for x in 10..70 {
                channel[[y, x]] = 0.8;
            }
        }
        let masks = segment_cytosol(&channel, &nuclei, &test_config()).unwrap();
        let n_ids: Vec<u32> = {
            let mut v: Vec<u32> = label_areas(&masks.nucleus).keys().copied().collect();
            v.sort_unstable();
            v
        };
        let c_ids: Vec<u32> = {
            let mut v: Vec<u32> = label_areas(&masks.cytosol).keys().copied().collect();
            v.sort_unstable();
            v
        };
        assert_eq!(n_ids, c_ids);
        assert_eq!(n_ids, vec![1, 2]);
    }

    #[test]
    fn cytosol_extends_beyond_nucleus() {
        let mut nuclei: LabelMask = Array2::zeros((60, 60));
        disk(&mut nuclei, 30, 30, 4.0, 1);
        let mut channel: Raster = Array2::zeros((60, 60));
        for y in 18..43 {
            for x in 18..43 {
                channel[[y, x]] = 0.9;
            }
        }
        let masks = segment_cytosol(&channel, &nuclei, &test_config()).unwrap();
        let n_area = label_areas(&masks.nucleus)[&1];
        let c_area = label_areas(&masks.cytosol)[&1];
        assert!(c_area > n_area);
        // Cytosol covers its nucleus.
        for y in 0..60 {
            for x in 0..60 {
                if masks.nucleus[[y, x]] == 1 {
                    assert_eq!(masks.cytosol[[y, x]], 1);
                }
            }
        }
    }

    #[test]
    fn failing_cytosol_drops_nucleus_too() {
        let mut nuclei: LabelMask = Array2::zeros((80, 80));
        disk(&mut nuclei, 40, 20, 5.0, 1);
        disk(&mut nuclei, 40, 60, 5.0, 2);
        // Only nucleus 1 gets surrounding stain; nucleus 2 sits in darkness,
        // so its cytosol stays nucleus-sized and fails a high min_size.
        let mut channel: Raster = Array2::zeros((80, 80));
        for y in 25..56 {
            for x in 5..36 {
                channel[[y, x]] = 0.9;
            }
        }
        let cfg = WgaConfig {
            min_size: 200,
            ..test_config()
        };
        let masks = segment_cytosol(&channel, &nuclei, &cfg).unwrap();
        let n_ids: Vec<u32> = label_areas(&masks.nucleus).keys().copied().collect();
        let c_ids: Vec<u32> = label_areas(&masks.cytosol).keys().copied().collect();
        assert_eq!(n_ids, vec![1]);
        assert_eq!(c_ids, vec![1]);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let nuclei: LabelMask = Array2::zeros((10, 10));
        let channel: Raster = Array2::zeros((10, 12));
        assert!(matches!(
            segment_cytosol(&channel, &nuclei, &test_config()),
            Err(Error::Segmentation(_))
        ));
    }

    #[test]
    fn erosion_and_dilation_change_net_area() {
        let mut nuclei: LabelMask = Array2::zeros((60, 60));
        disk(&mut nuclei, 30, 30, 4.0, 1);
        let mut channel: Raster = Array2::zeros((60, 60));
        for y in 20..41 {
            for x in 20..41 {
                channel[[y, x]] = 0.9;
            }
        }
        let base = segment_cytosol(&channel, &nuclei, &test_config()).unwrap();
        let grown = segment_cytosol(
            &channel,
            &nuclei,
            &WgaConfig {
                erosion: 1,
                dilation: 4,
                ..test_config()
            },
        )
        .unwrap();
        assert!(label_areas(&grown.cytosol)[&1] > label_areas(&base.cytosol)[&1]);
    }
}
