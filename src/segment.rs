//! Segmentation workflows behind one capability interface, plus the
//! segmentation store layout: a channel stack and a labels collection at
//! the input resolution.
//!
//! Classical and deep-learning segmentation are two cases of the same
//! `segment(channels) -> masks` capability; model substitution is a
//! parameter of the deep variant, not a subtype hierarchy.

use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::config::{DlConfig, NucleusConfig, PreprocessConfig, WgaConfig};
use crate::error::{Error, Result};
use crate::raster::{LabelMask, Raster};
use crate::zarr::{self, Compression};
use crate::{dl, matching, nucleus, preprocess, wga};

/// Nucleus/cytosol mask pair. After a workflow completes the two masks
/// share one canonical label space.
pub struct SegmentationMasks {
    pub nucleus: LabelMask,
    pub cytosol: LabelMask,
}

pub trait Segmenter {
    fn segment(
        &self,
        channels: &[Raster],
        progress: &(dyn Fn(f64, &str) + Sync),
    ) -> Result<SegmentationMasks>;
}

/// Threshold + watershed path. Cytosol labels inherit nucleus ids by
/// construction, so no matching step runs.
pub struct ClassicalWorkflow {
    pub preprocess: PreprocessConfig,
    pub nucleus: NucleusConfig,
    pub wga: WgaConfig,
}

impl Segmenter for ClassicalWorkflow {
    fn segment(
        &self,
        channels: &[Raster],
        progress: &(dyn Fn(f64, &str) + Sync),
    ) -> Result<SegmentationMasks> {
        crate::raster::validate_channels(channels)?;
        if channels.len() < 2 {
            return Err(Error::Segmentation(
                "classical segmentation needs nucleus and cytosol channels".into(),
            ));
        }
        progress(0.05, "Normalizing channels");
        let nuclear = preprocess::normalize_channel(&channels[0], &self.preprocess)?;
        let cytosolic = preprocess::normalize_channel(&channels[1], &self.preprocess)?;
        progress(0.3, "Segmenting nuclei");
        let nuclei = nucleus::segment_nuclei(&nuclear, &self.nucleus)?;
        progress(0.6, "Segmenting cytosol");
        let masks = wga::segment_cytosol(&cytosolic, &nuclei, &self.wga)?;
        progress(1.0, "Segmentation done");
        Ok(masks)
    }
}

/// Tiled ONNX inference path. The two models label independently; the
/// mask matcher reconciles them into one canonical id space.
pub struct DeepWorkflow {
    pub preprocess: PreprocessConfig,
    pub dl: DlConfig,
    /// Run-owned scratch directory for shard intermediates.
    pub cache_dir: PathBuf,
    pub force_cpu: bool,
}

impl Segmenter for DeepWorkflow {
    fn segment(
        &self,
        channels: &[Raster],
        progress: &(dyn Fn(f64, &str) + Sync),
    ) -> Result<SegmentationMasks> {
        progress(0.02, "Normalizing channels");
        let normalized = preprocess::normalize_channels(channels, &self.preprocess)?;
        let deep = dl::segment_deep(
            &normalized,
            &self.dl,
            &self.cache_dir,
            self.force_cpu,
            &progress,
        )?;
        if !self.dl.match_masks {
            return Ok(SegmentationMasks {
                nucleus: deep.nucleus,
                cytosol: deep.cytosol,
            });
        }
        progress(0.98, "Matching masks");
        let table = matching::match_masks(
            &deep.nucleus,
            &deep.cytosol,
            self.dl.filtering_threshold_mask_matching,
        )?;
        let (nucleus, cytosol) = matching::apply_table(&table, &deep.nucleus, &deep.cytosol);
        progress(1.0, &format!("Matched {} cells", table.len()));
        Ok(SegmentationMasks { nucleus, cytosol })
    }
}

// ---------------------------------------------------------------------------
// Segmentation store
// ---------------------------------------------------------------------------

pub struct SegmentationStore {
    pub channels: Vec<Raster>,
    pub nucleus: LabelMask,
    pub cytosol: LabelMask,
}

/// Write the channel stack and both label masks. Layout: /channels f32
/// [C, H, W] (one chunk per channel), /labels/nucleus and /labels/cytosol
/// u32 [H, W].
pub fn write_segmentation_store(
    path: &Path,
    channels: &[Raster],
    masks: &SegmentationMasks,
) -> Result<()> {
    let (h, w) = crate::raster::validate_channels(channels)?;
    if masks.nucleus.dim() != (h, w) || masks.cytosol.dim() != (h, w) {
        return Err(Error::Segmentation(
            "mask shapes do not match channel shapes".into(),
        ));
    }
    let store = zarr::open_store(path)?;
    zarr::ensure_groups(&store, &["/labels"])?;

    let attrs = serde_json::json!({"axis_names": ["c", "y", "x"]})
        .as_object()
        .cloned();
    let channel_arr = zarr::create_array_f32(
        &store,
        "/channels",
        vec![channels.len() as u64, h as u64, w as u64],
        vec![1, h as u64, w as u64],
        Compression::None,
        attrs,
    )?;
    for (c, channel) in channels.iter().enumerate() {
        let data: Vec<f32> = channel.iter().copied().collect();
        zarr::store_chunk_f32(&channel_arr, &[c as u64, 0, 0], &data)?;
    }

    for (name, mask) in [("nucleus", &masks.nucleus), ("cytosol", &masks.cytosol)] {
        let attrs = serde_json::json!({"axis_names": ["y", "x"]})
            .as_object()
            .cloned();
        let arr = zarr::create_array_u32(
            &store,
            &format!("/labels/{}", name),
            vec![h as u64, w as u64],
            vec![h as u64, w as u64],
            Compression::None,
            attrs,
        )?;
        let data: Vec<u32> = mask.iter().copied().collect();
        zarr::store_chunk_u32(&arr, &[0, 0], &data)?;
    }
    Ok(())
}

pub fn read_segmentation_store(path: &Path) -> Result<SegmentationStore> {
    let store = zarr::open_store(path)?;
    let channel_arr = zarr::open_array(&store, "/channels")?;
    let shape = channel_arr.shape().to_vec();
    if shape.len() != 3 {
        return Err(Error::Storage(format!(
            "unexpected /channels shape {:?}",
            shape
        )));
    }
    let (n_c, h, w) = (shape[0] as usize, shape[1] as usize, shape[2] as usize);
    let mut channels = Vec::with_capacity(n_c);
    for c in 0..n_c {
        let data = zarr::read_chunk_f32(&channel_arr, &[c as u64, 0, 0])?;
        channels.push(
            Array2::from_shape_vec((h, w), data).map_err(|e| Error::Storage(e.to_string()))?,
        );
    }
    let nucleus = read_mask(&store, "nucleus", h, w)?;
    let cytosol = read_mask(&store, "cytosol", h, w)?;
    Ok(SegmentationStore {
        channels,
        nucleus,
        cytosol,
    })
}

fn read_mask(store: &zarr::Store, name: &str, h: usize, w: usize) -> Result<LabelMask> {
    let arr = zarr::open_array(store, &format!("/labels/{}", name))?;
    if arr.shape() != [h as u64, w as u64] {
        return Err(Error::Storage(format!(
            "/labels/{} shape {:?} does not match channels {}x{}",
            name,
            arr.shape(),
            h,
            w
        )));
    }
    let data = zarr::read_chunk_u32(&arr, &[0, 0])?;
    Array2::from_shape_vec((h, w), data).map_err(|e| Error::Storage(e.to_string()))
}
