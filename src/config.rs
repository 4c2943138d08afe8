//! Per-stage configuration. One JSON document with optional sections; a
//! missing section (or file) means all-defaults. Validation is fail-fast
//! and runs before any pixel is touched.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreprocessConfig {
    pub lower_quantile_normalization: f64,
    pub upper_quantile_normalization: f64,
    /// Median filter radius in pixels; 0 disables smoothing.
    pub median_filter_size: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        PreprocessConfig {
            lower_quantile_normalization: 0.001,
            upper_quantile_normalization: 0.999,
            median_filter_size: 2,
        }
    }
}

impl PreprocessConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, q) in [
            ("lower_quantile_normalization", self.lower_quantile_normalization),
            ("upper_quantile_normalization", self.upper_quantile_normalization),
        ] {
            if !(0.0..=1.0).contains(&q) {
                return Err(Error::config(
                    "preprocess",
                    format!("{} = {} outside [0, 1]", name, q),
                ));
            }
        }
        if self.lower_quantile_normalization >= self.upper_quantile_normalization {
            return Err(Error::config(
                "preprocess",
                format!(
                    "lower_quantile_normalization {} >= upper_quantile_normalization {}",
                    self.lower_quantile_normalization, self.upper_quantile_normalization
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NucleusConfig {
    /// Window size for the block-wise median background estimate.
    pub median_block: usize,
    /// Sampling stride of the background grid.
    pub median_step: usize,
    /// Foreground margin above the local background.
    pub threshold: f32,
    pub speckle_kernel: usize,
    pub peak_footprint: usize,
    pub min_distance: usize,
    pub dilation: usize,
    pub min_size: u64,
    pub max_size: u64,
    /// Drop labels whose edge-contact perimeter fraction reaches this value.
    pub contact_filter: f64,
}

impl Default for NucleusConfig {
    fn default() -> Self {
        NucleusConfig {
            median_block: 51,
            median_step: 4,
            threshold: 0.1,
            speckle_kernel: 3,
            peak_footprint: 7,
            min_distance: 8,
            dilation: 0,
            min_size: 20,
            max_size: 100_000,
            contact_filter: 0.5,
        }
    }
}

impl NucleusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.median_step == 0 {
            return Err(Error::config("nucleus", "median_step must be positive"));
        }
        if self.median_block == 0 {
            return Err(Error::config("nucleus", "median_block must be positive"));
        }
        if self.min_size > self.max_size {
            return Err(Error::config(
                "nucleus",
                format!("min_size {} > max_size {}", self.min_size, self.max_size),
            ));
        }
        if !(0.0..=1.0).contains(&self.contact_filter) {
            return Err(Error::config(
                "nucleus",
                format!("contact_filter {} outside [0, 1]", self.contact_filter),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WgaConfig {
    pub threshold: f32,
    pub erosion: usize,
    pub dilation: usize,
    pub min_clip: f32,
    pub max_clip: f32,
    pub min_size: u64,
    pub max_size: u64,
}

impl Default for WgaConfig {
    fn default() -> Self {
        WgaConfig {
            threshold: 0.05,
            erosion: 2,
            dilation: 7,
            min_clip: 0.0,
            max_clip: 1.0,
            min_size: 20,
            max_size: 200_000,
        }
    }
}

impl WgaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_clip >= self.max_clip {
            return Err(Error::config(
                "wga",
                format!("min_clip {} >= max_clip {}", self.min_clip, self.max_clip),
            ));
        }
        if self.min_size > self.max_size {
            return Err(Error::config(
                "wga",
                format!("min_size {} > max_size {}", self.min_size, self.max_size),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DlConfig {
    /// Maximum core pixels per shard (overlap border excluded).
    pub shard_size: usize,
    pub overlap_px: usize,
    pub worker_count: usize,
    pub gpu_count: usize,
    /// Model directory containing model.onnx.
    pub nucleus_model: String,
    pub cytosol_model: String,
    pub match_masks: bool,
    pub filtering_threshold_mask_matching: f64,
}

impl Default for DlConfig {
    fn default() -> Self {
        DlConfig {
            shard_size: 2_000_000,
            overlap_px: 100,
            worker_count: 4,
            gpu_count: 1,
            nucleus_model: String::new(),
            cytosol_model: String::new(),
            match_masks: true,
            filtering_threshold_mask_matching: 0.95,
        }
    }
}

impl DlConfig {
    pub fn validate(&self) -> Result<()> {
        if self.shard_size == 0 {
            return Err(Error::config("dl", "shard_size must be positive"));
        }
        if self.worker_count == 0 {
            return Err(Error::config("dl", "worker_count must be positive"));
        }
        if self.gpu_count == 0 {
            return Err(Error::config("dl", "gpu_count must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractConfig {
    /// Side length of the square per-cell crop.
    pub image_size: usize,
    /// Rows per storage chunk; a chunk is flushed only once fully populated.
    pub chunk_size: usize,
    /// "none" or "zstd".
    pub compression: String,
    pub worker_count: usize,
    /// Bound on in-flight crop memory between workers and the writer.
    pub cache_bytes: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        ExtractConfig {
            image_size: 128,
            chunk_size: 50,
            compression: "none".into(),
            worker_count: 4,
            cache_bytes: 256 << 20,
        }
    }
}

impl ExtractConfig {
    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 {
            return Err(Error::config("extract", "image_size must be positive"));
        }
        if self.chunk_size == 0 {
            return Err(Error::config("extract", "chunk_size must be positive"));
        }
        if self.worker_count == 0 {
            return Err(Error::config("extract", "worker_count must be positive"));
        }
        match self.compression.as_str() {
            "none" | "zstd" => Ok(()),
            other => Err(Error::config(
                "extract",
                format!("unknown compression {:?} (expected \"none\" or \"zstd\")", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub preprocess: PreprocessConfig,
    pub nucleus: NucleusConfig,
    pub wga: WgaConfig,
    pub dl: DlConfig,
    pub extract: ExtractConfig,
}

impl PipelineConfig {
    /// Load from a JSON file, or all-defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<PipelineConfig> {
        let config = match path {
            Some(p) => {
                let text = fs::read_to_string(p)?;
                serde_json::from_str(&text)
                    .map_err(|e| Error::config("config", format!("{}: {}", p.display(), e)))?
            }
            None => PipelineConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.preprocess.validate()?;
        self.nucleus.validate()?;
        self.wga.validate()?;
        self.dl.validate()?;
        self.extract.validate()?;
        Ok(())
    }
}
