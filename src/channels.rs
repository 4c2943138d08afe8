//! Input boundary: one grayscale TIFF per acquisition channel, fixed order
//! {nucleus stain, cytosol stain, extra stains...}. Directory inputs are
//! discovered by filename pattern; all channels must share one shape.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use regex::Regex;

use crate::error::{Error, Result};
use crate::raster::{validate_channels, Raster};

const CHANNEL_RE: &str = r"^channel(\d+)\.tiff?$";

/// Discover channelNNN.tif files in a directory, ordered by channel index.
pub fn discover_channels(dir: &Path) -> Result<Vec<PathBuf>> {
    let re = Regex::new(CHANNEL_RE).map_err(|e| Error::Segmentation(e.to_string()))?;
    let mut found: Vec<(u32, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let cap = match re.captures(&name) {
            Some(c) => c,
            None => continue,
        };
        let index: u32 = cap[1]
            .parse()
            .map_err(|_| Error::Segmentation(format!("invalid channel index in {}", name)))?;
        found.push((index, entry.path()));
    }
    if found.is_empty() {
        return Err(Error::Segmentation(format!(
            "no channel TIFFs found in {} matching {}",
            dir.display(),
            CHANNEL_RE
        )));
    }
    found.sort_by_key(|(i, _)| *i);
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

/// Read one grayscale TIFF frame as f32. u8 and u16 pixels are promoted.
pub fn read_tiff_channel(path: &Path) -> Result<Raster> {
    let file = fs::File::open(path)?;
    let mut decoder = tiff::decoder::Decoder::new(file)?;
    let (width, height) = decoder.dimensions()?;
    let result = decoder.read_image()?;
    let data: Vec<f32> = match result {
        tiff::decoder::DecodingResult::U8(v) => v.into_iter().map(|p| p as f32).collect(),
        tiff::decoder::DecodingResult::U16(v) => v.into_iter().map(|p| p as f32).collect(),
        tiff::decoder::DecodingResult::F32(v) => v,
        _ => {
            return Err(Error::Segmentation(format!(
                "unsupported TIFF pixel format in {} (need u8, u16 or f32)",
                path.display()
            )))
        }
    };
    Array2::from_shape_vec((height as usize, width as usize), data)
        .map_err(|e| Error::Segmentation(e.to_string()))
}

/// Load the channel stack from explicit file paths, validating shapes.
pub fn load_channels(paths: &[PathBuf]) -> Result<Vec<Raster>> {
    let channels: Vec<Raster> = paths
        .iter()
        .map(|p| read_tiff_channel(p))
        .collect::<Result<_>>()?;
    validate_channels(&channels)?;
    Ok(channels)
}

/// Resolve an input argument: a directory to discover, or an explicit
/// comma-free list of per-channel TIFF paths.
pub fn resolve_inputs(inputs: &[String]) -> Result<Vec<PathBuf>> {
    if inputs.len() == 1 {
        let p = Path::new(&inputs[0]);
        if p.is_dir() {
            return discover_channels(p);
        }
    }
    Ok(inputs.iter().map(PathBuf::from).collect())
}
