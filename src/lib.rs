//! Single-cell segmentation and extraction for multi-channel microscopy.
//!
//! Pipeline: per-channel normalization, nucleus segmentation (classical
//! threshold + watershed), cytosol segmentation (WGA front propagation or
//! tiled ONNX inference), mask matching into canonical cell ids, and
//! chunked per-cell crop extraction into a zarr store.

pub mod channels;
pub mod config;
pub mod dl;
pub mod error;
pub mod extract;
pub mod matching;
pub mod morph;
pub mod nucleus;
pub mod preprocess;
pub mod raster;
pub mod segment;
pub mod shard;
pub mod watershed;
pub mod wga;
pub mod zarr;

pub use error::{Error, Result};
