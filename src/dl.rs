//! Deep-learning segmentation: tiled ONNX inference over overlapping
//! shards, cellpose-style flow post-processing, deterministic stitching.
//!
//! Per shard:
//!   1. Slice the normalized channels to the shard bounds.
//!   2. Run the nucleus and cytosol models independently (NCHW float32).
//!   3. Post-process each (dY, dX, cellprob) output into a local label
//!      mask by following the flow field to its sinks.
//! Shards run on a bounded worker pool; concurrent GPU work is limited by
//! a session checkout pool of `gpu_count` session pairs. Completed shard
//! masks land in a run-owned cache directory and are stitched after the
//! join barrier.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::{Array, Array2, ArrayView2, ArrayViewD, Ix4};
use ort::session::Session;
use ort::value::Tensor;
#[cfg(all(feature = "cuda", any(windows, target_os = "linux")))]
use ort::ep::{ExecutionProvider, CUDA};
use rayon::prelude::*;

use crate::config::DlConfig;
use crate::error::{Error, Result};
use crate::morph;
use crate::raster::{LabelMask, Raster};
use crate::shard::{self, Shard};

const CELLPROB_THRESHOLD: f32 = 0.0;
const FLOW_STEPS: usize = 100;

// ---------------------------------------------------------------------------
// ONNX session handling
// ---------------------------------------------------------------------------

pub struct ModelBundle {
    session: Session,
    input_name: String,
}

impl ModelBundle {
    /// Load a model directory containing model.onnx.
    pub fn load(model_dir: &Path, force_cpu: bool) -> Result<ModelBundle> {
        let model_path = model_dir.join("model.onnx");
        if !model_path.exists() {
            return Err(Error::config(
                "dl",
                format!("model not found at {}", model_path.display()),
            ));
        }
        let session = {
            #[allow(unused_mut)]
            let mut builder = Session::builder()?;
            #[cfg(all(feature = "cuda", any(windows, target_os = "linux")))]
            if !force_cpu {
                let cuda = CUDA::default();
                match cuda.is_available() {
                    Ok(true) => match cuda.register(&mut builder) {
                        Ok(()) => log::info!("using CUDA for {}", model_dir.display()),
                        Err(e) => log::warn!("CUDA registration failed: {e}. Using CPU."),
                    },
                    Ok(false) => log::info!("CUDA not available in this build. Using CPU."),
                    Err(e) => log::warn!("CUDA check failed: {e}. Using CPU."),
                }
            }
            #[cfg(not(all(feature = "cuda", any(windows, target_os = "linux"))))]
            let _ = force_cpu;
            builder.commit_from_file(&model_path)?
        };
        let input_name = session
            .inputs()
            .first()
            .ok_or_else(|| Error::config("dl", "model has no inputs"))?
            .name()
            .to_string();
        Ok(ModelBundle {
            session,
            input_name,
        })
    }

    /// Run the model on a stack of same-shaped channel views; returns the
    /// (flow_y, flow_x, cellprob) planes.
    fn infer(
        &mut self,
        channels: &[ArrayView2<'_, f32>],
    ) -> Result<(Array2<f32>, Array2<f32>, Array2<f32>)> {
        let (h, w) = channels[0].dim();
        let c = channels.len();
        let mut nchw = vec![0.0f32; c * h * w];
        for (ci, ch) in channels.iter().enumerate() {
            let plane = &mut nchw[ci * h * w..(ci + 1) * h * w];
            for (i, &v) in ch.iter().enumerate() {
                plane[i] = v;
            }
        }
        let shape: Ix4 = ndarray::Dim([1, c, h, w]);
        let arr = Array::from_shape_vec(shape, nchw)
            .map_err(|e| Error::Segmentation(e.to_string()))?;
        let input_tensor = Tensor::from_array(arr)?;
        let input = ort::inputs![self.input_name.as_str() => input_tensor];
        let outputs = self.session.run(input)?;
        let output = &outputs[0];
        let planes: ArrayViewD<f32> = output.try_extract_array()?;
        if planes.ndim() != 4 || planes.shape()[1] < 3 {
            return Err(Error::Segmentation(format!(
                "unexpected model output shape {:?} (want [1, 3, h, w])",
                planes.shape()
            )));
        }
        let oh = planes.shape()[2];
        let ow = planes.shape()[3];
        if (oh, ow) != (h, w) {
            return Err(Error::Segmentation(format!(
                "model output {}x{} does not match input {}x{}",
                oh, ow, h, w
            )));
        }
        let plane = |p: usize| Array2::from_shape_fn((h, w), |(y, x)| planes[[0, p, y, x]]);
        Ok((plane(0), plane(1), plane(2)))
    }
}

struct SessionPair {
    nucleus: ModelBundle,
    cytosol: ModelBundle,
}

// ---------------------------------------------------------------------------
// Flow post-processing
// ---------------------------------------------------------------------------

/// Convert a cellpose-style flow field into an instance label mask. Every
/// pixel above the probability threshold follows the flow to a sink; sinks
/// are clustered with 8-connectivity and each pixel joins its sink's
/// cluster.
pub fn flows_to_labels(
    flow_y: &Array2<f32>,
    flow_x: &Array2<f32>,
    cellprob: &Array2<f32>,
    threshold: f32,
) -> LabelMask {
    let (h, w) = cellprob.dim();
    let mut sinks: Vec<((usize, usize), (usize, usize))> = Vec::new();
    let mut sink_mask = Array2::from_elem((h, w), false);
    for y in 0..h {
        for x in 0..w {
            if cellprob[[y, x]] <= threshold {
                continue;
            }
            let mut py = y as f32;
            let mut px = x as f32;
            for _ in 0..FLOW_STEPS {
                let iy = (py.round() as isize).clamp(0, h as isize - 1) as usize;
                let ix = (px.round() as isize).clamp(0, w as isize - 1) as usize;
                py = (py + flow_y[[iy, ix]]).clamp(0.0, h as f32 - 1.0);
                px = (px + flow_x[[iy, ix]]).clamp(0.0, w as f32 - 1.0);
            }
            let sink = (
                (py.round() as isize).clamp(0, h as isize - 1) as usize,
                (px.round() as isize).clamp(0, w as isize - 1) as usize,
            );
            sink_mask[[sink.0, sink.1]] = true;
            sinks.push(((y, x), sink));
        }
    }
    let clusters = morph::label_components(&sink_mask, true);
    let mut labels: LabelMask = Array2::zeros((h, w));
    for ((y, x), (sy, sx)) in sinks {
        labels[[y, x]] = clusters[[sy, sx]];
    }
    labels
}

// ---------------------------------------------------------------------------
// Shard fan-out
// ---------------------------------------------------------------------------

pub struct DeepSegmentation {
    /// Independently numbered global label spaces; reconcile with
    /// `matching::match_masks` before extraction.
    pub nucleus: LabelMask,
    pub cytosol: LabelMask,
}

pub fn segment_deep(
    channels: &[Raster],
    cfg: &DlConfig,
    cache_dir: &Path,
    force_cpu: bool,
    progress: &(impl Fn(f64, &str) + Sync),
) -> Result<DeepSegmentation> {
    cfg.validate()?;
    let (h, w) = crate::raster::validate_channels(channels)?;
    if channels.len() < 2 {
        return Err(Error::Segmentation(
            "deep segmentation needs nucleus and cytosol channels".into(),
        ));
    }

    let grid = shard::plan_shards(h, w, cfg.shard_size, cfg.overlap_px);
    fs::create_dir_all(cache_dir)?;

    let (pool_tx, pool_rx) = crossbeam_channel::bounded::<SessionPair>(cfg.gpu_count);
    for _ in 0..cfg.gpu_count {
        pool_tx
            .send(SessionPair {
                nucleus: ModelBundle::load(Path::new(&cfg.nucleus_model), force_cpu)?,
                cytosol: ModelBundle::load(Path::new(&cfg.cytosol_model), force_cpu)?,
            })
            .map_err(|_| Error::Segmentation("inference session pool disconnected".into()))?;
    }

    let thread_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.worker_count)
        .build()
        .map_err(|e| Error::config("dl", e.to_string()))?;

    let total = grid.shards.len();
    let done = AtomicUsize::new(0);
    let results: Vec<Result<()>> = thread_pool.install(|| {
        grid.shards
            .par_iter()
            .map(|s| {
                let mut pair = pool_rx
                    .recv()
                    .map_err(|_| Error::Segmentation("inference session pool disconnected".into()))?;
                let outcome = run_shard(&mut pair, channels, s);
                pool_tx.send(pair).ok();
                let (nucleus, cytosol) = match outcome {
                    Ok(masks) => masks,
                    Err(e) => {
                        // Isolated failure: keep siblings running, shard
                        // contributes no labels.
                        log::warn!("shard {} failed: {}", s.index, e);
                        let empty = || {
                            Array2::zeros((s.bounds.height(), s.bounds.width()))
                        };
                        (empty(), empty())
                    }
                };
                shard::write_shard_cache(cache_dir, "nucleus", s.index, &nucleus)?;
                shard::write_shard_cache(cache_dir, "cytosol", s.index, &cytosol)?;
                let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                progress(
                    n as f64 / total as f64 * 0.8,
                    &format!("Inference shard {}/{}", n, total),
                );
                Ok(())
            })
            .collect()
    });
    // Cache-write failures are storage failures and abort the run.
    for r in results {
        r?;
    }

    progress(0.85, "Stitching nucleus shards");
    let nucleus = shard::stitch(&grid, |s| shard::read_shard_cache(cache_dir, "nucleus", s.index))?;
    progress(0.95, "Stitching cytosol shards");
    let cytosol = shard::stitch(&grid, |s| shard::read_shard_cache(cache_dir, "cytosol", s.index))?;
    if let Err(e) = fs::remove_dir_all(cache_dir) {
        log::warn!("could not remove shard cache {}: {}", cache_dir.display(), e);
    }
    Ok(DeepSegmentation { nucleus, cytosol })
}

fn run_shard(
    pair: &mut SessionPair,
    channels: &[Raster],
    s: &Shard,
) -> Result<(LabelMask, LabelMask)> {
    use ndarray::s as slice;
    let view = |c: usize| {
        channels[c].slice(slice![
            s.bounds.y0..s.bounds.y1,
            s.bounds.x0..s.bounds.x1
        ])
    };
    let (ny, nx, np) = pair.nucleus.infer(&[view(0)])?;
    let nucleus = flows_to_labels(&ny, &nx, &np, CELLPROB_THRESHOLD);
    let (cy, cx, cp) = pair.cytosol.infer(&[view(0), view(1)])?;
    let cytosol = flows_to_labels(&cy, &cx, &cp, CELLPROB_THRESHOLD);
    Ok((nucleus, cytosol))
}

/// Shard count for a given image, used by the CLI to report tiling up front.
pub fn shard_count(height: usize, width: usize, cfg: &DlConfig) -> usize {
    shard::plan_shards(height, width, cfg.shard_size, cfg.overlap_px)
        .shards
        .len()
}
