//! Per-cell crop extraction into a chunked zarr store.
//!
//! Workers crop and normalize cells in any order; a single writer thread
//! reorders results by canonical id, packs `chunk_size` rows per storage
//! chunk and appends index and data chunks together. A chunk is flushed
//! only once fully populated. Per-cell failures are logged and skipped;
//! a writer I/O failure aborts the run, leaving previously flushed chunks
//! valid.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crossbeam_channel::bounded;
use rayon::prelude::*;

use crate::config::ExtractConfig;
use crate::error::{Error, Result};
use crate::raster::{validate_channels, LabelMask, Raster};
use crate::zarr::{self, Compression};

pub struct ExtractReport {
    pub written: usize,
    pub skipped: Vec<u32>,
}

struct Candidate {
    cell_id: u32,
    centroid: (usize, usize),
}

enum Outcome {
    Record(u32, Vec<f32>),
    Skip(u32),
}

// ---------------------------------------------------------------------------
// Crop computation (worker side)
// ---------------------------------------------------------------------------

/// Candidate cells: canonical ids present in the cytosol mask, with pixel
/// centroids. The nucleus mask must carry the same id space.
fn collect_candidates(nucleus: &LabelMask, cytosol: &LabelMask) -> Vec<Candidate> {
    let mut sums: BTreeMap<u32, (u64, u64, u64)> = BTreeMap::new();
    let (h, w) = cytosol.dim();
    for y in 0..h {
        for x in 0..w {
            let l = cytosol[[y, x]];
            if l != 0 {
                let e = sums.entry(l).or_insert((0, 0, 0));
                e.0 += y as u64;
                e.1 += x as u64;
                e.2 += 1;
            }
        }
    }
    let nucleus_ids: HashSet<u32> = nucleus.iter().copied().filter(|&l| l != 0).collect();
    sums.into_iter()
        .filter_map(|(cell_id, (sy, sx, n))| {
            if !nucleus_ids.contains(&cell_id) {
                log::warn!("cell {} has no nucleus pixels, skipping", cell_id);
                return None;
            }
            let cy = (sy as f64 / n as f64).round() as usize;
            let cx = (sx as f64 / n as f64).round() as usize;
            Some(Candidate {
                cell_id,
                centroid: (cy, cx),
            })
        })
        .collect()
}

/// Crop one mask plane to {0,1} for the given cell, zero-padded window.
fn crop_mask(mask: &LabelMask, cell_id: u32, top: isize, left: isize, size: usize) -> Vec<f32> {
    let (h, w) = mask.dim();
    let mut out = vec![0.0f32; size * size];
    for ry in 0..size {
        for rx in 0..size {
            let sy = top + ry as isize;
            let sx = left + rx as isize;
            if sy >= 0 && sx >= 0 && (sy as usize) < h && (sx as usize) < w
                && mask[[sy as usize, sx as usize]] == cell_id
            {
                out[ry * size + rx] = 1.0;
            }
        }
    }
    out
}

/// Crop one channel window and min-max re-normalize it to [0,1] locally.
fn crop_channel(channel: &Raster, top: isize, left: isize, size: usize) -> Vec<f32> {
    let (h, w) = channel.dim();
    let mut out = vec![0.0f32; size * size];
    for ry in 0..size {
        for rx in 0..size {
            let sy = top + ry as isize;
            let sx = left + rx as isize;
            if sy >= 0 && sx >= 0 && (sy as usize) < h && (sx as usize) < w {
                out[ry * size + rx] = channel[[sy as usize, sx as usize]];
            }
        }
    }
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in &out {
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }
    let range = max - min;
    if range > 0.0 {
        for v in &mut out {
            *v = (*v - min) / range;
        }
    } else {
        out.fill(0.0);
    }
    out
}

/// Assemble the fixed-order stack for one cell: nucleus mask, cytosol mask,
/// then every channel in acquisition order. The window is centered on the
/// cytosol centroid and never shifts; out-of-raster area stays zero.
fn compute_record(
    channels: &[Raster],
    nucleus: &LabelMask,
    cytosol: &LabelMask,
    cand: &Candidate,
    size: usize,
) -> Result<Vec<f32>> {
    let (h, w) = cytosol.dim();
    let (cy, cx) = cand.centroid;
    if cy >= h || cx >= w {
        return Err(Error::Extraction(format!(
            "cell {} centroid ({}, {}) outside raster {}x{}",
            cand.cell_id, cy, cx, h, w
        )));
    }
    let top = cy as isize - (size / 2) as isize;
    let left = cx as isize - (size / 2) as isize;

    let mut stack = Vec::with_capacity((channels.len() + 2) * size * size);
    let nucleus_crop = crop_mask(nucleus, cand.cell_id, top, left, size);
    let cytosol_crop = crop_mask(cytosol, cand.cell_id, top, left, size);
    if cytosol_crop.iter().all(|&v| v == 0.0) {
        return Err(Error::Extraction(format!(
            "cell {} has no cytosol pixels inside its crop window",
            cand.cell_id
        )));
    }
    stack.extend_from_slice(&nucleus_crop);
    stack.extend_from_slice(&cytosol_crop);
    for channel in channels {
        stack.extend(crop_channel(channel, top, left, size));
    }
    Ok(stack)
}

// ---------------------------------------------------------------------------
// Single writer
// ---------------------------------------------------------------------------

struct Writer<'a> {
    index: &'a zarr::StoreArray,
    data: &'a zarr::StoreArray,
    chunk_size: usize,
    stack_len: usize,
    chunk_ids: Vec<u64>,
    chunk_data: Vec<f32>,
    next_chunk: u64,
    written: usize,
}

impl<'a> Writer<'a> {
    fn push(&mut self, cell_id: u32, stack: Vec<f32>) -> Result<()> {
        self.chunk_ids.push(cell_id as u64);
        self.chunk_data.extend(stack);
        self.written += 1;
        if self.chunk_ids.len() == self.chunk_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Write the data chunk and its index chunk together. The final partial
    /// chunk is zero-padded to the chunk shape; the array shape is trimmed
    /// afterwards.
    fn flush(&mut self) -> Result<()> {
        if self.chunk_ids.is_empty() {
            return Ok(());
        }
        self.chunk_ids.resize(self.chunk_size, 0);
        self.chunk_data.resize(self.chunk_size * self.stack_len, 0.0);
        zarr::store_chunk_f32(self.data, &[self.next_chunk, 0, 0, 0], &self.chunk_data)?;
        zarr::store_chunk_u64(self.index, &[self.next_chunk], &self.chunk_ids)?;
        self.next_chunk += 1;
        self.chunk_ids.clear();
        self.chunk_data.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Extraction entry point
// ---------------------------------------------------------------------------

pub fn extract_cells(
    channels: &[Raster],
    nucleus: &LabelMask,
    cytosol: &LabelMask,
    cfg: &ExtractConfig,
    out_path: &Path,
    report_path: Option<&Path>,
    progress: &(impl Fn(f64, &str) + Sync),
) -> Result<ExtractReport> {
    cfg.validate()?;
    let (h, w) = validate_channels(channels)?;
    if nucleus.dim() != (h, w) || cytosol.dim() != (h, w) {
        return Err(Error::Segmentation(
            "mask shapes do not match channel shapes".into(),
        ));
    }

    let candidates = collect_candidates(nucleus, cytosol);
    let total = candidates.len();
    let size = cfg.image_size;
    let stack_channels = channels.len() + 2;
    let stack_len = stack_channels * size * size;
    let compression = Compression::from_name(&cfg.compression)?;

    let store = zarr::open_store(out_path)?;
    zarr::ensure_groups(&store, &[])?;
    let capacity_rows = total.div_ceil(cfg.chunk_size) * cfg.chunk_size;
    let data_shape = vec![
        capacity_rows as u64,
        stack_channels as u64,
        size as u64,
        size as u64,
    ];
    let data_chunks = vec![cfg.chunk_size as u64, stack_channels as u64, size as u64, size as u64];
    let attrs = serde_json::json!({
        "axis_names": ["cell", "c", "y", "x"],
        "stack_order": "nucleus_mask, cytosol_mask, channels in acquisition order"
    })
    .as_object()
    .cloned();
    let data_arr = zarr::create_array_f32(&store, "/data", data_shape, data_chunks, compression, attrs)?;
    let index_arr = zarr::create_array_u64(
        &store,
        "/index",
        vec![capacity_rows as u64],
        vec![cfg.chunk_size as u64],
        compression,
        None,
    )?;

    let record_bytes = stack_len * std::mem::size_of::<f32>();
    let channel_cap = (cfg.cache_bytes / record_bytes.max(1)).clamp(2, 1024);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.worker_count)
        .build()
        .map_err(|e| Error::config("extract", e.to_string()))?;

    let (written, skipped) = std::thread::scope(|scope| -> Result<(usize, Vec<u32>)> {
        let (tx, rx) = bounded::<(usize, Outcome)>(channel_cap);
        let writer_handle = scope.spawn(|| -> Result<(usize, Vec<u32>)> {
            let mut writer = Writer {
                index: &index_arr,
                data: &data_arr,
                chunk_size: cfg.chunk_size,
                stack_len,
                chunk_ids: Vec::with_capacity(cfg.chunk_size),
                chunk_data: Vec::with_capacity(cfg.chunk_size * stack_len),
                next_chunk: 0,
                written: 0,
            };
            let mut skipped: Vec<u32> = Vec::new();
            let mut pending: BTreeMap<usize, Outcome> = BTreeMap::new();
            let mut next_seq = 0usize;
            for (seq, outcome) in rx {
                pending.insert(seq, outcome);
                while let Some(outcome) = pending.remove(&next_seq) {
                    next_seq += 1;
                    match outcome {
                        Outcome::Record(cell_id, stack) => writer.push(cell_id, stack)?,
                        Outcome::Skip(cell_id) => skipped.push(cell_id),
                    }
                    let done = writer.written + skipped.len();
                    progress(
                        done as f64 / total.max(1) as f64,
                        &format!("Extracting cells {}/{}", done, total),
                    );
                }
            }
            writer.flush()?;
            Ok((writer.written, skipped))
        });

        pool.install(|| {
            candidates
                .par_iter()
                .enumerate()
                .for_each_with(tx, |tx, (seq, cand)| {
                    let outcome = match compute_record(channels, nucleus, cytosol, cand, size) {
                        Ok(stack) => Outcome::Record(cand.cell_id, stack),
                        Err(e) => {
                            log::warn!("cell {} skipped: {}", cand.cell_id, e);
                            Outcome::Skip(cand.cell_id)
                        }
                    };
                    // A send failure means the writer died; its error is
                    // surfaced from the join below.
                    let _ = tx.send((seq, outcome));
                });
        });

        writer_handle
            .join()
            .map_err(|_| Error::Storage("writer thread panicked".into()))?
    })?;

    // Trim the arrays to the rows actually written.
    trim_rows(&store, cfg, stack_channels, compression, written)?;

    if !skipped.is_empty() {
        log::warn!(
            "extraction finished with {} skipped cells: {:?}",
            skipped.len(),
            skipped
        );
    }
    if let Some(report) = report_path {
        write_report(report, &candidates, &skipped)?;
    }
    progress(1.0, &format!("Wrote {} cells to {}", written, out_path.display()));
    Ok(ExtractReport { written, skipped })
}

fn trim_rows(
    store: &zarr::Store,
    cfg: &ExtractConfig,
    stack_channels: usize,
    compression: Compression,
    written: usize,
) -> Result<()> {
    let size = cfg.image_size;
    let attrs = serde_json::json!({
        "axis_names": ["cell", "c", "y", "x"],
        "stack_order": "nucleus_mask, cytosol_mask, channels in acquisition order"
    })
    .as_object()
    .cloned();
    zarr::create_array_f32(
        store,
        "/data",
        vec![written as u64, stack_channels as u64, size as u64, size as u64],
        vec![cfg.chunk_size as u64, stack_channels as u64, size as u64, size as u64],
        compression,
        attrs,
    )?;
    zarr::create_array_u64(
        store,
        "/index",
        vec![written as u64],
        vec![cfg.chunk_size as u64],
        compression,
        None,
    )?;
    Ok(())
}

fn write_report(path: &Path, candidates: &[Candidate], skipped: &[u32]) -> Result<()> {
    let skipped_set: HashSet<u32> = skipped.iter().copied().collect();
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["row", "cell_id", "y", "x", "status"])?;
    let mut row = 0usize;
    for cand in candidates {
        if skipped_set.contains(&cand.cell_id) {
            writer.write_record([
                String::new(),
                cand.cell_id.to_string(),
                cand.centroid.0.to_string(),
                cand.centroid.1.to_string(),
                "skipped".into(),
            ])?;
        } else {
            writer.write_record([
                row.to_string(),
                cand.cell_id.to_string(),
                cand.centroid.0.to_string(),
                cand.centroid.1.to_string(),
                "written".into(),
            ])?;
            row += 1;
        }
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn square_cell(
        nucleus: &mut LabelMask,
        cytosol: &mut LabelMask,
        cy: usize,
        cx: usize,
        half: usize,
        id: u32,
    ) {
        let (h, w) = cytosol.dim();
        for y in cy.saturating_sub(half)..=(cy + half).min(h - 1) {
            for x in cx.saturating_sub(half)..=(cx + half).min(w - 1) {
                cytosol[[y, x]] = id;
            }
        }
        nucleus[[cy, cx]] = id;
    }

    fn no_progress(_p: f64, _m: &str) {}

    fn test_config(image_size: usize, chunk_size: usize) -> ExtractConfig {
        ExtractConfig {
            image_size,
            chunk_size,
            compression: "none".into(),
            worker_count: 2,
            cache_bytes: 1 << 20,
        }
    }

    #[test]
    fn index_and_data_rows_stay_aligned() {
        let mut nucleus: LabelMask = Array2::zeros((100, 100));
        let mut cytosol: LabelMask = Array2::zeros((100, 100));
        for (i, (cy, cx)) in [(20, 20), (20, 60), (60, 20), (60, 60), (80, 80)]
            .iter()
            .enumerate()
        {
            square_cell(&mut nucleus, &mut cytosol, *cy, *cx, 4, i as u32 + 1);
        }
        let channels: Vec<Raster> =
            vec![Array2::from_elem((100, 100), 5.0), Array2::from_elem((100, 100), 3.0)];
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("cells.zarr");
        let report = extract_cells(
            &channels,
            &nucleus,
            &cytosol,
            &test_config(16, 2),
            &out,
            None,
            &no_progress,
        )
        .unwrap();
        assert_eq!(report.written, 5);
        assert!(report.skipped.is_empty());

        let store = zarr::open_store(&out).unwrap();
        let index = zarr::open_array(&store, "/index").unwrap();
        let data = zarr::open_array(&store, "/data").unwrap();
        assert_eq!(index.shape(), &[5]);
        assert_eq!(data.shape()[0], 5);
        assert_eq!(data.shape()[1], 4); // 2 masks + 2 channels
        // Fully populated chunks hold ids in canonical order.
        assert_eq!(zarr::read_chunk_u64(&index, &[0]).unwrap(), vec![1, 2]);
        assert_eq!(zarr::read_chunk_u64(&index, &[1]).unwrap(), vec![3, 4]);
    }

    #[test]
    fn edge_centroid_crop_is_zero_padded_and_centered() {
        let mut nucleus: LabelMask = Array2::zeros((40, 40));
        let mut cytosol: LabelMask = Array2::zeros((40, 40));
        square_cell(&mut nucleus, &mut cytosol, 3, 3, 2, 1);
        let cand = Candidate {
            cell_id: 1,
            centroid: (3, 3),
        };
        let channels: Vec<Raster> = vec![Array2::from_elem((40, 40), 1.0)];
        let stack = compute_record(&channels, &nucleus, &cytosol, &cand, 16).unwrap();
        assert_eq!(stack.len(), 3 * 16 * 16);
        let nucleus_crop = &stack[0..256];
        // Centroid alignment: the nucleus pixel sits at the crop center.
        assert_eq!(nucleus_crop[8 * 16 + 8], 1.0);
        // Rows above the raster edge are zero-padded.
        assert!(nucleus_crop[0..16].iter().all(|&v| v == 0.0));
        let cytosol_crop = &stack[256..512];
        assert_eq!(cytosol_crop[8 * 16 + 8], 1.0);
        assert_eq!(cytosol_crop[(8 - 2) * 16 + 8], 1.0);
        assert_eq!(cytosol_crop[(8 + 3) * 16 + 8], 0.0);
    }

    #[test]
    fn channel_crops_are_locally_renormalized() {
        let mut channel: Raster = Array2::from_elem((40, 40), 100.0);
        channel[[20, 20]] = 300.0;
        let crop = crop_channel(&channel, 12, 12, 16);
        let mx = crop.iter().cloned().fold(f32::MIN, f32::max);
        let mn = crop.iter().cloned().fold(f32::MAX, f32::min);
        assert_eq!(mx, 1.0);
        assert_eq!(mn, 0.0);
    }

    #[test]
    fn degenerate_cells_are_skipped_not_fatal() {
        let mut nucleus: LabelMask = Array2::zeros((60, 60));
        let mut cytosol: LabelMask = Array2::zeros((60, 60));
        square_cell(&mut nucleus, &mut cytosol, 30, 30, 3, 1);
        // Cytosol with no nucleus pixels anywhere.
        cytosol[[10, 10]] = 2;
        let channels: Vec<Raster> = vec![Array2::zeros((60, 60))];
        let dir = tempfile::tempdir().unwrap();
        let report = extract_cells(
            &channels,
            &nucleus,
            &cytosol,
            &test_config(16, 4),
            &dir.path().join("cells.zarr"),
            None,
            &no_progress,
        )
        .unwrap();
        assert_eq!(report.written, 1);
        assert!(report.skipped.is_empty()); // dropped before dispatch, not skipped mid-run
    }

    #[test]
    fn report_lists_written_rows() {
        let mut nucleus: LabelMask = Array2::zeros((50, 50));
        let mut cytosol: LabelMask = Array2::zeros((50, 50));
        square_cell(&mut nucleus, &mut cytosol, 20, 20, 3, 1);
        square_cell(&mut nucleus, &mut cytosol, 35, 35, 3, 2);
        let channels: Vec<Raster> = vec![Array2::zeros((50, 50))];
        let dir = tempfile::tempdir().unwrap();
        let report_path = dir.path().join("cells.csv");
        extract_cells(
            &channels,
            &nucleus,
            &cytosol,
            &test_config(16, 4),
            &dir.path().join("cells.zarr"),
            Some(&report_path),
            &no_progress,
        )
        .unwrap();
        let text = std::fs::read_to_string(&report_path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("0,1,"));
        assert!(lines[2].starts_with("1,2,"));
    }
}
