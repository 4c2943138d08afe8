//! Shard planning and stitching for tiled inference. Shards partition the
//! image into near-square core tiles of at most `shard_size` pixels, each
//! read with `overlap_px` of surrounding context so objects crossing a
//! core boundary appear fully in at least one shard. After the join
//! barrier, local label spaces are remapped through a running global
//! counter and duplicate fragments in overlap borders are reconciled by
//! majority-pixel ownership.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::error::{Error, Result};
use crate::raster::LabelMask;

/// Half-open pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub y0: usize,
    pub x0: usize,
    pub y1: usize,
    pub x1: usize,
}

impl Rect {
    pub fn height(&self) -> usize {
        self.y1 - self.y0
    }

    pub fn width(&self) -> usize {
        self.x1 - self.x0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Shard {
    pub index: usize,
    /// Exclusive tile area; cores partition the image.
    pub core: Rect,
    /// Core plus overlap border, clamped to the image.
    pub bounds: Rect,
}

#[derive(Debug, Clone)]
pub struct ShardGrid {
    pub height: usize,
    pub width: usize,
    pub shards: Vec<Shard>,
}

/// Plan a shard grid for an `height` x `width` image. `shard_size` bounds
/// the core pixel count per shard; `overlap_px` is the context border.
pub fn plan_shards(height: usize, width: usize, shard_size: usize, overlap_px: usize) -> ShardGrid {
    let edge = (shard_size as f64).sqrt().floor().max(1.0) as usize;
    let rows = height.div_ceil(edge);
    let cols = width.div_ceil(edge);
    let mut shards = Vec::with_capacity(rows * cols);
    for row in 0..rows {
        for col in 0..cols {
            let core = Rect {
                y0: row * edge,
                x0: col * edge,
                y1: ((row + 1) * edge).min(height),
                x1: ((col + 1) * edge).min(width),
            };
            let bounds = Rect {
                y0: core.y0.saturating_sub(overlap_px),
                x0: core.x0.saturating_sub(overlap_px),
                y1: (core.y1 + overlap_px).min(height),
                x1: (core.x1 + overlap_px).min(width),
            };
            shards.push(Shard {
                index: shards.len(),
                core,
                bounds,
            });
        }
    }
    ShardGrid {
        height,
        width,
        shards,
    }
}

/// Stitch per-shard label masks (bounds-shaped) into one global mask.
/// `load` is called once per shard in deterministic order, so masks can
/// stream from the shard cache instead of residing in memory at once.
pub fn stitch<F>(grid: &ShardGrid, mut load: F) -> Result<LabelMask>
where
    F: FnMut(&Shard) -> Result<LabelMask>,
{
    let mut canvas: LabelMask = Array2::zeros((grid.height, grid.width));
    let mut next_global = 1u32;
    // Total fragment pixel count per global id, for majority voting.
    let mut fragment_sizes: HashMap<u32, u64> = HashMap::new();
    // Collision pixel counts between fragments meeting in overlap borders.
    let mut collisions: HashMap<(u32, u32), u64> = HashMap::new();

    for shard in &grid.shards {
        let local = load(shard)?;
        if local.dim() != (shard.bounds.height(), shard.bounds.width()) {
            return Err(Error::Segmentation(format!(
                "shard {} mask shape {:?} does not match bounds {}x{}",
                shard.index,
                local.dim(),
                shard.bounds.height(),
                shard.bounds.width()
            )));
        }
        let mut local_sizes: HashMap<u32, u64> = HashMap::new();
        for &l in local.iter() {
            if l != 0 {
                *local_sizes.entry(l).or_insert(0) += 1;
            }
        }
        let mut local_to_global: HashMap<u32, u32> = HashMap::new();
        let mut locals: Vec<u32> = local_sizes.keys().copied().collect();
        locals.sort_unstable();
        for l in locals {
            local_to_global.insert(l, next_global);
            fragment_sizes.insert(next_global, local_sizes[&l]);
            next_global += 1;
        }
        for ly in 0..local.dim().0 {
            for lx in 0..local.dim().1 {
                let l = local[[ly, lx]];
                if l == 0 {
                    continue;
                }
                let g = local_to_global[&l];
                let (y, x) = (shard.bounds.y0 + ly, shard.bounds.x0 + lx);
                let existing = canvas[[y, x]];
                if existing == 0 {
                    canvas[[y, x]] = g;
                } else if existing != g {
                    *collisions.entry((existing, g)).or_insert(0) += 1;
                }
            }
        }
    }

    // Union colliding fragments; the larger fragment's id represents the
    // merged object (tie: lower id).
    let mut parent: Vec<u32> = (0..next_global).collect();
    fn find(parent: &mut [u32], mut id: u32) -> u32 {
        while parent[id as usize] != id {
            parent[id as usize] = parent[parent[id as usize] as usize];
            id = parent[id as usize];
        }
        id
    }
    let mut pairs: Vec<(u32, u32)> = collisions.keys().copied().collect();
    pairs.sort_unstable();
    for (a, b) in pairs {
        let ra = find(&mut parent, a);
        let rb = find(&mut parent, b);
        if ra == rb {
            continue;
        }
        let sa = fragment_sizes.get(&ra).copied().unwrap_or(0);
        let sb = fragment_sizes.get(&rb).copied().unwrap_or(0);
        let (winner, loser) = if sa > sb || (sa == sb && ra < rb) {
            (ra, rb)
        } else {
            (rb, ra)
        };
        parent[loser as usize] = winner;
        let merged = fragment_sizes.get(&winner).copied().unwrap_or(0).max(
            fragment_sizes.get(&loser).copied().unwrap_or(0),
        );
        fragment_sizes.insert(winner, merged);
    }

    // Resolve aliases, then renumber contiguously in ascending root order.
    let mut root_to_final: HashMap<u32, u32> = HashMap::new();
    let mut roots: Vec<u32> = (1..next_global)
        .map(|id| find(&mut parent, id))
        .collect::<std::collections::BTreeSet<u32>>()
        .into_iter()
        .collect();
    roots.sort_unstable();
    for (i, r) in roots.iter().enumerate() {
        root_to_final.insert(*r, i as u32 + 1);
    }
    for px in canvas.iter_mut() {
        if *px != 0 {
            let root = find(&mut parent, *px);
            *px = root_to_final[&root];
        }
    }
    Ok(canvas)
}

// ---------------------------------------------------------------------------
// Shard cache: raw little-endian u32 rasters owned by one pipeline run.
// ---------------------------------------------------------------------------

pub fn cache_path(dir: &Path, kind: &str, index: usize) -> PathBuf {
    dir.join(format!("{}_{:04}.labels", kind, index))
}

pub fn write_shard_cache(dir: &Path, kind: &str, index: usize, mask: &LabelMask) -> Result<()> {
    fs::create_dir_all(dir)?;
    let (h, w) = mask.dim();
    let mut bytes: Vec<u8> = Vec::with_capacity(8 + h * w * 4);
    bytes.extend_from_slice(&(h as u32).to_le_bytes());
    bytes.extend_from_slice(&(w as u32).to_le_bytes());
    for &l in mask.iter() {
        bytes.extend_from_slice(&l.to_le_bytes());
    }
    let mut file = fs::File::create(cache_path(dir, kind, index))?;
    file.write_all(&bytes)?;
    Ok(())
}

pub fn read_shard_cache(dir: &Path, kind: &str, index: usize) -> Result<LabelMask> {
    let mut bytes = Vec::new();
    fs::File::open(cache_path(dir, kind, index))?.read_to_end(&mut bytes)?;
    if bytes.len() < 8 {
        return Err(Error::Storage(format!(
            "truncated shard cache entry {} #{}",
            kind, index
        )));
    }
    let h = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let w = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
    if bytes.len() != 8 + h * w * 4 {
        return Err(Error::Storage(format!(
            "corrupt shard cache entry {} #{}: {} bytes for {}x{}",
            kind,
            index,
            bytes.len(),
            h,
            w
        )));
    }
    let pixels: Vec<u32> = bytes[8..]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Ok(Array2::from_shape_vec((h, w), pixels).map_err(|e| Error::Storage(e.to_string()))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morph::label_areas;

    #[test]
    fn cores_partition_the_image() {
        let grid = plan_shards(1000, 700, 250_000, 100);
        let mut covered: Array2<u32> = Array2::zeros((1000, 700));
        for shard in &grid.shards {
            for y in shard.core.y0..shard.core.y1 {
                for x in shard.core.x0..shard.core.x1 {
                    covered[[y, x]] += 1;
                }
            }
        }
        assert!(covered.iter().all(|&c| c == 1));
    }

    #[test]
    fn bounds_carry_overlap_context() {
        let grid = plan_shards(1000, 1000, 250_000, 100);
        assert_eq!(grid.shards.len(), 4);
        let s = &grid.shards[3]; // bottom-right tile
        assert_eq!(s.core, Rect { y0: 500, x0: 500, y1: 1000, x1: 1000 });
        assert_eq!(s.bounds, Rect { y0: 400, x0: 400, y1: 1000, x1: 1000 });
    }

    #[test]
    fn small_image_is_a_single_shard() {
        let grid = plan_shards(100, 100, 1_000_000, 50);
        assert_eq!(grid.shards.len(), 1);
        assert_eq!(grid.shards[0].bounds, Rect { y0: 0, x0: 0, y1: 100, x1: 100 });
    }

    #[test]
    fn spanning_object_gets_one_global_id() {
        // 100x200 image, two 100x100 shards with 20 px of overlap. One
        // object straddles the boundary: 60 px in the left shard's core,
        // 20 px in the right one's.
        let grid = plan_shards(100, 200, 10_000, 20);
        assert_eq!(grid.shards.len(), 2);
        let object = |y: usize, x: usize| y == 50 && (40..120).contains(&x);
        let global = stitch(&grid, |shard| {
            let mut m: LabelMask =
                Array2::zeros((shard.bounds.height(), shard.bounds.width()));
            for ly in 0..m.dim().0 {
                for lx in 0..m.dim().1 {
                    if object(shard.bounds.y0 + ly, shard.bounds.x0 + lx) {
                        m[[ly, lx]] = 1;
                    }
                }
            }
            Ok(m)
        })
        .unwrap();
        let areas = label_areas(&global);
        assert_eq!(areas.len(), 1);
        assert_eq!(areas[&1], 80);
        for x in 40..120 {
            assert_eq!(global[[50, x]], 1);
        }
    }

    #[test]
    fn disjoint_objects_keep_distinct_ids() {
        let grid = plan_shards(100, 200, 10_000, 20);
        let global = stitch(&grid, |shard| {
            let mut m: LabelMask =
                Array2::zeros((shard.bounds.height(), shard.bounds.width()));
            // One object per shard core, away from the overlap.
            for ly in 10..20 {
                for lx in 10..20 {
                    if shard.bounds.y0 + ly < 100 && shard.bounds.x0 + lx < shard.core.x1 {
                        m[[ly, lx]] = 7;
                    }
                }
            }
            Ok(m)
        })
        .unwrap();
        let areas = label_areas(&global);
        assert_eq!(areas.len(), 2);
    }

    #[test]
    fn cache_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut mask: LabelMask = Array2::zeros((30, 40));
        mask[[3, 4]] = 17;
        mask[[29, 39]] = 2;
        write_shard_cache(dir.path(), "nucleus", 3, &mask).unwrap();
        let back = read_shard_cache(dir.path(), "nucleus", 3).unwrap();
        assert_eq!(mask, back);
    }
}
