//! Seed detection and region growing: chamfer distance transform, local
//! maxima with minimum-separation suppression, seeded watershed flooding,
//! and Dijkstra front propagation for intensity cost maps.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ndarray::Array2;

use crate::raster::LabelMask;

const N4: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

/// Seed point: (y, x) coordinate plus its label.
pub type Seed = ((usize, usize), u32);

/// Two-pass chamfer 3-4 distance to the nearest background pixel,
/// rescaled to approximate pixel units.
pub fn distance_transform(mask: &Array2<bool>) -> Array2<f32> {
    let (h, w) = mask.dim();
    let inf = i32::MAX / 2;
    let mut dist: Array2<i32> = Array2::from_elem((h, w), inf);
    for y in 0..h {
        for x in 0..w {
            if !mask[[y, x]] {
                dist[[y, x]] = 0;
            }
        }
    }
    let forward: [(isize, isize, i32); 4] = [(-1, 0, 3), (0, -1, 3), (-1, -1, 4), (-1, 1, 4)];
    for y in 0..h {
        for x in 0..w {
            if dist[[y, x]] == 0 {
                continue;
            }
            let mut best = dist[[y, x]];
            for &(dy, dx, cost) in &forward {
                let ny = y as isize + dy;
                let nx = x as isize + dx;
                if ny < 0 || nx < 0 || ny >= h as isize || nx >= w as isize {
                    continue;
                }
                best = best.min(dist[[ny as usize, nx as usize]] + cost);
            }
            dist[[y, x]] = best;
        }
    }
    let backward: [(isize, isize, i32); 4] = [(1, 0, 3), (0, 1, 3), (1, 1, 4), (1, -1, 4)];
    for y in (0..h).rev() {
        for x in (0..w).rev() {
            if dist[[y, x]] == 0 {
                continue;
            }
            let mut best = dist[[y, x]];
            for &(dy, dx, cost) in &backward {
                let ny = y as isize + dy;
                let nx = x as isize + dx;
                if ny < 0 || nx < 0 || ny >= h as isize || nx >= w as isize {
                    continue;
                }
                best = best.min(dist[[ny as usize, nx as usize]] + cost);
            }
            dist[[y, x]] = best;
        }
    }
    dist.mapv(|d| d as f32 / 3.0)
}

/// Local maxima of `surface` within a `footprint`-sized neighborhood,
/// greedily thinned so no two survivors are closer than `min_distance`.
/// Survivors become seeds labeled 1..n in decreasing height order.
pub fn find_peaks(surface: &Array2<f32>, footprint: usize, min_distance: usize) -> Vec<Seed> {
    let (h, w) = surface.dim();
    let r = (footprint.max(1) / 2) as isize;
    let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let v = surface[[y, x]];
            if v <= 0.0 {
                continue;
            }
            let mut is_max = true;
            'win: for dy in -r..=r {
                for dx in -r..=r {
                    let ny = y as isize + dy;
                    let nx = x as isize + dx;
                    if ny < 0 || nx < 0 || ny >= h as isize || nx >= w as isize {
                        continue;
                    }
                    if surface[[ny as usize, nx as usize]] > v {
                        is_max = false;
                        break 'win;
                    }
                }
            }
            if is_max {
                candidates.push((v, y, x));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let min_d2 = (min_distance * min_distance) as i64;
    let mut seeds: Vec<Seed> = Vec::new();
    for (_, y, x) in candidates {
        let ok = seeds.iter().all(|&((sy, sx), _)| {
            let dy = sy as i64 - y as i64;
            let dx = sx as i64 - x as i64;
            dy * dy + dx * dx >= min_d2
        });
        if ok {
            let label = seeds.len() as u32 + 1;
            seeds.push(((y, x), label));
        }
    }
    seeds
}

#[derive(PartialEq)]
struct FloodItem {
    priority: f32,
    order: u64,
    y: usize,
    x: usize,
    label: u32,
}

impl Eq for FloodItem {}

impl Ord for FloodItem {
    // Reversed so BinaryHeap pops the lowest priority first; insertion
    // order breaks ties to keep flooding deterministic.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.order.cmp(&self.order))
    }
}

impl PartialOrd for FloodItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Meyer-style seeded watershed: flood `surface` upward from the seeds,
/// restricted to `mask`. Every reachable masked pixel joins the basin of
/// its nearest seed; unseeded components stay background.
pub fn watershed(surface: &Array2<f32>, seeds: &[Seed], mask: &Array2<bool>) -> LabelMask {
    let (h, w) = surface.dim();
    let mut labels: LabelMask = Array2::zeros((h, w));
    let mut heap: BinaryHeap<FloodItem> = BinaryHeap::new();
    let mut order = 0u64;
    for &((y, x), label) in seeds {
        if !mask[[y, x]] {
            continue;
        }
        labels[[y, x]] = label;
        heap.push(FloodItem {
            priority: surface[[y, x]],
            order,
            y,
            x,
            label,
        });
        order += 1;
    }
    while let Some(item) = heap.pop() {
        for &(dy, dx) in &N4 {
            let ny = item.y as isize + dy;
            let nx = item.x as isize + dx;
            if ny < 0 || nx < 0 || ny >= h as isize || nx >= w as isize {
                continue;
            }
            let (ny, nx) = (ny as usize, nx as usize);
            if !mask[[ny, nx]] || labels[[ny, nx]] != 0 {
                continue;
            }
            labels[[ny, nx]] = item.label;
            heap.push(FloodItem {
                priority: surface[[ny, nx]],
                order,
                y: ny,
                x: nx,
                label: item.label,
            });
            order += 1;
        }
    }
    labels
}

/// Dijkstra front propagation over a per-pixel step cost, seeded at every
/// labeled pixel of `seeds` with arrival time zero. Returns basin labels
/// and arrival times; each pixel takes the label of the seed region whose
/// front arrives first, which is the watershed of the arrival-time surface.
pub fn propagate_labels(
    cost: &Array2<f32>,
    seeds: &LabelMask,
    mask: &Array2<bool>,
) -> (LabelMask, Array2<f32>) {
    let (h, w) = cost.dim();
    let mut labels: LabelMask = Array2::zeros((h, w));
    let mut arrival: Array2<f32> = Array2::from_elem((h, w), f32::INFINITY);
    let mut heap: BinaryHeap<FloodItem> = BinaryHeap::new();
    let mut order = 0u64;
    for y in 0..h {
        for x in 0..w {
            let l = seeds[[y, x]];
            if l != 0 {
                labels[[y, x]] = l;
                arrival[[y, x]] = 0.0;
                heap.push(FloodItem {
                    priority: 0.0,
                    order,
                    y,
                    x,
                    label: l,
                });
                order += 1;
            }
        }
    }
    while let Some(item) = heap.pop() {
        if item.priority > arrival[[item.y, item.x]] {
            continue; // stale entry
        }
        for &(dy, dx) in &N4 {
            let ny = item.y as isize + dy;
            let nx = item.x as isize + dx;
            if ny < 0 || nx < 0 || ny >= h as isize || nx >= w as isize {
                continue;
            }
            let (ny, nx) = (ny as usize, nx as usize);
            if !mask[[ny, nx]] || seeds[[ny, nx]] != 0 {
                continue;
            }
            let t = item.priority + cost[[ny, nx]].max(0.0);
            if t < arrival[[ny, nx]] {
                arrival[[ny, nx]] = t;
                labels[[ny, nx]] = item.label;
                heap.push(FloodItem {
                    priority: t,
                    order,
                    y: ny,
                    x: nx,
                    label: item.label,
                });
                order += 1;
            }
        }
    }
    (labels, arrival)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morph::label_areas;

    fn disk_mask(h: usize, w: usize, cy: usize, cx: usize, radius: f64) -> Array2<bool> {
        let mut m = Array2::from_elem((h, w), false);
        for y in 0..h {
            for x in 0..w {
                let dy = y as f64 - cy as f64;
                let dx = x as f64 - cx as f64;
                if (dy * dy + dx * dx).sqrt() <= radius {
                    m[[y, x]] = true;
                }
            }
        }
        m
    }

    #[test]
    fn distance_peaks_at_disk_center() {
        let m = disk_mask(40, 40, 20, 20, 8.0);
        let d = distance_transform(&m);
        let mut best = (0.0f32, 0, 0);
        for y in 0..40 {
            for x in 0..40 {
                if d[[y, x]] > best.0 {
                    best = (d[[y, x]], y, x);
                }
            }
        }
        assert!((best.1 as isize - 20).abs() <= 1);
        assert!((best.2 as isize - 20).abs() <= 1);
        assert_eq!(d[[0, 0]], 0.0);
    }

    #[test]
    fn two_separated_disks_give_two_peaks() {
        let mut m = disk_mask(60, 60, 20, 20, 6.0);
        let other = disk_mask(60, 60, 20, 40, 6.0);
        for (a, b) in m.iter_mut().zip(other.iter()) {
            *a = *a || *b;
        }
        let d = distance_transform(&m);
        let seeds = find_peaks(&d, 7, 8);
        assert_eq!(seeds.len(), 2);
    }

    #[test]
    fn min_distance_suppresses_nearby_peaks() {
        let m = disk_mask(40, 40, 20, 20, 8.0);
        let d = distance_transform(&m);
        let seeds = find_peaks(&d, 3, 30);
        assert_eq!(seeds.len(), 1);
    }

    #[test]
    fn watershed_splits_touching_disks() {
        let mut m = disk_mask(40, 70, 20, 25, 9.0);
        let other = disk_mask(40, 70, 20, 41, 9.0);
        for (a, b) in m.iter_mut().zip(other.iter()) {
            *a = *a || *b;
        }
        let d = distance_transform(&m);
        let seeds = find_peaks(&d, 7, 8);
        assert_eq!(seeds.len(), 2);
        let surface = d.mapv(|v| -v);
        let labels = watershed(&surface, &seeds, &m);
        let areas = label_areas(&labels);
        assert_eq!(areas.len(), 2);
        // Every masked pixel is claimed by a basin.
        let total: u64 = areas.values().sum();
        let mask_px = m.iter().filter(|&&b| b).count() as u64;
        assert_eq!(total, mask_px);
    }

    #[test]
    fn propagation_inherits_seed_labels() {
        let mut seeds: LabelMask = Array2::zeros((30, 30));
        seeds[[10, 10]] = 4;
        seeds[[10, 20]] = 9;
        let cost: Array2<f32> = Array2::from_elem((30, 30), 1.0);
        let mask = Array2::from_elem((30, 30), true);
        let (labels, arrival) = propagate_labels(&cost, &seeds, &mask);
        assert_eq!(labels[[10, 12]], 4);
        assert_eq!(labels[[10, 18]], 9);
        assert_eq!(arrival[[10, 10]], 0.0);
        assert!(arrival[[10, 12]] > 0.0);
        let areas = label_areas(&labels);
        assert_eq!(areas.len(), 2);
    }
}
