//! Binary and label-mask morphology: speckle removal, connected components,
//! per-label erosion, priority dilation, size and edge-contact filtering.

use std::collections::{HashMap, VecDeque};

use ndarray::Array2;

use crate::raster::LabelMask;

const N4: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
const N8: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

/// Erosion with a square structuring element of size `k`. Pixels outside the
/// image count as foreground so border objects are not eaten from the edge.
pub fn binary_erode(mask: &Array2<bool>, k: usize) -> Array2<bool> {
    if k <= 1 {
        return mask.clone();
    }
    let (h, w) = mask.dim();
    let r = (k / 2) as isize;
    let mut out = Array2::from_elem((h, w), false);
    for y in 0..h {
        for x in 0..w {
            if !mask[[y, x]] {
                continue;
            }
            let mut keep = true;
            'win: for dy in -r..=r {
                for dx in -r..=r {
                    let ny = y as isize + dy;
                    let nx = x as isize + dx;
                    if ny < 0 || nx < 0 || ny >= h as isize || nx >= w as isize {
                        continue;
                    }
                    if !mask[[ny as usize, nx as usize]] {
                        keep = false;
                        break 'win;
                    }
                }
            }
            out[[y, x]] = keep;
        }
    }
    out
}

/// Dilation with a square structuring element of size `k`.
pub fn binary_dilate(mask: &Array2<bool>, k: usize) -> Array2<bool> {
    if k <= 1 {
        return mask.clone();
    }
    let (h, w) = mask.dim();
    let r = (k / 2) as isize;
    let mut out = Array2::from_elem((h, w), false);
    for y in 0..h {
        for x in 0..w {
            if !mask[[y, x]] {
                continue;
            }
            for dy in -r..=r {
                for dx in -r..=r {
                    let ny = y as isize + dy;
                    let nx = x as isize + dx;
                    if ny >= 0 && nx >= 0 && ny < h as isize && nx < w as isize {
                        out[[ny as usize, nx as usize]] = true;
                    }
                }
            }
        }
    }
    out
}

pub fn binary_open(mask: &Array2<bool>, k: usize) -> Array2<bool> {
    binary_dilate(&binary_erode(mask, k), k)
}

pub fn binary_close(mask: &Array2<bool>, k: usize) -> Array2<bool> {
    binary_erode(&binary_dilate(mask, k), k)
}

/// BFS connected-component labeling; labels are assigned in scan order 1..n.
pub fn label_components(mask: &Array2<bool>, eight_connected: bool) -> LabelMask {
    let (h, w) = mask.dim();
    let mut labels: LabelMask = Array2::zeros((h, w));
    let neighbors: &[(isize, isize)] = if eight_connected { &N8 } else { &N4 };
    let mut next = 0u32;
    let mut queue = VecDeque::new();
    for y in 0..h {
        for x in 0..w {
            if !mask[[y, x]] || labels[[y, x]] != 0 {
                continue;
            }
            next += 1;
            labels[[y, x]] = next;
            queue.push_back((y, x));
            while let Some((cy, cx)) = queue.pop_front() {
                for &(dy, dx) in neighbors {
                    let ny = cy as isize + dy;
                    let nx = cx as isize + dx;
                    if ny < 0 || nx < 0 || ny >= h as isize || nx >= w as isize {
                        continue;
                    }
                    let (ny, nx) = (ny as usize, nx as usize);
                    if mask[[ny, nx]] && labels[[ny, nx]] == 0 {
                        labels[[ny, nx]] = next;
                        queue.push_back((ny, nx));
                    }
                }
            }
        }
    }
    labels
}

/// Peel `rounds` boundary layers off every label independently. A pixel is
/// boundary when any 4-neighbor (or the image edge) carries a different value.
pub fn erode_labels(labels: &LabelMask, rounds: usize) -> LabelMask {
    let mut current = labels.clone();
    let (h, w) = current.dim();
    for _ in 0..rounds {
        let mut next = current.clone();
        for y in 0..h {
            for x in 0..w {
                let l = current[[y, x]];
                if l == 0 {
                    continue;
                }
                let mut boundary = false;
                for &(dy, dx) in &N4 {
                    let ny = y as isize + dy;
                    let nx = x as isize + dx;
                    if ny < 0 || nx < 0 || ny >= h as isize || nx >= w as isize {
                        boundary = true;
                        break;
                    }
                    if current[[ny as usize, nx as usize]] != l {
                        boundary = true;
                        break;
                    }
                }
                if boundary {
                    next[[y, x]] = 0;
                }
            }
        }
        current = next;
    }
    current
}

/// Grow every label by `rounds` pixels of uniform dilation. Multi-source BFS:
/// each background pixel takes the label of the first wavefront reaching it,
/// so labels never merge and growth is resolved by nearest-seed priority.
pub fn dilate_labels(labels: &LabelMask, rounds: usize) -> LabelMask {
    if rounds == 0 {
        return labels.clone();
    }
    let (h, w) = labels.dim();
    let mut out = labels.clone();
    let mut frontier: Vec<(usize, usize)> = Vec::new();
    for y in 0..h {
        for x in 0..w {
            if out[[y, x]] != 0 {
                frontier.push((y, x));
            }
        }
    }
    for _ in 0..rounds {
        let mut next_frontier = Vec::new();
        for &(y, x) in &frontier {
            let l = out[[y, x]];
            for &(dy, dx) in &N4 {
                let ny = y as isize + dy;
                let nx = x as isize + dx;
                if ny < 0 || nx < 0 || ny >= h as isize || nx >= w as isize {
                    continue;
                }
                let (ny, nx) = (ny as usize, nx as usize);
                if out[[ny, nx]] == 0 {
                    out[[ny, nx]] = l;
                    next_frontier.push((ny, nx));
                }
            }
        }
        frontier = next_frontier;
        if frontier.is_empty() {
            break;
        }
    }
    out
}

/// Pixel area per label.
pub fn label_areas(labels: &LabelMask) -> HashMap<u32, u64> {
    let mut areas = HashMap::new();
    for &l in labels.iter() {
        if l != 0 {
            *areas.entry(l).or_insert(0u64) += 1;
        }
    }
    areas
}

/// Drop labels with area outside `[min_size, max_size]` or, when
/// `contact_filter` is set, labels whose perimeter lies on the image edge
/// for at least that fraction. Returns the dropped label ids.
pub fn filter_labels(
    labels: &mut LabelMask,
    min_size: u64,
    max_size: u64,
    contact_filter: Option<f64>,
) -> Vec<u32> {
    let (h, w) = labels.dim();
    let areas = label_areas(labels);
    let mut perimeter: HashMap<u32, u64> = HashMap::new();
    let mut edge_contact: HashMap<u32, u64> = HashMap::new();

    if contact_filter.is_some() {
        for y in 0..h {
            for x in 0..w {
                let l = labels[[y, x]];
                if l == 0 {
                    continue;
                }
                let on_edge = y == 0 || x == 0 || y == h - 1 || x == w - 1;
                let mut boundary = on_edge;
                if !boundary {
                    for &(dy, dx) in &N4 {
                        let ny = (y as isize + dy) as usize;
                        let nx = (x as isize + dx) as usize;
                        if labels[[ny, nx]] != l {
                            boundary = true;
                            break;
                        }
                    }
                }
                if boundary {
                    *perimeter.entry(l).or_insert(0) += 1;
                    if on_edge {
                        *edge_contact.entry(l).or_insert(0) += 1;
                    }
                }
            }
        }
    }

    let mut dropped: Vec<u32> = Vec::new();
    for (&l, &area) in &areas {
        if area < min_size || area > max_size {
            dropped.push(l);
            continue;
        }
        if let Some(cf) = contact_filter {
            let per = perimeter.get(&l).copied().unwrap_or(0);
            let edge = edge_contact.get(&l).copied().unwrap_or(0);
            if per > 0 && edge as f64 / per as f64 >= cf {
                dropped.push(l);
            }
        }
    }
    if !dropped.is_empty() {
        let drop_set: std::collections::HashSet<u32> = dropped.iter().copied().collect();
        for l in labels.iter_mut() {
            if drop_set.contains(l) {
                *l = 0;
            }
        }
    }
    dropped.sort_unstable();
    dropped
}

/// Renumber surviving labels contiguously 1..K in ascending old-id order.
/// Returns the old-to-new mapping.
pub fn relabel_contiguous(labels: &mut LabelMask) -> HashMap<u32, u32> {
    let mut old_ids: Vec<u32> = label_areas(labels).keys().copied().collect();
    old_ids.sort_unstable();
    let mapping: HashMap<u32, u32> = old_ids
        .iter()
        .enumerate()
        .map(|(i, &old)| (old, i as u32 + 1))
        .collect();
    for l in labels.iter_mut() {
        if *l != 0 {
            *l = mapping[l];
        }
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect_mask(h: usize, w: usize, y0: usize, y1: usize, x0: usize, x1: usize) -> Array2<bool> {
        let mut m = Array2::from_elem((h, w), false);
        for y in y0..y1 {
            for x in x0..x1 {
                m[[y, x]] = true;
            }
        }
        m
    }

    #[test]
    fn open_removes_speckles_keeps_blobs() {
        let mut m = rect_mask(30, 30, 5, 15, 5, 15);
        m[[25, 25]] = true; // single-pixel speckle
        let opened = binary_open(&m, 3);
        assert!(!opened[[25, 25]]);
        assert!(opened[[10, 10]]);
    }

    #[test]
    fn components_are_separated() {
        let mut m = rect_mask(20, 20, 2, 6, 2, 6);
        for y in 12..16 {
            for x in 12..16 {
                m[[y, x]] = true;
            }
        }
        let labels = label_components(&m, false);
        let areas = label_areas(&labels);
        assert_eq!(areas.len(), 2);
        assert!(areas.values().all(|&a| a == 16));
    }

    #[test]
    fn dilate_labels_never_merges() {
        let mut labels: LabelMask = Array2::zeros((20, 20));
        labels[[10, 5]] = 1;
        labels[[10, 9]] = 2;
        let grown = dilate_labels(&labels, 5);
        // Midpoint pixels belong to exactly one of the two labels.
        assert!(grown[[10, 7]] == 1 || grown[[10, 7]] == 2);
        let areas = label_areas(&grown);
        assert_eq!(areas.len(), 2);
        assert!(areas[&1] > 1 && areas[&2] > 1);
    }

    #[test]
    fn erode_then_relabel_round_trip() {
        let mut labels: LabelMask = Array2::zeros((20, 20));
        for y in 5..15 {
            for x in 5..15 {
                labels[[y, x]] = 3;
            }
        }
        let eroded = erode_labels(&labels, 2);
        let areas = label_areas(&eroded);
        assert_eq!(areas[&3], 36); // 10x10 peeled twice -> 6x6
        let mut eroded = eroded;
        let mapping = relabel_contiguous(&mut eroded);
        assert_eq!(mapping[&3], 1);
        assert_eq!(label_areas(&eroded)[&1], 36);
    }

    #[test]
    fn size_filter_bounds_are_inclusive() {
        let mut labels: LabelMask = Array2::zeros((30, 30));
        for y in 2..6 {
            for x in 2..6 {
                labels[[y, x]] = 1; // 16 px
            }
        }
        for y in 10..20 {
            for x in 10..20 {
                labels[[y, x]] = 2; // 100 px
            }
        }
        let dropped = filter_labels(&mut labels, 16, 99, None);
        assert_eq!(dropped, vec![2]);
        let areas = label_areas(&labels);
        assert!(areas.contains_key(&1));
        assert!(!areas.contains_key(&2));
    }

    #[test]
    fn contact_filter_drops_border_hugging_labels() {
        // Strip along the top border: 2x50, every pixel is perimeter,
        // 51 of 100 lie on the image edge -> fraction > 0.5.
        let mut labels: LabelMask = Array2::zeros((100, 100));
        for y in 0..2 {
            for x in 0..50 {
                labels[[y, x]] = 1;
            }
        }
        // Square touching the left border with a short side: 10x10 at x=0,
        // 10 of 36 perimeter pixels on the edge -> fraction < 0.5.
        for y in 40..50 {
            for x in 0..10 {
                labels[[y, x]] = 2;
            }
        }
        let dropped = filter_labels(&mut labels, 1, u64::MAX, Some(0.5));
        assert_eq!(dropped, vec![1]);
        assert!(label_areas(&labels).contains_key(&2));
    }
}
