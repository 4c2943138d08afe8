//! Reconciles independently numbered nucleus and cytosol label masks into
//! one canonical cell-identity space by overlap voting. Stateless, pure
//! functions over two rasters; the models that produced them are never
//! consulted.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::raster::LabelMask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchedPair {
    pub cell_id: u32,
    pub nucleus: u32,
    pub cytosol: u32,
}

#[derive(Debug, Default)]
pub struct MatchTable {
    /// Matched pairs ordered by canonical cell id 1..M.
    pub pairs: Vec<MatchedPair>,
}

impl MatchTable {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Match nucleus labels to cytosol labels. `overlap(n, c) = |n ∩ c| / |n|`;
/// a pair survives when its overlap reaches `threshold` and it is the best
/// match from both sides (ties: larger intersection, then lower label id).
/// Zero matches is a valid outcome, not an error.
pub fn match_masks(
    nuclei: &LabelMask,
    cytosols: &LabelMask,
    threshold: f64,
) -> Result<MatchTable> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(Error::Matching(format!(
            "filtering_threshold_mask_matching {} outside [0, 1]",
            threshold
        )));
    }
    if nuclei.dim() != cytosols.dim() {
        return Err(Error::Matching(format!(
            "nucleus mask shape {:?} does not match cytosol mask shape {:?}",
            nuclei.dim(),
            cytosols.dim()
        )));
    }

    let mut intersections: HashMap<(u32, u32), u64> = HashMap::new();
    let mut nucleus_areas: HashMap<u32, u64> = HashMap::new();
    for (&n, &c) in nuclei.iter().zip(cytosols.iter()) {
        if n != 0 {
            *nucleus_areas.entry(n).or_insert(0) += 1;
            if c != 0 {
                *intersections.entry((n, c)).or_insert(0) += 1;
            }
        }
    }

    // Best candidate per nucleus and per cytosol under the same metric.
    let mut best_for_nucleus: HashMap<u32, (f64, u64, u32)> = HashMap::new();
    let mut best_for_cytosol: HashMap<u32, (f64, u64, u32)> = HashMap::new();
    for (&(n, c), &inter) in &intersections {
        let overlap = inter as f64 / nucleus_areas[&n] as f64;
        let entry = best_for_nucleus.entry(n).or_insert((f64::MIN, 0, u32::MAX));
        if better(overlap, inter, c, *entry) {
            *entry = (overlap, inter, c);
        }
        let entry = best_for_cytosol.entry(c).or_insert((f64::MIN, 0, u32::MAX));
        if better(overlap, inter, n, *entry) {
            *entry = (overlap, inter, n);
        }
    }

    let mut accepted: Vec<(u32, u32)> = Vec::new();
    for (&n, &(overlap, _, c)) in &best_for_nucleus {
        if overlap < threshold {
            continue;
        }
        if best_for_cytosol[&c].2 == n {
            accepted.push((n, c));
        }
    }
    accepted.sort_unstable();

    let pairs = accepted
        .into_iter()
        .enumerate()
        .map(|(i, (n, c))| MatchedPair {
            cell_id: i as u32 + 1,
            nucleus: n,
            cytosol: c,
        })
        .collect();
    Ok(MatchTable { pairs })
}

fn better(overlap: f64, inter: u64, id: u32, current: (f64, u64, u32)) -> bool {
    (overlap, inter, std::cmp::Reverse(id)) > (current.0, current.1, std::cmp::Reverse(current.2))
}

/// Rewrite both masks into the canonical id space. Pixels of unmatched
/// labels become background; label 0 never receives a cell id.
pub fn apply_table(
    table: &MatchTable,
    nuclei: &LabelMask,
    cytosols: &LabelMask,
) -> (LabelMask, LabelMask) {
    let nucleus_map: HashMap<u32, u32> = table
        .pairs
        .iter()
        .map(|p| (p.nucleus, p.cell_id))
        .collect();
    let cytosol_map: HashMap<u32, u32> = table
        .pairs
        .iter()
        .map(|p| (p.cytosol, p.cell_id))
        .collect();
    let n = nuclei.mapv(|l| nucleus_map.get(&l).copied().unwrap_or(0));
    let c = cytosols.mapv(|l| cytosol_map.get(&l).copied().unwrap_or(0));
    (n, c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// Lay out labeled runs on one row: (label, length) per mask.
    fn run_mask(w: usize, runs: &[(u32, usize)]) -> LabelMask {
        let mut m: LabelMask = Array2::zeros((1, w));
        let mut x = 0;
        for &(label, len) in runs {
            for _ in 0..len {
                m[[0, x]] = label;
                x += 1;
            }
        }
        m
    }

    #[test]
    fn threshold_gates_overlap() {
        // Nucleus A: 100 px, cytosol B: 100 px, intersection 80 px.
        let nuclei = run_mask(200, &[(0, 20), (1, 100)]);
        let cytosols = run_mask(200, &[(1, 100), (0, 100)]);
        // Intersection = pixels 20..100 -> 80 px, overlap = 0.8.
        let dropped = match_masks(&nuclei, &cytosols, 0.95).unwrap();
        assert!(dropped.is_empty());
        let kept = match_masks(&nuclei, &cytosols, 0.7).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.pairs[0], MatchedPair { cell_id: 1, nucleus: 1, cytosol: 1 });
    }

    #[test]
    fn mutual_best_match_wins() {
        // Nucleus 1 (20 px) overlaps cytosol 2 with 18 px (0.9) and
        // cytosol 3 with 19 px... build overlaps 0.45 vs 0.55 instead:
        // row 0: nucleus 1 spans 0..20; cytosol 2 spans 0..9, cytosol 3 spans 9..20.
        let nuclei = run_mask(40, &[(1, 20)]);
        let cytosols = run_mask(40, &[(2, 9), (3, 11)]);
        let table = match_masks(&nuclei, &cytosols, 0.0).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.pairs[0].cytosol, 3);
    }

    #[test]
    fn contested_cytosol_goes_to_better_nucleus() {
        // Cytosol 7 overlaps nucleus 1 at 0.5 and nucleus 2 at 1.0;
        // nucleus 1 has no other candidate but is not cytosol 7's best.
        let mut nuclei: LabelMask = Array2::zeros((2, 20));
        let mut cytosols: LabelMask = Array2::zeros((2, 20));
        for x in 0..10 {
            nuclei[[0, x]] = 1;
        }
        for x in 5..10 {
            cytosols[[0, x]] = 7;
        }
        for x in 10..16 {
            nuclei[[1, x]] = 2;
            cytosols[[1, x]] = 7;
        }
        let table = match_masks(&nuclei, &cytosols, 0.0).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.pairs[0].nucleus, 2);
        assert_eq!(table.pairs[0].cytosol, 7);
    }

    #[test]
    fn invalid_threshold_is_a_matching_error() {
        let m: LabelMask = Array2::zeros((4, 4));
        assert!(matches!(
            match_masks(&m, &m, 1.5),
            Err(Error::Matching(_))
        ));
        assert!(matches!(
            match_masks(&m, &m, -0.1),
            Err(Error::Matching(_))
        ));
    }

    #[test]
    fn zero_matches_is_not_an_error() {
        let nuclei = run_mask(20, &[(1, 5)]);
        let mut cytosols: LabelMask = Array2::zeros((1, 20));
        cytosols[[0, 10]] = 4;
        let table = match_masks(&nuclei, &cytosols, 0.5).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn canonical_ids_are_contiguous_and_applied() {
        // Two clean pairs with gappy source ids.
        let nuclei = run_mask(40, &[(5, 10), (0, 5), (9, 10)]);
        let cytosols = run_mask(40, &[(3, 10), (0, 5), (1, 10)]);
        let table = match_masks(&nuclei, &cytosols, 0.9).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.pairs,
            vec![
                MatchedPair { cell_id: 1, nucleus: 5, cytosol: 3 },
                MatchedPair { cell_id: 2, nucleus: 9, cytosol: 1 },
            ]
        );
        let (n, c) = apply_table(&table, &nuclei, &cytosols);
        assert_eq!(n[[0, 0]], 1);
        assert_eq!(c[[0, 0]], 1);
        assert_eq!(n[[0, 20]], 2);
        assert_eq!(c[[0, 20]], 2);
        assert_eq!(n[[0, 12]], 0);
    }
}
