//! Small-loss sample selection.
//!
//! Selections are batch positions, ordered by ascending loss.

use std::cmp::Ordering;

use noisy_dataset::TrustGraph;

/// The `keep` lowest-loss positions of a batch.
///
/// The sort is stable, so equal losses keep batch order; non-finite losses
/// sort after every finite one.
pub fn small_loss_selection(losses: &[f32], keep: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..losses.len()).collect();
    order.sort_by(|&a, &b| compare_losses(losses[a], losses[b]));
    order.truncate(keep.min(losses.len()));
    order
}

fn compare_losses(a: f32, b: f32) -> Ordering {
    match (a.is_finite(), b.is_finite()) {
        (true, true) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => Ordering::Equal,
    }
}

/// Drops selected positions whose sample the graph does not trust.
///
/// `sample_indices` maps batch positions to dataset indices. When nothing
/// survives, the lowest-loss position of the original selection is kept.
pub fn filter_trusted(
    selection: &[usize],
    sample_indices: &[usize],
    graph: &dyn TrustGraph,
) -> Vec<usize> {
    let indices: Vec<usize> = selection.iter().map(|&pos| sample_indices[pos]).collect();
    let mask = graph.trusted_mask(&indices);

    let filtered: Vec<usize> = selection
        .iter()
        .zip(mask)
        .filter_map(|(&pos, trusted)| trusted.then_some(pos))
        .collect();

    if filtered.is_empty() {
        selection.first().copied().into_iter().collect()
    } else {
        filtered
    }
}

/// Positions of the batch not in `selection`, in batch order
pub fn excluded_positions(batch_len: usize, selection: &[usize]) -> Vec<usize> {
    let mut selected = vec![false; batch_len];
    for &pos in selection {
        if pos < batch_len {
            selected[pos] = true;
        }
    }
    (0..batch_len).filter(|&pos| !selected[pos]).collect()
}

/// Fraction of the batch present in both selections
pub fn agreement_fraction(batch_len: usize, a: &[usize], b: &[usize]) -> f64 {
    if batch_len == 0 {
        return 0.0;
    }
    let mut in_a = vec![false; batch_len];
    for &pos in a {
        if pos < batch_len {
            in_a[pos] = true;
        }
    }
    let shared = b.iter().filter(|&&pos| pos < batch_len && in_a[pos]).count();
    shared as f64 / batch_len as f64
}

/// Fraction of selected samples whose observed label matches the clean one.
///
/// `None` when no selected sample carries a clean label.
pub fn label_precision(
    selection: &[usize],
    observed: &[usize],
    clean: &[Option<usize>],
) -> Option<f64> {
    let mut known = 0usize;
    let mut correct = 0usize;
    for &pos in selection {
        if let Some(Some(truth)) = clean.get(pos) {
            known += 1;
            if observed.get(pos) == Some(truth) {
                correct += 1;
            }
        }
    }
    (known > 0).then(|| correct as f64 / known as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AllowList(Vec<usize>);

    impl TrustGraph for AllowList {
        fn trusted_mask(&self, indices: &[usize]) -> Vec<bool> {
            indices.iter().map(|i| self.0.contains(i)).collect()
        }
    }

    #[test]
    fn test_selects_lowest_losses() {
        let losses = [0.9, 0.1, 0.5, 0.3];
        assert_eq!(small_loss_selection(&losses, 2), vec![1, 3]);
        assert_eq!(small_loss_selection(&losses, 10), vec![1, 3, 2, 0]);
    }

    #[test]
    fn test_ties_keep_batch_order() {
        let losses = [0.2, 0.1, 0.2, 0.1];
        assert_eq!(small_loss_selection(&losses, 3), vec![1, 3, 0]);
    }

    #[test]
    fn test_non_finite_sorts_last() {
        let losses = [f32::NAN, 0.4, f32::INFINITY, 0.2];
        assert_eq!(small_loss_selection(&losses, 2), vec![3, 1]);
        assert_eq!(&small_loss_selection(&losses, 4)[2..], &[0, 2]);
    }

    #[test]
    fn test_graph_filter() {
        let sample_indices = [10, 11, 12, 13];
        let graph = AllowList(vec![12, 10]);
        assert_eq!(filter_trusted(&[3, 2, 0], &sample_indices, &graph), vec![2, 0]);
    }

    #[test]
    fn test_graph_filter_never_empties_selection() {
        let sample_indices = [10, 11, 12, 13];
        let graph = AllowList(vec![]);
        assert_eq!(filter_trusted(&[3, 2], &sample_indices, &graph), vec![3]);
    }

    #[test]
    fn test_excluded_and_agreement() {
        assert_eq!(excluded_positions(5, &[4, 1]), vec![0, 2, 3]);
        assert_eq!(agreement_fraction(4, &[0, 1], &[1, 2]), 0.25);
        assert_eq!(agreement_fraction(0, &[], &[]), 0.0);
    }

    #[test]
    fn test_label_precision() {
        let observed = [0, 1, 2, 3];
        let clean = [Some(0), Some(2), None, Some(3)];
        assert_eq!(label_precision(&[0, 1, 3], &observed, &clean), Some(2.0 / 3.0));
        assert_eq!(label_precision(&[2], &observed, &clean), None);
    }
}
