//! Tag-wise ranking metrics
//!
//! ROC-AUC and Average Precision computed independently per tag over an
//! `N x T` prediction/label pair. A tag whose truth column is all-zero or
//! all-one has no defined ranking metric; those columns yield a NaN sentinel
//! which [`nan_mean`] excludes from aggregates instead of poisoning them.
//! All functions are deterministic for identical inputs.

use anyhow::anyhow;
use candle_core::Tensor;
use ndarray::{Array1, Array2};
use tracing::warn;

use crate::error::Result;

/// Mean over finite values only; NaN when every value is excluded
pub fn nan_mean(values: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for &v in values {
        if v.is_finite() {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

/// ROC-AUC for one tag via the rank-sum (Mann-Whitney) statistic.
///
/// Ties in `scores` receive averaged ranks. Returns NaN when the tag has no
/// positive or no negative examples.
pub fn roc_auc(labels: &[f32], scores: &[f32]) -> f64 {
    debug_assert_eq!(labels.len(), scores.len());
    let n_pos = labels.iter().filter(|&&l| l > 0.5).count();
    let n_neg = labels.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return f64::NAN;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[a]
            .partial_cmp(&scores[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // average ranks across tied score groups
    let mut ranks = vec![0.0f64; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg_rank;
        }
        i = j + 1;
    }

    let rank_sum_pos: f64 = labels
        .iter()
        .zip(&ranks)
        .filter(|(&l, _)| l > 0.5)
        .map(|(_, &r)| r)
        .sum();

    let u = rank_sum_pos - (n_pos * (n_pos + 1)) as f64 / 2.0;
    u / (n_pos * n_neg) as f64
}

/// Average Precision for one tag.
///
/// Ranks by descending score and averages precision at each positive hit.
/// Returns NaN when the tag has no positive examples.
pub fn average_precision(labels: &[f32], scores: &[f32]) -> f64 {
    debug_assert_eq!(labels.len(), scores.len());
    let n_pos = labels.iter().filter(|&&l| l > 0.5).count();
    if n_pos == 0 {
        return f64::NAN;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut hits = 0usize;
    let mut sum_precision = 0.0;
    for (k, &idx) in order.iter().enumerate() {
        if labels[idx] > 0.5 {
            hits += 1;
            sum_precision += hits as f64 / (k + 1) as f64;
        }
    }
    sum_precision / n_pos as f64
}

/// Per-tag ROC-AUC and Average Precision over `N` tracks and `T` tags.
///
/// Both returned vectors have length `T`; degenerate tags carry NaN.
pub fn tagwise_auc_ap(
    y_true: &Array2<f32>,
    y_pred: &Array2<f32>,
) -> Result<(Array1<f64>, Array1<f64>)> {
    if y_true.dim() != y_pred.dim() {
        return Err(anyhow!(
            "shape mismatch: labels {:?} vs predictions {:?}",
            y_true.dim(),
            y_pred.dim()
        )
        .into());
    }

    let n_tags = y_true.ncols();
    let mut auc = Array1::zeros(n_tags);
    let mut ap = Array1::zeros(n_tags);
    let mut degenerate = 0usize;

    for tag in 0..n_tags {
        let labels: Vec<f32> = y_true.column(tag).to_vec();
        let scores: Vec<f32> = y_pred.column(tag).to_vec();
        let tag_auc = roc_auc(&labels, &scores);
        if tag_auc.is_nan() {
            degenerate += 1;
        }
        auc[tag] = tag_auc;
        ap[tag] = average_precision(&labels, &scores);
    }

    if degenerate > 0 {
        warn!(
            degenerate,
            n_tags, "tags without positive and negative examples excluded from aggregates"
        );
    }

    Ok((auc, ap))
}

/// Scalar AUC/AP for one training step's label/logit tensors
pub fn batch_auc_ap(labels: &Tensor, logits: &Tensor) -> Result<(f64, f64)> {
    let y_true = tensor_to_array(labels)?;
    let y_pred = tensor_to_array(logits)?;
    let (auc, ap) = tagwise_auc_ap(&y_true, &y_pred)?;
    Ok((
        nan_mean(auc.as_slice().expect("contiguous")),
        nan_mean(ap.as_slice().expect("contiguous")),
    ))
}

/// Copy a 2-D tensor into an ndarray matrix
pub fn tensor_to_array(t: &Tensor) -> Result<Array2<f32>> {
    let rows = t.to_vec2::<f32>()?;
    let ncols = rows.first().map_or(0, Vec::len);
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    let nrows = if ncols == 0 { 0 } else { flat.len() / ncols };
    Ok(Array2::from_shape_vec((nrows, ncols), flat)
        .map_err(|e| anyhow!("tensor to matrix: {e}"))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_perfect_separation_scores_one() {
        let y_true = array![[1.0f32, 0.0], [0.0, 1.0], [1.0, 0.0], [0.0, 1.0]];
        let y_pred = array![[0.9f32, 0.1], [0.2, 0.8], [0.8, 0.2], [0.3, 0.7]];
        let (auc, ap) = tagwise_auc_ap(&y_true, &y_pred).unwrap();
        for tag in 0..2 {
            assert_abs_diff_eq!(auc[tag], 1.0, epsilon = 1e-12);
            assert_abs_diff_eq!(ap[tag], 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_reversed_ranking_scores_zero_auc() {
        let labels = [0.0f32, 0.0, 1.0, 1.0];
        let scores = [0.9f32, 0.8, 0.2, 0.1];
        assert_abs_diff_eq!(roc_auc(&labels, &scores), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_tied_scores_average_ranks() {
        let labels = [1.0f32, 0.0];
        let scores = [0.5f32, 0.5];
        assert_abs_diff_eq!(roc_auc(&labels, &scores), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_tag_yields_nan_not_panic() {
        let y_true = array![[0.0f32, 1.0], [0.0, 0.0], [0.0, 1.0]];
        let y_pred = array![[0.1f32, 0.9], [0.4, 0.3], [0.2, 0.8]];
        let (auc, ap) = tagwise_auc_ap(&y_true, &y_pred).unwrap();
        assert!(auc[0].is_nan());
        assert!(ap[0].is_nan());
        assert!(auc[1].is_finite());
    }

    #[test]
    fn test_nan_mean_excludes_sentinels() {
        assert_abs_diff_eq!(nan_mean(&[1.0, f64::NAN, 0.5]), 0.75, epsilon = 1e-12);
        assert!(nan_mean(&[f64::NAN, f64::NAN]).is_nan());
        assert!(nan_mean(&[]).is_nan());
    }

    #[test]
    fn test_determinism() {
        let labels = [1.0f32, 0.0, 1.0, 0.0, 1.0];
        let scores = [0.3f32, 0.3, 0.7, 0.1, 0.5];
        let first = (roc_auc(&labels, &scores), average_precision(&labels, &scores));
        for _ in 0..10 {
            assert_eq!(
                first,
                (roc_auc(&labels, &scores), average_precision(&labels, &scores))
            );
        }
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let y_true = array![[1.0f32, 0.0]];
        let y_pred = array![[0.5f32]];
        assert!(tagwise_auc_ap(&y_true, &y_pred).is_err());
    }
}
