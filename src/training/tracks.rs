//! Track-level aggregation of clip/segment predictions
//!
//! Full-track evaluation scores every fixed-size segment of a track
//! independently; this accumulator groups those per-segment prediction
//! vectors by track identifier and averages them into one vector per track.
//! The mean is order-invariant, so segment arrival order never matters.

use std::collections::HashMap;

/// Running per-track mean of segment prediction vectors
#[derive(Debug, Default)]
pub struct TrackAggregator {
    // insertion order preserved so results line up with the evaluation index
    order: Vec<String>,
    sums: HashMap<String, Vec<f64>>,
    counts: HashMap<String, usize>,
}

impl TrackAggregator {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one segment's prediction vector for a track
    pub fn add(&mut self, track_id: &str, prediction: &[f32]) {
        let sum = self.sums.entry(track_id.to_string()).or_insert_with(|| {
            self.order.push(track_id.to_string());
            vec![0.0; prediction.len()]
        });
        debug_assert_eq!(sum.len(), prediction.len());
        for (acc, &p) in sum.iter_mut().zip(prediction) {
            *acc += f64::from(p);
        }
        *self.counts.entry(track_id.to_string()).or_insert(0) += 1;
    }

    /// Number of segments recorded for a track
    pub fn segment_count(&self, track_id: &str) -> usize {
        self.counts.get(track_id).copied().unwrap_or(0)
    }

    /// Mean prediction vector for one track, if any segments were recorded
    pub fn mean_for(&self, track_id: &str) -> Option<Vec<f32>> {
        let sum = self.sums.get(track_id)?;
        let count = *self.counts.get(track_id)?;
        if count == 0 {
            return None;
        }
        Some(sum.iter().map(|&s| (s / count as f64) as f32).collect())
    }

    /// All track means in first-seen order
    pub fn means(&self) -> Vec<(String, Vec<f32>)> {
        self.order
            .iter()
            .filter_map(|id| self.mean_for(id).map(|m| (id.clone(), m)))
            .collect()
    }

    /// Number of distinct tracks seen
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no segments were recorded at all
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_mean_over_segments() {
        let mut agg = TrackAggregator::new();
        agg.add("t1", &[0.2, 0.8]);
        agg.add("t1", &[0.4, 0.6]);
        agg.add("t2", &[1.0, 0.0]);

        let mean = agg.mean_for("t1").unwrap();
        assert_abs_diff_eq!(mean[0], 0.3, epsilon = 1e-6);
        assert_abs_diff_eq!(mean[1], 0.7, epsilon = 1e-6);
        assert_eq!(agg.segment_count("t1"), 2);
        assert_eq!(agg.segment_count("t2"), 1);
    }

    #[test]
    fn test_order_invariance() {
        let segments = [[0.1f32, 0.9], [0.5, 0.5], [0.9, 0.1], [0.3, 0.7]];

        let mut forward = TrackAggregator::new();
        for seg in &segments {
            forward.add("t", seg);
        }
        let mut reversed = TrackAggregator::new();
        for seg in segments.iter().rev() {
            reversed.add("t", seg);
        }

        let a = forward.mean_for("t").unwrap();
        let b = reversed.mean_for("t").unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_missing_track_reports_none() {
        let agg = TrackAggregator::new();
        assert!(agg.mean_for("absent").is_none());
        assert_eq!(agg.segment_count("absent"), 0);
        assert!(agg.is_empty());
    }

    #[test]
    fn test_means_preserve_first_seen_order() {
        let mut agg = TrackAggregator::new();
        agg.add("b", &[1.0]);
        agg.add("a", &[2.0]);
        agg.add("b", &[3.0]);
        let means = agg.means();
        assert_eq!(means[0].0, "b");
        assert_eq!(means[1].0, "a");
        assert_abs_diff_eq!(means[0].1[0], 2.0, epsilon = 1e-6);
    }
}
