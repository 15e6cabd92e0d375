//! Dataset collaborator contracts
//!
//! Dataset parsing and audio augmentation live outside this crate. Training
//! only depends on these traits: a finite, restartable sequence of two-view
//! batches, an ordered tag vocabulary, and (for track-level evaluation) an
//! index of full-length tracks.

use candle_core::Tensor;

use crate::error::{Error, Result};

/// One training batch: two augmented views, optional labels, clip ids.
///
/// Supervised dataloaders emit identical views; contrastive dataloaders may
/// leave `labels` empty.
#[derive(Debug, Clone)]
pub struct Batch {
    /// First augmented view, shape `(B, ...)`
    pub view_a: Tensor,
    /// Second augmented view, same shape as `view_a`
    pub view_b: Tensor,
    /// Multi-hot label matrix `(B, n_tags)`, absent in contrastive mode
    pub labels: Option<Tensor>,
    /// Clip identifier per row
    pub ids: Vec<String>,
}

/// One entry of the track-level evaluation index
#[derive(Debug, Clone)]
pub struct TrackEntry {
    /// Track identifier (grouping key for segment aggregation)
    pub track_id: String,
    /// Clip identifier within the track
    pub clip_id: String,
    /// Segment ordinal within the clip
    pub segment: usize,
    /// Source audio file path
    pub path: String,
    /// Ground-truth multi-hot label vector, length `n_tags`
    pub label: Vec<f32>,
}

/// Finite, restartable source of training batches
pub trait AudioDataset: Send {
    /// Number of batches one pass yields
    fn num_batches(&self) -> usize;

    /// Start a fresh pass over the data
    fn batches(&self) -> Result<Box<dyn Iterator<Item = Result<Batch>> + '_>>;

    /// Ordered tag vocabulary
    fn tags(&self) -> &[String];

    /// Track-level evaluation index, if this dataset has track structure
    fn track_index(&self) -> Option<&[TrackEntry]> {
        None
    }

    /// Load a track's full-length audio as fixed-size segments `(S, ...)`.
    ///
    /// `S` may legitimately be zero for corrupt or too-short files; callers
    /// must treat that as a degenerate case, not silently average over it.
    fn full_track_segments(&self, entry: &TrackEntry) -> Result<Tensor> {
        let _ = entry;
        Err(Error::config(
            "dataset has no track-level audio access".to_string(),
        ))
    }
}

/// Simple in-memory dataset, used by tests and small experiments
pub struct InMemoryDataset {
    batches: Vec<Batch>,
    tags: Vec<String>,
    tracks: Vec<TrackEntry>,
    segments: Vec<Tensor>,
}

impl InMemoryDataset {
    /// Build a dataset from pre-collated batches
    pub fn new(batches: Vec<Batch>, tags: Vec<String>) -> Self {
        Self {
            batches,
            tags,
            tracks: Vec::new(),
            segments: Vec::new(),
        }
    }

    /// Attach a track index; `segments[i]` holds the audio for `tracks[i]`
    pub fn with_tracks(mut self, tracks: Vec<TrackEntry>, segments: Vec<Tensor>) -> Self {
        debug_assert_eq!(tracks.len(), segments.len());
        self.tracks = tracks;
        self.segments = segments;
        self
    }
}

impl AudioDataset for InMemoryDataset {
    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn batches(&self) -> Result<Box<dyn Iterator<Item = Result<Batch>> + '_>> {
        Ok(Box::new(self.batches.iter().cloned().map(Ok)))
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    fn track_index(&self) -> Option<&[TrackEntry]> {
        if self.tracks.is_empty() {
            None
        } else {
            Some(&self.tracks)
        }
    }

    fn full_track_segments(&self, entry: &TrackEntry) -> Result<Tensor> {
        self.tracks
            .iter()
            .position(|t| t.track_id == entry.track_id && t.segment == entry.segment)
            .map(|i| self.segments[i].clone())
            .ok_or_else(|| Error::config(format!("unknown track '{}'", entry.track_id)))
    }
}
