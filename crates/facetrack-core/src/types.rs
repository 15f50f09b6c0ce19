use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence for this face [0, 1].
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (fixed dimension per deployment, e.g. 512).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default)]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Return a unit-length copy of this embedding.
    ///
    /// `None` for vectors that cannot identify a face: empty, containing
    /// NaN/inf, or zero-norm.
    pub fn normalized(&self) -> Option<Embedding> {
        if self.values.is_empty() || self.values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let norm = self.norm();
        if norm <= f32::EPSILON {
            return None;
        }
        Some(Embedding {
            values: self.values.iter().map(|x| x / norm).collect(),
            model_version: self.model_version.clone(),
        })
    }

    /// Dot product. Equals cosine similarity when both sides are unit-normalized.
    pub fn dot(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}

/// One enrolled embedding inside a [`Gallery`] snapshot.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub employee_id: String,
    /// 1-based index of the embedding within its owner's collection.
    pub index: u32,
    /// Unit-normalized vector.
    pub embedding: Embedding,
}

/// Immutable snapshot of every enrolled embedding.
///
/// Entries are ordered by `(employee_id, index)`. The store swaps whole
/// snapshots on mutation, so a matcher holding an `Arc<Gallery>` never sees
/// a half-applied enroll or delete.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn new(mut entries: Vec<GalleryEntry>) -> Self {
        entries.sort_by(|a, b| {
            a.employee_id
                .cmp(&b.employee_id)
                .then(a.index.cmp(&b.index))
        });
        Self { entries }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct employees with at least one embedding.
    pub fn employee_count(&self) -> usize {
        let mut count = 0;
        let mut last: Option<&str> = None;
        for entry in &self.entries {
            if last != Some(entry.employee_id.as_str()) {
                count += 1;
                last = Some(entry.employee_id.as_str());
            }
        }
        count
    }

    /// Dimension shared by the enrolled embeddings, `None` when empty.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.dimension())
    }
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best candidate [-1, 1].
    pub similarity: f32,
    /// Owner of the best candidate, set only when `matched`.
    pub employee_id: Option<String>,
    /// Index of the best candidate embedding, set only when `matched`.
    pub embedding_index: Option<u32>,
}

impl MatchResult {
    pub fn no_match(similarity: f32) -> Self {
        Self {
            matched: false,
            similarity,
            employee_id: None,
            embedding_index: None,
        }
    }
}

/// Strategy for comparing a probe embedding against the enrolled gallery.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Brute-force cosine matcher.
///
/// Visits every gallery entry. A candidate is accepted when its similarity is
/// at least `threshold`. Exact ties between different employees resolve to
/// the lexicographically smaller employee id.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
        let Some(probe) = probe.normalized() else {
            return MatchResult::no_match(0.0);
        };

        let mut best_sim = f32::NEG_INFINITY;
        let mut best: Option<&GalleryEntry> = None;

        for entry in gallery.entries() {
            if entry.embedding.dimension() != probe.dimension() {
                continue;
            }
            let sim = probe.dot(&entry.embedding);
            let better = match best {
                None => true,
                Some(prev) => match sim.partial_cmp(&best_sim) {
                    Some(Ordering::Greater) => true,
                    Some(Ordering::Equal) => entry.employee_id < prev.employee_id,
                    _ => false,
                },
            };
            if better {
                best_sim = sim;
                best = Some(entry);
            }
        }

        match best {
            Some(entry) if best_sim >= threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                employee_id: Some(entry.employee_id.clone()),
                embedding_index: Some(entry.index),
            },
            Some(_) => MatchResult::no_match(best_sim),
            None => MatchResult::no_match(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, index: u32, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            employee_id: id.into(),
            index,
            embedding: Embedding::new(values).normalized().unwrap(),
        }
    }

    #[test]
    fn test_dot_of_normalized_is_cosine() {
        let a = Embedding::new(vec![2.0, 0.0, 0.0]).normalized().unwrap();
        let b = Embedding::new(vec![5.0, 0.0, 0.0]).normalized().unwrap();
        assert!((a.dot(&b) - 1.0).abs() < 1e-6);

        let c = Embedding::new(vec![1.0, 1.0, 0.0]).normalized().unwrap();
        assert!((a.dot(&c) - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_dot_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.dot(&b).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_unit_length() {
        let e = Embedding::new(vec![3.0, 4.0]).normalized().unwrap();
        assert!((e.norm() - 1.0).abs() < 1e-6);
        assert!((e.values[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_rejects_degenerate_vectors() {
        assert!(Embedding::new(vec![]).normalized().is_none());
        assert!(Embedding::new(vec![0.0, 0.0]).normalized().is_none());
        assert!(Embedding::new(vec![f32::NAN, 1.0]).normalized().is_none());
    }

    #[test]
    fn test_gallery_counts_employees() {
        let gallery = Gallery::new(vec![
            entry("b", 1, vec![1.0, 0.0]),
            entry("a", 2, vec![0.0, 1.0]),
            entry("a", 1, vec![1.0, 1.0]),
        ]);
        assert_eq!(gallery.len(), 3);
        assert_eq!(gallery.employee_count(), 2);
        assert_eq!(gallery.entries()[0].employee_id, "a");
        assert_eq!(gallery.entries()[0].index, 1);
        assert_eq!(gallery.dimension(), Some(2));
    }

    #[test]
    fn test_matcher_identical_probe_matches_owner() {
        let gallery = Gallery::new(vec![
            entry("emp-1", 1, vec![0.0, 1.0, 0.0]),
            entry("emp-2", 1, vec![0.0, 0.0, 1.0]),
            entry("emp-3", 4, vec![0.2, 0.3, 0.9]),
        ]);
        let probe = Embedding::new(vec![0.2, 0.3, 0.9]);

        let result = CosineMatcher.compare(&probe, &gallery, 1.0 - 1e-5);
        assert!(result.matched);
        assert_eq!(result.employee_id.as_deref(), Some("emp-3"));
        assert_eq!(result.embedding_index, Some(4));
        assert!((result.similarity - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_matcher_below_threshold_is_no_match() {
        let gallery = Gallery::new(vec![entry("emp-1", 1, vec![0.0, 1.0, 0.0])]);
        let probe = Embedding::new(vec![1.0, 0.1, 0.0]);

        let result = CosineMatcher.compare(&probe, &gallery, 0.4);
        assert!(!result.matched);
        assert!(result.employee_id.is_none());
        assert!(result.similarity < 0.4);
    }

    #[test]
    fn test_matcher_threshold_is_inclusive() {
        let gallery = Gallery::new(vec![entry("emp-1", 1, vec![1.0, 0.0])]);
        let probe = Embedding::new(vec![1.0, 0.0]);
        let result = CosineMatcher.compare(&probe, &gallery, 1.0);
        assert!(result.matched);
    }

    #[test]
    fn test_matcher_tie_prefers_smaller_employee_id() {
        // Inserted out of order; the snapshot sorts, and the tie rule decides.
        let gallery = Gallery::new(vec![
            entry("zed", 1, vec![1.0, 0.0]),
            entry("alice", 3, vec![1.0, 0.0]),
            entry("bob", 2, vec![1.0, 0.0]),
        ]);
        let probe = Embedding::new(vec![1.0, 0.0]);

        let result = CosineMatcher.compare(&probe, &gallery, 0.4);
        assert!(result.matched);
        assert_eq!(result.employee_id.as_deref(), Some("alice"));
    }

    #[test]
    fn test_matcher_skips_dimension_mismatch() {
        let gallery = Gallery::new(vec![
            entry("short", 1, vec![1.0, 0.0]),
            entry("long", 1, vec![0.0, 0.0, 1.0]),
        ]);
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);

        let result = CosineMatcher.compare(&probe, &gallery, 0.4);
        assert!(!result.matched);
        assert!(result.similarity.abs() < 1e-6);
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let result = CosineMatcher.compare(&probe, &Gallery::default(), 0.4);
        assert!(!result.matched);
        assert_eq!(result.similarity, 0.0);
    }

    #[test]
    fn test_matcher_invalid_probe() {
        let gallery = Gallery::new(vec![entry("emp-1", 1, vec![1.0, 0.0])]);
        let result = CosineMatcher.compare(&Embedding::new(vec![0.0, 0.0]), &gallery, 0.0);
        assert!(!result.matched);
    }
}
