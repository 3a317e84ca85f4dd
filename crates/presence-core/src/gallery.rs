//! Nearest-neighbor gallery of known students.
//!
//! Built offline from enrollment photos and loaded once at startup from two
//! JSON artifacts: the embedding index (`gallery.json`) and the class-code to
//! label table (`labels.json`). Immutable while serving.

use crate::types::Embedding;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("gallery has no embeddings")]
    Empty,
    #[error("gallery has {embeddings} embeddings but {labels} labels")]
    LengthMismatch { embeddings: usize, labels: usize },
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("class code {code} is outside the label table ({classes} classes)")]
    UnknownClass { code: usize, classes: usize },
    #[error("label {0:?} appears more than once in the label table")]
    DuplicateLabel(String),
    #[error("n_neighbors must be at least 1")]
    ZeroNeighbors,
}

/// On-disk layout of `gallery.json`.
#[derive(Debug, Deserialize)]
struct GalleryArtifact {
    n_neighbors: usize,
    embeddings: Vec<Vec<f32>>,
    labels: Vec<usize>,
}

/// One reference embedding and the class code of the student it belongs to.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub embedding: Embedding,
    pub class: usize,
}

/// A gallery entry returned by a neighbor query.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor<'a> {
    pub distance: f32,
    /// Position of the entry in the gallery.
    pub index: usize,
    pub label: &'a str,
}

/// How the label of a probe is chosen once its neighbors are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelStrategy {
    /// Label of the single closest entry.
    NearestNeighbor,
    /// k-NN majority vote; ties go to the lowest class code.
    MajorityVote { k: usize },
}

/// Outcome of identifying a probe: the gating distance is always the single
/// nearest entry's, the label follows the requested strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Identification<'a> {
    pub distance: f32,
    pub label: &'a str,
}

pub struct Gallery {
    entries: Vec<GalleryEntry>,
    classes: Vec<String>,
    dimension: usize,
    n_neighbors: usize,
}

impl Gallery {
    /// Load and validate both trainer artifacts.
    pub fn load(gallery_path: &Path, labels_path: &Path) -> Result<Self, GalleryError> {
        let artifact: GalleryArtifact = read_json(gallery_path)?;
        let classes: Vec<String> = read_json(labels_path)?;

        let gallery = Self::from_parts(
            artifact.embeddings,
            artifact.labels,
            classes,
            artifact.n_neighbors,
        )?;

        tracing::info!(
            gallery = %gallery_path.display(),
            labels = %labels_path.display(),
            entries = gallery.len(),
            known_students = gallery.classes.len(),
            dimension = gallery.dimension,
            "loaded gallery"
        );

        Ok(gallery)
    }

    /// Build a gallery from raw embeddings, their class codes, and the label table.
    pub fn from_parts(
        embeddings: Vec<Vec<f32>>,
        codes: Vec<usize>,
        classes: Vec<String>,
        n_neighbors: usize,
    ) -> Result<Self, GalleryError> {
        if embeddings.is_empty() {
            return Err(GalleryError::Empty);
        }
        if embeddings.len() != codes.len() {
            return Err(GalleryError::LengthMismatch {
                embeddings: embeddings.len(),
                labels: codes.len(),
            });
        }
        if n_neighbors == 0 {
            return Err(GalleryError::ZeroNeighbors);
        }

        let mut seen = HashSet::new();
        for label in &classes {
            if !seen.insert(label.as_str()) {
                return Err(GalleryError::DuplicateLabel(label.clone()));
            }
        }

        let dimension = embeddings[0].len();
        let mut entries = Vec::with_capacity(embeddings.len());
        for (values, class) in embeddings.into_iter().zip(codes) {
            if values.len() != dimension || dimension == 0 {
                return Err(GalleryError::DimensionMismatch {
                    expected: dimension,
                    got: values.len(),
                });
            }
            if class >= classes.len() {
                return Err(GalleryError::UnknownClass {
                    code: class,
                    classes: classes.len(),
                });
            }
            entries.push(GalleryEntry {
                embedding: Embedding::new(values),
                class,
            });
        }

        Ok(Self {
            entries,
            classes,
            dimension,
            n_neighbors,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false for a successfully constructed gallery.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Neighbor count the trainer configured for its classifier.
    pub fn n_neighbors(&self) -> usize {
        self.n_neighbors
    }

    /// Every valid identity label, in class-code order.
    pub fn known_students(&self) -> &[String] {
        &self.classes
    }

    /// The closest gallery entry to `probe`.
    pub fn nearest(&self, probe: &Embedding) -> Result<Neighbor<'_>, GalleryError> {
        let mut neighbors = self.kneighbors(probe, 1)?;
        // from_parts guarantees a non-empty gallery.
        Ok(neighbors.remove(0))
    }

    /// The `k` closest entries by ascending distance (fewer if the gallery is smaller).
    pub fn kneighbors(&self, probe: &Embedding, k: usize) -> Result<Vec<Neighbor<'_>>, GalleryError> {
        self.check_dimension(probe)?;

        let mut neighbors: Vec<Neighbor<'_>> = self
            .entries
            .iter()
            .enumerate()
            .map(|(index, entry)| Neighbor {
                distance: probe.euclidean_distance(&entry.embedding),
                index,
                label: &self.classes[entry.class],
            })
            .collect();

        // Stable sort keeps gallery order among equal distances.
        neighbors.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        neighbors.truncate(k.max(1));
        Ok(neighbors)
    }

    /// Majority vote over the `k` nearest entries.
    pub fn predict(&self, probe: &Embedding, k: usize) -> Result<&str, GalleryError> {
        let neighbors = self.kneighbors(probe, k)?;

        let mut votes = vec![0usize; self.classes.len()];
        for n in &neighbors {
            votes[self.entries[n.index].class] += 1;
        }

        // max_by_key keeps the last maximum, so scan in reverse to favor low codes.
        let winner = votes
            .iter()
            .enumerate()
            .rev()
            .max_by_key(|&(_, count)| *count)
            .map(|(class, _)| class)
            .unwrap_or(0);

        Ok(&self.classes[winner])
    }

    /// Gate distance from the nearest entry, label from `strategy`.
    pub fn identify(
        &self,
        probe: &Embedding,
        strategy: LabelStrategy,
    ) -> Result<Identification<'_>, GalleryError> {
        let nearest = self.nearest(probe)?;
        let label = match strategy {
            LabelStrategy::NearestNeighbor => nearest.label,
            LabelStrategy::MajorityVote { k } => self.predict(probe, k)?,
        };

        Ok(Identification {
            distance: nearest.distance,
            label,
        })
    }

    fn check_dimension(&self, probe: &Embedding) -> Result<(), GalleryError> {
        if probe.dimension() != self.dimension {
            return Err(GalleryError::DimensionMismatch {
                expected: self.dimension,
                got: probe.dimension(),
            });
        }
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, GalleryError> {
    let raw = std::fs::read_to_string(path).map_err(|source| GalleryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| GalleryError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// alice at (1,0), bob at (0,1); carol is known but not enrolled.
    fn make_gallery() -> Gallery {
        Gallery::from_parts(
            vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            vec![0, 1],
            labels(&["alice", "bob", "carol"]),
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_nearest_picks_closest() {
        let gallery = make_gallery();
        let probe = Embedding::new(vec![0.9, 0.1]);
        let n = gallery.nearest(&probe).unwrap();
        assert_eq!(n.label, "alice");
        assert_eq!(n.index, 0);
        assert!((n.distance - (0.02f32).sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_kneighbors_sorted_ascending() {
        let gallery = make_gallery();
        let probe = Embedding::new(vec![0.2, 0.9]);
        let ns = gallery.kneighbors(&probe, 5).unwrap();
        assert_eq!(ns.len(), 2);
        assert_eq!(ns[0].label, "bob");
        assert_eq!(ns[1].label, "alice");
        assert!(ns[0].distance <= ns[1].distance);
    }

    #[test]
    fn test_kneighbors_zero_k_returns_one() {
        let gallery = make_gallery();
        let probe = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(gallery.kneighbors(&probe, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_predict_majority() {
        let gallery = Gallery::from_parts(
            vec![vec![0.0, 0.0], vec![0.1, 0.0], vec![0.2, 0.0]],
            vec![1, 0, 0],
            labels(&["alice", "bob"]),
            3,
        )
        .unwrap();
        let probe = Embedding::new(vec![0.0, 0.0]);

        // The single nearest entry is bob, but alice owns 2 of the 3 nearest.
        assert_eq!(gallery.nearest(&probe).unwrap().label, "bob");
        assert_eq!(gallery.predict(&probe, 3).unwrap(), "alice");
    }

    #[test]
    fn test_predict_tie_goes_to_lowest_class() {
        let gallery = Gallery::from_parts(
            vec![vec![0.0, 0.0], vec![0.5, 0.0]],
            vec![1, 0],
            labels(&["alice", "bob"]),
            2,
        )
        .unwrap();
        let probe = Embedding::new(vec![0.0, 0.0]);
        assert_eq!(gallery.predict(&probe, 2).unwrap(), "alice");
    }

    #[test]
    fn test_identify_gates_on_nearest_distance() {
        let gallery = Gallery::from_parts(
            vec![vec![0.0, 0.0], vec![0.1, 0.0], vec![0.2, 0.0]],
            vec![1, 0, 0],
            labels(&["alice", "bob"]),
            3,
        )
        .unwrap();
        let probe = Embedding::new(vec![0.0, 0.0]);

        let nn = gallery.identify(&probe, LabelStrategy::NearestNeighbor).unwrap();
        let vote = gallery.identify(&probe, LabelStrategy::MajorityVote { k: 3 }).unwrap();
        assert_eq!(nn.label, "bob");
        assert_eq!(vote.label, "alice");
        assert_eq!(nn.distance, vote.distance);
        assert!(vote.distance.abs() < 1e-6);
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let gallery = make_gallery();
        let probe = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!(matches!(
            gallery.nearest(&probe),
            Err(GalleryError::DimensionMismatch { expected: 2, got: 3 })
        ));
    }

    #[test]
    fn test_known_students_includes_unenrolled() {
        let gallery = make_gallery();
        assert_eq!(gallery.known_students(), &labels(&["alice", "bob", "carol"])[..]);
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.dimension(), 2);
    }

    #[test]
    fn test_from_parts_rejects_empty() {
        let result = Gallery::from_parts(vec![], vec![], labels(&["alice"]), 1);
        assert!(matches!(result, Err(GalleryError::Empty)));
    }

    #[test]
    fn test_from_parts_rejects_length_mismatch() {
        let result = Gallery::from_parts(vec![vec![1.0]], vec![0, 0], labels(&["alice"]), 1);
        assert!(matches!(result, Err(GalleryError::LengthMismatch { embeddings: 1, labels: 2 })));
    }

    #[test]
    fn test_from_parts_rejects_ragged_embeddings() {
        let result = Gallery::from_parts(
            vec![vec![1.0, 0.0], vec![1.0]],
            vec![0, 0],
            labels(&["alice"]),
            1,
        );
        assert!(matches!(result, Err(GalleryError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_from_parts_rejects_unknown_class() {
        let result = Gallery::from_parts(vec![vec![1.0]], vec![3], labels(&["alice"]), 1);
        assert!(matches!(result, Err(GalleryError::UnknownClass { code: 3, classes: 1 })));
    }

    #[test]
    fn test_from_parts_rejects_duplicate_label() {
        let result = Gallery::from_parts(vec![vec![1.0]], vec![0], labels(&["alice", "alice"]), 1);
        assert!(matches!(result, Err(GalleryError::DuplicateLabel(l)) if l == "alice"));
    }

    #[test]
    fn test_from_parts_rejects_zero_neighbors() {
        let result = Gallery::from_parts(vec![vec![1.0]], vec![0], labels(&["alice"]), 0);
        assert!(matches!(result, Err(GalleryError::ZeroNeighbors)));
    }

    #[test]
    fn test_load_from_artifacts() {
        let dir = std::env::temp_dir().join(format!("presence-gallery-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let gallery_path = dir.join("gallery.json");
        let labels_path = dir.join("labels.json");
        std::fs::write(
            &gallery_path,
            r#"{"n_neighbors": 2, "embeddings": [[1.0, 0.0], [0.0, 1.0]], "labels": [1, 0]}"#,
        )
        .unwrap();
        std::fs::write(&labels_path, r#"["alice", "bob"]"#).unwrap();

        let gallery = Gallery::load(&gallery_path, &labels_path).unwrap();
        assert_eq!(gallery.n_neighbors(), 2);
        let n = gallery.nearest(&Embedding::new(vec![1.0, 0.0])).unwrap();
        assert_eq!(n.label, "bob");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let missing = Path::new("/nonexistent/presence/gallery.json");
        let result = Gallery::load(missing, missing);
        assert!(matches!(result, Err(GalleryError::Io { .. })));
    }
}
