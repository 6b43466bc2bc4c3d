//! Spherical k-means inverted lists.
//!
//! Centroids are seeded from evenly spaced entries (`i * n / k`) so training is
//! deterministic for a given corpus. Vectors are compared by dot product after
//! L2 normalization, which orders them the same as cosine similarity.

use crate::embedding::l2_normalize;

const TRAINING_ROUNDS: usize = 10;

/// Inverted lists over a vector corpus.
#[derive(Debug, Clone)]
pub struct ClusterIndex {
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<usize>>,
}

/// Number of lists for a corpus of `n` vectors.
pub fn cluster_count(n: usize, max_clusters: usize) -> usize {
    (n / 10).min(max_clusters).max(1)
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub(crate) fn normalized(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    l2_normalize(&mut out);
    out
}

fn nearest(centroids: &[Vec<f32>], unit: &[f32]) -> usize {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let s = dot(c, unit);
        if s > best_score {
            best = i;
            best_score = s;
        }
    }
    best
}

impl ClusterIndex {
    /// Train `k` lists over `vectors`.
    pub fn train(vectors: &[Vec<f32>], k: usize) -> Self {
        let n = vectors.len();
        let k = k.clamp(1, n.max(1));
        let units: Vec<Vec<f32>> = vectors.iter().map(|v| normalized(v)).collect();
        let dim = units.first().map(|v| v.len()).unwrap_or(0);

        let mut centroids: Vec<Vec<f32>> = (0..k)
            .map(|i| units.get(i * n / k).cloned().unwrap_or_else(|| vec![0.0; dim]))
            .collect();
        let mut assignment = vec![0usize; n];

        for round in 0..TRAINING_ROUNDS {
            let mut changed = round == 0;
            for (i, u) in units.iter().enumerate() {
                let c = nearest(&centroids, u);
                if assignment[i] != c {
                    assignment[i] = c;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = vec![vec![0.0f32; dim]; k];
            let mut counts = vec![0usize; k];
            for (u, &c) in units.iter().zip(assignment.iter()) {
                counts[c] += 1;
                for (s, x) in sums[c].iter_mut().zip(u.iter()) {
                    *s += x;
                }
            }
            for (c, sum) in sums.into_iter().enumerate() {
                // An empty list keeps its previous centroid.
                if counts[c] > 0 {
                    let mut centroid = sum;
                    l2_normalize(&mut centroid);
                    centroids[c] = centroid;
                }
            }
        }

        let mut lists = vec![Vec::new(); k];
        for (i, u) in units.iter().enumerate() {
            lists[nearest(&centroids, u)].push(i);
        }
        Self { centroids, lists }
    }

    /// File a new vector under its nearest centroid.
    pub fn assign(&mut self, position: usize, vector: &[f32]) {
        let c = nearest(&self.centroids, &normalized(vector));
        self.lists[c].push(position);
    }

    pub fn len(&self) -> usize {
        self.centroids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    /// Candidate positions for a query.
    ///
    /// Scans the `scan` closest lists, then keeps widening until at least
    /// `min_candidates` positions are gathered or every list is used.
    pub fn candidates(&self, query: &[f32], scan: usize, min_candidates: usize) -> Vec<usize> {
        let unit = normalized(query);
        let mut order: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, dot(c, &unit)))
            .collect();
        order.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut out = Vec::new();
        for (scanned, (cluster, _)) in order.into_iter().enumerate() {
            if scanned >= scan && out.len() >= min_candidates {
                break;
            }
            out.extend_from_slice(&self.lists[cluster]);
        }
        out
    }

    pub fn list_sizes(&self) -> Vec<usize> {
        self.lists.iter().map(|l| l.len()).collect()
    }
}
