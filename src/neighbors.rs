//! k-nearest-neighbor index over Gaussian centers.
//!
//! The density field of a Gaussian mixture is dominated by the few
//! Gaussians closest to the query point, so every field evaluation is
//! restricted to a fixed number of nearest neighbors. The index is built
//! once per extraction pass over the current centers and is immutable;
//! after pruning or re-binding Gaussians the caller rebuilds it.

use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::Vector3;
use rand::seq::index::sample;
use rand::Rng;
use rayon::prelude::*;
use thiserror::Error;

/// Default neighbor count used by density and SDF evaluation.
pub const DEFAULT_KNN: usize = 16;

#[derive(Debug, Error)]
pub enum NeighborError {
    #[error("cannot build a neighbor index over an empty point set")]
    EmptyPointSet,

    #[error("neighbor count must be at least 1")]
    ZeroNeighbors,
}

/// Precomputed k-nearest-neighbor lists over a fixed set of points.
///
/// Each point's own index occupies slot 0 of its list; the remaining
/// slots are sorted by ascending distance, ties broken by index so the
/// lists are deterministic regardless of tree traversal order.
pub struct NeighborIndex {
    tree: KdTree<f32, 3>,
    lists: Vec<u32>,
    dists: Vec<f32>,
    k: usize,
    len: usize,
}

impl NeighborIndex {
    /// Build the index and precompute a `k`-neighbor list for every point.
    ///
    /// `k` is clamped to the number of points.
    pub fn build(points: &[Vector3<f32>], k: usize) -> Result<Self, NeighborError> {
        if points.is_empty() {
            return Err(NeighborError::EmptyPointSet);
        }
        if k == 0 {
            return Err(NeighborError::ZeroNeighbors);
        }
        let k = k.min(points.len());

        let mut tree: KdTree<f32, 3> = KdTree::new();
        for (i, p) in points.iter().enumerate() {
            tree.add(&[p.x, p.y, p.z], i as u64);
        }

        let per_point: Vec<Vec<(f32, u32)>> = points
            .par_iter()
            .enumerate()
            .map(|(i, p)| {
                let mut list = nearest_sorted(&tree, p, k);
                // The point itself is always its own nearest neighbor, but
                // coincident centers can shuffle it; pin it to slot 0.
                if let Some(pos) = list.iter().position(|&(_, j)| j == i as u32) {
                    list.remove(pos);
                } else {
                    list.pop();
                }
                list.insert(0, (0.0, i as u32));
                list
            })
            .collect();

        let mut lists = Vec::with_capacity(points.len() * k);
        let mut dists = Vec::with_capacity(points.len() * k);
        for list in per_point {
            for (d, j) in list {
                lists.push(j);
                dists.push(d.sqrt());
            }
        }

        Ok(Self {
            tree,
            lists,
            dists,
            k,
            len: points.len(),
        })
    }

    /// Number of indexed points.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Neighbor count per list.
    pub fn k(&self) -> usize {
        self.k
    }

    /// The precomputed neighbor list of indexed point `i` (self first).
    pub fn neighbors(&self, i: usize) -> &[u32] {
        &self.lists[i * self.k..(i + 1) * self.k]
    }

    /// Euclidean distances matching [`neighbors`](Self::neighbors).
    pub fn distances(&self, i: usize) -> &[f32] {
        &self.dists[i * self.k..(i + 1) * self.k]
    }

    /// k-nearest indexed points to an arbitrary query position.
    pub fn query(&self, point: &Vector3<f32>, k: usize) -> Vec<u32> {
        nearest_sorted(&self.tree, point, k.min(self.len))
            .into_iter()
            .map(|(_, i)| i)
            .collect()
    }

    /// Index of the single nearest point to `point`.
    pub fn nearest(&self, point: &Vector3<f32>) -> u32 {
        self.tree
            .nearest_one::<SquaredEuclidean>(&[point.x, point.y, point.z])
            .item as u32
    }

    /// Batch query: k-nearest indexed points for each query position.
    pub fn query_batch(&self, points: &[Vector3<f32>], k: usize) -> Vec<Vec<u32>> {
        let k = k.min(self.len);
        points
            .par_iter()
            .map(|p| {
                nearest_sorted(&self.tree, p, k)
                    .into_iter()
                    .map(|(_, i)| i)
                    .collect()
            })
            .collect()
    }

    /// Indices of `n` distinct random indexed points.
    ///
    /// Used by regularization callers that evaluate the field on a random
    /// subset of Gaussians per step.
    pub fn random_subset<R: Rng>(&self, n: usize, rng: &mut R) -> Vec<u32> {
        sample(rng, self.len, n.min(self.len))
            .into_iter()
            .map(|i| i as u32)
            .collect()
    }
}

fn nearest_sorted(tree: &KdTree<f32, 3>, point: &Vector3<f32>, k: usize) -> Vec<(f32, u32)> {
    let mut hits: Vec<(f32, u32)> = tree
        .nearest_n::<SquaredEuclidean>(&[point.x, point.y, point.z], k)
        .into_iter()
        .map(|n| (n.distance, n.item as u32))
        .collect();
    hits.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    hits
}
