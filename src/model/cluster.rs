use crate::{Error, Result, SparseMat, SparseVecView};
use const_default::ConstDefault;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Partitions the rows of a matrix into a fixed number of clusters.
pub trait Clusterer: Sync {
    /// Assign each row of `points` a cluster id in `0..k`. Must be deterministic given `seed`.
    fn cluster(&self, points: &SparseMat, k: usize, seed: u64) -> Vec<usize>;
}

/// Hyper-parameters of single-initialization k-means clustering.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HyperParam {
    pub max_iter: usize,
    /// Convergence tolerance, relative to the mean per-feature variance of the points.
    pub tol: f32,
}

impl ConstDefault for HyperParam {
    const DEFAULT: Self = Self {
        max_iter: 300,
        tol: 1e-4,
    };
}

impl Default for HyperParam {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl HyperParam {
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(Error::InvalidHyperParam(
                "cluster max_iter must be positive".to_owned(),
            ));
        }
        if self.tol < 0. {
            return Err(Error::InvalidHyperParam(format!(
                "cluster tol must be non-negative, but is {}",
                self.tol
            )));
        }
        Ok(())
    }
}

impl Clusterer for HyperParam {
    fn cluster(&self, points: &SparseMat, k: usize, seed: u64) -> Vec<usize> {
        assert!(points.is_csr());
        assert!(k > 0);
        let n_points = points.rows();
        if n_points <= k {
            return (0..n_points).collect();
        }

        let rows = points.outer_iterator().collect::<Vec<_>>();
        let squared_norms = rows
            .iter()
            .map(|v| v.data().iter().map(|x| x * x).sum::<f32>())
            .collect::<Vec<_>>();
        let tol = self.tol * mean_variance(&rows, points.cols());

        let mut rng = StdRng::seed_from_u64(seed);
        let mut centroids = kmeans_plus_plus(&rows, &squared_norms, points.cols(), k, &mut rng);
        let mut assignments = vec![usize::MAX; n_points];

        for _ in 0..self.max_iter {
            let new_assignments = assign(&rows, &squared_norms, &centroids);
            let unchanged = new_assignments == assignments;
            assignments = new_assignments;
            if unchanged {
                return assignments;
            }

            let new_centroids = update_centroids(&rows, &assignments, &centroids);
            let shift = (&new_centroids - &centroids).mapv(|x| x * x).sum();
            centroids = new_centroids;
            if shift <= tol {
                break;
            }
        }

        // Make the assignments consistent with the final centroids
        assign(&rows, &squared_norms, &centroids)
    }
}

fn mean_variance(rows: &[SparseVecView], n_features: usize) -> f32 {
    if rows.is_empty() || n_features == 0 {
        return 0.;
    }
    let mut sums = vec![0f64; n_features];
    let mut squared_sums = vec![0f64; n_features];
    for row in rows {
        for (j, &v) in row.iter() {
            sums[j] += f64::from(v);
            squared_sums[j] += f64::from(v) * f64::from(v);
        }
    }
    let n = rows.len() as f64;
    let total = sums
        .iter()
        .zip(squared_sums.iter())
        .map(|(s, ss)| ss / n - (s / n).powi(2))
        .sum::<f64>();
    (total / n_features as f64) as f32
}

#[inline]
fn squared_distance(
    point: &SparseVecView,
    point_squared_norm: f32,
    centroid: ArrayView1<f32>,
    centroid_squared_norm: f32,
) -> f32 {
    let dot = point.iter().map(|(j, &v)| v * centroid[j]).sum::<f32>();
    (point_squared_norm + centroid_squared_norm - 2. * dot).max(0.)
}

/// Pick k initial centroids, each with probability proportional to its squared distance from
/// the nearest centroid chosen so far.
fn kmeans_plus_plus(
    rows: &[SparseVecView],
    squared_norms: &[f32],
    n_features: usize,
    k: usize,
    rng: &mut StdRng,
) -> Array2<f32> {
    let mut centroids = Array2::<f32>::zeros((k, n_features));
    let set_centroid = |centroids: &mut Array2<f32>, c: usize, i: usize| {
        for (j, &v) in rows[i].iter() {
            centroids[[c, j]] = v;
        }
    };

    set_centroid(&mut centroids, 0, rng.gen_range(0..rows.len()));
    let mut min_distances = vec![f32::INFINITY; rows.len()];
    for c in 1..k {
        let prev = centroids.row(c - 1);
        let prev_norm = prev.dot(&prev);
        min_distances
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, d)| {
                *d = d.min(squared_distance(&rows[i], squared_norms[i], prev, prev_norm));
            });

        let total = min_distances.iter().sum::<f32>();
        let chosen = if total > 0. {
            let threshold = rng.gen::<f32>() * total;
            let mut cumsum = 0.;
            let mut chosen = rows.len() - 1;
            for (i, &d) in min_distances.iter().enumerate() {
                cumsum += d;
                if cumsum >= threshold && d > 0. {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            rng.gen_range(0..rows.len())
        };
        set_centroid(&mut centroids, c, chosen);
    }

    centroids
}

fn assign(rows: &[SparseVecView], squared_norms: &[f32], centroids: &Array2<f32>) -> Vec<usize> {
    let centroid_norms = centroids
        .axis_iter(Axis(0))
        .map(|c| c.dot(&c))
        .collect::<Vec<_>>();
    rows.par_iter()
        .zip(squared_norms.par_iter())
        .map(|(row, &norm)| {
            let mut best = (0, f32::INFINITY);
            for (c, centroid) in centroids.axis_iter(Axis(0)).enumerate() {
                let d = squared_distance(row, norm, centroid, centroid_norms[c]);
                if d < best.1 {
                    best = (c, d);
                }
            }
            best.0
        })
        .collect()
}

/// Move each centroid to the mean of its assigned points; empty clusters keep their centroid.
fn update_centroids(
    rows: &[SparseVecView],
    assignments: &[usize],
    centroids: &Array2<f32>,
) -> Array2<f32> {
    let mut sums = Array2::<f32>::zeros(centroids.raw_dim());
    let mut counts = Array1::<f32>::zeros(centroids.nrows());
    for (row, &c) in rows.iter().zip(assignments.iter()) {
        counts[c] += 1.;
        for (j, &v) in row.iter() {
            sums[[c, j]] += v;
        }
    }
    for (c, mut sum) in sums.axis_iter_mut(Axis(0)).enumerate() {
        if counts[c] > 0. {
            sum /= counts[c];
        } else {
            sum.assign(&centroids.row(c));
        }
    }
    sums
}
