//! k-nearest-neighbor density.
//!
//! For each point, the `k` closest other points are found by squared Euclidean
//! distance and their mean distance taken; the per-point means are averaged into
//! `avg_distance`, and the density is `1 / (avg_distance + 1e-10)`.
//!
//! Tightly packed points give large values. A point is never its own neighbor,
//! and the neighbor count is capped at `points.len() - 1`, so a single-point set
//! has `avg_distance = 0` and a large but finite density.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Guard added to the average distance before inverting.
pub const DENSITY_EPS: f64 = 1e-10;

/// Configuration for [`knn_density`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityConfig {
    /// Neighbors per point.
    pub k: usize,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self { k: 3 }
    }
}

/// Squared Euclidean distance. Unequal lengths are a [`Error::DimensionMismatch`].
pub fn squared_distance(a: &[f64], b: &[f64]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(Error::dims(a.len(), b.len()));
    }
    Ok(a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum())
}

/// KNN density of a point set.
///
/// Returns `0.0` for an empty set. All points must share one non-zero
/// dimensionality.
pub fn knn_density<P: AsRef<[f64]>>(points: &[P], k: usize) -> Result<f64> {
    let n = points.len();
    let Some(first) = points.first() else {
        return Ok(0.0);
    };
    let dim = first.as_ref().len();
    if dim == 0 {
        return Err(Error::dims(1, 0));
    }
    if let Some(p) = points.iter().find(|p| p.as_ref().len() != dim) {
        return Err(Error::dims(dim, p.as_ref().len()));
    }
    let neighbors = k.min(n - 1);

    let mut total = 0.0;
    let mut dists: Vec<f64> = Vec::with_capacity(n);
    for (i, p) in points.iter().enumerate() {
        dists.clear();
        for (j, q) in points.iter().enumerate() {
            if i != j {
                dists.push(squared_distance(p.as_ref(), q.as_ref())?);
            }
        }
        if neighbors == 0 {
            continue;
        }
        dists.select_nth_unstable_by(neighbors - 1, |a, b| a.total_cmp(b));
        let mean = dists[..neighbors].iter().sum::<f64>() / neighbors as f64;
        total += mean;
    }
    let avg_distance = total / n as f64;
    Ok(1.0 / (avg_distance + DENSITY_EPS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_point_is_finite_and_positive() {
        let d = knn_density(&[vec![1.0, 2.0]], 3).unwrap();
        assert!(d.is_finite() && d > 0.0, "d={d}");
    }

    #[test]
    fn tight_cluster_is_denser_than_spread_cluster() {
        let tight = vec![
            vec![0.0, 0.0],
            vec![0.1, 0.0],
            vec![0.0, 0.1],
            vec![0.1, 0.1],
            vec![0.05, 0.05],
        ];
        let spread: Vec<Vec<f64>> = tight
            .iter()
            .map(|p| p.iter().map(|x| x * 100.0).collect())
            .collect();
        let dt = knn_density(&tight, 3).unwrap();
        let ds = knn_density(&spread, 3).unwrap();
        assert!(dt > ds, "tight={dt} spread={ds}");
    }

    #[test]
    fn neighbor_count_is_capped_for_small_sets() {
        // Two points, k=3: one neighbor each at squared distance 4.
        let d = knn_density(&[vec![0.0], vec![2.0]], 3).unwrap();
        assert!((d - 1.0 / (4.0 + DENSITY_EPS)).abs() < 1e-12);
    }

    #[test]
    fn uses_only_the_k_nearest() {
        // Point 0 has neighbors at squared distances 1, 4, 100; with k=1 only 1 counts.
        let pts = [vec![0.0], vec![1.0], vec![-2.0], vec![10.0]];
        let k1 = knn_density(&pts, 1).unwrap();
        let k3 = knn_density(&pts, 3).unwrap();
        assert!(k1 > k3);
    }

    #[test]
    fn empty_set_has_zero_density() {
        let none: Vec<Vec<f64>> = Vec::new();
        assert_eq!(knn_density(&none, 3).unwrap(), 0.0);
    }

    #[test]
    fn mixed_dimensionality_is_an_error() {
        let err = knn_density(&[vec![0.0, 1.0], vec![0.0]], 3).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn zero_dimensional_points_are_an_error() {
        let pts: Vec<Vec<f64>> = vec![vec![], vec![]];
        assert!(matches!(
            knn_density(&pts, 3),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    proptest! {
        #[test]
        fn density_is_positive_and_finite(
            pts in proptest::collection::vec(
                proptest::collection::vec(-1.0e3f64..1.0e3, 3),
                1..30,
            ),
            k in 1usize..6,
        ) {
            let d = knn_density(&pts, k).unwrap();
            prop_assert!(d.is_finite());
            prop_assert!(d > 0.0);
        }

        #[test]
        fn density_is_translation_invariant(
            pts in proptest::collection::vec(
                proptest::collection::vec(-10.0f64..10.0, 2),
                2..15,
            ),
            shift in -5.0f64..5.0,
        ) {
            let moved: Vec<Vec<f64>> = pts
                .iter()
                .map(|p| p.iter().map(|x| x + shift).collect())
                .collect();
            let a = knn_density(&pts, 3).unwrap();
            let b = knn_density(&moved, 3).unwrap();
            prop_assert!((a - b).abs() <= 1e-6 * a.abs().max(1.0));
        }
    }
}
