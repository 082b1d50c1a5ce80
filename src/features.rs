//! Cluster inputs and the fixed-length feature vector fed to the quality model.

use serde::{Deserialize, Serialize};

use crate::{knn_density, DensityConfig, Error, Result};

/// Length of every [`FeatureVector`].
pub const FEATURE_DIM: usize = 3;

/// `[average_position, knn_density, normalized_size]`.
pub type FeatureVector = [f64; FEATURE_DIM];

/// A group of points plus the identifiers of the items behind them.
///
/// `points` and `member_ids` need not pair up 1:1; a cluster is usable as long
/// as both are non-empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub points: Vec<Vec<f64>>,
    pub member_ids: Vec<String>,
}

impl Cluster {
    pub fn new(points: Vec<Vec<f64>>, member_ids: Vec<String>) -> Self {
        Self { points, member_ids }
    }

    /// Both points and members are non-empty.
    pub fn is_valid(&self) -> bool {
        !self.points.is_empty() && !self.member_ids.is_empty()
    }
}

/// Configuration for [`FeatureExtractor`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Fixed divisor for the point count. Not derived from data.
    pub size_scale: f64,
    pub density: DensityConfig,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            size_scale: 100.0,
            density: DensityConfig::default(),
        }
    }
}

/// Builds a [`FeatureVector`] per cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureExtractor {
    cfg: FeatureConfig,
}

impl FeatureExtractor {
    pub fn new(cfg: FeatureConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.cfg
    }

    /// `[mean of first coordinates, knn density, len / size_scale]`.
    ///
    /// Errors on a cluster without points, on zero-dimensional points, on
    /// points of differing dimensionality, and on non-finite coordinates
    /// ([`Error::InvalidInput`]).
    pub fn extract(&self, cluster: &Cluster) -> Result<FeatureVector> {
        let points = &cluster.points;
        let Some(first) = points.first() else {
            return Err(Error::EmptyInput {
                what: "cluster points",
            });
        };
        let dim = first.len();
        if dim == 0 {
            return Err(Error::dims(1, 0));
        }

        let mut sum = 0.0;
        for p in points {
            if p.len() != dim {
                return Err(Error::dims(dim, p.len()));
            }
            if let Some(x) = p.iter().find(|x| !x.is_finite()) {
                return Err(Error::InvalidInput(format!("non-finite coordinate {x}")));
            }
            sum += p[0];
        }
        let average_position = sum / points.len() as f64;
        let density = knn_density(points, self.cfg.density.k)?;
        let normalized_size = points.len() as f64 / self.cfg.size_scale;

        let features = [average_position, density, normalized_size];
        if features.iter().any(|f| !f.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "features {features:?} overflowed"
            )));
        }
        Ok(features)
    }

    /// Extract every cluster, failing on the first bad one.
    pub fn extract_all<'a, I>(&self, clusters: I) -> Result<Vec<FeatureVector>>
    where
        I: IntoIterator<Item = &'a Cluster>,
    {
        clusters.into_iter().map(|c| self.extract(c)).collect()
    }
}
