//! Cluster scoring pipeline: extract -> scale -> predict.
//!
//! [`ClusterQualityService::process_clusters`] drops clusters without points or
//! members (not an error), scales the whole surviving batch in one pass so a
//! single scaler state covers it, and zips each model score back onto its
//! source cluster. Successful non-empty results are also handed to every
//! registered completion handler.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::nn::TrainingReport;
use crate::{
    Cluster, Error, FeatureExtractor, FeatureScaler, FeatureVector, QualityModel, Result,
};

/// A scored cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedCluster {
    /// `cluster_{i}`, `i` being the cluster's index in the caller's input.
    pub cluster_id: String,
    /// Model output in `[0, 1]`.
    pub quality_score: f64,
    /// Unscaled features the score was computed from.
    pub feature_vector: FeatureVector,
    pub members: Vec<String>,
}

/// Completion handler invoked with each non-empty scored batch.
pub type ProcessedHandler = Box<dyn Fn(&[ProcessedCluster]) + Send + Sync>;

/// Orchestrates [`FeatureExtractor`], [`FeatureScaler`] and [`QualityModel`].
pub struct ClusterQualityService {
    extractor: FeatureExtractor,
    scaler: Arc<FeatureScaler>,
    model: Arc<QualityModel>,
    handlers: RwLock<BTreeMap<String, ProcessedHandler>>,
}

impl fmt::Debug for ClusterQualityService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterQualityService")
            .field("extractor", &self.extractor)
            .field("scaler", &self.scaler)
            .field("model", &self.model)
            .field("handlers", &self.handlers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ClusterQualityService {
    pub fn new(
        extractor: FeatureExtractor,
        scaler: Arc<FeatureScaler>,
        model: Arc<QualityModel>,
    ) -> Self {
        Self {
            extractor,
            scaler,
            model,
            handlers: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn model(&self) -> &Arc<QualityModel> {
        &self.model
    }

    pub fn scaler(&self) -> &Arc<FeatureScaler> {
        &self.scaler
    }

    /// Initialize the underlying model (idempotent).
    pub fn init(&self) -> Result<()> {
        self.model.init()
    }

    /// Register a named completion handler, returning any handler it replaced.
    ///
    /// Handlers run in name order after each successful, non-empty batch.
    pub fn register_handler<F>(
        &self,
        name: impl Into<String>,
        handler: F,
    ) -> Option<ProcessedHandler>
    where
        F: Fn(&[ProcessedCluster]) + Send + Sync + 'static,
    {
        self.handlers.write().insert(name.into(), Box::new(handler))
    }

    /// Remove a handler. Returns whether one was registered under `name`.
    pub fn unregister_handler(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Score every valid cluster.
    ///
    /// An empty or all-invalid input is `Ok(vec![])`, which callers must keep
    /// distinct from `Err` (pipeline failure).
    pub fn process_clusters(&self, clusters: &[Cluster]) -> Result<Vec<ProcessedCluster>> {
        let valid: Vec<(usize, &Cluster)> = clusters
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_valid())
            .collect();
        if valid.len() < clusters.len() {
            debug!(
                dropped = clusters.len() - valid.len(),
                kept = valid.len(),
                "filtered invalid clusters"
            );
        }
        if valid.is_empty() {
            return Ok(Vec::new());
        }

        self.model.init()?;
        let raw = self.extractor.extract_all(valid.iter().map(|(_, c)| *c))?;
        let scaled = self.scaler.scale(&raw)?;
        let scores = self.model.predict_batch(&scaled)?;
        if scores.len() != valid.len() {
            return Err(Error::dims(valid.len(), scores.len()));
        }

        let out: Vec<ProcessedCluster> = valid
            .into_iter()
            .zip(raw)
            .zip(scores)
            .map(|(((i, c), feature_vector), quality_score)| ProcessedCluster {
                cluster_id: format!("cluster_{i}"),
                quality_score,
                feature_vector,
                members: c.member_ids.clone(),
            })
            .collect();

        for handler in self.handlers.read().values() {
            handler(&out);
        }
        Ok(out)
    }

    /// Train the model on labelled clusters.
    ///
    /// `labels[i]` belongs to `clusters[i]`; invalid clusters are dropped together
    /// with their labels. Fails with [`Error::EmptyInput`] when nothing remains.
    pub fn train_on_data(&self, clusters: &[Cluster], labels: &[f64]) -> Result<TrainingReport> {
        if clusters.len() != labels.len() {
            return Err(Error::dims(clusters.len(), labels.len()));
        }
        let (kept, ys): (Vec<&Cluster>, Vec<f64>) = clusters
            .iter()
            .zip(labels)
            .filter(|(c, _)| c.is_valid())
            .map(|(c, &y)| (c, y))
            .unzip();
        if kept.is_empty() {
            return Err(Error::EmptyInput {
                what: "training clusters",
            });
        }

        self.model.init()?;
        let raw = self.extractor.extract_all(kept)?;
        let scaled = self.scaler.scale(&raw)?;
        self.model.train(&scaled, &ys)
    }
}
