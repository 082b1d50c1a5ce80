//! Persisted standardization of feature vectors.
//!
//! The per-dimension `(mean, variance)` pair is fixed once: loaded from the
//! [`KeyValueStore`] if present, otherwise computed from the first non-empty
//! batch (population moments) and written back immediately. After that it is
//! reused unconditionally, even if later batches drift, so repeated calls on
//! the same input are bit-identical.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{Error, FeatureVector, KeyValueStore, Result, FEATURE_DIM};

/// Configuration for [`FeatureScaler`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    /// Key under which the state is persisted.
    pub storage_key: String,
    /// Added to the variance before the square root.
    pub epsilon: f64,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            storage_key: "feature_scaler".to_string(),
            epsilon: 1e-8,
        }
    }
}

/// Per-dimension population mean and variance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub mean: Vec<f64>,
    pub variance: Vec<f64>,
}

impl ScalerState {
    /// Population moments of a non-empty batch.
    ///
    /// Non-finite moments are an [`Error::InvalidInput`]; such a state would be
    /// persisted and reused forever.
    pub fn from_batch(batch: &[FeatureVector]) -> Result<Self> {
        if batch.is_empty() {
            return Err(Error::EmptyInput {
                what: "scaler batch",
            });
        }
        let n = batch.len() as f64;
        let mut mean = vec![0.0; FEATURE_DIM];
        for row in batch {
            for (m, x) in mean.iter_mut().zip(row) {
                *m += x;
            }
        }
        for m in &mut mean {
            *m /= n;
        }
        let mut variance = vec![0.0; FEATURE_DIM];
        for row in batch {
            for ((v, m), x) in variance.iter_mut().zip(&mean).zip(row) {
                let d = x - m;
                *v += d * d;
            }
        }
        for v in &mut variance {
            *v /= n;
        }
        let state = Self { mean, variance };
        state.validate()?;
        Ok(state)
    }

    /// Both vectors have length [`FEATURE_DIM`], every entry is finite and
    /// variances are non-negative.
    pub fn validate(&self) -> Result<()> {
        if self.mean.len() != FEATURE_DIM {
            return Err(Error::dims(FEATURE_DIM, self.mean.len()));
        }
        if self.variance.len() != FEATURE_DIM {
            return Err(Error::dims(FEATURE_DIM, self.variance.len()));
        }
        let finite = self.mean.iter().chain(&self.variance).all(|x| x.is_finite());
        if !finite || self.variance.iter().any(|&v| v < 0.0) {
            return Err(Error::InvalidInput(format!(
                "scaler moments must be finite (mean {:?}, variance {:?})",
                self.mean, self.variance
            )));
        }
        Ok(())
    }

    /// `(x - mean) / sqrt(variance + eps)` per dimension.
    pub fn normalize(&self, x: &FeatureVector, eps: f64) -> FeatureVector {
        let mut out = [0.0; FEATURE_DIM];
        for i in 0..FEATURE_DIM {
            out[i] = (x[i] - self.mean[i]) / (self.variance[i] + eps).sqrt();
        }
        out
    }
}

/// Standardizes feature batches against a once-computed [`ScalerState`].
pub struct FeatureScaler {
    cfg: ScalerConfig,
    store: Arc<dyn KeyValueStore>,
    state: Mutex<Option<ScalerState>>,
}

impl std::fmt::Debug for FeatureScaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureScaler")
            .field("cfg", &self.cfg)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl FeatureScaler {
    pub fn new(cfg: ScalerConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            cfg,
            store,
            state: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ScalerConfig {
        &self.cfg
    }

    /// The cached state, if it has been loaded or computed.
    pub fn state(&self) -> Option<ScalerState> {
        self.state.lock().clone()
    }

    /// Load a persisted state into the cache without computing one.
    ///
    /// Returns whether a state is now available. A malformed blob is an error,
    /// never a silent recompute.
    pub fn load(&self) -> Result<bool> {
        let mut guard = self.state.lock();
        if guard.is_some() {
            return Ok(true);
        }
        match self.read_persisted()? {
            Some(s) => {
                *guard = Some(s);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Normalize a batch, fixing the state from this batch if none exists yet.
    ///
    /// An empty batch returns an empty result and leaves the state untouched.
    pub fn scale(&self, batch: &[FeatureVector]) -> Result<Vec<FeatureVector>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut guard = self.state.lock();
        if guard.is_none() {
            let state = match self.read_persisted()? {
                Some(s) => s,
                None => {
                    let s = ScalerState::from_batch(batch)?;
                    let raw = serde_json::to_string(&s)?;
                    // Cache only after the durable write succeeded.
                    self.store.set_item(&self.cfg.storage_key, &raw)?;
                    info!(
                        key = %self.cfg.storage_key,
                        rows = batch.len(),
                        mean = ?s.mean,
                        variance = ?s.variance,
                        "computed and persisted feature scaler"
                    );
                    s
                }
            };
            *guard = Some(state);
        }
        let Some(state) = guard.as_ref() else {
            return Err(Error::EmptyInput {
                what: "scaler state",
            });
        };
        let eps = self.cfg.epsilon;
        Ok(batch.iter().map(|x| state.normalize(x, eps)).collect())
    }

    fn read_persisted(&self) -> Result<Option<ScalerState>> {
        let Some(raw) = self.store.get_item(&self.cfg.storage_key)? else {
            return Ok(None);
        };
        let s: ScalerState = serde_json::from_str(&raw)?;
        s.validate()?;
        debug!(key = %self.cfg.storage_key, "loaded persisted feature scaler");
        Ok(Some(s))
    }
}
