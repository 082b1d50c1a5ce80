//! Trainable cluster-quality model with an explicit lifecycle.
//!
//! ```text
//! Uninitialized -> Loading -> Ready
//!                          -> CreatingNew -> Ready
//!                          -> Failed
//! Ready <-> Training
//! ```
//!
//! - [`QualityModel::init`] loads the persisted snapshot; a snapshot without
//!   optimizer state is recompiled (architecture kept, fresh Adam attached).
//!   With nothing stored, a new `3 -> 64 relu -> 32 relu -> 1 sigmoid` network
//!   is built and persisted immediately.
//! - [`QualityModel::train`] is single-flight: an atomic busy flag rejects
//!   overlapping runs with [`Error::Busy`] and is released by a guard on every
//!   exit path.
//! - Inference reads a published `Arc<Mlp>`. Training fits a private copy and
//!   swaps it in when done, so a forward pass never sees weights mid-update.
//!   Predictions issued during training use the previous weights.

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::nn::{fit, Activation, Adam, AdamConfig, Dense, Mlp, TrainConfig, TrainingReport};
use crate::{Error, FeatureVector, ModelStore, Result, FEATURE_DIM};

/// Snapshot format written by this crate.
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// Loss name recorded in compiled snapshots.
pub const LOSS_BINARY_CROSSENTROPY: &str = "binary_crossentropy";

/// Configuration for [`QualityModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Fixed identifier under which the model is persisted.
    pub storage_key: String,
    /// Hidden layer widths (ReLU). The output is always one sigmoid unit.
    pub hidden: Vec<usize>,
    pub optimizer: AdamConfig,
    pub train: TrainConfig,
    /// Seed for weight init and per-epoch shuffling.
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            storage_key: "cluster_quality_model".to_string(),
            hidden: vec![64, 32],
            optimizer: AdamConfig::default(),
            train: TrainConfig::default(),
            seed: 0,
        }
    }
}

/// Lifecycle state of a [`QualityModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Uninitialized,
    Loading,
    CreatingNew,
    Ready,
    Training,
    Failed,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelState::Uninitialized => "uninitialized",
            ModelState::Loading => "loading",
            ModelState::CreatingNew => "creating_new",
            ModelState::Ready => "ready",
            ModelState::Training => "training",
            ModelState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Optimizer and loss attached to a persisted network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileState {
    pub loss: String,
    pub optimizer: Adam,
}

/// Persisted form of the model.
///
/// `compile` is optional: a snapshot without it still loads, and gets a fresh
/// optimizer attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub format: u32,
    pub layers: Vec<Dense>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<CompileState>,
}

/// Feed-forward quality scorer over [`FeatureVector`]s.
pub struct QualityModel {
    cfg: ModelConfig,
    store: Arc<dyn ModelStore>,
    state: Mutex<ModelState>,
    failure: Mutex<Option<String>>,
    init_lock: Mutex<()>,
    published: RwLock<Option<Arc<Mlp>>>,
    optimizer: Mutex<Adam>,
    busy: AtomicBool,
    rng: Mutex<StdRng>,
}

impl fmt::Debug for QualityModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QualityModel")
            .field("cfg", &self.cfg)
            .field("state", &self.state())
            .field("busy", &self.is_training())
            .finish()
    }
}

// Releases the busy flag and leaves the Training state on every exit path.
struct TrainingGuard<'a> {
    model: &'a QualityModel,
}

impl Drop for TrainingGuard<'_> {
    fn drop(&mut self) {
        {
            let mut st = self.model.state.lock();
            if *st == ModelState::Training {
                *st = ModelState::Ready;
            }
        }
        self.model.busy.store(false, Ordering::Release);
    }
}

impl QualityModel {
    /// Create an uninitialized model. Call [`QualityModel::init`] before use.
    pub fn new(cfg: ModelConfig, store: Arc<dyn ModelStore>) -> Self {
        let seed = cfg.seed;
        let optimizer = Adam::new(cfg.optimizer);
        Self {
            cfg,
            store,
            state: Mutex::new(ModelState::Uninitialized),
            failure: Mutex::new(None),
            init_lock: Mutex::new(()),
            published: RwLock::new(None),
            optimizer: Mutex::new(optimizer),
            busy: AtomicBool::new(false),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    pub fn state(&self) -> ModelState {
        *self.state.lock()
    }

    /// Whether a training run holds the busy flag.
    pub fn is_training(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn set_state(&self, next: ModelState) {
        let mut st = self.state.lock();
        debug!(from = %*st, to = %next, "quality model state");
        *st = next;
    }

    fn fail(&self, reason: String) {
        warn!(%reason, "quality model initialization failed");
        *self.failure.lock() = Some(reason);
        self.set_state(ModelState::Failed);
    }

    /// Load or create the model. Idempotent once `Ready`.
    ///
    /// Store errors propagate unchanged and leave the model `Failed`; an
    /// unusable snapshot is an [`Error::Initialization`]. There is no retry:
    /// later calls on a failed model return `Initialization` again.
    pub fn init(&self) -> Result<()> {
        let _init = self.init_lock.lock();
        match self.state() {
            ModelState::Ready | ModelState::Training => return Ok(()),
            ModelState::Failed => {
                let reason = self
                    .failure
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(Error::Initialization { reason });
            }
            _ => {}
        }

        self.set_state(ModelState::Loading);
        let key = self.cfg.storage_key.as_str();
        let loaded = match self.store.load(key) {
            Ok(s) => s,
            Err(e) => {
                self.fail(e.to_string());
                return Err(e);
            }
        };

        let (net, optimizer) = match loaded {
            Some(snap) => match self.restore(snap) {
                Ok(pair) => pair,
                Err(e) => {
                    let reason = e.to_string();
                    self.fail(reason.clone());
                    return Err(Error::Initialization { reason });
                }
            },
            None => {
                self.set_state(ModelState::CreatingNew);
                let net = match self.build_fresh() {
                    Ok(n) => n,
                    Err(e) => {
                        let reason = e.to_string();
                        self.fail(reason.clone());
                        return Err(Error::Initialization { reason });
                    }
                };
                let optimizer = Adam::new(self.cfg.optimizer);
                let snap = Self::to_snapshot(&net, &optimizer);
                if let Err(e) = self.store.save(key, &snap) {
                    self.fail(e.to_string());
                    return Err(e);
                }
                info!(
                    key,
                    params = net.param_count(),
                    "created and persisted new quality model"
                );
                (net, optimizer)
            }
        };

        *self.published.write() = Some(Arc::new(net));
        *self.optimizer.lock() = optimizer;
        self.set_state(ModelState::Ready);
        Ok(())
    }

    fn build_fresh(&self) -> Result<Mlp> {
        let mut layout: Vec<(usize, Activation)> = self
            .cfg
            .hidden
            .iter()
            .map(|&units| (units, Activation::Relu))
            .collect();
        layout.push((1, Activation::Sigmoid));
        let mut rng = self.rng.lock();
        Mlp::new(FEATURE_DIM, &layout, &mut rng)
    }

    fn restore(&self, snap: ModelSnapshot) -> Result<(Mlp, Adam)> {
        if snap.format != MODEL_FORMAT_VERSION {
            return Err(Error::InvalidConfig(format!(
                "unsupported model format {}",
                snap.format
            )));
        }
        let net = Mlp::from_layers(snap.layers)?;
        if net.input_dim() != FEATURE_DIM {
            return Err(Error::dims(FEATURE_DIM, net.input_dim()));
        }
        if net.output_dim() != 1
            || net.layers().last().map(|l| l.activation) != Some(Activation::Sigmoid)
        {
            return Err(Error::InvalidConfig(
                "persisted model must end in one sigmoid unit".to_string(),
            ));
        }
        let optimizer = match snap.compile {
            Some(c) => {
                debug!(
                    key = %self.cfg.storage_key,
                    step = c.optimizer.step,
                    "loaded compiled quality model"
                );
                c.optimizer
            }
            None => {
                info!(
                    key = %self.cfg.storage_key,
                    "persisted model has no optimizer state; recompiling"
                );
                Adam::new(self.cfg.optimizer)
            }
        };
        Ok((net, optimizer))
    }

    fn to_snapshot(net: &Mlp, optimizer: &Adam) -> ModelSnapshot {
        ModelSnapshot {
            format: MODEL_FORMAT_VERSION,
            layers: net.layers().to_vec(),
            compile: Some(CompileState {
                loss: LOSS_BINARY_CROSSENTROPY.to_string(),
                optimizer: optimizer.clone(),
            }),
        }
    }

    /// Current weights plus optimizer state, if initialized.
    pub fn snapshot(&self) -> Option<ModelSnapshot> {
        let net = self.published.read().clone()?;
        let optimizer = self.optimizer.lock();
        Some(Self::to_snapshot(&net, &optimizer))
    }

    fn network(&self) -> Result<Arc<Mlp>> {
        let state = self.state();
        if !matches!(state, ModelState::Ready | ModelState::Training) {
            return Err(Error::NotReady {
                state: state.to_string(),
            });
        }
        self.published.read().clone().ok_or_else(|| Error::NotReady {
            state: state.to_string(),
        })
    }

    /// Quality score in `[0, 1]` for one (already scaled) feature vector.
    pub fn predict(&self, features: &FeatureVector) -> Result<f64> {
        let net = self.network()?;
        let out = net.forward(features)?;
        Ok(out.first().copied().unwrap_or(0.0))
    }

    /// Scores for a batch, all computed against the same weights.
    pub fn predict_batch(&self, batch: &[FeatureVector]) -> Result<Vec<f64>> {
        let net = self.network()?;
        batch
            .iter()
            .map(|x| Ok(net.forward(x)?.first().copied().unwrap_or(0.0)))
            .collect()
    }

    /// Mean binary cross-entropy on a labelled batch.
    pub fn evaluate(&self, batch: &[FeatureVector], labels: &[f64]) -> Result<f64> {
        if batch.len() != labels.len() {
            return Err(Error::dims(batch.len(), labels.len()));
        }
        self.network()?.mean_loss(batch, labels)
    }

    /// Fit on scaled features and labels in `[0, 1]`, then persist.
    ///
    /// Persists after every completed run, early-stopped or not.
    pub fn train(&self, batch: &[FeatureVector], labels: &[f64]) -> Result<TrainingReport> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy);
        }
        let _guard = TrainingGuard { model: self };

        {
            let mut st = self.state.lock();
            if *st != ModelState::Ready {
                return Err(Error::NotReady {
                    state: st.to_string(),
                });
            }
            *st = ModelState::Training;
        }

        if batch.len() != labels.len() {
            return Err(Error::dims(batch.len(), labels.len()));
        }
        if let Some(bad) = labels.iter().find(|y| !(0.0..=1.0).contains(*y)) {
            return Err(Error::InvalidInput(format!(
                "label {bad} outside [0, 1]"
            )));
        }

        let current = self.network()?;
        let mut net = Mlp::clone(&current);
        let mut optimizer = self.optimizer.lock().clone();
        let report = {
            let mut rng = self.rng.lock();
            fit(&mut net, &mut optimizer, batch, labels, &self.cfg.train, &mut rng)?
        };

        let snap = Self::to_snapshot(&net, &optimizer);
        *self.published.write() = Some(Arc::new(net));
        *self.optimizer.lock() = optimizer;
        info!(
            epochs = report.epochs_run,
            early_stopped = report.early_stopped,
            loss = report.final_loss,
            val_loss = ?report.final_val_loss,
            "quality model training finished"
        );
        self.store.save(&self.cfg.storage_key, &snap)?;
        Ok(report)
    }
}
