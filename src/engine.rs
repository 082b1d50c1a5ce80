//! The pipeline entry points wired against one key-value store.
//!
//! An [`Engine`] is an explicit instance owned by the caller: it holds the
//! scaler, the quality model, the cluster service and one bandit. Several
//! engines can coexist (e.g. in tests) as long as they use different stores or
//! storage keys.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::nn::TrainingReport;
use crate::{
    value_scores, BanditContext, BanditDecision, BanditSnapshot, Cluster, ClusterQualityService,
    ContextualBandit, EngineConfig, FeatureExtractor, FeatureScaler, KeyValueStore, KvModelStore,
    ModelState, ProcessedCluster, Product, QualityModel, Result, ValueScoreMap,
};

/// Scaler + model + service + bandit over a shared store.
pub struct Engine {
    cfg: EngineConfig,
    store: Arc<dyn KeyValueStore>,
    service: ClusterQualityService,
    bandit: Mutex<ContextualBandit>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("cfg", &self.cfg)
            .field("service", &self.service)
            .field("bandit", &self.bandit.lock())
            .finish()
    }
}

impl Engine {
    /// Build every component and initialize the quality model.
    ///
    /// A stored bandit under `bandit_storage_key` is restored instead of
    /// starting fresh. When exactly one of the scaler and the model is already
    /// persisted, a warning is logged and startup continues: the missing half is
    /// rebuilt by the normal first-use path.
    pub fn open(cfg: EngineConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        cfg.validate()?;

        let has_scaler = store.get_item(&cfg.scaler.storage_key)?.is_some();
        let has_model = store.get_item(&cfg.model.storage_key)?.is_some();
        if has_scaler != has_model {
            warn!(
                scaler_key = %cfg.scaler.storage_key,
                model_key = %cfg.model.storage_key,
                has_scaler,
                has_model,
                "partial persistence: only one of scaler and model is stored"
            );
        }

        let scaler = Arc::new(FeatureScaler::new(cfg.scaler.clone(), store.clone()));
        let model = Arc::new(QualityModel::new(
            cfg.model.clone(),
            Arc::new(KvModelStore::new(store.clone())),
        ));
        let service =
            ClusterQualityService::new(FeatureExtractor::new(cfg.features), scaler, model);
        service.init()?;

        let bandit = match ContextualBandit::load_from(store.as_ref(), &cfg.bandit_storage_key)? {
            Some(b) => {
                info!(
                    key = %cfg.bandit_storage_key,
                    contexts = b.num_contexts(),
                    "restored bandit"
                );
                b
            }
            None => ContextualBandit::new(cfg.bandit)?,
        };

        Ok(Self {
            cfg,
            store,
            service,
            bandit: Mutex::new(bandit),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn service(&self) -> &ClusterQualityService {
        &self.service
    }

    pub fn model_state(&self) -> ModelState {
        self.service.model().state()
    }

    pub fn process_clusters(&self, clusters: &[Cluster]) -> Result<Vec<ProcessedCluster>> {
        self.service.process_clusters(clusters)
    }

    pub fn train_on_data(&self, clusters: &[Cluster], labels: &[f64]) -> Result<TrainingReport> {
        self.service.train_on_data(clusters, labels)
    }

    pub fn calculate_value_scores(&self, products: &[Product]) -> ValueScoreMap {
        value_scores(products)
    }

    /// Bandit selection. Calls are serialized on the engine's bandit.
    pub fn select(&self, ctx: &BanditContext) -> usize {
        self.bandit.lock().select(ctx)
    }

    pub fn select_explain(&self, ctx: &BanditContext) -> BanditDecision {
        self.bandit.lock().select_explain(ctx)
    }

    pub fn update(&self, ctx: &BanditContext, action: usize, reward: f64) -> Result<()> {
        self.bandit.lock().update(ctx, action, reward)
    }

    pub fn bandit_snapshot(&self) -> BanditSnapshot {
        self.bandit.lock().snapshot()
    }

    /// Persist the bandit under `bandit_storage_key`.
    pub fn save_bandit(&self) -> Result<()> {
        let bandit = self.bandit.lock();
        bandit.save_to(self.store.as_ref(), &self.cfg.bandit_storage_key)
    }
}
