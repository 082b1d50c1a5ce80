//! Aggregate engine configuration.
//!
//! Every section falls back to its defaults when omitted, so `{}` is a valid
//! configuration document.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{BanditConfig, Error, FeatureConfig, ModelConfig, Result, ScalerConfig};

/// Configuration for [`crate::Engine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub features: FeatureConfig,
    pub scaler: ScalerConfig,
    pub model: ModelConfig,
    pub bandit: BanditConfig,
    /// Key for [`crate::Engine::save_bandit`]; a bandit stored here is restored on open.
    pub bandit_storage_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            features: FeatureConfig::default(),
            scaler: ScalerConfig::default(),
            model: ModelConfig::default(),
            bandit: BanditConfig::default(),
            bandit_storage_key: "contextual_bandit".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and parse a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        self.bandit.validate()?;
        self.model.train.validate()?;
        if self.features.density.k == 0 {
            return Err(Error::InvalidConfig(
                "features.density.k must be >= 1".to_string(),
            ));
        }
        if !(self.features.size_scale.is_finite() && self.features.size_scale > 0.0) {
            return Err(Error::InvalidConfig(
                "features.size_scale must be positive".to_string(),
            ));
        }
        if !(self.scaler.epsilon.is_finite() && self.scaler.epsilon >= 0.0) {
            return Err(Error::InvalidConfig(
                "scaler.epsilon must be >= 0".to_string(),
            ));
        }
        if self.model.hidden.iter().any(|&w| w == 0) {
            return Err(Error::InvalidConfig(
                "model.hidden widths must be >= 1".to_string(),
            ));
        }
        let keys = [
            &self.scaler.storage_key,
            &self.model.storage_key,
            &self.bandit_storage_key,
        ];
        if keys.iter().any(|k| k.is_empty()) {
            return Err(Error::InvalidConfig(
                "storage keys must be non-empty".to_string(),
            ));
        }
        if keys[0] == keys[1] || keys[0] == keys[2] || keys[1] == keys[2] {
            return Err(Error::InvalidConfig(
                "storage keys must be distinct".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_the_default() {
        assert_eq!(EngineConfig::from_json_str("{}").unwrap(), EngineConfig::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = EngineConfig::from_json_str(
            r#"{"bandit": {"num_actions": 7}, "model": {"train": {"epochs": 5}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.bandit.num_actions, 7);
        assert_eq!(cfg.bandit.epsilon, 0.1);
        assert_eq!(cfg.model.train.epochs, 5);
        assert_eq!(cfg.model.train.batch_size, 32);
        assert_eq!(cfg.model.hidden, vec![64, 32]);
        assert_eq!(cfg.scaler.storage_key, "feature_scaler");
    }

    #[test]
    fn invalid_sections_are_rejected() {
        for doc in [
            r#"{"bandit": {"num_actions": 0}}"#,
            r#"{"bandit": {"epsilon": 2.0}}"#,
            r#"{"model": {"hidden": [0]}}"#,
            r#"{"features": {"density": {"k": 0}}}"#,
            r#"{"bandit_storage_key": "feature_scaler"}"#,
        ] {
            assert!(
                matches!(EngineConfig::from_json_str(doc), Err(Error::InvalidConfig(_))),
                "{doc}"
            );
        }
        assert!(matches!(
            EngineConfig::from_json_str("not json"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn reads_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"bandit": {"seed": 9}}"#).unwrap();
        assert_eq!(EngineConfig::from_path(&path).unwrap().bandit.seed, 9);
        assert!(matches!(
            EngineConfig::from_path(dir.path().join("missing.json")),
            Err(Error::Io(_))
        ));
    }
}
