//! `dealrank`: small online-learning primitives for personalization and ranking.
//!
//! Three independent scorers turn raw grouped observations into something a
//! product can sort or act on:
//!
//! - **Cluster quality** ([`ClusterQualityService`]): each [`Cluster`] of points
//!   becomes a 3-feature vector `[mean first coordinate, kNN density, size / 100]`,
//!   is normalized by a once-computed, persisted [`FeatureScaler`], and scored in
//!   `[0, 1]` by a small feed-forward [`QualityModel`] (3 -> 64 ReLU -> 32 ReLU ->
//!   1 sigmoid, binary cross-entropy, Adam).
//! - **Value scores** ([`value_scores`]): geometric mean of the cheapness and
//!   rating percentiles of each [`Product`], with midpoint tie handling.
//! - **Contextual bandit** ([`ContextualBandit`]): epsilon-greedy selection with
//!   per-context value tables, a decaying exploration rate and EMA updates.
//!   Scores from the other two are natural reward signals.
//!
//! **Goals:**
//! - **Explicit instances**: nothing global. Storage is injected through
//!   [`KeyValueStore`] / [`ModelStore`]; [`MemoryStore`] is the test fake.
//! - **Reproducible**: seeded RNGs everywhere, a scaler that is never silently
//!   recomputed, and snapshots that reload bit-identically.
//! - **Safe concurrent inference**: training fits a private copy of the network
//!   and swaps it in; predictions never observe half-updated weights.
//!
//! **Non-goals:**
//! - Not a tensor library. The network is a handful of dense layers.
//! - No multi-tenant training: one training run per model at a time
//!   ([`Error::Busy`] otherwise).
//!
//! [`Engine`] wires everything against one store:
//!
//! ```rust
//! use std::sync::Arc;
//! use dealrank::{BanditContext, Cluster, Engine, EngineConfig, MemoryStore, Product};
//!
//! let mut cfg = EngineConfig::default();
//! cfg.model.hidden = vec![8, 4];
//! let engine = Engine::open(cfg, Arc::new(MemoryStore::new())).unwrap();
//!
//! let scored = engine
//!     .process_clusters(&[Cluster::new(
//!         vec![vec![0.0, 0.0], vec![0.1, 0.0], vec![0.0, 0.1]],
//!         vec!["a".into(), "b".into(), "c".into()],
//!     )])
//!     .unwrap();
//! assert_eq!(scored.len(), 1);
//! assert!((0.0..=1.0).contains(&scored[0].quality_score));
//!
//! let values = engine.calculate_value_scores(&[
//!     Product::new("x", 10.0, 4.5),
//!     Product::new("y", 20.0, 4.0),
//! ]);
//! assert!(values["x"] > values["y"]);
//!
//! let ctx = BanditContext::new(vec![0.2], vec![1.0]);
//! let action = engine.select(&ctx);
//! engine.update(&ctx, action, scored[0].quality_score).unwrap();
//! ```
//!
//! Logging goes through `tracing`; the crate never installs a subscriber.

#![forbid(unsafe_code)]

mod error;
pub use error::*;

mod store;
pub use store::*;

mod density;
pub use density::*;

mod features;
pub use features::*;

mod scaler;
pub use scaler::*;

/// Dense layers, binary cross-entropy, Adam and the training loop.
pub mod nn;
pub use nn::{AdamConfig, TrainConfig, TrainingReport};

mod model;
pub use model::*;

mod service;
pub use service::*;

mod value;
pub use value::*;

mod bandit;
pub use bandit::*;

mod config;
pub use config::*;

mod engine;
pub use engine::*;
