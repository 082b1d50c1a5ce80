//! Epsilon-greedy contextual bandit over a fixed set of actions.
//!
//! Each distinct [`ContextKey`] gets its own row of action values. Contexts are
//! discretized by rounding every component to 3 decimals, so raw contexts that
//! round alike share a row.
//!
//! Policy:
//! - With probability `epsilon`: pick a uniformly random action and decay
//!   `epsilon *= decay_rate`. Exploitation never decays it.
//! - Otherwise: pick the highest-valued action for the context, breaking exact
//!   ties uniformly at random.
//!
//! Values move by a fixed-step exponential moving average,
//! `v += learning_rate * (reward - v)`. Per-action counts are informational.
//!
//! Like the other policies in this crate it is **seedable**: the same seed and
//! call sequence give the same choices. An instance is not synchronized; give
//! each sequential decision stream its own bandit, or serialize access.

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::{Error, KeyValueStore, Result};

/// Context components are rounded to multiples of `1 / CONTEXT_KEY_SCALE`.
pub const CONTEXT_KEY_SCALE: f64 = 1000.0;

/// Configuration for [`ContextualBandit`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    /// Number of actions (must be >= 1).
    pub num_actions: usize,
    /// Initial exploration probability in `[0, 1]`.
    pub epsilon: f64,
    /// Multiplier applied to `epsilon` after each exploration, in `(0, 1]`.
    pub decay_rate: f64,
    /// EMA step in `(0, 1]`.
    pub learning_rate: f64,
    /// Seed for exploration draws and tie-breaking.
    pub seed: u64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            num_actions: 4,
            epsilon: 0.1,
            decay_rate: 0.995,
            learning_rate: 0.1,
            seed: 0,
        }
    }
}

impl BanditConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_actions == 0 {
            return Err(Error::InvalidConfig("num_actions must be >= 1".to_string()));
        }
        if !(self.epsilon.is_finite() && (0.0..=1.0).contains(&self.epsilon)) {
            return Err(Error::InvalidConfig("epsilon must be in [0, 1]".to_string()));
        }
        for (name, v) in [
            ("decay_rate", self.decay_rate),
            ("learning_rate", self.learning_rate),
        ] {
            if !(v.is_finite() && v > 0.0 && v <= 1.0) {
                return Err(Error::InvalidConfig(format!("{name} must be in (0, 1]")));
            }
        }
        Ok(())
    }
}

/// A decision context: two numeric sub-vectors (e.g. user and item features).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BanditContext {
    pub primary: Vec<f64>,
    pub secondary: Vec<f64>,
}

impl BanditContext {
    pub fn new(primary: Vec<f64>, secondary: Vec<f64>) -> Self {
        Self { primary, secondary }
    }

    pub fn key(&self) -> ContextKey {
        ContextKey::from_context(self)
    }
}

/// Quantized context, used as the value-table key.
///
/// The primary and secondary components are concatenated and stored as
/// integers in thousandths, so `-0.0` and `0.0` (or `0.1 + 0.2` and `0.3`) land
/// on the same key regardless of formatting. Only the concatenation counts:
/// `([1], [2, 3])` and `([1, 2], [3])` share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextKey(pub Vec<i64>);

impl ContextKey {
    pub fn from_context(ctx: &BanditContext) -> Self {
        Self(
            ctx.primary
                .iter()
                .chain(&ctx.secondary)
                .copied()
                .map(quantize)
                .collect(),
        )
    }
}

// Non-finite inputs saturate (`NaN -> 0`, `inf -> i64::MAX`).
#[inline]
fn quantize(x: f64) -> i64 {
    (x * CONTEXT_KEY_SCALE).round() as i64
}

/// Result of one selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BanditDecision {
    pub action: usize,
    /// The action came from the exploration branch.
    pub explored: bool,
    /// Exploration probability in effect for this draw (before any decay).
    pub epsilon: f64,
}

/// Values for one context in a [`BanditSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextValues {
    pub key: ContextKey,
    pub values: Vec<f64>,
}

/// Serializable bandit state.
///
/// The RNG position is not captured; a restored bandit re-seeds from
/// `config.seed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditSnapshot {
    pub config: BanditConfig,
    pub epsilon: f64,
    pub counts: Vec<u64>,
    pub contexts: Vec<ContextValues>,
}

/// Seedable epsilon-greedy bandit with per-context value tables.
#[derive(Debug, Clone)]
pub struct ContextualBandit {
    cfg: BanditConfig,
    epsilon: f64,
    counts: Vec<u64>,
    values: BTreeMap<ContextKey, Vec<f64>>,
    rng: StdRng,
}

impl ContextualBandit {
    pub fn new(cfg: BanditConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            epsilon: cfg.epsilon,
            counts: vec![0; cfg.num_actions],
            values: BTreeMap::new(),
            rng: StdRng::seed_from_u64(cfg.seed),
        })
    }

    pub fn config(&self) -> &BanditConfig {
        &self.cfg
    }

    pub fn num_actions(&self) -> usize {
        self.cfg.num_actions
    }

    /// Current exploration probability (non-increasing).
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Times each action has been selected.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Number of distinct context keys seen.
    pub fn num_contexts(&self) -> usize {
        self.values.len()
    }

    /// Action values for a context, if it has been seen.
    pub fn values(&self, ctx: &BanditContext) -> Option<&[f64]> {
        self.values.get(&ctx.key()).map(Vec::as_slice)
    }

    /// Greedy action without side effects (lowest index on ties).
    ///
    /// `None` for an unseen context.
    pub fn best_action(&self, ctx: &BanditContext) -> Option<usize> {
        let row = self.values.get(&ctx.key())?;
        let mut best = 0;
        for (i, &v) in row.iter().enumerate() {
            if v > row[best] {
                best = i;
            }
        }
        Some(best)
    }

    fn row_mut(&mut self, key: ContextKey) -> &mut Vec<f64> {
        let n = self.cfg.num_actions;
        self.values.entry(key).or_insert_with(|| vec![0.0; n])
    }

    /// Choose an action for `ctx`.
    pub fn select(&mut self, ctx: &BanditContext) -> usize {
        self.select_explain(ctx).action
    }

    /// Choose an action and report which branch produced it.
    pub fn select_explain(&mut self, ctx: &BanditContext) -> BanditDecision {
        let n = self.cfg.num_actions;
        let epsilon = self.epsilon;
        let key = ctx.key();
        // Unseen contexts start at zero.
        let row = self.row_mut(key).clone();

        let explore = epsilon > 0.0 && self.rng.random::<f64>() < epsilon;
        let action = if explore {
            let a = self.rng.random_range(0..n);
            self.epsilon *= self.cfg.decay_rate;
            a
        } else {
            let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let mut ties: Vec<usize> = (0..n).filter(|&i| row[i] == max).collect();
            if ties.is_empty() {
                ties = (0..n).collect();
            }
            ties[self.rng.random_range(0..ties.len())]
        };
        self.counts[action] = self.counts[action].saturating_add(1);
        trace!(action, explore, epsilon = self.epsilon, "bandit select");

        BanditDecision {
            action,
            explored: explore,
            epsilon,
        }
    }

    /// Move the value of `action` in `ctx` toward `reward`.
    pub fn update(&mut self, ctx: &BanditContext, action: usize, reward: f64) -> Result<()> {
        let n = self.cfg.num_actions;
        if action >= n {
            return Err(Error::ActionOutOfRange {
                action,
                num_actions: n,
            });
        }
        if !reward.is_finite() {
            return Err(Error::InvalidInput(format!("reward {reward} is not finite")));
        }
        let lr = self.cfg.learning_rate;
        let row = self.row_mut(ctx.key());
        let next = row[action] + lr * (reward - row[action]);
        if !next.is_finite() {
            return Err(Error::InvalidInput(format!(
                "reward {reward} overflows action value {}",
                row[action]
            )));
        }
        row[action] = next;
        Ok(())
    }

    /// Capture the full learned state.
    pub fn snapshot(&self) -> BanditSnapshot {
        BanditSnapshot {
            config: self.cfg,
            epsilon: self.epsilon,
            counts: self.counts.clone(),
            contexts: self
                .values
                .iter()
                .map(|(k, v)| ContextValues {
                    key: k.clone(),
                    values: v.clone(),
                })
                .collect(),
        }
    }

    /// Rebuild a bandit from a snapshot, validating every row width.
    pub fn from_snapshot(snap: BanditSnapshot) -> Result<Self> {
        let mut b = Self::new(snap.config)?;
        let n = b.cfg.num_actions;
        if snap.counts.len() != n {
            return Err(Error::dims(n, snap.counts.len()));
        }
        if !(snap.epsilon.is_finite() && (0.0..=snap.config.epsilon).contains(&snap.epsilon)) {
            return Err(Error::InvalidConfig(
                "snapshot epsilon must be in [0, config.epsilon]".to_string(),
            ));
        }
        for cv in snap.contexts {
            if cv.values.len() != n {
                return Err(Error::dims(n, cv.values.len()));
            }
            b.values.insert(cv.key, cv.values);
        }
        b.counts = snap.counts;
        b.epsilon = snap.epsilon;
        Ok(b)
    }

    /// Persist the snapshot as JSON under `key`.
    pub fn save_to(&self, store: &dyn KeyValueStore, key: &str) -> Result<()> {
        let raw = serde_json::to_string(&self.snapshot())?;
        store.set_item(key, &raw)?;
        debug!(key, contexts = self.values.len(), "saved bandit state");
        Ok(())
    }

    /// Load a bandit persisted with [`ContextualBandit::save_to`]; `Ok(None)` if absent.
    pub fn load_from(store: &dyn KeyValueStore, key: &str) -> Result<Option<Self>> {
        let Some(raw) = store.get_item(key)? else {
            return Ok(None);
        };
        let snap: BanditSnapshot = serde_json::from_str(&raw)?;
        Self::from_snapshot(snap).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use proptest::prelude::*;

    fn ctx(a: f64, b: f64) -> BanditContext {
        BanditContext::new(vec![a], vec![b])
    }

    fn greedy(n: usize, seed: u64) -> ContextualBandit {
        ContextualBandit::new(BanditConfig {
            num_actions: n,
            epsilon: 0.0,
            seed,
            ..BanditConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn ties_on_an_unseen_context_are_broken_uniformly() {
        let mut b = greedy(4, 17);
        let c = ctx(0.5, 0.25);
        let trials = 8000;
        let mut freq = [0usize; 4];
        for _ in 0..trials {
            freq[b.select(&c)] += 1;
        }
        for f in freq {
            let share = f as f64 / trials as f64;
            assert!((share - 0.25).abs() < 0.03, "freq={freq:?}");
        }
        assert_eq!(b.counts().iter().sum::<u64>(), trials as u64);
        assert_eq!(b.epsilon(), 0.0);
    }

    #[test]
    fn greedy_picks_the_best_action() {
        let mut b = greedy(3, 1);
        let c = ctx(1.0, 2.0);
        b.update(&c, 2, 1.0).unwrap();
        for _ in 0..50 {
            assert_eq!(b.select(&c), 2);
        }
        assert_eq!(b.best_action(&c), Some(2));
        assert_eq!(b.best_action(&ctx(9.0, 9.0)), None);
    }

    #[test]
    fn one_update_is_exactly_one_learning_rate_step() {
        let mut b = greedy(2, 0);
        let c = ctx(0.0, 0.0);
        b.update(&c, 0, 1.0).unwrap();
        assert_eq!(b.values(&c).unwrap()[0], 0.1);
        assert_eq!(b.values(&c).unwrap()[1], 0.0);
    }

    #[test]
    fn repeated_updates_approach_but_never_exceed_reward() {
        let mut b = greedy(1, 0);
        let c = ctx(0.0, 0.0);
        let mut prev = 0.0;
        for _ in 0..200 {
            b.update(&c, 0, 1.0).unwrap();
            let v = b.values(&c).unwrap()[0];
            assert!(v >= prev);
            assert!(v <= 1.0);
            prev = v;
        }
        assert!(prev > 0.99);
    }

    #[test]
    fn counts_do_not_change_the_step_size() {
        let mut b = greedy(2, 0);
        let c = ctx(0.0, 0.0);
        for _ in 0..10 {
            b.select(&c);
        }
        b.update(&c, 0, 1.0).unwrap();
        b.update(&c, 1, 1.0).unwrap();
        let v = b.values(&c).unwrap();
        assert_eq!(v[0], v[1]);
    }

    #[test]
    fn exploration_decays_epsilon_and_exploitation_does_not() {
        let mut b = ContextualBandit::new(BanditConfig {
            num_actions: 3,
            epsilon: 1.0,
            decay_rate: 0.5,
            ..BanditConfig::default()
        })
        .unwrap();
        let c = ctx(0.0, 0.0);
        let d = b.select_explain(&c);
        assert!(d.explored);
        assert_eq!(d.epsilon, 1.0);
        assert_eq!(b.epsilon(), 0.5);

        let mut prev = b.epsilon();
        for _ in 0..200 {
            let d = b.select_explain(&c);
            if d.explored {
                assert_eq!(b.epsilon(), prev * 0.5);
            } else {
                assert_eq!(b.epsilon(), prev);
            }
            assert!(b.epsilon() <= prev);
            prev = b.epsilon();
        }
    }

    #[test]
    fn nearby_contexts_share_a_row() {
        let mut b = greedy(2, 0);
        b.update(&ctx(0.1 + 0.2, -0.0), 1, 1.0).unwrap();
        assert_eq!(b.values(&ctx(0.3, 0.0)).unwrap()[1], 0.1);
        assert_eq!(b.values(&ctx(0.30049, 0.0004)).unwrap()[1], 0.1);
        assert!(b.values(&ctx(0.301, 0.0)).is_none());
        assert_eq!(b.num_contexts(), 1);
    }

    #[test]
    fn key_is_the_concatenation_of_both_sub_vectors() {
        let a = BanditContext::new(vec![1.0], vec![2.0, 3.0]).key();
        let b = BanditContext::new(vec![1.0, 2.0], vec![3.0]).key();
        assert_eq!(a, b);
        assert_eq!(a, ContextKey(vec![1000, 2000, 3000]));
    }

    #[test]
    fn overflowing_updates_are_rejected_and_leave_the_value_intact() {
        let mut b = ContextualBandit::new(BanditConfig {
            num_actions: 2,
            epsilon: 0.0,
            learning_rate: 1.0,
            ..BanditConfig::default()
        })
        .unwrap();
        let c = ctx(0.0, 0.0);
        b.update(&c, 0, -1e308).unwrap();
        assert!(matches!(
            b.update(&c, 0, 1e308),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(b.values(&c).unwrap()[0], -1e308);
        b.update(&c, 0, 0.5).unwrap();
        let v = b.values(&c).unwrap();
        assert!(v.iter().all(|x| x.is_finite()), "{v:?}");
        assert_eq!(v[1], 0.0);
    }

    #[test]
    fn rejects_bad_actions_rewards_and_configs() {
        let mut b = greedy(2, 0);
        assert!(matches!(
            b.update(&ctx(0.0, 0.0), 2, 1.0),
            Err(Error::ActionOutOfRange {
                action: 2,
                num_actions: 2
            })
        ));
        assert!(matches!(
            b.update(&ctx(0.0, 0.0), 0, f64::NAN),
            Err(Error::InvalidInput(_))
        ));
        for cfg in [
            BanditConfig {
                num_actions: 0,
                ..BanditConfig::default()
            },
            BanditConfig {
                epsilon: 1.5,
                ..BanditConfig::default()
            },
            BanditConfig {
                decay_rate: 0.0,
                ..BanditConfig::default()
            },
            BanditConfig {
                learning_rate: f64::NAN,
                ..BanditConfig::default()
            },
        ] {
            assert!(ContextualBandit::new(cfg).is_err(), "{cfg:?}");
        }
    }

    #[test]
    fn same_seed_same_choices() {
        let cfg = BanditConfig {
            num_actions: 5,
            epsilon: 0.3,
            seed: 42,
            ..BanditConfig::default()
        };
        let mut b1 = ContextualBandit::new(cfg).unwrap();
        let mut b2 = ContextualBandit::new(cfg).unwrap();
        for i in 0..100 {
            let c = ctx((i % 7) as f64 * 0.1, 0.0);
            let a1 = b1.select(&c);
            let a2 = b2.select(&c);
            assert_eq!(a1, a2, "step {i}");
            let r = if a1 == 3 { 1.0 } else { 0.2 };
            b1.update(&c, a1, r).unwrap();
            b2.update(&c, a2, r).unwrap();
        }
    }

    #[test]
    fn snapshot_survives_a_store_round_trip() {
        let mut b = ContextualBandit::new(BanditConfig {
            epsilon: 0.5,
            ..BanditConfig::default()
        })
        .unwrap();
        for i in 0..30 {
            let c = ctx(i as f64 * 0.01, 1.0);
            let a = b.select(&c);
            b.update(&c, a, 0.7).unwrap();
        }
        let store = MemoryStore::new();
        b.save_to(&store, "bandit").unwrap();
        let r = ContextualBandit::load_from(&store, "bandit").unwrap().unwrap();
        assert_eq!(r.snapshot(), b.snapshot());
        assert!(ContextualBandit::load_from(&store, "absent").unwrap().is_none());
    }

    #[test]
    fn snapshot_with_wrong_row_width_is_rejected() {
        let mut snap = greedy(3, 0).snapshot();
        snap.contexts.push(ContextValues {
            key: ctx(0.0, 0.0).key(),
            values: vec![0.0; 2],
        });
        assert!(matches!(
            ContextualBandit::from_snapshot(snap),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    proptest! {
        #[test]
        fn selection_is_in_range_and_counts_track_selections(
            n in 1usize..8,
            epsilon in 0.0f64..=1.0,
            seed in any::<u64>(),
            steps in 0usize..200,
        ) {
            let mut b = ContextualBandit::new(BanditConfig {
                num_actions: n,
                epsilon,
                seed,
                ..BanditConfig::default()
            }).unwrap();
            let mut prev_eps = b.epsilon();
            for i in 0..steps {
                let c = ctx((i % 3) as f64, 0.0);
                let a = b.select(&c);
                prop_assert!(a < n);
                prop_assert!(b.epsilon() <= prev_eps);
                prev_eps = b.epsilon();
                b.update(&c, a, (i % 2) as f64).unwrap();
            }
            prop_assert_eq!(b.counts().iter().sum::<u64>(), steps as u64);
        }

        #[test]
        fn values_stay_within_reward_hull(
            lr in 0.01f64..1.0,
            rewards in proptest::collection::vec(-5.0f64..5.0, 1..100),
        ) {
            let mut b = ContextualBandit::new(BanditConfig {
                num_actions: 1,
                learning_rate: lr,
                ..BanditConfig::default()
            }).unwrap();
            let c = ctx(0.0, 0.0);
            let lo = rewards.iter().copied().fold(0.0f64, f64::min);
            let hi = rewards.iter().copied().fold(0.0f64, f64::max);
            for r in rewards {
                b.update(&c, 0, r).unwrap();
                let v = b.values(&c).unwrap()[0];
                prop_assert!(v >= lo - 1e-9 && v <= hi + 1e-9);
            }
        }
    }
}
