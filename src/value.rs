//! Percentile-based value scores.
//!
//! A product's score is the geometric mean of two percentiles taken over the
//! whole input population:
//!
//! ```text
//! price_pct  = 1 - rank(prices, price)     cheaper  -> closer to 1
//! rating_pct =     rank(ratings, rating)   better   -> closer to 1
//! score      = sqrt(price_pct * rating_pct)
//! ```
//!
//! The score is in `[0, 1]` and is zero when either factor is zero.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Error, Result};

/// A priced, rated item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub price: f64,
    pub rating: f64,
}

impl Product {
    pub fn new(id: impl Into<String>, price: f64, rating: f64) -> Self {
        Self {
            id: id.into(),
            price,
            rating,
        }
    }
}

/// Product id -> score in `[0, 1]`.
pub type ValueScoreMap = BTreeMap<String, f64>;

/// Fraction of `values` below `x`, counting exact ties as half.
///
/// `(less + 0.5 * equal) / n`. When `x` is absent from `values` this reduces to
/// the insertion point of `x` in sorted order over `n`. Empty populations rank
/// everything at `0.0`.
pub fn percentile_rank(values: &[f64], x: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut less = 0usize;
    let mut equal = 0usize;
    for &v in values {
        if v < x {
            less += 1;
        } else if v == x {
            equal += 1;
        }
    }
    (less as f64 + 0.5 * equal as f64) / values.len() as f64
}

/// [`percentile_rank`] for many queries against one population.
///
/// Sorts once and uses binary search; results match the single-query form.
pub fn percentile_ranks(values: &[f64], queries: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return vec![0.0; queries.len()];
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len() as f64;
    queries
        .iter()
        .map(|&x| {
            let less = sorted.partition_point(|&v| v < x);
            let not_greater = sorted.partition_point(|&v| v <= x);
            (less as f64 + 0.5 * (not_greater - less) as f64) / n
        })
        .collect()
}

/// Element-wise percentile ranks of `xs` against a paired population.
///
/// The two slices describe the same items, so they must have equal length.
pub fn paired_percentile_ranks(population: &[f64], xs: &[f64]) -> Result<Vec<f64>> {
    if population.len() != xs.len() {
        return Err(Error::dims(population.len(), xs.len()));
    }
    Ok(percentile_ranks(population, xs))
}

/// Value score for every product. Empty input gives an empty map.
///
/// Duplicate ids keep the score of their last occurrence.
pub fn value_scores(products: &[Product]) -> ValueScoreMap {
    if products.is_empty() {
        return ValueScoreMap::new();
    }
    let prices: Vec<f64> = products.iter().map(|p| p.price).collect();
    let ratings: Vec<f64> = products.iter().map(|p| p.rating).collect();
    let price_ranks = percentile_ranks(&prices, &prices);
    let rating_ranks = percentile_ranks(&ratings, &ratings);

    products
        .iter()
        .zip(price_ranks.into_iter().zip(rating_ranks))
        .map(|(p, (pr, rr))| {
            let price_pct = (1.0 - pr).clamp(0.0, 1.0);
            let rating_pct = rr.clamp(0.0, 1.0);
            (p.id.clone(), (price_pct * rating_pct).sqrt())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ties_take_the_midpoint() {
        assert_eq!(percentile_rank(&[10.0, 20.0, 20.0, 30.0], 20.0), 0.5);
    }

    #[test]
    fn absent_values_use_the_insertion_point() {
        let vals = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile_rank(&vals, 25.0), 0.5);
        assert_eq!(percentile_rank(&vals, 5.0), 0.0);
        assert_eq!(percentile_rank(&vals, 99.0), 1.0);
        assert_eq!(percentile_rank(&[], 1.0), 0.0);
    }

    #[test]
    fn cheaper_and_better_dominates() {
        let s = value_scores(&[
            Product::new("X", 10.0, 4.5),
            Product::new("Y", 20.0, 4.0),
        ]);
        assert!(s["X"] > s["Y"], "{s:?}");
    }

    #[test]
    fn empty_products_give_an_empty_map() {
        assert!(value_scores(&[]).is_empty());
    }

    #[test]
    fn identical_products_score_identically() {
        let s = value_scores(&[
            Product::new("a", 15.0, 4.2),
            Product::new("b", 15.0, 4.2),
            Product::new("c", 30.0, 3.0),
        ]);
        assert_eq!(s["a"], s["b"]);
    }

    #[test]
    fn single_product_ranks_at_the_midpoint() {
        let s = value_scores(&[Product::new("solo", 10.0, 4.0)]);
        assert!((s["solo"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn paired_ranks_require_equal_lengths() {
        assert!(matches!(
            paired_percentile_ranks(&[1.0, 2.0], &[1.0]),
            Err(Error::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    proptest! {
        #[test]
        fn batched_ranks_match_single_queries(
            vals in proptest::collection::vec(-100.0f64..100.0, 0..40),
            queries in proptest::collection::vec(-120.0f64..120.0, 0..10),
        ) {
            let batched = percentile_ranks(&vals, &queries);
            for (q, b) in queries.iter().zip(&batched) {
                prop_assert_eq!(percentile_rank(&vals, *q), *b);
            }
        }

        #[test]
        fn scores_are_bounded(
            rows in proptest::collection::vec((0.0f64..1000.0, 0.0f64..5.0), 1..40),
        ) {
            let products: Vec<Product> = rows
                .iter()
                .enumerate()
                .map(|(i, (p, r))| Product::new(format!("p{i}"), *p, *r))
                .collect();
            let s = value_scores(&products);
            prop_assert_eq!(s.len(), products.len());
            for v in s.values() {
                prop_assert!(v.is_finite());
                prop_assert!((0.0..=1.0).contains(v));
            }
        }
    }
}
