//! Priority scoring of content items.
//!
//! `score = (a·relevance + b·replication_density + c·quality) × age_factor`
//!
//! Everything here is a pure function of the item and a [`ScoreContext`]; the only
//! external input is the replication density, looked up through a [`ScoreSource`].

use crate::store::{ContentId, ContentItem, ContentStore};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Linear weights of the three score components
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub relevance: f32,
    pub replication_density: f32,
    pub quality: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            relevance: 0.0,
            replication_density: 0.6,
            quality: 0.4,
        }
    }
}

/// Per-evaluation inputs that do not come from the item itself
#[derive(Debug, Clone, Copy)]
pub struct ScoreContext<'a> {
    pub now_ms: u64,
    pub replication_density: f32,
    /// Interests announced by the peer
    pub interests: &'a [String],
}

/// likes / duplicates, 0 when the item was never duplicated
pub fn quality(item: &ContentItem) -> f32 {
    if item.duplicates == 0 {
        0.0
    } else {
        item.likes as f32 / item.duplicates as f32
    }
}

/// Linear decay from 1 at creation to 0 at `created + ttl`; 1 when the item never expires
pub fn age_factor(created_at_ms: u64, ttl_ms: u64, now_ms: u64) -> f32 {
    if ttl_ms == 0 {
        return 1.0;
    }
    let elapsed = now_ms.saturating_sub(created_at_ms) as f64;
    (1.0 - elapsed / ttl_ms as f64).max(0.0) as f32
}

/// Fraction of the item's tags the peer is interested in
pub fn relevance(item: &ContentItem, interests: &[String]) -> f32 {
    if item.tags.is_empty() || interests.is_empty() {
        return 0.0;
    }
    let matching = item
        .tags
        .iter()
        .filter(|tag| interests.iter().any(|i| i.eq_ignore_ascii_case(tag)))
        .count();
    matching as f32 / item.tags.len() as f32
}

pub fn compute_score(item: &ContentItem, ctx: &ScoreContext<'_>, weights: &ScoreWeights) -> f32 {
    let density = ctx.replication_density.clamp(0.0, 1.0);
    let linear = weights.relevance * relevance(item, ctx.interests)
        + weights.replication_density * density
        + weights.quality * quality(item);
    linear * age_factor(item.created_at_ms, item.ttl_ms, ctx.now_ms)
}

/// External replication-density estimator
#[cfg_attr(test, mockall::automock)]
pub trait ScoreSource: Send + Sync {
    /// Saturation of `id` across the visible mesh, in [0, 1]
    fn replication_density(&self, id: ContentId) -> f32;
}

/// Table-backed density estimates with a fallback for unknown items
pub struct DensityTable {
    default: f32,
    values: RwLock<HashMap<ContentId, f32>>,
}

impl DensityTable {
    pub fn new(default: f32) -> Self {
        Self {
            default: default.clamp(0.0, 1.0),
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, id: ContentId, density: f32) {
        self.values.write().insert(id, density.clamp(0.0, 1.0));
    }

    pub fn forget(&self, id: ContentId) {
        self.values.write().remove(&id);
    }
}

impl ScoreSource for DensityTable {
    fn replication_density(&self, id: ContentId) -> f32 {
        self.values.read().get(&id).copied().unwrap_or(self.default)
    }
}

/// Score model bound to a density source
#[derive(Clone)]
pub struct ScoreModel {
    weights: ScoreWeights,
    source: Arc<dyn ScoreSource>,
}

impl ScoreModel {
    pub fn new(weights: ScoreWeights, source: Arc<dyn ScoreSource>) -> Self {
        Self { weights, source }
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    pub fn score(&self, item: &ContentItem, now_ms: u64, interests: &[String]) -> f32 {
        let ctx = ScoreContext {
            now_ms,
            replication_density: self.source.replication_density(item.id),
            interests,
        };
        compute_score(item, &ctx, &self.weights)
    }
}

/// Anything able to score a candidate at pick time
pub trait Scorer {
    /// Fresh score of a held item, None once the item is gone
    fn score(&self, item: &ContentItem) -> Option<f32>;
}

impl<F> Scorer for F
where
    F: Fn(&ContentItem) -> f32,
{
    fn score(&self, item: &ContentItem) -> Option<f32> {
        Some(self(item))
    }
}

/// A [`ScoreModel`] evaluated at a fixed instant for one peer.
///
/// Scores the item as the store holds it now rather than the copy inside the
/// candidate's handle, so likes and duplicates received meanwhile count.
pub struct SessionScorer<'a> {
    pub model: &'a ScoreModel,
    pub store: &'a dyn ContentStore,
    pub now_ms: u64,
    pub interests: &'a [String],
}

impl Scorer for SessionScorer<'_> {
    fn score(&self, item: &ContentItem) -> Option<f32> {
        let current = self.store.snapshot(item.id)?;
        Some(self.model.score(&current, self.now_ms, self.interests))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{unix_millis, MemoryContentStore};
    use proptest::prelude::*;

    fn ctx(now_ms: u64, density: f32) -> ScoreContext<'static> {
        ScoreContext {
            now_ms,
            replication_density: density,
            interests: &[],
        }
    }

    #[test]
    fn test_default_weights() {
        let w = ScoreWeights::default();
        assert_eq!(w.relevance, 0.0);
        assert_eq!(w.replication_density, 0.6);
        assert_eq!(w.quality, 0.4);
    }

    #[test]
    fn test_quality_without_duplicates_is_zero() {
        let mut item = ContentItem::new("a", "public", "x");
        item.likes = 10;
        assert_eq!(quality(&item), 0.0);

        item.duplicates = 4;
        assert_eq!(quality(&item), 2.5);
    }

    #[test]
    fn test_age_factor_bounds() {
        assert_eq!(age_factor(1_000, 10_000, 1_000), 1.0);
        assert_eq!(age_factor(1_000, 10_000, 11_000), 0.0);
        assert_eq!(age_factor(1_000, 10_000, 50_000), 0.0);
        assert!((age_factor(0, 10_000, 2_500) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_age_factor_without_ttl() {
        assert_eq!(age_factor(0, 0, u64::MAX), 1.0);
    }

    #[test]
    fn test_age_factor_created_in_future() {
        assert_eq!(age_factor(5_000, 1_000, 1_000), 1.0);
    }

    #[test]
    fn test_relevance_counts_matching_tags() {
        let item = ContentItem::new("a", "public", "x").with_tags(&["mesh", "rust", "radio", "cats"]);
        let interests = vec!["Rust".to_string(), "mesh".to_string()];
        assert_eq!(relevance(&item, &interests), 0.5);
        assert_eq!(relevance(&item, &[]), 0.0);
    }

    #[test]
    fn test_compute_score_combines_components() {
        let mut item = ContentItem::new("a", "public", "x").with_created_at_ms(0);
        item.likes = 1;
        item.duplicates = 2;
        let score = compute_score(&item, &ctx(0, 0.5), &ScoreWeights::default());
        // 0.6 * 0.5 + 0.4 * 0.5
        assert!((score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_compute_score_clamps_density() {
        let item = ContentItem::new("a", "public", "x").with_created_at_ms(0);
        let score = compute_score(&item, &ctx(0, 7.0), &ScoreWeights::default());
        assert!((score - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_score_model_uses_source() {
        let item = ContentItem::new("a", "public", "x").with_created_at_ms(0);
        let id = item.id;

        let mut source = MockScoreSource::new();
        source
            .expect_replication_density()
            .withf(move |queried| *queried == id)
            .times(1)
            .return_const(1.0f32);

        let model = ScoreModel::new(ScoreWeights::default(), Arc::new(source));
        assert!((model.score(&item, 0, &[]) - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_density_table_default_and_override() {
        let table = DensityTable::new(0.25);
        let id = ContentId::new();
        assert_eq!(table.replication_density(id), 0.25);

        table.set(id, 0.9);
        assert_eq!(table.replication_density(id), 0.9);

        table.forget(id);
        assert_eq!(table.replication_density(id), 0.25);
    }

    #[test]
    fn test_closure_scorer() {
        let scorer = |_: &ContentItem| 0.42f32;
        let item = ContentItem::new("a", "public", "x");
        assert_eq!(Scorer::score(&scorer, &item), Some(0.42));
    }

    #[test]
    fn test_session_scorer_reads_current_item() {
        let store = MemoryContentStore::new();
        let item = ContentItem::new("a", "public", "x");
        let id = item.id;
        store.insert(item.clone());
        let handle = store.fetch(id).unwrap();

        let model = ScoreModel::new(ScoreWeights::default(), Arc::new(DensityTable::new(0.5)));
        let scorer = SessionScorer {
            model: &model,
            store: &store,
            now_ms: unix_millis(),
            interests: &[],
        };
        assert!((scorer.score(&handle).unwrap() - 0.3).abs() < 1e-6);

        store.insert(item);
        store.like(id);
        // 0.6 * 0.5 + 0.4 * (1 / 1)
        assert!((scorer.score(&handle).unwrap() - 0.7).abs() < 1e-6);

        store.delete(id);
        assert_eq!(scorer.score(&handle), None);
    }

    proptest! {
        #[test]
        fn prop_score_non_increasing_in_elapsed(
            ttl in 1u64..10_000_000,
            e1 in 0u64..20_000_000,
            e2 in 0u64..20_000_000,
            density in 0.0f32..=1.0,
        ) {
            let (early, late) = if e1 <= e2 { (e1, e2) } else { (e2, e1) };
            let item = ContentItem::new("a", "public", "x")
                .with_created_at_ms(1_000)
                .with_ttl_ms(ttl);
            let weights = ScoreWeights::default();
            let s_early = compute_score(&item, &ctx(1_000 + early, density), &weights);
            let s_late = compute_score(&item, &ctx(1_000 + late, density), &weights);
            prop_assert!(s_late <= s_early);
        }

        #[test]
        fn prop_age_factor_in_unit_interval(
            created in 0u64..1_000_000,
            ttl in 0u64..1_000_000,
            now in 0u64..3_000_000,
        ) {
            let factor = age_factor(created, ttl, now);
            prop_assert!((0.0..=1.0).contains(&factor));
        }
    }
}
