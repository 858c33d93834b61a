/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Keyword scoring backend

use super::backend::{ModelBackend, ModelVote};
use crate::config::KeywordBackendConfig;
use crate::error::Result;
use crate::patterns::PatternMatcher;
use crate::signal::EmailSignal;
use crate::Category;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Base confidence of a keyword vote before hits are counted
const BASE_SCORE: f64 = 0.4;

/// Backend scoring categories by their keyword hits
pub struct KeywordBackend {
    config: KeywordBackendConfig,
    matcher: Arc<dyn PatternMatcher>,
}

impl KeywordBackend {
    pub const NAME: &'static str = "keyword";

    /// Create a new keyword backend
    pub fn new(config: &KeywordBackendConfig, matcher: Arc<dyn PatternMatcher>) -> Self {
        Self {
            config: config.clone(),
            matcher,
        }
    }

    fn score(&self, signal: &EmailSignal) -> ModelVote {
        let mut counts: BTreeMap<Category, usize> = BTreeMap::new();
        for keyword in &signal.matched_keywords {
            if let Some(category) = self.matcher.category_of(keyword) {
                *counts.entry(category).or_default() += 1;
            }
        }

        let mut best: Option<(Category, f64)> = None;
        for (category, count) in counts {
            let weight = self
                .config
                .category_weights
                .get(&category)
                .copied()
                .unwrap_or(1.0);
            let score = ((BASE_SCORE + self.config.hit_weight * count as f64) * weight).min(0.99);
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((category, score));
            }
        }

        match best {
            Some((category, score)) => ModelVote::new(Self::NAME, category, score),
            None => ModelVote::new(Self::NAME, Category::Legitimate, self.config.clean_confidence),
        }
    }
}

#[async_trait]
impl ModelBackend for KeywordBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn predict(&self, signal: &EmailSignal) -> Result<ModelVote> {
        Ok(self.score(signal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternSets;
    use crate::patterns::build_matcher;
    use crate::signal::{RawEmail, SignalExtractor};

    fn setup(config: KeywordBackendConfig) -> (SignalExtractor, KeywordBackend) {
        let patterns = PatternSets::default();
        let matcher = build_matcher(&patterns).unwrap();
        let extractor = SignalExtractor::new(matcher.clone(), patterns.risky_tlds.clone(), 0.6);
        (extractor, KeywordBackend::new(&config, matcher))
    }

    #[tokio::test]
    async fn test_clean_email_votes_legitimate() {
        let (extractor, backend) = setup(KeywordBackendConfig::default());
        let signal = extractor.extract(&RawEmail::new("m1", "bob@example.com", "Lunch?", ""));

        let vote = backend.predict(&signal).await.unwrap();
        assert_eq!(vote.category, Category::Legitimate);
        assert_eq!(vote.confidence, 0.6);
        assert_eq!(vote.model_name, "keyword");
    }

    #[tokio::test]
    async fn test_hits_raise_confidence() {
        let (extractor, backend) = setup(KeywordBackendConfig::default());
        let signal = extractor.extract(&RawEmail::new(
            "m2",
            "shop@example.com",
            "Cheap viagra and cialis from our pharmacy",
            "",
        ));

        let vote = backend.predict(&signal).await.unwrap();
        assert_eq!(vote.category, Category::Health);
        assert!((vote.confidence - 0.99).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_category_weight_applies() {
        let mut config = KeywordBackendConfig::default();
        config.category_weights.insert(Category::Financial, 0.5);
        let (extractor, backend) = setup(config);
        let signal = extractor.extract(&RawEmail::new("m3", "a@example.com", "Buy bitcoin", ""));

        let vote = backend.predict(&signal).await.unwrap();
        assert_eq!(vote.category, Category::Financial);
        assert!((vote.confidence - 0.325).abs() < 1e-9);
    }
}
