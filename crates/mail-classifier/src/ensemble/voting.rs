/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Weighted voting with a consensus rule

use super::backend::{ModelBackend, ModelVote};
use crate::config::EnsembleConfig;
use crate::error::ClassifierError;
use crate::metrics::EngineMetrics;
use crate::signal::EmailSignal;
use crate::Category;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Combined verdict of the ensemble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleVerdict {
    /// Highest weighted category
    pub category: Category,
    /// Optional finer grained label
    pub subcategory: Option<String>,
    /// Weighted support of the winning category over the total vote weight
    pub aggregate_confidence: f64,
    /// Share of the winning category in the weighted score mass
    pub category_share: f64,
    /// Votes in backend order
    pub contributing_votes: Vec<ModelVote>,
    /// Whether the winning category met the agreement rule
    pub consensus_reached: bool,
}

impl EnsembleVerdict {
    /// Verdict of an ensemble where no backend produced a vote
    pub fn empty() -> Self {
        Self {
            category: Category::Uncertain,
            subcategory: None,
            aggregate_confidence: 0.0,
            category_share: 0.0,
            contributing_votes: Vec::new(),
            consensus_reached: false,
        }
    }
}

/// Ensemble voter
pub struct EnsembleVoter {
    config: EnsembleConfig,
    metrics: Option<Arc<EngineMetrics>>,
}

impl EnsembleVoter {
    /// Create a new voter
    pub fn new(config: &EnsembleConfig) -> Self {
        Self {
            config: config.clone(),
            metrics: None,
        }
    }

    /// Count backend failures in the given metrics
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Collect votes from all backends concurrently and aggregate them
    ///
    /// A backend that errors or exceeds its timeout contributes no vote.
    pub async fn vote(
        &self,
        signal: &EmailSignal,
        backends: &[Arc<dyn ModelBackend>],
    ) -> EnsembleVerdict {
        let timeout = self.config.backend_timeout();

        let predictions = backends.iter().map(|backend| async move {
            let start = Instant::now();
            let outcome = tokio::time::timeout(timeout, backend.predict(signal))
                .await
                .unwrap_or_else(|_| {
                    Err(ClassifierError::timeout(format!(
                        "no vote within {} ms",
                        timeout.as_millis()
                    )))
                });
            (backend.name().to_string(), outcome, start.elapsed())
        });

        let mut votes = Vec::with_capacity(backends.len());
        for (name, outcome, elapsed) in join_all(predictions).await {
            match outcome {
                Ok(mut vote) => {
                    vote.confidence = crate::confidence::clamp(vote.confidence);
                    vote.processing_time_ms = elapsed.as_millis() as u64;
                    votes.push(vote);
                }
                Err(e) => {
                    warn!(
                        backend = %name,
                        message_id = %signal.message_id,
                        error = %e,
                        "Model backend produced no vote"
                    );
                    self.record_failure();
                }
            }
        }

        let verdict = self.aggregate(votes);
        debug!(
            message_id = %signal.message_id,
            category = %verdict.category,
            aggregate_confidence = verdict.aggregate_confidence,
            share = verdict.category_share,
            consensus = verdict.consensus_reached,
            votes = verdict.contributing_votes.len(),
            "Ensemble verdict"
        );
        verdict
    }

    fn record_failure(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_backend_failure();
        }
    }

    /// Combine votes into a verdict
    ///
    /// Pure function of the votes and the configured weights. Ties between
    /// categories go to the one declared first in [`Category`].
    pub fn aggregate(&self, votes: Vec<ModelVote>) -> EnsembleVerdict {
        let mut scores: BTreeMap<Category, f64> = BTreeMap::new();
        let mut supporters: BTreeMap<Category, usize> = BTreeMap::new();
        let mut total_weight = 0.0;

        for vote in &votes {
            let weight = self.config.weight_of(&vote.model_name);
            total_weight += weight;
            *scores.entry(vote.category).or_default() += vote.confidence * weight;
            *supporters.entry(vote.category).or_default() += 1;
        }

        let score_mass: f64 = scores.values().sum();
        if votes.is_empty() || total_weight <= 0.0 || score_mass <= 0.0 {
            return EnsembleVerdict {
                contributing_votes: votes,
                ..EnsembleVerdict::empty()
            };
        }

        let mut winner = Category::Uncertain;
        let mut best = f64::NEG_INFINITY;
        for (category, score) in &scores {
            if *score > best {
                winner = *category;
                best = *score;
            }
        }

        let share = best / score_mass;
        let agreeing = supporters.get(&winner).copied().unwrap_or(0);
        let majority = !self.config.require_majority || 2 * agreeing >= votes.len();
        let consensus = share >= self.config.category_agreement_threshold && majority;

        EnsembleVerdict {
            category: winner,
            subcategory: None,
            aggregate_confidence: crate::confidence::clamp(best / total_weight),
            category_share: share,
            contributing_votes: votes,
            consensus_reached: consensus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClassifierError, Result};
    use crate::signal::RawEmail;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::time::Duration;

    struct FixedBackend(ModelVote);

    #[async_trait]
    impl ModelBackend for FixedBackend {
        fn name(&self) -> &str {
            &self.0.model_name
        }

        async fn predict(&self, _signal: &EmailSignal) -> Result<ModelVote> {
            Ok(self.0.clone())
        }
    }

    struct BrokenBackend;

    #[async_trait]
    impl ModelBackend for BrokenBackend {
        fn name(&self) -> &str {
            "broken"
        }

        async fn predict(&self, _signal: &EmailSignal) -> Result<ModelVote> {
            Err(ClassifierError::backend("broken", "model file corrupted"))
        }
    }

    struct HangingBackend;

    #[async_trait]
    impl ModelBackend for HangingBackend {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn predict(&self, _signal: &EmailSignal) -> Result<ModelVote> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ModelVote::new("hanging", Category::Spam, 1.0))
        }
    }

    fn signal() -> EmailSignal {
        let patterns = crate::config::PatternSets::default();
        crate::signal::SignalExtractor::new(
            crate::patterns::build_matcher(&patterns).unwrap(),
            patterns.risky_tlds.clone(),
            0.6,
        )
        .extract(&RawEmail::new("m1", "a@example.com", "hello", ""))
    }

    fn vote(name: &str, category: Category, confidence: f64) -> ModelVote {
        ModelVote::new(name, category, confidence)
    }

    fn fixed(name: &str, category: Category, confidence: f64) -> Arc<dyn ModelBackend> {
        Arc::new(FixedBackend(vote(name, category, confidence)))
    }

    fn fast_config() -> EnsembleConfig {
        EnsembleConfig {
            backend_timeout_ms: 50,
            ..EnsembleConfig::default()
        }
    }

    #[test]
    fn test_split_vote_has_no_consensus() {
        let voter = EnsembleVoter::new(&EnsembleConfig::default());
        let verdict = voter.aggregate(vec![
            vote("a", Category::Spam, 0.4),
            vote("b", Category::Spam, 0.3),
            vote("c", Category::Legitimate, 0.5),
        ]);

        assert_eq!(verdict.category, Category::Spam);
        assert!(!verdict.consensus_reached);
        assert!((verdict.category_share - 0.7 / 1.2).abs() < 1e-9);
        assert!((verdict.aggregate_confidence - 0.7 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_unanimous_vote_reaches_consensus() {
        let voter = EnsembleVoter::new(&EnsembleConfig::default());
        let verdict = voter.aggregate(vec![
            vote("a", Category::Phishing, 0.9),
            vote("b", Category::Phishing, 0.8),
            vote("c", Category::Phishing, 0.7),
        ]);

        assert_eq!(verdict.category, Category::Phishing);
        assert!(verdict.consensus_reached);
        assert!((verdict.aggregate_confidence - 0.8).abs() < 1e-9);
        assert_eq!(verdict.category_share, 1.0);
    }

    #[test]
    fn test_weights_shift_the_winner() {
        let mut config = EnsembleConfig::default();
        config.model_weights.insert("forest".to_string(), 3.0);
        let voter = EnsembleVoter::new(&config);

        let verdict = voter.aggregate(vec![
            vote("keyword", Category::Legitimate, 0.6),
            vote("naive_bayes", Category::Legitimate, 0.6),
            vote("forest", Category::Spam, 0.8),
        ]);
        assert_eq!(verdict.category, Category::Spam);
        // 2.4 of 3.6 score mass, but only one of three votes
        assert!(!verdict.consensus_reached);

        let relaxed = EnsembleVoter::new(&EnsembleConfig {
            require_majority: false,
            ..config
        });
        let verdict = relaxed.aggregate(vec![
            vote("keyword", Category::Legitimate, 0.6),
            vote("naive_bayes", Category::Legitimate, 0.6),
            vote("forest", Category::Spam, 0.8),
        ]);
        assert!(verdict.consensus_reached);
    }

    #[test]
    fn test_ties_prefer_earlier_category() {
        let voter = EnsembleVoter::new(&EnsembleConfig::default());
        let verdict = voter.aggregate(vec![
            vote("a", Category::Spam, 0.5),
            vote("b", Category::Legitimate, 0.5),
        ]);
        assert_eq!(verdict.category, Category::Legitimate);
    }

    #[test]
    fn test_no_votes_is_uncertain() {
        let voter = EnsembleVoter::new(&EnsembleConfig::default());
        let verdict = voter.aggregate(Vec::new());
        assert_eq!(verdict, EnsembleVerdict::empty());
    }

    #[tokio::test]
    async fn test_failing_backends_are_isolated() {
        let metrics = Arc::new(EngineMetrics::new());
        let voter = EnsembleVoter::new(&fast_config()).with_metrics(metrics.clone());
        let backends = vec![
            fixed("keyword", Category::Spam, 0.9),
            Arc::new(BrokenBackend) as Arc<dyn ModelBackend>,
            fixed("forest", Category::Spam, 0.8),
            Arc::new(HangingBackend) as Arc<dyn ModelBackend>,
        ];

        let verdict = voter.vote(&signal(), &backends).await;
        assert_eq!(verdict.category, Category::Spam);
        assert!(verdict.consensus_reached);
        assert_eq!(verdict.contributing_votes.len(), 2);
        assert_eq!(verdict.contributing_votes[0].model_name, "keyword");
        assert_eq!(metrics.snapshot().backend_failures, 2);
    }

    #[tokio::test]
    async fn test_all_backends_failing_is_uncertain() {
        let voter = EnsembleVoter::new(&fast_config());
        let backends: Vec<Arc<dyn ModelBackend>> =
            vec![Arc::new(BrokenBackend), Arc::new(HangingBackend)];

        let verdict = voter.vote(&signal(), &backends).await;
        assert_eq!(verdict.category, Category::Uncertain);
        assert_eq!(verdict.aggregate_confidence, 0.0);
        assert!(!verdict.consensus_reached);
    }

    fn arb_category() -> impl Strategy<Value = Category> {
        prop::sample::select(Category::ALL.to_vec())
    }

    fn arb_votes() -> impl Strategy<Value = Vec<(Category, f64)>> {
        prop::collection::vec((arb_category(), 0.0f64..=1.0), 1..6)
    }

    proptest! {
        #[test]
        fn prop_aggregate_is_deterministic(votes in arb_votes()) {
            let voter = EnsembleVoter::new(&EnsembleConfig::default());
            let build = || votes
                .iter()
                .enumerate()
                .map(|(i, (c, p))| vote(&format!("m{i}"), *c, *p))
                .collect::<Vec<_>>();

            let first = voter.aggregate(build());
            let second = voter.aggregate(build());
            prop_assert_eq!(&first, &second);
            prop_assert!((0.0..=1.0).contains(&first.aggregate_confidence));
            prop_assert!(first.aggregate_confidence <= first.category_share + 1e-9);
        }

        #[test]
        fn prop_failed_backend_contributes_nothing(votes in arb_votes(), position in 0usize..6) {
            let voter = EnsembleVoter::new(&fast_config());
            let mut backends: Vec<Arc<dyn ModelBackend>> = votes
                .iter()
                .enumerate()
                .map(|(i, (c, p))| fixed(&format!("m{i}"), *c, *p))
                .collect();
            let without_failure = voter.aggregate(
                votes
                    .iter()
                    .enumerate()
                    .map(|(i, (c, p))| vote(&format!("m{i}"), *c, *p))
                    .collect(),
            );
            backends.insert(position.min(backends.len()), Arc::new(BrokenBackend));

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let mut with_failure = runtime.block_on(voter.vote(&signal(), &backends));
            with_failure
                .contributing_votes
                .iter_mut()
                .for_each(|v| v.processing_time_ms = 0);

            prop_assert_eq!(with_failure.category, without_failure.category);
            prop_assert_eq!(with_failure.consensus_reached, without_failure.consensus_reached);
            prop_assert_eq!(with_failure, without_failure);
        }
    }
}
