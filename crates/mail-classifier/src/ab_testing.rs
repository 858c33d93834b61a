/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! A/B routing between two pipeline versions
//!
//! The authoritative pipeline is chosen from a stable hash of the email
//! identity, so the same email always routes the same way. In shadow mode
//! the other pipeline runs alongside under its own timeout and its outcome
//! is only recorded for comparison.

use crate::config::AbTestingConfig;
use crate::error::Result;
use crate::metrics::EngineMetrics;
use crate::pipeline::{ClassificationRequest, Pipeline};
use crate::ClassificationResult;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Pipeline whose result is returned to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectedClassifier {
    Old,
    New,
}

/// Side-by-side outcome of both pipelines for one email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRecord {
    pub email_id: String,
    pub old_version: String,
    pub new_version: String,
    /// Missing when the old pipeline failed or timed out as the shadow
    pub old_result: Option<ClassificationResult>,
    /// Missing when the new pipeline failed or timed out as the shadow
    pub new_result: Option<ClassificationResult>,
    /// Both results present and leading to the same outcome
    pub agreed: bool,
    pub selected_classifier: SelectedClassifier,
    pub recorded_at: DateTime<Utc>,
}

/// Destination of comparison records
pub trait ComparisonSink: Send + Sync {
    fn record(&self, record: ComparisonRecord);
}

/// In-memory comparison sink
#[derive(Debug, Default)]
pub struct MemoryComparisonSink {
    records: Mutex<Vec<ComparisonRecord>>,
}

impl MemoryComparisonSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ComparisonRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl ComparisonSink for MemoryComparisonSink {
    fn record(&self, record: ComparisonRecord) {
        self.records.lock().push(record);
    }
}

/// Routing and agreement counters
#[derive(Debug, Default)]
pub struct AbTestStats {
    routed_old: AtomicU64,
    routed_new: AtomicU64,
    comparisons: AtomicU64,
    agreements: AtomicU64,
    shadow_failures: AtomicU64,
}

impl AbTestStats {
    pub fn routed_old(&self) -> u64 {
        self.routed_old.load(Ordering::Relaxed)
    }

    pub fn routed_new(&self) -> u64 {
        self.routed_new.load(Ordering::Relaxed)
    }

    pub fn comparisons(&self) -> u64 {
        self.comparisons.load(Ordering::Relaxed)
    }

    pub fn shadow_failures(&self) -> u64 {
        self.shadow_failures.load(Ordering::Relaxed)
    }

    /// Share of complete comparisons where both pipelines agreed
    pub fn agreement_rate(&self) -> Option<f64> {
        let comparisons = self.comparisons();
        if comparisons == 0 {
            None
        } else {
            Some(self.agreements.load(Ordering::Relaxed) as f64 / comparisons as f64)
        }
    }
}

/// Routing bucket of an email identity (0 to 99)
pub fn bucket(identity: &str) -> u8 {
    (xxhash_rust::xxh3::xxh3_64(identity.as_bytes()) % 100) as u8
}

/// Pipeline selected for an identity at a rollout percentage
pub fn select_classifier(identity: &str, rollout_percent: u8) -> SelectedClassifier {
    if bucket(identity) < rollout_percent.min(100) {
        SelectedClassifier::New
    } else {
        SelectedClassifier::Old
    }
}

/// A/B router
pub struct AbRouter {
    config: AbTestingConfig,
    old: Arc<dyn Pipeline>,
    new: Arc<dyn Pipeline>,
    sink: Option<Arc<dyn ComparisonSink>>,
    stats: AbTestStats,
    metrics: Option<Arc<EngineMetrics>>,
}

impl AbRouter {
    /// Create a router between an old and a new pipeline
    pub fn new(config: &AbTestingConfig, old: Arc<dyn Pipeline>, new: Arc<dyn Pipeline>) -> Self {
        Self {
            config: config.clone(),
            old,
            new,
            sink: None,
            stats: AbTestStats::default(),
            metrics: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ComparisonSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn stats(&self) -> &AbTestStats {
        &self.stats
    }

    /// Pipeline that answers for an identity
    ///
    /// Always the old pipeline while A/B testing is disabled.
    pub fn select(&self, identity: &str) -> SelectedClassifier {
        if self.config.enabled {
            select_classifier(identity, self.config.rollout_percent)
        } else {
            SelectedClassifier::Old
        }
    }

    /// Classify with the selected pipeline, shadowing the other when enabled
    ///
    /// Errors of the selected pipeline are returned; errors and timeouts of
    /// the shadow only leave its side of the record empty.
    pub async fn route_and_classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<(ClassificationResult, Option<ComparisonRecord>)> {
        let identity = request.email.identity();
        let selected = self.select(&identity);
        let (primary, shadow) = match selected {
            SelectedClassifier::Old => {
                self.stats.routed_old.fetch_add(1, Ordering::Relaxed);
                (&self.old, &self.new)
            }
            SelectedClassifier::New => {
                self.stats.routed_new.fetch_add(1, Ordering::Relaxed);
                (&self.new, &self.old)
            }
        };

        if !(self.config.enabled && self.config.shadow_mode) {
            let result = primary.classify_request(request).await?;
            return Ok((result, None));
        }

        let shadow_run = tokio::time::timeout(
            self.config.shadow_timeout(),
            shadow.classify_request(request),
        );
        let (primary_result, shadow_result) =
            tokio::join!(primary.classify_request(request), shadow_run);
        let primary_result = primary_result?;

        let shadow_result = match shadow_result {
            Ok(Ok(result)) => Some(result),
            Ok(Err(e)) => {
                warn!(
                    email_id = %identity,
                    pipeline = %shadow.version(),
                    error = %e,
                    "Shadow pipeline failed"
                );
                self.record_shadow_failure();
                None
            }
            Err(_) => {
                warn!(
                    email_id = %identity,
                    pipeline = %shadow.version(),
                    timeout_ms = self.config.shadow_timeout_ms,
                    "Shadow pipeline timed out"
                );
                self.record_shadow_failure();
                None
            }
        };

        let agreed = shadow_result
            .as_ref()
            .is_some_and(|shadow| shadow.agrees_with(&primary_result));
        if shadow_result.is_some() {
            self.stats.comparisons.fetch_add(1, Ordering::Relaxed);
            if agreed {
                self.stats.agreements.fetch_add(1, Ordering::Relaxed);
            }
        }

        let (old_result, new_result) = match selected {
            SelectedClassifier::Old => (Some(primary_result.clone()), shadow_result),
            SelectedClassifier::New => (shadow_result, Some(primary_result.clone())),
        };

        let record = ComparisonRecord {
            email_id: identity,
            old_version: self.old.version(),
            new_version: self.new.version(),
            old_result,
            new_result,
            agreed,
            selected_classifier: selected,
            recorded_at: Utc::now(),
        };

        debug!(
            email_id = %record.email_id,
            selected = ?selected,
            agreed,
            "A/B comparison recorded"
        );

        if let Some(sink) = &self.sink {
            sink.record(record.clone());
        }

        Ok((primary_result, Some(record)))
    }

    fn record_shadow_failure(&self) {
        self.stats.shadow_failures.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_shadow_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClassifierError;
    use crate::overrides::AuthResult;
    use crate::signal::RawEmail;
    use crate::{Action, Category, Tier};
    use async_trait::async_trait;
    use std::time::Duration;

    struct FixedPipeline {
        version: &'static str,
        category: Category,
        action: Action,
    }

    #[async_trait]
    impl Pipeline for FixedPipeline {
        fn version(&self) -> String {
            self.version.to_string()
        }

        async fn classify_request(
            &self,
            _request: &ClassificationRequest,
        ) -> Result<ClassificationResult> {
            Ok(ClassificationResult {
                final_category: self.category,
                subcategory: None,
                confidence: 0.8,
                action: self.action,
                tier_used: Tier::Tier3Ensemble,
                override_reason: None,
                reasons: vec![self.version.to_string()],
            })
        }
    }

    struct BrokenPipeline;

    #[async_trait]
    impl Pipeline for BrokenPipeline {
        fn version(&self) -> String {
            "broken".to_string()
        }

        async fn classify_request(
            &self,
            _request: &ClassificationRequest,
        ) -> Result<ClassificationResult> {
            Err(ClassifierError::Pipeline("model server gone".to_string()))
        }
    }

    struct SlowPipeline;

    #[async_trait]
    impl Pipeline for SlowPipeline {
        fn version(&self) -> String {
            "slow".to_string()
        }

        async fn classify_request(
            &self,
            _request: &ClassificationRequest,
        ) -> Result<ClassificationResult> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ClassificationResult::fail_closed("late"))
        }
    }

    fn old_pipeline() -> Arc<dyn Pipeline> {
        Arc::new(FixedPipeline {
            version: "v1",
            category: Category::Spam,
            action: Action::Delete,
        })
    }

    fn new_pipeline() -> Arc<dyn Pipeline> {
        Arc::new(FixedPipeline {
            version: "v2",
            category: Category::Spam,
            action: Action::Delete,
        })
    }

    fn request(id: &str) -> ClassificationRequest {
        ClassificationRequest::new(
            RawEmail::new(id, "a@example.com", "hello", ""),
            "gmail",
            AuthResult::unauthenticated(),
        )
    }

    fn shadow_config(rollout_percent: u8) -> AbTestingConfig {
        AbTestingConfig {
            enabled: true,
            rollout_percent,
            shadow_mode: true,
            shadow_timeout_ms: 50,
        }
    }

    #[test]
    fn test_rollout_extremes() {
        for i in 0..200 {
            let id = format!("msg-{i}");
            assert_eq!(select_classifier(&id, 0), SelectedClassifier::Old);
            assert_eq!(select_classifier(&id, 100), SelectedClassifier::New);
        }
    }

    #[test]
    fn test_selection_is_stable() {
        for i in 0..200 {
            let id = format!("<{i}@mail.example.com>");
            let first = select_classifier(&id, 30);
            for _ in 0..5 {
                assert_eq!(select_classifier(&id, 30), first);
            }
        }
    }

    #[test]
    fn test_rollout_roughly_matches_share() {
        let new = (0..10_000)
            .filter(|i| select_classifier(&format!("id-{i}"), 25) == SelectedClassifier::New)
            .count();
        assert!((2_000..3_000).contains(&new), "routed {new} of 10000");
    }

    #[tokio::test]
    async fn test_disabled_router_uses_old_pipeline() {
        let router = AbRouter::new(&AbTestingConfig::default(), old_pipeline(), new_pipeline());
        let (result, record) = router.route_and_classify(&request("m1")).await.unwrap();
        assert_eq!(result.reasons, vec!["v1".to_string()]);
        assert!(record.is_none());
        assert_eq!(router.stats().routed_old(), 1);
    }

    #[tokio::test]
    async fn test_shadow_mode_records_agreement() {
        let sink = Arc::new(MemoryComparisonSink::new());
        let router = AbRouter::new(&shadow_config(100), old_pipeline(), new_pipeline())
            .with_sink(sink.clone());

        let (result, record) = router.route_and_classify(&request("m1")).await.unwrap();
        let record = record.unwrap();

        assert_eq!(result.reasons, vec!["v2".to_string()]);
        assert_eq!(record.selected_classifier, SelectedClassifier::New);
        assert!(record.agreed);
        assert!(record.old_result.is_some());
        assert_eq!(sink.len(), 1);
        assert_eq!(router.stats().agreement_rate(), Some(1.0));
    }

    #[tokio::test]
    async fn test_shadow_disagreement() {
        let lenient: Arc<dyn Pipeline> = Arc::new(FixedPipeline {
            version: "v2",
            category: Category::Promotional,
            action: Action::Preserve,
        });
        let router = AbRouter::new(&shadow_config(0), old_pipeline(), lenient);

        let (result, record) = router.route_and_classify(&request("m2")).await.unwrap();
        assert_eq!(result.action, Action::Delete);
        assert!(!record.unwrap().agreed);
        assert_eq!(router.stats().agreement_rate(), Some(0.0));
    }

    #[tokio::test]
    async fn test_shadow_failure_is_not_propagated() {
        let metrics = Arc::new(EngineMetrics::new());
        let router = AbRouter::new(&shadow_config(0), old_pipeline(), Arc::new(BrokenPipeline))
            .with_metrics(metrics.clone());

        let (result, record) = router.route_and_classify(&request("m3")).await.unwrap();
        let record = record.unwrap();
        assert_eq!(result.action, Action::Delete);
        assert!(record.new_result.is_none());
        assert!(!record.agreed);
        assert_eq!(router.stats().shadow_failures(), 1);
        assert_eq!(router.stats().agreement_rate(), None);
        assert_eq!(metrics.snapshot().shadow_failures, 1);
    }

    #[tokio::test]
    async fn test_shadow_timeout_is_bounded() {
        let router = AbRouter::new(&shadow_config(0), old_pipeline(), Arc::new(SlowPipeline));

        let started = std::time::Instant::now();
        let (_, record) = router.route_and_classify(&request("m4")).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(record.unwrap().new_result.is_none());
    }

    #[tokio::test]
    async fn test_primary_failure_is_propagated() {
        let router = AbRouter::new(&shadow_config(0), Arc::new(BrokenPipeline), new_pipeline());
        assert!(router.route_and_classify(&request("m5")).await.is_err());
    }
}
