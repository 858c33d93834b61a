/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Bounded batch classification
//!
//! One task per email, limited by a semaphore sized to the worker count.
//! A request that fails or exceeds its budget yields a preserve result
//! instead of stalling or failing the batch.

use crate::config::BatchConfig;
use crate::error::{ClassifierError, Result};
use crate::metrics::EngineMetrics;
use crate::pipeline::{ClassificationRequest, Pipeline};
use crate::ClassificationResult;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Outcome of one email of a batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    /// Position in the submitted batch
    pub index: usize,
    pub message_id: String,
    pub result: ClassificationResult,
    /// Whether the result is a fail-closed substitute
    pub degraded: bool,
}

/// Batch classifier
pub struct BatchClassifier {
    pipeline: Arc<dyn Pipeline>,
    permits: Arc<Semaphore>,
    workers: usize,
    timeout: Duration,
    metrics: Option<Arc<EngineMetrics>>,
}

impl BatchClassifier {
    pub fn new(pipeline: Arc<dyn Pipeline>, config: &BatchConfig) -> Self {
        let workers = config.workers();
        Self {
            pipeline,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            timeout: config.request_timeout(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Classify a batch, returning items in submission order
    pub async fn classify_batch(&self, requests: Vec<ClassificationRequest>) -> Vec<BatchItem> {
        debug!(size = requests.len(), workers = self.workers, "Classifying batch");

        let mut meta = Vec::with_capacity(requests.len());
        let mut handles = Vec::with_capacity(requests.len());
        for (index, request) in requests.into_iter().enumerate() {
            meta.push((index, request.email.message_id.clone()));

            let pipeline = self.pipeline.clone();
            let permits = self.permits.clone();
            let timeout = self.timeout;
            handles.push(tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| ClassifierError::Pipeline("worker pool closed".to_string()))?;
                tokio::time::timeout(timeout, pipeline.classify_request(&request))
                    .await
                    .map_err(|_| {
                        ClassifierError::timeout(format!(
                            "classification exceeded {} ms",
                            timeout.as_millis()
                        ))
                    })?
            }));
        }

        let mut items = Vec::with_capacity(meta.len());
        for ((index, message_id), joined) in meta.into_iter().zip(join_all(handles).await) {
            let outcome: Result<ClassificationResult> = joined.unwrap_or_else(|e| {
                Err(ClassifierError::Pipeline(format!("classification task failed: {e}")))
            });
            let item = match outcome {
                Ok(result) => BatchItem {
                    index,
                    message_id,
                    result,
                    degraded: false,
                },
                Err(e) => {
                    warn!(
                        message_id = %message_id,
                        error = %e,
                        "Batch item degraded to preserve"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_failed_request();
                    }
                    BatchItem {
                        index,
                        message_id,
                        result: ClassificationResult::fail_closed(e.to_string()),
                        degraded: true,
                    }
                }
            };
            items.push(item);
        }

        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::AuthResult;
    use crate::signal::RawEmail;
    use crate::{Action, Category};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Tracks the peak number of concurrent classifications
    #[derive(Default)]
    struct CountingPipeline {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Pipeline for CountingPipeline {
        fn version(&self) -> String {
            "counting".to_string()
        }

        async fn classify_request(
            &self,
            request: &ClassificationRequest,
        ) -> Result<ClassificationResult> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            match request.email.subject.as_str() {
                "fail" => Err(ClassifierError::Pipeline("boom".to_string())),
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(ClassificationResult::fail_closed("late"))
                }
                _ => Ok(ClassificationResult::fail_closed("ok")),
            }
        }
    }

    fn request(id: usize, subject: &str) -> ClassificationRequest {
        ClassificationRequest::new(
            RawEmail::new(format!("m{id}"), "a@example.com", subject, ""),
            "gmail",
            AuthResult::unauthenticated(),
        )
    }

    fn config(workers: usize, timeout_ms: u64) -> BatchConfig {
        BatchConfig {
            max_workers: Some(workers),
            request_timeout_ms: timeout_ms,
        }
    }

    #[tokio::test]
    async fn test_batch_is_bounded_and_ordered() {
        let pipeline = Arc::new(CountingPipeline::default());
        let batch = BatchClassifier::new(pipeline.clone(), &config(2, 1_000));

        let requests = (0..8).map(|i| request(i, "hello")).collect();
        let items = batch.classify_batch(requests).await;

        assert_eq!(items.len(), 8);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.index, i);
            assert_eq!(item.message_id, format!("m{i}"));
            assert!(!item.degraded);
        }
        assert!(pipeline.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failures_and_timeouts_degrade_to_preserve() {
        let metrics = Arc::new(EngineMetrics::new());
        let batch = BatchClassifier::new(Arc::new(CountingPipeline::default()), &config(4, 100))
            .with_metrics(metrics.clone());

        let items = batch
            .classify_batch(vec![request(0, "hello"), request(1, "fail"), request(2, "hang")])
            .await;

        assert!(!items[0].degraded);
        assert!(items[1].degraded);
        assert!(items[2].degraded);
        for item in &items[1..] {
            assert_eq!(item.result.action, Action::Preserve);
            assert_eq!(item.result.final_category, Category::Uncertain);
        }
        assert!(items[1].result.reasons[0].starts_with("Pipeline error"));
        assert_eq!(
            items[2].result.reasons,
            vec!["Timeout: classification exceeded 100 ms".to_string()]
        );
        assert_eq!(metrics.snapshot().failed_requests, 2);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let batch = BatchClassifier::new(Arc::new(CountingPipeline::default()), &config(1, 100));
        assert!(batch.classify_batch(Vec::new()).await.is_empty());
    }
}
