/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Pipeline orchestration
//!
//! A [`ClassificationPipeline`] is an immutable snapshot of every stage built
//! from one [`EngineConfig`]. The [`ClassificationEngine`] serves requests from
//! the current snapshot and swaps in a new one on reload; requests already in
//! flight finish on the snapshot they started with.

use crate::config::EngineConfig;
use crate::ensemble::{
    EnsembleVoter, ForestBackend, KeywordBackend, ModelBackend, NaiveBayesBackend,
};
use crate::error::Result;
use crate::geo::{GeoLookup, GeoRiskAssessor, StaticGeoLookup};
use crate::instant::{InstantClassifier, TierVerdict};
use crate::metrics::EngineMetrics;
use crate::overrides::{AuthResult, OverrideEngine};
use crate::patterns::build_matcher;
use crate::signal::{EmailSignal, RawEmail, SignalExtractor};
use crate::threshold::ThresholdResolver;
use crate::{ClassificationResult, Tier};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// One email to classify together with its delivery context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRequest {
    /// Raw email record
    pub email: RawEmail,
    /// Mailbox provider, selects provider thresholds
    pub provider: String,
    /// Sender authentication outcome
    pub auth: AuthResult,
}

impl ClassificationRequest {
    pub fn new<T: Into<String>>(email: RawEmail, provider: T, auth: AuthResult) -> Self {
        Self {
            email,
            provider: provider.into(),
            auth,
        }
    }
}

/// A complete classifier that can be put behind the A/B router
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Version label used in comparison records
    fn version(&self) -> String;

    /// Classify one request
    async fn classify_request(
        &self,
        request: &ClassificationRequest,
    ) -> Result<ClassificationResult>;
}

/// Immutable set of classification stages
pub struct ClassificationPipeline {
    version: String,
    config: EngineConfig,
    extractor: SignalExtractor,
    instant: InstantClassifier,
    geo: GeoRiskAssessor,
    geo_lookup: Arc<dyn GeoLookup>,
    voter: EnsembleVoter,
    backends: Vec<Arc<dyn ModelBackend>>,
    resolver: ThresholdResolver,
    overrides: OverrideEngine,
    metrics: Arc<EngineMetrics>,
}

impl ClassificationPipeline {
    /// Configuration this snapshot was built from
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Names of the ensemble backends, in voting order
    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// Derive the signal bundle of a raw email
    pub fn extract(&self, email: &RawEmail) -> EmailSignal {
        self.extractor.extract(email)
    }

    /// Classify a raw email
    pub async fn classify(
        &self,
        email: &RawEmail,
        provider: &str,
        auth: &AuthResult,
    ) -> ClassificationResult {
        let signal = self.extract(email);
        self.classify_signal(&signal, provider, auth).await
    }

    /// Run the tiers, threshold resolution and overrides over a signal
    pub async fn classify_signal(
        &self,
        signal: &EmailSignal,
        provider: &str,
        auth: &AuthResult,
    ) -> ClassificationResult {
        let start = Instant::now();

        let result = self.decide(signal, provider).await;
        let result = self
            .overrides
            .apply_overrides(result, signal, auth, &self.config.whitelist);

        let elapsed_ms = start.elapsed().as_millis() as u64;
        self.metrics
            .record_classification(result.tier_used, result.action, elapsed_ms);

        debug!(
            message_id = %signal.message_id,
            pipeline = %self.version,
            category = %result.final_category,
            action = ?result.action,
            tier = ?result.tier_used,
            confidence = result.confidence,
            elapsed_ms,
            "Email classified"
        );

        result
    }

    async fn decide(&self, signal: &EmailSignal, provider: &str) -> ClassificationResult {
        let (instant, conclusive) = self.instant.classify(signal);
        if conclusive {
            return self.resolve_tier(instant, "tier1_instant", Tier::Tier1, provider);
        }
        let mut reasons = instant.evidence;

        if self.config.geo.enabled {
            let (geo, conclusive) = self.geo.assess_risk(signal, self.geo_lookup.as_ref()).await;
            if conclusive {
                let result = self.resolve_tier(geo, "tier2_geo", Tier::Tier2, provider);
                reasons.extend(result.reasons);
                return ClassificationResult { reasons, ..result };
            }
            reasons.extend(geo.evidence);
        }

        let verdict = self.voter.vote(signal, &self.backends).await;
        let result = self.resolver.resolve(&verdict, provider);
        for vote in &verdict.contributing_votes {
            reasons.push(format!(
                "{} voted {} ({:.2})",
                vote.model_name, vote.category, vote.confidence
            ));
        }
        if verdict.contributing_votes.is_empty() {
            reasons.push("no model backend produced a vote".to_string());
        }
        reasons.extend(result.reasons);
        ClassificationResult { reasons, ..result }
    }

    fn resolve_tier(
        &self,
        verdict: TierVerdict,
        source: &str,
        tier: Tier,
        provider: &str,
    ) -> ClassificationResult {
        let evidence = verdict.evidence.clone();
        let result = self
            .resolver
            .resolve(&verdict.into_ensemble_verdict(source), provider)
            .with_tier(tier);
        let mut reasons = evidence;
        reasons.extend(result.reasons);
        ClassificationResult { reasons, ..result }
    }
}

#[async_trait]
impl Pipeline for ClassificationPipeline {
    fn version(&self) -> String {
        self.version.clone()
    }

    async fn classify_request(
        &self,
        request: &ClassificationRequest,
    ) -> Result<ClassificationResult> {
        Ok(self
            .classify(&request.email, &request.provider, &request.auth)
            .await)
    }
}

/// Builder for engines and standalone pipelines
pub struct EngineBuilder {
    config: EngineConfig,
    version: Option<String>,
    geo_lookup: Option<Arc<dyn GeoLookup>>,
    backends: Vec<Arc<dyn ModelBackend>>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            version: None,
            geo_lookup: None,
            backends: Vec::new(),
            metrics: None,
        }
    }

    /// Label the pipeline, defaults to the pattern set version
    pub fn with_version<T: Into<String>>(mut self, version: T) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Replace the built-in static GeoIP table
    pub fn with_geo_lookup(mut self, lookup: Arc<dyn GeoLookup>) -> Self {
        self.geo_lookup = Some(lookup);
        self
    }

    /// Add a model backend after the configured ones
    pub fn with_backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Share a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build a standalone pipeline snapshot
    pub fn build_pipeline(self) -> Result<ClassificationPipeline> {
        let metrics = self.metrics.unwrap_or_default();
        build_snapshot(
            self.config,
            self.version,
            self.geo_lookup,
            &self.backends,
            metrics,
        )
    }

    /// Build an engine serving the configured snapshot
    pub fn build(self) -> Result<ClassificationEngine> {
        let metrics = self.metrics.unwrap_or_default();
        let pipeline = build_snapshot(
            self.config,
            self.version.clone(),
            self.geo_lookup.clone(),
            &self.backends,
            metrics.clone(),
        )?;

        Ok(ClassificationEngine {
            current: RwLock::new(Arc::new(pipeline)),
            version: self.version,
            geo_lookup: self.geo_lookup,
            extra_backends: self.backends,
            metrics,
        })
    }
}

fn build_snapshot(
    config: EngineConfig,
    version: Option<String>,
    geo_lookup: Option<Arc<dyn GeoLookup>>,
    extra_backends: &[Arc<dyn ModelBackend>],
    metrics: Arc<EngineMetrics>,
) -> Result<ClassificationPipeline> {
    config.validate()?;

    let matcher = build_matcher(&config.patterns)?;
    let extractor = SignalExtractor::new(
        matcher.clone(),
        config.patterns.risky_tlds.clone(),
        config.instant.gibberish_threshold,
    );
    let instant = InstantClassifier::new(&config.instant, matcher.clone());
    let geo = GeoRiskAssessor::new(&config.geo)?.with_metrics(metrics.clone());
    let geo_lookup: Arc<dyn GeoLookup> = match geo_lookup {
        Some(lookup) => lookup,
        None => Arc::new(StaticGeoLookup::new(&config.geo.static_table)?),
    };

    let mut backends: Vec<Arc<dyn ModelBackend>> = Vec::new();
    if config.ensemble.keyword.enabled {
        backends.push(Arc::new(KeywordBackend::new(
            &config.ensemble.keyword,
            matcher.clone(),
        )));
    }
    if let Some(path) = &config.ensemble.naive_bayes_model {
        backends.push(Arc::new(NaiveBayesBackend::load(path)?));
    }
    if let Some(path) = &config.ensemble.forest_model {
        backends.push(Arc::new(ForestBackend::load(path)?));
    }
    backends.extend(extra_backends.iter().cloned());

    let voter = EnsembleVoter::new(&config.ensemble).with_metrics(metrics.clone());
    let resolver = ThresholdResolver::new(&config.thresholds);
    let overrides = OverrideEngine::new(&config.business);
    let version = version.unwrap_or_else(|| config.patterns.version.clone());

    info!(
        pipeline = %version,
        matcher = matcher.name(),
        backends = backends.len(),
        whitelist = config.whitelist.len(),
        geo_enabled = config.geo.enabled,
        "Classification pipeline built"
    );

    Ok(ClassificationPipeline {
        version,
        config,
        extractor,
        instant,
        geo,
        geo_lookup,
        voter,
        backends,
        resolver,
        overrides,
        metrics,
    })
}

/// Classification engine serving the current configuration snapshot
pub struct ClassificationEngine {
    current: RwLock<Arc<ClassificationPipeline>>,
    version: Option<String>,
    geo_lookup: Option<Arc<dyn GeoLookup>>,
    extra_backends: Vec<Arc<dyn ModelBackend>>,
    metrics: Arc<EngineMetrics>,
}

impl ClassificationEngine {
    /// Start building an engine
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<ClassificationPipeline> {
        self.current.read().clone()
    }

    /// Engine metrics
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    /// Replace the configuration
    ///
    /// The new snapshot is built completely before it is swapped in. On error
    /// the current snapshot stays active.
    pub fn reload(&self, config: EngineConfig) -> Result<()> {
        let pipeline = build_snapshot(
            config,
            self.version.clone(),
            self.geo_lookup.clone(),
            &self.extra_backends,
            self.metrics.clone(),
        )?;
        let version = pipeline.version.clone();
        *self.current.write() = Arc::new(pipeline);
        info!(pipeline = %version, "Classification engine reloaded");
        Ok(())
    }

    /// Classify a raw email
    pub async fn classify(
        &self,
        email: &RawEmail,
        provider: &str,
        auth: &AuthResult,
    ) -> ClassificationResult {
        self.snapshot().classify(email, provider, auth).await
    }

    /// Classify an already extracted signal
    pub async fn classify_signal(
        &self,
        signal: &EmailSignal,
        provider: &str,
        auth: &AuthResult,
    ) -> ClassificationResult {
        self.snapshot().classify_signal(signal, provider, auth).await
    }
}

#[async_trait]
impl Pipeline for ClassificationEngine {
    /// Version of the snapshot currently served
    fn version(&self) -> String {
        self.current.read().version.clone()
    }

    async fn classify_request(
        &self,
        request: &ClassificationRequest,
    ) -> Result<ClassificationResult> {
        Ok(self
            .classify(&request.email, &request.provider, &request.auth)
            .await)
    }
}
