/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! End-to-end classification scenarios

use async_trait::async_trait;
use mail_classifier::{
    init_classification_engine, AbRouter, AbTestingConfig, Action, AuthResult, Category,
    ClassificationEngine, ClassificationRequest, EmailSignal, EngineConfig, MemoryComparisonSink,
    ModelBackend, ModelVote, Pipeline, RawEmail, Result, Tier, WhitelistEntry,
};
use std::io::Write;
use std::sync::Arc;

struct FixedBackend {
    name: &'static str,
    category: Category,
    confidence: f64,
}

#[async_trait]
impl ModelBackend for FixedBackend {
    fn name(&self) -> &str {
        self.name
    }

    async fn predict(&self, _signal: &EmailSignal) -> Result<ModelVote> {
        Ok(ModelVote::new(self.name, self.category, self.confidence))
    }
}

fn backend(name: &'static str, category: Category, confidence: f64) -> Arc<dyn ModelBackend> {
    Arc::new(FixedBackend {
        name,
        category,
        confidence,
    })
}

/// Engine whose ensemble consists only of the given backends
fn engine_with(config: EngineConfig, backends: Vec<Arc<dyn ModelBackend>>) -> ClassificationEngine {
    let mut config = config;
    config.ensemble.keyword.enabled = false;
    backends
        .into_iter()
        .fold(ClassificationEngine::builder(config), |builder, b| {
            builder.with_backend(b)
        })
        .build()
        .unwrap()
}

fn trusted_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.whitelist.push(WhitelistEntry::new("user@trusted.org"));
    config
}

fn trusted_email() -> RawEmail {
    RawEmail::new(
        "<a1@trusted.org>",
        "User <user@trusted.org>",
        "Quarterly report attached",
        "Received: from mx.trusted.org (mx.trusted.org [10.0.0.5])",
    )
}

#[tokio::test]
async fn tier1_catches_lottery_scam() {
    let engine = ClassificationEngine::builder(EngineConfig::default())
        .build()
        .unwrap();

    let result = engine
        .classify(
            &RawEmail::new("m1", "win@lottery.tk", "You won $1,000,000! Claim now", ""),
            "gmail",
            &AuthResult::unauthenticated(),
        )
        .await;

    assert_eq!(result.tier_used, Tier::Tier1);
    assert_eq!(result.final_category.to_string(), "Prize & Lottery Scams");
    assert_eq!(result.action, Action::Delete);
}

#[tokio::test]
async fn authenticated_whitelist_overrides_phishing_verdict() {
    let engine = engine_with(
        trusted_config(),
        vec![backend("phish_model", Category::Phishing, 0.95)],
    );

    let result = engine
        .classify(
            &trusted_email(),
            "gmail",
            &AuthResult::authentic("spf=pass dkim=pass"),
        )
        .await;

    assert_eq!(result.action, Action::Preserve);
    assert_eq!(result.tier_used, Tier::Override);
    assert_eq!(
        result.override_reason.as_deref(),
        Some("authenticated_whitelist")
    );
}

#[tokio::test]
async fn unauthenticated_whitelist_sender_is_flagged() {
    let engine = engine_with(
        trusted_config(),
        vec![backend("phish_model", Category::Phishing, 0.95)],
    );

    let result = engine
        .classify(&trusted_email(), "gmail", &AuthResult::unauthenticated())
        .await;

    assert_eq!(result.action, Action::FlagSpoofed);
    assert!(result.confidence >= 0.9);
    assert_eq!(
        result.override_reason.as_deref(),
        Some("spoofed_whitelist_sender")
    );
}

#[tokio::test]
async fn soft_whitelist_entry_still_requires_authentication() {
    let mut config = EngineConfig::default();
    config.whitelist.push(WhitelistEntry {
        match_value: "user@trusted.org".to_string(),
        authentication_required: false,
    });
    let engine = engine_with(config, vec![backend("phish_model", Category::Phishing, 0.95)]);

    let result = engine
        .classify(&trusted_email(), "gmail", &AuthResult::unauthenticated())
        .await;

    assert_eq!(result.action, Action::FlagSpoofed);
    assert!(result.confidence >= 0.9);
}

#[tokio::test]
async fn brand_lookalike_phishing_is_not_rescued() {
    let engine = engine_with(
        EngineConfig::default(),
        vec![backend("phish_model", Category::Phishing, 0.97)],
    );

    for sender in [
        "paypal@paypal.com.evil-login.net",
        "paypal-security@paypal-account-verify.com",
    ] {
        let result = engine
            .classify(
                &RawEmail::new("m5", sender, "Hello", ""),
                "gmail",
                &AuthResult::unauthenticated(),
            )
            .await;

        assert_eq!(result.final_category, Category::Phishing, "{sender}");
        assert_eq!(result.action, Action::Delete, "{sender}");
        assert_eq!(result.override_reason, None, "{sender}");
    }
}

#[tokio::test]
async fn split_ensemble_preserves() {
    let engine = engine_with(
        EngineConfig::default(),
        vec![
            backend("a", Category::Spam, 0.4),
            backend("b", Category::Spam, 0.3),
            backend("c", Category::Legitimate, 0.5),
        ],
    );

    let result = engine
        .classify(
            &RawEmail::new("m2", "carol@example.org", "Catching up", ""),
            "gmail",
            &AuthResult::unauthenticated(),
        )
        .await;

    assert_eq!(result.tier_used, Tier::Tier3Ensemble);
    assert_eq!(result.action, Action::Preserve);
    assert!(result.reasons.iter().any(|r| r.contains("no consensus")));
}

#[tokio::test]
async fn ab_routing_is_stable_per_email() {
    let old: Arc<dyn Pipeline> = Arc::new(
        ClassificationEngine::builder(EngineConfig::default())
            .with_version("v1")
            .build()
            .unwrap(),
    );
    let new: Arc<dyn Pipeline> = Arc::new(
        ClassificationEngine::builder(EngineConfig::default())
            .with_version("v2")
            .build()
            .unwrap(),
    );
    let config = AbTestingConfig {
        enabled: true,
        rollout_percent: 40,
        shadow_mode: true,
        shadow_timeout_ms: 2_000,
    };
    let sink = Arc::new(MemoryComparisonSink::new());
    let router = AbRouter::new(&config, old, new).with_sink(sink.clone());

    for i in 0..20 {
        let request = ClassificationRequest::new(
            RawEmail::new(format!("<{i}@example.com>"), "a@example.com", "Hi", ""),
            "gmail",
            AuthResult::unauthenticated(),
        );
        let selected = router.select(&request.email.identity());
        for _ in 0..3 {
            let (_, record) = router.route_and_classify(&request).await.unwrap();
            let record = record.unwrap();
            assert_eq!(record.selected_classifier, selected);
            assert!(record.agreed);
        }
    }

    assert_eq!(sink.len(), 60);
    assert_eq!(router.stats().agreement_rate(), Some(1.0));
}

#[tokio::test]
async fn engine_loads_from_toml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[thresholds]
default_threshold = 95

[thresholds.per_category]
"Prize & Lottery Scams" = 99

[[whitelist]]
match_value = "trusted.org"
"#
    )
    .unwrap();

    let engine = init_classification_engine(file.path()).unwrap();
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.config().thresholds.default_threshold, 95);
    assert!(snapshot.config().whitelist[0].authentication_required);

    let result = engine
        .classify(
            &RawEmail::new("m3", "win@lottery.tk", "You won $1,000,000! Claim now", ""),
            "gmail",
            &AuthResult::unauthenticated(),
        )
        .await;
    assert_eq!(result.tier_used, Tier::Tier1);
    assert_eq!(result.action, Action::Delete);

    let spoofed = engine
        .classify(
            &RawEmail::new("m4", "ceo@trusted.org", "Wire transfer", ""),
            "gmail",
            &AuthResult::unauthenticated(),
        )
        .await;
    assert_eq!(spoofed.action, Action::FlagSpoofed);
}

#[test]
fn invalid_configuration_is_fatal() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[thresholds]\ndefault_threshold = 250\n").unwrap();

    let err = init_classification_engine(file.path()).err().unwrap();
    assert!(err.is_fatal());
}
