/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! # A3Mailer Mail Classifier
//!
//! Multi-tier spam and threat classification engine. For each incoming email
//! it decides whether the message is a threat or legitimate, assigns a
//! category and produces the confidence used to choose between deletion and
//! preservation.
//!
//! ## Architecture
//!
//! Classification runs through escalating tiers:
//! - Signal extraction: sender, domain, TLD, sender IP, keyword hits
//! - Tier 1: instant pattern, keyword and TLD matching
//! - Tier 2: geographic risk from IP ranges and country codes
//! - Tier 3: weighted ensemble voting across model backends
//! - Threshold resolution with provider and category thresholds
//! - Whitelist and business sender overrides, which always run last
//!
//! An A/B router can wrap two pipeline versions and run the alternate one in
//! shadow mode.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mail_classifier::{AuthResult, ClassificationEngine, EngineConfig, RawEmail};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::load("classifier.toml")?;
//!     let engine = ClassificationEngine::builder(config).build()?;
//!
//!     let email = RawEmail::new("msg-1", "win@lottery.tk", "You won! Claim now", "");
//!     let result = engine.classify(&email, "gmail", &AuthResult::unauthenticated()).await;
//!     println!("{:?} -> {:?}", result.final_category, result.action);
//!
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub mod ab_testing;
pub mod batch;
pub mod confidence;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod geo;
pub mod instant;
pub mod metrics;
pub mod overrides;
pub mod patterns;
pub mod pipeline;
pub mod signal;
pub mod threshold;

pub use ab_testing::{
    AbRouter, AbTestStats, ComparisonRecord, ComparisonSink, MemoryComparisonSink,
    SelectedClassifier,
};
pub use batch::{BatchClassifier, BatchItem};
pub use config::{
    AbTestingConfig, BatchConfig, BusinessSenderConfig, EngineConfig, EnsembleConfig, GeoConfig,
    InstantConfig, MatcherKind, PatternSets, ThresholdPolicy, WhitelistEntry,
};
pub use ensemble::{
    EnsembleVerdict, EnsembleVoter, ForestBackend, KeywordBackend, ModelBackend, ModelVote,
    NaiveBayesBackend,
};
pub use error::{ClassifierError, Result};
pub use geo::{GeoLookup, GeoRiskAssessor, IpRange, StaticGeoLookup};
pub use instant::{InstantClassifier, TierVerdict};
pub use metrics::{DetectionStats, EngineMetrics};
pub use overrides::{AuthResult, OverrideEngine};
pub use patterns::{PatternMatcher, RegexPatternMatcher, SubstringPatternMatcher};
pub use pipeline::{
    ClassificationEngine, ClassificationPipeline, ClassificationRequest, EngineBuilder, Pipeline,
};
pub use signal::{EmailSignal, RawEmail, SignalExtractor};
pub use threshold::ThresholdResolver;

/// Email categories
///
/// Variant order is the tie-break order when two categories score equally,
/// so `Legitimate` wins every tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    /// Legitimate personal or transactional mail
    Legitimate,
    /// Bulk marketing from a legitimate sender
    Promotional,
    /// Credential and payment phishing
    Phishing,
    /// Prize, lottery and sweepstake scams
    PrizeLottery,
    /// Adult and explicit content
    Adult,
    /// Dating and relationship scams
    Dating,
    /// Pharmaceutical and medical spam
    Health,
    /// Investment, crypto and loan spam
    Financial,
    /// Work-from-home and get-rich-quick schemes
    BusinessOpportunity,
    /// Spam without a more specific category
    Spam,
    /// Not enough evidence either way
    Uncertain,
}

impl Category {
    /// All categories in tie-break order
    pub const ALL: [Category; 11] = [
        Category::Legitimate,
        Category::Promotional,
        Category::Phishing,
        Category::PrizeLottery,
        Category::Adult,
        Category::Dating,
        Category::Health,
        Category::Financial,
        Category::BusinessOpportunity,
        Category::Spam,
        Category::Uncertain,
    ];

    /// Display name, also used in configuration files
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Legitimate => "Legitimate",
            Category::Promotional => "Promotional Email",
            Category::Phishing => "Phishing",
            Category::PrizeLottery => "Prize & Lottery Scams",
            Category::Adult => "Adult & Explicit Content",
            Category::Dating => "Dating & Relationship Scams",
            Category::Health => "Health & Medical Spam",
            Category::Financial => "Financial & Investment Spam",
            Category::BusinessOpportunity => "Business Opportunity Scams",
            Category::Spam => "Spam",
            Category::Uncertain => "Uncertain",
        }
    }

    /// Whether mail in this category may be deleted
    pub fn is_deletable(&self) -> bool {
        !matches!(
            self,
            Category::Legitimate | Category::Promotional | Category::Uncertain
        )
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ClassifierError;

    fn from_str(s: &str) -> Result<Self> {
        let needle = s.trim();
        if let Some(category) = Category::ALL
            .iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(needle))
        {
            return Ok(*category);
        }

        match needle.to_ascii_lowercase().as_str() {
            "legit" | "ham" => Ok(Category::Legitimate),
            "marketing" | "promotional" => Ok(Category::Promotional),
            "lottery" | "prize" => Ok(Category::PrizeLottery),
            "adult" => Ok(Category::Adult),
            "dating" => Ok(Category::Dating),
            "health" | "pharma" => Ok(Category::Health),
            "financial" => Ok(Category::Financial),
            "business_opportunity" => Ok(Category::BusinessOpportunity),
            _ => Err(ClassifierError::config(format!("unknown category '{s}'"))),
        }
    }
}

impl Serialize for Category {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Action recommended to the deletion layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Keep the message
    Preserve,
    /// Delete the message
    Delete,
    /// Keep the message but mark it as spoofing a protected sender
    FlagSpoofed,
}

/// Stage that produced the final decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    /// Instant pattern matching
    Tier1,
    /// Geographic risk assessment
    Tier2,
    /// Ensemble voting
    #[serde(rename = "TIER3_ENSEMBLE")]
    Tier3Ensemble,
    /// Whitelist or business sender override
    Override,
}

/// Final classification of one email
///
/// This is the only artifact handed to the action layer. It records which
/// tier decided and why, so every outcome can be audited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Final category
    pub final_category: Category,
    /// Optional finer grained label
    pub subcategory: Option<String>,
    /// Confidence (0.0 to 1.0)
    pub confidence: f64,
    /// Recommended action
    pub action: Action,
    /// Tier that produced the decision
    pub tier_used: Tier,
    /// Reason of an override, if one applied
    pub override_reason: Option<String>,
    /// Audit trail of the decision
    pub reasons: Vec<String>,
}

impl ClassificationResult {
    /// Conservative result used when no usable decision exists
    pub fn fail_closed<T: Into<String>>(reason: T) -> Self {
        Self {
            final_category: Category::Uncertain,
            subcategory: None,
            confidence: 0.0,
            action: Action::Preserve,
            tier_used: Tier::Tier3Ensemble,
            override_reason: None,
            reasons: vec![reason.into()],
        }
    }

    /// Replace the tier that produced the decision
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier_used = tier;
        self
    }

    /// Append a line to the audit trail
    pub fn with_reason<T: Into<String>>(mut self, reason: T) -> Self {
        self.reasons.push(reason.into());
        self
    }

    /// Whether the recommended action deletes the message
    pub fn is_delete(&self) -> bool {
        self.action == Action::Delete
    }

    /// Whether two results lead to the same outcome
    pub fn agrees_with(&self, other: &ClassificationResult) -> bool {
        self.final_category == other.final_category && self.action == other.action
    }
}

/// Initialize a classification engine from a configuration file
pub fn init_classification_engine<P: AsRef<std::path::Path>>(
    path: P,
) -> Result<ClassificationEngine> {
    let config = EngineConfig::load(path)?;
    ClassificationEngine::builder(config).build()
}
