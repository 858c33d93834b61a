/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Configuration for the classification engine
//!
//! Configuration is loaded once per process (or per reload) from TOML and is
//! treated as an immutable snapshot afterwards. Confidence values are
//! fractions in `0.0..=1.0`; thresholds are configured as integer percentages
//! and converted with [`crate::confidence::from_percent`].

use crate::error::{ClassifierError, Result};
use crate::geo::IpRange;
use crate::Category;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level configuration of the classification engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tier-1 instant classifier
    pub instant: InstantConfig,

    /// Tier-2 geographic risk assessment
    pub geo: GeoConfig,

    /// Tier-3 ensemble voting
    pub ensemble: EnsembleConfig,

    /// Confidence thresholds
    pub thresholds: ThresholdPolicy,

    /// Administrator-managed whitelist
    pub whitelist: Vec<WhitelistEntry>,

    /// Legitimate business sender patterns
    pub business: BusinessSenderConfig,

    /// Keyword dictionaries and TLD sets
    pub patterns: PatternSets,

    /// A/B routing between classifier versions
    pub ab_testing: AbTestingConfig,

    /// Batch worker pool
    pub batch: BatchConfig,
}

/// Tier-1 instant classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstantConfig {
    /// Enable the instant tier
    pub enabled: bool,

    /// Confidence at or above which a Tier-1 verdict is conclusive
    pub instant_threshold: f64,

    /// Starting confidence once any signal is present
    pub base_confidence: f64,

    /// Confidence added per keyword hit of the winning category
    pub keyword_weight: f64,

    /// Confidence added when the TLD is in the risky set
    pub tld_risk_weight: f64,

    /// Confidence added when the domain looks machine generated
    pub gibberish_weight: f64,

    /// Gibberish score at or above which a domain is flagged
    pub gibberish_threshold: f64,
}

/// Tier-2 geographic risk configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Enable the geographic tier
    pub enabled: bool,

    /// Hard timeout for a single GeoIP lookup
    pub timeout_ms: u64,

    /// ISO country codes treated as high risk
    pub high_risk_countries: BTreeSet<String>,

    /// Suspicious IP ranges in CIDR notation
    pub suspicious_ranges: Vec<String>,

    /// Confidence of a suspicious range match
    pub range_confidence: f64,

    /// Confidence of a high-risk country match
    pub country_confidence: f64,

    /// CIDR to country table used by the built-in static lookup
    pub static_table: BTreeMap<String, String>,
}

/// Ensemble voting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Weighted share a category needs to reach consensus
    pub category_agreement_threshold: f64,

    /// Additionally require at least half of the votes to agree
    pub require_majority: bool,

    /// Weight per model name, missing models weigh 1.0
    pub model_weights: BTreeMap<String, f64>,

    /// Per-backend prediction timeout
    pub backend_timeout_ms: u64,

    /// Built-in keyword backend
    pub keyword: KeywordBackendConfig,

    /// Naive Bayes model artifact (JSON)
    pub naive_bayes_model: Option<PathBuf>,

    /// Tree ensemble model artifact (JSON)
    pub forest_model: Option<PathBuf>,
}

/// Keyword backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordBackendConfig {
    /// Enable the keyword backend
    pub enabled: bool,

    /// Confidence of a `Legitimate` vote when nothing matched
    pub clean_confidence: f64,

    /// Confidence contributed per keyword hit
    pub hit_weight: f64,

    /// Per-category multiplier applied to the hit score
    pub category_weights: BTreeMap<Category, f64>,
}

/// Threshold policy
///
/// Resolution precedence is category, then provider, then default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdPolicy {
    /// Default threshold in percent
    pub default_threshold: u8,

    /// Provider specific thresholds in percent, keyed by lower-case provider
    pub per_provider: BTreeMap<String, u8>,

    /// Category specific thresholds in percent
    pub per_category: BTreeMap<Category, u8>,

    /// Categories that must never lead to deletion
    pub disabled_categories: BTreeSet<Category>,

    /// Extra confidence required when the ensemble did not reach consensus
    pub no_consensus_margin: f64,
}

/// Whitelist entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    /// Domain (`trusted.org`) or full address (`user@trusted.org`)
    pub match_value: String,

    /// Declared authentication expectation, reported with spoofing flags
    ///
    /// Protection always requires SPF/DKIM authentication and an
    /// unauthenticated match is always flagged, whatever this says.
    #[serde(default = "default_true")]
    pub authentication_required: bool,
}

/// Legitimate business sender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessSenderConfig {
    /// Enable the business sender downgrade
    pub enabled: bool,

    /// Local-part prefixes used by legitimate bulk senders
    pub prefixes: Vec<String>,

    /// Company names, only honoured when the registrable domain carries the same name
    pub company_names: Vec<String>,
}

/// Pattern matcher implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    /// Word-bounded regular expressions
    Regex,
    /// Plain case-insensitive substrings
    Substring,
}

/// Versioned keyword dictionaries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternSets {
    /// Dictionary version, reported in logs
    pub version: String,

    /// Matcher implementation
    pub matcher: MatcherKind,

    /// Keywords per category
    pub keywords: BTreeMap<Category, Vec<String>>,

    /// Top level domains associated with throwaway registrations
    pub risky_tlds: BTreeSet<String>,
}

/// A/B testing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbTestingConfig {
    /// Enable A/B routing
    pub enabled: bool,

    /// Percentage of emails routed to the new classifier
    pub rollout_percent: u8,

    /// Run both classifiers and record comparisons
    pub shadow_mode: bool,

    /// Budget for the shadow pipeline
    pub shadow_timeout_ms: u64,
}

/// Batch worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum concurrent classifications, defaults to the CPU count
    pub max_workers: Option<usize>,

    /// Budget for a single classification
    pub request_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    /// Parse configuration from a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading classification engine configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        check_fraction("instant.instant_threshold", self.instant.instant_threshold)?;
        check_fraction("instant.base_confidence", self.instant.base_confidence)?;
        check_fraction("instant.gibberish_threshold", self.instant.gibberish_threshold)?;
        if self.instant.instant_threshold == 0.0 {
            return Err(ClassifierError::config(
                "instant.instant_threshold must be greater than zero",
            ));
        }

        check_fraction("geo.range_confidence", self.geo.range_confidence)?;
        check_fraction("geo.country_confidence", self.geo.country_confidence)?;
        for range in self.geo.suspicious_ranges.iter().chain(self.geo.static_table.keys()) {
            range.parse::<IpRange>()?;
        }

        check_fraction(
            "ensemble.category_agreement_threshold",
            self.ensemble.category_agreement_threshold,
        )?;
        check_fraction(
            "ensemble.keyword.clean_confidence",
            self.ensemble.keyword.clean_confidence,
        )?;
        for (model, weight) in &self.ensemble.model_weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(ClassifierError::config(format!(
                    "ensemble.model_weights.{model} must be a non-negative number"
                )));
            }
        }

        check_percent("thresholds.default_threshold", self.thresholds.default_threshold)?;
        for (provider, value) in &self.thresholds.per_provider {
            check_percent(&format!("thresholds.per_provider.{provider}"), *value)?;
        }
        for (category, value) in &self.thresholds.per_category {
            check_percent(&format!("thresholds.per_category.{category}"), *value)?;
        }
        check_fraction("thresholds.no_consensus_margin", self.thresholds.no_consensus_margin)?;

        if let Some(entry) = self.whitelist.iter().find(|e| e.match_value.trim().is_empty()) {
            return Err(ClassifierError::config(format!(
                "whitelist entry has an empty match value: {entry:?}"
            )));
        }

        check_percent("ab_testing.rollout_percent", self.ab_testing.rollout_percent)?;

        if self.batch.max_workers == Some(0) {
            return Err(ClassifierError::config("batch.max_workers must be at least 1"));
        }

        Ok(())
    }
}

impl GeoConfig {
    /// Lookup timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl EnsembleConfig {
    /// Weight of a model, 1.0 when not configured
    pub fn weight_of(&self, model: &str) -> f64 {
        self.model_weights.get(model).copied().unwrap_or(1.0)
    }

    /// Per-backend prediction timeout
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }
}

impl AbTestingConfig {
    /// Shadow pipeline budget
    pub fn shadow_timeout(&self) -> Duration {
        Duration::from_millis(self.shadow_timeout_ms)
    }
}

impl BatchConfig {
    /// Worker count, never zero
    pub fn workers(&self) -> usize {
        self.max_workers.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Budget for a single classification
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl WhitelistEntry {
    /// Create an entry that requires authentication
    pub fn new<T: Into<String>>(match_value: T) -> Self {
        Self {
            match_value: match_value.into(),
            authentication_required: true,
        }
    }
}

fn check_fraction(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ClassifierError::config(format!(
            "{name} must be between 0.0 and 1.0, got {value}"
        )))
    }
}

fn check_percent(name: &str, value: u8) -> Result<()> {
    if value <= 100 {
        Ok(())
    } else {
        Err(ClassifierError::config(format!(
            "{name} must be a percentage between 0 and 100, got {value}"
        )))
    }
}

impl Default for InstantConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            instant_threshold: 0.9,
            base_confidence: 0.5,
            keyword_weight: 0.15,
            tld_risk_weight: 0.15,
            gibberish_weight: 0.10,
            gibberish_threshold: 0.6,
        }
    }
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 50,
            high_risk_countries: BTreeSet::new(),
            suspicious_ranges: Vec::new(),
            range_confidence: 0.92,
            country_confidence: 0.9,
            static_table: BTreeMap::new(),
        }
    }
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            category_agreement_threshold: 0.6,
            require_majority: true,
            model_weights: BTreeMap::new(),
            backend_timeout_ms: 200,
            keyword: KeywordBackendConfig::default(),
            naive_bayes_model: None,
            forest_model: None,
        }
    }
}

impl Default for KeywordBackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            clean_confidence: 0.6,
            hit_weight: 0.25,
            category_weights: BTreeMap::new(),
        }
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            default_threshold: 70,
            per_provider: BTreeMap::new(),
            per_category: BTreeMap::new(),
            disabled_categories: BTreeSet::new(),
            no_consensus_margin: 0.1,
        }
    }
}

impl Default for BusinessSenderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefixes: [
                "noreply", "no-reply", "donotreply", "newsletter", "news", "marketing",
                "info", "updates", "notifications", "offers", "deals", "promotions",
                "hello", "team", "billing", "orders", "receipts",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            company_names: [
                "amazon", "paypal", "google", "microsoft", "apple", "netflix", "linkedin",
                "ebay", "walmart", "costco", "spotify", "uber",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl Default for PatternSets {
    fn default() -> Self {
        let mut keywords = BTreeMap::new();
        keywords.insert(
            Category::PrizeLottery,
            strings(&[
                "lottery", "jackpot", "winner", "won", "prize", "claim", "sweepstakes",
                "lucky draw", "congratulations", "million dollars",
            ]),
        );
        keywords.insert(
            Category::Phishing,
            strings(&[
                "verify your account", "account suspended", "confirm your identity",
                "unusual activity", "password expired", "update your payment",
                "security alert", "unlock your account", "login attempt",
            ]),
        );
        keywords.insert(
            Category::Adult,
            strings(&["xxx", "porn", "nude", "explicit", "adult content", "webcam"]),
        );
        keywords.insert(
            Category::Dating,
            strings(&[
                "hot singles", "dating", "lonely", "meet women", "find love", "hookup",
            ]),
        );
        keywords.insert(
            Category::Health,
            strings(&[
                "viagra", "cialis", "pharmacy", "pills", "weight loss", "prescription",
                "miracle cure",
            ]),
        );
        keywords.insert(
            Category::Financial,
            strings(&[
                "bitcoin", "crypto", "investment opportunity", "forex", "guaranteed return",
                "double your money", "credit repair", "wire transfer",
            ]),
        );
        keywords.insert(
            Category::BusinessOpportunity,
            strings(&[
                "work from home", "make money fast", "be your own boss", "get rich",
                "extra income", "business opportunity",
            ]),
        );

        Self {
            version: "2024.1".to_string(),
            matcher: MatcherKind::Regex,
            keywords,
            risky_tlds: [
                "tk", "ml", "ga", "cf", "gq", "xyz", "top", "click", "link", "work", "loan",
                "win", "bid", "racing", "review", "stream", "download", "date", "faith",
                "party", "science", "cricket", "accountant", "trade", "icu", "buzz", "rest",
                "cyou", "monster",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl Default for AbTestingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rollout_percent: 0,
            shadow_mode: true,
            shadow_timeout_ms: 2000,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            request_timeout_ms: 2000,
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}
