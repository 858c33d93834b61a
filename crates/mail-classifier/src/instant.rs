/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Tier-1 instant classifier
//!
//! Zero-cost comparisons against the precompiled keyword index, the risky
//! TLD flag and the gibberish-domain heuristic. No I/O and no errors: an
//! unmatched email is simply inconclusive.

use crate::config::InstantConfig;
use crate::ensemble::{EnsembleVerdict, ModelVote};
use crate::patterns::PatternMatcher;
use crate::signal::EmailSignal;
use crate::Category;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Verdict of a single detection tier
#[derive(Debug, Clone, PartialEq)]
pub struct TierVerdict {
    /// Candidate category
    pub category: Category,
    /// Optional finer grained label
    pub subcategory: Option<String>,
    /// Confidence (0.0 to 1.0)
    pub confidence: f64,
    /// What the tier saw
    pub evidence: Vec<String>,
}

impl TierVerdict {
    /// Verdict of a tier that found nothing to act on
    pub fn no_signal<T: Into<String>>(reason: T) -> Self {
        Self {
            category: Category::Uncertain,
            subcategory: None,
            confidence: 0.0,
            evidence: vec![reason.into()],
        }
    }

    /// Wrap a conclusive tier verdict for threshold resolution
    pub fn into_ensemble_verdict(self, source: &str) -> EnsembleVerdict {
        let vote = ModelVote {
            model_name: source.to_string(),
            category: self.category,
            confidence: self.confidence,
            processing_time_ms: 0,
        };
        EnsembleVerdict {
            category: self.category,
            subcategory: self.subcategory,
            aggregate_confidence: self.confidence,
            category_share: 1.0,
            contributing_votes: vec![vote],
            consensus_reached: true,
        }
    }
}

/// Instant pattern classifier
pub struct InstantClassifier {
    config: InstantConfig,
    matcher: Arc<dyn PatternMatcher>,
}

impl InstantClassifier {
    /// Create a new instant classifier
    pub fn new(config: &InstantConfig, matcher: Arc<dyn PatternMatcher>) -> Self {
        Self {
            config: config.clone(),
            matcher,
        }
    }

    /// Classify an email from its precomputed signals
    ///
    /// Returns the verdict and whether it clears the instant bar.
    pub fn classify(&self, signal: &EmailSignal) -> (TierVerdict, bool) {
        if !self.config.enabled {
            return (TierVerdict::no_signal("instant tier disabled"), false);
        }

        let mut hits: BTreeMap<Category, Vec<&str>> = BTreeMap::new();
        for keyword in &signal.matched_keywords {
            if let Some(category) = self.matcher.category_of(keyword) {
                hits.entry(category).or_default().push(keyword);
            }
        }

        // strictly greater keeps the earliest category on ties
        let mut best: Option<(Category, &Vec<&str>)> = None;
        for (category, keywords) in &hits {
            if best.map_or(true, |(_, b)| keywords.len() > b.len()) {
                best = Some((*category, keywords));
            }
        }

        if best.is_none() && !signal.tld_risk_flag && !signal.is_gibberish_domain {
            return (TierVerdict::no_signal("no instant pattern matched"), false);
        }

        let mut evidence = Vec::new();
        let mut confidence = self.config.base_confidence;

        let category = match best {
            Some((category, keywords)) => {
                confidence += self.config.keyword_weight * keywords.len() as f64;
                evidence.push(format!("{category} keywords: {}", keywords.join(", ")));
                category
            }
            None => Category::Spam,
        };

        let subcategory = if signal.tld_risk_flag {
            confidence += self.config.tld_risk_weight;
            evidence.push(format!("high-risk TLD .{}", signal.tld));
            Some(format!("High-risk TLD .{}", signal.tld))
        } else {
            None
        };

        if signal.is_gibberish_domain {
            confidence += self.config.gibberish_weight;
            evidence.push(format!(
                "generated-looking domain {} (score {:.2})",
                signal.sender_domain, signal.gibberish_score
            ));
        }
        let subcategory = subcategory
            .or_else(|| signal.is_gibberish_domain.then(|| "Generated domain".to_string()));

        let confidence = confidence.min(0.99);
        let conclusive = confidence >= self.config.instant_threshold;

        debug!(
            message_id = %signal.message_id,
            category = %category,
            confidence,
            conclusive,
            "Instant tier verdict"
        );

        (
            TierVerdict {
                category,
                subcategory,
                confidence,
                evidence,
            },
            conclusive,
        )
    }
}
