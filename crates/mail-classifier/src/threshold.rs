/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Threshold and confidence resolution
//!
//! Turns an ensemble verdict into a [`ClassificationResult`]. The resolver is
//! tuned to fail closed: anything short of a confident, deletable, enabled
//! category is preserved.

use crate::config::ThresholdPolicy;
use crate::ensemble::EnsembleVerdict;
use crate::{confidence, Action, Category, ClassificationResult, Tier};
use std::collections::BTreeMap;

/// Threshold resolver bound to one policy snapshot
#[derive(Debug, Clone)]
pub struct ThresholdResolver {
    policy: ThresholdPolicy,
    providers: BTreeMap<String, u8>,
}

impl ThresholdResolver {
    /// Create a resolver for the given policy
    pub fn new(policy: &ThresholdPolicy) -> Self {
        let providers = policy
            .per_provider
            .iter()
            .map(|(provider, percent)| (normalize_provider(provider), *percent))
            .collect();
        Self {
            policy: policy.clone(),
            providers,
        }
    }

    /// Threshold applying to a category and provider
    ///
    /// Category beats provider, provider beats the default.
    pub fn effective_threshold(&self, category: Category, provider: &str) -> f64 {
        let percent = self
            .policy
            .per_category
            .get(&category)
            .or_else(|| self.providers.get(&normalize_provider(provider)))
            .copied()
            .unwrap_or(self.policy.default_threshold);
        confidence::from_percent(percent)
    }

    /// Resolve a verdict into a final result
    pub fn resolve(&self, verdict: &EnsembleVerdict, provider: &str) -> ClassificationResult {
        let category = verdict.category;
        let confidence = confidence::clamp(verdict.aggregate_confidence);
        let base = self.effective_threshold(category, provider);
        let threshold = if verdict.consensus_reached {
            base
        } else {
            (base + self.policy.no_consensus_margin).min(1.0)
        };

        let mut result = ClassificationResult {
            final_category: category,
            subcategory: verdict.subcategory.clone(),
            confidence,
            action: Action::Preserve,
            tier_used: Tier::Tier3Ensemble,
            override_reason: None,
            reasons: Vec::new(),
        };

        if self.policy.disabled_categories.contains(&category) {
            return result.with_reason(format!("{category} is disabled, preserving"));
        }

        if !category.is_deletable() {
            return result.with_reason(format!("{category} is never deleted"));
        }

        if confidence >= threshold {
            result.action = Action::Delete;
            return result.with_reason(format!(
                "confidence {}% meets {} threshold {}%",
                confidence::to_percent(confidence),
                category,
                confidence::to_percent(threshold)
            ));
        }

        result.final_category = Category::Uncertain;
        result.subcategory = Some(category.to_string());
        result.with_reason(format!(
            "confidence {}% below {} threshold {}%{}",
            confidence::to_percent(confidence),
            category,
            confidence::to_percent(threshold),
            if verdict.consensus_reached {
                ""
            } else {
                " (no consensus)"
            }
        ))
    }
}

/// Resolve a verdict against a policy
pub fn resolve(
    verdict: &EnsembleVerdict,
    provider: &str,
    policy: &ThresholdPolicy,
) -> ClassificationResult {
    ThresholdResolver::new(policy).resolve(verdict, provider)
}

fn normalize_provider(provider: &str) -> String {
    provider.trim().to_lowercase()
}
