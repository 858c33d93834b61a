/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Override and whitelist engine
//!
//! Runs after every other stage and may veto its outcome. A whitelist match
//! only protects a sender whose SPF/DKIM authentication passed; an
//! unauthenticated claim of a protected address is flagged as spoofing.

use crate::config::{BusinessSenderConfig, WhitelistEntry};
use crate::signal::{registrable_domain, registrable_label, EmailSignal};
use crate::{Action, Category, ClassificationResult, Tier};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const AUTHENTICATED_WHITELIST: &str = "authenticated_whitelist";
pub const SPOOFED_WHITELIST_SENDER: &str = "spoofed_whitelist_sender";
pub const LEGITIMATE_BUSINESS_SENDER: &str = "legitimate_business_sender";

/// Minimum confidence of a spoofing flag
const SPOOFING_CONFIDENCE: f64 = 0.9;

/// Outcome of sender authentication (SPF/DKIM)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether the sender authenticated
    pub is_authentic: bool,
    /// Human readable summary, e.g. `spf=pass dkim=pass`
    pub summary: String,
}

impl AuthResult {
    pub fn authentic<T: Into<String>>(summary: T) -> Self {
        Self {
            is_authentic: true,
            summary: summary.into(),
        }
    }

    pub fn unauthenticated() -> Self {
        Self {
            is_authentic: false,
            summary: "none".to_string(),
        }
    }
}

/// Override engine
pub struct OverrideEngine {
    business: BusinessSenderConfig,
}

impl OverrideEngine {
    /// Create a new override engine
    pub fn new(business: &BusinessSenderConfig) -> Self {
        Self {
            business: BusinessSenderConfig {
                enabled: business.enabled,
                prefixes: business.prefixes.iter().map(|p| p.to_lowercase()).collect(),
                company_names: business
                    .company_names
                    .iter()
                    .map(|c| c.to_lowercase())
                    .collect(),
            },
        }
    }

    /// Apply whitelist and business sender rules to a result
    pub fn apply_overrides(
        &self,
        result: ClassificationResult,
        signal: &EmailSignal,
        auth: &AuthResult,
        whitelist: &[WhitelistEntry],
    ) -> ClassificationResult {
        if let Some(entry) = whitelist
            .iter()
            .find(|entry| whitelist_matches(entry, signal))
        {
            if auth.is_authentic {
                info!(
                    message_id = %signal.message_id,
                    sender = %signal.sender,
                    auth = %auth.summary,
                    "Authenticated whitelisted sender, preserving"
                );
                return ClassificationResult {
                    final_category: Category::Legitimate,
                    subcategory: None,
                    confidence: 1.0,
                    action: Action::Preserve,
                    tier_used: Tier::Override,
                    override_reason: Some(AUTHENTICATED_WHITELIST.to_string()),
                    reasons: result.reasons,
                }
                .with_reason(format!("whitelisted sender authenticated ({})", auth.summary));
            }

            warn!(
                message_id = %signal.message_id,
                sender = %signal.sender,
                entry = %entry.match_value,
                authentication_required = entry.authentication_required,
                auth = %auth.summary,
                "Unauthenticated mail claiming a whitelisted sender"
            );
            return ClassificationResult {
                final_category: Category::Phishing,
                subcategory: Some("Whitelist spoofing".to_string()),
                confidence: result.confidence.max(SPOOFING_CONFIDENCE),
                action: Action::FlagSpoofed,
                tier_used: Tier::Override,
                override_reason: Some(SPOOFED_WHITELIST_SENDER.to_string()),
                reasons: result.reasons,
            }
            .with_reason(format!(
                "claims whitelisted {} without authentication ({})",
                entry.match_value, auth.summary
            ));
        }

        if result.action == Action::Delete && self.is_business_sender(signal) {
            info!(
                message_id = %signal.message_id,
                sender = %signal.sender,
                previous = %result.final_category,
                "Legitimate business sender, downgrading to promotional"
            );
            let previous = result.final_category;
            return ClassificationResult {
                final_category: Category::Promotional,
                subcategory: Some(previous.to_string()),
                action: Action::Preserve,
                tier_used: Tier::Override,
                override_reason: Some(LEGITIMATE_BUSINESS_SENDER.to_string()),
                ..result
            }
            .with_reason(format!("{} looks like a legitimate bulk sender", signal.sender));
        }

        result
    }

    fn is_business_sender(&self, signal: &EmailSignal) -> bool {
        if !self.business.enabled || signal.sender_domain.is_empty() {
            return false;
        }
        if signal.tld_risk_flag || signal.is_gibberish_domain {
            return false;
        }

        let local = signal.sender_local_part.to_lowercase();
        let prefix_match = self.business.prefixes.iter().any(|prefix| {
            local == *prefix
                || local
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with(&['.', '-', '_', '+'][..]))
        });

        let label = registrable_label(&signal.sender_domain);
        if self.is_brand_lookalike(&signal.sender_domain, label) {
            return false;
        }

        let company_match = self
            .business
            .company_names
            .iter()
            .any(|company| local.contains(company.as_str()) && label == company);

        prefix_match || company_match
    }

    /// A domain mentioning a known company without being registered to it
    fn is_brand_lookalike(&self, domain: &str, label: &str) -> bool {
        self.business
            .company_names
            .iter()
            .any(|company| domain.contains(company.as_str()) && label != company)
    }
}

/// Whether a whitelist entry covers the sender
fn whitelist_matches(entry: &WhitelistEntry, signal: &EmailSignal) -> bool {
    let value = entry.match_value.trim().to_lowercase();
    if value.is_empty() {
        return false;
    }

    if value.contains('@') && !value.starts_with('@') {
        return signal.sender.to_lowercase() == value;
    }

    let domain = value.trim_start_matches(&['@', '.'][..]);
    if registrable_domain(domain).is_none() {
        return false;
    }
    let sender_domain = signal.sender_domain.to_lowercase();
    !sender_domain.is_empty()
        && (sender_domain == domain
            || sender_domain
                .strip_suffix(domain)
                .is_some_and(|rest| rest.ends_with('.')))
}
