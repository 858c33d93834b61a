/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Metrics collection

use crate::{Action, Tier};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time detection statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionStats {
    pub total_classified: u64,
    pub tier1_decisions: u64,
    pub tier2_decisions: u64,
    pub ensemble_decisions: u64,
    pub override_decisions: u64,
    pub deleted: u64,
    pub preserved: u64,
    pub flagged_spoofed: u64,
    pub geo_failures: u64,
    pub backend_failures: u64,
    pub shadow_failures: u64,
    pub failed_requests: u64,
    pub average_processing_time_ms: f64,
}

/// Engine metrics collector
#[derive(Debug, Default)]
pub struct EngineMetrics {
    total_classified: AtomicU64,
    tier1_decisions: AtomicU64,
    tier2_decisions: AtomicU64,
    ensemble_decisions: AtomicU64,
    override_decisions: AtomicU64,
    deleted: AtomicU64,
    preserved: AtomicU64,
    flagged_spoofed: AtomicU64,
    geo_failures: AtomicU64,
    backend_failures: AtomicU64,
    shadow_failures: AtomicU64,
    failed_requests: AtomicU64,
    processing_time_ms: AtomicU64,
}

impl EngineMetrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished classification
    pub fn record_classification(&self, tier: Tier, action: Action, elapsed_ms: u64) {
        self.total_classified.fetch_add(1, Ordering::Relaxed);
        self.processing_time_ms.fetch_add(elapsed_ms, Ordering::Relaxed);

        let tier_counter = match tier {
            Tier::Tier1 => &self.tier1_decisions,
            Tier::Tier2 => &self.tier2_decisions,
            Tier::Tier3Ensemble => &self.ensemble_decisions,
            Tier::Override => &self.override_decisions,
        };
        tier_counter.fetch_add(1, Ordering::Relaxed);

        let action_counter = match action {
            Action::Delete => &self.deleted,
            Action::Preserve => &self.preserved,
            Action::FlagSpoofed => &self.flagged_spoofed,
        };
        action_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_geo_failure(&self) {
        self.geo_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_failure(&self) {
        self.backend_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shadow_failure(&self) {
        self.shadow_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request that produced no result (batch timeout or failure)
    pub fn record_failed_request(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current statistics
    pub fn snapshot(&self) -> DetectionStats {
        let total = self.total_classified.load(Ordering::Relaxed);
        let time = self.processing_time_ms.load(Ordering::Relaxed);

        DetectionStats {
            total_classified: total,
            tier1_decisions: self.tier1_decisions.load(Ordering::Relaxed),
            tier2_decisions: self.tier2_decisions.load(Ordering::Relaxed),
            ensemble_decisions: self.ensemble_decisions.load(Ordering::Relaxed),
            override_decisions: self.override_decisions.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            preserved: self.preserved.load(Ordering::Relaxed),
            flagged_spoofed: self.flagged_spoofed.load(Ordering::Relaxed),
            geo_failures: self.geo_failures.load(Ordering::Relaxed),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
            shadow_failures: self.shadow_failures.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            average_processing_time_ms: if total == 0 {
                0.0
            } else {
                time as f64 / total as f64
            },
        }
    }
}
