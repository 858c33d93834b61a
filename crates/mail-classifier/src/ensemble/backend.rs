/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Model backend capability

use crate::error::Result;
use crate::signal::EmailSignal;
use crate::Category;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Vote cast by one model backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVote {
    /// Name of the model, also the key of its ensemble weight
    pub model_name: String,
    /// Predicted category
    pub category: Category,
    /// Confidence (0.0 to 1.0)
    pub confidence: f64,
    /// Time spent predicting
    pub processing_time_ms: u64,
}

impl ModelVote {
    /// Create a vote, clamping the confidence into range
    pub fn new<T: Into<String>>(model_name: T, category: Category, confidence: f64) -> Self {
        Self {
            model_name: model_name.into(),
            category,
            confidence: crate::confidence::clamp(confidence),
            processing_time_ms: 0,
        }
    }
}

/// A trained model that can vote on an email
///
/// Backends hold no shared mutable state; the voter runs them concurrently
/// and drops the vote of any backend that errors or times out.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Model name
    fn name(&self) -> &str;

    /// Predict the category of an email
    async fn predict(&self, signal: &EmailSignal) -> Result<ModelVote>;
}
