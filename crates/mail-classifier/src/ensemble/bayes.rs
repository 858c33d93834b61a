/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Naive Bayes backend
//!
//! Scores subject and sender tokens against a trained multinomial model.
//! The model artifact is produced by the offline training job; this backend
//! only evaluates it.

use super::backend::{ModelBackend, ModelVote};
use crate::error::{ClassifierError, Result};
use crate::signal::EmailSignal;
use crate::Category;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::info;

/// Trained naive Bayes model artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NaiveBayesModel {
    /// Artifact version
    #[serde(default)]
    pub version: String,
    /// Per-category statistics
    pub classes: BTreeMap<Category, ClassStatistics>,
}

/// Statistics of one category
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassStatistics {
    /// Prior probability of the category
    pub prior: f64,
    /// Log probability of each token given the category
    pub token_log_probs: HashMap<String, f64>,
    /// Log probability of a token the category never saw
    pub unknown_log_prob: f64,
}

impl NaiveBayesModel {
    /// Parse and validate a JSON artifact
    pub fn from_json(json: &str) -> Result<Self> {
        let model: NaiveBayesModel = serde_json::from_str(json)
            .map_err(|e| ClassifierError::ModelLoading(format!("naive bayes artifact: {e}")))?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        if self.classes.is_empty() {
            return Err(ClassifierError::ModelLoading(
                "naive bayes artifact has no classes".to_string(),
            ));
        }
        for (category, stats) in &self.classes {
            if !(stats.prior > 0.0 && stats.prior <= 1.0) {
                return Err(ClassifierError::ModelLoading(format!(
                    "prior of {category} must be in (0, 1], got {}",
                    stats.prior
                )));
            }
            let bad_log_prob = |p: f64| !p.is_finite() || p > 0.0;
            if bad_log_prob(stats.unknown_log_prob)
                || stats.token_log_probs.values().any(|p| bad_log_prob(*p))
            {
                return Err(ClassifierError::ModelLoading(format!(
                    "log probabilities of {category} must be finite and not positive"
                )));
            }
        }
        Ok(())
    }

    /// Posterior probability of each category
    pub fn posterior(&self, tokens: &BTreeSet<String>) -> BTreeMap<Category, f64> {
        // tokens unknown to every class carry no information
        let known: Vec<&String> = tokens
            .iter()
            .filter(|t| self.classes.values().any(|c| c.token_log_probs.contains_key(*t)))
            .collect();

        let log_scores: Vec<(Category, f64)> = self
            .classes
            .iter()
            .map(|(category, stats)| {
                let likelihood: f64 = known
                    .iter()
                    .map(|t| {
                        stats
                            .token_log_probs
                            .get(*t)
                            .copied()
                            .unwrap_or(stats.unknown_log_prob)
                    })
                    .sum();
                (*category, stats.prior.ln() + likelihood)
            })
            .collect();

        let max = log_scores
            .iter()
            .map(|(_, s)| *s)
            .fold(f64::NEG_INFINITY, f64::max);
        let total: f64 = log_scores.iter().map(|(_, s)| (s - max).exp()).sum();

        log_scores
            .into_iter()
            .map(|(category, s)| (category, (s - max).exp() / total))
            .collect()
    }
}

/// Split subject and sender into lower-case word tokens
pub fn tokenize(signal: &EmailSignal) -> BTreeSet<String> {
    let text = format!(
        "{} {} {}",
        signal.subject, signal.sender_local_part, signal.sender_domain
    )
    .to_lowercase();

    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.trim_matches('\''))
        .filter(|w| (3..=20).contains(&w.chars().count()))
        .filter(|w| !w.chars().all(|c| c.is_numeric()))
        .map(str::to_string)
        .collect()
}

/// Backend evaluating a naive Bayes model
pub struct NaiveBayesBackend {
    model: NaiveBayesModel,
}

impl NaiveBayesBackend {
    pub const NAME: &'static str = "naive_bayes";

    /// Create a backend from a model
    pub fn new(model: NaiveBayesModel) -> Self {
        Self { model }
    }

    /// Load the model artifact from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ClassifierError::ModelLoading(format!("cannot read {}: {e}", path.display()))
        })?;
        let model = NaiveBayesModel::from_json(&json)?;
        info!(
            path = %path.display(),
            version = %model.version,
            classes = model.classes.len(),
            "Loaded naive bayes model"
        );
        Ok(Self::new(model))
    }
}

#[async_trait]
impl ModelBackend for NaiveBayesBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn predict(&self, signal: &EmailSignal) -> Result<ModelVote> {
        let posterior = self.model.posterior(&tokenize(signal));

        let mut best: Option<(Category, f64)> = None;
        for (category, probability) in posterior {
            if !probability.is_finite() {
                return Err(ClassifierError::backend(Self::NAME, "posterior is not finite"));
            }
            if best.map_or(true, |(_, p)| probability > p) {
                best = Some((category, probability));
            }
        }

        let (category, probability) =
            best.ok_or_else(|| ClassifierError::backend(Self::NAME, "model has no classes"))?;
        Ok(ModelVote::new(Self::NAME, category, probability))
    }
}
