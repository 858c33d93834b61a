/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Decision forest backend
//!
//! Evaluates an exported tree ensemble over a small numeric feature vector.
//! Each tree is a flat node array rooted at index 0; children always sit at
//! a higher index than their parent, which rules out cycles at load time.

use super::backend::{ModelBackend, ModelVote};
use crate::error::{ClassifierError, Result};
use crate::signal::EmailSignal;
use crate::Category;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Numeric features understood by the forest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    GibberishScore,
    TldRisk,
    KeywordCount,
    SubjectLength,
    UppercaseRatio,
    ExclamationCount,
    DomainDigitRatio,
    HasPublicIp,
}

/// Feature values of one email
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub gibberish_score: f64,
    pub tld_risk: f64,
    pub keyword_count: f64,
    pub subject_length: f64,
    pub uppercase_ratio: f64,
    pub exclamation_count: f64,
    pub domain_digit_ratio: f64,
    pub has_public_ip: f64,
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

impl FeatureVector {
    pub fn from_signal(signal: &EmailSignal) -> Self {
        let letters: Vec<char> = signal
            .subject
            .chars()
            .filter(|c| c.is_alphabetic())
            .collect();
        let uppercase = letters.iter().filter(|c| c.is_uppercase()).count();

        let domain_chars: Vec<char> = signal
            .sender_domain
            .chars()
            .filter(|c| *c != '.')
            .collect();
        let digits = domain_chars.iter().filter(|c| c.is_ascii_digit()).count();

        Self {
            gibberish_score: signal.gibberish_score,
            tld_risk: flag(signal.tld_risk_flag),
            keyword_count: signal.matched_keywords.len() as f64,
            subject_length: signal.subject.chars().count() as f64,
            uppercase_ratio: ratio(uppercase, letters.len()),
            exclamation_count: signal.subject.matches('!').count() as f64,
            domain_digit_ratio: ratio(digits, domain_chars.len()),
            has_public_ip: flag(signal.extracted_ip.is_some()),
        }
    }

    pub fn get(&self, feature: Feature) -> f64 {
        match feature {
            Feature::GibberishScore => self.gibberish_score,
            Feature::TldRisk => self.tld_risk,
            Feature::KeywordCount => self.keyword_count,
            Feature::SubjectLength => self.subject_length,
            Feature::UppercaseRatio => self.uppercase_ratio,
            Feature::ExclamationCount => self.exclamation_count,
            Feature::DomainDigitRatio => self.domain_digit_ratio,
            Feature::HasPublicIp => self.has_public_ip,
        }
    }
}

/// Tree node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    /// Go left when `feature <= threshold`
    Split {
        feature: Feature,
        threshold: f64,
        left: usize,
        right: usize,
    },
    /// Category distribution
    Leaf { leaf: BTreeMap<Category, f64> },
}

/// Single decision tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    fn validate(&self, index: usize) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(ClassifierError::ModelLoading(format!(
                "tree {index} has no nodes"
            )));
        }
        for (at, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Split {
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    if !threshold.is_finite() {
                        return Err(ClassifierError::ModelLoading(format!(
                            "tree {index} node {at}: threshold is not finite"
                        )));
                    }
                    for child in [*left, *right] {
                        if child <= at || child >= self.nodes.len() {
                            return Err(ClassifierError::ModelLoading(format!(
                                "tree {index} node {at}: invalid child index {child}"
                            )));
                        }
                    }
                }
                Node::Leaf { leaf } => {
                    if leaf.is_empty() || leaf.values().any(|p| !p.is_finite() || *p < 0.0) {
                        return Err(ClassifierError::ModelLoading(format!(
                            "tree {index} node {at}: invalid leaf distribution"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn evaluate(&self, features: &FeatureVector) -> &BTreeMap<Category, f64> {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    at = if features.get(*feature) <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
                Node::Leaf { leaf } => return leaf,
            }
        }
    }
}

/// Exported forest artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestModel {
    #[serde(default)]
    pub version: String,
    pub trees: Vec<Tree>,
}

impl ForestModel {
    /// Parse and validate a JSON artifact
    pub fn from_json(json: &str) -> Result<Self> {
        let model: ForestModel = serde_json::from_str(json)
            .map_err(|e| ClassifierError::ModelLoading(format!("forest artifact: {e}")))?;
        if model.trees.is_empty() {
            return Err(ClassifierError::ModelLoading(
                "forest artifact has no trees".to_string(),
            ));
        }
        for (index, tree) in model.trees.iter().enumerate() {
            tree.validate(index)?;
        }
        Ok(model)
    }

    /// Average the leaf distributions of all trees
    pub fn predict_proba(&self, features: &FeatureVector) -> BTreeMap<Category, f64> {
        let mut totals: BTreeMap<Category, f64> = BTreeMap::new();
        for tree in &self.trees {
            let leaf = tree.evaluate(features);
            let mass: f64 = leaf.values().sum();
            if mass <= 0.0 {
                continue;
            }
            for (category, p) in leaf {
                *totals.entry(*category).or_default() += p / mass;
            }
        }
        let n = self.trees.len() as f64;
        totals.values_mut().for_each(|p| *p /= n);
        totals
    }
}

/// Backend evaluating a decision forest
pub struct ForestBackend {
    model: ForestModel,
}

impl ForestBackend {
    pub const NAME: &'static str = "forest";

    pub fn new(model: ForestModel) -> Self {
        Self { model }
    }

    /// Load the forest artifact from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ClassifierError::ModelLoading(format!("cannot read {}: {e}", path.display()))
        })?;
        let model = ForestModel::from_json(&json)?;
        info!(
            path = %path.display(),
            version = %model.version,
            trees = model.trees.len(),
            "Loaded forest model"
        );
        Ok(Self::new(model))
    }
}

#[async_trait]
impl ModelBackend for ForestBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn predict(&self, signal: &EmailSignal) -> Result<ModelVote> {
        let proba = self.model.predict_proba(&FeatureVector::from_signal(signal));

        let mut best: Option<(Category, f64)> = None;
        for (category, p) in proba {
            if best.map_or(true, |(_, b)| p > b) {
                best = Some((category, p));
            }
        }

        let (category, p) =
            best.ok_or_else(|| ClassifierError::backend(Self::NAME, "no tree produced a leaf"))?;
        Ok(ModelVote::new(Self::NAME, category, p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternSets;
    use crate::patterns::build_matcher;
    use crate::signal::{RawEmail, SignalExtractor};

    const MODEL: &str = r#"{
        "version": "forest-test",
        "trees": [
            { "nodes": [
                { "feature": "exclamation_count", "threshold": 1.5, "left": 1, "right": 2 },
                { "leaf": { "Legitimate": 0.8, "Spam": 0.2 } },
                { "leaf": { "Spam": 0.9, "Legitimate": 0.1 } }
            ]},
            { "nodes": [
                { "feature": "uppercase_ratio", "threshold": 0.5, "left": 1, "right": 2 },
                { "leaf": { "Legitimate": 0.6, "Spam": 0.4 } },
                { "leaf": { "Spam": 1.0 } }
            ]}
        ]
    }"#;

    fn signal(sender: &str, subject: &str) -> EmailSignal {
        let patterns = PatternSets::default();
        let extractor = SignalExtractor::new(
            build_matcher(&patterns).unwrap(),
            patterns.risky_tlds.clone(),
            0.6,
        );
        extractor.extract(&RawEmail::new("m", sender, subject, ""))
    }

    #[test]
    fn test_feature_vector() {
        let features = FeatureVector::from_signal(&signal("x@mail123.example.com", "BUY NOW!!!"));
        assert_eq!(features.exclamation_count, 3.0);
        assert_eq!(features.uppercase_ratio, 1.0);
        assert_eq!(features.subject_length, 10.0);
        assert_eq!(features.has_public_ip, 0.0);
        assert!((features.domain_digit_ratio - 3.0 / 17.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_shouting_subject_votes_spam() {
        let backend = ForestBackend::new(ForestModel::from_json(MODEL).unwrap());
        let vote = backend
            .predict(&signal("promo@example.com", "ACT NOW!!!"))
            .await
            .unwrap();
        assert_eq!(vote.category, Category::Spam);
        assert!((vote.confidence - 0.95).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_plain_subject_votes_legitimate() {
        let backend = ForestBackend::new(ForestModel::from_json(MODEL).unwrap());
        let vote = backend
            .predict(&signal("bob@example.com", "quarterly report"))
            .await
            .unwrap();
        assert_eq!(vote.category, Category::Legitimate);
        assert!((vote.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_cycles_and_dangling_children_rejected() {
        let cyclic = r#"{"trees": [{"nodes": [
            {"feature": "tld_risk", "threshold": 0.5, "left": 0, "right": 1},
            {"leaf": {"Spam": 1.0}}
        ]}]}"#;
        assert!(matches!(
            ForestModel::from_json(cyclic),
            Err(ClassifierError::ModelLoading(_))
        ));

        let dangling = r#"{"trees": [{"nodes": [
            {"feature": "tld_risk", "threshold": 0.5, "left": 1, "right": 7},
            {"leaf": {"Spam": 1.0}}
        ]}]}"#;
        assert!(ForestModel::from_json(dangling).is_err());

        assert!(ForestModel::from_json(r#"{"trees": []}"#).is_err());
        assert!(ForestModel::from_json(r#"{"trees": [{"nodes": [{"leaf": {}}]}]}"#).is_err());
    }
}
