/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Keyword pattern matching
//!
//! The matcher implementation is chosen once when a configuration snapshot
//! is built (see [`MatcherKind`]) and shared read-only by every request.

use crate::config::{MatcherKind, PatternSets};
use crate::error::{ClassifierError, Result};
use crate::Category;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Keyword matcher capability
pub trait PatternMatcher: Send + Sync {
    /// Keywords found in `text`, lower-cased
    fn find_keywords(&self, text: &str) -> BTreeSet<String>;

    /// Category a keyword belongs to
    fn category_of(&self, keyword: &str) -> Option<Category>;

    /// Implementation name for logging
    fn name(&self) -> &'static str;
}

/// Build the matcher selected by the pattern configuration
pub fn build_matcher(patterns: &PatternSets) -> Result<Arc<dyn PatternMatcher>> {
    let matcher: Arc<dyn PatternMatcher> = match patterns.matcher {
        MatcherKind::Regex => Arc::new(RegexPatternMatcher::new(patterns)?),
        MatcherKind::Substring => Arc::new(SubstringPatternMatcher::new(patterns)),
    };
    Ok(matcher)
}

/// Keyword index shared by both matcher implementations
#[derive(Debug, Clone, Default)]
struct KeywordIndex {
    categories: HashMap<String, Category>,
}

impl KeywordIndex {
    fn new(patterns: &PatternSets) -> Self {
        let mut categories = HashMap::new();
        for (category, keywords) in &patterns.keywords {
            for keyword in keywords {
                let keyword = keyword.trim().to_lowercase();
                if !keyword.is_empty() {
                    // first category wins when a keyword is listed twice
                    categories.entry(keyword).or_insert(*category);
                }
            }
        }
        Self { categories }
    }
}

/// Word-bounded, case-insensitive regular expression matcher
#[derive(Debug)]
pub struct RegexPatternMatcher {
    index: KeywordIndex,
    regex: Option<Regex>,
}

impl RegexPatternMatcher {
    /// Compile all keywords into a single alternation
    pub fn new(patterns: &PatternSets) -> Result<Self> {
        let index = KeywordIndex::new(patterns);

        // longest first so multi-word phrases win over their prefixes
        let mut keywords: Vec<&String> = index.categories.keys().collect();
        keywords.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let regex = if keywords.is_empty() {
            None
        } else {
            let alternation = keywords
                .iter()
                .map(|k| regex::escape(k))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = format!(r"(?i)\b(?:{alternation})\b");
            Some(Regex::new(&pattern).map_err(|e| {
                ClassifierError::config(format!("invalid keyword pattern set: {e}"))
            })?)
        };

        Ok(Self { index, regex })
    }
}

impl PatternMatcher for RegexPatternMatcher {
    fn find_keywords(&self, text: &str) -> BTreeSet<String> {
        match &self.regex {
            Some(regex) => regex
                .find_iter(text)
                .map(|m| m.as_str().to_lowercase())
                .collect(),
            None => BTreeSet::new(),
        }
    }

    fn category_of(&self, keyword: &str) -> Option<Category> {
        self.index.categories.get(&keyword.to_lowercase()).copied()
    }

    fn name(&self) -> &'static str {
        "regex"
    }
}

/// Case-insensitive substring matcher
#[derive(Debug)]
pub struct SubstringPatternMatcher {
    index: KeywordIndex,
}

impl SubstringPatternMatcher {
    /// Create a substring matcher
    pub fn new(patterns: &PatternSets) -> Self {
        Self {
            index: KeywordIndex::new(patterns),
        }
    }
}

impl PatternMatcher for SubstringPatternMatcher {
    fn find_keywords(&self, text: &str) -> BTreeSet<String> {
        let text = text.to_lowercase();
        self.index
            .categories
            .keys()
            .filter(|keyword| text.contains(keyword.as_str()))
            .cloned()
            .collect()
    }

    fn category_of(&self, keyword: &str) -> Option<Category> {
        self.index.categories.get(&keyword.to_lowercase()).copied()
    }

    fn name(&self) -> &'static str {
        "substring"
    }
}
