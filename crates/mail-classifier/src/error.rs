/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Error types for the classification engine

use thiserror::Error;

/// Result type for classification operations
pub type Result<T> = std::result::Result<T, ClassifierError>;

/// Errors that can occur while loading or running the classification engine
///
/// Only configuration and model loading errors are fatal. Everything raised
/// on the classification path is absorbed by the pipeline and degrades to a
/// conservative outcome.
#[derive(Error, Debug)]
pub enum ClassifierError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Model artifact could not be loaded
    #[error("Model loading error: {0}")]
    ModelLoading(String),

    /// A model backend failed to produce a vote
    #[error("Backend '{backend}' failed: {reason}")]
    Backend { backend: String, reason: String },

    /// Geographic lookup failed
    #[error("Lookup error: {0}")]
    Lookup(String),

    /// An operation exceeded its time budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A pipeline could not produce a result
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ClassifierError {
    /// Create a new configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new backend error
    pub fn backend<B: Into<String>, R: Into<String>>(backend: B, reason: R) -> Self {
        Self::Backend {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create a new lookup error
    pub fn lookup<T: Into<String>>(msg: T) -> Self {
        Self::Lookup(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        Self::Timeout(msg.into())
    }

    /// Check if the error is fatal at startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::ModelLoading(_) | Self::Io(_) | Self::Toml(_)
        )
    }
}
