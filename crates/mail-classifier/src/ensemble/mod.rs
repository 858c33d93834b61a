/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Tier-3 ensemble voting
//!
//! Independent model backends each cast a [`ModelVote`]; the
//! [`EnsembleVoter`] combines them into one [`EnsembleVerdict`].

pub mod backend;
pub mod bayes;
pub mod forest;
pub mod keyword;
pub mod voting;

pub use backend::{ModelBackend, ModelVote};
pub use bayes::{NaiveBayesBackend, NaiveBayesModel};
pub use forest::{Feature, FeatureVector, ForestBackend, ForestModel};
pub use keyword::KeywordBackend;
pub use voting::{EnsembleVerdict, EnsembleVoter};
