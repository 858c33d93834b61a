/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Confidence conversions
//!
//! The engine works with fractions in `0.0..=1.0` everywhere. Percentages
//! only exist at the configuration boundary.

/// Convert a configured percentage into a fraction
pub fn from_percent(percent: u8) -> f64 {
    f64::from(percent.min(100)) / 100.0
}

/// Convert a fraction into a rounded percentage
pub fn to_percent(fraction: f64) -> u8 {
    (clamp(fraction) * 100.0).round() as u8
}

/// Clamp a confidence into `0.0..=1.0`, mapping NaN to zero
pub fn clamp(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
