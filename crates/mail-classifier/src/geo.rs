/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Tier-2 geographic risk assessment
//!
//! Consulted only when the instant tier is inconclusive. Static suspicious
//! ranges are checked before the injected [`GeoLookup`] capability is called.
//! Lookup errors and timeouts degrade to "no geographic signal"; the absence
//! of a red flag never counts as evidence of legitimacy.

use crate::config::GeoConfig;
use crate::error::{ClassifierError, Result};
use crate::instant::TierVerdict;
use crate::metrics::EngineMetrics;
use crate::signal::EmailSignal;
use crate::Category;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Geographic lookup capability
#[async_trait]
pub trait GeoLookup: Send + Sync {
    /// Resolve an address to an ISO country code
    async fn lookup(&self, ip: IpAddr) -> Result<String>;
}

/// IP network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    network: IpAddr,
    prefix: u8,
}

impl IpRange {
    /// Whether the range contains an address
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(network), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.prefix);
                (u32::from(network) & mask) == (u32::from(*ip) & mask)
            }
            (IpAddr::V6(network), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.prefix);
                (u128::from(network) & mask) == (u128::from(*ip) & mask)
            }
            _ => false,
        }
    }

    /// Prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

fn mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

impl FromStr for IpRange {
    type Err = ClassifierError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (address, prefix) = match s.split_once('/') {
            Some((address, prefix)) => (address, Some(prefix)),
            None => (s, None),
        };

        let network: IpAddr = address
            .parse()
            .map_err(|_| ClassifierError::config(format!("invalid IP range '{s}'")))?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| ClassifierError::config(format!("invalid prefix in '{s}'")))?,
            None => max,
        };

        Ok(Self { network, prefix })
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// In-process lookup backed by a CIDR to country table
#[derive(Debug, Clone, Default)]
pub struct StaticGeoLookup {
    entries: Vec<(IpRange, String)>,
}

impl StaticGeoLookup {
    /// Build the table from configuration
    pub fn new(table: &BTreeMap<String, String>) -> Result<Self> {
        let mut entries = table
            .iter()
            .map(|(range, country)| -> Result<(IpRange, String)> {
                Ok((range.parse()?, country.trim().to_uppercase()))
            })
            .collect::<Result<Vec<_>>>()?;
        // most specific range first
        entries.sort_by(|a, b| b.0.prefix().cmp(&a.0.prefix()));
        Ok(Self { entries })
    }
}

#[async_trait]
impl GeoLookup for StaticGeoLookup {
    async fn lookup(&self, ip: IpAddr) -> Result<String> {
        self.entries
            .iter()
            .find(|(range, _)| range.contains(&ip))
            .map(|(_, country)| country.clone())
            .ok_or_else(|| ClassifierError::lookup(format!("no country known for {ip}")))
    }
}

/// Geographic risk assessor
pub struct GeoRiskAssessor {
    suspicious_ranges: Vec<IpRange>,
    high_risk_countries: BTreeSet<String>,
    range_confidence: f64,
    country_confidence: f64,
    timeout: Duration,
    metrics: Option<Arc<EngineMetrics>>,
}

impl GeoRiskAssessor {
    /// Create a new assessor from configuration
    pub fn new(config: &GeoConfig) -> Result<Self> {
        let suspicious_ranges = config
            .suspicious_ranges
            .iter()
            .map(|r| r.parse())
            .collect::<Result<Vec<IpRange>>>()?;

        Ok(Self {
            suspicious_ranges,
            high_risk_countries: config
                .high_risk_countries
                .iter()
                .map(|c| c.trim().to_uppercase())
                .collect(),
            range_confidence: config.range_confidence,
            country_confidence: config.country_confidence,
            timeout: config.timeout(),
            metrics: None,
        })
    }

    /// Record lookup failures in the given metrics
    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Assess the geographic risk of an email
    ///
    /// Returns the verdict and whether it is conclusive.
    pub async fn assess_risk(
        &self,
        signal: &EmailSignal,
        geo: &dyn GeoLookup,
    ) -> (TierVerdict, bool) {
        let Some(ip) = signal.extracted_ip else {
            return (TierVerdict::no_signal("no public sender IP"), false);
        };

        if let Some(range) = self.suspicious_ranges.iter().find(|r| r.contains(&ip)) {
            debug!(%ip, %range, "Sender IP in suspicious range");
            return (
                TierVerdict {
                    category: Category::Spam,
                    subcategory: Some("Suspicious IP range".to_string()),
                    confidence: self.range_confidence,
                    evidence: vec![format!("sender IP {ip} in suspicious range {range}")],
                },
                true,
            );
        }

        let country = match tokio::time::timeout(self.timeout, geo.lookup(ip)).await {
            Ok(Ok(country)) => country.trim().to_uppercase(),
            Ok(Err(err)) => {
                debug!(%ip, error = %err, "GeoIP lookup failed, treating as unknown");
                if let Some(metrics) = &self.metrics {
                    metrics.record_geo_failure();
                }
                return (TierVerdict::no_signal("geographic origin unknown"), false);
            }
            Err(_) => {
                warn!(%ip, timeout_ms = self.timeout.as_millis() as u64, "GeoIP lookup timed out");
                if let Some(metrics) = &self.metrics {
                    metrics.record_geo_failure();
                }
                return (TierVerdict::no_signal("geographic lookup timed out"), false);
            }
        };

        if self.high_risk_countries.contains(&country) {
            debug!(%ip, country = %country, "Sender IP in high-risk country");
            return (
                TierVerdict {
                    category: Category::Spam,
                    subcategory: Some(format!("High-risk country: {country}")),
                    confidence: self.country_confidence,
                    evidence: vec![format!("sender IP {ip} located in {country}")],
                },
                true,
            );
        }

        (
            TierVerdict::no_signal(format!("sender IP {ip} located in {country}, no red flag")),
            false,
        )
    }
}
