/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Signal extraction
//!
//! Derives the immutable [`EmailSignal`] bundle from a raw email record.
//! Extraction never fails: malformed senders and missing headers produce
//! empty or neutral values so the email ends up as a low-confidence
//! verdict instead of an error.

use crate::patterns::PatternMatcher;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Raw email record handed over by the fetch layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEmail {
    /// Message identity (Message-ID or mailbox UID)
    pub message_id: String,
    /// From header value
    pub sender: String,
    /// Subject header value
    pub subject: String,
    /// Raw header block
    pub headers: String,
}

impl RawEmail {
    /// Create a raw email record
    pub fn new<I, S, T, H>(message_id: I, sender: S, subject: T, headers: H) -> Self
    where
        I: Into<String>,
        S: Into<String>,
        T: Into<String>,
        H: Into<String>,
    {
        Self {
            message_id: message_id.into(),
            sender: sender.into(),
            subject: subject.into(),
            headers: headers.into(),
        }
    }

    /// Stable identity used for routing decisions
    ///
    /// Falls back to sender and subject when the message has no id.
    pub fn identity(&self) -> String {
        identity_of(&self.message_id, &self.sender, &self.subject)
    }
}

/// Features derived once per classification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailSignal {
    /// Message identity
    pub message_id: String,
    /// Normalized sender address
    pub sender: String,
    /// Local part of the sender address
    pub sender_local_part: String,
    /// Lower-case sender domain, empty when unparseable
    pub sender_domain: String,
    /// Registrable part of the sender domain, e.g. `example.co.uk`
    pub registrable_domain: String,
    /// Subject line
    pub subject: String,
    /// Raw header block
    pub header_text: String,
    /// First public IP found in the headers
    pub extracted_ip: Option<IpAddr>,
    /// Top level domain of the sender
    pub tld: String,
    /// Gibberish score of the sender domain (0.0 to 1.0)
    pub gibberish_score: f64,
    /// Whether the domain looks machine generated
    pub is_gibberish_domain: bool,
    /// Whether the TLD is in the risky set
    pub tld_risk_flag: bool,
    /// Matched keywords, lower-cased
    pub matched_keywords: BTreeSet<String>,
}

impl EmailSignal {
    /// Stable identity used for routing decisions
    pub fn identity(&self) -> String {
        identity_of(&self.message_id, &self.sender, &self.subject)
    }
}

fn identity_of(message_id: &str, sender: &str, subject: &str) -> String {
    let message_id = message_id.trim();
    if message_id.is_empty() {
        format!("{}\n{}", sender.trim().to_lowercase(), subject)
    } else {
        message_id.to_string()
    }
}

/// Signal extractor
pub struct SignalExtractor {
    matcher: Arc<dyn PatternMatcher>,
    risky_tlds: BTreeSet<String>,
    gibberish_threshold: f64,
}

impl SignalExtractor {
    /// Create a new signal extractor
    pub fn new(
        matcher: Arc<dyn PatternMatcher>,
        risky_tlds: BTreeSet<String>,
        gibberish_threshold: f64,
    ) -> Self {
        Self {
            matcher,
            risky_tlds: risky_tlds
                .into_iter()
                .map(|t| t.trim_start_matches('.').to_lowercase())
                .collect(),
            gibberish_threshold,
        }
    }

    /// Derive the signal bundle of one email
    pub fn extract(&self, raw: &RawEmail) -> EmailSignal {
        let (local_part, domain) = parse_sender(&raw.sender);
        let sender = if domain.is_empty() {
            local_part.clone()
        } else {
            format!("{local_part}@{domain}")
        };

        let tld = domain.rsplit('.').next().unwrap_or_default().to_string();
        let tld_risk_flag = !tld.is_empty() && self.risky_tlds.contains(&tld);
        let registrable_domain = registrable_domain(&domain).unwrap_or_default().to_string();
        let gibberish_score = gibberish_score(registrable_label(&domain));
        let is_gibberish_domain = gibberish_score >= self.gibberish_threshold;

        let matched_keywords = self
            .matcher
            .find_keywords(&format!("{} {}", raw.subject, raw.sender));

        let extracted_ip = extract_sender_ip(&raw.headers);

        debug!(
            message_id = %raw.message_id,
            domain = %domain,
            ip = ?extracted_ip,
            keywords = matched_keywords.len(),
            gibberish = gibberish_score,
            "Extracted email signal"
        );

        EmailSignal {
            message_id: raw.message_id.clone(),
            sender,
            sender_local_part: local_part,
            sender_domain: domain,
            registrable_domain,
            subject: raw.subject.clone(),
            header_text: raw.headers.clone(),
            extracted_ip,
            tld,
            gibberish_score,
            is_gibberish_domain,
            tld_risk_flag,
            matched_keywords,
        }
    }
}

/// Split a From value into lower-case local part and domain
///
/// Accepts `Name <user@example.com>` and bare addresses. Without an `@`
/// the whole value becomes the local part and the domain is empty.
pub fn parse_sender(sender: &str) -> (String, String) {
    let address = match (sender.rfind('<'), sender.rfind('>')) {
        (Some(start), Some(end)) if start < end => &sender[start + 1..end],
        _ => sender,
    };
    let address = address.trim().trim_matches('"').to_lowercase();

    match address.rsplit_once('@') {
        Some((local, domain)) => (
            local.trim().to_string(),
            domain.trim().trim_end_matches('.').to_string(),
        ),
        None => (address, String::new()),
    }
}

/// Registrable domain of a host name according to the public suffix list
///
/// Returns `None` for empty names and for names that are themselves a
/// public suffix, such as `co.uk`.
pub fn registrable_domain(domain: &str) -> Option<&str> {
    psl::domain_str(domain.trim_end_matches('.'))
}

/// Label of the domain that identifies the registrant
///
/// `mail.example.co.uk` yields `example`. Names without a registrable
/// domain fall back to their first label.
pub fn registrable_label(domain: &str) -> &str {
    let domain = domain.trim_end_matches('.');
    match (psl::domain_str(domain), psl::suffix_str(domain)) {
        (Some(registrable), Some(suffix)) => registrable
            .strip_suffix(suffix)
            .and_then(|rest| rest.strip_suffix('.'))
            .unwrap_or(registrable),
        _ => domain.split('.').find(|l| !l.is_empty()).unwrap_or_default(),
    }
}

/// Score how machine generated a domain label looks (0.0 to 1.0)
pub fn gibberish_score(label: &str) -> f64 {
    let label = label.to_lowercase();
    let letters: Vec<char> = label.chars().filter(|c| c.is_ascii_alphabetic()).collect();
    if letters.len() < 4 {
        return 0.0;
    }

    let is_vowel = |c: &char| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u');
    let vowels = letters.iter().filter(|c| is_vowel(c)).count();
    let vowel_ratio = vowels as f64 / letters.len() as f64;

    let mut longest_run = 0;
    let mut run = 0;
    for c in &letters {
        if is_vowel(c) {
            run = 0;
        } else {
            run += 1;
            longest_run = longest_run.max(run);
        }
    }

    let digits = label.chars().filter(|c| c.is_ascii_digit()).count();
    let hyphens = label.matches('-').count();

    let mut score: f64 = 0.0;
    score += match longest_run {
        r if r >= 5 => 0.4,
        4 => 0.2,
        _ => 0.0,
    };
    score += match vowel_ratio {
        v if v < 0.15 => 0.35,
        v if v < 0.25 => 0.2,
        _ => 0.0,
    };
    if digits >= 2 {
        score += 0.15;
    }
    if label.len() > 15 {
        score += 0.1;
    }
    if hyphens >= 2 {
        score += 0.1;
    }

    score.min(1.0)
}

fn ip_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\[IPv6:([0-9a-f:.]+)\]|\b((?:\d{1,3}\.){3}\d{1,3})\b")
            .expect("static IP token pattern")
    })
}

/// Headers consulted for the sender IP, in priority order
const IP_HEADERS: [&str; 4] = ["received", "x-originating-ip", "x-sender-ip", "x-real-ip"];

/// Extract the first public sender IP from a raw header block
///
/// All `Received` headers are consulted first, in order, followed by
/// `X-Originating-IP`, `X-Sender-IP` and `X-Real-IP`. Private, loopback and
/// other non-routable addresses are skipped.
pub fn extract_sender_ip(headers: &str) -> Option<IpAddr> {
    let unfolded = unfold_headers(headers);

    for header in IP_HEADERS {
        for (name, value) in &unfolded {
            if !name.eq_ignore_ascii_case(header) {
                continue;
            }

            if let Some(ip) = parse_bare_ip(value).filter(is_public_ip) {
                return Some(ip);
            }

            for captures in ip_token_regex().captures_iter(value) {
                let token = captures.get(1).or_else(|| captures.get(2));
                if let Some(ip) = token
                    .and_then(|m| m.as_str().parse::<IpAddr>().ok())
                    .filter(is_public_ip)
                {
                    return Some(ip);
                }
            }
        }
    }

    None
}

fn parse_bare_ip(value: &str) -> Option<IpAddr> {
    value
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}

/// Split a header block into (name, value) pairs, joining folded lines
fn unfold_headers(headers: &str) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();

    for line in headers.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = fields.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }

        if let Some((name, value)) = line.split_once(':') {
            fields.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    fields
}

/// Whether an address is publicly routable
pub fn is_public_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            let shared = octets[0] == 100 && (octets[1] & 0xc0) == 64;
            let reserved = octets[0] == 0 || octets[0] >= 240;
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
                || shared
                || reserved)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_public_ip(&IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            let unique_local = (first & 0xfe00) == 0xfc00;
            let link_local = (first & 0xffc0) == 0xfe80;
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || unique_local
                || link_local)
        }
    }
}
