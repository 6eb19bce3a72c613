//! Client fingerprinting: header extraction, normalisation and salted hashing
//! of IP addresses and user agents.
use crate::error::GateError;
use crate::user_agent::canonical_user_agent;
use axum::http::HeaderMap;
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub const UNKNOWN: &str = "unknown";

/// Checked in this order; the first usable value wins.
const IP_HEADERS: [&str; 4] = [
    "x-forwarded-for",
    "x-real-ip",
    "cf-connecting-ip",
    "x-client-ip",
];

/// A header as seen by the fingerprinting code. Repeated headers arrive as
/// `Multi`, which IP extraction refuses to interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderField {
    Single(String),
    Multi(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    fields: HashMap<String, HeaderField>,
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.fields.insert(
            name.to_ascii_lowercase(),
            HeaderField::Single(value.to_string()),
        );
        self
    }

    pub fn with_many(mut self, name: &str, values: &[&str]) -> Self {
        self.fields.insert(
            name.to_ascii_lowercase(),
            HeaderField::Multi(values.iter().map(|v| v.to_string()).collect()),
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&HeaderField> {
        self.fields.get(&name.to_ascii_lowercase())
    }
}

impl From<&HeaderMap> for RequestHeaders {
    fn from(map: &HeaderMap) -> Self {
        let mut fields = HashMap::new();
        for name in map.keys() {
            let values: Vec<String> = map
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            let field = if values.len() == 1 {
                HeaderField::Single(values.into_iter().next().unwrap_or_default())
            } else {
                HeaderField::Multi(values)
            };
            fields.insert(name.as_str().to_string(), field);
        }
        Self { fields }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub ip_hash: String,
    pub ua_hash: String,
}

pub fn normalize_ip(raw: &str) -> String {
    let first = raw.split(',').next().unwrap_or("").trim();
    if first.is_empty() || first.eq_ignore_ascii_case(UNKNOWN) {
        return UNKNOWN.to_string();
    }

    // [v6]:port or [v6]
    if let Some(rest) = first.strip_prefix('[') {
        let inner = rest.split(']').next().unwrap_or(rest);
        return inner.to_ascii_lowercase();
    }

    match first.matches(':').count() {
        0 => first.to_string(),
        // v4:port
        1 => first.split(':').next().unwrap_or(first).to_string(),
        _ => first.to_ascii_lowercase(),
    }
}

pub fn normalize_ua(raw: Option<&HeaderField>) -> String {
    match raw {
        None => UNKNOWN.to_string(),
        Some(HeaderField::Single(v)) if v.is_empty() => UNKNOWN.to_string(),
        Some(HeaderField::Single(v)) => v.clone(),
        // First element verbatim, even when it is blank.
        Some(HeaderField::Multi(values)) => values
            .first()
            .cloned()
            .unwrap_or_else(|| UNKNOWN.to_string()),
    }
}

pub fn extract_ip(headers: &RequestHeaders) -> String {
    for name in IP_HEADERS {
        let value = match headers.get(name) {
            Some(HeaderField::Single(v)) => v,
            // Repeated headers are ambiguous; never pick one.
            Some(HeaderField::Multi(_)) | None => continue,
        };
        let candidate = if name == "x-forwarded-for" {
            value.split(',').next().unwrap_or("").trim()
        } else {
            value.trim()
        };
        if candidate.is_empty() || candidate == UNKNOWN {
            continue;
        }
        return candidate.to_string();
    }
    UNKNOWN.to_string()
}

pub fn extract_ua(headers: &RequestHeaders) -> String {
    normalize_ua(headers.get("user-agent"))
}

/// Unsalted SHA-256, lowercase hex.
pub fn hash(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// HMAC-SHA256 keyed by `salt`, lowercase hex.
pub fn hash_with_salt(value: &str, salt: &str) -> Result<String, GateError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(salt.as_bytes())
        .map_err(|e| GateError::Hashing(format!("invalid HMAC key: {e}")))?;
    mac.update(value.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn hash_ip(raw: &str, salt: &str) -> Result<String, GateError> {
    hash_with_salt(&normalize_ip(raw), salt)
}

pub fn hash_ua(raw: &str, salt: &str) -> Result<String, GateError> {
    let ua = normalize_ua(Some(&HeaderField::Single(raw.to_string())));
    hash_with_salt(&ua, salt)
}

/// Compares in time proportional to the shorter input, without an early exit
/// on the first differing byte.
pub fn secure_compare(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() == b.len() {
        return constant_time_eq(a, b);
    }
    let n = a.len().min(b.len());
    std::hint::black_box(constant_time_eq(&a[..n], &b[..n]));
    false
}

/// Shannon entropy in bits over the character distribution of `s`.
pub fn calculate_entropy(s: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for ch in s.chars() {
        *counts.entry(ch).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    let entropy: f64 = counts
        .values()
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum();
    // -0.0 for single-symbol input
    entropy.abs()
}

/// Holds the deployment salt and produces fingerprints from request headers.
#[derive(Clone)]
pub struct Fingerprinter {
    salt: String,
}

impl Fingerprinter {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    pub fn hash_ip(&self, raw: &str) -> Result<String, GateError> {
        hash_ip(raw, &self.salt)
    }

    pub fn hash_ua(&self, raw: &str) -> Result<String, GateError> {
        hash_ua(raw, &self.salt)
    }

    /// Hash of the canonical browser family, stable across minor version bumps.
    pub fn hash_ua_family(&self, raw: &str) -> Result<String, GateError> {
        hash_with_salt(&canonical_user_agent(raw), &self.salt)
    }

    pub fn fingerprint(&self, headers: &RequestHeaders) -> Result<Fingerprint, GateError> {
        self.fingerprint_values(&extract_ip(headers), &extract_ua(headers))
    }

    pub fn fingerprint_values(&self, ip: &str, ua: &str) -> Result<Fingerprint, GateError> {
        Ok(Fingerprint {
            ip_hash: self.hash_ip(ip)?,
            ua_hash: self.hash_ua(ua)?,
        })
    }
}

impl std::fmt::Debug for Fingerprinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fingerprinter")
            .field("salt", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_hex64(s: &str) -> bool {
        s.len() == 64 && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
    }

    #[test]
    fn sha256_is_64_lower_hex() {
        for input in ["", "hello", "héllo wörld 🚀", "203.0.113.195"] {
            assert!(is_hex64(&hash(input)), "bad digest for {input:?}");
        }
        assert_eq!(
            hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn salted_hash_differs_per_salt() {
        let a = hash_with_salt("1.2.3.4", "salt-a").unwrap();
        let b = hash_with_salt("1.2.3.4", "salt-b").unwrap();
        assert!(is_hex64(&a));
        assert_ne!(a, b);
        assert_eq!(a, hash_with_salt("1.2.3.4", "salt-a").unwrap());
        assert_ne!(a, hash("1.2.3.4"));
    }

    #[test]
    fn normalizes_ip_variants() {
        assert_eq!(normalize_ip("  192.168.1.1  "), "192.168.1.1");
        assert_eq!(normalize_ip("192.168.1.1:8080"), "192.168.1.1");
        assert_eq!(normalize_ip("203.0.113.195, 70.41.3.18"), "203.0.113.195");
        assert_eq!(normalize_ip("[2001:DB8::1]:443"), "2001:db8::1");
        assert_eq!(normalize_ip("[2001:db8::1]"), "2001:db8::1");
        assert_eq!(normalize_ip("2001:DB8::1"), "2001:db8::1");
        assert_eq!(normalize_ip(""), UNKNOWN);
        assert_eq!(normalize_ip("unknown"), UNKNOWN);
    }

    #[test]
    fn hash_ip_ignores_formatting_noise() {
        let base = hash_ip("192.168.1.1", "salt").unwrap();
        assert_eq!(hash_ip("192.168.1.1:5000", "salt").unwrap(), base);
        assert_eq!(hash_ip(" 192.168.1.1 ", "salt").unwrap(), base);
        assert_eq!(hash_ip("192.168.1.1, 10.0.0.1", "salt").unwrap(), base);

        let v6 = hash_ip("2001:db8::1", "salt").unwrap();
        assert_eq!(hash_ip("[2001:DB8::1]:8080", "salt").unwrap(), v6);
    }

    #[test]
    fn normalizes_user_agent() {
        assert_eq!(normalize_ua(None), UNKNOWN);
        assert_eq!(normalize_ua(Some(&HeaderField::Single(String::new()))), UNKNOWN);
        assert_eq!(
            normalize_ua(Some(&HeaderField::Single("Mozilla/5.0".into()))),
            "Mozilla/5.0"
        );
        assert_eq!(
            normalize_ua(Some(&HeaderField::Multi(vec!["A".into(), "B".into()]))),
            "A"
        );
        assert_eq!(
            normalize_ua(Some(&HeaderField::Multi(vec![String::new()]))),
            ""
        );
        assert_eq!(normalize_ua(Some(&HeaderField::Multi(vec![]))), UNKNOWN);
        // only an empty value falls back; whitespace passes through
        assert_eq!(normalize_ua(Some(&HeaderField::Single(" ".into()))), " ");
        assert_ne!(hash_ua(" ", "salt").unwrap(), hash_ua("unknown", "salt").unwrap());
        assert_eq!(hash_ua("", "salt").unwrap(), hash_ua("unknown", "salt").unwrap());
    }

    #[test]
    fn extract_ip_follows_precedence() {
        let headers = RequestHeaders::new()
            .with("x-client-ip", "1.1.1.1")
            .with("x-real-ip", "2.2.2.2")
            .with("x-forwarded-for", "3.3.3.3");
        assert_eq!(extract_ip(&headers), "3.3.3.3");

        let headers = RequestHeaders::new()
            .with("x-client-ip", "1.1.1.1")
            .with("cf-connecting-ip", "4.4.4.4");
        assert_eq!(extract_ip(&headers), "4.4.4.4");

        let headers = RequestHeaders::new()
            .with("x-forwarded-for", "unknown")
            .with("x-real-ip", "2.2.2.2");
        assert_eq!(extract_ip(&headers), "2.2.2.2");

        assert_eq!(extract_ip(&RequestHeaders::new()), UNKNOWN);
    }

    #[test]
    fn extract_ip_rejects_repeated_headers() {
        let headers =
            RequestHeaders::new().with_many("x-forwarded-for", &["203.0.113.195", "backup"]);
        assert_eq!(extract_ip(&headers), UNKNOWN);
    }

    #[test]
    fn header_map_conversion_keeps_repeats() {
        let mut map = HeaderMap::new();
        map.append("x-forwarded-for", "203.0.113.195".parse().unwrap());
        map.append("x-forwarded-for", "backup".parse().unwrap());
        map.insert("user-agent", "curl/8.0".parse().unwrap());
        let headers = RequestHeaders::from(&map);
        assert!(matches!(
            headers.get("X-Forwarded-For"),
            Some(HeaderField::Multi(v)) if v.len() == 2
        ));
        assert_eq!(extract_ua(&headers), "curl/8.0");
    }

    #[test]
    fn secure_compare_matches_equality() {
        assert!(secure_compare("abc123", "abc123"));
        assert!(!secure_compare("abc123", "abc124"));
        assert!(!secure_compare("abc", "abc123"));
        assert!(!secure_compare("abc123", "abc"));
        assert!(!secure_compare("", "a"));
        assert!(secure_compare("", ""));
    }

    #[test]
    fn entropy_grows_with_diversity() {
        assert_eq!(calculate_entropy(""), 0.0);
        assert_eq!(calculate_entropy("aaaa"), 0.0);
        assert!((calculate_entropy("ab") - 1.0).abs() < 1e-9);
        assert!((calculate_entropy("abcd") - 2.0).abs() < 1e-9);
        assert!(calculate_entropy("abcdefgh") > calculate_entropy("aabbccdd"));
    }

    #[test]
    fn fingerprint_from_forwarded_headers() {
        let fp = Fingerprinter::new("salt");
        let headers = RequestHeaders::new()
            .with("x-forwarded-for", "203.0.113.195, 70.41.3.18")
            .with("user-agent", "Mozilla/5.0 (X11; Linux x86_64)");
        let print = fp.fingerprint(&headers).unwrap();
        assert_eq!(print.ip_hash, hash_ip("203.0.113.195", "salt").unwrap());
        assert_eq!(
            print.ua_hash,
            hash_ua("Mozilla/5.0 (X11; Linux x86_64)", "salt").unwrap()
        );
    }
}
