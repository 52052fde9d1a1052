use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::OriginProfile;
use crate::model::{Price, Product, RawRecord, Source};

/// Minimum digit count for a UPC to count as an identity.
pub const MIN_UPC_DIGITS: usize = 6;

static CURRENCY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"S/\.?|[$€£¥]|\s+").unwrap());

#[derive(Debug, Error, PartialEq)]
pub enum PriceError {
    #[error("price is missing")]
    Missing,
    #[error("unsupported price value: {0}")]
    Unsupported(String),
    #[error("unparseable price: {0:?}")]
    Unparseable(String),
    #[error("price out of range: {0}")]
    OutOfRange(String),
}

// ── Prices ──

/// Parse a raw price into hundredths.
///
/// Strings lose their currency markers and whitespace. A value with more than one
/// decimal separator ("8.50.50") keeps only its first two segments: that repairs one
/// observed upstream defect and will mis-read any other multi-dot format.
pub fn parse_price(raw: &Value) -> Result<Price, PriceError> {
    match raw {
        Value::Null => Err(PriceError::Missing),
        Value::Number(n) => {
            let value = n
                .as_f64()
                .ok_or_else(|| PriceError::Unsupported(n.to_string()))?;
            Price::from_f64(value).ok_or_else(|| PriceError::OutOfRange(n.to_string()))
        }
        Value::String(s) => parse_price_str(s),
        other => Err(PriceError::Unsupported(other.to_string())),
    }
}

fn parse_price_str(s: &str) -> Result<Price, PriceError> {
    let cleaned = CURRENCY_RE.replace_all(s, "");
    let segments: Vec<&str> = cleaned.split('.').collect();
    let candidate = if segments.len() > 2 {
        format!("{}.{}", segments[0], segments[1])
    } else {
        cleaned.to_string()
    };

    if candidate.is_empty() {
        return Err(PriceError::Unparseable(s.to_string()));
    }
    let value: f64 = candidate
        .parse()
        .map_err(|_| PriceError::Unparseable(s.to_string()))?;
    Price::from_f64(value).ok_or_else(|| PriceError::OutOfRange(s.to_string()))
}

/// Total version of [`parse_price`]: anything unusable becomes 0 with a warning.
pub fn normalize_price(raw: &Value) -> Price {
    parse_price(raw).unwrap_or_else(|e| {
        warn!(raw = %raw, error = %e, "Could not parse price, using 0");
        Price::ZERO
    })
}

// ── Identifiers ──

/// Digits only; `None` unless at least six remain. No check-digit validation.
pub fn normalize_upc(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < MIN_UPC_DIGITS {
        None
    } else {
        Some(digits)
    }
}

pub fn upc_from_value(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) => normalize_upc(s),
        Value::Number(n) => normalize_upc(&n.to_string()),
        _ => None,
    }
}

/// Stable id for a single-source record: origin plus UPC, or origin plus a hash of
/// the source URL when there is no identity.
pub fn product_id(origin: &str, upc: Option<&str>, source_url: &str) -> String {
    match upc {
        Some(upc) => format!("{}_{}", origin, upc),
        None => format!("{}_u{:016x}", origin, fnv1a(source_url.as_bytes())),
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

// ── Records ──

#[derive(Debug, Default, Clone, PartialEq)]
pub struct NormalizeStats {
    pub total: usize,
    pub kept: usize,
    pub dropped: usize,
    pub failed_items: usize,
    /// Prices that normalized to 0, failed items excluded.
    pub price_failures: usize,
    pub placeholder_images: usize,
}

impl NormalizeStats {
    pub fn print(&self) {
        println!(
            "Normalized {} of {} records ({} dropped, {} failed items, {} zero prices, {} placeholder images).",
            self.kept,
            self.total,
            self.dropped,
            self.failed_items,
            self.price_failures,
            self.placeholder_images,
        );
    }
}

/// Maps one origin's raw records onto [`Product`].
pub struct Normalizer<'a> {
    origin: &'a str,
    profile: &'a OriginProfile,
    stats: NormalizeStats,
}

impl<'a> Normalizer<'a> {
    pub fn new(origin: &'a str, profile: &'a OriginProfile) -> Self {
        Normalizer {
            origin,
            profile,
            stats: NormalizeStats::default(),
        }
    }

    /// `None` when the record has no source URL to audit it by.
    pub fn record(&mut self, raw: &RawRecord) -> Option<Product> {
        self.stats.total += 1;

        let source_url = raw.url.trim();
        if source_url.is_empty() {
            warn!(origin = self.origin, "Dropping record without source URL");
            self.stats.dropped += 1;
            return None;
        }

        if raw.is_error() {
            self.stats.failed_items += 1;
        }

        let name = self.lookup(raw, "name").and_then(text);
        let brand = self.lookup(raw, "brand").and_then(text);
        let upc = self.lookup(raw, "upc").and_then(upc_from_value);
        let price = self.price(raw);

        let mut source_image_url = self.lookup(raw, "sourceImageUrl").and_then(text);
        if let Some(img) = &source_image_url {
            if self.profile.placeholder_images.iter().any(|p| p == img) {
                debug!(url = source_url, "Placeholder image replaced with null");
                self.stats.placeholder_images += 1;
                source_image_url = None;
            }
        }

        self.stats.kept += 1;
        Some(Product {
            id: product_id(self.origin, upc.as_deref(), source_url),
            name,
            brand,
            upc,
            price,
            source_image_url,
            source_url: Some(source_url.to_string()),
            source_urls: Vec::new(),
            source: Source::Origin(self.origin.to_string()),
            error: raw.error.clone(),
            provenance: None,
        })
    }

    fn price(&mut self, raw: &RawRecord) -> Price {
        let value = self.lookup(raw, "price").unwrap_or(&Value::Null);
        // Failed items carry null prices by construction.
        if raw.is_error() && value.is_null() {
            return Price::ZERO;
        }
        let price = tracing::info_span!("price", url = %raw.url, origin = self.origin)
            .in_scope(|| normalize_price(value));
        if price.is_zero() {
            self.stats.price_failures += 1;
        }
        price
    }

    /// Canonical name first, then any raw alias the profile maps onto it.
    fn lookup<'r>(&self, raw: &'r RawRecord, canonical: &str) -> Option<&'r Value> {
        raw.field(canonical).or_else(|| {
            self.profile
                .aliases_for(canonical)
                .find_map(|alias| raw.field(alias))
        })
    }
}

pub fn normalize_batch(
    origin: &str,
    profile: &OriginProfile,
    raws: &[RawRecord],
) -> (Vec<Product>, NormalizeStats) {
    let mut normalizer = Normalizer::new(origin, profile);
    let products: Vec<Product> = raws.iter().filter_map(|r| normalizer.record(r)).collect();
    (products, normalizer.stats)
}

fn text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
