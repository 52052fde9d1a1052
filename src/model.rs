use std::collections::BTreeMap;
use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

// ── Raw extraction output ──

/// One work item as produced by the extractor, or a null-filled placeholder when
/// extraction failed. Field names are whatever the origin catalog uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub url: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RawRecord {
    pub fn new(url: impl Into<String>, origin: impl Into<String>) -> Self {
        RawRecord {
            url: url.into(),
            origin: origin.into(),
            error: None,
            fields: Map::new(),
        }
    }

    /// Placeholder for a failed item: every known field present and null.
    pub fn failed<'a>(
        url: &str,
        origin: &str,
        field_names: impl IntoIterator<Item = &'a str>,
        error: impl Into<String>,
    ) -> Self {
        let fields = field_names
            .into_iter()
            .filter(|f| *f != "url")
            .map(|f| (f.to_string(), Value::Null))
            .collect();
        RawRecord {
            url: url.to_string(),
            origin: origin.to_string(),
            error: Some(error.into()),
            fields,
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Field value, with JSON null treated as absent.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ── Price ──

/// Non-negative amount held in hundredths, so two decimals are exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Price(u64);

impl Price {
    pub const ZERO: Price = Price(0);

    /// Rounds to two decimals. Negative or non-finite input has no price.
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        Some(Price((value * 100.0).round() as u64))
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
impl Price {
    pub fn from_cents(cents: u64) -> Self {
        Price(cents)
    }

    pub fn cents(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for Price {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Price::from_f64(value)
            .ok_or_else(|| de::Error::custom(format!("invalid price: {}", value)))
    }
}

// ── Products ──

/// Origin tag of a record, or `merged` once reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Source {
    Origin(String),
    Merged,
}

pub const MERGED: &str = "merged";

impl Source {
    pub fn as_str(&self) -> &str {
        match self {
            Source::Origin(tag) => tag,
            Source::Merged => MERGED,
        }
    }
}

impl From<String> for Source {
    fn from(s: String) -> Self {
        if s == MERGED {
            Source::Merged
        } else {
            Source::Origin(s)
        }
    }
}

impl From<Source> for String {
    fn from(s: Source) -> Self {
        match s {
            Source::Origin(tag) => tag,
            Source::Merged => MERGED.to_string(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit trail attached to records built from more than one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub original_sources: Vec<String>,
    pub merged_from: usize,
    /// Field name → origin tag the selected value came from.
    pub merged_criteria: BTreeMap<String, String>,
    /// Fields no member could supply a usable value for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub upc: Option<String>,
    #[serde(default)]
    pub price: Price,
    pub source_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_urls: Vec<String>,
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub provenance: Option<Provenance>,
}

#[cfg(test)]
impl Product {
    pub fn is_merged(&self) -> bool {
        self.source == Source::Merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_rounds_to_hundredths() {
        assert_eq!(Price::from_f64(9.99).unwrap().cents(), 999);
        assert_eq!(Price::from_f64(4.499).unwrap().cents(), 450);
        assert_eq!(Price::from_f64(6.0).unwrap().to_string(), "6.00");
        assert!(Price::from_f64(-1.0).is_none());
        assert!(Price::from_f64(f64::NAN).is_none());
    }

    #[test]
    fn price_serializes_as_number() {
        let json = serde_json::to_string(&Price::from_cents(450)).unwrap();
        assert_eq!(json, "4.5");
        let back: Price = serde_json::from_str("12.5").unwrap();
        assert_eq!(back.cents(), 1250);
    }

    #[test]
    fn source_round_trips_through_string() {
        let s: Source = serde_json::from_str("\"merged\"").unwrap();
        assert_eq!(s, Source::Merged);
        let s: Source = serde_json::from_str("\"rol\"").unwrap();
        assert_eq!(s, Source::Origin("rol".into()));
    }

    #[test]
    fn raw_record_keeps_unknown_fields() {
        let raw: RawRecord = serde_json::from_str(
            r#"{"nombre":"Galleta","precio":"S/ 5.00","url":"https://a/1","origin":"montania"}"#,
        )
        .unwrap();
        assert_eq!(raw.url, "https://a/1");
        assert_eq!(raw.field("nombre"), Some(&Value::from("Galleta")));
        assert!(!raw.fields.contains_key("url"));
    }

    #[test]
    fn failed_record_nulls_every_field() {
        let raw = RawRecord::failed("https://a/1", "rol", ["nombre", "sku", "url"], "timeout");
        assert!(raw.is_error());
        assert_eq!(raw.fields.len(), 2);
        assert!(raw.fields.values().all(Value::is_null));
    }

    #[test]
    fn merged_product_flattens_provenance() {
        let p = Product {
            id: "merged_123456_t".into(),
            name: Some("Cookie".into()),
            brand: None,
            upc: Some("123456".into()),
            price: Price::from_cents(450),
            source_image_url: None,
            source_url: Some("https://a/1".into()),
            source_urls: vec![],
            source: Source::Merged,
            error: None,
            provenance: Some(Provenance {
                original_sources: vec!["A".into(), "B".into()],
                merged_from: 2,
                merged_criteria: BTreeMap::from([("name".to_string(), "A".to_string())]),
                unresolved: vec![],
            }),
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["originalSources"], serde_json::json!(["A", "B"]));
        assert_eq!(v["mergedCriteria"]["name"], "A");
        assert_eq!(v["source"], "merged");
        let back: Product = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }
}
