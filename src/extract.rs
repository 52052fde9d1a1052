use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use serde_json::Value;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::{debug, warn};

use crate::config::OriginProfile;
use crate::model::RawRecord;

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 2000;

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Turns one work-list locator into a raw record, or fails for that item.
pub trait Extractor {
    fn extract(&self, locator: &str) -> impl Future<Output = Result<RawRecord>>;
}

/// An origin's regex patterns, compiled once.
pub struct FieldPatterns {
    origin: String,
    patterns: Vec<(String, Regex)>,
    required: Vec<String>,
}

impl FieldPatterns {
    pub fn compile(origin: &str, profile: &OriginProfile) -> Result<Self> {
        if profile.patterns.is_empty() {
            bail!("Origin '{}' has no extraction patterns configured", origin);
        }
        let patterns = profile
            .patterns
            .iter()
            .map(|(field, pat)| {
                let re = Regex::new(pat)
                    .with_context(|| format!("Bad pattern for {}.{}", origin, field))?;
                Ok((field.clone(), re))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(FieldPatterns {
            origin: origin.to_string(),
            patterns,
            required: profile.required.clone(),
        })
    }

    /// Pull every configured field out of a page. A required field that does not
    /// match is an error, never a partially filled record.
    pub fn apply(&self, url: &str, html: &str) -> Result<RawRecord> {
        let mut record = RawRecord::new(url, self.origin.as_str());
        for (field, re) in &self.patterns {
            let value = re
                .captures(html)
                .and_then(|c| c.get(1).or_else(|| c.get(0)))
                .map(|m| clean_text(m.as_str()))
                .filter(|s| !s.is_empty());
            record = record.with_field(field, value.map_or(Value::Null, Value::String));
        }

        if let Some(missing) = self.required.iter().find(|f| record.field(f).is_none()) {
            bail!("Required field '{}' not found", missing);
        }
        Ok(record)
    }
}

/// Strip markup, decode the common entities and collapse whitespace.
fn clean_text(s: &str) -> String {
    let text = TAG_RE.replace_all(s, " ");
    let text = decode_entities(&text);
    SPACE_RE.replace_all(text.trim(), " ").to_string()
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#039;", "'")
        .replace("&amp;", "&")
}

/// Fetches raw pages through spider.cloud and applies the origin's patterns.
pub struct SpiderExtractor {
    spider: Spider,
    patterns: FieldPatterns,
}

struct Page {
    content: String,
    url: Option<String>,
}

impl SpiderExtractor {
    pub fn new(origin: &str, profile: &OriginProfile) -> Result<Self> {
        let patterns = FieldPatterns::compile(origin, profile)?;
        let api_key = std::env::var("SPIDER_API_KEY")
            .map_err(|_| anyhow!("SPIDER_API_KEY environment variable must be set"))?;
        let spider = Spider::new(Some(api_key))
            .map_err(|e| anyhow!("Failed to create Spider client: {}", e))?;
        Ok(SpiderExtractor { spider, patterns })
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<Page> {
        let mut attempt = 0;
        loop {
            match self.fetch(url).await {
                Ok(page) => return Ok(page),
                Err(e) if attempt < MAX_RETRIES && is_retryable(&e.to_string()) => {
                    let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
                    warn!(
                        "Rate limited on {} (attempt {}/{}), backing off {:.1}s",
                        url,
                        attempt + 1,
                        MAX_RETRIES,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<Page> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            ..Default::default()
        };

        let response = self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
            .map_err(|e| anyhow!("Spider scrape failed: {}", e))?;

        let parsed: Value = match response.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
            None => response,
        };
        let first = parsed
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| anyhow!("Empty spider response"))?;

        if let Some(status) = first.get("status").and_then(Value::as_i64) {
            if status >= 400 {
                bail!("HTTP {}", status);
            }
        }

        let content = first
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("No content in spider response"))?
            .to_string();
        let url = first.get("url").and_then(Value::as_str).map(str::to_string);
        Ok(Page { content, url })
    }
}

impl Extractor for SpiderExtractor {
    async fn extract(&self, locator: &str) -> Result<RawRecord> {
        let page = self.fetch_with_retry(locator).await?;
        let resolved = page.url.as_deref().unwrap_or(locator);
        debug!(url = locator, bytes = page.content.len(), "Fetched page");
        self.patterns.apply(resolved, &page.content)
    }
}

fn is_retryable(err: &str) -> bool {
    ["429", "rate", "500", "502", "503"].iter().any(|code| err.contains(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::from_config;
    use ::config::{Config, File, FileFormat};

    fn rol_patterns() -> FieldPatterns {
        let cfg = Config::builder()
            .add_source(File::new("catalog.example.toml", FileFormat::Toml))
            .build()
            .unwrap();
        let settings = from_config(cfg).unwrap();
        FieldPatterns::compile("rol", settings.origin("rol").unwrap()).unwrap()
    }

    fn fixture() -> String {
        std::fs::read_to_string("tests/fixtures/rol_product.html").unwrap()
    }

    #[test]
    fn pulls_configured_fields() {
        let rec = rol_patterns()
            .apply("https://www.rol.com.pe/product/galleta-soda", &fixture())
            .unwrap();
        assert_eq!(rec.origin, "rol");
        assert_eq!(
            rec.field("nombre"),
            Some(&Value::from("Galleta Soda Field & Co 6 x 34g"))
        );
        assert_eq!(rec.field("sku"), Some(&Value::from("7750168001519")));
        assert_eq!(rec.field("precio"), Some(&Value::from("S/ 4.50")));
        assert!(rec.field("imagen").is_some());
    }

    #[test]
    fn missing_required_field_fails() {
        let html = fixture().replace("bs-product__sku", "something-else");
        let err = rol_patterns().apply("https://x", &html).unwrap_err();
        assert!(err.to_string().contains("sku"));
    }

    #[test]
    fn optional_field_becomes_null() {
        let html = fixture().replace("bs-product__image", "nope");
        let rec = rol_patterns().apply("https://x", &html).unwrap();
        assert!(rec.fields.contains_key("imagen"));
        assert!(rec.field("imagen").is_none());
    }

    #[test]
    fn patterns_required() {
        let err = FieldPatterns::compile("rol", &OriginProfile::default()).err().unwrap();
        assert!(err.to_string().contains("no extraction patterns"));
    }

    #[test]
    fn text_cleanup() {
        assert_eq!(
            clean_text("  <b>Tom &amp; Jerry</b>\n  &quot;XL&quot; "),
            "Tom & Jerry \"XL\""
        );
        assert!(is_retryable("HTTP 503"));
        assert!(!is_retryable("HTTP 404"));
    }
}
