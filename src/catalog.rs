use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{Price, Product, Provenance, Source};

/// Final catalog record: a product whose provenance URLs are always a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: String,
    pub name: Option<String>,
    pub brand: Option<String>,
    pub upc: Option<String>,
    pub price: Price,
    pub source_image_url: Option<String>,
    pub source_urls: Vec<String>,
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub provenance: Option<Provenance>,
}

impl From<Product> for CatalogEntry {
    fn from(p: Product) -> Self {
        let source_urls = if !p.source_urls.is_empty() {
            p.source_urls
        } else {
            p.source_url.into_iter().collect()
        };
        CatalogEntry {
            id: p.id,
            name: p.name,
            brand: p.brand,
            upc: p.upc,
            price: p.price,
            source_image_url: p.source_image_url,
            source_urls,
            source: p.source,
            error: p.error,
            provenance: p.provenance,
        }
    }
}

pub fn assemble(products: Vec<Product>) -> Vec<CatalogEntry> {
    products.into_iter().map(CatalogEntry::from).collect()
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogStats {
    pub total: usize,
    pub with_image: usize,
    pub with_price: usize,
    pub with_brand: usize,
    pub with_upc: usize,
    pub with_error: usize,
    pub by_source: BTreeMap<String, usize>,
}

impl CatalogStats {
    pub fn from_entries(entries: &[CatalogEntry]) -> Self {
        let mut stats = CatalogStats {
            total: entries.len(),
            ..Default::default()
        };
        for e in entries {
            stats.with_image += e.source_image_url.is_some() as usize;
            stats.with_price += !e.price.is_zero() as usize;
            stats.with_brand += e.brand.is_some() as usize;
            stats.with_upc += e.upc.is_some() as usize;
            stats.with_error += e.error.is_some() as usize;
            *stats.by_source.entry(e.source.to_string()).or_default() += 1;
        }
        stats
    }

    pub fn print(&self) {
        let pct = |n: usize| {
            if self.total == 0 {
                0.0
            } else {
                n as f64 * 100.0 / self.total as f64
            }
        };
        println!("Catalog: {} products", self.total);
        println!("  with image: {:>6} ({:.1}%)", self.with_image, pct(self.with_image));
        println!("  with price: {:>6} ({:.1}%)", self.with_price, pct(self.with_price));
        println!("  with brand: {:>6} ({:.1}%)", self.with_brand, pct(self.with_brand));
        println!("  with UPC:   {:>6} ({:.1}%)", self.with_upc, pct(self.with_upc));
        if self.with_error > 0 {
            println!("  failed:     {:>6} ({:.1}%)", self.with_error, pct(self.with_error));
        }
        for (source, n) in &self.by_source {
            println!("  {:<10}  {:>6}", source, n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: &str, url: Option<&str>, urls: &[&str]) -> Product {
        Product {
            id: id.to_string(),
            name: Some("n".into()),
            brand: None,
            upc: None,
            price: Price::ZERO,
            source_image_url: None,
            source_url: url.map(str::to_string),
            source_urls: urls.iter().map(|s| s.to_string()).collect(),
            source: Source::Origin("rol".into()),
            error: None,
            provenance: None,
        }
    }

    #[test]
    fn every_entry_has_source_urls_only() {
        let entries = assemble(vec![
            product("one", Some("https://a/1"), &[]),
            product("many", Some("https://a/2"), &["https://a/2", "https://b/2"]),
            product("none", None, &[]),
        ]);
        let urls: Vec<usize> = entries.iter().map(|e| e.source_urls.len()).collect();
        assert_eq!(urls, vec![1, 2, 0]);

        for v in serde_json::to_value(&entries).unwrap().as_array().unwrap() {
            assert!(v.get("sourceUrls").is_some_and(|u| u.is_array()));
            assert!(v.get("sourceUrl").is_none());
        }
    }

    #[test]
    fn stats_count_populated_fields() {
        let mut with_all = product("x", Some("https://a/x"), &[]);
        with_all.brand = Some("Acme".into());
        with_all.upc = Some("123456".into());
        with_all.price = Price::from_cents(100);
        with_all.source_image_url = Some("https://img".into());
        with_all.source = Source::Merged;
        let entries = assemble(vec![with_all, product("y", None, &[])]);

        let stats = CatalogStats::from_entries(&entries);
        assert_eq!(stats.total, 2);
        assert_eq!(
            (stats.with_image, stats.with_price, stats.with_brand, stats.with_upc),
            (1, 1, 1, 1)
        );
        assert_eq!(stats.by_source["merged"], 1);
        assert_eq!(stats.by_source["rol"], 1);
    }
}
