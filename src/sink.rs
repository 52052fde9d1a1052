use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::CatalogEntry;

/// Destination for the assembled catalog. Rows are keyed by `id`; an existing row
/// with the same id is overwritten in full.
pub trait CatalogSink {
    fn upsert(&mut self, batch: &[CatalogEntry]) -> impl Future<Output = Result<usize>>;
}

/// Row shape shared by both sinks.
#[derive(Debug, Serialize)]
struct Row<'a> {
    id: &'a str,
    name: Option<&'a str>,
    brand: Option<&'a str>,
    upc: Option<&'a str>,
    price: f64,
    source_image_url: Option<&'a str>,
    source_urls: &'a [String],
    source: String,
    error: Option<&'a str>,
    original_sources: Option<&'a [String]>,
    merged_from: Option<usize>,
}

impl<'a> From<&'a CatalogEntry> for Row<'a> {
    fn from(e: &'a CatalogEntry) -> Self {
        Row {
            id: &e.id,
            name: e.name.as_deref(),
            brand: e.brand.as_deref(),
            upc: e.upc.as_deref(),
            price: e.price.as_f64(),
            source_image_url: e.source_image_url.as_deref(),
            source_urls: &e.source_urls,
            source: e.source.to_string(),
            error: e.error.as_deref(),
            original_sources: e.provenance.as_ref().map(|p| p.original_sources.as_slice()),
            merged_from: e.provenance.as_ref().map(|p| p.merged_from),
        }
    }
}

// ── SQLite ──

pub struct SqliteSink {
    conn: Connection,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        }
        let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS products (
                id               TEXT PRIMARY KEY,
                name             TEXT,
                brand            TEXT,
                upc              TEXT,
                price            REAL NOT NULL DEFAULT 0,
                source_image_url TEXT,
                source_urls      TEXT NOT NULL DEFAULT '[]',
                source           TEXT NOT NULL,
                error            TEXT,
                original_sources TEXT,
                merged_from      INTEGER,
                merged_criteria  TEXT,
                updated_at       TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_products_upc ON products(upc);
            ",
        )?;
        Ok(SqliteSink { conn })
    }

    #[cfg(test)]
    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM products", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    fn write(&mut self, batch: &[CatalogEntry]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO products
                 (id, name, brand, upc, price, source_image_url, source_urls, source, error,
                  original_sources, merged_from, merged_criteria)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    brand = excluded.brand,
                    upc = excluded.upc,
                    price = excluded.price,
                    source_image_url = excluded.source_image_url,
                    source_urls = excluded.source_urls,
                    source = excluded.source,
                    error = excluded.error,
                    original_sources = excluded.original_sources,
                    merged_from = excluded.merged_from,
                    merged_criteria = excluded.merged_criteria,
                    updated_at = datetime('now')",
            )?;
            for e in batch {
                let row = Row::from(e);
                let source_urls = serde_json::to_string(row.source_urls)?;
                let original_sources = row
                    .original_sources
                    .map(|s| serde_json::to_string(s))
                    .transpose()?;
                let criteria = e
                    .provenance
                    .as_ref()
                    .map(|p| serde_json::to_string(&p.merged_criteria))
                    .transpose()?;
                count += stmt.execute(rusqlite::params![
                    row.id,
                    row.name,
                    row.brand,
                    row.upc,
                    row.price,
                    row.source_image_url,
                    source_urls,
                    row.source,
                    row.error,
                    original_sources,
                    row.merged_from.map(|n| n as i64),
                    criteria,
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }
}

impl CatalogSink for SqliteSink {
    async fn upsert(&mut self, batch: &[CatalogEntry]) -> Result<usize> {
        self.write(batch)
    }
}

// ── PostgREST ──

/// Upserts through a PostgREST-style endpoint (`POST {base}/{table}?on_conflict=id`).
pub struct RestSink {
    client: reqwest::Client,
    endpoint: String,
    headers: BTreeMap<String, String>,
}

impl RestSink {
    pub fn new(base_url: &str, table: &str, headers: BTreeMap<String, String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(RestSink {
            client,
            endpoint: endpoint(base_url, table),
            headers,
        })
    }
}

fn endpoint(base_url: &str, table: &str) -> String {
    format!("{}/{}?on_conflict=id", base_url.trim_end_matches('/'), table)
}

impl CatalogSink for RestSink {
    async fn upsert(&mut self, batch: &[CatalogEntry]) -> Result<usize> {
        let rows: Vec<Row> = batch.iter().map(Row::from).collect();
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Prefer", "resolution=merge-duplicates,return=minimal");
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let response = req
            .json(&rows)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("HTTP {}: {}", status.as_u16(), body);
        }
        Ok(rows.len())
    }
}

// ── Upload loop ──

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadStats {
    pub rows: usize,
    pub written: usize,
    pub batches: usize,
    pub failed_batches: usize,
}

impl UploadStats {
    pub fn print(&self) {
        println!(
            "Uploaded {} of {} rows in {} batches ({} failed).",
            self.written, self.rows, self.batches, self.failed_batches
        );
    }
}

/// Push the catalog in `batch_size` chunks. A failed batch is logged and counted;
/// the remaining batches still go out.
pub async fn upload<S: CatalogSink>(
    sink: &mut S,
    entries: &[CatalogEntry],
    batch_size: usize,
    pause: Duration,
) -> Result<UploadStats> {
    let batch_size = batch_size.max(1);
    let mut stats = UploadStats {
        rows: entries.len(),
        ..Default::default()
    };

    let pb = ProgressBar::new(entries.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let total = entries.len().div_ceil(batch_size);
    for (i, batch) in entries.chunks(batch_size).enumerate() {
        stats.batches += 1;
        match sink.upsert(batch).await {
            Ok(n) => stats.written += n,
            Err(e) => {
                stats.failed_batches += 1;
                warn!(batch = i + 1, total, error = %e, "Batch upload failed");
            }
        }
        pb.inc(batch.len() as u64);
        if i + 1 < total && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    pb.finish_and_clear();
    info!(
        written = stats.written,
        failed_batches = stats.failed_batches,
        "Upload finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Price, Provenance, Source};

    fn entry(id: &str, name: &str, cents: u64) -> CatalogEntry {
        CatalogEntry {
            id: id.to_string(),
            name: Some(name.to_string()),
            brand: None,
            upc: Some("123456".into()),
            price: Price::from_cents(cents),
            source_image_url: None,
            source_urls: vec![format!("https://a/{}", id)],
            source: Source::Origin("rol".into()),
            error: None,
            provenance: None,
        }
    }

    fn memory_sink() -> SqliteSink {
        SqliteSink::with_connection(Connection::open_in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn sqlite_overwrites_on_id() {
        let mut sink = memory_sink();
        sink.upsert(&[entry("rol_1", "Old", 100), entry("rol_2", "Other", 200)])
            .await
            .unwrap();
        sink.upsert(&[entry("rol_1", "New", 150)]).await.unwrap();

        assert_eq!(sink.count().unwrap(), 2);
        let (name, price): (String, f64) = sink
            .conn
            .query_row("SELECT name, price FROM products WHERE id = 'rol_1'", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(name, "New");
        assert_eq!(price, 1.5);
    }

    #[tokio::test]
    async fn sqlite_stores_provenance_as_json() {
        let mut merged = entry("merged_123456_t", "Cookie", 450);
        merged.source = Source::Merged;
        merged.provenance = Some(Provenance {
            original_sources: vec!["montania".into(), "rol".into()],
            merged_from: 2,
            merged_criteria: BTreeMap::from([("name".to_string(), "montania".to_string())]),
            unresolved: vec![],
        });
        let mut sink = memory_sink();
        sink.upsert(&[merged]).await.unwrap();

        let (sources, from): (String, i64) = sink
            .conn
            .query_row("SELECT original_sources, merged_from FROM products", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(sources, r#"["montania","rol"]"#);
        assert_eq!(from, 2);
    }

    /// Fails every batch whose first id is listed.
    struct FlakySink {
        fail_on: Vec<&'static str>,
        seen: Vec<usize>,
    }

    impl CatalogSink for FlakySink {
        async fn upsert(&mut self, batch: &[CatalogEntry]) -> Result<usize> {
            self.seen.push(batch.len());
            if self.fail_on.iter().any(|id| *id == batch[0].id) {
                bail!("HTTP 500");
            }
            Ok(batch.len())
        }
    }

    #[tokio::test]
    async fn upload_counts_failed_batches() {
        let entries: Vec<CatalogEntry> =
            (0..5).map(|i| entry(&format!("e{}", i), "n", 100)).collect();
        let mut sink = FlakySink {
            fail_on: vec!["e2"],
            seen: vec![],
        };
        let stats = upload(&mut sink, &entries, 2, Duration::ZERO).await.unwrap();
        assert_eq!(sink.seen, vec![2, 2, 1]);
        assert_eq!(
            stats,
            UploadStats {
                rows: 5,
                written: 3,
                batches: 3,
                failed_batches: 1
            }
        );
    }

    #[test]
    fn rest_endpoint_and_row_shape() {
        assert_eq!(
            endpoint("https://x.supabase.co/rest/v1/", "productos"),
            "https://x.supabase.co/rest/v1/productos?on_conflict=id"
        );
        let e = entry("rol_1", "Galleta", 450);
        let v = serde_json::to_value(Row::from(&e)).unwrap();
        assert_eq!(v["source_urls"], serde_json::json!(["https://a/rol_1"]));
        assert_eq!(v["price"], 4.5);
        assert!(v["original_sources"].is_null());
    }
}
