use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::OriginProfile;
use crate::extract::Extractor;
use crate::model::RawRecord;

pub struct RunOptions {
    pub timeout: Duration,
    /// Process at most this many pending items.
    pub limit: Option<usize>,
}

/// Run stats returned after completion.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub total: usize,
    pub already_done: usize,
    pub pending: usize,
    pub ok: usize,
    pub errors: usize,
}

impl RunStats {
    pub fn print(&self) {
        println!(
            "Work list: {} ({} already done, {} pending). This run: {} ok, {} errors.",
            self.total, self.already_done, self.pending, self.ok, self.errors
        );
    }
}

/// Work locators missing from the checkpoint, one at a time. An item that fails or
/// times out is stored as a null-filled placeholder carrying its error; the run
/// itself only fails when the checkpoint cannot be written.
pub async fn run<E, S>(
    origin: &str,
    profile: &OriginProfile,
    extractor: &E,
    checkpoint: &mut Checkpoint<S>,
    locators: &[String],
    opts: &RunOptions,
) -> Result<RunStats>
where
    E: Extractor,
    S: CheckpointStore,
{
    let done: HashSet<String> = checkpoint.processed().into_iter().map(str::to_string).collect();
    let pending: Vec<&String> = locators.iter().filter(|l| !done.contains(l.as_str())).collect();

    let mut stats = RunStats {
        total: locators.len(),
        already_done: locators.len() - pending.len(),
        pending: pending.len(),
        ..Default::default()
    };
    info!(
        origin,
        total = stats.total,
        already_done = stats.already_done,
        pending = stats.pending,
        "Starting ingestion"
    );

    let batch: Vec<&String> = match opts.limit {
        Some(n) => pending.into_iter().take(n).collect(),
        None => pending,
    };

    let pb = ProgressBar::new(batch.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    let fields = profile.raw_fields();
    for (i, locator) in batch.iter().enumerate() {
        let record = match tokio::time::timeout(opts.timeout, extractor.extract(locator)).await {
            Ok(Ok(record)) => {
                stats.ok += 1;
                info!(url = %locator, "Extracted");
                pin_locator(record, locator, origin)
            }
            Ok(Err(e)) => {
                stats.errors += 1;
                warn!(url = %locator, error = %e, "Extraction failed");
                RawRecord::failed(locator, origin, fields.iter().copied(), e.to_string())
            }
            Err(_) => {
                stats.errors += 1;
                let msg = format!("timed out after {}s", opts.timeout.as_secs_f64());
                warn!(url = %locator, "Extraction {}", msg);
                RawRecord::failed(locator, origin, fields.iter().copied(), msg)
            }
        };
        checkpoint.push(record);
        pb.inc(1);

        if checkpoint.should_flush(i + 1) {
            checkpoint.persist()?;
            pb.println(format!("Checkpoint: {} records saved", checkpoint.len()));
        }
    }

    checkpoint.persist()?;
    pb.finish_and_clear();
    info!(origin, ok = stats.ok, errors = stats.errors, "Ingestion finished");
    Ok(stats)
}

/// Keep the work-list locator as the record's identity; a different URL reported by
/// the extractor is kept alongside as `resolvedUrl`.
fn pin_locator(mut record: RawRecord, locator: &str, origin: &str) -> RawRecord {
    if record.url != locator {
        let resolved = std::mem::replace(&mut record.url, locator.to_string());
        record = record.with_field("resolvedUrl", resolved);
    }
    if record.origin.is_empty() {
        record.origin = origin.to_string();
    }
    record
}
