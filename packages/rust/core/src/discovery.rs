//! Discovery runner: pull every active source through the dedup gate.

use std::sync::Arc;

use chrono::Utc;
use courier_adapters::SourceAdapter;
use courier_shared::{Result, RetryPolicy, SourceCursor};
use courier_storage::CursorStore;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dedup::{Admission, DedupGate};
use crate::observer::{DiscoveryReport, PipelineObserver};
use crate::retry::with_storage_retry;

pub struct DiscoveryRunner {
    gate: DedupGate,
    cursors: Arc<dyn CursorStore>,
    sources: Vec<Arc<dyn SourceAdapter>>,
    storage_retry: RetryPolicy,
}

impl DiscoveryRunner {
    pub fn new(
        gate: DedupGate,
        cursors: Arc<dyn CursorStore>,
        sources: Vec<Arc<dyn SourceAdapter>>,
        storage_retry: RetryPolicy,
    ) -> Self {
        Self {
            gate,
            cursors,
            sources,
            storage_retry,
        }
    }

    /// One pass over every source. A source whose fetch fails is logged and
    /// skipped; only storage errors abort the pass.
    #[instrument(skip_all, fields(sources = self.sources.len()))]
    pub async fn run_once(
        &self,
        observer: &dyn PipelineObserver,
        shutdown: &CancellationToken,
    ) -> Result<DiscoveryReport> {
        let mut report = DiscoveryReport::default();

        for source in &self.sources {
            if shutdown.is_cancelled() {
                debug!("shutdown requested, stopping admission");
                break;
            }
            self.discover_source(source.as_ref(), observer, shutdown, &mut report)
                .await?;
        }

        info!(
            admitted = report.admitted,
            already_seen = report.already_seen,
            errors = report.errors,
            "discovery pass finished"
        );
        Ok(report)
    }

    async fn discover_source(
        &self,
        source: &dyn SourceAdapter,
        observer: &dyn PipelineObserver,
        shutdown: &CancellationToken,
        report: &mut DiscoveryReport,
    ) -> Result<()> {
        let name = source.name();
        let existing = with_storage_retry(&self.storage_retry, "get_cursor", || {
            self.cursors.get_cursor(name)
        })
        .await?;
        let mut cursor = existing.unwrap_or_else(|| SourceCursor {
            source_name: name.to_string(),
            last_key: None,
            last_checked: None,
            active: true,
            admitted_total: 0,
        });
        if !cursor.active {
            debug!(source = name, "source paused, skipping");
            return Ok(());
        }
        report.sources_checked += 1;

        let mut admitted = 0u64;
        let mut stream = source.discover();
        while let Some(next) = stream.next().await {
            if shutdown.is_cancelled() {
                break;
            }
            let discovered = match next {
                Ok(d) => d,
                Err(e) if e.is_storage() => return Err(e),
                Err(e) => {
                    warn!(source = name, error = %e, "source error, skipping");
                    report.errors += 1;
                    continue;
                }
            };

            let key = discovered.source_key.clone();
            match self.gate.admit(discovered).await? {
                Admission::Admitted(item) => {
                    observer.item_admitted(&item.key);
                    report.admitted += 1;
                    admitted += 1;
                    cursor.last_key = Some(key);
                }
                Admission::AlreadySeen => report.already_seen += 1,
            }
        }

        cursor.last_checked = Some(Utc::now());
        cursor.admitted_total += admitted;
        with_storage_retry(&self.storage_retry, "save_cursor", || {
            self.cursors.save_cursor(&cursor)
        })
        .await?;

        debug!(source = name, admitted, "source checked");
        Ok(())
    }
}
