//! Pipeline progress hooks.

use courier_shared::ItemKey;
use serde::Serialize;

/// Totals for one `poll_once` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    /// Items claimed and worked on.
    pub processed: usize,
    /// Items that reached `Ready` but still wait on a destination.
    pub ready: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Items released for a later pass (open circuit, delivery backoff, shutdown).
    pub deferred: usize,
    /// Items lost to another worker's claim.
    pub skipped: usize,
}

/// Totals for one discovery pass over every source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub sources_checked: usize,
    pub admitted: usize,
    pub already_seen: usize,
    /// Source fetch or parse errors; the affected items were skipped.
    pub errors: usize,
}

/// Progress callback for pipeline events.
pub trait PipelineObserver: Send + Sync {
    fn item_admitted(&self, key: &ItemKey);
    fn stage_completed(&self, key: &ItemKey, stage: &str, ordinal: u32);
    fn item_failed(&self, key: &ItemKey, stage: &str, reason: &str);
    fn item_delivered(&self, key: &ItemKey);
    fn poll_finished(&self, report: &PollReport);
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl PipelineObserver for SilentObserver {
    fn item_admitted(&self, _key: &ItemKey) {}
    fn stage_completed(&self, _key: &ItemKey, _stage: &str, _ordinal: u32) {}
    fn item_failed(&self, _key: &ItemKey, _stage: &str, _reason: &str) {}
    fn item_delivered(&self, _key: &ItemKey) {}
    fn poll_finished(&self, _report: &PollReport) {}
}
