//! Pipeline coordinator: owns every item lifecycle transition.
//!
//! `Pending -> InStage(1) -> ... -> InStage(N) -> Ready -> Delivered`, with
//! `InStage(k) -> Failed(k)` on a fatal stage result. Nothing is queued in
//! memory: each pass rescans the store, so a restart resumes from whatever
//! was last persisted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier_adapters::AdapterRegistry;
use courier_shared::{
    AppConfig, CourierError, DeliveryRecord, DeliveryStatus, Item, ItemKey, ItemStatus, Result,
    RetryPolicy, StageDefinition, StatusKind,
};
use courier_storage::{CursorStore, DeliveryStore, ItemStore, PendingCursor};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::dedup::DedupGate;
use crate::delivery::{DeliveryOutcome, DeliveryTracker};
use crate::discovery::DiscoveryRunner;
use crate::executor::{StageExecutor, StageResult};
use crate::observer::{DiscoveryReport, PipelineObserver, PollReport};
use crate::retry::with_storage_retry;

/// Runtime knobs, usually taken from `[pipeline]` and `[storage_retry]`.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Items worked on concurrently.
    pub item_concurrency: usize,
    /// Claim duration; renewed on every write while an item is worked on.
    pub lease: Duration,
    pub batch_size: u32,
    pub poll_interval: Duration,
    /// Delivered items older than this are pruned by `run`. `None` keeps everything.
    pub retention: Option<Duration>,
    pub storage_retry: RetryPolicy,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            item_concurrency: 8,
            lease: Duration::from_secs(300),
            batch_size: 100,
            poll_interval: Duration::from_secs(60),
            retention: Some(Duration::from_secs(30 * 24 * 3600)),
            storage_retry: RetryPolicy::default(),
        }
    }
}

impl From<&AppConfig> for CoordinatorSettings {
    fn from(config: &AppConfig) -> Self {
        let days = config.pipeline.retention_days;
        Self {
            item_concurrency: config.pipeline.item_concurrency,
            lease: config.pipeline.lease(),
            batch_size: config.pipeline.batch_size,
            poll_interval: config.pipeline.poll_interval(),
            retention: (days > 0).then(|| Duration::from_secs(u64::from(days) * 24 * 3600)),
            storage_retry: config.storage_retry.policy(),
        }
    }
}

/// What happened to one claimed item during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Reached `Ready`; at least one destination is still pending.
    Ready,
    Delivered,
    Failed,
    /// Claim released; picked up again by a later pass.
    Deferred,
    /// Another worker holds or took the item.
    Skipped,
}

#[derive(Debug, Clone, Copy)]
enum Sweep {
    /// `Pending` and `InStage` items.
    Stages,
    /// `Ready` items left over from earlier passes.
    Deliveries,
}

type PageState = (Arc<Inner>, Option<PendingCursor>, bool);

pub struct Coordinator {
    inner: Arc<Inner>,
    discovery: DiscoveryRunner,
}

struct Inner {
    items: Arc<dyn ItemStore>,
    deliveries: Arc<dyn DeliveryStore>,
    stages: Vec<StageExecutor>,
    tracker: DeliveryTracker,
    settings: CoordinatorSettings,
    observer: Arc<dyn PipelineObserver>,
}

impl Coordinator {
    /// Wire the pipeline. Stage ordinals must be exactly `1..=N` and every
    /// stage needs a capability in `registry`.
    pub fn new<S>(
        storage: Arc<S>,
        registry: &AdapterRegistry,
        mut stages: Vec<StageDefinition>,
        settings: CoordinatorSettings,
        observer: Arc<dyn PipelineObserver>,
    ) -> Result<Self>
    where
        S: ItemStore + DeliveryStore + CursorStore + 'static,
    {
        stages.sort_by_key(|s| s.ordinal);
        let mut executors = Vec::with_capacity(stages.len());
        for (i, def) in stages.into_iter().enumerate() {
            if def.ordinal != i as u32 + 1 {
                return Err(CourierError::config(format!(
                    "stage '{}' has ordinal {}, expected {}",
                    def.name,
                    def.ordinal,
                    i + 1
                )));
            }
            let capability = registry.capability(&def.capability).ok_or_else(|| {
                CourierError::config(format!(
                    "stage '{}': no capability named '{}'",
                    def.name, def.capability
                ))
            })?;
            executors.push(StageExecutor::new(def, capability));
        }

        let items: Arc<dyn ItemStore> = storage.clone();
        let deliveries: Arc<dyn DeliveryStore> = storage.clone();
        let cursors: Arc<dyn CursorStore> = storage;

        let gate = DedupGate::new(items.clone(), settings.storage_retry);
        let discovery = DiscoveryRunner::new(
            gate,
            cursors,
            registry.sources().to_vec(),
            settings.storage_retry,
        );
        let tracker = DeliveryTracker::new(
            deliveries.clone(),
            registry.destinations().to_vec(),
            settings.storage_retry,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                items,
                deliveries,
                stages: executors,
                tracker,
                settings,
                observer,
            }),
            discovery,
        })
    }

    /// Build from a loaded config and its adapter registry.
    pub fn from_config<S>(
        config: &AppConfig,
        storage: Arc<S>,
        registry: &AdapterRegistry,
        observer: Arc<dyn PipelineObserver>,
    ) -> Result<Self>
    where
        S: ItemStore + DeliveryStore + CursorStore + 'static,
    {
        Self::new(
            storage,
            registry,
            config.stage_definitions(),
            CoordinatorSettings::from(config),
            observer,
        )
    }

    // -----------------------------------------------------------------------
    // Processing
    // -----------------------------------------------------------------------

    /// Discover, process, and deliver until `shutdown` fires. A storage error
    /// that survives its retries stops the loop and is returned.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let settings = &self.inner.settings;
        info!(
            stages = self.inner.stages.len(),
            item_concurrency = settings.item_concurrency,
            poll_interval = ?settings.poll_interval,
            "pipeline started"
        );

        while !shutdown.is_cancelled() {
            if let Err(e) = self.cycle(&shutdown).await {
                error!(error = %e, "pipeline halted");
                return Err(e);
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(settings.poll_interval) => {}
            }
        }

        info!("pipeline stopped");
        Ok(())
    }

    async fn cycle(&self, shutdown: &CancellationToken) -> Result<()> {
        self.discover_once(shutdown).await?;
        self.poll_once(shutdown).await?;
        if let Some(retention) = self.inner.settings.retention {
            self.prune(retention).await?;
        }
        Ok(())
    }

    /// One discovery pass over every active source.
    pub async fn discover_once(&self, shutdown: &CancellationToken) -> Result<DiscoveryReport> {
        self.discovery
            .run_once(self.inner.observer.as_ref(), shutdown)
            .await
    }

    /// One processing pass: deliver leftover `Ready` items, then work every
    /// claimable `Pending`/`InStage` item through its remaining stages.
    #[instrument(skip_all)]
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> Result<PollReport> {
        let mut report = PollReport::default();
        self.sweep(Sweep::Deliveries, shutdown, &mut report).await?;
        self.sweep(Sweep::Stages, shutdown, &mut report).await?;

        info!(
            processed = report.processed,
            delivered = report.delivered,
            failed = report.failed,
            deferred = report.deferred,
            "poll finished"
        );
        self.inner.observer.poll_finished(&report);
        Ok(report)
    }

    /// Lazily page through items still needing stage work.
    pub fn pending_items(&self) -> BoxStream<'static, Result<Item>> {
        self.scan(Sweep::Stages)
    }

    fn scan(&self, sweep: Sweep) -> BoxStream<'static, Result<Item>> {
        let start: PageState = (self.inner.clone(), None, false);
        stream::try_unfold(start, move |(inner, after, done)| {
            Inner::next_page(inner, sweep, after, done)
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    async fn sweep(
        &self,
        sweep: Sweep,
        shutdown: &CancellationToken,
        report: &mut PollReport,
    ) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.inner.settings.item_concurrency.max(1)));
        let mut tasks: JoinSet<Result<ItemOutcome>> = JoinSet::new();
        let mut items = self.scan(sweep);
        let mut halted: Option<CourierError> = None;

        while let Some(next) = items.next().await {
            if shutdown.is_cancelled() {
                debug!("shutdown requested, not claiming more items");
                break;
            }
            let item = match next {
                Ok(item) => item,
                Err(e) => {
                    halted = Some(e);
                    break;
                }
            };
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };

            let inner = self.inner.clone();
            let token = shutdown.clone();
            tasks.spawn(async move {
                let _permit = permit;
                inner.process(item, &token).await
            });

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = tally(joined, report) {
                    halted.get_or_insert(e);
                }
            }
            if halted.is_some() {
                break;
            }
        }

        // In-flight items finish their current write before we return.
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = tally(joined, report) {
                halted.get_or_insert(e);
            }
        }

        match halted {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Operator operations
    // -----------------------------------------------------------------------

    /// Send a `Failed(k)` item back to `InStage(k)`. Earlier stage outputs
    /// are kept, so only stage `k` onward runs again.
    ///
    /// A `Delivered` item with permanently failed deliveries goes back to
    /// `Ready` instead, and only those destinations are tried again.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn replay(&self, key: &ItemKey) -> Result<Item> {
        let inner = &self.inner;
        let mut item = with_storage_retry(&inner.settings.storage_retry, "get", || {
            inner.items.get(key)
        })
        .await?
        .ok_or_else(|| CourierError::validation(format!("no item with key '{key}'")))?;

        match item.status.clone() {
            ItemStatus::Failed { stage, ordinal, .. } => {
                item.status = ItemStatus::InStage { stage, ordinal };
                item.lease_until = None;
                if !inner.persist(&mut item).await? {
                    return Err(CourierError::Conflict(format!(
                        "item '{key}' changed while replaying"
                    )));
                }
                info!(ordinal, "item replayed");
                Ok(item)
            }
            ItemStatus::Delivered => {
                let reset = inner.reset_failed_deliveries(key).await?;
                if reset == 0 {
                    return Err(CourierError::validation(format!(
                        "item '{key}' was delivered everywhere, nothing to replay"
                    )));
                }
                item.status = ItemStatus::Ready;
                item.lease_until = None;
                if !inner.persist(&mut item).await? {
                    return Err(CourierError::Conflict(format!(
                        "item '{key}' changed while replaying"
                    )));
                }
                info!(destinations = reset, "deliveries replayed");
                Ok(item)
            }
            other => Err(CourierError::validation(format!(
                "item '{key}' is {other}, only failed items can be replayed"
            ))),
        }
    }

    pub async fn failed_items(&self, limit: u32) -> Result<Vec<Item>> {
        self.inner.items.list_by_status(StatusKind::Failed, limit).await
    }

    /// Deliveries a destination refused for good. Their items count as
    /// delivered but are kept until replayed.
    pub async fn failed_deliveries(&self, limit: u32) -> Result<Vec<DeliveryRecord>> {
        self.inner
            .deliveries
            .list_deliveries_by_status(DeliveryStatus::PermanentlyFailed, limit)
            .await
    }

    /// Every delivery record of one item, by destination.
    pub async fn deliveries(&self, key: &ItemKey) -> Result<Vec<DeliveryRecord>> {
        self.inner.deliveries.list_deliveries(key).await
    }

    pub async fn item(&self, key: &ItemKey) -> Result<Option<Item>> {
        self.inner.items.get(key).await
    }

    pub async fn status_counts(&self) -> Result<Vec<(StatusKind, u64)>> {
        self.inner.items.count_by_status().await
    }

    pub async fn delivery_counts(&self) -> Result<Vec<(DeliveryStatus, u64)>> {
        self.inner.deliveries.count_deliveries_by_status().await
    }

    /// Remove delivered items older than `retention`. Items with a
    /// permanently failed delivery are kept.
    pub async fn prune(&self, retention: Duration) -> Result<u64> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| CourierError::validation(format!("retention out of range: {e}")))?;
        let cutoff = Utc::now() - retention;
        let inner = &self.inner;
        with_storage_retry(&inner.settings.storage_retry, "prune_delivered", || {
            inner.items.prune_delivered(cutoff)
        })
        .await
    }
}

fn tally(
    joined: std::result::Result<Result<ItemOutcome>, JoinError>,
    report: &mut PollReport,
) -> Result<()> {
    let outcome = match joined {
        Ok(result) => result?,
        Err(e) => {
            error!(error = %e, "item task panicked");
            ItemOutcome::Skipped
        }
    };
    match outcome {
        ItemOutcome::Skipped => report.skipped += 1,
        other => {
            report.processed += 1;
            match other {
                ItemOutcome::Ready => report.ready += 1,
                ItemOutcome::Delivered => report.delivered += 1,
                ItemOutcome::Failed => report.failed += 1,
                ItemOutcome::Deferred => report.deferred += 1,
                ItemOutcome::Skipped => {}
            }
        }
    }
    Ok(())
}

impl Inner {
    async fn next_page(
        inner: Arc<Inner>,
        sweep: Sweep,
        after: Option<PendingCursor>,
        done: bool,
    ) -> Result<Option<(Vec<Item>, PageState)>> {
        if done {
            return Ok(None);
        }
        let limit = inner.settings.batch_size.max(1);
        let max_ordinal = inner.stages.len() as u32;
        let page = with_storage_retry(&inner.settings.storage_retry, "list", || match sweep {
            Sweep::Stages => inner.items.list_pending(max_ordinal, after.as_ref(), limit),
            Sweep::Deliveries => inner.items.list_ready(after.as_ref(), limit),
        })
        .await?;

        if page.is_empty() {
            return Ok(None);
        }
        let done = page.len() < limit as usize;
        let next = page.last().map(PendingCursor::after);
        Ok(Some((page, (inner, next, done))))
    }

    fn lease_deadline(&self) -> chrono::DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.settings.lease)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        Utc::now() + lease
    }

    fn stage(&self, ordinal: u32) -> Option<&StageExecutor> {
        (ordinal as usize)
            .checked_sub(1)
            .and_then(|i| self.stages.get(i))
    }

    fn stage_status(&self, ordinal: u32) -> ItemStatus {
        match self.stage(ordinal) {
            Some(stage) => ItemStatus::InStage {
                stage: stage.definition().name.clone(),
                ordinal,
            },
            None => ItemStatus::Ready,
        }
    }

    /// CAS write at the item's current version. On success the local copy
    /// takes the new version; `false` means another writer won.
    async fn persist(&self, item: &mut Item) -> Result<bool> {
        let expected = item.version;
        let snapshot: &Item = item;
        let written = with_storage_retry(&self.settings.storage_retry, "put_if_version", || {
            self.items.put_if_version(snapshot, expected)
        })
        .await?;
        if written {
            item.version = expected + 1;
        } else {
            debug!(key = %item.key, expected, "lost item race");
        }
        Ok(written)
    }

    /// Claim `item`, run its remaining stages, then deliver it.
    #[instrument(skip_all, fields(key = %item.key))]
    async fn process(&self, mut item: Item, shutdown: &CancellationToken) -> Result<ItemOutcome> {
        if item.lease_active(Utc::now()) {
            return Ok(ItemOutcome::Skipped);
        }
        item.status = match &item.status {
            ItemStatus::Pending => self.stage_status(1),
            ItemStatus::InStage { .. } | ItemStatus::Ready => item.status.clone(),
            ItemStatus::Failed { .. } | ItemStatus::Delivered => return Ok(ItemOutcome::Skipped),
        };
        item.lease_until = Some(self.lease_deadline());
        if !self.persist(&mut item).await? {
            return Ok(ItemOutcome::Skipped);
        }

        while let ItemStatus::InStage { ordinal, .. } = item.status {
            if shutdown.is_cancelled() {
                debug!(ordinal, "shutdown requested, releasing");
                return self.release(item, ItemOutcome::Deferred).await;
            }
            let Some(stage) = self.stage(ordinal) else {
                warn!(ordinal, "no stage configured at ordinal, releasing");
                return self.release(item, ItemOutcome::Deferred).await;
            };
            let stage_name = stage.definition().name.clone();

            if item.output_for(ordinal).is_some() {
                debug!(ordinal, "stage output already recorded, advancing");
            } else {
                match stage.run_cancellable(&item, shutdown).await {
                    StageResult::Success(output) => {
                        if let Err(e) = item.record_output(&stage_name, ordinal, output) {
                            return self.fail(item, &stage_name, ordinal, e.to_string()).await;
                        }
                    }
                    StageResult::Fatal(reason) => {
                        return self.fail(item, &stage_name, ordinal, reason).await;
                    }
                    StageResult::Retryable(reason) => {
                        debug!(ordinal, reason = %reason, "stage deferred");
                        return self.release(item, ItemOutcome::Deferred).await;
                    }
                }
            }

            item.status = self.stage_status(ordinal + 1);
            item.lease_until = Some(self.lease_deadline());
            if !self.persist(&mut item).await? {
                return Ok(ItemOutcome::Skipped);
            }
            self.observer.stage_completed(&item.key, &stage_name, ordinal);
        }

        if item.status != ItemStatus::Ready {
            Ok(ItemOutcome::Skipped)
        } else if shutdown.is_cancelled() {
            debug!("shutdown requested, leaving delivery for later");
            self.release(item, ItemOutcome::Deferred).await
        } else {
            self.deliver(item).await
        }
    }

    /// Put every permanently failed delivery of `key` back to pending with
    /// a fresh attempt budget. Returns how many were reset.
    async fn reset_failed_deliveries(&self, key: &ItemKey) -> Result<usize> {
        let records = with_storage_retry(&self.settings.storage_retry, "list_deliveries", || {
            self.deliveries.list_deliveries(key)
        })
        .await?;

        let mut reset = 0;
        for mut record in records {
            if record.status != DeliveryStatus::PermanentlyFailed {
                continue;
            }
            record.status = DeliveryStatus::Pending;
            record.attempts = 0;
            record.next_attempt_at = None;
            record.last_error = None;
            let snapshot = &record;
            if with_storage_retry(&self.settings.storage_retry, "save_delivery", || {
                self.deliveries.save_delivery(snapshot)
            })
            .await?
            {
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn fail(
        &self,
        mut item: Item,
        stage: &str,
        ordinal: u32,
        reason: String,
    ) -> Result<ItemOutcome> {
        warn!(stage, ordinal, reason = %reason, "item failed");
        item.status = ItemStatus::Failed {
            stage: stage.to_string(),
            ordinal,
            reason: reason.clone(),
        };
        item.lease_until = None;
        if !self.persist(&mut item).await? {
            return Ok(ItemOutcome::Skipped);
        }
        self.observer.item_failed(&item.key, stage, &reason);
        Ok(ItemOutcome::Failed)
    }

    /// Drop the claim so a later pass picks the item up again.
    async fn release(&self, mut item: Item, outcome: ItemOutcome) -> Result<ItemOutcome> {
        item.lease_until = None;
        if !self.persist(&mut item).await? {
            return Ok(ItemOutcome::Skipped);
        }
        Ok(outcome)
    }

    /// Hand a `Ready` item to every destination; `Delivered` once all are terminal.
    async fn deliver(&self, mut item: Item) -> Result<ItemOutcome> {
        let mut all_terminal = true;
        for destination in self.tracker.destination_ids() {
            match self.tracker.deliver(&item, destination).await? {
                DeliveryOutcome::Committed => {}
                DeliveryOutcome::PermanentlyFailed(reason) => {
                    warn!(destination, reason = %reason, "destination gave up on item");
                }
                DeliveryOutcome::Retryable(reason) => {
                    debug!(destination, reason = %reason, "delivery pending");
                    all_terminal = false;
                }
            }
        }

        if !all_terminal {
            return self.release(item, ItemOutcome::Ready).await;
        }

        item.status = ItemStatus::Delivered;
        item.lease_until = None;
        if !self.persist(&mut item).await? {
            return Ok(ItemOutcome::Skipped);
        }
        info!(key = %item.key, "item delivered");
        self.observer.item_delivered(&item.key);
        Ok(ItemOutcome::Delivered)
    }
}
