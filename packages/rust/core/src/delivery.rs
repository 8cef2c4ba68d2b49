//! Delivery tracker: per-(item, destination) send with at-most-once commit.
//!
//! One call makes at most one send. Transient failures schedule the next
//! attempt through `next_attempt_at` on the durable record, so backoff
//! survives restarts. A send that succeeds but whose commit write fails may
//! be repeated on a later call; destinations see at-least-once delivery
//! while the record itself commits exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use courier_adapters::BoundDestination;
use courier_shared::{
    CourierError, DeliveryContext, DeliveryRecord, DeliveryStatus, FinishedItem, Item, ItemKey,
    Result, RetryPolicy,
};
use courier_storage::DeliveryStore;
use tracing::{debug, info, instrument, warn};

use crate::retry::with_storage_retry;

/// Outcome of one `deliver` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Committed,
    /// Not sent yet: backing off, or a transient failure with attempts left.
    Retryable(String),
    PermanentlyFailed(String),
}

impl DeliveryOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Retryable(_))
    }
}

type PairKey = (ItemKey, String);

/// Owns every delivery-record transition.
pub struct DeliveryTracker {
    store: Arc<dyn DeliveryStore>,
    destinations: Vec<BoundDestination>,
    storage_retry: RetryPolicy,
    /// Serializes concurrent calls for the same pair within this process.
    locks: Mutex<HashMap<PairKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeliveryTracker {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        destinations: Vec<BoundDestination>,
        storage_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            destinations,
            storage_retry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Configured destination ids, in config order.
    pub fn destination_ids(&self) -> impl Iterator<Item = &str> {
        self.destinations.iter().map(|d| d.adapter.id())
    }

    /// Deliver `item` to one destination. `Err` is reserved for storage
    /// failures and unknown destinations.
    #[instrument(skip_all, fields(item = %item.key, destination = destination_id))]
    pub async fn deliver(&self, item: &Item, destination_id: &str) -> Result<DeliveryOutcome> {
        let destination = self
            .destinations
            .iter()
            .find(|d| d.adapter.id() == destination_id)
            .ok_or_else(|| {
                CourierError::config(format!("unknown destination '{destination_id}'"))
            })?;

        let pair: PairKey = (item.key.clone(), destination_id.to_string());
        let pair_lock = self.pair_lock(&pair);
        let outcome = {
            let _guard = pair_lock.lock().await;
            self.deliver_locked(item, destination).await
        };
        drop(pair_lock);
        self.release_pair_lock(&pair);
        outcome
    }

    async fn deliver_locked(
        &self,
        item: &Item,
        destination: &BoundDestination,
    ) -> Result<DeliveryOutcome> {
        let dest_id = destination.adapter.id();
        let existing = with_storage_retry(&self.storage_retry, "get_delivery", || {
            self.store.get_delivery(&item.key, dest_id)
        })
        .await?;

        let mut record = match existing {
            Some(record) => match record.status {
                DeliveryStatus::Committed => {
                    debug!("already committed");
                    return Ok(DeliveryOutcome::Committed);
                }
                DeliveryStatus::PermanentlyFailed => {
                    return Ok(DeliveryOutcome::PermanentlyFailed(
                        record.last_error.unwrap_or_default(),
                    ));
                }
                DeliveryStatus::Pending => record,
            },
            None => DeliveryRecord {
                item_key: item.key.clone(),
                destination_id: dest_id.to_string(),
                status: DeliveryStatus::Pending,
                attempts: 0,
                last_error: None,
                external_ref: None,
                next_attempt_at: None,
                committed_at: None,
            },
        };

        if let Some(at) = record.next_attempt_at {
            if at > Utc::now() {
                debug!(next_attempt_at = %at, "backing off");
                return Ok(DeliveryOutcome::Retryable(format!("backing off until {at}")));
            }
        }

        let context = self.reply_context(item, dest_id).await?;
        let finished = FinishedItem::from(item);
        let sent = tokio::time::timeout(
            destination.timeout,
            destination.adapter.send(&finished, &context),
        )
        .await;
        record.attempts += 1;

        let failure = match sent {
            Ok(Ok(external_ref)) => {
                record.status = DeliveryStatus::Committed;
                record.external_ref = external_ref;
                record.last_error = None;
                record.next_attempt_at = None;
                record.committed_at = Some(Utc::now());
                let committed = with_storage_retry(&self.storage_retry, "commit_delivery", || {
                    self.store.commit_delivery(&record)
                })
                .await?;
                if committed {
                    info!(
                        attempts = record.attempts,
                        external_ref = ?record.external_ref,
                        "delivery committed"
                    );
                } else {
                    debug!("delivery was committed concurrently");
                }
                return Ok(DeliveryOutcome::Committed);
            }
            Ok(Err(e)) => e,
            Err(_) => CourierError::Transient(format!(
                "send timed out after {:?}",
                destination.timeout
            )),
        };

        let reason = failure.to_string();
        record.last_error = Some(reason.clone());
        let outcome = if !failure.is_retryable() {
            record.status = DeliveryStatus::PermanentlyFailed;
            record.next_attempt_at = None;
            warn!(error = %reason, "delivery failed permanently");
            DeliveryOutcome::PermanentlyFailed(reason)
        } else if record.attempts >= destination.retry.max_attempts {
            let reason = format!("retries exhausted: {reason}");
            record.status = DeliveryStatus::PermanentlyFailed;
            record.last_error = Some(reason.clone());
            record.next_attempt_at = None;
            warn!(attempts = record.attempts, error = %reason, "delivery gave up");
            DeliveryOutcome::PermanentlyFailed(reason)
        } else {
            let delay = destination.retry.delay_for(record.attempts);
            let backoff =
                chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
            record.next_attempt_at = Some(Utc::now() + backoff);
            warn!(
                attempts = record.attempts,
                ?delay,
                error = %reason,
                "delivery failed, will retry"
            );
            DeliveryOutcome::Retryable(reason)
        };

        let saved = with_storage_retry(&self.storage_retry, "save_delivery", || {
            self.store.save_delivery(&record)
        })
        .await?;
        if !saved {
            // Another process committed while we were sending.
            return Ok(DeliveryOutcome::Committed);
        }
        Ok(outcome)
    }

    /// Reply threading: the parent's message ref at the same destination.
    async fn reply_context(&self, item: &Item, dest_id: &str) -> Result<DeliveryContext> {
        let Some(parent) = item.parent_key.as_deref() else {
            return Ok(DeliveryContext::default());
        };
        let parent_key = ItemKey::new(&item.source_name, parent);
        let parent_record = with_storage_retry(&self.storage_retry, "get_delivery", || {
            self.store.get_delivery(&parent_key, dest_id)
        })
        .await?;
        let reply_to = parent_record
            .filter(|r| r.status == DeliveryStatus::Committed)
            .and_then(|r| r.external_ref);
        Ok(DeliveryContext { reply_to })
    }

    fn pair_lock(&self, pair: &PairKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(pair.clone()).or_default().clone()
    }

    /// Drop the map entry once nobody else holds or waits on it.
    fn release_pair_lock(&self, pair: &PairKey) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        let idle = locks
            .get(pair)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(pair);
        }
    }
}
