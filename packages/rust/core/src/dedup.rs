//! Dedup gate: single admission per `<source>:<key>`.

use std::sync::Arc;

use courier_shared::{DiscoveredItem, Item, Result, RetryPolicy};
use courier_storage::ItemStore;
use tracing::debug;

use crate::retry::with_storage_retry;

/// Outcome of offering a discovered item to the gate.
#[derive(Debug)]
pub enum Admission {
    /// First sighting; the item is now persisted as `Pending`.
    Admitted(Item),
    AlreadySeen,
}

/// Decides whether a discovered item is new. The check and the insert are
/// one atomic store call, so concurrent admission of the same key yields
/// exactly one `Admitted`.
#[derive(Clone)]
pub struct DedupGate {
    items: Arc<dyn ItemStore>,
    storage_retry: RetryPolicy,
}

impl DedupGate {
    pub fn new(items: Arc<dyn ItemStore>, storage_retry: RetryPolicy) -> Self {
        Self {
            items,
            storage_retry,
        }
    }

    pub async fn admit(&self, discovered: DiscoveredItem) -> Result<Admission> {
        let item = Item::discovered(discovered);
        let inserted = with_storage_retry(&self.storage_retry, "insert_if_absent", || {
            self.items.insert_if_absent(&item)
        })
        .await?;

        if inserted {
            debug!(key = %item.key, hash = %item.content_hash, "admitted item");
            Ok(Admission::Admitted(item))
        } else {
            debug!(key = %item.key, "already seen");
            Ok(Admission::AlreadySeen)
        }
    }
}
