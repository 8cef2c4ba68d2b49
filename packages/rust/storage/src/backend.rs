//! Store traits.
//!
//! The pipeline talks to persistence only through these traits. Every
//! state transition is a single atomic statement; the compare-and-set
//! methods are the only way two workers can race, and they report the
//! loser with `Ok(false)` rather than an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_shared::{
    DeliveryRecord, DeliveryStatus, Item, ItemKey, Result, SourceCursor, StatusKind,
};

/// Keyset position in the `(discovered_at, key)` scan order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCursor {
    pub discovered_at: DateTime<Utc>,
    pub key: ItemKey,
}

impl PendingCursor {
    /// Position just after `item`.
    pub fn after(item: &Item) -> Self {
        Self {
            discovered_at: item.discovered_at,
            key: item.key.clone(),
        }
    }
}

/// Durable `ItemKey -> Item` mapping.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Unconditional upsert of `item` exactly as given.
    async fn put(&self, item: &Item) -> Result<()>;

    /// Insert only if no item with the same key exists.
    ///
    /// Returns `true` if this call inserted the row.
    async fn insert_if_absent(&self, item: &Item) -> Result<bool>;

    /// Write `item` only if the stored version equals `expected_version`.
    /// The stored version becomes `expected_version + 1`.
    ///
    /// Returns `false` if another writer got there first.
    async fn put_if_version(&self, item: &Item, expected_version: u64) -> Result<bool>;

    async fn get(&self, key: &ItemKey) -> Result<Option<Item>>;

    /// Items that still have stage work: `Pending`, or `InStage(k)` with
    /// `k <= max_ordinal`, excluding live leases. Oldest first, keyset-paged.
    async fn list_pending(
        &self,
        max_ordinal: u32,
        after: Option<&PendingCursor>,
        limit: u32,
    ) -> Result<Vec<Item>>;

    /// `Ready` items without a live lease. Oldest first, keyset-paged.
    async fn list_ready(&self, after: Option<&PendingCursor>, limit: u32) -> Result<Vec<Item>>;

    /// Items in one status, oldest first.
    async fn list_by_status(&self, kind: StatusKind, limit: u32) -> Result<Vec<Item>>;

    /// Item counts for every status, zero counts included.
    async fn count_by_status(&self) -> Result<Vec<(StatusKind, u64)>>;

    /// Delete `Delivered` items discovered before `older_than`, together
    /// with their delivery records. Items with a permanently failed delivery
    /// are kept for the operator. Returns the number of items removed.
    async fn prune_delivered(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Per-(item, destination) delivery bookkeeping.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn get_delivery(&self, key: &ItemKey, destination_id: &str)
    -> Result<Option<DeliveryRecord>>;

    async fn list_deliveries(&self, key: &ItemKey) -> Result<Vec<DeliveryRecord>>;

    /// Records in one status, least recently updated first.
    async fn list_deliveries_by_status(
        &self,
        status: DeliveryStatus,
        limit: u32,
    ) -> Result<Vec<DeliveryRecord>>;

    /// Record counts for every status, zero counts included.
    async fn count_deliveries_by_status(&self) -> Result<Vec<(DeliveryStatus, u64)>>;

    /// Upsert a non-committed record. Never overwrites a committed one.
    ///
    /// Returns `false` if the stored record is already committed.
    async fn save_delivery(&self, record: &DeliveryRecord) -> Result<bool>;

    /// Mark the pair committed, at most once.
    ///
    /// Returns `true` only for the call that performed the transition.
    async fn commit_delivery(&self, record: &DeliveryRecord) -> Result<bool>;
}

/// Per-source discovery cursors.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get_cursor(&self, source_name: &str) -> Result<Option<SourceCursor>>;

    async fn save_cursor(&self, cursor: &SourceCursor) -> Result<()>;

    async fn list_cursors(&self) -> Result<Vec<SourceCursor>>;

    /// Pause or resume a source. Creates the cursor if missing.
    async fn set_source_active(&self, source_name: &str, active: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traits_are_object_safe() {
        fn _items(_: &dyn ItemStore) {}
        fn _deliveries(_: &dyn DeliveryStore) {}
        fn _cursors(_: &dyn CursorStore) {}
    }
}
