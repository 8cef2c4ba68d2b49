//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding items, delivery
//! records, and source cursors. It implements [`ItemStore`],
//! [`DeliveryStore`], and [`CursorStore`].
//!
//! **Access rules:**
//! - the pipeline process: read-write (sole writer) via [`Storage::open`]
//! - operator queries: read-only via [`Storage::open_readonly`]

pub mod backend;
mod migrations;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use courier_shared::{
    CourierError, DeliveryRecord, DeliveryStatus, Item, ItemKey, ItemStatus, PayloadEntry, Result,
    SourceCursor, StatusKind,
};
use libsql::params::IntoParams;
use libsql::{Connection, Database, params};
use tokio::sync::{Mutex, MutexGuard};

pub use backend::{CursorStore, DeliveryStore, ItemStore, PendingCursor};

/// Item columns in the order [`row_to_item`] reads them.
const ITEM_COLUMNS: &str = "key, source_name, source_key, discovered_at, raw_json, content_hash, \
     parent_key, payload_json, status, stage_name, stage_ordinal, fail_reason, version, lease_until";

/// Delivery columns in the order [`row_to_delivery`] reads them.
const DELIVERY_COLUMNS: &str = "item_key, destination_id, status, attempts, last_error, \
     external_ref, next_attempt_at, committed_at";

/// Items old enough to prune. Items holding a permanently failed delivery stay
/// until an operator replays them.
const PRUNABLE: &str = "status = 'delivered' AND discovered_at < ?1 AND NOT EXISTS (
     SELECT 1 FROM deliveries d
     WHERE d.item_key = items.key AND d.status = 'permanently_failed'
 )";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Mutex<Connection>,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CourierError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(CourierError::storage)?;

        let conn = db.connect().map_err(CourierError::storage)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(CourierError::storage)?;
        // Every acknowledged write must survive a crash.
        conn.execute_batch("PRAGMA synchronous = FULL;")
            .await
            .map_err(CourierError::storage)?;

        let storage = Self {
            db,
            conn: Mutex::new(conn),
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (operator queries).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(CourierError::storage)?;

        let conn = db.connect().map_err(CourierError::storage)?;

        Ok(Self {
            db,
            conn: Mutex::new(conn),
            readonly: true,
        })
    }

    async fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;
        let conn = self.lock_conn().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    CourierError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let conn = self.lock_conn().await;
        let result = conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CourierError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    async fn query_items(&self, sql: &str, params: impl IntoParams) -> Result<Vec<Item>> {
        let conn = self.lock_conn().await;
        let mut rows = conn
            .query(sql, params)
            .await
            .map_err(CourierError::storage)?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await.map_err(CourierError::storage)? {
            items.push(row_to_item(&row)?);
        }
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[async_trait]
impl ItemStore for Storage {
    async fn put(&self, item: &Item) -> Result<()> {
        self.check_writable()?;
        let cols = ItemColumns::from_item(item)?;
        let conn = self.lock_conn().await;
        conn.execute(
            &format!(
                "INSERT INTO items ({ITEM_COLUMNS}, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(key) DO UPDATE SET
                    payload_json = excluded.payload_json,
                    status = excluded.status,
                    stage_name = excluded.stage_name,
                    stage_ordinal = excluded.stage_ordinal,
                    fail_reason = excluded.fail_reason,
                    version = excluded.version,
                    lease_until = excluded.lease_until,
                    updated_at = excluded.updated_at"
            ),
            params![
                item.key.as_str(),
                item.source_name.as_str(),
                item.source_key.as_str(),
                format_ts(item.discovered_at),
                cols.raw_json,
                item.content_hash.as_str(),
                item.parent_key.clone(),
                cols.payload_json,
                cols.status,
                cols.stage_name,
                cols.stage_ordinal,
                cols.fail_reason,
                item.version as i64,
                item.lease_until.map(format_ts),
                format_ts(Utc::now()),
            ],
        )
        .await
        .map_err(CourierError::storage)?;
        Ok(())
    }

    async fn insert_if_absent(&self, item: &Item) -> Result<bool> {
        self.check_writable()?;
        let cols = ItemColumns::from_item(item)?;
        let conn = self.lock_conn().await;
        let inserted = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO items ({ITEM_COLUMNS}, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    item.key.as_str(),
                    item.source_name.as_str(),
                    item.source_key.as_str(),
                    format_ts(item.discovered_at),
                    cols.raw_json,
                    item.content_hash.as_str(),
                    item.parent_key.clone(),
                    cols.payload_json,
                    cols.status,
                    cols.stage_name,
                    cols.stage_ordinal,
                    cols.fail_reason,
                    item.version as i64,
                    item.lease_until.map(format_ts),
                    format_ts(Utc::now()),
                ],
            )
            .await
            .map_err(CourierError::storage)?;
        Ok(inserted > 0)
    }

    async fn put_if_version(&self, item: &Item, expected_version: u64) -> Result<bool> {
        self.check_writable()?;
        let cols = ItemColumns::from_item(item)?;
        let conn = self.lock_conn().await;
        let updated = conn
            .execute(
                "UPDATE items SET
                    payload_json = ?1,
                    status = ?2,
                    stage_name = ?3,
                    stage_ordinal = ?4,
                    fail_reason = ?5,
                    lease_until = ?6,
                    version = ?7 + 1,
                    updated_at = ?8
                 WHERE key = ?9 AND version = ?7",
                params![
                    cols.payload_json,
                    cols.status,
                    cols.stage_name,
                    cols.stage_ordinal,
                    cols.fail_reason,
                    item.lease_until.map(format_ts),
                    expected_version as i64,
                    format_ts(Utc::now()),
                    item.key.as_str(),
                ],
            )
            .await
            .map_err(CourierError::storage)?;
        Ok(updated > 0)
    }

    async fn get(&self, key: &ItemKey) -> Result<Option<Item>> {
        let mut items = self
            .query_items(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE key = ?1"),
                params![key.as_str()],
            )
            .await?;
        Ok(items.pop())
    }

    async fn list_pending(
        &self,
        max_ordinal: u32,
        after: Option<&PendingCursor>,
        limit: u32,
    ) -> Result<Vec<Item>> {
        let (after_ts, after_key) = cursor_bounds(after);
        self.query_items(
            &format!(
                "SELECT {ITEM_COLUMNS} FROM items
                 WHERE (status = 'pending' OR (status = 'in_stage' AND stage_ordinal <= ?1))
                   AND (lease_until IS NULL OR lease_until <= ?2)
                   AND (discovered_at > ?3 OR (discovered_at = ?3 AND key > ?4))
                 ORDER BY discovered_at, key
                 LIMIT ?5"
            ),
            params![
                max_ordinal,
                format_ts(Utc::now()),
                after_ts,
                after_key,
                limit
            ],
        )
        .await
    }

    async fn list_ready(&self, after: Option<&PendingCursor>, limit: u32) -> Result<Vec<Item>> {
        let (after_ts, after_key) = cursor_bounds(after);
        self.query_items(
            &format!(
                "SELECT {ITEM_COLUMNS} FROM items
                 WHERE status = 'ready'
                   AND (lease_until IS NULL OR lease_until <= ?1)
                   AND (discovered_at > ?2 OR (discovered_at = ?2 AND key > ?3))
                 ORDER BY discovered_at, key
                 LIMIT ?4"
            ),
            params![format_ts(Utc::now()), after_ts, after_key, limit],
        )
        .await
    }

    async fn list_by_status(&self, kind: StatusKind, limit: u32) -> Result<Vec<Item>> {
        self.query_items(
            &format!(
                "SELECT {ITEM_COLUMNS} FROM items WHERE status = ?1
                 ORDER BY discovered_at, key LIMIT ?2"
            ),
            params![kind.as_str(), limit],
        )
        .await
    }

    async fn count_by_status(&self) -> Result<Vec<(StatusKind, u64)>> {
        let conn = self.lock_conn().await;
        let mut rows = conn
            .query("SELECT status, COUNT(*) FROM items GROUP BY status", params![])
            .await
            .map_err(CourierError::storage)?;

        let mut counts: Vec<(StatusKind, u64)> =
            StatusKind::ALL.iter().map(|kind| (*kind, 0)).collect();
        while let Some(row) = rows.next().await.map_err(CourierError::storage)? {
            let status: String = row.get(0).map_err(CourierError::storage)?;
            let count: i64 = row.get(1).map_err(CourierError::storage)?;
            let kind: StatusKind = status.parse()?;
            if let Some(slot) = counts.iter_mut().find(|(k, _)| *k == kind) {
                slot.1 = count as u64;
            }
        }
        Ok(counts)
    }

    async fn prune_delivered(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        let cutoff = format_ts(older_than);
        let conn = self.lock_conn().await;
        let tx = conn.transaction().await.map_err(CourierError::storage)?;

        tx.execute(
            &format!(
                "DELETE FROM deliveries WHERE item_key IN (
                    SELECT key FROM items WHERE {PRUNABLE}
                 )"
            ),
            params![cutoff.as_str()],
        )
        .await
        .map_err(CourierError::storage)?;

        let removed = tx
            .execute(
                &format!("DELETE FROM items WHERE {PRUNABLE}"),
                params![cutoff.as_str()],
            )
            .await
            .map_err(CourierError::storage)?;

        tx.commit().await.map_err(CourierError::storage)?;
        tracing::info!(removed, cutoff = %cutoff, "pruned delivered items");
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Deliveries
// ---------------------------------------------------------------------------

#[async_trait]
impl DeliveryStore for Storage {
    async fn get_delivery(
        &self,
        key: &ItemKey,
        destination_id: &str,
    ) -> Result<Option<DeliveryRecord>> {
        let conn = self.lock_conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries
                     WHERE item_key = ?1 AND destination_id = ?2"
                ),
                params![key.as_str(), destination_id],
            )
            .await
            .map_err(CourierError::storage)?;

        match rows.next().await.map_err(CourierError::storage)? {
            Some(row) => Ok(Some(row_to_delivery(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_deliveries(&self, key: &ItemKey) -> Result<Vec<DeliveryRecord>> {
        let conn = self.lock_conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries
                     WHERE item_key = ?1 ORDER BY destination_id"
                ),
                params![key.as_str()],
            )
            .await
            .map_err(CourierError::storage)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(CourierError::storage)? {
            records.push(row_to_delivery(&row)?);
        }
        Ok(records)
    }

    async fn list_deliveries_by_status(
        &self,
        status: DeliveryStatus,
        limit: u32,
    ) -> Result<Vec<DeliveryRecord>> {
        let conn = self.lock_conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries
                     WHERE status = ?1
                     ORDER BY updated_at, item_key, destination_id
                     LIMIT ?2"
                ),
                params![status.as_str(), limit],
            )
            .await
            .map_err(CourierError::storage)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(CourierError::storage)? {
            records.push(row_to_delivery(&row)?);
        }
        Ok(records)
    }

    async fn count_deliveries_by_status(&self) -> Result<Vec<(DeliveryStatus, u64)>> {
        let conn = self.lock_conn().await;
        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM deliveries GROUP BY status",
                params![],
            )
            .await
            .map_err(CourierError::storage)?;

        let mut counts: Vec<(DeliveryStatus, u64)> =
            DeliveryStatus::ALL.iter().map(|status| (*status, 0)).collect();
        while let Some(row) = rows.next().await.map_err(CourierError::storage)? {
            let status: String = row.get(0).map_err(CourierError::storage)?;
            let count: i64 = row.get(1).map_err(CourierError::storage)?;
            let status: DeliveryStatus = status.parse()?;
            if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == status) {
                slot.1 = count as u64;
            }
        }
        Ok(counts)
    }

    async fn save_delivery(&self, record: &DeliveryRecord) -> Result<bool> {
        self.check_writable()?;
        if record.status == DeliveryStatus::Committed {
            return Err(CourierError::validation(
                "committed deliveries must go through commit_delivery",
            ));
        }
        self.upsert_delivery(record, record.status).await
    }

    async fn commit_delivery(&self, record: &DeliveryRecord) -> Result<bool> {
        self.check_writable()?;
        self.upsert_delivery(record, DeliveryStatus::Committed).await
    }
}

impl Storage {
    /// Upsert guarded so a committed row is never touched again.
    async fn upsert_delivery(&self, record: &DeliveryRecord, status: DeliveryStatus) -> Result<bool> {
        let conn = self.lock_conn().await;
        let changed = conn
            .execute(
                &format!(
                    "INSERT INTO deliveries ({DELIVERY_COLUMNS}, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(item_key, destination_id) DO UPDATE SET
                        status = excluded.status,
                        attempts = excluded.attempts,
                        last_error = excluded.last_error,
                        external_ref = excluded.external_ref,
                        next_attempt_at = excluded.next_attempt_at,
                        committed_at = excluded.committed_at,
                        updated_at = excluded.updated_at
                     WHERE deliveries.status <> 'committed'"
                ),
                params![
                    record.item_key.as_str(),
                    record.destination_id.as_str(),
                    status.as_str(),
                    record.attempts,
                    record.last_error.clone(),
                    record.external_ref.clone(),
                    record.next_attempt_at.map(format_ts),
                    record.committed_at.map(format_ts),
                    format_ts(Utc::now()),
                ],
            )
            .await
            .map_err(CourierError::storage)?;
        Ok(changed > 0)
    }
}

// ---------------------------------------------------------------------------
// Source cursors
// ---------------------------------------------------------------------------

#[async_trait]
impl CursorStore for Storage {
    async fn get_cursor(&self, source_name: &str) -> Result<Option<SourceCursor>> {
        let conn = self.lock_conn().await;
        let mut rows = conn
            .query(
                "SELECT source_name, last_key, last_checked, active, admitted_total
                 FROM source_cursors WHERE source_name = ?1",
                params![source_name],
            )
            .await
            .map_err(CourierError::storage)?;

        match rows.next().await.map_err(CourierError::storage)? {
            Some(row) => Ok(Some(row_to_cursor(&row)?)),
            None => Ok(None),
        }
    }

    async fn save_cursor(&self, cursor: &SourceCursor) -> Result<()> {
        self.check_writable()?;
        let conn = self.lock_conn().await;
        conn.execute(
            "INSERT INTO source_cursors (source_name, last_key, last_checked, active, admitted_total)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source_name) DO UPDATE SET
                last_key = excluded.last_key,
                last_checked = excluded.last_checked,
                active = excluded.active,
                admitted_total = excluded.admitted_total",
            params![
                cursor.source_name.as_str(),
                cursor.last_key.clone(),
                cursor.last_checked.map(format_ts),
                cursor.active as i64,
                cursor.admitted_total as i64,
            ],
        )
        .await
        .map_err(CourierError::storage)?;
        Ok(())
    }

    async fn list_cursors(&self) -> Result<Vec<SourceCursor>> {
        let conn = self.lock_conn().await;
        let mut rows = conn
            .query(
                "SELECT source_name, last_key, last_checked, active, admitted_total
                 FROM source_cursors ORDER BY source_name",
                params![],
            )
            .await
            .map_err(CourierError::storage)?;

        let mut cursors = Vec::new();
        while let Some(row) = rows.next().await.map_err(CourierError::storage)? {
            cursors.push(row_to_cursor(&row)?);
        }
        Ok(cursors)
    }

    async fn set_source_active(&self, source_name: &str, active: bool) -> Result<()> {
        self.check_writable()?;
        let conn = self.lock_conn().await;
        conn.execute(
            "INSERT INTO source_cursors (source_name, active) VALUES (?1, ?2)
             ON CONFLICT(source_name) DO UPDATE SET active = excluded.active",
            params![source_name, active as i64],
        )
        .await
        .map_err(CourierError::storage)?;
        tracing::info!(source = source_name, active, "source activity changed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Fixed-width UTC timestamp so text comparison matches time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CourierError::Storage(format!("invalid date '{s}': {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Keyset bounds; empty strings sort before every stored value.
fn cursor_bounds(after: Option<&PendingCursor>) -> (String, String) {
    match after {
        Some(c) => (format_ts(c.discovered_at), c.key.as_str().to_string()),
        None => (String::new(), String::new()),
    }
}

/// Serialized item fields that don't bind directly.
struct ItemColumns {
    raw_json: String,
    payload_json: String,
    status: &'static str,
    stage_name: Option<String>,
    stage_ordinal: Option<i64>,
    fail_reason: Option<String>,
}

impl ItemColumns {
    fn from_item(item: &Item) -> Result<Self> {
        let raw_json = serde_json::to_string(&item.raw).map_err(CourierError::storage)?;
        let payload_json = serde_json::to_string(&item.payload).map_err(CourierError::storage)?;
        let (stage_name, stage_ordinal, fail_reason) = match &item.status {
            ItemStatus::InStage { stage, ordinal } => {
                (Some(stage.clone()), Some(*ordinal as i64), None)
            }
            ItemStatus::Failed {
                stage,
                ordinal,
                reason,
            } => (Some(stage.clone()), Some(*ordinal as i64), Some(reason.clone())),
            _ => (None, None, None),
        };
        Ok(Self {
            raw_json,
            payload_json,
            status: item.status.kind().as_str(),
            stage_name,
            stage_ordinal,
            fail_reason,
        })
    }
}

/// Convert a database row to an [`Item`].
fn row_to_item(row: &libsql::Row) -> Result<Item> {
    let key: String = row.get(0).map_err(CourierError::storage)?;
    let raw_json: String = row.get(4).map_err(CourierError::storage)?;
    let payload_json: String = row.get(7).map_err(CourierError::storage)?;
    let status: String = row.get(8).map_err(CourierError::storage)?;
    let stage_name: Option<String> = row.get(9).map_err(CourierError::storage)?;
    let stage_ordinal: Option<i64> = row.get(10).map_err(CourierError::storage)?;
    let fail_reason: Option<String> = row.get(11).map_err(CourierError::storage)?;

    let status = match status.parse::<StatusKind>()? {
        StatusKind::Pending => ItemStatus::Pending,
        StatusKind::Ready => ItemStatus::Ready,
        StatusKind::Delivered => ItemStatus::Delivered,
        StatusKind::InStage => ItemStatus::InStage {
            stage: stage_name.unwrap_or_default(),
            ordinal: stage_ordinal.unwrap_or_default() as u32,
        },
        StatusKind::Failed => ItemStatus::Failed {
            stage: stage_name.unwrap_or_default(),
            ordinal: stage_ordinal.unwrap_or_default() as u32,
            reason: fail_reason.unwrap_or_default(),
        },
    };

    let payload: Vec<PayloadEntry> = serde_json::from_str(&payload_json)
        .map_err(|e| CourierError::Storage(format!("corrupt payload for {key}: {e}")))?;
    let raw = serde_json::from_str(&raw_json)
        .map_err(|e| CourierError::Storage(format!("corrupt raw content for {key}: {e}")))?;

    Ok(Item {
        key: ItemKey::from_raw(key),
        source_name: row.get(1).map_err(CourierError::storage)?,
        source_key: row.get(2).map_err(CourierError::storage)?,
        discovered_at: parse_ts(&row.get::<String>(3).map_err(CourierError::storage)?)?,
        raw,
        content_hash: row.get(5).map_err(CourierError::storage)?,
        parent_key: row.get(6).map_err(CourierError::storage)?,
        payload,
        status,
        version: row.get::<i64>(12).map_err(CourierError::storage)? as u64,
        lease_until: parse_opt_ts(row.get(13).map_err(CourierError::storage)?)?,
    })
}

/// Convert a database row to a [`DeliveryRecord`].
fn row_to_delivery(row: &libsql::Row) -> Result<DeliveryRecord> {
    let status: String = row.get(2).map_err(CourierError::storage)?;
    Ok(DeliveryRecord {
        item_key: ItemKey::from_raw(row.get::<String>(0).map_err(CourierError::storage)?),
        destination_id: row.get(1).map_err(CourierError::storage)?,
        status: status.parse()?,
        attempts: row.get::<u32>(3).map_err(CourierError::storage)?,
        last_error: row.get(4).map_err(CourierError::storage)?,
        external_ref: row.get(5).map_err(CourierError::storage)?,
        next_attempt_at: parse_opt_ts(row.get(6).map_err(CourierError::storage)?)?,
        committed_at: parse_opt_ts(row.get(7).map_err(CourierError::storage)?)?,
    })
}

/// Convert a database row to a [`SourceCursor`].
fn row_to_cursor(row: &libsql::Row) -> Result<SourceCursor> {
    Ok(SourceCursor {
        source_name: row.get(0).map_err(CourierError::storage)?,
        last_key: row.get(1).map_err(CourierError::storage)?,
        last_checked: parse_opt_ts(row.get(2).map_err(CourierError::storage)?)?,
        active: row.get::<i64>(3).map_err(CourierError::storage)? != 0,
        admitted_total: row.get::<i64>(4).map_err(CourierError::storage)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use courier_shared::DiscoveredItem;
    use serde_json::json;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("courier_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn item(key: &str) -> Item {
        Item::discovered(DiscoveredItem {
            source_name: "twitter".into(),
            source_key: key.into(),
            raw: json!({"text": format!("post {key}")}),
            parent_key: None,
        })
    }

    fn pending_record(key: &Item, dest: &str) -> DeliveryRecord {
        DeliveryRecord {
            item_key: key.key.clone(),
            destination_id: dest.into(),
            status: DeliveryStatus::Pending,
            attempts: 1,
            last_error: Some("HTTP 503".into()),
            external_ref: None,
            next_attempt_at: Some(Utc::now()),
            committed_at: None,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("courier_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn insert_if_absent_admits_once() {
        let storage = test_storage().await;
        let it = item("tweet-123");

        assert!(storage.insert_if_absent(&it).await.expect("first insert"));
        assert!(!storage.insert_if_absent(&it).await.expect("second insert"));

        let found = storage.get(&it.key).await.expect("get").expect("exists");
        assert_eq!(found.key.as_str(), "twitter:tweet-123");
        assert_eq!(found.status, ItemStatus::Pending);
        assert_eq!(found.raw, it.raw);
        assert_eq!(found.content_hash, it.content_hash);
    }

    #[tokio::test]
    async fn concurrent_insert_if_absent_single_winner() {
        let storage = test_storage().await;
        let it = item("race");
        let attempts = (0..8).map(|_| storage.insert_if_absent(&it));
        let results = futures::future::join_all(attempts).await;
        let wins = results
            .into_iter()
            .map(|r| r.expect("insert"))
            .filter(|inserted| *inserted)
            .count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn put_if_version_is_compare_and_set() {
        let storage = test_storage().await;
        let mut it = item("cas");
        storage.insert_if_absent(&it).await.unwrap();

        it.status = ItemStatus::InStage {
            stage: "translate".into(),
            ordinal: 1,
        };
        assert!(storage.put_if_version(&it, 0).await.expect("first cas"));
        // Stale version loses.
        assert!(!storage.put_if_version(&it, 0).await.expect("stale cas"));

        let stored = storage.get(&it.key).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.status.ordinal(), Some(1));
    }

    #[tokio::test]
    async fn payload_and_failure_roundtrip() {
        let storage = test_storage().await;
        let mut it = item("fail");
        it.record_output("translate", 1, json!({"text": "hola"}))
            .unwrap();
        it.status = ItemStatus::Failed {
            stage: "summarize".into(),
            ordinal: 2,
            reason: "HTTP 400".into(),
        };
        storage.put(&it).await.expect("put");

        let stored = storage.get(&it.key).await.unwrap().unwrap();
        assert_eq!(stored.payload.len(), 1);
        assert_eq!(stored.payload[0].output, json!({"text": "hola"}));
        assert_eq!(stored.status, it.status);
    }

    #[tokio::test]
    async fn list_pending_orders_and_filters() {
        let storage = test_storage().await;
        let base = Utc::now() - ChronoDuration::minutes(10);

        let mut a = item("a");
        a.discovered_at = base + ChronoDuration::seconds(2);
        let mut b = item("b");
        b.discovered_at = base;
        let mut leased = item("leased");
        leased.discovered_at = base + ChronoDuration::seconds(1);
        leased.lease_until = Some(Utc::now() + ChronoDuration::minutes(5));
        let mut late_stage = item("late");
        late_stage.discovered_at = base + ChronoDuration::seconds(3);
        late_stage.status = ItemStatus::InStage {
            stage: "publish".into(),
            ordinal: 4,
        };
        let mut ready = item("ready");
        ready.status = ItemStatus::Ready;

        for it in [&a, &b, &leased, &late_stage, &ready] {
            storage.put(it).await.unwrap();
        }

        let pending = storage.list_pending(3, None, 10).await.expect("list");
        let keys: Vec<&str> = pending.iter().map(|i| i.source_key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a"]);

        // Keyset paging resumes after the cursor.
        let first = storage.list_pending(3, None, 1).await.unwrap();
        let cursor = PendingCursor::after(&first[0]);
        let second = storage.list_pending(3, Some(&cursor), 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].source_key, "a");

        let ready_items = storage.list_ready(None, 10).await.unwrap();
        assert_eq!(ready_items.len(), 1);
        assert_eq!(ready_items[0].source_key, "ready");
    }

    #[tokio::test]
    async fn expired_lease_is_claimable() {
        let storage = test_storage().await;
        let mut it = item("crashed");
        it.status = ItemStatus::InStage {
            stage: "translate".into(),
            ordinal: 1,
        };
        it.lease_until = Some(Utc::now() - ChronoDuration::seconds(1));
        storage.put(&it).await.unwrap();

        let pending = storage.list_pending(1, None, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn status_counts_include_zeroes() {
        let storage = test_storage().await;
        storage.put(&item("1")).await.unwrap();
        storage.put(&item("2")).await.unwrap();
        let mut done = item("3");
        done.status = ItemStatus::Delivered;
        storage.put(&done).await.unwrap();

        let counts = storage.count_by_status().await.expect("counts");
        assert_eq!(counts.len(), StatusKind::ALL.len());
        let get = |kind| counts.iter().find(|(k, _)| *k == kind).map(|(_, n)| *n);
        assert_eq!(get(StatusKind::Pending), Some(2));
        assert_eq!(get(StatusKind::Delivered), Some(1));
        assert_eq!(get(StatusKind::Failed), Some(0));
    }

    #[tokio::test]
    async fn prune_removes_only_old_delivered() {
        let storage = test_storage().await;
        let old = Utc::now() - ChronoDuration::days(40);

        let mut old_delivered = item("old-delivered");
        old_delivered.discovered_at = old;
        old_delivered.status = ItemStatus::Delivered;
        let mut old_failed = item("old-failed");
        old_failed.discovered_at = old;
        old_failed.status = ItemStatus::Failed {
            stage: "translate".into(),
            ordinal: 1,
            reason: "HTTP 404".into(),
        };
        let mut fresh_delivered = item("fresh");
        fresh_delivered.status = ItemStatus::Delivered;

        for it in [&old_delivered, &old_failed, &fresh_delivered] {
            storage.put(it).await.unwrap();
        }
        let mut record = pending_record(&old_delivered, "chat-a");
        record.external_ref = Some("msg-1".into());
        storage.commit_delivery(&record).await.unwrap();

        let removed = storage
            .prune_delivered(Utc::now() - ChronoDuration::days(30))
            .await
            .expect("prune");
        assert_eq!(removed, 1);

        assert!(storage.get(&old_delivered.key).await.unwrap().is_none());
        assert!(storage.get(&old_failed.key).await.unwrap().is_some());
        assert!(storage.get(&fresh_delivered.key).await.unwrap().is_some());
        assert!(
            storage
                .list_deliveries(&old_delivered.key)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn prune_keeps_items_with_failed_deliveries() {
        let storage = test_storage().await;
        let mut rejected = item("rejected");
        rejected.discovered_at = Utc::now() - ChronoDuration::days(40);
        rejected.status = ItemStatus::Delivered;
        storage.put(&rejected).await.unwrap();

        let mut record = pending_record(&rejected, "chat-a");
        record.status = DeliveryStatus::PermanentlyFailed;
        record.last_error = Some("HTTP 403".into());
        record.next_attempt_at = None;
        storage.save_delivery(&record).await.unwrap();

        let removed = storage
            .prune_delivered(Utc::now() - ChronoDuration::days(30))
            .await
            .expect("prune");
        assert_eq!(removed, 0);
        assert!(storage.get(&rejected.key).await.unwrap().is_some());
        assert_eq!(storage.list_deliveries(&rejected.key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deliveries_listed_and_counted_by_status() {
        let storage = test_storage().await;
        let a = item("a");
        let b = item("b");
        storage.put(&a).await.unwrap();
        storage.put(&b).await.unwrap();

        storage.save_delivery(&pending_record(&a, "chat-a")).await.unwrap();
        let mut failed = pending_record(&a, "chat-b");
        failed.status = DeliveryStatus::PermanentlyFailed;
        failed.last_error = Some("HTTP 403".into());
        storage.save_delivery(&failed).await.unwrap();
        let mut committed = pending_record(&b, "chat-a");
        committed.external_ref = Some("msg-b".into());
        storage.commit_delivery(&committed).await.unwrap();

        let listed = storage
            .list_deliveries_by_status(DeliveryStatus::PermanentlyFailed, 10)
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].item_key, a.key);
        assert_eq!(listed[0].destination_id, "chat-b");
        assert_eq!(listed[0].last_error.as_deref(), Some("HTTP 403"));

        let counts = storage.count_deliveries_by_status().await.expect("count");
        assert_eq!(counts.len(), DeliveryStatus::ALL.len());
        let get = |status| counts.iter().find(|(s, _)| *s == status).map(|(_, n)| *n);
        assert_eq!(get(DeliveryStatus::Pending), Some(1));
        assert_eq!(get(DeliveryStatus::Committed), Some(1));
        assert_eq!(get(DeliveryStatus::PermanentlyFailed), Some(1));
    }

    #[tokio::test]
    async fn delivery_commits_once() {
        let storage = test_storage().await;
        let it = item("deliver");
        storage.put(&it).await.unwrap();

        let record = pending_record(&it, "chat-a");
        assert!(storage.save_delivery(&record).await.expect("save pending"));

        let mut committed = record.clone();
        committed.external_ref = Some("msg-42".into());
        committed.committed_at = Some(Utc::now());
        assert!(storage.commit_delivery(&committed).await.expect("commit"));
        assert!(!storage.commit_delivery(&committed).await.expect("recommit"));

        // A stale pending write cannot undo the commit.
        assert!(!storage.save_delivery(&record).await.expect("stale save"));

        let stored = storage
            .get_delivery(&it.key, "chat-a")
            .await
            .unwrap()
            .expect("record");
        assert_eq!(stored.status, DeliveryStatus::Committed);
        assert_eq!(stored.external_ref.as_deref(), Some("msg-42"));
    }

    #[tokio::test]
    async fn save_delivery_rejects_committed_status() {
        let storage = test_storage().await;
        let it = item("x");
        let mut record = pending_record(&it, "chat-a");
        record.status = DeliveryStatus::Committed;
        assert!(storage.save_delivery(&record).await.is_err());
    }

    #[tokio::test]
    async fn cursor_lifecycle() {
        let storage = test_storage().await;
        assert!(storage.get_cursor("twitter").await.unwrap().is_none());

        storage
            .save_cursor(&SourceCursor {
                source_name: "twitter".into(),
                last_key: Some("tweet-9".into()),
                last_checked: Some(Utc::now()),
                active: true,
                admitted_total: 9,
            })
            .await
            .expect("save cursor");

        storage
            .set_source_active("twitter", false)
            .await
            .expect("pause");
        storage.set_source_active("rss", false).await.expect("pause new");

        let twitter = storage.get_cursor("twitter").await.unwrap().unwrap();
        assert!(!twitter.active);
        assert_eq!(twitter.admitted_total, 9);
        assert_eq!(twitter.last_key.as_deref(), Some("tweet-9"));

        let all = storage.list_cursors().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].source_name, "rss");
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("courier_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.put(&item("1")).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.list_by_status(StatusKind::Pending, 10).await.unwrap().len(), 1);
        let result = ro.put(&item("2")).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
