//! SQL migration definitions for the Courier database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: items, deliveries, source_cursors",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Every item ever admitted, keyed by "<source>:<source_key>"
CREATE TABLE IF NOT EXISTS items (
    key           TEXT PRIMARY KEY,
    source_name   TEXT NOT NULL,
    source_key    TEXT NOT NULL,
    discovered_at TEXT NOT NULL,
    raw_json      TEXT NOT NULL,
    content_hash  TEXT NOT NULL,
    parent_key    TEXT,
    payload_json  TEXT NOT NULL DEFAULT '[]',
    status        TEXT NOT NULL,
    stage_name    TEXT,
    stage_ordinal INTEGER,
    fail_reason   TEXT,
    version       INTEGER NOT NULL DEFAULT 0,
    lease_until   TEXT,
    updated_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_status_order ON items(status, discovered_at, key);

-- Delivery outcome per (item, destination)
CREATE TABLE IF NOT EXISTS deliveries (
    item_key        TEXT NOT NULL,
    destination_id  TEXT NOT NULL,
    status          TEXT NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    external_ref    TEXT,
    next_attempt_at TEXT,
    committed_at    TEXT,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (item_key, destination_id)
);

-- Discovery bookkeeping per source
CREATE TABLE IF NOT EXISTS source_cursors (
    source_name    TEXT PRIMARY KEY,
    last_key       TEXT,
    last_checked   TEXT,
    active         INTEGER NOT NULL DEFAULT 1,
    admitted_total INTEGER NOT NULL DEFAULT 0
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Index deliveries by status for the operator views",
            sql: r#"
CREATE INDEX IF NOT EXISTS idx_deliveries_status ON deliveries(status, updated_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
