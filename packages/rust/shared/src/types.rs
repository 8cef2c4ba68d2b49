//! Core domain types for the relay pipeline.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CourierError, Result};

// ---------------------------------------------------------------------------
// ItemKey
// ---------------------------------------------------------------------------

/// Global dedup key: `<source_name>:<source_key>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(String);

impl ItemKey {
    /// Build the global key from a source name and a source-local key.
    pub fn new(source_name: &str, source_key: &str) -> Self {
        Self(format!("{source_name}:{source_key}"))
    }

    /// Wrap an already-joined key (as read back from storage).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// DiscoveredItem
// ---------------------------------------------------------------------------

/// A raw item as produced by a source adapter, before admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredItem {
    /// Configured name of the source that produced the item.
    pub source_name: String,
    /// Identifier unique within the source (e.g. a post id).
    pub source_key: String,
    /// Raw content as the source returned it.
    pub raw: serde_json::Value,
    /// Source-local key of the item this one replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
}

impl DiscoveredItem {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(&self.source_name, &self.source_key)
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// Lifecycle state of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InStage {
        stage: String,
        ordinal: u32,
    },
    Failed {
        stage: String,
        ordinal: u32,
        reason: String,
    },
    Ready,
    Delivered,
}

impl ItemStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            Self::Pending => StatusKind::Pending,
            Self::InStage { .. } => StatusKind::InStage,
            Self::Failed { .. } => StatusKind::Failed,
            Self::Ready => StatusKind::Ready,
            Self::Delivered => StatusKind::Delivered,
        }
    }

    /// Stage ordinal carried by the status, if any.
    pub fn ordinal(&self) -> Option<u32> {
        match self {
            Self::InStage { ordinal, .. } | Self::Failed { ordinal, .. } => Some(*ordinal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InStage { stage, ordinal } => write!(f, "in_stage({ordinal}:{stage})"),
            Self::Failed {
                stage,
                ordinal,
                reason,
            } => write!(f, "failed({ordinal}:{stage}): {reason}"),
            Self::Ready => write!(f, "ready"),
            Self::Delivered => write!(f, "delivered"),
        }
    }
}

/// Status discriminant, used as the `status` column and for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Pending,
    InStage,
    Failed,
    Ready,
    Delivered,
}

impl StatusKind {
    pub const ALL: [StatusKind; 5] = [
        Self::Pending,
        Self::InStage,
        Self::Failed,
        Self::Ready,
        Self::Delivered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InStage => "in_stage",
            Self::Failed => "failed",
            Self::Ready => "ready",
            Self::Delivered => "delivered",
        }
    }
}

impl std::str::FromStr for StatusKind {
    type Err = CourierError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_stage" => Ok(Self::InStage),
            "failed" => Ok(Self::Failed),
            "ready" => Ok(Self::Ready),
            "delivered" => Ok(Self::Delivered),
            other => Err(CourierError::parse(format!("unknown item status '{other}'"))),
        }
    }
}

/// One completed stage's output, as recorded on the item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadEntry {
    pub stage_name: String,
    pub ordinal: u32,
    pub output: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

/// The unit of work tracked through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub key: ItemKey,
    pub source_name: String,
    pub source_key: String,
    pub discovered_at: DateTime<Utc>,
    pub raw: serde_json::Value,
    /// SHA-256 of the serialized raw content.
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_key: Option<String>,
    /// Append-only stage outputs, ordinals `1..=n`.
    pub payload: Vec<PayloadEntry>,
    pub status: ItemStatus,
    /// Optimistic-concurrency version, bumped on every write.
    pub version: u64,
    /// Claim lease; while in the future only the claimant may write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<DateTime<Utc>>,
}

impl Item {
    /// Build a fresh `Pending` item from a discovered one.
    pub fn discovered(discovered: DiscoveredItem) -> Self {
        let content_hash = content_hash(&discovered.raw);
        Self {
            key: discovered.key(),
            source_name: discovered.source_name,
            source_key: discovered.source_key,
            discovered_at: Utc::now(),
            raw: discovered.raw,
            content_hash,
            parent_key: discovered.parent_key,
            payload: Vec::new(),
            status: ItemStatus::Pending,
            version: 0,
            lease_until: None,
        }
    }

    /// Ordinal of the next stage that has no recorded output.
    pub fn next_ordinal(&self) -> u32 {
        self.payload.len() as u32 + 1
    }

    /// Recorded output for a stage ordinal, if that stage already completed.
    pub fn output_for(&self, ordinal: u32) -> Option<&PayloadEntry> {
        self.payload.iter().find(|e| e.ordinal == ordinal)
    }

    /// Append a stage output. Rejects anything but the next ordinal, which
    /// keeps the payload gap-free and repeat-free.
    pub fn record_output(
        &mut self,
        stage_name: &str,
        ordinal: u32,
        output: serde_json::Value,
    ) -> Result<()> {
        let expected = self.next_ordinal();
        if ordinal != expected {
            return Err(CourierError::validation(format!(
                "item {}: cannot record stage {stage_name} at ordinal {ordinal}, next is {expected}",
                self.key
            )));
        }
        self.payload.push(PayloadEntry {
            stage_name: stage_name.to_string(),
            ordinal,
            output,
            completed_at: Utc::now(),
        });
        Ok(())
    }

    /// Whether another worker currently holds the claim.
    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        self.lease_until.is_some_and(|until| until > now)
    }
}

/// SHA-256 hex digest of a JSON value's compact serialization.
pub fn content_hash(raw: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Stage definitions and policies
// ---------------------------------------------------------------------------

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let exp = attempt.saturating_sub(1).min(31);
        let ms = base_ms.saturating_mul(2u64.saturating_pow(exp));
        Duration::from_millis(ms.min(max_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Consecutive-failure circuit breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// One ordered enrichment step, resolved from config.
#[derive(Debug, Clone)]
pub struct StageDefinition {
    pub name: String,
    /// 1-based position; configured ordinals are exactly `1..=N`.
    pub ordinal: u32,
    /// Name of the bound capability.
    pub capability: String,
    pub concurrency_limit: usize,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub circuit: CircuitPolicy,
}

impl StageDefinition {
    /// Longest a single run can take: every attempt timing out, plus the
    /// backoff between attempts.
    pub fn max_run_time(&self) -> Duration {
        let attempts = self.retry.max_attempts.max(1);
        (1..attempts)
            .map(|attempt| self.retry.delay_for(attempt))
            .fold(self.timeout.saturating_mul(attempts), Duration::saturating_add)
    }
}

// ---------------------------------------------------------------------------
// Stage / delivery payloads handed to adapters
// ---------------------------------------------------------------------------

/// Input handed to a stage capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
    pub item_key: ItemKey,
    pub stage_name: String,
    pub ordinal: u32,
    pub raw: serde_json::Value,
    /// Outputs of every earlier stage, in ordinal order.
    pub payload: Vec<PayloadEntry>,
}

impl StageInput {
    pub fn for_item(item: &Item, stage_name: &str, ordinal: u32) -> Self {
        Self {
            item_key: item.key.clone(),
            stage_name: stage_name.to_string(),
            ordinal,
            raw: item.raw.clone(),
            payload: item.payload.clone(),
        }
    }
}

/// A fully enriched item, as handed to destinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishedItem {
    pub key: ItemKey,
    pub source_name: String,
    pub source_key: String,
    pub discovered_at: DateTime<Utc>,
    pub raw: serde_json::Value,
    pub payload: Vec<PayloadEntry>,
}

impl From<&Item> for FinishedItem {
    fn from(item: &Item) -> Self {
        Self {
            key: item.key.clone(),
            source_name: item.source_name.clone(),
            source_key: item.source_key.clone(),
            discovered_at: item.discovered_at,
            raw: item.raw.clone(),
            payload: item.payload.clone(),
        }
    }
}

/// Extra context for one destination send.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryContext {
    /// External ref of the parent item's message at the same destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

// ---------------------------------------------------------------------------
// DeliveryRecord
// ---------------------------------------------------------------------------

/// Delivery state of one (item, destination) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Committed,
    PermanentlyFailed,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 3] = [Self::Pending, Self::Committed, Self::PermanentlyFailed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = CourierError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "committed" => Ok(Self::Committed),
            "permanently_failed" => Ok(Self::PermanentlyFailed),
            other => Err(CourierError::parse(format!(
                "unknown delivery status '{other}'"
            ))),
        }
    }
}

/// Persisted delivery bookkeeping for one (item, destination) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub item_key: ItemKey,
    pub destination_id: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Destination-side id of the sent message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    /// Earliest time the next send may be attempted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// SourceCursor
// ---------------------------------------------------------------------------

/// Per-source discovery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCursor {
    pub source_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    pub active: bool,
    pub admitted_total: u64,
}
