//! Shared types, error model, and configuration for Courier.
//!
//! This crate is the foundation depended on by all other Courier crates.
//! It provides:
//! - [`CourierError`], the unified error type
//! - Domain types ([`Item`], [`ItemKey`], [`DeliveryRecord`], [`StageDefinition`])
//! - Configuration ([`AppConfig`], config loading and validation)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CapabilityConfig, DestinationConfig, PipelineConfig, SourceConfig, StageConfig,
    StorageConfig, StorageRetryConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from,
};
pub use error::{CourierError, Result};
pub use types::{
    CircuitPolicy, DeliveryContext, DeliveryRecord, DeliveryStatus, DiscoveredItem, FinishedItem,
    Item, ItemKey, ItemStatus, PayloadEntry, RetryPolicy, SourceCursor, StageDefinition,
    StageInput, StatusKind, content_hash,
};
