//! Adapter traits and the bundled HTTP adapters.
//!
//! Three seams connect the pipeline to the outside world:
//! - [`SourceAdapter`] produces raw items
//! - [`StageCapability`] enriches one item for one stage
//! - [`DestinationAdapter`] receives finished items
//!
//! Bundled variants are selected by the config `kind` field through
//! [`AdapterRegistry::from_config`].

mod capability;
mod destination;
pub mod http;
mod registry;
mod source;

use async_trait::async_trait;
use courier_shared::{
    DeliveryContext, DiscoveredItem, FinishedItem, Result, StageInput,
};
use futures::stream::BoxStream;

pub use capability::HttpCapability;
pub use destination::WebhookDestination;
pub use registry::{AdapterRegistry, BoundDestination};
pub use source::JsonFeedSource;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Produces raw items from one configured origin.
pub trait SourceAdapter: Send + Sync {
    /// Configured source name; the first half of every item key.
    fn name(&self) -> &str;

    /// Lazily yield discovered items. A failed fetch surfaces as an `Err`
    /// element; the consumer decides whether to keep polling the stream.
    fn discover(&self) -> BoxStream<'_, Result<DiscoveredItem>>;
}

/// External enrichment bound to one stage.
///
/// Calls must be idempotent: a crash can cause the same input to be sent
/// again. Errors are classified through [`courier_shared::CourierError::is_retryable`].
#[async_trait]
pub trait StageCapability: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, input: &StageInput) -> Result<serde_json::Value>;
}

/// Receives finished items.
#[async_trait]
pub trait DestinationAdapter: Send + Sync {
    /// Unique destination id, half of the delivery-record key.
    fn id(&self) -> &str;

    /// Send one item. Returns the destination's reference for the sent
    /// message when it provides one.
    async fn send(&self, item: &FinishedItem, context: &DeliveryContext)
    -> Result<Option<String>>;
}
