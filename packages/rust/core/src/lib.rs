//! Pipeline orchestration for Courier.
//!
//! Ties discovery, dedup admission, ordered stage execution, and
//! per-destination delivery together around the persistent item store.

pub mod coordinator;
pub mod dedup;
pub mod delivery;
pub mod discovery;
pub mod executor;
pub mod observer;
mod retry;

pub use coordinator::{Coordinator, CoordinatorSettings, ItemOutcome};
pub use dedup::{Admission, DedupGate};
pub use delivery::{DeliveryOutcome, DeliveryTracker};
pub use discovery::DiscoveryRunner;
pub use executor::{CircuitBreaker, CircuitState, StageExecutor, StageResult};
pub use observer::{DiscoveryReport, PipelineObserver, PollReport, SilentObserver};
