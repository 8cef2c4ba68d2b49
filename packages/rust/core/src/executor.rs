//! Stage executor: one enrichment stage against one item, with deadline,
//! bounded retries, a per-stage concurrency limit, and a circuit breaker.
//!
//! The executor has no persistence side effects; the coordinator records
//! whatever it returns.

use std::sync::{Arc, Mutex};

use courier_adapters::StageCapability;
use courier_shared::{CircuitPolicy, CourierError, Item, Result, StageDefinition, StageInput};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Outcome of one executor run.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    Success(serde_json::Value),
    /// Not attempted or interrupted; the item should come back later.
    Retryable(String),
    /// Will not succeed for this input.
    Fatal(String),
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { until: Instant },
    /// Cooldown elapsed and a single probe run is in flight.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
}

/// Consecutive-failure breaker for one stage.
#[derive(Debug)]
pub struct CircuitBreaker {
    policy: CircuitPolicy,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(policy: CircuitPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a run may proceed. After the cooldown exactly one caller is
    /// let through as the half-open probe.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open { until } => {
                if Instant::now() >= until {
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// The external service answered (success or a definitive rejection).
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
    }

    /// A run ended without a verdict. A half-open probe hands its slot back
    /// so the next caller may probe immediately.
    pub fn abandon_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open {
                until: Instant::now(),
            };
        }
    }

    /// A run exhausted its retries on transient errors or timeouts.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        let reopen = matches!(inner.state, CircuitState::HalfOpen)
            || inner.consecutive_failures >= self.policy.failure_threshold;
        if reopen {
            inner.state = CircuitState::Open {
                until: Instant::now() + self.policy.cooldown,
            };
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs one configured stage.
pub struct StageExecutor {
    definition: StageDefinition,
    capability: Arc<dyn StageCapability>,
    permits: Arc<Semaphore>,
    breaker: CircuitBreaker,
}

impl StageExecutor {
    pub fn new(definition: StageDefinition, capability: Arc<dyn StageCapability>) -> Self {
        let permits = Arc::new(Semaphore::new(definition.concurrency_limit.max(1)));
        let breaker = CircuitBreaker::new(definition.circuit);
        Self {
            definition,
            capability,
            permits,
            breaker,
        }
    }

    pub fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Run the stage for `item` to completion.
    pub async fn run(&self, item: &Item) -> StageResult {
        self.run_cancellable(item, &CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but a fired `shutdown` cuts backoff sleeps
    /// short with `Retryable`. An already fired token never invokes the stage.
    #[instrument(skip_all, fields(stage = %self.definition.name, item = %item.key))]
    pub async fn run_cancellable(&self, item: &Item, shutdown: &CancellationToken) -> StageResult {
        if shutdown.is_cancelled() {
            debug!("shutdown requested, not starting");
            return StageResult::Retryable("shutting down".into());
        }
        if !self.breaker.try_acquire() {
            debug!("circuit open, deferring");
            return StageResult::Retryable("circuit open".into());
        }

        let def = &self.definition;
        let input = StageInput::for_item(item, &def.name, def.ordinal);
        let mut last_reason = String::from("no attempts made");

        for attempt in 1..=def.retry.max_attempts {
            match tokio::time::timeout(def.timeout, self.attempt(&input)).await {
                Ok(Ok(output)) => {
                    self.breaker.record_success();
                    debug!(attempt, "stage succeeded");
                    return StageResult::Success(output);
                }
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(attempt, error = %e, "stage attempt failed");
                    last_reason = e.to_string();
                }
                Ok(Err(e)) => {
                    self.breaker.record_success();
                    warn!(attempt, error = %e, "stage failed permanently");
                    return StageResult::Fatal(e.to_string());
                }
                Err(_) => {
                    warn!(attempt, timeout = ?def.timeout, "stage attempt timed out");
                    last_reason = format!("timed out after {:?}", def.timeout);
                }
            }

            if attempt < def.retry.max_attempts {
                let delay = def.retry.delay_for(attempt);
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        self.breaker.abandon_probe();
                        return StageResult::Retryable("shutting down".into());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.breaker.record_failure();
        StageResult::Fatal(format!("retries exhausted: {last_reason}"))
    }

    /// One call under the stage's concurrency limit. The permit is dropped
    /// before any backoff sleep.
    async fn attempt(&self, input: &StageInput) -> Result<serde_json::Value> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CourierError::Transient("stage semaphore closed".into()))?;
        self.capability.invoke(input).await
    }
}
