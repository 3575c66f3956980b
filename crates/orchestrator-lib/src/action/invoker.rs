//! Idempotent management action invoker
//!
//! Applies a `ManagementAction` at most once per idempotency key:
//! - Replays the recorded output when the key was already committed with
//!   the same parameters
//! - Retries transient failures (throttling, timeout) with exponential backoff
//! - Restricts the retained output with the action's output selector and
//!   refuses outputs larger than the transport allows

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{IdempotencyLedger, ManagementAction};
use crate::error::{ActionError, PermanentClass};
use crate::observability::OrchestratorMetrics;

/// Transport for out-of-band administrative calls
#[async_trait]
pub trait RemoteActionClient: Send + Sync {
    /// Perform the call and return the full response
    async fn invoke(&self, action: &ManagementAction) -> Result<Value, ActionError>;
}

/// Bounded exponential backoff for transient failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after the given failed attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self.initial_backoff.saturating_mul(1u32 << exponent);
        backoff.min(self.max_backoff)
    }
}

/// Configuration for the action invoker
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    pub retry: RetryPolicy,
    /// Largest retained output, in serialized bytes
    pub max_output_bytes: usize,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_output_bytes: 4096,
        }
    }
}

/// Applies management actions through a shared idempotency ledger
pub struct ActionInvoker {
    client: Arc<dyn RemoteActionClient>,
    ledger: Arc<IdempotencyLedger>,
    config: InvokerConfig,
    metrics: OrchestratorMetrics,
}

impl ActionInvoker {
    pub fn new(
        client: Arc<dyn RemoteActionClient>,
        ledger: Arc<IdempotencyLedger>,
        config: InvokerConfig,
    ) -> Self {
        Self {
            client,
            ledger,
            config,
            metrics: OrchestratorMetrics::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<IdempotencyLedger> {
        &self.ledger
    }

    /// Apply an action, returning the retained output.
    ///
    /// The key stays reserved from the ledger check until the result is
    /// recorded, so concurrent callers with the same key see one remote call.
    pub async fn apply(&self, action: &ManagementAction) -> Result<Value, ActionError> {
        let parameters_hash = action.parameters_hash();
        let reservation = self.ledger.reserve(&action.idempotency_key).await;

        if let Some(record) = reservation.recorded() {
            if record.parameters_hash == parameters_hash {
                self.metrics.inc_ledger_replays();
                debug!(
                    action = %action.signature(),
                    key = %action.idempotency_key,
                    "Replaying recorded action output"
                );
                return Ok(record.output);
            }
            return Err(ActionError::permanent(
                PermanentClass::Conflict,
                format!(
                    "idempotency key {} was already used with different parameters",
                    action.idempotency_key
                ),
            ));
        }

        let response = self.invoke_with_retry(action).await?;
        let output = self.retain(action, response)?;

        reservation
            .commit(parameters_hash, output.clone())
            .map_err(|e| {
                ActionError::permanent(
                    PermanentClass::LedgerUnavailable,
                    format!("{} applied but not recorded durably: {}", action.signature(), e),
                )
            })?;
        info!(
            action = %action.signature(),
            key = %action.idempotency_key,
            "Management action applied"
        );

        Ok(output)
    }

    async fn invoke_with_retry(&self, action: &ManagementAction) -> Result<Value, ActionError> {
        let mut attempt = 1;
        loop {
            let start = Instant::now();
            let result = self.client.invoke(action).await;
            self.metrics
                .observe_action_latency(start.elapsed().as_secs_f64());

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < self.config.retry.max_attempts => {
                    let backoff = self.config.retry.backoff_for(attempt);
                    warn!(
                        action = %action.signature(),
                        error = %e,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Transient action failure, retrying"
                    );
                    self.metrics.inc_action_retries();
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        action = %action.signature(),
                        error = %e,
                        attempts = attempt,
                        "Management action failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Apply the output selector and enforce the size limit
    fn retain(&self, action: &ManagementAction, response: Value) -> Result<Value, ActionError> {
        let retained = match &action.output_selector {
            Some(selector) => selector.select(&response).unwrap_or_else(|| {
                warn!(
                    action = %action.signature(),
                    selector = %selector.path(),
                    "Output selector matched nothing, recording null"
                );
                Value::Null
            }),
            None => response,
        };

        let size = retained.to_string().len();
        if size > self.config.max_output_bytes {
            return Err(ActionError::permanent(
                PermanentClass::ResponseTooLarge,
                format!(
                    "{} response is {} bytes, limit is {}; set an output selector",
                    action.signature(),
                    size,
                    self.config.max_output_bytes
                ),
            ));
        }

        Ok(retained)
    }
}
