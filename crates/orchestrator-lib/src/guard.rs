//! Lifetime guard
//!
//! Puts a hard time-to-live on the whole deployment.
//!
//! State machine: `Installing -> Active -> Expiring -> TornDown`. The guard
//! becomes `Active` when its node is applied and `Expiring` once
//! `now - installed_at >= ttl`. Expiry tears down every node in reverse
//! order; the guard stays `Expiring` and keeps retrying until every node is
//! removed or an operator sets the override flag.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify, RwLock};
use tracing::{debug, warn};

use crate::action::RetryPolicy;
use crate::error::{ConfigError, ProvisionError, Result};
use crate::graph::ExecutionPlan;
use crate::models::NodeId;
use crate::observability::{OrchestratorMetrics, StructuredLogger};
use crate::orchestrator::{ApplyReport, Orchestrator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifetimeGuardSpec {
    pub ttl: Duration,
}

impl LifetimeGuardSpec {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.ttl.is_zero() {
            return Err(ConfigError::new("ttl", "must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    Installing,
    Active,
    Expiring,
    TornDown,
}

impl fmt::Display for GuardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardState::Installing => write!(f, "installing"),
            GuardState::Active => write!(f, "active"),
            GuardState::Expiring => write!(f, "expiring"),
            GuardState::TornDown => write!(f, "torn_down"),
        }
    }
}

#[derive(Debug)]
struct GuardInner {
    state: GuardState,
    installed_at: Option<DateTime<Utc>>,
    /// Nodes still to remove; `None` until the first teardown attempt
    remaining: Option<HashSet<NodeId>>,
    /// Nodes whose removal failed or was not attempted on the last attempt
    failing: Vec<NodeId>,
}

pub struct LifetimeGuard {
    ttl: Duration,
    inner: RwLock<GuardInner>,
    /// Wakes an enforcer waiting for the TTL when the guard expires early
    early_expiry: Notify,
    metrics: OrchestratorMetrics,
    logger: StructuredLogger,
}

impl LifetimeGuard {
    pub fn new(ttl: Duration, logger: StructuredLogger) -> Self {
        let metrics = OrchestratorMetrics::new();
        metrics.set_guard_state(GuardState::Installing);
        Self {
            ttl,
            inner: RwLock::new(GuardInner {
                state: GuardState::Installing,
                installed_at: None,
                remaining: None,
                failing: Vec::new(),
            }),
            early_expiry: Notify::new(),
            metrics,
            logger,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn state(&self) -> GuardState {
        self.inner.read().await.state
    }

    pub async fn installed_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().await.installed_at
    }

    /// `None` before installation, or when the expiry lies beyond the
    /// representable time range
    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        let installed_at = self.inner.read().await.installed_at?;
        installed_at.checked_add_signed(self.ttl_chrono())
    }

    /// Nodes that could not be removed on the last teardown attempt
    pub async fn failing(&self) -> Vec<NodeId> {
        self.inner.read().await.failing.clone()
    }

    /// Record installation; only the first call while installing takes effect
    pub async fn mark_installed(&self, at: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        if inner.state != GuardState::Installing {
            return;
        }
        inner.installed_at = Some(at);
        self.transition(&mut inner, GuardState::Active);
    }

    /// Re-evaluate expiry at `now` and return the resulting state
    pub async fn poll(&self, now: DateTime<Utc>) -> GuardState {
        let mut inner = self.inner.write().await;
        if inner.state == GuardState::Active {
            if let Some(installed_at) = inner.installed_at {
                if now - installed_at >= self.ttl_chrono() {
                    self.transition(&mut inner, GuardState::Expiring);
                }
            }
        }
        inner.state
    }

    /// Expire ahead of the TTL, e.g. when the driver is interrupted
    pub async fn expire(&self) -> GuardState {
        let mut inner = self.inner.write().await;
        if matches!(inner.state, GuardState::Installing | GuardState::Active) {
            self.transition(&mut inner, GuardState::Expiring);
            self.early_expiry.notify_one();
        }
        inner.state
    }

    /// Restrict teardown to `nodes`, e.g. the applied part of a failed
    /// provisioning run. Has no effect once torn down.
    pub async fn limit_teardown_to(&self, nodes: impl IntoIterator<Item = NodeId>) {
        let mut inner = self.inner.write().await;
        if inner.state != GuardState::TornDown {
            inner.remaining = Some(nodes.into_iter().collect());
        }
    }

    /// One teardown attempt over the nodes not yet removed.
    ///
    /// Calling this before expiry expires the guard early. On failure the
    /// guard stays `Expiring` and the failing set is returned.
    pub async fn teardown(
        &self,
        orchestrator: &Orchestrator,
        plan: &ExecutionPlan,
    ) -> Result<ApplyReport> {
        let remaining = {
            let mut inner = self.inner.write().await;
            match inner.state {
                GuardState::TornDown => {
                    return Err(ProvisionError::invalid(
                        "lifetime-guard",
                        "deployment is already torn down",
                    ))
                }
                GuardState::Installing | GuardState::Active => {
                    self.transition(&mut inner, GuardState::Expiring)
                }
                GuardState::Expiring => {}
            }
            inner
                .remaining
                .get_or_insert_with(|| plan.nodes().iter().map(|n| n.id.clone()).collect())
                .clone()
        };

        self.metrics.inc_teardown_attempts();
        match orchestrator.teardown_subset(plan, &remaining).await {
            Ok(report) => {
                let mut inner = self.inner.write().await;
                inner.remaining = Some(HashSet::new());
                inner.failing.clear();
                self.transition(&mut inner, GuardState::TornDown);
                Ok(report)
            }
            Err(ProvisionError::PartialApplication { report }) => {
                let mut failing = report.failed();
                failing.extend(report.skipped());
                let mut inner = self.inner.write().await;
                inner.remaining = Some(failing.iter().cloned().collect());
                inner.failing = failing.clone();
                Err(ProvisionError::GuardTeardownIncomplete { failed: failing })
            }
            Err(e) => Err(e),
        }
    }

    /// Wait for expiry, then tear down, retrying with backoff until every
    /// node is removed or `manual_override` is set to `true`.
    ///
    /// An [`expire`](Self::expire) call ends the wait early. Once teardown
    /// has started it is never interrupted mid-call; only the override stops
    /// the retries, and only between attempts.
    pub async fn enforce(
        &self,
        orchestrator: &Orchestrator,
        plan: &ExecutionPlan,
        retry: RetryPolicy,
        mut manual_override: watch::Receiver<bool>,
    ) -> Result<ApplyReport> {
        match self.state().await {
            GuardState::Installing => {
                return Err(ProvisionError::invalid(
                    "lifetime-guard",
                    "guard was never installed",
                ))
            }
            GuardState::Active => self.wait_for_expiry().await,
            GuardState::TornDown => {
                return Err(ProvisionError::invalid(
                    "lifetime-guard",
                    "deployment is already torn down",
                ))
            }
            GuardState::Expiring => {}
        }

        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let failed = match self.teardown(orchestrator, plan).await {
                Ok(report) => return Ok(report),
                Err(ProvisionError::GuardTeardownIncomplete { failed }) => failed,
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "Teardown cannot proceed");
                    return Err(e);
                }
            };
            self.logger.log_teardown_incomplete(&failed, attempt);

            if *manual_override.borrow() {
                return Err(ProvisionError::GuardTeardownIncomplete { failed });
            }

            let backoff = retry.backoff_for(attempt);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                changed = manual_override.changed() => {
                    if changed.is_ok() && *manual_override.borrow() {
                        warn!(failed = ?failed, "Teardown retries stopped by manual override");
                        return Err(ProvisionError::GuardTeardownIncomplete { failed });
                    }
                }
            }
        }
    }

    async fn wait_for_expiry(&self) {
        while self.poll(Utc::now()).await == GuardState::Active {
            let wait = self
                .expires_at()
                .await
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));
            debug!(wait = ?wait, "Waiting for deployment expiry");

            let ttl_elapsed = async {
                match wait {
                    Some(wait) => tokio::time::sleep(wait).await,
                    // Expiry is out of range, so only an early expiry ends the wait
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = ttl_elapsed => {}
                _ = self.early_expiry.notified() => {
                    debug!("Deployment expired ahead of its TTL");
                }
            }
        }
    }

    fn ttl_chrono(&self) -> chrono::Duration {
        let millis = self.ttl.as_millis().min(i64::MAX as u128) as i64;
        chrono::Duration::milliseconds(millis)
    }

    fn transition(&self, inner: &mut GuardInner, to: GuardState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.metrics.set_guard_state(to);
        self.logger.log_guard_transition(from, to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(minutes: u64) -> LifetimeGuard {
        LifetimeGuard::new(
            Duration::from_secs(minutes * 60),
            StructuredLogger::new("test-stack"),
        )
    }

    #[test]
    fn test_spec_rejects_zero_ttl() {
        assert!(LifetimeGuardSpec::new(Duration::ZERO).validate().is_err());
        assert!(LifetimeGuardSpec::new(Duration::from_secs(1)).validate().is_ok());
    }

    #[tokio::test]
    async fn test_installing_until_marked() {
        let guard = guard(120);
        assert_eq!(guard.state().await, GuardState::Installing);
        assert!(guard.expires_at().await.is_none());
        // Never expires before installation
        assert_eq!(guard.poll(Utc::now()).await, GuardState::Installing);
    }

    #[tokio::test]
    async fn test_two_hour_ttl_expiry() {
        let guard = guard(120);
        let t0 = Utc::now();
        guard.mark_installed(t0).await;

        assert_eq!(
            guard.poll(t0 + chrono::Duration::minutes(119)).await,
            GuardState::Active
        );
        assert_eq!(
            guard.poll(t0 + chrono::Duration::minutes(121)).await,
            GuardState::Expiring
        );
        assert_eq!(
            guard.expires_at().await,
            Some(t0 + chrono::Duration::minutes(120))
        );
    }

    #[tokio::test]
    async fn test_expiry_is_inclusive() {
        let guard = guard(120);
        let t0 = Utc::now();
        guard.mark_installed(t0).await;
        assert_eq!(
            guard.poll(t0 + chrono::Duration::minutes(120)).await,
            GuardState::Expiring
        );
    }

    #[tokio::test]
    async fn test_mark_installed_only_once() {
        let guard = guard(120);
        let t0 = Utc::now();
        guard.mark_installed(t0).await;
        guard
            .mark_installed(t0 + chrono::Duration::minutes(30))
            .await;
        assert_eq!(guard.installed_at().await, Some(t0));
    }

    #[tokio::test]
    async fn test_early_expiry() {
        let guard = guard(120);
        guard.mark_installed(Utc::now()).await;
        assert_eq!(guard.expire().await, GuardState::Expiring);
        // Installation after expiry has no effect
        guard.mark_installed(Utc::now()).await;
        assert_eq!(guard.state().await, GuardState::Expiring);
    }

    #[tokio::test]
    async fn test_expiring_never_returns_to_active() {
        let guard = guard(1);
        let t0 = Utc::now();
        guard.mark_installed(t0).await;
        guard.poll(t0 + chrono::Duration::minutes(5)).await;
        assert_eq!(guard.poll(t0).await, GuardState::Expiring);
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_never_expires_by_time() {
        let guard = LifetimeGuard::new(
            Duration::from_secs(u64::MAX),
            StructuredLogger::new("test-stack"),
        );
        let t0 = Utc::now();
        guard.mark_installed(t0).await;

        assert!(guard.expires_at().await.is_none());
        assert_eq!(
            guard.poll(t0 + chrono::Duration::days(365 * 1000)).await,
            GuardState::Active
        );
        assert_eq!(guard.expire().await, GuardState::Expiring);
    }

    #[tokio::test]
    async fn test_limit_teardown_ignored_once_torn_down() {
        let guard = guard(120);
        guard
            .limit_teardown_to([NodeId::from("fargate-cluster")])
            .await;
        assert_eq!(
            guard.inner.read().await.remaining,
            Some(HashSet::from([NodeId::from("fargate-cluster")]))
        );

        guard.inner.write().await.state = GuardState::TornDown;
        guard.limit_teardown_to([NodeId::from("fargate-vpc")]).await;
        assert_eq!(
            guard.inner.read().await.remaining,
            Some(HashSet::from([NodeId::from("fargate-cluster")]))
        );
    }
}
