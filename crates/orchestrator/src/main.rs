//! Load-test orchestrator - ephemeral Fargate cluster driver
//!
//! Provisions the load-test stack in dependency order, serves health and
//! status while it runs, and tears everything down when the lifetime guard
//! expires.

use anyhow::{Context, Result};
use orchestrator_lib::{
    capacity, stack, ActionInvoker, ApplyReport, DeploymentConfig, DeploymentStatus,
    DryRunActionClient, DryRunEngine, ExecutionPlan, IdempotencyLedger, LifetimeGuard,
    Orchestrator, ProvisionError, StructuredLogger,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting loadtest-orchestrator");

    let config = config::load()?;
    info!(
        stack = %config.stack_name,
        ttl_minutes = config.ttl_minutes,
        key_strategy = ?config.idempotency_key_strategy,
        "Orchestrator configured"
    );

    let logger = StructuredLogger::new(&config.stack_name);
    let plan = Arc::new(
        stack::build_graph(&config)?
            .validate()
            .context("Stack graph failed validation")?,
    );

    let ledger = match &config.ledger_path {
        Some(path) => IdempotencyLedger::with_persistence(path)
            .with_context(|| format!("Failed to open ledger at {}", path.display()))?,
        None => IdempotencyLedger::new(),
    };
    let invoker = Arc::new(ActionInvoker::new(
        Arc::new(DryRunActionClient::new()),
        Arc::new(ledger),
        config.invoker_config(),
    ));

    let guard = Arc::new(LifetimeGuard::new(config.ttl(), logger.clone()));
    let orchestrator = Arc::new(
        Orchestrator::new(
            Arc::new(DryRunEngine::new()),
            invoker,
            config.orchestrator_config(),
        )
        .with_guard(guard.clone())
        .with_logger(logger.clone()),
    );

    // Start health, metrics and status server
    let status = DeploymentStatus::new(&config.stack_name, guard.clone());
    let app_state = Arc::new(api::AppState::new(status.clone()));
    tokio::spawn(api::serve(config.api_port, app_state));

    let provisioned = provision(&orchestrator, &guard, &plan, &status).await?;

    let result = run_until_torn_down(&config, &orchestrator, &guard, &plan).await;
    match result {
        Ok(report) if provisioned => {
            status.record_report(&report).await;
            logger.log_shutdown("deployment torn down");
            Ok(())
        }
        Ok(report) => {
            status.record_report(&report).await;
            logger.log_shutdown("provisioning failed, completed nodes removed");
            anyhow::bail!("provisioning failed")
        }
        Err(e) => {
            error!(error = %e, "Deployment not fully torn down");
            logger.log_shutdown("teardown incomplete");
            Err(e.into())
        }
    }
}

/// Provision the stack. Returns false when the run failed; the guard is then
/// expired and limited to the nodes that were applied, so the teardown that
/// follows removes exactly those.
async fn provision(
    orchestrator: &Orchestrator,
    guard: &LifetimeGuard,
    plan: &ExecutionPlan,
    status: &DeploymentStatus,
) -> Result<bool> {
    let report = match orchestrator.provision(plan).await {
        Ok(report) => report,
        Err(ProvisionError::PartialApplication { report }) => *report,
        Err(e) => return Err(e).context("Provisioning failed before any node was applied"),
    };

    status.record_report(&report).await;
    let degraded = capacity::migration_degraded(plan, &report);
    status.set_capacity_degraded(degraded.clone()).await;

    if let Some(dns) = stack::load_balancer_dns(&report) {
        info!(load_balancer_dns = %dns, "Stack output");
    }

    // A failed capacity migration leaves a working service on primary capacity
    let only_capacity_failed = report
        .failed()
        .iter()
        .chain(report.skipped().iter())
        .all(|id| degraded.contains(id));
    if only_capacity_failed {
        return Ok(true);
    }

    warn!(summary = %report.summary(), "Removing nodes applied before the failure");
    guard.limit_teardown_to(report.applied()).await;
    guard.expire().await;
    Ok(false)
}

/// Let the guard run to expiry. An interrupt expires it early; a second
/// interrupt stops the teardown retries. Teardown calls already in flight
/// always run to completion.
async fn run_until_torn_down(
    config: &DeploymentConfig,
    orchestrator: &Arc<Orchestrator>,
    guard: &Arc<LifetimeGuard>,
    plan: &Arc<ExecutionPlan>,
) -> std::result::Result<ApplyReport, ProvisionError> {
    let (override_tx, override_rx) = watch::channel(false);

    let interrupts = {
        let guard = guard.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("Interrupted, tearing down ahead of expiry; interrupt again to stop retrying");
            guard.expire().await;

            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted again, teardown retries will stop after the current attempt");
                let _ = override_tx.send(true);
            }
        })
    };

    let result = guard
        .enforce(orchestrator, plan, config.retry_policy(), override_rx)
        .await;
    interrupts.abort();
    result
}
