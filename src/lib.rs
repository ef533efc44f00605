//! Patchline -- release pipeline orchestrator for patched app builds.
//!
//! A run fetches each configured work item, transforms it with an external
//! tool, publishes the survivors as one release and files a report for every
//! failure. Every run and release is appended to a bounded history that
//! feeds the summary, the dashboard and the read-only API.

pub mod api;
pub mod config;
pub mod dashboard;
pub mod executors;
pub mod history;
pub mod pipeline;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::PipelineConfig;
use crate::pipeline::Orchestrator;

/// Build an orchestrator wired to the collaborators and history store
/// named in `config`.
pub fn orchestrator(config: &PipelineConfig) -> Result<Orchestrator> {
    let collaborators = executors::build(config)?;
    let history = config.open_history()?;
    Ok(Orchestrator::new(config.settings.to_settings(), collaborators, history))
}

/// Start the daemon: scheduled runs plus the read-only API.
pub async fn serve(config: PipelineConfig, bind: &str) -> Result<()> {
    let scheduler = scheduler::Scheduler::from_config(&config.schedule)?;
    let orchestrator = Arc::new(orchestrator(&config)?);

    let engine = scheduler.clone();
    let engine_orchestrator = orchestrator.clone();
    let items = config.enabled_items();
    tokio::spawn(async move {
        scheduler::run_scheduler_loop(engine, engine_orchestrator, items).await;
    });

    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", bind))?;
    let app = api::router(api::state::AppState::new(orchestrator.history(), scheduler));

    tracing::info!(%addr, "Patchline listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
