//! Gather loop — builds configured gatherers and polls them on an interval.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use warpgrid_gather::{
    GatherContext, GatherError, GatherResult, Gatherer, GathererRegistry, Quantity,
};

use crate::config::GatherConfig;

/// One configured gatherer, ready to poll.
pub struct GatherTask {
    pub name: String,
    pub kind: String,
    pub interval: Duration,
    pub timeout: Duration,
    gatherer: Box<dyn Gatherer>,
}

impl std::fmt::Debug for GatherTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatherTask")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl GatherTask {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        interval: Duration,
        timeout: Duration,
        gatherer: Box<dyn Gatherer>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            interval,
            timeout,
            gatherer,
        }
    }

    /// Gather once, bounded by the task timeout and the shutdown signal.
    pub async fn gather_once(&self, shutdown: &watch::Receiver<bool>) -> GatherResult<Quantity> {
        let ctx = GatherContext::new(&self.name)
            .with_cancellation(shutdown.clone())
            .with_timeout(self.timeout);
        self.gatherer.gather(&ctx).await
    }

    /// Gather every `interval` until shutdown. Errors are logged; the loop
    /// keeps going.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            autoscaler = %self.name,
            gatherer = %self.kind,
            interval_ms = self.interval.as_millis() as u64,
            "gather loop started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.report(self.gather_once(&shutdown).await);
                }
                _ = shutdown.changed() => {
                    info!(autoscaler = %self.name, "gather loop shutting down");
                    break;
                }
            }
        }
    }

    fn report(&self, result: GatherResult<Quantity>) {
        match result {
            Ok(quantity) => {
                info!(autoscaler = %self.name, gatherer = %self.kind, q = quantity.q, "gathered");
            }
            Err(GatherError::Cancelled) => {
                debug!(autoscaler = %self.name, "gather interrupted by shutdown");
            }
            Err(e) => {
                warn!(autoscaler = %self.name, gatherer = %self.kind, error = %e, "gather failed");
            }
        }
    }
}

/// Flip `shutdown` to `true` once `signal` resolves.
///
/// If the signal listener fails, shutdown is never sent: the error is logged
/// and the sender is held so the gather loops keep running.
pub async fn forward_shutdown<F>(signal: F, shutdown: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("shutdown signal received");
            let _ = shutdown.send(true);
        }
        Err(e) => {
            warn!(error = %e, "failed to listen for shutdown signal; running until killed");
            std::future::pending::<()>().await;
        }
    }
}

/// Build a task for every configured gatherer. Fails on the first gatherer
/// that cannot be built.
pub fn build_tasks(config: &GatherConfig, registry: &GathererRegistry) -> anyhow::Result<Vec<GatherTask>> {
    config
        .gatherers
        .iter()
        .map(|g| -> anyhow::Result<GatherTask> {
            let ctx = GatherContext::new(&g.name);
            let gatherer = registry
                .create(&g.kind, &ctx, &g.options)
                .with_context(|| format!("building gatherer `{}` ({})", g.name, g.kind))?;
            Ok(GatherTask::new(
                &g.name,
                &g.kind,
                g.interval()?,
                g.timeout()?,
                gatherer,
            ))
        })
        .collect()
}
