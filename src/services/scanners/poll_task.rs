use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::gmp::{fallback_scan_configs, RemoteEngine, RemotePhase};
use super::{AdapterContext, ScannerAdapter};
use crate::config::Settings;
use crate::error::ScanError;
use crate::models::{QueueEntry, RawResult, RemoteReport, Target};

const PREFERRED_CONFIG: &str = "Full and fast";

/// Drives a remote task engine: create target and task, start, poll, fetch.
pub struct PollAdapter {
    engine: Arc<dyn RemoteEngine>,
    default_config_id: String,
    poll_interval: Duration,
}

impl PollAdapter {
    pub fn new(engine: Arc<dyn RemoteEngine>, settings: Arc<Settings>) -> Self {
        Self {
            engine,
            default_config_id: settings.gvm_default_config_id.clone(),
            poll_interval: settings.gvm_poll_interval(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Caller's config, else the engine's "Full and fast", else the
    /// configured default. Discovery failure falls back to the static catalogue.
    async fn resolve_config(&self, requested: Option<&str>, ctx: &AdapterContext) -> String {
        if let Some(id) = requested.map(str::trim).filter(|id| !id.is_empty()) {
            return id.to_string();
        }

        let configs = match self.engine.list_scan_configs().await {
            Ok(configs) if !configs.is_empty() => configs,
            Ok(_) => fallback_scan_configs(),
            Err(e) => {
                tracing::warn!(
                    scan_id = %ctx.scan_id,
                    error = %e,
                    "Scan config discovery failed, using known configurations"
                );
                fallback_scan_configs()
            }
        };

        configs
            .into_iter()
            .find(|c| c.name.contains(PREFERRED_CONFIG))
            .map(|c| c.id)
            .unwrap_or_else(|| self.default_config_id.clone())
    }

    async fn stop_remote(&self, task_id: &str, ctx: &AdapterContext) {
        if let Err(e) = self.engine.stop_task(task_id).await {
            tracing::warn!(scan_id = %ctx.scan_id, task_id, error = %e, "Failed to stop remote task");
        }
    }
}

fn setup_failure(step: &str) -> impl Fn(ScanError) -> ScanError + '_ {
    move |e| match e {
        ScanError::Cancelled => ScanError::Cancelled,
        other => ScanError::setup(format!("{}: {}", step, other)),
    }
}

#[async_trait]
impl ScannerAdapter for PollAdapter {
    async fn run(
        &self,
        target: &Target,
        entry: &QueueEntry,
        ctx: &AdapterContext,
    ) -> Result<RawResult, ScanError> {
        ctx.checkpoint()?;
        ctx.progress(0, "Creating remote target", None);

        let target_name = format!("{} ({}) {}", target.name, target.address, ctx.scan_id);
        let target_id = self
            .engine
            .create_target(&target_name, &target.address)
            .await
            .map_err(setup_failure("failed to create remote target"))?;
        ctx.checkpoint()?;

        let config_id = self
            .resolve_config(entry.engine_config_id.as_deref(), ctx)
            .await;
        let task_id = self
            .engine
            .create_task(&format!("Scan {}", target_name), &config_id, &target_id)
            .await
            .map_err(setup_failure("failed to create remote task"))?;
        ctx.checkpoint()?;

        let report_id = self
            .engine
            .start_task(&task_id)
            .await
            .map_err(setup_failure("failed to start remote task"))?;

        tracing::info!(
            scan_id = %ctx.scan_id,
            task_id = %task_id,
            report_id = %report_id,
            config_id = %config_id,
            "Remote task started"
        );
        ctx.progress(1, "Remote task started", None);

        let mut last_progress = 1;
        loop {
            tokio::select! {
                biased;
                _ = ctx.cancellation().cancelled() => {
                    self.stop_remote(&task_id, ctx).await;
                    return Err(ScanError::Cancelled);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let status = match self.engine.task_status(&task_id).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(scan_id = %ctx.scan_id, error = %e, "Remote status poll failed, retrying");
                    continue;
                }
            };

            match status.phase() {
                RemotePhase::Done => break,
                RemotePhase::Stopped | RemotePhase::Interrupted => {
                    return Err(ScanError::engine(format!(
                        "remote task ended with status {}",
                        status.status
                    )));
                }
                RemotePhase::Active => {
                    let progress = status.progress.clamp(0, 99);
                    if progress > last_progress {
                        last_progress = progress;
                        ctx.progress(progress, format!("Remote task {}", status.status), None);
                    }
                }
            }
        }

        ctx.checkpoint()?;
        ctx.progress(99, "Fetching report", None);

        let fetched = self.engine.fetch_report(&report_id).await.map_err(|e| match e {
            ScanError::Cancelled => ScanError::Cancelled,
            other => ScanError::engine(format!("failed to fetch report {}: {}", report_id, other)),
        })?;
        for message in fetched.skipped {
            ctx.parse_error(message);
        }

        Ok(RawResult::PollTask(RemoteReport {
            task_id,
            report_id,
            config_id,
            results: fetched.results,
        }))
    }
}
