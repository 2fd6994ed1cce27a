use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::Settings,
    error::{ApiError, ScanError},
    models::{
        ActiveJobView, JobOutcome, ProgressUpdate, QueueEntry, QueueState, QueuedJobView,
        RawResult, ScanJob, ScanJobCreate, ScanProgress, ScanStatus, ScannerKind, Target,
    },
    repositories::{ScanJobRepository, TargetRepository, VulnerabilityRepository},
    services::{
        admission_queue::{Admission, AdmissionQueue},
        broadcaster::{ProgressBroadcaster, ScanEvent},
        ingestion::{IngestionPipeline, IngestionSummary},
        scanners::{AdapterContext, AdapterEvent, AdapterRegistry},
    },
};

/// Bookkeeping for a job holding a concurrency slot.
struct ActiveJob {
    cancel: CancellationToken,
    target_id: Uuid,
    scanner: ScannerKind,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct EventTally {
    hosts: usize,
    ports: usize,
    parse_errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub interrupted: usize,
    pub resubmitted: usize,
}

/// Owns the scan state machine: admission, one worker task per running job,
/// cooperative cancellation, ingestion on success and queue draining after
/// every terminal transition.
pub struct ScanManager {
    scan_repo: Arc<dyn ScanJobRepository>,
    target_repo: Arc<dyn TargetRepository>,
    vuln_repo: Arc<dyn VulnerabilityRepository>,
    ingestion: IngestionPipeline,
    adapters: AdapterRegistry,
    queue: AdmissionQueue,
    broadcaster: Arc<ProgressBroadcaster>,
    active: Mutex<HashMap<Uuid, ActiveJob>>,
    shutting_down: AtomicBool,
}

impl ScanManager {
    pub fn new(
        settings: &Settings,
        scan_repo: Arc<dyn ScanJobRepository>,
        target_repo: Arc<dyn TargetRepository>,
        vuln_repo: Arc<dyn VulnerabilityRepository>,
        adapters: AdapterRegistry,
        broadcaster: Arc<ProgressBroadcaster>,
    ) -> Self {
        Self {
            ingestion: IngestionPipeline::new(scan_repo.clone(), vuln_repo.clone()),
            scan_repo,
            target_repo,
            vuln_repo,
            adapters,
            queue: AdmissionQueue::new(settings.max_concurrent_scans as usize),
            broadcaster,
            active: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    fn active_jobs(&self) -> MutexGuard<'_, HashMap<Uuid, ActiveJob>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    pub fn max_concurrent(&self) -> usize {
        self.queue.max_concurrent()
    }

    // ------------------------------------------------------------------------
    // Submission and admission
    // ------------------------------------------------------------------------

    /// Persists the job and either starts it or queues it. A job whose target
    /// does not exist is failed immediately and never queued.
    pub async fn submit(self: &Arc<Self>, create: ScanJobCreate) -> Result<Uuid, ApiError> {
        let job = self.scan_repo.create(&create).await?;

        if self.target_repo.get_by_id(&create.target_id).await?.is_none() {
            let error = format!("target {} not found", create.target_id);
            tracing::warn!(scan_id = %job.id, "{}", error);
            self.scan_repo
                .finish(&job.id, &JobOutcome::failed(error))
                .await?;
            self.publish_terminal(job.id).await;
            return Ok(job.id);
        }

        self.admit(job.queue_entry()).await?;
        Ok(job.id)
    }

    async fn admit(self: &Arc<Self>, entry: QueueEntry) -> Result<(), ApiError> {
        let scan_id = entry.scan_id;
        match self.queue.admit_or_enqueue(entry.clone()) {
            Admission::Admitted => {
                tracing::info!(scan_id = %scan_id, scanner = %entry.scanner, "scan admitted");
                if !self.start(entry).await {
                    self.release_slot().await;
                }
            }
            Admission::Queued(position) => {
                self.scan_repo.mark_queued(&scan_id, position as i32).await?;
                tracing::info!(scan_id = %scan_id, position, "scan queued");
                self.publish_snapshot(scan_id).await;
            }
        }
        Ok(())
    }

    /// Moves a job that already holds a slot to `running` and spawns its
    /// worker. False if the job could not start; the slot is then still held.
    async fn start(self: &Arc<Self>, entry: QueueEntry) -> bool {
        let scan_id = entry.scan_id;
        let cancel = CancellationToken::new();
        self.active_jobs().insert(
            scan_id,
            ActiveJob {
                cancel: cancel.clone(),
                target_id: entry.target_id,
                scanner: entry.scanner,
                started_at: Utc::now(),
            },
        );

        match self.scan_repo.mark_running(&scan_id).await {
            Ok(true) => {
                self.spawn_worker(entry, cancel);
                true
            }
            Ok(false) => {
                self.active_jobs().remove(&scan_id);
                tracing::warn!(scan_id = %scan_id, "scan no longer startable, skipping");
                false
            }
            Err(e) => {
                self.active_jobs().remove(&scan_id);
                tracing::error!(scan_id = %scan_id, error = %e, "failed to start scan");
                self.finish_job(scan_id, JobOutcome::failed(e.to_string()))
                    .await;
                self.publish_terminal(scan_id).await;
                false
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, entry: QueueEntry, cancel: CancellationToken) {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run_job(entry, cancel).await });
    }

    /// Hands the freed slot to the head of the queue, skipping entries whose
    /// job can no longer start.
    async fn release_slot(self: &Arc<Self>) {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                self.queue.release();
                return;
            }

            let Some(next) = self.queue.release_and_next() else {
                return;
            };
            tracing::info!(scan_id = %next.scan_id, "dequeued scan");
            self.sync_queue_positions().await;
            if self.start(next).await {
                return;
            }
        }
    }

    async fn sync_queue_positions(&self) {
        let positions = self.queue.positions();
        if positions.is_empty() {
            return;
        }
        if let Err(e) = self.scan_repo.update_queue_positions(&positions).await {
            tracing::error!(error = %e, "failed to update queue positions");
            return;
        }
        for (scan_id, _) in &positions {
            self.publish_snapshot(*scan_id).await;
        }
    }

    // ------------------------------------------------------------------------
    // Worker
    // ------------------------------------------------------------------------

    async fn run_job(self: Arc<Self>, entry: QueueEntry, cancel: CancellationToken) {
        let scan_id = entry.scan_id;

        match self.target_repo.get_by_id(&entry.target_id).await {
            Ok(Some(target)) => self.execute(entry, target, cancel).await,
            Ok(None) => {
                let error = format!("target {} not found", entry.target_id);
                tracing::warn!(scan_id = %scan_id, "{}", error);
                self.finish_job(scan_id, JobOutcome::failed(error)).await;
            }
            Err(e) => {
                tracing::error!(scan_id = %scan_id, error = %e, "failed to load scan target");
                self.finish_job(scan_id, JobOutcome::failed(e.to_string()))
                    .await;
            }
        }

        self.active_jobs().remove(&scan_id);
        self.publish_terminal(scan_id).await;
        self.release_slot().await;
    }

    async fn execute(&self, entry: QueueEntry, target: Target, cancel: CancellationToken) {
        let scan_id = entry.scan_id;
        tracing::info!(
            scan_id = %scan_id,
            scanner = %entry.scanner,
            target = %target.address,
            "scan started"
        );
        self.publish_snapshot(scan_id).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = AdapterContext::new(scan_id, cancel.clone(), tx);
        let adapter = self.adapters.get(entry.scanner);

        // Own task, so a panicking adapter only fails its job
        let worker = tokio::spawn({
            let entry = entry.clone();
            let target = target.clone();
            async move { adapter.run(&target, &entry, &ctx).await }
        });

        let mut tally = EventTally::default();
        while let Some(event) = rx.recv().await {
            self.handle_event(scan_id, event, &mut tally).await;
        }

        let result = match worker.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ScanError::engine(format!(
                "scanner panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(_) => Err(ScanError::Cancelled),
        };

        if !tally.parse_errors.is_empty() {
            if let Err(e) = self.scan_repo.append_errors(&scan_id, &tally.parse_errors).await {
                tracing::error!(scan_id = %scan_id, error = %e, "failed to record parse errors");
            }
        }

        match result {
            Ok(raw) => self.complete_job(scan_id, target.id, raw).await,
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                tracing::info!(scan_id = %scan_id, "scan cancelled");
                self.finish_job(scan_id, JobOutcome::cancelled()).await;
            }
            Err(e) => {
                tracing::warn!(scan_id = %scan_id, error = %e, "scan failed");
                self.finish_job(scan_id, JobOutcome::failed(e.to_string()))
                    .await;
            }
        }
    }

    async fn complete_job(&self, scan_id: Uuid, target_id: Uuid, raw: RawResult) {
        let raw_output = match serde_json::to_value(&raw) {
            Ok(value) => value,
            Err(e) => {
                self.finish_job(
                    scan_id,
                    JobOutcome::failed(format!("could not encode scan result: {}", e)),
                )
                .await;
                return;
            }
        };

        if !self
            .finish_job(scan_id, JobOutcome::completed(raw_output))
            .await
        {
            return;
        }
        tracing::info!(scan_id = %scan_id, "scan completed");

        if let Err(e) = self.ingestion.ingest(scan_id, target_id, &raw).await {
            tracing::error!(scan_id = %scan_id, error = %e, "ingestion failed");
            let error = format!("ingestion failed: {}", e);
            if let Err(e) = self.scan_repo.append_errors(&scan_id, &[error]).await {
                tracing::error!(scan_id = %scan_id, error = %e, "failed to record ingestion error");
            }
        }
    }

    /// Applies the terminal write; false if the job was already terminal or gone.
    async fn finish_job(&self, scan_id: Uuid, outcome: JobOutcome) -> bool {
        match self.scan_repo.finish(&scan_id, &outcome).await {
            Ok(applied) => applied,
            Err(e) => {
                tracing::error!(
                    scan_id = %scan_id,
                    status = %outcome.status,
                    error = %e,
                    "failed to persist terminal status"
                );
                false
            }
        }
    }

    async fn handle_event(&self, scan_id: Uuid, event: AdapterEvent, tally: &mut EventTally) {
        match event {
            AdapterEvent::Progress {
                percent,
                step,
                eta_seconds,
            } => {
                let update = ProgressUpdate {
                    progress: percent,
                    current_step: step,
                    eta_seconds,
                };
                match self.scan_repo.update_progress(&scan_id, &update).await {
                    Ok(true) => self.publish_snapshot(scan_id).await,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(scan_id = %scan_id, error = %e, "failed to store progress")
                    }
                }
            }
            AdapterEvent::HostDiscovered { host } => {
                tally.hosts += 1;
                tracing::debug!(scan_id = %scan_id, host = %host, "host discovered");
                self.broadcaster.publish(
                    &scan_id,
                    ScanEvent::HostDiscovered {
                        scan_id,
                        host,
                        total_hosts: tally.hosts,
                        timestamp: Utc::now(),
                    },
                );
            }
            AdapterEvent::PortDiscovered {
                port,
                protocol,
                service,
            } => {
                tally.ports += 1;
                tracing::debug!(scan_id = %scan_id, port, protocol = %protocol, "port discovered");
                self.broadcaster.publish(
                    &scan_id,
                    ScanEvent::PortDiscovered {
                        scan_id,
                        port,
                        protocol,
                        service,
                        total_ports: tally.ports,
                        timestamp: Utc::now(),
                    },
                );
            }
            AdapterEvent::TimingUpdate { elapsed_seconds } => {
                tracing::trace!(scan_id = %scan_id, elapsed_seconds, "timing update");
            }
            AdapterEvent::RawLog(message) => {
                self.broadcaster.publish(
                    &scan_id,
                    ScanEvent::Log {
                        scan_id,
                        message,
                        timestamp: Utc::now(),
                    },
                );
            }
            AdapterEvent::ParseError(message) => {
                tracing::debug!(scan_id = %scan_id, error = %message, "unparsed scanner output");
                tally.parse_errors.push(message);
            }
        }
    }

    async fn publish_snapshot(&self, scan_id: Uuid) {
        match self.scan_repo.get_by_id(&scan_id).await {
            Ok(Some(job)) => {
                self.broadcaster
                    .publish(&scan_id, ScanEvent::Progress(job.progress_view()));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(scan_id = %scan_id, error = %e, "failed to load scan for broadcast"),
        }
    }

    /// Last event for a scan; observers are dropped afterwards.
    async fn publish_terminal(&self, scan_id: Uuid) {
        self.publish_snapshot(scan_id).await;
        self.broadcaster.close(&scan_id);
    }

    // ------------------------------------------------------------------------
    // Control and queries
    // ------------------------------------------------------------------------

    /// Requests cooperative cancellation. True iff the job currently holds a
    /// slot; repeated calls and calls on finished jobs are harmless.
    pub fn cancel(&self, scan_id: &Uuid) -> bool {
        match self.active_jobs().get(scan_id) {
            Some(job) => {
                job.cancel.cancel();
                tracing::info!(scan_id = %scan_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    pub async fn delete(&self, scan_id: &Uuid) -> Result<(), ApiError> {
        let job = self.get_job(scan_id).await?;

        match job.status {
            ScanStatus::Running => {
                return Err(ApiError::conflict(format!(
                    "Scan {} is running; cancel it first",
                    scan_id
                )))
            }
            ScanStatus::Queued => {
                if !self.queue.remove(scan_id) {
                    return Err(ApiError::conflict(format!("Scan {} is starting", scan_id)));
                }
                self.sync_queue_positions().await;
            }
            _ => {}
        }

        let removed = self.vuln_repo.delete_instances_for_scan(scan_id).await?;
        self.scan_repo.delete(scan_id).await?;
        self.broadcaster.close(scan_id);
        tracing::info!(scan_id = %scan_id, instances_removed = removed, "scan deleted");
        Ok(())
    }

    pub async fn get_job(&self, scan_id: &Uuid) -> Result<ScanJob, ApiError> {
        self.scan_repo
            .get_by_id(scan_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Scan {} not found", scan_id)))
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ScanJob>, ApiError> {
        self.scan_repo.list(limit, offset).await
    }

    pub async fn get_status(&self, scan_id: &Uuid) -> Result<ScanProgress, ApiError> {
        let job = self.get_job(scan_id).await?;
        let mut view = job.progress_view();
        if job.status == ScanStatus::Queued {
            let position = self.queue.position_of(scan_id);
            if position > 0 {
                view.queue_position = position as i32;
            }
        }
        Ok(view)
    }

    pub async fn get_queue_state(&self) -> Result<QueueState, ApiError> {
        let running: Vec<(Uuid, Uuid, ScannerKind, DateTime<Utc>)> = self
            .active_jobs()
            .iter()
            .map(|(id, job)| (*id, job.target_id, job.scanner, job.started_at))
            .collect();

        let mut active_jobs = Vec::with_capacity(running.len());
        for (scan_id, target_id, scanner, admitted_at) in running {
            let job = self.scan_repo.get_by_id(&scan_id).await?;
            active_jobs.push(ActiveJobView {
                scan_id,
                target_id,
                scanner,
                progress: job.as_ref().map_or(0, |j| j.progress),
                current_step: job.as_ref().and_then(|j| j.current_step.clone()),
                started_at: job.and_then(|j| j.started_at).or(Some(admitted_at)),
            });
        }
        active_jobs.sort_by_key(|job| job.started_at);

        let queued_jobs = self
            .queue
            .snapshot()
            .into_iter()
            .enumerate()
            .map(|(index, entry)| QueuedJobView {
                scan_id: entry.scan_id,
                target_id: entry.target_id,
                scanner: entry.scanner,
                queue_position: index + 1,
                queued_at: entry.queued_at,
            })
            .collect::<Vec<_>>();

        Ok(QueueState {
            max_concurrent: self.queue.max_concurrent(),
            active_count: self.queue.active_count(),
            queue_size: queued_jobs.len(),
            active_jobs,
            queued_jobs,
        })
    }

    pub async fn reingest(&self, scan_id: &Uuid) -> Result<IngestionSummary, ApiError> {
        self.ingestion.reingest(*scan_id).await
    }

    /// Jobs left `running` by a previous process are failed; jobs that never
    /// started go back through admission in creation order.
    pub async fn recover_interrupted(self: &Arc<Self>) -> Result<RecoveryReport, ApiError> {
        let mut report = RecoveryReport::default();

        for job in self.scan_repo.list_by_status(&[ScanStatus::Running]).await? {
            if self
                .scan_repo
                .finish(&job.id, &JobOutcome::failed("interrupted by service restart"))
                .await?
            {
                report.interrupted += 1;
            }
        }

        let waiting = self
            .scan_repo
            .list_by_status(&[ScanStatus::Pending, ScanStatus::Queued])
            .await?;
        for job in waiting {
            self.admit(job.queue_entry()).await?;
            report.resubmitted += 1;
        }
        self.sync_queue_positions().await;

        if report.interrupted > 0 || report.resubmitted > 0 {
            tracing::info!(
                interrupted = report.interrupted,
                resubmitted = report.resubmitted,
                "recovered scans from previous run"
            );
        }
        Ok(report)
    }

    /// Cancels every running job and waits, up to `timeout`, for the workers
    /// to record their terminal status. Queued jobs stay queued.
    pub async fn shutdown(&self, timeout: Duration) {
        tracing::info!("Shutting down scan manager...");
        self.shutting_down.store(true, Ordering::SeqCst);

        let cancelled = {
            let jobs = self.active_jobs();
            for job in jobs.values() {
                job.cancel.cancel();
            }
            jobs.len()
        };
        tracing::info!("Cancelled {} running scans", cancelled);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = self.active_jobs().len();
            if remaining == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("{} scans still running at shutdown", remaining);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tracing::info!("Scan manager shutdown complete");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
