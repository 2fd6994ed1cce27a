//! Process-local repositories for database-less runs and tests. Each method
//! holds its lock for the whole read-modify-write, matching the single-statement
//! semantics of the sqlx implementations.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{
        DefinitionCreate, InstanceCreate, InstanceFilter, InstanceKey, InstanceStatus,
        JobOutcome, ProgressUpdate, ScanJob, ScanJobCreate, ScanStatus, ScoreBackfill, Target,
        TargetCreate, VulnerabilityDefinition, VulnerabilityInstance,
    },
};

use super::{ScanJobRepository, TargetRepository, VulnerabilityRepository};

fn page<T>(items: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    items
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

// ============================================================================
// Targets
// ============================================================================

#[derive(Default)]
pub struct InMemoryTargetRepository {
    targets: RwLock<HashMap<Uuid, Target>>,
}

impl InMemoryTargetRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TargetRepository for InMemoryTargetRepository {
    async fn create(&self, target: &TargetCreate) -> Result<Target, ApiError> {
        let target = Target {
            id: Uuid::new_v4(),
            name: target.name.clone(),
            address: target.address.clone(),
            description: target.description.clone(),
            created_at: Utc::now(),
        };
        self.targets.write().await.insert(target.id, target.clone());
        Ok(target)
    }

    async fn get_by_id(&self, id: &Uuid) -> Result<Option<Target>, ApiError> {
        Ok(self.targets.read().await.get(id).cloned())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Target>, ApiError> {
        let mut targets: Vec<Target> = self.targets.read().await.values().cloned().collect();
        targets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(targets, limit, offset))
    }
}

// ============================================================================
// Scan jobs
// ============================================================================

#[derive(Default)]
pub struct InMemoryScanJobRepository {
    jobs: RwLock<HashMap<Uuid, ScanJob>>,
}

impl InMemoryScanJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScanJobRepository for InMemoryScanJobRepository {
    async fn create(&self, job: &ScanJobCreate) -> Result<ScanJob, ApiError> {
        let job = ScanJob::new(job);
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_by_id(&self, id: &Uuid) -> Result<Option<ScanJob>, ApiError> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ScanJob>, ApiError> {
        let mut jobs: Vec<ScanJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(jobs, limit, offset))
    }

    async fn list_by_status(&self, statuses: &[ScanStatus]) -> Result<Vec<ScanJob>, ApiError> {
        let mut jobs: Vec<ScanJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| statuses.contains(&job.status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn mark_queued(&self, id: &Uuid, position: i32) -> Result<bool, ApiError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) if job.status == ScanStatus::Pending => {
                job.status = ScanStatus::Queued;
                job.queue_position = position;
                job.current_step = Some("Waiting in queue".to_string());
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_running(&self, id: &Uuid) -> Result<bool, ApiError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) if matches!(job.status, ScanStatus::Pending | ScanStatus::Queued) => {
                let now = Utc::now();
                job.status = ScanStatus::Running;
                job.queue_position = 0;
                job.current_step = Some("Starting scan".to_string());
                job.started_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_progress(&self, id: &Uuid, update: &ProgressUpdate) -> Result<bool, ApiError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) if job.status == ScanStatus::Running => {
                job.progress = job.progress.max(update.progress.clamp(0, 100));
                if let Some(step) = &update.current_step {
                    job.current_step = Some(step.clone());
                }
                if update.eta_seconds.is_some() {
                    job.eta_seconds = update.eta_seconds;
                }
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_queue_positions(&self, positions: &[(Uuid, i32)]) -> Result<(), ApiError> {
        let mut jobs = self.jobs.write().await;
        let now = Utc::now();
        for (id, rank) in positions {
            if let Some(job) = jobs.get_mut(id) {
                if job.status == ScanStatus::Queued {
                    job.queue_position = *rank;
                    job.updated_at = now;
                }
            }
        }
        Ok(())
    }

    async fn finish(&self, id: &Uuid, outcome: &JobOutcome) -> Result<bool, ApiError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) if !job.status.is_terminal() => {
                let now = Utc::now();
                job.status = outcome.status;
                if outcome.status == ScanStatus::Completed {
                    job.progress = 100;
                }
                job.current_step = Some(outcome.current_step().to_string());
                job.eta_seconds = None;
                job.queue_position = 0;
                if outcome.raw_output.is_some() {
                    job.raw_output = outcome.raw_output.clone();
                }
                job.errors.extend(outcome.error.iter().cloned());
                job.completed_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_finding_summary(
        &self,
        id: &Uuid,
        finding_count: i32,
        severity_breakdown: &BTreeMap<String, i64>,
    ) -> Result<(), ApiError> {
        if let Some(job) = self.jobs.write().await.get_mut(id) {
            job.finding_count = finding_count;
            job.severity_breakdown = severity_breakdown.clone();
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn append_errors(&self, id: &Uuid, errors: &[String]) -> Result<(), ApiError> {
        if let Some(job) = self.jobs.write().await.get_mut(id) {
            job.errors.extend_from_slice(errors);
            job.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, ApiError> {
        Ok(self.jobs.write().await.remove(id).is_some())
    }
}

// ============================================================================
// Vulnerabilities
// ============================================================================

#[derive(Default)]
struct VulnerabilityTables {
    definitions: HashMap<Uuid, VulnerabilityDefinition>,
    instances: HashMap<Uuid, VulnerabilityInstance>,
    instance_keys: HashMap<InstanceKey, Uuid>,
}

impl VulnerabilityTables {
    fn by_cve(&self, cve_id: &str) -> Option<&VulnerabilityDefinition> {
        self.definitions
            .values()
            .find(|d| d.cve_id.as_deref() == Some(cve_id))
    }

    fn by_name(&self, name: &str) -> Option<&VulnerabilityDefinition> {
        self.definitions.values().find(|d| d.name == name)
    }
}

#[derive(Default)]
pub struct InMemoryVulnerabilityRepository {
    tables: RwLock<VulnerabilityTables>,
}

impl InMemoryVulnerabilityRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VulnerabilityRepository for InMemoryVulnerabilityRepository {
    async fn find_definition_by_cve(
        &self,
        cve_id: &str,
    ) -> Result<Option<VulnerabilityDefinition>, ApiError> {
        Ok(self.tables.read().await.by_cve(cve_id).cloned())
    }

    async fn find_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<VulnerabilityDefinition>, ApiError> {
        Ok(self.tables.read().await.by_name(name).cloned())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<VulnerabilityDefinition>, ApiError> {
        Ok(self.tables.read().await.definitions.get(id).cloned())
    }

    async fn create_definition(
        &self,
        definition: &DefinitionCreate,
    ) -> Result<VulnerabilityDefinition, ApiError> {
        let mut tables = self.tables.write().await;

        let existing = definition
            .cve_id
            .as_deref()
            .and_then(|cve| tables.by_cve(cve))
            .or_else(|| tables.by_name(&definition.name))
            .cloned();
        if let Some(existing) = existing {
            return Ok(existing);
        }

        let now = Utc::now();
        let created = VulnerabilityDefinition {
            id: Uuid::new_v4(),
            name: definition.name.clone(),
            description: definition.description.clone(),
            severity: definition.severity,
            cvss_score: definition.cvss_score,
            cvss_vector: definition.cvss_vector.clone(),
            cve_id: definition.cve_id.clone(),
            remediation: definition.remediation.clone(),
            category: definition.category.clone(),
            created_at: now,
            updated_at: now,
        };
        tables.definitions.insert(created.id, created.clone());
        Ok(created)
    }

    async fn backfill_scores(
        &self,
        id: &Uuid,
        backfill: &ScoreBackfill,
    ) -> Result<VulnerabilityDefinition, ApiError> {
        let mut tables = self.tables.write().await;
        let definition = tables
            .definitions
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound(format!("Vulnerability definition {} not found", id)))?;

        if definition.cvss_score.is_none() {
            definition.cvss_score = backfill.cvss_score;
        }
        if definition.cvss_vector.is_none() {
            definition.cvss_vector = backfill.cvss_vector.clone();
        }
        definition.updated_at = Utc::now();
        Ok(definition.clone())
    }

    async fn list_definitions(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<VulnerabilityDefinition>, ApiError> {
        let mut definitions: Vec<VulnerabilityDefinition> =
            self.tables.read().await.definitions.values().cloned().collect();
        definitions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(page(definitions, limit, offset))
    }

    async fn find_instance(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<VulnerabilityInstance>, ApiError> {
        let tables = self.tables.read().await;
        Ok(tables
            .instance_keys
            .get(key)
            .and_then(|id| tables.instances.get(id))
            .cloned())
    }

    async fn create_instance(
        &self,
        instance: &InstanceCreate,
    ) -> Result<(VulnerabilityInstance, bool), ApiError> {
        let mut tables = self.tables.write().await;

        if let Some(existing) = tables
            .instance_keys
            .get(&instance.key)
            .and_then(|id| tables.instances.get(id))
        {
            return Ok((existing.clone(), false));
        }

        let now = Utc::now();
        let key = instance.key.clone();
        let created = VulnerabilityInstance {
            id: Uuid::new_v4(),
            vulnerability_id: key.vulnerability_id,
            scan_id: key.scan_id,
            target_id: key.target_id,
            port: key.port,
            protocol: key.protocol.clone(),
            service: instance.service.clone(),
            evidence: instance.evidence.clone(),
            status: InstanceStatus::Open,
            detected_at: now,
            updated_at: now,
        };
        tables.instance_keys.insert(key, created.id);
        tables.instances.insert(created.id, created.clone());
        Ok((created, true))
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<VulnerabilityInstance>, ApiError> {
        let mut instances: Vec<VulnerabilityInstance> = self
            .tables
            .read()
            .await
            .instances
            .values()
            .filter(|i| filter.scan_id.map_or(true, |id| i.scan_id == id))
            .filter(|i| filter.target_id.map_or(true, |id| i.target_id == id))
            .filter(|i| filter.vulnerability_id.map_or(true, |id| i.vulnerability_id == id))
            .filter(|i| filter.status.map_or(true, |s| i.status == s))
            .cloned()
            .collect();
        instances.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        Ok(page(instances, limit, offset))
    }

    async fn update_instance_status(
        &self,
        id: &Uuid,
        status: InstanceStatus,
    ) -> Result<Option<VulnerabilityInstance>, ApiError> {
        let mut tables = self.tables.write().await;
        Ok(tables.instances.get_mut(id).map(|instance| {
            instance.status = status;
            instance.updated_at = Utc::now();
            instance.clone()
        }))
    }

    async fn severity_breakdown_for_scan(
        &self,
        scan_id: &Uuid,
    ) -> Result<BTreeMap<String, i64>, ApiError> {
        let tables = self.tables.read().await;
        let mut breakdown = BTreeMap::new();
        for instance in tables.instances.values().filter(|i| i.scan_id == *scan_id) {
            if let Some(definition) = tables.definitions.get(&instance.vulnerability_id) {
                *breakdown
                    .entry(definition.severity.to_string())
                    .or_insert(0) += 1;
            }
        }
        Ok(breakdown)
    }

    async fn delete_instances_for_scan(&self, scan_id: &Uuid) -> Result<u64, ApiError> {
        let mut tables = self.tables.write().await;
        let doomed: Vec<Uuid> = tables
            .instances
            .values()
            .filter(|i| i.scan_id == *scan_id)
            .map(|i| i.id)
            .collect();
        for id in &doomed {
            if let Some(instance) = tables.instances.remove(id) {
                tables.instance_keys.remove(&instance.key());
            }
        }
        Ok(doomed.len() as u64)
    }
}
