use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{JobOutcome, ProgressUpdate, ScanJob, ScanJobCreate, ScanStatus},
};

/// Job table. Every method is one statement; status changes are conditional on
/// the current status so terminal jobs are never rewritten.
#[async_trait]
pub trait ScanJobRepository: Send + Sync {
    async fn create(&self, job: &ScanJobCreate) -> Result<ScanJob, ApiError>;
    async fn get_by_id(&self, id: &Uuid) -> Result<Option<ScanJob>, ApiError>;
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ScanJob>, ApiError>;
    /// Oldest first.
    async fn list_by_status(&self, statuses: &[ScanStatus]) -> Result<Vec<ScanJob>, ApiError>;
    /// `pending -> queued`
    async fn mark_queued(&self, id: &Uuid, position: i32) -> Result<bool, ApiError>;
    /// `pending | queued -> running`
    async fn mark_running(&self, id: &Uuid) -> Result<bool, ApiError>;
    /// Applies only while running; progress is raised, never lowered.
    async fn update_progress(&self, id: &Uuid, update: &ProgressUpdate) -> Result<bool, ApiError>;
    async fn update_queue_positions(&self, positions: &[(Uuid, i32)]) -> Result<(), ApiError>;
    /// Any non-terminal status to the outcome's terminal status.
    async fn finish(&self, id: &Uuid, outcome: &JobOutcome) -> Result<bool, ApiError>;
    async fn set_finding_summary(
        &self,
        id: &Uuid,
        finding_count: i32,
        severity_breakdown: &BTreeMap<String, i64>,
    ) -> Result<(), ApiError>;
    async fn append_errors(&self, id: &Uuid, errors: &[String]) -> Result<(), ApiError>;
    async fn delete(&self, id: &Uuid) -> Result<bool, ApiError>;
}

pub struct SqlxScanJobRepository {
    pool: PgPool,
}

impl SqlxScanJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn status_strings(statuses: &[ScanStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl ScanJobRepository for SqlxScanJobRepository {
    async fn create(&self, job: &ScanJobCreate) -> Result<ScanJob, ApiError> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let row = sqlx::query_as::<_, ScanJob>(
            r#"
            INSERT INTO scan_jobs
                (id, target_id, scanner, args, engine_config_id, status, progress,
                 queue_position, finding_count, severity_breakdown, errors, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, 0, 0, '{}', '[]', $6, $6)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(job.target_id)
        .bind(job.scanner.as_str())
        .bind(&job.args)
        .bind(&job.engine_config_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn get_by_id(&self, id: &Uuid) -> Result<Option<ScanJob>, ApiError> {
        let row = sqlx::query_as::<_, ScanJob>("SELECT * FROM scan_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ScanJob>, ApiError> {
        let rows = sqlx::query_as::<_, ScanJob>(
            "SELECT * FROM scan_jobs ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn list_by_status(&self, statuses: &[ScanStatus]) -> Result<Vec<ScanJob>, ApiError> {
        let rows = sqlx::query_as::<_, ScanJob>(
            "SELECT * FROM scan_jobs WHERE status = ANY($1) ORDER BY created_at ASC",
        )
        .bind(status_strings(statuses))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn mark_queued(&self, id: &Uuid, position: i32) -> Result<bool, ApiError> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = 'queued', queue_position = $2, current_step = 'Waiting in queue', updated_at = $3
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(position)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_running(&self, id: &Uuid) -> Result<bool, ApiError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = 'running', queue_position = 0, current_step = 'Starting scan',
                started_at = $2, updated_at = $2
            WHERE id = $1 AND status IN ('pending', 'queued')
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_progress(&self, id: &Uuid, update: &ProgressUpdate) -> Result<bool, ApiError> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET progress = GREATEST(progress, $2),
                current_step = COALESCE($3, current_step),
                eta_seconds = COALESCE($4, eta_seconds),
                updated_at = $5
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(update.progress.clamp(0, 100))
        .bind(&update.current_step)
        .bind(update.eta_seconds)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_queue_positions(&self, positions: &[(Uuid, i32)]) -> Result<(), ApiError> {
        if positions.is_empty() {
            return Ok(());
        }

        let ids: Vec<Uuid> = positions.iter().map(|(id, _)| *id).collect();
        let ranks: Vec<i32> = positions.iter().map(|(_, rank)| *rank).collect();

        sqlx::query(
            r#"
            UPDATE scan_jobs AS s
            SET queue_position = p.rank, updated_at = $3
            FROM UNNEST($1::uuid[], $2::int4[]) AS p(id, rank)
            WHERE s.id = p.id AND s.status = 'queued'
            "#,
        )
        .bind(&ids)
        .bind(&ranks)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finish(&self, id: &Uuid, outcome: &JobOutcome) -> Result<bool, ApiError> {
        let errors = json!(outcome.error.iter().collect::<Vec<_>>());

        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET status = $2,
                progress = CASE WHEN $2 = 'completed' THEN 100 ELSE progress END,
                current_step = $3,
                eta_seconds = NULL,
                queue_position = 0,
                raw_output = COALESCE($4, raw_output),
                errors = errors || $5::jsonb,
                completed_at = $6,
                updated_at = $6
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(id)
        .bind(outcome.status.as_str())
        .bind(outcome.current_step())
        .bind(&outcome.raw_output)
        .bind(errors)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_finding_summary(
        &self,
        id: &Uuid,
        finding_count: i32,
        severity_breakdown: &BTreeMap<String, i64>,
    ) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE scan_jobs SET finding_count = $2, severity_breakdown = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(finding_count)
        .bind(json!(severity_breakdown))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_errors(&self, id: &Uuid, errors: &[String]) -> Result<(), ApiError> {
        if errors.is_empty() {
            return Ok(());
        }

        sqlx::query(
            "UPDATE scan_jobs SET errors = errors || $2::jsonb, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(json!(errors))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &Uuid) -> Result<bool, ApiError> {
        let result = sqlx::query("DELETE FROM scan_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
