use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{
        DefinitionCreate, InstanceCreate, InstanceFilter, InstanceKey, InstanceStatus,
        ScoreBackfill, VulnerabilityDefinition, VulnerabilityInstance,
    },
};

// ============================================================================
// Vulnerability Repository
// ============================================================================

#[async_trait]
pub trait VulnerabilityRepository: Send + Sync {
    async fn find_definition_by_cve(
        &self,
        cve_id: &str,
    ) -> Result<Option<VulnerabilityDefinition>, ApiError>;
    async fn find_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<VulnerabilityDefinition>, ApiError>;
    async fn get_definition(&self, id: &Uuid) -> Result<Option<VulnerabilityDefinition>, ApiError>;
    /// Inserts the definition, or returns the one that already holds its CVE or name.
    async fn create_definition(
        &self,
        definition: &DefinitionCreate,
    ) -> Result<VulnerabilityDefinition, ApiError>;
    /// Writes only the fields that are still null.
    async fn backfill_scores(
        &self,
        id: &Uuid,
        backfill: &ScoreBackfill,
    ) -> Result<VulnerabilityDefinition, ApiError>;
    async fn list_definitions(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<VulnerabilityDefinition>, ApiError>;

    async fn find_instance(&self, key: &InstanceKey)
        -> Result<Option<VulnerabilityInstance>, ApiError>;
    /// Returns the instance and whether this call created it.
    async fn create_instance(
        &self,
        instance: &InstanceCreate,
    ) -> Result<(VulnerabilityInstance, bool), ApiError>;
    async fn list_instances(
        &self,
        filter: &InstanceFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<VulnerabilityInstance>, ApiError>;
    async fn update_instance_status(
        &self,
        id: &Uuid,
        status: InstanceStatus,
    ) -> Result<Option<VulnerabilityInstance>, ApiError>;
    /// Instance count per definition severity for one scan.
    async fn severity_breakdown_for_scan(
        &self,
        scan_id: &Uuid,
    ) -> Result<BTreeMap<String, i64>, ApiError>;
    async fn delete_instances_for_scan(&self, scan_id: &Uuid) -> Result<u64, ApiError>;
}

pub struct SqlxVulnerabilityRepository {
    pool: PgPool,
}

impl SqlxVulnerabilityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VulnerabilityRepository for SqlxVulnerabilityRepository {
    async fn find_definition_by_cve(
        &self,
        cve_id: &str,
    ) -> Result<Option<VulnerabilityDefinition>, ApiError> {
        let row = sqlx::query_as::<_, VulnerabilityDefinition>(
            "SELECT * FROM vulnerability_definitions WHERE cve_id = $1",
        )
        .bind(cve_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn find_definition_by_name(
        &self,
        name: &str,
    ) -> Result<Option<VulnerabilityDefinition>, ApiError> {
        let row = sqlx::query_as::<_, VulnerabilityDefinition>(
            "SELECT * FROM vulnerability_definitions WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<VulnerabilityDefinition>, ApiError> {
        let row = sqlx::query_as::<_, VulnerabilityDefinition>(
            "SELECT * FROM vulnerability_definitions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn create_definition(
        &self,
        definition: &DefinitionCreate,
    ) -> Result<VulnerabilityDefinition, ApiError> {
        let now = Utc::now();

        let inserted = sqlx::query_as::<_, VulnerabilityDefinition>(
            r#"
            INSERT INTO vulnerability_definitions
                (id, name, description, severity, cvss_score, cvss_vector, cve_id,
                 remediation, category, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(definition.severity.as_str())
        .bind(definition.cvss_score)
        .bind(&definition.cvss_vector)
        .bind(&definition.cve_id)
        .bind(&definition.remediation)
        .bind(&definition.category)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(row);
        }

        // Lost a race against a concurrent insert of the same CVE or name
        let existing = match &definition.cve_id {
            Some(cve_id) => self.find_definition_by_cve(cve_id).await?,
            None => None,
        };
        let existing = match existing {
            Some(def) => Some(def),
            None => self.find_definition_by_name(&definition.name).await?,
        };

        existing.ok_or_else(|| {
            ApiError::internal(format!(
                "vulnerability definition '{}' conflicted but could not be read back",
                definition.name
            ))
        })
    }

    async fn backfill_scores(
        &self,
        id: &Uuid,
        backfill: &ScoreBackfill,
    ) -> Result<VulnerabilityDefinition, ApiError> {
        let row = sqlx::query_as::<_, VulnerabilityDefinition>(
            r#"
            UPDATE vulnerability_definitions
            SET cvss_score = COALESCE(cvss_score, $2),
                cvss_vector = COALESCE(cvss_vector, $3),
                updated_at = $4
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(backfill.cvss_score)
        .bind(&backfill.cvss_vector)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| ApiError::NotFound(format!("Vulnerability definition {} not found", id)))
    }

    async fn list_definitions(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<VulnerabilityDefinition>, ApiError> {
        let rows = sqlx::query_as::<_, VulnerabilityDefinition>(
            "SELECT * FROM vulnerability_definitions ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn find_instance(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<VulnerabilityInstance>, ApiError> {
        let row = sqlx::query_as::<_, VulnerabilityInstance>(
            r#"
            SELECT * FROM vulnerability_instances
            WHERE vulnerability_id = $1 AND scan_id = $2 AND target_id = $3
              AND port IS NOT DISTINCT FROM $4
              AND protocol IS NOT DISTINCT FROM $5
            "#,
        )
        .bind(key.vulnerability_id)
        .bind(key.scan_id)
        .bind(key.target_id)
        .bind(key.port)
        .bind(&key.protocol)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn create_instance(
        &self,
        instance: &InstanceCreate,
    ) -> Result<(VulnerabilityInstance, bool), ApiError> {
        let now = Utc::now();
        let key = &instance.key;

        let inserted = sqlx::query_as::<_, VulnerabilityInstance>(
            r#"
            INSERT INTO vulnerability_instances
                (id, vulnerability_id, scan_id, target_id, port, protocol, service,
                 evidence, status, detected_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'open', $9, $9)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.vulnerability_id)
        .bind(key.scan_id)
        .bind(key.target_id)
        .bind(key.port)
        .bind(&key.protocol)
        .bind(&instance.service)
        .bind(&instance.evidence)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row, true));
        }

        let existing = self.find_instance(key).await?.ok_or_else(|| {
            ApiError::internal("vulnerability instance conflicted but could not be read back")
        })?;
        Ok((existing, false))
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<VulnerabilityInstance>, ApiError> {
        let rows = sqlx::query_as::<_, VulnerabilityInstance>(
            r#"
            SELECT * FROM vulnerability_instances
            WHERE ($1::uuid IS NULL OR scan_id = $1)
              AND ($2::uuid IS NULL OR target_id = $2)
              AND ($3::uuid IS NULL OR vulnerability_id = $3)
              AND ($4::text IS NULL OR status = $4)
            ORDER BY detected_at DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(filter.scan_id)
        .bind(filter.target_id)
        .bind(filter.vulnerability_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn update_instance_status(
        &self,
        id: &Uuid,
        status: InstanceStatus,
    ) -> Result<Option<VulnerabilityInstance>, ApiError> {
        let row = sqlx::query_as::<_, VulnerabilityInstance>(
            "UPDATE vulnerability_instances SET status = $2, updated_at = $3 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn severity_breakdown_for_scan(
        &self,
        scan_id: &Uuid,
    ) -> Result<BTreeMap<String, i64>, ApiError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT d.severity, COUNT(*)
            FROM vulnerability_instances i
            JOIN vulnerability_definitions d ON d.id = i.vulnerability_id
            WHERE i.scan_id = $1
            GROUP BY d.severity
            "#,
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn delete_instances_for_scan(&self, scan_id: &Uuid) -> Result<u64, ApiError> {
        let result = sqlx::query("DELETE FROM vulnerability_instances WHERE scan_id = $1")
            .bind(scan_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
