use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{Target, TargetCreate},
};

#[async_trait]
pub trait TargetRepository: Send + Sync {
    async fn create(&self, target: &TargetCreate) -> Result<Target, ApiError>;
    async fn get_by_id(&self, id: &Uuid) -> Result<Option<Target>, ApiError>;
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Target>, ApiError>;
}

pub struct SqlxTargetRepository {
    pool: PgPool,
}

impl SqlxTargetRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TargetRepository for SqlxTargetRepository {
    async fn create(&self, target: &TargetCreate) -> Result<Target, ApiError> {
        let row = sqlx::query_as::<_, Target>(
            r#"
            INSERT INTO targets (id, name, address, description, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&target.name)
        .bind(&target.address)
        .bind(&target.description)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn get_by_id(&self, id: &Uuid) -> Result<Option<Target>, ApiError> {
        let row = sqlx::query_as::<_, Target>("SELECT * FROM targets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Target>, ApiError> {
        let rows = sqlx::query_as::<_, Target>(
            "SELECT * FROM targets ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
