use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A registered scan target: a hostname, an address or a CIDR block.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Target {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetCreate {
    pub name: String,
    pub address: String,
    pub description: Option<String>,
}
