use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{Finding, Severity};

// ============================================================================
// Vulnerability Definition - canonical, deduplicated description
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct VulnerabilityDefinition {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    #[sqlx(try_from = "String")]
    pub severity: Severity,
    pub cvss_score: Option<f64>,
    pub cvss_vector: Option<String>,
    pub cve_id: Option<String>,
    pub remediation: Option<String>,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VulnerabilityDefinition {
    pub fn to_summary(&self) -> DefinitionSummary {
        DefinitionSummary {
            id: self.id,
            name: self.name.clone(),
            severity: self.severity,
            cvss_score: self.cvss_score,
            cve_id: self.cve_id.clone(),
        }
    }

    /// CVSS fields the finding supplies that this definition still lacks.
    pub fn missing_scores(&self, finding: &Finding) -> Option<ScoreBackfill> {
        let cvss_score = finding.cvss_score.filter(|_| self.cvss_score.is_none());
        let cvss_vector = finding
            .cvss_vector
            .clone()
            .filter(|_| self.cvss_vector.is_none());

        if cvss_score.is_none() && cvss_vector.is_none() {
            None
        } else {
            Some(ScoreBackfill {
                cvss_score,
                cvss_vector,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct DefinitionCreate {
    pub name: String,
    pub description: Option<String>,
    pub severity: Severity,
    pub cvss_score: Option<f64>,
    pub cvss_vector: Option<String>,
    pub cve_id: Option<String>,
    pub remediation: Option<String>,
    pub category: Option<String>,
}

impl DefinitionCreate {
    pub fn from_finding(finding: &Finding) -> Self {
        Self {
            name: finding.name.clone(),
            description: finding.evidence.clone(),
            severity: finding.effective_severity(),
            cvss_score: finding.cvss_score,
            cvss_vector: finding.cvss_vector.clone(),
            cve_id: finding.cve_id.clone(),
            remediation: finding.remediation.clone(),
            category: finding.category.clone(),
        }
    }
}

/// Fill-only update: fields set here are written only where the stored value is null.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreBackfill {
    pub cvss_score: Option<f64>,
    pub cvss_vector: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefinitionSummary {
    pub id: Uuid,
    pub name: String,
    pub severity: Severity,
    pub cvss_score: Option<f64>,
    pub cve_id: Option<String>,
}

// ============================================================================
// Vulnerability Instance - one occurrence on (target, scan, port, protocol)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Open,
    InProgress,
    Fixed,
    FalsePositive,
    RiskAccepted,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        Self::Open
    }
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Open => "open",
            InstanceStatus::InProgress => "in_progress",
            InstanceStatus::Fixed => "fixed",
            InstanceStatus::FalsePositive => "false_positive",
            InstanceStatus::RiskAccepted => "risk_accepted",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for InstanceStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "in_progress" => InstanceStatus::InProgress,
            "fixed" | "resolved" => InstanceStatus::Fixed,
            "false_positive" => InstanceStatus::FalsePositive,
            "risk_accepted" | "accepted" => InstanceStatus::RiskAccepted,
            _ => InstanceStatus::Open,
        }
    }
}

impl From<String> for InstanceStatus {
    fn from(s: String) -> Self {
        s.as_str().into()
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct VulnerabilityInstance {
    pub id: Uuid,
    pub vulnerability_id: Uuid,
    pub scan_id: Uuid,
    pub target_id: Uuid,
    pub port: Option<i32>,
    pub protocol: Option<String>,
    pub service: Option<String>,
    pub evidence: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: InstanceStatus,
    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VulnerabilityInstance {
    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            vulnerability_id: self.vulnerability_id,
            scan_id: self.scan_id,
            target_id: self.target_id,
            port: self.port,
            protocol: self.protocol.clone(),
        }
    }

    pub fn to_summary(&self) -> InstanceSummary {
        InstanceSummary {
            id: self.id,
            vulnerability_id: self.vulnerability_id,
            target_id: self.target_id,
            scan_id: self.scan_id,
            port: self.port,
            protocol: self.protocol.clone(),
            status: self.status,
        }
    }
}

/// Uniqueness key: no two instances share it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub vulnerability_id: Uuid,
    pub scan_id: Uuid,
    pub target_id: Uuid,
    pub port: Option<i32>,
    pub protocol: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InstanceCreate {
    pub key: InstanceKey,
    pub service: Option<String>,
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSummary {
    pub id: Uuid,
    pub vulnerability_id: Uuid,
    pub target_id: Uuid,
    pub scan_id: Uuid,
    pub port: Option<i32>,
    pub protocol: Option<String>,
    pub status: InstanceStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceFilter {
    pub scan_id: Option<Uuid>,
    pub target_id: Option<Uuid>,
    pub vulnerability_id: Option<Uuid>,
    pub status: Option<InstanceStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(cvss_score: Option<f64>, cvss_vector: Option<&str>) -> VulnerabilityDefinition {
        VulnerabilityDefinition {
            id: Uuid::new_v4(),
            name: "OpenSSH user enumeration".to_string(),
            description: None,
            severity: Severity::Medium,
            cvss_score,
            cvss_vector: cvss_vector.map(str::to_string),
            cve_id: Some("CVE-2018-15473".to_string()),
            remediation: None,
            category: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_backfill_only_fills_missing_fields() {
        let mut finding = Finding::new("OpenSSH user enumeration");
        finding.cvss_score = Some(5.3);
        finding.cvss_vector = Some("AV:N/AC:L/Au:N/C:P/I:N/A:N".to_string());

        let empty = definition(None, None);
        let backfill = empty.missing_scores(&finding).unwrap();
        assert_eq!(backfill.cvss_score, Some(5.3));
        assert!(backfill.cvss_vector.is_some());

        let partial = definition(Some(4.0), None);
        let backfill = partial.missing_scores(&finding).unwrap();
        assert_eq!(backfill.cvss_score, None);
        assert!(backfill.cvss_vector.is_some());

        let full = definition(Some(4.0), Some("AV:N"));
        assert!(full.missing_scores(&finding).is_none());
    }

    #[test]
    fn test_instance_status_parsing() {
        assert_eq!(InstanceStatus::from("false_positive"), InstanceStatus::FalsePositive);
        assert_eq!(InstanceStatus::from("risk_accepted"), InstanceStatus::RiskAccepted);
        assert_eq!(InstanceStatus::from("whatever"), InstanceStatus::Open);
        assert_eq!(InstanceStatus::Fixed.to_string(), "fixed");
    }
}
