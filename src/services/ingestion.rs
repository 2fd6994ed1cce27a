use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{
        DefinitionCreate, Finding, InstanceCreate, InstanceKey, NmapReport, PortBlock, RawResult,
        RemoteReport, ScanStatus, ScriptOutput, Severity, VulnerabilityDefinition,
    },
    repositories::{ScanJobRepository, VulnerabilityRepository},
};

static CVE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)cve-?(\d{4})-(\d{4,7})").unwrap());
static VULNERABLE_STATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)State:\s*(?:LIKELY\s+)?VULNERABLE").unwrap());

/// Canonical `CVE-YYYY-NNNN` form of the first CVE mentioned in `text`.
pub fn extract_cve(text: &str) -> Option<String> {
    CVE_PATTERN
        .captures(text)
        .map(|caps| format!("CVE-{}-{}", &caps[1], &caps[2]))
}

fn script_is_vulnerable(output: &str) -> bool {
    output.trim_start().starts_with("VULNERABLE") || VULNERABLE_STATE.is_match(output)
}

// ============================================================================
// Normalization: adapter output to findings
// ============================================================================

/// Flattens an adapter result into findings, in report order.
pub fn findings_from_raw(raw: &RawResult) -> Vec<Finding> {
    let mut findings = match raw {
        RawResult::LineStream(report) => nmap_findings(report),
        RawResult::PollTask(report) => remote_findings(report),
        RawResult::Plugin(report) => report.findings.clone(),
    };

    for finding in &mut findings {
        finding.cve_id = finding.cve_id.as_deref().and_then(extract_cve);
    }
    findings
}

fn nmap_findings(report: &NmapReport) -> Vec<Finding> {
    let mut findings = Vec::new();

    for host in &report.hosts {
        let host_name = host.address.clone().unwrap_or_else(|| host.host.clone());

        for port in host.ports.iter().filter(|p| p.is_open()) {
            findings.push(open_port_finding(&host_name, port));
            for script in &port.scripts {
                findings.push(script_finding(&host_name, Some(port), script));
            }
        }

        for script in &host.scripts {
            findings.push(script_finding(&host_name, None, script));
        }
    }

    findings
}

fn service_label(port: &PortBlock) -> &str {
    if port.service.is_empty() {
        "unknown"
    } else {
        &port.service
    }
}

fn open_port_finding(host: &str, port: &PortBlock) -> Finding {
    let service = service_label(port);
    let details: Vec<&str> = [Some(service), port.product.as_deref(), port.version.as_deref()]
        .into_iter()
        .flatten()
        .collect();

    Finding {
        severity: Some(Severity::Info),
        host: Some(host.to_string()),
        port: Some(port.port),
        protocol: Some(port.protocol.clone()),
        service: Some(service.to_string()),
        evidence: Some(format!(
            "Port {} is open. Service: {}",
            port.port,
            details.join(" ")
        )),
        remediation: Some("Ensure this port is intended to be open.".to_string()),
        category: Some("open_port".to_string()),
        ..Finding::new(format!(
            "Open Port {}/{} ({})",
            port.port, port.protocol, service
        ))
    }
}

fn script_finding(host: &str, port: Option<&PortBlock>, script: &ScriptOutput) -> Finding {
    let severity = if script_is_vulnerable(&script.output) {
        Severity::Medium
    } else {
        Severity::Info
    };

    Finding {
        severity: Some(severity),
        cve_id: extract_cve(&script.id).or_else(|| extract_cve(&script.output)),
        host: Some(host.to_string()),
        port: port.map(|p| p.port),
        protocol: port.map(|p| p.protocol.clone()),
        service: port.map(|p| service_label(p).to_string()),
        evidence: Some(script.output.clone()),
        remediation: Some("Check the script output for details.".to_string()),
        category: Some("nse_script".to_string()),
        ..Finding::new(format!("Nmap Script: {}", script.id))
    }
}

fn remote_findings(report: &RemoteReport) -> Vec<Finding> {
    report
        .results
        .iter()
        .map(|result| Finding {
            cve_id: result.cve_ids.first().cloned(),
            cvss_score: Some(result.threat_score),
            cvss_vector: result.cvss_vector.clone(),
            host: result.host.clone(),
            port: result.port,
            protocol: result.protocol.clone(),
            evidence: result.description.clone(),
            remediation: result.solution.clone(),
            category: result.family.clone(),
            ..Finding::new(result.name.clone())
        })
        .collect()
}

// ============================================================================
// Ingestion pipeline
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestionSummary {
    pub processed: usize,
    pub definitions_created: usize,
    pub instances_created: usize,
    pub errors: Vec<String>,
}

/// Turns one scan's findings into deduplicated definitions and per-scan
/// instances, then recomputes the scan's finding count and severity histogram
/// from what is persisted.
pub struct IngestionPipeline {
    scan_repo: Arc<dyn ScanJobRepository>,
    vuln_repo: Arc<dyn VulnerabilityRepository>,
}

impl IngestionPipeline {
    pub fn new(
        scan_repo: Arc<dyn ScanJobRepository>,
        vuln_repo: Arc<dyn VulnerabilityRepository>,
    ) -> Self {
        Self {
            scan_repo,
            vuln_repo,
        }
    }

    pub async fn ingest(
        &self,
        scan_id: Uuid,
        target_id: Uuid,
        raw: &RawResult,
    ) -> Result<IngestionSummary, ApiError> {
        let findings = findings_from_raw(raw);
        let mut summary = IngestionSummary::default();

        for finding in &findings {
            summary.processed += 1;
            if let Err(e) = self
                .ingest_finding(scan_id, target_id, finding, &mut summary)
                .await
            {
                tracing::warn!(
                    scan_id = %scan_id,
                    finding = %finding.name,
                    error = %e,
                    "skipping finding that failed to ingest"
                );
                summary
                    .errors
                    .push(format!("ingest '{}': {}", finding.name, e));
            }
        }

        let breakdown = self.vuln_repo.severity_breakdown_for_scan(&scan_id).await?;
        let finding_count = breakdown.values().sum::<i64>() as i32;
        self.scan_repo
            .set_finding_summary(&scan_id, finding_count, &breakdown)
            .await?;

        if !summary.errors.is_empty() {
            self.scan_repo.append_errors(&scan_id, &summary.errors).await?;
        }

        tracing::info!(
            scan_id = %scan_id,
            processed = summary.processed,
            definitions_created = summary.definitions_created,
            instances_created = summary.instances_created,
            errors = summary.errors.len(),
            "ingestion finished"
        );

        Ok(summary)
    }

    /// Runs ingestion again from the raw output stored on a completed scan.
    pub async fn reingest(&self, scan_id: Uuid) -> Result<IngestionSummary, ApiError> {
        let job = self
            .scan_repo
            .get_by_id(&scan_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Scan {} not found", scan_id)))?;

        if job.status != ScanStatus::Completed {
            return Err(ApiError::conflict(format!(
                "Scan {} is {}, only completed scans can be re-ingested",
                scan_id, job.status
            )));
        }

        let raw_output = job
            .raw_output
            .ok_or_else(|| ApiError::validation(format!("Scan {} has no raw output", scan_id)))?;
        let raw: RawResult = serde_json::from_value(raw_output).map_err(|e| {
            ApiError::validation(format!("Scan {} raw output is not a scan result: {}", scan_id, e))
        })?;

        self.ingest(scan_id, job.target_id, &raw).await
    }

    async fn ingest_finding(
        &self,
        scan_id: Uuid,
        target_id: Uuid,
        finding: &Finding,
        summary: &mut IngestionSummary,
    ) -> Result<(), ApiError> {
        if finding.name.trim().is_empty() {
            return Err(ApiError::validation("finding has no name"));
        }

        let definition = self.resolve_definition(finding, summary).await?;

        let key = InstanceKey {
            vulnerability_id: definition.id,
            scan_id,
            target_id,
            port: finding.port.map(i32::from),
            protocol: finding.protocol.clone(),
        };
        if self.vuln_repo.find_instance(&key).await?.is_some() {
            return Ok(());
        }

        let (_, created) = self
            .vuln_repo
            .create_instance(&InstanceCreate {
                key,
                service: finding.service.clone(),
                evidence: finding.evidence.clone(),
            })
            .await?;
        if created {
            summary.instances_created += 1;
        }
        Ok(())
    }

    /// CVE match first, then name; created lazily. Existing definitions only
    /// gain CVSS fields they did not have.
    async fn resolve_definition(
        &self,
        finding: &Finding,
        summary: &mut IngestionSummary,
    ) -> Result<VulnerabilityDefinition, ApiError> {
        let existing = match finding.cve_id.as_deref() {
            Some(cve) => self.vuln_repo.find_definition_by_cve(cve).await?,
            None => None,
        };
        let existing = match existing {
            Some(definition) => Some(definition),
            None => self.vuln_repo.find_definition_by_name(&finding.name).await?,
        };

        let definition = match existing {
            Some(definition) => definition,
            None => {
                summary.definitions_created += 1;
                self.vuln_repo
                    .create_definition(&DefinitionCreate::from_finding(finding))
                    .await?
            }
        };

        match definition.missing_scores(finding) {
            Some(backfill) => self.vuln_repo.backfill_scores(&definition.id, &backfill).await,
            None => Ok(definition),
        }
    }
}
