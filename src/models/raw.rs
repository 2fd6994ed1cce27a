use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Finding;

/// Adapter output handed to ingestion and stored on the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawResult {
    LineStream(NmapReport),
    PollTask(RemoteReport),
    Plugin(PluginReport),
}

// ============================================================================
// Streaming engine output
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NmapReport {
    pub hosts: Vec<HostBlock>,
    pub os_detection: Option<OsDetection>,
    pub cpe_list: Vec<String>,
    pub summary: Option<String>,
    pub raw_output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostBlock {
    pub host: String,
    pub address: Option<String>,
    pub ports: Vec<PortBlock>,
    pub scripts: Vec<ScriptOutput>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortBlock {
    pub port: u16,
    pub protocol: String,
    pub state: String,
    pub service: String,
    pub product: Option<String>,
    pub version: Option<String>,
    pub extra_info: Option<String>,
    pub scripts: Vec<ScriptOutput>,
}

impl PortBlock {
    pub fn is_open(&self) -> bool {
        self.state == "open"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptOutput {
    pub id: String,
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsDetection {
    pub name: String,
    pub vendor: Option<String>,
    pub family: Option<String>,
    pub accuracy: Option<u8>,
    pub cpe: Option<String>,
}

// ============================================================================
// Remote task engine output
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteReport {
    pub task_id: String,
    pub report_id: String,
    pub config_id: String,
    pub results: Vec<RemoteResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteResult {
    pub id: Option<String>,
    pub name: String,
    pub nvt_oid: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub protocol: Option<String>,
    pub threat_score: f64,
    pub cvss_vector: Option<String>,
    pub cve_ids: Vec<String>,
    pub family: Option<String>,
    pub description: Option<String>,
    pub solution: Option<String>,
}

// ============================================================================
// Plugin output
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginReport {
    pub plugin: String,
    pub target: String,
    pub results: Value,
    pub findings: Vec<Finding>,
}
