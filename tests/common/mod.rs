#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{body::Body, http::Request, Router};
use recon_backend::{
    build_router,
    config::Settings,
    error::ScanError,
    models::{
        HostBlock, NmapReport, PluginReport, PortBlock, QueueEntry, RawResult, ScanJob,
        ScanJobCreate, ScannerKind, Target, TargetCreate,
    },
    services::{AdapterContext, AdapterRegistry, ScanManager, ScannerAdapter},
    AppState,
};
use tokio::sync::Notify;
use uuid::Uuid;

/// What the scripted adapter does for one target address.
#[derive(Clone)]
pub enum Script {
    Complete(RawResult),
    Fail(String),
    Panic,
}

/// Fake engine keyed by target address. Gated targets block (cancellably)
/// until `release` is called for them.
#[derive(Default)]
pub struct ScriptedAdapter {
    scripts: Mutex<HashMap<String, Script>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    started: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, address: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(address.to_string(), script);
    }

    pub fn gate(&self, address: &str) {
        self.gates
            .lock()
            .unwrap()
            .insert(address.to_string(), Arc::new(Notify::new()));
    }

    pub fn release(&self, address: &str) {
        if let Some(gate) = self.gates.lock().unwrap().get(address) {
            gate.notify_one();
        }
    }

    /// Addresses in the order their scans started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScannerAdapter for ScriptedAdapter {
    async fn run(
        &self,
        target: &Target,
        _entry: &QueueEntry,
        ctx: &AdapterContext,
    ) -> Result<RawResult, ScanError> {
        self.started.lock().unwrap().push(target.address.clone());
        ctx.progress(10, "Starting", None);
        ctx.log(format!("scanning {}", target.address));

        let gate = self.gates.lock().unwrap().get(&target.address).cloned();
        if let Some(gate) = gate {
            tokio::select! {
                _ = gate.notified() => {}
                _ = ctx.cancellation().cancelled() => return Err(ScanError::Cancelled),
            }
        }

        ctx.progress(90, "Finishing", Some(1));
        let script = self.scripts.lock().unwrap().get(&target.address).cloned();
        match script {
            Some(Script::Complete(raw)) => Ok(raw),
            Some(Script::Fail(message)) => Err(ScanError::engine(message)),
            Some(Script::Panic) => panic!("scripted panic for {}", target.address),
            None => Ok(RawResult::Plugin(PluginReport {
                plugin: "scripted".to_string(),
                target: target.address.clone(),
                ..Default::default()
            })),
        }
    }
}

pub struct TestApp {
    pub state: AppState,
    pub adapter: Arc<ScriptedAdapter>,
}

impl TestApp {
    pub fn manager(&self) -> &Arc<ScanManager> {
        &self.state.scan_manager
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn create_target(&self, address: &str) -> Target {
        self.state
            .target_repository
            .create(&TargetCreate {
                name: format!("target {}", address),
                address: address.to_string(),
                description: None,
            })
            .await
            .unwrap()
    }

    pub async fn submit(&self, target: &Target) -> Uuid {
        self.manager()
            .submit(ScanJobCreate {
                target_id: target.id,
                scanner: ScannerKind::LineStream,
                args: None,
                engine_config_id: None,
            })
            .await
            .unwrap()
    }

    pub async fn job(&self, scan_id: &Uuid) -> ScanJob {
        self.manager().get_job(scan_id).await.unwrap()
    }

    /// Polls until `done` holds for the job, failing after two seconds.
    pub async fn wait_for<F>(&self, scan_id: &Uuid, done: F) -> ScanJob
    where
        F: Fn(&ScanJob) -> bool,
    {
        for _ in 0..200 {
            let job = self.job(scan_id).await;
            if done(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let job = self.job(scan_id).await;
        panic!(
            "scan {} stuck in {} (progress {}, position {})",
            scan_id, job.status, job.progress, job.queue_position
        );
    }
}

pub fn test_settings(max_concurrent_scans: u32) -> Settings {
    let mut settings = Settings::new_with_env_file(false).expect("Failed to create test config");
    settings.database_url = None;
    settings.max_concurrent_scans = max_concurrent_scans;
    settings.cors_allow_origins = vec!["*".to_string()];
    settings
}

/// In-memory application whose every scanner kind is the scripted adapter.
pub fn create_test_app(max_concurrent_scans: u32) -> TestApp {
    let adapter = ScriptedAdapter::new();
    let engine: Arc<dyn ScannerAdapter> = adapter.clone();
    let adapters = AdapterRegistry::new(engine.clone(), engine.clone(), engine);
    let state = AppState::with_adapters(Arc::new(test_settings(max_concurrent_scans)), adapters);
    TestApp { state, adapter }
}

/// Streaming-engine report with one open port.
pub fn single_port_report(address: &str, port: u16, service: &str) -> RawResult {
    RawResult::LineStream(NmapReport {
        hosts: vec![HostBlock {
            host: address.to_string(),
            address: Some(address.to_string()),
            ports: vec![PortBlock {
                port,
                protocol: "tcp".to_string(),
                state: "open".to_string(),
                service: service.to_string(),
                ..Default::default()
            }],
            scripts: Vec::new(),
        }],
        ..Default::default()
    })
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub async fn extract_body(response: axum::response::Response) -> Vec<u8> {
    use axum::body::to_bytes;
    let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    body.to_vec()
}

pub async fn extract_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_slice(&extract_body(response).await).unwrap()
}
