pub mod gmp;
pub mod line_stream;
pub mod nmap_parser;
pub mod plugin;
pub mod poll_task;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Settings;
use crate::error::ScanError;
use crate::models::{QueueEntry, RawResult, ScannerKind, Target};

pub use gmp::{GmpClient, RemoteEngine, RemoteScanConfig, RemoteTaskStatus};
pub use line_stream::StreamAdapter;
pub use plugin::{BannerGrabPlugin, PluginAdapter, ScanPlugin};
pub use poll_task::PollAdapter;

/// Typed event an adapter reports while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Progress {
        percent: i32,
        step: Option<String>,
        eta_seconds: Option<i64>,
    },
    HostDiscovered {
        host: String,
    },
    PortDiscovered {
        port: u16,
        protocol: String,
        service: Option<String>,
    },
    TimingUpdate {
        elapsed_seconds: i64,
    },
    RawLog(String),
    /// One unparseable line or result element; the scan continues.
    ParseError(String),
}

/// Handle given to an adapter for one run: the job's cancellation token and
/// the channel back to the lifecycle manager.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub scan_id: Uuid,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<AdapterEvent>,
}

impl AdapterContext {
    pub fn new(
        scan_id: Uuid,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<AdapterEvent>,
    ) -> Self {
        Self {
            scan_id,
            cancel,
            events,
        }
    }

    pub fn emit(&self, event: AdapterEvent) {
        // The receiver is gone only once the manager stopped listening
        let _ = self.events.send(event);
    }

    pub fn progress(&self, percent: i32, step: impl Into<String>, eta_seconds: Option<i64>) {
        self.emit(AdapterEvent::Progress {
            percent: percent.clamp(0, 100),
            step: Some(step.into()),
            eta_seconds,
        });
    }

    pub fn log(&self, line: impl Into<String>) {
        self.emit(AdapterEvent::RawLog(line.into()));
    }

    pub fn parse_error(&self, message: impl Into<String>) {
        self.emit(AdapterEvent::ParseError(message.into()));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns `Err(Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), ScanError> {
        if self.is_cancelled() {
            Err(ScanError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One way of driving an external scan engine.
#[async_trait]
pub trait ScannerAdapter: Send + Sync {
    async fn run(
        &self,
        target: &Target,
        entry: &QueueEntry,
        ctx: &AdapterContext,
    ) -> Result<RawResult, ScanError>;
}

/// Adapter per scanner kind, chosen when a job starts.
#[derive(Clone)]
pub struct AdapterRegistry {
    line_stream: Arc<dyn ScannerAdapter>,
    poll_task: Arc<dyn ScannerAdapter>,
    plugin: Arc<dyn ScannerAdapter>,
}

impl AdapterRegistry {
    pub fn new(
        line_stream: Arc<dyn ScannerAdapter>,
        poll_task: Arc<dyn ScannerAdapter>,
        plugin: Arc<dyn ScannerAdapter>,
    ) -> Self {
        Self {
            line_stream,
            poll_task,
            plugin,
        }
    }

    /// Production adapters built from settings.
    pub fn from_settings(settings: Arc<Settings>) -> Self {
        let engine: Arc<dyn RemoteEngine> = Arc::new(GmpClient::from_settings(&settings));
        Self {
            line_stream: Arc::new(StreamAdapter::new(settings.clone())),
            poll_task: Arc::new(PollAdapter::new(engine, settings.clone())),
            plugin: Arc::new(PluginAdapter::with_builtins(&settings)),
        }
    }

    pub fn with_adapter(mut self, kind: ScannerKind, adapter: Arc<dyn ScannerAdapter>) -> Self {
        match kind {
            ScannerKind::LineStream => self.line_stream = adapter,
            ScannerKind::PollTask => self.poll_task = adapter,
            ScannerKind::Plugin => self.plugin = adapter,
        }
        self
    }

    pub fn get(&self, kind: ScannerKind) -> Arc<dyn ScannerAdapter> {
        match kind {
            ScannerKind::LineStream => self.line_stream.clone(),
            ScannerKind::PollTask => self.poll_task.clone(),
            ScannerKind::Plugin => self.plugin.clone(),
        }
    }
}

/// Parses `h:mm:ss`, `mm:ss` or plain seconds. None for negative or
/// out-of-range values.
pub(crate) fn parse_clock(value: &str) -> Option<i64> {
    let mut total = 0i64;
    for part in value.trim().split(':') {
        let n: i64 = part.parse().ok().filter(|n| *n >= 0)?;
        total = total.checked_mul(60)?.checked_add(n)?;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("0:01:30"), Some(90));
        assert_eq!(parse_clock("2:00:00"), Some(7200));
        assert_eq!(parse_clock("45"), Some(45));
        assert_eq!(parse_clock("1:xx"), None);
    }

    #[test]
    fn test_parse_clock_rejects_out_of_range() {
        assert_eq!(parse_clock("9223372036854775807:00"), None);
        assert_eq!(parse_clock("3000000000000000000:00:00"), None);
        assert_eq!(parse_clock("1:-5"), None);
        assert_eq!(parse_clock("153722867280912930:07"), Some(9223372036854775807));
    }

    #[tokio::test]
    async fn test_context_checkpoint_and_progress_clamp() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let ctx = AdapterContext::new(Uuid::new_v4(), token.clone(), tx);

        ctx.progress(140, "Service scan", None);
        assert_eq!(
            rx.recv().await,
            Some(AdapterEvent::Progress {
                percent: 100,
                step: Some("Service scan".to_string()),
                eta_seconds: None,
            })
        );

        assert!(ctx.checkpoint().is_ok());
        token.cancel();
        assert!(ctx.checkpoint().unwrap_err().is_cancelled());
    }
}
