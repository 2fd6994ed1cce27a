use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use super::{nmap_parser, AdapterContext, ScannerAdapter};
use crate::config::Settings;
use crate::error::ScanError;
use crate::models::{QueueEntry, RawResult, Target};

const STDERR_TAIL_LINES: usize = 20;

/// Runs nmap as a child process and parses its stdout while it is produced.
pub struct StreamAdapter {
    settings: Arc<Settings>,
}

impl StreamAdapter {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    /// Caller arguments (or the configured defaults) plus the flags progress
    /// parsing depends on.
    pub fn build_args(&self, args: Option<&str>) -> Vec<String> {
        let base = args
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or(self.settings.nmap_default_args.as_str());

        let mut args: Vec<String> = base.split_whitespace().map(str::to_string).collect();
        let has = |args: &[String], flag: &str| args.iter().any(|a| a == flag);

        if !args.iter().any(|a| a.starts_with("-v") && !a.starts_with("--")) {
            args.push("-v".to_string());
        }
        if !has(&args, "-sV") {
            args.push("-sV".to_string());
        }
        if self.settings.nmap_os_detection && !has(&args, "-O") {
            args.push("-O".to_string());
        }
        if !has(&args, "--stats-every") {
            args.push("--stats-every".to_string());
            args.push(format!("{}s", self.settings.nmap_stats_interval_seconds));
        }

        args
    }
}

#[async_trait]
impl ScannerAdapter for StreamAdapter {
    async fn run(
        &self,
        target: &Target,
        entry: &QueueEntry,
        ctx: &AdapterContext,
    ) -> Result<RawResult, ScanError> {
        ctx.checkpoint()?;

        let address = target.address.trim();
        if address.is_empty() || address.starts_with('-') {
            return Err(ScanError::setup(format!(
                "invalid target address '{}'",
                target.address
            )));
        }

        let args = self.build_args(entry.args.as_deref());
        tracing::info!(
            scan_id = %ctx.scan_id,
            target = %address,
            args = %args.join(" "),
            "Starting nmap"
        );

        let mut child = Command::new(&self.settings.nmap_path)
            .args(&args)
            .arg(address)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ScanError::setup(format!(
                    "failed to start {}: {}",
                    self.settings.nmap_path, e
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScanError::setup("nmap stdout was not captured"))?;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_stderr(stderr, ctx.clone())));

        let mut reader = BufReader::new(stdout);
        let mut raw_output = String::new();

        loop {
            let line = tokio::select! {
                biased;
                _ = ctx.cancellation().cancelled() => {
                    terminate(&mut child, ctx).await;
                    return Err(ScanError::Cancelled);
                }
                line = read_lossy_line(&mut reader) => line?,
            };

            let Some(line) = line else {
                break;
            };

            raw_output.push_str(&line);
            raw_output.push('\n');
            forward_line(&line, ctx);
        }

        let exited = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => None,
            status = child.wait() => Some(status?),
        };
        let Some(status) = exited else {
            terminate(&mut child, ctx).await;
            return Err(ScanError::Cancelled);
        };

        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(ScanError::engine(format!(
                "nmap exited with {}: {}",
                status,
                stderr_tail.trim()
            )));
        }

        let report = nmap_parser::parse_report(&raw_output);
        tracing::info!(
            scan_id = %ctx.scan_id,
            hosts = report.hosts.len(),
            "nmap finished"
        );
        Ok(RawResult::LineStream(report))
    }
}

/// Raw log for every non-blank line, plus the typed event if a matcher hits.
fn forward_line(line: &str, ctx: &AdapterContext) {
    if line.trim().is_empty() {
        return;
    }
    ctx.log(line);

    match nmap_parser::classify_line(line) {
        Some(Ok(event)) => ctx.emit(event),
        Some(Err(message)) => {
            tracing::debug!(scan_id = %ctx.scan_id, error = %message, "Skipping malformed nmap line");
            ctx.parse_error(message);
        }
        None => {}
    }
}

/// One line without its terminator, decoded lossily; `None` at EOF.
async fn read_lossy_line<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&buf);
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Forwards stderr as raw log and returns its last lines.
async fn forward_stderr(stderr: ChildStderr, ctx: AdapterContext) -> String {
    let mut reader = BufReader::new(stderr);
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

    while let Ok(Some(line)) = read_lossy_line(&mut reader).await {
        if line.trim().is_empty() {
            continue;
        }
        ctx.log(line.clone());
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    Vec::from(tail).join("\n")
}

async fn terminate(child: &mut Child, ctx: &AdapterContext) {
    tracing::info!(scan_id = %ctx.scan_id, "Cancelling nmap process");
    if let Err(e) = child.kill().await {
        tracing::warn!(scan_id = %ctx.scan_id, error = %e, "Failed to kill nmap process");
    }
}
