use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{AdapterContext, ScannerAdapter};
use crate::config::Settings;
use crate::error::ScanError;
use crate::models::{Finding, PluginReport, QueueEntry, RawResult, Severity, Target};

/// In-process scan capability selected by name.
#[async_trait]
pub trait ScanPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        target: &Target,
        args: &[String],
        ctx: &AdapterContext,
    ) -> Result<PluginReport, ScanError>;
}

/// Routes a job to the plugin named by the first token of its arguments.
#[derive(Default)]
pub struct PluginAdapter {
    plugins: HashMap<String, Arc<dyn ScanPlugin>>,
}

impl PluginAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins(settings: &Settings) -> Self {
        let mut adapter = Self::new();
        adapter.register(Arc::new(BannerGrabPlugin::from_settings(settings)));
        adapter
    }

    pub fn register(&mut self, plugin: Arc<dyn ScanPlugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ScannerAdapter for PluginAdapter {
    async fn run(
        &self,
        target: &Target,
        entry: &QueueEntry,
        ctx: &AdapterContext,
    ) -> Result<RawResult, ScanError> {
        let mut tokens = entry
            .args
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string);

        let name = tokens.next().ok_or_else(|| {
            ScanError::setup("plugin scans need the plugin name as the first argument")
        })?;
        let plugin = self.plugins.get(&name).ok_or_else(|| {
            ScanError::setup(format!(
                "unknown plugin '{}' (available: {})",
                name,
                self.names().join(", ")
            ))
        })?;
        let args: Vec<String> = tokens.collect();

        ctx.checkpoint()?;
        tracing::info!(scan_id = %ctx.scan_id, plugin = %name, "Running scan plugin");
        ctx.progress(0, format!("Running plugin {}", name), None);

        let report = plugin.run(target, &args, ctx).await?;
        Ok(RawResult::Plugin(report))
    }
}

// ============================================================================
// banner_grab
// ============================================================================

const HTTP_PROBE_PORTS: [u16; 4] = [80, 443, 8080, 8443];
const MAX_BANNER_BYTES: usize = 4096;
const MAX_CONCURRENT_PROBES: usize = 16;

struct Signature {
    service: &'static str,
    pattern: Regex,
    product: &'static str,
}

fn signature(service: &'static str, pattern: &str, product: &'static str) -> Signature {
    Signature {
        service,
        pattern: Regex::new(&format!("(?i){}", pattern)).unwrap(),
        product,
    }
}

static SIGNATURES: Lazy<Vec<Signature>> = Lazy::new(|| {
    vec![
        signature("ssh", r"SSH-[\d.]+-OpenSSH_([\d.]+)", "OpenSSH"),
        signature("ssh", r"SSH-[\d.]+-Cisco", "Cisco SSH"),
        signature("ssh", r"SSH-[\d.]+-dropbear_([\d.]+)", "Dropbear SSH"),
        signature("http", r"Server:\s*Apache/([\d.]+)", "Apache"),
        signature("http", r"Server:\s*nginx/([\d.]+)", "nginx"),
        signature("http", r"Server:\s*Microsoft-IIS/([\d.]+)", "Microsoft IIS"),
        signature("http", r"Server:\s*lighttpd/([\d.]+)", "lighttpd"),
        signature("ftp", r"220.*ProFTPD\s+([\d.]+)", "ProFTPD"),
        signature("ftp", r"220.*vsftpd\s+([\d.]+)", "vsftpd"),
        signature("ftp", r"220.*FileZilla Server", "FileZilla"),
        signature("ftp", r"220.*Microsoft FTP Service", "Microsoft FTP"),
        signature("smtp", r"220.*Postfix", "Postfix"),
        signature("smtp", r"220.*Sendmail\s+([\d.]+)", "Sendmail"),
        signature("smtp", r"220.*Microsoft ESMTP MAIL Service", "Microsoft Exchange"),
        signature("smtp", r"220.*Exim\s+([\d.]+)", "Exim"),
        signature("mysql", r"([\d.]+)-MariaDB", "MariaDB"),
        signature("mysql", r"([\d.]+)-MySQL", "MySQL"),
        signature("postgresql", r"PostgreSQL\s+([\d.]+)", "PostgreSQL"),
        signature("redis", r"\+PONG", "Redis"),
        signature("redis", r"-NOAUTH", "Redis"),
        signature("mongodb", r"MongoDB", "MongoDB"),
        signature("telnet", r"Ubuntu", "Ubuntu Telnet"),
        signature("telnet", r"Debian", "Debian Telnet"),
    ]
});

fn service_for_port(port: u16) -> Option<&'static str> {
    Some(match port {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 | 587 => "smtp",
        80 | 8080 => "http",
        443 | 8443 => "https",
        3306 => "mysql",
        3389 => "rdp",
        5432 => "postgresql",
        5900 => "vnc",
        6379 => "redis",
        27017 => "mongodb",
        _ => return None,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Fingerprint {
    pub service: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
}

/// First matching signature wins; otherwise only the well-known service for
/// the port is reported.
pub fn fingerprint(banner: &str, port: u16) -> Fingerprint {
    for sig in SIGNATURES.iter() {
        if let Some(caps) = sig.pattern.captures(banner) {
            return Fingerprint {
                service: Some(sig.service.to_string()),
                product: Some(sig.product.to_string()),
                version: caps.get(1).map(|m| m.as_str().to_string()),
            };
        }
    }

    Fingerprint {
        service: service_for_port(port).map(str::to_string),
        ..Default::default()
    }
}

fn probe_for_port(port: u16) -> Option<&'static [u8]> {
    match port {
        p if HTTP_PROBE_PORTS.contains(&p) => Some(b"HEAD / HTTP/1.0\r\n\r\n"),
        25 | 587 => Some(b"EHLO scanner\r\n"),
        6379 => Some(b"PING\r\n"),
        // SSLRequest; the server answers with a single byte
        5432 => Some(b"\x00\x00\x00\x08\x04\xd2\x16\x2f"),
        _ => None,
    }
}

fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect::<String>()
        .trim()
        .to_string()
}

#[derive(Debug, Clone, Serialize)]
struct BannerResult {
    port: u16,
    banner: String,
    #[serde(flatten)]
    fingerprint: Fingerprint,
}

/// Connects to each port, reads what the service announces (probing silent
/// HTTP-like services), and fingerprints the product.
pub struct BannerGrabPlugin {
    timeout: Duration,
    default_ports: Vec<u16>,
}

impl BannerGrabPlugin {
    pub fn new(timeout: Duration, default_ports: Vec<u16>) -> Self {
        Self {
            timeout,
            default_ports,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.banner_timeout(), settings.banner_default_ports.clone())
    }

    fn parse_ports(&self, args: &[String]) -> Result<Vec<u16>, ScanError> {
        let mut ports = Vec::new();
        for token in args.iter().flat_map(|a| a.split(',')) {
            let token = token.trim().trim_start_matches("ports=");
            if token.is_empty() {
                continue;
            }
            let port = token
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ScanError::setup(format!("invalid port '{}'", token)))?;
            if !ports.contains(&port) {
                ports.push(port);
            }
        }

        if ports.is_empty() {
            ports = self.default_ports.clone();
        }
        Ok(ports)
    }

    async fn grab(&self, host: &str, port: u16) -> Option<String> {
        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .ok()?
            .ok()?;

        let mut buf = vec![0u8; MAX_BANNER_BYTES];
        let mut n = match tokio::time::timeout(self.timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            _ => 0,
        };

        if n == 0 {
            let probe = probe_for_port(port)?;
            stream.write_all(probe).await.ok()?;
            n = tokio::time::timeout(self.timeout, stream.read(&mut buf))
                .await
                .ok()?
                .ok()?;
        }

        let banner = printable(&buf[..n]);
        (!banner.is_empty()).then_some(banner)
    }
}

#[async_trait]
impl ScanPlugin for BannerGrabPlugin {
    fn name(&self) -> &str {
        "banner_grab"
    }

    async fn run(
        &self,
        target: &Target,
        args: &[String],
        ctx: &AdapterContext,
    ) -> Result<PluginReport, ScanError> {
        let ports = self.parse_ports(args)?;
        let host = target.address.trim();
        let total = ports.len().max(1);

        let collect = async {
            let mut done = 0usize;
            let mut banners = Vec::new();
            let mut probes = stream::iter(ports.iter().copied())
                .map(|port| async move { (port, self.grab(host, port).await) })
                .buffer_unordered(MAX_CONCURRENT_PROBES);

            while let Some((port, banner)) = probes.next().await {
                done += 1;
                ctx.progress(
                    (done * 100 / total) as i32,
                    format!("Grabbed {}/{} ports", done, total),
                    None,
                );
                if let Some(banner) = banner {
                    ctx.log(format!("{}:{} {}", host, port, banner.lines().next().unwrap_or("")));
                    banners.push(BannerResult {
                        port,
                        fingerprint: fingerprint(&banner, port),
                        banner,
                    });
                }
            }
            banners
        };

        let mut banners = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => return Err(ScanError::Cancelled),
            banners = collect => banners,
        };
        banners.sort_by_key(|b| b.port);

        let findings = banners
            .iter()
            .map(|b| {
                let label = b
                    .fingerprint
                    .product
                    .as_deref()
                    .or(b.fingerprint.service.as_deref())
                    .unwrap_or("unknown");
                Finding {
                    severity: Some(Severity::Info),
                    host: Some(host.to_string()),
                    port: Some(b.port),
                    protocol: Some("tcp".to_string()),
                    service: b.fingerprint.service.clone(),
                    evidence: Some(b.banner.clone()),
                    remediation: Some(
                        "Review whether the service banner discloses version information."
                            .to_string(),
                    ),
                    category: Some("service_banner".to_string()),
                    ..Finding::new(format!("Service Banner {}/tcp ({})", b.port, label))
                }
            })
            .collect();

        Ok(PluginReport {
            plugin: self.name().to_string(),
            target: host.to_string(),
            results: json!({ "host": host, "ports_probed": ports, "banners": banners }),
            findings,
        })
    }
}
