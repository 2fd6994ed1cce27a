//! Greenbone Management Protocol client.
//!
//! Each call opens a connection, authenticates, sends one command and reads
//! one XML response. Connections are either the local gvmd Unix socket or
//! TLS over TCP, which is what gvmd serves on its network port.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use xml::escape::{escape_str_attribute, escape_str_pcdata};
use xml::reader::{EventReader, XmlEvent};

use crate::config::Settings;
use crate::error::ScanError;
use crate::models::RemoteResult;

/// Largest response accepted from gvmd.
const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

/// Well-known scan configurations shipped with every Greenbone feed.
pub const KNOWN_SCAN_CONFIGS: &[(&str, &str)] = &[
    ("daba56c8-73ec-11df-a475-002264764cea", "Full and fast"),
    ("085569ce-73ed-11df-83c3-002264764cea", "Empty"),
    ("8715c877-47a0-438d-98a3-27c7a6ab2196", "Discovery"),
    ("2d3f051c-55ba-11e3-bf43-406186ea4fc5", "Host Discovery"),
    ("bbca7412-a950-11e3-9109-406186ea4fc5", "System Discovery"),
    ("d21f6c81-2b88-4ac1-b7b4-a2a9f2ad4663", "Base"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteScanConfig {
    pub id: String,
    pub name: String,
}

pub fn fallback_scan_configs() -> Vec<RemoteScanConfig> {
    KNOWN_SCAN_CONFIGS
        .iter()
        .map(|(id, name)| RemoteScanConfig {
            id: id.to_string(),
            name: name.to_string(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePhase {
    Active,
    Done,
    Stopped,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTaskStatus {
    pub status: String,
    /// Remote percentage; gvmd reports -1 for tasks that are not running.
    pub progress: i32,
}

impl RemoteTaskStatus {
    pub fn phase(&self) -> RemotePhase {
        match self.status.as_str() {
            "Done" => RemotePhase::Done,
            "Stopped" => RemotePhase::Stopped,
            "Interrupted" => RemotePhase::Interrupted,
            _ => RemotePhase::Active,
        }
    }
}

/// Results of one report plus the elements that could not be read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedReport {
    pub results: Vec<RemoteResult>,
    pub skipped: Vec<String>,
}

/// Remote engine operations used by the poll adapter.
#[async_trait]
pub trait RemoteEngine: Send + Sync {
    async fn create_target(&self, name: &str, hosts: &str) -> Result<String, ScanError>;
    async fn list_scan_configs(&self) -> Result<Vec<RemoteScanConfig>, ScanError>;
    async fn create_task(
        &self,
        name: &str,
        config_id: &str,
        target_id: &str,
    ) -> Result<String, ScanError>;
    /// Returns the report id.
    async fn start_task(&self, task_id: &str) -> Result<String, ScanError>;
    async fn task_status(&self, task_id: &str) -> Result<RemoteTaskStatus, ScanError>;
    async fn fetch_report(&self, report_id: &str) -> Result<FetchedReport, ScanError>;
    async fn stop_task(&self, task_id: &str) -> Result<(), ScanError>;
}

// ============================================================================
// Minimal XML tree
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: HashMap<String, String>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Trimmed text of a direct child, `None` when missing or blank.
    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name)
            .map(|c| c.text.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    /// Every element with this name below `self`, not descending into matches.
    pub fn descendants_named<'a>(&'a self, name: &str, out: &mut Vec<&'a XmlElement>) {
        for child in &self.children {
            if child.name == name {
                out.push(child);
            } else {
                child.descendants_named(name, out);
            }
        }
    }
}

/// Parses one complete document into a tree.
pub fn parse_document(bytes: &[u8]) -> Result<XmlElement, ScanError> {
    let mut stack: Vec<XmlElement> = Vec::new();

    for event in EventReader::new(bytes) {
        match event {
            Ok(XmlEvent::StartElement {
                name, attributes, ..
            }) => stack.push(XmlElement {
                name: name.local_name,
                attributes: attributes
                    .into_iter()
                    .map(|a| (a.name.local_name, a.value))
                    .collect(),
                ..Default::default()
            }),
            Ok(XmlEvent::EndElement { .. }) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ScanError::protocol("unbalanced GMP response"))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Ok(XmlEvent::Characters(text)) | Ok(XmlEvent::CData(text)) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            Ok(_) => {}
            Err(e) => {
                return Err(ScanError::protocol(format!("malformed GMP response: {}", e)));
            }
        }
    }

    Err(ScanError::protocol("GMP response ended before its root element closed"))
}

/// How the root element of a response ends.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RootTag {
    SelfClosing,
    /// Closing tag bytes, e.g. `</get_reports_response>`.
    Closing(Vec<u8>),
}

/// Tells when a response is complete. The root tag is read once from the head
/// of the buffer; after that only the tail is inspected, so each read costs
/// the same however large the response grows.
#[derive(Debug, Default)]
struct ResponseFrame {
    root: Option<RootTag>,
}

impl ResponseFrame {
    fn is_complete(&mut self, buf: &[u8]) -> bool {
        if self.root.is_none() {
            self.root = root_tag(buf);
        }
        match &self.root {
            None => false,
            Some(RootTag::SelfClosing) => true,
            Some(RootTag::Closing(tag)) => trim_end(buf).ends_with(tag),
        }
    }
}

fn trim_end(buf: &[u8]) -> &[u8] {
    let end = buf
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &buf[..end]
}

/// Root element of a partial document, skipping declarations and comments.
/// None until the root's start tag has fully arrived.
fn root_tag(buf: &[u8]) -> Option<RootTag> {
    let mut rest = buf;
    loop {
        let start = rest.iter().position(|&b| b == b'<')?;
        rest = &rest[start + 1..];
        match rest.first() {
            Some(b'?') | Some(b'!') => continue,
            Some(_) => break,
            None => return None,
        }
    }

    let name_end = rest
        .iter()
        .position(|&b| b.is_ascii_whitespace() || b == b'>' || b == b'/')?;
    let name = &rest[..name_end];
    if name.is_empty() {
        return None;
    }

    let tag_end = rest.iter().position(|&b| b == b'>')?;
    if rest[..tag_end].ends_with(b"/") {
        return Some(RootTag::SelfClosing);
    }

    let mut closing = Vec::with_capacity(name.len() + 3);
    closing.extend_from_slice(b"</");
    closing.extend_from_slice(name);
    closing.push(b'>');
    Some(RootTag::Closing(closing))
}

fn check_status(response: &XmlElement) -> Result<(), ScanError> {
    let status = response.attr("status").unwrap_or("");
    if status.starts_with('2') {
        return Ok(());
    }
    Err(ScanError::engine(format!(
        "{} failed: {} {}",
        response.name,
        status,
        response.attr("status_text").unwrap_or("")
    )))
}

// ============================================================================
// Report parsing
// ============================================================================

/// "80/tcp" -> (80, tcp); "general/tcp" -> (None, tcp).
pub fn split_port(value: &str) -> (Option<u16>, Option<String>) {
    let value = value.trim();
    if value.is_empty() {
        return (None, None);
    }
    match value.split_once('/') {
        Some((port, protocol)) => (
            port.parse().ok(),
            Some(protocol.trim().to_string()).filter(|p| !p.is_empty()),
        ),
        None => (value.parse().ok(), None),
    }
}

fn tag_value(tags: &str, key: &str) -> Option<String> {
    tags.split('|').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k.trim() == key && !v.trim().is_empty()).then(|| v.trim().to_string())
    })
}

fn parse_result(element: &XmlElement) -> Result<RemoteResult, String> {
    let id = element.attr("id").map(str::to_string);
    let nvt = element.child("nvt");

    let name = element
        .child_text("name")
        .or_else(|| nvt.and_then(|n| n.child_text("name")))
        .ok_or_else(|| format!("result {} has no name", id.as_deref().unwrap_or("?")))?;

    let threat_score = match element
        .child_text("severity")
        .or_else(|| nvt.and_then(|n| n.child_text("cvss_base")))
    {
        Some(raw) => raw
            .parse::<f64>()
            .map_err(|_| format!("result '{}' has unreadable severity '{}'", name, raw))?,
        None => 0.0,
    };

    let (port, protocol) = element
        .child_text("port")
        .map(|p| split_port(&p))
        .unwrap_or((None, None));

    let tags = nvt.and_then(|n| n.child_text("tags")).unwrap_or_default();
    let cve_ids = nvt
        .and_then(|n| n.child("refs"))
        .map(|refs| {
            refs.children_named("ref")
                .filter(|r| r.attr("type").is_some_and(|t| t.eq_ignore_ascii_case("cve")))
                .filter_map(|r| r.attr("id").map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(RemoteResult {
        id,
        name,
        nvt_oid: nvt.and_then(|n| n.attr("oid")).map(str::to_string),
        host: element.child_text("host"),
        port,
        protocol,
        threat_score,
        cvss_vector: tag_value(&tags, "cvss_base_vector"),
        cve_ids,
        family: nvt.and_then(|n| n.child_text("family")),
        description: element.child_text("description"),
        solution: nvt
            .and_then(|n| n.child_text("solution"))
            .or_else(|| tag_value(&tags, "solution")),
    })
}

pub fn parse_report_results(response: &XmlElement) -> FetchedReport {
    let mut elements = Vec::new();
    response.descendants_named("result", &mut elements);

    let mut report = FetchedReport::default();
    for element in elements {
        match parse_result(element) {
            Ok(result) => report.results.push(result),
            Err(message) => report.skipped.push(message),
        }
    }
    report
}

// ============================================================================
// TLS
// ============================================================================

/// Accepts whatever certificate gvmd presents. Handshake signatures are still
/// checked against the presented key.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client TLS configuration for gvmd. With `verify` off any certificate is
/// accepted; with it on the chain must lead to a webpki root.
fn tls_connector(verify: bool) -> Result<TlsConnector, ScanError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ScanError::setup(format!("TLS setup failed: {}", e)))?;

    let config = if verify {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

// ============================================================================
// Client
// ============================================================================

#[derive(Debug, Clone)]
pub enum GmpEndpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl std::fmt::Display for GmpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GmpEndpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            GmpEndpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

pub struct GmpClient {
    endpoint: GmpEndpoint,
    username: String,
    password: String,
    scanner_id: String,
    port_list_id: String,
    timeout: Duration,
    tls_verify: bool,
}

impl GmpClient {
    pub fn from_settings(settings: &Settings) -> Self {
        let endpoint = match settings.gvm_socket_path.as_deref() {
            Some(path) if !path.trim().is_empty() => GmpEndpoint::Unix(PathBuf::from(path)),
            _ => GmpEndpoint::Tcp {
                host: settings.gvm_host.clone(),
                port: settings.gvm_port,
            },
        };

        Self {
            endpoint,
            username: settings.gvm_username.clone(),
            password: settings.gvm_password.clone(),
            scanner_id: settings.gvm_scanner_id.clone(),
            port_list_id: settings.gvm_port_list_id.clone(),
            timeout: settings.gvm_timeout(),
            tls_verify: settings.gvm_tls_verify,
        }
    }

    async fn command(&self, request: &str) -> Result<XmlElement, ScanError> {
        tokio::time::timeout(self.timeout, self.connect_and_send(request))
            .await
            .map_err(|_| {
                ScanError::engine(format!("GMP request to {} timed out", self.endpoint))
            })?
    }

    async fn connect_and_send(&self, request: &str) -> Result<XmlElement, ScanError> {
        let unreachable =
            |e: std::io::Error| ScanError::setup(format!("cannot reach gvmd at {}: {}", self.endpoint, e));

        match &self.endpoint {
            #[cfg(unix)]
            GmpEndpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(unreachable)?;
                self.session(stream, request).await
            }
            #[cfg(not(unix))]
            GmpEndpoint::Unix(_) => Err(ScanError::setup(
                "unix socket connections are not supported on this platform",
            )),
            GmpEndpoint::Tcp { host, port } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(unreachable)?;
                let server_name = ServerName::try_from(host.clone()).map_err(|e| {
                    ScanError::setup(format!("invalid gvmd host name {}: {}", host, e))
                })?;
                let stream = tls_connector(self.tls_verify)?
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| {
                        ScanError::setup(format!("TLS handshake with gvmd at {} failed: {}", self.endpoint, e))
                    })?;
                self.session(stream, request).await
            }
        }
    }

    async fn session<S>(&self, mut stream: S, request: &str) -> Result<XmlElement, ScanError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let auth = format!(
            "<authenticate><credentials><username>{}</username><password>{}</password></credentials></authenticate>",
            escape_str_pcdata(&self.username),
            escape_str_pcdata(&self.password)
        );
        stream.write_all(auth.as_bytes()).await?;
        check_status(&read_response(&mut stream).await?)?;

        stream.write_all(request.as_bytes()).await?;
        let response = read_response(&mut stream).await?;
        check_status(&response)?;
        Ok(response)
    }
}

async fn read_response<S>(stream: &mut S) -> Result<XmlElement, ScanError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];
    let mut frame = ResponseFrame::default();

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ScanError::protocol(
                "gvmd closed the connection before the response completed",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if buf.len() > MAX_RESPONSE_BYTES {
            return Err(ScanError::protocol("GMP response exceeds the size limit"));
        }
        if frame.is_complete(&buf) {
            return parse_document(&buf);
        }
    }
}

fn attr(value: &str) -> String {
    escape_str_attribute(value).into_owned()
}

fn text(value: &str) -> String {
    escape_str_pcdata(value).into_owned()
}

fn created_id(response: &XmlElement) -> Result<String, ScanError> {
    response
        .attr("id")
        .map(str::to_string)
        .ok_or_else(|| ScanError::protocol(format!("{} carried no id", response.name)))
}

#[async_trait]
impl RemoteEngine for GmpClient {
    async fn create_target(&self, name: &str, hosts: &str) -> Result<String, ScanError> {
        let request = format!(
            "<create_target><name>{}</name><hosts>{}</hosts><port_list id=\"{}\"/></create_target>",
            text(name),
            text(hosts),
            attr(&self.port_list_id)
        );
        created_id(&self.command(&request).await?)
    }

    async fn list_scan_configs(&self) -> Result<Vec<RemoteScanConfig>, ScanError> {
        let response = self.command("<get_configs usage_type=\"scan\"/>").await?;
        Ok(response
            .children_named("config")
            .filter(|c| c.child_text("trash").as_deref() != Some("1"))
            .filter_map(|c| {
                Some(RemoteScanConfig {
                    id: c.attr("id")?.to_string(),
                    name: c.child_text("name").unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn create_task(
        &self,
        name: &str,
        config_id: &str,
        target_id: &str,
    ) -> Result<String, ScanError> {
        let request = format!(
            "<create_task><name>{}</name><config id=\"{}\"/><target id=\"{}\"/><scanner id=\"{}\"/></create_task>",
            text(name),
            attr(config_id),
            attr(target_id),
            attr(&self.scanner_id)
        );
        created_id(&self.command(&request).await?)
    }

    async fn start_task(&self, task_id: &str) -> Result<String, ScanError> {
        let request = format!("<start_task task_id=\"{}\"/>", attr(task_id));
        self.command(&request)
            .await?
            .child_text("report_id")
            .ok_or_else(|| ScanError::protocol("start_task_response carried no report id"))
    }

    async fn task_status(&self, task_id: &str) -> Result<RemoteTaskStatus, ScanError> {
        let request = format!("<get_tasks task_id=\"{}\"/>", attr(task_id));
        let response = self.command(&request).await?;
        let task = response
            .child("task")
            .ok_or_else(|| ScanError::protocol(format!("task {} not found", task_id)))?;

        Ok(RemoteTaskStatus {
            status: task.child_text("status").unwrap_or_else(|| "Unknown".to_string()),
            progress: task
                .child_text("progress")
                .and_then(|p| p.parse::<f64>().ok())
                .map_or(0, |p| p as i32),
        })
    }

    async fn fetch_report(&self, report_id: &str) -> Result<FetchedReport, ScanError> {
        let request = format!(
            "<get_reports report_id=\"{}\" details=\"1\" ignore_pagination=\"1\" filter=\"apply_overrides=0 rows=-1\"/>",
            attr(report_id)
        );
        Ok(parse_report_results(&self.command(&request).await?))
    }

    async fn stop_task(&self, task_id: &str) -> Result<(), ScanError> {
        let request = format!("<stop_task task_id=\"{}\"/>", attr(task_id));
        self.command(&request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<get_reports_response status="200" status_text="OK">
  <report id="r-1">
    <report id="r-1">
      <results start="1" max="-1">
        <result id="res-1">
          <name>Apache HTTP Server Byte Range DoS</name>
          <host>10.0.0.5<asset asset_id="a-1"/></host>
          <port>80/tcp</port>
          <nvt oid="1.3.6.1.4.1.25623.1.0.901203">
            <name>Apache HTTP Server Byte Range DoS</name>
            <family>Denial of Service</family>
            <cvss_base>7.8</cvss_base>
            <tags>cvss_base_vector=AV:N/AC:L/Au:N/C:N/I:N/A:C|summary=Byte range DoS|solution=Update to 2.2.20</tags>
            <refs><ref type="cve" id="CVE-2011-3192"/><ref type="url" id="https://example.org"/></refs>
          </nvt>
          <severity>7.8</severity>
          <description>Vulnerable range handling</description>
        </result>
        <result id="res-2">
          <name>OS Detection Consolidation</name>
          <host>10.0.0.5</host>
          <port>general/tcp</port>
          <nvt oid="1.3.6.1.4.1.25623.1.0.105937"><name>OS Detection Consolidation</name></nvt>
          <severity>0.0</severity>
        </result>
        <result id="res-3">
          <host>10.0.0.5</host>
          <severity>high</severity>
        </result>
      </results>
      <result_count>3</result_count>
    </report>
  </report>
</get_reports_response>"#;

    #[test]
    fn test_report_results_are_parsed() {
        let document = parse_document(REPORT.as_bytes()).unwrap();
        let report = parse_report_results(&document);

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.skipped.len(), 1);

        let dos = &report.results[0];
        assert_eq!(dos.host.as_deref(), Some("10.0.0.5"));
        assert_eq!(dos.port, Some(80));
        assert_eq!(dos.protocol.as_deref(), Some("tcp"));
        assert_eq!(dos.threat_score, 7.8);
        assert_eq!(dos.cve_ids, vec!["CVE-2011-3192".to_string()]);
        assert_eq!(dos.cvss_vector.as_deref(), Some("AV:N/AC:L/Au:N/C:N/I:N/A:C"));
        assert_eq!(dos.solution.as_deref(), Some("Update to 2.2.20"));
        assert_eq!(dos.family.as_deref(), Some("Denial of Service"));

        let os = &report.results[1];
        assert_eq!(os.port, None);
        assert_eq!(os.protocol.as_deref(), Some("tcp"));
        assert_eq!(os.threat_score, 0.0);
    }

    #[test]
    fn test_split_port() {
        assert_eq!(split_port("443/tcp"), (Some(443), Some("tcp".to_string())));
        assert_eq!(split_port("general/icmp"), (None, Some("icmp".to_string())));
        assert_eq!(split_port(""), (None, None));
    }

    fn complete(buf: &[u8]) -> bool {
        ResponseFrame::default().is_complete(buf)
    }

    #[test]
    fn test_frame_detects_partial_responses() {
        assert!(!complete(b"<get_tasks_response status=\"200\"><task id=\"t\">"));
        assert!(complete(b"<get_tasks_response status=\"200\"><task/></get_tasks_response>\n"));
        assert!(complete(b"<create_target_response status=\"201\" id=\"x\"/>"));
        assert!(complete(b"<?xml version=\"1.0\"?><a></a>"));
        assert!(!complete(b""));
        assert!(!complete(b"<get_tasks_resp"));
    }

    #[test]
    fn test_frame_keeps_root_across_reads() {
        let mut frame = ResponseFrame::default();
        let mut buf = b"<get_reports_response status=\"200\">".to_vec();
        assert!(!frame.is_complete(&buf));
        assert_eq!(
            frame.root,
            Some(RootTag::Closing(b"</get_reports_response>".to_vec()))
        );

        // A nested element closing is not the end of the response
        buf.extend_from_slice(b"<report><result/></report>");
        assert!(!frame.is_complete(&buf));

        // Closing tag split over two reads
        buf.extend_from_slice(b"</get_reports_");
        assert!(!frame.is_complete(&buf));
        buf.extend_from_slice(b"response>\r\n");
        assert!(frame.is_complete(&buf));
    }

    #[test]
    fn test_status_check() {
        let ok = parse_document(b"<authenticate_response status=\"200\" status_text=\"OK\"/>").unwrap();
        assert!(check_status(&ok).is_ok());

        let denied = parse_document(
            b"<authenticate_response status=\"400\" status_text=\"Authentication failed\"/>",
        )
        .unwrap();
        let err = check_status(&denied).unwrap_err();
        assert!(err.to_string().contains("Authentication failed"));
    }

    #[test]
    fn test_fallback_catalogue_has_full_and_fast() {
        let configs = fallback_scan_configs();
        assert_eq!(configs.len(), KNOWN_SCAN_CONFIGS.len());
        assert!(configs
            .iter()
            .any(|c| c.name == "Full and fast" && c.id == "daba56c8-73ec-11df-a475-002264764cea"));
    }

    #[tokio::test]
    async fn test_session_over_duplex_stream() {
        let (client_io, mut server_io) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server_io.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).contains("<username>admin</username>"));
            server_io
                .write_all(b"<authenticate_response status=\"200\" status_text=\"OK\"><role>Admin</role>")
                .await
                .unwrap();
            server_io.write_all(b"</authenticate_response>").await.unwrap();

            let n = server_io.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("<start_task"));
            server_io
                .write_all(b"<start_task_response status=\"202\"><report_id>rep-9</report_id></start_task_response>")
                .await
                .unwrap();
        });

        let mut settings = Settings::new_with_env_file(false).unwrap();
        settings.gvm_username = "admin".to_string();
        let client = GmpClient::from_settings(&settings);
        let response = client
            .session(client_io, "<start_task task_id=\"t-1\"/>")
            .await
            .unwrap();

        assert_eq!(response.child_text("report_id").as_deref(), Some("rep-9"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_endpoint_speaks_tls() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = [0u8; 3];
            socket.read_exact(&mut head).await.unwrap();
            // Not a TLS server: hang up after seeing the ClientHello
            head
        });

        let mut settings = Settings::new_with_env_file(false).unwrap();
        settings.gvm_socket_path = None;
        settings.gvm_host = "127.0.0.1".to_string();
        settings.gvm_port = port;
        let client = GmpClient::from_settings(&settings);
        let err = client.command("<get_version/>").await.unwrap_err();

        let head = server.await.unwrap();
        // TLS handshake record, protocol major version 3
        assert_eq!(head[0], 0x16);
        assert_eq!(head[1], 0x03);
        assert!(matches!(err, ScanError::Setup(_)), "{:?}", err);
    }

    #[test]
    fn test_tls_connector_builds_in_both_modes() {
        assert!(tls_connector(false).is_ok());
        assert!(tls_connector(true).is_ok());
    }

    fn large_report(results: usize) -> Vec<u8> {
        let mut body = b"<get_reports_response status=\"200\" status_text=\"OK\"><report id=\"r-1\"><results>".to_vec();
        for i in 0..results {
            body.extend_from_slice(
                format!(
                    "<result id=\"res-{i}\"><name>Finding {i}</name><host>10.0.{}.{}</host><port>{}/tcp</port>\
                     <nvt oid=\"1.3.6.1.4.1.25623.1.0.{i}\"><name>Finding {i}</name><cvss_base>5.0</cvss_base></nvt>\
                     <severity>5.0</severity><description>{}</description></result>",
                    i / 256,
                    i % 256,
                    1 + i % 65000,
                    "x".repeat(400)
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(b"</results></report></get_reports_response>\n");
        body
    }

    #[tokio::test]
    async fn test_large_report_is_read_in_linear_time() {
        let report = large_report(8_000);
        assert!(report.len() > 4 * 1024 * 1024);

        let (mut client_io, mut server_io) = tokio::io::duplex(16 * 1024);
        let writer = tokio::spawn(async move {
            for chunk in report.chunks(8 * 1024) {
                server_io.write_all(chunk).await.unwrap();
            }
            server_io
        });

        let response = tokio::time::timeout(Duration::from_secs(20), read_response(&mut client_io))
            .await
            .expect("report read took too long")
            .unwrap();

        assert_eq!(response.name, "get_reports_response");
        assert_eq!(parse_report_results(&response).results.len(), 8_000);
        drop(writer.await.unwrap());
    }
}
