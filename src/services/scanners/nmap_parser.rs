//! Line tokenizer and final report parser for nmap's normal (`-v`) output.
//!
//! The tokenizer runs once per line while the process is alive and yields at
//! most one typed event per line; the report parser runs once over the
//! buffered output after exit.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{parse_clock, AdapterEvent};
use crate::models::{HostBlock, NmapReport, OsDetection, PortBlock, ScriptOutput};

static DONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Nmap done:\s+(.+)$").unwrap());
static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:(?P<phase>[A-Za-z][A-Za-z ]*?) Timing: )?About (?P<pct>\d+(?:\.\d+)?)% done(?:; ETC: [^(]*\((?P<eta>[\d:]+) remaining\))?",
    )
    .unwrap()
});
static HOST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Nmap scan report for (.+)$").unwrap());
static OPEN_PORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)/(tcp|udp|sctp)\s+open\s+(\S+)").unwrap());
static TIMING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Stats:\s+([\d:]+)\s+elapsed").unwrap());

static HOST_ADDR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\S+) \(([^)]+)\)$").unwrap());
static PORT_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)/(tcp|udp|sctp)\s+(\S+)\s+(\S+)(?:\s+(.*))?$").unwrap());
static SCRIPT_START_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\|_?\s?([a-z0-9][a-z0-9_.-]*):\s?(.*)$").unwrap());
static OS_DETAILS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^OS details:\s*(.+)$").unwrap());
static OS_RUNNING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^Running(?: \(JUST GUESSING\))?:\s*(.+)$").unwrap());
static OS_GUESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Aggressive OS guesses:\s*([^(]+)\((\d+)%\)").unwrap());
static OS_CPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^OS CPE:\s*(cpe:\S+)").unwrap());
static CPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"cpe:/[^\s,;)]+").unwrap());

type LineMatch = Result<AdapterEvent, String>;
type Matcher = fn(&str) -> Option<LineMatch>;

/// First matcher that recognizes the line wins.
const MATCHERS: [Matcher; 5] = [
    match_done,
    match_progress,
    match_host,
    match_open_port,
    match_timing,
];

/// Typed event for one output line, `None` for lines that only go to the raw
/// log. `Some(Err)` marks a line that looked recognizable but was malformed.
pub fn classify_line(line: &str) -> Option<LineMatch> {
    let line = line.trim_end();
    MATCHERS.iter().find_map(|matcher| matcher(line))
}

fn match_done(line: &str) -> Option<LineMatch> {
    DONE_RE.is_match(line).then(|| {
        Ok(AdapterEvent::Progress {
            percent: 100,
            step: Some("Scan completed".to_string()),
            eta_seconds: None,
        })
    })
}

fn match_progress(line: &str) -> Option<LineMatch> {
    let caps = PROGRESS_RE.captures(line)?;
    let percent = match caps["pct"].parse::<f64>() {
        Ok(p) => p.clamp(0.0, 100.0) as i32,
        Err(_) => return Some(Err(format!("unreadable progress value in '{}'", line))),
    };
    let step = caps
        .name("phase")
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| "Scanning in progress".to_string());
    let eta_seconds = caps.name("eta").and_then(|m| parse_clock(m.as_str()));

    Some(Ok(AdapterEvent::Progress {
        percent,
        step: Some(step),
        eta_seconds,
    }))
}

fn match_host(line: &str) -> Option<LineMatch> {
    let caps = HOST_RE.captures(line)?;
    Some(Ok(AdapterEvent::HostDiscovered {
        host: caps[1].trim().to_string(),
    }))
}

fn match_open_port(line: &str) -> Option<LineMatch> {
    let caps = OPEN_PORT_RE.captures(line)?;
    let port = match caps[1].parse::<u16>() {
        Ok(port) => port,
        Err(_) => return Some(Err(format!("invalid port number in '{}'", line))),
    };
    Some(Ok(AdapterEvent::PortDiscovered {
        port,
        protocol: caps[2].to_string(),
        service: Some(caps[3].to_string()),
    }))
}

fn match_timing(line: &str) -> Option<LineMatch> {
    let caps = TIMING_RE.captures(line)?;
    match parse_clock(&caps[1]) {
        Some(elapsed_seconds) => Some(Ok(AdapterEvent::TimingUpdate { elapsed_seconds })),
        None => Some(Err(format!("unreadable elapsed time in '{}'", line))),
    }
}

// ============================================================================
// Final structured pass
// ============================================================================

/// Parses the complete output. Never fails: unrecognized lines are skipped.
pub fn parse_report(raw_output: &str) -> NmapReport {
    let hosts = raw_output
        .split("Nmap scan report for ")
        .skip(1)
        .map(parse_host_block)
        .collect();

    let summary = raw_output
        .lines()
        .find_map(|line| DONE_RE.captures(line.trim_end()))
        .map(|caps| caps[1].trim().to_string());

    NmapReport {
        hosts,
        os_detection: parse_os_detection(raw_output),
        cpe_list: extract_cpes(raw_output),
        summary,
        raw_output: raw_output.to_string(),
    }
}

enum ScriptOwner {
    Port,
    Host,
}

fn parse_host_block(block: &str) -> HostBlock {
    let mut lines = block.lines();
    let header = lines.next().unwrap_or_default().trim();

    let mut host = match HOST_ADDR_RE.captures(header) {
        Some(caps) => HostBlock {
            host: caps[1].to_string(),
            address: Some(caps[2].to_string()),
            ..Default::default()
        },
        None => HostBlock {
            host: header.to_string(),
            ..Default::default()
        },
    };

    let mut owner = ScriptOwner::Port;
    let mut current: Option<ScriptOutput> = None;

    for line in lines {
        let line = line.trim_end();

        if let Some(rest) = line.strip_prefix('|') {
            if let Some(caps) = SCRIPT_START_RE.captures(line) {
                flush_script(&mut host, &owner, current.take());
                current = Some(ScriptOutput {
                    id: caps[1].to_string(),
                    output: caps[2].trim().to_string(),
                });
            } else if let Some(script) = current.as_mut() {
                let text = rest.strip_prefix('_').unwrap_or(rest).trim();
                if !text.is_empty() {
                    if !script.output.is_empty() {
                        script.output.push('\n');
                    }
                    script.output.push_str(text);
                }
            }
            continue;
        }

        flush_script(&mut host, &owner, current.take());

        if line.starts_with("Host script results:") {
            owner = ScriptOwner::Host;
        } else if let Some(port) = parse_port_line(line) {
            owner = ScriptOwner::Port;
            host.ports.push(port);
        }
    }
    flush_script(&mut host, &owner, current.take());

    host
}

fn flush_script(host: &mut HostBlock, owner: &ScriptOwner, script: Option<ScriptOutput>) {
    let Some(script) = script else {
        return;
    };
    match (owner, host.ports.last_mut()) {
        (ScriptOwner::Port, Some(port)) => port.scripts.push(script),
        _ => host.scripts.push(script),
    }
}

fn parse_port_line(line: &str) -> Option<PortBlock> {
    let caps = PORT_LINE_RE.captures(line)?;
    let port = caps[1].parse::<u16>().ok()?;

    let mut block = PortBlock {
        port,
        protocol: caps[2].to_string(),
        state: caps[3].to_string(),
        service: caps[4].to_string(),
        ..Default::default()
    };

    if let Some(version) = caps.get(5).map(|m| m.as_str().trim()).filter(|v| !v.is_empty()) {
        let (details, extra) = match version.find(" (") {
            Some(idx) if version.ends_with(')') => (
                &version[..idx],
                Some(version[idx + 2..version.len() - 1].trim().to_string()),
            ),
            _ => (version, None),
        };
        let (product, version) = split_product_version(details);
        block.product = product;
        block.version = version;
        block.extra_info = extra;
    }

    Some(block)
}

/// "Apache httpd 2.4.7" -> ("Apache httpd", "2.4.7"). The version is the first
/// token starting with a digit.
fn split_product_version(details: &str) -> (Option<String>, Option<String>) {
    let tokens: Vec<&str> = details.split_whitespace().collect();
    if tokens.is_empty() {
        return (None, None);
    }

    match tokens
        .iter()
        .position(|t| t.starts_with(|c: char| c.is_ascii_digit()))
    {
        Some(0) => (None, Some(tokens.join(" "))),
        Some(idx) => (
            Some(tokens[..idx].join(" ")),
            Some(tokens[idx..].join(" ")),
        ),
        None => (Some(tokens.join(" ")), None),
    }
}

fn parse_os_detection(raw_output: &str) -> Option<OsDetection> {
    let mut name = OS_DETAILS_RE
        .captures(raw_output)
        .map(|caps| caps[1].trim().to_string());

    let mut accuracy = None;
    if let Some(caps) = OS_GUESS_RE.captures(raw_output) {
        if name.is_none() {
            name = Some(caps[1].trim().trim_end_matches(',').trim().to_string());
        }
        accuracy = caps[2].parse::<u8>().ok();
    }

    let (vendor, family) = match OS_RUNNING_RE.captures(raw_output) {
        Some(caps) => os_vendor_family(&caps[1]),
        None => (None, None),
    };

    let cpe = OS_CPE_RE.captures(raw_output).map(|caps| caps[1].to_string());

    name.map(|name| OsDetection {
        name,
        vendor,
        family,
        accuracy,
        cpe,
    })
}

fn os_vendor_family(running: &str) -> (Option<String>, Option<String>) {
    let pair = |vendor: &str, family: &str| (Some(vendor.to_string()), Some(family.to_string()));
    if running.contains("Linux") {
        pair("Linux", "Linux")
    } else if running.contains("Windows") {
        pair("Microsoft", "Windows")
    } else if running.contains("BSD") {
        pair("BSD", "BSD")
    } else if running.contains("Mac OS X") || running.contains("macOS") {
        pair("Apple", "Mac OS X")
    } else {
        (None, None)
    }
}

fn extract_cpes(raw_output: &str) -> Vec<String> {
    CPE_RE
        .find_iter(raw_output)
        .map(|m| m.as_str().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Starting Nmap 7.94 ( https://nmap.org ) at 2024-05-01 10:00 UTC
Stats: 0:00:12 elapsed; 0 hosts completed (1 up), 1 undergoing Service Scan
Service scan Timing: About 66.67% done; ETC: 10:01 (0:00:06 remaining)
Nmap scan report for scanme.example.org (10.0.0.5)
Host is up (0.010s latency).
Not shown: 997 closed tcp ports (reset)
PORT   STATE SERVICE VERSION
22/tcp open  ssh     OpenSSH 7.4 (protocol 2.0)
| ssh-hostkey:
|   2048 aa:bb:cc (RSA)
|_  256 dd:ee:ff (ECDSA)
80/tcp open  http    Apache httpd 2.4.7 ((Ubuntu))
|_http-title: Welcome
| http-vuln-cve2011-3192:
|   VULNERABLE:
|   Apache byterange filter DoS
|     State: VULNERABLE
|_    IDs:  CVE:CVE-2011-3192
443/tcp filtered https
Running: Linux 3.X|4.X
OS CPE: cpe:/o:linux:linux_kernel:3 cpe:/o:linux:linux_kernel:4
Aggressive OS guesses: Linux 3.10 - 4.11 (95%), Linux 3.2 - 4.9 (93%)
Service Info: OS: Linux; CPE: cpe:/o:linux:linux_kernel

Host script results:
|_clock-skew: mean: 0s

Nmap done: 1 IP address (1 host up) scanned in 14.20 seconds
";

    #[test]
    fn test_tokenizer_progress_with_phase_and_eta() {
        let event = classify_line(
            "SYN Stealth Scan Timing: About 45.67% done; ETC: 12:34 (0:00:37 remaining)",
        );
        assert_eq!(
            event,
            Some(Ok(AdapterEvent::Progress {
                percent: 45,
                step: Some("SYN Stealth Scan".to_string()),
                eta_seconds: Some(37),
            }))
        );
    }

    #[test]
    fn test_tokenizer_line_shapes() {
        assert_eq!(
            classify_line("Nmap scan report for 192.168.1.1"),
            Some(Ok(AdapterEvent::HostDiscovered {
                host: "192.168.1.1".to_string()
            }))
        );
        assert_eq!(
            classify_line("80/tcp   open  http"),
            Some(Ok(AdapterEvent::PortDiscovered {
                port: 80,
                protocol: "tcp".to_string(),
                service: Some("http".to_string()),
            }))
        );
        assert_eq!(
            classify_line("Stats: 0:01:05 elapsed; 0 hosts completed (1 up)"),
            Some(Ok(AdapterEvent::TimingUpdate { elapsed_seconds: 65 }))
        );
        assert!(matches!(
            classify_line("Nmap done: 1 IP address (1 host up) scanned in 3.2 seconds"),
            Some(Ok(AdapterEvent::Progress { percent: 100, .. }))
        ));
        assert_eq!(classify_line("Host is up (0.010s latency)."), None);
        assert_eq!(classify_line("443/tcp closed https"), None);
    }

    #[test]
    fn test_tokenizer_reports_malformed_port() {
        assert!(matches!(
            classify_line("99999/tcp open  weird"),
            Some(Err(_))
        ));
    }

    #[test]
    fn test_report_hosts_ports_and_scripts() {
        let report = parse_report(SAMPLE);
        assert_eq!(report.hosts.len(), 1);

        let host = &report.hosts[0];
        assert_eq!(host.host, "scanme.example.org");
        assert_eq!(host.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(host.ports.len(), 3);

        let ssh = &host.ports[0];
        assert_eq!(ssh.port, 22);
        assert_eq!(ssh.product.as_deref(), Some("OpenSSH"));
        assert_eq!(ssh.version.as_deref(), Some("7.4"));
        assert_eq!(ssh.extra_info.as_deref(), Some("protocol 2.0"));
        assert_eq!(ssh.scripts.len(), 1);
        assert_eq!(ssh.scripts[0].id, "ssh-hostkey");

        let http = &host.ports[1];
        assert_eq!(http.product.as_deref(), Some("Apache httpd"));
        assert_eq!(http.extra_info.as_deref(), Some("(Ubuntu)"));
        assert_eq!(http.scripts.len(), 2);
        assert_eq!(http.scripts[0].output, "Welcome");
        assert!(http.scripts[1].output.contains("State: VULNERABLE"));
        assert!(http.scripts[1].output.contains("CVE:CVE-2011-3192"));

        assert!(!host.ports[2].is_open());
        assert_eq!(host.scripts.len(), 1);
        assert_eq!(host.scripts[0].id, "clock-skew");

        assert_eq!(
            report.summary.as_deref(),
            Some("1 IP address (1 host up) scanned in 14.20 seconds")
        );
    }

    #[test]
    fn test_report_os_detection_and_cpes() {
        let report = parse_report(SAMPLE);
        let os = report.os_detection.unwrap();
        assert_eq!(os.name, "Linux 3.10 - 4.11");
        assert_eq!(os.family.as_deref(), Some("Linux"));
        assert_eq!(os.accuracy, Some(95));
        assert_eq!(os.cpe.as_deref(), Some("cpe:/o:linux:linux_kernel:3"));

        assert_eq!(
            report.cpe_list,
            vec![
                "cpe:/o:linux:linux_kernel".to_string(),
                "cpe:/o:linux:linux_kernel:3".to_string(),
                "cpe:/o:linux:linux_kernel:4".to_string(),
            ]
        );
    }

    #[test]
    fn test_missing_os_block_is_none() {
        let report = parse_report("Nmap scan report for 10.0.0.1\n80/tcp open http\n");
        assert!(report.os_detection.is_none());
        assert_eq!(report.hosts[0].ports[0].service, "http");
        assert!(report.summary.is_none());
    }
}
