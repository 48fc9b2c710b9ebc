//! Health probe strategies: HTTP, TCP and operator-supplied commands

use std::net::{TcpStream, ToSocketAddrs};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::core::instance::{HealthCheckConfig, HealthStatus, ProbeKind};

/// Outcome class of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    Healthy,
    Loading,
    Unhealthy,
    Error,
    Unreachable,
    Timeout,
}

impl ProbeStatus {
    /// Whether this outcome counts toward the failure budget
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Healthy | Self::Loading)
    }

    pub fn to_health(self) -> HealthStatus {
        match self {
            Self::Healthy => HealthStatus::Healthy,
            Self::Loading => HealthStatus::Loading,
            Self::Error => HealthStatus::Error,
            Self::Unhealthy | Self::Unreachable | Self::Timeout => HealthStatus::Unhealthy,
        }
    }
}

/// Where a probe points
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub status: ProbeStatus,
    pub latency: Duration,
    pub detail: String,
}

impl ProbeResult {
    fn new(status: ProbeStatus, started: Instant, detail: impl Into<String>) -> Self {
        Self {
            status,
            latency: started.elapsed(),
            detail: detail.into(),
        }
    }
}

/// A health check strategy; every failure mode is reported as a status
pub trait HealthProbe: Send + Sync {
    fn check(&self, target: &ProbeTarget, timeout: Duration) -> ProbeResult;

    /// Short label for logs
    fn kind(&self) -> &'static str;
}

/// Build the probe a healthcheck configuration asks for
pub fn probe_for(config: &HealthCheckConfig) -> Box<dyn HealthProbe> {
    match &config.probe {
        ProbeKind::Http { path } => Box::new(HttpProbe::new(path.clone())),
        ProbeKind::Tcp => Box::new(TcpProbe),
        ProbeKind::Custom { command, args } => {
            Box::new(CustomProbe::new(command.clone(), args.clone()))
        }
    }
}

/// GET a status endpoint and read its JSON `status` field
pub struct HttpProbe {
    path: String,
}

impl HttpProbe {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        Self { path }
    }
}

/// Map a response to a probe status
fn classify_http(code: u16, body: &str) -> (ProbeStatus, String) {
    match code {
        200 => {}
        503 => return (ProbeStatus::Loading, "HTTP 503".to_string()),
        other => return (ProbeStatus::Error, format!("HTTP {}", other)),
    }

    let status = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(str::to_lowercase));
    match status.as_deref() {
        None => (ProbeStatus::Healthy, "HTTP 200".to_string()),
        Some("ok" | "ready" | "healthy") => (ProbeStatus::Healthy, "HTTP 200".to_string()),
        Some(s) if s.contains("loading") => (ProbeStatus::Loading, s.to_string()),
        Some(s) => (ProbeStatus::Error, format!("unexpected status '{}'", s)),
    }
}

impl HealthProbe for HttpProbe {
    fn check(&self, target: &ProbeTarget, timeout: Duration) -> ProbeResult {
        let url = format!("http://{}:{}{}", target.host, target.port, self.path);
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let started = Instant::now();

        let response = match agent.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(transport)) => {
                debug!(url = %url, "HTTP probe transport error: {}", transport);
                let status = if started.elapsed() >= timeout {
                    ProbeStatus::Timeout
                } else {
                    match transport.kind() {
                        ureq::ErrorKind::Io
                            if transport.to_string().to_lowercase().contains("timed out") =>
                        {
                            ProbeStatus::Timeout
                        }
                        _ => ProbeStatus::Unreachable,
                    }
                };
                return ProbeResult::new(status, started, transport.to_string());
            }
        };

        let code = response.status();
        match response.into_string() {
            Ok(body) => {
                let (status, detail) = classify_http(code, &body);
                ProbeResult::new(status, started, detail)
            }
            Err(e) => {
                debug!(url = %url, "HTTP body read failed: {}", e);
                let status = if started.elapsed() >= timeout
                    || matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) {
                    ProbeStatus::Timeout
                } else {
                    ProbeStatus::Error
                };
                ProbeResult::new(status, started, format!("HTTP {}: body unreadable: {}", code, e))
            }
        }
    }

    fn kind(&self) -> &'static str {
        "http"
    }
}

/// Plain connect and close
pub struct TcpProbe;

impl HealthProbe for TcpProbe {
    fn check(&self, target: &ProbeTarget, timeout: Duration) -> ProbeResult {
        let started = Instant::now();
        let addr = match (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map(|mut addrs| addrs.next())
        {
            Ok(Some(addr)) => addr,
            Ok(None) => {
                return ProbeResult::new(ProbeStatus::Unhealthy, started, "no address resolved")
            }
            Err(e) => return ProbeResult::new(ProbeStatus::Unhealthy, started, e.to_string()),
        };

        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_stream) => ProbeResult::new(ProbeStatus::Healthy, started, format!("connected to {}", addr)),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                ProbeResult::new(ProbeStatus::Timeout, started, e.to_string())
            }
            Err(e) => ProbeResult::new(ProbeStatus::Unhealthy, started, e.to_string()),
        }
    }

    fn kind(&self) -> &'static str {
        "tcp"
    }
}

/// Run an operator command; exit code 0 means healthy
///
/// `{host}` and `{port}` in the arguments are replaced with the target.
pub struct CustomProbe {
    command: String,
    args: Vec<String>,
}

const CUSTOM_POLL_INTERVAL: Duration = Duration::from_millis(20);

impl CustomProbe {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl HealthProbe for CustomProbe {
    fn check(&self, target: &ProbeTarget, timeout: Duration) -> ProbeResult {
        let started = Instant::now();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                a.replace("{host}", &target.host)
                    .replace("{port}", &target.port.to_string())
            })
            .collect();

        let mut child = match Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ProbeResult::new(
                    ProbeStatus::Error,
                    started,
                    format!("failed to run {}: {}", self.command, e),
                )
            }
        };

        let deadline = started + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => {
                    return ProbeResult::new(ProbeStatus::Healthy, started, "exit 0")
                }
                Ok(Some(status)) => {
                    return ProbeResult::new(ProbeStatus::Unhealthy, started, status.to_string())
                }
                Ok(None) => {}
                Err(e) => return ProbeResult::new(ProbeStatus::Error, started, e.to_string()),
            }

            let now = Instant::now();
            if now >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return ProbeResult::new(
                    ProbeStatus::Timeout,
                    started,
                    format!("no result within {:?}", timeout),
                );
            }
            std::thread::sleep(CUSTOM_POLL_INTERVAL.min(deadline - now));
        }
    }

    fn kind(&self) -> &'static str {
        "custom"
    }
}
