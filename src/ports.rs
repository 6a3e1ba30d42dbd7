//! Port conflict detection for the services a profile is about to publish.
//!
//! A port counts as taken when either a bind on `0.0.0.0` fails with `AddrInUse`
//! or something accepts a connection on loopback. Owner lookup goes through the
//! OS socket tables (`lsof`, then `ss`) and is best-effort.

use crate::config::{Profile, ServiceId};
use regex::Regex;
use std::fmt;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const OWNER_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOwner {
    pub pid: u32,
    pub name: String,
}

impl ProcessOwner {
    /// The docker daemon (or its VM port forwarder) publishing a container port.
    pub fn is_docker(&self) -> bool {
        let name = self.name.to_lowercase();
        name == "docker-proxy"
            || name.starts_with("com.docker")
            || name.starts_with("vpnkit")
            || name == "limactl"
            || name == "dockerd"
    }
}

impl fmt::Display for ProcessOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.name, self.pid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub service: ServiceId,
    pub port: u16,
    pub conflict: bool,
    pub owner: Option<ProcessOwner>,
}

impl PortBinding {
    pub fn pid_label(&self) -> String {
        self.owner
            .as_ref()
            .map(|o| o.pid.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn process_label(&self) -> String {
        self.owner
            .as_ref()
            .map(|o| o.name.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Two ways out of a conflict: stop the owner, or move the service. A port
    /// published by docker usually belongs to a stack left running, so that
    /// stack gets taken down rather than the daemon killed.
    pub fn remedies(&self, profile: &str) -> Vec<String> {
        let kill = match &self.owner {
            Some(o) if o.is_docker() => format!(
                "COMPOSE_PROFILES={profile} docker compose down   # {} holds port {} for a running stack",
                o.name, self.port
            ),
            Some(o) => format!("kill {}   # stop {} holding port {}", o.pid, o.name, self.port),
            None => format!("lsof -nP -iTCP:{} -sTCP:LISTEN   # find and stop the owner", self.port),
        };
        let reassign = format!(
            "set {}={} in your profile overlay   # move {} to a free port",
            self.service.port_var(),
            self.port.saturating_add(1),
            self.service
        );
        vec![kill, reassign]
    }
}

/// Probe every port the profile needs. Only in-profile services are considered.
pub async fn scan(profile: &Profile) -> Vec<PortBinding> {
    let mut bindings = Vec::new();
    for id in &profile.services {
        let Some(port) = profile.port(*id) else { continue };
        let conflict = port_in_use(port).await;
        let owner = if conflict { find_owner(port).await } else { None };
        debug!(service = %id, port, conflict, "probed port");
        bindings.push(PortBinding {
            service: *id,
            port,
            conflict,
            owner,
        });
    }
    bindings
}

pub async fn port_in_use(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Err(e) if e.kind() == ErrorKind::AddrInUse => return true,
        Err(e) => debug!(port, "bind probe inconclusive: {e}"),
        Ok(listener) => drop(listener),
    }
    matches!(
        timeout(CONNECT_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

pub async fn find_owner(port: u16) -> Option<ProcessOwner> {
    let lsof = run_bounded("lsof", &["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-Fpc"]).await;
    if let Some(owner) = lsof.as_deref().and_then(parse_lsof_output) {
        return Some(owner);
    }
    let ss = run_bounded("ss", &["-ltnpH"]).await;
    ss.as_deref().and_then(|out| parse_ss_output(out, port))
}

async fn run_bounded(bin: &str, args: &[&str]) -> Option<String> {
    let fut = Command::new(bin).args(args).kill_on_drop(true).output();
    match timeout(OWNER_LOOKUP_TIMEOUT, fut).await {
        Ok(Ok(out)) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).to_string()),
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            debug!("{bin} unavailable: {e}");
            None
        }
        Err(_) => {
            debug!("{bin} timed out");
            None
        }
    }
}

/// `lsof -F pc` emits one field per line: `p<pid>` then `c<command>`.
pub fn parse_lsof_output(out: &str) -> Option<ProcessOwner> {
    let mut pid = None;
    for line in out.lines() {
        if let Some(p) = line.strip_prefix('p') {
            pid = p.trim().parse::<u32>().ok();
        } else if let Some(c) = line.strip_prefix('c') {
            if let Some(pid) = pid {
                return Some(ProcessOwner {
                    pid,
                    name: c.trim().to_string(),
                });
            }
        }
    }
    pid.map(|pid| ProcessOwner {
        pid,
        name: "unknown".to_string(),
    })
}

fn ss_users_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"users:\(\("([^"]+)",pid=(\d+)"#).expect("static regex"))
}

/// `ss -ltnpH`: `LISTEN 0 4096 0.0.0.0:5432 0.0.0.0:* users:(("postgres",pid=812,fd=5))`
pub fn parse_ss_output(out: &str, port: u16) -> Option<ProcessOwner> {
    let suffix = format!(":{port}");
    out.lines()
        .filter(|line| {
            line.split_whitespace()
                .nth(3)
                .map(|local| local.ends_with(&suffix))
                .unwrap_or(false)
        })
        .find_map(|line| {
            let caps = ss_users_re().captures(line)?;
            Some(ProcessOwner {
                pid: caps[2].parse().ok()?,
                name: caps[1].to_string(),
            })
        })
}

/// Render the conflict table followed by remedies for each port.
pub fn format_conflicts(bindings: &[PortBinding], profile: &str) -> String {
    let conflicts: Vec<&PortBinding> = bindings.iter().filter(|b| b.conflict).collect();
    let mut out = Vec::new();
    out.push(format!("{:<8} {:>6}  {:>8}  {}", "SERVICE", "PORT", "PID", "PROCESS"));
    for b in &conflicts {
        out.push(format!(
            "{:<8} {:>6}  {:>8}  {}",
            b.service.as_str(),
            b.port,
            b.pid_label(),
            b.process_label()
        ));
    }
    for b in &conflicts {
        out.push(String::new());
        out.push(format!("Port {} ({}):", b.port, b.service));
        for (i, r) in b.remedies(profile).iter().enumerate() {
            out.push(format!("  {}. {r}", i + 1));
        }
    }
    out.join("\n")
}
