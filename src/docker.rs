use anyhow::{anyhow, Context, Result};
use bollard::query_parameters::LogsOptionsBuilder;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::StreamExt;
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

const CLI_TIMEOUT: Duration = Duration::from_secs(15);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DockerMeta {
    pub backend: String,
    pub context_name: String,
    pub socket_path: String,
    pub available: bool,
    pub unavailable_reason: Option<String>,
    pub engine_version: Option<String>,
    pub compose_version: Option<String>,
    pub docker_bin: String,
}

impl DockerMeta {
    pub async fn detect(cwd: &Path, docker_bin: &str) -> Self {
        let docker_bin = docker_bin.to_string();
        let cwd_buf = cwd.to_path_buf();

        let context_check = async {
            let mut ctx_name = "default".to_string();
            let mut backend = "unknown".to_string();
            let mut socket_path = String::new();

            if let Ok(ctx_out) = cmd_out(&docker_bin, &cwd_buf, &["context", "show"]).await {
                let ctx = ctx_out.trim().to_string();
                ctx_name = ctx.clone();
                if let Ok(info) = cmd_out(&docker_bin, &cwd_buf, &["context", "inspect", &ctx]).await {
                    if let Ok(v) = serde_json::from_str::<Value>(&info) {
                        let host = v
                            .get(0)
                            .and_then(|x| x.get("Endpoints"))
                            .and_then(|x| x.get("docker"))
                            .and_then(|x| x.get("Host"))
                            .and_then(|x| x.as_str())
                            .unwrap_or("")
                            .to_string();
                        backend = classify(&ctx, &host);
                        socket_path = host;
                    }
                }
            }
            (ctx_name, backend, socket_path)
        };

        let compose_check = async {
            cmd_out(&docker_bin, &cwd_buf, &["compose", "version", "--short"])
                .await
                .ok()
                .map(|s| s.trim().to_string())
        };

        let ((context_name, backend, socket_path), compose_version) = tokio::join!(context_check, compose_check);

        let (available, engine_version, unavailable_reason) = match ping_engine(&socket_path).await {
            Ok(version) => (true, Some(version), None),
            Err(e) => {
                debug!("engine ping failed: {e:#}");
                // `docker info` works for ssh contexts the API client can't reach directly.
                let info_ok = cmd_out(&docker_bin, &cwd_buf, &["info", "--format", "{{.ServerVersion}}"]).await;
                match info_ok {
                    Ok(v) => (true, Some(v.trim().to_string()), None),
                    Err(info_err) => (false, None, Some(format!("{e:#}; {info_err:#}"))),
                }
            }
        };

        DockerMeta {
            backend,
            context_name,
            socket_path,
            available,
            unavailable_reason,
            engine_version,
            compose_version,
            docker_bin,
        }
    }
}

fn classify(context_name: &str, socket_path: &str) -> String {
    let s = format!("{context_name} {socket_path}").to_lowercase();
    if s.contains("colima") {
        "colima".to_string()
    } else {
        "docker".to_string()
    }
}

fn connect(socket_path: &str) -> Result<Docker> {
    let docker = if socket_path.starts_with("unix://") {
        Docker::connect_with_unix(socket_path, PING_TIMEOUT.as_secs(), API_DEFAULT_VERSION)?
    } else {
        Docker::connect_with_local_defaults()?
    };
    Ok(docker)
}

/// Ping the engine through the API and return its version.
async fn ping_engine(socket_path: &str) -> Result<String> {
    let docker = connect(socket_path)?;
    timeout(PING_TIMEOUT, docker.ping())
        .await
        .map_err(|_| anyhow!("engine ping timed out after {}s", PING_TIMEOUT.as_secs()))??;
    let version = timeout(PING_TIMEOUT, docker.version())
        .await
        .map_err(|_| anyhow!("engine version timed out"))??;
    Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
}

async fn cmd_out(bin: &str, cwd: &Path, args: &[&str]) -> Result<String> {
    let fut = Command::new(bin).current_dir(cwd).args(args).kill_on_drop(true).output();
    let out = timeout(CLI_TIMEOUT, fut)
        .await
        .map_err(|_| anyhow!("command timed out: {bin} {:?}", args))??;
    if !out.status.success() {
        return Err(anyhow!(
            "command failed: {bin} {:?}: {}",
            args,
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim_end().to_string())
}

fn semver_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"v?(\d+)\.(\d+)(?:\.(\d+))?").expect("static regex"))
}

/// Accepts `2.24.6`, `v2.20.3-desktop.1`, or `Docker Compose version v2.29.1`.
pub fn parse_version(raw: &str) -> Option<(u64, u64, u64)> {
    let caps = semver_re().captures(raw)?;
    let major = caps[1].parse().ok()?;
    let minor = caps[2].parse().ok()?;
    let patch = caps.get(3).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
    Some((major, minor, patch))
}

/// `docker compose` with the profile exported and the project root as cwd.
pub fn compose_command(meta: &DockerMeta, cwd: &Path, profile: &str) -> Command {
    let mut c = Command::new(&meta.docker_bin);
    c.current_dir(cwd).env("COMPOSE_PROFILES", profile).arg("compose");
    c
}

/// Container id backing a compose service (first replica).
pub async fn container_id(meta: &DockerMeta, cwd: &Path, profile: &str, service: &str) -> Result<String> {
    let fut = compose_command(meta, cwd, profile)
        .args(["ps", "-q", service])
        .kill_on_drop(true)
        .output();
    let out = timeout(CLI_TIMEOUT, fut)
        .await
        .map_err(|_| anyhow!("docker compose ps timed out"))??;
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("no container found for service {service}"))
}

/// Last `tail` log lines of a compose service. API first, CLI as fallback.
pub async fn tail_logs(meta: &DockerMeta, cwd: &Path, profile: &str, service: &str, tail: usize) -> Result<Vec<String>> {
    match tail_logs_api(meta, cwd, profile, service, tail).await {
        Ok(lines) => Ok(lines),
        Err(e) => {
            debug!("log tail via API failed for {service}: {e:#}");
            tail_logs_cli(meta, cwd, profile, service, tail).await
        }
    }
}

async fn tail_logs_api(meta: &DockerMeta, cwd: &Path, profile: &str, service: &str, tail: usize) -> Result<Vec<String>> {
    let id = container_id(meta, cwd, profile, service).await?;
    let docker = connect(&meta.socket_path)?;
    let opts = LogsOptionsBuilder::default()
        .stdout(true)
        .stderr(true)
        .tail(&tail.to_string())
        .build();

    let collect = async {
        let mut stream = docker.logs(&id, Some(opts));
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("reading container logs")?;
            for line in chunk.to_string().lines() {
                lines.push(line.trim_end().to_string());
            }
        }
        Ok::<_, anyhow::Error>(lines)
    };
    timeout(CLI_TIMEOUT, collect)
        .await
        .map_err(|_| anyhow!("log fetch timed out"))?
}

async fn tail_logs_cli(meta: &DockerMeta, cwd: &Path, profile: &str, service: &str, tail: usize) -> Result<Vec<String>> {
    let fut = compose_command(meta, cwd, profile)
        .args(["logs", "--no-color", "--tail", &tail.to_string(), service])
        .kill_on_drop(true)
        .output();
    let out = timeout(CLI_TIMEOUT, fut)
        .await
        .map_err(|_| anyhow!("docker compose logs timed out"))??;
    let mut lines: Vec<String> = String::from_utf8_lossy(&out.stdout)
        .lines()
        .map(|l| l.to_string())
        .collect();
    lines.extend(String::from_utf8_lossy(&out.stderr).lines().map(|l| l.to_string()));
    Ok(lines)
}

#[cfg(test)]
pub(crate) fn test_meta(available: bool, compose_version: Option<&str>) -> DockerMeta {
    DockerMeta {
        backend: "docker".to_string(),
        context_name: "default".to_string(),
        socket_path: String::new(),
        available,
        unavailable_reason: (!available).then(|| "connection refused".to_string()),
        engine_version: available.then(|| "27.0.3".to_string()),
        compose_version: compose_version.map(|s| s.to_string()),
        docker_bin: "docker".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compose_versions() {
        assert_eq!(parse_version("2.24.6"), Some((2, 24, 6)));
        assert_eq!(parse_version("v2.20.3-desktop.1"), Some((2, 20, 3)));
        assert_eq!(parse_version("Docker Compose version v2.29.1"), Some((2, 29, 1)));
        assert_eq!(parse_version("1.29"), Some((1, 29, 0)));
        assert_eq!(parse_version("garbage"), None);
    }

    #[test]
    fn classifies_colima_contexts() {
        assert_eq!(classify("colima", "unix:///Users/me/.colima/default/docker.sock"), "colima");
        assert_eq!(classify("default", "unix:///var/run/docker.sock"), "docker");
    }
}
