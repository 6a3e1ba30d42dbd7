use crate::config::{Profile, ServiceId};
use crate::docker::{self, DockerMeta};
use crate::health::{CheckState, HealthRunResult};
use crate::output;
use crate::seed::{SeedOutcome, SeedState};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remediation {
    pub cause: &'static str,
    pub command: &'static str,
}

const fn fix(cause: &'static str, command: &'static str) -> Remediation {
    Remediation { cause, command }
}

// `{compose}` is `docker compose` scoped to the active profile, `{service}` the
// compose service name, `{port}` the published port, `{path}` its health path.
const DB_CHECKLIST: &[Remediation] = &[
    fix("container exited or is restarting", "{compose} ps {service}"),
    fix("initialisation still running or failed", "{compose} logs --tail 100 {service}"),
    fix("DB_NAME/DB_USER/DB_PASSWORD differ from the initialised volume", "{compose} down -v   # recreates the data volume"),
    fix("schema migrations not applied", "{compose} exec {service} psql -U $DB_USER -d $DB_NAME -c '\\dt'"),
];

const API_CHECKLIST: &[Remediation] = &[
    fix("API crashed on boot (bad env, missing migration)", "{compose} logs --tail 100 {service}"),
    fix("readiness endpoint not answering", "curl -sS http://localhost:{port}{path}"),
    fix("API cannot reach the datastore", "{compose} exec {service} env | grep DB_"),
    fix("image out of date", "{compose} build {service} && {compose} up -d {service}"),
];

const CACHE_CHECKLIST: &[Remediation] = &[
    fix("cache container not running", "{compose} ps {service}"),
    fix("cache refusing connections", "{compose} exec {service} redis-cli ping"),
    fix("API configured with the wrong cache host/port", "{compose} exec {api_service} env | grep -i cache"),
    fix("cache out of memory or crash-looping", "{compose} logs --tail 100 {service}"),
];

const UI_CHECKLIST: &[Remediation] = &[
    fix("dev server still compiling", "{compose} logs --tail 100 {service}"),
    fix("UI not listening on the published port", "curl -sSI http://localhost:{port}{path}"),
    fix("node_modules out of sync with the image", "{compose} build --no-cache {service}"),
];

/// Static per-service troubleshooting table.
pub fn checklist(id: ServiceId) -> &'static [Remediation] {
    match id {
        ServiceId::Db => DB_CHECKLIST,
        ServiceId::Api => API_CHECKLIST,
        ServiceId::Cache => CACHE_CHECKLIST,
        ServiceId::Ui => UI_CHECKLIST,
    }
}

/// Whether to show log excerpts for failing services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPolicy {
    Always,
    Ask,
    Never,
}

impl LogPolicy {
    pub fn decide(show_logs: bool, interactive: bool) -> Self {
        match (show_logs, interactive) {
            (true, _) => LogPolicy::Always,
            (false, true) => LogPolicy::Ask,
            (false, false) => LogPolicy::Never,
        }
    }
}

/// Fill in a checklist command for `id` under `profile`.
pub fn render_command(r: &Remediation, id: ServiceId, profile: &Profile) -> String {
    let path = match id {
        ServiceId::Api => profile.api_health_path(),
        ServiceId::Ui => profile.ui_health_path(),
        _ => String::new(),
    };
    r.command
        .replace("{compose}", &format!("COMPOSE_PROFILES={} docker compose", profile.name))
        .replace("{service}", &profile.compose_service(id))
        .replace("{api_service}", &profile.compose_service(ServiceId::Api))
        .replace("{port}", &profile.port(id).map(|p| p.to_string()).unwrap_or_default())
        .replace("{path}", &path)
}

/// Checklists for every unhealthy service, plus the seed outcome if it failed.
pub fn render(result: &HealthRunResult, profile: &Profile, seed: &SeedState) -> String {
    let mut out = Vec::new();
    out.push(format!(
        "Health verification failed for profile '{}' after {}s:",
        profile.name,
        result.elapsed.as_secs()
    ));
    for failure in &result.failures {
        out.push(format!("  - {failure}"));
    }

    for id in result.failed_services() {
        out.push(String::new());
        out.push(format!("{} ({}) checklist:", id.label(), profile.compose_service(id)));
        for (i, r) in checklist(id).iter().enumerate() {
            out.push(format!("  {}. {}", i + 1, r.cause));
            out.push(format!("     $ {}", render_command(r, id, profile)));
        }
        if let Some(note) = result.notes.get(&id) {
            out.push(format!("  note: {note}"));
        }
    }

    if let SeedOutcome::Failed(e) = &seed.outcome {
        out.push(String::new());
        out.push(format!("Auto-seed failed (non-fatal): {e}"));
    }

    out.push(String::new());
    out.push("Containers were left running for inspection.".to_string());
    out.push(format!(
        "  $ COMPOSE_PROFILES={} docker compose down   # tear the stack down",
        profile.name
    ));
    out.join("\n")
}

pub struct DiagnosticsReporter<'a> {
    pub meta: &'a DockerMeta,
    pub root: &'a Path,
    pub profile: &'a Profile,
    pub log_lines: usize,
    pub policy: LogPolicy,
}

impl DiagnosticsReporter<'_> {
    pub async fn report(&self, result: &HealthRunResult, seed: &SeedState) {
        output::heading("Diagnostics");
        eprintln!("{}", render(result, self.profile, seed));

        for id in result.failed_services() {
            if result.state(id) != CheckState::Unhealthy {
                continue;
            }
            let show = match self.policy {
                LogPolicy::Always => true,
                LogPolicy::Never => false,
                LogPolicy::Ask => output::confirm(
                    &format!("Show the last {} log lines for {}?", self.log_lines, id),
                    Duration::from_secs(30),
                ),
            };
            if show {
                self.show_logs(id).await;
            }
        }
    }

    async fn show_logs(&self, id: ServiceId) {
        let service = self.profile.compose_service(id);
        match docker::tail_logs(self.meta, self.root, self.profile.name.as_str(), &service, self.log_lines).await {
            Ok(lines) if lines.is_empty() => eprintln!("(no log output for {service})"),
            Ok(lines) => {
                eprintln!("----- last {} lines of {service} -----", lines.len());
                for l in lines {
                    eprintln!("{l}");
                }
                eprintln!("----- end of {service} -----");
            }
            Err(e) => warn!("could not fetch logs for {service}: {e:#}"),
        }
    }
}
