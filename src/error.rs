use crate::config::ServiceId;
use crate::ports::PortBinding;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown profile '{given}' (valid profiles: {})", valid.join(", "))]
    ProfileNotFound { given: String, valid: Vec<&'static str> },

    #[error("profile '{profile}' configuration is invalid: {reason}")]
    ProfileConfigInvalid { profile: String, reason: String },

    #[error("invalid setting {name}: {reason}")]
    InvalidTunable { name: &'static str, reason: String },
}

impl ConfigError {
    pub fn next_steps(&self) -> Vec<String> {
        match self {
            ConfigError::ProfileNotFound { valid, .. } => valid
                .iter()
                .map(|p| format!("stackup {p}"))
                .collect(),
            ConfigError::ProfileConfigInvalid { profile, .. } => vec![
                format!("$EDITOR .env.{profile}"),
                format!("grep -v '^#' .env.{profile}"),
            ],
            ConfigError::InvalidTunable { name, .. } => {
                vec![format!("stackup --help   # see the accepted range for {name}")]
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum PreflightError {
    #[error("container runtime is not reachable ({detail})")]
    RuntimeUnavailable { detail: String, backend: String },

    #[error("{} port conflict(s) detected, nothing was launched", conflicts.len())]
    PortConflict { conflicts: Vec<PortBinding> },
}

impl PreflightError {
    pub fn next_steps(&self, profile: &str) -> Vec<String> {
        match self {
            PreflightError::RuntimeUnavailable { backend, .. } if backend == "colima" => vec![
                "colima start".to_string(),
                "docker context use colima".to_string(),
                "docker ps".to_string(),
            ],
            PreflightError::RuntimeUnavailable { .. } => vec![
                "docker info".to_string(),
                "docker context ls".to_string(),
                "sudo systemctl start docker   # or start Docker Desktop".to_string(),
            ],
            PreflightError::PortConflict { conflicts } => conflicts
                .iter()
                .flat_map(|b| b.remedies(profile))
                .collect(),
        }
    }
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("docker compose up failed ({reason})")]
    LaunchFailed {
        reason: String,
        code: Option<i32>,
        output: Vec<String>,
    },
}

impl LaunchError {
    pub fn next_steps(&self, profile: &str) -> Vec<String> {
        vec![
            format!("COMPOSE_PROFILES={profile} docker compose config --services"),
            format!("COMPOSE_PROFILES={profile} docker compose up -d   # rerun to see the full output"),
            "docker compose ps -a".to_string(),
        ]
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckError {
    #[error("{service} did not become healthy after {attempts} attempt(s) within {}s{}",
        timeout.as_secs(),
        last_reason.as_ref().map(|r| format!(" (last: {r})")).unwrap_or_default())]
    TimedOut {
        service: ServiceId,
        attempts: u32,
        timeout: Duration,
        last_reason: Option<String>,
    },
}

impl HealthCheckError {
    pub fn service(&self) -> ServiceId {
        match self {
            HealthCheckError::TimedOut { service, .. } => *service,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SeedError {
    #[error("invalid reference table name '{0}'")]
    InvalidTable(String),

    #[error("could not count rows in {table}: {reason}")]
    CountFailed { table: String, reason: String },

    #[error("seed procedure failed: {0}")]
    ProcedureFailed(String),
}

/// Fatal errors: any of these aborts the run before (or instead of) health verification.
#[derive(Error, Debug)]
pub enum StackError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Preflight(#[from] PreflightError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StackError {
    pub fn next_steps(&self, profile: &str) -> Vec<String> {
        match self {
            StackError::Config(e) => e.next_steps(),
            StackError::Preflight(e) => e.next_steps(profile),
            StackError::Launch(e) => e.next_steps(profile),
            StackError::Internal(_) => vec![format!("stackup {profile} --verbose")],
        }
    }
}
