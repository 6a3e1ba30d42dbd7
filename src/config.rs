use crate::env::{self, EnvMap};
use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Services of the local stack, in declared topology order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceId {
    Db,
    Api,
    Cache,
    Ui,
}

impl ServiceId {
    pub const ALL: [ServiceId; 4] = [ServiceId::Db, ServiceId::Api, ServiceId::Cache, ServiceId::Ui];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceId::Db => "db",
            ServiceId::Api => "api",
            ServiceId::Cache => "cache",
            ServiceId::Ui => "ui",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ServiceId::Db => "datastore",
            ServiceId::Api => "API",
            ServiceId::Cache => "cache",
            ServiceId::Ui => "UI",
        }
    }

    pub fn port_var(&self) -> &'static str {
        match self {
            ServiceId::Db => "DB_PORT",
            ServiceId::Api => "API_PORT",
            ServiceId::Cache => "CACHE_PORT",
            ServiceId::Ui => "UI_PORT",
        }
    }

    fn service_name_var(&self) -> &'static str {
        match self {
            ServiceId::Db => "DB_SERVICE",
            ServiceId::Api => "API_SERVICE",
            ServiceId::Cache => "CACHE_SERVICE",
            ServiceId::Ui => "UI_SERVICE",
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileName {
    Minimal,
    Full,
}

const COMMON_REQUIRED: &[&str] = &["DB_HOST", "DB_PORT", "DB_NAME", "DB_USER", "DB_PASSWORD", "API_PORT"];
const FULL_REQUIRED: &[&str] = &["UI_PORT", "CACHE_PORT"];

impl ProfileName {
    pub const ALL: [ProfileName; 2] = [ProfileName::Minimal, ProfileName::Full];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileName::Minimal => "minimal",
            ProfileName::Full => "full",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let wanted = raw.trim().to_lowercase();
        if wanted.is_empty() {
            return Ok(ProfileName::Full);
        }
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| ConfigError::ProfileNotFound {
                given: raw.trim().to_string(),
                valid: Self::ALL.iter().map(|p| p.as_str()).collect(),
            })
    }

    pub fn services(&self) -> &'static [ServiceId] {
        match self {
            ProfileName::Minimal => &[ServiceId::Db, ServiceId::Api],
            ProfileName::Full => &ServiceId::ALL,
        }
    }

    pub fn required_vars(&self) -> Vec<&'static str> {
        let mut vars = COMMON_REQUIRED.to_vec();
        if *self == ProfileName::Full {
            vars.extend_from_slice(FULL_REQUIRED);
        }
        vars
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct DbSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

/// A resolved profile. Built once, then passed by reference to every stage.
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: ProfileName,
    pub services: Vec<ServiceId>,
    pub overlay_path: PathBuf,
    pub db: DbSettings,
    ports: BTreeMap<ServiceId, u16>,
    vars: EnvMap,
}

impl Profile {
    /// Validate a merged variable map against the profile's requirements.
    pub fn from_vars(name: ProfileName, overlay_path: PathBuf, vars: EnvMap) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::ProfileConfigInvalid {
            profile: name.as_str().to_string(),
            reason,
        };

        for key in name.required_vars() {
            let present = vars.get(key).map(|v| !v.trim().is_empty()).unwrap_or(false);
            if !present {
                return Err(invalid(format!(
                    "required variable {key} is missing from {}",
                    overlay_path.display()
                )));
            }
        }

        let mut ports = BTreeMap::new();
        for id in name.services() {
            let key = id.port_var();
            let raw = vars.get(key).map(|v| v.trim()).unwrap_or_default();
            match raw.parse::<u16>() {
                Ok(p) if p > 0 => {
                    ports.insert(*id, p);
                }
                _ => return Err(invalid(format!("{key}='{raw}' is not a valid port"))),
            }
        }

        let get = |k: &str| vars.get(k).map(|v| v.trim().to_string()).unwrap_or_default();
        let db = DbSettings {
            host: get("DB_HOST"),
            port: ports[&ServiceId::Db],
            name: get("DB_NAME"),
            user: get("DB_USER"),
            password: vars.get("DB_PASSWORD").cloned().unwrap_or_default(),
        };

        Ok(Profile {
            name,
            services: name.services().to_vec(),
            overlay_path,
            db,
            ports,
            vars,
        })
    }

    pub fn includes(&self, id: ServiceId) -> bool {
        self.services.contains(&id)
    }

    pub fn port(&self, id: ServiceId) -> Option<u16> {
        self.ports.get(&id).copied()
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    /// Compose service name for a service id (`DB_SERVICE=postgres` etc.).
    pub fn compose_service(&self, id: ServiceId) -> String {
        self.var(id.service_name_var())
            .map(|s| s.to_string())
            .unwrap_or_else(|| id.as_str().to_string())
    }

    pub fn compose_services(&self) -> Vec<String> {
        self.services.iter().map(|id| self.compose_service(*id)).collect()
    }

    pub fn api_health_path(&self) -> String {
        normalize_path(self.var("API_HEALTH_PATH").unwrap_or("/health/ready"))
    }

    pub fn ui_health_path(&self) -> String {
        normalize_path(self.var("UI_HEALTH_PATH").unwrap_or("/"))
    }

    pub fn seed_reference_table(&self) -> String {
        self.var("SEED_REFERENCE_TABLE").unwrap_or("users").to_string()
    }

    pub fn expected_tables(&self) -> Vec<String> {
        match self.var("DB_EXPECTED_TABLES") {
            Some(raw) => raw
                .split(',')
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .map(|t| t.to_string())
                .collect(),
            None => vec![self.seed_reference_table()],
        }
    }

    pub fn seed_file(&self) -> String {
        self.var("SEED_FILE")
            .unwrap_or("/docker-entrypoint-initdb.d/seed.sql")
            .to_string()
    }

    pub fn seed_command(&self) -> Option<String> {
        self.var("SEED_COMMAND").map(|s| s.to_string())
    }
}

fn normalize_path(p: &str) -> String {
    if p.starts_with('/') {
        p.to_string()
    } else {
        format!("/{p}")
    }
}

/// Resolve a profile from `<root>/.env[.<profile>]`, with process env overrides.
pub fn resolve_profile(root: &Path, raw_name: &str) -> Result<Profile, ConfigError> {
    resolve_profile_with(root, raw_name, |k| std::env::var(k).ok())
}

pub fn resolve_profile_with<F>(root: &Path, raw_name: &str, lookup: F) -> Result<Profile, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let name = ProfileName::parse(raw_name)?;
    let overlay_path = root.join(env::overlay_file_name(name.as_str()));

    if !overlay_path.exists() {
        return Err(ConfigError::ProfileConfigInvalid {
            profile: name.as_str().to_string(),
            reason: format!("overlay file {} not found", overlay_path.display()),
        });
    }

    let (mut vars, loaded) =
        env::load_layers(root, name.as_str()).map_err(|e| ConfigError::ProfileConfigInvalid {
            profile: name.as_str().to_string(),
            reason: format!("{e:#}"),
        })?;
    debug!(files = ?loaded, "loaded profile overlay");

    env::apply_overrides(&mut vars, &name.required_vars(), lookup);
    env::expand_all(&mut vars);

    match vars.get("PROFILE_NAME").map(|v| v.trim()) {
        Some(declared) if declared.eq_ignore_ascii_case(name.as_str()) => {}
        Some(declared) => warn!(
            "{} declares PROFILE_NAME={declared}, expected {}",
            overlay_path.display(),
            name
        ),
        None => warn!("{} does not declare PROFILE_NAME", overlay_path.display()),
    }

    Profile::from_vars(name, overlay_path, vars)
}

/// Knobs for the run that can be changed without touching code (flags or env).
#[derive(Debug, Clone)]
pub struct Tunables {
    pub timeout: Duration,
    pub interval: Duration,
    pub attempt_timeout: Duration,
    pub launch_timeout: Duration,
    pub show_logs: bool,
    pub auto_seed: bool,
    pub log_lines: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            interval: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(5),
            launch_timeout: Duration::from_secs(300),
            show_logs: false,
            auto_seed: false,
            log_lines: 50,
        }
    }
}

impl Tunables {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("HEALTH_TIMEOUT", self.timeout),
            ("HEALTH_INTERVAL", self.interval),
            ("HEALTH_ATTEMPT_TIMEOUT", self.attempt_timeout),
            ("LAUNCH_TIMEOUT", self.launch_timeout),
        ];
        for (name, value) in nonzero {
            if value.is_zero() {
                return Err(ConfigError::InvalidTunable {
                    name,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub root: PathBuf,
    pub docker_bin: String,
    pub profile: Profile,
    pub tunables: Tunables,
}

pub fn resolve_docker_binary() -> String {
    std::env::var("DOCKER_BIN").unwrap_or_else(|_| "docker".to_string())
}

const COMPOSE_FILES: &[&str] = &["compose.yaml", "compose.yml", "docker-compose.yml", "docker-compose.yaml"];

pub fn find_project_root(start_dir: &Path) -> PathBuf {
    // Walk up until we find a compose file. A .env without one is kept as fallback.
    let mut dir = start_dir.to_path_buf();
    let mut fallback: Option<PathBuf> = None;

    for _ in 0..12 {
        if COMPOSE_FILES.iter().any(|f| dir.join(f).exists()) {
            return dir;
        }
        if dir.join(".env").exists() && fallback.is_none() {
            fallback = Some(dir.clone());
        }

        match dir.parent() {
            Some(parent) if parent != dir => dir = parent.to_path_buf(),
            _ => break,
        }
    }

    fallback.unwrap_or_else(|| start_dir.to_path_buf())
}

#[cfg(test)]
pub(crate) fn test_profile(name: ProfileName, extra: &[(&str, &str)]) -> Profile {
    let mut vars: EnvMap = [
        ("PROFILE_NAME", name.as_str()),
        ("DB_HOST", "localhost"),
        ("DB_PORT", "5432"),
        ("DB_NAME", "app"),
        ("DB_USER", "app"),
        ("DB_PASSWORD", "secret"),
        ("API_PORT", "8080"),
        ("UI_PORT", "3000"),
        ("CACHE_PORT", "6379"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for (k, v) in extra {
        vars.insert(k.to_string(), v.to_string());
    }
    Profile::from_vars(name, PathBuf::from(format!(".env.{name}")), vars).unwrap()
}
