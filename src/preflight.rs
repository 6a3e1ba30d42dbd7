use crate::config::Profile;
use crate::docker::{self, DockerMeta};
use crate::error::PreflightError;
use crate::ports::{self, PortBinding};
use tracing::{info, warn};

/// Oldest compose release that scopes `up` to the listed services reliably under profiles.
pub const MIN_COMPOSE_VERSION: (u64, u64, u64) = (2, 20, 0);

#[derive(Debug, Clone)]
pub struct PreflightReport {
    pub bindings: Vec<PortBinding>,
    pub warnings: Vec<String>,
}

pub fn check_runtime(meta: &DockerMeta) -> Result<(), PreflightError> {
    if meta.available {
        info!(
            context = %meta.context_name,
            backend = %meta.backend,
            engine = meta.engine_version.as_deref().unwrap_or("unknown"),
            "container runtime reachable"
        );
        return Ok(());
    }
    Err(PreflightError::RuntimeUnavailable {
        detail: meta
            .unavailable_reason
            .clone()
            .unwrap_or_else(|| format!("docker context '{}' did not answer", meta.context_name)),
        backend: meta.backend.clone(),
    })
}

/// Non-fatal: returns a warning when compose is missing, unparseable or too old.
pub fn check_compose_version(meta: &DockerMeta) -> Option<String> {
    let (maj, min, pat) = MIN_COMPOSE_VERSION;
    let Some(raw) = meta.compose_version.as_deref() else {
        return Some("could not determine the docker compose version".to_string());
    };
    match docker::parse_version(raw) {
        Some(v) if v >= MIN_COMPOSE_VERSION => None,
        Some(_) => Some(format!(
            "docker compose {raw} is older than {maj}.{min}.{pat}; profile-scoped launches may start extra services"
        )),
        None => Some(format!("unrecognised docker compose version '{raw}'")),
    }
}

pub fn check_conflicts(bindings: Vec<PortBinding>) -> Result<Vec<PortBinding>, PreflightError> {
    let conflicts: Vec<PortBinding> = bindings.iter().filter(|b| b.conflict).cloned().collect();
    if conflicts.is_empty() {
        Ok(bindings)
    } else {
        Err(PreflightError::PortConflict { conflicts })
    }
}

/// Runtime reachable, compose recent enough (warning only), no port taken.
pub async fn run(meta: &DockerMeta, profile: &Profile) -> Result<PreflightReport, PreflightError> {
    check_runtime(meta)?;

    let mut warnings = Vec::new();
    if let Some(w) = check_compose_version(meta) {
        warn!("{w}");
        warnings.push(w);
    }

    let bindings = check_conflicts(ports::scan(profile).await)?;
    info!(ports = bindings.len(), "no port conflicts");

    Ok(PreflightReport { bindings, warnings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_profile, ProfileName, ServiceId};
    use crate::docker::test_meta;

    #[test]
    fn unreachable_runtime_is_fatal() {
        let err = check_runtime(&test_meta(false, Some("2.24.0"))).unwrap_err();
        assert!(matches!(err, PreflightError::RuntimeUnavailable { .. }));
        assert!(!err.next_steps("full").is_empty());
    }

    #[test]
    fn old_compose_only_warns() {
        assert!(check_compose_version(&test_meta(true, Some("2.24.6"))).is_none());
        assert!(check_compose_version(&test_meta(true, Some("v2.20.0"))).is_none());
        let w = check_compose_version(&test_meta(true, Some("2.17.3"))).unwrap();
        assert!(w.contains("older than 2.20.0"));
        assert!(check_compose_version(&test_meta(true, None)).is_some());
    }

    #[test]
    fn any_conflict_aborts() {
        let bindings = vec![
            PortBinding {
                service: ServiceId::Db,
                port: 5432,
                conflict: false,
                owner: None,
            },
            PortBinding {
                service: ServiceId::Api,
                port: 8080,
                conflict: true,
                owner: None,
            },
        ];
        match check_conflicts(bindings) {
            Err(PreflightError::PortConflict { conflicts }) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].service, ServiceId::Api);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn occupied_profile_port_blocks_the_run() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        let free_port = {
            let l = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
            l.local_addr().unwrap().port().to_string()
        };
        let profile = test_profile(ProfileName::Minimal, &[("DB_PORT", free_port.as_str()), ("API_PORT", port.as_str())]);

        let err = run(&test_meta(true, Some("2.24.0")), &profile).await.unwrap_err();
        match err {
            PreflightError::PortConflict { conflicts } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].service, ServiceId::Api);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
