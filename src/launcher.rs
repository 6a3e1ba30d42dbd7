use crate::config::RunConfig;
use crate::docker::{self, DockerMeta};
use crate::error::LaunchError;
use crate::output;
use crate::tasks::{self, TaskStatus};
use tracing::info;

/// `compose up` arguments for exactly the profile's services, nothing else.
pub fn up_args(services: &[String]) -> Vec<String> {
    let mut args = vec!["up".to_string(), "-d".to_string(), "--no-deps".to_string()];
    args.extend(services.iter().cloned());
    args
}

/// Start the profile's services detached. Compose runs in its own process group,
/// so an interrupt here leaves it (and the containers) alone.
pub async fn launch(meta: &DockerMeta, cfg: &RunConfig) -> Result<(), LaunchError> {
    let services = cfg.profile.compose_services();
    output::step(&format!(
        "Launching {} service(s) for profile '{}': {}",
        services.len(),
        cfg.profile.name,
        services.join(", ")
    ));

    let mut cmd = docker::compose_command(meta, &cfg.root, cfg.profile.name.as_str());
    cmd.args(up_args(&services));

    let out = tasks::run_to_completion(cmd, cfg.tunables.launch_timeout, 40)
        .await
        .map_err(|e| LaunchError::LaunchFailed {
            reason: format!("could not run {}: {e:#}", meta.docker_bin),
            code: None,
            output: vec![],
        })?;

    match out.status {
        TaskStatus::Ok => {
            info!(services = ?services, "compose up finished");
            Ok(())
        }
        TaskStatus::Fail(code) => Err(LaunchError::LaunchFailed {
            reason: format!(
                "exit code {}",
                code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string())
            ),
            code,
            output: out.lines,
        }),
        TaskStatus::TimedOut => Err(LaunchError::LaunchFailed {
            reason: format!("timed out after {}s", cfg.tunables.launch_timeout.as_secs()),
            code: None,
            output: out.lines,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_profile, ProfileName, Tunables};
    use crate::docker::test_meta;
    use std::path::PathBuf;

    #[test]
    fn up_is_scoped_to_the_profile() {
        let p = test_profile(ProfileName::Minimal, &[("DB_SERVICE", "postgres")]);
        assert_eq!(up_args(&p.compose_services()), vec!["up", "-d", "--no-deps", "postgres", "api"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_orchestrator_is_a_launch_error() {
        let mut meta = test_meta(true, Some("2.24.0"));
        meta.docker_bin = "false".to_string();
        let cfg = RunConfig {
            root: PathBuf::from("."),
            docker_bin: "false".to_string(),
            profile: test_profile(ProfileName::Minimal, &[]),
            tunables: Tunables::default(),
        };
        match launch(&meta, &cfg).await {
            Err(LaunchError::LaunchFailed { code, .. }) => assert_eq!(code, Some(1)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_error() {
        let mut meta = test_meta(true, Some("2.24.0"));
        meta.docker_bin = "/nonexistent/docker-binary".to_string();
        let cfg = RunConfig {
            root: PathBuf::from("."),
            docker_bin: meta.docker_bin.clone(),
            profile: test_profile(ProfileName::Minimal, &[]),
            tunables: Tunables::default(),
        };
        assert!(matches!(launch(&meta, &cfg).await, Err(LaunchError::LaunchFailed { code: None, .. })));
    }
}
