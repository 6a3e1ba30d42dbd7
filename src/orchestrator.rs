//! One startup run: preflight, launch, verify (with seeding gated on the
//! datastore), then either the summary or diagnostics.

use crate::config::{Profile, RunConfig};
use crate::datastore::ComposePsql;
use crate::diagnostics::{DiagnosticsReporter, LogPolicy};
use crate::docker::DockerMeta;
use crate::error::{LaunchError, PreflightError, StackError};
use crate::health::probe::LiveProbe;
use crate::health::{ConsoleStatus, HealthRunResult, HealthVerifier, PollSettings};
use crate::launcher;
use crate::output;
use crate::ports;
use crate::preflight;
use crate::seed::{AutoSeeder, SeedOutcome, SeedState, ShellSeed};
use crate::summary;
use crossterm::style::Stylize;
use std::future::Future;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ready,
    Unhealthy,
    Interrupted,
}

impl Outcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Ready => 0,
            Outcome::Unhealthy => 1,
            Outcome::Interrupted => 130,
        }
    }
}

impl From<&HealthRunResult> for Outcome {
    fn from(result: &HealthRunResult) -> Self {
        if result.passed() {
            Outcome::Ready
        } else {
            Outcome::Unhealthy
        }
    }
}

/// Datastore first, then the seeder, then every other service.
pub async fn verify_stack(mut verifier: HealthVerifier<'_>, seeder: &AutoSeeder<'_>) -> (HealthRunResult, SeedState) {
    let datastore = verifier.verify_datastore().await;
    let seed = seeder.run(datastore).await;
    match &seed.outcome {
        SeedOutcome::Seeded => output::success("Seeded the empty datastore"),
        SeedOutcome::Failed(e) => output::step(&format!("{} auto-seed: {e}", "warning:".yellow())),
        other => debug!(enabled = seed.enabled, empty = ?seed.datastore_empty, outcome = %other, "auto-seed"),
    }
    verifier.verify_remaining().await;
    (verifier.finish(), seed)
}

pub async fn run(cfg: &RunConfig) -> Result<Outcome, StackError> {
    let t = &cfg.tunables;
    output::heading(&format!("Starting local stack (profile '{}')", cfg.profile.name));
    info!(root = %cfg.root.display(), overlay = %cfg.profile.overlay_path.display(), "profile resolved");

    let meta = DockerMeta::detect(&cfg.root, &cfg.docker_bin).await;
    let report = preflight::run(&meta, &cfg.profile).await.inspect_err(|e| {
        if let PreflightError::PortConflict { conflicts } = e {
            eprintln!("{}", ports::format_conflicts(conflicts, cfg.profile.name.as_str()));
        }
    })?;
    for w in &report.warnings {
        output::step(&format!("{} {w}", "warning:".yellow()));
    }
    output::success(&format!(
        "Preflight passed ({}, {} port(s) free)",
        meta.context_name,
        report.bindings.len()
    ));

    let probe = LiveProbe::new(
        Box::new(ComposePsql::new(&meta, cfg.root.clone(), &cfg.profile, t.attempt_timeout)),
        t.attempt_timeout,
    )?;
    let seed_sql = ComposePsql::new(&meta, cfg.root.clone(), &cfg.profile, t.attempt_timeout);
    let procedure = ShellSeed::for_profile(&cfg.profile, &meta.docker_bin, cfg.root.clone(), t.launch_timeout);
    let seeder = AutoSeeder {
        enabled: t.auto_seed,
        reference_table: cfg.profile.seed_reference_table(),
        sql: &seed_sql,
        procedure: &procedure,
    };
    let settings = PollSettings {
        timeout: t.timeout,
        interval: t.interval,
        attempt_timeout: t.attempt_timeout,
    };
    let mut sink = ConsoleStatus;

    let work = async {
        launcher::launch(&meta, cfg).await?;
        output::heading("Health verification");
        let verifier = HealthVerifier::new(&probe, settings, &cfg.profile, &mut sink);
        Ok::<_, LaunchError>(verify_stack(verifier, &seeder).await)
    };

    let (result, seed) = match until_shutdown(work, ctrl_c()).await {
        Some(Ok(done)) => done,
        Some(Err(e)) => {
            print_launch_output(&e);
            return Err(e.into());
        }
        None => return Ok(interrupted(&cfg.profile)),
    };

    let outcome = Outcome::from(&result);
    if outcome == Outcome::Ready {
        output::success("All services healthy");
        println!("{}", summary::render(&cfg.profile, &result, &seed));
    } else {
        DiagnosticsReporter {
            meta: &meta,
            root: &cfg.root,
            profile: &cfg.profile,
            log_lines: t.log_lines,
            policy: LogPolicy::decide(t.show_logs, output::stdin_is_interactive()),
        }
        .report(&result, &seed)
        .await;
    }
    Ok(outcome)
}

/// Drive `work` until it finishes or `shutdown` fires. On shutdown `work` is
/// dropped; processes it spawned keep running.
pub async fn until_shutdown<T>(work: impl Future<Output = T>, shutdown: impl Future<Output = ()>) -> Option<T> {
    tokio::select! {
        done = work => Some(done),
        () = shutdown => None,
    }
}

/// Resolves on Ctrl-C. Never resolves if the handler can't be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        debug!("ctrl-c handler unavailable: {e}");
        std::future::pending::<()>().await;
    }
}

fn interrupted(profile: &Profile) -> Outcome {
    output::failure("Interrupted. Monitoring stopped; launched services keep running.");
    output::next_steps(&[
        format!("COMPOSE_PROFILES={} docker compose ps", profile.name),
        format!("COMPOSE_PROFILES={} docker compose down", profile.name),
    ]);
    Outcome::Interrupted
}

fn print_launch_output(err: &LaunchError) {
    let LaunchError::LaunchFailed { output, .. } = err;
    if output.is_empty() {
        return;
    }
    eprintln!("----- compose output -----");
    for line in output {
        eprintln!("{line}");
    }
    eprintln!("--------------------------");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_profile, ProfileName, ServiceId};
    use crate::diagnostics;
    use crate::health::testing::{settings, RecordingSink, ScriptedProbe};
    use crate::health::CheckState;
    use crate::seed::testing::{seeder, FakeTable};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[test]
    fn exit_codes() {
        assert_eq!(Outcome::Ready.exit_code(), 0);
        assert_eq!(Outcome::Unhealthy.exit_code(), 1);
        assert_eq!(Outcome::Interrupted.exit_code(), 130);
    }

    #[tokio::test(start_paused = true)]
    async fn minimal_profile_all_healthy_seeds_an_empty_datastore() {
        let profile = test_profile(ProfileName::Minimal, &[]);
        let probe = ScriptedProbe::new()
            .succeed_at(ServiceId::Db, 2)
            .succeed_at(ServiceId::Api, 1);
        let table = FakeTable::with_rows(0);
        let mut sink = RecordingSink::default();

        let verifier = HealthVerifier::new(&probe, settings(10, 2), &profile, &mut sink);
        let (result, seed) = verify_stack(verifier, &seeder(&table, true)).await;

        assert_eq!(Outcome::from(&result), Outcome::Ready);
        assert_eq!(Outcome::from(&result).exit_code(), 0);
        assert_eq!(seed.outcome, SeedOutcome::Seeded);
        assert_eq!(seed.datastore_empty, Some(true));
        assert_eq!(table.seed_calls.load(Ordering::SeqCst), 1);
        assert_eq!(probe.calls_for(ServiceId::Cache), 0);
        assert_eq!(probe.calls_for(ServiceId::Ui), 0);

        let text = summary::render(&profile, &result, &seed);
        assert!(text.contains("cache      not started"));
        assert!(text.contains("UI         not started"));
        assert!(text.contains("Seed: seeded empty datastore"));
    }

    #[tokio::test(start_paused = true)]
    async fn full_profile_with_a_dead_cache_fails_only_the_cache() {
        let profile = test_profile(ProfileName::Full, &[]);
        let probe = ScriptedProbe::new()
            .succeed_at(ServiceId::Db, 1)
            .succeed_at(ServiceId::Api, 1)
            .succeed_at(ServiceId::Ui, 1);
        let table = FakeTable::with_rows(5);
        let mut sink = RecordingSink::default();

        let verifier = HealthVerifier::new(&probe, settings(6, 2), &profile, &mut sink);
        let (result, seed) = verify_stack(verifier, &seeder(&table, false)).await;

        assert_eq!(Outcome::from(&result), Outcome::Unhealthy);
        assert_eq!(result.failed_services(), vec![ServiceId::Cache]);
        assert_eq!(result.state(ServiceId::Ui), CheckState::Healthy);
        assert_eq!(probe.calls_for(ServiceId::Cache), 3);
        assert_eq!(seed.outcome, SeedOutcome::Disabled);
        assert_eq!(table.rows(), 5);

        let text = diagnostics::render(&result, &profile, &seed);
        assert!(text.contains("cache (cache) checklist:"));
        assert!(!text.contains("API (api) checklist:"));
        assert!(text.contains("docker compose down"));
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_datastore_skips_seeding_but_checks_the_rest() {
        let profile = test_profile(ProfileName::Minimal, &[]);
        let probe = ScriptedProbe::new().succeed_at(ServiceId::Api, 1);
        let table = FakeTable::with_rows(0);
        let mut sink = RecordingSink::default();

        let verifier = HealthVerifier::new(&probe, settings(4, 2), &profile, &mut sink);
        let (result, seed) = verify_stack(verifier, &seeder(&table, true)).await;

        assert_eq!(seed.outcome, SeedOutcome::DatastoreUnhealthy);
        assert_eq!(table.seed_calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.state(ServiceId::Api), CheckState::Healthy);
        assert_eq!(result.failed_services(), vec![ServiceId::Db]);
    }

    #[tokio::test]
    async fn finished_work_wins_over_a_pending_shutdown() {
        assert_eq!(until_shutdown(async { 7 }, std::future::pending()).await, Some(7));
        assert_eq!(until_shutdown(std::future::pending::<u8>(), async {}).await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interrupt_stops_monitoring_but_not_the_launched_child() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("up");
        let script = format!("sleep 1; echo starting; echo starting >&2; touch '{}'", marker.display());

        let work = crate::tasks::run_shell(&script, dir.path(), Duration::from_secs(30), 10);
        let shutdown = tokio::time::sleep(Duration::from_millis(200));
        assert!(until_shutdown(work, shutdown).await.is_none());

        let profile = test_profile(ProfileName::Minimal, &[]);
        assert_eq!(interrupted(&profile), Outcome::Interrupted);
        assert_eq!(interrupted(&profile).exit_code(), 130);

        for _ in 0..50 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(marker.exists(), "launched child was cut off by the interrupt");
    }
}
