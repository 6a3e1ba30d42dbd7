//! Empty-database bootstrap. Never merges into a datastore that already has data.

use crate::config::{Profile, ServiceId};
use crate::datastore::{self, SqlRunner};
use crate::error::SeedError;
use crate::health::CheckState;
use crate::tasks::{self, TaskStatus};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedOutcome {
    Disabled,
    DatastoreUnhealthy,
    AlreadyPopulated(u64),
    Seeded,
    Failed(SeedError),
}

impl fmt::Display for SeedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedOutcome::Disabled => write!(f, "auto-seed disabled"),
            SeedOutcome::DatastoreUnhealthy => write!(f, "skipped (datastore not healthy)"),
            SeedOutcome::AlreadyPopulated(n) => write!(f, "skipped (reference table has {n} row(s))"),
            SeedOutcome::Seeded => write!(f, "seeded empty datastore"),
            SeedOutcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedState {
    pub enabled: bool,
    pub datastore_empty: Option<bool>,
    pub outcome: SeedOutcome,
}

/// The external procedure that loads baseline data.
#[async_trait]
pub trait SeedProcedure: Send + Sync {
    async fn run(&self) -> Result<(), SeedError>;
}

/// Runs a shell command from the project root.
pub struct ShellSeed {
    pub command: String,
    pub cwd: PathBuf,
    pub limit: Duration,
}

impl ShellSeed {
    /// `SEED_COMMAND` if set, otherwise `psql -f $SEED_FILE` inside the datastore container.
    pub fn for_profile(profile: &Profile, docker_bin: &str, cwd: PathBuf, limit: Duration) -> Self {
        let command = profile.seed_command().unwrap_or_else(|| {
            format!(
                "COMPOSE_PROFILES={} {} compose exec -T -e {} {} psql -X -v ON_ERROR_STOP=1 -U {} -d {} -f {}",
                profile.name,
                shell_quote(docker_bin),
                shell_quote(&format!("PGPASSWORD={}", profile.db.password)),
                shell_quote(&profile.compose_service(ServiceId::Db)),
                shell_quote(&profile.db.user),
                shell_quote(&profile.db.name),
                shell_quote(&profile.seed_file())
            )
        });
        Self { command, cwd, limit }
    }
}

/// Single-quote `word` for `sh` unless it is made only of characters the shell
/// leaves alone.
fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[async_trait]
impl SeedProcedure for ShellSeed {
    async fn run(&self) -> Result<(), SeedError> {
        let out = tasks::run_shell(&self.command, &self.cwd, self.limit, 20)
            .await
            .map_err(|e| SeedError::ProcedureFailed(format!("{e:#}")))?;
        match out.status {
            TaskStatus::Ok => Ok(()),
            TaskStatus::Fail(code) => {
                let tail = out.lines.last().cloned().unwrap_or_default();
                Err(SeedError::ProcedureFailed(format!(
                    "exit {} {tail}",
                    code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string())
                )))
            }
            TaskStatus::TimedOut => Err(SeedError::ProcedureFailed(format!(
                "timed out after {}s",
                self.limit.as_secs()
            ))),
        }
    }
}

pub struct AutoSeeder<'a> {
    pub enabled: bool,
    pub reference_table: String,
    pub sql: &'a dyn SqlRunner,
    pub procedure: &'a dyn SeedProcedure,
}

impl AutoSeeder<'_> {
    /// Seed only when enabled, the datastore is healthy, and the reference table is empty.
    /// Failures are logged and returned as an outcome, never as an error.
    pub async fn run(&self, datastore: CheckState) -> SeedState {
        let mut state = SeedState {
            enabled: self.enabled,
            datastore_empty: None,
            outcome: SeedOutcome::Disabled,
        };
        if !self.enabled {
            return state;
        }
        if datastore != CheckState::Healthy {
            state.outcome = SeedOutcome::DatastoreUnhealthy;
            return state;
        }

        let rows = match self.count_rows().await {
            Ok(n) => n,
            Err(e) => {
                warn!("auto-seed skipped: {e}");
                state.outcome = SeedOutcome::Failed(e);
                return state;
            }
        };
        state.datastore_empty = Some(rows == 0);
        if rows > 0 {
            debug!(table = %self.reference_table, rows, "datastore already populated");
            state.outcome = SeedOutcome::AlreadyPopulated(rows);
            return state;
        }

        info!(table = %self.reference_table, "reference table empty, seeding");
        state.outcome = match self.procedure.run().await {
            Ok(()) => SeedOutcome::Seeded,
            Err(e) => {
                warn!("auto-seed failed (continuing): {e}");
                SeedOutcome::Failed(e)
            }
        };
        state
    }

    async fn count_rows(&self) -> Result<u64, SeedError> {
        if !datastore::valid_identifier(&self.reference_table) {
            return Err(SeedError::InvalidTable(self.reference_table.clone()));
        }
        let out = self
            .sql
            .query(&datastore::count_rows_sql(&self.reference_table))
            .await
            .map_err(|e| SeedError::CountFailed {
                table: self.reference_table.clone(),
                reason: format!("{e:#}"),
            })?;
        out.trim().parse::<u64>().map_err(|_| SeedError::CountFailed {
            table: self.reference_table.clone(),
            reason: format!("unexpected count '{}'", out.trim()),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::config::{test_profile, ProfileName};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn populated_table_is_never_touched_whatever_the_flag() {
        for enabled in [true, false] {
            let table = FakeTable::with_rows(3);
            let state = seeder(&table, enabled).run(CheckState::Healthy).await;
            assert_eq!(table.rows(), 3);
            assert_eq!(table.seed_calls.load(Ordering::SeqCst), 0);
            assert_ne!(state.outcome, SeedOutcome::Seeded);
        }
    }

    #[tokio::test]
    async fn seeds_empty_table_when_enabled() {
        let table = FakeTable::with_rows(0);
        let state = seeder(&table, true).run(CheckState::Healthy).await;
        assert_eq!(state.outcome, SeedOutcome::Seeded);
        assert_eq!(state.datastore_empty, Some(true));
        assert_eq!(table.rows(), 10);
    }

    #[tokio::test]
    async fn disabled_or_unhealthy_datastore_does_nothing() {
        let table = FakeTable::with_rows(0);
        assert_eq!(seeder(&table, false).run(CheckState::Healthy).await.outcome, SeedOutcome::Disabled);
        assert_eq!(
            seeder(&table, true).run(CheckState::Unhealthy).await.outcome,
            SeedOutcome::DatastoreUnhealthy
        );
        assert_eq!(table.seed_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn seed_failure_is_swallowed() {
        let table = FakeTable {
            fail_seed: true,
            ..FakeTable::default()
        };
        let state = seeder(&table, true).run(CheckState::Healthy).await;
        assert!(matches!(state.outcome, SeedOutcome::Failed(SeedError::ProcedureFailed(_))));
    }

    #[tokio::test]
    async fn count_failure_skips_seeding() {
        let table = FakeTable {
            fail_count: true,
            ..FakeTable::default()
        };
        let state = seeder(&table, true).run(CheckState::Healthy).await;
        assert!(matches!(state.outcome, SeedOutcome::Failed(SeedError::CountFailed { .. })));
        assert_eq!(table.seed_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejects_unsafe_table_names() {
        let table = FakeTable::with_rows(0);
        let s = AutoSeeder {
            reference_table: "users; DROP TABLE users".to_string(),
            ..seeder(&table, true)
        };
        let state = s.run(CheckState::Healthy).await;
        assert!(matches!(state.outcome, SeedOutcome::Failed(SeedError::InvalidTable(_))));
    }

    #[test]
    fn default_seed_command_runs_psql_in_the_db_container() {
        let p = test_profile(ProfileName::Minimal, &[("DB_SERVICE", "postgres")]);
        let s = ShellSeed::for_profile(&p, "docker", PathBuf::from("."), Duration::from_secs(60));
        assert!(s.command.contains("compose exec -T"));
        assert!(s.command.contains("postgres psql"));
        assert!(s.command.ends_with("-f /docker-entrypoint-initdb.d/seed.sql"));

        let custom = test_profile(ProfileName::Minimal, &[("SEED_COMMAND", "make seed")]);
        let s = ShellSeed::for_profile(&custom, "docker", PathBuf::from("."), Duration::from_secs(60));
        assert_eq!(s.command, "make seed");
    }

    #[test]
    fn default_seed_command_quotes_awkward_values() {
        let p = test_profile(
            ProfileName::Minimal,
            &[
                ("SEED_FILE", "/seed data/o'neil.sql"),
                ("DB_USER", "app user"),
                ("DB_PASSWORD", "pa$$ word"),
            ],
        );
        let s = ShellSeed::for_profile(&p, "/opt/my docker/docker", PathBuf::from("."), Duration::from_secs(60));
        assert!(s.command.contains("minimal '/opt/my docker/docker' compose"), "{}", s.command);
        assert!(s.command.contains("-e 'PGPASSWORD=pa$$ word'"), "{}", s.command);
        assert!(s.command.contains("-U 'app user' -d app"), "{}", s.command);
        assert!(s.command.ends_with(r"-f '/seed data/o'\''neil.sql'"), "{}", s.command);
    }

    #[cfg(unix)]
    #[test]
    fn quoted_words_survive_the_shell() {
        for word in ["/seed data/o'neil.sql", "$(touch x)", "a;b", "", "plain.sql"] {
            let out = std::process::Command::new("sh")
                .arg("-c")
                .arg(format!("printf %s {}", shell_quote(word)))
                .output()
                .unwrap();
            assert_eq!(String::from_utf8_lossy(&out.stdout), word);
        }
    }
}
