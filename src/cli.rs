use crate::config::Tunables;
use clap::builder::BoolishValueParser;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Bring the local stack up and wait until every service in the profile is healthy.
#[derive(Parser, Debug, Clone)]
#[command(name = "stackup", version, about)]
pub struct Cli {
    /// Profile to start: minimal (db + api) or full (db + api + cache + ui)
    #[arg(env = "STACK_PROFILE", default_value = "full")]
    pub profile: String,

    /// Project directory (defaults to the nearest parent with a compose file)
    #[arg(long, env = "STACK_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    /// Per-service health timeout in seconds
    #[arg(long, env = "HEALTH_TIMEOUT", default_value_t = 120)]
    pub timeout: u64,

    /// Seconds between health check attempts
    #[arg(long, env = "HEALTH_INTERVAL", default_value_t = 2)]
    pub interval: u64,

    /// Upper bound for a single health check attempt, in seconds
    #[arg(long, env = "HEALTH_ATTEMPT_TIMEOUT", default_value_t = 5)]
    pub attempt_timeout: u64,

    /// Upper bound for `docker compose up`, in seconds
    #[arg(long, env = "LAUNCH_TIMEOUT", default_value_t = 300)]
    pub launch_timeout: u64,

    /// Print log excerpts for failing services without asking (for CI)
    #[arg(long, env = "SHOW_LOGS_ON_FAILURE", value_parser = BoolishValueParser::new(),
          num_args = 0..=1, require_equals = true, default_value = "false", default_missing_value = "true")]
    pub show_logs: bool,

    /// Seed the datastore when its reference table is empty
    #[arg(long, env = "AUTO_SEED", value_parser = BoolishValueParser::new(),
          num_args = 0..=1, require_equals = true, default_value = "false", default_missing_value = "true")]
    pub auto_seed: bool,

    /// Number of log lines to show per failing service
    #[arg(long, env = "LOG_LINES", default_value_t = 50)]
    pub log_lines: usize,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn tunables(&self) -> Tunables {
        Tunables {
            timeout: Duration::from_secs(self.timeout),
            interval: Duration::from_secs(self.interval),
            attempt_timeout: Duration::from_secs(self.attempt_timeout),
            launch_timeout: Duration::from_secs(self.launch_timeout),
            show_logs: self.show_logs,
            auto_seed: self.auto_seed,
            log_lines: self.log_lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_map_to_tunables() {
        let cli = Cli::try_parse_from([
            "stackup",
            "minimal",
            "--timeout",
            "30",
            "--interval",
            "1",
            "--show-logs",
            "--auto-seed=false",
        ])
        .unwrap();
        assert_eq!(cli.profile, "minimal");
        let t = cli.tunables();
        assert_eq!(t.timeout, Duration::from_secs(30));
        assert_eq!(t.interval, Duration::from_secs(1));
        assert!(t.show_logs);
        assert!(!t.auto_seed);
    }

    #[test]
    fn bare_bool_flag_leaves_the_profile_positional_alone() {
        let cli = Cli::try_parse_from(["stackup", "--show-logs", "minimal"]).unwrap();
        assert_eq!(cli.profile, "minimal");
        assert!(cli.show_logs);

        let cli = Cli::try_parse_from(["stackup", "--auto-seed", "full", "--show-logs=no"]).unwrap();
        assert_eq!(cli.profile, "full");
        assert!(cli.auto_seed);
        assert!(!cli.show_logs);
    }
}
