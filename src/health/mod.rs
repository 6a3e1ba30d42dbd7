//! Per-service bounded-retry health verification.
//!
//! Services are checked one at a time: the datastore first, then the rest in
//! declared order. Every service gets its own timeout budget, a failure never
//! stops the remaining checks, and the pass/fail verdict is only computed once
//! every in-profile service has reached a terminal state.

pub mod probe;
pub mod readiness;

use crate::config::{Profile, ServiceId};
use crate::error::HealthCheckError;
use crate::output;
use crossterm::style::{Color, Stylize};
use probe::{CheckKind, Probe};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Pending,
    Checking,
    Healthy,
    Unhealthy,
    Skipped,
}

impl CheckState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckState::Pending => "pending",
            CheckState::Checking => "checking",
            CheckState::Healthy => "healthy",
            CheckState::Unhealthy => "unhealthy",
            CheckState::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckState::Healthy | CheckState::Unhealthy | CheckState::Skipped)
    }

    /// States only move forward: Pending -> Checking -> Healthy|Unhealthy, or Pending -> Skipped.
    pub fn can_advance_to(&self, next: CheckState) -> bool {
        matches!(
            (self, next),
            (CheckState::Pending, CheckState::Checking)
                | (CheckState::Pending, CheckState::Skipped)
                | (CheckState::Checking, CheckState::Healthy)
                | (CheckState::Checking, CheckState::Unhealthy)
        )
    }
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ServiceCheck {
    pub service: ServiceId,
    pub kind: Option<CheckKind>,
    pub state: CheckState,
}

impl ServiceCheck {
    /// Returns false (and leaves the state alone) for anything but a forward move.
    pub fn advance(&mut self, next: CheckState) -> bool {
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            warn!(service = %self.service, from = %self.state, to = %next, "rejected state regression");
            false
        }
    }
}

/// Receives one notification per distinct state change.
pub trait StatusSink {
    fn changed(&mut self, service: ServiceId, state: CheckState, detail: Option<&str>);
}

/// Timestamped, coloured status lines on stdout.
pub struct ConsoleStatus;

impl StatusSink for ConsoleStatus {
    fn changed(&mut self, service: ServiceId, state: CheckState, detail: Option<&str>) {
        let (text, color) = match state {
            CheckState::Pending => ("PENDING", Color::DarkGrey),
            CheckState::Checking => ("WAIT", Color::Yellow),
            CheckState::Healthy => ("OK", Color::Green),
            CheckState::Unhealthy => ("FAIL", Color::Red),
            CheckState::Skipped => ("SKIP", Color::DarkGrey),
        };
        let badge = format!("{text:<7}").with(color);
        let detail = detail.map(|d| format!(" ({d})")).unwrap_or_default();
        output::step(&format!("{badge} {:<6} {}{detail}", service.as_str(), service.label()));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub timeout: Duration,
    pub interval: Duration,
    pub attempt_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overall {
    Pass,
    Fail,
}

#[derive(Debug, Clone)]
pub struct HealthRunResult {
    pub overall: Overall,
    pub states: BTreeMap<ServiceId, CheckState>,
    pub attempts: BTreeMap<ServiceId, u32>,
    pub elapsed: Duration,
    pub failures: Vec<HealthCheckError>,
    pub notes: BTreeMap<ServiceId, String>,
}

impl HealthRunResult {
    pub fn passed(&self) -> bool {
        self.overall == Overall::Pass
    }

    pub fn state(&self, id: ServiceId) -> CheckState {
        self.states.get(&id).copied().unwrap_or(CheckState::Skipped)
    }

    pub fn failed_services(&self) -> Vec<ServiceId> {
        self.failures.iter().map(|f| f.service()).collect()
    }
}

/// Fold the final check states into the run verdict.
pub fn reduce(
    checks: &[ServiceCheck],
    attempts: BTreeMap<ServiceId, u32>,
    failures: Vec<HealthCheckError>,
    notes: BTreeMap<ServiceId, String>,
    elapsed: Duration,
) -> HealthRunResult {
    let states: BTreeMap<ServiceId, CheckState> = checks.iter().map(|c| (c.service, c.state)).collect();
    let overall = if states.values().any(|s| *s == CheckState::Unhealthy) {
        Overall::Fail
    } else {
        Overall::Pass
    };
    HealthRunResult {
        overall,
        states,
        attempts,
        elapsed,
        failures,
        notes,
    }
}

pub struct HealthVerifier<'a> {
    probe: &'a dyn Probe,
    settings: PollSettings,
    sink: &'a mut dyn StatusSink,
    checks: Vec<ServiceCheck>,
    attempts: BTreeMap<ServiceId, u32>,
    failures: Vec<HealthCheckError>,
    notes: BTreeMap<ServiceId, String>,
    started: Instant,
}

impl<'a> HealthVerifier<'a> {
    /// Plans one check per topology service. Out-of-profile services go straight to Skipped.
    pub fn new(probe: &'a dyn Probe, settings: PollSettings, profile: &Profile, sink: &'a mut dyn StatusSink) -> Self {
        let checks = ServiceId::ALL
            .iter()
            .map(|id| ServiceCheck {
                service: *id,
                kind: probe::check_for(profile, *id),
                state: CheckState::Pending,
            })
            .collect();

        let mut verifier = Self {
            probe,
            settings,
            sink,
            checks,
            attempts: BTreeMap::new(),
            failures: Vec::new(),
            notes: BTreeMap::new(),
            started: Instant::now(),
        };
        for id in ServiceId::ALL {
            if !profile.includes(id) {
                verifier.transition(id, CheckState::Skipped, Some("not in profile"));
            }
        }
        verifier
    }

    pub fn state(&self, id: ServiceId) -> CheckState {
        self.check(id).map(|c| c.state).unwrap_or(CheckState::Skipped)
    }

    fn check(&self, id: ServiceId) -> Option<&ServiceCheck> {
        self.checks.iter().find(|c| c.service == id)
    }

    fn transition(&mut self, id: ServiceId, next: CheckState, detail: Option<&str>) {
        let Some(check) = self.checks.iter_mut().find(|c| c.service == id) else {
            return;
        };
        if check.advance(next) {
            self.sink.changed(id, next, detail);
        }
    }

    /// The datastore goes first and on its own, so seeding can be gated on it.
    pub async fn verify_datastore(&mut self) -> CheckState {
        self.check_service(ServiceId::Db).await;
        self.state(ServiceId::Db)
    }

    /// Everything after the datastore, in declared order.
    pub async fn verify_remaining(&mut self) {
        let order: Vec<ServiceId> = self.checks.iter().map(|c| c.service).collect();
        for id in order {
            if self.state(id) == CheckState::Pending {
                self.check_service(id).await;
            }
        }
    }

    #[cfg(test)]
    pub async fn verify_all(&mut self) {
        self.verify_datastore().await;
        self.verify_remaining().await;
    }

    pub fn finish(self) -> HealthRunResult {
        reduce(
            &self.checks,
            self.attempts,
            self.failures,
            self.notes,
            self.started.elapsed(),
        )
    }

    async fn check_service(&mut self, id: ServiceId) {
        let Some(kind) = self.check(id).and_then(|c| c.kind.clone()) else {
            return;
        };
        if self.state(id) != CheckState::Pending {
            return;
        }

        let mut kind = kind;
        if let CheckKind::DependentFlag { host, fallback, .. } = kind.clone() {
            if self.host_unavailable(host).await {
                let note = format!("{host} unavailable, checked {}:{} directly", fallback.host, fallback.port);
                self.notes.insert(id, note);
                kind = CheckKind::LivenessOnly(fallback);
            }
        }
        self.poll(id, &kind).await;
    }

    /// Settles the host of a dependent-flag check first, then reports whether it failed.
    async fn host_unavailable(&mut self, host: ServiceId) -> bool {
        if !self.state(host).is_terminal() {
            if let Some(kind) = self.check(host).and_then(|c| c.kind.clone()) {
                self.poll(host, &kind).await;
            }
        }
        matches!(self.state(host), CheckState::Unhealthy | CheckState::Skipped)
    }

    async fn poll(&mut self, id: ServiceId, kind: &CheckKind) {
        let PollSettings {
            timeout,
            interval,
            attempt_timeout,
        } = self.settings;
        self.transition(id, CheckState::Checking, Some(&kind.describe()));

        let mut elapsed = Duration::ZERO;
        let mut attempts = 0u32;
        let mut last_reason: Option<String> = None;

        while elapsed < timeout {
            attempts += 1;
            let outcome = match tokio::time::timeout(attempt_timeout, self.probe.attempt(id, kind)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(format!("attempt timed out after {}s", attempt_timeout.as_secs())),
            };
            match outcome {
                Ok(()) => {
                    self.attempts.insert(id, attempts);
                    let detail = format!("attempt {attempts}");
                    self.transition(id, CheckState::Healthy, Some(&detail));
                    return;
                }
                Err(reason) => {
                    debug!(service = %id, attempt = attempts, "not ready: {reason}");
                    last_reason = Some(reason);
                }
            }
            elapsed += interval;
            if elapsed < timeout {
                tokio::time::sleep(interval).await;
            }
        }

        self.attempts.insert(id, attempts);
        let err = HealthCheckError::TimedOut {
            service: id,
            attempts,
            timeout,
            last_reason,
        };
        self.transition(id, CheckState::Unhealthy, Some(&err.to_string()));
        self.failures.push(err);
    }
}
