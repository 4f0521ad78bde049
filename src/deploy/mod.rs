//! Deploy sequencer: serialized, coalesced, cooled-down deploy runs.
//!
//! Webhook deliveries arrive in bursts (one per commit of a push, or
//! redeliveries), but a deploy run is expensive and not reentrant. The
//! sequencer guarantees at most one run at a time, collapses every
//! trigger that arrives during a run into a single follow-up run, and
//! enforces a cooldown after a run with no pending work. A trigger during
//! the run itself skips the cooldown: the code that just landed should
//! not wait for it.
//!
//! One long-lived worker task owns the run loop; triggers only flip a
//! flag and wake it, so the webhook handler returns immediately.

use std::sync::{Arc, Mutex};

use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, info};

use crate::config::DeploySettings;
use crate::util::lock::mutex_lock;

mod runtime;
mod signature;

pub use runtime::{DeployError, DeployRuntime, ShellRuntime};
pub use signature::{SIGNATURE_HEADER, SignatureError, verify};

pub const METRIC_DEPLOY_RUN_TOTAL: &str = "staffetta_deploy_run_total";
pub const METRIC_DEPLOY_FAIL_TOTAL: &str = "staffetta_deploy_fail_total";

/// What happened to one trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The trigger starts a run (now, or after a cooldown in progress).
    Started,
    /// A run or pending request already covers this trigger.
    Coalesced,
}

impl TriggerOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Coalesced => "coalesced",
        }
    }
}

enum Phase {
    Idle,
    Running,
    CoolingDown { until: Instant },
}

/// Outcome of the most recent run, kept for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
}

/// Point-in-time view served on the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DeployStatus {
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_ms: Option<u64>,
    pub pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DeployReport>,
}

struct Inner {
    phase: Phase,
    requested: bool,
    last_report: Option<DeployReport>,
}

pub struct DeploySequencer {
    inner: Mutex<Inner>,
    wakeup: Notify,
    runtime: Arc<dyn DeployRuntime>,
    settings: DeploySettings,
}

impl DeploySequencer {
    /// Create the sequencer and spawn its worker task.
    pub fn spawn(settings: DeploySettings, runtime: Arc<dyn DeployRuntime>) -> Arc<Self> {
        let sequencer = Arc::new(Self {
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                requested: false,
                last_report: None,
            }),
            wakeup: Notify::new(),
            runtime,
            settings,
        });
        tokio::spawn(Arc::clone(&sequencer).worker());
        sequencer
    }

    /// Request a deploy. Never blocks; the worker picks the request up.
    pub fn trigger(&self) -> TriggerOutcome {
        let outcome = {
            let mut inner = mutex_lock(&self.inner, "deploy", "trigger");
            let outcome = if matches!(inner.phase, Phase::Idle) && !inner.requested {
                TriggerOutcome::Started
            } else {
                TriggerOutcome::Coalesced
            };
            inner.requested = true;
            outcome
        };
        self.wakeup.notify_one();
        info!(outcome = outcome.as_str(), "Deploy triggered");
        outcome
    }

    pub fn status(&self) -> DeployStatus {
        let inner = mutex_lock(&self.inner, "deploy", "status");
        let (state, cooldown_remaining_ms) = match inner.phase {
            Phase::Idle => ("idle", None),
            Phase::Running => ("running", None),
            Phase::CoolingDown { until } => (
                "cooling_down",
                Some(until.saturating_duration_since(Instant::now()).as_millis() as u64),
            ),
        };
        DeployStatus {
            state,
            cooldown_remaining_ms,
            pending: inner.requested,
            last_run: inner.last_report.clone(),
        }
    }

    async fn worker(self: Arc<Self>) {
        loop {
            self.wakeup.notified().await;
            while self.take_request() {
                self.set_phase(Phase::Running);
                let report = self.run_once().await;
                counter!(METRIC_DEPLOY_RUN_TOTAL).increment(1);
                if !report.succeeded {
                    counter!(METRIC_DEPLOY_FAIL_TOTAL).increment(1);
                }
                self.store_report(report);

                // A request that arrived mid-run skips the cooldown.
                if self.request_pending() {
                    continue;
                }
                let until = Instant::now() + self.settings.cooldown;
                self.set_phase(Phase::CoolingDown { until });
                tokio::time::sleep_until(until).await;
            }
            self.set_phase(Phase::Idle);
        }
    }

    async fn run_once(&self) -> DeployReport {
        info!("Deploy run starting");
        let result = self.run_steps().await;
        let finished_at = OffsetDateTime::now_utc();
        match result {
            Ok(()) => {
                info!("Deploy run complete");
                DeployReport {
                    succeeded: true,
                    failed_step: None,
                    error: None,
                    finished_at,
                }
            }
            Err((step, err)) => {
                error!(step, error = %err, "Deploy run failed");
                DeployReport {
                    succeeded: false,
                    failed_step: Some(step),
                    error: Some(err.to_string()),
                    finished_at,
                }
            }
        }
    }

    /// Pull and build run before any container is touched, so a broken
    /// checkout or build leaves the old containers serving.
    async fn run_steps(&self) -> Result<(), (String, DeployError)> {
        self.runtime
            .pull_latest()
            .await
            .map_err(|err| ("pull".to_string(), err))?;
        self.runtime
            .build_image()
            .await
            .map_err(|err| ("build".to_string(), err))?;
        for target in &self.settings.targets {
            self.runtime
                .stop_container(target)
                .await
                .map_err(|err| (format!("stop {}", target.name), err))?;
            self.runtime
                .start_container(target)
                .await
                .map_err(|err| (format!("start {}", target.name), err))?;
        }
        Ok(())
    }

    fn take_request(&self) -> bool {
        let mut inner = mutex_lock(&self.inner, "deploy", "take_request");
        std::mem::take(&mut inner.requested)
    }

    fn request_pending(&self) -> bool {
        mutex_lock(&self.inner, "deploy", "request_pending").requested
    }

    fn set_phase(&self, phase: Phase) {
        mutex_lock(&self.inner, "deploy", "set_phase").phase = phase;
    }

    fn store_report(&self, report: DeployReport) {
        mutex_lock(&self.inner, "deploy", "store_report").last_report = Some(report);
    }
}
