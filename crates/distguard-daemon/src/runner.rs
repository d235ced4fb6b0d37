//! Scheduler loop.
//!
//! Wakes every poll interval, decides whether a run is due, and runs the
//! verifier on a blocking thread under a watchdog that raises an alert when
//! the run exceeds its maximum duration. The last-run timestamp is persisted
//! before the report is delivered. A failed run is logged and retried on the
//! next window; it never stops the loop.

use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone, Utc};
use distguard_core::accounts::AccountDirectory;
use distguard_core::config::{ConfigError, DistguardConfig};
use distguard_core::prelink::Unprelinker;
use distguard_core::schedule::{RunDecision, RunState, StateError};
use distguard_core::store::ManifestStore;
use distguard_core::{CancelFlag, Server, VerifyError, VerifyReport, Verifier, VerifierContext};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::sink::{ReportSink, SinkError};
use crate::trigger::TriggerFiles;

/// Errors of one scheduler step.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Configuration could not be turned into run options.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The verification run failed.
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// The run state could not be read or written.
    #[error(transparent)]
    State(#[from] StateError),

    /// A trigger flag could not be read or removed.
    #[error("trigger flag error: {0}")]
    Trigger(#[source] std::io::Error),

    /// A report sink failed.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The verification thread panicked.
    #[error("verification task panicked")]
    Panicked,
}

/// Collaborators of the scheduler.
pub struct RunnerContext {
    /// Configuration.
    pub config: DistguardConfig,
    /// Host description.
    pub server: Server,
    /// Manifest source.
    pub store: Arc<dyn ManifestStore>,
    /// Host account directory.
    pub accounts: Arc<dyn AccountDirectory>,
    /// Unprelink collaborator.
    pub unprelinker: Arc<dyn Unprelinker>,
    /// Report destinations, in delivery order.
    pub sinks: Vec<Arc<dyn ReportSink>>,
    /// Shutdown signal, also cancels a run in progress.
    pub cancel: CancelFlag,
}

/// The scheduler.
pub struct Runner {
    ctx: RunnerContext,
    triggers: TriggerFiles,
}

impl Runner {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(ctx: RunnerContext) -> Self {
        let daemon = &ctx.config.daemon;
        let triggers = TriggerFiles {
            force_file: daemon.force_file.clone(),
            no_user_dirs_file: daemon.no_user_dirs_file.clone(),
            include_user_dirs: ctx.config.verify.include_user_dirs,
        };
        Self { ctx, triggers }
    }

    /// Flag files this scheduler watches.
    #[must_use]
    pub const fn triggers(&self) -> &TriggerFiles {
        &self.triggers
    }

    /// Whether a run is due at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if flags or state cannot be read.
    pub fn decide<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Result<RunDecision, RunnerError> {
        let trigger = self.triggers.read().map_err(RunnerError::Trigger)?;
        let state = RunState::load(&self.ctx.config.daemon.state_file)?;
        Ok(self
            .ctx
            .config
            .verify
            .schedule()
            .should_run(now, state.last_run, trigger))
    }

    /// Runs one verification now and delivers its report.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the last-run timestamp is only updated
    /// after a successful verification.
    pub async fn run_once(&self, include_user_dirs: bool) -> Result<VerifyReport, RunnerError> {
        self.triggers.consume().map_err(RunnerError::Trigger)?;
        let options = self.ctx.config.verify.options(include_user_dirs)?;
        let verifier = Verifier::new(VerifierContext {
            server: self.ctx.server.clone(),
            accounts: Arc::clone(&self.ctx.accounts),
            unprelinker: Arc::clone(&self.ctx.unprelinker),
            options,
            cancel: self.ctx.cancel.clone(),
        });
        let store = Arc::clone(&self.ctx.store);
        let max_run = self.ctx.config.verify.max_run();

        info!(include_user_dirs, "starting verification run");
        let mut task = tokio::task::spawn_blocking(move || verifier.verify_server(store.as_ref()));
        let joined = tokio::select! {
            joined = &mut task => joined,
            () = tokio::time::sleep(max_run) => {
                error!(
                    max_run_secs = max_run.as_secs(),
                    "verification run exceeded its maximum duration"
                );
                task.await
            }
        };
        let report = joined.map_err(|_| RunnerError::Panicked)??;

        let state = RunState {
            last_run: Some(report.stats.finished_at.unwrap_or_else(Utc::now)),
        };
        state.save(&self.ctx.config.daemon.state_file)?;

        let mut first_failure = None;
        for sink in &self.ctx.sinks {
            if let Err(e) = sink.deliver(&report) {
                error!(error = %e, "report delivery failed");
                first_failure.get_or_insert(e);
            }
        }
        match first_failure {
            Some(e) => Err(e.into()),
            None => Ok(report),
        }
    }

    /// Runs the scheduler until cancelled.
    pub async fn run(&self) {
        let poll = self.ctx.config.daemon.poll_interval();
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(poll_secs = poll.as_secs(), "scheduler started");

        loop {
            interval.tick().await;
            if self.ctx.cancel.is_cancelled() {
                info!("scheduler shutting down");
                break;
            }
            let decision = match self.decide(&Local::now()) {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(error = %e, "cannot evaluate schedule (will retry)");
                    continue;
                },
            };
            let RunDecision::Run {
                reason,
                include_user_dirs,
            } = decision
            else {
                debug!("no run due");
                continue;
            };
            info!(?reason, "run due");
            match self.run_once(include_user_dirs).await {
                Ok(report) => info!(
                    discrepancies = report.discrepancies.len(),
                    "verification run complete"
                ),
                Err(RunnerError::Verify(VerifyError::Interrupted)) => {
                    info!("verification run interrupted");
                },
                Err(e) => error!(error = %e, "verification run failed (will retry next window)"),
            }
        }
    }
}
