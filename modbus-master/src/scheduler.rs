//! Runs the polling cycle once or on a fixed period until stopped.

use crate::poller::{CycleError, CycleOutcome, PollingCycle, stop_requested};
use crate::settings::MasterSettings;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

/// Lifecycle of a [`Scheduler`]. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Poll cycle failed: {0}")]
    Cycle(#[from] CycleError),
    #[error("Scheduler cannot start from state {0:?}")]
    NotIdle(SchedulerState),
}

/// Counters for a finished scheduler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerSummary {
    /// Cycles started.
    pub cycles: u64,
    /// Cycles that could not open a session.
    pub unavailable: u64,
    /// Groups skipped across all cycles.
    pub failed_groups: u64,
}

/// Drives [`PollingCycle`]s from a single loop, so cycles never overlap.
pub struct Scheduler {
    cycle: PollingCycle,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(cycle: PollingCycle) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self { cycle, state }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` turns `true`, or once when `period` is 0.
    ///
    /// The first cycle starts immediately; later ones follow every `period`
    /// seconds. A tick that comes due while a cycle is still in flight is
    /// skipped. Only a sink failure ends the run early.
    pub async fn run(
        &self,
        settings: &MasterSettings,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SchedulerSummary, SchedulerError> {
        let mut current = SchedulerState::Idle;
        let started = self.state.send_if_modified(|state| {
            current = *state;
            if *state == SchedulerState::Idle {
                *state = SchedulerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(SchedulerError::NotIdle(current));
        }

        let result = self.run_cycles(settings, &mut shutdown).await;
        self.state.send_replace(SchedulerState::Stopped);

        match &result {
            Ok(summary) => info!(
                cycles = summary.cycles,
                unavailable = summary.unavailable,
                failed_groups = summary.failed_groups,
                "Scheduler stopped"
            ),
            Err(e) => error!(error = %e, "Scheduler stopped on error"),
        }

        result
    }

    async fn run_cycles(
        &self,
        settings: &MasterSettings,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SchedulerSummary, SchedulerError> {
        let mut summary = SchedulerSummary::default();

        let Some(period) = settings.poll_period() else {
            info!("Running a single poll cycle");
            self.tick(settings, shutdown, &mut summary).await?;
            return Ok(summary);
        };

        info!(period_secs = settings.period, "Starting periodic polling");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(shutdown) => {
                    debug!("Stop requested");
                    break;
                }
                _ = ticker.tick() => {}
            }

            self.tick(settings, shutdown, &mut summary).await?;
        }

        Ok(summary)
    }

    async fn tick(
        &self,
        settings: &MasterSettings,
        shutdown: &mut watch::Receiver<bool>,
        summary: &mut SchedulerSummary,
    ) -> Result<(), SchedulerError> {
        summary.cycles += 1;
        debug!(cycle = summary.cycles, "Poll cycle starting");

        match self.cycle.run(settings, shutdown).await? {
            CycleOutcome::Saved(report) => {
                summary.failed_groups += report.failed_groups.len() as u64;
            }
            CycleOutcome::SessionUnavailable => summary.unavailable += 1,
        }

        Ok(())
    }
}
