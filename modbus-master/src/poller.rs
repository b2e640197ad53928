//! One polling cycle: open a session, read and decode every group, save.

use crate::decoder::{self, DecodeError};
use crate::fault_log::FaultLog;
use crate::settings::{GroupSettings, MasterSettings};
use crate::sink::{ResultSet, ResultSink, SinkError};
use crate::transport::{RegisterSession, RegisterTransport, SlaveFault};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Errors a cycle surfaces to its caller.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Failed to save results: {0}")]
    Sink(#[from] SinkError),
}

/// Why a group contributed no values.
#[derive(Debug, Error)]
enum GroupFailure {
    #[error("{0}")]
    Slave(#[from] SlaveFault),
    #[error("schema does not match the returned registers: {0}")]
    Decode(#[from] DecodeError),
}

/// What a completed cycle read and saved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Values handed to the sink.
    pub results: ResultSet,
    /// Ids of groups that were skipped after a failure.
    pub failed_groups: Vec<u32>,
    /// A stop request cut the cycle short.
    pub interrupted: bool,
}

/// Outcome of a cycle that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Groups were polled and the results saved.
    Saved(CycleReport),
    /// No session could be opened; nothing was saved.
    SessionUnavailable,
}

/// Resolve once `shutdown` holds `true`; never resolves if the sender is gone.
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Reads all groups of a settings snapshot through an injected transport and
/// hands the decoded values to the sink.
#[derive(Clone)]
pub struct PollingCycle {
    transport: Arc<dyn RegisterTransport>,
    sink: Arc<dyn ResultSink>,
    fault_log: Arc<dyn FaultLog>,
}

impl PollingCycle {
    pub fn new(
        transport: Arc<dyn RegisterTransport>,
        sink: Arc<dyn ResultSink>,
        fault_log: Arc<dyn FaultLog>,
    ) -> Self {
        Self {
            transport,
            sink,
            fault_log,
        }
    }

    /// Perform a single poll cycle.
    ///
    /// Per-group failures are logged and skipped. A stop request interrupts
    /// the pending read; values read so far are still saved.
    pub async fn run(
        &self,
        settings: &MasterSettings,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<CycleOutcome, CycleError> {
        let mut session = match self
            .transport
            .open(&settings.transport, settings.timeout())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                error!(transport = %settings.transport, error = %e, "Cannot open session");
                self.report(
                    settings,
                    &format!("Cannot connect to {}: {}", settings.transport, e),
                )
                .await;
                return Ok(CycleOutcome::SessionUnavailable);
            }
        };

        let mut report = CycleReport::default();

        for group in &settings.groups {
            let read = self.read_group(session.as_mut(), settings, group);

            let result = tokio::select! {
                biased;
                _ = stop_requested(shutdown) => {
                    info!(group = group.id, "Stop requested, skipping remaining groups");
                    report.interrupted = true;
                    break;
                }
                result = read => result,
            };

            match result {
                Ok(values) => {
                    debug!(group = group.id, values = values.len(), "Group decoded");
                    report.results.extend(values);
                }
                Err(e) => {
                    warn!(
                        group = group.id,
                        address = group.start_address,
                        error = %e,
                        "Group skipped"
                    );
                    self.report(
                        settings,
                        &format!(
                            "Group {}: reading {} registers at {} from device {} failed: {}",
                            group.id,
                            group.register_count,
                            group.start_address,
                            settings.device_id,
                            e
                        ),
                    )
                    .await;
                    report.failed_groups.push(group.id);
                }
            }
        }

        session.close().await;

        self.save(settings, &report.results).await?;

        info!(
            values = report.results.len(),
            failed_groups = report.failed_groups.len(),
            interrupted = report.interrupted,
            "Poll cycle complete"
        );

        Ok(CycleOutcome::Saved(report))
    }

    async fn read_group(
        &self,
        session: &mut dyn RegisterSession,
        settings: &MasterSettings,
        group: &GroupSettings,
    ) -> Result<Vec<(u32, String)>, GroupFailure> {
        let registers = session
            .read_registers(
                settings.device_id,
                group.start_address,
                group.register_count,
                settings.timeout(),
            )
            .await?;

        Ok(decoder::decode(
            &registers,
            &group.types,
            group.start_address,
        )?)
    }

    /// Save with a single retry before giving up.
    async fn save(&self, settings: &MasterSettings, results: &ResultSet) -> Result<(), CycleError> {
        let Err(first) = self.sink.save(results).await else {
            return Ok(());
        };

        warn!(error = %first, "Saving results failed, retrying once");

        if let Err(e) = self.sink.save(results).await {
            error!(error = %e, "Saving results failed");
            self.report(settings, &format!("Saving results failed: {}", e))
                .await;
            return Err(CycleError::Sink(e));
        }

        Ok(())
    }

    async fn report(&self, settings: &MasterSettings, message: &str) {
        if settings.logging_enabled {
            self.fault_log.write(message).await;
        }
    }
}
