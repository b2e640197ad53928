//! Modbus master that polls one slave device and records typed register values.
//!
//! A run reads a line-oriented settings file describing the transport (TCP or
//! RTU/serial), the slave id, the polling period and a list of register
//! groups. Every cycle reads each group, decodes the registers according to
//! the group's type schema and appends the values to a daily CSV file.
//!
//! # Modules
//!
//! - [`settings`] - Settings file parser and validated schema
//! - [`decoder`] - Bit-level register decoding
//! - [`transport`] - Session abstraction over tokio-modbus
//! - [`poller`] - One fault-isolating polling cycle
//! - [`scheduler`] - Single or periodic execution of cycles
//! - [`sink`] - Result sets and CSV persistence
//! - [`fault_log`] - Operator fault log
//! - [`config`] - Host configuration (JSON5)
//! - [`mock`] - In-memory collaborators for tests

pub mod config;
pub mod decoder;
pub mod fault_log;
pub mod mock;
pub mod poller;
pub mod scheduler;
pub mod settings;
pub mod sink;
pub mod transport;

pub use poller::{CycleError, CycleOutcome, CycleReport, PollingCycle};
pub use scheduler::{Scheduler, SchedulerError, SchedulerState, SchedulerSummary};
pub use settings::{ConfigError, GroupSettings, MasterSettings, RegisterType, TransportConfig};
pub use sink::{CsvResultSink, ResultSet, ResultSink};
