//! In-memory transport, sink and fault log for tests.
//!
//! Each mock is cheap to clone; clones share state so a test can keep one
//! handle for assertions while the polling cycle owns another.

use crate::fault_log::FaultLog;
use crate::settings::TransportConfig;
use crate::sink::{ResultSet, ResultSink, SinkError};
use crate::transport::{RegisterSession, RegisterTransport, SlaveFault, TransportOpenError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Scripted answer for reads starting at a given address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// Return these registers.
    Registers(Vec<u16>),
    /// Answer with a Modbus exception.
    Exception(String),
    /// Report a response timeout.
    Timeout,
    /// Never answer.
    Hang,
}

/// A register read seen by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockRead {
    pub device_id: u8,
    pub start: u16,
    pub count: u16,
}

#[derive(Debug, Default)]
struct TransportState {
    opened: usize,
    closed: usize,
    reads: Vec<MockRead>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Transport answering reads from a script keyed by start address.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    responses: Arc<HashMap<u16, MockResponse>>,
    unreachable: bool,
    state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the answer for reads starting at `start`.
    pub fn with_response(mut self, start: u16, response: MockResponse) -> Self {
        Arc::make_mut(&mut self.responses).insert(start, response);
        self
    }

    pub fn with_registers(self, start: u16, registers: Vec<u16>) -> Self {
        self.with_response(start, MockResponse::Registers(registers))
    }

    /// Make every `open` fail with a connection error.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn opened(&self) -> usize {
        lock(&self.state).opened
    }

    pub fn closed(&self) -> usize {
        lock(&self.state).closed
    }

    pub fn reads(&self) -> Vec<MockRead> {
        lock(&self.state).reads.clone()
    }
}

#[async_trait]
impl RegisterTransport for MockTransport {
    async fn open(
        &self,
        config: &TransportConfig,
        _timeout: Duration,
    ) -> Result<Box<dyn RegisterSession>, TransportOpenError> {
        if self.unreachable {
            return Err(TransportOpenError::Connect {
                target: config.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }

        lock(&self.state).opened += 1;

        Ok(Box::new(MockSession {
            responses: self.responses.clone(),
            state: self.state.clone(),
            open: true,
        }))
    }
}

struct MockSession {
    responses: Arc<HashMap<u16, MockResponse>>,
    state: Arc<Mutex<TransportState>>,
    open: bool,
}

#[async_trait]
impl RegisterSession for MockSession {
    async fn read_registers(
        &mut self,
        device_id: u8,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, SlaveFault> {
        lock(&self.state).reads.push(MockRead {
            device_id,
            start,
            count,
        });

        match self.responses.get(&start) {
            Some(MockResponse::Registers(registers)) => Ok(registers.clone()),
            Some(MockResponse::Exception(code)) => Err(SlaveFault::Exception {
                device_id,
                code: code.clone(),
            }),
            Some(MockResponse::Timeout) => Err(SlaveFault::Timeout(timeout)),
            Some(MockResponse::Hang) => std::future::pending().await,
            None => Err(SlaveFault::Transport(format!(
                "no scripted response for address {}",
                start
            ))),
        }
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            lock(&self.state).closed += 1;
        }
    }
}

/// Sink that records every saved result set.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    saved: Arc<Mutex<Vec<ResultSet>>>,
    failures: Arc<Mutex<usize>>,
    attempts: Arc<Mutex<usize>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `failures` saves.
    pub fn failing(self, failures: usize) -> Self {
        *lock(&self.failures) = failures;
        self
    }

    pub fn saved(&self) -> Vec<ResultSet> {
        lock(&self.saved).clone()
    }

    /// Number of save calls, including failed ones.
    pub fn attempts(&self) -> usize {
        *lock(&self.attempts)
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn save(&self, results: &ResultSet) -> Result<(), SinkError> {
        *lock(&self.attempts) += 1;

        {
            let mut failures = lock(&self.failures);
            if *failures > 0 {
                *failures -= 1;
                return Err(SinkError::Io(std::io::Error::other("disk full")));
            }
        }

        lock(&self.saved).push(results.clone());
        Ok(())
    }
}

/// Fault log keeping messages in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryFaultLog {
    messages: Arc<Mutex<Vec<String>>>,
}

impl MemoryFaultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl FaultLog for MemoryFaultLog {
    async fn write(&self, message: &str) {
        lock(&self.messages).push(message.to_string());
    }
}
