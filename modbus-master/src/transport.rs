//! Register transport: session establishment and register reads.
//!
//! [`RegisterTransport`] opens a [`RegisterSession`] for a [`TransportConfig`];
//! [`ModbusTransport`] implements it with tokio-modbus over TCP or RTU.

use crate::settings::{Parity, StopBits, TransportConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::debug;

/// The session could not be established; fatal to the current cycle only.
#[derive(Debug, Error)]
pub enum TransportOpenError {
    #[error("Cannot resolve {target}: {message}")]
    Resolve { target: String, message: String },
    #[error("Connection to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },
    #[error("Serial port {port} cannot be opened: {message}")]
    Serial { port: String, message: String },
    #[error("Unsupported serial setting: {0}")]
    Unsupported(String),
}

/// A register read failed; recoverable, affects one group only.
#[derive(Debug, Error)]
pub enum SlaveFault {
    #[error("device {device_id} answered with exception {code}")]
    Exception { device_id: u8, code: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

/// Which register table reads address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Holding registers (function code 0x03, default)
    #[default]
    Holding,
    /// Input registers (function code 0x04)
    Input,
}

/// Opens sessions to a slave device.
#[async_trait]
pub trait RegisterTransport: Send + Sync {
    async fn open(
        &self,
        config: &TransportConfig,
        timeout: Duration,
    ) -> Result<Box<dyn RegisterSession>, TransportOpenError>;
}

/// An open connection owned by one polling cycle.
#[async_trait]
pub trait RegisterSession: Send {
    /// Read `count` registers starting at `start`, bounded by `timeout`.
    async fn read_registers(
        &mut self,
        device_id: u8,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, SlaveFault>;

    /// Release the underlying connection.
    async fn close(&mut self);
}

/// tokio-modbus backed transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusTransport {
    kind: RegisterKind,
}

impl ModbusTransport {
    pub fn new(kind: RegisterKind) -> Self {
        Self { kind }
    }

    async fn connect_tcp(
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Context, TransportOpenError> {
        let target = format!("{}:{}", host, port);

        let connect = async {
            let addr = tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| TransportOpenError::Resolve {
                    target: target.clone(),
                    message: e.to_string(),
                })?
                .next()
                .ok_or_else(|| TransportOpenError::Resolve {
                    target: target.clone(),
                    message: "no addresses found".to_string(),
                })?;

            tcp::connect(addr)
                .await
                .map_err(|source| TransportOpenError::Connect {
                    target: target.clone(),
                    source,
                })
        };

        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| TransportOpenError::Timeout {
                target: target.clone(),
                timeout,
            })?
    }

    fn open_serial(
        port_name: &str,
        baud_rate: u32,
        data_bits: u8,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Context, TransportOpenError> {
        let parity = match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Mark | Parity::Space => {
                return Err(TransportOpenError::Unsupported(format!(
                    "parity {:?}",
                    parity
                )));
            }
        };

        let stop_bits = match stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
            StopBits::None | StopBits::OnePointFive => {
                return Err(TransportOpenError::Unsupported(format!(
                    "stop bits {}",
                    stop_bits.as_str()
                )));
            }
        };

        let data_bits = match data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => {
                return Err(TransportOpenError::Unsupported(format!(
                    "{} data bits",
                    other
                )));
            }
        };

        let builder = tokio_serial::new(port_name, baud_rate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits);

        let serial =
            tokio_serial::SerialStream::open(&builder).map_err(|e| TransportOpenError::Serial {
                port: port_name.to_string(),
                message: e.to_string(),
            })?;

        Ok(rtu::attach(serial))
    }
}

#[async_trait]
impl RegisterTransport for ModbusTransport {
    async fn open(
        &self,
        config: &TransportConfig,
        timeout: Duration,
    ) -> Result<Box<dyn RegisterSession>, TransportOpenError> {
        let ctx = match config {
            TransportConfig::Ip { host, port } => Self::connect_tcp(host, *port, timeout).await?,
            TransportConfig::Serial {
                port_name,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => Self::open_serial(port_name, *baud_rate, *data_bits, *parity, *stop_bits)?,
        };

        debug!(transport = %config, kind = ?self.kind, "Session opened");

        Ok(Box::new(ModbusSession {
            ctx,
            kind: self.kind,
        }))
    }
}

struct ModbusSession {
    ctx: Context,
    kind: RegisterKind,
}

#[async_trait]
impl RegisterSession for ModbusSession {
    async fn read_registers(
        &mut self,
        device_id: u8,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, SlaveFault> {
        self.ctx.set_slave(Slave(device_id));

        let kind = self.kind;
        let ctx = &mut self.ctx;
        let request = async move {
            match kind {
                RegisterKind::Holding => ctx.read_holding_registers(start, count).await,
                RegisterKind::Input => ctx.read_input_registers(start, count).await,
            }
        };

        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| SlaveFault::Timeout(timeout))?
            .map_err(|e| SlaveFault::Transport(e.to_string()))?
            .map_err(|code| SlaveFault::Exception {
                device_id,
                code: format!("{:?}", code),
            })
    }

    async fn close(&mut self) {
        if let Err(e) = self.ctx.disconnect().await {
            debug!(error = %e, "Disconnect failed");
        }
    }
}
