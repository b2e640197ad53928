//! Line-oriented master settings file.
//!
//! The file has a fixed positional layout once comments (`//` to end of line)
//! and blank lines are removed:
//!
//! ```text
//! [Main]
//! Logging=Yes
//! Timeout=1000
//! Port=IP
//! IP=192.168.0.10:502
//! DeviceID=1
//! Period=60
//! [Reading]
//! 1=100;4;uint16;sint16;uint32
//! 2=200;9;string8_18
//! ```
//!
//! Diagnostics always refer to 1-based line numbers of the original file.

use crate::decoder;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Largest register count a single Modbus read may request.
pub const MAX_REGISTERS_PER_READ: u16 = 125;

/// Validated settings for one master: transport, timing and register groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterSettings {
    /// Whether slave faults are written to the fault log.
    pub logging_enabled: bool,
    /// Response timeout in milliseconds (always > 0).
    pub timeout_ms: u32,
    /// Modbus unit identifier of the polled device.
    pub device_id: u8,
    /// Seconds between polls; 0 polls exactly once.
    pub period: u32,
    /// How to reach the device.
    pub transport: TransportConfig,
    /// Register groups in declaration order (never empty).
    pub groups: Vec<GroupSettings>,
}

impl MasterSettings {
    /// Read and parse a settings file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse the full text of a settings file.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let lines: Vec<&str> = content.lines().collect();
        Self::parse_lines(&lines)
    }

    /// Parse a settings file given as its raw lines.
    pub fn parse_lines<S: AsRef<str>>(lines: &[S]) -> Result<Self, ConfigError> {
        Parser::new(lines).parse()
    }

    /// Response timeout for a single register read.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.timeout_ms))
    }

    /// Every value address of every group, in group then schema order.
    pub fn value_addresses(&self) -> Vec<u32> {
        self.groups
            .iter()
            .flat_map(GroupSettings::value_addresses)
            .collect()
    }

    /// Delay between polls, or `None` when the master polls only once.
    pub fn poll_period(&self) -> Option<Duration> {
        (self.period > 0).then(|| Duration::from_secs(u64::from(self.period)))
    }
}

/// Connection parameters; exactly one variant is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    /// Modbus TCP.
    Ip { host: String, port: u16 },
    /// Modbus RTU over a serial line.
    Serial {
        port_name: String,
        baud_rate: u32,
        data_bits: u8,
        parity: Parity,
        stop_bits: StopBits,
    },
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Ip { host, port } => write!(f, "{}:{}", host, port),
            TransportConfig::Serial {
                port_name,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => write!(
                f,
                "{} {} {}{}{}",
                port_name,
                baud_rate,
                data_bits,
                parity.as_char(),
                stop_bits.as_str()
            ),
        }
    }
}

/// Serial parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Mark,
    Odd,
    Space,
}

impl Parity {
    /// Parse the single-character parity code used in the `COM=` line.
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'N' => Some(Self::None),
            'E' => Some(Self::Even),
            'M' => Some(Self::Mark),
            'O' => Some(Self::Odd),
            'S' => Some(Self::Space),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Self::None => 'N',
            Self::Even => 'E',
            Self::Mark => 'M',
            Self::Odd => 'O',
            Self::Space => 'S',
        }
    }
}

/// Serial stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    None,
    One,
    OnePointFive,
    Two,
}

impl StopBits {
    /// Parse the stop-bit suffix used in the `COM=` line.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "0" => Some(Self::None),
            "1" => Some(Self::One),
            "1.5" => Some(Self::OnePointFive),
            "2" => Some(Self::Two),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "0",
            Self::One => "1",
            Self::OnePointFive => "1.5",
            Self::Two => "2",
        }
    }
}

/// A span of registers read in one request, plus the types packed into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSettings {
    pub id: u32,
    pub start_address: u16,
    pub register_count: u16,
    pub types: Vec<RegisterType>,
}

impl GroupSettings {
    /// First address past the end of this group.
    pub fn end_address(&self) -> u32 {
        u32::from(self.start_address) + u32::from(self.register_count)
    }

    /// Addresses the decoder yields for a full read of this group.
    pub fn value_addresses(&self) -> Vec<u32> {
        // Width is checked when the settings are parsed.
        decoder::layout(
            &self.types,
            self.start_address,
            usize::from(self.register_count) * decoder::REGISTER_BITS,
        )
        .map(|slots| slots.iter().map(|slot| slot.address).collect())
        .unwrap_or_default()
    }

    fn overlaps(&self, other: &GroupSettings) -> bool {
        u32::from(self.start_address) < other.end_address()
            && u32::from(other.start_address) < self.end_address()
    }
}

/// Register value types a group schema may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterType {
    /// 18 ASCII characters (9 registers).
    String18,
    /// 20 ASCII characters (10 registers).
    String20,
    /// Seconds since the Unix epoch, unsigned 32-bit.
    UtcTimestamp,
    SInt16,
    UInt16,
    SInt32,
    UInt32,
}

impl RegisterType {
    /// Parse a type token from a group line (case-insensitive).
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "string8_18" | "string18" => Some(Self::String18),
            "string8_20" | "string20" => Some(Self::String20),
            "utc_timestamp" | "utctimestamp" => Some(Self::UtcTimestamp),
            "sint16" => Some(Self::SInt16),
            "uint16" => Some(Self::UInt16),
            "sint32" => Some(Self::SInt32),
            "uint32" => Some(Self::UInt32),
            _ => None,
        }
    }

    /// Canonical token as written in settings files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String18 => "string8_18",
            Self::String20 => "string8_20",
            Self::UtcTimestamp => "utc_timestamp",
            Self::SInt16 => "sint16",
            Self::UInt16 => "uint16",
            Self::SInt32 => "sint32",
            Self::UInt32 => "uint32",
        }
    }

    /// Full width in bits.
    pub fn bits(&self) -> usize {
        match self {
            Self::String18 => 144,
            Self::String20 => 160,
            Self::UtcTimestamp | Self::SInt32 | Self::UInt32 => 32,
            Self::SInt16 | Self::UInt16 => 16,
        }
    }

    /// Full width in 16-bit registers.
    pub fn registers(&self) -> usize {
        self.bits() / 16
    }

    /// String types may be truncated when the buffer runs out.
    pub fn is_string(&self) -> bool {
        matches!(self, Self::String18 | Self::String20)
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Describes one positional entry of the settings file for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub key: &'static str,
    pub format: &'static str,
    pub example: &'static str,
}

pub const LOGGING: Field = Field {
    key: "Logging",
    format: "Logging=Yes|No",
    example: "Logging=Yes",
};

pub const TIMEOUT: Field = Field {
    key: "Timeout",
    format: "Timeout=<milliseconds, greater than 0>",
    example: "Timeout=1000",
};

pub const PORT: Field = Field {
    key: "Port",
    format: "Port=IP|COM",
    example: "Port=IP",
};

pub const IP: Field = Field {
    key: "IP",
    format: "IP=<host>:<port>",
    example: "IP=192.168.0.10:502",
};

pub const COM: Field = Field {
    key: "COM",
    format: "COM=<port>;<baud rate>;<data bits><parity N|E|M|O|S><stop bits 0|1|1.5|2>",
    example: "COM=COM1;9600;8N1",
};

pub const DEVICE_ID: Field = Field {
    key: "DeviceID",
    format: "DeviceID=<0-255>",
    example: "DeviceID=1",
};

pub const PERIOD: Field = Field {
    key: "Period",
    format: "Period=<seconds, 0 polls once>",
    example: "Period=60",
};

pub const HEADER: Field = Field {
    key: "[section]",
    format: "[Main] or [Reading]",
    example: "[Main]",
};

pub const GROUP: Field = Field {
    key: "<group id>",
    format: "<group id>=<start address>;<register count>;<type>[;<type>...]",
    example: "1=100;4;uint16;sint16;uint32",
};

/// Settings file errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read settings file '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {problem}; expected `{}` (e.g. `{}`)", .field.format, .field.example)]
    Invalid {
        line: usize,
        field: Field,
        problem: String,
    },

    #[error("line {line}: settings file ends early; expected `{}` (e.g. `{}`)", .field.format, .field.example)]
    Missing { line: usize, field: Field },

    #[error("line {line}: group {group}: {problem}; expected `{}` (e.g. `{}`)", GROUP.format, GROUP.example)]
    Group {
        line: usize,
        group: u32,
        problem: String,
    },

    #[error("line {line}: no register groups declared after the [Reading] header; expected `{}` (e.g. `{}`)", GROUP.format, GROUP.example)]
    NoGroups { line: usize },
}

impl ConfigError {
    /// Original 1-based line number the error refers to, if any.
    pub fn line(&self) -> Option<usize> {
        match self {
            ConfigError::Invalid { line, .. }
            | ConfigError::Missing { line, .. }
            | ConfigError::Group { line, .. }
            | ConfigError::NoGroups { line } => Some(*line),
            ConfigError::Read { .. } => None,
        }
    }
}

/// A comment-stripped, non-blank line and its original 1-based number.
#[derive(Debug, Clone, Copy)]
struct SettingsLine<'a> {
    number: usize,
    text: &'a str,
}

impl<'a> SettingsLine<'a> {
    fn invalid(&self, field: Field, problem: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            line: self.number,
            field,
            problem: problem.into(),
        }
    }

    /// Split `key=value`, checking the key against the expected field.
    fn value(&self, field: Field) -> Result<&'a str, ConfigError> {
        let Some((key, value)) = self.text.split_once('=') else {
            return Err(self.invalid(field, format!("'{}' is not a key=value pair", self.text)));
        };

        let key = key.trim();
        if !key.eq_ignore_ascii_case(field.key) {
            return Err(self.invalid(field, format!("unexpected key '{}'", key)));
        }

        Ok(value.trim())
    }

    fn number<T: std::str::FromStr>(
        &self,
        field: Field,
        value: &str,
        what: &str,
    ) -> Result<T, ConfigError> {
        value
            .parse()
            .map_err(|_| self.invalid(field, format!("'{}' is not {}", value, what)))
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(index) => line[..index].trim(),
        None => line.trim(),
    }
}

// Positions within the comment-stripped line list.
const LOGGING_LINE: usize = 1;
const TIMEOUT_LINE: usize = 2;
const PORT_LINE: usize = 3;
const CONNECTION_LINE: usize = 4;
const DEVICE_ID_LINE: usize = 5;
const PERIOD_LINE: usize = 6;
const FIRST_GROUP_LINE: usize = 8;

struct Parser<'a> {
    lines: Vec<SettingsLine<'a>>,
    total_lines: usize,
}

impl<'a> Parser<'a> {
    fn new<S: AsRef<str>>(raw: &'a [S]) -> Self {
        let lines = raw
            .iter()
            .enumerate()
            .map(|(index, line)| SettingsLine {
                number: index + 1,
                text: strip_comment(line.as_ref()),
            })
            .filter(|line| !line.text.is_empty())
            .collect();

        Self {
            lines,
            total_lines: raw.len(),
        }
    }

    fn line(&self, position: usize, field: Field) -> Result<SettingsLine<'a>, ConfigError> {
        self.lines
            .get(position)
            .copied()
            .ok_or_else(|| ConfigError::Missing {
                line: self.total_lines + 1 + (position - self.lines.len()),
                field,
            })
    }

    fn parse(self) -> Result<MasterSettings, ConfigError> {
        self.line(0, HEADER)?;

        let logging_enabled = self.parse_logging()?;
        let timeout_ms = self.parse_timeout()?;
        let transport = self.parse_transport()?;
        let device_id = self.parse_device_id()?;
        let period = self.parse_period()?;

        self.line(FIRST_GROUP_LINE - 1, HEADER)?;
        let groups = self.parse_groups()?;

        Ok(MasterSettings {
            logging_enabled,
            timeout_ms,
            device_id,
            period,
            transport,
            groups,
        })
    }

    fn parse_logging(&self) -> Result<bool, ConfigError> {
        let line = self.line(LOGGING_LINE, LOGGING)?;
        let value = line.value(LOGGING)?;

        match value.to_ascii_lowercase().as_str() {
            "yes" => Ok(true),
            "no" => Ok(false),
            _ => Err(line.invalid(LOGGING, format!("'{}' is neither Yes nor No", value))),
        }
    }

    fn parse_timeout(&self) -> Result<u32, ConfigError> {
        let line = self.line(TIMEOUT_LINE, TIMEOUT)?;
        let value = line.value(TIMEOUT)?;
        let timeout: u32 = line.number(TIMEOUT, value, "a positive integer")?;

        if timeout == 0 {
            return Err(line.invalid(TIMEOUT, "timeout must be greater than 0"));
        }

        Ok(timeout)
    }

    fn parse_transport(&self) -> Result<TransportConfig, ConfigError> {
        let port_line = self.line(PORT_LINE, PORT)?;
        let port_type = port_line.value(PORT)?;

        match port_type.to_ascii_lowercase().as_str() {
            "ip" => {
                let line = self.line(CONNECTION_LINE, IP)?;
                parse_ip(&line)
            }
            "com" => {
                let line = self.line(CONNECTION_LINE, COM)?;
                parse_com(&line)
            }
            _ => Err(port_line.invalid(PORT, format!("unknown port type '{}'", port_type))),
        }
    }

    fn parse_device_id(&self) -> Result<u8, ConfigError> {
        let line = self.line(DEVICE_ID_LINE, DEVICE_ID)?;
        let value = line.value(DEVICE_ID)?;
        line.number(DEVICE_ID, value, "a number in 0-255")
    }

    fn parse_period(&self) -> Result<u32, ConfigError> {
        let line = self.line(PERIOD_LINE, PERIOD)?;
        let value = line.value(PERIOD)?;
        line.number(PERIOD, value, "a non-negative integer")
    }

    fn parse_groups(&self) -> Result<Vec<GroupSettings>, ConfigError> {
        let mut parsed: Vec<(usize, GroupSettings)> = Vec::new();

        for line in self.lines.iter().skip(FIRST_GROUP_LINE) {
            let group = parse_group(line)?;

            for (_, earlier) in &parsed {
                if earlier.id == group.id {
                    return Err(ConfigError::Group {
                        line: line.number,
                        group: group.id,
                        problem: "group id is declared more than once".to_string(),
                    });
                }
                if earlier.overlaps(&group) {
                    return Err(ConfigError::Group {
                        line: line.number,
                        group: group.id,
                        problem: format!(
                            "registers {}..{} overlap group {} ({}..{})",
                            group.start_address,
                            group.end_address(),
                            earlier.id,
                            earlier.start_address,
                            earlier.end_address()
                        ),
                    });
                }
            }

            parsed.push((line.number, group));
        }

        if parsed.is_empty() {
            return Err(ConfigError::NoGroups {
                line: self.total_lines + 1,
            });
        }

        Ok(parsed.into_iter().map(|(_, group)| group).collect())
    }
}

fn parse_ip(line: &SettingsLine<'_>) -> Result<TransportConfig, ConfigError> {
    let value = line.value(IP)?;
    let Some((host, port)) = value.rsplit_once(':') else {
        return Err(line.invalid(IP, format!("'{}' has no port", value)));
    };

    let host = host.trim();
    if host.is_empty() {
        return Err(line.invalid(IP, "host is empty"));
    }

    let port: u16 = line.number(IP, port.trim(), "a TCP port number")?;

    Ok(TransportConfig::Ip {
        host: host.to_string(),
        port,
    })
}

fn parse_com(line: &SettingsLine<'_>) -> Result<TransportConfig, ConfigError> {
    let value = line.value(COM)?;
    let parts: Vec<&str> = value.split(';').map(str::trim).collect();

    let [port_name, baud_rate, frame] = parts.as_slice() else {
        return Err(line.invalid(
            COM,
            format!("expected 3 ';'-separated fields, found {}", parts.len()),
        ));
    };

    if port_name.is_empty() {
        return Err(line.invalid(COM, "port name is empty"));
    }

    let baud_rate: u32 = line.number(COM, baud_rate, "a baud rate")?;
    if baud_rate == 0 {
        return Err(line.invalid(COM, "baud rate must be greater than 0"));
    }

    let mut chars = frame.chars();
    let data_bits = match chars.next().and_then(|c| c.to_digit(10)) {
        Some(bits @ 5..=8) => bits as u8,
        _ => {
            return Err(line.invalid(
                COM,
                format!("'{}' does not start with 5, 6, 7 or 8 data bits", frame),
            ));
        }
    };

    let parity = match chars.next() {
        Some(c) => Parity::from_char(c)
            .ok_or_else(|| line.invalid(COM, format!("unknown parity '{}'", c)))?,
        None => return Err(line.invalid(COM, format!("'{}' has no parity", frame))),
    };

    let stop_bits = chars.as_str();
    let stop_bits = StopBits::from_token(stop_bits)
        .ok_or_else(|| line.invalid(COM, format!("unknown stop bits '{}'", stop_bits)))?;

    Ok(TransportConfig::Serial {
        port_name: port_name.to_string(),
        baud_rate,
        data_bits,
        parity,
        stop_bits,
    })
}

fn parse_group(line: &SettingsLine<'_>) -> Result<GroupSettings, ConfigError> {
    let Some((id, schema)) = line.text.split_once('=') else {
        return Err(line.invalid(GROUP, format!("'{}' is not a group declaration", line.text)));
    };

    let id: u32 = line.number(GROUP, id.trim(), "a group id")?;

    let mut parts = schema.split(';').map(str::trim);

    let start_address: u16 = match parts.next() {
        Some(start) => line.number(GROUP, start, "a start address (0-65535)")?,
        None => return Err(line.invalid(GROUP, "missing start address")),
    };

    let register_count: u16 = match parts.next() {
        Some(count) => line.number(GROUP, count, "a register count")?,
        None => return Err(line.invalid(GROUP, format!("group {}: missing register count", id))),
    };

    if register_count == 0 || register_count > MAX_REGISTERS_PER_READ {
        return Err(line.invalid(
            GROUP,
            format!(
                "group {}: register count {} is outside 1-{}",
                id, register_count, MAX_REGISTERS_PER_READ
            ),
        ));
    }

    if u32::from(start_address) + u32::from(register_count) > 0x1_0000 {
        return Err(line.invalid(
            GROUP,
            format!("group {}: registers run past address 65535", id),
        ));
    }

    let types = parts
        .filter(|token| !token.is_empty())
        .map(|token| {
            RegisterType::from_token(token).ok_or_else(|| {
                line.invalid(
                    GROUP,
                    format!("group {}: unknown register type '{}'", id, token),
                )
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if types.is_empty() {
        return Err(line.invalid(GROUP, format!("group {}: no register types listed", id)));
    }

    decoder::layout(
        &types,
        start_address,
        usize::from(register_count) * decoder::REGISTER_BITS,
    )
    .map_err(|e| ConfigError::Group {
        line: line.number,
        group: id,
        problem: format!("schema does not fit {} registers: {}", register_count, e),
    })?;

    Ok(GroupSettings {
        id,
        start_address,
        register_count,
        types,
    })
}
