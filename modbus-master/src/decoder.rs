//! Typed register decoding.
//!
//! A register buffer is treated as one big-endian bitstream: each register
//! contributes its 16 bits, most significant bit first. Schema entries consume
//! the stream left to right while an address cursor advances in lockstep.
//! Numeric types must fit completely; string types take whatever is left when
//! the buffer runs short.

use crate::settings::RegisterType;
use chrono::DateTime;
use thiserror::Error;

/// Bits per Modbus register.
pub const REGISTER_BITS: usize = 16;

/// Rendering format for [`RegisterType::UtcTimestamp`] values.
pub const TIMESTAMP_FORMAT: &str = "%Y.%m.%d %H:%M:%S";

/// A numeric value would read past the end of the register buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{register_type} at address {address} needs {needed} bits but only {available} remain")]
pub struct DecodeError {
    pub register_type: RegisterType,
    pub address: u32,
    pub needed: usize,
    pub available: usize,
}

/// Where one schema entry lands in the bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub register_type: RegisterType,
    pub address: u32,
    pub bit_offset: usize,
    pub bits: usize,
}

/// Assign every schema entry its address and bit range within `available_bits`.
pub fn layout(
    schema: &[RegisterType],
    start_address: u16,
    available_bits: usize,
) -> Result<Vec<Slot>, DecodeError> {
    let mut slots = Vec::with_capacity(schema.len());
    let mut address = u32::from(start_address);
    let mut offset = 0;

    for &register_type in schema {
        let remaining = available_bits - offset;
        let bits = if register_type.is_string() {
            register_type.bits().min(remaining)
        } else if remaining >= register_type.bits() {
            register_type.bits()
        } else {
            return Err(DecodeError {
                register_type,
                address,
                needed: register_type.bits(),
                available: remaining,
            });
        };

        slots.push(Slot {
            register_type,
            address,
            bit_offset: offset,
            bits,
        });

        offset += bits;
        address += (bits / REGISTER_BITS) as u32;
    }

    Ok(slots)
}

/// Decode `registers` according to `schema`, yielding `(address, value)` pairs
/// in schema order.
pub fn decode(
    registers: &[u16],
    schema: &[RegisterType],
    start_address: u16,
) -> Result<Vec<(u32, String)>, DecodeError> {
    let slots = layout(schema, start_address, registers.len() * REGISTER_BITS)?;

    Ok(slots
        .iter()
        .map(|slot| (slot.address, render(registers, slot)))
        .collect())
}

fn render(registers: &[u16], slot: &Slot) -> String {
    let mut bits = BitReader::new(registers, slot.bit_offset);

    match slot.register_type {
        RegisterType::UInt16 => (bits.read(16) as u16).to_string(),
        RegisterType::SInt16 => (bits.read(16) as u16 as i16).to_string(),
        RegisterType::UInt32 => bits.read(32).to_string(),
        RegisterType::SInt32 => (bits.read(32) as i32).to_string(),
        RegisterType::UtcTimestamp => format_timestamp(bits.read(32)),
        RegisterType::String18 | RegisterType::String20 => read_ascii(&mut bits, slot.bits),
    }
}

fn format_timestamp(seconds: u32) -> String {
    match DateTime::from_timestamp(i64::from(seconds), 0) {
        Some(time) => time.format(TIMESTAMP_FORMAT).to_string(),
        None => seconds.to_string(),
    }
}

/// Regroup `bits` into bytes and read them as ASCII. Bytes above 0x7F become
/// `?`; trailing NUL padding is dropped.
fn read_ascii(reader: &mut BitReader<'_>, bits: usize) -> String {
    let text: String = (0..bits / 8)
        .map(|_| match reader.read(8) as u8 {
            byte if byte.is_ascii() => char::from(byte),
            _ => '?',
        })
        .collect();

    text.trim_end_matches('\0').to_string()
}

/// MSB-first reader over a register slice.
struct BitReader<'a> {
    registers: &'a [u16],
    offset: usize,
}

impl<'a> BitReader<'a> {
    fn new(registers: &'a [u16], offset: usize) -> Self {
        Self { registers, offset }
    }

    /// Read up to 32 bits, first bit most significant.
    fn read(&mut self, width: usize) -> u32 {
        debug_assert!(width <= 32);

        let mut value = 0u32;
        for _ in 0..width {
            let register = self.registers[self.offset / REGISTER_BITS];
            let bit = (register >> (REGISTER_BITS - 1 - self.offset % REGISTER_BITS)) & 1;
            value = (value << 1) | u32::from(bit);
            self.offset += 1;
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inverse bit-packing for numeric types.
    fn pack(register_type: RegisterType, value: i64) -> Vec<u16> {
        match register_type {
            RegisterType::UInt16 | RegisterType::SInt16 => vec![value as u16],
            _ => {
                let raw = value as u32;
                vec![(raw >> 16) as u16, raw as u16]
            }
        }
    }

    fn decode_one(registers: &[u16], register_type: RegisterType) -> String {
        let values = decode(registers, &[register_type], 0).unwrap();
        assert_eq!(values.len(), 1);
        values[0].1.clone()
    }

    fn ascii_registers(text: &str, registers: usize) -> Vec<u16> {
        let mut bytes = text.as_bytes().to_vec();
        bytes.resize(registers * 2, 0);
        bytes
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect()
    }

    #[test]
    fn test_all_ones_16_bit() {
        assert_eq!(decode_one(&[0xFFFF], RegisterType::SInt16), "-1");
        assert_eq!(decode_one(&[0xFFFF], RegisterType::UInt16), "65535");
    }

    #[test]
    fn test_32_bit_word_order() {
        assert_eq!(decode_one(&[0x0000, 0x0001], RegisterType::UInt32), "1");
        assert_eq!(decode_one(&[0x0000, 0x0001], RegisterType::SInt32), "1");
        assert_eq!(decode_one(&[0x0001, 0x0000], RegisterType::UInt32), "65536");
        assert_eq!(
            decode_one(&[0x8000, 0x0000], RegisterType::SInt32),
            "-2147483648"
        );
    }

    #[test]
    fn test_timestamps() {
        assert_eq!(
            decode_one(&[0, 0], RegisterType::UtcTimestamp),
            "1970.01.01 00:00:00"
        );
        assert_eq!(
            decode_one(&pack(RegisterType::UInt32, 1_700_000_000), RegisterType::UtcTimestamp),
            "2023.11.14 22:13:20"
        );
        assert_eq!(
            decode_one(&[0xFFFF, 0xFFFF], RegisterType::UtcTimestamp),
            "2106.02.07 06:28:15"
        );
    }

    #[test]
    fn test_numeric_round_trip_boundaries() {
        let cases: [(RegisterType, &[i64]); 4] = [
            (
                RegisterType::SInt16,
                &[0, -1, 1, i16::MIN as i64, i16::MAX as i64],
            ),
            (RegisterType::UInt16, &[0, 1, 0x7FFF, 0x8000, u16::MAX as i64]),
            (
                RegisterType::SInt32,
                &[0, -1, 1, i16::MIN as i64, i32::MIN as i64, i32::MAX as i64],
            ),
            (
                RegisterType::UInt32,
                &[0, 1, u16::MAX as i64, 0x8000_0000, u32::MAX as i64],
            ),
        ];

        for (register_type, values) in cases {
            for &value in values {
                let decoded = decode_one(&pack(register_type, value), register_type);
                assert_eq!(decoded, value.to_string(), "{} {}", register_type, value);
            }
        }
    }

    #[test]
    fn test_numeric_round_trip_sweep() {
        for raw in (0..=u16::MAX).step_by(97) {
            let signed = raw as i16 as i64;
            assert_eq!(
                decode_one(&pack(RegisterType::SInt16, signed), RegisterType::SInt16),
                signed.to_string()
            );
        }

        for raw in (0..=u32::MAX).step_by(65_537 * 251) {
            assert_eq!(
                decode_one(&pack(RegisterType::UInt32, raw as i64), RegisterType::UInt32),
                raw.to_string()
            );
            let signed = raw as i32 as i64;
            assert_eq!(
                decode_one(&pack(RegisterType::SInt32, signed), RegisterType::SInt32),
                signed.to_string()
            );
        }
    }

    #[test]
    fn test_mixed_schema_addresses() {
        let mut registers = vec![7u16];
        registers.extend(pack(RegisterType::SInt32, -70_000));
        registers.extend(pack(RegisterType::UtcTimestamp, 86_400));
        registers.push(0xFFFE);

        let schema = [
            RegisterType::UInt16,
            RegisterType::SInt32,
            RegisterType::UtcTimestamp,
            RegisterType::SInt16,
        ];

        let values = decode(&registers, &schema, 10).unwrap();
        assert_eq!(
            values,
            vec![
                (10, "7".to_string()),
                (11, "-70000".to_string()),
                (13, "1970.01.02 00:00:00".to_string()),
                (15, "-2".to_string()),
            ]
        );
    }

    #[test]
    fn test_full_strings() {
        let mut registers = ascii_registers("SERIAL-0042", 9);
        registers.extend(ascii_registers("FIRMWARE v1.2.3", 10));

        let values = decode(
            &registers,
            &[RegisterType::String18, RegisterType::String20],
            500,
        )
        .unwrap();

        assert_eq!(
            values,
            vec![
                (500, "SERIAL-0042".to_string()),
                (509, "FIRMWARE v1.2.3".to_string()),
            ]
        );
    }

    #[test]
    fn test_string_exactly_filling_width() {
        let registers = ascii_registers("ABCDEFGHIJKLMNOPQR", 9);
        assert_eq!(
            decode_one(&registers, RegisterType::String18),
            "ABCDEFGHIJKLMNOPQR"
        );
    }

    #[test]
    fn test_truncated_string_consumes_remaining_bits() {
        let registers = ascii_registers("SHORTBUFFER", 8);

        let slots = layout(&[RegisterType::String18], 100, registers.len() * 16).unwrap();
        assert_eq!(slots[0].bits, 128);

        let values = decode(
            &registers,
            &[RegisterType::String18, RegisterType::String20],
            100,
        )
        .unwrap();

        assert_eq!(values[0], (100, "SHORTBUFFER".to_string()));
        // 128 / 16 = 8 registers consumed, nothing left for the second string.
        assert_eq!(values[1], (108, String::new()));
    }

    #[test]
    fn test_non_ascii_bytes() {
        let registers = [0x41C3, 0xA942, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode_one(&registers, RegisterType::String18), "A??B");
    }

    #[test]
    fn test_numeric_past_end_is_rejected() {
        let err = decode(&[1, 2, 3], &[RegisterType::UInt16, RegisterType::UInt32, RegisterType::UInt16], 40)
            .unwrap_err();

        assert_eq!(
            err,
            DecodeError {
                register_type: RegisterType::UInt16,
                address: 43,
                needed: 16,
                available: 0,
            }
        );

        let err = decode(&[1], &[RegisterType::SInt32], 0).unwrap_err();
        assert_eq!(err.available, 16);
        assert!(err.to_string().contains("sint32 at address 0"));
    }

    #[test]
    fn test_layout_offsets() {
        let slots = layout(
            &[
                RegisterType::String18,
                RegisterType::UInt32,
                RegisterType::UInt16,
            ],
            0,
            12 * 16,
        )
        .unwrap();

        let offsets: Vec<(u32, usize, usize)> = slots
            .iter()
            .map(|slot| (slot.address, slot.bit_offset, slot.bits))
            .collect();
        assert_eq!(offsets, vec![(0, 0, 144), (9, 144, 32), (11, 176, 16)]);
    }
}
