//! Huawei SUN2000 register map
//!
//! Addresses, types and gains follow Huawei's "Solar Inverter Modbus Interface Definitions".
//! All registers here are read with function code 0x03 (holding registers) and 32 bit
//! values are transmitted high word first.

use crate::inverter::InverterError;
use serde_derive::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    U16,
    I16,
    U32,
    I32,
}

impl DataType {
    /// Number of 16 bit registers occupied by a value of this type
    pub const fn word_count(self) -> u16 {
        match self {
            DataType::U16 | DataType::I16 => 1,
            DataType::U32 | DataType::I32 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub name: &'static str,
    pub address: u16,
    pub data_type: DataType,
    pub gain: u32,
    pub unit: &'static str,
}

/// A decoded register reading. Unscaled registers stay integral.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RegisterValue {
    Integer(i64),
    Float(f64),
}

pub const ACTIVE_POWER: &str = "active_power";

const fn reg(
    name: &'static str,
    address: u16,
    data_type: DataType,
    gain: u32,
    unit: &'static str,
) -> Register {
    Register {
        name,
        address,
        data_type,
        gain,
        unit,
    }
}

pub static REGISTERS: &[Register] = &[
    reg("input_power", 32064, DataType::I32, 1, "W"),
    reg("line_voltage_A_B", 32066, DataType::U16, 10, "V"),
    reg("phase_A_current", 32072, DataType::I32, 1000, "A"),
    reg("day_active_power_peak", 32078, DataType::I32, 1, "W"),
    reg(ACTIVE_POWER, 32080, DataType::I32, 1, "W"),
    reg("reactive_power", 32082, DataType::I32, 1, "var"),
    reg("power_factor", 32084, DataType::I16, 1000, ""),
    reg("grid_frequency", 32085, DataType::U16, 100, "Hz"),
    reg("efficiency", 32086, DataType::U16, 100, "%"),
    reg("internal_temperature", 32087, DataType::I16, 10, "°C"),
    reg("accumulated_yield_energy", 32106, DataType::U32, 100, "kWh"),
    reg("daily_yield_energy", 32114, DataType::U32, 100, "kWh"),
];

pub fn lookup(name: &str) -> Option<&'static Register> {
    REGISTERS.iter().find(|register| register.name == name)
}

impl Register {
    pub const fn word_count(&self) -> u16 {
        self.data_type.word_count()
    }

    /// Converts the raw words read from the device into the engineering value
    pub fn decode(&self, words: &[u16]) -> Result<RegisterValue, InverterError> {
        if words.len() != usize::from(self.word_count()) {
            return Err(InverterError::Protocol(format!(
                "register {} expects {} words, got {}",
                self.name,
                self.word_count(),
                words.len()
            )));
        }
        let raw: i64 = match self.data_type {
            DataType::U16 => i64::from(words[0]),
            DataType::I16 => i64::from(words[0] as i16),
            DataType::U32 => i64::from(merge_u16_u32(words[0], words[1])),
            DataType::I32 => i64::from(merge_u16_u32(words[0], words[1]) as i32),
        };
        if self.gain == 1 {
            Ok(RegisterValue::Integer(raw))
        } else {
            Ok(RegisterValue::Float(raw as f64 / f64::from(self.gain)))
        }
    }
}

/// Joins two registers into a u32 (big-endian word order)
fn merge_u16_u32(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}
