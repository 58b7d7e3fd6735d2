//! Domain types for instruments on a shared serial bus.

use crate::error::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Instrument address on a port (1-247).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Address(u8);

impl Address {
    /// Lowest valid instrument address.
    pub const MIN: u8 = 1;
    /// Highest valid instrument address.
    pub const MAX: u8 = 247;

    /// Create an address, rejecting values outside 1-247.
    pub fn new(value: u8) -> FlowResult<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(FlowError::InvalidInput(format!(
                "address {value} outside {}..={}",
                Self::MIN,
                Self::MAX
            )))
        }
    }

    /// Raw address byte.
    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Address {
    type Error = FlowError;

    fn try_from(value: u8) -> FlowResult<Self> {
        Self::new(value)
    }
}

impl From<Address> for u8 {
    fn from(address: Address) -> u8 {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a physical serial channel (e.g. `/dev/ttyUSB0`, `COM3`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortName(String);

impl PortName {
    /// Create a port name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PortName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Wire type of a parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Unsigned 8-bit.
    U8,
    /// Unsigned 16-bit.
    U16,
    /// Signed 32-bit.
    I32,
    /// IEEE-754 single precision.
    Float,
    /// Zero-terminated string.
    Text,
}

/// Instrument attribute addressed by its protocol parameter id (DDE number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Parameter {
    /// Protocol parameter id.
    pub dde: u16,
    /// Value type on the wire.
    pub value_type: ValueType,
    /// Short name used in logs and telemetry.
    pub name: &'static str,
}

impl Parameter {
    /// Measured value in percent of capacity (0..32000).
    pub const MEASURE: Self = Self::new(8, ValueType::U16, "measure");
    /// Setpoint in percent of capacity (0..32000).
    pub const SETPOINT: Self = Self::new(9, ValueType::U16, "setpoint");
    /// Active fluid table index.
    pub const FLUID_INDEX: Self = Self::new(24, ValueType::U8, "fluid_index");
    /// Name of the active fluid.
    pub const FLUID_NAME: Self = Self::new(25, ValueType::Text, "fluid_name");
    /// User-defined tag string.
    pub const USER_TAG: Self = Self::new(115, ValueType::Text, "usertag");
    /// Measured flow in engineering units.
    pub const MEASURED_FLOW: Self = Self::new(205, ValueType::Float, "fMeasure");
    /// Flow setpoint in engineering units.
    pub const FLOW_SETPOINT: Self = Self::new(206, ValueType::Float, "fSetpoint");

    /// Define a parameter.
    #[must_use]
    pub const fn new(dde: u16, value_type: ValueType, name: &'static str) -> Self {
        Self {
            dde,
            value_type,
            name,
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (DDE {})", self.name, self.dde)
    }
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Any integer type.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// String value.
    Text(String),
}

impl ParamValue {
    /// Numeric view of the value.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    /// Integer view of the value (floats are not converted).
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(_) | Self::Text(_) => None,
        }
    }

    /// String view of the value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Int(_) | Self::Float(_) => None,
        }
    }

    /// Check that the value can be written as `value_type`.
    pub fn check_type(&self, value_type: ValueType) -> FlowResult<()> {
        let ok = match (self, value_type) {
            (Self::Int(v), ValueType::U8) => u8::try_from(*v).is_ok(),
            (Self::Int(v), ValueType::U16) => u16::try_from(*v).is_ok(),
            (Self::Int(v), ValueType::I32) => i32::try_from(*v).is_ok(),
            (Self::Float(v), ValueType::Float) => v.is_finite(),
            (Self::Text(_), ValueType::Text) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(FlowError::InvalidInput(format!(
                "value {self} does not fit {value_type:?}"
            )))
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Immediate result of a parameter write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Instrument acknowledged the write.
    Ok,
    /// Instrument answered with a non-zero status code.
    Rejected(u8),
}
