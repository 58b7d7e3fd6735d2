//! Write commands and their verification.
//!
//! Every command is one write followed, unless the instrument gave an
//! unambiguous acknowledgement, by a bounded readback loop. Fluid switches
//! always poll the instrument until it reports the new fluid, because the
//! instrument reloads its fluid table in the background. A failed write
//! may still have been applied, so only invalid input skips the readback.

use crate::events::TelemetryKind;
use flowbus_common::{
    Address, CommandConfig, ErrorKind, FlowError, FlowResult, ParamValue, Parameter, WriteStatus,
};
use flowbus_transport::ResilientTransport;
use std::fmt;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Highest percent setpoint (100 % of capacity).
pub const PERCENT_SETPOINT_MAX: i64 = 32_000;

/// What a command writes.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// Flow setpoint in engineering units.
    WriteFlowSetpoint(f64),
    /// Setpoint in percent of capacity, 0 to 32000.
    WritePercentSetpoint(i64),
    /// Switch to another entry of the fluid table.
    WriteFluidIndex(u8),
    /// Store a user tag.
    WriteUserTag(String),
}

impl CommandKind {
    /// Parameter the command writes.
    #[must_use]
    pub fn parameter(&self) -> Parameter {
        match self {
            Self::WriteFlowSetpoint(_) => Parameter::FLOW_SETPOINT,
            Self::WritePercentSetpoint(_) => Parameter::SETPOINT,
            Self::WriteFluidIndex(_) => Parameter::FLUID_INDEX,
            Self::WriteUserTag(_) => Parameter::USER_TAG,
        }
    }

    /// Telemetry classification.
    #[must_use]
    pub fn telemetry_kind(&self) -> TelemetryKind {
        match self {
            Self::WriteFlowSetpoint(_) => TelemetryKind::FlowSetpoint,
            Self::WritePercentSetpoint(_) => TelemetryKind::PercentSetpoint,
            Self::WriteFluidIndex(_) => TelemetryKind::FluidIndex,
            Self::WriteUserTag(_) => TelemetryKind::UserTag,
        }
    }

    /// Requested value as written on the wire.
    #[must_use]
    pub fn value(&self) -> ParamValue {
        match self {
            Self::WriteFlowSetpoint(v) => ParamValue::Float(*v),
            Self::WritePercentSetpoint(v) => ParamValue::Int(*v),
            Self::WriteFluidIndex(v) => ParamValue::Int(i64::from(*v)),
            Self::WriteUserTag(s) => ParamValue::Text(s.clone()),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.parameter().name, self.value())
    }
}

/// A queued write for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Target instrument.
    pub address: Address,
    /// What to write.
    pub kind: CommandKind,
    /// When the command entered the queue.
    pub enqueued_at: Instant,
}

impl Command {
    /// Create a command stamped with the current time.
    #[must_use]
    pub fn new(address: Address, kind: CommandKind) -> Self {
        Self {
            address,
            kind,
            enqueued_at: Instant::now(),
        }
    }

    /// Flow setpoint command.
    #[must_use]
    pub fn flow_setpoint(address: Address, value: f64) -> Self {
        Self::new(address, CommandKind::WriteFlowSetpoint(value))
    }

    /// Percent setpoint command.
    #[must_use]
    pub fn percent_setpoint(address: Address, value: i64) -> Self {
        Self::new(address, CommandKind::WritePercentSetpoint(value))
    }

    /// Fluid switch command.
    #[must_use]
    pub fn fluid_index(address: Address, index: u8) -> Self {
        Self::new(address, CommandKind::WriteFluidIndex(index))
    }

    /// User tag command.
    #[must_use]
    pub fn user_tag(address: Address, tag: impl Into<String>) -> Self {
        Self::new(address, CommandKind::WriteUserTag(tag.into()))
    }
}

/// Immediate result of a write, before verification.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Acknowledged with status zero.
    Ok,
    /// No acknowledgement within the response timeout.
    TimedOut,
    /// Rejected, or failed for another reason.
    Other(FlowError),
}

impl WriteOutcome {
    /// Normalize a transport write result.
    #[must_use]
    pub fn from_result(result: FlowResult<WriteStatus>) -> Self {
        match result {
            Ok(WriteStatus::Ok) => Self::Ok,
            Ok(WriteStatus::Rejected(code)) => Self::Other(FlowError::DeviceStatus {
                code,
                message: "write rejected".into(),
            }),
            Err(FlowError::Timeout(_)) => Self::TimedOut,
            Err(e) => Self::Other(e),
        }
    }
}

/// Relative tolerance for engineering-unit setpoints.
#[must_use]
pub fn flow_tolerance(value: f64) -> f64 {
    value.abs().max(1.0) * 1e-3
}

/// Executes commands against one port.
#[derive(Clone)]
pub struct CommandProcessor {
    transport: ResilientTransport,
    config: CommandConfig,
}

impl CommandProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(transport: ResilientTransport, config: CommandConfig) -> Self {
        Self { transport, config }
    }

    /// Truncate a user tag to what the instrument stores.
    #[must_use]
    pub fn truncate_tag(&self, tag: &str) -> String {
        tag.chars().take(self.config.usertag_max_len).collect()
    }

    /// Execute `command` and return the confirmed value.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::InvalidInput`] for out-of-range values (no bus
    /// traffic), [`FlowError::VerificationFailed`] if the readback never
    /// matched, or the transport error of a write that could not be
    /// verified.
    pub fn execute(&self, command: &Command) -> FlowResult<ParamValue> {
        let address = command.address;
        debug!(
            %address,
            command = %command.kind,
            queued_ms = command.enqueued_at.elapsed().as_millis(),
            "Executing command"
        );

        match &command.kind {
            CommandKind::WriteFlowSetpoint(value) => {
                if !value.is_finite() {
                    return Err(FlowError::InvalidInput(format!(
                        "flow setpoint {value} is not finite"
                    )));
                }
                let target = *value;
                self.write_verified(address, Parameter::FLOW_SETPOINT, ParamValue::Float(target), |v| {
                    v.as_f64()
                        .is_some_and(|actual| (actual - target).abs() <= flow_tolerance(target))
                })
            }
            CommandKind::WritePercentSetpoint(value) => {
                if !(0..=PERCENT_SETPOINT_MAX).contains(value) {
                    return Err(FlowError::InvalidInput(format!(
                        "percent setpoint {value} outside 0..={PERCENT_SETPOINT_MAX}"
                    )));
                }
                let target = *value;
                self.write_verified(address, Parameter::SETPOINT, ParamValue::Int(target), |v| {
                    v.as_i64() == Some(target)
                })
            }
            CommandKind::WriteUserTag(tag) => {
                let stored = self.truncate_tag(tag);
                if stored.len() < tag.len() {
                    debug!(%address, %tag, %stored, "User tag truncated");
                }
                let expected = stored.clone();
                self.write_verified(address, Parameter::USER_TAG, ParamValue::Text(stored), |v| {
                    v.as_text() == Some(expected.as_str())
                })
            }
            CommandKind::WriteFluidIndex(index) => self.switch_fluid(address, *index),
        }
    }

    /// One write, then readback until `matches` holds or attempts run out.
    fn write_verified(
        &self,
        address: Address,
        param: Parameter,
        value: ParamValue,
        matches: impl Fn(&ParamValue) -> bool,
    ) -> FlowResult<ParamValue> {
        let outcome = WriteOutcome::from_result(self.transport.write(address, param, &value, None));
        match &outcome {
            WriteOutcome::Ok => return Ok(value),
            WriteOutcome::Other(e) if e.kind() == ErrorKind::InvalidInput => return Err(e.clone()),
            WriteOutcome::TimedOut => {
                debug!(%address, %param, "Write not acknowledged, verifying by readback");
            }
            WriteOutcome::Other(e) => {
                warn!(%address, %param, error = %e, "Write failed, verifying by readback");
            }
        }

        let mut last_read: Option<ParamValue> = None;
        let mut last_error: Option<FlowError> = None;
        for attempt in 1..=self.config.verify_attempts.max(1) {
            thread::sleep(self.config.verify_interval);
            match self.transport.read(address, param) {
                Ok(actual) if matches(&actual) => {
                    info!(%address, %param, attempt, "Write confirmed by readback");
                    return Ok(actual);
                }
                Ok(actual) => {
                    debug!(%address, %param, attempt, %actual, "Readback mismatch");
                    last_read = Some(actual);
                }
                Err(e) => {
                    debug!(%address, %param, attempt, error = %e, "Readback failed");
                    last_error = Some(e);
                }
            }
        }

        let actual = match (last_read, last_error) {
            (Some(v), _) => v.to_string(),
            (None, Some(e)) => format!("no readback ({e})"),
            (None, None) => "no readback".into(),
        };
        Err(FlowError::VerificationFailed {
            parameter: param.name.to_string(),
            expected: value.to_string(),
            actual,
        })
    }

    /// Write a fluid index with the extended timeout and wait for the
    /// instrument to report it with a fluid name.
    fn switch_fluid(&self, address: Address, index: u8) -> FlowResult<ParamValue> {
        let started = Instant::now();
        let deadline = started + self.config.fluid_deadline;
        let target = ParamValue::Int(i64::from(index));

        let outcome = WriteOutcome::from_result(self.transport.write(
            address,
            Parameter::FLUID_INDEX,
            &target,
            Some(self.config.fluid_write_timeout),
        ));
        match outcome {
            WriteOutcome::Ok => {}
            WriteOutcome::Other(e) if e.kind() == ErrorKind::InvalidInput => return Err(e),
            WriteOutcome::TimedOut => {
                debug!(%address, index, "Fluid write not acknowledged, polling for switch");
            }
            WriteOutcome::Other(e) => {
                warn!(%address, index, error = %e, "Fluid write failed, polling for switch");
            }
        }

        let mut last_seen = String::from("no readback");
        loop {
            match self.read_fluid(address) {
                Ok((current, name)) if current == i64::from(index) && !name.is_empty() => {
                    info!(
                        %address,
                        index,
                        fluid = %name,
                        elapsed_ms = started.elapsed().as_millis(),
                        "Fluid switch confirmed"
                    );
                    return Ok(target);
                }
                Ok((current, name)) => last_seen = format!("index {current}, name {name:?}"),
                Err(e) => last_seen = format!("no readback ({e})"),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(self.config.fluid_poll_interval.min(deadline - now));
        }

        Err(FlowError::VerificationFailed {
            parameter: Parameter::FLUID_INDEX.name.to_string(),
            expected: index.to_string(),
            actual: last_seen,
        })
    }

    fn read_fluid(&self, address: Address) -> FlowResult<(i64, String)> {
        let index = self.transport.read(address, Parameter::FLUID_INDEX)?;
        let name = self.transport.read(address, Parameter::FLUID_NAME)?;
        let index = index
            .as_i64()
            .ok_or_else(|| FlowError::Protocol(format!("fluid index {index} is not an integer")))?;
        let name = name.as_text().map(str::to_string).unwrap_or_default();
        Ok((index, name))
    }
}
