//! In-memory simulated bus.
//!
//! Models a port with a handful of flow instruments at the parameter level
//! (no byte protocol). Used by tests for fault injection and by the daemon
//! when no hardware is available.
//!
//! Instruments behave like an ideal controller: the measured flow equals
//! the flow setpoint. Test hooks:
//! - scripted per-address faults ([`SimulatedBus::inject_faults`])
//! - an address that stops answering ([`SimulatedBus::set_offline`])
//! - dropped master connections ([`SimulatedBus::drop_connections`])
//! - slow fluid switches ([`SimulatedBus::set_fluid_switch_delay`])
//! - slow port opening ([`SimulatedBus::set_connect_delay`])
//! - an in-flight flag that counts overlapping requests
//!   ([`SimulatedBus::exclusivity_violations`])

use crate::{Connector, TransportClient};
use flowbus_common::{
    Address, FlowError, FlowResult, ParamValue, Parameter, PortName, WriteStatus,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

/// Fluid table loaded into every simulated instrument.
pub const DEFAULT_FLUIDS: &[&str] = &["Air", "N2", "O2", "Ar", "CO2", "H2", "He", "CH4"];

/// Full scale of the percent setpoint.
const PERCENT_FULL_SCALE: f64 = 32_000.0;

/// Status codes returned for rejected writes.
const STATUS_TYPE_MISMATCH: u8 = 2;
const STATUS_UNKNOWN_PARAMETER: u8 = 3;
const STATUS_OUT_OF_RANGE: u8 = 5;

/// Scripted failure for the next request to an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The instrument does not answer.
    NoResponse,
    /// The reply is corrupt.
    Protocol,
    /// The master connection dies.
    ConnectionLost,
    /// A write is applied but its acknowledgement is lost. Reads time out.
    AckLost,
}

#[derive(Debug)]
struct SimInstrument {
    capacity: f64,
    flow_setpoint: f64,
    percent_setpoint: i64,
    fluid_index: u8,
    pending_fluid: Option<(u8, Instant)>,
    fluid_switch_delay: Duration,
    user_tag: String,
    faults: VecDeque<Fault>,
    offline: bool,
    requests: u64,
}

impl SimInstrument {
    fn new() -> Self {
        Self {
            capacity: 100.0,
            flow_setpoint: 0.0,
            percent_setpoint: 0,
            fluid_index: 0,
            pending_fluid: None,
            fluid_switch_delay: Duration::ZERO,
            user_tag: String::new(),
            faults: VecDeque::new(),
            offline: false,
            requests: 0,
        }
    }

    fn settle_fluid(&mut self, now: Instant) {
        if let Some((index, at)) = self.pending_fluid {
            if now >= at {
                self.fluid_index = index;
                self.pending_fluid = None;
            }
        }
    }

    fn read(&self, param: Parameter, fluids: &[String]) -> FlowResult<ParamValue> {
        let value = match param {
            p if p == Parameter::MEASURED_FLOW || p == Parameter::FLOW_SETPOINT => {
                ParamValue::Float(self.flow_setpoint)
            }
            p if p == Parameter::MEASURE || p == Parameter::SETPOINT => {
                ParamValue::Int(self.percent_setpoint)
            }
            p if p == Parameter::FLUID_INDEX => ParamValue::Int(i64::from(self.fluid_index)),
            p if p == Parameter::FLUID_NAME => {
                // The name is blank while the fluid table reloads
                let name = if self.pending_fluid.is_some() {
                    String::new()
                } else {
                    fluids
                        .get(usize::from(self.fluid_index))
                        .cloned()
                        .unwrap_or_default()
                };
                ParamValue::Text(name)
            }
            p if p == Parameter::USER_TAG => ParamValue::Text(self.user_tag.clone()),
            other => {
                return Err(FlowError::DeviceStatus {
                    code: STATUS_UNKNOWN_PARAMETER,
                    message: format!("unknown parameter {other}"),
                })
            }
        };
        Ok(value)
    }

    /// Apply a write. Returns the status and, for a delayed fluid switch,
    /// how long the instrument takes before it acknowledges.
    #[allow(clippy::cast_possible_truncation)]
    fn write(
        &mut self,
        param: Parameter,
        value: &ParamValue,
        fluids: &[String],
        now: Instant,
    ) -> (WriteStatus, Option<Duration>) {
        if value.check_type(param.value_type).is_err() {
            return (WriteStatus::Rejected(STATUS_TYPE_MISMATCH), None);
        }
        match (param, value) {
            (p, ParamValue::Float(v)) if p == Parameter::FLOW_SETPOINT => {
                if *v < 0.0 || *v > self.capacity {
                    return (WriteStatus::Rejected(STATUS_OUT_OF_RANGE), None);
                }
                self.flow_setpoint = *v;
                self.percent_setpoint = (v / self.capacity * PERCENT_FULL_SCALE).round() as i64;
            }
            (p, ParamValue::Int(v)) if p == Parameter::SETPOINT => {
                if !(0..=32_000).contains(v) {
                    return (WriteStatus::Rejected(STATUS_OUT_OF_RANGE), None);
                }
                self.percent_setpoint = *v;
                #[allow(clippy::cast_precision_loss)]
                let fraction = *v as f64 / PERCENT_FULL_SCALE;
                self.flow_setpoint = fraction * self.capacity;
            }
            (p, ParamValue::Int(v)) if p == Parameter::FLUID_INDEX => {
                let Ok(index) = u8::try_from(*v) else {
                    return (WriteStatus::Rejected(STATUS_OUT_OF_RANGE), None);
                };
                if usize::from(index) >= fluids.len() {
                    return (WriteStatus::Rejected(STATUS_OUT_OF_RANGE), None);
                }
                if self.fluid_switch_delay.is_zero() {
                    self.fluid_index = index;
                    self.pending_fluid = None;
                } else {
                    self.pending_fluid = Some((index, now + self.fluid_switch_delay));
                    return (WriteStatus::Ok, Some(self.fluid_switch_delay));
                }
            }
            (p, ParamValue::Text(s)) if p == Parameter::USER_TAG => {
                self.user_tag = s.chars().take(16).collect();
            }
            _ => return (WriteStatus::Rejected(STATUS_UNKNOWN_PARAMETER), None),
        }
        (WriteStatus::Ok, None)
    }
}

#[derive(Debug)]
struct BusState {
    instruments: BTreeMap<Address, SimInstrument>,
    fluids: Vec<String>,
    /// Bumped whenever the link drops; clients of older epochs are dead.
    epoch: u64,
    refuse_connects: u32,
    connect_delay: Duration,
    latency: Duration,
}

#[derive(Debug)]
struct BusShared {
    state: Mutex<BusState>,
    in_flight: AtomicBool,
    violations: AtomicU64,
    requests: AtomicU64,
    connects: AtomicU64,
}

/// Marks a request in flight for as long as it lives.
struct InFlight<'a>(&'a BusShared);

impl<'a> InFlight<'a> {
    fn enter(shared: &'a BusShared) -> Self {
        if shared.in_flight.swap(true, Ordering::AcqRel) {
            shared.violations.fetch_add(1, Ordering::Relaxed);
        }
        shared.requests.fetch_add(1, Ordering::Relaxed);
        Self(shared)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

/// Simulated serial bus for one port.
///
/// Cheap to clone; clones share the same instruments. Also acts as the
/// port's [`Connector`].
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    shared: Arc<BusShared>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBus {
    /// Create a bus with no instruments.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(BusShared {
                state: Mutex::new(BusState {
                    instruments: BTreeMap::new(),
                    fluids: DEFAULT_FLUIDS.iter().map(|s| (*s).to_string()).collect(),
                    epoch: 0,
                    refuse_connects: 0,
                    connect_delay: Duration::ZERO,
                    latency: Duration::ZERO,
                }),
                in_flight: AtomicBool::new(false),
                violations: AtomicU64::new(0),
                requests: AtomicU64::new(0),
                connects: AtomicU64::new(0),
            }),
        }
    }

    /// Create a bus with one instrument per address.
    #[must_use]
    pub fn with_instruments(addresses: &[Address]) -> Self {
        let bus = Self::new();
        for address in addresses {
            bus.add_instrument(*address);
        }
        bus
    }

    /// Attach an instrument (fluid 0, setpoint 0). Replaces any existing one.
    pub fn add_instrument(&self, address: Address) {
        self.shared
            .state
            .lock()
            .instruments
            .insert(address, SimInstrument::new());
    }

    /// Queue `count` failures of kind `fault` for the next requests to `address`.
    pub fn inject_faults(&self, address: Address, fault: Fault, count: usize) {
        if let Some(inst) = self.shared.state.lock().instruments.get_mut(&address) {
            inst.faults.extend(std::iter::repeat(fault).take(count));
        }
    }

    /// Make `address` stop (or resume) answering.
    pub fn set_offline(&self, address: Address, offline: bool) {
        if let Some(inst) = self.shared.state.lock().instruments.get_mut(&address) {
            inst.offline = offline;
        }
    }

    /// Time `address` needs to apply a fluid index write.
    ///
    /// The write blocks until the switch is applied or the response
    /// timeout expires, whichever comes first. Until it is applied the
    /// instrument reports the old index and a blank fluid name.
    pub fn set_fluid_switch_delay(&self, address: Address, delay: Duration) {
        if let Some(inst) = self.shared.state.lock().instruments.get_mut(&address) {
            inst.fluid_switch_delay = delay;
        }
    }

    /// Delay added to every request.
    pub fn set_latency(&self, latency: Duration) {
        self.shared.state.lock().latency = latency;
    }

    /// Kill every open connection.
    pub fn drop_connections(&self) {
        self.shared.state.lock().epoch += 1;
    }

    /// Make the next `count` connection attempts fail.
    pub fn refuse_connects(&self, count: u32) {
        self.shared.state.lock().refuse_connects = count;
    }

    /// Time the port takes to open.
    ///
    /// A connection attempt waits until the delay has passed or the
    /// connect timeout expires, and fails with a timeout in the latter case.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.shared.state.lock().connect_delay = delay;
    }

    /// Current flow setpoint of `address`.
    #[must_use]
    pub fn flow_setpoint(&self, address: Address) -> Option<f64> {
        self.shared
            .state
            .lock()
            .instruments
            .get(&address)
            .map(|i| i.flow_setpoint)
    }

    /// Active fluid index of `address`.
    #[must_use]
    pub fn fluid_index(&self, address: Address) -> Option<u8> {
        let mut state = self.shared.state.lock();
        let inst = state.instruments.get_mut(&address)?;
        inst.settle_fluid(Instant::now());
        Some(inst.fluid_index)
    }

    /// Stored user tag of `address`.
    #[must_use]
    pub fn user_tag(&self, address: Address) -> Option<String> {
        self.shared
            .state
            .lock()
            .instruments
            .get(&address)
            .map(|i| i.user_tag.clone())
    }

    /// Requests that reached `address`.
    #[must_use]
    pub fn requests_to(&self, address: Address) -> u64 {
        self.shared
            .state
            .lock()
            .instruments
            .get(&address)
            .map_or(0, |i| i.requests)
    }

    /// Requests issued on the bus.
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.shared.requests.load(Ordering::Relaxed)
    }

    /// Connections opened.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.shared.connects.load(Ordering::Relaxed)
    }

    /// Requests that started while another was in flight.
    #[must_use]
    pub fn exclusivity_violations(&self) -> u64 {
        self.shared.violations.load(Ordering::Relaxed)
    }
}

impl Connector for SimulatedBus {
    fn connect(&self, port: &PortName, timeout: Duration) -> FlowResult<Box<dyn TransportClient>> {
        let delay = {
            let mut state = self.shared.state.lock();
            if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                return Err(FlowError::ConnectionLost(format!("cannot open {port}")));
            }
            state.connect_delay
        };
        if !delay.is_zero() {
            thread::sleep(delay.min(timeout));
        }
        if delay > timeout {
            return Err(FlowError::Timeout(format!(
                "opening {port} took longer than {}ms",
                timeout.as_millis()
            )));
        }

        let state = self.shared.state.lock();
        self.shared.connects.fetch_add(1, Ordering::Relaxed);
        trace!(%port, epoch = state.epoch, "Simulated connection opened");
        Ok(Box::new(SimulatedClient {
            shared: Arc::clone(&self.shared),
            epoch: state.epoch,
            timeout: Duration::from_secs(1),
        }))
    }
}

/// One connection to a [`SimulatedBus`].
#[derive(Debug)]
pub struct SimulatedClient {
    shared: Arc<BusShared>,
    epoch: u64,
    timeout: Duration,
}

impl SimulatedClient {
    /// Run one request against `address` with faults and liveness applied.
    /// The caller holds the in-flight marker.
    fn transact<T>(
        &self,
        address: Address,
        is_write: bool,
        op: impl FnOnce(&mut SimInstrument, &[String], Instant) -> FlowResult<T>,
    ) -> FlowResult<T> {
        let latency = {
            let state = self.shared.state.lock();
            if state.epoch != self.epoch {
                return Err(FlowError::ConnectionLost("serial link closed".into()));
            }
            state.latency
        };
        if !latency.is_zero() {
            thread::sleep(latency);
        }

        let now = Instant::now();
        let mut state = self.shared.state.lock();
        let BusState {
            instruments,
            fluids,
            epoch,
            ..
        } = &mut *state;
        let Some(inst) = instruments.get_mut(&address) else {
            return Err(FlowError::Timeout(format!("no answer from address {address}")));
        };
        inst.requests += 1;
        if inst.offline {
            return Err(FlowError::Timeout(format!("no answer from address {address}")));
        }

        match inst.faults.pop_front() {
            None => {}
            Some(Fault::NoResponse) => {
                return Err(FlowError::Timeout(format!("no answer from address {address}")));
            }
            Some(Fault::Protocol) => {
                return Err(FlowError::Protocol(format!("corrupt reply from address {address}")));
            }
            Some(Fault::ConnectionLost) => {
                *epoch += 1;
                return Err(FlowError::ConnectionLost("serial device vanished".into()));
            }
            Some(Fault::AckLost) => {
                if is_write {
                    op(inst, fluids, now).ok();
                }
                return Err(FlowError::Timeout(format!("no ack from address {address}")));
            }
        }

        inst.settle_fluid(now);
        op(inst, fluids, now)
    }
}

impl TransportClient for SimulatedClient {
    fn read_parameter(&mut self, address: Address, param: Parameter) -> FlowResult<ParamValue> {
        let _in_flight = InFlight::enter(&self.shared);
        self.transact(address, false, |inst, fluids, _| inst.read(param, fluids))
    }

    fn write_parameter(
        &mut self,
        address: Address,
        param: Parameter,
        value: &ParamValue,
        _verify: bool,
    ) -> FlowResult<WriteStatus> {
        let _in_flight = InFlight::enter(&self.shared);
        let (status, ack_delay) = self.transact(address, true, |inst, fluids, now| {
            Ok(inst.write(param, value, fluids, now))
        })?;

        if let Some(delay) = ack_delay {
            thread::sleep(delay.min(self.timeout));
            if delay > self.timeout {
                return Err(FlowError::Timeout(format!(
                    "no ack from address {address} within {:?}",
                    self.timeout
                )));
            }
        }
        Ok(status)
    }

    fn bulk_read(&mut self, address: Address, params: &[Parameter]) -> FlowResult<Vec<ParamValue>> {
        let _in_flight = InFlight::enter(&self.shared);
        self.transact(address, false, |inst, fluids, _| {
            params.iter().map(|p| inst.read(*p, fluids)).collect()
        })
    }

    fn discover_nodes(&mut self) -> FlowResult<Vec<Address>> {
        let _in_flight = InFlight::enter(&self.shared);
        let state = self.shared.state.lock();
        if state.epoch != self.epoch {
            return Err(FlowError::ConnectionLost("serial link closed".into()));
        }
        Ok(state
            .instruments
            .iter()
            .filter(|(_, inst)| !inst.offline)
            .map(|(address, _)| *address)
            .collect())
    }

    fn set_response_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn response_timeout(&self) -> Duration {
        self.timeout
    }

    fn is_alive(&self) -> bool {
        self.shared.state.lock().epoch == self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(v: u8) -> Address {
        Address::new(v).unwrap()
    }

    fn client(bus: &SimulatedBus) -> Box<dyn TransportClient> {
        bus.connect(&PortName::new("sim0"), Duration::from_secs(1))
            .unwrap()
    }

    #[test]
    fn test_measured_flow_follows_setpoint() {
        let bus = SimulatedBus::with_instruments(&[addr(3)]);
        let mut c = client(&bus);

        let status = c
            .write_parameter(addr(3), Parameter::FLOW_SETPOINT, &ParamValue::Float(42.5), true)
            .unwrap();
        assert_eq!(status, WriteStatus::Ok);

        let values = c
            .bulk_read(addr(3), &[Parameter::MEASURED_FLOW, Parameter::FLUID_NAME])
            .unwrap();
        assert_eq!(values[0], ParamValue::Float(42.5));
        assert_eq!(values[1], ParamValue::Text("Air".into()));
        assert_eq!(
            c.read_parameter(addr(3), Parameter::SETPOINT).unwrap(),
            ParamValue::Int(13_600)
        );
    }

    #[test]
    fn test_scripted_faults_consumed_in_order() {
        let bus = SimulatedBus::with_instruments(&[addr(1)]);
        bus.inject_faults(addr(1), Fault::Protocol, 1);
        bus.inject_faults(addr(1), Fault::NoResponse, 1);
        let mut c = client(&bus);

        let read = |c: &mut Box<dyn TransportClient>| c.read_parameter(addr(1), Parameter::FLUID_INDEX);
        assert!(matches!(read(&mut c), Err(FlowError::Protocol(_))));
        assert!(matches!(read(&mut c), Err(FlowError::Timeout(_))));
        assert!(read(&mut c).is_ok());
    }

    #[test]
    fn test_connection_lost_kills_client() {
        let bus = SimulatedBus::with_instruments(&[addr(1)]);
        bus.inject_faults(addr(1), Fault::ConnectionLost, 1);
        let mut c = client(&bus);

        assert!(c.is_alive());
        assert!(matches!(
            c.read_parameter(addr(1), Parameter::FLUID_NAME),
            Err(FlowError::ConnectionLost(_))
        ));
        assert!(!c.is_alive());
        assert!(client(&bus).is_alive());
    }

    #[test]
    fn test_ack_lost_still_applies_write() {
        let bus = SimulatedBus::with_instruments(&[addr(2)]);
        bus.inject_faults(addr(2), Fault::AckLost, 1);
        let mut c = client(&bus);

        let result =
            c.write_parameter(addr(2), Parameter::FLOW_SETPOINT, &ParamValue::Float(10.0), true);
        assert!(matches!(result, Err(FlowError::Timeout(_))));
        assert_eq!(bus.flow_setpoint(addr(2)), Some(10.0));
    }

    #[test]
    fn test_slow_fluid_switch() {
        let bus = SimulatedBus::with_instruments(&[addr(4)]);
        bus.set_fluid_switch_delay(addr(4), Duration::from_millis(200));
        let mut c = client(&bus);
        c.set_response_timeout(Duration::from_millis(50));

        let result = c.write_parameter(addr(4), Parameter::FLUID_INDEX, &ParamValue::Int(3), true);
        assert!(matches!(result, Err(FlowError::Timeout(_))));

        // Old index and blank name until the switch lands
        assert_eq!(
            c.read_parameter(addr(4), Parameter::FLUID_INDEX).unwrap(),
            ParamValue::Int(0)
        );
        assert_eq!(
            c.read_parameter(addr(4), Parameter::FLUID_NAME).unwrap(),
            ParamValue::Text(String::new())
        );

        thread::sleep(Duration::from_millis(200));
        assert_eq!(
            c.read_parameter(addr(4), Parameter::FLUID_NAME).unwrap(),
            ParamValue::Text("Ar".into())
        );
        assert_eq!(bus.fluid_index(addr(4)), Some(3));
    }

    #[test]
    fn test_fluid_switch_within_timeout_acks() {
        let bus = SimulatedBus::with_instruments(&[addr(4)]);
        bus.set_fluid_switch_delay(addr(4), Duration::from_millis(30));
        let mut c = client(&bus);
        c.set_response_timeout(Duration::from_millis(500));

        let status = c
            .write_parameter(addr(4), Parameter::FLUID_INDEX, &ParamValue::Int(1), true)
            .unwrap();
        assert_eq!(status, WriteStatus::Ok);
        assert_eq!(
            c.read_parameter(addr(4), Parameter::FLUID_NAME).unwrap(),
            ParamValue::Text("N2".into())
        );
    }

    #[test]
    fn test_usertag_truncated_and_bad_values_rejected() {
        let bus = SimulatedBus::with_instruments(&[addr(9)]);
        let mut c = client(&bus);

        c.write_parameter(
            addr(9),
            Parameter::USER_TAG,
            &ParamValue::Text("reactor-inlet-line-A".into()),
            true,
        )
        .unwrap();
        assert_eq!(bus.user_tag(addr(9)).as_deref(), Some("reactor-inlet-li"));

        let status = c
            .write_parameter(addr(9), Parameter::FLUID_INDEX, &ParamValue::Int(200), true)
            .unwrap();
        assert_eq!(status, WriteStatus::Rejected(STATUS_OUT_OF_RANGE));
    }

    #[test]
    fn test_unknown_address_times_out() {
        let bus = SimulatedBus::with_instruments(&[addr(1)]);
        let mut c = client(&bus);
        assert!(matches!(
            c.read_parameter(addr(99), Parameter::MEASURED_FLOW),
            Err(FlowError::Timeout(_))
        ));
        assert_eq!(c.discover_nodes().unwrap(), vec![addr(1)]);
    }

    #[test]
    fn test_slow_port_open_bounded_by_connect_timeout() {
        let bus = SimulatedBus::with_instruments(&[addr(1)]);
        bus.set_connect_delay(Duration::from_millis(300));
        let port = PortName::new("sim0");

        let started = Instant::now();
        let result = bus.connect(&port, Duration::from_millis(50));
        let elapsed = started.elapsed();
        assert!(matches!(result, Err(FlowError::Timeout(_))));
        assert!(elapsed < Duration::from_millis(250), "waited {elapsed:?}");
        assert_eq!(bus.connect_count(), 0);

        assert!(bus.connect(&port, Duration::from_millis(500)).is_ok());
        assert_eq!(bus.connect_count(), 1);
    }

    #[test]
    fn test_overlap_detected() {
        let bus = SimulatedBus::with_instruments(&[addr(1)]);
        bus.set_latency(Duration::from_millis(20));
        let mut a = client(&bus);
        let mut b = client(&bus);

        let t = thread::spawn(move || {
            for _ in 0..5 {
                a.read_parameter(addr(1), Parameter::MEASURED_FLOW).unwrap();
            }
        });
        for _ in 0..5 {
            b.read_parameter(addr(1), Parameter::MEASURED_FLOW).unwrap();
        }
        t.join().unwrap();

        // Two unsynchronized clients on one bus collide
        assert!(bus.exclusivity_violations() > 0);
    }
}
