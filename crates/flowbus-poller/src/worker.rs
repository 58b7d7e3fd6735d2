//! Port worker: one thread per serial port.
//!
//! Each loop iteration:
//! 1. Apply pending registration changes and serve diagnostic reads
//! 2. Execute at most one queued command
//! 3. Idle, wait for the next due poll, or poll one address
//!
//! All transport traffic and all health bookkeeping of the port happen on
//! this thread, so a diagnostic read never lands between a command's write
//! and its readback. Callers talk to it through a [`PortHandle`]: channels
//! for commands, registrations and diagnostic reads, an [`EventHub`] for
//! results, and a shared cell holding the latest [`ConnectionStats`].

use crate::command::{Command, CommandProcessor};
use crate::events::{ErrorEvent, Event, EventHub, MeasurementEvent, TelemetryEvent};
use crate::health::{FailureOutcome, HealthTracker, SuccessOutcome};
use crate::scheduler::{NextAction, PollScheduler, ScheduleEntry};
use crate::stats::{AddressStats, ConnectionStats};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use flowbus_common::{
    Address, ErrorKind, FlowError, FlowResult, IntervalMetrics, ParamValue, Parameter, PortName,
    ServiceConfig,
};
use flowbus_transport::{Connector, InstrumentCache, ResilientTransport, RetryPolicy};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, trace, warn};

/// Parameters read by every poll.
pub const POLL_PARAMETERS: [Parameter; 2] = [Parameter::MEASURED_FLOW, Parameter::FLUID_NAME];

/// Out-of-band requests sent to the worker.
#[derive(Debug, Clone)]
enum Control {
    Register { address: Address, period: Duration },
    Unregister(Address),
    DiagnosticRead {
        address: Address,
        param: Parameter,
        reply: Sender<FlowResult<ParamValue>>,
    },
}

/// Per-address poll bookkeeping.
#[derive(Debug)]
struct PollRecord {
    intervals: IntervalMetrics,
    last_poll: Option<Instant>,
    polls: u64,
    successful_polls: u64,
    skipped_polls: u64,
    last_value: Option<f64>,
    fluid_name: Option<String>,
}

/// State owned by the worker thread.
struct PortWorker {
    port: PortName,
    config: ServiceConfig,
    scheduler: PollScheduler,
    health: HealthTracker,
    processor: CommandProcessor,
    transport: ResilientTransport,
    hub: Arc<EventHub>,
    commands: Receiver<Command>,
    control: Receiver<Control>,
    stats: Arc<Mutex<ConnectionStats>>,
    stop: Arc<AtomicBool>,
    records: HashMap<Address, PollRecord>,
    started: Instant,
    commands_processed: u64,
    commands_failed: u64,
}

impl PortWorker {
    fn run(mut self) {
        info!(port = %self.port, "Port worker started");

        while !self.stop.load(Ordering::Acquire) {
            if !self.iteration() {
                break;
            }
        }

        self.publish_stats();
        info!(
            port = %self.port,
            commands = self.commands_processed,
            events = self.hub.published(),
            "Port worker exited"
        );
    }

    /// Run one loop iteration. Returns false once every handle is gone.
    fn iteration(&mut self) -> bool {
        let mut changed = match self.drain_control() {
            Some(changed) => changed,
            None => return false,
        };

        match self.commands.try_recv() {
            Ok(command) => {
                self.handle_command(&command);
                changed = true;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return false,
        }

        match self.scheduler.next_action(Instant::now()) {
            NextAction::Idle => {
                if changed {
                    self.publish_stats();
                }
                thread::sleep(self.config.scheduler.idle_sleep);
            }
            NextAction::Wait(duration) => {
                if changed {
                    self.publish_stats();
                }
                thread::sleep(duration);
            }
            NextAction::Service(entry) => {
                self.service(entry);
                self.publish_stats();
            }
        }
        true
    }

    /// Apply every pending registration change and answer pending
    /// diagnostic reads. Returns `None` once the control channel is
    /// disconnected.
    fn drain_control(&mut self) -> Option<bool> {
        let mut changed = false;
        loop {
            match self.control.try_recv() {
                Ok(Control::Register { address, period }) => {
                    if self.scheduler.register(address, period, Instant::now()) {
                        info!(port = %self.port, %address, period_ms = period.as_millis(), "Polling address");
                        self.records.insert(address, self.new_record(period));
                        changed = true;
                    }
                }
                Ok(Control::Unregister(address)) => {
                    if self.scheduler.unregister(address) {
                        info!(port = %self.port, %address, "Stopped polling address");
                        self.records.remove(&address);
                        self.health.remove(address);
                        self.transport.cache().invalidate(address);
                        changed = true;
                    }
                }
                Ok(Control::DiagnosticRead {
                    address,
                    param,
                    reply,
                }) => {
                    debug!(port = %self.port, %address, %param, "Diagnostic read");
                    let result = self.transport.read(address, param);
                    // The caller may have given up waiting
                    let _ = reply.send(result);
                }
                Err(TryRecvError::Empty) => return Some(changed),
                Err(TryRecvError::Disconnected) => return None,
            }
        }
    }

    fn new_record(&self, period: Duration) -> PollRecord {
        PollRecord {
            intervals: IntervalMetrics::new(
                self.config.metrics.histogram_size,
                period,
                self.config.scheduler.fairness_window,
            ),
            last_poll: None,
            polls: 0,
            successful_polls: 0,
            skipped_polls: 0,
            last_value: None,
            fluid_name: None,
        }
    }

    /// Poll one address and put its entry back on the schedule.
    fn service(&mut self, entry: ScheduleEntry) {
        let address = entry.address;
        let now = Instant::now();

        if self.health.is_disabled(address, now) {
            trace!(port = %self.port, %address, "Skipping disabled address");
            if let Some(record) = self.records.get_mut(&address) {
                record.skipped_polls += 1;
            }
            self.scheduler.reschedule(entry, now);
            return;
        }

        if let Some(record) = self.records.get_mut(&address) {
            if let Some(last) = record.last_poll {
                record.intervals.record(now - last);
            }
            record.last_poll = Some(now);
            record.polls += 1;
        }

        let result = self
            .transport
            .bulk_read(address, &POLL_PARAMETERS)
            .and_then(|values| parse_measurement(&values));

        match result {
            Ok((value, fluid_name)) => {
                if let Some(record) = self.records.get_mut(&address) {
                    record.successful_polls += 1;
                    record.last_value = Some(value);
                    record.fluid_name = Some(fluid_name.clone());
                }
                trace!(port = %self.port, %address, value, fluid = %fluid_name, "Measurement");
                self.hub.publish(Event::Measurement(MeasurementEvent {
                    port: self.port.clone(),
                    address,
                    value,
                    fluid_name,
                    timestamp: SystemTime::now(),
                }));
                self.record_success(address);
            }
            Err(e) => {
                debug!(port = %self.port, %address, error = %e, "Poll failed");
                self.report_error(address, &e, "poll");
                self.record_failure(address);
            }
        }

        self.scheduler.complete(entry, Instant::now());
    }

    fn handle_command(&mut self, command: &Command) {
        let address = command.address;
        let result = if self.health.is_disabled(address, Instant::now()) {
            let consecutive = self
                .health
                .get(address)
                .map_or(0, |h| h.consecutive_errors);
            Err(FlowError::AddressDisabled {
                address: address.get(),
                consecutive,
            })
        } else {
            self.processor.execute(command)
        };

        self.commands_processed += 1;
        let success = result.is_ok();
        let value = match &result {
            Ok(confirmed) => confirmed.to_string(),
            Err(_) => command.kind.value().to_string(),
        };
        self.hub.publish(Event::Telemetry(TelemetryEvent {
            port: self.port.clone(),
            address,
            kind: command.kind.telemetry_kind(),
            name: command.kind.parameter().name.to_string(),
            value,
            success,
            timestamp: SystemTime::now(),
        }));

        match result {
            Ok(confirmed) => {
                info!(port = %self.port, %address, command = %command.kind, %confirmed, "Command confirmed");
                self.record_success(address);
            }
            Err(e) => {
                self.commands_failed += 1;
                warn!(port = %self.port, %address, command = %command.kind, error = %e, "Command failed");
                self.report_error(address, &e, "command");
                // Bad input and disabled addresses say nothing about the link
                if !matches!(e.kind(), ErrorKind::InvalidInput | ErrorKind::AddressDisabled) {
                    self.record_failure(address);
                }
            }
        }
    }

    fn report_error(&self, address: Address, err: &FlowError, context: &str) {
        self.hub.publish(Event::Error(ErrorEvent {
            port: self.port.clone(),
            address,
            kind: err.kind(),
            message: format!("{context}: {err}"),
        }));
    }

    fn record_success(&mut self, address: Address) {
        if let SuccessOutcome::Recovered {
            after_errors,
            recovery_count,
        } = self.health.record_success(address, Instant::now())
        {
            info!(port = %self.port, %address, after_errors, recovery_count, "Address recovered");
            self.hub.publish(Event::AddressRecovered {
                port: self.port.clone(),
                address,
                recovery_count,
            });
        }
    }

    fn record_failure(&mut self, address: Address) {
        match self.health.record_failure(address, Instant::now()) {
            FailureOutcome::Disabled { consecutive, .. } => {
                error!(
                    port = %self.port,
                    %address,
                    consecutive,
                    cooldown_ms = self.config.health.cooldown.as_millis(),
                    "Address disabled"
                );
                self.hub.publish(Event::AddressDisabled {
                    port: self.port.clone(),
                    address,
                    consecutive_errors: consecutive,
                    cooldown: self.config.health.cooldown,
                });
            }
            FailureOutcome::Degraded { consecutive } => {
                debug!(port = %self.port, %address, consecutive, "Address degraded");
            }
            FailureOutcome::AlreadyDisabled => {}
        }
    }

    fn publish_stats(&self) {
        let now = Instant::now();
        let mut addresses = std::collections::BTreeMap::new();

        let known = self
            .records
            .keys()
            .copied()
            .chain(self.health.addresses())
            .collect::<std::collections::BTreeSet<_>>();
        for address in known {
            let record = self.records.get(&address);
            addresses.insert(
                address,
                AddressStats {
                    period: self.scheduler.period_of(address),
                    health: self.health.snapshot(address, now),
                    polls: record.map_or(0, |r| r.polls),
                    successful_polls: record.map_or(0, |r| r.successful_polls),
                    skipped_polls: record.map_or(0, |r| r.skipped_polls),
                    intervals: record.map(|r| r.intervals.snapshot()).unwrap_or_default(),
                    last_value: record.and_then(|r| r.last_value),
                    fluid_name: record.and_then(|r| r.fluid_name.clone()),
                },
            );
        }

        let mut stats = self.stats.lock();
        stats.uptime = now - self.started;
        stats.addresses = addresses;
        stats.commands_processed = self.commands_processed;
        stats.commands_failed = self.commands_failed;
        stats.events_dropped = self.hub.dropped();
        stats.connection_generation = self.transport.cache().generation();
    }
}

/// Split a poll reply into flow and fluid name.
fn parse_measurement(values: &[ParamValue]) -> FlowResult<(f64, String)> {
    match values {
        [flow, name] => {
            let flow = flow
                .as_f64()
                .ok_or_else(|| FlowError::Protocol(format!("measured flow {flow} is not numeric")))?;
            let name = name
                .as_text()
                .ok_or_else(|| FlowError::Protocol(format!("fluid name {name} is not text")))?;
            Ok((flow, name.to_string()))
        }
        _ => Err(FlowError::Protocol(format!(
            "poll reply carried {} values",
            values.len()
        ))),
    }
}

/// Caller-side handle to a running port worker.
pub struct PortHandle {
    port: PortName,
    commands: Sender<Command>,
    control: Sender<Control>,
    hub: Arc<EventHub>,
    stats: Arc<Mutex<ConnectionStats>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    join_timeout: Duration,
    diagnostic_timeout: Duration,
}

impl std::fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortHandle")
            .field("port", &self.port)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl PortHandle {
    /// Port name.
    #[must_use]
    pub fn port(&self) -> &PortName {
        &self.port
    }

    /// Start polling `address` every `period`. Registering a known
    /// address has no effect.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::InvalidInput`] for a zero period, or
    /// [`FlowError::WorkerStopped`] if the worker has exited.
    pub fn register_address(&self, address: Address, period: Duration) -> FlowResult<()> {
        if period.is_zero() {
            return Err(FlowError::InvalidInput(format!(
                "zero poll period for address {address}"
            )));
        }
        self.control
            .send(Control::Register { address, period })
            .map_err(|_| FlowError::WorkerStopped(self.port.to_string()))
    }

    /// Stop polling `address`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::WorkerStopped`] if the worker has exited.
    pub fn unregister_address(&self, address: Address) -> FlowResult<()> {
        self.control
            .send(Control::Unregister(address))
            .map_err(|_| FlowError::WorkerStopped(self.port.to_string()))
    }

    /// Queue a command without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::QueueFull`] if the queue is at capacity, or
    /// [`FlowError::WorkerStopped`] if the worker has exited.
    pub fn enqueue_command(&self, command: Command) -> FlowResult<()> {
        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => FlowError::QueueFull(self.port.to_string()),
            TrySendError::Disconnected(_) => FlowError::WorkerStopped(self.port.to_string()),
        })
    }

    /// Commands waiting in the queue.
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    /// Subscribe to this port's events.
    pub fn subscribe(&self) -> Receiver<Event> {
        self.hub.subscribe()
    }

    /// Forward this port's events into `sender`.
    pub fn attach(&self, sender: Sender<Event>) {
        self.hub.attach(sender);
    }

    /// Latest statistics snapshot.
    #[must_use]
    pub fn connection_stats(&self) -> ConnectionStats {
        self.stats.lock().clone()
    }

    /// Read a parameter outside the polling schedule.
    ///
    /// The read runs on the worker thread between two loop iterations, so
    /// it waits for a command in progress to finish, readback included.
    ///
    /// # Errors
    ///
    /// Returns the transport error once retries are exhausted,
    /// [`FlowError::Timeout`] if the worker does not answer in time, or
    /// [`FlowError::WorkerStopped`] if the worker has exited.
    pub fn diagnostic_read(&self, address: Address, param: Parameter) -> FlowResult<ParamValue> {
        let (reply, result) = channel::bounded(1);
        self.control
            .send(Control::DiagnosticRead {
                address,
                param,
                reply,
            })
            .map_err(|_| FlowError::WorkerStopped(self.port.to_string()))?;

        match result.recv_timeout(self.diagnostic_timeout) {
            Ok(value) => value,
            Err(RecvTimeoutError::Timeout) => Err(FlowError::Timeout(format!(
                "diagnostic read of {param} at address {address} not served within {}ms",
                self.diagnostic_timeout.as_millis()
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(FlowError::WorkerStopped(self.port.to_string()))
            }
        }
    }

    /// True while the worker thread runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the worker and wait up to the join timeout for it to exit.
    ///
    /// Returns false if the worker was still busy at the timeout; it is
    /// then left to finish on its own.
    pub fn stop(&mut self) -> bool {
        self.stop.store(true, Ordering::Release);
        let Some(thread) = self.thread.take() else {
            return true;
        };

        let deadline = Instant::now() + self.join_timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    port = %self.port,
                    timeout_ms = self.join_timeout.as_millis(),
                    "Port worker did not stop in time, detaching"
                );
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }

        if thread.join().is_err() {
            error!(port = %self.port, "Port worker panicked");
        }
        true
    }
}

impl Drop for PortHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Builder for a port worker.
pub struct PortBuilder {
    port: PortName,
    connector: Arc<dyn Connector>,
    config: ServiceConfig,
}

impl PortBuilder {
    /// Start building a worker for `port`.
    pub fn new(port: impl Into<PortName>, connector: Arc<dyn Connector>) -> Self {
        Self {
            port: port.into(),
            connector,
            config: ServiceConfig::default(),
        }
    }

    /// Set the full service configuration.
    #[must_use]
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the disable threshold and cool-down.
    #[must_use]
    pub fn health(mut self, disable_threshold: u32, cooldown: Duration) -> Self {
        self.config.health.disable_threshold = disable_threshold;
        self.config.health.cooldown = cooldown;
        self
    }

    /// Set the command queue capacity.
    #[must_use]
    pub fn command_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.scheduler.command_queue_capacity = capacity;
        self
    }

    /// Spawn the worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Config`] if the thread cannot be spawned.
    pub fn spawn(self) -> FlowResult<PortHandle> {
        let config = self.config;
        let cache = Arc::new(InstrumentCache::new(
            self.port.clone(),
            self.connector,
            config.transport.default_timeout,
        )
        .with_connect_timeout(config.transport.connect_timeout));
        let transport = ResilientTransport::new(
            cache,
            RetryPolicy::from_config(&config.retry),
            config.transport.poll_timeout,
        );
        let hub = Arc::new(EventHub::new(config.scheduler.event_capacity));
        let stats = Arc::new(Mutex::new(ConnectionStats::new(self.port.clone())));
        let stop = Arc::new(AtomicBool::new(false));
        let (command_tx, command_rx) =
            channel::bounded(config.scheduler.command_queue_capacity.max(1));
        let (control_tx, control_rx) = channel::unbounded();

        let worker = PortWorker {
            port: self.port.clone(),
            scheduler: PollScheduler::new(&config.scheduler),
            health: HealthTracker::new(&config.health),
            processor: CommandProcessor::new(transport.clone(), config.commands.clone()),
            transport,
            hub: Arc::clone(&hub),
            commands: command_rx,
            control: control_rx,
            stats: Arc::clone(&stats),
            stop: Arc::clone(&stop),
            records: HashMap::new(),
            started: Instant::now(),
            commands_processed: 0,
            commands_failed: 0,
            config: config.clone(),
        };

        let thread = thread::Builder::new()
            .name(format!("flowbus-{}", self.port))
            .spawn(move || worker.run())
            .map_err(|e| FlowError::Config(format!("failed to spawn port worker: {e}")))?;

        Ok(PortHandle {
            port: self.port,
            commands: command_tx,
            control: control_tx,
            hub,
            stats,
            stop,
            thread: Some(thread),
            join_timeout: config.scheduler.join_timeout,
            // Longest command plus the read itself
            diagnostic_timeout: config.commands.fluid_write_timeout
                + config.commands.fluid_deadline
                + config.transport.default_timeout,
        })
    }
}
