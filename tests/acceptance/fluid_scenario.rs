//! Fluid switch scenario.
//!
//! The instrument needs seconds to reflect a new fluid index. The port
//! worker blocks on the write with the extended timeout, so polling
//! stalls, but never for longer than that timeout plus one period, and the
//! command reports exactly one outcome.

use super::common::{addr, ms, spawn_port, test_config, EventLog};
use flowbus_common::ErrorKind;
use flowbus_poller::{Command, ErrorEvent, Event, TelemetryEvent, TelemetryKind};
use flowbus_transport::SimulatedBus;

const PERIOD_MS: u64 = 200;

fn telemetry(log: &EventLog) -> Vec<TelemetryEvent> {
    log.events
        .iter()
        .filter_map(|l| match &l.event {
            Event::Telemetry(t) => Some(t.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_slow_fluid_switch_bounded_gap() {
    let bus = SimulatedBus::with_instruments(&[addr(1)]);
    bus.set_fluid_switch_delay(addr(1), ms(2000));
    let config = test_config();
    let write_timeout = config.commands.fluid_write_timeout;
    let mut port = spawn_port(&bus, config);
    let mut log = EventLog::new(port.subscribe());

    port.register_address(addr(1), ms(PERIOD_MS)).unwrap();
    log.collect_for(ms(3 * PERIOD_MS));

    port.enqueue_command(Command::fluid_index(addr(1), 3)).unwrap();
    log.wait_for(ms(6000), |e| matches!(e, Event::Telemetry(_)))
        .expect("fluid command never finished");
    log.collect_for(ms(3 * PERIOD_MS));

    let outcomes = telemetry(&log);
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success);
    assert_eq!(outcomes[0].kind, TelemetryKind::FluidIndex);
    assert_eq!(outcomes[0].value, "3");
    assert_eq!(log.count(|e| matches!(e, Event::Error(_))), 0);
    assert_eq!(bus.fluid_index(addr(1)), Some(3));

    let gap = log.max_measurement_gap(addr(1));
    assert!(
        gap <= write_timeout + ms(PERIOD_MS) + ms(100),
        "measurement gap {gap:?}"
    );
    let measurements = log.measurements(addr(1));
    let (_, last) = measurements.last().unwrap();
    assert_eq!(last.fluid_name, "Ar");
    port.stop();
}

#[test]
fn test_fluid_switch_gives_up_at_deadline() {
    let bus = SimulatedBus::with_instruments(&[addr(2)]);
    bus.set_fluid_switch_delay(addr(2), ms(10_000));
    let mut config = test_config();
    config.commands.fluid_write_timeout = ms(300);
    config.commands.fluid_poll_interval = ms(100);
    config.commands.fluid_deadline = ms(1000);
    let mut port = spawn_port(&bus, config);
    let mut log = EventLog::new(port.subscribe());

    port.register_address(addr(2), ms(PERIOD_MS)).unwrap();
    port.enqueue_command(Command::fluid_index(addr(2), 5)).unwrap();
    log.wait_for(ms(3000), |e| matches!(e, Event::Telemetry(_)))
        .expect("fluid command never finished");
    log.collect_for(ms(3 * PERIOD_MS));

    let outcomes = telemetry(&log);
    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].success);
    assert_eq!(
        log.count(|e| matches!(
            e,
            Event::Error(ErrorEvent {
                kind: ErrorKind::Verification,
                ..
            })
        )),
        1
    );
    // Polling carries on after the failed switch
    assert!(log.measurements(addr(2)).len() >= 2);
    port.stop();
}
