//! Write verification round trip.
//!
//! Every write is either confirmed (the instrument holds the value) or
//! reported with an error event.

use super::common::{addr, ms, spawn_port, test_config, EventLog};
use flowbus_common::{ErrorKind, Parameter};
use flowbus_poller::{command::flow_tolerance, Command, ErrorEvent, Event};
use flowbus_transport::{Fault, SimulatedBus};

fn finished(e: &Event) -> bool {
    matches!(e, Event::Telemetry(_))
}

#[test]
fn test_lost_ack_confirmed_by_readback() {
    let bus = SimulatedBus::with_instruments(&[addr(4)]);
    bus.inject_faults(addr(4), Fault::AckLost, 1);
    let mut port = spawn_port(&bus, test_config());
    let mut log = EventLog::new(port.subscribe());

    port.enqueue_command(Command::flow_setpoint(addr(4), 37.25)).unwrap();
    let Some(Event::Telemetry(t)) = log.wait_for(ms(2000), finished) else {
        panic!("no telemetry");
    };
    assert!(t.success);

    let stored = port
        .diagnostic_read(addr(4), Parameter::FLOW_SETPOINT)
        .unwrap()
        .as_f64()
        .unwrap();
    assert!((stored - 37.25).abs() <= flow_tolerance(37.25));
    assert_eq!(log.count(|e| matches!(e, Event::Error(_))), 0);
    port.stop();
}

#[test]
fn test_unverifiable_write_reports_error() {
    let bus = SimulatedBus::with_instruments(&[addr(4)]);
    let mut port = spawn_port(&bus, test_config());
    let mut log = EventLog::new(port.subscribe());

    // Write and every readback go unanswered
    bus.inject_faults(addr(4), Fault::NoResponse, 10);
    port.enqueue_command(Command::user_tag(addr(4), "a-very-long-user-tag")).unwrap();
    let Some(Event::Telemetry(t)) = log.wait_for(ms(2000), finished) else {
        panic!("no telemetry");
    };
    assert!(!t.success);
    log.collect_for(ms(50));
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
    port.stop();
}

#[test]
fn test_user_tag_truncated_to_device_limit() {
    let bus = SimulatedBus::with_instruments(&[addr(6)]);
    let mut port = spawn_port(&bus, test_config());
    let mut log = EventLog::new(port.subscribe());

    port.enqueue_command(Command::user_tag(addr(6), "reactor-3-inlet-line-b")).unwrap();
    let Some(Event::Telemetry(t)) = log.wait_for(ms(2000), finished) else {
        panic!("no telemetry");
    };
    assert!(t.success);
    assert_eq!(bus.user_tag(addr(6)).as_deref(), Some("reactor-3-inlet-"));
    port.stop();
}
