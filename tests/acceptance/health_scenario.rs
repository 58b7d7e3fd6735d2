//! Health scenario: one of two addresses fails a streak of cycles.
//!
//! Addresses 1 and 2 are polled at the same period. Address 2 stops
//! answering; after `disable_threshold` failed cycles it is disabled and
//! skipped, while address 1 keeps producing measurements. Address 2 answers
//! again during the cool-down and is back to HEALTHY after it, with one
//! recorded recovery.

use super::common::{addr, ms, spawn_port, test_config, EventLog};
use flowbus_common::{ErrorKind, HealthState};
use flowbus_poller::{ErrorEvent, Event};
use flowbus_transport::SimulatedBus;
use std::thread;

const PERIOD_MS: u64 = 50;

#[test]
fn test_failing_address_disabled_and_recovers() {
    let bus = SimulatedBus::with_instruments(&[addr(1), addr(2)]);
    let mut config = test_config();
    config.health.disable_threshold = 10;
    config.health.cooldown = ms(1000);
    let mut port = spawn_port(&bus, config);
    let mut log = EventLog::new(port.subscribe());

    port.register_address(addr(1), ms(PERIOD_MS)).unwrap();
    port.register_address(addr(2), ms(PERIOD_MS)).unwrap();
    log.collect_for(ms(5 * PERIOD_MS));
    assert!(log.measurements(addr(2)).len() >= 2);

    bus.set_offline(addr(2), true);
    let disabled = log
        .wait_for(ms(3000), |e| matches!(e, Event::AddressDisabled { .. }))
        .expect("address 2 was never disabled");
    match disabled {
        Event::AddressDisabled {
            address,
            consecutive_errors,
            ..
        } => {
            assert_eq!(address, addr(2));
            assert_eq!(consecutive_errors, 10);
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Two more failing cycles fall into the cool-down and are skipped
    thread::sleep(ms(2 * PERIOD_MS));
    let requests_while_disabled = bus.requests_to(addr(2));
    bus.set_offline(addr(2), false);

    let recovered = log
        .wait_for(ms(2500), |e| matches!(e, Event::AddressRecovered { .. }))
        .expect("address 2 never recovered");
    assert!(matches!(
        recovered,
        Event::AddressRecovered {
            recovery_count: 1,
            ..
        }
    ));
    log.collect_for(ms(4 * PERIOD_MS));

    // Exactly one disable notification and one error per failed cycle
    assert_eq!(
        log.count(|e| matches!(e, Event::AddressDisabled { .. })),
        1
    );
    let timeouts = log.count(|e| {
        matches!(
            e,
            Event::Error(ErrorEvent {
                kind: ErrorKind::Timeout,
                ..
            })
        )
    });
    assert_eq!(timeouts, 10);
    assert!(bus.requests_to(addr(2)) > requests_while_disabled);

    // Address 1 was never held up by address 2
    assert!(log.max_measurement_gap(addr(1)) < ms(4 * PERIOD_MS));
    assert!(log.count(|e| e.address() == addr(1) && !matches!(e, Event::Measurement(_))) == 0);

    let stats = port.connection_stats();
    let a2 = stats.address(addr(2)).unwrap();
    assert_eq!(a2.health.state, HealthState::Healthy);
    assert_eq!(a2.health.recovery_count, 1);
    assert_eq!(a2.health.consecutive_errors, 0);
    assert!(a2.skipped_polls > 0);
    assert_eq!(stats.recoveries_by_address()[&addr(1)], 0);
    assert!(port.stop());
}

#[test]
fn test_failure_after_cooldown_disables_again() {
    let bus = SimulatedBus::with_instruments(&[addr(5)]);
    let mut config = test_config();
    config.health.disable_threshold = 3;
    config.health.cooldown = ms(300);
    let mut port = spawn_port(&bus, config);
    let mut log = EventLog::new(port.subscribe());

    bus.set_offline(addr(5), true);
    port.register_address(addr(5), ms(PERIOD_MS)).unwrap();

    log.wait_for(ms(2000), |e| matches!(e, Event::AddressDisabled { .. }))
        .expect("first disable");
    let second = log
        .wait_for(ms(2000), |e| matches!(e, Event::AddressDisabled { .. }))
        .expect("second disable after the cool-down");
    assert!(matches!(
        second,
        Event::AddressDisabled {
            consecutive_errors: 4,
            ..
        }
    ));
    assert_eq!(log.count(|e| matches!(e, Event::AddressRecovered { .. })), 0);
    port.stop();
}
