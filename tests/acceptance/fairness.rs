//! Fairness: addresses that are always due together.
//!
//! With a zero registration stagger both addresses share every due time.
//! The tie-break must alternate between them so neither falls behind its
//! period.

use super::common::{addr, ms, spawn_port, test_config, EventLog};
use flowbus_poller::Event;
use flowbus_transport::SimulatedBus;
use std::time::Duration;

const PERIOD_MS: u64 = 50;

#[test]
fn test_simultaneous_addresses_alternate() {
    let bus = SimulatedBus::with_instruments(&[addr(1), addr(2)]);
    bus.set_latency(ms(2));
    let mut config = test_config();
    config.scheduler.stagger_step = Duration::ZERO;
    let window = config.scheduler.fairness_window;
    let mut port = spawn_port(&bus, config);
    let mut log = EventLog::new(port.subscribe());

    port.register_address(addr(1), ms(PERIOD_MS)).unwrap();
    port.register_address(addr(2), ms(PERIOD_MS)).unwrap();
    log.collect_for(ms(2000));

    let polls_1 = log.measurements(addr(1)).len();
    let polls_2 = log.measurements(addr(2)).len();
    assert!(polls_1 >= 30, "address 1 polled {polls_1} times");
    assert!(polls_1.abs_diff(polls_2) <= 2, "{polls_1} vs {polls_2}");

    let stats = port.connection_stats();
    for address in [addr(1), addr(2)] {
        let mean = stats.address(address).unwrap().intervals.mean.unwrap();
        assert!(
            mean <= ms(PERIOD_MS) + window + ms(5),
            "address {address} mean interval {mean:?}"
        );
    }
    assert_eq!(log.count(|e| matches!(e, Event::Error(_))), 0);
    port.stop();
}

#[test]
fn test_periods_are_independent() {
    let bus = SimulatedBus::with_instruments(&[addr(1), addr(2)]);
    let mut port = spawn_port(&bus, test_config());
    let mut log = EventLog::new(port.subscribe());

    port.register_address(addr(1), ms(40)).unwrap();
    port.register_address(addr(2), ms(160)).unwrap();
    log.collect_for(ms(1600));

    let fast = log.measurements(addr(1)).len();
    let slow = log.measurements(addr(2)).len();
    assert!(fast >= 3 * slow, "{fast} fast vs {slow} slow polls");
    assert!(slow >= 7, "slow address polled {slow} times");
    port.stop();
}
