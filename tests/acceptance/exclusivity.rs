//! At most one request in flight per port.
//!
//! The worker polls and executes commands while other threads issue
//! diagnostic reads through the same port. The simulated bus counts any
//! overlap between requests.

use super::common::{addr, ms, test_config};
use flowbus_common::{Parameter, PortConfig, InstrumentConfig};
use flowbus_poller::{Command, PortManager};
use flowbus_transport::{Connector, SimulatedBus};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

#[test]
fn test_worker_and_diagnostic_reads_never_overlap() {
    let bus = SimulatedBus::with_instruments(&[addr(1), addr(2), addr(3)]);
    bus.set_latency(ms(1));

    let mut config = test_config();
    let mut port = PortConfig::new("sim0");
    for a in 1..=3 {
        port.instruments.push(InstrumentConfig {
            address: addr(a),
            period: Some(ms(10)),
        });
    }
    config.ports.push(port);

    let manager = Arc::new(
        PortManager::from_config(&config, |_| Arc::new(bus.clone()) as Arc<dyn Connector>)
            .unwrap(),
    );
    let name = "sim0".into();

    let readers: Vec<_> = (0..4)
        .map(|i| {
            let manager = Arc::clone(&manager);
            let name = flowbus_common::PortName::new("sim0");
            thread::spawn(move || {
                let deadline = Instant::now() + ms(500);
                let mut ok = 0;
                while Instant::now() < deadline {
                    let address = addr(1 + (i % 3));
                    if manager
                        .diagnostic_read(&name, address, Parameter::MEASURED_FLOW)
                        .is_ok()
                    {
                        ok += 1;
                    }
                }
                ok
            })
        })
        .collect();

    for step in 0..20 {
        manager
            .enqueue_command(&name, Command::flow_setpoint(addr(1 + step % 3), f64::from(step)))
            .unwrap();
        thread::sleep(ms(20));
    }

    let reads: u32 = readers.into_iter().map(|r| r.join().unwrap()).sum();
    assert!(reads > 0);
    assert!(bus.request_count() > 100);
    assert_eq!(bus.exclusivity_violations(), 0);

    let stats = manager.connection_stats(&name).unwrap();
    assert!(stats.commands_processed > 0);
}
