//! Port manager: owns one worker per serial port.

use crate::command::Command;
use crate::events::Event;
use crate::stats::ConnectionStats;
use crate::worker::{PortBuilder, PortHandle};
use crossbeam::channel::{self, Receiver, Sender};
use flowbus_common::{
    Address, FlowError, FlowResult, ParamValue, Parameter, PortConfig, PortName, ServiceConfig,
};
use flowbus_transport::Connector;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Routes requests to the worker of each port.
pub struct PortManager {
    config: ServiceConfig,
    ports: BTreeMap<PortName, PortHandle>,
    shared_subscribers: Vec<Sender<Event>>,
}

impl std::fmt::Debug for PortManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortManager")
            .field("ports", &self.ports.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl PortManager {
    /// Create an empty manager. `config` supplies the worker settings of
    /// every port added later.
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            ports: BTreeMap::new(),
            shared_subscribers: Vec::new(),
        }
    }

    /// Start every configured port and register its instruments.
    ///
    /// `connector` is asked once per port for the connector to use.
    ///
    /// # Errors
    ///
    /// Returns the first error from starting a port or registering an
    /// instrument. Ports started before the error are shut down.
    pub fn from_config(
        config: &ServiceConfig,
        mut connector: impl FnMut(&PortConfig) -> Arc<dyn Connector>,
    ) -> FlowResult<Self> {
        let mut manager = Self::new(config.clone());
        for port in &config.ports {
            let result = manager
                .add_port(port.name.clone(), connector(port))
                .and_then(|()| {
                    port.instruments.iter().try_for_each(|instrument| {
                        manager.register_address(
                            &port.name,
                            instrument.address,
                            config.period_for(instrument),
                        )
                    })
                });
            if let Err(e) = result {
                manager.shutdown();
                return Err(e);
            }
        }
        Ok(manager)
    }

    /// Start a worker for `port`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::InvalidInput`] if the port already has a worker.
    pub fn add_port(&mut self, port: PortName, connector: Arc<dyn Connector>) -> FlowResult<()> {
        if self.ports.contains_key(&port) {
            return Err(FlowError::InvalidInput(format!("port {port} already added")));
        }
        let handle = PortBuilder::new(port.clone(), connector)
            .config(self.config.clone())
            .spawn()?;
        for sender in &self.shared_subscribers {
            handle.attach(sender.clone());
        }
        info!(%port, "Port added");
        self.ports.insert(port, handle);
        Ok(())
    }

    /// Stop and remove the worker of `port`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::UnknownPort`] if the port has no worker.
    pub fn remove_port(&mut self, port: &PortName) -> FlowResult<()> {
        let mut handle = self
            .ports
            .remove(port)
            .ok_or_else(|| FlowError::UnknownPort(port.to_string()))?;
        if !handle.stop() {
            warn!(%port, "Removed port whose worker was still busy");
        }
        info!(%port, "Port removed");
        Ok(())
    }

    fn port(&self, port: &PortName) -> FlowResult<&PortHandle> {
        self.ports
            .get(port)
            .ok_or_else(|| FlowError::UnknownPort(port.to_string()))
    }

    /// Start polling `address` on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::UnknownPort`] or the worker's error.
    pub fn register_address(
        &self,
        port: &PortName,
        address: Address,
        period: Duration,
    ) -> FlowResult<()> {
        self.port(port)?.register_address(address, period)
    }

    /// Stop polling `address` on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::UnknownPort`] or the worker's error.
    pub fn unregister_address(&self, port: &PortName, address: Address) -> FlowResult<()> {
        self.port(port)?.unregister_address(address)
    }

    /// Queue a command for `port`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::UnknownPort`], [`FlowError::QueueFull`] or
    /// [`FlowError::WorkerStopped`].
    pub fn enqueue_command(&self, port: &PortName, command: Command) -> FlowResult<()> {
        self.port(port)?.enqueue_command(command)
    }

    /// Latest statistics of `port`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::UnknownPort`].
    pub fn connection_stats(&self, port: &PortName) -> FlowResult<ConnectionStats> {
        Ok(self.port(port)?.connection_stats())
    }

    /// Latest statistics of every port.
    #[must_use]
    pub fn all_stats(&self) -> Vec<ConnectionStats> {
        self.ports.values().map(PortHandle::connection_stats).collect()
    }

    /// Subscribe to the events of `port`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::UnknownPort`].
    pub fn subscribe(&self, port: &PortName) -> FlowResult<Receiver<Event>> {
        Ok(self.port(port)?.subscribe())
    }

    /// Subscribe to the events of every port, including ports added later.
    pub fn subscribe_all(&mut self) -> Receiver<Event> {
        let (tx, rx) = channel::bounded(self.config.scheduler.event_capacity.max(1));
        for handle in self.ports.values() {
            handle.attach(tx.clone());
        }
        self.shared_subscribers.push(tx);
        rx
    }

    /// Read a parameter outside the polling schedule.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::UnknownPort`] or the transport error.
    pub fn diagnostic_read(
        &self,
        port: &PortName,
        address: Address,
        param: Parameter,
    ) -> FlowResult<ParamValue> {
        self.port(port)?.diagnostic_read(address, param)
    }

    /// Names of all ports.
    pub fn ports(&self) -> impl Iterator<Item = &PortName> {
        self.ports.keys()
    }

    /// Number of ports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// True if no port has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Stop every worker. Returns true if all of them exited in time.
    pub fn shutdown(&mut self) -> bool {
        let mut clean = true;
        for (port, mut handle) in std::mem::take(&mut self.ports) {
            if !handle.stop() {
                warn!(%port, "Port worker detached at shutdown");
                clean = false;
            }
        }
        self.shared_subscribers.clear();
        info!(clean, "Port manager shut down");
        clean
    }
}

impl Drop for PortManager {
    fn drop(&mut self) {
        if !self.ports.is_empty() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowbus_common::InstrumentConfig;
    use flowbus_transport::SimulatedBus;
    use std::time::Instant;

    fn addr(v: u8) -> Address {
        Address::new(v).unwrap()
    }

    #[test]
    fn test_unknown_port() {
        let manager = PortManager::new(ServiceConfig::default());
        let port = PortName::new("nowhere");
        assert!(matches!(
            manager.register_address(&port, addr(1), Duration::from_millis(100)),
            Err(FlowError::UnknownPort(_))
        ));
        assert!(matches!(
            manager.enqueue_command(&port, Command::fluid_index(addr(1), 2)),
            Err(FlowError::UnknownPort(_))
        ));
        assert!(manager.connection_stats(&port).is_err());
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let bus = SimulatedBus::new();
        let mut manager = PortManager::new(ServiceConfig::default());
        manager.add_port("a".into(), Arc::new(bus.clone())).unwrap();
        assert!(matches!(
            manager.add_port("a".into(), Arc::new(bus)),
            Err(FlowError::InvalidInput(_))
        ));
        assert!(manager.shutdown());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_from_config_polls_every_port() {
        let mut config = ServiceConfig::default();
        for (name, address) in [("p1", 1), ("p2", 2)] {
            let mut port = PortConfig::new(name);
            port.instruments.push(InstrumentConfig {
                address: addr(address),
                period: Some(Duration::from_millis(20)),
            });
            config.ports.push(port);
        }
        let bus = SimulatedBus::with_instruments(&[addr(1), addr(2)]);

        let mut manager =
            PortManager::from_config(&config, |_| Arc::new(bus.clone()) as Arc<dyn Connector>)
                .unwrap();
        let events = manager.subscribe_all();

        let deadline = Instant::now() + Duration::from_millis(300);
        let mut seen = std::collections::HashSet::new();
        while seen.len() < 2 && Instant::now() < deadline {
            if let Ok(Event::Measurement(m)) = events.recv_timeout(Duration::from_millis(50)) {
                seen.insert(m.port.to_string());
            }
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(manager.ports().count(), 2);
        manager.remove_port(&"p1".into()).unwrap();
        assert_eq!(manager.len(), 1);
    }
}
