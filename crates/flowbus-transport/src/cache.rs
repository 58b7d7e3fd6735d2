//! Per-port cache of instrument handles.
//!
//! All handles of a port share one master connection. The master sits
//! behind a mutex, so every call through any handle is serialized: at
//! most one request is in flight on the port whether it comes from the
//! port worker or from a diagnostic caller.
//!
//! Each (re)connection bumps a generation counter. A handle remembers the
//! generation it was created under and is stale once the master has been
//! replaced or has died.

use crate::{Connector, TransportClient};
use flowbus_common::{Address, FlowError, FlowResult, PortName, TransportConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The port's master connection.
struct MasterSlot {
    client: Option<Box<dyn TransportClient>>,
    generation: u64,
}

impl MasterSlot {
    fn is_alive(&self) -> bool {
        self.client.as_ref().is_some_and(|c| c.is_alive())
    }
}

/// Handle to one instrument on a port.
///
/// Cheap to clone. Operations lock the port's master connection.
#[derive(Clone)]
pub struct InstrumentHandle {
    address: Address,
    generation: u64,
    master: Arc<Mutex<MasterSlot>>,
}

impl std::fmt::Debug for InstrumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentHandle")
            .field("address", &self.address)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl InstrumentHandle {
    /// Instrument address.
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Master generation this handle was created under.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True if the master is still the one this handle was created for and
    /// its link is alive.
    #[must_use]
    pub fn is_live(&self) -> bool {
        let slot = self.master.lock();
        slot.generation == self.generation && slot.is_alive()
    }

    /// Run `f` against the master connection with the port locked.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::ConnectionLost`] if the handle is stale, or
    /// whatever `f` returns.
    pub fn with_client<T>(
        &self,
        f: impl FnOnce(&mut dyn TransportClient, Address) -> FlowResult<T>,
    ) -> FlowResult<T> {
        let mut slot = self.master.lock();
        if slot.generation != self.generation {
            return Err(FlowError::ConnectionLost(format!(
                "stale handle for address {} (generation {} != {})",
                self.address, self.generation, slot.generation
            )));
        }
        match slot.client.as_mut() {
            Some(client) => f(client.as_mut(), self.address),
            None => Err(FlowError::ConnectionLost("master connection closed".into())),
        }
    }
}

/// Map from address to live instrument handle for one port.
pub struct InstrumentCache {
    port: PortName,
    connector: Arc<dyn Connector>,
    default_timeout: Duration,
    connect_timeout: Duration,
    master: Arc<Mutex<MasterSlot>>,
    handles: Mutex<HashMap<Address, InstrumentHandle>>,
}

impl InstrumentCache {
    /// Create an empty cache. The master connection is opened lazily.
    pub fn new(port: PortName, connector: Arc<dyn Connector>, default_timeout: Duration) -> Self {
        Self {
            port,
            connector,
            default_timeout,
            connect_timeout: TransportConfig::default().connect_timeout,
            master: Arc::new(Mutex::new(MasterSlot {
                client: None,
                generation: 0,
            })),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Bound on opening the master connection.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Port this cache belongs to.
    #[must_use]
    pub fn port(&self) -> &PortName {
        &self.port
    }

    /// Return a live handle for `address`, creating it (and the master
    /// connection) if needed. Stale handles are evicted and replaced.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::ConnectionLost`] if the master cannot be opened.
    pub fn get_or_create(&self, address: Address) -> FlowResult<InstrumentHandle> {
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get(&address) {
            if handle.is_live() {
                return Ok(handle.clone());
            }
            debug!(port = %self.port, %address, generation = handle.generation, "Evicting stale handle");
            handles.remove(&address);
        }

        let generation = self.ensure_master()?;
        let handle = InstrumentHandle {
            address,
            generation,
            master: Arc::clone(&self.master),
        };
        handles.insert(address, handle.clone());
        Ok(handle)
    }

    /// Drop the cached handle for `address`.
    pub fn invalidate(&self, address: Address) {
        if self.handles.lock().remove(&address).is_some() {
            debug!(port = %self.port, %address, "Invalidated instrument handle");
        }
    }

    /// Close the master connection and open a new one.
    ///
    /// Every handle created before this call becomes stale.
    ///
    /// # Errors
    ///
    /// Returns the connector's error. The old master stays closed in that
    /// case and the next [`get_or_create`](Self::get_or_create) tries again.
    pub fn reconnect(&self) -> FlowResult<()> {
        let mut slot = self.master.lock();
        slot.client = None;
        slot.generation += 1;
        warn!(port = %self.port, generation = slot.generation, "Recreating master connection");
        let client = self.open()?;
        slot.client = Some(client);
        info!(port = %self.port, generation = slot.generation, "Master connection restored");
        Ok(())
    }

    /// Run `f` against the master connection directly, opening it if needed.
    ///
    /// Used for port-wide operations such as node discovery.
    ///
    /// # Errors
    ///
    /// Returns the connector's error or whatever `f` returns.
    pub fn with_master<T>(
        &self,
        f: impl FnOnce(&mut dyn TransportClient) -> FlowResult<T>,
    ) -> FlowResult<T> {
        self.ensure_master()?;
        let mut slot = self.master.lock();
        match slot.client.as_mut() {
            Some(client) => f(client.as_mut()),
            None => Err(FlowError::ConnectionLost("master connection closed".into())),
        }
    }

    /// Current master generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.master.lock().generation
    }

    /// Number of cached handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// True if no handle is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Open the master if it is missing or dead and return its generation.
    fn ensure_master(&self) -> FlowResult<u64> {
        let mut slot = self.master.lock();
        if !slot.is_alive() {
            slot.client = None;
            slot.generation += 1;
            let client = self.open()?;
            slot.client = Some(client);
            debug!(port = %self.port, generation = slot.generation, "Opened master connection");
        }
        Ok(slot.generation)
    }

    fn open(&self) -> FlowResult<Box<dyn TransportClient>> {
        let mut client = self.connector.connect(&self.port, self.connect_timeout)?;
        client.set_response_timeout(self.default_timeout);
        Ok(client)
    }
}

#[cfg(all(test, feature = "simulated"))]
mod tests {
    use super::*;
    use crate::simulated::SimulatedBus;
    use flowbus_common::{ParamValue, Parameter};

    fn addr(v: u8) -> Address {
        Address::new(v).unwrap()
    }

    fn cache_for(bus: &SimulatedBus) -> InstrumentCache {
        InstrumentCache::new(
            PortName::new("sim0"),
            Arc::new(bus.clone()),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_handle_reused_while_live() {
        let bus = SimulatedBus::with_instruments(&[addr(3)]);
        let cache = cache_for(&bus);

        let first = cache.get_or_create(addr(3)).unwrap();
        let second = cache.get_or_create(addr(3)).unwrap();
        assert_eq!(first.generation(), second.generation());
        assert_eq!(bus.connect_count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_dead_master_evicts_and_recreates() {
        let bus = SimulatedBus::with_instruments(&[addr(3)]);
        let cache = cache_for(&bus);

        let old = cache.get_or_create(addr(3)).unwrap();
        bus.drop_connections();
        assert!(!old.is_live());

        let fresh = cache.get_or_create(addr(3)).unwrap();
        assert!(fresh.generation() > old.generation());
        assert!(fresh.is_live());
        assert_eq!(bus.connect_count(), 2);

        // The old handle refuses to run against the new master
        let result = old.with_client(|c, a| c.read_parameter(a, Parameter::FLUID_INDEX));
        assert!(matches!(result, Err(FlowError::ConnectionLost(_))));
    }

    #[test]
    fn test_reconnect_bumps_generation() {
        let bus = SimulatedBus::with_instruments(&[addr(5)]);
        let cache = cache_for(&bus);

        let handle = cache.get_or_create(addr(5)).unwrap();
        let before = cache.generation();
        cache.reconnect().unwrap();
        assert_eq!(cache.generation(), before + 1);
        assert!(!handle.is_live());

        cache.invalidate(addr(5));
        assert!(cache.is_empty());
        let value = cache
            .get_or_create(addr(5))
            .unwrap()
            .with_client(|c, a| c.read_parameter(a, Parameter::FLUID_NAME))
            .unwrap();
        assert_eq!(value, ParamValue::Text("Air".into()));
    }

    #[test]
    fn test_connect_timeout_applied_to_master_open() {
        let bus = SimulatedBus::with_instruments(&[addr(1)]);
        bus.set_connect_delay(Duration::from_millis(200));
        let cache = cache_for(&bus).with_connect_timeout(Duration::from_millis(20));

        assert!(matches!(
            cache.get_or_create(addr(1)),
            Err(FlowError::Timeout(_))
        ));
        assert_eq!(bus.connect_count(), 0);

        bus.set_connect_delay(Duration::from_millis(5));
        assert!(cache.get_or_create(addr(1)).is_ok());
        assert_eq!(bus.connect_count(), 1);
    }

    #[test]
    fn test_connect_failure_surfaces() {
        let bus = SimulatedBus::with_instruments(&[addr(1)]);
        bus.refuse_connects(1);
        let cache = cache_for(&bus);

        assert!(matches!(
            cache.get_or_create(addr(1)),
            Err(FlowError::ConnectionLost(_))
        ));
        assert!(cache.get_or_create(addr(1)).is_ok());
    }
}
