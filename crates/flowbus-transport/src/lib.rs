//! Transport plane abstractions for instruments on a shared serial bus.
//!
//! This crate provides:
//! - [`TransportClient`] trait for one blocking request-response connection
//! - [`Connector`] trait for opening a port's master connection
//! - [`cache`] module with the per-port instrument handle cache
//! - [`resilient`] module with retry, reconnection and timeout tuning
//! - [`simulated`] module with an in-memory bus for tests (feature `simulated`)
//!
//! The binary wire encoding is not part of this crate. A serial driver
//! implements [`TransportClient`] on top of an external protocol library.

pub mod cache;
pub mod resilient;
#[cfg(feature = "simulated")]
pub mod simulated;

pub use cache::*;
pub use resilient::*;
#[cfg(feature = "simulated")]
pub use simulated::*;

use flowbus_common::{Address, FlowError, FlowResult, ParamValue, Parameter, PortName, WriteStatus};
use std::time::Duration;

/// One open connection to a port's bus.
///
/// Every call blocks until the addressed instrument answers or the
/// response timeout expires. Implementations are not required to be
/// thread-safe; callers serialize access through [`InstrumentCache`].
pub trait TransportClient: Send {
    /// Read one parameter.
    fn read_parameter(&mut self, address: Address, param: Parameter) -> FlowResult<ParamValue>;

    /// Write one parameter.
    ///
    /// `verify` asks the transport library to request an explicit status
    /// reply. A non-zero status is returned as [`WriteStatus::Rejected`].
    fn write_parameter(
        &mut self,
        address: Address,
        param: Parameter,
        value: &ParamValue,
        verify: bool,
    ) -> FlowResult<WriteStatus>;

    /// Read several parameters of one instrument in a single request.
    ///
    /// The default implementation issues one read per parameter.
    fn bulk_read(&mut self, address: Address, params: &[Parameter]) -> FlowResult<Vec<ParamValue>> {
        params
            .iter()
            .map(|param| self.read_parameter(address, *param))
            .collect()
    }

    /// Write several parameters of one instrument.
    ///
    /// The default implementation issues one write per parameter and
    /// stops at the first error.
    fn bulk_write(
        &mut self,
        address: Address,
        writes: &[(Parameter, ParamValue)],
    ) -> FlowResult<Vec<WriteStatus>> {
        writes
            .iter()
            .map(|(param, value)| self.write_parameter(address, *param, value, true))
            .collect()
    }

    /// List the addresses that answer on this bus.
    fn discover_nodes(&mut self) -> FlowResult<Vec<Address>>;

    /// Set the response timeout for subsequent calls.
    fn set_response_timeout(&mut self, timeout: Duration);

    /// Current response timeout.
    fn response_timeout(&self) -> Duration;

    /// Whether the underlying link is still usable.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Opens master connections for a port.
pub trait Connector: Send + Sync {
    /// Open a new master connection to `port`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::ConnectionLost`] if the port cannot be opened,
    /// or [`FlowError::Timeout`] if opening takes longer than `timeout`.
    fn connect(&self, port: &PortName, timeout: Duration) -> FlowResult<Box<dyn TransportClient>>;
}

/// Check that a bulk reply carries one value per requested parameter.
pub(crate) fn check_bulk_len<T>(expected: usize, values: Vec<T>) -> FlowResult<Vec<T>> {
    if values.len() == expected {
        Ok(values)
    } else {
        Err(FlowError::Protocol(format!(
            "bulk reply carried {} values, expected {expected}",
            values.len()
        )))
    }
}
