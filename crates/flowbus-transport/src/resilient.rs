//! Retry, reconnection and timeout tuning around the transport client.
//!
//! Every [`ResilientTransport`] operation runs one retry loop which
//! asks the [`RetryPolicy`] what to do with each failure:
//!
//! | error | decision |
//! |---|---|
//! | malformed or short response | retry on the same connection |
//! | connection lost | invalidate handle, recreate master, retry |
//! | timeout, device status, bad input | fail immediately |
//!
//! Timeouts are not retried: for polls the next cycle is the retry, and
//! for writes the caller verifies by readback instead of writing blind.

use crate::cache::InstrumentCache;
use crate::{check_bulk_len, TransportClient};
use flowbus_common::{
    Address, FlowError, FlowResult, ParamValue, Parameter, RetryConfig, WriteStatus,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up and return the error.
    Fail,
    /// Try again on the same connection.
    Retry,
    /// Recreate the master connection, then try again.
    ReconnectThenRetry,
}

/// Bounded retry with linearly increasing backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per operation, including the first.
    pub max_attempts: u32,
    /// Backoff after the first failed attempt.
    pub backoff_base: Duration,
    /// Backoff increase per further failed attempt.
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Build a policy from configuration.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: config.backoff_base,
            backoff_step: config.backoff_step,
        }
    }

    /// Classify an error.
    #[must_use]
    pub fn classify(&self, err: &FlowError) -> RetryDecision {
        match err {
            FlowError::Protocol(_) => RetryDecision::Retry,
            FlowError::ConnectionLost(_) => RetryDecision::ReconnectThenRetry,
            FlowError::Timeout(_)
            | FlowError::DeviceStatus { .. }
            | FlowError::VerificationFailed { .. }
            | FlowError::AddressDisabled { .. }
            | FlowError::InvalidInput(_)
            | FlowError::Config(_)
            | FlowError::UnknownPort(_)
            | FlowError::QueueFull(_)
            | FlowError::WorkerStopped(_)
            | FlowError::InvalidStateTransition { .. } => RetryDecision::Fail,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base + self.backoff_step * attempt.saturating_sub(1)
    }

    /// Decision for a failure on `attempt`, taking the attempt budget into account.
    #[must_use]
    pub fn decide(&self, err: &FlowError, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            RetryDecision::Fail
        } else {
            self.classify(err)
        }
    }
}

/// Transport wrapper with retry, reconnection and per-call timeouts.
///
/// Cheap to clone; clones share the instrument cache and therefore the
/// port's master connection.
#[derive(Clone)]
pub struct ResilientTransport {
    cache: Arc<InstrumentCache>,
    policy: RetryPolicy,
    poll_timeout: Duration,
}

impl ResilientTransport {
    /// Wrap `cache`. Polling calls use `poll_timeout`.
    #[must_use]
    pub fn new(cache: Arc<InstrumentCache>, policy: RetryPolicy, poll_timeout: Duration) -> Self {
        Self {
            cache,
            policy,
            poll_timeout,
        }
    }

    /// The underlying instrument cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<InstrumentCache> {
        &self.cache
    }

    /// The retry policy in use.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Response timeout applied to polling traffic.
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Read one parameter with the polling timeout.
    ///
    /// # Errors
    ///
    /// Returns the last error once the retry budget is spent.
    pub fn read(&self, address: Address, param: Parameter) -> FlowResult<ParamValue> {
        self.read_with_timeout(address, param, None)
    }

    /// Read one parameter, optionally with an extended timeout.
    ///
    /// # Errors
    ///
    /// Returns the last error once the retry budget is spent.
    pub fn read_with_timeout(
        &self,
        address: Address,
        param: Parameter,
        timeout: Option<Duration>,
    ) -> FlowResult<ParamValue> {
        self.execute("read", Some(address), timeout, |client| {
            client.read_parameter(address, param)
        })
    }

    /// Write one parameter, optionally with an extended timeout.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::InvalidInput`] without bus traffic if the value
    /// does not fit the parameter type, otherwise the last transport error
    /// once the retry budget is spent.
    pub fn write(
        &self,
        address: Address,
        param: Parameter,
        value: &ParamValue,
        timeout: Option<Duration>,
    ) -> FlowResult<WriteStatus> {
        value.check_type(param.value_type)?;
        self.execute("write", Some(address), timeout, |client| {
            client.write_parameter(address, param, value, true)
        })
    }

    /// Read several parameters in one request with the polling timeout.
    ///
    /// # Errors
    ///
    /// Returns the last error once the retry budget is spent. A reply with
    /// the wrong number of values counts as a protocol error.
    pub fn bulk_read(&self, address: Address, params: &[Parameter]) -> FlowResult<Vec<ParamValue>> {
        self.execute("bulk_read", Some(address), None, |client| {
            check_bulk_len(params.len(), client.bulk_read(address, params)?)
        })
    }

    /// Write several parameters, optionally with an extended timeout.
    ///
    /// # Errors
    ///
    /// Returns the last error once the retry budget is spent.
    pub fn bulk_write(
        &self,
        address: Address,
        writes: &[(Parameter, ParamValue)],
        timeout: Option<Duration>,
    ) -> FlowResult<Vec<WriteStatus>> {
        for (param, value) in writes {
            value.check_type(param.value_type)?;
        }
        self.execute("bulk_write", Some(address), timeout, |client| {
            check_bulk_len(writes.len(), client.bulk_write(address, writes)?)
        })
    }

    /// List the addresses answering on the port.
    ///
    /// # Errors
    ///
    /// Returns the last error once the retry budget is spent.
    pub fn discover(&self, timeout: Option<Duration>) -> FlowResult<Vec<Address>> {
        self.execute("discover", None, timeout, |client| client.discover_nodes())
    }

    fn execute<T>(
        &self,
        op: &'static str,
        address: Option<Address>,
        timeout: Option<Duration>,
        mut f: impl FnMut(&mut dyn TransportClient) -> FlowResult<T>,
    ) -> FlowResult<T> {
        let timeout = timeout.unwrap_or(self.poll_timeout);
        let port = self.cache.port();
        let mut attempt = 1;

        loop {
            let mut call = |client: &mut dyn TransportClient| {
                client.set_response_timeout(timeout);
                f(client)
            };
            let result = match address {
                Some(address) => self
                    .cache
                    .get_or_create(address)
                    .and_then(|handle| handle.with_client(|client, _| call(client))),
                None => self.cache.with_master(call),
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(%port, ?address, op, attempt, "Transport call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            match self.policy.decide(&err, attempt) {
                RetryDecision::Fail => {
                    trace!(%port, ?address, op, attempt, error = %err, "Transport call failed");
                    return Err(err);
                }
                RetryDecision::Retry => {
                    warn!(%port, ?address, op, attempt, error = %err, "Transient error, retrying");
                }
                RetryDecision::ReconnectThenRetry => {
                    warn!(%port, ?address, op, attempt, error = %err, "Connection lost, reconnecting");
                    if let Some(address) = address {
                        self.cache.invalidate(address);
                    }
                    if let Err(e) = self.cache.reconnect() {
                        warn!(%port, op, attempt, error = %e, "Reconnect failed");
                    }
                }
            }

            thread::sleep(self.policy.backoff(attempt));
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_classification() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.classify(&FlowError::Protocol("crc".into())),
            RetryDecision::Retry
        );
        assert_eq!(
            policy.classify(&FlowError::ConnectionLost("bad fd".into())),
            RetryDecision::ReconnectThenRetry
        );
        assert_eq!(
            policy.classify(&FlowError::Timeout("no answer".into())),
            RetryDecision::Fail
        );
        assert_eq!(
            policy.classify(&FlowError::DeviceStatus {
                code: 3,
                message: "bad parameter".into()
            }),
            RetryDecision::Fail
        );
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), ms(10));
        assert_eq!(policy.backoff(2), ms(30));
        assert_eq!(policy.backoff(3), ms(50));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let err = FlowError::Protocol("short read".into());
        assert_eq!(policy.decide(&err, 1), RetryDecision::Retry);
        assert_eq!(policy.decide(&err, 2), RetryDecision::Fail);
    }

    #[test]
    fn test_zero_attempts_clamped() {
        let config = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_attempts, 1);
    }
}
