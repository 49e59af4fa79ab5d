//! Observer - where a server reports the anomalies it recovers from.

use super::{HandlerFailure, reply::CorrelationToken};

/// Receives the failures a server contains instead of propagating.
///
/// Every method defaults to doing nothing, so an implementation only overrides what it
/// cares about. Methods are called from the worker task and must not block.
pub trait Observer: Send + Sync + 'static {
    /// `init` failed or panicked; the server is stopped.
    fn init_failed(&self, _server: &str, _error: &anyhow::Error) {}

    /// A `handle_cast` or `handle_call` invocation failed; the server keeps running.
    fn handler_failed(&self, _server: &str, _failure: &HandlerFailure) {}

    /// `terminate` failed or panicked while shutting down.
    fn terminate_failed(&self, _server: &str, _error: &anyhow::Error) {}

    /// A reply arrived for a token nobody is waiting on any more.
    fn late_reply(&self, _server: &str, _token: CorrelationToken) {}

    /// The processing loop itself broke down; the server is stopped.
    fn loop_fault(&self, _server: &str, _reason: &str) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Forwards anomalies to the `log` facade.
///
/// Silent unless the application installs a logger.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn init_failed(&self, server: &str, error: &anyhow::Error) {
        log::error!("Server '{}' failed to start: {:#}", server, error);
    }

    fn handler_failed(&self, server: &str, failure: &HandlerFailure) {
        log::error!("Server '{}': {}", server, failure);
    }

    fn terminate_failed(&self, server: &str, error: &anyhow::Error) {
        log::error!("Server '{}' terminate error: {:#}", server, error);
    }

    fn late_reply(&self, server: &str, token: CorrelationToken) {
        log::warn!(
            "Server '{}': no reply slot for {}. The caller timed out or went away.",
            server,
            token
        );
    }

    fn loop_fault(&self, server: &str, reason: &str) {
        log::error!("Server '{}' main loop error: {}", server, reason);
    }
}
