// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Error taxonomy shared by configuration, transports, and the supervisor.

use std::any::Any;
use std::io;
use std::time::Duration;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Bad or missing settings. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to bind {network} listener on {address}: {source}")]
    Bind {
        network: String,
        address: String,
        #[source]
        source: io::Error,
    },

    /// A request handler panicked; recovered at the request boundary.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("{transport} transport did not drain within {grace:?}")]
    ShutdownTimeout {
        transport: &'static str,
        grace: Duration,
    },

    /// The serving loop died after a successful start.
    #[error("{transport} transport stopped unexpectedly: {source}")]
    Serve {
        transport: &'static str,
        #[source]
        source: BoxError,
    },
}

impl ServerError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Extracts the human-readable payload of a caught panic.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
