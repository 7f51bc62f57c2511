//! # Error Types Module
//!
//! Centralized error handling for the acquisition daemon.
//! Provides custom error types for each concern with proper context and error chaining.
//!
//! ## Error Types
//! - `ConnectionError`: network, broker session and publish failures
//! - `ConfigError`: configuration file I/O, parsing and validation errors
//! - `SampleError`: failures of the sample source feeding the loop
//!
//! ## Usage Examples
//! ```rust
//! // Config module uses ConfigError
//! pub fn load() -> Result<Config, ConfigError> { ... }
//!
//! // Session module uses ConnectionError
//! pub fn ensure_ready(&mut self, sleeper: &mut dyn Sleeper) -> Result<(), ConnectionError> { ... }
//!
//! // Sample sources use SampleError
//! fn read_channel(&mut self, channel: u8) -> Result<u16, SampleError> { ... }
//! ```
//!
//! None of these are fatal to a running loop: the acquisition loop logs them
//! and tries again on the next cycle.

use crate::session::ConnectionState;
use std::fmt;

/// Errors that can occur while connecting to or publishing through the broker
#[derive(Debug)]
pub enum ConnectionError {
    /// Failed to create Tokio runtime for the transport
    RuntimeCreation(String),
    /// CA certificate for the TLS transport could not be loaded
    TlsSetup(String),
    /// Network link stayed down for every allowed attempt
    NetworkUnavailable { attempts: u32 },
    /// Broker refused or never answered the session handshake
    SessionRefused { attempts: u32 },
    /// Publish was requested while the session was not ready
    NotReady(ConnectionState),
    /// Transport rejected the outgoing message
    PublishFailed(String),
    /// A retry wait was cut short by shutdown
    Interrupted,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::RuntimeCreation(msg) => {
                write!(f, "Failed to create async runtime: {}", msg)
            }
            ConnectionError::TlsSetup(msg) => {
                write!(f, "Failed to set up TLS: {}", msg)
            }
            ConnectionError::NetworkUnavailable { attempts } => {
                write!(f, "Network unavailable after {} attempt(s)", attempts)
            }
            ConnectionError::SessionRefused { attempts } => {
                write!(f, "Broker session not established after {} attempt(s)", attempts)
            }
            ConnectionError::NotReady(state) => {
                write!(f, "Session is not ready for publishing (state: {:?})", state)
            }
            ConnectionError::PublishFailed(reason) => {
                write!(f, "Publish failed: {}", reason)
            }
            ConnectionError::Interrupted => {
                write!(f, "Connection attempt was interrupted by shutdown")
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
    /// Detector thresholds do not form a hysteresis band
    InvalidThresholds { upper: u16, lower: u16 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
            ConfigError::InvalidThresholds { upper, lower } => {
                write!(
                    f,
                    "Invalid detector thresholds: upper ({}) must be greater than lower ({})",
                    upper, lower
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
            ConfigError::InvalidThresholds { .. } => None,
        }
    }
}

/// Errors that can occur while reading from a sample source
#[derive(Debug)]
pub enum SampleError {
    /// Source has no readings to offer
    Exhausted,
    /// Underlying device or file could not be read
    Io(std::io::Error),
    /// A recorded reading could not be parsed
    Malformed { line: usize, content: String },
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleError::Exhausted => {
                write!(f, "Sample source has no readings")
            }
            SampleError::Io(e) => {
                write!(f, "Failed to read sample: {}", e)
            }
            SampleError::Malformed { line, content } => {
                write!(f, "Malformed reading on line {}: {:?}", line, content)
            }
        }
    }
}

impl std::error::Error for SampleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SampleError::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::SessionRefused { attempts: 3 };
        assert!(err.to_string().contains("3 attempt"));
    }

    #[test]
    fn test_not_ready_names_state() {
        let err = ConnectionError::NotReady(ConnectionState::SessionConnecting);
        assert!(err.to_string().contains("SessionConnecting"));
    }

    #[test]
    fn test_config_error_chain() {
        use std::error::Error;
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = ConfigError::ReadFailed(io_err);
        assert!(err.source().is_some());

        let err = ConfigError::InvalidThresholds { upper: 700, lower: 850 };
        assert!(err.source().is_none());
        assert!(err.to_string().contains("upper (700)"));
    }

    #[test]
    fn test_sample_error_chain() {
        use std::error::Error;
        let err = SampleError::Io(std::io::Error::new(std::io::ErrorKind::Other, "spi"));
        assert!(err.source().is_some());
        assert!(SampleError::Exhausted.source().is_none());
    }
}
