//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Error types for the device socket service

use thiserror::Error;

/// Result type for listener operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Error raised by packet handler hooks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for packet handler hooks.
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Listener error types
///
/// Failures inside a single session never surface here; they are reported to
/// the packet handler as a [`SessionOutcome`](crate::SessionOutcome).
#[derive(Debug, Error)]
pub enum ServiceError {
    /// I/O error while binding or configuring the listening socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Listener configuration was rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// `start()` was called before a packet handler was registered
    #[error("No packet handler registered")]
    NoPacketHandler,

    /// Listener is already running
    #[error("Listener already running")]
    AlreadyRunning,

    /// Listener is not running
    #[error("Listener not running")]
    NotRunning,

    /// Listening socket was released by an earlier shutdown
    #[error("Listening socket closed")]
    ListenerClosed,

    /// TLS transport selected without a TLS acceptor
    #[error("TLS transport requires an acceptor")]
    TlsAcceptorRequired,
}

impl ServiceError {
    /// Check if the error came from the configuration rather than the runtime
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ServiceError::InvalidConfig(_)
                | ServiceError::NoPacketHandler
                | ServiceError::TlsAcceptorRequired
        )
    }

    /// Check if the error reflects the listener lifecycle state
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(
            self,
            ServiceError::AlreadyRunning | ServiceError::NotRunning | ServiceError::ListenerClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ServiceError::NoPacketHandler.is_configuration_error());
        assert!(ServiceError::InvalidConfig("port".into()).is_configuration_error());
        assert!(!ServiceError::AlreadyRunning.is_configuration_error());
        assert!(ServiceError::AlreadyRunning.is_lifecycle_error());
        assert!(ServiceError::ListenerClosed.is_lifecycle_error());
        assert!(!ServiceError::Io(std::io::ErrorKind::AddrInUse.into()).is_lifecycle_error());
    }

    #[test]
    fn test_error_display() {
        let err = ServiceError::InvalidConfig("backlog must be positive".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: backlog must be positive");
        assert_eq!(ServiceError::NotRunning.to_string(), "Listener not running");
    }
}
