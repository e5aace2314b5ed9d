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

//! Core types for the device socket service

use crate::config::Transport;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Unique identifier for a connection (monotonically increasing, never reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new connection ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifier of a pooled session worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Session details handed to the packet handler when a session starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Connection ID
    pub connection_id: ConnectionId,
    /// Remote address of the device
    pub peer_addr: SocketAddr,
    /// Local port the device reached
    pub local_port: u16,
    /// Listener transport
    pub transport: Transport,
    /// `false` for datagram exchanges and in-memory test sessions
    pub stream_oriented: bool,
    /// Text or binary framing
    pub text_mode: bool,
}

impl SessionInfo {
    pub fn peer_port(&self) -> u16 {
        self.peer_addr.port()
    }
}

/// Cumulative counters reported when a session ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Bytes read from the device
    pub bytes_read: u64,
    /// Bytes written or sent to the device
    pub bytes_written: u64,
    /// Packets framed and dispatched
    pub packets: u64,
}

/// Terminal outcome of one session run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Handler or a packet listener asked to end the session, or a datagram
    /// ran out of packets
    Normal,
    /// The session's wall-clock deadline passed
    SessionTimeout,
    /// Idle or packet deadline passed
    PacketReadTimeout {
        /// `true` when bytes of an unfinished packet had been read
        mid_packet: bool,
    },
    /// The input ended
    EndOfStream {
        /// `true` when bytes of an unfinished packet had been read
        mid_packet: bool,
        /// `true` for TCP/TLS, `false` for datagram exhaustion
        stream: bool,
    },
    /// Read or write failure on the connection
    Io {
        kind: io::ErrorKind,
        message: String,
    },
    /// The packet handler returned an error or panicked
    HandlerFailed(String),
}

impl SessionOutcome {
    pub(crate) fn io(err: &io::Error) -> Self {
        SessionOutcome::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Check if the outcome should be treated as a failed session
    ///
    /// Boundary timeouts, boundary end of stream and datagram exhaustion are
    /// expected and do not count.
    pub fn is_error(&self) -> bool {
        match self {
            SessionOutcome::Normal => false,
            SessionOutcome::SessionTimeout => true,
            SessionOutcome::PacketReadTimeout { mid_packet } => *mid_packet,
            SessionOutcome::EndOfStream { mid_packet, stream } => *mid_packet && *stream,
            SessionOutcome::Io { .. } => true,
            SessionOutcome::HandlerFailed(_) => true,
        }
    }

    /// Check if the outcome is a timeout of any class
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SessionOutcome::SessionTimeout | SessionOutcome::PacketReadTimeout { .. }
        )
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Normal => write!(f, "normal"),
            SessionOutcome::SessionTimeout => write!(f, "session timeout"),
            SessionOutcome::PacketReadTimeout { mid_packet: true } => {
                write!(f, "mid-packet timeout")
            }
            SessionOutcome::PacketReadTimeout { mid_packet: false } => {
                write!(f, "boundary timeout")
            }
            SessionOutcome::EndOfStream { stream: false, .. } => write!(f, "datagram exhausted"),
            SessionOutcome::EndOfStream {
                mid_packet: true, ..
            } => write!(f, "end of stream mid-packet"),
            SessionOutcome::EndOfStream { .. } => write!(f, "end of stream"),
            SessionOutcome::Io { kind, message } => write!(f, "I/O error ({:?}): {}", kind, message),
            SessionOutcome::HandlerFailed(reason) => write!(f, "handler failed: {}", reason),
        }
    }
}

/// Listener snapshot for non-blocking debug information
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    /// Bound address
    pub local_addr: SocketAddr,
    /// Listener transport
    pub transport: Transport,
    /// Whether the accept loop is running
    pub running: bool,
    /// Workers in the pool
    pub workers: usize,
    /// Workers currently holding a connection
    pub active_sessions: usize,
    /// Sessions since the listener started
    pub total_sessions: u64,
    /// Listener uptime
    pub uptime: Duration,
    /// Listener start time
    pub started_at: Instant,
}

impl fmt::Display for ServerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SocketServer {{ {} {}, running: {}, workers: {}, active: {}, total: {}, uptime: {:?} }}",
            self.transport,
            self.local_addr,
            self.running,
            self.workers,
            self.active_sessions,
            self.total_sessions,
            self.uptime
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids() {
        let id1 = ConnectionId::new(1);
        let id2 = ConnectionId::new(2);
        assert!(id1 < id2);
        assert_eq!(id2.as_u64(), 2);
        assert_eq!(id1.to_string(), "conn-1");
        assert_eq!(WorkerId::new(7).to_string(), "worker-7");
    }

    #[test]
    fn test_outcome_error_classes() {
        assert!(!SessionOutcome::Normal.is_error());
        assert!(SessionOutcome::SessionTimeout.is_error());
        assert!(!SessionOutcome::PacketReadTimeout { mid_packet: false }.is_error());
        assert!(SessionOutcome::PacketReadTimeout { mid_packet: true }.is_error());
        assert!(
            !SessionOutcome::EndOfStream {
                mid_packet: false,
                stream: true
            }
            .is_error()
        );
        assert!(
            SessionOutcome::EndOfStream {
                mid_packet: true,
                stream: true
            }
            .is_error()
        );
        assert!(
            !SessionOutcome::EndOfStream {
                mid_packet: true,
                stream: false
            }
            .is_error()
        );
        assert!(SessionOutcome::HandlerFailed("boom".into()).is_error());
    }

    #[test]
    fn test_outcome_from_io() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let outcome = SessionOutcome::io(&err);
        assert!(outcome.is_error());
        assert!(!outcome.is_timeout());
        assert_eq!(outcome.to_string(), "I/O error (ConnectionReset): reset by peer");
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(
            SessionOutcome::PacketReadTimeout { mid_packet: false }.to_string(),
            "boundary timeout"
        );
        assert_eq!(
            SessionOutcome::EndOfStream {
                mid_packet: false,
                stream: false
            }
            .to_string(),
            "datagram exhausted"
        );
        assert!(SessionOutcome::SessionTimeout.is_timeout());
    }
}
