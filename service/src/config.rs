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

//! Listener configuration
//!
//! A [`ListenerConfig`] is built once, validated when the listener binds and
//! then shared read-only by every session of that listener.
//!
//! ```
//! use std::time::Duration;
//! use trackwire_service::{ListenerConfig, Prompt, Transport};
//!
//! let config = ListenerConfig::new(31200)
//!     .with_transport(Transport::Udp)
//!     .with_text_mode(false)
//!     .with_min_packet_len(4)
//!     .with_max_packet_len(600)
//!     .with_idle_timeout(Duration::from_secs(20));
//! assert!(config.validate().is_ok());
//! assert_eq!(config.effective_max_len(), 600);
//!
//! let shell = ListenerConfig::new(8023).with_prompt(Prompt::Auto);
//! assert!(shell.framing_rules().backspace_enabled());
//! ```

use crate::{Result, ServiceError};
use bytes::Bytes;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use trackwire_framing::{DEFAULT_BINARY_MAX_LEN, DEFAULT_TEXT_MAX_LEN, FramingRules, PacketLimits};

/// Default accept backlog
pub const DEFAULT_BACKLOG: u32 = 50;

/// Default time a closing TCP connection gets to drain its output
pub const DEFAULT_LINGER: Duration = Duration::from_secs(4);

/// Listener transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// TCP server socket
    Tcp,
    /// UDP datagram socket
    Udp,
    /// TCP server socket with TLS
    Tls,
}

impl Transport {
    /// `true` for TCP and TLS
    pub fn is_stream(&self) -> bool {
        !matches!(self, Transport::Udp)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "TCP"),
            Transport::Udp => write!(f, "UDP"),
            Transport::Tls => write!(f, "TLS"),
        }
    }
}

/// Prompt written ahead of every packet read on stream transports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Prompt {
    /// No prompt
    #[default]
    None,
    /// Fixed prompt bytes
    Fixed(Bytes),
    /// Numbered prompt `"<n>> "`, text mode only
    Auto,
}

impl Prompt {
    pub fn is_active(&self) -> bool {
        !matches!(self, Prompt::None)
    }
}

/// Listener configuration
///
/// Every session of a listener frames, times out and closes the same way.
/// Use the builder methods to customize the defaults.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Local address to bind, all interfaces when `None`
    pub bind_address: Option<IpAddr>,

    /// Listen port, `0` for an ephemeral port
    pub port: u16,

    /// TCP accept backlog
    pub backlog: u32,

    /// Transport kind
    pub transport: Transport,

    /// Text-line framing when `true`, binary framing otherwise
    pub text_mode: bool,

    /// Bytes ending a text line
    pub line_terminators: Vec<u8>,

    /// Bytes erasing the previous byte while a prompt is active
    pub backspace_chars: Vec<u8>,

    /// Bytes dropped on receipt
    pub ignore_chars: Vec<u8>,

    /// Multi-byte packet terminator, binary mode only
    pub packet_terminator: Option<Bytes>,

    /// Minimum packet length, mode default when `None`
    pub min_packet_len: Option<usize>,

    /// Maximum packet length, mode default when `None`
    pub max_packet_len: Option<usize>,

    /// Wall-clock limit for a whole session
    pub session_timeout: Option<Duration>,

    /// Wait for the first byte of a packet
    pub idle_timeout: Option<Duration>,

    /// Wait for the rest of a packet once it has started
    pub packet_timeout: Option<Duration>,

    /// Time a closing stream connection gets to flush and shut down
    pub linger: Option<Duration>,

    /// End the session when the idle or packet deadline passes
    pub terminate_on_timeout: bool,

    /// Prompt written before each packet read
    pub prompt: Prompt,

    /// Send UDP replies from the listening socket instead of an ephemeral one
    pub udp_reply_from_listener: bool,

    /// UDP reply port used when the handler does not choose one
    pub udp_remote_port: Option<u16>,

    /// UDP receive buffer, the effective maximum packet length when `None`
    pub datagram_buffer_size: Option<usize>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            port: 0,
            backlog: DEFAULT_BACKLOG,
            transport: Transport::Tcp,
            text_mode: true,
            line_terminators: vec![b'\n'],
            backspace_chars: vec![trackwire_framing::BACKSPACE],
            ignore_chars: vec![b'\r'],
            packet_terminator: None,
            min_packet_len: None,
            max_packet_len: None,
            session_timeout: None,
            idle_timeout: None,
            packet_timeout: None,
            linger: Some(DEFAULT_LINGER),
            terminate_on_timeout: true,
            prompt: Prompt::None,
            udp_reply_from_listener: true,
            udp_remote_port: None,
            datagram_buffer_size: None,
        }
    }
}

/// Maps the millisecond convention where zero or less disables a timeout
pub fn timeout_from_millis(millis: i64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis as u64))
}

impl ListenerConfig {
    /// Create a TCP configuration for the given port
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = Some(address);
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Select text or binary framing
    ///
    /// Binary framing clears the ignore and backspace sets.
    pub fn with_text_mode(mut self, text_mode: bool) -> Self {
        self.text_mode = text_mode;
        if !text_mode {
            self.ignore_chars.clear();
            self.backspace_chars.clear();
        }
        self
    }

    pub fn with_line_terminators(mut self, terminators: &[u8]) -> Self {
        self.line_terminators = terminators.to_vec();
        self
    }

    pub fn with_backspace_chars(mut self, chars: &[u8]) -> Self {
        self.backspace_chars = chars.to_vec();
        self
    }

    pub fn with_ignore_chars(mut self, chars: &[u8]) -> Self {
        self.ignore_chars = chars.to_vec();
        self
    }

    /// Set the packet terminator pattern, switching to binary framing
    pub fn with_packet_terminator(mut self, pattern: impl Into<Bytes>) -> Self {
        let pattern = pattern.into();
        if pattern.is_empty() {
            self.packet_terminator = None;
        } else {
            self.packet_terminator = Some(pattern);
            self = self.with_text_mode(false);
        }
        self
    }

    pub fn with_min_packet_len(mut self, len: usize) -> Self {
        self.min_packet_len = Some(len);
        self
    }

    pub fn with_max_packet_len(mut self, len: usize) -> Self {
        self.max_packet_len = Some(len);
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_packet_timeout(mut self, timeout: Duration) -> Self {
        self.packet_timeout = Some(timeout);
        self
    }

    /// Set all three timeouts from milliseconds, zero or less disabling each
    pub fn with_timeouts_millis(mut self, session: i64, idle: i64, packet: i64) -> Self {
        self.session_timeout = timeout_from_millis(session);
        self.idle_timeout = timeout_from_millis(idle);
        self.packet_timeout = timeout_from_millis(packet);
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn with_terminate_on_timeout(mut self, terminate: bool) -> Self {
        self.terminate_on_timeout = terminate;
        self
    }

    pub fn with_prompt(mut self, prompt: Prompt) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_udp_reply_from_listener(mut self, enabled: bool) -> Self {
        self.udp_reply_from_listener = enabled;
        self
    }

    pub fn with_udp_remote_port(mut self, port: u16) -> Self {
        self.udp_remote_port = Some(port);
        self
    }

    pub fn with_datagram_buffer_size(mut self, size: usize) -> Self {
        self.datagram_buffer_size = Some(size);
        self
    }

    /// Address the listener binds to
    pub fn socket_addr(&self) -> SocketAddr {
        let ip = self
            .bind_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.port)
    }

    /// `true` when packets are framed as text lines
    pub fn is_text(&self) -> bool {
        self.text_mode && self.packet_terminator.is_none()
    }

    /// Maximum packet length after applying the mode default
    pub fn effective_max_len(&self) -> usize {
        match self.max_packet_len.filter(|len| *len > 0) {
            Some(len) => len,
            None if self.is_text() => DEFAULT_TEXT_MAX_LEN,
            None => DEFAULT_BINARY_MAX_LEN,
        }
    }

    /// Minimum packet length after applying the mode default
    pub fn effective_min_len(&self) -> usize {
        match self.min_packet_len.filter(|len| *len > 0) {
            Some(len) => len,
            None if self.is_text() => 1,
            None => self.effective_max_len(),
        }
    }

    /// Limits for one packet, honoring positive handler overrides
    pub fn packet_limits(&self, handler_min: Option<usize>, handler_max: Option<usize>) -> PacketLimits {
        let max = handler_max
            .filter(|len| *len > 0)
            .unwrap_or_else(|| self.effective_max_len());
        let min = handler_min
            .filter(|len| *len > 0)
            .unwrap_or_else(|| self.effective_min_len());
        PacketLimits::new(min, max).unwrap_or_else(|_| self.framing_rules().default_limits())
    }

    /// Datagram receive buffer size
    pub fn datagram_buffer_len(&self) -> usize {
        self.datagram_buffer_size
            .filter(|len| *len > 0)
            .unwrap_or_else(|| self.effective_max_len())
    }

    /// Framing rules shared by every session of the listener
    pub fn framing_rules(&self) -> FramingRules {
        let rules = if self.text_mode {
            FramingRules::text()
        } else {
            FramingRules::binary()
        };
        let rules = rules
            .with_line_terminators(&self.line_terminators)
            .with_ignore_chars(&self.ignore_chars)
            .with_backspace_chars(&self.backspace_chars)
            .with_backspace_enabled(self.prompt.is_active());
        match &self.packet_terminator {
            Some(pattern) => rules.with_terminator_pattern(pattern.clone()),
            None => rules,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.backlog == 0 {
            return Err(invalid("backlog must be greater than 0"));
        }
        if self.is_text() && self.line_terminators.is_empty() {
            return Err(invalid("text mode requires at least one line terminator"));
        }
        if let (Some(min), Some(max)) = (self.min_packet_len, self.max_packet_len) {
            if min > 0 && max > 0 && min > max {
                return Err(invalid(&format!(
                    "minimum packet length {} exceeds maximum {}",
                    min, max
                )));
            }
        }
        if self.datagram_buffer_size == Some(0) {
            return Err(invalid("datagram buffer size must be greater than 0"));
        }
        if self.udp_remote_port == Some(0) {
            return Err(invalid("UDP remote port must be greater than 0"));
        }
        if self.transport != Transport::Udp && self.udp_remote_port.is_some() {
            return Err(invalid("UDP remote port requires the UDP transport"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> ServiceError {
    ServiceError::InvalidConfig(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackwire_framing::FramingMode;

    #[test]
    fn test_default_config() {
        let config = ListenerConfig::default();
        assert_eq!(config.backlog, 50);
        assert_eq!(config.transport, Transport::Tcp);
        assert!(config.text_mode);
        assert_eq!(config.linger, Some(Duration::from_secs(4)));
        assert!(config.terminate_on_timeout);
        assert!(config.udp_reply_from_listener);
        assert!(config.idle_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = ListenerConfig::new(31000)
            .with_bind_address("127.0.0.1".parse().unwrap())
            .with_backlog(10)
            .with_packet_timeout(Duration::from_secs(3))
            .with_terminate_on_timeout(false);
        assert_eq!(config.socket_addr(), "127.0.0.1:31000".parse().unwrap());
        assert_eq!(config.backlog, 10);
        assert_eq!(config.packet_timeout, Some(Duration::from_secs(3)));
        assert!(!config.terminate_on_timeout);
    }

    #[test]
    fn test_unbound_address() {
        let config = ListenerConfig::new(9000);
        assert_eq!(config.socket_addr(), "0.0.0.0:9000".parse().unwrap());
    }

    #[test]
    fn test_timeout_from_millis() {
        assert_eq!(timeout_from_millis(0), None);
        assert_eq!(timeout_from_millis(-1), None);
        assert_eq!(timeout_from_millis(1500), Some(Duration::from_millis(1500)));
        let config = ListenerConfig::new(0).with_timeouts_millis(-1, 200, 0);
        assert!(config.session_timeout.is_none());
        assert_eq!(config.idle_timeout, Some(Duration::from_millis(200)));
        assert!(config.packet_timeout.is_none());
    }

    #[test]
    fn test_mode_defaults() {
        let text = ListenerConfig::new(0);
        assert_eq!(text.effective_max_len(), 2048);
        assert_eq!(text.effective_min_len(), 1);

        let binary = ListenerConfig::new(0).with_text_mode(false);
        assert_eq!(binary.effective_max_len(), 1024);
        assert_eq!(binary.effective_min_len(), 1024);
        assert!(binary.ignore_chars.is_empty());
        assert!(binary.backspace_chars.is_empty());
    }

    #[test]
    fn test_packet_terminator_forces_binary() {
        let config = ListenerConfig::new(0).with_packet_terminator(&b"--END--"[..]);
        assert!(!config.text_mode);
        assert!(!config.is_text());
        let rules = config.framing_rules();
        assert_eq!(rules.mode(), FramingMode::Binary);
        assert_eq!(rules.pattern().unwrap().as_bytes(), b"--END--");

        let config = ListenerConfig::new(0).with_packet_terminator(Bytes::new());
        assert!(config.is_text());
    }

    #[test]
    fn test_packet_limits_overrides() {
        let config = ListenerConfig::new(0).with_text_mode(false).with_max_packet_len(200);
        let limits = config.packet_limits(None, None);
        assert_eq!((limits.min(), limits.max()), (200, 200));

        let limits = config.packet_limits(Some(8), Some(64));
        assert_eq!((limits.min(), limits.max()), (8, 64));

        // listener minimum above a handler maximum is clamped
        let limits = config.packet_limits(None, Some(16));
        assert_eq!((limits.min(), limits.max()), (16, 16));
    }

    #[test]
    fn test_datagram_buffer_len() {
        let config = ListenerConfig::new(0).with_transport(Transport::Udp);
        assert_eq!(config.datagram_buffer_len(), 2048);
        let config = config.with_datagram_buffer_size(9000);
        assert_eq!(config.datagram_buffer_len(), 9000);
    }

    #[test]
    fn test_prompt_enables_backspace() {
        assert!(!ListenerConfig::new(0).framing_rules().backspace_enabled());
        let config = ListenerConfig::new(0).with_prompt(Prompt::Fixed(Bytes::from_static(b"> ")));
        assert!(config.framing_rules().backspace_enabled());
    }

    #[test]
    fn test_validation() {
        assert!(ListenerConfig::new(0).with_backlog(0).validate().is_err());
        assert!(
            ListenerConfig::new(0)
                .with_line_terminators(&[])
                .validate()
                .is_err()
        );
        assert!(
            ListenerConfig::new(0)
                .with_min_packet_len(10)
                .with_max_packet_len(5)
                .validate()
                .is_err()
        );
        assert!(
            ListenerConfig::new(0)
                .with_datagram_buffer_size(0)
                .validate()
                .is_err()
        );
        assert!(ListenerConfig::new(0).with_udp_remote_port(9).validate().is_err());
        assert!(
            ListenerConfig::new(0)
                .with_transport(Transport::Udp)
                .with_udp_remote_port(9)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_transport_display() {
        assert_eq!(Transport::Udp.to_string(), "UDP");
        assert!(Transport::Tls.is_stream());
        assert!(!Transport::Udp.is_stream());
    }
}
