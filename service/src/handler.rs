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

//! Packet handler contract
//!
//! A [`PacketHandler`] interprets the framed packets of one device protocol.
//! The engine creates one handler per session through a [`HandlerFactory`]
//! and never shares an instance between two sessions. Every hook except
//! [`handle_packet`](PacketHandler::handle_packet) has a default, so a
//! handler only overrides what its protocol needs.

use crate::{HandlerResult, SessionInfo, SessionOutcome, SessionStats};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use trackwire_framing::{LengthNegotiator, PacketLength};

/// Device protocol handler, one instance per session
///
/// # Example
///
/// ```no_run
/// use async_trait::async_trait;
/// use bytes::Bytes;
/// use trackwire_service::{HandlerResult, PacketHandler};
///
/// struct Ack;
///
/// #[async_trait]
/// impl PacketHandler for Ack {
///     async fn handle_packet(&mut self, packet: Bytes) -> HandlerResult<Option<Bytes>> {
///         Ok(Some(Bytes::from(format!("ACK {}\n", packet.len()))))
///     }
///
///     fn should_terminate(&self) -> bool {
///         false
///     }
/// }
/// ```
#[async_trait]
pub trait PacketHandler: Send + 'static {
    /// Called once before anything is read
    async fn on_session_start(&mut self, _info: &SessionInfo) {}

    /// Bytes written before the first read, stream transports only
    fn initial_packet(&mut self) -> Option<Bytes> {
        None
    }

    /// Minimum length of the next packet, listener default when `None`
    fn minimum_packet_length(&self) -> Option<usize> {
        None
    }

    /// Maximum length of the next packet, listener default when `None`
    fn maximum_packet_length(&self) -> Option<usize> {
        None
    }

    /// Decide the length of a binary packet from the bytes read so far
    fn actual_packet_length(&mut self, packet: &[u8]) -> PacketLength {
        PacketLength::Exact(packet.len())
    }

    /// Process one framed packet and return the response, if any
    async fn handle_packet(&mut self, packet: Bytes) -> HandlerResult<Option<Bytes>>;

    /// UDP reply port, peer source port when `None`
    fn response_port(&self) -> Option<u16> {
        None
    }

    /// Checked at session start and after every packet
    ///
    /// Handlers that keep a conversation open must override this.
    fn should_terminate(&self) -> bool {
        true
    }

    /// Bytes sent just before the connection closes
    fn final_packet(&mut self, _had_error: bool) -> Option<Bytes> {
        None
    }

    /// Called once with the terminal outcome and session counters
    async fn on_session_end(&mut self, _outcome: &SessionOutcome, _stats: SessionStats) {}
}

/// Borrows a handler as the framer's length negotiator
pub(crate) struct HandlerNegotiator<'a>(pub(crate) &'a mut dyn PacketHandler);

impl LengthNegotiator for HandlerNegotiator<'_> {
    fn actual_packet_length(&mut self, packet: &[u8]) -> PacketLength {
        self.0.actual_packet_length(packet)
    }
}

/// Produces one handler per session
pub trait HandlerFactory: Send + Sync + 'static {
    fn create(&self) -> Box<dyn PacketHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Box<dyn PacketHandler> + Send + Sync + 'static,
{
    fn create(&self) -> Box<dyn PacketHandler> {
        self()
    }
}

/// Factory handing every session a clone of one prototype handler
///
/// State that must be shared across sessions belongs behind an `Arc` inside
/// the handler.
#[derive(Debug, Clone)]
pub struct SharedHandler<H>(H);

impl<H> SharedHandler<H>
where
    H: PacketHandler + Clone + Sync,
{
    pub fn new(prototype: H) -> Self {
        Self(prototype)
    }
}

impl<H> HandlerFactory for SharedHandler<H>
where
    H: PacketHandler + Clone + Sync,
{
    fn create(&self) -> Box<dyn PacketHandler> {
        Box::new(self.0.clone())
    }
}

/// Passive observer notified with every raw packet before the handler sees it
///
/// Returning [`ControlFlow::Break`] ends the session normally.
pub trait PacketListener: Send + Sync + 'static {
    fn on_packet(&self, packet: &[u8]) -> ControlFlow<()>;
}

impl<F> PacketListener for F
where
    F: Fn(&[u8]) -> ControlFlow<()> + Send + Sync + 'static,
{
    fn on_packet(&self, packet: &[u8]) -> ControlFlow<()> {
        self(packet)
    }
}

type PacketCallback = Arc<dyn Fn(&[u8]) -> Option<Bytes> + Send + Sync + 'static>;
type StartCallback = Arc<dyn Fn(&SessionInfo) + Send + Sync + 'static>;
type EndCallback = Arc<dyn Fn(&SessionOutcome, SessionStats) + Send + Sync + 'static>;
type LengthCallback = Arc<dyn Fn(&[u8]) -> PacketLength + Send + Sync + 'static>;

/// Callback-based handler implementation
///
/// Closures replace trait methods for simple devices and tests. Clone it into
/// a [`SharedHandler`] to serve a listener.
///
/// ```no_run
/// use bytes::Bytes;
/// use std::sync::Arc;
/// use trackwire_service::{CallbackHandler, SharedHandler};
///
/// let handler = CallbackHandler {
///     on_packet: Some(Arc::new(|packet: &[u8]| {
///         println!("received {} bytes", packet.len());
///         Some(Bytes::from_static(b"OK\n"))
///     })),
///     keep_alive: true,
///     ..Default::default()
/// };
/// let factory = SharedHandler::new(handler);
/// ```
#[derive(Clone, Default)]
pub struct CallbackHandler {
    /// Called for every packet, the return value is the response
    pub on_packet: Option<PacketCallback>,
    /// Called at session start
    pub on_start: Option<StartCallback>,
    /// Called at session end
    pub on_end: Option<EndCallback>,
    /// Binary length negotiation, `Exact(len)` when unset
    pub packet_length: Option<LengthCallback>,
    /// Written before the first read
    pub initial: Option<Bytes>,
    /// Sent before close
    pub farewell: Option<Bytes>,
    /// Minimum packet length override
    pub min_len: Option<usize>,
    /// Maximum packet length override
    pub max_len: Option<usize>,
    /// UDP reply port override
    pub response_port: Option<u16>,
    /// Keep the session open after each packet
    pub keep_alive: bool,
}

impl fmt::Debug for CallbackHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandler")
            .field("on_packet", &self.on_packet.is_some())
            .field("on_start", &self.on_start.is_some())
            .field("on_end", &self.on_end.is_some())
            .field("packet_length", &self.packet_length.is_some())
            .field("initial", &self.initial)
            .field("farewell", &self.farewell)
            .field("min_len", &self.min_len)
            .field("max_len", &self.max_len)
            .field("response_port", &self.response_port)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

#[async_trait]
impl PacketHandler for CallbackHandler {
    async fn on_session_start(&mut self, info: &SessionInfo) {
        if let Some(ref f) = self.on_start {
            f(info);
        }
    }

    fn initial_packet(&mut self) -> Option<Bytes> {
        self.initial.clone()
    }

    fn minimum_packet_length(&self) -> Option<usize> {
        self.min_len
    }

    fn maximum_packet_length(&self) -> Option<usize> {
        self.max_len
    }

    fn actual_packet_length(&mut self, packet: &[u8]) -> PacketLength {
        match self.packet_length {
            Some(ref f) => f(packet),
            None => PacketLength::Exact(packet.len()),
        }
    }

    async fn handle_packet(&mut self, packet: Bytes) -> HandlerResult<Option<Bytes>> {
        Ok(self.on_packet.as_ref().and_then(|f| f(&packet)))
    }

    fn response_port(&self) -> Option<u16> {
        self.response_port
    }

    fn should_terminate(&self) -> bool {
        !self.keep_alive
    }

    fn final_packet(&mut self, _had_error: bool) -> Option<Bytes> {
        self.farewell.clone()
    }

    async fn on_session_end(&mut self, outcome: &SessionOutcome, stats: SessionStats) {
        if let Some(ref f) = self.on_end {
            f(outcome, stats);
        }
    }
}
