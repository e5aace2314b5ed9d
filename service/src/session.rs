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

//! Session engine
//!
//! [`SessionEngine`] runs one device exchange from the first hook to the close:
//! it creates the packet handler, frames packets under the session, idle and
//! packet deadlines, dispatches them and routes responses back to the device.
//!
//! # Timeouts
//!
//! Three deadlines bound every read and the nearest one wins:
//!
//! - the session deadline, fixed when the session starts;
//! - the idle deadline, armed for the first byte of each packet;
//! - the packet deadline, armed once the first byte of a packet arrived.
//!
//! A deadline that passes between packets is a boundary timeout and is
//! logged at `info`. One that passes with bytes of a packet in hand is a
//! mid-packet timeout and is logged at `warn`.

use crate::handler::HandlerNegotiator;
use crate::{
    ConnectionId, DeviceConnection, HandlerFactory, ListenerConfig, PacketHandler, PacketListener,
    Prompt, ReadStatus, ServerMetrics, SessionInfo, SessionOutcome, SessionStats,
};
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use std::any::Any;
use std::fmt::Write;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use trackwire_framing::{Framer, FramingRules};
use tracing::{debug, error, info, instrument, warn};

/// Bytes of a partial packet shown in timeout and end of stream warnings
const PREVIEW_LIMIT: usize = 32;

/// Result of a [`SessionEngine::test_session`] run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSessionReport {
    /// How the session ended
    pub outcome: SessionOutcome,
    /// Every response and final packet, in the order the handler produced them
    pub responses: Vec<Bytes>,
    /// Byte and packet counters
    pub stats: SessionStats,
}

/// Runs sessions for one listener
///
/// The engine holds everything sessions of a listener share: the frozen
/// configuration, the framing rules derived from it, the handler factory and
/// the passive packet listeners.
pub struct SessionEngine {
    config: Arc<ListenerConfig>,
    rules: Arc<FramingRules>,
    factory: Arc<dyn HandlerFactory>,
    listeners: Vec<Arc<dyn PacketListener>>,
    metrics: Arc<ServerMetrics>,
    next_id: AtomicU64,
}

impl SessionEngine {
    pub fn new(
        config: Arc<ListenerConfig>,
        factory: Arc<dyn HandlerFactory>,
        listeners: Vec<Arc<dyn PacketListener>>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let rules = Arc::new(config.framing_rules());
        Self {
            config,
            rules,
            factory,
            listeners,
            metrics,
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the ID for the next connection of this listener
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn config(&self) -> &Arc<ListenerConfig> {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Run one session on `connection` until it ends, then close it
    ///
    /// Nothing that happens inside the session escapes as an error; the
    /// returned outcome says how it ended.
    pub async fn run(&self, connection: &mut DeviceConnection) -> SessionOutcome {
        self.serve(connection).await.0
    }

    /// Feed `data` through the full pipeline over an in-memory connection
    ///
    /// The connection behaves like one datagram: the initial packet and
    /// prompts are skipped and every response is captured in the report.
    pub async fn test_session(&self, data: impl Into<Bytes>) -> TestSessionReport {
        let mut connection = DeviceConnection::memory(self.next_connection_id(), data.into());
        let (outcome, stats) = self.serve(&mut connection).await;
        TestSessionReport {
            outcome,
            responses: connection.take_sent(),
            stats,
        }
    }

    #[instrument(
        name = "session",
        skip_all,
        fields(connection_id = %connection.id(), peer = %connection.peer_addr())
    )]
    async fn serve(&self, connection: &mut DeviceConnection) -> (SessionOutcome, SessionStats) {
        let started = std::time::Instant::now();
        self.metrics.session_opened();
        counter!("trackwire.sessions.total").increment(1);
        gauge!("trackwire.sessions.active").increment(1.0);

        let info = SessionInfo {
            connection_id: connection.id(),
            peer_addr: connection.peer_addr(),
            local_port: connection.local_port(),
            transport: self.config.transport,
            stream_oriented: connection.is_stream_oriented(),
            text_mode: self.rules.is_text(),
        };
        info!(
            transport = %info.transport,
            stream = info.stream_oriented,
            local_port = info.local_port,
            "Session started"
        );

        let handler = self.factory.create();
        let mut session = Session::new(self, connection, handler);
        let outcome = session.contained(&info).await;
        // Closed by the server before the session wound down on its own
        let shutting_down = session.connection.is_closed();
        let failed = outcome.is_error() && !shutting_down;
        let stats = session.finish(&outcome, failed).await;

        let elapsed = started.elapsed();
        histogram!("trackwire.session.duration").record(elapsed.as_secs_f64());
        gauge!("trackwire.sessions.active").decrement(1.0);
        self.metrics
            .session_closed(elapsed, stats.bytes_read, stats.bytes_written, failed);

        if failed {
            warn!(
                %outcome,
                packets = stats.packets,
                bytes_read = stats.bytes_read,
                bytes_written = stats.bytes_written,
                "Session ended"
            );
        } else {
            info!(
                %outcome,
                packets = stats.packets,
                bytes_read = stats.bytes_read,
                bytes_written = stats.bytes_written,
                "Session ended"
            );
        }
        (outcome, stats)
    }
}

impl std::fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine")
            .field("config", &self.config)
            .field("listeners", &self.listeners.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

/// State of one running session
struct Session<'a> {
    engine: &'a SessionEngine,
    connection: &'a mut DeviceConnection,
    handler: Box<dyn PacketHandler>,
    framer: Framer,
    buffer: BytesMut,
    deadline: Option<Instant>,
    packets: u64,
}

impl<'a> Session<'a> {
    fn new(
        engine: &'a SessionEngine,
        connection: &'a mut DeviceConnection,
        handler: Box<dyn PacketHandler>,
    ) -> Self {
        Self {
            engine,
            connection,
            handler,
            framer: Framer::new(engine.rules.clone()),
            buffer: BytesMut::new(),
            deadline: engine.config.session_timeout.map(|t| Instant::now() + t),
            packets: 0,
        }
    }

    /// Run the start hook and the conversation with handler panics contained
    ///
    /// A panic in any hook ends the session as a handler failure, so the
    /// final packet, the end hook and the close still run.
    async fn contained(&mut self, info: &SessionInfo) -> SessionOutcome {
        let result = AssertUnwindSafe(async {
            self.handler.on_session_start(info).await;
            self.converse().await
        })
        .catch_unwind()
        .await;
        match result {
            Ok(outcome) => outcome,
            Err(panic) => {
                self.handler_failed(format!("panicked: {}", panic_message(panic.as_ref())))
            }
        }
    }

    /// Read, dispatch and respond until something ends the session
    async fn converse(&mut self) -> SessionOutcome {
        if self.handler.should_terminate() {
            debug!("Handler ended the session before the first read");
            return SessionOutcome::Normal;
        }
        let stream = self.connection.is_stream_oriented();

        if stream {
            if let Some(initial) = self.handler.initial_packet().filter(|p| !p.is_empty()) {
                if let Err(err) = self.connection.write_stream(&initial).await {
                    return self.io_failure(&err, "Initial packet write failed");
                }
            }
        }

        let mut round: u64 = 0;
        loop {
            if self.session_expired() {
                return self.session_timeout();
            }
            if stream {
                if let Some(prompt) = self.prompt(round) {
                    if let Err(err) = self.connection.write_stream(&prompt).await {
                        return self.io_failure(&err, "Prompt write failed");
                    }
                }
            }
            round += 1;

            let packet = match self.read_packet().await {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(outcome) => return outcome,
            };
            self.packets += 1;
            self.engine.metrics.packet_received();
            counter!("trackwire.packets.received").increment(1);
            debug!(bytes = packet.len(), "Packet framed");

            for listener in &self.engine.listeners {
                if listener.on_packet(&packet).is_break() {
                    info!("Packet listener ended the session");
                    return SessionOutcome::Normal;
                }
            }

            match self.dispatch(packet).await {
                Ok(Some(response)) if !response.is_empty() => {
                    if let Err(err) = self.send(&response).await {
                        return self.io_failure(&err, "Response write failed");
                    }
                    self.engine.metrics.response_sent();
                }
                Ok(_) => {}
                Err(outcome) => return outcome,
            }

            if self.handler.should_terminate() {
                debug!("Handler ended the session");
                return SessionOutcome::Normal;
            }
            if !stream && self.buffer.is_empty() && self.connection.available() == 0 {
                debug!(packets = self.packets, "Datagram exhausted");
                return SessionOutcome::Normal;
            }
        }
    }

    /// Frame the next packet
    ///
    /// `Ok(None)` means a timeout passed that does not end the session.
    async fn read_packet(&mut self) -> Result<Option<Bytes>, SessionOutcome> {
        let engine = self.engine;
        let limits = engine.config.packet_limits(
            self.handler.minimum_packet_length(),
            self.handler.maximum_packet_length(),
        );
        self.framer.begin(limits);

        let idle_deadline = engine.config.idle_timeout.map(|t| Instant::now() + t);
        let mut packet_deadline = None;
        let mut started = false;
        loop {
            let mut negotiator = HandlerNegotiator(self.handler.as_mut());
            if let Some(packet) = self.framer.decode(&mut self.buffer, &mut negotiator) {
                return Ok(Some(packet));
            }
            if !started && self.framer.has_started() {
                started = true;
                packet_deadline = engine.config.packet_timeout.map(|t| Instant::now() + t);
            }
            let phase = if started { packet_deadline } else { idle_deadline };

            match self
                .connection
                .read_into(&mut self.buffer, earliest(self.deadline, phase))
                .await
            {
                Ok(ReadStatus::Data(_)) => {}
                Ok(ReadStatus::TimedOut) if self.session_expired() => {
                    return Err(self.session_timeout());
                }
                Ok(ReadStatus::TimedOut) => return self.read_timed_out(),
                Ok(ReadStatus::Eof) => return self.end_of_input(),
                Err(err) => return Err(self.io_failure(&err, "Read failed")),
            }
        }
    }

    fn read_timed_out(&mut self) -> Result<Option<Bytes>, SessionOutcome> {
        let terminate = self.engine.config.terminate_on_timeout;
        if !self.framer.is_empty() {
            warn!(
                bytes = self.framer.len(),
                partial = %hex_preview(self.framer.partial()),
                terminate,
                "Timeout mid-packet"
            );
            self.engine.metrics.mid_packet_timeout();
            counter!("trackwire.timeouts", "class" => "mid_packet").increment(1);
            if terminate {
                return Err(SessionOutcome::PacketReadTimeout { mid_packet: true });
            }
            return Ok(Some(self.framer.take_partial()));
        }

        info!(terminate, "Timeout at packet boundary");
        self.engine.metrics.boundary_timeout();
        counter!("trackwire.timeouts", "class" => "boundary").increment(1);
        if terminate {
            Err(SessionOutcome::PacketReadTimeout { mid_packet: false })
        } else {
            Ok(None)
        }
    }

    fn end_of_input(&mut self) -> Result<Option<Bytes>, SessionOutcome> {
        let stream = self.connection.is_stream_oriented();
        if !stream || self.framer.accepts_end_of_stream() {
            if !self.framer.is_empty() {
                return Ok(Some(self.framer.take_partial()));
            }
            if stream {
                info!("Stream closed at packet boundary");
            }
            return Err(SessionOutcome::EndOfStream {
                mid_packet: false,
                stream,
            });
        }
        if !self.framer.is_empty() {
            warn!(
                bytes = self.framer.len(),
                partial = %hex_preview(self.framer.partial()),
                "Stream closed mid-packet"
            );
            counter!("trackwire.errors.truncated").increment(1);
            return Err(SessionOutcome::EndOfStream {
                mid_packet: true,
                stream: true,
            });
        }
        info!("Stream closed at packet boundary");
        Err(SessionOutcome::EndOfStream {
            mid_packet: false,
            stream: true,
        })
    }

    /// Hand one packet to the handler, containing errors and panics
    async fn dispatch(&mut self, packet: Bytes) -> Result<Option<Bytes>, SessionOutcome> {
        let result = AssertUnwindSafe(self.handler.handle_packet(packet))
            .catch_unwind()
            .await;
        let reason = match result {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(err)) => err.to_string(),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };
        Err(self.handler_failed(reason))
    }

    fn handler_failed(&self, reason: String) -> SessionOutcome {
        error!(%reason, packets = self.packets, "Packet handler failed");
        self.engine.metrics.handler_failure();
        counter!("trackwire.errors.handler").increment(1);
        SessionOutcome::HandlerFailed(reason)
    }

    /// Deliver bytes to the device over whichever path its transport uses
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if self.connection.is_stream_oriented() {
            self.connection.write_stream(data).await
        } else {
            let port = self.reply_port();
            self.connection.send_datagram(data, port).await
        }
    }

    /// Handler override, then listener override, then the datagram source port
    fn reply_port(&self) -> u16 {
        self.handler
            .response_port()
            .filter(|port| *port > 0)
            .or(self.engine.config.udp_remote_port)
            .unwrap_or_else(|| self.connection.peer_port())
    }

    fn prompt(&self, round: u64) -> Option<Bytes> {
        match &self.engine.config.prompt {
            Prompt::None => None,
            Prompt::Fixed(prompt) if prompt.is_empty() => None,
            Prompt::Fixed(prompt) => Some(prompt.clone()),
            Prompt::Auto if self.engine.rules.is_text() => {
                Some(Bytes::from(format!("{}> ", round + 1)))
            }
            Prompt::Auto => None,
        }
    }

    fn session_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn session_timeout(&self) -> SessionOutcome {
        warn!(packets = self.packets, "Session timeout");
        counter!("trackwire.timeouts", "class" => "session").increment(1);
        SessionOutcome::SessionTimeout
    }

    fn io_failure(&self, err: &io::Error, message: &str) -> SessionOutcome {
        if self.connection.is_closed() {
            info!(error = %err, "Connection closed by server, shutting down session");
        } else {
            error!(error = %err, "{}", message);
            counter!("trackwire.errors.io").increment(1);
        }
        SessionOutcome::io(err)
    }

    /// Final packet, end hook, linger and close
    ///
    /// `failed` is false for sessions the server closed on shutdown.
    async fn finish(mut self, outcome: &SessionOutcome, failed: bool) -> SessionStats {
        let handler = &mut self.handler;
        let final_packet =
            std::panic::catch_unwind(AssertUnwindSafe(|| handler.final_packet(failed)))
                .unwrap_or_else(|panic| {
                    self.engine.metrics.handler_failure();
                    error!(reason = %panic_message(panic.as_ref()), "Final packet hook panicked");
                    None
                })
                .filter(|p| !p.is_empty());
        if let Some(farewell) = final_packet {
            if self.connection.is_closed() {
                debug!("Connection already closed, final packet dropped");
            } else if let Err(err) = self.send(&farewell).await {
                debug!(error = %err, "Final packet not delivered");
            }
        }

        let stats = SessionStats {
            bytes_read: self.connection.bytes_read(),
            bytes_written: self.connection.bytes_written(),
            packets: self.packets,
        };
        let ended = AssertUnwindSafe(self.handler.on_session_end(outcome, stats))
            .catch_unwind()
            .await;
        if let Err(panic) = ended {
            self.engine.metrics.handler_failure();
            error!(reason = %panic_message(panic.as_ref()), "Session end hook panicked");
        }

        if let Err(err) = self.connection.close(self.engine.config.linger).await {
            debug!(error = %err, "Close failed");
        }
        stats
    }
}

/// Nearest of two optional deadlines
fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(PREVIEW_LIMIT * 2 + 2);
    for byte in bytes.iter().take(PREVIEW_LIMIT) {
        let _ = write!(out, "{:02X}", byte);
    }
    if bytes.len() > PREVIEW_LIMIT {
        out.push_str("..");
    }
    out
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
