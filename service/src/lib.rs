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

//! Device Communication Socket Server
//!
//! This crate accepts TCP, UDP or TLS connections from remote devices, frames
//! their byte streams into packets and hands every packet to a pluggable
//! [`PacketHandler`]. Responses, UDP acknowledgements, timeouts and shutdown
//! are handled by the listener so a device protocol only has to interpret
//! packets.
//!
//! # Architecture
//!
//! ```text
//! SocketServer (accept / receive loop)
//!     ↓
//! WorkerPool → SessionWorker
//!     ↓
//! SessionEngine → Framer + PacketHandler
//!     ↓
//! DeviceConnection (TCP | TLS | datagram | in-memory)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use std::time::Duration;
//! use trackwire_service::{HandlerResult, ListenerConfig, PacketHandler, SocketServer};
//!
//! #[derive(Clone)]
//! struct Ack;
//!
//! #[async_trait]
//! impl PacketHandler for Ack {
//!     async fn handle_packet(&mut self, packet: Bytes) -> HandlerResult<Option<Bytes>> {
//!         Ok(Some(Bytes::from(format!("ACK {}\r\n", packet.len()))))
//!     }
//!
//!     fn should_terminate(&self) -> bool {
//!         false
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ListenerConfig::new(31000).with_idle_timeout(Duration::from_secs(60));
//!     let mut server = SocketServer::bind(config).await?;
//!     server.set_shared_handler(Ack);
//!     server.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod error;
mod handler;
mod metrics;
mod server;
mod session;
mod types;
mod worker;

pub use self::config::{
    DEFAULT_BACKLOG, DEFAULT_LINGER, ListenerConfig, Prompt, Transport, timeout_from_millis,
};
pub use self::connection::{DatagramReply, DeviceConnection, ReadStatus, send_datagram};
pub use self::error::{HandlerError, HandlerResult, Result, ServiceError};
pub use self::handler::{
    CallbackHandler, HandlerFactory, PacketHandler, PacketListener, SharedHandler,
};
pub use self::metrics::{MetricsSnapshot, ServerMetrics};
pub use self::server::SocketServer;
pub use self::session::{SessionEngine, TestSessionReport};
pub use self::types::{
    ConnectionId, ServerSnapshot, SessionInfo, SessionOutcome, SessionStats, WorkerId,
};
pub use trackwire_framing::{FramingRules, PacketLength, PacketLimits};
