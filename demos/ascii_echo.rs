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

//! ASCII Acknowledgement Server Example
//!
//! This example runs a text-mode TCP listener that:
//! - Accepts device connections on port 31275
//! - Frames each line and acknowledges it with its length
//! - Shows a numbered prompt, so backspace editing works from a terminal
//! - Closes the session on `quit` with a farewell line
//!
//! ## Usage
//!
//! Run the server:
//! ```bash
//! RUST_LOG=debug cargo run -p trackwire-service --example ascii_echo
//! ```
//!
//! Connect with any line-oriented client:
//! ```bash
//! nc localhost 31275
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use trackwire_service::{
    HandlerResult, ListenerConfig, PacketHandler, Prompt, SessionInfo, SessionOutcome,
    SessionStats, SocketServer,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    println!("Starting ASCII acknowledgement server on 0.0.0.0:31275");
    println!("Connect with: nc localhost 31275");
    println!("Press Ctrl+C to stop the server\n");

    let config = ListenerConfig::new(31275)
        .with_prompt(Prompt::Auto)
        .with_max_packet_len(512)
        .with_idle_timeout(Duration::from_secs(300))
        .with_packet_timeout(Duration::from_secs(30));

    let mut server = SocketServer::bind(config).await?;
    server.set_shared_handler(AsciiAck::default());
    server.start().await?;

    // Wait for Ctrl+C
    tokio::signal::ctrl_c().await?;
    println!("\nShutting down server...");

    server.shutdown().await?;
    println!("{}", server.snapshot());

    Ok(())
}

/// Acknowledges every line until the device sends `quit`
#[derive(Clone, Default)]
struct AsciiAck {
    done: bool,
}

#[async_trait]
impl PacketHandler for AsciiAck {
    async fn on_session_start(&mut self, info: &SessionInfo) {
        tracing::info!("Device {} connected as {}", info.peer_addr, info.connection_id);
    }

    fn initial_packet(&mut self) -> Option<Bytes> {
        Some(Bytes::from_static(
            b"Trackwire ASCII acknowledgement server\r\nType 'quit' to disconnect.\r\n",
        ))
    }

    async fn handle_packet(&mut self, packet: Bytes) -> HandlerResult<Option<Bytes>> {
        let line = String::from_utf8_lossy(&packet);
        tracing::debug!("Line: {}", line);

        if line.trim().eq_ignore_ascii_case("quit") {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(Bytes::from(format!("ACK {} {}\r\n", packet.len(), line.trim()))))
    }

    fn should_terminate(&self) -> bool {
        self.done
    }

    fn final_packet(&mut self, had_error: bool) -> Option<Bytes> {
        if had_error {
            None
        } else {
            Some(Bytes::from_static(b"Goodbye!\r\n"))
        }
    }

    async fn on_session_end(&mut self, outcome: &SessionOutcome, stats: SessionStats) {
        tracing::info!(
            "Session ended ({}), {} packets, {} bytes in, {} bytes out",
            outcome,
            stats.packets,
            stats.bytes_read,
            stats.bytes_written
        );
    }
}
