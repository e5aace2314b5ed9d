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

//! UDP listener tests over loopback sockets

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use trackwire_service::{
    CallbackHandler, ListenerConfig, PacketLength, SessionOutcome, SessionStats, SocketServer,
    Transport, send_datagram,
};

fn udp_config() -> ListenerConfig {
    ListenerConfig::new(0)
        .with_bind_address([127, 0, 0, 1].into())
        .with_transport(Transport::Udp)
        .with_text_mode(false)
        .with_min_packet_len(1)
}

/// Four-byte records, each acknowledged with `OK` plus the record
fn record_handler(outcomes: &Arc<Mutex<Vec<SessionOutcome>>>) -> CallbackHandler {
    let outcomes = outcomes.clone();
    CallbackHandler {
        on_packet: Some(Arc::new(|packet: &[u8]| {
            let mut reply = b"OK".to_vec();
            reply.extend_from_slice(packet);
            Some(Bytes::from(reply))
        })),
        packet_length: Some(Arc::new(|_: &[u8]| PacketLength::Exact(4))),
        on_end: Some(Arc::new(move |outcome: &SessionOutcome, _: SessionStats| {
            outcomes.lock().unwrap().push(outcome.clone());
        })),
        keep_alive: true,
        ..Default::default()
    }
}

async fn start(config: ListenerConfig, handler: CallbackHandler) -> SocketServer {
    let mut server = SocketServer::bind(config).await.unwrap();
    server.set_shared_handler(handler);
    server.start().await.unwrap();
    server
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn device() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn receive(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buffer = [0u8; 64];
    let (len, from) = timeout(Duration::from_secs(2), socket.recv_from(&mut buffer))
        .await
        .unwrap()
        .unwrap();
    (buffer[..len].to_vec(), from)
}

#[tokio::test]
async fn test_datagram_with_two_packets() {
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let server = start(udp_config(), record_handler(&outcomes)).await;
    let device = device().await;

    device
        .send_to(b"ABCDEFGH", server.local_addr())
        .await
        .unwrap();

    let (first, from) = receive(&device).await;
    let (second, _) = receive(&device).await;
    assert_eq!(first, b"OKABCD");
    assert_eq!(second, b"OKEFGH");
    assert_eq!(from, server.local_addr());

    eventually(|| outcomes.lock().unwrap().len() == 1).await;
    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.packets_received, 2);
    assert_eq!(snapshot.session_errors, 0);
    assert_eq!(*outcomes.lock().unwrap(), vec![SessionOutcome::Normal]);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_replies_from_ephemeral_socket() {
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let config = udp_config().with_udp_reply_from_listener(false);
    let server = start(config, record_handler(&outcomes)).await;
    let device = device().await;

    device.send_to(b"WXYZ", server.local_addr()).await.unwrap();

    let (reply, from) = receive(&device).await;
    assert_eq!(reply, b"OKWXYZ");
    assert_ne!(from.port(), server.local_addr().port());
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handler_response_port_wins() {
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sender = device().await;
    let collector = device().await;
    let handler = CallbackHandler {
        response_port: Some(collector.local_addr().unwrap().port()),
        ..record_handler(&outcomes)
    };
    let server = start(udp_config(), handler).await;

    sender.send_to(b"1234", server.local_addr()).await.unwrap();

    let (reply, _) = receive(&collector).await;
    assert_eq!(reply, b"OK1234");
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_listener_remote_port_override() {
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sender = device().await;
    let collector = device().await;
    let config = udp_config().with_udp_remote_port(collector.local_addr().unwrap().port());
    let server = start(config, record_handler(&outcomes)).await;

    sender.send_to(b"5678", server.local_addr()).await.unwrap();

    let (reply, _) = receive(&collector).await;
    assert_eq!(reply, b"OK5678");
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_one_session_per_datagram() {
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let server = start(udp_config(), record_handler(&outcomes)).await;
    let device = device().await;

    for record in [b"AAAA", b"BBBB", b"CCCC"] {
        send_datagram(server.local_addr(), record).await.unwrap();
    }
    device.send_to(b"DDDD", server.local_addr()).await.unwrap();
    let (reply, _) = receive(&device).await;
    assert_eq!(reply, b"OKDDDD");

    eventually(|| outcomes.lock().unwrap().len() == 4).await;
    assert_eq!(server.metrics().total_sessions(), 4);
    server.shutdown().await.unwrap();
}
