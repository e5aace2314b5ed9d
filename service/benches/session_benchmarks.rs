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

//! Benchmarks for the session engine and the TCP listener

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use trackwire_service::{
    CallbackHandler, ListenerConfig, PacketLength, ServerMetrics, SessionEngine, SharedHandler,
    SocketServer,
};

fn ack_handler() -> CallbackHandler {
    CallbackHandler {
        on_packet: Some(Arc::new(|_: &[u8]| Some(Bytes::from_static(b"OK\n")))),
        keep_alive: true,
        ..Default::default()
    }
}

fn engine(config: ListenerConfig, handler: CallbackHandler) -> SessionEngine {
    SessionEngine::new(
        Arc::new(config),
        Arc::new(SharedHandler::new(handler)),
        Vec::new(),
        Arc::new(ServerMetrics::new()),
    )
}

// Benchmark in-memory sessions carrying text lines
fn bench_text_session(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("text_session");

    for lines in [1usize, 16, 256] {
        let input: Bytes = "$GPRMC,123519,A,4807.038,N,01131.000,E*6A\r\n"
            .repeat(lines)
            .into();
        let engine = engine(ListenerConfig::new(0), ack_handler());
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &input, |b, input| {
            b.to_async(&runtime)
                .iter(|| async { black_box(engine.test_session(input.clone()).await) });
        });
    }

    group.finish();
}

// Benchmark handler negotiated binary records
fn bench_binary_session(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let handler = CallbackHandler {
        packet_length: Some(Arc::new(|packet: &[u8]| match packet {
            [len, ..] => PacketLength::Exact(1 + *len as usize),
            [] => PacketLength::Incremental(1),
        })),
        ..ack_handler()
    };
    let config = ListenerConfig::new(0)
        .with_text_mode(false)
        .with_min_packet_len(1);
    let engine = engine(config, handler);

    let mut input = Vec::new();
    for i in 0..128u8 {
        let len = i % 24;
        input.push(len);
        input.extend(std::iter::repeat_n(i, len as usize));
    }
    let input = Bytes::from(input);

    let mut group = c.benchmark_group("binary_session");
    group.throughput(Throughput::Bytes(input.len() as u64));
    group.bench_function("records_128", |b| {
        b.to_async(&runtime)
            .iter(|| async { black_box(engine.test_session(input.clone()).await) });
    });
    group.finish();
}

// Benchmark a request/response round trip over loopback TCP
fn bench_tcp_round_trip(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (server, mut client) = runtime.block_on(async {
        let config = ListenerConfig::new(0).with_bind_address([127, 0, 0, 1].into());
        let mut server = SocketServer::bind(config).await.unwrap();
        server.set_shared_handler(ack_handler());
        server.start().await.unwrap();
        let client = TcpStream::connect(server.local_addr()).await.unwrap();
        (server, client)
    });

    c.bench_function("tcp_round_trip", |b| {
        b.iter(|| {
            runtime.block_on(async {
                client.write_all(b"PING\n").await.unwrap();
                let mut reply = [0u8; 3];
                client.read_exact(&mut reply).await.unwrap();
                black_box(reply);
            })
        });
    });

    runtime.block_on(async {
        drop(client);
        server.shutdown().await.unwrap();
    });
}

criterion_group!(
    benches,
    bench_text_session,
    bench_binary_session,
    bench_tcp_round_trip
);
criterion_main!(benches);
