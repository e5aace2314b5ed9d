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

//! Byte-at-a-time packet assembly.

use crate::length::{LengthNegotiator, PacketLength};
use crate::rules::{FramingRules, PacketLimits};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::warn;

/// Upper bound on the buffer reserved up front for a packet.
const INITIAL_CAPACITY: usize = 256;

/// Incremental packet builder.
///
/// A `Framer` is fed one byte at a time and yields a packet when the rules
/// and the length negotiator agree it is complete. Between packets it must be
/// re-armed with [`begin`](Framer::begin), which also lets callers change the
/// limits per packet.
#[derive(Debug, Clone)]
pub struct Framer {
    rules: Arc<FramingRules>,
    limits: PacketLimits,
    packet: BytesMut,
    consumed: usize,
    min_len: usize,
    target_len: Option<usize>,
    scan_for_terminator: bool,
    end_of_stream: bool,
    pattern_state: usize,
}

impl Framer {
    pub fn new(rules: Arc<FramingRules>) -> Self {
        let limits = rules.default_limits();
        Self {
            rules,
            limits,
            packet: BytesMut::with_capacity(limits.max().min(INITIAL_CAPACITY)),
            consumed: 0,
            min_len: limits.min(),
            target_len: None,
            scan_for_terminator: false,
            end_of_stream: false,
            pattern_state: 0,
        }
    }

    pub fn rules(&self) -> &FramingRules {
        &self.rules
    }

    pub fn limits(&self) -> PacketLimits {
        self.limits
    }

    /// Starts a new packet with the given limits, discarding any partial data.
    pub fn begin(&mut self, limits: PacketLimits) {
        self.limits = limits;
        self.packet.clear();
        self.packet.reserve(limits.max().min(INITIAL_CAPACITY));
        self.reset();
    }

    fn reset(&mut self) {
        self.consumed = 0;
        self.min_len = self.limits.min();
        self.target_len = None;
        self.scan_for_terminator = false;
        self.end_of_stream = false;
        self.pattern_state = 0;
    }

    /// `true` once any byte has been consumed for the current packet,
    /// including bytes that were filtered out.
    pub fn has_started(&self) -> bool {
        self.consumed > 0
    }

    /// Length of the packet collected so far.
    pub fn len(&self) -> usize {
        self.packet.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packet.is_empty()
    }

    /// Bytes collected so far for the current packet
    pub fn partial(&self) -> &[u8] {
        &self.packet
    }

    /// `true` once the negotiator has asked for the packet to run to end of input.
    pub fn accepts_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Hands back whatever has been collected and resets the packet state.
    pub fn take_partial(&mut self) -> Bytes {
        self.complete()
    }

    fn complete(&mut self) -> Bytes {
        let packet = self.packet.split().freeze();
        self.reset();
        packet
    }

    /// Consumes bytes from `src` until a packet completes or `src` is empty.
    pub fn decode<B, N>(&mut self, src: &mut B, negotiator: &mut N) -> Option<Bytes>
    where
        B: Buf,
        N: LengthNegotiator + ?Sized,
    {
        while src.has_remaining() {
            if let Some(packet) = self.push(src.get_u8(), negotiator) {
                return Some(packet);
            }
        }
        None
    }

    /// Feeds a single byte. Returns the packet when this byte completes it.
    pub fn push<N>(&mut self, byte: u8, negotiator: &mut N) -> Option<Bytes>
    where
        N: LengthNegotiator + ?Sized,
    {
        self.consumed += 1;
        if self.rules.is_text() {
            self.push_text(byte)
        } else {
            self.push_binary(byte, negotiator)
        }
    }

    fn push_text(&mut self, byte: u8) -> Option<Bytes> {
        if self.rules.is_line_terminator(byte) {
            return Some(self.complete());
        }
        if self.rules.is_ignored(byte) {
            return None;
        }
        if self.rules.is_backspace(byte) {
            let len = self.packet.len();
            self.packet.truncate(len.saturating_sub(1));
            return None;
        }
        if byte < b' ' && byte != b'\t' {
            return None;
        }
        self.packet.put_u8(byte);
        if self.packet.len() >= self.limits.max() {
            return Some(self.complete());
        }
        None
    }

    fn push_binary<N>(&mut self, byte: u8, negotiator: &mut N) -> Option<Bytes>
    where
        N: LengthNegotiator + ?Sized,
    {
        if self.scan_for_terminator {
            if self.rules.is_line_terminator(byte) {
                return Some(self.complete());
            }
            if self.rules.is_ignored(byte) {
                return None;
            }
        }
        self.packet.put_u8(byte);
        let len = self.packet.len();
        let max = self.limits.max();
        if len >= max {
            return Some(self.complete());
        }

        if let Some(pattern) = self.rules.pattern() {
            self.pattern_state = pattern.advance(self.pattern_state, byte);
            if self.pattern_state == pattern.len() {
                return Some(self.complete());
            }
            return None;
        }

        match self.target_len {
            Some(target) if len >= target => Some(self.complete()),
            Some(_) => None,
            None if len >= self.min_len => self.negotiate(byte, negotiator),
            None => None,
        }
    }

    fn negotiate<N>(&mut self, last: u8, negotiator: &mut N) -> Option<Bytes>
    where
        N: LengthNegotiator + ?Sized,
    {
        let len = self.packet.len();
        let max = self.limits.max();
        match negotiator.actual_packet_length(&self.packet) {
            PacketLength::LineTerminator => {
                if self.rules.is_line_terminator(last) {
                    self.packet.truncate(len - 1);
                    return Some(self.complete());
                }
                self.target_len = Some(max);
                self.scan_for_terminator = true;
            }
            PacketLength::EndOfStream => {
                self.target_len = Some(max);
                self.end_of_stream = true;
            }
            PacketLength::Exact(n) | PacketLength::Incremental(n) if n == len => {
                return Some(self.complete());
            }
            PacketLength::Exact(n) | PacketLength::Incremental(n) if n > max => {
                warn!(requested = n, max, "Packet length exceeds maximum, clamping");
                self.target_len = Some(max);
            }
            PacketLength::Exact(n) if n < len => {
                return Some(self.complete());
            }
            PacketLength::Exact(n) => self.target_len = Some(n),
            PacketLength::Incremental(n) => self.min_len = n,
        }
        None
    }
}
