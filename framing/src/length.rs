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

//! Packet length negotiation.
//!
//! Binary framing asks a [`LengthNegotiator`] how long the packet under
//! construction should be once the current minimum has been collected. The
//! answer is a [`PacketLength`]: an exact size, an interim size after which
//! the question is asked again, or one of the two open-ended sentinels.

/// Bit marking a legacy integer length as incremental.
pub const INCREMENTAL_FLAG: i32 = 0x0001_0000;

/// Mask extracting the byte count from an incremental legacy length.
const INCREMENTAL_MASK: i32 = 0x0000_FFFF;

/// Answer to "how long is this packet?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketLength {
    /// The packet is exactly this many bytes long.
    Exact(usize),
    /// Collect this many bytes, then ask again.
    Incremental(usize),
    /// The packet ends at the next line terminator.
    LineTerminator,
    /// The packet runs until the maximum length or end of input.
    EndOfStream,
}

impl PacketLength {
    /// Decodes the signed integer encoding used by older device handlers.
    ///
    /// `-1` selects [`PacketLength::LineTerminator`], anything below that
    /// [`PacketLength::EndOfStream`]. Values carrying [`INCREMENTAL_FLAG`] are
    /// incremental, with the low 16 bits holding the byte count.
    pub fn from_legacy(value: i32) -> Self {
        match value {
            -1 => PacketLength::LineTerminator,
            v if v < -1 => PacketLength::EndOfStream,
            v if v >= INCREMENTAL_FLAG => PacketLength::Incremental((v & INCREMENTAL_MASK) as usize),
            v => PacketLength::Exact(v as usize),
        }
    }

    /// Returns `true` for a definite size.
    pub fn is_exact(&self) -> bool {
        matches!(self, PacketLength::Exact(_))
    }
}

impl std::fmt::Display for PacketLength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketLength::Exact(n) => write!(f, "exact({})", n),
            PacketLength::Incremental(n) => write!(f, "incremental({})", n),
            PacketLength::LineTerminator => write!(f, "line-terminator"),
            PacketLength::EndOfStream => write!(f, "end-of-stream"),
        }
    }
}

/// Source of packet length decisions for binary framing.
pub trait LengthNegotiator {
    /// Inspects the bytes collected so far and decides the packet length.
    fn actual_packet_length(&mut self, packet: &[u8]) -> PacketLength;
}

impl<F> LengthNegotiator for F
where
    F: FnMut(&[u8]) -> PacketLength,
{
    fn actual_packet_length(&mut self, packet: &[u8]) -> PacketLength {
        self(packet)
    }
}

/// Negotiator that accepts whatever has been collected as the full packet.
///
/// Combined with the minimum length this yields fixed-size records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedLength;

impl LengthNegotiator for FixedLength {
    fn actual_packet_length(&mut self, packet: &[u8]) -> PacketLength {
        PacketLength::Exact(packet.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_legacy_sentinels() {
        assert_eq!(PacketLength::from_legacy(-1), PacketLength::LineTerminator);
        assert_eq!(PacketLength::from_legacy(-2), PacketLength::EndOfStream);
        assert_eq!(PacketLength::from_legacy(i32::MIN), PacketLength::EndOfStream);
    }

    #[test]
    fn test_from_legacy_sizes() {
        assert_eq!(PacketLength::from_legacy(0), PacketLength::Exact(0));
        assert_eq!(PacketLength::from_legacy(12), PacketLength::Exact(12));
        assert_eq!(
            PacketLength::from_legacy(INCREMENTAL_FLAG | 9),
            PacketLength::Incremental(9)
        );
    }

    #[test]
    fn test_fixed_length() {
        let mut negotiator = FixedLength;
        assert_eq!(negotiator.actual_packet_length(b"abcd"), PacketLength::Exact(4));
        assert!(PacketLength::Exact(1).is_exact());
        assert!(!PacketLength::LineTerminator.is_exact());
    }

    #[test]
    fn test_closure_negotiator() {
        let mut calls = 0;
        let mut negotiator = |packet: &[u8]| {
            calls += 1;
            PacketLength::Exact(packet[0] as usize)
        };
        assert_eq!(negotiator.actual_packet_length(&[5, 0]), PacketLength::Exact(5));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(PacketLength::Incremental(4).to_string(), "incremental(4)");
        assert_eq!(PacketLength::EndOfStream.to_string(), "end-of-stream");
    }
}
