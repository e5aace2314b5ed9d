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

use crate::framer::Framer;
use crate::length::LengthNegotiator;
use crate::result::FramingError;
use crate::rules::{FramingRules, PacketLimits};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio_util::codec::Decoder;

/// [`Decoder`] that splits a byte stream into packets.
///
/// Every packet uses the same limits. Use [`Framer`] directly when limits
/// must change between packets.
///
/// ```rust
/// use bytes::BytesMut;
/// use std::sync::Arc;
/// use tokio_util::codec::Decoder;
/// use trackwire_framing::{FixedLength, FramingRules, PacketCodec};
///
/// let mut codec = PacketCodec::new(Arc::new(FramingRules::text()), FixedLength);
/// let mut buffer = BytesMut::from(&b"PING\r\nPO"[..]);
/// assert_eq!(codec.decode(&mut buffer).unwrap().unwrap(), &b"PING"[..]);
/// assert!(codec.decode(&mut buffer).unwrap().is_none());
/// ```
#[derive(Debug)]
pub struct PacketCodec<N> {
    framer: Framer,
    negotiator: N,
    partial_on_eof: bool,
}

impl<N: LengthNegotiator> PacketCodec<N> {
    /// Codec for a stream transport using the rules' default limits.
    pub fn new(rules: Arc<FramingRules>, negotiator: N) -> Self {
        Self {
            framer: Framer::new(rules),
            negotiator,
            partial_on_eof: false,
        }
    }

    /// Replaces the packet limits.
    pub fn with_limits(mut self, limits: PacketLimits) -> Self {
        self.framer.begin(limits);
        self
    }

    /// Delivers a trailing partial packet at end of input instead of failing.
    ///
    /// Datagram payloads are complete units, so a short tail is still data.
    pub fn with_partial_on_eof(mut self, enabled: bool) -> Self {
        self.partial_on_eof = enabled;
        self
    }

    pub fn framer(&self) -> &Framer {
        &self.framer
    }

    pub fn negotiator_mut(&mut self) -> &mut N {
        &mut self.negotiator
    }
}

impl<N: LengthNegotiator> Decoder for PacketCodec<N> {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.framer.decode(src, &mut self.negotiator))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(packet) = self.decode(src)? {
            return Ok(Some(packet));
        }
        if self.framer.is_empty() {
            return Ok(None);
        }
        if self.partial_on_eof || self.framer.accepts_end_of_stream() {
            return Ok(Some(self.framer.take_partial()));
        }
        let len = self.framer.len();
        self.framer.take_partial();
        Err(FramingError::Truncated { len })
    }
}
