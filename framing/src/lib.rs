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

//! # Trackwire Packet Framing
//!
//! Splits the byte stream of a device connection into application packets.
//!
//! Devices speak two broad dialects:
//!
//! - **Text**: line oriented. A configured terminator byte ends the packet,
//!   ignored bytes (by default `\r`) are dropped, other control bytes except
//!   tab are stripped and backspace can edit the line when enabled.
//! - **Binary**: raw bytes. The packet ends on a multi-byte terminator
//!   pattern, or on a length decided by a [`LengthNegotiator`] once the
//!   minimum number of bytes has arrived.
//!
//! The [`Framer`] is the byte-at-a-time state machine used by the session
//! engine. [`PacketCodec`] wraps it as a `tokio_util` [`Decoder`] for callers
//! that want to drive framing through `FramedRead`.
//!
//! [`Decoder`]: tokio_util::codec::Decoder

mod codec;
mod framer;
mod length;
mod result;
mod rules;

pub use codec::PacketCodec;
pub use framer::Framer;
pub use length::{FixedLength, INCREMENTAL_FLAG, LengthNegotiator, PacketLength};
pub use result::{FramingError, FramingResult};
pub use rules::{
    BACKSPACE, DEFAULT_BINARY_MAX_LEN, DEFAULT_TEXT_MAX_LEN, FramingMode, FramingRules,
    PacketLimits, TerminatorPattern,
};
