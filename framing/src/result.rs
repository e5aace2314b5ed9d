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

/// Result type for framing operations.
pub type FramingResult<T> = Result<T, FramingError>;

/// Errors raised while configuring a framer or decoding a byte stream.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// Packet limits were built with a zero maximum.
    #[error("maximum packet length must be greater than zero")]
    ZeroMaximum,

    /// A stream-oriented source ended part way through a packet.
    #[error("stream ended {len} bytes into a packet")]
    Truncated {
        /// Bytes accumulated when the stream ended
        len: usize,
    },

    /// I/O failure reported by the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    /// Returns `true` when the stream ended mid-packet.
    pub fn is_truncation(&self) -> bool {
        matches!(self, FramingError::Truncated { .. })
    }
}
