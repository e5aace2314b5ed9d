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

//! Static framing configuration shared by every packet on a listener.

use crate::result::{FramingError, FramingResult};
use bytes::Bytes;

/// Default maximum packet length in text mode.
pub const DEFAULT_TEXT_MAX_LEN: usize = 2048;

/// Default maximum packet length in binary mode.
pub const DEFAULT_BINARY_MAX_LEN: usize = 1024;

/// ASCII backspace.
pub const BACKSPACE: u8 = 0x08;

/// How incoming bytes are grouped into packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    /// Line oriented input with control character filtering.
    Text,
    /// Raw bytes sized by negotiation or a terminator pattern.
    Binary,
}

/// Multi-byte terminator matched with a precomputed failure table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminatorPattern {
    bytes: Bytes,
    failure: Vec<usize>,
}

impl TerminatorPattern {
    /// Builds the matcher. Returns `None` for an empty pattern.
    pub fn new(pattern: impl Into<Bytes>) -> Option<Self> {
        let bytes = pattern.into();
        if bytes.is_empty() {
            return None;
        }
        let mut failure = vec![0; bytes.len()];
        let mut k = 0;
        for i in 1..bytes.len() {
            while k > 0 && bytes[i] != bytes[k] {
                k = failure[k - 1];
            }
            if bytes[i] == bytes[k] {
                k += 1;
            }
            failure[i] = k;
        }
        Some(Self { bytes, failure })
    }

    /// Pattern bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Pattern length.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always `false`; empty patterns are never constructed.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Advances the match state by one byte.
    ///
    /// `state` is the number of pattern bytes currently matched and must be
    /// below [`len`](Self::len). A return value equal to `len` is a full match.
    pub fn advance(&self, state: usize, byte: u8) -> usize {
        let mut state = state;
        loop {
            if self.bytes[state] == byte {
                return state + 1;
            }
            if state == 0 {
                return 0;
            }
            state = self.failure[state - 1];
        }
    }
}

/// Per-listener framing rules.
#[derive(Debug, Clone)]
pub struct FramingRules {
    mode: FramingMode,
    line_terminators: Vec<u8>,
    ignore_chars: Vec<u8>,
    backspace_chars: Vec<u8>,
    backspace_enabled: bool,
    pattern: Option<TerminatorPattern>,
}

impl FramingRules {
    /// Text framing: `\n` terminates, `\r` is ignored, backspace disabled.
    pub fn text() -> Self {
        Self {
            mode: FramingMode::Text,
            line_terminators: vec![b'\n'],
            ignore_chars: vec![b'\r'],
            backspace_chars: vec![BACKSPACE],
            backspace_enabled: false,
            pattern: None,
        }
    }

    /// Binary framing with no ignored bytes.
    pub fn binary() -> Self {
        Self {
            mode: FramingMode::Binary,
            ignore_chars: Vec::new(),
            ..Self::text()
        }
    }

    /// Replaces the line terminator set.
    pub fn with_line_terminators(mut self, terminators: &[u8]) -> Self {
        self.line_terminators = terminators.to_vec();
        self
    }

    /// Replaces the set of bytes dropped on receipt.
    pub fn with_ignore_chars(mut self, ignore: &[u8]) -> Self {
        self.ignore_chars = ignore.to_vec();
        self
    }

    /// Replaces the set of backspace bytes.
    pub fn with_backspace_chars(mut self, backspace: &[u8]) -> Self {
        self.backspace_chars = backspace.to_vec();
        self
    }

    /// Enables backspace editing. Only meaningful in text mode.
    pub fn with_backspace_enabled(mut self, enabled: bool) -> Self {
        self.backspace_enabled = enabled;
        self
    }

    /// Sets a terminator pattern. A non-empty pattern forces binary mode.
    pub fn with_terminator_pattern(mut self, pattern: impl Into<Bytes>) -> Self {
        self.pattern = TerminatorPattern::new(pattern);
        if self.pattern.is_some() {
            self.mode = FramingMode::Binary;
        }
        self
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    pub fn is_text(&self) -> bool {
        self.mode == FramingMode::Text
    }

    pub fn pattern(&self) -> Option<&TerminatorPattern> {
        self.pattern.as_ref()
    }

    pub fn line_terminators(&self) -> &[u8] {
        &self.line_terminators
    }

    pub fn backspace_enabled(&self) -> bool {
        self.backspace_enabled
    }

    pub fn is_line_terminator(&self, byte: u8) -> bool {
        self.line_terminators.contains(&byte)
    }

    pub fn is_ignored(&self, byte: u8) -> bool {
        self.ignore_chars.contains(&byte)
    }

    /// `true` when backspace editing is enabled and `byte` is a backspace.
    pub fn is_backspace(&self, byte: u8) -> bool {
        self.backspace_enabled && self.backspace_chars.contains(&byte)
    }

    /// Default maximum packet length for the current mode.
    pub fn default_max_len(&self) -> usize {
        match self.mode {
            FramingMode::Text => DEFAULT_TEXT_MAX_LEN,
            FramingMode::Binary => DEFAULT_BINARY_MAX_LEN,
        }
    }

    /// Default limits for the current mode.
    ///
    /// Text packets may be a single byte; binary packets default to a
    /// minimum equal to the maximum.
    pub fn default_limits(&self) -> PacketLimits {
        let max = self.default_max_len();
        match self.mode {
            FramingMode::Text => PacketLimits { min: 1, max },
            FramingMode::Binary => PacketLimits { min: max, max },
        }
    }
}

impl Default for FramingRules {
    fn default() -> Self {
        Self::text()
    }
}

/// Minimum and maximum length of the next packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLimits {
    min: usize,
    max: usize,
}

impl PacketLimits {
    /// Builds limits, clamping `min` into `1..=max`.
    pub fn new(min: usize, max: usize) -> FramingResult<Self> {
        if max == 0 {
            return Err(FramingError::ZeroMaximum);
        }
        Ok(Self {
            min: min.clamp(1, max),
            max,
        })
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }
}
