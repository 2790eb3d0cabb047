//! Turning raw terminal bytes into chat text.
//!
//! Reads use fixed-size buffers that can split multi-byte UTF-8 characters.
//! The accumulator keeps the trailing incomplete bytes and prepends them to
//! the next read; the decoder then optionally strips terminal escape
//! sequences from the complete text.

use std::borrow::Cow;

/// A code point is at most 4 bytes.
const MAX_PARTIAL: usize = 4;

/// Buffers incomplete trailing UTF-8 bytes across successive reads.
#[derive(Debug, Default)]
pub struct Utf8Accumulator {
    partial: [u8; MAX_PARTIAL],
    partial_len: usize,
}

impl Utf8Accumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate raw bytes and return the complete text so far.
    ///
    /// Invalid bytes that cannot start a sequence are replaced with U+FFFD.
    pub fn accumulate<'a>(&mut self, data: &'a [u8]) -> Cow<'a, str> {
        if self.partial_len == 0 {
            if let Ok(s) = std::str::from_utf8(data) {
                return Cow::Borrowed(s);
            }
        }

        let mut combined = Vec::with_capacity(self.partial_len + data.len());
        combined.extend_from_slice(&self.partial[..self.partial_len]);
        combined.extend_from_slice(data);
        self.partial_len = 0;

        let mut text = String::with_capacity(combined.len());
        let mut rest = combined.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    if let Some(len) = e.error_len() {
                        text.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    } else {
                        // Only a truncated sequence at the very end gets here.
                        self.partial[..after.len()].copy_from_slice(after);
                        self.partial_len = after.len();
                        break;
                    }
                }
            }
        }
        Cow::Owned(text)
    }
}

/// Decodes one backend's byte stream into text chunks.
#[derive(Debug)]
pub struct OutputDecoder {
    utf8: Utf8Accumulator,
    strip_escapes: bool,
}

impl OutputDecoder {
    /// Create a decoder. Escape sequences are removed when `strip_escapes`
    /// is set, which is the case whenever a terminal is attached.
    #[must_use]
    pub fn new(strip_escapes: bool) -> Self {
        Self {
            utf8: Utf8Accumulator::new(),
            strip_escapes,
        }
    }

    /// Decode one read. Returns `None` when nothing printable is left.
    pub fn decode(&mut self, data: &[u8]) -> Option<String> {
        let text = self.utf8.accumulate(data);
        let text = if self.strip_escapes {
            strip_ansi_escapes::strip_str(text)
        } else {
            text.into_owned()
        };
        (!text.is_empty()).then_some(text)
    }
}
