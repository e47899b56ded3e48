//! Delimiter-based record splitting over a chunked byte stream.
//!
//! TCP delivers bytes in arbitrary chunks, so a record may span several
//! reads and one read may carry several records. The splitter keeps the
//! unterminated tail between calls and only ever emits text that was
//! followed by a delimiter.
//!
//! ```text
//! push("hel")         -> []                 tail: "hel"
//! push("lo\r\nwor")   -> ["hello"]          tail: "wor"
//! push("ld\r\n")      -> ["world"]          tail: ""
//! ```
//!
//! Decoding is incremental as well: a multi-byte UTF-8 character cut by a
//! chunk boundary is carried over and completed by the next chunk.

use crate::error::{DecodeError, SplitError};
use clap::ValueEnum;
use serde::Deserialize;
use std::borrow::Cow;

/// Length of every supported delimiter.
const DELIMITER_LEN: usize = 2;

/// Default cap on an unterminated record.
pub const DEFAULT_MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Two-byte sequence that terminates a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Delimiter {
    /// `\r\n`
    #[default]
    #[value(name = "crlf")]
    CrLf,
    /// `\n\r`
    #[value(name = "lfcr")]
    LfCr,
}

impl Delimiter {
    pub fn as_bytes(self) -> [u8; DELIMITER_LEN] {
        match self {
            Delimiter::CrLf => *b"\r\n",
            Delimiter::LfCr => *b"\n\r",
        }
    }
}

/// Per-connection splitting state.
#[derive(Debug)]
pub struct RecordSplitter {
    delimiter: Delimiter,
    max_record_size: usize,
    /// Decoded text after the last emitted delimiter.
    tail: String,
    /// Incomplete UTF-8 sequence at the end of the previous chunk (at most 3 bytes).
    carry: Vec<u8>,
}

impl RecordSplitter {
    pub fn new(delimiter: Delimiter, max_record_size: usize) -> Self {
        Self {
            delimiter,
            max_record_size,
            tail: String::new(),
            carry: Vec::new(),
        }
    }

    /// Feed one chunk, calling `emit` for every record it completes, in order.
    ///
    /// On `DecodeError` the chunk is dropped and the tail is left as it was,
    /// so the splitter stays usable. On `RecordTooLarge` every record
    /// completed by this chunk has already been emitted.
    pub fn push<F>(&mut self, chunk: &[u8], mut emit: F) -> Result<(), SplitError>
    where
        F: FnMut(String),
    {
        // A delimiter may straddle the old tail and the new chunk
        let scan_from = self.tail.len().saturating_sub(DELIMITER_LEN - 1);

        self.decode(chunk)?;

        let needle = self.delimiter.as_bytes();
        let mut consumed = 0;
        let mut from = scan_from;
        while let Some(pos) = find_delimiter(&self.tail.as_bytes()[from..], needle) {
            let end = from + pos;
            emit(self.tail[consumed..end].to_string());
            consumed = end + DELIMITER_LEN;
            from = consumed;
        }
        self.tail.drain(..consumed);

        if self.tail.len() > self.max_record_size {
            return Err(SplitError::RecordTooLarge {
                limit: self.max_record_size,
            });
        }

        Ok(())
    }

    /// The unterminated text awaiting a delimiter.
    pub fn residual(&self) -> &str {
        &self.tail
    }

    /// Discard everything still buffered, returning how many bytes were dropped.
    pub fn finish(&mut self) -> usize {
        let discarded = self.tail.len() + self.carry.len();
        self.tail.clear();
        self.carry.clear();
        discarded
    }

    /// Append the valid text of `carry + chunk` to the tail.
    fn decode(&mut self, chunk: &[u8]) -> Result<(), DecodeError> {
        let input: Cow<'_, [u8]> = if self.carry.is_empty() {
            Cow::Borrowed(chunk)
        } else {
            let mut joined = std::mem::take(&mut self.carry);
            joined.extend_from_slice(chunk);
            Cow::Owned(joined)
        };

        match std::str::from_utf8(&input) {
            Ok(text) => {
                self.tail.push_str(text);
                Ok(())
            }
            // Input ends in the middle of a character
            Err(e) if e.error_len().is_none() => {
                let (valid, partial) = input.split_at(e.valid_up_to());
                let text = std::str::from_utf8(valid).map_err(|_| DecodeError {
                    valid_up_to: e.valid_up_to(),
                    dropped: input.len(),
                })?;
                self.tail.push_str(text);
                self.carry = partial.to_vec();
                Ok(())
            }
            Err(e) => Err(DecodeError {
                valid_up_to: e.valid_up_to(),
                dropped: input.len(),
            }),
        }
    }
}

/// Find `needle` in `buffer`, returning the position of its first byte.
fn find_delimiter(buffer: &[u8], needle: [u8; DELIMITER_LEN]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1))
        .find(|&i| buffer[i] == needle[0] && buffer[i + 1] == needle[1])
}
