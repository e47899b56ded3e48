//! crlf-tap: a TCP listener that splits byte streams into records
//!
//! Every accepted connection is read chunk by chunk. Chunks are decoded as
//! UTF-8 and split on a fixed two-byte delimiter, with partial records
//! carried across reads, so record boundaries never depend on how the
//! transport happened to chunk the stream.
//!
//! Features:
//! - `\r\n` or `\n\r` delimiters
//! - Drop-or-close policy for undecodable chunks
//! - Pluggable output sink for records and lifecycle events
//! - Prompt, idempotent shutdown of the listener and every connection
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod error;
pub mod listener;
pub mod sink;
pub mod splitter;

pub use error::{BindError, ConnectionError, DecodeError, SplitError};
pub use listener::{Listener, ListenerOptions};
pub use sink::{ListenerEvent, RecordSink};
pub use splitter::{Delimiter, RecordSplitter};
