//! Core wire types and protocols for Shoal.

#![warn(missing_docs)]

pub mod error;
pub mod error_map;
pub mod protocol;
pub mod transcoder;

pub use error::{ShoalError, Status, Result};
pub use error_map::{ErrorAttributes, ErrorMap, RetryStrategy};
pub use protocol::{KvCodec, KvRequest, KvResponse};
pub use transcoder::{JsonTranscoder, RawBinaryTranscoder, Transcoder};
