//! Binary wire protocol: framing, requests, responses, codec.
//!
//! Every key/value operation travels as a 24-byte header followed by
//! extras, key, and value sections. Responses are matched back to their
//! requests purely by the opaque field; nothing else in the frame takes
//! part in correlation.

pub mod codec;
pub mod constants;
pub mod header;
pub mod request;
pub mod response;
pub mod subdoc;

pub use codec::KvCodec;
pub use header::{RequestHeader, ResponseHeader};
pub use request::{next_opaque, DurabilityLevel, KvRequest};
pub use response::{KvResponse, SubdocField};
pub use subdoc::{LookupInSpec, MutateInSpec};
