//! Wire protocol for Porthole tunnel communication.
//!
//! The tunnel carries JSON-encoded [`Frame`] messages over one persistent
//! duplex connection. Body payloads travel as base64 chunks inside `data`
//! frames, correlated by exchange id.

mod frame;

pub use frame::{
    decode_chunk, encode_chunk, unix_timestamp_ms, Frame, ProtocolError,
};
