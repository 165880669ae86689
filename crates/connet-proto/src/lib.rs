//! Wire protocol: framing, the stable error taxonomy, and the typed
//! request/response messages for each stream role.
//!
//! Every control and data stream carries a sequence of framed messages:
//! a 4-byte big-endian length followed by a bincode-encoded body. For each
//! stream role exactly one request type and one response type are legal;
//! anything else is a fatal protocol error that closes the stream with a
//! typed [`Error`].

pub mod client;
pub mod data;
mod error;
mod frame;
pub mod relay;
pub mod shared;

pub use error::{Error, ErrorCode};
pub use frame::{read_message, write_message, WireError, MAX_FRAME_LEN};

/// ALPN for client ↔ control connections.
pub const ALPN_CLIENT: &[u8] = b"connet";

/// ALPN for relay ↔ control connections.
pub const ALPN_RELAYS: &[u8] = b"connet-relays";

/// ALPN for the data plane: client ↔ client and client ↔ relay.
pub const ALPN_DIRECT: &[u8] = b"connet-direct";

/// Protocol schema version; bumped when a message layout changes.
pub const PROTOCOL_VERSION: u32 = 1;
