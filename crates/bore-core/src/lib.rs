//! bore-core: Shared protocol library for the bore reverse tunnel.
//!
//! Provides the CBOR control messages and their length-prefixed framing,
//! QUIC channel helpers, and the bidirectional splicer used on both ends
//! of a tunnel.

pub mod codec;
pub mod error;
pub mod messages;
pub mod splice;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, frame_encode, read_frame, write_frame, MAX_FRAME_LEN};
pub use error::{BoreError, BoreResult};
pub use messages::{
    ChannelOpen, GlobalReply, GlobalRequest, Greeting, Request, ALPN, PROTOCOL_VERSION,
};
pub use splice::{splice, SpliceStats};
pub use transport::{accept_channel, open_channel, transport_config, TunnelStream};
