//! meshbus wire protocol — envelope framing and peer connections.
//!
//! Envelopes travel over direct TCP links as `[u16 BE length][body]` frames,
//! where the body is a positional MessagePack encoding of the envelope
//! fields.
//!
//! ## Architecture
//!
//! - **codec**: Envelope encode/decode and the 2-byte frame header
//! - **frame**: Async frame reading/writing over TCP halves
//! - **payload**: Pluggable registry of per-message-type payload codecs
//! - **remote**: `RemoteMember`, the per-peer connection manager
//! - **listener**: Accepts inbound connections and hands envelopes to an
//!   `EnvelopeHandler`

pub mod codec;
pub mod error;
pub mod frame;
pub mod listener;
pub mod payload;
pub mod remote;

pub use codec::{decode_envelope, encode_envelope};
pub use error::WireError;
pub use listener::{EnvelopeHandler, EnvelopeListener};
pub use payload::CodecRegistry;
pub use remote::{ConnectionState, RemoteMember};
