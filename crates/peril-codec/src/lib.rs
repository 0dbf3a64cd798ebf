//! Payload codecs for Peril pub/sub.
//!
//! This crate decides how typed values become message bodies and back:
//!
//! - **Codec** ([`Codec`] trait) — the encode/decode contract plus the
//!   content-type tag stamped on every published message.
//! - **Implementations** ([`JsonCodec`], [`CborCodec`]) — a structured text
//!   format and a self-describing binary format. Either one can be picked
//!   per publish or per subscription.
//! - **Errors** ([`CodecError`]) — what can go wrong while encoding or
//!   decoding.
//!
//! # Architecture
//!
//! Codecs know nothing about brokers, channels, or acknowledgements. They
//! are pure transformations the publisher and the consumer engine call:
//!
//! ```text
//! value → Codec::encode → bytes → broker → bytes → Codec::decode → value
//! ```

// ---------------------------------------------------------------------------
// Module declarations
// ---------------------------------------------------------------------------

mod codec;
mod error;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

#[cfg(feature = "cbor")]
pub use codec::CborCodec;
pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::CodecError;

/// Content type stamped on messages encoded by [`JsonCodec`].
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Content type stamped on messages encoded by [`CborCodec`].
pub const CONTENT_TYPE_CBOR: &str = "application/cbor";
