//! Codec trait and implementations for message payloads.
//!
//! A "codec" (coder/decoder) converts between Rust values and the raw bytes
//! carried in a broker message body. The publisher and the consumer engine
//! only depend on the [`Codec`] trait, so the wire format is chosen at the
//! call site and the engine never embeds per-type logic.
//!
//! Two formats ship with the crate:
//! - [`JsonCodec`] — human-readable, tolerant of additive field changes.
//! - [`CborCodec`] — compact and self-describing; the decode-time type must
//!   structurally match the encode-time type.

use serde::{Serialize, de::DeserializeOwned};

use crate::CodecError;

/// A codec that encodes Rust values to payload bytes and decodes them back.
///
/// ## Trait bounds
///
/// - `Send + Sync` → a codec is moved into the subscription worker task,
///   which Tokio may run on any thread.
/// - `'static` → the codec owns everything it needs; it lives as long as
///   the subscription does.
///
/// The methods are generic over the payload type, so a single codec value
/// serves every message shape in the application.
pub trait Codec: Send + Sync + 'static {
    /// MIME type tag stamped on published messages.
    fn content_type(&self) -> &'static str;

    /// Serializes a value into payload bytes.
    ///
    /// # Errors
    /// Returns [`CodecError::Encode`] if the value can't be represented in
    /// this format.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Deserializes payload bytes into a value.
    ///
    /// # Errors
    /// Returns [`CodecError::MalformedPayload`] if the bytes are malformed,
    /// truncated, followed by trailing data, or don't match `T`.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// Unknown fields are ignored on decode, so a producer may add fields
/// without breaking older consumers. Missing fields are an error unless
/// the target type gives them a default (`#[serde(default)]`).
///
/// A body must hold exactly one JSON value. Whitespace around it is
/// allowed, anything else after it is rejected.
///
/// ## Example
///
/// ```rust
/// use peril_codec::{Codec, JsonCodec};
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(&vec![1u32, 2, 3]).unwrap();
/// assert_eq!(bytes, b"[1,2,3]");
///
/// let decoded: Vec<u32> = codec.decode(&bytes).unwrap();
/// assert_eq!(decoded, vec![1, 2, 3]);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        crate::CONTENT_TYPE_JSON
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode {
            content_type: crate::CONTENT_TYPE_JSON,
            source: Box::new(e),
        })
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        // `from_slice` also rejects trailing non-whitespace after the value.
        serde_json::from_slice(data).map_err(|e| CodecError::MalformedPayload {
            content_type: crate::CONTENT_TYPE_JSON,
            source: Box::new(e),
        })
    }
}

// ---------------------------------------------------------------------------
// CborCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses CBOR (via `ciborium`).
///
/// CBOR is a self-describing binary format: every item carries its own
/// type tag, so a payload decoded into the wrong shape fails instead of
/// being silently misread.
///
/// ## Framing
///
/// A CBOR stream may legally hold several items back to back. A broker
/// message body is one value, so `decode` reads exactly one item and
/// rejects the body if any bytes remain. Structs are encoded as maps keyed
/// by field name, which keeps payloads readable with generic CBOR tools but
/// means renamed fields break older consumers.
///
/// ## Example
///
/// ```rust
/// use peril_codec::{CborCodec, Codec};
///
/// let bytes = CborCodec.encode(&(7u8, "lincoln")).unwrap();
/// let (turn, name): (u8, String) = CborCodec.decode(&bytes).unwrap();
/// assert_eq!((turn, name.as_str()), (7, "lincoln"));
///
/// let mut padded = bytes.clone();
/// padded.push(0);
/// assert!(CborCodec.decode::<(u8, String)>(&padded).is_err());
/// ```
#[cfg(feature = "cbor")]
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

#[cfg(feature = "cbor")]
impl Codec for CborCodec {
    fn content_type(&self) -> &'static str {
        crate::CONTENT_TYPE_CBOR
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf).map_err(|e| CodecError::Encode {
            content_type: crate::CONTENT_TYPE_CBOR,
            source: Box::new(e),
        })?;
        Ok(buf)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        let mut reader = data;
        let value = ciborium::de::from_reader(&mut reader).map_err(|e| {
            CodecError::MalformedPayload {
                content_type: crate::CONTENT_TYPE_CBOR,
                source: Box::new(e),
            }
        })?;

        // One message body carries exactly one item.
        if !reader.is_empty() {
            return Err(CodecError::MalformedPayload {
                content_type: crate::CONTENT_TYPE_CBOR,
                source: format!("{} trailing bytes after encoded value", reader.len()).into(),
            });
        }
        Ok(value)
    }
}
