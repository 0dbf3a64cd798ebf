//! Error types for the codec layer.
//!
//! Each Peril crate defines its own error enum. A `CodecError` always means
//! the problem is in turning values into bytes or bytes into values, never
//! in the broker or the subscription machinery.

/// Boxed source error, so every codec can report through the same enum.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while encoding or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed (turning a Rust value into bytes).
    ///
    /// The publisher returns this before contacting the broker.
    #[error("encode failed ({content_type}): {source}")]
    Encode {
        /// Content type of the codec that failed.
        content_type: &'static str,
        /// The underlying serializer error.
        #[source]
        source: BoxError,
    },

    /// The bytes could not be decoded into the requested type.
    ///
    /// Covers syntax errors, type or structure mismatches, truncated input
    /// and trailing bytes. The consumer engine discards such messages
    /// without requeueing them.
    #[error("malformed payload ({content_type}): {source}")]
    MalformedPayload {
        /// Content type of the codec that rejected the payload.
        content_type: &'static str,
        /// The underlying deserializer error.
        #[source]
        source: BoxError,
    },
}

impl CodecError {
    /// Returns `true` if this is a decode-side [`CodecError::MalformedPayload`].
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedPayload { .. })
    }

    /// Content type of the codec that produced this error.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Encode { content_type, .. }
            | Self::MalformedPayload { content_type, .. } => content_type,
        }
    }
}
