//! Error types for the wire protocol layer.

use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Errors raised while encoding requests or decoding responses.
///
/// Every variant is a caller-input or stream-integrity fault; none of them is
/// transient, so the execution engine never retries on a `ProtoError`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// Bin or operation name longer than the server accepts.
    #[error("bin name too long: {name:?} is {len} bytes (max 15)")]
    BinNameTooLong {
        /// The offending name.
        name: String,
        /// Its length in bytes.
        len: usize,
    },

    /// A write-type operation was placed in a read-only batch entry.
    #[error("write operation {op} not allowed in a read-only batch entry")]
    WriteInReadContext {
        /// Name of the rejected operation type.
        op: &'static str,
    },

    /// Message larger than the hard cap.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Requested or declared size.
        size: usize,
        /// The cap that was exceeded.
        max: usize,
    },

    /// The write pass produced a different number of bytes than the estimate pass.
    #[error("estimate/write drift: estimated {estimated} bytes, wrote {written}")]
    SizeMismatch {
        /// Bytes computed by the estimate pass.
        estimated: usize,
        /// Bytes produced by the write pass.
        written: usize,
    },

    /// The deflate stream could not be produced or consumed.
    #[error("compression error: {0}")]
    Compression(String),

    /// A proto or record header failed validation.
    #[error("invalid header: {reason}")]
    InvalidHeader {
        /// Description of the failure.
        reason: String,
    },

    /// Fewer bytes than a structure requires.
    #[error("truncated message: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// A value could not be decoded for its particle type.
    #[error("invalid value: {reason}")]
    InvalidValue {
        /// Description of the failure.
        reason: String,
    },
}

impl ProtoError {
    /// [`ProtoError::InvalidHeader`] with `reason`.
    pub fn header(reason: impl Into<String>) -> Self {
        ProtoError::InvalidHeader {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_bin_name() {
        let err = ProtoError::BinNameTooLong {
            name: "abcdefghijklmnop".to_string(),
            len: 16,
        };
        assert!(err.to_string().contains("16 bytes"));
    }

    #[test]
    fn test_display_size_mismatch() {
        let err = ProtoError::SizeMismatch {
            estimated: 100,
            written: 98,
        };
        assert_eq!(
            err.to_string(),
            "estimate/write drift: estimated 100 bytes, wrote 98"
        );
    }
}
