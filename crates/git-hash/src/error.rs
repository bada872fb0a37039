use crate::HashAlgorithm;

/// Errors produced by hash and OID operations.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("invalid hex character at position {position}: '{character}'")]
    InvalidHex { position: usize, character: char },

    #[error("invalid hex length: expected {expected}, got {actual}")]
    InvalidHexLength { expected: usize, actual: usize },

    #[error("invalid hash length: expected {expected} bytes, got {actual}")]
    InvalidHashLength { expected: usize, actual: usize },

    #[error("ambiguous object name: prefix '{prefix}' matches multiple objects")]
    AmbiguousPrefix { prefix: String },

    #[error("SHA-1 collision detected")]
    Sha1Collision,

    /// Two OIDs of different hash algorithms were compared. Ordering between
    /// a HASH-160 and a HASH-256 object identifier is undefined; callers must
    /// resolve the mismatch rather than receive an arbitrary ordering.
    #[error("cannot compare OIDs of different hash algorithms: {a} vs {b}")]
    MismatchedAlgorithm { a: HashAlgorithm, b: HashAlgorithm },
}
