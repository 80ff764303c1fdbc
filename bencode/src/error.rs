use std::fmt::Display;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors specific to bencoding, on top of those serde's data model requires.
#[derive(Debug, thiserror::Error)]
pub enum Error {

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Attempted to deserialize into an incompatible Rust type.
    #[error("invalid type: {0}")]
    InvalidType(String),

    /// Type of token was expected but a different one was found.
    #[error("invalid token: expected {expected}, found {found}")]
    InvalidToken {
        expected: String,
        found: String,
    },

    #[error("map serialization error: {0}")]
    MapSerializationOrder(String),

    /// Dictionary keys were not in non-decreasing lexicographical order and
    /// the decoder was not constructed in tolerant mode.
    #[error("dictionary keys out of order: {0:?} found after {1:?}")]
    UnsortedKeys(Vec<u8>, Vec<u8>),

    /// Dictionary contained the same key twice.
    #[error("duplicate dictionary key: {0:?}")]
    DuplicateKey(Vec<u8>),

    /// List/dict nesting exceeded the configured maximum depth.
    #[error("nesting depth exceeded limit of {0}")]
    NestingTooDeep(usize),

    /// A requested top-level dictionary key was not present.
    #[error("key not found: {0:?}")]
    KeyNotFound(Vec<u8>),

    #[error("{0}")]
    Custom(String),

    #[error("unexpected end of input")]
    EOF,

}

impl serde::ser::Error for Error {
    fn custom<T>(msg: T) -> Self where T: Display {
        Error::Custom(msg.to_string())
    }
}

impl serde::de::Error for Error {
    fn custom<T>(msg: T) -> Self where T: Display {
        Error::Custom(msg.to_string())
    }
}
