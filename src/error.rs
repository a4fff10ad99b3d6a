//! Error types for the `slabhash` crate.

/// Errors returned by hash map construction, batch operations and persistence.
///
/// Capacity exhaustion is not an error: `insert` and `activate` report keys that could
/// not be given a slot through their output mask.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The map was constructed with an invalid key or value layout.
    ///
    /// No map is created when this error is returned.
    #[error("invalid hash map configuration: {0}")]
    Config(String),

    /// An input array does not have the shape the map expects.
    ///
    /// The call that returned this error did not modify the map.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// An input or output array has an unexpected dtype.
    #[error("dtype mismatch: {0}")]
    Dtype(String),

    /// An argument was out of range, e.g. a zero bucket count.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Device memory could not be allocated, or a device string was malformed.
    #[error("device error: {0}")]
    Device(String),

    /// Reading or writing a map container failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A map container could not be decoded.
    #[error("malformed hash map container: {0}")]
    Format(String),
}

/// A `Result` alias with [`Error`] as the default error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
