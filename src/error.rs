use thiserror::Error;

/// Everything that can go wrong while diffing, applying, validating or healing.
#[derive(Debug, Error)]
pub enum Error {
    /// The input is not a well-formed patch, signature or wounds file:
    /// bad magic, out-of-order file index, missing sentinel.
    #[error("malformed patch: {0}")]
    MalformedPatch(String),

    /// The input is well-formed but uses something this build can't handle,
    /// such as an unknown compression algorithm.
    #[error("incompatible patch: {0}")]
    IncompatiblePatch(String),

    /// On-disk content does not match what the signature or container says.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("operation cancelled")]
    Cancelled,

    /// A vet hook refused the apply before anything was touched.
    #[error("apply vetoed: {0}")]
    Vetoed(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True for "file or directory not found" I/O errors.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedPatch(msg.into())
    }

    pub(crate) fn incompatible(msg: impl Into<String>) -> Self {
        Error::IncompatiblePatch(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::malformed("missing sentinel").to_string(),
            "malformed patch: missing sentinel"
        );
        assert_eq!(Error::Cancelled.to_string(), "operation cancelled");
    }

    #[test]
    fn test_cancelled_is_distinguished() {
        assert!(Error::Cancelled.is_cancelled());
        let io: Error = std::io::Error::new(std::io::ErrorKind::Interrupted, "boom").into();
        assert!(!io.is_cancelled());
    }

    #[test]
    fn test_not_found() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(err.is_not_found());
        assert!(!Error::Integrity("x".into()).is_not_found());
    }
}
