use thiserror::Error;

pub type TcfsResult<T> = Result<T, TcfsError>;

#[derive(Debug, Error)]
pub enum TcfsError {
    /// Malformed input, wrong sizes, misuse of a handle, or a cipher failure
    /// that is not attributable to tampering.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// A failed authentication check: chunk tag, header HMAC or root tag.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Operation issued in the wrong lifecycle state (not open, not
    /// initialized with a share key, or already closed).
    #[error("invalid state: {0}")]
    State(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TcfsError {
    /// True if the error signals tampering or silent corruption of ciphertext.
    pub fn is_integrity(&self) -> bool {
        matches!(self, TcfsError::Integrity(_))
    }
}

impl From<TcfsError> for std::io::Error {
    fn from(err: TcfsError) -> Self {
        match err {
            TcfsError::Io(e) => e,
            TcfsError::Integrity(_) => std::io::Error::new(std::io::ErrorKind::InvalidData, err),
            TcfsError::State(_) | TcfsError::Encryption(_) | TcfsError::Config(_) => {
                std::io::Error::other(err)
            }
        }
    }
}
