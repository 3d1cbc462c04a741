use std::error;
use std::fmt;

/// The possible errors returned by this library.
#[derive(Debug)]
pub enum Error {
    /// Error during communication.
    Comm(Box<dyn error::Error + Send + Sync>),

    /// The packet checksum didn't match while acknowledgments were
    /// disabled, so a retransmission can no longer be requested.
    Checksum { received: u8, computed: u8 },
}

impl Error {
    pub(crate) fn comm<E>(e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Error::Comm(e.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Comm(e) => write!(f, "communication error: {}", e),
            Error::Checksum { received, computed } => write!(
                f,
                "incorrect checksum, got {:02x}, expected {:02x}",
                received, computed
            ),
        }
    }
}

impl error::Error for Error {}
