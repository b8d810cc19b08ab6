use std::io;

use multiaddr::Multiaddr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] io::Error),

    #[error("No transport to handle addr: {0}")]
    TransportNotSupported(Multiaddr),

    #[error("A valid routing path to connect to the peer could not be found.")]
    NoRoute,

    #[error("All {} racing dials failed, last error: {}", .0.len(), DisplayLast(.0))]
    DialFailed(Vec<io::Error>),
}

struct DisplayLast<'a>(&'a [io::Error]);

impl std::fmt::Display for DisplayLast<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.last() {
            Some(err) => write!(f, "{}", err),
            None => write!(f, "none"),
        }
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::IoError(io_error) => io_error,
            Error::TransportNotSupported(_) => io::Error::new(io::ErrorKind::Unsupported, value),
            Error::NoRoute | Error::DialFailed(_) => {
                io::Error::new(io::ErrorKind::ConnectionRefused, value)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
