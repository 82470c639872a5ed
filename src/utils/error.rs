//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;

use tokio::sync::mpsc;
use tokio::time::error::Elapsed;

/// Customized error type for subasta (sadly, just a wrapped string).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SubastaError(String);

impl SubastaError {
    /// Constructs an error from anything printable.
    pub fn msg(msg: impl ToString) -> Self {
        SubastaError(msg.to_string())
    }
}

impl fmt::Display for SubastaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for SubastaError {}

impl From<io::Error> for SubastaError {
    fn from(e: io::Error) -> Self {
        SubastaError::msg(e)
    }
}

impl From<net::AddrParseError> for SubastaError {
    fn from(e: net::AddrParseError) -> Self {
        SubastaError::msg(e)
    }
}

impl From<num::ParseIntError> for SubastaError {
    fn from(e: num::ParseIntError) -> Self {
        SubastaError::msg(e)
    }
}

impl From<num::ParseFloatError> for SubastaError {
    fn from(e: num::ParseFloatError) -> Self {
        SubastaError::msg(e)
    }
}

impl From<toml::de::Error> for SubastaError {
    fn from(e: toml::de::Error) -> Self {
        SubastaError::msg(e)
    }
}

impl From<serde_json::Error> for SubastaError {
    fn from(e: serde_json::Error) -> Self {
        SubastaError::msg(e)
    }
}

impl From<Elapsed> for SubastaError {
    fn from(e: Elapsed) -> Self {
        SubastaError::msg(e)
    }
}

impl<T> From<mpsc::error::SendError<T>> for SubastaError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        SubastaError::msg(e)
    }
}
