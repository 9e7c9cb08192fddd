//! Fatal startup errors.

use std::fmt;

/// An error that ends the process.
///
/// Only two conditions are fatal once configuration is read: listening
/// sockets that cannot be bound, and a zone-store region that cannot be
/// attached.  Everything else is logged and survived.
#[derive(Clone, Debug)]
pub struct ExitError(pub String);

impl ExitError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ExitError {}

impl From<String> for ExitError {
    fn from(message: String) -> Self {
        Self(message)
    }
}
