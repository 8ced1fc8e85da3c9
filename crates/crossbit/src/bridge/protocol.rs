//! Wire types for controller-worker communication.
//!
//! Two channels:
//! - **Control channel** (HTTP on loopback): configure, metadata, shutdown and
//!   one `GET /<member>` per request. Faults travel in the response body.
//! - **Bulk-data channel** (a temp file): the serialized [`Call`] and the
//!   serialized result, strictly half-duplex.
//!
//! [`Call`]: crate::value::Call

use std::fmt;
use std::panic::Location;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Control path that returns [`Metadata`].
pub const METADATA: &str = "-METADATA-";

/// Control path that asks the worker to stop.
pub const SHUTDOWN: &str = "-SHUTDOWN-";

/// Status: the result is waiting in the bulk-data file.
pub const OK: u16 = 200;

/// Status: the body is a [`Fault`].
pub const ERROR: u16 = 500;

/// A failure raised on the worker, carried back to the controller.
///
/// Matched by `name`. Deliberately not a `std::error::Error`: any error type
/// converts into a `Fault` with `?`, named after the error's type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub trace: String,
}

impl Fault {
    pub const ATTRIBUTE_ERROR: &'static str = "AttributeError";
    pub const TYPE_ERROR: &'static str = "TypeError";
    pub const VALUE_ERROR: &'static str = "ValueError";
    pub const RUNTIME_ERROR: &'static str = "RuntimeError";
    pub const PROTOCOL_ERROR: &'static str = "ProtocolError";
    pub const PANIC: &'static str = "Panic";

    #[track_caller]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::at(name, message, Location::caller())
    }

    /// A fault whose trace points at `location`.
    pub fn at(
        name: impl Into<String>,
        message: impl Into<String>,
        location: &Location<'_>,
    ) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            trace: format!("  at {}:{}", location.file(), location.line()),
        }
    }

    /// A fault with no source location.
    pub fn bare(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            trace: String::new(),
        }
    }

    #[track_caller]
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(Self::TYPE_ERROR, message)
    }

    #[track_caller]
    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(Self::VALUE_ERROR, message)
    }

    #[track_caller]
    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new(Self::RUNTIME_ERROR, message)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::bare(Self::ATTRIBUTE_ERROR, message)
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::bare(Self::PROTOCOL_ERROR, message)
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    /// Append the member the fault was raised in to the trace.
    pub fn in_member(mut self, member: &str) -> Self {
        if !self.trace.is_empty() {
            self.trace.push('\n');
        }
        self.trace.push_str("  in ");
        self.trace.push_str(member);
        self
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)?;
        if !self.trace.is_empty() {
            write!(f, "\n{}", self.trace)?;
        }
        Ok(())
    }
}

impl<E: std::error::Error + 'static> From<E> for Fault {
    #[track_caller]
    fn from(err: E) -> Self {
        Self::at(short_type_name::<E>(), err.to_string(), Location::caller())
    }
}

/// Last path segment of a type name, without generic parameters.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Reply to the one-time configure request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol: u8,
}

/// Query of the configure request: `POST /?protocol=<version>&path=<file>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureQuery {
    pub protocol: u8,
    pub path: PathBuf,
}

/// Worker facts fetched once after the handshake, used for cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub library_path: PathBuf,
    pub pid: u32,
    pub resource_dir: PathBuf,
}
