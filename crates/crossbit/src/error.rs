//! Error types for the controller and the worker bootstrap.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::codec::CodecError;
use crate::bridge::protocol::Fault;

/// Errors surfaced by a controller session.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The worker never became reachable. `reason` carries what it printed.
    #[error("{message}{}", reason_suffix(.reason))]
    ConnectionTimeout { message: String, reason: String },

    /// The worker did not answer in time. It is left running.
    #[error(
        "Waiting for the response from the '{name}' request timed out after {} second(s)",
        .timeout.as_secs_f64()
    )]
    ResponseTimeout { name: String, timeout: Duration },

    /// The worker raised while handling a request.
    #[error("{0}")]
    Fault(Fault),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cannot start the worker: {0}")]
    Spawn(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn reason_suffix(reason: &str) -> String {
    if reason.is_empty() {
        String::new()
    } else {
        format!("\n{reason}")
    }
}

impl BridgeError {
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::ResponseTimeout { .. }
        )
    }
}

impl From<Fault> for BridgeError {
    fn from(fault: Fault) -> Self {
        Self::Fault(fault)
    }
}

impl From<CodecError> for BridgeError {
    fn from(err: CodecError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Fatal worker startup errors. Printed to stderr before a non-zero exit;
/// the controller sees them inside `ConnectionTimeout`.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("{0}")]
    Usage(String),

    #[error(
        "You must specify a handler module to run on the worker.\nFor example: crossbit-server --module calculator"
    )]
    MissingModule,

    #[error("ImportError: {0}\nCannot perform relative imports.")]
    RelativeImport(String),

    #[error(
        "ImportError: No module named '{module}'\nThe module must be registered with the worker binary and its directory must be in the search path (see --append-sys-path).\nThe search path is:\n{}",
        indent_paths(.search_path)
    )]
    UnknownModule {
        module: String,
        search_path: Vec<PathBuf>,
    },

    #[error("AttributeError: module '{0}'\nModule does not contain a type that implements Handler.")]
    NoHandler(String),

    #[error("module '{module}' contains more than one Handler: {}", .types.join(", "))]
    AmbiguousHandler {
        module: String,
        types: Vec<&'static str>,
    },

    #[error("Instantiating '{type_name}' raised the following fault:\n\n{fault}{}", reason_suffix(.hint))]
    Construct {
        type_name: &'static str,
        fault: Fault,
        hint: String,
    },

    #[error(
        "'{0}' was constructed but never bound a library.\nCheck that '{0}::construct' calls Library::bind before returning."
    )]
    Unbound(&'static str),

    #[error("--add-dll-directory is not supported on {0}")]
    DllDirectoryUnsupported(String),

    #[error("cannot prepare {path}: {source}")]
    Files {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("worker runtime failed: {0}")]
    Runtime(String),
}

impl BootstrapError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            _ => 1,
        }
    }
}

fn indent_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("  {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n")
}
