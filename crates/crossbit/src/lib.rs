//! crossbit: call into a library that cannot be loaded in-process.
//!
//! A controller starts a worker executable (built for another architecture,
//! bitness or runtime), then invokes members of the handler it hosts. Small
//! control messages travel over loopback HTTP; arguments and results go
//! through a per-session file.

pub mod bootstrap;
pub mod bridge;
mod capture;
pub mod error;
pub mod handler;
pub mod logging;
pub mod mock;
pub mod platform;
pub mod session;
pub mod transport;
pub mod value;
mod version;
pub mod worker;

#[cfg(test)]
mod testing;

pub use bridge::{Fault, FormatVersion, Metadata};
pub use capture::CapturedOutput;
pub use error::{BootstrapError, BridgeError};
pub use handler::{
    Handler, HandlerContext, HandlerRegistry, Invoke, LibType, Library, MemberTable,
};
pub use mock::MockSession;
pub use platform::PlatformInfo;
pub use session::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_KILL_TIMEOUT, ExecutableSpawner, Session, SessionConfig,
    SpawnError, WorkerSession, WorkerSpawner, open,
};
pub use value::{Call, FromValue, Kwargs, Value};
pub use version::{CROSSBIT_VERSION, VersionInfo};
