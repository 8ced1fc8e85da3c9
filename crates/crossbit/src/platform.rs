//! Description of the platform a worker runs on.

use std::fmt;

use serde::Serialize;

/// OS, architecture and executable naming of one platform.
///
/// Passed explicitly to the session and bootstrap so tests can describe a
/// platform other than the one they run on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub pointer_width: u32,
    pub exe_suffix: String,
}

impl PlatformInfo {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pointer_width: usize::BITS,
            exe_suffix: std::env::consts::EXE_SUFFIX.to_string(),
        }
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    /// Only Windows has a DLL search path separate from `PATH`.
    pub fn supports_dll_directories(&self) -> bool {
        self.is_windows()
    }

    pub fn executable_name(&self, stem: &str) -> String {
        format!("{stem}{}", self.exe_suffix)
    }
}

impl Default for PlatformInfo {
    fn default() -> Self {
        Self::current()
    }
}

impl fmt::Display for PlatformInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{} ({}-bit)", self.os, self.arch, self.pointer_width)
    }
}
