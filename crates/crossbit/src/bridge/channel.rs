//! File-backed session state shared by controller and worker.
//!
//! All three paths derive from `(host, port)` so both sides, and a later
//! cleanup pass, can find them without talking to each other.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Serialize, de::DeserializeOwned};

use super::codec::{CodecError, FormatVersion, decode_payload, encode_payload};

/// Paths owned by one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFiles {
    /// Bulk-data channel.
    pub bulk: PathBuf,
    /// Recovery record written by the worker before its handler exists.
    pub recovery: PathBuf,
    /// Scratch directory the worker may use; removed on close.
    pub resources: PathBuf,
}

impl SessionFiles {
    pub fn for_address(host: &str, port: u16) -> Self {
        Self::in_dir(&std::env::temp_dir(), host, port)
    }

    pub fn in_dir(dir: &Path, host: &str, port: u16) -> Self {
        // ':' from IPv6 hosts is not valid in Windows file names
        let host: String = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        let stem = format!("crossbit-{host}-{port}");
        Self {
            bulk: dir.join(format!("{stem}.bin")),
            recovery: dir.join(format!("{stem}.txt")),
            resources: dir.join(format!("{stem}.d")),
        }
    }
}

/// Half-duplex bulk-data channel: whoever wrote last owns the file contents.
#[derive(Debug, Clone)]
pub struct BulkChannel {
    path: PathBuf,
    version: FormatVersion,
}

impl BulkChannel {
    pub fn new(path: impl Into<PathBuf>, version: FormatVersion) -> Self {
        Self {
            path: path.into(),
            version,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> FormatVersion {
        self.version
    }

    pub fn write<T: Serialize>(&self, item: &T) -> Result<(), CodecError> {
        let bytes = encode_payload(self.version, item)?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }

    pub fn read<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let bytes = fs::read(&self.path)?;
        decode_payload(self.version, &bytes)
    }
}

/// `<pid>\n<resource dir>`: enough for a controller to clean up after a
/// worker it never managed to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRecord {
    pub pid: u32,
    pub resource_dir: PathBuf,
}

impl RecoveryRecord {
    pub fn write(&self, path: &Path) -> io::Result<()> {
        fs::write(path, format!("{}\n{}", self.pid, self.resource_dir.display()))
    }

    pub fn read(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed recovery file {}", path.display()),
            )
        })
    }

    pub fn parse(text: &str) -> Option<Self> {
        let (pid, dir) = text.split_once('\n')?;
        let pid = pid.trim().parse().ok()?;
        let dir = dir.trim_end_matches(['\r', '\n']);
        if dir.is_empty() {
            return None;
        }
        Some(Self {
            pid,
            resource_dir: PathBuf::from(dir),
        })
    }
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

pub(crate) fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
