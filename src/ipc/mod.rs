//! The abstract channel pair a mediator drives: a typed message queue plus
//! an indexed payload store, identified by a stable token derived from
//! (daemon executable path, worker alias).

pub mod transport;

pub use transport::{SysVTransport, Transport};

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::call::CallId;
use crate::call::CallStatus;
use crate::error::DaemonError;

/// Message header kinds, typed by a small integer per §6 of the design.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize, Hash)]
#[repr(u8)]
pub enum HeaderKind {
    Return = 10,
    Running = 20,
    Call = 30,
}

impl HeaderKind {
    /// A call's current status maps onto the header kind sent alongside
    /// it; `Uncalled` never crosses the wire.
    pub fn from_status(status: CallStatus) -> Option<HeaderKind> {
        match status {
            CallStatus::Called => Some(HeaderKind::Call),
            CallStatus::Running => Some(HeaderKind::Running),
            CallStatus::Returned | CallStatus::Cancelled | CallStatus::Timeout => {
                Some(HeaderKind::Return)
            }
            CallStatus::Uncalled => None,
        }
    }
}

/// A small, fixed-width message-queue entry: `{id, status, time, pid}`.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct Header {
    pub id: CallId,
    pub status: CallStatus,
    pub time: i64,
    pub pid: i32,
}

/// The record written at the reserved payload-store slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolHeader {
    pub version: String,
    pub size: usize,
}

pub const PROTOCOL_VERSION: &str = "1.0";

/// Best-effort cleanup of the guid sentinel file; held by a transport and
/// dropped when the transport (and, in forked children, their copy of it)
/// goes out of scope. Parent and every forked child each hold their own
/// `GuidSentinel` for the same path; whichever drops first unlinks it; a
/// later drop's `remove_file` simply fails silently.
pub struct GuidSentinel {
    path: PathBuf,
}

impl Drop for GuidSentinel {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Concatenates the daemon executable path and the worker alias,
/// normalizes path separators and dots to underscores, creates a
/// temp-directory sentinel file, and derives a stable token from that
/// file's inode combined with the first byte of the alias. Parent and
/// child independently re-derive the same guid from the same inputs.
pub fn derive_guid(exe_path: &std::path::Path, alias: &str) -> Result<(String, GuidSentinel), DaemonError> {
    let raw = format!("{}_{}", exe_path.display(), alias);
    let normalized: String = raw
        .chars()
        .map(|c| if c == '/' || c == '.' { '_' } else { c })
        .collect();

    let sentinel_path = std::env::temp_dir().join(format!("{}.ftok", normalized));
    if !sentinel_path.exists() {
        let mut f = File::create(&sentinel_path)
            .map_err(|e| DaemonError::Validation(format!("cannot create guid sentinel: {}", e)))?;
        f.write_all(normalized.as_bytes())
            .map_err(|e| DaemonError::Validation(format!("cannot write guid sentinel: {}", e)))?;
    }
    let inode = fs::metadata(&sentinel_path)
        .map_err(|e| DaemonError::Validation(format!("cannot stat guid sentinel: {}", e)))?
        .ino();
    let first_byte = alias.as_bytes().first().copied().unwrap_or(0);
    let guid = format!("{:x}{:02x}", inode, first_byte);
    Ok((guid, GuidSentinel { path: sentinel_path }))
}
