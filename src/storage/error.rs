//! Raw backend status codes
//!
//! Backends report netCDF/PnetCDF style codes: zero for success, negative
//! library codes, and positive system `errno` values for OS level failures.
//! [`crate::error::map_backend_status`] classifies them.

/// Raw codes shared by every backend
pub mod nc {
    pub const NOERR: i32 = 0;
    /// Unknown file handle
    pub const EBADID: i32 = -33;
    /// File exists and the no-clobber bit was set
    pub const EEXIST: i32 = -35;
    /// Invalid argument or mode combination
    pub const EINVAL: i32 = -36;
    /// Write to a file opened read-only
    pub const EPERM: i32 = -37;
    /// File is not in a format this backend reads
    pub const ENOTNC: i32 = -51;
    pub const ENOMEM: i32 = -61;
    /// Generic I/O failure
    pub const EIO: i32 = -68;
    /// Attached aggregation buffer too small for the queued writes
    pub const EINSUFFBUF: i32 = -219;
    /// Detach requested while writes are still queued
    pub const EPENDING: i32 = -220;
    /// No backend is available for the requested format
    pub const EBADIOTYPE: i32 = -500;

    /// System errno: no such file
    pub const ENOENT: i32 = 2;
}

/// Raw status returned by a failed backend call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendStatus(pub i32);

impl BackendStatus {
    pub fn code(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "backend status {}", self.0)
    }
}

pub type BackendResult<T> = Result<T, BackendStatus>;
