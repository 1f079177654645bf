//! Unified error taxonomy and backend status mapping
//!
//! Every public operation reports a [`PioError`] (or its numeric status, see
//! [`status`]). Backend calls return raw codes which are classified by
//! [`map_backend_status`]; the classification decides whether the one-shot
//! format fallback applies.
//!
//! # Status Codes
//!
//! Status codes are zero for success and negative for errors:
//!
//! - `SUCCESS` (0): Operation succeeded
//! - `EBADSESSION` (-1): Unknown I/O system id
//! - `EBADHANDLE` (-2): Unknown or closed file handle
//! - `ENOMEM` (-3): Out of memory
//! - `EUNSUPPORTED` (-4): Format or argument rejected by the backend
//! - `EBACKEND` (-5): Any other backend failure
//! - `ECOMM` (-6): Send or broadcast failed
//! - `EPERM` (-7): Write staged on a file not opened for writing

use crate::comm::CommError;
use crate::storage::{BackendStatus, nc};

/// Numeric status codes surfaced to callers
pub mod status {
    pub const SUCCESS: i32 = 0;
    pub const EBADSESSION: i32 = -1;
    pub const EBADHANDLE: i32 = -2;
    pub const ENOMEM: i32 = -3;
    pub const EUNSUPPORTED: i32 = -4;
    pub const EBACKEND: i32 = -5;
    pub const ECOMM: i32 = -6;
    pub const EPERM: i32 = -7;
}

/// Handle id used when the backend rejects a handle we cannot name
pub const NO_HANDLE: i32 = -1;

#[derive(Debug, thiserror::Error)]
pub enum PioError {
    #[error("Bad I/O system id: {0}")]
    BadSessionId(i32),

    #[error("Bad file handle: {0}")]
    BadHandle(i32),

    #[error("File handle {0} is already registered")]
    HandleInUse(i32),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Unsupported format or invalid argument (backend code {code})")]
    UnsupportedFormat { code: i32 },

    #[error("File {0} is not open for writing")]
    ReadOnly(i32),

    #[error("Backend failure (code {code})")]
    Backend { code: i32 },

    #[error("Communication failed: {0}")]
    Comm(#[from] CommError),
}

pub type PioResult<T> = Result<T, PioError>;

impl PioError {
    /// Numeric status for this error
    pub fn status(&self) -> i32 {
        match self {
            PioError::BadSessionId(_) => status::EBADSESSION,
            PioError::BadHandle(_) | PioError::HandleInUse(_) => status::EBADHANDLE,
            PioError::OutOfMemory => status::ENOMEM,
            PioError::UnsupportedFormat { .. } => status::EUNSUPPORTED,
            PioError::ReadOnly(_) => status::EPERM,
            PioError::Backend { .. } => status::EBACKEND,
            PioError::Comm(_) => status::ECOMM,
        }
    }

    /// Raw backend code attached to this error, if any
    pub fn raw_code(&self) -> Option<i32> {
        match self {
            PioError::UnsupportedFormat { code } | PioError::Backend { code } => Some(*code),
            _ => None,
        }
    }

    /// Whether a failed open may be retried once with the classic format
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            PioError::UnsupportedFormat { code } if *code == nc::ENOTNC || *code == nc::EINVAL
        )
    }

    /// Communication faults abort the in-flight operation on the spot
    pub fn is_fatal(&self) -> bool {
        matches!(self, PioError::Comm(_))
    }

    /// Encode as `(status, detail)` for broadcasting to peers
    pub fn to_wire(&self) -> (i32, i32) {
        let detail = match self {
            PioError::BadSessionId(id)
            | PioError::BadHandle(id)
            | PioError::HandleInUse(id)
            | PioError::ReadOnly(id) => *id,
            PioError::UnsupportedFormat { code } | PioError::Backend { code } => *code,
            PioError::OutOfMemory | PioError::Comm(_) => 0,
        };
        (self.status(), detail)
    }

    /// Rebuild an error received from a peer; `None` means success
    pub fn from_wire(code: i32, detail: i32) -> Option<PioError> {
        match code {
            status::SUCCESS => None,
            status::EBADSESSION => Some(PioError::BadSessionId(detail)),
            status::EBADHANDLE => Some(PioError::BadHandle(detail)),
            status::ENOMEM => Some(PioError::OutOfMemory),
            status::EUNSUPPORTED => Some(PioError::UnsupportedFormat { code: detail }),
            status::EPERM => Some(PioError::ReadOnly(detail)),
            status::ECOMM => Some(PioError::Comm(CommError::Remote(detail))),
            _ => Some(PioError::Backend { code: detail }),
        }
    }
}

/// Classify a raw backend status code
///
/// This never retries; the retry policy belongs to the dispatcher.
pub fn map_backend_status(raw: i32) -> PioResult<()> {
    match raw {
        nc::NOERR => Ok(()),
        nc::EBADID => Err(PioError::BadHandle(NO_HANDLE)),
        nc::ENOMEM => Err(PioError::OutOfMemory),
        nc::ENOTNC | nc::EINVAL | nc::EBADIOTYPE => Err(PioError::UnsupportedFormat { code: raw }),
        code => Err(PioError::Backend { code }),
    }
}

impl From<BackendStatus> for PioError {
    fn from(status: BackendStatus) -> Self {
        match map_backend_status(status.code()) {
            Err(e) => e,
            // A failure reported with the success code is still a failure
            Ok(()) => PioError::Backend { code: status.code() },
        }
    }
}

/// Convert a result into its numeric status
pub fn status_of<T>(result: &PioResult<T>) -> i32 {
    match result {
        Ok(_) => status::SUCCESS,
        Err(e) => e.status(),
    }
}
