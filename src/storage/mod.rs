//! Storage layer: format tags, the backend trait and the capability table
pub mod dispatch;
pub mod error;
pub mod memory;

pub use dispatch::{Dispatcher, Opened};
pub use error::{BackendResult, BackendStatus, nc};
pub use memory::{MemoryBackend, MemoryStore};

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::error::{PioError, PioResult};

/// Storage format of a file
///
/// The numeric tags travel on the wire and match the classic I/O type
/// numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IoFormat {
    /// Serial classic format, executed on the I/O master only
    Classic,
    /// Serial classic format with extended types, I/O master only
    ClassicExtended,
    /// Parallel-capable format, collective over the I/O communicator
    Parallel,
    /// Collective format with a backend-side write-aggregation buffer
    CollectiveBuffered,
}

impl IoFormat {
    pub const ALL: [IoFormat; 4] = [
        IoFormat::Classic,
        IoFormat::ClassicExtended,
        IoFormat::Parallel,
        IoFormat::CollectiveBuffered,
    ];

    pub fn tag(self) -> i32 {
        match self {
            IoFormat::CollectiveBuffered => 1,
            IoFormat::Classic => 2,
            IoFormat::ClassicExtended => 3,
            IoFormat::Parallel => 4,
        }
    }

    pub fn from_tag(tag: i32) -> Option<Self> {
        IoFormat::ALL.into_iter().find(|f| f.tag() == tag)
    }

    /// Serial formats run on I/O rank 0 only
    pub fn is_serial(self) -> bool {
        matches!(self, IoFormat::Classic | IoFormat::ClassicExtended)
    }

    pub fn name(self) -> &'static str {
        match self {
            IoFormat::Classic => "classic",
            IoFormat::ClassicExtended => "classic-extended",
            IoFormat::Parallel => "parallel",
            IoFormat::CollectiveBuffered => "collective-buffered",
        }
    }
}

impl fmt::Display for IoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IoFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IoFormat::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| format!("unknown format '{}'", s))
    }
}

/// Open/create mode flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenMode(pub i32);

impl OpenMode {
    pub const READ: OpenMode = OpenMode(0);
    pub const WRITE: OpenMode = OpenMode(0x0001);
    /// Fail create if the path exists
    pub const NOCLOBBER: OpenMode = OpenMode(0x0004);
    /// Extended type model
    pub const EXTENDED: OpenMode = OpenMode(0x1000);
    /// Parallel access through MPI-IO
    pub const MPIIO: OpenMode = OpenMode(0x2000);

    pub fn bits(self) -> i32 {
        self.0
    }

    pub fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_write(self) -> bool {
        self.contains(OpenMode::WRITE)
    }

    pub fn without(self, other: OpenMode) -> OpenMode {
        OpenMode(self.0 & !other.0)
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

/// One variable's share of a collective write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarRecord {
    pub var_id: i32,
    /// Record (frame) index, `None` for variables without a record dimension
    pub frame: Option<i64>,
    pub data: Vec<u8>,
    pub fill: Option<Vec<u8>>,
}

/// A batch of variable writes issued as one backend call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchWrite {
    pub records: Vec<VarRecord>,
}

impl BatchWrite {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Payload bytes in the batch
    pub fn byte_len(&self) -> usize {
        self.records.iter().map(|r| r.data.len()).sum()
    }

    /// Merge one rank's contribution; data for the same variable and frame
    /// is appended in arrival order
    pub fn merge(&mut self, record: VarRecord) {
        match self
            .records
            .iter_mut()
            .find(|r| r.var_id == record.var_id && r.frame == record.frame)
        {
            Some(existing) => {
                existing.data.extend_from_slice(&record.data);
                if existing.fill.is_none() {
                    existing.fill = record.fill;
                }
            }
            None => self.records.push(record),
        }
    }
}

/// A storage backend for one format
///
/// Serial backends are called on I/O rank 0 only. Collective backends are
/// called by every I/O rank with the same arguments and must return the same
/// status everywhere. Handles are local to the calling rank.
pub trait StorageBackend {
    fn open(&self, path: &str, mode: OpenMode, io: &dyn Communicator) -> BackendResult<i32>;

    fn create(&self, path: &str, mode: OpenMode, io: &dyn Communicator) -> BackendResult<i32>;

    fn close(&self, fh: i32, io: &dyn Communicator) -> BackendResult<()>;

    fn sync(&self, fh: i32, io: &dyn Communicator) -> BackendResult<()>;

    fn delete(&self, path: &str, io: &dyn Communicator) -> BackendResult<()>;

    /// Write a merged batch; non-root ranks of collective formats pass an
    /// empty batch
    fn write_batch(&self, fh: i32, batch: &BatchWrite, io: &dyn Communicator)
    -> BackendResult<()>;

    /// Attach an internal aggregation buffer of `limit` bytes
    fn attach_buffer(&self, _fh: i32, _limit: usize, _io: &dyn Communicator) -> BackendResult<()> {
        Ok(())
    }

    fn detach_buffer(&self, _fh: i32, _io: &dyn Communicator) -> BackendResult<()> {
        Ok(())
    }

    /// Write out everything queued in the attached buffer
    fn flush_buffer(&self, _fh: i32, _io: &dyn Communicator) -> BackendResult<()> {
        Ok(())
    }

    /// Bytes queued in the attached buffer
    fn buffer_usage(&self, _fh: i32) -> usize {
        0
    }
}

/// Runtime capability table: which formats have a backend
#[derive(Default)]
pub struct BackendTable {
    backends: BTreeMap<IoFormat, Box<dyn StorageBackend>>,
}

impl BackendTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the in-memory backend registered for every format
    pub fn in_memory(store: &MemoryStore) -> Self {
        let mut table = Self::new();
        for (format, backend) in MemoryBackend::for_all_formats(store) {
            table.register(format, Box::new(backend));
        }
        table
    }

    pub fn register(&mut self, format: IoFormat, backend: Box<dyn StorageBackend>) {
        self.backends.insert(format, backend);
    }

    /// Keep only the formats listed in `enabled`
    pub fn restrict(mut self, enabled: &[IoFormat]) -> Self {
        self.backends.retain(|format, _| enabled.contains(format));
        self
    }

    pub fn is_available(&self, format: IoFormat) -> bool {
        self.backends.contains_key(&format)
    }

    pub fn formats(&self) -> impl Iterator<Item = IoFormat> + '_ {
        self.backends.keys().copied()
    }

    pub fn get(&self, format: IoFormat) -> PioResult<&dyn StorageBackend> {
        self.backends
            .get(&format)
            .map(|b| b.as_ref())
            .ok_or(PioError::UnsupportedFormat {
                code: nc::EBADIOTYPE,
            })
    }

    /// Format used for deletes: classic if available, then
    /// collective-buffered, then whatever remains
    pub fn delete_format(&self) -> Option<IoFormat> {
        [
            IoFormat::Classic,
            IoFormat::CollectiveBuffered,
            IoFormat::ClassicExtended,
            IoFormat::Parallel,
        ]
        .into_iter()
        .find(|f| self.is_available(*f))
    }
}
