//! In-memory reference backend
//!
//! [`MemoryStore`] is the "file system": one instance is shared by every
//! rank of a process (it is `Send + Sync`). Each rank builds its own
//! [`MemoryBackend`] drivers on top of it; handle ids come from a per-rank
//! counter shared by all formats and are never reused.
//!
//! Collective formats are made consistent the same way a real parallel
//! library is: I/O rank 0 performs the operation on the store and broadcasts
//! the status over the I/O communicator. Serial formats are only ever called
//! on I/O rank 0.
//!
//! Format rules enforced on open:
//! - collective-buffered files cannot hold extended types (`ENOTNC`)
//! - the parallel format only opens files created with extended types
//!   (`EINVAL`)
//! - serial formats reject the parallel-access mode bit (`EINVAL`)

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{BackendResult, BackendStatus, BatchWrite, IoFormat, OpenMode, StorageBackend, nc};
use crate::comm::{Communicator, Root};

/// Operations that can be made to fail on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Open,
    Create,
    Close,
    Sync,
    Delete,
    Write,
    Detach,
}

#[derive(Debug, Default)]
struct StoredFile {
    extended: bool,
    records: BTreeMap<(i32, Option<i64>), Vec<u8>>,
    fills: BTreeMap<i32, Vec<u8>>,
    syncs: u32,
}

#[derive(Debug, Default)]
struct StoreInner {
    files: HashMap<String, StoredFile>,
    failures: HashMap<(StoreOp, IoFormat), i32>,
}

/// Shared in-memory file system
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a file directly, bypassing any backend
    pub fn insert_file(&self, path: &str, extended: bool) {
        self.inner.lock().files.insert(
            path.to_string(),
            StoredFile {
                extended,
                ..Default::default()
            },
        );
    }

    pub fn exists(&self, path: &str) -> bool {
        self.inner.lock().files.contains_key(path)
    }

    pub fn is_extended(&self, path: &str) -> Option<bool> {
        self.inner.lock().files.get(path).map(|f| f.extended)
    }

    /// Persisted bytes of one variable record
    pub fn record(&self, path: &str, var_id: i32, frame: Option<i64>) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .files
            .get(path)
            .and_then(|f| f.records.get(&(var_id, frame)).cloned())
    }

    pub fn record_count(&self, path: &str) -> usize {
        self.inner
            .lock()
            .files
            .get(path)
            .map(|f| f.records.len())
            .unwrap_or(0)
    }

    pub fn fill_value(&self, path: &str, var_id: i32) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .files
            .get(path)
            .and_then(|f| f.fills.get(&var_id).cloned())
    }

    pub fn sync_count(&self, path: &str) -> u32 {
        self.inner
            .lock()
            .files
            .get(path)
            .map(|f| f.syncs)
            .unwrap_or(0)
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.lock().files.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Make the next `op` on `format` fail with `code`
    ///
    /// The failure is consumed by the rank that executes the operation on
    /// the store (I/O rank 0), so every rank observes it once.
    pub fn fail_next(&self, op: StoreOp, format: IoFormat, code: i32) {
        self.inner.lock().failures.insert((op, format), code);
    }

    fn take_failure(&self, op: StoreOp, format: IoFormat) -> BackendResult<()> {
        match self.inner.lock().failures.remove(&(op, format)) {
            Some(code) => Err(BackendStatus(code)),
            None => Ok(()),
        }
    }

    fn apply(&self, path: &str, batch: &BatchWrite) -> BackendResult<()> {
        let mut inner = self.inner.lock();
        let file = inner
            .files
            .get_mut(path)
            .ok_or(BackendStatus(nc::ENOENT))?;
        for record in &batch.records {
            file.records
                .insert((record.var_id, record.frame), record.data.clone());
            if let Some(fill) = &record.fill {
                file.fills.insert(record.var_id, fill.clone());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Attached {
    limit: usize,
    used: usize,
    queued: Vec<BatchWrite>,
}

#[derive(Debug)]
struct OpenFile {
    path: String,
    mode: OpenMode,
    attached: Option<Attached>,
}

#[derive(Debug, Default)]
struct RankState {
    next_fh: i32,
    files: HashMap<i32, OpenFile>,
}

/// Per-rank driver for one format over a [`MemoryStore`]
pub struct MemoryBackend {
    format: IoFormat,
    store: MemoryStore,
    state: Rc<RefCell<RankState>>,
}

impl MemoryBackend {
    /// One driver per format, sharing this rank's handle space
    pub fn for_all_formats(store: &MemoryStore) -> Vec<(IoFormat, MemoryBackend)> {
        let state = Rc::new(RefCell::new(RankState::default()));
        IoFormat::ALL
            .into_iter()
            .map(|format| {
                (
                    format,
                    MemoryBackend {
                        format,
                        store: store.clone(),
                        state: state.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn format(&self) -> IoFormat {
        self.format
    }

    /// Execute `op` where this format executes it and return a status that
    /// agrees on every participating rank
    fn run<F>(&self, io: &dyn Communicator, op: F) -> BackendResult<()>
    where
        F: FnOnce() -> BackendResult<()>,
    {
        if self.format.is_serial() {
            return op();
        }
        let mut code = [nc::NOERR];
        if io.rank() == 0 {
            if let Err(status) = op() {
                code[0] = status.code();
            }
        }
        io.broadcast_i32s(&mut code, Root::Rank(0))
            .map_err(|_| BackendStatus(nc::EIO))?;
        match code[0] {
            nc::NOERR => Ok(()),
            code => Err(BackendStatus(code)),
        }
    }

    fn check_mode(&self, mode: OpenMode) -> BackendResult<()> {
        if self.format.is_serial() && mode.contains(OpenMode::MPIIO) {
            return Err(BackendStatus(nc::EINVAL));
        }
        Ok(())
    }

    fn path_of(&self, fh: i32) -> BackendResult<String> {
        self.state
            .borrow()
            .files
            .get(&fh)
            .map(|f| f.path.clone())
            .ok_or(BackendStatus(nc::EBADID))
    }

    fn register(&self, path: &str, mode: OpenMode) -> i32 {
        let mut state = self.state.borrow_mut();
        state.next_fh += 1;
        let fh = state.next_fh;
        state.files.insert(
            fh,
            OpenFile {
                path: path.to_string(),
                mode,
                attached: None,
            },
        );
        fh
    }
}

impl StorageBackend for MemoryBackend {
    fn open(&self, path: &str, mode: OpenMode, io: &dyn Communicator) -> BackendResult<i32> {
        self.run(io, || {
            self.store.take_failure(StoreOp::Open, self.format)?;
            self.check_mode(mode)?;
            let inner = self.store.inner.lock();
            let file = inner.files.get(path).ok_or(BackendStatus(nc::ENOENT))?;
            match self.format {
                IoFormat::CollectiveBuffered if file.extended => Err(BackendStatus(nc::ENOTNC)),
                IoFormat::Parallel if !file.extended => Err(BackendStatus(nc::EINVAL)),
                _ => Ok(()),
            }
        })?;
        Ok(self.register(path, mode))
    }

    fn create(&self, path: &str, mode: OpenMode, io: &dyn Communicator) -> BackendResult<i32> {
        self.run(io, || {
            self.store.take_failure(StoreOp::Create, self.format)?;
            self.check_mode(mode)?;
            let mut inner = self.store.inner.lock();
            if mode.contains(OpenMode::NOCLOBBER) && inner.files.contains_key(path) {
                return Err(BackendStatus(nc::EEXIST));
            }
            inner.files.insert(
                path.to_string(),
                StoredFile {
                    extended: mode.contains(OpenMode::EXTENDED),
                    ..Default::default()
                },
            );
            Ok(())
        })?;
        Ok(self.register(path, mode))
    }

    fn close(&self, fh: i32, io: &dyn Communicator) -> BackendResult<()> {
        self.run(io, || {
            self.store.take_failure(StoreOp::Close, self.format)?;
            self.path_of(fh).map(|_| ())
        })?;
        self.state.borrow_mut().files.remove(&fh);
        Ok(())
    }

    fn sync(&self, fh: i32, io: &dyn Communicator) -> BackendResult<()> {
        self.run(io, || {
            self.store.take_failure(StoreOp::Sync, self.format)?;
            let path = self.path_of(fh)?;
            let mut inner = self.store.inner.lock();
            let file = inner
                .files
                .get_mut(&path)
                .ok_or(BackendStatus(nc::ENOENT))?;
            file.syncs += 1;
            Ok(())
        })
    }

    fn delete(&self, path: &str, io: &dyn Communicator) -> BackendResult<()> {
        self.run(io, || {
            self.store.take_failure(StoreOp::Delete, self.format)?;
            match self.store.inner.lock().files.remove(path) {
                Some(_) => Ok(()),
                None => Err(BackendStatus(nc::ENOENT)),
            }
        })
    }

    fn write_batch(
        &self,
        fh: i32,
        batch: &BatchWrite,
        io: &dyn Communicator,
    ) -> BackendResult<()> {
        self.run(io, || {
            self.store.take_failure(StoreOp::Write, self.format)?;
            let mut state = self.state.borrow_mut();
            let file = state.files.get_mut(&fh).ok_or(BackendStatus(nc::EBADID))?;
            if !file.mode.is_write() {
                return Err(BackendStatus(nc::EPERM));
            }
            if batch.is_empty() {
                return Ok(());
            }
            match &mut file.attached {
                Some(attached) => {
                    if attached.used + batch.byte_len() > attached.limit {
                        return Err(BackendStatus(nc::EINSUFFBUF));
                    }
                    attached.used += batch.byte_len();
                    attached.queued.push(batch.clone());
                    Ok(())
                }
                None => self.store.apply(&file.path, batch),
            }
        })
    }

    fn attach_buffer(&self, fh: i32, limit: usize, io: &dyn Communicator) -> BackendResult<()> {
        self.run(io, || {
            let mut state = self.state.borrow_mut();
            let file = state.files.get_mut(&fh).ok_or(BackendStatus(nc::EBADID))?;
            if file.attached.is_some() {
                return Err(BackendStatus(nc::EINVAL));
            }
            file.attached = Some(Attached {
                limit,
                ..Default::default()
            });
            Ok(())
        })
    }

    fn detach_buffer(&self, fh: i32, io: &dyn Communicator) -> BackendResult<()> {
        self.run(io, || {
            self.store.take_failure(StoreOp::Detach, self.format)?;
            let mut state = self.state.borrow_mut();
            let file = state.files.get_mut(&fh).ok_or(BackendStatus(nc::EBADID))?;
            match &file.attached {
                None => Err(BackendStatus(nc::EINVAL)),
                Some(attached) if !attached.queued.is_empty() => {
                    Err(BackendStatus(nc::EPENDING))
                }
                Some(_) => {
                    file.attached = None;
                    Ok(())
                }
            }
        })
    }

    fn flush_buffer(&self, fh: i32, io: &dyn Communicator) -> BackendResult<()> {
        self.run(io, || {
            let (path, queued) = {
                let mut state = self.state.borrow_mut();
                let file = state.files.get_mut(&fh).ok_or(BackendStatus(nc::EBADID))?;
                let queued = match &mut file.attached {
                    Some(attached) => {
                        attached.used = 0;
                        std::mem::take(&mut attached.queued)
                    }
                    None => Vec::new(),
                };
                (file.path.clone(), queued)
            };
            for batch in &queued {
                self.store.apply(&path, batch)?;
            }
            Ok(())
        })
    }

    fn buffer_usage(&self, fh: i32) -> usize {
        self.state
            .borrow()
            .files
            .get(&fh)
            .and_then(|f| f.attached.as_ref())
            .map(|a| a.used)
            .unwrap_or(0)
    }
}
