//! File lifecycle operations
//!
//! Every operation here is collective: all ranks of the session call it in
//! the same order with the same arguments. In asynchronous sessions only the
//! computational ranks call the public operations; the I/O ranks run the
//! same collective bodies from [`Pio::serve`].

use std::collections::HashMap;
use std::rc::Rc;

use crate::api::registry::FileRegistry;
use crate::api::types::{FileDesc, Record};
use crate::buffer::{BufferPool, FlushTarget, StagedWrite, flush_all};
use crate::comm::Communicator;
use crate::config::PioConfig;
use crate::constants::{FIRST_FILE_ID, FIRST_IOSYSID, MAX_PATH_LENGTH};
use crate::error::{NO_HANDLE, PioError, PioResult};
use crate::iosystem::{IoSystem, Msg, OpRequest, Outcome, TaskGroup};
use crate::storage::{BackendTable, Dispatcher, IoFormat, MemoryStore, OpenMode, nc};

/// Parallel I/O instance of one rank
///
/// Owns the sessions, the registry of open files and the pool of spare
/// buffer nodes.
pub struct Pio {
    config: PioConfig,
    backends: BackendTable,
    sessions: HashMap<i32, Rc<IoSystem>>,
    next_iosysid: i32,
    /// Lowest file id this rank has not handed out
    next_file_id: i32,
    files: FileRegistry,
    pool: BufferPool,
}

/// Reject paths the request wire cannot carry before anything is sent
fn check_path(path: &str) -> PioResult<()> {
    if path.is_empty() || path.len() > MAX_PATH_LENGTH {
        tracing::error!(
            "Path of {} bytes rejected (limit {})",
            path.len(),
            MAX_PATH_LENGTH
        );
        return Err(PioError::UnsupportedFormat { code: nc::EINVAL });
    }
    Ok(())
}

impl Pio {
    /// Create an instance; backends not enabled in `config` are dropped
    pub fn new(config: PioConfig, backends: BackendTable) -> Self {
        let backends = backends.restrict(&config.backends.enabled);
        let pool = BufferPool::new(config.buffer.pool_preallocate);
        Self {
            config,
            backends,
            sessions: HashMap::new(),
            next_iosysid: FIRST_IOSYSID,
            next_file_id: FIRST_FILE_ID,
            files: FileRegistry::new(),
            pool,
        }
    }

    /// Instance backed by the in-memory store
    pub fn with_memory_store(config: PioConfig, store: &MemoryStore) -> Self {
        Self::new(config, BackendTable::in_memory(store))
    }

    pub fn config(&self) -> &PioConfig {
        &self.config
    }

    pub fn files(&self) -> &FileRegistry {
        &self.files
    }

    pub fn file(&self, handle: i32) -> PioResult<&FileDesc> {
        self.files.lookup(handle)
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn next_file_id(&self) -> i32 {
        self.next_file_id
    }

    pub fn session(&self, iosysid: i32) -> PioResult<Rc<IoSystem>> {
        self.sessions
            .get(&iosysid)
            .cloned()
            .ok_or(PioError::BadSessionId(iosysid))
    }

    fn add_session(&mut self, ios: IoSystem) -> i32 {
        let id = ios.id();
        self.next_iosysid += 1;
        self.sessions.insert(id, Rc::new(ios));
        id
    }

    /// Start a synchronous session where every rank of `comm` does I/O
    pub fn init_intracomm(&mut self, comm: Box<dyn Communicator>) -> PioResult<i32> {
        let ios = IoSystem::intracomm(self.next_iosysid, comm);
        tracing::info!(
            "I/O system {} initialized over {} ranks",
            ios.id(),
            ios.num_io_tasks()
        );
        Ok(self.add_session(ios))
    }

    /// Start an asynchronous session over disjoint computational and I/O
    /// groups; collective over `union_comm`
    pub fn init_intercomm(
        &mut self,
        union_comm: Box<dyn Communicator>,
        group: TaskGroup,
        intercomm: Box<dyn Communicator>,
    ) -> PioResult<i32> {
        let ios = IoSystem::intercomm(self.next_iosysid, union_comm, group, intercomm)?;
        tracing::info!(
            "I/O system {} initialized: {} computational, {} I/O ranks",
            ios.id(),
            ios.num_comp_tasks(),
            ios.num_io_tasks()
        );
        Ok(self.add_session(ios))
    }

    /// End a session
    ///
    /// The computational master tells the I/O group to leave its message
    /// loop. Files still open are dropped along with anything staged.
    pub fn finalize(&mut self, iosysid: i32) -> PioResult<()> {
        let ios = self
            .sessions
            .remove(&iosysid)
            .ok_or(PioError::BadSessionId(iosysid))?;
        for id in self.files.ids_for_session(iosysid) {
            let mut desc = self.files.remove(id)?;
            let dropped = desc.buffers.discard(&self.pool);
            tracing::warn!(
                "File {} ({}) still open at finalize, {} staged writes dropped",
                id,
                desc.path,
                dropped
            );
        }
        ios.send_op_request(Msg::Exit)?;
        tracing::info!("I/O system {} finalized", iosysid);
        Ok(())
    }

    pub fn set_hint(&mut self, iosysid: i32, key: &str, value: &str) -> PioResult<()> {
        self.session(iosysid)?.set_hint(key, value);
        Ok(())
    }

    /// Open an existing file; returns the handle id
    pub fn open(
        &mut self,
        iosysid: i32,
        path: &str,
        format: IoFormat,
        mode: OpenMode,
    ) -> PioResult<i32> {
        let ios = self.session(iosysid)?;
        check_path(path)?;
        ios.forward(Msg::OpenFile, &OpRequest::for_path(path, Some(format), mode))?;
        self.open_collective(&ios, false, path, format, mode)
    }

    /// Create a file, replacing it unless `mode` has `NOCLOBBER`; returns
    /// the handle id
    pub fn create(
        &mut self,
        iosysid: i32,
        path: &str,
        format: IoFormat,
        mode: OpenMode,
    ) -> PioResult<i32> {
        let ios = self.session(iosysid)?;
        check_path(path)?;
        ios.forward(Msg::CreateFile, &OpRequest::for_path(path, Some(format), mode))?;
        self.open_collective(&ios, true, path, format, mode)
    }

    pub(crate) fn open_collective(
        &mut self,
        ios: &Rc<IoSystem>,
        creating: bool,
        path: &str,
        format: IoFormat,
        mode: OpenMode,
    ) -> PioResult<i32> {
        let file_id = ios.agree_file_id(self.next_file_id)?.unwrap_or(NO_HANDLE);
        let mut local_fh = None;
        let local = match ios.io_comm() {
            Some(io) => {
                let dispatcher =
                    Dispatcher::new(&self.backends, io, self.config.buffer.buffer_size_limit);
                let opened = if creating {
                    dispatcher.create(format, path, mode)
                } else {
                    dispatcher.open(format, path, mode)
                };
                opened.map(|o| {
                    local_fh = o.fh;
                    Outcome::opened(file_id, o.format, o.mode)
                })
            }
            None => Ok(Outcome::default()),
        };

        let outcome = ios.settle_outcome(local).inspect_err(|e| {
            tracing::info!(
                "{} of {} as {} failed: {}",
                if creating { "Create" } else { "Open" },
                path,
                format,
                e
            );
        })?;
        let format = IoFormat::from_tag(outcome.format).ok_or(PioError::UnsupportedFormat {
            code: nc::EBADIOTYPE,
        })?;
        let desc = FileDesc::new(
            outcome.handle,
            ios.clone(),
            format,
            OpenMode(outcome.mode),
            path,
            local_fh,
            self.config.buffer.max_vars_per_buffer,
        );
        if let Err(e) = self.files.insert(desc) {
            if let Some(io) = ios.io_comm() {
                let dispatcher =
                    Dispatcher::new(&self.backends, io, self.config.buffer.buffer_size_limit);
                let closed = dispatcher.close(format, local_fh, OpenMode(outcome.mode));
                if let Err(close_err) = closed {
                    tracing::warn!("Closing unregistered {} failed: {}", path, close_err);
                }
            }
            return Err(e);
        }
        self.next_file_id = outcome.handle + 1;
        tracing::info!(
            "{} {} as {} (handle {}, mode {:#x})",
            if creating { "Created" } else { "Opened" },
            path,
            format,
            outcome.handle,
            outcome.mode
        );
        Ok(outcome.handle)
    }

    /// Close a file; write-mode files are synchronized first and stay open
    /// if that fails
    pub fn close(&mut self, handle: i32) -> PioResult<()> {
        let desc = self.files.lookup(handle)?;
        let ios = desc.iosys.clone();
        if desc.is_write() {
            self.sync(handle)?;
        }
        ios.forward(Msg::CloseFile, &OpRequest::for_handle(handle))?;
        self.close_collective(&ios, handle)
    }

    pub(crate) fn close_collective(&mut self, ios: &Rc<IoSystem>, handle: i32) -> PioResult<()> {
        let local = match (self.files.lookup(handle), ios.io_comm()) {
            (Ok(desc), Some(io)) => {
                Dispatcher::new(&self.backends, io, self.config.buffer.buffer_size_limit)
                    .close(desc.format, desc.local_fh, desc.mode)
            }
            (Ok(_), None) => Ok(()),
            (Err(e), _) => Err(e),
        };
        ios.settle(local)?;
        let mut desc = self.files.remove(handle)?;
        desc.buffers.reset(&self.pool);
        tracing::info!("Closed {} (handle {})", desc.path, handle);
        Ok(())
    }

    /// Flush everything staged for a file and synchronize it; a no-op for
    /// files not opened for writing
    pub fn sync(&mut self, handle: i32) -> PioResult<()> {
        let desc = self.files.lookup(handle)?;
        if !desc.is_write() {
            return Ok(());
        }
        let ios = desc.iosys.clone();
        ios.forward(Msg::Sync, &OpRequest::for_handle(handle))?;
        self.sync_collective(&ios, handle)
    }

    pub(crate) fn sync_collective(&mut self, ios: &Rc<IoSystem>, handle: i32) -> PioResult<()> {
        let local = match self.files.lookup_mut(handle) {
            Ok(desc) => {
                let dispatcher = ios.io_comm().map(|io| {
                    Dispatcher::new(&self.backends, io, self.config.buffer.buffer_size_limit)
                });
                let target = FlushTarget {
                    ios: ios.as_ref(),
                    dispatcher: dispatcher.as_ref(),
                    format: desc.format,
                    fh: desc.local_fh,
                };
                let flushed = flush_all(&target, &mut desc.buffers, &self.pool, true);
                desc.clear_pending();
                match (&dispatcher, flushed) {
                    (_, Err(e)) => Err(e),
                    (Some(dispatcher), Ok(())) => dispatcher.sync(desc.format, desc.local_fh),
                    (None, Ok(())) => Ok(()),
                }
            }
            Err(e) => Err(e),
        };
        ios.settle(local)?;
        tracing::debug!("Synchronized handle {}", handle);
        Ok(())
    }

    /// Delete a file by path
    pub fn delete(&mut self, iosysid: i32, path: &str) -> PioResult<()> {
        let ios = self.session(iosysid)?;
        check_path(path)?;
        ios.forward(Msg::DeleteFile, &OpRequest::for_path(path, None, OpenMode::READ))?;
        self.delete_collective(&ios, path)
    }

    pub(crate) fn delete_collective(&self, ios: &Rc<IoSystem>, path: &str) -> PioResult<()> {
        ios.io_barrier()?;
        let local = match ios.io_comm() {
            Some(io) => {
                Dispatcher::new(&self.backends, io, self.config.buffer.buffer_size_limit)
                    .delete(path)
            }
            None => Ok(()),
        };
        if let Err(e) = &local {
            if e.is_fatal() {
                return local;
            }
        }
        ios.io_barrier()?;
        ios.settle(local)?;
        tracing::info!("Deleted {}", path);
        Ok(())
    }

    /// Stage one variable write for a later collective flush
    ///
    /// Local to the calling rank; nothing reaches the backend until
    /// [`Pio::sync`] or [`Pio::close`]. Every rank of the session stages its
    /// writes to a file in the same order, since flushes pair up buffer
    /// nodes by position.
    pub fn write_darray(&mut self, handle: i32, write: StagedWrite) -> PioResult<()> {
        let desc = self.files.lookup_mut(handle)?;
        if !desc.is_write() {
            return Err(PioError::ReadOnly(handle));
        }
        let slot = desc.slot_mut(write.var_id);
        if let Some(frame) = write.frame {
            slot.record = Record::At(frame);
        }
        if let Some(fill) = &write.fill {
            slot.fill = Some(fill.clone());
        }
        slot.pending += 1;
        tracing::trace!(
            "Staged variable {} (decomposition {}, {} bytes) on handle {}",
            write.var_id,
            write.decomp_id,
            write.data.len(),
            handle
        );
        desc.buffers.stage(write, &self.pool);
        Ok(())
    }

    /// Record the dimensionality of a variable
    pub fn declare_var(&mut self, handle: i32, var_id: i32, ndims: usize) -> PioResult<()> {
        let desc = self.files.lookup_mut(handle)?;
        desc.slot_mut(var_id).ndims = Some(ndims);
        Ok(())
    }
}
