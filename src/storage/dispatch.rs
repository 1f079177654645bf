//! Backend dispatch with per-format call discipline and open fallback
//!
//! A [`Dispatcher`] is built on I/O ranks only, over the I/O communicator.
//! Each format has a named policy deciding the mode bits OR-ed in before the
//! call, where the call runs (I/O master only or collectively) and whether
//! a write-aggregation buffer is attached. For master-only formats the
//! status is broadcast over the I/O communicator after every attempt, so
//! every I/O rank takes the same branch (fallback or not) afterwards.

use crate::comm::{Communicator, Root};
use crate::error::{PioError, PioResult};

use super::{BackendResult, BackendStatus, BackendTable, BatchWrite, IoFormat, OpenMode, StorageBackend, nc};

/// Result of a successful open or create on this rank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    /// Backend handle on this rank, `None` where the format does not run
    pub fh: Option<i32>,
    /// Format actually used (after fallback)
    pub format: IoFormat,
    /// Mode after capability bits were applied
    pub mode: OpenMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    IoMaster,
    Collective,
}

#[derive(Debug, Clone, Copy)]
struct Policy {
    mode: OpenMode,
    placement: Placement,
    attach_buffer: bool,
}

fn placement(format: IoFormat) -> Placement {
    if format.is_serial() {
        Placement::IoMaster
    } else {
        Placement::Collective
    }
}

/// Shared behavior of the classic-compatible formats
fn classic_policy(mode: OpenMode) -> Policy {
    Policy {
        mode,
        placement: Placement::IoMaster,
        attach_buffer: false,
    }
}

fn classic_extended_policy(mode: OpenMode) -> Policy {
    classic_policy(mode | OpenMode::EXTENDED)
}

fn parallel_policy(mode: OpenMode, creating: bool) -> Policy {
    let mode = if creating {
        mode | OpenMode::MPIIO | OpenMode::EXTENDED
    } else {
        mode | OpenMode::MPIIO
    };
    Policy {
        mode,
        placement: Placement::Collective,
        attach_buffer: false,
    }
}

fn collective_buffered_policy(mode: OpenMode, creating: bool) -> Policy {
    Policy {
        mode,
        placement: Placement::Collective,
        attach_buffer: creating || mode.is_write(),
    }
}

fn policy(format: IoFormat, mode: OpenMode, creating: bool) -> Policy {
    match format {
        IoFormat::Classic => classic_policy(mode),
        IoFormat::ClassicExtended => classic_extended_policy(mode),
        IoFormat::Parallel => parallel_policy(mode, creating),
        IoFormat::CollectiveBuffered => collective_buffered_policy(mode, creating),
    }
}

fn local_handle(fh: Option<i32>) -> BackendResult<i32> {
    fh.ok_or(BackendStatus(nc::EBADID))
}

/// Routes operations to the backend of a format over the I/O communicator
pub struct Dispatcher<'a> {
    backends: &'a BackendTable,
    io: &'a dyn Communicator,
    buffer_limit: usize,
}

impl<'a> Dispatcher<'a> {
    pub fn new(backends: &'a BackendTable, io: &'a dyn Communicator, buffer_limit: usize) -> Self {
        Self {
            backends,
            io,
            buffer_limit,
        }
    }

    /// Run `op` where the placement says and agree on the status
    fn place<T, F>(&self, placement: Placement, op: F) -> PioResult<Option<T>>
    where
        F: FnOnce() -> BackendResult<T>,
    {
        match placement {
            Placement::Collective => Ok(Some(op()?)),
            Placement::IoMaster => {
                let mut value = None;
                let mut code = [nc::NOERR];
                if self.io.rank() == 0 {
                    match op() {
                        Ok(v) => value = Some(v),
                        Err(status) => code[0] = status.code(),
                    }
                }
                self.io.broadcast_i32s(&mut code, Root::Rank(0))?;
                if code[0] != nc::NOERR {
                    return Err(BackendStatus(code[0]).into());
                }
                Ok(value)
            }
        }
    }

    /// Open with a one-shot fallback to the classic format
    pub fn open(&self, format: IoFormat, path: &str, mode: OpenMode) -> PioResult<Opened> {
        match self.try_open(format, path, mode) {
            Err(e) if e.is_fallback_eligible() && format != IoFormat::Classic => {
                tracing::warn!(
                    "Open of {} as {} failed ({}), retrying as {}",
                    path,
                    format,
                    e,
                    IoFormat::Classic
                );
                self.try_open(IoFormat::Classic, path, mode)
            }
            result => result,
        }
    }

    fn try_open(&self, format: IoFormat, path: &str, mode: OpenMode) -> PioResult<Opened> {
        let policy = policy(format, mode, false);
        let backend = self.backends.get(format)?;
        let fh = self.place(policy.placement, || backend.open(path, policy.mode, self.io))?;
        if policy.attach_buffer {
            self.attach(backend, fh)?;
        }
        tracing::debug!("Opened {} as {} (local fh {:?})", path, format, fh);
        Ok(Opened {
            fh,
            format,
            mode: policy.mode,
        })
    }

    /// Create; there is no fallback and the result is always in write mode
    pub fn create(&self, format: IoFormat, path: &str, mode: OpenMode) -> PioResult<Opened> {
        let policy = policy(format, mode, true);
        let backend = self.backends.get(format)?;
        let fh = self.place(policy.placement, || backend.create(path, policy.mode, self.io))?;
        if policy.attach_buffer {
            self.attach(backend, fh)?;
        }
        tracing::debug!("Created {} as {} (local fh {:?})", path, format, fh);
        Ok(Opened {
            fh,
            format,
            mode: policy.mode | OpenMode::WRITE,
        })
    }

    fn attach(&self, backend: &dyn StorageBackend, fh: Option<i32>) -> PioResult<()> {
        let fh = local_handle(fh)?;
        if let Err(status) = backend.attach_buffer(fh, self.buffer_limit, self.io) {
            tracing::error!("Attaching {} byte buffer failed: {}", self.buffer_limit, status);
            if let Err(close_status) = backend.close(fh, self.io) {
                tracing::warn!("Close after failed attach also failed: {}", close_status);
            }
            return Err(status.into());
        }
        tracing::debug!("Attached {} byte aggregation buffer to fh {}", self.buffer_limit, fh);
        Ok(())
    }

    /// Close; the attached buffer of a collective-buffered write file is
    /// detached first, and a detach failure is only reported
    pub fn close(&self, format: IoFormat, fh: Option<i32>, mode: OpenMode) -> PioResult<()> {
        let backend = self.backends.get(format)?;
        if format == IoFormat::CollectiveBuffered && mode.is_write() {
            let detached = local_handle(fh).and_then(|fh| backend.detach_buffer(fh, self.io));
            if let Err(status) = detached {
                tracing::warn!("Detaching aggregation buffer failed: {}", status);
            }
        }
        self.place(placement(format), || backend.close(local_handle(fh)?, self.io))?;
        Ok(())
    }

    pub fn sync(&self, format: IoFormat, fh: Option<i32>) -> PioResult<()> {
        let backend = self.backends.get(format)?;
        self.place(placement(format), || backend.sync(local_handle(fh)?, self.io))?;
        Ok(())
    }

    /// Delete through the preferred available format
    pub fn delete(&self, path: &str) -> PioResult<()> {
        let format = self.backends.delete_format().ok_or(PioError::UnsupportedFormat {
            code: nc::EBADIOTYPE,
        })?;
        let backend = self.backends.get(format)?;
        self.place(placement(format), || backend.delete(path, self.io))?;
        Ok(())
    }

    /// Write a merged batch
    ///
    /// Only the I/O master holds data; other I/O ranks of collective formats
    /// pass an empty batch. On collective-buffered files the master checks
    /// whether the batch fits the attached buffer and, if not, every I/O rank
    /// flushes the attached buffer before writing.
    pub fn write(&self, format: IoFormat, fh: Option<i32>, batch: &BatchWrite) -> PioResult<()> {
        let backend = self.backends.get(format)?;
        if format == IoFormat::CollectiveBuffered {
            let mut overflow = [0];
            if self.io.rank() == 0 {
                let usage = fh.map(|fh| backend.buffer_usage(fh)).unwrap_or(0);
                overflow[0] = (usage + batch.byte_len() > self.buffer_limit) as i32;
            }
            self.io.broadcast_i32s(&mut overflow, Root::Rank(0))?;
            if overflow[0] != 0 {
                tracing::debug!("Attached buffer full, flushing before write");
                self.drain(format, fh)?;
            }
        }
        self.place(placement(format), || backend.write_batch(local_handle(fh)?, batch, self.io))?;
        Ok(())
    }

    /// Push out everything queued in the backend's attached buffer
    pub fn drain(&self, format: IoFormat, fh: Option<i32>) -> PioResult<()> {
        if format != IoFormat::CollectiveBuffered {
            return Ok(());
        }
        let backend = self.backends.get(format)?;
        backend.flush_buffer(local_handle(fh)?, self.io)?;
        Ok(())
    }
}
