//! Communication substrate
//!
//! Abstraction over the collective-communication layer used by the I/O
//! system. Implementations: [`LocalComm`] (in-process, threads as ranks) and
//! `MpiComm` (behind the `mpi` feature).

pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;

pub use local::LocalComm;
#[cfg(feature = "mpi")]
pub use self::mpi::MpiComm;

use zerocopy::IntoBytes;

/// Communication errors
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("Send to rank {dest} failed: {reason}")]
    SendFailed { dest: i32, reason: String },

    #[error("Receive from rank {from} failed: {reason}")]
    ReceiveFailed { from: i32, reason: String },

    #[error("Broadcast failed: {0}")]
    BroadcastFailed(String),

    #[error("Barrier failed: {0}")]
    BarrierFailed(String),

    #[error("Rank {rank} out of range (group size {size})")]
    InvalidRank { rank: i32, size: i32 },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Peer reported communication failure ({0})")]
    Remote(i32),

    #[error("Timed out waiting for peer")]
    Timeout,
}

pub type CommResult<T> = Result<T, CommError>;

/// Broadcast role of the calling rank
///
/// On an intracommunicator every rank passes `Rank(root)`. On an
/// intercommunicator the root of the sending group passes `Local`, the other
/// members of the sending group pass `Null`, and every member of the
/// receiving group passes `Rank(root)` naming the root in the remote group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Root {
    Rank(i32),
    Local,
    Null,
}

/// Tags reserved for collectives built from point-to-point messages
pub mod tags {
    pub const BROADCAST: i32 = -100;
    pub const BARRIER_ARRIVE: i32 = -101;
    pub const BARRIER_RELEASE: i32 = -102;
    pub const GATHER: i32 = -103;
}

/// A communicator over a group of ranks (or a pair of groups for
/// intercommunicators)
pub trait Communicator {
    /// Rank of the caller in its local group
    fn rank(&self) -> i32;

    /// Size of the local group
    fn size(&self) -> i32;

    /// Size of the remote group, 0 for intracommunicators
    fn remote_size(&self) -> i32;

    fn is_inter(&self) -> bool {
        self.remote_size() > 0
    }

    fn barrier(&self) -> CommResult<()>;

    /// Send bytes; `dest` names a remote-group rank on intercommunicators
    fn send_bytes(&self, dest: i32, tag: i32, data: &[u8]) -> CommResult<()>;

    /// Blocking receive; `source` names a remote-group rank on intercommunicators
    fn receive_bytes(&self, source: i32, tag: i32) -> CommResult<Vec<u8>>;

    /// Broadcast a variable-length buffer; receivers get the root's contents
    fn broadcast_bytes(&self, buf: &mut Vec<u8>, root: Root) -> CommResult<()>;

    fn send_i32(&self, dest: i32, tag: i32, value: i32) -> CommResult<()> {
        self.send_bytes(dest, tag, value.as_bytes())
    }

    fn receive_i32(&self, source: i32, tag: i32) -> CommResult<i32> {
        let bytes = self.receive_bytes(source, tag)?;
        let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
            CommError::Protocol(format!("expected 4 bytes, got {}", bytes.len()))
        })?;
        Ok(i32::from_ne_bytes(raw))
    }

    /// Broadcast a fixed-size array of integers in place
    fn broadcast_i32s(&self, values: &mut [i32], root: Root) -> CommResult<()> {
        let mut buf = values.as_bytes().to_vec();
        self.broadcast_bytes(&mut buf, root)?;
        if matches!(root, Root::Local | Root::Null) {
            return Ok(());
        }
        let expected = std::mem::size_of_val(values);
        if buf.len() != expected {
            return Err(CommError::Protocol(format!(
                "broadcast of {} integers delivered {} bytes",
                values.len(),
                buf.len()
            )));
        }
        values.as_mut_bytes().copy_from_slice(&buf);
        Ok(())
    }

    /// Gather one buffer per rank at `root` (intracommunicators only)
    ///
    /// Returns the buffers in rank order on the root, `None` elsewhere.
    fn gather_bytes(&self, data: &[u8], root: i32) -> CommResult<Option<Vec<Vec<u8>>>> {
        if self.rank() != root {
            self.send_bytes(root, tags::GATHER, data)?;
            return Ok(None);
        }
        let mut gathered = Vec::with_capacity(self.size() as usize);
        for source in 0..self.size() {
            if source == root {
                gathered.push(data.to_vec());
            } else {
                gathered.push(self.receive_bytes(source, tags::GATHER)?);
            }
        }
        Ok(Some(gathered))
    }

    /// Largest of every rank's `local` value, known at `root` only
    fn gather_max_i32(&self, local: i32, root: i32) -> CommResult<Option<i32>> {
        let Some(parts) = self.gather_bytes(local.as_bytes(), root)? else {
            return Ok(None);
        };
        let mut max = local;
        for part in parts {
            let raw: [u8; 4] = part.as_slice().try_into().map_err(|_| {
                CommError::Protocol(format!("expected 4 bytes, got {}", part.len()))
            })?;
            max = max.max(i32::from_ne_bytes(raw));
        }
        Ok(Some(max))
    }
}
