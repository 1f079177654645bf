//! Collective flush of buffer chains
//!
//! Every rank of the session calls [`flush_all`] together. The ranks first
//! agree on how many non-empty nodes to flush, then for each node the I/O
//! master collects every rank's share, merges them into one batch and the
//! I/O group issues a single backend write. A node is always drained as a
//! whole; nodes with nothing staged never reach the backend.
//!
//! Shares are matched by node position, so every rank must stage its writes
//! in the same order (same variables and decompositions). Staging the same
//! variable and frame at different positions on different ranks turns into
//! separate writes of that record, the last one winning.

use zerocopy::{FromBytes, IntoBytes};

use super::{BufferChain, BufferPool, WriteBuffer};
use crate::comm::{CommError, Communicator, Root};
use crate::constants::NODE_TAG;
use crate::error::{PioError, PioResult};
use crate::iosystem::IoSystem;
use crate::iosystem::protocol::{decode_node, encode_node};
use crate::storage::{BatchWrite, Dispatcher, IoFormat};

/// Where flushed data goes
pub struct FlushTarget<'a> {
    pub ios: &'a IoSystem,
    /// Present on I/O ranks only
    pub dispatcher: Option<&'a Dispatcher<'a>>,
    pub format: IoFormat,
    /// Backend handle on this rank
    pub fh: Option<i32>,
}

/// Largest of every rank's `local` value, known on every rank of `comm`
fn max_over(comm: &dyn Communicator, local: i32) -> PioResult<i32> {
    let mut value = [comm.gather_max_i32(local, 0)?.unwrap_or(local)];
    comm.broadcast_i32s(&mut value, Root::Rank(0))?;
    Ok(value[0])
}

/// Agree on the number of nodes to flush
///
/// Ranks staging data take the largest node count among them; ranks with
/// fewer nodes contribute empty shares. In asynchronous sessions the
/// computational master then announces the count to the I/O group (which
/// holds no staged data there).
fn agree_node_count(ios: &IoSystem, local: usize) -> PioResult<usize> {
    if ios.is_async() {
        if ios.is_io_task() {
            let buf = ios.receive_from_comp()?;
            let count = u32::read_from_bytes(&buf)
                .map_err(|_| CommError::Protocol(format!("node count of {} bytes", buf.len())))?;
            return Ok(count as usize);
        }
        let count = match ios.comp_comm() {
            Some(comp) => max_over(comp, local as i32)?,
            None => local as i32,
        };
        let count = count.max(0) as u32;
        let mut buf = count.as_bytes().to_vec();
        ios.broadcast_to_io(&mut buf)?;
        return Ok(count as usize);
    }
    let io = ios
        .io_comm()
        .ok_or_else(|| CommError::Protocol("not an I/O task".to_string()))?;
    let mut count = [max_over(io, local as i32)?];
    ios.broadcast_from_io(&mut count)?;
    Ok(count[0].max(0) as usize)
}

/// Gather every rank's share of one node at the I/O master
fn collect(ios: &IoSystem, node: Option<&WriteBuffer>) -> PioResult<Option<BatchWrite>> {
    let bytes = match node {
        Some(node) => encode_node(node.decomp_id(), &node.records()),
        None => encode_node(None, &[]),
    };

    let parts = if ios.is_async() {
        let inter = ios
            .inter_comm()
            .ok_or_else(|| CommError::Protocol("missing intercommunicator".to_string()))?;
        if !ios.is_io_task() {
            inter.send_bytes(0, NODE_TAG, &bytes)?;
            return Ok(None);
        }
        if !ios.is_io_master() {
            return Ok(None);
        }
        let mut parts = Vec::with_capacity(inter.remote_size() as usize);
        for source in 0..inter.remote_size() {
            parts.push(inter.receive_bytes(source, NODE_TAG)?);
        }
        parts
    } else {
        let io = ios
            .io_comm()
            .ok_or_else(|| CommError::Protocol("not an I/O task".to_string()))?;
        match io.gather_bytes(&bytes, 0)? {
            Some(parts) => parts,
            None => return Ok(None),
        }
    };

    let mut batch = BatchWrite::default();
    for part in parts {
        for record in decode_node(&part)? {
            batch.merge(record);
        }
    }
    Ok(Some(batch))
}

/// Flush one node (or this rank's empty share of it) and reset it
pub fn flush_node(target: &FlushTarget<'_>, node: Option<&mut WriteBuffer>) -> PioResult<()> {
    let batch = collect(target.ios, node.as_deref())?;
    let result = match target.dispatcher {
        Some(dispatcher) => {
            let batch = batch.unwrap_or_default();
            if !batch.is_empty() {
                tracing::debug!(
                    "Writing {} variables ({} bytes) as {}",
                    batch.len(),
                    batch.byte_len(),
                    target.format
                );
            }
            dispatcher.write(target.format, target.fh, &batch)
        }
        None => Ok(()),
    };
    if let Some(node) = node {
        node.reset();
    }
    result
}

/// Drain the whole chain; with `is_final` also flush the backend's attached
/// aggregation buffer
///
/// Backend errors are remembered and the remaining nodes are still flushed
/// so every rank stays in step; the first one is returned. Communication
/// errors abort immediately. The chain is left idle with only its head.
pub fn flush_all(
    target: &FlushTarget<'_>,
    chain: &mut BufferChain,
    pool: &BufferPool,
    is_final: bool,
) -> PioResult<()> {
    let local = chain.nodes().filter(|n| !n.is_empty()).count();
    let count = agree_node_count(target.ios, local)?;

    let mut first_err: Option<PioError> = None;
    let mut record = |result: PioResult<()>| -> PioResult<()> {
        match result {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::error!("Flush failed: {}", e);
                first_err.get_or_insert(e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    };

    {
        let mut nodes = chain.nodes_mut().filter(|n| !n.is_empty());
        for _ in 0..count {
            record(flush_node(target, nodes.next()))?;
        }
    }
    if is_final {
        if let Some(dispatcher) = target.dispatcher {
            record(dispatcher.drain(target.format, target.fh))?;
        }
    }

    chain.reset(pool);
    tracing::debug!("Flushed {} buffer nodes (final: {})", count, is_final);
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
