//! Per-file pending-write buffers
//!
//! A [`BufferChain`] owns a head node that lives as long as the file, plus
//! chained nodes borrowed from a [`BufferPool`]. Writes are staged locally;
//! [`flush::flush_all`] drains the chain collectively.

pub mod flush;
pub mod pool;

pub use flush::{FlushTarget, flush_all, flush_node};
pub use pool::BufferPool;

use crate::storage::VarRecord;

/// One variable write handed over by the rearranger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedWrite {
    pub var_id: i32,
    /// Decomposition the payload was rearranged with
    pub decomp_id: i32,
    /// Record index, `None` for variables without a record dimension
    pub frame: Option<i64>,
    /// This rank's share of the variable
    pub data: Vec<u8>,
    pub fill: Option<Vec<u8>>,
}

/// A batch of staged writes sharing one decomposition
#[derive(Debug, Default)]
pub struct WriteBuffer {
    decomp_id: Option<i32>,
    var_ids: Vec<i32>,
    frames: Vec<Option<i64>>,
    fill_values: Vec<Option<Vec<u8>>>,
    data: Vec<Vec<u8>>,
}

impl WriteBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            decomp_id: None,
            var_ids: Vec::with_capacity(capacity),
            frames: Vec::with_capacity(capacity),
            fill_values: Vec::with_capacity(capacity),
            data: Vec::with_capacity(capacity),
        }
    }

    /// Number of valid pending variables
    pub fn valid_vars(&self) -> usize {
        self.var_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.var_ids.is_empty()
    }

    pub fn decomp_id(&self) -> Option<i32> {
        self.decomp_id
    }

    pub fn var_ids(&self) -> &[i32] {
        &self.var_ids
    }

    /// Bytes staged in this node
    pub fn byte_len(&self) -> usize {
        self.data.iter().map(Vec::len).sum()
    }

    fn accepts(&self, decomp_id: i32, capacity: usize) -> bool {
        self.is_empty() || (self.decomp_id == Some(decomp_id) && self.valid_vars() < capacity)
    }

    fn push(&mut self, write: StagedWrite) {
        self.decomp_id = Some(write.decomp_id);
        self.var_ids.push(write.var_id);
        self.frames.push(write.frame);
        self.fill_values.push(write.fill);
        self.data.push(write.data);
    }

    /// Staged writes as backend records, in staging order
    pub fn records(&self) -> Vec<VarRecord> {
        (0..self.valid_vars())
            .map(|i| VarRecord {
                var_id: self.var_ids[i],
                frame: self.frames[i],
                data: self.data[i].clone(),
                fill: self.fill_values[i].clone(),
            })
            .collect()
    }

    /// Drop every staged write, keeping allocations
    pub fn reset(&mut self) {
        self.decomp_id = None;
        self.var_ids.clear();
        self.frames.clear();
        self.fill_values.clear();
        self.data.clear();
    }
}

/// Observable state of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Idle,
    Accumulating,
}

/// Head node plus chained nodes of one file
#[derive(Debug)]
pub struct BufferChain {
    head: WriteBuffer,
    chained: Vec<WriteBuffer>,
    capacity: usize,
}

impl BufferChain {
    pub fn new(capacity: usize) -> Self {
        Self {
            head: WriteBuffer::with_capacity(capacity),
            chained: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn head(&self) -> &WriteBuffer {
        &self.head
    }

    pub fn chained_len(&self) -> usize {
        self.chained.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Head first, then chained nodes in order
    pub fn nodes(&self) -> impl Iterator<Item = &WriteBuffer> {
        std::iter::once(&self.head).chain(self.chained.iter())
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut WriteBuffer> {
        std::iter::once(&mut self.head).chain(self.chained.iter_mut())
    }

    pub fn pending_vars(&self) -> usize {
        self.nodes().map(WriteBuffer::valid_vars).sum()
    }

    pub fn state(&self) -> ChainState {
        if self.nodes().all(WriteBuffer::is_empty) {
            ChainState::Idle
        } else {
            ChainState::Accumulating
        }
    }

    /// Stage a write into the first node that takes it, growing the chain
    /// from `pool` when none does
    pub fn stage(&mut self, write: StagedWrite, pool: &BufferPool) {
        let capacity = self.capacity;
        if self.head.accepts(write.decomp_id, capacity) {
            self.head.push(write);
            return;
        }
        if let Some(node) = self
            .chained
            .iter_mut()
            .find(|n| !n.is_empty() && n.accepts(write.decomp_id, capacity))
        {
            node.push(write);
            return;
        }
        let mut node = pool.acquire(capacity);
        tracing::trace!(
            "Chaining buffer node {} for decomposition {}",
            self.chained.len() + 1,
            write.decomp_id
        );
        node.push(write);
        self.chained.push(node);
    }

    /// Reset the head and return every chained node to `pool`
    pub fn reset(&mut self, pool: &BufferPool) {
        self.head.reset();
        for node in self.chained.drain(..) {
            pool.release(node);
        }
    }

    /// Drop everything staged, returning chained nodes to `pool`
    pub fn discard(&mut self, pool: &BufferPool) -> usize {
        let dropped = self.pending_vars();
        self.reset(pool);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(var_id: i32, decomp_id: i32) -> StagedWrite {
        StagedWrite {
            var_id,
            decomp_id,
            frame: Some(0),
            data: vec![var_id as u8; 4],
            fill: None,
        }
    }

    #[test]
    fn test_stage_fills_head_first() {
        let pool = BufferPool::new(0);
        let mut chain = BufferChain::new(4);
        assert_eq!(chain.state(), ChainState::Idle);
        for v in 0..3 {
            chain.stage(write(v, 1), &pool);
        }
        assert_eq!(chain.state(), ChainState::Accumulating);
        assert_eq!(chain.head().valid_vars(), 3);
        assert_eq!(chain.chained_len(), 0);
        assert_eq!(chain.head().byte_len(), 12);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_stage_chains_on_capacity_and_decomposition() {
        let pool = BufferPool::new(1);
        let mut chain = BufferChain::new(2);
        chain.stage(write(1, 1), &pool);
        chain.stage(write(2, 1), &pool);
        // head full
        chain.stage(write(3, 1), &pool);
        // other decomposition
        chain.stage(write(4, 2), &pool);
        // fits the node opened for var 3
        chain.stage(write(5, 1), &pool);

        assert_eq!(chain.chained_len(), 2);
        assert_eq!(chain.pending_vars(), 5);
        let ids: Vec<Vec<i32>> = chain.nodes().map(|n| n.var_ids().to_vec()).collect();
        assert_eq!(ids, vec![vec![1, 2], vec![3, 5], vec![4]]);
        assert_eq!(pool.outstanding(), 2);
    }

    #[test]
    fn test_reset_keeps_head_and_returns_nodes() {
        let pool = BufferPool::new(0);
        let mut chain = BufferChain::new(1);
        for v in 0..4 {
            chain.stage(write(v, 1), &pool);
        }
        assert_eq!(pool.outstanding(), 3);
        chain.reset(&pool);
        assert_eq!(chain.state(), ChainState::Idle);
        assert_eq!(chain.chained_len(), 0);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 3);

        // Released nodes come back empty
        chain.stage(write(7, 1), &pool);
        chain.stage(write(8, 1), &pool);
        assert_eq!(pool.available(), 2);
        assert_eq!(chain.nodes().nth(1).unwrap().var_ids(), &[8]);
    }

    #[test]
    fn test_records_keep_staging_order() {
        let mut node = WriteBuffer::default();
        node.push(write(9, 3));
        node.push(StagedWrite {
            fill: Some(vec![0]),
            frame: None,
            ..write(4, 3)
        });
        let records = node.records();
        assert_eq!(records[0].var_id, 9);
        assert_eq!(records[1].frame, None);
        assert_eq!(records[1].fill, Some(vec![0]));
        node.reset();
        assert!(node.is_empty());
        assert_eq!(node.decomp_id(), None);
    }
}
