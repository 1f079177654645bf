use std::cell::{Cell, RefCell};

use super::WriteBuffer;

/// Free list of chained buffer nodes
///
/// Nodes are handed out by value and must come back through
/// [`BufferPool::release`]; `outstanding` counts nodes currently lent out, so
/// a leak shows up as a non-zero count once every chain is idle.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: RefCell<Vec<WriteBuffer>>,
    outstanding: Cell<usize>,
}

impl BufferPool {
    pub fn new(preallocate: usize) -> Self {
        let mut free = Vec::with_capacity(preallocate);
        for _ in 0..preallocate {
            free.push(WriteBuffer::default());
        }
        Self {
            free: RefCell::new(free),
            outstanding: Cell::new(0),
        }
    }

    /// Take an empty node. If the pool is empty a new node is allocated.
    pub fn acquire(&self, capacity: usize) -> WriteBuffer {
        let node = self
            .free
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| WriteBuffer::with_capacity(capacity));
        self.outstanding.set(self.outstanding.get() + 1);
        node
    }

    pub fn release(&self, mut node: WriteBuffer) {
        node.reset();
        self.free.borrow_mut().push(node);
        self.outstanding.set(self.outstanding.get().saturating_sub(1));
    }

    /// Nodes lent out and not yet returned
    pub fn outstanding(&self) -> usize {
        self.outstanding.get()
    }

    /// Nodes ready to be handed out
    pub fn available(&self) -> usize {
        self.free.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let pool = BufferPool::new(2);
        assert_eq!(pool.available(), 2);
        let a = pool.acquire(8);
        let b = pool.acquire(8);
        let c = pool.acquire(8);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.outstanding(), 3);
        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 3);
    }
}
