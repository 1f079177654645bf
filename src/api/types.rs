//! Per-file state shared by the public operations

use std::collections::HashMap;
use std::rc::Rc;

use crate::buffer::BufferChain;
use crate::iosystem::IoSystem;
use crate::storage::{IoFormat, OpenMode};

/// Last record written for a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Record {
    #[default]
    Unset,
    At(i64),
}

/// Bookkeeping for one variable of an open file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarSlot {
    pub record: Record,
    /// Dimensionality, once declared
    pub ndims: Option<usize>,
    /// Writes staged and not yet flushed
    pub pending: usize,
    /// Fill value of the last staged write that carried one
    pub fill: Option<Vec<u8>>,
}

/// An open file as seen by one rank
#[derive(Debug)]
pub struct FileDesc {
    /// Handle id agreed by every rank of the session
    pub id: i32,
    pub iosys: Rc<IoSystem>,
    pub format: IoFormat,
    pub mode: OpenMode,
    pub path: String,
    /// Backend handle on this rank, `None` where the backend does not run
    pub(crate) local_fh: Option<i32>,
    pub(crate) vars: HashMap<i32, VarSlot>,
    pub(crate) buffers: BufferChain,
}

impl FileDesc {
    pub fn new(
        id: i32,
        iosys: Rc<IoSystem>,
        format: IoFormat,
        mode: OpenMode,
        path: &str,
        local_fh: Option<i32>,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            id,
            iosys,
            format,
            mode,
            path: path.to_string(),
            local_fh,
            vars: HashMap::new(),
            buffers: BufferChain::new(buffer_capacity),
        }
    }

    pub fn is_write(&self) -> bool {
        self.mode.is_write()
    }

    pub fn session_id(&self) -> i32 {
        self.iosys.id()
    }

    pub fn local_fh(&self) -> Option<i32> {
        self.local_fh
    }

    pub fn var(&self, var_id: i32) -> Option<&VarSlot> {
        self.vars.get(&var_id)
    }

    pub(crate) fn slot_mut(&mut self, var_id: i32) -> &mut VarSlot {
        self.vars.entry(var_id).or_default()
    }

    pub fn buffers(&self) -> &BufferChain {
        &self.buffers
    }

    /// Staged writes were handed to the backend
    pub(crate) fn clear_pending(&mut self) {
        for slot in self.vars.values_mut() {
            slot.pending = 0;
        }
    }
}
