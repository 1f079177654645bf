//! I/O-system topology and message router
//!
//! An [`IoSystem`] records which communicators a rank holds, which role it
//! plays and where the masters of both groups sit in the union
//! communicator. It also implements the request/broadcast protocol used
//! when computational and I/O ranks run disjoint code paths:
//!
//! 1. the computational master sends the opcode to the I/O master over the
//!    union communicator ([`IoSystem::send_op_request`])
//! 2. the computational group broadcasts the parameters to the I/O group
//!    over the intercommunicator ([`IoSystem::forward`])
//! 3. I/O ranks pick both up ([`IoSystem::next_message`],
//!    [`IoSystem::receive_request`]) and run the backend call collectively
//!
//! Whatever the topology, the result is broadcast from the I/O master over
//! the union communicator afterwards ([`IoSystem::settle`]).

pub mod handler;
pub mod protocol;

pub use protocol::{Msg, OpRequest, Outcome};

use std::cell::RefCell;
use std::collections::BTreeMap;

use zerocopy::IntoBytes;

use crate::comm::{CommError, CommResult, Communicator, Root};
use crate::constants::MSG_TAG;
use crate::error::PioResult;

/// The group a rank belongs to in a split topology, with its communicator
pub enum TaskGroup {
    Computation(Box<dyn Communicator>),
    Io(Box<dyn Communicator>),
}

/// One initialized I/O session as seen by one rank
pub struct IoSystem {
    id: i32,
    union_comm: Box<dyn Communicator>,
    io_comm: Option<Box<dyn Communicator>>,
    comp_comm: Option<Box<dyn Communicator>>,
    intercomm: Option<Box<dyn Communicator>>,
    io_task: bool,
    async_interface: bool,
    /// Union ranks of the two masters
    io_root: i32,
    comp_root: i32,
    num_io_tasks: i32,
    num_comp_tasks: i32,
    hints: RefCell<BTreeMap<String, String>>,
}

impl std::fmt::Debug for IoSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSystem")
            .field("id", &self.id)
            .field("union_rank", &self.union_comm.rank())
            .field("io_task", &self.io_task)
            .field("async", &self.async_interface)
            .field("io_root", &self.io_root)
            .field("comp_root", &self.comp_root)
            .finish()
    }
}

impl IoSystem {
    /// Synchronous session: every rank is both computational and I/O
    pub fn intracomm(id: i32, comm: Box<dyn Communicator>) -> Self {
        let size = comm.size();
        Self {
            id,
            union_comm: comm,
            io_comm: None,
            comp_comm: None,
            intercomm: None,
            io_task: true,
            async_interface: false,
            io_root: 0,
            comp_root: 0,
            num_io_tasks: size,
            num_comp_tasks: size,
            hints: RefCell::new(BTreeMap::new()),
        }
    }

    /// Asynchronous session over disjoint computational and I/O groups
    ///
    /// Collective over the union communicator: the masters' union ranks
    /// are exchanged across the intercommunicator.
    pub fn intercomm(
        id: i32,
        union_comm: Box<dyn Communicator>,
        group: TaskGroup,
        intercomm: Box<dyn Communicator>,
    ) -> PioResult<Self> {
        if !intercomm.is_inter() {
            return Err(CommError::Protocol(
                "split topology needs an intercommunicator".to_string(),
            )
            .into());
        }
        let (group_comm, io_task) = match group {
            TaskGroup::Computation(comm) => (comm, false),
            TaskGroup::Io(comm) => (comm, true),
        };

        // This group's master announces its union rank inside the group,
        // then the masters swap across the intercommunicator (computational
        // side first).
        let mut own_root = [union_comm.rank()];
        group_comm.broadcast_i32s(&mut own_root, Root::Rank(0))?;
        let send_role = if group_comm.rank() == 0 {
            Root::Local
        } else {
            Root::Null
        };
        let mut remote_root = [-1];
        if io_task {
            intercomm.broadcast_i32s(&mut remote_root, Root::Rank(0))?;
            intercomm.broadcast_i32s(&mut own_root, send_role)?;
        } else {
            intercomm.broadcast_i32s(&mut own_root, send_role)?;
            intercomm.broadcast_i32s(&mut remote_root, Root::Rank(0))?;
        }
        let (io_root, comp_root) = if io_task {
            (own_root[0], remote_root[0])
        } else {
            (remote_root[0], own_root[0])
        };
        let (num_io_tasks, num_comp_tasks) = if io_task {
            (group_comm.size(), intercomm.remote_size())
        } else {
            (intercomm.remote_size(), group_comm.size())
        };
        let (io_comm, comp_comm) = if io_task {
            (Some(group_comm), None)
        } else {
            (None, Some(group_comm))
        };

        tracing::debug!(
            "I/O system {}: union rank {} is {} task, io_root {}, comp_root {}",
            id,
            union_comm.rank(),
            if io_task { "an I/O" } else { "a computational" },
            io_root,
            comp_root
        );

        Ok(Self {
            id,
            union_comm,
            io_comm,
            comp_comm,
            intercomm: Some(intercomm),
            io_task,
            async_interface: true,
            io_root,
            comp_root,
            num_io_tasks,
            num_comp_tasks,
            hints: RefCell::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn is_async(&self) -> bool {
        self.async_interface
    }

    pub fn is_io_task(&self) -> bool {
        self.io_task
    }

    pub fn union_comm(&self) -> &dyn Communicator {
        self.union_comm.as_ref()
    }

    /// I/O communicator, `None` on computational-only ranks
    pub fn io_comm(&self) -> Option<&dyn Communicator> {
        if !self.io_task {
            return None;
        }
        Some(self.io_comm.as_deref().unwrap_or(self.union_comm.as_ref()))
    }

    /// Computational communicator of a split topology
    pub fn comp_comm(&self) -> Option<&dyn Communicator> {
        self.comp_comm.as_deref()
    }

    pub fn inter_comm(&self) -> Option<&dyn Communicator> {
        self.intercomm.as_deref()
    }

    pub fn union_rank(&self) -> i32 {
        self.union_comm.rank()
    }

    pub fn io_rank(&self) -> Option<i32> {
        self.io_comm().map(|c| c.rank())
    }

    pub fn comp_rank(&self) -> Option<i32> {
        if self.async_interface {
            self.comp_comm.as_ref().map(|c| c.rank())
        } else {
            Some(self.union_comm.rank())
        }
    }

    pub fn io_root(&self) -> i32 {
        self.io_root
    }

    pub fn comp_root(&self) -> i32 {
        self.comp_root
    }

    pub fn is_io_master(&self) -> bool {
        self.io_rank() == Some(0)
    }

    pub fn is_comp_master(&self) -> bool {
        self.comp_rank() == Some(0)
    }

    pub fn num_io_tasks(&self) -> i32 {
        self.num_io_tasks
    }

    pub fn num_comp_tasks(&self) -> i32 {
        self.num_comp_tasks
    }

    pub fn set_hint(&self, key: &str, value: &str) {
        self.hints
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
    }

    pub fn hint(&self, key: &str) -> Option<String> {
        self.hints.borrow().get(key).cloned()
    }

    /// Send the opcode to the I/O master (computational master only,
    /// asynchronous sessions only)
    pub fn send_op_request(&self, msg: Msg) -> CommResult<()> {
        if !self.async_interface || self.io_task || !self.is_comp_master() {
            return Ok(());
        }
        tracing::trace!("Sending {:?} to I/O master (union rank {})", msg, self.io_root);
        self.union_comm.send_i32(self.io_root, MSG_TAG, msg as i32)
    }

    /// Broadcast bytes from the computational master to every I/O rank
    ///
    /// Called by computational ranks; a no-op outside asynchronous sessions.
    pub fn broadcast_to_io(&self, buf: &mut Vec<u8>) -> CommResult<()> {
        if !self.async_interface || self.io_task {
            return Ok(());
        }
        let inter = self
            .inter_comm()
            .ok_or_else(|| CommError::Protocol("missing intercommunicator".to_string()))?;
        let role = if self.is_comp_master() {
            Root::Local
        } else {
            Root::Null
        };
        inter.broadcast_bytes(buf, role)
    }

    /// Receive what [`IoSystem::broadcast_to_io`] sent (I/O ranks only)
    pub fn receive_from_comp(&self) -> CommResult<Vec<u8>> {
        let inter = self
            .inter_comm()
            .ok_or_else(|| CommError::Protocol("missing intercommunicator".to_string()))?;
        let mut buf = Vec::new();
        inter.broadcast_bytes(&mut buf, Root::Rank(0))?;
        Ok(buf)
    }

    /// Phases one and two of the protocol on computational ranks
    pub fn forward(&self, msg: Msg, request: &OpRequest) -> CommResult<()> {
        if !self.async_interface || self.io_task {
            return Ok(());
        }
        self.send_op_request(msg)?;
        let mut buf = request.encode();
        self.broadcast_to_io(&mut buf)
    }

    /// Parameters of the operation announced by the computational group
    pub fn receive_request(&self) -> CommResult<OpRequest> {
        OpRequest::decode(&self.receive_from_comp()?)
    }

    /// Next opcode, received by the I/O master and shared with the I/O group
    pub fn next_message(&self) -> CommResult<Msg> {
        let io = self
            .io_comm()
            .ok_or_else(|| CommError::Protocol("not an I/O task".to_string()))?;
        let mut code = [0];
        if io.rank() == 0 {
            code[0] = self.union_comm.receive_i32(self.comp_root, MSG_TAG)?;
        }
        io.broadcast_i32s(&mut code, Root::Rank(0))?;
        Msg::from_i32(code[0])
            .ok_or_else(|| CommError::Protocol(format!("unknown message {}", code[0])))
    }

    /// Barrier over the I/O communicator (no-op on computational ranks)
    pub fn io_barrier(&self) -> CommResult<()> {
        match self.io_comm() {
            Some(io) => io.barrier(),
            None => Ok(()),
        }
    }

    /// Broadcast integers from the I/O master to every rank of the union
    pub fn broadcast_from_io(&self, values: &mut [i32]) -> CommResult<()> {
        self.union_comm.broadcast_i32s(values, Root::Rank(self.io_root))
    }

    /// Collect every rank's proposed file id at the I/O master
    ///
    /// Collective over the union communicator. The I/O master gets the
    /// largest proposal, which is free on every rank since each rank
    /// proposes the lowest id above everything it has handed out.
    pub fn agree_file_id(&self, proposal: i32) -> CommResult<Option<i32>> {
        self.union_comm.gather_max_i32(proposal, self.io_root)
    }

    /// Make every rank observe the I/O master's outcome
    ///
    /// Communication faults are returned on the spot without broadcasting.
    pub fn settle_outcome(&self, local: PioResult<Outcome>) -> PioResult<Outcome> {
        let mine = match local {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => Outcome::failed(&e),
        };
        let mut buf = mine.as_bytes().to_vec();
        self.union_comm
            .broadcast_bytes(&mut buf, Root::Rank(self.io_root))?;
        Outcome::decode(&buf)?.into_result()
    }

    pub fn settle(&self, local: PioResult<()>) -> PioResult<()> {
        self.settle_outcome(local.map(|()| Outcome::default()))
            .map(|_| ())
    }
}
