//! In-process communicator
//!
//! Every rank is a thread of the same process. Each world rank owns a
//! mailbox; sends enqueue into the destination mailbox and never block,
//! receives block until a matching envelope (communicator context, source,
//! tag) arrives. Matching takes the oldest envelope, so messages between one
//! pair of ranks on one communicator and tag are delivered in order.
//!
//! Collectives (barrier, broadcast, gather) are built from point-to-point
//! messages on reserved negative tags.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{CommError, CommResult, Communicator, Root, tags};

/// Context id of the world communicator
pub const WORLD_CONTEXT: u32 = 0;

/// Upper bound on a single blocking receive before reporting a deadlock
pub const DEFAULT_RECEIVE_GUARD: Duration = Duration::from_secs(60);

struct Envelope {
    context: u32,
    source: usize,
    tag: i32,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    arrived: Condvar,
}

struct Fabric {
    mailboxes: Vec<Mailbox>,
}

/// Communicator whose ranks are threads sharing one fabric
pub struct LocalComm {
    fabric: Arc<Fabric>,
    context: u32,
    world_rank: usize,
    /// World ranks of the local group, indexed by group rank
    local: Arc<[usize]>,
    /// World ranks of the remote group (intercommunicators only)
    remote: Option<Arc<[usize]>>,
    rank: i32,
    receive_guard: Duration,
}

impl LocalComm {
    /// Create a world of `size` ranks; element `i` belongs to rank `i`
    pub fn world(size: usize) -> Vec<LocalComm> {
        let fabric = Arc::new(Fabric {
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
        });
        let members: Arc<[usize]> = (0..size).collect();
        (0..size)
            .map(|rank| LocalComm {
                fabric: fabric.clone(),
                context: WORLD_CONTEXT,
                world_rank: rank,
                local: members.clone(),
                remote: None,
                rank: rank as i32,
                receive_guard: DEFAULT_RECEIVE_GUARD,
            })
            .collect()
    }

    /// Build a communicator over `members` (ranks of `self`)
    ///
    /// Returns `None` on ranks that are not members. Every member must pass
    /// the same list and the same `context`, which must not be in use by any
    /// other communicator of this fabric.
    pub fn subgroup(&self, members: &[i32], context: u32) -> Option<LocalComm> {
        let world: Arc<[usize]> = self.translate(members).ok()?.into();
        let rank = world.iter().position(|&w| w == self.world_rank)?;
        Some(LocalComm {
            fabric: self.fabric.clone(),
            context,
            world_rank: self.world_rank,
            local: world,
            remote: None,
            rank: rank as i32,
            receive_guard: self.receive_guard,
        })
    }

    /// Build an intercommunicator between `local_members` (which must
    /// contain the caller) and `remote_members`, both given as ranks of
    /// `self`
    pub fn intercomm(
        &self,
        local_members: &[i32],
        remote_members: &[i32],
        context: u32,
    ) -> Option<LocalComm> {
        let mut comm = self.subgroup(local_members, context)?;
        comm.remote = Some(self.translate(remote_members).ok()?.into());
        Some(comm)
    }

    /// Duplicate this communicator under a fresh context
    pub fn duplicate(&self, context: u32) -> LocalComm {
        LocalComm {
            fabric: self.fabric.clone(),
            context,
            world_rank: self.world_rank,
            local: self.local.clone(),
            remote: self.remote.clone(),
            rank: self.rank,
            receive_guard: self.receive_guard,
        }
    }

    /// Override the deadlock guard applied to blocking receives
    pub fn with_receive_guard(mut self, guard: Duration) -> Self {
        self.receive_guard = guard;
        self
    }

    fn translate(&self, ranks: &[i32]) -> CommResult<Vec<usize>> {
        ranks
            .iter()
            .map(|&r| {
                self.local
                    .get(r as usize)
                    .copied()
                    .filter(|_| r >= 0)
                    .ok_or(CommError::InvalidRank {
                        rank: r,
                        size: self.local.len() as i32,
                    })
            })
            .collect()
    }

    /// Group that point-to-point ranks refer to
    fn peers(&self) -> &[usize] {
        self.remote.as_deref().unwrap_or(&*self.local)
    }

    fn peer(&self, rank: i32) -> CommResult<usize> {
        let peers = self.peers();
        if rank < 0 || rank as usize >= peers.len() {
            return Err(CommError::InvalidRank {
                rank,
                size: peers.len() as i32,
            });
        }
        Ok(peers[rank as usize])
    }

    fn post(&self, world_dest: usize, tag: i32, data: &[u8]) {
        let mailbox = &self.fabric.mailboxes[world_dest];
        mailbox.queue.lock().push_back(Envelope {
            context: self.context,
            source: self.world_rank,
            tag,
            payload: data.to_vec(),
        });
        mailbox.arrived.notify_all();
    }

    fn take(&self, world_source: usize, tag: i32) -> CommResult<Vec<u8>> {
        let mailbox = &self.fabric.mailboxes[self.world_rank];
        let deadline = Instant::now() + self.receive_guard;
        let mut queue = mailbox.queue.lock();
        loop {
            let found = queue.iter().position(|e| {
                e.context == self.context && e.source == world_source && e.tag == tag
            });
            if let Some(index) = found {
                if let Some(envelope) = queue.remove(index) {
                    return Ok(envelope.payload);
                }
            }
            if mailbox.arrived.wait_until(&mut queue, deadline).timed_out() {
                tracing::error!(
                    "Rank {} (world {}) gave up waiting for world rank {} tag {}",
                    self.rank,
                    self.world_rank,
                    world_source,
                    tag
                );
                return Err(CommError::Timeout);
            }
        }
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.local.len() as i32
    }

    fn remote_size(&self) -> i32 {
        self.remote.as_ref().map(|r| r.len() as i32).unwrap_or(0)
    }

    fn barrier(&self) -> CommResult<()> {
        if self.is_inter() {
            return Err(CommError::BarrierFailed(
                "barrier on an intercommunicator is not supported".to_string(),
            ));
        }
        let size = self.size();
        if self.rank == 0 {
            for r in 1..size {
                self.take(self.local[r as usize], tags::BARRIER_ARRIVE)?;
            }
            for r in 1..size {
                self.post(self.local[r as usize], tags::BARRIER_RELEASE, &[]);
            }
        } else {
            self.post(self.local[0], tags::BARRIER_ARRIVE, &[]);
            self.take(self.local[0], tags::BARRIER_RELEASE)?;
        }
        Ok(())
    }

    fn send_bytes(&self, dest: i32, tag: i32, data: &[u8]) -> CommResult<()> {
        let world_dest = self.peer(dest)?;
        self.post(world_dest, tag, data);
        Ok(())
    }

    fn receive_bytes(&self, source: i32, tag: i32) -> CommResult<Vec<u8>> {
        let world_source = self.peer(source)?;
        self.take(world_source, tag)
    }

    fn broadcast_bytes(&self, buf: &mut Vec<u8>, root: Root) -> CommResult<()> {
        match (self.remote.as_deref(), root) {
            (None, Root::Rank(r)) => {
                if r == self.rank {
                    for (i, &member) in self.local.iter().enumerate() {
                        if i as i32 != r {
                            self.post(member, tags::BROADCAST, buf);
                        }
                    }
                } else {
                    let source = self.peer(r)?;
                    *buf = self.take(source, tags::BROADCAST)?;
                }
                Ok(())
            }
            (Some(remote), Root::Local) => {
                for &member in remote {
                    self.post(member, tags::BROADCAST, buf);
                }
                Ok(())
            }
            (Some(_), Root::Null) => Ok(()),
            (Some(_), Root::Rank(r)) => {
                let source = self.peer(r)?;
                *buf = self.take(source, tags::BROADCAST)?;
                Ok(())
            }
            (None, role) => Err(CommError::BroadcastFailed(format!(
                "role {:?} is only valid on an intercommunicator",
                role
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run<F>(comms: Vec<LocalComm>, f: F)
    where
        F: Fn(LocalComm) + Sync,
    {
        let f = &f;
        thread::scope(|s| {
            for comm in comms {
                s.spawn(move || f(comm));
            }
        });
    }

    #[test]
    fn test_world_ranks() {
        let world = LocalComm::world(3);
        for (i, comm) in world.iter().enumerate() {
            assert_eq!(comm.rank(), i as i32);
            assert_eq!(comm.size(), 3);
            assert!(!comm.is_inter());
        }
    }

    #[test]
    fn test_broadcast_and_barrier() {
        run(LocalComm::world(4), |comm| {
            let mut buf = if comm.rank() == 2 {
                b"grid".to_vec()
            } else {
                Vec::new()
            };
            comm.broadcast_bytes(&mut buf, Root::Rank(2)).unwrap();
            assert_eq!(buf, b"grid");

            let mut values = [comm.rank(), -1];
            comm.broadcast_i32s(&mut values, Root::Rank(0)).unwrap();
            assert_eq!(values, [0, -1]);

            comm.barrier().unwrap();
        });
    }

    #[test]
    fn test_messages_stay_ordered() {
        run(LocalComm::world(2), |comm| {
            if comm.rank() == 0 {
                for v in 0..5 {
                    comm.send_i32(1, 7, v).unwrap();
                }
            } else {
                let got: Vec<i32> = (0..5).map(|_| comm.receive_i32(0, 7).unwrap()).collect();
                assert_eq!(got, vec![0, 1, 2, 3, 4]);
            }
        });
    }

    #[test]
    fn test_gather() {
        run(LocalComm::world(3), |comm| {
            let data = vec![comm.rank() as u8; comm.rank() as usize + 1];
            let gathered = comm.gather_bytes(&data, 1).unwrap();
            if comm.rank() == 1 {
                assert_eq!(
                    gathered.unwrap(),
                    vec![vec![0u8], vec![1, 1], vec![2, 2, 2]]
                );
            } else {
                assert!(gathered.is_none());
            }
        });
    }

    #[test]
    fn test_intercomm_broadcast() {
        run(LocalComm::world(4), |world| {
            let comp = [0, 1];
            let io = [2, 3];
            let is_comp = world.rank() < 2;
            let inter = if is_comp {
                world.intercomm(&comp, &io, 5).unwrap()
            } else {
                world.intercomm(&io, &comp, 5).unwrap()
            };
            assert_eq!(inter.remote_size(), 2);

            let mut buf = b"params".to_vec();
            if is_comp {
                let role = if inter.rank() == 0 { Root::Local } else { Root::Null };
                inter.broadcast_bytes(&mut buf, role).unwrap();
            } else {
                buf.clear();
                inter.broadcast_bytes(&mut buf, Root::Rank(0)).unwrap();
                assert_eq!(buf, b"params");
            }
        });
    }

    #[test]
    fn test_subgroup_membership() {
        let world = LocalComm::world(4);
        assert!(world[0].subgroup(&[2, 3], 9).is_none());
        let sub = world[3].subgroup(&[2, 3], 9).unwrap();
        assert_eq!(sub.rank(), 1);
        assert_eq!(sub.size(), 2);
        assert!(world[0].subgroup(&[0, 7], 9).is_none());
    }

    #[test]
    fn test_receive_guard() {
        let world = LocalComm::world(2);
        let comm = world[0].duplicate(3).with_receive_guard(Duration::from_millis(20));
        assert!(matches!(comm.receive_bytes(1, 1), Err(CommError::Timeout)));
    }
}
