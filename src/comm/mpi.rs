//! MPI transport through the `mpi` crate
//!
//! Requires the `mpi` feature and an MPI installation. The caller
//! initializes MPI (`mpi::initialize()`), builds the union, group and
//! intercommunicators, and hands each one to [`MpiComm::new`].
//!
//! All calls go through the raw handle so the same wrapper serves intra- and
//! intercommunicators; broadcast roles map onto `MPI_ROOT` and
//! `MPI_PROC_NULL`.

use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_void};

use mpi::datatype::Equivalence;
use mpi::ffi;
use mpi::raw::AsRaw;

use super::{CommError, CommResult, Communicator, Root};

/// Wrapper over any `mpi` communicator (intra or inter)
pub struct MpiComm<C> {
    comm: C,
    rank: i32,
    size: i32,
    remote_size: i32,
}

impl<C: AsRaw<Raw = ffi::MPI_Comm>> MpiComm<C> {
    pub fn new(comm: C) -> CommResult<Self> {
        let raw = comm.as_raw();
        let mut rank: c_int = 0;
        let mut size: c_int = 0;
        let mut inter: c_int = 0;
        let mut remote_size: c_int = 0;
        unsafe {
            check(ffi::MPI_Comm_rank(raw, &mut rank), "MPI_Comm_rank")?;
            check(ffi::MPI_Comm_size(raw, &mut size), "MPI_Comm_size")?;
            check(ffi::MPI_Comm_test_inter(raw, &mut inter), "MPI_Comm_test_inter")?;
            if inter != 0 {
                check(
                    ffi::MPI_Comm_remote_size(raw, &mut remote_size),
                    "MPI_Comm_remote_size",
                )?;
            }
        }
        Ok(Self {
            comm,
            rank,
            size,
            remote_size,
        })
    }

    fn raw(&self) -> ffi::MPI_Comm {
        self.comm.as_raw()
    }
}

fn check(code: c_int, call: &str) -> CommResult<()> {
    if code == ffi::MPI_SUCCESS as c_int {
        Ok(())
    } else {
        Err(CommError::Protocol(format!("{} returned {}", call, code)))
    }
}

/// Reserved (negative) tags are moved to the top of the range every MPI
/// implementation must support
fn wire_tag(tag: i32) -> c_int {
    const TAG_UB_MIN: c_int = 32767;
    if tag < 0 { TAG_UB_MIN + 1 + tag } else { tag }
}

/// Elements moved by the payload broadcast for a rank in role `root`
fn payload_count(root: Root, len: u64) -> c_int {
    match root {
        Root::Null => 0,
        Root::Rank(_) | Root::Local => len as c_int,
    }
}

fn byte_type() -> ffi::MPI_Datatype {
    u8::equivalent_datatype().as_raw()
}

impl<C: AsRaw<Raw = ffi::MPI_Comm>> Communicator for MpiComm<C> {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.size
    }

    fn remote_size(&self) -> i32 {
        self.remote_size
    }

    fn barrier(&self) -> CommResult<()> {
        let code = unsafe { ffi::MPI_Barrier(self.raw()) };
        check(code, "MPI_Barrier").map_err(|e| CommError::BarrierFailed(e.to_string()))
    }

    fn send_bytes(&self, dest: i32, tag: i32, data: &[u8]) -> CommResult<()> {
        let code = unsafe {
            ffi::MPI_Send(
                data.as_ptr() as *const c_void,
                data.len() as c_int,
                byte_type(),
                dest,
                wire_tag(tag),
                self.raw(),
            )
        };
        check(code, "MPI_Send").map_err(|e| CommError::SendFailed {
            dest,
            reason: e.to_string(),
        })
    }

    fn receive_bytes(&self, source: i32, tag: i32) -> CommResult<Vec<u8>> {
        let fail = |e: CommError| CommError::ReceiveFailed {
            from: source,
            reason: e.to_string(),
        };
        let mut status = MaybeUninit::<ffi::MPI_Status>::uninit();
        let mut count: c_int = 0;
        unsafe {
            check(
                ffi::MPI_Probe(source, wire_tag(tag), self.raw(), status.as_mut_ptr()),
                "MPI_Probe",
            )
            .map_err(fail)?;
            check(
                ffi::MPI_Get_count(status.as_ptr(), byte_type(), &mut count),
                "MPI_Get_count",
            )
            .map_err(fail)?;
        }
        let mut buf = vec![0u8; count.max(0) as usize];
        let code = unsafe {
            ffi::MPI_Recv(
                buf.as_mut_ptr() as *mut c_void,
                count,
                byte_type(),
                source,
                wire_tag(tag),
                self.raw(),
                status.as_mut_ptr(),
            )
        };
        check(code, "MPI_Recv").map_err(fail)?;
        Ok(buf)
    }

    fn broadcast_bytes(&self, buf: &mut Vec<u8>, root: Root) -> CommResult<()> {
        let root_arg = match root {
            Root::Rank(r) => r,
            Root::Local => unsafe { ffi::RSMPI_ROOT },
            Root::Null => unsafe { ffi::RSMPI_PROC_NULL },
        };
        let receiving = match root {
            Root::Rank(r) => self.remote_size > 0 || r != self.rank,
            Root::Local | Root::Null => false,
        };

        // Length first, then payload
        let mut len = buf.len() as u64;
        let code = unsafe {
            ffi::MPI_Bcast(
                &mut len as *mut u64 as *mut c_void,
                1,
                u64::equivalent_datatype().as_raw(),
                root_arg,
                self.raw(),
            )
        };
        check(code, "MPI_Bcast").map_err(|e| CommError::BroadcastFailed(e.to_string()))?;
        if receiving {
            buf.resize(len as usize, 0);
        }
        // Null ranks still take part in both broadcasts; their buffer is
        // never touched
        let count = payload_count(root, len);
        let code = unsafe {
            ffi::MPI_Bcast(
                buf.as_mut_ptr() as *mut c_void,
                count,
                byte_type(),
                root_arg,
                self.raw(),
            )
        };
        check(code, "MPI_Bcast").map_err(|e| CommError::BroadcastFailed(e.to_string()))
    }
}
