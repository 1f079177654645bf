//! Helpers shared by the multi-rank integration tests

#![allow(dead_code)]

use std::thread;

use pario::comm::{Communicator, LocalComm};
use pario::storage::MemoryStore;
use pario::{Pio, PioConfig, PioResult, StagedWrite, TaskGroup};

pub const COMP_CONTEXT: u32 = 10;
pub const IO_CONTEXT: u32 = 11;
pub const INTER_CONTEXT: u32 = 12;

/// Run `f` once per rank of a fresh world, each rank on its own thread;
/// results come back in rank order
pub fn run_world<F, T>(size: usize, f: F) -> Vec<T>
where
    F: Fn(LocalComm) -> T + Sync,
    T: Send,
{
    thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = LocalComm::world(size)
            .into_iter()
            .map(|comm| s.spawn(move || f(comm)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    })
}

/// Synchronous session over every rank of `comm`
pub fn intracomm_session(comm: LocalComm, store: &MemoryStore) -> (Pio, i32) {
    let mut pio = Pio::with_memory_store(PioConfig::default(), store);
    let iosysid = pio.init_intracomm(Box::new(comm)).expect("init_intracomm");
    (pio, iosysid)
}

/// Asynchronous session where the last `io_ranks` ranks of `comm` do I/O
///
/// Returns the instance, the session id and whether this rank is an I/O
/// task.
pub fn split_session(
    comm: LocalComm,
    io_ranks: usize,
    config: PioConfig,
    store: &MemoryStore,
) -> PioResult<(Pio, i32, bool)> {
    let size = comm.size();
    let split = size - io_ranks as i32;
    let comp: Vec<i32> = (0..split).collect();
    let io: Vec<i32> = (split..size).collect();
    let io_task = comm.rank() >= split;
    let (group, inter) = if io_task {
        (
            TaskGroup::Io(Box::new(comm.subgroup(&io, IO_CONTEXT).expect("io group"))),
            comm.intercomm(&io, &comp, INTER_CONTEXT).expect("intercomm"),
        )
    } else {
        (
            TaskGroup::Computation(Box::new(
                comm.subgroup(&comp, COMP_CONTEXT).expect("comp group"),
            )),
            comm.intercomm(&comp, &io, INTER_CONTEXT).expect("intercomm"),
        )
    };
    let mut pio = Pio::with_memory_store(config, store);
    let iosysid = pio.init_intercomm(Box::new(comm), group, Box::new(inter))?;
    Ok((pio, iosysid, io_task))
}

/// A write of `len` bytes valued `rank` to frame 0 of `var_id`
pub fn staged(var_id: i32, rank: i32, len: usize) -> StagedWrite {
    StagedWrite {
        var_id,
        decomp_id: 1,
        frame: Some(0),
        data: vec![rank as u8; len],
        fill: None,
    }
}

/// What the store holds for `var_id` after every rank in `ranks` staged
/// [`staged`]`(var_id, rank, len)`
pub fn merged(ranks: impl IntoIterator<Item = i32>, len: usize) -> Vec<u8> {
    ranks
        .into_iter()
        .flat_map(|rank| std::iter::repeat_n(rank as u8, len))
        .collect()
}
