//! pario self-check
//!
//! Runs a write/sync/reopen/close/delete cycle over in-process ranks and
//! verifies the in-memory store afterwards.
//!
//! Usage:
//!   All ranks do I/O:     pario_check --ranks 4 --format parallel
//!   Split topology:       pario_check --ranks 6 --io-ranks 2 --format collective-buffered

use std::process::ExitCode;
use std::thread;

use clap::Parser;

use pario::comm::{CommError, Communicator, LocalComm};
use pario::logging::{init_with_rank, set_thread_rank};
use pario::storage::MemoryStore;
use pario::{IoFormat, OpenMode, Pio, PioConfig, PioResult, StagedWrite, TaskGroup};

const COMP_CONTEXT: u32 = 10;
const IO_CONTEXT: u32 = 11;
const INTER_CONTEXT: u32 = 12;
const PATH: &str = "pario_check.nc";

/// pario self-check
#[derive(Parser, Debug)]
#[command(name = "pario_check")]
#[command(about = "Exercise the pario file lifecycle over in-process ranks")]
struct Args {
    /// Total number of ranks
    #[arg(long, default_value = "4")]
    ranks: usize,

    /// Ranks dedicated to I/O; 0 runs every rank as both computational
    /// and I/O task
    #[arg(long, default_value = "0")]
    io_ranks: usize,

    /// Backend format
    #[arg(long, default_value = "classic")]
    format: IoFormat,

    /// Variables written by each computational rank
    #[arg(long, default_value = "8")]
    vars: i32,

    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

fn staged(var_id: i32, rank: i32) -> StagedWrite {
    StagedWrite {
        var_id,
        decomp_id: 1,
        frame: Some(0),
        data: vec![rank as u8; 4],
        fill: None,
    }
}

/// The cycle as run by ranks calling the public operations
fn run_client(pio: &mut Pio, iosysid: i32, rank: i32, args: &Args) -> PioResult<()> {
    let fh = pio.create(iosysid, PATH, args.format, OpenMode::WRITE)?;
    for var_id in 0..args.vars {
        pio.write_darray(fh, staged(var_id, rank))?;
    }
    pio.sync(fh)?;
    pio.close(fh)?;

    let fh = pio.open(iosysid, PATH, args.format, OpenMode::READ)?;
    let opened_as = pio.file(fh)?.format;
    if opened_as != args.format {
        tracing::warn!("{} reopened as {}", PATH, opened_as);
    }
    pio.close(fh)?;
    pio.delete(iosysid, PATH)?;
    pio.finalize(iosysid)
}

fn run_rank(comm: LocalComm, store: MemoryStore, config: PioConfig, args: &Args) -> PioResult<()> {
    let rank = comm.rank();
    set_thread_rank(rank);
    let mut pio = Pio::with_memory_store(config, &store);

    if args.io_ranks == 0 {
        let iosysid = pio.init_intracomm(Box::new(comm))?;
        return run_client(&mut pio, iosysid, rank, args);
    }

    let split = (args.ranks - args.io_ranks) as i32;
    let comp: Vec<i32> = (0..split).collect();
    let io: Vec<i32> = (split..args.ranks as i32).collect();
    let io_task = rank >= split;
    let (group, inter) = if io_task {
        (
            comm.subgroup(&io, IO_CONTEXT).map(|c| TaskGroup::Io(Box::new(c))),
            comm.intercomm(&io, &comp, INTER_CONTEXT),
        )
    } else {
        (
            comm.subgroup(&comp, COMP_CONTEXT)
                .map(|c| TaskGroup::Computation(Box::new(c))),
            comm.intercomm(&comp, &io, INTER_CONTEXT),
        )
    };
    let (Some(group), Some(inter)) = (group, inter) else {
        return Err(CommError::Protocol(format!("rank {} is in neither group", rank)).into());
    };
    let iosysid = pio.init_intercomm(Box::new(comm), group, Box::new(inter))?;
    if io_task {
        pio.serve(iosysid)?;
        return pio.finalize(iosysid);
    }
    run_client(&mut pio, iosysid, rank, args)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match PioConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        },
        None => PioConfig::default(),
    };
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.log_level.clone());
    init_with_rank(&level, None);

    if args.ranks == 0 || args.io_ranks >= args.ranks {
        eprintln!(
            "need at least one computational rank (ranks {}, io-ranks {})",
            args.ranks, args.io_ranks
        );
        return ExitCode::FAILURE;
    }

    let store = MemoryStore::new();
    let results: Vec<Option<PioResult<()>>> = thread::scope(|s| {
        let handles: Vec<_> = LocalComm::world(args.ranks)
            .into_iter()
            .map(|comm| {
                let store = store.clone();
                let config = config.clone();
                let args = &args;
                s.spawn(move || run_rank(comm, store, config, args))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().ok())
            .collect()
    });

    let mut failed = false;
    for (rank, result) in results.iter().enumerate() {
        match result {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                tracing::error!("Rank {} failed: {} (status {})", rank, e, e.status());
                failed = true;
            }
            None => {
                tracing::error!("Rank {} panicked", rank);
                failed = true;
            }
        }
    }
    if store.exists(PATH) {
        tracing::error!("{} still exists after delete", PATH);
        failed = true;
    }
    if failed {
        return ExitCode::FAILURE;
    }
    tracing::info!(
        "Check passed: {} ranks ({} I/O), format {}, {} variables per rank",
        args.ranks,
        if args.io_ranks == 0 { args.ranks } else { args.io_ranks },
        args.format,
        args.vars
    );
    ExitCode::SUCCESS
}
