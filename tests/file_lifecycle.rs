//! File lifecycle over synchronous sessions with several ranks
//!
//! Every rank runs on its own thread over the in-process communicator and
//! shares one in-memory store.

mod common;

use common::{intracomm_session, merged, run_world, staged};
use pario::buffer::ChainState;
use pario::comm::Communicator;
use pario::error::status;
use pario::storage::memory::StoreOp;
use pario::storage::{MemoryStore, nc};
use pario::{IoFormat, OpenMode, Pio, PioConfig, PioError, StagedWrite};

const RANKS: usize = 3;

#[test]
fn test_create_stage_sync_close_collective_buffered() {
    let store = MemoryStore::new();
    run_world(RANKS, |comm| {
        let rank = comm.rank();
        let (mut pio, iosysid) = intracomm_session(comm, &store);

        let fh = pio
            .create(iosysid, "grid.dat", IoFormat::CollectiveBuffered, OpenMode::WRITE)
            .unwrap();
        assert!(pio.files().contains(fh));

        for var_id in 0..3 {
            pio.write_darray(fh, staged(var_id, rank, 4)).unwrap();
        }
        assert_eq!(
            pio.file(fh).unwrap().buffers().state(),
            ChainState::Accumulating
        );

        pio.sync(fh).unwrap();
        let desc = pio.file(fh).unwrap();
        assert_eq!(desc.buffers().state(), ChainState::Idle);
        assert_eq!(desc.buffers().pending_vars(), 0);
        for var_id in 0..3 {
            assert_eq!(
                store.record("grid.dat", var_id, Some(0)),
                Some(merged(0..RANKS as i32, 4))
            );
        }

        pio.close(fh).unwrap();
        assert!(!pio.files().contains(fh));
        pio.finalize(iosysid).unwrap();
    });
}

#[test]
fn test_open_missing_file_leaves_registry_untouched() {
    let store = MemoryStore::new();
    run_world(RANKS, |comm| {
        let (mut pio, iosysid) = intracomm_session(comm, &store);
        let err = pio
            .open(iosysid, "missing.dat", IoFormat::Parallel, OpenMode::READ)
            .unwrap_err();
        assert_eq!(err.status(), status::EBACKEND);
        assert_eq!(err.raw_code(), Some(nc::ENOENT));
        assert!(pio.files().is_empty());
    });
}

#[test]
fn test_sequential_creates_get_distinct_handles() {
    let store = MemoryStore::new();
    run_world(RANKS, |comm| {
        let (mut pio, iosysid) = intracomm_session(comm, &store);
        let first = pio
            .create(iosysid, "same.dat", IoFormat::Classic, OpenMode::WRITE)
            .unwrap();
        let second = pio
            .create(iosysid, "same.dat", IoFormat::Classic, OpenMode::WRITE)
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(pio.files().len(), 2);
        pio.close(first).unwrap();
        assert!(pio.files().contains(second));
        pio.close(second).unwrap();
    });
}

#[test]
fn test_open_close_round_trip_every_format() {
    let store = MemoryStore::new();
    store.insert_file("classic.nc", false);
    store.insert_file("extended.nc", true);
    run_world(2, |comm| {
        let (mut pio, iosysid) = intracomm_session(comm, &store);
        for format in IoFormat::ALL {
            for mode in [OpenMode::READ, OpenMode::WRITE] {
                for path in ["classic.nc", "extended.nc"] {
                    let fh = pio.open(iosysid, path, format, mode).unwrap();
                    assert_eq!(pio.file(fh).unwrap().is_write(), mode.is_write());
                    pio.close(fh).unwrap();
                    assert!(
                        !pio.files().contains(fh),
                        "{} as {} left handle {}",
                        path,
                        format,
                        fh
                    );
                }
            }
        }
    });
}

#[test]
fn test_incompatible_format_falls_back_to_classic() {
    let store = MemoryStore::new();
    store.insert_file("classic.nc", false);
    store.insert_file("extended.nc", true);
    run_world(2, |comm| {
        let (mut pio, iosysid) = intracomm_session(comm, &store);

        let fh = pio
            .open(iosysid, "classic.nc", IoFormat::Parallel, OpenMode::WRITE)
            .unwrap();
        let desc = pio.file(fh).unwrap();
        assert_eq!(desc.format, IoFormat::Classic);
        assert_eq!(desc.mode, OpenMode::WRITE);
        pio.close(fh).unwrap();

        let fh = pio
            .open(iosysid, "extended.nc", IoFormat::CollectiveBuffered, OpenMode::READ)
            .unwrap();
        assert_eq!(pio.file(fh).unwrap().format, IoFormat::Classic);
        pio.close(fh).unwrap();

        let fh = pio
            .open(iosysid, "extended.nc", IoFormat::Parallel, OpenMode::READ)
            .unwrap();
        let desc = pio.file(fh).unwrap();
        assert_eq!(desc.format, IoFormat::Parallel);
        assert!(desc.mode.contains(OpenMode::MPIIO));
        pio.close(fh).unwrap();
    });
}

#[test]
fn test_failed_fallback_reports_classic_error() {
    let store = MemoryStore::new();
    store.insert_file("classic.nc", false);
    store.fail_next(StoreOp::Open, IoFormat::Classic, nc::ENOMEM);
    run_world(2, |comm| {
        let (mut pio, iosysid) = intracomm_session(comm, &store);
        let err = pio
            .open(iosysid, "classic.nc", IoFormat::Parallel, OpenMode::READ)
            .unwrap_err();
        assert!(matches!(err, PioError::OutOfMemory));
        assert_eq!(err.status(), status::ENOMEM);
        assert!(pio.files().is_empty());
    });
}

/// Stage `vars` variables on `path` and close, with or without an explicit
/// sync first
fn write_and_close(
    pio: &mut Pio,
    iosysid: i32,
    rank: i32,
    path: &str,
    format: IoFormat,
    explicit_sync: bool,
) {
    let fh = pio.create(iosysid, path, format, OpenMode::WRITE).unwrap();
    for var_id in 0..10 {
        pio.write_darray(fh, staged(var_id, rank, 3)).unwrap();
    }
    if explicit_sync {
        pio.sync(fh).unwrap();
    }
    pio.close(fh).unwrap();
}

#[test]
fn test_close_syncs_implicitly() {
    let store = MemoryStore::new();
    run_world(RANKS, |comm| {
        let rank = comm.rank();
        let (mut pio, iosysid) = intracomm_session(comm, &store);
        for format in IoFormat::ALL {
            let implicit = format!("implicit-{}.nc", format);
            let explicit = format!("explicit-{}.nc", format);
            write_and_close(&mut pio, iosysid, rank, &implicit, format, false);
            write_and_close(&mut pio, iosysid, rank, &explicit, format, true);
        }
        assert_eq!(pio.pool().outstanding(), 0);
    });

    for format in IoFormat::ALL {
        let implicit = format!("implicit-{}.nc", format);
        let explicit = format!("explicit-{}.nc", format);
        assert_eq!(store.record_count(&implicit), 10);
        for var_id in 0..10 {
            let expected = Some(merged(0..RANKS as i32, 3));
            assert_eq!(store.record(&implicit, var_id, Some(0)), expected);
            assert_eq!(store.record(&explicit, var_id, Some(0)), expected);
        }
    }
}

#[test]
fn test_closed_handle_is_bad_handle() {
    let store = MemoryStore::new();
    run_world(2, |comm| {
        let rank = comm.rank();
        let (mut pio, iosysid) = intracomm_session(comm, &store);
        let fh = pio
            .create(iosysid, "c.nc", IoFormat::Classic, OpenMode::WRITE)
            .unwrap();
        pio.close(fh).unwrap();

        assert!(matches!(pio.close(fh), Err(PioError::BadHandle(h)) if h == fh));
        assert!(matches!(pio.sync(fh), Err(PioError::BadHandle(_))));
        assert!(matches!(
            pio.write_darray(fh, staged(0, rank, 1)),
            Err(PioError::BadHandle(_))
        ));
        assert_eq!(pio.file(999).unwrap_err().status(), status::EBADHANDLE);
    });
}

#[test]
fn test_write_to_read_only_file_rejected() {
    let store = MemoryStore::new();
    store.insert_file("r.nc", false);
    run_world(2, |comm| {
        let rank = comm.rank();
        let (mut pio, iosysid) = intracomm_session(comm, &store);
        let fh = pio
            .open(iosysid, "r.nc", IoFormat::Classic, OpenMode::READ)
            .unwrap();
        let err = pio.write_darray(fh, staged(0, rank, 1)).unwrap_err();
        assert_eq!(err.status(), status::EPERM);
        assert_eq!(pio.file(fh).unwrap().buffers().state(), ChainState::Idle);
        pio.close(fh).unwrap();
    });
    assert_eq!(store.record_count("r.nc"), 0);
}

#[test]
fn test_delete() {
    let store = MemoryStore::new();
    run_world(RANKS, |comm| {
        let (mut pio, iosysid) = intracomm_session(comm, &store);
        let fh = pio
            .create(iosysid, "d.nc", IoFormat::Parallel, OpenMode::WRITE)
            .unwrap();
        pio.close(fh).unwrap();

        pio.delete(iosysid, "d.nc").unwrap();
        assert!(!store.exists("d.nc"));

        let err = pio.delete(iosysid, "d.nc").unwrap_err();
        assert_eq!(err.raw_code(), Some(nc::ENOENT));
    });
}

#[test]
fn test_noclobber_create_of_existing_file() {
    let store = MemoryStore::new();
    store.insert_file("keep.nc", false);
    run_world(2, |comm| {
        let (mut pio, iosysid) = intracomm_session(comm, &store);
        let err = pio
            .create(
                iosysid,
                "keep.nc",
                IoFormat::ClassicExtended,
                OpenMode::WRITE | OpenMode::NOCLOBBER,
            )
            .unwrap_err();
        assert_eq!(err.status(), status::EBACKEND);
        assert_eq!(err.raw_code(), Some(nc::EEXIST));
        assert!(pio.files().is_empty());
    });
    assert_eq!(store.is_extended("keep.nc"), Some(false));
}

#[test]
fn test_chained_nodes_flush_every_decomposition() {
    let store = MemoryStore::new();
    let mut config = PioConfig::default();
    config.buffer.max_vars_per_buffer = 2;
    run_world(2, |comm| {
        let rank = comm.rank();
        let mut pio = Pio::with_memory_store(config.clone(), &store);
        let iosysid = pio.init_intracomm(Box::new(comm)).unwrap();
        let fh = pio
            .create(iosysid, "chain.nc", IoFormat::ClassicExtended, OpenMode::WRITE)
            .unwrap();
        for var_id in 0..7 {
            pio.write_darray(
                fh,
                StagedWrite {
                    var_id,
                    decomp_id: 1 + var_id % 2,
                    frame: None,
                    data: vec![rank as u8; 2],
                    fill: Some(vec![9]),
                },
            )
            .unwrap();
        }
        assert!(pio.file(fh).unwrap().buffers().chained_len() >= 3);

        pio.sync(fh).unwrap();
        assert_eq!(pio.file(fh).unwrap().buffers().chained_len(), 0);
        assert_eq!(pio.pool().outstanding(), 0);
        pio.close(fh).unwrap();
    });
    assert_eq!(store.record_count("chain.nc"), 7);
    for var_id in 0..7 {
        assert_eq!(store.record("chain.nc", var_id, None), Some(merged(0..2, 2)));
        assert_eq!(store.fill_value("chain.nc", var_id), Some(vec![9]));
    }
}

#[test]
fn test_small_attached_buffer_is_drained() {
    let store = MemoryStore::new();
    let mut config = PioConfig::default();
    config.buffer.max_vars_per_buffer = 1;
    // One node from each of the two ranks fills the attached buffer
    config.buffer.buffer_size_limit = 8;
    run_world(2, |comm| {
        let rank = comm.rank();
        let mut pio = Pio::with_memory_store(config.clone(), &store);
        let iosysid = pio.init_intracomm(Box::new(comm)).unwrap();
        let fh = pio
            .create(iosysid, "cb.nc", IoFormat::CollectiveBuffered, OpenMode::WRITE)
            .unwrap();
        for var_id in 0..5 {
            pio.write_darray(fh, staged(var_id, rank, 4)).unwrap();
        }
        pio.close(fh).unwrap();
    });
    for var_id in 0..5 {
        assert_eq!(store.record("cb.nc", var_id, Some(0)), Some(merged(0..2, 4)));
    }
}

#[test]
fn test_failed_sync_keeps_file_open() {
    let store = MemoryStore::new();
    store.fail_next(StoreOp::Sync, IoFormat::Classic, nc::EIO);
    run_world(2, |comm| {
        let rank = comm.rank();
        let (mut pio, iosysid) = intracomm_session(comm, &store);
        let fh = pio
            .create(iosysid, "s.nc", IoFormat::Classic, OpenMode::WRITE)
            .unwrap();
        pio.write_darray(fh, staged(0, rank, 1)).unwrap();

        let err = pio.close(fh).unwrap_err();
        assert_eq!(err.raw_code(), Some(nc::EIO));
        assert!(pio.files().contains(fh));
        pio.close(fh).unwrap();
    });
    assert_eq!(store.record("s.nc", 0, Some(0)), Some(merged(0..2, 1)));
}
