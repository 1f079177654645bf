//! One instance per rank holding several sessions at once

mod common;

use common::{merged, run_world, staged};
use pario::comm::{Communicator, LocalComm};
use pario::storage::MemoryStore;
use pario::{IoFormat, OpenMode, Pio, PioConfig};

const WIDE_CONTEXT: u32 = 20;
const NARROW_CONTEXT: u32 = 21;
/// Members of the narrow session; its I/O master is world rank 1
const NARROW: [i32; 2] = [1, 2];

#[test]
fn test_overlapping_sessions_hand_out_distinct_ids() {
    let store = MemoryStore::new();
    let ids = run_world(3, |world| {
        let rank = world.rank();
        let mut pio = Pio::with_memory_store(PioConfig::default(), &store);
        let wide = pio
            .init_intracomm(Box::new(world.duplicate(WIDE_CONTEXT)))
            .unwrap();
        let narrow = world
            .subgroup(&NARROW, NARROW_CONTEXT)
            .map(|comm| pio.init_intracomm(Box::new(comm)).unwrap());

        let first = pio
            .create(wide, "wide-1.nc", IoFormat::Classic, OpenMode::WRITE)
            .unwrap();
        let inner = narrow.map(|iosysid| {
            pio.create(iosysid, "narrow.nc", IoFormat::Classic, OpenMode::WRITE)
                .unwrap()
        });
        let second = pio
            .create(wide, "wide-2.nc", IoFormat::Classic, OpenMode::WRITE)
            .unwrap();

        if let Some(inner) = inner {
            assert_ne!(inner, first);
            assert_ne!(inner, second);
            assert_eq!(pio.files().len(), 3);
            pio.write_darray(inner, staged(0, rank, 2)).unwrap();
            pio.close(inner).unwrap();
        }
        pio.write_darray(second, staged(0, rank, 1)).unwrap();
        pio.close(second).unwrap();
        pio.close(first).unwrap();
        assert!(pio.files().is_empty());
        (first, second)
    });

    // Every member of the wide session agrees on both ids
    assert!(ids.iter().all(|&pair| pair == ids[0]));
    assert_ne!(ids[0].0, ids[0].1);
    assert_eq!(store.record("narrow.nc", 0, Some(0)), Some(merged(NARROW, 2)));
    assert_eq!(store.record("wide-2.nc", 0, Some(0)), Some(merged(0..3, 1)));
}

#[test]
fn test_sessions_on_disjoint_groups() {
    let store = MemoryStore::new();
    run_world(4, |world| {
        let rank = world.rank();
        let members: Vec<i32> = if rank < 2 { vec![0, 1] } else { vec![2, 3] };
        let comm: LocalComm = world.subgroup(&members, 30 + members[0] as u32).unwrap();
        let mut pio = Pio::with_memory_store(PioConfig::default(), &store);
        let iosysid = pio.init_intracomm(Box::new(comm)).unwrap();
        let path = format!("group-{}.nc", members[0]);
        let fh = pio
            .create(iosysid, &path, IoFormat::Parallel, OpenMode::WRITE)
            .unwrap();
        pio.write_darray(fh, staged(4, rank, 1)).unwrap();
        pio.close(fh).unwrap();
        assert_eq!(
            store.record(&path, 4, Some(0)),
            Some(merged(members.iter().copied(), 1))
        );
        pio.finalize(iosysid).unwrap();
    });
}
