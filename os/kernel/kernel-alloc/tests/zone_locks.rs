mod common;

use common::boot;
use kernel_alloc::{BumpCursor, MapOptions, MemoryFlags, ZoneId};
use kernel_info::memory::{HANDLE_TABLES_START, KERNEL_MODULES_START};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::TicketMutex;
use std::sync::{Barrier, mpsc};
use std::thread;
use std::time::Duration;

// The shared heap is left out: its master lock drains the core arenas.
const ZONES: [ZoneId; 6] = [
    ZoneId::KernelModules,
    ZoneId::CoreHeap(0),
    ZoneId::CoreHeap(1),
    ZoneId::VasDescriptors,
    ZoneId::HandleTables,
    ZoneId::KernelBinaries,
];

#[test]
fn zones_on_different_threads_never_contend() {
    let mm = boot(2048);
    let kernel = mm.kernel_space();
    let barrier = Barrier::new(ZONES.len());

    thread::scope(|s| {
        for zone in ZONES {
            let (mm, barrier) = (&mm, &barrier);
            s.spawn(move || {
                barrier.wait();
                for _ in 0..32 {
                    let va = mm
                        .allocate_pages(kernel, 2, zone, MemoryFlags::WRITABLE)
                        .unwrap();
                    assert!(mm.try_translate(kernel, va).unwrap().is_some());
                }
            });
        }
    });

    for zone in ZONES {
        let stats = mm.zone_stats(kernel, zone).unwrap();
        assert!(stats.acquisitions >= 64, "{zone:?}: {stats:?}");
        assert_eq!(stats.contended, 0, "{zone:?} contended");
    }
}

#[test]
fn held_zone_lock_does_not_delay_other_zones() {
    let mm = boot(1024);
    let kernel = mm.kernel_space();
    let unused = TicketMutex::new(BumpCursor::for_zone(ZoneId::User).unwrap());
    let guard = mm.zones().lock(ZoneId::HandleTables, &unused).unwrap();
    let (tx, rx) = mpsc::channel();

    thread::scope(|s| {
        let mm = &mm;
        s.spawn(move || {
            mm.map_page(
                kernel,
                VirtualAddress::new(KERNEL_MODULES_START),
                PhysicalAddress::new(0x5000),
                MemoryFlags::empty(),
                MapOptions::NO_REFERENCE_COUNTING,
            )
            .unwrap();
            tx.send(()).unwrap();

            // Same zone as the held lock: waits until it is dropped.
            mm.map_page(
                kernel,
                VirtualAddress::new(HANDLE_TABLES_START),
                PhysicalAddress::new(0x6000),
                MemoryFlags::empty(),
                MapOptions::NO_REFERENCE_COUNTING,
            )
            .unwrap();
            tx.send(()).unwrap();
        });

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    });

    assert_eq!(
        mm.zone_stats(kernel, ZoneId::HandleTables).unwrap().contended,
        1
    );
}
