use kernel_sync::{SpinMutex, TicketMutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::{panic, thread};
use std::time::Duration;

#[test]
fn guard_drop_hands_the_lock_on() {
    let cursor = TicketMutex::new(0x1000_u64);
    *cursor.lock() += 0x2000;
    *cursor.lock() += 0x1000;
    assert_eq!(*cursor.lock(), 0x4000);
    assert!(!cursor.is_locked());
}

#[test]
fn try_lock_fails_while_held() {
    let cursor = TicketMutex::new(7_u8);

    let held = cursor.try_lock().expect("lock is free");
    assert_eq!(*held, 7);
    assert!(cursor.is_locked());
    assert!(cursor.try_lock().is_none());

    drop(held);
    assert!(cursor.try_lock().is_some());
    // Failed attempts draw no ticket.
    assert_eq!(cursor.stats().acquisitions, 2);
}

#[test]
fn lock_irq_gives_access_and_unlocks() {
    let l = SpinMutex::new(vec![1, 2]);
    {
        let mut g = l.lock_irq();
        g.push(3);
    }
    assert_eq!(l.lock().as_slice(), &[1, 2, 3]);
}

#[test]
fn uncontended_acquisitions_are_not_counted_as_contended() {
    let l = TicketMutex::new(());
    for _ in 0..10 {
        drop(l.lock());
    }
    let stats = l.stats();
    assert_eq!(stats.acquisitions, 10);
    assert_eq!(stats.contended, 0);
}

#[test]
fn waiting_acquisition_is_counted_as_contended() {
    let l = Arc::new(TicketMutex::new(0u32));
    let held = l.lock();

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let l = Arc::clone(&l);
        thread::spawn(move || {
            tx.send(()).unwrap();
            *l.lock() += 1;
        })
    };

    rx.recv().unwrap();
    // Give the waiter time to take its ticket.
    while l.stats().contended == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    drop(held);
    waiter.join().unwrap();

    assert_eq!(*l.lock(), 1);
    assert_eq!(l.stats().contended, 1);
}

#[test]
fn tickets_are_served_in_arrival_order() {
    let l = Arc::new(TicketMutex::new(Vec::new()));
    let held = l.lock();

    let mut handles = Vec::new();
    for i in 0..4 {
        let queued = Arc::clone(&l);
        handles.push(thread::spawn(move || queued.lock().push(i)));
        // Wait until thread `i` queued before spawning the next one.
        while l.stats().contended < i + 1 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    drop(held);
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(l.lock().as_slice(), &[0, 1, 2, 3]);
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(TicketMutex::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let lock = Arc::clone(&lock);
        let in_cs = Arc::clone(&in_cs);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                lock.with_lock(|v| {
                    let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(prev, 0, "mutual exclusion violated");
                    *v += 1;
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                });
                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
    assert_eq!(lock.stats().acquisitions, threads * iters + 1);
}

#[test]
fn lock_is_released_on_panic() {
    let l = TicketMutex::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert_eq!(l.with_lock(|v| *v), 123);
}
