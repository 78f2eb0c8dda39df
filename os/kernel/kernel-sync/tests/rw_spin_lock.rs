use kernel_sync::RwSpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn writers_are_exclusive_with_concurrent_readers() {
    let writers = 4;
    let readers = 4;
    let iters = 2_000;

    let lock = Arc::new(RwSpinLock::new((0usize, 0usize)));
    let writing = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(writers + readers));

    let mut handles = Vec::new();
    for _ in 0..writers {
        let lock = Arc::clone(&lock);
        let writing = Arc::clone(&writing);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                let mut g = lock.write_irq();
                assert_eq!(writing.fetch_add(1, Ordering::SeqCst), 0);
                g.0 += 1;
                g.1 += 1;
                writing.fetch_sub(1, Ordering::SeqCst);
            }
        }));
    }
    for _ in 0..readers {
        let lock = Arc::clone(&lock);
        let writing = Arc::clone(&writing);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                let g = lock.read_irq();
                assert_eq!(writing.load(Ordering::SeqCst), 0, "reader overlapped a writer");
                assert_eq!(g.0, g.1, "torn update observed");
                drop(g);
                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    let g = lock.read();
    assert_eq!(g.0, writers * iters);
    assert_eq!(g.1, writers * iters);
}
