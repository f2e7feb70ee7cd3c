//! Runtime integration: scheduler, reactor, fiber-aware sync and TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use fiber::sync::{Channel, CountdownLatch, Mutex, Semaphore};
use fiber::{net, Reactor, Scheduler};

const WAIT: Duration = Duration::from_secs(10);

#[test]
fn scheduler_runs_every_task() {
    let sched = Scheduler::new(3, false, "sched-test");
    sched.start();

    let executed = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let executed = executed.clone();
        sched.schedule(move || {
            executed.fetch_add(1, Ordering::SeqCst);
        });
    }

    let deadline = Instant::now() + WAIT;
    while executed.load(Ordering::SeqCst) < 100 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(executed.load(Ordering::SeqCst), 100);
    sched.stop();
}

#[test]
fn pinned_tasks_run_on_their_worker() {
    let sched = Scheduler::new(2, false, "pin-test");
    sched.start();

    let executed = Arc::new(AtomicUsize::new(0));
    for worker in 0..2 {
        let executed = executed.clone();
        sched.schedule_on(worker, move || {
            executed.fetch_add(1, Ordering::SeqCst);
        });
    }
    let deadline = Instant::now() + WAIT;
    while executed.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(executed.load(Ordering::SeqCst), 2);
    sched.stop();
}

#[test]
fn sleep_parks_the_fiber_not_the_thread() {
    let reactor = Reactor::new(1, false, "sleep-test").unwrap();
    let (tx, rx) = mpsc::channel();

    // Both fibers sleep on the single worker; parallel wakeups prove the
    // worker thread is not blocked inside either sleep.
    for tag in ["a", "b"] {
        let tx = tx.clone();
        reactor.schedule(move || {
            net::sleep_ms(50);
            tx.send(tag).unwrap();
        });
    }
    let start = Instant::now();
    rx.recv_timeout(WAIT).unwrap();
    rx.recv_timeout(WAIT).unwrap();
    assert!(start.elapsed() < Duration::from_millis(2000));
    reactor.stop();
}

#[test]
fn channel_delivers_and_closes() {
    let reactor = Reactor::new(2, false, "chan-test").unwrap();
    let (tx, rx) = mpsc::channel();

    let channel = Channel::<u32>::new(2);
    let consumer = channel.clone();
    let tx2 = tx.clone();
    reactor.schedule(move || {
        let mut received = Vec::new();
        while let Some(value) = consumer.recv() {
            received.push(value);
        }
        tx2.send(received).unwrap();
    });
    let producer = channel.clone();
    reactor.schedule(move || {
        // Capacity 2 forces the producer to park mid-way.
        for value in 0..16 {
            assert!(producer.send(value));
        }
        producer.close();
    });

    let received = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(received, (0..16).collect::<Vec<_>>());
    assert!(!channel.send(17));
    assert!(channel.recv().is_none());
    reactor.stop();
}

#[test]
fn mutex_serializes_fibers() {
    let reactor = Reactor::new(4, false, "mutex-test").unwrap();
    let (tx, rx) = mpsc::channel();

    struct Shared {
        lock: Mutex,
        value: std::cell::UnsafeCell<u64>,
    }
    unsafe impl Send for Shared {}
    unsafe impl Sync for Shared {}

    let shared = Arc::new(Shared { lock: Mutex::new(), value: std::cell::UnsafeCell::new(0) });
    let latch = Arc::new(CountdownLatch::new(8));

    for _ in 0..8 {
        let shared = shared.clone();
        let latch = latch.clone();
        reactor.schedule(move || {
            for _ in 0..1000 {
                let guard = shared.lock.lock();
                unsafe { *shared.value.get() += 1 };
                drop(guard);
            }
            latch.count_down();
        });
    }
    let shared2 = shared.clone();
    reactor.schedule(move || {
        latch.wait();
        let total = unsafe { *shared2.value.get() };
        tx.send(total).unwrap();
    });

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 8000);
    reactor.stop();
}

#[test]
fn semaphore_caps_concurrency() {
    let reactor = Reactor::new(4, false, "sem-test").unwrap();
    let (tx, rx) = mpsc::channel();

    let semaphore = Arc::new(Semaphore::new(2));
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let latch = Arc::new(CountdownLatch::new(6));

    for _ in 0..6 {
        let semaphore = semaphore.clone();
        let inside = inside.clone();
        let peak = peak.clone();
        let latch = latch.clone();
        reactor.schedule(move || {
            semaphore.acquire();
            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            net::sleep_ms(20);
            inside.fetch_sub(1, Ordering::SeqCst);
            semaphore.release();
            latch.count_down();
        });
    }
    reactor.schedule(move || {
        latch.wait();
        tx.send(()).unwrap();
    });

    rx.recv_timeout(WAIT).unwrap();
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "semaphore admitted {peak} fibers");
    reactor.stop();
}

#[test]
fn tcp_round_trip() {
    let reactor = Reactor::new(2, false, "tcp-test").unwrap();
    let (addr_tx, addr_rx) = mpsc::channel();
    let (tx, rx) = mpsc::channel();

    reactor.schedule(move || {
        let listener = net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        addr_tx.send(listener.local_addr()).unwrap();
        let (stream, _peer) = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        let mut read = 0;
        while read < buf.len() {
            let n = stream.read(&mut buf[read..]).unwrap();
            assert!(n > 0);
            read += n;
        }
        stream.write(&buf).unwrap();
    });

    let addr = addr_rx.recv_timeout(WAIT).unwrap();
    reactor.schedule(move || {
        let stream = net::TcpStream::connect_timeout(addr, 5000).unwrap();
        stream.write(b"hello").unwrap();
        let mut buf = [0u8; 5];
        let mut read = 0;
        while read < buf.len() {
            let n = stream.read(&mut buf[read..]).unwrap();
            assert!(n > 0);
            read += n;
        }
        tx.send(buf.to_vec()).unwrap();
    });

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), b"hello".to_vec());
}

#[test]
fn read_timeout_fires() {
    let reactor = Reactor::new(2, false, "timeout-test").unwrap();
    let (addr_tx, addr_rx) = mpsc::channel();
    let (tx, rx) = mpsc::channel();

    reactor.schedule(move || {
        let listener = net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        addr_tx.send(listener.local_addr()).unwrap();
        // Accept and go silent; the client read must time out.
        let (_stream, _peer) = listener.accept().unwrap();
        net::sleep_ms(2000);
    });

    let addr = addr_rx.recv_timeout(WAIT).unwrap();
    reactor.schedule(move || {
        let stream = net::TcpStream::connect_timeout(addr, 5000).unwrap();
        stream.set_read_timeout_ms(100);
        let start = Instant::now();
        let err = stream.read(&mut [0u8; 16]).unwrap_err();
        tx.send((err.kind(), start.elapsed())).unwrap();
    });

    let (kind, elapsed) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(kind, std::io::ErrorKind::TimedOut);
    assert!(elapsed >= Duration::from_millis(90));
    assert!(elapsed < Duration::from_millis(1500));
}
