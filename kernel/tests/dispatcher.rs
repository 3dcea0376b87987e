// SPDX-License-Identifier: MPL-2.0

//! Dispatcher and scheduler scenarios, run against the hosted platform.

use std::sync::mpsc;
use std::time::Duration;

use noctis_kernel::arch::hosted;
use noctis_kernel::ke::{
    self, cpu, rcu, thread, timer, Event, MsgQueue, Mutex, Port, PortMsg, RwMutex, Semaphore,
    Timer,
};
use noctis_kernel::ps;
use noctis_kernel::ErrorKind;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

fn init() {
    hosted::init_kernel();
}

#[test]
fn event_wakeup() {
    init();
    let event = Arc::new(Event::new(false));
    let (tx, rx) = mpsc::channel();

    let waiter_event = event.clone();
    ps::create_kernel_thread("event-waiter", move || {
        let index = ke::wait_one(&*waiter_event, "test event", false, ke::TIMEOUT_INFINITE);
        tx.send(index).unwrap();
    });

    std::thread::sleep(Duration::from_millis(20));
    let was_signalled = event.signal();
    assert!(!was_signalled);

    let index = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(index.unwrap(), 0);
}

#[test]
fn event_signalled_before_wait_never_blocks() {
    init();
    let event = Event::new(false);
    event.signal();
    // A poll (timeout zero) must succeed outright.
    assert_eq!(ke::wait_one(&event, "pre-signalled", false, 0).unwrap(), 0);
    // Manual-reset: still signalled.
    assert!(event.clear());
    assert_eq!(
        ke::wait_one(&event, "cleared", false, 0).unwrap_err().kind(),
        ErrorKind::Timeout
    );
}

#[test]
fn mutex_exclusion() {
    init();
    let mutex = Arc::new(Mutex::new(0u64));
    let (tx, rx) = mpsc::channel();

    for i in 0..3 {
        let mutex = mutex.clone();
        let tx = tx.clone();
        ps::create_kernel_thread(&format!("mutex-{}", i), move || {
            for _ in 0..100 {
                let mut counter = mutex.lock();
                *counter += 1;
            }
            tx.send(()).unwrap();
        });
    }

    for _ in 0..3 {
        rx.recv_timeout(Duration::from_secs(30)).unwrap();
    }

    assert_eq!(*mutex.lock(), 300);
    assert!(mutex.owner_is_none());
}

#[test]
fn timer_wait_satisfies_and_clock_advances() {
    init();
    // One simulated second; the hosted ticker runs much faster than wall
    // time.
    let before = cpu::current().local_nanos();
    let timer = Timer::new();
    timer.set(1_000_000_000);

    let index = ke::wait_one(&timer, "timer", false, 2_000_000_000).unwrap();
    assert_eq!(index, 0);

    let after = cpu::current().local_nanos();
    assert!(after - before >= 1_000_000_000);
    timer.cancel();
}

#[test]
fn timer_stays_signalled_until_reset() {
    init();
    let timer = Timer::new();
    timer.set(1_000_000);
    assert_eq!(
        ke::wait_one(&timer, "first", false, ke::TIMEOUT_INFINITE).unwrap(),
        0
    );
    // Sticky: a later wait completes at once.
    assert_eq!(ke::wait_one(&timer, "second", false, 0).unwrap(), 0);
    // Re-arming resets the signal.
    timer.set(60_000_000_000);
    assert_eq!(
        ke::wait_one(&timer, "armed", false, 0).unwrap_err().kind(),
        ErrorKind::Timeout
    );
    timer.cancel();
}

#[test]
fn wait_timeout_and_poll() {
    init();
    let event = Event::new(false);
    let err = ke::wait_one(&event, "timeout", false, 50_000_000).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let err = ke::wait_one(&event, "poll", false, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[test]
fn wait_multi_reports_the_satisfier() {
    init();
    let a = Event::new(false);
    let b = Event::new(true);
    let objects: [&dyn ke::Dispatcher; 2] = [&a, &b];
    let index = ke::wait_multi(&objects, "multi", false, false, ke::TIMEOUT_INFINITE).unwrap();
    assert_eq!(index, 1);
}

#[test]
fn semaphore_counts() {
    init();
    let sem = Semaphore::new(2);
    assert_eq!(ke::wait_one(&sem, "s1", false, 0).unwrap(), 0);
    assert_eq!(ke::wait_one(&sem, "s2", false, 0).unwrap(), 0);
    assert_eq!(
        ke::wait_one(&sem, "s3", false, 0).unwrap_err().kind(),
        ErrorKind::Timeout
    );

    sem.release(1);
    assert_eq!(ke::wait_one(&sem, "s4", false, 0).unwrap(), 0);

    // Max-one never stacks.
    sem.release_maxone();
    sem.release_maxone();
    assert_eq!(sem.count(), 1);
    sem.reset(0);
    assert_eq!(sem.count(), 0);
}

#[test]
fn semaphore_release_wakes_waiter() {
    init();
    let sem = Arc::new(Semaphore::new(0));
    let (tx, rx) = mpsc::channel();

    let waiter_sem = sem.clone();
    ps::create_kernel_thread("sem-waiter", move || {
        let index = ke::wait_one(&*waiter_sem, "sem", false, ke::TIMEOUT_INFINITE);
        tx.send(index).unwrap();
    });

    std::thread::sleep(Duration::from_millis(20));
    sem.release(1);
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap(), 0);
    assert_eq!(sem.count(), 0);
}

#[test]
fn msgqueue_fifo_and_backpressure() {
    init();
    let queue: MsgQueue<u32> = MsgQueue::new(4);
    for i in 0..4 {
        queue.post(i, ke::TIMEOUT_INFINITE).unwrap();
    }
    // Full: a timed post runs out.
    assert_eq!(
        queue.post(99, 10_000_000).unwrap_err().kind(),
        ErrorKind::Timeout
    );
    for i in 0..4 {
        assert_eq!(queue.receive(ke::TIMEOUT_INFINITE).unwrap(), i);
    }
    // Room again.
    queue.post(5, ke::TIMEOUT_INFINITE).unwrap();
    assert_eq!(queue.receive(ke::TIMEOUT_INFINITE).unwrap(), 5);
}

#[test]
fn msgqueue_cross_thread() {
    init();
    let queue: Arc<MsgQueue<u32>> = Arc::new(MsgQueue::new(8));
    let (tx, rx) = mpsc::channel();

    let receiver_queue = queue.clone();
    ps::create_kernel_thread("msgq-receiver", move || {
        let mut sum = 0;
        for _ in 0..10 {
            sum += receiver_queue.receive(ke::TIMEOUT_INFINITE).unwrap();
        }
        tx.send(sum).unwrap();
    });

    for i in 0..10 {
        queue.post(i, ke::TIMEOUT_INFINITE).unwrap();
    }
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 45);
}

#[test]
fn port_binds_messages_to_processors() {
    init();
    let port = Port::new(1);

    port.enqueue(Box::new(PortMsg { payload: 7 }));
    let msg = port.dequeue();
    assert_eq!(msg.payload, 7);

    // Re-dequeue from the same port frees the processing slot.
    port.enqueue(Box::new(PortMsg { payload: 8 }));
    let msg = port.dequeue();
    assert_eq!(msg.payload, 8);
}

#[test]
fn port_wakes_blocked_dequeuer() {
    init();
    let port = Port::new(4);
    let (tx, rx) = mpsc::channel();

    let worker_port = port.clone();
    ps::create_kernel_thread("port-worker", move || {
        let msg = worker_port.dequeue();
        tx.send(msg.payload).unwrap();
    });

    std::thread::sleep(Duration::from_millis(20));
    port.enqueue(Box::new(PortMsg { payload: 42 }));
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 42);
}

#[test]
fn sleep_advances_with_the_clock() {
    init();
    let before = cpu::current().local_nanos();
    timer::sleep(200_000_000);
    let after = cpu::current().local_nanos();
    assert!(after - before >= 200_000_000);
}

#[test]
fn alert_breaks_an_alertable_wait() {
    init();
    let event = Arc::new(Event::new(false));
    let (tx, rx) = mpsc::channel();
    let (started_tx, started_rx) = mpsc::channel();

    let waiter_event = event.clone();
    let handle = ps::create_kernel_thread("alertable", move || {
        started_tx.send(thread::current()).unwrap();
        let result = ke::wait_one(&*waiter_event, "alertable", true, ke::TIMEOUT_INFINITE);
        tx.send(result).unwrap();
    });
    let _ = handle;

    let waiter = started_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    thread::alert(&waiter);

    let result = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Signalled);
}

#[test]
fn rwmutex_readers_share_writers_exclude() {
    init();
    let lock = Arc::new(RwMutex::new(0u32));
    let readers = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    for i in 0..2 {
        let lock = lock.clone();
        let readers = readers.clone();
        let tx = tx.clone();
        ps::create_kernel_thread(&format!("reader-{}", i), move || {
            let guard = lock.read();
            readers.fetch_add(1, Ordering::SeqCst);
            // Both readers can be inside at once.
            while readers.load(Ordering::SeqCst) < 2 {
                std::thread::yield_now();
            }
            let value = *guard;
            drop(guard);
            tx.send(value).unwrap();
        });
    }
    for _ in 0..2 {
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
    }

    {
        let mut guard = lock.write();
        *guard = 5;
    }
    assert_eq!(*lock.read(), 5);
}

#[test]
fn rcu_synchronise_waits_a_grace_period() {
    init();
    let ran = Arc::new(AtomicUsize::new(0));
    let observed = ran.clone();
    rcu::call(Box::new(move || {
        observed.store(1, Ordering::SeqCst);
    }));

    rcu::synchronise();
    // The earlier callback matured no later than our own.
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn rcu_read_side_holds_dpc() {
    init();
    {
        let _guard = rcu::read_lock();
        assert!(ke::ipl::current() >= ke::Ipl::Dpc);
    }
    assert_eq!(ke::ipl::current(), ke::Ipl::Passive);
}

#[test]
fn timer_expiry_enqueues_attached_dpc() {
    init();
    static FIRED: AtomicUsize = AtomicUsize::new(0);
    fn mark(arg: usize) {
        FIRED.store(arg, Ordering::SeqCst);
    }
    static DPC: ke::dpc::Dpc = ke::dpc::Dpc::new(mark, 0x5150);

    let timer = Timer::new();
    timer.attach_dpc(&DPC);
    timer.set(1_000_000);
    assert_eq!(
        ke::wait_one(&timer, "dpc timer", false, ke::TIMEOUT_INFINITE).unwrap(),
        0
    );
    // The DPC runs from the expiry path; give it a tick.
    let mut spins = 0;
    while FIRED.load(Ordering::SeqCst) != 0x5150 {
        std::thread::sleep(Duration::from_millis(1));
        spins += 1;
        assert!(spins < 5000, "attached DPC never ran");
    }
    timer.cancel();
}

#[test]
fn interrupt_attachment_and_delivery() {
    init();
    use noctis_kernel::arch::{self, hosted as hosted_port};

    static SEEN: AtomicUsize = AtomicUsize::new(usize::MAX);
    fn handler(vector: usize) {
        SEEN.store(vector, Ordering::SeqCst);
        assert!(ke::ipl::current() >= ke::Ipl::Device);
    }

    let platform = arch::platform();
    let vector = platform.intr_alloc(ke::Ipl::Device, false).unwrap();
    platform.intr_register(vector, handler).unwrap();
    // A second handler on a non-shareable vector is refused.
    assert!(platform.intr_register(vector, handler).is_err());

    hosted_port::deliver_interrupt(vector);
    assert_eq!(SEEN.load(Ordering::SeqCst), vector);
    assert_eq!(ke::ipl::current(), ke::Ipl::Passive);
}

#[test]
fn thread_exit_terminates_process_accounting() {
    init();
    let (tx, rx) = mpsc::channel();
    ps::create_kernel_thread("short-lived", move || {
        tx.send(()).unwrap();
    });
    rx.recv_timeout(Duration::from_secs(10)).unwrap();

    // Give the exit path time to run the done-thread DPC.
    std::thread::sleep(Duration::from_millis(50));
}
