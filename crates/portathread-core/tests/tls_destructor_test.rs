use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use portathread_core::thread::{self, Priority, TlsKey};

static RECORDED: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());

fn record(value: usize) {
    RECORDED.lock().unwrap().push(value);
}

#[test]
fn destructor_runs_once_per_thread_with_nonzero_value() {
    let key = TlsKey::create(Some(record)).unwrap();
    let handles: Vec<_> = (1..=4)
        .map(|i| {
            thread::spawn(
                move || {
                    // Thread 4 sets and then clears its value.
                    key.set(100 + i).unwrap();
                    if i == 4 {
                        key.set(0).unwrap();
                    }
                    assert_eq!(key.get(), if i == 4 { 0 } else { 100 + i });
                },
                Priority::NORMAL,
            )
            .unwrap()
        })
        .collect();
    for h in handles {
        assert!(h.join().is_returned());
    }
    let mut seen = RECORDED.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![101, 102, 103]);
    key.delete().unwrap();
}

static ORDER: StdMutex<Vec<&'static str>> = StdMutex::new(Vec::new());

fn older(_: usize) {
    ORDER.lock().unwrap().push("older");
}

fn newer(_: usize) {
    ORDER.lock().unwrap().push("newer");
}

#[test]
fn newest_key_is_destroyed_first() {
    let a = TlsKey::create(Some(older)).unwrap();
    let b = TlsKey::create(Some(newer)).unwrap();
    let h = thread::spawn(
        move || {
            a.set(1).unwrap();
            b.set(1).unwrap();
        },
        Priority::NORMAL,
    )
    .unwrap();
    assert!(h.join().is_returned());
    assert_eq!(*ORDER.lock().unwrap(), vec!["newer", "older"]);
    b.delete().unwrap();
    a.delete().unwrap();
}

static REARMS: AtomicUsize = AtomicUsize::new(0);
static REARM_KEY: OnceLock<TlsKey> = OnceLock::new();

fn rearm(value: usize) {
    REARMS.fetch_add(1, Ordering::SeqCst);
    if value > 1
        && let Some(key) = REARM_KEY.get()
    {
        key.set(value - 1).unwrap();
    }
}

#[test]
fn destructor_that_sets_a_value_is_rescanned() {
    let key = TlsKey::create(Some(rearm)).unwrap();
    REARM_KEY.set(key).unwrap();
    let h = thread::spawn(move || key.set(5).unwrap(), Priority::NORMAL).unwrap();
    assert!(h.join().is_returned());
    assert_eq!(REARMS.load(Ordering::SeqCst), 5);
}

static ABANDONED: AtomicUsize = AtomicUsize::new(0);

fn abandoned(_: usize) {
    ABANDONED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn deleted_key_abandons_values_and_slot_reuse_reads_zero() {
    let key = TlsKey::create(Some(abandoned)).unwrap();
    let (set_tx, set_rx) = std::sync::mpsc::channel();
    let (go_tx, go_rx) = std::sync::mpsc::channel::<TlsKey>();
    let h = thread::spawn(
        move || {
            key.set(9).unwrap();
            set_tx.send(()).unwrap();
            let replacement = go_rx.recv().unwrap();
            replacement.get()
        },
        Priority::NORMAL,
    )
    .unwrap();

    set_rx.recv().unwrap();
    key.delete().unwrap();
    let replacement = TlsKey::create(None).unwrap();
    go_tx.send(replacement).unwrap();

    // Whichever slot the new key got, the old value is invisible to it.
    assert_eq!(h.join().returned(), Some(0));
    assert_eq!(ABANDONED.load(Ordering::SeqCst), 0);
    replacement.delete().unwrap();
}

static UNMANAGED: AtomicUsize = AtomicUsize::new(0);

fn unmanaged(_: usize) {
    UNMANAGED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn unmanaged_threads_do_not_run_destructors() {
    let key = TlsKey::create(Some(unmanaged)).unwrap();
    std::thread::spawn(move || key.set(3).unwrap())
        .join()
        .unwrap();
    assert_eq!(UNMANAGED.load(Ordering::SeqCst), 0);
    key.delete().unwrap();
}

#[test]
fn cancelled_thread_still_runs_destructors() {
    static CANCELLED_SEEN: AtomicUsize = AtomicUsize::new(0);
    fn seen(_: usize) {
        CANCELLED_SEEN.fetch_add(1, Ordering::SeqCst);
    }
    let key = TlsKey::create(Some(seen)).unwrap();
    let h = thread::spawn(
        move || {
            key.set(1).unwrap();
            portathread_core::clock::sleep(60 * portathread_core::CLOCK_FREQ);
        },
        Priority::NORMAL,
    )
    .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));
    h.cancel();
    assert!(h.join().is_cancelled());
    assert_eq!(CANCELLED_SEEN.load(Ordering::SeqCst), 1);
    key.delete().unwrap();
}
