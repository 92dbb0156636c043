//! Thread-local storage keys with per-thread destructors.
//!
//! A process-wide registry hands out key slots (at most [`TLS_KEYS_MAX`]) and
//! tracks each live key's destructor in a doubly linked list ordered by
//! creation. Values live in a per-thread table indexed by slot; each cell
//! remembers the generation of the key that wrote it, so a value written
//! under a deleted key is invisible to the key that later reuses the slot.
//!
//! When a managed thread exits, its destructors run newest key first. A
//! destructor may set values again; the scan repeats until every value with a
//! destructor is zero.

use std::cell::RefCell;

use parking_lot::Mutex;

use crate::error::ThreadError;

/// Maximum number of simultaneously live keys.
pub const TLS_KEYS_MAX: usize = 1024;

/// Destructor invoked with a thread's non-zero value at thread exit.
pub type Destructor = fn(usize);

#[derive(Debug, Clone, Copy)]
struct KeyEntry {
    destructor: Option<Destructor>,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    /// Generation; bumped on create and delete, never zero for a live key.
    seq: u32,
    entry: Option<KeyEntry>,
}

struct KeyRegistry {
    slots: Vec<Slot>,
    /// Most recently created live key.
    last: Option<u32>,
}

impl KeyRegistry {
    const fn new() -> Self {
        Self {
            slots: Vec::new(),
            last: None,
        }
    }

    fn allocate(&mut self, destructor: Option<Destructor>) -> Result<TlsKey, ThreadError> {
        let index = match self.slots.iter().position(|s| s.entry.is_none()) {
            Some(index) => index,
            None if self.slots.len() < TLS_KEYS_MAX => {
                self.slots
                    .try_reserve(1)
                    .map_err(|_| ThreadError::OutOfMemory)?;
                self.slots.push(Slot {
                    seq: 0,
                    entry: None,
                });
                self.slots.len() - 1
            }
            None => return Err(ThreadError::ResourceExhausted),
        };
        let slot = index as u32;
        let prev = self.last;
        let seq = next_seq(self.slots[index].seq);
        self.slots[index] = Slot {
            seq,
            entry: Some(KeyEntry {
                destructor,
                prev,
                next: None,
            }),
        };
        if let Some(p) = prev
            && let Some(entry) = self.slots[p as usize].entry.as_mut()
        {
            entry.next = Some(slot);
        }
        self.last = Some(slot);
        Ok(TlsKey { slot, seq })
    }

    fn release(&mut self, key: TlsKey) -> Result<(), ThreadError> {
        let slot = self
            .slots
            .get_mut(key.slot as usize)
            .filter(|s| s.seq == key.seq)
            .ok_or(ThreadError::InvalidArgument)?;
        let entry = slot.entry.take().ok_or(ThreadError::InvalidArgument)?;
        slot.seq = next_seq(slot.seq);

        if let Some(p) = entry.prev
            && let Some(prev) = self.slots[p as usize].entry.as_mut()
        {
            prev.next = entry.next;
        }
        match entry.next {
            Some(n) => {
                if let Some(next) = self.slots[n as usize].entry.as_mut() {
                    next.prev = entry.prev;
                }
            }
            None => self.last = entry.prev,
        }
        Ok(())
    }

    /// Live keys that carry a destructor, newest first.
    fn newest_first(&self) -> impl Iterator<Item = (TlsKey, Destructor)> + '_ {
        std::iter::successors(self.last, |&i| {
            self.slots[i as usize].entry.and_then(|e| e.prev)
        })
        .filter_map(|i| {
            let slot = &self.slots[i as usize];
            let destructor = slot.entry?.destructor?;
            Some((TlsKey { slot: i, seq: slot.seq }, destructor))
        })
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }
}

fn next_seq(seq: u32) -> u32 {
    seq.wrapping_add(1).max(1)
}

static REGISTRY: Mutex<KeyRegistry> = parking_lot::const_mutex(KeyRegistry::new());

thread_local! {
    /// `(generation, value)` per slot for the calling thread.
    static VALUES: RefCell<Vec<(u32, usize)>> = const { RefCell::new(Vec::new()) };
}

/// Handle to a thread-local storage key.
///
/// Keys are plain values; every thread sees its own value for a key, zero
/// until set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlsKey {
    slot: u32,
    seq: u32,
}

impl TlsKey {
    /// Create a key. `destructor` runs at managed-thread exit for every
    /// thread whose value is non-zero.
    ///
    /// Fails with `ResourceExhausted` once [`TLS_KEYS_MAX`] keys are live.
    pub fn create(destructor: Option<Destructor>) -> Result<Self, ThreadError> {
        let key = REGISTRY.lock().allocate(destructor)?;
        tracing::trace!(slot = key.slot, "created TLS key");
        Ok(key)
    }

    /// Delete the key. Values other threads still hold are abandoned without
    /// running the destructor.
    pub fn delete(self) -> Result<(), ThreadError> {
        REGISTRY.lock().release(self)?;
        tracing::trace!(slot = self.slot, "deleted TLS key");
        Ok(())
    }

    /// Set the calling thread's value.
    pub fn set(self, value: usize) -> Result<(), ThreadError> {
        VALUES
            .try_with(|values| {
                let mut values = values.borrow_mut();
                let index = self.slot as usize;
                let len = values.len();
                if index >= len {
                    values
                        .try_reserve(index + 1 - len)
                        .map_err(|_| ThreadError::OutOfMemory)?;
                    values.resize(index + 1, (0, 0));
                }
                values[index] = (self.seq, value);
                Ok(())
            })
            .unwrap_or(Err(ThreadError::ResourceExhausted))
    }

    /// The calling thread's value, zero if never set.
    #[must_use]
    pub fn get(self) -> usize {
        VALUES
            .try_with(|values| match values.borrow().get(self.slot as usize) {
                Some(&(seq, value)) if seq == self.seq => value,
                _ => 0,
            })
            .unwrap_or(0)
    }

    /// Registry slot this key occupies.
    #[must_use]
    pub fn index(self) -> usize {
        self.slot as usize
    }
}

/// Number of live keys in the process.
#[must_use]
pub fn live_keys() -> usize {
    REGISTRY.lock().live()
}

/// Run the calling thread's destructors until no value with a destructor is
/// left non-zero.
pub(crate) fn run_thread_destructors() {
    let mut rounds = 0usize;
    loop {
        let pending = REGISTRY.lock().newest_first().find_map(|(key, destructor)| {
            let value = key.get();
            (value != 0).then_some((key, destructor, value))
        });
        let Some((key, destructor, value)) = pending else {
            break;
        };
        let _ = key.set(0);
        destructor(value);
        rounds += 1;
    }
    if rounds > 0 {
        tracing::trace!(rounds, "ran TLS destructors");
    }
}
