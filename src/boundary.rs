//! Contracts for the external collaborators: the memory subsystem (heap and
//! globals snapshots, sentinel overflow checking), the leak checker, the
//! quarantine-based use-after-free checker, and the system-call recorder.
//! The runtime consumes these only through the traits below; null
//! implementations keep it inert-but-correct when no detector library is
//! installed. The clone log has a working default because thread-creation
//! replay depends on it.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use libc::{c_void, pthread_t};

use crate::defines::{CLONE_LOG_ENTRIES, MAX_ALIVE_THREADS};
use crate::thread_slot::ThreadSlot;

/// Page-level heap and globals state: captured at epoch begin, restored on
/// rollback.
pub trait MemoryOps: Sync {
    fn epoch_begin(&self);
    fn rollback(&self);
    /// Free bypassing the quarantine (used for quarantine eviction).
    fn realfree(&self, ptr: *mut c_void);
    /// Did sentinel inspection find a write past any tracked allocation?
    fn check_heap_overflow(&self) -> bool;
    fn heap_begin(&self) -> usize;
    fn heap_end(&self) -> usize;
}

pub trait LeakCheckOps: Sync {
    /// Cheap scan for the end of the program.
    fn fast_leak_check(&self, heap_begin: usize, heap_end: usize) -> bool;
    /// Conservative scan usable mid-run.
    fn slow_leak_check(&self, heap_begin: usize, heap_end: usize) -> bool;
}

pub trait QuarantineOps: Sync {
    /// Insert a freed allocation into the FIFO quarantine. Returns false
    /// when the object could not be tracked.
    fn add(&self, slot: &ThreadSlot, ptr: *mut c_void, size: usize) -> bool;
    /// Post-hoc use-after-free sweep over one thread's quarantine.
    fn final_uaf_check(&self, slot: &ThreadSlot) -> bool;
}

pub trait SyscallRecorderOps: Sync {
    fn record_clone(&self, slot_index: usize, rc: i32, tid: pthread_t);
    fn get_clone(&self, slot_index: usize) -> (i32, pthread_t);
    /// Commit housekeeping: drop all recorded syscall results.
    fn epoch_end_well(&self);
    /// Rewind the replay cursors, keeping the recorded results.
    fn prepare_rollback(&self);
}

struct NullMemory;

impl MemoryOps for NullMemory {
    fn epoch_begin(&self) {}
    fn rollback(&self) {}
    fn realfree(&self, _ptr: *mut c_void) {}
    fn check_heap_overflow(&self) -> bool {
        false
    }
    fn heap_begin(&self) -> usize {
        0
    }
    fn heap_end(&self) -> usize {
        0
    }
}

struct NullLeakCheck;

impl LeakCheckOps for NullLeakCheck {
    fn fast_leak_check(&self, _b: usize, _e: usize) -> bool {
        false
    }
    fn slow_leak_check(&self, _b: usize, _e: usize) -> bool {
        false
    }
}

struct NullQuarantine;

impl QuarantineOps for NullQuarantine {
    fn add(&self, _slot: &ThreadSlot, _ptr: *mut c_void, _size: usize) -> bool {
        false
    }
    fn final_uaf_check(&self, _slot: &ThreadSlot) -> bool {
        false
    }
}

static NULL_MEMORY: NullMemory = NullMemory;
static NULL_LEAKCHECK: NullLeakCheck = NullLeakCheck;
static NULL_QUARANTINE: NullQuarantine = NullQuarantine;

struct Registry {
    memory: Cell<Option<&'static dyn MemoryOps>>,
    leakcheck: Cell<Option<&'static dyn LeakCheckOps>>,
    quarantine: Cell<Option<&'static dyn QuarantineOps>>,
    recorder: Cell<Option<&'static dyn SyscallRecorderOps>>,
}

// Installation happens while the process is single-threaded (library
// constructors); afterwards the cells are only read.
unsafe impl Sync for Registry {}

static REGISTRY: Registry = Registry {
    memory: Cell::new(None),
    leakcheck: Cell::new(None),
    quarantine: Cell::new(None),
    recorder: Cell::new(None),
};

pub fn install_memory(ops: &'static dyn MemoryOps) {
    REGISTRY.memory.set(Some(ops));
}

pub fn install_leakcheck(ops: &'static dyn LeakCheckOps) {
    REGISTRY.leakcheck.set(Some(ops));
}

pub fn install_quarantine(ops: &'static dyn QuarantineOps) {
    REGISTRY.quarantine.set(Some(ops));
}

pub fn install_recorder(ops: &'static dyn SyscallRecorderOps) {
    REGISTRY.recorder.set(Some(ops));
}

pub fn memory() -> &'static dyn MemoryOps {
    REGISTRY.memory.get().unwrap_or(&NULL_MEMORY)
}

pub fn leakcheck() -> &'static dyn LeakCheckOps {
    REGISTRY.leakcheck.get().unwrap_or(&NULL_LEAKCHECK)
}

pub fn quarantine() -> &'static dyn QuarantineOps {
    REGISTRY.quarantine.get().unwrap_or(&NULL_QUARANTINE)
}

pub fn recorder() -> &'static dyn SyscallRecorderOps {
    REGISTRY.recorder.get().unwrap_or(&DEFAULT_RECORDER)
}

/// One recorded thread creation.
struct CloneRecord {
    rc: AtomicI32,
    tid: AtomicU64,
}

/// Per-slot bounded queue of clone results: appended during record, read
/// back in order during replay, emptied at commit.
struct CloneRing {
    read: AtomicUsize,
    write: AtomicUsize,
    entries: *mut CloneRecord,
}

unsafe impl Sync for CloneRing {}
unsafe impl Send for CloneRing {}

pub struct DefaultRecorder {
    rings: AtomicPtr<CloneRing>,
}

unsafe impl Sync for DefaultRecorder {}

static DEFAULT_RECORDER: DefaultRecorder = DefaultRecorder {
    rings: AtomicPtr::new(ptr::null_mut()),
};

impl DefaultRecorder {
    /// Allocate the per-slot rings. Idempotent; called during runtime
    /// init.
    pub fn initialize() {
        if !DEFAULT_RECORDER.rings.load(Ordering::Acquire).is_null() {
            return;
        }
        let heap = crate::internal_heap::InternalHeap::get();
        let rings = heap.malloc(MAX_ALIVE_THREADS * std::mem::size_of::<CloneRing>())
            as *mut CloneRing;
        for i in 0..MAX_ALIVE_THREADS {
            let entries = heap.malloc(CLONE_LOG_ENTRIES * std::mem::size_of::<CloneRecord>())
                as *mut CloneRecord;
            unsafe {
                ptr::write_bytes(entries as *mut u8, 0, CLONE_LOG_ENTRIES * std::mem::size_of::<CloneRecord>());
                ptr::write(
                    rings.add(i),
                    CloneRing {
                        read: AtomicUsize::new(0),
                        write: AtomicUsize::new(0),
                        entries,
                    },
                );
            }
        }
        DEFAULT_RECORDER.rings.store(rings, Ordering::Release);
    }

    fn ring(&self, slot_index: usize) -> &CloneRing {
        let base = self.rings.load(Ordering::Acquire);
        require!(!base.is_null(), "clone recorder used before init");
        require!(slot_index < MAX_ALIVE_THREADS, "bad slot index {}", slot_index);
        unsafe { &*base.add(slot_index) }
    }
}

impl SyscallRecorderOps for DefaultRecorder {
    fn record_clone(&self, slot_index: usize, rc: i32, tid: pthread_t) {
        let ring = self.ring(slot_index);
        let idx = ring.write.load(Ordering::Relaxed);
        if idx >= CLONE_LOG_ENTRIES {
            fatal!("clone log full ({} entries)", CLONE_LOG_ENTRIES);
        }
        let entry = unsafe { &*ring.entries.add(idx) };
        entry.rc.store(rc, Ordering::Relaxed);
        entry.tid.store(tid as u64, Ordering::Relaxed);
        ring.write.store(idx + 1, Ordering::Release);
    }

    fn get_clone(&self, slot_index: usize) -> (i32, pthread_t) {
        let ring = self.ring(slot_index);
        let idx = ring.read.load(Ordering::Relaxed);
        if idx >= ring.write.load(Ordering::Acquire) {
            fatal!("replay requested a thread creation that was never recorded");
        }
        ring.read.store(idx + 1, Ordering::Relaxed);
        let entry = unsafe { &*ring.entries.add(idx) };
        (
            entry.rc.load(Ordering::Relaxed),
            entry.tid.load(Ordering::Relaxed) as pthread_t,
        )
    }

    fn epoch_end_well(&self) {
        let base = self.rings.load(Ordering::Acquire);
        if base.is_null() {
            return;
        }
        for i in 0..MAX_ALIVE_THREADS {
            let ring = unsafe { &*base.add(i) };
            ring.read.store(0, Ordering::Relaxed);
            ring.write.store(0, Ordering::Release);
        }
    }

    fn prepare_rollback(&self) {
        let base = self.rings.load(Ordering::Acquire);
        if base.is_null() {
            return;
        }
        for i in 0..MAX_ALIVE_THREADS {
            let ring = unsafe { &*base.add(i) };
            ring.read.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_collaborators_detect_nothing() {
        assert!(!memory().check_heap_overflow());
        assert!(!leakcheck().fast_leak_check(0, 0));
        assert!(!leakcheck().slow_leak_check(0, 0));
    }

    #[test]
    fn clone_ring_replays_in_order() {
        crate::internal_heap::InternalHeap::get().initialize();
        DefaultRecorder::initialize();
        let rec = recorder();

        rec.record_clone(5, 0, 0x1111);
        rec.record_clone(5, 0, 0x2222);
        rec.prepare_rollback();
        assert_eq!(rec.get_clone(5), (0, 0x1111));
        assert_eq!(rec.get_clone(5), (0, 0x2222));

        // A second rollback would re-read from the start; commit clears.
        rec.prepare_rollback();
        assert_eq!(rec.get_clone(5), (0, 0x1111));
        rec.epoch_end_well();
    }
}
