//! Bounded array of thread slots plus the deferred-destroy list. Slot
//! allocation scans from a rotating cursor under the global runtime lock;
//! released slots only become reusable at a commit, so a join of a thread
//! spawned and exited within one epoch still has a valid record during
//! replay.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use libc::pthread_t;

use crate::defines::{
    MAX_ALIVE_THREADS, MAX_REAPABLE_THREADS, MAX_STACK_SIZE, NO_SLOT, QUARANTINE_ENTRIES,
};
use crate::internal_heap::InternalHeap;
use crate::log::LogLevel::LogDebug;
use crate::thread_slot::{ThrStatus, ThreadSlot};

thread_local! {
    static CURRENT: Cell<usize> = Cell::new(NO_SLOT);
}

pub fn set_current_index(idx: usize) {
    CURRENT.with(|c| c.set(idx));
}

pub fn current_index() -> usize {
    CURRENT.with(|c| c.get())
}

pub fn has_current() -> bool {
    current_index() != NO_SLOT
}

/// The calling thread's slot. Only valid after registration.
pub fn current() -> &'static ThreadSlot {
    let idx = current_index();
    require!(idx != NO_SLOT, "calling thread has no slot");
    table().slot(idx)
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DeferKind {
    Thread = 0,
    Mutex = 1,
    Cond = 2,
    Barrier = 3,
}

impl DeferKind {
    fn from_u32(v: u32) -> DeferKind {
        match v {
            0 => DeferKind::Thread,
            1 => DeferKind::Mutex,
            2 => DeferKind::Cond,
            3 => DeferKind::Barrier,
            other => fatal!("corrupt defer kind {}", other),
        }
    }
}

struct DeferNode {
    next: *mut DeferNode,
    kind: u32,
    value: usize,
}

pub struct ThreadTable {
    initialized: AtomicBool,
    slots: AtomicPtr<ThreadSlot>,
    alive: AtomicUsize,
    reapable: AtomicUsize,
    cursor: AtomicUsize,
    defer_head: AtomicUsize,
    defer_tail: AtomicUsize,
    defer_lock: AtomicBool,
}

static TABLE: ThreadTable = ThreadTable {
    initialized: AtomicBool::new(false),
    slots: AtomicPtr::new(ptr::null_mut()),
    alive: AtomicUsize::new(0),
    reapable: AtomicUsize::new(0),
    cursor: AtomicUsize::new(0),
    defer_head: AtomicUsize::new(0),
    defer_tail: AtomicUsize::new(0),
    defer_lock: AtomicBool::new(false),
};

pub fn table() -> &'static ThreadTable {
    &TABLE
}

fn mmap_anon(size: usize) -> *mut u8 {
    let p = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        fatal!("mmap of {} bytes failed (errno {})", size, nix::errno::errno());
    }
    p as *mut u8
}

impl ThreadTable {
    /// Build every slot once: slot storage, one max-stack backup region and
    /// one quarantine buffer per slot. Idempotent.
    pub fn initialize(&self) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }
        InternalHeap::get().initialize();

        let slots =
            mmap_anon(MAX_ALIVE_THREADS * std::mem::size_of::<ThreadSlot>()) as *mut ThreadSlot;
        let backups = mmap_anon(MAX_ALIVE_THREADS * MAX_STACK_SIZE);
        let qbuf_stride = QUARANTINE_ENTRIES * 2 * std::mem::size_of::<usize>();
        let qbufs = mmap_anon(MAX_ALIVE_THREADS * qbuf_stride);

        for i in 0..MAX_ALIVE_THREADS {
            let backup = unsafe { backups.add(i * MAX_STACK_SIZE) };
            let slot = ThreadSlot::new(i, backup);
            slot.quarantine_buf
                .store(unsafe { qbufs.add(i * qbuf_stride) } as usize, Ordering::Relaxed);
            slot.quarantine_entries
                .store(QUARANTINE_ENTRIES, Ordering::Relaxed);
            unsafe {
                ptr::write(slots.add(i), slot);
                (*slots.add(i)).init_primitives();
            }
        }
        self.slots.store(slots, Ordering::Release);
    }

    pub fn slot(&self, idx: usize) -> &'static ThreadSlot {
        require!(idx < MAX_ALIVE_THREADS, "thread slot index {} out of range", idx);
        let base = self.slots.load(Ordering::Acquire);
        require!(!base.is_null(), "thread table used before init");
        unsafe { &*base.add(idx) }
    }

    pub fn alive_threads(&self) -> usize {
        self.alive.load(Ordering::Acquire)
    }

    pub fn reapable_threads(&self) -> usize {
        self.reapable.load(Ordering::Acquire)
    }

    /// Allocate a slot for a new thread. Caller holds the global runtime
    /// lock. Exceeding the build-time bound is fatal.
    pub fn alloc_slot(&self) -> &'static ThreadSlot {
        if self.alive.load(Ordering::Acquire) >= MAX_ALIVE_THREADS {
            fatal!("more than {} live threads", MAX_ALIVE_THREADS);
        }
        let origin = self.cursor.load(Ordering::Relaxed);
        let mut idx = origin;
        loop {
            let slot = self.slot(idx);
            let next = (idx + 1) % MAX_ALIVE_THREADS;
            self.cursor.store(next, Ordering::Relaxed);
            if slot.available.swap(false, Ordering::AcqRel) {
                self.alive.fetch_add(1, Ordering::AcqRel);
                log!(LogDebug, "allocated thread slot {}", idx);
                return slot;
            }
            idx = next;
            // The alive check above guarantees a free slot exists.
            require!(idx != origin, "thread table scan wrapped with no free slot");
        }
    }

    /// Map a platform handle back to its slot. Caller holds the global
    /// runtime lock (the table is small enough that a scan beats keeping a
    /// separate map coherent across rollback).
    pub fn find_by_handle(&self, handle: pthread_t) -> Option<&'static ThreadSlot> {
        self.live_slots().find(|s| s.handle() == handle)
    }

    /// All slots currently owned by a thread, in index order.
    pub fn live_slots(&self) -> impl Iterator<Item = &'static ThreadSlot> + '_ {
        (0..MAX_ALIVE_THREADS)
            .map(move |i| self.slot(i))
            .filter(|s| !s.available.load(Ordering::Acquire))
    }

    fn defer_acquire(&self) {
        while self
            .defer_lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn defer_release(&self) {
        self.defer_lock.store(false, Ordering::Release);
    }

    /// Queue a destroyed handle (or an exited thread) for reclamation at
    /// the next commit. Returns true when the caller should force a commit:
    /// the reapable backlog is at the threshold and only one other thread
    /// is still running.
    pub fn defer_destroy(&self, kind: DeferKind, value: usize) -> bool {
        let node = InternalHeap::get().alloc::<DeferNode>();
        unsafe {
            (*node).next = ptr::null_mut();
            (*node).kind = kind as u32;
            (*node).value = value;
        }

        self.defer_acquire();
        let tail = self.defer_tail.load(Ordering::Relaxed) as *mut DeferNode;
        if tail.is_null() {
            self.defer_head.store(node as usize, Ordering::Relaxed);
        } else {
            unsafe { (*tail).next = node };
        }
        self.defer_tail.store(node as usize, Ordering::Relaxed);
        self.defer_release();

        if kind == DeferKind::Thread {
            let reapable = self.reapable.fetch_add(1, Ordering::AcqRel) + 1;
            let alive = self.alive.load(Ordering::Acquire);
            return reapable >= MAX_REAPABLE_THREADS && alive - reapable == 1;
        }
        false
    }

    /// Drain the deferred list at commit. Thread entries release their
    /// slot; sync entries are handed back to the interception layer for
    /// real destruction.
    pub fn run_deferred(&self, reclaim_sync: impl Fn(DeferKind, usize)) {
        self.defer_acquire();
        let mut node = self.defer_head.load(Ordering::Relaxed) as *mut DeferNode;
        self.defer_head.store(0, Ordering::Relaxed);
        self.defer_tail.store(0, Ordering::Relaxed);
        self.defer_release();

        while !node.is_null() {
            let next = unsafe { (*node).next };
            let kind = DeferKind::from_u32(unsafe { (*node).kind });
            let value = unsafe { (*node).value };
            match kind {
                DeferKind::Thread => self.release_slot(self.slot(value)),
                _ => reclaim_sync(kind, value),
            }
            InternalHeap::get().free(node as *mut u8);
            node = next;
        }
    }

    fn release_slot(&self, slot: &ThreadSlot) {
        log!(LogDebug, "releasing thread slot {}", slot.index);
        slot.set_handle(0);
        slot.set_tid(0);
        slot.set_joiner(NO_SLOT);
        slot.set_parent(NO_SLOT);
        slot.has_joined.store(false, Ordering::Release);
        slot.is_detached.store(false, Ordering::Release);
        slot.set_status(ThrStatus::Starting);
        slot.events.clear();
        slot.available.store(true, Ordering::Release);
        self.alive.fetch_sub(1, Ordering::AcqRel);
        self.reapable.fetch_sub(1, Ordering::AcqRel);
    }

    /// Withdraw a cancelled thread immediately (it will never reach the
    /// exit protocol).
    pub fn withdraw_cancelled(&self, slot: &ThreadSlot) {
        slot.set_status(ThrStatus::Starting);
        slot.events.clear();
        slot.available.store(true, Ordering::Release);
        self.alive.fetch_sub(1, Ordering::AcqRel);
    }

    /// Rollback preparation: fresh replay semaphores and rewound thread
    /// logs for every live thread. Status changes and wakeups are driven by
    /// the epoch controller, which knows which thread is committing.
    pub fn prepare_rollback(&self) {
        for slot in self.live_slots() {
            slot.reinit_semaphore();
            slot.events.reset_for_replay();
        }
    }

    /// Commit housekeeping for the logs: recorded events are discarded.
    pub fn clear_thread_logs(&self) {
        for slot in self.live_slots() {
            slot.events.clear();
        }
    }

    pub fn destroy_all_semaphores(&self) {
        for slot in self.live_slots() {
            slot.destroy_semaphore();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    lazy_static! {
        // The table is process-global; keep these tests off each other.
        static ref GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
    }

    fn init() -> &'static ThreadTable {
        crate::real::initialize();
        let t = table();
        t.initialize();
        t
    }

    #[test]
    fn alloc_rotates_and_releases_at_commit() {
        let _g = GUARD.lock().unwrap();
        let t = init();
        let before = t.alive_threads();

        let a = t.alloc_slot();
        let b = t.alloc_slot();
        assert_ne!(a.index, b.index);
        assert_eq!(t.alive_threads(), before + 2);

        // Releasing is deferred: the slots stay owned until run_deferred.
        t.defer_destroy(DeferKind::Thread, a.index);
        t.defer_destroy(DeferKind::Thread, b.index);
        assert_eq!(t.alive_threads(), before + 2);
        assert_eq!(t.reapable_threads(), 2);

        t.run_deferred(|_, _| panic!("no sync entries queued"));
        assert_eq!(t.alive_threads(), before);
        assert_eq!(t.reapable_threads(), 0);
        assert!(a.available.load(Ordering::Acquire));
        assert!(b.available.load(Ordering::Acquire));
    }

    #[test]
    fn deferred_sync_entries_reach_the_callback() {
        let _g = GUARD.lock().unwrap();
        let t = init();
        t.defer_destroy(DeferKind::Mutex, 0x1000);
        t.defer_destroy(DeferKind::Cond, 0x2000);

        let seen = std::cell::RefCell::new(Vec::new());
        t.run_deferred(|kind, value| seen.borrow_mut().push((kind, value)));
        let seen = seen.into_inner();
        assert!(seen.contains(&(DeferKind::Mutex, 0x1000)));
        assert!(seen.contains(&(DeferKind::Cond, 0x2000)));
    }

    #[test]
    fn handle_lookup_scans_live_slots() {
        let _g = GUARD.lock().unwrap();
        let t = init();
        let slot = t.alloc_slot();
        slot.set_handle(0xdead_beef);
        assert_eq!(
            t.find_by_handle(0xdead_beef).map(|s| s.index),
            Some(slot.index)
        );
        t.defer_destroy(DeferKind::Thread, slot.index);
        t.run_deferred(|_, _| {});
        assert!(t.find_by_handle(0xdead_beef).is_none());
    }

    #[test]
    fn current_thread_binding() {
        let _g = GUARD.lock().unwrap();
        let t = init();
        assert!(!has_current());
        let slot = t.alloc_slot();
        set_current_index(slot.index);
        assert_eq!(current().index, slot.index);
        set_current_index(NO_SLOT);
        t.defer_destroy(DeferKind::Thread, slot.index);
        t.run_deferred(|_, _| {});
    }
}
