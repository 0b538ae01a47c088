//! Ordered records of synchronization outcomes. Every sync object owns a
//! bounded event log; every thread additionally keeps the sequence of
//! events it performed, in creation order. Record mode appends to both;
//! replay mode walks the thread log strictly in order and uses the object
//! logs to decide whose turn it is.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::defines::{OBJECT_LOG_ENTRIES, THREAD_LOG_ENTRIES};
use crate::internal_heap::InternalHeap;

#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyncEventKind {
    Spawn = 0,
    MutexLock = 1,
    MutexTrylock = 2,
}

/// One recorded outcome. `list` points back at the owning object log so the
/// replaying thread can check it is acting on the object it recorded.
#[derive(Debug)]
pub struct SyncEvent {
    pub kind: SyncEventKind,
    pub ret: i32,
    pub tindex: usize,
    pub list: *const SyncEventList,
}

/// A mismatch between a thread's next recorded event and the operation it
/// is replaying. The epoch cannot be reproduced past this point; callers
/// escalate to a fatal abort.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReplayError {
    MissingEvent,
    WrongObject,
}

/// Bounded, append-only log attached to one sync object. Appends are
/// serialized by the log's own small lock; the cursor is only moved by the
/// strictly sequential replay.
pub struct SyncEventList {
    kind: SyncEventKind,
    lock: AtomicBool,
    len: AtomicUsize,
    /// Index of the event currently holding the object during replay.
    cursor: AtomicUsize,
    entries: *mut SyncEvent,
}

unsafe impl Sync for SyncEventList {}
unsafe impl Send for SyncEventList {}

impl SyncEventList {
    /// Construct in place (the log sits right behind its shadow object in
    /// the internal heap); the entry array comes from the internal heap.
    pub unsafe fn init_at(this: *mut SyncEventList, kind: SyncEventKind) {
        let entries = InternalHeap::get()
            .malloc(OBJECT_LOG_ENTRIES * std::mem::size_of::<SyncEvent>())
            as *mut SyncEvent;
        ptr::write(
            this,
            SyncEventList {
                kind,
                lock: AtomicBool::new(false),
                len: AtomicUsize::new(0),
                cursor: AtomicUsize::new(0),
                entries,
            },
        );
    }

    pub fn kind(&self) -> SyncEventKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    fn entry(&self, idx: usize) -> &SyncEvent {
        debug_assert!(idx < self.len());
        unsafe { &*self.entries.add(idx) }
    }

    fn acquire(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn release(&self) {
        self.lock.store(false, Ordering::Release);
    }

    /// Append one outcome; returns the stored event for the acting
    /// thread's own log.
    pub fn record(&self, kind: SyncEventKind, ret: i32, tindex: usize) -> *const SyncEvent {
        self.acquire();
        let idx = self.len.load(Ordering::Relaxed);
        if idx >= OBJECT_LOG_ENTRIES {
            self.release();
            fatal!("sync event log full ({} entries)", OBJECT_LOG_ENTRIES);
        }
        let slot = unsafe { self.entries.add(idx) };
        unsafe {
            ptr::write(
                slot,
                SyncEvent {
                    kind,
                    ret,
                    tindex,
                    list: self,
                },
            );
        }
        self.len.store(idx + 1, Ordering::Release);
        self.release();
        slot
    }

    /// The event currently holding the object, if any.
    pub fn peek(&self) -> Option<&SyncEvent> {
        let cursor = self.cursor.load(Ordering::Acquire);
        if cursor < self.len() {
            Some(self.entry(cursor))
        } else {
            None
        }
    }

    /// Move past the current holder to the next *successful* acquisition
    /// and return it, so the caller can hand the object off. Recorded
    /// failures never held the object, so they are skipped; their threads
    /// consume no semaphore token during replay.
    pub fn advance(&self) -> Option<&SyncEvent> {
        let mut cursor = self.cursor.load(Ordering::Acquire);
        loop {
            cursor += 1;
            if cursor >= self.len() {
                self.cursor.store(self.len(), Ordering::Release);
                return None;
            }
            if self.entry(cursor).ret == 0 {
                self.cursor.store(cursor, Ordering::Release);
                return Some(self.entry(cursor));
            }
        }
    }

    /// Rewind for replay: park the cursor on the first successful
    /// acquisition and return it (its thread receives the initial
    /// semaphore token).
    pub fn reset_for_replay(&self) -> Option<&SyncEvent> {
        let len = self.len();
        let mut cursor = 0;
        while cursor < len && self.entry(cursor).ret != 0 {
            cursor += 1;
        }
        self.cursor.store(cursor, Ordering::Release);
        if cursor < len {
            Some(self.entry(cursor))
        } else {
            None
        }
    }

    /// Discard everything at commit; the next epoch records afresh.
    pub fn clear(&self) {
        self.len.store(0, Ordering::Release);
        self.cursor.store(0, Ordering::Release);
    }

    /// Return the entry storage to the internal heap. Only called when the
    /// owning shadow object is reclaimed at commit; no log references can
    /// survive that point.
    pub unsafe fn dispose(&self) {
        InternalHeap::get().free(self.entries as *mut u8);
    }
}

/// A thread's private walk over the events it performed. Appended only by
/// the owning thread; the cursor is rewound by the committer while the
/// owner is parked.
pub struct ThreadEventLog {
    len: AtomicUsize,
    cursor: AtomicUsize,
    entries: *mut *const SyncEvent,
}

unsafe impl Sync for ThreadEventLog {}
unsafe impl Send for ThreadEventLog {}

impl ThreadEventLog {
    pub fn new() -> ThreadEventLog {
        let entries = InternalHeap::get()
            .malloc(THREAD_LOG_ENTRIES * std::mem::size_of::<*const SyncEvent>())
            as *mut *const SyncEvent;
        ThreadEventLog {
            len: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
            entries,
        }
    }

    pub fn record(&self, event: *const SyncEvent) {
        let idx = self.len.load(Ordering::Relaxed);
        if idx >= THREAD_LOG_ENTRIES {
            fatal!("thread event log full ({} entries)", THREAD_LOG_ENTRIES);
        }
        unsafe { ptr::write(self.entries.add(idx), event) };
        self.len.store(idx + 1, Ordering::Release);
    }

    /// Return code of the thread's next expected event, after checking it
    /// was recorded against the same object log the caller is replaying.
    pub fn peek_for(&self, list: *const SyncEventList) -> Result<i32, ReplayError> {
        let cursor = self.cursor.load(Ordering::Acquire);
        if cursor >= self.len.load(Ordering::Acquire) {
            return Err(ReplayError::MissingEvent);
        }
        let event = unsafe { &**self.entries.add(cursor) };
        if event.list != list {
            return Err(ReplayError::WrongObject);
        }
        Ok(event.ret)
    }

    pub fn advance(&self) {
        self.cursor.fetch_add(1, Ordering::AcqRel);
    }

    /// Rewind for replay, keeping the recorded contents.
    pub fn reset_for_replay(&self) {
        self.cursor.store(0, Ordering::Release);
    }

    /// Discard at commit.
    pub fn clear(&self) {
        self.len.store(0, Ordering::Release);
        self.cursor.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_list(kind: SyncEventKind) -> &'static SyncEventList {
        InternalHeap::get().initialize();
        let p = InternalHeap::get().alloc::<SyncEventList>();
        unsafe {
            SyncEventList::init_at(p, kind);
            &*p
        }
    }

    fn new_thread_log() -> &'static ThreadEventLog {
        InternalHeap::get().initialize();
        Box::leak(Box::new(ThreadEventLog::new()))
    }

    #[test]
    fn record_then_walk() {
        let list = new_list(SyncEventKind::MutexLock);
        list.record(SyncEventKind::MutexLock, 0, 1);
        list.record(SyncEventKind::MutexLock, 0, 2);
        assert_eq!(list.len(), 2);

        let head = list.reset_for_replay().unwrap();
        assert_eq!(head.tindex, 1);
        let next = list.advance().unwrap();
        assert_eq!(next.tindex, 2);
        assert!(list.advance().is_none());
    }

    #[test]
    fn advance_skips_recorded_failures() {
        let list = new_list(SyncEventKind::MutexLock);
        list.record(SyncEventKind::MutexTrylock, libc::EBUSY, 3);
        list.record(SyncEventKind::MutexLock, 0, 1);
        list.record(SyncEventKind::MutexTrylock, libc::EBUSY, 2);
        list.record(SyncEventKind::MutexLock, 0, 2);

        // The head owner is the first success, not the failed trylock.
        let head = list.reset_for_replay().unwrap();
        assert_eq!(head.tindex, 1);
        // Handoff jumps over the failure in the middle.
        let next = list.advance().unwrap();
        assert_eq!(next.tindex, 2);
        assert_eq!(next.ret, 0);
        assert!(list.advance().is_none());
    }

    #[test]
    fn clear_empties_the_log() {
        let list = new_list(SyncEventKind::MutexLock);
        list.record(SyncEventKind::MutexLock, 0, 0);
        list.clear();
        assert_eq!(list.len(), 0);
        assert!(list.reset_for_replay().is_none());
    }

    #[test]
    fn thread_log_checks_object_identity() {
        let list_a = new_list(SyncEventKind::MutexLock);
        let list_b = new_list(SyncEventKind::MutexLock);
        let tlog = new_thread_log();

        tlog.record(list_a.record(SyncEventKind::MutexLock, 0, 0));
        tlog.record(list_b.record(SyncEventKind::MutexLock, libc::EBUSY, 0));

        assert_eq!(tlog.peek_for(list_a), Ok(0));
        assert_eq!(tlog.peek_for(list_b), Err(ReplayError::WrongObject));
        tlog.advance();
        assert_eq!(tlog.peek_for(list_b), Ok(libc::EBUSY));
        tlog.advance();
        assert_eq!(tlog.peek_for(list_b), Err(ReplayError::MissingEvent));

        tlog.reset_for_replay();
        assert_eq!(tlog.peek_for(list_a), Ok(0));
        tlog.clear();
        assert_eq!(tlog.peek_for(list_a), Err(ReplayError::MissingEvent));
    }
}
