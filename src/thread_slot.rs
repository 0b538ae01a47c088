//! One slot per possible live thread. A slot is owned by exactly one native
//! thread from allocation until the deferred reaping point; its snapshot
//! buffer is handed out once at table initialization and reused across
//! epochs. Cross-thread fields are atomics; the context and the private
//! primitives are only touched under the slot's own lifecycle lock or by
//! the owner.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use libc::{c_void, pid_t, pthread_t};

use crate::context::Context;
use crate::defines::NO_SLOT;
use crate::real;
use crate::sync_event::ThreadEventLog;

#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ThrStatus {
    /// Allocated by the parent; the child has not registered yet.
    Starting = 0,
    Running = 1,
    /// Blocked joining another thread.
    Joining = 2,
    /// Told to leave its post-exit park and actually die (reaping).
    Exiting = 3,
    /// Parked in an application condition wait.
    CondWaiting = 4,
    /// Told to restore its snapshot.
    Rollback = 5,
    /// Finished its start routine; parked until a commit reaps it so the
    /// epoch stays reproducible.
    WaitforReaping = 6,
}

impl ThrStatus {
    fn from_u32(v: u32) -> ThrStatus {
        match v {
            0 => ThrStatus::Starting,
            1 => ThrStatus::Running,
            2 => ThrStatus::Joining,
            3 => ThrStatus::Exiting,
            4 => ThrStatus::CondWaiting,
            5 => ThrStatus::Rollback,
            6 => ThrStatus::WaitforReaping,
            other => fatal!("corrupt thread status {}", other),
        }
    }
}

pub type StartRoutine = unsafe extern "C" fn(*mut c_void) -> *mut c_void;

pub struct ThreadSlot {
    pub index: usize,

    tid: AtomicI32,
    handle: AtomicU64,
    parent: AtomicUsize,
    joiner: AtomicUsize,
    status: AtomicU32,

    pub available: AtomicBool,
    pub is_newly_spawned: AtomicBool,
    pub is_detached: AtomicBool,
    pub has_joined: AtomicBool,
    pub is_safe: AtomicBool,
    pub disable_check: AtomicBool,
    pub is_main: AtomicBool,

    stack_bottom: AtomicUsize,
    stack_top: AtomicUsize,

    /// Real condition variable the thread is parked on, if any; rollback
    /// wakeups signal through this.
    condwait: AtomicPtr<libc::pthread_cond_t>,

    context: UnsafeCell<Context>,

    /// Replay gating: a thread waits here until the logs say it is its
    /// turn.
    sema: UnsafeCell<libc::sem_t>,
    /// Lifecycle transitions (registration, exit, join) are protected by
    /// this private pair, never by application-visible primitives.
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,

    pub events: ThreadEventLog,

    /// Per-thread alternate signal stack; the stop handler must not run on
    /// the stack it is about to rewrite. Mapped lazily at first
    /// registration, reused across slot reuse.
    pub alt_stack: AtomicUsize,

    /// Handed to the external use-after-free checker.
    pub quarantine_buf: AtomicUsize,
    pub quarantine_entries: AtomicUsize,

    start_routine: AtomicUsize,
    start_arg: AtomicPtr<c_void>,
    result: AtomicPtr<c_void>,
}

unsafe impl Sync for ThreadSlot {}
unsafe impl Send for ThreadSlot {}

impl ThreadSlot {
    /// Build a fresh slot. The caller writes it into table storage; the
    /// private primitives are initialized separately because they need the
    /// final address.
    pub fn new(index: usize, backup: *mut u8) -> ThreadSlot {
        let mut context: Context = unsafe { std::mem::zeroed() };
        context.setup_backup(backup);
        ThreadSlot {
            index,
            tid: AtomicI32::new(0),
            handle: AtomicU64::new(0),
            parent: AtomicUsize::new(NO_SLOT),
            joiner: AtomicUsize::new(NO_SLOT),
            status: AtomicU32::new(ThrStatus::Starting as u32),
            available: AtomicBool::new(true),
            is_newly_spawned: AtomicBool::new(false),
            is_detached: AtomicBool::new(false),
            has_joined: AtomicBool::new(false),
            is_safe: AtomicBool::new(false),
            disable_check: AtomicBool::new(false),
            is_main: AtomicBool::new(false),
            stack_bottom: AtomicUsize::new(0),
            stack_top: AtomicUsize::new(0),
            condwait: AtomicPtr::new(std::ptr::null_mut()),
            alt_stack: AtomicUsize::new(0),
            context: UnsafeCell::new(context),
            sema: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            mutex: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            cond: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            events: ThreadEventLog::new(),
            quarantine_buf: AtomicUsize::new(0),
            quarantine_entries: AtomicUsize::new(0),
            start_routine: AtomicUsize::new(0),
            start_arg: AtomicPtr::new(std::ptr::null_mut()),
            result: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Initialize the private primitives at their final address.
    pub unsafe fn init_primitives(&self) {
        (real::table().pthread_mutex_init)(self.mutex.get(), std::ptr::null());
        (real::table().pthread_cond_init)(self.cond.get(), std::ptr::null());
        (real::table().sem_init)(self.sema.get(), 0, 0);
    }

    // Identity.

    pub fn tid(&self) -> pid_t {
        self.tid.load(Ordering::Acquire)
    }

    pub fn set_tid(&self, tid: pid_t) {
        self.tid.store(tid, Ordering::Release);
    }

    pub fn handle(&self) -> pthread_t {
        self.handle.load(Ordering::Acquire) as pthread_t
    }

    pub fn set_handle(&self, handle: pthread_t) {
        self.handle.store(handle as u64, Ordering::Release);
    }

    pub fn parent(&self) -> usize {
        self.parent.load(Ordering::Acquire)
    }

    pub fn set_parent(&self, idx: usize) {
        self.parent.store(idx, Ordering::Release);
    }

    pub fn joiner(&self) -> usize {
        self.joiner.load(Ordering::Acquire)
    }

    pub fn set_joiner(&self, idx: usize) {
        self.joiner.store(idx, Ordering::Release);
    }

    // Status.

    pub fn status(&self) -> ThrStatus {
        ThrStatus::from_u32(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ThrStatus) {
        self.status.store(status as u32, Ordering::Release);
    }

    /// Parked on a pre-existing wait; the committer must not send the stop
    /// signal to such a thread.
    pub fn is_parked(&self) -> bool {
        matches!(
            self.status(),
            ThrStatus::WaitforReaping | ThrStatus::Joining | ThrStatus::CondWaiting
        )
    }

    // Stack bounds.

    pub fn set_stack(&self, bottom: usize, top: usize) {
        self.stack_bottom.store(bottom, Ordering::Release);
        self.stack_top.store(top, Ordering::Release);
    }

    pub fn stack_bottom(&self) -> usize {
        self.stack_bottom.load(Ordering::Acquire)
    }

    pub fn stack_top(&self) -> usize {
        self.stack_top.load(Ordering::Acquire)
    }

    // Condwait bookkeeping.

    pub fn condwait(&self) -> *mut libc::pthread_cond_t {
        self.condwait.load(Ordering::Acquire)
    }

    pub fn set_condwait(&self, cond: *mut libc::pthread_cond_t) {
        self.condwait.store(cond, Ordering::Release);
    }

    // Start routine plumbing.

    pub fn set_start(&self, routine: StartRoutine, arg: *mut c_void) {
        self.start_routine.store(routine as usize, Ordering::Release);
        self.start_arg.store(arg, Ordering::Release);
    }

    pub fn start_routine(&self) -> StartRoutine {
        let raw = self.start_routine.load(Ordering::Acquire);
        debug_assert_ne!(raw, 0);
        unsafe { std::mem::transmute::<usize, StartRoutine>(raw) }
    }

    pub fn start_arg(&self) -> *mut c_void {
        self.start_arg.load(Ordering::Acquire)
    }

    pub fn set_result(&self, result: *mut c_void) {
        self.result.store(result, Ordering::Release);
    }

    pub fn result(&self) -> *mut c_void {
        self.result.load(Ordering::Acquire)
    }

    // Context. Callers must hold the ownership described in the module
    // docs; the committer only touches parked threads.

    pub unsafe fn context(&self) -> &Context {
        &*self.context.get()
    }

    pub unsafe fn context_mut(&self) -> &mut Context {
        &mut *self.context.get()
    }

    // Lifecycle lock, condition and semaphore.

    pub fn lock(&self) {
        unsafe {
            (real::table().pthread_mutex_lock)(self.mutex.get());
        }
    }

    pub fn unlock(&self) {
        unsafe {
            (real::table().pthread_mutex_unlock)(self.mutex.get());
        }
    }

    /// Wait on the lifecycle cond; the lifecycle lock must be held.
    pub fn wait(&self) {
        unsafe {
            (real::table().pthread_cond_wait)(self.cond.get(), self.mutex.get());
        }
    }

    pub fn signal(&self) {
        unsafe {
            (real::table().pthread_cond_signal)(self.cond.get());
        }
    }

    pub fn lifecycle_cond(&self) -> *mut libc::pthread_cond_t {
        self.cond.get()
    }

    pub fn wait_semaphore(&self) {
        unsafe {
            while (real::table().sem_wait)(self.sema.get()) != 0 {
                // Interrupted by the stop signal; retry.
            }
        }
    }

    pub fn post_semaphore(&self) {
        unsafe {
            (real::table().sem_post)(self.sema.get());
        }
    }

    /// Fresh, empty semaphore for replay gating.
    pub fn reinit_semaphore(&self) {
        unsafe {
            (real::table().sem_destroy)(self.sema.get());
            (real::table().sem_init)(self.sema.get(), 0, 0);
        }
    }

    pub fn destroy_semaphore(&self) {
        unsafe {
            (real::table().sem_destroy)(self.sema.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal_heap::InternalHeap;

    fn new_slot() -> &'static ThreadSlot {
        InternalHeap::get().initialize();
        let slot = Box::leak(Box::new(ThreadSlot::new(7, std::ptr::null_mut())));
        unsafe { slot.init_primitives() };
        slot
    }

    #[test]
    fn status_roundtrip() {
        let slot = new_slot();
        assert_eq!(slot.status(), ThrStatus::Starting);
        slot.set_status(ThrStatus::Running);
        assert_eq!(slot.status(), ThrStatus::Running);
        assert!(!slot.is_parked());
        slot.set_status(ThrStatus::CondWaiting);
        assert!(slot.is_parked());
        slot.set_status(ThrStatus::WaitforReaping);
        assert!(slot.is_parked());
    }

    #[test]
    fn semaphore_token_roundtrip() {
        let slot = new_slot();
        slot.post_semaphore();
        // One token is available; the wait must not block.
        slot.wait_semaphore();
        slot.reinit_semaphore();
        slot.post_semaphore();
        slot.wait_semaphore();
    }
}
