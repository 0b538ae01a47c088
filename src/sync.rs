//! Interception of mutexes, condition variables and barriers. Every
//! application-visible handle is paired with a shadow object in the
//! internal heap: the first word of the handle points at the shadow (the
//! real primitive), the second at the registry entry that ties the handle
//! to its event log. Record mode calls through the real primitive and
//! appends the outcome to the object's log and the acting thread's log;
//! replay mode never touches the real primitive and gates each thread on
//! its private semaphore until the logs say it is its turn.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use libc::{c_int, c_void, pthread_cond_t, pthread_condattr_t, pthread_mutex_t, pthread_mutexattr_t, timespec};

use crate::epoch::coordinator;
use crate::internal_heap::InternalHeap;
use crate::log::LogLevel::{LogDebug, LogInfo};
use crate::real;
use crate::sync_event::{SyncEvent, SyncEventKind, SyncEventList};
use crate::thread_slot::{ThrStatus, ThreadSlot};
use crate::thread_table::{current, table, DeferKind};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyncVarKind {
    Mutex,
    Cond,
    Barrier,
}

impl SyncVarKind {
    /// Bytes of shadow storage ahead of the event log.
    fn shadow_size(self) -> usize {
        match self {
            SyncVarKind::Mutex => mem::size_of::<pthread_mutex_t>(),
            SyncVarKind::Cond => mem::size_of::<pthread_cond_t>(),
            SyncVarKind::Barrier => {
                mem::size_of::<pthread_mutex_t>()
                    + mem::size_of::<pthread_cond_t>()
                    + mem::size_of::<BarrierInfo>()
            }
        }
    }

    fn defer_kind(self) -> DeferKind {
        match self {
            SyncVarKind::Mutex => DeferKind::Mutex,
            SyncVarKind::Cond => DeferKind::Cond,
            SyncVarKind::Barrier => DeferKind::Barrier,
        }
    }
}

/// Behind the first pointer of a barrier handle: the shadow is an internal
/// mutex, an internal cond and this bookkeeping block.
#[repr(C)]
struct BarrierInfo {
    max_threads: u32,
    waiting_threads: u32,
    is_arrival_phase: bool,
}

/// Registry tying a nominal handle to its shadow and log, so a replayed
/// `*_init` re-installs the existing shadow and a deferred destroy can
/// reclaim everything at commit.
pub struct SyncEntry {
    next: *mut SyncEntry,
    kind: SyncVarKind,
    nominal: usize,
    shadow: usize,
    list: *const SyncEventList,
}

struct SyncRegistry {
    lock: AtomicBool,
    head: AtomicPtr<SyncEntry>,
}

static REGISTRY: SyncRegistry = SyncRegistry {
    lock: AtomicBool::new(false),
    head: AtomicPtr::new(ptr::null_mut()),
};

/// Global ordered log of thread creations.
static SPAWN_LIST: AtomicPtr<SyncEventList> = AtomicPtr::new(ptr::null_mut());

pub fn init_spawn_list() {
    if !SPAWN_LIST.load(Ordering::Acquire).is_null() {
        return;
    }
    let list = InternalHeap::get().alloc::<SyncEventList>();
    unsafe { SyncEventList::init_at(list, SyncEventKind::Spawn) };
    SPAWN_LIST.store(list, Ordering::Release);
}

pub fn spawn_list() -> &'static SyncEventList {
    let p = SPAWN_LIST.load(Ordering::Acquire);
    require!(!p.is_null(), "spawn list used before init");
    unsafe { &*p }
}

impl SyncRegistry {
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

    fn add(&self, kind: SyncVarKind, nominal: usize, shadow: usize, list: *const SyncEventList) -> *mut SyncEntry {
        let entry = InternalHeap::get().alloc::<SyncEntry>();
        self.acquire();
        unsafe {
            (*entry).next = self.head.load(Ordering::Relaxed);
            (*entry).kind = kind;
            (*entry).nominal = nominal;
            (*entry).shadow = shadow;
            (*entry).list = list;
        }
        self.head.store(entry, Ordering::Relaxed);
        self.release();
        entry
    }

    fn find_by_nominal(&self, nominal: usize) -> *mut SyncEntry {
        self.acquire();
        let mut node = self.head.load(Ordering::Relaxed);
        while !node.is_null() {
            if unsafe { (*node).nominal } == nominal {
                break;
            }
            node = unsafe { (*node).next };
        }
        self.release();
        node
    }

    fn remove(&self, entry: *mut SyncEntry) {
        self.acquire();
        let mut prev: *mut SyncEntry = ptr::null_mut();
        let mut node = self.head.load(Ordering::Relaxed);
        while !node.is_null() {
            if node == entry {
                let next = unsafe { (*node).next };
                if prev.is_null() {
                    self.head.store(next, Ordering::Relaxed);
                } else {
                    unsafe { (*prev).next = next };
                }
                break;
            }
            prev = node;
            node = unsafe { (*node).next };
        }
        self.release();
    }

    fn for_each_list(&self, mut f: impl FnMut(&SyncEventList)) {
        self.acquire();
        let mut node = self.head.load(Ordering::Relaxed);
        while !node.is_null() {
            f(unsafe { &*(*node).list });
            node = unsafe { (*node).next };
        }
        self.release();
    }
}

// Handle plumbing. The two header words of the application's handle are
// treated as atomics so that racing initializers resolve with a CAS.

unsafe fn handle_word(handle: *mut c_void, word: usize) -> &'static AtomicUsize {
    &*((handle as *mut usize).add(word) as *const AtomicUsize)
}

unsafe fn get_shadow(handle: *mut c_void) -> usize {
    handle_word(handle, 0).load(Ordering::Acquire)
}

unsafe fn get_entry(handle: *mut c_void) -> *mut SyncEntry {
    handle_word(handle, 1).load(Ordering::Acquire) as *mut SyncEntry
}

fn is_invalid_shadow(shadow: usize) -> bool {
    !InternalHeap::get().in_range(shadow)
}

/// Event log placed immediately behind the shadow primitive.
unsafe fn shadow_list(shadow: usize, kind: SyncVarKind) -> &'static SyncEventList {
    &*((shadow + kind.shadow_size()) as *const SyncEventList)
}

/// Allocate shadow + adjacent log in one internal-heap block.
unsafe fn alloc_shadow(kind: SyncVarKind) -> (usize, *mut SyncEventList) {
    let total = kind.shadow_size() + mem::size_of::<SyncEventList>();
    let block = InternalHeap::get().malloc(total);
    ptr::write_bytes(block, 0, total);
    let shadow = block as usize;
    let list = (shadow + kind.shadow_size()) as *mut SyncEventList;
    SyncEventList::init_at(
        list,
        match kind {
            SyncVarKind::Mutex | SyncVarKind::Barrier => SyncEventKind::MutexLock,
            SyncVarKind::Cond => SyncEventKind::MutexLock,
        },
    );
    (shadow, list)
}

/// Double-checked construction: install the shadow with a CAS on the
/// handle's first word. The loser frees its allocation and adopts the
/// winner's shadow.
unsafe fn install_shadow(handle: *mut c_void, kind: SyncVarKind, shadow: usize, list: *mut SyncEventList) -> bool {
    let word0 = handle_word(handle, 0);
    let expected = word0.load(Ordering::Acquire);
    if is_invalid_shadow(expected)
        && word0
            .compare_exchange(expected, shadow, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    {
        let entry = REGISTRY.add(kind, handle as usize, shadow, list);
        handle_word(handle, 1).store(entry as usize, Ordering::Release);
        true
    } else {
        (*list).dispose();
        InternalHeap::get().free(shadow as *mut u8);
        false
    }
}

/// Replayed `*_init`: the shadow from the recorded epoch survives (destroys
/// are deferred), so point the handle back at it instead of allocating.
unsafe fn reset_shadow(handle: *mut c_void, kind: SyncVarKind) {
    let entry = REGISTRY.find_by_nominal(handle as usize);
    if entry.is_null() {
        fatal!(
            "replayed init of a {:?} that record mode never saw ({:p})",
            kind,
            handle
        );
    }
    handle_word(handle, 0).store((*entry).shadow, Ordering::Release);
    handle_word(handle, 1).store(entry as usize, Ordering::Release);
}

// Safe/unsafe discipline (§ concurrency model): unsafe while inside a real
// primitive whose interruption would deadlock the boundary, safe while
// parked somewhere interruption is harmless or intended.

pub fn set_thread_safe() {
    current().is_safe.store(true, Ordering::Release);
}

pub fn set_thread_unsafe() {
    current().is_safe.store(false, Ordering::Release);
}

/// Clear condwait bookkeeping after any park; if the committer flagged us
/// for rollback while we slept, release the given real mutex and restore.
pub unsafe fn check_rollback(held_mutex: *mut pthread_mutex_t) {
    let slot = current();
    slot.lock();
    slot.set_condwait(ptr::null_mut());
    if slot.status() == ThrStatus::Rollback {
        slot.unlock();
        if !held_mutex.is_null() {
            (real::table().pthread_mutex_unlock)(held_mutex);
        }
        crate::runtime::rollback_current();
    }
    slot.set_status(ThrStatus::Running);
    slot.unlock();
}

fn mark_condwait(slot: &ThreadSlot, cond: *mut pthread_cond_t) {
    slot.lock();
    slot.set_status(ThrStatus::CondWaiting);
    slot.set_condwait(cond);
    slot.unlock();
    // Parked from here on: the committer may pass us by.
    slot.is_safe.store(true, Ordering::Release);
}

// Mutex operations.

pub unsafe fn mutex_init(mutex: *mut pthread_mutex_t, attr: *const pthread_mutexattr_t) -> c_int {
    if !coordinator().is_rollback() {
        let (shadow, list) = alloc_shadow(SyncVarKind::Mutex);
        let rc = (real::table().pthread_mutex_init)(shadow as *mut pthread_mutex_t, attr);
        install_shadow(mutex as *mut c_void, SyncVarKind::Mutex, shadow, list);
        rc
    } else {
        reset_shadow(mutex as *mut c_void, SyncVarKind::Mutex);
        0
    }
}

unsafe fn resolve_mutex(mutex: *mut pthread_mutex_t) -> usize {
    let mut shadow = get_shadow(mutex as *mut c_void);
    if is_invalid_shadow(shadow) {
        // Statically initialized mutex seen for the first time.
        mutex_init(mutex, ptr::null());
        shadow = get_shadow(mutex as *mut c_void);
    }
    shadow
}

unsafe fn do_mutex_lock(mutex: *mut pthread_mutex_t, kind: SyncEventKind) -> c_int {
    let slot = current();
    let shadow = resolve_mutex(mutex);
    let list = shadow_list(shadow, SyncVarKind::Mutex);

    if !coordinator().is_rollback() {
        set_thread_unsafe();
        let rc = match kind {
            SyncEventKind::MutexTrylock => {
                (real::table().pthread_mutex_trylock)(shadow as *mut pthread_mutex_t)
            }
            _ => (real::table().pthread_mutex_lock)(shadow as *mut pthread_mutex_t),
        };
        let event = list.record(kind, rc, slot.index);
        slot.events.record(event);
        rc
    } else {
        let rc = replay_ret(slot, list);
        if rc == 0 {
            slot.wait_semaphore();
        }
        slot.events.advance();
        rc
    }
}

fn replay_ret(slot: &ThreadSlot, list: &SyncEventList) -> c_int {
    match slot.events.peek_for(list) {
        Ok(rc) => rc,
        Err(err) => fatal!(
            "replay diverged on thread {}: {:?} (cannot reproduce this epoch)",
            slot.index,
            err
        ),
    }
}

pub unsafe fn mutex_lock(mutex: *mut pthread_mutex_t) -> c_int {
    if current().disable_check.load(Ordering::Acquire) {
        return (real::table().pthread_mutex_lock)(mutex);
    }
    do_mutex_lock(mutex, SyncEventKind::MutexLock)
}

pub unsafe fn mutex_trylock(mutex: *mut pthread_mutex_t) -> c_int {
    if current().disable_check.load(Ordering::Acquire) {
        return (real::table().pthread_mutex_trylock)(mutex);
    }
    do_mutex_lock(mutex, SyncEventKind::MutexTrylock)
}

pub unsafe fn mutex_unlock(mutex: *mut pthread_mutex_t) -> c_int {
    let slot = current();
    if slot.disable_check.load(Ordering::Acquire) {
        return (real::table().pthread_mutex_unlock)(mutex);
    }

    if !coordinator().is_rollback() {
        let shadow = get_shadow(mutex as *mut c_void);
        let rc = (real::table().pthread_mutex_unlock)(shadow as *mut pthread_mutex_t);
        set_thread_safe();
        rc
    } else {
        let shadow = get_shadow(mutex as *mut c_void);
        let list = shadow_list(shadow, SyncVarKind::Mutex);
        // Hand the object to the next recorded acquirer (possibly
        // ourselves; the token is consumed by that next wait).
        if let Some(next) = list.advance() {
            post_to(next);
        }
        0
    }
}

fn post_to(event: &SyncEvent) {
    table().slot(event.tindex).post_semaphore();
}

pub unsafe fn mutex_destroy(mutex: *mut pthread_mutex_t) -> c_int {
    if !coordinator().is_rollback() {
        defer_handle(mutex as *mut c_void);
    }
    0
}

unsafe fn defer_handle(handle: *mut c_void) {
    let entry = get_entry(handle);
    if entry.is_null() {
        // Never locked and never explicitly initialized; nothing to
        // reclaim.
        return;
    }
    table().defer_destroy((*entry).kind.defer_kind(), entry as usize);
}

// Condition variables.

pub unsafe fn cond_init(cond: *mut pthread_cond_t, attr: *const pthread_condattr_t) -> c_int {
    if !coordinator().is_rollback() {
        let (shadow, list) = alloc_shadow(SyncVarKind::Cond);
        let rc = (real::table().pthread_cond_init)(shadow as *mut pthread_cond_t, attr);
        install_shadow(cond as *mut c_void, SyncVarKind::Cond, shadow, list);
        rc
    } else {
        reset_shadow(cond as *mut c_void, SyncVarKind::Cond);
        0
    }
}

unsafe fn resolve_cond(cond: *mut pthread_cond_t) -> usize {
    let mut shadow = get_shadow(cond as *mut c_void);
    if is_invalid_shadow(shadow) {
        cond_init(cond, ptr::null());
        shadow = get_shadow(cond as *mut c_void);
    }
    shadow
}

pub unsafe fn cond_wait(cond: *mut pthread_cond_t, mutex: *mut pthread_mutex_t) -> c_int {
    cond_wait_core(cond, mutex, ptr::null())
}

pub unsafe fn cond_timedwait(
    cond: *mut pthread_cond_t,
    mutex: *mut pthread_mutex_t,
    abstime: *const timespec,
) -> c_int {
    cond_wait_core(cond, mutex, abstime)
}

/// The mutex is held by the caller in both modes, so only the condition
/// variable may need lazy construction here.
unsafe fn cond_wait_core(
    cond: *mut pthread_cond_t,
    mutex: *mut pthread_mutex_t,
    abstime: *const timespec,
) -> c_int {
    let slot = current();
    if slot.disable_check.load(Ordering::Acquire) {
        return if abstime.is_null() {
            (real::table().pthread_cond_wait)(cond, mutex)
        } else {
            (real::table().pthread_cond_timedwait)(cond, mutex, abstime)
        };
    }

    let real_cond = resolve_cond(cond) as *mut pthread_cond_t;
    let mutex_shadow = get_shadow(mutex as *mut c_void);
    require!(
        !is_invalid_shadow(mutex_shadow),
        "cond wait with an unintercepted mutex"
    );
    let real_mutex = mutex_shadow as *mut pthread_mutex_t;
    let list = shadow_list(mutex_shadow, SyncVarKind::Mutex);

    if !coordinator().is_rollback() {
        log!(LogDebug, "thread {} parks on cond {:p}", slot.index, cond);
        mark_condwait(slot, real_cond);
        let rc = if abstime.is_null() {
            (real::table().pthread_cond_wait)(real_cond, real_mutex)
        } else {
            (real::table().pthread_cond_timedwait)(real_cond, real_mutex, abstime)
        };
        // Wakeup may be the application's or the rollback path's.
        check_rollback(real_mutex);
        set_thread_unsafe();
        let event = list.record(SyncEventKind::MutexLock, rc, slot.index);
        slot.events.record(event);
        rc
    } else {
        // The real wait released the mutex, so first hand it onward, then
        // queue for our own recorded reacquisition.
        if let Some(next) = list.advance() {
            post_to(next);
        }
        let rc = replay_ret(slot, list);
        if rc == 0 {
            slot.wait_semaphore();
        }
        slot.events.advance();
        rc
    }
}

pub unsafe fn cond_signal(cond: *mut pthread_cond_t) -> c_int {
    let real_cond = resolve_cond(cond) as *mut pthread_cond_t;
    if !coordinator().is_rollback() {
        (real::table().pthread_cond_signal)(real_cond)
    } else {
        // The wakeup is implicit in the recorded ordering.
        0
    }
}

pub unsafe fn cond_broadcast(cond: *mut pthread_cond_t) -> c_int {
    let real_cond = resolve_cond(cond) as *mut pthread_cond_t;
    if !coordinator().is_rollback() {
        (real::table().pthread_cond_broadcast)(real_cond)
    } else {
        0
    }
}

pub unsafe fn cond_destroy(cond: *mut pthread_cond_t) -> c_int {
    if !coordinator().is_rollback() {
        defer_handle(cond as *mut c_void);
    }
    0
}

// Barriers: rebuilt from an internal mutex + cond with a two-phase flip,
// because a thread blocked in a native barrier cannot be interrupted for a
// boundary, let alone rolled back.

unsafe fn barrier_parts(shadow: usize) -> (*mut pthread_mutex_t, *mut pthread_cond_t, *mut BarrierInfo) {
    let mutex = shadow as *mut pthread_mutex_t;
    let cond = (shadow + mem::size_of::<pthread_mutex_t>()) as *mut pthread_cond_t;
    let info = (cond as usize + mem::size_of::<pthread_cond_t>()) as *mut BarrierInfo;
    (mutex, cond, info)
}

pub unsafe fn barrier_init(
    barrier: *mut c_void,
    _attr: *const c_void,
    count: u32,
) -> c_int {
    if !coordinator().is_rollback() {
        let (shadow, list) = alloc_shadow(SyncVarKind::Barrier);
        if !install_shadow(barrier, SyncVarKind::Barrier, shadow, list) {
            // Lost the race; the winner's shadow is already set up.
            return 0;
        }
        let (mutex, cond, info) = barrier_parts(shadow);
        (real::table().pthread_mutex_init)(mutex, ptr::null());
        (real::table().pthread_cond_init)(cond, ptr::null());
        (*info).max_threads = count;
        (*info).waiting_threads = 0;
        (*info).is_arrival_phase = true;
        0
    } else {
        reset_shadow(barrier, SyncVarKind::Barrier);
        0
    }
}

pub unsafe fn barrier_wait(barrier: *mut c_void) -> c_int {
    let slot = current();
    let shadow = get_shadow(barrier);
    require!(
        !is_invalid_shadow(shadow),
        "barrier wait before barrier init"
    );
    let (mutex, cond, info) = barrier_parts(shadow);

    set_thread_unsafe();
    (real::table().pthread_mutex_lock)(mutex);

    // A wrapping thread must not slip into an arrival phase that is still
    // draining.
    while !(*info).is_arrival_phase {
        (real::table().pthread_cond_wait)(cond, mutex);
    }

    (*info).waiting_threads += 1;
    if (*info).waiting_threads >= (*info).max_threads {
        (*info).is_arrival_phase = false;
        (real::table().pthread_cond_broadcast)(cond);
    } else {
        while (*info).is_arrival_phase {
            mark_condwait(slot, cond);
            (real::table().pthread_cond_wait)(cond, mutex);
            check_rollback(mutex);
            set_thread_unsafe();
        }
    }

    // Departure: the last thread out flips back to arrival and releases
    // any thread parked at the top.
    (*info).waiting_threads -= 1;
    if (*info).waiting_threads == 0 {
        (*info).is_arrival_phase = true;
        (real::table().pthread_cond_broadcast)(cond);
    }

    (real::table().pthread_mutex_unlock)(mutex);
    set_thread_safe();
    0
}

pub unsafe fn barrier_destroy(barrier: *mut c_void) -> c_int {
    if !coordinator().is_rollback() {
        defer_handle(barrier);
    }
    0
}

// Epoch-boundary housekeeping over every log the registry knows about.

/// Commit: recorded orderings will never be replayed, drop them all.
pub fn epoch_end_well() {
    spawn_list().clear();
    REGISTRY.for_each_list(|list| list.clear());
    table().clear_thread_logs();
}

/// Rollback: rewind every object log and mint one semaphore token for each
/// head owner, so first acquirers do not deadlock. The thread-side
/// semaphores must already be re-initialized.
pub fn prepare_rollback() {
    if let Some(head) = spawn_list().reset_for_replay() {
        post_to(head);
    }
    REGISTRY.for_each_list(|list| {
        if let Some(head) = list.reset_for_replay() {
            post_to(head);
        }
    });
}

/// Reclaim one deferred sync object at commit: destroy the real primitive,
/// unhook the registry entry and return the storage to the internal heap.
pub fn reclaim_entry(kind: DeferKind, entry_addr: usize) {
    let entry = entry_addr as *mut SyncEntry;
    unsafe {
        let shadow = (*entry).shadow;
        match kind {
            DeferKind::Mutex => {
                (real::table().pthread_mutex_destroy)(shadow as *mut pthread_mutex_t);
            }
            DeferKind::Cond => {
                (real::table().pthread_cond_destroy)(shadow as *mut pthread_cond_t);
            }
            DeferKind::Barrier => {
                let (mutex, cond, _info) = barrier_parts(shadow);
                (real::table().pthread_mutex_destroy)(mutex);
                (real::table().pthread_cond_destroy)(cond);
            }
            DeferKind::Thread => fatal!("thread entries are reclaimed by the table"),
        }
        log!(
            LogInfo,
            "reclaimed {:?} shadow {:#x} at commit",
            kind,
            shadow
        );
        (*(*entry).list).dispose();
        REGISTRY.remove(entry);
        InternalHeap::get().free(shadow as *mut u8);
        InternalHeap::get().free(entry as *mut u8);
    }
}
