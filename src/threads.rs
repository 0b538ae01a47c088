//! Thread lifecycle interception: creation, the trampoline that registers
//! a spawned thread before its start routine runs, the exit protocol that
//! parks finished threads until a commit reaps them, join, detach, cancel
//! and kill.

use std::ptr;
use std::sync::atomic::Ordering;

use libc::{c_int, c_void, pthread_attr_t, pthread_t};

use crate::defines::{align_down, MAX_STACK_SIZE, NO_SLOT, PAGE_SIZE};
use crate::epoch::coordinator;
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::real;
use crate::sync::{check_rollback, set_thread_safe, set_thread_unsafe, spawn_list};
use crate::sync_event::SyncEventKind;
use crate::thread_slot::{ThrStatus, ThreadSlot};
use crate::thread_table::{current, set_current_index, table, DeferKind};

fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Bind the calling native thread to its slot and record its stack
/// geometry. For spawned threads the usable stack is bounded by the page
/// holding the TCB; the initial thread's bounds come from the vm map. The
/// saved context taken here is the point a recycled thread re-runs from.
pub unsafe fn register_thread(slot: &'static ThreadSlot, is_main: bool) {
    set_current_index(slot.index);
    slot.set_handle((real::table().pthread_self)());
    slot.set_tid(gettid());

    slot.lock();
    slot.set_status(ThrStatus::Running);
    slot.is_newly_spawned.store(true, Ordering::Release);
    slot.disable_check.store(false, Ordering::Release);
    slot.is_main.store(is_main, Ordering::Release);
    slot.set_condwait(ptr::null_mut());

    let (bottom, top) = if is_main {
        let region = crate::runtime::vm_map()
            .find_stack(slot.tid())
            .unwrap_or_else(|| fatal!("no stack mapping for the initial thread"));
        (region.start, region.end)
    } else {
        let tcb = (real::table().pthread_self)() as usize;
        let top = align_down(tcb + PAGE_SIZE, PAGE_SIZE);
        (top - MAX_STACK_SIZE, top)
    };
    slot.set_stack(bottom, top);
    slot.context_mut().setup_stack_info(top as *mut u8, MAX_STACK_SIZE);

    // The stop handler must run off this stack (the bytes under it get
    // rewritten on rollback), and sigaltstack is per-thread.
    let mut alt = slot.alt_stack.load(Ordering::Acquire);
    if alt == 0 {
        let mapped = libc::mmap(
            ptr::null_mut(),
            crate::defines::ALT_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        require!(mapped != libc::MAP_FAILED, "cannot map an alternate signal stack");
        alt = mapped as usize;
        slot.alt_stack.store(alt, Ordering::Release);
    }
    let altstack = libc::stack_t {
        ss_sp: alt as *mut libc::c_void,
        ss_flags: 0,
        ss_size: crate::defines::ALT_STACK_SIZE,
    };
    (real::table().sigaltstack)(&altstack, ptr::null_mut());

    // The parent is blocked until registration completes.
    slot.signal();
    slot.unlock();

    log!(
        LogDebug,
        "thread {} registered (tid {}, stack {:#x}..{:#x})",
        slot.index,
        slot.tid(),
        bottom,
        top
    );

    if !is_main {
        slot.context_mut().save_current();
        // Control also returns here when a recycled thread is re-animated
        // during replay; everything after this point re-executes.
    }
}

/// Runtime-owned entry wrapper for every created thread.
pub unsafe extern "C" fn start_thread(arg: *mut c_void) -> *mut c_void {
    let slot = &*(arg as *const ThreadSlot);
    register_thread(slot, false);
    let result = (slot.start_routine())(slot.start_arg());
    thread_exit(slot, result)
}

/// Exit protocol: finished threads do not die, they park with status
/// WAITFOR_REAPING so their slot and logs survive for replay; a commit
/// later tells them to actually exit, a rollback recycles them.
unsafe fn thread_exit(slot: &'static ThreadSlot, result: *mut c_void) -> *mut c_void {
    slot.lock();
    slot.set_result(result);
    slot.set_status(ThrStatus::WaitforReaping);
    if slot.joiner() != NO_SLOT {
        slot.signal();
    }
    if slot.is_detached.load(Ordering::Acquire) && !slot.has_joined.load(Ordering::Acquire) {
        // Detached threads are join-on-exit: queue for the next commit.
        slot.has_joined.store(true, Ordering::Release);
        table().defer_destroy(DeferKind::Thread, slot.index);
    }
    // Parked: the committer must not send the stop signal here.
    slot.is_safe.store(true, Ordering::Release);
    loop {
        match slot.status() {
            ThrStatus::Exiting => break,
            ThrStatus::Rollback => {
                slot.unlock();
                crate::runtime::rollback_current();
            }
            _ => slot.wait(),
        }
    }
    slot.unlock();
    log!(LogDebug, "thread {} exiting for real", slot.index);
    result
}

pub unsafe fn thread_create(
    tid_out: *mut pthread_t,
    attr: *const pthread_attr_t,
    routine: crate::thread_slot::StartRoutine,
    arg: *mut c_void,
) -> c_int {
    let parent = current();

    if !coordinator().is_rollback() {
        coordinator().global_lock();

        let child = table().alloc_slot();
        child.set_parent(parent.index);
        child.set_joiner(NO_SLOT);
        child.set_start(routine, arg);
        child.set_status(ThrStatus::Starting);
        child.has_joined.store(false, Ordering::Release);
        child.is_safe.store(false, Ordering::Release);
        child.is_detached.store(attr_is_detached(attr), Ordering::Release);

        parent.disable_check.store(true, Ordering::Release);
        let rc = (real::table().pthread_create)(
            tid_out,
            attr,
            start_thread,
            child as *const ThreadSlot as *mut c_void,
        );
        parent.disable_check.store(false, Ordering::Release);
        if rc != 0 {
            log!(LogWarn, "thread creation failed with {}", rc);
            (real::table().exit)(-1);
        }

        let event = spawn_list().record(SyncEventKind::Spawn, rc, parent.index);
        parent.events.record(event);
        crate::boundary::recorder().record_clone(parent.index, rc, *tid_out);
        child.set_handle(*tid_out);

        coordinator().global_unlock();

        // Wait for the child to finish registering.
        child.lock();
        while child.status() == ThrStatus::Starting {
            child.wait();
        }
        child.unlock();
        rc
    } else {
        let rc = match parent.events.peek_for(spawn_list()) {
            Ok(rc) => rc,
            Err(err) => fatal!("replay diverged at thread creation: {:?}", err),
        };
        let (rec_rc, rec_tid) = crate::boundary::recorder().get_clone(parent.index);
        require!(
            rc == rec_rc,
            "spawn log and clone log disagree ({} vs {})",
            rc,
            rec_rc
        );
        *tid_out = rec_tid;

        if rc == 0 {
            // Wait for our recorded turn, then re-animate the thread that
            // played this child in the recorded epoch.
            parent.wait_semaphore();
            let child = table()
                .find_by_handle(rec_tid)
                .unwrap_or_else(|| fatal!("replayed child {:#x} has no slot", rec_tid as usize));
            child.set_joiner(NO_SLOT);
            wake_for_rollback(child);
        }

        parent.events.advance();
        if let Some(next) = spawn_list().advance() {
            table().slot(next.tindex).post_semaphore();
        }
        rc
    }
}

extern "C" {
    // Not exposed by the `libc` crate's bindings; bind it directly since
    // it is present in glibc.
    fn pthread_attr_getdetachstate(attr: *const pthread_attr_t, state: *mut c_int) -> c_int;
}

fn attr_is_detached(attr: *const pthread_attr_t) -> bool {
    if attr.is_null() {
        return false;
    }
    let mut state: c_int = 0;
    unsafe { pthread_attr_getdetachstate(attr, &mut state) };
    state == libc::PTHREAD_CREATE_DETACHED
}

/// Route a parked thread into its rollback path, whatever park it is in:
/// the exit protocol, an application cond wait, a join, or (for a thread
/// spawned this epoch) the stop-signal handler.
pub fn wake_for_rollback(slot: &ThreadSlot) {
    match slot.status() {
        ThrStatus::CondWaiting | ThrStatus::Joining => {
            let cond = slot.condwait();
            slot.set_status(ThrStatus::Rollback);
            if !cond.is_null() {
                unsafe {
                    (real::table().pthread_cond_signal)(cond);
                }
            }
        }
        _ => {
            // Exit-protocol park or the newly-spawned handler park; both
            // wait on the lifecycle cond for the rollback status.
            slot.lock();
            slot.set_status(ThrStatus::Rollback);
            slot.signal();
            slot.unlock();
        }
    }
}

pub unsafe fn thread_join(handle: pthread_t, result_out: *mut *mut c_void) -> c_int {
    let joinee = match table().find_by_handle(handle) {
        Some(slot) => slot,
        None => return libc::ESRCH,
    };
    let joiner = current();
    log!(LogDebug, "thread {} joins thread {}", joiner.index, joinee.index);

    set_thread_unsafe();

    // A joiner parked on the joinee's lifecycle cond counts as a
    // pre-existing wait at the boundary.
    joiner.lock();
    joiner.set_status(ThrStatus::Joining);
    joiner.set_condwait(joinee.lifecycle_cond());
    joiner.unlock();

    joinee.lock();
    while joinee.status() != ThrStatus::WaitforReaping {
        if joiner.status() == ThrStatus::Rollback {
            // Woken by the rollback path, not by the joinee's exit.
            break;
        }
        joinee.set_joiner(joiner.index);
        set_thread_safe();
        joinee.wait();
    }
    let reaped = joinee.status() == ThrStatus::WaitforReaping;
    if reaped {
        joinee.has_joined.store(true, Ordering::Release);
        if !result_out.is_null() {
            *result_out = joinee.result();
        }
    }
    joinee.unlock();

    // Rolls back and does not return if the boundary flagged us.
    check_rollback(ptr::null_mut());
    set_thread_safe();

    if reaped && table().defer_destroy(DeferKind::Thread, joinee.index) {
        // The reapable backlog is at its threshold and we are the only
        // other runner; commit now so the parked threads can die.
        crate::runtime::invoke_commit();
    }
    0
}

pub unsafe fn thread_detach(handle: pthread_t) -> c_int {
    let slot = match table().find_by_handle(handle) {
        Some(slot) => slot,
        None => return libc::ESRCH,
    };
    slot.lock();
    slot.is_detached.store(true, Ordering::Release);
    if slot.status() == ThrStatus::WaitforReaping && !slot.has_joined.load(Ordering::Acquire) {
        // Already exited: convert to join-on-exit retroactively.
        slot.has_joined.store(true, Ordering::Release);
        table().defer_destroy(DeferKind::Thread, slot.index);
    }
    slot.unlock();
    0
}

/// Cancellation makes the remaining epoch unreproducible, so the epoch is
/// committed first and the slot withdrawn immediately.
pub unsafe fn thread_cancel(handle: pthread_t) -> c_int {
    crate::runtime::invoke_commit();
    let rc = (real::table().pthread_cancel)(handle);
    if rc == 0 {
        if let Some(slot) = table().find_by_handle(handle) {
            table().withdraw_cancelled(slot);
        }
    }
    rc
}

pub unsafe fn thread_kill(handle: pthread_t, sig: c_int) -> c_int {
    (real::table().pthread_kill)(handle, sig)
}

pub fn thread_self() -> pthread_t {
    unsafe { (real::table().pthread_self)() }
}

/// Register the initial thread during runtime init.
pub unsafe fn register_initial_thread() {
    coordinator().global_lock();
    let slot = table().alloc_slot();
    slot.set_parent(NO_SLOT);
    slot.set_joiner(NO_SLOT);
    coordinator().global_unlock();

    register_thread(slot, true);
    // The initial thread predates the first epoch by definition.
    slot.is_newly_spawned.store(false, Ordering::Release);
    slot.is_safe.store(true, Ordering::Release);
}
