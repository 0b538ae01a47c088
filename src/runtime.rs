//! The epoch controller: initialization order, the commit path
//! (`epoch_begin`), the boundary (`epoch_end`), quiescence collection,
//! rollback orchestration, and both signal handlers.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{c_int, c_void, siginfo_t, ucontext_t};

use crate::boundary::{leakcheck, memory, quarantine, recorder};
use crate::epoch::{coordinator, stop_signal, SystemPhase};
use crate::flags::Flags;
use crate::internal_heap::InternalHeap;
use crate::log::LogLevel::{LogDebug, LogError, LogInfo, LogWarn};
use crate::real;
use crate::sync;
use crate::thread_slot::ThrStatus;
use crate::thread_table::{current, table};
use crate::threads;
use crate::vm_map::VmMap;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

struct VmMapCell(UnsafeCell<Option<VmMap>>);
unsafe impl Sync for VmMapCell {}
static VM_MAP: VmMapCell = VmMapCell(UnsafeCell::new(None));

pub fn initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

pub fn vm_map() -> &'static VmMap {
    unsafe { (*VM_MAP.0.get()).as_ref() }
        .unwrap_or_else(|| fatal!("vm map consulted before runtime init"))
}

/// Is the program counter inside the runtime's own library? Exposed to the
/// external detectors so reported call stacks start at application frames.
pub fn is_runtime_pc(pc: usize) -> bool {
    vm_map().is_runtime(pc)
}

/// One-time runtime initialization, before the application's `main`. The
/// order is load-bearing: the real-call table first (everything else calls
/// through it), then the internal heap (all metadata lives there), then the
/// vm map (registration reads stack bounds from it).
pub fn initialize() {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return;
    }
    real::initialize();
    let _ = Flags::get();
    InternalHeap::get().initialize();

    let vm = VmMap::new().unwrap_or_else(|err| fatal!("cannot parse /proc/self/maps: {}", err));
    unsafe {
        *VM_MAP.0.get() = Some(vm);
    }

    coordinator().initialize();
    install_signal_handlers();
    table().initialize();
    sync::init_spawn_list();
    crate::boundary::DefaultRecorder::initialize();

    unsafe {
        threads::register_initial_thread();
    }
    log!(LogInfo, "runtime initialized (stop signal {})", stop_signal());
}

/// Library teardown: run the final boundary with the end-of-program
/// detectors, then drop the semaphores.
pub fn finalize() {
    if !initialized() {
        return;
    }
    if !coordinator().is_rollback() {
        epoch_end(true);
    }
    table().destroy_all_semaphores();
}

/// Start a new epoch. Preconditions: phase is EPOCH_END and every other
/// live thread is parked on the waiter cond. Reaps joined threads, clears
/// spawn-epoch marks, runs deferred destroys, releases the waiters, then
/// snapshots memory and this thread.
pub fn epoch_begin() {
    let committer = current();
    log!(LogDebug, "thread {} opens an epoch", committer.index);

    for slot in table().live_slots() {
        if slot.index == committer.index {
            continue;
        }
        slot.lock();
        if slot.has_joined.load(Ordering::Acquire) && slot.status() == ThrStatus::WaitforReaping {
            // Joined and parked: let it die and collect it for real.
            slot.set_status(ThrStatus::Exiting);
            slot.signal();
            slot.unlock();
            unsafe {
                (real::table().pthread_join)(slot.handle(), ptr::null_mut());
            }
            continue;
        }
        slot.is_newly_spawned.store(false, Ordering::Release);
        slot.unlock();
    }
    committer.is_newly_spawned.store(false, Ordering::Release);

    table().run_deferred(sync::reclaim_entry);

    coordinator().epoch_begin_release();

    memory().epoch_begin();
    unsafe {
        committer.context_mut().save_current();
        // A rollback returns through here.
    }
}

/// End the current epoch: quiesce, run the detectors, then commit or roll
/// back. Application code may call this at any point; it also runs at
/// process exit with `is_final` set.
pub fn epoch_end(is_final: bool) {
    log!(
        LogDebug,
        "epoch {} ends (final: {})",
        coordinator().epochs_ended(),
        is_final
    );

    stop_all_threads();

    if coordinator().is_rollback() {
        // The replayed epoch has reached its boundary again: the defective
        // execution has been reproduced and reported. Hold the process for
        // the diagnostics consumer.
        log!(LogInfo, "replay reached the epoch boundary; parking");
        let sleep = libc::timespec {
            tv_sec: 1,
            tv_nsec: 0,
        };
        loop {
            unsafe {
                (real::table().nanosleep)(&sleep, ptr::null_mut());
            }
        }
    }

    let flags = Flags::get();
    let mut failed = false;

    if is_final && flags.detect_uaf() {
        for slot in table().live_slots() {
            if quarantine().final_uaf_check(slot) {
                log!(LogError, "use-after-free detected on thread {}", slot.index);
                failed = true;
            }
        }
    }

    if flags.detect_overflow() && memory().check_heap_overflow() {
        log!(LogError, "heap overflow detected at epoch end");
        failed = true;
    }

    if flags.detect_leaks() {
        let leaked = if is_final {
            leakcheck().fast_leak_check(memory().heap_begin(), memory().heap_end())
        } else {
            leakcheck().slow_leak_check(memory().heap_begin(), memory().heap_end())
        };
        if leaked {
            log!(LogError, "memory leak detected at epoch end");
            failed = true;
        }
    }

    if failed {
        rollback();
    }

    recorder().epoch_end_well();
    sync::epoch_end_well();
    epoch_begin();
}

/// Called from join when the reapable backlog demands a boundary.
pub fn invoke_commit() {
    epoch_end(false);
}

/// Quiescence: announce EPOCH_END, then walk the table; every other live
/// thread is either already parked in a pre-existing wait or gets the stop
/// signal once it is observed safe. Returns when all signaled threads have
/// parked in the handler.
fn stop_all_threads() {
    let committer = current();
    coordinator().check_waiters();
    coordinator().set_epoch_end();
    coordinator().global_lock();

    log!(
        LogDebug,
        "thread {} stops all others for the boundary",
        committer.index
    );

    let mut waiters: i32 = 0;
    for slot in table().live_slots() {
        if slot.index == committer.index {
            continue;
        }
        // Spin before taking the lifecycle lock: a thread on its way into
        // a cond park needs that lock to become safe.
        while !slot.is_safe.load(Ordering::Acquire) {
            wait_thread_safe();
        }
        slot.lock();
        if !slot.is_parked() {
            waiters += 1;
            log!(LogDebug, "stop signal to thread {}", slot.index);
            unsafe {
                (real::table().pthread_kill)(slot.handle(), stop_signal());
            }
        }
        slot.unlock();
    }

    if waiters != 0 {
        coordinator().wait_threads_stop(waiters);
    }
    coordinator().global_unlock();
}

// A short bounded spin; the target thread is leaving a wrapper.
fn wait_thread_safe() {
    for _ in 0..0x10000 {
        std::hint::spin_loop();
    }
}

/// Roll every thread back to the epoch snapshot and enter replay. Fatal if
/// a rollback already happened in this process lifetime.
pub fn rollback() -> ! {
    if coordinator().has_rollbacked() {
        fatal!("second rollback requested; the first replay did not reproduce the fault");
    }
    log!(LogWarn, "rolling back to the epoch snapshot");
    coordinator().set_rollback();

    // Memory first, while every other thread is quiescent.
    memory().rollback();
    recorder().prepare_rollback();

    // Fresh semaphores before any head token is minted.
    table().prepare_rollback();
    sync::prepare_rollback();

    // Threads parked outside the handler are flagged and woken here;
    // threads spawned in this epoch wait for their replayed creation
    // instead.
    let committer = current();
    for slot in table().live_slots() {
        if slot.index == committer.index || slot.is_newly_spawned.load(Ordering::Acquire) {
            continue;
        }
        if slot.is_parked() {
            threads::wake_for_rollback(slot);
        }
    }

    // Handler-parked threads leave their phase loop and restore in place.
    coordinator().rollback_release();

    rollback_current();
}

/// Restore the calling thread's snapshot; the common tail of the committer
/// path and of every wrapper that discovers a rollback flag on wakeup.
pub fn rollback_current() -> ! {
    let slot = current();
    log!(LogDebug, "thread {} restores its context", slot.index);
    slot.set_condwait(ptr::null_mut());
    unsafe { slot.context().rollback() }
}

// Signal plumbing.

/// Stop-signal handler: the quiescence gate. Parks until the committer
/// decides, then either captures this thread's new snapshot (commit) or
/// restores the old one in place (rollback).
extern "C" fn stop_signal_handler(_sig: c_int, _info: *mut siginfo_t, uctx: *mut c_void) {
    let uctx = uctx as *mut ucontext_t;

    coordinator().wait_for_notification();

    if coordinator().phase() == SystemPhase::EpochBegin {
        unsafe {
            current().context_mut().save_from(&*uctx);
        }
        return;
    }

    require!(
        coordinator().is_rollback(),
        "woken at a boundary that neither committed nor rolled back"
    );
    let slot = current();
    if slot.is_newly_spawned.load(Ordering::Acquire) {
        // Spawned this epoch: wait for the replayed creation to take over.
        slot.lock();
        while slot.status() != ThrStatus::Rollback {
            slot.wait();
        }
        slot.unlock();
    }
    unsafe {
        slot.context().rollback_in_handler(uctx);
    }
    // Handler return resumes at the restored program counter.
}

/// Redirect the faulting context into the rollback entry; returning from
/// the handler "calls" it on the application's own stack.
fn jump_to_function(uctx: *mut ucontext_t, target: usize) {
    unsafe {
        (*uctx).uc_mcontext.gregs[libc::REG_RIP as usize] = target as i64;
    }
}

extern "C" fn fault_from_segv() {
    log!(LogWarn, "segmentation fault in application code; rolling back");
    if memory().check_heap_overflow() {
        log!(LogError, "heap overflow is the cause of the fault");
    }
    rollback();
}

extern "C" fn segv_handler(_sig: c_int, _info: *mut siginfo_t, uctx: *mut c_void) {
    jump_to_function(uctx as *mut ucontext_t, fault_from_segv as usize);
}

/// Install both handlers. They run on the per-thread alternate stack that
/// registration sets up: the stop handler parks for a whole boundary and
/// the interrupted thread's own stack is about to be snapshotted or
/// rewritten.
fn install_signal_handlers() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART | libc::SA_ONSTACK;
        action.sa_sigaction = stop_signal_handler as usize;
        if (real::table().sigaction)(stop_signal(), &action, ptr::null_mut()) == -1 {
            fatal!("sigaction(stop signal) failed: {}", nix::errno::errno());
        }

        let mut fault: libc::sigaction = std::mem::zeroed();
        libc::sigemptyset(&mut fault.sa_mask);
        fault.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART | libc::SA_ONSTACK;
        fault.sa_sigaction = segv_handler as usize;
        if (real::table().sigaction)(libc::SIGSEGV, &fault, ptr::null_mut()) == -1 {
            fatal!("sigaction(SIGSEGV) failed: {}", nix::errno::errno());
        }
    }
}
