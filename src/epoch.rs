//! The coordinator: the process-global phase machine and the devices the
//! epoch protocol runs on. One explicitly initialized object owns the
//! phase, the rollback flags, the waiter accounting, the global runtime
//! lock, and the signal-handler mutex with its committer/waiter condition
//! variables.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use libc::{c_int, pthread_cond_t, pthread_mutex_t, sigset_t, timespec};

use crate::log::LogLevel::LogDebug;
use crate::real;

#[repr(u32)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SystemPhase {
    /// Before the first epoch, and transiently while a rollback is being
    /// prepared (parked waiters leave their phase loop and route on the
    /// rollback flag).
    Init = 0,
    /// A committer is collecting quiescence.
    EpochEnd = 1,
    /// Epoch running; set only by the committer on a successful commit.
    EpochBegin = 2,
}

/// The inter-thread stop signal. Realtime-numbered: USR-class signals can
/// coalesce when several boundaries race, a realtime signal queues.
pub fn stop_signal() -> c_int {
    libc::SIGRTMIN() + 2
}

pub struct Coordinator {
    phase: AtomicUsize,
    is_rollback: AtomicBool,
    has_rollbacked: AtomicBool,
    epochs_ended: AtomicUsize,
    waiters: AtomicI32,
    waiters_total: AtomicI32,

    /// Global runtime lock; held only outside application code.
    lock: UnsafeCell<pthread_mutex_t>,
    /// Protects the waiter protocol; the only lock the stop-signal handler
    /// may touch.
    handler_lock: UnsafeCell<pthread_mutex_t>,
    cond_committer: UnsafeCell<pthread_cond_t>,
    cond_waiters: UnsafeCell<pthread_cond_t>,
}

unsafe impl Sync for Coordinator {}

static COORD: Coordinator = Coordinator {
    phase: AtomicUsize::new(SystemPhase::Init as usize),
    is_rollback: AtomicBool::new(false),
    has_rollbacked: AtomicBool::new(false),
    epochs_ended: AtomicUsize::new(0),
    waiters: AtomicI32::new(0),
    waiters_total: AtomicI32::new(0),
    lock: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
    handler_lock: UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER),
    cond_committer: UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER),
    cond_waiters: UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER),
};

pub fn coordinator() -> &'static Coordinator {
    &COORD
}

impl Coordinator {
    /// Explicit initialization through the real-call table; static
    /// initializers are not relied on for the protocol devices.
    pub fn initialize(&self) {
        self.is_rollback.store(false, Ordering::Release);
        self.has_rollbacked.store(false, Ordering::Release);
        self.set_phase(SystemPhase::Init);
        self.epochs_ended.store(0, Ordering::Release);
        self.waiters.store(0, Ordering::Release);
        self.waiters_total.store(0, Ordering::Release);
        unsafe {
            (real::table().pthread_mutex_init)(self.lock.get(), ptr::null());
            (real::table().pthread_mutex_init)(self.handler_lock.get(), ptr::null());
            (real::table().pthread_cond_init)(self.cond_committer.get(), ptr::null());
            (real::table().pthread_cond_init)(self.cond_waiters.get(), ptr::null());
        }
    }

    pub fn phase(&self) -> SystemPhase {
        match self.phase.load(Ordering::Acquire) {
            0 => SystemPhase::Init,
            1 => SystemPhase::EpochEnd,
            2 => SystemPhase::EpochBegin,
            other => fatal!("corrupt system phase {}", other),
        }
    }

    pub fn set_phase(&self, phase: SystemPhase) {
        self.phase.store(phase as usize, Ordering::Release);
    }

    pub fn is_epoch_end(&self) -> bool {
        self.phase() == SystemPhase::EpochEnd
    }

    pub fn is_epoch_begin(&self) -> bool {
        self.phase() == SystemPhase::EpochBegin
    }

    pub fn is_rollback(&self) -> bool {
        self.is_rollback.load(Ordering::Acquire)
    }

    pub fn has_rollbacked(&self) -> bool {
        self.has_rollbacked.load(Ordering::Acquire)
    }

    pub fn set_rollback(&self) {
        self.is_rollback.store(true, Ordering::Release);
        self.has_rollbacked.store(true, Ordering::Release);
    }

    pub fn epochs_ended(&self) -> usize {
        self.epochs_ended.load(Ordering::Acquire)
    }

    /// Announce the boundary: non-committers that hit a wrapper or receive
    /// the stop signal will park until the phase changes.
    pub fn set_epoch_end(&self) {
        self.epochs_ended.fetch_add(1, Ordering::AcqRel);
        self.set_phase(SystemPhase::EpochEnd);
    }

    /// Acquire the global runtime lock with the stop signal blocked. A
    /// thread interrupted while blocked on the runtime's own lock could be
    /// rolled back with the lock in an unrecoverable state, so the lock is
    /// only taken by polling with the signal masked.
    pub fn global_lock(&self) {
        let sleep = timespec {
            tv_sec: 0,
            tv_nsec: 10_000_000,
        };
        unsafe {
            let mut blocked: sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut blocked);
            libc::sigaddset(&mut blocked, stop_signal());
            loop {
                let mut saved: sigset_t = std::mem::zeroed();
                (real::table().sigprocmask)(libc::SIG_BLOCK, &blocked, &mut saved);
                if (real::table().pthread_mutex_trylock)(self.lock.get()) == 0 {
                    return;
                }
                (real::table().sigprocmask)(libc::SIG_SETMASK, &saved, ptr::null_mut());
                (real::table().nanosleep)(&sleep, ptr::null_mut());
            }
        }
    }

    pub fn global_unlock(&self) {
        unsafe {
            (real::table().pthread_mutex_unlock)(self.lock.get());
            let mut blocked: sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut blocked);
            libc::sigaddset(&mut blocked, stop_signal());
            (real::table().sigprocmask)(libc::SIG_UNBLOCK, &blocked, ptr::null_mut());
        }
    }

    fn lock_handler(&self) {
        unsafe {
            (real::table().pthread_mutex_lock)(self.handler_lock.get());
        }
    }

    fn unlock_handler(&self) {
        unsafe {
            (real::table().pthread_mutex_unlock)(self.handler_lock.get());
        }
    }

    pub fn check_waiters(&self) {
        require!(
            self.waiters.load(Ordering::Acquire) == 0,
            "stale waiters at epoch boundary"
        );
    }

    /// Committer side of quiescence: block until `total` threads have
    /// parked in the stop-signal handler.
    pub fn wait_threads_stop(&self, total: i32) {
        self.lock_handler();
        self.waiters_total.store(total, Ordering::Release);
        while self.waiters.load(Ordering::Acquire) != total {
            unsafe {
                (real::table().pthread_cond_wait)(self.cond_committer.get(), self.handler_lock.get());
            }
        }
        self.unlock_handler();
    }

    /// Waiter side: called from the stop-signal handler. Registers the
    /// arrival, wakes the committer when the count is complete, and parks
    /// until the phase leaves EPOCH_END. The decrement on the way out lets
    /// the committer know when everyone has picked up the outcome.
    pub fn wait_for_notification(&self) {
        require!(self.is_epoch_end(), "stop signal outside an epoch boundary");
        self.lock_handler();
        let arrived = self.waiters.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived == self.waiters_total.load(Ordering::Acquire) {
            unsafe {
                (real::table().pthread_cond_signal)(self.cond_committer.get());
            }
        }
        while self.is_epoch_end() {
            unsafe {
                (real::table().pthread_cond_wait)(self.cond_waiters.get(), self.handler_lock.get());
            }
        }
        let left = self.waiters.fetch_sub(1, Ordering::AcqRel) - 1;
        if left == 0 {
            unsafe {
                (real::table().pthread_cond_signal)(self.cond_committer.get());
            }
        }
        self.unlock_handler();
    }

    /// Commit: open the next epoch and wait until every waiter has woken,
    /// captured its new context and decremented out.
    pub fn epoch_begin_release(&self) {
        self.lock_handler();
        self.set_phase(SystemPhase::EpochBegin);
        log!(LogDebug, "waking all epoch waiters for commit");
        unsafe {
            (real::table().pthread_cond_broadcast)(self.cond_waiters.get());
            while self.waiters.load(Ordering::Acquire) != 0 {
                (real::table().pthread_cond_wait)(self.cond_committer.get(), self.handler_lock.get());
            }
        }
        self.unlock_handler();
    }

    /// Rollback: leave EPOCH_END (parked waiters exit their phase loop and
    /// route on the rollback flag); the committer does not wait for them.
    pub fn rollback_release(&self) {
        self.lock_handler();
        self.set_phase(SystemPhase::Init);
        log!(LogDebug, "waking all epoch waiters for rollback");
        unsafe {
            (real::table().pthread_cond_broadcast)(self.cond_waiters.get());
        }
        self.unlock_handler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    lazy_static! {
        // The coordinator is process-global; serialize these tests.
        static ref GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
    }

    #[test]
    fn phase_transitions() {
        let _g = GUARD.lock().unwrap();
        crate::real::initialize();
        let c = coordinator();
        c.initialize();
        assert_eq!(c.phase(), SystemPhase::Init);
        assert!(!c.is_rollback());
        assert!(!c.has_rollbacked());

        c.set_epoch_end();
        assert!(c.is_epoch_end());
        assert_eq!(c.epochs_ended(), 1);

        c.set_phase(SystemPhase::EpochBegin);
        assert!(c.is_epoch_begin());

        c.set_rollback();
        assert!(c.is_rollback());
        assert!(c.has_rollbacked());

        // Reset for any test that runs after us.
        c.initialize();
    }

    #[test]
    fn global_lock_excludes() {
        let _g = GUARD.lock().unwrap();
        crate::real::initialize();
        let c = coordinator();
        c.global_lock();
        c.global_unlock();
        c.global_lock();
        c.global_unlock();
    }

    #[test]
    fn stop_signal_is_realtime() {
        assert!(stop_signal() >= libc::SIGRTMIN());
        assert!(stop_signal() <= libc::SIGRTMAX());
    }
}
