//! Table of pointers to the native thread/signal primitives, resolved once
//! via `dlsym(RTLD_NEXT)`. The runtime calls through this table so that its
//! own use of mutexes, condition variables and signals bypasses the
//! interception layer.

use std::mem;
use std::sync::atomic::{AtomicU8, Ordering};

use libc::{
    c_int, c_uint, c_void, pthread_attr_t, pthread_cond_t, pthread_condattr_t, pthread_mutex_t,
    pthread_mutexattr_t, pthread_t, sem_t, sigset_t, stack_t, timespec,
};

pub type StartRoutine = unsafe extern "C" fn(*mut c_void) -> *mut c_void;

const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 1;
const RESOLVED: u8 = 2;

static STATE: AtomicU8 = AtomicU8::new(UNRESOLVED);
static mut TABLE: Option<RealFuncs> = None;

unsafe fn must_resolve(name: &'static str) -> *mut c_void {
    let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const libc::c_char);
    if sym.is_null() {
        // The logging machinery is not trustworthy this early; write a raw
        // line and die.
        let msg = b"rewind: dlsym(RTLD_NEXT) failed during startup\n";
        libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const c_void, msg.len());
        libc::abort();
    }
    sym
}

pub struct RealFuncs {
    pub pthread_create: unsafe extern "C" fn(
        *mut pthread_t,
        *const pthread_attr_t,
        StartRoutine,
        *mut c_void,
    ) -> c_int,
    pub pthread_join: unsafe extern "C" fn(pthread_t, *mut *mut c_void) -> c_int,
    pub pthread_detach: unsafe extern "C" fn(pthread_t) -> c_int,
    pub pthread_cancel: unsafe extern "C" fn(pthread_t) -> c_int,
    pub pthread_kill: unsafe extern "C" fn(pthread_t, c_int) -> c_int,
    pub pthread_self: unsafe extern "C" fn() -> pthread_t,
    pub pthread_mutex_init:
        unsafe extern "C" fn(*mut pthread_mutex_t, *const pthread_mutexattr_t) -> c_int,
    pub pthread_mutex_lock: unsafe extern "C" fn(*mut pthread_mutex_t) -> c_int,
    pub pthread_mutex_trylock: unsafe extern "C" fn(*mut pthread_mutex_t) -> c_int,
    pub pthread_mutex_unlock: unsafe extern "C" fn(*mut pthread_mutex_t) -> c_int,
    pub pthread_mutex_destroy: unsafe extern "C" fn(*mut pthread_mutex_t) -> c_int,
    pub pthread_cond_init:
        unsafe extern "C" fn(*mut pthread_cond_t, *const pthread_condattr_t) -> c_int,
    pub pthread_cond_wait: unsafe extern "C" fn(*mut pthread_cond_t, *mut pthread_mutex_t) -> c_int,
    pub pthread_cond_timedwait: unsafe extern "C" fn(
        *mut pthread_cond_t,
        *mut pthread_mutex_t,
        *const timespec,
    ) -> c_int,
    pub pthread_cond_signal: unsafe extern "C" fn(*mut pthread_cond_t) -> c_int,
    pub pthread_cond_broadcast: unsafe extern "C" fn(*mut pthread_cond_t) -> c_int,
    pub pthread_cond_destroy: unsafe extern "C" fn(*mut pthread_cond_t) -> c_int,
    pub pthread_barrier_init: unsafe extern "C" fn(
        *mut libc::pthread_barrier_t,
        *const libc::pthread_barrierattr_t,
        c_uint,
    ) -> c_int,
    pub pthread_barrier_wait: unsafe extern "C" fn(*mut libc::pthread_barrier_t) -> c_int,
    pub pthread_barrier_destroy: unsafe extern "C" fn(*mut libc::pthread_barrier_t) -> c_int,
    pub sem_init: unsafe extern "C" fn(*mut sem_t, c_int, c_uint) -> c_int,
    pub sem_wait: unsafe extern "C" fn(*mut sem_t) -> c_int,
    pub sem_post: unsafe extern "C" fn(*mut sem_t) -> c_int,
    pub sem_destroy: unsafe extern "C" fn(*mut sem_t) -> c_int,
    pub sigaction:
        unsafe extern "C" fn(c_int, *const libc::sigaction, *mut libc::sigaction) -> c_int,
    pub sigprocmask: unsafe extern "C" fn(c_int, *const sigset_t, *mut sigset_t) -> c_int,
    pub sigaltstack: unsafe extern "C" fn(*const stack_t, *mut stack_t) -> c_int,
    pub nanosleep: unsafe extern "C" fn(*const timespec, *mut timespec) -> c_int,
    pub exit: unsafe extern "C" fn(c_int) -> (),
}

unsafe fn resolve_all() -> RealFuncs {
    RealFuncs {
        pthread_create: mem::transmute(must_resolve("pthread_create\0")),
        pthread_join: mem::transmute(must_resolve("pthread_join\0")),
        pthread_detach: mem::transmute(must_resolve("pthread_detach\0")),
        pthread_cancel: mem::transmute(must_resolve("pthread_cancel\0")),
        pthread_kill: mem::transmute(must_resolve("pthread_kill\0")),
        pthread_self: mem::transmute(must_resolve("pthread_self\0")),
        pthread_mutex_init: mem::transmute(must_resolve("pthread_mutex_init\0")),
        pthread_mutex_lock: mem::transmute(must_resolve("pthread_mutex_lock\0")),
        pthread_mutex_trylock: mem::transmute(must_resolve("pthread_mutex_trylock\0")),
        pthread_mutex_unlock: mem::transmute(must_resolve("pthread_mutex_unlock\0")),
        pthread_mutex_destroy: mem::transmute(must_resolve("pthread_mutex_destroy\0")),
        pthread_cond_init: mem::transmute(must_resolve("pthread_cond_init\0")),
        pthread_cond_wait: mem::transmute(must_resolve("pthread_cond_wait\0")),
        pthread_cond_timedwait: mem::transmute(must_resolve("pthread_cond_timedwait\0")),
        pthread_cond_signal: mem::transmute(must_resolve("pthread_cond_signal\0")),
        pthread_cond_broadcast: mem::transmute(must_resolve("pthread_cond_broadcast\0")),
        pthread_cond_destroy: mem::transmute(must_resolve("pthread_cond_destroy\0")),
        pthread_barrier_init: mem::transmute(must_resolve("pthread_barrier_init\0")),
        pthread_barrier_wait: mem::transmute(must_resolve("pthread_barrier_wait\0")),
        pthread_barrier_destroy: mem::transmute(must_resolve("pthread_barrier_destroy\0")),
        sem_init: mem::transmute(must_resolve("sem_init\0")),
        sem_wait: mem::transmute(must_resolve("sem_wait\0")),
        sem_post: mem::transmute(must_resolve("sem_post\0")),
        sem_destroy: mem::transmute(must_resolve("sem_destroy\0")),
        sigaction: mem::transmute(must_resolve("sigaction\0")),
        sigprocmask: mem::transmute(must_resolve("sigprocmask\0")),
        sigaltstack: mem::transmute(must_resolve("sigaltstack\0")),
        nanosleep: mem::transmute(must_resolve("nanosleep\0")),
        exit: mem::transmute(must_resolve("exit\0")),
    }
}

/// Resolve the table if it has not been resolved yet. Safe to call from
/// multiple threads; losers spin until the winner finishes.
pub fn initialize() {
    loop {
        match STATE.compare_exchange(
            UNRESOLVED,
            RESOLVING,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                unsafe {
                    TABLE = Some(resolve_all());
                }
                STATE.store(RESOLVED, Ordering::Release);
                return;
            }
            Err(RESOLVED) => return,
            Err(_) => std::hint::spin_loop(),
        }
    }
}

pub fn initialized() -> bool {
    STATE.load(Ordering::Acquire) == RESOLVED
}

#[inline]
pub fn table() -> &'static RealFuncs {
    if !initialized() {
        initialize();
    }
    unsafe { TABLE.as_ref().unwrap() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_and_calls_through() {
        initialize();
        assert!(initialized());
        let t = table();
        unsafe {
            let mut m: pthread_mutex_t = mem::zeroed();
            assert_eq!((t.pthread_mutex_init)(&mut m, std::ptr::null()), 0);
            assert_eq!((t.pthread_mutex_lock)(&mut m), 0);
            assert_eq!((t.pthread_mutex_unlock)(&mut m), 0);
            assert_eq!((t.pthread_mutex_destroy)(&mut m), 0);
            assert_ne!((t.pthread_self)(), 0);
        }
    }
}
