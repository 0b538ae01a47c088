//! The preloadable C ABI surface. Signatures match the native thread API
//! byte for byte; every wrapper falls back to the real primitive until the
//! runtime is initialized and the calling thread is registered, so library
//! constructors that run before `main` keep working untouched.
//!
//! Compiled only with the `interpose` feature: a test binary linking the
//! rlib must not interpose its own harness.

use libc::{
    c_char, c_int, c_uint, c_void, pthread_attr_t, pthread_barrier_t, pthread_barrierattr_t,
    pthread_cond_t, pthread_condattr_t, pthread_mutex_t, pthread_mutexattr_t, pthread_t, timespec,
};

use crate::real;
use crate::runtime;
use crate::sync;
use crate::thread_table;
use crate::threads;

/// Interception is live once the runtime is up and the caller has a slot.
fn ready() -> bool {
    runtime::initialized() && thread_table::has_current()
}

// Process entry plumbing.

type MainFn = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int;
type LibcStartMainFn = unsafe extern "C" fn(
    MainFn,
    c_int,
    *mut *mut c_char,
    Option<unsafe extern "C" fn()>,
    Option<unsafe extern "C" fn()>,
    Option<unsafe extern "C" fn()>,
    *mut c_void,
) -> c_int;

static mut REAL_MAIN: Option<MainFn> = None;

unsafe extern "C" fn wrapped_main(
    argc: c_int,
    argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    runtime::initialize();
    runtime::epoch_begin();
    (REAL_MAIN.expect("wrapped main without a real main"))(argc, argv, envp)
}

#[no_mangle]
pub unsafe extern "C" fn __libc_start_main(
    main: MainFn,
    argc: c_int,
    argv: *mut *mut c_char,
    init: Option<unsafe extern "C" fn()>,
    fini: Option<unsafe extern "C" fn()>,
    rtld_fini: Option<unsafe extern "C" fn()>,
    stack_end: *mut c_void,
) -> c_int {
    let real_start: LibcStartMainFn = std::mem::transmute(libc::dlsym(
        libc::RTLD_NEXT,
        "__libc_start_main\0".as_ptr() as *const c_char,
    ));
    REAL_MAIN = Some(main);
    real_start(wrapped_main, argc, argv, init, fini, rtld_fini, stack_end)
}

extern "C" fn early_init() {
    real::initialize();
}

extern "C" fn late_fini() {
    runtime::finalize();
}

#[used]
#[link_section = ".init_array"]
static EARLY_INIT: extern "C" fn() = early_init;

#[used]
#[link_section = ".fini_array"]
static LATE_FINI: extern "C" fn() = late_fini;

/// Force an epoch boundary from application code.
#[no_mangle]
pub extern "C" fn rewind_epoch_end() {
    if ready() {
        runtime::epoch_end(false);
    }
}

/// dlsym with interception checks suspended, for collaborator libraries
/// that resolve symbols while interposed.
#[no_mangle]
pub unsafe extern "C" fn rewind_call_dlsym(
    handle: *mut c_void,
    name: *const c_char,
) -> *mut c_void {
    use std::sync::atomic::Ordering;
    if !ready() {
        return libc::dlsym(handle, name);
    }
    let slot = thread_table::current();
    let was_disabled = slot.disable_check.swap(true, Ordering::AcqRel);
    let sym = libc::dlsym(handle, name);
    slot.disable_check.store(was_disabled, Ordering::Release);
    sym
}

// Thread lifecycle.

#[no_mangle]
pub unsafe extern "C" fn pthread_create(
    tid: *mut pthread_t,
    attr: *const pthread_attr_t,
    routine: crate::thread_slot::StartRoutine,
    arg: *mut c_void,
) -> c_int {
    if !ready() {
        return (real::table().pthread_create)(tid, attr, routine, arg);
    }
    threads::thread_create(tid, attr, routine, arg)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_join(handle: pthread_t, result: *mut *mut c_void) -> c_int {
    if !ready() {
        return (real::table().pthread_join)(handle, result);
    }
    threads::thread_join(handle, result)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_detach(handle: pthread_t) -> c_int {
    if !ready() {
        return (real::table().pthread_detach)(handle);
    }
    threads::thread_detach(handle)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_cancel(handle: pthread_t) -> c_int {
    if !ready() {
        return (real::table().pthread_cancel)(handle);
    }
    threads::thread_cancel(handle)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_kill(handle: pthread_t, sig: c_int) -> c_int {
    threads::thread_kill(handle, sig)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_self() -> pthread_t {
    threads::thread_self()
}

// Mutexes.

#[no_mangle]
pub unsafe extern "C" fn pthread_mutex_init(
    mutex: *mut pthread_mutex_t,
    attr: *const pthread_mutexattr_t,
) -> c_int {
    if !ready() {
        return (real::table().pthread_mutex_init)(mutex, attr);
    }
    sync::mutex_init(mutex, attr)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_mutex_lock(mutex: *mut pthread_mutex_t) -> c_int {
    if !ready() {
        return (real::table().pthread_mutex_lock)(mutex);
    }
    sync::mutex_lock(mutex)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_mutex_trylock(mutex: *mut pthread_mutex_t) -> c_int {
    if !ready() {
        return (real::table().pthread_mutex_trylock)(mutex);
    }
    sync::mutex_trylock(mutex)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_mutex_unlock(mutex: *mut pthread_mutex_t) -> c_int {
    if !ready() {
        return (real::table().pthread_mutex_unlock)(mutex);
    }
    sync::mutex_unlock(mutex)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_mutex_destroy(mutex: *mut pthread_mutex_t) -> c_int {
    if !ready() {
        return (real::table().pthread_mutex_destroy)(mutex);
    }
    sync::mutex_destroy(mutex)
}

// Condition variables.

#[no_mangle]
pub unsafe extern "C" fn pthread_cond_init(
    cond: *mut pthread_cond_t,
    attr: *const pthread_condattr_t,
) -> c_int {
    if !ready() {
        return (real::table().pthread_cond_init)(cond, attr);
    }
    sync::cond_init(cond, attr)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_cond_wait(
    cond: *mut pthread_cond_t,
    mutex: *mut pthread_mutex_t,
) -> c_int {
    if !ready() {
        return (real::table().pthread_cond_wait)(cond, mutex);
    }
    sync::cond_wait(cond, mutex)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_cond_timedwait(
    cond: *mut pthread_cond_t,
    mutex: *mut pthread_mutex_t,
    abstime: *const timespec,
) -> c_int {
    if !ready() {
        return (real::table().pthread_cond_timedwait)(cond, mutex, abstime);
    }
    sync::cond_timedwait(cond, mutex, abstime)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_cond_signal(cond: *mut pthread_cond_t) -> c_int {
    if !ready() {
        return (real::table().pthread_cond_signal)(cond);
    }
    sync::cond_signal(cond)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_cond_broadcast(cond: *mut pthread_cond_t) -> c_int {
    if !ready() {
        return (real::table().pthread_cond_broadcast)(cond);
    }
    sync::cond_broadcast(cond)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_cond_destroy(cond: *mut pthread_cond_t) -> c_int {
    if !ready() {
        return (real::table().pthread_cond_destroy)(cond);
    }
    sync::cond_destroy(cond)
}

// Barriers.

#[no_mangle]
pub unsafe extern "C" fn pthread_barrier_init(
    barrier: *mut pthread_barrier_t,
    attr: *const pthread_barrierattr_t,
    count: c_uint,
) -> c_int {
    if !ready() {
        return (real::table().pthread_barrier_init)(barrier, attr, count);
    }
    sync::barrier_init(barrier as *mut c_void, attr as *const c_void, count)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_barrier_wait(barrier: *mut pthread_barrier_t) -> c_int {
    if !ready() {
        return (real::table().pthread_barrier_wait)(barrier);
    }
    sync::barrier_wait(barrier as *mut c_void)
}

#[no_mangle]
pub unsafe extern "C" fn pthread_barrier_destroy(barrier: *mut pthread_barrier_t) -> c_int {
    if !ready() {
        return (real::table().pthread_barrier_destroy)(barrier);
    }
    sync::barrier_destroy(barrier as *mut c_void)
}
