//! Integration tests against the runtime core, without symbol
//! interposition: threads register themselves the way the trampoline
//! would, and the sync wrappers are called directly on real pthread
//! handles. Everything here shares process-global state, so the tests
//! serialize on one lock.

#[macro_use]
extern crate lazy_static;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use libc::{c_void, pthread_cond_t, pthread_mutex_t};

use rewind::epoch::coordinator;
use rewind::internal_heap::InternalHeap;
use rewind::sync;
use rewind::sync_event::SyncEventKind;
use rewind::thread_slot::{ThrStatus, ThreadSlot};
use rewind::thread_table::{set_current_index, table};
use rewind::threads;

lazy_static! {
    static ref GUARD: Mutex<()> = Mutex::new(());
}

/// The pieces of runtime init the tests need, without signal handlers or
/// initial-thread registration (the harness thread is not the process's
/// main thread).
fn core_init() {
    rewind::real::initialize();
    InternalHeap::get().initialize();
    coordinator().initialize();
    table().initialize();
    sync::init_spawn_list();
    rewind::boundary::DefaultRecorder::initialize();
}

/// Register the calling thread the way the trampoline registers a spawned
/// thread: slot bound, stack bounds from the TCB, initial context saved.
fn bind_thread() -> &'static ThreadSlot {
    coordinator().global_lock();
    let slot = table().alloc_slot();
    coordinator().global_unlock();
    unsafe { threads::register_thread(slot, false) };
    slot
}

fn unbind_thread(slot: &'static ThreadSlot) {
    set_current_index(rewind::defines::NO_SLOT);
    table().withdraw_cancelled(slot);
}

fn new_mutex_handle() -> Box<pthread_mutex_t> {
    Box::new(unsafe { std::mem::zeroed() })
}

fn new_cond_handle() -> Box<pthread_cond_t> {
    Box::new(unsafe { std::mem::zeroed() })
}

unsafe fn shadow_of(handle: *mut c_void) -> usize {
    *(handle as *const usize)
}

#[test]
fn record_mode_logs_every_acquisition() {
    let _g = GUARD.lock().unwrap();
    core_init();

    const ROUNDS: usize = 100;
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    COUNTER.store(0, Ordering::SeqCst);

    let mut handle = new_mutex_handle();
    let addr = &mut *handle as *mut pthread_mutex_t as usize;

    let workers: Vec<_> = (0..2)
        .map(|_| {
            std::thread::spawn(move || {
                let slot = bind_thread();
                let mutex = addr as *mut pthread_mutex_t;
                for _ in 0..ROUNDS {
                    unsafe {
                        assert_eq!(sync::mutex_lock(mutex), 0);
                        COUNTER.fetch_add(1, Ordering::Relaxed);
                        assert_eq!(sync::mutex_unlock(mutex), 0);
                    }
                }
                slot
            })
        })
        .collect();

    let slots: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(COUNTER.load(Ordering::SeqCst), 2 * ROUNDS);

    // The lazily installed shadow lives in the internal heap, and the
    // object log holds one successful acquisition per lock call.
    let shadow = unsafe { shadow_of(addr as *mut c_void) };
    assert!(InternalHeap::get().in_range(shadow));

    let list = unsafe {
        &*((shadow + std::mem::size_of::<pthread_mutex_t>())
            as *const rewind::sync_event::SyncEventList)
    };
    assert_eq!(list.len(), 2 * ROUNDS);

    let mut per_slot = [0usize; 2];
    let mut walked = 0;
    let mut event = list.reset_for_replay();
    while let Some(e) = event {
        assert_eq!(e.ret, 0);
        assert_eq!(e.kind, SyncEventKind::MutexLock);
        for (i, s) in slots.iter().enumerate() {
            if s.index == e.tindex {
                per_slot[i] += 1;
            }
        }
        walked += 1;
        event = list.advance();
    }
    assert_eq!(walked, 2 * ROUNDS);
    assert_eq!(per_slot, [ROUNDS, ROUNDS]);

    // Destroys are deferred, so the shadow survives until the next commit
    // drains the list.
    unsafe {
        sync::mutex_destroy(addr as *mut pthread_mutex_t);
    }
    assert!(InternalHeap::get().in_range(unsafe { shadow_of(addr as *mut c_void) }));
    table().run_deferred(sync::reclaim_entry);
    sync::epoch_end_well();
    for slot in slots {
        unbind_thread(slot);
    }
}

#[test]
fn replay_reproduces_a_single_thread_lock_sequence() {
    let _g = GUARD.lock().unwrap();
    core_init();

    let slot = bind_thread();
    let mut handle = new_mutex_handle();
    let mutex = &mut *handle as *mut pthread_mutex_t;

    unsafe {
        // Record: lock, failed trylock (default mutexes are not
        // recursive), unlock, then one more acquisition.
        assert_eq!(sync::mutex_lock(mutex), 0);
        assert_eq!(sync::mutex_trylock(mutex), libc::EBUSY);
        assert_eq!(sync::mutex_unlock(mutex), 0);
        assert_eq!(sync::mutex_lock(mutex), 0);
        assert_eq!(sync::mutex_unlock(mutex), 0);
    }

    // Roll the epoch back: rewound logs, fresh semaphores, one token for
    // the head owner of every log.
    table().prepare_rollback();
    sync::prepare_rollback();
    coordinator().set_rollback();

    unsafe {
        // The same sequence must come back with the same return codes,
        // without ever touching the real primitive.
        assert_eq!(sync::mutex_lock(mutex), 0);
        assert_eq!(sync::mutex_trylock(mutex), libc::EBUSY);
        assert_eq!(sync::mutex_unlock(mutex), 0);
        assert_eq!(sync::mutex_lock(mutex), 0);
        assert_eq!(sync::mutex_unlock(mutex), 0);
    }

    // Clear the rollback state for whatever runs after us.
    coordinator().initialize();
    unsafe {
        sync::mutex_destroy(mutex);
    }
    table().run_deferred(sync::reclaim_entry);
    sync::epoch_end_well();
    unbind_thread(slot);
}

#[test]
fn cond_wakeup_is_recorded_on_the_mutex_log() {
    let _g = GUARD.lock().unwrap();
    core_init();

    static FLAG: AtomicBool = AtomicBool::new(false);
    static WAITER_INDEX: AtomicUsize = AtomicUsize::new(usize::MAX);
    FLAG.store(false, Ordering::SeqCst);
    WAITER_INDEX.store(usize::MAX, Ordering::SeqCst);

    let mut mutex_handle = new_mutex_handle();
    let mut cond_handle = new_cond_handle();
    let m_addr = &mut *mutex_handle as *mut pthread_mutex_t as usize;
    let c_addr = &mut *cond_handle as *mut pthread_cond_t as usize;

    let waiter = std::thread::spawn(move || {
        let slot = bind_thread();
        let mutex = m_addr as *mut pthread_mutex_t;
        let cond = c_addr as *mut pthread_cond_t;
        WAITER_INDEX.store(slot.index, Ordering::Release);
        unsafe {
            assert_eq!(sync::mutex_lock(mutex), 0);
            while !FLAG.load(Ordering::Acquire) {
                assert_eq!(sync::cond_wait(cond, mutex), 0);
            }
            assert_eq!(slot.status(), ThrStatus::Running);
            assert_eq!(sync::mutex_unlock(mutex), 0);
        }
        slot
    });

    let signaler = std::thread::spawn(move || {
        let slot = bind_thread();
        let mutex = m_addr as *mut pthread_mutex_t;
        let cond = c_addr as *mut pthread_cond_t;
        // Signal only once the waiter is provably parked, so the test
        // always exercises a real wakeup.
        loop {
            let idx = WAITER_INDEX.load(Ordering::Acquire);
            if idx != usize::MAX && table().slot(idx).status() == ThrStatus::CondWaiting {
                break;
            }
            std::thread::yield_now();
        }
        unsafe {
            assert_eq!(sync::mutex_lock(mutex), 0);
            FLAG.store(true, Ordering::Release);
            assert_eq!(sync::cond_signal(cond), 0);
            assert_eq!(sync::mutex_unlock(mutex), 0);
        }
        slot
    });

    let w = waiter.join().unwrap();
    let s = signaler.join().unwrap();

    // At minimum: the waiter's lock, the signaler's lock, and the waiter's
    // recorded wakeup, all on the mutex's log.
    let shadow = unsafe { shadow_of(m_addr as *mut c_void) };
    let list = unsafe {
        &*((shadow + std::mem::size_of::<pthread_mutex_t>())
            as *const rewind::sync_event::SyncEventList)
    };
    assert!(list.len() >= 3, "only {} events recorded", list.len());

    unsafe {
        sync::cond_destroy(c_addr as *mut pthread_cond_t);
        sync::mutex_destroy(m_addr as *mut pthread_mutex_t);
    }
    table().run_deferred(sync::reclaim_entry);
    sync::epoch_end_well();
    unbind_thread(w);
    unbind_thread(s);
}

#[test]
fn barrier_two_phase_flip_survives_reuse() {
    let _g = GUARD.lock().unwrap();
    core_init();

    const PARTIES: usize = 3;
    static PASSED: AtomicUsize = AtomicUsize::new(0);
    PASSED.store(0, Ordering::SeqCst);

    // A barrier handle is two pointer-sized words from the runtime's point
    // of view.
    let mut storage = Box::new([0usize; 4]);
    let b_addr = storage.as_mut_ptr() as usize;
    unsafe {
        assert_eq!(
            sync::barrier_init(b_addr as *mut c_void, std::ptr::null(), PARTIES as u32),
            0
        );
    }

    let workers: Vec<_> = (0..PARTIES)
        .map(|_| {
            std::thread::spawn(move || {
                let slot = bind_thread();
                unsafe {
                    // Two rounds through the same barrier: a wrapping
                    // thread must not slip into a draining arrival phase.
                    assert_eq!(sync::barrier_wait(b_addr as *mut c_void), 0);
                    PASSED.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(sync::barrier_wait(b_addr as *mut c_void), 0);
                }
                slot
            })
        })
        .collect();

    let slots: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(PASSED.load(Ordering::SeqCst), PARTIES);

    unsafe {
        sync::barrier_destroy(b_addr as *mut c_void);
    }
    table().run_deferred(sync::reclaim_entry);
    sync::epoch_end_well();
    for slot in slots {
        unbind_thread(slot);
    }
}

static SPAWNED_RAN: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn spawned_worker(arg: *mut c_void) -> *mut c_void {
    SPAWNED_RAN.fetch_add(1, Ordering::SeqCst);
    arg
}

#[test]
fn thread_create_join_and_reap() {
    let _g = GUARD.lock().unwrap();
    core_init();
    SPAWNED_RAN.store(0, Ordering::SeqCst);

    let me = bind_thread();
    let spawn_events_before = sync::spawn_list().len();
    let reapable_before = table().reapable_threads();

    let mut tid: libc::pthread_t = 0;
    let arg = 0x5151usize as *mut c_void;
    unsafe {
        assert_eq!(
            threads::thread_create(&mut tid, std::ptr::null(), spawned_worker, arg),
            0
        );
    }
    assert_ne!(tid, 0);
    assert_eq!(sync::spawn_list().len(), spawn_events_before + 1);

    let child = table().find_by_handle(tid).expect("child has a slot");
    let mut result: *mut c_void = std::ptr::null_mut();
    unsafe {
        assert_eq!(threads::thread_join(tid, &mut result), 0);
    }
    assert_eq!(result, arg);
    assert_eq!(SPAWNED_RAN.load(Ordering::SeqCst), 1);

    // The child is parked for reaping, not dead: its slot and logs must
    // survive until a commit.
    assert_eq!(child.status(), ThrStatus::WaitforReaping);
    assert!(child.has_joined.load(Ordering::Acquire));
    assert_eq!(table().reapable_threads(), reapable_before + 1);

    // What a commit does: release the parked thread, collect it for real,
    // then drain the deferred list.
    child.lock();
    child.set_status(ThrStatus::Exiting);
    child.signal();
    child.unlock();
    unsafe {
        (rewind::real::table().pthread_join)(child.handle(), std::ptr::null_mut());
    }
    table().run_deferred(sync::reclaim_entry);
    assert!(child.available.load(Ordering::Acquire));
    assert_eq!(table().reapable_threads(), reapable_before);

    sync::epoch_end_well();
    rewind::boundary::recorder().epoch_end_well();
    unbind_thread(me);
}

#[test]
fn clean_commit_advances_the_epoch() {
    let _g = GUARD.lock().unwrap();
    core_init();

    // The committer must be a registered thread; with no other live
    // threads the boundary needs no signals and commits immediately.
    let committer = std::thread::spawn(|| {
        let slot = bind_thread();
        let ends_before = coordinator().epochs_ended();
        rewind::runtime::epoch_end(false);
        assert!(coordinator().is_epoch_begin());
        assert_eq!(coordinator().epochs_ended(), ends_before + 1);
        assert!(!coordinator().has_rollbacked());
        slot
    });
    let slot = committer.join().unwrap();

    coordinator().initialize();
    unbind_thread(slot);
}
