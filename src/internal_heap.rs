//! Fixed-address private allocator for runtime metadata: thread slots,
//! shadow sync objects, event logs, deferred-destroy entries. It never
//! shares storage with application allocations, and because the reservation
//! lives at a known base a single range check tells whether a pointer read
//! out of an application sync handle is one of ours.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::defines::{align_up, INTERNAL_HEAP_BASE, INTERNAL_HEAP_END, INTERNAL_HEAP_SIZE};

const HEADER_SIZE: usize = 16;
const MIN_CLASS: usize = 5; // 32 bytes
const MAX_CLASS: usize = 24; // 16 MiB
const NUM_CLASSES: usize = MAX_CLASS + 1;

/// One word of class index ahead of each payload; the second header word
/// keeps payloads 16-aligned. Freed blocks reuse the payload's first word
/// as the free-list link.
struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    const fn new() -> SpinLock {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }

    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

pub struct InternalHeap {
    lock: SpinLock,
    mapped: AtomicBool,
    bump: AtomicUsize,
    bins: [AtomicUsize; NUM_CLASSES],
}

static HEAP: InternalHeap = InternalHeap {
    lock: SpinLock::new(),
    mapped: AtomicBool::new(false),
    bump: AtomicUsize::new(0),
    bins: [
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
        AtomicUsize::new(0),
    ],
};

fn size_class(payload: usize) -> usize {
    let total = payload + HEADER_SIZE;
    let mut class = MIN_CLASS;
    while (1usize << class) < total {
        class += 1;
        if class > MAX_CLASS {
            fatal!("internal heap request too large: {} bytes", payload);
        }
    }
    class
}

impl InternalHeap {
    pub fn get() -> &'static InternalHeap {
        &HEAP
    }

    /// Reserve the fixed range. Idempotent; must run before any other
    /// runtime component allocates.
    pub fn initialize(&self) {
        if self.mapped.swap(true, Ordering::AcqRel) {
            return;
        }
        let addr = unsafe {
            libc::mmap(
                INTERNAL_HEAP_BASE as *mut libc::c_void,
                INTERNAL_HEAP_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE
                    | libc::MAP_ANONYMOUS
                    | libc::MAP_NORESERVE
                    | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if addr as usize != INTERNAL_HEAP_BASE {
            fatal!(
                "internal heap reservation at {:#x} failed (got {:p}, errno {})",
                INTERNAL_HEAP_BASE,
                addr,
                nix::errno::errno()
            );
        }
        self.bump.store(INTERNAL_HEAP_BASE, Ordering::Release);
    }

    pub fn malloc(&self, size: usize) -> *mut u8 {
        require!(self.mapped.load(Ordering::Acquire), "internal heap used before init");
        let class = size_class(size);

        self.lock.lock();
        let head = self.bins[class].load(Ordering::Relaxed);
        let payload = if head != 0 {
            let next = unsafe { ptr::read(head as *const usize) };
            self.bins[class].store(next, Ordering::Relaxed);
            head
        } else {
            let block = self.bump.load(Ordering::Relaxed);
            let new_bump = align_up(block + (1 << class), 16);
            if new_bump > INTERNAL_HEAP_END {
                self.lock.unlock();
                fatal!("internal heap exhausted");
            }
            self.bump.store(new_bump, Ordering::Relaxed);
            unsafe { ptr::write(block as *mut usize, class) };
            block + HEADER_SIZE
        };
        self.lock.unlock();

        // A recycled block still carries its class in the header.
        debug_assert_eq!(
            unsafe { ptr::read((payload - HEADER_SIZE) as *const usize) },
            class
        );
        payload as *mut u8
    }

    pub fn free(&self, ptr_in: *mut u8) {
        let payload = ptr_in as usize;
        require!(
            self.in_range(payload),
            "internal heap free of foreign pointer {:p}",
            ptr_in
        );
        let class = unsafe { ptr::read((payload - HEADER_SIZE) as *const usize) };
        require!(
            class >= MIN_CLASS && class <= MAX_CLASS,
            "corrupt internal heap header at {:p}",
            ptr_in
        );

        self.lock.lock();
        let head = self.bins[class].load(Ordering::Relaxed);
        unsafe { ptr::write(payload as *mut usize, head) };
        self.bins[class].store(payload, Ordering::Relaxed);
        self.lock.unlock();
    }

    /// Whether `addr` points into the reservation. Used as the validity
    /// test for shadow pointers read out of application sync handles.
    pub fn in_range(&self, addr: usize) -> bool {
        addr >= INTERNAL_HEAP_BASE && addr < INTERNAL_HEAP_END
    }

    /// Allocate zeroed storage for one `T`.
    pub fn alloc<T>(&self) -> *mut T {
        let p = self.malloc(std::mem::size_of::<T>()) as *mut T;
        unsafe { ptr::write_bytes(p as *mut u8, 0, std::mem::size_of::<T>()) };
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_recycles() {
        let heap = InternalHeap::get();
        heap.initialize();

        let a = heap.malloc(100);
        assert!(heap.in_range(a as usize));
        assert_eq!(a as usize % 16, 0);
        heap.free(a);
        let b = heap.malloc(100);
        // Same class goes back to the same block.
        assert_eq!(a, b);
        heap.free(b);
    }

    #[test]
    fn distinct_classes_do_not_alias() {
        let heap = InternalHeap::get();
        heap.initialize();

        let small = heap.malloc(24);
        let large = heap.malloc(4096);
        assert_ne!(small, large);
        unsafe {
            ptr::write_bytes(small, 0xaa, 24);
            ptr::write_bytes(large, 0xbb, 4096);
            assert_eq!(*small, 0xaa);
            assert_eq!(*large, 0xbb);
        }
        heap.free(small);
        heap.free(large);
    }

    #[test]
    fn in_range_bounds() {
        let heap = InternalHeap::get();
        assert!(!heap.in_range(INTERNAL_HEAP_BASE - 1));
        assert!(heap.in_range(INTERNAL_HEAP_BASE));
        assert!(!heap.in_range(INTERNAL_HEAP_END));
    }
}
