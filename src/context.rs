//! Per-thread register and stack snapshots, and the two restore paths:
//! in-thread (the restored bytes overlap the live call frame, so the copy
//! and the register reload run in a small assembly routine that touches no
//! stack) and in-signal-handler (the handler frame is on the alternate
//! stack, so plain copies suffice and the kernel performs the final switch
//! on handler return).

use std::ptr;

use libc::ucontext_t;

use crate::defines::{align_down, PAGE_SIZE};

// (dst, src, len, ctx): copy the backup over the live stack with
// `rep movsb`, then tail-jump into setcontext. After the copy starts the
// routine must not touch memory below the restored frames, which rules out
// calls; the jump keeps rsp untouched.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".text",
    ".globl __rewind_restore_stack",
    ".type __rewind_restore_stack,@function",
    "__rewind_restore_stack:",
    "mov r10, rcx",
    "mov rcx, rdx",
    "cld",
    "rep movsb",
    "mov rdi, r10",
    "jmp {setcontext}",
    setcontext = sym libc::setcontext,
);

#[cfg(not(target_arch = "x86_64"))]
compile_error!("the in-thread stack restore is implemented for x86_64 only");

extern "C" {
    fn __rewind_restore_stack(
        dst: *mut u8,
        src: *const u8,
        len: usize,
        ctx: *const ucontext_t,
    ) -> !;
}

pub struct Context {
    ctx: ucontext_t,
    /// Storage for the FP register state pointed to by `ctx.uc_mcontext.fpregs`
    /// once the context has been captured from a signal frame (whose own
    /// FP-state storage dies when the handler returns). Not part of the
    /// `libc` crate's `ucontext_t` binding (which omits glibc's private
    /// `__fpregs_mem` field), so it lives alongside `ctx` here instead.
    fpregs_mem: libc::_libc_fpstate,
    /// Pre-allocated buffer of `stack_size` bytes.
    backup: *mut u8,
    /// Lowest live-stack address captured by the last save.
    backup_start: *mut u8,
    stack_top: *mut u8,
    stack_size: usize,
    backup_size: usize,
}

impl Context {
    pub fn setup_backup(&mut self, buf: *mut u8) {
        self.backup = buf;
    }

    pub fn setup_stack_info(&mut self, top: *mut u8, size: usize) {
        self.stack_top = top;
        self.stack_size = size;
    }

    pub fn stack_top(&self) -> *mut u8 {
        self.stack_top
    }

    pub fn backup_start(&self) -> *mut u8 {
        self.backup_start
    }

    pub fn backup_size(&self) -> usize {
        self.backup_size
    }

    /// Lowest address the snapshot will cover for a given stack pointer.
    /// One page of slack below the page-aligned sp keeps the saving frame's
    /// own spill slots and the ABI red zone inside the captured range.
    fn capture_floor(&self, sp: usize) -> usize {
        let floor = align_down(sp, PAGE_SIZE) - PAGE_SIZE;
        let bottom = self.stack_top as usize - self.stack_size;
        floor.max(bottom)
    }

    fn copy_out(&mut self, sp: usize) {
        let start = self.capture_floor(sp);
        let size = self.stack_top as usize - start;
        if size >= self.stack_size {
            fatal!(
                "stack to back up ({:#x} = {:p} - {:#x}) exceeds the maximum ({:#x})",
                size,
                self.stack_top,
                start,
                self.stack_size
            );
        }
        self.backup_start = start as *mut u8;
        self.backup_size = size;
        unsafe {
            ptr::copy_nonoverlapping(start as *const u8, self.backup, size);
        }
    }

    /// Snapshot the calling thread. Like `setjmp`, control also arrives
    /// here a second time when the snapshot is restored; the caller resumes
    /// with the stack in `[backup_start, stack_top)` and the register set
    /// byte-identical to this call.
    #[inline(never)]
    pub fn save_current(&mut self) {
        let marker: usize = 0;
        let sp = &marker as *const usize as usize;
        self.copy_out(sp);
        unsafe {
            libc::getcontext(&mut self.ctx);
        }
        // Nothing may run here that depends on which of the two arrivals
        // this is.
    }

    /// Snapshot from a register set delivered to a signal handler; the
    /// stack pointer comes out of the interrupted context, not ours.
    pub fn save_from(&mut self, uctx: &ucontext_t) {
        let sp = uctx.uc_mcontext.gregs[libc::REG_RSP as usize] as usize;
        self.copy_out(sp);
        self.ctx = *uctx;
        // The kernel's FP-state pointer targets the signal frame, which
        // dies when the handler returns; reseat it on our own storage.
        unsafe {
            if !uctx.uc_mcontext.fpregs.is_null() {
                self.fpregs_mem = *uctx.uc_mcontext.fpregs;
            }
            self.ctx.uc_mcontext.fpregs = &mut self.fpregs_mem;
        }
    }

    /// Restore the calling thread to its snapshot. Does not return; the
    /// thread resumes at the save point.
    pub fn rollback(&self) -> ! {
        unsafe {
            __rewind_restore_stack(
                self.backup_start,
                self.backup,
                self.backup_size,
                &self.ctx,
            )
        }
    }

    /// Restore a thread parked inside the stop-signal handler: put the
    /// stack bytes back and overwrite the kernel-supplied context so that
    /// handler return resumes at the saved program counter.
    pub unsafe fn rollback_in_handler(&self, uctx: *mut ucontext_t) {
        ptr::copy_nonoverlapping(self.backup, self.backup_start, self.backup_size);
        *uctx = self.ctx;
        // `self.ctx.uc_mcontext.fpregs` already points at `self.fpregs_mem`
        // (set in `save_from`/`save_current`), which outlives this signal
        // frame, so the copied pointer is valid as-is.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defines::MAX_STACK_SIZE;
    use crate::real;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Heap placement mirrors the runtime, where every Context lives in the
    // thread table: the restore overwrites live stack bytes, so the context
    // being read back must not sit on that stack.
    fn new_context() -> Box<Context> {
        Box::new(unsafe { std::mem::zeroed() })
    }

    fn mmap_backup() -> *mut u8 {
        let p = unsafe {
            libc::mmap(
                ptr::null_mut(),
                MAX_STACK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        assert_ne!(p, libc::MAP_FAILED);
        p as *mut u8
    }

    fn own_stack_top() -> *mut u8 {
        // Same derivation the runtime uses for spawned threads: the page
        // above the TCB bounds the usable stack.
        let tcb = unsafe { (real::table().pthread_self)() } as usize;
        align_down(tcb + PAGE_SIZE, PAGE_SIZE) as *mut u8
    }

    #[test]
    fn save_records_bounds() {
        // Volatile stores pin the pattern into its stack slot before the
        // snapshot is taken.
        let mut pattern = [0u8; 256];
        for b in pattern.iter_mut() {
            unsafe { ptr::write_volatile(b, 0xa5) };
        }

        let mut ctx = new_context();
        ctx.setup_backup(mmap_backup());
        ctx.setup_stack_info(own_stack_top(), MAX_STACK_SIZE);
        ctx.save_current();

        let start = ctx.backup_start() as usize;
        assert_eq!(start % PAGE_SIZE, 0);
        assert!(start < ctx.stack_top() as usize);
        assert_eq!(ctx.backup_size(), ctx.stack_top() as usize - start);
        assert!(ctx.backup_size() < MAX_STACK_SIZE);

        // Our own frame is inside the captured range; the pattern local
        // must appear in the backup at the mirrored offset.
        let addr = pattern.as_ptr() as usize;
        assert!(addr >= start && addr + pattern.len() <= ctx.stack_top() as usize);
        let saved =
            unsafe { std::slice::from_raw_parts(ctx.backup.add(addr - start), pattern.len()) };
        assert_eq!(&pattern[..], saved);
    }

    #[test]
    fn rollback_restores_stack_and_registers() {
        static ARRIVALS: AtomicUsize = AtomicUsize::new(0);
        ARRIVALS.store(0, Ordering::SeqCst);

        let mut ctx = new_context();
        ctx.setup_backup(mmap_backup());
        ctx.setup_stack_info(own_stack_top(), MAX_STACK_SIZE);

        // Volatile, so 41 is in the stack slot before the snapshot copies
        // it.
        let mut slot: usize = 0;
        unsafe { ptr::write_volatile(&mut slot, 41) };
        ctx.save_current();
        // First arrival: clobber the stack slot and roll back. Second
        // arrival (out of the restore): the clobber must be gone.
        if ARRIVALS.fetch_add(1, Ordering::SeqCst) == 0 {
            unsafe { ptr::write_volatile(&mut slot, 99) };
            ctx.rollback();
        }
        let observed = unsafe { ptr::read_volatile(&slot) };
        assert_eq!(observed, 41);
        assert_eq!(ARRIVALS.load(Ordering::SeqCst), 2);
    }
}
