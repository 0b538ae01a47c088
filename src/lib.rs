//! rewind — a record-and-rollback runtime for multithreaded Linux
//! programs.
//!
//! The runtime interposes on a process and divides its execution into
//! epochs. At each boundary it takes a consistent snapshot: heap and
//! globals through the external memory subsystem, each thread's registers
//! and stack bytes through the context engine, and the ordering of every
//! intercepted synchronization operation through the event logs. The next
//! boundary either commits (no detector fired) or rolls every thread back
//! to the snapshot and replays the epoch deterministically, reproducing
//! the interleaving that led to the fault so it can be diagnosed from the
//! epoch's entry point.
//!
//! Interposition is pure library preloading: the application binary is not
//! instrumented. The raw symbol surface lives behind the `interpose`
//! feature so that binaries linking the rlib (the tests) do not interpose
//! their own harness; everything below the symbol layer is identical in
//! both configurations.
//!
//! Allocator-side detectors (sentinel overflow checking, the quarantine,
//! the leak checker) and the general system-call recorder are external
//! collaborators consumed through the contracts in [`boundary`].

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod log;

pub mod boundary;
pub mod context;
pub mod defines;
pub mod epoch;
pub mod flags;
pub mod internal_heap;
pub mod real;
pub mod runtime;
pub mod sync;
pub mod sync_event;
pub mod thread_slot;
pub mod thread_table;
pub mod threads;
pub mod vm_map;

#[cfg(feature = "interpose")]
pub mod interpose;

pub use crate::boundary::{
    install_leakcheck, install_memory, install_quarantine, install_recorder,
};
pub use crate::runtime::{epoch_begin, epoch_end, initialize};
