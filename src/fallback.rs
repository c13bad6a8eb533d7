// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Kernel-domain fallback walkers, for firings where the metadata-driven
//! stepper is unavailable or produced nothing.
//!
//! These are platform primitives, not part of the cache abstraction: the
//! print front end consumes them directly and their output is best-effort.
//! Which one exists is detected once, when the [`Unwinder`][crate::Unwinder]
//! is assembled.

use crate::regs::{Address, Registers};

/// End-of-list marker used by [`AddressSaver`] implementations: entries
/// equal to this value terminate the saved list.
pub const SAVED_ADDR_END: Address = Address::MAX;

/// Platform "dump every frame reachable from this stack pointer" service.
/// Invokes `each` once per frame with the address and whether the platform
/// considers it reliable.
pub trait StackTraceService {
    fn dump_stack(&self, sp: Address, each: &mut dyn FnMut(Address, bool));
}

/// Platform "save up to N return addresses" primitive. Returns the number of
/// entries written; a [`SAVED_ADDR_END`] entry ends the list early.
pub trait AddressSaver {
    fn save_addresses(&self, regs: &Registers, entries: &mut [Address], skip: usize) -> usize;
}

/// The opaque architecture-specific frame-pointer walk, used on builds that
/// have a register capture but no metadata stepper at all.
pub trait ArchWalker {
    fn walk(&self, regs: &Registers, max_levels: usize, each: &mut dyn FnMut(Address));
}

/// Which fallback strategy this build/platform offers for kernel traces.
pub enum KernelFallback {
    /// Delegate to a callback-per-frame trace service.
    TraceService(Box<dyn StackTraceService + Send + Sync>),
    /// Delegate to a save-addresses primitive. Without frame pointers in the
    /// build, every saved address is guesswork and is marked inexact.
    AddressList {
        saver: Box<dyn AddressSaver + Send + Sync>,
        frame_pointers: bool,
    },
    /// No platform primitive at all; emit a single inexact marker.
    Unavailable,
}
