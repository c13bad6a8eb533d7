// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! A library for reconstructing call chains at a probe firing.
//!
//! This crate is the unwinding core of a dynamic instrumentation system: a
//! probe (breakpoint-style, entry or return) fires at an arbitrary point of
//! execution and hands this engine a raw register snapshot; the engine
//! reconstructs the kernel-mode and user-mode call chains from it, one depth
//! at a time, on demand.
//!
//! The central structure is the per-firing, per-domain [`UnwindCache`]: a
//! depth-indexed memo of resolved program counters, filled lazily by the
//! [`FrameStepper`] and never recomputed within a firing. Front ends
//! ([`Unwinder::print_kernel`] and friends) are thin loops over the cache
//! plus a symbol oracle.
//!
//! Everything degrades rather than fails: a stepper error or invalid address
//! just ends the trace, a missing user register set prints a placeholder,
//! and contention on the shared output buffer yields an empty result
//! immediately - probe context must never block.
//!
//! The engine's collaborators (register capture, symbol resolution, address
//! validity, platform trace primitives) are trait seams filled in by the
//! embedder; which implementations exist is decided once, when the
//! [`Unwinder`] is assembled at module initialization.

mod cache;
mod fallback;
mod output;
mod probe;
mod regs;
mod stepper;
mod symbols;
mod walk;

pub use crate::cache::{CacheState, StepResult, UnwindCache};
pub use crate::fallback::{
    AddressSaver, ArchWalker, KernelFallback, StackTraceService, SAVED_ADDR_END,
};
pub use crate::output::{LogBuffer, LogGuard, OutputSink, LOG_BUF_SIZE};
pub use crate::probe::{ProbeInvocation, TaskAccessor};
pub use crate::regs::{Address, Domain, ProbeKind, Registers, UserRegs};
pub use crate::stepper::{AddressValidator, FrameStepper, StepError, UnwindContext};
pub use crate::symbols::{SymFlags, SymbolOracle};
pub use crate::walk::Unwinder;

/// Maximum backtrace depth ever attempted, in frames. Depths at or past this
/// are never computed.
pub const MAX_BACKTRACE: usize = 20;
