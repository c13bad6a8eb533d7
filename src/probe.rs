//! Per-firing state: the register captures and the two unwind caches.

use crate::cache::UnwindCache;
use crate::regs::{Address, Domain, ProbeKind, Registers, UserRegs};
use crate::stepper::UnwindContext;

/// Cheap platform accessor for the current task's saved user register area.
/// Some platforms keep a complete user capture at a known spot; when they
/// do, user-register recovery never has to unwind.
pub trait TaskAccessor {
    /// The saved user register area of the current task, if the platform
    /// keeps one.
    fn task_registers(&self) -> Option<Registers>;

    /// Whether an area returned by `task_registers` is a complete capture
    /// (as opposed to a partially-clobbered scratch area).
    fn registers_complete(&self, regs: &Registers) -> bool;
}

/// Everything one probe firing owns: the raw captures, the probe identity,
/// and the lazily-filled unwind state for both domains.
///
/// Nothing here outlives the firing and nothing is shared across CPUs;
/// concurrency only exists between distinct firings, each with its own
/// `ProbeInvocation`.
pub struct ProbeInvocation {
    pub kind: ProbeKind,
    /// Human-readable probe location, used in placeholder messages.
    pub probe_point: String,
    /// Kernel-mode register capture at the probe site, if any.
    pub kernel_regs: Option<Registers>,
    /// What is known about the interrupted user-mode registers.
    pub user_regs: UserRegs,
    /// Recorded caller return address (return probes only).
    pub return_address: Option<Address>,
    /// Address of the probed function itself (return probes only; feeds the
    /// "Returning from:" banner).
    pub probe_address: Option<Address>,
    /// Whether the current task has a user memory map at all. Kernel threads
    /// do not, and then no user backtrace exists.
    pub has_user_memory: bool,

    pub(crate) recovery_attempted: bool,
    pub(crate) kernel_cache: UnwindCache,
    pub(crate) user_cache: UnwindCache,
    pub(crate) kernel_ctx: UnwindContext,
    pub(crate) user_ctx: UnwindContext,
}

impl ProbeInvocation {
    pub fn new(kind: ProbeKind, probe_point: impl Into<String>) -> ProbeInvocation {
        ProbeInvocation {
            kind,
            probe_point: probe_point.into(),
            kernel_regs: None,
            user_regs: UserRegs::Unknown,
            return_address: None,
            probe_address: None,
            has_user_memory: false,
            recovery_attempted: false,
            kernel_cache: UnwindCache::new(),
            user_cache: UnwindCache::new(),
            kernel_ctx: UnwindContext::new(Domain::Kernel),
            user_ctx: UnwindContext::new(Domain::User),
        }
    }

    /// Read-only view of a domain's cache, for callers that want to know how
    /// far an unwind got without forcing further steps.
    pub fn cache(&self, domain: Domain) -> &UnwindCache {
        match domain {
            Domain::Kernel => &self.kernel_cache,
            Domain::User => &self.user_cache,
        }
    }
}
