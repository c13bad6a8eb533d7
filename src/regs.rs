//! Value types shared by the unwinder: addresses, domains, probe kinds and
//! register snapshots.

/// A program-counter or data address in either address space.
pub type Address = u64;

/// Which address space (and register context) an unwind operates on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Domain {
    Kernel,
    User,
}

/// How the probe that produced this firing was attached.
///
/// Return probes fire at a function's return point through a trampoline, so
/// the captured program counter at the probe site is the trampoline itself;
/// the meaningful depth-0 pc is the recorded return address instead.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProbeKind {
    /// Kernel entry probe (breakpoint-style).
    Normal,
    /// Kernel return probe.
    KernelReturn,
    /// User-space return probe.
    UserReturn,
    /// User-space entry probe.
    UserEntry,
}

impl ProbeKind {
    /// Whether the probe fired in user context.
    pub fn is_user(self) -> bool {
        matches!(self, ProbeKind::UserReturn | ProbeKind::UserEntry)
    }
}

/// The frame-tracking register record the stepper advances: program counter,
/// stack pointer and frame pointer. This is the minimal state the
/// metadata-driven stepper needs to carry from one frame to its caller.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub pc: Address,
    pub sp: Address,
    pub fp: Address,
}

/// What is known about the interrupted user-mode register set.
///
/// A kernel-mode firing does not necessarily have the user registers
/// resident; recovery may later produce a `Complete` value. Each variant
/// owns its snapshot, so recovery never mutates a capture in place.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UserRegs {
    /// No user register set is known at all.
    Unknown,
    /// A register area exists but is not a trustworthy full capture; only
    /// its pc (the recovery target) and sp are usable.
    Partial(Registers),
    /// A complete, usable user register set.
    Complete(Registers),
}

impl Default for UserRegs {
    fn default() -> UserRegs {
        UserRegs::Unknown
    }
}

impl UserRegs {
    pub fn is_complete(&self) -> bool {
        matches!(self, UserRegs::Complete(_))
    }
}
