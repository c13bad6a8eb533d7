//! The symbol oracle seam: resolving and emitting a program counter value is
//! external to the unwind engine, which only hands addresses and flag bits
//! across this boundary.

use std::fmt;

use bitflags::bitflags;

use crate::regs::Address;

bitflags! {
    /// Formatting directives passed through to the symbol oracle.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SymFlags: u32 {
        /// Resolve to a symbol name; without this, emit the numeric address
        /// only.
        const SYMBOL = 1 << 0;
        /// Include the module the address falls in.
        const MODULE = 1 << 1;
        /// Include the offset from the symbol start.
        const OFFSET = 1 << 2;
        /// The address came from a best-effort walk and may be wrong.
        const INEXACT = 1 << 3;

        /// Short form: symbol name only.
        const BRIEF = Self::SYMBOL.bits();
        /// Long form: symbol, module and offset.
        const FULL = Self::SYMBOL.bits() | Self::MODULE.bits() | Self::OFFSET.bits();
    }
}

/// Resolve `addr` and write its textual form to `out`.
///
/// `user` marks user-space addresses so the oracle can consult the current
/// task's mappings rather than the kernel symbol table.
pub trait SymbolOracle {
    fn write_addr(
        &self,
        addr: Address,
        flags: SymFlags,
        user: bool,
        out: &mut dyn fmt::Write,
    ) -> fmt::Result;
}
