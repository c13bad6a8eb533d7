// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The unwind engine proper: per-domain stepping, depth-indexed cache
//! advancement, user-register recovery, and the print/sprint front ends.

use std::fmt::Write as _;

use tracing::trace;

use crate::cache::StepResult;
use crate::fallback::{ArchWalker, KernelFallback, SAVED_ADDR_END};
use crate::output::{LogBuffer, LogGuard};
use crate::probe::{ProbeInvocation, TaskAccessor};
use crate::regs::{Address, Domain, ProbeKind, Registers, UserRegs};
use crate::stepper::{AddressValidator, FrameStepper, UnwindContext};
use crate::symbols::{SymFlags, SymbolOracle};
use crate::MAX_BACKTRACE;

const POINTER_WIDTH: u64 = std::mem::size_of::<Address>() as u64;

/// The capability bundle the unwind engine runs against.
///
/// Which stepper exists, which kernel fallback applies and whether a
/// trampoline sentinel is in play are all decided once, when the module
/// embedding this engine initializes - not per firing, and never per call.
pub struct Unwinder {
    /// The metadata-driven stepper, when the build has one.
    pub stepper: Option<Box<dyn FrameStepper + Send + Sync>>,
    /// Address-validity oracle for stepper output.
    pub validator: Box<dyn AddressValidator + Send + Sync>,
    /// Resolve-and-emit oracle for front-end output.
    pub symbols: Box<dyn SymbolOracle + Send + Sync>,
    /// Kernel-domain fallback strategy.
    pub fallback: KernelFallback,
    /// Architecture frame-pointer walk for stepper-less builds that still
    /// have a register capture.
    pub arch_walker: Option<Box<dyn ArchWalker + Send + Sync>>,
    /// Cheap accessor for the current task's saved user registers.
    pub task: Option<Box<dyn TaskAccessor + Send + Sync>>,
    /// Kernel return-probe trampoline address; stepping onto it terminates
    /// the unwind rather than reporting a fake call site.
    pub trampoline: Option<Address>,
    /// Frames of the unwinder's own call path to skip when the trace-service
    /// fallback runs without a register capture.
    pub fallback_skip: usize,
}

impl Unwinder {
    /// A minimal unwinder: no stepper, no fallback, no task accessor.
    /// Capabilities are filled in by the embedder's initialization.
    pub fn new(
        validator: Box<dyn AddressValidator + Send + Sync>,
        symbols: Box<dyn SymbolOracle + Send + Sync>,
    ) -> Unwinder {
        Unwinder {
            stepper: None,
            validator,
            symbols,
            fallback: KernelFallback::Unavailable,
            arch_walker: None,
            task: None,
            trampoline: None,
            fallback_skip: 0,
        }
    }

    /// The kernel-domain pc at `depth`, from the cache, stepping as needed.
    ///
    /// `None` means the unwind provably does not reach `depth` (or `depth`
    /// is past the ceiling). The metadata path only; builds without a
    /// stepper get nothing past depth 0 here and must print through the
    /// fallback walker instead.
    pub fn kernel_pc(&self, inv: &mut ProbeInvocation, depth: usize) -> Option<Address> {
        let ProbeInvocation {
            kind,
            kernel_regs,
            return_address,
            kernel_cache,
            kernel_ctx,
            ..
        } = inv;
        let trampoline = self.trampoline;
        kernel_cache.get(depth, |d| {
            let pc = self.step_kernel(*kind, kernel_regs.as_ref(), *return_address, kernel_ctx, d);
            StepResult {
                pc,
                terminal: pc == 0 || Some(pc) == trampoline,
            }
        })
    }

    /// The user-domain pc at `depth`. Termination is by zero pc only; user
    /// code has no trampoline sentinel.
    pub fn user_pc(&self, inv: &mut ProbeInvocation, depth: usize) -> Option<Address> {
        let uregs = self.recover_user_regs(inv);
        let ProbeInvocation {
            kind,
            return_address,
            has_user_memory,
            user_cache,
            user_ctx,
            ..
        } = inv;
        user_cache.get(depth, |d| {
            let pc = self.step_user(
                *kind,
                uregs.as_ref(),
                *has_user_memory,
                *return_address,
                user_ctx,
                d,
            );
            StepResult {
                pc,
                terminal: pc == 0,
            }
        })
    }

    fn step_kernel(
        &self,
        kind: ProbeKind,
        regs: Option<&Registers>,
        return_address: Option<Address>,
        ctx: &mut UnwindContext,
        depth: usize,
    ) -> Address {
        if depth == 0 {
            trace!("starting kernel unwind");
            let regs = match regs {
                Some(regs) => regs,
                None => {
                    // Even the current pc is unknown. Frame-pointer
                    // architectures can still synthesize the active frame;
                    // elsewhere there is no data at any depth.
                    if let Some(stepper) = &self.stepper {
                        if let Some(frame) = stepper.start(None, Domain::Kernel) {
                            let pc = frame.pc;
                            ctx.start(frame);
                            return pc;
                        }
                    }
                    return 0;
                }
            };
            if kind == ProbeKind::KernelReturn {
                if let Some(addr) = return_address {
                    // The captured pc at a return-probe site is the
                    // trampoline; report the recorded return address.
                    return addr;
                }
            }
            return regs.pc;
        }

        let stepper = match &self.stepper {
            Some(stepper) => stepper,
            None => return 0,
        };

        trace!(depth, "continuing kernel unwind");
        if depth == 1 {
            match regs {
                Some(regs) => match stepper.start(Some(regs), Domain::Kernel) {
                    Some(frame) => ctx.start(frame),
                    None => return 0,
                },
                // No capture: the synthesized frame from depth 0 is already
                // live in the context.
                None => {}
            }
        }

        match ctx.advance(stepper.as_ref()) {
            Ok(pc) => {
                if self
                    .validator
                    .is_valid_read(pc, POINTER_WIDTH, Domain::Kernel)
                {
                    pc
                } else {
                    trace!(pc, "kernel unwind left valid address space");
                    0
                }
            }
            Err(err) => {
                trace!(%err, "kernel unwind step failed");
                0
            }
        }
    }

    fn step_user(
        &self,
        kind: ProbeKind,
        regs: Option<&Registers>,
        has_user_memory: bool,
        return_address: Option<Address>,
        ctx: &mut UnwindContext,
        depth: usize,
    ) -> Address {
        // No task memory map or no usable register set: the whole trace is
        // empty.
        let regs = match regs {
            Some(regs) if has_user_memory => regs,
            _ => return 0,
        };

        if depth == 0 {
            trace!("starting user unwind");
            if kind == ProbeKind::UserReturn {
                if let Some(addr) = return_address {
                    return addr;
                }
            }
            return regs.pc;
        }

        // User traces exist only where the metadata stepper does.
        let stepper = match &self.stepper {
            Some(stepper) => stepper,
            None => return 0,
        };

        trace!(depth, "continuing user unwind");
        if depth == 1 {
            match stepper.start(Some(regs), Domain::User) {
                Some(frame) => ctx.start(frame),
                None => return 0,
            }
        }

        match ctx.advance(stepper.as_ref()) {
            Ok(pc) => {
                if self.validator.is_valid_read(pc, POINTER_WIDTH, Domain::User) {
                    pc
                } else {
                    trace!(pc, "user unwind left valid address space");
                    0
                }
            }
            Err(err) => {
                trace!(%err, "user unwind step failed");
                0
            }
        }
    }

    /// Obtain the interrupted user-mode register set, reconstructing it from
    /// the kernel capture if necessary.
    ///
    /// Recovery by unwinding is attempted at most once per firing: on
    /// failure the firing simply has no user backtrace, and a later call
    /// will not re-run the search. A successful recovery consumes the
    /// kernel unwind context, so the kernel cache is invalidated.
    pub fn recover_user_regs(&self, inv: &mut ProbeInvocation) -> Option<Registers> {
        if let UserRegs::Complete(regs) = inv.user_regs {
            return Some(regs);
        }
        if inv.recovery_attempted {
            return None;
        }
        inv.recovery_attempted = true;

        // A probe that fired in user context always carries complete
        // registers; there is nothing to reconstruct.
        if inv.kind.is_user() {
            if let UserRegs::Partial(regs) = inv.user_regs {
                inv.user_regs = UserRegs::Complete(regs);
                return Some(regs);
            }
            return None;
        }

        trace!("computing user registers");
        let mut target = match inv.user_regs {
            UserRegs::Partial(regs) => Some(regs),
            _ => None,
        };
        if target.is_none() {
            // Cheap path first: some platforms keep a complete capture at
            // the task's saved register area.
            if let Some(task) = &self.task {
                if let Some(regs) = task.task_registers() {
                    if task.registers_complete(&regs) {
                        inv.user_regs = UserRegs::Complete(regs);
                        return Some(regs);
                    }
                    inv.user_regs = UserRegs::Partial(regs);
                    target = Some(regs);
                }
            }
        }
        let target = target?;

        // Recovery by unwinding: walk the kernel stack from the probe
        // location until the pc matches the user pc we already know.
        let stepper = self.stepper.as_ref()?;
        let kernel_regs = inv.kernel_regs?;

        let mut levels = MAX_BACKTRACE;
        if inv.kernel_ctx.frame().map(|f| f.pc) == Some(target.pc) {
            // This firing already unwound the kernel stack all the way to
            // user space; the context is sitting on the answer.
            trace!("kernel context already at user pc");
            levels = 0;
        } else {
            let frame = stepper.start(Some(&kernel_regs), Domain::Kernel)?;
            inv.kernel_ctx.start(frame);
            trace!(target = target.pc, "searching for user pc");
            // The search below consumes the context, so cached kernel
            // depths no longer line up with it.
            inv.kernel_cache.invalidate();
        }

        let mut failed = false;
        while levels > 0 && inv.kernel_ctx.frame().map(|f| f.pc) != Some(target.pc) {
            levels -= 1;
            match inv.kernel_ctx.advance(stepper.as_ref()) {
                Ok(pc) => trace!(levels, pc, "recovery step"),
                Err(err) => {
                    trace!(%err, "recovery step failed");
                    failed = true;
                    break;
                }
            }
        }

        let frame = inv.kernel_ctx.frame().copied();
        match frame {
            Some(frame) if !failed && frame.pc == target.pc => {
                let mut recovered = frame;
                // The user stack pointer is already known; the kernel-side
                // value at the transition frame is not it.
                recovered.sp = target.sp;
                inv.user_regs = UserRegs::Complete(recovered);
                trace!(pc = recovered.pc, sp = recovered.sp, "recovered user registers");
                Some(recovered)
            }
            _ => {
                trace!("failed to recover user register state");
                None
            }
        }
    }

    /// Print the kernel backtrace through the shared buffer. If the buffer
    /// is contended nothing is printed; the probe context must not wait.
    pub fn print_kernel(&self, inv: &mut ProbeInvocation, out: &LogBuffer, flags: SymFlags) {
        let mut log = match out.try_lock() {
            Some(log) => log,
            None => return,
        };
        self.print_kernel_frames(inv, &mut log, flags);
    }

    /// Print the user backtrace through the shared buffer.
    pub fn print_user(&self, inv: &mut ProbeInvocation, out: &LogBuffer, flags: SymFlags) {
        let mut log = match out.try_lock() {
            Some(log) => log,
            None => return,
        };
        self.print_user_frames(inv, &mut log, flags);
    }

    /// Capture the kernel backtrace into `dst` as a NUL-terminated string,
    /// copying at most `dst.len() - 1` bytes. Returns the bytes copied
    /// (excluding the NUL). Contention on the shared buffer yields an empty
    /// string immediately.
    pub fn sprint_kernel(
        &self,
        inv: &mut ProbeInvocation,
        out: &LogBuffer,
        dst: &mut [u8],
        flags: SymFlags,
    ) -> usize {
        self.sprint_with(out, dst, |unwinder, log| {
            unwinder.print_kernel_frames(inv, log, flags)
        })
    }

    /// Capture the user backtrace into `dst`; same contract as
    /// [`sprint_kernel`][Self::sprint_kernel].
    pub fn sprint_user(
        &self,
        inv: &mut ProbeInvocation,
        out: &LogBuffer,
        dst: &mut [u8],
        flags: SymFlags,
    ) -> usize {
        self.sprint_with(out, dst, |unwinder, log| {
            unwinder.print_user_frames(inv, log, flags)
        })
    }

    fn sprint_with<F>(&self, out: &LogBuffer, dst: &mut [u8], emit: F) -> usize
    where
        F: FnOnce(&Unwinder, &mut LogGuard<'_>),
    {
        let mut log = match out.try_lock() {
            Some(log) => log,
            None => {
                if let Some(first) = dst.first_mut() {
                    *first = 0;
                }
                return 0;
            }
        };
        log.begin_capture();
        emit(self, &mut log);
        let copied = log.bytes().len().min(dst.len().saturating_sub(1));
        dst[..copied].copy_from_slice(&log.bytes()[..copied]);
        if let Some(terminator) = dst.get_mut(copied) {
            *terminator = 0;
        }
        log.end_capture();
        copied
    }

    fn print_kernel_frames(
        &self,
        inv: &mut ProbeInvocation,
        log: &mut LogGuard<'_>,
        flags: SymFlags,
    ) {
        if inv.kind == ProbeKind::KernelReturn && flags.contains(SymFlags::FULL) {
            if let Some(addr) = inv.probe_address {
                let _ = log.write_str("Returning from: ");
                self.print_addr(addr, flags, false, log);
                let _ = log.write_str("Returning to  : ");
            }
        }
        let pc0 = self.kernel_pc(inv, 0).unwrap_or(0);
        self.print_addr(pc0, flags, false, log);

        if self.stepper.is_some() {
            let mut printed = false;
            for depth in 1..MAX_BACKTRACE {
                match self.kernel_pc(inv, depth) {
                    Some(pc) => {
                        self.print_addr(pc, flags, false, log);
                        printed = true;
                    }
                    None => {
                        // If the stepper already produced frames there is
                        // nothing to add; re-walking through the platform
                        // fallback would duplicate output.
                        if !printed {
                            let frame = inv.kernel_ctx.frame().copied().or(inv.kernel_regs);
                            let sp = frame.map(|f| f.sp).unwrap_or(0);
                            self.print_fallback(
                                sp,
                                frame.as_ref(),
                                flags,
                                MAX_BACKTRACE - depth,
                                0,
                                log,
                            );
                        }
                        break;
                    }
                }
            }
        } else if inv.kernel_regs.is_none() {
            match &self.fallback {
                KernelFallback::Unavailable => {
                    if flags.contains(SymFlags::SYMBOL) {
                        let _ = writeln!(log, "<no kernel backtrace at {}>", inv.probe_point);
                    } else {
                        let _ = log.write_str("\n");
                    }
                }
                _ => {
                    // No capture to start from; let the platform service
                    // guess, skipping our own framework frames.
                    self.print_fallback(0, None, flags, MAX_BACKTRACE, self.fallback_skip, log);
                }
            }
        } else if let Some(walker) = &self.arch_walker {
            if let Some(regs) = inv.kernel_regs {
                walker.walk(&regs, MAX_BACKTRACE, &mut |addr| {
                    self.print_addr(addr, flags, false, log)
                });
            }
        } else if let Some(regs) = inv.kernel_regs {
            self.print_fallback(regs.sp, Some(&regs), flags, MAX_BACKTRACE, 0, log);
        }
    }

    fn print_user_frames(
        &self,
        inv: &mut ProbeInvocation,
        log: &mut LogGuard<'_>,
        flags: SymFlags,
    ) {
        let regs = self.recover_user_regs(inv);
        if regs.is_none() || !inv.has_user_memory {
            if flags.contains(SymFlags::SYMBOL) {
                let _ = writeln!(log, "<no user backtrace at {}>", inv.probe_point);
            } else {
                let _ = log.write_str("\n");
            }
            return;
        }

        if inv.kind == ProbeKind::UserReturn && flags.contains(SymFlags::FULL) {
            if let Some(addr) = inv.probe_address {
                let _ = log.write_str("Returning from: ");
                self.print_addr(addr, flags, true, log);
                let _ = log.write_str("Returning to  : ");
            }
        }
        let pc0 = self.user_pc(inv, 0).unwrap_or(0);
        self.print_addr(pc0, flags, true, log);

        if self.stepper.is_some() {
            for depth in 1..MAX_BACKTRACE {
                match self.user_pc(inv, depth) {
                    Some(pc) => self.print_addr(pc, flags, true, log),
                    // No user-space fallback exists.
                    None => break,
                }
            }
        } else if flags.contains(SymFlags::SYMBOL) {
            let _ = log.write_str("<no user backtrace support on arch>\n");
        } else {
            let _ = log.write_str("\n");
        }
    }

    /// Kernel backtrace through whichever platform fallback this build has.
    fn print_fallback(
        &self,
        sp: Address,
        regs: Option<&Registers>,
        flags: SymFlags,
        levels: usize,
        skip: usize,
        log: &mut LogGuard<'_>,
    ) {
        match &self.fallback {
            KernelFallback::TraceService(service) => {
                trace!("fallback kernel stacktrace");
                let mut skip = skip;
                let mut levels = levels;
                service.dump_stack(sp, &mut |addr, reliable| {
                    if skip > 0 {
                        skip -= 1;
                    } else if levels > 0 {
                        let flags = if reliable {
                            flags
                        } else {
                            flags | SymFlags::INEXACT
                        };
                        self.print_addr(addr, flags, false, log);
                        levels -= 1;
                    }
                });
            }
            KernelFallback::AddressList {
                saver,
                frame_pointers,
            } => {
                let regs = match regs {
                    Some(regs) => regs,
                    None => {
                        trace!("no fallback kernel stacktrace (giving up)");
                        self.print_addr(0, flags | SymFlags::INEXACT, false, log);
                        return;
                    }
                };
                trace!("fallback kernel stacktrace (saved addresses)");
                let mut entries = [0 as Address; MAX_BACKTRACE];
                let max = levels.min(MAX_BACKTRACE);
                let count = saver.save_addresses(regs, &mut entries[..max], skip);
                for &addr in entries.iter().take(count.min(max)) {
                    if addr == SAVED_ADDR_END {
                        break;
                    }
                    // With frame pointers the saved addresses can be
                    // (mostly) trusted, otherwise it is all guesswork.
                    let flags = if *frame_pointers {
                        flags
                    } else {
                        flags | SymFlags::INEXACT
                    };
                    self.print_addr(addr, flags, false, log);
                }
            }
            KernelFallback::Unavailable => {
                trace!("no fallback kernel stacktrace (giving up)");
                self.print_addr(0, flags | SymFlags::INEXACT, false, log);
            }
        }
    }

    fn print_addr(&self, addr: Address, flags: SymFlags, user: bool, log: &mut LogGuard<'_>) {
        let _ = self.symbols.write_addr(addr, flags, user, log);
    }
}
