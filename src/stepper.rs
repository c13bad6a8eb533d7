// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The metadata-driven frame stepper seam and the live unwind context it
//! advances.

use thiserror::Error;
use tracing::trace;

use crate::regs::{Address, Domain, Registers};

/// Errors a [`FrameStepper`] can report while advancing one frame. All of
/// them degrade to a shorter trace; none is fatal to the firing.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("unwind context has not been started")]
    NotStarted,
    #[error("no frame information covers pc {pc:#x}")]
    NoFrameInfo { pc: Address },
    #[error("stack read failed at {addr:#x}")]
    BadStackRead { addr: Address },
    #[error("unwind made no progress at sp {sp:#x}")]
    NoProgress { sp: Address },
}

/// The primary, call-frame-metadata-driven stepper. One implementation is
/// selected when the unwinder is built; builds without one fall back to the
/// kernel-only walkers in [`fallback`][crate::fallback].
pub trait FrameStepper {
    /// Produce the initial frame record for an unwind.
    ///
    /// `regs == None` asks for the architecture-default synthesized frame
    /// (the stepper's own notion of "here"), which only frame-pointer
    /// architectures can provide; everywhere else this returns `None` and
    /// the unwind has no data at any depth.
    fn start(&self, regs: Option<&Registers>, domain: Domain) -> Option<Registers>;

    /// Advance `frame` by exactly one level of the call stack.
    fn advance(&self, frame: &mut Registers, domain: Domain) -> Result<(), StepError>;
}

/// Checks an address against an address space. External oracle; the stepper
/// output is gated on it before being cached.
pub trait AddressValidator {
    fn is_valid_read(&self, addr: Address, size: u64, domain: Domain) -> bool;
}

/// Live frame-tracking state for one domain of one firing.
///
/// The context is a small explicit state machine: `start` installs the
/// innermost frame, `advance` replaces it with its caller. It is only
/// meaningful while the owning cache is being advanced past its last filled
/// depth, and is stale once the cache is finished.
#[derive(Debug)]
pub struct UnwindContext {
    domain: Domain,
    depth: usize,
    frame: Option<Registers>,
}

impl UnwindContext {
    pub fn new(domain: Domain) -> UnwindContext {
        UnwindContext {
            domain,
            depth: 0,
            frame: None,
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Successful advances since the last `start`.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn frame(&self) -> Option<&Registers> {
        self.frame.as_ref()
    }

    /// Install the innermost frame and reset the step count.
    pub fn start(&mut self, frame: Registers) {
        self.frame = Some(frame);
        self.depth = 0;
    }

    /// Drop the tracked frame entirely.
    pub fn reset(&mut self) {
        self.frame = None;
        self.depth = 0;
    }

    /// Advance one frame with `stepper`, returning the caller's pc.
    pub fn advance(&mut self, stepper: &dyn FrameStepper) -> Result<Address, StepError> {
        let frame = self.frame.as_mut().ok_or(StepError::NotStarted)?;
        stepper.advance(frame, self.domain)?;
        self.depth += 1;
        trace!(
            depth = self.depth,
            pc = frame.pc,
            sp = frame.sp,
            "advanced one frame"
        );
        Ok(frame.pc)
    }
}
