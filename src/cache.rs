// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The per-firing unwind cache: a depth-indexed memo of resolved program
//! counters, filled lazily and monotonically.
//!
//! Front ends request depths in increasing order, but symbol resolution can
//! trigger nested queries in arbitrary order; memoizing every computed depth
//! makes repeated queries O(1) and keeps one firing deterministic.

use crate::regs::Address;
use crate::MAX_BACKTRACE;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CacheState {
    /// Fresh cache, no access yet.
    Uninitialized,
    /// Some depths are filled; deeper ones may still be computable.
    Partial,
    /// A terminating pc was produced; no depth past `depth` will ever exist.
    Finished,
}

/// One stepper result handed to [`UnwindCache::get`]: the pc resolved for a
/// depth, and whether the unwind provably ends at this entry.
#[derive(Copy, Clone, Debug)]
pub struct StepResult {
    pub pc: Address,
    pub terminal: bool,
}

pub struct UnwindCache {
    state: CacheState,
    depth: usize,
    pc: [Address; MAX_BACKTRACE],
}

impl Default for UnwindCache {
    fn default() -> UnwindCache {
        UnwindCache::new()
    }
}

impl UnwindCache {
    pub fn new() -> UnwindCache {
        UnwindCache {
            state: CacheState::Uninitialized,
            depth: 0,
            pc: [0; MAX_BACKTRACE],
        }
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    /// Count of valid cached entries.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Forget everything; the next access recomputes from scratch. Used when
    /// the live unwind context backing this cache has been consumed for
    /// something else (user-register recovery).
    pub fn invalidate(&mut self) {
        self.state = CacheState::Uninitialized;
        self.depth = 0;
    }

    /// Return the pc at `depth`, driving `step` for any depths not yet
    /// filled. `step` is invoked with strictly increasing depths, each
    /// exactly once per firing.
    ///
    /// `None` means the unwind does not reach `depth`: either the depth
    /// ceiling, or a terminating pc was produced first. A memoized zero pc
    /// also reads back as `None`.
    pub fn get<F>(&mut self, depth: usize, mut step: F) -> Option<Address>
    where
        F: FnMut(usize) -> StepResult,
    {
        if self.state == CacheState::Uninitialized {
            self.depth = 0;
            self.state = CacheState::Partial;
        }

        if depth >= MAX_BACKTRACE {
            return None;
        }

        // Memoized hit.
        if depth < self.depth {
            return nonzero(self.pc[depth]);
        }
        if self.state == CacheState::Finished {
            return None; // unwind does not reach this far
        }

        // Advance the unwind to the required depth.
        while self.depth <= depth {
            let result = step(self.depth);
            self.pc[self.depth] = result.pc;
            self.depth += 1;
            if result.terminal {
                self.state = CacheState::Finished;
                break;
            }
        }

        if depth < self.depth {
            nonzero(self.pc[depth])
        } else {
            None
        }
    }
}

fn nonzero(pc: Address) -> Option<Address> {
    if pc == 0 {
        None
    } else {
        Some(pc)
    }
}
