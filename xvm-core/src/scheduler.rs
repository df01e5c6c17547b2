//! Cooperative timeslice scheduler
//!
//! Single thread of control. In multi mode the CPU rotates round-robin
//! across active, running slots; the current slot keeps it until its
//! timeslice expires, it stops running, or it is paused. Single mode pins
//! one slot and ignores timeslices (used by blocking calls).
//!
//! ```text
//! run(budget)
//!   └─ loop
//!        ├─ nothing runnable?           → Idle
//!        ├─ multi: slice over / stopped / paused → next slot
//!        ├─ paused before deadline?     → skip
//!        ├─ execute one instruction     → host call / fault / stack base
//!        └─ budget spent?               → BudgetExhausted
//! ```

use crate::SlotIndex;
use crate::engine::Effect;
use crate::error::{VmError, VmResult};
use crate::vm::VirtualMachine;
use serde::{Deserialize, Serialize};

/// Scheduling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadMode {
    /// Round-robin across every running script
    Multi,
    /// Only the current slot runs
    Single,
}

/// How long [`VirtualMachine::run`] may execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Budget {
    /// Wall-clock milliseconds
    Millis(u64),
    /// Until nothing runs or a stack-base return fires
    Infinite,
}

/// Why the run loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// No script is active and running (single mode: the pinned one)
    Idle,
    /// The time budget was used up
    BudgetExhausted,
    /// A blocking call's function returned
    StackBaseReturned,
}

impl VirtualMachine {
    pub fn mode(&self) -> ThreadMode {
        self.mode
    }

    /// Slot that currently owns the CPU
    pub fn current_slot(&self) -> SlotIndex {
        self.current
    }

    fn is_runnable(&self, slot: SlotIndex) -> bool {
        matches!(self.slots.get(slot), Some(Some(script)) if script.running)
    }

    fn anything_runnable(&self) -> bool {
        match self.mode {
            ThreadMode::Multi => self.slots.iter().flatten().any(|s| s.running),
            ThreadMode::Single => self.is_runnable(self.current),
        }
    }

    /// Whether the current slot must give up the CPU at `now`
    fn should_switch(&self, now: u64) -> bool {
        match self.slots.get(self.current) {
            Some(Some(script)) => {
                !script.running
                    || now > self.active_since.saturating_add(script.timeslice_ms)
                    || (script.paused && now < script.pause_end)
            }
            _ => true,
        }
    }

    /// Round-robin to the next runnable slot after the current one
    fn switch_slot(&mut self, now: u64) {
        let count = self.slots.len();
        let next = (1..=count)
            .map(|offset| (self.current + offset) % count)
            .find(|&slot| self.is_runnable(slot));
        if let Some(next) = next {
            if next != self.current {
                tracing::debug!(from = self.current, to = next, "context switch");
            }
            self.current = next;
            self.active_since = now;
        }
    }

    /// Execute scripts until the budget is spent, nothing runs, or a
    /// blocking call returns.
    ///
    /// A fault stops the faulting script and is returned; other scripts
    /// keep their state.
    pub fn run(&mut self, budget: Budget) -> VmResult<RunOutcome> {
        let start = self.clock.now_ms();

        loop {
            if !self.anything_runnable() {
                return Ok(RunOutcome::Idle);
            }

            let now = self.clock.now_ms();
            if self.mode == ThreadMode::Multi && self.should_switch(now) {
                self.switch_slot(now);
            }

            let slot = self.current;
            let waiting = match self.slots.get_mut(slot) {
                Some(Some(script)) if script.paused => {
                    if now >= script.pause_end {
                        script.paused = false;
                        tracing::debug!(slot, "script resumed");
                        false
                    } else {
                        true
                    }
                }
                _ => false,
            };

            if !waiting && self.execute_slot(slot, now)? == Effect::StackBaseReturn {
                return Ok(RunOutcome::StackBaseReturned);
            }

            if let Budget::Millis(ms) = budget
                && now.saturating_sub(start) >= ms
            {
                return Ok(RunOutcome::BudgetExhausted);
            }
        }
    }

    /// Execute exactly one instruction of `slot`, ignoring scheduling.
    ///
    /// Host calls made by the instruction are performed. Returns true when
    /// the instruction was a RET out of a blocking call.
    pub fn step(&mut self, slot: SlotIndex) -> VmResult<bool> {
        self.script(slot)?;
        let now = self.clock.now_ms();
        Ok(self.execute_slot(slot, now)? == Effect::StackBaseReturn)
    }

    /// One instruction plus its host call; never returns `CallHost`
    fn execute_slot(&mut self, slot: SlotIndex, now: u64) -> VmResult<Effect> {
        let script = self.script_mut(slot)?;
        let instr = script.pc;
        if tracing::enabled!(tracing::Level::TRACE)
            && let Ok(text) = script.instruction(instr).map(ToString::to_string)
        {
            tracing::trace!(slot, pc = instr, instr = %text, "execute");
        }

        let effect = match script.execute(now) {
            Ok(effect) => effect,
            Err(fault) => {
                script.running = false;
                tracing::warn!(slot, instr, %fault, "script faulted");
                return Err(VmError::Fault { slot, instr, fault });
            }
        };

        match effect {
            Effect::CallHost(name) => {
                match self.host_apis.lookup(&name, slot) {
                    Some(function) => function(self, slot)?,
                    None => tracing::trace!(slot, name = %name, "unresolved host call skipped"),
                }
                Ok(Effect::Continue)
            }
            other => Ok(other),
        }
    }
}
