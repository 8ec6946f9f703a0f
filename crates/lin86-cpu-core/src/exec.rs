//! The batch execution loop.

use crate::config::DEFAULT_SLICE_CYCLES;
use crate::cpu::Cpu;
use crate::exceptions::{EmulationError, Exception};
use crate::interp::Flow;

/// Why [`Cpu::execute`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The budget ran out or an instruction ended the batch early; call again.
    Continue,
    /// HLT with no deliverable interrupt.
    Halted,
    /// An instruction faulted. The fault is delivered at the start of the next call.
    FaultPending,
}

impl Cpu {
    /// Queues a hardware interrupt vector, delivered at the next boundary where IF is set.
    /// Hosts that install an [`crate::InterruptController`] do not need this.
    pub fn request_interrupt(&mut self, vector: u8) {
        self.state.pending_irq = Some(vector);
    }

    /// Samples the hardware interrupt inputs and delivers one interrupt if IF allows it.
    fn poll_interrupt(&mut self) -> Result<(), EmulationError> {
        if !self.state.interrupts_enabled() {
            return Ok(());
        }
        let vector = match self.state.pending_irq {
            Some(v) => v,
            None if self.irq_line.is_asserted() => match self.pic.as_mut() {
                Some(pic) => pic.get_pending_vector(),
                None => return Ok(()),
            },
            None => return Ok(()),
        };
        self.state.halted = false;
        match self.deliver(vector, false, None, true) {
            Ok(()) => {
                self.state.pending_irq = None;
                Ok(())
            }
            Err(fault) => {
                // The vector was already acknowledged; keep it until a handler can take it.
                self.state.pending_irq = Some(vector);
                self.deliver_fault(fault)
            }
        }
    }

    /// Runs instructions until `budget` cycles have retired, the CPU halts, or an instruction
    /// faults or ends the batch early.
    ///
    /// Interrupts are sampled at every instruction boundary. Callers that drive an external
    /// interrupt controller should update it between calls.
    pub fn execute(&mut self, budget: u64) -> Result<ExitStatus, EmulationError> {
        self.slice_end = self.cycles.saturating_add(budget);
        if let Some(fault) = self.pending_fault.take() {
            self.state.halted = false;
            self.deliver_fault(fault)?;
        }

        loop {
            if self.interrupt_shadow > 0 {
                self.interrupt_shadow -= 1;
            } else {
                self.poll_interrupt()?;
            }
            if self.state.halted {
                return Ok(ExitStatus::Halted);
            }
            if self.cycles >= self.slice_end {
                return Ok(ExitStatus::Continue);
            }

            match self.step() {
                Ok(Flow::Next) => self.cycles += 1,
                Ok(Flow::Halt) => {
                    self.cycles += 1;
                    return Ok(ExitStatus::Halted);
                }
                Ok(Flow::Yield) => {
                    self.cycles += 1;
                    return Ok(ExitStatus::Continue);
                }
                Err(fault) => {
                    self.state.eip = self.insn_start;
                    self.cycles += 1;
                    if let Exception::Unsupported(what) = fault {
                        tracing::warn!(
                            what,
                            eip = format_args!("{:#010x}", self.insn_start),
                            "aborting on unsupported operation"
                        );
                        return Err(EmulationError::Unsupported(what));
                    }
                    self.pending_fault = Some(fault);
                    return Ok(ExitStatus::FaultPending);
                }
            }
        }
    }

    /// Calls [`Cpu::execute`] in slices of [`DEFAULT_SLICE_CYCLES`] until the CPU halts or
    /// `max_cycles` more cycles have retired. A fault still pending when the budget runs out is
    /// delivered by the next call.
    pub fn run(&mut self, max_cycles: u64) -> Result<ExitStatus, EmulationError> {
        let limit = self.cycles.saturating_add(max_cycles);
        let mut status = ExitStatus::Continue;
        while self.cycles < limit {
            let slice = (limit - self.cycles).min(DEFAULT_SLICE_CYCLES);
            status = self.execute(slice)?;
            if status == ExitStatus::Halted {
                break;
            }
        }
        Ok(status)
    }
}
