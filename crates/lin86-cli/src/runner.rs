//! Slice loop and exit report.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use lin86_cpu_core::state::{EAX, EBP, EBX, ECX, EDI, EDX, ESI, ESP};
use lin86_cpu_core::{Cpu, EmulationError, ExitStatus, SegReg, DEFAULT_SLICE_CYCLES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// HLT with nothing left that could wake the CPU.
    Halted,
    CycleLimit,
    Aborted(EmulationError),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Halted => f.write_str("halted"),
            StopReason::CycleLimit => f.write_str("cycle limit reached"),
            StopReason::Aborted(err) => write!(f, "aborted: {err}"),
        }
    }
}

/// Runs slices of [`DEFAULT_SLICE_CYCLES`] until the guest halts, `max_cycles` is reached, or the
/// core reports a host-fatal error.
pub fn run(cpu: &mut Cpu, max_cycles: Option<u64>) -> StopReason {
    let limit = max_cycles.map_or(u64::MAX, |max| cpu.cycles().saturating_add(max));
    loop {
        let remaining = limit.saturating_sub(cpu.cycles());
        if remaining == 0 {
            return StopReason::CycleLimit;
        }
        match cpu.execute(remaining.min(DEFAULT_SLICE_CYCLES)) {
            Ok(ExitStatus::Halted) => {
                // The runner has no interrupt sources, so a halt is final even with IF set.
                if cpu.state.interrupts_enabled() {
                    tracing::info!("guest halted with interrupts enabled and no interrupt source");
                }
                return StopReason::Halted;
            }
            Ok(ExitStatus::Continue | ExitStatus::FaultPending) => {}
            Err(err) => return StopReason::Aborted(err),
        }
    }
}

/// Register dump printed when the runner exits.
pub struct Summary<'a> {
    pub cpu: &'a Cpu,
    pub reason: &'a StopReason,
    pub post_code: &'a Rc<Cell<Option<u8>>>,
}

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.cpu.state;
        let r = &s.regs;
        writeln!(f, "stop: {} after {} cycles", self.reason, self.cpu.cycles())?;
        writeln!(
            f,
            "eax={:08x} ebx={:08x} ecx={:08x} edx={:08x}",
            r[EAX], r[EBX], r[ECX], r[EDX]
        )?;
        writeln!(
            f,
            "esi={:08x} edi={:08x} ebp={:08x} esp={:08x}",
            r[ESI], r[EDI], r[EBP], r[ESP]
        )?;
        writeln!(
            f,
            "eip={:08x} eflags={:08x} cpl={} cs={:04x} ss={:04x} ds={:04x}",
            s.eip,
            s.get_eflags(),
            s.cpl,
            s.seg(SegReg::Cs).selector,
            s.seg(SegReg::Ss).selector,
            s.seg(SegReg::Ds).selector
        )?;
        let mmu = &self.cpu.mmu;
        let stats = mmu.stats();
        writeln!(
            f,
            "cr0={:08x} cr2={:08x} cr3={:08x} cr4={:08x} walks={} tlb_hits={}",
            mmu.cr0(),
            mmu.cr2(),
            mmu.cr3(),
            mmu.cr4(),
            stats.page_walks,
            stats.tlb_hits
        )?;
        match self.post_code.get() {
            Some(code) => write!(f, "post={code:02x}"),
            None => write!(f, "post=--"),
        }
    }
}
