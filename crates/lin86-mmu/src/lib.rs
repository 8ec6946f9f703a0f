//! 32-bit x86 address translation with a software TLB.
//!
//! [`Mmu`] owns the paging control registers (CR0, CR2, CR3, CR4) and a direct-mapped TLB with one
//! slot per virtual page in four tables (kernel/user × read/write). Misses walk the two-level page
//! tables in guest physical memory through a [`MemoryBus`].

mod fault;
mod tlb;
mod walk;

pub use fault::{PageFault, PF_ERR_PRESENT, PF_ERR_USER, PF_ERR_WRITE};
pub use tlb::MAX_LIVE_PAGES;

use lin86_mem::MemoryBus;
use tlb::{Perms, Tlb};

#[cfg(test)]
mod tests;

pub const CR0_PE: u32 = 1 << 0;
pub const CR0_MP: u32 = 1 << 1;
pub const CR0_EM: u32 = 1 << 2;
pub const CR0_TS: u32 = 1 << 3;
pub const CR0_ET: u32 = 1 << 4;
pub const CR0_NE: u32 = 1 << 5;
pub const CR0_WP: u32 = 1 << 16;
pub const CR0_AM: u32 = 1 << 18;
pub const CR0_NW: u32 = 1 << 29;
pub const CR0_CD: u32 = 1 << 30;
pub const CR0_PG: u32 = 1 << 31;

pub const CR4_TSD: u32 = 1 << 2;
pub const CR4_DE: u32 = 1 << 3;
pub const CR4_PSE: u32 = 1 << 4;
pub const CR4_PGE: u32 = 1 << 7;

/// CR4 bits that can be set; everything else reads back as zero.
const CR4_SUPPORTED: u32 = CR4_TSD | CR4_DE | CR4_PSE | CR4_PGE;

/// Access kind for translation. Instruction fetches translate as reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmuStats {
    pub page_walks: u64,
    pub tlb_hits: u64,
    pub full_flushes: u64,
    pub page_flushes: u64,
    pub eviction_sweeps: u64,
}

pub struct Mmu {
    cr0: u32,
    cr2: u32,
    cr3: u32,
    cr4: u32,
    tlb: Tlb,
    stats: MmuStats,
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mmu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmu")
            .field("cr0", &format_args!("{:#010x}", self.cr0))
            .field("cr2", &format_args!("{:#010x}", self.cr2))
            .field("cr3", &format_args!("{:#010x}", self.cr3))
            .field("cr4", &format_args!("{:#010x}", self.cr4))
            .field("live_pages", &self.tlb.live_pages())
            .finish()
    }
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            cr0: CR0_ET,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            tlb: Tlb::new(),
            stats: MmuStats::default(),
        }
    }

    pub fn cr0(&self) -> u32 {
        self.cr0
    }

    pub fn cr2(&self) -> u32 {
        self.cr2
    }

    pub fn cr3(&self) -> u32 {
        self.cr3
    }

    pub fn cr4(&self) -> u32 {
        self.cr4
    }

    #[inline]
    pub fn paging_enabled(&self) -> bool {
        self.cr0 & CR0_PG != 0
    }

    /// Writes CR0. Toggling PG, or WP while paging, invalidates every cached translation.
    pub fn set_cr0(&mut self, value: u32) {
        let value = value | CR0_ET;
        let changed = self.cr0 ^ value;
        self.cr0 = value;
        if changed & CR0_PG != 0 || (changed & CR0_WP != 0 && self.paging_enabled()) {
            tracing::debug!(cr0 = format_args!("{value:#010x}"), "paging mode change");
            self.flush_all();
        }
    }

    pub fn set_cr2(&mut self, value: u32) {
        self.cr2 = value;
    }

    /// Writes CR3. Every write flushes the TLB, even when the value is unchanged.
    pub fn set_cr3(&mut self, value: u32) {
        self.cr3 = value;
        self.flush_all();
    }

    pub fn set_cr4(&mut self, value: u32) {
        let value = value & CR4_SUPPORTED;
        let changed = self.cr4 ^ value;
        self.cr4 = value;
        if changed & (CR4_PSE | CR4_PGE) != 0 {
            self.flush_all();
        }
    }

    /// INVLPG: drop the cached translation for the page containing `linear`.
    pub fn invlpg(&mut self, linear: u32) {
        self.stats.page_flushes += 1;
        self.tlb.flush_page(linear);
    }

    pub fn flush_all(&mut self) {
        tracing::trace!(live = self.tlb.live_pages(), "tlb flush");
        self.stats.full_flushes += 1;
        self.tlb.flush_all();
    }

    pub fn stats(&self) -> MmuStats {
        self.stats
    }

    /// Number of pages that currently hold a TLB entry.
    pub fn live_pages(&self) -> usize {
        self.tlb.live_pages()
    }

    /// TLB-only lookup. Returns `None` on a miss without touching guest memory.
    #[inline]
    pub fn lookup(&self, linear: u32, access: AccessKind, user: bool) -> Option<u32> {
        self.tlb.lookup(linear, access, user)
    }

    /// Translates a linear address, filling the TLB on a miss.
    ///
    /// On failure CR2 holds `linear` and the returned fault carries the #PF error code.
    pub fn translate(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        access: AccessKind,
        user: bool,
    ) -> Result<u32, PageFault> {
        if let Some(paddr) = self.tlb.lookup(linear, access, user) {
            self.stats.tlb_hits += 1;
            return Ok(paddr);
        }
        self.fill(bus, linear, access, user)
    }

    /// Slow path of [`Mmu::translate`]: walk (or identity-map) and install the result.
    pub fn fill(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        access: AccessKind,
        user: bool,
    ) -> Result<u32, PageFault> {
        if !self.paging_enabled() {
            self.install(linear, linear & 0xFFFF_F000, Perms::ALL);
            return Ok(linear);
        }

        self.stats.page_walks += 1;
        match walk::walk(bus, linear, access, user, self.cr0, self.cr3, self.cr4) {
            Ok(leaf) => {
                // The write tables are only filled once the page is dirty so the first write
                // after a read-only fill walks again and sets D.
                let kernel_writable = leaf.writable || self.cr0 & CR0_WP == 0;
                let perms = Perms {
                    kernel_write: leaf.dirty && kernel_writable,
                    user: leaf.user,
                    user_write: leaf.dirty && leaf.writable && leaf.user,
                };
                self.install(linear, leaf.frame, perms);
                Ok(leaf.frame | (linear & 0xFFF))
            }
            Err(pf) => {
                tracing::trace!(
                    addr = format_args!("{linear:#010x}"),
                    error_code = pf.error_code,
                    "page fault"
                );
                self.cr2 = linear;
                Err(pf)
            }
        }
    }

    fn install(&mut self, linear: u32, frame: u32, perms: Perms) {
        if self.tlb.insert(linear, frame, perms) {
            self.stats.eviction_sweeps += 1;
        }
    }
}
