use super::*;
use crate::walk::{PDE_PS, PTE_A, PTE_D, PTE_P, PTE_RW, PTE_US};

/// Flat test RAM that counts page-table traffic.
struct CountingBus {
    mem: Vec<u8>,
    reads: usize,
    writes: usize,
}

impl CountingBus {
    fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            reads: 0,
            writes: 0,
        }
    }

    fn poke(&mut self, paddr: u32, val: u32) {
        let p = paddr as usize;
        self.mem[p..p + 4].copy_from_slice(&val.to_le_bytes());
    }

    fn peek(&self, paddr: u32) -> u32 {
        let p = paddr as usize;
        u32::from_le_bytes(self.mem[p..p + 4].try_into().unwrap())
    }
}

impl MemoryBus for CountingBus {
    fn read_physical(&mut self, paddr: u32, buf: &mut [u8]) {
        self.reads += 1;
        let p = paddr as usize;
        buf.copy_from_slice(&self.mem[p..p + buf.len()]);
    }

    fn write_physical(&mut self, paddr: u32, buf: &[u8]) {
        self.writes += 1;
        let p = paddr as usize;
        self.mem[p..p + buf.len()].copy_from_slice(buf);
    }
}

const PD: u32 = 0x1000;
const PT: u32 = 0x2000;

/// Maps `linear` to `frame` through the page table at `PT`.
fn map(bus: &mut CountingBus, linear: u32, frame: u32, flags: u32) {
    bus.poke(PD + ((linear >> 22) << 2), PT | PTE_P | PTE_RW | PTE_US);
    bus.poke(PT + (((linear >> 12) & 0x3FF) << 2), frame | flags);
}

fn paged_mmu() -> Mmu {
    let mut mmu = Mmu::new();
    mmu.set_cr3(PD);
    mmu.set_cr0(CR0_PE | CR0_PG);
    mmu
}

#[test]
fn no_paging_is_identity() {
    let mut bus = CountingBus::new(0x1000);
    let mut mmu = Mmu::new();
    for addr in [0u32, 0x1234, 0xFFFF_FFFF] {
        assert_eq!(mmu.translate(&mut bus, addr, AccessKind::Write, true), Ok(addr));
    }
    assert_eq!(bus.reads, 0);
    assert_eq!(mmu.stats().page_walks, 0);
    // Identity mappings are cached like any other.
    assert_eq!(mmu.lookup(0x1234, AccessKind::Read, false), Some(0x1234));
}

#[test]
fn second_translate_hits_tlb() {
    let mut bus = CountingBus::new(0x10_000);
    map(&mut bus, 0x0040_1000, 0x5000, PTE_P | PTE_RW);
    let mut mmu = paged_mmu();

    let first = mmu.translate(&mut bus, 0x0040_1234, AccessKind::Read, false);
    assert_eq!(first, Ok(0x5234));
    assert_eq!(mmu.stats().page_walks, 1);
    let reads = bus.reads;

    let second = mmu.translate(&mut bus, 0x0040_1234, AccessKind::Read, false);
    assert_eq!(second, first);
    assert_eq!(mmu.stats().page_walks, 1);
    assert_eq!(mmu.stats().tlb_hits, 1);
    assert_eq!(bus.reads, reads);
}

#[test]
fn sets_accessed_then_dirty_on_first_write() {
    let mut bus = CountingBus::new(0x10_000);
    let linear = 0x0040_1000;
    map(&mut bus, linear, 0x5000, PTE_P | PTE_RW);
    let pte_addr = PT + (((linear >> 12) & 0x3FF) << 2);
    let mut mmu = paged_mmu();

    mmu.translate(&mut bus, linear, AccessKind::Read, false).unwrap();
    assert_eq!(bus.peek(pte_addr) & (PTE_A | PTE_D), PTE_A);
    assert_eq!(bus.peek(PD + ((linear >> 22) << 2)) & PTE_A, PTE_A);

    // The read fill left the write slot empty, so the first write walks again.
    mmu.translate(&mut bus, linear, AccessKind::Write, false).unwrap();
    assert_eq!(mmu.stats().page_walks, 2);
    assert_eq!(bus.peek(pte_addr) & (PTE_A | PTE_D), PTE_A | PTE_D);

    let writes = bus.writes;
    mmu.translate(&mut bus, linear, AccessKind::Write, false).unwrap();
    assert_eq!(mmu.stats().page_walks, 2);
    assert_eq!(bus.writes, writes);
}

#[test]
fn already_set_bits_are_not_written_back() {
    let mut bus = CountingBus::new(0x10_000);
    map(&mut bus, 0x0040_1000, 0x5000, PTE_P | PTE_RW | PTE_A | PTE_D);
    let pde_addr = PD + (0x0040_1000u32 >> 22 << 2);
    let pde = bus.peek(pde_addr);
    bus.poke(pde_addr, pde | PTE_A);

    let mut mmu = paged_mmu();
    mmu.translate(&mut bus, 0x0040_1000, AccessKind::Write, false).unwrap();
    assert_eq!(bus.writes, 0);
}

#[test]
fn user_write_to_read_only_page_faults() {
    let mut bus = CountingBus::new(0x10_000);
    map(&mut bus, 0x0804_8000, 0x6000, PTE_P | PTE_US);
    let mut mmu = paged_mmu();

    let err = mmu
        .translate(&mut bus, 0x0804_8010, AccessKind::Write, true)
        .unwrap_err();
    assert_eq!(err.addr, 0x0804_8010);
    assert_eq!(err.error_code, PF_ERR_PRESENT | PF_ERR_WRITE | PF_ERR_USER);
    assert_eq!(mmu.cr2(), 0x0804_8010);

    // Reads of the same page are fine.
    assert_eq!(
        mmu.translate(&mut bus, 0x0804_8010, AccessKind::Read, true),
        Ok(0x6010)
    );
}

#[test]
fn supervisor_write_to_read_only_page_depends_on_wp() {
    let mut bus = CountingBus::new(0x10_000);
    map(&mut bus, 0x0040_0000, 0x7000, PTE_P);
    let mut mmu = paged_mmu();

    assert_eq!(
        mmu.translate(&mut bus, 0x0040_0004, AccessKind::Write, false),
        Ok(0x7004)
    );
    // WP=0: the kernel write slot is cached, so the next write is a TLB hit.
    assert_eq!(mmu.lookup(0x0040_0004, AccessKind::Write, false), Some(0x7004));
    let walks = mmu.stats().page_walks;
    assert_eq!(
        mmu.translate(&mut bus, 0x0040_0008, AccessKind::Write, false),
        Ok(0x7008)
    );
    assert_eq!(mmu.stats().page_walks, walks);

    mmu.set_cr0(mmu.cr0() | CR0_WP);
    let err = mmu
        .translate(&mut bus, 0x0040_0004, AccessKind::Write, false)
        .unwrap_err();
    assert_eq!(err.error_code, PF_ERR_PRESENT | PF_ERR_WRITE);
}

#[test]
fn kernel_write_slot_on_read_only_user_page_stays_out_of_user_table() {
    let mut bus = CountingBus::new(0x10_000);
    map(&mut bus, 0x0040_0000, 0x7000, PTE_P | PTE_US);
    let mut mmu = paged_mmu();

    mmu.translate(&mut bus, 0x0040_0000, AccessKind::Write, false).unwrap();
    assert_eq!(mmu.lookup(0x0040_0000, AccessKind::Read, true), Some(0x7000));
    assert_eq!(mmu.lookup(0x0040_0000, AccessKind::Write, true), None);
    let err = mmu
        .translate(&mut bus, 0x0040_0000, AccessKind::Write, true)
        .unwrap_err();
    assert_eq!(err.error_code, PF_ERR_PRESENT | PF_ERR_WRITE | PF_ERR_USER);
}

#[test]
fn user_access_to_supervisor_page_faults() {
    let mut bus = CountingBus::new(0x10_000);
    map(&mut bus, 0xC000_0000, 0x8000, PTE_P | PTE_RW);
    let mut mmu = paged_mmu();

    let err = mmu
        .translate(&mut bus, 0xC000_0000, AccessKind::Read, true)
        .unwrap_err();
    assert_eq!(err.error_code, PF_ERR_PRESENT | PF_ERR_USER);
    assert!(mmu.translate(&mut bus, 0xC000_0000, AccessKind::Read, false).is_ok());
}

#[test]
fn not_present_page_faults_with_clear_present_bit() {
    let mut bus = CountingBus::new(0x10_000);
    let mut mmu = paged_mmu();
    let err = mmu
        .translate(&mut bus, 0x1234_5678, AccessKind::Write, false)
        .unwrap_err();
    assert_eq!(err.error_code, PF_ERR_WRITE);
    assert_eq!(mmu.cr2(), 0x1234_5678);
}

#[test]
fn invlpg_and_cr3_reload_force_a_walk() {
    let mut bus = CountingBus::new(0x10_000);
    map(&mut bus, 0x0040_1000, 0x5000, PTE_P | PTE_RW);
    let mut mmu = paged_mmu();

    mmu.translate(&mut bus, 0x0040_1000, AccessKind::Read, false).unwrap();
    map(&mut bus, 0x0040_1000, 0x9000, PTE_P | PTE_RW);
    assert_eq!(
        mmu.translate(&mut bus, 0x0040_1000, AccessKind::Read, false),
        Ok(0x5000)
    );

    mmu.invlpg(0x0040_1FFF);
    assert_eq!(
        mmu.translate(&mut bus, 0x0040_1000, AccessKind::Read, false),
        Ok(0x9000)
    );

    map(&mut bus, 0x0040_1000, 0xA000, PTE_P | PTE_RW);
    mmu.set_cr3(PD);
    assert_eq!(
        mmu.translate(&mut bus, 0x0040_1000, AccessKind::Read, false),
        Ok(0xA000)
    );
    assert_eq!(mmu.stats().page_walks, 3);
}

#[test]
fn toggling_paging_flushes() {
    let mut bus = CountingBus::new(0x10_000);
    map(&mut bus, 0x0000_3000, 0x5000, PTE_P | PTE_RW);
    let mut mmu = Mmu::new();
    mmu.set_cr3(PD);

    assert_eq!(mmu.translate(&mut bus, 0x3000, AccessKind::Read, false), Ok(0x3000));
    mmu.set_cr0(CR0_PE | CR0_PG);
    assert_eq!(mmu.translate(&mut bus, 0x3000, AccessKind::Read, false), Ok(0x5000));
    mmu.set_cr0(CR0_PE);
    assert_eq!(mmu.translate(&mut bus, 0x3000, AccessKind::Read, false), Ok(0x3000));
}

#[test]
fn large_pages_need_pse() {
    let mut bus = CountingBus::new(0x10_000);
    bus.poke(PD + (0x0080_0000u32 >> 22 << 2), 0x0040_0000 | PDE_PS | PTE_P | PTE_RW);
    let mut mmu = paged_mmu();

    mmu.set_cr4(CR4_PSE);
    assert_eq!(
        mmu.translate(&mut bus, 0x0081_2345, AccessKind::Write, false),
        Ok(0x0041_2345)
    );
    let pde = bus.peek(PD + (0x0080_0000u32 >> 22 << 2));
    assert_eq!(pde & (PTE_A | PTE_D), PTE_A | PTE_D);
}

#[test]
fn cr4_ignores_unsupported_bits() {
    let mut mmu = Mmu::new();
    mmu.set_cr4(0xFFFF_FFFF);
    assert_eq!(mmu.cr4(), CR4_TSD | CR4_DE | CR4_PSE | CR4_PGE);
}
