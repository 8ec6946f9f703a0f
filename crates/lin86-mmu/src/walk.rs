//! 32-bit two-level page table walk (4 KiB pages, and 4 MiB pages when `CR4.PSE=1`).

use lin86_mem::MemoryBus;

use crate::{AccessKind, PageFault, CR0_WP, CR4_PSE};

pub(crate) const PTE_P: u32 = 1 << 0;
pub(crate) const PTE_RW: u32 = 1 << 1;
pub(crate) const PTE_US: u32 = 1 << 2;
pub(crate) const PTE_A: u32 = 1 << 5;
pub(crate) const PTE_D: u32 = 1 << 6;
pub(crate) const PDE_PS: u32 = 1 << 7;

const CR3_PD_MASK: u32 = 0xFFFF_F000;
const ADDR_MASK_4K: u32 = 0xFFFF_F000;
const ADDR_MASK_4M: u32 = 0xFFC0_0000;

/// Outcome of a successful walk for one 4 KiB page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Leaf {
    /// Physical base of the 4 KiB frame holding the address.
    pub frame: u32,
    /// Composite PDE/PTE write permission.
    pub writable: bool,
    /// Composite PDE/PTE user permission.
    pub user: bool,
    /// Dirty bit of the leaf entry after this access.
    pub dirty: bool,
}

/// Walks the page tables rooted at `cr3` for `linear`.
///
/// Accessed bits are set on the way down and the dirty bit on writes; an entry is only written
/// back when one of those bits actually changes.
pub(crate) fn walk(
    bus: &mut impl MemoryBus,
    linear: u32,
    access: AccessKind,
    user: bool,
    cr0: u32,
    cr3: u32,
    cr4: u32,
) -> Result<Leaf, PageFault> {
    let is_write = access == AccessKind::Write;

    let pde_addr = (cr3 & CR3_PD_MASK) | ((linear >> 22) << 2);
    let pde = bus.read_u32(pde_addr);
    if pde & PTE_P == 0 {
        return Err(PageFault::not_present(linear, access, user));
    }

    if pde & PDE_PS != 0 && cr4 & CR4_PSE != 0 {
        check_permissions(linear, access, user, pde, cr0)?;
        let new_pde = accessed_dirty(pde, is_write);
        if new_pde != pde {
            bus.write_u32(pde_addr, new_pde);
        }
        return Ok(Leaf {
            frame: (pde & ADDR_MASK_4M) | (linear & 0x003F_F000),
            writable: pde & PTE_RW != 0,
            user: pde & PTE_US != 0,
            dirty: new_pde & PTE_D != 0,
        });
    }

    let pte_addr = (pde & ADDR_MASK_4K) | (((linear >> 12) & 0x3FF) << 2);
    let pte = bus.read_u32(pte_addr);
    if pte & PTE_P == 0 {
        return Err(PageFault::not_present(linear, access, user));
    }

    let combined = pde & pte;
    check_permissions(linear, access, user, combined, cr0)?;

    if pde & PTE_A == 0 {
        bus.write_u32(pde_addr, pde | PTE_A);
    }
    let new_pte = accessed_dirty(pte, is_write);
    if new_pte != pte {
        bus.write_u32(pte_addr, new_pte);
    }

    Ok(Leaf {
        frame: pte & ADDR_MASK_4K,
        writable: combined & PTE_RW != 0,
        user: combined & PTE_US != 0,
        dirty: new_pte & PTE_D != 0,
    })
}

fn check_permissions(
    linear: u32,
    access: AccessKind,
    user: bool,
    entry: u32,
    cr0: u32,
) -> Result<(), PageFault> {
    if user && entry & PTE_US == 0 {
        return Err(PageFault::protection(linear, access, user));
    }
    // Supervisor writes ignore RW unless CR0.WP is set.
    if access == AccessKind::Write && entry & PTE_RW == 0 && (user || cr0 & CR0_WP != 0) {
        return Err(PageFault::protection(linear, access, user));
    }
    Ok(())
}

fn accessed_dirty(entry: u32, is_write: bool) -> u32 {
    let mut new = entry | PTE_A;
    if is_write {
        new |= PTE_D;
    }
    new
}
