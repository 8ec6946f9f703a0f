//! Software TLB: one slot per 4 KiB virtual page in each of four tables.
//!
//! A slot holds `phys_page ^ virt_page`, so a hit turns into a physical address with a single XOR
//! against the full linear address. Valid values always have the low 12 bits clear, which leaves
//! [`INVALID`] free as the "unmapped" sentinel.

use crate::AccessKind;

pub(crate) const INVALID: u32 = u32::MAX;

const PAGE_COUNT: usize = 1 << 20;

/// Maximum number of live pages tracked before an eviction sweep.
pub const MAX_LIVE_PAGES: usize = 2048;

/// Which slots of a page [`Tlb::insert`] fills besides the kernel read slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Perms {
    pub kernel_write: bool,
    pub user: bool,
    pub user_write: bool,
}

impl Perms {
    pub const ALL: Perms = Perms {
        kernel_write: true,
        user: true,
        user_write: true,
    };

    pub const KERNEL_READ_ONLY: Perms = Perms {
        kernel_write: false,
        user: false,
        user_write: false,
    };
}

pub(crate) struct Tlb {
    read_kernel: Box<[u32]>,
    write_kernel: Box<[u32]>,
    read_user: Box<[u32]>,
    write_user: Box<[u32]>,
    /// Page numbers with a kernel-read entry, in insertion order.
    live: Vec<u32>,
}

fn table() -> Box<[u32]> {
    vec![INVALID; PAGE_COUNT].into_boxed_slice()
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            read_kernel: table(),
            write_kernel: table(),
            read_user: table(),
            write_user: table(),
            live: Vec::with_capacity(MAX_LIVE_PAGES),
        }
    }

    #[inline]
    pub fn lookup(&self, linear: u32, access: AccessKind, user: bool) -> Option<u32> {
        let page = (linear >> 12) as usize;
        let entry = match (access, user) {
            (AccessKind::Read, false) => self.read_kernel[page],
            (AccessKind::Write, false) => self.write_kernel[page],
            (AccessKind::Read, true) => self.read_user[page],
            (AccessKind::Write, true) => self.write_user[page],
        };
        if entry == INVALID {
            None
        } else {
            Some(entry ^ linear)
        }
    }

    /// Installs a mapping for the page containing `linear`.
    ///
    /// Kernel and user write slots are filled independently, since CR0.WP=0 lets the kernel write
    /// through a read-only entry. A write slot never exists without its read slot. Returns `true`
    /// when the live list overflowed and was swept.
    pub fn insert(&mut self, linear: u32, frame: u32, perms: Perms) -> bool {
        let page = linear >> 12;
        let idx = page as usize;
        let mut swept = false;
        if self.read_kernel[idx] == INVALID {
            if self.live.len() >= MAX_LIVE_PAGES {
                // Keep the page just below the new one: instruction fetches straddling a page
                // boundary need both halves resident.
                self.evict_all_but(page.wrapping_sub(1) & 0xF_FFFF);
                swept = true;
            }
            self.live.push(page);
        }

        let value = (frame ^ linear) & 0xFFFF_F000;
        self.read_kernel[idx] = value;
        self.write_kernel[idx] = if perms.kernel_write { value } else { INVALID };
        if perms.user {
            self.read_user[idx] = value;
            self.write_user[idx] = if perms.user_write { value } else { INVALID };
        } else {
            self.read_user[idx] = INVALID;
            self.write_user[idx] = INVALID;
        }
        swept
    }

    /// Drops every slot for one page. The live list keeps the stale number; clearing it again on
    /// the next sweep is harmless.
    pub fn flush_page(&mut self, linear: u32) {
        self.clear_slot((linear >> 12) as usize);
    }

    pub fn flush_all(&mut self) {
        for i in 0..self.live.len() {
            let page = self.live[i];
            self.clear_slot(page as usize);
        }
        self.live.clear();
    }

    fn evict_all_but(&mut self, keep: u32) {
        let live = std::mem::take(&mut self.live);
        let mut kept = Vec::with_capacity(MAX_LIVE_PAGES);
        for page in live {
            if page == keep {
                kept.push(page);
            } else {
                self.clear_slot(page as usize);
            }
        }
        self.live = kept;
    }

    fn clear_slot(&mut self, idx: usize) {
        self.read_kernel[idx] = INVALID;
        self.write_kernel[idx] = INVALID;
        self.read_user[idx] = INVALID;
        self.write_user[idx] = INVALID;
    }

    pub fn live_pages(&self) -> usize {
        self.live.len()
    }
}
