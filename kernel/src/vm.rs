//! Sv39 page-table manager: three-level walk, map/unmap, fork's copy, and
//! user<->kernel memory transfers.

use crate::kalloc::KMEM;
use crate::lock::Spinlock;
use crate::memlayout::{PLIC, TRAMPOLINE, TRAPFRAME, UART0, VIRTIO0};
use crate::page::Page;
use crate::riscv::{pgrounddown, pgroundup, px, Pte, PteFlags, MAXVA, PGSIZE};

#[derive(Debug, PartialEq, Eq)]
pub enum VmError {
    OutOfMemory,
    BadAddress,
}

/// An owned Sv39 page table: the root page plus, transitively, every
/// interior table reachable from it. Dropping a `PageTable` does not free
/// its pages automatically (freeing user memory needs to know how much of
/// it is in use) — callers must call `free_user`/`free_interior_only`.
pub struct PageTable {
    root: *mut [Pte; 512],
}

// SAFETY: a `PageTable` is moved around like any other owned heap structure;
// the pages it points to are accessed only through `&mut self` methods or
// while the owning process's lock is held.
unsafe impl Send for PageTable {}

impl PageTable {
    /// Allocates a fresh, empty (all-invalid) root table.
    pub fn new() -> Result<Self, VmError> {
        let mut page = KMEM.alloc().ok_or(VmError::OutOfMemory)?;
        page.zero();
        let root = page.into_usize() as *mut [Pte; 512];
        Ok(PageTable { root })
    }

    pub fn satp(&self) -> usize {
        crate::riscv::make_satp(self.root as usize)
    }

    fn root_table(&self) -> &[Pte; 512] {
        unsafe { &*self.root }
    }

    fn root_table_mut(&mut self) -> &mut [Pte; 512] {
        unsafe { &mut *self.root }
    }

    /// Walks the three-level tree to the leaf PTE for `va`, allocating
    /// interior tables on the way down if `alloc` is set.
    ///
    /// Returns `None` if `va` is out of range, or if `alloc` was requested
    /// and an allocation failed partway down (any tables already allocated
    /// in that case remain linked in and will be freed when this page table
    /// itself is freed).
    fn walk(&mut self, va: usize, alloc: bool) -> Option<*mut Pte> {
        assert!(va < MAXVA, "walk: va out of range");
        let mut table = self.root;
        for level in (1..=2).rev() {
            let pte = unsafe { &mut (*table)[px(level, va)] };
            if pte.is_valid() {
                table = (pte.pa()) as *mut [Pte; 512];
            } else {
                if !alloc {
                    return None;
                }
                let mut page = KMEM.alloc()?;
                page.zero();
                let child = page.into_usize();
                *pte = Pte::new(child, PteFlags::V);
                table = child as *mut [Pte; 512];
            }
        }
        Some(unsafe { &mut (*table)[px(0, va)] as *mut Pte })
    }

    fn walk_const(&self, va: usize) -> Option<Pte> {
        assert!(va < MAXVA, "walk: va out of range");
        let mut table: *const [Pte; 512] = self.root;
        for level in (1..=2).rev() {
            let pte = unsafe { (*table)[px(level, va)] };
            if !pte.is_valid() {
                return None;
            }
            table = pte.pa() as *const [Pte; 512];
        }
        Some(unsafe { (*table)[px(0, va)] })
    }

    /// Translates `va` to a physical address, requiring a valid, user
    /// (`U`-bit set) leaf mapping.
    pub fn walkaddr(&self, va: usize) -> Option<usize> {
        let pte = self.walk_const(va)?;
        if !pte.is_leaf() || !pte.flags().contains(PteFlags::U) {
            return None;
        }
        Some(pte.pa())
    }

    /// Maps `[va, va+size)` to `[pa, pa+size)` with the given permissions.
    /// `va` and `size` must be page-aligned; `size` must be nonzero.
    /// Remapping an already-valid leaf is a fatal invariant violation.
    pub fn mappages(&mut self, va: usize, size: usize, pa: usize, perm: PteFlags) -> Result<(), VmError> {
        assert_eq!(va % PGSIZE, 0, "mappages: va not aligned");
        assert_eq!(size % PGSIZE, 0, "mappages: size not aligned");
        assert!(size > 0, "mappages: zero size");
        let mut a = va;
        let mut pa = pa;
        let last = va + size - PGSIZE;
        loop {
            let pte = self.walk(a, true).ok_or(VmError::OutOfMemory)?;
            let pte_ref = unsafe { &mut *pte };
            assert!(!pte_ref.is_valid(), "mappages: remap of existing PTE");
            *pte_ref = Pte::new(pa, perm | PteFlags::V);
            if a == last {
                break;
            }
            a += PGSIZE;
            pa += PGSIZE;
        }
        Ok(())
    }

    /// Unmaps `n` pages starting at `va`. Every page must have a valid leaf
    /// PTE; an interior or missing entry is a fatal invariant violation.
    pub fn unmap(&mut self, va: usize, n: usize, do_free: bool) {
        assert_eq!(va % PGSIZE, 0, "unmap: va not aligned");
        for i in 0..n {
            let a = va + i * PGSIZE;
            let pte = self.walk(a, false).expect("unmap: not mapped");
            let pte_ref = unsafe { &mut *pte };
            assert!(pte_ref.is_valid(), "unmap: not a valid leaf");
            assert!(pte_ref.is_leaf(), "unmap: not a leaf (interior PTE)");
            if do_free {
                let pa = pte_ref.pa();
                unsafe { KMEM.free(Page::from_usize(pa)) };
            }
            *pte_ref = Pte::EMPTY;
        }
    }

    /// Clears the `U` bit of the leaf at `va`, without unmapping it. Used by
    /// exec to make the page below the user stack an inaccessible guard page.
    pub fn clear_user(&mut self, va: usize) {
        let pte = self.walk(va, false).expect("clear_user: not mapped");
        let pte_ref = unsafe { &mut *pte };
        *pte_ref = Pte::new(pte_ref.pa(), pte_ref.flags() - PteFlags::U);
    }

    /// Copies the parent's user mappings `[0, sz)` into `child`, each page
    /// freshly allocated and copied (no sharing). On any failure, every page
    /// already mapped into `child` is unmapped and freed.
    pub fn copy_to_child(&self, child: &mut PageTable, sz: usize) -> Result<(), VmError> {
        let mut copied = 0usize;
        for va in (0..sz).step_by(PGSIZE) {
            let pte = self.walk_const(va).expect("copy_to_child: source not mapped");
            assert!(pte.is_valid(), "copy_to_child: source not valid");
            let pa = pte.pa();
            let flags = pte.flags();
            let result = (|| -> Result<(), VmError> {
                let mut newpage = KMEM.alloc().ok_or(VmError::OutOfMemory)?;
                unsafe {
                    core::ptr::copy_nonoverlapping(pa as *const u8, newpage.as_ptr(), PGSIZE);
                }
                let newpa = newpage.into_usize();
                if let Err(e) = child.mappages(va, PGSIZE, newpa, flags) {
                    unsafe { KMEM.free(Page::from_usize(newpa)) };
                    return Err(e);
                }
                Ok(())
            })();
            if let Err(e) = result {
                child.unmap(0, copied / PGSIZE, true);
                return Err(e);
            }
            copied += PGSIZE;
        }
        Ok(())
    }

    /// Copies `src` into the user address space at `dstva`. Requires every
    /// touched page to have a valid, user, writable leaf mapping.
    pub fn copyout(&self, dstva: usize, src: &[u8]) -> Result<(), VmError> {
        let mut dst = dstva;
        let mut remaining = src;
        while !remaining.is_empty() {
            let va0 = pgrounddown(dst);
            let pte = self.walk_const(va0).ok_or(VmError::BadAddress)?;
            if !pte.is_leaf() || !pte.flags().contains(PteFlags::U | PteFlags::W) {
                return Err(VmError::BadAddress);
            }
            let pa0 = pte.pa();
            let off = dst - va0;
            let n = core::cmp::min(PGSIZE - off, remaining.len());
            unsafe {
                core::ptr::copy_nonoverlapping(remaining.as_ptr(), (pa0 + off) as *mut u8, n);
            }
            dst += n;
            remaining = &remaining[n..];
        }
        Ok(())
    }

    /// Copies from the user address space at `srcva` into `dst`.
    pub fn copyin(&self, dst: &mut [u8], srcva: usize) -> Result<(), VmError> {
        let mut src = srcva;
        let mut remaining = dst;
        while !remaining.is_empty() {
            let va0 = pgrounddown(src);
            let pa0 = self.walkaddr(va0).ok_or(VmError::BadAddress)?;
            let off = src - va0;
            let n = core::cmp::min(PGSIZE - off, remaining.len());
            unsafe {
                core::ptr::copy_nonoverlapping((pa0 + off) as *const u8, remaining.as_mut_ptr(), n);
            }
            src += n;
            let (_, rest) = remaining.split_at_mut(n);
            remaining = rest;
        }
        Ok(())
    }

    /// Copies a NUL-terminated string from user space, stopping at (and
    /// including) the first NUL. Fails if `max` bytes are consumed first.
    /// Returns the number of bytes copied, including the terminating NUL.
    pub fn copyinstr(&self, dst: &mut [u8], srcva: usize, max: usize) -> Result<usize, VmError> {
        let mut src = srcva;
        let mut copied = 0usize;
        while copied < max {
            let va0 = pgrounddown(src);
            let pa0 = self.walkaddr(va0).ok_or(VmError::BadAddress)?;
            let off = src - va0;
            let mut n = core::cmp::min(PGSIZE - off, max - copied);
            let chunk = unsafe { core::slice::from_raw_parts((pa0 + off) as *const u8, n) };
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                n = nul + 1;
                dst[copied..copied + n].copy_from_slice(&chunk[..n]);
                return Ok(copied + n);
            }
            dst[copied..copied + n].copy_from_slice(chunk);
            copied += n;
            src += n;
        }
        Err(VmError::BadAddress)
    }

    /// Grows the user address space from `oldsz` to `newsz`, allocating and
    /// zero-filling fresh pages and mapping each with `R | U | perm`.
    /// Returns the new size, or `None` if an allocation or mapping failed
    /// partway through (everything allocated so far is unmapped and freed
    /// first). `newsz < oldsz` is not a failure: it just returns `oldsz`
    /// unchanged, matching `uvmdealloc`'s sibling contract.
    pub fn uvmalloc(&mut self, oldsz: usize, newsz: usize, perm: PteFlags) -> Option<usize> {
        if newsz < oldsz {
            return Some(oldsz);
        }
        let oldsz = pgroundup(oldsz);
        let mut a = oldsz;
        while a < newsz {
            let mut page = match KMEM.alloc() {
                Some(p) => p,
                None => {
                    self.uvmdealloc(a, oldsz);
                    return None;
                }
            };
            page.zero();
            let pa = page.into_usize();
            if self.mappages(a, PGSIZE, pa, PteFlags::R | PteFlags::U | perm).is_err() {
                unsafe { KMEM.free(Page::from_usize(pa)) };
                self.uvmdealloc(a, oldsz);
                return None;
            }
            a += PGSIZE;
        }
        Some(newsz)
    }

    /// Shrinks the user address space from `oldsz` to `newsz`, unmapping and
    /// freeing whole pages that fall out of range. Neither bound need be
    /// page-aligned; a `newsz >= oldsz` is a no-op that returns `oldsz`.
    pub fn uvmdealloc(&mut self, oldsz: usize, newsz: usize) -> usize {
        if newsz >= oldsz {
            return oldsz;
        }
        if pgroundup(newsz) < pgroundup(oldsz) {
            let npages = (pgroundup(oldsz) - pgroundup(newsz)) / PGSIZE;
            self.unmap(pgroundup(newsz), npages, true);
        }
        newsz
    }

    /// Frees every page-table page, plus (if `free_leaves`) every mapped
    /// user leaf. Equivalent to `uvmfree`.
    pub fn free(mut self, sz: usize, free_leaves: bool) {
        if free_leaves && sz > 0 {
            self.unmap(0, pgroundup(sz) / PGSIZE, true);
        }
        free_subtree(self.root, 2);
        self.root = core::ptr::null_mut();
    }
}

fn free_subtree(table: *mut [Pte; 512], level: usize) {
    if table.is_null() {
        return;
    }
    if level > 0 {
        for i in 0..512 {
            let pte = unsafe { (*table)[i] };
            if pte.is_valid() && !pte.is_leaf() {
                free_subtree(pte.pa() as *mut [Pte; 512], level - 1);
            }
        }
    }
    unsafe { KMEM.free(Page::from_usize(table as usize)) };
}

/// The kernel's own page table: identity-mapped devices, text (R+X), data +
/// remaining RAM (R+W), and the trampoline (R+X, no U). Shared by every hart.
pub static KERNEL_PAGETABLE: Spinlock<Option<PageTable>> = Spinlock::new("kvm", None);

extern "C" {
    static etext: u8;
    static trampoline: u8;
}

/// Builds the kernel page table. Must run once, on hart 0, before any other
/// hart touches `KERNEL_PAGETABLE`.
pub fn kvminit() {
    let mut pt = PageTable::new().expect("kvminit: out of memory");
    let etext_pa = unsafe { &etext as *const u8 as usize };
    let kernbase = crate::memlayout::KERNBASE;
    let phystop = crate::memlayout::PHYSTOP;
    let trampoline_pa = unsafe { &trampoline as *const u8 as usize };

    pt.mappages(UART0, PGSIZE, UART0, PteFlags::R | PteFlags::W).unwrap();
    pt.mappages(VIRTIO0, PGSIZE, VIRTIO0, PteFlags::R | PteFlags::W).unwrap();
    pt.mappages(PLIC, 0x40_0000, PLIC, PteFlags::R | PteFlags::W).unwrap();
    pt.mappages(kernbase, etext_pa - kernbase, kernbase, PteFlags::R | PteFlags::X).unwrap();
    pt.mappages(etext_pa, phystop - etext_pa, etext_pa, PteFlags::R | PteFlags::W).unwrap();
    pt.mappages(TRAMPOLINE, PGSIZE, trampoline_pa, PteFlags::R | PteFlags::X).unwrap();

    *KERNEL_PAGETABLE.lock() = Some(pt);
}

/// Maps process `p`'s kernel stack, at its fixed high virtual address with
/// an unmapped guard page below it.
pub fn map_kstack(kpt: &mut PageTable, p_index: usize, pa: usize) {
    let va = crate::memlayout::kstack(p_index);
    kpt.mappages(va, PGSIZE, pa, PteFlags::R | PteFlags::W).unwrap();
}

/// Loads the kernel page table into `satp` and flushes the TLB. Every hart
/// must call this once during its own startup.
pub fn kvminithart() {
    let satp = KERNEL_PAGETABLE.lock().as_ref().expect("kvminit not run").satp();
    unsafe {
        crate::riscv::w_satp(satp);
        crate::riscv::sfence_vma();
    }
}

/// Allocates a fresh user page table with only the trampoline and trapframe
/// mapped (the layout `userinit`/`exec` build user memory on top of).
pub fn proc_pagetable(trapframe_pa: usize) -> Result<PageTable, VmError> {
    let mut pt = PageTable::new()?;
    extern "C" {
        static trampoline: u8;
    }
    let trampoline_pa = unsafe { &trampoline as *const u8 as usize };
    if let Err(e) = pt.mappages(TRAMPOLINE, PGSIZE, trampoline_pa, PteFlags::R | PteFlags::X) {
        pt.free(0, false);
        return Err(e);
    }
    if let Err(e) = pt.mappages(TRAPFRAME, PGSIZE, trapframe_pa, PteFlags::R | PteFlags::W) {
        pt.unmap(TRAMPOLINE, 1, false);
        pt.free(0, false);
        return Err(e);
    }
    Ok(pt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::riscv::PGSIZE;

    fn fresh_kmem_backed_pagetable(kmem: &crate::kalloc::Kmem) -> PageTable {
        let mut page = kmem.alloc().unwrap();
        page.zero();
        let root = page.into_usize() as *mut [Pte; 512];
        PageTable { root }
    }

    fn test_arena() -> crate::kalloc::Kmem {
        const NPAGES: usize = 64;
        let arena = std::boxed::Box::leak(std::boxed::Box::new([0u8; NPAGES * PGSIZE + PGSIZE]));
        let base = pgroundup(arena.as_ptr() as usize);
        let kmem = crate::kalloc::Kmem::new();
        unsafe { kmem.init_range(base, base + NPAGES * PGSIZE) };
        kmem
    }

    #[test]
    fn map_then_walkaddr_roundtrips() {
        let kmem = test_arena();
        let mut pt = fresh_kmem_backed_pagetable(&kmem);
        let backing = kmem.alloc().unwrap().into_usize();
        pt.mappages(0x1000, PGSIZE, backing, PteFlags::R | PteFlags::W | PteFlags::U)
            .unwrap();
        assert_eq!(pt.walkaddr(0x1000), Some(backing));
        assert_eq!(pt.walkaddr(0x2000), None);
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn remap_is_fatal() {
        let kmem = test_arena();
        let mut pt = fresh_kmem_backed_pagetable(&kmem);
        let backing = kmem.alloc().unwrap().into_usize();
        pt.mappages(0x1000, PGSIZE, backing, PteFlags::R).unwrap();
        let backing2 = kmem.alloc().unwrap().into_usize();
        let _ = pt.mappages(0x1000, PGSIZE, backing2, PteFlags::R);
    }

    #[test]
    fn copyout_requires_writable_user_leaf() {
        let kmem = test_arena();
        let mut pt = fresh_kmem_backed_pagetable(&kmem);
        let backing = kmem.alloc().unwrap().into_usize();
        pt.mappages(0x1000, PGSIZE, backing, PteFlags::R | PteFlags::U)
            .unwrap();
        let data = [1u8, 2, 3];
        assert_eq!(pt.copyout(0x1000, &data), Err(VmError::BadAddress));
    }
}
