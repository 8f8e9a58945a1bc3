//! Physical memory allocator: user processes, kernel stacks, page-table
//! pages, and pipe buffers all come from here. Allocates whole 4 KiB pages.

use crate::lock::Spinlock;
use crate::page::{self, Page};
use crate::riscv::{pgrounddown, pgroundup, PGSIZE};
use core::ptr;

/// One node of the intrusive freelist, embedded at the head of a free page.
struct Run {
    next: *mut Run,
}

/// # Safety invariant
/// The `head` chain has no cycle; if non-null, `head` is a valid, currently
/// free page, and so on down the chain.
struct KmemInner {
    head: *mut Run,
}

// SAFETY: the freelist is only ever walked while `LOCK` is held.
unsafe impl Send for KmemInner {}

pub struct Kmem {
    inner: Spinlock<KmemInner>,
}

impl Kmem {
    pub const fn new() -> Self {
        Kmem {
            inner: Spinlock::new("kmem", KmemInner { head: ptr::null_mut() }),
        }
    }

    /// Seeds the freelist with every page in `[start, end)`.
    ///
    /// # Safety
    /// `[start, end)` must not overlap any page already owned elsewhere, and
    /// this must be called at most once per byte range.
    pub unsafe fn init_range(&self, start: usize, end: usize) {
        let start = pgroundup(start);
        let end = pgrounddown(end);
        let mut pa = start;
        while pa < end {
            unsafe { self.free(Page::from_usize(pa)) };
            pa += PGSIZE;
        }
    }

    pub fn free(&self, page: Page) {
        let pa = page.into_usize();
        debug_assert_eq!(pa % PGSIZE, 0, "Kmem::free: misaligned");
        // SAFETY: `pa` came from a live, uniquely owned `Page`.
        unsafe { page::scrub_free(pa as *mut u8) };
        let r = pa as *mut Run;
        let mut guard = self.inner.lock();
        // SAFETY: `r` points at a page we just scrubbed and exclusively own;
        // linking it in front of `head` cannot create a cycle.
        unsafe { (*r).next = guard.head };
        guard.head = r;
    }

    /// Returns one page of unspecified (dirty) content, or `None` if exhausted.
    pub fn alloc(&self) -> Option<Page> {
        let mut guard = self.inner.lock();
        if guard.head.is_null() {
            return None;
        }
        // SAFETY: `head` is non-null, hence a valid free page by the invariant.
        let next = unsafe { (*guard.head).next };
        let taken = core::mem::replace(&mut guard.head, next);
        drop(guard);
        let mut page = unsafe { Page::from_usize(taken as usize) };
        page.scrub_alloc();
        Some(page)
    }
}

impl Default for Kmem {
    fn default() -> Self {
        Self::new()
    }
}

pub static KMEM: Kmem = Kmem::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_exhausts_and_refills_after_free() {
        const NPAGES: usize = 8;
        let arena = std::boxed::Box::leak(std::boxed::Box::new([0u8; NPAGES * PGSIZE + PGSIZE]));
        let base = pgroundup(arena.as_ptr() as usize);
        let kmem = Kmem::new();
        unsafe { kmem.init_range(base, base + NPAGES * PGSIZE) };

        let mut pages = std::vec::Vec::new();
        for _ in 0..NPAGES {
            pages.push(kmem.alloc().expect("should have a free page"));
        }
        assert!(kmem.alloc().is_none(), "freelist should be exhausted");

        let reclaimed = pages.pop().unwrap();
        kmem.free(reclaimed);
        assert!(kmem.alloc().is_some(), "freed page should be reusable");

        for p in pages {
            kmem.free(p);
        }
    }
}
