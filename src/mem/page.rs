//! Anonymous page regions
//!
//! Thin facade over anonymous memory mappings.  All allocator-level
//! components (slice pool, rubber) obtain their backing store here, so
//! the page-level policies (huge pages, discard, fork inheritance) live
//! in one place.
//!
//! With the `memcheck` feature the mappings are replaced by plain heap
//! allocations so that leak checkers and sanitizers can track them.

use memmap2::{Advice, MmapMut, UncheckedAdvice};

/// MMU page size assumed by the slice layout arithmetic
pub const PAGE_SIZE: usize = 4096;

/// Transparent huge page size
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Round up to the next page boundary
pub const fn align_to_page_size(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Round down to a huge page boundary
pub const fn align_huge_page_down(size: usize) -> usize {
    size & !(HUGE_PAGE_SIZE - 1)
}

enum Backing {
    Map(MmapMut),
    #[allow(dead_code)]
    Heap(Vec<u8>),
}

/// A contiguous anonymous mapping of whole pages
pub struct PageRegion {
    backing: Backing,
    size: usize,
}

impl PageRegion {
    /// Map `size` bytes (rounded up to whole pages) of anonymous memory.
    ///
    /// Allocation is infallible: cache and buffer memory is considered
    /// essential, so a failing mmap aborts the process.
    pub fn new(size: usize) -> Self {
        let size = align_to_page_size(size);

        #[cfg(feature = "memcheck")]
        {
            return Self {
                backing: Backing::Heap(vec![0u8; size]),
                size,
            };
        }

        #[cfg(not(feature = "memcheck"))]
        {
            let map = MmapMut::map_anon(size).expect("anonymous mmap failed");
            Self {
                backing: Backing::Map(map),
                size,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Map(m) => &m[..],
            Backing::Heap(v) => &v[..],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Map(m) => &mut m[..],
            Backing::Heap(v) => &mut v[..],
        }
    }

    /// Return a page-aligned subrange to the kernel.
    ///
    /// The virtual addresses stay valid; the next write faults in fresh
    /// zero pages.  Offset and length are rounded inward to whole pages,
    /// so a partial page at either end is left untouched.
    pub fn discard(&mut self, offset: usize, len: usize) {
        let start = align_to_page_size(offset);
        let end = (offset + len) & !(PAGE_SIZE - 1);
        if start >= end {
            return;
        }

        match &mut self.backing {
            Backing::Map(m) => {
                // DONTNEED so the next read observes zero pages
                unsafe {
                    let _ = m.unchecked_advise_range(UncheckedAdvice::DontNeed, start, end - start);
                }
            }
            Backing::Heap(v) => {
                v[start..end].fill(0);
            }
        }
    }

    /// Mark the largest huge-page-aligned prefix as huge-page-eligible (advisory)
    pub fn enable_huge_pages(&self) {
        let huge = align_huge_page_down(self.size);
        if huge == 0 {
            return;
        }

        if let Backing::Map(m) = &self.backing {
            let _ = m.advise_range(Advice::HugePage, 0, huge);
        }
    }

    /// Control whether forked children inherit this region (advisory)
    pub fn fork_cow(&self, inherit: bool) {
        if let Backing::Map(m) = &self.backing {
            let advice = if inherit {
                Advice::DoFork
            } else {
                Advice::DontFork
            };
            let _ = m.advise(advice);
        }
    }
}
