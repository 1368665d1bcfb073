//! The "slice" memory allocator
//!
//! An allocator for large numbers of small fixed-size objects.  Memory is
//! obtained in page-aligned areas, each subdivided into slices; a per-area
//! free list links the unused slots.  Areas are kept on three lists
//! (partial, empty, full) so allocation can prefer partially used areas
//! and keep fragmentation low.  `compress()` hands runs of free pages
//! back to the kernel and disposes of empty areas.

use super::page::{PageRegion, PAGE_SIZE};
use super::AllocatorStats;
use bitvec::prelude::*;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// Slot link marker: end of the free list
const END_OF_LIST: u32 = u32::MAX;

/// Slot link marker: this slot is currently allocated
const ALLOCATED: u32 = u32::MAX - 1;

fn align_size(size: usize) -> usize {
    (size + 0x1f) & !0x1f
}

fn divide_round_up(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Handle for one allocated slice.
///
/// The handle does not borrow the pool; data access goes through
/// [`SlicePool::with_read`] / [`SlicePool::with_write`], and the slot is
/// returned with [`SlicePool::free`].
#[derive(Debug)]
#[must_use]
pub struct SliceAllocation {
    area: usize,
    slot: u32,
    size: usize,
}

impl SliceAllocation {
    pub fn size(&self) -> usize {
        self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AreaList {
    Empty,
    Partial,
    Full,
}

struct SliceArea {
    region: PageRegion,

    /// Free-list links; `ALLOCATED` marks slots in use
    slots: Vec<u32>,

    free_head: u32,
    allocated_count: u32,
    list: AreaList,
}

struct PoolInner {
    areas: Vec<Option<SliceArea>>,
    free_area_ids: Vec<usize>,

    empty: VecDeque<usize>,
    partial: VecDeque<usize>,
    full: VecDeque<usize>,

    fork_cow: bool,
}

/// The slice pool proper; shared as `Arc<SlicePool>`
pub struct SlicePool {
    slice_size: usize,
    slices_per_area: u32,

    /// Number of slices that fit on one MMU page
    slices_per_page: u32,
    pages_per_slice: u32,
    pages_per_area: u32,

    /// Pages charged per area for the slot bookkeeping
    header_pages: u32,

    /// Payload bytes per area
    area_size: usize,

    inner: Mutex<PoolInner>,
}

impl SlicePool {
    pub fn new(slice_size: usize, slices_per_area: u32) -> Self {
        assert!(slice_size > 0);
        assert!(slices_per_area > 0);

        let (slice_size, slices_per_page, pages_per_slice) = if slice_size <= PAGE_SIZE / 2 {
            let slice_size = align_size(slice_size);
            ((slice_size), (PAGE_SIZE / slice_size) as u32, 1u32)
        } else {
            let pages = divide_round_up(slice_size, PAGE_SIZE) as u32;
            (pages as usize * PAGE_SIZE, 1u32, pages)
        };

        let pages_per_area =
            divide_round_up(slices_per_area as usize, slices_per_page as usize) as u32
                * pages_per_slice;
        let slices_per_area = pages_per_area / pages_per_slice * slices_per_page;

        let header_bytes = slices_per_area as usize * std::mem::size_of::<u32>();
        let header_pages = divide_round_up(header_bytes, PAGE_SIZE) as u32;

        Self {
            slice_size,
            slices_per_area,
            slices_per_page,
            pages_per_slice,
            pages_per_area,
            header_pages,
            area_size: pages_per_area as usize * PAGE_SIZE,
            inner: Mutex::new(PoolInner {
                areas: Vec::new(),
                free_area_ids: Vec::new(),
                empty: VecDeque::new(),
                partial: VecDeque::new(),
                full: VecDeque::new(),
                fork_cow: true,
            }),
        }
    }

    pub fn slice_size(&self) -> usize {
        self.slice_size
    }

    /// Byte offset of a slot within its area
    fn slot_offset(&self, slot: u32) -> usize {
        let page = (slot / self.slices_per_page) * self.pages_per_slice;
        let remainder = slot % self.slices_per_page;
        page as usize * PAGE_SIZE + remainder as usize * self.slice_size
    }

    fn new_area(&self, inner: &mut PoolInner) -> usize {
        let region = PageRegion::new(self.area_size);
        region.enable_huge_pages();
        if !inner.fork_cow {
            region.fork_cow(false);
        }

        let n = self.slices_per_area;
        let mut slots: Vec<u32> = (1..n).collect();
        slots.push(END_OF_LIST);

        let area = SliceArea {
            region,
            slots,
            free_head: 0,
            allocated_count: 0,
            list: AreaList::Empty,
        };

        let id = match inner.free_area_ids.pop() {
            Some(id) => {
                inner.areas[id] = Some(area);
                id
            }
            None => {
                inner.areas.push(Some(area));
                inner.areas.len() - 1
            }
        };

        inner.empty.push_front(id);
        debug!(area = id, size = self.area_size, "new slice area");
        id
    }

    fn unlink(list: &mut VecDeque<usize>, id: usize) {
        if let Some(pos) = list.iter().position(|&i| i == id) {
            list.remove(pos);
        }
    }

    /// Allocate one slice.
    ///
    /// Preference order: a partially used area, then an empty area, else a
    /// freshly mapped one.  Infallible by design.
    pub fn alloc(&self) -> SliceAllocation {
        let mut inner = self.inner.lock().unwrap();

        let id = if let Some(&id) = inner.partial.front() {
            id
        } else if let Some(&id) = inner.empty.front() {
            id
        } else {
            self.new_area(&mut inner)
        };

        let was_empty;
        let now_full;
        let slot;
        {
            let area = inner.areas[id].as_mut().unwrap();
            was_empty = area.allocated_count == 0;

            slot = area.free_head;
            debug_assert!(slot < self.slices_per_area);
            area.free_head = area.slots[slot as usize];
            area.slots[slot as usize] = ALLOCATED;
            area.allocated_count += 1;

            now_full = area.free_head == END_OF_LIST;
        }

        if was_empty {
            Self::unlink(&mut inner.empty, id);
            inner.partial.push_front(id);
            inner.areas[id].as_mut().unwrap().list = AreaList::Partial;
        }
        if now_full {
            Self::unlink(&mut inner.partial, id);
            inner.full.push_back(id);
            inner.areas[id].as_mut().unwrap().list = AreaList::Full;
        }

        SliceAllocation {
            area: id,
            slot,
            size: self.slice_size,
        }
    }

    /// Return a slice to its area
    pub fn free(&self, allocation: SliceAllocation) {
        let mut inner = self.inner.lock().unwrap();
        let id = allocation.area;

        let was_full;
        let now_empty;
        {
            let area = inner.areas[id].as_mut().unwrap();
            debug_assert_eq!(area.slots[allocation.slot as usize], ALLOCATED);
            was_full = area.free_head == END_OF_LIST;

            area.slots[allocation.slot as usize] = area.free_head;
            area.free_head = allocation.slot;
            area.allocated_count -= 1;
            now_empty = area.allocated_count == 0;
        }

        if was_full {
            Self::unlink(&mut inner.full, id);
            inner.partial.push_front(id);
            inner.areas[id].as_mut().unwrap().list = AreaList::Partial;
        }
        if now_empty {
            Self::unlink(&mut inner.partial, id);
            inner.empty.push_front(id);
            inner.areas[id].as_mut().unwrap().list = AreaList::Empty;
        }
    }

    /// Read access to an allocated slice
    pub fn with_read<R>(&self, allocation: &SliceAllocation, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.lock().unwrap();
        let area = inner.areas[allocation.area].as_ref().unwrap();
        debug_assert_eq!(area.slots[allocation.slot as usize], ALLOCATED);
        let offset = self.slot_offset(allocation.slot);
        f(&area.region.as_slice()[offset..offset + self.slice_size])
    }

    /// Write access to an allocated slice
    pub fn with_write<R>(&self, allocation: &SliceAllocation, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        let offset = self.slot_offset(allocation.slot);
        let area = inner.areas[allocation.area].as_mut().unwrap();
        debug_assert_eq!(area.slots[allocation.slot as usize], ALLOCATED);
        f(&mut area.region.as_mut_slice()[offset..offset + self.slice_size])
    }

    /// Discard free pages in partial areas and dispose of empty areas.
    ///
    /// Full areas are left alone.  Allocations keep their addresses.
    pub fn compress(&self) {
        let mut inner = self.inner.lock().unwrap();

        let partial: Vec<usize> = inner.partial.iter().copied().collect();
        for id in partial {
            self.compress_area(inner.areas[id].as_mut().unwrap());
        }

        let empty: Vec<usize> = inner.empty.drain(..).collect();
        for id in empty {
            let area = inner.areas[id].take().unwrap();
            debug_assert_eq!(area.allocated_count, 0);
            drop(area);
            inner.free_area_ids.push(id);
        }
    }

    /// Advise the kernel to drop pages that contain only free slots
    fn compress_area(&self, area: &mut SliceArea) {
        let pages = self.pages_per_area as usize;
        let mut occupied = bitvec![0; pages];

        for (slot, link) in area.slots.iter().enumerate() {
            if *link != ALLOCATED {
                continue;
            }
            let first = (slot as u32 / self.slices_per_page * self.pages_per_slice) as usize;
            for page in first..first + self.pages_per_slice as usize {
                occupied.set(page, true);
            }
        }

        // discard maximal runs of unoccupied pages
        let mut run_start: Option<usize> = None;
        for page in 0..=pages {
            let free = page < pages && !occupied[page];
            match (free, run_start) {
                (true, None) => run_start = Some(page),
                (false, Some(start)) => {
                    area.region
                        .discard(start * PAGE_SIZE, (page - start) * PAGE_SIZE);
                    run_start = None;
                }
                _ => {}
            }
        }
    }

    /// Apply fork inheritance advice to all areas, and to future ones
    pub fn fork_cow(&self, inherit: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.fork_cow == inherit {
            return;
        }
        inner.fork_cow = inherit;

        for area in inner.areas.iter().flatten() {
            area.region.fork_cow(inherit);
        }
    }

    pub fn stats(&self) -> AllocatorStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = AllocatorStats::default();
        for area in inner.areas.iter().flatten() {
            stats.brutto_size += (self.header_pages as usize + self.pages_per_area as usize)
                * PAGE_SIZE;
            stats.netto_size += area.allocated_count as usize * self.slice_size;
        }
        stats
    }

    #[cfg(test)]
    fn allocated_count(&self, area: usize) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner.areas[area]
            .as_ref()
            .map(|a| a.allocated_count)
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn check_area_invariants(&self) {
        let inner = self.inner.lock().unwrap();
        for (id, area) in inner.areas.iter().enumerate() {
            let Some(area) = area else { continue };
            let allocated = area
                .slots
                .iter()
                .filter(|&&link| link == ALLOCATED)
                .count() as u32;
            assert_eq!(allocated, area.allocated_count);

            let expected = if area.allocated_count == 0 {
                AreaList::Empty
            } else if area.free_head == END_OF_LIST {
                AreaList::Full
            } else {
                AreaList::Partial
            };
            assert_eq!(area.list, expected, "area {} on wrong list", id);

            let on = |list: &VecDeque<usize>| list.iter().any(|&i| i == id);
            let membership =
                on(&inner.empty) as usize + on(&inner.partial) as usize + on(&inner.full) as usize;
            assert_eq!(membership, 1, "area {} on {} lists", id, membership);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_roundtrip() {
        let pool = SlicePool::new(1024, 64);
        assert_eq!(pool.slice_size(), 1024);

        let a = pool.alloc();
        assert_eq!(a.size(), 1024);
        assert_eq!(pool.allocated_count(a.area), 1);
        pool.check_area_invariants();

        pool.free(a);
        pool.check_area_invariants();
        assert_eq!(pool.stats().netto_size, 0);
    }

    #[test]
    fn test_data_survives_other_operations() {
        let pool = SlicePool::new(256, 16);

        let a = pool.alloc();
        pool.with_write(&a, |buf| buf[..5].copy_from_slice(b"hello"));

        let b = pool.alloc();
        pool.with_write(&b, |buf| buf.fill(0xff));
        pool.compress();

        pool.with_read(&a, |buf| assert_eq!(&buf[..5], b"hello"));
        pool.free(a);
        pool.free(b);
    }

    #[test]
    fn test_area_fills_and_spills() {
        let pool = SlicePool::new(1024, 4);
        let per_area = pool.slices_per_area;

        let mut allocations = Vec::new();
        for _ in 0..per_area + 1 {
            allocations.push(pool.alloc());
        }
        pool.check_area_invariants();

        // the spill allocation must be in a second area
        let first_area = allocations[0].area;
        assert!(allocations.iter().any(|a| a.area != first_area));

        for a in allocations.drain(..) {
            pool.free(a);
        }
        pool.check_area_invariants();
    }

    #[test]
    fn test_compress_disposes_empty_areas() {
        let pool = SlicePool::new(512, 8);
        let a = pool.alloc();
        let area = a.area;
        pool.free(a);

        pool.compress();
        let inner = pool.inner.lock().unwrap();
        assert!(inner.areas[area].is_none());
        assert!(inner.empty.is_empty());
    }

    #[test]
    fn test_large_slices_span_pages() {
        let pool = SlicePool::new(3 * PAGE_SIZE - 100, 4);
        assert_eq!(pool.slice_size(), 3 * PAGE_SIZE);

        let a = pool.alloc();
        pool.with_write(&a, |buf| {
            buf[0] = 1;
            let n = buf.len();
            buf[n - 1] = 2;
        });
        pool.with_read(&a, |buf| {
            assert_eq!(buf[0], 1);
            assert_eq!(buf[buf.len() - 1], 2);
        });
        pool.free(a);
    }
}
