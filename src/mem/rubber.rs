//! The rubber allocator
//!
//! One large anonymous mapping holding many variable-size objects that
//! are addressed by stable integer ids.  Objects are kept on a list
//! sorted by offset; the gaps between them ("holes") are tracked in
//! size-bucketed lists so new objects can be placed first-fit without
//! scanning the whole map.  `compress()` relocates all live objects into
//! contiguous order and returns the freed pages to the kernel.
//!
//! Cache bodies live here: ids stay valid across compaction, so cache
//! items never hold raw addresses.

use super::page::{align_to_page_size, PageRegion};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tracing::debug;

fn align_size(size: usize) -> usize {
    (size + 0x1f) & !0x1f
}

/// Hole-size bucket thresholds; a hole lands in the first bucket whose
/// threshold is >= its size
const BUCKET_THRESHOLDS: [usize; 10] = [
    64,
    128,
    256,
    512,
    1024,
    2048,
    4096,
    8192,
    16384,
    usize::MAX,
];

/// How many holes to inspect per bucket before giving up on that bucket
const MAX_BUCKET_SCAN: usize = 64;

fn bucket_for(size: usize) -> usize {
    BUCKET_THRESHOLDS
        .iter()
        .position(|&t| size <= t)
        .unwrap_or(BUCKET_THRESHOLDS.len() - 1)
}

#[derive(Debug, Clone, Copy)]
struct RubberObject {
    /// Next object id in offset order, 0 for end of list
    next: u32,

    /// Previous object id; for entry 0 this is the tail
    previous: u32,

    offset: usize,
    size: usize,

    allocated: bool,
}

impl RubberObject {
    fn end_offset(&self) -> usize {
        self.offset + self.size
    }
}

#[derive(Debug, Clone, Copy)]
struct Hole {
    offset: usize,
    size: usize,

    /// Allocated neighbors of this hole
    previous_id: u32,
    next_id: u32,
}

struct RubberInner {
    map: PageRegion,

    /// Entry 0 is the list anchor; its `previous` points at the tail
    entries: Vec<RubberObject>,

    /// Head of the free-entry list, linked through `next`; 0 = none
    free_head: u32,

    holes: [Vec<Hole>; BUCKET_THRESHOLDS.len()],

    netto_size: usize,
}

/// The rubber allocator; shared as `Arc<Rubber>`
pub struct Rubber {
    inner: Mutex<RubberInner>,
}

impl RubberInner {
    fn tail_id(&self) -> u32 {
        self.entries[0].previous
    }

    fn tail_end(&self) -> usize {
        let tail = self.tail_id();
        self.entries[tail as usize].end_offset()
    }

    fn total_hole_size(&self) -> usize {
        self.holes
            .iter()
            .flat_map(|b| b.iter())
            .map(|h| h.size)
            .sum()
    }

    fn new_entry(&mut self) -> u32 {
        if self.free_head != 0 {
            let id = self.free_head;
            self.free_head = self.entries[id as usize].next;
            id
        } else {
            self.entries.push(RubberObject {
                next: 0,
                previous: 0,
                offset: 0,
                size: 0,
                allocated: false,
            });
            (self.entries.len() - 1) as u32
        }
    }

    fn free_entry(&mut self, id: u32) {
        let entry = &mut self.entries[id as usize];
        entry.allocated = false;
        entry.next = self.free_head;
        self.free_head = id;
    }

    /// Link `id` into the allocated list between `previous` and `next`
    fn link(&mut self, id: u32, previous: u32, next: u32) {
        self.entries[id as usize].previous = previous;
        self.entries[id as usize].next = next;
        self.entries[previous as usize].next = id;
        if next == 0 {
            self.entries[0].previous = id;
        } else {
            self.entries[next as usize].previous = id;
        }
    }

    fn unlink(&mut self, id: u32) -> (u32, u32) {
        let previous = self.entries[id as usize].previous;
        let next = self.entries[id as usize].next;
        self.entries[previous as usize].next = next;
        if next == 0 {
            self.entries[0].previous = previous;
        } else {
            self.entries[next as usize].previous = previous;
        }
        (previous, next)
    }

    fn push_hole(&mut self, hole: Hole) {
        debug_assert!(hole.size > 0);
        self.holes[bucket_for(hole.size)].push(hole);
    }

    fn take_hole_ending_at(&mut self, offset: usize) -> Option<Hole> {
        for bucket in self.holes.iter_mut() {
            if let Some(pos) = bucket.iter().position(|h| h.offset + h.size == offset) {
                return Some(bucket.swap_remove(pos));
            }
        }
        None
    }

    fn take_hole_starting_at(&mut self, offset: usize) -> Option<Hole> {
        for bucket in self.holes.iter_mut() {
            if let Some(pos) = bucket.iter().position(|h| h.offset == offset) {
                return Some(bucket.swap_remove(pos));
            }
        }
        None
    }

    /// First-fit search: smallest hole in the matching bucket, falling
    /// back to larger buckets
    fn find_hole(&mut self, size: usize) -> Option<Hole> {
        for bucket_index in bucket_for(size)..BUCKET_THRESHOLDS.len() {
            let bucket = &self.holes[bucket_index];
            let mut best: Option<(usize, usize)> = None;
            for (pos, hole) in bucket.iter().take(MAX_BUCKET_SCAN).enumerate() {
                if hole.size >= size && best.map_or(true, |(_, s)| hole.size < s) {
                    best = Some((pos, hole.size));
                }
            }
            if let Some((pos, _)) = best {
                return Some(self.holes[bucket_index].swap_remove(pos));
            }
        }
        None
    }

    /// Place a new object of `size` bytes into `hole`
    fn add_in_hole(&mut self, hole: Hole, size: usize) -> u32 {
        debug_assert!(hole.size >= size);

        let id = self.new_entry();
        let entry = &mut self.entries[id as usize];
        entry.offset = hole.offset;
        entry.size = size;
        entry.allocated = true;
        self.link(id, hole.previous_id, hole.next_id);

        if hole.size > size {
            self.push_hole(Hole {
                offset: hole.offset + size,
                size: hole.size - size,
                previous_id: id,
                next_id: hole.next_id,
            });
        }

        self.netto_size += size;
        id
    }

    /// Append a new object after the current tail; the caller has checked
    /// that it fits
    fn append(&mut self, size: usize) -> u32 {
        let offset = self.tail_end();
        debug_assert!(offset + size <= self.map.len());

        let tail = self.tail_id();
        let id = self.new_entry();
        let entry = &mut self.entries[id as usize];
        entry.offset = offset;
        entry.size = size;
        entry.allocated = true;
        self.link(id, tail, 0);

        self.netto_size += size;
        id
    }

    /// Move the tail object into a hole, shrinking the brutto size.
    ///
    /// Returns false when no hole can take it.
    fn move_last(&mut self) -> bool {
        let tail = self.tail_id();
        if tail == 0 {
            return false;
        }
        let size = self.entries[tail as usize].size;

        let Some(hole) = self.find_hole(size) else {
            return false;
        };
        debug_assert!(hole.offset + hole.size <= self.entries[tail as usize].offset);

        let old_offset = self.entries[tail as usize].offset;
        self.map
            .as_mut_slice()
            .copy_within(old_offset..old_offset + size, hole.offset);

        let _ = self.unlink(tail);
        self.entries[tail as usize].offset = hole.offset;

        if hole.next_id == tail {
            // the hole directly preceded the tail; the object stays the
            // tail and the remainder becomes untracked space past it
            self.link(tail, hole.previous_id, 0);
        } else {
            self.link(tail, hole.previous_id, hole.next_id);

            if hole.size > size {
                self.push_hole(Hole {
                    offset: hole.offset + size,
                    size: hole.size - size,
                    previous_id: tail,
                    next_id: hole.next_id,
                });
            }

            // any hole that used to end at the old tail offset dies with it
            if let Some(dead) = self.take_hole_ending_at(old_offset) {
                debug_assert_eq!(dead.next_id, tail);
                let _ = dead;
            }
        }
        true
    }

    fn remove(&mut self, id: u32) {
        debug_assert!(id != 0);
        let obj = self.entries[id as usize];
        debug_assert!(obj.allocated);

        let (previous, next) = self.unlink(id);
        self.netto_size -= obj.size;
        self.free_entry(id);

        if next == 0 {
            // tail removal: the map shrinks; absorb a hole that ended
            // right at the removed object
            if let Some(hole) = self.take_hole_ending_at(obj.offset) {
                debug_assert_eq!(hole.previous_id, previous);
            }
            return;
        }

        let mut start = obj.offset;
        let mut size = obj.size;

        if let Some(hole) = self.take_hole_ending_at(obj.offset) {
            start = hole.offset;
            size += hole.size;
        }
        if let Some(hole) = self.take_hole_starting_at(obj.end_offset()) {
            size += hole.size;
        }

        self.push_hole(Hole {
            offset: start,
            size,
            previous_id: previous,
            next_id: next,
        });
    }

    fn shrink(&mut self, id: u32, new_size: usize) {
        let obj = self.entries[id as usize];
        debug_assert!(obj.allocated);
        debug_assert!(new_size <= obj.size);
        if new_size == obj.size {
            return;
        }

        let delta = obj.size - new_size;
        self.entries[id as usize].size = new_size;
        self.netto_size -= delta;

        if obj.next == 0 {
            // the tail is never followed by a hole; the map just shrinks
            return;
        }

        let mut size = delta;
        if let Some(hole) = self.take_hole_starting_at(obj.end_offset()) {
            size += hole.size;
        }
        self.push_hole(Hole {
            offset: obj.offset + new_size,
            size,
            previous_id: id,
            next_id: obj.next,
        });
    }

    /// Relocate every object into contiguous order and drop all holes
    fn compress(&mut self) {
        for bucket in self.holes.iter_mut() {
            bucket.clear();
        }

        let mut new_offset = 0;
        let mut id = self.entries[0].next;
        while id != 0 {
            let obj = self.entries[id as usize];
            if obj.offset != new_offset {
                debug_assert!(new_offset < obj.offset);
                self.map
                    .as_mut_slice()
                    .copy_within(obj.offset..obj.offset + obj.size, new_offset);
                self.entries[id as usize].offset = new_offset;
            }
            new_offset += obj.size;
            id = obj.next;
        }

        let tail_page = align_to_page_size(new_offset);
        if tail_page < self.map.len() {
            let len = self.map.len() - tail_page;
            self.map.discard(tail_page, len);
        }

        debug!(netto = self.netto_size, brutto = new_offset, "rubber compressed");
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        assert_eq!(
            self.netto_size + self.total_hole_size(),
            self.tail_end(),
            "netto + holes != brutto"
        );

        // allocated list sorted by offset, objects disjoint
        let mut id = self.entries[0].next;
        let mut last_end = 0;
        while id != 0 {
            let obj = self.entries[id as usize];
            assert!(obj.allocated);
            assert!(obj.offset >= last_end, "allocated list out of order");
            last_end = obj.end_offset();
            id = obj.next;
        }

        // no two adjacent holes
        let all: Vec<Hole> = self.holes.iter().flat_map(|b| b.iter().copied()).collect();
        for a in &all {
            for b in &all {
                assert!(
                    a.offset == b.offset || a.offset + a.size != b.offset,
                    "adjacent holes"
                );
            }
            assert!(a.offset + a.size < self.tail_end(), "hole at the tail");
        }
    }
}

impl Rubber {
    /// Create an allocator with the given maximum size
    pub fn new(max_size: usize) -> Self {
        let map = PageRegion::new(max_size);
        map.enable_huge_pages();

        Self {
            inner: Mutex::new(RubberInner {
                map,
                entries: vec![RubberObject {
                    next: 0,
                    previous: 0,
                    offset: 0,
                    size: 0,
                    allocated: true,
                }],
                free_head: 0,
                holes: Default::default(),
                netto_size: 0,
            }),
        }
    }

    /// Allocate `size` bytes; returns the object id, or 0 on failure
    pub fn add(&self, size: usize) -> u32 {
        debug_assert!(size > 0);
        let mut inner = self.inner.lock().unwrap();
        let aligned = align_size(size);

        if aligned > inner.map.len() {
            return 0;
        }

        if let Some(hole) = inner.find_hole(aligned) {
            return inner.add_in_hole(hole, aligned);
        }

        if inner.tail_end() + aligned <= inner.map.len() {
            return inner.append(aligned);
        }

        // the tail would exceed the map; try relocating tail objects into
        // holes, then fall back to a full compaction
        while inner.tail_end() + aligned > inner.map.len() {
            if !inner.move_last() {
                break;
            }
        }
        if inner.tail_end() + aligned <= inner.map.len() {
            return inner.append(aligned);
        }

        inner.compress();
        if inner.tail_end() + aligned <= inner.map.len() {
            return inner.append(aligned);
        }

        0
    }

    /// Shrink an object in place; the first `new_size` bytes are preserved
    pub fn shrink(&self, id: u32, new_size: usize) {
        debug_assert!(new_size > 0);
        let mut inner = self.inner.lock().unwrap();
        let aligned = align_size(new_size);
        inner.shrink(id, aligned);
    }

    pub fn remove(&self, id: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(id);
    }

    pub fn with_read<R>(&self, id: u32, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.lock().unwrap();
        let obj = inner.entries[id as usize];
        debug_assert!(obj.allocated);
        f(&inner.map.as_slice()[obj.offset..obj.end_offset()])
    }

    pub fn with_write<R>(&self, id: u32, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        let obj = inner.entries[id as usize];
        debug_assert!(obj.allocated);
        f(&mut inner.map.as_mut_slice()[obj.offset..obj.end_offset()])
    }

    /// Copy a byte range of an object out of the map
    pub fn copy_out(&self, id: u32, range: std::ops::Range<usize>) -> Bytes {
        self.with_read(id, |data| Bytes::copy_from_slice(&data[range]))
    }

    /// Relocate all objects into contiguous order and release the tail pages
    pub fn compress(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.compress();
    }

    pub fn fork_cow(&self, inherit: bool) {
        let inner = self.inner.lock().unwrap();
        inner.map.fork_cow(inherit);
    }

    /// Sum of all requested (aligned) object sizes
    pub fn netto_size(&self) -> usize {
        self.inner.lock().unwrap().netto_size
    }

    /// Bytes of the map in use, including holes
    pub fn brutto_size(&self) -> usize {
        self.inner.lock().unwrap().tail_end()
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        self.inner.lock().unwrap().check_invariants();
    }
}

/// Owning handle for one rubber object.
///
/// Dropping the handle returns the object to the allocator.  The handle
/// remembers the exact (unaligned) payload size.
pub struct RubberAllocation {
    rubber: Arc<Rubber>,
    id: u32,
    size: usize,
}

impl RubberAllocation {
    /// Take ownership of `size` bytes; `None` when the allocator is full
    pub fn new(rubber: Arc<Rubber>, size: usize) -> Option<Self> {
        let id = rubber.add(size);
        if id == 0 {
            return None;
        }
        Some(Self { rubber, id, size })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn shrink(&mut self, new_size: usize) {
        debug_assert!(new_size <= self.size);
        if new_size == 0 {
            return;
        }
        self.rubber.shrink(self.id, new_size);
        self.size = new_size;
    }

    pub fn with_read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let size = self.size;
        self.rubber.with_read(self.id, |data| f(&data[..size]))
    }

    pub fn with_write<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let size = self.size;
        self.rubber.with_write(self.id, |data| f(&mut data[..size]))
    }

    /// Copy the payload (or a range of it) into a `Bytes`
    pub fn to_bytes(&self, range: std::ops::Range<usize>) -> Bytes {
        debug_assert!(range.end <= self.size);
        self.rubber.copy_out(self.id, range)
    }
}

impl Drop for RubberAllocation {
    fn drop(&mut self) {
        self.rubber.remove(self.id);
    }
}

impl std::fmt::Debug for RubberAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RubberAllocation")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(rubber: &Rubber, id: u32, byte: u8) {
        rubber.with_write(id, |data| data.fill(byte));
    }

    fn first_byte(rubber: &Rubber, id: u32) -> u8 {
        rubber.with_read(id, |data| data[0])
    }

    #[test]
    fn test_add_remove_accounting() {
        let rubber = Rubber::new(1024 * 1024);
        let a = rubber.add(100);
        let b = rubber.add(200);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
        rubber.check_invariants();

        // sizes are aligned to 32 bytes
        assert_eq!(rubber.netto_size(), 128 + 224);
        assert_eq!(rubber.brutto_size(), 128 + 224);

        rubber.remove(a);
        rubber.check_invariants();
        assert_eq!(rubber.netto_size(), 224);
        // the hole left by `a` still counts toward brutto
        assert_eq!(rubber.brutto_size(), 128 + 224);

        rubber.remove(b);
        rubber.check_invariants();
        assert_eq!(rubber.brutto_size(), 0);
    }

    #[test]
    fn test_hole_reuse() {
        let rubber = Rubber::new(1024 * 1024);
        let a = rubber.add(512);
        let b = rubber.add(512);
        fill(&rubber, b, 7);

        rubber.remove(a);
        let c = rubber.add(512);
        rubber.check_invariants();

        // c landed in a's hole, so the map did not grow
        assert_eq!(rubber.brutto_size(), 1024);
        assert_eq!(first_byte(&rubber, b), 7);
        rubber.remove(b);
        rubber.remove(c);
    }

    #[test]
    fn test_compress_preserves_content() {
        let rubber = Rubber::new(1024 * 1024);
        let a = rubber.add(100);
        let b = rubber.add(100);
        let c = rubber.add(100);
        fill(&rubber, a, 1);
        fill(&rubber, b, 2);
        fill(&rubber, c, 3);

        rubber.remove(b);
        rubber.compress();
        rubber.check_invariants();

        assert_eq!(rubber.brutto_size(), rubber.netto_size());
        assert_eq!(first_byte(&rubber, a), 1);
        assert_eq!(first_byte(&rubber, c), 3);
        rubber.remove(a);
        rubber.remove(c);
    }

    #[test]
    fn test_shrink_creates_hole() {
        let rubber = Rubber::new(1024 * 1024);
        let a = rubber.add(1024);
        let _b = rubber.add(64);
        fill(&rubber, a, 9);

        rubber.shrink(a, 512);
        rubber.check_invariants();
        assert_eq!(rubber.netto_size(), 512 + 64);
        rubber.with_read(a, |data| {
            assert_eq!(data.len(), 512);
            assert_eq!(data[511], 9);
        });
    }

    #[test]
    fn test_shrink_tail_no_hole() {
        let rubber = Rubber::new(1024 * 1024);
        let a = rubber.add(1024);
        rubber.shrink(a, 128);
        rubber.check_invariants();
        assert_eq!(rubber.brutto_size(), 128);
    }

    #[test]
    fn test_oversized_add_fails() {
        let rubber = Rubber::new(4096);
        assert_eq!(rubber.add(8192), 0);
        assert_ne!(rubber.add(4096), 0);
        assert_eq!(rubber.add(32), 0);
    }

    #[test]
    fn test_add_compresses_to_fit() {
        let rubber = Rubber::new(8192);
        let a = rubber.add(4096);
        let b = rubber.add(2048);
        fill(&rubber, b, 5);
        rubber.remove(a);

        // 6 KiB are free but fragmented across the hole and the tail
        let c = rubber.add(6000);
        assert_ne!(c, 0);
        rubber.check_invariants();
        assert_eq!(first_byte(&rubber, b), 5);
    }

    #[test]
    fn test_allocation_handle_drop() {
        let rubber = Arc::new(Rubber::new(1024 * 1024));
        {
            let mut alloc = RubberAllocation::new(rubber.clone(), 100).unwrap();
            alloc.with_write(|data| data.fill(4));
            assert_eq!(alloc.to_bytes(0..4), Bytes::from_static(&[4, 4, 4, 4]));
        }
        assert_eq!(rubber.netto_size(), 0);
        assert_eq!(rubber.brutto_size(), 0);
    }
}
