//! Request pool tree
//!
//! Region allocators organized as a tree: the instance owns a root pool,
//! each connection a child, each request a grandchild.  Dropping the last
//! reference to a pool frees everything allocated from it at once.
//!
//! Pools are kept in an id-indexed registry instead of linking records
//! through raw parent/child pointers; a `PoolId` is the only thing that
//! crosses module boundaries.  Allocations are returned as [`PoolBuf`]
//! handles and accessed through closures, so no reference can outlive
//! the arena it points into.

use super::slice_pool::{SliceAllocation, SlicePool};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// All pool allocations are aligned to this many bytes
const ALIGN: usize = 0x20;

/// Default byte size of one linear area
pub const DEFAULT_AREA_SIZE: usize = 8192;

/// Upper bound on recycled linear areas kept around
const RECYCLER_CAP: usize = 32;

fn align_size(size: usize) -> usize {
    (size + ALIGN - 1) & !(ALIGN - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// No allocations permitted; exists only to parent other pools
    Dummy,
    /// One heap chunk per allocation; `free` actually frees
    Libc,
    /// Bump allocation from chained areas
    Linear,
    /// Like Linear, but areas are slices from a slice pool
    Slice,
}

/// Handle for one allocation; data access goes through
/// [`PoolTree::with_read`] / [`PoolTree::with_write`]
#[derive(Debug, Clone, Copy)]
pub struct PoolBuf {
    pool: PoolId,
    area: u32,
    offset: u32,
    len: u32,
}

impl PoolBuf {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }
}

struct LinearArea {
    buf: Box<[u8]>,
    used: usize,
}

enum PoolStorage {
    Dummy,
    Libc {
        chunks: Vec<Option<Box<[u8]>>>,
    },
    Linear {
        areas: Vec<LinearArea>,
        area_size: usize,
        /// Index of the area currently bump-allocated from; oversized
        /// areas are appended without disturbing it
        current: usize,
    },
    Slice {
        areas: Vec<(SliceAllocation, usize)>,
        current: usize,
    },
}

struct PoolNode {
    name: String,
    parent: Option<PoolId>,
    children: Vec<PoolId>,
    refcount: usize,
    major: bool,
    trashed: bool,
    netto_size: usize,
    leak_count: usize,
    storage: PoolStorage,
}

/// The pool registry; shared as `Arc<Mutex<PoolTree>>`
pub struct PoolTree {
    nodes: Vec<Option<PoolNode>>,
    free_ids: Vec<u32>,

    /// Pools detached from the tree but not yet unreferenced to zero
    trash: Vec<PoolId>,

    /// LIFO of standard-size linear areas ready for reuse
    recycler: Vec<Box<[u8]>>,

    slice_pool: Option<Arc<SlicePool>>,
}

pub type SharedPoolTree = Arc<Mutex<PoolTree>>;

impl PoolTree {
    pub fn new(slice_pool: Option<Arc<SlicePool>>) -> Self {
        Self {
            nodes: Vec::new(),
            free_ids: Vec::new(),
            trash: Vec::new(),
            recycler: Vec::new(),
            slice_pool,
        }
    }

    fn insert(&mut self, node: PoolNode) -> PoolId {
        let id = match self.free_ids.pop() {
            Some(i) => {
                self.nodes[i as usize] = Some(node);
                PoolId(i)
            }
            None => {
                self.nodes.push(Some(node));
                PoolId((self.nodes.len() - 1) as u32)
            }
        };
        if let Some(parent) = self.nodes[id.0 as usize].as_ref().unwrap().parent {
            self.node_mut(parent).children.push(id);
        }
        id
    }

    fn node(&self, id: PoolId) -> &PoolNode {
        self.nodes[id.0 as usize].as_ref().expect("stale pool id")
    }

    fn node_mut(&mut self, id: PoolId) -> &mut PoolNode {
        self.nodes[id.0 as usize].as_mut().expect("stale pool id")
    }

    fn new_node(
        &mut self,
        parent: Option<PoolId>,
        name: &str,
        storage: PoolStorage,
    ) -> PoolId {
        trace!(name, "new pool");
        self.insert(PoolNode {
            name: name.to_string(),
            parent,
            children: Vec::new(),
            refcount: 1,
            major: false,
            trashed: false,
            netto_size: 0,
            leak_count: 0,
            storage,
        })
    }

    /// Create the root pool; it is "major": its children go to the trash
    /// list on destruction instead of being reparented
    pub fn new_root(&mut self, name: &str) -> PoolId {
        let id = self.new_node(None, name, PoolStorage::Dummy);
        self.node_mut(id).major = true;
        id
    }

    pub fn new_dummy(&mut self, parent: PoolId, name: &str) -> PoolId {
        self.new_node(Some(parent), name, PoolStorage::Dummy)
    }

    pub fn new_libc(&mut self, parent: PoolId, name: &str) -> PoolId {
        self.new_node(Some(parent), name, PoolStorage::Libc { chunks: Vec::new() })
    }

    pub fn new_linear(&mut self, parent: PoolId, name: &str, area_size: usize) -> PoolId {
        #[cfg(feature = "memcheck")]
        {
            let _ = area_size;
            return self.new_libc(parent, name);
        }

        #[cfg(not(feature = "memcheck"))]
        {
            let area_size = if area_size == 0 {
                DEFAULT_AREA_SIZE
            } else {
                area_size
            };
            self.new_node(
                Some(parent),
                name,
                PoolStorage::Linear {
                    areas: Vec::new(),
                    area_size,
                    current: 0,
                },
            )
        }
    }

    pub fn new_slice(&mut self, parent: PoolId, name: &str) -> PoolId {
        #[cfg(feature = "memcheck")]
        {
            return self.new_libc(parent, name);
        }

        #[cfg(not(feature = "memcheck"))]
        {
            assert!(self.slice_pool.is_some(), "no slice pool configured");
            self.new_node(
                Some(parent),
                name,
                PoolStorage::Slice {
                    areas: Vec::new(),
                    current: 0,
                },
            )
        }
    }

    /// Mark a pool "major": a commit point that must fully wind down
    /// before the next top-level event
    pub fn set_major(&mut self, id: PoolId) {
        self.node_mut(id).major = true;
    }

    pub fn ref_(&mut self, id: PoolId) -> usize {
        let node = self.node_mut(id);
        node.refcount += 1;
        node.refcount
    }

    /// Drop one reference; destroys the pool when the count reaches zero
    pub fn unref(&mut self, id: PoolId) -> usize {
        let node = self.node_mut(id);
        debug_assert!(node.refcount > 0);
        node.refcount -= 1;
        let remaining = node.refcount;
        if remaining == 0 {
            self.destroy(id);
        }
        remaining
    }

    fn destroy(&mut self, id: PoolId) {
        let node = self.nodes[id.0 as usize].take().expect("stale pool id");

        if node.leak_count != 0 {
            // a live leak detector at destruction is a program bug
            debug_assert!(
                false,
                "pool '{}' destroyed with {} live leak detectors",
                node.name, node.leak_count
            );
        }

        if let Some(parent) = node.parent {
            if let Some(parent_node) = self.nodes[parent.0 as usize].as_mut() {
                parent_node.children.retain(|&c| c != id);
            }
        }
        self.trash.retain(|&p| p != id);

        // a major or already-trashed pool does not pass its children on;
        // their owners are responsible for unreferencing them
        let reparent_to = if node.major || node.trashed {
            None
        } else {
            node.parent
        };

        for child in node.children {
            match reparent_to {
                Some(parent) => {
                    self.node_mut(child).parent = Some(parent);
                    self.node_mut(parent).children.push(child);
                }
                None => {
                    let child_node = self.node_mut(child);
                    child_node.parent = None;
                    child_node.trashed = true;
                    if cfg!(debug_assertions) {
                        self.trash.push(child);
                    }
                }
            }
        }

        self.release_storage(node.storage);
    }

    fn release_storage(&mut self, storage: PoolStorage) {
        match storage {
            PoolStorage::Dummy | PoolStorage::Libc { .. } => {}
            PoolStorage::Linear {
                areas, area_size, ..
            } => {
                if area_size == DEFAULT_AREA_SIZE {
                    for area in areas {
                        if area.buf.len() == DEFAULT_AREA_SIZE
                            && self.recycler.len() < RECYCLER_CAP
                        {
                            self.recycler.push(area.buf);
                        }
                    }
                }
            }
            PoolStorage::Slice { areas, .. } => {
                let pool = self.slice_pool.as_ref().unwrap();
                for (allocation, _) in areas {
                    pool.free(allocation);
                }
            }
        }
    }

    /// Detach a pool from the tree and defer its destruction: references
    /// to its data live in an outer scope that has not wound down yet
    pub fn trash_pool(&mut self, id: PoolId) {
        let node = self.node_mut(id);
        if node.trashed {
            return;
        }
        node.trashed = true;
        let parent = node.parent.take();
        if let Some(parent) = parent {
            self.node_mut(parent).children.retain(|&c| c != id);
        }
        if cfg!(debug_assertions) {
            self.trash.push(id);
        }
    }

    /// Assert that all trashed pools have wound down; called between
    /// top-level events
    pub fn commit(&mut self) {
        debug_assert!(
            self.trash.is_empty(),
            "{} trashed pools still alive",
            self.trash.len()
        );
        self.trash.clear();
    }

    /// Allocate `size` bytes from a pool
    pub fn alloc(&mut self, id: PoolId, size: usize) -> PoolBuf {
        let aligned = align_size(size.max(1));

        // a fresh area may be needed before the node can be borrowed
        // mutably: the recycler and the slice pool live on `self`
        let need_linear_area = match &self.node(id).storage {
            PoolStorage::Linear {
                areas,
                area_size,
                current,
            } => {
                aligned <= *area_size
                    && areas
                        .get(*current)
                        .map_or(true, |a| a.used + aligned > a.buf.len())
            }
            _ => false,
        };
        let new_linear_area = need_linear_area.then(|| self.obtain_linear_area());

        let new_slice_area = match &self.node(id).storage {
            PoolStorage::Slice { areas, current } => {
                let pool = self.slice_pool.as_ref().unwrap();
                assert!(
                    aligned <= pool.slice_size(),
                    "allocation of {} bytes exceeds the slice size",
                    size
                );
                areas
                    .get(*current)
                    .map_or(true, |(a, used)| used + aligned > a.size())
                    .then(|| pool.alloc())
            }
            _ => None,
        };

        let node = self.node_mut(id);
        node.netto_size += aligned;

        match &mut node.storage {
            PoolStorage::Dummy => panic!("allocation from dummy pool '{}'", node.name),
            PoolStorage::Libc { chunks } => {
                chunks.push(Some(vec![0u8; aligned].into_boxed_slice()));
                PoolBuf {
                    pool: id,
                    area: (chunks.len() - 1) as u32,
                    offset: 0,
                    len: size as u32,
                }
            }
            PoolStorage::Linear {
                areas,
                area_size,
                current,
            } => {
                if aligned > *area_size {
                    // oversized allocation gets its own right-sized area,
                    // appended without disturbing the current area, which
                    // keeps filling up
                    areas.push(LinearArea {
                        buf: vec![0u8; aligned].into_boxed_slice(),
                        used: aligned,
                    });
                    return PoolBuf {
                        pool: id,
                        area: (areas.len() - 1) as u32,
                        offset: 0,
                        len: size as u32,
                    };
                }

                if let Some(buf) = new_linear_area {
                    areas.push(LinearArea { buf, used: 0 });
                    *current = areas.len() - 1;
                }

                let area = &mut areas[*current];
                let offset = area.used;
                area.used += aligned;
                PoolBuf {
                    pool: id,
                    area: *current as u32,
                    offset: offset as u32,
                    len: size as u32,
                }
            }
            PoolStorage::Slice { areas, current } => {
                if let Some(allocation) = new_slice_area {
                    areas.push((allocation, 0));
                    *current = areas.len() - 1;
                }

                let (_, used) = &mut areas[*current];
                let offset = *used;
                *used += aligned;
                PoolBuf {
                    pool: id,
                    area: *current as u32,
                    offset: offset as u32,
                    len: size as u32,
                }
            }
        }
    }

    fn obtain_linear_area(&mut self) -> Box<[u8]> {
        match self.recycler.pop() {
            Some(mut buf) => {
                buf.fill(0);
                buf
            }
            None => vec![0u8; DEFAULT_AREA_SIZE].into_boxed_slice(),
        }
    }

    /// Read access to an allocation
    pub fn with_read<R>(&self, buf: &PoolBuf, f: impl FnOnce(&[u8]) -> R) -> R {
        let node = self.node(buf.pool);
        let start = buf.offset as usize;
        let end = start + buf.len as usize;
        match &node.storage {
            PoolStorage::Dummy => unreachable!(),
            PoolStorage::Libc { chunks } => {
                let chunk = chunks[buf.area as usize].as_ref().expect("freed chunk");
                f(&chunk[start..end])
            }
            PoolStorage::Linear { areas, .. } => f(&areas[buf.area as usize].buf[start..end]),
            PoolStorage::Slice { areas, .. } => {
                let pool = self.slice_pool.as_ref().unwrap();
                pool.with_read(&areas[buf.area as usize].0, |data| f(&data[start..end]))
            }
        }
    }

    pub fn with_write<R>(&mut self, buf: &PoolBuf, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let slice_pool = self.slice_pool.clone();
        let node = self.node_mut(buf.pool);
        let start = buf.offset as usize;
        let end = start + buf.len as usize;
        match &mut node.storage {
            PoolStorage::Dummy => unreachable!(),
            PoolStorage::Libc { chunks } => {
                let chunk = chunks[buf.area as usize].as_mut().expect("freed chunk");
                f(&mut chunk[start..end])
            }
            PoolStorage::Linear { areas, .. } => {
                f(&mut areas[buf.area as usize].buf[start..end])
            }
            PoolStorage::Slice { areas, .. } => {
                let pool = slice_pool.as_ref().unwrap();
                pool.with_write(&areas[buf.area as usize].0, |data| f(&mut data[start..end]))
            }
        }
    }

    /// Copy `data` into the pool
    pub fn memdup(&mut self, id: PoolId, data: &[u8]) -> PoolBuf {
        let buf = self.alloc(id, data.len());
        self.with_write(&buf, |dest| dest.copy_from_slice(data));
        buf
    }

    pub fn strdup(&mut self, id: PoolId, s: &str) -> PoolBuf {
        self.memdup(id, s.as_bytes())
    }

    pub fn sprintf(&mut self, id: PoolId, args: std::fmt::Arguments<'_>) -> PoolBuf {
        let s = args.to_string();
        self.memdup(id, s.as_bytes())
    }

    /// Free one allocation.
    ///
    /// Only meaningful for Libc pools; for the arena kinds this merely
    /// adjusts the accounting, the memory is reclaimed when the pool dies.
    pub fn free(&mut self, buf: PoolBuf) {
        let aligned = align_size(buf.len().max(1));
        let node = self.node_mut(buf.pool);
        node.netto_size = node.netto_size.saturating_sub(aligned);
        match &mut node.storage {
            PoolStorage::Libc { chunks } => {
                chunks[buf.area as usize] = None;
            }
            _ => {
                debug_assert!(false, "free on non-libc pool '{}'", node.name);
            }
        }
    }

    pub fn netto_size(&self, id: PoolId) -> usize {
        self.node(id).netto_size
    }

    pub fn parent(&self, id: PoolId) -> Option<PoolId> {
        self.node(id).parent
    }

    pub fn refcount(&self, id: PoolId) -> usize {
        self.node(id).refcount
    }

    pub fn is_trashed(&self, id: PoolId) -> bool {
        self.node(id).trashed
    }

    fn leak_ref(&mut self, id: PoolId) {
        self.node_mut(id).leak_count += 1;
    }

    fn leak_unref(&mut self, id: PoolId) {
        if let Some(node) = self.nodes[id.0 as usize].as_mut() {
            node.leak_count -= 1;
        }
    }

    /// Recursive tree dump for the control channel
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if let Some(node) = node {
                if node.parent.is_none() && !node.trashed {
                    self.dump_node(&mut out, PoolId(i as u32), 0);
                }
            }
        }
        if !self.trash.is_empty() {
            let _ = writeln!(out, "trash: {} pools", self.trash.len());
        }
        out
    }

    fn dump_node(&self, out: &mut String, id: PoolId, depth: usize) {
        let node = self.node(id);
        let _ = writeln!(
            out,
            "{}{} refs={} netto={}",
            "  ".repeat(depth),
            node.name,
            node.refcount,
            node.netto_size
        );
        for &child in &node.children {
            self.dump_node(out, child, depth + 1);
        }
    }
}

/// RAII reference to a pool: drops one refcount when it goes away
pub struct PoolRef {
    tree: SharedPoolTree,
    id: PoolId,
}

impl PoolRef {
    pub fn new(tree: SharedPoolTree, id: PoolId) -> Self {
        Self { tree, id }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn tree(&self) -> &SharedPoolTree {
        &self.tree
    }
}

impl Drop for PoolRef {
    fn drop(&mut self) {
        if let Ok(mut tree) = self.tree.lock() {
            tree.unref(self.id);
        }
    }
}

/// RAII guard detecting objects that outlive their pool.
///
/// Destroying a pool that still has a live detector is a bug and panics
/// in debug builds.
pub struct PoolLeakDetector {
    tree: SharedPoolTree,
    pool: PoolId,
}

impl PoolLeakDetector {
    pub fn new(tree: SharedPoolTree, pool: PoolId) -> Self {
        tree.lock().unwrap().leak_ref(pool);
        Self { tree, pool }
    }
}

impl Drop for PoolLeakDetector {
    fn drop(&mut self) {
        // tolerate a poisoned tree so unwinding stays single-panic
        if let Ok(mut tree) = self.tree.lock() {
            tree.leak_unref(self.pool);
        }
    }
}
