//! Pointer chains: the link arena and the layouts that wire it into a cycle.
//!
//! A chain is one contiguous, page aligned block of [`Link`] slots owned by a
//! single worker. Layout generators only produce a sequence of slot indices;
//! [`ChainMemory::link`] turns any such sequence into a closed cycle.
mod random;

use std::{mem, ptr::null_mut};

use anyhow::bail;

use crate::experiment::{AccessPattern, ChainGeometry, Experiment};
use crate::numa::NumaPlacement;
use crate::util::Rng;

pub use self::random::{RandomSlots, PRIME_TABLE};

/// One chain node. The layout is fixed since generated code dereferences
/// `next` at [`NEXT_OFFSET`].
#[repr(C)]
#[derive(Debug)]
pub struct Link {
    pub next: *const Link,
}

pub const NEXT_OFFSET: usize = mem::offset_of!(Link, next);

/// Entry point of a linked chain and the number of links on its cycle.
#[derive(Debug, Clone, Copy)]
pub struct ChainRoot {
    pub root: *const Link,
    pub ops: u64,
}

/// An mmap-backed arena of link slots, unmapped on drop.
#[derive(Debug)]
pub struct ChainMemory {
    ptr: *mut Link,
    links: usize,
}

// The arena is only ever touched by the worker owning it.
unsafe impl Send for ChainMemory {}

impl ChainMemory {
    /// Maps `links` slots, binds them to NUMA domain `node` and touches them
    /// so every page is faulted in before any timing starts.
    ///
    /// A failed NUMA binding is logged and the memory stays wherever the
    /// kernel puts it.
    pub fn new(links: usize, node: usize, numa: &dyn NumaPlacement) -> anyhow::Result<Self> {
        if links == 0 {
            bail!("refusing to map an empty chain");
        }
        let len = links * mem::size_of::<Link>();
        let p = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            bail!(
                "mmap of {} bytes failed: {}",
                len,
                std::io::Error::last_os_error()
            );
        }
        if let Err(e) = numa.bind_memory(p as *mut u8, len, node) {
            warn!("Failed to bind chain memory to domain {}: {}", node, e);
        }
        // first touch after binding, all `next` pointers start out null
        unsafe { libc::memset(p, 0x00, len) };
        Ok(ChainMemory {
            ptr: p as *mut Link,
            links,
        })
    }

    /// Number of link slots.
    pub fn len(&self) -> usize {
        self.links
    }

    pub fn is_empty(&self) -> bool {
        self.links == 0
    }

    pub fn slot(&self, index: usize) -> *mut Link {
        assert!(
            index < self.links,
            "ChainMemory::slot failed. Index {} >= {}",
            index,
            self.links
        );
        unsafe { self.ptr.add(index) }
    }

    /// Slot index of `link`, or `None` if it does not point into this arena.
    pub fn index_of(&self, link: *const Link) -> Option<usize> {
        let base = self.ptr as usize;
        let addr = link as usize;
        let size = mem::size_of::<Link>();
        if addr < base || addr >= base + self.links * size || (addr - base) % size != 0 {
            return None;
        }
        Some((addr - base) / size)
    }

    /// Wires `slots` into a cycle in visiting order and closes it back to the
    /// first slot. Returns `None` for an empty sequence.
    pub fn link(&mut self, slots: impl IntoIterator<Item = usize>) -> Option<ChainRoot> {
        let mut slots = slots.into_iter();
        let root = self.slot(slots.next()?);
        let mut prev = root;
        let mut ops = 1;
        for index in slots {
            let link = self.slot(index);
            unsafe { (*prev).next = link };
            prev = link;
            ops += 1;
        }
        unsafe { (*prev).next = root };
        trace!("Linked {} slots, root at {:p}", ops, root);
        Some(ChainRoot { root, ops })
    }

    /// Slot indices along the cycle starting at `root`, ending before the
    /// walk returns to `root`.
    pub fn walk(&self, root: *const Link) -> Walk<'_> {
        Walk {
            memory: self,
            root,
            cursor: root,
        }
    }
}

impl Drop for ChainMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(
                self.ptr as *mut libc::c_void,
                self.links * mem::size_of::<Link>(),
            )
        };
    }
}

pub struct Walk<'a> {
    memory: &'a ChainMemory,
    root: *const Link,
    cursor: *const Link,
}

impl Iterator for Walk<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let index = self.memory.index_of(self.cursor)?;
        let next = unsafe { (*self.cursor).next };
        self.cursor = if next == self.root { std::ptr::null() } else { next };
        Some(index)
    }
}

/// First link of every `stride`-th line, in increasing order.
pub fn forward_slots(geometry: &ChainGeometry, stride: usize) -> impl Iterator<Item = usize> {
    let links_per_line = geometry.links_per_line;
    (0..geometry.lines_per_chain)
        .step_by(stride.max(1))
        .map(move |line| line * links_per_line)
}

/// The slots of [`forward_slots`] in decreasing order.
pub fn reverse_slots(geometry: &ChainGeometry, stride: usize) -> impl Iterator<Item = usize> {
    let stride = stride.max(1);
    let links_per_line = geometry.links_per_line;
    // largest multiple of the stride still inside the chain
    let last = (geometry.lines_per_chain - 1) / stride * stride;
    (0..=last)
        .rev()
        .step_by(stride)
        .map(move |line| line * links_per_line)
}

/// Lays out one chain in `memory` following the experiment's access pattern.
pub fn build_chain(
    memory: &mut ChainMemory,
    exp: &Experiment,
    rng: &mut Rng,
) -> anyhow::Result<ChainRoot> {
    let geometry = &exp.geometry;
    let stride = exp.stride_lines();
    let root = match exp.access_pattern {
        AccessPattern::Forward => memory.link(forward_slots(geometry, stride)),
        AccessPattern::Reverse => memory.link(reverse_slots(geometry, stride)),
        AccessPattern::Random => memory.link(RandomSlots::new(geometry, rng)),
    };
    match root {
        Some(root) => Ok(root),
        None => bail!("chain layout produced no links"),
    }
}
