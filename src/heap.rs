//! The heap region: `[header | node array | storage area]`.
//!
//! The two header bytes hold the minimum and current block orders; the node
//! array for the complete buddy tree follows immediately, and the storage
//! area that user allocations are cut from begins at `base + overhead`.

use core::slice;

use crate::tree::{self, Status, Tree};

/// Bytes of header (`min_size`, then `cur_size`) in front of the node array.
pub const HEADER_BYTES: usize = 2;

/// Largest permitted root order. Byte sizes and offsets are `usize`, so the
/// order has to stay below the shift width.
pub const MAX_ORDER_LIMIT: u8 = 63;

const_assert!(order_below_shift_width; MAX_ORDER_LIMIT < 64);

/// A view of an initialised heap region. Constructing one is the only
/// unsafe step; all tree work afterwards happens through safe borrows.
pub struct Heap<'a> {
    base: *mut u8,
    min_size: u8,
    cur_size: u8,
    nodes: &'a mut [u8],
}

impl<'a> Heap<'a> {
    /// Materialises a view of the region at `heapstart`.
    ///
    /// # Unsafety
    ///
    /// `heapstart` must point to a region set up by [`Heap::format`], the
    /// region must stay valid for the view's lifetime, and no other view of
    /// it may be live.
    pub unsafe fn from_raw(heapstart: *mut u8) -> Heap<'a> {
        let min_size = *heapstart;
        let cur_size = *heapstart.add(1);
        debug_assert!(min_size <= cur_size && cur_size <= MAX_ORDER_LIMIT);

        let nodes = slice::from_raw_parts_mut(
            heapstart.add(HEADER_BYTES),
            tree::nodes_in_tree(cur_size - min_size + 1),
        );

        Heap {
            base: heapstart,
            min_size,
            cur_size,
            nodes,
        }
    }

    /// Writes a fresh header and node array at `heapstart`: the root free,
    /// every other node inactive.
    ///
    /// # Panicking
    ///
    /// Panics unless `min_size <= cur_size <= MAX_ORDER_LIMIT`.
    ///
    /// # Unsafety
    ///
    /// As for [`Heap::from_raw`], except that the region's contents need
    /// not be initialised yet.
    pub unsafe fn format(heapstart: *mut u8, cur_size: u8, min_size: u8) -> Heap<'a> {
        assert!(
            min_size <= cur_size,
            "minimum block order {} exceeds the region order {}",
            min_size,
            cur_size,
        );
        assert!(
            cur_size <= MAX_ORDER_LIMIT,
            "region order {} exceeds the maximum of {}",
            cur_size,
            MAX_ORDER_LIMIT,
        );

        *heapstart = min_size;
        *heapstart.add(1) = cur_size;

        let mut heap = Heap::from_raw(heapstart);
        for byte in heap.nodes.iter_mut() {
            *byte = 0;
        }

        let mut tree = heap.tree();
        let root = tree.root();
        tree.set_status(root, Status::Free);

        heap
    }

    pub fn min_size(&self) -> u8 {
        self.min_size
    }

    pub fn cur_size(&self) -> u8 {
        self.cur_size
    }

    /// Bytes reserved in front of the storage area for the header and the
    /// complete node array.
    pub fn overhead(&self) -> usize {
        HEADER_BYTES + (1 << (self.cur_size - self.min_size + 1) as usize)
    }

    /// First byte of the storage area.
    pub fn storage(&self) -> *mut u8 {
        unsafe { self.base.add(self.overhead()) }
    }

    /// The buddy tree over this region's node array.
    pub fn tree(&mut self) -> Tree<'_> {
        Tree::new(&mut self.nodes[..], self.cur_size, self.min_size)
    }
}
