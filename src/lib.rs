//! A buddy-allocation heap over a caller-supplied byte region.
//!
//! The region is laid out as `[header | node array | storage area]`. The
//! node array encodes a complete binary tree whose leaves tile the storage
//! area: allocation splits free blocks down to the smallest power of two
//! that fits the request, and freeing coalesces buddy blocks back up the
//! tree. Reallocation snapshots the tree into per-node backup bits so a
//! failed move rolls back without a trace.
//!
//! Every operation takes the region base explicitly; the allocator keeps no
//! state of its own and never touches memory outside the region.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

mod heap;
mod tree;

use core::cmp;
use core::fmt;
use core::ptr::{self, NonNull};

use crate::heap::Heap;
use crate::tree::Status;

/// A capability that grows the linear byte region backing a heap, in the
/// manner of `sbrk(2)`.
pub trait Sbrk {
    /// Extends the region by `increment` bytes and returns a pointer to the
    /// previous end of the region.
    fn sbrk(&mut self, increment: i32) -> *mut u8;
}

/// Returned by [`virtual_free`] when the pointer is null, outside the
/// region, or does not begin a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidPointer;

impl fmt::Display for InvalidPointer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("pointer does not begin a block in the storage area")
    }
}

/// Initialises the allocator over the region beginning at `heapstart`,
/// reserving the header, the node array, and `2^initial_size` bytes of
/// storage through `sbrk`. Must be called exactly once per region, before
/// any other operation on it.
///
/// # Panicking
///
/// Panics unless `min_size <= initial_size <= 63`.
///
/// # Unsafety
///
/// `heapstart` must be the current end of the region grown by `sbrk`, and
/// the region must stay valid for as long as the allocator is used on it.
pub unsafe fn init_allocator<S: Sbrk>(
    heapstart: *mut u8,
    sbrk: &mut S,
    initial_size: u8,
    min_size: u8,
) {
    // first header byte, then the rest of the overhead, then the storage
    sbrk.sbrk(1);
    let heap = Heap::format(heapstart, initial_size, min_size);
    sbrk.sbrk((heap.overhead() - 1) as i32);
    sbrk.sbrk((1usize << initial_size) as i32);

    debug!(
        "vheap: formatted a 2^{} byte region, minimum block 2^{} bytes",
        initial_size, min_size
    );
}

/// Requests a block of at least `size` bytes, returning a pointer into the
/// storage area. Requests below the minimum block size are rounded up to
/// it; requests above the region size fail. Returns `None` when no free
/// block can satisfy the request, leaving the tree unchanged.
///
/// # Unsafety
///
/// `heapstart` must point to a region initialised by [`init_allocator`].
pub unsafe fn virtual_malloc(heapstart: *mut u8, size: u32) -> Option<NonNull<u8>> {
    let mut heap = Heap::from_raw(heapstart);

    let size = if (size as usize) < (1usize << heap.min_size()) {
        1usize << heap.min_size()
    } else if (size as usize) > (1usize << heap.cur_size()) {
        debug!("vheap: rejecting an over-size request of {} bytes", size);
        return None;
    } else {
        size as usize
    };

    let log_size = tree::log2_ceil(size as u64);

    let storage = heap.storage();
    let mut tree = heap.tree();
    tree.grow(log_size);

    let node = match tree.find_node(Some(tree.root()), log_size) {
        Some(node) => node,
        None => {
            debug!("vheap: out of memory for a {} byte request", size);
            return None;
        }
    };

    tree.set_status(node, Status::Alloc);
    let offset = tree
        .node_to_address(node)
        .expect("an allocated leaf must map to a storage offset");

    trace!(
        "vheap: allocated {} bytes at offset {}",
        1usize << log_size,
        offset
    );
    NonNull::new(storage.add(offset))
}

/// Returns the block beginning at `ptr` to the free pool and coalesces
/// buddies as far up the tree as possible. Fails without touching the tree
/// when `ptr` does not begin a block.
///
/// # Unsafety
///
/// As for [`virtual_malloc`].
pub unsafe fn virtual_free(heapstart: *mut u8, ptr: *mut u8) -> Result<(), InvalidPointer> {
    if ptr.is_null() || (ptr as usize) < (heapstart as usize) {
        return Err(InvalidPointer);
    }

    let mut heap = Heap::from_raw(heapstart);
    let storage = heap.storage() as usize;
    let offset = (ptr as usize).checked_sub(storage).ok_or(InvalidPointer)?;

    let mut tree = heap.tree();
    let node = tree.address_to_node(offset).ok_or(InvalidPointer)?;

    tree.set_status(node, Status::Free);
    let root = tree.root();
    tree.prune(root);

    trace!("vheap: freed the block at offset {}", offset);
    Ok(())
}

/// Moves the allocation at `ptr` to a block of at least `size` bytes,
/// copying the smaller of the old and new payload sizes. On any failure the
/// tree is rolled back to its pre-call state, the original block left
/// standing, and `None` returned.
///
/// # Unsafety
///
/// As for [`virtual_malloc`]; additionally `ptr` must not be aliased by a
/// live borrow, since the payload bytes are moved.
pub unsafe fn virtual_realloc(heapstart: *mut u8, ptr: *mut u8, size: u32) -> Option<NonNull<u8>> {
    backup(heapstart);

    // resolve the old block before freeing it: the node's position still
    // gives the old payload size after its status changes
    let old_bytes = match resolve(heapstart, ptr) {
        Some(bytes) => bytes,
        None => {
            debug!("vheap: realloc rolled back: invalid pointer");
            rollback(heapstart);
            return None;
        }
    };

    if virtual_free(heapstart, ptr).is_err() {
        rollback(heapstart);
        return None;
    }

    let new_ptr = match virtual_malloc(heapstart, size) {
        Some(new_ptr) => new_ptr,
        None => {
            debug!("vheap: realloc to {} bytes rolled back", size);
            rollback(heapstart);
            return None;
        }
    };

    // the old and new blocks can overlap, so the copy must be a memmove
    ptr::copy(ptr, new_ptr.as_ptr(), cmp::min(old_bytes, size as usize));
    commit(heapstart);

    Some(new_ptr)
}

/// Writes the current partition of the storage area to `out`, one line per
/// block in left-to-right order: `allocated <bytes>` or `free <bytes>`.
///
/// # Unsafety
///
/// As for [`virtual_malloc`].
pub unsafe fn virtual_info<W: fmt::Write>(heapstart: *mut u8, out: &mut W) -> fmt::Result {
    let mut heap = Heap::from_raw(heapstart);
    let tree = heap.tree();
    tree.write_blocks(Some(tree.root()), out)
}

/// Snapshots every active node's status into its backup bits.
unsafe fn backup(heapstart: *mut u8) {
    let mut heap = Heap::from_raw(heapstart);
    let mut tree = heap.tree();
    let root = tree.root();
    tree.backup_tree(Some(root));
}

/// Rolls every status back to the snapshot and clears it.
unsafe fn rollback(heapstart: *mut u8) {
    let mut heap = Heap::from_raw(heapstart);
    let mut tree = heap.tree();
    let root = tree.root();
    tree.restore_tree(Some(root));
}

/// Discards the snapshot, leaving statuses as they are.
unsafe fn commit(heapstart: *mut u8) {
    let mut heap = Heap::from_raw(heapstart);
    let mut tree = heap.tree();
    let root = tree.root();
    tree.clear_backups(Some(root));
}

/// Byte size of the block beginning exactly at `ptr`, if there is one.
unsafe fn resolve(heapstart: *mut u8, ptr: *mut u8) -> Option<usize> {
    if ptr.is_null() {
        return None;
    }

    let mut heap = Heap::from_raw(heapstart);
    let storage = heap.storage() as usize;
    let offset = (ptr as usize).checked_sub(storage)?;

    let tree = heap.tree();
    let node = tree.address_to_node(offset)?;
    Some(1usize << tree.order(node))
}
