//! The buddy layout tree: a complete binary tree of single-byte nodes
//! describing how the storage area is currently partitioned.
//!
//! Nodes live in a flat byte array and the tree is implicit in the indices:
//! for a node `i`, the children are `2i + 1` and `2i + 2` and the parent is
//! `(i - 1) / 2`. Each byte packs two 2-bit fields: the node's status and a
//! backup of a prior status used to roll a failed reallocation back.

use core::fmt::{self, Write};

use bit_field::BitField;

/// Allocation state of a node, held in bits 0–1 of the node byte. The same
/// alphabet is kept in bits 2–3 as the rollback backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Not part of the current partition: an ancestor is a block, or the
    /// node lies beyond the depth cut.
    Inactive = 0,
    /// A free block of exactly `2^order` bytes.
    Free = 1,
    /// An allocated block of exactly `2^order` bytes.
    Alloc = 2,
    /// Split: both children are active.
    Parent = 3,
}

impl Status {
    fn from_bits(bits: u8) -> Status {
        match bits {
            1 => Status::Free,
            2 => Status::Alloc,
            3 => Status::Parent,
            _ => Status::Inactive,
        }
    }
}

/// Index of a node in the flat tree array. The root is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

/// Number of nodes in a complete tree of `levels` levels.
pub const fn nodes_in_tree(levels: u8) -> usize {
    (1 << levels as usize) - 1
}

/// The buddy tree over a borrowed node array.
pub struct Tree<'a> {
    nodes: &'a mut [u8],
    /// Order of the root block, i.e. log2 of the whole storage area.
    max_order: u8,
    /// Order of the smallest block the tree may be split down to.
    min_order: u8,
}

impl<'a> Tree<'a> {
    pub fn new(nodes: &'a mut [u8], max_order: u8, min_order: u8) -> Tree<'a> {
        debug_assert!(min_order <= max_order);
        debug_assert_eq!(nodes.len(), nodes_in_tree(max_order - min_order + 1));

        Tree {
            nodes,
            max_order,
            min_order,
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// The node at `index`, if the index lies within the tree array.
    fn in_tree(&self, index: usize) -> Option<NodeId> {
        if index < self.nodes.len() {
            Some(NodeId(index))
        } else {
            None
        }
    }

    fn left(&self, node: NodeId) -> Option<NodeId> {
        self.in_tree(2 * node.0 + 1)
    }

    fn right(&self, node: NodeId) -> Option<NodeId> {
        self.in_tree(2 * node.0 + 2)
    }

    /// Status of a possibly-absent node. Absent nodes report `Inactive` so
    /// that walks terminate uniformly at the edge of the tree.
    pub fn status(&self, node: Option<NodeId>) -> Status {
        match node {
            Some(node) => Status::from_bits(self.nodes[node.0].get_bits(0..2)),
            None => Status::Inactive,
        }
    }

    /// Backed-up status of a possibly-absent node.
    pub fn backup(&self, node: Option<NodeId>) -> Status {
        match node {
            Some(node) => Status::from_bits(self.nodes[node.0].get_bits(2..4)),
            None => Status::Inactive,
        }
    }

    pub fn set_status(&mut self, node: NodeId, status: Status) {
        self.nodes[node.0].set_bits(0..2, status as u8);
    }

    pub fn set_backup(&mut self, node: NodeId, status: Status) {
        self.nodes[node.0].set_bits(2..4, status as u8);
    }

    fn is_valid(&self, node: Option<NodeId>) -> bool {
        self.status(node) != Status::Inactive
    }

    /// Order (log2 of the byte size) of the block a node stands for:
    /// `max_order` at the root, one less per level of depth.
    pub fn order(&self, node: NodeId) -> u8 {
        self.max_order - log2_floor(node.0 as u64 + 1)
    }

    /// Leftmost free node of exactly `target` order, if one exists.
    pub fn find_node(&self, node: Option<NodeId>, target: u8) -> Option<NodeId> {
        let node = node?;

        match self.status(Some(node)) {
            Status::Inactive => None,
            Status::Free if self.order(node) == target => Some(node),
            _ => self
                .find_node(self.left(node), target)
                .or_else(|| self.find_node(self.right(node), target)),
        }
    }

    /// Ensures a free node of exactly `target` order exists by splitting the
    /// smallest sufficient free block downward, leftmost first.
    ///
    /// The upward probe happens before any split, so when no free block of
    /// at least `target` order exists the tree is left untouched.
    pub fn grow(&mut self, target: u8) {
        let mut node = None;
        let mut order = target;
        while node.is_none() && order <= self.max_order {
            node = self.find_node(Some(self.root()), order);
            order += 1;
        }

        if let Some(node) = node {
            let curr = self.order(node);
            if curr > target && curr > self.min_order {
                trace!("vheap: splitting a 2^{} byte block", curr);
                self.split(node);
                self.grow(target);
            }
        }
    }

    fn split(&mut self, node: NodeId) {
        if let (Some(left), Some(right)) = (self.left(node), self.right(node)) {
            self.set_status(left, Status::Free);
            self.set_status(right, Status::Free);
            self.set_status(node, Status::Parent);
        }
    }

    /// Bottom-up coalesce: wherever both children are free, the parent
    /// becomes the block again and the children leave the partition.
    pub fn prune(&mut self, node: NodeId) {
        if let (Some(left), Some(right)) = (self.left(node), self.right(node)) {
            if self.is_valid(Some(left)) && self.is_valid(Some(right)) {
                self.prune(left);
                self.prune(right);

                if self.status(Some(left)) == Status::Free
                    && self.status(Some(right)) == Status::Free
                {
                    self.set_status(node, Status::Free);
                    self.set_status(left, Status::Inactive);
                    self.set_status(right, Status::Inactive);
                }
            }
        }
    }

    /// Copies every active node's status into its backup bits.
    pub fn backup_tree(&mut self, node: Option<NodeId>) {
        if let Some(node) = node {
            let status = self.status(Some(node));
            if status != Status::Inactive {
                self.set_backup(node, status);
                self.backup_tree(self.left(node));
                self.backup_tree(self.right(node));
            }
        }
    }

    /// Copies backup bits back into statuses and zeroes them, descending
    /// through every node whose backup is non-zero even when its current
    /// status is inactive.
    pub fn restore_tree(&mut self, node: Option<NodeId>) {
        if let Some(node) = node {
            let backup = self.backup(Some(node));
            if backup != Status::Inactive {
                self.set_status(node, backup);
                self.set_backup(node, Status::Inactive);
                self.restore_tree(self.left(node));
                self.restore_tree(self.right(node));
            }
        }
    }

    /// Zeroes backup bits without touching statuses, discarding a snapshot
    /// that is no longer needed.
    pub fn clear_backups(&mut self, node: Option<NodeId>) {
        if let Some(node) = node {
            if self.backup(Some(node)) != Status::Inactive {
                self.set_backup(node, Status::Inactive);
                self.clear_backups(self.left(node));
                self.clear_backups(self.right(node));
            }
        }
    }

    /// Byte offset into the storage area of the block leaf `target`, by
    /// in-order walk over the block leaves.
    pub fn node_to_address(&self, target: NodeId) -> Option<usize> {
        let mut bytes = 0;
        self.offset_of(Some(self.root()), target, &mut bytes)
    }

    // The left subtree must be fully walked before the right so that the
    // accumulator counts every block leaf exactly once; `or_else` gives
    // that ordering.
    fn offset_of(&self, node: Option<NodeId>, target: NodeId, bytes: &mut usize) -> Option<usize> {
        let node = node?;

        match self.status(Some(node)) {
            Status::Free | Status::Alloc => {
                if node == target {
                    Some(*bytes)
                } else {
                    *bytes += 1usize << self.order(node);
                    None
                }
            }
            Status::Parent => self
                .offset_of(self.left(node), target, bytes)
                .or_else(|| self.offset_of(self.right(node), target, bytes)),
            Status::Inactive => None,
        }
    }

    /// The block leaf whose storage offset is exactly `offset`, if any.
    pub fn address_to_node(&self, offset: usize) -> Option<NodeId> {
        let mut bytes = 0;
        self.node_at(Some(self.root()), offset, &mut bytes)
    }

    fn node_at(&self, node: Option<NodeId>, target: usize, bytes: &mut usize) -> Option<NodeId> {
        let node = node?;

        match self.status(Some(node)) {
            Status::Free | Status::Alloc => {
                if *bytes == target {
                    Some(node)
                } else {
                    *bytes += 1usize << self.order(node);
                    None
                }
            }
            Status::Parent => self
                .node_at(self.left(node), target, bytes)
                .or_else(|| self.node_at(self.right(node), target, bytes)),
            Status::Inactive => None,
        }
    }

    /// Writes one `allocated <bytes>` / `free <bytes>` line per block leaf,
    /// in storage order.
    pub fn write_blocks<W: Write>(&self, node: Option<NodeId>, out: &mut W) -> fmt::Result {
        if let Some(node) = node {
            match self.status(Some(node)) {
                Status::Free => writeln!(out, "free {}", 1usize << self.order(node))?,
                Status::Alloc => writeln!(out, "allocated {}", 1usize << self.order(node))?,
                Status::Parent => {
                    self.write_blocks(self.left(node), out)?;
                    self.write_blocks(self.right(node), out)?;
                }
                Status::Inactive => {}
            }
        }

        Ok(())
    }
}

/// log2 of `val`, rounded up.
pub fn log2_ceil(val: u64) -> u8 {
    let log2 = log2_floor(val);
    if val != (1u64 << log2) {
        log2 + 1
    } else {
        log2
    }
}

/// log2 of `val`, rounded down.
pub fn log2_floor(mut val: u64) -> u8 {
    let mut log2 = 0;
    while val > 1 {
        val >>= 1;
        log2 += 1;
    }
    log2
}

#[cfg(test)]
impl<'a> Tree<'a> {
    /// Walks the whole partition, panicking if any structural invariant is
    /// broken, and checks that the block leaves exactly tile the storage
    /// area.
    pub(crate) fn check_invariants(&self) {
        assert_ne!(
            self.status(Some(self.root())),
            Status::Inactive,
            "the root must always be active",
        );

        let mut bytes = 0;
        self.check_node(self.root(), &mut bytes);
        assert_eq!(
            bytes,
            1usize << self.max_order,
            "block leaves must tile the storage area",
        );

        for (index, byte) in self.nodes.iter().enumerate() {
            assert_eq!(byte.get_bits(4..8), 0, "node {} has dirty upper bits", index);
        }
    }

    fn check_node(&self, node: NodeId, bytes: &mut usize) {
        let left = self.left(node);
        let right = self.right(node);

        match self.status(Some(node)) {
            Status::Parent => {
                assert!(
                    self.is_valid(left) && self.is_valid(right),
                    "a parent must have two active children",
                );
                assert!(
                    self.order(node) > self.min_order,
                    "a minimum-order node must never be split",
                );
                self.check_node(left.unwrap(), bytes);
                self.check_node(right.unwrap(), bytes);
            }
            Status::Free | Status::Alloc => {
                assert!(
                    !self.is_valid(left) && !self.is_valid(right),
                    "a block leaf must have inactive children",
                );
                *bytes += 1usize << self.order(node);
            }
            Status::Inactive => panic!("reached an inactive node from an active parent"),
        }
    }

    /// Copy of the raw node bytes, for before/after comparisons.
    pub(crate) fn snapshot(&self) -> std::vec::Vec<u8> {
        self.nodes.to_vec()
    }

    /// Panics if any node still carries a backup.
    pub(crate) fn assert_backups_clear(&self) {
        for (index, byte) in self.nodes.iter().enumerate() {
            assert_eq!(byte.get_bits(2..4), 0, "node {} still has a backup", index);
        }
    }

    /// Renders `status -> backup` for every node that has either set, in a
    /// box-drawing layout, for structural assertions.
    pub(crate) fn version_tree(&self) -> std::string::String {
        let mut out = std::string::String::new();
        self.version_node(Some(self.root()), "", true, &mut out);
        out
    }

    fn version_node(
        &self,
        node: Option<NodeId>,
        prefix: &str,
        last: bool,
        out: &mut std::string::String,
    ) {
        if let Some(node) = node {
            let status = self.status(Some(node));
            let backup = self.backup(Some(node));

            if status != Status::Inactive || backup != Status::Inactive {
                let current = if last { "└─ " } else { "├─ " };
                let child = if last { "   " } else { "|  " };

                writeln!(out, "{}{}{} -> {}", prefix, current, status as u8, backup as u8)
                    .unwrap();

                let prefix = std::format!("{}{}", prefix, child);
                self.version_node(self.left(node), &prefix, false, out);
                self.version_node(self.right(node), &prefix, true, out);
            }
        }
    }
}
