//! # Range Cursor
//!
//! A [`RangeIter`] is an inclusive cursor over `[head:b_off, tail:e_off]`
//! in the leaf sibling list, produced by
//! [`BpTree::range`](super::tree::BpTree::range). It stores leaf pointers
//! rather than page handles, so it stays valid across cache evictions and
//! only faults leaves back in when stepped or dereferenced.
//!
//! The cursor is bidirectional: [`next`](RangeIter::next) and
//! [`prev`](RangeIter::prev) move within a leaf and cross sibling links at
//! the edges; walking off either end of the chain, or past either bound,
//! makes the cursor invalid. [`seek_beg`](RangeIter::seek_beg) and
//! [`seek_end`](RangeIter::seek_end) rewind to the bounds.

use eyre::{bail, Result};

use super::node::leaf_of;
use super::tree::BpTree;
use crate::comparator::{BytewiseComparator, Comparator};
use crate::storage::Ptr;

/// Inclusive cursor over a key range, in comparator order.
pub struct RangeIter<'a, C: Comparator = BytewiseComparator> {
    tree: &'a mut BpTree<C>,
    off: i64,
    b_off: i64,
    e_off: i64,
    cursor: Ptr,
    head: Ptr,
    tail: Ptr,
}

impl<'a, C: Comparator> RangeIter<'a, C> {
    pub(crate) fn new(tree: &'a mut BpTree<C>, head: Ptr, tail: Ptr, beg: i64, end: i64) -> Self {
        Self {
            tree,
            off: beg,
            b_off: beg,
            e_off: end,
            cursor: head,
            head,
            tail,
        }
    }

    /// A cursor that is invalid from the start (empty result).
    pub(crate) fn empty(tree: &'a mut BpTree<C>) -> Self {
        Self {
            tree,
            off: 0,
            b_off: 0,
            e_off: 0,
            cursor: Ptr::NULL,
            head: Ptr::NULL,
            tail: Ptr::NULL,
        }
    }

    /// True while the cursor sits inside `[head:b_off, tail:e_off]`.
    pub fn valid(&self) -> bool {
        if self.cursor.is_null() {
            return false;
        }
        if self.cursor == self.head && self.off < self.b_off {
            return false;
        }
        if self.cursor == self.tail && self.off > self.e_off {
            return false;
        }
        true
    }

    /// Materializes the key under the cursor. Only meaningful while
    /// [`valid`](Self::valid) holds.
    pub fn key(&mut self) -> Result<Vec<u8>> {
        let entry = self.entry()?;
        self.tree.load_data(entry.0)
    }

    /// Materializes the value under the cursor. Only meaningful while
    /// [`valid`](Self::valid) holds.
    pub fn val(&mut self) -> Result<Vec<u8>> {
        let entry = self.entry()?;
        self.tree.load_data(entry.1)
    }

    /// Advances to the next entry, crossing to the right sibling at the
    /// end of the current leaf.
    pub fn next(&mut self) -> Result<()> {
        self.off += 1;
        let Some(page) = self.tree.load_node(self.cursor)? else {
            bail!("range cursor points at a freed node");
        };
        // SAFETY: resident page; shared read.
        let leaf = unsafe { leaf_of(page) };
        if self.off >= leaf.hdr.count as i64 && self.cursor != self.tail {
            self.cursor = leaf.hdr.next;
            self.off = 0;
        }
        Ok(())
    }

    /// Retreats to the previous entry, crossing to the left sibling below
    /// the start of the current leaf. Falling off the front of the chain
    /// invalidates the cursor.
    pub fn prev(&mut self) -> Result<()> {
        self.off -= 1;
        if self.off < 0 && self.cursor != self.head {
            let Some(page) = self.tree.load_node(self.cursor)? else {
                bail!("range cursor points at a freed node");
            };
            // SAFETY: resident page; shared read.
            let prev = unsafe { leaf_of(page) }.hdr.prev;
            let Some(prev_page) = self.tree.load_node(prev)? else {
                self.cursor = Ptr::NULL;
                return Ok(());
            };
            // SAFETY: as above.
            self.off = unsafe { leaf_of(prev_page) }.hdr.count as i64 - 1;
            self.cursor = prev;
        }
        Ok(())
    }

    /// Rewinds to the inclusive lower bound.
    pub fn seek_beg(&mut self) {
        self.cursor = self.head;
        self.off = self.b_off;
    }

    /// Jumps to the inclusive upper bound.
    pub fn seek_end(&mut self) {
        self.cursor = self.tail;
        self.off = self.e_off;
    }

    fn entry(&mut self) -> Result<(Ptr, Ptr)> {
        let Some(page) = self.tree.load_node(self.cursor)? else {
            bail!("range cursor points at a freed node");
        };
        // SAFETY: resident page; shared read.
        let leaf = unsafe { leaf_of(page) };
        let kv = leaf.kv[self.off as usize];
        Ok((kv.key, kv.val))
    }
}
