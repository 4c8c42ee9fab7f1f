//! # Disk-Resident B+Tree
//!
//! The tree lives entirely in the node file: every node is one 4KB index
//! page, and the root pointer sits in the node-file header, so an open
//! store is just two file handles and their caches. Key and value bytes
//! live in the data file; nodes hold pointers only, which fixes the fanout
//! at [`ORDER`](super::node::ORDER) independent of key size, at the cost
//! of a blob load per comparison during descent.
//!
//! ## Insert
//!
//! ```text
//! 1. Store the key and value blobs
//! 2. Walk to the target leaf; an equal key rejects the insert
//! 3. Room left: shift and write in place
//! 4. Full: split around the midpoint, link the new right sibling,
//!    push the sibling's first key up as the separator
//! 5. Parent full too: split it the same way, promoting kc[mid-1].key
//!    and reparenting migrated children; a root split grows the tree
//! ```
//!
//! ## Delete
//!
//! Deletion keeps every non-root node above half occupancy. A leaf (or
//! interior node) that drops to the threshold borrows from or merges with
//! a sibling, chosen by position in the parent and then by occupancy;
//! merges recurse into the parent as separator deletions and collapse the
//! root when its last separator goes.
//!
//! ## Range scans
//!
//! Leaves form a doubly-linked list in comparator order, so a range scan
//! is two descents to pin the end leaves plus a linked-list walk between
//! them; see [`RangeIter`](super::iter::RangeIter) for the boundary rules
//! when either bound is absent.

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::path::Path;
use std::ptr::NonNull;

use eyre::{bail, ensure, Result, WrapErr};

use super::iter::RangeIter;
use super::node::{
    dirty, hdr_of, intl_of, leaf_of, lshift, rshift, IntlNode, KeyChild, KeyVal, LeafNode,
    NODE_INTL, NODE_LEAF,
};
use crate::comparator::{BytewiseComparator, Comparator};
use crate::storage::{DataFile, NodeFile, Page, Ptr};

/// B+tree over one node file and one data file.
pub struct BpTree<C: Comparator = BytewiseComparator> {
    node: NodeFile,
    data: DataFile,
    _cmp: PhantomData<C>,
}

impl<C: Comparator> BpTree<C> {
    /// Opens the tree under `root/name`, formatting both files on first
    /// open. A missing half of an existing pair is treated as a fresh
    /// store and both files are reformatted.
    pub fn open(root: &Path, name: &str) -> Result<Self> {
        ensure!(!name.is_empty(), "empty store name is not allowed");
        std::fs::create_dir_all(root)
            .wrap_err_with(|| format!("failed to create store directory '{}'", root.display()))?;

        let node_path = root.join(format!("{name}.db"));
        let data_path = root.join(format!("{name}.data"));

        if !node_path.exists() || !data_path.exists() {
            NodeFile::format(&node_path)?;
            DataFile::format(&data_path)?;
        }

        Ok(Self {
            node: NodeFile::load(&node_path)?,
            data: DataFile::load(&data_path)?,
            _cmp: PhantomData,
        })
    }

    /// Inserts `key -> val`. Returns false when the key is already present
    /// (no overwrite) or when either file is out of space.
    pub fn put(&mut self, key: &[u8], val: &[u8]) -> Result<bool> {
        if self.root().is_null() {
            let Some((pk, pv)) = self.store_kv(key, val)? else {
                return Ok(false);
            };
            let Some(page) = self.node_alloc(NODE_LEAF)? else {
                self.data.free(pk)?;
                self.data.free(pv)?;
                return Ok(false);
            };
            // SAFETY: freshly allocated resident page, sole live view.
            let leaf = unsafe { leaf_of(page) };
            leaf.hdr.count = 1;
            leaf.kv[0] = KeyVal { key: pk, val: pv };
            dirty(page);
            self.node.kv_inc();
            let root = leaf.hdr.this;
            self.node.set_root(root);
            Ok(true)
        } else {
            let Some(page) = self.search(key)? else {
                bail!("non-null root with no reachable leaf");
            };
            self.leaf_put(page, key, val)
        }
    }

    /// Looks up `key`, returning its value or an empty vector when absent.
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        if let Some(page) = self.search(key)? {
            let (found, pos) = self.leaf_search(page, key)?;
            if found {
                // SAFETY: resident page returned by search.
                let val = unsafe { leaf_of(page) }.kv[pos].val;
                return self.load_data(val);
            }
        }
        Ok(Vec::new())
    }

    pub fn contains(&mut self, key: &[u8]) -> Result<bool> {
        match self.search(key)? {
            Some(page) => Ok(self.leaf_search(page, key)?.0),
            None => Ok(false),
        }
    }

    /// Removes `key` and frees its blobs; absent keys are a no-op.
    pub fn del(&mut self, key: &[u8]) -> Result<()> {
        if let Some(page) = self.search(key)? {
            self.leaf_del(page, key)?;
        }
        Ok(())
    }

    /// Inclusive scan of `[from, to]`, swapping misordered bounds. Bounds
    /// need not be present; see [`RangeIter`] for the adjustment rules.
    pub fn range(&mut self, from: &[u8], to: &[u8]) -> Result<RangeIter<'_, C>> {
        if self.root().is_null() {
            return Ok(RangeIter::empty(self));
        }

        let (from, to) = match C::compare(from, to) {
            Ordering::Greater => (to, from),
            _ => (from, to),
        };

        let Some(pf) = self.search(from)? else {
            bail!("non-null root with no reachable leaf");
        };
        let (from_found, mut beg) = self.leaf_search(pf, from)?;
        let Some(pt) = self.search(to)? else {
            bail!("non-null root with no reachable leaf");
        };
        let (to_found, mut end) = self.leaf_search(pt, to)?;

        // SAFETY: both pages resident; shared reads of their headers.
        let pf_this = unsafe { hdr_of(pf) }.this;
        let pt_this = unsafe { hdr_of(pt) }.this;

        // Both bounds missing inside the same leaf and past its last key:
        // nothing can lie between them.
        if !from_found && !to_found && pf_this == pt_this {
            let count = unsafe { leaf_of(pf) }.hdr.count as usize;
            if beg == count && end == count {
                return Ok(RangeIter::empty(self));
            }
        }

        let mut head_page = pf;
        if !from_found && beg == unsafe { leaf_of(pf) }.hdr.count as usize {
            // The lower bound falls past this leaf; start at the next one.
            let next = unsafe { leaf_of(pf) }.hdr.next;
            let Some(np) = self.load_node(next)? else {
                return Ok(RangeIter::empty(self));
            };
            head_page = np;
            beg = 0;
        }

        let mut tail_page = pt;
        if !to_found {
            if end == 0 {
                // The upper bound falls before this leaf; end at the
                // previous leaf's last key.
                let prev = unsafe { leaf_of(pt) }.hdr.prev;
                let Some(pp) = self.load_node(prev)? else {
                    return Ok(RangeIter::empty(self));
                };
                tail_page = pp;
                end = unsafe { leaf_of(pp) }.hdr.count as usize - 1;
            } else {
                // Clamp to the predecessor within this leaf.
                end -= 1;
            }
        }

        let head = unsafe { hdr_of(head_page) }.this;
        let tail = unsafe { hdr_of(tail_page) }.this;
        Ok(RangeIter::new(self, head, tail, beg as i64, end as i64))
    }

    /// Live entries according to the header counter; O(1).
    pub fn items(&self) -> u64 {
        self.node.nr_kv()
    }

    /// Live entries by walking the leaf chain; O(leaves).
    pub fn count(&mut self) -> Result<u64> {
        let mut cur = self.root();
        if cur.is_null() {
            return Ok(0);
        }

        loop {
            let Some(page) = self.load_node(cur)? else {
                bail!("unreachable node {:#x} on the leftmost spine", cur.raw());
            };
            // SAFETY: resident page; shared read.
            let hdr = unsafe { hdr_of(page) };
            if hdr.is_leaf() {
                break;
            }
            cur = unsafe { intl_of(page) }.kc[0].child;
        }

        let mut n = 0u64;
        loop {
            let Some(page) = self.load_node(cur)? else {
                bail!("broken leaf chain at {:#x}", cur.raw());
            };
            // SAFETY: resident page; shared read.
            let hdr = unsafe { hdr_of(page) };
            n += hdr.count as u64;
            if hdr.next.is_null() {
                break;
            }
            cur = hdr.next;
        }
        Ok(n)
    }

    /// Flushes both files to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.node.sync()?;
        self.data.sync()
    }

    fn root(&self) -> Ptr {
        self.node.root()
    }

    // ------------------------------------------------------------------
    // node access
    // ------------------------------------------------------------------

    pub(crate) fn load_node(&mut self, id: Ptr) -> Result<Option<NonNull<Page>>> {
        if id.is_null() {
            return Ok(None);
        }
        Ok(Some(self.node.alloc(id)?))
    }

    fn node_alloc(&mut self, kind: u32) -> Result<Option<NonNull<Page>>> {
        let id = self.node.get()?;
        if id.is_null() {
            return Ok(None);
        }
        let page = self.node.alloc(id)?;
        // SAFETY: freshly faulted resident page, sole live view.
        let hdr = unsafe { hdr_of(page) };
        hdr.kind = kind;
        hdr.count = 0;
        hdr.this = id;
        hdr.parent = Ptr::NULL;
        hdr.prev = Ptr::NULL;
        hdr.next = Ptr::NULL;
        dirty(page);
        Ok(Some(page))
    }

    /// Unlinks a node from its sibling list and returns its page to the
    /// allocator.
    fn tree_del(&mut self, page: NonNull<Page>) -> Result<()> {
        // SAFETY: resident page; reads complete before any load below.
        let (this, prev, next) = {
            let hdr = unsafe { hdr_of(page) };
            (hdr.this, hdr.prev, hdr.next)
        };
        if let Some(pp) = self.load_node(prev)? {
            // SAFETY: resident page returned just above.
            unsafe { hdr_of(pp) }.next = next;
            dirty(pp);
        }
        if let Some(np) = self.load_node(next)? {
            // SAFETY: as above.
            unsafe { hdr_of(np) }.prev = prev;
            dirty(np);
        }
        self.node.free(this)
    }

    /// Links `node` into the sibling list right after `head`.
    fn node_append(&mut self, head_page: NonNull<Page>, node_page: NonNull<Page>) -> Result<()> {
        // SAFETY: two distinct resident pages.
        let head = unsafe { hdr_of(head_page) };
        let node = unsafe { hdr_of(node_page) };
        node.prev = head.this;
        node.next = head.next;
        head.next = node.this;
        let link = node.next;
        if let Some(np) = self.load_node(link)? {
            // SAFETY: resident page; distinct from head and node.
            unsafe { hdr_of(np) }.prev = node.this;
            dirty(np);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // blob access
    // ------------------------------------------------------------------

    pub(crate) fn load_data(&mut self, id: Ptr) -> Result<Vec<u8>> {
        self.data.read(id)
    }

    fn store_kv(&mut self, key: &[u8], val: &[u8]) -> Result<Option<(Ptr, Ptr)>> {
        let pk = self.data.store(key)?;
        if pk.is_null() {
            return Ok(None);
        }
        let pv = self.data.store(val)?;
        if pv.is_null() {
            self.data.free(pk)?;
            return Ok(None);
        }
        Ok(Some((pk, pv)))
    }

    fn data_del(&mut self, entry: KeyVal) -> Result<()> {
        self.data.free(entry.key)?;
        self.data.free(entry.val)
    }

    // ------------------------------------------------------------------
    // search
    // ------------------------------------------------------------------

    /// Descends from the root to the leaf that owns `key`. None only for
    /// an empty tree.
    fn search(&mut self, key: &[u8]) -> Result<Option<NonNull<Page>>> {
        let mut cur = self.root();
        while !cur.is_null() {
            let page = self.node.alloc(cur)?;
            // SAFETY: resident page; shared reads during descent.
            if unsafe { hdr_of(page) }.is_leaf() {
                return Ok(Some(page));
            }
            let (found, pos) = self.intl_search(page, key)?;
            // An equal separator sends us right: keys at or above a
            // separator live in the child after it.
            let pos = if found { pos + 1 } else { pos };
            cur = unsafe { intl_of(page) }.kc[pos].child;
        }
        Ok(None)
    }

    /// First position in `[0, n)` whose key compares >= `key`; `n` when
    /// every key is smaller.
    fn bsearch(&mut self, n: usize, key: &[u8], key_at: impl Fn(usize) -> Ptr) -> Result<usize> {
        let mut l: isize = 0;
        let mut r: isize = n as isize - 1;
        while l <= r {
            let m = l + (r - l) / 2;
            let probe = self.load_data(key_at(m as usize))?;
            if C::compare(&probe, key) != Ordering::Less {
                r = m - 1;
            } else {
                l = m + 1;
            }
        }
        Ok(l as usize)
    }

    fn leaf_search(&mut self, page: NonNull<Page>, key: &[u8]) -> Result<(bool, usize)> {
        // SAFETY: resident page; read-only view during the search.
        let leaf: &LeafNode = unsafe { leaf_of(page) };
        let n = leaf.hdr.count as usize;
        let pos = self.bsearch(n, key, |i| leaf.kv[i].key)?;
        if pos < n {
            let probe = self.load_data(leaf.kv[pos].key)?;
            if C::compare(&probe, key) == Ordering::Equal {
                return Ok((true, pos));
            }
        }
        Ok((false, pos))
    }

    fn intl_search(&mut self, page: NonNull<Page>, key: &[u8]) -> Result<(bool, usize)> {
        // SAFETY: resident page; read-only view during the search.
        let node: &IntlNode = unsafe { intl_of(page) };
        let n = node.hdr.count as usize - 1;
        let pos = self.bsearch(n, key, |i| node.kc[i].key)?;
        if pos < n {
            let probe = self.load_data(node.kc[pos].key)?;
            if C::compare(&probe, key) == Ordering::Equal {
                return Ok((true, pos));
            }
        }
        Ok((false, pos))
    }

    // ------------------------------------------------------------------
    // insert
    // ------------------------------------------------------------------

    fn leaf_put(&mut self, page: NonNull<Page>, key: &[u8], val: &[u8]) -> Result<bool> {
        let (found, pos) = self.leaf_search(page, key)?;
        if found {
            return Ok(false);
        }

        let Some((pk, pv)) = self.store_kv(key, val)? else {
            return Ok(false);
        };
        let entry = KeyVal { key: pk, val: pv };

        // SAFETY: resident page returned by search.
        let leaf = unsafe { leaf_of(page) };
        if !leaf.is_full() {
            dirty(page);
            let count = leaf.hdr.count as usize;
            rshift(&mut leaf.kv, count, pos);
            leaf.kv[pos] = entry;
            leaf.hdr.count += 1;
            self.node.kv_inc();
            return Ok(true);
        }

        let Some(sibling) = self.leaf_split(page, pos, entry)? else {
            self.data.free(pk)?;
            self.data.free(pv)?;
            return Ok(false);
        };
        // SAFETY: resident page created by leaf_split.
        let sep = unsafe { leaf_of(sibling) }.kv[0].key;
        self.insert_fixup(page, sibling, sep)?;
        Ok(true)
    }

    /// Splits a full leaf around its midpoint while inserting `entry` at
    /// `pos`, and returns the new right sibling. None when no page can be
    /// allocated (the tree is untouched in that case).
    fn leaf_split(
        &mut self,
        page: NonNull<Page>,
        pos: usize,
        entry: KeyVal,
    ) -> Result<Option<NonNull<Page>>> {
        let Some(sib_page) = self.node_alloc(NODE_LEAF)? else {
            return Ok(None);
        };
        self.node_append(page, sib_page)?;

        // SAFETY: two distinct resident pages.
        let leaf = unsafe { leaf_of(page) };
        let sib = unsafe { leaf_of(sib_page) };
        let mid = (leaf.hdr.count / 2) as usize;

        let count = leaf.hdr.count as usize;
        rshift(&mut leaf.kv, count, pos);
        leaf.kv[pos] = entry;
        leaf.hdr.count += 1;
        self.node.kv_inc();

        let total = leaf.hdr.count as usize;
        let moved = total - mid;
        sib.hdr.count = moved as u32;
        sib.kv[..moved].copy_from_slice(&leaf.kv[mid..total]);
        leaf.hdr.count -= moved as u32;

        dirty(page);
        dirty(sib_page);
        Ok(Some(sib_page))
    }

    /// Attaches a freshly split-off right sibling to the tree: grows a new
    /// root when the split node was the root, otherwise inserts the
    /// separator into the shared parent.
    fn insert_fixup(
        &mut self,
        lpage: NonNull<Page>,
        rpage: NonNull<Page>,
        key: Ptr,
    ) -> Result<()> {
        // SAFETY: two distinct resident pages.
        let lhs = unsafe { hdr_of(lpage) };
        let rhs = unsafe { hdr_of(rpage) };

        if lhs.parent.is_null() && rhs.parent.is_null() {
            let Some(ppage) = self.node_alloc(NODE_INTL)? else {
                bail!("node file exhausted while growing the tree root");
            };
            // SAFETY: fresh resident page distinct from both children.
            let parent = unsafe { intl_of(ppage) };
            parent.hdr.count = 2;
            parent.kc[0] = KeyChild {
                key,
                child: lhs.this,
            };
            parent.kc[1].child = rhs.this;

            lhs.parent = parent.hdr.this;
            rhs.parent = parent.hdr.this;

            self.node.set_root(parent.hdr.this);
            dirty(ppage);
            dirty(lpage);
            dirty(rpage);
            Ok(())
        } else {
            ensure!(rhs.parent.is_null(), "fresh sibling already has a parent");
            rhs.parent = lhs.parent;
            dirty(rpage);
            let link = rhs.parent;
            let Some(ppage) = self.load_node(link)? else {
                bail!("dangling parent pointer {:#x}", link.raw());
            };
            self.intl_put(ppage, rpage, key)
        }
    }

    /// Inserts separator `key` (with the child to its right) into an
    /// interior node, splitting it when full.
    fn intl_put(
        &mut self,
        ppage: NonNull<Page>,
        child_page: NonNull<Page>,
        key: Ptr,
    ) -> Result<()> {
        let sep = self.load_data(key)?;
        let (found, pos) = self.intl_search(ppage, &sep)?;
        ensure!(!found, "separator already present at {pos}");

        // SAFETY: two distinct resident pages.
        let child = unsafe { hdr_of(child_page) }.this;
        let parent = unsafe { intl_of(ppage) };

        dirty(ppage);
        if !parent.is_full() {
            let count = parent.hdr.count as usize;
            rshift(&mut parent.kc, count, pos);
            parent.kc[pos].key = key;
            parent.kc[pos + 1].child = child;
            parent.hdr.count += 1;
            return Ok(());
        }

        let (promoted, rpage) = self.intl_split(ppage, child, pos, key)?;
        self.insert_fixup(ppage, rpage, promoted)
    }

    /// Splits a full interior node while inserting `key`/`child` at `pos`.
    /// Returns the promoted separator and the new right sibling.
    fn intl_split(
        &mut self,
        page: NonNull<Page>,
        child: Ptr,
        pos: usize,
        key: Ptr,
    ) -> Result<(Ptr, NonNull<Page>)> {
        let Some(sib_page) = self.node_alloc(NODE_INTL)? else {
            bail!("node file exhausted during an interior split");
        };
        self.node_append(page, sib_page)?;

        // SAFETY: two distinct resident pages.
        let node = unsafe { intl_of(page) };
        let rhs = unsafe { intl_of(sib_page) };
        let mid = ((node.hdr.count + 1) / 2) as usize;

        let count = node.hdr.count as usize;
        rshift(&mut node.kc, count, pos);
        node.kc[pos].key = key;
        node.kc[pos + 1].child = child;
        node.hdr.count += 1;

        let promoted = node.kc[mid - 1].key;

        let moved = node.hdr.count as usize - mid;
        rhs.hdr.count = moved as u32;
        for j in 0..moved {
            rhs.kc[j] = node.kc[mid + j];
            // Migrated children change parents and must know it.
            if let Some(cpage) = self.load_node(rhs.kc[j].child)? {
                // SAFETY: resident page; distinct from node and rhs.
                unsafe { hdr_of(cpage) }.parent = rhs.hdr.this;
                dirty(cpage);
            }
        }
        node.hdr.count -= moved as u32;

        dirty(page);
        dirty(sib_page);
        Ok((promoted, sib_page))
    }

    // ------------------------------------------------------------------
    // delete
    // ------------------------------------------------------------------

    /// Index of the separator in `parent` at or below `key`; -1 when the
    /// key sorts before every separator (leftmost child).
    fn key_index_in_parent(&mut self, ppage: NonNull<Page>, key: Ptr) -> Result<isize> {
        let bytes = self.load_data(key)?;
        let (found, pos) = self.intl_search(ppage, &bytes)?;
        Ok(if found { pos as isize } else { pos as isize - 1 })
    }

    /// Removes `kv[pos]` in place and frees its blobs.
    fn leaf_simple_del(&mut self, page: NonNull<Page>, pos: usize) -> Result<()> {
        // SAFETY: resident page.
        let leaf = unsafe { leaf_of(page) };
        let entry = leaf.kv[pos];
        self.data_del(entry)?;
        let count = leaf.hdr.count as usize;
        lshift(&mut leaf.kv, count, pos);
        leaf.hdr.count -= 1;
        self.node.kv_dec();
        Ok(())
    }

    fn leaf_del(&mut self, page: NonNull<Page>, key: &[u8]) -> Result<()> {
        let (found, pos) = self.leaf_search(page, key)?;
        if !found {
            return Ok(());
        }

        dirty(page);

        // SAFETY: resident page throughout this function; reborrowed
        // after every call that may touch the caches.
        if unsafe { leaf_of(page) }.overhalf() {
            return self.leaf_simple_del(page, pos);
        }

        let parent_link = unsafe { hdr_of(page) }.parent;
        let Some(ppage) = self.load_node(parent_link)? else {
            // Root leaf: the tree dies with its last entry, otherwise it
            // just shrinks in place.
            let leaf = unsafe { leaf_of(page) };
            if leaf.hdr.count == 1 {
                let entry = leaf.kv[0];
                self.data_del(entry)?;
                self.node.kv_dec();
                self.tree_del(page)?;
                self.node.set_root(Ptr::NULL);
                ensure!(
                    self.node.nr_kv() == 0,
                    "kv accounting drift: {} live after the last delete",
                    self.node.nr_kv()
                );
            } else {
                self.leaf_simple_del(page, pos)?;
            }
            return Ok(());
        };

        let first_key = unsafe { leaf_of(page) }.kv[0].key;
        let idx = self.key_index_in_parent(ppage, first_key)?;
        let (prev_link, next_link) = {
            let hdr = unsafe { hdr_of(page) };
            (hdr.prev, hdr.next)
        };
        let lhs = self.load_node(prev_link)?;
        let rhs = self.load_node(next_link)?;
        let parent_count = unsafe { intl_of(ppage) }.hdr.count as isize;
        let go_right = pick_right_sibling(parent_count, idx, lhs, rhs)?;

        self.leaf_simple_del(page, pos)?;

        if go_right {
            let idx = (idx + 1) as usize;
            let Some(rpage) = rhs else {
                bail!("rebalance chose the right sibling but none is linked");
            };
            dirty(rpage);
            if unsafe { leaf_of(rpage) }.overhalf() {
                let parent = unsafe { intl_of(ppage) };
                let leaf = unsafe { leaf_of(page) };
                let r = unsafe { leaf_of(rpage) };
                leaf_borrow_rhs(parent, leaf, r, idx);
                dirty(ppage);
            } else {
                self.leaf_merge_rhs(page, rpage)?;
                self.intl_del(ppage, idx)?;
            }
        } else {
            let idx = idx as usize;
            let Some(lpage) = lhs else {
                bail!("rebalance chose the left sibling but none is linked");
            };
            dirty(lpage);
            if unsafe { leaf_of(lpage) }.overhalf() {
                let parent = unsafe { intl_of(ppage) };
                let leaf = unsafe { leaf_of(page) };
                let l = unsafe { leaf_of(lpage) };
                leaf_borrow_lhs(parent, leaf, l, idx);
                dirty(ppage);
            } else {
                self.leaf_merge_lhs(page, lpage)?;
                self.intl_del(ppage, idx)?;
            }
        }
        Ok(())
    }

    /// Folds the right sibling into `page` and frees it.
    fn leaf_merge_rhs(&mut self, page: NonNull<Page>, rpage: NonNull<Page>) -> Result<()> {
        // SAFETY: two distinct resident pages.
        let leaf = unsafe { leaf_of(page) };
        let r = unsafe { leaf_of(rpage) };
        let count = leaf.hdr.count as usize;
        let rcount = r.hdr.count as usize;
        leaf.kv[count..count + rcount].copy_from_slice(&r.kv[..rcount]);
        leaf.hdr.count += r.hdr.count;
        self.tree_del(rpage)
    }

    /// Folds `page` into its left sibling and frees `page`.
    fn leaf_merge_lhs(&mut self, page: NonNull<Page>, lpage: NonNull<Page>) -> Result<()> {
        // SAFETY: two distinct resident pages.
        let leaf = unsafe { leaf_of(page) };
        let l = unsafe { leaf_of(lpage) };
        let lcount = l.hdr.count as usize;
        let count = leaf.hdr.count as usize;
        l.kv[lcount..lcount + count].copy_from_slice(&leaf.kv[..count]);
        l.hdr.count += leaf.hdr.count;
        self.tree_del(page)
    }

    /// Removes the separator at `pos` from an interior node, rebalancing
    /// or collapsing the root as needed.
    fn intl_del(&mut self, page: NonNull<Page>, pos: usize) -> Result<()> {
        dirty(page);

        // SAFETY: resident page throughout; reborrowed after cache calls.
        if unsafe { intl_of(page) }.overhalf() {
            intl_simple_del(unsafe { intl_of(page) }, pos);
            return Ok(());
        }

        let parent_link = unsafe { hdr_of(page) }.parent;
        let Some(ppage) = self.load_node(parent_link)? else {
            let node = unsafe { intl_of(page) };
            if node.hdr.count == 2 {
                // The last separator of the root is going away; its sole
                // surviving child becomes the new root.
                let child_link = node.kc[0].child;
                let Some(cpage) = self.load_node(child_link)? else {
                    bail!("root child {:#x} unreachable", child_link.raw());
                };
                let child = unsafe { hdr_of(cpage) };
                child.parent = Ptr::NULL;
                let new_root = child.this;
                dirty(cpage);
                self.node.set_root(new_root);
                self.tree_del(page)?;
            } else {
                intl_simple_del(unsafe { intl_of(page) }, pos);
            }
            return Ok(());
        };

        let first_key = unsafe { intl_of(page) }.kc[0].key;
        let idx = self.key_index_in_parent(ppage, first_key)?;
        let (prev_link, next_link) = {
            let hdr = unsafe { hdr_of(page) };
            (hdr.prev, hdr.next)
        };
        let lhs = self.load_node(prev_link)?;
        let rhs = self.load_node(next_link)?;
        let parent_count = unsafe { intl_of(ppage) }.hdr.count as isize;
        let go_right = pick_right_sibling(parent_count, idx, lhs, rhs)?;

        if go_right {
            let idx = (idx + 1) as usize;
            let Some(rpage) = rhs else {
                bail!("rebalance chose the right sibling but none is linked");
            };
            dirty(rpage);
            intl_simple_del(unsafe { intl_of(page) }, pos);
            if unsafe { intl_of(rpage) }.overhalf() {
                self.intl_borrow_rhs(ppage, page, rpage, idx)?;
            } else {
                self.intl_merge_rhs(ppage, page, rpage, idx)?;
                self.intl_del(ppage, idx)?;
            }
        } else {
            let idx = idx as usize;
            let Some(lpage) = lhs else {
                bail!("rebalance chose the left sibling but none is linked");
            };
            dirty(lpage);
            if unsafe { intl_of(lpage) }.overhalf() {
                self.intl_borrow_lhs(ppage, page, lpage, pos, idx)?;
            } else {
                self.intl_merge_lhs(ppage, page, lpage, pos, idx)?;
                self.intl_del(ppage, idx)?;
            }
        }
        Ok(())
    }

    /// Rotates the right sibling's first child through the parent
    /// separator into `page`.
    fn intl_borrow_rhs(
        &mut self,
        ppage: NonNull<Page>,
        page: NonNull<Page>,
        rpage: NonNull<Page>,
        idx: usize,
    ) -> Result<()> {
        // SAFETY: three distinct resident pages.
        let parent = unsafe { intl_of(ppage) };
        let node = unsafe { intl_of(page) };
        let r = unsafe { intl_of(rpage) };

        let count = node.hdr.count as usize;
        node.kc[count - 1].key = parent.kc[idx].key;
        parent.kc[idx].key = r.kc[0].key;

        node.kc[count].child = r.kc[0].child;
        let adopted = r.kc[0].child;
        let Some(cpage) = self.load_node(adopted)? else {
            bail!("borrowed child {:#x} unreachable", adopted.raw());
        };
        // SAFETY: resident page distinct from the three above.
        unsafe { hdr_of(cpage) }.parent = node.hdr.this;
        node.hdr.count += 1;
        dirty(cpage);
        dirty(ppage);

        let rcount = r.hdr.count as usize;
        for i in 0..rcount - 2 {
            r.kc[i].key = r.kc[i + 1].key;
        }
        for i in 0..rcount - 1 {
            r.kc[i].child = r.kc[i + 1].child;
        }
        r.hdr.count -= 1;
        Ok(())
    }

    /// Folds the right sibling into `page` through the parent separator at
    /// `idx`, reparenting every adopted child.
    fn intl_merge_rhs(
        &mut self,
        ppage: NonNull<Page>,
        page: NonNull<Page>,
        rpage: NonNull<Page>,
        idx: usize,
    ) -> Result<()> {
        // SAFETY: three distinct resident pages.
        let parent = unsafe { intl_of(ppage) };
        let node = unsafe { intl_of(page) };
        let r = unsafe { intl_of(rpage) };

        let count = node.hdr.count as usize;
        let rcount = r.hdr.count as usize;

        node.kc[count - 1].key = parent.kc[idx].key;
        for j in 0..rcount - 1 {
            node.kc[count + j].key = r.kc[j].key;
        }
        for j in 0..rcount {
            node.kc[count + j].child = r.kc[j].child;
            if let Some(cpage) = self.load_node(r.kc[j].child)? {
                // SAFETY: resident page distinct from the three above.
                unsafe { hdr_of(cpage) }.parent = node.hdr.this;
                dirty(cpage);
            }
        }
        node.hdr.count += r.hdr.count;
        dirty(ppage);
        self.tree_del(rpage)
    }

    /// Rotates the left sibling's last child through the parent separator
    /// into `page`, absorbing the separator removal at `pos`.
    fn intl_borrow_lhs(
        &mut self,
        ppage: NonNull<Page>,
        page: NonNull<Page>,
        lpage: NonNull<Page>,
        pos: usize,
        idx: usize,
    ) -> Result<()> {
        // SAFETY: three distinct resident pages.
        let parent = unsafe { intl_of(ppage) };
        let node = unsafe { intl_of(page) };
        let l = unsafe { intl_of(lpage) };

        for i in (1..=pos).rev() {
            node.kc[i].key = node.kc[i - 1].key;
        }
        for i in (1..=pos + 1).rev() {
            node.kc[i].child = node.kc[i - 1].child;
        }

        let lcount = l.hdr.count as usize;
        node.kc[0].key = parent.kc[idx].key;
        parent.kc[idx].key = l.kc[lcount - 2].key;
        node.kc[0].child = l.kc[lcount - 1].child;

        let adopted = node.kc[0].child;
        let Some(cpage) = self.load_node(adopted)? else {
            bail!("borrowed child {:#x} unreachable", adopted.raw());
        };
        // SAFETY: resident page distinct from the three above.
        unsafe { hdr_of(cpage) }.parent = node.hdr.this;
        dirty(cpage);
        dirty(ppage);
        l.hdr.count -= 1;
        Ok(())
    }

    /// Folds `page` into its left sibling through the parent separator at
    /// `idx`, dropping the separator at `pos` on the way.
    fn intl_merge_lhs(
        &mut self,
        ppage: NonNull<Page>,
        page: NonNull<Page>,
        lpage: NonNull<Page>,
        pos: usize,
        idx: usize,
    ) -> Result<()> {
        // SAFETY: three distinct resident pages.
        let parent = unsafe { intl_of(ppage) };
        let node = unsafe { intl_of(page) };
        let l = unsafe { intl_of(lpage) };

        let count = node.hdr.count as usize;
        let mut i = l.hdr.count as usize;
        l.kc[i - 1].key = parent.kc[idx].key;
        for j in 0..count - 1 {
            if j != pos {
                l.kc[i].key = node.kc[j].key;
                i += 1;
            }
        }

        let mut i = l.hdr.count as usize;
        for j in 0..count {
            // The separator at pos owns the child at pos + 1; both go.
            if j == pos + 1 {
                continue;
            }
            l.kc[i].child = node.kc[j].child;
            let moved = node.kc[j].child;
            let Some(cpage) = self.load_node(moved)? else {
                bail!("merged child {:#x} unreachable", moved.raw());
            };
            // SAFETY: resident page distinct from the three above.
            unsafe { hdr_of(cpage) }.parent = l.hdr.this;
            dirty(cpage);
            i += 1;
        }

        l.hdr.count += node.hdr.count - 1;
        dirty(ppage);
        self.tree_del(page)
    }
}

/// Picks the sibling to borrow from or merge with: forced right for the
/// leftmost child, forced left for the rightmost, otherwise the fuller of
/// the two.
fn pick_right_sibling(
    parent_count: isize,
    idx: isize,
    lhs: Option<NonNull<Page>>,
    rhs: Option<NonNull<Page>>,
) -> Result<bool> {
    if idx == -1 {
        return Ok(true);
    }
    if idx == parent_count - 2 {
        return Ok(false);
    }
    let (Some(lp), Some(rp)) = (lhs, rhs) else {
        bail!("node missing a sibling inside its parent's span");
    };
    // SAFETY: two resident pages; shared reads.
    Ok(unsafe { hdr_of(lp) }.count < unsafe { hdr_of(rp) }.count)
}

/// Moves the right sibling's first entry to the end of `leaf` and
/// refreshes the parent separator.
fn leaf_borrow_rhs(parent: &mut IntlNode, leaf: &mut LeafNode, r: &mut LeafNode, idx: usize) {
    leaf.kv[leaf.hdr.count as usize] = r.kv[0];
    leaf.hdr.count += 1;

    let rcount = r.hdr.count as usize;
    lshift(&mut r.kv, rcount, 0);
    r.hdr.count -= 1;
    parent.kc[idx].key = r.kv[0].key;
}

/// Moves the left sibling's last entry to the front of `leaf` and
/// refreshes the parent separator.
fn leaf_borrow_lhs(parent: &mut IntlNode, leaf: &mut LeafNode, l: &mut LeafNode, idx: usize) {
    let count = leaf.hdr.count as usize;
    rshift(&mut leaf.kv, count, 0);
    leaf.kv[0] = l.kv[l.hdr.count as usize - 1];
    leaf.hdr.count += 1;
    l.hdr.count -= 1;
    parent.kc[idx].key = leaf.kv[0].key;
}

/// Drops the separator at `pos` and the child to its right, shifting the
/// tail left.
fn intl_simple_del(node: &mut IntlNode, pos: usize) {
    let count = node.hdr.count as usize;
    debug_assert!(count >= 2);
    for i in pos..count - 2 {
        node.kc[i].key = node.kc[i + 1].key;
        node.kc[i + 1].child = node.kc[i + 2].child;
    }
    node.hdr.count -= 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    type Tree = BpTree<BytewiseComparator>;

    fn open_tree(dir: &tempfile::TempDir) -> Tree {
        BpTree::open(dir.path(), "t").unwrap()
    }

    #[test]
    fn empty_name_is_rejected() {
        let dir = tempdir().unwrap();
        assert!(Tree::open(dir.path(), "").is_err());
    }

    #[test]
    fn put_get_del_roundtrip() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir);

        assert!(tree.put(b"alpha", b"one").unwrap());
        assert!(tree.put(b"beta", b"two").unwrap());
        assert_eq!(tree.get(b"alpha").unwrap(), b"one");
        assert_eq!(tree.get(b"beta").unwrap(), b"two");
        assert_eq!(tree.get(b"gamma").unwrap(), Vec::<u8>::new());
        assert_eq!(tree.items(), 2);
        assert_eq!(tree.count().unwrap(), 2);

        tree.del(b"alpha").unwrap();
        assert!(!tree.contains(b"alpha").unwrap());
        assert!(tree.contains(b"beta").unwrap());
        assert_eq!(tree.items(), 1);
    }

    #[test]
    fn duplicate_put_is_rejected() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir);

        assert!(tree.put(b"k", b"v1").unwrap());
        assert!(!tree.put(b"k", b"v2").unwrap());
        assert_eq!(tree.get(b"k").unwrap(), b"v1");
        assert_eq!(tree.items(), 1);
    }

    #[test]
    fn delete_absent_key_is_a_noop() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir);

        tree.put(b"k", b"v").unwrap();
        tree.del(b"missing").unwrap();
        assert_eq!(tree.items(), 1);
    }

    #[test]
    fn deleting_the_last_key_nulls_the_root() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir);

        tree.put(b"only", b"v").unwrap();
        tree.del(b"only").unwrap();

        assert!(tree.root().is_null());
        assert_eq!(tree.items(), 0);
        assert_eq!(tree.count().unwrap(), 0);

        // The tree must come back to life after dying.
        assert!(tree.put(b"again", b"v").unwrap());
        assert_eq!(tree.get(b"again").unwrap(), b"v");
    }

    #[test]
    fn inserts_across_leaf_splits_stay_sorted() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir);

        // Past ORDER - 1 entries the root leaf must split.
        let n = 600usize;
        for i in (0..n).rev() {
            let key = format!("key{i:05}");
            let val = format!("val{i:05}");
            assert!(tree.put(key.as_bytes(), val.as_bytes()).unwrap(), "{key}");
        }

        assert_eq!(tree.items(), n as u64);
        assert_eq!(tree.count().unwrap(), n as u64);
        for i in 0..n {
            let key = format!("key{i:05}");
            let val = format!("val{i:05}");
            assert_eq!(tree.get(key.as_bytes()).unwrap(), val.into_bytes(), "{key}");
        }
    }

    #[test]
    fn deletes_rebalance_across_leaves() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir);

        let n = 600usize;
        for i in 0..n {
            let key = format!("key{i:05}");
            tree.put(key.as_bytes(), key.as_bytes()).unwrap();
        }

        for i in (0..n).step_by(2) {
            let key = format!("key{i:05}");
            tree.del(key.as_bytes()).unwrap();
        }

        assert_eq!(tree.items(), (n / 2) as u64);
        assert_eq!(tree.count().unwrap(), (n / 2) as u64);
        for i in 0..n {
            let key = format!("key{i:05}");
            assert_eq!(tree.contains(key.as_bytes()).unwrap(), i % 2 == 1, "{key}");
        }

        for i in (1..n).step_by(2) {
            let key = format!("key{i:05}");
            tree.del(key.as_bytes()).unwrap();
        }
        assert_eq!(tree.items(), 0);
        assert!(tree.root().is_null());
    }

    #[test]
    fn range_scans_follow_the_leaf_chain() {
        let dir = tempdir().unwrap();
        let mut tree = open_tree(&dir);

        let n = 600usize;
        for i in 0..n {
            let key = format!("key{i:05}");
            tree.put(key.as_bytes(), key.as_bytes()).unwrap();
        }

        let mut it = tree.range(b"key00100", b"key00299").unwrap();
        let mut seen = Vec::new();
        while it.valid() {
            seen.push(it.key().unwrap());
            it.next().unwrap();
        }

        assert_eq!(seen.len(), 200);
        assert_eq!(seen.first().unwrap(), b"key00100");
        assert_eq!(seen.last().unwrap(), b"key00299");
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempdir().unwrap();

        {
            let mut tree = open_tree(&dir);
            for i in 0..600usize {
                let key = format!("key{i:05}");
                tree.put(key.as_bytes(), key.as_bytes()).unwrap();
            }
            tree.flush().unwrap();
        }

        let mut tree = open_tree(&dir);
        assert_eq!(tree.items(), 600);
        assert_eq!(tree.count().unwrap(), 600);
        for i in 0..600usize {
            let key = format!("key{i:05}");
            assert_eq!(tree.get(key.as_bytes()).unwrap(), key.clone().into_bytes());
        }
    }
}
