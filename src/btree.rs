//! Clustered B+ tree index over fixed-width composite keys.
//!
//! File layout: page 0 is the serialized file header, page 1 is the sentinel
//! of the doubly-linked leaf list, nodes are allocated from page 2 upwards.
//! Each node page holds a header, `order + 1` fixed-width key slots, and
//! `order + 1` [`Rid`] slots; internal nodes store a child page number in the
//! rid's `page_no` and keep the minimum key of child `i` at key slot `i`.
//! The extra slot lets an insert overflow to `order + 1` pairs before the
//! node is split.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::buffer_pool::BufferPoolManager;
use crate::context::Context;
use crate::errors::{DbError, Result};
use crate::{FileId, Iid, PageId, PageNo, Rid, INVALID_PAGE_NO, PAGE_SIZE};

/// Sentinel for "no node": empty tree root, missing parent, end of leaf list.
pub const IX_NO_PAGE: PageNo = INVALID_PAGE_NO;

/// The leaf-list sentinel page; `first_leaf`/`last_leaf` point here when the
/// tree is empty.
pub const LEAF_SENTINEL_PAGE: PageNo = 1;

const NODE_HEADER_SIZE: usize = std::mem::size_of::<NodePageHeader>();
const RID_SIZE: usize = std::mem::size_of::<Rid>();

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NodePageHeader {
    next_free_page: PageNo,
    parent: PageNo,
    num_keys: i32,
    next_leaf: PageNo,
    prev_leaf: PageNo,
    is_leaf: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColType {
    Int,
    Float,
    Str,
}

/// One indexed column: its type, its byte width inside the key, and its byte
/// offset inside the table record (used to rebuild keys from record images).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexCol {
    pub col_type: ColType,
    pub len: usize,
    pub offset: usize,
}

/// The immutable shape of an index: column layout, total key width, and node
/// order (maximum keys per node).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSchema {
    pub cols: Vec<IndexCol>,
    pub key_len: usize,
    pub order: usize,
}

impl IndexSchema {
    /// Concatenates the indexed columns of a record image into a key.
    pub fn key_from_record(&self, record: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.key_len);
        for col in &self.cols {
            key.extend_from_slice(&record[col.offset..col.offset + col.len]);
        }
        key
    }

    /// Total order over keys: columns compare left to right; INT and FLOAT
    /// as signed numerics, STRING bytewise over its zero-padded width.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let mut offset = 0;
        for col in &self.cols {
            let x = &a[offset..offset + col.len];
            let y = &b[offset..offset + col.len];
            let ord = match col.col_type {
                ColType::Int => {
                    let ia = i32::from_le_bytes(x.try_into().unwrap());
                    let ib = i32::from_le_bytes(y.try_into().unwrap());
                    ia.cmp(&ib)
                }
                ColType::Float => {
                    let fa = f32::from_le_bytes(x.try_into().unwrap());
                    let fb = f32::from_le_bytes(y.try_into().unwrap());
                    fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
                }
                ColType::Str => x.cmp(y),
            };
            if ord != Ordering::Equal {
                return ord;
            }
            offset += col.len;
        }
        Ordering::Equal
    }
}

/// Serialized into page 0 of every index file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFileHeader {
    pub schema: IndexSchema,
    pub root_page: PageNo,
    pub first_leaf: PageNo,
    pub last_leaf: PageNo,
    pub num_pages: PageNo,
}

#[derive(Debug, Clone, Copy)]
struct IndexState {
    root_page: PageNo,
    first_leaf: PageNo,
    last_leaf: PageNo,
    num_pages: PageNo,
}

/// A view over one pinned node page. Mutating accessors mark the frame dirty
/// through the page guard; dropping the node unpins the page.
struct Node<'a> {
    guard: crate::buffer_pool::PageGuard<'a>,
    key_len: usize,
    capacity: usize,
}

impl Node<'_> {
    fn hdr(&self) -> NodePageHeader {
        let page = self.guard.read();
        unsafe { std::ptr::read_unaligned(page.data.as_ptr() as *const NodePageHeader) }
    }

    fn with_hdr(&self, f: impl FnOnce(&mut NodePageHeader)) {
        let mut page = self.guard.write();
        let mut hdr =
            unsafe { std::ptr::read_unaligned(page.data.as_ptr() as *const NodePageHeader) };
        f(&mut hdr);
        unsafe {
            std::ptr::write_unaligned(page.data.as_mut_ptr() as *mut NodePageHeader, hdr);
        }
    }

    fn init(&self, is_leaf: bool, parent: PageNo) {
        self.with_hdr(|h| {
            *h = NodePageHeader {
                next_free_page: IX_NO_PAGE,
                parent,
                num_keys: 0,
                next_leaf: IX_NO_PAGE,
                prev_leaf: IX_NO_PAGE,
                is_leaf: is_leaf as u8,
            }
        });
    }

    fn page_no(&self) -> PageNo {
        self.guard.page_id().page_no
    }

    fn size(&self) -> usize {
        self.hdr().num_keys as usize
    }

    fn set_size(&self, size: usize) {
        self.with_hdr(|h| h.num_keys = size as i32);
    }

    fn is_leaf(&self) -> bool {
        self.hdr().is_leaf != 0
    }

    fn parent(&self) -> PageNo {
        self.hdr().parent
    }

    fn set_parent(&self, parent: PageNo) {
        self.with_hdr(|h| h.parent = parent);
    }

    fn next_leaf(&self) -> PageNo {
        self.hdr().next_leaf
    }

    fn set_next_leaf(&self, page_no: PageNo) {
        self.with_hdr(|h| h.next_leaf = page_no);
    }

    fn prev_leaf(&self) -> PageNo {
        self.hdr().prev_leaf
    }

    fn set_prev_leaf(&self, page_no: PageNo) {
        self.with_hdr(|h| h.prev_leaf = page_no);
    }

    fn key_offset(&self, i: usize) -> usize {
        NODE_HEADER_SIZE + i * self.key_len
    }

    fn rid_offset(&self, i: usize) -> usize {
        NODE_HEADER_SIZE + self.capacity * self.key_len + i * RID_SIZE
    }

    fn key(&self, i: usize) -> Vec<u8> {
        let page = self.guard.read();
        page.data[self.key_offset(i)..self.key_offset(i) + self.key_len].to_vec()
    }

    fn set_key(&self, i: usize, key: &[u8]) {
        debug_assert_eq!(key.len(), self.key_len);
        let mut page = self.guard.write();
        let offset = self.key_offset(i);
        page.data[offset..offset + self.key_len].copy_from_slice(key);
    }

    fn rid(&self, i: usize) -> Rid {
        let page = self.guard.read();
        unsafe {
            std::ptr::read_unaligned(page.data.as_ptr().add(self.rid_offset(i)) as *const Rid)
        }
    }

    fn set_rid(&self, i: usize, rid: Rid) {
        let mut page = self.guard.write();
        unsafe {
            std::ptr::write_unaligned(
                page.data.as_mut_ptr().add(self.rid_offset(i)) as *mut Rid,
                rid,
            );
        }
    }

    /// Child page number stored at slot `i` of an internal node.
    fn child(&self, i: usize) -> PageNo {
        self.rid(i).page_no
    }

    /// First position whose key is >= target, in `[0, size]`.
    fn lower_bound(&self, schema: &IndexSchema, target: &[u8]) -> usize {
        let (mut lo, mut hi) = (0, self.size());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if schema.compare(&self.key(mid), target) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// First position after `start` whose key is > target. Internal lookups
    /// start at 1 because slot 0 holds the minimum key of the leftmost
    /// subtree.
    fn upper_bound_from(&self, schema: &IndexSchema, target: &[u8], start: usize) -> usize {
        let (mut lo, mut hi) = (start, self.size().max(start));
        while lo < hi {
            let mid = (lo + hi) / 2;
            if schema.compare(&self.key(mid), target) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    fn leaf_lookup(&self, schema: &IndexSchema, key: &[u8]) -> Option<Rid> {
        let pos = self.lower_bound(schema, key);
        if pos < self.size() && schema.compare(&self.key(pos), key) == Ordering::Equal {
            Some(self.rid(pos))
        } else {
            None
        }
    }

    fn internal_lookup(&self, schema: &IndexSchema, key: &[u8]) -> PageNo {
        let pos = self.upper_bound_from(schema, key, 1);
        self.child(pos - 1)
    }

    /// Shifts `[pos, size)` right by `n` pairs and writes the given keys and
    /// rids at `pos`.
    fn insert_pairs(&self, pos: usize, keys: &[u8], rids: &[Rid]) {
        let n = rids.len();
        let size = self.size();
        debug_assert_eq!(keys.len(), n * self.key_len);
        assert!(pos <= size, "insert position out of range");
        assert!(size + n <= self.capacity, "node overflow");

        {
            let mut page = self.guard.write();
            let kl = self.key_len;
            let key_base = self.key_offset(0);
            page.data.copy_within(
                key_base + pos * kl..key_base + size * kl,
                key_base + (pos + n) * kl,
            );
            page.data[key_base + pos * kl..key_base + (pos + n) * kl].copy_from_slice(keys);

            let rid_base = self.rid_offset(0);
            page.data.copy_within(
                rid_base + pos * RID_SIZE..rid_base + size * RID_SIZE,
                rid_base + (pos + n) * RID_SIZE,
            );
        }
        for (i, rid) in rids.iter().enumerate() {
            self.set_rid(pos + i, *rid);
        }
        self.set_size(size + n);
    }

    fn insert_pair(&self, pos: usize, key: &[u8], rid: Rid) {
        self.insert_pairs(pos, key, &[rid]);
    }

    /// Removes the pair at `pos`, shifting the tail left by one.
    fn erase_pair(&self, pos: usize) {
        let size = self.size();
        assert!(pos < size, "erase position out of range");
        let mut page = self.guard.write();
        let kl = self.key_len;
        let key_base = self.key_offset(0);
        page.data.copy_within(
            key_base + (pos + 1) * kl..key_base + size * kl,
            key_base + pos * kl,
        );
        let rid_base = self.rid_offset(0);
        page.data.copy_within(
            rid_base + (pos + 1) * RID_SIZE..rid_base + size * RID_SIZE,
            rid_base + pos * RID_SIZE,
        );
        drop(page);
        self.set_size(size - 1);
    }

    /// Inserts a pair at its sorted position; a duplicate key is a no-op.
    /// Returns the resulting size.
    fn insert(&self, schema: &IndexSchema, key: &[u8], rid: Rid) -> usize {
        let pos = self.lower_bound(schema, key);
        let size = self.size();
        if pos < size && schema.compare(&self.key(pos), key) == Ordering::Equal {
            return size;
        }
        self.insert_pair(pos, key, rid);
        size + 1
    }

    /// Position of `child_page_no` among this internal node's children.
    fn find_child(&self, child_page_no: PageNo) -> usize {
        (0..self.size())
            .find(|&i| self.child(i) == child_page_no)
            .expect("child not found in parent node")
    }

    fn copy_keys(&self, from: usize, n: usize) -> Vec<u8> {
        let page = self.guard.read();
        page.data[self.key_offset(from)..self.key_offset(from + n)].to_vec()
    }

    fn copy_rids(&self, from: usize, n: usize) -> Vec<Rid> {
        (from..from + n).map(|i| self.rid(i)).collect()
    }
}

/// A handle to one open B+ tree index file. Tree mutations are serialized by
/// holding the state mutex for their whole duration; lookups hold it too, so
/// structure changes never race a descent.
pub struct IndexHandle {
    bpm: Arc<BufferPoolManager>,
    file_id: FileId,
    schema: IndexSchema,
    state: Mutex<IndexState>,
}

impl IndexHandle {
    /// Creates an index file for the given columns and opens it. `order`
    /// overrides the page-derived maximum keys per node (tests use small
    /// orders to force splits).
    pub fn create<P: AsRef<Path>>(
        bpm: Arc<BufferPoolManager>,
        path: P,
        cols: Vec<IndexCol>,
        order: Option<usize>,
    ) -> Result<Self> {
        if cols.is_empty() {
            return Err(DbError::Internal("index needs at least one column".into()));
        }
        for col in &cols {
            let ok = match col.col_type {
                ColType::Int | ColType::Float => col.len == 4,
                ColType::Str => col.len > 0,
            };
            if !ok {
                return Err(DbError::Internal(format!(
                    "bad column width {} for {:?}",
                    col.len, col.col_type
                )));
            }
        }
        let key_len: usize = cols.iter().map(|c| c.len).sum();
        let max_order = (PAGE_SIZE - NODE_HEADER_SIZE) / (key_len + RID_SIZE) - 1;
        let order = order.unwrap_or(max_order);
        if order < 2 || order > max_order {
            return Err(DbError::Internal(format!(
                "order {order} out of range for key length {key_len}"
            )));
        }
        let schema = IndexSchema {
            cols,
            key_len,
            order,
        };

        let file_id = {
            let mut disk = bpm.disk.lock().unwrap();
            disk.create_file(&path)?;
            let file_id = disk.open_file(&path)?;
            // Reserve page 0 for the header so node allocation starts at 1.
            disk.write_page(file_id, 0, &[0u8; PAGE_SIZE])?;
            file_id
        };

        let handle = Self {
            bpm,
            file_id,
            schema,
            state: Mutex::new(IndexState {
                root_page: IX_NO_PAGE,
                first_leaf: LEAF_SENTINEL_PAGE,
                last_leaf: LEAF_SENTINEL_PAGE,
                num_pages: 1,
            }),
        };

        {
            let mut state = handle.state.lock().unwrap();
            let sentinel = handle.create_node_at(&mut state)?;
            debug_assert_eq!(sentinel.page_no(), LEAF_SENTINEL_PAGE);
            sentinel.init(true, IX_NO_PAGE);
            sentinel.set_next_leaf(LEAF_SENTINEL_PAGE);
            sentinel.set_prev_leaf(LEAF_SENTINEL_PAGE);

            // Start with an empty leaf as the root, linked into the list.
            let root = handle.create_node_at(&mut state)?;
            root.init(true, IX_NO_PAGE);
            root.set_prev_leaf(LEAF_SENTINEL_PAGE);
            root.set_next_leaf(LEAF_SENTINEL_PAGE);
            sentinel.set_next_leaf(root.page_no());
            sentinel.set_prev_leaf(root.page_no());
            state.root_page = root.page_no();
            state.first_leaf = root.page_no();
            state.last_leaf = root.page_no();
        }
        handle.sync_header()?;
        Ok(handle)
    }

    pub fn open<P: AsRef<Path>>(bpm: Arc<BufferPoolManager>, path: P) -> Result<Self> {
        let (file_id, hdr) = {
            let mut disk = bpm.disk.lock().unwrap();
            let file_id = disk.open_file(&path)?;
            let mut page0 = [0u8; PAGE_SIZE];
            disk.read_page(file_id, 0, &mut page0)?;
            let hdr: IndexFileHeader = bincode::deserialize(&page0)
                .map_err(|e| DbError::Internal(format!("index header deserialize: {e}")))?;
            (file_id, hdr)
        };
        Ok(Self {
            bpm,
            file_id,
            schema: hdr.schema,
            state: Mutex::new(IndexState {
                root_page: hdr.root_page,
                first_leaf: hdr.first_leaf,
                last_leaf: hdr.last_leaf,
                num_pages: hdr.num_pages,
            }),
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().root_page == IX_NO_PAGE
    }

    fn last_leaf(&self) -> PageNo {
        self.state.lock().unwrap().last_leaf
    }

    /// Writes the file header back to page 0.
    pub fn sync_header(&self) -> Result<()> {
        let state = *self.state.lock().unwrap();
        let hdr = IndexFileHeader {
            schema: self.schema.clone(),
            root_page: state.root_page,
            first_leaf: state.first_leaf,
            last_leaf: state.last_leaf,
            num_pages: state.num_pages,
        };
        let mut page0 = [0u8; PAGE_SIZE];
        let bytes = bincode::serialize(&hdr)
            .map_err(|e| DbError::Internal(format!("index header serialize: {e}")))?;
        page0[..bytes.len()].copy_from_slice(&bytes);
        self.bpm
            .disk
            .lock()
            .unwrap()
            .write_page(self.file_id, 0, &page0)
    }

    fn fetch_node(&self, page_no: PageNo) -> Result<Node<'_>> {
        let guard = self.bpm.fetch_page(PageId {
            file: self.file_id,
            page_no,
        })?;
        Ok(Node {
            guard,
            key_len: self.schema.key_len,
            capacity: self.schema.order + 1,
        })
    }

    fn create_node_at(&self, state: &mut IndexState) -> Result<Node<'_>> {
        let guard = self.bpm.new_page(self.file_id)?;
        state.num_pages += 1;
        Ok(Node {
            guard,
            key_len: self.schema.key_len,
            capacity: self.schema.order + 1,
        })
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.schema.key_len {
            return Err(DbError::Internal(format!(
                "key length {} does not match index key length {}",
                key.len(),
                self.schema.key_len
            )));
        }
        Ok(())
    }

    /// Descends from the root to the leaf that would contain `key`, unpinning
    /// each internal node as soon as its child pointer is read.
    fn find_leaf(&self, state: &IndexState, key: &[u8]) -> Result<Node<'_>> {
        let mut node = self.fetch_node(state.root_page)?;
        while !node.is_leaf() {
            let child = node.internal_lookup(&self.schema, key);
            node = self.fetch_node(child)?;
        }
        Ok(node)
    }

    /// Point lookup. The context is accepted for interface symmetry with the
    /// record file; the tree itself is protected by latches, not locks.
    pub fn get_value(&self, _ctx: &Context<'_>, key: &[u8]) -> Result<Option<Rid>> {
        self.check_key(key)?;
        let state = self.state.lock().unwrap();
        if state.root_page == IX_NO_PAGE {
            return Ok(None);
        }
        let leaf = self.find_leaf(&state, key)?;
        Ok(leaf.leaf_lookup(&self.schema, key))
    }

    /// Inserts `key -> rid`. Duplicates are silent no-ops (unique index).
    /// Returns the page number of the leaf that holds (or already held) the
    /// key.
    pub fn insert_entry(&self, _ctx: &Context<'_>, key: &[u8], rid: Rid) -> Result<PageNo> {
        self.check_key(key)?;
        let mut state = self.state.lock().unwrap();

        if state.root_page == IX_NO_PAGE {
            let root = self.create_node_at(&mut state)?;
            root.init(true, IX_NO_PAGE);
            root.set_prev_leaf(LEAF_SENTINEL_PAGE);
            root.set_next_leaf(LEAF_SENTINEL_PAGE);
            state.root_page = root.page_no();
            state.first_leaf = root.page_no();
            state.last_leaf = root.page_no();
            drop(root);
            let sentinel = self.fetch_node(LEAF_SENTINEL_PAGE)?;
            sentinel.set_next_leaf(state.root_page);
            sentinel.set_prev_leaf(state.root_page);
        }

        let leaf = self.find_leaf(&state, key)?;
        let leaf_page = leaf.page_no();
        let old_size = leaf.size();
        let new_size = leaf.insert(&self.schema, key, rid);
        if new_size == old_size || new_size <= self.schema.order {
            return Ok(leaf_page);
        }

        let new_leaf = self.split(&mut state, &leaf)?;
        let up_key = new_leaf.key(0);
        self.insert_into_parent(&mut state, &leaf, &up_key, &new_leaf)?;
        Ok(leaf_page)
    }

    /// Splits an overflowing node, moving its upper half (the larger half)
    /// into a fresh right sibling. Returns the new node.
    fn split<'a>(&'a self, state: &mut IndexState, node: &Node<'a>) -> Result<Node<'a>> {
        let new_node = self.create_node_at(state)?;
        new_node.init(node.is_leaf(), node.parent());

        let size = node.size();
        let keep = size / 2;
        let move_cnt = size - keep;
        let keys = node.copy_keys(keep, move_cnt);
        let rids = node.copy_rids(keep, move_cnt);
        new_node.insert_pairs(0, &keys, &rids);
        node.set_size(keep);

        if node.is_leaf() {
            new_node.set_next_leaf(node.next_leaf());
            new_node.set_prev_leaf(node.page_no());
            let next = self.fetch_node(node.next_leaf())?;
            next.set_prev_leaf(new_node.page_no());
            node.set_next_leaf(new_node.page_no());
            if state.last_leaf == node.page_no() {
                state.last_leaf = new_node.page_no();
            }
        } else {
            for i in 0..move_cnt {
                self.maintain_child(&new_node, i)?;
            }
        }
        Ok(new_node)
    }

    /// Links a freshly split pair into their parent, growing a new root or
    /// recursing when the parent overflows in turn.
    fn insert_into_parent(
        &self,
        state: &mut IndexState,
        old_node: &Node<'_>,
        key: &[u8],
        new_node: &Node<'_>,
    ) -> Result<()> {
        if old_node.parent() == IX_NO_PAGE {
            let root = self.create_node_at(state)?;
            root.init(false, IX_NO_PAGE);
            root.insert_pair(
                0,
                &old_node.key(0),
                Rid {
                    page_no: old_node.page_no(),
                    slot_no: 0,
                },
            );
            root.insert_pair(
                1,
                key,
                Rid {
                    page_no: new_node.page_no(),
                    slot_no: 0,
                },
            );
            old_node.set_parent(root.page_no());
            new_node.set_parent(root.page_no());
            state.root_page = root.page_no();
            return Ok(());
        }

        let parent = self.fetch_node(old_node.parent())?;
        let index = parent.find_child(old_node.page_no());
        new_node.set_parent(parent.page_no());
        parent.insert_pair(
            index + 1,
            key,
            Rid {
                page_no: new_node.page_no(),
                slot_no: 0,
            },
        );

        if parent.size() > self.schema.order {
            let new_parent = self.split(state, &parent)?;
            let up_key = new_parent.key(0);
            self.insert_into_parent(state, &parent, &up_key, &new_parent)?;
        }
        Ok(())
    }

    /// Deletes `key`. Returns false when the key is absent.
    pub fn delete_entry(&self, _ctx: &Context<'_>, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        let mut state = self.state.lock().unwrap();
        if state.root_page == IX_NO_PAGE {
            return Ok(false);
        }

        let leaf = self.find_leaf(&state, key)?;
        let pos = leaf.lower_bound(&self.schema, key);
        if pos == leaf.size() || self.schema.compare(&leaf.key(pos), key) != Ordering::Equal {
            return Ok(false);
        }

        leaf.erase_pair(pos);
        if pos == 0 && leaf.size() > 0 {
            self.maintain_parent(&leaf)?;
        }
        self.coalesce_or_redistribute(&mut state, leaf)?;
        Ok(true)
    }

    fn min_size(&self) -> usize {
        (self.schema.order + 1) / 2
    }

    fn coalesce_or_redistribute(&self, state: &mut IndexState, node: Node<'_>) -> Result<()> {
        if node.parent() == IX_NO_PAGE {
            return self.adjust_root(state, node);
        }
        if node.size() >= self.min_size() {
            return Ok(());
        }

        let parent = self.fetch_node(node.parent())?;
        let index = parent.find_child(node.page_no());
        // Prefer the left sibling; only the leftmost child takes its right.
        let neighbor_index = if index > 0 { index - 1 } else { index + 1 };
        let neighbor = self.fetch_node(parent.child(neighbor_index))?;

        if neighbor.size() + node.size() >= 2 * self.min_size() {
            self.redistribute(&neighbor, &node, &parent, index)?;
            return Ok(());
        }
        self.coalesce(state, neighbor, node, parent, index)
    }

    /// Moves one pair from the sibling into the underflowing node and patches
    /// the parent's separator key.
    fn redistribute(
        &self,
        neighbor: &Node<'_>,
        node: &Node<'_>,
        parent: &Node<'_>,
        index: usize,
    ) -> Result<()> {
        if index == 0 {
            // node (left) <- first pair of neighbor (right).
            let moved_key = neighbor.key(0);
            let moved_rid = neighbor.rid(0);
            node.insert_pair(node.size(), &moved_key, moved_rid);
            neighbor.erase_pair(0);
            if !node.is_leaf() {
                self.maintain_child(node, node.size() - 1)?;
            }
            parent.set_key(index + 1, &neighbor.key(0));
        } else {
            // last pair of neighbor (left) -> node (right).
            let last = neighbor.size() - 1;
            let moved_key = neighbor.key(last);
            let moved_rid = neighbor.rid(last);
            node.insert_pair(0, &moved_key, moved_rid);
            neighbor.erase_pair(last);
            if !node.is_leaf() {
                self.maintain_child(node, 0)?;
            }
            parent.set_key(index, &node.key(0));
        }
        Ok(())
    }

    /// Merges the right node of a sibling pair into the left one, removes the
    /// parent's entry for it, and recurses upward on underflow.
    fn coalesce<'a>(
        &self,
        state: &mut IndexState,
        mut neighbor: Node<'a>,
        mut node: Node<'a>,
        parent: Node<'_>,
        mut index: usize,
    ) -> Result<()> {
        // Keep the merge direction right-into-left.
        if index == 0 {
            std::mem::swap(&mut neighbor, &mut node);
            index = 1;
        }
        let left = neighbor;
        let right = node;

        let left_size = left.size();
        let move_cnt = right.size();
        let keys = right.copy_keys(0, move_cnt);
        let rids = right.copy_rids(0, move_cnt);
        left.insert_pairs(left_size, &keys, &rids);

        if left.is_leaf() {
            if state.last_leaf == right.page_no() {
                state.last_leaf = left.page_no();
            }
            if state.first_leaf == right.page_no() {
                state.first_leaf = right.next_leaf();
            }
            self.erase_leaf(&right)?;
        } else {
            for i in left_size..left_size + move_cnt {
                self.maintain_child(&left, i)?;
            }
        }

        parent.erase_pair(index);
        self.release_node(state, right)?;
        drop(left);
        self.coalesce_or_redistribute(state, parent)
    }

    /// Shrinks the tree at the top: an internal root with a single child is
    /// replaced by that child; an empty leaf root empties the tree.
    fn adjust_root(&self, state: &mut IndexState, root: Node<'_>) -> Result<()> {
        if !root.is_leaf() && root.size() == 1 {
            let only_child = root.child(0);
            root.erase_pair(0);
            state.root_page = only_child;
            let child = self.fetch_node(only_child)?;
            child.set_parent(IX_NO_PAGE);
            drop(child);
            return self.release_node(state, root);
        }
        if root.is_leaf() && root.size() == 0 {
            self.erase_leaf(&root)?;
            state.root_page = IX_NO_PAGE;
            state.first_leaf = LEAF_SENTINEL_PAGE;
            state.last_leaf = LEAF_SENTINEL_PAGE;
            return self.release_node(state, root);
        }
        Ok(())
    }

    /// Unlinks a leaf from the doubly-linked leaf list.
    fn erase_leaf(&self, leaf: &Node<'_>) -> Result<()> {
        let prev = self.fetch_node(leaf.prev_leaf())?;
        prev.set_next_leaf(leaf.next_leaf());
        drop(prev);
        let next = self.fetch_node(leaf.next_leaf())?;
        next.set_prev_leaf(leaf.prev_leaf());
        Ok(())
    }

    /// Drops a detached node page from the pool and the logical page count.
    fn release_node(&self, state: &mut IndexState, node: Node<'_>) -> Result<()> {
        let page_id = PageId {
            file: self.file_id,
            page_no: node.page_no(),
        };
        drop(node);
        state.num_pages -= 1;
        self.bpm.delete_page(page_id)?;
        Ok(())
    }

    /// Walks up from `node`, overwriting each ancestor's separator key with
    /// the subtree's new minimum until an ancestor already agrees.
    fn maintain_parent(&self, node: &Node<'_>) -> Result<()> {
        let mut child_no = node.page_no();
        let mut child_key = node.key(0);
        let mut parent_no = node.parent();
        while parent_no != IX_NO_PAGE {
            let parent = self.fetch_node(parent_no)?;
            let rank = parent.find_child(child_no);
            if parent.key(rank) == child_key {
                break;
            }
            parent.set_key(rank, &child_key);
            child_no = parent.page_no();
            child_key = parent.key(0);
            parent_no = parent.parent();
        }
        Ok(())
    }

    /// Repoints the parent pointer of the child at `idx` back at `node`.
    fn maintain_child(&self, node: &Node<'_>, idx: usize) -> Result<()> {
        if !node.is_leaf() {
            let child = self.fetch_node(node.child(idx))?;
            child.set_parent(node.page_no());
        }
        Ok(())
    }

    /// Position of the first entry >= key, hopping to the next leaf when the
    /// in-leaf position falls off its end.
    pub fn lower_bound(&self, key: &[u8]) -> Result<Iid> {
        self.check_key(key)?;
        let state = self.state.lock().unwrap();
        if state.root_page == IX_NO_PAGE {
            return Ok(Iid {
                page_no: LEAF_SENTINEL_PAGE,
                slot_no: 0,
            });
        }
        let leaf = self.find_leaf(&state, key)?;
        let slot = leaf.lower_bound(&self.schema, key);
        Ok(self.leaf_position(&leaf, slot))
    }

    /// Position just past the last entry <= key.
    pub fn upper_bound(&self, key: &[u8]) -> Result<Iid> {
        self.check_key(key)?;
        let state = self.state.lock().unwrap();
        if state.root_page == IX_NO_PAGE {
            return Ok(Iid {
                page_no: LEAF_SENTINEL_PAGE,
                slot_no: 0,
            });
        }
        let leaf = self.find_leaf(&state, key)?;
        let slot = leaf.upper_bound_from(&self.schema, key, 0);
        Ok(self.leaf_position(&leaf, slot))
    }

    fn leaf_position(&self, leaf: &Node<'_>, slot: usize) -> Iid {
        if slot == leaf.size() && leaf.next_leaf() != LEAF_SENTINEL_PAGE {
            Iid {
                page_no: leaf.next_leaf(),
                slot_no: 0,
            }
        } else {
            Iid {
                page_no: leaf.page_no(),
                slot_no: slot as i32,
            }
        }
    }

    pub fn leaf_begin(&self) -> Iid {
        let state = self.state.lock().unwrap();
        Iid {
            page_no: state.first_leaf,
            slot_no: 0,
        }
    }

    pub fn leaf_end(&self) -> Result<Iid> {
        let state = self.state.lock().unwrap();
        let node = self.fetch_node(state.last_leaf)?;
        Ok(Iid {
            page_no: state.last_leaf,
            slot_no: node.size() as i32,
        })
    }

    /// Dereferences a scan position into the data-file rid stored there.
    pub fn get_rid(&self, iid: Iid) -> Result<Rid> {
        let node = self.fetch_node(iid.page_no)?;
        if iid.slot_no < 0 || iid.slot_no as usize >= node.size() {
            return Err(DbError::IndexEntryNotFound);
        }
        Ok(node.rid(iid.slot_no as usize))
    }

    /// Range scan over `[lower, upper)` in key order; `None` bounds extend to
    /// the tree's extremes.
    pub fn scan_range(
        &self,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<IndexScan<'_>> {
        let start = match lower {
            Some(key) => self.lower_bound(key)?,
            None => self.leaf_begin(),
        };
        let end = match upper {
            Some(key) => self.lower_bound(key)?,
            None => self.leaf_end()?,
        };
        Ok(IndexScan {
            ih: self,
            iid: start,
            end,
        })
    }
}

/// Advances slot by slot across linked leaves. No page stays pinned between
/// calls; each visited leaf is re-fetched on demand.
pub struct IndexScan<'a> {
    ih: &'a IndexHandle,
    iid: Iid,
    end: Iid,
}

impl IndexScan<'_> {
    pub fn iid(&self) -> Iid {
        self.iid
    }

    pub fn is_end(&self) -> bool {
        self.iid == self.end
    }

    pub fn rid(&self) -> Result<Rid> {
        self.ih.get_rid(self.iid)
    }

    pub fn next(&mut self) -> Result<()> {
        if self.is_end() {
            return Ok(());
        }
        let node = self.ih.fetch_node(self.iid.page_no)?;
        debug_assert!(node.is_leaf());
        self.iid.slot_no += 1;
        if self.iid.page_no != self.ih.last_leaf() && self.iid.slot_no as usize == node.size() {
            self.iid = Iid {
                page_no: node.next_leaf(),
                slot_no: 0,
            };
        }
        Ok(())
    }
}
