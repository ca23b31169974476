use std::cmp::Ordering;
use std::io;
use std::path::Path;

use crate::disk::arena::{PageArena, PAGE_SIZE};
use crate::disk::log::{DataLog, RECORD_HEADER_SIZE};

/// Key length saturates at 5 bits in the packed form; a packed length of 31
/// means "at least 31, read the record header for the truth".
pub const KEY_LEN_CAP: u16 = (1 << 5) - 1;
/// Value length saturates at 11 bits; 2047 means "at least 2047".
pub const VAL_LEN_CAP: u16 = (1 << 11) - 1;

const PAGE_TAG: u64 = 1 << 63;

/// Packs true lengths into the 16-bit saturated form stored in an entry.
pub fn pack_lengths(k_len: usize, v_len: usize) -> u16 {
    let k = (k_len as u64).min(KEY_LEN_CAP as u64) as u16;
    let v = (v_len as u64).min(VAL_LEN_CAP as u64) as u16;
    (k << 11) | v
}

pub fn unpack_lengths(lens: u16) -> (u16, u16) {
    (lens >> 11, lens & VAL_LEN_CAP)
}

/// User entry: segment id in bits 63..48 (bit 63 clear), packed lengths in
/// bits 47..32, file offset in bits 31..0.
pub fn pack_rep(id: u16, lens: u16, offset: u32) -> u64 {
    ((id as u64) << 48) | ((lens as u64) << 32) | offset as u64
}

pub fn unpack_rep(rep: u64) -> (u16, u16, u32) {
    ((rep >> 48) as u16, (rep >> 32) as u16, rep as u32)
}

/// Internal page pointer: bit 63 set, page offset in bits 62..0.
fn pack_page_ptr(offset: u64) -> u64 {
    offset | PAGE_TAG
}

fn page_ptr_offset(rep: u64) -> u64 {
    rep & !PAGE_TAG
}

pub fn is_page_ptr(rep: u64) -> bool {
    rep & PAGE_TAG != 0
}

/// Translator over a stored entry: resolves the entry's key (and value) by
/// reading the referenced record from the data log. The index itself stores
/// no key bytes, so every comparison goes through one of these.
pub struct KvTrans {
    rep: u64,
    key: Option<Vec<u8>>,
}

impl KvTrans {
    pub fn new(rep: u64) -> KvTrans {
        KvTrans { rep, key: None }
    }

    pub fn rep(&self) -> u64 {
        self.rep
    }

    /// The record's key, loaded on first use. When the packed length is
    /// saturated the first read covers only the packed prefix and the header
    /// tells how much more to fetch.
    pub fn key(&mut self, log: &DataLog) -> io::Result<&[u8]> {
        if self.key.is_none() {
            let (id, lens, offset) = unpack_rep(self.rep);
            let (packed_k, _) = unpack_lengths(lens);

            let mut buf = vec![0; RECORD_HEADER_SIZE + packed_k as usize];
            log.read_exact_at(id, &mut buf, offset as u64)?;
            let k_len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
            if k_len > packed_k as usize {
                let have = buf.len();
                buf.resize(RECORD_HEADER_SIZE + k_len, 0);
                log.read_exact_at(id, &mut buf[have..], offset as u64 + have as u64)?;
            }
            self.key = Some(buf.split_off(RECORD_HEADER_SIZE));
        }
        Ok(self.key.as_deref().unwrap_or_default())
    }

    /// Key equality with the packed-length short circuit: lengths that
    /// disagree settle the answer without touching the log, unless the
    /// packed length sits at its saturation cap.
    pub fn matches(&mut self, log: &DataLog, k: &[u8]) -> io::Result<bool> {
        if let Some(key) = &self.key {
            return Ok(key.as_slice() == k);
        }
        let (_, lens, _) = unpack_rep(self.rep);
        let (packed_k, _) = unpack_lengths(lens);
        if packed_k as usize == k.len() || (packed_k == KEY_LEN_CAP && k.len() > packed_k as usize)
        {
            Ok(self.key(log)? == k)
        } else {
            Ok(false)
        }
    }

    pub fn compare_key(&mut self, log: &DataLog, k: &[u8]) -> io::Result<Ordering> {
        Ok(self.key(log)?.cmp(k))
    }

    /// Loads enough of the record to compare the key; on a match returns the
    /// adjacent value bytes. Reads the packed-length prefix first and tops up
    /// from the header's true lengths when they saturate.
    pub fn get(&mut self, log: &DataLog, k: &[u8]) -> io::Result<Option<Vec<u8>>> {
        let (id, lens, offset) = unpack_rep(self.rep);
        let (packed_k, packed_v) = unpack_lengths(lens);

        let mut buf = vec![0; RECORD_HEADER_SIZE + packed_k as usize + packed_v as usize];
        log.read_exact_at(id, &mut buf, offset as u64)?;
        let k_len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        let v_len = u16::from_le_bytes([buf[2], buf[3]]) as usize;

        let need = RECORD_HEADER_SIZE + k_len + v_len;
        if need > buf.len() {
            let have = buf.len();
            buf.resize(need, 0);
            log.read_exact_at(id, &mut buf[have..], offset as u64 + have as u64)?;
        }

        let key = &buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + k_len];
        if key != k {
            self.key = Some(key.to_vec());
            return Ok(None);
        }
        self.key = Some(key.to_vec());
        Ok(Some(buf[RECORD_HEADER_SIZE + k_len..need].to_vec()))
    }
}

const NODE_LEAF: u8 = 0;
const NODE_INNER: u8 = 1;

/// Reps per leaf page.
const LEAF_CAP: usize = (PAGE_SIZE - 8) / 8;
/// Separator/child pairs per inner page (plus the leading child).
const INNER_CAP: usize = (PAGE_SIZE - 16) / 16;

/// Persistent ordered key→u64 map over the page arena.
///
/// One node per page. Leaves hold sorted user entries; inner nodes hold
/// separator entries and tagged child page pointers, sharing the 64-bit
/// entry layout. Ordering comparisons resolve keys through `KvTrans`, so the
/// structure persists nothing but packed entries. Leaves that empty out are
/// unlinked and recycled; no further rebalancing is attempted.
pub struct Index {
    arena: PageArena,
}

impl Index {
    pub fn open(path: &Path) -> io::Result<Index> {
        let arena = PageArena::open(path)?;
        Ok(Index { arena })
    }

    /// Persisted data-log cursor, piggybacked on the arena superblock.
    pub fn log_cursor(&self) -> Option<(u16, u64)> {
        self.arena.log_cursor()
    }

    pub fn set_log_cursor(&mut self, id: u16, offset: u64) {
        self.arena.set_log_cursor(id, offset);
    }

    /// Returns the stored entry for `key`, if any.
    pub fn get_rep(&self, log: &DataLog, key: &[u8]) -> io::Result<Option<u64>> {
        let Some(leaf) = self.descend(log, key)? else {
            return Ok(None);
        };
        match self.leaf_search(log, leaf, key)? {
            Ok(i) => {
                let rep = leaf_get(&self.arena, leaf, i);
                let mut trans = KvTrans::new(rep);
                if trans.matches(log, key)? {
                    Ok(Some(rep))
                } else {
                    Ok(None)
                }
            }
            Err(_) => Ok(None),
        }
    }

    /// Looks up `key` and returns its value bytes.
    pub fn get(&self, log: &DataLog, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        let Some(leaf) = self.descend(log, key)? else {
            return Ok(None);
        };
        match self.leaf_search(log, leaf, key)? {
            Ok(i) => KvTrans::new(leaf_get(&self.arena, leaf, i)).get(log, key),
            Err(_) => Ok(None),
        }
    }

    /// Inserts `rep` under `key`. When the key already exists, `resolver` is
    /// called with a translator over the existing entry and the stored value;
    /// it mutates the slot and returns whether to keep the mutation.
    pub fn add<F>(&mut self, log: &DataLog, key: &[u8], rep: u64, resolver: F) -> io::Result<()>
    where
        F: FnOnce(&mut KvTrans, &mut u64) -> bool,
    {
        if self.arena.root() == 0 {
            let page = self.arena.allocate_page_grow()?;
            init_node(&mut self.arena, page, NODE_LEAF);
            leaf_insert(&mut self.arena, page, 0, rep);
            self.arena.set_root(page);
            return Ok(());
        }

        let (leaf, path) = self.descend_with_path(log, key)?;
        match self.leaf_search(log, leaf, key)? {
            Ok(i) => {
                let mut slot = leaf_get(&self.arena, leaf, i);
                let mut trans = KvTrans::new(slot);
                if resolver(&mut trans, &mut slot) {
                    leaf_set(&mut self.arena, leaf, i, slot);
                }
                Ok(())
            }
            Err(i) => self.insert_in_leaf(leaf, i, rep, path),
        }
    }

    /// Removes `key`. Returns whether an entry was removed.
    pub fn del(&mut self, log: &DataLog, key: &[u8]) -> io::Result<bool> {
        if self.arena.root() == 0 {
            return Ok(false);
        }
        let (leaf, path) = self.descend_with_path(log, key)?;
        let Ok(i) = self.leaf_search(log, leaf, key)? else {
            return Ok(false);
        };
        leaf_remove(&mut self.arena, leaf, i);
        if node_count(&self.arena, leaf) == 0 {
            self.unlink_empty(leaf, path);
        }
        Ok(true)
    }

    fn descend(&self, log: &DataLog, key: &[u8]) -> io::Result<Option<u64>> {
        let root = self.arena.root();
        if root == 0 {
            return Ok(None);
        }
        let mut page = root;
        while node_kind(&self.arena, page) == NODE_INNER {
            let i = self.inner_position(log, page, key)?;
            page = page_ptr_offset(inner_child(&self.arena, page, i));
        }
        Ok(Some(page))
    }

    fn descend_with_path(&self, log: &DataLog, key: &[u8]) -> io::Result<(u64, Vec<(u64, usize)>)> {
        let mut page = self.arena.root();
        let mut path = Vec::new();
        while node_kind(&self.arena, page) == NODE_INNER {
            let i = self.inner_position(log, page, key)?;
            path.push((page, i));
            page = page_ptr_offset(inner_child(&self.arena, page, i));
        }
        Ok((page, path))
    }

    /// Child index for `key`: the number of separators ordering at or below
    /// it. Child `i` spans `sep[i-1] <= k < sep[i]`.
    fn inner_position(&self, log: &DataLog, page: u64, key: &[u8]) -> io::Result<usize> {
        let mut lo = 0;
        let mut hi = node_count(&self.arena, page);
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mut trans = KvTrans::new(inner_sep(&self.arena, page, mid));
            match trans.compare_key(log, key)? {
                Ordering::Greater => hi = mid,
                _ => lo = mid + 1,
            }
        }
        Ok(lo)
    }

    /// Binary search within a leaf: `Ok(i)` on an exact key, `Err(i)` with
    /// the insertion position otherwise.
    fn leaf_search(&self, log: &DataLog, page: u64, key: &[u8]) -> io::Result<Result<usize, usize>> {
        let mut lo = 0;
        let mut hi = node_count(&self.arena, page);
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mut trans = KvTrans::new(leaf_get(&self.arena, page, mid));
            match trans.compare_key(log, key)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    fn insert_in_leaf(
        &mut self,
        page: u64,
        pos: usize,
        rep: u64,
        path: Vec<(u64, usize)>,
    ) -> io::Result<()> {
        if node_count(&self.arena, page) < LEAF_CAP {
            leaf_insert(&mut self.arena, page, pos, rep);
            return Ok(());
        }

        // split: upper half moves to a fresh right sibling, the right
        // sibling's first entry becomes the separator
        let right = self.arena.allocate_page_grow()?;
        init_node(&mut self.arena, right, NODE_LEAF);
        let mid = LEAF_CAP / 2;
        for (j, i) in (mid..LEAF_CAP).enumerate() {
            let rep = leaf_get(&self.arena, page, i);
            leaf_set(&mut self.arena, right, j, rep);
        }
        set_node_count(&mut self.arena, right, LEAF_CAP - mid);
        set_node_count(&mut self.arena, page, mid);

        if pos <= mid {
            leaf_insert(&mut self.arena, page, pos, rep);
        } else {
            leaf_insert(&mut self.arena, right, pos - mid, rep);
        }

        let sep = leaf_get(&self.arena, right, 0);
        self.insert_in_parent(path, page, sep, right)
    }

    fn insert_in_parent(
        &mut self,
        mut path: Vec<(u64, usize)>,
        left: u64,
        sep: u64,
        right: u64,
    ) -> io::Result<()> {
        let mut left = left;
        let mut sep = sep;
        let mut right = right;
        loop {
            let Some((parent, idx)) = path.pop() else {
                let root = self.arena.allocate_page_grow()?;
                init_node(&mut self.arena, root, NODE_INNER);
                inner_set_child(&mut self.arena, root, 0, pack_page_ptr(left));
                inner_set_sep(&mut self.arena, root, 0, sep);
                inner_set_child(&mut self.arena, root, 1, pack_page_ptr(right));
                set_node_count(&mut self.arena, root, 1);
                self.arena.set_root(root);
                return Ok(());
            };

            if node_count(&self.arena, parent) < INNER_CAP {
                inner_insert(&mut self.arena, parent, idx, sep, pack_page_ptr(right));
                return Ok(());
            }

            // split the full parent; the middle separator moves up
            let mut seps: Vec<u64> = (0..INNER_CAP)
                .map(|i| inner_sep(&self.arena, parent, i))
                .collect();
            let mut children: Vec<u64> = (0..=INNER_CAP)
                .map(|i| inner_child(&self.arena, parent, i))
                .collect();
            seps.insert(idx, sep);
            children.insert(idx + 1, pack_page_ptr(right));

            let new_right = self.arena.allocate_page_grow()?;
            init_node(&mut self.arena, new_right, NODE_INNER);

            let mid = seps.len() / 2;
            let promoted = seps[mid];

            set_node_count(&mut self.arena, parent, mid);
            for (i, &s) in seps[..mid].iter().enumerate() {
                inner_set_sep(&mut self.arena, parent, i, s);
            }
            for (i, &c) in children[..=mid].iter().enumerate() {
                inner_set_child(&mut self.arena, parent, i, c);
            }

            let right_seps = &seps[mid + 1..];
            set_node_count(&mut self.arena, new_right, right_seps.len());
            for (i, &s) in right_seps.iter().enumerate() {
                inner_set_sep(&mut self.arena, new_right, i, s);
            }
            for (i, &c) in children[mid + 1..].iter().enumerate() {
                inner_set_child(&mut self.arena, new_right, i, c);
            }

            left = parent;
            sep = promoted;
            right = new_right;
        }
    }

    /// Frees an emptied leaf and drops its slot from the ancestor chain,
    /// collapsing inner nodes that lose their last child.
    fn unlink_empty(&mut self, page: u64, mut path: Vec<(u64, usize)>) {
        let mut page = page;
        loop {
            let Some((parent, idx)) = path.pop() else {
                self.arena.free_page(page);
                self.arena.set_root(0);
                return;
            };
            self.arena.free_page(page);

            if node_count(&self.arena, parent) == 0 {
                // single-child node lost its only child
                page = parent;
                continue;
            }
            inner_remove(&mut self.arena, parent, idx);
            return;
        }
    }
}

fn init_node(arena: &mut PageArena, page: u64, kind: u8) {
    let p = arena.page_mut(page);
    p[0] = 0;
    p[1] = 0;
    p[2] = kind;
}

fn node_kind(arena: &PageArena, page: u64) -> u8 {
    arena.page(page)[2]
}

fn node_count(arena: &PageArena, page: u64) -> usize {
    let p = arena.page(page);
    u16::from_le_bytes([p[0], p[1]]) as usize
}

fn set_node_count(arena: &mut PageArena, page: u64, count: usize) {
    let p = arena.page_mut(page);
    p[..2].copy_from_slice(&(count as u16).to_le_bytes());
}

fn read_entry(arena: &PageArena, page: u64, byte: usize) -> u64 {
    let p = arena.page(page);
    let mut b = [0u8; 8];
    b.copy_from_slice(&p[byte..byte + 8]);
    u64::from_le_bytes(b)
}

fn write_entry(arena: &mut PageArena, page: u64, byte: usize, v: u64) {
    let p = arena.page_mut(page);
    p[byte..byte + 8].copy_from_slice(&v.to_le_bytes());
}

// leaf layout: entries at 8 + 8 * i
fn leaf_get(arena: &PageArena, page: u64, i: usize) -> u64 {
    read_entry(arena, page, 8 + 8 * i)
}

fn leaf_set(arena: &mut PageArena, page: u64, i: usize, rep: u64) {
    write_entry(arena, page, 8 + 8 * i, rep);
}

fn leaf_insert(arena: &mut PageArena, page: u64, i: usize, rep: u64) {
    let count = node_count(arena, page);
    let p = arena.page_mut(page);
    let start = 8 + 8 * i;
    let end = 8 + 8 * count;
    p.copy_within(start..end, start + 8);
    p[start..start + 8].copy_from_slice(&rep.to_le_bytes());
    set_node_count(arena, page, count + 1);
}

fn leaf_remove(arena: &mut PageArena, page: u64, i: usize) {
    let count = node_count(arena, page);
    let p = arena.page_mut(page);
    let start = 8 + 8 * i;
    let end = 8 + 8 * count;
    p.copy_within(start + 8..end, start);
    set_node_count(arena, page, count - 1);
}

// inner layout: child i at 8 + 16 * i, separator i at 16 + 16 * i
fn inner_child(arena: &PageArena, page: u64, i: usize) -> u64 {
    read_entry(arena, page, 8 + 16 * i)
}

fn inner_set_child(arena: &mut PageArena, page: u64, i: usize, child: u64) {
    write_entry(arena, page, 8 + 16 * i, child);
}

fn inner_sep(arena: &PageArena, page: u64, i: usize) -> u64 {
    read_entry(arena, page, 16 + 16 * i)
}

fn inner_set_sep(arena: &mut PageArena, page: u64, i: usize, sep: u64) {
    write_entry(arena, page, 16 + 16 * i, sep);
}

/// Inserts separator `i` and child `i + 1` as a pair, shifting later pairs.
fn inner_insert(arena: &mut PageArena, page: u64, i: usize, sep: u64, child: u64) {
    let count = node_count(arena, page);
    let p = arena.page_mut(page);
    let start = 16 + 16 * i;
    let end = 16 + 16 * count;
    p.copy_within(start..end, start + 16);
    p[start..start + 8].copy_from_slice(&sep.to_le_bytes());
    p[start + 8..start + 16].copy_from_slice(&child.to_le_bytes());
    set_node_count(arena, page, count + 1);
}

/// Removes child `idx` and the separator between it and its left neighbour
/// (or the first separator when the leading child goes away).
fn inner_remove(arena: &mut PageArena, page: u64, idx: usize) {
    let count = node_count(arena, page);
    let p = arena.page_mut(page);
    let end = 16 + 16 * count;
    if idx == 0 {
        // drop child 0 and separator 0; child 1 becomes the leading child
        p.copy_within(24..end, 8);
    } else {
        // separator idx-1 and child idx are adjacent
        let start = 16 * idx;
        p.copy_within(start + 16..end, start);
    }
    set_node_count(arena, page, count - 1);
}
