//! B+Tree node layout.
//!
//! ```text
//! [IsLeaf:1][KeyCount:2][Sibling:8]
//! [Son0:8][Key0:8][Son1:8][Key1:8]...
//! ```
//!
//! In a leaf, `Son_i` is the uid stored under `Key_i`. In an internal node,
//! `Son_i` covers keys below `Key_i`; the last key of the rightmost node on
//! each level is `u64::MAX`.

use byteorder::{BigEndian, ByteOrder};

use crate::access::data_manager::{DataItemHandle, DataManager};
use crate::error::{DbError, DbResult};
use crate::transaction::SUPER_XID;

const IS_LEAF_OFFSET: usize = 0;
const NO_KEYS_OFFSET: usize = IS_LEAF_OFFSET + 1;
const SIBLING_OFFSET: usize = NO_KEYS_OFFSET + 2;
const NODE_HEADER_SIZE: usize = SIBLING_OFFSET + 8;
const ENTRY_SIZE: usize = 16;

pub const BALANCE_NUMBER: usize = 32;
pub const NODE_SIZE: usize = NODE_HEADER_SIZE + ENTRY_SIZE * (BALANCE_NUMBER * 2 + 2);

fn set_raw_is_leaf(raw: &mut [u8], is_leaf: bool) {
    raw[IS_LEAF_OFFSET] = is_leaf as u8;
}

fn raw_is_leaf(raw: &[u8]) -> bool {
    raw[IS_LEAF_OFFSET] == 1
}

fn set_raw_no_keys(raw: &mut [u8], no_keys: usize) {
    BigEndian::write_u16(&mut raw[NO_KEYS_OFFSET..SIBLING_OFFSET], no_keys as u16);
}

fn raw_no_keys(raw: &[u8]) -> usize {
    BigEndian::read_u16(&raw[NO_KEYS_OFFSET..SIBLING_OFFSET]) as usize
}

fn set_raw_sibling(raw: &mut [u8], sibling: u64) {
    BigEndian::write_u64(&mut raw[SIBLING_OFFSET..NODE_HEADER_SIZE], sibling);
}

fn raw_sibling(raw: &[u8]) -> u64 {
    BigEndian::read_u64(&raw[SIBLING_OFFSET..NODE_HEADER_SIZE])
}

fn son_offset(kth: usize) -> usize {
    NODE_HEADER_SIZE + kth * ENTRY_SIZE
}

fn set_raw_kth_son(raw: &mut [u8], uid: u64, kth: usize) {
    let offset = son_offset(kth);
    BigEndian::write_u64(&mut raw[offset..offset + 8], uid);
}

fn raw_kth_son(raw: &[u8], kth: usize) -> u64 {
    let offset = son_offset(kth);
    BigEndian::read_u64(&raw[offset..offset + 8])
}

fn set_raw_kth_key(raw: &mut [u8], key: u64, kth: usize) {
    let offset = son_offset(kth) + 8;
    BigEndian::write_u64(&mut raw[offset..offset + 8], key);
}

fn raw_kth_key(raw: &[u8], kth: usize) -> u64 {
    let offset = son_offset(kth) + 8;
    BigEndian::read_u64(&raw[offset..offset + 8])
}

/// Copy entries `kth..` of `from` to the front of `to`.
fn copy_raw_from_kth(from: &[u8], to: &mut [u8], kth: usize) {
    let offset = son_offset(kth);
    let len = NODE_SIZE - offset;
    to[NODE_HEADER_SIZE..NODE_HEADER_SIZE + len].copy_from_slice(&from[offset..NODE_SIZE]);
}

/// Move entries `kth..` one slot to the right, dropping the last slot.
fn shift_raw_kth(raw: &mut [u8], kth: usize) {
    let begin = son_offset(kth + 1);
    raw.copy_within(begin - ENTRY_SIZE..NODE_SIZE - ENTRY_SIZE, begin);
}

/// An internal root with two children split at `key`.
pub fn new_root_raw(left: u64, right: u64, key: u64) -> Vec<u8> {
    let mut raw = vec![0u8; NODE_SIZE];
    set_raw_is_leaf(&mut raw, false);
    set_raw_no_keys(&mut raw, 2);
    set_raw_sibling(&mut raw, 0);
    set_raw_kth_son(&mut raw, left, 0);
    set_raw_kth_key(&mut raw, key, 0);
    set_raw_kth_son(&mut raw, right, 1);
    set_raw_kth_key(&mut raw, u64::MAX, 1);
    raw
}

/// An empty leaf root.
pub fn new_nil_root_raw() -> Vec<u8> {
    let mut raw = vec![0u8; NODE_SIZE];
    set_raw_is_leaf(&mut raw, true);
    set_raw_no_keys(&mut raw, 0);
    set_raw_sibling(&mut raw, 0);
    raw
}

/// Where a descent continues: a child (`uid`) or, if every key is
/// smaller, the right sibling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchNext {
    pub uid: u64,
    pub sibling: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafSearchRange {
    pub uids: Vec<u64>,
    /// Non-zero when the range may continue in the right sibling.
    pub sibling: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertAndSplit {
    /// Non-zero when the key belongs further right.
    pub sibling: u64,
    /// Non-zero when the node split; the parent needs `(new_son, new_key)`.
    pub new_son: u64,
    pub new_key: u64,
}

/// Insert `(uid, key)` into a node, or return `false` when the key belongs
/// to the right sibling.
fn insert_raw(raw: &mut [u8], uid: u64, key: u64) -> bool {
    let no_keys = raw_no_keys(raw);
    let kth = (0..no_keys)
        .find(|&k| raw_kth_key(raw, k) >= key)
        .unwrap_or(no_keys);

    if kth == no_keys && raw_sibling(raw) != 0 {
        return false;
    }

    if raw_is_leaf(raw) {
        shift_raw_kth(raw, kth);
        set_raw_kth_key(raw, key, kth);
        set_raw_kth_son(raw, uid, kth);
    } else {
        let kk = raw_kth_key(raw, kth);
        set_raw_kth_key(raw, key, kth);
        shift_raw_kth(raw, kth + 1);
        set_raw_kth_key(raw, kk, kth + 1);
        set_raw_kth_son(raw, uid, kth + 1);
    }
    set_raw_no_keys(raw, no_keys + 1);
    true
}

/// A node loaded from its data item.
pub struct Node {
    uid: u64,
    item: DataItemHandle,
}

impl Node {
    pub fn load(dm: &DataManager, uid: u64) -> DbResult<Self> {
        let item = dm.read(uid)?.ok_or(DbError::NullEntry(uid))?;
        if item.len() != NODE_SIZE {
            return Err(DbError::corrupted(
                "b+tree",
                format!("node {:#x} is {} bytes", uid, item.len()),
            ));
        }
        Ok(Self { uid, item })
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn is_leaf(&self) -> bool {
        self.item.with_data(raw_is_leaf)
    }

    pub fn search_next(&self, key: u64) -> SearchNext {
        self.item.with_data(|raw| {
            let no_keys = raw_no_keys(raw);
            match (0..no_keys).find(|&k| key < raw_kth_key(raw, k)) {
                Some(k) => SearchNext {
                    uid: raw_kth_son(raw, k),
                    sibling: 0,
                },
                None => SearchNext {
                    uid: 0,
                    sibling: raw_sibling(raw),
                },
            }
        })
    }

    /// Like [`search_next`](Node::search_next), but stops at the first key
    /// not below `key`. A split inside a run of equal keys leaves copies of
    /// the separator in the left child, so reads must start there.
    pub fn search_first(&self, key: u64) -> SearchNext {
        self.item.with_data(|raw| {
            let no_keys = raw_no_keys(raw);
            match (0..no_keys).find(|&k| raw_kth_key(raw, k) >= key) {
                Some(k) => SearchNext {
                    uid: raw_kth_son(raw, k),
                    sibling: 0,
                },
                None => SearchNext {
                    uid: 0,
                    sibling: raw_sibling(raw),
                },
            }
        })
    }

    pub fn leaf_search_range(&self, left_key: u64, right_key: u64) -> LeafSearchRange {
        self.item.with_data(|raw| {
            let no_keys = raw_no_keys(raw);
            let mut kth = (0..no_keys)
                .find(|&k| raw_kth_key(raw, k) >= left_key)
                .unwrap_or(no_keys);

            let mut uids = Vec::new();
            while kth < no_keys && raw_kth_key(raw, kth) <= right_key {
                uids.push(raw_kth_son(raw, kth));
                kth += 1;
            }

            let sibling = if kth == no_keys { raw_sibling(raw) } else { 0 };
            LeafSearchRange { uids, sibling }
        })
    }

    /// Insert `(uid, key)`, splitting the node once it holds
    /// `2 * BALANCE_NUMBER` keys. Changes are logged under the super
    /// transaction.
    pub fn insert_and_split(&self, dm: &DataManager, uid: u64, key: u64) -> DbResult<InsertAndSplit> {
        let mut writer = self.item.before();

        if !writer.with_data_mut(|raw| insert_raw(raw, uid, key)) {
            let sibling = writer.with_data(raw_sibling);
            writer.un_before();
            return Ok(InsertAndSplit {
                sibling,
                ..Default::default()
            });
        }

        if writer.with_data(raw_no_keys) < BALANCE_NUMBER * 2 {
            writer.after(SUPER_XID)?;
            return Ok(InsertAndSplit::default());
        }

        let new_raw = writer.with_data(|raw| {
            let mut new_raw = vec![0u8; NODE_SIZE];
            set_raw_is_leaf(&mut new_raw, raw_is_leaf(raw));
            set_raw_no_keys(&mut new_raw, BALANCE_NUMBER);
            set_raw_sibling(&mut new_raw, raw_sibling(raw));
            copy_raw_from_kth(raw, &mut new_raw, BALANCE_NUMBER);
            new_raw
        });
        let new_son = dm.insert(SUPER_XID, &new_raw)?;

        writer.with_data_mut(|raw| {
            set_raw_no_keys(raw, BALANCE_NUMBER);
            set_raw_sibling(raw, new_son);
        });
        writer.after(SUPER_XID)?;

        Ok(InsertAndSplit {
            sibling: 0,
            new_son,
            new_key: raw_kth_key(&new_raw, 0),
        })
    }
}
