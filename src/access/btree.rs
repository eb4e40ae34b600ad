pub mod node;

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use log::debug;
use parking_lot::Mutex;

use self::node::{new_nil_root_raw, new_root_raw, Node, SearchNext};
use crate::access::data_manager::{DataItemHandle, DataManager};
use crate::error::{DbError, DbResult};
use crate::transaction::SUPER_XID;

/// A B+Tree from `u64` keys to uids, with duplicate keys allowed.
///
/// Nodes are data items written under the super transaction. The tree is
/// reached through a boot item that stores the uid of the current root, so
/// the root can move when it splits. `u64::MAX` is reserved as the upper
/// bound of the rightmost child and cannot be stored.
///
/// Searches run concurrently with each other and with one insert; inserts
/// are serialized so a split always reaches the parent recorded on the way
/// down.
pub struct BPlusTree {
    dm: Arc<DataManager>,
    boot_uid: u64,
    boot: DataItemHandle,
    boot_lock: Mutex<()>,
    insert_lock: Mutex<()>,
}

impl BPlusTree {
    /// Create an empty tree and return the uid of its boot item.
    pub fn create(dm: &DataManager) -> DbResult<u64> {
        let root_uid = dm.insert(SUPER_XID, &new_nil_root_raw())?;
        let boot_uid = dm.insert(SUPER_XID, &root_uid.to_be_bytes())?;
        debug!("Created b+tree boot {:#x} with root {:#x}", boot_uid, root_uid);
        Ok(boot_uid)
    }

    pub fn load(boot_uid: u64, dm: Arc<DataManager>) -> DbResult<Self> {
        let boot = dm.read(boot_uid)?.ok_or(DbError::NullEntry(boot_uid))?;
        if boot.len() != 8 {
            return Err(DbError::corrupted(
                "b+tree",
                format!("boot item {:#x} is {} bytes", boot_uid, boot.len()),
            ));
        }
        Ok(Self {
            dm,
            boot_uid,
            boot,
            boot_lock: Mutex::new(()),
            insert_lock: Mutex::new(()),
        })
    }

    pub fn boot_uid(&self) -> u64 {
        self.boot_uid
    }

    fn root_uid(&self) -> u64 {
        let _guard = self.boot_lock.lock();
        self.boot.with_data(BigEndian::read_u64)
    }

    fn update_root_uid(&self, left: u64, right: u64, right_key: u64) -> DbResult<()> {
        let _guard = self.boot_lock.lock();
        let new_root = self
            .dm
            .insert(SUPER_XID, &new_root_raw(left, right, right_key))?;

        let mut writer = self.boot.before();
        writer.write_data(0, &new_root.to_be_bytes())?;
        writer.after(SUPER_XID)?;
        debug!("B+tree {:#x} has a new root {:#x}", self.boot_uid, new_root);
        Ok(())
    }

    /// Uids stored under `key`.
    pub fn search(&self, key: u64) -> DbResult<Vec<u64>> {
        self.search_range(key, key)
    }

    /// Uids stored under keys in `[left_key, right_key]`, in key order.
    pub fn search_range(&self, left_key: u64, right_key: u64) -> DbResult<Vec<u64>> {
        let mut leaf_uid = self.search_leaf(self.root_uid(), left_key)?;
        let mut uids = Vec::new();
        loop {
            let leaf = Node::load(&self.dm, leaf_uid)?;
            let res = leaf.leaf_search_range(left_key, right_key);
            uids.extend(res.uids);
            if res.sibling == 0 {
                break;
            }
            leaf_uid = res.sibling;
        }
        Ok(uids)
    }

    pub fn insert(&self, key: u64, uid: u64) -> DbResult<()> {
        if key == u64::MAX {
            return Err(DbError::corrupted("b+tree", "u64::MAX is a reserved key"));
        }

        let _guard = self.insert_lock.lock();
        let root_uid = self.root_uid();

        // Internal nodes entered on the way down, for split propagation.
        let mut path = Vec::new();
        let mut node_uid = root_uid;
        while !Node::load(&self.dm, node_uid)?.is_leaf() {
            path.push(node_uid);
            node_uid = self.search_next(node_uid, key)?;
        }

        let mut split = self.insert_and_split(node_uid, uid, key)?;
        while let Some((new_son, new_key)) = split {
            split = match path.pop() {
                Some(parent) => self.insert_and_split(parent, new_son, new_key)?,
                None => {
                    self.update_root_uid(root_uid, new_son, new_key)?;
                    None
                }
            };
        }
        Ok(())
    }

    /// Leftmost leaf that may hold `key`.
    fn search_leaf(&self, mut node_uid: u64, key: u64) -> DbResult<u64> {
        loop {
            let node = Node::load(&self.dm, node_uid)?;
            if node.is_leaf() {
                return Ok(node_uid);
            }
            node_uid = self.follow(node_uid, key, Node::search_first)?;
        }
    }

    /// Child of `node_uid` an insert of `key` descends into.
    fn search_next(&self, node_uid: u64, key: u64) -> DbResult<u64> {
        self.follow(node_uid, key, Node::search_next)
    }

    /// Pick a child of `node_uid` with `pick`, following right siblings.
    fn follow(
        &self,
        mut node_uid: u64,
        key: u64,
        pick: fn(&Node, u64) -> SearchNext,
    ) -> DbResult<u64> {
        loop {
            let res = pick(&Node::load(&self.dm, node_uid)?, key);
            if res.uid != 0 {
                return Ok(res.uid);
            }
            if res.sibling == 0 {
                return Err(DbError::corrupted(
                    "b+tree",
                    format!("no child of {:#x} covers key {}", node_uid, key),
                ));
            }
            node_uid = res.sibling;
        }
    }

    /// Insert into `node_uid` or the sibling it defers to. Returns the new
    /// node to hook into the parent if a split happened.
    fn insert_and_split(&self, mut node_uid: u64, uid: u64, key: u64) -> DbResult<Option<(u64, u64)>> {
        loop {
            let res = Node::load(&self.dm, node_uid)?.insert_and_split(&self.dm, uid, key)?;
            if res.sibling != 0 {
                node_uid = res.sibling;
                continue;
            }
            return Ok((res.new_son != 0).then_some((res.new_son, res.new_key)));
        }
    }
}
