//! Arena snapshot of blocks with a parent → children index.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use serde::Serialize;

use crate::scope::AccessScope;

use super::{AddressFamily, AddressRecord, BlockId, BlockRecord, TenantId};

/// Read-only view of blocks keyed by id. Children are found through the
/// index, never through references between records.
#[derive(Debug, Clone, Default)]
pub struct BlockTree {
    blocks: BTreeMap<BlockId, BlockRecord>,
    children: HashMap<BlockId, Vec<BlockId>>,
}

/// A block with its nested children and addresses.
#[derive(Debug, Clone, Serialize)]
pub struct BlockNode {
    #[serde(flatten)]
    pub block: BlockRecord,
    pub addresses: Vec<AddressRecord>,
    pub children: Vec<BlockNode>,
}

impl BlockTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = BlockRecord>,
    {
        let mut tree = Self::new();
        for record in records {
            tree.insert(record);
        }
        tree
    }

    /// Insert or replace a block, keeping the child index consistent.
    pub fn insert(&mut self, record: BlockRecord) {
        if let Some(previous) = self.blocks.get(&record.id) {
            if let Some(old_parent) = previous.parent_id {
                if let Some(siblings) = self.children.get_mut(&old_parent) {
                    siblings.retain(|id| *id != record.id);
                }
            }
        }
        if let Some(parent) = record.parent_id {
            self.children.entry(parent).or_default().push(record.id);
        }
        self.blocks.insert(record.id, record);
    }

    pub fn get(&self, id: BlockId) -> Option<&BlockRecord> {
        self.blocks.get(&id)
    }

    /// Look up a block the scope is allowed to see.
    pub fn get_scoped(&self, id: BlockId, scope: &AccessScope) -> Option<&BlockRecord> {
        self.get(id).filter(|b| scope.permits(b.tenant_id))
    }

    /// Direct children ordered by network.
    pub fn children(&self, id: BlockId) -> Vec<&BlockRecord> {
        let mut children: Vec<&BlockRecord> = self
            .children
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|child| self.blocks.get(child))
            .collect();
        children.sort_by(|a, b| a.network.cmp(&b.network));
        children
    }

    pub fn is_leaf(&self, id: BlockId) -> bool {
        self.children.get(&id).map_or(true, |c| c.is_empty())
    }

    /// Root blocks of one tenant and address family.
    pub fn roots(&self, tenant: TenantId, family: AddressFamily) -> impl Iterator<Item = &BlockRecord> {
        self.blocks
            .values()
            .filter(move |b| b.is_root() && b.tenant_id == tenant && b.family == family)
    }

    /// All blocks visible to the scope, ordered by id.
    pub fn visible<'a>(&'a self, scope: &'a AccessScope) -> impl Iterator<Item = &'a BlockRecord> + 'a {
        self.blocks.values().filter(move |b| scope.permits(b.tenant_id))
    }

    /// The deepest descendant of `id` whose network contains `addr`.
    pub fn deepest_containing(&self, id: BlockId, addr: IpAddr) -> Option<&BlockRecord> {
        let mut found = None;
        let mut current = id;
        while let Some(child) = self
            .children(current)
            .into_iter()
            .find(|c| c.network.contains(&addr))
        {
            found = Some(child);
            current = child.id;
        }
        found
    }

    /// Ids of `id` and everything below it.
    pub fn subtree_ids(&self, id: BlockId) -> Vec<BlockId> {
        let mut ids = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if !self.blocks.contains_key(&next) {
                continue;
            }
            ids.push(next);
            if let Some(children) = self.children.get(&next) {
                stack.extend(children.iter().copied());
            }
        }
        ids
    }

    /// Build the nested hierarchy under `id`. `addresses_of` supplies the
    /// addresses registered directly in each block.
    pub fn hierarchy<F>(&self, id: BlockId, addresses_of: &mut F) -> Option<BlockNode>
    where
        F: FnMut(&BlockRecord) -> Vec<AddressRecord>,
    {
        let block = self.blocks.get(&id)?;
        let mut children = Vec::new();
        for child in self.children(id) {
            if let Some(node) = self.hierarchy(child.id, addresses_of) {
                children.push(node);
            }
        }
        Some(BlockNode {
            block: block.clone(),
            addresses: addresses_of(block),
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipblock::testutil::block;

    fn sample() -> BlockTree {
        BlockTree::from_records([
            block(1, 1, "10.0.0.0/24", None),
            block(2, 1, "10.0.0.0/25", Some(1)),
            block(3, 1, "10.0.0.128/25", Some(1)),
            block(4, 1, "10.0.0.128/26", Some(3)),
            block(5, 1, "10.0.0.192/26", Some(3)),
            block(6, 2, "192.168.0.0/16", None),
        ])
    }

    #[test]
    fn test_children_and_leaves() {
        let tree = sample();
        let children: Vec<BlockId> = tree.children(1).iter().map(|b| b.id).collect();
        assert_eq!(children, vec![2, 3]);
        assert!(!tree.is_leaf(1));
        assert!(tree.is_leaf(2));
        assert!(tree.is_leaf(6));
        assert_eq!(tree.roots(1, AddressFamily::V4).count(), 1);
        assert_eq!(tree.roots(1, AddressFamily::V6).count(), 0);
    }

    #[test]
    fn test_deepest_containing() {
        let tree = sample();
        let addr: IpAddr = "10.0.0.200".parse().unwrap();
        assert_eq!(tree.deepest_containing(1, addr).map(|b| b.id), Some(5));
        let addr: IpAddr = "10.0.0.10".parse().unwrap();
        assert_eq!(tree.deepest_containing(1, addr).map(|b| b.id), Some(2));
        let outside: IpAddr = "10.9.9.9".parse().unwrap();
        assert!(tree.deepest_containing(1, outside).is_none());
    }

    #[test]
    fn test_scoped_lookup() {
        let tree = sample();
        assert!(tree.get_scoped(6, &AccessScope::Tenant(1)).is_none());
        assert!(tree.get_scoped(6, &AccessScope::Tenant(2)).is_some());
        assert_eq!(tree.visible(&AccessScope::Tenant(1)).count(), 5);
        assert_eq!(tree.visible(&AccessScope::Unrestricted).count(), 6);
    }

    #[test]
    fn test_hierarchy_and_subtree() {
        let tree = sample();
        let mut subtree = tree.subtree_ids(3);
        subtree.sort();
        assert_eq!(subtree, vec![3, 4, 5]);

        let node = tree.hierarchy(1, &mut |_| Vec::new()).unwrap();
        assert_eq!(node.children.len(), 2);
        assert_eq!(node.children[1].children.len(), 2);
        assert!(tree.hierarchy(42, &mut |_| Vec::new()).is_none());
    }

    #[test]
    fn test_reinsert_moves_child_index() {
        let mut tree = sample();
        let mut moved = tree.get(4).unwrap().clone();
        moved.parent_id = Some(1);
        tree.insert(moved);
        assert_eq!(tree.children(3).len(), 1);
        assert_eq!(tree.children(1).len(), 3);
    }
}
