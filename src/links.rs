// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardlink accounting.
//!
//! Every hardlink entry belongs to an inode class keyed by
//! `(device, inode)`.  Members of a class form a circular ring
//! through `LinkEnt::next_link`.  A class is "counted" when its
//! contribution is currently reflected in ancestor aggregates; the
//! pending set remembers classes that need (re)counting so that
//! incremental aggregation does not have to sweep the whole map.
//!
//! Attribution rule: a class contributes its size once to every
//! directory that contains at least one member.  Directories holding
//! fewer members than the effective link count also receive the size
//! in their shared totals, since some link lives outside them.

use crate::entry::{LinkEnt, NodeId, NodeKind, Tree, add_blocks};
use hashbrown::{HashMap, HashSet};
use log::warn;
use std::sync::atomic::{AtomicU32, Ordering};

pub type ClassKey = (u64, u64);

#[derive(Debug)]
struct Class {
    head: NodeId,
    len: u32,
    counted: bool,
}

#[derive(Debug, Default)]
pub struct LinkMap {
    map: HashMap<ClassKey, Class>,
    pending: HashSet<ClassKey>,
    full_sweep: bool,
    /// Aggregation progress, sampled by the UI.
    done: AtomicU32,
    total: AtomicU32,
}

fn link(tree: &Tree, id: NodeId) -> &LinkEnt {
    match &tree[id].kind {
        NodeKind::Link(l) => l,
        _ => unreachable!("inode map member is not a link"),
    }
}

fn link_mut(tree: &mut Tree, id: NodeId) -> &mut LinkEnt {
    match &mut tree[id].kind {
        NodeKind::Link(l) => l,
        _ => unreachable!("inode map member is not a link"),
    }
}

impl LinkMap {
    pub fn new() -> LinkMap {
        LinkMap::default()
    }

    /// The class key of a link: its inode paired with the raw device
    /// of the directory holding it.
    pub fn key(tree: &Tree, id: NodeId) -> ClassKey {
        let ino = link(tree, id).ino;
        let dev = tree[id]
            .parent
            .and_then(|p| tree[p].dir().map(|d| tree.devices.raw(d.dev)))
            .unwrap_or(0);
        (dev, ino)
    }

    /// Inserts `id` into its class ring and marks the class for
    /// (re)counting.
    pub fn add_link(&mut self, tree: &mut Tree, id: NodeId) {
        let key = Self::key(tree, id);
        if let Some((head, counted)) =
            self.map.get(&key).map(|c| (c.head, c.counted))
        {
            if counted {
                self.set_stats(tree, key, false);
            }
            let head_next = link(tree, head).next_link;
            link_mut(tree, id).next_link = head_next;
            link_mut(tree, head).next_link = id;
            if let Some(c) = self.map.get_mut(&key) {
                c.len = c.len.saturating_add(1);
            }
        } else {
            link_mut(tree, id).next_link = id;
            self.map.insert(key, Class { head: id, len: 1, counted: false });
        }
        self.mark_pending(key);
    }

    /// Unlinks `id` from its ring; drops the class when it empties.
    /// The class must already be uncounted.
    pub fn remove_link(&mut self, tree: &mut Tree, id: NodeId) {
        let key = Self::key(tree, id);
        let Some(c) = self.map.get(&key) else { return };
        if c.len <= 1 {
            self.map.remove(&key);
            self.pending.remove(&key);
            return;
        }
        let next = link(tree, id).next_link;
        let mut prev = next;
        while link(tree, prev).next_link != id {
            prev = link(tree, prev).next_link;
        }
        link_mut(tree, prev).next_link = next;
        let Some(c) = self.map.get_mut(&key) else { return };
        c.len -= 1;
        if c.head == id {
            c.head = next;
        }
        self.mark_pending(key);
    }

    /// Makes sure a class whose members changed is uncounted and
    /// queued for recount.
    pub fn uncount(&mut self, tree: &mut Tree, key: ClassKey) {
        if self.map.get(&key).is_some_and(|c| c.counted) {
            self.set_stats(tree, key, false);
        }
        if self.map.contains_key(&key) {
            self.mark_pending(key);
        }
    }

    fn mark_pending(&mut self, key: ClassKey) {
        if self.full_sweep {
            return;
        }
        self.pending.insert(key);
        if self.pending.len() > self.map.len() / 8 {
            self.pending.clear();
            self.full_sweep = true;
        }
    }

    fn members(&self, tree: &Tree, head: NodeId) -> Vec<NodeId> {
        let mut v = vec![head];
        let mut m = link(tree, head).next_link;
        while m != head {
            v.push(m);
            m = link(tree, m).next_link;
        }
        v
    }

    /// Adds (or subtracts) a class's contribution to every ancestor
    /// holding at least one member, with shared attribution to those
    /// holding fewer than the effective link count.
    pub fn set_stats(&mut self, tree: &mut Tree, key: ClassKey, add: bool) {
        let Some(c) = self.map.get(&key) else { return };
        let members = self.members(tree, c.head);
        let rep = link(tree, c.head);
        let (blocks, size) = (rep.blocks, rep.size);
        let declared = link(tree, members[0]).nlink;
        let consistent =
            members.iter().all(|&m| link(tree, m).nlink == declared);
        let nlink = if consistent && declared > 0 {
            declared
        } else {
            if !consistent {
                warn!(
                    "inconsistent link count for inode {}:{}; using {}",
                    key.0,
                    key.1,
                    members.len()
                );
            }
            members.len() as u32
        };
        let mut counts: HashMap<NodeId, u32> = HashMap::new();
        for &m in &members {
            let mut anc = tree[m].parent;
            while let Some(a) = anc {
                *counts.entry(a).or_insert(0) += 1;
                anc = tree[a].parent;
            }
        }
        for (&dir, &cnt) in &counts {
            let Some(d) = tree[dir].dir_mut() else { continue };
            if add {
                d.cum_blocks = add_blocks(d.cum_blocks, blocks);
                d.cum_size = d.cum_size.saturating_add(size);
            } else {
                d.cum_blocks = d.cum_blocks.saturating_sub(blocks);
                d.cum_size = d.cum_size.saturating_sub(size);
            }
            if cnt < nlink {
                if add {
                    d.shared_blocks = add_blocks(d.shared_blocks, blocks);
                    d.shared_size = d.shared_size.saturating_add(size);
                } else {
                    d.shared_blocks = d.shared_blocks.saturating_sub(blocks);
                    d.shared_size = d.shared_size.saturating_sub(size);
                }
            }
        }
        if let Some(c) = self.map.get_mut(&key) {
            c.counted = add;
        }
    }

    /// Commits every class that needs it.  Called from a quiescent
    /// state; no scanner threads may be running.
    pub fn add_all_stats(&mut self, tree: &mut Tree) {
        let keys: Vec<ClassKey> = if self.full_sweep {
            self.map.keys().copied().collect()
        } else {
            self.pending.iter().copied().collect()
        };
        self.total.store(keys.len() as u32, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
        for (i, key) in keys.iter().enumerate() {
            if self.map.get(key).is_some_and(|c| !c.counted) {
                self.set_stats(tree, *key, true);
            }
            if i % 64 == 0 {
                self.done.store(i as u32, Ordering::Relaxed);
            }
        }
        self.done.store(keys.len() as u32, Ordering::Relaxed);
        self.pending.clear();
        self.full_sweep = false;
    }

    /// Aggregation progress as a monotonic done/total pair.
    pub fn progress(&self) -> (u32, u32) {
        (self.done.load(Ordering::Relaxed), self.total.load(Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn sweeping(&self) -> bool {
        self.full_sweep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{DirEnt, Node};

    fn dir(tree: &mut Tree, parent: Option<NodeId>, name: &[u8]) -> NodeId {
        let dev = tree.devices.intern(1);
        let id = tree.push(Node {
            name: name.into(),
            parent,
            next: None,
            ext: None,
            kind: NodeKind::Dir(DirEnt::new(dev, 0, 0)),
        });
        if parent.is_none() {
            tree.root = Some(id);
        }
        id
    }

    fn hardlink(
        tree: &mut Tree,
        parent: NodeId,
        name: &[u8],
        ino: u64,
        nlink: u32,
    ) -> NodeId {
        tree.push(Node {
            name: name.into(),
            parent: Some(parent),
            next: None,
            ext: None,
            kind: NodeKind::Link(LinkEnt {
                blocks: 16,
                size: 1000,
                ino,
                nlink,
                next_link: NodeId::default(),
            }),
        })
    }

    #[test]
    fn class_fully_inside_is_not_shared() {
        let mut tree = Tree::new();
        let mut links = LinkMap::new();
        let r = dir(&mut tree, None, b"r");
        let x = hardlink(&mut tree, r, b"x", 7, 2);
        let y = hardlink(&mut tree, r, b"y", 7, 2);
        links.add_link(&mut tree, x);
        links.add_link(&mut tree, y);
        links.add_all_stats(&mut tree);
        let d = tree[r].dir().unwrap();
        assert_eq!(d.cum_size, 1000);
        assert_eq!(d.cum_blocks, 16);
        assert_eq!(d.shared_size, 0);
        assert_eq!(d.shared_blocks, 0);
        assert_eq!(links.progress(), (1, 1));
    }

    #[test]
    fn class_partly_outside_is_shared() {
        let mut tree = Tree::new();
        let mut links = LinkMap::new();
        let r = dir(&mut tree, None, b"r");
        let x = hardlink(&mut tree, r, b"x", 7, 2);
        links.add_link(&mut tree, x);
        links.add_all_stats(&mut tree);
        let d = tree[r].dir().unwrap();
        assert_eq!(d.cum_size, 1000);
        assert_eq!(d.shared_size, 1000);
        assert_eq!(d.shared_blocks, 16);
    }

    #[test]
    fn inconsistent_nlink_falls_back_to_ring_length() {
        let mut tree = Tree::new();
        let mut links = LinkMap::new();
        let r = dir(&mut tree, None, b"r");
        let x = hardlink(&mut tree, r, b"x", 7, 2);
        let y = hardlink(&mut tree, r, b"y", 7, 5);
        links.add_link(&mut tree, x);
        links.add_link(&mut tree, y);
        links.add_all_stats(&mut tree);
        // Ring length 2 wins; both members are inside `r`, so the
        // class is fully contained and nothing is shared.
        let d = tree[r].dir().unwrap();
        assert_eq!(d.cum_size, 1000);
        assert_eq!(d.shared_size, 0);
    }

    #[test]
    fn nested_ancestors_get_shared_attribution() {
        let mut tree = Tree::new();
        let mut links = LinkMap::new();
        let r = dir(&mut tree, None, b"r");
        let a = dir(&mut tree, Some(r), b"a");
        let b = dir(&mut tree, Some(r), b"b");
        let x = hardlink(&mut tree, a, b"x", 7, 2);
        let y = hardlink(&mut tree, b, b"y", 7, 2);
        links.add_link(&mut tree, x);
        links.add_link(&mut tree, y);
        links.add_all_stats(&mut tree);
        // Each of a and b sees one of two links: size counted and
        // shared.  r contains the whole class: counted, not shared.
        assert_eq!(tree[a].dir().unwrap().cum_size, 1000);
        assert_eq!(tree[a].dir().unwrap().shared_size, 1000);
        assert_eq!(tree[b].dir().unwrap().shared_size, 1000);
        assert_eq!(tree[r].dir().unwrap().cum_size, 1000);
        assert_eq!(tree[r].dir().unwrap().shared_size, 0);
    }

    #[test]
    fn remove_link_uncounts_and_unlinks() {
        let mut tree = Tree::new();
        let mut links = LinkMap::new();
        let r = dir(&mut tree, None, b"r");
        let x = hardlink(&mut tree, r, b"x", 7, 2);
        let y = hardlink(&mut tree, r, b"y", 7, 2);
        links.add_link(&mut tree, x);
        links.add_link(&mut tree, y);
        links.add_all_stats(&mut tree);
        let key = LinkMap::key(&tree, y);
        links.uncount(&mut tree, key);
        links.remove_link(&mut tree, y);
        links.add_all_stats(&mut tree);
        let d = tree[r].dir().unwrap();
        // One link left, nlink still 2: shared again.
        assert_eq!(d.cum_size, 1000);
        assert_eq!(d.shared_size, 1000);
    }

    #[test]
    fn small_pending_set_escalates_to_full_sweep() {
        let mut tree = Tree::new();
        let mut links = LinkMap::new();
        let r = dir(&mut tree, None, b"r");
        let x = hardlink(&mut tree, r, b"x", 7, 2);
        links.add_link(&mut tree, x);
        assert!(links.sweeping());
    }
}
