// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The entry model.
//!
//! Scanned entries live in an arena owned by a [`Tree`] and refer to
//! each other by [`NodeId`].  An entry is a tagged variant: directory,
//! regular file, non-regular file, hardlink, or a sizeless "special"
//! that records why a name was excluded or unreadable.  Directories
//! own their children as a singly linked sibling list; hardlinks
//! additionally belong to an equivalence class kept by the inode map
//! in `links`, which is a lookup relation, not ownership.
//!
//! Block counts are in 512-byte units and saturate at 2^60-1; item
//! counts saturate at 2^32-1; byte sizes saturate at 2^64-1.

use hashbrown::HashMap;

/// Largest representable block count, in 512-byte units.
pub const MAX_BLOCKS: u64 = (1 << 60) - 1;

/// Number of distinct devices an interned device id can address.
pub const MAX_DEVICES: u32 = 1 << 30;

/// Index of an entry in its [`Tree`]'s arena.
///
/// The `Default` value is a placeholder for fields that are always
/// assigned before use, such as a fresh link's ring pointer.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct NodeId(u32);

/// A dense, interned device identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DevId(u32);

/// Saturating block addition, clamped to [`MAX_BLOCKS`].
pub fn add_blocks(a: u64, b: u64) -> u64 {
    u64::min(a.saturating_add(b), MAX_BLOCKS)
}

/// Extended metadata, each field individually optional.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Ext {
    pub mtime: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
}

impl Ext {
    pub fn is_empty(&self) -> bool {
        self.mtime.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.mode.is_none()
    }
}

/// Why a special entry carries no size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SpecialKind {
    /// The entry could not be stat'ed or its directory not opened.
    Err,
    /// Excluded by pattern (or a `CACHEDIR.TAG` match).
    Pattern,
    /// On a different filesystem than its parent.
    OtherFs,
    /// A Linux pseudo-filesystem such as /proc or /sys.
    Kernfs,
}

/// A directory entry.
#[derive(Clone, Debug)]
pub struct DirEnt {
    pub dev: DevId,
    /// Blocks and apparent size of the directory's own inode.
    pub blocks: u64,
    pub size: u64,
    /// Cumulative counts, including the directory itself.
    pub cum_blocks: u64,
    pub cum_size: u64,
    /// Contribution of hardlinked inodes that also have a link
    /// outside this directory.
    pub shared_blocks: u64,
    pub shared_size: u64,
    /// Number of transitive descendant entries.
    pub items: u32,
    /// This directory could not be fully read.
    pub err: bool,
    /// Some transitive descendant has a read error.
    pub suberr: bool,
    /// First child in the sibling list.
    pub sub: Option<NodeId>,
}

impl DirEnt {
    pub fn new(dev: DevId, blocks: u64, size: u64) -> DirEnt {
        DirEnt {
            dev,
            blocks,
            size,
            cum_blocks: 0,
            cum_size: 0,
            shared_blocks: 0,
            shared_size: 0,
            items: 0,
            err: false,
            suberr: false,
            sub: None,
        }
    }
}

/// A regular or non-regular file entry.
#[derive(Clone, Copy, Debug)]
pub struct FileEnt {
    pub blocks: u64,
    pub size: u64,
}

/// A hardlink entry: a regular file with `nlink > 1`.
#[derive(Clone, Copy, Debug)]
pub struct LinkEnt {
    pub blocks: u64,
    pub size: u64,
    /// Raw inode number, keyed together with the parent device.
    pub ino: u64,
    /// Link count as declared by stat; 0 when unknown (old imports).
    pub nlink: u32,
    /// Next member of the inode class ring; self when alone.
    pub next_link: NodeId,
}

/// One scanned entry.
#[derive(Clone, Debug)]
pub enum NodeKind {
    Dir(DirEnt),
    File(FileEnt),
    NonReg(FileEnt),
    Link(LinkEnt),
    Special(SpecialKind),
}

#[derive(Clone, Debug)]
pub struct Node {
    /// Opaque non-empty byte sequence, no `/`, no NUL.  Not
    /// necessarily UTF-8.
    pub name: Box<[u8]>,
    pub parent: Option<NodeId>,
    /// Next sibling in the parent's child list.
    pub next: Option<NodeId>,
    pub ext: Option<Ext>,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir(_))
    }

    pub fn dir(&self) -> Option<&DirEnt> {
        match &self.kind {
            NodeKind::Dir(d) => Some(d),
            _ => None,
        }
    }

    pub fn dir_mut(&mut self) -> Option<&mut DirEnt> {
        match &mut self.kind {
            NodeKind::Dir(d) => Some(d),
            _ => None,
        }
    }

    /// Blocks of the entry's own inode; specials have none.
    pub fn blocks(&self) -> u64 {
        match &self.kind {
            NodeKind::Dir(d) => d.blocks,
            NodeKind::File(f) | NodeKind::NonReg(f) => f.blocks,
            NodeKind::Link(l) => l.blocks,
            NodeKind::Special(_) => 0,
        }
    }

    /// Apparent size of the entry's own inode.
    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::Dir(d) => d.size,
            NodeKind::File(f) | NodeKind::NonReg(f) => f.size,
            NodeKind::Link(l) => l.size,
            NodeKind::Special(_) => 0,
        }
    }

}

/// Interns raw `st_dev` values into a dense 30-bit space.
///
/// Interned ids are scan-local; exports always map back to the raw
/// device number.
#[derive(Debug, Default)]
pub struct DevTable {
    ids: HashMap<u64, DevId>,
    devs: Vec<u64>,
}

impl DevTable {
    pub fn intern(&mut self, dev: u64) -> DevId {
        if let Some(&id) = self.ids.get(&dev) {
            return id;
        }
        let id = DevId(self.devs.len() as u32);
        assert!(id.0 < MAX_DEVICES, "device table overflow");
        self.devs.push(dev);
        self.ids.insert(dev, id);
        id
    }

    pub fn raw(&self, id: DevId) -> u64 {
        self.devs[id.0 as usize]
    }
}

/// The arena of entries, plus the device table.
///
/// Nodes are never returned to the allocator individually; removal
/// unlinks a subtree and lets its nodes become unreachable garbage,
/// which the workload tolerates.
#[derive(Debug, Default)]
pub struct Tree {
    nodes: Vec<Node>,
    pub root: Option<NodeId>,
    pub devices: DevTable,
}

impl Tree {
    pub fn new() -> Tree {
        Tree::default()
    }

    pub fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).expect("arena full"));
        self.nodes.push(node);
        id
    }

    /// Iterates the direct children of a directory.
    pub fn children(&self, dir: NodeId) -> Children<'_> {
        Children { tree: self, next: self[dir].dir().and_then(|d| d.sub) }
    }

    /// Reconstructs the `/`-joined path of an entry from its parent
    /// chain.  The root name is used verbatim.
    pub fn path_of(&self, id: NodeId) -> Vec<u8> {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            parts.push(&self[n].name);
            cur = self[n].parent;
        }
        let mut path = Vec::new();
        for (i, part) in parts.iter().rev().enumerate() {
            if i > 0 && path.last() != Some(&b'/') {
                path.push(b'/');
            }
            path.extend_from_slice(part);
        }
        path
    }

    /// Totals an entry contributes to its ancestors: blocks, bytes,
    /// and items (including the entry itself).
    pub fn subtree_totals(&self, id: NodeId) -> (u64, u64, u32) {
        match &self[id].kind {
            NodeKind::Dir(d) => {
                (d.cum_blocks, d.cum_size, d.items.saturating_add(1))
            }
            NodeKind::Special(_) => (0, 0, 1),
            _ => (self[id].blocks(), self[id].size(), 1),
        }
    }

    /// Recursively zeroes the aggregated counts of a subtree and
    /// subtracts the subtree's totals from every ancestor, saturating
    /// at zero.  `suberr` is not recomputed; the caller must.
    ///
    /// Hardlink classes with members below `id` must be uncounted
    /// first, or their contribution is subtracted twice.
    pub fn zero_stats(&mut self, id: NodeId) {
        let (blocks, size, items) = self.subtree_totals(id);
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            let kids: Vec<NodeId> = self.children(n).collect();
            if let Some(d) = self[n].dir_mut() {
                d.cum_blocks = 0;
                d.cum_size = 0;
                d.shared_blocks = 0;
                d.shared_size = 0;
                d.items = 0;
                stack.extend(kids);
            }
        }
        let mut anc = self[id].parent;
        while let Some(a) = anc {
            anc = self[a].parent;
            if let Some(d) = self[a].dir_mut() {
                d.cum_blocks = d.cum_blocks.saturating_sub(blocks);
                d.cum_size = d.cum_size.saturating_sub(size);
                d.items = d.items.saturating_sub(items);
            }
        }
    }

    /// Recomputes `suberr` of a directory from its immediate
    /// children (non-transitive).
    pub fn update_suberr(&mut self, dir: NodeId) {
        let mut suberr = false;
        let mut next = self[dir].dir().and_then(|d| d.sub);
        while let Some(c) = next {
            next = self[c].next;
            suberr |= match &self[c].kind {
                NodeKind::Dir(d) => d.err || d.suberr,
                NodeKind::Special(SpecialKind::Err) => true,
                _ => false,
            };
            if suberr {
                break;
            }
        }
        if let Some(d) = self[dir].dir_mut() {
            d.suberr = suberr;
        }
    }

    /// Unlinks `id` from its parent's child list.  Stats are not
    /// adjusted; pair with [`Tree::zero_stats`].
    pub fn unlink(&mut self, id: NodeId) {
        let Some(parent) = self[id].parent else { return };
        let first = self[parent].dir().and_then(|d| d.sub);
        if first == Some(id) {
            let next = self[id].next;
            if let Some(d) = self[parent].dir_mut() {
                d.sub = next;
            }
            return;
        }
        let mut cur = first;
        while let Some(c) = cur {
            if self[c].next == Some(id) {
                self[c].next = self[id].next;
                return;
            }
            cur = self[c].next;
        }
    }
}

impl std::ops::Index<NodeId> for Tree {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }
}

impl std::ops::IndexMut<NodeId> for Tree {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }
}

pub struct Children<'a> {
    tree: &'a Tree,
    next: Option<NodeId>,
}

impl Iterator for Children<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.next?;
        self.next = self.tree[id].next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &[u8], kind: NodeKind) -> Node {
        Node {
            name: name.into(),
            parent: None,
            next: None,
            ext: None,
            kind,
        }
    }

    /// Builds `/r/{sub/{a}, b}` with hand-filled aggregates.
    fn sample() -> (Tree, NodeId, NodeId, NodeId, NodeId) {
        let mut t = Tree::new();
        let dev = t.devices.intern(1);
        let mut rootent = DirEnt::new(dev, 8, 100);
        rootent.cum_blocks = 40;
        rootent.cum_size = 1000;
        rootent.items = 3;
        let root = t.push(node(b"r", NodeKind::Dir(rootent)));
        t.root = Some(root);
        let mut subent = DirEnt::new(dev, 8, 100);
        subent.cum_blocks = 24;
        subent.cum_size = 500;
        subent.items = 1;
        let sub = t.push(node(b"sub", NodeKind::Dir(subent)));
        let a = t.push(node(
            b"a",
            NodeKind::File(FileEnt { blocks: 16, size: 400 }),
        ));
        let b = t.push(node(
            b"b",
            NodeKind::File(FileEnt { blocks: 8, size: 400 }),
        ));
        t[sub].parent = Some(root);
        t[b].parent = Some(root);
        t[a].parent = Some(sub);
        t[root].dir_mut().unwrap().sub = Some(sub);
        t[sub].next = Some(b);
        t[sub].dir_mut().unwrap().sub = Some(a);
        (t, root, sub, a, b)
    }

    #[test]
    fn saturating_blocks() {
        assert_eq!(add_blocks(MAX_BLOCKS - 1, 5), MAX_BLOCKS);
        assert_eq!(add_blocks(u64::MAX, 1), MAX_BLOCKS);
        assert_eq!(add_blocks(1, 2), 3);
    }

    #[test]
    fn zero_stats_subtracts_from_ancestors() {
        let (mut t, root, sub, ..) = sample();
        let (blocks, size, items) = t.subtree_totals(sub);
        assert_eq!((blocks, size, items), (24, 500, 2));
        t.zero_stats(sub);
        let s = t[sub].dir().unwrap();
        assert_eq!((s.cum_blocks, s.cum_size, s.items), (0, 0, 0));
        let r = t[root].dir().unwrap();
        assert_eq!(r.cum_blocks, 16);
        assert_eq!(r.cum_size, 500);
        assert_eq!(r.items, 1);
    }

    #[test]
    fn unlink_middle_and_head() {
        let (mut t, root, sub, _a, b) = sample();
        t.unlink(b);
        assert_eq!(t.children(root).collect::<Vec<_>>(), vec![sub]);
        t.unlink(sub);
        assert!(t.children(root).next().is_none());
    }

    #[test]
    fn suberr_from_children() {
        let (mut t, root, sub, ..) = sample();
        t.update_suberr(root);
        assert!(!t[root].dir().unwrap().suberr);
        t[sub].dir_mut().unwrap().err = true;
        t.update_suberr(root);
        assert!(t[root].dir().unwrap().suberr);
    }

    #[test]
    fn path_reconstruction() {
        let (t, _, _, a, _) = sample();
        assert_eq!(t.path_of(a), b"r/sub/a".to_vec());
    }

    #[test]
    fn device_interning() {
        let mut dt = DevTable::default();
        let a = dt.intern(0xdead);
        let b = dt.intern(0xbeef);
        assert_ne!(a, b);
        assert_eq!(dt.intern(0xdead), a);
        assert_eq!(dt.raw(b), 0xbeef);
    }
}
