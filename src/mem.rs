// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The memory sink: builds the in-memory entry tree.
//!
//! Each in-progress directory handle keeps the set of children left
//! over from a previous scan of the same directory, keyed by a 64-bit
//! hash of the name, so a refresh can reclaim matching entries in
//! O(1) average per name.  Children contribute deltas (blocks, size,
//! items, mtime, suberr) to their directory's handle as they arrive;
//! the deltas are applied to the tree when the directory finalizes,
//! and the finished directory then publishes its own contribution to
//! its parent's handle.  Hardlinks are registered with the inode map
//! as they are seen and committed once, from a quiescent state, when
//! the whole scan is done.
//!
//! Lock order: directory state, then link map, then tree.  The tree
//! lock is never held across I/O.

use crate::entry::{
    DirEnt, Ext, FileEnt, LinkEnt, Node, NodeId, NodeKind, SpecialKind, Tree,
    add_blocks,
};
use crate::exclude::Patterns;
use crate::links::LinkMap;
use crate::result::Result;
use crate::scan::{self, ScanFlags};
use crate::sink::{Sink, SinkDir, SinkThread, Stat};
use hashbrown::HashTable;
use hashbrown::hash_map::DefaultHashBuilder;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU32, Ordering, fence};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct DirState {
    /// Children surviving from a previous pass, by name hash.
    old: HashTable<NodeId>,
    /// Child list built by this pass, in arrival order.
    first: Option<NodeId>,
    last: Option<NodeId>,
    /// Accumulated child deltas, applied at finalization.
    blocks: u64,
    size: u64,
    items: u32,
    mtime: u64,
    err: bool,
    suberr: bool,
}

struct DirInner {
    node: NodeId,
    parent: Option<MemDir>,
    refs: AtomicU32,
    /// Refresh root: publish totals to tree ancestors on finalize.
    publish_up: bool,
    st: Mutex<DirState>,
}

/// A refcounted handle on an in-progress directory.
#[derive(Clone)]
pub struct MemDir(Arc<DirInner>);

impl MemDir {
    fn new(
        node: NodeId,
        parent: Option<MemDir>,
        old: HashTable<NodeId>,
        publish_up: bool,
    ) -> MemDir {
        MemDir(Arc::new(DirInner {
            node,
            parent,
            refs: AtomicU32::new(1),
            publish_up,
            st: Mutex::new(DirState { old, ..DirState::default() }),
        }))
    }

    pub fn node(&self) -> NodeId {
        self.0.node
    }

    fn state(&self) -> MutexGuard<'_, DirState> {
        self.0.st.lock().expect("dir state lock")
    }
}

pub struct MemSink {
    pub tree: Mutex<Tree>,
    pub links: Mutex<LinkMap>,
    hasher: DefaultHashBuilder,
    extended: bool,
}

impl MemSink {
    pub fn new(extended: bool) -> MemSink {
        MemSink {
            tree: Mutex::new(Tree::new()),
            links: Mutex::new(LinkMap::new()),
            hasher: DefaultHashBuilder::default(),
            extended,
        }
    }

    fn lock_tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().expect("tree lock")
    }

    fn lock_links(&self) -> MutexGuard<'_, LinkMap> {
        self.links.lock().expect("link map lock")
    }

    fn ext_of(&self, st: &Stat) -> Option<Ext> {
        if self.extended && !st.ext.is_empty() { Some(st.ext) } else { None }
    }

    /// Indexes the current children of `dir` by name hash, for reuse
    /// during a refresh.
    fn index_children(&self, tree: &Tree, dir: NodeId) -> HashTable<NodeId> {
        let mut table = HashTable::new();
        for c in tree.children(dir) {
            let h = self.hasher.hash_one(&tree[c].name);
            table.insert_unique(h, c, |&id| {
                self.hasher.hash_one(&tree[id].name)
            });
        }
        table
    }

    pub fn create_root(&self, name: &[u8], st: &Stat) -> MemDir {
        let mut tree = self.lock_tree();
        let dev = tree.devices.intern(st.dev);
        let id = tree.push(Node {
            name: name.into(),
            parent: None,
            next: None,
            ext: self.ext_of(st),
            kind: NodeKind::Dir(DirEnt::new(dev, st.blocks, st.size)),
        });
        tree.root = Some(id);
        MemDir::new(id, None, HashTable::new(), false)
    }

    /// Rebinds an existing directory node as the root of a refresh
    /// pass.  Its current children become candidates for reuse.
    pub fn root_existing(&self, node: NodeId, st: &Stat) -> MemDir {
        let mut tree = self.lock_tree();
        let dev = tree.devices.intern(st.dev);
        let old = self.index_children(&tree, node);
        let ext = self.ext_of(st);
        let n = &mut tree[node];
        n.ext = ext;
        if let NodeKind::Dir(ent) = &mut n.kind {
            ent.dev = dev;
            ent.blocks = st.blocks;
            ent.size = st.size;
            ent.err = false;
        }
        MemDir::new(node, None, old, true)
    }

    /// Reclaims `name` from the previous pass when its kind (and,
    /// for hardlinks, inode) still matches.
    fn reclaim(
        &self,
        ds: &mut DirState,
        tree: &Tree,
        name: &[u8],
        want: impl Fn(&NodeKind) -> bool,
    ) -> Option<NodeId> {
        let h = self.hasher.hash_one(name);
        match ds.old.find_entry(h, |&id| &*tree[id].name == name) {
            Ok(entry) if want(&tree[*entry.get()].kind) => {
                Some(entry.remove().0)
            }
            _ => None,
        }
    }

    fn append(ds: &mut DirState, tree: &mut Tree, id: NodeId) {
        tree[id].next = None;
        match ds.last {
            Some(prev) => tree[prev].next = Some(id),
            None => ds.first = Some(id),
        }
        ds.last = Some(id);
    }

    pub fn add_stat(&self, d: &MemDir, name: &[u8], st: &Stat) {
        let mut ds = d.state();
        let mut links =
            if st.is_link() { Some(self.lock_links()) } else { None };
        let mut tree = self.lock_tree();
        let reused = self.reclaim(&mut ds, &tree, name, |kind| match kind {
            NodeKind::Link(l) => st.is_link() && l.ino == st.ino,
            NodeKind::File(_) => !st.dir && st.regular && !st.is_link(),
            NodeKind::NonReg(_) => !st.dir && !st.regular && !st.is_link(),
            _ => false,
        });
        let id = match reused {
            Some(id) => {
                tree[id].ext = self.ext_of(st);
                match &mut tree[id].kind {
                    NodeKind::Link(l) => {
                        l.blocks = st.blocks;
                        l.size = st.size;
                        l.nlink = st.nlink;
                    }
                    NodeKind::File(f) | NodeKind::NonReg(f) => {
                        f.blocks = st.blocks;
                        f.size = st.size;
                    }
                    _ => {}
                }
                if let Some(links) = links.as_mut() {
                    let key = LinkMap::key(&tree, id);
                    links.uncount(&mut tree, key);
                }
                id
            }
            None => {
                let kind = if st.is_link() {
                    NodeKind::Link(LinkEnt {
                        blocks: st.blocks,
                        size: st.size,
                        ino: st.ino,
                        nlink: st.nlink,
                        next_link: NodeId::default(),
                    })
                } else if st.regular {
                    NodeKind::File(FileEnt { blocks: st.blocks, size: st.size })
                } else {
                    NodeKind::NonReg(FileEnt {
                        blocks: st.blocks,
                        size: st.size,
                    })
                };
                let id = tree.push(Node {
                    name: name.into(),
                    parent: Some(d.node()),
                    next: None,
                    ext: self.ext_of(st),
                    kind,
                });
                if let Some(links) = links.as_mut() {
                    links.add_link(&mut tree, id);
                }
                id
            }
        };
        Self::append(&mut ds, &mut tree, id);
        ds.items = ds.items.saturating_add(1);
        if !st.is_link() {
            ds.blocks = add_blocks(ds.blocks, st.blocks);
            ds.size = ds.size.saturating_add(st.size);
        }
        if self.extended
            && let Some(m) = st.ext.mtime
        {
            ds.mtime = ds.mtime.max(m);
        }
    }

    pub fn add_dir(&self, d: &MemDir, name: &[u8], st: &Stat) -> MemDir {
        let mut ds = d.state();
        let mut tree = self.lock_tree();
        let dev = tree.devices.intern(st.dev);
        let reused =
            self.reclaim(&mut ds, &tree, name, |k| matches!(k, NodeKind::Dir(_)));
        let (id, old) = match reused {
            Some(id) => {
                let old = self.index_children(&tree, id);
                tree[id].ext = self.ext_of(st);
                if let NodeKind::Dir(ent) = &mut tree[id].kind {
                    ent.dev = dev;
                    ent.blocks = st.blocks;
                    ent.size = st.size;
                    ent.err = false;
                }
                (id, old)
            }
            None => {
                let id = tree.push(Node {
                    name: name.into(),
                    parent: Some(d.node()),
                    next: None,
                    ext: self.ext_of(st),
                    kind: NodeKind::Dir(DirEnt::new(dev, st.blocks, st.size)),
                });
                (id, HashTable::new())
            }
        };
        Self::append(&mut ds, &mut tree, id);
        drop(tree);
        drop(ds);
        d.0.refs.fetch_add(1, Ordering::Relaxed);
        MemDir::new(id, Some(d.clone()), old, false)
    }

    pub fn add_special(&self, d: &MemDir, name: &[u8], kind: SpecialKind) {
        let mut ds = d.state();
        let mut tree = self.lock_tree();
        let reused = self.reclaim(&mut ds, &tree, name, |k| {
            matches!(k, NodeKind::Special(_))
        });
        let id = match reused {
            Some(id) => {
                tree[id].kind = NodeKind::Special(kind);
                tree[id].ext = None;
                id
            }
            None => tree.push(Node {
                name: name.into(),
                parent: Some(d.node()),
                next: None,
                ext: None,
                kind: NodeKind::Special(kind),
            }),
        };
        Self::append(&mut ds, &mut tree, id);
        ds.items = ds.items.saturating_add(1);
        if kind == SpecialKind::Err {
            ds.suberr = true;
        }
    }

    pub fn set_read_error(&self, d: &MemDir) {
        d.state().err = true;
    }

    /// Releases one reference; on the last one the directory is
    /// finalized and the parent handle is returned so the caller can
    /// release the child's reference on it.
    pub fn unref(&self, d: MemDir) -> Option<MemDir> {
        if d.0.refs.fetch_sub(1, Ordering::Release) != 1 {
            return None;
        }
        fence(Ordering::Acquire);
        self.finalize_dir(&d)
    }

    fn finalize_dir(&self, d: &MemDir) -> Option<MemDir> {
        let mut ds = d.state();
        let mut links = self.lock_links();
        let mut tree = self.lock_tree();
        // Children not seen by this pass are dropped; their links
        // leave the inode map, their nodes become garbage.
        for id in ds.old.drain().collect::<Vec<_>>() {
            deregister_links(&mut tree, &mut links, id);
        }
        let mtime = ds.mtime;
        let node = &mut tree[d.0.node];
        if let NodeKind::Dir(ent) = &mut node.kind {
            ent.sub = ds.first;
            ent.err |= ds.err;
            ent.suberr = ds.suberr;
            ent.cum_blocks = add_blocks(ent.blocks, ds.blocks);
            ent.cum_size = ent.size.saturating_add(ds.size);
            ent.shared_blocks = 0;
            ent.shared_size = 0;
            ent.items = ds.items;
        }
        if self.extended && mtime > 0 {
            let e = node.ext.get_or_insert_with(Ext::default);
            e.mtime = Some(e.mtime.unwrap_or(0).max(mtime));
        }
        let (cum_blocks, cum_size, items, err, suberr) = {
            let ent = node.dir().expect("finalized node is a dir");
            (ent.cum_blocks, ent.cum_size, ent.items, ent.err, ent.suberr)
        };
        let dir_mtime =
            node.ext.as_ref().and_then(|e| e.mtime).unwrap_or(0);
        drop(tree);
        drop(links);
        drop(ds);
        if let Some(p) = d.0.parent.clone() {
            let mut ps = p.state();
            ps.blocks = add_blocks(ps.blocks, cum_blocks);
            ps.size = ps.size.saturating_add(cum_size);
            ps.items = ps.items.saturating_add(items).saturating_add(1);
            if self.extended {
                ps.mtime = ps.mtime.max(dir_mtime);
            }
            ps.suberr |= err || suberr;
            drop(ps);
            return Some(p);
        }
        if d.0.publish_up {
            let mut tree = self.lock_tree();
            let add_items = items.saturating_add(1);
            let mut anc = tree[d.0.node].parent;
            while let Some(a) = anc {
                if let Some(ent) = tree[a].dir_mut() {
                    ent.cum_blocks = add_blocks(ent.cum_blocks, cum_blocks);
                    ent.cum_size = ent.cum_size.saturating_add(cum_size);
                    ent.items = ent.items.saturating_add(add_items);
                }
                anc = tree[a].parent;
            }
            let mut anc = tree[d.0.node].parent;
            while let Some(a) = anc {
                tree.update_suberr(a);
                anc = tree[a].parent;
            }
        }
        None
    }

    /// Commits pending hardlink aggregates.  Must run from a
    /// quiescent state.
    pub fn commit_links(&self) {
        let mut links = self.lock_links();
        let mut tree = self.lock_tree();
        links.add_all_stats(&mut tree);
    }

    /// Unlinks a scanned subtree and restores all ancestor
    /// aggregates.  The engine half of a delete.
    #[allow(dead_code)]
    pub fn remove(&self, id: NodeId) {
        let mut links = self.lock_links();
        let mut tree = self.lock_tree();
        deregister_links(&mut tree, &mut links, id);
        tree.zero_stats(id);
        tree.unlink(id);
        let mut anc = tree[id].parent;
        while let Some(a) = anc {
            tree.update_suberr(a);
            anc = tree[a].parent;
        }
        links.add_all_stats(&mut tree);
    }
}

/// Uncounts and deregisters every hardlink at or below `id`.
fn deregister_links(tree: &mut Tree, links: &mut LinkMap, id: NodeId) {
    let mut stack = vec![id];
    while let Some(n) = stack.pop() {
        match &tree[n].kind {
            NodeKind::Dir(_) => {
                let kids: Vec<NodeId> = tree.children(n).collect();
                stack.extend(kids);
            }
            NodeKind::Link(_) => {
                let key = LinkMap::key(tree, n);
                links.uncount(tree, key);
                links.remove_link(tree, n);
            }
            _ => {}
        }
    }
}

/// Rescans a subtree of an existing in-memory tree, merging in
/// place.  Requires the memory backend.
#[allow(dead_code)]
pub fn refresh(
    sink: &Sink,
    threads: &[SinkThread],
    node: NodeId,
    patterns: Patterns,
    flags: ScanFlags,
) -> Result<()> {
    let m = sink.mem().expect("refresh needs a memory sink");
    let path = {
        let mut links = m.lock_links();
        let mut tree = m.lock_tree();
        uncount_below(&mut tree, &mut links, node);
        tree.zero_stats(node);
        tree.path_of(node)
    };
    scan::scan_tree(&path, sink, threads, patterns, flags, Some(node))?;
    sink.finalize(threads)
}

/// Uncounts every hardlink class with a member at or below `id`,
/// leaving membership intact for the rescan to reclaim.
fn uncount_below(tree: &mut Tree, links: &mut LinkMap, id: NodeId) {
    let mut stack = vec![id];
    while let Some(n) = stack.pop() {
        match &tree[n].kind {
            NodeKind::Dir(_) => {
                let kids: Vec<NodeId> = tree.children(n).collect();
                stack.extend(kids);
            }
            NodeKind::Link(_) => {
                let key = LinkMap::key(tree, n);
                links.uncount(tree, key);
            }
            _ => {}
        }
    }
}

/// Feeds a finished memory tree back through the sink API, exactly
/// as if it were being scanned.  Used to convert between formats.
pub fn replay(tree: &Tree, sink: &Sink, th: &SinkThread) -> Result<()> {
    struct Frame {
        dir: SinkDir,
        kids: Vec<NodeId>,
        at: usize,
    }
    let Some(root) = tree.root else { return Ok(()) };
    let handle = sink.create_root(&tree[root].name, &stat_of(tree, root));
    let mut stack = vec![Frame {
        dir: handle,
        kids: tree.children(root).collect(),
        at: 0,
    }];
    while let Some(frame) = stack.last_mut() {
        if frame.at >= frame.kids.len() {
            let frame = stack.pop().expect("replay stack");
            sink.unref(frame.dir, th)?;
            continue;
        }
        let id = frame.kids[frame.at];
        frame.at += 1;
        let dir = frame.dir.clone();
        let name = &tree[id].name;
        match &tree[id].kind {
            NodeKind::Dir(ent) => {
                let child = sink.add_dir(&dir, th, name, &stat_of(tree, id))?;
                if ent.err {
                    sink.set_read_error(&child);
                }
                stack.push(Frame {
                    dir: child,
                    kids: tree.children(id).collect(),
                    at: 0,
                });
            }
            NodeKind::Special(kind) => {
                sink.add_special(&dir, th, name, *kind)?;
            }
            _ => {
                sink.add_stat(&dir, th, name, &stat_of(tree, id))?;
            }
        }
    }
    Ok(())
}

/// Reconstructs a [`Stat`] from a stored node.
pub fn stat_of(tree: &Tree, id: NodeId) -> Stat {
    let node = &tree[id];
    let ext = node.ext.unwrap_or_default();
    match &node.kind {
        NodeKind::Dir(d) => Stat {
            dir: true,
            regular: false,
            symlink: false,
            blocks: d.blocks,
            size: d.size,
            dev: tree.devices.raw(d.dev),
            ino: 0,
            nlink: 1,
            hardlink: false,
            ext,
        },
        NodeKind::File(f) => Stat {
            dir: false,
            regular: true,
            symlink: false,
            blocks: f.blocks,
            size: f.size,
            dev: parent_dev(tree, id),
            ino: 0,
            nlink: 1,
            hardlink: false,
            ext,
        },
        NodeKind::NonReg(f) => Stat {
            dir: false,
            regular: false,
            symlink: false,
            blocks: f.blocks,
            size: f.size,
            dev: parent_dev(tree, id),
            ino: 0,
            nlink: 1,
            hardlink: false,
            ext,
        },
        NodeKind::Link(l) => Stat {
            dir: false,
            regular: true,
            symlink: false,
            blocks: l.blocks,
            size: l.size,
            dev: parent_dev(tree, id),
            ino: l.ino,
            nlink: l.nlink,
            hardlink: true,
            ext,
        },
        NodeKind::Special(_) => Stat::default(),
    }
}

fn parent_dev(tree: &Tree, id: NodeId) -> u64 {
    tree[id]
        .parent
        .and_then(|p| tree[p].dir().map(|d| tree.devices.raw(d.dev)))
        .unwrap_or(0)
}

/// Asserts the cumulative-additivity invariant over a whole tree.
/// Directories with a hardlink anywhere beneath them are checked for
/// item counts only; their byte totals carry the class adjustments
/// of the inode map, which have their own tests.
#[cfg(test)]
pub(crate) fn assert_additive(tree: &Tree) {
    use hashbrown::HashSet;
    let Some(root) = tree.root else { return };
    let mut linked: HashSet<NodeId> = HashSet::new();
    let mut stack = vec![root];
    let mut all = Vec::new();
    while let Some(n) = stack.pop() {
        all.push(n);
        if matches!(tree[n].kind, NodeKind::Link(_)) {
            let mut anc = tree[n].parent;
            while let Some(a) = anc {
                linked.insert(a);
                anc = tree[a].parent;
            }
        }
        stack.extend(tree.children(n));
    }
    for &n in &all {
        let Some(ent) = tree[n].dir() else { continue };
        let mut blocks = ent.blocks;
        let mut size = ent.size;
        let mut items = 0u32;
        for c in tree.children(n) {
            let (b, s, i) = tree.subtree_totals(c);
            blocks = add_blocks(blocks, b);
            size = size.saturating_add(s);
            items = items.saturating_add(i);
        }
        assert_eq!(ent.items, items, "items of {:?}", tree.path_of(n));
        if !linked.contains(&n) {
            assert_eq!(
                (ent.cum_blocks, ent.cum_size),
                (blocks, size),
                "totals of {:?}",
                tree.path_of(n)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filestat(size: u64, blocks: u64) -> Stat {
        Stat {
            regular: true,
            blocks,
            size,
            dev: 1,
            ino: 0,
            nlink: 1,
            ..Stat::default()
        }
    }

    fn dirstat() -> Stat {
        Stat { dir: true, blocks: 8, size: 4096, dev: 1, ..Stat::default() }
    }

    fn linkstat(ino: u64, nlink: u32, size: u64, blocks: u64) -> Stat {
        Stat {
            regular: true,
            blocks,
            size,
            dev: 1,
            ino,
            nlink,
            ..Stat::default()
        }
    }

    /// Builds `/r/{a, b, sub/{c}}` through the sink API.
    fn build() -> Sink {
        let sink = Sink::memory(false);
        let th = &sink.create_threads(1)[0];
        let root = sink.create_root(b"r", &dirstat());
        sink.add_stat(&root, th, b"a", &filestat(100, 8)).unwrap();
        sink.add_stat(&root, th, b"b", &filestat(200, 8)).unwrap();
        let sub = sink.add_dir(&root, th, b"sub", &dirstat()).unwrap();
        sink.add_stat(&sub, th, b"c", &filestat(300, 16)).unwrap();
        sink.unref(sub, th).unwrap();
        sink.unref(root, th).unwrap();
        sink.finalize(&[]).unwrap();
        sink
    }

    #[test]
    fn aggregates_add_up() {
        let sink = build();
        let m = sink.mem().unwrap();
        let tree = m.tree.lock().unwrap();
        let root = tree.root.unwrap();
        let ent = tree[root].dir().unwrap();
        assert_eq!(ent.cum_size, 4096 + 100 + 200 + 4096 + 300);
        assert_eq!(ent.cum_blocks, 8 + 8 + 8 + 8 + 16);
        assert_eq!(ent.items, 4);
        assert_eq!(ent.shared_size, 0);
        assert_additive(&tree);
    }

    #[test]
    fn hardlink_counted_once() {
        let sink = Sink::memory(false);
        let th = &sink.create_threads(1)[0];
        let root = sink.create_root(b"r", &dirstat());
        sink.add_stat(&root, th, b"x", &linkstat(7, 2, 1000, 16)).unwrap();
        sink.add_stat(&root, th, b"y", &linkstat(7, 2, 1000, 16)).unwrap();
        sink.unref(root, th).unwrap();
        sink.finalize(&[]).unwrap();
        let m = sink.mem().unwrap();
        let tree = m.tree.lock().unwrap();
        let ent = tree[tree.root.unwrap()].dir().unwrap();
        assert_eq!(ent.cum_size, 4096 + 1000);
        assert_eq!(ent.cum_blocks, 8 + 16);
        assert_eq!(ent.shared_size, 0);
        assert_eq!(ent.items, 2);
    }

    #[test]
    fn err_special_sets_suberr() {
        let sink = Sink::memory(false);
        let th = &sink.create_threads(1)[0];
        let root = sink.create_root(b"r", &dirstat());
        let sub = sink.add_dir(&root, th, b"sub", &dirstat()).unwrap();
        sink.add_special(&sub, th, b"gone", SpecialKind::Err).unwrap();
        sink.unref(sub, th).unwrap();
        sink.unref(root, th).unwrap();
        let m = sink.mem().unwrap();
        let tree = m.tree.lock().unwrap();
        let root = tree.root.unwrap();
        assert!(tree[root].dir().unwrap().suberr);
        let sub = tree.children(root).next().unwrap();
        assert!(tree[sub].dir().unwrap().suberr);
        assert!(!tree[sub].dir().unwrap().err);
    }

    #[test]
    fn read_error_marks_dir_and_ancestors() {
        let sink = Sink::memory(false);
        let th = &sink.create_threads(1)[0];
        let root = sink.create_root(b"r", &dirstat());
        let sub = sink.add_dir(&root, th, b"sub", &dirstat()).unwrap();
        sink.set_read_error(&sub);
        sink.unref(sub, th).unwrap();
        sink.unref(root, th).unwrap();
        let m = sink.mem().unwrap();
        let tree = m.tree.lock().unwrap();
        let root = tree.root.unwrap();
        let sub = tree.children(root).next().unwrap();
        assert!(tree[sub].dir().unwrap().err);
        assert!(tree[root].dir().unwrap().suberr);
    }

    #[test]
    fn remove_restores_ancestors() {
        let sink = build();
        let m = sink.mem().unwrap();
        let sub = {
            let tree = m.tree.lock().unwrap();
            let root = tree.root.unwrap();
            tree.children(root).find(|&c| tree[c].is_dir()).unwrap()
        };
        m.remove(sub);
        let tree = m.tree.lock().unwrap();
        let ent = tree[tree.root.unwrap()].dir().unwrap();
        assert_eq!(ent.cum_size, 4096 + 100 + 200);
        assert_eq!(ent.items, 2);
        assert_additive(&tree);
    }

    #[test]
    fn replay_reproduces_tree() {
        let sink = build();
        let m = sink.mem().unwrap();
        let copy = Sink::memory(false);
        let th = &copy.create_threads(1)[0];
        {
            let tree = m.tree.lock().unwrap();
            replay(&tree, &copy, th).unwrap();
        }
        copy.finalize(&[]).unwrap();
        let src = m.tree.lock().unwrap();
        let dst = copy.mem().unwrap().tree.lock().unwrap();
        let a = src[src.root.unwrap()].dir().unwrap();
        let b = dst[dst.root.unwrap()].dir().unwrap();
        assert_eq!(a.cum_size, b.cum_size);
        assert_eq!(a.cum_blocks, b.cum_blocks);
        assert_eq!(a.items, b.items);
        assert_additive(&dst);
    }
}
