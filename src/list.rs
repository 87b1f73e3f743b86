// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A non-interactive listing of a scanned tree, in the manner of
//! `ls -l`: one line per entry of the root directory, largest disk
//! usage first.

use crate::entry::{NodeId, NodeKind, SpecialKind, Tree};
use humansize::{BINARY, format_size};
use std::io::{self, Write};

/// Disk usage of an entry's subtree, in bytes.
fn du_bytes(tree: &Tree, id: NodeId) -> u64 {
    let (blocks, ..) = tree.subtree_totals(id);
    blocks.saturating_mul(512)
}

fn flags(tree: &Tree, id: NodeId) -> &'static str {
    match &tree[id].kind {
        NodeKind::Dir(d) if d.err => "/ [read error]",
        NodeKind::Dir(d) if d.suberr => "/ [errors below]",
        NodeKind::Dir(_) => "/",
        NodeKind::Link(_) => " [hardlink]",
        NodeKind::NonReg(_) => " [not a regular file]",
        NodeKind::Special(SpecialKind::Err) => " [read error]",
        NodeKind::Special(SpecialKind::Pattern) => " [excluded]",
        NodeKind::Special(SpecialKind::OtherFs) => " [other filesystem]",
        NodeKind::Special(SpecialKind::Kernfs) => " [kernel filesystem]",
        NodeKind::File(_) => "",
    }
}

/// Prints the root summary and its children, sorted by disk usage.
pub fn report(tree: &Tree, out: &mut dyn Write) -> io::Result<()> {
    let Some(root) = tree.root else {
        return writeln!(out, "nothing scanned");
    };
    let ent = match tree[root].dir() {
        Some(ent) => ent,
        None => return writeln!(out, "nothing scanned"),
    };
    writeln!(out, "--- {} ---", String::from_utf8_lossy(&tree.path_of(root)))?;
    write!(
        out,
        "{} used, {} apparent, {} items",
        format_size(ent.cum_blocks.saturating_mul(512), BINARY),
        format_size(ent.cum_size, BINARY),
        ent.items,
    )?;
    if ent.shared_size > 0 {
        write!(
            out,
            ", {} shared with hardlinks elsewhere",
            format_size(ent.shared_size, BINARY)
        )?;
    }
    writeln!(out)?;
    let mut kids: Vec<NodeId> = tree.children(root).collect();
    kids.sort_by_key(|&c| std::cmp::Reverse(du_bytes(tree, c)));
    for c in kids {
        writeln!(
            out,
            "{:>12} {:>12}  {}{}",
            format_size(du_bytes(tree, c), BINARY),
            format_size(tree.subtree_totals(c).1, BINARY),
            String::from_utf8_lossy(&tree[c].name),
            flags(tree, c),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{DirEnt, FileEnt, Node};

    #[test]
    fn report_sorts_by_usage() {
        let mut tree = Tree::new();
        let dev = tree.devices.intern(1);
        let mut ent = DirEnt::new(dev, 8, 100);
        ent.cum_blocks = 48;
        ent.cum_size = 700;
        ent.items = 2;
        let root = tree.push(Node {
            name: b"r".as_slice().into(),
            parent: None,
            next: None,
            ext: None,
            kind: NodeKind::Dir(ent),
        });
        tree.root = Some(root);
        let small = tree.push(Node {
            name: b"small".as_slice().into(),
            parent: Some(root),
            next: None,
            ext: None,
            kind: NodeKind::File(FileEnt { blocks: 8, size: 100 }),
        });
        let big = tree.push(Node {
            name: b"big".as_slice().into(),
            parent: Some(root),
            next: Some(small),
            ext: None,
            kind: NodeKind::File(FileEnt { blocks: 32, size: 600 }),
        });
        tree[root].dir_mut().unwrap().sub = Some(big);
        let mut out = Vec::new();
        report(&tree, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let big_at = text.find("big").unwrap();
        let small_at = text.find("small").unwrap();
        assert!(big_at < small_at, "{text}");
        assert!(text.contains("2 items"), "{text}");
    }
}
