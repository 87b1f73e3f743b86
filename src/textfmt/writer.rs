// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming JSON export of a finished memory tree.

use super::write_json_string;
use crate::entry::{Children, NodeId, NodeKind, SpecialKind, Tree};
use crate::result::Result;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

/// Writes the whole tree as a textual export.
pub fn export(
    tree: &Tree,
    out: &mut dyn Write,
    extended: bool,
) -> Result<()> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    write!(
        out,
        "[1,2,{{\"progname\":\"duv\",\"progver\":\"{}\",\"timestamp\":{}}}",
        env!("CARGO_PKG_VERSION"),
        timestamp
    )?;
    struct Frame<'a> {
        kids: Children<'a>,
        dev: u64,
    }
    if let Some(root) = tree.root {
        let dev = dir_dev(tree, root);
        out.write_all(b",\n[")?;
        write_attrs(tree, out, root, None, extended)?;
        let mut stack = vec![Frame { kids: tree.children(root), dev }];
        while let Some(frame) = stack.last_mut() {
            let dev = frame.dev;
            match frame.kids.next() {
                None => {
                    stack.pop();
                    out.write_all(b"]")?;
                }
                Some(c) if tree[c].is_dir() => {
                    out.write_all(b",\n[")?;
                    write_attrs(tree, out, c, Some(dev), extended)?;
                    stack.push(Frame {
                        kids: tree.children(c),
                        dev: dir_dev(tree, c),
                    });
                }
                Some(c) => {
                    out.write_all(b",\n")?;
                    write_attrs(tree, out, c, Some(dev), extended)?;
                }
            }
        }
    }
    out.write_all(b"]\n")?;
    out.flush()?;
    Ok(())
}

fn dir_dev(tree: &Tree, id: NodeId) -> u64 {
    tree[id].dir().map_or(0, |d| tree.devices.raw(d.dev))
}

fn write_attrs(
    tree: &Tree,
    out: &mut dyn Write,
    id: NodeId,
    parent_dev: Option<u64>,
    extended: bool,
) -> Result<()> {
    let node = &tree[id];
    out.write_all(b"{\"name\":")?;
    write_json_string(out, &node.name)?;
    match &node.kind {
        NodeKind::Dir(d) => {
            write!(out, ",\"asize\":{},\"dsize\":{}", d.size, d.blocks.saturating_mul(512))?;
            let dev = tree.devices.raw(d.dev);
            if parent_dev != Some(dev) {
                write!(out, ",\"dev\":{dev}")?;
            }
            if d.err {
                out.write_all(b",\"read_error\":true")?;
            }
        }
        NodeKind::File(f) => {
            write!(out, ",\"asize\":{},\"dsize\":{}", f.size, f.blocks.saturating_mul(512))?;
        }
        NodeKind::NonReg(f) => {
            write!(
                out,
                ",\"asize\":{},\"dsize\":{},\"notreg\":true",
                f.size,
                f.blocks.saturating_mul(512)
            )?;
        }
        NodeKind::Link(l) => {
            write!(
                out,
                ",\"asize\":{},\"dsize\":{},\"ino\":{},\"hlnkc\":true",
                l.size,
                l.blocks.saturating_mul(512),
                l.ino
            )?;
            if l.nlink > 0 {
                write!(out, ",\"nlink\":{}", l.nlink)?;
            }
        }
        NodeKind::Special(kind) => match kind {
            SpecialKind::Err => out.write_all(b",\"read_error\":true")?,
            SpecialKind::Pattern => {
                out.write_all(b",\"excluded\":\"pattern\"")?
            }
            SpecialKind::OtherFs => {
                out.write_all(b",\"excluded\":\"otherfs\"")?
            }
            SpecialKind::Kernfs => {
                out.write_all(b",\"excluded\":\"kernfs\"")?
            }
        },
    }
    if extended
        && !matches!(node.kind, NodeKind::Special(_))
        && let Some(ext) = &node.ext
    {
        if let Some(uid) = ext.uid {
            write!(out, ",\"uid\":{uid}")?;
        }
        if let Some(gid) = ext.gid {
            write!(out, ",\"gid\":{gid}")?;
        }
        if let Some(mode) = ext.mode {
            write!(out, ",\"mode\":{mode}")?;
        }
        if let Some(mtime) = ext.mtime {
            write!(out, ",\"mtime\":{mtime}")?;
        }
    }
    out.write_all(b"}")?;
    Ok(())
}
