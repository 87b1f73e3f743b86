// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The random-access binary reader.
//!
//! Opening a container costs one seek to the trailer and one read of
//! the index block; after that any entry is reachable by itemref
//! through a small cache of decompressed blocks.  The cache holds
//! eight blocks with a linear scan; a hot block can be megabytes, so
//! a bigger cache costs more than it saves.
//!
//! Any bounds violation is fatal and reports the last successfully
//! parsed itemref for diagnostics.

use super::{
    BLOCK_DATA, BLOCK_INDEX, BLOCK_OVERHEAD, BlockHead, MAX_BLOCK_SIZE,
    SIGNATURE, cbor, etype, key,
};
use crate::entry::{Ext, SpecialKind};
use crate::result::{Error, Result};
use crate::sink::{Sink, SinkDir, SinkThread, Stat};
use std::io::{Read, Seek, SeekFrom};

/// Number of decompressed blocks kept in memory.
const CACHE_SLOTS: usize = 8;

struct CachedBlock {
    num: u64,
    data: Vec<u8>,
    used: u64,
}

pub struct BinReader<R> {
    src: R,
    len: u64,
    /// Index entries, 8 bytes per block number.
    index: Vec<u8>,
    root: u64,
    cache: [Option<CachedBlock>; CACHE_SLOTS],
    tick: u64,
    /// Last successfully parsed itemref, for error reports.
    last_ref: u64,
}

/// Decoded fields of one entry record.  The cumulative and shared
/// fields are carried for random-access consumers; a full import
/// recomputes them from the per-entry data.
#[allow(dead_code)]
#[derive(Clone, Debug, Default)]
pub struct Fields {
    pub etype: i64,
    pub name: Vec<u8>,
    pub prev: Option<u64>,
    pub asize: u64,
    pub dsize: u64,
    pub dev: Option<u64>,
    pub err: bool,
    pub suberr: bool,
    pub cum_asize: u64,
    pub cum_dsize: u64,
    pub shr_asize: u64,
    pub shr_dsize: u64,
    pub items: u64,
    pub sub: Option<u64>,
    pub ino: Option<u64>,
    pub nlink: Option<u64>,
    pub uid: Option<u64>,
    pub gid: Option<u64>,
    pub mode: Option<u64>,
    pub mtime: Option<u64>,
}

impl<R: Read + Seek> BinReader<R> {
    /// Validates the signature and loads the index block.
    pub fn open(mut src: R) -> Result<BinReader<R>> {
        let len = src.seek(SeekFrom::End(0))?;
        let mut sig = [0u8; 8];
        src.seek(SeekFrom::Start(0))?;
        if src.read_exact(&mut sig).is_err() || sig != SIGNATURE {
            return Err(Error::BadSignature);
        }
        let corrupt =
            |reason| Error::Corrupt { reason, last_ref: 0 };
        let mut word = [0u8; 4];
        src.seek(SeekFrom::End(-4))?;
        src.read_exact(&mut word)?;
        let head = BlockHead(u32::from_be_bytes(word));
        if head.kind() != BLOCK_INDEX {
            return Err(corrupt("final block is not an index"));
        }
        let total = head.len() as u64;
        // Header, at least the root ref, trailer; and it has to fit
        // between the signature and the end of the file.
        if total < 16 || total > len - SIGNATURE.len() as u64 {
            return Err(corrupt("index block does not fit"));
        }
        src.seek(SeekFrom::Start(len - total))?;
        let mut block = vec![0u8; total as usize];
        src.read_exact(&mut block)?;
        if block[0..4] != word {
            return Err(corrupt("index header and trailer differ"));
        }
        let body = &block[4..block.len() - 4];
        if (body.len() - 8) % 8 != 0 {
            return Err(corrupt("index body is misaligned"));
        }
        let root = u64::from_be_bytes(
            body[body.len() - 8..].try_into().expect("8-byte slice"),
        );
        let index = body[..body.len() - 8].to_vec();
        Ok(BinReader {
            src,
            len,
            index,
            root,
            cache: Default::default(),
            tick: 0,
            last_ref: 0,
        })
    }

    /// The itemref of the root directory, from the end of the index
    /// body.
    pub fn get_root(&self) -> u64 {
        self.root
    }

    pub fn block_count(&self) -> usize {
        self.index.len() / 8
    }

    fn corrupt(&self, reason: &'static str) -> Error {
        Error::Corrupt { reason, last_ref: self.last_ref }
    }

    /// Returns the cache slot holding block `num`, fetching and
    /// decompressing it on a miss.
    fn block(&mut self, num: u64) -> Result<usize> {
        self.tick += 1;
        let tick = self.tick;
        for (i, slot) in self.cache.iter_mut().enumerate() {
            if let Some(b) = slot
                && b.num == num
            {
                b.used = tick;
                return Ok(i);
            }
        }
        let at = num as usize * 8;
        if at + 8 > self.index.len() {
            return Err(self.corrupt("block number out of range"));
        }
        let entry = u64::from_be_bytes(
            self.index[at..at + 8].try_into().expect("8-byte slice"),
        );
        let offset = entry >> 24;
        let total = (entry & 0xff_ffff) as usize;
        if total < BLOCK_OVERHEAD + 1 {
            return Err(self.corrupt("block too short"));
        }
        if offset + total as u64 > self.len {
            return Err(self.corrupt("block beyond end of file"));
        }
        let mut raw = vec![0u8; total];
        self.src.seek(SeekFrom::Start(offset))?;
        self.src.read_exact(&mut raw)?;
        let head = BlockHead(u32::from_be_bytes(
            raw[0..4].try_into().expect("4-byte slice"),
        ));
        if head.kind() != BLOCK_DATA || head.len() as usize != total {
            return Err(self.corrupt("bad block framing"));
        }
        if raw[total - 4..] != raw[0..4] {
            return Err(self.corrupt("block header and trailer differ"));
        }
        let stored = u32::from_be_bytes(
            raw[4..8].try_into().expect("4-byte slice"),
        );
        if stored as u64 != num {
            return Err(self.corrupt("block number mismatch"));
        }
        let data =
            zstd::bulk::decompress(&raw[8..total - 4], MAX_BLOCK_SIZE)
                .map_err(|_| self.corrupt("decompression failed"))?;
        let slot = (0..CACHE_SLOTS)
            .min_by_key(|&i| self.cache[i].as_ref().map_or(0, |b| b.used))
            .expect("cache has slots");
        self.cache[slot] = Some(CachedBlock { num, data, used: tick });
        Ok(slot)
    }

    /// Reads and decodes the entry at `itemref`.
    pub fn read_fields(&mut self, itemref: u64) -> Result<Fields> {
        let num = itemref >> 24;
        let off = (itemref & 0xff_ffff) as usize;
        let slot = self.block(num)?;
        let data = &self.cache[slot].as_ref().expect("cached block").data;
        if off >= data.len() {
            return Err(Error::Corrupt {
                reason: "itemref offset beyond block",
                last_ref: self.last_ref,
            });
        }
        let fields = parse_item(data, off, itemref).map_err(|reason| {
            Error::Corrupt { reason, last_ref: self.last_ref }
        })?;
        self.last_ref = itemref;
        Ok(fields)
    }
}

/// Decodes one entry map.  Unknown keys are skipped; a known key
/// with an unexpected type is an error.
fn parse_item(
    data: &[u8],
    mut pos: usize,
    cur: u64,
) -> std::result::Result<Fields, &'static str> {
    use cbor::Head;
    let mut remaining = match cbor::take_head(data, &mut pos) {
        Some(Head::Map(n)) => n,
        _ => return Err("entry is not a map"),
    };
    let mut f = Fields::default();
    let mut have_type = false;
    loop {
        if remaining == Some(0) {
            break;
        }
        let k = match cbor::take_head(data, &mut pos) {
            Some(Head::Break) if remaining.is_none() => break,
            Some(Head::Uint(k)) => k,
            _ => return Err("bad entry key"),
        };
        if let Some(n) = &mut remaining {
            *n -= 1;
        }
        let value = cbor::take_head(data, &mut pos).ok_or("truncated value")?;
        match (k, value) {
            (key::TYPE, Head::Uint(v)) => {
                f.etype = v as i64;
                have_type = true;
            }
            (key::TYPE, Head::Nint(a)) => {
                f.etype = -(a as i64) - 1;
                have_type = true;
            }
            (key::NAME, Head::Bytes(n) | Head::Text(n)) => {
                let bs = data.get(pos..pos + n).ok_or("truncated name")?;
                f.name = bs.to_vec();
                pos += n;
            }
            (key::PREV, v) => f.prev = Some(take_ref(v, cur)?),
            (key::SUB, v) => f.sub = Some(take_ref(v, cur)?),
            (key::ASIZE, Head::Uint(v)) => f.asize = v,
            (key::DSIZE, Head::Uint(v)) => f.dsize = v,
            (key::DEV, Head::Uint(v)) => f.dev = Some(v),
            (key::RDERR, Head::Simple(cbor::SIMPLE_TRUE)) => f.err = true,
            (key::RDERR, Head::Simple(cbor::SIMPLE_FALSE)) => {
                f.suberr = true
            }
            (key::CUMASIZE, Head::Uint(v)) => f.cum_asize = v,
            (key::CUMDSIZE, Head::Uint(v)) => f.cum_dsize = v,
            (key::SHRASIZE, Head::Uint(v)) => f.shr_asize = v,
            (key::SHRDSIZE, Head::Uint(v)) => f.shr_dsize = v,
            (key::ITEMS, Head::Uint(v)) => f.items = v,
            (key::INO, Head::Uint(v)) => f.ino = Some(v),
            (key::NLINK, Head::Uint(v)) => f.nlink = Some(v),
            (key::UID, Head::Uint(v)) => f.uid = Some(v),
            (key::GID, Head::Uint(v)) => f.gid = Some(v),
            (key::MODE, Head::Uint(v)) => f.mode = Some(v),
            (key::MTIME, Head::Uint(v)) => f.mtime = Some(v),
            (k, v) if k <= key::MTIME => {
                let _ = (k, v);
                return Err("unexpected type for known key");
            }
            (_, v) => skip_value(data, &mut pos, v, 0)?,
        }
    }
    if !have_type {
        return Err("entry without a type");
    }
    if f.name.is_empty() {
        return Err("entry without a name");
    }
    Ok(f)
}

/// Item references are positive when absolute; a negative value `-a-1`
/// means `cur - a - 1`, with wrap-around, for targets in the same
/// block.
fn take_ref(
    head: cbor::Head,
    cur: u64,
) -> std::result::Result<u64, &'static str> {
    match head {
        cbor::Head::Uint(v) => Ok(v),
        cbor::Head::Nint(a) => Ok(cur.wrapping_sub(a).wrapping_sub(1)),
        _ => Err("unexpected type for known key"),
    }
}

/// Skips the payload of an already-read head, recursing through
/// containers.
fn skip_value(
    data: &[u8],
    pos: &mut usize,
    head: cbor::Head,
    depth: u32,
) -> std::result::Result<(), &'static str> {
    use cbor::Head;
    if depth > 32 {
        return Err("value nested too deeply");
    }
    let take_next = |pos: &mut usize| {
        cbor::take_head(data, pos).ok_or("truncated value")
    };
    match head {
        Head::Uint(_) | Head::Nint(_) | Head::Simple(_) => Ok(()),
        Head::Break => Err("unexpected break"),
        Head::Bytes(n) | Head::Text(n) => {
            if data.len() < *pos + n {
                return Err("truncated value");
            }
            *pos += n;
            Ok(())
        }
        Head::Tag(_) => {
            let h = take_next(pos)?;
            skip_value(data, pos, h, depth + 1)
        }
        Head::Array(len) | Head::Map(len) => {
            let per = if matches!(head, Head::Map(_)) { 2 } else { 1 };
            match len {
                Some(n) => {
                    for _ in 0..n.saturating_mul(per) {
                        let h = take_next(pos)?;
                        skip_value(data, pos, h, depth + 1)?;
                    }
                    Ok(())
                }
                None => loop {
                    let h = take_next(pos)?;
                    if h == Head::Break {
                        return Ok(());
                    }
                    skip_value(data, pos, h, depth + 1)?;
                },
            }
        }
    }
}

fn ext_from(f: &Fields) -> Ext {
    Ext {
        mtime: f.mtime,
        uid: f.uid.map(|v| v as u32),
        gid: f.gid.map(|v| v as u32),
        mode: f.mode.map(|v| v as u32),
    }
}

fn dir_stat(f: &Fields, parent_dev: u64) -> Stat {
    Stat {
        dir: true,
        blocks: f.dsize / 512,
        size: f.asize,
        dev: f.dev.unwrap_or(parent_dev),
        nlink: 1,
        ext: ext_from(f),
        ..Stat::default()
    }
}

fn file_stat(f: &Fields, dev: u64) -> Stat {
    Stat {
        dir: false,
        regular: f.etype != etype::NONREG,
        blocks: f.dsize / 512,
        size: f.asize,
        dev,
        ino: f.ino.unwrap_or(0),
        nlink: f.nlink.unwrap_or(0) as u32,
        hardlink: f.etype == etype::LINK,
        ext: ext_from(f),
        ..Stat::default()
    }
}

fn special_of(code: i64) -> Option<SpecialKind> {
    match code {
        etype::ERR => Some(SpecialKind::Err),
        etype::OTHERFS => Some(SpecialKind::OtherFs),
        etype::KERNFS => Some(SpecialKind::Kernfs),
        etype::PATTERN => Some(SpecialKind::Pattern),
        _ => None,
    }
}

/// Streams a container into a sink, depth-first from the root: each
/// directory's children are gathered by chasing the backwards `prev`
/// chain from `sub`, then re-emitted in forward order.
pub fn import<R: Read + Seek>(
    rd: &mut BinReader<R>,
    sink: &Sink,
    th: &SinkThread,
) -> Result<()> {
    struct Frame {
        dir: SinkDir,
        dev: u64,
        kids: std::vec::IntoIter<Fields>,
    }
    let rf = rd.read_fields(rd.get_root())?;
    if rf.etype != etype::DIR {
        return Err(rd.corrupt("root is not a directory"));
    }
    let dev = rf.dev.unwrap_or(0);
    let st = dir_stat(&rf, dev);
    let root = sink.create_root(&rf.name, &st);
    if rf.err {
        sink.set_read_error(&root);
    }
    let kids = children(rd, rf.sub)?;
    let mut stack = vec![Frame { dir: root, dev: st.dev, kids }];
    while let Some(frame) = stack.last_mut() {
        let dev = frame.dev;
        let dir = frame.dir.clone();
        let Some(f) = frame.kids.next() else {
            let frame = stack.pop().expect("import stack");
            sink.unref(frame.dir, th)?;
            continue;
        };
        if stack.len() > (1 << 20) {
            return Err(rd.corrupt("directory nesting too deep"));
        }
        // Only the root may name a path; children are single
        // components.
        if f.name.iter().any(|&b| b == b'/' || b == 0) {
            return Err(rd.corrupt("invalid child name"));
        }
        match f.etype {
            etype::DIR => {
                let st = dir_stat(&f, dev);
                let child = sink.add_dir(&dir, th, &f.name, &st)?;
                if f.err {
                    sink.set_read_error(&child);
                }
                let kids = children(rd, f.sub)?;
                stack.push(Frame { dir: child, dev: st.dev, kids });
            }
            etype::REG | etype::NONREG | etype::LINK => {
                sink.add_stat(&dir, th, &f.name, &file_stat(&f, dev))?;
            }
            code => match special_of(code) {
                Some(kind) => sink.add_special(&dir, th, &f.name, kind)?,
                None => return Err(rd.corrupt("unknown entry type")),
            },
        }
    }
    Ok(())
}

fn children<R: Read + Seek>(
    rd: &mut BinReader<R>,
    sub: Option<u64>,
) -> Result<std::vec::IntoIter<Fields>> {
    let mut v = Vec::new();
    let mut cur = sub;
    while let Some(r) = cur {
        let f = rd.read_fields(r)?;
        cur = f.prev;
        v.push(f);
        if v.len() > u32::MAX as usize {
            return Err(rd.corrupt("sibling chain does not terminate"));
        }
    }
    v.reverse();
    Ok(v.into_iter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binfmt::writer::BinSink;
    use crate::entry::NodeKind;
    use crate::mem;
    use std::io::Cursor;

    fn filestat(size: u64, blocks: u64) -> Stat {
        Stat {
            regular: true,
            blocks,
            size,
            dev: 1,
            nlink: 1,
            ..Stat::default()
        }
    }

    fn dirstat() -> Stat {
        Stat { dir: true, blocks: 8, size: 4096, dev: 1, ..Stat::default() }
    }

    /// Scans a synthetic tree into a binary sink and returns the
    /// container bytes.
    fn export(block_size: usize, files: usize) -> Vec<u8> {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let out = tmp.reopen().unwrap();
        let sink = Sink::binary(
            BinSink::new(Box::new(out), 3, block_size, false).unwrap(),
            false,
        );
        let threads = sink.create_threads(1);
        let th = &threads[0];
        let root = sink.create_root(b"/r", &dirstat());
        sink.add_stat(&root, th, b"a", &filestat(100, 8)).unwrap();
        sink.add_stat(&root, th, b"b", &filestat(200, 8)).unwrap();
        let sub = sink.add_dir(&root, th, b"sub", &dirstat()).unwrap();
        for i in 0..files {
            let name = format!("file{i}");
            sink.add_stat(&sub, th, name.as_bytes(), &filestat(10, 8))
                .unwrap();
        }
        sink.add_stat(
            &sub,
            th,
            b"link",
            &Stat { nlink: 2, ino: 42, ..filestat(1000, 16) },
        )
        .unwrap();
        sink.add_special(&sub, th, b"\xffgone", SpecialKind::Err).unwrap();
        sink.unref(sub, th).unwrap();
        sink.unref(root, th).unwrap();
        sink.finalize(&threads).unwrap();
        std::fs::read(tmp.path()).unwrap()
    }

    #[test]
    fn signature_is_validated() {
        assert!(matches!(
            BinReader::open(Cursor::new(b"not an export".to_vec())),
            Err(Error::BadSignature)
        ));
    }

    #[test]
    fn block_index_is_consistent() {
        let bytes = export(4 << 10, 300);
        let rd = BinReader::open(Cursor::new(bytes.clone())).unwrap();
        assert!(rd.block_count() > 1, "want a multi-block container");
        for num in 0..rd.block_count() {
            let at = num * 8;
            let entry =
                u64::from_be_bytes(rd.index[at..at + 8].try_into().unwrap());
            let offset = (entry >> 24) as usize;
            let total = (entry & 0xff_ffff) as usize;
            let head = BlockHead(u32::from_be_bytes(
                bytes[offset..offset + 4].try_into().unwrap(),
            ));
            assert_eq!(head.kind(), BLOCK_DATA);
            assert_eq!(head.len() as usize, total);
            assert_eq!(
                bytes[offset..offset + 4],
                bytes[offset + total - 4..offset + total]
            );
            let stored = u32::from_be_bytes(
                bytes[offset + 4..offset + 8].try_into().unwrap(),
            );
            assert_eq!(stored as usize, num);
        }
    }

    #[test]
    fn roundtrip_single_block() {
        roundtrip(64 << 10, 3);
    }

    #[test]
    fn roundtrip_many_blocks() {
        roundtrip(4 << 10, 500);
    }

    fn roundtrip(block_size: usize, files: usize) {
        let bytes = export(block_size, files);
        let mut rd = BinReader::open(Cursor::new(bytes)).unwrap();
        let sink = Sink::memory(false);
        let threads = sink.create_threads(1);
        import(&mut rd, &sink, &threads[0]).unwrap();
        sink.finalize(&threads).unwrap();
        let m = sink.mem().unwrap();
        let tree = m.tree.lock().unwrap();
        let root = tree.root.unwrap();
        assert_eq!(&*tree[root].name, b"/r".as_slice());
        let ent = tree[root].dir().unwrap();
        assert_eq!(ent.items as usize, 3 + files + 2);
        assert_eq!(
            ent.cum_size,
            4096 + 100 + 200 + 4096 + 10 * files as u64 + 1000
        );
        // The lone link has nlink 2: shared everywhere.
        assert_eq!(ent.shared_size, 1000);
        assert!(ent.suberr);
        let sub = tree
            .children(root)
            .find(|&c| tree[c].is_dir())
            .unwrap();
        assert!(tree[sub].dir().unwrap().suberr);
        let special = tree
            .children(sub)
            .find(|&c| matches!(tree[c].kind, NodeKind::Special(_)))
            .unwrap();
        assert_eq!(&*tree[special].name, b"\xffgone".as_slice());
        mem::assert_additive(&tree);
    }

    #[test]
    fn binary_to_binary_conversion() {
        let bytes = export(64 << 10, 10);
        let mut rd = BinReader::open(Cursor::new(bytes)).unwrap();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let out = tmp.reopen().unwrap();
        let sink = Sink::binary(
            BinSink::new(Box::new(out), 3, 64 << 10, false).unwrap(),
            false,
        );
        let threads = sink.create_threads(1);
        import(&mut rd, &sink, &threads[0]).unwrap();
        sink.finalize(&threads).unwrap();
        let again = std::fs::read(tmp.path()).unwrap();
        let mut rd2 = BinReader::open(Cursor::new(again)).unwrap();
        let f = rd2.read_fields(rd2.get_root()).unwrap();
        assert_eq!(f.etype, etype::DIR);
        assert_eq!(f.items, 15);
    }

    #[test]
    fn truncated_container_is_corrupt() {
        let bytes = export(64 << 10, 3);
        let cut = &bytes[..bytes.len() - 6];
        assert!(BinReader::open(Cursor::new(cut.to_vec())).is_err());
    }
}
