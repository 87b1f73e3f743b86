// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The streaming binary writer.
//!
//! Every worker owns a private uncompressed buffer.  A block number
//! is reserved (an 8-byte zero slot appended to the index) the
//! moment the first entry lands in an empty buffer, because entry
//! references must be known while entries are still being encoded;
//! the slot is filled in with `(offset << 24) | length` when the
//! buffer is compressed and written out.  The file and the index
//! live behind one mutex, held for the duration of a single block
//! write and never across compression.
//!
//! Directories accumulate their children's sizes in their handle and
//! are emitted when the last reference goes away, which is after all
//! their children: the stream is depth-first with children first, as
//! the backwards `prev` linkage requires.  A streaming writer cannot
//! know hardlink-class containment, so shared sizes are left out;
//! readers recompute them from the per-link inode fields.

use super::{
    BLOCK_DATA, BLOCK_INDEX, BLOCK_OVERHEAD, BlockHead, ItemRef,
    MAX_FILE_OFFSET, SIGNATURE, cbor, etype, key,
};
use crate::entry::{Ext, SpecialKind};
use crate::result::{Error, Result};
use crate::sink::{SinkThread, Stat};
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering, fence};
use std::sync::{Arc, Mutex, MutexGuard};

/// Default uncompressed block size.
pub const DEFAULT_BLOCK_SIZE: usize = 64 << 10;

/// Buffers stop doubling here.
const BLOCK_SIZE_CAP: usize = 2 << 20;

/// Worst-case encoded entry size, name excluded.
const ENTRY_BOUND: usize = 280;

/// Buffer size after `emitted` blocks: doubling at 1, 2, 4, 8 and
/// 16 Mi blocks keeps the index small for enormous scans while
/// keeping reader memory bounded for ordinary ones.
fn block_size(base: usize, emitted: u64) -> usize {
    let mut size = base;
    for threshold in [1u64 << 20, 2 << 20, 4 << 20, 8 << 20, 16 << 20] {
        if emitted >= threshold {
            size = size.saturating_mul(2);
        }
    }
    size.min(BLOCK_SIZE_CAP.max(base))
}

struct Out {
    file: Box<dyn Write + Send>,
    offset: u64,
    /// Index block under construction: a 4-byte placeholder for the
    /// header, then one 8-byte slot per reserved block number.
    index: Vec<u8>,
    root: Option<u64>,
}

/// A worker's private block buffer.
pub struct WorkerBuf {
    buf: Vec<u8>,
    cap: usize,
    /// Block number reserved for the current buffer, if any.
    block: Option<u64>,
    emitted: u64,
}

struct BinDirState {
    name: Box<[u8]>,
    stat: Stat,
    /// None for the root; its device is always emitted.
    parent_dev: Option<u64>,
    /// Itemref of the most recently emitted child.
    last_child: Option<u64>,
    cum_asize: u64,
    cum_dsize: u64,
    items: u64,
    err: bool,
    suberr: bool,
}

struct BinDirInner {
    parent: Option<BinDir>,
    refs: AtomicU32,
    st: Mutex<BinDirState>,
}

/// A refcounted handle on a directory whose record is yet to be
/// written.
#[derive(Clone)]
pub struct BinDir(Arc<BinDirInner>);

impl BinDir {
    fn new(parent: Option<BinDir>, name: &[u8], stat: Stat) -> BinDir {
        let parent_dev = parent.as_ref().map(|p| p.state().stat.dev);
        BinDir(Arc::new(BinDirInner {
            parent,
            refs: AtomicU32::new(1),
            st: Mutex::new(BinDirState {
                name: name.into(),
                stat,
                parent_dev,
                last_child: None,
                cum_asize: stat.size,
                cum_dsize: stat.blocks.saturating_mul(512),
                items: 0,
                err: false,
                suberr: false,
            }),
        }))
    }

    fn state(&self) -> MutexGuard<'_, BinDirState> {
        self.0.st.lock().expect("bin dir lock")
    }
}

/// Fields of one entry record, in key order.
struct Record<'a> {
    etype: i64,
    name: &'a [u8],
    prev: Option<u64>,
    asize: u64,
    dsize: u64,
    dev: Option<u64>,
    rderr: Option<bool>,
    cum: Option<(u64, u64, u64)>,
    sub: Option<u64>,
    ino: Option<u64>,
    nlink: Option<u64>,
    ext: Option<Ext>,
}

impl Record<'_> {
    fn plain(etype: i64, name: &[u8], prev: Option<u64>) -> Record<'_> {
        Record {
            etype,
            name,
            prev,
            asize: 0,
            dsize: 0,
            dev: None,
            rderr: None,
            cum: None,
            sub: None,
            ino: None,
            nlink: None,
            ext: None,
        }
    }
}

pub struct BinSink {
    out: Mutex<Out>,
    level: i32,
    base_block: usize,
    extended: bool,
}

impl BinSink {
    pub fn new(
        mut file: Box<dyn Write + Send>,
        level: i32,
        block_size: usize,
        extended: bool,
    ) -> Result<BinSink> {
        file.write_all(&SIGNATURE)?;
        Ok(BinSink {
            out: Mutex::new(Out {
                file,
                offset: SIGNATURE.len() as u64,
                index: vec![0u8; 4],
                root: None,
            }),
            level,
            base_block: block_size,
            extended,
        })
    }

    pub fn worker_buf(&self) -> WorkerBuf {
        WorkerBuf {
            buf: Vec::new(),
            cap: self.base_block,
            block: None,
            emitted: 0,
        }
    }

    fn lock_out(&self) -> MutexGuard<'_, Out> {
        self.out.lock().expect("bin writer lock")
    }

    /// Reserves the next block number for a worker: the index grows
    /// by one zeroed slot, and `(index_len - 4) / 8` numbers it.
    fn reserve(&self, wb: &mut WorkerBuf) -> Result<()> {
        let mut out = self.lock_out();
        let num = ((out.index.len() - 4) / 8) as u64;
        if num > u32::MAX as u64 {
            return Err(Error::ExportTooLarge);
        }
        out.index.extend_from_slice(&[0u8; 8]);
        wb.block = Some(num);
        Ok(())
    }

    /// Compresses and writes out a worker's buffer, filling in its
    /// reserved index slot.
    fn flush(&self, wb: &mut WorkerBuf) -> Result<()> {
        let Some(block) = wb.block else { return Ok(()) };
        if wb.buf.is_empty() {
            wb.block = None;
            return Ok(());
        }
        let payload = zstd::bulk::compress(&wb.buf, self.level)?;
        let total = (BLOCK_OVERHEAD + payload.len()) as u64;
        if total > 0xff_ffff {
            return Err(Error::ExportTooLarge);
        }
        let head = BlockHead(0).with_kind(BLOCK_DATA).with_len(total as u32);
        let mut out = self.lock_out();
        if out.offset.saturating_add(total) > MAX_FILE_OFFSET {
            return Err(Error::ExportTooLarge);
        }
        let slot = 4 + block as usize * 8;
        let entry = (out.offset << 24) | total;
        out.index[slot..slot + 8].copy_from_slice(&entry.to_be_bytes());
        let Out { file, offset, .. } = &mut *out;
        file.write_all(&head.0.to_be_bytes())?;
        file.write_all(&(block as u32).to_be_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&head.0.to_be_bytes())?;
        *offset += total;
        drop(out);
        wb.buf.clear();
        wb.block = None;
        wb.emitted += 1;
        wb.cap = block_size(self.base_block, wb.emitted);
        Ok(())
    }

    /// Encodes one record into the worker's buffer and returns its
    /// itemref.
    fn put_record(&self, wb: &mut WorkerBuf, r: &Record<'_>) -> Result<u64> {
        if wb.block.is_some() && wb.buf.len() + ENTRY_BOUND + r.name.len() > wb.cap
        {
            self.flush(wb)?;
        }
        if wb.block.is_none() {
            self.reserve(wb)?;
        }
        let block = wb.block.expect("reserved block number");
        let cur =
            ItemRef(0).with_block(block).with_offset(wb.buf.len() as u32).0;
        let out = &mut wb.buf;
        cbor::put_map_indef(out);
        cbor::put_uint(out, key::TYPE);
        if r.etype >= 0 {
            cbor::put_uint(out, r.etype as u64);
        } else {
            cbor::put_nint_arg(out, (-r.etype - 1) as u64);
        }
        cbor::put_uint(out, key::NAME);
        cbor::put_bytes(out, r.name);
        if let Some(prev) = r.prev {
            cbor::put_uint(out, key::PREV);
            put_ref(out, cur, prev);
        }
        if r.etype >= 0 {
            cbor::put_uint(out, key::ASIZE);
            cbor::put_uint(out, r.asize);
            cbor::put_uint(out, key::DSIZE);
            cbor::put_uint(out, r.dsize);
        }
        if let Some(dev) = r.dev {
            cbor::put_uint(out, key::DEV);
            cbor::put_uint(out, dev);
        }
        if let Some(err) = r.rderr {
            cbor::put_uint(out, key::RDERR);
            cbor::put_bool(out, err);
        }
        if let Some((ca, cd, items)) = r.cum {
            cbor::put_uint(out, key::CUMASIZE);
            cbor::put_uint(out, ca);
            cbor::put_uint(out, key::CUMDSIZE);
            cbor::put_uint(out, cd);
            cbor::put_uint(out, key::ITEMS);
            cbor::put_uint(out, items.min(u32::MAX as u64));
        }
        if let Some(sub) = r.sub {
            cbor::put_uint(out, key::SUB);
            put_ref(out, cur, sub);
        }
        if let Some(ino) = r.ino {
            cbor::put_uint(out, key::INO);
            cbor::put_uint(out, ino);
        }
        if let Some(nlink) = r.nlink.filter(|&n| n > 0) {
            cbor::put_uint(out, key::NLINK);
            cbor::put_uint(out, nlink);
        }
        if let Some(ext) = r.ext {
            if let Some(uid) = ext.uid {
                cbor::put_uint(out, key::UID);
                cbor::put_uint(out, uid as u64);
            }
            if let Some(gid) = ext.gid {
                cbor::put_uint(out, key::GID);
                cbor::put_uint(out, gid as u64);
            }
            if let Some(mode) = ext.mode {
                cbor::put_uint(out, key::MODE);
                cbor::put_uint(out, mode as u64);
            }
            if let Some(mtime) = ext.mtime {
                cbor::put_uint(out, key::MTIME);
                cbor::put_uint(out, mtime);
            }
        }
        cbor::put_break(out);
        Ok(cur)
    }

    fn ext_of(&self, st: &Stat) -> Option<Ext> {
        if self.extended && !st.ext.is_empty() { Some(st.ext) } else { None }
    }

    pub fn create_root(&self, name: &[u8], st: &Stat) -> BinDir {
        BinDir::new(None, name, *st)
    }

    pub fn add_dir(&self, d: &BinDir, name: &[u8], st: &Stat) -> BinDir {
        d.0.refs.fetch_add(1, Ordering::Relaxed);
        BinDir::new(Some(d.clone()), name, *st)
    }

    pub fn add_stat(
        &self,
        d: &BinDir,
        th: &SinkThread,
        name: &[u8],
        st: &Stat,
    ) -> Result<()> {
        let code = if st.is_link() {
            etype::LINK
        } else if st.regular {
            etype::REG
        } else {
            etype::NONREG
        };
        let dsize = st.blocks.saturating_mul(512);
        let mut ds = d.state();
        let mut wb = lock_buf(th);
        let mut r = Record::plain(code, name, ds.last_child);
        r.asize = st.size;
        r.dsize = dsize;
        r.ext = self.ext_of(st);
        if st.is_link() {
            r.ino = Some(st.ino);
            r.nlink = Some(st.nlink as u64);
        }
        let itemref = self.put_record(&mut wb, &r)?;
        ds.last_child = Some(itemref);
        ds.cum_asize = ds.cum_asize.saturating_add(st.size);
        ds.cum_dsize = ds.cum_dsize.saturating_add(dsize);
        ds.items += 1;
        Ok(())
    }

    pub fn add_special(
        &self,
        d: &BinDir,
        th: &SinkThread,
        name: &[u8],
        kind: SpecialKind,
    ) -> Result<()> {
        let code = match kind {
            SpecialKind::Err => etype::ERR,
            SpecialKind::OtherFs => etype::OTHERFS,
            SpecialKind::Kernfs => etype::KERNFS,
            SpecialKind::Pattern => etype::PATTERN,
        };
        let mut ds = d.state();
        let mut wb = lock_buf(th);
        let r = Record::plain(code, name, ds.last_child);
        let itemref = self.put_record(&mut wb, &r)?;
        ds.last_child = Some(itemref);
        ds.items += 1;
        if kind == SpecialKind::Err {
            ds.suberr = true;
        }
        Ok(())
    }

    pub fn set_read_error(&self, d: &BinDir) {
        d.state().err = true;
    }

    /// Releases one reference; the last one writes the directory's
    /// own record and hands back the parent for the same treatment.
    pub fn unref(
        &self,
        d: BinDir,
        th: &SinkThread,
    ) -> Result<Option<BinDir>> {
        if d.0.refs.fetch_sub(1, Ordering::Release) != 1 {
            return Ok(None);
        }
        fence(Ordering::Acquire);
        self.finalize_dir(&d, th)
    }

    fn finalize_dir(
        &self,
        d: &BinDir,
        th: &SinkThread,
    ) -> Result<Option<BinDir>> {
        let (name, stat, parent_dev, sub, cum, items, err, suberr) = {
            let ds = d.state();
            (
                ds.name.clone(),
                ds.stat,
                ds.parent_dev,
                ds.last_child,
                (ds.cum_asize, ds.cum_dsize),
                ds.items,
                ds.err,
                ds.suberr,
            )
        };
        let mut r = Record::plain(etype::DIR, &name, None);
        r.asize = stat.size;
        r.dsize = stat.blocks.saturating_mul(512);
        r.dev = match parent_dev {
            Some(dev) if dev == stat.dev => None,
            _ => Some(stat.dev),
        };
        r.rderr = if err {
            Some(true)
        } else if suberr {
            Some(false)
        } else {
            None
        };
        r.cum = Some((cum.0, cum.1, items));
        r.sub = sub;
        r.ext = self.ext_of(&stat);
        match &d.0.parent {
            Some(p) => {
                let mut ps = p.state();
                let mut wb = lock_buf(th);
                r.prev = ps.last_child;
                let itemref = self.put_record(&mut wb, &r)?;
                ps.last_child = Some(itemref);
                ps.cum_asize = ps.cum_asize.saturating_add(cum.0);
                ps.cum_dsize = ps.cum_dsize.saturating_add(cum.1);
                ps.items += items + 1;
                ps.suberr |= err || suberr;
                drop(wb);
                drop(ps);
                Ok(Some(p.clone()))
            }
            None => {
                let mut wb = lock_buf(th);
                let itemref = self.put_record(&mut wb, &r)?;
                drop(wb);
                self.lock_out().root = Some(itemref);
                Ok(None)
            }
        }
    }

    /// Flushes every worker buffer and writes the index block:
    /// trailing zero slots trimmed, the root itemref appended, the
    /// body bracketed by header and trailer.
    pub fn finalize(&self, threads: &[SinkThread]) -> Result<()> {
        for th in threads {
            if let Some(m) = &th.bin {
                let mut wb = m.lock().expect("worker buffer lock");
                self.flush(&mut wb)?;
            }
        }
        let mut out = self.lock_out();
        let root = out.root.expect("finalized export has a root");
        while out.index.len() > 4
            && out.index[out.index.len() - 8..] == [0u8; 8]
        {
            let len = out.index.len() - 8;
            out.index.truncate(len);
        }
        out.index.extend_from_slice(&root.to_be_bytes());
        let total = out.index.len() + 4;
        if total >= 1 << 28 {
            return Err(Error::ExportTooLarge);
        }
        let head = BlockHead(0).with_kind(BLOCK_INDEX).with_len(total as u32);
        out.index[0..4].copy_from_slice(&head.0.to_be_bytes());
        let Out { file, index, .. } = &mut *out;
        file.write_all(index)?;
        file.write_all(&head.0.to_be_bytes())?;
        file.flush()?;
        Ok(())
    }
}

fn lock_buf(th: &SinkThread) -> MutexGuard<'_, WorkerBuf> {
    th.bin
        .as_ref()
        .expect("binary sink worker state")
        .lock()
        .expect("worker buffer lock")
}

/// Emits a reference.  Targets inside the current block are encoded
/// relative, as the negative integer `cur - target - 1`.
fn put_ref(out: &mut Vec<u8>, cur: u64, target: u64) {
    if cur >> 24 == target >> 24 {
        cbor::put_nint_arg(out, cur - target - 1);
    } else {
        cbor::put_uint(out, target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_doubling_schedule() {
        let base = DEFAULT_BLOCK_SIZE;
        assert_eq!(block_size(base, 0), 64 << 10);
        assert_eq!(block_size(base, (1 << 20) - 1), 64 << 10);
        assert_eq!(block_size(base, 1 << 20), 128 << 10);
        assert_eq!(block_size(base, 2 << 20), 256 << 10);
        assert_eq!(block_size(base, 4 << 20), 512 << 10);
        assert_eq!(block_size(base, 8 << 20), 1 << 20);
        assert_eq!(block_size(base, 16 << 20), 2 << 20);
        assert_eq!(block_size(base, u64::MAX), 2 << 20);
        // A large explicit block size neither doubles nor shrinks.
        assert_eq!(block_size(8 << 20, 16 << 20), 8 << 20);
    }

    #[test]
    fn relative_refs_same_block_only() {
        let mut out = Vec::new();
        let cur = (5u64 << 24) | 100;
        put_ref(&mut out, cur, (5 << 24) | 40);
        let mut pos = 0;
        assert_eq!(
            cbor::take_head(&out, &mut pos),
            Some(cbor::Head::Nint(59))
        );
        out.clear();
        put_ref(&mut out, cur, (4 << 24) | 40);
        let mut pos = 0;
        assert_eq!(
            cbor::take_head(&out, &mut pos),
            Some(cbor::Head::Uint((4 << 24) | 40))
        );
    }
}
