// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sink dispatch.
//!
//! The scanner and the importers do not know where entries end up;
//! they talk to a [`Sink`], which routes every event to the selected
//! backend: the in-memory tree or the streaming binary writer.  The
//! textual format has no streaming backend; exports requesting it go
//! through memory and are converted on finalize.
//!
//! Directory handles are reference counted.  A handle starts with one
//! reference held by its creator; creating a child directory takes
//! another on the parent.  The last release finalizes the directory,
//! so a parent is always finalized strictly after its children.

use crate::binfmt::writer::{BinDir, BinSink, WorkerBuf};
use crate::entry::{Ext, MAX_BLOCKS, NodeId, SpecialKind};
use crate::mem::{MemDir, MemSink};
use crate::result::Result;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A scanned (or imported) stat record, already reduced to the
/// fields the sinks care about.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stat {
    pub dir: bool,
    pub regular: bool,
    pub symlink: bool,
    /// 512-byte units, clamped to [`MAX_BLOCKS`].
    pub blocks: u64,
    /// Apparent size in bytes.
    pub size: u64,
    pub dev: u64,
    pub ino: u64,
    /// 0 when unknown (imports without a link count).
    pub nlink: u32,
    /// Forced hardlink membership; imports set this for entries
    /// marked as hardlinks even when the link count was not stored.
    pub hardlink: bool,
    pub ext: Ext,
}

impl Stat {
    pub fn from_file_stat(st: &nix::sys::stat::FileStat) -> Stat {
        let mode = st.st_mode as u32;
        let fmt = mode & libc::S_IFMT;
        Stat {
            dir: fmt == libc::S_IFDIR,
            regular: fmt == libc::S_IFREG,
            symlink: fmt == libc::S_IFLNK,
            blocks: u64::min(st.st_blocks.max(0) as u64, MAX_BLOCKS),
            size: st.st_size.max(0) as u64,
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            nlink: st.st_nlink as u32,
            hardlink: false,
            ext: Ext {
                mtime: Some(st.st_mtime.max(0) as u64),
                uid: Some(st.st_uid),
                gid: Some(st.st_gid),
                mode: Some(mode),
            },
        }
    }

    /// Non-directories with more than one link join a hardlink class.
    pub fn is_link(&self) -> bool {
        !self.dir && (self.nlink > 1 || self.hardlink)
    }
}

pub enum Backend {
    Mem(MemSink),
    Bin(BinSink),
}

/// A type-erased directory handle.
#[derive(Clone)]
pub enum SinkDir {
    Mem(MemDir),
    Bin(BinDir),
}

impl SinkDir {
    pub(crate) fn mem(&self) -> &MemDir {
        match self {
            SinkDir::Mem(d) => d,
            SinkDir::Bin(_) => unreachable!("binary handle in memory sink"),
        }
    }

    fn bin(&self) -> &BinDir {
        match self {
            SinkDir::Bin(d) => d,
            SinkDir::Mem(_) => unreachable!("memory handle in binary sink"),
        }
    }
}

/// Per-worker sink state: progress counters, the published current
/// directory, and (for the binary backend) the block buffer.
pub struct SinkThread {
    pub files_seen: AtomicU32,
    pub bytes_seen: AtomicU64,
    current: Mutex<Vec<u8>>,
    pub(crate) bin: Option<Mutex<WorkerBuf>>,
}

impl SinkThread {
    fn new(bin: Option<WorkerBuf>) -> SinkThread {
        SinkThread {
            files_seen: AtomicU32::new(0),
            bytes_seen: AtomicU64::new(0),
            current: Mutex::new(Vec::new()),
            bin: bin.map(Mutex::new),
        }
    }

    pub fn current_dir(&self) -> Vec<u8> {
        self.current.lock().expect("current dir lock").clone()
    }
}

pub struct Sink {
    backend: Backend,
    pub extended: bool,
    last_error: Mutex<Option<Vec<u8>>>,
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink").field("extended", &self.extended).finish()
    }
}

impl Sink {
    pub fn memory(extended: bool) -> Sink {
        Sink {
            backend: Backend::Mem(MemSink::new(extended)),
            extended,
            last_error: Mutex::new(None),
        }
    }

    pub fn binary(writer: BinSink, extended: bool) -> Sink {
        Sink {
            backend: Backend::Bin(writer),
            extended,
            last_error: Mutex::new(None),
        }
    }

    pub fn mem(&self) -> Option<&MemSink> {
        match &self.backend {
            Backend::Mem(m) => Some(m),
            Backend::Bin(_) => None,
        }
    }

    pub fn create_threads(&self, t: usize) -> Vec<SinkThread> {
        (0..t.max(1))
            .map(|_| match &self.backend {
                Backend::Mem(_) => SinkThread::new(None),
                Backend::Bin(b) => SinkThread::new(Some(b.worker_buf())),
            })
            .collect()
    }

    pub fn create_root(&self, name: &[u8], st: &Stat) -> SinkDir {
        match &self.backend {
            Backend::Mem(m) => SinkDir::Mem(m.create_root(name, st)),
            Backend::Bin(b) => SinkDir::Bin(b.create_root(name, st)),
        }
    }

    /// Rebinds an existing in-memory directory as the scan root for
    /// a refresh.  Only meaningful for the memory backend.
    pub(crate) fn create_root_at(&self, node: NodeId, st: &Stat) -> SinkDir {
        match &self.backend {
            Backend::Mem(m) => SinkDir::Mem(m.root_existing(node, st)),
            Backend::Bin(_) => unreachable!("refresh needs a memory sink"),
        }
    }

    pub fn add_stat(
        &self,
        d: &SinkDir,
        th: &SinkThread,
        name: &[u8],
        st: &Stat,
    ) -> Result<()> {
        th.files_seen.fetch_add(1, Ordering::Relaxed);
        th.bytes_seen.fetch_add(st.size, Ordering::Relaxed);
        match &self.backend {
            Backend::Mem(m) => {
                m.add_stat(d.mem(), name, st);
                Ok(())
            }
            Backend::Bin(b) => b.add_stat(d.bin(), th, name, st),
        }
    }

    pub fn add_dir(
        &self,
        d: &SinkDir,
        th: &SinkThread,
        name: &[u8],
        st: &Stat,
    ) -> Result<SinkDir> {
        th.files_seen.fetch_add(1, Ordering::Relaxed);
        th.bytes_seen.fetch_add(st.size, Ordering::Relaxed);
        match &self.backend {
            Backend::Mem(m) => Ok(SinkDir::Mem(m.add_dir(d.mem(), name, st))),
            Backend::Bin(b) => Ok(SinkDir::Bin(b.add_dir(d.bin(), name, st))),
        }
    }

    pub fn add_special(
        &self,
        d: &SinkDir,
        th: &SinkThread,
        name: &[u8],
        kind: SpecialKind,
    ) -> Result<()> {
        th.files_seen.fetch_add(1, Ordering::Relaxed);
        match &self.backend {
            Backend::Mem(m) => {
                m.add_special(d.mem(), name, kind);
                Ok(())
            }
            Backend::Bin(b) => b.add_special(d.bin(), th, name, kind),
        }
    }

    pub fn set_read_error(&self, d: &SinkDir) {
        match &self.backend {
            Backend::Mem(m) => m.set_read_error(d.mem()),
            Backend::Bin(b) => b.set_read_error(d.bin()),
        }
    }

    /// Releases one reference; the last release finalizes the
    /// directory and cascades a release up to its parent.
    pub fn unref(&self, d: SinkDir, th: &SinkThread) -> Result<()> {
        let mut cur = d;
        loop {
            let parent = match (&self.backend, cur) {
                (Backend::Mem(m), SinkDir::Mem(d)) => {
                    m.unref(d).map(SinkDir::Mem)
                }
                (Backend::Bin(b), SinkDir::Bin(d)) => {
                    b.unref(d, th)?.map(SinkDir::Bin)
                }
                _ => unreachable!("handle does not belong to this sink"),
            };
            match parent {
                Some(p) => cur = p,
                None => return Ok(()),
            }
        }
    }

    /// Publishes the directory a worker is currently reading, for
    /// the progress reporter.
    pub fn set_current(&self, th: &SinkThread, path: &[u8]) {
        let mut cur = th.current.lock().expect("current dir lock");
        cur.clear();
        cur.extend_from_slice(path);
    }

    /// Remembers the most recent error path.  Single slot, no queue;
    /// the reporter is allowed to lag.
    pub fn report_error(&self, path: Vec<u8>) {
        *self.last_error.lock().expect("last error lock") = Some(path);
    }

    pub fn last_error(&self) -> Option<Vec<u8>> {
        self.last_error.lock().expect("last error lock").clone()
    }

    /// Completes the output: commits hardlink aggregates for the
    /// memory backend, or flushes buffers and writes the index block
    /// for the binary backend.
    pub fn finalize(&self, threads: &[SinkThread]) -> Result<()> {
        match &self.backend {
            Backend::Mem(m) => {
                m.commit_links();
                Ok(())
            }
            Backend::Bin(b) => b.finalize(threads),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_clamps_block_counts() {
        let mut st: nix::sys::stat::FileStat = unsafe { std::mem::zeroed() };
        st.st_mode = libc::S_IFREG;
        st.st_blocks = i64::MAX;
        st.st_size = -1;
        st.st_nlink = 1;
        let stat = Stat::from_file_stat(&st);
        assert_eq!(stat.blocks, MAX_BLOCKS);
        assert_eq!(stat.size, 0);
        assert!(stat.regular && !stat.dir);
        assert!(!stat.is_link());
    }

    #[test]
    fn link_detection() {
        let link = Stat { nlink: 2, ..Stat::default() };
        assert!(link.is_link());
        let imported = Stat { hardlink: true, ..Stat::default() };
        assert!(imported.is_link());
        let dir = Stat { dir: true, nlink: 5, ..Stat::default() };
        assert!(!dir.is_link());
    }
}
