// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The parallel directory scanner.
//!
//! Work is a stack of open directories.  A bounded shared stack
//! spreads subtrees across workers; each worker also keeps a private
//! LIFO so that, once the shared stack is full, it descends
//! depth-first and the number of open file descriptors stays bounded
//! by roughly the tree depth.  The scan is complete when every worker
//! is blocked on an empty shared stack.
//!
//! All filesystem access is fd-relative (`openat`/`fstatat` with
//! `O_NOFOLLOW`), so a scan cannot be led astray by a symlink race.
//! Per-entry failures are recorded in the tree and never abort the
//! scan; only a failure at the root, or a fatal export write error,
//! does.

use crate::entry::{NodeId, SpecialKind};
use crate::exclude::{Match, Patterns};
use crate::result::{Error, Result};
use crate::sink::{Sink, SinkDir, SinkThread, Stat};
use bitflags::bitflags;
use log::debug;
use nix::dir::Dir;
use nix::fcntl::{self, AtFlags, OFlag};
use nix::sys::stat::{self, Mode};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;

bitflags! {
    /// Scan behavior switches.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct ScanFlags: u32 {
        /// Do not cross filesystem boundaries.
        const SAME_FS = 1 << 0;
        /// Follow symlinks to non-directories.
        const FOLLOW_SYMLINKS = 1 << 1;
        /// Skip directories tagged with CACHEDIR.TAG.
        const EXCLUDE_CACHES = 1 << 2;
        /// Skip Linux pseudo-filesystems.
        const EXCLUDE_KERNFS = 1 << 3;
    }
}

/// Capacity of the shared work stack.
const WORK_STACK_CAP: usize = 16;

/// First bytes of a CACHEDIR.TAG file, as specified by the Bazaar
/// cache directory tagging standard.
const CACHEDIR_TAG: &[u8; 43] =
    b"Signature: 8a477f597d28d172789f06886806bc55";

/// `statfs.f_type` magics of Linux pseudo-filesystems.
#[cfg(target_os = "linux")]
const KERNFS_MAGICS: &[i64] = &[
    0x42494e4d,  // binfmtfs
    0xcafe4a11,  // bpf
    0x27e0eb,    // cgroup
    0x63677270,  // cgroup2
    0x64626720,  // debugfs
    0x1cd1,      // devpts
    0x9fa0,      // proc
    0x6165676c,  // pstorefs
    0x73636673,  // securityfs
    0xf97cff8c,  // selinuxfs
    0x62656572,  // sysfs
    0x74726163,  // tracefs
];

/// An open directory waiting to be read.
struct DirWork {
    dir: Dir,
    dev: u64,
    patterns: Patterns,
    handle: SinkDir,
    path: Vec<u8>,
}

struct SharedStack {
    works: Vec<DirWork>,
    waiting: usize,
    done: bool,
}

struct Shared<'a> {
    sink: &'a Sink,
    flags: ScanFlags,
    workers: usize,
    stack: Mutex<SharedStack>,
    cond: Condvar,
    abort: AtomicBool,
    error: Mutex<Option<Error>>,
}

impl Shared<'_> {
    /// Offers a work item to the shared stack; hands it back when
    /// the stack is full.
    fn push(&self, work: DirWork) -> Option<DirWork> {
        let mut st = self.stack.lock().expect("work stack lock");
        if st.works.len() >= WORK_STACK_CAP {
            return Some(work);
        }
        st.works.push(work);
        self.cond.notify_one();
        None
    }

    /// Pops a work item, blocking while the stack is empty.  Returns
    /// None when every worker is blocked here: the scan is over.
    fn pop(&self) -> Option<DirWork> {
        let mut st = self.stack.lock().expect("work stack lock");
        loop {
            if let Some(w) = st.works.pop() {
                return Some(w);
            }
            if st.done {
                return None;
            }
            st.waiting += 1;
            if st.waiting == self.workers {
                st.done = true;
                self.cond.notify_all();
                return None;
            }
            st = self.cond.wait(st).expect("work stack lock");
            st.waiting -= 1;
        }
    }

    /// Records the first fatal error and aborts the scan.
    fn fail(&self, err: Error) {
        self.abort.store(true, Ordering::Relaxed);
        let mut slot = self.error.lock().expect("scan error lock");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn aborting(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }
}

/// Scans `path` into `sink` with one scanner thread per element of
/// `threads`.
pub fn scan(
    path: &[u8],
    sink: &Sink,
    threads: &[SinkThread],
    patterns: Patterns,
    flags: ScanFlags,
) -> Result<()> {
    scan_tree(path, sink, threads, patterns, flags, None)
}

/// As [`scan`], but when `existing` is given the scan merges into
/// that directory of the memory sink's tree instead of creating a
/// fresh root.
pub(crate) fn scan_tree(
    path: &[u8],
    sink: &Sink,
    threads: &[SinkThread],
    patterns: Patterns,
    flags: ScanFlags,
    existing: Option<NodeId>,
) -> Result<()> {
    assert!(!threads.is_empty(), "scan needs at least one worker");
    let root_err = |err| Error::Root { path: path.to_vec(), err };
    let cpath = std::ffi::CString::new(path.to_vec())
        .map_err(|_| Error::Root { path: path.to_vec(), err: nix::Error::EINVAL })?;
    // Follow symlinks at the root only.
    let fst = stat::stat(cpath.as_c_str()).map_err(root_err)?;
    let st = Stat::from_file_stat(&fst);
    if !st.dir {
        return Err(Error::NotADirectory(path.to_vec()));
    }
    let fd = fcntl::open(
        cpath.as_c_str(),
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(root_err)?;
    let dir = Dir::from(fd).map_err(root_err)?;
    let handle = match existing {
        Some(node) => sink.create_root_at(node, &st),
        None => sink.create_root(path, &st),
    };
    let work = DirWork {
        dir,
        dev: st.dev,
        patterns,
        handle,
        path: path.to_vec(),
    };
    let shared = Shared {
        sink,
        flags,
        workers: threads.len().max(1),
        stack: Mutex::new(SharedStack {
            works: vec![work],
            waiting: 0,
            done: false,
        }),
        cond: Condvar::new(),
        abort: AtomicBool::new(false),
        error: Mutex::new(None),
    };
    thread::scope(|s| {
        for th in threads {
            s.spawn(|| worker(&shared, th));
        }
    });
    match shared.error.into_inner().expect("scan error lock") {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn worker(shared: &Shared<'_>, th: &SinkThread) {
    let mut local: Vec<DirWork> = Vec::new();
    loop {
        let work = match local.pop().or_else(|| shared.pop()) {
            Some(w) => w,
            None => break,
        };
        if let Err(err) = process(shared, th, work, &mut local) {
            shared.fail(err);
        }
    }
}

/// Reads one directory, emitting every child to the sink and queuing
/// child directories as new work.
fn process(
    shared: &Shared<'_>,
    th: &SinkThread,
    mut work: DirWork,
    local: &mut Vec<DirWork>,
) -> Result<()> {
    let sink = shared.sink;
    if shared.aborting() {
        return sink.unref(work.handle, th);
    }
    sink.set_current(th, &work.path);
    let dirfd = work.dir.as_raw_fd();
    let mut read_err = false;
    for res in work.dir.iter() {
        let ent = match res {
            Ok(ent) => ent,
            Err(_) => {
                read_err = true;
                break;
            }
        };
        let cname = ent.file_name();
        let name = cname.to_bytes();
        if name == b"." || name == b".." {
            continue;
        }
        if shared.aborting() {
            break;
        }
        // The predicate runs before stat: a full match costs nothing.
        let matched = work.patterns.match_name(name);
        if matched == Match::Both {
            sink.add_special(&work.handle, th, name, SpecialKind::Pattern)?;
            continue;
        }
        let fst =
            match stat::fstatat(dirfd, cname, AtFlags::AT_SYMLINK_NOFOLLOW) {
                Ok(fst) => fst,
                Err(err) => {
                    debug!(
                        "stat failed under {}: {err}",
                        String::from_utf8_lossy(&work.path)
                    );
                    sink.add_special(
                        &work.handle,
                        th,
                        name,
                        SpecialKind::Err,
                    )?;
                    sink.report_error(child_path(&work.path, name));
                    continue;
                }
            };
        let mut st = Stat::from_file_stat(&fst);
        if st.symlink && shared.flags.contains(ScanFlags::FOLLOW_SYMLINKS) {
            // Follow symlinks to non-directories only.  A target on
            // another device cannot take part in hardlink
            // accounting; demote it to a plain file.
            if let Ok(f2) = stat::fstatat(dirfd, cname, AtFlags::empty()) {
                let target = Stat::from_file_stat(&f2);
                if !target.dir {
                    st = target;
                    st.symlink = true;
                    if st.dev != work.dev {
                        st.nlink = 1;
                        st.regular = true;
                    }
                }
            }
        }
        if matched == Match::FileOnly && !st.dir {
            sink.add_special(&work.handle, th, name, SpecialKind::Pattern)?;
            continue;
        }
        if shared.flags.contains(ScanFlags::SAME_FS) && st.dev != work.dev {
            sink.add_special(&work.handle, th, name, SpecialKind::OtherFs)?;
            continue;
        }
        if !st.dir {
            sink.add_stat(&work.handle, th, name, &st)?;
            continue;
        }
        // A directory: open it without following symlinks.  An
        // unreadable one is still recorded, flagged as a read error.
        let fd = match fcntl::openat(
            dirfd,
            cname,
            OFlag::O_RDONLY
                | OFlag::O_DIRECTORY
                | OFlag::O_CLOEXEC
                | OFlag::O_NOFOLLOW,
            Mode::empty(),
        ) {
            Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
            Err(err) => {
                debug!(
                    "open failed under {}: {err}",
                    String::from_utf8_lossy(&work.path)
                );
                let child = sink.add_dir(&work.handle, th, name, &st)?;
                sink.set_read_error(&child);
                sink.report_error(child_path(&work.path, name));
                sink.unref(child, th)?;
                continue;
            }
        };
        #[cfg(target_os = "linux")]
        if shared.flags.contains(ScanFlags::EXCLUDE_KERNFS)
            && st.dev != work.dev
            && is_kernfs(&fd)
        {
            sink.add_special(&work.handle, th, name, SpecialKind::Kernfs)?;
            continue;
        }
        if shared.flags.contains(ScanFlags::EXCLUDE_CACHES)
            && has_cachedir_tag(fd.as_raw_fd())
        {
            sink.add_special(&work.handle, th, name, SpecialKind::Pattern)?;
            continue;
        }
        let child = sink.add_dir(&work.handle, th, name, &st)?;
        let dir = match Dir::from(fd) {
            Ok(dir) => dir,
            Err(_) => {
                sink.set_read_error(&child);
                sink.report_error(child_path(&work.path, name));
                sink.unref(child, th)?;
                continue;
            }
        };
        let child_work = DirWork {
            dir,
            dev: st.dev,
            patterns: work.patterns.enter(name),
            handle: child,
            path: child_path(&work.path, name),
        };
        // Offer subtrees to idle workers while this directory is
        // still being read; keep them for ourselves once the shared
        // stack is full (or when there is nobody to share with).
        let kept = if shared.workers > 1 {
            shared.push(child_work)
        } else {
            Some(child_work)
        };
        if let Some(w) = kept {
            local.push(w);
        }
    }
    if read_err {
        sink.set_read_error(&work.handle);
        sink.report_error(work.path.clone());
    }
    sink.unref(work.handle, th)
}

fn child_path(parent: &[u8], name: &[u8]) -> Vec<u8> {
    let mut path = parent.to_vec();
    if path.last() != Some(&b'/') {
        path.push(b'/');
    }
    path.extend_from_slice(name);
    path
}

#[cfg(target_os = "linux")]
fn is_kernfs(fd: &OwnedFd) -> bool {
    match nix::sys::statfs::fstatfs(fd) {
        Ok(sfs) => {
            KERNFS_MAGICS.contains(&(sfs.filesystem_type().0 as i64))
        }
        Err(_) => false,
    }
}

/// True when the directory contains a valid CACHEDIR.TAG.
fn has_cachedir_tag(dirfd: RawFd) -> bool {
    let fd = match fcntl::openat(
        dirfd,
        "CACHEDIR.TAG",
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    ) {
        Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
        Err(_) => return false,
    };
    let mut buf = [0u8; CACHEDIR_TAG.len()];
    let mut off = 0;
    while off < buf.len() {
        match nix::unistd::read(fd.as_raw_fd(), &mut buf[off..]) {
            Ok(0) | Err(_) => return false,
            Ok(n) => off += n,
        }
    }
    buf == *CACHEDIR_TAG
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{self, assert_additive};
    use std::fs;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    fn scan_mem(root: &Path, flags: ScanFlags, pats: &[&str]) -> Sink {
        let sink = Sink::memory(false);
        let threads = sink.create_threads(2);
        scan(
            root.as_os_str().as_bytes(),
            &sink,
            &threads,
            Patterns::parse(pats).unwrap(),
            flags,
        )
        .unwrap();
        sink.finalize(&threads).unwrap();
        sink
    }

    fn write(path: &Path, len: usize) {
        fs::write(path, vec![0x61u8; len]).unwrap();
    }

    #[test]
    fn three_files_one_dir() {
        let tmp = tempfile::tempdir().unwrap();
        write(&tmp.path().join("a"), 100);
        write(&tmp.path().join("b"), 200);
        write(&tmp.path().join("c"), 300);
        let sink = scan_mem(tmp.path(), ScanFlags::empty(), &[]);
        let tree = sink.mem().unwrap().tree.lock().unwrap();
        let root = tree.root.unwrap();
        let ent = tree[root].dir().unwrap();
        assert_eq!(ent.items, 3);
        assert_eq!(ent.cum_size, tree[root].size() + 600);
        assert_eq!(ent.shared_size, 0);
        assert_eq!(ent.shared_blocks, 0);
        assert!(!ent.err && !ent.suberr);
        assert_additive(&tree);
    }

    #[test]
    fn hardlink_fully_inside() {
        let tmp = tempfile::tempdir().unwrap();
        write(&tmp.path().join("x"), 1000);
        fs::hard_link(tmp.path().join("x"), tmp.path().join("y")).unwrap();
        let sink = scan_mem(tmp.path(), ScanFlags::empty(), &[]);
        let tree = sink.mem().unwrap().tree.lock().unwrap();
        let root = tree.root.unwrap();
        let ent = tree[root].dir().unwrap();
        assert_eq!(ent.items, 2);
        assert_eq!(ent.cum_size, tree[root].size() + 1000);
        assert_eq!(ent.shared_size, 0);
        assert_eq!(ent.shared_blocks, 0);
    }

    #[test]
    fn hardlink_partly_outside() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("r")).unwrap();
        fs::create_dir(tmp.path().join("s")).unwrap();
        write(&tmp.path().join("r/x"), 1000);
        fs::hard_link(tmp.path().join("r/x"), tmp.path().join("s/y"))
            .unwrap();
        let sink = scan_mem(&tmp.path().join("r"), ScanFlags::empty(), &[]);
        let tree = sink.mem().unwrap().tree.lock().unwrap();
        let root = tree.root.unwrap();
        let ent = tree[root].dir().unwrap();
        assert_eq!(ent.cum_size, tree[root].size() + 1000);
        assert_eq!(ent.shared_size, 1000);
        assert!(ent.shared_blocks > 0);
    }

    #[test]
    fn excluded_by_pattern() {
        let tmp = tempfile::tempdir().unwrap();
        write(&tmp.path().join("keep.c"), 50);
        write(&tmp.path().join("drop.o"), 500);
        let sink = scan_mem(tmp.path(), ScanFlags::empty(), &["*.o"]);
        let tree = sink.mem().unwrap().tree.lock().unwrap();
        let root = tree.root.unwrap();
        let ent = tree[root].dir().unwrap();
        assert_eq!(ent.items, 2);
        assert_eq!(ent.cum_size, tree[root].size() + 50);
        let excluded = tree
            .children(root)
            .find(|&c| &*tree[c].name == b"drop.o".as_slice())
            .unwrap();
        assert!(matches!(
            tree[excluded].kind,
            crate::entry::NodeKind::Special(SpecialKind::Pattern)
        ));
    }

    #[test]
    fn unreadable_dir_is_recorded() {
        use std::os::unix::fs::PermissionsExt;
        if nix::unistd::geteuid().is_root() {
            // Permission bits do not apply; nothing to observe.
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let forbidden = tmp.path().join("forbidden");
        fs::create_dir(&forbidden).unwrap();
        fs::set_permissions(&forbidden, fs::Permissions::from_mode(0o000))
            .unwrap();
        let sink = scan_mem(tmp.path(), ScanFlags::empty(), &[]);
        fs::set_permissions(&forbidden, fs::Permissions::from_mode(0o755))
            .unwrap();
        let tree = sink.mem().unwrap().tree.lock().unwrap();
        let root = tree.root.unwrap();
        assert!(tree[root].dir().unwrap().suberr);
        let dir = tree.children(root).next().unwrap();
        assert!(tree[dir].dir().unwrap().err);
        assert!(sink.last_error().is_some());
    }

    #[test]
    fn cachedir_tag_prunes() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = tmp.path().join("cache");
        fs::create_dir(&cache).unwrap();
        let mut tag = CACHEDIR_TAG.to_vec();
        tag.extend_from_slice(b"\n# created by duv tests\n");
        fs::write(cache.join("CACHEDIR.TAG"), tag).unwrap();
        write(&cache.join("big"), 10000);
        let sink = scan_mem(tmp.path(), ScanFlags::EXCLUDE_CACHES, &[]);
        let tree = sink.mem().unwrap().tree.lock().unwrap();
        let root = tree.root.unwrap();
        let ent = tree[root].dir().unwrap();
        assert_eq!(ent.items, 1);
        assert_eq!(ent.cum_size, tree[root].size());
    }

    #[test]
    fn followed_symlink_counts_target() {
        let tmp = tempfile::tempdir().unwrap();
        write(&tmp.path().join("data"), 800);
        std::os::unix::fs::symlink("data", tmp.path().join("alias"))
            .unwrap();
        let plain = scan_mem(tmp.path(), ScanFlags::empty(), &[]);
        let followed =
            scan_mem(tmp.path(), ScanFlags::FOLLOW_SYMLINKS, &[]);
        let pt = plain.mem().unwrap().tree.lock().unwrap();
        let ft = followed.mem().unwrap().tree.lock().unwrap();
        let psize = pt[pt.root.unwrap()].dir().unwrap().cum_size;
        let fsize = ft[ft.root.unwrap()].dir().unwrap().cum_size;
        // Unfollowed, the link contributes its own tiny size;
        // followed, the target is counted a second time.
        assert!(psize < fsize);
        assert_eq!(fsize, ft[ft.root.unwrap()].size() + 1600);
    }

    #[test]
    fn refresh_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        write(&tmp.path().join("a"), 123);
        write(&tmp.path().join("sub/b"), 456);
        write(&tmp.path().join("x"), 1000);
        fs::hard_link(tmp.path().join("x"), tmp.path().join("sub/y"))
            .unwrap();
        let sink = scan_mem(tmp.path(), ScanFlags::empty(), &[]);
        let threads = sink.create_threads(2);
        let (root, before) = {
            let tree = sink.mem().unwrap().tree.lock().unwrap();
            let root = tree.root.unwrap();
            let e = tree[root].dir().unwrap();
            (
                root,
                (e.cum_blocks, e.cum_size, e.shared_size, e.items),
            )
        };
        mem::refresh(
            &sink,
            &threads,
            root,
            Patterns::parse::<&str>(&[]).unwrap(),
            ScanFlags::empty(),
        )
        .unwrap();
        let tree = sink.mem().unwrap().tree.lock().unwrap();
        let e = tree[root].dir().unwrap();
        assert_eq!(
            (e.cum_blocks, e.cum_size, e.shared_size, e.items),
            before
        );
        assert_additive(&tree);
    }
}
