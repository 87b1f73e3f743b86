// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command line surface and run-mode dispatch.
//!
//! One invocation either scans a directory or imports a previous
//! export, lands the result in a memory tree or streams it straight
//! into a binary export, and then optionally re-exports.  With no
//! export target the result is shown as a listing on stdout.

use crate::binfmt::{self, writer::BinSink};
use crate::exclude::Patterns;
use crate::list;
use crate::mem;
use crate::progress;
use crate::result::Result;
use crate::scan::{self, ScanFlags};
use crate::sink::{Sink, SinkThread};
use crate::textfmt;
use clap::Parser;
use log::{debug, warn};
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Leading bytes of a zstd frame, for import auto-detection.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

#[derive(Parser)]
#[command(
    name = "duv",
    version,
    about = "Disk usage viewer: scan, aggregate, export, import"
)]
pub struct Cli {
    /// Directory to scan.
    #[arg(value_name = "DIR", conflicts_with = "import")]
    dir: Option<PathBuf>,

    /// Import a previously exported scan; '-' reads stdin.
    #[arg(short = 'f', value_name = "FILE")]
    import: Option<PathBuf>,

    /// Export the result in the textual format; '-' writes stdout.
    #[arg(short = 'o', value_name = "FILE")]
    export_text: Option<PathBuf>,

    /// Export the result in the binary format; '-' writes stdout.
    #[arg(short = 'O', value_name = "FILE")]
    export_bin: Option<PathBuf>,

    /// Record extended information: owner, group, mode, mtime.
    #[arg(short = 'e')]
    extended: bool,

    /// Stay on the filesystem of the scanned directory.
    #[arg(short = 'x')]
    same_fs: bool,

    /// Follow symlinks to non-directories.
    #[arg(short = 'L')]
    follow_symlinks: bool,

    /// Exclude entries matching PATTERN; may be repeated.
    #[arg(long = "exclude", value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Read exclude patterns from FILE, one per line.
    #[arg(short = 'X', long = "exclude-from", value_name = "FILE")]
    exclude_from: Vec<PathBuf>,

    /// Exclude directories tagged with a CACHEDIR.TAG file.
    #[arg(long)]
    exclude_caches: bool,

    /// Exclude Linux pseudo filesystems such as /proc and /sys.
    #[arg(long)]
    exclude_kernfs: bool,

    /// Number of scanner threads.
    #[arg(short = 't', long = "threads", value_name = "N")]
    threads: Option<usize>,

    /// Compress the textual export with zstd.
    #[arg(short = 'c')]
    compress: bool,

    /// zstd compression level for exports.
    #[arg(
        long,
        value_name = "N",
        default_value_t = 3,
        value_parser = clap::value_parser!(i32).range(1..=20)
    )]
    compress_level: i32,

    /// Uncompressed block size of the binary export, in KiB.
    #[arg(
        long,
        value_name = "KIB",
        default_value_t = (binfmt::writer::DEFAULT_BLOCK_SIZE / 1024) as u32,
        value_parser = clap::value_parser!(u32).range(4..=16000)
    )]
    export_block_size: u32,
}

impl Cli {
    fn scan_flags(&self) -> ScanFlags {
        let mut flags = ScanFlags::empty();
        flags.set(ScanFlags::SAME_FS, self.same_fs);
        flags.set(ScanFlags::FOLLOW_SYMLINKS, self.follow_symlinks);
        flags.set(ScanFlags::EXCLUDE_CACHES, self.exclude_caches);
        flags.set(ScanFlags::EXCLUDE_KERNFS, self.exclude_kernfs);
        flags
    }

    fn patterns(&self) -> Result<Patterns> {
        let mut sources = self.exclude.clone();
        for path in &self.exclude_from {
            let text = std::fs::read_to_string(path)?;
            sources.extend(text.lines().map(str::to_owned));
        }
        Patterns::parse(&sources)
    }

    fn block_size(&self) -> usize {
        self.export_block_size as usize * 1024
    }
}

fn is_dash(path: &Path) -> bool {
    path.as_os_str() == "-"
}

fn open_out(path: &Path) -> Result<Box<dyn Write + Send>> {
    if is_dash(path) {
        Ok(Box::new(std::io::stdout()))
    } else {
        Ok(Box::new(File::create(path)?))
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let workers = cli.threads.unwrap_or_else(num_cpus::get).max(1);
    // The textual format has no streaming backend; anything but a
    // pure binary export goes through memory.
    let stream_binary =
        cli.export_bin.is_some() && cli.export_text.is_none();
    let sink = if stream_binary {
        let path = cli.export_bin.as_deref().expect("binary export path");
        let writer = BinSink::new(
            open_out(path)?,
            cli.compress_level,
            cli.block_size(),
            cli.extended,
        )?;
        Sink::binary(writer, cli.extended)
    } else {
        Sink::memory(cli.extended)
    };
    match &cli.import {
        Some(src) => {
            let threads = sink.create_threads(1);
            import(src, &sink, &threads[0])?;
            sink.finalize(&threads)?;
        }
        None => {
            let dir = cli.dir.clone().unwrap_or_else(|| PathBuf::from("."));
            let patterns = cli.patterns()?;
            let threads = sink.create_threads(workers);
            let stop = AtomicBool::new(false);
            std::thread::scope(|s| {
                s.spawn(|| progress::run(&threads, &stop));
                let res = scan::scan(
                    dir.as_os_str().as_bytes(),
                    &sink,
                    &threads,
                    patterns,
                    cli.scan_flags(),
                );
                stop.store(true, Ordering::Relaxed);
                res
            })?;
            sink.finalize(&threads)?;
            if let Some(path) = sink.last_error() {
                warn!(
                    "some contents could not be read, last error: {}",
                    String::from_utf8_lossy(&path)
                );
            }
        }
    }
    if let Some(m) = sink.mem() {
        let (done, total) =
            m.links.lock().expect("link map lock").progress();
        debug!("hardlink classes committed: {done}/{total}");
    }
    export(&cli, &sink, stream_binary)
}

/// Imports an export, sniffing the format from its first bytes:
/// the binary signature, a zstd frame around the textual format, or
/// the plain textual format.
fn import(src: &Path, sink: &Sink, th: &SinkThread) -> Result<()> {
    if is_dash(src) {
        let mut data = Vec::new();
        std::io::stdin().lock().read_to_end(&mut data)?;
        if data.starts_with(&binfmt::SIGNATURE) {
            // The container needs random access; stdin was already
            // buffered whole, so serve it from memory.
            let mut rd = binfmt::reader::BinReader::open(Cursor::new(data))?;
            debug!("importing {} blocks from stdin", rd.block_count());
            binfmt::reader::import(&mut rd, sink, th)
        } else if data.starts_with(&ZSTD_MAGIC) {
            let dec = zstd::stream::Decoder::new(Cursor::new(data))?;
            textfmt::reader::import(dec, sink, th)
        } else {
            textfmt::reader::import(Cursor::new(data), sink, th)
        }
    } else {
        let mut file = File::open(src)?;
        let mut head = [0u8; 8];
        let mut have = 0;
        while have < head.len() {
            match file.read(&mut head[have..])? {
                0 => break,
                n => have += n,
            }
        }
        file.seek(SeekFrom::Start(0))?;
        if head[..have] == binfmt::SIGNATURE[..have] && have == 8 {
            let mut rd = binfmt::reader::BinReader::open(file)?;
            debug!("importing {} blocks from {}", rd.block_count(), src.display());
            binfmt::reader::import(&mut rd, sink, th)
        } else if have >= 4 && head[..4] == ZSTD_MAGIC {
            let dec = zstd::stream::Decoder::new(file)?;
            textfmt::reader::import(dec, sink, th)
        } else {
            textfmt::reader::import(BufReader::new(file), sink, th)
        }
    }
}

/// Writes the requested exports, or a listing when there are none.
fn export(cli: &Cli, sink: &Sink, streamed: bool) -> Result<()> {
    if streamed {
        return Ok(());
    }
    let m = sink.mem().expect("memory backend");
    let tree = m.tree.lock().expect("tree lock");
    if let Some(path) = &cli.export_text {
        let out = open_out(path)?;
        if cli.compress {
            let mut enc =
                zstd::stream::Encoder::new(out, cli.compress_level)?;
            textfmt::writer::export(&tree, &mut enc, cli.extended)?;
            enc.finish()?.flush()?;
        } else {
            let mut out = std::io::BufWriter::new(out);
            textfmt::writer::export(&tree, &mut out, cli.extended)?;
        }
    }
    if let Some(path) = &cli.export_bin {
        let writer = BinSink::new(
            open_out(path)?,
            cli.compress_level,
            cli.block_size(),
            cli.extended,
        )?;
        let bsink = Sink::binary(writer, cli.extended);
        let threads = bsink.create_threads(1);
        mem::replay(&tree, &bsink, &threads[0])?;
        bsink.finalize(&threads)?;
    }
    if cli.export_text.is_none() && cli.export_bin.is_none() {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        list::report(&tree, &mut out)?;
    }
    Ok(())
}
