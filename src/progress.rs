// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scan progress on stderr.
//!
//! A sampler loop over the per-worker counters of the sink threads.
//! It writes nothing unless stderr is a terminal, so redirected runs
//! and `-o -` pipelines stay clean.

use crate::sink::SinkThread;
use humansize::{BINARY, format_size};
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const SAMPLE_EVERY: Duration = Duration::from_millis(100);

/// Runs until `stop` is set; meant for a scoped thread alongside the
/// scan.
pub fn run(threads: &[SinkThread], stop: &AtomicBool) {
    if !std::io::stderr().is_terminal() {
        return;
    }
    let mut drawn = false;
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(SAMPLE_EVERY);
        let mut files: u64 = 0;
        let mut bytes: u64 = 0;
        let mut current = Vec::new();
        for th in threads {
            files += th.files_seen.load(Ordering::Relaxed) as u64;
            bytes += th.bytes_seen.load(Ordering::Relaxed);
            if current.is_empty() {
                current = th.current_dir();
            }
        }
        let mut dir = String::from_utf8_lossy(&current).into_owned();
        if dir.len() > 48 {
            let tail: String = dir
                .chars()
                .rev()
                .take(45)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            dir = format!("...{tail}");
        }
        eprint!(
            "\r\x1b[K{files} items, {} read  {dir}",
            format_size(bytes, BINARY),
        );
        drawn = true;
    }
    if drawn {
        eprint!("\r\x1b[K");
    }
}
