// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Various errors.
///
/// Transient per-entry scan failures never show up here; they are
/// recorded in the tree as read-error bits and special entries.
/// Everything below is fatal and unwinds to `main`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Sys(#[from] nix::Error),
    #[error("not a directory: {}", String::from_utf8_lossy(.0))]
    NotADirectory(Vec<u8>),
    #[error("cannot scan {}: {err}", String::from_utf8_lossy(.path))]
    Root { path: Vec<u8>, err: nix::Error },
    #[error("bad exclude pattern {0:?}: {1}")]
    BadPattern(String, glob::PatternError),
    #[error("not a duv export (bad signature)")]
    BadSignature,
    #[error("corrupt export: {reason} (last item {last_ref:#x})")]
    Corrupt { reason: &'static str, last_ref: u64 },
    #[error("export too large (file offset exceeds 2^40)")]
    ExportTooLarge,
    #[error("invalid import at line {line}, column {col}: {msg}")]
    Json { line: u64, col: u64, msg: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
