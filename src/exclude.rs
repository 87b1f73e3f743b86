// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exclusion patterns.
//!
//! A pattern is a sequence of `/`-separated glob components.  A
//! single-component pattern is unanchored: it applies to entries of
//! that name at every level of the scan.  A multi-component pattern
//! (or one with a leading `/`) is anchored at the scan root and
//! advances one component per directory descent.  A trailing `/`
//! restricts the exclusion to non-directories, so a directory whose
//! name happens to match is still traversed.
//!
//! At every level the anchored and unanchored sets are consulted
//! together and the stricter outcome wins.  Names that are not valid
//! UTF-8 never match; they cannot be spelled in a pattern either.

use crate::result::{Error, Result};
use std::sync::Arc;

/// Outcome of matching a name, in increasing strictness.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Match {
    None,
    /// Exclude if the entry is a non-directory.
    FileOnly,
    /// Exclude either way, without even a stat.
    Both,
}

#[derive(Debug)]
struct Pattern {
    comps: Vec<glob::Pattern>,
    file_only: bool,
}

impl Pattern {
    fn parse(src: &str) -> Result<Pattern> {
        let body = src.strip_prefix('/').unwrap_or(src);
        let (body, file_only) = match body.strip_suffix('/') {
            Some(stripped) => (stripped, true),
            None => (body, false),
        };
        let comps = body
            .split('/')
            .filter(|c| !c.is_empty())
            .map(glob::Pattern::new)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::BadPattern(src.into(), e))?;
        if comps.is_empty() {
            return Err(Error::BadPattern(
                src.into(),
                glob::PatternError { pos: 0, msg: "empty pattern" },
            ));
        }
        Ok(Pattern { comps, file_only })
    }

    fn outcome(&self) -> Match {
        if self.file_only { Match::FileOnly } else { Match::Both }
    }
}

/// The exclusion predicate for one directory level.
#[derive(Clone, Debug, Default)]
pub struct Patterns {
    /// Single-component patterns, live at every level.
    unanchored: Arc<Vec<Pattern>>,
    /// Anchored patterns with the index of the component to match
    /// at this level.
    anchored: Vec<(Arc<Pattern>, usize)>,
}

impl Patterns {
    /// Parses the root-level predicate from pattern strings.
    pub fn parse<S: AsRef<str>>(patterns: &[S]) -> Result<Patterns> {
        let mut unanchored = Vec::new();
        let mut anchored = Vec::new();
        for src in patterns {
            let src = src.as_ref().trim();
            if src.is_empty() || src.starts_with('#') {
                continue;
            }
            let pat = Pattern::parse(src)?;
            if pat.comps.len() == 1 && !src.starts_with('/') {
                unanchored.push(pat);
            } else {
                anchored.push((Arc::new(pat), 0));
            }
        }
        Ok(Patterns { unanchored: Arc::new(unanchored), anchored })
    }

    fn matches(pat: &glob::Pattern, name: &[u8]) -> bool {
        match std::str::from_utf8(name) {
            Ok(s) => pat.matches(s),
            Err(_) => false,
        }
    }

    /// Answers whether `name` is excluded at this level.
    pub fn match_name(&self, name: &[u8]) -> Match {
        let mut m = Match::None;
        for pat in self.unanchored.iter() {
            if Self::matches(&pat.comps[0], name) {
                m = Match::max(m, pat.outcome());
            }
        }
        for (pat, at) in &self.anchored {
            if *at == pat.comps.len() - 1
                && Self::matches(&pat.comps[*at], name)
            {
                m = Match::max(m, pat.outcome());
            }
        }
        m
    }

    /// Returns the predicate for the contents of child directory
    /// `name`: anchored patterns whose next component matches the
    /// child advance by one; the unanchored set carries through.
    pub fn enter(&self, name: &[u8]) -> Patterns {
        let anchored = self
            .anchored
            .iter()
            .filter(|(pat, at)| {
                *at < pat.comps.len() - 1
                    && Self::matches(&pat.comps[*at], name)
            })
            .map(|(pat, at)| (Arc::clone(pat), at + 1))
            .collect();
        Patterns { unanchored: Arc::clone(&self.unanchored), anchored }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pats(src: &[&str]) -> Patterns {
        Patterns::parse(src).expect("patterns parse")
    }

    #[test]
    fn unanchored_everywhere() {
        let p = pats(&["*.o", "core"]);
        assert_eq!(p.match_name(b"foo.o"), Match::Both);
        assert_eq!(p.match_name(b"core"), Match::Both);
        assert_eq!(p.match_name(b"foo.c"), Match::None);
        let sub = p.enter(b"src").enter(b"deep");
        assert_eq!(sub.match_name(b"bar.o"), Match::Both);
    }

    #[test]
    fn file_only_marker() {
        let p = pats(&["cache/"]);
        assert_eq!(p.match_name(b"cache"), Match::FileOnly);
    }

    #[test]
    fn stricter_outcome_wins() {
        let p = pats(&["cache/", "cache"]);
        assert_eq!(p.match_name(b"cache"), Match::Both);
    }

    #[test]
    fn anchored_descent() {
        let p = pats(&["src/tmp/*.log"]);
        assert_eq!(p.match_name(b"src"), Match::None);
        let src = p.enter(b"src");
        assert_eq!(src.match_name(b"tmp"), Match::None);
        let tmp = src.enter(b"tmp");
        assert_eq!(tmp.match_name(b"a.log"), Match::Both);
        assert_eq!(tmp.match_name(b"a.txt"), Match::None);
        // Entering a non-matching directory drops the pattern.
        let other = p.enter(b"lib");
        assert_eq!(other.enter(b"tmp").match_name(b"a.log"), Match::None);
    }

    #[test]
    fn leading_slash_anchors() {
        let p = pats(&["/core"]);
        assert_eq!(p.match_name(b"core"), Match::Both);
        assert_eq!(p.enter(b"sub").match_name(b"core"), Match::None);
    }

    #[test]
    fn non_utf8_names_never_match() {
        let p = pats(&["*"]);
        assert_eq!(p.match_name(b"\xff\xfe"), Match::None);
        assert_eq!(p.match_name(b"x"), Match::Both);
    }

    #[test]
    fn comments_and_blanks_skipped() {
        let p = pats(&["# note", "", "*.tmp"]);
        assert_eq!(p.match_name(b"a.tmp"), Match::Both);
    }
}
