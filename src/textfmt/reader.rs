// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming import of the textual format.
//!
//! A hand-rolled parser: the format needs byte-string names (a
//! `\u00XX` escape is a single byte, not a code point), tolerates
//! unknown keys, and reports errors with line and column, none of
//! which a generic JSON reader gives us.  Input arrives through any
//! `Read`; the caller is expected to hand in something buffered.

use crate::entry::{Ext, SpecialKind};
use crate::result::{Error, Result};
use crate::sink::{Sink, SinkDir, SinkThread, Stat};
use std::io::Read;

struct JsonReader<R> {
    src: R,
    peeked: Option<u8>,
    line: u64,
    col: u64,
}

#[derive(Default)]
struct Attrs {
    name: Option<Vec<u8>>,
    asize: u64,
    dsize: u64,
    dev: Option<u64>,
    ino: Option<u64>,
    hlnkc: bool,
    nlink: u64,
    notreg: bool,
    read_error: bool,
    excluded: Option<SpecialKind>,
    uid: Option<u64>,
    gid: Option<u64>,
    mode: Option<u64>,
    mtime: Option<u64>,
}

impl Attrs {
    fn ext(&self) -> Ext {
        Ext {
            mtime: self.mtime,
            uid: self.uid.map(|v| v as u32),
            gid: self.gid.map(|v| v as u32),
            mode: self.mode.map(|v| v as u32),
        }
    }

    fn dir_stat(&self, parent_dev: u64) -> Stat {
        Stat {
            dir: true,
            blocks: self.dsize / 512,
            size: self.asize,
            dev: self.dev.unwrap_or(parent_dev),
            nlink: 1,
            ext: self.ext(),
            ..Stat::default()
        }
    }

    fn file_stat(&self, dev: u64) -> Stat {
        Stat {
            dir: false,
            regular: !self.notreg,
            blocks: self.dsize / 512,
            size: self.asize,
            dev,
            ino: self.ino.unwrap_or(0),
            nlink: self.nlink as u32,
            hardlink: self.hlnkc,
            ext: self.ext(),
            ..Stat::default()
        }
    }
}

impl<R: Read> JsonReader<R> {
    fn new(src: R) -> JsonReader<R> {
        JsonReader { src, peeked: None, line: 1, col: 0 }
    }

    fn err(&self, msg: &'static str) -> Error {
        Error::Json { line: self.line, col: self.col, msg }
    }

    fn next(&mut self) -> Result<Option<u8>> {
        if let Some(b) = self.peeked.take() {
            return Ok(Some(b));
        }
        let mut buf = [0u8; 1];
        loop {
            match self.src.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        if buf[0] == b'\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Ok(Some(buf[0]))
    }

    fn must_next(&mut self) -> Result<u8> {
        self.next()?.ok_or_else(|| self.err("unexpected end of input"))
    }

    fn peek(&mut self) -> Result<Option<u8>> {
        if self.peeked.is_none() {
            self.peeked = self.next()?;
        }
        Ok(self.peeked)
    }

    fn skip_ws(&mut self) -> Result<()> {
        while let Some(b) = self.peek()? {
            if !matches!(b, b' ' | b'\t' | b'\r' | b'\n') {
                break;
            }
            self.next()?;
        }
        Ok(())
    }

    fn expect(&mut self, want: u8, msg: &'static str) -> Result<()> {
        self.skip_ws()?;
        if self.must_next()? != want {
            return Err(self.err(msg));
        }
        Ok(())
    }

    fn expect_keyword(&mut self, kw: &[u8]) -> Result<()> {
        for &want in kw {
            if self.must_next()? != want {
                return Err(self.err("bad keyword"));
            }
        }
        Ok(())
    }

    fn parse_bool(&mut self) -> Result<bool> {
        self.skip_ws()?;
        match self.peek()? {
            Some(b't') => {
                self.expect_keyword(b"true")?;
                Ok(true)
            }
            Some(b'f') => {
                self.expect_keyword(b"false")?;
                Ok(false)
            }
            _ => Err(self.err("expected a boolean")),
        }
    }

    /// Parses a number, clamping negatives to zero and truncating
    /// any fraction or exponent.
    fn parse_u64(&mut self) -> Result<u64> {
        self.skip_ws()?;
        let negative = self.peek()? == Some(b'-');
        if negative {
            self.next()?;
        }
        let mut value = 0u64;
        let mut digits = 0;
        while let Some(b @ b'0'..=b'9') = self.peek()? {
            self.next()?;
            value = value.saturating_mul(10).saturating_add((b - b'0') as u64);
            digits += 1;
        }
        if digits == 0 {
            return Err(self.err("expected a number"));
        }
        if matches!(self.peek()?, Some(b'.' | b'e' | b'E')) {
            while let Some(b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'-') =
                self.peek()?
            {
                self.next()?;
            }
        }
        Ok(if negative { 0 } else { value })
    }

    fn hex4(&mut self) -> Result<u32> {
        let mut v = 0u32;
        for _ in 0..4 {
            let b = self.must_next()?;
            let d = match b {
                b'0'..=b'9' => b - b'0',
                b'a'..=b'f' => b - b'a' + 10,
                b'A'..=b'F' => b - b'A' + 10,
                _ => return Err(self.err("bad \\u escape")),
            };
            v = v << 4 | d as u32;
        }
        Ok(v)
    }

    /// Parses a string as raw bytes.  `\u00XX` is a single byte;
    /// higher escapes become UTF-8, with surrogate pairs combined.
    fn parse_string(&mut self) -> Result<Vec<u8>> {
        self.expect(b'"', "expected a string")?;
        let mut out = Vec::new();
        loop {
            let b = self.must_next()?;
            match b {
                b'"' => return Ok(out),
                b'\\' => match self.must_next()? {
                    b'"' => out.push(b'"'),
                    b'\\' => out.push(b'\\'),
                    b'/' => out.push(b'/'),
                    b'b' => out.push(0x08),
                    b'f' => out.push(0x0c),
                    b'n' => out.push(b'\n'),
                    b'r' => out.push(b'\r'),
                    b't' => out.push(b'\t'),
                    b'u' => {
                        let code = self.hex4()?;
                        self.push_escape(&mut out, code)?;
                    }
                    _ => return Err(self.err("bad escape")),
                },
                0x00..=0x1f => {
                    return Err(self.err("raw control byte in string"));
                }
                _ => out.push(b),
            }
        }
    }

    fn push_escape(&mut self, out: &mut Vec<u8>, code: u32) -> Result<()> {
        if code < 0x100 {
            // Byte-valued escapes carry raw name bytes.
            out.push(code as u8);
            return Ok(());
        }
        let c = if (0xd800..0xdc00).contains(&code) {
            // A high surrogate must be followed by a low one.
            if self.must_next()? != b'\\' || self.must_next()? != b'u' {
                return Err(self.err("lone surrogate"));
            }
            let low = self.hex4()?;
            if !(0xdc00..0xe000).contains(&low) {
                return Err(self.err("lone surrogate"));
            }
            let v = 0x10000 + ((code - 0xd800) << 10) + (low - 0xdc00);
            char::from_u32(v).ok_or_else(|| self.err("bad code point"))?
        } else {
            char::from_u32(code).ok_or_else(|| self.err("bad code point"))?
        };
        let mut buf = [0u8; 4];
        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        Ok(())
    }

    /// Skips any JSON value.
    fn skip_value(&mut self, depth: u32) -> Result<()> {
        if depth > 64 {
            return Err(self.err("value nested too deeply"));
        }
        self.skip_ws()?;
        match self.peek()? {
            Some(b'"') => {
                self.parse_string()?;
            }
            Some(b'{') => {
                self.next()?;
                self.skip_ws()?;
                if self.peek()? == Some(b'}') {
                    self.next()?;
                    return Ok(());
                }
                loop {
                    self.parse_string()?;
                    self.expect(b':', "expected ':'")?;
                    self.skip_value(depth + 1)?;
                    self.skip_ws()?;
                    match self.must_next()? {
                        b',' => self.skip_ws()?,
                        b'}' => break,
                        _ => return Err(self.err("expected ',' or '}'")),
                    }
                }
            }
            Some(b'[') => {
                self.next()?;
                self.skip_ws()?;
                if self.peek()? == Some(b']') {
                    self.next()?;
                    return Ok(());
                }
                loop {
                    self.skip_value(depth + 1)?;
                    self.skip_ws()?;
                    match self.must_next()? {
                        b',' => {}
                        b']' => break,
                        _ => return Err(self.err("expected ',' or ']'")),
                    }
                }
            }
            Some(b't') | Some(b'f') => {
                self.parse_bool()?;
            }
            Some(b'n') => {
                self.expect_keyword(b"null")?;
            }
            Some(b'-' | b'0'..=b'9') => {
                self.parse_u64()?;
            }
            _ => return Err(self.err("expected a value")),
        }
        Ok(())
    }

    /// Parses one attribute object.  Unknown keys are skipped.
    fn parse_attrs(&mut self) -> Result<Attrs> {
        self.expect(b'{', "expected an attribute object")?;
        let mut a = Attrs::default();
        self.skip_ws()?;
        if self.peek()? == Some(b'}') {
            self.next()?;
            return Ok(a);
        }
        loop {
            self.skip_ws()?;
            let key = self.parse_string()?;
            self.expect(b':', "expected ':'")?;
            match key.as_slice() {
                b"name" => a.name = Some(self.parse_string()?),
                b"asize" => a.asize = self.parse_u64()?,
                b"dsize" => a.dsize = self.parse_u64()?,
                b"dev" => a.dev = Some(self.parse_u64()?),
                b"ino" => a.ino = Some(self.parse_u64()?),
                b"nlink" => a.nlink = self.parse_u64()?,
                b"uid" => a.uid = Some(self.parse_u64()?),
                b"gid" => a.gid = Some(self.parse_u64()?),
                b"mode" => a.mode = Some(self.parse_u64()?),
                b"mtime" => a.mtime = Some(self.parse_u64()?),
                b"hlnkc" => a.hlnkc = self.parse_bool()?,
                b"notreg" => a.notreg = self.parse_bool()?,
                b"read_error" => a.read_error = self.parse_bool()?,
                b"excluded" => {
                    let v = self.parse_string()?;
                    a.excluded = Some(match v.as_slice() {
                        b"otherfs" | b"frmlnk" => SpecialKind::OtherFs,
                        b"kernfs" => SpecialKind::Kernfs,
                        _ => SpecialKind::Pattern,
                    });
                }
                _ => self.skip_value(0)?,
            }
            self.skip_ws()?;
            match self.must_next()? {
                b',' => {}
                b'}' => break,
                _ => return Err(self.err("expected ',' or '}'")),
            }
        }
        Ok(a)
    }
}

/// A child entry's name: non-empty, no `/`, no NUL.  Only the root
/// may name a whole path.
fn child_name<R: Read>(
    p: &JsonReader<R>,
    attrs: &Attrs,
) -> Result<Vec<u8>> {
    match &attrs.name {
        Some(name)
            if !name.is_empty()
                && !name.iter().any(|&b| b == b'/' || b == 0) =>
        {
            Ok(name.clone())
        }
        Some(_) => Err(p.err("invalid entry name")),
        None => Err(p.err("entry without a name")),
    }
}

/// Streams a textual export into a sink.
pub fn import<R: Read>(src: R, sink: &Sink, th: &SinkThread) -> Result<()> {
    let mut p = JsonReader::new(src);
    p.expect(b'[', "expected the top-level array")?;
    if p.parse_u64()? != 1 {
        return Err(p.err("unsupported format version"));
    }
    p.expect(b',', "expected ','")?;
    p.parse_u64()?;
    p.expect(b',', "expected ','")?;
    p.skip_value(0)?;
    p.expect(b',', "expected ','")?;
    p.expect(b'[', "the root element must be a directory")?;
    let attrs = p.parse_attrs()?;
    let name = match &attrs.name {
        Some(name) if !name.is_empty() => name.clone(),
        _ => return Err(p.err("entry without a name")),
    };
    let dev = attrs.dev.unwrap_or(0);
    let st = attrs.dir_stat(dev);
    let root = sink.create_root(&name, &st);
    if attrs.read_error {
        sink.set_read_error(&root);
    }
    let mut stack: Vec<(SinkDir, u64)> = vec![(root, st.dev)];
    while let Some((dir, dev)) = stack.last().map(|(d, v)| (d.clone(), *v)) {
        p.skip_ws()?;
        match p.must_next()? {
            b']' => {
                let (dir, _) = stack.pop().expect("import stack");
                sink.unref(dir, th)?;
            }
            b',' => {
                p.skip_ws()?;
                match p.peek()? {
                    Some(b'[') => {
                        p.next()?;
                        let attrs = p.parse_attrs()?;
                        let name = child_name(&p, &attrs)?;
                        let st = attrs.dir_stat(dev);
                        let child = sink.add_dir(&dir, th, &name, &st)?;
                        if attrs.read_error {
                            sink.set_read_error(&child);
                        }
                        stack.push((child, st.dev));
                    }
                    Some(b'{') => {
                        let attrs = p.parse_attrs()?;
                        let name = child_name(&p, &attrs)?;
                        if let Some(kind) = attrs.excluded {
                            sink.add_special(&dir, th, &name, kind)?;
                        } else if attrs.read_error {
                            sink.add_special(
                                &dir,
                                th,
                                &name,
                                SpecialKind::Err,
                            )?;
                        } else {
                            sink.add_stat(
                                &dir,
                                th,
                                &name,
                                &attrs.file_stat(dev),
                            )?;
                        }
                    }
                    _ => return Err(p.err("expected an element")),
                }
            }
            _ => return Err(p.err("expected ',' or ']'")),
        }
    }
    p.expect(b']', "expected the end of the top-level array")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::NodeKind;
    use crate::mem;
    use crate::textfmt::writer;

    fn import_mem(json: &[u8]) -> Result<Sink> {
        let sink = Sink::memory(true);
        let threads = sink.create_threads(1);
        import(json, &sink, &threads[0])?;
        sink.finalize(&threads)?;
        Ok(sink)
    }

    const SAMPLE: &[u8] = br#"[1,2,{"progname":"duv","progver":"0.1.0","timestamp":1700000000},
[{"name":"/r","asize":100,"dsize":512,"dev":40},
{"name":"plain","asize":100,"dsize":512,"mtime":1700000001},
{"name":"linked","asize":1000,"dsize":1024,"ino":7,"hlnkc":true,"nlink":2},
{"name":"sock","asize":0,"dsize":0,"notreg":true},
{"name":"gone","read_error":true},
{"name":"skipped","excluded":"pattern","future_key":[1,{"x":null}]},
[{"name":"sub","asize":0,"dsize":512},
{"name":"inner","asize":50,"dsize":512}]]]"#;

    #[test]
    fn sample_import() {
        let sink = import_mem(SAMPLE).unwrap();
        let m = sink.mem().unwrap();
        let tree = m.tree.lock().unwrap();
        let root = tree.root.unwrap();
        assert_eq!(&*tree[root].name, b"/r".as_slice());
        let ent = tree[root].dir().unwrap();
        assert_eq!(ent.items, 7);
        // plain 100 + linked 1000 + inner 50 + own 100 + sub 0.
        assert_eq!(ent.cum_size, 1250);
        // The link declares nlink 2 and only one shows up.
        assert_eq!(ent.shared_size, 1000);
        assert!(ent.suberr);
        let names: Vec<_> = tree
            .children(root)
            .map(|c| tree[c].name.clone())
            .collect();
        assert_eq!(names.len(), 6);
        let gone = tree
            .children(root)
            .find(|&c| &*tree[c].name == b"gone".as_slice())
            .unwrap();
        assert!(matches!(
            tree[gone].kind,
            NodeKind::Special(SpecialKind::Err)
        ));
    }

    #[test]
    fn version_and_errors_have_positions() {
        assert!(matches!(
            import_mem(b"[2,2,{},[{\"name\":\"/\"}]]"),
            Err(Error::Json { line: 1, .. })
        ));
        let bad = b"[1,2,{},\n[{\"name\":\"/r\"},\nnope]]";
        match import_mem(bad) {
            Err(Error::Json { line, msg, .. }) => {
                assert_eq!(line, 3);
                assert_eq!(msg, "expected an element");
            }
            other => panic!("want a json error, got {other:?}"),
        }
    }

    #[test]
    fn name_bytes_roundtrip() {
        let sink = Sink::memory(false);
        let threads = sink.create_threads(1);
        let th = &threads[0];
        let root = sink.create_root(
            b"/r",
            &Stat { dir: true, size: 10, dev: 1, ..Stat::default() },
        );
        let weird: &[&[u8]] =
            &[b"\xff\xfe", b"ok\xc3(name", "unicod\u{e9}".as_bytes(), b"a\tb"];
        for name in weird {
            sink.add_stat(
                &root,
                th,
                name,
                &Stat { regular: true, size: 1, dev: 1, ..Stat::default() },
            )
            .unwrap();
        }
        sink.unref(root, th).unwrap();
        sink.finalize(&threads).unwrap();
        let mut json = Vec::new();
        {
            let tree = sink.mem().unwrap().tree.lock().unwrap();
            writer::export(&tree, &mut json, false).unwrap();
        }
        let back = import_mem(&json).unwrap();
        let tree = back.mem().unwrap().tree.lock().unwrap();
        let root = tree.root.unwrap();
        let mut names: Vec<_> =
            tree.children(root).map(|c| tree[c].name.clone()).collect();
        names.sort();
        let mut want: Vec<Box<[u8]>> =
            weird.iter().map(|&n| n.into()).collect();
        want.sort();
        assert_eq!(names, want);
        mem::assert_additive(&tree);
    }

    #[test]
    fn export_import_export_is_stable() {
        let first = import_mem(SAMPLE).unwrap();
        let mut one = Vec::new();
        {
            let tree = first.mem().unwrap().tree.lock().unwrap();
            writer::export(&tree, &mut one, true).unwrap();
        }
        let second = import_mem(&one).unwrap();
        let mut two = Vec::new();
        {
            let tree = second.mem().unwrap().tree.lock().unwrap();
            writer::export(&tree, &mut two, true).unwrap();
        }
        // Strip the metadata objects; their timestamps differ.
        let cut = |v: &[u8]| {
            let at = v.windows(2).position(|w| w == b"},").unwrap();
            v[at..].to_vec()
        };
        assert_eq!(cut(&one), cut(&two));
    }
}
