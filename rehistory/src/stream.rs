//! Parser for the fast-export stream. The parser is the driver of
//! the whole run: it keeps a one-line lookahead, builds an element
//! per object it encounters and hands each one to the rewrite
//! engine, which decides what (if anything) reaches the importer.

use std::collections::HashMap;
use std::io::{self, BufRead};

use crate::elements::{
    Blob, Commit, DumpState, FileChange, Identity, ParentRef, Progress, Reset, Tag,
};
use crate::engine::{CommitAux, Rewriter};
use crate::pathquoting;

fn parse_error(what: &str, line: &[u8]) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{what}: {:?}", String::from_utf8_lossy(line)),
    )
}

/// Outcome of parsing one file-change line. A change referencing a
/// blob that was stripped out of the stream is recognized but
/// dropped.
enum ParsedChange {
    Keep(FileChange),
    Dropped,
}

#[derive(Default)]
pub struct FastExportParser {
    current: Vec<u8>,
    // Last commit seen per branch, for the importer's implicit-parent
    // rule; a reset without a from line clears the entry.
    latest_commit: HashMap<Vec<u8>, ParentRef>,
    latest_orig_commit: HashMap<Vec<u8>, ParentRef>,
}

impl FastExportParser {
    pub fn new() -> Self {
        FastExportParser::default()
    }

    pub fn run(&mut self, input: &mut dyn BufRead, engine: &mut Rewriter) -> io::Result<()> {
        self.advance(input)?;
        while !self.current.is_empty() {
            if self.current.starts_with(b"blob") {
                self.parse_blob(input, engine)?;
            } else if self.current.starts_with(b"reset") {
                self.parse_reset(input, engine)?;
            } else if self.current.starts_with(b"commit") {
                self.parse_commit(input, engine)?;
            } else if self.current.starts_with(b"tag") {
                self.parse_tag(input, engine)?;
            } else if self.current.starts_with(b"progress") {
                self.parse_progress(input, engine)?;
            } else if self.current.starts_with(b"checkpoint") {
                self.parse_checkpoint(input)?;
            } else if self.current.starts_with(b"feature")
                || self.current.starts_with(b"option")
                || self.current.starts_with(b"#")
            {
                engine.emit_literal(&self.current)?;
                self.advance(input)?;
            } else if self.current.starts_with(b"done") {
                engine.process_done()?;
                return Ok(());
            } else if self.current.starts_with(b"get-mark")
                || self.current.starts_with(b"cat-blob")
                || self.current.starts_with(b"ls")
            {
                return Err(parse_error("unsupported command", &self.current));
            } else {
                return Err(parse_error("could not parse line", &self.current));
            }
        }
        Ok(())
    }

    fn advance(&mut self, input: &mut dyn BufRead) -> io::Result<()> {
        self.current.clear();
        input.read_until(b'\n', &mut self.current)?;
        Ok(())
    }

    fn skip_blank(&mut self, input: &mut dyn BufRead) -> io::Result<()> {
        if self.current == b"\n" {
            self.advance(input)?;
        }
        Ok(())
    }

    /// Parse `<kind> <rest>\n`, e.g. the ref from a commit header.
    fn parse_ref_line(&mut self, input: &mut dyn BufRead, kind: &[u8]) -> io::Result<Vec<u8>> {
        let rest = self
            .current
            .strip_prefix(kind)
            .and_then(|r| r.strip_prefix(b" "))
            .and_then(|r| r.strip_suffix(b"\n"))
            .ok_or_else(|| {
                parse_error(
                    &format!("malformed {} line", String::from_utf8_lossy(kind)),
                    &self.current,
                )
            })?
            .to_vec();
        self.advance(input)?;
        Ok(rest)
    }

    fn parse_optional_mark(&mut self, input: &mut dyn BufRead) -> io::Result<Option<u32>> {
        let Some(rest) = self.current.strip_prefix(b"mark :") else {
            return Ok(None);
        };
        let mark = parse_u32(rest).ok_or_else(|| parse_error("malformed mark line", &self.current))?;
        self.advance(input)?;
        Ok(Some(mark))
    }

    fn parse_optional_original_id(&mut self, input: &mut dyn BufRead) -> io::Result<Option<Vec<u8>>> {
        let Some(rest) = self.current.strip_prefix(b"original-oid ") else {
            return Ok(None);
        };
        let id = rest
            .strip_suffix(b"\n")
            .unwrap_or(rest)
            .to_ascii_lowercase();
        self.advance(input)?;
        Ok(Some(id))
    }

    /// Parse a `from`/`merge` line if present. Returns the reference
    /// as written (input mark numbering) plus its translation through
    /// the mark table; a pruned parent translates to None.
    fn parse_optional_parent_ref(
        &mut self,
        input: &mut dyn BufRead,
        kind: &[u8],
        engine: &Rewriter,
    ) -> io::Result<Option<(ParentRef, Option<ParentRef>)>> {
        let Some(rest) = self
            .current
            .strip_prefix(kind)
            .and_then(|r| r.strip_prefix(b" "))
        else {
            return Ok(None);
        };
        let rest = rest.strip_suffix(b"\n").unwrap_or(rest);
        if let Some(digits) = rest.strip_prefix(b":") {
            let mark = parse_u32(digits)
                .ok_or_else(|| parse_error("malformed parent reference", &self.current))?;
            let resolved = engine.marks.translate(mark);
            self.advance(input)?;
            return Ok(Some((ParentRef::Mark(mark), resolved)));
        }
        if is_hex40(rest) {
            let hash = rest.to_vec();
            self.advance(input)?;
            return Ok(Some((
                ParentRef::Hash(hash.clone()),
                Some(ParentRef::Hash(hash)),
            )));
        }
        Ok(None)
    }

    /// Parse a `data <N>` header plus exactly N payload bytes.
    fn parse_data(&mut self, input: &mut dyn BufRead) -> io::Result<Vec<u8>> {
        let size = self
            .current
            .strip_prefix(b"data ")
            .and_then(|r| std::str::from_utf8(r).ok())
            .and_then(|s| s.trim().parse::<usize>().ok())
            .ok_or_else(|| parse_error("malformed data header", &self.current))?;
        let mut payload = vec![0u8; size];
        input.read_exact(&mut payload)?;
        self.advance(input)?;
        self.skip_blank(input)?;
        Ok(payload)
    }

    /// Parse `author`/`committer`/`tagger` identity lines.
    fn parse_user(&mut self, input: &mut dyn BufRead, kind: &[u8]) -> io::Result<Identity> {
        let rest = self
            .current
            .strip_prefix(kind)
            .and_then(|r| r.strip_prefix(b" "))
            .and_then(|r| r.strip_suffix(b"\n"))
            .ok_or_else(|| {
                parse_error(
                    &format!("malformed {} line", String::from_utf8_lossy(kind)),
                    &self.current,
                )
            })?;
        let lt = memchr::memchr(b'<', rest)
            .ok_or_else(|| parse_error("malformed identity", &self.current))?;
        let gt = memchr::memchr(b'>', &rest[lt..])
            .map(|p| lt + p)
            .ok_or_else(|| parse_error("malformed identity", &self.current))?;
        let name = trim_end(&rest[..lt]).to_vec();
        let email = rest[lt + 1..gt].to_vec();
        let mut date = rest[gt + 1..]
            .strip_prefix(b" ")
            .unwrap_or(&rest[gt + 1..])
            .to_vec();
        // One historically recorded timezone is invalid enough that
        // the importer rejects it; rewrite it like everyone else does.
        if date.ends_with(b"+051800") {
            date.truncate(date.len() - 7);
            date.extend_from_slice(b"+0261");
        }
        self.advance(input)?;
        Ok(Identity { name, email, date })
    }

    fn parse_optional_filechange(
        &mut self,
        input: &mut dyn BufRead,
        engine: &Rewriter,
    ) -> io::Result<Option<ParsedChange>> {
        if self.current == b"deleteall\n" {
            self.advance(input)?;
            return Ok(Some(ParsedChange::Keep(FileChange::DeleteAll)));
        }
        if self.current.starts_with(b"M ") {
            let line = self.current.clone();
            let rest = &line[2..];
            let sp1 = memchr::memchr(b' ', rest)
                .ok_or_else(|| parse_error("malformed filechange", &line))?;
            let mode = rest[..sp1].to_vec();
            let rest = &rest[sp1 + 1..];
            let sp2 = memchr::memchr(b' ', rest)
                .ok_or_else(|| parse_error("malformed filechange", &line))?;
            let id = &rest[..sp2];
            let path_raw = rest[sp2 + 1..].strip_suffix(b"\n").unwrap_or(&rest[sp2 + 1..]);
            let path = pathquoting::dequote(path_raw);
            let blob = if let Some(digits) = id.strip_prefix(b":") {
                let mark = parse_u32(digits)
                    .ok_or_else(|| parse_error("malformed filechange mark", &line))?;
                match engine.marks.translate(mark) {
                    Some(resolved) => resolved,
                    None => {
                        // Blob was stripped; the change goes with it.
                        self.advance(input)?;
                        return Ok(Some(ParsedChange::Dropped));
                    }
                }
            } else if is_hex40(id) {
                // Hex references to blobs we have already renumbered
                // are rewritten to the engine mark.
                match engine.hash_to_mark.get(id) {
                    Some(&mark) => ParentRef::Mark(mark),
                    None => ParentRef::Hash(id.to_vec()),
                }
            } else {
                return Err(parse_error("unsupported blob reference", &line));
            };
            self.advance(input)?;
            return Ok(Some(ParsedChange::Keep(FileChange::Modify {
                mode,
                blob,
                path,
            })));
        }
        if self.current.starts_with(b"D ") {
            let line = self.current.clone();
            let path_raw = line[2..].strip_suffix(b"\n").unwrap_or(&line[2..]);
            let path = pathquoting::dequote(path_raw);
            self.advance(input)?;
            return Ok(Some(ParsedChange::Keep(FileChange::Delete { path })));
        }
        if self.current.starts_with(b"R ") {
            let line = self.current.clone();
            let rest = line[2..].strip_suffix(b"\n").unwrap_or(&line[2..]);
            let (src, tail) = split_path_token(rest)
                .ok_or_else(|| parse_error("could not parse rename source", &line))?;
            let tail = tail
                .strip_prefix(b" ")
                .ok_or_else(|| parse_error("could not parse rename target", &line))?;
            let (dst, tail) = split_path_token(tail)
                .ok_or_else(|| parse_error("could not parse rename target", &line))?;
            if !tail.is_empty() {
                return Err(parse_error("trailing bytes after rename", &line));
            }
            self.advance(input)?;
            return Ok(Some(ParsedChange::Keep(FileChange::Rename { src, dst })));
        }
        Ok(None)
    }

    fn parse_blob(&mut self, input: &mut dyn BufRead, engine: &mut Rewriter) -> io::Result<()> {
        self.advance(input)?;
        let old_mark = self.parse_optional_mark(input)?;
        let original_id = self.parse_optional_original_id(input)?;
        let data = self.parse_data(input)?;
        self.skip_blank(input)?;

        let mut blob = Blob {
            mark: engine.marks.new_mark(),
            old_mark,
            original_id,
            data,
            state: DumpState::Pending,
        };
        if let Some(old) = old_mark {
            engine
                .marks
                .record_rename(old, Some(ParentRef::Mark(blob.mark)), false);
        }
        engine.process_blob(&mut blob)
    }

    fn parse_reset(&mut self, input: &mut dyn BufRead, engine: &mut Rewriter) -> io::Result<()> {
        let refname = self.parse_ref_line(input, b"reset")?;
        engine.note_exported_ref(&refname);
        let from = self
            .parse_optional_parent_ref(input, b"from", engine)?
            .and_then(|(_, resolved)| resolved);
        self.skip_blank(input)?;

        // The exporter prints resets that carry no from line; they
        // only mean "forget the branch tip".
        if from.is_none() {
            self.latest_commit.remove(&refname);
            self.latest_orig_commit.remove(&refname);
            return Ok(());
        }

        let mut reset = Reset {
            ref_name: refname,
            from,
            state: DumpState::Pending,
        };
        engine.process_reset(&mut reset)?;
        if let Some(from) = &reset.from {
            self.latest_commit.insert(reset.ref_name.clone(), from.clone());
            self.latest_orig_commit
                .insert(reset.ref_name.clone(), from.clone());
        }
        Ok(())
    }

    fn parse_commit(&mut self, input: &mut dyn BufRead, engine: &mut Rewriter) -> io::Result<()> {
        let branch = self.parse_ref_line(input, b"commit")?;
        engine.note_exported_ref(&branch);
        let old_mark = self.parse_optional_mark(input)?;
        let original_id = self.parse_optional_original_id(input)?;

        let author = if self.current.starts_with(b"author ") {
            Some(self.parse_user(input, b"author")?)
        } else {
            None
        };
        let committer = self.parse_user(input, b"committer")?;
        let author = author.unwrap_or_else(|| committer.clone());

        let encoding = if self.current.starts_with(b"encoding ") {
            let enc = self.current[b"encoding ".len()..]
                .strip_suffix(b"\n")
                .unwrap_or(&self.current[b"encoding ".len()..])
                .to_vec();
            self.advance(input)?;
            Some(enc)
        } else {
            None
        };

        let message = self.parse_data(input)?;

        let mut orig_parents: Vec<ParentRef> = Vec::new();
        let mut translated_parents: Vec<Option<ParentRef>> = Vec::new();
        if let Some((orig, resolved)) = self.parse_optional_parent_ref(input, b"from", engine)? {
            orig_parents.push(orig);
            translated_parents.push(resolved);
        }
        while self.current.starts_with(b"merge ") {
            if let Some((orig, resolved)) =
                self.parse_optional_parent_ref(input, b"merge", engine)?
            {
                orig_parents.push(orig);
                translated_parents.push(resolved);
            } else {
                return Err(parse_error("malformed merge line", &self.current));
            }
        }
        // The importer lets a commit inherit its parent from the
        // previous commit on the same branch when no from is given.
        if orig_parents.is_empty() {
            if let Some(orig) = self.latest_orig_commit.get(&branch).cloned() {
                orig_parents.push(orig);
                translated_parents.push(self.latest_commit.get(&branch).cloned());
            }
        }

        let mut file_changes: Vec<FileChange> = Vec::new();
        let mut had_file_changes = false;
        while let Some(parsed) = self.parse_optional_filechange(input, engine)? {
            had_file_changes = true;
            if let ParsedChange::Keep(change) = parsed {
                file_changes.push(change);
            }
        }
        self.skip_blank(input)?;

        let mut commit = Commit {
            mark: engine.marks.new_mark(),
            old_mark,
            original_id,
            branch: branch.clone(),
            author,
            committer,
            encoding,
            message,
            file_changes,
            parents: Vec::new(),
            state: DumpState::Pending,
        };
        if let Some(old) = old_mark {
            engine
                .marks
                .record_rename(old, Some(ParentRef::Mark(commit.mark)), false);
        }
        let aux = CommitAux {
            orig_parents,
            translated_parents,
            had_file_changes,
        };
        engine.process_commit(&mut commit, &aux)?;

        self.latest_orig_commit
            .insert(branch.clone(), ParentRef::Mark(commit.mark));
        if !engine.is_commit_skipped(commit.old_mark.unwrap_or(commit.mark)) {
            self.latest_commit
                .insert(branch, ParentRef::Mark(commit.mark));
        }
        Ok(())
    }

    fn parse_tag(&mut self, input: &mut dyn BufRead, engine: &mut Rewriter) -> io::Result<()> {
        let name = self.parse_ref_line(input, b"tag")?;
        let mut exported = b"refs/tags/".to_vec();
        exported.extend_from_slice(&name);
        engine.note_exported_ref(&exported);

        let old_mark = self.parse_optional_mark(input)?;
        let target = self
            .parse_optional_parent_ref(input, b"from", engine)?
            .and_then(|(_, resolved)| resolved);
        let original_id = self.parse_optional_original_id(input)?;
        let tagger = if self.current.starts_with(b"tagger ") {
            Some(self.parse_user(input, b"tagger")?)
        } else {
            None
        };
        let message = self.parse_data(input)?;
        self.skip_blank(input)?;

        let mut tag = Tag {
            mark: engine.marks.new_mark(),
            old_mark,
            original_id,
            name,
            target,
            tagger,
            message,
            state: DumpState::Pending,
        };
        if let Some(old) = old_mark {
            engine
                .marks
                .record_rename(old, Some(ParentRef::Mark(tag.mark)), false);
        }
        engine.process_tag(&mut tag)
    }

    fn parse_progress(&mut self, input: &mut dyn BufRead, engine: &mut Rewriter) -> io::Result<()> {
        let message = self.parse_ref_line(input, b"progress")?;
        self.skip_blank(input)?;
        let mut progress = Progress {
            message,
            state: DumpState::Pending,
        };
        engine.process_progress(&mut progress)
    }

    fn parse_checkpoint(&mut self, input: &mut dyn BufRead) -> io::Result<()> {
        // Parsed and deliberately dropped; forwarding checkpoints
        // could interleave importer output with directive responses.
        self.advance(input)?;
        self.skip_blank(input)
    }
}

fn parse_u32(bytes: &[u8]) -> Option<u32> {
    let mut value: u32 = 0;
    let mut seen = false;
    for &b in bytes {
        if b.is_ascii_digit() {
            seen = true;
            value = value.checked_mul(10)?.checked_add((b - b'0') as u32)?;
        } else {
            break;
        }
    }
    seen.then_some(value)
}

fn is_hex40(bytes: &[u8]) -> bool {
    bytes.len() == 40 && bytes.iter().all(|b| b.is_ascii_hexdigit())
}

fn trim_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |p| p + 1);
    &bytes[..end]
}

/// Split one possibly-quoted path token off the front of `input`,
/// returning the decoded path and the remainder.
fn split_path_token(input: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    if input.first() == Some(&b'"') {
        let mut idx = 1usize;
        while idx < input.len() {
            if input[idx] == b'"' {
                let mut backslashes = 0usize;
                let mut j = idx;
                while j > 1 && input[j - 1] == b'\\' {
                    backslashes += 1;
                    j -= 1;
                }
                if backslashes % 2 == 1 {
                    idx += 1;
                    continue;
                }
                return Some((
                    pathquoting::dequote(&input[..idx + 1]),
                    &input[idx + 1..],
                ));
            }
            idx += 1;
        }
        None
    } else {
        match memchr::memchr(b' ', input) {
            Some(pos) => Some((input[..pos].to_vec(), &input[pos..])),
            None => Some((input.to_vec(), &input[input.len()..])),
        }
    }
}
