//! In-memory model of the history objects found in a fast-export
//! stream, together with their canonical serialization. Each element
//! serializes to exactly what the exporter would have produced for an
//! object with the same content, so the importer accepts our output
//! without special casing.

use std::io::{self, Write};

use crate::pathquoting;

/// Lifecycle of an element between parsing and emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpState {
    Pending,
    Written,
    Skipped,
}

/// A reference to another object: either a session-local mark or an
/// external 40-hex object id. Used for commit parents, tag targets
/// and blob references in file changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParentRef {
    Mark(u32),
    Hash(Vec<u8>),
}

impl ParentRef {
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            ParentRef::Mark(m) => {
                out.push(b':');
                out.extend_from_slice(m.to_string().as_bytes());
            }
            ParentRef::Hash(h) => out.extend_from_slice(h),
        }
    }

    pub fn as_mark(&self) -> Option<u32> {
        match self {
            ParentRef::Mark(m) => Some(*m),
            ParentRef::Hash(_) => None,
        }
    }
}

/// An author/committer/tagger triple. The date stays a raw
/// `<epoch> <offset>` bytestring; we never interpret it beyond the
/// one historical timezone repair done at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub name: Vec<u8>,
    pub email: Vec<u8>,
    pub date: Vec<u8>,
}

impl Identity {
    fn write_line(&self, kind: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(kind);
        out.push(b' ');
        out.extend_from_slice(&self.name);
        out.extend_from_slice(b" <");
        out.extend_from_slice(&self.email);
        out.extend_from_slice(b"> ");
        out.extend_from_slice(&self.date);
        out.push(b'\n');
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileChange {
    Modify {
        mode: Vec<u8>,
        blob: ParentRef,
        path: Vec<u8>,
    },
    Delete {
        path: Vec<u8>,
    },
    DeleteAll,
    Rename {
        src: Vec<u8>,
        dst: Vec<u8>,
    },
}

impl FileChange {
    /// The path this change is keyed by when detecting collisions and
    /// sorting: the destination for renames, empty for deleteall.
    pub fn path_key(&self) -> &[u8] {
        match self {
            FileChange::Modify { path, .. } | FileChange::Delete { path } => path,
            FileChange::Rename { dst, .. } => dst,
            FileChange::DeleteAll => b"",
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            FileChange::Modify { mode, blob, path } => {
                out.extend_from_slice(b"M ");
                out.extend_from_slice(mode);
                out.push(b' ');
                blob.write_to(out);
                out.push(b' ');
                out.extend_from_slice(&pathquoting::enquote(path));
                out.push(b'\n');
            }
            FileChange::Delete { path } => {
                out.extend_from_slice(b"D ");
                out.extend_from_slice(&pathquoting::enquote(path));
                out.push(b'\n');
            }
            FileChange::DeleteAll => out.extend_from_slice(b"deleteall\n"),
            FileChange::Rename { src, dst } => {
                out.extend_from_slice(b"R ");
                out.extend_from_slice(&pathquoting::enquote(src));
                out.push(b' ');
                out.extend_from_slice(&pathquoting::enquote(dst));
                out.push(b'\n');
            }
        }
    }
}

#[derive(Debug)]
pub struct Blob {
    pub mark: u32,
    pub old_mark: Option<u32>,
    pub original_id: Option<Vec<u8>>,
    pub data: Vec<u8>,
    pub state: DumpState,
}

impl Blob {
    pub fn skip(&mut self) {
        self.state = DumpState::Skipped;
    }

    pub fn dump(&mut self, out: &mut dyn Write) -> io::Result<()> {
        self.state = DumpState::Written;
        let mut buf = Vec::with_capacity(self.data.len() + 64);
        buf.extend_from_slice(b"blob\n");
        buf.extend_from_slice(format!("mark :{}\n", self.mark).as_bytes());
        buf.extend_from_slice(format!("data {}\n", self.data.len()).as_bytes());
        buf.extend_from_slice(&self.data);
        buf.push(b'\n');
        out.write_all(&buf)
    }
}

#[derive(Debug)]
pub struct Commit {
    pub mark: u32,
    pub old_mark: Option<u32>,
    pub original_id: Option<Vec<u8>>,
    pub branch: Vec<u8>,
    pub author: Identity,
    pub committer: Identity,
    pub encoding: Option<Vec<u8>>,
    pub message: Vec<u8>,
    pub file_changes: Vec<FileChange>,
    pub parents: Vec<ParentRef>,
    pub state: DumpState,
}

impl Commit {
    pub fn skip(&mut self) {
        self.state = DumpState::Skipped;
    }

    pub fn first_parent(&self) -> Option<ParentRef> {
        self.parents.first().cloned()
    }

    pub fn dump(&mut self, out: &mut dyn Write) -> io::Result<()> {
        self.state = DumpState::Written;
        let mut buf = Vec::with_capacity(self.message.len() + 256);
        if self.parents.is_empty() {
            // Without a from line the importer would attach this
            // commit to the current branch tip; clear it first.
            buf.extend_from_slice(b"reset ");
            buf.extend_from_slice(&self.branch);
            buf.push(b'\n');
        }
        buf.extend_from_slice(b"commit ");
        buf.extend_from_slice(&self.branch);
        buf.push(b'\n');
        buf.extend_from_slice(format!("mark :{}\n", self.mark).as_bytes());
        if let Some(id) = &self.original_id {
            buf.extend_from_slice(b"original-oid ");
            buf.extend_from_slice(id);
            buf.push(b'\n');
        }
        self.author.write_line(b"author", &mut buf);
        self.committer.write_line(b"committer", &mut buf);
        if let Some(enc) = &self.encoding {
            buf.extend_from_slice(b"encoding ");
            buf.extend_from_slice(enc);
            buf.push(b'\n');
        }
        buf.extend_from_slice(format!("data {}\n", self.message.len()).as_bytes());
        buf.extend_from_slice(&self.message);
        // Cosmetic trailing newline for messages that lack one.
        if !self.message.ends_with(b"\n") && (!self.parents.is_empty() || !self.file_changes.is_empty())
        {
            buf.push(b'\n');
        }
        for (i, parent) in self.parents.iter().enumerate() {
            buf.extend_from_slice(if i == 0 { b"from " } else { b"merge " });
            parent.write_to(&mut buf);
            buf.push(b'\n');
        }
        for change in &self.file_changes {
            change.write_to(&mut buf);
        }
        if self.parents.is_empty() && self.file_changes.is_empty() {
            // Fully empty root commits confuse the importer without this.
            buf.extend_from_slice(b"deleteall\n");
        }
        buf.push(b'\n');
        out.write_all(&buf)
    }
}

#[derive(Debug)]
pub struct Tag {
    pub mark: u32,
    pub old_mark: Option<u32>,
    pub original_id: Option<Vec<u8>>,
    /// Tag name without the refs/tags/ prefix.
    pub name: Vec<u8>,
    pub target: Option<ParentRef>,
    pub tagger: Option<Identity>,
    pub message: Vec<u8>,
    pub state: DumpState,
}

impl Tag {
    pub fn skip(&mut self) {
        self.state = DumpState::Skipped;
    }

    /// `mark_tags` reflects whether the exporter was asked to mark
    /// tags; emitting marks the importer never heard of is an error,
    /// so the capability is threaded through explicitly.
    pub fn dump(&mut self, out: &mut dyn Write, mark_tags: bool) -> io::Result<()> {
        self.state = DumpState::Written;
        let target = match &self.target {
            Some(t) => t.clone(),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "refusing to serialize tag with no target",
                ))
            }
        };
        let mut buf = Vec::with_capacity(self.message.len() + 128);
        buf.extend_from_slice(b"tag ");
        buf.extend_from_slice(&self.name);
        buf.push(b'\n');
        if mark_tags {
            buf.extend_from_slice(format!("mark :{}\n", self.mark).as_bytes());
        }
        buf.extend_from_slice(b"from ");
        target.write_to(&mut buf);
        buf.push(b'\n');
        if let Some(id) = &self.original_id {
            buf.extend_from_slice(b"original-oid ");
            buf.extend_from_slice(id);
            buf.push(b'\n');
        }
        if let Some(tagger) = &self.tagger {
            tagger.write_line(b"tagger", &mut buf);
        }
        buf.extend_from_slice(format!("data {}\n", self.message.len()).as_bytes());
        buf.extend_from_slice(&self.message);
        buf.push(b'\n');
        out.write_all(&buf)
    }
}

#[derive(Debug)]
pub struct Reset {
    pub ref_name: Vec<u8>,
    pub from: Option<ParentRef>,
    pub state: DumpState,
}

impl Reset {
    pub fn skip(&mut self) {
        self.state = DumpState::Skipped;
    }

    pub fn dump(&mut self, out: &mut dyn Write) -> io::Result<()> {
        self.state = DumpState::Written;
        let mut buf = Vec::with_capacity(self.ref_name.len() + 64);
        buf.extend_from_slice(b"reset ");
        buf.extend_from_slice(&self.ref_name);
        buf.push(b'\n');
        if let Some(from) = &self.from {
            buf.extend_from_slice(b"from ");
            from.write_to(&mut buf);
            buf.push(b'\n');
            buf.push(b'\n');
        }
        out.write_all(&buf)
    }
}

#[derive(Debug)]
pub struct Progress {
    pub message: Vec<u8>,
    pub state: DumpState,
}

impl Progress {
    pub fn dump(&mut self, out: &mut dyn Write) -> io::Result<()> {
        self.state = DumpState::Written;
        let mut buf = Vec::with_capacity(self.message.len() + 16);
        buf.extend_from_slice(b"progress ");
        buf.extend_from_slice(&self.message);
        buf.push(b'\n');
        out.write_all(&buf)
    }
}

#[derive(Debug)]
pub struct Checkpoint {
    pub state: DumpState,
}

impl Checkpoint {
    pub fn dump(&mut self, out: &mut dyn Write) -> io::Result<()> {
        self.state = DumpState::Written;
        out.write_all(b"checkpoint\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(name: &str, email: &str) -> Identity {
        Identity {
            name: name.as_bytes().to_vec(),
            email: email.as_bytes().to_vec(),
            date: b"1700000000 +0000".to_vec(),
        }
    }

    #[test]
    fn blob_serialization() {
        let mut blob = Blob {
            mark: 3,
            old_mark: Some(1),
            original_id: None,
            data: b"hello\n".to_vec(),
            state: DumpState::Pending,
        };
        let mut out = Vec::new();
        blob.dump(&mut out).unwrap();
        assert_eq!(out, b"blob\nmark :3\ndata 6\nhello\n\n".to_vec());
        assert_eq!(blob.state, DumpState::Written);
    }

    #[test]
    fn commit_serialization_with_parents_and_changes() {
        let mut commit = Commit {
            mark: 5,
            old_mark: Some(2),
            original_id: Some(b"ab".repeat(20)),
            branch: b"refs/heads/main".to_vec(),
            author: ident("A U Thor", "a@example.com"),
            committer: ident("C O Mitter", "c@example.com"),
            encoding: None,
            message: b"subject\n".to_vec(),
            file_changes: vec![FileChange::Modify {
                mode: b"100644".to_vec(),
                blob: ParentRef::Mark(3),
                path: b"dir/file".to_vec(),
            }],
            parents: vec![ParentRef::Mark(4)],
            state: DumpState::Pending,
        };
        let mut out = Vec::new();
        commit.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("commit refs/heads/main\nmark :5\n"));
        assert!(text.contains("original-oid abab"));
        assert!(text.contains("author A U Thor <a@example.com> 1700000000 +0000\n"));
        assert!(text.contains("data 8\nsubject\n"));
        assert!(text.contains("from :4\n"));
        assert!(text.contains("M 100644 :3 dir/file\n"));
        assert!(text.ends_with("\n\n"));
    }

    #[test]
    fn parentless_commit_resets_branch_first() {
        let mut commit = Commit {
            mark: 1,
            old_mark: None,
            original_id: None,
            branch: b"refs/heads/topic".to_vec(),
            author: ident("A", "a@x"),
            committer: ident("A", "a@x"),
            encoding: None,
            message: b"root\n".to_vec(),
            file_changes: Vec::new(),
            parents: Vec::new(),
            state: DumpState::Pending,
        };
        let mut out = Vec::new();
        commit.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("reset refs/heads/topic\ncommit refs/heads/topic\n"));
        assert!(text.contains("deleteall\n"));
    }

    #[test]
    fn tag_serialization_honors_mark_tags() {
        let mut tag = Tag {
            mark: 9,
            old_mark: None,
            original_id: None,
            name: b"v1.0".to_vec(),
            target: Some(ParentRef::Mark(5)),
            tagger: Some(ident("T", "t@x")),
            message: b"release".to_vec(),
            state: DumpState::Pending,
        };
        let mut with_marks = Vec::new();
        tag.dump(&mut with_marks, true).unwrap();
        let text = String::from_utf8(with_marks).unwrap();
        assert!(text.starts_with("tag v1.0\nmark :9\nfrom :5\n"));

        let mut without_marks = Vec::new();
        tag.dump(&mut without_marks, false).unwrap();
        assert!(!String::from_utf8(without_marks).unwrap().contains("mark :"));
    }

    #[test]
    fn reset_without_from_is_header_only() {
        let mut reset = Reset {
            ref_name: b"refs/heads/gone".to_vec(),
            from: None,
            state: DumpState::Pending,
        };
        let mut out = Vec::new();
        reset.dump(&mut out).unwrap();
        assert_eq!(out, b"reset refs/heads/gone\n".to_vec());
    }

    #[test]
    fn progress_and_checkpoint_serialization() {
        let mut progress = Progress {
            message: b"processed 100 objects".to_vec(),
            state: DumpState::Pending,
        };
        let mut out = Vec::new();
        progress.dump(&mut out).unwrap();
        assert_eq!(out, b"progress processed 100 objects\n".to_vec());

        let mut checkpoint = Checkpoint {
            state: DumpState::Pending,
        };
        let mut out = Vec::new();
        checkpoint.dump(&mut out).unwrap();
        assert_eq!(out, b"checkpoint\n\n".to_vec());
    }

    #[test]
    fn quoted_paths_in_file_changes() {
        let change = FileChange::Delete {
            path: b"odd\nname".to_vec(),
        };
        let mut out = Vec::new();
        change.write_to(&mut out);
        assert_eq!(out, b"D \"odd\\nname\"\n".to_vec());
    }
}
