//! Shared helpers: build fast-export streams in memory, run the
//! engine over them, and capture what would have reached the
//! importer. Importer responses, when a test needs the directive
//! round-trip, are scripted as a canned byte stream.
#![allow(dead_code)]

use std::cell::RefCell;
use std::io::{self, Cursor, Write};
use std::rc::Rc;

use rehistory::{filter_stream, Callbacks, ImportHandle, Options, RunSummary};

#[derive(Clone, Default)]
pub struct SharedBuf(pub Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn run_with(
    opts: &Options,
    callbacks: Callbacks,
    input: &[u8],
    responses: Option<&[u8]>,
) -> io::Result<(Vec<u8>, RunSummary)> {
    let out = SharedBuf::default();
    let handle = match responses {
        Some(r) => ImportHandle::new(
            Box::new(out.clone()),
            Some(Box::new(Cursor::new(r.to_vec()))),
        ),
        None => ImportHandle::new(Box::new(out.clone()), None),
    };
    let mut input = Cursor::new(input.to_vec());
    let summary = filter_stream(opts, callbacks, &mut input, handle)?;
    Ok((out.contents(), summary))
}

/// Run without an importer behind the pipe; directive round-trips
/// degrade to "cannot query", as in a dry run.
pub fn run_no_importer(opts: &Options, input: &[u8]) -> (Vec<u8>, RunSummary) {
    run_with(opts, Callbacks::default(), input, None).expect("filter run")
}

pub fn run_scripted(opts: &Options, input: &[u8], responses: &str) -> (Vec<u8>, RunSummary) {
    run_with(opts, Callbacks::default(), input, Some(responses.as_bytes())).expect("filter run")
}

pub fn out_str(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// A 40-hex object id built from one hex digit.
pub fn oid(digit: char) -> String {
    digit.to_string().repeat(40)
}

pub fn blob(mark: u32, data: &str) -> String {
    format!("blob\nmark :{mark}\ndata {}\n{data}\n", data.len())
}

pub fn blob_with_oid(mark: u32, oid: &str, data: &str) -> String {
    format!(
        "blob\nmark :{mark}\noriginal-oid {oid}\ndata {}\n{data}\n",
        data.len()
    )
}

pub const AUTHOR: &str = "author A U Thor <author@example.com> 1700000000 +0000\n";
pub const COMMITTER: &str = "committer C O Mitter <committer@example.com> 1700000000 +0000\n";

/// Build a commit stanza. `parents` are raw references (`:2` or a
/// 40-hex id); the first becomes the from line, the rest merges.
pub fn commit(
    branch: &str,
    mark: u32,
    oid: Option<&str>,
    parents: &[&str],
    changes: &[&str],
    message: &str,
) -> String {
    let mut s = format!("commit {branch}\nmark :{mark}\n");
    if let Some(oid) = oid {
        s.push_str(&format!("original-oid {oid}\n"));
    }
    s.push_str(AUTHOR);
    s.push_str(COMMITTER);
    s.push_str(&format!("data {}\n{message}", message.len()));
    for (i, parent) in parents.iter().enumerate() {
        let kind = if i == 0 { "from" } else { "merge" };
        s.push_str(&format!("{kind} {parent}\n"));
    }
    for change in changes {
        s.push_str(change);
        s.push('\n');
    }
    s.push('\n');
    s
}

pub fn annotated_tag(
    name: &str,
    mark: u32,
    target: &str,
    oid: Option<&str>,
    message: &str,
) -> String {
    let mut s = format!("tag {name}\nmark :{mark}\nfrom {target}\n");
    if let Some(oid) = oid {
        s.push_str(&format!("original-oid {oid}\n"));
    }
    s.push_str("tagger T A Gger <tagger@example.com> 1700000000 +0000\n");
    s.push_str(&format!("data {}\n{message}\n", message.len()));
    s
}
