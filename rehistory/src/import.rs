//! Channel to the downstream importer. The write side carries both
//! the bulk element stream and the `ls`/`get-mark` directives, so
//! everything funnels through one handle and the engine flushes
//! before reading any response. Requests and responses are strictly
//! one-for-one in FIFO order.

use std::io::{self, BufRead, Write};

use crate::pathquoting;

pub struct ImportHandle {
    sink: Box<dyn Write>,
    copy: Option<Box<dyn Write>>,
    response: Option<Box<dyn BufRead>>,
}

impl ImportHandle {
    pub fn new(sink: Box<dyn Write>, response: Option<Box<dyn BufRead>>) -> Self {
        ImportHandle {
            sink,
            copy: None,
            response,
        }
    }

    /// Mirror everything written into a second stream (the filtered
    /// debug copy kept under the results directory).
    pub fn with_copy(mut self, copy: Box<dyn Write>) -> Self {
        self.copy = Some(copy);
        self
    }

    /// A handle that stages output without an importer behind it;
    /// directive round-trips are unavailable.
    pub fn staging(copy: Box<dyn Write>) -> Self {
        ImportHandle {
            sink: Box::new(io::sink()),
            copy: Some(copy),
            response: None,
        }
    }

    /// Whether directive round-trips can be answered.
    pub fn can_query(&self) -> bool {
        self.response.is_some()
    }

    pub fn read_response_line(&mut self) -> io::Result<Vec<u8>> {
        let reader = self.response.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                "importer directive issued without a response pipe",
            )
        })?;
        let mut line = Vec::with_capacity(64);
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "importer closed its response pipe mid-directive",
            ));
        }
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    /// Queue a `get-mark` directive; the response line must be read
    /// later, in order, by the caller.
    pub fn send_get_mark(&mut self, mark: u32) -> io::Result<()> {
        let directive = format!("get-mark :{mark}\n");
        self.write_all(directive.as_bytes())?;
        self.flush()
    }

    /// Resolve a mark to an object id right away.
    pub fn get_mark(&mut self, mark: u32) -> io::Result<Vec<u8>> {
        self.send_get_mark(mark)?;
        self.read_response_line()
    }

    /// Ask the importer what `path` looks like in the tree of the
    /// commit named by `mark`. Returns the raw response line, either
    /// `missing <quoted_path>` or `<mode> <kind> <hex> <quoted_path>`.
    pub fn ls(&mut self, mark: u32, path: &[u8]) -> io::Result<Vec<u8>> {
        let mut directive = Vec::with_capacity(path.len() + 16);
        directive.extend_from_slice(b"ls :");
        directive.extend_from_slice(mark.to_string().as_bytes());
        directive.push(b' ');
        directive.extend_from_slice(&pathquoting::enquote(path));
        directive.push(b'\n');
        self.write_all(&directive)?;
        self.flush()?;
        self.read_response_line()
    }
}

impl Write for ImportHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(copy) = &mut self.copy {
            copy.write_all(buf)?;
        }
        self.sink.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(copy) = &mut self.copy {
            copy.flush()?;
        }
        self.sink.flush()
    }
}
