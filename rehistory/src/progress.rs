use std::io::{self, Write};

/// Overwriting progress line on stderr, in the style of
/// "Parsed 1234 commits". Silent when quiet is set.
#[derive(Debug, Default)]
pub struct ProgressWriter {
    last_len: usize,
    quiet: bool,
}

impl ProgressWriter {
    pub fn new(quiet: bool) -> Self {
        ProgressWriter { last_len: 0, quiet }
    }

    pub fn show(&mut self, message: &str) {
        if self.quiet {
            return;
        }
        let mut err = io::stderr();
        let pad = self.last_len.saturating_sub(message.len());
        let _ = write!(err, "\r{message}{:pad$}", "");
        let _ = err.flush();
        self.last_len = message.len();
    }

    pub fn finish(&mut self) {
        if self.quiet || self.last_len == 0 {
            return;
        }
        let _ = writeln!(io::stderr());
        self.last_len = 0;
    }
}
