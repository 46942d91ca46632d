use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use regex::bytes::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
struct MailmapEntry {
    old_name: Option<Vec<u8>>,
    old_email: Option<Vec<u8>>,
    new_name: Option<Vec<u8>>,
    new_email: Vec<u8>,
}

/// Identity translation table in git's mailmap format. Entries are
/// kept in file order; the first matching rule wins.
///
/// Supported line shapes:
///   Proper Name <proper@email>
///   Proper Name <proper@email> <commit@email>
///   Proper Name <proper@email> Commit Name <commit@email>
///   Proper Name <proper@email> Commit Name
#[derive(Debug, Clone, Default)]
pub struct Mailmap {
    entries: Vec<MailmapEntry>,
}

impl Mailmap {
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let file = File::open(path).map_err(|e| {
            io::Error::new(e.kind(), format!("cannot read mailmap {}: {e}", path.display()))
        })?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: Read>(reader: R) -> io::Result<Self> {
        let name_and_email = Regex::new(r"^(.*?)\s*<([^>]+)>\s*").unwrap();
        let mut entries = Vec::new();
        let mut lineno = 0usize;
        for line in BufReader::new(reader).split(b'\n') {
            let mut line = line?;
            lineno += 1;
            if let Some(pos) = line.iter().position(|&b| b == b'#') {
                line.truncate(pos);
            }
            let trimmed = trim(&line);
            if trimmed.is_empty() {
                continue;
            }
            let caps = name_and_email.captures(trimmed).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unparseable mailmap line #{lineno}"),
                )
            })?;
            let new_name = nonempty(caps.get(1).map_or(b"" as &[u8], |m| m.as_bytes()));
            let new_email = caps.get(2).unwrap().as_bytes().to_vec();
            let rest = &trimmed[caps.get(0).unwrap().end()..];
            let (old_name, old_email) = if rest.is_empty() {
                (None, None)
            } else if let Some(caps2) = name_and_email.captures(rest) {
                if caps2.get(0).unwrap().end() != rest.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unparseable mailmap line #{lineno}"),
                    ));
                }
                (
                    nonempty(caps2.get(1).map_or(b"" as &[u8], |m| m.as_bytes())),
                    Some(caps2.get(2).unwrap().as_bytes().to_vec()),
                )
            } else {
                (Some(rest.to_vec()), None)
            };
            entries.push(MailmapEntry {
                old_name,
                old_email,
                new_name,
                new_email,
            });
        }
        Ok(Mailmap { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Translate an identity, returning the input unchanged when no
    /// rule applies. A rule with no old side keys on email alone.
    pub fn translate(&self, name: &[u8], email: &[u8]) -> (Vec<u8>, Vec<u8>) {
        for entry in &self.entries {
            // An entry with no old side at all matches on the proper
            // email; otherwise absent fields match anything.
            let email_ok = if entry.old_email.is_none() && entry.old_name.is_none() {
                entry.new_email.eq_ignore_ascii_case(email)
            } else {
                match &entry.old_email {
                    Some(old) => old.eq_ignore_ascii_case(email),
                    None => true,
                }
            };
            let name_ok = match &entry.old_name {
                Some(old) => old == name,
                None => true,
            };
            if email_ok && name_ok {
                let new_name = entry.new_name.clone().unwrap_or_else(|| name.to_vec());
                return (new_name, entry.new_email.clone());
            }
        }
        (name.to_vec(), email.to_vec())
    }
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &bytes[start..end]
}

fn nonempty(bytes: &[u8]) -> Option<Vec<u8>> {
    let t = trim(bytes);
    if t.is_empty() {
        None
    } else {
        Some(t.to_vec())
    }
}
