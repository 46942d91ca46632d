//! Byte replacement tables for blob contents and commit/tag
//! messages. The file format is one rule per line:
//!
//!   SECRET==>replacement
//!   SECRET                      (replaced by ***REMOVED***)
//!   literal:SECRET==>replacement
//!   regex:p[a4]ss==>replacement
//!   glob:*token*==>replacement
//!
//! Literal rules apply first, in order, then the compiled regex
//! rules. Lines starting with # are comments.

use std::io::{self, Read};
use std::path::Path;

use aho_corasick::AhoCorasick;
use regex::bytes::{Regex, RegexBuilder};

const DEFAULT_REPLACEMENT: &[u8] = b"***REMOVED***";
const AHO_CORASICK_THRESHOLD: usize = 3;
const REGEX_SIZE_LIMIT: usize = 10 << 20;

#[derive(Debug, Default)]
pub struct ReplaceTable {
    literals: Vec<(Vec<u8>, Vec<u8>)>,
    regexes: Vec<(Regex, Vec<u8>)>,
    ac: Option<AhoCorasick>,
    ac_replacements: Vec<Vec<u8>>,
}

impl ReplaceTable {
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let content = std::fs::read(path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("failed to read replacement rules {}: {e}", path.display()),
            )
        })?;
        Self::from_bytes(&content)
    }

    pub fn from_reader<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut content = Vec::new();
        reader.read_to_end(&mut content)?;
        Self::from_bytes(&content)
    }

    pub fn from_bytes(content: &[u8]) -> io::Result<Self> {
        let mut literals: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut regexes: Vec<(Regex, Vec<u8>)> = Vec::new();
        for raw in content.split(|&b| b == b'\n') {
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() || raw.starts_with(b"#") {
                continue;
            }
            let (pattern, replacement) = match find_subslice(raw, b"==>") {
                Some(pos) => (&raw[..pos], raw[pos + 3..].to_vec()),
                None => (raw, DEFAULT_REPLACEMENT.to_vec()),
            };
            if let Some(rest) = pattern.strip_prefix(b"regex:") {
                regexes.push((compile_regex(rest)?, replacement));
            } else if let Some(rest) = pattern.strip_prefix(b"glob:") {
                regexes.push((compile_regex(glob_to_regex(rest).as_bytes())?, replacement));
            } else {
                let literal = pattern.strip_prefix(b"literal:").unwrap_or(pattern);
                if !literal.is_empty() {
                    literals.push((literal.to_vec(), replacement));
                }
            }
        }
        let (ac, ac_replacements) = if literals.len() >= AHO_CORASICK_THRESHOLD {
            let patterns: Vec<&[u8]> = literals.iter().map(|(p, _)| p.as_slice()).collect();
            let replacements: Vec<Vec<u8>> = literals.iter().map(|(_, r)| r.clone()).collect();
            match AhoCorasick::new(&patterns) {
                Ok(ac) => (Some(ac), replacements),
                Err(_) => (None, Vec::new()),
            }
        } else {
            (None, Vec::new())
        };
        Ok(ReplaceTable {
            literals,
            regexes,
            ac,
            ac_replacements,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty() && self.regexes.is_empty()
    }

    pub fn apply(&self, data: Vec<u8>) -> Vec<u8> {
        let mut cur = if let Some(ac) = &self.ac {
            let mut out = Vec::with_capacity(data.len());
            let mut last = 0usize;
            for m in ac.find_iter(&data) {
                out.extend_from_slice(&data[last..m.start()]);
                out.extend_from_slice(&self.ac_replacements[m.pattern().as_usize()]);
                last = m.end();
            }
            if last == 0 {
                data
            } else {
                out.extend_from_slice(&data[last..]);
                out
            }
        } else {
            let mut cur = data;
            for (from, to) in &self.literals {
                cur = replace_all_bytes(&cur, from, to);
            }
            cur
        };
        for (re, rep) in &self.regexes {
            cur = re.replace_all(&cur, regex::bytes::NoExpand(rep)).into_owned();
        }
        cur
    }
}

fn compile_regex(pattern: &[u8]) -> io::Result<Regex> {
    let pat_str = std::str::from_utf8(pattern).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid UTF-8 in regex rule: {e}"),
        )
    })?;
    RegexBuilder::new(pat_str)
        .size_limit(REGEX_SIZE_LIMIT)
        .dfa_size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid regex pattern: {e}"),
            )
        })
}

fn glob_to_regex(glob: &[u8]) -> String {
    let mut rx = String::with_capacity(glob.len() + 8);
    for &b in glob {
        match b {
            b'*' => rx.push_str(".*"),
            b'?' => rx.push('.'),
            b'.' | b'+' | b'(' | b')' | b'|' | b'{' | b'}' | b'[' | b']' | b'^' | b'$'
            | b'\\' => {
                rx.push('\\');
                rx.push(b as char);
            }
            _ => rx.push(b as char),
        }
    }
    rx
}

pub fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn replace_all_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i + needle.len() <= haystack.len() {
        if &haystack[i..i + needle.len()] == needle {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out.extend_from_slice(&haystack[i..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_rules_with_default_replacement() {
        let table = ReplaceTable::from_bytes(b"# comment\nhunter2==>xxxxxxx\npassword\n").unwrap();
        let out = table.apply(b"pw=hunter2 and password".to_vec());
        assert_eq!(out, b"pw=xxxxxxx and ***REMOVED***".to_vec());
    }

    #[test]
    fn literals_apply_before_regexes() {
        let table = ReplaceTable::from_bytes(b"abc==>xyz\nregex:x.z==>LATER\n").unwrap();
        assert_eq!(table.apply(b"abc".to_vec()), b"LATER".to_vec());
    }

    #[test]
    fn glob_rules_become_regexes() {
        let table = ReplaceTable::from_bytes(b"glob:sec*et==>GONE\n").unwrap();
        assert_eq!(table.apply(b"a secret b".to_vec()), b"a GONE b".to_vec());
    }

    #[test]
    fn aho_corasick_path_matches_plain_path() {
        let table = ReplaceTable::from_bytes(b"one==>1\ntwo==>2\nthree==>3\n").unwrap();
        assert!(table.ac.is_some());
        assert_eq!(
            table.apply(b"one two three".to_vec()),
            b"1 2 3".to_vec()
        );
        let untouched = vec![0xff, 0x00, b'z'];
        assert_eq!(table.apply(untouched.clone()), untouched);
    }

    #[test]
    fn invalid_regex_is_reported() {
        assert!(ReplaceTable::from_bytes(b"regex:(unclosed\n").is_err());
        let err = ReplaceTable::from_bytes(b"regex:\xff\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
