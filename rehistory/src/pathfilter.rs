//! Path filtering and renaming rules applied to every file change.
//!
//! Rules are evaluated in declaration order. Filter rules decide
//! whether a path is wanted (matching against the original path, or
//! its basename under `use_base_name`); rename rules progressively
//! rewrite the full path. A path survives iff `wanted == inclusive`.

use std::io;

use regex::bytes::Regex;

#[derive(Debug, Clone)]
pub enum PathRule {
    FilterLiteral { pattern: Vec<u8> },
    FilterGlob { pattern: Vec<u8> },
    FilterRegex { regex: Regex },
    RenameLiteral { old: Vec<u8>, new: Vec<u8> },
    RenameRegex { regex: Regex, replacement: Vec<u8> },
}

impl PathRule {
    pub fn rename_literal(old: Vec<u8>, new: Vec<u8>) -> io::Result<PathRule> {
        if !old.is_empty() && !new.is_empty() && (old.ends_with(b"/") != new.ends_with(b"/")) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "with path renames, if OLD and NEW are both non-empty and either \
                 ends with a slash then both must",
            ));
        }
        Ok(PathRule::RenameLiteral { old, new })
    }

    fn is_filter(&self) -> bool {
        matches!(
            self,
            PathRule::FilterLiteral { .. } | PathRule::FilterGlob { .. } | PathRule::FilterRegex { .. }
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathTransform {
    rules: Vec<PathRule>,
    use_base_name: bool,
    inclusive: bool,
}

impl PathTransform {
    pub fn new(rules: Vec<PathRule>, use_base_name: bool, invert: bool) -> io::Result<Self> {
        if use_base_name && rules.iter().any(|r| !r.is_filter()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "basename matching and path renames are incompatible",
            ));
        }
        // With no filter rules every path must survive; since survival
        // means wanted == inclusive and nothing ever sets wanted, that
        // requires inclusive = false.
        let inclusive = if rules.iter().any(|r| r.is_filter()) {
            !invert
        } else {
            false
        };
        Ok(PathTransform {
            rules,
            use_base_name,
            inclusive,
        })
    }

    /// Expansion of the subdirectory-extraction shortcut: keep only
    /// `dir/` and strip the prefix.
    pub fn subdirectory_filter(dir: &[u8]) -> io::Result<Vec<PathRule>> {
        let dir = with_trailing_slash(dir);
        Ok(vec![
            PathRule::FilterLiteral {
                pattern: dir.clone(),
            },
            PathRule::rename_literal(dir, Vec::new())?,
        ])
    }

    /// Expansion of the move-to-subdirectory shortcut.
    pub fn to_subdirectory_filter(dir: &[u8]) -> io::Result<Vec<PathRule>> {
        Ok(vec![PathRule::rename_literal(
            Vec::new(),
            with_trailing_slash(dir),
        )?])
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply the rule list. Returns the (possibly renamed) path, or
    /// None when the filters exclude it.
    pub fn rewrite(&self, path: &[u8]) -> Option<Vec<u8>> {
        let match_key: &[u8] = if self.use_base_name {
            basename(path)
        } else {
            path
        };
        let mut wanted = false;
        let mut full = path.to_vec();
        for rule in &self.rules {
            match rule {
                PathRule::FilterLiteral { pattern } if !wanted => {
                    wanted = dir_prefix_matches(pattern, match_key);
                }
                PathRule::FilterGlob { pattern } if !wanted => {
                    wanted = glob_match(pattern, match_key);
                }
                PathRule::FilterRegex { regex } if !wanted => {
                    wanted = regex.is_match(match_key);
                }
                PathRule::RenameLiteral { old, new } => {
                    if dir_prefix_matches(old, &full) {
                        full = replace_once(&full, old, new);
                    }
                }
                PathRule::RenameRegex { regex, replacement } => {
                    full = regex
                        .replace_all(&full, regex::bytes::NoExpand(replacement))
                        .into_owned();
                }
                _ => {}
            }
        }
        if wanted == self.inclusive {
            Some(full)
        } else {
            None
        }
    }
}

fn with_trailing_slash(dir: &[u8]) -> Vec<u8> {
    let mut out = dir.to_vec();
    if out.last() != Some(&b'/') {
        out.push(b'/');
    }
    out
}

pub fn basename(path: &[u8]) -> &[u8] {
    match memchr::memrchr(b'/', path) {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Whether `expr` matches `path` or a leading directory of it; the
/// expression may omit its trailing slash. An empty expression
/// matches everything.
fn dir_prefix_matches(expr: &[u8], path: &[u8]) -> bool {
    if expr.is_empty() {
        return true;
    }
    let n = expr.len();
    path.starts_with(expr)
        && (expr[n - 1] == b'/' || path.len() == n || path.get(n) == Some(&b'/'))
}

fn replace_once(path: &[u8], old: &[u8], new: &[u8]) -> Vec<u8> {
    if old.is_empty() {
        let mut out = new.to_vec();
        out.extend_from_slice(path);
        return out;
    }
    match path.windows(old.len()).position(|w| w == old) {
        Some(pos) => {
            let mut out = Vec::with_capacity(path.len() - old.len() + new.len());
            out.extend_from_slice(&path[..pos]);
            out.extend_from_slice(new);
            out.extend_from_slice(&path[pos + old.len()..]);
            out
        }
        None => path.to_vec(),
    }
}

/// Byte-level glob match: `*` matches within a path component, `**`
/// crosses components, `?` matches one non-slash byte.
pub fn glob_match(pat: &[u8], text: &[u8]) -> bool {
    if pat.is_empty() {
        return text.is_empty();
    }
    if pat[0] == b'*' && pat.get(1) == Some(&b'*') {
        let mut rest = &pat[2..];
        if rest.first() == Some(&b'/') {
            rest = &rest[1..];
        }
        let mut i = 0usize;
        loop {
            if glob_match(rest, &text[i..]) {
                return true;
            }
            if i >= text.len() {
                return false;
            }
            i += 1;
        }
    }
    if pat[0] == b'*' {
        let rest = &pat[1..];
        let mut i = 0usize;
        loop {
            if glob_match(rest, &text[i..]) {
                return true;
            }
            if i >= text.len() || text[i] == b'/' {
                return false;
            }
            i += 1;
        }
    }
    if pat[0] == b'?' {
        return !text.is_empty() && text[0] != b'/' && glob_match(&pat[1..], &text[1..]);
    }
    !text.is_empty() && pat[0] == text[0] && glob_match(&pat[1..], &text[1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(pattern: &[u8]) -> PathRule {
        PathRule::FilterLiteral {
            pattern: pattern.to_vec(),
        }
    }

    #[test]
    fn literal_filter_matches_directory_boundaries() {
        let t = PathTransform::new(vec![filter(b"guides")], false, false).unwrap();
        assert_eq!(t.rewrite(b"guides/a.txt"), Some(b"guides/a.txt".to_vec()));
        assert_eq!(t.rewrite(b"guides"), Some(b"guides".to_vec()));
        assert_eq!(t.rewrite(b"guidesX/a.txt"), None);
        assert_eq!(t.rewrite(b"tools/b.c"), None);
    }

    #[test]
    fn inverted_filter_drops_matches() {
        let t = PathTransform::new(vec![filter(b"secrets/")], false, true).unwrap();
        assert_eq!(t.rewrite(b"secrets/key"), None);
        assert_eq!(t.rewrite(b"src/lib.rs"), Some(b"src/lib.rs".to_vec()));
    }

    #[test]
    fn no_rules_keeps_everything() {
        let t = PathTransform::new(Vec::new(), false, false).unwrap();
        assert_eq!(t.rewrite(b"anything"), Some(b"anything".to_vec()));
    }

    #[test]
    fn rename_without_filter_keeps_and_renames() {
        let rules = vec![PathRule::rename_literal(b"old/".to_vec(), b"new/".to_vec()).unwrap()];
        let t = PathTransform::new(rules, false, false).unwrap();
        assert_eq!(t.rewrite(b"old/file"), Some(b"new/file".to_vec()));
        assert_eq!(t.rewrite(b"other/file"), Some(b"other/file".to_vec()));
    }

    #[test]
    fn subdirectory_filter_strips_prefix() {
        let rules = PathTransform::subdirectory_filter(b"guides").unwrap();
        let t = PathTransform::new(rules, false, false).unwrap();
        assert_eq!(t.rewrite(b"guides/a/b.txt"), Some(b"a/b.txt".to_vec()));
        assert_eq!(t.rewrite(b"README"), None);
    }

    #[test]
    fn to_subdirectory_filter_prepends_prefix() {
        let rules = PathTransform::to_subdirectory_filter(b"module/").unwrap();
        let t = PathTransform::new(rules, false, false).unwrap();
        assert_eq!(t.rewrite(b"a.txt"), Some(b"module/a.txt".to_vec()));
    }

    #[test]
    fn mismatched_trailing_slash_is_rejected() {
        assert!(PathRule::rename_literal(b"old/".to_vec(), b"new".to_vec()).is_err());
        assert!(PathRule::rename_literal(b"old".to_vec(), b"new/".to_vec()).is_err());
        assert!(PathRule::rename_literal(b"old/".to_vec(), b"new/".to_vec()).is_ok());
        assert!(PathRule::rename_literal(Vec::new(), b"new/".to_vec()).is_ok());
    }

    #[test]
    fn basename_matching_uses_final_component() {
        let t = PathTransform::new(vec![filter(b"Makefile")], true, false).unwrap();
        assert_eq!(t.rewrite(b"deep/dir/Makefile"), Some(b"deep/dir/Makefile".to_vec()));
        assert_eq!(t.rewrite(b"deep/dir/other"), None);
    }

    #[test]
    fn basename_with_rename_is_rejected() {
        let rules = vec![
            filter(b"x"),
            PathRule::rename_literal(b"a".to_vec(), b"b".to_vec()).unwrap(),
        ];
        assert!(PathTransform::new(rules, true, false).is_err());
    }

    #[test]
    fn glob_semantics() {
        assert!(glob_match(b"*.txt", b"note.txt"));
        assert!(!glob_match(b"*.txt", b"dir/note.txt"));
        assert!(glob_match(b"**/*.txt", b"dir/sub/note.txt"));
        assert!(glob_match(b"src/?ain.rs", b"src/main.rs"));
        assert!(!glob_match(b"src/?ain.rs", b"src//ain.rs"));
    }

    #[test]
    fn regex_rules() {
        let t = PathTransform::new(
            vec![
                PathRule::FilterRegex {
                    regex: Regex::new(r"\.md$").unwrap(),
                },
                PathRule::RenameRegex {
                    regex: Regex::new(r"^docs/").unwrap(),
                    replacement: b"manual/".to_vec(),
                },
            ],
            false,
            false,
        )
        .unwrap();
        assert_eq!(t.rewrite(b"docs/guide.md"), Some(b"manual/guide.md".to_vec()));
        assert_eq!(t.rewrite(b"docs/guide.rst"), None);
    }

    #[test]
    fn filters_match_original_path_not_renamed() {
        // The rename runs first in declaration order, but filter rules
        // still see the original path.
        let rules = vec![
            PathRule::rename_literal(b"guides/".to_vec(), Vec::new()).unwrap(),
            filter(b"guides/"),
        ];
        let t = PathTransform::new(rules, false, false).unwrap();
        assert_eq!(t.rewrite(b"guides/a.txt"), Some(b"a.txt".to_vec()));
        assert_eq!(t.rewrite(b"a.txt"), None);
    }
}
