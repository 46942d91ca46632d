use std::collections::HashSet;
use std::io::{self, BufRead};
use std::path::PathBuf;

use regex::bytes::Regex;
use serde::Deserialize;

use crate::pathfilter::{PathRule, PathTransform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PruneMode {
    Always,
    #[default]
    Auto,
    Never,
}

impl PruneMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "always" => Some(PruneMode::Always),
            "auto" => Some(PruneMode::Auto),
            "never" => Some(PruneMode::Never),
            _ => None,
        }
    }
}

/// Disposition of refs/replace/* refs pointing old commit ids at
/// their rewritten counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplaceRefs {
    DeleteNoAdd,
    DeleteAndAdd,
    UpdateNoAdd,
    UpdateOrAdd,
    #[default]
    UpdateAndAdd,
}

impl ReplaceRefs {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "delete-no-add" => Some(ReplaceRefs::DeleteNoAdd),
            "delete-and-add" => Some(ReplaceRefs::DeleteAndAdd),
            "update-no-add" => Some(ReplaceRefs::UpdateNoAdd),
            "update-or-add" => Some(ReplaceRefs::UpdateOrAdd),
            "update-and-add" => Some(ReplaceRefs::UpdateAndAdd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    pub source: PathBuf,
    pub target: PathBuf,
    /// Refs handed to the exporter; a non-default set implies partial.
    pub refs: Vec<String>,
    pub path_rules: Vec<PathRule>,
    pub use_base_name: bool,
    pub invert_paths: bool,
    pub replace_text_file: Option<PathBuf>,
    pub replace_message_file: Option<PathBuf>,
    pub max_blob_size: Option<usize>,
    pub strip_blobs_with_ids: Option<PathBuf>,
    pub tag_rename: Option<(Vec<u8>, Vec<u8>)>,
    pub mailmap_file: Option<PathBuf>,
    pub preserve_commit_hashes: bool,
    pub preserve_commit_encoding: bool,
    pub replace_refs: ReplaceRefs,
    pub prune_empty: PruneMode,
    pub prune_degenerate: PruneMode,
    pub partial: bool,
    pub stdin: bool,
    pub dry_run: bool,
    pub quiet: bool,
    pub force: bool,
    /// Exporter capability, detected at run start.
    pub mark_tags: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            source: PathBuf::from("."),
            target: PathBuf::from("."),
            refs: vec!["--all".to_string()],
            path_rules: Vec::new(),
            use_base_name: false,
            invert_paths: false,
            replace_text_file: None,
            replace_message_file: None,
            max_blob_size: None,
            strip_blobs_with_ids: None,
            tag_rename: None,
            mailmap_file: None,
            preserve_commit_hashes: false,
            preserve_commit_encoding: false,
            replace_refs: ReplaceRefs::default(),
            prune_empty: PruneMode::default(),
            prune_degenerate: PruneMode::default(),
            partial: false,
            stdin: false,
            dry_run: false,
            quiet: false,
            force: false,
            mark_tags: true,
        }
    }
}

impl Options {
    /// Validate the rule set and build the path transform. Surfaces
    /// configuration errors before any stream I/O happens.
    pub fn build_path_transform(&self) -> io::Result<PathTransform> {
        PathTransform::new(self.path_rules.clone(), self.use_base_name, self.invert_paths)
    }
}

fn bad_input(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

/// Parse a size with an optional K/M/G suffix.
pub fn parse_size(s: &str) -> io::Result<usize> {
    let (digits, mult) = match s.as_bytes().last() {
        Some(b'K') => (&s[..s.len() - 1], 1024usize),
        Some(b'M') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let n: usize = digits
        .parse()
        .map_err(|_| bad_input(format!("could not parse blob size argument {s}")))?;
    Ok(n * mult)
}

fn parse_rename_pair(s: &str) -> io::Result<(Vec<u8>, Vec<u8>)> {
    match s.split_once(':') {
        Some((old, new)) => Ok((old.as_bytes().to_vec(), new.as_bytes().to_vec())),
        None => Err(bad_input(format!("expected OLD:NEW, got {s}"))),
    }
}

/// Load the 40-hex ids named by --strip-blobs-with-ids.
pub fn load_blob_id_file(path: &std::path::Path) -> io::Result<HashSet<Vec<u8>>> {
    let file = std::fs::File::open(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("failed to read blob id list {}: {e}", path.display()),
        )
    })?;
    let mut ids = HashSet::new();
    for line in io::BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.len() == 40 && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            ids.insert(trimmed.to_ascii_lowercase().into_bytes());
        }
    }
    Ok(ids)
}

/// Rules from --paths-from-file: one path per line, `glob:`/`regex:`
/// prefixes select the match kind, `==>` introduces a rename.
pub fn load_path_rules_file(path: &std::path::Path) -> io::Result<Vec<PathRule>> {
    let content = std::fs::read(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("failed to read path rules {}: {e}", path.display()),
        )
    })?;
    let mut rules = Vec::new();
    for raw in content.split(|&b| b == b'\n') {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.is_empty() || raw.starts_with(b"#") {
            continue;
        }
        let (pattern, rename_to) = match crate::replace::find_subslice(raw, b"==>") {
            Some(pos) => (&raw[..pos], Some(raw[pos + 3..].to_vec())),
            None => (raw, None),
        };
        if let Some(rest) = pattern.strip_prefix(b"regex:") {
            let regex = bytes_regex(rest)?;
            match rename_to {
                Some(repl) => rules.push(PathRule::RenameRegex {
                    regex,
                    replacement: repl,
                }),
                None => rules.push(PathRule::FilterRegex { regex }),
            }
        } else if let Some(rest) = pattern.strip_prefix(b"glob:") {
            if rename_to.is_some() {
                return Err(bad_input(
                    "'glob:' and '==>' are incompatible (renaming globs makes no sense)"
                        .to_string(),
                ));
            }
            rules.push(PathRule::FilterGlob {
                pattern: rest.to_vec(),
            });
        } else {
            let literal = pattern.strip_prefix(b"literal:").unwrap_or(pattern);
            match rename_to {
                Some(new) => rules.push(PathRule::rename_literal(literal.to_vec(), new)?),
                None => rules.push(PathRule::FilterLiteral {
                    pattern: literal.to_vec(),
                }),
            }
        }
    }
    Ok(rules)
}

fn bytes_regex(pattern: &[u8]) -> io::Result<Regex> {
    let s = std::str::from_utf8(pattern)
        .map_err(|e| bad_input(format!("invalid UTF-8 in path regex: {e}")))?;
    Regex::new(s).map_err(|e| bad_input(format!("invalid path regex: {e}")))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    filter: Option<FilterSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilterSection {
    source: Option<PathBuf>,
    target: Option<PathBuf>,
    refs: Option<Vec<String>>,
    paths: Option<Vec<String>>,
    path_globs: Option<Vec<String>>,
    path_regexes: Option<Vec<String>>,
    path_renames: Option<Vec<String>>,
    subdirectory_filter: Option<String>,
    to_subdirectory_filter: Option<String>,
    use_base_name: Option<bool>,
    invert_paths: Option<bool>,
    replace_text: Option<PathBuf>,
    replace_message: Option<PathBuf>,
    max_blob_size: Option<String>,
    strip_blobs_with_ids: Option<PathBuf>,
    tag_rename: Option<String>,
    mailmap: Option<PathBuf>,
    preserve_commit_hashes: Option<bool>,
    preserve_commit_encoding: Option<bool>,
    replace_refs: Option<String>,
    prune_empty: Option<String>,
    prune_degenerate: Option<String>,
    partial: Option<bool>,
    quiet: Option<bool>,
}

fn apply_config_file(opts: &mut Options, path: &std::path::Path) -> io::Result<()> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("failed to read config {}: {e}", path.display()),
        )
    })?;
    let config: ConfigFile = toml::from_str(&text)
        .map_err(|e| bad_input(format!("invalid config {}: {e}", path.display())))?;
    let Some(filter) = config.filter else {
        return Ok(());
    };
    if let Some(v) = filter.source {
        opts.source = v;
    }
    if let Some(v) = filter.target {
        opts.target = v;
    }
    if let Some(v) = filter.refs {
        opts.refs = v;
        opts.partial = true;
    }
    if let Some(dir) = filter.subdirectory_filter {
        opts.path_rules
            .extend(PathTransform::subdirectory_filter(dir.as_bytes())?);
    }
    if let Some(dir) = filter.to_subdirectory_filter {
        opts.path_rules
            .extend(PathTransform::to_subdirectory_filter(dir.as_bytes())?);
    }
    for p in filter.paths.unwrap_or_default() {
        opts.path_rules.push(PathRule::FilterLiteral {
            pattern: p.into_bytes(),
        });
    }
    for p in filter.path_globs.unwrap_or_default() {
        opts.path_rules.push(PathRule::FilterGlob {
            pattern: p.into_bytes(),
        });
    }
    for p in filter.path_regexes.unwrap_or_default() {
        opts.path_rules.push(PathRule::FilterRegex {
            regex: bytes_regex(p.as_bytes())?,
        });
    }
    for p in filter.path_renames.unwrap_or_default() {
        let (old, new) = parse_rename_pair(&p)?;
        opts.path_rules.push(PathRule::rename_literal(old, new)?);
    }
    if let Some(v) = filter.use_base_name {
        opts.use_base_name = v;
    }
    if let Some(v) = filter.invert_paths {
        opts.invert_paths = v;
    }
    if let Some(v) = filter.replace_text {
        opts.replace_text_file = Some(v);
    }
    if let Some(v) = filter.replace_message {
        opts.replace_message_file = Some(v);
    }
    if let Some(v) = filter.max_blob_size {
        opts.max_blob_size = Some(parse_size(&v)?);
    }
    if let Some(v) = filter.strip_blobs_with_ids {
        opts.strip_blobs_with_ids = Some(v);
    }
    if let Some(v) = filter.tag_rename {
        opts.tag_rename = Some(parse_rename_pair(&v)?);
    }
    if let Some(v) = filter.mailmap {
        opts.mailmap_file = Some(v);
    }
    if let Some(v) = filter.preserve_commit_hashes {
        opts.preserve_commit_hashes = v;
    }
    if let Some(v) = filter.preserve_commit_encoding {
        opts.preserve_commit_encoding = v;
    }
    if let Some(v) = filter.replace_refs {
        opts.replace_refs =
            ReplaceRefs::parse(&v).ok_or_else(|| bad_input(format!("bad replace-refs: {v}")))?;
    }
    if let Some(v) = filter.prune_empty {
        opts.prune_empty =
            PruneMode::parse(&v).ok_or_else(|| bad_input(format!("bad prune-empty: {v}")))?;
    }
    if let Some(v) = filter.prune_degenerate {
        opts.prune_degenerate = PruneMode::parse(&v)
            .ok_or_else(|| bad_input(format!("bad prune-degenerate: {v}")))?;
    }
    if let Some(v) = filter.partial {
        opts.partial = v;
    }
    if let Some(v) = filter.quiet {
        opts.quiet = v;
    }
    Ok(())
}

const USAGE: &str = "\
rehistory [OPTIONS]

Rewrite repository history by filtering a fast-export stream.

Path selection (rules apply in the order given):
  --path PATH               keep paths equal to or under PATH
  --path-glob GLOB          keep paths matching GLOB
  --path-regex REGEX        keep paths matching REGEX
  --path-rename OLD:NEW     rename a path prefix
  --paths-from-file FILE    read rules from FILE
  --subdirectory-filter D   keep only D/ and make it the new root
  --to-subdirectory-filter D  move everything under D/
  --use-base-name           match filters against basenames
  --invert-paths            drop selected paths instead of keeping

Content rewriting:
  --replace-text FILE       replacement rules for blob contents
  --replace-message FILE    replacement rules for commit/tag messages
  --strip-blobs-bigger-than SIZE   drop blobs over SIZE (K/M/G ok)
  --strip-blobs-with-ids FILE      drop blobs listed by id in FILE
  --mailmap FILE            rewrite author/committer/tagger identities
  --tag-rename OLD:NEW      rename tags by prefix
  --preserve-commit-hashes  do not rewrite hashes in messages
  --preserve-commit-encoding  keep original message encoding

Pruning:
  --prune-empty MODE        always|auto|never (default auto)
  --prune-degenerate MODE   always|auto|never (default auto)
  --no-ff                   shorthand for --prune-degenerate=never

Run control:
  --source DIR --target DIR --refs REF (repeatable; implies --partial)
  --replace-refs MODE       delete-no-add|delete-and-add|update-no-add|
                            update-or-add|update-and-add
  --partial --stdin --dry-run --quiet --force --config FILE
";

/// Parse the command line, honoring --config first so explicit flags
/// win over file values.
pub fn parse_args() -> io::Result<Options> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    parse_arg_list(&args)
}

pub fn parse_arg_list(args: &[String]) -> io::Result<Options> {
    let mut opts = Options::default();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let value = iter
                .next()
                .ok_or_else(|| bad_input("--config requires a value".to_string()))?;
            apply_config_file(&mut opts, std::path::Path::new(value))?;
        }
    }

    let mut explicit_refs: Vec<String> = Vec::new();
    let mut i = 0usize;
    while i < args.len() {
        let arg = &args[i];
        i += 1;
        let mut value = |flag: &str| -> io::Result<String> {
            if i < args.len() {
                let v = args[i].clone();
                i += 1;
                Ok(v)
            } else {
                Err(bad_input(format!("{flag} requires a value")))
            }
        };
        match arg.as_str() {
            "--help" | "-h" => {
                print!("{USAGE}");
                std::process::exit(0);
            }
            "--config" => {
                value("--config")?;
            }
            "--source" => opts.source = PathBuf::from(value("--source")?),
            "--target" => opts.target = PathBuf::from(value("--target")?),
            "--refs" => explicit_refs.push(value("--refs")?),
            "--path" => opts.path_rules.push(PathRule::FilterLiteral {
                pattern: value("--path")?.as_bytes().to_vec(),
            }),
            "--path-glob" => opts.path_rules.push(PathRule::FilterGlob {
                pattern: value("--path-glob")?.as_bytes().to_vec(),
            }),
            "--path-regex" => opts.path_rules.push(PathRule::FilterRegex {
                regex: bytes_regex(value("--path-regex")?.as_bytes())?,
            }),
            "--path-rename" => {
                let (old, new) = parse_rename_pair(&value("--path-rename")?)?;
                opts.path_rules.push(PathRule::rename_literal(old, new)?);
            }
            "--paths-from-file" => {
                let rules = load_path_rules_file(std::path::Path::new(&value("--paths-from-file")?))?;
                opts.path_rules.extend(rules);
            }
            "--subdirectory-filter" => {
                let dir = value("--subdirectory-filter")?;
                opts.path_rules
                    .extend(PathTransform::subdirectory_filter(dir.as_bytes())?);
            }
            "--to-subdirectory-filter" => {
                let dir = value("--to-subdirectory-filter")?;
                opts.path_rules
                    .extend(PathTransform::to_subdirectory_filter(dir.as_bytes())?);
            }
            "--use-base-name" => opts.use_base_name = true,
            "--invert-paths" => opts.invert_paths = true,
            "--replace-text" => {
                opts.replace_text_file = Some(PathBuf::from(value("--replace-text")?))
            }
            "--replace-message" => {
                opts.replace_message_file = Some(PathBuf::from(value("--replace-message")?))
            }
            "--strip-blobs-bigger-than" => {
                opts.max_blob_size = Some(parse_size(&value("--strip-blobs-bigger-than")?)?)
            }
            "--strip-blobs-with-ids" => {
                opts.strip_blobs_with_ids =
                    Some(PathBuf::from(value("--strip-blobs-with-ids")?))
            }
            "--tag-rename" => opts.tag_rename = Some(parse_rename_pair(&value("--tag-rename")?)?),
            "--mailmap" => opts.mailmap_file = Some(PathBuf::from(value("--mailmap")?)),
            "--preserve-commit-hashes" => opts.preserve_commit_hashes = true,
            "--preserve-commit-encoding" => opts.preserve_commit_encoding = true,
            "--replace-refs" => {
                let v = value("--replace-refs")?;
                opts.replace_refs = ReplaceRefs::parse(&v)
                    .ok_or_else(|| bad_input(format!("bad --replace-refs value: {v}")))?;
            }
            "--prune-empty" => {
                let v = value("--prune-empty")?;
                opts.prune_empty = PruneMode::parse(&v)
                    .ok_or_else(|| bad_input(format!("bad --prune-empty value: {v}")))?;
            }
            "--prune-degenerate" => {
                let v = value("--prune-degenerate")?;
                opts.prune_degenerate = PruneMode::parse(&v)
                    .ok_or_else(|| bad_input(format!("bad --prune-degenerate value: {v}")))?;
            }
            "--no-ff" => opts.prune_degenerate = PruneMode::Never,
            "--partial" => opts.partial = true,
            "--stdin" => opts.stdin = true,
            "--dry-run" => opts.dry_run = true,
            "--quiet" => opts.quiet = true,
            "--force" | "-f" => opts.force = true,
            other => {
                return Err(bad_input(format!(
                    "unrecognized argument: {other} (see --help)"
                )))
            }
        }
    }
    if !explicit_refs.is_empty() {
        opts.refs = explicit_refs;
        opts.partial = true;
    }
    // Surface rule conflicts now rather than mid-stream.
    opts.build_path_transform()?;
    Ok(opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> io::Result<Options> {
        let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        parse_arg_list(&owned)
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let opts = Options::default();
        assert_eq!(opts.prune_empty, PruneMode::Auto);
        assert_eq!(opts.prune_degenerate, PruneMode::Auto);
        assert_eq!(opts.replace_refs, ReplaceRefs::UpdateAndAdd);
        assert!(opts.mark_tags);
    }

    #[test]
    fn path_rules_keep_declaration_order() {
        let opts = parse(&[
            "--path-rename",
            "old/:new/",
            "--path",
            "keep/",
            "--invert-paths",
        ])
        .unwrap();
        assert_eq!(opts.path_rules.len(), 2);
        assert!(matches!(opts.path_rules[0], PathRule::RenameLiteral { .. }));
        assert!(matches!(opts.path_rules[1], PathRule::FilterLiteral { .. }));
        assert!(opts.invert_paths);
    }

    #[test]
    fn subdirectory_filter_expands_to_filter_plus_rename() {
        let opts = parse(&["--subdirectory-filter", "guides"]).unwrap();
        assert_eq!(opts.path_rules.len(), 2);
        assert!(matches!(
            &opts.path_rules[0],
            PathRule::FilterLiteral { pattern } if pattern == b"guides/"
        ));
        assert!(matches!(
            &opts.path_rules[1],
            PathRule::RenameLiteral { old, new } if old == b"guides/" && new.is_empty()
        ));
    }

    #[test]
    fn refs_imply_partial() {
        let opts = parse(&["--refs", "refs/heads/main"]).unwrap();
        assert!(opts.partial);
        assert_eq!(opts.refs, vec!["refs/heads/main".to_string()]);
    }

    #[test]
    fn conflicting_rules_rejected_at_parse_time() {
        assert!(parse(&["--use-base-name", "--path-rename", "a:b"]).is_err());
        assert!(parse(&["--path-rename", "a/:b"]).is_err());
        assert!(parse(&["--tag-rename", "nocolon"]).is_err());
        assert!(parse(&["--bogus-flag"]).is_err());
    }

    #[test]
    fn config_file_provides_base_values() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("run.toml");
        std::fs::write(
            &config,
            "[filter]\npaths = [\"src/\"]\nprune_empty = \"never\"\nquiet = true\n",
        )
        .unwrap();
        let opts = parse(&["--config", config.to_str().unwrap()]).unwrap();
        assert_eq!(opts.path_rules.len(), 1);
        assert_eq!(opts.prune_empty, PruneMode::Never);
        assert!(opts.quiet);
    }

    #[test]
    fn cli_wins_over_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("run.toml");
        std::fs::write(&config, "[filter]\nprune_empty = \"never\"\n").unwrap();
        let opts = parse(&[
            "--config",
            config.to_str().unwrap(),
            "--prune-empty",
            "always",
        ])
        .unwrap();
        assert_eq!(opts.prune_empty, PruneMode::Always);
    }

    #[test]
    fn paths_from_file_rules() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules.txt");
        std::fs::write(
            &rules,
            "# keep docs\ndocs/\nglob:*.md\nregex:^src/.*\\.rs$\nold/==>new/\n",
        )
        .unwrap();
        let loaded = load_path_rules_file(&rules).unwrap();
        assert_eq!(loaded.len(), 4);
        assert!(matches!(loaded[0], PathRule::FilterLiteral { .. }));
        assert!(matches!(loaded[1], PathRule::FilterGlob { .. }));
        assert!(matches!(loaded[2], PathRule::FilterRegex { .. }));
        assert!(matches!(loaded[3], PathRule::RenameLiteral { .. }));
    }
}
