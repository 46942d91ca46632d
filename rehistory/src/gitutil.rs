use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::elements::{FileChange, ParentRef};
use crate::pathquoting;

fn run_git(repo: &Path, args: &[&str]) -> io::Result<Vec<u8>> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .output()
        .map_err(|e| io::Error::new(e.kind(), format!("failed to run git: {e}")))?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "git {} failed in {:?}: {}",
            args.join(" "),
            repo,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output.stdout)
}

pub fn git_dir(repo: &Path) -> io::Result<PathBuf> {
    let out = run_git(repo, &["rev-parse", "--git-dir"])?;
    let dir = String::from_utf8_lossy(&out).trim().to_string();
    let path = PathBuf::from(dir);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(repo.join(path))
    }
}

pub fn is_bare(repo: &Path) -> io::Result<bool> {
    let out = run_git(repo, &["rev-parse", "--is-bare-repository"])?;
    Ok(out.starts_with(b"true"))
}

pub fn worktree_is_clean(repo: &Path) -> io::Result<bool> {
    let out = run_git(repo, &["status", "--porcelain"])?;
    Ok(out.is_empty())
}

/// Snapshot of `refname -> hash` for every ref in the repository.
pub fn get_refs(repo: &Path) -> io::Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(["show-ref"])
        .output()
        .map_err(|e| io::Error::new(e.kind(), format!("failed to run git show-ref: {e}")))?;
    // show-ref exits nonzero in an empty repository; that just means
    // no refs yet.
    let mut refs = BTreeMap::new();
    for line in output.stdout.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        if let Some(pos) = line.iter().position(|&b| b == b' ') {
            let hash = line[..pos].to_vec();
            let name = line[pos + 1..].to_vec();
            refs.insert(name, hash);
        }
    }
    Ok(refs)
}

/// Whether the installed `git fast-export` understands `flag`.
pub fn exporter_supports(flag: &str) -> bool {
    let output = Command::new("git")
        .args(["fast-export", "-h"])
        .output();
    match output {
        // -h exits nonzero but still prints usage.
        Ok(out) => {
            let mut text = out.stdout;
            text.extend_from_slice(&out.stderr);
            String::from_utf8_lossy(&text).contains(flag)
        }
        Err(_) => false,
    }
}

/// Diff two commits in the source repository and express the result
/// as file changes against `parent_hash`, mapping blob ids we have
/// already renumbered back to their marks.
pub fn get_file_changes(
    repo: &Path,
    parent_hash: &[u8],
    commit_hash: &[u8],
    hash_to_mark: &HashMap<Vec<u8>, u32>,
) -> io::Result<Vec<FileChange>> {
    let parent = String::from_utf8_lossy(parent_hash).to_string();
    let commit = String::from_utf8_lossy(commit_hash).to_string();
    let out = run_git(repo, &["diff-tree", "-r", &parent, &commit])?;
    let mut changes = Vec::new();
    for line in out.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let tab = line
            .iter()
            .position(|&b| b == b'\t')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad diff-tree line"))?;
        let fileinfo = &line[..tab];
        let path = pathquoting::dequote(&line[tab + 1..]);
        let fields: Vec<&[u8]> = fileinfo
            .split(|&b| b == b' ')
            .filter(|f| !f.is_empty())
            .collect();
        if fields.len() < 5 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad diff-tree line",
            ));
        }
        let mode = fields[1].to_vec();
        let new_hash = fields[3];
        let changetype = fields[4];
        match changetype.first() {
            Some(b'D') => changes.push(FileChange::Delete { path }),
            Some(b'A') | Some(b'M') => {
                let blob = match hash_to_mark.get(new_hash) {
                    Some(&mark) => ParentRef::Mark(mark),
                    None => ParentRef::Hash(new_hash.to_vec()),
                };
                changes.push(FileChange::Modify { mode, blob, path });
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "unknown diff-tree change type {:?}",
                        String::from_utf8_lossy(changetype)
                    ),
                ))
            }
        }
    }
    Ok(changes)
}

/// Batch `update-ref` edits, used for replace-ref disposition.
pub fn update_refs_stdin(repo: &Path, edits: &[Vec<u8>]) -> io::Result<()> {
    if edits.is_empty() {
        return Ok(());
    }
    let mut child = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(["update-ref", "--stdin"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| io::Error::new(e.kind(), format!("failed to run git update-ref: {e}")))?;
    {
        let stdin = child.stdin.as_mut().expect("piped stdin");
        for edit in edits {
            stdin.write_all(edit)?;
        }
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "git update-ref failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
