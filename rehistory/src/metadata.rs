//! Persisted run results under `<git-dir>/filter-repo/`: the old to
//! new commit map, the ref map, the human-readable issue report, a
//! JSON run summary, and the marker that lets a repeat run proceed
//! without --force.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use serde::Serialize;

use crate::engine::{RunSummary, ZERO_HASH};
use crate::gitutil;
use crate::opts::ReplaceRefs;

pub const ALREADY_RAN_FILE: &str = "already_ran";

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub commits_parsed: u64,
    pub commits_pruned: u64,
    pub blobs_stripped: u64,
    pub commits_no_longer_merges: usize,
    pub hashes_referenced_but_removed: usize,
}

pub fn already_ran(results_dir: &Path) -> bool {
    results_dir.join(ALREADY_RAN_FILE).exists()
}

pub fn record_metadata(
    results_dir: &Path,
    target: &Path,
    summary: &RunSummary,
    orig_refs: &BTreeMap<Vec<u8>, Vec<u8>>,
    report: &RunReport,
) -> io::Result<()> {
    write_commit_map(results_dir, summary)?;
    write_ref_map(results_dir, target, summary, orig_refs)?;
    write_suboptimal_issues(results_dir, summary)?;

    let json = serde_json::to_vec_pretty(report)
        .map_err(|e| io::Error::other(format!("failed to serialize run report: {e}")))?;
    std::fs::write(results_dir.join("report.json"), json)?;

    std::fs::write(
        results_dir.join(ALREADY_RAN_FILE),
        "This file exists to allow you to filter again without --force.\n",
    )?;
    Ok(())
}

fn write_commit_map(results_dir: &Path, summary: &RunSummary) -> io::Result<()> {
    let mut f = File::create(results_dir.join("commit-map"))?;
    writeln!(f, "{:<40} {}", "old", "new")?;
    for (old, new) in &summary.commit_map {
        f.write_all(old)?;
        f.write_all(b" ")?;
        f.write_all(new.as_deref().unwrap_or(ZERO_HASH))?;
        f.write_all(b"\n")?;
    }
    Ok(())
}

fn write_ref_map(
    results_dir: &Path,
    target: &Path,
    summary: &RunSummary,
    orig_refs: &BTreeMap<Vec<u8>, Vec<u8>>,
) -> io::Result<()> {
    let renames: HashMap<&[u8], &Option<Vec<u8>>> = summary
        .commit_map
        .iter()
        .map(|(old, new)| (old.as_slice(), new))
        .collect();
    let mut batch_check: Option<BatchCheck> = None;
    let mut f = File::create(results_dir.join("ref-map"))?;
    for (refname, old_hash) in orig_refs {
        if !summary.exported_refs.contains(refname) {
            continue;
        }
        let new_hash: Vec<u8> = if !summary.imported_refs.contains(refname) {
            ZERO_HASH.to_vec()
        } else if let Some(new) = renames.get(old_hash.as_slice()) {
            match new {
                Some(n) => n.clone(),
                None => ZERO_HASH.to_vec(),
            }
        } else {
            // Annotated tag, or a ref whose tip was pruned; ask the
            // freshly written repository.
            if batch_check.is_none() {
                batch_check = Some(BatchCheck::spawn(target)?);
            }
            batch_check.as_mut().unwrap().resolve(refname)?
        };
        f.write_all(old_hash)?;
        f.write_all(b" ")?;
        f.write_all(&new_hash)?;
        f.write_all(b" ")?;
        f.write_all(refname)?;
        f.write_all(b"\n")?;
    }
    // Refs that only exist after the run (e.g. renamed tags) get a
    // zero old hash.
    let new_refs = gitutil::get_refs(target)?;
    for (refname, new_hash) in &new_refs {
        if !orig_refs.contains_key(refname) && !refname.starts_with(b"refs/replace/") {
            f.write_all(ZERO_HASH)?;
            f.write_all(b" ")?;
            f.write_all(new_hash)?;
            f.write_all(b" ")?;
            f.write_all(refname)?;
            f.write_all(b"\n")?;
        }
    }
    Ok(())
}

fn write_suboptimal_issues(results_dir: &Path, summary: &RunSummary) -> io::Result<()> {
    let mut f = File::create(results_dir.join("suboptimal-issues"))?;
    let mut issues_found = false;
    if !summary.no_longer_merges.is_empty() {
        issues_found = true;
        f.write_all(
            b"The following commits used to be merge commits but due to filtering\n\
              are now regular commits; they likely have suboptimal commit messages\n\
              (e.g. \"Merge branch next into master\").  Original commit hash on the\n\
              left, commit hash after filtering/rewriting on the right:\n",
        )?;
        for (old, new) in &summary.no_longer_merges {
            f.write_all(b"  ")?;
            f.write_all(old)?;
            f.write_all(b" ")?;
            f.write_all(new.as_deref().unwrap_or(ZERO_HASH))?;
            f.write_all(b"\n")?;
        }
        f.write_all(b"\n")?;
    }
    if !summary.referenced_but_removed.is_empty() {
        issues_found = true;
        f.write_all(
            b"The following commits were filtered out, but referenced in another\n\
              commit message.  The reference to the now-nonexistent commit hash\n\
              (or a substring thereof) was left as-is in any commit messages:\n",
        )?;
        for reference in &summary.referenced_but_removed {
            f.write_all(b"  ")?;
            f.write_all(reference)?;
            f.write_all(b"\n")?;
        }
        f.write_all(b"\n")?;
    }
    if !issues_found {
        f.write_all(b"No filtering problems encountered.\n")?;
    }
    Ok(())
}

/// Point refs/replace/<old> at the rewritten commits, per the
/// configured disposition.
pub fn update_replace_refs(
    target: &Path,
    mode: ReplaceRefs,
    commit_map: &[(Vec<u8>, Option<Vec<u8>>)],
) -> io::Result<()> {
    let existing: Vec<Vec<u8>> = gitutil::get_refs(target)?
        .into_keys()
        .filter(|r| r.starts_with(b"refs/replace/"))
        .collect();
    let mut edits: Vec<Vec<u8>> = Vec::new();
    let delete_existing = matches!(mode, ReplaceRefs::DeleteNoAdd | ReplaceRefs::DeleteAndAdd);
    if delete_existing {
        for refname in &existing {
            let mut edit = b"delete ".to_vec();
            edit.extend_from_slice(refname);
            edit.push(b'\n');
            edits.push(edit);
        }
    }
    let add = |edits: &mut Vec<Vec<u8>>, old: &[u8], new: &[u8]| {
        let mut edit = b"update refs/replace/".to_vec();
        edit.extend_from_slice(old);
        edit.push(b' ');
        edit.extend_from_slice(new);
        edit.push(b'\n');
        edits.push(edit);
    };
    match mode {
        ReplaceRefs::DeleteNoAdd => {}
        ReplaceRefs::DeleteAndAdd | ReplaceRefs::UpdateAndAdd | ReplaceRefs::UpdateOrAdd => {
            for (old, new) in commit_map {
                if let Some(new) = new {
                    if new != old {
                        add(&mut edits, old, new);
                    }
                }
            }
        }
        ReplaceRefs::UpdateNoAdd => {
            let renames: HashMap<&[u8], &Option<Vec<u8>>> = commit_map
                .iter()
                .map(|(old, new)| (old.as_slice(), new))
                .collect();
            for refname in &existing {
                let old = &refname[b"refs/replace/".len()..];
                if let Some(Some(new)) = renames.get(old) {
                    add(&mut edits, old, new);
                }
            }
        }
    }
    gitutil::update_refs_stdin(target, &edits)
}

struct BatchCheck {
    child: std::process::Child,
    stdout: BufReader<std::process::ChildStdout>,
}

impl BatchCheck {
    fn spawn(target: &Path) -> io::Result<Self> {
        let mut child = Command::new("git")
            .arg("-C")
            .arg(target)
            .args(["cat-file", "--batch-check"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| io::Error::new(e.kind(), format!("failed to run git cat-file: {e}")))?;
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
        Ok(BatchCheck { child, stdout })
    }

    fn resolve(&mut self, refname: &[u8]) -> io::Result<Vec<u8>> {
        let stdin = self.child.stdin.as_mut().expect("piped stdin");
        stdin.write_all(refname)?;
        stdin.write_all(b"\n")?;
        stdin.flush()?;
        let mut line = Vec::new();
        self.stdout.read_until(b'\n', &mut line)?;
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.ends_with(b" missing") {
            return Ok(ZERO_HASH.to_vec());
        }
        let fields: Vec<&[u8]> = line.split(|&b| b == b' ').collect();
        if fields.len() == 3
            && fields[0].len() == 40
            && (fields[1] == b"tag" || fields[1] == b"commit")
        {
            return Ok(fields[0].to_vec());
        }
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "failed to find new id for {}",
                String::from_utf8_lossy(refname)
            ),
        ))
    }
}

impl Drop for BatchCheck {
    fn drop(&mut self) {
        drop(self.child.stdin.take());
        let _ = self.child.wait();
    }
}
