mod common;
use common::*;

use rehistory::opts::PruneMode;
use rehistory::pathfilter::PathRule;
use rehistory::Options;

fn keep_only(prefix: &[u8]) -> Options {
    let mut opts = Options::default();
    opts.path_rules.push(PathRule::FilterLiteral {
        pattern: prefix.to_vec(),
    });
    opts
}

#[test]
fn prune_empty_never_keeps_emptied_commits() {
    let input = format!(
        "{}{}{}{}",
        blob(1, "keep"),
        commit(
            "refs/heads/main",
            2,
            None,
            &[],
            &["M 100644 :1 keep/a"],
            "base\n",
        ),
        blob(3, "drop"),
        commit(
            "refs/heads/main",
            4,
            None,
            &[],
            &["M 100644 :3 drop/x"],
            "emptied\n",
        ),
    );
    let mut opts = keep_only(b"keep/");
    opts.prune_empty = PruneMode::Never;
    let (out, summary) = run_no_importer(&opts, input.as_bytes());
    let text = out_str(&out);
    assert!(text.contains("data 8\nemptied\nfrom :2\n"));
    assert_eq!(summary.commits_pruned, 0);
}

#[test]
fn prune_empty_always_prunes_intentionally_empty_commits() {
    let c2 = oid('2');
    let input = format!(
        "{}{}{}",
        blob(1, "keep"),
        commit(
            "refs/heads/main",
            2,
            None,
            &[],
            &["M 100644 :1 keep/a"],
            "base\n",
        ),
        // No file changes at all in the input.
        commit("refs/heads/main", 3, Some(&c2), &[], &[], "marker\n"),
    );
    let mut opts = keep_only(b"keep/");
    opts.prune_empty = PruneMode::Always;
    let (out, summary) = run_no_importer(&opts, input.as_bytes());
    assert!(!out_str(&out).contains("marker"));
    assert_eq!(summary.commits_pruned, 1);
    assert_eq!(summary.commit_map, vec![(c2.into_bytes(), None)]);
}

#[test]
fn intentionally_empty_commit_survives_auto_when_parent_survives() {
    let input = format!(
        "{}{}{}",
        blob(1, "keep"),
        commit(
            "refs/heads/main",
            2,
            None,
            &[],
            &["M 100644 :1 keep/a"],
            "base\n",
        ),
        commit("refs/heads/main", 3, None, &[], &[], "marker\n"),
    );
    let opts = keep_only(b"keep/");
    let (out, summary) = run_no_importer(&opts, input.as_bytes());
    assert!(out_str(&out).contains("marker"));
    assert_eq!(summary.commits_pruned, 0);
}

#[test]
fn started_empty_commit_is_pruned_when_its_parent_was() {
    let c1 = oid('1');
    let c2 = oid('2');
    let input = format!(
        "{}{}{}",
        blob(1, "drop"),
        commit(
            "refs/heads/main",
            2,
            Some(&c1),
            &[],
            &["M 100644 :1 drop/x"],
            "doomed\n",
        ),
        commit("refs/heads/main", 3, Some(&c2), &[], &[], "marker\n"),
    );
    let opts = keep_only(b"keep/");
    let (out, summary) = run_no_importer(&opts, input.as_bytes());
    let text = out_str(&out);
    assert!(!text.contains("doomed"));
    assert!(!text.contains("marker"));
    assert_eq!(summary.commits_pruned, 2);
    // Neither commit has a surviving ancestor.
    assert_eq!(
        summary.commit_map,
        vec![(c1.into_bytes(), None), (c2.into_bytes(), None)]
    );
    // The branch tip was pruned away entirely.
    assert!(text.contains(&format!(
        "reset refs/heads/main\nfrom {}\n",
        "0".repeat(40)
    )));
}

#[test]
fn degenerate_merge_collapses_to_single_parent() {
    let c_base = oid('a');
    let c_side = oid('b');
    let c_merge = oid('c');
    let input = format!(
        "{}{}{}{}{}{}",
        blob(1, "keep"),
        commit(
            "refs/heads/main",
            2,
            Some(&c_base),
            &[],
            &["M 100644 :1 keep/a"],
            "base\n",
        ),
        blob(3, "side"),
        commit(
            "refs/heads/topic",
            4,
            Some(&c_side),
            &[],
            &["M 100644 :3 drop/x"],
            "side work\n",
        ),
        blob(5, "more"),
        commit(
            "refs/heads/main",
            6,
            Some(&c_merge),
            &[":2", ":4"],
            &["M 100644 :5 keep/b"],
            "merge topic\n",
        ),
    );
    let opts = keep_only(b"keep/");
    let (out, summary) = run_no_importer(&opts, input.as_bytes());
    let text = out_str(&out);
    // The side branch was pruned to nothing; its parent reference
    // vanishes and the merge becomes an ordinary commit.
    assert!(text.contains("data 12\nmerge topic\nfrom :2\n"));
    assert!(!text.contains("merge :"));
    assert_eq!(summary.no_longer_merges.len(), 1);
    assert_eq!(summary.no_longer_merges[0].0, c_merge.into_bytes());
    assert_eq!(summary.commits_pruned, 1);
}

#[test]
fn prune_degenerate_never_keeps_merge_parent_count() {
    let input = format!(
        "{}{}{}{}{}",
        blob(1, "keep"),
        commit(
            "refs/heads/main",
            2,
            None,
            &[],
            &["M 100644 :1 keep/a"],
            "base\n",
        ),
        blob(3, "side"),
        commit(
            "refs/heads/topic",
            4,
            None,
            &[":2"],
            &["M 100644 :3 keep/side"],
            "side\n",
        ),
        commit(
            "refs/heads/main",
            6,
            None,
            &[":2", ":4"],
            &[],
            "merge\n",
        ),
    );
    let mut opts = Options::default();
    opts.prune_degenerate = PruneMode::Never;
    opts.prune_empty = PruneMode::Never;
    let (out, _) = run_no_importer(&opts, input.as_bytes());
    let text = out_str(&out);
    assert!(text.contains("from :2\nmerge :4\n"));
}

#[test]
fn redundant_parent_is_trimmed_when_side_collapses_to_ancestor() {
    // topic's only commit is emptied, so the merge's second parent
    // rewrites to the first parent's own ancestor.
    let c_merge = oid('d');
    let input = format!(
        "{}{}{}{}{}{}",
        blob(1, "keep"),
        commit(
            "refs/heads/main",
            2,
            None,
            &[],
            &["M 100644 :1 keep/a"],
            "base\n",
        ),
        blob(3, "drop"),
        commit(
            "refs/heads/topic",
            4,
            None,
            &[":2"],
            &["M 100644 :3 drop/x"],
            "emptied side\n",
        ),
        blob(5, "more"),
        commit(
            "refs/heads/main",
            6,
            Some(&c_merge),
            &[":2", ":4"],
            &["M 100644 :5 keep/b"],
            "merge topic\n",
        ),
    );
    let opts = keep_only(b"keep/");
    let (out, summary) = run_no_importer(&opts, input.as_bytes());
    let text = out_str(&out);
    // Removing the duplicate would demote the merge to a non-merge,
    // so the parent list is kept as-is; only the prunability baseline
    // changes. The commit still merges the collapsed parent.
    assert!(text.contains("data 12\nmerge topic\nfrom :2\nmerge :2\n"));
    assert!(summary.no_longer_merges.is_empty());
}
