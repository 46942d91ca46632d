mod common;
use common::*;

use rehistory::elements::DumpState;
use rehistory::{Callbacks, Options};

#[test]
fn message_callback_rewrites_commit_messages() {
    let input = format!(
        "{}{}",
        blob(1, "content"),
        commit("refs/heads/main", 2, None, &[], &["M 100644 :1 a"], "wip\n"),
    );
    let mut callbacks = Callbacks::default();
    callbacks.message = Some(Box::new(|msg| {
        let mut out = b"[rewritten] ".to_vec();
        out.extend_from_slice(&msg);
        Ok(out)
    }));
    let (out, _) = run_with(&Options::default(), callbacks, input.as_bytes(), None).unwrap();
    assert!(out_str(&out).contains("data 16\n[rewritten] wip\n"));
}

#[test]
fn filename_callback_can_drop_and_rename_paths() {
    let input = format!(
        "{}{}",
        blob(1, "content"),
        commit(
            "refs/heads/main",
            2,
            None,
            &[],
            &["M 100644 :1 keep.txt", "M 100644 :1 drop.txt"],
            "c1\n",
        ),
    );
    let mut callbacks = Callbacks::default();
    callbacks.filename = Some(Box::new(|path| {
        Ok(path.and_then(|p| {
            if p == b"drop.txt" {
                None
            } else {
                let mut renamed = b"renamed/".to_vec();
                renamed.extend_from_slice(&p);
                Some(renamed)
            }
        }))
    }));
    let (out, _) = run_with(&Options::default(), callbacks, input.as_bytes(), None).unwrap();
    let text = out_str(&out);
    assert!(text.contains("M 100644 :1 renamed/keep.txt\n"));
    assert!(!text.contains("drop.txt"));
}

#[test]
fn blob_callback_sees_and_edits_data() {
    let input = format!(
        "{}{}",
        blob(1, "original"),
        commit("refs/heads/main", 2, None, &[], &["M 100644 :1 a"], "c1\n"),
    );
    let mut callbacks = Callbacks::default();
    callbacks.blob = Some(Box::new(|blob, _meta| {
        blob.data = b"edited".to_vec();
        Ok(())
    }));
    let (out, _) = run_with(&Options::default(), callbacks, input.as_bytes(), None).unwrap();
    let text = out_str(&out);
    assert!(text.contains("data 6\nedited\n"));
    assert!(!text.contains("original"));
}

#[test]
fn commit_callback_can_skip_a_commit() {
    let c1 = oid('1');
    let input = format!(
        "{}{}",
        blob(1, "content"),
        commit(
            "refs/heads/main",
            2,
            Some(&c1),
            &[],
            &["M 100644 :1 a"],
            "unwanted\n",
        ),
    );
    let mut callbacks = Callbacks::default();
    callbacks.commit = Some(Box::new(|commit, _meta| {
        commit.state = DumpState::Skipped;
        Ok(())
    }));
    let (out, summary) =
        run_with(&Options::default(), callbacks, input.as_bytes(), None).unwrap();
    assert!(!out_str(&out).contains("unwanted"));
    assert_eq!(summary.commit_map, vec![(c1.into_bytes(), None)]);
}

#[test]
fn refname_callback_must_keep_tags_under_refs_tags() {
    let input = format!(
        "{}{}{}",
        blob(1, "content"),
        commit("refs/heads/main", 2, None, &[], &["M 100644 :1 a"], "c1\n"),
        annotated_tag("v1", 3, ":2", None, "msg"),
    );
    let mut callbacks = Callbacks::default();
    callbacks.refname = Some(Box::new(|refname| {
        if refname.starts_with(b"refs/tags/") {
            Ok(b"refs/heads/not-a-tag".to_vec())
        } else {
            Ok(refname)
        }
    }));
    let result = run_with(&Options::default(), callbacks, input.as_bytes(), None);
    assert!(result.is_err());
}

#[test]
fn done_callback_fires_before_done_is_forwarded() {
    use std::cell::Cell;
    use std::rc::Rc;

    let fired = Rc::new(Cell::new(false));
    let seen = fired.clone();
    let mut callbacks = Callbacks::default();
    callbacks.done = Some(Box::new(move || {
        seen.set(true);
        Ok(())
    }));
    let input = format!(
        "{}{}done\n",
        blob(1, "content"),
        commit("refs/heads/main", 2, None, &[], &["M 100644 :1 a"], "c1\n"),
    );
    let (out, _) = run_with(&Options::default(), callbacks, input.as_bytes(), None).unwrap();
    assert!(fired.get());
    assert!(out_str(&out).ends_with("done\n"));
}
