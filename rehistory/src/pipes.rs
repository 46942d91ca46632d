//! Construction of the exporter and importer subprocesses. The
//! exporter is asked for everything the engine depends on: original
//! ids on every object, marked tags, hex ids for excluded parents,
//! stripped signatures, and rewritten tags of filtered objects.

use std::process::{Command, Stdio};

use crate::opts::Options;

pub fn build_fast_export_cmd(opts: &Options) -> Command {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(&opts.source);
    cmd.args([
        "fast-export",
        "--show-original-ids",
        "--signed-tags=strip",
        "--tag-of-filtered-object=rewrite",
        "--fake-missing-tagger",
        "--reference-excluded-parents",
        "--use-done-feature",
    ]);
    if opts.mark_tags {
        cmd.arg("--mark-tags");
    }
    if !opts.preserve_commit_encoding {
        cmd.arg("--reencode=yes");
    }
    cmd.args(&opts.refs);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());
    cmd
}

pub fn build_fast_import_cmd(opts: &Options) -> Command {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(&opts.target);
    cmd.args(["-c", "core.ignorecase=false"]);
    cmd.args([
        "fast-import",
        "--date-format=raw-permissive",
        "--force",
        "--quiet",
    ]);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());
    cmd
}
