//! Streaming rewriter for Git history. A fast-export stream is
//! parsed into elements, pushed through a filter/transform pipeline
//! (path selection and renaming, blob rewriting, identity mapping,
//! message rewriting, tag renaming, empty-commit and degenerate-merge
//! pruning) and re-emitted for fast-import, which materializes the
//! new history.

use std::fs::{create_dir_all, File};
use std::io::{self, BufRead, BufReader, Read, Write};

use colored::Colorize;

pub mod ancestry;
pub mod elements;
pub mod engine;
pub mod gitutil;
pub mod import;
pub mod mailmap;
pub mod marks;
pub mod metadata;
pub mod opts;
pub mod pathfilter;
pub mod pathquoting;
pub mod pipes;
pub mod progress;
pub mod replace;
pub mod stream;

pub use engine::{Callbacks, CommitAux, MetadataView, Rewriter, RunSummary};
pub use import::ImportHandle;
pub use opts::Options;
pub use stream::FastExportParser;

/// Run the engine over an arbitrary stream and importer handle. This
/// is the library-first core: no subprocesses, no repository access
/// beyond what the handle provides.
pub fn filter_stream(
    opts: &Options,
    callbacks: Callbacks,
    input: &mut dyn BufRead,
    import: ImportHandle,
) -> io::Result<RunSummary> {
    let mut engine = Rewriter::new(opts, callbacks, import)?;
    let mut parser = FastExportParser::new();
    parser.run(input, &mut engine)?;
    engine.finish()
}

pub fn run(opts: &Options) -> io::Result<()> {
    run_with_callbacks(opts, Callbacks::default())
}

/// Full run against real repositories: spawn the exporter and
/// importer, stream between them, then persist the run results.
pub fn run_with_callbacks(opts: &Options, callbacks: Callbacks) -> io::Result<()> {
    let mut opts = opts.clone();
    let target_git_dir = gitutil::git_dir(&opts.target).map_err(|e| {
        io::Error::other(format!("target {:?} is not a git repository: {e}", opts.target))
    })?;
    gitutil::git_dir(&opts.source).map_err(|e| {
        io::Error::other(format!("source {:?} is not a git repository: {e}", opts.source))
    })?;

    let results_dir = target_git_dir.join("filter-repo");
    if !results_dir.exists() {
        create_dir_all(&results_dir)?;
    }

    // History rewriting is destructive; insist on a clean tree unless
    // the user forces it or already ran us here once.
    if !opts.force && !opts.dry_run && !metadata::already_ran(&results_dir) {
        let bare = gitutil::is_bare(&opts.target)?;
        if !bare && !gitutil::worktree_is_clean(&opts.target)? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "refusing to rewrite history with uncommitted changes (use --force to override)",
            ));
        }
    }

    if opts.mark_tags && !opts.stdin {
        opts.mark_tags = gitutil::exporter_supports("--mark-tags");
    }

    let started_at = chrono::Utc::now();
    let orig_refs = gitutil::get_refs(&opts.source)?;
    let orig_copy = File::create(results_dir.join("fast-export.original"))?;
    let filt_copy = File::create(results_dir.join("fast-export.filtered"))?;

    let mut fe_child = None;
    let mut input: Box<dyn BufRead> = if opts.stdin {
        Box::new(BufReader::new(TeeReader::new(
            Box::new(io::stdin()) as Box<dyn Read>,
            orig_copy,
        )))
    } else {
        let mut child = pipes::build_fast_export_cmd(&opts)
            .spawn()
            .map_err(|e| io::Error::new(e.kind(), format!("failed to spawn git fast-export: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("no stdout from git fast-export"))?;
        fe_child = Some(child);
        Box::new(BufReader::new(TeeReader::new(
            Box::new(stdout) as Box<dyn Read>,
            orig_copy,
        )))
    };

    let mut fi_child = None;
    let import = if opts.dry_run {
        ImportHandle::staging(Box::new(filt_copy))
    } else {
        let mut child = pipes::build_fast_import_cmd(&opts)
            .spawn()
            .map_err(|e| io::Error::new(e.kind(), format!("failed to spawn git fast-import: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("no stdin for git fast-import"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("no stdout from git fast-import"))?;
        fi_child = Some(child);
        ImportHandle::new(Box::new(stdin), Some(Box::new(BufReader::new(stdout))))
            .with_copy(Box::new(filt_copy))
    };

    let mut engine = Rewriter::new(&opts, callbacks, import)?;
    engine.set_source_dir(opts.source.clone());
    let mut parser = FastExportParser::new();
    parser.run(&mut input, &mut engine)?;
    // Dropping the handle inside finish closes the importer's stdin.
    let summary = engine.finish()?;
    drop(input);

    if let Some(mut child) = fe_child {
        let status = child.wait()?;
        if !status.success() {
            return Err(io::Error::other("git fast-export failed; see above"));
        }
    }
    if let Some(mut child) = fi_child {
        let status = child.wait()?;
        if !status.success() {
            return Err(io::Error::other("git fast-import failed; see above"));
        }
    }

    if opts.dry_run {
        if !opts.quiet {
            eprintln!(
                "{}",
                "NOTE: not running fast-import; --dry-run passed.".yellow()
            );
            eprintln!(
                "      Requested filtering can be seen by comparing:\n        {}\n        {}",
                results_dir.join("fast-export.original").display(),
                results_dir.join("fast-export.filtered").display()
            );
        }
        return Ok(());
    }

    let report = metadata::RunReport {
        started_at: started_at.to_rfc3339(),
        finished_at: chrono::Utc::now().to_rfc3339(),
        commits_parsed: summary.commits_parsed,
        commits_pruned: summary.commits_pruned,
        blobs_stripped: summary.blobs_stripped,
        commits_no_longer_merges: summary.no_longer_merges.len(),
        hashes_referenced_but_removed: summary.referenced_but_removed.len(),
    };
    metadata::record_metadata(&results_dir, &opts.target, &summary, &orig_refs, &report)?;
    metadata::update_replace_refs(&opts.target, opts.replace_refs, &summary.commit_map)?;

    if !opts.quiet {
        eprintln!(
            "{}",
            format!(
                "New history written; {} commits parsed, {} pruned.",
                summary.commits_parsed, summary.commits_pruned
            )
            .green()
        );
        if !summary.no_longer_merges.is_empty() || !summary.referenced_but_removed.is_empty() {
            eprintln!(
                "{}",
                format!(
                    "See {} for notes about this rewrite.",
                    results_dir.join("suboptimal-issues").display()
                )
                .yellow()
            );
        }
    }
    Ok(())
}

/// Mirrors everything read from the exporter into a debug copy, so a
/// failed or dry run leaves evidence behind.
struct TeeReader {
    inner: Box<dyn Read>,
    copy: File,
}

impl TeeReader {
    fn new(inner: Box<dyn Read>, copy: File) -> Self {
        TeeReader { inner, copy }
    }
}

impl Read for TeeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.copy.write_all(&buf[..n])?;
        Ok(n)
    }
}
