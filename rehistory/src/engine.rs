//! The rewrite engine. The stream parser hands every parsed element
//! to this type, which applies the configured transforms, decides
//! what survives, keeps the mark/ancestry bookkeeping consistent and
//! emits the results through the importer handle.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::io::{self, Write};
use std::mem;
use std::path::PathBuf;

use regex::bytes::Regex;

use crate::ancestry::AncestryGraph;
use crate::elements::{
    Blob, Commit, DumpState, FileChange, Identity, ParentRef, Progress, Reset, Tag,
};
use crate::import::ImportHandle;
use crate::mailmap::Mailmap;
use crate::marks::MarkTable;
use crate::opts::{Options, PruneMode};
use crate::pathfilter::PathTransform;
use crate::pathquoting;
use crate::progress::ProgressWriter;
use crate::replace::ReplaceTable;

pub const ZERO_HASH: &[u8] = b"0000000000000000000000000000000000000000";

const TAG_PREFIX: &[u8] = b"refs/tags/";
const PENDING_RENAME_WATERMARK: usize = 40;

/// Read-only view of engine state offered to user callbacks.
pub struct MetadataView<'a> {
    pub graph: &'a AncestryGraph,
    pub original_graph: &'a AncestryGraph,
    pub commit_map: &'a HashMap<Vec<u8>, Option<Vec<u8>>>,
}

type ValueCallback = Box<dyn FnMut(Vec<u8>) -> io::Result<Vec<u8>>>;
type FilenameCallback = Box<dyn FnMut(Option<Vec<u8>>) -> io::Result<Option<Vec<u8>>>>;

/// Statically known extension points, replacing the original's
/// dynamically evaluated user code bodies.
#[derive(Default)]
pub struct Callbacks {
    pub filename: Option<FilenameCallback>,
    pub message: Option<ValueCallback>,
    pub name: Option<ValueCallback>,
    pub email: Option<ValueCallback>,
    pub refname: Option<ValueCallback>,
    pub blob: Option<Box<dyn FnMut(&mut Blob, &MetadataView) -> io::Result<()>>>,
    pub commit: Option<Box<dyn FnMut(&mut Commit, &MetadataView) -> io::Result<()>>>,
    pub tag: Option<Box<dyn FnMut(&mut Tag, &MetadataView) -> io::Result<()>>>,
    pub reset: Option<Box<dyn FnMut(&mut Reset, &MetadataView) -> io::Result<()>>>,
    pub progress: Option<Box<dyn FnMut(&mut Progress) -> io::Result<()>>>,
    pub done: Option<Box<dyn FnMut() -> io::Result<()>>>,
}

/// Context the parser carries alongside a commit: the parent list as
/// it appeared in the input, the same list translated through the
/// mark table (pruned parents become None), and whether the input had
/// any file changes at all.
#[derive(Debug, Clone, Default)]
pub struct CommitAux {
    pub orig_parents: Vec<ParentRef>,
    pub translated_parents: Vec<Option<ParentRef>>,
    pub had_file_changes: bool,
}

/// Everything the run produced besides the output stream itself,
/// for report writing and assertions.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub commit_map: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    pub exported_refs: BTreeSet<Vec<u8>>,
    pub imported_refs: BTreeSet<Vec<u8>>,
    pub no_longer_merges: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    pub referenced_but_removed: BTreeSet<Vec<u8>>,
    pub commits_parsed: u64,
    pub commits_pruned: u64,
    pub blobs_stripped: u64,
}

pub struct Rewriter {
    opts: Options,
    callbacks: Callbacks,
    pub marks: MarkTable,
    import: ImportHandle,

    path_transform: PathTransform,
    replace_text: Option<ReplaceTable>,
    replace_message: Option<ReplaceTable>,
    mailmap: Option<Mailmap>,
    strip_blob_ids: HashSet<Vec<u8>>,
    hash_re: Regex,
    /// Source repository for re-diffing commits against a new first
    /// parent; absent in pure stream mode.
    source_dir: Option<PathBuf>,

    graph: AncestryGraph,
    orig_graph: AncestryGraph,
    skipped_commits: HashSet<u32>,
    files_tweaked: HashSet<Vec<u8>>,
    newnames: HashMap<Vec<u8>, Option<Vec<u8>>>,
    stripped_blob_hashes: HashSet<Vec<u8>>,
    blob_sizes: HashMap<u32, usize>,

    commit_renames: HashMap<Vec<u8>, Option<Vec<u8>>>,
    commit_map_order: Vec<Vec<u8>>,
    pending_renames: VecDeque<Vec<u8>>,
    short_old_hashes: HashMap<Vec<u8>, BTreeSet<Vec<u8>>>,
    referenced_but_removed: BTreeSet<Vec<u8>>,
    no_longer_merges: Vec<(Vec<u8>, Option<Vec<u8>>)>,

    pub hash_to_mark: HashMap<Vec<u8>, u32>,
    mark_to_hash: HashMap<u32, Vec<u8>>,

    exported_refs: BTreeSet<Vec<u8>>,
    imported_refs: BTreeSet<Vec<u8>>,

    num_commits: u64,
    num_pruned: u64,
    num_stripped_blobs: u64,
    progress: ProgressWriter,
}

impl Rewriter {
    pub fn new(opts: &Options, callbacks: Callbacks, import: ImportHandle) -> io::Result<Self> {
        let path_transform = opts.build_path_transform()?;
        let replace_text = match &opts.replace_text_file {
            Some(p) => Some(ReplaceTable::from_file(p)?),
            None => None,
        };
        let replace_message = match &opts.replace_message_file {
            Some(p) => Some(ReplaceTable::from_file(p)?),
            None => None,
        };
        let mailmap = match &opts.mailmap_file {
            Some(p) => Some(Mailmap::from_file(p)?),
            None => None,
        };
        let strip_blob_ids = match &opts.strip_blobs_with_ids {
            Some(p) => crate::opts::load_blob_id_file(p)?,
            None => HashSet::new(),
        };
        let quiet = opts.quiet;
        Ok(Rewriter {
            opts: opts.clone(),
            callbacks,
            marks: MarkTable::new(),
            import,
            path_transform,
            replace_text,
            replace_message,
            mailmap,
            strip_blob_ids,
            hash_re: Regex::new(r"\b[0-9a-f]{7,40}\b").unwrap(),
            source_dir: None,
            graph: AncestryGraph::new(),
            orig_graph: AncestryGraph::new(),
            skipped_commits: HashSet::new(),
            files_tweaked: HashSet::new(),
            newnames: HashMap::new(),
            stripped_blob_hashes: HashSet::new(),
            blob_sizes: HashMap::new(),
            commit_renames: HashMap::new(),
            commit_map_order: Vec::new(),
            pending_renames: VecDeque::new(),
            short_old_hashes: HashMap::new(),
            referenced_but_removed: BTreeSet::new(),
            no_longer_merges: Vec::new(),
            hash_to_mark: HashMap::new(),
            mark_to_hash: HashMap::new(),
            exported_refs: BTreeSet::new(),
            imported_refs: BTreeSet::new(),
            num_commits: 0,
            num_pruned: 0,
            num_stripped_blobs: 0,
            progress: ProgressWriter::new(quiet),
        })
    }

    /// Enable re-diffing against the source repository when parent
    /// trimming changes a commit's effective first parent.
    pub fn set_source_dir(&mut self, dir: PathBuf) {
        self.source_dir = Some(dir);
    }

    pub fn opts(&self) -> &Options {
        &self.opts
    }

    pub fn note_exported_ref(&mut self, refname: &[u8]) {
        self.exported_refs.insert(refname.to_vec());
    }

    pub fn is_commit_skipped(&self, mark: u32) -> bool {
        self.skipped_commits.contains(&mark)
    }

    // ----- blobs -----

    pub fn process_blob(&mut self, blob: &mut Blob) -> io::Result<()> {
        self.blob_sizes.insert(blob.mark, blob.data.len());
        if let Some(max) = self.opts.max_blob_size {
            if blob.data.len() > max {
                blob.skip();
            }
        }
        if let Some(id) = &blob.original_id {
            if self.strip_blob_ids.contains(id) {
                blob.skip();
            }
        }
        if blob.state != DumpState::Skipped {
            if let Some(table) = &self.replace_text {
                let data = mem::take(&mut blob.data);
                blob.data = table.apply(data);
            }
        }
        if let Some(cb) = self.callbacks.blob.as_mut() {
            cb(
                blob,
                &MetadataView {
                    graph: &self.graph,
                    original_graph: &self.orig_graph,
                    commit_map: &self.commit_renames,
                },
            )?;
        }
        match blob.state {
            DumpState::Skipped => {
                self.num_stripped_blobs += 1;
                self.marks
                    .record_rename(blob.old_mark.unwrap_or(blob.mark), None, false);
                if let Some(id) = &blob.original_id {
                    self.stripped_blob_hashes.insert(id.clone());
                }
            }
            DumpState::Pending => {
                blob.dump(&mut self.import)?;
                if let Some(id) = &blob.original_id {
                    self.hash_to_mark.insert(id.clone(), blob.mark);
                    self.mark_to_hash.insert(blob.mark, id.clone());
                }
            }
            DumpState::Written => {}
        }
        Ok(())
    }

    // ----- commits -----

    pub fn process_commit(&mut self, commit: &mut Commit, aux: &CommitAux) -> io::Result<()> {
        // Message: hash back-references first, then the user callback.
        if !self.opts.preserve_commit_hashes {
            let msg = mem::take(&mut commit.message);
            commit.message = self.rewrite_hashes(msg)?;
        }
        if let Some(table) = &self.replace_message {
            let msg = mem::take(&mut commit.message);
            commit.message = table.apply(msg);
        }
        if let Some(cb) = self.callbacks.message.as_mut() {
            let msg = mem::take(&mut commit.message);
            commit.message = cb(msg)?;
        }

        // Identities.
        Self::apply_identity_transforms(
            &self.mailmap,
            &mut self.callbacks,
            &mut commit.author,
        )?;
        Self::apply_identity_transforms(
            &self.mailmap,
            &mut self.callbacks,
            &mut commit.committer,
        )?;

        // The "branch" may actually be a tag ref; rename it too.
        let branch = mem::take(&mut commit.branch);
        commit.branch = self.rename_ref(branch, false)?;

        self.transform_file_changes(commit)?;

        // Record ancestry in both graphs before any trimming.
        let translated_present: Vec<ParentRef> = aux
            .translated_parents
            .iter()
            .flatten()
            .cloned()
            .collect();
        for parent in &translated_present {
            if matches!(parent, ParentRef::Hash(_)) {
                self.graph.record_external(parent);
                self.orig_graph.record_external(parent);
            }
        }
        for parent in &aux.orig_parents {
            if matches!(parent, ParentRef::Hash(_)) {
                self.orig_graph.record_external(parent);
            }
        }
        self.graph
            .add(ParentRef::Mark(commit.mark), &translated_present);
        let orig_key = ParentRef::Mark(commit.old_mark.unwrap_or(commit.mark));
        if !self.orig_graph.contains(&orig_key) {
            self.orig_graph.add(orig_key, &aux.orig_parents);
        }

        // Trim parents pruned to nothing or made redundant.
        let old_first = aux
            .translated_parents
            .first()
            .cloned()
            .flatten();
        let (final_parents, new_first_parent) =
            self.trim_extra_parents(&aux.orig_parents, &aux.translated_parents);
        commit.parents = final_parents;

        // A different first parent invalidates the patch we parsed;
        // re-diff against the new baseline when we can.
        if let Some(first) = commit.parents.first().cloned() {
            if old_first.as_ref() != Some(&first) {
                self.rediff_against(commit, &first)?;
            }
        }

        if let Some(cb) = self.callbacks.commit.as_mut() {
            cb(
                commit,
                &MetadataView {
                    graph: &self.graph,
                    original_graph: &self.orig_graph,
                    commit_map: &self.commit_renames,
                },
            )?;
        }

        if commit.state == DumpState::Pending {
            if !self.prunable(commit, &new_first_parent, aux)? {
                commit.dump(&mut self.import)?;
                self.imported_refs.insert(commit.branch.clone());
                if let Some(id) = &commit.original_id {
                    self.hash_to_mark.insert(id.clone(), commit.mark);
                    self.mark_to_hash.insert(commit.mark, id.clone());
                }
                self.record_remapping(commit, aux)?;
            } else {
                let rewrite_to = new_first_parent.or_else(|| commit.first_parent());
                commit.skip();
                self.num_pruned += 1;
                self.skipped_commits
                    .insert(commit.old_mark.unwrap_or(commit.mark));
                self.marks.record_rename(
                    commit.old_mark.unwrap_or(commit.mark),
                    rewrite_to.clone(),
                    false,
                );
                if let Some(id) = &commit.original_id {
                    self.set_commit_rename(id.clone(), None);
                }
                // Leave the branch pointing somewhere sensible.
                let mut reset = Reset {
                    ref_name: commit.branch.clone(),
                    from: Some(rewrite_to.unwrap_or_else(|| ParentRef::Hash(ZERO_HASH.to_vec()))),
                    state: DumpState::Pending,
                };
                reset.dump(&mut self.import)?;
                self.imported_refs.insert(reset.ref_name.clone());
            }
        } else if commit.state == DumpState::Skipped {
            // A callback skipped the commit outright.
            self.skipped_commits
                .insert(commit.old_mark.unwrap_or(commit.mark));
            self.marks
                .record_rename(commit.old_mark.unwrap_or(commit.mark), None, false);
            if let Some(id) = &commit.original_id {
                self.set_commit_rename(id.clone(), None);
            }
        }

        self.num_commits += 1;
        let parsed = self.num_commits;
        self.progress.show(&format!("Parsed {parsed} commits"));
        Ok(())
    }

    fn apply_identity_transforms(
        mailmap: &Option<Mailmap>,
        callbacks: &mut Callbacks,
        identity: &mut Identity,
    ) -> io::Result<()> {
        if let Some(mm) = mailmap {
            let (name, email) = mm.translate(&identity.name, &identity.email);
            identity.name = name;
            identity.email = email;
        }
        if let Some(cb) = callbacks.name.as_mut() {
            identity.name = cb(mem::take(&mut identity.name))?;
        }
        if let Some(cb) = callbacks.email.as_mut() {
            identity.email = cb(mem::take(&mut identity.email))?;
        }
        Ok(())
    }

    /// Apply the tag-rename prefix mapping and the refname callback.
    /// With `must_stay_tag`, a callback result that leaves the
    /// refs/tags/ namespace is a configuration error.
    fn rename_ref(&mut self, refname: Vec<u8>, must_stay_tag: bool) -> io::Result<Vec<u8>> {
        let mut full = refname;
        if let Some((old, new)) = &self.opts.tag_rename {
            if let Some(tagname) = full.strip_prefix(TAG_PREFIX) {
                if tagname.starts_with(&old[..]) {
                    let mut rebuilt =
                        Vec::with_capacity(TAG_PREFIX.len() + new.len() + tagname.len());
                    rebuilt.extend_from_slice(TAG_PREFIX);
                    rebuilt.extend_from_slice(new);
                    rebuilt.extend_from_slice(&tagname[old.len()..]);
                    full = rebuilt;
                }
            }
        }
        if let Some(cb) = self.callbacks.refname.as_mut() {
            let before_tag = full.starts_with(TAG_PREFIX);
            full = cb(full)?;
            if (must_stay_tag || before_tag) && !full.starts_with(TAG_PREFIX) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "fast-import requires tags to remain in refs/tags/; got {}",
                        String::from_utf8_lossy(&full)
                    ),
                ));
            }
        }
        Ok(full)
    }

    fn transform_file_changes(&mut self, commit: &mut Commit) -> io::Result<()> {
        let orig_changes: HashSet<FileChange> = commit.file_changes.iter().cloned().collect();
        let mut kept: BTreeMap<Vec<u8>, FileChange> = BTreeMap::new();
        let drained: Vec<FileChange> = commit.file_changes.drain(..).collect();
        for change in drained {
            let change = match change {
                FileChange::DeleteAll => {
                    kept.insert(Vec::new(), FileChange::DeleteAll);
                    continue;
                }
                FileChange::Rename { src, dst } => {
                    match (self.transformed_name(src)?, self.transformed_name(dst)?) {
                        (Some(src), Some(dst)) => FileChange::Rename { src, dst },
                        _ => continue,
                    }
                }
                FileChange::Modify { mode, blob, path } => match self.transformed_name(path)? {
                    Some(path) => FileChange::Modify { mode, blob, path },
                    None => continue,
                },
                FileChange::Delete { path } => match self.transformed_name(path)? {
                    Some(path) => FileChange::Delete { path },
                    None => continue,
                },
            };

            let key = change.path_key().to_vec();
            if let Some(existing) = kept.get(&key) {
                // Collisions from renames are tolerable when one side
                // is a deletion or both sides are identical.
                if matches!(change, FileChange::Delete { .. }) {
                    continue;
                }
                let identical = match (&change, existing) {
                    (
                        FileChange::Modify { mode, blob, .. },
                        FileChange::Modify {
                            mode: emode,
                            blob: eblob,
                            ..
                        },
                    ) => mode == emode && blob == eblob,
                    _ => false,
                };
                if identical {
                    continue;
                }
                if !matches!(existing, FileChange::Delete { .. }) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "file renaming caused colliding pathnames\n  commit: {}\n  filename: {}",
                            String::from_utf8_lossy(
                                commit.original_id.as_deref().unwrap_or(b"<unknown>")
                            ),
                            String::from_utf8_lossy(&key)
                        ),
                    ));
                }
            }
            // Strip modifies whose blob is oversized or blocklisted.
            if let FileChange::Modify { blob, .. } = &change {
                match blob {
                    ParentRef::Hash(h) => {
                        if self.strip_blob_ids.contains(h) || self.stripped_blob_hashes.contains(h)
                        {
                            continue;
                        }
                    }
                    ParentRef::Mark(m) => {
                        if let (Some(max), Some(size)) =
                            (self.opts.max_blob_size, self.blob_sizes.get(m))
                        {
                            if *size > max {
                                continue;
                            }
                        }
                    }
                }
            }
            kept.insert(key, change);
        }
        commit.file_changes = kept.into_values().collect();

        // Paths whose content we altered can make later commits empty;
        // remember them for the prunability check.
        let final_changes: HashSet<FileChange> = commit.file_changes.iter().cloned().collect();
        for change in orig_changes.symmetric_difference(&final_changes) {
            self.files_tweaked.insert(change.path_key().to_vec());
        }
        Ok(())
    }

    fn transformed_name(&mut self, path: Vec<u8>) -> io::Result<Option<Vec<u8>>> {
        if let Some(cached) = self.newnames.get(&path) {
            return Ok(cached.clone());
        }
        let mut new_path = self.path_transform.rewrite(&path);
        if let Some(cb) = self.callbacks.filename.as_mut() {
            new_path = cb(new_path)?;
        }
        self.newnames.insert(path, new_path.clone());
        Ok(new_path)
    }

    /// Remove parents rewritten to nothing and redundant parents, per
    /// the prune-degenerate policy. Returns the final parent list
    /// and, when trimming would turn a merge into a non-merge, the
    /// new effective first parent (with the original parent list kept
    /// so the tree comparison can decide the commit's fate).
    fn trim_extra_parents(
        &self,
        orig_parents: &[ParentRef],
        translated: &[Option<ParentRef>],
    ) -> (Vec<ParentRef>, Option<ParentRef>) {
        let present: Vec<ParentRef> = translated.iter().flatten().cloned().collect();
        if self.opts.prune_degenerate == PruneMode::Never {
            return (present, None);
        }
        let always = self.opts.prune_degenerate == PruneMode::Always;

        let mut parents: Vec<ParentRef> = Vec::new();
        let mut origs: Vec<ParentRef> = Vec::new();
        let mut rewritten: Vec<bool> = Vec::new();
        for (orig, new) in orig_parents.iter().zip(translated.iter()) {
            if let Some(p) = new {
                parents.push(p.clone());
                origs.push(orig.clone());
                rewritten.push(
                    always
                        || orig
                            .as_mark()
                            .is_some_and(|m| self.skipped_commits.contains(&m)),
                );
            }
        }
        if parents.is_empty() {
            return (Vec::new(), None);
        }
        if parents.len() < 2 {
            return (parents, None);
        }

        // Both sides of a merge may have collapsed to the same
        // ancestor; drop duplicates, but only ones that got there by
        // being rewritten, so intentionally duplicated parents stay.
        let parents_before_dedup = parents.clone();
        let mut seen: HashSet<ParentRef> = HashSet::new();
        let mut deduped: Vec<(ParentRef, ParentRef, bool)> = Vec::new();
        for i in 0..parents.len() {
            let first_time = seen.insert(parents[i].clone());
            if first_time || !rewritten[i] {
                deduped.push((parents[i].clone(), origs[i].clone(), rewritten[i]));
            }
        }
        if deduped.len() < 2 {
            return (parents_before_dedup, Some(deduped[0].0.clone()));
        }
        let (mut parents, origs, rewritten): (Vec<_>, Vec<_>, Vec<_>) = {
            let mut a = Vec::new();
            let mut b = Vec::new();
            let mut c = Vec::new();
            for (p, o, r) in deduped {
                a.push(p);
                b.push(o);
                c.push(r);
            }
            (a, b, c)
        };

        // Flatten merges whose one side became an ancestor of the
        // other, unless the original history had it that way too.
        let mut to_remove: Vec<usize> = Vec::new();
        for cur in 0..parents.len() {
            if !rewritten[cur] {
                continue;
            }
            for other in 0..parents.len() {
                if cur == other {
                    continue;
                }
                if !self.graph.is_ancestor(&parents[cur], &parents[other]) {
                    continue;
                }
                if !always && self.orig_graph.is_ancestor(&origs[cur], &origs[other]) {
                    continue;
                }
                to_remove.push(cur);
                break;
            }
        }
        for idx in to_remove.iter().rev() {
            parents.remove(*idx);
        }
        if parents.len() < 2 {
            return (parents_before_dedup, Some(parents[0].clone()));
        }
        (parents, None)
    }

    /// Whether the commit can be dropped entirely. The tree
    /// equivalence check round-trips through the importer: the commit
    /// is prunable iff every remaining change is already reflected in
    /// its (new) first parent.
    fn prunable(
        &mut self,
        commit: &Commit,
        new_first_parent: &Option<ParentRef>,
        aux: &CommitAux,
    ) -> io::Result<bool> {
        if self.opts.prune_empty == PruneMode::Never {
            return Ok(false);
        }
        let always = self.opts.prune_empty == PruneMode::Always;

        // Merges keep their say unless trimming found them degenerate.
        if commit.parents.len() >= 2 && new_first_parent.is_none() {
            return Ok(false);
        }

        if commit.parents.len() < 2 {
            if !aux.had_file_changes && !always {
                // A commit that started empty is only pruned when its
                // parents were pruned out from under it and it stayed
                // empty; an intentionally empty commit survives.
                let had_parents_pruned = commit.parents.len() < aux.orig_parents.len()
                    || (aux.orig_parents.len() == 1
                        && aux.orig_parents[0]
                            .as_mark()
                            .is_some_and(|m| self.skipped_commits.contains(&m)));
                return Ok(commit.file_changes.is_empty() && had_parents_pruned);
            }
            if commit.file_changes.is_empty() {
                return Ok(true);
            }
        }

        if commit.parents.is_empty() {
            return Ok(false);
        }
        if !self.import.can_query() {
            return Ok(false);
        }

        // A non-merge can only have become empty through blob or file
        // change editing; untouched paths rule that out cheaply.
        if aux.orig_parents.len() < 2 {
            let untouched = commit
                .file_changes
                .iter()
                .any(|c| !self.files_tweaked.contains(c.path_key()));
            if untouched {
                return Ok(false);
            }
        }

        // Keep the response pipe clear of pending get-mark replies.
        self.flush_renames(None, 0)?;

        let baseline = new_first_parent
            .clone()
            .unwrap_or_else(|| commit.parents[0].clone());
        let baseline_mark = match baseline.as_mark() {
            Some(m) => m,
            None => return Ok(false),
        };
        for change in &commit.file_changes {
            let quoted = pathquoting::enquote(change.path_key());
            let response = self.import.ls(baseline_mark, change.path_key())?;
            let tokens: Vec<&[u8]> = split_ws(&response);
            match change {
                FileChange::Delete { .. } => {
                    let expected: Vec<&[u8]> = [b"missing" as &[u8]]
                        .into_iter()
                        .chain(split_ws(&quoted))
                        .collect();
                    if tokens != expected {
                        return Ok(false);
                    }
                }
                FileChange::Modify { mode, blob, .. } => {
                    let blob_sha = match blob {
                        ParentRef::Hash(h) => h.clone(),
                        ParentRef::Mark(m) => self.import.get_mark(*m)?,
                    };
                    let expected: Vec<&[u8]> =
                        [mode.as_slice(), b"blob" as &[u8], blob_sha.as_slice()]
                            .into_iter()
                            .chain(split_ws(&quoted))
                            .collect();
                    if tokens != expected {
                        return Ok(false);
                    }
                }
                FileChange::DeleteAll | FileChange::Rename { .. } => return Ok(false),
            }
        }
        Ok(true)
    }

    fn rediff_against(&mut self, commit: &mut Commit, new_first: &ParentRef) -> io::Result<()> {
        let Some(dir) = self.source_dir.clone() else {
            return Ok(());
        };
        let Some(orig_id) = commit.original_id.clone() else {
            return Ok(());
        };
        let parent_hash = match new_first {
            ParentRef::Hash(h) => Some(h.clone()),
            ParentRef::Mark(m) => self.mark_to_hash.get(m).cloned(),
        };
        if let Some(parent_hash) = parent_hash {
            commit.file_changes =
                crate::gitutil::get_file_changes(&dir, &parent_hash, &orig_id, &self.hash_to_mark)?;
        }
        Ok(())
    }

    fn record_remapping(&mut self, commit: &Commit, aux: &CommitAux) -> io::Result<()> {
        if let Some(orig_id) = &commit.original_id {
            if self.import.can_query() {
                self.import.send_get_mark(commit.mark)?;
                self.short_old_hashes
                    .entry(orig_id[..7.min(orig_id.len())].to_vec())
                    .or_default()
                    .insert(orig_id.clone());
                if !self.commit_renames.contains_key(orig_id) {
                    self.commit_map_order.push(orig_id.clone());
                    self.commit_renames.insert(orig_id.clone(), None);
                }
                self.pending_renames.push_back(orig_id.clone());
                self.flush_renames(None, PENDING_RENAME_WATERMARK)?;
            }
        }
        if aux.orig_parents.len() >= 2 && commit.parents.len() < 2 {
            self.no_longer_merges
                .push((commit.original_id.clone().unwrap_or_default(), None));
        }
        Ok(())
    }

    fn set_commit_rename(&mut self, old: Vec<u8>, new: Option<Vec<u8>>) {
        if !self.commit_renames.contains_key(&old) {
            self.commit_map_order.push(old.clone());
        }
        self.commit_renames.insert(old, new);
    }

    /// Read queued get-mark responses. Reads everything when called
    /// without a target; with `until`, stops once that id resolves;
    /// with a watermark, drains only the excess backlog.
    fn flush_renames(&mut self, until: Option<&[u8]>, watermark: usize) -> io::Result<()> {
        if watermark > 0 && self.pending_renames.len() < 2 * watermark {
            return Ok(());
        }
        while let Some(orig_id) = self.pending_renames.pop_front() {
            let line = self.import.read_response_line()?;
            self.set_commit_rename(orig_id.clone(), Some(line));
            if until == Some(orig_id.as_slice()) {
                return Ok(());
            }
            if watermark > 0 && self.pending_renames.len() < watermark {
                return Ok(());
            }
        }
        Ok(())
    }

    fn get_rename(&mut self, old_hash: &[u8]) -> io::Result<Option<Vec<u8>>> {
        if let Some(Some(new)) = self.commit_renames.get(old_hash) {
            return Ok(Some(new.clone()));
        }
        if !self.pending_renames.iter().any(|p| p.as_slice() == old_hash) {
            return Ok(None);
        }
        self.flush_renames(Some(old_hash), 0)?;
        Ok(self.commit_renames.get(old_hash).cloned().flatten())
    }

    /// Translate one hash reference found in a message. Unresolvable
    /// references stay literal and are recorded for the report.
    fn translate_commit_hash(&mut self, reference: &[u8]) -> io::Result<Vec<u8>> {
        let orig_len = reference.len();
        let mut old_hash = reference.to_vec();
        let mut new_hash = self.get_rename(&old_hash)?;
        if new_hash.is_none() {
            let prefix = &old_hash[..7.min(old_hash.len())];
            let candidates = match self.short_old_hashes.get(prefix) {
                Some(set) => set,
                None => {
                    self.referenced_but_removed.insert(reference.to_vec());
                    return Ok(reference.to_vec());
                }
            };
            let matches: Vec<&Vec<u8>> = candidates
                .iter()
                .filter(|full| full.len() >= orig_len && full[..orig_len] == old_hash[..])
                .collect();
            if matches.len() != 1 {
                self.referenced_but_removed.insert(reference.to_vec());
                return Ok(reference.to_vec());
            }
            old_hash = matches[0].clone();
            new_hash = self.get_rename(&old_hash)?;
        }
        match new_hash {
            Some(new) => Ok(new[..orig_len.min(new.len())].to_vec()),
            None => {
                self.referenced_but_removed.insert(reference.to_vec());
                Ok(reference.to_vec())
            }
        }
    }

    fn rewrite_hashes(&mut self, data: Vec<u8>) -> io::Result<Vec<u8>> {
        let re = self.hash_re.clone();
        let mut out = Vec::with_capacity(data.len());
        let mut last = 0usize;
        for m in re.find_iter(&data) {
            out.extend_from_slice(&data[last..m.start()]);
            out.extend_from_slice(&self.translate_commit_hash(m.as_bytes())?);
            last = m.end();
        }
        out.extend_from_slice(&data[last..]);
        Ok(out)
    }

    // ----- tags -----

    pub fn process_tag(&mut self, tag: &mut Tag) -> io::Result<()> {
        if !self.opts.preserve_commit_hashes {
            let msg = mem::take(&mut tag.message);
            tag.message = self.rewrite_hashes(msg)?;
        }
        if let Some(table) = &self.replace_message {
            let msg = mem::take(&mut tag.message);
            tag.message = table.apply(msg);
        }
        if let Some(cb) = self.callbacks.message.as_mut() {
            let msg = mem::take(&mut tag.message);
            tag.message = cb(msg)?;
        }

        let mut fullref = Vec::with_capacity(TAG_PREFIX.len() + tag.name.len());
        fullref.extend_from_slice(TAG_PREFIX);
        fullref.extend_from_slice(&tag.name);
        let fullref = self.rename_ref(fullref, true)?;
        tag.name = fullref[TAG_PREFIX.len()..].to_vec();

        if let Some(tagger) = tag.tagger.as_mut() {
            Self::apply_identity_transforms(&self.mailmap, &mut self.callbacks, tagger)?;
        }

        if let Some(cb) = self.callbacks.tag.as_mut() {
            cb(
                tag,
                &MetadataView {
                    graph: &self.graph,
                    original_graph: &self.orig_graph,
                    commit_map: &self.commit_renames,
                },
            )?;
        }

        // The target may have been pruned to nothing along with all
        // of its ancestors; such a tag has nothing left to point at.
        if tag.target.is_some() && tag.state == DumpState::Pending {
            let mark_tags = self.opts.mark_tags;
            tag.dump(&mut self.import, mark_tags)?;
            let mut imported = TAG_PREFIX.to_vec();
            imported.extend_from_slice(&tag.name);
            self.imported_refs.insert(imported);
        }
        Ok(())
    }

    // ----- resets -----

    pub fn process_reset(&mut self, reset: &mut Reset) -> io::Result<()> {
        let refname = mem::take(&mut reset.ref_name);
        reset.ref_name = self.rename_ref(refname, false)?;
        if let Some(cb) = self.callbacks.reset.as_mut() {
            cb(
                reset,
                &MetadataView {
                    graph: &self.graph,
                    original_graph: &self.orig_graph,
                    commit_map: &self.commit_renames,
                },
            )?;
        }
        if reset.state == DumpState::Pending {
            reset.dump(&mut self.import)?;
            self.imported_refs.insert(reset.ref_name.clone());
        }
        Ok(())
    }

    pub fn process_progress(&mut self, progress: &mut Progress) -> io::Result<()> {
        // Never forwarded by default: a progress line bouncing back
        // from the importer would desynchronize directive responses.
        if let Some(cb) = self.callbacks.progress.as_mut() {
            cb(progress)?;
        }
        Ok(())
    }

    pub fn process_done(&mut self) -> io::Result<()> {
        if let Some(cb) = self.callbacks.done.as_mut() {
            cb()?;
        }
        self.progress.finish();
        self.import.write_all(b"done\n")?;
        self.import.flush()
    }

    pub fn emit_literal(&mut self, line: &[u8]) -> io::Result<()> {
        self.import.write_all(line)
    }

    /// Drain the pending rename queue and produce the run summary.
    pub fn finish(mut self) -> io::Result<RunSummary> {
        self.flush_renames(None, 0)?;
        self.progress.finish();
        let commit_map = self
            .commit_map_order
            .iter()
            .map(|old| {
                (
                    old.clone(),
                    self.commit_renames.get(old).cloned().flatten(),
                )
            })
            .collect();
        let no_longer_merges = self
            .no_longer_merges
            .into_iter()
            .map(|(old, _)| {
                let new = self.commit_renames.get(&old).cloned().flatten();
                (old, new)
            })
            .collect();
        Ok(RunSummary {
            commit_map,
            exported_refs: self.exported_refs,
            imported_refs: self.imported_refs,
            no_longer_merges,
            referenced_but_removed: self.referenced_but_removed,
            commits_parsed: self.num_commits,
            commits_pruned: self.num_pruned,
            blobs_stripped: self.num_stripped_blobs,
        })
    }
}

fn split_ws(bytes: &[u8]) -> Vec<&[u8]> {
    bytes
        .split(|b| b.is_ascii_whitespace())
        .filter(|t| !t.is_empty())
        .collect()
}
