pub mod gc;
pub mod trailer;

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::agent::Agent;
use crate::capture::ChangeSet;
use crate::event::TokenUsage;
use crate::paths::{Workspace, DATA_DIR};

/// The single long-lived branch holding condensed checkpoints.
pub const CHECKPOINTS_REF: &str = "refs/heads/entire/checkpoints/v1";

/// Transcripts above this size are stored as a chunk subtree.
const TRANSCRIPT_CHUNK_THRESHOLD: usize = 4 * 1024 * 1024;
/// Chunk size used when splitting large transcripts.
const TRANSCRIPT_CHUNK_SIZE: usize = 1024 * 1024;

/// Bounded retries for compare-and-swap reference updates.
const CAS_RETRIES: usize = 3;

// ===================================================================
// Shadow references
// ===================================================================

/// Shadow branch for `(base commit, worktree)`: every session sharing a
/// base commit on the same worktree appends its steps here.
pub fn shadow_ref_name(base_commit: git2::Oid, worktree_id: &str) -> String {
    let wt_hash = git2::Oid::hash_object(git2::ObjectType::Blob, worktree_id.as_bytes())
        .map(|oid| oid.to_string())
        .unwrap_or_else(|_| "0".repeat(40));
    let base = base_commit.to_string();
    format!("refs/heads/shadow/{}-{}", &base[..8], &wt_hash[..8])
}

fn ref_tip(repo: &git2::Repository, name: &str) -> Result<Option<git2::Oid>> {
    match repo.find_reference(name) {
        Ok(r) => Ok(r.target()),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {name}")),
    }
}

/// Advance `name` from `expected` to `new`.  Creation (expected = None)
/// fails if someone else created the ref first; both failure modes are
/// reported as `Ok(false)` so callers can rebase and retry.
fn compare_and_swap(
    repo: &git2::Repository,
    name: &str,
    expected: Option<git2::Oid>,
    new: git2::Oid,
    log: &str,
) -> Result<bool> {
    let result = match expected {
        Some(current) => repo.reference_matching(name, new, true, current, log),
        None => repo.reference(name, new, false, log),
    };
    match result {
        Ok(_) => Ok(true),
        Err(e)
            if matches!(
                e.code(),
                git2::ErrorCode::Modified | git2::ErrorCode::Exists | git2::ErrorCode::Locked
            ) =>
        {
            Ok(false)
        }
        Err(e) => Err(e).with_context(|| format!("updating {name}")),
    }
}

fn signature(repo: &git2::Repository) -> git2::Signature<'static> {
    repo.signature()
        .or_else(|_| git2::Signature::now("entire", "entire@localhost"))
        .expect("building fallback signature cannot fail")
}

// ===================================================================
// Tree construction
// ===================================================================

/// Flatten a tree into `path -> (oid, filemode)` with `/`-joined paths.
fn flatten_tree(
    repo: &git2::Repository,
    tree: &git2::Tree,
    prefix: &str,
    out: &mut BTreeMap<String, (git2::Oid, i32)>,
) -> Result<()> {
    for entry in tree.iter() {
        let name = entry.name().context("non-utf8 tree entry name")?;
        let path = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };
        match entry.kind() {
            Some(git2::ObjectType::Tree) => {
                let sub = repo
                    .find_tree(entry.id())
                    .with_context(|| format!("loading subtree {path}"))?;
                flatten_tree(repo, &sub, &path, out)?;
            }
            // Blobs and submodule commits keep their entry as-is.
            Some(_) => {
                out.insert(path, (entry.id(), entry.filemode()));
            }
            None => {}
        }
    }
    Ok(())
}

/// Rebuild a nested tree bottom-up from a flattened map.
fn write_nested_tree(
    repo: &git2::Repository,
    entries: &[(&str, git2::Oid, i32)],
) -> Result<git2::Oid> {
    let mut builder = repo.treebuilder(None).context("creating tree builder")?;
    let mut i = 0;
    while i < entries.len() {
        let (path, oid, mode) = entries[i];
        match path.split_once('/') {
            None => {
                builder
                    .insert(path, oid, mode)
                    .with_context(|| format!("inserting {path}"))?;
                i += 1;
            }
            Some((dir, _)) => {
                let prefix = format!("{dir}/");
                let start = i;
                while i < entries.len() && entries[i].0.starts_with(&prefix) {
                    i += 1;
                }
                let children: Vec<(&str, git2::Oid, i32)> = entries[start..i]
                    .iter()
                    .map(|(p, o, m)| (&p[prefix.len()..], *o, *m))
                    .collect();
                let sub = write_nested_tree(repo, &children)?;
                builder
                    .insert(dir, sub, 0o040000)
                    .with_context(|| format!("inserting subtree {dir}"))?;
            }
        }
    }
    builder.write().context("writing tree object")
}

fn build_tree_from_map(
    repo: &git2::Repository,
    map: &BTreeMap<String, (git2::Oid, i32)>,
) -> Result<git2::Oid> {
    let entries: Vec<(&str, git2::Oid, i32)> = map
        .iter()
        .map(|(path, (oid, mode))| (path.as_str(), *oid, *mode))
        .collect();
    write_nested_tree(repo, &entries)
}

/// Read worktree contents into a blob, preserving the executable bit and
/// symlink targets.
fn write_blob_from_worktree(
    repo: &git2::Repository,
    workdir: &Path,
    path: &str,
) -> Result<Option<(git2::Oid, i32)>> {
    let full = workdir.join(path);
    let meta = match fs::symlink_metadata(&full) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("stat {}", full.display())),
    };
    if meta.file_type().is_symlink() {
        let target = fs::read_link(&full)
            .with_context(|| format!("reading symlink {}", full.display()))?;
        let target = target
            .to_str()
            .with_context(|| format!("non-utf8 symlink target in {path}"))?;
        let oid = repo.blob(target.as_bytes()).context("writing symlink blob")?;
        return Ok(Some((oid, 0o120000)));
    }
    if !meta.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(&full).with_context(|| format!("reading {}", full.display()))?;
    let oid = repo
        .blob(&bytes)
        .with_context(|| format!("writing blob for {path}"))?;
    let mode = {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if meta.permissions().mode() & 0o111 != 0 {
                0o100755
            } else {
                0o100644
            }
        }
        #[cfg(not(unix))]
        {
            0o100644
        }
    };
    Ok(Some((oid, mode)))
}

// ===================================================================
// Write step — per-turn shadow snapshot
// ===================================================================

pub struct StepRequest<'a> {
    pub session_id: &'a str,
    pub base_commit: git2::Oid,
    pub worktree_id: &'a str,
    pub changes: &'a ChangeSet,
    pub message: String,
    /// First snapshot of the session: re-derive the full change set from
    /// a status against the base commit, capturing work done before the
    /// framework started observing.
    pub is_first_checkpoint: bool,
}

#[derive(Debug)]
pub struct StepOutcome {
    /// The worktree already matched the shadow tip; nothing was written.
    pub skipped: bool,
    pub commit: Option<git2::Oid>,
    pub ref_name: String,
}

/// Derive the full change set between `base` and the current worktree
/// (including the index and untracked files).
fn full_change_set(ws: &Workspace, base: git2::Oid) -> Result<ChangeSet> {
    let base_tree = ws
        .repo
        .find_commit(base)
        .context("loading base commit")?
        .tree()
        .context("loading base tree")?;
    let mut opts = git2::DiffOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let diff = ws
        .repo
        .diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))
        .context("diffing base against worktree")?;
    let mut changes = ChangeSet::default();
    for delta in diff.deltas() {
        let path = delta
            .new_file()
            .path()
            .or_else(|| delta.old_file().path())
            .and_then(|p| p.to_str());
        let Some(path) = path else { continue };
        if Path::new(path).starts_with(DATA_DIR) {
            continue;
        }
        match delta.status() {
            git2::Delta::Added | git2::Delta::Untracked => changes.added.push(path.to_string()),
            git2::Delta::Deleted => changes.deleted.push(path.to_string()),
            git2::Delta::Modified | git2::Delta::Renamed | git2::Delta::Typechange => {
                changes.modified.push(path.to_string());
            }
            _ => {}
        }
    }
    Ok(changes)
}

/// Snapshot the turn's changes onto the shadow reference for
/// `(base commit, worktree)`.
///
/// Sessions sharing the reference race on the tip; the update is a
/// compare-and-swap, and on conflict the tree is rebuilt on the new tip
/// and retried a bounded number of times.  Two sessions producing the
/// identical tree share the same commit (the dedup fast path).
pub fn write_step(ws: &Workspace, req: &StepRequest) -> Result<StepOutcome> {
    let repo = &ws.repo;
    let ref_name = shadow_ref_name(req.base_commit, req.worktree_id);

    let changes;
    let effective = if req.is_first_checkpoint {
        changes = full_change_set(ws, req.base_commit)?;
        &changes
    } else {
        req.changes
    };

    for attempt in 0..CAS_RETRIES {
        let tip = ref_tip(repo, &ref_name)?;
        let parent_oid = tip.unwrap_or(req.base_commit);
        let parent = repo
            .find_commit(parent_oid)
            .context("loading shadow parent commit")?;

        let mut entries = BTreeMap::new();
        flatten_tree(repo, &parent.tree().context("loading parent tree")?, "", &mut entries)?;
        for path in effective.present_paths() {
            match write_blob_from_worktree(repo, &ws.workdir, path)? {
                Some(entry) => {
                    entries.insert(path.clone(), entry);
                }
                // Gone between status and snapshot: treat as deleted.
                None => {
                    entries.remove(path);
                }
            }
        }
        for path in &effective.deleted {
            entries.remove(path);
        }

        let tree_oid = build_tree_from_map(repo, &entries)?;
        if tree_oid == parent.tree_id() {
            return Ok(StepOutcome {
                skipped: true,
                commit: None,
                ref_name,
            });
        }

        let tree = repo.find_tree(tree_oid).context("loading new tree")?;
        let sig = signature(repo);
        let commit_oid = repo
            .commit(None, &sig, &sig, &req.message, &tree, &[&parent])
            .context("creating shadow commit")?;

        if compare_and_swap(repo, &ref_name, tip, commit_oid, "entire: step")? {
            return Ok(StepOutcome {
                skipped: false,
                commit: Some(commit_oid),
                ref_name,
            });
        }
        tracing::debug!("shadow ref {ref_name} moved, retrying (attempt {})", attempt + 1);
    }
    anyhow::bail!("shadow reference {ref_name} kept moving; giving up after {CAS_RETRIES} attempts");
}

// ===================================================================
// Write committed — condensation output on the permanent reference
// ===================================================================

pub struct CheckpointData<'a> {
    pub checkpoint_id: &'a str,
    pub session_id: &'a str,
    pub agent_name: &'a str,
    pub transcript: &'a [u8],
    pub prompts: &'a [String],
    pub summary: Option<&'a str>,
    /// `(repo path, contents at the time of the real commit)`.
    pub files: &'a [(String, Vec<u8>)],
    pub token_usage: Option<TokenUsage>,
    /// The user commit this condensation belongs to, when there is one.
    pub user_commit: Option<git2::Oid>,
}

const CONTEXT_TEMPLATE: &str = r#"# Checkpoint {{ checkpoint_id }}

- Session: `{{ session_id }}` ({{ agent }})
- Created: {{ created_at }}
{%- if user_commit %}
- Commit: {{ user_commit }}
{%- endif %}
{%- if summary %}

## Summary

{{ summary }}
{%- endif %}
{%- if prompts %}

## Prompts

{%- for prompt in prompts %}
- {{ prompt }}
{%- endfor %}
{%- endif %}
{%- if files %}

## Files

{%- for file in files %}
- `{{ file }}`
{%- endfor %}
{%- endif %}
{%- if tokens %}

## Token usage

- input: {{ tokens.input }}
- output: {{ tokens.output }}
- cache read: {{ tokens.cache_read }}
- cache creation: {{ tokens.cache_creation }}
{%- endif %}
"#;

fn render_context(data: &CheckpointData) -> Result<String> {
    let mut env = minijinja::Environment::new();
    env.add_template("context", CONTEXT_TEMPLATE)
        .context("compiling context template")?;
    let template = env.get_template("context").context("loading context template")?;
    let files: Vec<&str> = data.files.iter().map(|(p, _)| p.as_str()).collect();
    let tokens = data.token_usage.filter(|u| !u.is_empty()).map(|u| {
        minijinja::context! {
            input => u.input_tokens,
            output => u.output_tokens,
            cache_read => u.cache_read_tokens,
            cache_creation => u.cache_creation_tokens,
        }
    });
    template
        .render(minijinja::context! {
            checkpoint_id => data.checkpoint_id,
            session_id => data.session_id,
            agent => data.agent_name,
            created_at => Utc::now().to_rfc3339(),
            user_commit => data.user_commit.map(|c| c.to_string()),
            summary => data.summary,
            prompts => data.prompts,
            files => files,
            tokens => tokens,
        })
        .context("rendering context.md")
}

/// Append one condensed session slice to the permanent reference.
pub fn write_committed(
    repo: &git2::Repository,
    agent: &dyn Agent,
    data: &CheckpointData,
) -> Result<git2::Oid> {
    let mut entries: BTreeMap<String, (git2::Oid, i32)> = BTreeMap::new();

    if data.transcript.len() > TRANSCRIPT_CHUNK_THRESHOLD {
        let chunks = agent.chunk_transcript(data.transcript, TRANSCRIPT_CHUNK_SIZE);
        for (i, chunk) in chunks.iter().enumerate() {
            let oid = repo.blob(chunk).context("writing transcript chunk")?;
            entries.insert(format!("transcript/{i:04}"), (oid, 0o100644));
        }
    } else {
        let oid = repo.blob(data.transcript).context("writing transcript blob")?;
        entries.insert("transcript".into(), (oid, 0o100644));
    }

    if !data.prompts.is_empty() {
        let joined = data.prompts.join("\n\n") + "\n";
        let oid = repo.blob(joined.as_bytes()).context("writing prompts blob")?;
        entries.insert("prompts".into(), (oid, 0o100644));
    }

    if let Some(summary) = data.summary {
        let oid = repo.blob(summary.as_bytes()).context("writing summary blob")?;
        entries.insert("summary".into(), (oid, 0o100644));
    }

    let context_md = render_context(data)?;
    let oid = repo
        .blob(context_md.as_bytes())
        .context("writing context blob")?;
    entries.insert("context.md".into(), (oid, 0o100644));

    for (path, contents) in data.files {
        let oid = repo
            .blob(contents)
            .with_context(|| format!("writing snapshot blob for {path}"))?;
        entries.insert(format!("files/{path}"), (oid, 0o100644));
    }

    let tree_oid = build_tree_from_map(repo, &entries)?;
    let tree = repo.find_tree(tree_oid).context("loading checkpoint tree")?;
    let sig = signature(repo);
    let message = format!(
        "entire: checkpoint {id}\n\n{key}: {id}\nEntire-Session: {sid}\n",
        id = data.checkpoint_id,
        key = trailer::TRAILER_KEY,
        sid = data.session_id,
    );

    for _ in 0..CAS_RETRIES {
        let tip = ref_tip(repo, CHECKPOINTS_REF)?;
        let commit_oid = match tip {
            Some(tip_oid) => {
                let parent = repo
                    .find_commit(tip_oid)
                    .context("loading checkpoint tip")?;
                repo.commit(None, &sig, &sig, &message, &tree, &[&parent])
            }
            None => repo.commit(None, &sig, &sig, &message, &tree, &[]),
        }
        .context("creating checkpoint commit")?;

        if compare_and_swap(repo, CHECKPOINTS_REF, tip, commit_oid, "entire: checkpoint")? {
            return Ok(commit_oid);
        }
    }
    anyhow::bail!("checkpoint reference kept moving; giving up after {CAS_RETRIES} attempts");
}

// ===================================================================
// Read-back
// ===================================================================

/// One condensation commit on the permanent reference, as listed by
/// `entire checkpoints`.
#[derive(Debug)]
pub struct CheckpointSummary {
    pub commit: git2::Oid,
    pub checkpoint_id: Option<String>,
    pub session_id: Option<String>,
    pub summary: Option<String>,
}

/// All condensation commits on the permanent reference, newest first.
pub fn list_checkpoints(repo: &git2::Repository) -> Result<Vec<CheckpointSummary>> {
    let Some(tip) = ref_tip(repo, CHECKPOINTS_REF)? else {
        return Ok(Vec::new());
    };
    let mut walk = repo.revwalk().context("starting revwalk")?;
    walk.push(tip).context("pushing checkpoint tip")?;
    let mut checkpoints = Vec::new();
    for oid in walk {
        let oid = oid.context("walking checkpoint history")?;
        let commit = repo.find_commit(oid).context("loading checkpoint commit")?;
        let message = commit.message().unwrap_or_default();
        let session_id = message
            .lines()
            .find_map(|l| l.strip_prefix("Entire-Session:"))
            .map(|v| v.trim().to_string());
        let summary = commit
            .tree()
            .ok()
            .and_then(|tree| tree.get_name("summary").map(|e| e.id()))
            .and_then(|id| repo.find_blob(id).ok())
            .map(|blob| String::from_utf8_lossy(blob.content()).trim().to_string());
        checkpoints.push(CheckpointSummary {
            commit: oid,
            checkpoint_id: trailer::parse_trailer(message),
            session_id,
            summary,
        });
    }
    Ok(checkpoints)
}

/// The stored `context.md` rollup of a condensation commit.
pub fn read_committed_context(
    repo: &git2::Repository,
    checkpoint_commit: git2::Oid,
) -> Result<Option<String>> {
    let commit = repo
        .find_commit(checkpoint_commit)
        .context("loading checkpoint commit")?;
    let tree = commit.tree().context("loading checkpoint tree")?;
    let Some(entry) = tree.get_name("context.md") else {
        return Ok(None);
    };
    let blob = repo.find_blob(entry.id()).context("loading context blob")?;
    Ok(Some(String::from_utf8_lossy(blob.content()).into_owned()))
}

/// Locate the condensation commit for a checkpoint ID on the permanent
/// reference.
pub fn find_checkpoint_commit(
    repo: &git2::Repository,
    checkpoint_id: &str,
) -> Result<Option<git2::Oid>> {
    let Some(tip) = ref_tip(repo, CHECKPOINTS_REF)? else {
        return Ok(None);
    };
    let mut walk = repo.revwalk().context("starting revwalk")?;
    walk.push(tip).context("pushing checkpoint tip")?;
    for oid in walk {
        let oid = oid.context("walking checkpoint history")?;
        let commit = repo.find_commit(oid).context("loading checkpoint commit")?;
        if let Some(id) = commit.message().and_then(trailer::parse_trailer) {
            if id == checkpoint_id {
                return Ok(Some(oid));
            }
        }
    }
    Ok(None)
}

/// Reassemble the transcript stored in a condensation commit, whether it
/// was written as a single blob or a chunk subtree.
pub fn read_committed_transcript(
    repo: &git2::Repository,
    agent: &dyn Agent,
    checkpoint_commit: git2::Oid,
) -> Result<Vec<u8>> {
    let commit = repo
        .find_commit(checkpoint_commit)
        .context("loading checkpoint commit")?;
    let tree = commit.tree().context("loading checkpoint tree")?;
    let Some(entry) = tree.get_name("transcript") else {
        return Ok(Vec::new());
    };
    match entry.kind() {
        Some(git2::ObjectType::Blob) => {
            let blob = repo.find_blob(entry.id()).context("loading transcript blob")?;
            Ok(blob.content().to_vec())
        }
        Some(git2::ObjectType::Tree) => {
            let chunks_tree = repo
                .find_tree(entry.id())
                .context("loading transcript chunk tree")?;
            let mut names: Vec<String> = chunks_tree
                .iter()
                .filter_map(|e| e.name().map(String::from))
                .collect();
            names.sort();
            let mut chunks = Vec::new();
            for name in names {
                let entry = chunks_tree
                    .get_name(&name)
                    .context("chunk entry disappeared")?;
                let blob = repo.find_blob(entry.id()).context("loading chunk blob")?;
                chunks.push(blob.content().to_vec());
            }
            Ok(agent.reassemble_transcript(&chunks))
        }
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::claude::ClaudeAgent;
    use crate::paths::testing::temp_workspace;

    fn head_oid(ws: &Workspace) -> git2::Oid {
        ws.repo.head().unwrap().peel_to_commit().unwrap().id()
    }

    fn step_request<'a>(
        ws: &Workspace,
        changes: &'a ChangeSet,
        first: bool,
    ) -> StepRequest<'a> {
        StepRequest {
            session_id: "s1",
            base_commit: head_oid(ws),
            worktree_id: "",
            changes,
            message: "entire: step 1 session s1\n".into(),
            is_first_checkpoint: first,
        }
    }

    #[test]
    fn shadow_ref_names_are_deterministic_per_worktree() {
        let base = git2::Oid::from_str("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        let main = shadow_ref_name(base, "");
        let linked = shadow_ref_name(base, "feature-wt");
        assert!(main.starts_with("refs/heads/shadow/aaaaaaaa-"));
        assert_ne!(main, linked);
        assert_eq!(main, shadow_ref_name(base, ""));
    }

    #[test]
    fn write_step_snapshots_changes_onto_shadow_ref() {
        let (_dir, ws) = temp_workspace();
        fs::write(ws.workdir.join("new.txt"), "hello\n").unwrap();
        let changes = ChangeSet {
            added: vec!["new.txt".into()],
            ..Default::default()
        };

        let outcome = write_step(&ws, &step_request(&ws, &changes, false)).unwrap();
        assert!(!outcome.skipped);
        let commit = ws.repo.find_commit(outcome.commit.unwrap()).unwrap();
        let tree = commit.tree().unwrap();
        assert!(tree.get_name("new.txt").is_some());
        assert!(tree.get_name("README.md").is_some(), "base tree carried over");
        assert_eq!(commit.parent_id(0).unwrap(), head_oid(&ws));
        assert!(ws.repo.find_reference(&outcome.ref_name).is_ok());
    }

    #[test]
    fn identical_worktree_state_is_deduplicated() {
        let (_dir, ws) = temp_workspace();
        fs::write(ws.workdir.join("new.txt"), "hello\n").unwrap();
        let changes = ChangeSet {
            added: vec!["new.txt".into()],
            ..Default::default()
        };

        let first = write_step(&ws, &step_request(&ws, &changes, false)).unwrap();
        assert!(!first.skipped);
        let tip_before = ref_tip(&ws.repo, &first.ref_name).unwrap();

        let second = write_step(&ws, &step_request(&ws, &changes, false)).unwrap();
        assert!(second.skipped);
        assert_eq!(ref_tip(&ws.repo, &second.ref_name).unwrap(), tip_before);
    }

    #[test]
    fn first_checkpoint_derives_full_change_set() {
        let (_dir, ws) = temp_workspace();
        // Work done before the framework started observing.
        fs::write(ws.workdir.join("unseen.txt"), "surprise\n").unwrap();
        fs::write(ws.workdir.join("README.md"), "modified\n").unwrap();

        // Empty input lists: the store must status against the base.
        let changes = ChangeSet::default();
        let outcome = write_step(&ws, &step_request(&ws, &changes, true)).unwrap();
        assert!(!outcome.skipped);
        let tree = ws
            .repo
            .find_commit(outcome.commit.unwrap())
            .unwrap()
            .tree()
            .unwrap();
        assert!(tree.get_name("unseen.txt").is_some());
        let base_entry = tree.get_name("README.md").unwrap();
        let blob = ws.repo.find_blob(base_entry.id()).unwrap();
        assert_eq!(blob.content(), b"modified\n");
    }

    #[test]
    fn deletions_drop_out_of_the_tree() {
        let (_dir, ws) = temp_workspace();
        fs::remove_file(ws.workdir.join("README.md")).unwrap();
        let changes = ChangeSet {
            deleted: vec!["README.md".into()],
            ..Default::default()
        };
        let outcome = write_step(&ws, &step_request(&ws, &changes, false)).unwrap();
        assert!(!outcome.skipped);
        let tree = ws
            .repo
            .find_commit(outcome.commit.unwrap())
            .unwrap()
            .tree()
            .unwrap();
        assert!(tree.get_name("README.md").is_none());
    }

    #[test]
    fn nested_paths_rebuild_subtrees() {
        let (_dir, ws) = temp_workspace();
        fs::create_dir_all(ws.workdir.join("src/deep")).unwrap();
        fs::write(ws.workdir.join("src/deep/mod.rs"), "pub fn f() {}\n").unwrap();
        let changes = ChangeSet {
            added: vec!["src/deep/mod.rs".into()],
            ..Default::default()
        };
        let outcome = write_step(&ws, &step_request(&ws, &changes, false)).unwrap();
        let tree = ws
            .repo
            .find_commit(outcome.commit.unwrap())
            .unwrap()
            .tree()
            .unwrap();
        let entry = tree.get_path(Path::new("src/deep/mod.rs")).unwrap();
        let blob = ws.repo.find_blob(entry.id()).unwrap();
        assert_eq!(blob.content(), b"pub fn f() {}\n");
    }

    #[test]
    fn committed_checkpoint_round_trips_transcript() {
        let (_dir, ws) = temp_workspace();
        let agent = ClaudeAgent;
        let transcript = b"{\"type\":\"user\"}\n{\"type\":\"assistant\"}\n";
        let id = trailer::new_checkpoint_id();
        let prompts = vec!["add a thing".to_string()];
        let files = vec![("a.txt".to_string(), b"contents\n".to_vec())];

        let commit_oid = write_committed(
            &ws.repo,
            &agent,
            &CheckpointData {
                checkpoint_id: &id,
                session_id: "s1",
                agent_name: "claude",
                transcript,
                prompts: &prompts,
                summary: Some("Added a thing."),
                files: &files,
                token_usage: None,
                user_commit: Some(head_oid(&ws)),
            },
        )
        .unwrap();

        assert_eq!(
            find_checkpoint_commit(&ws.repo, &id).unwrap(),
            Some(commit_oid)
        );
        assert_eq!(
            read_committed_transcript(&ws.repo, &agent, commit_oid).unwrap(),
            transcript.to_vec()
        );

        let tree = ws.repo.find_commit(commit_oid).unwrap().tree().unwrap();
        for name in ["prompts", "summary", "context.md"] {
            assert!(tree.get_name(name).is_some(), "missing {name}");
        }
        let file_entry = tree.get_path(Path::new("files/a.txt")).unwrap();
        let blob = ws.repo.find_blob(file_entry.id()).unwrap();
        assert_eq!(blob.content(), b"contents\n");
    }

    #[test]
    fn large_transcripts_chunk_and_reassemble() {
        let (_dir, ws) = temp_workspace();
        let agent = ClaudeAgent;
        // Above the chunk threshold, on line boundaries.
        let line = format!("{{\"type\":\"assistant\",\"pad\":\"{}\"}}\n", "x".repeat(200));
        let mut transcript = String::new();
        while transcript.len() <= TRANSCRIPT_CHUNK_THRESHOLD {
            transcript.push_str(&line);
        }
        let id = trailer::new_checkpoint_id();
        let commit_oid = write_committed(
            &ws.repo,
            &agent,
            &CheckpointData {
                checkpoint_id: &id,
                session_id: "s1",
                agent_name: "claude",
                transcript: transcript.as_bytes(),
                prompts: &[],
                summary: None,
                files: &[],
                token_usage: None,
                user_commit: None,
            },
        )
        .unwrap();

        let tree = ws.repo.find_commit(commit_oid).unwrap().tree().unwrap();
        let entry = tree.get_name("transcript").unwrap();
        assert_eq!(entry.kind(), Some(git2::ObjectType::Tree), "chunk subtree");
        assert_eq!(
            read_committed_transcript(&ws.repo, &agent, commit_oid).unwrap(),
            transcript.into_bytes()
        );
    }

    #[test]
    fn permanent_ref_advances_one_commit_per_condensation() {
        let (_dir, ws) = temp_workspace();
        let agent = ClaudeAgent;
        let mut tips = Vec::new();
        for _ in 0..2 {
            let id = trailer::new_checkpoint_id();
            write_committed(
                &ws.repo,
                &agent,
                &CheckpointData {
                    checkpoint_id: &id,
                    session_id: "s1",
                    agent_name: "claude",
                    transcript: b"{}\n",
                    prompts: &[],
                    summary: None,
                    files: &[],
                    token_usage: None,
                    user_commit: None,
                },
            )
            .unwrap();
            tips.push(ref_tip(&ws.repo, CHECKPOINTS_REF).unwrap().unwrap());
        }
        let second = ws.repo.find_commit(tips[1]).unwrap();
        assert_eq!(second.parent_id(0).unwrap(), tips[0]);
    }
}
