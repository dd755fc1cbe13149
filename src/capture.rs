use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::agent::Agent;
use crate::paths::{remove_if_exists, write_atomic, Workspace, DATA_DIR};

// ===================================================================
// Pre-prompt / pre-task snapshots
// ===================================================================

/// Baseline taken just before the agent starts working, so turn-end can
/// tell which untracked files are new and where the transcript stood.
/// Stored as `.entire/tmp/pre-prompt-<session-id>.json` (or
/// `pre-task-<tool-use-id>.json` for subagents), mode 0600.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrePromptSnapshot {
    pub timestamp: DateTime<Utc>,
    pub untracked_files: BTreeSet<String>,
    pub transcript_offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transcript_id: Option<String>,
}

impl PrePromptSnapshot {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now,
            untracked_files: BTreeSet::new(),
            transcript_offset: 0,
            last_transcript_id: None,
        }
    }
}

fn pre_prompt_path(ws: &Workspace, session_id: &str) -> PathBuf {
    ws.tmp_dir.join(format!("pre-prompt-{session_id}.json"))
}

fn pre_task_path(ws: &Workspace, tool_use_id: &str) -> PathBuf {
    ws.tmp_dir.join(format!("pre-task-{tool_use_id}.json"))
}

/// Build a snapshot of the current worktree and transcript position.
/// Every failure inside is non-fatal: the turn continues with a zero
/// offset and an empty baseline.
pub fn build_snapshot(ws: &Workspace, agent: &dyn Agent, session_ref: Option<&str>) -> PrePromptSnapshot {
    let mut snapshot = PrePromptSnapshot::empty(Utc::now());
    match untracked_files(ws) {
        Ok(files) => snapshot.untracked_files = files,
        Err(e) => tracing::warn!("enumerating untracked files: {e:#}"),
    }
    if let (Some(analyzer), Some(session_ref)) = (agent.as_analyzer(), session_ref) {
        match analyzer.transcript_position(session_ref) {
            Ok(pos) => snapshot.transcript_offset = pos,
            Err(e) => tracing::warn!("reading transcript position: {e:#}"),
        }
        match analyzer.last_transcript_identifier(session_ref) {
            Ok(id) => snapshot.last_transcript_id = id,
            Err(e) => tracing::warn!("reading transcript marker: {e:#}"),
        }
    }
    snapshot
}

pub fn write_pre_prompt(ws: &Workspace, session_id: &str, snapshot: &PrePromptSnapshot) -> Result<()> {
    write_snapshot(&pre_prompt_path(ws, session_id), snapshot)
}

pub fn write_pre_task(ws: &Workspace, tool_use_id: &str, snapshot: &PrePromptSnapshot) -> Result<()> {
    write_snapshot(&pre_task_path(ws, tool_use_id), snapshot)
}

/// Load and delete the pre-prompt snapshot for a session.
pub fn take_pre_prompt(ws: &Workspace, session_id: &str) -> Result<Option<PrePromptSnapshot>> {
    take_snapshot(&pre_prompt_path(ws, session_id))
}

/// Load and delete the pre-task snapshot for a subagent tool-use.
pub fn take_pre_task(ws: &Workspace, tool_use_id: &str) -> Result<Option<PrePromptSnapshot>> {
    take_snapshot(&pre_task_path(ws, tool_use_id))
}

fn write_snapshot(path: &Path, snapshot: &PrePromptSnapshot) -> Result<()> {
    let json = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
    write_atomic(path, &json)
}

fn take_snapshot(path: &Path) -> Result<Option<PrePromptSnapshot>> {
    let contents = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let snapshot = serde_json::from_str(&contents)
        .with_context(|| format!("parsing {}", path.display()))?;
    remove_if_exists(path)?;
    Ok(Some(snapshot))
}

/// Remove any per-session temp files (snapshot, cached transcript) when
/// the session ends.
pub fn cleanup_session_tmp(ws: &Workspace, session_id: &str) -> Result<()> {
    remove_if_exists(&pre_prompt_path(ws, session_id))?;
    remove_if_exists(&ws.tmp_dir.join(format!("{session_id}.json")))?;
    Ok(())
}

// ===================================================================
// Worktree change sets
// ===================================================================

/// File changes the agent made during a turn, relative to the pre-prompt
/// baseline.
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    pub modified: Vec<String>,
    pub added: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.deleted.is_empty()
    }

    /// Every path in the change set except deletions.
    pub fn present_paths(&self) -> impl Iterator<Item = &String> {
        self.modified.iter().chain(self.added.iter())
    }
}

fn status_options() -> git2::StatusOptions {
    let mut opts = git2::StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);
    opts
}

fn is_framework_path(path: &str) -> bool {
    Path::new(path).starts_with(DATA_DIR)
}

/// Untracked paths in the worktree, excluding the framework's own state
/// directory.
pub fn untracked_files(ws: &Workspace) -> Result<BTreeSet<String>> {
    let statuses = ws
        .repo
        .statuses(Some(&mut status_options()))
        .context("reading git status")?;
    let mut files = BTreeSet::new();
    for entry in statuses.iter() {
        if !entry.status().contains(git2::Status::WT_NEW) {
            continue;
        }
        if let Some(path) = entry.path() {
            if !is_framework_path(path) {
                files.insert(path.to_string());
            }
        }
    }
    Ok(files)
}

/// The turn's file-change set: tracked modifications and deletions from
/// git status, plus untracked files that were not in the baseline.
pub fn changed_since(ws: &Workspace, baseline: &BTreeSet<String>) -> Result<ChangeSet> {
    let statuses = ws
        .repo
        .statuses(Some(&mut status_options()))
        .context("reading git status")?;
    let mut change_set = ChangeSet::default();
    for entry in statuses.iter() {
        let Some(path) = entry.path() else { continue };
        if is_framework_path(path) {
            continue;
        }
        let status = entry.status();
        if status.contains(git2::Status::WT_NEW) {
            if !baseline.contains(path) {
                change_set.added.push(path.to_string());
            }
        } else if status.intersects(git2::Status::WT_DELETED | git2::Status::INDEX_DELETED) {
            change_set.deleted.push(path.to_string());
        } else if status.intersects(
            git2::Status::WT_MODIFIED
                | git2::Status::INDEX_MODIFIED
                | git2::Status::INDEX_NEW
                | git2::Status::WT_RENAMED
                | git2::Status::INDEX_RENAMED,
        ) {
            change_set.modified.push(path.to_string());
        }
    }
    change_set.modified.sort();
    change_set.added.sort();
    change_set.deleted.sort();
    Ok(change_set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::claude::ClaudeAgent;
    use crate::paths::testing::temp_workspace;

    #[test]
    fn untracked_enumeration_skips_the_framework_directory() {
        let (_dir, ws) = temp_workspace();
        fs::write(ws.workdir.join("loose.txt"), "x").unwrap();
        fs::create_dir_all(ws.workdir.join("nested/dir")).unwrap();
        fs::write(ws.workdir.join("nested/dir/deep.txt"), "y").unwrap();
        fs::write(ws.tmp_dir.join("internal.json"), "{}").unwrap();

        let files = untracked_files(&ws).unwrap();
        assert!(files.contains("loose.txt"));
        assert!(files.contains("nested/dir/deep.txt"));
        assert!(
            files.iter().all(|f| !f.starts_with(".entire")),
            "framework state must not leak into baselines: {files:?}"
        );
    }

    #[test]
    fn change_set_classifies_against_the_baseline() {
        let (_dir, ws) = temp_workspace();
        // Baseline knows about one pre-existing untracked file.
        fs::write(ws.workdir.join("pre.txt"), "pre").unwrap();
        let baseline = untracked_files(&ws).unwrap();

        fs::write(ws.workdir.join("fresh.txt"), "new").unwrap();
        fs::write(ws.workdir.join("README.md"), "# changed\n").unwrap();

        let changes = changed_since(&ws, &baseline).unwrap();
        assert_eq!(changes.added, vec!["fresh.txt"], "pre.txt is baseline noise");
        assert_eq!(changes.modified, vec!["README.md"]);
        assert!(changes.deleted.is_empty());

        fs::remove_file(ws.workdir.join("README.md")).unwrap();
        let changes = changed_since(&ws, &baseline).unwrap();
        assert_eq!(changes.deleted, vec!["README.md"]);
    }

    #[test]
    fn snapshots_are_consumed_exactly_once() {
        let (_dir, ws) = temp_workspace();
        let snapshot = build_snapshot(&ws, &ClaudeAgent, None);
        write_pre_prompt(&ws, "s1", &snapshot).unwrap();

        let taken = take_pre_prompt(&ws, "s1").unwrap();
        assert!(taken.is_some());
        assert!(take_pre_prompt(&ws, "s1").unwrap().is_none(), "deleted after use");
    }

    #[test]
    fn snapshot_records_transcript_position_and_marker() {
        let (_dir, ws) = temp_workspace();
        let transcript = ws.workdir.join("t.jsonl");
        fs::write(
            &transcript,
            concat!(
                r#"{"type":"user","uuid":"u1","message":{"role":"user","content":"hi"}}"#,
                "\n",
                r#"{"type":"assistant","uuid":"a1","message":{"role":"assistant","content":[{"type":"text","text":"hello"}]}}"#,
                "\n",
            ),
        )
        .unwrap();

        let snapshot = build_snapshot(&ws, &ClaudeAgent, transcript.to_str());
        assert_eq!(snapshot.transcript_offset, 2);
        assert_eq!(snapshot.last_transcript_id.as_deref(), Some("a1"));
    }

    #[test]
    fn missing_transcript_degrades_to_a_zero_offset() {
        let (_dir, ws) = temp_workspace();
        let snapshot = build_snapshot(&ws, &ClaudeAgent, Some("/nonexistent/t.jsonl"));
        assert_eq!(snapshot.transcript_offset, 0);
        assert_eq!(snapshot.last_transcript_id, None);
    }

    #[test]
    fn pre_task_snapshots_are_keyed_by_tool_use() {
        let (_dir, ws) = temp_workspace();
        let snapshot = PrePromptSnapshot::empty(chrono::Utc::now());
        write_pre_task(&ws, "toolu_1", &snapshot).unwrap();
        assert!(take_pre_task(&ws, "toolu_2").unwrap().is_none());
        assert!(take_pre_task(&ws, "toolu_1").unwrap().is_some());
    }
}
