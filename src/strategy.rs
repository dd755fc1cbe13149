use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::agent::{Agent, Registry};
use crate::capture::{changed_since, ChangeSet, PrePromptSnapshot};
use crate::checkpoint::{trailer, write_committed, write_step, CheckpointData, StepRequest};
use crate::event::TokenUsage;
use crate::paths::{Workspace, DATA_DIR};
use crate::session::machine::{transition, Action, MachineEvent};
use crate::session::state::{Phase, SessionState, SessionStore};
use crate::settings::Settings;

/// The manual-commit policy: steps accumulate on shadow references while
/// the agent works, and condensation happens when the user makes a real
/// commit (or, for queued turn checkpoints, at turn end).
pub struct ManualCommitStrategy<'a> {
    pub ws: &'a Workspace,
    pub settings: &'a Settings,
    pub store: SessionStore,
}

/// Where the `prepare-commit-msg` hook parks the checkpoint ID it wrote
/// into the message, for the post-commit routine to consume.
const PARKED_TRAILER_FILE: &str = "pending-trailer";

impl<'a> ManualCommitStrategy<'a> {
    pub fn new(ws: &'a Workspace, settings: &'a Settings) -> Self {
        let store = SessionStore::new(ws.sessions_dir());
        Self {
            ws,
            settings,
            store,
        }
    }

    // ---------------------------------------------------------------
    // Session initialization
    // ---------------------------------------------------------------

    /// Create the state record for a fresh session: phase ACTIVE, base
    /// commit at HEAD, worktree identity captured.
    pub fn initialize_session(
        &self,
        agent: &dyn Agent,
        session_id: &str,
        transcript_path: Option<&str>,
        first_prompt: Option<&str>,
    ) -> Result<SessionState> {
        let head = self.ws.head_commit()?;
        let mut state = SessionState::new(
            session_id,
            agent.kind(),
            self.ws.workdir.clone(),
            self.ws.worktree_id.clone(),
            head.id().to_string(),
            Utc::now(),
        );
        state.transcript_path = transcript_path.map(String::from);
        state.first_prompt = first_prompt.map(String::from);
        self.store.save(&state)?;
        Ok(state)
    }

    // ---------------------------------------------------------------
    // Save step (per turn, hot path)
    // ---------------------------------------------------------------

    /// Snapshot the turn's file changes onto the shadow reference and
    /// fold them into the session's carry-forward set.
    ///
    /// Never touches `checkpoint_transcript_start`; only condensation
    /// advances the cursor.
    pub fn save_step(
        &self,
        agent: &dyn Agent,
        state: &mut SessionState,
        snapshot: &PrePromptSnapshot,
    ) -> Result<()> {
        // No commits yet means no base to snapshot against.
        self.ws.head_commit()?;

        if self.ws.on_default_branch() {
            tracing::warn!(
                session = %state.session_id,
                "on a default branch; skipping step snapshot"
            );
            return Ok(());
        }

        let mut changes = changed_since(self.ws, &snapshot.untracked_files)?;
        // Fold in files the transcript says the agent wrote; the status
        // scan can miss paths that were touched and then reverted by
        // later edits in the same turn.
        if let (Some(analyzer), Some(session_ref)) =
            (agent.as_analyzer(), state.transcript_path.as_deref())
        {
            match analyzer.modified_files_from_offset(session_ref, snapshot.transcript_offset) {
                Ok((reported, _)) => self.merge_reported_files(&mut changes, &reported),
                Err(e) => tracing::warn!("extracting modified files: {e:#}"),
            }
        }
        let is_first = state.step_count == 0;
        if changes.is_empty() && !is_first {
            tracing::debug!(session = %state.session_id, "no file changes this turn");
            return Ok(());
        }

        let base_commit = git2::Oid::from_str(&state.base_commit)
            .with_context(|| format!("invalid base commit {:?}", state.base_commit))?;
        let step = state.step_count + 1;
        let mut message = format!("entire: step {step} session {}\n", state.session_id);
        message.push_str(&format!(
            "\nEntire-Session: {}\nEntire-Step: {step}\nEntire-Timestamp: {}\n",
            state.session_id,
            Utc::now().to_rfc3339(),
        ));
        if let Some(pending) = &state.pending_checkpoint_id {
            message.push_str(&format!("{}: {pending}\n", trailer::TRAILER_KEY));
        }

        let outcome = write_step(
            self.ws,
            &StepRequest {
                session_id: &state.session_id,
                base_commit,
                worktree_id: &state.worktree_id,
                changes: &changes,
                message,
                is_first_checkpoint: is_first,
            },
        )?;

        if outcome.skipped {
            tracing::debug!(
                session = %state.session_id,
                "worktree unchanged since last step; skipping"
            );
        } else {
            state.step_count += 1;
        }

        self.merge_files_touched(state, &changes)?;
        state.last_interaction_time = Utc::now();
        Ok(())
    }

    /// Fold the turn's change set into `files_touched`, excluding files
    /// whose worktree content already matches HEAD (the agent committed
    /// them mid-turn).
    fn merge_files_touched(&self, state: &mut SessionState, changes: &ChangeSet) -> Result<()> {
        let head_tree = self.ws.head_commit()?.tree().context("loading HEAD tree")?;
        for path in changes.present_paths() {
            if self.content_matches_head(&head_tree, path) {
                continue;
            }
            state.files_touched.insert(path.clone());
        }
        for path in &changes.deleted {
            state.files_touched.insert(path.clone());
        }
        Ok(())
    }

    /// Merge transcript-reported paths into the change set.  Reported
    /// paths may be absolute; anything outside the worktree, inside the
    /// framework directory, already listed, or no longer on disk is
    /// dropped.
    fn merge_reported_files(&self, changes: &mut ChangeSet, reported: &[String]) {
        for path in reported {
            let raw = Path::new(path);
            let rel = match raw.strip_prefix(&self.ws.workdir) {
                Ok(rel) => rel.to_string_lossy().into_owned(),
                Err(_) if raw.is_absolute() => continue,
                Err(_) => path.clone(),
            };
            if Path::new(&rel).starts_with(DATA_DIR) {
                continue;
            }
            if changes.modified.contains(&rel)
                || changes.added.contains(&rel)
                || changes.deleted.contains(&rel)
            {
                continue;
            }
            if self.ws.workdir.join(&rel).is_file() {
                changes.modified.push(rel);
            }
        }
        changes.modified.sort();
    }

    fn content_matches_head(&self, head_tree: &git2::Tree, path: &str) -> bool {
        let Ok(entry) = head_tree.get_path(Path::new(path)) else {
            return false;
        };
        let Ok(bytes) = fs::read(self.ws.workdir.join(path)) else {
            return false;
        };
        git2::Oid::hash_object(git2::ObjectType::Blob, &bytes)
            .map(|oid| oid == entry.id())
            .unwrap_or(false)
    }

    // ---------------------------------------------------------------
    // Subagent incremental steps
    // ---------------------------------------------------------------

    /// Save a step for a finished subagent task and queue a checkpoint ID
    /// for the enclosing turn's end to condense.
    pub fn save_subagent_step(
        &self,
        agent: &dyn Agent,
        state: &mut SessionState,
        snapshot: &PrePromptSnapshot,
        subagent_id: &str,
    ) -> Result<()> {
        if self.ws.on_default_branch() {
            tracing::warn!(
                session = %state.session_id,
                "on a default branch; skipping subagent snapshot"
            );
            return Ok(());
        }
        let mut changes = changed_since(self.ws, &snapshot.untracked_files)?;
        if let (Some(extractor), Some(session_ref)) =
            (agent.as_subagent_extractor(), state.transcript_path.as_deref())
        {
            match extractor.subagent_modified_files(session_ref) {
                Ok(reported) => self.merge_reported_files(&mut changes, &reported),
                Err(e) => tracing::warn!("extracting subagent files: {e:#}"),
            }
        }
        if changes.is_empty() {
            return Ok(());
        }
        self.save_step_for_changes(state, &changes, subagent_id)?;
        state
            .turn_checkpoint_ids
            .push(trailer::new_checkpoint_id());
        Ok(())
    }

    fn save_step_for_changes(
        &self,
        state: &mut SessionState,
        changes: &ChangeSet,
        label: &str,
    ) -> Result<()> {
        let base_commit = git2::Oid::from_str(&state.base_commit)
            .with_context(|| format!("invalid base commit {:?}", state.base_commit))?;
        let step = state.step_count + 1;
        let message = format!(
            "entire: step {step} ({label}) session {sid}\n\nEntire-Session: {sid}\nEntire-Step: {step}\n",
            sid = state.session_id,
        );
        let outcome = write_step(
            self.ws,
            &StepRequest {
                session_id: &state.session_id,
                base_commit,
                worktree_id: &state.worktree_id,
                changes,
                message,
                is_first_checkpoint: false,
            },
        )?;
        if !outcome.skipped {
            state.step_count += 1;
        }
        self.merge_files_touched(state, changes)?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Turn-end condensation of queued checkpoints
    // ---------------------------------------------------------------

    /// Drain the turn's checkpoint work list (subagent checkpoints plus a
    /// pending ID left by a mid-turn commit) into permanent checkpoints.
    /// Operates on the step history, not on a user commit.
    pub fn handle_turn_end(&self, agent: &dyn Agent, state: &mut SessionState) -> Result<()> {
        let mut queue = std::mem::take(&mut state.turn_checkpoint_ids);
        if let Some(pending) = state.pending_checkpoint_id.take() {
            queue.push(pending);
        }
        if queue.is_empty() {
            return Ok(());
        }

        let gathered = gather_condensation(agent, self.settings, state);
        let files = self.worktree_file_snapshots(&state.files_touched);
        for checkpoint_id in &queue {
            write_committed(
                &self.ws.repo,
                agent,
                &CheckpointData {
                    checkpoint_id,
                    session_id: &state.session_id,
                    agent_name: agent.name(),
                    transcript: &gathered.transcript,
                    prompts: &gathered.prompts,
                    summary: gathered.summary.as_deref(),
                    files: &files,
                    token_usage: gathered.tokens,
                    user_commit: None,
                },
            )?;
            tracing::info!(
                session = %state.session_id,
                checkpoint = checkpoint_id.as_str(),
                "condensed turn checkpoint"
            );
        }
        if let Some(end) = gathered.end_position {
            state.checkpoint_transcript_start = end.max(state.checkpoint_transcript_start);
        }
        Ok(())
    }

    /// Current worktree contents of a path set (turn-window snapshots,
    /// i.e. not yet at HEAD).
    fn worktree_file_snapshots(&self, paths: &BTreeSet<String>) -> Vec<(String, Vec<u8>)> {
        let mut files = Vec::new();
        for path in paths {
            match fs::read(self.ws.workdir.join(path)) {
                Ok(bytes) => files.push((path.clone(), bytes)),
                Err(e) => tracing::debug!("skipping snapshot of {path}: {e}"),
            }
        }
        files
    }

    // ---------------------------------------------------------------
    // Post-commit condensation
    // ---------------------------------------------------------------

    /// The routine behind the `post-commit` git hook.  Decides which
    /// sessions the just-made commit belongs to, condenses their shadow
    /// history onto the permanent reference, and carries forward files
    /// the commit did not include.
    pub fn post_commit(&self, registry: &Registry) -> Result<()> {
        let head = self.ws.head_commit()?;
        let head_oid = head.id();
        let commit_files = commit_file_set(&self.ws.repo, &head)?;

        // The trailer carries the checkpoint ID minted at
        // prepare-commit-msg time; the parked copy covers messages the
        // user rewrote.  Either way it is consumed exactly once.
        let parked = self.take_parked_trailer()?;
        let mut trailer_id = head.message().and_then(trailer::parse_trailer).or(parked);
        if trailer_id.is_none() {
            tracing::debug!("commit {head_oid} carries no checkpoint trailer");
        }

        let now = Utc::now();
        for mut state in self.store.list()? {
            if state.worktree_id != self.ws.worktree_id {
                continue;
            }
            if state.phase == Phase::Ended && state.files_touched.is_empty() {
                continue;
            }
            let overlap: BTreeSet<String> = state
                .files_touched
                .intersection(&commit_files)
                .cloned()
                .collect();
            let in_turn = state.phase.in_turn();
            if overlap.is_empty() && !in_turn {
                // Old sessions are not re-condensed on unrelated
                // commits, and their base commit stays frozen.
                continue;
            }

            let Some(agent) = registry.by_kind(state.agent_type) else {
                tracing::warn!(
                    session = %state.session_id,
                    "no adapter for {}; skipping condensation",
                    state.agent_type
                );
                continue;
            };

            // The first condensed session takes the trailer's ID;
            // concurrent sessions condensing into the same commit get
            // their own checkpoints.
            let checkpoint_id = trailer_id
                .take()
                .unwrap_or_else(trailer::new_checkpoint_id);

            let gathered = gather_condensation(agent, self.settings, &state);
            let files = self.head_file_snapshots(&head, &overlap);
            write_committed(
                &self.ws.repo,
                agent,
                &CheckpointData {
                    checkpoint_id: &checkpoint_id,
                    session_id: &state.session_id,
                    agent_name: agent.name(),
                    transcript: &gathered.transcript,
                    prompts: &gathered.prompts,
                    summary: gathered.summary.as_deref(),
                    files: &files,
                    token_usage: gathered.tokens,
                    user_commit: Some(head_oid),
                },
            )?;
            tracing::info!(
                session = %state.session_id,
                checkpoint = checkpoint_id.as_str(),
                commit = %head_oid,
                files = overlap.len(),
                "condensed session into commit"
            );

            match transition(state.phase, MachineEvent::GitCommit) {
                Ok(t) => {
                    state.phase = t.phase;
                    if t.actions.contains(&Action::AdvanceBaseCommit) {
                        state.base_commit = head_oid.to_string();
                    }
                }
                Err(e) => tracing::warn!("{e}"),
            }
            // A condensed idle session also moves to the new base so a
            // resumed turn snapshots against the commit that now holds
            // its work; disjoint commits never reach this point.
            if !overlap.is_empty() {
                state.base_commit = head_oid.to_string();
            }
            if in_turn {
                state.pending_checkpoint_id = Some(checkpoint_id);
            }
            state.step_count = 0;
            if let Some(end) = gathered.end_position {
                state.checkpoint_transcript_start =
                    end.max(state.checkpoint_transcript_start);
            }
            state.files_touched = state
                .files_touched
                .difference(&commit_files)
                .cloned()
                .collect();
            state.last_interaction_time = now;
            self.store.save(&state)?;
        }
        Ok(())
    }

    /// Contents of the overlap paths as committed at HEAD.  Paths the
    /// commit deleted have no content and are skipped.
    fn head_file_snapshots(
        &self,
        head: &git2::Commit,
        paths: &BTreeSet<String>,
    ) -> Vec<(String, Vec<u8>)> {
        let Ok(tree) = head.tree() else {
            return Vec::new();
        };
        let mut files = Vec::new();
        for path in paths {
            let Ok(entry) = tree.get_path(Path::new(path)) else {
                continue;
            };
            if let Ok(blob) = self.ws.repo.find_blob(entry.id()) {
                files.push((path.clone(), blob.content().to_vec()));
            }
        }
        files
    }

    // ---------------------------------------------------------------
    // Parked trailer (prepare-commit-msg → post-commit)
    // ---------------------------------------------------------------

    pub fn park_trailer(&self, checkpoint_id: &str) -> Result<()> {
        crate::paths::write_atomic(
            &self.ws.tmp_dir.join(PARKED_TRAILER_FILE),
            checkpoint_id.as_bytes(),
        )
    }

    fn take_parked_trailer(&self) -> Result<Option<String>> {
        let path = self.ws.tmp_dir.join(PARKED_TRAILER_FILE);
        let id = match fs::read_to_string(&path) {
            Ok(s) => s.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        crate::paths::remove_if_exists(&path)?;
        Ok((!id.is_empty()).then_some(id))
    }

    /// Whether any session on this worktree could condense into a commit
    /// made right now.  Used by `prepare-commit-msg` to decide whether a
    /// trailer belongs on the message.
    pub fn has_condensation_candidate(&self) -> Result<bool> {
        Ok(self.store.list()?.iter().any(|s| {
            s.worktree_id == self.ws.worktree_id
                && (s.phase.in_turn() || !s.files_touched.is_empty())
        }))
    }
}

// ===================================================================
// Condensation data gathering
// ===================================================================

struct Condensation {
    transcript: Vec<u8>,
    prompts: Vec<String>,
    summary: Option<String>,
    tokens: Option<TokenUsage>,
    end_position: Option<u64>,
}

impl Condensation {
    fn empty() -> Self {
        Self {
            transcript: Vec::new(),
            prompts: Vec::new(),
            summary: None,
            tokens: None,
            end_position: None,
        }
    }
}

/// Pull the transcript slice, prompts, summary, and token usage for a
/// session starting at its checkpoint cursor.  Every failure here
/// degrades to a warning — condensation proceeds with whatever could be
/// extracted.
fn gather_condensation(
    agent: &dyn Agent,
    settings: &Settings,
    state: &SessionState,
) -> Condensation {
    let Some(session_ref) = state.transcript_path.as_deref() else {
        return Condensation::empty();
    };
    let from = state.checkpoint_transcript_start;
    let mut out = Condensation::empty();

    match agent.as_analyzer() {
        Some(analyzer) => {
            match analyzer.transcript_slice(session_ref, from) {
                Ok(slice) => out.transcript = slice,
                Err(e) => tracing::warn!("extracting transcript slice: {e:#}"),
            }
            match analyzer.prompts_from_offset(session_ref, from) {
                Ok(prompts) => out.prompts = prompts,
                Err(e) => tracing::warn!("extracting prompts: {e:#}"),
            }
            if settings.summarize {
                match analyzer.summary(session_ref) {
                    Ok(summary) => out.summary = summary,
                    Err(e) => tracing::warn!("extracting summary: {e:#}"),
                }
            }
            match analyzer.transcript_position(session_ref) {
                Ok(pos) => out.end_position = Some(pos),
                Err(e) => tracing::warn!("reading transcript position: {e:#}"),
            }
        }
        None => match agent.read_transcript(session_ref) {
            Ok(bytes) => out.transcript = bytes,
            Err(e) => tracing::warn!("reading transcript: {e:#}"),
        },
    }

    if let Some(calculator) = agent.as_token_calculator() {
        match calculator.token_usage(session_ref, from) {
            Ok(usage) if !usage.is_empty() => out.tokens = Some(usage),
            Ok(_) => {}
            Err(e) => tracing::warn!("calculating token usage: {e:#}"),
        }
    }
    out
}

/// The file set touched by a commit: its tree delta against the first
/// parent (or against the empty tree for a root commit).
pub fn commit_file_set(
    repo: &git2::Repository,
    commit: &git2::Commit,
) -> Result<BTreeSet<String>> {
    let tree = commit.tree().context("loading commit tree")?;
    let parent_tree = match commit.parent(0) {
        Ok(parent) => Some(parent.tree().context("loading parent tree")?),
        Err(_) => None,
    };
    let diff = repo
        .diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)
        .context("diffing commit against parent")?;
    let mut files = BTreeSet::new();
    for delta in diff.deltas() {
        for file in [delta.new_file(), delta.old_file()] {
            if let Some(path) = file.path().and_then(|p| p.to_str()) {
                files.insert(path.to_string());
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::claude::ClaudeAgent;
    use crate::agent::Registry;
    use crate::checkpoint::CHECKPOINTS_REF;
    use crate::paths::testing::{commit_paths, temp_workspace};

    fn checkpoint_count(ws: &Workspace) -> usize {
        let Ok(reference) = ws.repo.find_reference(CHECKPOINTS_REF) else {
            return 0;
        };
        let mut walk = ws.repo.revwalk().unwrap();
        walk.push(reference.target().unwrap()).unwrap();
        walk.count()
    }

    fn strategy_over<'a>(
        ws: &'a Workspace,
        settings: &'a Settings,
    ) -> ManualCommitStrategy<'a> {
        ManualCommitStrategy::new(ws, settings)
    }

    #[test]
    fn save_step_counts_and_deduplicates() {
        let (_dir, ws) = temp_workspace();
        let settings = Settings::default();
        let strategy = strategy_over(&ws, &settings);
        let mut state = strategy
            .initialize_session(&ClaudeAgent, "s1", None, Some("write x"))
            .unwrap();

        fs::write(ws.workdir.join("x.txt"), "x\n").unwrap();
        let snapshot = crate::capture::PrePromptSnapshot::empty(Utc::now());
        strategy.save_step(&ClaudeAgent, &mut state, &snapshot).unwrap();
        assert_eq!(state.step_count, 1);
        assert!(state.files_touched.contains("x.txt"));
        assert_eq!(state.checkpoint_transcript_start, 0);

        // Identical worktree state: the second save is a no-op.
        strategy.save_step(&ClaudeAgent, &mut state, &snapshot).unwrap();
        assert_eq!(state.step_count, 1);
    }

    #[test]
    fn post_commit_freezes_idle_sessions_until_their_files_land() {
        let (_dir, ws) = temp_workspace();
        let settings = Settings::default();
        let registry = Registry::builtin();
        let strategy = strategy_over(&ws, &settings);

        // An idle session carrying b.txt forward.
        let mut state = strategy
            .initialize_session(&ClaudeAgent, "s1", None, None)
            .unwrap();
        let original_base = state.base_commit.clone();
        state.phase = Phase::Idle;
        state.files_touched.insert("b.txt".into());
        strategy.store.save(&state).unwrap();
        fs::write(ws.workdir.join("b.txt"), "b\n").unwrap();

        // Unrelated commits leave it frozen.
        fs::write(ws.workdir.join("c.txt"), "c\n").unwrap();
        commit_paths(&ws, &["c.txt"], "unrelated");
        strategy.post_commit(&registry).unwrap();
        let state = strategy.store.load("s1").unwrap().unwrap();
        assert_eq!(state.base_commit, original_base);
        assert_eq!(checkpoint_count(&ws), 0);

        // The commit that finally includes b.txt condenses it once.
        let b_commit = commit_paths(&ws, &["b.txt"], "add b");
        strategy.post_commit(&registry).unwrap();
        let state = strategy.store.load("s1").unwrap().unwrap();
        assert!(state.files_touched.is_empty());
        assert_eq!(state.base_commit, b_commit.to_string());
        assert_eq!(state.step_count, 0);
        assert_eq!(checkpoint_count(&ws), 1);

        // And later unrelated commits do not re-condense it.
        fs::write(ws.workdir.join("c.txt"), "c2\n").unwrap();
        commit_paths(&ws, &["c.txt"], "unrelated again");
        strategy.post_commit(&registry).unwrap();
        assert_eq!(checkpoint_count(&ws), 1);
        let state = strategy.store.load("s1").unwrap().unwrap();
        assert_eq!(state.base_commit, b_commit.to_string());
    }

    #[test]
    fn mid_turn_commit_parks_a_pending_id_for_turn_end() {
        let (_dir, ws) = temp_workspace();
        let settings = Settings::default();
        let registry = Registry::builtin();
        let strategy = strategy_over(&ws, &settings);

        // An in-flight turn touching w.txt when the user commits it.
        let mut state = strategy
            .initialize_session(&ClaudeAgent, "s1", None, None)
            .unwrap();
        state.files_touched.insert("w.txt".into());
        strategy.store.save(&state).unwrap();
        fs::write(ws.workdir.join("w.txt"), "w\n").unwrap();
        commit_paths(&ws, &["w.txt"], "mid-turn commit");
        strategy.post_commit(&registry).unwrap();

        let mut state = strategy.store.load("s1").unwrap().unwrap();
        assert_eq!(state.phase, Phase::ActiveCommitted);
        let pending = state.pending_checkpoint_id.clone().unwrap();
        assert_eq!(checkpoint_count(&ws), 1);

        // Turn end consumes the pending ID into a second checkpoint.
        strategy.handle_turn_end(&ClaudeAgent, &mut state).unwrap();
        assert!(state.pending_checkpoint_id.is_none());
        assert_eq!(checkpoint_count(&ws), 2);
        let tip = ws
            .repo
            .find_reference(CHECKPOINTS_REF)
            .unwrap()
            .target()
            .unwrap();
        let message = ws
            .repo
            .find_commit(tip)
            .unwrap()
            .message()
            .unwrap()
            .to_string();
        assert!(message.contains(&pending), "pending ID consumed: {message}");

        // Consumed means consumed: nothing left for a second turn end.
        strategy.handle_turn_end(&ClaudeAgent, &mut state).unwrap();
        assert_eq!(checkpoint_count(&ws), 2);
    }

    #[test]
    fn ended_sessions_with_nothing_left_are_ignored() {
        let (_dir, ws) = temp_workspace();
        let settings = Settings::default();
        let registry = Registry::builtin();
        let strategy = strategy_over(&ws, &settings);

        let mut state = strategy
            .initialize_session(&ClaudeAgent, "s1", None, None)
            .unwrap();
        state.phase = Phase::Ended;
        strategy.store.save(&state).unwrap();

        fs::write(ws.workdir.join("c.txt"), "c\n").unwrap();
        commit_paths(&ws, &["c.txt"], "after the session ended");
        strategy.post_commit(&registry).unwrap();
        assert_eq!(checkpoint_count(&ws), 0);
    }

    #[test]
    fn condensation_candidates_gate_the_trailer() {
        let (_dir, ws) = temp_workspace();
        let settings = Settings::default();
        let strategy = strategy_over(&ws, &settings);
        assert!(!strategy.has_condensation_candidate().unwrap());

        let mut state = strategy
            .initialize_session(&ClaudeAgent, "s1", None, None)
            .unwrap();
        assert!(strategy.has_condensation_candidate().unwrap(), "active turn");

        state.phase = Phase::Ended;
        strategy.store.save(&state).unwrap();
        assert!(!strategy.has_condensation_candidate().unwrap());

        state.files_touched.insert("left.txt".into());
        strategy.store.save(&state).unwrap();
        assert!(
            strategy.has_condensation_candidate().unwrap(),
            "carry-forward still condenses"
        );
    }

    #[test]
    fn reported_files_fold_into_the_change_set() {
        let (_dir, ws) = temp_workspace();
        let settings = Settings::default();
        let strategy = strategy_over(&ws, &settings);

        fs::write(ws.workdir.join("seen.txt"), "s\n").unwrap();
        fs::write(ws.workdir.join("reported.txt"), "r\n").unwrap();
        let mut changes = ChangeSet {
            added: vec!["seen.txt".into()],
            ..Default::default()
        };
        let reported = vec![
            // Absolute path inside the worktree.
            ws.workdir.join("reported.txt").to_string_lossy().into_owned(),
            // Already listed.
            "seen.txt".into(),
            // Outside the worktree.
            "/etc/passwd".into(),
            // Framework-internal.
            format!("{DATA_DIR}/tmp/cache.json"),
            // Not on disk any more.
            "gone.txt".into(),
        ];
        strategy.merge_reported_files(&mut changes, &reported);
        assert_eq!(changes.modified, vec!["reported.txt"]);
        assert_eq!(changes.added, vec!["seen.txt"]);
    }

    #[test]
    fn commit_file_set_spans_adds_edits_and_deletes() {
        let (_dir, ws) = temp_workspace();
        fs::write(ws.workdir.join("new.txt"), "n\n").unwrap();
        fs::write(ws.workdir.join("README.md"), "edited\n").unwrap();
        let oid = commit_paths(&ws, &["new.txt", "README.md"], "edit");
        let commit = ws.repo.find_commit(oid).unwrap();
        let files = commit_file_set(&ws.repo, &commit).unwrap();
        assert!(files.contains("new.txt"));
        assert!(files.contains("README.md"));

        fs::remove_file(ws.workdir.join("new.txt")).unwrap();
        let oid = commit_paths(&ws, &["new.txt"], "delete");
        let commit = ws.repo.find_commit(oid).unwrap();
        let files = commit_file_set(&ws.repo, &commit).unwrap();
        assert!(files.contains("new.txt"), "deletions count as touched");
    }
}
