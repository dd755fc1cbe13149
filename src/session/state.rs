use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::agent::AgentKind;
use crate::paths::{remove_if_exists, write_atomic};

// ===================================================================
// Phase
// ===================================================================

/// Where a session sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    /// A turn is in flight.
    Active,
    /// A turn is in flight and a real commit landed mid-turn.
    ActiveCommitted,
    /// Between turns.
    Idle,
    /// The agent ended the session.
    Ended,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::ActiveCommitted => "active-committed",
            Self::Idle => "idle",
            Self::Ended => "ended",
        };
        f.pad(s)
    }
}

impl Phase {
    /// Phases during which a turn is in flight.
    pub fn in_turn(&self) -> bool {
        matches!(self, Self::Active | Self::ActiveCommitted)
    }
}

// ===================================================================
// Session record
// ===================================================================

/// One persisted record per session ID, stored as
/// `<common-dir>/sessions/<session-id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,
    pub agent_type: AgentKind,
    pub worktree_path: PathBuf,
    pub worktree_id: String,
    /// HEAD when this session last saved a step; advanced on real commits
    /// the session condensed into (frozen otherwise once idle).
    pub base_commit: String,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub last_interaction_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Shadow commits made since the last condensation.
    #[serde(default)]
    pub step_count: u32,
    /// Transcript cursor the next extraction starts from.  Monotonically
    /// non-decreasing except for the reset on compaction.
    #[serde(default)]
    pub checkpoint_transcript_start: u64,
    /// Files modified this session that have not yet reached HEAD.
    #[serde(default)]
    pub files_touched: BTreeSet<String>,
    /// Set by post-commit condensation, consumed by at most one
    /// subsequent turn-end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
    /// Checkpoint IDs created this turn that still need condensing.
    #[serde(default)]
    pub turn_checkpoint_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_prompt: Option<String>,
}

/// Legacy field from earlier releases, migrated once at load time.
const LEGACY_TRANSCRIPT_LINES: &str = "condensedTranscriptLines";
const CURRENT_TRANSCRIPT_START: &str = "checkpointTranscriptStart";

impl SessionState {
    pub fn new(
        session_id: impl Into<String>,
        agent_type: AgentKind,
        worktree_path: PathBuf,
        worktree_id: impl Into<String>,
        base_commit: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent_type,
            worktree_path,
            worktree_id: worktree_id.into(),
            base_commit: base_commit.into(),
            phase: Phase::Active,
            started_at: now,
            last_interaction_time: now,
            ended_at: None,
            step_count: 0,
            checkpoint_transcript_start: 0,
            files_touched: BTreeSet::new(),
            pending_checkpoint_id: None,
            transcript_path: None,
            turn_checkpoint_ids: Vec::new(),
            first_prompt: None,
        }
    }

    /// Eligible for the stale-session sweep: ended or idle, nothing left
    /// to carry forward, and untouched since `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        matches!(self.phase, Phase::Idle | Phase::Ended)
            && self.files_touched.is_empty()
            && now - self.last_interaction_time > threshold
    }
}

// ===================================================================
// Store
// ===================================================================

/// Loads and saves session records.  All writes go through
/// write-temp-then-rename so concurrent readers never see partial state.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(sessions_dir: PathBuf) -> Self {
        Self { dir: sessions_dir }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    /// Load one session record.  Returns `None` when no record exists.
    /// Performs the one-shot migration from the legacy
    /// `condensedTranscriptLines` field.
    pub fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        let path = self.path_for(session_id);
        let contents = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let state = parse_state(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(state))
    }

    /// Persist one session record atomically.
    pub fn save(&self, state: &SessionState) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let json = serde_json::to_vec_pretty(state).context("serializing session state")?;
        write_atomic(&self.path_for(&state.session_id), &json)
    }

    /// All session records in the store, skipping files that fail to
    /// parse (they are warned about, not fatal — a corrupt record must
    /// not block other sessions).
    pub fn list(&self) -> Result<Vec<SessionState>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.dir.display())),
        };
        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path).map_err(anyhow::Error::from).and_then(|s| parse_state(&s)) {
                Ok(state) => sessions.push(state),
                Err(e) => {
                    tracing::warn!("skipping unreadable session record {}: {e:#}", path.display());
                }
            }
        }
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    pub fn remove(&self, session_id: &str) -> Result<()> {
        remove_if_exists(&self.path_for(session_id))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Deserialize a record, seeding `checkpointTranscriptStart` from the
/// legacy `condensedTranscriptLines` key when only the latter is present.
/// The legacy key is dropped on the next save.
fn parse_state(contents: &str) -> Result<SessionState> {
    let mut value: serde_json::Value =
        serde_json::from_str(contents).context("parsing session JSON")?;
    if let Some(obj) = value.as_object_mut() {
        if !obj.contains_key(CURRENT_TRANSCRIPT_START) {
            if let Some(legacy) = obj.remove(LEGACY_TRANSCRIPT_LINES) {
                obj.insert(CURRENT_TRANSCRIPT_START.into(), legacy);
            }
        } else {
            obj.remove(LEGACY_TRANSCRIPT_LINES);
        }
    }
    serde_json::from_value(value).context("deserializing session state")
}
