use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

// ===================================================================
// Normalized lifecycle events
// ===================================================================

/// The lifecycle moments every adapter translates its native hooks into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SessionStart,
    TurnStart,
    TurnEnd,
    Compaction,
    SessionEnd,
    SubagentStart,
    SubagentEnd,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SessionStart => "session-start",
            Self::TurnStart => "turn-start",
            Self::TurnEnd => "turn-end",
            Self::Compaction => "compaction",
            Self::SessionEnd => "session-end",
            Self::SubagentStart => "subagent-start",
            Self::SubagentEnd => "subagent-end",
        };
        f.write_str(s)
    }
}

/// One normalized event, produced by `Agent::parse_hook_event`.
///
/// `session_ref` is whatever the adapter needs to locate the transcript
/// later: a filesystem path for Claude and Gemini, the bare session ID
/// for agents whose transcripts require an export step.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub session_id: String,
    pub session_ref: Option<String>,
    /// The user's prompt (TurnStart only).
    pub prompt: Option<String>,
    /// Subagent events only.
    pub tool_use_id: Option<String>,
    pub subagent_id: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub response_message: Option<String>,
    /// Plumbed for session-handoff adapters; never interpreted by the
    /// core.
    pub previous_session_id: Option<String>,
    /// Adapter-specific state the dispatcher passes through untouched.
    pub metadata: HashMap<String, String>,
}

impl Event {
    pub fn new(kind: EventKind, session_id: impl Into<String>) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            session_ref: None,
            prompt: None,
            tool_use_id: None,
            subagent_id: None,
            tool_input: None,
            timestamp: Utc::now(),
            response_message: None,
            previous_session_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_session_ref(mut self, session_ref: impl Into<String>) -> Self {
        self.session_ref = Some(session_ref.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

// ===================================================================
// Token usage — filled in by adapters that can count
// ===================================================================

/// Aggregate token counts for a transcript slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
    }
}
