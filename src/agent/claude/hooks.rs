use serde::Deserialize;

// ===================================================================
// Claude Code hook payloads (stdin, snake_case JSON)
// ===================================================================

/// How a session was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStartSource {
    Startup,
    Resume,
    Clear,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactTrigger {
    Manual,
    Auto,
}

impl CompactTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    Clear,
    Logout,
    PromptInputExit,
    Other,
}

impl SessionEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clear => "clear",
            Self::Logout => "logout",
            Self::PromptInputExit => "prompt_input_exit",
            Self::Other => "other",
        }
    }
}

/// Fields shared by all hook event payloads.  The payload also carries a
/// `cwd`, but the hook process already runs inside the worktree, so it
/// is not modeled.
#[derive(Debug, Clone, Deserialize)]
pub struct CommonInput {
    pub session_id: String,
    pub transcript_path: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionStartInput {
    #[serde(flatten)]
    pub common: CommonInput,
    pub source: SessionStartSource,
    #[serde(default)]
    pub previous_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserPromptSubmitInput {
    #[serde(flatten)]
    pub common: CommonInput,
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct StopInput {
    #[serde(flatten)]
    pub common: CommonInput,
    #[serde(default)]
    pub stop_hook_active: bool,
}

#[derive(Debug, Deserialize)]
pub struct SubagentStartInput {
    #[serde(flatten)]
    pub common: CommonInput,
    pub agent_id: String,
    pub agent_type: String,
}

#[derive(Debug, Deserialize)]
pub struct SubagentStopInput {
    #[serde(flatten)]
    pub common: CommonInput,
    pub agent_id: String,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub agent_transcript_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PreCompactInput {
    #[serde(flatten)]
    pub common: CommonInput,
    pub trigger: CompactTrigger,
    #[serde(default)]
    pub custom_instructions: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionEndInput {
    #[serde(flatten)]
    pub common: CommonInput,
    pub reason: SessionEndReason,
}
