pub mod claude;
pub mod gemini;
pub mod opencode;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::CoreError;
use crate::event::{Event, TokenUsage};

// ===================================================================
// Agent identity
// ===================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Claude,
    Gemini,
    Opencode,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Opencode => "opencode",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// How an adapter's hook payload arrives.  Most agents pipe JSON over
/// stdin; one legacy variant passes it as the final argv element, which
/// the dispatcher normalizes before the adapter sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    Stdin,
    LastArg,
}

// ===================================================================
// Core adapter contract
// ===================================================================

/// One implementation per supported agent.  Adapters are stateless: all
/// persistence lives in the session store, and `session_ref` carries
/// whatever the adapter needs to find its transcript again.
pub trait Agent {
    fn name(&self) -> &'static str;
    fn kind(&self) -> AgentKind;
    fn description(&self) -> &'static str;

    /// The hook verbs this adapter accepts.
    fn hook_names(&self) -> &'static [&'static str];

    fn payload_source(&self) -> PayloadSource {
        PayloadSource::Stdin
    }

    /// Translate a native hook payload into a normalized event.
    /// `Ok(None)` means "acknowledged, no lifecycle action".
    fn parse_hook_event(&self, hook_name: &str, payload: &[u8])
    -> Result<Option<Event>, CoreError>;

    /// Read the transcript behind `session_ref` as an opaque blob.
    fn read_transcript(&self, session_ref: &str) -> Result<Vec<u8>>;

    /// Split a transcript into chunks of at most `max_size` bytes.
    /// `reassemble_transcript(chunk_transcript(b, n)) == b` must hold for
    /// any `n >= MIN_CHUNK_SIZE`.
    fn chunk_transcript(&self, bytes: &[u8], max_size: usize) -> Vec<Vec<u8>> {
        chunk_on_line_boundaries(bytes, max_size)
    }

    fn reassemble_transcript(&self, chunks: &[Vec<u8>]) -> Vec<u8> {
        chunks.concat()
    }

    // --- capability discovery ---

    fn as_analyzer(&self) -> Option<&dyn TranscriptAnalyzer> {
        None
    }

    fn as_preparer(&self) -> Option<&dyn TranscriptPreparer> {
        None
    }

    fn as_token_calculator(&self) -> Option<&dyn TokenCalculator> {
        None
    }

    fn as_subagent_extractor(&self) -> Option<&dyn SubagentAwareExtractor> {
        None
    }
}

// ===================================================================
// Optional capabilities
// ===================================================================

/// Adapters that can locate positions and extract facts from their own
/// transcript format.  Positions are an agent-specific monotonic cursor
/// (line numbers for JSONL transcripts, message counts for JSON ones).
pub trait TranscriptAnalyzer {
    fn transcript_position(&self, session_ref: &str) -> Result<u64>;

    /// Files the agent modified from `from` onward, plus the new cursor.
    fn modified_files_from_offset(
        &self,
        session_ref: &str,
        from: u64,
    ) -> Result<(Vec<String>, u64)>;

    fn prompts_from_offset(&self, session_ref: &str, from: u64) -> Result<Vec<String>>;

    fn summary(&self, session_ref: &str) -> Result<Option<String>>;

    /// The raw transcript bytes from `from` onward.
    fn transcript_slice(&self, session_ref: &str, from: u64) -> Result<Vec<u8>>;

    /// An opaque marker for the newest transcript entry, recorded in the
    /// pre-prompt snapshot.
    fn last_transcript_identifier(&self, _session_ref: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Adapters whose transcripts are flushed asynchronously.  Implementations
/// tail-read for a sentinel whose timestamp lies within a small skew
/// window of `hook_started_at`; a timeout yields
/// `CoreError::StaleTranscript` and the framework proceeds with whatever
/// is on disk.
pub trait TranscriptPreparer {
    fn prepare_transcript(
        &self,
        session_ref: &str,
        hook_started_at: DateTime<Utc>,
    ) -> Result<(), CoreError>;
}

pub trait TokenCalculator {
    fn token_usage(&self, session_ref: &str, from: u64) -> Result<TokenUsage>;
}

/// Analyzers that also walk a side directory of subagent sub-transcripts.
pub trait SubagentAwareExtractor: TranscriptAnalyzer {
    /// Files modified inside subagent transcripts adjacent to the main
    /// one.
    fn subagent_modified_files(&self, session_ref: &str) -> Result<Vec<String>>;
}

// ===================================================================
// Chunking
// ===================================================================

/// Chunk sizes below this are rejected by callers; keeps the line-boundary
/// splitter from degenerating into per-byte chunks.
pub const MIN_CHUNK_SIZE: usize = 1024;

/// Split on line boundaries where possible, hard-splitting only lines
/// longer than `max_size`.  Concatenating the chunks reproduces the input
/// byte-for-byte.  Sizes below `MIN_CHUNK_SIZE` are clamped up.
pub fn chunk_on_line_boundaries(bytes: &[u8], max_size: usize) -> Vec<Vec<u8>> {
    let max_size = max_size.max(MIN_CHUNK_SIZE);
    if bytes.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let line_end = match rest.iter().position(|&b| b == b'\n') {
            Some(i) => i + 1,
            None => rest.len(),
        };
        let (line, tail) = rest.split_at(line_end);
        if !current.is_empty() && current.len() + line.len() > max_size {
            chunks.push(std::mem::take(&mut current));
        }
        if line.len() > max_size {
            // A single oversized line: hard-split it.
            for piece in line.chunks(max_size) {
                chunks.push(piece.to_vec());
            }
        } else {
            current.extend_from_slice(line);
        }
        rest = tail;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// ===================================================================
// Registry
// ===================================================================

/// The process-wide adapter table, built once at startup and passed
/// explicitly to the dispatcher.
pub struct Registry {
    agents: Vec<Box<dyn Agent>>,
}

impl Registry {
    pub fn builtin() -> Self {
        Self {
            agents: vec![
                Box::new(claude::ClaudeAgent),
                Box::new(gemini::GeminiAgent),
                Box::new(opencode::OpencodeAgent),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Agent> {
        self.agents
            .iter()
            .find(|a| a.name() == name)
            .map(|a| a.as_ref())
    }

    pub fn by_kind(&self, kind: AgentKind) -> Option<&dyn Agent> {
        self.agents
            .iter()
            .find(|a| a.kind() == kind)
            .map(|a| a.as_ref())
    }

    /// One line per adapter, for error messages and listings.
    pub fn describe(&self) -> String {
        self.agents
            .iter()
            .map(|a| format!("{} — {}", a.name(), a.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
