pub mod hooks;
pub mod transcript;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::agent::{
    Agent, AgentKind, SubagentAwareExtractor, TokenCalculator, TranscriptAnalyzer,
    TranscriptPreparer,
};
use crate::errors::CoreError;
use crate::event::{Event, EventKind, TokenUsage};

use hooks::{
    PreCompactInput, SessionEndInput, SessionStartInput, SessionStartSource,
    StopInput, SubagentStartInput, SubagentStopInput, UserPromptSubmitInput,
};
use transcript::Transcript;

/// How long `prepare_transcript` waits for the agent to flush.
const PREPARE_DEADLINE: Duration = Duration::from_secs(3);
const PREPARE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// A flushed tail entry must carry a timestamp within this many seconds
/// of the hook's start, otherwise it is a stale sentinel from a prior
/// turn.
const PREPARE_SKEW_SECONDS: i64 = 120;

/// Claude Code: JSON hook payloads on stdin, JSONL transcripts under the
/// per-project directory.  Implements the full capability set.
pub struct ClaudeAgent;

fn read_transcript_contents(path: &str) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(c) => Ok(c),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("reading transcript {path}")),
    }
}

fn parse_transcript(path: &str) -> Result<Transcript> {
    let contents = read_transcript_contents(path)?;
    let (transcript, errors) = Transcript::parse(&contents);
    for (line, err) in &errors {
        tracing::debug!("transcript parse error at {path}:{line}: {err}");
    }
    Ok(transcript)
}

fn payload<T: serde::de::DeserializeOwned>(hook: &str, bytes: &[u8]) -> Result<T, CoreError> {
    serde_json::from_slice(bytes).map_err(|e| CoreError::hook_parse(hook, e))
}

impl Agent for ClaudeAgent {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Claude
    }

    fn description(&self) -> &'static str {
        "Claude Code (hook payloads on stdin, JSONL transcripts)"
    }

    fn hook_names(&self) -> &'static [&'static str] {
        &[
            "SessionStart",
            "UserPromptSubmit",
            "Stop",
            "SubagentStart",
            "SubagentStop",
            "PreCompact",
            "SessionEnd",
        ]
    }

    fn parse_hook_event(
        &self,
        hook_name: &str,
        bytes: &[u8],
    ) -> Result<Option<Event>, CoreError> {
        let event = match hook_name {
            "SessionStart" => {
                let input: SessionStartInput = payload(hook_name, bytes)?;
                // The post-compaction restart is not a new lifecycle
                // moment; PreCompact already delivered it.
                if input.source == SessionStartSource::Compact {
                    return Ok(None);
                }
                let mut event = Event::new(EventKind::SessionStart, input.common.session_id)
                    .with_session_ref(input.common.transcript_path);
                event.previous_session_id = input.previous_session_id;
                event
            }
            "UserPromptSubmit" => {
                let input: UserPromptSubmitInput = payload(hook_name, bytes)?;
                Event::new(EventKind::TurnStart, input.common.session_id)
                    .with_session_ref(input.common.transcript_path)
                    .with_prompt(input.prompt)
            }
            "Stop" => {
                let input: StopInput = payload(hook_name, bytes)?;
                let mut event = Event::new(EventKind::TurnEnd, input.common.session_id)
                    .with_session_ref(input.common.transcript_path);
                event.metadata.insert(
                    "stop_hook_active".into(),
                    input.stop_hook_active.to_string(),
                );
                event
            }
            "SubagentStart" => {
                let input: SubagentStartInput = payload(hook_name, bytes)?;
                let mut event =
                    Event::new(EventKind::SubagentStart, input.common.session_id)
                        .with_session_ref(input.common.transcript_path);
                event.tool_use_id = Some(input.agent_id.clone());
                event.subagent_id = Some(input.agent_id);
                event
                    .metadata
                    .insert("agent_type".into(), input.agent_type);
                event
            }
            "SubagentStop" => {
                let input: SubagentStopInput = payload(hook_name, bytes)?;
                let mut event = Event::new(EventKind::SubagentEnd, input.common.session_id)
                    .with_session_ref(input.common.transcript_path);
                event.tool_use_id = Some(input.agent_id.clone());
                event.subagent_id = Some(input.agent_id);
                if let Some(agent_type) = input.agent_type {
                    event.metadata.insert("agent_type".into(), agent_type);
                }
                if let Some(path) = input.agent_transcript_path {
                    event.metadata.insert("agent_transcript_path".into(), path);
                }
                event
            }
            "PreCompact" => {
                let input: PreCompactInput = payload(hook_name, bytes)?;
                let mut event = Event::new(EventKind::Compaction, input.common.session_id)
                    .with_session_ref(input.common.transcript_path);
                event
                    .metadata
                    .insert("trigger".into(), input.trigger.as_str().into());
                if !input.custom_instructions.is_empty() {
                    event
                        .metadata
                        .insert("custom_instructions".into(), input.custom_instructions);
                }
                event
            }
            "SessionEnd" => {
                let input: SessionEndInput = payload(hook_name, bytes)?;
                let mut event = Event::new(EventKind::SessionEnd, input.common.session_id)
                    .with_session_ref(input.common.transcript_path);
                event
                    .metadata
                    .insert("reason".into(), input.reason.as_str().into());
                event
            }
            // Hooks the framework does not act on (PreToolUse and
            // friends, when configured broadly) are acknowledged.
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    fn read_transcript(&self, session_ref: &str) -> Result<Vec<u8>> {
        Ok(read_transcript_contents(session_ref)?.into_bytes())
    }

    fn as_analyzer(&self) -> Option<&dyn TranscriptAnalyzer> {
        Some(self)
    }

    fn as_preparer(&self) -> Option<&dyn TranscriptPreparer> {
        Some(self)
    }

    fn as_token_calculator(&self) -> Option<&dyn TokenCalculator> {
        Some(self)
    }

    fn as_subagent_extractor(&self) -> Option<&dyn SubagentAwareExtractor> {
        Some(self)
    }
}

impl TranscriptAnalyzer for ClaudeAgent {
    fn transcript_position(&self, session_ref: &str) -> Result<u64> {
        Ok(parse_transcript(session_ref)?.position())
    }

    fn modified_files_from_offset(
        &self,
        session_ref: &str,
        from: u64,
    ) -> Result<(Vec<String>, u64)> {
        let transcript = parse_transcript(session_ref)?;
        Ok((transcript.modified_files(from), transcript.position()))
    }

    fn prompts_from_offset(&self, session_ref: &str, from: u64) -> Result<Vec<String>> {
        Ok(parse_transcript(session_ref)?.prompts(from))
    }

    fn summary(&self, session_ref: &str) -> Result<Option<String>> {
        Ok(parse_transcript(session_ref)?.summary())
    }

    fn transcript_slice(&self, session_ref: &str, from: u64) -> Result<Vec<u8>> {
        let contents = read_transcript_contents(session_ref)?;
        Ok(transcript::slice_lines(&contents, from).into_bytes())
    }

    fn last_transcript_identifier(&self, session_ref: &str) -> Result<Option<String>> {
        Ok(parse_transcript(session_ref)?.last_entry_id())
    }
}

impl TranscriptPreparer for ClaudeAgent {
    /// Tail-poll until the newest entry's timestamp falls inside the skew
    /// window around the hook start, i.e. the agent has flushed this
    /// turn's tail rather than a stale one from a prior turn.
    fn prepare_transcript(
        &self,
        session_ref: &str,
        hook_started_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let deadline = Instant::now() + PREPARE_DEADLINE;
        let horizon = hook_started_at - chrono::Duration::seconds(PREPARE_SKEW_SECONDS);
        loop {
            if let Ok(transcript) = parse_transcript(session_ref) {
                if let Some(ts) = transcript.last_timestamp() {
                    if ts >= horizon {
                        return Ok(());
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(CoreError::StaleTranscript {
                    path: session_ref.to_string(),
                });
            }
            thread::sleep(PREPARE_POLL_INTERVAL);
        }
    }
}

impl TokenCalculator for ClaudeAgent {
    fn token_usage(&self, session_ref: &str, from: u64) -> Result<TokenUsage> {
        Ok(parse_transcript(session_ref)?.token_usage(from))
    }
}

impl SubagentAwareExtractor for ClaudeAgent {
    /// Subagent sub-transcripts live in a sibling directory named after
    /// the main transcript's stem (one `.jsonl` per subagent).
    fn subagent_modified_files(&self, session_ref: &str) -> Result<Vec<String>> {
        let main = Path::new(session_ref);
        let Some(stem) = main.file_stem().and_then(|s| s.to_str()) else {
            return Ok(Vec::new());
        };
        let side_dir = match main.parent() {
            Some(parent) => parent.join(stem),
            None => return Ok(Vec::new()),
        };
        let entries = match fs::read_dir(&side_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", side_dir.display()));
            }
        };
        let mut files = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(path_str) = path.to_str() {
                let transcript = parse_transcript(path_str)?;
                files.extend(transcript.modified_files(0));
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }
}
