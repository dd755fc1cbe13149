use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::agent::{Agent, AgentKind, PayloadSource, TranscriptAnalyzer};
use crate::errors::CoreError;
use crate::event::{Event, EventKind};
use crate::paths::{write_atomic, DATA_DIR};

/// Upper bound on one `opencode export` invocation.
const EXPORT_TIMEOUT: Duration = Duration::from_secs(30);
const EXPORT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ===================================================================
// OpenCode adapter
// ===================================================================

/// OpenCode: the legacy hook variant that passes its JSON payload as the
/// final argv element (the dispatcher normalizes that to bytes before the
/// adapter sees it).  Transcripts are not filesystem-native; they are
/// materialized with `opencode export <session-id>`, validated as JSON,
/// and cached under `.entire/tmp/`.  `session_ref` is the session ID.
pub struct OpencodeAgent;

#[derive(Debug, Deserialize)]
struct OpencodePayload {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default, rename = "parentID")]
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Export {
    #[serde(default)]
    messages: Vec<ExportMessage>,
}

#[derive(Debug, Deserialize)]
struct ExportMessage {
    #[serde(default)]
    info: MessageInfo,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageInfo {
    #[serde(default)]
    role: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default, rename = "type")]
    part_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    state: Option<ToolState>,
}

#[derive(Debug, Deserialize)]
struct ToolState {
    #[serde(default)]
    input: serde_json::Value,
}

/// Tool names whose input names a mutated file.
const MUTATING_TOOLS: &[&str] = &["write", "edit", "patch"];

/// Cached export location, relative to the hook process's working
/// directory (hook processes always run inside the worktree).
fn cache_path(session_id: &str) -> PathBuf {
    PathBuf::from(DATA_DIR)
        .join("tmp")
        .join(format!("{session_id}.json"))
}

/// Run `opencode export`, bounded by `EXPORT_TIMEOUT`.  Stdout is drained
/// on a separate thread so a large export cannot deadlock the pipe.
fn run_export(session_id: &str) -> Result<Vec<u8>> {
    let mut child = Command::new("opencode")
        .args(["export", session_id])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("spawning opencode export")?;
    let mut stdout = child.stdout.take().context("capturing export stdout")?;
    let reader = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });

    let deadline = Instant::now() + EXPORT_TIMEOUT;
    loop {
        match child.try_wait().context("waiting for opencode export")? {
            Some(status) => {
                let out = reader.join().unwrap_or_default();
                if !status.success() {
                    anyhow::bail!("opencode export {session_id} exited with {status}");
                }
                return Ok(out);
            }
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!(
                    "opencode export {session_id} timed out after {}s",
                    EXPORT_TIMEOUT.as_secs()
                );
            }
            None => thread::sleep(EXPORT_POLL_INTERVAL),
        }
    }
}

/// Fetch the export, preferring a fresh subprocess run and falling back
/// to the cached copy when the export fails.  Output must be valid JSON
/// before it replaces the cache.
fn fetch_transcript(session_id: &str) -> Result<Vec<u8>> {
    let cache = cache_path(session_id);
    match run_export(session_id) {
        Ok(bytes) => {
            serde_json::from_slice::<serde_json::Value>(&bytes)
                .context("opencode export produced invalid JSON")?;
            if let Err(e) = write_atomic(&cache, &bytes) {
                tracing::warn!("caching opencode export: {e:#}");
            }
            Ok(bytes)
        }
        Err(export_err) => match fs::read(&cache) {
            Ok(bytes) => {
                tracing::warn!("using cached export for {session_id}: {export_err:#}");
                Ok(bytes)
            }
            Err(_) => Err(export_err),
        },
    }
}

fn parse_export(session_id: &str) -> Result<Export> {
    let bytes = match fetch_transcript(session_id) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!("no transcript for opencode session {session_id}: {e:#}");
            return Ok(Export { messages: Vec::new() });
        }
    };
    serde_json::from_slice(&bytes).context("parsing opencode export")
}

impl Agent for OpencodeAgent {
    fn name(&self) -> &'static str {
        "opencode"
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Opencode
    }

    fn description(&self) -> &'static str {
        "OpenCode (argv hook payloads, transcripts via `opencode export`)"
    }

    fn hook_names(&self) -> &'static [&'static str] {
        &[
            "session.created",
            "message.user",
            "session.idle",
            "session.deleted",
        ]
    }

    fn payload_source(&self) -> PayloadSource {
        PayloadSource::LastArg
    }

    fn parse_hook_event(
        &self,
        hook_name: &str,
        bytes: &[u8],
    ) -> Result<Option<Event>, CoreError> {
        let payload: OpencodePayload = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::hook_parse(hook_name, e))?;
        let kind = match hook_name {
            "session.created" => EventKind::SessionStart,
            "message.user" => EventKind::TurnStart,
            "session.idle" => EventKind::TurnEnd,
            "session.deleted" => EventKind::SessionEnd,
            _ => return Ok(None),
        };
        let mut event = Event::new(kind, payload.session_id.clone());
        event.session_ref = Some(payload.session_id);
        event.previous_session_id = payload.parent_id;
        if kind == EventKind::TurnStart {
            match payload.prompt {
                Some(prompt) => event.prompt = Some(prompt),
                None => {
                    return Err(CoreError::hook_parse(
                        hook_name,
                        "message.user payload missing prompt",
                    ));
                }
            }
        }
        Ok(Some(event))
    }

    fn read_transcript(&self, session_ref: &str) -> Result<Vec<u8>> {
        fetch_transcript(session_ref)
    }

    fn as_analyzer(&self) -> Option<&dyn TranscriptAnalyzer> {
        Some(self)
    }
}

impl TranscriptAnalyzer for OpencodeAgent {
    fn transcript_position(&self, session_ref: &str) -> Result<u64> {
        Ok(parse_export(session_ref)?.messages.len() as u64)
    }

    fn modified_files_from_offset(
        &self,
        session_ref: &str,
        from: u64,
    ) -> Result<(Vec<String>, u64)> {
        let export = parse_export(session_ref)?;
        let mut seen = std::collections::HashSet::new();
        let mut files = Vec::new();
        for message in export.messages.iter().skip(from as usize) {
            for part in &message.parts {
                if part.part_type != "tool" {
                    continue;
                }
                let Some(tool) = &part.tool else { continue };
                if !MUTATING_TOOLS.contains(&tool.as_str()) {
                    continue;
                }
                let Some(state) = &part.state else { continue };
                if let Some(path) = state.input.get("filePath").and_then(|v| v.as_str()) {
                    if seen.insert(path.to_string()) {
                        files.push(path.to_string());
                    }
                }
            }
        }
        Ok((files, export.messages.len() as u64))
    }

    fn prompts_from_offset(&self, session_ref: &str, from: u64) -> Result<Vec<String>> {
        Ok(parse_export(session_ref)?
            .messages
            .iter()
            .skip(from as usize)
            .filter(|m| m.info.role == "user")
            .filter_map(|m| {
                let texts: Vec<&str> = m
                    .parts
                    .iter()
                    .filter(|p| p.part_type == "text")
                    .filter_map(|p| p.text.as_deref())
                    .collect();
                if texts.is_empty() {
                    None
                } else {
                    Some(texts.join("\n").trim().to_string())
                }
            })
            .collect())
    }

    fn summary(&self, session_ref: &str) -> Result<Option<String>> {
        Ok(parse_export(session_ref)?
            .messages
            .iter()
            .rev()
            .filter(|m| m.info.role == "assistant")
            .find_map(|m| {
                m.parts
                    .iter()
                    .filter(|p| p.part_type == "text")
                    .find_map(|p| p.text.as_deref())
                    .and_then(|t| t.lines().next())
                    .map(|l| l.trim().to_string())
            }))
    }

    fn transcript_slice(&self, session_ref: &str, from: u64) -> Result<Vec<u8>> {
        let bytes = match fetch_transcript(session_ref) {
            Ok(b) => b,
            Err(_) => return Ok(Vec::new()),
        };
        let mut value: serde_json::Value =
            serde_json::from_slice(&bytes).context("parsing opencode export")?;
        if let Some(messages) = value
            .get_mut("messages")
            .and_then(|m| m.as_array_mut())
        {
            if (from as usize) < messages.len() {
                messages.drain(..from as usize);
            } else {
                messages.clear();
            }
        }
        Ok(serde_json::to_vec_pretty(&value).context("serializing export slice")?)
    }
}
