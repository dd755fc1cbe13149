use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io;

use crate::agent::{Agent, AgentKind, TranscriptAnalyzer};
use crate::errors::CoreError;
use crate::event::{Event, EventKind};

// ===================================================================
// Gemini CLI adapter
// ===================================================================

/// Gemini CLI: JSON hook payloads on stdin; the transcript is a single
/// JSON document (an object with a `messages` array, or a bare array in
/// older checkpoints).  Positions are message counts.  No preparer or
/// token calculator — the CLI rewrites the whole document on flush and
/// does not record usage per message.
pub struct GeminiAgent;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPayload {
    session_id: String,
    #[serde(default)]
    chat_path: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
}

/// File-writing tool names in Gemini function calls.
const MUTATING_CALLS: &[&str] = &["write_file", "replace", "edit"];

#[derive(Debug, Deserialize)]
struct ChatDocument {
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    parts: Vec<ChatPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

fn read_messages(session_ref: &str) -> Result<Vec<ChatMessage>> {
    let contents = match fs::read_to_string(session_ref) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading chat {session_ref}")),
    };
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    // Object form first, bare-array checkpoints second.
    if let Ok(doc) = serde_json::from_str::<ChatDocument>(&contents) {
        return Ok(doc.messages);
    }
    match serde_json::from_str::<Vec<ChatMessage>>(&contents) {
        Ok(messages) => Ok(messages),
        Err(e) => Err(e).with_context(|| format!("parsing chat {session_ref}")),
    }
}

impl ChatMessage {
    fn text_content(&self) -> Option<String> {
        if let Some(text) = &self.text {
            if !text.trim().is_empty() {
                return Some(text.trim().to_string());
            }
        }
        let joined: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .filter(|t| !t.trim().is_empty())
            .collect();
        if joined.is_empty() {
            None
        } else {
            Some(joined.join("\n").trim().to_string())
        }
    }
}

impl Agent for GeminiAgent {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Gemini
    }

    fn description(&self) -> &'static str {
        "Gemini CLI (JSON chat documents, message-count positions)"
    }

    fn hook_names(&self) -> &'static [&'static str] {
        &["session-start", "prompt-submit", "turn-end", "session-end"]
    }

    fn parse_hook_event(
        &self,
        hook_name: &str,
        bytes: &[u8],
    ) -> Result<Option<Event>, CoreError> {
        let payload: GeminiPayload = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::hook_parse(hook_name, e))?;
        let kind = match hook_name {
            "session-start" => EventKind::SessionStart,
            "prompt-submit" => EventKind::TurnStart,
            "turn-end" => EventKind::TurnEnd,
            "session-end" => EventKind::SessionEnd,
            _ => return Ok(None),
        };
        let mut event = Event::new(kind, payload.session_id);
        event.session_ref = payload.chat_path;
        if kind == EventKind::TurnStart {
            match payload.prompt {
                Some(prompt) => event.prompt = Some(prompt),
                None => {
                    return Err(CoreError::hook_parse(
                        hook_name,
                        "prompt-submit payload missing prompt",
                    ));
                }
            }
        }
        Ok(Some(event))
    }

    fn read_transcript(&self, session_ref: &str) -> Result<Vec<u8>> {
        match fs::read(session_ref) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("reading chat {session_ref}")),
        }
    }

    fn as_analyzer(&self) -> Option<&dyn TranscriptAnalyzer> {
        Some(self)
    }
}

impl TranscriptAnalyzer for GeminiAgent {
    fn transcript_position(&self, session_ref: &str) -> Result<u64> {
        Ok(read_messages(session_ref)?.len() as u64)
    }

    fn modified_files_from_offset(
        &self,
        session_ref: &str,
        from: u64,
    ) -> Result<(Vec<String>, u64)> {
        let messages = read_messages(session_ref)?;
        let mut seen = std::collections::HashSet::new();
        let mut files = Vec::new();
        for message in messages.iter().skip(from as usize) {
            for part in &message.parts {
                let Some(call) = &part.function_call else {
                    continue;
                };
                if !MUTATING_CALLS.contains(&call.name.as_str()) {
                    continue;
                }
                if let Some(path) = call.args.get("file_path").and_then(|v| v.as_str()) {
                    if seen.insert(path.to_string()) {
                        files.push(path.to_string());
                    }
                }
            }
        }
        Ok((files, messages.len() as u64))
    }

    fn prompts_from_offset(&self, session_ref: &str, from: u64) -> Result<Vec<String>> {
        Ok(read_messages(session_ref)?
            .iter()
            .skip(from as usize)
            .filter(|m| m.role == "user")
            .filter_map(|m| m.text_content())
            .collect())
    }

    fn summary(&self, session_ref: &str) -> Result<Option<String>> {
        Ok(read_messages(session_ref)?
            .iter()
            .rev()
            .filter(|m| m.role == "model")
            .find_map(|m| m.text_content())
            .and_then(|text| text.lines().next().map(|l| l.trim().to_string())))
    }

    fn transcript_slice(&self, session_ref: &str, from: u64) -> Result<Vec<u8>> {
        // The document is rewritten in place, so a byte-range slice is
        // meaningless; serialize the messages from the cursor instead.
        let messages = read_messages(session_ref)?;
        if from as usize >= messages.len() {
            return Ok(Vec::new());
        }
        let contents = match fs::read_to_string(session_ref) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading chat {session_ref}")),
        };
        let value: serde_json::Value =
            serde_json::from_str(&contents).with_context(|| format!("parsing {session_ref}"))?;
        let slice = match &value {
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().skip(from as usize).cloned().collect())
            }
            serde_json::Value::Object(obj) => match obj.get("messages") {
                Some(serde_json::Value::Array(items)) => serde_json::Value::Array(
                    items.iter().skip(from as usize).cloned().collect(),
                ),
                _ => value.clone(),
            },
            _ => value.clone(),
        };
        Ok(serde_json::to_vec_pretty(&slice).context("serializing chat slice")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn chat_file(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    const CHAT: &str = r#"{
        "sessionId": "g1",
        "messages": [
            {"role": "user", "parts": [{"text": "refactor the config loader"}]},
            {"role": "model", "parts": [
                {"functionCall": {"name": "write_file", "args": {"file_path": "config.py"}}},
                {"text": "Rewrote the loader."}
            ]},
            {"role": "user", "parts": [{"text": "thanks"}]}
        ]
    }"#;

    #[test]
    fn position_is_message_count() {
        let f = chat_file(CHAT);
        let agent = GeminiAgent;
        assert_eq!(
            agent.transcript_position(f.path().to_str().unwrap()).unwrap(),
            3
        );
    }

    #[test]
    fn extracts_files_and_prompts_from_offset() {
        let f = chat_file(CHAT);
        let agent = GeminiAgent;
        let path = f.path().to_str().unwrap();

        let (files, pos) = agent.modified_files_from_offset(path, 0).unwrap();
        assert_eq!(files, vec!["config.py"]);
        assert_eq!(pos, 3);

        let (files, _) = agent.modified_files_from_offset(path, 2).unwrap();
        assert!(files.is_empty());

        assert_eq!(
            agent.prompts_from_offset(path, 0).unwrap(),
            vec!["refactor the config loader", "thanks"]
        );
        assert_eq!(agent.prompts_from_offset(path, 1).unwrap(), vec!["thanks"]);
    }

    #[test]
    fn summary_is_last_model_text() {
        let f = chat_file(CHAT);
        let agent = GeminiAgent;
        assert_eq!(
            agent.summary(f.path().to_str().unwrap()).unwrap().as_deref(),
            Some("Rewrote the loader.")
        );
    }

    #[test]
    fn bare_array_checkpoints_parse() {
        let f = chat_file(r#"[{"role": "user", "text": "hello"}]"#);
        let agent = GeminiAgent;
        let path = f.path().to_str().unwrap();
        assert_eq!(agent.transcript_position(path).unwrap(), 1);
        assert_eq!(agent.prompts_from_offset(path, 0).unwrap(), vec!["hello"]);
    }

    #[test]
    fn empty_documents_yield_no_messages() {
        let agent = GeminiAgent;
        for contents in [r#"{"sessionId": "g1", "messages": []}"#, "[]", ""] {
            let f = chat_file(contents);
            let path = f.path().to_str().unwrap();
            assert_eq!(agent.transcript_position(path).unwrap(), 0, "{contents:?}");
        }
        assert_eq!(agent.transcript_position("/missing/chat.json").unwrap(), 0);
    }

    #[test]
    fn prompt_submit_requires_prompt() {
        let agent = GeminiAgent;
        let err = agent
            .parse_hook_event("prompt-submit", br#"{"sessionId": "g1"}"#)
            .unwrap_err();
        assert!(matches!(err, CoreError::HookParse { .. }));
    }

    #[test]
    fn unknown_verb_is_acknowledged() {
        let agent = GeminiAgent;
        let out = agent
            .parse_hook_event("tool-call", br#"{"sessionId": "g1"}"#)
            .unwrap();
        assert!(out.is_none());
    }
}
