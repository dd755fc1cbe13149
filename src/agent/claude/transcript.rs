use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::event::TokenUsage;

// ===================================================================
// Claude Code JSONL transcript — one entry per line
// ===================================================================

/// A parsed conversation entry (`user` and `assistant` lines share the
/// same shape).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    pub uuid: String,
    #[serde(default)]
    pub is_sidechain: bool,
    #[serde(default)]
    pub is_meta: Option<bool>,
    #[serde(default)]
    pub timestamp: String,
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub content: MessageContent,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// `message.content` is a plain string for user text and an array of
/// content blocks for assistant responses and tool results.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking {},
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {},
}

#[derive(Debug, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

/// One typed transcript line.  Entry types the extraction does not need
/// (progress, file-history-snapshot, queue-operation) are skipped at
/// parse time without being treated as errors.
#[derive(Debug)]
pub enum Entry {
    User(ConversationEntry),
    Assistant(ConversationEntry),
    Summary(String),
}

/// Tools whose `tool_use` input names a file the agent mutated.
const MUTATING_TOOLS: &[(&str, &str)] = &[
    ("Write", "file_path"),
    ("Edit", "file_path"),
    ("MultiEdit", "file_path"),
    ("NotebookEdit", "notebook_path"),
];

// ===================================================================
// Transcript — entries tagged with their 0-based line number
// ===================================================================

/// A parsed transcript.  Positions are 0-based line numbers into the
/// JSONL file; `line_count` counts every line (including ones that were
/// skipped or failed to parse) so cursors stay aligned with the file.
pub struct Transcript {
    entries: Vec<(u64, Entry)>,
    line_count: u64,
}

impl Transcript {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            line_count: 0,
        }
    }

    /// Parse JSONL contents.  Returns the transcript and the lines that
    /// looked like known entry types but failed to deserialize (1-based
    /// line number and error).
    pub fn parse(contents: &str) -> (Self, Vec<(usize, String)>) {
        let mut entries = Vec::new();
        let mut errors = Vec::new();
        let mut line_count = 0u64;

        for (i, line) in contents.lines().enumerate() {
            line_count += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: serde_json::Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    errors.push((i + 1, format!("{e}")));
                    continue;
                }
            };
            let entry_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
            let parsed = match entry_type {
                "user" => serde_json::from_value::<ConversationEntry>(value.clone())
                    .map(Entry::User)
                    .map_err(|e| format!("{e}")),
                "assistant" => serde_json::from_value::<ConversationEntry>(value.clone())
                    .map(Entry::Assistant)
                    .map_err(|e| format!("{e}")),
                "summary" => value
                    .get("summary")
                    .and_then(|s| s.as_str())
                    .map(|s| Entry::Summary(s.to_string()))
                    .ok_or_else(|| "summary entry without summary field".to_string()),
                _ => continue,
            };
            match parsed {
                Ok(entry) => entries.push((i as u64, entry)),
                Err(e) => errors.push((i + 1, e)),
            }
        }

        (
            Self {
                entries,
                line_count,
            },
            errors,
        )
    }

    /// Total line count — the monotonic cursor value for this file.
    pub fn position(&self) -> u64 {
        self.line_count
    }

    fn conversations_from(
        &self,
        from: u64,
    ) -> impl Iterator<Item = (&ConversationEntry, bool)> {
        self.entries.iter().filter_map(move |(line, entry)| {
            if *line < from {
                return None;
            }
            match entry {
                Entry::User(c) => Some((c, false)),
                Entry::Assistant(c) => Some((c, true)),
                Entry::Summary(_) => None,
            }
        })
    }

    /// Repo paths mutated by file-writing tool calls at or after `from`.
    /// Deduplicated, in first-seen order.
    pub fn modified_files(&self, from: u64) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut files = Vec::new();
        for (conv, is_assistant) in self.conversations_from(from) {
            if !is_assistant {
                continue;
            }
            let MessageContent::Blocks(blocks) = &conv.message.content else {
                continue;
            };
            for block in blocks {
                let ContentBlock::ToolUse { name, input } = block else {
                    continue;
                };
                let Some((_, key)) = MUTATING_TOOLS.iter().find(|(tool, _)| tool == name)
                else {
                    continue;
                };
                if let Some(path) = input.get(key).and_then(|v| v.as_str()) {
                    if seen.insert(path.to_string()) {
                        files.push(path.to_string());
                    }
                }
            }
        }
        files
    }

    /// User prompts at or after `from`.  Sidechain and meta entries are
    /// skipped, as are command wrappers (`<command-name>…`) injected by
    /// the agent itself.
    pub fn prompts(&self, from: u64) -> Vec<String> {
        self.conversations_from(from)
            .filter(|(conv, is_assistant)| {
                !is_assistant && !conv.is_sidechain && conv.is_meta != Some(true)
            })
            .filter_map(|(conv, _)| match &conv.message.content {
                MessageContent::Text(text) => {
                    let trimmed = text.trim();
                    (!trimmed.is_empty() && !trimmed.starts_with('<'))
                        .then(|| trimmed.to_string())
                }
                MessageContent::Blocks(_) => None,
            })
            .collect()
    }

    /// The best one-line summary available: the last `summary` entry if
    /// the agent wrote one, else the first line of the last assistant
    /// text response.
    pub fn summary(&self) -> Option<String> {
        let explicit = self.entries.iter().rev().find_map(|(_, e)| match e {
            Entry::Summary(s) => Some(s.clone()),
            _ => None,
        });
        if explicit.is_some() {
            return explicit;
        }
        self.entries.iter().rev().find_map(|(_, e)| match e {
            Entry::Assistant(conv) => match &conv.message.content {
                MessageContent::Blocks(blocks) => blocks.iter().find_map(|b| match b {
                    ContentBlock::Text { text } => {
                        text.lines().find(|l| !l.trim().is_empty()).map(|l| {
                            let line = l.trim();
                            if line.chars().count() > 80 {
                                let truncated: String = line.chars().take(77).collect();
                                format!("{truncated}...")
                            } else {
                                line.to_string()
                            }
                        })
                    }
                    _ => None,
                }),
                _ => None,
            },
            _ => None,
        })
    }

    /// Sum token usage over assistant entries at or after `from`.
    pub fn token_usage(&self, from: u64) -> TokenUsage {
        let mut total = TokenUsage::default();
        for (conv, is_assistant) in self.conversations_from(from) {
            if !is_assistant {
                continue;
            }
            if let Some(usage) = &conv.message.usage {
                total.add(&TokenUsage {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    cache_read_tokens: usage.cache_read_input_tokens,
                    cache_creation_tokens: usage.cache_creation_input_tokens,
                });
            }
        }
        total
    }

    /// UUID of the newest conversation entry, used as the snapshot's
    /// opaque transcript marker.
    pub fn last_entry_id(&self) -> Option<String> {
        self.entries.iter().rev().find_map(|(_, e)| match e {
            Entry::User(c) | Entry::Assistant(c) => Some(c.uuid.clone()),
            Entry::Summary(_) => None,
        })
    }

    /// Timestamp of the newest entry that carries one.
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().rev().find_map(|(_, e)| {
            let conv = match e {
                Entry::User(c) | Entry::Assistant(c) => c,
                Entry::Summary(_) => return None,
            };
            DateTime::parse_from_rfc3339(&conv.timestamp)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
    }
}

/// The raw bytes of every line at or after the 0-based line `from`.
pub fn slice_lines(contents: &str, from: u64) -> String {
    if from == 0 {
        return contents.to_string();
    }
    let mut remaining = from;
    let mut offset = 0;
    for (i, b) in contents.bytes().enumerate() {
        if b == b'\n' {
            remaining -= 1;
            if remaining == 0 {
                offset = i + 1;
                break;
            }
        }
    }
    if remaining > 0 {
        // Fewer lines than the cursor: nothing new.
        return String::new();
    }
    contents[offset..].to_string()
}
