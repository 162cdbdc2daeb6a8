//! Transcript bounding and the per-run audit log.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::errors::PilotResult;
use crate::llm::types::{ChatMessage, ContentPart, MessageContent};

/// Strips inlined screenshot/hint payloads from older transcript turns,
/// keeping only the most recent `keep_recent` image-bearing turns intact.
/// Textual structure and ordering are preserved, so the conversational audit
/// trail stays readable while per-call payload size stays bounded.
pub fn purge_old_images(messages: &mut [ChatMessage], keep_recent: usize) {
    let image_turns: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| has_image(m))
        .map(|(i, _)| i)
        .collect();

    if image_turns.len() <= keep_recent {
        return;
    }

    let purge_upto = image_turns.len() - keep_recent;
    for &idx in &image_turns[..purge_upto] {
        strip_images(&mut messages[idx]);
    }
    tracing::debug!(
        purged_turns = purge_upto,
        "purged image payloads from old transcript turns"
    );
}

fn has_image(message: &ChatMessage) -> bool {
    match &message.content {
        MessageContent::Text(_) => false,
        MessageContent::Parts(parts) => parts.iter().any(|p| matches!(p, ContentPart::Image { .. })),
    }
}

fn strip_images(message: &mut ChatMessage) {
    if let MessageContent::Parts(parts) = &mut message.content {
        for part in parts.iter_mut() {
            if matches!(part, ContentPart::Image { .. }) {
                *part = ContentPart::Text {
                    text: "[screenshot omitted to bound transcript size]".into(),
                };
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: i64,
    pub role: String,
    pub content: Option<String>,
    pub action: Option<serde_json::Value>,
}

/// Append-only JSONL log of one scenario run, for post-mortem inspection by
/// the batch runner / UI outside this core.
pub struct SessionHistory {
    pub session_id: String,
    entries: Vec<HistoryEntry>,
    file_path: std::path::PathBuf,
}

impl SessionHistory {
    pub fn new() -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let dir = data_dir_or_cwd();
        let file_path = dir.join(format!("run_{session_id}.jsonl"));
        Self {
            session_id,
            entries: Vec::new(),
            file_path,
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    /// Append the latest entry to the JSONL file.
    pub fn flush(&self) -> PilotResult<()> {
        if let Some(last) = self.entries.last() {
            let line = serde_json::to_string(last)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)?;
            writeln!(file, "{}", line)?;
            tracing::debug!(path = %self.file_path.display(), "history entry flushed");
        }
        Ok(())
    }
}

impl Default for SessionHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns `%LOCALAPPDATA%\ScreenPilot\runs` on Windows,
/// `~/.local/share/screenpilot/runs` on Linux/macOS,
/// falling back to the current working directory.
fn data_dir_or_cwd() -> std::path::PathBuf {
    #[cfg(target_os = "windows")]
    let base = std::env::var("LOCALAPPDATA").ok().map(std::path::PathBuf::from);

    #[cfg(not(target_os = "windows"))]
    let base = std::env::var("HOME")
        .ok()
        .map(|h| std::path::PathBuf::from(h).join(".local").join("share"));

    if let Some(data_dir) = base {
        #[cfg(target_os = "windows")]
        let d = data_dir.join("ScreenPilot").join("runs");
        #[cfg(not(target_os = "windows"))]
        let d = data_dir.join("screenpilot").join("runs");
        let _ = std::fs::create_dir_all(&d);
        return d;
    }
    std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."))
}
