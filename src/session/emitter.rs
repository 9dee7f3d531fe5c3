//! Session-update emitter
//!
//! Translates normalized bridge events into `session/update` notifications
//! and owns the session's tool-call table. A `tool_call` for an id always
//! precedes any `tool_call_update` for that id, and a terminal update ends
//! the record's lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::protocol::acp::ContentBlock;
use crate::protocol::update::{
    AvailableCommand, PlanEntry, PlanEntryPriority, PlanEntryStatus, SessionUpdate,
    ToolCallContent, ToolCallLocation, ToolCallStart, ToolCallStatus, ToolCallUpdate, ToolKind,
};
use crate::transport::ClientHandle;
use crate::types::Result;

/// Backtick runs at line starts; used to pick a safe fence length
static BACKTICK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^```+").expect("valid backtick regex"));

/// `<system-reminder>` blocks are internal and never shown to the client
static SYSTEM_REMINDER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<system-reminder>.*?</system-reminder>").expect("valid system-reminder regex")
});

/// Wrap text in a markdown code fence longer than any fence it contains
fn markdown_escape(text: &str) -> String {
    let mut escape = "```".to_string();
    for cap in BACKTICK_REGEX.captures_iter(text) {
        if let Some(m) = cap.get(0) {
            while m.as_str().len() >= escape.len() {
                escape.push('`');
            }
        }
    }
    let needs_newline = !text.ends_with('\n');
    format!(
        "{}\n{}{}{}",
        escape,
        text,
        if needs_newline { "\n" } else { "" },
        escape
    )
}

/// Remove system-reminder tags and their content
fn remove_system_reminders(text: &str) -> String {
    SYSTEM_REMINDER_REGEX.replace_all(text, "").to_string()
}

/// Display info derived from a tool name and its input
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInfo {
    pub title: String,
    pub kind: ToolKind,
    pub locations: Vec<ToolCallLocation>,
}

impl ToolInfo {
    fn new(title: impl Into<String>, kind: ToolKind) -> Self {
        Self {
            title: title.into(),
            kind,
            locations: Vec::new(),
        }
    }

    fn with_location(mut self, path: &str) -> Self {
        self.locations.push(ToolCallLocation {
            path: path.to_string(),
            line: None,
        });
        self
    }
}

/// Derive a human-readable title, kind and locations for a tool call
pub fn extract_tool_info(name: &str, input: &Value) -> ToolInfo {
    let str_field = |field: &str| input.get(field).and_then(Value::as_str);

    match name {
        "Read" => {
            let path = str_field("file_path").unwrap_or("file");
            ToolInfo::new(format!("Read {}", truncate_path(path)), ToolKind::Read)
                .with_location(path)
        }
        "Edit" | "MultiEdit" => {
            let path = str_field("file_path").unwrap_or("file");
            ToolInfo::new(format!("Edit {}", truncate_path(path)), ToolKind::Edit)
                .with_location(path)
        }
        "Write" => {
            let path = str_field("file_path").unwrap_or("file");
            ToolInfo::new(format!("Write {}", truncate_path(path)), ToolKind::Edit)
                .with_location(path)
        }
        "Bash" => {
            let cmd = str_field("command").unwrap_or("");
            let title = str_field("description")
                .map(String::from)
                .unwrap_or_else(|| format!("Run: {}", truncate_string(cmd, 50)));
            ToolInfo::new(title, ToolKind::Execute)
        }
        "commandExecution" => {
            let cmd = str_field("command").unwrap_or("");
            ToolInfo::new(
                format!("Run: {}", truncate_string(cmd, 50)),
                ToolKind::Execute,
            )
        }
        "fileChange" => {
            let path = str_field("path").unwrap_or("file");
            ToolInfo::new(format!("Edit {}", truncate_path(path)), ToolKind::Edit)
                .with_location(path)
        }
        "Grep" => {
            let pattern = str_field("pattern").unwrap_or("");
            ToolInfo::new(
                format!("Search: {}", truncate_string(pattern, 40)),
                ToolKind::Search,
            )
        }
        "Glob" => {
            let pattern = str_field("pattern").unwrap_or("");
            ToolInfo::new(
                format!("Find: {}", truncate_string(pattern, 40)),
                ToolKind::Search,
            )
        }
        "LS" => ToolInfo::new("List directory", ToolKind::Search),
        "WebFetch" => {
            let url = str_field("url").unwrap_or("");
            ToolInfo::new(format!("Fetch {}", truncate_string(url, 50)), ToolKind::Fetch)
        }
        "WebSearch" => {
            let query = str_field("query").unwrap_or("");
            ToolInfo::new(
                format!("Search: {}", truncate_string(query, 40)),
                ToolKind::Fetch,
            )
        }
        "Task" => {
            let desc = str_field("description").unwrap_or("Task");
            ToolInfo::new(desc, ToolKind::Think)
        }
        "TodoWrite" => ToolInfo::new("Update task list", ToolKind::Think),
        "NotebookRead" | "NotebookEdit" => {
            let path = str_field("notebook_path").unwrap_or("notebook");
            let kind = if name == "NotebookRead" {
                ToolKind::Read
            } else {
                ToolKind::Edit
            };
            ToolInfo::new(format!("{} {}", name, truncate_path(path)), kind)
                .with_location(path)
        }
        "EnterPlanMode" | "ExitPlanMode" => ToolInfo::new(name, ToolKind::SwitchMode),
        name if name.starts_with("mcp__") => {
            let tool = name.split("__").nth(2).unwrap_or(name);
            ToolInfo::new(format!("MCP: {tool}"), ToolKind::Other)
        }
        _ => ToolInfo::new(name, ToolKind::Other),
    }
}

fn truncate_path(path: &str) -> String {
    if path.len() > 60 {
        std::path::Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from)
            .unwrap_or_else(|| truncate_string(path, 60))
    } else {
        path.to_string()
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let cut = max_len.saturating_sub(3);
        let mut end = cut;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

/// One live entry of the tool-call table
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub name: String,
    pub title: String,
    pub kind: ToolKind,
    pub status: ToolCallStatus,
    pub input: Value,
}

/// Per-session translator from bridge events to session updates
pub struct UpdateEmitter {
    session_id: String,
    client: ClientHandle,
    tool_calls: DashMap<String, ToolCallRecord>,
    agent_chunks: AtomicU64,
}

impl std::fmt::Debug for UpdateEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateEmitter")
            .field("session_id", &self.session_id)
            .field("open_tool_calls", &self.tool_calls.len())
            .finish_non_exhaustive()
    }
}

impl UpdateEmitter {
    pub fn new(session_id: impl Into<String>, client: ClientHandle) -> Self {
        Self {
            session_id: session_id.into(),
            client,
            tool_calls: DashMap::new(),
            agent_chunks: AtomicU64::new(0),
        }
    }

    fn send(&self, update: SessionUpdate) -> Result<()> {
        self.client.send_update(&self.session_id, update)
    }

    /// Reset per-turn counters
    pub fn begin_turn(&self) {
        self.agent_chunks.store(0, Ordering::SeqCst);
    }

    /// Number of agent message chunks emitted this turn
    pub fn agent_chunks_emitted(&self) -> u64 {
        self.agent_chunks.load(Ordering::SeqCst)
    }

    /// Emit one `agent_message_chunk`
    pub fn agent_text(&self, text: &str) -> Result<()> {
        self.agent_chunks.fetch_add(1, Ordering::SeqCst);
        self.send(SessionUpdate::AgentMessageChunk {
            content: ContentBlock::text(text),
        })
    }

    /// Emit one `agent_thought_chunk`
    pub fn agent_thought(&self, text: &str) -> Result<()> {
        self.send(SessionUpdate::AgentThoughtChunk {
            content: ContentBlock::text(text),
        })
    }

    /// Emit one `user_message_chunk` (continuation prompts)
    pub fn user_text(&self, text: &str) -> Result<()> {
        self.send(SessionUpdate::UserMessageChunk {
            content: ContentBlock::text(text),
        })
    }

    /// Announce a tool invocation and record it
    ///
    /// `TodoWrite` inputs double as plan updates; edit-kind inputs carry a
    /// structured diff so clients can preview the change.
    pub fn tool_call(&self, id: &str, name: &str, input: &Value) -> Result<()> {
        let info = extract_tool_info(name, input);

        self.tool_calls.insert(
            id.to_string(),
            ToolCallRecord {
                name: name.to_string(),
                title: info.title.clone(),
                kind: info.kind,
                status: ToolCallStatus::Pending,
                input: input.clone(),
            },
        );

        self.send(SessionUpdate::ToolCall(ToolCallStart {
            tool_call_id: id.to_string(),
            title: info.title,
            kind: info.kind,
            status: ToolCallStatus::Pending,
            content: edit_diff_content(name, input).into_iter().collect(),
            locations: info.locations,
            raw_input: Some(input.clone()),
        }))?;

        if name == "TodoWrite" {
            if let Some(entries) = plan_entries(input) {
                self.send(SessionUpdate::Plan { entries })?;
            }
        }
        Ok(())
    }

    /// Emit the terminal update for a tool invocation and drop its record
    pub fn tool_result(&self, id: &str, content: Option<&Value>, failed: bool) -> Result<()> {
        let record = self.tool_calls.remove(id).map(|(_, record)| record);
        let status = if failed {
            ToolCallStatus::Failed
        } else {
            ToolCallStatus::Completed
        };

        let rendered = content.and_then(|value| {
            render_tool_output(value, record.as_ref().map(|r| r.kind))
        });

        self.send(SessionUpdate::ToolCallUpdate(ToolCallUpdate {
            tool_call_id: id.to_string(),
            status: Some(status),
            title: None,
            content: rendered.map(|text| {
                vec![ToolCallContent::Content {
                    content: ContentBlock::text(text),
                }]
            }),
            raw_output: content.cloned(),
        }))
    }

    /// Look up a live record (permission requests reuse its display info)
    pub fn tool_record(&self, id: &str) -> Option<ToolCallRecord> {
        self.tool_calls.get(id).map(|r| r.clone())
    }

    /// Fail every open tool call (cancellation path); terminal updates are
    /// emitted before the prompt response
    pub fn fail_open_tool_calls(&self, reason: &str) -> Result<()> {
        let ids: Vec<String> = self.tool_calls.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            if self.tool_calls.remove(&id).is_some() {
                self.send(SessionUpdate::ToolCallUpdate(ToolCallUpdate {
                    tool_call_id: id,
                    status: Some(ToolCallStatus::Failed),
                    title: None,
                    content: Some(vec![ToolCallContent::Content {
                        content: ContentBlock::text(reason),
                    }]),
                    raw_output: None,
                }))?;
            }
        }
        Ok(())
    }

    /// Number of live tool-call records
    pub fn open_tool_calls(&self) -> usize {
        self.tool_calls.len()
    }

    /// Emit `current_mode_update`
    pub fn current_mode(&self, mode_id: &str) -> Result<()> {
        self.send(SessionUpdate::CurrentModeUpdate {
            current_mode_id: mode_id.to_string(),
        })
    }

    /// Emit `current_model_update`
    pub fn current_model(&self, model_id: &str) -> Result<()> {
        self.send(SessionUpdate::CurrentModelUpdate {
            current_model_id: model_id.to_string(),
        })
    }

    /// Emit `available_commands_update`
    pub fn available_commands(&self, commands: Vec<AvailableCommand>) -> Result<()> {
        self.send(SessionUpdate::AvailableCommandsUpdate {
            available_commands: commands,
        })
    }
}

/// Structured diff content for edit-kind tool inputs
fn edit_diff_content(name: &str, input: &Value) -> Option<ToolCallContent> {
    let str_field = |field: &str| input.get(field).and_then(Value::as_str);
    match name {
        "Edit" => Some(ToolCallContent::Diff {
            path: str_field("file_path")?.to_string(),
            old_text: str_field("old_string").map(str::to_owned),
            new_text: str_field("new_string")?.to_string(),
        }),
        "Write" => Some(ToolCallContent::Diff {
            path: str_field("file_path")?.to_string(),
            old_text: None,
            new_text: str_field("content")?.to_string(),
        }),
        _ => None,
    }
}

/// Translate a TodoWrite input into plan entries
fn plan_entries(input: &Value) -> Option<Vec<PlanEntry>> {
    let todos = input.get("todos")?.as_array()?;
    let entries = todos
        .iter()
        .filter_map(|todo| {
            let content = todo.get("content").and_then(Value::as_str)?;
            let status = match todo.get("status").and_then(Value::as_str) {
                Some("in_progress") => PlanEntryStatus::InProgress,
                Some("completed") => PlanEntryStatus::Completed,
                _ => PlanEntryStatus::Pending,
            };
            let priority = match todo.get("priority").and_then(Value::as_str) {
                Some("high") => PlanEntryPriority::High,
                Some("low") => PlanEntryPriority::Low,
                _ => PlanEntryPriority::Medium,
            };
            Some(PlanEntry {
                content: content.to_string(),
                priority,
                status,
            })
        })
        .collect::<Vec<_>>();
    Some(entries)
}

/// Flatten a tool result payload into display text
///
/// Execute-kind output is fenced as code; system-reminder blocks are
/// stripped everywhere.
fn render_tool_output(value: &Value, kind: Option<ToolKind>) -> Option<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let pieces: Vec<String> = items
                .iter()
                .filter_map(|item| {
                    item.get("text")
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                })
                .collect();
            if pieces.is_empty() {
                return None;
            }
            pieces.join("\n")
        }
        _ => return None,
    };

    let cleaned = remove_system_reminders(&text);
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return None;
    }

    match kind {
        Some(ToolKind::Execute) => Some(markdown_escape(&cleaned)),
        _ => Some(cleaned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn emitter() -> (UpdateEmitter, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (client, rx) = ClientHandle::new();
        (UpdateEmitter::new("s-1", client), rx)
    }

    fn next_update(rx: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> Value {
        let frame = rx.try_recv().expect("expected a frame");
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["method"], "session/update");
        value["params"]["update"].clone()
    }

    #[test]
    fn test_agent_text_chunk_counting() {
        let (emitter, mut rx) = emitter();
        emitter.begin_turn();
        assert_eq!(emitter.agent_chunks_emitted(), 0);

        emitter.agent_text("hello").unwrap();
        emitter.agent_text(" world").unwrap();
        assert_eq!(emitter.agent_chunks_emitted(), 2);

        let update = next_update(&mut rx);
        assert_eq!(update["sessionUpdate"], "agent_message_chunk");
        assert_eq!(update["content"]["text"], "hello");
    }

    #[test]
    fn test_tool_call_precedes_update_and_record_lifecycle() {
        let (emitter, mut rx) = emitter();
        let input = serde_json::json!({"file_path": "/tmp/x.rs"});

        emitter.tool_call("toolu_1", "Read", &input).unwrap();
        assert_eq!(emitter.open_tool_calls(), 1);

        let update = next_update(&mut rx);
        assert_eq!(update["sessionUpdate"], "tool_call");
        assert_eq!(update["toolCallId"], "toolu_1");
        assert_eq!(update["title"], "Read /tmp/x.rs");
        assert_eq!(update["kind"], "read");

        emitter
            .tool_result("toolu_1", Some(&Value::String("body".to_string())), false)
            .unwrap();
        assert_eq!(emitter.open_tool_calls(), 0);

        let update = next_update(&mut rx);
        assert_eq!(update["sessionUpdate"], "tool_call_update");
        assert_eq!(update["status"], "completed");
        assert_eq!(update["content"][0]["content"]["text"], "body");
    }

    #[test]
    fn test_failed_tool_result() {
        let (emitter, mut rx) = emitter();
        emitter
            .tool_call("toolu_2", "Bash", &serde_json::json!({"command": "false"}))
            .unwrap();
        let _ = next_update(&mut rx);

        emitter
            .tool_result("toolu_2", Some(&Value::String("denied".to_string())), true)
            .unwrap();
        let update = next_update(&mut rx);
        assert_eq!(update["status"], "failed");
    }

    #[test]
    fn test_bash_output_is_fenced() {
        let (emitter, mut rx) = emitter();
        emitter
            .tool_call("toolu_3", "Bash", &serde_json::json!({"command": "ls"}))
            .unwrap();
        let _ = next_update(&mut rx);

        emitter
            .tool_result("toolu_3", Some(&Value::String("a\nb".to_string())), false)
            .unwrap();
        let update = next_update(&mut rx);
        let text = update["content"][0]["content"]["text"].as_str().unwrap();
        assert!(text.starts_with("```\n"));
        assert!(text.ends_with("```"));
    }

    #[test]
    fn test_system_reminders_stripped() {
        let (emitter, mut rx) = emitter();
        emitter
            .tool_call("toolu_4", "Read", &serde_json::json!({"file_path": "/x"}))
            .unwrap();
        let _ = next_update(&mut rx);

        let payload = "line one\n<system-reminder>internal</system-reminder>\nline two";
        emitter
            .tool_result("toolu_4", Some(&Value::String(payload.to_string())), false)
            .unwrap();
        let update = next_update(&mut rx);
        let text = update["content"][0]["content"]["text"].as_str().unwrap();
        assert!(!text.contains("system-reminder"));
        assert!(text.contains("line one"));
        assert!(text.contains("line two"));
    }

    #[test]
    fn test_edit_tool_call_carries_diff() {
        let (emitter, mut rx) = emitter();
        let input = serde_json::json!({
            "file_path": "/tmp/a.rs",
            "old_string": "let x = 1;",
            "new_string": "let x = 2;",
        });
        emitter.tool_call("toolu_5", "Edit", &input).unwrap();
        let update = next_update(&mut rx);
        assert_eq!(update["content"][0]["type"], "diff");
        assert_eq!(update["content"][0]["oldText"], "let x = 1;");
        assert_eq!(update["content"][0]["newText"], "let x = 2;");
    }

    #[test]
    fn test_todo_write_emits_plan() {
        let (emitter, mut rx) = emitter();
        let input = serde_json::json!({
            "todos": [
                {"content": "first", "status": "completed", "priority": "high"},
                {"content": "second", "status": "in_progress"},
                {"content": "third", "status": "pending", "priority": "low"},
            ]
        });
        emitter.tool_call("toolu_6", "TodoWrite", &input).unwrap();

        let tool_call = next_update(&mut rx);
        assert_eq!(tool_call["sessionUpdate"], "tool_call");
        assert_eq!(tool_call["title"], "Update task list");

        let plan = next_update(&mut rx);
        assert_eq!(plan["sessionUpdate"], "plan");
        assert_eq!(plan["entries"][0]["status"], "completed");
        assert_eq!(plan["entries"][1]["status"], "in_progress");
        assert_eq!(plan["entries"][2]["priority"], "low");
    }

    #[test]
    fn test_fail_open_tool_calls() {
        let (emitter, mut rx) = emitter();
        emitter
            .tool_call("toolu_7", "Bash", &serde_json::json!({"command": "sleep 100"}))
            .unwrap();
        let _ = next_update(&mut rx);

        emitter.fail_open_tool_calls("cancelled").unwrap();
        assert_eq!(emitter.open_tool_calls(), 0);

        let update = next_update(&mut rx);
        assert_eq!(update["sessionUpdate"], "tool_call_update");
        assert_eq!(update["status"], "failed");
    }

    #[test]
    fn test_extract_tool_info_variants() {
        let info = extract_tool_info("Bash", &serde_json::json!({"command": "cargo test"}));
        assert_eq!(info.kind, ToolKind::Execute);
        assert_eq!(info.title, "Run: cargo test");

        let info = extract_tool_info(
            "commandExecution",
            &serde_json::json!({"command": "git status"}),
        );
        assert_eq!(info.kind, ToolKind::Execute);

        let info = extract_tool_info("fileChange", &serde_json::json!({"path": "/tmp/b.rs"}));
        assert_eq!(info.kind, ToolKind::Edit);
        assert_eq!(info.locations.len(), 1);

        let info = extract_tool_info("mcp__github__create_issue", &Value::Null);
        assert_eq!(info.title, "MCP: create_issue");

        let info = extract_tool_info("SomethingNew", &Value::Null);
        assert_eq!(info.kind, ToolKind::Other);
    }

    #[test]
    fn test_markdown_escape_grows_fence() {
        let text = "```rust\nlet x = 1;\n```";
        let escaped = markdown_escape(text);
        assert!(escaped.starts_with("````\n"));
        assert!(escaped.ends_with("````"));
    }

    #[test]
    fn test_array_tool_output_flattened() {
        let value = serde_json::json!([
            {"type": "text", "text": "part one"},
            {"type": "text", "text": "part two"},
        ]);
        let rendered = render_tool_output(&value, Some(ToolKind::Read)).unwrap();
        assert_eq!(rendered, "part one\npart two");
    }
}
