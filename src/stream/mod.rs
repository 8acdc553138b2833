//! Decoding of the agent CLI's line-delimited `stream-json` output.
//!
//! Each line becomes exactly one [`StreamEvent`]. Classification is lenient:
//! the CLI has shipped several shapes for the same information, and lines we
//! do not recognise are kept as [`EventKind::Unknown`] rather than rejected.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::DecodeError;

/// Tools whose use means the agent modified files during its turn.
pub const EDIT_TOOLS: &[&str] = &["Edit", "MultiEdit", "Write", "NotebookEdit"];

/// One decoded line of agent output. `raw` is always the original line.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Init(InitInfo),
    Message(MessageInfo),
    /// Incremental chunk of assistant text (partial-message streaming).
    AssistantText(String),
    ToolUse(ToolUse),
    ToolResult(ToolResult),
    Result(ResultInfo),
    Error(ErrorInfo),
    System(SystemInfo),
    /// Any other `type`, preserved verbatim.
    Unknown { event_type: String },
}

impl EventKind {
    /// Stable short name, used when persisting raw events.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Message(_) => "message",
            Self::AssistantText(_) => "assistant_text",
            Self::ToolUse(_) => "tool_use",
            Self::ToolResult(_) => "tool_result",
            Self::Result(_) => "result",
            Self::Error(_) => "error",
            Self::System(_) => "system",
            Self::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitInfo {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub tool_count: u64,
    pub mcp_server_count: u64,
}

/// Token usage as reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Envelope fields of the message a content block came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageContext {
    pub id: Option<String>,
    pub role: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageInfo {
    pub context: MessageContext,
    /// All `text` blocks, newline-joined.
    pub text: String,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub context: MessageContext,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
    pub context: MessageContext,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultInfo {
    pub subtype: Option<String>,
    pub result: Option<String>,
    pub is_error: bool,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorInfo {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemInfo {
    pub subtype: Option<String>,
    pub data: Value,
}

/// Decode one non-blank line of agent output.
pub fn parse_line(line: &str) -> Result<StreamEvent, DecodeError> {
    let value: Value = serde_json::from_str(line).map_err(|source| DecodeError {
        line: line.to_string(),
        source,
    })?;

    let kind = match value.as_object() {
        Some(obj) => classify(obj),
        None => EventKind::Unknown {
            event_type: String::new(),
        },
    };

    Ok(StreamEvent {
        kind,
        raw: line.to_string(),
    })
}

fn classify(obj: &Map<String, Value>) -> EventKind {
    if let Some(message) = obj.get("message").and_then(Value::as_object) {
        return classify_message(message);
    }

    let event_type = str_field(obj, "type").unwrap_or_default();
    match event_type.as_str() {
        "init" => return EventKind::Init(init_info(obj)),
        "system" if str_field(obj, "subtype").as_deref() == Some("init") => {
            return EventKind::Init(init_info(obj));
        }
        "result" => return EventKind::Result(result_info(obj)),
        "error" => return EventKind::Error(error_info(obj)),
        "system" => {
            return EventKind::System(SystemInfo {
                subtype: str_field(obj, "subtype"),
                data: Value::Object(obj.clone()),
            });
        }
        _ => {}
    }

    if let Some(text) = delta_text(obj) {
        return EventKind::AssistantText(text);
    }

    EventKind::Unknown { event_type }
}

fn classify_message(message: &Map<String, Value>) -> EventKind {
    let context = MessageContext {
        id: str_field(message, "id"),
        role: str_field(message, "role"),
        model: str_field(message, "model"),
    };

    let blocks = match message.get("content") {
        Some(Value::Array(blocks)) => blocks.as_slice(),
        Some(Value::String(text)) => {
            return EventKind::Message(MessageInfo {
                context,
                text: text.clone(),
                usage: usage_field(message),
            });
        }
        _ => &[][..],
    };

    for block in blocks {
        let Some(block) = block.as_object() else {
            continue;
        };
        match str_field(block, "type").as_deref() {
            Some("tool_use") => {
                return EventKind::ToolUse(ToolUse {
                    id: str_field(block, "id").unwrap_or_default(),
                    name: str_field(block, "name").unwrap_or_default(),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                    context,
                });
            }
            Some("tool_result") => {
                return EventKind::ToolResult(ToolResult {
                    tool_use_id: str_field(block, "tool_use_id").unwrap_or_default(),
                    content: flatten_content(block.get("content")),
                    is_error: block
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    context,
                });
            }
            _ => {}
        }
    }

    let text = blocks
        .iter()
        .filter_map(Value::as_object)
        .filter(|b| str_field(b, "type").as_deref() == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");

    EventKind::Message(MessageInfo {
        context,
        text,
        usage: usage_field(message),
    })
}

fn init_info(obj: &Map<String, Value>) -> InitInfo {
    InitInfo {
        session_id: str_field(obj, "session_id"),
        model: str_field(obj, "model"),
        cwd: str_field(obj, "cwd"),
        tool_count: count_field(obj.get("tools")),
        mcp_server_count: count_field(obj.get("mcp_servers")),
    }
}

/// Arrays are counted; integers are taken as-is.
fn count_field(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Array(items)) => items.len() as u64,
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        _ => 0,
    }
}

fn result_info(obj: &Map<String, Value>) -> ResultInfo {
    ResultInfo {
        subtype: str_field(obj, "subtype"),
        result: str_field(obj, "result"),
        is_error: obj.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        duration_ms: obj.get("duration_ms").and_then(Value::as_u64),
        num_turns: obj.get("num_turns").and_then(Value::as_u64),
        total_cost_usd: obj.get("total_cost_usd").and_then(Value::as_f64),
        usage: usage_field(obj),
    }
}

fn error_info(obj: &Map<String, Value>) -> ErrorInfo {
    let message = match obj.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(e)) => {
            str_field(e, "message").unwrap_or_else(|| Value::Object(e.clone()).to_string())
        }
        _ => str_field(obj, "message").unwrap_or_default(),
    };
    ErrorInfo { message }
}

/// The three delta shapes the CLI has emitted for partial assistant text.
fn delta_text(obj: &Map<String, Value>) -> Option<String> {
    // {"delta": {"text": "..."}}
    if let Some(text) = obj
        .get("delta")
        .and_then(|d| d.get("text"))
        .and_then(Value::as_str)
    {
        return Some(text.to_string());
    }

    // {"type": "stream_event", "event": {"delta": {"text": "..."}}}
    if obj.contains_key("type")
        && let Some(text) = obj
            .get("event")
            .and_then(|e| e.get("delta"))
            .and_then(|d| d.get("text"))
            .and_then(Value::as_str)
    {
        return Some(text.to_string());
    }

    // {"text": "..."}
    obj.get("text").and_then(Value::as_str).map(str::to_string)
}

fn flatten_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn usage_field(obj: &Map<String, Value>) -> Option<Usage> {
    obj.get("usage")
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Whether a tool modifies files in the workspace.
pub fn is_edit_tool(name: &str) -> bool {
    EDIT_TOOLS.contains(&name)
}

/// Extract a human-readable description from a tool use event
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let path = || {
        input
            .get("file_path")
            .or_else(|| input.get("notebook_path"))
            .and_then(|v| v.as_str())
            .map(shorten_path)
            .unwrap_or_else(|| "file".to_string())
    };
    match name {
        "Read" => format!("Reading: {}", path()),
        "Write" => format!("Creating: {}", path()),
        "Edit" | "MultiEdit" | "NotebookEdit" => format!("Editing: {}", path()),
        "Bash" => {
            let cmd = input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 40))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {}", cmd)
        }
        "Glob" => {
            let pattern = input.get("pattern").and_then(|v| v.as_str()).unwrap_or("*");
            format!("Searching: {}", pattern)
        }
        "Grep" => {
            let pattern = input
                .get("pattern")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 30))
                .unwrap_or_else(|| "pattern".to_string());
            format!("Grep: {}", pattern)
        }
        "Task" => {
            let desc = input
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("subagent");
            format!("Agent: {}", desc)
        }
        _ => name.to_string(),
    }
}

/// Get an emoji for a tool
pub fn tool_emoji(name: &str) -> &'static str {
    match name {
        "Read" => "\u{1F4D6}",
        "Write" => "\u{1F4DD}",
        "Edit" | "MultiEdit" | "NotebookEdit" => "\u{270F}\u{FE0F}",
        "Bash" => "\u{2699}\u{FE0F}",
        "Glob" => "\u{1F50D}",
        "Grep" => "\u{1F50E}",
        "Task" => "\u{1F916}",
        _ => "\u{1F527}",
    }
}

/// Shorten a file path to just the last 2 components
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Truncate a string with ellipsis
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(line: &str) -> EventKind {
        parse_line(line).unwrap().kind
    }

    #[test]
    fn test_parse_assistant_tool_use() {
        let json = r#"{"type":"assistant","message":{"id":"m1","role":"assistant","content":[{"type":"text","text":"let me look"},{"type":"tool_use","name":"Read","input":{"file_path":"/foo/bar.rs"},"id":"123"}]},"session_id":"abc"}"#;
        match kind(json) {
            EventKind::ToolUse(tool) => {
                assert_eq!(tool.name, "Read");
                assert_eq!(tool.id, "123");
                assert_eq!(tool.input["file_path"], "/foo/bar.rs");
                assert_eq!(tool.context.id.as_deref(), Some("m1"));
                assert_eq!(tool.context.role.as_deref(), Some("assistant"));
            }
            other => panic!("Expected ToolUse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_tool_result_with_array_content() {
        let json = r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"123","content":[{"type":"text","text":"line one"},{"type":"text","text":"line two"}],"is_error":true}]}}"#;
        match kind(json) {
            EventKind::ToolResult(result) => {
                assert_eq!(result.tool_use_id, "123");
                assert_eq!(result.content, "line one\nline two");
                assert!(result.is_error);
            }
            other => panic!("Expected ToolResult, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_message_joins_text_blocks_and_usage() {
        let json = r#"{"type":"assistant","message":{"model":"claude-sonnet-4-5","content":[{"type":"text","text":"Hello"},{"type":"thinking","thinking":"hmm"},{"type":"text","text":"world"}],"usage":{"input_tokens":120,"output_tokens":30}}}"#;
        match kind(json) {
            EventKind::Message(msg) => {
                assert_eq!(msg.text, "Hello\nworld");
                assert_eq!(msg.context.model.as_deref(), Some("claude-sonnet-4-5"));
                assert_eq!(msg.usage.map(|u| u.total()), Some(150));
            }
            other => panic!("Expected Message, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_init_counts_arrays_or_integers() {
        match kind(r#"{"type":"init","session_id":"s1","tools":["Read","Edit","Bash"],"mcp_servers":2}"#) {
            EventKind::Init(init) => {
                assert_eq!(init.session_id.as_deref(), Some("s1"));
                assert_eq!(init.tool_count, 3);
                assert_eq!(init.mcp_server_count, 2);
            }
            other => panic!("Expected Init, got {:?}", other),
        }

        match kind(r#"{"type":"system","subtype":"init","model":"claude-opus-4-1","tools":7,"mcp_servers":[{"name":"a"}]}"#) {
            EventKind::Init(init) => {
                assert_eq!(init.model.as_deref(), Some("claude-opus-4-1"));
                assert_eq!(init.tool_count, 7);
                assert_eq!(init.mcp_server_count, 1);
            }
            other => panic!("Expected Init, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_result_and_error_and_system() {
        match kind(r#"{"type":"result","subtype":"success","result":"all done","is_error":false,"num_turns":4,"duration_ms":1200}"#) {
            EventKind::Result(r) => {
                assert_eq!(r.result.as_deref(), Some("all done"));
                assert_eq!(r.num_turns, Some(4));
                assert!(!r.is_error);
            }
            other => panic!("Expected Result, got {:?}", other),
        }

        match kind(r#"{"type":"error","error":{"message":"overloaded"}}"#) {
            EventKind::Error(e) => assert_eq!(e.message, "overloaded"),
            other => panic!("Expected Error, got {:?}", other),
        }

        match kind(r#"{"type":"error","message":"plain"}"#) {
            EventKind::Error(e) => assert_eq!(e.message, "plain"),
            other => panic!("Expected Error, got {:?}", other),
        }

        match kind(r#"{"type":"system","subtype":"compact_boundary"}"#) {
            EventKind::System(s) => assert_eq!(s.subtype.as_deref(), Some("compact_boundary")),
            other => panic!("Expected System, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_all_three_delta_shapes() {
        let shapes = [
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"abc"}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"abc"}}}"#,
            r#"{"type":"partial","text":"abc"}"#,
        ];
        for line in shapes {
            assert_eq!(kind(line), EventKind::AssistantText("abc".into()), "{}", line);
        }
    }

    #[test]
    fn test_unknown_type_is_preserved_with_raw_line() {
        let line = r#"{"type":"rate_limit","retry_after":3}"#;
        let event = parse_line(line).unwrap();
        assert_eq!(
            event.kind,
            EventKind::Unknown {
                event_type: "rate_limit".into()
            }
        );
        assert_eq!(event.raw, line);
        assert_eq!(event.kind.name(), "unknown");
    }

    #[test]
    fn test_malformed_line_is_decode_error() {
        let err = parse_line(r#"{"type":"assistant""#).unwrap_err();
        assert_eq!(err.line, r#"{"type":"assistant""#);
    }

    #[test]
    fn test_describe_tool_use() {
        let input = serde_json::json!({"file_path": "/Users/foo/project/src/main.rs"});
        assert_eq!(describe_tool_use("Read", &input), "Reading: src/main.rs");
        assert_eq!(describe_tool_use("MultiEdit", &input), "Editing: src/main.rs");

        let input = serde_json::json!({"command": "cargo test --release"});
        assert_eq!(
            describe_tool_use("Bash", &input),
            "Running: cargo test --release"
        );
    }

    #[test]
    fn test_edit_tools() {
        assert!(is_edit_tool("Edit"));
        assert!(is_edit_tool("Write"));
        assert!(!is_edit_tool("Read"));
        assert!(!is_edit_tool("Bash"));
    }

    #[test]
    fn test_truncate_str_respects_char_boundaries() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("ééééééééé", 6), "ééé...");
    }
}
