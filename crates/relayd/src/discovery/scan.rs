//! Conversation log parsing.
//!
//! A session's log is a JSONL file that can be hundreds of megabytes, so
//! the scanner never reads the whole thing: the first ~4 KiB yields the
//! working directory and CLI version, the last ~4 KiB yields the most
//! recent message. Malformed lines are skipped individually.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde_json::Value;

use relay_core::MessageRole;

/// How much of the head and tail of a log file is examined.
const HEAD_BYTES: u64 = 4096;
const TAIL_BYTES: u64 = 4096;

/// Maximum preview length in characters.
pub const PREVIEW_MAX_CHARS: usize = 200;

/// Fields harvested from one log file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLog {
    /// First `cwd` field seen near the head.
    pub project_path: Option<String>,
    /// First `version` field seen near the head.
    pub cli_version: Option<String>,
    /// Role of the newest user/assistant record near the tail.
    pub last_message_role: MessageRole,
    /// Preview of that record's message text.
    pub last_message_preview: Option<String>,
}

/// Parses the head and tail of a log file.
///
/// Performs blocking I/O; call via `spawn_blocking`.
pub fn parse_log_file(path: &Path) -> std::io::Result<ParsedLog> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    let mut parsed = ParsedLog::default();
    parse_head(&mut file, &mut parsed)?;
    parse_tail(&mut file, len, &mut parsed)?;

    Ok(parsed)
}

/// Scans the first chunk for `cwd` and `version`, stopping early once
/// both are known.
fn parse_head(file: &mut File, parsed: &mut ParsedLog) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = vec![0u8; HEAD_BYTES as usize];
    let n = read_up_to(file, &mut buf)?;
    let text = String::from_utf8_lossy(&buf[..n]);

    // When the chunk is full, the final line is likely cut mid-record
    let truncated = n as u64 == HEAD_BYTES;
    let mut lines: Vec<&str> = text.lines().collect();
    if truncated {
        lines.pop();
    }

    for line in lines {
        let Ok(record) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if parsed.project_path.is_none() {
            if let Some(cwd) = record.get("cwd").and_then(Value::as_str) {
                parsed.project_path = Some(cwd.to_string());
            }
        }
        if parsed.cli_version.is_none() {
            if let Some(version) = record.get("version").and_then(Value::as_str) {
                parsed.cli_version = Some(version.to_string());
            }
        }
        if parsed.project_path.is_some() && parsed.cli_version.is_some() {
            break;
        }
    }

    Ok(())
}

/// Scans the last chunk, newest record first, for a user/assistant
/// message.
fn parse_tail(file: &mut File, len: u64, parsed: &mut ParsedLog) -> std::io::Result<()> {
    let start = len.saturating_sub(TAIL_BYTES);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; TAIL_BYTES as usize];
    let n = read_up_to(file, &mut buf)?;
    let text = String::from_utf8_lossy(&buf[..n]);

    let mut lines: Vec<&str> = text.lines().collect();
    // A mid-file read starts inside some record; drop the partial line
    if start > 0 && !lines.is_empty() {
        lines.remove(0);
    }

    for line in lines.iter().rev() {
        let Ok(record) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(record_type) = record.get("type").and_then(Value::as_str) else {
            continue;
        };
        let role = MessageRole::from_record_type(record_type);
        if role == MessageRole::Unknown {
            continue;
        }

        parsed.last_message_role = role;
        parsed.last_message_preview = extract_message_text(&record).map(|t| make_preview(&t));
        break;
    }

    Ok(())
}

/// Reads until the buffer is full or EOF.
fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Pulls the message text out of a record.
///
/// `message.content` is either a plain string or a list of content
/// blocks, in which case the first `text` block wins.
fn extract_message_text(record: &Value) -> Option<String> {
    let content = record.get("message")?.get("content")?;

    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => blocks.iter().find_map(|block| {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                block
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            } else {
                None
            }
        }),
        _ => None,
    }
}

/// Truncates to the preview limit on a character boundary, appending an
/// ellipsis when anything was cut.
pub fn make_preview(text: &str) -> String {
    let mut preview: String = text.chars().take(PREVIEW_MAX_CHARS).collect();
    if text.chars().count() > PREVIEW_MAX_CHARS {
        preview.push_str("...");
    }
    preview
}

/// Synthesizes a project path from a hash directory name when no `cwd`
/// was found: `-home-user-proj` becomes `/home/user/proj`.
pub fn synthesize_project_path(project_hash: &str) -> String {
    project_hash.replace('-', "/")
}

// ============================================================================
// Tests
// ============================================================================
