//! Typed view of ComfyUI's submit and history responses.
//!
//! `GET /history/{prompt_id}` returns an object keyed by prompt id. The
//! entry is absent until the prompt has been picked up, then carries a
//! `status` block and, once nodes have produced files, an `outputs` object:
//!
//! ```json
//! {
//!   "abc-123": {
//!     "status": { "status_str": "success", "completed": true, "messages": [...] },
//!     "outputs": { "9": { "images": [ { "filename": "avatar_00001_.png",
//!                                        "subfolder": "", "type": "output" } ] } }
//!   }
//! }
//! ```

use avagen_core::types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default ComfyUI folder for saved outputs.
pub const DEFAULT_FOLDER_TYPE: &str = "output";

/// A prompt accepted by the server; the key used for polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionHandle {
    /// Server-assigned prompt id.
    pub id: String,
    pub submitted_at: Timestamp,
}

impl SubmissionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            submitted_at: chrono::Utc::now(),
        }
    }
}

/// One generated file inside the server's output namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Node that produced the file.
    pub node_id: String,
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

impl ArtifactRef {
    /// Filename without its extension.
    pub fn stem(&self) -> &str {
        std::path::Path::new(&self.filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.filename)
    }
}

fn default_folder_type() -> String {
    DEFAULT_FOLDER_TYPE.to_string()
}

/// Non-terminal progress as reported by the history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressInfo {
    /// `status.status_str`, or `"unknown"`.
    pub status: String,
    /// Number of execution messages recorded so far.
    pub messages: usize,
}

/// Outcome of a single status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    /// The server has no history entry for the prompt yet.
    Pending,
    Running(ProgressInfo),
    /// Artifacts in the order the server reported them.
    Completed(Vec<ArtifactRef>),
    Failed(String),
}

impl PollResult {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

/// Extract the prompt id from a `POST /prompt` response body.
///
/// A body with an `error` field or non-empty `node_errors` is a rejection
/// even when the HTTP status was 200.
pub fn parse_submit_response(body: &Value) -> Result<String, String> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        return Err(describe_error_value(error));
    }
    if let Some(node_errors) = body.get("node_errors").and_then(Value::as_object) {
        if !node_errors.is_empty() {
            let nodes: Vec<&str> = node_errors.keys().map(String::as_str).collect();
            return Err(format!("node errors in: {}", nodes.join(", ")));
        }
    }
    body.get("prompt_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| "response has no prompt_id".to_string())
}

/// Interpret a `GET /history/{prompt_id}` body.
pub fn parse_history(body: &Value, prompt_id: &str) -> PollResult {
    let Some(entry) = body.get(prompt_id) else {
        return PollResult::Pending;
    };

    if let Some(error) = entry.get("error").filter(|e| !e.is_null()) {
        return PollResult::Failed(describe_error_value(error));
    }

    let status = entry.get("status");
    let status_str = status
        .and_then(|s| s.get("status_str"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let messages = status
        .and_then(|s| s.get("messages"))
        .and_then(Value::as_array);

    if status_str == "error" {
        return PollResult::Failed(execution_error_message(messages));
    }

    let artifacts = collect_artifacts(entry.get("outputs"));
    if !artifacts.is_empty() {
        return PollResult::Completed(artifacts);
    }

    let completed = status
        .and_then(|s| s.get("completed"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if completed {
        return PollResult::Failed("completed without producing images".to_string());
    }

    PollResult::Running(ProgressInfo {
        status: status_str.to_string(),
        messages: messages.map_or(0, Vec::len),
    })
}

// ---- private helpers ----

fn collect_artifacts(outputs: Option<&Value>) -> Vec<ArtifactRef> {
    let Some(outputs) = outputs.and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut artifacts = Vec::new();
    for (node_id, node_output) in outputs {
        let Some(images) = node_output.get("images").and_then(Value::as_array) else {
            continue;
        };
        for image in images {
            let Some(filename) = image.get("filename").and_then(Value::as_str) else {
                continue;
            };
            artifacts.push(ArtifactRef {
                node_id: node_id.clone(),
                filename: filename.to_string(),
                subfolder: image
                    .get("subfolder")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                folder_type: image
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_FOLDER_TYPE)
                    .to_string(),
            });
        }
    }
    artifacts
}

/// Find the most specific failure reason in the status message log.
///
/// Messages are `[kind, data]` pairs; `execution_error` carries the
/// exception raised by the failing node.
fn execution_error_message(messages: Option<&Vec<Value>>) -> String {
    for message in messages.into_iter().flatten() {
        let kind = message.get(0).and_then(Value::as_str);
        let data = message.get(1);
        match kind {
            Some("execution_error") => {
                let text = data
                    .and_then(|d| d.get("exception_message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .trim();
                return match data.and_then(|d| d.get("node_id")).and_then(Value::as_str) {
                    Some(node) => format!("node {node}: {text}"),
                    None => text.to_string(),
                };
            }
            Some("execution_interrupted") => return "execution interrupted".to_string(),
            _ => {}
        }
    }
    "rendering server reported an error".to_string()
}

fn describe_error_value(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn absent_entry_is_pending() {
        assert_eq!(parse_history(&json!({}), "abc"), PollResult::Pending);
        assert_eq!(
            parse_history(&json!({"other": {"outputs": {}}}), "abc"),
            PollResult::Pending
        );
    }

    #[test]
    fn completed_preserves_server_order() {
        let body = json!({
            "abc": {
                "status": { "status_str": "success", "completed": true },
                "outputs": {
                    "9": { "images": [
                        { "filename": "avatar_00002_.png", "subfolder": "", "type": "output" },
                        { "filename": "avatar_00001_.png", "subfolder": "", "type": "output" }
                    ] },
                    "12": { "images": [ { "filename": "grid_00001_.png", "subfolder": "grids" } ] },
                    "3": { "text": ["not an image output"] }
                }
            }
        });

        let refs = assert_matches!(parse_history(&body, "abc"), PollResult::Completed(r) => r);
        let names: Vec<&str> = refs.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(
            names,
            ["avatar_00002_.png", "avatar_00001_.png", "grid_00001_.png"]
        );
        assert_eq!(refs[2].node_id, "12");
        assert_eq!(refs[2].subfolder, "grids");
        assert_eq!(refs[2].folder_type, "output");
    }

    #[test]
    fn error_status_is_failed_with_exception_message() {
        let body = json!({
            "abc": {
                "status": {
                    "status_str": "error",
                    "completed": false,
                    "messages": [
                        ["execution_start", { "prompt_id": "abc" }],
                        ["execution_error", { "node_id": "3", "exception_message": "CUDA out of memory\n" }]
                    ]
                },
                "outputs": {}
            }
        });
        assert_eq!(
            parse_history(&body, "abc"),
            PollResult::Failed("node 3: CUDA out of memory".to_string())
        );
    }

    #[test]
    fn error_field_wins_over_outputs() {
        let body = json!({
            "abc": {
                "error": "boom",
                "outputs": { "9": { "images": [ { "filename": "x.png" } ] } }
            }
        });
        assert_eq!(parse_history(&body, "abc"), PollResult::Failed("boom".into()));
    }

    #[test]
    fn in_progress_entry_is_running() {
        let body = json!({
            "abc": {
                "status": { "status_str": "running", "completed": false, "messages": [["execution_start", {}]] },
                "outputs": {}
            }
        });
        assert_eq!(
            parse_history(&body, "abc"),
            PollResult::Running(ProgressInfo {
                status: "running".into(),
                messages: 1
            })
        );
    }

    #[test]
    fn completed_without_images_is_failed() {
        let body = json!({ "abc": { "status": { "status_str": "success", "completed": true }, "outputs": {} } });
        assert_matches!(parse_history(&body, "abc"), PollResult::Failed(_));
    }

    #[test]
    fn submit_response_yields_prompt_id() {
        let body = json!({ "prompt_id": "p-1", "number": 3, "node_errors": {} });
        assert_eq!(parse_submit_response(&body).unwrap(), "p-1");
    }

    #[test]
    fn submit_response_with_node_errors_is_rejected() {
        let body = json!({ "prompt_id": "p-1", "node_errors": { "10": { "errors": [] } } });
        let reason = parse_submit_response(&body).unwrap_err();
        assert!(reason.contains("10"));
    }

    #[test]
    fn submit_response_without_id_is_rejected() {
        assert!(parse_submit_response(&json!({ "number": 1 })).is_err());
        assert!(parse_submit_response(&json!({ "error": { "message": "bad prompt" } }))
            .unwrap_err()
            .contains("bad prompt"));
    }

    #[test]
    fn artifact_stem_strips_extension() {
        let artifact = ArtifactRef {
            node_id: "9".into(),
            filename: "out_0001_.png".into(),
            subfolder: String::new(),
            folder_type: "output".into(),
        };
        assert_eq!(artifact.stem(), "out_0001_");
    }
}
