//! Analysis stream message types and parser.
//!
//! The server names each SSE event with a tag (`progress`, `result`,
//! `error`, and `complete` on batch streams) and sends a JSON payload in
//! the `data` field. This module turns a tag/payload pair into a
//! strongly-typed [`StreamMessage`].

use std::collections::HashMap;

use analyst_core::batch::RankedResult;
use analyst_core::session::SubTaskResult;
use analyst_core::stage::JobStage;
use serde::Deserialize;

pub const EVENT_PROGRESS: &str = "progress";
pub const EVENT_RESULT: &str = "result";
pub const EVENT_ERROR: &str = "error";
/// Final event of a batch stream carrying the ranking.
pub const EVENT_COMPLETE: &str = "complete";

/// All known analysis stream messages.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    /// The job moved to a new stage.
    Progress(ProgressData),
    /// Terminal outcome for one input.
    Result(ResultData),
    /// The server gave up on one input.
    Error(ErrorData),
    /// Batch streams only: the final ranking.
    BatchComplete(BatchCompleteData),
}

impl StreamMessage {
    /// The input this message is about, if it names one.
    pub fn input(&self) -> Option<&str> {
        let input = match self {
            Self::Progress(data) => &data.input,
            Self::Result(data) => &data.input,
            Self::Error(data) => &data.input,
            Self::BatchComplete(_) => return None,
        };
        Some(input.as_str()).filter(|s| !s.is_empty())
    }
}

/// Payload for `progress` events.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub stage: JobStage,
    /// Percentage, 0-100. Not guaranteed to increase.
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Outcome of a sub-task that finished with this update.
    #[serde(default)]
    pub task_result: Option<TaskResultData>,
}

/// A sub-task result piggy-backed on a progress event.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskResultData {
    #[serde(alias = "agent")]
    pub task: String,
    pub success: bool,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl TaskResultData {
    pub fn into_result(self) -> (String, SubTaskResult) {
        (
            self.task,
            SubTaskResult {
                success: self.success,
                duration_secs: self.duration,
                payload: self.data,
            },
        )
    }
}

/// Payload for `result` events.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "RawResultData")]
pub struct ResultData {
    pub success: bool,
    pub input: String,
    pub error: Option<String>,
    /// Per sub-task outcomes, keyed by sub-task id.
    pub results: HashMap<String, SubTaskResult>,
    /// Every other outcome field.
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Wire shape of [`ResultData`]; `results` is still untyped here.
#[derive(Deserialize)]
struct RawResultData {
    success: bool,
    #[serde(default)]
    input: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    fields: serde_json::Map<String, serde_json::Value>,
}

impl From<RawResultData> for ResultData {
    fn from(raw: RawResultData) -> Self {
        let mut fields = raw.fields;
        let results = match fields.remove("results") {
            Some(value) => {
                let (results, rest) = split_task_results(value);
                if let Some(rest) = rest {
                    fields.insert("results".to_string(), rest);
                }
                results
            }
            None => HashMap::new(),
        };
        Self {
            success: raw.success,
            input: raw.input,
            error: raw.error,
            results,
            fields,
        }
    }
}

/// Pull per-task entries out of a `results` value.
///
/// Entries that look like a sub-task result are returned typed; anything
/// else is handed back so it stays part of the outcome.
fn split_task_results(
    value: serde_json::Value,
) -> (HashMap<String, SubTaskResult>, Option<serde_json::Value>) {
    let entries = match value {
        serde_json::Value::Object(entries) => entries,
        other => return (HashMap::new(), Some(other)),
    };
    let mut results = HashMap::new();
    let mut rest = serde_json::Map::new();
    for (task, entry) in entries {
        match serde_json::from_value::<SubTaskResult>(entry.clone()) {
            Ok(result) => {
                results.insert(task, result);
            }
            Err(_) => {
                rest.insert(task, entry);
            }
        }
    }
    let rest = (!rest.is_empty()).then_some(serde_json::Value::Object(rest));
    (results, rest)
}

/// Payload for `error` events.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    #[serde(alias = "message")]
    pub error: String,
    #[serde(default)]
    pub input: String,
}

/// Payload for the batch `complete` event.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchCompleteData {
    #[serde(default, alias = "ranked")]
    pub results: Vec<RankedEntry>,
}

/// One ranking entry as sent on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct RankedEntry {
    #[serde(alias = "symbol")]
    pub input: String,
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl BatchCompleteData {
    /// Convert to ranked results. Entries without a rank are ranked by
    /// their position in the list.
    pub fn into_ranked(self) -> Vec<RankedResult> {
        self.results
            .into_iter()
            .enumerate()
            .map(|(i, entry)| RankedResult {
                input: entry.input,
                rank: entry.rank.unwrap_or(i as u32 + 1),
                score: entry.score,
                fields: entry.fields,
            })
            .collect()
    }
}

/// A recognised tag whose payload did not parse.
#[derive(Debug, thiserror::Error)]
#[error("Malformed {event} payload: {source}")]
pub struct MessageError {
    pub event: String,
    #[source]
    pub source: serde_json::Error,
}

/// Parse one SSE event into a typed message.
///
/// Returns `Ok(None)` for tags this client does not know; callers should
/// log and continue. Returns `Err` when a known tag carries a payload
/// that does not match its shape.
pub fn parse_message(event: &str, data: &str) -> Result<Option<StreamMessage>, MessageError> {
    let malformed = |source| MessageError {
        event: event.to_string(),
        source,
    };
    let message = match event {
        EVENT_PROGRESS => StreamMessage::Progress(serde_json::from_str(data).map_err(malformed)?),
        EVENT_RESULT => StreamMessage::Result(serde_json::from_str(data).map_err(malformed)?),
        EVENT_ERROR => StreamMessage::Error(serde_json::from_str(data).map_err(malformed)?),
        EVENT_COMPLETE => {
            StreamMessage::BatchComplete(serde_json::from_str(data).map_err(malformed)?)
        }
        _ => return Ok(None),
    };
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_progress_message() {
        let json = r#"{"stage":"running_news","progress":42.5,"input":"AAPL","timestamp":"2024-05-01T10:00:00Z"}"#;
        match parse_message("progress", json).unwrap() {
            Some(StreamMessage::Progress(data)) => {
                assert_eq!(data.stage, JobStage::parse("running_news"));
                assert_eq!(data.progress, Some(42.5));
                assert_eq!(data.input, "AAPL");
                assert!(data.task_result.is_none());
            }
            other => panic!("Expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn parse_progress_with_task_result() {
        let json = r#"{"stage":"analyzing_sentiment","progress":70,"input":"AAPL","task_result":{"agent":"technical","success":false,"duration":3.2}}"#;
        match parse_message("progress", json).unwrap() {
            Some(StreamMessage::Progress(data)) => {
                let (task, result) = data.task_result.unwrap().into_result();
                assert_eq!(task, "technical");
                assert!(!result.success);
                assert_eq!(result.duration_secs, Some(3.2));
            }
            other => panic!("Expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn parse_result_keeps_outcome_fields() {
        let json = r#"{"success":true,"input":"AAPL","results":{"market":{"success":true}},"recommendation":"buy","confidence":0.8}"#;
        match parse_message("result", json).unwrap() {
            Some(StreamMessage::Result(data)) => {
                assert!(data.success);
                assert_eq!(data.results.len(), 1);
                assert_eq!(data.fields["recommendation"], "buy");
                assert_eq!(data.fields["confidence"], 0.8);
                assert!(!data.fields.contains_key("input"));
            }
            other => panic!("Expected Result, got {other:?}"),
        }
    }

    #[test]
    fn parse_result_keeps_untyped_results_as_outcome() {
        let json = r#"{"success":true,"input":"AAPL","results":["buy","hold"]}"#;
        match parse_message("result", json).unwrap() {
            Some(StreamMessage::Result(data)) => {
                assert!(data.results.is_empty());
                assert_eq!(data.fields["results"], serde_json::json!(["buy", "hold"]));
            }
            other => panic!("Expected Result, got {other:?}"),
        }
    }

    #[test]
    fn parse_result_splits_mixed_results() {
        let json = r#"{"success":true,"input":"AAPL","results":{"market":{"success":true},"summary":"strong"}}"#;
        match parse_message("result", json).unwrap() {
            Some(StreamMessage::Result(data)) => {
                assert_eq!(data.results.len(), 1);
                assert!(data.results["market"].success);
                assert_eq!(data.fields["results"], serde_json::json!({"summary": "strong"}));
            }
            other => panic!("Expected Result, got {other:?}"),
        }
    }

    #[test]
    fn parse_error_message() {
        let json = r#"{"error":"upstream quota exceeded","input":"TSLA"}"#;
        match parse_message("error", json).unwrap() {
            Some(StreamMessage::Error(data)) => {
                assert_eq!(data.error, "upstream quota exceeded");
                assert_eq!(data.input, "TSLA");
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[test]
    fn parse_batch_complete_assigns_missing_ranks() {
        let json = r#"{"results":[{"symbol":"MSFT","score":0.9},{"input":"AAPL","rank":5,"note":"x"}]}"#;
        match parse_message("complete", json).unwrap() {
            Some(StreamMessage::BatchComplete(data)) => {
                let ranked = data.into_ranked();
                assert_eq!(ranked[0].input, "MSFT");
                assert_eq!(ranked[0].rank, 1);
                assert_eq!(ranked[1].rank, 5);
                assert_eq!(ranked[1].fields["note"], "x");
            }
            other => panic!("Expected BatchComplete, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_ignored() {
        assert!(parse_message("heartbeat", "{}").unwrap().is_none());
        assert!(parse_message("message", "not json").unwrap().is_none());
    }

    #[test]
    fn malformed_payload_returns_error() {
        let err = parse_message("progress", "{not json").unwrap_err();
        assert_eq!(err.event, "progress");
        assert!(parse_message("result", r#"{"input":"AAPL"}"#).is_err());
    }

    #[test]
    fn input_accessor_skips_empty() {
        let msg = parse_message("error", r#"{"error":"x"}"#).unwrap().unwrap();
        assert_eq!(msg.input(), None);
        let msg = parse_message("error", r#"{"error":"x","input":"AAPL"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(msg.input(), Some("AAPL"));
    }
}
