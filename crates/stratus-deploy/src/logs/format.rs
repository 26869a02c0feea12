//! Classification and rendering of single function log events.
//!
//! Functions log in JSON. Platform records carry a `type` such as
//! `platform.start` or `platform.report`; application records carry
//! `timestamp`, `level`, `logger` and `message`, plus error details when an
//! exception was logged. Anything that does not parse is rendered verbatim.

use serde::Deserialize;
use serde_json::{Map, Value};

/// Platform record types rendered as indented status and metric lines.
pub const METRIC_RECORD_TYPES: &[&str] = &[
    "platform.report",
    "platform.initReport",
    "platform.runtimeDone",
    "platform.restoreReport",
];

const INDENT: &str = "    ";

/// A classified log event.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    /// An invocation started.
    PlatformStart {
        /// Record time.
        time: String,
        /// Function version that ran.
        version: String,
    },
    /// A platform record with an outcome and metrics.
    PlatformMetrics {
        /// Record time.
        time: String,
        /// Record type, e.g. `platform.report`.
        record_type: String,
        /// Outcome, e.g. `success`.
        status: Option<String>,
        /// Metric name and value pairs.
        metrics: Vec<(String, Value)>,
    },
    /// A line logged by the application.
    Application {
        /// Event time.
        timestamp: String,
        /// Log level.
        level: String,
        /// Logger name.
        logger: Option<String>,
        /// Message text.
        message: String,
        /// `errorType: errorMessage` and stack trace, when an exception was logged.
        error: Option<ErrorDetail>,
    },
    /// A JSON record of a type that is not rendered specially.
    Unrecognised(Value),
    /// An event that could not be parsed.
    Verbatim(String),
}

/// Exception attached to an application record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Exception type.
    pub error_type: String,
    /// Exception message.
    pub error_message: String,
    /// Stack trace lines.
    pub stack_trace: Vec<String>,
}

#[derive(Deserialize)]
struct StartRecord {
    time: String,
    record: StartBody,
}

#[derive(Deserialize)]
struct StartBody {
    version: String,
}

#[derive(Deserialize)]
struct MetricsRecord {
    time: String,
    record: MetricsBody,
}

#[derive(Deserialize)]
struct MetricsBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    metrics: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationRecord {
    timestamp: String,
    level: String,
    #[serde(default)]
    logger: Option<String>,
    message: Value,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    stack_trace: Vec<String>,
}

impl LogEntry {
    /// Classify a raw event message. Never fails.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let Ok(value) = serde_json::from_str::<Value>(message) else {
            return Self::Verbatim(message.trim_end().to_owned());
        };
        if !value.is_object() {
            return Self::Verbatim(message.trim_end().to_owned());
        }

        let parsed = match value.get("type").and_then(Value::as_str) {
            Some("platform.start") => Self::start(&value),
            Some(kind) if METRIC_RECORD_TYPES.contains(&kind) => Self::metrics(kind, &value),
            Some(_) => Some(Self::Unrecognised(value.clone())),
            None => Self::application(&value),
        };
        parsed.unwrap_or_else(|| Self::Verbatim(message.trim_end().to_owned()))
    }

    fn start(value: &Value) -> Option<Self> {
        let record = StartRecord::deserialize(value).ok()?;
        Some(Self::PlatformStart {
            time: record.time,
            version: record.record.version,
        })
    }

    fn metrics(kind: &str, value: &Value) -> Option<Self> {
        let record = MetricsRecord::deserialize(value).ok()?;
        Some(Self::PlatformMetrics {
            time: record.time,
            record_type: kind.to_owned(),
            status: record.record.status,
            metrics: record.record.metrics.into_iter().collect(),
        })
    }

    fn application(value: &Value) -> Option<Self> {
        let record = ApplicationRecord::deserialize(value).ok()?;
        let message = match record.message {
            Value::String(text) => text,
            other => other.to_string(),
        };
        let error = if record.stack_trace.is_empty() && record.error_type.is_none() {
            None
        } else {
            Some(ErrorDetail {
                error_type: record.error_type.unwrap_or_default(),
                error_message: record.error_message.unwrap_or_default(),
                stack_trace: record
                    .stack_trace
                    .concat()
                    .lines()
                    .map(ToOwned::to_owned)
                    .collect(),
            })
        };
        Some(Self::Application {
            timestamp: record.timestamp,
            level: record.level,
            logger: record.logger,
            message,
            error,
        })
    }

    /// Rendered output lines.
    #[must_use]
    pub fn render(&self) -> Vec<String> {
        match self {
            Self::PlatformStart { time, version } => {
                vec![format!("{time} platform.start version: {version}")]
            }
            Self::PlatformMetrics {
                time,
                record_type,
                status,
                metrics,
            } => {
                let mut lines = vec![format!("{time} {record_type}")];
                if let Some(status) = status {
                    lines.push(format!("{INDENT}status: {status}"));
                }
                lines.extend(
                    metrics
                        .iter()
                        .map(|(name, value)| format!("{INDENT}{name}: {value}")),
                );
                lines
            }
            Self::Application {
                timestamp,
                level,
                logger,
                message,
                error,
            } => {
                let mut head = format!("{timestamp} {level}");
                if let Some(logger) = logger {
                    head.push(' ');
                    head.push_str(logger);
                }
                head.push(' ');
                head.push_str(message);

                let mut lines = vec![head];
                if let Some(error) = error {
                    lines.push(format!("{}: {}", error.error_type, error.error_message));
                    lines.extend(error.stack_trace.iter().cloned());
                }
                lines
            }
            Self::Unrecognised(value) => vec![value.to_string()],
            Self::Verbatim(raw) => vec![raw.clone()],
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn lines(value: &Value) -> Vec<String> {
        LogEntry::classify(&value.to_string()).render()
    }

    #[test]
    fn platform_start_shows_version() {
        let event = json!({
            "time": "2024-05-01T10:00:00.000Z",
            "type": "platform.start",
            "record": { "requestId": "r-1", "version": "$LATEST" },
        });
        assert_eq!(
            lines(&event),
            vec!["2024-05-01T10:00:00.000Z platform.start version: $LATEST"]
        );
    }

    #[test]
    fn platform_report_indents_status_and_metrics() {
        let event = json!({
            "time": "2024-05-01T10:00:01.000Z",
            "type": "platform.report",
            "record": {
                "requestId": "r-1",
                "status": "success",
                "metrics": { "billedDurationMs": 3, "durationMs": 2.5 },
            },
        });
        assert_eq!(
            lines(&event),
            vec![
                "2024-05-01T10:00:01.000Z platform.report",
                "    status: success",
                "    billedDurationMs: 3",
                "    durationMs: 2.5",
            ]
        );
    }

    #[test]
    fn application_error_is_followed_by_trace() {
        let event = json!({
            "timestamp": "2024-05-01T10:00:00Z",
            "level": "ERROR",
            "logger": "app.handler",
            "message": "boom",
            "errorType": "RuntimeError",
            "errorMessage": "deliberate",
            "stackTrace": ["  File \"handler.py\", line 3\n", "    raise RuntimeError\n"],
        });
        assert_eq!(
            lines(&event),
            vec![
                "2024-05-01T10:00:00Z ERROR app.handler boom",
                "RuntimeError: deliberate",
                "  File \"handler.py\", line 3",
                "    raise RuntimeError",
            ]
        );
    }

    #[test]
    fn other_records_and_garbage_do_not_fail() {
        let unknown = json!({ "type": "platform.extension", "time": "t" });
        assert!(matches!(
            LogEntry::classify(&unknown.to_string()),
            LogEntry::Unrecognised(_)
        ));

        assert_eq!(
            LogEntry::classify("START RequestId: r-1\n").render(),
            vec!["START RequestId: r-1"]
        );

        // known type with the wrong shape
        let broken = r#"{"type":"platform.start","time":"t"}"#;
        assert_eq!(LogEntry::classify(broken), LogEntry::Verbatim(broken.to_owned()));
    }
}
