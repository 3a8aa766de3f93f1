//! Log event normalization.
//!
//! Agents report three kinds of container output: image-pull progress,
//! process stdout/stderr lines, and auxiliary notices from the agent
//! itself. Each becomes one line of the form
//!
//! ```text
//! [<RFC3339 UTC timestamp>] <first 8 chars of container id> [<container state>] || <message>
//! ```
//!
//! Downstream log viewers parse this format, so it must not drift.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use slotgrid_core::{ContainerId, ContainerState, TaskId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LogEventError {
    #[error("log event for container {0} carries no recognized payload")]
    NoPayload(ContainerId),
}

/// Byte counters attached to a pull progress message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDetail {
    pub current: u64,
    #[serde(default)]
    pub total: u64,
}

impl ProgressDetail {
    fn render(&self) -> String {
        if self.total > 0 {
            format!("{}/{}", self.current, self.total)
        } else {
            self.current.to_string()
        }
    }
}

/// One image-pull status message, as streamed by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    /// Pre-rendered textual progress, e.g. a progress bar.
    #[serde(default)]
    pub progress: String,
    #[serde(default)]
    pub progress_detail: Option<ProgressDetail>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PullProgress {
    /// Rendered text first, then the textual indicator, then the numeric one.
    pub fn message(&self) -> String {
        if let Some(error) = &self.error {
            return error.trim().to_string();
        }

        let rendered = if self.id.is_empty() {
            self.status.clone()
        } else {
            format!("{}: {}", self.id, self.status)
        };
        let rendered = rendered.trim();
        // "abc123: " with an empty status trims to "abc123:", which says nothing.
        if !rendered.is_empty() && !rendered.ends_with(':') {
            return rendered.to_string();
        }

        let text = self.progress.trim();
        if !text.is_empty() {
            return text.to_string();
        }
        match &self.progress_detail {
            Some(detail) => detail.render(),
            None => rendered.to_string(),
        }
    }
}

/// One line of process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMessage {
    pub value: String,
    #[serde(default)]
    pub stream: Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    #[default]
    Stdout,
    Stderr,
}

/// A log event as it arrives from an agent: any of three optional payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLogEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub pull_message: Option<PullProgress>,
    #[serde(default)]
    pub run_message: Option<RunMessage>,
    #[serde(default)]
    pub aux_message: Option<String>,
}

/// The recognized payload of a log event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    SystemNotice(String),
    ProcessOutput(RunMessage),
    ImagePull(PullProgress),
}

impl LogPayload {
    pub fn message(&self) -> String {
        match self {
            LogPayload::SystemNotice(text) => text.clone(),
            LogPayload::ProcessOutput(run) => run
                .value
                .strip_suffix('\n')
                .unwrap_or(&run.value)
                .to_string(),
            LogPayload::ImagePull(pull) => pull.message(),
        }
    }
}

/// A validated log event for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub container_id: ContainerId,
    pub timestamp: DateTime<Utc>,
    pub payload: LogPayload,
}

impl LogEvent {
    /// Pick the payload; when several are set, notices win over process
    /// output, which wins over pull progress.
    pub fn from_raw(container_id: &str, raw: RawLogEvent) -> Result<Self, LogEventError> {
        let payload = match (raw.aux_message, raw.run_message, raw.pull_message) {
            (Some(aux), _, _) => LogPayload::SystemNotice(aux),
            (None, Some(run), _) => LogPayload::ProcessOutput(run),
            (None, None, Some(pull)) => LogPayload::ImagePull(pull),
            (None, None, None) => {
                return Err(LogEventError::NoPayload(container_id.to_string()));
            }
        };
        Ok(Self {
            container_id: container_id.to_string(),
            timestamp: raw.timestamp,
            payload,
        })
    }

    /// Render this event for a container currently in `state`.
    pub fn format(&self, state: ContainerState) -> String {
        format_line(self.timestamp, &self.container_id, state, &self.payload.message())
    }
}

impl TryFrom<(ContainerId, RawLogEvent)> for LogEvent {
    type Error = LogEventError;

    fn try_from((container_id, raw): (ContainerId, RawLogEvent)) -> Result<Self, Self::Error> {
        LogEvent::from_raw(&container_id, raw)
    }
}

/// A normalized log line, ready for downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub task_id: TaskId,
    pub container_id: ContainerId,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// First eight characters of a container id.
pub fn short_id(container_id: &str) -> &str {
    match container_id.char_indices().nth(8) {
        Some((idx, _)) => &container_id[..idx],
        None => container_id,
    }
}

pub fn format_line(
    timestamp: DateTime<Utc>,
    container_id: &str,
    state: ContainerState,
    message: &str,
) -> String {
    format!(
        "[{}] {} [{}] || {}",
        timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        short_id(container_id),
        state,
        message
    )
}
