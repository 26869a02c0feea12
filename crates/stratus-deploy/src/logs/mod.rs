//! Function log retrieval.
//!
//! Every execution environment writes its own log stream. Reading logs means
//! picking the most relevant streams, fetching each, and merging them into a
//! single sequence ordered by event time:
//!
//! ```text
//! streams ──fetch──▶ partitions (each sorted) ──k-way merge──▶ limit ──render──▶ lines
//! ```
//!
//! Rendering happens lazily as [`LogLines`] is consumed.

pub mod format;

pub use format::{ErrorDetail, LogEntry};

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::DeployResult;
use crate::ledger::decode;
use crate::transport::{DescribeStreamsRequest, GetEventsRequest, LogsClient, RemoteErrorKind};

/// Order in which events are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogDirection {
    /// Latest events first.
    #[default]
    NewestFirst,
    /// Earliest events first.
    OldestFirst,
}

impl LogDirection {
    const fn from_head(self) -> bool {
        matches!(self, Self::OldestFirst)
    }
}

/// A single log event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogEvent {
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    /// Raw message.
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StreamRecord {
    log_stream_name: String,
}

/// Merge partitions that are each ordered in `direction` into one sequence
/// of at most `limit` events.
///
/// Equal timestamps keep partition order, then in-partition order.
#[must_use]
pub fn merge(partitions: Vec<Vec<LogEvent>>, direction: LogDirection, limit: usize) -> Vec<LogEvent> {
    let sort_key = |event: &LogEvent| match direction {
        LogDirection::OldestFirst => event.timestamp,
        LogDirection::NewestFirst => event.timestamp.saturating_neg(),
    };

    let mut partitions: Vec<VecDeque<LogEvent>> =
        partitions.into_iter().map(VecDeque::from).collect();
    let mut heap = BinaryHeap::new();
    for (index, partition) in partitions.iter().enumerate() {
        if let Some(head) = partition.front() {
            heap.push(Reverse((sort_key(head), index)));
        }
    }

    let mut merged = Vec::with_capacity(limit.min(partitions.iter().map(VecDeque::len).sum()));
    while merged.len() < limit {
        let Some(Reverse((_, index))) = heap.pop() else {
            break;
        };
        let Some(partition) = partitions.get_mut(index) else {
            break;
        };
        if let Some(event) = partition.pop_front() {
            merged.push(event);
        }
        if let Some(next) = partition.front() {
            heap.push(Reverse((sort_key(next), index)));
        }
    }
    merged
}

/// Rendered log lines, produced on demand. Consumed once.
#[derive(Debug)]
pub struct LogLines {
    events: std::vec::IntoIter<LogEvent>,
    pending: VecDeque<String>,
}

impl LogLines {
    fn new(events: Vec<LogEvent>) -> Self {
        Self {
            events: events.into_iter(),
            pending: VecDeque::new(),
        }
    }

    /// A sequence with no lines.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Iterator for LogLines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }
            let event = self.events.next()?;
            self.pending
                .extend(LogEntry::classify(&event.message).render());
        }
    }
}

/// Reads a function's log group.
pub struct LogReader {
    logs: Arc<dyn LogsClient>,
    max_streams: u32,
}

impl std::fmt::Debug for LogReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReader")
            .field("max_streams", &self.max_streams)
            .finish_non_exhaustive()
    }
}

impl LogReader {
    /// Read at most `max_streams` streams per request.
    #[must_use]
    pub fn new(logs: Arc<dyn LogsClient>, max_streams: u32) -> Self {
        Self {
            logs,
            max_streams: max_streams.max(1),
        }
    }

    /// The `limit` most relevant events of `group` in `direction`.
    pub async fn events(
        &self,
        group: &str,
        limit: u32,
        direction: LogDirection,
    ) -> DeployResult<Vec<LogEvent>> {
        let listed = self
            .logs
            .describe_log_streams(&DescribeStreamsRequest {
                group: group.to_owned(),
                descending: !direction.from_head(),
                limit: self.max_streams,
            })
            .await;
        let streams = match listed {
            Ok(streams) => streams,
            Err(e) if e.kind == RemoteErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if streams.is_empty() {
            info!(group = %group, "No log streams found for: {group}");
            return Ok(Vec::new());
        }

        let mut partitions = Vec::with_capacity(streams.len());
        for raw in &streams {
            let stream: StreamRecord = decode("log stream", raw)?;
            let mut events = self
                .logs
                .get_log_events(&GetEventsRequest {
                    group: group.to_owned(),
                    stream: stream.log_stream_name.clone(),
                    start_from_head: direction.from_head(),
                    limit,
                })
                .await?
                .iter()
                .map(|raw| decode::<LogEvent>("log event", raw))
                .collect::<DeployResult<Vec<_>>>()?;

            // stable, so equal timestamps keep their fetched order
            match direction {
                LogDirection::OldestFirst => events.sort_by_key(|e| e.timestamp),
                LogDirection::NewestFirst => events.sort_by_key(|e| Reverse(e.timestamp)),
            }
            debug!(stream = %stream.log_stream_name, count = events.len(), "Fetched log events");
            partitions.push(events);
        }

        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(merge(partitions, direction, limit))
    }

    /// Rendered lines for the `limit` most relevant events of `group`.
    pub async fn lines(
        &self,
        group: &str,
        limit: u32,
        direction: LogDirection,
    ) -> DeployResult<LogLines> {
        Ok(LogLines::new(self.events(group, limit, direction).await?))
    }
}
