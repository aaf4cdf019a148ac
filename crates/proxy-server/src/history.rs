//! Fetch history hand-off.
//!
//! The proxy only ever writes records. Persisting and reading them back is the
//! sink's business; [`InMemoryHistory`] is the default sink.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Most records `get_history` returns.
pub const HISTORY_LIMIT: usize = 1000;

/// One fetch attempt and how it went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub url: String,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
    pub client_ip: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl HistoryRecord {
    pub fn success(url: &str, client_ip: &str) -> Self {
        Self {
            url: url.to_string(),
            timestamp_ms: now_ms(),
            client_ip: client_ip.to_string(),
            success: true,
            error_message: None,
        }
    }

    pub fn failure(url: &str, client_ip: &str, error: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            timestamp_ms: now_ms(),
            client_ip: client_ip.to_string(),
            success: false,
            error_message: Some(error.into()),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn add_to_history(&self, record: HistoryRecord);

    /// Newest first, at most [`HISTORY_LIMIT`] records.
    async fn get_history(&self) -> Vec<HistoryRecord>;
}

/// Bounded in-process sink. Older records fall off once the limit is hit.
#[derive(Default)]
pub struct InMemoryHistory {
    records: Mutex<VecDeque<HistoryRecord>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl HistorySink for InMemoryHistory {
    async fn add_to_history(&self, record: HistoryRecord) {
        let mut records = self.records.lock();
        records.push_back(record);
        while records.len() > HISTORY_LIMIT {
            records.pop_front();
        }
    }

    async fn get_history(&self) -> Vec<HistoryRecord> {
        let mut out: Vec<HistoryRecord> = self.records.lock().iter().cloned().collect();
        // Stable sort keeps later insertions first among equal timestamps.
        out.reverse();
        out.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        out.truncate(HISTORY_LIMIT);
        out
    }
}
