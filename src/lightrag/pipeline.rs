//! Per-collection processing pipeline status.

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::constants::HISTORY_MESSAGES_LIMIT;

#[derive(Debug, Clone, Default)]
pub struct PipelineStatus {
    pub autoscanned: bool,
    pub busy: bool,
    pub job_name: String,
    pub job_start: Option<DateTime<Local>>,
    pub docs: usize,
    pub batchs: usize,
    pub cur_batch: usize,
    pub request_pending: bool,
    pub latest_message: String,
    pub history_messages: Vec<String>,
}

/// Serializable view of [`PipelineStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub autoscanned: bool,
    pub busy: bool,
    pub job_name: String,
    pub job_start: Option<String>,
    pub docs: usize,
    pub batchs: usize,
    pub cur_batch: usize,
    pub request_pending: bool,
    pub latest_message: String,
    pub history_messages: Vec<String>,
    pub update_status: Map<String, Value>,
}

impl PipelineStatus {
    pub fn new() -> Self {
        Self {
            job_name: "Default Job".to_string(),
            ..Default::default()
        }
    }

    pub fn begin_job(&mut self, name: &str, docs: usize, batchs: usize) {
        self.busy = true;
        self.job_name = name.to_string();
        self.job_start = Some(Local::now());
        self.docs = docs;
        self.batchs = batchs;
        self.cur_batch = 0;
        self.request_pending = false;
        self.latest_message.clear();
        self.history_messages.clear();
    }

    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!(job = %self.job_name, "{message}");
        self.latest_message = message.clone();
        self.history_messages.push(message);
    }

    pub fn finish(&mut self, message: impl Into<String>) {
        self.busy = false;
        self.log(message);
    }

    pub fn snapshot(&self, namespaces: &[&str]) -> PipelineSnapshot {
        let total = self.history_messages.len();
        let history_messages = if total > HISTORY_MESSAGES_LIMIT {
            let truncated = total - HISTORY_MESSAGES_LIMIT;
            let mut kept = Vec::with_capacity(HISTORY_MESSAGES_LIMIT + 1);
            kept.push(format!(
                "[Truncated history messages: {truncated}/{total}]"
            ));
            kept.extend_from_slice(&self.history_messages[truncated..]);
            kept
        } else {
            self.history_messages.clone()
        };

        // Single process: no namespace ever waits for a cross-worker reload.
        let update_status = namespaces
            .iter()
            .map(|ns| (ns.to_string(), Value::Array(vec![Value::Bool(false)])))
            .collect();

        PipelineSnapshot {
            autoscanned: self.autoscanned,
            busy: self.busy,
            job_name: self.job_name.clone(),
            job_start: self.job_start.map(|t| t.to_rfc3339()),
            docs: self.docs,
            batchs: self.batchs,
            cur_batch: self.cur_batch,
            request_pending: self.request_pending,
            latest_message: self.latest_message.clone(),
            history_messages,
            update_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_job_resets_history() {
        let mut status = PipelineStatus::new();
        status.log("old");
        status.request_pending = true;
        status.begin_job("Default Job", 3, 3);
        assert!(status.busy);
        assert!(status.history_messages.is_empty());
        assert!(!status.request_pending);
        assert!(status.job_start.is_some());

        status.log("Processing d-id: doc-1");
        assert_eq!(status.latest_message, "Processing d-id: doc-1");
        status.finish("Document processing pipeline completed");
        assert!(!status.busy);
        assert_eq!(status.history_messages.len(), 2);
    }

    #[test]
    fn snapshot_truncates_long_history() {
        let mut status = PipelineStatus::new();
        for i in 0..1005 {
            status.history_messages.push(format!("m{i}"));
        }
        let snap = status.snapshot(&["full_docs"]);
        assert_eq!(snap.history_messages.len(), 1001);
        assert_eq!(snap.history_messages[0], "[Truncated history messages: 5/1005]");
        assert_eq!(snap.history_messages[1], "m5");
        assert_eq!(snap.update_status["full_docs"], serde_json::json!([false]));
    }
}
