// src/status.rs

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Indicator shown next to a dispatcher node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Clear,
    Error {
        fill: String,
        shape: String,
        text: String,
    },
}

impl NodeStatus {
    /// Red ring with `"<code>: <info>"`, or just `info` when no code is known.
    pub fn error(info: &str, status_code: Option<&str>) -> Self {
        let text = match status_code {
            Some(code) => format!("{code}: {info}"),
            None => info.to_string(),
        };
        NodeStatus::Error {
            fill: "red".to_string(),
            shape: "ring".to_string(),
            text,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, NodeStatus::Error { .. })
    }
}

/// Message emitted on the node's output after a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMessage {
    pub status_code: Option<String>,
    pub payload: String,
    pub at: DateTime<Utc>,
}

impl OutputMessage {
    pub fn new(status_code: Option<String>, payload: String) -> Self {
        Self {
            status_code,
            payload,
            at: Utc::now(),
        }
    }
}

/// `[ERROR] <info> (code: <c>, url: <u>)`
pub fn error_message(info: &str, status_code: Option<&str>, url: Option<&str>) -> String {
    let mut msg = format!("[ERROR] {info}");
    if status_code.is_some() || url.is_some() {
        msg.push_str(" (");
        if let Some(code) = status_code {
            msg.push_str(&format!("code: {code}, "));
        }
        if let Some(url) = url {
            msg.push_str(&format!("url: {url}"));
        }
        msg.push(')');
    }
    msg
}

pub fn success_message(status_code: u16, url: &str) -> String {
    format!(
        "[DONE] message: set destination flow OK\n\
         [DONE]  status: {status_code}\n\
         [DONE]     url: {url}\n"
    )
}

/// Where dispatch outcomes become visible to an operator.
pub trait StatusReporter: Send + Sync {
    fn status(&self, node_id: &str, status: NodeStatus);
    fn output(&self, node_id: &str, message: OutputMessage);
}

/// Reports through the tracing subscriber only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn status(&self, node_id: &str, status: NodeStatus) {
        match status {
            NodeStatus::Clear => info!(node_id, "status cleared"),
            NodeStatus::Error { text, .. } => error!(node_id, "status: {}", text),
        }
    }

    fn output(&self, node_id: &str, message: OutputMessage) {
        info!(node_id, status_code = ?message.status_code, "{}", message.payload);
    }
}

const MAX_OUTPUTS: usize = 32;

/// Keeps the current status and recent outputs per node, and forwards
/// everything to the log as well.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    statuses: DashMap<String, NodeStatus>,
    outputs: DashMap<String, VecDeque<OutputMessage>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, node_id: &str) -> NodeStatus {
        self.statuses
            .get(node_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn outputs(&self, node_id: &str) -> Vec<OutputMessage> {
        self.outputs
            .get(node_id)
            .map(|o| o.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_output(&self, node_id: &str) -> Option<OutputMessage> {
        self.outputs.get(node_id).and_then(|o| o.back().cloned())
    }
}

impl StatusReporter for MemoryReporter {
    fn status(&self, node_id: &str, status: NodeStatus) {
        LogReporter.status(node_id, status.clone());
        self.statuses.insert(node_id.to_string(), status);
    }

    fn output(&self, node_id: &str, message: OutputMessage) {
        LogReporter.output(node_id, message.clone());
        let mut entry = self.outputs.entry(node_id.to_string()).or_default();
        if entry.len() == MAX_OUTPUTS {
            entry.pop_front();
        }
        entry.push_back(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_formats() {
        assert_eq!(error_message("Request Fail", None, None), "[ERROR] Request Fail");
        assert_eq!(
            error_message("Unauthorized", Some("401"), Some("http://h/flows")),
            "[ERROR] Unauthorized (code: 401, url: http://h/flows)"
        );
        assert_eq!(
            error_message("Sheet not found (X)", None, Some("h")),
            "[ERROR] Sheet not found (X) (url: h)"
        );
    }

    #[test]
    fn success_message_names_destination() {
        let msg = success_message(204, "http://dest:1880/flows");
        assert!(msg.contains("[DONE]  status: 204"));
        assert!(msg.contains("[DONE]     url: http://dest:1880/flows"));
    }

    #[test]
    fn error_status_text_includes_code() {
        match NodeStatus::error("Not Found", Some("404")) {
            NodeStatus::Error { fill, shape, text } => {
                assert_eq!(fill, "red");
                assert_eq!(shape, "ring");
                assert_eq!(text, "404: Not Found");
            }
            NodeStatus::Clear => panic!("expected error"),
        }
    }

    #[test]
    fn memory_reporter_tracks_latest_status_and_bounded_outputs() {
        let reporter = MemoryReporter::new();
        assert_eq!(reporter.current("n"), NodeStatus::Clear);

        reporter.status("n", NodeStatus::error("boom", None));
        assert!(reporter.current("n").is_error());
        reporter.status("n", NodeStatus::Clear);
        assert_eq!(reporter.current("n"), NodeStatus::Clear);

        for i in 0..(MAX_OUTPUTS + 3) {
            reporter.output("n", OutputMessage::new(None, format!("m{i}")));
        }
        let outputs = reporter.outputs("n");
        assert_eq!(outputs.len(), MAX_OUTPUTS);
        assert_eq!(outputs[0].payload, "m3");
        assert_eq!(
            reporter.last_output("n").unwrap().payload,
            format!("m{}", MAX_OUTPUTS + 2)
        );
    }
}
