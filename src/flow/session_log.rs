use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use super::config::FlowNode;

/// Structured per-session event log, one JSON record per line.
///
/// Files are named `{yyyymmdd_hhmmss}_session_{uuid[:8]}.jsonl` under the
/// configured directory and closed when the flow reaches a terminal node.
pub struct SessionLogger {
    file: Mutex<Option<File>>,
}

#[derive(Serialize)]
struct LogRecord<'a> {
    ts: String,
    event: &'a str,
    session_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    classification: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interrupt: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_node_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<HashMap<&'a str, &'a str>>,
}

impl<'a> LogRecord<'a> {
    fn new(event: &'a str, session_id: &'a str) -> Self {
        Self {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            event,
            session_id,
            node_id: None,
            node_type: None,
            node_content: None,
            text: None,
            classification: None,
            interrupt: None,
            next_node_id: None,
            details: None,
        }
    }

    fn with_node(mut self, node: &'a FlowNode) -> Self {
        self.node_id = Some(&node.id);
        self.node_type = Some(format!("{:?}", node.node_type).to_lowercase());
        self.node_content = Some(&node.content);
        self
    }
}

impl SessionLogger {
    pub fn create(
        output_dir: impl AsRef<Path>,
        session_id: &str,
        started: DateTime<Utc>,
    ) -> Result<Self> {
        let output_dir = output_dir.as_ref();
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("failed to create {}", output_dir.display()))?;

        let short_id = &session_id[..session_id.len().min(8)];
        let filename = output_dir.join(format!(
            "{}_session_{}.jsonl",
            started.format("%Y%m%d_%H%M%S"),
            short_id
        ));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filename)
            .with_context(|| format!("failed to open session log {}", filename.display()))?;

        Ok(Self {
            file: Mutex::new(Some(file)),
        })
    }

    pub fn close(&self) {
        let mut file = self.file.lock().expect("session log lock poisoned");
        *file = None;
    }

    fn write(&self, record: LogRecord<'_>) {
        let mut guard = self.file.lock().expect("session log lock poisoned");
        if let Some(file) = guard.as_mut() {
            if let Ok(mut line) = serde_json::to_vec(&record) {
                line.push(b'\n');
                let _ = file.write_all(&line);
            }
        }
    }

    pub fn flow_start(&self, session_id: &str, name: &str, version: &str) {
        let mut record = LogRecord::new("flow_start", session_id);
        record.details = Some(HashMap::from([("name", name), ("version", version)]));
        self.write(record);
    }

    pub fn flow_end(&self, session_id: &str, reason: &str) {
        let mut record = LogRecord::new("flow_end", session_id);
        record.details = Some(HashMap::from([("reason", reason)]));
        self.write(record);
    }

    pub fn node_start(&self, session_id: &str, node: &FlowNode) {
        self.write(LogRecord::new("node_start", session_id).with_node(node));
    }

    pub fn qna(&self, session_id: &str, node: &FlowNode, text: &str, classification: &str) {
        let mut record = LogRecord::new("qna", session_id).with_node(node);
        record.text = Some(text.trim().to_string());
        record.classification = Some(classification);
        self.write(record);
    }

    pub fn interrupt(&self, session_id: &str, node: &FlowNode, text: &str, interrupt: &str) {
        let mut record = LogRecord::new("interrupt", session_id).with_node(node);
        record.text = Some(text.trim().to_string());
        record.interrupt = Some(interrupt);
        self.write(record);
    }

    pub fn transition(&self, session_id: &str, from: &FlowNode, to: &str, reason: &str) {
        let mut record = LogRecord::new("transition", session_id).with_node(from);
        record.next_node_id = Some(to);
        record.details = Some(HashMap::from([("reason", reason)]));
        self.write(record);
    }

    pub fn timeout(&self, session_id: &str, node: &FlowNode) {
        self.write(LogRecord::new("timeout", session_id).with_node(node));
    }

    pub fn api_call(&self, session_id: &str, endpoint: &str, status: &str) {
        let mut record = LogRecord::new("api_call", session_id);
        record.details = Some(HashMap::from([("endpoint", endpoint), ("status", status)]));
        self.write(record);
    }

    pub fn hangup(&self, session_id: &str) {
        self.write(LogRecord::new("hangup", session_id));
    }

    pub fn transfer(&self, session_id: &str, destination: &str) {
        let mut record = LogRecord::new("transfer", session_id);
        record.details = Some(HashMap::from([("destination", destination)]));
        self.write(record);
    }
}
