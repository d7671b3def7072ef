use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Node id conventionally used when a question times out and no explicit
/// `timeout` transition is configured.
pub const END_CALL_NODE: &str = "end_call";

/// The dialog graph: metadata plus nodes indexed by id.
///
/// Validated at load so the engine never discovers a dangling transition or
/// an unanswerable question mid-call.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub metadata: FlowMetadata,
    pub nodes: Vec<FlowNode>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FlowMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Human-readable description, carried into logs.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub audio_file: Option<String>,
    /// Transition label (default, timeout, positive, negative, unknown) to
    /// target node id.
    #[serde(default)]
    pub transitions: HashMap<String, String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Audio,
    Question,
    Transfer,
    Hangup,
    Interrupt,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ApiCall,
    Log,
    Transfer,
}

impl FlowConfig {
    /// Loads and validates a flow configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read flow config {}", path.display()))?;
        Self::from_json(&data)
            .with_context(|| format!("invalid flow config {}", path.display()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let mut config: FlowConfig =
            serde_json::from_slice(data).context("failed to parse flow config")?;
        config.index = config
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.clone(), i))
            .collect();
        config.validate()?;
        Ok(config)
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn start_node(&self) -> &FlowNode {
        self.node("start").expect("validated at load")
    }

    fn validate(&self) -> Result<()> {
        if self.node("start").is_none() {
            bail!("flow has no node with id \"start\"");
        }
        if self.index.len() != self.nodes.len() {
            bail!("flow contains duplicate node ids");
        }

        for node in &self.nodes {
            for (label, target) in &node.transitions {
                if self.node(target).is_none() {
                    bail!(
                        "node {} transition {} targets unknown node {}",
                        node.id,
                        label,
                        target
                    );
                }
            }

            // An audio node transitions immediately and a question node must
            // always be able to leave on a classified answer; without a
            // default either one would strand the call.
            let needs_default =
                matches!(node.node_type, NodeType::Audio | NodeType::Question);
            if needs_default && !node.transitions.contains_key("default") {
                bail!(
                    "{:?} node {} has no default transition",
                    node.node_type,
                    node.id
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_flow(nodes: &str) -> Result<FlowConfig> {
        let json = format!(
            r#"{{"metadata": {{"name": "t", "version": "1", "description": ""}}, "nodes": {}}}"#,
            nodes
        );
        FlowConfig::from_json(json.as_bytes())
    }

    #[test]
    fn accepts_a_valid_flow() {
        let config = minimal_flow(
            r#"[
                {"id": "start", "type": "audio", "audio_file": "hi.wav",
                 "transitions": {"default": "bye"}},
                {"id": "bye", "type": "hangup", "audio_file": "bye.wav"}
            ]"#,
        )
        .unwrap();
        assert_eq!(config.start_node().id, "start");
        assert!(config.node("bye").is_some());
        assert!(config.node("missing").is_none());
    }

    #[test]
    fn rejects_missing_start_node() {
        let err = minimal_flow(r#"[{"id": "a", "type": "hangup"}]"#).unwrap_err();
        assert!(err.to_string().contains("start"));
    }

    #[test]
    fn rejects_dangling_transition() {
        let err = minimal_flow(
            r#"[{"id": "start", "type": "audio", "transitions": {"default": "ghost"}}]"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("ghost"));
    }

    #[test]
    fn rejects_question_without_default() {
        let err = minimal_flow(
            r#"[
                {"id": "start", "type": "question", "audio_file": "ask.wav",
                 "transitions": {"positive": "start"}}
            ]"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("default"));
    }
}
