//! Routine graph model.
//!
//! A routine is a map of [`RoutineNode`]s connected by `next` / `failure`
//! transitions, entered at `root_node_id`.  The JSON shape matches what the
//! routine editor stores:
//!
//! ```json
//! {
//!   "root_node_id": "start",
//!   "nodes": {
//!     "start": { "id": "start", "type": "Start", "transitions": { "next": "greet" } },
//!     "greet": { "id": "greet", "type": "TTS", "params": { "text": "hi" },
//!                "transitions": { "next": "end" } },
//!     "end":   { "id": "end", "type": "End" }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BotError;

/// Kind of work a node performs.
///
/// Unknown names are preserved in [`NodeType::Other`] so that a graph with a
/// node the engine cannot execute still loads, and fails only if the node is
/// actually reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    StandUp,
    SitDown,
    Head,
    Move,
    Tts,
    Sleep,
    Start,
    End,
    Other(String),
}

impl NodeType {
    pub fn as_str(&self) -> &str {
        match self {
            NodeType::StandUp => "Standup",
            NodeType::SitDown => "Sitdown",
            NodeType::Head => "Head",
            NodeType::Move => "Move",
            NodeType::Tts => "TTS",
            NodeType::Sleep => "Sleep",
            NodeType::Start => "Start",
            NodeType::End => "End",
            NodeType::Other(name) => name,
        }
    }

    /// Nodes that issue a device call.
    pub fn is_action(&self) -> bool {
        matches!(
            self,
            NodeType::StandUp | NodeType::SitDown | NodeType::Head | NodeType::Move | NodeType::Tts
        )
    }
}

impl From<String> for NodeType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "Standup" | "StandUp" => NodeType::StandUp,
            "Sitdown" | "SitDown" => NodeType::SitDown,
            "Head" => NodeType::Head,
            "Move" => NodeType::Move,
            "TTS" | "Tts" => NodeType::Tts,
            "Sleep" => NodeType::Sleep,
            "Start" => NodeType::Start,
            "End" => NodeType::End,
            _ => NodeType::Other(name),
        }
    }
}

impl From<NodeType> for String {
    fn from(node_type: NodeType) -> Self {
        node_type.as_str().to_string()
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outgoing edges of a node.  Empty strings (as saved by the editor) count
/// as absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Transitions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Transitions {
    pub fn next(&self) -> Option<&str> {
        self.next.as_deref().filter(|id| !id.is_empty())
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref().filter(|id| !id.is_empty())
    }
}

/// Retry behaviour for a single step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_interval_ms: u64,
    pub maximum_interval_ms: u64,
    /// Total attempts including the first one; `0` means unlimited.
    pub maximum_attempts: u32,
    pub backoff_coefficient: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: 5_000,
            maximum_interval_ms: 60_000,
            maximum_attempts: 1,
            backoff_coefficient: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A single attempt.
    pub fn no_retry() -> Self {
        Self {
            maximum_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether attempt number `attempt` (1-based) may run.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.maximum_attempts == 0 || attempt <= self.maximum_attempts
    }

    /// Back-off to wait before attempt number `attempt` (1-based).
    ///
    /// The first retry waits `initial_interval`, each following one is
    /// multiplied by `backoff_coefficient`, capped at `maximum_interval`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.initial_interval_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(30) as i32;
        let coefficient = self.backoff_coefficient.max(1.0);
        let cap = self.maximum_interval_ms.max(self.initial_interval_ms) as f64;
        let millis = (self.initial_interval_ms as f64 * coefficient.powi(exponent)).min(cap);
        Duration::from_millis(millis as u64)
    }
}

/// One step of a routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoutineNode {
    pub id: String,
    #[serde(rename = "type")]
    #[schemars(with = "String")]
    pub node_type: NodeType,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub transitions: Transitions,
    /// Overrides the engine's default [`RetryPolicy`] for this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl RoutineNode {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            params: Map::new(),
            transitions: Transitions::default(),
            retry: None,
        }
    }

    /// Builder: set a parameter.
    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Builder: set the success transition.
    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.transitions.next = Some(next.into());
        self
    }

    /// Builder: set the failure transition.
    pub fn on_failure(mut self, failure: impl Into<String>) -> Self {
        self.transitions.failure = Some(failure.into());
        self
    }

    /// Builder: attach a retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Read a required numeric parameter.
    pub fn number_param(&self, key: &str) -> Result<f64, BotError> {
        self.params.get(key).and_then(Value::as_f64).ok_or_else(|| {
            BotError::InvalidInput(format!(
                "node {} ({}) requires numeric parameter '{key}'",
                self.id, self.node_type
            ))
        })
    }

    /// Read a required string parameter.
    pub fn string_param(&self, key: &str) -> Result<&str, BotError> {
        self.params.get(key).and_then(Value::as_str).ok_or_else(|| {
            BotError::InvalidInput(format!(
                "node {} ({}) requires string parameter '{key}'",
                self.id, self.node_type
            ))
        })
    }
}

/// A complete routine definition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct RoutineGraph {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(alias = "rootNodeId")]
    pub root_node_id: String,
    pub nodes: HashMap<String, RoutineNode>,
}

impl RoutineGraph {
    pub fn new(root_node_id: impl Into<String>) -> Self {
        Self {
            workflow_id: None,
            root_node_id: root_node_id.into(),
            nodes: HashMap::new(),
        }
    }

    /// Builder: add a node, keyed by its id.
    pub fn with_node(mut self, node: RoutineNode) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    /// Parse a routine from its JSON representation.
    pub fn from_json(raw: &str) -> Result<Self, BotError> {
        serde_json::from_str(raw)
            .map_err(|e| BotError::InvalidInput(format!("malformed routine graph: {e}")))
    }

    pub fn node(&self, id: &str) -> Option<&RoutineNode> {
        self.nodes.get(id)
    }

    /// List `(node_id, target_id)` pairs whose target does not exist.
    ///
    /// The result is sorted so that reports are stable.
    pub fn dangling_transitions(&self) -> Vec<(String, String)> {
        let mut dangling: Vec<(String, String)> = self
            .nodes
            .values()
            .flat_map(|node| {
                [node.transitions.next(), node.transitions.failure()]
                    .into_iter()
                    .flatten()
                    .filter(|target| !self.nodes.contains_key(*target))
                    .map(|target| (node.id.clone(), target.to_string()))
            })
            .collect();
        dangling.sort();
        dangling
    }
}

/// JSON Schema describing [`RoutineGraph`], for editors and API validation.
pub fn routine_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(RoutineGraph)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "workflow_id": "wf-1",
        "root_node_id": "start",
        "nodes": {
            "start": { "id": "start", "type": "Start", "params": {}, "transitions": { "next": "up" } },
            "up":    { "id": "up", "type": "Standup", "transitions": { "next": "walk", "failure": "" } },
            "walk":  { "id": "walk", "type": "Move",
                       "params": { "x": 1.0, "y": 2.5, "orientation": 90 },
                       "transitions": { "next": "end", "failure": "sit" },
                       "retry": { "maximum_attempts": 3, "initial_interval_ms": 10 } },
            "sit":   { "id": "sit", "type": "SitDown", "transitions": { "next": "end" } },
            "end":   { "id": "end", "type": "End" }
        }
    }"#;

    #[test]
    fn parses_editor_json() {
        let graph = RoutineGraph::from_json(SAMPLE).unwrap();
        assert_eq!(graph.root_node_id, "start");
        assert_eq!(graph.workflow_id.as_deref(), Some("wf-1"));
        assert_eq!(graph.node("up").unwrap().node_type, NodeType::StandUp);
        assert_eq!(graph.node("sit").unwrap().node_type, NodeType::SitDown);

        let walk = graph.node("walk").unwrap();
        assert_eq!(walk.number_param("y").unwrap(), 2.5);
        assert_eq!(walk.number_param("orientation").unwrap(), 90.0);
        let retry = walk.retry.as_ref().unwrap();
        assert_eq!(retry.maximum_attempts, 3);
        // unspecified fields fall back to defaults
        assert_eq!(retry.maximum_interval_ms, 60_000);
    }

    #[test]
    fn camel_case_root_is_accepted() {
        let graph = RoutineGraph::from_json(
            r#"{ "rootNodeId": "a", "nodes": { "a": { "id": "a", "type": "End" } } }"#,
        )
        .unwrap();
        assert_eq!(graph.root_node_id, "a");
    }

    #[test]
    fn empty_transition_counts_as_absent() {
        let graph = RoutineGraph::from_json(SAMPLE).unwrap();
        let up = graph.node("up").unwrap();
        assert_eq!(up.transitions.next(), Some("walk"));
        assert_eq!(up.transitions.failure(), None);
    }

    #[test]
    fn unknown_node_type_is_preserved() {
        let node: RoutineNode =
            serde_json::from_str(r#"{ "id": "d", "type": "Dance" }"#).unwrap();
        assert_eq!(node.node_type, NodeType::Other("Dance".into()));
        assert!(!node.node_type.is_action());
        let back = serde_json::to_value(&node).unwrap();
        assert_eq!(back["type"], "Dance");
    }

    #[test]
    fn missing_numeric_param_is_invalid_input() {
        let node = RoutineNode::new("m", NodeType::Move).with_param("x", "one");
        let err = node.number_param("x").unwrap_err();
        assert!(matches!(err, BotError::InvalidInput(msg) if msg.contains("'x'")));
    }

    #[test]
    fn dangling_transitions_are_reported() {
        let graph = RoutineGraph::new("a")
            .with_node(RoutineNode::new("a", NodeType::Start).then("b"))
            .with_node(RoutineNode::new("b", NodeType::Tts).then("c").on_failure("z"))
            .with_node(RoutineNode::new("c", NodeType::End));
        assert_eq!(graph.dangling_transitions(), vec![("b".to_string(), "z".to_string())]);
    }

    #[test]
    fn retry_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_interval_ms: 100,
            maximum_interval_ms: 350,
            maximum_attempts: 5,
            backoff_coefficient: 2.0,
        };
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(200));
        assert_eq!(policy.delay_before(4), Duration::from_millis(350));
        assert!(policy.allows_attempt(5));
        assert!(!policy.allows_attempt(6));
    }

    #[test]
    fn zero_attempts_means_unlimited() {
        let policy = RetryPolicy {
            maximum_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(policy.allows_attempt(1_000));
    }

    #[test]
    fn schema_mentions_root_node() {
        let schema = serde_json::to_string(&routine_schema()).unwrap();
        assert!(schema.contains("root_node_id"));
        assert!(schema.contains("transitions"));
    }
}
