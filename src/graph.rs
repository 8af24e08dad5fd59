// src/graph.rs

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::prune::PruneError;

pub const TAB_TYPE: &str = "tab";
pub const SUBFLOW_TYPE: &str = "subflow";
pub const SUBFLOW_INSTANCE_PREFIX: &str = "subflow:";
pub const DELEGATE_IN_TYPE: &str = "flow-dlg-in";
pub const DELEGATE_OUT_TYPE: &str = "flow-dlg-out";

/// One entry of a runtime's `/flows` document.
///
/// Only `id`, `type` and `z` are typed; everything else (wires, labels,
/// positions, server references) is carried through untouched in `attrs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<String>,
    #[serde(flatten)]
    pub attrs: Map<String, Value>,
}

/// What a node is, as far as sheet extraction cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind<'a> {
    Tab,
    Subflow,
    /// Instance of the subflow definition with the given id.
    SubflowInstance(&'a str),
    DelegateIn,
    DelegateOut,
    Ordinary,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            z: None,
            attrs: Map::new(),
        }
    }

    pub fn with_z(mut self, z: impl Into<String>) -> Self {
        self.z = Some(z.into());
        self
    }

    pub fn with_attr(mut self, key: &str, value: Value) -> Self {
        self.attrs.insert(key.to_string(), value);
        self
    }

    pub fn kind(&self) -> NodeKind<'_> {
        match self.node_type.as_str() {
            TAB_TYPE => NodeKind::Tab,
            SUBFLOW_TYPE => NodeKind::Subflow,
            DELEGATE_IN_TYPE => NodeKind::DelegateIn,
            DELEGATE_OUT_TYPE => NodeKind::DelegateOut,
            other => match other.strip_prefix(SUBFLOW_INSTANCE_PREFIX) {
                Some(def_id) => NodeKind::SubflowInstance(def_id),
                None => NodeKind::Ordinary,
            },
        }
    }

    /// Parent container id. An empty `z` counts as no container.
    pub fn container(&self) -> Option<&str> {
        self.z.as_deref().filter(|z| !z.is_empty())
    }

    pub fn label(&self) -> Option<&str> {
        self.attrs.get("label").and_then(Value::as_str)
    }

    pub fn attr(&self, key: &str) -> Option<&Value> {
        self.attrs.get(key)
    }

    pub fn is_delegate(&self) -> bool {
        matches!(self.kind(), NodeKind::DelegateIn | NodeKind::DelegateOut)
    }

    /// A node that is neither a tab nor a subflow and has no truthy
    /// `x`, `y` or `z`: usable from any container.
    pub fn is_global_config(&self) -> bool {
        if matches!(self.kind(), NodeKind::Tab | NodeKind::Subflow) {
            return false;
        }
        let placed = self.container().is_some()
            || self.attr("x").is_some_and(is_truthy)
            || self.attr("y").is_some_and(is_truthy);
        !placed
    }
}

/// JavaScript-style truthiness, which is how the runtime decides whether a
/// node carries canvas coordinates.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// A runtime's complete configuration, in the order the runtime returned it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigGraph {
    nodes: Vec<GraphNode>,
}

impl ConfigGraph {
    pub fn new(nodes: Vec<GraphNode>) -> Self {
        Self { nodes }
    }

    /// Parse a `/flows` response body.
    pub fn from_json(body: &str) -> Result<Self, PruneError> {
        serde_json::from_str(body)
            .map_err(|e| PruneError::Internal(format!("malformed flow document: {e}")))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.nodes)
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn iter(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// First tab (in document order) carrying `label`. Duplicate labels are
    /// not disambiguated.
    pub fn find_tab(&self, label: &str) -> Option<&GraphNode> {
        self.nodes
            .iter()
            .find(|n| n.kind() == NodeKind::Tab && n.label() == Some(label))
    }

    pub fn into_nodes(self) -> Vec<GraphNode> {
        self.nodes
    }
}

impl From<Vec<GraphNode>> for ConfigGraph {
    fn from(nodes: Vec<GraphNode>) -> Self {
        Self::new(nodes)
    }
}
