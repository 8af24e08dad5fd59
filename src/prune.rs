// src/prune.rs

use std::collections::HashSet;

use rand::{RngCore, rng};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::closure::subflow_closure;
use crate::graph::{ConfigGraph, GraphNode, NodeKind};

pub const RELAY_CONFIG_TYPE: &str = "websocket-client";
pub const RELAY_IN_TYPE: &str = "websocket in";
pub const RELAY_OUT_TYPE: &str = "websocket out";
pub const ADAPTER_TYPE: &str = "function";
pub const ADAPTER_NAME: &str = "reset-ws-sess";

/// Vertical offset of the adapter node below the delegate it replaces.
const ADAPTER_Y_OFFSET: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PruneError {
    #[error("Sheet not found ({sheet})")]
    NotFound { sheet: String },
    #[error("{}", delegate_count_message(.inputs, .outputs))]
    DelegateCount { inputs: usize, outputs: usize },
    #[error("Exception while sheet pruning: {0}")]
    Internal(String),
}

fn delegate_count_message(inputs: &usize, outputs: &usize) -> String {
    if *inputs == 0 && *outputs == 0 {
        "Neither delegate-in node nor delegate-out node exists.".to_string()
    } else {
        format!("Number of delegate nodes error. (#dlg-in: {inputs}, #dlg-out: {outputs})")
    }
}

/// How a sheet is cut out of the source graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PruneMode {
    /// Swap the delegates for relay endpoints and keep global configuration nodes.
    #[default]
    Relay,
    /// Tab, its nodes and referenced subflows as they are.
    Plain,
}

/// Where the destination runtime should connect back to: the relay listening
/// on the source runtime under the dispatcher's own id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub secure: bool,
    pub host: String,
    pub owner_id: String,
}

impl RelayEndpoint {
    pub fn new(secure: bool, host: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            secure,
            host: host.into(),
            owner_id: owner_id.into(),
        }
    }

    pub fn url(&self) -> String {
        let protocol = if self.secure { "wss" } else { "ws" };
        format!("{}://{}/{}", protocol, self.host, self.owner_id)
    }
}

/// Field rename applied by the adapter node to every message coming out of
/// the relay, so the relay's own session bookkeeping does not leak into the
/// dispatched sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PassThroughRename {
    pub from: String,
    pub to: String,
}

impl Default for PassThroughRename {
    fn default() -> Self {
        Self {
            from: "_session".to_string(),
            to: "session_in".to_string(),
        }
    }
}

impl PassThroughRename {
    /// Function-node body implementing the rename. Keys are emitted as
    /// quoted string literals.
    pub fn function_body(&self) -> String {
        let from = Value::String(self.from.clone()).to_string();
        let to = Value::String(self.to.clone()).to_string();
        format!(
            "if(msg[{from}]) {{\n    msg[{to}] = msg[{from}];\n    delete msg[{from}];\n}}\nreturn msg;"
        )
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.from.is_empty() || self.to.is_empty() {
            return Err("rename fields must not be empty".to_string());
        }
        if self.from == self.to {
            return Err(format!("rename `{}` onto itself", self.from));
        }
        Ok(())
    }
}

/// Source of ids for synthesized nodes.
pub trait NodeIdSource {
    fn next_id(&mut self) -> String;
}

/// Node-RED style ids (`8 hex digits`.`fraction`).
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomNodeIds;

impl NodeIdSource for RandomNodeIds {
    fn next_id(&mut self) -> String {
        let mut r = rng();
        format!("{:08x}.{:05x}", r.next_u32(), r.next_u32() & 0xf_ffff)
    }
}

/// The extracted sheet, ready to be posted to a destination runtime.
/// Plain extractions carry no relay configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PrunedSheet {
    pub tab_id: String,
    pub relay_config_id: Option<String>,
    pub nodes: Vec<GraphNode>,
}

impl PrunedSheet {
    /// Re-read a sheet saved by an earlier fetch: exactly one tab and at most
    /// one relay configuration node are expected.
    pub fn from_graph(graph: ConfigGraph) -> Result<Self, PruneError> {
        let mut tabs = graph
            .iter()
            .filter(|n| n.kind() == NodeKind::Tab)
            .map(|n| n.id.clone())
            .collect::<Vec<_>>();
        let mut relays = graph
            .iter()
            .filter(|n| n.node_type == RELAY_CONFIG_TYPE)
            .map(|n| n.id.clone())
            .collect::<Vec<_>>();
        if tabs.len() != 1 {
            return Err(PruneError::Internal(format!(
                "expected one tab, found {}",
                tabs.len()
            )));
        }
        if relays.len() > 1 {
            return Err(PruneError::Internal(format!(
                "expected at most one relay configuration, found {}",
                relays.len()
            )));
        }
        let tab_id = tabs.remove(0);
        let relay_config_id = relays.pop();
        Ok(Self {
            tab_id,
            relay_config_id,
            nodes: graph.into_nodes(),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.nodes)
    }

    pub fn relay_config(&self) -> Option<&GraphNode> {
        let id = self.relay_config_id.as_deref()?;
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn into_graph(self) -> ConfigGraph {
        ConfigGraph::new(self.nodes)
    }
}

pub struct SheetPruner<I = RandomNodeIds> {
    rename: PassThroughRename,
    ids: I,
}

impl SheetPruner<RandomNodeIds> {
    pub fn new(rename: PassThroughRename) -> Self {
        Self {
            rename,
            ids: RandomNodeIds,
        }
    }
}

impl Default for SheetPruner<RandomNodeIds> {
    fn default() -> Self {
        Self::new(PassThroughRename::default())
    }
}

impl<I: NodeIdSource> SheetPruner<I> {
    pub fn with_ids(rename: PassThroughRename, ids: I) -> Self {
        Self { rename, ids }
    }

    /// Extract the tab labelled `sheet`, every subflow it references and all
    /// global configuration nodes, swapping the two delegate nodes for relay
    /// endpoints. `graph` itself is left untouched.
    pub fn prune(
        &mut self,
        graph: &ConfigGraph,
        sheet: &str,
        relay: &RelayEndpoint,
    ) -> Result<PrunedSheet, PruneError> {
        let tab_id = find_tab_id(graph, sheet)?;
        let closure = subflow_closure(graph, [tab_id.as_str()]);
        debug!(sheet, tab_id = %tab_id, subflows = closure.len(), "pruning sheet");

        let relay_config_id = self.ids.next_id();
        let mut relay_config_emitted = false;
        let mut inputs = 0usize;
        let mut outputs = 0usize;
        let mut nodes = Vec::new();

        for node in graph.iter() {
            if !is_member(node, &tab_id, &closure) {
                if node.is_global_config() {
                    nodes.push(node.clone());
                }
                continue;
            }

            match node.kind() {
                NodeKind::DelegateIn | NodeKind::DelegateOut => {
                    if !relay_config_emitted {
                        nodes.push(relay_config_node(&relay_config_id, relay));
                        relay_config_emitted = true;
                    }
                    if node.kind() == NodeKind::DelegateIn {
                        inputs += 1;
                        let adapter_id = self.ids.next_id();
                        nodes.push(self.adapter_node(&adapter_id, node)?);
                        nodes.push(relay_in_node(node, &relay_config_id, &adapter_id));
                    } else {
                        outputs += 1;
                        nodes.push(relay_out_node(node, &relay_config_id));
                    }
                }
                _ => nodes.push(node.clone()),
            }
        }

        if inputs != 1 || outputs != 1 {
            warn!(sheet, inputs, outputs, "unexpected number of delegate nodes");
            return Err(PruneError::DelegateCount { inputs, outputs });
        }

        Ok(PrunedSheet {
            tab_id,
            relay_config_id: Some(relay_config_id),
            nodes,
        })
    }

    /// Prune according to `mode`; the relay endpoint is ignored for plain
    /// extraction.
    pub fn prune_with_mode(
        &mut self,
        graph: &ConfigGraph,
        sheet: &str,
        relay: &RelayEndpoint,
        mode: PruneMode,
    ) -> Result<PrunedSheet, PruneError> {
        match mode {
            PruneMode::Relay => self.prune(graph, sheet, relay),
            PruneMode::Plain => extract_sheet(graph, sheet),
        }
    }

    fn adapter_node(&self, id: &str, delegate: &GraphNode) -> Result<GraphNode, PruneError> {
        let mut adapter = GraphNode::new(id, ADAPTER_TYPE)
            .with_attr("name", json!(ADAPTER_NAME))
            .with_attr("func", json!(self.rename.function_body()))
            .with_attr("outputs", json!(1))
            .with_attr("noerr", json!(0));

        if let Some(x) = delegate.attr("x") {
            adapter = adapter.with_attr("x", x.clone());
        }
        if let Some(y) = delegate.attr("y") {
            let y = y.as_f64().ok_or_else(|| {
                PruneError::Internal(format!(
                    "delegate `{}` has a non-numeric position: {}",
                    delegate.id, y
                ))
            })?;
            adapter = adapter.with_attr("y", number(y + ADAPTER_Y_OFFSET));
        }
        if let Some(z) = &delegate.z {
            adapter.z = Some(z.clone());
        }
        if let Some(wires) = delegate.attr("wires") {
            adapter = adapter.with_attr("wires", wires.clone());
        }
        Ok(adapter)
    }
}

/// Copy the tab labelled `sheet`, its nodes and every subflow it references.
/// Delegates are left alone and no configuration nodes are added.
pub fn extract_sheet(graph: &ConfigGraph, sheet: &str) -> Result<PrunedSheet, PruneError> {
    let tab_id = find_tab_id(graph, sheet)?;
    let closure = subflow_closure(graph, [tab_id.as_str()]);
    debug!(sheet, tab_id = %tab_id, subflows = closure.len(), "extracting sheet");

    let nodes = graph
        .iter()
        .filter(|n| is_member(n, &tab_id, &closure))
        .cloned()
        .collect();
    Ok(PrunedSheet {
        tab_id,
        relay_config_id: None,
        nodes,
    })
}

fn find_tab_id(graph: &ConfigGraph, sheet: &str) -> Result<String, PruneError> {
    graph
        .find_tab(sheet)
        .map(|tab| tab.id.clone())
        .ok_or_else(|| PruneError::NotFound {
            sheet: sheet.to_string(),
        })
}

fn is_member(node: &GraphNode, tab_id: &str, closure: &HashSet<String>) -> bool {
    node.id == tab_id
        || node.container() == Some(tab_id)
        || node.container().is_some_and(|z| closure.contains(z))
        || (node.kind() == NodeKind::Subflow && closure.contains(&node.id))
}

/// Prune with the default rename rule and random ids.
pub fn prune(
    graph: &ConfigGraph,
    sheet: &str,
    relay: &RelayEndpoint,
) -> Result<PrunedSheet, PruneError> {
    SheetPruner::default().prune(graph, sheet, relay)
}

fn relay_config_node(id: &str, relay: &RelayEndpoint) -> GraphNode {
    GraphNode::new(id, RELAY_CONFIG_TYPE)
        .with_attr("path", json!(relay.url()))
        .with_attr("wholemsg", json!("false"))
}

fn relay_in_node(delegate: &GraphNode, relay_config_id: &str, adapter_id: &str) -> GraphNode {
    let mut node = delegate.clone();
    node.node_type = RELAY_IN_TYPE.to_string();
    node.attrs.insert("server".into(), json!(""));
    node.attrs.insert("client".into(), json!(relay_config_id));
    node.attrs.insert("wires".into(), json!([[adapter_id]]));
    node
}

fn relay_out_node(delegate: &GraphNode, relay_config_id: &str) -> GraphNode {
    let mut node = delegate.clone();
    node.node_type = RELAY_OUT_TYPE.to_string();
    node.attrs.insert("server".into(), json!(""));
    node.attrs.insert("client".into(), json!(relay_config_id));
    node
}

/// Keep integral coordinates integral in the emitted JSON.
fn number(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
        json!(v as i64)
    } else {
        json!(v)
    }
}
