use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Graph payload in the element-list shape the graph viewer consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GraphData {
    #[serde(default)]
    pub elements: Vec<GraphElement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "group", content = "data")]
pub enum GraphElement {
    #[serde(rename = "nodes")]
    Node(GraphNode),
    #[serde(rename = "edges")]
    Edge(GraphEdge),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl GraphData {
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.elements.iter().filter_map(|element| match element {
            GraphElement::Node(node) => Some(node),
            GraphElement::Edge(_) => None,
        })
    }

    pub fn edges(&self) -> impl Iterator<Item = &GraphEdge> {
        self.elements.iter().filter_map(|element| match element {
            GraphElement::Edge(edge) => Some(edge),
            GraphElement::Node(_) => None,
        })
    }

    /// Element ids must be unique and non-empty; edges must join known nodes.
    pub fn validate(&self) -> Result<(), ClientError> {
        let mut seen = HashSet::new();
        for element in &self.elements {
            let id = match element {
                GraphElement::Node(node) => &node.id,
                GraphElement::Edge(edge) => &edge.id,
            };
            if id.trim().is_empty() {
                return Err(ClientError::Decode("graph element with empty id".to_string()));
            }
            if !seen.insert(id.as_str()) {
                return Err(ClientError::Decode(format!("duplicate graph element id: {id}")));
            }
        }
        let node_ids: HashSet<&str> = self.nodes().map(|node| node.id.as_str()).collect();
        for edge in self.edges() {
            for endpoint in [&edge.source, &edge.target] {
                if !node_ids.contains(endpoint.as_str()) {
                    return Err(ClientError::Decode(format!(
                        "edge {} references unknown node {endpoint}",
                        edge.id
                    )));
                }
            }
        }
        Ok(())
    }
}
