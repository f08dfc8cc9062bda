//! Identity-preserving object graph captured from an isolate context.
//!
//! JSON cannot express shared or cyclic references, so the isolate emits its
//! context as a flat arena: every distinct object or array becomes one node,
//! and edges refer to nodes by index. The same object reachable from two
//! places is one node with two incoming edges.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Index of a node in a [`Graph`].
pub type NodeId = usize;

/// One node of the arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Node {
    /// A plain object: own enumerable data properties, in insertion order.
    Object {
        /// `(key, child)` pairs.
        entries: Vec<(String, NodeId)>,
    },
    /// An array; holes and dropped slots are `null` leaves.
    Array {
        /// Children by index.
        items: Vec<NodeId>,
    },
    /// A JSON leaf (null, bool, number, string).
    Value {
        /// The leaf value.
        value: Value,
    },
}

/// A flat, identity-preserving object graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    /// The node every traversal starts from.
    pub root: NodeId,
    /// The arena.
    pub nodes: Vec<Node>,
}

impl Graph {
    /// The node at `id`, if it exists.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// The root node.
    pub fn root_node(&self) -> Option<&Node> {
        self.node(self.root)
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Build a tree-shaped graph from a JSON value. No node is shared.
    pub fn from_value(value: &Value) -> Self {
        let mut nodes = Vec::new();
        let root = push_value(&mut nodes, value);
        Self { root, nodes }
    }
}

fn push_value(nodes: &mut Vec<Node>, value: &Value) -> NodeId {
    let id = nodes.len();
    match value {
        Value::Object(map) => {
            nodes.push(Node::Object {
                entries: Vec::with_capacity(map.len()),
            });
            let entries: Vec<(String, NodeId)> = map
                .iter()
                .map(|(k, v)| (k.clone(), push_value(nodes, v)))
                .collect();
            nodes[id] = Node::Object { entries };
        }
        Value::Array(items) => {
            nodes.push(Node::Array {
                items: Vec::with_capacity(items.len()),
            });
            let items: Vec<NodeId> = items.iter().map(|v| push_value(nodes, v)).collect();
            nodes[id] = Node::Array { items };
        }
        leaf => nodes.push(Node::Value {
            value: leaf.clone(),
        }),
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_builds_a_tree() {
        let graph = Graph::from_value(&json!({"a": [1, {"b": null}], "c": "x"}));
        assert_eq!(graph.root, 0);
        match graph.root_node().unwrap() {
            Node::Object { entries } => {
                let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
                assert_eq!(keys, vec!["a", "c"]);
            }
            other => panic!("unexpected root: {other:?}"),
        }
        // root, array, 1, inner object, null, "x"
        assert_eq!(graph.len(), 6);
    }

    #[test]
    fn arena_wire_format_is_tagged() {
        let graph: Graph = serde_json::from_value(json!({
            "root": 0,
            "nodes": [
                {"kind": "object", "entries": [["self", 0], ["n", 1]]},
                {"kind": "value", "value": 3}
            ]
        }))
        .unwrap();
        assert_eq!(
            graph.node(0),
            Some(&Node::Object {
                entries: vec![("self".into(), 0), ("n".into(), 1)]
            })
        );
        assert!(graph.node(7).is_none());
    }
}
