//! Result sanitizer: strips infrastructure keys from a captured context and
//! breaks reference cycles so it can cross the process boundary as JSON.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::capabilities::CapabilityRegistry;
use crate::graph::{Graph, Node, NodeId};

/// Sentinel written in place of a reference back onto the current path.
pub const DEFAULT_CIRCULAR_MARKER: &str = "[Circular]";

/// Sentinel written in place of anything nested deeper than [`MAX_SANITIZE_DEPTH`].
pub const MAX_DEPTH_MARKER: &str = "[MaxDepth]";

/// Deepest container nesting a sanitized value may have.
///
/// Stays below serde_json's default recursion limit of 128 with room for the
/// IPC envelope around the reply.
pub const MAX_SANITIZE_DEPTH: usize = 96;

/// Escape-hatch loader key, deleted alongside the capabilities.
pub const REQUIRE_KEY: &str = "require";

/// Caller-supplied cycle replacement: receives the graph, the parent node,
/// the key (array index as a string) and a snapshot of the current path.
pub type ReplacerFn = dyn Fn(&Graph, NodeId, &str, &[NodeId]) -> Value + Send + Sync;

/// What replaces a cyclic reference.
#[derive(Clone)]
pub enum CircularReplacer {
    /// A fixed string marker.
    Marker(String),
    /// A function computing the replacement.
    Custom(Arc<ReplacerFn>),
}

impl Default for CircularReplacer {
    fn default() -> Self {
        Self::Marker(DEFAULT_CIRCULAR_MARKER.to_string())
    }
}

impl fmt::Debug for CircularReplacer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Marker(m) => f.debug_tuple("Marker").field(m).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl CircularReplacer {
    fn replace(&self, graph: &Graph, parent: NodeId, key: &str, path: &[NodeId]) -> Value {
        match self {
            Self::Marker(m) => Value::String(m.clone()),
            Self::Custom(f) => f(graph, parent, key, path),
        }
    }
}

/// The sanitized context would not fit in the output budget.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("result too large: sanitized context exceeds {limit} bytes")]
pub struct OutputTooLarge {
    /// The budget that was exceeded, in estimated JSON bytes.
    pub limit: usize,
}

/// Removes deleted keys from the top-level context and breaks cycles.
///
/// Shared (non-cyclic) substructure is copied at every place it occurs, so a
/// small graph can expand into a very large tree. [`Sanitizer::with_budget`]
/// caps the estimated JSON size of the output and aborts the walk once it is
/// spent.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    deleted: HashSet<String>,
    replacer: CircularReplacer,
    budget: Option<usize>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(CapabilityRegistry::keys().iter().copied())
    }
}

impl Sanitizer {
    /// A sanitizer deleting the given infrastructure keys plus `require`.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut deleted: HashSet<String> = keys.into_iter().map(Into::into).collect();
        deleted.insert(REQUIRE_KEY.to_string());
        Self {
            deleted,
            replacer: CircularReplacer::default(),
            budget: None,
        }
    }

    /// Also delete the given external module binding names.
    pub fn with_modules<S: AsRef<str>>(mut self, modules: &[S]) -> Self {
        self.deleted
            .extend(modules.iter().map(|m| m.as_ref().to_string()));
        self
    }

    /// Use a different cycle replacement.
    pub fn with_replacer(mut self, replacer: CircularReplacer) -> Self {
        self.replacer = replacer;
        self
    }

    /// Fail with [`OutputTooLarge`] once the output's estimated JSON size
    /// passes `max_bytes`.
    pub fn with_budget(mut self, max_bytes: usize) -> Self {
        self.budget = Some(max_bytes);
        self
    }

    /// Whether `key` is removed from the top-level context.
    pub fn deletes(&self, key: &str) -> bool {
        self.deleted.contains(key)
    }

    /// Sanitize a captured context. A non-object root yields an empty mapping.
    pub fn sanitize(&self, graph: &Graph) -> Result<Map<String, Value>, OutputTooLarge> {
        let mut out = Map::new();
        let Some(Node::Object { entries }) = graph.root_node() else {
            return Ok(out);
        };
        let mut walk = Walk {
            sanitizer: self,
            graph,
            path: vec![graph.root],
            spent: 2,
        };
        for (key, child) in entries {
            if self.deletes(key) {
                continue;
            }
            walk.charge(key.len() + 3 + usize::from(!out.is_empty()))?;
            let value = walk.edge(graph.root, key, *child)?;
            out.insert(key.clone(), value);
        }
        Ok(out)
    }

    /// Sanitize a plain JSON context (tree shaped, so only deletion, the
    /// depth guard and the budget can apply).
    pub fn sanitize_value(&self, context: &Value) -> Result<Map<String, Value>, OutputTooLarge> {
        self.sanitize(&Graph::from_value(context))
    }
}

/// One depth-first pass over a graph.
struct Walk<'a> {
    sanitizer: &'a Sanitizer,
    graph: &'a Graph,
    path: Vec<NodeId>,
    spent: usize,
}

impl Walk<'_> {
    fn charge(&mut self, bytes: usize) -> Result<(), OutputTooLarge> {
        self.spent = self.spent.saturating_add(bytes);
        match self.sanitizer.budget {
            Some(limit) if self.spent > limit => Err(OutputTooLarge { limit }),
            _ => Ok(()),
        }
    }

    fn edge(&mut self, parent: NodeId, key: &str, child: NodeId) -> Result<Value, OutputTooLarge> {
        if self.path.contains(&child) {
            let value = self
                .sanitizer
                .replacer
                .replace(self.graph, parent, key, &self.path);
            self.charge(estimated_len(&value))?;
            return Ok(value);
        }
        self.visit(child)
    }

    fn visit(&mut self, id: NodeId) -> Result<Value, OutputTooLarge> {
        let graph = self.graph;
        let Some(node) = graph.node(id) else {
            self.charge(4)?;
            return Ok(Value::Null);
        };
        let container = matches!(node, Node::Object { .. } | Node::Array { .. });
        if container && self.path.len() >= MAX_SANITIZE_DEPTH {
            self.charge(MAX_DEPTH_MARKER.len() + 2)?;
            return Ok(Value::String(MAX_DEPTH_MARKER.to_string()));
        }
        match node {
            Node::Value { value } => {
                self.charge(estimated_len(value))?;
                Ok(value.clone())
            }
            Node::Object { entries } => {
                self.charge(2)?;
                self.path.push(id);
                let mut map = Map::new();
                for (key, child) in entries {
                    self.charge(key.len() + 3 + usize::from(!map.is_empty()))?;
                    let value = self.edge(id, key, *child)?;
                    map.insert(key.clone(), value);
                }
                self.path.pop();
                Ok(Value::Object(map))
            }
            Node::Array { items } => {
                self.charge(2)?;
                self.path.push(id);
                let mut out = Vec::with_capacity(items.len());
                for (i, child) in items.iter().enumerate() {
                    self.charge(usize::from(i > 0))?;
                    out.push(self.edge(id, &i.to_string(), *child)?);
                }
                self.path.pop();
                Ok(Value::Array(out))
            }
        }
    }
}

/// Lower bound on the serialized size of `value`, ignoring escapes.
fn estimated_len(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(true) => 4,
        Value::Bool(false) => 5,
        Value::Number(n) => n.to_string().len(),
        Value::String(s) => s.len() + 2,
        Value::Array(items) => {
            items.iter().map(estimated_len).sum::<usize>() + items.len().saturating_sub(1) + 2
        }
        Value::Object(map) => {
            map.iter()
                .map(|(k, v)| k.len() + 3 + estimated_len(v))
                .sum::<usize>()
                + map.len().saturating_sub(1)
                + 2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leaf(value: Value) -> Node {
        Node::Value { value }
    }

    /// `{ x: { self: <x> }, n: 1 }`
    fn self_cycle() -> Graph {
        Graph {
            root: 0,
            nodes: vec![
                Node::Object {
                    entries: vec![("x".into(), 1), ("n".into(), 2)],
                },
                Node::Object {
                    entries: vec![("self".into(), 1)],
                },
                leaf(json!(1)),
            ],
        }
    }

    #[test]
    fn self_reference_becomes_marker() {
        let out = Sanitizer::default().sanitize(&self_cycle()).unwrap();
        assert_eq!(Value::Object(out), json!({"x": {"self": "[Circular]"}, "n": 1}));
    }

    #[test]
    fn shared_substructure_is_not_marked() {
        // { a: <s>, b: <s> } where s = { v: 1 }
        let graph = Graph {
            root: 0,
            nodes: vec![
                Node::Object {
                    entries: vec![("a".into(), 1), ("b".into(), 1)],
                },
                Node::Object {
                    entries: vec![("v".into(), 2)],
                },
                leaf(json!(1)),
            ],
        };
        let out = Sanitizer::default().sanitize(&graph).unwrap();
        assert_eq!(Value::Object(out), json!({"a": {"v": 1}, "b": {"v": 1}}));
    }

    /// `{ doubled: a }` after `a = [a, a]` has run `levels` times from `a = 1`.
    fn doubling(levels: usize) -> Graph {
        let mut nodes = vec![
            Node::Object {
                entries: vec![("doubled".into(), levels + 1)],
            },
            leaf(json!(1)),
        ];
        for id in 1..=levels {
            nodes.push(Node::Array { items: vec![id, id] });
        }
        Graph { root: 0, nodes }
    }

    #[test]
    fn shared_expansion_stops_at_the_budget() {
        let started = std::time::Instant::now();
        let err = Sanitizer::default()
            .with_budget(1024 * 1024)
            .sanitize(&doubling(40))
            .unwrap_err();
        assert_eq!(err, OutputTooLarge { limit: 1024 * 1024 });
        assert!(err.to_string().contains("too large"));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn output_within_budget_is_unchanged() {
        let unbounded = Sanitizer::default().sanitize(&doubling(6)).unwrap();
        let text = serde_json::to_string(&unbounded).unwrap();
        let bounded = Sanitizer::default()
            .with_budget(text.len())
            .sanitize(&doubling(6))
            .unwrap();
        assert_eq!(bounded, unbounded);
        assert!(Sanitizer::default()
            .with_budget(text.len() / 2)
            .sanitize(&doubling(6))
            .is_err());
    }

    #[test]
    fn array_cycle_uses_index_key() {
        // { list: [1, <list>] }
        let graph = Graph {
            root: 0,
            nodes: vec![
                Node::Object {
                    entries: vec![("list".into(), 1)],
                },
                Node::Array { items: vec![2, 1] },
                leaf(json!(1)),
            ],
        };
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let record = seen.clone();
        let replacer = CircularReplacer::Custom(Arc::new(
            move |_: &Graph, parent: NodeId, key: &str, path: &[NodeId]| {
            record
                .lock()
                .unwrap()
                .push((parent, key.to_string(), path.to_vec()));
                json!("<cycle>")
            },
        ));
        let out = Sanitizer::default().with_replacer(replacer).sanitize(&graph).unwrap();
        assert_eq!(Value::Object(out), json!({"list": [1, "<cycle>"]}));
        assert_eq!(*seen.lock().unwrap(), vec![(1, "1".to_string(), vec![0, 1])]);
    }

    #[test]
    fn root_cycle_through_global_reference() {
        // { me: <root> }
        let graph = Graph {
            root: 0,
            nodes: vec![Node::Object {
                entries: vec![("me".into(), 0)],
            }],
        };
        let out = Sanitizer::default().sanitize(&graph).unwrap();
        assert_eq!(out.get("me"), Some(&json!("[Circular]")));
    }

    #[test]
    fn deletes_capabilities_modules_and_require_at_top_level_only() {
        let context = json!({
            "console": {},
            "setTimeout": null,
            "require": null,
            "_": {"console": "nested stays"},
            "lodash": 1,
            "name": "test1"
        });
        let sanitizer = Sanitizer::default().with_modules(&["lodash"]);
        let out = sanitizer.sanitize_value(&context).unwrap();
        assert_eq!(
            Value::Object(out),
            json!({"_": {"console": "nested stays"}, "name": "test1"})
        );
    }

    #[test]
    fn no_registry_key_survives() {
        let mut context = Map::new();
        for key in CapabilityRegistry::keys() {
            context.insert((*key).to_string(), json!(true));
        }
        context.insert("kept".into(), json!(true));
        let out = Sanitizer::default().sanitize_value(&Value::Object(context)).unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["kept"]);
    }

    #[test]
    fn deep_nesting_is_cut_off() {
        let mut value = json!("bottom");
        for _ in 0..(MAX_SANITIZE_DEPTH + 10) {
            value = json!({ "next": value });
        }
        let out = Sanitizer::default().sanitize_value(&json!({ "deep": value })).unwrap();
        let mut cursor = out.get("deep").unwrap();
        let mut depth = 1;
        while let Some(next) = cursor.get("next") {
            cursor = next;
            depth += 1;
        }
        assert_eq!(cursor, &json!(MAX_DEPTH_MARKER));
        assert!(depth <= MAX_SANITIZE_DEPTH);
        // Survives a JSON round trip under the default recursion limit.
        let text = serde_json::to_string(&out).unwrap();
        assert!(serde_json::from_str::<Value>(&text).is_ok());
    }

    #[test]
    fn sanitizing_twice_changes_nothing() {
        let sanitizer = Sanitizer::default().with_modules(&["lodash"]);
        let once = Value::Object(sanitizer.sanitize(&self_cycle()).unwrap());
        let twice = Value::Object(sanitizer.sanitize_value(&once).unwrap());
        assert_eq!(once, twice);

        let mut deep = json!(0);
        for _ in 0..200 {
            deep = json!([deep]);
        }
        let once = Value::Object(sanitizer.sanitize_value(&json!({ "d": deep })).unwrap());
        let twice = Value::Object(sanitizer.sanitize_value(&once).unwrap());
        assert_eq!(once, twice);
    }

    #[test]
    fn dangling_node_ids_become_null() {
        let graph = Graph {
            root: 0,
            nodes: vec![Node::Object {
                entries: vec![("ghost".into(), 42)],
            }],
        };
        let out = Sanitizer::default().sanitize(&graph).unwrap();
        assert_eq!(out.get("ghost"), Some(&Value::Null));
    }

    #[test]
    fn non_object_root_yields_empty_context() {
        let out = Sanitizer::default().sanitize_value(&json!([1, 2])).unwrap();
        assert!(out.is_empty());
    }
}
