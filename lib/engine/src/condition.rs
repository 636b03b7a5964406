//! Edge readiness conditions.
//!
//! A condition is a predicate over the results of exactly the nodes listed in
//! an edge's `from` set. Conditions are plain data so they can live in the
//! system definition and be shared between workers.
//!
//! ```yaml
//! condition:
//!   name: and
//!   args:
//!     - name: field_exists
//!       node: fetch
//!       path: [metadata, license]
//!     - name: not
//!       arg:
//!         name: field_equal
//!         node: fetch
//!         path: [status]
//!         value: error
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};

/// Results visible to a condition, keyed by node name.
pub type ResultView<'a> = BTreeMap<&'a str, &'a JsonValue>;

/// One step into a JSON result: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Array index.
    Index(usize),
    /// Object key.
    Key(String),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// A predicate deciding whether an edge fires.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Condition {
    /// Always fires.
    #[default]
    AlwaysTrue,
    /// Never fires.
    AlwaysFalse,
    /// Fires when every nested condition holds.
    And { args: Vec<Condition> },
    /// Fires when at least one nested condition holds.
    Or { args: Vec<Condition> },
    /// Negates the nested condition.
    Not { arg: Box<Condition> },
    /// Fires when `path` exists in the node's result.
    FieldExists {
        node: String,
        #[serde(default)]
        path: Vec<PathSegment>,
    },
    /// Fires when the value at `path` equals `value`.
    FieldEqual {
        node: String,
        #[serde(default)]
        path: Vec<PathSegment>,
        value: JsonValue,
    },
    /// Fires when the array or string at `path` contains `value`.
    FieldContains {
        node: String,
        #[serde(default)]
        path: Vec<PathSegment>,
        value: JsonValue,
    },
}

impl Condition {
    /// Evaluates the condition against the given results.
    ///
    /// A node missing from `results`, or a path missing from a result,
    /// makes the field predicates evaluate to false.
    #[must_use]
    pub fn evaluate(&self, results: &ResultView<'_>) -> bool {
        match self {
            Self::AlwaysTrue => true,
            Self::AlwaysFalse => false,
            Self::And { args } => args.iter().all(|c| c.evaluate(results)),
            Self::Or { args } => args.iter().any(|c| c.evaluate(results)),
            Self::Not { arg } => !arg.evaluate(results),
            Self::FieldExists { node, path } => lookup(results, node, path).is_some(),
            Self::FieldEqual { node, path, value } => {
                lookup(results, node, path).is_some_and(|found| found == value)
            }
            Self::FieldContains { node, path, value } => {
                match lookup(results, node, path) {
                    Some(JsonValue::Array(items)) => items.contains(value),
                    Some(JsonValue::String(haystack)) => value
                        .as_str()
                        .is_some_and(|needle| haystack.contains(needle)),
                    _ => false,
                }
            }
        }
    }

    /// Returns the names of all nodes this condition inspects.
    #[must_use]
    pub fn referenced_nodes(&self) -> BTreeSet<&str> {
        let mut nodes = BTreeSet::new();
        self.collect_nodes(&mut nodes);
        nodes
    }

    fn collect_nodes<'a>(&'a self, nodes: &mut BTreeSet<&'a str>) {
        match self {
            Self::AlwaysTrue | Self::AlwaysFalse => {}
            Self::And { args } | Self::Or { args } => {
                for arg in args {
                    arg.collect_nodes(nodes);
                }
            }
            Self::Not { arg } => arg.collect_nodes(nodes),
            Self::FieldExists { node, .. }
            | Self::FieldEqual { node, .. }
            | Self::FieldContains { node, .. } => {
                nodes.insert(node.as_str());
            }
        }
    }
}

fn lookup<'a>(
    results: &ResultView<'a>,
    node: &str,
    path: &[PathSegment],
) -> Option<&'a JsonValue> {
    let mut current: &'a JsonValue = *results.get(node)?;
    for segment in path {
        current = match segment {
            PathSegment::Key(key) => current.get(key.as_str())?,
            PathSegment::Index(index) => current.get(*index)?,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn view<'a>(name: &'a str, value: &'a JsonValue) -> ResultView<'a> {
        let mut results = ResultView::new();
        results.insert(name, value);
        results
    }

    #[test]
    fn constants() {
        let results = ResultView::new();
        assert!(Condition::AlwaysTrue.evaluate(&results));
        assert!(!Condition::AlwaysFalse.evaluate(&results));
    }

    #[test]
    fn field_equal_follows_path() {
        let result = json!({"meta": {"tags": ["a", "b"]}, "status": "ok"});
        let results = view("fetch", &result);

        let cond = Condition::FieldEqual {
            node: "fetch".to_string(),
            path: vec!["meta".into(), "tags".into(), 1.into()],
            value: json!("b"),
        };
        assert!(cond.evaluate(&results));

        let cond = Condition::FieldEqual {
            node: "fetch".to_string(),
            path: vec!["status".into()],
            value: json!("error"),
        };
        assert!(!cond.evaluate(&results));
    }

    #[test]
    fn missing_node_or_path_is_false() {
        let result = json!({"status": "ok"});
        let results = view("fetch", &result);

        let missing_node = Condition::FieldExists {
            node: "other".to_string(),
            path: Vec::new(),
        };
        assert!(!missing_node.evaluate(&results));

        let missing_path = Condition::FieldExists {
            node: "fetch".to_string(),
            path: vec!["license".into()],
        };
        assert!(!missing_path.evaluate(&results));
    }

    #[test]
    fn field_contains_arrays_and_strings() {
        let result = json!({"tags": ["rust", "flow"], "title": "edge cases"});
        let results = view("fetch", &result);

        let in_array = Condition::FieldContains {
            node: "fetch".to_string(),
            path: vec!["tags".into()],
            value: json!("flow"),
        };
        let in_string = Condition::FieldContains {
            node: "fetch".to_string(),
            path: vec!["title".into()],
            value: json!("edge"),
        };
        assert!(in_array.evaluate(&results));
        assert!(in_string.evaluate(&results));
    }

    #[test]
    fn combinators() {
        let result = json!({"count": 3});
        let results = view("count", &result);
        let three = Condition::FieldEqual {
            node: "count".to_string(),
            path: vec!["count".into()],
            value: json!(3),
        };

        let both = Condition::And {
            args: vec![three.clone(), Condition::AlwaysTrue],
        };
        let either = Condition::Or {
            args: vec![Condition::AlwaysFalse, three.clone()],
        };
        let neither = Condition::Not {
            arg: Box::new(three),
        };

        assert!(both.evaluate(&results));
        assert!(either.evaluate(&results));
        assert!(!neither.evaluate(&results));
    }

    #[test]
    fn referenced_nodes_walks_tree() {
        let cond = Condition::And {
            args: vec![
                Condition::FieldExists {
                    node: "a".to_string(),
                    path: Vec::new(),
                },
                Condition::Not {
                    arg: Box::new(Condition::FieldEqual {
                        node: "b".to_string(),
                        path: Vec::new(),
                        value: json!(null),
                    }),
                },
            ],
        };
        let nodes: Vec<_> = cond.referenced_nodes().into_iter().collect();
        assert_eq!(nodes, vec!["a", "b"]);
    }

    #[test]
    fn deserializes_from_yaml() {
        let yaml = r#"
name: or
args:
  - name: always_false
  - name: field_equal
    node: fetch
    path: [items, 0]
    value: 42
"#;
        let cond: Condition = serde_yaml::from_str(yaml).expect("parse");
        let result = json!({"items": [42]});
        assert!(cond.evaluate(&view("fetch", &result)));
    }
}
