//! Measurable conditions attached to expectations.
//!
//! Conditions form a tree under each expectation (quantifiers such as
//! `allOf` nest further conditions). The tree is stored as an arena where a
//! node's children always sit at higher indices than the node itself. Every walk over it is a loop, never recursion, so nesting depth
//! is bounded only by memory.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Comparison or quantifier applied by a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Smaller,
    Greater,
    AtMost,
    AtLeast,
    Equal,
    NotEqual,
    InRange,
    /// Every nested condition holds.
    AllOf,
    /// At least one nested condition holds.
    AnyOf,
}

impl Operator {
    /// Classify an operator name. Matching is case-insensitive.
    pub fn parse(name: &str) -> Option<Self> {
        let op = match name.to_ascii_lowercase().as_str() {
            "smaller" | "lessthan" | "lt" => Operator::Smaller,
            "greater" | "greaterthan" | "gt" => Operator::Greater,
            "atmost" | "le" => Operator::AtMost,
            "atleast" | "ge" => Operator::AtLeast,
            "equal" | "equals" | "eq" => Operator::Equal,
            "notequal" | "ne" => Operator::NotEqual,
            "inrange" | "between" => Operator::InRange,
            "allof" => Operator::AllOf,
            "anyof" => Operator::AnyOf,
            _ => return None,
        };
        Some(op)
    }

    /// Canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Smaller => "smaller",
            Operator::Greater => "greater",
            Operator::AtMost => "atMost",
            Operator::AtLeast => "atLeast",
            Operator::Equal => "equal",
            Operator::NotEqual => "notEqual",
            Operator::InRange => "inRange",
            Operator::AllOf => "allOf",
            Operator::AnyOf => "anyOf",
        }
    }

    /// Returns true for operators that combine nested conditions.
    pub fn is_quantifier(&self) -> bool {
        matches!(self, Operator::AllOf | Operator::AnyOf)
    }
}

/// A threshold or observed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Number(f64),
    Text(String),
}

impl Quantity {
    /// Numeric value, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Quantity::Number(n) => Some(*n),
            Quantity::Text(_) => None,
        }
    }

    /// JSON form used by the graph serializer.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Quantity::Number(n) => serde_json::json!(n),
            Quantity::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    fn same_as(&self, other: &Quantity) -> bool {
        match (self, other) {
            (Quantity::Number(a), Quantity::Number(b)) => a == b,
            (Quantity::Text(a), Quantity::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl From<f64> for Quantity {
    fn from(n: f64) -> Self {
        Quantity::Number(n)
    }
}

impl From<&str> for Quantity {
    fn from(s: &str) -> Self {
        Quantity::Text(s.to_string())
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Number(n) => write!(f, "{}", n),
            Quantity::Text(s) => f.write_str(s),
        }
    }
}

/// A predicate over an observable metric, or a quantifier over nested conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Node id from the payload (or a deterministic synthetic id for inline nodes).
    pub id: String,

    /// The comparison or quantifier.
    pub operator: Operator,

    /// Target-property reference, e.g. `p99-latency`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,

    /// Threshold(s). `inRange` uses two.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Quantity>,

    /// Unit of the thresholds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    children: Vec<usize>,
}

impl Condition {
    /// Create a condition with no metric or thresholds.
    pub fn new(id: impl Into<String>, operator: Operator) -> Self {
        Self {
            id: id.into(),
            operator,
            metric: None,
            values: Vec::new(),
            unit: None,
            children: Vec::new(),
        }
    }

    /// Create a metric comparison against a single threshold.
    pub fn compare(
        id: impl Into<String>,
        metric: impl Into<String>,
        operator: Operator,
        value: impl Into<Quantity>,
    ) -> Self {
        Self::new(id, operator).metric(metric).value(value)
    }

    /// Set the metric.
    pub fn metric(mut self, metric: impl Into<String>) -> Self {
        self.metric = Some(metric.into());
        self
    }

    /// Append a threshold.
    pub fn value(mut self, value: impl Into<Quantity>) -> Self {
        self.values.push(value.into());
        self
    }

    /// Set the unit.
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Arena indices of the nested conditions, in source order.
    pub fn child_indices(&self) -> &[usize] {
        &self.children
    }

    /// Returns true if this condition compares a metric rather than combining others.
    pub fn is_leaf(&self) -> bool {
        !self.operator.is_quantifier()
    }

    /// Test an observed sample against this predicate.
    ///
    /// Returns `None` when the comparison is undefined (quantifier, missing
    /// threshold, or a text sample against a numeric bound).
    pub fn test(&self, sample: &Quantity) -> Option<bool> {
        match self.operator {
            Operator::AllOf | Operator::AnyOf => None,
            Operator::Equal => self.values.first().map(|v| v.same_as(sample)),
            Operator::NotEqual => self.values.first().map(|v| !v.same_as(sample)),
            Operator::InRange => {
                let low = self.values.first()?.as_f64()?;
                let high = self.values.get(1)?.as_f64()?;
                let s = sample.as_f64()?;
                Some(low <= s && s <= high)
            }
            op => {
                let threshold = self.values.first()?.as_f64()?;
                let s = sample.as_f64()?;
                Some(match op {
                    Operator::Smaller => s < threshold,
                    Operator::Greater => s > threshold,
                    Operator::AtMost => s <= threshold,
                    _ => s >= threshold,
                })
            }
        }
    }
}

/// The conditions of one expectation, as an arena.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "TreeRepr", into = "TreeRepr")]
pub struct ConditionTree {
    nodes: Vec<Condition>,
    roots: Vec<usize>,
}

#[derive(Serialize, Deserialize)]
struct TreeRepr {
    #[serde(default)]
    nodes: Vec<Condition>,
    #[serde(default)]
    roots: Vec<usize>,
}

impl From<ConditionTree> for TreeRepr {
    fn from(tree: ConditionTree) -> Self {
        Self {
            nodes: tree.nodes,
            roots: tree.roots,
        }
    }
}

impl TryFrom<TreeRepr> for ConditionTree {
    type Error = String;

    fn try_from(repr: TreeRepr) -> std::result::Result<Self, Self::Error> {
        let len = repr.nodes.len();
        let mut parents = vec![0usize; len];
        for &root in &repr.roots {
            if root >= len {
                return Err(format!("root index {} out of range", root));
            }
            parents[root] += 1;
        }
        for (index, node) in repr.nodes.iter().enumerate() {
            for &child in &node.children {
                if child <= index || child >= len {
                    return Err(format!(
                        "condition {} has invalid child index {}",
                        node.id, child
                    ));
                }
                parents[child] += 1;
            }
        }
        if let Some(orphan) = parents.iter().position(|&count| count != 1) {
            return Err(format!(
                "condition {} must have exactly one parent",
                repr.nodes[orphan].id
            ));
        }
        Ok(Self {
            nodes: repr.nodes,
            roots: repr.roots,
        })
    }
}

/// Two trees are equal when their source-order walks match, whatever the
/// arena layout.
impl PartialEq for ConditionTree {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self.iter().zip(other.iter()).all(|((da, a), (db, b))| {
                da == db
                    && a.id == b.id
                    && a.operator == b.operator
                    && a.metric == b.metric
                    && a.values == b.values
                    && a.unit == b.unit
            })
    }
}

impl ConditionTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of conditions at every depth.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get a condition by arena index.
    pub fn get(&self, index: usize) -> Option<&Condition> {
        self.nodes.get(index)
    }

    /// Find a condition by id.
    pub fn find(&self, id: &str) -> Option<&Condition> {
        self.nodes.iter().find(|c| c.id == id)
    }

    /// Arena indices of the top-level conditions, in source order.
    pub fn root_indices(&self) -> &[usize] {
        &self.roots
    }

    /// Top-level conditions, in source order.
    pub fn roots(&self) -> impl Iterator<Item = &Condition> {
        self.roots.iter().filter_map(|&i| self.nodes.get(i))
    }

    /// Nested conditions of the condition at `index`, in source order.
    pub fn children(&self, index: usize) -> impl Iterator<Item = &Condition> {
        self.nodes
            .get(index)
            .map(|c| c.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|&i| self.nodes.get(i))
    }

    /// Add a top-level condition and return its index.
    pub fn push_root(&mut self, condition: Condition) -> usize {
        let index = self.nodes.len();
        self.nodes.push(condition);
        self.roots.push(index);
        index
    }

    /// Nest a condition under `parent` and return its index.
    ///
    /// `parent` must be an index previously returned by this tree; an
    /// out-of-range parent makes the condition top-level instead.
    pub fn push_child(&mut self, parent: usize, condition: Condition) -> usize {
        let index = self.nodes.len();
        self.nodes.push(condition);
        match self.nodes.get_mut(parent) {
            Some(p) if parent < index => p.children.push(index),
            _ => self.roots.push(index),
        }
        index
    }

    /// Depth-first walk in source order, yielding `(depth, condition)`.
    pub fn iter(&self) -> Preorder<'_> {
        Preorder {
            tree: self,
            stack: self.roots.iter().rev().map(|&i| (0, i)).collect(),
        }
    }

    /// Length of the longest root-to-leaf path (0 for an empty tree).
    pub fn depth(&self) -> usize {
        self.iter().map(|(depth, _)| depth + 1).max().unwrap_or(0)
    }

    /// Metrics referenced by leaf conditions, in walk order, without repeats.
    pub fn metrics(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for (_, c) in self.iter() {
            if let Some(metric) = c.metric.as_deref() {
                if !seen.contains(&metric) {
                    seen.push(metric);
                }
            }
        }
        seen
    }

    /// Evaluate the whole tree against metric samples.
    ///
    /// Top-level conditions are combined with `allOf`. Leaves whose metric has
    /// no sample are unknown; quantifiers use three-valued logic, so the
    /// result is `None` only when the samples cannot decide it.
    pub fn evaluate(&self, samples: &HashMap<String, Quantity>) -> Option<bool> {
        let mut results: Vec<Option<bool>> = vec![None; self.nodes.len()];
        // Children sit after their parent, so a reverse sweep is a post-order.
        for index in (0..self.nodes.len()).rev() {
            let node = &self.nodes[index];
            results[index] = if node.operator.is_quantifier() {
                combine(
                    node.operator,
                    node.children.iter().map(|&c| results.get(c).copied().flatten()),
                )
            } else {
                node.metric
                    .as_ref()
                    .and_then(|m| samples.get(m))
                    .and_then(|s| node.test(s))
            };
        }
        combine(
            Operator::AllOf,
            self.roots.iter().map(|&r| results.get(r).copied().flatten()),
        )
    }
}

fn combine(operator: Operator, values: impl Iterator<Item = Option<bool>>) -> Option<bool> {
    let decisive = operator == Operator::AnyOf;
    let mut unknown = false;
    for value in values {
        match value {
            Some(v) if v == decisive => return Some(decisive),
            None => unknown = true,
            _ => {}
        }
    }
    if unknown {
        None
    } else {
        Some(!decisive)
    }
}

/// Iterator returned by [`ConditionTree::iter`].
pub struct Preorder<'a> {
    tree: &'a ConditionTree,
    stack: Vec<(usize, usize)>,
}

impl<'a> Iterator for Preorder<'a> {
    type Item = (usize, &'a Condition);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (depth, index) = self.stack.pop()?;
            if let Some(node) = self.tree.nodes.get(index) {
                self.stack
                    .extend(node.children.iter().rev().map(|&c| (depth + 1, c)));
                return Some((depth, node));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latency_tree() -> ConditionTree {
        let mut tree = ConditionTree::new();
        let all = tree.push_root(Condition::new("co-all", Operator::AllOf));
        tree.push_child(
            all,
            Condition::compare("co-lat", "p99-latency", Operator::Smaller, 20.0).unit("ms"),
        );
        let any = tree.push_child(all, Condition::new("co-any", Operator::AnyOf));
        tree.push_child(
            any,
            Condition::compare("co-bw", "bandwidth", Operator::AtLeast, 100.0),
        );
        tree.push_child(
            any,
            Condition::new("co-cpu", Operator::InRange)
                .metric("cpu")
                .value(0.1)
                .value(0.8),
        );
        tree
    }

    fn samples(pairs: &[(&str, f64)]) -> HashMap<String, Quantity> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity::Number(*v)))
            .collect()
    }

    #[test]
    fn test_preorder_keeps_source_order() {
        let tree = latency_tree();
        let ids: Vec<&str> = tree.iter().map(|(_, c)| c.id.as_str()).collect();
        assert_eq!(ids, vec!["co-all", "co-lat", "co-any", "co-bw", "co-cpu"]);
        assert_eq!(tree.depth(), 3);
        assert_eq!(tree.metrics(), vec!["p99-latency", "bandwidth", "cpu"]);
    }

    #[test]
    fn test_evaluate_three_valued() {
        let tree = latency_tree();
        assert_eq!(tree.evaluate(&samples(&[("p99-latency", 12.0), ("cpu", 0.5)])), Some(true));
        assert_eq!(tree.evaluate(&samples(&[("p99-latency", 35.0)])), Some(false));
        // anyOf undecided without bandwidth or cpu samples
        assert_eq!(tree.evaluate(&samples(&[("p99-latency", 12.0)])), None);
        assert_eq!(
            tree.evaluate(&samples(&[("p99-latency", 12.0), ("bandwidth", 10.0), ("cpu", 0.95)])),
            Some(false)
        );
    }

    #[test]
    fn test_leaf_predicates() {
        let eq = Condition::compare("c", "region", Operator::Equal, "eu-north");
        assert_eq!(eq.test(&Quantity::from("eu-north")), Some(true));
        assert_eq!(eq.test(&Quantity::Number(1.0)), Some(false));

        let le = Condition::compare("c", "m", Operator::AtMost, 5.0);
        assert_eq!(le.test(&Quantity::Number(5.0)), Some(true));
        assert_eq!(le.test(&Quantity::from("five")), None);
    }

    #[test]
    fn test_deep_nesting_without_recursion() {
        let mut tree = ConditionTree::new();
        let mut parent = tree.push_root(Condition::new("c0", Operator::AllOf));
        for i in 1..200_000 {
            parent = tree.push_child(parent, Condition::new(format!("c{}", i), Operator::AllOf));
        }
        assert_eq!(tree.depth(), 200_000);
        let copy = tree.clone();
        assert_eq!(copy, tree);
        assert_eq!(tree.evaluate(&HashMap::new()), Some(true));
    }

    #[test]
    fn test_deserialize_rejects_malformed_arena() {
        let json = serde_json::json!({
            "nodes": [
                {"id": "a", "operator": "allOf", "children": [0]}
            ],
            "roots": [0]
        });
        assert!(serde_json::from_value::<ConditionTree>(json).is_err());

        let tree = latency_tree();
        let back: ConditionTree =
            serde_json::from_value(serde_json::to_value(&tree).unwrap()).unwrap();
        assert_eq!(back, tree);
    }
}
