//! Graph payload parser.
//!
//! Payloads are JSON graph documents: an `@graph` array of nodes, each with an
//! `@id`, an `@type` and properties that point at other nodes by id (or embed
//! them inline). Exactly one node is the Intent; its `hasExpectation` list
//! names the expectations, and `hasCondition` lists hang condition trees off
//! expectations and quantifier conditions.
//!
//! Type and property names are matched on their local name, so
//! `icm:hasExpectation`, `hasExpectation` and a full IRI ending in
//! `/hasExpectation` are the same property.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::condition::{Condition, ConditionTree, Operator, Quantity};
use crate::error::ParseError;
use crate::intent::{Expectation, ExpectationKind, Intent, ReportingConfig};
use crate::types::{IntentId, OwnerId, Priority, TargetId};

type Node = Map<String, Value>;
type ParseResult<T> = std::result::Result<T, ParseError>;

/// Text after the last `:`, `#` or `/`.
pub fn local_name(name: &str) -> &str {
    name.rsplit(|c: char| matches!(c, ':' | '#' | '/'))
        .next()
        .unwrap_or(name)
}

/// Parse a graph payload into an [`Intent`].
///
/// Parsing is deterministic: the same payload always yields structurally
/// equal intents. Graph nodes that are not part of the intent are kept
/// verbatim in [`Intent::fragments`].
pub fn parse(raw: &str) -> ParseResult<Intent> {
    let document: Value =
        serde_json::from_str(raw).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    let mut graph = Graph::index(graph_entries(&document)?)?;

    let intent_index = graph.intent_node()?;
    graph.consumed[intent_index] = true;
    let node = graph.nodes[intent_index];

    let id = node
        .get("@id")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingIntentId)?;

    let owner = optional_text(node, id, "owner")?
        .map(OwnerId::new)
        .unwrap_or_default();
    let priority = match optional_text(node, id, "priority")? {
        Some(p) => p.parse::<Priority>().map_err(|message| invalid(id, "priority", message))?,
        None => Priority::default(),
    };
    let description = optional_text(node, id, "description")?.map(str::to_string);
    let created_at = match optional_text(node, id, "created")? {
        Some(ts) => Some(
            DateTime::parse_from_rfc3339(ts)
                .map_err(|e| invalid(id, "created", e.to_string()))?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    let refs = prop(node, "hasExpectation").map(list).unwrap_or_default();
    if refs.is_empty() {
        return Err(ParseError::NoExpectations(id.to_string()));
    }

    let mut seen_conditions = HashSet::new();
    let mut expectations = Vec::with_capacity(refs.len());
    for (n, reference) in refs.into_iter().enumerate() {
        let resolved = graph.resolve(reference, id, "hasExpectation", || {
            format!("{}/e{}", id, n)
        })?;
        if let Some(index) = resolved.index {
            if graph.consumed[index] {
                return Err(ParseError::SharedExpectation(resolved.id));
            }
            graph.consumed[index] = true;
        }
        expectations.push(graph.expectation(resolved, &mut seen_conditions)?);
    }

    Ok(Intent {
        id: IntentId::new(id),
        owner,
        priority,
        description,
        expectations,
        fragments: graph.unconsumed(),
        created_at,
        raw: raw.to_string(),
    })
}

/// Serialize an intent to the graph payload format [`parse`] reads.
pub fn to_graph(intent: &Intent) -> Value {
    let mut graph = Vec::new();

    let mut node = Map::new();
    node.insert("@id".into(), json!(intent.id.as_str()));
    node.insert("@type".into(), json!("Intent"));
    node.insert("owner".into(), json!(intent.owner.as_str()));
    node.insert("priority".into(), json!(intent.priority.as_str()));
    if let Some(description) = &intent.description {
        node.insert("description".into(), json!(description));
    }
    if let Some(created) = intent.created_at {
        node.insert("created".into(), json!(created.to_rfc3339()));
    }
    let ids: Vec<Value> = intent.expectations.iter().map(|e| json!(e.id)).collect();
    node.insert("hasExpectation".into(), Value::Array(ids));
    graph.push(Value::Object(node));

    for expectation in &intent.expectations {
        let mut node = Map::new();
        node.insert("@id".into(), json!(expectation.id));
        node.insert("@type".into(), json!(expectation.kind.type_name()));
        if let Some(target) = &expectation.target {
            node.insert("target".into(), json!(target.as_str()));
        }
        if let Some(description) = &expectation.description {
            node.insert("description".into(), json!(description));
        }
        if let Some(reporting) = &expectation.reporting {
            if let Some(interval) = reporting.interval_secs {
                node.insert("reportingInterval".into(), json!(interval));
            }
            if !reporting.events.is_empty() {
                node.insert("reportingEvents".into(), json!(reporting.events));
            }
        }
        let tree = &expectation.conditions;
        if !tree.is_empty() {
            let roots: Vec<Value> = tree.roots().map(|c| json!(c.id)).collect();
            node.insert("hasCondition".into(), Value::Array(roots));
        }
        graph.push(Value::Object(node));

        for (_, condition) in tree.iter() {
            graph.push(condition_node(tree, condition));
        }
    }

    graph.extend(intent.fragments.iter().cloned());
    json!({ "@graph": graph })
}

fn condition_node(tree: &ConditionTree, condition: &Condition) -> Value {
    let mut node = Map::new();
    node.insert("@id".into(), json!(condition.id));
    node.insert("@type".into(), json!("Condition"));
    node.insert("operator".into(), json!(condition.operator.as_str()));
    if let Some(metric) = &condition.metric {
        node.insert("metric".into(), json!(metric));
    }
    if !condition.values.is_empty() {
        let values: Vec<Value> = condition.values.iter().map(Quantity::to_json).collect();
        node.insert("values".into(), Value::Array(values));
    }
    if let Some(unit) = &condition.unit {
        node.insert("unit".into(), json!(unit));
    }
    let children: Vec<Value> = condition
        .child_indices()
        .iter()
        .filter_map(|&i| tree.get(i))
        .map(|c| json!(c.id))
        .collect();
    if !children.is_empty() {
        node.insert("hasCondition".into(), Value::Array(children));
    }
    Value::Object(node)
}

fn graph_entries(document: &Value) -> ParseResult<&[Value]> {
    match document {
        Value::Array(entries) => Ok(entries),
        Value::Object(map) => match map.get("@graph") {
            Some(Value::Array(entries)) => Ok(entries),
            Some(_) => Err(ParseError::MissingGraph),
            None if map.contains_key("@type") => Ok(std::slice::from_ref(document)),
            None => Err(ParseError::MissingGraph),
        },
        _ => Err(ParseError::MissingGraph),
    }
}

/// A node reached through a reference, with its effective id.
struct Resolved<'a> {
    id: String,
    node: &'a Node,
    /// Position in the graph, or `None` for inline nodes.
    index: Option<usize>,
}

struct Graph<'a> {
    nodes: Vec<&'a Node>,
    by_id: HashMap<&'a str, usize>,
    consumed: Vec<bool>,
}

impl<'a> Graph<'a> {
    fn index(entries: &'a [Value]) -> ParseResult<Self> {
        let mut nodes = Vec::with_capacity(entries.len());
        let mut by_id = HashMap::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let node = entry
                .as_object()
                .ok_or(ParseError::MalformedNode { index })?;
            if let Some(id) = node.get("@id").and_then(Value::as_str) {
                if by_id.insert(id, index).is_some() {
                    return Err(ParseError::DuplicateNode(id.to_string()));
                }
            }
            nodes.push(node);
        }
        let consumed = vec![false; nodes.len()];
        Ok(Self {
            nodes,
            by_id,
            consumed,
        })
    }

    fn intent_node(&self) -> ParseResult<usize> {
        let candidates: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| types(node).iter().any(|t| local_name(t) == "Intent"))
            .map(|(i, _)| i)
            .collect();
        match candidates.as_slice() {
            [] => Err(ParseError::MissingIntent),
            [single] => Ok(*single),
            many => Err(ParseError::MultipleIntents(many.len())),
        }
    }

    fn lookup(&self, id: &str) -> ParseResult<Resolved<'a>> {
        let index = *self
            .by_id
            .get(id)
            .ok_or_else(|| ParseError::DanglingReference(id.to_string()))?;
        Ok(Resolved {
            id: id.to_string(),
            node: self.nodes[index],
            index: Some(index),
        })
    }

    fn resolve(
        &self,
        reference: &'a Value,
        owner: &str,
        property: &str,
        synthetic_id: impl FnOnce() -> String,
    ) -> ParseResult<Resolved<'a>> {
        match reference {
            Value::String(id) => self.lookup(id),
            Value::Object(node) => match node.get("@id").and_then(Value::as_str) {
                Some(id) if node.len() == 1 => self.lookup(id),
                Some(id) => Ok(Resolved {
                    id: id.to_string(),
                    node,
                    index: None,
                }),
                None => Ok(Resolved {
                    id: synthetic_id(),
                    node,
                    index: None,
                }),
            },
            _ => Err(invalid(owner, property, "expected a node id or an inline node")),
        }
    }

    fn expectation(
        &mut self,
        resolved: Resolved<'a>,
        seen_conditions: &mut HashSet<String>,
    ) -> ParseResult<Expectation> {
        let Resolved { id, node, .. } = resolved;
        let declared = types(node);
        let kind = declared
            .iter()
            .map(|t| ExpectationKind::classify(t))
            .find(|k| !matches!(k, ExpectationKind::Unknown(_)))
            .unwrap_or_else(|| {
                ExpectationKind::Unknown(declared.first().copied().unwrap_or_default().to_string())
            });

        let target = optional_reference(node, &id, "target")?.map(TargetId::new);
        if target.is_none() && kind != ExpectationKind::Reporting {
            return Err(ParseError::MissingTarget {
                expectation: id,
                kind: kind.label().to_string(),
            });
        }

        let reporting = if kind == ExpectationKind::Reporting {
            Some(reporting_config(node, &id)?)
        } else {
            None
        };

        let description = optional_text(node, &id, "description")?.map(str::to_string);
        let conditions = self.conditions(&id, prop(node, "hasCondition"), seen_conditions)?;

        Ok(Expectation {
            id,
            kind,
            target,
            description,
            conditions,
            reporting,
        })
    }

    /// Build an expectation's condition tree with an explicit stack.
    fn conditions(
        &mut self,
        expectation_id: &str,
        roots: Option<&'a Value>,
        seen: &mut HashSet<String>,
    ) -> ParseResult<ConditionTree> {
        let mut tree = ConditionTree::new();
        let mut stack: Vec<(Option<usize>, Resolved<'a>)> = Vec::new();
        self.push_references(&mut stack, None, expectation_id, roots)?;

        while let Some((parent, resolved)) = stack.pop() {
            if !seen.insert(resolved.id.clone()) {
                return Err(ParseError::SharedCondition(resolved.id));
            }
            if let Some(index) = resolved.index {
                if self.consumed[index] {
                    return Err(ParseError::SharedCondition(resolved.id));
                }
                self.consumed[index] = true;
            }

            let condition = condition(&resolved)?;
            let index = match parent {
                Some(p) => tree.push_child(p, condition),
                None => tree.push_root(condition),
            };
            self.push_references(
                &mut stack,
                Some(index),
                &resolved.id,
                prop(resolved.node, "hasCondition"),
            )?;
        }
        Ok(tree)
    }

    /// Push references in reverse so they pop in source order.
    fn push_references(
        &self,
        stack: &mut Vec<(Option<usize>, Resolved<'a>)>,
        parent: Option<usize>,
        owner: &str,
        references: Option<&'a Value>,
    ) -> ParseResult<()> {
        let Some(references) = references else {
            return Ok(());
        };
        let mut resolved = Vec::new();
        for (n, reference) in list(references).into_iter().enumerate() {
            let r = self.resolve(reference, owner, "hasCondition", || {
                format!("{}/c{}", owner, n)
            })?;
            resolved.push((parent, r));
        }
        stack.extend(resolved.into_iter().rev());
        Ok(())
    }

    fn unconsumed(&self) -> Vec<Value> {
        self.nodes
            .iter()
            .zip(&self.consumed)
            .filter(|(_, consumed)| !**consumed)
            .map(|(node, _)| Value::Object((*node).clone()))
            .collect()
    }
}

fn condition(resolved: &Resolved<'_>) -> ParseResult<Condition> {
    let id = resolved.id.as_str();
    let node = resolved.node;

    let name = optional_text(node, id, "operator")?
        .ok_or_else(|| ParseError::MissingOperator(id.to_string()))?;
    let operator = Operator::parse(local_name(name)).ok_or_else(|| ParseError::UnknownOperator {
        condition: id.to_string(),
        operator: name.to_string(),
    })?;

    let mut condition = Condition::new(id, operator);
    condition.metric = optional_reference(node, id, "metric")?.map(str::to_string);
    condition.unit = optional_text(node, id, "unit")?.map(str::to_string);

    let (property, values) = match prop(node, "values") {
        Some(v) => ("values", Some(v)),
        None => ("value", prop(node, "value")),
    };
    if let Some(values) = values {
        for value in list(values) {
            condition
                .values
                .push(quantity(value).ok_or_else(|| invalid(id, property, "expected a number or string"))?);
        }
    }
    Ok(condition)
}

fn reporting_config(node: &Node, id: &str) -> ParseResult<ReportingConfig> {
    let interval_secs = match prop(node, "reportingInterval") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_u64()
                .ok_or_else(|| invalid(id, "reportingInterval", "expected whole seconds"))?,
        ),
    };
    let mut events = Vec::new();
    if let Some(v) = prop(node, "reportingEvents") {
        for event in list(v) {
            let text = literal(event)
                .ok_or_else(|| invalid(id, "reportingEvents", "expected strings"))?;
            events.push(text.to_string());
        }
    }
    Ok(ReportingConfig {
        interval_secs,
        events,
    })
}

fn quantity(value: &Value) -> Option<Quantity> {
    match value {
        Value::Number(n) => n.as_f64().map(Quantity::Number),
        Value::String(s) => Some(Quantity::Text(s.clone())),
        Value::Object(map) => map.get("@value").and_then(quantity),
        _ => None,
    }
}

/// Property lookup by exact key, then by local name.
fn prop<'a>(node: &'a Node, name: &str) -> Option<&'a Value> {
    node.get(name).or_else(|| {
        node.iter()
            .find(|(key, _)| !key.starts_with('@') && local_name(key) == name)
            .map(|(_, value)| value)
    })
}

fn types(node: &Node) -> Vec<&str> {
    match node.get("@type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn list(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        single => vec![single],
    }
}

/// A plain string or a `{"@value": …}` literal.
fn literal(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        Value::Object(map) => map.get("@value").and_then(Value::as_str),
        _ => None,
    }
}

fn optional_text<'a>(node: &'a Node, id: &str, property: &str) -> ParseResult<Option<&'a str>> {
    match prop(node, property) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => literal(v)
            .map(Some)
            .ok_or_else(|| invalid(id, property, "expected a string")),
    }
}

/// A string, a literal, or a `{"@id": …}` reference.
fn optional_reference<'a>(
    node: &'a Node,
    id: &str,
    property: &str,
) -> ParseResult<Option<&'a str>> {
    match prop(node, property) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) if map.contains_key("@id") => map
            .get("@id")
            .and_then(Value::as_str)
            .map(Some)
            .ok_or_else(|| invalid(id, property, "@id must be a string")),
        Some(v) => literal(v)
            .map(Some)
            .ok_or_else(|| invalid(id, property, "expected a string or reference")),
    }
}

fn invalid(node: &str, property: &str, message: impl Into<String>) -> ParseError {
    ParseError::InvalidProperty {
        node: node.to_string(),
        property: property.to_string(),
        message: message.into(),
    }
}
