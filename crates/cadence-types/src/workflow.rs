//! Workflow definition types for Cadence.
//!
//! A `WorkflowDefinition` is a directed graph of typed nodes joined by edges.
//! The engine consumes this plain nodes/edges structure; visual editors
//! convert to and from it and own nothing inside the engine. Drafts are
//! edited freely; published versions are immutable snapshots keyed by
//! `(id, version)`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A workflow graph, either an editable draft or a published snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on creation. Stable across versions.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Monotonic per `id`. For a draft this is the version it will publish as.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Draft or published.
    #[serde(default)]
    pub status: DefinitionStatus,
    /// Ordered node list. Order matters only for display.
    pub nodes: Vec<Node>,
    /// Edge list. For condition nodes, edge order is predicate evaluation order.
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Look up a node by ID.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of a node, in declaration order.
    pub fn outgoing<'a, 'b>(
        &'a self,
        node_id: &'b str,
    ) -> impl Iterator<Item = &'a Edge> + use<'a, 'b> {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// All trigger nodes. A valid definition has exactly one.
    pub fn trigger_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.config, NodeConfig::Trigger { .. }))
    }

    /// The single `Next` edge leaving a node, if there is one.
    pub fn next_edge(&self, node_id: &str) -> Option<&Edge> {
        self.outgoing(node_id)
            .find(|e| matches!(e.route, EdgeRoute::Next))
    }

    /// The `OnError` edge leaving a node, if declared.
    pub fn error_edge(&self, node_id: &str) -> Option<&Edge> {
        self.outgoing(node_id)
            .find(|e| matches!(e.route, EdgeRoute::OnError))
    }

    pub fn is_published(&self) -> bool {
        self.status == DefinitionStatus::Published
    }
}

/// Lifecycle status of a definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    #[default]
    Draft,
    Published,
}

/// Pins an instance to one immutable published version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionRef {
    pub id: Uuid,
    pub version: u32,
}

impl std::fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.id, self.version)
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A single typed step in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// User-defined node ID (e.g. "score-check"). Unique within a definition.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Declared node kind. Must agree with the `config` tag.
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Kind-specific configuration.
    pub config: NodeConfig,
}

impl Node {
    /// Display name, falling back to the ID.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// The kind of node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Trigger,
    Condition,
    Action,
    Delay,
    Merge,
    Terminal,
    Loop,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeType::Trigger => "trigger",
            NodeType::Condition => "condition",
            NodeType::Action => "action",
            NodeType::Delay => "delay",
            NodeType::Merge => "merge",
            NodeType::Terminal => "terminal",
            NodeType::Loop => "loop",
        };
        f.write_str(s)
    }
}

/// Node-specific configuration.
///
/// Internally tagged by `type` to match the YAML structure:
/// ```yaml
/// config:
///   type: action
///   action_type: send_email
///   payload: { template: priority }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeConfig {
    /// Entry point. Matches inbound events and binds initial variables.
    Trigger {
        /// Event type this trigger listens for (e.g. "lead_created").
        event_type: String,
        /// Optional JEXL filter evaluated against the event.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<String>,
        /// Variable name -> dot path into the trigger payload.
        /// Empty means every top-level payload field becomes a variable.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        bindings: BTreeMap<String, String>,
    },
    /// Branch point. Predicates live on the outgoing `Branch` edges.
    Condition {},
    /// Side effect dispatched to an external handler.
    Action {
        action_type: String,
        /// Payload template. String leaves of the form `{{ path }}` are resolved.
        #[serde(default)]
        payload: Value,
        /// Overrides the engine-wide retry attempt limit.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_attempts: Option<u32>,
    },
    /// Durable wait. Exactly one of `after_secs` / `until` must be set.
    Delay {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<DateTime<Utc>>,
    },
    /// Passthrough rejoin point.
    Merge {},
    /// Marks the instance completed.
    Terminal {},
    /// Bounded re-entry: follows its `Repeat` edge until the bound or the
    /// predicate stops it, then follows its `Next` edge.
    Loop {
        max_iterations: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repeat_while: Option<Predicate>,
    },
}

/// Normalised delay configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelaySpec {
    After { seconds: u64 },
    Until { at: DateTime<Utc> },
}

impl DelaySpec {
    /// Absolute resume time for a delay entered at `now`.
    pub fn resume_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            DelaySpec::After { seconds } => {
                i64::try_from(seconds)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .and_then(|delay| now.checked_add_signed(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
            DelaySpec::Until { at } => at,
        }
    }
}

impl NodeConfig {
    /// The delay spec of a `Delay` node. `None` for other kinds or when the
    /// config sets neither or both of `after_secs` / `until`.
    pub fn delay_spec(&self) -> Option<DelaySpec> {
        match self {
            NodeConfig::Delay {
                after_secs: Some(seconds),
                until: None,
            } => Some(DelaySpec::After { seconds: *seconds }),
            NodeConfig::Delay {
                after_secs: None,
                until: Some(at),
            } => Some(DelaySpec::Until { at: *at }),
            _ => None,
        }
    }

    /// The node type this config variant belongs to.
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeConfig::Trigger { .. } => NodeType::Trigger,
            NodeConfig::Condition {} => NodeType::Condition,
            NodeConfig::Action { .. } => NodeType::Action,
            NodeConfig::Delay { .. } => NodeType::Delay,
            NodeConfig::Merge {} => NodeType::Merge,
            NodeConfig::Terminal {} => NodeType::Terminal,
            NodeConfig::Loop { .. } => NodeType::Loop,
        }
    }
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// A directed link between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub route: EdgeRoute,
}

/// How an edge participates in routing out of its source node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeRoute {
    /// Unconditional successor (also the action success edge and loop exit).
    #[default]
    Next,
    /// Condition branch, taken when its predicate is the first to hold.
    Branch { key: String, predicate: Predicate },
    /// Condition else-branch, taken when no predicate holds.
    Default { key: String },
    /// Taken when the source node fails.
    OnError,
    /// Loop back edge.
    Repeat,
}

impl EdgeRoute {
    /// Branch key for `Branch` and `Default` routes.
    pub fn branch_key(&self) -> Option<&str> {
        match self {
            EdgeRoute::Branch { key, .. } | EdgeRoute::Default { key } => Some(key),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// A side-effect-free boolean predicate over instance data.
///
/// Field paths are dot paths rooted at `vars`, `subject` or `trigger`
/// (e.g. `vars.score`, `subject.owner.email`, `trigger.items.0`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Compare {
        field: String,
        cmp: Comparator,
        value: Value,
    },
    /// Field value equals one of `values`.
    In { field: String, values: Vec<Value> },
    /// String field contains a substring, or array field contains an element.
    Contains { field: String, value: Value },
    /// Field resolves (even to null).
    Exists { field: String },
    And { all: Vec<Predicate> },
    Or { any: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
    Always,
}

impl Predicate {
    /// Every field path this predicate references, in evaluation order.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Predicate::Compare { field, .. }
            | Predicate::In { field, .. }
            | Predicate::Contains { field, .. }
            | Predicate::Exists { field } => out.push(field),
            Predicate::And { all } => all.iter().for_each(|p| p.collect_fields(out)),
            Predicate::Or { any } => any.iter().for_each(|p| p.collect_fields(out)),
            Predicate::Not { predicate } => predicate.collect_fields(out),
            Predicate::Always => {}
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_yaml_lead_scoring_graph() {
        let yaml = r#"
id: "01938e90-0000-7000-8000-000000000001"
name: lead-scoring
nodes:
  - id: start
    type: trigger
    config:
      type: trigger
      event_type: lead_created
  - id: score
    type: condition
    config: { type: condition }
  - id: wait
    type: delay
    config: { type: delay, after_secs: 172800 }
  - id: done
    type: terminal
    config: { type: terminal }
edges:
  - { id: e1, source: start, target: score }
  - id: e2
    source: score
    target: done
    route:
      kind: branch
      key: hot
      predicate: { op: compare, field: vars.score, cmp: gte, value: 80 }
  - id: e3
    source: score
    target: wait
    route: { kind: default, key: else }
  - { id: e4, source: wait, target: done }
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.version, 1);
        assert_eq!(def.status, DefinitionStatus::Draft);
        assert_eq!(def.nodes.len(), 4);
        assert_eq!(def.edges[0].route, EdgeRoute::Next);
        assert_eq!(def.edges[1].route.branch_key(), Some("hot"));
        assert_eq!(def.trigger_nodes().count(), 1);
        assert_eq!(def.next_edge("wait").map(|e| e.target.as_str()), Some("done"));
        assert!(matches!(
            def.node("wait").unwrap().config,
            NodeConfig::Delay { after_secs: Some(172_800), until: None }
        ));
    }

    #[test]
    fn test_node_config_tag_matches_node_type() {
        let configs = vec![
            NodeConfig::Condition {},
            NodeConfig::Merge {},
            NodeConfig::Terminal {},
            NodeConfig::Loop { max_iterations: 3, repeat_while: None },
        ];
        let types: Vec<NodeType> = configs.iter().map(NodeConfig::node_type).collect();
        assert_eq!(
            types,
            vec![NodeType::Condition, NodeType::Merge, NodeType::Terminal, NodeType::Loop]
        );
    }

    #[test]
    fn test_predicate_fields_in_order() {
        let p = Predicate::And {
            all: vec![
                Predicate::Exists { field: "subject.email".into() },
                Predicate::Not {
                    predicate: Box::new(Predicate::Compare {
                        field: "vars.score".into(),
                        cmp: Comparator::Lt,
                        value: json!(10),
                    }),
                },
                Predicate::Always,
            ],
        };
        assert_eq!(p.fields(), vec!["subject.email", "vars.score"]);
    }

    #[test]
    fn test_predicate_json_shape() {
        let p: Predicate = serde_json::from_value(json!({
            "op": "in",
            "field": "vars.stage",
            "values": ["new", "contacted"]
        }))
        .unwrap();
        assert!(matches!(p, Predicate::In { ref values, .. } if values.len() == 2));
    }

    #[test]
    fn test_delay_spec_requires_exactly_one_field() {
        let both = NodeConfig::Delay {
            after_secs: Some(5),
            until: Some(Utc::now()),
        };
        let neither = NodeConfig::Delay {
            after_secs: None,
            until: None,
        };
        assert!(both.delay_spec().is_none());
        assert!(neither.delay_spec().is_none());

        let now = Utc::now();
        let after = NodeConfig::Delay {
            after_secs: Some(60),
            until: None,
        };
        let spec = after.delay_spec().unwrap();
        assert_eq!(spec.resume_at(now), now + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_huge_delay_saturates_instead_of_overflowing() {
        let now = Utc::now();
        let huge = DelaySpec::After {
            seconds: u64::MAX / 2,
        };
        assert_eq!(huge.resume_at(now), DateTime::<Utc>::MAX_UTC);
        let beyond_range = DelaySpec::After {
            seconds: (i64::MAX / 1000) as u64 + 1,
        };
        assert_eq!(beyond_range.resume_at(now), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_edge_lookups_outlive_node_id() {
        let def: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": uuid::Uuid::now_v7(),
            "name": "edges",
            "nodes": [],
            "edges": [
                {"id": "e1", "source": "a", "target": "b"},
                {"id": "e2", "source": "a", "target": "c", "route": {"kind": "on_error"}}
            ]
        }))
        .unwrap();
        let (next, error) = {
            let node_id = String::from("a");
            (def.next_edge(&node_id), def.error_edge(&node_id))
        };
        assert_eq!(next.map(|e| e.id.as_str()), Some("e1"));
        assert_eq!(error.map(|e| e.target.as_str()), Some("c"));
    }

    #[test]
    fn test_definition_ref_display() {
        let r = DefinitionRef { id: Uuid::nil(), version: 3 };
        assert!(r.to_string().ends_with("@v3"));
    }
}
