//! Structural validation of workflow definitions before publish.
//!
//! `GraphValidator::validate` collects every problem it finds instead of
//! stopping at the first, so authors can fix a draft in one pass. A
//! definition that passes is safe to execute: every node is reachable from
//! the single trigger, every node's outgoing edges have the shape its kind
//! requires, and every cycle passes through a bounded loop node.

use std::collections::{HashMap, HashSet, VecDeque};

use cadence_types::workflow::{EdgeRoute, NodeConfig, NodeType, Predicate, WorkflowDefinition};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use super::context::{split_path, template_paths};

/// Longest relative delay a node may declare (100 years).
pub const MAX_DELAY_SECS: u64 = 100 * 365 * 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

/// Category of a validation problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    EmptyName,
    NoNodes,
    DuplicateNodeId,
    DuplicateEdgeId,
    NodeTypeMismatch,
    TriggerCount,
    TriggerHasIncoming,
    DanglingEdge,
    InvalidRoute,
    EdgeShape,
    BranchKey,
    Unreachable,
    Cycle,
    InvalidConfig,
    UnknownActionType,
    InvalidFieldPath,
    LoopBound,
}

/// One structural problem, located by node and/or edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: ValidationCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Non-empty list of validation issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn has(&self, code: ValidationCode) -> bool {
        self.issues.iter().any(|i| i.code == code)
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} issue(s): ", self.issues.len())?;
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            f.write_str(&issue.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationReport {}

#[derive(Default)]
struct Issues(Vec<ValidationIssue>);

impl Issues {
    fn node(&mut self, code: ValidationCode, node_id: &str, message: String) {
        self.0.push(ValidationIssue {
            code,
            node_id: Some(node_id.to_string()),
            edge_id: None,
            message,
        });
    }

    fn edge(&mut self, code: ValidationCode, edge_id: &str, message: String) {
        self.0.push(ValidationIssue {
            code,
            node_id: None,
            edge_id: Some(edge_id.to_string()),
            message,
        });
    }

    fn graph(&mut self, code: ValidationCode, message: String) {
        self.0.push(ValidationIssue {
            code,
            node_id: None,
            edge_id: None,
            message,
        });
    }
}

// ---------------------------------------------------------------------------
// GraphValidator
// ---------------------------------------------------------------------------

/// Publish-time structural validator.
#[derive(Debug, Clone)]
pub struct GraphValidator {
    max_loop_iterations: u32,
    /// When set, action nodes must use one of these types.
    action_types: Option<HashSet<String>>,
}

impl Default for GraphValidator {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl GraphValidator {
    pub fn new(max_loop_iterations: u32) -> Self {
        Self {
            max_loop_iterations,
            action_types: None,
        }
    }

    /// Require action nodes to reference one of `types`.
    pub fn with_action_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.action_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Validate `def`, returning every issue found.
    pub fn validate(&self, def: &WorkflowDefinition) -> Result<(), ValidationReport> {
        let mut issues = Issues::default();

        if def.name.trim().is_empty() {
            issues.graph(ValidationCode::EmptyName, "workflow name must not be empty".into());
        }
        if def.nodes.is_empty() {
            issues.graph(ValidationCode::NoNodes, "workflow must have at least one node".into());
        }

        let mut node_ids = HashSet::new();
        for node in &def.nodes {
            if !node_ids.insert(node.id.as_str()) {
                issues.node(
                    ValidationCode::DuplicateNodeId,
                    &node.id,
                    format!("duplicate node ID '{}'", node.id),
                );
            }
            if node.node_type != node.config.node_type() {
                issues.node(
                    ValidationCode::NodeTypeMismatch,
                    &node.id,
                    format!(
                        "node '{}' is declared as {} but configured as {}",
                        node.id,
                        node.node_type,
                        node.config.node_type()
                    ),
                );
            }
        }

        let mut edge_ids = HashSet::new();
        for edge in &def.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                issues.edge(
                    ValidationCode::DuplicateEdgeId,
                    &edge.id,
                    format!("duplicate edge ID '{}'", edge.id),
                );
            }
            for (end, id) in [("source", &edge.source), ("target", &edge.target)] {
                if !node_ids.contains(id.as_str()) {
                    issues.edge(
                        ValidationCode::DanglingEdge,
                        &edge.id,
                        format!("edge '{}' {end} '{id}' is not a node", edge.id),
                    );
                }
            }
        }

        let triggers: Vec<&str> = def.trigger_nodes().map(|n| n.id.as_str()).collect();
        if triggers.len() != 1 {
            issues.graph(
                ValidationCode::TriggerCount,
                format!(
                    "workflow must have exactly one trigger node, found {}",
                    triggers.len()
                ),
            );
        }
        for edge in def.edges.iter().filter(|e| triggers.contains(&e.target.as_str())) {
            issues.edge(
                ValidationCode::TriggerHasIncoming,
                &edge.id,
                format!("edge '{}' targets trigger node '{}'", edge.id, edge.target),
            );
        }

        for node in &def.nodes {
            self.check_node_config(node, &mut issues);
            check_edge_shape(def, node.id.as_str(), node.config.node_type(), &mut issues);
        }

        if let [start] = triggers.as_slice() {
            check_reachability(def, start, &mut issues);
        }
        check_cycles(def, &mut issues);

        if issues.0.is_empty() {
            Ok(())
        } else {
            Err(ValidationReport { issues: issues.0 })
        }
    }

    fn check_node_config(&self, node: &cadence_types::workflow::Node, issues: &mut Issues) {
        let id = node.id.as_str();
        match &node.config {
            NodeConfig::Trigger {
                event_type,
                bindings,
                ..
            } => {
                if event_type.trim().is_empty() {
                    issues.node(
                        ValidationCode::InvalidConfig,
                        id,
                        format!("trigger '{id}' must declare an event_type"),
                    );
                }
                for (var, path) in bindings {
                    if var.trim().is_empty() || path.split('.').any(str::is_empty) {
                        issues.node(
                            ValidationCode::InvalidConfig,
                            id,
                            format!("trigger '{id}' has an invalid binding '{var}' -> '{path}'"),
                        );
                    }
                }
            }
            NodeConfig::Action {
                action_type,
                payload,
                max_attempts,
            } => {
                if action_type.trim().is_empty() {
                    issues.node(
                        ValidationCode::InvalidConfig,
                        id,
                        format!("action '{id}' must declare an action_type"),
                    );
                } else if let Some(known) = &self.action_types {
                    if !known.contains(action_type) {
                        issues.node(
                            ValidationCode::UnknownActionType,
                            id,
                            format!("action '{id}' uses unregistered action type '{action_type}'"),
                        );
                    }
                }
                if *max_attempts == Some(0) {
                    issues.node(
                        ValidationCode::InvalidConfig,
                        id,
                        format!("action '{id}' max_attempts must be >= 1"),
                    );
                }
                for path in template_paths(payload) {
                    check_path(id, &path, issues);
                }
            }
            NodeConfig::Delay { .. } => match node.config.delay_spec() {
                None => issues.node(
                    ValidationCode::InvalidConfig,
                    id,
                    format!("delay '{id}' must set exactly one of after_secs or until"),
                ),
                Some(cadence_types::workflow::DelaySpec::After { seconds: 0 }) => issues.node(
                    ValidationCode::InvalidConfig,
                    id,
                    format!("delay '{id}' after_secs must be > 0"),
                ),
                Some(cadence_types::workflow::DelaySpec::After { seconds })
                    if seconds > MAX_DELAY_SECS =>
                {
                    issues.node(
                        ValidationCode::InvalidConfig,
                        id,
                        format!("delay '{id}' after_secs must be at most {MAX_DELAY_SECS}"),
                    )
                }
                Some(_) => {}
            },
            NodeConfig::Loop {
                max_iterations,
                repeat_while,
            } => {
                if *max_iterations == 0 || *max_iterations > self.max_loop_iterations {
                    issues.node(
                        ValidationCode::LoopBound,
                        id,
                        format!(
                            "loop '{id}' max_iterations must be within 1..={}, got {max_iterations}",
                            self.max_loop_iterations
                        ),
                    );
                }
                if let Some(p) = repeat_while {
                    check_predicate(id, p, issues);
                }
            }
            NodeConfig::Condition {} | NodeConfig::Merge {} | NodeConfig::Terminal {} => {}
        }
    }
}

fn check_path(node_id: &str, path: &str, issues: &mut Issues) {
    if split_path(path).is_err() {
        issues.node(
            ValidationCode::InvalidFieldPath,
            node_id,
            format!(
                "node '{node_id}' references '{path}'; paths must start with vars., subject. or trigger."
            ),
        );
    }
}

fn check_predicate(node_id: &str, predicate: &Predicate, issues: &mut Issues) {
    for field in predicate.fields() {
        check_path(node_id, field, issues);
    }
}

/// Outgoing edges must match the shape required by the source node kind.
fn check_edge_shape(def: &WorkflowDefinition, node_id: &str, kind: NodeType, issues: &mut Issues) {
    let outgoing: Vec<_> = def.outgoing(node_id).collect();
    let count = |f: fn(&EdgeRoute) -> bool| outgoing.iter().filter(|e| f(&e.route)).count();
    let next = count(|r| matches!(r, EdgeRoute::Next));
    let on_error = count(|r| matches!(r, EdgeRoute::OnError));
    let repeat = count(|r| matches!(r, EdgeRoute::Repeat));
    let branch = count(|r| matches!(r, EdgeRoute::Branch { .. }));
    let default = count(|r| matches!(r, EdgeRoute::Default { .. }));

    let allowed: fn(&EdgeRoute) -> bool = match kind {
        NodeType::Trigger | NodeType::Merge | NodeType::Delay => {
            |r| matches!(r, EdgeRoute::Next)
        }
        NodeType::Action => |r| matches!(r, EdgeRoute::Next | EdgeRoute::OnError),
        NodeType::Condition => |r| {
            matches!(
                r,
                EdgeRoute::Branch { .. } | EdgeRoute::Default { .. } | EdgeRoute::OnError
            )
        },
        NodeType::Loop => |r| matches!(r, EdgeRoute::Next | EdgeRoute::Repeat),
        NodeType::Terminal => |_| false,
    };
    for edge in outgoing.iter().filter(|e| !allowed(&e.route)) {
        issues.edge(
            ValidationCode::InvalidRoute,
            &edge.id,
            format!(
                "edge '{}' has a route that {kind} node '{node_id}' does not support",
                edge.id
            ),
        );
    }

    let mut shape = |ok: bool, msg: String| {
        if !ok {
            issues.node(ValidationCode::EdgeShape, node_id, msg);
        }
    };
    match kind {
        NodeType::Trigger | NodeType::Merge | NodeType::Delay => shape(
            next == 1,
            format!("{kind} node '{node_id}' must have exactly one outgoing edge, found {next}"),
        ),
        NodeType::Action => {
            shape(
                next == 1,
                format!("action node '{node_id}' must have exactly one success edge, found {next}"),
            );
            shape(
                on_error <= 1,
                format!("action node '{node_id}' has {on_error} error edges, at most one allowed"),
            );
        }
        NodeType::Loop => {
            shape(
                repeat == 1 && next == 1,
                format!(
                    "loop node '{node_id}' must have exactly one repeat edge and one exit edge"
                ),
            );
        }
        NodeType::Terminal => shape(
            outgoing.is_empty(),
            format!("terminal node '{node_id}' must not have outgoing edges"),
        ),
        NodeType::Condition => {
            shape(
                branch + default >= 2,
                format!(
                    "condition node '{node_id}' must have at least two branch edges, found {}",
                    branch + default
                ),
            );
            shape(
                default <= 1,
                format!("condition node '{node_id}' has {default} default edges, at most one allowed"),
            );
            shape(
                on_error <= 1,
                format!("condition node '{node_id}' has {on_error} error edges, at most one allowed"),
            );
            let mut keys = HashSet::new();
            for edge in &outgoing {
                let Some(key) = edge.route.branch_key() else {
                    continue;
                };
                if key.trim().is_empty() {
                    issues.edge(
                        ValidationCode::BranchKey,
                        &edge.id,
                        format!("branch edge '{}' has an empty key", edge.id),
                    );
                } else if !keys.insert(key) {
                    issues.edge(
                        ValidationCode::BranchKey,
                        &edge.id,
                        format!("condition node '{node_id}' repeats branch key '{key}'"),
                    );
                }
                if let EdgeRoute::Branch { predicate, .. } = &edge.route {
                    check_predicate(node_id, predicate, issues);
                }
            }
        }
    }
}

fn check_reachability(def: &WorkflowDefinition, start: &str, issues: &mut Issues) {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &def.edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let mut seen: HashSet<&str> = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        for &next in adjacency.get(id).map(Vec::as_slice).unwrap_or_default() {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }

    for node in &def.nodes {
        if !seen.contains(node.id.as_str()) {
            issues.node(
                ValidationCode::Unreachable,
                &node.id,
                format!("node '{}' is not reachable from trigger '{start}'", node.id),
            );
        }
    }
}

/// Every cycle must pass through a `Repeat` edge, and every `Repeat` edge
/// must lead back to its loop node.
fn check_cycles(def: &WorkflowDefinition, issues: &mut Issues) {
    let mut graph = DiGraph::<&str, ()>::new();
    let index: HashMap<&str, NodeIndex> = def
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), graph.add_node(n.id.as_str())))
        .collect();

    let mut forward = graph.clone();
    for edge in &def.edges {
        let (Some(&from), Some(&to)) = (index.get(edge.source.as_str()), index.get(edge.target.as_str()))
        else {
            continue;
        };
        graph.add_edge(from, to, ());
        if !matches!(edge.route, EdgeRoute::Repeat) {
            forward.add_edge(from, to, ());
        }
    }

    if let Err(cycle) = toposort(&forward, None) {
        let node_id = forward[cycle.node_id()];
        issues.node(
            ValidationCode::Cycle,
            node_id,
            format!(
                "cycle detected involving node '{node_id}'; re-entry is only allowed through a loop node's repeat edge"
            ),
        );
    }

    for edge in def.edges.iter().filter(|e| matches!(e.route, EdgeRoute::Repeat)) {
        let (Some(&from), Some(&to)) = (index.get(edge.source.as_str()), index.get(edge.target.as_str()))
        else {
            continue;
        };
        if !petgraph::algo::has_path_connecting(&graph, to, from, None) {
            issues.edge(
                ValidationCode::Cycle,
                &edge.id,
                format!(
                    "repeat edge '{}' does not lead back to loop node '{}'",
                    edge.id, edge.source
                ),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::{branch, default_edge, edge, lead_scoring_definition, node};
    use cadence_types::workflow::{Comparator, Edge};
    use serde_json::json;

    fn validator() -> GraphValidator {
        GraphValidator::new(100)
    }

    fn codes(def: &WorkflowDefinition) -> Vec<ValidationCode> {
        match validator().validate(def) {
            Ok(()) => vec![],
            Err(report) => report.issues.into_iter().map(|i| i.code).collect(),
        }
    }

    #[test]
    fn test_lead_scoring_definition_is_valid() {
        let def = lead_scoring_definition();
        assert_eq!(validator().validate(&def), Ok(()));
    }

    #[test]
    fn test_registered_action_types() {
        let def = lead_scoring_definition();
        let strict = validator().with_action_types(["send_priority_email"]);
        let report = strict.validate(&def).unwrap_err();
        assert!(report.has(ValidationCode::UnknownActionType));
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].node_id.as_deref(), Some("followup"));
    }

    #[test]
    fn test_exactly_one_trigger() {
        let mut def = lead_scoring_definition();
        def.nodes.retain(|n| n.id != "start");
        def.edges.retain(|e| e.source != "start");
        assert!(codes(&def).contains(&ValidationCode::TriggerCount));

        let mut two = lead_scoring_definition();
        two.nodes.push(node(
            "start2",
            NodeConfig::Trigger {
                event_type: "lead_updated".into(),
                when: None,
                bindings: Default::default(),
            },
        ));
        two.edges.push(edge("e-start2", "start2", "score"));
        assert!(codes(&two).contains(&ValidationCode::TriggerCount));
    }

    #[test]
    fn test_unreachable_node_reported() {
        let mut def = lead_scoring_definition();
        def.nodes.push(node("orphan", NodeConfig::Terminal {}));
        let report = validator().validate(&def).unwrap_err();
        assert!(report.has(ValidationCode::Unreachable));
        assert!(report.issues.iter().any(|i| i.node_id.as_deref() == Some("orphan")));
    }

    #[test]
    fn test_branch_keys_distinct_and_non_empty() {
        let mut def = lead_scoring_definition();
        for e in def.edges.iter_mut() {
            if let EdgeRoute::Default { key } = &mut e.route {
                *key = "hot".into();
            }
        }
        assert!(codes(&def).contains(&ValidationCode::BranchKey));

        let mut blank = lead_scoring_definition();
        for e in blank.edges.iter_mut() {
            if let EdgeRoute::Branch { key, .. } = &mut e.route {
                *key = " ".into();
            }
        }
        assert!(codes(&blank).contains(&ValidationCode::BranchKey));
    }

    #[test]
    fn test_condition_needs_two_edges() {
        let mut def = lead_scoring_definition();
        def.edges.retain(|e| !matches!(e.route, EdgeRoute::Default { .. }));
        def.nodes.retain(|n| !["wait", "followup", "done-else"].contains(&n.id.as_str()));
        def.edges.retain(|e| def.nodes.iter().any(|n| n.id == e.source));
        assert_eq!(codes(&def), vec![ValidationCode::EdgeShape]);
    }

    #[test]
    fn test_terminal_with_outgoing_edge() {
        let mut def = lead_scoring_definition();
        def.edges.push(edge("bad", "done-hot", "followup"));
        let found = codes(&def);
        assert!(found.contains(&ValidationCode::InvalidRoute));
        assert!(found.contains(&ValidationCode::EdgeShape));
    }

    #[test]
    fn test_cycle_without_loop_rejected() {
        let mut def = lead_scoring_definition();
        // followup -> wait closes a cycle wait -> followup -> wait
        def.edges.retain(|e| e.source != "followup");
        def.edges.push(edge("back", "followup", "wait"));
        def.nodes.retain(|n| n.id != "done-else");
        let found = codes(&def);
        assert!(found.contains(&ValidationCode::Cycle), "{found:?}");
    }

    #[test]
    fn test_bounded_loop_accepted() {
        let mut def = lead_scoring_definition();
        // followup -> retry-loop -(repeat)-> wait, -(next)-> done-else
        def.edges.retain(|e| e.source != "followup");
        def.nodes.push(node(
            "retry-loop",
            NodeConfig::Loop {
                max_iterations: 3,
                repeat_while: None,
            },
        ));
        def.edges.push(edge("to-loop", "followup", "retry-loop"));
        def.edges.push(Edge {
            id: "again".into(),
            source: "retry-loop".into(),
            target: "wait".into(),
            route: EdgeRoute::Repeat,
        });
        def.edges.push(edge("exit", "retry-loop", "done-else"));
        assert_eq!(validator().validate(&def), Ok(()));

        let mut unbounded = def.clone();
        for n in unbounded.nodes.iter_mut() {
            if let NodeConfig::Loop { max_iterations, .. } = &mut n.config {
                *max_iterations = 1000;
            }
        }
        assert_eq!(codes(&unbounded), vec![ValidationCode::LoopBound]);
    }

    #[test]
    fn test_repeat_edge_must_lead_back() {
        let mut def = lead_scoring_definition();
        def.edges.retain(|e| e.source != "followup");
        def.nodes.push(node(
            "spin",
            NodeConfig::Loop {
                max_iterations: 3,
                repeat_while: None,
            },
        ));
        def.edges.push(edge("to-spin", "followup", "spin"));
        def.edges.push(Edge {
            id: "forward".into(),
            source: "spin".into(),
            target: "done-else".into(),
            route: EdgeRoute::Repeat,
        });
        def.edges.push(edge("exit", "spin", "done-else"));
        assert!(codes(&def).contains(&ValidationCode::Cycle));
    }

    #[test]
    fn test_node_type_must_match_config() {
        let mut def = lead_scoring_definition();
        def.nodes[1].node_type = NodeType::Action;
        assert!(codes(&def).contains(&ValidationCode::NodeTypeMismatch));
    }

    #[test]
    fn test_duplicate_and_dangling() {
        let mut def = lead_scoring_definition();
        def.edges.push(edge("e-start", "start", "nowhere"));
        let found = codes(&def);
        assert!(found.contains(&ValidationCode::DuplicateEdgeId));
        assert!(found.contains(&ValidationCode::DanglingEdge));
    }

    #[test]
    fn test_invalid_paths_and_delays() {
        let mut def = lead_scoring_definition();
        for e in def.edges.iter_mut() {
            if let EdgeRoute::Branch { predicate, .. } = &mut e.route {
                *predicate = Predicate::Compare {
                    field: "lead.score".into(),
                    cmp: Comparator::Gte,
                    value: json!(80),
                };
            }
        }
        for n in def.nodes.iter_mut() {
            if let NodeConfig::Delay { after_secs, .. } = &mut n.config {
                *after_secs = Some(0);
            }
        }
        let found = codes(&def);
        assert!(found.contains(&ValidationCode::InvalidFieldPath));
        assert!(found.contains(&ValidationCode::InvalidConfig));
    }

    #[test]
    fn test_delay_longer_than_bound_is_rejected() {
        let mut def = lead_scoring_definition();
        for n in def.nodes.iter_mut() {
            if let NodeConfig::Delay { after_secs, .. } = &mut n.config {
                *after_secs = Some(u64::MAX / 2);
            }
        }
        let report = validator().validate(&def).unwrap_err();
        assert!(report.issues.iter().any(|i| i.code == ValidationCode::InvalidConfig
            && i.message.contains("at most")));

        for n in def.nodes.iter_mut() {
            if let NodeConfig::Delay { after_secs, .. } = &mut n.config {
                *after_secs = Some(MAX_DELAY_SECS);
            }
        }
        assert!(validator().validate(&def).is_ok());
    }

    #[test]
    fn test_report_lists_every_issue() {
        let mut def = lead_scoring_definition();
        def.name = String::new();
        def.nodes.push(node("orphan", NodeConfig::Merge {}));
        let report = validator().validate(&def).unwrap_err();
        assert!(report.issues.len() >= 3);
        assert!(report.to_string().contains("workflow name must not be empty"));
    }

    #[test]
    fn test_helpers_build_expected_routes() {
        let b = branch("x", "a", "b", "k", Predicate::Always);
        assert_eq!(b.route.branch_key(), Some("k"));
        let d = default_edge("y", "a", "c", "else");
        assert_eq!(d.route.branch_key(), Some("else"));
    }
}
