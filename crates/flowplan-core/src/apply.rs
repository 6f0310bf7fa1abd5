//! Write a solution back into the graph.
//!
//! Everything is computed into a side buffer first: new pin rates, new node
//! states (including rescaled group sub-graphs) and flow annotations. The
//! graph is only touched once all of it succeeded, so a failed apply leaves
//! the graph as it was.

use crate::equation::{LinearSystem, Variable};
use crate::graph::{FlowGraph, GraphError};
use crate::id::*;
use crate::node::{FlowDirection, NodeKind};
use crate::rational::Rational;
use crate::relevant::RelevantSet;
use crate::solver::SolveError;
use std::collections::{HashMap, HashSet};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// A pin whose rate changed during a solve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinChange {
    pub pin: PinId,
    pub old: Rational,
    pub new: Rational,
}

/// A Craft/Group/GameSplitter node whose reference rate changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRateChange {
    pub node: NodeId,
    pub old: Rational,
    pub new: Rational,
}

/// Outcome of a committed solve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveReport {
    /// Pins whose rate changed, in discovery order.
    pub changed: Vec<PinChange>,
    pub nodes: Vec<NodeRateChange>,
    /// Flow annotation of every link the solve covered.
    pub flows: Vec<(LinkId, FlowDirection)>,
}

impl SolveReport {
    pub fn is_unchanged(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn change(&self, pin: PinId) -> Option<&PinChange> {
        self.changed.iter().find(|c| c.pin == pin)
    }

    pub fn flow(&self, link: LinkId) -> Option<FlowDirection> {
        self.flows.iter().find(|(l, _)| *l == link).map(|(_, f)| *f)
    }
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// Commit `values` (one per unknown of `system`) to `graph`.
pub fn apply(
    graph: &mut FlowGraph,
    relevant: &RelevantSet,
    system: &LinearSystem,
    values: &[Rational],
    annotate_flow: bool,
) -> Result<SolveReport, SolveError> {
    let mut new_rates: HashMap<PinId, Rational> = HashMap::new();
    let mut new_kinds: Vec<(NodeId, NodeKind)> = Vec::new();
    let mut report = SolveReport::default();

    for (unknown, value) in system.unknowns.iter().zip(values) {
        match unknown.var {
            Variable::PinRate(pin) => {
                new_rates.insert(pin, value.clone());
            }
            Variable::NodeRate(node_id) => {
                let node = graph.node(node_id).ok_or(GraphError::NodeNotFound(node_id))?;
                for pin_id in node.pins() {
                    let pin = graph.pin(pin_id).ok_or(GraphError::PinNotFound(pin_id))?;
                    new_rates.insert(pin_id, node.coefficient(pin)?.checked_mul(value)?);
                }
                let old = node.kind.reference_rate().cloned().unwrap_or_default();
                if old == *value {
                    continue;
                }
                let kind = match &node.kind {
                    NodeKind::Craft {
                        recipe,
                        output_boost,
                        ..
                    } => NodeKind::Craft {
                        recipe: *recipe,
                        rate: value.clone(),
                        output_boost: output_boost.clone(),
                    },
                    NodeKind::GameSplitter { item, .. } => NodeKind::GameSplitter {
                        item: *item,
                        rate: value.clone(),
                    },
                    NodeKind::Group(group) => NodeKind::Group(group.rescaled(value)?),
                    other => other.clone(),
                };
                new_kinds.push((node_id, kind));
                report.nodes.push(NodeRateChange {
                    node: node_id,
                    old,
                    new: value.clone(),
                });
            }
        }
    }

    for &pin_id in relevant.pins() {
        let Some(new) = new_rates.get(&pin_id) else { continue };
        let old = graph.rate(pin_id).ok_or(GraphError::PinNotFound(pin_id))?;
        if old != new {
            report.changed.push(PinChange {
                pin: pin_id,
                old: old.clone(),
                new: new.clone(),
            });
        }
    }

    if annotate_flow {
        let mut seen = HashSet::new();
        for &pin_id in relevant.pins() {
            let Some(link_id) = graph.pin(pin_id).and_then(|p| p.link) else {
                continue;
            };
            if !seen.insert(link_id) {
                continue;
            }
            let link = graph.link(link_id).ok_or(GraphError::LinkNotFound(link_id))?;
            let moved = [link.start, link.end].iter().any(|p| {
                let current = graph.rate(*p);
                new_rates.get(p).is_some_and(|n| Some(n) != current)
            });
            let flow = if !moved {
                FlowDirection::Unchanged
            } else {
                match (relevant.order(link.start), relevant.order(link.end)) {
                    (Some(s), Some(e)) if e < s => FlowDirection::Backward,
                    (None, Some(_)) => FlowDirection::Backward,
                    _ => FlowDirection::Forward,
                }
            };
            report.flows.push((link_id, flow));
        }
    }

    // Commit.
    for (pin_id, rate) in new_rates {
        graph.set_current_rate(pin_id, rate)?;
    }
    for (node_id, kind) in new_kinds {
        if let Some(node) = graph.node_mut(node_id) {
            node.kind = kind;
        }
    }
    if annotate_flow {
        graph.clear_flows();
        for (link_id, flow) in &report.flows {
            if let Some(link) = graph.link_mut(*link_id) {
                link.flow = Some(*flow);
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation::build;
    use crate::rational::ratio;
    use crate::relevant::collect;
    use crate::solver::solve;
    use crate::test_utils::*;

    fn run(graph: &mut FlowGraph, pin: PinId, value: Rational) -> SolveReport {
        let set = collect(graph, pin, 1).unwrap();
        let system = build(graph, &set, pin, &value).unwrap();
        let values = solve(&system).unwrap();
        apply(graph, &set, &system, &values, true).unwrap()
    }

    #[test]
    fn writes_node_rate_and_pins() {
        let (mut g, f) = scenario_a();
        let report = run(&mut g, f.output, ratio(3, 1));
        assert_eq!(g.rate(f.input), Some(&ratio(6, 1)));
        assert_eq!(g.node(f.craft).unwrap().kind.reference_rate(), Some(&ratio(3, 1)));
        assert_eq!(report.nodes.len(), 1);
        assert_eq!(report.changed.len(), 2);
    }

    #[test]
    fn flow_direction_follows_discovery() {
        let (mut g, f) = craft_into_sink();
        let report = run(&mut g, f.craft_in, ratio(60, 1));
        let link = g.pin(f.craft_out).unwrap().link.unwrap();
        assert_eq!(report.flow(link), Some(FlowDirection::Forward));
        assert_eq!(g.link(link).unwrap().flow, Some(FlowDirection::Forward));

        let report = run(&mut g, f.sink_in, ratio(30, 1));
        assert_eq!(report.flow(link), Some(FlowDirection::Backward));
    }

    #[test]
    fn unchanged_links_are_tagged_unchanged() {
        let (mut g, f) = craft_into_sink();
        let link = g.pin(f.craft_out).unwrap().link.unwrap();
        let report = run(&mut g, f.craft_out, ratio(30, 1));
        assert!(report.is_unchanged());
        assert_eq!(report.flow(link), Some(FlowDirection::Unchanged));
    }
}
