//! Derived-state hooks run after a committed solve.
//!
//! The solving pipeline only knows rates. Anything computed from them (machine
//! counts, power draw, costs) plugs in through the [`RateHook`] trait and is
//! notified once per node whose reference rate changed.

use crate::apply::NodeRateChange;
use crate::graph::FlowGraph;
use crate::id::{NodeId, RecipeId};
use crate::node::NodeKind;
use std::collections::{BTreeMap, HashMap};

// ---------------------------------------------------------------------------
// RateHook trait
// ---------------------------------------------------------------------------

/// Receives node rate changes after each committed solve.
///
/// All methods except `name` and the downcasts default to no-ops.
pub trait RateHook: std::fmt::Debug {
    fn name(&self) -> &str;

    /// Called once per node whose reference rate changed. `graph` already
    /// holds the new rates.
    fn on_rate_changed(&mut self, graph: &FlowGraph, change: &NodeRateChange) {
        let _ = (graph, change);
    }

    /// Called after a node has been removed from the graph.
    fn on_node_removed(&mut self, node: NodeId) {
        let _ = node;
    }

    /// Called when the hook is registered and after node ids were reshuffled
    /// (grouping, ungrouping). Hooks holding per-node state should recompute.
    fn on_graph_rebuilt(&mut self, graph: &FlowGraph) {
        let _ = graph;
    }

    fn as_any(&self) -> &dyn std::any::Any;

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

// ---------------------------------------------------------------------------
// MachineTally
// ---------------------------------------------------------------------------

/// Keeps the number of machines each Craft node needs: the reference rate
/// rounded up. Group nodes count every Craft node of their sub-graph.
#[derive(Debug, Default)]
pub struct MachineTally {
    per_node: HashMap<NodeId, Vec<(RecipeId, i64)>>,
}

impl MachineTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recount every node of `graph`.
    pub fn refresh(&mut self, graph: &FlowGraph) {
        self.per_node.clear();
        for (id, _) in graph.nodes() {
            let counts = Self::count_node(graph, id);
            if !counts.is_empty() {
                self.per_node.insert(id, counts);
            }
        }
    }

    /// Machines needed by one top-level node.
    pub fn machines(&self, node: NodeId) -> i64 {
        self.per_node
            .get(&node)
            .map(|c| c.iter().map(|(_, n)| n).sum())
            .unwrap_or(0)
    }

    /// Machines needed per recipe across the graph.
    pub fn by_recipe(&self) -> BTreeMap<RecipeId, i64> {
        let mut totals = BTreeMap::new();
        for counts in self.per_node.values() {
            for (recipe, n) in counts {
                *totals.entry(*recipe).or_insert(0) += n;
            }
        }
        totals
    }

    pub fn total(&self) -> i64 {
        self.per_node.values().flatten().map(|(_, n)| n).sum()
    }

    fn count_node(graph: &FlowGraph, node: NodeId) -> Vec<(RecipeId, i64)> {
        let Some(n) = graph.node(node) else {
            return Vec::new();
        };
        match &n.kind {
            NodeKind::Craft { recipe, rate, .. } => vec![(*recipe, rate.ceil())],
            NodeKind::Group(group) => {
                let sub = &group.subgraph;
                sub.nodes()
                    .flat_map(|(id, _)| Self::count_node(sub, id))
                    .collect()
            }
            _ => Vec::new(),
        }
    }
}

impl RateHook for MachineTally {
    fn name(&self) -> &str {
        "machine_tally"
    }

    fn on_rate_changed(&mut self, graph: &FlowGraph, change: &NodeRateChange) {
        let counts = Self::count_node(graph, change.node);
        if counts.is_empty() {
            self.per_node.remove(&change.node);
        } else {
            self.per_node.insert(change.node, counts);
        }
    }

    fn on_node_removed(&mut self, node: NodeId) {
        self.per_node.remove(&node);
    }

    fn on_graph_rebuilt(&mut self, graph: &FlowGraph) {
        self.refresh(graph);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rational::{ratio, Rational};
    use crate::test_utils::*;

    #[test]
    fn tally_rounds_up() {
        let (mut g, f) = scenario_a();
        let mut tally = MachineTally::new();
        tally.refresh(&g);
        assert_eq!(tally.machines(f.craft), 1);

        g.set_reference_rate(f.craft, ratio(5, 2)).unwrap();
        tally.on_rate_changed(
            &g,
            &NodeRateChange {
                node: f.craft,
                old: Rational::one(),
                new: ratio(5, 2),
            },
        );
        assert_eq!(tally.machines(f.craft), 3);
        assert_eq!(tally.total(), 3);
    }

    #[test]
    fn tally_forgets_removed_nodes() {
        let (g, f) = scenario_a();
        let mut tally = MachineTally::new();
        tally.refresh(&g);
        tally.on_node_removed(f.craft);
        assert_eq!(tally.total(), 0);
        assert!(tally.by_recipe().is_empty());
    }

    #[test]
    fn tally_counts_group_contents() {
        let mut g = FlowGraph::new();
        let (sid, smelt) = smelter_recipe();
        let a = g.add_craft(sid, &smelt);
        let b = g.add_craft(sid, &smelt);
        let group = g.group_nodes(&[a, b], "smelters").unwrap();
        let mut tally = MachineTally::new();
        tally.refresh(&g);
        assert_eq!(tally.machines(group), 2);
        assert_eq!(tally.by_recipe().get(&sid), Some(&2));
    }

    #[test]
    fn downcast_through_trait_object() {
        let hook: Box<dyn RateHook> = Box::new(MachineTally::new());
        assert_eq!(hook.name(), "machine_tally");
        assert!(hook.as_any().downcast_ref::<MachineTally>().is_some());
    }
}
