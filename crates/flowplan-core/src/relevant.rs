//! Relevant-set collection: which pins can a single edit move?
//!
//! The walk starts at the constraint pin and its linked neighbour. Every pin
//! reached across a link is an *entry*: it is driven by whatever changed on
//! the other side of that link ([`DrivenBy::Elsewhere`]). Expanding an entry
//! marks sibling pins on the same node according to the node kind; a pin
//! that is only ever reached this way is driven by the side that caused the
//! change ([`DrivenBy::CausingSide`]). Marked pins with links push their
//! neighbours as new entries.
//!
//! Each pin is entered at most once, so cycles terminate. A step budget
//! proportional to the pin count guards the walk anyway.

use crate::graph::{FlowGraph, GraphError};
use crate::id::*;
use crate::node::NodeTag;
use crate::solver::SolveError;
use slotmap::SecondaryMap;
use std::collections::VecDeque;
use tracing::debug;

/// Why a pin is in the relevant set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrivenBy {
    /// Marked only by expanding a sibling on its own node.
    CausingSide,
    /// Entered through its link, or the constraint pin itself.
    Elsewhere,
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    order: usize,
    driven: DrivenBy,
}

/// The pins one solve may change, in discovery order.
#[derive(Debug, Clone, Default)]
pub struct RelevantSet {
    marks: SecondaryMap<PinId, Mark>,
    pins: Vec<PinId>,
    nodes: Vec<NodeId>,
    node_seen: SecondaryMap<NodeId, ()>,
}

impl RelevantSet {
    pub fn contains(&self, pin: PinId) -> bool {
        self.marks.contains_key(pin)
    }

    pub fn driven_by(&self, pin: PinId) -> Option<DrivenBy> {
        self.marks.get(pin).map(|m| m.driven)
    }

    /// Position of `pin` in discovery order.
    pub fn order(&self, pin: PinId) -> Option<usize> {
        self.marks.get(pin).map(|m| m.order)
    }

    /// Relevant pins in discovery order.
    pub fn pins(&self) -> &[PinId] {
        &self.pins
    }

    /// Nodes owning at least one relevant pin, in discovery order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Mark a pin. `Elsewhere` overrides an earlier `CausingSide` mark.
    fn mark(&mut self, graph: &FlowGraph, pin: PinId, driven: DrivenBy) {
        if let Some(existing) = self.marks.get_mut(pin) {
            if driven == DrivenBy::Elsewhere {
                existing.driven = DrivenBy::Elsewhere;
            }
            return;
        }
        self.marks.insert(
            pin,
            Mark {
                order: self.pins.len(),
                driven,
            },
        );
        self.pins.push(pin);
        if let Some(p) = graph.pin(pin) {
            if self.node_seen.insert(p.node, ()).is_none() {
                self.nodes.push(p.node);
            }
        }
    }
}

/// Collect the pins an edit of `constraint` can affect.
///
/// The walk is bounded by `pin_count * cap_factor` expansions; exceeding it
/// is reported as [`SolveError::UnderdeterminedSystem`].
pub fn collect(graph: &FlowGraph, constraint: PinId, cap_factor: usize) -> Result<RelevantSet, SolveError> {
    graph
        .pin(constraint)
        .ok_or(GraphError::PinNotFound(constraint))?;
    let cap = graph.pin_count().max(1) * cap_factor.max(1);

    let mut set = RelevantSet::default();
    let mut queue = VecDeque::new();
    let mut queued: SecondaryMap<PinId, ()> = SecondaryMap::new();

    let mut enter = |set: &mut RelevantSet, queue: &mut VecDeque<PinId>, pin: PinId| {
        set.mark(graph, pin, DrivenBy::Elsewhere);
        if queued.insert(pin, ()).is_none() {
            queue.push_back(pin);
        }
    };

    enter(&mut set, &mut queue, constraint);
    if let Some(other) = graph.linked_pin(constraint) {
        enter(&mut set, &mut queue, other);
    }

    let mut steps = 0usize;
    while let Some(entry) = queue.pop_front() {
        steps += 1;
        if steps > cap {
            return Err(SolveError::UnderdeterminedSystem {
                equations: 0,
                variables: set.len(),
            });
        }
        for sibling in siblings_to_mark(graph, entry) {
            set.mark(graph, sibling, DrivenBy::CausingSide);
            let locked = graph.pin(sibling).is_some_and(|p| p.locked);
            if locked {
                continue;
            }
            if let Some(other) = graph.linked_pin(sibling) {
                enter(&mut set, &mut queue, other);
            }
        }
    }

    debug!(
        pins = set.len(),
        nodes = set.nodes().len(),
        steps,
        "collected relevant set"
    );
    Ok(set)
}

/// Pins on `entry`'s node that an edit arriving at `entry` reaches.
fn siblings_to_mark(graph: &FlowGraph, entry: PinId) -> Vec<PinId> {
    let Some(pin) = graph.pin(entry) else {
        return Vec::new();
    };
    let Some(node) = graph.node(pin.node) else {
        return Vec::new();
    };
    let unlocked = |p: &PinId| graph.pin(*p).is_some_and(|p| !p.locked);
    match node.kind.tag() {
        NodeTag::Craft | NodeTag::Group | NodeTag::GameSplitter => {
            node.pins().filter(|p| *p != entry).collect()
        }
        NodeTag::Merger | NodeTag::CustomSplitter => {
            let Some(single) = node.single_pin() else {
                return Vec::new();
            };
            if entry == single {
                node.multi_pins().iter().copied().filter(unlocked).collect()
            } else {
                let mut marked = vec![single];
                let single_locked = graph.pin(single).is_some_and(|p| p.locked);
                if single_locked {
                    marked.extend(
                        node.multi_pins()
                            .iter()
                            .copied()
                            .filter(|p| *p != entry)
                            .filter(unlocked),
                    );
                }
                marked
            }
        }
        NodeTag::Sink => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn craft_marks_every_pin_and_crosses_links() {
        let (g, f) = craft_into_sink();
        let set = collect(&g, f.craft_out, 1).unwrap();
        assert!(set.contains(f.craft_in));
        assert!(set.contains(f.sink_in));
        assert_eq!(set.driven_by(f.craft_out), Some(DrivenBy::Elsewhere));
        assert_eq!(set.driven_by(f.craft_in), Some(DrivenBy::CausingSide));
        assert_eq!(set.driven_by(f.sink_in), Some(DrivenBy::Elsewhere));
        assert_eq!(set.order(f.craft_out), Some(0));
    }

    #[test]
    fn merger_single_side_marks_unlocked_multi_pins() {
        let mut g = crate::graph::FlowGraph::new();
        let m = g.add_merger(3);
        let n = g.node(m).unwrap().clone();
        g.set_locked(n.ins[2], true).unwrap();
        let set = collect(&g, n.outs[0], 1).unwrap();
        assert!(set.contains(n.ins[0]));
        assert!(set.contains(n.ins[1]));
        assert!(!set.contains(n.ins[2]));
    }

    #[test]
    fn merger_multi_side_marks_single_only_unless_locked() {
        let mut g = crate::graph::FlowGraph::new();
        let m = g.add_merger(2);
        let n = g.node(m).unwrap().clone();
        let set = collect(&g, n.ins[0], 1).unwrap();
        assert!(set.contains(n.outs[0]));
        assert!(!set.contains(n.ins[1]));

        g.set_locked(n.outs[0], true).unwrap();
        let set = collect(&g, n.ins[0], 1).unwrap();
        assert!(set.contains(n.ins[1]));
        assert_eq!(set.driven_by(n.ins[1]), Some(DrivenBy::CausingSide));
    }

    #[test]
    fn sink_inputs_do_not_propagate_to_siblings() {
        let mut g = crate::graph::FlowGraph::new();
        let s = g.add_sink(3);
        let n = g.node(s).unwrap().clone();
        let set = collect(&g, n.ins[1], 1).unwrap();
        assert_eq!(set.pins(), &[n.ins[1]]);
    }

    #[test]
    fn recycle_loop_terminates_and_tags_entries() {
        let (g, f) = recycle_loop();
        let set = collect(&g, f.source_out, 1).unwrap();
        // Every pin of the loop is reached exactly once.
        for pin in [f.merger_out, f.splitter_in, f.splitter_keep, f.splitter_back, f.recycler_in, f.recycler_out, f.merger_back] {
            assert!(set.contains(pin), "{pin:?} missing");
        }
        assert_eq!(set.driven_by(f.splitter_in), Some(DrivenBy::Elsewhere));
        assert_eq!(set.driven_by(f.splitter_back), Some(DrivenBy::CausingSide));
        assert_eq!(set.driven_by(f.merger_back), Some(DrivenBy::Elsewhere));
        assert_eq!(set.driven_by(f.merger_out), Some(DrivenBy::CausingSide));
    }

    #[test]
    fn missing_constraint_pin_is_a_graph_error() {
        let (mut g, f) = craft_into_sink();
        let craft = g.pin(f.craft_out).unwrap().node;
        g.remove_node(craft).unwrap();
        assert!(matches!(
            collect(&g, f.craft_out, 1),
            Err(SolveError::Graph(GraphError::PinNotFound(_)))
        ));
    }
}
