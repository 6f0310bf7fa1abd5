//! Node, pin and link entities of a [`FlowGraph`](crate::graph::FlowGraph).
//!
//! Node behavior is a closed set of six kinds. Craft, Group and GameSplitter
//! nodes scale all of their pins from one reference rate; Merger and
//! CustomSplitter nodes balance one "single" pin against N "multi" pins;
//! Sink inputs are independent of each other.

use crate::graph::FlowGraph;
use crate::id::*;
use crate::rational::{ArithmeticError, Rational};
use serde::{Deserialize, Serialize};
use slotmap::SecondaryMap;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Pins and links
// ---------------------------------------------------------------------------

/// A directional port carrying one flow rate.
#[derive(Debug, Clone)]
pub struct Pin {
    pub direction: Direction,
    pub node: NodeId,
    pub item: Option<ItemId>,
    /// Per-unit ratio against the node's reference rate. Unused for
    /// Merger, CustomSplitter and Sink pins.
    pub base_rate: Rational,
    pub current_rate: Rational,
    pub locked: bool,
    pub link: Option<LinkId>,
}

impl Pin {
    pub(crate) fn new(direction: Direction, node: NodeId, item: Option<ItemId>, base_rate: Rational) -> Self {
        Self {
            direction,
            node,
            item,
            base_rate,
            current_rate: Rational::zero(),
            locked: false,
            link: None,
        }
    }
}

/// Direction a rate change travelled along a link during the last solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowDirection {
    /// From the output pin towards the input pin.
    Forward,
    /// From the input pin back towards the output pin.
    Backward,
    /// The link was part of the solve but its rate did not change.
    Unchanged,
}

/// A connection from an output pin (`start`) to an input pin (`end`).
#[derive(Debug, Clone)]
pub struct Link {
    pub start: PinId,
    pub end: PinId,
    /// Set by the last solve that touched this link, cleared by the next one.
    pub flow: Option<FlowDirection>,
}

// ---------------------------------------------------------------------------
// Node kinds
// ---------------------------------------------------------------------------

/// Plain tag of a [`NodeKind`], used by records and log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeTag {
    Craft,
    Group,
    CustomSplitter,
    Merger,
    GameSplitter,
    Sink,
}

/// Per-kind node state.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Craft {
        recipe: RecipeId,
        rate: Rational,
        /// Multiplier applied to every output coefficient.
        output_boost: Rational,
    },
    Group(GroupData),
    CustomSplitter {
        item: Option<ItemId>,
    },
    Merger {
        item: Option<ItemId>,
    },
    /// Even splitter. The input coefficient is the output count and every
    /// output coefficient is 1, so `rate` is the per-output rate.
    GameSplitter {
        item: Option<ItemId>,
        rate: Rational,
    },
    Sink,
}

impl NodeKind {
    pub fn tag(&self) -> NodeTag {
        match self {
            NodeKind::Craft { .. } => NodeTag::Craft,
            NodeKind::Group(_) => NodeTag::Group,
            NodeKind::CustomSplitter { .. } => NodeTag::CustomSplitter,
            NodeKind::Merger { .. } => NodeTag::Merger,
            NodeKind::GameSplitter { .. } => NodeTag::GameSplitter,
            NodeKind::Sink => NodeTag::Sink,
        }
    }

    /// True for kinds whose pins all follow one reference rate.
    pub fn has_reference_rate(&self) -> bool {
        matches!(
            self,
            NodeKind::Craft { .. } | NodeKind::Group(_) | NodeKind::GameSplitter { .. }
        )
    }

    pub fn reference_rate(&self) -> Option<&Rational> {
        match self {
            NodeKind::Craft { rate, .. } | NodeKind::GameSplitter { rate, .. } => Some(rate),
            NodeKind::Group(group) => Some(&group.rate),
            _ => None,
        }
    }

    /// Item routed by a splitter or merger, once one has been adopted.
    pub fn organizer_item(&self) -> Option<ItemId> {
        match self {
            NodeKind::CustomSplitter { item }
            | NodeKind::Merger { item }
            | NodeKind::GameSplitter { item, .. } => *item,
            _ => None,
        }
    }

    pub(crate) fn set_organizer_item(&mut self, new_item: Option<ItemId>) {
        if let NodeKind::CustomSplitter { item }
        | NodeKind::Merger { item }
        | NodeKind::GameSplitter { item, .. } = self
        {
            *item = new_item;
        }
    }
}

/// A node with its ordered input and output pins.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub ins: Vec<PinId>,
    pub outs: Vec<PinId>,
}

impl Node {
    /// All pins, inputs first.
    pub fn pins(&self) -> impl Iterator<Item = PinId> + '_ {
        self.ins.iter().chain(self.outs.iter()).copied()
    }

    /// Side holding the single pin of a Merger or CustomSplitter.
    pub fn single_side(&self) -> Option<Direction> {
        match self.kind {
            NodeKind::CustomSplitter { .. } => Some(Direction::Input),
            NodeKind::Merger { .. } => Some(Direction::Output),
            _ => None,
        }
    }

    pub fn single_pin(&self) -> Option<PinId> {
        match self.single_side()? {
            Direction::Input => self.ins.first().copied(),
            Direction::Output => self.outs.first().copied(),
        }
    }

    /// The resizable side of a Merger or CustomSplitter. Empty otherwise.
    pub fn multi_pins(&self) -> &[PinId] {
        match self.single_side() {
            Some(Direction::Input) => &self.outs,
            Some(Direction::Output) => &self.ins,
            None => &[],
        }
    }

    /// Coefficient of `pin` against this node's reference rate.
    pub fn coefficient(&self, pin: &Pin) -> Result<Rational, ArithmeticError> {
        match &self.kind {
            NodeKind::Craft { output_boost, .. } if pin.direction == Direction::Output => {
                pin.base_rate.checked_mul(output_boost)
            }
            _ => Ok(pin.base_rate.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// A Group node's embedded sub-network.
///
/// The sub-graph is snapshotted when the group is built; that snapshot is the
/// group at rate 1. Every later rate is applied by scaling the snapshot.
#[derive(Debug, Clone)]
pub struct GroupData {
    pub name: String,
    pub rate: Rational,
    pub subgraph: Box<FlowGraph>,
    base_node_rates: SecondaryMap<NodeId, Rational>,
    base_pin_rates: SecondaryMap<PinId, Rational>,
}

/// Net per-item amounts crossing a group's boundary at rate 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Boundary {
    pub inputs: Vec<(ItemId, Rational)>,
    pub outputs: Vec<(ItemId, Rational)>,
}

impl GroupData {
    /// Wrap `subgraph` as a group running at rate 1.
    pub fn new(name: impl Into<String>, subgraph: FlowGraph) -> Self {
        let mut base_node_rates = SecondaryMap::new();
        let mut base_pin_rates = SecondaryMap::new();
        for (id, node) in subgraph.nodes() {
            if let Some(rate) = node.kind.reference_rate() {
                base_node_rates.insert(id, rate.clone());
            }
        }
        for (id, pin) in subgraph.pins() {
            base_pin_rates.insert(id, pin.current_rate.clone());
        }
        Self {
            name: name.into(),
            rate: Rational::one(),
            subgraph: Box::new(subgraph),
            base_node_rates,
            base_pin_rates,
        }
    }

    /// Sub-node reference rate at group rate 1.
    pub fn base_node_rate(&self, node: NodeId) -> Option<&Rational> {
        self.base_node_rates.get(node)
    }

    /// A copy of this group with every sub-rate scaled to `rate`.
    pub fn rescaled(&self, rate: &Rational) -> Result<Self, ArithmeticError> {
        let mut next = self.clone();
        next.rate = rate.clone();
        for (id, base) in &self.base_node_rates {
            let scaled = base.checked_mul(rate)?;
            let Some(node) = next.subgraph.node_mut(id) else {
                continue;
            };
            match &mut node.kind {
                NodeKind::Craft { rate, .. } | NodeKind::GameSplitter { rate, .. } => *rate = scaled,
                NodeKind::Group(inner) => *inner = inner.rescaled(&scaled)?,
                _ => {}
            }
        }
        for (id, base) in &self.base_pin_rates {
            let scaled = base.checked_mul(rate)?;
            if let Some(pin) = next.subgraph.pin_mut(id) {
                pin.current_rate = scaled;
            }
        }
        Ok(next)
    }

    /// Net item flows across the boundary at rate 1.
    ///
    /// Craft pins and nested group boundaries count both ways; sink inputs
    /// count as consumption. An item consumed more than produced becomes an
    /// input, the reverse an output, and balanced items do not appear.
    pub fn boundary(&self) -> Result<Boundary, ArithmeticError> {
        let mut consumed: BTreeMap<ItemId, Rational> = BTreeMap::new();
        let mut produced: BTreeMap<ItemId, Rational> = BTreeMap::new();
        let g = &self.subgraph;
        for (_, node) in g.nodes() {
            let counts = matches!(node.kind, NodeKind::Craft { .. } | NodeKind::Group(_));
            let sink = matches!(node.kind, NodeKind::Sink);
            if !counts && !sink {
                continue;
            }
            for pin_id in node.pins() {
                let Some(pin) = g.pin(pin_id) else { continue };
                let Some(item) = pin.item else { continue };
                let rate = self.base_pin_rates.get(pin_id).unwrap_or(&pin.current_rate);
                let side = match pin.direction {
                    Direction::Input => &mut consumed,
                    Direction::Output if counts => &mut produced,
                    Direction::Output => continue,
                };
                let entry = side.entry(item).or_default();
                *entry = entry.checked_add(rate)?;
            }
        }
        let mut boundary = Boundary::default();
        let items: std::collections::BTreeSet<ItemId> =
            consumed.keys().chain(produced.keys()).copied().collect();
        for item in items {
            let c = consumed.get(&item).cloned().unwrap_or_default();
            let p = produced.get(&item).cloned().unwrap_or_default();
            if c > p {
                boundary.inputs.push((item, c.checked_sub(&p)?));
            } else if p > c {
                boundary.outputs.push((item, p.checked_sub(&c)?));
            }
        }
        Ok(boundary)
    }
}
