//! Plain serde records for persisting a [`FlowGraph`].
//!
//! A record stores what the engine cannot recompute: per pin the current
//! rate, lock flag and item; per node its kind and the reference needed to
//! rebuild fixed pin ratios (recipe id, item, nested group record). Links
//! are stored as `(node index, pin index)` pairs into the record's own node
//! list, so slotmap keys never leave the process.

use crate::graph::{FlowGraph, GraphError};
use crate::id::*;
use crate::node::{NodeKind, NodeTag};
use crate::rational::{ParseError, Rational};
use crate::recipe::RecipeBook;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("unknown recipe {0:?}")]
    UnknownRecipe(RecipeId),
    #[error("node #{node} has a different pin layout than its kind produces")]
    PinCountMismatch { node: usize },
    #[error("link #{link} points at a missing node or pin")]
    BadLink { link: usize },
    #[error("invalid rate: {0}")]
    Rational(#[from] ParseError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRecord {
    pub num: i64,
    pub den: i64,
    pub locked: bool,
    #[serde(default)]
    pub item: Option<ItemId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRecordKind {
    Craft {
        recipe: RecipeId,
        output_boost: Rational,
    },
    /// `graph` is the sub-graph at group rate 1.
    Group {
        name: String,
        graph: Box<GraphRecord>,
    },
    CustomSplitter {
        item: Option<ItemId>,
    },
    Merger {
        item: Option<ItemId>,
    },
    GameSplitter {
        item: Option<ItemId>,
    },
    Sink,
}

impl NodeRecordKind {
    pub fn tag(&self) -> NodeTag {
        match self {
            NodeRecordKind::Craft { .. } => NodeTag::Craft,
            NodeRecordKind::Group { .. } => NodeTag::Group,
            NodeRecordKind::CustomSplitter { .. } => NodeTag::CustomSplitter,
            NodeRecordKind::Merger { .. } => NodeTag::Merger,
            NodeRecordKind::GameSplitter { .. } => NodeTag::GameSplitter,
            NodeRecordKind::Sink => NodeTag::Sink,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub kind: NodeRecordKind,
    /// Reference rate of Craft, Group and GameSplitter nodes.
    #[serde(default)]
    pub rate: Option<Rational>,
    pub ins: Vec<PinRecord>,
    pub outs: Vec<PinRecord>,
}

/// `start` is (node index, output pin index); `end` is (node index, input
/// pin index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub start: (usize, usize),
    pub end: (usize, usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphRecord {
    pub nodes: Vec<NodeRecord>,
    pub links: Vec<LinkRecord>,
}

// ---------------------------------------------------------------------------
// FlowGraph <-> GraphRecord
// ---------------------------------------------------------------------------

impl FlowGraph {
    /// Snapshot this graph as a record. Flow annotations are not kept.
    pub fn to_record(&self) -> Result<GraphRecord, GraphError> {
        let mut record = GraphRecord::default();
        let mut positions: HashMap<PinId, (usize, usize)> = HashMap::new();

        for (index, (_, node)) in self.nodes().enumerate() {
            let kind = match &node.kind {
                NodeKind::Craft {
                    recipe, output_boost, ..
                } => NodeRecordKind::Craft {
                    recipe: *recipe,
                    output_boost: output_boost.clone(),
                },
                NodeKind::Group(group) => {
                    let base = group.rescaled(&Rational::one())?;
                    NodeRecordKind::Group {
                        name: group.name.clone(),
                        graph: Box::new(base.subgraph.to_record()?),
                    }
                }
                NodeKind::CustomSplitter { item } => NodeRecordKind::CustomSplitter { item: *item },
                NodeKind::Merger { item } => NodeRecordKind::Merger { item: *item },
                NodeKind::GameSplitter { item, .. } => NodeRecordKind::GameSplitter { item: *item },
                NodeKind::Sink => NodeRecordKind::Sink,
            };
            let mut pins = |ids: &[PinId]| -> Result<Vec<PinRecord>, GraphError> {
                ids.iter()
                    .enumerate()
                    .map(|(i, id)| {
                        let p = self.pin(*id).ok_or(GraphError::PinNotFound(*id))?;
                        positions.insert(*id, (index, i));
                        Ok(PinRecord {
                            num: p.current_rate.numerator(),
                            den: p.current_rate.denominator(),
                            locked: p.locked,
                            item: p.item,
                        })
                    })
                    .collect()
            };
            let ins = pins(&node.ins)?;
            let outs = pins(&node.outs)?;
            record.nodes.push(NodeRecord {
                kind,
                rate: node.kind.reference_rate().cloned(),
                ins,
                outs,
            });
        }

        for (_, link) in self.links() {
            let (Some(&start), Some(&end)) = (positions.get(&link.start), positions.get(&link.end)) else {
                continue;
            };
            record.links.push(LinkRecord { start, end });
        }
        Ok(record)
    }

    /// Rebuild a graph from `record`, looking up Craft pin ratios in
    /// `recipes`.
    pub fn from_record(record: &GraphRecord, recipes: &impl RecipeBook) -> Result<FlowGraph, RecordError> {
        let mut g = FlowGraph::new();
        let mut ids = Vec::with_capacity(record.nodes.len());

        for (index, rec) in record.nodes.iter().enumerate() {
            let id = match &rec.kind {
                NodeRecordKind::Craft { recipe, output_boost } => {
                    let r = recipes.recipe(*recipe).ok_or(RecordError::UnknownRecipe(*recipe))?;
                    let id = g.add_craft(*recipe, r);
                    g.set_output_boost(id, output_boost.clone())?;
                    id
                }
                NodeRecordKind::Group { name, graph } => {
                    let sub = FlowGraph::from_record(graph, recipes)?;
                    g.add_group(name, sub)?
                }
                NodeRecordKind::CustomSplitter { .. } => g.add_splitter(rec.outs.len()),
                NodeRecordKind::Merger { .. } => g.add_merger(rec.ins.len()),
                NodeRecordKind::GameSplitter { .. } => g.add_game_splitter(rec.outs.len()),
                NodeRecordKind::Sink => g.add_sink(rec.ins.len()),
            };
            if let Some(rate) = &rec.rate {
                g.set_reference_rate(id, rate.clone())?;
            }
            let node = g.node_mut(id).ok_or(GraphError::NodeNotFound(id))?;
            if let NodeRecordKind::CustomSplitter { item }
            | NodeRecordKind::Merger { item }
            | NodeRecordKind::GameSplitter { item } = &rec.kind
            {
                node.kind.set_organizer_item(*item);
            }
            if node.ins.len() != rec.ins.len() || node.outs.len() != rec.outs.len() {
                return Err(RecordError::PinCountMismatch { node: index });
            }
            let pairs: Vec<(PinId, &PinRecord)> = node
                .ins
                .iter()
                .copied()
                .zip(&rec.ins)
                .chain(node.outs.iter().copied().zip(&rec.outs))
                .collect();
            for (pin_id, pr) in pairs {
                let rate = Rational::new(pr.num, pr.den)?;
                let pin = g.pin_mut(pin_id).ok_or(GraphError::PinNotFound(pin_id))?;
                pin.current_rate = rate;
                pin.locked = pr.locked;
                pin.item = pr.item;
            }
            ids.push(id);
        }

        for (index, link) in record.links.iter().enumerate() {
            let bad = || RecordError::BadLink { link: index };
            let (sn, sp) = link.start;
            let (en, ep) = link.end;
            let start_node = g.node(*ids.get(sn).ok_or_else(bad)?).ok_or_else(bad)?;
            let start = *start_node.outs.get(sp).ok_or_else(bad)?;
            let end_node = g.node(*ids.get(en).ok_or_else(bad)?).ok_or_else(bad)?;
            let end = *end_node.ins.get(ep).ok_or_else(bad)?;
            g.connect(start, end)?;
        }

        debug!(
            nodes = g.node_count(),
            pins = g.pin_count(),
            links = g.link_count(),
            "rebuilt graph from record"
        );
        Ok(g)
    }
}
