use crate::id::*;
use crate::node::{GroupData, Link, Node, NodeKind, NodeTag, Pin};
use crate::rational::{ArithmeticError, Rational};
use crate::recipe::Recipe;
use slotmap::SlotMap;
use std::collections::{HashMap, HashSet};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during graph operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("node not found: {0:?}")]
    NodeNotFound(NodeId),
    #[error("pin not found: {0:?}")]
    PinNotFound(PinId),
    #[error("link not found: {0:?}")]
    LinkNotFound(LinkId),
    #[error("pin {0:?} already has a link")]
    PinAlreadyLinked(PinId),
    #[error("cannot link two pins of the same node {0:?}")]
    SameNode(NodeId),
    #[error("a link needs one output pin and one input pin ({0:?}, {1:?})")]
    DirectionMismatch(PinId, PinId),
    #[error("item mismatch: output carries {output:?}, input expects {input:?}")]
    ItemMismatch { output: ItemId, input: ItemId },
    #[error("node {0:?} has no resizable side")]
    NotResizable(NodeId),
    #[error("pin index {index} out of range on node {node:?}")]
    PinIndexOutOfRange { node: NodeId, index: usize },
    #[error("node {0:?} must keep at least one pin on its resizable side")]
    LastPin(NodeId),
    #[error("node {0:?} is locked")]
    LockedNode(NodeId),
    #[error("node {0:?} is not a group")]
    NotAGroup(NodeId),
    #[error("cannot group an empty node set")]
    EmptyGroup,
    #[error("operation not supported on {kind:?} node {node:?}")]
    UnsupportedKind { node: NodeId, kind: NodeTag },
    #[error(transparent)]
    Arithmetic(#[from] ArithmeticError),
}

// ---------------------------------------------------------------------------
// FlowGraph
// ---------------------------------------------------------------------------

/// Arena-backed production-flow graph.
///
/// Nodes, pins and links live in separate slotmaps and reference each other
/// by key. Every topology change goes through the methods below; the solving
/// pipeline only writes rates and flow tags.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    nodes: SlotMap<NodeId, Node>,
    pins: SlotMap<PinId, Pin>,
    links: SlotMap<LinkId, Link>,
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn pin(&self, id: PinId) -> Option<&Pin> {
        self.pins.get(id)
    }

    pub(crate) fn pin_mut(&mut self, id: PinId) -> Option<&mut Pin> {
        self.pins.get_mut(id)
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id)
    }

    pub(crate) fn link_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter()
    }

    pub fn pins(&self) -> impl Iterator<Item = (PinId, &Pin)> {
        self.pins.iter()
    }

    pub fn links(&self) -> impl Iterator<Item = (LinkId, &Link)> {
        self.links.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// The pin at the other end of `pin`'s link.
    pub fn linked_pin(&self, pin: PinId) -> Option<PinId> {
        let p = self.pins.get(pin)?;
        let link = self.links.get(p.link?)?;
        Some(match p.direction {
            Direction::Input => link.start,
            Direction::Output => link.end,
        })
    }

    pub fn rate(&self, pin: PinId) -> Option<&Rational> {
        self.pins.get(pin).map(|p| &p.current_rate)
    }

    fn require_node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(id).ok_or(GraphError::NodeNotFound(id))
    }

    fn require_pin(&self, id: PinId) -> Result<&Pin, GraphError> {
        self.pins.get(id).ok_or(GraphError::PinNotFound(id))
    }

    // -----------------------------------------------------------------------
    // Node construction
    // -----------------------------------------------------------------------

    fn insert_node(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.insert(Node {
            kind,
            ins: Vec::new(),
            outs: Vec::new(),
        })
    }

    /// Append a pin to `node`. The node must exist.
    fn push_pin(
        &mut self,
        node: NodeId,
        direction: Direction,
        item: Option<ItemId>,
        base_rate: Rational,
        current_rate: Rational,
    ) -> PinId {
        let mut pin = Pin::new(direction, node, item, base_rate);
        pin.current_rate = current_rate;
        let id = self.pins.insert(pin);
        if let Some(n) = self.nodes.get_mut(node) {
            match direction {
                Direction::Input => n.ins.push(id),
                Direction::Output => n.outs.push(id),
            }
        }
        id
    }

    /// Add a Craft node running `recipe` at reference rate 1.
    pub fn add_craft(&mut self, recipe_id: RecipeId, recipe: &Recipe) -> NodeId {
        let id = self.insert_node(NodeKind::Craft {
            recipe: recipe_id,
            rate: Rational::one(),
            output_boost: Rational::one(),
        });
        for entry in &recipe.inputs {
            self.push_pin(id, Direction::Input, Some(entry.item), entry.amount.clone(), entry.amount.clone());
        }
        for entry in &recipe.outputs {
            self.push_pin(id, Direction::Output, Some(entry.item), entry.amount.clone(), entry.amount.clone());
        }
        id
    }

    /// Add a Merger with `inputs` input pins (at least one) and one output.
    pub fn add_merger(&mut self, inputs: usize) -> NodeId {
        let id = self.insert_node(NodeKind::Merger { item: None });
        for _ in 0..inputs.max(1) {
            self.push_pin(id, Direction::Input, None, Rational::one(), Rational::zero());
        }
        self.push_pin(id, Direction::Output, None, Rational::one(), Rational::zero());
        id
    }

    /// Add a CustomSplitter with one input and `outputs` output pins.
    pub fn add_splitter(&mut self, outputs: usize) -> NodeId {
        let id = self.insert_node(NodeKind::CustomSplitter { item: None });
        self.push_pin(id, Direction::Input, None, Rational::one(), Rational::zero());
        for _ in 0..outputs.max(1) {
            self.push_pin(id, Direction::Output, None, Rational::one(), Rational::zero());
        }
        id
    }

    /// Add an even GameSplitter with one input and `outputs` output pins.
    pub fn add_game_splitter(&mut self, outputs: usize) -> NodeId {
        let n = outputs.max(1);
        let id = self.insert_node(NodeKind::GameSplitter {
            item: None,
            rate: Rational::zero(),
        });
        self.push_pin(id, Direction::Input, None, Rational::from_integer(n as i64), Rational::zero());
        for _ in 0..n {
            self.push_pin(id, Direction::Output, None, Rational::one(), Rational::zero());
        }
        id
    }

    /// Add a Sink with `inputs` independent input pins.
    pub fn add_sink(&mut self, inputs: usize) -> NodeId {
        let id = self.insert_node(NodeKind::Sink);
        for _ in 0..inputs.max(1) {
            self.push_pin(id, Direction::Input, None, Rational::one(), Rational::zero());
        }
        id
    }

    /// Add a Group node wrapping `subgraph` at rate 1, with boundary pins
    /// derived from the sub-graph's net item flows.
    pub fn add_group(&mut self, name: &str, subgraph: FlowGraph) -> Result<NodeId, GraphError> {
        let group = GroupData::new(name, subgraph);
        let boundary = group.boundary()?;
        let id = self.insert_node(NodeKind::Group(group));
        for (item, amount) in boundary.inputs {
            self.push_pin(id, Direction::Input, Some(item), amount.clone(), amount);
        }
        for (item, amount) in boundary.outputs {
            self.push_pin(id, Direction::Output, Some(item), amount.clone(), amount);
        }
        Ok(id)
    }

    /// Overwrite one pin's rate without solving. Used when rehydrating a
    /// saved graph and when building fixtures.
    pub fn set_current_rate(&mut self, pin: PinId, rate: Rational) -> Result<(), GraphError> {
        let p = self.pins.get_mut(pin).ok_or(GraphError::PinNotFound(pin))?;
        p.current_rate = rate;
        Ok(())
    }

    /// Overwrite a node's reference rate without solving.
    pub fn set_reference_rate(&mut self, node: NodeId, rate: Rational) -> Result<(), GraphError> {
        let n = self.nodes.get_mut(node).ok_or(GraphError::NodeNotFound(node))?;
        match &mut n.kind {
            NodeKind::Craft { rate: r, .. } | NodeKind::GameSplitter { rate: r, .. } => *r = rate,
            NodeKind::Group(group) => *group = group.rescaled(&rate)?,
            other => {
                return Err(GraphError::UnsupportedKind {
                    node,
                    kind: other.tag(),
                });
            }
        }
        Ok(())
    }

    /// Change a Craft node's output multiplier and refresh its output rates.
    /// Neighbours are not rebalanced; see `Engine::set_output_boost`.
    pub fn set_output_boost(&mut self, node: NodeId, boost: Rational) -> Result<(), GraphError> {
        let n = self.nodes.get_mut(node).ok_or(GraphError::NodeNotFound(node))?;
        let rate = match &mut n.kind {
            NodeKind::Craft {
                rate, output_boost, ..
            } => {
                *output_boost = boost.clone();
                rate.clone()
            }
            other => {
                return Err(GraphError::UnsupportedKind {
                    node,
                    kind: other.tag(),
                });
            }
        };
        let outs = n.outs.clone();
        for pin in outs {
            if let Some(p) = self.pins.get_mut(pin) {
                p.current_rate = p.base_rate.checked_mul(&boost)?.checked_mul(&rate)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    /// Link two pins. Either order is accepted; the output pin becomes the
    /// link start.
    pub fn connect(&mut self, a: PinId, b: PinId) -> Result<LinkId, GraphError> {
        let pa = self.require_pin(a)?;
        let pb = self.require_pin(b)?;
        let (start, end) = match (pa.direction, pb.direction) {
            (Direction::Output, Direction::Input) => (a, b),
            (Direction::Input, Direction::Output) => (b, a),
            _ => return Err(GraphError::DirectionMismatch(a, b)),
        };
        if pa.node == pb.node {
            return Err(GraphError::SameNode(pa.node));
        }
        for (id, pin) in [(a, pa), (b, pb)] {
            if pin.link.is_some() {
                return Err(GraphError::PinAlreadyLinked(id));
            }
        }
        let start_item = self.require_pin(start)?.item;
        let end_item = self.require_pin(end)?.item;
        if let (Some(output), Some(input)) = (start_item, end_item) {
            if output != input {
                return Err(GraphError::ItemMismatch { output, input });
            }
        }

        let link = self.links.insert(Link {
            start,
            end,
            flow: None,
        });
        if let Some(p) = self.pins.get_mut(start) {
            p.link = Some(link);
        }
        if let Some(p) = self.pins.get_mut(end) {
            p.link = Some(link);
        }
        if let Some(item) = start_item.or(end_item) {
            self.adopt_item(start, item);
            self.adopt_item(end, item);
        }
        Ok(link)
    }

    /// Link without checks or item adoption. Both pins must be unlinked.
    fn link_unchecked(&mut self, start: PinId, end: PinId) -> LinkId {
        let link = self.links.insert(Link {
            start,
            end,
            flow: None,
        });
        for pin in [start, end] {
            if let Some(p) = self.pins.get_mut(pin) {
                p.link = Some(link);
            }
        }
        link
    }

    /// Give `item` to an item-less pin. Splitters and mergers take it for all
    /// of their pins, and the adoption spreads through item-less neighbours.
    fn adopt_item(&mut self, pin: PinId, item: ItemId) {
        let mut queue = vec![pin];
        let mut seen = HashSet::new();
        while let Some(pin) = queue.pop() {
            if !seen.insert(pin) {
                continue;
            }
            let Some(p) = self.pins.get(pin) else { continue };
            if p.item.is_some() {
                continue;
            }
            let node_id = p.node;
            let Some(node) = self.nodes.get_mut(node_id) else { continue };
            let touched: Vec<PinId> = match node.kind.tag() {
                NodeTag::CustomSplitter | NodeTag::Merger | NodeTag::GameSplitter => {
                    node.kind.set_organizer_item(Some(item));
                    node.pins().collect()
                }
                NodeTag::Sink => vec![pin],
                NodeTag::Craft | NodeTag::Group => Vec::new(),
            };
            for t in touched {
                if let Some(tp) = self.pins.get_mut(t) {
                    tp.item = Some(item);
                }
                if let Some(other) = self.linked_pin(t) {
                    queue.push(other);
                }
            }
        }
    }

    /// Remove a link and clear both endpoints.
    ///
    /// A sink input drops back to rate 0 and forgets its item. A splitter or
    /// merger with no remaining links forgets its item.
    pub fn disconnect(&mut self, link: LinkId) -> Result<(), GraphError> {
        let removed = self.links.remove(link).ok_or(GraphError::LinkNotFound(link))?;
        for pin in [removed.start, removed.end] {
            let Some(p) = self.pins.get_mut(pin) else { continue };
            p.link = None;
            let node_id = p.node;
            let Some(node) = self.nodes.get_mut(node_id) else { continue };
            match node.kind.tag() {
                NodeTag::Sink => {
                    if let Some(p) = self.pins.get_mut(pin) {
                        p.current_rate = Rational::zero();
                        p.item = None;
                    }
                }
                NodeTag::CustomSplitter | NodeTag::Merger | NodeTag::GameSplitter => {
                    let pins: Vec<PinId> = node.pins().collect();
                    let any_linked = pins
                        .iter()
                        .any(|id| self.pins.get(*id).is_some_and(|p| p.link.is_some()));
                    if !any_linked {
                        node.kind.set_organizer_item(None);
                        for id in pins {
                            if let Some(p) = self.pins.get_mut(id) {
                                p.item = None;
                            }
                        }
                    }
                }
                NodeTag::Craft | NodeTag::Group => {}
            }
        }
        Ok(())
    }

    /// Disconnect every link of `node`, then delete it and its pins.
    pub fn remove_node(&mut self, node: NodeId) -> Result<Node, GraphError> {
        let pins: Vec<PinId> = self.require_node(node)?.pins().collect();
        for pin in &pins {
            if let Some(link) = self.pins.get(*pin).and_then(|p| p.link) {
                self.disconnect(link)?;
            }
        }
        for pin in pins {
            self.pins.remove(pin);
        }
        self.nodes.remove(node).ok_or(GraphError::NodeNotFound(node))
    }

    /// Clear every link's flow annotation.
    pub fn clear_flows(&mut self) {
        for (_, link) in self.links.iter_mut() {
            link.flow = None;
        }
    }

    // -----------------------------------------------------------------------
    // Resizing
    // -----------------------------------------------------------------------

    fn resizable_side(&self, node: NodeId) -> Result<Direction, GraphError> {
        match self.require_node(node)?.kind {
            NodeKind::Merger { .. } | NodeKind::Sink => Ok(Direction::Input),
            NodeKind::CustomSplitter { .. } | NodeKind::GameSplitter { .. } => Ok(Direction::Output),
            _ => Err(GraphError::NotResizable(node)),
        }
    }

    /// Append a pin on the resizable side of a Merger, CustomSplitter,
    /// GameSplitter or Sink. The new pin starts at rate 0.
    ///
    /// Merger/CustomSplitter pins start with the single pin's lock state.
    /// A locked GameSplitter cannot be resized.
    pub fn add_multi_pin(&mut self, node: NodeId) -> Result<PinId, GraphError> {
        let side = self.resizable_side(node)?;
        let n = self.require_node(node)?;
        let item = n.kind.organizer_item();
        let locked = match &n.kind {
            NodeKind::Merger { .. } | NodeKind::CustomSplitter { .. } => n
                .single_pin()
                .and_then(|p| self.pins.get(p))
                .is_some_and(|p| p.locked),
            NodeKind::GameSplitter { .. } => {
                if n.pins().any(|p| self.pins.get(p).is_some_and(|p| p.locked)) {
                    return Err(GraphError::LockedNode(node));
                }
                false
            }
            _ => false,
        };
        let id = self.push_pin(node, side, item, Rational::one(), Rational::zero());
        if let Some(p) = self.pins.get_mut(id) {
            p.locked = locked;
        }
        self.refresh_game_splitter_base(node);
        Ok(id)
    }

    /// Remove the pin at `index` on the resizable side, deleting its link
    /// first. At least one pin must remain.
    pub fn remove_multi_pin(&mut self, node: NodeId, index: usize) -> Result<(), GraphError> {
        let side = self.resizable_side(node)?;
        let n = self.require_node(node)?;
        if matches!(n.kind, NodeKind::GameSplitter { .. })
            && n.pins().any(|p| self.pins.get(p).is_some_and(|p| p.locked))
        {
            return Err(GraphError::LockedNode(node));
        }
        let list = match side {
            Direction::Input => &n.ins,
            Direction::Output => &n.outs,
        };
        let pin = *list
            .get(index)
            .ok_or(GraphError::PinIndexOutOfRange { node, index })?;
        if list.len() <= 1 {
            return Err(GraphError::LastPin(node));
        }
        if let Some(link) = self.pins.get(pin).and_then(|p| p.link) {
            self.disconnect(link)?;
        }
        if let Some(n) = self.nodes.get_mut(node) {
            match side {
                Direction::Input => n.ins.remove(index),
                Direction::Output => n.outs.remove(index),
            };
        }
        self.pins.remove(pin);
        self.refresh_game_splitter_base(node);
        Ok(())
    }

    /// Keep a GameSplitter's input coefficient equal to its output count.
    fn refresh_game_splitter_base(&mut self, node: NodeId) {
        let Some(n) = self.nodes.get(node) else { return };
        if !matches!(n.kind, NodeKind::GameSplitter { .. }) {
            return;
        }
        let count = n.outs.len() as i64;
        if let Some(p) = n.ins.first().and_then(|id| self.pins.get_mut(*id)) {
            p.base_rate = Rational::from_integer(count);
        }
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    /// Lock or unlock a pin, keeping the owning node's lock state valid.
    ///
    /// Lock changes cross links. Craft, Group and GameSplitter pins lock
    /// together. On a Merger or CustomSplitter, a fully determined node locks
    /// completely and a node that could no longer rebalance is unlocked.
    pub fn set_locked(&mut self, pin: PinId, locked: bool) -> Result<(), GraphError> {
        self.require_pin(pin)?;
        self.set_locked_inner(pin, locked);
        Ok(())
    }

    fn is_locked(&self, pin: PinId) -> bool {
        self.pins.get(pin).is_some_and(|p| p.locked)
    }

    fn set_locked_inner(&mut self, pin_id: PinId, b: bool) {
        let Some(pin) = self.pins.get_mut(pin_id) else { return };
        if pin.locked == b {
            return;
        }
        pin.locked = b;
        let node_id = pin.node;

        if let Some(other) = self.linked_pin(pin_id) {
            self.set_locked_inner(other, b);
        }

        let Some(node) = self.nodes.get(node_id) else { return };
        match node.kind.tag() {
            NodeTag::Craft | NodeTag::Group | NodeTag::GameSplitter => {
                let all: Vec<PinId> = node.pins().collect();
                for p in all {
                    self.set_locked_inner(p, b);
                }
            }
            NodeTag::Merger | NodeTag::CustomSplitter => {
                let Some(single) = node.single_pin() else { return };
                let multi = node.multi_pins().to_vec();
                let unlocked: Vec<PinId> = multi.iter().copied().filter(|p| !self.is_locked(*p)).collect();
                if pin_id == single {
                    if b && unlocked.len() == 1 {
                        self.set_locked_inner(unlocked[0], b);
                    }
                    if !b && unlocked.is_empty() {
                        for p in multi {
                            self.set_locked_inner(p, b);
                        }
                    }
                } else {
                    let single_locked = self.is_locked(single);
                    if unlocked.is_empty() {
                        self.set_locked_inner(single, true);
                    } else if single_locked && unlocked.len() == 1 {
                        // Locking leaves one free pin, which is now determined.
                        // Unlocking the only free pin frees the single pin too.
                        let target = if b { unlocked[0] } else { single };
                        self.set_locked_inner(target, b);
                    }
                }
            }
            NodeTag::Sink => {}
        }
    }

    // -----------------------------------------------------------------------
    // Balance
    // -----------------------------------------------------------------------

    /// Whether a splitter or merger conserves flow. A GameSplitter must
    /// additionally split evenly.
    pub fn is_balanced(&self, node: NodeId) -> Result<bool, GraphError> {
        let n = self.require_node(node)?;
        match n.kind {
            NodeKind::Merger { .. } | NodeKind::CustomSplitter { .. } | NodeKind::GameSplitter { .. } => {}
            ref other => {
                return Err(GraphError::UnsupportedKind {
                    node,
                    kind: other.tag(),
                });
            }
        }
        let sum = |ids: &[PinId]| -> Result<Rational, GraphError> {
            let mut total = Rational::zero();
            for id in ids {
                total = total.checked_add(&self.require_pin(*id)?.current_rate)?;
            }
            Ok(total)
        };
        if sum(&n.ins)? != sum(&n.outs)? {
            return Ok(false);
        }
        if matches!(n.kind, NodeKind::GameSplitter { .. }) {
            let mut rates = n.outs.iter().filter_map(|id| self.pins.get(*id)).map(|p| &p.current_rate);
            if let Some(first) = rates.next() {
                return Ok(rates.all(|r| r == first));
            }
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Grouping
    // -----------------------------------------------------------------------

    /// Copy `node` from `src` into this graph without links. Records the
    /// old-to-new pin mapping.
    fn import_node(
        &mut self,
        src: &FlowGraph,
        node: NodeId,
        pin_map: &mut HashMap<PinId, PinId>,
    ) -> Result<NodeId, GraphError> {
        let copied = src.require_node(node)?;
        let id = self.insert_node(copied.kind.clone());
        for old in copied.pins() {
            let p = src.require_pin(old)?;
            let new = self.push_pin(id, p.direction, p.item, p.base_rate.clone(), p.current_rate.clone());
            if let Some(np) = self.pins.get_mut(new) {
                np.locked = p.locked;
            }
            pin_map.insert(old, new);
        }
        Ok(id)
    }

    /// Recreate every link of `src` whose endpoints were both imported.
    fn import_links(&mut self, src: &FlowGraph, pin_map: &HashMap<PinId, PinId>) {
        for (_, link) in src.links() {
            if let (Some(&start), Some(&end)) = (pin_map.get(&link.start), pin_map.get(&link.end)) {
                self.link_unchecked(start, end);
            }
        }
    }

    /// Move `ids` and the links among them into a new Group node. Links to
    /// nodes outside the set are removed.
    pub fn group_nodes(&mut self, ids: &[NodeId], name: &str) -> Result<NodeId, GraphError> {
        if ids.is_empty() {
            return Err(GraphError::EmptyGroup);
        }
        let mut unique = Vec::with_capacity(ids.len());
        let mut seen = HashSet::new();
        for &id in ids {
            self.require_node(id)?;
            if seen.insert(id) {
                unique.push(id);
            }
        }
        let mut sub = FlowGraph::new();
        let mut pin_map = HashMap::new();
        for &id in &unique {
            sub.import_node(self, id, &mut pin_map)?;
        }
        sub.import_links(self, &pin_map);
        for &id in &unique {
            self.remove_node(id)?;
        }
        self.add_group(name, sub)
    }

    /// Dissolve a Group node back into this graph at its current rate.
    /// Returns the new ids of the former sub-nodes.
    pub fn ungroup(&mut self, node: NodeId) -> Result<Vec<NodeId>, GraphError> {
        if !matches!(self.require_node(node)?.kind, NodeKind::Group(_)) {
            return Err(GraphError::NotAGroup(node));
        }
        let removed = self.remove_node(node)?;
        let NodeKind::Group(group) = removed.kind else {
            return Err(GraphError::NotAGroup(node));
        };
        let sub = group.subgraph;
        let mut pin_map = HashMap::new();
        let mut created = Vec::with_capacity(sub.node_count());
        for (id, _) in sub.nodes() {
            created.push(self.import_node(&sub, id, &mut pin_map)?);
        }
        self.import_links(&sub, &pin_map);
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rational::ratio;
    use crate::test_utils::*;

    // -----------------------------------------------------------------------
    // Test 1: craft pins follow the recipe
    // -----------------------------------------------------------------------
    #[test]
    fn add_craft_creates_recipe_pins() {
        let mut g = FlowGraph::new();
        let (id, recipe) = constructor_recipe();
        let n = g.add_craft(id, &recipe);
        let node = g.node(n).unwrap();
        assert_eq!(node.ins.len(), 1);
        assert_eq!(node.outs.len(), 1);
        let out = g.pin(node.outs[0]).unwrap();
        assert_eq!(out.item, Some(ItemId(2)));
        assert_eq!(out.current_rate, ratio(20, 1));
        assert_eq!(out.node, n);
    }

    // -----------------------------------------------------------------------
    // Test 2: connect normalizes order and rejects bad pairs
    // -----------------------------------------------------------------------
    #[test]
    fn connect_normalizes_order() {
        let mut g = FlowGraph::new();
        let m = g.add_merger(2);
        let s = g.add_sink(1);
        let out = g.node(m).unwrap().outs[0];
        let sink_in = g.node(s).unwrap().ins[0];
        let link = g.connect(sink_in, out).unwrap();
        let l = g.link(link).unwrap();
        assert_eq!((l.start, l.end), (out, sink_in));
        assert_eq!(g.pin(out).unwrap().link, Some(link));
        assert_eq!(g.linked_pin(sink_in), Some(out));
    }

    #[test]
    fn connect_rejects_invalid_pairs() {
        let mut g = FlowGraph::new();
        let m = g.add_merger(2);
        let s = g.add_sink(2);
        let node = g.node(m).unwrap().clone();
        let sink = g.node(s).unwrap().clone();
        assert_eq!(
            g.connect(node.ins[0], sink.ins[0]),
            Err(GraphError::DirectionMismatch(node.ins[0], sink.ins[0]))
        );
        assert_eq!(g.connect(node.outs[0], node.ins[0]), Err(GraphError::SameNode(m)));
        g.connect(node.outs[0], sink.ins[0]).unwrap();
        assert_eq!(
            g.connect(node.outs[0], sink.ins[1]),
            Err(GraphError::PinAlreadyLinked(node.outs[0]))
        );
    }

    #[test]
    fn connect_rejects_item_mismatch() {
        let mut g = FlowGraph::new();
        let (sid, smelt) = smelter_recipe();
        let (cid, ctor) = constructor_recipe();
        let a = g.add_craft(sid, &smelt);
        let b = g.add_craft(cid, &ctor);
        let ingot_out = g.node(a).unwrap().outs[0];
        let ore_in = g.node(a).unwrap().ins[0];
        let plate_out = g.node(b).unwrap().outs[0];
        assert_eq!(
            g.connect(plate_out, ore_in),
            Err(GraphError::ItemMismatch {
                output: ItemId(2),
                input: ItemId(0)
            })
        );
        let ingot_in = g.node(b).unwrap().ins[0];
        assert!(g.connect(ingot_out, ingot_in).is_ok());
    }

    // -----------------------------------------------------------------------
    // Test 3: item adoption and forgetting
    // -----------------------------------------------------------------------
    #[test]
    fn organizers_adopt_and_forget_items() {
        let mut g = FlowGraph::new();
        let (sid, smelt) = smelter_recipe();
        let craft = g.add_craft(sid, &smelt);
        let m = g.add_merger(2);
        let s = g.add_splitter(2);
        let ingot_out = g.node(craft).unwrap().outs[0];
        let m_node = g.node(m).unwrap().clone();
        let s_in = g.node(s).unwrap().ins[0];
        // splitter -> merger chain first, both item-less.
        let inner = g.connect(m_node.outs[0], s_in).unwrap();
        assert_eq!(g.node(s).unwrap().kind.organizer_item(), None);
        let outer = g.connect(ingot_out, m_node.ins[0]).unwrap();
        assert_eq!(g.node(m).unwrap().kind.organizer_item(), Some(ItemId(1)));
        assert_eq!(g.node(s).unwrap().kind.organizer_item(), Some(ItemId(1)));
        assert_eq!(g.pin(m_node.ins[1]).unwrap().item, Some(ItemId(1)));

        g.disconnect(outer).unwrap();
        // merger still linked to splitter, keeps its item
        assert_eq!(g.node(m).unwrap().kind.organizer_item(), Some(ItemId(1)));
        g.disconnect(inner).unwrap();
        assert_eq!(g.node(m).unwrap().kind.organizer_item(), None);
        assert_eq!(g.pin(m_node.ins[0]).unwrap().item, None);
    }

    #[test]
    fn disconnect_resets_sink_input() {
        let mut g = FlowGraph::new();
        let (sid, smelt) = smelter_recipe();
        let craft = g.add_craft(sid, &smelt);
        let sink = g.add_sink(1);
        let out = g.node(craft).unwrap().outs[0];
        let sink_in = g.node(sink).unwrap().ins[0];
        let link = g.connect(out, sink_in).unwrap();
        assert_eq!(g.pin(sink_in).unwrap().item, Some(ItemId(1)));
        g.set_current_rate(sink_in, ratio(30, 1)).unwrap();
        g.disconnect(link).unwrap();
        let p = g.pin(sink_in).unwrap();
        assert!(p.current_rate.is_zero());
        assert_eq!(p.item, None);
        assert!(p.link.is_none());
        assert_eq!(g.disconnect(link), Err(GraphError::LinkNotFound(link)));
    }

    // -----------------------------------------------------------------------
    // Test 4: remove node drops its links and pins
    // -----------------------------------------------------------------------
    #[test]
    fn remove_node_cleans_up() {
        let mut g = FlowGraph::new();
        let m = g.add_merger(2);
        let s = g.add_sink(1);
        let out = g.node(m).unwrap().outs[0];
        let sink_in = g.node(s).unwrap().ins[0];
        g.connect(out, sink_in).unwrap();
        g.remove_node(m).unwrap();
        assert_eq!(g.node_count(), 1);
        assert_eq!(g.pin_count(), 1);
        assert_eq!(g.link_count(), 0);
        assert!(g.pin(sink_in).unwrap().link.is_none());
        assert!(matches!(g.remove_node(m), Err(GraphError::NodeNotFound(_))));
    }

    // -----------------------------------------------------------------------
    // Test 5: resizing
    // -----------------------------------------------------------------------
    #[test]
    fn resize_merger_and_limits() {
        let mut g = FlowGraph::new();
        let m = g.add_merger(1);
        let out = g.node(m).unwrap().outs[0];
        g.set_locked(out, true).unwrap();
        let added = g.add_multi_pin(m).unwrap();
        assert_eq!(g.node(m).unwrap().ins.len(), 2);
        assert!(g.pin(added).unwrap().locked, "new pin copies the single pin's lock");
        g.remove_multi_pin(m, 1).unwrap();
        assert!(g.pin(added).is_none());
        assert_eq!(g.remove_multi_pin(m, 0), Err(GraphError::LastPin(m)));
        assert_eq!(
            g.remove_multi_pin(m, 5),
            Err(GraphError::PinIndexOutOfRange { node: m, index: 5 })
        );
    }

    #[test]
    fn resize_game_splitter_updates_input_coefficient() {
        let mut g = FlowGraph::new();
        let gs = g.add_game_splitter(2);
        let input = g.node(gs).unwrap().ins[0];
        g.add_multi_pin(gs).unwrap();
        assert_eq!(g.pin(input).unwrap().base_rate, Rational::from_integer(3));
        g.remove_multi_pin(gs, 0).unwrap();
        assert_eq!(g.pin(input).unwrap().base_rate, Rational::from_integer(2));
        g.set_locked(input, true).unwrap();
        assert_eq!(g.add_multi_pin(gs), Err(GraphError::LockedNode(gs)));
    }

    #[test]
    fn resize_rejects_craft() {
        let mut g = FlowGraph::new();
        let (sid, smelt) = smelter_recipe();
        let c = g.add_craft(sid, &smelt);
        assert_eq!(g.add_multi_pin(c), Err(GraphError::NotResizable(c)));
    }

    #[test]
    fn removing_linked_multi_pin_deletes_link() {
        let mut g = FlowGraph::new();
        let s = g.add_splitter(2);
        let sink = g.add_sink(1);
        let s_out = g.node(s).unwrap().outs[1];
        let sink_in = g.node(sink).unwrap().ins[0];
        g.connect(s_out, sink_in).unwrap();
        g.remove_multi_pin(s, 1).unwrap();
        assert_eq!(g.link_count(), 0);
        assert!(g.pin(sink_in).unwrap().link.is_none());
    }

    // -----------------------------------------------------------------------
    // Test 6: lock propagation
    // -----------------------------------------------------------------------
    #[test]
    fn locking_craft_pin_locks_node_and_neighbour() {
        let mut g = FlowGraph::new();
        let (sid, smelt) = smelter_recipe();
        let craft = g.add_craft(sid, &smelt);
        let sink = g.add_sink(1);
        let c = g.node(craft).unwrap().clone();
        let sink_in = g.node(sink).unwrap().ins[0];
        g.connect(c.outs[0], sink_in).unwrap();
        g.set_locked(c.ins[0], true).unwrap();
        assert!(g.pin(c.outs[0]).unwrap().locked);
        assert!(g.pin(sink_in).unwrap().locked);
        g.set_locked(sink_in, false).unwrap();
        assert!(!g.pin(c.ins[0]).unwrap().locked);
    }

    #[test]
    fn locking_last_free_multi_pin_locks_single() {
        let mut g = FlowGraph::new();
        let m = g.add_merger(2);
        let n = g.node(m).unwrap().clone();
        g.set_locked(n.ins[0], true).unwrap();
        assert!(!g.pin(n.outs[0]).unwrap().locked);
        g.set_locked(n.ins[1], true).unwrap();
        assert!(g.pin(n.outs[0]).unwrap().locked);
    }

    #[test]
    fn locking_single_with_one_free_multi_locks_it() {
        let mut g = FlowGraph::new();
        let s = g.add_splitter(2);
        let n = g.node(s).unwrap().clone();
        g.set_locked(n.outs[0], true).unwrap();
        g.set_locked(n.ins[0], true).unwrap();
        assert!(g.pin(n.outs[1]).unwrap().locked);
    }

    #[test]
    fn unlocking_any_pin_of_fully_locked_organizer_frees_it() {
        let mut g = FlowGraph::new();
        let m = g.add_merger(2);
        let n = g.node(m).unwrap().clone();
        g.set_locked(n.ins[0], true).unwrap();
        g.set_locked(n.ins[1], true).unwrap();
        g.set_locked(n.outs[0], false).unwrap();
        assert!(n.pins().all(|p| !g.pin(p).unwrap().locked));

        g.set_locked(n.ins[0], true).unwrap();
        g.set_locked(n.ins[1], true).unwrap();
        g.set_locked(n.ins[1], false).unwrap();
        assert!(!g.pin(n.outs[0]).unwrap().locked);
        assert!(g.pin(n.ins[0]).unwrap().locked);
    }

    // -----------------------------------------------------------------------
    // Test 7: balance check
    // -----------------------------------------------------------------------
    #[test]
    fn balance_check() {
        let mut g = FlowGraph::new();
        let m = g.add_merger(2);
        let n = g.node(m).unwrap().clone();
        assert!(g.is_balanced(m).unwrap());
        g.set_current_rate(n.ins[0], ratio(2, 1)).unwrap();
        assert!(!g.is_balanced(m).unwrap());
        g.set_current_rate(n.outs[0], ratio(2, 1)).unwrap();
        assert!(g.is_balanced(m).unwrap());

        let gs = g.add_game_splitter(2);
        let n = g.node(gs).unwrap().clone();
        g.set_current_rate(n.ins[0], ratio(4, 1)).unwrap();
        g.set_current_rate(n.outs[0], ratio(3, 1)).unwrap();
        g.set_current_rate(n.outs[1], ratio(1, 1)).unwrap();
        assert!(!g.is_balanced(gs).unwrap());

        let sink = g.add_sink(1);
        assert!(matches!(g.is_balanced(sink), Err(GraphError::UnsupportedKind { .. })));
    }

    // -----------------------------------------------------------------------
    // Test 8: group and ungroup
    // -----------------------------------------------------------------------
    #[test]
    fn group_then_ungroup_round_trips_topology() {
        let mut g = FlowGraph::new();
        let (sid, smelt) = smelter_recipe();
        let (cid, ctor) = constructor_recipe();
        let a = g.add_craft(sid, &smelt);
        let b = g.add_craft(cid, &ctor);
        let sink = g.add_sink(1);
        let a_out = g.node(a).unwrap().outs[0];
        let b_in = g.node(b).unwrap().ins[0];
        let b_out = g.node(b).unwrap().outs[0];
        let sink_in = g.node(sink).unwrap().ins[0];
        g.connect(a_out, b_in).unwrap();
        g.connect(b_out, sink_in).unwrap();

        let group = g.group_nodes(&[a, b], "plates").unwrap();
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.link_count(), 0, "external link removed");
        let gnode = g.node(group).unwrap();
        assert_eq!(gnode.ins.len(), 1);
        assert_eq!(gnode.outs.len(), 1);
        assert_eq!(g.pin(gnode.ins[0]).unwrap().base_rate, ratio(30, 1));
        match &gnode.kind {
            NodeKind::Group(data) => {
                assert_eq!(data.subgraph.node_count(), 2);
                assert_eq!(data.subgraph.link_count(), 1);
            }
            other => panic!("expected group, got {other:?}"),
        }

        let restored = g.ungroup(group).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(g.node_count(), 3);
        assert_eq!(g.link_count(), 1);
        assert!(matches!(g.ungroup(sink), Err(GraphError::NotAGroup(_))));
        assert_eq!(g.group_nodes(&[], "x"), Err(GraphError::EmptyGroup));
    }

    #[test]
    fn set_output_boost_scales_outputs() {
        let mut g = FlowGraph::new();
        let (sid, smelt) = smelter_recipe();
        let c = g.add_craft(sid, &smelt);
        let out = g.node(c).unwrap().outs[0];
        g.set_output_boost(c, ratio(3, 2)).unwrap();
        assert_eq!(g.pin(out).unwrap().current_rate, ratio(45, 1));
        let sink = g.add_sink(1);
        assert!(matches!(
            g.set_output_boost(sink, Rational::one()),
            Err(GraphError::UnsupportedKind { .. })
        ));
    }
}
