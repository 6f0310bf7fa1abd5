//! The rate-balancing engine: owns the flow graph and runs the solving
//! pipeline for each edit.
//!
//! # Pipeline
//!
//! Each [`Engine::solve`] call runs:
//! 1. **Collect** -- find the pins the edit can affect ([`relevant::collect`]).
//! 2. **Build** -- turn their constraints into a linear system ([`equation::build`]).
//! 3. **Solve** -- exact Gaussian elimination ([`solver::solve`]), then the
//!    negative-rate check.
//! 4. **Apply** -- commit rates and flow annotations ([`apply::apply`]), then
//!    notify the registered [`RateHook`]s.
//!
//! Any failure returns before step 4 touches the graph. Operations that
//! change topology and then rebalance (resize, connect, output boost) run on
//! a copy of the graph that replaces the live one only when the follow-up
//! solve succeeds.

use crate::apply::{self, SolveReport};
use crate::config::SolverConfig;
use crate::equation;
use crate::graph::{FlowGraph, GraphError};
use crate::hook::RateHook;
use crate::id::*;
use crate::node::NodeTag;
use crate::rational::Rational;
use crate::relevant;
use crate::solver;
use tracing::{debug, info, warn};

pub use crate::solver::SolveError;

/// Resize request for [`Engine::resize_multi_pin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOp {
    /// Append a pin on the resizable side.
    Add,
    /// Remove the pin at this index on the resizable side.
    Remove(usize),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Engine {
    graph: FlowGraph,
    config: SolverConfig,
    hooks: Vec<Box<dyn RateHook>>,
}

impl Engine {
    pub fn new(graph: FlowGraph) -> Self {
        Self::with_config(graph, SolverConfig::default())
    }

    pub fn with_config(graph: FlowGraph, config: SolverConfig) -> Self {
        Self {
            graph,
            config,
            hooks: Vec::new(),
        }
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    /// Raw graph access for construction. Edits made here are not
    /// rebalanced.
    pub fn graph_mut(&mut self) -> &mut FlowGraph {
        &mut self.graph
    }

    pub fn into_graph(self) -> FlowGraph {
        self.graph
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SolverConfig) {
        self.config = config;
    }

    // -----------------------------------------------------------------------
    // Hooks
    // -----------------------------------------------------------------------

    pub fn register_hook(&mut self, mut hook: Box<dyn RateHook>) {
        hook.on_graph_rebuilt(&self.graph);
        self.hooks.push(hook);
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// First registered hook of type `T`.
    pub fn hook<T: 'static>(&self) -> Option<&T> {
        self.hooks.iter().find_map(|h| h.as_any().downcast_ref::<T>())
    }

    fn notify(&mut self, report: &SolveReport) {
        for hook in &mut self.hooks {
            for change in &report.nodes {
                hook.on_rate_changed(&self.graph, change);
            }
        }
    }

    fn notify_rebuilt(&mut self) {
        for hook in &mut self.hooks {
            hook.on_graph_rebuilt(&self.graph);
        }
    }

    // -----------------------------------------------------------------------
    // Solving
    // -----------------------------------------------------------------------

    /// Set `pin` to `value` and rebalance everything it affects.
    pub fn solve(&mut self, pin: PinId, value: Rational) -> Result<SolveReport, SolveError> {
        let report = run(&mut self.graph, &self.config, pin, &value)?;
        self.notify(&report);
        Ok(report)
    }

    /// Like [`solve`](Self::solve), with the value given as an arithmetic
    /// expression such as `"60 / 4.5"`.
    pub fn solve_expr(&mut self, pin: PinId, expr: &str) -> Result<SolveReport, SolveError> {
        let value = Rational::evaluate(expr).inspect_err(|e| {
            warn!(input = expr, error = %e, "rejected rate input");
        })?;
        self.solve(pin, value)
    }

    /// Set the reference rate of a Craft, Group or GameSplitter node by
    /// editing its first pin with a non-zero coefficient.
    pub fn set_node_rate(&mut self, node: NodeId, rate: Rational) -> Result<SolveReport, SolveError> {
        let n = self.graph.node(node).ok_or(GraphError::NodeNotFound(node))?;
        if !n.kind.has_reference_rate() {
            return Err(GraphError::UnsupportedKind {
                node,
                kind: n.kind.tag(),
            }
            .into());
        }
        let mut target = None;
        for pin_id in n.pins() {
            let pin = self.graph.pin(pin_id).ok_or(GraphError::PinNotFound(pin_id))?;
            let coef = n.coefficient(pin)?;
            if !coef.is_zero() {
                target = Some((pin_id, coef.checked_mul(&rate)?));
                break;
            }
        }
        let Some((pin, value)) = target else {
            return Err(SolveError::Infeasible {
                negative: Vec::new(),
            });
        };
        self.solve(pin, value)
    }

    // -----------------------------------------------------------------------
    // Topology edits
    // -----------------------------------------------------------------------

    /// Run `edit` on a copy of the graph and swap it in on success.
    fn transact<T>(
        &mut self,
        edit: impl FnOnce(&mut FlowGraph, &SolverConfig) -> Result<T, SolveError>,
    ) -> Result<T, SolveError> {
        let mut next = self.graph.clone();
        let out = edit(&mut next, &self.config)?;
        self.graph = next;
        Ok(out)
    }

    /// Add or remove a pin on a resizable node and keep the graph balanced.
    ///
    /// - Merger/CustomSplitter: a new pin starts at 0, so nothing moves.
    ///   Removing a pin re-solves with the single pin set to the sum of the
    ///   remaining multi pins.
    /// - GameSplitter: re-solves with the input held, so every output
    ///   becomes input / N.
    /// - Sink: inputs are independent; no solve.
    pub fn resize_multi_pin(&mut self, node: NodeId, op: ResizeOp) -> Result<Option<SolveReport>, SolveError> {
        let tag = self
            .graph
            .node(node)
            .ok_or(GraphError::NodeNotFound(node))?
            .kind
            .tag();
        let report = self.transact(|g, config| {
            match op {
                ResizeOp::Add => {
                    g.add_multi_pin(node)?;
                }
                ResizeOp::Remove(index) => g.remove_multi_pin(node, index)?,
            }
            let n = g.node(node).ok_or(GraphError::NodeNotFound(node))?;
            match (tag, op) {
                (NodeTag::Merger | NodeTag::CustomSplitter, ResizeOp::Remove(_)) => {
                    let single = n.single_pin().ok_or(GraphError::NotResizable(node))?;
                    let mut sum = Rational::zero();
                    for pin in n.multi_pins() {
                        let rate = g.rate(*pin).ok_or(GraphError::PinNotFound(*pin))?;
                        sum = sum.checked_add(rate)?;
                    }
                    run(g, config, single, &sum).map(Some)
                }
                (NodeTag::GameSplitter, _) => {
                    let input = *n.ins.first().ok_or(GraphError::NotResizable(node))?;
                    let rate = g.rate(input).ok_or(GraphError::PinNotFound(input))?.clone();
                    run(g, config, input, &rate).map(Some)
                }
                _ => Ok(None),
            }
        });
        match &report {
            Ok(_) => debug!(?node, ?op, "resized node"),
            Err(e) => warn!(?node, ?op, kind = e.kind(), "resize rolled back"),
        }
        let report = report?;
        if let Some(r) = &report {
            self.notify(r);
        }
        Ok(report)
    }

    /// Lock or unlock a pin. See [`FlowGraph::set_locked`] for how the lock
    /// spreads.
    pub fn set_locked(&mut self, pin: PinId, locked: bool) -> Result<(), SolveError> {
        self.graph.set_locked(pin, locked)?;
        Ok(())
    }

    /// Link two pins (either order). When their rates differ, the input
    /// side is rebalanced to the output pin's rate; if that fails the link
    /// is not created.
    pub fn connect(&mut self, a: PinId, b: PinId) -> Result<(LinkId, Option<SolveReport>), SolveError> {
        let result = self.transact(|g, config| {
            let link_id = g.connect(a, b)?;
            let link = g.link(link_id).ok_or(GraphError::LinkNotFound(link_id))?;
            let (start, end) = (link.start, link.end);
            let start_rate = g.rate(start).ok_or(GraphError::PinNotFound(start))?.clone();
            let end_rate = g.rate(end).ok_or(GraphError::PinNotFound(end))?;
            if start_rate == *end_rate {
                return Ok((link_id, None));
            }
            let report = run(g, config, start, &start_rate)?;
            Ok((link_id, Some(report)))
        });
        if let Err(e) = &result {
            warn!(?a, ?b, kind = e.kind(), "connect rolled back");
        }
        let (link, report) = result?;
        if let Some(r) = &report {
            self.notify(r);
        }
        Ok((link, report))
    }

    pub fn disconnect(&mut self, link: LinkId) -> Result<(), SolveError> {
        self.graph.disconnect(link)?;
        Ok(())
    }

    /// Disconnect and delete a node. Neighbours keep their rates.
    pub fn remove_node(&mut self, node: NodeId) -> Result<(), SolveError> {
        self.graph.remove_node(node)?;
        for hook in &mut self.hooks {
            hook.on_node_removed(node);
        }
        Ok(())
    }

    /// Change a Craft node's output multiplier, keep its inputs as they are
    /// and push the new output rates downstream.
    pub fn set_output_boost(&mut self, node: NodeId, boost: Rational) -> Result<SolveReport, SolveError> {
        let report = self.transact(|g, config| {
            g.set_output_boost(node, boost)?;
            let n = g.node(node).ok_or(GraphError::NodeNotFound(node))?;
            let anchor = n
                .ins
                .first()
                .or(n.outs.first())
                .copied()
                .ok_or(GraphError::NodeNotFound(node))?;
            let rate = g.rate(anchor).ok_or(GraphError::PinNotFound(anchor))?.clone();
            run(g, config, anchor, &rate)
        })?;
        self.notify(&report);
        Ok(report)
    }

    /// Move `nodes` into a new Group node.
    pub fn group_nodes(&mut self, nodes: &[NodeId], name: &str) -> Result<NodeId, SolveError> {
        let group = self.graph.group_nodes(nodes, name)?;
        info!(?group, members = nodes.len(), name, "grouped nodes");
        self.notify_rebuilt();
        Ok(group)
    }

    /// Dissolve a Group node back into the graph.
    pub fn ungroup(&mut self, node: NodeId) -> Result<Vec<NodeId>, SolveError> {
        let nodes = self.graph.ungroup(node)?;
        info!(?node, restored = nodes.len(), "ungrouped node");
        self.notify_rebuilt();
        Ok(nodes)
    }
}

/// One full pass: collect, build, solve, check, apply.
fn run(graph: &mut FlowGraph, config: &SolverConfig, pin: PinId, value: &Rational) -> Result<SolveReport, SolveError> {
    debug!(?pin, target = %config.format_rate(value), "solve requested");
    let result = relevant::collect(graph, pin, config.iteration_cap_factor)
        .and_then(|set| {
            let system = equation::build(graph, &set, pin, value)?;
            let values = solver::solve(&system)?;
            if config.reject_negative {
                solver::check_non_negative(&system, &values)?;
            }
            Ok((set, system, values))
        })
        .and_then(|(set, system, values)| apply::apply(graph, &set, &system, &values, config.annotate_flow));
    match &result {
        Ok(report) => info!(
            ?pin,
            target = %config.format_rate(value),
            changed = report.changed.len(),
            nodes = report.nodes.len(),
            "solve committed"
        ),
        Err(e) => warn!(?pin, kind = e.kind(), error = %e, "solve aborted"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::MachineTally;
    use crate::rational::ratio;
    use crate::test_utils::*;

    // -----------------------------------------------------------------------
    // Test 1: failed solve leaves the graph untouched
    // -----------------------------------------------------------------------
    #[test]
    fn failed_solve_is_atomic() {
        let (g, f) = scenario_b();
        let mut engine = Engine::new(g);
        engine.graph_mut().set_locked(f.output, true).unwrap();
        let before: Vec<_> = f.inputs.iter().map(|p| engine.graph().rate(*p).cloned()).collect();
        let err = engine.solve(f.output, ratio(10, 1)).unwrap_err();
        assert!(matches!(err, SolveError::Infeasible { .. }));
        let after: Vec<_> = f.inputs.iter().map(|p| engine.graph().rate(*p).cloned()).collect();
        assert_eq!(before, after);
    }

    // -----------------------------------------------------------------------
    // Test 2: parse errors surface without touching the graph
    // -----------------------------------------------------------------------
    #[test]
    fn solve_expr_parse_error() {
        let (g, f) = scenario_a();
        let mut engine = Engine::new(g);
        assert!(matches!(engine.solve_expr(f.output, "3/0"), Err(SolveError::Parse(_))));
        assert!(matches!(engine.solve_expr(f.output, "three"), Err(SolveError::Parse(_))));
        let report = engine.solve_expr(f.output, "1 + 2").unwrap();
        assert_eq!(report.change(f.input).unwrap().new, ratio(6, 1));
    }

    // -----------------------------------------------------------------------
    // Test 3: hooks see node rate changes
    // -----------------------------------------------------------------------
    #[test]
    fn machine_tally_follows_solves() {
        let (g, f) = scenario_a();
        let mut engine = Engine::new(g);
        engine.register_hook(Box::new(MachineTally::new()));
        engine.solve(f.output, ratio(5, 2)).unwrap();
        let tally = engine.hook::<MachineTally>().unwrap();
        assert_eq!(tally.machines(f.craft), 3);
        engine.remove_node(f.craft).unwrap();
        assert_eq!(engine.hook::<MachineTally>().unwrap().total(), 0);
    }

    // -----------------------------------------------------------------------
    // Test 4: node-level rate edits
    // -----------------------------------------------------------------------
    #[test]
    fn set_node_rate_translates_to_pin_edit() {
        let (g, f) = scenario_a();
        let mut engine = Engine::new(g);
        engine.set_node_rate(f.craft, ratio(3, 1)).unwrap();
        assert_eq!(engine.graph().rate(f.output), Some(&ratio(3, 1)));
        assert_eq!(engine.graph().rate(f.input), Some(&ratio(6, 1)));
    }

    // -----------------------------------------------------------------------
    // Test 5: connect rebalances the input side
    // -----------------------------------------------------------------------
    #[test]
    fn connect_rebalances_downstream() {
        let mut g = FlowGraph::new();
        let (sid, smelt) = smelter_recipe();
        let craft = g.add_craft(sid, &smelt);
        let sink = g.add_sink(1);
        let out = g.node(craft).unwrap().outs[0];
        let sink_in = g.node(sink).unwrap().ins[0];
        let mut engine = Engine::new(g);
        let (link, report) = engine.connect(sink_in, out).unwrap();
        let report = report.unwrap();
        assert_eq!(report.change(sink_in).unwrap().new, ratio(30, 1));
        assert_eq!(engine.graph().link(link).unwrap().start, out);
    }

    #[test]
    fn connect_rolls_back_when_rebalance_fails() {
        let mut g = FlowGraph::new();
        let (sid, smelt) = smelter_recipe();
        let craft = g.add_craft(sid, &smelt);
        let sink = g.add_sink(1);
        let out = g.node(craft).unwrap().outs[0];
        let sink_in = g.node(sink).unwrap().ins[0];
        g.set_locked(sink_in, true).unwrap();
        let mut engine = Engine::new(g);
        // Locked sink at 0 cannot accept 30.
        assert!(engine.connect(out, sink_in).is_err());
        assert_eq!(engine.graph().link_count(), 0);
        assert!(engine.graph().pin(out).unwrap().link.is_none());
    }

    // -----------------------------------------------------------------------
    // Test 6: game splitter resize splits evenly
    // -----------------------------------------------------------------------
    #[test]
    fn game_splitter_resize_resplits() {
        let mut g = FlowGraph::new();
        let gs = g.add_game_splitter(2);
        let input = g.node(gs).unwrap().ins[0];
        let mut engine = Engine::new(g);
        engine.solve(input, ratio(12, 1)).unwrap();
        let report = engine.resize_multi_pin(gs, ResizeOp::Add).unwrap().unwrap();
        assert!(!report.is_unchanged());
        let outs = engine.graph().node(gs).unwrap().outs.clone();
        assert_eq!(outs.len(), 3);
        for out in outs {
            assert_eq!(engine.graph().rate(out), Some(&ratio(4, 1)));
        }
        assert!(engine.graph().is_balanced(gs).unwrap());
    }

    // -----------------------------------------------------------------------
    // Test 7: sink resize never solves
    // -----------------------------------------------------------------------
    #[test]
    fn sink_resize_has_no_report() {
        let mut g = FlowGraph::new();
        let sink = g.add_sink(1);
        let mut engine = Engine::new(g);
        assert_eq!(engine.resize_multi_pin(sink, ResizeOp::Add).unwrap(), None);
        assert_eq!(engine.resize_multi_pin(sink, ResizeOp::Remove(0)).unwrap(), None);
        assert!(matches!(
            engine.resize_multi_pin(sink, ResizeOp::Remove(0)),
            Err(SolveError::Graph(GraphError::LastPin(_)))
        ));
    }

    // -----------------------------------------------------------------------
    // Test 8: output boost pushes downstream
    // -----------------------------------------------------------------------
    #[test]
    fn output_boost_rebalances_downstream() {
        let (g, f) = craft_into_sink();
        let mut engine = Engine::new(g);
        engine.set_output_boost(f.craft, ratio(2, 1)).unwrap();
        assert_eq!(engine.graph().rate(f.craft_in), Some(&ratio(30, 1)));
        assert_eq!(engine.graph().rate(f.craft_out), Some(&ratio(60, 1)));
        assert_eq!(engine.graph().rate(f.sink_in), Some(&ratio(60, 1)));
    }
}
