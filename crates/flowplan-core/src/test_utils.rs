//! Shared test helpers for unit tests, integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in integration tests and benchmarks via the `test-utils`
//! feature.
//!
//! Fixtures return the graph together with a small struct naming the pins
//! tests care about. Every fixture starts balanced.

use crate::graph::FlowGraph;
use crate::id::*;
use crate::rational::{Rational, ratio};
use crate::recipe::{Recipe, RecipeEntry};

// ===========================================================================
// Items
// ===========================================================================

pub fn ore() -> ItemId {
    ItemId(0)
}
pub fn ingot() -> ItemId {
    ItemId(1)
}
pub fn plate() -> ItemId {
    ItemId(2)
}

// ===========================================================================
// Recipes
// ===========================================================================

fn recipe(name: &str, inputs: &[(ItemId, i64)], outputs: &[(ItemId, i64)]) -> Recipe {
    let entries = |side: &[(ItemId, i64)]| {
        side.iter()
            .map(|&(item, n)| RecipeEntry::new(item, Rational::from_integer(n)))
            .collect()
    };
    Recipe {
        name: name.to_string(),
        inputs: entries(inputs),
        outputs: entries(outputs),
    }
}

/// 30 ore -> 30 ingot.
pub fn smelter_recipe() -> (RecipeId, Recipe) {
    (RecipeId(0), recipe("smelter", &[(ore(), 30)], &[(ingot(), 30)]))
}

/// 30 ingot -> 20 plate.
pub fn constructor_recipe() -> (RecipeId, Recipe) {
    (RecipeId(1), recipe("constructor", &[(ingot(), 30)], &[(plate(), 20)]))
}

/// Nothing -> 1 ore. A miner.
pub fn source_recipe() -> (RecipeId, Recipe) {
    (RecipeId(2), recipe("miner", &[], &[(ore(), 1)]))
}

/// 1 ore -> 1 ore. Stands in for any pass-through machine on a loop.
pub fn recycler_recipe() -> (RecipeId, Recipe) {
    (RecipeId(3), recipe("recycler", &[(ore(), 1)], &[(ore(), 1)]))
}

/// 2 ore -> 1 ingot.
pub fn halving_recipe() -> (RecipeId, Recipe) {
    (RecipeId(4), recipe("halver", &[(ore(), 2)], &[(ingot(), 1)]))
}

fn first_in(g: &FlowGraph, node: NodeId) -> PinId {
    g.node(node).unwrap().ins[0]
}

fn first_out(g: &FlowGraph, node: NodeId) -> PinId {
    g.node(node).unwrap().outs[0]
}

// ===========================================================================
// Scenario A: one craft node
// ===========================================================================

pub struct ScenarioA {
    pub craft: NodeId,
    pub input: PinId,
    pub output: PinId,
}

/// A lone craft node: input coefficient 2, output coefficient 1, rate 1.
pub fn scenario_a() -> (FlowGraph, ScenarioA) {
    let mut g = FlowGraph::new();
    let (id, r) = halving_recipe();
    let craft = g.add_craft(id, &r);
    let f = ScenarioA {
        craft,
        input: first_in(&g, craft),
        output: first_out(&g, craft),
    };
    (g, f)
}

// ===========================================================================
// Scenario B: one merger
// ===========================================================================

pub struct ScenarioB {
    pub merger: NodeId,
    pub inputs: [PinId; 2],
    pub output: PinId,
}

/// An unlinked merger with inputs 2 and 3 and output 5.
pub fn scenario_b() -> (FlowGraph, ScenarioB) {
    let mut g = FlowGraph::new();
    let merger = g.add_merger(2);
    let n = g.node(merger).unwrap().clone();
    g.set_current_rate(n.ins[0], ratio(2, 1)).unwrap();
    g.set_current_rate(n.ins[1], ratio(3, 1)).unwrap();
    g.set_current_rate(n.outs[0], ratio(5, 1)).unwrap();
    let f = ScenarioB {
        merger,
        inputs: [n.ins[0], n.ins[1]],
        output: n.outs[0],
    };
    (g, f)
}

// ===========================================================================
// Craft into sink
// ===========================================================================

pub struct CraftSink {
    pub craft: NodeId,
    pub craft_in: PinId,
    pub craft_out: PinId,
    pub sink: NodeId,
    pub sink_in: PinId,
}

/// A smelter at rate 1 feeding a sink at 30 ingot.
pub fn craft_into_sink() -> (FlowGraph, CraftSink) {
    let mut g = FlowGraph::new();
    let (id, r) = smelter_recipe();
    let craft = g.add_craft(id, &r);
    let sink = g.add_sink(1);
    let craft_out = first_out(&g, craft);
    let sink_in = first_in(&g, sink);
    g.connect(craft_out, sink_in).unwrap();
    g.set_current_rate(sink_in, ratio(30, 1)).unwrap();
    let f = CraftSink {
        craft,
        craft_in: first_in(&g, craft),
        craft_out,
        sink,
        sink_in,
    };
    (g, f)
}

// ===========================================================================
// Recycle loop
// ===========================================================================

pub struct RecycleLoop {
    pub source: NodeId,
    pub source_out: PinId,
    pub merger: NodeId,
    pub merger_in: PinId,
    pub merger_back: PinId,
    pub merger_out: PinId,
    pub splitter: NodeId,
    pub splitter_in: PinId,
    pub splitter_keep: PinId,
    pub splitter_back: PinId,
    pub recycler: NodeId,
    pub recycler_in: PinId,
    pub recycler_out: PinId,
    pub sink: NodeId,
    pub sink_in: PinId,
}

/// source -> merger -> splitter -> sink, with the splitter's second output
/// running through a recycler back into the merger.
///
/// Balanced at: source 10, merger 10 + 10 = 20, splitter 20 -> 10 / 10,
/// recycler 10, sink 10.
pub fn recycle_loop() -> (FlowGraph, RecycleLoop) {
    let mut g = FlowGraph::new();
    let (src_id, src) = source_recipe();
    let (rec_id, rec) = recycler_recipe();
    let source = g.add_craft(src_id, &src);
    let merger = g.add_merger(2);
    let splitter = g.add_splitter(2);
    let recycler = g.add_craft(rec_id, &rec);
    let sink = g.add_sink(1);

    let m = g.node(merger).unwrap().clone();
    let s = g.node(splitter).unwrap().clone();
    let f = RecycleLoop {
        source,
        source_out: first_out(&g, source),
        merger,
        merger_in: m.ins[0],
        merger_back: m.ins[1],
        merger_out: m.outs[0],
        splitter,
        splitter_in: s.ins[0],
        splitter_keep: s.outs[0],
        splitter_back: s.outs[1],
        recycler,
        recycler_in: first_in(&g, recycler),
        recycler_out: first_out(&g, recycler),
        sink,
        sink_in: first_in(&g, sink),
    };

    g.connect(f.source_out, f.merger_in).unwrap();
    g.connect(f.merger_out, f.splitter_in).unwrap();
    g.connect(f.splitter_keep, f.sink_in).unwrap();
    g.connect(f.splitter_back, f.recycler_in).unwrap();
    g.connect(f.recycler_out, f.merger_back).unwrap();

    let ten = ratio(10, 1);
    g.set_reference_rate(source, ten.clone()).unwrap();
    g.set_reference_rate(recycler, ten.clone()).unwrap();
    for pin in [
        f.source_out,
        f.merger_in,
        f.merger_back,
        f.splitter_keep,
        f.splitter_back,
        f.recycler_in,
        f.recycler_out,
        f.sink_in,
    ] {
        g.set_current_rate(pin, ten.clone()).unwrap();
    }
    g.set_current_rate(f.merger_out, ratio(20, 1)).unwrap();
    g.set_current_rate(f.splitter_in, ratio(20, 1)).unwrap();
    (g, f)
}

// ===========================================================================
// Chains
// ===========================================================================

/// `stages` split-then-merge stages in series behind a miner, ending in a
/// sink. Every splitter halves its flow and the following merger joins it
/// back. Used by benchmarks.
pub fn split_merge_chain(stages: usize) -> (FlowGraph, PinId) {
    let mut g = FlowGraph::new();
    let (src_id, src) = source_recipe();
    let source = g.add_craft(src_id, &src);
    g.set_reference_rate(source, ratio(2, 1)).unwrap();
    let source_out = first_out(&g, source);
    g.set_current_rate(source_out, ratio(2, 1)).unwrap();

    let mut upstream = source_out;
    for _ in 0..stages {
        let splitter = g.add_splitter(2);
        let merger = g.add_merger(2);
        let s = g.node(splitter).unwrap().clone();
        let m = g.node(merger).unwrap().clone();
        g.connect(upstream, s.ins[0]).unwrap();
        g.connect(s.outs[0], m.ins[0]).unwrap();
        g.connect(s.outs[1], m.ins[1]).unwrap();
        g.set_current_rate(s.ins[0], ratio(2, 1)).unwrap();
        for pin in [s.outs[0], s.outs[1], m.ins[0], m.ins[1]] {
            g.set_current_rate(pin, Rational::one()).unwrap();
        }
        g.set_current_rate(m.outs[0], ratio(2, 1)).unwrap();
        upstream = m.outs[0];
    }
    let sink = g.add_sink(1);
    let sink_in = first_in(&g, sink);
    g.connect(upstream, sink_in).unwrap();
    g.set_current_rate(sink_in, ratio(2, 1)).unwrap();
    (g, source_out)
}
