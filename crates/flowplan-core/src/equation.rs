//! Turn graph constraints into a linear system over [`Rational`].
//!
//! Variables: one reference rate per free Craft/Group/GameSplitter node and
//! one rate per free Merger/CustomSplitter/Sink pin. Locked pins and pins
//! outside the relevant set are constants.
//!
//! Equations come in two tiers:
//!
//! - **Hard**: the user constraint, one equality per relevant link, and
//!   `single = sum(multi)` for every Merger/CustomSplitter owning a variable.
//! - **Soft**: ratio preservation on the multi side of nodes whose single
//!   pin is driving, then loop-closure ratios where cycles feed back into
//!   the multi side. A soft equation is kept only if it raises the rank of
//!   the system, checked exactly with [`RowBasis`].

use crate::graph::{FlowGraph, GraphError};
use crate::id::*;
use crate::node::NodeTag;
use crate::rational::{ArithmeticError, Rational};
use crate::relevant::{DrivenBy, RelevantSet};
use crate::solver::SolveError;
use std::collections::{HashMap, HashSet};
use tracing::debug;

// ---------------------------------------------------------------------------
// System types
// ---------------------------------------------------------------------------

/// What a solver variable stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variable {
    /// Reference rate of a Craft, Group or GameSplitter node.
    NodeRate(NodeId),
    /// Rate of one Merger, CustomSplitter or Sink pin.
    PinRate(PinId),
}

/// A variable with the pins whose rate it determines.
#[derive(Debug, Clone)]
pub struct Unknown {
    pub var: Variable,
    pub pins: Vec<PinId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EquationKind {
    Constraint,
    LinkEquality,
    Conservation,
    RatioPreservation,
    LoopClosure,
}

impl EquationKind {
    pub fn is_soft(self) -> bool {
        matches!(self, EquationKind::RatioPreservation | EquationKind::LoopClosure)
    }
}

/// `sum(coeffs[i] * x[i]) = rhs`.
#[derive(Debug, Clone)]
pub struct Equation {
    pub kind: EquationKind,
    pub coeffs: Vec<Rational>,
    pub rhs: Rational,
}

impl Equation {
    fn new(kind: EquationKind, width: usize) -> Self {
        Self {
            kind,
            coeffs: vec![Rational::zero(); width],
            rhs: Rational::zero(),
        }
    }

    fn add_var(&mut self, index: usize, coef: &Rational) -> Result<(), ArithmeticError> {
        self.coeffs[index] = self.coeffs[index].checked_add(coef)?;
        Ok(())
    }

    /// Add a constant to the left-hand side.
    fn add_constant(&mut self, value: &Rational) -> Result<(), ArithmeticError> {
        self.rhs = self.rhs.checked_sub(value)?;
        Ok(())
    }

    /// Add `scale * term` to the left-hand side.
    fn add_term(&mut self, term: &Term, scale: &Rational) -> Result<(), ArithmeticError> {
        match term {
            Term::Var { index, coef } => self.add_var(*index, &coef.checked_mul(scale)?),
            Term::Const(value) => self.add_constant(&value.checked_mul(scale)?),
        }
    }

    pub fn is_trivial(&self) -> bool {
        self.coeffs.iter().all(Rational::is_zero)
    }
}

/// The scratch system of one solve.
#[derive(Debug, Clone, Default)]
pub struct LinearSystem {
    pub unknowns: Vec<Unknown>,
    pub equations: Vec<Equation>,
}

impl LinearSystem {
    pub fn variable_count(&self) -> usize {
        self.unknowns.len()
    }

    pub fn index_of(&self, var: Variable) -> Option<usize> {
        self.unknowns.iter().position(|u| u.var == var)
    }

    pub fn count(&self, kind: EquationKind) -> usize {
        self.equations.iter().filter(|e| e.kind == kind).count()
    }
}

// ---------------------------------------------------------------------------
// Rank probe
// ---------------------------------------------------------------------------

/// Incrementally maintained row-echelon basis used to test whether a new
/// coefficient row is linearly independent of the rows seen so far.
#[derive(Debug, Clone, Default)]
pub struct RowBasis {
    /// Normalized rows (pivot entry 1), each with its pivot column.
    rows: Vec<(usize, Vec<Rational>)>,
}

impl RowBasis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rank(&self) -> usize {
        self.rows.len()
    }

    /// Reduce `row` against the basis and insert what remains. Returns
    /// whether the rank went up.
    pub fn insert(&mut self, row: &[Rational]) -> Result<bool, ArithmeticError> {
        let mut r = row.to_vec();
        for (pivot, basis_row) in &self.rows {
            let factor = r[*pivot].clone();
            if factor.is_zero() {
                continue;
            }
            for (k, b) in basis_row.iter().enumerate().skip(*pivot) {
                if !b.is_zero() {
                    r[k] = r[k].checked_sub(&factor.checked_mul(b)?)?;
                }
            }
        }
        let Some(pivot) = r.iter().position(|v| !v.is_zero()) else {
            return Ok(false);
        };
        let lead = r[pivot].clone();
        for v in r.iter_mut().skip(pivot) {
            *v = v.checked_div(&lead)?;
        }
        // Keep earlier rows reduced in the new pivot column so the single
        // forward pass above stays sufficient.
        for (_, basis_row) in self.rows.iter_mut() {
            let factor = basis_row[pivot].clone();
            if factor.is_zero() {
                continue;
            }
            for (k, v) in r.iter().enumerate().skip(pivot) {
                if !v.is_zero() {
                    basis_row[k] = basis_row[k].checked_sub(&factor.checked_mul(v)?)?;
                }
            }
        }
        self.rows.push((pivot, r));
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// A pin's rate as seen by the system.
#[derive(Debug, Clone)]
enum Term {
    Var { index: usize, coef: Rational },
    Const(Rational),
}

struct Builder<'a> {
    graph: &'a FlowGraph,
    relevant: &'a RelevantSet,
    unknowns: Vec<Unknown>,
    index: HashMap<Variable, usize>,
}

/// Build the system for setting `constraint` to `target`.
pub fn build(
    graph: &FlowGraph,
    relevant: &RelevantSet,
    constraint: PinId,
    target: &Rational,
) -> Result<LinearSystem, SolveError> {
    let mut b = Builder {
        graph,
        relevant,
        unknowns: Vec::new(),
        index: HashMap::new(),
    };
    b.allocate()?;
    let width = b.unknowns.len();

    let mut hard = Vec::new();
    let mut row = Equation::new(EquationKind::Constraint, width);
    row.add_term(&b.term(constraint)?, &Rational::one())?;
    row.rhs = row.rhs.checked_add(target)?;
    hard.push(row);
    b.link_equalities(&mut hard)?;
    b.conservation(&mut hard)?;

    let mut basis = RowBasis::new();
    for eq in &hard {
        basis.insert(&eq.coeffs)?;
    }

    let mut soft = Vec::new();
    b.ratio_preservation(&mut soft)?;
    b.loop_closure(&mut soft)?;
    let offered = soft.len();

    let mut equations = hard;
    for eq in soft {
        if basis.rank() >= width {
            break;
        }
        if basis.insert(&eq.coeffs)? {
            equations.push(eq);
        }
    }

    let system = LinearSystem {
        unknowns: b.unknowns,
        equations,
    };
    debug!(
        variables = width,
        equations = system.equations.len(),
        soft_offered = offered,
        soft_kept = system.equations.iter().filter(|e| e.kind.is_soft()).count(),
        rank = basis.rank(),
        "built equation system"
    );
    if system.equations.len() < width || basis.rank() < width {
        return Err(SolveError::UnderdeterminedSystem {
            equations: basis.rank(),
            variables: width,
        });
    }
    Ok(system)
}

impl Builder<'_> {
    fn pin(&self, id: PinId) -> Result<&crate::node::Pin, GraphError> {
        self.graph.pin(id).ok_or(GraphError::PinNotFound(id))
    }

    fn push(&mut self, var: Variable, pins: Vec<PinId>) {
        self.index.insert(var, self.unknowns.len());
        self.unknowns.push(Unknown { var, pins });
    }

    fn allocate(&mut self) -> Result<(), SolveError> {
        for &node_id in self.relevant.nodes() {
            let node = self.graph.node(node_id).ok_or(GraphError::NodeNotFound(node_id))?;
            match node.kind.tag() {
                NodeTag::Craft | NodeTag::Group | NodeTag::GameSplitter => {
                    let pins: Vec<PinId> = node.pins().collect();
                    let fixed = pins
                        .iter()
                        .any(|p| self.graph.pin(*p).is_some_and(|p| p.locked));
                    if !fixed {
                        self.push(Variable::NodeRate(node_id), pins);
                    }
                }
                NodeTag::Merger | NodeTag::CustomSplitter | NodeTag::Sink => {
                    for pin in node.pins() {
                        let free = self.graph.pin(pin).is_some_and(|p| !p.locked);
                        if free && self.relevant.contains(pin) {
                            self.push(Variable::PinRate(pin), vec![pin]);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn term(&self, pin_id: PinId) -> Result<Term, SolveError> {
        let pin = self.pin(pin_id)?;
        if let Some(&index) = self.index.get(&Variable::PinRate(pin_id)) {
            return Ok(Term::Var {
                index,
                coef: Rational::one(),
            });
        }
        if let Some(&index) = self.index.get(&Variable::NodeRate(pin.node)) {
            let node = self.graph.node(pin.node).ok_or(GraphError::NodeNotFound(pin.node))?;
            return Ok(Term::Var {
                index,
                coef: node.coefficient(pin)?,
            });
        }
        Ok(Term::Const(pin.current_rate.clone()))
    }

    fn link_equalities(&self, out: &mut Vec<Equation>) -> Result<(), SolveError> {
        let width = self.unknowns.len();
        let mut seen = HashSet::new();
        for &pin_id in self.relevant.pins() {
            let Some(link_id) = self.pin(pin_id)?.link else { continue };
            if !seen.insert(link_id) {
                continue;
            }
            let link = self.graph.link(link_id).ok_or(GraphError::LinkNotFound(link_id))?;
            let start = self.term(link.start)?;
            let end = self.term(link.end)?;
            if matches!((&start, &end), (Term::Const(_), Term::Const(_))) {
                continue;
            }
            let mut row = Equation::new(EquationKind::LinkEquality, width);
            row.add_term(&start, &Rational::one())?;
            row.add_term(&end, &Rational::from_integer(-1))?;
            out.push(row);
        }
        Ok(())
    }

    /// Relevant Merger/CustomSplitter nodes as (node, single, multi).
    fn organizers(&self) -> Vec<(NodeId, PinId, Vec<PinId>)> {
        self.relevant
            .nodes()
            .iter()
            .filter_map(|&id| {
                let node = self.graph.node(id)?;
                let single = node.single_pin()?;
                Some((id, single, node.multi_pins().to_vec()))
            })
            .collect()
    }

    fn owns_variable(&self, pins: &[PinId]) -> bool {
        pins.iter().any(|p| self.index.contains_key(&Variable::PinRate(*p)))
    }

    fn conservation(&self, out: &mut Vec<Equation>) -> Result<(), SolveError> {
        let width = self.unknowns.len();
        for (_, single, multi) in self.organizers() {
            let mut all = multi.clone();
            all.push(single);
            if !self.owns_variable(&all) {
                continue;
            }
            let mut row = Equation::new(EquationKind::Conservation, width);
            row.add_term(&self.term(single)?, &Rational::one())?;
            for m in &multi {
                row.add_term(&self.term(*m)?, &Rational::from_integer(-1))?;
            }
            out.push(row);
        }
        Ok(())
    }

    /// The single pin drives its multi side when it was entered from its
    /// link (or is the constraint) or is locked.
    fn single_is_driving(&self, single: PinId) -> Result<bool, SolveError> {
        let locked = self.pin(single)?.locked;
        Ok(locked || self.relevant.driven_by(single) == Some(DrivenBy::Elsewhere))
    }

    fn is_var(&self, pin: PinId) -> bool {
        self.index.contains_key(&Variable::PinRate(pin))
    }

    fn ratio_preservation(&self, out: &mut Vec<Equation>) -> Result<(), SolveError> {
        let width = self.unknowns.len();
        for (_, single, multi) in self.organizers() {
            if !self.relevant.contains(single) || !self.single_is_driving(single)? {
                continue;
            }
            let mut causing = Vec::new();
            let mut elsewhere = Vec::new();
            let mut constant = Rational::zero();
            for &m in &multi {
                if !self.is_var(m) {
                    constant = constant.checked_add(&self.pin(m)?.current_rate)?;
                } else if self.relevant.driven_by(m) == Some(DrivenBy::Elsewhere) {
                    elsewhere.push(m);
                } else {
                    causing.push(m);
                }
            }
            if causing.is_empty() {
                continue;
            }
            let mut old_total = Rational::zero();
            for &m in &causing {
                old_total = old_total.checked_add(&self.pin(m)?.current_rate)?;
            }
            for &m in &causing {
                let weight = if old_total.is_zero() {
                    Rational::one().checked_div_count(causing.len())?
                } else {
                    self.pin(m)?.current_rate.checked_div(&old_total)?
                };
                // m = w * (single - constant - sum(elsewhere))
                let neg_w = weight.checked_neg()?;
                let mut row = Equation::new(EquationKind::RatioPreservation, width);
                row.add_term(&self.term(m)?, &Rational::one())?;
                row.add_term(&self.term(single)?, &neg_w)?;
                row.add_constant(&constant.checked_mul(&weight)?)?;
                for &e in &elsewhere {
                    row.add_term(&self.term(e)?, &weight)?;
                }
                out.push(row);
            }
        }
        Ok(())
    }

    fn loop_closure(&self, out: &mut Vec<Equation>) -> Result<(), SolveError> {
        let width = self.unknowns.len();
        for (_, single, multi) in self.organizers() {
            if !self.relevant.contains(single) || !self.single_is_driving(single)? {
                continue;
            }
            let free: Vec<PinId> = multi.iter().copied().filter(|m| self.is_var(*m)).collect();
            let fed_back = free
                .iter()
                .any(|m| self.relevant.driven_by(*m) == Some(DrivenBy::Elsewhere));
            if !fed_back || free.len() < 2 {
                continue;
            }
            let mut old_total = Rational::zero();
            for &m in &free {
                old_total = old_total.checked_add(&self.pin(m)?.current_rate)?;
            }
            let anchor = free[0];
            let anchor_old = self.pin(anchor)?.current_rate.clone();
            for &m in &free[1..] {
                // m * old(anchor) = anchor * old(m), or m = anchor when nothing flowed before.
                let (m_scale, anchor_scale) = if old_total.is_zero() {
                    (Rational::one(), Rational::one())
                } else {
                    (anchor_old.clone(), self.pin(m)?.current_rate.clone())
                };
                let mut row = Equation::new(EquationKind::LoopClosure, width);
                row.add_term(&self.term(m)?, &m_scale)?;
                row.add_term(&self.term(anchor)?, &anchor_scale.checked_neg()?)?;
                out.push(row);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rational::ratio;
    use crate::relevant::collect;
    use crate::test_utils::*;

    fn row(values: &[(i64, i64)]) -> Vec<Rational> {
        values.iter().map(|&(n, d)| ratio(n, d)).collect()
    }

    #[test]
    fn row_basis_detects_dependence() {
        let mut basis = RowBasis::new();
        assert!(basis.insert(&row(&[(1, 1), (2, 1), (0, 1)])).unwrap());
        assert!(basis.insert(&row(&[(0, 1), (1, 1), (1, 1)])).unwrap());
        // (1,3,1) = r0 + r1
        assert!(!basis.insert(&row(&[(1, 1), (3, 1), (1, 1)])).unwrap());
        assert!(!basis.insert(&row(&[(0, 1), (0, 1), (0, 1)])).unwrap());
        assert!(basis.insert(&row(&[(0, 1), (0, 1), (1, 2)])).unwrap());
        assert_eq!(basis.rank(), 3);
        assert!(!basis.insert(&row(&[(5, 1), (-7, 3), (2, 9)])).unwrap());
    }

    #[test]
    fn craft_scaling_system_is_square() {
        let (g, f) = scenario_a();
        let set = collect(&g, f.output, 1).unwrap();
        let system = build(&g, &set, f.output, &ratio(3, 1)).unwrap();
        assert_eq!(system.variable_count(), 1);
        assert_eq!(system.count(EquationKind::Constraint), 1);
        assert_eq!(system.equations[0].coeffs, vec![Rational::one()]);
        assert_eq!(system.equations[0].rhs, ratio(3, 1));
    }

    #[test]
    fn merger_edit_keeps_one_ratio_equation() {
        let (g, f) = scenario_b();
        let set = collect(&g, f.output, 1).unwrap();
        let system = build(&g, &set, f.output, &ratio(10, 1)).unwrap();
        assert_eq!(system.variable_count(), 3);
        assert_eq!(system.count(EquationKind::Conservation), 1);
        assert_eq!(system.count(EquationKind::RatioPreservation), 1);
        assert_eq!(system.equations.len(), 3);
    }

    #[test]
    fn locked_pins_are_constants() {
        let (mut g, f) = scenario_b();
        g.set_locked(f.inputs[1], true).unwrap();
        let set = collect(&g, f.output, 1).unwrap();
        let system = build(&g, &set, f.output, &ratio(10, 1)).unwrap();
        assert!(system.index_of(Variable::PinRate(f.inputs[1])).is_none());
        assert_eq!(system.variable_count(), 2);
        // conservation folds the locked 3 into its constant term
        let cons = system
            .equations
            .iter()
            .find(|e| e.kind == EquationKind::Conservation)
            .unwrap();
        assert_eq!(cons.rhs, ratio(3, 1));
    }

    #[test]
    fn recycle_loop_needs_exactly_one_soft_equation() {
        let (g, f) = recycle_loop();
        let set = collect(&g, f.source_out, 1).unwrap();
        let system = build(&g, &set, f.source_out, &ratio(20, 1)).unwrap();
        let soft = system.equations.iter().filter(|e| e.kind.is_soft()).count();
        assert_eq!(soft, 1);
        assert_eq!(system.equations.len(), system.variable_count());
    }
}
