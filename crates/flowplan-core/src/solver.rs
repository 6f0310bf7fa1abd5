//! Gaussian elimination with partial pivoting over exact rationals.

use crate::equation::LinearSystem;
use crate::graph::GraphError;
use crate::id::PinId;
use crate::rational::{ArithmeticError, ParseError, Rational};
use tracing::debug;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Why a solve was rejected. The graph is untouched in every case.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SolveError {
    /// The requested value did not parse.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// No solution, contradictory constraints, or a negative rate. For a
    /// negative solution `negative` lists the offending pins.
    #[error("infeasible rate configuration ({} negative pins)", .negative.len())]
    Infeasible { negative: Vec<PinId> },
    /// Fewer independent equations than variables.
    #[error("underdetermined system: {equations} independent equations for {variables} variables")]
    UnderdeterminedSystem { equations: usize, variables: usize },
    /// An intermediate value no longer fits in 64-bit fraction storage.
    #[error("rate arithmetic overflowed")]
    Overflow,
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl From<ArithmeticError> for SolveError {
    fn from(e: ArithmeticError) -> Self {
        match e {
            ArithmeticError::Overflow => SolveError::Overflow,
            ArithmeticError::DivisionByZero => SolveError::Infeasible {
                negative: Vec::new(),
            },
        }
    }
}

impl SolveError {
    /// Short stable name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SolveError::Parse(_) => "parse",
            SolveError::Infeasible { .. } => "infeasible",
            SolveError::UnderdeterminedSystem { .. } => "underdetermined",
            SolveError::Overflow => "overflow",
            SolveError::Graph(_) => "graph",
        }
    }
}

// ---------------------------------------------------------------------------
// Elimination
// ---------------------------------------------------------------------------

/// Solve `system`, returning one value per unknown.
///
/// Pivot rows are chosen by the approximate magnitude of the candidate
/// entry; every elimination step is exact. Rows left over after the square
/// block must reduce to `0 = 0`.
pub fn solve(system: &LinearSystem) -> Result<Vec<Rational>, SolveError> {
    let n = system.variable_count();
    let mut rows: Vec<Vec<Rational>> = system
        .equations
        .iter()
        .map(|eq| {
            let mut r = eq.coeffs.clone();
            r.push(eq.rhs.clone());
            r
        })
        .collect();
    let m = rows.len();
    if m < n {
        return Err(SolveError::UnderdeterminedSystem {
            equations: m,
            variables: n,
        });
    }

    for col in 0..n {
        let pivot = (col..m)
            .filter(|&r| !rows[r][col].is_zero())
            .max_by(|&a, &b| {
                let fa = rows[a][col].to_f64().abs();
                let fb = rows[b][col].to_f64().abs();
                fa.total_cmp(&fb)
            });
        let Some(pivot) = pivot else {
            debug!(column = col, "zero pivot column");
            return Err(SolveError::Infeasible {
                negative: Vec::new(),
            });
        };
        rows.swap(col, pivot);
        let lead = rows[col][col].clone();
        for r in (col + 1)..m {
            if rows[r][col].is_zero() {
                continue;
            }
            let factor = rows[r][col].checked_div(&lead)?;
            for k in col..=n {
                if rows[col][k].is_zero() {
                    continue;
                }
                let delta = factor.checked_mul(&rows[col][k])?;
                rows[r][k] = rows[r][k].checked_sub(&delta)?;
            }
        }
    }

    for (r, row) in rows.iter().enumerate().skip(n) {
        if !row[n].is_zero() {
            debug!(row = r, residual = %row[n], "inconsistent surplus equation");
            return Err(SolveError::Infeasible {
                negative: Vec::new(),
            });
        }
    }

    let mut values = vec![Rational::zero(); n];
    for i in (0..n).rev() {
        let mut acc = rows[i][n].clone();
        for k in (i + 1)..n {
            if rows[i][k].is_zero() {
                continue;
            }
            acc = acc.checked_sub(&rows[i][k].checked_mul(&values[k])?)?;
        }
        values[i] = acc.checked_div(&rows[i][i])?;
    }
    Ok(values)
}

/// Reject a solution with negative values, naming every affected pin.
pub fn check_non_negative(system: &LinearSystem, values: &[Rational]) -> Result<(), SolveError> {
    let negative: Vec<PinId> = system
        .unknowns
        .iter()
        .zip(values)
        .filter(|(_, v)| v.is_negative())
        .flat_map(|(u, _)| u.pins.iter().copied())
        .collect();
    if negative.is_empty() {
        Ok(())
    } else {
        Err(SolveError::Infeasible { negative })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation::{Equation, EquationKind, Unknown, Variable};
    use crate::rational::ratio;
    use slotmap::SlotMap;

    fn system(rows: &[(&[i64], i64)]) -> LinearSystem {
        let width = rows[0].0.len();
        let mut pins: SlotMap<PinId, ()> = SlotMap::with_key();
        let unknowns = (0..width)
            .map(|_| {
                let pin = pins.insert(());
                Unknown {
                    var: Variable::PinRate(pin),
                    pins: vec![pin],
                }
            })
            .collect();
        let equations = rows
            .iter()
            .map(|(coeffs, rhs)| Equation {
                kind: EquationKind::LinkEquality,
                coeffs: coeffs.iter().map(|c| Rational::from_integer(*c)).collect(),
                rhs: Rational::from_integer(*rhs),
            })
            .collect();
        LinearSystem { unknowns, equations }
    }

    #[test]
    fn solves_square_system_exactly() {
        // x + y = 10, 3x - 2y = 0  =>  x = 4, y = 6
        let s = system(&[(&[1, 1], 10), (&[3, -2], 0)]);
        assert_eq!(solve(&s).unwrap(), vec![ratio(4, 1), ratio(6, 1)]);
    }

    #[test]
    fn fractional_solution() {
        // 3x = 1, x + 3y = 1  =>  x = 1/3, y = 2/9
        let s = system(&[(&[3, 0], 1), (&[1, 3], 1)]);
        assert_eq!(solve(&s).unwrap(), vec![ratio(1, 3), ratio(2, 9)]);
    }

    #[test]
    fn pivoting_handles_zero_leading_entry() {
        // 0x + y = 2, x + y = 5
        let s = system(&[(&[0, 1], 2), (&[1, 1], 5)]);
        assert_eq!(solve(&s).unwrap(), vec![ratio(3, 1), ratio(2, 1)]);
    }

    #[test]
    fn consistent_surplus_rows_are_accepted() {
        let s = system(&[(&[1, 0], 1), (&[0, 1], 2), (&[1, 1], 3)]);
        assert_eq!(solve(&s).unwrap(), vec![ratio(1, 1), ratio(2, 1)]);
    }

    #[test]
    fn inconsistent_surplus_rows_are_infeasible() {
        let s = system(&[(&[1, 0], 1), (&[0, 1], 2), (&[1, 1], 4)]);
        assert_eq!(solve(&s), Err(SolveError::Infeasible { negative: vec![] }));
    }

    #[test]
    fn singular_column_is_infeasible() {
        let s = system(&[(&[1, 0], 1), (&[2, 0], 2)]);
        assert!(matches!(solve(&s), Err(SolveError::Infeasible { .. })));
    }

    #[test]
    fn negative_values_name_their_pins() {
        let s = system(&[(&[1, 0], -1), (&[0, 1], 2)]);
        let values = solve(&s).unwrap();
        let err = check_non_negative(&s, &values).unwrap_err();
        assert_eq!(
            err,
            SolveError::Infeasible {
                negative: s.unknowns[0].pins.clone()
            }
        );
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(SolveError::Overflow.kind(), "overflow");
        assert_eq!(SolveError::from(ArithmeticError::Overflow), SolveError::Overflow);
    }
}
