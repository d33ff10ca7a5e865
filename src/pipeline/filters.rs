//! Pipeline Filters - Asset screening and filtering
//!
//! Filters are terms producing boolean outputs, used as screens and masks.
//!
//! No-value policy, per operator:
//! - comparisons: a no-value operand gives no-value
//! - `and`: a no-value operand counts as `false`, so the result is always defined
//! - `or`: `true` if either side is `true`, `false` if both are `false`,
//!   otherwise no-value
//! - `not`: no-value stays no-value
//! - `isnull` / `notnull`: always defined
//! - `top`, `bottom`, `percentile_between`: assets without a value are `false`

use crate::pipeline::factors::{cross, sorted_defined};
use crate::pipeline::term::{CmpOp, CrossOp, LogicOp, Term, TermKind};
use crate::types::{cell_bool, cell_f64, Cell, Value};
use std::ops::{BitAnd, BitOr, Not};

impl Term {
    fn compare(&self, op: CmpOp, other: Term) -> Term {
        Term::new(TermKind::Compare(op), vec![self.clone(), other], 1, None)
    }

    pub fn gt(&self, other: impl Into<Term>) -> Term {
        self.compare(CmpOp::Greater, other.into())
    }

    pub fn ge(&self, other: impl Into<Term>) -> Term {
        self.compare(CmpOp::GreaterEqual, other.into())
    }

    pub fn lt(&self, other: impl Into<Term>) -> Term {
        self.compare(CmpOp::Less, other.into())
    }

    pub fn le(&self, other: impl Into<Term>) -> Term {
        self.compare(CmpOp::LessEqual, other.into())
    }

    pub fn equals(&self, other: impl Into<Term>) -> Term {
        self.compare(CmpOp::Equal, other.into())
    }

    pub fn and(&self, other: &Term) -> Term {
        Term::new(TermKind::Logical(LogicOp::And), vec![self.clone(), other.clone()], 1, None)
    }

    pub fn or(&self, other: &Term) -> Term {
        Term::new(TermKind::Logical(LogicOp::Or), vec![self.clone(), other.clone()], 1, None)
    }

    pub fn invert(&self) -> Term {
        Term::new(TermKind::Logical(LogicOp::Not), vec![self.clone()], 1, None)
    }

    pub fn isnull(&self) -> Term {
        Term::new(TermKind::NullCheck { negate: false }, vec![self.clone()], 1, None)
    }

    pub fn notnull(&self) -> Term {
        Term::new(TermKind::NullCheck { negate: true }, vec![self.clone()], 1, None)
    }

    /// True for the `n` largest values of the cross-section
    pub fn top(&self, n: usize) -> Term {
        cross(CrossOp::Top(n), self)
    }

    /// True for the `n` smallest values of the cross-section
    pub fn bottom(&self, n: usize) -> Term {
        cross(CrossOp::Bottom(n), self)
    }

    /// True for values between the `lo` and `hi` percentiles (inclusive, 0-100)
    pub fn percentile_between(&self, lo: f64, hi: f64) -> Term {
        cross(CrossOp::PercentileBetween { lo, hi }, self)
    }
}

impl BitAnd for &Term {
    type Output = Term;

    fn bitand(self, rhs: &Term) -> Term {
        self.and(rhs)
    }
}

impl BitAnd for Term {
    type Output = Term;

    fn bitand(self, rhs: Term) -> Term {
        self.and(&rhs)
    }
}

impl BitOr for &Term {
    type Output = Term;

    fn bitor(self, rhs: &Term) -> Term {
        self.or(rhs)
    }
}

impl BitOr for Term {
    type Output = Term;

    fn bitor(self, rhs: Term) -> Term {
        self.or(&rhs)
    }
}

impl Not for &Term {
    type Output = Term;

    fn not(self) -> Term {
        self.invert()
    }
}

impl Not for Term {
    type Output = Term;

    fn not(self) -> Term {
        self.invert()
    }
}

pub(crate) fn compute_compare(op: CmpOp, left: &Cell, right: &Cell) -> Cell {
    let (a, b) = (cell_f64(left)?, cell_f64(right)?);
    let passed = match op {
        CmpOp::Greater => a > b,
        CmpOp::GreaterEqual => a >= b,
        CmpOp::Less => a < b,
        CmpOp::LessEqual => a <= b,
        CmpOp::Equal => a == b,
    };
    Some(Value::Bool(passed))
}

pub(crate) fn compute_logical(op: LogicOp, operands: &[Cell]) -> Cell {
    let left = operands.first().and_then(cell_bool);
    let right = operands.get(1).and_then(cell_bool);

    match op {
        LogicOp::And => Some(Value::Bool(left.unwrap_or(false) && right.unwrap_or(false))),
        LogicOp::Or => match (left, right) {
            (Some(true), _) | (_, Some(true)) => Some(Value::Bool(true)),
            (Some(false), Some(false)) => Some(Value::Bool(false)),
            _ => None,
        },
        LogicOp::Not => left.map(|b| Value::Bool(!b)),
    }
}

pub(crate) fn compute_null_check(negate: bool, cell: &Cell) -> Cell {
    Some(Value::Bool(cell.is_some() == negate))
}

/// Flags the `n` largest (`largest = true`) or smallest defined values
pub(crate) fn top_bottom(values: &[Option<f64>], n: usize, largest: bool) -> Vec<Cell> {
    let mut out = vec![Some(Value::Bool(false)); values.len()];
    let mut order = sorted_defined(values);
    if largest {
        order.reverse();
    }

    for &i in order.iter().take(n) {
        out[i] = Some(Value::Bool(true));
    }
    out
}

/// Linear-interpolated percentile of an ascending slice
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

pub(crate) fn percentile_between(values: &[Option<f64>], lo: f64, hi: f64) -> Vec<Cell> {
    let order = sorted_defined(values);
    if order.is_empty() {
        return vec![Some(Value::Bool(false)); values.len()];
    }

    let sorted: Vec<f64> = order.iter().filter_map(|&i| values[i]).collect();
    let lo_value = percentile(&sorted, lo);
    let hi_value = percentile(&sorted, hi);

    values
        .iter()
        .map(|v| Some(Value::Bool(v.map_or(false, |v| v >= lo_value && v <= hi_value))))
        .collect()
}
