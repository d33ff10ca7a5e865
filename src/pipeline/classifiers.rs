//! Pipeline Classifiers - Asset categorization and labeling
//!
//! Classifiers are terms producing integer category labels, used to group
//! assets or, through [`Term::eq_label`], to build filters.

use crate::pipeline::factors::{cross, sorted_defined};
use crate::pipeline::term::{CrossOp, Term, TermKind};
use crate::types::{cell_category, Cell, Value};

impl Term {
    /// Classify the cross-section into `bins` equal-count buckets, labelled
    /// `0..bins` from smallest to largest
    pub fn quantiles(&self, bins: usize) -> Term {
        cross(CrossOp::Quantiles(bins), self)
    }

    pub fn quartiles(&self) -> Term {
        self.quantiles(4)
    }

    pub fn quintiles(&self) -> Term {
        self.quantiles(5)
    }

    pub fn deciles(&self) -> Term {
        self.quantiles(10)
    }

    /// Filter selecting assets labelled `label`
    pub fn eq_label(&self, label: i64) -> Term {
        Term::new(TermKind::LabelEq(label), vec![self.clone()], 1, None)
    }
}

pub(crate) fn quantiles(values: &[Option<f64>], bins: usize) -> Vec<Cell> {
    let mut out = vec![None; values.len()];
    let order = sorted_defined(values);
    let n = order.len();

    for (pos, &i) in order.iter().enumerate() {
        let label = (pos * bins / n).min(bins - 1) as i64;
        out[i] = Some(Value::Category(label));
    }
    out
}

pub(crate) fn compute_label_eq(label: i64, cell: &Cell) -> Cell {
    cell_category(cell).map(|c| Value::Bool(c == label))
}
