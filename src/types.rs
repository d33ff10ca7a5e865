//! Core types shared by the data collaborators and the pipeline engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for assets
pub type AssetId = u64;

/// Identifier of a dataset column, e.g. `USEquityPricing.close`
pub type ColumnId = String;

/// A single computed value for one (date, asset) pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Float(f64),
    Bool(bool),
    Category(i64),
}

/// A cell of a cross-section. `None` is the no-value sentinel, distinct from
/// a computed zero or `false`.
pub type Cell = Option<Value>;

impl Value {
    /// Build a float value, mapping NaN and infinities to no-value
    pub fn float(v: f64) -> Cell {
        if v.is_finite() {
            Some(Value::Float(v))
        } else {
            None
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_category(&self) -> Option<i64> {
        match self {
            Value::Category(c) => Some(*c),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Category(c) => write!(f, "{}", c),
        }
    }
}

/// Extract a float from a cell
pub fn cell_f64(cell: &Cell) -> Option<f64> {
    cell.as_ref().and_then(Value::as_f64)
}

/// Extract a boolean from a cell
pub fn cell_bool(cell: &Cell) -> Option<bool> {
    cell.as_ref().and_then(Value::as_bool)
}

/// Extract a category label from a cell
pub fn cell_category(cell: &Cell) -> Option<i64> {
    cell.as_ref().and_then(Value::as_category)
}
