//! Factors - numeric pipeline terms
//!
//! Trailing-window aggregations, elementwise arithmetic and cross-sectional
//! normalisations. A window containing any no-value cell yields no-value;
//! windows never shrink to the observations that happen to be available.

use crate::pipeline::term::{ArithOp, CrossOp, Term, TermKind, WindowedFactor};
use crate::types::{cell_f64, Cell, Value};
use std::ops::{Add, Div, Mul, Sub};

/// Arithmetic mean over a trailing window
pub struct SimpleMovingAverage;

impl SimpleMovingAverage {
    pub fn new(input: &Term, window_length: usize) -> Term {
        windowed(WindowedFactor::SimpleMovingAverage, input, window_length)
    }
}

/// Exponentially weighted mean with `alpha = 2 / (span + 1)`
pub struct ExponentialWeightedMovingAverage;

impl ExponentialWeightedMovingAverage {
    pub fn from_span(input: &Term, span: usize) -> Term {
        windowed(WindowedFactor::ExponentialWeightedMovingAverage, input, span)
    }
}

/// Percent change over a trailing window
pub struct Returns;

impl Returns {
    pub fn new(input: &Term, window_length: usize) -> Term {
        windowed(WindowedFactor::Returns, input, window_length)
    }
}

/// Sample standard deviation over a trailing window
pub struct StdDev;

impl StdDev {
    pub fn new(input: &Term, window_length: usize) -> Term {
        windowed(WindowedFactor::StdDev, input, window_length)
    }
}

fn windowed(op: WindowedFactor, input: &Term, window_length: usize) -> Term {
    Term::new(TermKind::Windowed(op), vec![input.clone()], window_length, None)
}

impl Term {
    /// Cross-sectional ascending rank (1 = smallest, ties averaged)
    pub fn rank(&self) -> Term {
        cross(CrossOp::Rank, self)
    }

    /// Cross-sectional z-score using the population standard deviation
    pub fn zscore(&self) -> Term {
        cross(CrossOp::ZScore, self)
    }

    /// Value minus the cross-sectional mean
    pub fn demean(&self) -> Term {
        cross(CrossOp::Demean, self)
    }

    fn arithmetic(&self, op: ArithOp, other: Term) -> Term {
        Term::new(TermKind::Arithmetic(op), vec![self.clone(), other], 1, None)
    }
}

pub(crate) fn cross(op: CrossOp, input: &Term) -> Term {
    Term::new(TermKind::CrossSectional(op), vec![input.clone()], 1, None)
}

macro_rules! impl_arith {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<T: Into<Term>> $trait<T> for &Term {
            type Output = Term;

            fn $method(self, rhs: T) -> Term {
                self.arithmetic($op, rhs.into())
            }
        }

        impl<T: Into<Term>> $trait<T> for Term {
            type Output = Term;

            fn $method(self, rhs: T) -> Term {
                self.arithmetic($op, rhs.into())
            }
        }
    };
}

impl_arith!(Add, add, ArithOp::Add);
impl_arith!(Sub, sub, ArithOp::Subtract);
impl_arith!(Mul, mul, ArithOp::Multiply);
impl_arith!(Div, div, ArithOp::Divide);

/// Aggregate one asset's trailing window (oldest first)
pub(crate) fn compute_windowed(op: WindowedFactor, window: &[Cell]) -> Cell {
    use statrs::statistics::{Data, Distribution};

    let values: Vec<f64> = window.iter().map(cell_f64).collect::<Option<Vec<f64>>>()?;
    if values.is_empty() {
        return None;
    }

    match op {
        WindowedFactor::SimpleMovingAverage => {
            Value::float(values.iter().sum::<f64>() / values.len() as f64)
        }
        WindowedFactor::ExponentialWeightedMovingAverage => {
            let alpha = 2.0 / (values.len() as f64 + 1.0);
            let n = values.len();
            let (weighted, total) = values.iter().enumerate().fold((0.0, 0.0), |(acc, w_sum), (i, v)| {
                let w = (1.0 - alpha).powi((n - 1 - i) as i32);
                (acc + w * v, w_sum + w)
            });
            Value::float(weighted / total)
        }
        WindowedFactor::Returns => {
            let first = values[0];
            let last = values[values.len() - 1];
            if first == 0.0 {
                return None;
            }
            Value::float((last - first) / first)
        }
        WindowedFactor::StdDev => Data::new(values).std_dev().and_then(Value::float),
    }
}

pub(crate) fn compute_arithmetic(op: ArithOp, left: &Cell, right: &Cell) -> Cell {
    let (a, b) = (cell_f64(left)?, cell_f64(right)?);
    let v = match op {
        ArithOp::Add => a + b,
        ArithOp::Subtract => a - b,
        ArithOp::Multiply => a * b,
        ArithOp::Divide => a / b,
    };
    Value::float(v)
}

/// Indices of the defined values, sorted ascending by value (stable)
pub(crate) fn sorted_defined(values: &[Option<f64>]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).filter(|&i| values[i].is_some()).collect();
    idx.sort_by(|&a, &b| {
        values[a]
            .partial_cmp(&values[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    idx
}

/// Ascending rank over the defined values; ties receive their average rank
pub(crate) fn rank(values: &[Option<f64>]) -> Vec<Cell> {
    let mut out = vec![None; values.len()];
    let order = sorted_defined(values);

    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // 1-based positions start+1 ..= end
        let avg = (start + 1 + end) as f64 / 2.0;
        for &i in &order[start..end] {
            out[i] = Some(Value::Float(avg));
        }
        start = end;
    }

    out
}

pub(crate) fn zscore(values: &[Option<f64>]) -> Vec<Cell> {
    use statrs::statistics::Statistics;

    let defined: Vec<f64> = values.iter().flatten().copied().collect();
    if defined.len() < 2 {
        return vec![None; values.len()];
    }
    let mean = defined.iter().mean();
    let std = defined.iter().population_std_dev();
    if std == 0.0 || !std.is_finite() {
        return vec![None; values.len()];
    }

    values
        .iter()
        .map(|v| v.and_then(|v| Value::float((v - mean) / std)))
        .collect()
}

pub(crate) fn demean(values: &[Option<f64>]) -> Vec<Cell> {
    let defined: Vec<f64> = values.iter().flatten().copied().collect();
    if defined.is_empty() {
        return vec![None; values.len()];
    }
    let mean = defined.iter().sum::<f64>() / defined.len() as f64;

    values
        .iter()
        .map(|v| v.and_then(|v| Value::float(v - mean)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::term::DType;
    use approx::assert_relative_eq;

    fn cells(values: &[Option<f64>]) -> Vec<Cell> {
        values.iter().map(|v| v.map(Value::Float)).collect()
    }

    fn float(cell: &Cell) -> f64 {
        cell_f64(cell).unwrap()
    }

    #[test]
    fn test_sma() {
        let out = compute_windowed(
            WindowedFactor::SimpleMovingAverage,
            &cells(&[Some(-0.1), Some(0.4)]),
        );
        assert_relative_eq!(float(&out), 0.15, epsilon = 1e-12);
    }

    #[test]
    fn test_sma_missing_value_is_no_value() {
        let out = compute_windowed(
            WindowedFactor::SimpleMovingAverage,
            &cells(&[None, Some(0.2), Some(0.4)]),
        );
        assert_eq!(out, None);
    }

    #[test]
    fn test_ewma_weights_recent_values() {
        let out = compute_windowed(
            WindowedFactor::ExponentialWeightedMovingAverage,
            &cells(&[Some(1.0), Some(2.0), Some(3.0)]),
        );
        // alpha = 0.5, weights 0.25, 0.5, 1.0
        assert_relative_eq!(float(&out), (0.25 + 1.0 + 3.0) / 1.75, epsilon = 1e-12);
    }

    #[test]
    fn test_returns() {
        let out = compute_windowed(WindowedFactor::Returns, &cells(&[Some(10.0), Some(11.0), Some(12.0)]));
        assert_relative_eq!(float(&out), 0.2, epsilon = 1e-12);

        let zero = compute_windowed(WindowedFactor::Returns, &cells(&[Some(0.0), Some(1.0)]));
        assert_eq!(zero, None);
    }

    #[test]
    fn test_stddev() {
        let out = compute_windowed(
            WindowedFactor::StdDev,
            &cells(&[Some(2.0), Some(4.0), Some(4.0), Some(4.0), Some(5.0), Some(5.0), Some(7.0), Some(9.0)]),
        );
        assert_relative_eq!(float(&out), 2.138089935299395, epsilon = 1e-9);
    }

    #[test]
    fn test_arithmetic() {
        let a = Some(Value::Float(6.0));
        let b = Some(Value::Float(3.0));
        assert_eq!(compute_arithmetic(ArithOp::Divide, &a, &b), Some(Value::Float(2.0)));
        assert_eq!(compute_arithmetic(ArithOp::Subtract, &a, &b), Some(Value::Float(3.0)));
        assert_eq!(compute_arithmetic(ArithOp::Divide, &a, &Some(Value::Float(0.0))), None);
        assert_eq!(compute_arithmetic(ArithOp::Add, &a, &None), None);
    }

    #[test]
    fn test_rank_averages_ties() {
        let out = rank(&[Some(3.0), None, Some(1.0), Some(3.0)]);
        assert_eq!(out, vec![Some(Value::Float(2.5)), None, Some(Value::Float(1.0)), Some(Value::Float(2.5))]);
    }

    #[test]
    fn test_zscore_and_demean() {
        let z = zscore(&[Some(1.0), Some(3.0), None]);
        assert_relative_eq!(float(&z[0]), -1.0, epsilon = 1e-12);
        assert_relative_eq!(float(&z[1]), 1.0, epsilon = 1e-12);
        assert_eq!(z[2], None);

        let d = demean(&[Some(1.0), Some(3.0), None]);
        assert_relative_eq!(float(&d[0]), -1.0, epsilon = 1e-12);
        assert_eq!(d[2], None);

        assert!(zscore(&[Some(1.0), Some(1.0)]).iter().all(Option::is_none));
    }

    #[test]
    fn test_operator_overloads_build_terms() {
        let close = Term::column("close", DType::Float64);
        let open = Term::column("open", DType::Float64);
        let spread = &close - &open;
        let scaled = spread.clone() * 2.0;

        assert_eq!(spread.name(), "(close - open)");
        assert_eq!(scaled.inputs()[0], spread);
        assert!(scaled.is_factor());
    }

    #[test]
    fn test_constructors() {
        let sentiment = Term::column("stocktwits.bull_minus_bear", DType::Float64);
        let sma = SimpleMovingAverage::new(&sentiment, 3);
        assert_eq!(sma.window_length(), 3);
        assert_eq!(sma.inputs(), &[sentiment.clone()]);
        assert_eq!(Returns::new(&sentiment, 2).window_length(), 2);
        assert_ne!(StdDev::new(&sentiment, 3).id(), sma.id());
        assert_eq!(ExponentialWeightedMovingAverage::from_span(&sentiment, 5).window_length(), 5);
    }
}
