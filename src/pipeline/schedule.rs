//! Window scheduling
//!
//! Works out how much history each term needs before the first requested
//! date. For a term `t` with consumers `c`:
//!
//! ```text
//! extra_lookback(t) = window_length(t) - 1 + max(extra_lookback(c)), default 0
//! ```
//!
//! computed in one backward pass over the execution order. `t`'s own output
//! is needed on `extra_lookback(t) - (window_length(t) - 1)` dates before the
//! start.

use crate::calendar::TradingCalendar;
use crate::error::{PipelineError, Result};
use crate::pipeline::graph::TermGraph;
use crate::pipeline::term::TermId;
use chrono::NaiveDate;
use hashbrown::HashMap;

/// Per-term lookback requirements
#[derive(Debug, Clone, Default)]
pub struct WindowSchedule {
    extra_lookback: HashMap<TermId, usize>,
    output_lead: HashMap<TermId, usize>,
    max_lookback: usize,
}

impl WindowSchedule {
    pub fn compute(graph: &TermGraph) -> Self {
        let mut extra_lookback: HashMap<TermId, usize> = HashMap::new();
        let mut output_lead: HashMap<TermId, usize> = HashMap::new();

        for term_id in graph.execution_order().iter().rev() {
            let lead = graph
                .dependents_of(*term_id)
                .iter()
                .map(|consumer| extra_lookback[consumer])
                .max()
                .unwrap_or(0);
            let window = graph
                .get_term(*term_id)
                .map_or(1, |t| t.window_length().max(1));

            output_lead.insert(*term_id, lead);
            extra_lookback.insert(*term_id, window - 1 + lead);
        }

        let max_lookback = extra_lookback.values().copied().max().unwrap_or(0);
        Self {
            extra_lookback,
            output_lead,
            max_lookback,
        }
    }

    /// Leading dates of input history `id` needs before the start
    pub fn extra_lookback(&self, id: TermId) -> usize {
        self.extra_lookback.get(&id).copied().unwrap_or(0)
    }

    /// Leading dates on which `id`'s output must be computed before the start
    pub fn output_lead(&self, id: TermId) -> usize {
        self.output_lead.get(&id).copied().unwrap_or(0)
    }

    /// Leading dates the whole graph needs before the start
    pub fn max_lookback(&self) -> usize {
        self.max_lookback
    }

    /// Resolve the requested range against a calendar
    pub fn plan(
        &self,
        calendar: &dyn TradingCalendar,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ExecutionPlan> {
        if start > end {
            return Err(PipelineError::InvalidDateRange { start, end });
        }

        let output_dates = calendar.trading_dates(start, end);
        let Some(first) = output_dates.first().copied() else {
            return Ok(ExecutionPlan {
                lookback_dates: Vec::new(),
                output_dates,
            });
        };

        let lookback_dates = calendar.prior_dates(first, self.max_lookback);
        if lookback_dates.len() < self.max_lookback {
            return Err(PipelineError::InsufficientHistory {
                start: first,
                required: self.max_lookback,
                available: lookback_dates.len(),
            });
        }

        Ok(ExecutionPlan {
            lookback_dates,
            output_dates,
        })
    }
}

/// Dates to evaluate: the lookback prefix followed by the requested dates
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub lookback_dates: Vec<NaiveDate>,
    pub output_dates: Vec<NaiveDate>,
}

/// A contiguous run of output dates with its own lookback prefix
#[derive(Debug, Clone, PartialEq)]
pub struct DateChunk {
    /// Lookback prefix followed by this chunk's output dates
    pub dates: Vec<NaiveDate>,
    /// Index in `dates` of the first output date
    pub first_output: usize,
}

impl DateChunk {
    pub fn output_dates(&self) -> &[NaiveDate] {
        &self.dates[self.first_output..]
    }
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.output_dates.is_empty()
    }

    /// Split the output dates into at most `parts` contiguous chunks, in order
    pub fn chunks(&self, parts: usize) -> Vec<DateChunk> {
        if self.output_dates.is_empty() {
            return Vec::new();
        }

        let lookback = self.lookback_dates.len();
        let all: Vec<NaiveDate> = self
            .lookback_dates
            .iter()
            .chain(&self.output_dates)
            .copied()
            .collect();

        let n = self.output_dates.len();
        let size = n.div_ceil(parts.clamp(1, n));

        (0..n)
            .step_by(size)
            .map(|a| {
                let b = (a + size).min(n);
                DateChunk {
                    dates: all[a..lookback + b].to_vec(),
                    first_output: lookback,
                }
            })
            .collect()
    }
}
