//! Cross-sectional evaluation of a chunk of dates
//!
//! Dates are walked in ascending order. On each date the graph is evaluated
//! level by level; terms of one level only read earlier levels, so they run in
//! parallel. Every term output is a row of cells aligned with the chunk's asset
//! set (the union of the universe snapshots of its dates).

use crate::data::{DataSource, Observation};
use crate::error::{PipelineError, Result};
use crate::pipeline::engine::{EngineConfig, Pipeline};
use crate::pipeline::graph::TermGraph;
use crate::pipeline::result::{DateGap, ExecutionResult, ResultRow};
use crate::pipeline::schedule::{DateChunk, WindowSchedule};
use crate::pipeline::term::{CrossOp, DType, Term, TermId, TermKind};
use crate::pipeline::{classifiers, factors, filters};
use crate::types::{cell_bool, cell_f64, AssetId, Cell, Value};
use crate::universe::UniverseCache;
use chrono::NaiveDate;
use hashbrown::HashMap;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;

/// Computed rows per term, indexed by the chunk's date index
type TermStore = HashMap<TermId, Vec<Option<Vec<Cell>>>>;

/// Everything a term needs to know about the date being evaluated
struct DateContext<'a> {
    t: usize,
    date: NaiveDate,
    assets: &'a [AssetId],
    index: &'a HashMap<AssetId, usize>,
    members: &'a [bool],
}

pub(crate) struct ChunkEvaluator<'a> {
    graph: &'a TermGraph,
    schedule: &'a WindowSchedule,
    levels: Vec<Vec<TermId>>,
    outputs: Vec<TermId>,
    screen: Option<TermId>,
    columns: Vec<String>,
    dtypes: Vec<DType>,
    data: &'a Arc<dyn DataSource>,
    universe: &'a UniverseCache,
    config: &'a EngineConfig,
}

impl<'a> ChunkEvaluator<'a> {
    pub(crate) fn new(
        graph: &'a TermGraph,
        schedule: &'a WindowSchedule,
        pipeline: &Pipeline,
        data: &'a Arc<dyn DataSource>,
        universe: &'a UniverseCache,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            graph,
            schedule,
            levels: graph.levels(),
            outputs: pipeline.columns().iter().map(|(_, t)| t.id()).collect(),
            screen: pipeline.screen().map(Term::id),
            columns: pipeline.column_names(),
            dtypes: pipeline.columns().iter().map(|(_, t)| t.dtype()).collect(),
            data,
            universe,
            config,
        }
    }

    pub(crate) fn evaluate(&self, chunk: &DateChunk) -> Result<ExecutionResult> {
        let dates = &chunk.dates;
        let snapshots: Vec<Arc<Vec<AssetId>>> =
            dates.iter().map(|d| self.universe.snapshot(*d)).collect();

        let assets: Vec<AssetId> = snapshots
            .iter()
            .flat_map(|s| s.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let index: HashMap<AssetId, usize> =
            assets.iter().enumerate().map(|(i, a)| (*a, i)).collect();
        let members: Vec<Vec<bool>> = snapshots
            .iter()
            .map(|snapshot| {
                let mut row = vec![false; assets.len()];
                for asset in snapshot.iter() {
                    row[index[asset]] = true;
                }
                row
            })
            .collect();

        let mut store: TermStore = self
            .graph
            .execution_order()
            .iter()
            .map(|id| (*id, vec![None; dates.len()]))
            .collect();
        let mut result = ExecutionResult::new(self.columns.clone(), self.dtypes.clone());

        for (t, date) in dates.iter().enumerate() {
            let is_output = t >= chunk.first_output;
            let ctx = DateContext {
                t,
                date: *date,
                assets: &assets,
                index: &index,
                members: &members[t],
            };

            if let Some(gap) = self.evaluate_date(&ctx, chunk.first_output, is_output, &mut store) {
                log::warn!(
                    "Skipping {}: fetch of {} failed after {} attempt(s): {}",
                    gap.date,
                    gap.column,
                    gap.attempts,
                    gap.reason
                );
                result.push_gap(gap);
                continue;
            }

            if is_output {
                self.assemble(&ctx, &snapshots[t], &store, &mut result);
            }
        }

        Ok(result)
    }

    /// Evaluate every due term on one date; returns the gap if a fetch failed
    /// on an output date
    ///
    /// A failed fetch leaves that column empty for the date and evaluation
    /// continues, so later dates see the same windows whichever chunk the date
    /// landed in.
    fn evaluate_date(
        &self,
        ctx: &DateContext,
        first_output: usize,
        is_output: bool,
        store: &mut TermStore,
    ) -> Option<DateGap> {
        let mut failure = None;
        for level in &self.levels {
            let due: Vec<&Term> = level
                .iter()
                .filter(|id| ctx.t + self.schedule.output_lead(**id) >= first_output)
                .filter_map(|id| self.graph.get_term(*id))
                .collect();

            let computed: Vec<(TermId, std::result::Result<Vec<Cell>, DateGap>)> = {
                let store: &TermStore = store;
                due.par_iter()
                    .map(|term| (term.id(), self.compute(term, ctx, store)))
                    .collect()
            };

            for (id, outcome) in computed {
                let row = match outcome {
                    Ok(row) => row,
                    Err(gap) => {
                        if is_output {
                            failure.get_or_insert(gap);
                        } else {
                            log::warn!(
                                "Lookback date {} has no {} data: {}",
                                gap.date,
                                gap.column,
                                gap.reason
                            );
                        }
                        vec![None; ctx.assets.len()]
                    }
                };
                if let Some(rows) = store.get_mut(&id) {
                    rows[ctx.t] = Some(row);
                }
            }
        }
        failure
    }

    fn compute(
        &self,
        term: &Term,
        ctx: &DateContext,
        store: &TermStore,
    ) -> std::result::Result<Vec<Cell>, DateGap> {
        match term.kind() {
            TermKind::Column { id, dtype } => self.fetch_column(id, *dtype, ctx),
            TermKind::Constant(v) => Ok(vec![Value::float(*v); ctx.assets.len()]),
            TermKind::CrossSectional(op) => Ok(self.compute_cross(*op, term, ctx, store)),
            kind => Ok(self.compute_per_asset(kind, term, ctx, store)),
        }
    }

    /// Latest row of `id`, if computed for this date
    fn row<'s>(&self, id: TermId, ctx: &DateContext, store: &'s TermStore) -> Option<&'s Vec<Cell>> {
        store.get(&id).and_then(|rows| rows[ctx.t].as_ref())
    }

    /// Which assets the term's mask lets through
    fn mask(&self, term: &Term, ctx: &DateContext, store: &TermStore) -> Option<Vec<bool>> {
        let mask = term.mask()?;
        let row = self.row(mask.id(), ctx, store);
        Some(
            (0..ctx.assets.len())
                .map(|a| row.map_or(false, |r| cell_bool(&r[a]) == Some(true)))
                .collect(),
        )
    }

    fn compute_per_asset(
        &self,
        kind: &TermKind,
        term: &Term,
        ctx: &DateContext,
        store: &TermStore,
    ) -> Vec<Cell> {
        let window = term.window_length();
        let mask = self.mask(term, ctx, store);

        // For each input, the rows of the trailing window, oldest first
        let input_rows: Vec<Vec<Option<&Vec<Cell>>>> = term
            .inputs()
            .iter()
            .map(|input| {
                let rows = store.get(&input.id());
                (0..window)
                    .map(|k| {
                        let back = window - 1 - k;
                        if back > ctx.t {
                            return None;
                        }
                        rows.and_then(|r| r[ctx.t - back].as_ref())
                    })
                    .collect()
            })
            .collect();

        let latest = |windows: &[Vec<Cell>], i: usize| -> Cell {
            windows.get(i).and_then(|w| w.last().copied()).flatten()
        };

        (0..ctx.assets.len())
            .map(|a| {
                if mask.as_ref().map_or(false, |m| !m[a]) {
                    return None;
                }

                let windows: Vec<Vec<Cell>> = input_rows
                    .iter()
                    .map(|rows| rows.iter().map(|r| r.and_then(|r| r[a])).collect())
                    .collect();

                match kind {
                    TermKind::Windowed(op) => factors::compute_windowed(*op, &windows[0]),
                    TermKind::Arithmetic(op) => {
                        factors::compute_arithmetic(*op, &latest(&windows, 0), &latest(&windows, 1))
                    }
                    TermKind::Compare(op) => {
                        filters::compute_compare(*op, &latest(&windows, 0), &latest(&windows, 1))
                    }
                    TermKind::Logical(op) => {
                        let operands: Vec<Cell> = (0..windows.len()).map(|i| latest(&windows, i)).collect();
                        filters::compute_logical(*op, &operands)
                    }
                    TermKind::NullCheck { negate } => {
                        filters::compute_null_check(*negate, &latest(&windows, 0))
                    }
                    TermKind::LabelEq(label) => {
                        classifiers::compute_label_eq(*label, &latest(&windows, 0))
                    }
                    TermKind::Custom(custom) => {
                        let slices: Vec<&[Cell]> = windows.iter().map(Vec::as_slice).collect();
                        custom.0.compute(&slices)
                    }
                    TermKind::Column { .. } | TermKind::Constant(_) | TermKind::CrossSectional(_) => None,
                }
            })
            .collect()
    }

    fn compute_cross(&self, op: CrossOp, term: &Term, ctx: &DateContext, store: &TermStore) -> Vec<Cell> {
        let mask = self.mask(term, ctx, store);
        let input = term.inputs().first().and_then(|i| self.row(i.id(), ctx, store));

        let values: Vec<Option<f64>> = (0..ctx.assets.len())
            .map(|a| {
                let included = ctx.members[a] && mask.as_ref().map_or(true, |m| m[a]);
                if !included {
                    return None;
                }
                input.and_then(|row| cell_f64(&row[a]))
            })
            .collect();

        let mut out = match op {
            CrossOp::Rank => factors::rank(&values),
            CrossOp::ZScore => factors::zscore(&values),
            CrossOp::Demean => factors::demean(&values),
            CrossOp::Top(n) => filters::top_bottom(&values, n, true),
            CrossOp::Bottom(n) => filters::top_bottom(&values, n, false),
            CrossOp::PercentileBetween { lo, hi } => filters::percentile_between(&values, lo, hi),
            CrossOp::Quantiles(bins) => classifiers::quantiles(&values, bins),
        };

        if let Some(mask) = &mask {
            for (cell, included) in out.iter_mut().zip(mask) {
                if !included {
                    *cell = None;
                }
            }
        }
        out
    }

    /// Raw column values dated exactly on the evaluation date
    fn fetch_column(
        &self,
        column: &str,
        dtype: DType,
        ctx: &DateContext,
    ) -> std::result::Result<Vec<Cell>, DateGap> {
        let observations = self.fetch_with_retry(column, ctx)?;

        let mut row = vec![None; ctx.assets.len()];
        for obs in observations {
            if obs.date != ctx.date {
                continue;
            }
            if let Some(&i) = ctx.index.get(&obs.asset) {
                row[i] = obs.value.and_then(|v| raw_value(v, dtype));
            }
        }
        Ok(row)
    }

    fn fetch_with_retry(
        &self,
        column: &str,
        ctx: &DateContext,
    ) -> std::result::Result<Vec<Observation>, DateGap> {
        let attempts = self.config.fetch_retries + 1;
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = self.config.retry_backoff_ms.saturating_mul(1 << (attempt - 1).min(16));
                thread::sleep(std::time::Duration::from_millis(backoff));
            }

            match self.fetch_once(column, ctx) {
                Ok(observations) => return Ok(observations),
                Err(e) => {
                    log::debug!(
                        "Fetch of {} for {} failed (attempt {}/{}): {}",
                        column,
                        ctx.date,
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        let timed_out = matches!(last_error, Some(PipelineError::DataFetchTimeout { .. }));
        Err(DateGap {
            date: ctx.date,
            column: column.to_string(),
            attempts,
            timed_out,
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    fn fetch_once(&self, column: &str, ctx: &DateContext) -> Result<Vec<Observation>> {
        let Some(timeout) = self.config.fetch_timeout() else {
            return self.data.fetch(column, ctx.assets, ctx.date, 1);
        };

        let (tx, rx) = mpsc::channel();
        let data = Arc::clone(self.data);
        let column_id = column.to_string();
        let assets = ctx.assets.to_vec();
        let date = ctx.date;

        // An abandoned fetch keeps running until the source returns; its
        // result is dropped with the channel.
        thread::Builder::new()
            .name("pipeline-fetch".into())
            .spawn(move || {
                let _ = tx.send(data.fetch(&column_id, &assets, date, 1));
            })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(PipelineError::DataFetchTimeout {
                column: column.to_string(),
                date,
                attempts: 1,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::Data(format!(
                "fetch worker for {} exited without a result",
                column
            ))),
        }
    }

    /// Append the retained rows of one output date
    fn assemble(
        &self,
        ctx: &DateContext,
        snapshot: &[AssetId],
        store: &TermStore,
        result: &mut ExecutionResult,
    ) {
        let screen = self.screen.map(|id| self.row(id, ctx, store));
        let output_rows: Vec<Option<&Vec<Cell>>> =
            self.outputs.iter().map(|id| self.row(*id, ctx, store)).collect();

        for asset in snapshot {
            let i = ctx.index[asset];
            if let Some(screen) = screen {
                let passed = screen.map_or(false, |row| cell_bool(&row[i]) == Some(true));
                if !passed {
                    continue;
                }
            }

            let values = output_rows
                .iter()
                .map(|row| row.and_then(|r| r[i]))
                .collect();
            result.push_row(ResultRow {
                date: ctx.date,
                asset: *asset,
                values,
            });
        }
    }
}

/// Convert a raw stored number into a value of the column's type
fn raw_value(v: f64, dtype: DType) -> Cell {
    match dtype {
        DType::Float64 => Value::float(v),
        DType::Bool if v.is_finite() => Some(Value::Bool(v != 0.0)),
        DType::Category if v.is_finite() => Some(Value::Category(v.round() as i64)),
        _ => None,
    }
}
