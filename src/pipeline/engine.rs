//! Pipeline execution engine for factor-based screens
//!
//! A [`Pipeline`] names output terms and an optional screen. The
//! [`PipelineEngine`] resolves it into a term graph, schedules the lookback
//! history it needs and evaluates it over a date range.

use crate::calendar::TradingCalendar;
use crate::data::DataSource;
use crate::error::{PipelineError, Result};
use crate::pipeline::evaluator::ChunkEvaluator;
use crate::pipeline::graph::TermGraph;
use crate::pipeline::result::ExecutionResult;
use crate::pipeline::schedule::WindowSchedule;
use crate::pipeline::term::Term;
use crate::universe::{UniverseCache, UniverseSource};
use chrono::NaiveDate;
use hashbrown::HashSet;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Pipeline definition: named output terms plus an optional screen
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    columns: Vec<(String, Term)>,
    screen: Option<Term>,
}

impl Pipeline {
    /// Start an empty pipeline
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Build a pipeline from named terms; names must be unique
    pub fn new<N: Into<String>>(
        columns: impl IntoIterator<Item = (N, Term)>,
        screen: Option<Term>,
    ) -> Result<Self> {
        let mut builder = Self::builder();
        for (name, term) in columns {
            builder = builder.add(name, term);
        }
        if let Some(screen) = screen {
            builder = builder.screen(screen);
        }
        builder.build()
    }

    /// Output columns in declared order
    pub fn columns(&self) -> &[(String, Term)] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Term> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn screen(&self) -> Option<&Term> {
        self.screen.as_ref()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Incremental [`Pipeline`] construction
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    columns: Vec<(String, Term)>,
    screen: Option<Term>,
}

impl PipelineBuilder {
    pub fn add(mut self, name: impl Into<String>, term: Term) -> Self {
        self.columns.push((name.into(), term));
        self
    }

    pub fn screen(mut self, screen: Term) -> Self {
        self.screen = Some(screen);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        {
            let mut seen = HashSet::new();
            for (name, _) in &self.columns {
                if !seen.insert(name.as_str()) {
                    return Err(PipelineError::DuplicateColumn(name.clone()));
                }
            }
        }
        Ok(Pipeline {
            columns: self.columns,
            screen: self.screen,
        })
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound on date chunks evaluated concurrently
    pub max_parallel_dates: usize,
    /// Per-attempt limit on a single column fetch; unlimited when unset
    pub fetch_timeout_ms: Option<u64>,
    /// Additional attempts after a failed fetch
    pub fetch_retries: u32,
    /// Base delay between attempts, doubled on each retry
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_dates: 1,
            fetch_timeout_ms: None,
            fetch_retries: 2,
            retry_backoff_ms: 25,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_dates == 0 {
            return Err(PipelineError::Config(
                "max_parallel_dates must be at least 1".to_string(),
            ));
        }
        if self.fetch_timeout_ms == Some(0) {
            return Err(PipelineError::Config(
                "fetch_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }
}

/// Partial engine settings layered over an [`EngineConfig`]; unset fields
/// keep the base value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOverrides {
    pub max_parallel_dates: Option<usize>,
    pub fetch_timeout_ms: Option<u64>,
    pub fetch_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
}

impl EngineOverrides {
    /// Copy every set field onto `base`
    pub fn apply(&self, base: &EngineConfig) -> EngineConfig {
        EngineConfig {
            max_parallel_dates: self.max_parallel_dates.unwrap_or(base.max_parallel_dates),
            fetch_timeout_ms: self.fetch_timeout_ms.or(base.fetch_timeout_ms),
            fetch_retries: self.fetch_retries.unwrap_or(base.fetch_retries),
            retry_backoff_ms: self.retry_backoff_ms.unwrap_or(base.retry_backoff_ms),
        }
    }
}

/// Evaluates pipelines against a data source, calendar and universe
pub struct PipelineEngine {
    config: EngineConfig,
    data: Arc<dyn DataSource>,
    calendar: Arc<dyn TradingCalendar>,
    universe: UniverseCache,
}

impl PipelineEngine {
    pub fn new(
        config: EngineConfig,
        data: Arc<dyn DataSource>,
        calendar: Arc<dyn TradingCalendar>,
        universe: Arc<dyn UniverseSource>,
    ) -> Self {
        Self {
            config,
            data,
            calendar,
            universe: UniverseCache::new(universe),
        }
    }

    /// Engine with default configuration
    pub fn default_engine(
        data: Arc<dyn DataSource>,
        calendar: Arc<dyn TradingCalendar>,
        universe: Arc<dyn UniverseSource>,
    ) -> Self {
        Self::new(EngineConfig::default(), data, calendar, universe)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Evaluate `pipeline` on every trading date in `[start, end]`
    ///
    /// Construction problems (cycles, type mismatches, bad windows) and
    /// missing lookback history fail before any data is fetched. An output
    /// date whose fetches keep failing is recorded as a gap in the result;
    /// the call only fails when every output date is a gap.
    pub fn evaluate(
        &self,
        pipeline: &Pipeline,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ExecutionResult> {
        self.config.validate()?;

        let graph = TermGraph::build(pipeline)?;
        let schedule = WindowSchedule::compute(&graph);
        let plan = schedule.plan(self.calendar.as_ref(), start, end)?;

        let mut result = ExecutionResult::new(
            pipeline.column_names(),
            pipeline.columns().iter().map(|(_, t)| t.dtype()).collect(),
        );
        if plan.is_empty() {
            log::info!("No trading dates between {} and {}", start, end);
            return Ok(result);
        }

        log::info!(
            "Evaluating {} terms over {} dates ({} lookback)",
            graph.len(),
            plan.output_dates.len(),
            plan.lookback_dates.len()
        );

        let chunks = plan.chunks(self.config.max_parallel_dates);
        let evaluator = ChunkEvaluator::new(
            &graph,
            &schedule,
            pipeline,
            &self.data,
            &self.universe,
            &self.config,
        );

        let partials: Vec<Result<ExecutionResult>> = if chunks.len() == 1 {
            vec![evaluator.evaluate(&chunks[0])]
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(chunks.len())
                .thread_name(|i| format!("pipeline-dates-{}", i))
                .build()
                .map_err(|e| PipelineError::Config(e.to_string()))?;
            pool.install(|| chunks.par_iter().map(|c| evaluator.evaluate(c)).collect())
        };

        for partial in partials {
            result.append(partial?);
        }

        if result.gaps().len() == plan.output_dates.len() {
            if let Some(gap) = result.gaps().first() {
                return Err(if gap.timed_out {
                    PipelineError::DataFetchTimeout {
                        column: gap.column.clone(),
                        date: gap.date,
                        attempts: gap.attempts,
                    }
                } else {
                    PipelineError::Data(format!(
                        "no output date could be evaluated; {} on {}: {}",
                        gap.column, gap.date, gap.reason
                    ))
                });
            }
        }

        let missing = result.missing_cells();
        if missing > 0 {
            log::debug!("{} output cells have no value", missing);
        }
        log::info!(
            "Pipeline complete: {} rows, {} skipped dates",
            result.len(),
            result.gaps().len()
        );

        Ok(result)
    }
}
