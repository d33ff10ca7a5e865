//! Integration tests for pipeline evaluation
//!
//! Exercises the engine end to end: windows and lookback, screens and masks,
//! universe changes, fetch failures and parallel date chunks.

use approx::assert_relative_eq;
use chrono::NaiveDate;
use proptest::prelude::*;
use rusty_pipeline::calendar::SessionCalendar;
use rusty_pipeline::data::{DataSource, InMemoryDataSource, Observation};
use rusty_pipeline::error::{PipelineError, Result};
use rusty_pipeline::pipeline::{
    CustomTerm, DType, EngineConfig, ExecutionResult, Pipeline, PipelineEngine, Returns,
    SimpleMovingAverage, StockTwits, Term, USEquityPricing,
};
use rusty_pipeline::types::{AssetId, Cell, Value};
use rusty_pipeline::universe::{DatedUniverse, StaticUniverse, UniverseSource};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CLOSE: &str = "USEquityPricing.close";
const VOLUME: &str = "USEquityPricing.volume";
const SENTIMENT: &str = "stocktwits.bull_minus_bear";

const X: AssetId = 1;
const Y: AssetId = 2;

/// Consecutive sessions starting 2024-01-01
fn day(i: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Duration::days(i as i64)
}

fn sessions(n: u32) -> Arc<SessionCalendar> {
    Arc::new(SessionCalendar::new((0..n).map(day)))
}

fn engine_with(
    config: EngineConfig,
    data: impl DataSource + 'static,
    calendar: Arc<SessionCalendar>,
    universe: impl UniverseSource + 'static,
) -> PipelineEngine {
    PipelineEngine::new(config, Arc::new(data), calendar, Arc::new(universe))
}

fn engine(
    data: impl DataSource + 'static,
    calendar: Arc<SessionCalendar>,
    universe: impl UniverseSource + 'static,
) -> PipelineEngine {
    engine_with(EngineConfig::default(), data, calendar, universe)
}

fn fast_retries() -> EngineConfig {
    EngineConfig {
        fetch_retries: 1,
        retry_backoff_ms: 1,
        ..EngineConfig::default()
    }
}

/// Session 0 carries no data; sessions 1..=3 hold the example values
fn scenario_data() -> InMemoryDataSource {
    let mut data = InMemoryDataSource::new();
    let dates = [day(1), day(2), day(3)];
    data.insert_series(CLOSE, X, &dates, &[Some(10.0), Some(11.0), Some(12.0)]);
    data.insert_series(CLOSE, Y, &dates, &[None, Some(5.0), Some(6.0)]);
    data.insert_series(SENTIMENT, X, &dates, &[Some(0.2), Some(-0.1), Some(0.4)]);
    data.insert_series(SENTIMENT, Y, &dates, &[Some(0.1), Some(0.1), Some(0.1)]);
    data
}

fn float_at(result: &ExecutionResult, date: NaiveDate, asset: AssetId, column: &str) -> Option<f64> {
    result.float(date, asset, column)
}

#[test]
fn test_sentiment_scenario_with_close_screen() {
    let close = USEquityPricing::close();
    let pipeline = Pipeline::builder()
        .add("sentiment", SimpleMovingAverage::new(&StockTwits::bull_minus_bear(), 2))
        .add("close", close.clone())
        .screen(close.gt(10.0))
        .build()
        .unwrap();

    let engine = engine(scenario_data(), sessions(4), StaticUniverse::new([X, Y]));
    let result = engine.evaluate(&pipeline, day(1), day(3)).unwrap();

    // X on day 1 fails the screen (10 > 10 is false), Y never passes
    assert_eq!(result.len(), 2);
    assert!(result.row(day(1), X).is_none());
    assert!(result.row(day(2), Y).is_none());

    assert_relative_eq!(float_at(&result, day(2), X, "sentiment").unwrap(), 0.05, epsilon = 1e-12);
    assert_relative_eq!(float_at(&result, day(3), X, "sentiment").unwrap(), 0.15, epsilon = 1e-12);
    assert_eq!(float_at(&result, day(3), X, "close"), Some(12.0));
    assert!(result.gaps().is_empty());
}

#[test]
fn test_sentiment_scenario_without_screen() {
    let pipeline = Pipeline::builder()
        .add("sentiment", SimpleMovingAverage::new(&StockTwits::bull_minus_bear(), 2))
        .build()
        .unwrap();

    let engine = engine(scenario_data(), sessions(4), StaticUniverse::new([X, Y]));
    let result = engine.evaluate(&pipeline, day(1), day(3)).unwrap();

    // Session 0 has no observation, so the first window is incomplete
    assert_eq!(result.value(day(1), X, "sentiment"), Some(None));
    assert_eq!(result.value(day(1), Y, "sentiment"), Some(None));
    assert_relative_eq!(float_at(&result, day(2), Y, "sentiment").unwrap(), 0.1, epsilon = 1e-12);
    assert_eq!(result.missing_cells(), 2);
}

#[test]
fn test_one_row_per_universe_member_without_screen() {
    let mut data = InMemoryDataSource::new();
    for d in 0..4 {
        for asset in 1..=3 {
            data.insert(CLOSE, asset, day(d), Some(10.0 + d as f64));
        }
    }

    let mut universe = DatedUniverse::new();
    universe.set(day(1), [1, 2]);
    universe.set(day(2), [3, 1, 2]);
    universe.set(day(3), [2]);

    let pipeline = Pipeline::builder()
        .add("close", USEquityPricing::close())
        .add("ranked", USEquityPricing::close().rank())
        .build()
        .unwrap();

    let result = engine(data, sessions(4), universe)
        .evaluate(&pipeline, day(1), day(3))
        .unwrap();

    assert_eq!(result.assets_on(day(1)), vec![1, 2]);
    assert_eq!(result.assets_on(day(2)).len(), 3);
    assert_eq!(result.assets_on(day(3)), vec![2]);
    assert_eq!(result.len(), 6);

    // Rank only sees the date's own members
    assert_eq!(float_at(&result, day(3), 2, "ranked"), Some(1.0));
}

#[test]
fn test_window_one_terms_use_only_same_day_data() {
    let mut data = InMemoryDataSource::new();
    data.insert(CLOSE, X, day(0), Some(9.0));
    data.insert(CLOSE, X, day(1), Some(10.0));
    data.insert(CLOSE, Y, day(0), Some(4.0));
    // Y has no close on day 1; the day 0 value must not be carried forward
    data.insert(CLOSE, X, day(2), Some(11.0));
    data.insert(CLOSE, Y, day(2), Some(5.0));

    let close = USEquityPricing::close();
    let pipeline = Pipeline::builder()
        .add("close", close.latest())
        .add("missing", close.isnull())
        .build()
        .unwrap();

    let result = engine(data, sessions(3), StaticUniverse::new([X, Y]))
        .evaluate(&pipeline, day(1), day(2))
        .unwrap();

    assert_eq!(float_at(&result, day(1), X, "close"), Some(10.0));
    assert_eq!(result.value(day(1), Y, "close"), Some(None));
    assert_eq!(result.value(day(1), Y, "missing"), Some(Some(Value::Bool(true))));
    assert_eq!(float_at(&result, day(2), Y, "close"), Some(5.0));
}

#[test]
fn test_and_or_not_screens() {
    let mut data = InMemoryDataSource::new();
    let assets: [(AssetId, Option<f64>, Option<f64>); 4] = [
        (1, Some(20.0), Some(500.0)), // both true
        (2, Some(20.0), Some(50.0)),  // liquid fails
        (3, Some(5.0), Some(500.0)),  // price fails
        (4, None, Some(500.0)),       // price unknown
    ];
    for (asset, close, volume) in assets {
        data.insert(CLOSE, asset, day(0), close);
        data.insert(VOLUME, asset, day(0), volume);
    }

    let priced = USEquityPricing::close().gt(10.0);
    let liquid = USEquityPricing::volume().gt(100.0);
    let universe = StaticUniverse::new([1, 2, 3, 4]);
    let engine = engine(data, sessions(1), universe);

    let run = |screen: Term| -> Vec<AssetId> {
        let pipeline = Pipeline::builder()
            .add("close", USEquityPricing::close())
            .screen(screen)
            .build()
            .unwrap();
        engine.evaluate(&pipeline, day(0), day(0)).unwrap().assets_on(day(0))
    };

    assert_eq!(run(&priced & &liquid), vec![1]);
    assert_eq!(run(priced.or(&liquid)), vec![1, 2, 3, 4]);
    assert_eq!(run(priced.clone()), vec![1, 2]);
    // No-value stays no-value under negation and is not retained
    assert_eq!(run(!&priced), vec![3]);
}

#[test]
fn test_masked_cross_section() {
    let mut data = InMemoryDataSource::new();
    for (asset, close) in [(1, 30.0), (2, 5.0), (3, 20.0), (4, 10.0)] {
        data.insert(CLOSE, asset, day(0), Some(close));
    }

    let close = USEquityPricing::close();
    let mask = close.ge(10.0);
    let pipeline = Pipeline::builder()
        .add("ranked", close.rank().with_mask(&mask))
        .add("top", close.top(1).with_mask(&mask))
        .add("z", close.zscore())
        .build()
        .unwrap();

    let result = engine(data, sessions(1), StaticUniverse::new([1, 2, 3, 4]))
        .evaluate(&pipeline, day(0), day(0))
        .unwrap();

    assert_eq!(float_at(&result, day(0), 2, "ranked"), None);
    assert_eq!(float_at(&result, day(0), 4, "ranked"), Some(1.0));
    assert_eq!(float_at(&result, day(0), 1, "ranked"), Some(3.0));
    assert_eq!(result.value(day(0), 1, "top"), Some(Some(Value::Bool(true))));
    assert_eq!(result.value(day(0), 2, "top"), Some(None));

    let z: f64 = [1, 2, 3, 4]
        .iter()
        .filter_map(|a| float_at(&result, day(0), *a, "z"))
        .sum();
    assert_relative_eq!(z, 0.0, epsilon = 1e-9);
}

#[test]
fn test_chained_windows_lookback() {
    let close = USEquityPricing::close();
    let a = SimpleMovingAverage::new(&close, 3);
    let b = SimpleMovingAverage::new(&a, 5);
    let c = SimpleMovingAverage::new(&b, 2);
    let pipeline = Pipeline::builder().add("c", c).build().unwrap();

    let mut data = InMemoryDataSource::new();
    for d in 0..10 {
        data.insert(CLOSE, X, day(d), Some(d as f64));
    }

    // Exactly seven sessions before the start are enough
    let result = engine(data.clone(), sessions(10), StaticUniverse::new([X]))
        .evaluate(&pipeline, day(7), day(9))
        .unwrap();
    assert_eq!(result.len(), 3);
    // mean over d-1..=d of mean over 5 of mean over 3 of close: (d - 3.5)
    assert_relative_eq!(float_at(&result, day(7), X, "c").unwrap(), 3.5, epsilon = 1e-9);
    assert_relative_eq!(float_at(&result, day(9), X, "c").unwrap(), 5.5, epsilon = 1e-9);

    let err = engine(data, sessions(10), StaticUniverse::new([X]))
        .evaluate(&pipeline, day(6), day(9))
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InsufficientHistory {
            required: 7,
            available: 6,
            ..
        }
    ));
}

#[test]
fn test_construction_errors_before_evaluation() {
    let engine = engine(scenario_data(), sessions(4), StaticUniverse::new([X]));
    let close = USEquityPricing::close();

    let bool_average = Pipeline::builder()
        .add("bad", SimpleMovingAverage::new(&close.gt(1.0), 2))
        .build()
        .unwrap();
    assert!(matches!(
        engine.evaluate(&bool_average, day(1), day(3)).unwrap_err(),
        PipelineError::TypeMismatch { .. }
    ));

    let numeric_screen = Pipeline::builder()
        .add("close", close.clone())
        .screen(close.clone())
        .build()
        .unwrap();
    assert!(matches!(
        engine.evaluate(&numeric_screen, day(1), day(3)).unwrap_err(),
        PipelineError::TypeMismatch { .. }
    ));

    let short_returns = Pipeline::builder()
        .add("r", Returns::new(&close, 1))
        .build()
        .unwrap();
    let err = engine.evaluate(&short_returns, day(1), day(3)).unwrap_err();
    assert!(matches!(err, PipelineError::InvalidWindowLength { .. }));
    assert!(err.is_construction_error());

    let valid = Pipeline::builder().add("close", close).build().unwrap();
    assert!(matches!(
        engine.evaluate(&valid, day(3), day(1)).unwrap_err(),
        PipelineError::InvalidDateRange { .. }
    ));
}

#[test]
fn test_empty_range_gives_empty_result() {
    let pipeline = Pipeline::builder()
        .add("close", USEquityPricing::close())
        .build()
        .unwrap();
    let result = engine(scenario_data(), sessions(4), StaticUniverse::new([X]))
        .evaluate(&pipeline, day(10), day(20))
        .unwrap();
    assert!(result.is_empty());
    assert_eq!(result.columns(), &["close".to_string()]);
}

struct Spread;

impl CustomTerm for Spread {
    fn name(&self) -> &str {
        "Spread"
    }

    fn dtype(&self) -> DType {
        DType::Float64
    }

    fn input_dtypes(&self) -> Vec<DType> {
        vec![DType::Float64, DType::Float64]
    }

    fn window_length(&self) -> usize {
        2
    }

    /// Change of the first input minus change of the second
    fn compute(&self, windows: &[&[Cell]]) -> Cell {
        let change = |w: &[Cell]| -> Option<f64> {
            Some(w[1]?.as_f64()? - w[0]?.as_f64()?)
        };
        Value::float(change(windows[0])? - change(windows[1])?)
    }
}

#[test]
fn test_custom_term() {
    let mut data = InMemoryDataSource::new();
    let dates = [day(0), day(1), day(2)];
    data.insert_series(CLOSE, X, &dates, &[Some(10.0), Some(13.0), Some(12.0)]);
    data.insert_series(VOLUME, X, &dates, &[Some(1.0), Some(2.0), None]);

    let spread = Term::custom(
        Arc::new(Spread),
        vec![USEquityPricing::close(), USEquityPricing::volume()],
    );
    assert_eq!(spread.name(), "Spread(USEquityPricing.close, USEquityPricing.volume)");

    let pipeline = Pipeline::builder().add("spread", spread).build().unwrap();
    let result = engine(data, sessions(3), StaticUniverse::new([X]))
        .evaluate(&pipeline, day(1), day(2))
        .unwrap();

    assert_eq!(float_at(&result, day(1), X, "spread"), Some(2.0));
    assert_eq!(float_at(&result, day(2), X, "spread"), None);
}

/// Data source that stalls on chosen dates
struct SlowSource {
    inner: InMemoryDataSource,
    slow_dates: Vec<NaiveDate>,
    delay: Duration,
}

impl DataSource for SlowSource {
    fn fetch(
        &self,
        column: &str,
        assets: &[AssetId],
        as_of: NaiveDate,
        lookback: usize,
    ) -> Result<Vec<Observation>> {
        if self.slow_dates.contains(&as_of) {
            std::thread::sleep(self.delay);
        }
        self.inner.fetch(column, assets, as_of, lookback)
    }
}

#[test]
fn test_timed_out_date_becomes_gap() {
    let source = SlowSource {
        inner: scenario_data(),
        slow_dates: vec![day(2)],
        delay: Duration::from_millis(300),
    };
    let config = EngineConfig {
        fetch_timeout_ms: Some(30),
        ..fast_retries()
    };

    let pipeline = Pipeline::builder()
        .add("close", USEquityPricing::close())
        .build()
        .unwrap();
    let result = engine_with(config, source, sessions(4), StaticUniverse::new([X, Y]))
        .evaluate(&pipeline, day(1), day(3))
        .unwrap();

    assert!(result.has_gap(day(2)));
    assert_eq!(result.gaps().len(), 1);
    let gap = &result.gaps()[0];
    assert_eq!(gap.column, CLOSE);
    assert_eq!(gap.attempts, 2);
    assert!(gap.timed_out);

    assert_eq!(result.dates(), vec![day(1), day(3)]);
    assert_eq!(float_at(&result, day(3), X, "close"), Some(12.0));
}

#[test]
fn test_every_date_timing_out_fails() {
    let source = SlowSource {
        inner: scenario_data(),
        slow_dates: vec![day(1), day(2)],
        delay: Duration::from_millis(300),
    };
    let config = EngineConfig {
        fetch_timeout_ms: Some(20),
        fetch_retries: 0,
        ..EngineConfig::default()
    };

    let pipeline = Pipeline::builder()
        .add("close", USEquityPricing::close())
        .build()
        .unwrap();
    let err = engine_with(config, source, sessions(4), StaticUniverse::new([X]))
        .evaluate(&pipeline, day(1), day(2))
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::DataFetchTimeout { column, attempts: 1, .. } if column == CLOSE
    ));
}

/// Data source failing on chosen dates, a limited number of times
struct FlakySource {
    inner: InMemoryDataSource,
    failing: NaiveDate,
    remaining_failures: AtomicUsize,
    calls: Mutex<Vec<NaiveDate>>,
}

impl FlakySource {
    fn new(inner: InMemoryDataSource, failing: NaiveDate, failures: usize) -> Self {
        Self {
            inner,
            failing,
            remaining_failures: AtomicUsize::new(failures),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl DataSource for FlakySource {
    fn fetch(
        &self,
        column: &str,
        assets: &[AssetId],
        as_of: NaiveDate,
        lookback: usize,
    ) -> Result<Vec<Observation>> {
        self.calls.lock().unwrap().push(as_of);
        if as_of == self.failing
            && self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(PipelineError::Data("connection reset".to_string()));
        }
        self.inner.fetch(column, assets, as_of, lookback)
    }
}

#[test]
fn test_transient_failure_is_retried() {
    let source = Arc::new(FlakySource::new(scenario_data(), day(2), 1));
    let engine = PipelineEngine::new(
        fast_retries(),
        source.clone(),
        sessions(4),
        Arc::new(StaticUniverse::new([X])),
    );
    let pipeline = Pipeline::builder()
        .add("close", USEquityPricing::close())
        .build()
        .unwrap();

    let result = engine.evaluate(&pipeline, day(1), day(3)).unwrap();
    assert!(result.gaps().is_empty());
    assert_eq!(float_at(&result, day(2), X, "close"), Some(11.0));

    let calls = source.calls.lock().unwrap();
    assert_eq!(calls.iter().filter(|d| **d == day(2)).count(), 2);
}

#[test]
fn test_failed_lookback_fetch_leaves_no_value() {
    let mut data = scenario_data();
    data.insert(SENTIMENT, X, day(0), Some(1.0));
    let source = FlakySource::new(data, day(0), usize::MAX);

    let pipeline = Pipeline::builder()
        .add("sentiment", SimpleMovingAverage::new(&StockTwits::bull_minus_bear(), 2))
        .build()
        .unwrap();
    let result = engine_with(fast_retries(), source, sessions(4), StaticUniverse::new([X]))
        .evaluate(&pipeline, day(1), day(2))
        .unwrap();

    assert!(result.gaps().is_empty());
    assert_eq!(result.value(day(1), X, "sentiment"), Some(None));
    assert_relative_eq!(float_at(&result, day(2), X, "sentiment").unwrap(), 0.05, epsilon = 1e-12);
}

/// Data source where one column is unavailable on one date
struct ColumnOutage {
    inner: InMemoryDataSource,
    column: &'static str,
    date: NaiveDate,
}

impl DataSource for ColumnOutage {
    fn fetch(
        &self,
        column: &str,
        assets: &[AssetId],
        as_of: NaiveDate,
        lookback: usize,
    ) -> Result<Vec<Observation>> {
        if column == self.column && as_of == self.date {
            return Err(PipelineError::Data(format!("{} unavailable", column)));
        }
        self.inner.fetch(column, assets, as_of, lookback)
    }
}

#[test]
fn test_column_outage_only_affects_its_date() {
    let mut data = InMemoryDataSource::new();
    let dates: Vec<NaiveDate> = (0..6).map(day).collect();
    data.insert_series(CLOSE, X, &dates, &[10.0, 11.0, 12.0, 13.0, 14.0, 15.0].map(Some));
    data.insert_series(VOLUME, X, &dates, &[Some(100.0); 6]);

    let close = USEquityPricing::close();
    let smooth = SimpleMovingAverage::new(&SimpleMovingAverage::new(&close, 2), 2);
    let pipeline = Pipeline::builder()
        .add("smooth", smooth)
        .add("volume", USEquityPricing::volume())
        .build()
        .unwrap();

    let run = |parallel: usize| {
        let config = EngineConfig {
            max_parallel_dates: parallel,
            ..fast_retries()
        };
        let source = ColumnOutage {
            inner: data.clone(),
            column: VOLUME,
            date: day(3),
        };
        engine_with(config, source, sessions(6), StaticUniverse::new([X]))
            .evaluate(&pipeline, day(2), day(5))
            .unwrap()
    };

    let sequential = run(1);
    assert_eq!(sequential.gaps().len(), 1);
    assert!(sequential.has_gap(day(3)));
    assert!(sequential.assets_on(day(3)).is_empty());
    // smooth never reads volume, so its window over the outage is intact
    assert_relative_eq!(float_at(&sequential, day(4), X, "smooth").unwrap(), 13.0);
    assert_relative_eq!(float_at(&sequential, day(5), X, "smooth").unwrap(), 14.0);
    assert_relative_eq!(float_at(&sequential, day(4), X, "volume").unwrap(), 100.0);

    // With two chunks the outage date is also the second chunk's lookback
    assert_eq!(run(2), sequential);
    assert_eq!(run(4), sequential);
}

fn wide_data(assets: u64, days: u32) -> InMemoryDataSource {
    let mut data = InMemoryDataSource::new();
    for d in 0..days {
        for asset in 1..=assets {
            let close = 10.0 + ((asset * 7 + d as u64 * 13) % 17) as f64;
            let volume = 100.0 * ((asset + d as u64) % 5) as f64;
            data.insert(CLOSE, asset, day(d), Some(close));
            data.insert(VOLUME, asset, day(d), if (asset + d as u64) % 6 == 0 { None } else { Some(volume) });
            data.insert(SENTIMENT, asset, day(d), Some(((asset as f64) - d as f64) / 10.0));
        }
    }
    data
}

fn wide_pipeline() -> Pipeline {
    let close = USEquityPricing::close();
    let volume = USEquityPricing::volume();
    let momentum = Returns::new(&close, 3);
    let liquid = volume.notnull() & volume.gt(0.0);
    Pipeline::builder()
        .add("momentum", momentum.clone())
        .add("momentum_rank", momentum.rank().with_mask(&liquid))
        .add("sentiment", SimpleMovingAverage::new(&StockTwits::bull_minus_bear(), 4).zscore())
        .add("bucket", close.quintiles())
        .add("dollar_volume", &close * &volume)
        .screen(liquid | close.gt(20.0))
        .build()
        .unwrap()
}

#[test]
fn test_parallel_chunks_match_sequential() {
    let universe = StaticUniverse::new(1..=12);
    let sequential = engine(wide_data(12, 30), sessions(30), universe.clone())
        .evaluate(&wide_pipeline(), day(5), day(29))
        .unwrap();

    let config = EngineConfig {
        max_parallel_dates: 4,
        ..EngineConfig::default()
    };
    let parallel = engine_with(config, wide_data(12, 30), sessions(30), universe)
        .evaluate(&wide_pipeline(), day(5), day(29))
        .unwrap();

    assert!(!sequential.is_empty());
    assert_eq!(sequential, parallel);
}

/// Universe counting snapshot requests per date
struct CountingUniverse {
    assets: Vec<AssetId>,
    calls: Mutex<Vec<NaiveDate>>,
}

impl UniverseSource for CountingUniverse {
    fn snapshot(&self, date: NaiveDate) -> Vec<AssetId> {
        self.calls.lock().unwrap().push(date);
        self.assets.clone()
    }
}

#[test]
fn test_universe_snapshot_fetched_once_per_date() {
    let universe = Arc::new(CountingUniverse {
        assets: (1..=5).collect(),
        calls: Mutex::new(Vec::new()),
    });
    let config = EngineConfig {
        max_parallel_dates: 3,
        ..EngineConfig::default()
    };
    let engine = PipelineEngine::new(config, Arc::new(wide_data(5, 20)), sessions(20), universe.clone());
    engine.evaluate(&wide_pipeline(), day(4), day(19)).unwrap();

    let mut calls = universe.calls.lock().unwrap().clone();
    let total = calls.len();
    calls.sort();
    calls.dedup();
    assert_eq!(total, calls.len());
    assert_eq!(calls.first(), Some(&day(1)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_sma_of_constant(value in -1.0e6f64..1.0e6, window in 1usize..6) {
        // Data starts on session 5; evaluation starts once lookback exists
        let mut data = InMemoryDataSource::new();
        for d in 5..16 {
            data.insert(CLOSE, X, day(d), Some(value));
        }
        let pipeline = Pipeline::builder()
            .add("sma", SimpleMovingAverage::new(&USEquityPricing::close(), window))
            .build()
            .unwrap();

        let start = (window - 1) as u32;
        let result = engine(data, sessions(16), StaticUniverse::new([X]))
            .evaluate(&pipeline, day(start), day(15))
            .unwrap();

        for d in start..16 {
            let got = float_at(&result, day(d), X, "sma");
            if d as usize >= 5 + window - 1 {
                let got = got.unwrap();
                prop_assert!((got - value).abs() <= 1e-9 * value.abs().max(1.0));
            } else {
                prop_assert_eq!(got, None);
            }
        }
    }

    #[test]
    fn prop_no_look_ahead(
        closes in prop::collection::vec(prop::option::weighted(0.85, 1.0f64..100.0), 24),
        cut in 6u32..11,
    ) {
        let mut data = InMemoryDataSource::new();
        for (i, close) in closes.iter().enumerate() {
            let asset = (i % 2) as AssetId + 1;
            let d = (i / 2) as u32;
            data.insert(CLOSE, asset, day(d), *close);
            data.insert(VOLUME, asset, day(d), close.map(|c| c * 3.0));
        }

        let close = USEquityPricing::close();
        let pipeline = Pipeline::builder()
            .add("sma", SimpleMovingAverage::new(&close, 3))
            .add("returns", Returns::new(&close, 2))
            .add("rank", close.rank())
            .add("z", (USEquityPricing::volume() / &close).zscore())
            .screen(close.notnull() | close.isnull())
            .build()
            .unwrap();

        let full = engine(data.clone(), sessions(12), StaticUniverse::new([1, 2]))
            .evaluate(&pipeline, day(2), day(11))
            .unwrap();

        let mut truncated = data;
        truncated.truncate_after(CLOSE, day(cut));
        truncated.truncate_after(VOLUME, day(cut));
        let partial = engine(truncated, sessions(12), StaticUniverse::new([1, 2]))
            .evaluate(&pipeline, day(2), day(cut))
            .unwrap();

        let before: Vec<_> = full.rows().iter().filter(|r| r.date <= day(cut)).cloned().collect();
        prop_assert_eq!(before.as_slice(), partial.rows());
    }
}
