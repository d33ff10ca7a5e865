//! # rusty_pipeline
//!
//! Cross-sectional factor pipelines over daily asset universes.
//!
//! A pipeline is a set of named terms (factors, filters and classifiers)
//! built from dataset columns, plus an optional screen. The engine resolves
//! the terms into a dependency graph, works out how much trailing history each
//! one needs, and evaluates them date by date across every asset in the
//! universe.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rusty_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> rusty_pipeline::error::Result<()> {
//! let data = InMemoryDataSource::from_csv_path("prices.csv".as_ref())?;
//! let calendar = Arc::new(SessionCalendar::new(data.dates()));
//! let data = Arc::new(data);
//!
//! let close = USEquityPricing::close();
//! let sentiment = SimpleMovingAverage::new(&StockTwits::bull_minus_bear(), 3);
//! let pipeline = Pipeline::builder()
//!     .add("sentiment", sentiment)
//!     .add("close", close.clone())
//!     .screen(close.gt(10.0))
//!     .build()?;
//!
//! let engine = PipelineEngine::default_engine(data.clone(), calendar, data);
//! let start = chrono::NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
//! let end = chrono::NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
//! let result = engine.evaluate(&pipeline, start, end)?;
//! println!("{} rows", result.len());
//! # Ok(())
//! # }
//! ```

pub mod calendar;
pub mod data;
pub mod error;
pub mod pipeline;
pub mod types;
pub mod universe;

pub mod prelude {
    //! Commonly used types and traits
    pub use crate::calendar::{SessionCalendar, TradingCalendar, WeekdayCalendar};
    pub use crate::data::{DataSource, InMemoryDataSource, Observation};
    pub use crate::error::{PipelineError, Result};
    pub use crate::pipeline::{
        Catalog, CustomTerm, DType, EngineConfig, ExecutionResult, ExponentialWeightedMovingAverage,
        Fundamentals, Pipeline, PipelineDefinition, PipelineEngine, Returns, SimpleMovingAverage,
        StdDev, StockTwits, Term, USEquityPricing,
    };
    pub use crate::types::{AssetId, Cell, Value};
    pub use crate::universe::{DatedUniverse, StaticUniverse, UniverseSource};
}
