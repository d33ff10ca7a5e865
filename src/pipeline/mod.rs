//! Pipeline system for cross-sectional factor screens

pub mod catalog;
pub mod classifiers;
pub mod definition;
pub mod engine;
mod evaluator;
pub mod factors;
pub mod filters;
pub mod graph;
pub mod result;
pub mod schedule;
pub mod term;

pub use catalog::{Catalog, Fundamentals, StockTwits, USEquityPricing};
pub use definition::{PipelineDefinition, TermSpec};
pub use engine::{EngineConfig, EngineOverrides, Pipeline, PipelineBuilder, PipelineEngine};
pub use factors::{ExponentialWeightedMovingAverage, Returns, SimpleMovingAverage, StdDev};
pub use graph::TermGraph;
pub use result::{DateGap, ExecutionResult, ResultRow};
pub use schedule::{DateChunk, ExecutionPlan, WindowSchedule};
pub use term::{
    ArithOp, CmpOp, CrossOp, CustomTerm, DType, Evaluation, LogicOp, Term, TermId, TermKind,
    WindowedFactor,
};
