//! Dataset catalog
//!
//! Typed constructors for the built-in dataset columns, and a name-keyed
//! [`Catalog`] used when pipelines are described in text.

use crate::error::{PipelineError, Result};
use crate::pipeline::term::{DType, Term};
use std::collections::BTreeMap;

/// Daily US equity pricing
pub struct USEquityPricing;

impl USEquityPricing {
    pub const NAME: &'static str = "USEquityPricing";

    pub fn open() -> Term {
        Term::column("USEquityPricing.open", DType::Float64)
    }

    pub fn high() -> Term {
        Term::column("USEquityPricing.high", DType::Float64)
    }

    pub fn low() -> Term {
        Term::column("USEquityPricing.low", DType::Float64)
    }

    pub fn close() -> Term {
        Term::column("USEquityPricing.close", DType::Float64)
    }

    pub fn volume() -> Term {
        Term::column("USEquityPricing.volume", DType::Float64)
    }
}

/// Daily social sentiment scores
pub struct StockTwits;

impl StockTwits {
    pub const NAME: &'static str = "stocktwits";

    /// Bullish minus bearish message score
    pub fn bull_minus_bear() -> Term {
        Term::column("stocktwits.bull_minus_bear", DType::Float64)
    }

    pub fn bull_scored_messages() -> Term {
        Term::column("stocktwits.bull_scored_messages", DType::Float64)
    }

    pub fn bear_scored_messages() -> Term {
        Term::column("stocktwits.bear_scored_messages", DType::Float64)
    }

    pub fn total_scored_messages() -> Term {
        Term::column("stocktwits.total_scored_messages", DType::Float64)
    }
}

/// Reference fundamentals
pub struct Fundamentals;

impl Fundamentals {
    pub const NAME: &'static str = "Fundamentals";

    /// Morningstar-style sector code
    pub fn sector() -> Term {
        Term::column("Fundamentals.sector", DType::Category)
    }

    pub fn market_cap() -> Term {
        Term::column("Fundamentals.market_cap", DType::Float64)
    }
}

/// Name-keyed registry of dataset columns
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    columns: BTreeMap<String, DType>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding every built-in dataset column
    pub fn standard() -> Self {
        let mut catalog = Self::new();
        for term in [
            USEquityPricing::open(),
            USEquityPricing::high(),
            USEquityPricing::low(),
            USEquityPricing::close(),
            USEquityPricing::volume(),
            StockTwits::bull_minus_bear(),
            StockTwits::bull_scored_messages(),
            StockTwits::bear_scored_messages(),
            StockTwits::total_scored_messages(),
            Fundamentals::sector(),
            Fundamentals::market_cap(),
        ] {
            catalog.columns.insert(term.name().to_string(), term.dtype());
        }
        catalog
    }

    /// Add a column, replacing the type of an existing one
    pub fn register(&mut self, name: impl Into<String>, dtype: DType) -> &mut Self {
        self.columns.insert(name.into(), dtype);
        self
    }

    /// Leaf term for a column name such as `USEquityPricing.close`
    pub fn column(&self, name: &str) -> Result<Term> {
        self.columns
            .get(name)
            .map(|dtype| Term::column(name, *dtype))
            .ok_or_else(|| PipelineError::UnknownColumn(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Column names with their types, sorted by name
    pub fn entries(&self) -> impl Iterator<Item = (&str, DType)> {
        self.columns.iter().map(|(name, dtype)| (name.as_str(), *dtype))
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
