//! Market data collaborators
//!
//! The engine reads raw column values through [`DataSource`] and never writes
//! back to it.

use crate::error::{PipelineError, Result};
use crate::types::{AssetId, ColumnId};
use crate::universe::UniverseSource;
use chrono::NaiveDate;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;

/// One raw observation of a column for an asset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub asset: AssetId,
    /// `None` when the source knows the asset but has no value for the date
    pub value: Option<f64>,
}

/// Data source trait for raw column values
pub trait DataSource: Send + Sync {
    /// Fetch, for each requested asset, its most recent `lookback` observations
    /// of `column` dated on or before `as_of`, ascending by date.
    ///
    /// Assets without any observation are simply absent from the output.
    fn fetch(
        &self,
        column: &str,
        assets: &[AssetId],
        as_of: NaiveDate,
        lookback: usize,
    ) -> Result<Vec<Observation>>;
}

/// Row of the long-format CSV layout: `date,asset,column,value`
#[derive(Debug, Deserialize)]
struct DataRecord {
    date: NaiveDate,
    asset: AssetId,
    column: String,
    value: Option<f64>,
}

/// In-memory data source
#[derive(Debug, Default, Clone)]
pub struct InMemoryDataSource {
    /// column -> asset -> date -> value
    columns: HashMap<ColumnId, HashMap<AssetId, BTreeMap<NaiveDate, Option<f64>>>>,
    /// Assets observed on each date, across all columns
    observed: BTreeMap<NaiveDate, BTreeSet<AssetId>>,
}

impl InMemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or overwrite) one observation
    pub fn insert(&mut self, column: &str, asset: AssetId, date: NaiveDate, value: Option<f64>) {
        self.columns
            .entry(column.to_string())
            .or_insert_with(HashMap::new)
            .entry(asset)
            .or_insert_with(BTreeMap::new)
            .insert(date, value);
        self.observed.entry(date).or_default().insert(asset);
    }

    /// Insert a series of consecutive observations for one asset
    pub fn insert_series(
        &mut self,
        column: &str,
        asset: AssetId,
        dates: &[NaiveDate],
        values: &[Option<f64>],
    ) {
        for (date, value) in dates.iter().zip(values) {
            self.insert(column, asset, *date, *value);
        }
    }

    /// Remove every observation of `column` dated after `date`
    pub fn truncate_after(&mut self, column: &str, date: NaiveDate) {
        let Some(by_asset) = self.columns.get_mut(column) else {
            return;
        };
        let cutoff = date + chrono::Duration::days(1);
        let mut removed: Vec<(NaiveDate, AssetId)> = Vec::new();
        for (asset, series) in by_asset.iter_mut() {
            removed.extend(series.split_off(&cutoff).into_keys().map(|d| (d, *asset)));
        }

        // An asset stays observed while another column still has that date
        for (d, asset) in removed {
            let still_observed = self
                .columns
                .values()
                .any(|assets| assets.get(&asset).map_or(false, |s| s.contains_key(&d)));
            if still_observed {
                continue;
            }
            if let Some(assets) = self.observed.get_mut(&d) {
                assets.remove(&asset);
                if assets.is_empty() {
                    self.observed.remove(&d);
                }
            }
        }
    }

    /// Load the long-format CSV layout `date,asset,column,value`.
    ///
    /// An empty `value` field is stored as an explicit no-value.
    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let mut source = Self::new();

        for record in csv_reader.deserialize() {
            let record: DataRecord = record?;
            source.insert(&record.column, record.asset, record.date, record.value);
        }

        log::debug!(
            "Loaded {} columns over {} dates",
            source.columns.len(),
            source.observed.len()
        );
        Ok(source)
    }

    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            PipelineError::Data(format!("Failed to open {}: {}", path.display(), e))
        })?;
        Self::from_reader(file)
    }

    /// All dates with at least one observation, ascending
    pub fn dates(&self) -> Vec<NaiveDate> {
        self.observed.keys().copied().collect()
    }

    /// Names of the stored columns, sorted
    pub fn column_ids(&self) -> Vec<ColumnId> {
        let mut ids: Vec<ColumnId> = self.columns.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }
}

impl DataSource for InMemoryDataSource {
    fn fetch(
        &self,
        column: &str,
        assets: &[AssetId],
        as_of: NaiveDate,
        lookback: usize,
    ) -> Result<Vec<Observation>> {
        let Some(by_asset) = self.columns.get(column) else {
            return Err(PipelineError::UnknownColumn(column.to_string()));
        };

        let mut out = Vec::with_capacity(assets.len() * lookback);
        for &asset in assets {
            let Some(series) = by_asset.get(&asset) else {
                continue;
            };
            let window: Vec<_> = series.range(..=as_of).rev().take(lookback).collect();
            out.extend(window.into_iter().rev().map(|(date, value)| Observation {
                date: *date,
                asset,
                value: *value,
            }));
        }

        Ok(out)
    }
}

impl UniverseSource for InMemoryDataSource {
    /// Assets with any observation on `date`
    fn snapshot(&self, date: NaiveDate) -> Vec<AssetId> {
        self.observed
            .get(&date)
            .map(|assets| assets.iter().copied().collect())
            .unwrap_or_default()
    }
}
