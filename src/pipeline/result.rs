//! Pipeline execution results
//!
//! An [`ExecutionResult`] is a read-only table indexed by (date, asset) with
//! one cell per requested output column. Rows only exist for assets that were
//! in the universe and passed the screen; a missing output value is an empty
//! cell, never a dropped row.

use crate::error::Result;
use crate::pipeline::term::DType;
use crate::types::{cell_bool, cell_category, cell_f64, AssetId, Cell, Value};
use chrono::NaiveDate;
use polars::prelude::{DataFrame, NamedFrom, Series};
use serde::{Deserialize, Serialize};
use std::io;

/// One retained (date, asset) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub date: NaiveDate,
    pub asset: AssetId,
    /// One cell per output column, in declared order
    pub values: Vec<Cell>,
}

/// An output date that could not be evaluated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateGap {
    pub date: NaiveDate,
    /// Column whose fetch failed
    pub column: String,
    pub attempts: u32,
    /// Whether the last attempt hit the fetch timeout
    #[serde(default)]
    pub timed_out: bool,
    pub reason: String,
}

/// Pipeline output table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredResult")]
pub struct ExecutionResult {
    columns: Vec<String>,
    dtypes: Vec<DType>,
    rows: Vec<ResultRow>,
    gaps: Vec<DateGap>,
}

/// Serialized form of [`ExecutionResult`]; cells are written untagged, so
/// their variant is restored from the column dtype
#[derive(Deserialize)]
struct StoredResult {
    columns: Vec<String>,
    dtypes: Vec<DType>,
    rows: Vec<ResultRow>,
    #[serde(default)]
    gaps: Vec<DateGap>,
}

impl From<StoredResult> for ExecutionResult {
    fn from(stored: StoredResult) -> Self {
        let mut rows = stored.rows;
        for row in &mut rows {
            for (cell, dtype) in row.values.iter_mut().zip(&stored.dtypes) {
                *cell = cell.and_then(|v| restore_value(v, *dtype));
            }
        }
        Self {
            columns: stored.columns,
            dtypes: stored.dtypes,
            rows,
            gaps: stored.gaps,
        }
    }
}

fn restore_value(value: Value, dtype: DType) -> Cell {
    match (dtype, value) {
        (DType::Category, Value::Float(v)) => Some(Value::Category(v.round() as i64)),
        (DType::Float64, Value::Category(c)) => Some(Value::Float(c as f64)),
        (_, v) => Some(v),
    }
}

impl ExecutionResult {
    pub fn new(columns: Vec<String>, dtypes: Vec<DType>) -> Self {
        Self {
            columns,
            dtypes,
            rows: Vec::new(),
            gaps: Vec::new(),
        }
    }

    pub(crate) fn push_row(&mut self, row: ResultRow) {
        self.rows.push(row);
    }

    pub(crate) fn push_gap(&mut self, gap: DateGap) {
        self.gaps.push(gap);
    }

    /// Append a later partial result; both must come from the same pipeline
    pub(crate) fn append(&mut self, other: ExecutionResult) {
        self.rows.extend(other.rows);
        self.gaps.extend(other.gaps);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn dtypes(&self) -> &[DType] {
        &self.dtypes
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    /// Output dates that were skipped after exhausting fetch retries
    pub fn gaps(&self) -> &[DateGap] {
        &self.gaps
    }

    pub fn has_gap(&self, date: NaiveDate) -> bool {
        self.gaps.iter().any(|g| g.date == date)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn row(&self, date: NaiveDate, asset: AssetId) -> Option<&ResultRow> {
        self.rows.iter().find(|r| r.date == date && r.asset == asset)
    }

    /// Cell for (date, asset, column); `None` when the row or column is absent
    pub fn value(&self, date: NaiveDate, asset: AssetId, column: &str) -> Option<Cell> {
        let idx = self.column_index(column)?;
        self.row(date, asset).map(|r| r.values[idx])
    }

    pub fn float(&self, date: NaiveDate, asset: AssetId, column: &str) -> Option<f64> {
        self.value(date, asset, column).and_then(|c| cell_f64(&c))
    }

    /// Distinct dates with at least one row, ascending
    pub fn dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self.rows.iter().map(|r| r.date).collect();
        dates.dedup();
        dates
    }

    pub fn rows_for(&self, date: NaiveDate) -> impl Iterator<Item = &ResultRow> {
        self.rows.iter().filter(move |r| r.date == date)
    }

    pub fn assets_on(&self, date: NaiveDate) -> Vec<AssetId> {
        self.rows_for(date).map(|r| r.asset).collect()
    }

    /// Number of empty cells across all retained rows
    pub fn missing_cells(&self) -> usize {
        self.rows
            .iter()
            .map(|r| r.values.iter().filter(|c| c.is_none()).count())
            .sum()
    }

    /// Convert into a polars DataFrame with `date`, `asset` and one column per output
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let mut series = Vec::with_capacity(self.columns.len() + 2);
        series.push(Series::new(
            "date",
            self.rows
                .iter()
                .map(|r| r.date.format("%Y-%m-%d").to_string())
                .collect::<Vec<String>>(),
        ));
        series.push(Series::new(
            "asset",
            self.rows.iter().map(|r| r.asset).collect::<Vec<u64>>(),
        ));

        for (idx, (name, dtype)) in self.columns.iter().zip(&self.dtypes).enumerate() {
            let cells = self.rows.iter().map(|r| &r.values[idx]);
            let column = match dtype {
                DType::Float64 => Series::new(name, cells.map(cell_f64).collect::<Vec<Option<f64>>>()),
                DType::Bool => Series::new(name, cells.map(cell_bool).collect::<Vec<Option<bool>>>()),
                DType::Category => {
                    Series::new(name, cells.map(cell_category).collect::<Vec<Option<i64>>>())
                }
            };
            series.push(column);
        }

        Ok(DataFrame::new(series)?)
    }

    /// Write as CSV with a `date,asset,<columns...>` header; no-value is empty
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        let mut header = vec!["date".to_string(), "asset".to_string()];
        header.extend(self.columns.iter().cloned());
        csv_writer.write_record(&header)?;

        for row in &self.rows {
            let mut record = Vec::with_capacity(row.values.len() + 2);
            record.push(row.date.format("%Y-%m-%d").to_string());
            record.push(row.asset.to_string());
            record.extend(
                row.values
                    .iter()
                    .map(|c| c.map(|v| v.to_string()).unwrap_or_default()),
            );
            csv_writer.write_record(&record)?;
        }

        csv_writer.flush()?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
